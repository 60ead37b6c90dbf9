//! Order service client.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{check_status, http_client, transport_err, ServiceError};
use crate::config::ServiceClientOptions;

const SERVICE: &str = "order-service";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelRequest {
    pub order_id: String,
    pub reason: String,
    pub cancelled_by: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelResponse {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub cancelled_at: Option<String>,
}

pub struct OrderServiceClient {
    client: reqwest::Client,
    base_url: String,
}

impl OrderServiceClient {
    pub fn new(options: ServiceClientOptions) -> Self {
        Self {
            client: http_client(options.timeout),
            base_url: options.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Cancel an order. Non-2xx answers surface as [`ServiceError`] with
    /// the remote status attached.
    pub async fn cancel_order(
        &self,
        request: &OrderCancelRequest,
    ) -> Result<OrderCancelResponse, ServiceError> {
        info!(order_id = %request.order_id, "calling order service to cancel order");

        let url = format!("{}/api/v1/orders/{}/cancel", self.base_url, request.order_id);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_err(SERVICE, e))?;
        let response = check_status(SERVICE, response).await?;
        response
            .json()
            .await
            .map_err(|e| ServiceError::decode(SERVICE, e.to_string()))
    }
}
