//! Payment service client: refunds and authorization voids.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{check_status, http_client, transport_err, ServiceError};
use crate::config::ServiceClientOptions;

const SERVICE: &str = "payment-service";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRefundRequest {
    pub payment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Full refund when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    pub currency: String,
    pub reason: String,
    pub requested_by: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRefundResponse {
    #[serde(default)]
    pub refund_id: Option<String>,
    pub payment_id: String,
    pub status: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub processed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentVoidRequest {
    pub payment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_id: Option<String>,
    pub reason: String,
    pub requested_by: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentVoidResponse {
    pub payment_id: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub voided_at: Option<String>,
}

pub struct PaymentServiceClient {
    client: reqwest::Client,
    base_url: String,
}

impl PaymentServiceClient {
    pub fn new(options: ServiceClientOptions) -> Self {
        Self {
            client: http_client(options.timeout),
            base_url: options.base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn refund_payment(
        &self,
        request: &PaymentRefundRequest,
    ) -> Result<PaymentRefundResponse, ServiceError> {
        info!(payment_id = %request.payment_id, amount = ?request.amount, "calling payment service to refund");

        let url = format!("{}/api/v1/payments/{}/refund", self.base_url, request.payment_id);
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

    pub async fn void_payment(
        &self,
        request: &PaymentVoidRequest,
    ) -> Result<PaymentVoidResponse, ServiceError> {
        info!(payment_id = %request.payment_id, "calling payment service to void authorization");

        let url = format!("{}/api/v1/payments/{}/void", self.base_url, request.payment_id);
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
