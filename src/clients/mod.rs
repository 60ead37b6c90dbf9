//! Outbound HTTP clients for the services that handlers call.
//!
//! From the engine's perspective these are opaque functions with one error
//! taxonomy: a [`ServiceError`] either carries the remote HTTP status (the
//! handler maps it to a permanent or retryable failure) or it doesn't
//! (transport problems — always retryable).

use std::time::Duration;

pub mod order;
pub mod payment;

pub use order::{OrderCancelRequest, OrderCancelResponse, OrderServiceClient};
pub use payment::{
    PaymentRefundRequest, PaymentRefundResponse, PaymentServiceClient, PaymentVoidRequest,
    PaymentVoidResponse,
};

/// Failure talking to an external service.
#[derive(Debug, Clone)]
pub struct ServiceError {
    /// Which service failed (for logs and alerting).
    pub service: String,
    pub message: String,
    /// Remote HTTP status, when the service answered at all.
    pub http_status: Option<u16>,
    /// Response body of a non-2xx answer, for diagnostics.
    pub response_body: Option<String>,
}

impl ServiceError {
    /// Remote answered with a non-success status.
    pub fn http(service: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        let service = service.into();
        Self {
            message: format!("{service} returned HTTP {status}"),
            service,
            http_status: Some(status),
            response_body: Some(body.into()),
        }
    }

    /// Connection-level failure: no status, nothing reached the service.
    pub fn transport(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            message: message.into(),
            http_status: None,
            response_body: None,
        }
    }

    /// The response arrived but could not be decoded.
    pub fn decode(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            message: message.into(),
            http_status: None,
            response_body: None,
        }
    }

    pub fn response_body(&self) -> &str {
        self.response_body.as_deref().unwrap_or("")
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.http_status {
            Some(status) => write!(f, "{} (HTTP {status}): {}", self.service, self.message),
            None => write!(f, "{}: {}", self.service, self.message),
        }
    }
}

impl std::error::Error for ServiceError {}

/// Build the shared reqwest client with the configured request timeout.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Turn a reqwest error into the taxonomy above.
pub(crate) fn transport_err(service: &str, e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::transport(service, format!("request timed out: {e}"))
    } else {
        ServiceError::transport(service, e.to_string())
    }
}

/// Check the response status; non-2xx becomes a [`ServiceError::http`]
/// carrying the body.
pub(crate) async fn check_status(
    service: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ServiceError::http(service, status.as_u16(), body))
}
