use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{AccrualResult, AccrualSource, FetchError, OracleStatus};
use crate::Amount;
use crate::model::OrderNumber;

/// Used when a 429 comes without a usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct AccrualPayload {
    order: String,
    status: String,
    #[serde(default)]
    accrual: Option<f64>,
}

/// [`AccrualSource`] backed by the accrual service's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpAccrualClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAccrualClient {
    /// `address` may be `host:port`, `:port` or a full URL. Every request
    /// gives up after `timeout`.
    pub fn new(address: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: normalize_address(address),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn order_url(&self, number: &OrderNumber) -> String {
        format!("{}/api/orders/{}", self.base_url, number)
    }
}

#[async_trait]
impl AccrualSource for HttpAccrualClient {
    async fn fetch(&self, number: &OrderNumber) -> Result<AccrualResult, FetchError> {
        let response = self
            .http
            .get(self.order_url(number))
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        debug!(order = %number, status = status.as_u16(), "accrual response");

        match status {
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| FetchError::Transport(e.to_string()))?;
                decode(number, &body)
            }
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Err(FetchError::NotRegistered),
            StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited {
                retry_after: retry_after(response.headers()),
            }),
            other => Err(FetchError::Transport(format!(
                "unexpected status {}",
                other.as_u16()
            ))),
        }
    }
}

fn normalize_address(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else if let Some(port) = address.strip_prefix(':') {
        format!("http://localhost:{port}")
    } else {
        format!("http://{address}")
    }
}

fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn decode(number: &OrderNumber, body: &[u8]) -> Result<AccrualResult, FetchError> {
    let payload: AccrualPayload =
        serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;

    if payload.order != number.as_str() {
        return Err(FetchError::Decode(format!(
            "asked for order {number}, got {}",
            payload.order
        )));
    }

    let status: OracleStatus = payload.status.parse().map_err(FetchError::Decode)?;

    let accrual = match (status, payload.accrual) {
        (OracleStatus::Processed, Some(value)) => Amount::try_from_float(value)
            .filter(|amount| !amount.is_negative())
            .ok_or_else(|| FetchError::Decode(format!("invalid accrual {value}")))?,
        _ => Amount::ZERO,
    };

    Ok(AccrualResult {
        number: number.clone(),
        status,
        accrual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    const ORDER: &str = "12345678903";

    fn client(server: &MockServer) -> HttpAccrualClient {
        HttpAccrualClient::new(&server.base_url(), Duration::from_millis(500)).unwrap()
    }

    #[test]
    fn address_forms() {
        assert_eq!(normalize_address("localhost:8080"), "http://localhost:8080");
        assert_eq!(normalize_address(":8080"), "http://localhost:8080");
        assert_eq!(
            normalize_address("https://accrual.example/"),
            "https://accrual.example"
        );
        assert_eq!(normalize_address(" http://127.0.0.1:9 "), "http://127.0.0.1:9");
    }

    #[test]
    fn retry_after_defaults() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), DEFAULT_RETRY_AFTER);

        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Duration::from_secs(7));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), DEFAULT_RETRY_AFTER);
    }

    #[test]
    fn decode_processed() {
        let body = json!({ "order": ORDER, "status": "PROCESSED", "accrual": 729.98 });
        let result = decode(&OrderNumber::from(ORDER), body.to_string().as_bytes()).unwrap();
        assert_eq!(result.status, OracleStatus::Processed);
        assert_eq!(result.accrual, Amount::from_scaled(7_299_800));
    }

    #[test]
    fn decode_ignores_accrual_for_non_processed() {
        let body = json!({ "order": ORDER, "status": "INVALID", "accrual": 10 });
        let result = decode(&OrderNumber::from(ORDER), body.to_string().as_bytes()).unwrap();
        assert_eq!(result.accrual, Amount::ZERO);

        let body = json!({ "order": ORDER, "status": "REGISTERED" });
        let result = decode(&OrderNumber::from(ORDER), body.to_string().as_bytes()).unwrap();
        assert_eq!(result.status, OracleStatus::Registered);
    }

    #[test]
    fn decode_failures() {
        let number = OrderNumber::from(ORDER);
        let cases = [
            json!({ "order": ORDER, "status": "DONE" }).to_string(),
            json!({ "order": "79927398713", "status": "PROCESSED", "accrual": 1 }).to_string(),
            json!({ "order": ORDER, "status": "PROCESSED", "accrual": -1 }).to_string(),
            json!({ "order": ORDER, "status": "PROCESSED", "accrual": 1e30 }).to_string(),
            "not json".to_string(),
        ];
        for body in cases {
            assert!(
                matches!(decode(&number, body.as_bytes()), Err(FetchError::Decode(_))),
                "{body}"
            );
        }
    }

    #[tokio::test]
    async fn fetch_ok() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/api/orders/{ORDER}"));
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({ "order": ORDER, "status": "PROCESSED", "accrual": 500 }));
            })
            .await;

        let result = client(&server)
            .fetch(&OrderNumber::from(ORDER))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.status, OracleStatus::Processed);
        assert_eq!(result.accrual, Amount::from_points(500));
    }

    #[tokio::test]
    async fn fetch_not_registered() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/api/orders/{ORDER}"));
                then.status(204);
            })
            .await;

        let result = client(&server).fetch(&OrderNumber::from(ORDER)).await;
        assert_eq!(result, Err(FetchError::NotRegistered));
    }

    #[tokio::test]
    async fn fetch_rate_limited() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/api/orders/{ORDER}"));
                then.status(429)
                    .header("retry-after", "3")
                    .body("No more than N requests per minute allowed");
            })
            .await;

        let result = client(&server).fetch(&OrderNumber::from(ORDER)).await;
        assert_eq!(
            result,
            Err(FetchError::RateLimited {
                retry_after: Duration::from_secs(3)
            })
        );
    }

    #[tokio::test]
    async fn fetch_server_error_is_transport() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/api/orders/{ORDER}"));
                then.status(500);
            })
            .await;

        let result = client(&server).fetch(&OrderNumber::from(ORDER)).await;
        assert!(matches!(result, Err(FetchError::Transport(_))));
    }

    #[tokio::test]
    async fn fetch_timeout_is_transport() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/api/orders/{ORDER}"));
                then.status(200)
                    .delay(Duration::from_secs(2))
                    .json_body(json!({ "order": ORDER, "status": "PROCESSED", "accrual": 1 }));
            })
            .await;

        let result = client(&server).fetch(&OrderNumber::from(ORDER)).await;
        assert!(matches!(result, Err(FetchError::Transport(_))));
    }

    #[tokio::test]
    async fn fetch_unreachable_is_transport() {
        let client = HttpAccrualClient::new("127.0.0.1:1", Duration::from_millis(200)).unwrap();
        let result = client.fetch(&OrderNumber::from(ORDER)).await;
        assert!(matches!(result, Err(FetchError::Transport(_))));
    }
}
