//! HTTP notification action.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{redirect, StatusCode, Url};
use tracing::{debug, warn};

use super::{ActionOutcome, OutcomeKind, ScanAction};
use crate::config::{ConfigResult, ConfigurationError, NotificationConfig};
use crate::messaging::ScanEvent;

const ACTION_NAME: &str = "notification";

/// Classify an HTTP status
///
/// 2xx and 3xx succeed (redirects are not followed). 429 and 5xx are
/// transient, every other status is permanent.
pub fn classify_status(status: StatusCode) -> OutcomeKind {
    if status.is_success() || status.is_redirection() {
        OutcomeKind::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        OutcomeKind::TransientFailure
    } else if status.is_client_error() {
        OutcomeKind::PermanentFailure
    } else {
        // 1xx as a final status means the exchange did not complete
        OutcomeKind::TransientFailure
    }
}

/// Sends `GET <base_url>?<query_param>=<area>,<station>`
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: Url,
    query_param: String,
    timeout: Duration,
}

impl HttpNotifier {
    pub fn from_config(config: &NotificationConfig) -> ConfigResult<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            ConfigurationError::invalid_value(
                "notification.base_url",
                &config.base_url,
                e.to_string(),
            )
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| {
                ConfigurationError::validation_error(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            query_param: config.query_param.clone(),
            timeout: config.timeout(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl ScanAction for HttpNotifier {
    fn name(&self) -> &'static str {
        ACTION_NAME
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, event: &ScanEvent) -> ActionOutcome {
        let response = self
            .client
            .get(self.base_url.clone())
            .query(&[(self.query_param.as_str(), event.canonical())])
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let detail = format!("HTTP {}", status.as_u16());
                match classify_status(status) {
                    OutcomeKind::Success => {
                        debug!(event = %event, status = status.as_u16(), "Notification delivered");
                        ActionOutcome::success(ACTION_NAME, detail)
                    }
                    OutcomeKind::TransientFailure => {
                        warn!(
                            event = %event,
                            status = status.as_u16(),
                            "Notification rejected, will retry"
                        );
                        ActionOutcome::transient(ACTION_NAME, detail)
                    }
                    OutcomeKind::PermanentFailure => {
                        warn!(
                            event = %event,
                            status = status.as_u16(),
                            "Notification rejected permanently"
                        );
                        ActionOutcome::permanent(ACTION_NAME, detail)
                    }
                }
            }
            Err(e) => {
                warn!(event = %event, error = %e, "Notification request failed");
                let detail = if e.is_timeout() {
                    format!("request timed out after {}ms", self.timeout.as_millis())
                } else {
                    format!("request failed: {}", e)
                };
                ActionOutcome::transient(ACTION_NAME, detail)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let cases = [
            (200, OutcomeKind::Success),
            (204, OutcomeKind::Success),
            (301, OutcomeKind::Success),
            (304, OutcomeKind::Success),
            (400, OutcomeKind::PermanentFailure),
            (404, OutcomeKind::PermanentFailure),
            (422, OutcomeKind::PermanentFailure),
            (429, OutcomeKind::TransientFailure),
            (500, OutcomeKind::TransientFailure),
            (503, OutcomeKind::TransientFailure),
        ];
        for (code, expected) in cases {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), expected, "HTTP {code}");
        }
    }

    #[test]
    fn test_from_config_rejects_bad_url() {
        let config = NotificationConfig {
            base_url: "::not a url".to_string(),
            ..Default::default()
        };
        assert!(HttpNotifier::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let notifier = HttpNotifier::from_config(&NotificationConfig {
            base_url: format!("http://127.0.0.1:{port}/"),
            ..Default::default()
        })
        .unwrap();

        let outcome = notifier.run(&ScanEvent::new("OP7", "S500").unwrap()).await;
        assert_eq!(outcome.kind, OutcomeKind::TransientFailure);
        assert_eq!(outcome.action, "notification");
    }
}
