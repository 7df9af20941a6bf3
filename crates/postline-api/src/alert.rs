//! Operator alerting for sustained webhook processing failures.
//!
//! [`FailureTracker`] counts consecutive processing failures across
//! requests. When the count reaches its threshold the ingestor sends one
//! alert through an [`OperatorAlerter`] and the count starts over.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info};

/// Alert delivery failures.
#[derive(Debug, Error)]
pub enum AlertError {
    /// The alert channel could not be reached.
    #[error("alert delivery failed: {0}")]
    Delivery(String),
    /// The alert channel answered with a non-success status.
    #[error("alert channel rejected alert with status {status}")]
    Rejected {
        /// HTTP status returned by the channel.
        status: u16,
    },
}

/// Channel for alerts that need an operator.
#[async_trait]
pub trait OperatorAlerter: Send + Sync {
    /// Sends one alert.
    async fn send_operator_alert(&self, subject: &str, body: &str) -> Result<(), AlertError>;
}

/// Writes alerts to the log at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlerter;

#[async_trait]
impl OperatorAlerter for LogAlerter {
    async fn send_operator_alert(&self, subject: &str, body: &str) -> Result<(), AlertError> {
        error!(alert.subject = subject, alert.body = body, "operator alert");
        Ok(())
    }
}

/// Posts alerts as JSON to an operator webhook.
#[derive(Debug, Clone)]
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    /// Creates an alerter posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Delivery`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Delivery(e.to_string()))?;
        let url = url.into();
        info!(url = %url, "webhook alerter initialized");
        Ok(Self { client, url })
    }
}

#[async_trait]
impl OperatorAlerter for WebhookAlerter {
    async fn send_operator_alert(&self, subject: &str, body: &str) -> Result<(), AlertError> {
        let payload = json!({
            "subject": subject,
            "body": body,
            "source": "postline",
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AlertError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AlertError::Rejected { status: response.status().as_u16() });
        }

        debug!("operator alert delivered");
        Ok(())
    }
}

/// An alert captured by [`RecordingAlerter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAlert {
    /// Alert subject.
    pub subject: String,
    /// Alert body.
    pub body: String,
}

/// Keeps alerts in memory for assertions.
#[derive(Debug, Default)]
pub struct RecordingAlerter {
    alerts: Mutex<Vec<RecordedAlert>>,
}

impl RecordingAlerter {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts sent so far, oldest first.
    pub fn alerts(&self) -> Vec<RecordedAlert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl OperatorAlerter for RecordingAlerter {
    async fn send_operator_alert(&self, subject: &str, body: &str) -> Result<(), AlertError> {
        self.alerts
            .lock()
            .push(RecordedAlert { subject: subject.to_string(), body: body.to_string() });
        Ok(())
    }
}

/// Consecutive processing failure counter.
#[derive(Debug)]
pub struct FailureTracker {
    consecutive: Mutex<u32>,
    threshold: u32,
}

impl FailureTracker {
    /// Creates a tracker that trips after `threshold` consecutive failures.
    pub fn new(threshold: u32) -> Self {
        Self { consecutive: Mutex::new(0), threshold: threshold.max(1) }
    }

    /// Failures needed to trip.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Current consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        *self.consecutive.lock()
    }

    /// Counts a failure. Returns the count reached if this failure tripped
    /// the threshold, resetting the counter.
    pub fn record_failure(&self) -> Option<u32> {
        let mut consecutive = self.consecutive.lock();
        *consecutive += 1;
        if *consecutive >= self.threshold {
            let reached = *consecutive;
            *consecutive = 0;
            Some(reached)
        } else {
            None
        }
    }

    /// Clears the count after a successful event.
    pub fn record_success(&self) {
        *self.consecutive.lock() = 0;
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    #[test]
    fn tracker_trips_once_per_threshold() {
        let tracker = FailureTracker::new(3);

        assert_eq!(tracker.record_failure(), None);
        assert_eq!(tracker.record_failure(), None);
        assert_eq!(tracker.record_failure(), Some(3));
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.record_failure(), None);
    }

    #[test]
    fn success_resets_the_count() {
        let tracker = FailureTracker::new(2);

        tracker.record_failure();
        tracker.record_success();

        assert_eq!(tracker.record_failure(), None);
        assert_eq!(tracker.consecutive_failures(), 1);
    }

    #[test]
    fn zero_threshold_is_treated_as_one() {
        let tracker = FailureTracker::new(0);
        assert_eq!(tracker.threshold(), 1);
        assert_eq!(tracker.record_failure(), Some(1));
    }

    #[tokio::test]
    async fn recording_alerter_keeps_alerts() {
        let alerter = RecordingAlerter::new();

        alerter.send_operator_alert("subject", "body").await.unwrap();

        assert_eq!(alerter.alerts(), vec![RecordedAlert {
            subject: "subject".into(),
            body: "body".into()
        }]);
    }

    #[tokio::test]
    async fn webhook_alerter_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alerts"))
            .and(body_partial_json(json!({ "subject": "failures", "source": "postline" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let alerter =
            WebhookAlerter::new(format!("{}/alerts", server.uri()), Duration::from_secs(5))
                .unwrap();

        alerter.send_operator_alert("failures", "5 in a row").await.unwrap();
    }

    #[tokio::test]
    async fn webhook_alerter_reports_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let alerter = WebhookAlerter::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = alerter.send_operator_alert("failures", "body").await.unwrap_err();

        assert!(matches!(err, AlertError::Rejected { status: 500 }));
    }
}
