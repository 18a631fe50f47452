// Notification dispatch
// Fire-and-forget webhook and mail-relay POSTs. Dispatch failures are
// logged, never raised; delivery guarantees belong to the transports.

use tracing::{debug, warn};

use crate::config::{EmailSettings, MonitorSettings};
use crate::monitor::alerts::Alert;

#[derive(Clone)]
pub(crate) struct AlertNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
    email: Option<EmailSettings>,
    service_name: String,
    environment: String,
}

impl AlertNotifier {
    pub fn new(settings: &MonitorSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: settings.webhook_url.clone(),
            email: settings.email.clone(),
            service_name: settings.service_name.clone(),
            environment: settings.environment.clone(),
        }
    }

    pub async fn dispatch(&self, alert: &Alert) {
        if let Some(url) = &self.webhook_url {
            let payload = serde_json::json!({
                "alert": alert,
                "service": self.service_name,
                "environment": self.environment,
            });
            match self
                .client
                .post(url)
                .json(&payload)
                .send()
                .await
                .and_then(|response| response.error_for_status())
            {
                Ok(_) => debug!(alert_id = %alert.id, "alert webhook delivered"),
                Err(err) => warn!(error = %err, alert_id = %alert.id, "alert webhook dispatch failed"),
            }
        }

        if let Some(email) = &self.email {
            let payload = serde_json::json!({
                "to": email.recipients,
                "subject": self.subject(alert),
                "body": self.body(alert),
            });
            match self
                .client
                .post(&email.relay_url)
                .json(&payload)
                .send()
                .await
                .and_then(|response| response.error_for_status())
            {
                Ok(_) => debug!(alert_id = %alert.id, "alert email handed to relay"),
                Err(err) => warn!(error = %err, alert_id = %alert.id, "alert email dispatch failed"),
            }
        }
    }

    fn subject(&self, alert: &Alert) -> String {
        format!(
            "[{}] {} database alert: {}",
            self.service_name, alert.level, alert.kind
        )
    }

    fn body(&self, alert: &Alert) -> String {
        format!(
            "{}\n\nLevel: {}\nType: {}\nTime: {}\nService: {}\nEnvironment: {}\nAlert id: {}\n",
            alert.message,
            alert.level,
            alert.kind,
            alert.timestamp.to_rfc3339(),
            self.service_name,
            self.environment,
            alert.id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::alerts::{AlertKind, AlertLevel};

    fn notifier() -> AlertNotifier {
        let mut settings = MonitorSettings::default();
        settings.service_name = "dispatch-api".to_string();
        settings.environment = "staging".to_string();
        AlertNotifier::new(&settings)
    }

    #[test]
    fn test_subject_and_body_composition() {
        let alert = Alert::new(
            AlertLevel::Critical,
            AlertKind::FailedLogins,
            "14 failed logins in the last hour".to_string(),
        );
        let notifier = notifier();
        assert_eq!(
            notifier.subject(&alert),
            "[dispatch-api] critical database alert: failed_logins"
        );
        let body = notifier.body(&alert);
        assert!(body.starts_with("14 failed logins in the last hour"));
        assert!(body.contains("Environment: staging"));
        assert!(body.contains(&alert.id));
    }

    #[tokio::test]
    async fn test_dispatch_without_targets_is_a_no_op() {
        let alert = Alert::new(AlertLevel::Warning, AlertKind::SlowQueries, "x".to_string());
        // No webhook or relay configured: nothing to send, nothing to fail
        notifier().dispatch(&alert).await;
    }
}
