//! Notification sinks shipped with the daemon.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::info;

use cbugg_core::{NotificationSink, Result, Template};

use crate::config::NotifyConfig;
use crate::templates::{render, Envelope};

/// Stand-in recipient used when rendering a message that is only logged.
const PLACEHOLDER_RECIPIENT: &str = "someone@example.com";

/// Sink that renders every message and writes it to the log instead of
/// mailing it. Used when no mail transport is configured.
#[derive(Debug, Clone)]
pub struct LogSink {
    base_url: String,
    mail_from: String,
}

impl LogSink {
    pub fn new(config: &NotifyConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            mail_from: config.mail_from.clone(),
        }
    }

    pub fn render(&self, template: Template, context: &JsonValue) -> String {
        let envelope = Envelope {
            mail_from: &self.mail_from,
            mail_to: PLACEHOLDER_RECIPIENT,
            base_url: &self.base_url,
        };
        render(template, &envelope, context)
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(
        &self,
        template: Template,
        recipients: Vec<String>,
        context: JsonValue,
    ) -> Result<()> {
        let body = self.render(template, &context);
        info!(
            template = %template,
            recipients = ?recipients,
            "Mail not configured, would have sent:\n{body}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_log_sink_renders_with_placeholder_recipient() {
        let sink = LogSink::new(&NotifyConfig::default().with_mail_from("cbugg@example.com"));
        let ctx = json!({"bug": {"id": "bug-1", "title": "flaky test"}});

        let body = sink.render(Template::Assigned, &ctx);
        assert!(body.contains("To: someone@example.com"));
        assert!(body.contains("From: CBugg <cbugg@example.com>"));

        sink.send(Template::Assigned, vec!["dev@example.com".into()], ctx)
            .await
            .unwrap();
    }

    #[test]
    fn test_log_sink_links_to_configured_site() {
        let sink = LogSink::new(&NotifyConfig::default().with_base_url("https://bugs.example.org"));
        let ctx = json!({"bug": {"id": "bug-7", "title": "slow rebalance"}});

        let body = sink.render(Template::Assigned, &ctx);
        assert!(body.contains("https://bugs.example.org/bug/bug-7"));
    }
}
