//! Severity-routed notification delivery.
//!
//! An event goes to every enabled rule whose minimum severity it meets. Each
//! channel gets one retry after a backoff; failures are logged and recorded,
//! never returned to the caller.

use crate::error::{HubError, Result};
use crate::inbox::Inbox;
use crate::models::{ChannelKind, NotificationEvent, NotificationRule, Severity};
use crate::store::HubStore;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const MAX_ATTEMPTS: u32 = 2;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of delivering one event to one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub channel: ChannelKind,
    pub severity: Severity,
    pub job_id: Option<String>,
    pub success: bool,
    pub attempts: u32,
    pub message: Option<String>,
}

#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;
    async fn deliver(&self, event: &NotificationEvent) -> Result<()>;
}

/// Plain-text rendering shared by the chat and mail channels.
pub fn render_text(event: &NotificationEvent) -> String {
    let severity = match event.severity {
        Severity::Info => "INFO",
        Severity::Warning => "WARNING",
        Severity::Critical => "CRITICAL",
    };
    let mut lines = vec![format!("[{}] {}", severity, event.title)];
    if let Some(c) = &event.counts {
        lines.push(format!(
            "extracted={} valid={} invalid={} loaded={} skipped={} conflicts={}",
            c.extracted, c.valid_records, c.invalid_records, c.loaded, c.skipped, c.conflicts
        ));
    }
    if let Some(s) = &event.conflict_summary {
        lines.push(format!(
            "conflicts: source-wins={} target-wins={} flagged={}",
            s.source_wins, s.target_wins, s.flagged
        ));
    }
    for e in &event.errors {
        lines.push(format!("error: {}", e));
    }
    lines.join("\n")
}

async fn post_json<T: Serialize + ?Sized>(
    client: &Client,
    kind: ChannelKind,
    url: &str,
    body: &T,
) -> Result<()> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| HubError::Notification {
            channel: kind.as_str().to_string(),
            message: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(HubError::Notification {
            channel: kind.as_str().to_string(),
            message: format!("HTTP {}: {}", status, text),
        });
    }
    Ok(())
}

pub struct ChatWebhookChannel {
    client: Client,
    url: String,
}

#[derive(Serialize)]
struct ChatWebhookBody<'a> {
    text: String,
    event: &'a NotificationEvent,
}

#[async_trait::async_trait]
impl Channel for ChatWebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::ChatWebhook
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        let body = ChatWebhookBody {
            text: render_text(event),
            event,
        };
        post_json(&self.client, self.kind(), &self.url, &body).await
    }
}

/// Mail goes through an HTTP mail relay.
pub struct MailRelayChannel {
    client: Client,
    endpoint: String,
    recipients: Vec<String>,
}

#[derive(Serialize)]
struct MailRelayBody<'a> {
    to: &'a [String],
    subject: &'a str,
    body: String,
}

#[async_trait::async_trait]
impl Channel for MailRelayChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Mail
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        if self.recipients.is_empty() {
            return Err(HubError::Notification {
                channel: self.kind().as_str().to_string(),
                message: "no recipients configured".into(),
            });
        }
        let body = MailRelayBody {
            to: &self.recipients,
            subject: &event.title,
            body: render_text(event),
        };
        post_json(&self.client, self.kind(), &self.endpoint, &body).await
    }
}

pub struct InAppChannel {
    inbox: Inbox,
}

#[async_trait::async_trait]
impl Channel for InAppChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::InApp
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        self.inbox.push(event.clone());
        Ok(())
    }
}

struct Route {
    min_severity: Severity,
    channel: Arc<dyn Channel>,
}

pub struct NotificationRouter {
    routes: Vec<Route>,
    store: HubStore,
    backoff: Duration,
}

impl NotificationRouter {
    /// Build channels for the enabled rules. Rules missing an endpoint are skipped.
    pub fn from_rules(rules: &[NotificationRule], inbox: Inbox, store: HubStore, backoff: Duration) -> Self {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();

        let mut routes = Vec::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            let channel: Arc<dyn Channel> = match (rule.channel, rule.endpoint.as_deref()) {
                (ChannelKind::InApp, _) => Arc::new(InAppChannel {
                    inbox: inbox.clone(),
                }),
                (ChannelKind::ChatWebhook, Some(url)) => Arc::new(ChatWebhookChannel {
                    client: client.clone(),
                    url: url.to_string(),
                }),
                (ChannelKind::Mail, Some(endpoint)) => Arc::new(MailRelayChannel {
                    client: client.clone(),
                    endpoint: endpoint.to_string(),
                    recipients: rule.recipients.clone(),
                }),
                (kind, None) => {
                    warn!("Skipping {} notification rule without endpoint", kind.as_str());
                    continue;
                }
            };
            routes.push(Route {
                min_severity: rule.min_severity,
                channel,
            });
        }
        info!("Notification router ready with {} channel(s)", routes.len());
        Self { routes, store, backoff }
    }

    #[cfg(test)]
    pub fn with_channels(channels: Vec<(Severity, Arc<dyn Channel>)>, store: HubStore, backoff: Duration) -> Self {
        let routes = channels
            .into_iter()
            .map(|(min_severity, channel)| Route { min_severity, channel })
            .collect();
        Self { routes, store, backoff }
    }

    /// Deliver to every matching channel concurrently and record each outcome.
    pub async fn notify(&self, event: &NotificationEvent) -> Vec<DeliveryRecord> {
        let mut tasks = JoinSet::new();
        for route in self.routes.iter().filter(|r| r.min_severity <= event.severity) {
            let channel = route.channel.clone();
            let event = event.clone();
            let backoff = self.backoff;
            tasks.spawn(async move { deliver_with_retry(channel, &event, backoff).await });
        }

        let mut records = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(record) => records.push(record),
                Err(e) => error!("Notification task panicked: {}", e),
            }
        }

        for record in &records {
            if let Err(e) = self.store.log_notification(record).await {
                warn!("Failed to log notification outcome: {}", e);
            }
        }
        debug!(
            "Notified {} channel(s) for '{}' ({} failed)",
            records.len(),
            event.title,
            records.iter().filter(|r| !r.success).count()
        );
        records
    }
}

async fn deliver_with_retry(
    channel: Arc<dyn Channel>,
    event: &NotificationEvent,
    backoff: Duration,
) -> DeliveryRecord {
    let kind = channel.kind();
    let mut attempts = 0;
    let mut last_error = None;
    while attempts < MAX_ATTEMPTS {
        attempts += 1;
        match channel.deliver(event).await {
            Ok(()) => {
                last_error = None;
                break;
            }
            Err(e) => {
                if attempts < MAX_ATTEMPTS {
                    warn!(
                        "Delivery to {} failed. Retrying in {:?}: {}",
                        kind.as_str(),
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                } else {
                    error!("Delivery to {} failed after {} attempts: {}", kind.as_str(), attempts, e);
                }
                last_error = Some(e.to_string());
            }
        }
    }

    DeliveryRecord {
        channel: kind,
        severity: event.severity,
        job_id: event.job_id.clone(),
        success: last_error.is_none(),
        attempts,
        message: last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(severity: Severity) -> NotificationEvent {
        NotificationEvent {
            severity,
            title: "full-sync job job_1 failed".into(),
            job_id: Some("job_1".into()),
            counts: None,
            conflict_summary: None,
            errors: vec!["connection refused".into()],
            created_at: Utc::now(),
        }
    }

    fn rule(channel: ChannelKind, min: Severity, endpoint: Option<String>) -> NotificationRule {
        NotificationRule {
            channel,
            min_severity: min,
            enabled: true,
            endpoint,
            recipients: vec!["assessor@county.gov".into()],
        }
    }

    #[tokio::test]
    async fn test_one_failing_channel_does_not_block_other() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mail"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let store = HubStore::open_in_memory().unwrap();
        let rules = vec![
            rule(ChannelKind::ChatWebhook, Severity::Warning, Some(format!("{}/hook", server.uri()))),
            rule(ChannelKind::Mail, Severity::Critical, Some(format!("{}/mail", server.uri()))),
        ];
        let router = NotificationRouter::from_rules(&rules, Inbox::new(), store.clone(), Duration::from_millis(5));

        let records = router.notify(&event(Severity::Critical)).await;
        assert_eq!(records.len(), 2);
        let hook = records.iter().find(|r| r.channel == ChannelKind::ChatWebhook).unwrap();
        let mail = records.iter().find(|r| r.channel == ChannelKind::Mail).unwrap();
        assert!(hook.success);
        assert_eq!(hook.attempts, 1);
        assert!(!mail.success);
        assert_eq!(mail.attempts, 2);
        assert_eq!(store.notification_outcomes().await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_severity_threshold_and_disabled_rules() {
        let inbox = Inbox::new();
        let mut disabled = rule(ChannelKind::InApp, Severity::Info, None);
        disabled.enabled = false;
        let rules = vec![rule(ChannelKind::InApp, Severity::Warning, None), disabled];
        let router = NotificationRouter::from_rules(
            &rules,
            inbox.clone(),
            HubStore::open_in_memory().unwrap(),
            Duration::from_millis(1),
        );

        assert!(router.notify(&event(Severity::Info)).await.is_empty());
        assert!(inbox.is_empty());

        let records = router.notify(&event(Severity::Warning)).await;
        assert_eq!(records.len(), 1);
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn test_rule_without_endpoint_is_skipped() {
        let rules = vec![rule(ChannelKind::ChatWebhook, Severity::Info, None)];
        let router = NotificationRouter::from_rules(
            &rules,
            Inbox::new(),
            HubStore::open_in_memory().unwrap(),
            Duration::from_millis(1),
        );
        assert!(router.routes.is_empty());
    }

    #[test]
    fn test_render_text_includes_errors() {
        let text = render_text(&event(Severity::Critical));
        assert!(text.starts_with("[CRITICAL]"));
        assert!(text.contains("error: connection refused"));
    }
}
