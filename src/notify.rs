//! Webhook notifications for critical events (Slack, Discord, generic HTTP).
//!
//! Sends are fire-and-forget background tasks; failures are logged and never
//! propagated. Identical (event, details) pairs within a short window are
//! deduplicated.

use crate::config::{NotificationsConfig, WebhookConfig};
use crate::state::now_ts;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEDUP_WINDOW: Duration = Duration::from_secs(60);
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct NotificationManager {
    config: NotificationsConfig,
    recent: Mutex<HashMap<String, Instant>>,
}

impl NotificationManager {
    pub fn new(config: NotificationsConfig) -> Self {
        Self {
            config,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Send a notification for the given event to all configured webhooks.
    /// Never blocks the caller and never fails.
    pub fn notify(&self, event: &str, details: Map<String, Value>) {
        if !self.should_send(event, &details) {
            return;
        }
        for webhook in &self.config.webhooks {
            if webhook.url.is_empty() {
                continue;
            }
            let webhook = webhook.clone();
            let event = event.to_string();
            let details = details.clone();
            tokio::spawn(async move {
                send_webhook(&webhook, &event, &details).await;
            });
        }
    }

    /// Gate on the enabled flag, per-event flags, and the dedup window.
    fn should_send(&self, event: &str, details: &Map<String, Value>) -> bool {
        if !self.config.enabled || self.config.webhooks.is_empty() {
            return false;
        }
        if !self.event_enabled(event) {
            return false;
        }

        let dedup_key = format!(
            "{}:{}",
            event,
            serde_json::to_string(details).unwrap_or_default()
        );
        let now = Instant::now();
        let Ok(mut recent) = self.recent.lock() else {
            return true;
        };
        if let Some(last) = recent.get(&dedup_key)
            && now.duration_since(*last) < DEDUP_WINDOW
        {
            debug!("Rate-limited notification for event={}", event);
            return false;
        }
        recent.insert(dedup_key, now);
        recent.retain(|_, sent| now.duration_since(*sent) < DEDUP_WINDOW * 2);
        true
    }

    fn event_enabled(&self, event: &str) -> bool {
        let events = &self.config.events;
        match event {
            "cycle_success" => events.on_cycle_success,
            "cycle_failure" => events.on_cycle_failure,
            "consecutive_failure_threshold" => events.on_consecutive_failure_threshold,
            "cost_limit_exceeded" => events.on_cost_limit_exceeded,
            "safety_error" => events.on_safety_error,
            _ => true,
        }
    }
}

async fn send_webhook(webhook: &WebhookConfig, event: &str, details: &Map<String, Value>) {
    let payload = match webhook.r#type.as_str() {
        "slack" => format_slack_payload(event, details),
        "discord" => format_discord_payload(event, details),
        _ => format_generic_payload(event, details),
    };

    let label = if webhook.name.is_empty() {
        webhook.url.chars().take(40).collect::<String>()
    } else {
        webhook.name.clone()
    };

    let client = reqwest::Client::new();
    let result = client
        .post(&webhook.url)
        .timeout(SEND_TIMEOUT)
        .json(&payload)
        .send()
        .await;
    match result {
        Ok(resp) => debug!(
            "Notification sent: event={} webhook={} status={}",
            event,
            label,
            resp.status()
        ),
        Err(e) => warn!("Failed to send notification to {}: {}", label, e),
    }
}

fn title_case(event: &str) -> String {
    event
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render a detail value; lists are comma-joined (lossy by design).
fn detail_text(value: &Value) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(detail_text)
            .collect::<Vec<_>>()
            .join(", "),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn detail_lines(details: &Map<String, Value>) -> Vec<String> {
    details
        .iter()
        .map(|(key, value)| format!("• {}: {}", key, detail_text(value)))
        .collect()
}

fn format_slack_payload(event: &str, details: &Map<String, Value>) -> Value {
    let mut lines = vec![format!("*Auto Claude Code: {}*", title_case(event))];
    lines.extend(detail_lines(details));
    json!({ "text": lines.join("\n") })
}

fn format_discord_payload(event: &str, details: &Map<String, Value>) -> Value {
    let mut lines = vec![format!("**Auto Claude Code: {}**", title_case(event))];
    lines.extend(detail_lines(details));
    json!({ "content": lines.join("\n") })
}

fn format_generic_payload(event: &str, details: &Map<String, Value>) -> Value {
    json!({
        "event": event,
        "source": "auto_claude_code",
        "details": details,
        "timestamp": now_ts(),
    })
}

/// Convenience for call sites building details inline.
pub fn details(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}
