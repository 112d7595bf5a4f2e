//! Incoming-signal intake, outbound send, Webhook forwarder, and the
//! bus-reconnect maintenance loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use zbus::zvariant::OwnedValue;

use crate::bus::{BusClient, NameOwnerEvent};
use crate::domain_types::{MaxInbox, MaxSent, SMS_WEBHOOK_LOG_CAPACITY, SentSmsStatus};
use crate::error::AppError;
use crate::modem::Modem;
use crate::store::{SqlParam, Store};
use crate::templating;

const SEND_TIMEOUT: Duration = Duration::from_secs(15);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
const CNMI_ENABLE: &str = "AT+CNMI=3,2,0,1,0";
const CNMI_DISABLE: &str = "AT+CNMI=3,1,0,1,0";

const FAILURE_MARKERS: [&str; 4] = [
    "curl:",
    "Could not resolve",
    "Connection refused",
    "Connection timed out",
];

/// One persisted inbound message.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InboxMessage {
    /// `id`.
    pub id: i64,
    /// `sender`.
    pub sender: String,
    /// `content`.
    pub content: String,
    /// `timestamp`.
    pub timestamp: i64,
    /// `is_read`.
    pub is_read: bool,
}

fn row_to_inbox_message(row: Vec<String>) -> Option<InboxMessage> {
    Some(InboxMessage {
        id: row.first()?.parse().ok()?,
        sender: row.get(1)?.clone(),
        content: row.get(2)?.clone(),
        timestamp: row.get(3)?.parse().ok()?,
        is_read: row.get(4)? == "1",
    })
}

/// Public webhook config view, as exposed over the HTTP surface.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct WebhookConfigView {
    /// `enabled`.
    pub enabled: bool,
    /// `platform`.
    pub platform: String,
    /// `url`.
    pub url: String,
    /// `body_template`.
    pub body_template: String,
    /// `headers`.
    pub headers: String,
}

/// Inbox/outbox caps and the `CNMI` fix toggle.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SmsConfigView {
    /// `max_inbox`.
    pub max_inbox: u32,
    /// `max_sent`.
    pub max_sent: u32,
    /// `fix_enabled`.
    pub fix_enabled: bool,
}

impl Default for SmsConfigView {
    fn default() -> Self {
        Self {
            max_inbox: MaxInbox::default().into_inner(),
            max_sent: MaxSent::default().into_inner(),
            fix_enabled: false,
        }
    }
}

/// One delivered or failed webhook attempt, kept in a bounded in-memory
/// ring for UI display.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookLogEntry {
    /// `sender`.
    pub sender: String,
    /// `request`.
    pub request: String,
    /// `response`.
    pub response: String,
    /// `result`.
    pub result: bool,
    /// `created_at`.
    pub created_at: i64,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Incoming-SMS intake, outbox, webhook dispatch, and reconnect loop.
pub struct SmsEngine {
    bus: BusClient,
    modem_path: Mutex<String>,
    store: Store,
    modem: Arc<Modem>,
    http: reqwest::Client,
    webhook_log: Mutex<VecDeque<WebhookLogEntry>>,
}

impl SmsEngine {
    #[must_use]
    /// `new`.
    pub fn new(bus: BusClient, modem_path: impl Into<String>, store: Store, modem: Arc<Modem>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            bus,
            modem_path: Mutex::new(modem_path.into()),
            store,
            modem,
            http,
            webhook_log: Mutex::new(VecDeque::with_capacity(SMS_WEBHOOK_LOG_CAPACITY)),
        }
    }

    async fn max_inbox(&self) -> MaxInbox {
        self.store
            .query_scalar_int("SELECT max_inbox FROM sms_config WHERE id = 1", &[])
            .await
            .ok()
            .and_then(|v| u32::try_from(v).ok())
            .and_then(|v| MaxInbox::try_new(v).ok())
            .unwrap_or_default()
    }

    async fn max_sent(&self) -> MaxSent {
        self.store
            .query_scalar_int("SELECT max_sent FROM sms_config WHERE id = 1", &[])
            .await
            .ok()
            .and_then(|v| u32::try_from(v).ok())
            .and_then(|v| MaxSent::try_new(v).ok())
            .unwrap_or_default()
    }

    /// Persist an incoming message and evict down to `maxInbox`,
    /// dispatching a webhook if configured. Returns the inserted row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    #[instrument(skip(self, content))]
    pub async fn handle_incoming(self: &Arc<Self>, sender: &str, content: &str) -> Result<i64, AppError> {
        let timestamp = now_unix();
        let id = self
            .store
            .exec_insert(
                "INSERT INTO sms_messages (sender, content, timestamp, is_read) VALUES (?, ?, ?, 0)",
                &[
                    SqlParam::from(sender),
                    SqlParam::from(content),
                    SqlParam::from(timestamp),
                ],
            )
            .await?;

        let cap = self.max_inbox().await.as_i64();
        self.store
            .exec(
                "DELETE FROM sms_messages WHERE id NOT IN (SELECT id FROM sms_messages ORDER BY id DESC LIMIT ?)",
                &[SqlParam::from(cap)],
            )
            .await?;

        if let Ok(config) = self.webhook_config().await {
            if config.enabled {
                let engine = Arc::clone(self);
                let sender = sender.to_string();
                let content = content.to_string();
                tokio::spawn(async move {
                    engine.dispatch_webhook(&config, &sender, &content).await;
                });
            }
        }

        Ok(id)
    }

    /// Current webhook config.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn webhook_config(&self) -> Result<WebhookConfigView, AppError> {
        let rows = self
            .store
            .query_rows(
                "SELECT enabled, platform, url, body_template, headers FROM sms_webhook_config WHERE id = 1",
                &[],
                1,
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(WebhookConfigView::default());
        };
        Ok(WebhookConfigView {
            enabled: row[0] == "1",
            platform: row[1].clone(),
            url: row[2].clone(),
            body_template: row[3].clone(),
            headers: row[4].clone(),
        })
    }

    /// Persist the webhook config.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn save_webhook_config(&self, config: WebhookConfigView) -> Result<(), AppError> {
        self.store
            .exec(
                "INSERT INTO sms_webhook_config (id, enabled, platform, url, body_template, headers) \
                 VALUES (1, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET enabled = excluded.enabled, platform = excluded.platform, \
                 url = excluded.url, body_template = excluded.body_template, headers = excluded.headers",
                &[
                    SqlParam::from(config.enabled),
                    SqlParam::from(config.platform),
                    SqlParam::from(config.url),
                    SqlParam::from(config.body_template),
                    SqlParam::from(config.headers),
                ],
            )
            .await?;
        Ok(())
    }

    /// Send a one-off test webhook using the currently saved config
    /// without touching the delivery log or requiring a real incoming
    /// message.
    ///
    /// # Errors
    ///
    /// Returns an error if the webhook config cannot be read.
    pub async fn test_webhook(&self) -> Result<(), AppError> {
        let config = self.webhook_config().await?;
        self.dispatch_webhook(&config, "test", "this is a test message").await;
        Ok(())
    }

    /// List persisted inbound messages, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_inbox(&self) -> Result<Vec<InboxMessage>, AppError> {
        let cap = self.max_inbox().await.as_i64();
        let rows = self
            .store
            .query_rows(
                "SELECT id, sender, content, timestamp, is_read FROM sms_messages ORDER BY id DESC",
                &[],
                cap as usize,
            )
            .await?;
        Ok(rows.into_iter().filter_map(row_to_inbox_message).collect())
    }

    /// Delete an inbound message by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn delete_inbox(&self, id: i64) -> Result<(), AppError> {
        self.store
            .exec("DELETE FROM sms_messages WHERE id = ?", &[SqlParam::from(id)])
            .await?;
        Ok(())
    }

    /// Current inbox/outbox caps and the `CNMI` fix toggle.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn config(&self) -> Result<SmsConfigView, AppError> {
        let rows = self
            .store
            .query_rows(
                "SELECT max_inbox, max_sent, fix_enabled FROM sms_config WHERE id = 1",
                &[],
                1,
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(SmsConfigView::default());
        };
        Ok(SmsConfigView {
            max_inbox: row[0].parse().unwrap_or_default(),
            max_sent: row[1].parse().unwrap_or_default(),
            fix_enabled: row[2] == "1",
        })
    }

    /// Persist the inbox/outbox caps. The `CNMI` toggle itself is only
    /// changed through `set_fix_enabled`, which also issues the AT
    /// command.
    ///
    /// # Errors
    ///
    /// Returns an error if either cap is out of its valid range or the
    /// database write fails.
    pub async fn save_config(&self, max_inbox: u32, max_sent: u32) -> Result<(), AppError> {
        let max_inbox = MaxInbox::try_new(max_inbox)
            .map_err(|e| AppError::InvalidArgument(e.to_string()))?;
        let max_sent =
            MaxSent::try_new(max_sent).map_err(|e| AppError::InvalidArgument(e.to_string()))?;
        self.store
            .exec(
                "INSERT INTO sms_config (id, max_inbox, max_sent) VALUES (1, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET max_inbox = excluded.max_inbox, max_sent = excluded.max_sent",
                &[SqlParam::from(max_inbox.as_i64()), SqlParam::from(max_sent.as_i64())],
            )
            .await?;
        Ok(())
    }

    /// Append a webhook attempt to the in-memory ring, dropping the oldest
    /// entry once the cap is reached.
    async fn record_webhook_attempt(&self, entry: WebhookLogEntry) {
        let mut log = self.webhook_log.lock().await;
        if log.len() >= SMS_WEBHOOK_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Snapshot of the webhook delivery log, most recent first.
    pub async fn webhook_log(&self) -> Vec<WebhookLogEntry> {
        self.webhook_log.lock().await.iter().rev().cloned().collect()
    }

    async fn dispatch_webhook(&self, config: &WebhookConfigView, sender: &str, content: &str) {
        let mut vars = HashMap::new();
        vars.insert("sender", sender);
        vars.insert("content", content);
        let time = now_unix().to_string();
        vars.insert("time", &time);
        let body = templating::substitute(&config.body_template, &vars);

        let (headers, has_content_type) = parse_headers(&config.headers);
        let mut request = self.http.post(&config.url).body(body.clone());
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        if !has_content_type {
            request = request.header("Content-Type", "application/json");
        }

        let outcome = request.send().await;
        let (response_text, success) = match outcome {
            Ok(response) => match response.text().await {
                Ok(text) => {
                    let ok = !text.is_empty() && !FAILURE_MARKERS.iter().any(|m| text.contains(m));
                    (text, ok)
                }
                Err(e) => (e.to_string(), false),
            },
            Err(e) => (e.to_string(), false),
        };

        if !success {
            warn!(url = %config.url, "sms webhook delivery failed");
        }

        self.record_webhook_attempt(WebhookLogEntry {
            sender: sender.to_string(),
            request: body,
            response: response_text,
            result: success,
            created_at: now_unix(),
        })
        .await;
    }

    /// Send an outbound message via the cellular daemon with a 15 s
    /// timeout, recording the outcome into `sent_sms` capped at
    /// `maxSent`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the database write itself fails; a failed
    /// delivery is recorded as `SentSmsStatus::Failed`, not propagated.
    #[instrument(skip(self, content))]
    pub async fn send(&self, recipient: &str, content: &str) -> Result<SentSmsStatus, AppError> {
        let path = self.modem_path.lock().await.clone();
        let args = (recipient, content);
        let call = self
            .bus
            .call_method::<_, ()>(&path, "org.ofono.MessageManager", "SendMessage", &args);
        let status = match tokio::time::timeout(SEND_TIMEOUT, call).await {
            Ok(Ok(())) => SentSmsStatus::Sent,
            Ok(Err(_)) | Err(_) => SentSmsStatus::Failed,
        };

        let timestamp = now_unix();
        self.store
            .exec_insert(
                "INSERT INTO sent_sms (recipient, content, timestamp, status) VALUES (?, ?, ?, ?)",
                &[
                    SqlParam::from(recipient),
                    SqlParam::from(content),
                    SqlParam::from(timestamp),
                    SqlParam::from(status.as_str()),
                ],
            )
            .await?;

        let cap = self.max_sent().await.as_i64();
        self.store
            .exec(
                "DELETE FROM sent_sms WHERE id NOT IN (SELECT id FROM sent_sms ORDER BY id DESC LIMIT ?)",
                &[SqlParam::from(cap)],
            )
            .await?;

        Ok(status)
    }

    /// Enable or disable the "SMS fix" `CNMI` AT toggle.
    ///
    /// # Errors
    ///
    /// Returns an error if the AT command fails.
    pub async fn set_fix_enabled(&self, enabled: bool) -> Result<(), AppError> {
        let cmd = if enabled { CNMI_ENABLE } else { CNMI_DISABLE };
        self.modem.execute_at(cmd).await?;
        self.store
            .exec(
                "UPDATE sms_config SET fix_enabled = ? WHERE id = 1",
                &[SqlParam::from(enabled)],
            )
            .await?;
        Ok(())
    }

    async fn subscribe_incoming(&self) -> Option<tokio::sync::mpsc::Receiver<zbus::Message>> {
        let path = self.modem_path.lock().await.clone();
        self.bus
            .subscribe_signal(&path, "org.ofono.MessageManager", "IncomingMessage")
            .await
            .ok()
    }

    /// Run the incoming-message listener: subscribes to
    /// `MessageManager.IncomingMessage`, decoding and persisting each
    /// signal, and re-subscribes whenever the modem daemon reappears on
    /// the bus.
    pub async fn run_incoming_listener(self: Arc<Self>) {
        let Ok(mut name_owner_rx) = self.bus.watch_name_owner().await else {
            warn!("could not watch modem daemon name owner; sms intake disabled");
            return;
        };

        loop {
            let Some(mut signal_rx) = self.subscribe_incoming().await else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };

            loop {
                tokio::select! {
                    Some(msg) = signal_rx.recv() => {
                        let Ok((body, properties)) = msg.body().deserialize::<(String, HashMap<String, OwnedValue>)>() else {
                            continue;
                        };
                        let incoming = IncomingMessage::decode(body, properties);
                        if let Err(e) = self.handle_incoming(&incoming.sender, &incoming.body).await {
                            warn!(error = %e, "failed to persist incoming sms");
                        }
                    }
                    event = name_owner_rx.recv() => {
                        match event {
                            Some(NameOwnerEvent::Vanished) => {
                                warn!("modem daemon vanished, dropping incoming-message subscription");
                                break;
                            }
                            Some(NameOwnerEvent::Appeared) => {
                                info!("modem daemon reappeared, resubscribing incoming-message signal");
                                break;
                            }
                            None => return,
                        }
                    }
                }
            }
        }
    }

    /// Run the bus-reconnect maintenance loop: every ~30 s, verify the
    /// modem daemon is reachable and, on reappear, re-apply the SMS fix
    /// AT toggle if enabled.
    pub async fn run_maintenance(self: Arc<Self>) {
        let Ok(mut name_owner_rx) = self.bus.watch_name_owner().await else {
            warn!("could not watch modem daemon name owner; sms maintenance disabled");
            return;
        };

        loop {
            tokio::select! {
                event = name_owner_rx.recv() => {
                    match event {
                        Some(NameOwnerEvent::Appeared) => {
                            let fix_enabled = self
                                .store
                                .query_scalar_int("SELECT fix_enabled FROM sms_config WHERE id = 1", &[])
                                .await
                                .map(|v| v != 0)
                                .unwrap_or(false);
                            if fix_enabled {
                                let _ = self.modem.execute_at(CNMI_ENABLE).await;
                            }
                        }
                        Some(NameOwnerEvent::Vanished) => {
                            warn!("modem daemon vanished");
                        }
                        None => return,
                    }
                }
                () = tokio::time::sleep(MAINTENANCE_INTERVAL) => {
                    if !self.bus.is_available().await {
                        warn!("sms maintenance: bus unavailable");
                    }
                }
            }
        }
    }
}

fn parse_headers(raw: &str) -> (Vec<(String, String)>, bool) {
    let mut headers = Vec::new();
    let mut has_content_type = false;
    for line in raw.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("content-type") {
            has_content_type = true;
        }
        if !name.is_empty() {
            headers.push((name, value));
        }
    }
    (headers, has_content_type)
}

/// An incoming message signal payload, decoded from `(s, a{sv})`.
#[derive(Debug, Clone)]
struct IncomingMessage {
    body: String,
    sender: String,
}

impl IncomingMessage {
    fn decode(body: String, properties: HashMap<String, OwnedValue>) -> Self {
        let sender = properties
            .get("Sender")
            .and_then(|v| String::try_from(v.try_clone().ok()?).ok())
            .unwrap_or_default();
        Self { body, sender }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_headers_detects_content_type_case_insensitively() {
        let (headers, has_ct) = parse_headers("X-Test: 1\ncontent-type: text/plain");
        assert!(has_ct);
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn parse_headers_ignores_malformed_lines() {
        let (headers, has_ct) = parse_headers("not-a-header-line\nX-Ok: yes");
        assert!(!has_ct);
        assert_eq!(headers, vec![("X-Ok".to_string(), "yes".to_string())]);
    }

    #[test]
    fn failure_markers_catch_curl_style_errors() {
        for marker in FAILURE_MARKERS {
            let text = format!("prefix {marker} suffix");
            assert!(FAILURE_MARKERS.iter().any(|m| text.contains(m)));
        }
    }

    #[test]
    fn incoming_message_decodes_sender_property() {
        let mut props = HashMap::new();
        props.insert(
            "Sender".to_string(),
            OwnedValue::try_from("+100").unwrap(),
        );
        let msg = IncomingMessage::decode("hello".to_string(), props);
        assert_eq!(msg.sender, "+100");
        assert_eq!(msg.body, "hello");
    }
}
