//! IPv6→IPv4 TCP port-forwarding engine: rule CRUD, per-rule supervisor,
//! firewall rule lifecycle, and the periodic global-address reporter.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::domain_types::{IPV6_SEND_LOG_CAPACITY, MAX_IPV6_RULES, PortNumber};
use crate::error::AppError;
use crate::relay;
use crate::store::{SqlParam, Store};
use crate::templating;

const REPORT_RETRY_ATTEMPTS: u32 = 30;
const REPORT_RETRY_DELAY: Duration = Duration::from_secs(10);
const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A persisted forwarding rule.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Ipv6Rule {
    /// `id`.
    pub id: i64,
    /// `local_port`.
    pub local_port: u16,
    /// `ipv6_port`.
    pub ipv6_port: u16,
    /// `enabled`.
    pub enabled: bool,
    /// `created_at`.
    pub created_at: i64,
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Ipv6Status {
    /// `running`.
    pub running: bool,
    /// `active_count`.
    pub active_count: usize,
    /// `last_error`.
    pub last_error: Option<String>,
}

/// One periodic address-report attempt.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Ipv6SendLogEntry {
    /// `ipv6_addr`.
    pub ipv6_addr: String,
    /// `content`.
    pub content: String,
    /// `response`.
    pub response: String,
    /// `result`.
    pub result: bool,
    /// `created_at`.
    pub created_at: i64,
}

/// Rule CRUD, per-rule relay supervisor, firewall side-effects, and the
/// periodic address reporter.
pub struct Ipv6Fwd {
    store: Store,
    http: reqwest::Client,
    workers: DashMap<i64, JoinHandle<()>>,
    send_log: Mutex<VecDeque<Ipv6SendLogEntry>>,
    last_error: Mutex<Option<String>>,
}

impl Ipv6Fwd {
    #[must_use]
    /// `new`.
    pub fn new(store: Store) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REPORT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            store,
            http,
            workers: DashMap::new(),
            send_log: Mutex::new(VecDeque::with_capacity(IPV6_SEND_LOG_CAPACITY)),
            last_error: Mutex::new(None),
        }
    }

    /// List every persisted rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_rules(&self) -> Result<Vec<Ipv6Rule>, AppError> {
        let rows = self
            .store
            .query_rows(
                "SELECT id, local_port, ipv6_port, enabled, created_at FROM ipv6_rules ORDER BY id",
                &[],
                MAX_IPV6_RULES as usize,
            )
            .await?;
        Ok(rows.into_iter().filter_map(row_to_rule).collect())
    }

    /// Overall enabled/auto-start/webhook configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn config(&self) -> Result<Ipv6Config, AppError> {
        let rows = self
            .store
            .query_rows(
                "SELECT enabled, auto_start, send_enabled, send_interval_minutes, \
                 webhook_url, webhook_body_template, webhook_headers FROM ipv6_config WHERE id = 1",
                &[],
                1,
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(Ipv6Config::default());
        };
        Ok(Ipv6Config {
            enabled: row[0] == "1",
            auto_start: row[1] == "1",
            send_enabled: row[2] == "1",
            send_interval_minutes: row[3].parse().unwrap_or(60),
            webhook_url: row[4].clone(),
            webhook_body_template: row[5].clone(),
            webhook_headers: row[6].clone(),
        })
    }

    /// Persist the overall configuration. Setting `auto_start = true`
    /// forces `enabled = true` regardless of the value passed in.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn save_config(&self, mut config: Ipv6Config) -> Result<(), AppError> {
        if config.auto_start {
            config.enabled = true;
        }
        self.store
            .exec(
                "INSERT INTO ipv6_config \
                 (id, enabled, auto_start, send_enabled, send_interval_minutes, webhook_url, webhook_body_template, webhook_headers) \
                 VALUES (1, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                 enabled = excluded.enabled, auto_start = excluded.auto_start, \
                 send_enabled = excluded.send_enabled, send_interval_minutes = excluded.send_interval_minutes, \
                 webhook_url = excluded.webhook_url, webhook_body_template = excluded.webhook_body_template, \
                 webhook_headers = excluded.webhook_headers",
                &[
                    SqlParam::from(config.enabled),
                    SqlParam::from(config.auto_start),
                    SqlParam::from(config.send_enabled),
                    SqlParam::from(i64::from(config.send_interval_minutes)),
                    SqlParam::from(config.webhook_url),
                    SqlParam::from(config.webhook_body_template),
                    SqlParam::from(config.webhook_headers),
                ],
            )
            .await?;
        Ok(())
    }

    /// Add a rule. Rejects once `MAX_IPV6_RULES` are persisted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` at capacity, otherwise a
    /// database error.
    pub async fn add_rule(&self, local_port: PortNumber, ipv6_port: PortNumber) -> Result<i64, AppError> {
        let count = self
            .store
            .query_scalar_int("SELECT COUNT(*) FROM ipv6_rules", &[])
            .await?;
        if count >= MAX_IPV6_RULES {
            return Err(AppError::InvalidArgument(format!(
                "at most {MAX_IPV6_RULES} ipv6 forwarding rules are supported"
            )));
        }
        let id = self
            .store
            .exec_insert(
                "INSERT INTO ipv6_rules (local_port, ipv6_port, enabled, created_at) VALUES (?, ?, 1, ?)",
                &[
                    SqlParam::from(i64::from(local_port.as_u16())),
                    SqlParam::from(i64::from(ipv6_port.as_u16())),
                    SqlParam::from(now_unix()),
                ],
            )
            .await?;
        Ok(id)
    }

    /// Enable/disable or delete a rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<(), AppError> {
        self.store
            .exec(
                "UPDATE ipv6_rules SET enabled = ? WHERE id = ?",
                &[SqlParam::from(enabled), SqlParam::from(id)],
            )
            .await?;
        Ok(())
    }

    /// Delete a rule, tearing down its worker first if running.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn delete_rule(&self, id: i64) -> Result<(), AppError> {
        self.stop_worker(id).await;
        self.store
            .exec("DELETE FROM ipv6_rules WHERE id = ?", &[SqlParam::from(id)])
            .await?;
        Ok(())
    }

    /// Start one worker per enabled rule and install firewall rules for
    /// each.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule list cannot be read.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), AppError> {
        for rule in self.list_rules().await?.into_iter().filter(|r| r.enabled) {
            self.spawn_worker(rule).await;
        }
        Ok(())
    }

    async fn spawn_worker(self: &Arc<Self>, rule: Ipv6Rule) {
        if self.workers.contains_key(&rule.id) {
            return;
        }
        if let Err(e) = add_firewall_accept(rule.ipv6_port).await {
            warn!(error = %e, port = rule.ipv6_port, "failed to install ipv6 firewall rule");
            *self.last_error.lock().await = Some(e.to_string());
        }

        let handle = tokio::spawn(run_worker(rule.clone()));
        self.workers.insert(rule.id, handle);
    }

    async fn stop_worker(&self, id: i64) {
        if let Some((_, handle)) = self.workers.remove(&id) {
            handle.abort();
        }
    }

    /// Stop every running worker and remove the firewall rules installed
    /// for currently-enabled rules.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), AppError> {
        let rules = self.list_rules().await?;
        for rule in rules.into_iter().filter(|r| r.enabled) {
            if let Err(e) = remove_firewall_accept(rule.ipv6_port).await {
                warn!(error = %e, port = rule.ipv6_port, "failed to remove ipv6 firewall rule");
            }
        }
        for id in self.workers.iter().map(|e| *e.key()).collect::<Vec<_>>() {
            self.stop_worker(id).await;
        }
        Ok(())
    }

    /// `stop()` followed by `start()`.
    ///
    /// # Errors
    ///
    /// Returns an error if either phase fails.
    pub async fn restart(self: &Arc<Self>) -> Result<(), AppError> {
        self.stop().await?;
        self.start().await
    }

    /// Current worker count and last recorded error.
    pub async fn status(&self) -> Ipv6Status {
        Ipv6Status {
            running: !self.workers.is_empty(),
            active_count: self.workers.len(),
            last_error: self.last_error.lock().await.clone(),
        }
    }

    /// Snapshot of the address-report ring, most recent first.
    pub async fn send_log(&self) -> Vec<Ipv6SendLogEntry> {
        self.send_log.lock().await.iter().rev().cloned().collect()
    }

    async fn record_send_attempt(&self, entry: Ipv6SendLogEntry) {
        let mut log = self.send_log.lock().await;
        if log.len() >= IPV6_SEND_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    async fn webhook_config(&self) -> Result<Ipv6WebhookConfig, AppError> {
        let config = self.config().await?;
        Ok(Ipv6WebhookConfig {
            send_enabled: config.send_enabled,
            interval_minutes: config.send_interval_minutes,
            url: config.webhook_url,
            body_template: config.webhook_body_template,
        })
    }

    /// Send one address report immediately, regardless of the periodic
    /// schedule. Used by the `/api/ipv6-proxy/send` control endpoint and
    /// the post-once-at-start behaviour.
    #[instrument(skip(self))]
    pub async fn send_report_once(&self) -> Result<bool, AppError> {
        let config = self.webhook_config().await?;
        if !config.send_enabled || config.url.is_empty() {
            return Ok(false);
        }
        let ports: Vec<u16> = self
            .list_rules()
            .await?
            .into_iter()
            .filter(|r| r.enabled)
            .map(|r| r.ipv6_port)
            .collect();
        let success = self.deliver_report(&config, &ports).await;
        Ok(success)
    }

    async fn deliver_report(&self, config: &Ipv6WebhookConfig, ports: &[u16]) -> bool {
        let Some(ipv6_addr) = global_ipv6_address().await else {
            warn!("no global ipv6 address available, skipping report");
            return false;
        };

        let port_list = ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",");
        let link_list = ports
            .iter()
            .map(|p| format!("[{ipv6_addr}]:{p}"))
            .collect::<Vec<_>>()
            .join("\n");
        let time = now_unix().to_string();

        let mut vars = HashMap::new();
        vars.insert("ipv6", ipv6_addr.as_str());
        vars.insert("sender", ipv6_addr.as_str());
        vars.insert("port", port_list.as_str());
        vars.insert("link", link_list.as_str());
        vars.insert("time", time.as_str());
        let body = templating::substitute(&config.body_template, &vars);

        for attempt in 0..REPORT_RETRY_ATTEMPTS {
            let outcome = self
                .http
                .post(&config.url)
                .header("Content-Type", "application/json")
                .body(body.clone())
                .send()
                .await;
            let (response_text, success) = match outcome {
                Ok(response) => match response.text().await {
                    Ok(text) => (text.clone(), !text.is_empty()),
                    Err(e) => (e.to_string(), false),
                },
                Err(e) => (e.to_string(), false),
            };

            if success {
                self.record_send_attempt(Ipv6SendLogEntry {
                    ipv6_addr: ipv6_addr.clone(),
                    content: body.clone(),
                    response: response_text,
                    result: true,
                    created_at: now_unix(),
                })
                .await;
                return true;
            }

            if attempt + 1 < REPORT_RETRY_ATTEMPTS {
                tokio::time::sleep(REPORT_RETRY_DELAY).await;
            } else {
                self.record_send_attempt(Ipv6SendLogEntry {
                    ipv6_addr: ipv6_addr.clone(),
                    content: body.clone(),
                    response: response_text,
                    result: false,
                    created_at: now_unix(),
                })
                .await;
            }
        }
        false
    }

    /// Run the periodic address reporter: posts once immediately if
    /// configured, then every `sendIntervalMinutes`.
    pub async fn run_periodic_reporter(self: Arc<Self>) {
        if let Ok(config) = self.webhook_config().await {
            if config.send_enabled {
                let ports: Vec<u16> = self
                    .list_rules()
                    .await
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|r| r.enabled)
                    .map(|r| r.ipv6_port)
                    .collect();
                self.deliver_report(&config, &ports).await;
            }
        }

        loop {
            let interval = self
                .webhook_config()
                .await
                .map(|c| Duration::from_secs(u64::from(c.interval_minutes) * 60))
                .unwrap_or(Duration::from_secs(3600));
            tokio::time::sleep(interval).await;

            let Ok(config) = self.webhook_config().await else { continue };
            if !config.send_enabled {
                continue;
            }
            let ports: Vec<u16> = self
                .list_rules()
                .await
                .unwrap_or_default()
                .into_iter()
                .filter(|r| r.enabled)
                .map(|r| r.ipv6_port)
                .collect();
            self.deliver_report(&config, &ports).await;
        }
    }
}

async fn run_worker(rule: Ipv6Rule) {
    let listener = match TcpListener::bind(("::", rule.ipv6_port)).await {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, port = rule.ipv6_port, "failed to bind ipv6 listener");
            return;
        }
    };

    loop {
        let (mut client, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "ipv6 accept failed");
                continue;
            }
        };
        debug!(%peer, local_port = rule.local_port, "accepted ipv6 forwarding connection");

        let local_port = rule.local_port;
        tokio::spawn(async move {
            match relay::connect_local(local_port).await {
                Ok(mut server) => {
                    let _ = relay::splice(&mut client, &mut server).await;
                }
                Err(e) => warn!(error = %e, local_port, "failed to connect to local target"),
            }
        });
    }
}

async fn ip6tables_rule_exists(port: u16) -> bool {
    tokio::process::Command::new("ip6tables")
        .args(["-C", "INPUT", "-p", "tcp", "--dport", &port.to_string(), "-j", "ACCEPT"])
        .status()
        .await
        .is_ok_and(|status| status.success())
}

async fn add_firewall_accept(port: u16) -> std::io::Result<()> {
    if ip6tables_rule_exists(port).await {
        return Ok(());
    }
    tokio::process::Command::new("ip6tables")
        .args(["-A", "INPUT", "-p", "tcp", "--dport", &port.to_string(), "-j", "ACCEPT"])
        .status()
        .await?;
    Ok(())
}

async fn remove_firewall_accept(port: u16) -> std::io::Result<()> {
    if !ip6tables_rule_exists(port).await {
        return Ok(());
    }
    tokio::process::Command::new("ip6tables")
        .args(["-D", "INPUT", "-p", "tcp", "--dport", &port.to_string(), "-j", "ACCEPT"])
        .status()
        .await?;
    Ok(())
}

/// First global-scope IPv6 address on the device, via `ip -6 addr show
/// scope global`.
async fn global_ipv6_address() -> Option<String> {
    let output = tokio::process::Command::new("ip")
        .args(["-6", "addr", "show", "scope", "global"])
        .output()
        .await
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    parse_first_global_ipv6(&text)
}

fn parse_first_global_ipv6(text: &str) -> Option<String> {
    for line in text.lines() {
        let line = line.trim();
        if !line.contains("scope global") {
            continue;
        }
        if let Some(rest) = line.strip_prefix("inet6 ") {
            if let Some(addr) = rest.split('/').next() {
                return Some(addr.to_string());
            }
        }
    }
    None
}

fn row_to_rule(row: Vec<String>) -> Option<Ipv6Rule> {
    Some(Ipv6Rule {
        id: row.first()?.parse().ok()?,
        local_port: row.get(1)?.parse().ok()?,
        ipv6_port: row.get(2)?.parse().ok()?,
        enabled: row.get(3)?.as_str() == "1",
        created_at: row.get(4)?.parse().ok()?,
    })
}

#[derive(Debug, Clone, Default)]
struct Ipv6WebhookConfig {
    send_enabled: bool,
    interval_minutes: u32,
    url: String,
    body_template: String,
}

/// Overall IPv6 forwarder configuration, separate from individual rules.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Ipv6Config {
    /// `enabled`.
    pub enabled: bool,
    /// `auto_start`.
    pub auto_start: bool,
    /// `send_enabled`.
    pub send_enabled: bool,
    /// `send_interval_minutes`.
    pub send_interval_minutes: u32,
    /// `webhook_url`.
    pub webhook_url: String,
    /// `webhook_body_template`.
    pub webhook_body_template: String,
    /// `webhook_headers`.
    pub webhook_headers: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_first_global_ipv6_skips_link_local() {
        let text = "2: eth0: <...>\n    inet6 fe80::1/64 scope link\n    inet6 2001:db8::42/64 scope global\n";
        assert_eq!(parse_first_global_ipv6(text), Some("2001:db8::42".to_string()));
    }

    #[test]
    fn parse_first_global_ipv6_returns_none_when_absent() {
        assert_eq!(parse_first_global_ipv6(""), None);
    }

    #[test]
    fn row_to_rule_parses_all_columns() {
        let row = vec!["1".into(), "80".into(), "8080".into(), "1".into(), "100".into()];
        let rule = row_to_rule(row).unwrap();
        assert_eq!(rule.id, 1);
        assert_eq!(rule.local_port, 80);
        assert_eq!(rule.ipv6_port, 8080);
        assert!(rule.enabled);
    }
}
