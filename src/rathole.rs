//! Reverse-tunnel client config generation, process supervision, and log
//! tailing for the `rathole` external binary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::error::AppError;
use crate::store::{SqlParam, Store};

const LIVENESS_CHECK_DELAY: Duration = Duration::from_millis(500);
const SERVER_PORT_BASE: u16 = 9000;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A persisted tunnel endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RatholeService {
    /// `id`.
    pub id: i64,
    /// `name`.
    pub name: String,
    /// `token`.
    pub token: String,
    /// `local_addr`.
    pub local_addr: String,
    /// `enabled`.
    pub enabled: bool,
    /// `created_at`.
    pub created_at: i64,
}

/// Top-level tunnel config: remote server address plus auto-start/enabled
/// flags.
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize)]
pub struct RatholeConfig {
    /// `server_addr`.
    pub server_addr: String,
    /// `auto_start`.
    pub auto_start: bool,
    /// `enabled`.
    pub enabled: bool,
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct RatholeStatus {
    /// `running`.
    pub running: bool,
    /// `pid`.
    pub pid: Option<u32>,
    /// `service_count`.
    pub service_count: usize,
    /// `last_error`.
    pub last_error: Option<String>,
}

#[derive(Serialize)]
struct ClientToml {
    client: ClientSection,
}

#[derive(Serialize)]
struct ClientSection {
    remote_addr: String,
    services: BTreeMap<String, ServiceSection>,
}

#[derive(Serialize)]
struct ServiceSection {
    token: String,
    local_addr: String,
}

#[derive(Serialize)]
struct ServerToml {
    server: ServerSection,
}

#[derive(Serialize)]
struct ServerSection {
    bind_addr: String,
    services: BTreeMap<String, ServerServiceSection>,
}

#[derive(Serialize)]
struct ServerServiceSection {
    bind_addr: String,
}

/// Generate the client-side TOML document for `server_addr` and its
/// enabled services.
#[must_use]
pub fn generate_client_toml(server_addr: &str, services: &[RatholeService]) -> String {
    let mut section = BTreeMap::new();
    for service in services.iter().filter(|s| s.enabled) {
        section.insert(
            service.name.clone(),
            ServiceSection {
                token: service.token.clone(),
                local_addr: service.local_addr.clone(),
            },
        );
    }
    let document = ClientToml {
        client: ClientSection {
            remote_addr: server_addr.to_string(),
            services: section,
        },
    };
    toml::to_string(&document).unwrap_or_default()
}

/// Generate the server-side skeleton: listens on `[::]:<port>` (the port
/// taken from `server_addr`), assigning exposed ports starting at 9000 by
/// service index.
#[must_use]
pub fn generate_server_toml(server_addr: &str, services: &[RatholeService]) -> String {
    let port = server_addr.rsplit(':').next().unwrap_or("2333");
    let mut section = BTreeMap::new();
    for (index, service) in services.iter().filter(|s| s.enabled).enumerate() {
        let exposed_port = SERVER_PORT_BASE + u16::try_from(index).unwrap_or(0);
        section.insert(
            service.name.clone(),
            ServerServiceSection {
                bind_addr: format!("0.0.0.0:{exposed_port}"),
            },
        );
    }
    let document = ServerToml {
        server: ServerSection {
            bind_addr: format!("[::]:{port}"),
            services: section,
        },
    };
    toml::to_string(&document).unwrap_or_default()
}

/// Shell install script exported verbatim to the UI; the device never
/// executes it.
#[must_use]
pub fn generate_install_script(server_addr: &str, services: &[RatholeService]) -> String {
    let toml = generate_server_toml(server_addr, services);
    format!(
        "#!/bin/sh\nset -e\ncat > /etc/rathole/server.toml <<'EOF'\n{toml}EOF\n\
         curl -fsSL https://github.com/rapiz1/rathole/releases/latest/download/rathole-x86_64-linux.zip -o /tmp/rathole.zip\n\
         unzip -o /tmp/rathole.zip -d /usr/local/bin\n\
         chmod +x /usr/local/bin/rathole\n\
         cat > /etc/systemd/system/rathole-server.service <<'EOF'\n\
         [Unit]\nDescription=rathole server\n\n\
         [Service]\nExecStart=/usr/local/bin/rathole /etc/rathole/server.toml\nRestart=on-failure\n\n\
         [Install]\nWantedBy=multi-user.target\nEOF\n\
         systemctl daemon-reload\nsystemctl enable --now rathole-server\n\
         iptables -A INPUT -p tcp --dport $(echo '{server_addr}' | cut -d: -f2) -j ACCEPT\n"
    )
}

/// Validate a service name: non-empty, ASCII only, rejected otherwise.
///
/// # Errors
///
/// Returns an error if `name` is empty or contains non-ASCII bytes.
pub fn validate_service_name(name: &str) -> Result<(), AppError> {
    if name.is_empty() || !name.is_ascii() {
        return Err(AppError::InvalidArgument(
            "service name must be non-empty and ASCII-only".to_string(),
        ));
    }
    Ok(())
}

/// Config CRUD, client process supervision, and log tailing.
pub struct RatholeController {
    store: Store,
    log_path: PathBuf,
    pid_path: PathBuf,
    config_path: PathBuf,
    binary_path: PathBuf,
    child: Mutex<Option<Child>>,
    last_error: Mutex<Option<String>>,
}

impl RatholeController {
    #[must_use]
    /// `new`.
    pub fn new(
        store: Store,
        log_path: impl Into<PathBuf>,
        pid_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        binary_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            log_path: log_path.into(),
            pid_path: pid_path.into(),
            config_path: config_path.into(),
            binary_path: binary_path.into(),
            child: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Current tunnel config.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn config(&self) -> Result<RatholeConfig, AppError> {
        let rows = self
            .store
            .query_rows(
                "SELECT server_addr, auto_start, enabled FROM rathole_config WHERE id = 1",
                &[],
                1,
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(RatholeConfig::default());
        };
        Ok(RatholeConfig {
            server_addr: row[0].clone(),
            auto_start: row[1] == "1",
            enabled: row[2] == "1",
        })
    }

    /// Persist the tunnel config. `server_addr` must be ASCII-only.
    ///
    /// # Errors
    ///
    /// Returns an error if `server_addr` is non-ASCII or the write fails.
    pub async fn save_config(&self, config: RatholeConfig) -> Result<(), AppError> {
        if !config.server_addr.is_ascii() {
            return Err(AppError::InvalidArgument(
                "server_addr must be ASCII-only".to_string(),
            ));
        }
        self.store
            .exec(
                "INSERT INTO rathole_config (id, server_addr, auto_start, enabled) VALUES (1, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET server_addr = excluded.server_addr, \
                 auto_start = excluded.auto_start, enabled = excluded.enabled",
                &[
                    SqlParam::from(config.server_addr),
                    SqlParam::from(config.auto_start),
                    SqlParam::from(config.enabled),
                ],
            )
            .await?;
        Ok(())
    }

    /// List every persisted service.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_services(&self) -> Result<Vec<RatholeService>, AppError> {
        let rows = self
            .store
            .query_rows(
                "SELECT id, name, token, local_addr, enabled, created_at FROM rathole_services ORDER BY id",
                &[],
                crate::domain_types::MAX_RATHOLE_SERVICES as usize,
            )
            .await?;
        Ok(rows.into_iter().filter_map(row_to_service).collect())
    }

    /// Add a service. Rejects non-ASCII names and rejects once
    /// `MAX_RATHOLE_SERVICES` are persisted.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid input, capacity, or a database failure.
    pub async fn add_service(&self, name: &str, token: &str, local_addr: &str) -> Result<i64, AppError> {
        validate_service_name(name)?;
        let count = self
            .store
            .query_scalar_int("SELECT COUNT(*) FROM rathole_services", &[])
            .await?;
        if count >= crate::domain_types::MAX_RATHOLE_SERVICES {
            return Err(AppError::InvalidArgument(format!(
                "at most {} rathole services are supported",
                crate::domain_types::MAX_RATHOLE_SERVICES
            )));
        }
        let id = self
            .store
            .exec_insert(
                "INSERT INTO rathole_services (name, token, local_addr, enabled, created_at) \
                 VALUES (?, ?, ?, 1, ?)",
                &[
                    SqlParam::from(name),
                    SqlParam::from(token),
                    SqlParam::from(local_addr),
                    SqlParam::from(now_unix()),
                ],
            )
            .await?;
        Ok(id)
    }

    /// Update a service's name, token, and local address.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn update_service(
        &self,
        id: i64,
        name: &str,
        token: &str,
        local_addr: &str,
    ) -> Result<(), AppError> {
        self.store
            .exec(
                "UPDATE rathole_services SET name = ?, token = ?, local_addr = ? WHERE id = ?",
                &[
                    SqlParam::from(name),
                    SqlParam::from(token),
                    SqlParam::from(local_addr),
                    SqlParam::from(id),
                ],
            )
            .await?;
        Ok(())
    }

    /// Delete a service by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn delete_service(&self, id: i64) -> Result<(), AppError> {
        self.store
            .exec("DELETE FROM rathole_services WHERE id = ?", &[SqlParam::from(id)])
            .await?;
        Ok(())
    }

    /// Regenerate the config file, truncate the log, spawn the binary,
    /// and verify it is still alive 500 ms later.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be written, the binary
    /// cannot be spawned, or the liveness check fails.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), AppError> {
        let config = self.config().await?;
        let services = self.list_services().await?;
        let toml = generate_client_toml(&config.server_addr, &services);
        tokio::fs::write(&self.config_path, toml)
            .await
            .map_err(AppError::from)?;

        let log_file = std::fs::File::create(&self.log_path).map_err(AppError::from)?;
        let stderr_file = log_file.try_clone().map_err(AppError::from)?;
        let child = tokio::process::Command::new(&self.binary_path)
            .arg(&self.config_path)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(false)
            .spawn()
            .map_err(AppError::from)?;
        let pid = child.id();
        *self.child.lock().await = Some(child);

        tokio::time::sleep(LIVENESS_CHECK_DELAY).await;
        if !self.is_alive_by_pgrep().await {
            *self.last_error.lock().await = Some("process exited within 500ms of spawn".to_string());
            self.child.lock().await.take();
            let _ = tokio::fs::remove_file(&self.pid_path).await;
            return Err(AppError::Internal(
                "rathole process did not survive its liveness check".to_string(),
            ));
        }
        if let Some(pid) = pid {
            let _ = tokio::fs::write(&self.pid_path, pid.to_string()).await;
        }
        *self.last_error.lock().await = None;
        tracing::info!(pid, "rathole started");
        Ok(())
    }

    async fn is_alive_by_pgrep(&self) -> bool {
        tokio::process::Command::new("pgrep")
            .args(["-f", &self.config_path.to_string_lossy()])
            .status()
            .await
            .is_ok_and(|status| status.success())
    }

    /// Signal and reap the running process, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be killed.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), AppError> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };
        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill rathole process");
        }
        let _ = child.wait().await;
        let _ = tokio::fs::remove_file(&self.pid_path).await;
        Ok(())
    }

    /// `stop()` followed by `start()`.
    ///
    /// # Errors
    ///
    /// Returns an error if either phase fails.
    pub async fn restart(&self) -> Result<(), AppError> {
        self.stop().await?;
        self.start().await
    }

    /// Current running state, pid, service count, and last recorded
    /// error.
    pub async fn status(&self) -> Result<RatholeStatus, AppError> {
        let pid = self.child.lock().await.as_ref().and_then(Child::id);
        let service_count = self.list_services().await?.len();
        Ok(RatholeStatus {
            running: pid.is_some(),
            pid,
            service_count,
            last_error: self.last_error.lock().await.clone(),
        })
    }

    /// Tail the last `lines` lines of the log file (N clamped to
    /// `[1, 1000]` by `LogTailLines`).
    ///
    /// # Errors
    ///
    /// Returns an error if the log file cannot be read.
    pub async fn tail_log(&self, lines: usize) -> Result<String, AppError> {
        let content = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(AppError::from(e)),
        };
        let all_lines: Vec<&str> = content.lines().collect();
        let start = all_lines.len().saturating_sub(lines);
        Ok(all_lines[start..].join("\n"))
    }

    /// Server-side TOML skeleton and install script, exported verbatim.
    ///
    /// # Errors
    ///
    /// Returns an error if the config or service list cannot be read.
    pub async fn server_config(&self) -> Result<(String, String), AppError> {
        let config = self.config().await?;
        let services = self.list_services().await?;
        let toml = generate_server_toml(&config.server_addr, &services);
        let script = generate_install_script(&config.server_addr, &services);
        Ok((toml, script))
    }
}

fn row_to_service(row: Vec<String>) -> Option<RatholeService> {
    Some(RatholeService {
        id: row.first()?.parse().ok()?,
        name: row.get(1)?.clone(),
        token: row.get(2)?.clone(),
        local_addr: row.get(3)?.clone(),
        enabled: row.get(4)?.as_str() == "1",
        created_at: row.get(5)?.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_service() -> RatholeService {
        RatholeService {
            id: 1,
            name: "web".to_string(),
            token: "t1".to_string(),
            local_addr: "127.0.0.1:80".to_string(),
            enabled: true,
            created_at: 0,
        }
    }

    #[test]
    fn generates_the_exact_documented_client_toml() {
        let toml = generate_client_toml("198.51.100.5:2333", std::slice::from_ref(&sample_service()));
        assert_eq!(
            toml,
            "[client]\nremote_addr = \"198.51.100.5:2333\"\n\n[client.services.web]\ntoken = \"t1\"\nlocal_addr = \"127.0.0.1:80\"\n"
        );
    }

    #[test]
    fn disabled_services_are_excluded_from_the_client_toml() {
        let mut disabled = sample_service();
        disabled.enabled = false;
        let toml = generate_client_toml("198.51.100.5:2333", &[disabled]);
        assert!(!toml.contains("[client.services"));
    }

    #[test]
    fn server_toml_extracts_port_and_assigns_from_9000() {
        let toml = generate_server_toml("198.51.100.5:2333", std::slice::from_ref(&sample_service()));
        assert!(toml.contains("bind_addr = \"[::]:2333\""));
        assert!(toml.contains("bind_addr = \"0.0.0.0:9000\""));
    }

    #[test]
    fn validate_service_name_rejects_non_ascii_and_empty() {
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name("café").is_err());
        assert!(validate_service_name("web-1").is_ok());
    }
}
