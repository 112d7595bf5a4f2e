//! Modem component: AT execution, network-mode/SIM-slot control, signal
//! strength, and the vendor `+SPENGMD` cell-table tokenizer.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::bus::BusClient;
use crate::domain_types::{DomainTypeError, NetworkMode, NetworkStatus, SignalPercent, Slot};
use crate::error::AppError;

/// Index-stable `TechnologyPreference` values exposed by the cellular
/// daemon.
pub const TECHNOLOGY_PREFERENCES: [&str; 11] = [
    "wcdma_preferred",
    "gsm_only",
    "wcdma_only",
    "gsm_wcdma_auto",
    "lte_gsm_wcdma_auto",
    "lte_only",
    "lte_wcdma_auto",
    "nr5g_lte_gsm_wcdma_auto",
    "nr5g_only",
    "nr5g_lte_auto",
    "nsa_only",
];

const AT_TIMEOUT: Duration = Duration::from_secs(8);
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Live modem snapshot, cached for at most 1 s by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemInfo {
    /// `slot`.
    pub slot: Slot,
    /// `mode`.
    pub mode: NetworkMode,
    /// `signal_pct`.
    pub signal_pct: SignalPercent,
    /// `signal_dbm`.
    pub signal_dbm: i32,
    /// `network_status`.
    pub network_status: NetworkStatus,
    /// `technology`.
    pub technology: String,
    /// `band`.
    pub band: i32,
    /// `iccid`.
    pub iccid: String,
    /// `imei`.
    pub imei: String,
    /// `imsi`.
    pub imsi: String,
}

/// Decoded cell measurement row (band, ARFCN, PCI, RSRP, RSRQ, SINR).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRow {
    /// `band`.
    pub band: String,
    /// `arfcn`.
    pub arfcn: String,
    /// `pci`.
    pub pci: String,
    /// `rsrp`.
    pub rsrp: f64,
    /// `rsrq`.
    pub rsrq: f64,
    /// `sinr`.
    pub sinr: f64,
}

/// Parsed `+SPENGMD` response: up to 34 4G rows and 16 5G rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellTable {
    /// `lte`.
    pub lte: Vec<CellRow>,
    /// `nr`.
    pub nr: Vec<CellRow>,
}

/// Current serving cell, as exposed by `GET /api/current_band`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurrentBand {
    /// `network_type`.
    pub network_type: String,
    /// `band`.
    pub band: String,
    /// `arfcn`.
    pub arfcn: String,
    /// `pci`.
    pub pci: String,
    /// `rsrp`.
    pub rsrp: f64,
    /// `rsrq`.
    pub rsrq: f64,
    /// `sinr`.
    pub sinr: f64,
}

/// AT execution, signal, and network-mode control.
pub struct Modem {
    bus: BusClient,
    modem_path: Mutex<String>,
    /// Serialises every `execute_at` call; this is
    /// the one lock held across the bus call itself.
    at_mutex: Arc<Mutex<()>>,
}

impl Modem {
    #[must_use]
    /// `new`.
    pub fn new(bus: BusClient, modem_path: impl Into<String>) -> Self {
        Self {
            bus,
            modem_path: Mutex::new(modem_path.into()),
            at_mutex: Arc::new(Mutex::new(())),
        }
    }

    /// Execute a raw `AT` command, enforcing the `AT` prefix
    /// case-insensitively, serialised across all callers, 8 s timeout,
    /// one retry on "connection closed" (after re-establishing the proxy)
    /// and on "operation already in progress" (after a 500 ms backoff).
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` if `cmd` lacks the `AT` prefix,
    /// or `AppError::Unavailable` if both attempts fail.
    #[instrument(skip(self))]
    pub async fn execute_at(&self, cmd: &str) -> Result<String, AppError> {
        if cmd.len() < 2 || !cmd[..2].eq_ignore_ascii_case("at") {
            return Err(AppError::InvalidArgument(
                "AT command must start with AT".to_string(),
            ));
        }

        let _guard = self.at_mutex.lock().await;
        match self.try_execute_at_once(cmd).await {
            Ok(reply) => Ok(reply),
            Err(e) if is_connection_closed(&e) => {
                warn!("AT connection closed, reinitialising and retrying once");
                self.try_execute_at_once(cmd).await.map_err(Into::into)
            }
            Err(e) if is_in_progress(&e) => {
                tokio::time::sleep(RETRY_BACKOFF).await;
                self.try_execute_at_once(cmd).await.map_err(Into::into)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn try_execute_at_once(&self, cmd: &str) -> Result<String, zbus::Error> {
        let path = self.modem_path.lock().await.clone();
        let args = (cmd,);
        let call = self
            .bus
            .call_method::<_, String>(&path, "org.ofono.RadioSettings", "SendAtcmd", &args);
        timeout(AT_TIMEOUT, call)
            .await
            .map_err(|_| zbus::Error::Unsupported)?
    }

    /// Set the network-mode preference, optionally switching slot first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the bus call fails.
    #[instrument(skip(self))]
    pub async fn set_network_mode(
        &self,
        slot: Option<Slot>,
        mode: NetworkMode,
    ) -> Result<(), AppError> {
        if let Some(slot) = slot {
            self.switch_slot(slot).await?;
        }
        let path = self.modem_path.lock().await.clone();
        self.bus
            .set_property(
                &path,
                "org.ofono.RadioSettings",
                "TechnologyPreference",
                zbus::zvariant::Value::from(mode.technology_preference()),
            )
            .await
            .map_err(AppError::from)
    }

    /// Switch the active SIM slot via the `Manager`'s bespoke
    /// `SetDataCard` method (not the generic `SetProperty` convention).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the bus call fails.
    pub async fn switch_slot(&self, slot: Slot) -> Result<(), AppError> {
        self.bus
            .call_method::<_, ()>("/", "org.ofono.Manager", "SetDataCard", &(slot.as_str(),))
            .await
            .map_err(AppError::from)
    }

    /// The currently active SIM slot, via the `Manager`'s bespoke
    /// `GetDataCard` method.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the bus call fails or the reply
    /// doesn't name a known slot.
    pub async fn current_slot(&self) -> Result<Slot, AppError> {
        let reply: String = self
            .bus
            .call_method("/", "org.ofono.Manager", "GetDataCard", &())
            .await
            .map_err(AppError::from)?;
        Slot::parse(&reply).map_err(AppError::from)
    }

    /// Enable or disable airplane (radio-off) mode.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the bus call fails.
    pub async fn set_airplane(&self, enabled: bool) -> Result<(), AppError> {
        let path = self.modem_path.lock().await.clone();
        self.bus
            .set_property(
                &path,
                "org.ofono.Modem",
                "Powered",
                zbus::zvariant::Value::from(!enabled),
            )
            .await
            .map_err(AppError::from)
    }

    /// Fetch a live modem info snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if any of the underlying bus calls
    /// fail.
    pub async fn get_info(&self) -> Result<ModemInfo, AppError> {
        let path = self.modem_path.lock().await.clone();
        let props = self
            .bus
            .get_properties(&path, "org.ofono.Modem")
            .await
            .map_err(AppError::from)?;

        let signal_pct = props
            .get("SignalStrength")
            .and_then(|v| i64::try_from(v.try_clone().ok()?).ok())
            .and_then(|v| u8::try_from(v).ok())
            .and_then(|v| SignalPercent::try_new(v).ok())
            .unwrap_or_default();

        let status = props
            .get("Status")
            .and_then(|v| String::try_from(v.try_clone().ok()?).ok())
            .map(|s| NetworkStatus::parse(&s))
            .unwrap_or(NetworkStatus::Unknown);

        let string_prop = |key: &str| {
            props
                .get(key)
                .and_then(|v| String::try_from(v.try_clone().ok()?).ok())
                .unwrap_or_default()
        };

        let slot = self.current_slot().await?;

        let radio_props = self
            .bus
            .get_properties(&path, "org.ofono.RadioSettings")
            .await
            .map_err(AppError::from)?;
        let mode = radio_props
            .get("TechnologyPreference")
            .and_then(|v| String::try_from(v.try_clone().ok()?).ok())
            .and_then(|s| NetworkMode::from_technology_preference(&s))
            .unwrap_or(NetworkMode::Auto);

        let band = self.current_band().await?;

        Ok(ModemInfo {
            slot,
            mode,
            signal_pct,
            signal_dbm: strength_to_dbm(signal_pct),
            network_status: status,
            technology: band.network_type,
            band: band.band.parse().unwrap_or(0),
            iccid: string_prop("SimIccid"),
            imei: string_prop("Serial"),
            imsi: string_prop("SubscriberIdentity"),
        })
    }

    /// Fetch and parse the currently serving cell's measurements.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` if the bus call fails.
    pub async fn current_band(&self) -> Result<CurrentBand, AppError> {
        let path = self.modem_path.lock().await.clone();
        let reply: String = self
            .bus
            .call_method(&path, "org.ofono.NetworkMonitor", "GetServingCellInformation", &())
            .await
            .map_err(AppError::from)?;
        let table = Self::parse_cell_table(&reply);
        if let Some(cell) = table.nr.first() {
            return Ok(CurrentBand {
                network_type: "nr5g".to_string(),
                band: cell.band.clone(),
                arfcn: cell.arfcn.clone(),
                pci: cell.pci.clone(),
                rsrp: cell.rsrp,
                rsrq: cell.rsrq,
                sinr: cell.sinr,
            });
        }
        if let Some(cell) = table.lte.first() {
            return Ok(CurrentBand {
                network_type: "lte".to_string(),
                band: cell.band.clone(),
                arfcn: cell.arfcn.clone(),
                pci: cell.pci.clone(),
                rsrp: cell.rsrp,
                rsrq: cell.rsrq,
                sinr: cell.sinr,
            });
        }
        Ok(CurrentBand::default())
    }

    /// Parse a vendor `+SPENGMD` AT response into a 4G/5G cell table.
    ///
    /// # Errors
    ///
    /// Returns `DomainTypeError`-shaped parse failures are treated as an
    /// empty table rather than a hard error: a malformed reply from the
    /// modem should not take down the endpoint, only leave readings blank.
    #[must_use]
    pub fn parse_cell_table(at_response: &str) -> CellTable {
        let rows = tokenize_rows(at_response);
        let mut table = CellTable::default();

        for (i, row) in rows.iter().enumerate() {
            if row.len() < 6 {
                continue;
            }
            let cell = CellRow {
                band: row[0].clone(),
                arfcn: row[1].clone(),
                pci: row[2].clone(),
                rsrp: row[3].parse::<f64>().unwrap_or(0.0) / 100.0,
                rsrq: row[4].parse::<f64>().unwrap_or(0.0) / 100.0,
                sinr: row[5].parse::<f64>().unwrap_or(0.0) / 100.0,
            };
            if i < 34 && table.lte.len() < 34 {
                table.lte.push(cell);
            } else if i < 34 + 16 && table.nr.len() < 16 {
                table.nr.push(cell);
            }
        }

        table
    }
}

/// `dBm = -113 + 2*S`.
#[must_use]
pub fn strength_to_dbm(s: SignalPercent) -> i32 {
    -113 + 2 * i32::from(s.into_inner())
}

/// Tokenize the raw `+SPENGMD` reply into a row-major string matrix,
/// honouring the vendor's row/terminator quirks:
/// - strip a trailing `OK` and all CR/LF,
/// - a lone `-` terminates the current row,
/// - `--` also terminates a row but the second `-` starts the next one,
/// - `,-` inside a row is a negative-sign literal, not a terminator,
/// - fields are comma-separated and whitespace-trimmed.
fn tokenize_rows(input: &str) -> Vec<Vec<String>> {
    let cleaned = input
        .trim()
        .trim_end_matches("OK")
        .replace(['\r', '\n'], "");

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut current_row = String::new();
    let chars: Vec<char> = cleaned.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '-' {
            let prev_is_comma = i > 0 && chars[i - 1] == ',';
            if prev_is_comma {
                // `,-` is a negative-sign literal inside the current field.
                current_row.push(c);
                i += 1;
                continue;
            }
            // Lone `-` or leading `-` of `--`: terminate the current row.
            rows.push(split_row(&current_row));
            current_row.clear();
            if i + 1 < chars.len() && chars[i + 1] == '-' {
                // `--`: second `-` starts the next row, consume both.
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }
        current_row.push(c);
        i += 1;
    }

    if !current_row.trim().is_empty() {
        rows.push(split_row(&current_row));
    }

    rows.into_iter().filter(|r| !r.is_empty()).take(64).collect()
}

fn split_row(row: &str) -> Vec<String> {
    row.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .take(16)
        .collect()
}

fn is_connection_closed(err: &zbus::Error) -> bool {
    matches!(err, zbus::Error::InputOutput(_))
}

fn is_in_progress(err: &zbus::Error) -> bool {
    matches!(err, zbus::Error::MethodError(name, _, _) if name.as_str().ends_with("InProgress"))
}

impl From<DomainTypeError> for AppError {
    fn from(e: DomainTypeError) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strength_to_dbm_follows_the_linear_formula() {
        assert_eq!(strength_to_dbm(SignalPercent::try_new(0).unwrap()), -113);
        assert_eq!(strength_to_dbm(SignalPercent::try_new(50).unwrap()), -13);
        assert_eq!(strength_to_dbm(SignalPercent::try_new(100).unwrap()), 87);
    }

    #[test]
    fn tokenizer_splits_on_lone_dash() {
        let rows = tokenize_rows("3,100,50,-9000,-1200,1500-4,200,60,-8000,-1100,1400OK");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["3", "100", "50", "-9000", "-1200", "1500"]);
        assert_eq!(rows[1], vec!["4", "200", "60", "-8000", "-1100", "1400"]);
    }

    #[test]
    fn tokenizer_treats_comma_dash_as_literal_sign() {
        let rows = tokenize_rows("3,100,50,-9000,-1200,1500");
        assert_eq!(rows[0][3], "-9000");
    }

    #[test]
    fn tokenizer_handles_double_dash_row_boundary() {
        let rows = tokenize_rows("1,2,3,4,5,6--7,8,9,10,11,12");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], "7");
    }

    #[test]
    fn parse_cell_table_divides_rsrp_rsrq_sinr_by_100() {
        let table = Modem::parse_cell_table("3,100,50,-9000,-1200,1500");
        assert_eq!(table.lte.len(), 1);
        assert!((table.lte[0].rsrp - (-90.0)).abs() < f64::EPSILON);
        assert!((table.lte[0].rsrq - (-12.0)).abs() < f64::EPSILON);
        assert!((table.lte[0].sinr - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn technology_preference_index_matches_the_documented_table() {
        assert_eq!(NetworkMode::Auto.technology_preference_index(), 7);
        assert_eq!(NetworkMode::Nr5gOnly.technology_preference_index(), 8);
        assert_eq!(NetworkMode::LteOnly.technology_preference_index(), 5);
        assert_eq!(NetworkMode::NsaOnly.technology_preference_index(), 10);
    }
}
