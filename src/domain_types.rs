//! Domain types for `cirrusd`.
//!
//! Strongly-typed, validated wrappers around the primitive values that flow
//! through the HTTP surface and into `Store`, following the same
//! `nutype`-based approach the platform uses elsewhere to keep primitive
//! obsession out of the domain layer.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A TCP/UDP port number, as used by IPv6 forwarding rules and rathole
/// service addresses.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 65535),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        Display, TryFrom, Into
    )
)]
pub struct PortNumber(u16);

impl PortNumber {
    /// Value as `u16`.
    #[must_use]
    pub fn as_u16(&self) -> u16 {
        self.into_inner()
    }
}

/// Signal strength as a percentage, 0..=100.
#[nutype(
    validate(less_or_equal = 100),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Default, TryFrom, Into),
    default = 0
)]
pub struct SignalPercent(u8);

/// Maximum number of retained inbound SMS messages, 10..=150.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 150),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Default, TryFrom, Into),
    default = 50
)]
pub struct MaxInbox(u32);

impl MaxInbox {
    /// Value as `i64` for use in SQL row-count comparisons.
    #[must_use]
    pub fn as_i64(&self) -> i64 {
        i64::from(self.into_inner())
    }
}

/// Maximum number of retained sent-SMS records, 1..=50.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 50),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Default, TryFrom, Into),
    default = 10
)]
pub struct MaxSent(u32);

impl MaxSent {
    /// Value as `i64` for use in SQL row-count comparisons.
    #[must_use]
    pub fn as_i64(&self) -> i64 {
        i64::from(self.into_inner())
    }
}

/// `SQLite` connection pool size, 1..=1000.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Default, TryFrom, Into),
    default = 5
)]
pub struct ConnectionPoolSize(u32);

/// IPv6 address-report interval in minutes, 1..=1440.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1440),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct SendIntervalMinutes(u32);

impl SendIntervalMinutes {
    /// Value as a [`std::time::Duration`].
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.into_inner()) * 60)
    }
}

/// Number of rathole log lines to tail, 1..=1000.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Default, TryFrom, Into),
    default = 100
)]
pub struct LogTailLines(u32);

impl LogTailLines {
    /// Value as `usize`.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner() as usize
    }
}

/// Maximum number of APN templates that may be persisted.
pub const MAX_APN_TEMPLATES: i64 = 16;
/// Maximum number of IPv6 forwarding rules that may be persisted.
pub const MAX_IPV6_RULES: i64 = 10;
/// Maximum number of rathole services that may be persisted.
pub const MAX_RATHOLE_SERVICES: i64 = 16;
/// Capacity of the in-memory SMS webhook delivery log ring.
pub const SMS_WEBHOOK_LOG_CAPACITY: usize = 100;
/// Capacity of the in-memory IPv6 address-report log ring.
pub const IPV6_SEND_LOG_CAPACITY: usize = 30;

/// SIM front-end slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    /// First SIM slot.
    Slot1,
    /// Second SIM slot.
    Slot2,
}

impl Slot {
    /// Parse from the wire strings `slot1`/`slot2`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is neither `slot1` nor `slot2`.
    pub fn parse(s: &str) -> Result<Self, DomainTypeError> {
        match s {
            "slot1" => Ok(Self::Slot1),
            "slot2" => Ok(Self::Slot2),
            other => Err(DomainTypeError::InvalidEnumValue {
                field: "slot".to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slot1 => "slot1",
            Self::Slot2 => "slot2",
        }
    }
}

/// Network-mode preference as accepted by the HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Automatic technology selection.
    Auto,
    /// NR 5G only.
    Nr5gOnly,
    /// LTE only.
    LteOnly,
    /// NSA (5G non-standalone) only.
    NsaOnly,
}

impl NetworkMode {
    /// Parse from the wire string used by `/api/set_network`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string does not match a known mode.
    pub fn parse(s: &str) -> Result<Self, DomainTypeError> {
        match s {
            "auto" => Ok(Self::Auto),
            "nr5g_only" => Ok(Self::Nr5gOnly),
            "lte_only" => Ok(Self::LteOnly),
            "nsa_only" => Ok(Self::NsaOnly),
            other => Err(DomainTypeError::InvalidEnumValue {
                field: "mode".to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// Index into the cellular daemon's 11-value `TechnologyPreference`
    /// string enum: [wcdma_preferred, gsm_only, wcdma_only,
    /// gsm_wcdma_auto, lte_gsm_wcdma_auto, lte_only, lte_wcdma_auto,
    /// nr5g_lte_gsm_wcdma_auto, nr5g_only, nr5g_lte_auto, nsa_only].
    #[must_use]
    pub fn technology_preference_index(self) -> usize {
        match self {
            Self::Auto => 7,
            Self::LteOnly => 5,
            Self::Nr5gOnly => 8,
            Self::NsaOnly => 10,
        }
    }

    /// The raw string this mode maps onto in the daemon's enum.
    #[must_use]
    pub fn technology_preference(self) -> &'static str {
        crate::modem::TECHNOLOGY_PREFERENCES[self.technology_preference_index()]
    }

    /// Reverse of [`Self::technology_preference`]: map a value read back
    /// from `RadioSettings.TechnologyPreference` onto the `NetworkMode` it
    /// was set from, when it is one of the four modes exposed over HTTP.
    #[must_use]
    pub fn from_technology_preference(s: &str) -> Option<Self> {
        [Self::Auto, Self::LteOnly, Self::Nr5gOnly, Self::NsaOnly]
            .into_iter()
            .find(|mode| mode.technology_preference() == s)
    }
}

/// USB gadget composition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum UsbModeValue {
    /// CDC-NCM.
    Ncm = 1,
    /// CDC-ECM.
    Ecm = 2,
    /// RNDIS.
    Rndis = 3,
}

impl UsbModeValue {
    /// Parse from the persisted integer representation (1/2/3).
    ///
    /// # Errors
    ///
    /// Returns an error if `v` is outside `1..=3`.
    pub fn from_i64(v: i64) -> Result<Self, DomainTypeError> {
        match v {
            1 => Ok(Self::Ncm),
            2 => Ok(Self::Ecm),
            3 => Ok(Self::Rndis),
            other => Err(DomainTypeError::InvalidEnumValue {
                field: "usb_mode".to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// Parse from the HTTP API's tag strings (`cdc_ncm`, `cdc_ecm`, `rndis`).
    ///
    /// # Errors
    ///
    /// Returns an error if `s` does not match a known tag.
    pub fn from_tag(s: &str) -> Result<Self, DomainTypeError> {
        match s {
            "cdc_ncm" => Ok(Self::Ncm),
            "cdc_ecm" => Ok(Self::Ecm),
            "rndis" => Ok(Self::Rndis),
            other => Err(DomainTypeError::InvalidEnumValue {
                field: "usb_mode".to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// Persisted integer representation.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Registration status of the modem on the cellular network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    /// Not registered with any network.
    Unregistered,
    /// Registered on the home network.
    Registered,
    /// Registered while roaming.
    Roaming,
    /// Registration denied.
    Denied,
    /// Status could not be determined.
    Unknown,
}

impl NetworkStatus {
    /// Parse from the bus's `NetworkRegistration.Status` string.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "registered" => Self::Registered,
            "roaming" => Self::Roaming,
            "denied" => Self::Denied,
            "unregistered" => Self::Unregistered,
            _ => Self::Unknown,
        }
    }

    /// True if data service is usable in this state.
    #[must_use]
    pub fn is_registered(self) -> bool {
        matches!(self, Self::Registered | Self::Roaming)
    }
}

/// PDP context protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApnProtocol {
    /// IPv4 only.
    Ip,
    /// IPv6 only.
    Ipv6,
    /// Dual-stack.
    Dual,
}

/// PDP context authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// No authentication.
    None,
    /// PAP.
    Pap,
    /// CHAP.
    Chap,
}

/// PDP context class; only `internet` is managed by this daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    /// General-purpose internet access; the only type this daemon manages.
    Internet,
    /// MMS bearer.
    Mms,
    /// IMS bearer.
    Ims,
}

/// APN manual/auto selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApnConfigMode {
    /// Daemon selects the best internet context automatically.
    Auto,
    /// A specific template id is bound and applied.
    Manual,
}

impl ApnConfigMode {
    /// Persisted integer representation (auto=0, manual=1).
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Auto => 0,
            Self::Manual => 1,
        }
    }

    /// Parse from the persisted integer representation.
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        if v == 1 { Self::Manual } else { Self::Auto }
    }
}

/// Outcome of a sent SMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentSmsStatus {
    /// Delivered to the modem successfully.
    Sent,
    /// Delivery failed.
    Failed,
}

impl SentSmsStatus {
    /// Wire/storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// Errors raised while constructing or parsing domain types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainTypeError {
    /// A string field did not match any known enum value.
    #[error("invalid value for {field}: {value}")]
    InvalidEnumValue {
        /// Name of the field being parsed.
        field: String,
        /// The offending value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_number_rejects_zero_and_overflow() {
        assert!(PortNumber::try_new(0).is_err());
        assert!(PortNumber::try_new(65535).is_ok());
    }

    #[test]
    fn max_inbox_default_is_fifty() {
        assert_eq!(MaxInbox::default().into_inner(), 50);
    }

    #[test]
    fn network_mode_round_trips_known_strings() {
        for s in ["auto", "nr5g_only", "lte_only", "nsa_only"] {
            assert!(NetworkMode::parse(s).is_ok());
        }
        assert!(NetworkMode::parse("bogus").is_err());
    }

    #[test]
    fn technology_preference_round_trips_through_the_reverse_lookup() {
        for mode in [
            NetworkMode::Auto,
            NetworkMode::LteOnly,
            NetworkMode::Nr5gOnly,
            NetworkMode::NsaOnly,
        ] {
            let pref = mode.technology_preference();
            assert_eq!(NetworkMode::from_technology_preference(pref), Some(mode));
        }
        assert_eq!(
            NetworkMode::from_technology_preference("gsm_only"),
            None
        );
    }

    #[test]
    fn usb_mode_value_parses_tags_and_ints() {
        assert_eq!(UsbModeValue::from_tag("rndis").unwrap(), UsbModeValue::Rndis);
        assert_eq!(UsbModeValue::from_i64(1).unwrap(), UsbModeValue::Ncm);
        assert!(UsbModeValue::from_i64(4).is_err());
    }

    #[test]
    fn network_status_registered_or_roaming_counts_as_registered() {
        assert!(NetworkStatus::Registered.is_registered());
        assert!(NetworkStatus::Roaming.is_registered());
        assert!(!NetworkStatus::Denied.is_registered());
    }
}
