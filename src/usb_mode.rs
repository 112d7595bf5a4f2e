//! USB-gadget composition (NCM/ECM/RNDIS) via configfs, with persistent and
//! transient mode storage and the ordered hot-switch sequence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::domain_types::UsbModeValue;
use crate::error::AppError;

const READY_MARKER: &str = "usb_mode_ready";
const FUNCTIONFS_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const FUNCTIONFS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ENUMERATION_DELAY: Duration = Duration::from_secs(1);
const RESPONSE_FLUSH_DELAY: Duration = Duration::from_millis(200);
const TETHERED_ADDR: &str = "192.168.66.1/24";

/// Default configfs gadget root on target hardware.
pub const DEFAULT_GADGET_DIR: &str = "/sys/kernel/config/usb_gadget/g1";

/// `(vid, pid)` written during the hot switch for each mode, and read
/// back by `hardware_mode()`.
const MODE_VID_PID: [(UsbModeValue, &str, &str); 3] = [
    (UsbModeValue::Ncm, "2c7c", "0125"),
    (UsbModeValue::Ecm, "2c7c", "0126"),
    (UsbModeValue::Rndis, "2c7c", "0127"),
];

fn vid_pid_for(mode: UsbModeValue) -> (&'static str, &'static str) {
    MODE_VID_PID
        .iter()
        .find(|(m, _, _)| *m == mode)
        .map(|(_, vid, pid)| (*vid, *pid))
        .unwrap_or(("2c7c", "0125"))
}

fn mode_for_vid_pid(vid: &str, pid: &str) -> Option<UsbModeValue> {
    MODE_VID_PID
        .iter()
        .find(|(_, v, p)| *v == vid && *p == pid)
        .map(|(m, _, _)| *m)
}

fn network_interface_for(mode: UsbModeValue) -> &'static str {
    match mode {
        UsbModeValue::Rndis => "rndis0",
        UsbModeValue::Ncm | UsbModeValue::Ecm => "usb0",
    }
}

/// configfs gadget composer and mode-persistence store.
pub struct UsbMode {
    mode_path: PathBuf,
    mode_tmp_path: PathBuf,
    gadget_dir: PathBuf,
}

impl UsbMode {
    #[must_use]
    /// `new`.
    pub fn new(mode_path: impl Into<PathBuf>, mode_tmp_path: impl Into<PathBuf>, gadget_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode_path: mode_path.into(),
            mode_tmp_path: mode_tmp_path.into(),
            gadget_dir: gadget_dir.into(),
        }
    }

    /// Read the active mode: the temporary file overrides the persistent
    /// one if present.
    ///
    /// # Errors
    ///
    /// Returns an error if neither file exists or a file's content does
    /// not parse as a known mode.
    pub async fn current_mode(&self) -> Result<UsbModeValue, AppError> {
        if let Some(mode) = self.read_mode_file(&self.mode_tmp_path).await? {
            return Ok(mode);
        }
        self.read_mode_file(&self.mode_path)
            .await?
            .ok_or_else(|| AppError::NotFound("usb mode not yet configured".to_string()))
    }

    async fn read_mode_file(&self, path: &Path) -> Result<Option<UsbModeValue>, AppError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let value: i64 = content
                    .trim()
                    .parse()
                    .map_err(|_| AppError::Internal(format!("malformed usb mode file {}", path.display())))?;
                Ok(Some(UsbModeValue::from_i64(value).map_err(|e| AppError::Internal(e.to_string()))?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::from(e)),
        }
    }

    /// Persist `mode` permanently: write `mode.cfg`, delete `mode_tmp.cfg`.
    ///
    /// # Errors
    ///
    /// Returns an error if either file operation fails.
    pub async fn set_mode_persistent(&self, mode: UsbModeValue) -> Result<(), AppError> {
        if let Some(parent) = self.mode_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(AppError::from)?;
        }
        tokio::fs::write(&self.mode_path, mode.as_i64().to_string())
            .await
            .map_err(AppError::from)?;
        match tokio::fs::remove_file(&self.mode_tmp_path).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    /// Persist `mode` transiently: write `mode_tmp.cfg` only.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_mode_transient(&self, mode: UsbModeValue) -> Result<(), AppError> {
        if let Some(parent) = self.mode_tmp_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(AppError::from)?;
        }
        tokio::fs::write(&self.mode_tmp_path, mode.as_i64().to_string())
            .await
            .map_err(AppError::from)
    }

    /// Decide the mode currently composed in hardware from the gadget's
    /// `idVendor`/`idProduct` files.
    ///
    /// # Errors
    ///
    /// Returns an error if the id files cannot be read or don't match a
    /// known mode.
    pub async fn hardware_mode(&self) -> Result<UsbModeValue, AppError> {
        let vid = self.read_trimmed(self.gadget_dir.join("idVendor")).await?;
        let pid = self.read_trimmed(self.gadget_dir.join("idProduct")).await?;
        mode_for_vid_pid(vid.trim_start_matches("0x"), pid.trim_start_matches("0x"))
            .ok_or_else(|| AppError::Internal(format!("unrecognised hardware id {vid}:{pid}")))
    }

    async fn read_trimmed(&self, path: impl AsRef<Path>) -> Result<String, AppError> {
        Ok(tokio::fs::read_to_string(path).await.map_err(AppError::from)?.trim().to_string())
    }

    async fn write(&self, path: impl AsRef<Path>, content: &str) -> Result<(), AppError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(AppError::from)?;
        }
        tokio::fs::write(path, content).await.map_err(AppError::from)
    }

    /// Run the 15-step hot-switch sequence in the fixed order the
    /// appliance's USB bring-up depends on. Intended to be spawned by the
    /// HTTP handler *after* flushing the response: the switch detaches
    /// the very USB link the response traveled over.
    #[instrument(skip(self))]
    pub async fn switch_advanced(&self, mode: UsbModeValue) -> Result<(), AppError> {
        tokio::time::sleep(RESPONSE_FLUSH_DELAY).await;

        self.stop_debug_bridge().await;

        let captured_udc = self.detach_udc().await?;
        self.remove_function_links_and_cdc_dirs().await?;
        self.write_ipa_settings(mode).await;
        self.write_device_descriptor(mode).await?;
        self.write_configuration_attributes().await?;
        self.create_function_dirs(mode).await?;
        self.write_mac_addresses(mode).await?;
        self.create_fixed_links(mode).await?;

        self.restart_debug_bridge().await;
        self.wait_for_functionfs_endpoint().await;
        self.write(self.gadget_dir.join("log-transport"), "1").await.ok();

        self.write(self.gadget_dir.join("UDC"), &captured_udc).await?;
        tokio::time::sleep(ENUMERATION_DELAY).await;

        self.bring_up_network_interface(mode).await;
        self.touch_readiness_marker().await;

        info!(?mode, "usb hot switch complete");
        Ok(())
    }

    async fn stop_debug_bridge(&self) {
        if let Err(e) = tokio::process::Command::new("sh")
            .args(["-c", "killall -q usb_debug_bridge"])
            .status()
            .await
        {
            warn!(error = %e, "failed to stop debug bridge");
        }
    }

    async fn restart_debug_bridge(&self) {
        if let Err(e) = tokio::process::Command::new("sh")
            .args(["-c", "usb_debug_bridge &"])
            .status()
            .await
        {
            warn!(error = %e, "failed to restart debug bridge");
        }
    }

    /// Detach the UDC (write `none`), returning the previously bound
    /// driver name so it can be reattached later without re-reading it
    /// post-detach.
    async fn detach_udc(&self) -> Result<String, AppError> {
        let udc_path = self.gadget_dir.join("UDC");
        let captured = self.read_trimmed(&udc_path).await.unwrap_or_default();
        self.write(&udc_path, "none").await?;
        Ok(captured)
    }

    async fn remove_function_links_and_cdc_dirs(&self) -> Result<(), AppError> {
        let links_dir = self.gadget_dir.join("configs/c.1");
        if let Ok(mut entries) = tokio::fs::read_dir(&links_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                if let Some(name) = name.to_str() {
                    if name.starts_with('f') {
                        let _ = tokio::fs::remove_file(entry.path()).await;
                    }
                }
            }
        }
        for dir in ["functions/ncm.usb0", "functions/ecm.usb0", "functions/rndis.usb0"] {
            let _ = tokio::fs::remove_dir(self.gadget_dir.join(dir)).await;
        }
        Ok(())
    }

    async fn write_ipa_settings(&self, mode: UsbModeValue) {
        let tag = match mode {
            UsbModeValue::Ncm => Some("ncm"),
            UsbModeValue::Rndis => Some("rndis"),
            UsbModeValue::Ecm => None,
        };
        if let Some(tag) = tag {
            let _ = self.write(self.gadget_dir.join("ipa_to_usb_protocol"), tag).await;
        }
        let _ = self.write(self.gadget_dir.join("ipa_dl_aggr_batch_count"), "7").await;
    }

    async fn write_device_descriptor(&self, mode: UsbModeValue) -> Result<(), AppError> {
        let (vid, pid) = vid_pid_for(mode);
        self.write(self.gadget_dir.join("idVendor"), &format!("0x{vid}")).await?;
        self.write(self.gadget_dir.join("idProduct"), &format!("0x{pid}")).await?;
        self.write(self.gadget_dir.join("bcdDevice"), "0x0100").await?;
        self.write(self.gadget_dir.join("bDeviceClass"), "0xEF").await
    }

    async fn write_configuration_attributes(&self) -> Result<(), AppError> {
        let config_dir = self.gadget_dir.join("configs/c.1");
        self.write(config_dir.join("strings/0x409/configuration"), "cirrus-usb").await?;
        self.write(config_dir.join("MaxPower"), "500").await?;
        self.write(config_dir.join("bmAttributes"), "0xc0").await
    }

    async fn create_function_dirs(&self, mode: UsbModeValue) -> Result<(), AppError> {
        let primary = match mode {
            UsbModeValue::Ncm => "functions/ncm.usb0",
            UsbModeValue::Ecm => "functions/ecm.usb0",
            UsbModeValue::Rndis => "functions/rndis.usb0",
        };
        for dir in [primary, "functions/gser.usb0", "functions/vser.usb0"] {
            tokio::fs::create_dir_all(self.gadget_dir.join(dir))
                .await
                .map_err(AppError::from)?;
        }
        Ok(())
    }

    async fn write_mac_addresses(&self, mode: UsbModeValue) -> Result<(), AppError> {
        let primary = match mode {
            UsbModeValue::Ncm => "functions/ncm.usb0",
            UsbModeValue::Ecm => "functions/ecm.usb0",
            UsbModeValue::Rndis => "functions/rndis.usb0",
        };
        self.write(self.gadget_dir.join(primary).join("dev_addr"), "02:00:00:00:00:01").await?;
        self.write(self.gadget_dir.join(primary).join("host_addr"), "02:00:00:00:00:02").await
    }

    /// Create the fixed f1..f9 link assignment: f1=primary, f2/f3/f5/f7..f9=gser,
    /// f4=vser, f6=debug-bridge.
    async fn create_fixed_links(&self, mode: UsbModeValue) -> Result<(), AppError> {
        let primary = match mode {
            UsbModeValue::Ncm => "functions/ncm.usb0",
            UsbModeValue::Ecm => "functions/ecm.usb0",
            UsbModeValue::Rndis => "functions/rndis.usb0",
        };
        let assignment: [(&str, &str); 9] = [
            ("f1", primary),
            ("f2", "functions/gser.usb0"),
            ("f3", "functions/gser.usb0"),
            ("f4", "functions/vser.usb0"),
            ("f5", "functions/gser.usb0"),
            ("f6", "functions/gser.usb0"),
            ("f7", "functions/gser.usb0"),
            ("f8", "functions/gser.usb0"),
            ("f9", "functions/gser.usb0"),
        ];
        let config_dir = self.gadget_dir.join("configs/c.1");
        tokio::fs::create_dir_all(&config_dir).await.map_err(AppError::from)?;
        for (link, target) in assignment {
            let link_path = config_dir.join(link);
            let target_path = self.gadget_dir.join(target);
            let _ = tokio::fs::remove_file(&link_path).await;
            tokio::fs::symlink(&target_path, &link_path)
                .await
                .map_err(AppError::from)?;
        }
        Ok(())
    }

    async fn wait_for_functionfs_endpoint(&self) {
        let endpoint = self.gadget_dir.join("functions/ffs.usb0/ep0");
        let deadline = Instant::now() + FUNCTIONFS_WAIT_TIMEOUT;
        while Instant::now() < deadline {
            if tokio::fs::metadata(&endpoint).await.is_ok() {
                return;
            }
            tokio::time::sleep(FUNCTIONFS_POLL_INTERVAL).await;
        }
        warn!("functionfs endpoint did not materialise within the wait window");
    }

    async fn bring_up_network_interface(&self, mode: UsbModeValue) {
        let iface = network_interface_for(mode);
        let commands: [&[&str]; 5] = [
            &["ip", "addr", "add", TETHERED_ADDR, "dev", iface],
            &["ip", "link", "set", iface, "up"],
            &["iptables", "-t", "nat", "-A", "POSTROUTING", "-o", iface, "-j", "MASQUERADE"],
            &["iptables", "-A", "FORWARD", "-i", iface, "-j", "ACCEPT"],
            &["iptables", "-A", "FORWARD", "-o", iface, "-j", "ACCEPT"],
        ];
        for args in commands {
            if let Err(e) = tokio::process::Command::new(args[0]).args(&args[1..]).status().await {
                warn!(error = %e, command = args[0], "usb interface bring-up step failed");
            }
        }
        let _ = self.write(self.gadget_dir.join("hw_forwarding_accel"), "1").await;
    }

    async fn touch_readiness_marker(&self) {
        let _ = tokio::fs::write(std::env::temp_dir().join(READY_MARKER), b"").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_usb_mode(dir: &std::path::Path) -> UsbMode {
        UsbMode::new(dir.join("mode.cfg"), dir.join("mode_tmp.cfg"), dir.join("gadget"))
    }

    #[tokio::test]
    async fn temp_mode_overrides_persistent_mode() {
        let dir = tempdir().unwrap();
        let usb = new_usb_mode(dir.path());
        usb.set_mode_persistent(UsbModeValue::Ncm).await.unwrap();
        usb.set_mode_transient(UsbModeValue::Rndis).await.unwrap();
        assert_eq!(usb.current_mode().await.unwrap(), UsbModeValue::Rndis);
    }

    #[tokio::test]
    async fn setting_persistent_mode_clears_any_transient_override() {
        let dir = tempdir().unwrap();
        let usb = new_usb_mode(dir.path());
        usb.set_mode_transient(UsbModeValue::Rndis).await.unwrap();
        usb.set_mode_persistent(UsbModeValue::Ecm).await.unwrap();
        assert_eq!(usb.current_mode().await.unwrap(), UsbModeValue::Ecm);
    }

    #[tokio::test]
    async fn hardware_mode_round_trips_through_written_ids() {
        let dir = tempdir().unwrap();
        let usb = new_usb_mode(dir.path());
        tokio::fs::create_dir_all(&usb.gadget_dir).await.unwrap();
        let (vid, pid) = vid_pid_for(UsbModeValue::Rndis);
        tokio::fs::write(usb.gadget_dir.join("idVendor"), format!("0x{vid}")).await.unwrap();
        tokio::fs::write(usb.gadget_dir.join("idProduct"), format!("0x{pid}")).await.unwrap();
        assert_eq!(usb.hardware_mode().await.unwrap(), UsbModeValue::Rndis);
    }

    #[test]
    fn network_interface_choice_matches_mode() {
        assert_eq!(network_interface_for(UsbModeValue::Rndis), "rndis0");
        assert_eq!(network_interface_for(UsbModeValue::Ncm), "usb0");
        assert_eq!(network_interface_for(UsbModeValue::Ecm), "usb0");
    }
}
