//! Bring-up and supervision settings.
//!
//! Built-in defaults match an RTL8723D on a 115200 baud boot UART. An optional
//! YAML file overrides any subset; command-line flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::framer::FramerConfig;
use crate::hci::CommandTimeouts;

pub const DEFAULT_DEVICE: &str = "/dev/ttyS5";
pub const DEFAULT_FIRMWARE_DIR: &str = "/lib/firmware/rtlbt/";
pub const DEFAULT_FIRMWARE_FILE: &str = "rtl8723d_fw.bin";
pub const DEFAULT_CONFIG_FILE: &str = "rtl8723d_config.bin";

/// Vendor opcodes and limits of the target controller.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VendorProfile {
    /// Enter (param 0x01) / leave and launch (param 0x00) download mode.
    pub download_mode_opcode: u16,
    pub download_opcode: u16,
    pub config_opcode: u16,
    pub baud_opcode: u16,
    pub sco_routing_opcode: u16,
    /// Largest patch fragment per download command.
    pub max_fragment: usize,
}

impl Default for VendorProfile {
    fn default() -> Self {
        Self {
            download_mode_opcode: 0xFC01,
            download_opcode: 0xFC20,
            config_opcode: 0xFC61,
            baud_opcode: 0xFC17,
            sco_routing_opcode: 0xFC1B,
            max_fragment: 252,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BringupConfig {
    pub device: String,
    pub initial_baud: u32,
    pub target_baud: u32,
    pub firmware_dir: PathBuf,
    pub firmware_file: String,
    pub config_file: String,
    /// Skip SYNC/CONFIG and assume the link is already active.
    pub skip_handshake: bool,
    pub handshake_timeout_ms: u64,
    pub control_timeout_ms: u64,
    pub download_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_retransmits: u32,
    pub speed_settle_ms: u64,
    pub post_reset_delay_ms: u64,
    /// LMP subversion reported once the patch is running; download is skipped when seen.
    pub patched_subversion: Option<u16>,
    pub route_sco_over_hci: bool,
}

impl Default for BringupConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            initial_baud: 115200,
            target_baud: 1_500_000,
            firmware_dir: PathBuf::from(DEFAULT_FIRMWARE_DIR),
            firmware_file: DEFAULT_FIRMWARE_FILE.to_string(),
            config_file: DEFAULT_CONFIG_FILE.to_string(),
            skip_handshake: false,
            handshake_timeout_ms: 2000,
            control_timeout_ms: 1000,
            download_timeout_ms: 3000,
            ack_timeout_ms: 250,
            max_retransmits: 3,
            speed_settle_ms: 50,
            post_reset_delay_ms: 1000,
            patched_subversion: None,
            route_sco_over_hci: true,
        }
    }
}

impl BringupConfig {
    pub fn firmware_path(&self) -> PathBuf {
        self.firmware_dir.join(&self.firmware_file)
    }

    pub fn config_path(&self) -> PathBuf {
        self.firmware_dir.join(&self.config_file)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn speed_settle(&self) -> Duration {
        Duration::from_millis(self.speed_settle_ms)
    }

    pub fn post_reset_delay(&self) -> Duration {
        Duration::from_millis(self.post_reset_delay_ms)
    }

    pub fn command_timeouts(&self) -> CommandTimeouts {
        CommandTimeouts {
            control: Duration::from_millis(self.control_timeout_ms),
            download: Duration::from_millis(self.download_timeout_ms),
        }
    }

    pub fn framer_config(&self) -> FramerConfig {
        FramerConfig {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_retransmits: self.max_retransmits,
            ..FramerConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub interval_ms: u64,
    /// Samples below this link quality count as degraded.
    pub link_quality_threshold: u8,
    /// Samples below this RSSI (dBm) count as degraded.
    pub rssi_threshold: i8,
    /// Consecutive degraded samples that trigger recovery.
    pub failure_bound: u32,
    pub stats_interval_ms: u64,
    pub query_timeout_ms: u64,
    /// How long each cycle listens for connection events.
    pub event_window_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            link_quality_threshold: 200,
            rssi_threshold: -80,
            failure_bound: 4,
            stats_interval_ms: 60_000,
            query_timeout_ms: 1000,
            event_window_ms: 100,
        }
    }
}

impl SupervisorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn event_window(&self) -> Duration {
        Duration::from_millis(self.event_window_ms)
    }
}

/// Layout of the optional YAML settings file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub bringup: BringupConfig,
    pub supervisor: SupervisorConfig,
    pub vendor: VendorProfile,
}

impl Settings {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let settings: Settings =
            serde_yaml_ng::from_str(text).context("Failed to parse settings YAML")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.vendor.max_fragment == 0 || self.vendor.max_fragment > 252 {
            anyhow::bail!(
                "vendor.max_fragment must be 1-252, got {}",
                self.vendor.max_fragment
            );
        }
        if self.supervisor.failure_bound == 0 {
            anyhow::bail!("supervisor.failure_bound must be at least 1");
        }
        Ok(())
    }
}
