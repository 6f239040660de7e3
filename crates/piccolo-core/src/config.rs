//! Instrument/server configuration. Configuration parsing itself is an
//! external collaborator; the core only defines and consumes the resulting
//! struct. Loaded from a TOML file via the `config` crate, layered with
//! `PICCOLO_`-prefixed environment overrides, the way other DAQ manifests
//! combine file and env configuration.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// One optical channel: a shutter plus its wiring metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Hardware shutter id; `-1` means "no hardware attached".
    #[serde(default = "default_shutter_id")]
    pub shutter: i32,
    #[serde(default)]
    pub reverse: bool,
    /// Fibre core diameter in micrometres; metadata only.
    #[serde(default, rename = "fibreDiameter")]
    pub fibre_diameter: u32,
}

fn default_shutter_id() -> i32 {
    -1
}

/// Per-spectrometer integration-time limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpectrometerLimits {
    pub min_integration_time: u32,
    pub max_integration_time: u32,
}

/// Output writer policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct OutputConfig {
    #[serde(default)]
    pub clobber: bool,
    #[serde(default)]
    pub split: bool,
    #[serde(default)]
    pub pretty: bool,
}

/// JSON-RPC transport adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcConfig {
    #[serde(default = "default_jsonrpc_url")]
    pub url: String,
}

fn default_jsonrpc_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for JsonRpcConfig {
    fn default() -> Self {
        JsonRpcConfig {
            url: default_jsonrpc_url(),
        }
    }
}

/// Process hosting settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: bool,
    pub pid_file: Option<String>,
}

/// Data directory / removable-storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDirConfig {
    #[serde(default = "default_datadir")]
    pub datadir: String,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_mntpnt")]
    pub mntpnt: String,
    #[serde(default)]
    pub mount: bool,
}

fn default_datadir() -> String {
    "spectra".to_string()
}
fn default_device() -> String {
    "/dev/sda1".to_string()
}
fn default_mntpnt() -> String {
    "/mnt".to_string()
}

impl Default for DataDirConfig {
    fn default() -> Self {
        DataDirConfig {
            datadir: default_datadir(),
            device: default_device(),
            mntpnt: default_mntpnt(),
            mount: false,
        }
    }
}

/// The full recognised configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PiccoloConfig {
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
    #[serde(default)]
    pub spectrometers: HashMap<String, SpectrometerLimits>,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub jsonrpc: JsonRpcConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub datadir: DataDirConfig,
}

impl PiccoloConfig {
    /// Load configuration from a TOML file, then apply `PICCOLO_`-prefixed
    /// environment overrides (e.g. `PICCOLO_OUTPUT__CLOBBER=true`).
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix("PICCOLO").separator("__"));
        let cfg = builder
            .build()
            .map_err(|e| CoreError::Other(format!("failed to load configuration: {e}")))?;
        cfg.try_deserialize()
            .map_err(|e| CoreError::Other(format!("failed to parse configuration: {e}")))
    }

    /// Build a config from defaults only, for tests and the CLI's demo mode.
    pub fn defaults() -> Self {
        PiccoloConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_sensible() {
        let cfg = PiccoloConfig::defaults();
        assert_eq!(cfg.datadir.datadir, "spectra");
        assert_eq!(cfg.jsonrpc.url, "http://localhost:8080");
        assert!(!cfg.output.clobber);
    }

    #[test]
    fn loads_channels_and_spectrometers_from_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [channels.upwelling]
            shutter = 0
            reverse = false
            fibreDiameter = 600

            [spectrometers.S_A]
            min_integration_time = 10
            max_integration_time = 2000

            [output]
            clobber = true
            "#
        )
        .unwrap();
        let cfg = PiccoloConfig::load(file.path()).unwrap();
        assert_eq!(cfg.channels["upwelling"].shutter, 0);
        assert_eq!(cfg.spectrometers["S_A"].max_integration_time, 2000);
        assert!(cfg.output.clobber);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = PiccoloConfig::load("/nonexistent/path/piccolo.toml").unwrap();
        assert_eq!(cfg.jsonrpc.url, "http://localhost:8080");
    }
}
