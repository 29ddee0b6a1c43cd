//! Poller configuration: one YAML document describing the source protocol,
//! the reads to perform each cycle, and the output sink.
//!
//! Unknown keys are rejected at every level; adapter-specific sub-documents
//! (`proto`, `pull`) are kept raw here and validated by the adapter that
//! claims them.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT: f64 = 5.0;
pub const DEFAULT_FREQUENCY: f64 = 1.0;
pub const DEFAULT_BEACON_PERIOD: f64 = 2.0;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    pub version: u32,

    /// Cycle frequency in Hz; the cycle interval is `1 / freq`.
    #[serde(default = "default_freq")]
    pub freq: f64,

    /// Protocol I/O timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,

    /// Heartbeat period in seconds; 0 disables the beacon.
    #[serde(default = "default_beacon")]
    pub beacon: f64,

    #[serde(rename = "time-format", default)]
    pub time_format: Option<TimeFormat>,

    #[serde(default)]
    pub output: OutputConfig,

    /// Protocol selector plus adapter-specific fields; validated by the
    /// adapter builder.
    pub proto: serde_yaml::Value,

    /// Adapter-specific read list.
    pub pull: Vec<serde_yaml::Value>,
}

fn default_freq() -> f64 {
    DEFAULT_FREQUENCY
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT
}

fn default_beacon() -> f64 {
    DEFAULT_BEACON_PERIOD
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    Iso,
    Timestamp,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(rename = "type", default)]
    pub kind: OutputKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum OutputKind {
    #[default]
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "csv")]
    Csv,
    #[serde(rename = "ndjson")]
    Ndjson,
    #[serde(rename = "eva/datapuller")]
    EvaDatapuller,
}

impl PollConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let cfg: PollConfig = serde_yaml::from_str(text)
            .map_err(|e| Error::config(format!("invalid configuration: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version < 1 {
            return Err(Error::config("version must be >= 1"));
        }
        if !(self.freq > 0.0 && self.freq.is_finite()) {
            return Err(Error::config("freq must be a positive number"));
        }
        if !(self.timeout >= 0.0 && self.timeout.is_finite()) {
            return Err(Error::config("timeout must be >= 0"));
        }
        if !(self.beacon >= 0.0 && self.beacon.is_finite()) {
            return Err(Error::config("beacon must be >= 0"));
        }
        self.proto_name()?;
        Ok(())
    }

    /// Seconds between cycle starts.
    pub fn interval(&self) -> f64 {
        1.0 / self.freq
    }

    pub fn proto_name(&self) -> Result<&str> {
        self.proto
            .get("name")
            .and_then(serde_yaml::Value::as_str)
            .ok_or_else(|| Error::config("proto.name is required"))
    }

    /// Protocol family: the part of `proto.name` before `/`, if any.
    pub fn proto_family(&self) -> Result<&str> {
        let name = self.proto_name()?;
        Ok(name.split('/').next().unwrap_or(name))
    }
}
