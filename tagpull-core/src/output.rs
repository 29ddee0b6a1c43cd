//! Line-oriented push sinks. Every emission is one newline-terminated
//! line, flushed immediately; the beacon is a lone newline on the same
//! stream.

use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{Local, SecondsFormat};
use colored::Colorize;
use serde::Serialize;

use crate::config::{OutputKind, TimeFormat};
use crate::error::{Error, Result};
use crate::types::Value;

/// Sink consumed by the data-point store (values) and the scheduler
/// (beacon). Implementations serialize writes internally.
pub trait Output: Send + Sync {
    fn emit(&self, id: &str, value: &Value) -> Result<()>;
    fn beacon(&self) -> Result<()>;
}

/// The stdout sink family: one struct, formatted per selector.
pub struct LineOutput {
    kind: OutputKind,
    time_format: Option<TimeFormat>,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl LineOutput {
    pub fn new(
        kind: OutputKind,
        time_format: Option<TimeFormat>,
        writer: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            kind,
            time_format,
            writer: Mutex::new(writer),
        }
    }

    pub fn stdout(kind: OutputKind, time_format: Option<TimeFormat>) -> Arc<dyn Output> {
        Arc::new(Self::new(kind, time_format, Box::new(std::io::stdout())))
    }

    fn time_string(&self) -> Option<String> {
        match self.time_format? {
            TimeFormat::Iso => Some(
                Local::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            ),
            TimeFormat::Timestamp => Some(format!("{}", epoch_seconds())),
        }
    }

    /// JSON rendering of the time field: iso stays a string, timestamp is
    /// a number.
    fn time_json(&self) -> Option<serde_json::Value> {
        match self.time_format? {
            TimeFormat::Iso => self.time_string().map(serde_json::Value::from),
            TimeFormat::Timestamp => Some(serde_json::Value::from(epoch_seconds())),
        }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut w = self
            .writer
            .lock()
            .map_err(|_| Error::process("output writer poisoned"))?;
        writeln!(w, "{line}")?;
        w.flush()?;
        Ok(())
    }

    fn format(&self, id: &str, value: &Value) -> Result<String> {
        let time = self.time_string();
        Ok(match self.kind {
            OutputKind::Text => {
                let mut line = String::new();
                if let Some(t) = &time {
                    line.push_str(&format!("{} ", t.dimmed()));
                }
                line.push_str(&format!(
                    "{} {}",
                    id.blue().bold(),
                    value.to_string().yellow()
                ));
                line
            }
            OutputKind::Csv => match &time {
                Some(t) => format!("{t};{id};{value}"),
                None => format!("{id};{value}"),
            },
            OutputKind::Ndjson => {
                #[derive(Serialize)]
                struct Record<'a> {
                    id: &'a str,
                    value: serde_json::Value,
                    #[serde(skip_serializing_if = "Option::is_none")]
                    time: Option<serde_json::Value>,
                }
                serde_json::to_string(&Record {
                    id,
                    value: value.to_json(),
                    time: self.time_json(),
                })
                .map_err(|e| Error::process(format!("ndjson encoding: {e}")))?
            }
            OutputKind::EvaDatapuller => {
                // Identifier suffix picks the datapuller mode: `.value`
                // carries the value with an unknown status, `.status`
                // carries the status alone.
                if let Some(base) = id.strip_suffix(".value") {
                    format!("{base} u None {value}")
                } else if let Some(base) = id.strip_suffix(".status") {
                    format!("{base} u {value}")
                } else {
                    format!("{id} u None {value}")
                }
            }
        })
    }
}

fn epoch_seconds() -> f64 {
    Local::now().timestamp_micros() as f64 / 1_000_000.0
}

impl Output for LineOutput {
    fn emit(&self, id: &str, value: &Value) -> Result<()> {
        let line = self.format(id, value)?;
        self.write_line(&line)
    }

    fn beacon(&self) -> Result<()> {
        self.write_line("")
    }
}
