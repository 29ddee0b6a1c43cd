//! Numeric transformations applied to decoded values before they reach the
//! data-point store.
//!
//! A chain is bound once at init to a data-point identifier and an ordered
//! list of steps; applying it folds the decoded value left to right. Any
//! step may yield "skip", which suppresses storage and emission for the
//! cycle.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::{DataType, Value};

const DEFAULT_SPEED_INTERVAL: f64 = 1.0;

/// Transform step as written in the configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransformSpec {
    Speed {
        #[serde(default = "default_speed_interval")]
        interval: f64,
    },
    Multiply {
        multiplier: f64,
    },
    Divide {
        divisor: f64,
    },
    Round {
        digits: u32,
    },
    Bit2Int,
    Int2Bit,
}

fn default_speed_interval() -> f64 {
    DEFAULT_SPEED_INTERVAL
}

/// A bound transform step. Parameters are captured at bind time; the speed
/// step keeps its per-point state in the engine-owned [`SpeedCache`].
#[derive(Debug, Clone)]
enum Transform {
    Speed {
        interval: f64,
        /// Wrap-around modulus, resolved at bind time when the decoded type
        /// is known, or at run time from the payload (SNMP varbinds carry
        /// their type on the wire).
        max: Option<u64>,
    },
    Multiply {
        factor: f64,
    },
    Divide {
        divisor: f64,
    },
    Round {
        digits: u32,
    },
    Bit2Int,
    Int2Bit,
}

/// Per-data-point state of the speed transform: last counter reading and
/// the pull time it was observed at.
#[derive(Debug, Default)]
pub struct SpeedCache {
    entries: HashMap<String, (u64, f64)>,
}

impl SpeedCache {
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Ordered transform steps bound to one data-point identifier.
#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    id: String,
    steps: Vec<Transform>,
}

impl TransformChain {
    /// Bind a chain for the data point `id`.
    ///
    /// `data_type` is the decoded type when it is known at init (PLC
    /// decoders); pass `None` when the type only becomes known per sample.
    /// Binding fails on a zero divisor and on a speed step over a type
    /// with no defined wrap-around.
    pub fn bind(
        id: &str,
        specs: &[TransformSpec],
        data_type: Option<DataType>,
    ) -> Result<Self> {
        let mut steps = Vec::with_capacity(specs.len());
        for spec in specs {
            let step = match spec {
                TransformSpec::Speed { interval } => {
                    let max = match data_type {
                        Some(tp) => Some(tp.counter_max().ok_or_else(|| {
                            Error::config(format!(
                                "{id}: speed transform requires an unsigned counter, got {}",
                                tp.name()
                            ))
                        })?),
                        None => None,
                    };
                    Transform::Speed {
                        interval: *interval,
                        max,
                    }
                }
                TransformSpec::Multiply { multiplier } => Transform::Multiply {
                    factor: *multiplier,
                },
                TransformSpec::Divide { divisor } => {
                    if *divisor == 0.0 {
                        return Err(Error::config(format!("{id}: zero divisor")));
                    }
                    Transform::Divide { divisor: *divisor }
                }
                TransformSpec::Round { digits } => Transform::Round { digits: *digits },
                TransformSpec::Bit2Int => Transform::Bit2Int,
                TransformSpec::Int2Bit => Transform::Int2Bit,
            };
            steps.push(step);
        }
        Ok(Self {
            id: id.to_string(),
            steps,
        })
    }

    /// Fold `value` through the chain. `now` is the cycle's pull time in
    /// monotonic seconds; `sample_type` is the per-sample data type for
    /// chains bound without one. Returns `None` when a step skipped.
    pub fn apply(
        &self,
        value: Value,
        now: f64,
        sample_type: Option<DataType>,
        cache: &mut SpeedCache,
    ) -> Result<Option<Value>> {
        let mut v = value;
        for step in &self.steps {
            let next = match step {
                Transform::Speed { interval, max } => {
                    let max = (*max)
                        .or_else(|| sample_type.and_then(DataType::counter_max))
                        .ok_or_else(|| {
                            Error::process(format!(
                                "{}: speed transform on a non-counter sample",
                                self.id
                            ))
                        })?;
                    speed(&self.id, v, now, *interval, max, cache)?
                }
                Transform::Multiply { factor } => Some(multiply(&self.id, v, *factor)?),
                Transform::Divide { divisor } => Some(divide(&self.id, v, *divisor)?),
                Transform::Round { digits } => Some(round(&self.id, v, *digits)?),
                Transform::Bit2Int => Some(Value::Int(i64::from(v.is_truthy()))),
                Transform::Int2Bit => Some(Value::Bool(v.is_truthy())),
            };
            match next {
                Some(next) => v = next,
                None => return Ok(None),
            }
        }
        Ok(Some(v))
    }
}

/// Rate of change over a wrap-around counter.
///
/// The first observation only seeds the cache and reports zero. Later
/// observations closer than `interval` to the previous one are skipped
/// without touching the cache, so short cycles cannot collapse `dt`.
fn speed(
    id: &str,
    value: Value,
    now: f64,
    interval: f64,
    max: u64,
    cache: &mut SpeedCache,
) -> Result<Option<Value>> {
    let current = value.as_counter()?;
    let out = match cache.entries.get(id) {
        Some(&(previous, ptime)) => {
            let dt = now - ptime;
            if dt < interval {
                return Ok(None);
            }
            let dv = if current >= previous {
                current - previous
            } else {
                let headroom = max.checked_sub(previous).ok_or_else(|| {
                    Error::process(format!("{id}: counter exceeds its declared width"))
                })?;
                headroom + current
            };
            Some(Value::Float(dv as f64 / dt))
        }
        None => Some(Value::Int(0)),
    };
    cache.entries.insert(id.to_string(), (current, now));
    Ok(out)
}

fn multiply(id: &str, value: Value, factor: f64) -> Result<Value> {
    Ok(match value {
        // An integral factor keeps integer points integer.
        Value::Int(i) if factor.fract() == 0.0 => Value::Int(i * factor as i64),
        Value::Bool(b) if factor.fract() == 0.0 => Value::Int(i64::from(b) * factor as i64),
        Value::Int(i) => Value::Float(i as f64 * factor),
        Value::UInt(u) if factor.fract() == 0.0 && factor >= 0.0 => {
            Value::UInt(u * factor as u64)
        }
        Value::UInt(u) => Value::Float(u as f64 * factor),
        Value::Float(f) => Value::Float(f * factor),
        Value::Bool(b) => Value::Float(f64::from(b) * factor),
        Value::Str(_) => {
            return Err(Error::process(format!("{id}: multiply on a string value")))
        }
    })
}

fn divide(id: &str, value: Value, divisor: f64) -> Result<Value> {
    let f = match value {
        Value::Int(i) => i as f64,
        Value::UInt(u) => u as f64,
        Value::Float(f) => f,
        Value::Bool(b) => f64::from(b),
        Value::Str(_) => {
            return Err(Error::process(format!("{id}: divide on a string value")))
        }
    };
    Ok(Value::Float(f / divisor))
}

/// Half-to-even rounding. `digits == 0` rounds to an integer but keeps the
/// float type.
fn round(id: &str, value: Value, digits: u32) -> Result<Value> {
    Ok(match value {
        Value::Float(f) => {
            let scale = 10f64.powi(digits as i32);
            Value::Float((f * scale).round_ties_even() / scale)
        }
        Value::Int(i) => Value::Int(i),
        Value::UInt(u) => Value::UInt(u),
        Value::Bool(b) => Value::Int(i64::from(b)),
        Value::Str(_) => {
            return Err(Error::process(format!("{id}: round on a string value")))
        }
    })
}
