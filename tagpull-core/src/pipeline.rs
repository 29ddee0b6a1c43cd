//! Process plans: decode → transform → store/emit bindings compiled at
//! init, executed by the processor worker for every fetched payload.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::datapoint::DataPointStore;
use crate::decode::Decoder;
use crate::error::{Error, Result};
use crate::proto::Payload;
use crate::transform::{SpeedCache, TransformChain};

/// Monotonic pull-time clock shared between the scheduler (writer) and the
/// processor worker (reader). The scheduler marks it once per cycle before
/// the fetch pass; a plain atomic suffices because the enqueue of a cycle's
/// payloads happens-before the worker dequeues them.
#[derive(Clone)]
pub struct PullClock {
    base: tokio::time::Instant,
    bits: Arc<AtomicU64>,
}

impl PullClock {
    pub fn new() -> Self {
        Self {
            base: tokio::time::Instant::now(),
            bits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record "now" as the current cycle's pull time and return it.
    pub fn mark(&self) -> f64 {
        let t = self.base.elapsed().as_secs_f64();
        self.bits.store(t.to_bits(), Ordering::Relaxed);
        t
    }

    /// Pull time of the cycle most recently started by the scheduler.
    pub fn last_pull_time(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl Default for PullClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable state owned by the processor worker. Recreated on every engine
/// init, which is what clears the data points and the speed cache.
pub struct ProcessorContext {
    pub store: DataPointStore,
    pub speed: SpeedCache,
    pub clock: PullClock,
}

/// One varbind's processing directive: rename and transform chain.
#[derive(Debug, Clone)]
pub struct VarBindRule {
    pub set_id: Option<String>,
    pub chain: TransformChain,
}

/// A compiled processing step for one pull's payload.
#[derive(Debug, Clone)]
pub enum ProcessStep {
    /// Extract a single scalar at a fixed location and feed one data point.
    Point {
        id: String,
        decoder: Decoder,
        chain: TransformChain,
    },
    /// Walk an SNMP varbind list, matching rules by OID.
    VarBinds {
        rules: HashMap<String, VarBindRule>,
        ignore: HashSet<String>,
    },
}

impl ProcessStep {
    pub fn apply(&self, payload: &Payload, ctx: &mut ProcessorContext) -> Result<()> {
        match self {
            ProcessStep::Point { id, decoder, chain } => {
                let value = decoder.apply(payload)?;
                let out = chain.apply(
                    value,
                    ctx.clock.last_pull_time(),
                    Some(decoder.data_type()),
                    &mut ctx.speed,
                )?;
                ctx.store.set(id, out)
            }
            ProcessStep::VarBinds { rules, ignore } => {
                let Payload::VarBinds(binds) = payload else {
                    return Err(Error::process(
                        "varbind step bound to a non-SNMP payload".to_string(),
                    ));
                };
                for (oid, sample) in binds {
                    if ignore.contains(oid) {
                        continue;
                    }
                    let Some(value) = sample.to_value() else {
                        continue;
                    };
                    match rules.get(oid) {
                        Some(rule) => {
                            let id = rule.set_id.as_deref().unwrap_or(oid.as_str());
                            let out = rule.chain.apply(
                                value,
                                ctx.clock.last_pull_time(),
                                sample.data_type(),
                                &mut ctx.speed,
                            )?;
                            ctx.store.set(id, out)?;
                        }
                        None => ctx.store.set(oid, Some(value))?,
                    }
                }
                Ok(())
            }
        }
    }
}
