//! Protocol adapters: every source protocol implements the same
//! init / fetch / shutdown contract and compiles its pull list into
//! process plans at init.

use async_trait::async_trait;

use crate::config::PollConfig;
use crate::error::{Error, Result};
use crate::pipeline::ProcessStep;

pub mod enip;
pub mod modbus;
pub mod snmp;

pub use snmp::SnmpValue;

/// Raw per-pull payload handed from the scheduler to the processor worker.
#[derive(Debug, Clone)]
pub enum Payload {
    /// 16-bit holding / input registers.
    Registers(Vec<u16>),
    /// Coils / discrete inputs.
    Bits(Vec<bool>),
    /// PLC tag read buffer.
    TagData(Vec<u8>),
    /// SNMP varbind list in response order.
    VarBinds(Vec<(String, SnmpValue)>),
}

/// Transport owned exclusively by the scheduler. `fetch` performs one
/// configured read; the pull index refers to the plan list built at init.
///
/// `shutdown` is called exactly once per session, after the processor
/// worker has drained, so releasing the transport cannot race in-flight
/// payload processing.
#[async_trait]
pub trait Adapter: Send {
    async fn connect(&mut self) -> Result<()>;
    async fn fetch(&mut self, pull: usize) -> Result<Payload>;
    async fn shutdown(&mut self) -> Result<()>;
}

/// One pull's compiled processing plan, in registration order.
pub struct PullPlan {
    pub steps: Vec<ProcessStep>,
}

/// Build the adapter named by `proto.name` together with its pull plans.
pub fn build(cfg: &PollConfig) -> Result<(Box<dyn Adapter>, Vec<PullPlan>)> {
    match cfg.proto_family()? {
        "modbus" => modbus::build(&cfg.proto, &cfg.pull, cfg.timeout),
        "enip" => enip::build(&cfg.proto, &cfg.pull, cfg.timeout),
        "snmp" => snmp::build(&cfg.proto, &cfg.pull, cfg.timeout),
        other => Err(Error::config(format!("unsupported protocol: {other}"))),
    }
}

/// Split `host[:port]` using the given default port.
pub(crate) fn split_source(source: &str, default_port: u16) -> Result<(String, u16)> {
    match source.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::config(format!("invalid port in source: {source}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((source.to_string(), default_port)),
    }
}
