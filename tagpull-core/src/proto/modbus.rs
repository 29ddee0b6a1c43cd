//! Modbus TCP/UDP adapter.
//!
//! Frame generation and response parsing are delegated to the `rmodbus`
//! codec; this module owns the socket, the MBAP-length framing on TCP, and
//! the compilation of pull entries into decode plans.

use std::time::Duration;

use async_trait::async_trait;
use rmodbus::client::ModbusRequest;
use rmodbus::ModbusProto;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use super::{split_source, Adapter, Payload, PullPlan};
use crate::decode::{Decoder, OffsetSpec};
use crate::error::{Error, Result};
use crate::pipeline::ProcessStep;
use crate::transform::{TransformChain, TransformSpec};
use crate::types::parse_int_literal;

pub const DEFAULT_PORT: u16 = 502;

const MAX_REG_COUNT: u16 = 125;
const MAX_BIT_COUNT: u16 = 2000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProtoCfg {
    name: String,
    source: String,
    #[serde(rename = "default-unit")]
    default_unit: Option<UnitSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum UnitSpec {
    Num(i64),
    Text(String),
}

impl UnitSpec {
    fn unit_id(&self) -> Result<u8> {
        let v = match self {
            UnitSpec::Num(n) => *n,
            UnitSpec::Text(s) => parse_int_literal(s)?,
        };
        u8::try_from(v).map_err(|_| Error::config(format!("invalid unit id: {v}")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PullCfg {
    reg: String,
    count: u16,
    unit: Option<UnitSpec>,
    process: Vec<ProcessCfg>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessCfg {
    offset: OffsetSpec,
    #[serde(rename = "set-id")]
    set_id: String,
    #[serde(rename = "type")]
    data_type: Option<String>,
    transform: Option<Vec<TransformSpec>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegisterClass {
    Coils,
    Discretes,
    Holdings,
    Inputs,
}

impl RegisterClass {
    fn is_bits(self) -> bool {
        matches!(self, RegisterClass::Coils | RegisterClass::Discretes)
    }
}

#[derive(Debug)]
struct PullRequest {
    class: RegisterClass,
    addr: u16,
    count: u16,
    unit: u8,
}

enum Transport {
    Tcp(Option<TcpStream>),
    Udp(Option<UdpSocket>),
}

pub struct ModbusAdapter {
    host: String,
    port: u16,
    timeout: Duration,
    transport: Transport,
    pulls: Vec<PullRequest>,
}

/// Validate the adapter configuration and compile the pull list.
pub fn build(
    proto: &serde_yaml::Value,
    pull: &[serde_yaml::Value],
    timeout: f64,
) -> Result<(Box<dyn Adapter>, Vec<PullPlan>)> {
    let proto: ProtoCfg = serde_yaml::from_value(proto.clone())
        .map_err(|e| Error::config(format!("invalid modbus proto config: {e}")))?;

    let transport = match proto.name.as_str() {
        "modbus/tcp" => Transport::Tcp(None),
        "modbus/udp" => Transport::Udp(None),
        other => return Err(Error::config(format!("unsupported protocol: {other}"))),
    };
    let (host, port) = split_source(&proto.source, DEFAULT_PORT)?;
    let default_unit = match &proto.default_unit {
        Some(u) => u.unit_id()?,
        None => 1,
    };

    let mut pulls = Vec::with_capacity(pull.len());
    let mut plans = Vec::with_capacity(pull.len());
    for raw in pull {
        let cfg: PullCfg = serde_yaml::from_value(raw.clone())
            .map_err(|e| Error::config(format!("invalid modbus pull entry: {e}")))?;
        let (request, plan) = compile_pull(&cfg, default_unit)?;
        pulls.push(request);
        plans.push(plan);
    }

    let adapter = ModbusAdapter {
        host,
        port,
        timeout: Duration::from_secs_f64(timeout),
        transport,
        pulls,
    };
    Ok((Box::new(adapter), plans))
}

fn compile_pull(cfg: &PullCfg, default_unit: u8) -> Result<(PullRequest, PullPlan)> {
    let (class_char, addr_text) = cfg
        .reg
        .split_at_checked(1)
        .ok_or_else(|| Error::config("empty register spec"))?;
    let class = match class_char {
        "c" => RegisterClass::Coils,
        "d" => RegisterClass::Discretes,
        "h" => RegisterClass::Holdings,
        "i" => RegisterClass::Inputs,
        other => {
            return Err(Error::config(format!("invalid register type: {other}")))
        }
    };
    let addr = u16::try_from(parse_int_literal(addr_text)?)
        .map_err(|_| Error::config(format!("register address out of range: {addr_text}")))?;

    let max_count = if class.is_bits() {
        MAX_BIT_COUNT
    } else {
        MAX_REG_COUNT
    };
    if cfg.count == 0 || cfg.count > max_count {
        return Err(Error::config(format!(
            "count must be between 1 and {max_count} for {}",
            cfg.reg
        )));
    }

    let unit = match &cfg.unit {
        Some(u) => u.unit_id()?,
        None => default_unit,
    };

    let mut steps = Vec::with_capacity(cfg.process.len());
    for proc in &cfg.process {
        steps.push(compile_process(proc, class, addr, cfg.count)?);
    }

    Ok((
        PullRequest {
            class,
            addr,
            count: cfg.count,
            unit,
        },
        PullPlan { steps },
    ))
}

fn compile_process(
    proc: &ProcessCfg,
    class: RegisterClass,
    addr: u16,
    count: u16,
) -> Result<ProcessStep> {
    let id = proc.set_id.as_str();
    let resolved = proc.offset.resolve(addr)?;

    let decoder = if class.is_bits() {
        // Coils and discretes only decode to flags; typed decoders need
        // word registers.
        if let Some(tp) = &proc.data_type {
            return Err(Error::config(format!(
                "{id}: type {tp} is not applicable to coil/discrete registers"
            )));
        }
        if resolved.bit.is_some() {
            return Err(Error::config(format!(
                "{id}: bit suffix is not applicable to coil/discrete registers"
            )));
        }
        Decoder::Flag {
            offset: resolved.offset,
        }
    } else if let Some(bit) = resolved.bit {
        Decoder::RegBit {
            offset: resolved.offset,
            bit,
        }
    } else {
        let offset = resolved.offset;
        match proc.data_type.as_deref() {
            None | Some("uint16") | Some("word") => Decoder::RegU16 { offset },
            Some("sint16") | Some("int16") => Decoder::RegI16 { offset },
            Some("uint32") | Some("dword") => Decoder::RegU32 { offset },
            Some("sint32") | Some("int32") => Decoder::RegI32 { offset },
            Some("real") | Some("real32") => Decoder::RegF32 { offset },
            Some(other) => {
                return Err(Error::config(format!("{id}: type unsupported: {other}")))
            }
        }
    };

    if decoder.offset() + decoder.span() > count as usize {
        return Err(Error::config(format!(
            "{id}: offset {} reaches past the pulled count {count}",
            decoder.offset()
        )));
    }

    let chain = TransformChain::bind(
        id,
        proc.transform.as_deref().unwrap_or(&[]),
        Some(decoder.data_type()),
    )?;
    Ok(ProcessStep::Point {
        id: id.to_string(),
        decoder,
        chain,
    })
}

impl ModbusAdapter {
    async fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let timeout = self.timeout;
        let io = async {
            match &mut self.transport {
                Transport::Tcp(Some(stream)) => {
                    stream.write_all(frame).await?;
                    // MBAP: transaction(2) protocol(2) length(2); the
                    // length field counts everything after itself.
                    let mut head = [0u8; 6];
                    stream.read_exact(&mut head).await?;
                    let remaining = u16::from_be_bytes([head[4], head[5]]) as usize;
                    let mut response = head.to_vec();
                    response.resize(6 + remaining, 0);
                    stream.read_exact(&mut response[6..]).await?;
                    Ok(response)
                }
                Transport::Udp(Some(socket)) => {
                    socket.send(frame).await?;
                    let mut buf = vec![0u8; 520];
                    let n = socket.recv(&mut buf).await?;
                    buf.truncate(n);
                    Ok(buf)
                }
                _ => Err(Error::proto("modbus transport is not connected")),
            }
        };
        if timeout.is_zero() {
            io.await
        } else {
            tokio::time::timeout(timeout, io)
                .await
                .map_err(|_| Error::proto("modbus request timed out"))?
        }
    }
}

#[async_trait]
impl Adapter for ModbusAdapter {
    async fn connect(&mut self) -> Result<()> {
        match &mut self.transport {
            Transport::Tcp(slot) => {
                let connect = TcpStream::connect((self.host.as_str(), self.port));
                let stream = if self.timeout.is_zero() {
                    connect.await?
                } else {
                    tokio::time::timeout(self.timeout, connect)
                        .await
                        .map_err(|_| Error::proto("modbus connect timed out"))??
                };
                *slot = Some(stream);
            }
            Transport::Udp(slot) => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket
                    .connect((self.host.as_str(), self.port))
                    .await?;
                *slot = Some(socket);
            }
        }
        Ok(())
    }

    async fn fetch(&mut self, pull: usize) -> Result<Payload> {
        let (class, addr, count, unit) = {
            let req = self
                .pulls
                .get(pull)
                .ok_or_else(|| Error::proto(format!("unknown pull index {pull}")))?;
            (req.class, req.addr, req.count, req.unit)
        };
        let mut mreq = ModbusRequest::new(unit, ModbusProto::TcpUdp);
        let mut frame = Vec::new();
        match class {
            RegisterClass::Coils => mreq.generate_get_coils(addr, count, &mut frame),
            RegisterClass::Discretes => mreq.generate_get_discretes(addr, count, &mut frame),
            RegisterClass::Holdings => mreq.generate_get_holdings(addr, count, &mut frame),
            RegisterClass::Inputs => mreq.generate_get_inputs(addr, count, &mut frame),
        }
        .map_err(|e| Error::proto(format!("modbus: {e}")))?;

        let response = self.exchange(&frame).await?;

        if class.is_bits() {
            let mut bits = Vec::new();
            mreq.parse_bool(&response, &mut bits)
                .map_err(|e| Error::proto(format!("modbus: {e}")))?;
            bits.truncate(count as usize);
            Ok(Payload::Bits(bits))
        } else {
            let mut regs = Vec::new();
            mreq.parse_u16(&response, &mut regs)
                .map_err(|e| Error::proto(format!("modbus: {e}")))?;
            Ok(Payload::Registers(regs))
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        match &mut self.transport {
            Transport::Tcp(slot) => *slot = None,
            Transport::Udp(slot) => *slot = None,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> serde_yaml::Value {
        serde_yaml::from_str(text).unwrap()
    }

    fn proto_tcp() -> serde_yaml::Value {
        yaml("name: modbus/tcp\nsource: 10.0.0.1")
    }

    #[test]
    fn builds_plans_for_register_pull() {
        let pull = vec![yaml(
            "reg: h1000\ncount: 4\nprocess:\n  - offset: 0\n    set-id: s.a\n    type: uint32\n  - offset: 2\n    set-id: s.b\n    type: real32\n",
        )];
        let (_, plans) = build(&proto_tcp(), &pull, 5.0).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].steps.len(), 2);
        match &plans[0].steps[0] {
            ProcessStep::Point { id, decoder, .. } => {
                assert_eq!(id, "s.a");
                assert_eq!(*decoder, Decoder::RegU32 { offset: 0 });
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn hex_addresses_and_absolute_offsets() {
        let pull = vec![yaml(
            "reg: h0x3E8\ncount: 2\nprocess:\n  - offset: '=0x3E9'\n    set-id: s.a\n",
        )];
        let (_, plans) = build(&proto_tcp(), &pull, 5.0).unwrap();
        match &plans[0].steps[0] {
            ProcessStep::Point { decoder, .. } => {
                assert_eq!(*decoder, Decoder::RegU16 { offset: 1 });
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn bit_offsets_compile_to_bit_decoders() {
        let pull = vec![yaml(
            "reg: i0\ncount: 1\nprocess:\n  - offset: 0/2\n    set-id: d.b\n",
        )];
        let (_, plans) = build(&proto_tcp(), &pull, 5.0).unwrap();
        match &plans[0].steps[0] {
            ProcessStep::Point { decoder, .. } => {
                assert_eq!(*decoder, Decoder::RegBit { offset: 0, bit: 2 });
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn typed_decoder_on_coils_rejected() {
        let pull = vec![yaml(
            "reg: c0\ncount: 8\nprocess:\n  - offset: 0\n    set-id: d.a\n    type: uint16\n",
        )];
        assert!(build(&proto_tcp(), &pull, 5.0).is_err());
    }

    #[test]
    fn coil_pull_compiles_to_flags() {
        let pull = vec![yaml(
            "reg: c0\ncount: 8\nprocess:\n  - offset: 3\n    set-id: d.a\n",
        )];
        let (_, plans) = build(&proto_tcp(), &pull, 5.0).unwrap();
        match &plans[0].steps[0] {
            ProcessStep::Point { decoder, .. } => {
                assert_eq!(*decoder, Decoder::Flag { offset: 3 });
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn offset_past_count_rejected() {
        let pull = vec![yaml(
            "reg: h0\ncount: 2\nprocess:\n  - offset: 1\n    set-id: s.a\n    type: uint32\n",
        )];
        assert!(build(&proto_tcp(), &pull, 5.0).is_err());
    }

    #[test]
    fn unknown_pull_key_rejected() {
        let pull = vec![yaml("reg: h0\ncount: 1\nregister: h0\nprocess: []")];
        assert!(build(&proto_tcp(), &pull, 5.0).is_err());
    }

    #[test]
    fn unknown_proto_name_rejected() {
        let proto = yaml("name: modbus/rtu\nsource: /dev/ttyUSB0");
        assert!(build(&proto, &[], 5.0).is_err());
    }

    #[test]
    fn speed_on_signed_type_rejected_at_init() {
        let pull = vec![yaml(
            "reg: h0\ncount: 1\nprocess:\n  - offset: 0\n    set-id: s.a\n    type: sint16\n    transform:\n      - type: speed\n",
        )];
        assert!(build(&proto_tcp(), &pull, 5.0).is_err());
    }
}
