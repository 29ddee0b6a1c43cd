//! SNMP v1/v2c adapter over UDP.
//!
//! Carries its own minimal BER codec: the poller only ever sends
//! get / getnext / getbulk PDUs with null-valued varbinds and reads back
//! the handful of application types agents actually return. Entries in the
//! pull list ending in `.*` are walked with getnext; plain entries are
//! fetched with get, batched into one getbulk on v2c when there are at
//! least two of them.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::UdpSocket;

use super::{split_source, Adapter, Payload, PullPlan};
use crate::error::{Error, Result};
use crate::pipeline::{ProcessStep, VarBindRule};
use crate::transform::{TransformChain, TransformSpec};
use crate::types::{parse_int_literal, DataType, Value};

pub const DEFAULT_PORT: u16 = 161;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_OPAQUE: u8 = 0x44;
const TAG_COUNTER64: u8 = 0x46;
const TAG_NO_SUCH_OBJECT: u8 = 0x80;
const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
const TAG_END_OF_MIB_VIEW: u8 = 0x82;

const PDU_GET: u8 = 0xA0;
const PDU_GETNEXT: u8 = 0xA1;
const PDU_RESPONSE: u8 = 0xA2;
const PDU_GETBULK: u8 = 0xA5;

/// v1 noSuchName; a getnext walk past the end of the MIB reports this.
const ERR_NO_SUCH_NAME: i64 = 2;

const MAX_WALK_STEPS: usize = 65536;

type Oid = Vec<u32>;

/// A decoded varbind value, tagged the way it arrived on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Int(i64),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Counter64(u64),
    OctetString(Vec<u8>),
    Oid(String),
    IpAddress([u8; 4]),
    Null,
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

impl SnmpValue {
    /// Counter width for the speed transform, where the wire type defines
    /// one.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            SnmpValue::Int(_) => Some(DataType::Int32),
            SnmpValue::Counter32(_) | SnmpValue::Gauge32(_) | SnmpValue::TimeTicks(_) => {
                Some(DataType::UInt32)
            }
            SnmpValue::Counter64(_) => Some(DataType::UInt64),
            _ => None,
        }
    }

    /// Scalar conversion; `None` for empty markers, which are never stored.
    ///
    /// Octet strings holding a decimal integer become integers, other
    /// printable strings stay text, and binary blobs become a hex literal.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            SnmpValue::Int(i) => Some(Value::Int(*i)),
            SnmpValue::Counter32(v) | SnmpValue::Gauge32(v) | SnmpValue::TimeTicks(v) => {
                Some(Value::Int(i64::from(*v)))
            }
            SnmpValue::Counter64(v) => Some(Value::UInt(*v)),
            SnmpValue::OctetString(bytes) => Some(match std::str::from_utf8(bytes) {
                Ok(text) => match text.parse::<i64>() {
                    Ok(i) => Value::Int(i),
                    Err(_) => Value::Str(text.to_string()),
                },
                Err(_) => {
                    let mut hex = String::with_capacity(2 + bytes.len() * 2);
                    hex.push_str("0x");
                    for b in bytes {
                        hex.push_str(&format!("{b:02X}"));
                    }
                    Value::Str(hex)
                }
            }),
            SnmpValue::Oid(s) => Some(Value::Str(s.clone())),
            SnmpValue::IpAddress(octets) => Some(Value::Str(format!(
                "{}.{}.{}.{}",
                octets[0], octets[1], octets[2], octets[3]
            ))),
            SnmpValue::Null
            | SnmpValue::NoSuchObject
            | SnmpValue::NoSuchInstance
            | SnmpValue::EndOfMibView => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProtoCfg {
    name: String,
    source: String,
    community: Option<CommunitySpec>,
    version: Option<u32>,
    retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommunitySpec {
    Num(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PullCfg {
    oids: Vec<String>,
    #[serde(default)]
    process: Vec<ProcessCfg>,
    #[serde(default)]
    ignore: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessCfg {
    oid: String,
    #[serde(rename = "set-id")]
    set_id: Option<String>,
    transform: Option<Vec<TransformSpec>>,
}

#[derive(Debug)]
struct OidSet {
    walk: Vec<Oid>,
    get: Vec<Oid>,
}

pub struct SnmpAdapter {
    host: String,
    port: u16,
    timeout: Duration,
    community: String,
    version: u32,
    retries: u32,
    socket: Option<UdpSocket>,
    request_id: i32,
    pulls: Vec<OidSet>,
}

pub fn build(
    proto: &serde_yaml::Value,
    pull: &[serde_yaml::Value],
    timeout: f64,
) -> Result<(Box<dyn Adapter>, Vec<PullPlan>)> {
    let proto: ProtoCfg = serde_yaml::from_value(proto.clone())
        .map_err(|e| Error::config(format!("invalid snmp proto config: {e}")))?;
    if proto.name != "snmp" {
        return Err(Error::config(format!(
            "unsupported protocol: {}",
            proto.name
        )));
    }
    let (host, port) = split_source(&proto.source, DEFAULT_PORT)?;
    let version = proto.version.unwrap_or(2);
    if !(1..=2).contains(&version) {
        return Err(Error::config(format!("unsupported snmp version: {version}")));
    }
    let community = match proto.community {
        Some(CommunitySpec::Text(s)) => s,
        Some(CommunitySpec::Num(n)) => n.to_string(),
        None => "public".to_string(),
    };

    let mut pulls = Vec::with_capacity(pull.len());
    let mut plans = Vec::with_capacity(pull.len());
    for raw in pull {
        let cfg: PullCfg = serde_yaml::from_value(raw.clone())
            .map_err(|e| Error::config(format!("invalid snmp pull entry: {e}")))?;
        let (set, plan) = compile_pull(&cfg)?;
        pulls.push(set);
        plans.push(plan);
    }

    let adapter = SnmpAdapter {
        host,
        port,
        timeout: Duration::from_secs_f64(timeout),
        community,
        version,
        retries: proto.retries.unwrap_or(1),
        socket: None,
        request_id: 0,
        pulls,
    };
    Ok((Box::new(adapter), plans))
}

fn compile_pull(cfg: &PullCfg) -> Result<(OidSet, PullPlan)> {
    let mut walk = Vec::new();
    let mut get = Vec::new();
    for entry in &cfg.oids {
        match entry.strip_suffix(".*") {
            Some(root) => walk.push(parse_oid(root)?),
            None => get.push(parse_oid(entry)?),
        }
    }
    if walk.is_empty() && get.is_empty() {
        return Err(Error::config("snmp pull entry lists no oids"));
    }

    let mut rules = HashMap::with_capacity(cfg.process.len());
    for proc in &cfg.process {
        let oid = normalize_oid_text(&proc.oid);
        // The speed modulus comes from the wire type per sample, so the
        // chain is bound without one.
        let chain_id = proc.set_id.clone().unwrap_or_else(|| oid.clone());
        let chain =
            TransformChain::bind(&chain_id, proc.transform.as_deref().unwrap_or(&[]), None)?;
        rules.insert(
            oid,
            VarBindRule {
                set_id: proc.set_id.clone(),
                chain,
            },
        );
    }
    let ignore: HashSet<String> = cfg.ignore.iter().map(|s| normalize_oid_text(s)).collect();

    Ok((
        OidSet { walk, get },
        PullPlan {
            steps: vec![ProcessStep::VarBinds { rules, ignore }],
        },
    ))
}

fn normalize_oid_text(s: &str) -> String {
    s.trim().trim_start_matches('.').to_string()
}

fn parse_oid(text: &str) -> Result<Oid> {
    let trimmed = normalize_oid_text(text);
    let mut oid = Vec::new();
    for arc in trimmed.split('.') {
        let v = parse_int_literal(arc)?;
        oid.push(
            u32::try_from(v).map_err(|_| Error::config(format!("invalid oid arc: {v}")))?,
        );
    }
    if oid.len() < 2 {
        return Err(Error::config(format!("oid too short: {text}")));
    }
    Ok(oid)
}

fn dotted(oid: &[u32]) -> String {
    oid.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

// ---- BER encoding ----

fn push_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
}

fn push_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    push_len(out, content.len());
    out.extend_from_slice(content);
}

fn push_int(out: &mut Vec<u8>, v: i64) {
    let bytes = v.to_be_bytes();
    // Trim redundant leading bytes while keeping the sign bit intact.
    let mut start = 0;
    while start < 7 {
        let lead = bytes[start];
        let next_msb = bytes[start + 1] & 0x80;
        if (lead == 0x00 && next_msb == 0) || (lead == 0xFF && next_msb != 0) {
            start += 1;
        } else {
            break;
        }
    }
    push_tlv(out, TAG_INTEGER, &bytes[start..]);
}

fn encode_oid(oid: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(oid.len() + 1);
    out.push((oid[0] * 40 + oid[1]) as u8);
    for &arc in &oid[2..] {
        let mut chunk = [0u8; 5];
        let mut pos = 4;
        let mut v = arc;
        chunk[pos] = (v & 0x7F) as u8;
        v >>= 7;
        while v > 0 {
            pos -= 1;
            chunk[pos] = 0x80 | (v & 0x7F) as u8;
            v >>= 7;
        }
        out.extend_from_slice(&chunk[pos..]);
    }
    out
}

fn encode_request(
    wire_version: i64,
    community: &str,
    pdu_type: u8,
    request_id: i32,
    p1: i64,
    p2: i64,
    oids: &[Oid],
) -> Vec<u8> {
    let mut list = Vec::new();
    for oid in oids {
        let mut bind = Vec::new();
        push_tlv(&mut bind, TAG_OID, &encode_oid(oid));
        push_tlv(&mut bind, TAG_NULL, &[]);
        push_tlv(&mut list, TAG_SEQUENCE, &bind);
    }

    let mut pdu = Vec::new();
    push_int(&mut pdu, i64::from(request_id));
    push_int(&mut pdu, p1);
    push_int(&mut pdu, p2);
    push_tlv(&mut pdu, TAG_SEQUENCE, &list);

    let mut body = Vec::new();
    push_int(&mut body, wire_version);
    push_tlv(&mut body, TAG_OCTET_STRING, community.as_bytes());
    push_tlv(&mut body, pdu_type, &pdu);

    let mut msg = Vec::new();
    push_tlv(&mut msg, TAG_SEQUENCE, &body);
    msg
}

// ---- BER decoding ----

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_tlv(&mut self) -> Result<(u8, &'a [u8])> {
        if self.buf.len() < 2 {
            return Err(Error::proto("snmp reply truncated"));
        }
        let tag = self.buf[0];
        let (len, header) = if self.buf[1] < 0x80 {
            (self.buf[1] as usize, 2)
        } else {
            let n = (self.buf[1] & 0x7F) as usize;
            if n == 0 || n > 4 || self.buf.len() < 2 + n {
                return Err(Error::proto("snmp reply has a malformed length"));
            }
            let mut len = 0usize;
            for &b in &self.buf[2..2 + n] {
                len = (len << 8) | b as usize;
            }
            (len, 2 + n)
        };
        if self.buf.len() < header + len {
            return Err(Error::proto("snmp reply truncated"));
        }
        let content = &self.buf[header..header + len];
        self.buf = &self.buf[header + len..];
        Ok((tag, content))
    }

    fn take_int(&mut self) -> Result<i64> {
        let (tag, content) = self.take_tlv()?;
        if tag != TAG_INTEGER {
            return Err(Error::proto(format!("snmp: expected integer, got tag {tag:#04x}")));
        }
        read_int(content)
    }
}

fn read_int(content: &[u8]) -> Result<i64> {
    if content.is_empty() || content.len() > 8 {
        return Err(Error::proto("snmp integer out of range"));
    }
    let mut v: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in content {
        v = (v << 8) | i64::from(b);
    }
    Ok(v)
}

fn read_uint(content: &[u8]) -> Result<u64> {
    let trimmed = match content.split_first() {
        Some((0x00, rest)) => rest,
        _ => content,
    };
    if trimmed.len() > 8 {
        return Err(Error::proto("snmp unsigned integer out of range"));
    }
    let mut v = 0u64;
    for &b in trimmed {
        v = (v << 8) | u64::from(b);
    }
    Ok(v)
}

fn decode_oid(content: &[u8]) -> Result<Oid> {
    let Some((&first, rest)) = content.split_first() else {
        return Err(Error::proto("snmp oid is empty"));
    };
    let mut oid = if first < 40 {
        vec![0, u32::from(first)]
    } else if first < 80 {
        vec![1, u32::from(first) - 40]
    } else {
        vec![2, u32::from(first) - 80]
    };
    let mut acc: u32 = 0;
    for &b in rest {
        acc = acc
            .checked_mul(128)
            .and_then(|v| v.checked_add(u32::from(b & 0x7F)))
            .ok_or_else(|| Error::proto("snmp oid arc overflow"))?;
        if b & 0x80 == 0 {
            oid.push(acc);
            acc = 0;
        }
    }
    Ok(oid)
}

fn decode_value(tag: u8, content: &[u8]) -> Result<SnmpValue> {
    Ok(match tag {
        TAG_INTEGER => SnmpValue::Int(read_int(content)?),
        TAG_OCTET_STRING | TAG_OPAQUE => SnmpValue::OctetString(content.to_vec()),
        TAG_NULL => SnmpValue::Null,
        TAG_OID => SnmpValue::Oid(dotted(&decode_oid(content)?)),
        TAG_IP_ADDRESS => {
            let octets: [u8; 4] = content
                .try_into()
                .map_err(|_| Error::proto("snmp ip address is not 4 octets"))?;
            SnmpValue::IpAddress(octets)
        }
        TAG_COUNTER32 => SnmpValue::Counter32(read_uint(content)? as u32),
        TAG_GAUGE32 => SnmpValue::Gauge32(read_uint(content)? as u32),
        TAG_TIMETICKS => SnmpValue::TimeTicks(read_uint(content)? as u32),
        TAG_COUNTER64 => SnmpValue::Counter64(read_uint(content)?),
        TAG_NO_SUCH_OBJECT => SnmpValue::NoSuchObject,
        TAG_NO_SUCH_INSTANCE => SnmpValue::NoSuchInstance,
        TAG_END_OF_MIB_VIEW => SnmpValue::EndOfMibView,
        _ => SnmpValue::Null,
    })
}

struct Response {
    request_id: i64,
    error_status: i64,
    binds: Vec<(Oid, SnmpValue)>,
}

fn decode_response(buf: &[u8]) -> Result<Response> {
    let mut outer = Reader::new(buf);
    let (tag, body) = outer.take_tlv()?;
    if tag != TAG_SEQUENCE {
        return Err(Error::proto("snmp reply is not a message"));
    }
    let mut msg = Reader::new(body);
    let _version = msg.take_int()?;
    let (tag, _community) = msg.take_tlv()?;
    if tag != TAG_OCTET_STRING {
        return Err(Error::proto("snmp reply has no community"));
    }
    let (tag, pdu) = msg.take_tlv()?;
    if tag != PDU_RESPONSE {
        return Err(Error::proto(format!("snmp: unexpected pdu {tag:#04x}")));
    }

    let mut pdu = Reader::new(pdu);
    let request_id = pdu.take_int()?;
    let error_status = pdu.take_int()?;
    let _error_index = pdu.take_int()?;
    let (tag, list) = pdu.take_tlv()?;
    if tag != TAG_SEQUENCE {
        return Err(Error::proto("snmp reply has no varbind list"));
    }

    let mut binds = Vec::new();
    let mut list = Reader::new(list);
    while !list.is_empty() {
        let (tag, bind) = list.take_tlv()?;
        if tag != TAG_SEQUENCE {
            return Err(Error::proto("snmp varbind is not a sequence"));
        }
        let mut bind = Reader::new(bind);
        let (tag, oid) = bind.take_tlv()?;
        if tag != TAG_OID {
            return Err(Error::proto("snmp varbind has no oid"));
        }
        let oid = decode_oid(oid)?;
        let (tag, content) = bind.take_tlv()?;
        binds.push((oid, decode_value(tag, content)?));
    }

    Ok(Response {
        request_id,
        error_status,
        binds,
    })
}

impl SnmpAdapter {
    fn wire_version(&self) -> i64 {
        i64::from(self.version) - 1
    }

    async fn request(&mut self, pdu_type: u8, p1: i64, p2: i64, oids: &[Oid]) -> Result<Response> {
        self.request_id = self.request_id.wrapping_add(1);
        let request_id = self.request_id;
        let msg = encode_request(
            self.wire_version(),
            &self.community,
            pdu_type,
            request_id,
            p1,
            p2,
            oids,
        );
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::proto("snmp socket is not bound"))?;

        let mut attempts = self.retries + 1;
        loop {
            socket.send(&msg).await?;
            let mut buf = vec![0u8; 65535];
            let received = if self.timeout.is_zero() {
                Ok(socket.recv(&mut buf).await)
            } else {
                tokio::time::timeout(self.timeout, socket.recv(&mut buf))
                    .await
                    .map_err(|_| Error::proto("snmp request timed out"))
            };
            match received {
                Ok(n) => {
                    let n = n?;
                    buf.truncate(n);
                    let response = decode_response(&buf)?;
                    if response.request_id == i64::from(request_id) {
                        return Ok(response);
                    }
                    // Stale datagram from a previous attempt; count it
                    // against the retry budget and ask again.
                }
                Err(elapsed) => {
                    if attempts <= 1 {
                        return Err(elapsed);
                    }
                }
            }
            attempts -= 1;
            if attempts == 0 {
                return Err(Error::proto("snmp request timed out"));
            }
        }
    }

    async fn walk(&mut self, root: &Oid, out: &mut Vec<(String, SnmpValue)>) -> Result<()> {
        let mut current = root.clone();
        for _ in 0..MAX_WALK_STEPS {
            let response = self
                .request(PDU_GETNEXT, 0, 0, std::slice::from_ref(&current))
                .await?;
            if response.error_status == ERR_NO_SUCH_NAME {
                return Ok(());
            }
            if response.error_status != 0 {
                return Err(Error::proto(format!(
                    "snmp error status {}",
                    response.error_status
                )));
            }
            let Some((oid, value)) = response.binds.into_iter().next() else {
                return Ok(());
            };
            if !oid.starts_with(root)
                || oid == current
                || matches!(value, SnmpValue::EndOfMibView)
            {
                return Ok(());
            }
            out.push((dotted(&oid), value));
            current = oid;
        }
        Err(Error::proto(format!(
            "snmp walk of {} did not terminate",
            dotted(root)
        )))
    }
}

#[async_trait]
impl Adapter for SnmpAdapter {
    async fn connect(&mut self) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((self.host.as_str(), self.port)).await?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn fetch(&mut self, pull: usize) -> Result<Payload> {
        let (walk_roots, get_oids) = {
            let set = self
                .pulls
                .get(pull)
                .ok_or_else(|| Error::proto(format!("unknown pull index {pull}")))?;
            (set.walk.clone(), set.get.clone())
        };

        let mut out = Vec::new();
        for root in &walk_roots {
            self.walk(root, &mut out).await?;
        }
        if !get_oids.is_empty() {
            if get_oids.len() > 1 && self.version == 2 {
                let response = self.request(PDU_GETBULK, 0, 1, &get_oids).await?;
                for (oid, value) in response.binds {
                    out.push((dotted(&oid), value));
                }
            } else {
                for oid in &get_oids {
                    let response = self
                        .request(PDU_GET, 0, 0, std::slice::from_ref(oid))
                        .await?;
                    if response.error_status != 0 {
                        return Err(Error::proto(format!(
                            "snmp error status {} for {}",
                            response.error_status,
                            dotted(oid)
                        )));
                    }
                    for (oid, value) in response.binds {
                        out.push((dotted(&oid), value));
                    }
                }
            }
        }
        Ok(Payload::VarBinds(out))
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }
}
