//! EtherNet/IP adapter for Allen-Bradley Logix-class controllers.
//!
//! Implements the minimal encapsulation subset the poller needs: register
//! session, unregister session, and the CIP Read Tag service sent through
//! an Unconnected Send wrapper when a backplane route is configured. Tag
//! buffers come back as raw little-endian bytes and are sliced by the
//! byte-offset decoders.

use std::time::Duration;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{split_source, Adapter, Payload, PullPlan};
use crate::decode::{Decoder, OffsetSpec};
use crate::error::{Error, Result};
use crate::pipeline::ProcessStep;
use crate::transform::{TransformChain, TransformSpec};
use crate::types::parse_int_literal;

pub const DEFAULT_PORT: u16 = 44818;

const ENCAP_HEADER_LEN: usize = 24;
const ENCAP_REGISTER_SESSION: u16 = 0x0065;
const ENCAP_UNREGISTER_SESSION: u16 = 0x0066;
const ENCAP_SEND_RR_DATA: u16 = 0x006F;

const CPF_ITEM_NULL: u16 = 0x0000;
const CPF_ITEM_UNCONNECTED_DATA: u16 = 0x00B2;

const CIP_READ_TAG: u8 = 0x4C;
const CIP_UNCONNECTED_SEND: u8 = 0x52;
const CIP_STATUS_OK: u8 = 0x00;
const CIP_TYPE_STRUCT: u16 = 0x02A0;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProtoCfg {
    name: String,
    source: String,
    #[serde(default)]
    path: Option<String>,
    cpu: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PullCfg {
    tag: String,
    size: Option<u32>,
    count: Option<u32>,
    process: Vec<ProcessCfg>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessCfg {
    offset: OffsetSpec,
    #[serde(rename = "set-id")]
    set_id: String,
    #[serde(rename = "type")]
    data_type: String,
    transform: Option<Vec<TransformSpec>>,
}

#[derive(Debug)]
struct TagRequest {
    epath: Vec<u8>,
    elements: u16,
}

pub struct EnipAdapter {
    host: String,
    port: u16,
    timeout: Duration,
    route: Vec<u8>,
    stream: Option<TcpStream>,
    session: u32,
    context: u64,
    pulls: Vec<TagRequest>,
}

pub fn build(
    proto: &serde_yaml::Value,
    pull: &[serde_yaml::Value],
    timeout: f64,
) -> Result<(Box<dyn Adapter>, Vec<PullPlan>)> {
    let proto: ProtoCfg = serde_yaml::from_value(proto.clone())
        .map_err(|e| Error::config(format!("invalid enip proto config: {e}")))?;
    if proto.name != "enip/ab_eip" {
        return Err(Error::config(format!(
            "unsupported protocol: {}",
            proto.name
        )));
    }
    match proto.cpu.as_str() {
        "LGX" | "MLGX800" => {}
        "MLGX" | "PLC" => {
            return Err(Error::config(format!(
                "cpu {} uses PCCC addressing; only CIP symbolic addressing is supported",
                proto.cpu
            )))
        }
        other => return Err(Error::config(format!("invalid cpu: {other}"))),
    }
    let (host, port) = split_source(&proto.source, DEFAULT_PORT)?;
    let route = parse_route(proto.path.as_deref().unwrap_or(""))?;

    let mut pulls = Vec::with_capacity(pull.len());
    let mut plans = Vec::with_capacity(pull.len());
    for raw in pull {
        let cfg: PullCfg = serde_yaml::from_value(raw.clone())
            .map_err(|e| Error::config(format!("invalid enip pull entry: {e}")))?;
        let (request, plan) = compile_pull(&cfg)?;
        pulls.push(request);
        plans.push(plan);
    }

    let adapter = EnipAdapter {
        host,
        port,
        timeout: Duration::from_secs_f64(timeout),
        route,
        stream: None,
        session: 0,
        context: 0,
        pulls,
    };
    Ok((Box::new(adapter), plans))
}

fn compile_pull(cfg: &PullCfg) -> Result<(TagRequest, PullPlan)> {
    let elem_size = cfg.size.unwrap_or(1);
    let elements = cfg.count.unwrap_or(1);
    if elem_size == 0 || elements == 0 {
        return Err(Error::config(format!(
            "{}: size and count must be >= 1",
            cfg.tag
        )));
    }
    let elements = u16::try_from(elements)
        .map_err(|_| Error::config(format!("{}: element count out of range", cfg.tag)))?;
    let total_bytes = elem_size as usize * elements as usize;

    let mut steps = Vec::with_capacity(cfg.process.len());
    for proc in &cfg.process {
        let id = proc.set_id.as_str();
        let offset = proc.offset.resolve_byte()?;
        let decoder = tag_decoder(&proc.data_type, offset)
            .ok_or_else(|| Error::config(format!("{id}: type unsupported: {}", proc.data_type)))?;
        if offset + decoder.span() > total_bytes {
            return Err(Error::config(format!(
                "{id}: offset {offset} reaches past the tag buffer ({total_bytes} bytes)"
            )));
        }
        let chain = TransformChain::bind(
            id,
            proc.transform.as_deref().unwrap_or(&[]),
            Some(decoder.data_type()),
        )?;
        steps.push(ProcessStep::Point {
            id: id.to_string(),
            decoder,
            chain,
        });
    }

    Ok((
        TagRequest {
            epath: encode_tag_path(&cfg.tag)?,
            elements,
        },
        PullPlan { steps },
    ))
}

fn tag_decoder(data_type: &str, offset: usize) -> Option<Decoder> {
    Some(match data_type {
        "real" | "real32" => Decoder::ByteF32 { offset },
        "real64" => Decoder::ByteF64 { offset },
        "uint8" | "byte" => Decoder::ByteU8 { offset },
        "sint8" | "int8" => Decoder::ByteI8 { offset },
        "uint16" | "word" => Decoder::ByteU16 { offset },
        "sint16" | "int16" => Decoder::ByteI16 { offset },
        "uint32" | "dword" => Decoder::ByteU32 { offset },
        "sint32" | "int32" => Decoder::ByteI32 { offset },
        "uint64" | "qword" => Decoder::ByteU64 { offset },
        "sint64" | "int64" => Decoder::ByteI64 { offset },
        _ => return None,
    })
}

/// Backplane route, e.g. `1,0` for the local chassis. Empty when the
/// controller answers directly (MicroLogix 800 class).
fn parse_route(path: &str) -> Result<Vec<u8>> {
    let path = path.trim();
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let mut route = Vec::new();
    for part in path.split(',') {
        let v = parse_int_literal(part)?;
        route.push(
            u8::try_from(v).map_err(|_| Error::config(format!("invalid path segment: {v}")))?,
        );
    }
    if route.len() % 2 != 0 {
        return Err(Error::config(format!("route path must pair up: {path}")));
    }
    Ok(route)
}

/// Encode a dotted tag name with optional array subscripts into a CIP
/// EPATH: ANSI symbolic segments plus numeric element segments.
fn encode_tag_path(tag: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for part in tag.split('.') {
        let (name, indices) = match part.split_once('[') {
            Some((name, rest)) => {
                let inner = rest
                    .strip_suffix(']')
                    .ok_or_else(|| Error::config(format!("malformed subscript in tag {tag}")))?;
                let mut indices = Vec::new();
                for idx in inner.split(',') {
                    let v = parse_int_literal(idx)?;
                    if v < 0 {
                        return Err(Error::config(format!("negative subscript in tag {tag}")));
                    }
                    indices.push(v as u32);
                }
                (name, indices)
            }
            None => (part, Vec::new()),
        };
        if name.is_empty() {
            return Err(Error::config(format!("empty segment in tag {tag}")));
        }
        let bytes = name.as_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(Error::config(format!("tag segment too long: {name}")));
        }
        out.push(0x91);
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
        if bytes.len() % 2 != 0 {
            out.push(0x00);
        }
        for idx in indices {
            if idx <= u8::MAX as u32 {
                out.extend_from_slice(&[0x28, idx as u8]);
            } else if idx <= u16::MAX as u32 {
                out.extend_from_slice(&[0x29, 0x00]);
                out.extend_from_slice(&(idx as u16).to_le_bytes());
            } else {
                out.extend_from_slice(&[0x2A, 0x00]);
                out.extend_from_slice(&idx.to_le_bytes());
            }
        }
    }
    Ok(out)
}

fn encap_header(command: u16, session: u32, context: u64, payload_len: usize) -> Vec<u8> {
    let mut head = vec![0u8; ENCAP_HEADER_LEN];
    LittleEndian::write_u16(&mut head[0..2], command);
    LittleEndian::write_u16(&mut head[2..4], payload_len as u16);
    LittleEndian::write_u32(&mut head[4..8], session);
    // status stays 0; sender context echoes back for request matching
    LittleEndian::write_u64(&mut head[12..20], context);
    head
}

impl EnipAdapter {
    /// CIP read request for one tag, wrapped for the configured route.
    fn read_request(&self, pull: &TagRequest) -> Vec<u8> {
        let mut read = Vec::with_capacity(4 + pull.epath.len());
        read.push(CIP_READ_TAG);
        read.push((pull.epath.len() / 2) as u8);
        read.extend_from_slice(&pull.epath);
        read.extend_from_slice(&pull.elements.to_le_bytes());

        if self.route.is_empty() {
            return read;
        }

        // Unconnected Send through the Connection Manager carries the read
        // across the backplane to the controller slot.
        let mut ucs = Vec::with_capacity(read.len() + 16);
        ucs.push(CIP_UNCONNECTED_SEND);
        ucs.push(0x02);
        ucs.extend_from_slice(&[0x20, 0x06, 0x24, 0x01]);
        ucs.push(0x0A); // priority / tick time
        ucs.push(0x0E); // timeout ticks
        ucs.extend_from_slice(&(read.len() as u16).to_le_bytes());
        ucs.extend_from_slice(&read);
        if read.len() % 2 != 0 {
            ucs.push(0x00);
        }
        ucs.push((self.route.len() / 2) as u8);
        ucs.push(0x00);
        ucs.extend_from_slice(&self.route);
        ucs
    }

    fn rr_data_frame(&mut self, cip: &[u8]) -> Vec<u8> {
        self.context = self.context.wrapping_add(1);
        let mut payload = Vec::with_capacity(16 + cip.len());
        payload.extend_from_slice(&0u32.to_le_bytes()); // interface handle
        payload.extend_from_slice(&(self.timeout.as_secs().min(65535) as u16).to_le_bytes());
        payload.extend_from_slice(&2u16.to_le_bytes()); // item count
        payload.extend_from_slice(&CPF_ITEM_NULL.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&CPF_ITEM_UNCONNECTED_DATA.to_le_bytes());
        payload.extend_from_slice(&(cip.len() as u16).to_le_bytes());
        payload.extend_from_slice(cip);

        let mut frame = encap_header(
            ENCAP_SEND_RR_DATA,
            self.session,
            self.context,
            payload.len(),
        );
        frame.extend_from_slice(&payload);
        frame
    }

    async fn exchange(&mut self, frame: Vec<u8>) -> Result<([u8; ENCAP_HEADER_LEN], Vec<u8>)> {
        let timeout = self.timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::proto("enip session is not connected"))?;
        let io = async {
            stream.write_all(&frame).await?;
            let mut head = [0u8; ENCAP_HEADER_LEN];
            stream.read_exact(&mut head).await?;
            let status = LittleEndian::read_u32(&head[8..12]);
            if status != 0 {
                return Err(Error::proto(format!("enip status {status:#06x}")));
            }
            let len = LittleEndian::read_u16(&head[2..4]) as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            Ok((head, body))
        };
        if timeout.is_zero() {
            io.await
        } else {
            tokio::time::timeout(timeout, io)
                .await
                .map_err(|_| Error::proto("enip request timed out"))?
        }
    }

    /// Pull the CIP reply payload out of a SendRRData response body and
    /// return the tag data (type code stripped).
    fn parse_read_reply(body: &[u8]) -> Result<Vec<u8>> {
        // interface handle (4) + timeout (2) + item count (2)
        if body.len() < 8 {
            return Err(Error::proto("enip reply truncated"));
        }
        let item_count = LittleEndian::read_u16(&body[6..8]) as usize;
        let mut pos = 8;
        let mut cip: Option<&[u8]> = None;
        for _ in 0..item_count {
            if body.len() < pos + 4 {
                return Err(Error::proto("enip reply truncated"));
            }
            let item_type = LittleEndian::read_u16(&body[pos..pos + 2]);
            let item_len = LittleEndian::read_u16(&body[pos + 2..pos + 4]) as usize;
            pos += 4;
            if body.len() < pos + item_len {
                return Err(Error::proto("enip reply truncated"));
            }
            if item_type == CPF_ITEM_UNCONNECTED_DATA {
                cip = Some(&body[pos..pos + item_len]);
            }
            pos += item_len;
        }
        let cip = cip.ok_or_else(|| Error::proto("enip reply carries no data item"))?;

        if cip.len() < 4 {
            return Err(Error::proto("cip reply truncated"));
        }
        let general_status = cip[2];
        if general_status != CIP_STATUS_OK {
            return Err(Error::proto(format!(
                "cip error status {general_status:#04x}"
            )));
        }
        let skip = 4 + cip[3] as usize * 2;
        if cip.len() < skip {
            return Err(Error::proto("cip reply truncated"));
        }
        let mut data = &cip[skip..];

        if data.len() < 2 {
            return Err(Error::proto("cip reply carries no tag data"));
        }
        let type_code = LittleEndian::read_u16(&data[0..2]);
        data = &data[2..];
        if type_code == CIP_TYPE_STRUCT {
            if data.len() < 2 {
                return Err(Error::proto("cip reply carries no structure data"));
            }
            data = &data[2..];
        }
        Ok(data.to_vec())
    }
}

#[async_trait]
impl Adapter for EnipAdapter {
    async fn connect(&mut self) -> Result<()> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = if self.timeout.is_zero() {
            connect.await?
        } else {
            tokio::time::timeout(self.timeout, connect)
                .await
                .map_err(|_| Error::proto("enip connect timed out"))??
        };
        self.stream = Some(stream);
        self.session = 0;

        let mut frame = encap_header(ENCAP_REGISTER_SESSION, 0, 0, 4);
        frame.extend_from_slice(&1u16.to_le_bytes()); // protocol version
        frame.extend_from_slice(&0u16.to_le_bytes());
        let (head, _) = self.exchange(frame).await?;
        self.session = LittleEndian::read_u32(&head[4..8]);
        if self.session == 0 {
            return Err(Error::proto("enip session registration refused"));
        }
        Ok(())
    }

    async fn fetch(&mut self, pull: usize) -> Result<Payload> {
        let request = {
            let req = self
                .pulls
                .get(pull)
                .ok_or_else(|| Error::proto(format!("unknown pull index {pull}")))?;
            self.read_request(req)
        };
        let frame = self.rr_data_frame(&request);
        let (_, body) = self.exchange(frame).await?;
        Ok(Payload::TagData(Self::parse_read_reply(&body)?))
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            let frame = encap_header(ENCAP_UNREGISTER_SESSION, self.session, 0, 0);
            let _ = stream.write_all(&frame).await;
        }
        self.stream = None;
        self.session = 0;
        Ok(())
    }
}
