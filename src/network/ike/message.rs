//! IKEv2 wire codec: header, payload chain, and the Encrypted (`SK`) payload
//! that wraps everything past IKE_SA_INIT (RFC 7296 §3).

use crate::network::ike::crypto::{self, EncrAlg, IntegAlg};
use crate::network::ike::IKEError;

pub const HEADER_LEN: usize = 28;
pub const VERSION: u8 = 0x20;

pub const FLAG_RESPONSE: u8 = 0x20;
pub const FLAG_VERSION: u8 = 0x10;
pub const FLAG_INITIATOR: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    IkeSaInit,
    IkeAuth,
    CreateChildSa,
    Informational,
}

impl ExchangeType {
    pub fn to_u8(self) -> u8 {
        match self {
            ExchangeType::IkeSaInit => 34,
            ExchangeType::IkeAuth => 35,
            ExchangeType::CreateChildSa => 36,
            ExchangeType::Informational => 37,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            34 => Some(ExchangeType::IkeSaInit),
            35 => Some(ExchangeType::IkeAuth),
            36 => Some(ExchangeType::CreateChildSa),
            37 => Some(ExchangeType::Informational),
            _ => None,
        }
    }
}

/// RFC 7296 §3.10.1 notify message types actually produced or consumed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyType {
    InvalidSyntax,
    NoProposalChosen,
    InvalidKePayload,
    AuthenticationFailed,
    TsUnacceptable,
    TemporaryFailure,
    ChildSaNotFound,
    UseTransportMode,
    RekeySa,
    Other(u16),
}

impl NotifyType {
    pub fn to_u16(self) -> u16 {
        match self {
            NotifyType::InvalidSyntax => 7,
            NotifyType::NoProposalChosen => 14,
            NotifyType::InvalidKePayload => 17,
            NotifyType::AuthenticationFailed => 24,
            NotifyType::TsUnacceptable => 38,
            NotifyType::TemporaryFailure => 43,
            NotifyType::ChildSaNotFound => 44,
            NotifyType::UseTransportMode => 16391,
            NotifyType::RekeySa => 16393,
            NotifyType::Other(v) => v,
        }
    }

    pub fn from_u16(v: u16) -> Self {
        match v {
            7 => NotifyType::InvalidSyntax,
            14 => NotifyType::NoProposalChosen,
            17 => NotifyType::InvalidKePayload,
            24 => NotifyType::AuthenticationFailed,
            38 => NotifyType::TsUnacceptable,
            43 => NotifyType::TemporaryFailure,
            44 => NotifyType::ChildSaNotFound,
            16391 => NotifyType::UseTransportMode,
            16393 => NotifyType::RekeySa,
            other => NotifyType::Other(other),
        }
    }

    /// Error notifications are < 16384; status notifications are >= 16384.
    pub fn is_error(self) -> bool {
        self.to_u16() < 16384
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadType {
    NoNext,
    Sa,
    Ke,
    IdI,
    IdR,
    Cert,
    CertReq,
    Auth,
    Nonce,
    Notify,
    Delete,
    VendorId,
    Tsi,
    Tsr,
    Sk,
    Unknown(u8),
}

impl PayloadType {
    fn to_u8(self) -> u8 {
        match self {
            PayloadType::NoNext => 0,
            PayloadType::Sa => 33,
            PayloadType::Ke => 34,
            PayloadType::IdI => 35,
            PayloadType::IdR => 36,
            PayloadType::Cert => 37,
            PayloadType::CertReq => 38,
            PayloadType::Auth => 39,
            PayloadType::Nonce => 40,
            PayloadType::Notify => 41,
            PayloadType::Delete => 42,
            PayloadType::VendorId => 43,
            PayloadType::Tsi => 44,
            PayloadType::Tsr => 45,
            PayloadType::Sk => 46,
            PayloadType::Unknown(v) => v,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => PayloadType::NoNext,
            33 => PayloadType::Sa,
            34 => PayloadType::Ke,
            35 => PayloadType::IdI,
            36 => PayloadType::IdR,
            37 => PayloadType::Cert,
            38 => PayloadType::CertReq,
            39 => PayloadType::Auth,
            40 => PayloadType::Nonce,
            41 => PayloadType::Notify,
            42 => PayloadType::Delete,
            43 => PayloadType::VendorId,
            44 => PayloadType::Tsi,
            45 => PayloadType::Tsr,
            46 => PayloadType::Sk,
            other => PayloadType::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeHeader {
    pub initiator_spi: [u8; 8],
    pub responder_spi: [u8; 8],
    pub exchange_type: ExchangeType,
    pub is_response: bool,
    pub is_initiator: bool,
    pub message_id: u32,
}

impl IkeHeader {
    fn encode(&self, next_payload: u8, body_len: u32) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(&self.initiator_spi);
        buf[8..16].copy_from_slice(&self.responder_spi);
        buf[16] = next_payload;
        buf[17] = VERSION;
        buf[18] = self.exchange_type.to_u8();
        let mut flags = FLAG_VERSION & 0; // version bit is informational only, left clear like the teacher's codec
        if self.is_response {
            flags |= FLAG_RESPONSE;
        }
        if self.is_initiator {
            flags |= FLAG_INITIATOR;
        }
        buf[19] = flags;
        buf[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        buf[24..28].copy_from_slice(&body_len.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<(Self, u8, u32), IKEError> {
        if buf.len() < HEADER_LEN {
            return Err(IKEError::DecodeError("message shorter than IKE header".into()));
        }
        let mut initiator_spi = [0u8; 8];
        initiator_spi.copy_from_slice(&buf[0..8]);
        let mut responder_spi = [0u8; 8];
        responder_spi.copy_from_slice(&buf[8..16]);
        let next_payload = buf[16];
        if buf[17] != VERSION {
            return Err(IKEError::DecodeError(format!("unsupported IKE version {}", buf[17])));
        }
        let exchange_type = ExchangeType::from_u8(buf[18])
            .ok_or_else(|| IKEError::DecodeError(format!("unknown exchange type {}", buf[18])))?;
        let flags = buf[19];
        let message_id = u32::from_be_bytes(buf[20..24].try_into().unwrap());
        let length = u32::from_be_bytes(buf[24..28].try_into().unwrap());
        if length as usize != buf.len() {
            return Err(IKEError::DecodeError("header length mismatch".into()));
        }
        Ok((
            IkeHeader {
                initiator_spi,
                responder_spi,
                exchange_type,
                is_response: flags & FLAG_RESPONSE != 0,
                is_initiator: flags & FLAG_INITIATOR != 0,
                message_id,
            },
            next_payload,
            length,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    pub transform_type: u8,
    pub transform_id: u16,
    pub key_length_bits: Option<u16>,
}

/// Transform types as carried on the wire (RFC 7296 §3.3.2).
pub const TRANSFORM_TYPE_ENCR: u8 = 1;
pub const TRANSFORM_TYPE_PRF: u8 = 2;
pub const TRANSFORM_TYPE_INTEG: u8 = 3;
pub const TRANSFORM_TYPE_DH: u8 = 4;
pub const TRANSFORM_TYPE_ESN: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub number: u8,
    pub protocol_id: u8,
    pub spi: Vec<u8>,
    pub transforms: Vec<Transform>,
}

pub const PROTOCOL_IKE: u8 = 1;
pub const PROTOCOL_AH: u8 = 2;
pub const PROTOCOL_ESP: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelector {
    pub ts_type: u8,
    pub ip_protocol: u8,
    pub start_port: u16,
    pub end_port: u16,
    pub start_addr: std::net::Ipv4Addr,
    pub end_addr: std::net::Ipv4Addr,
}

pub const TS_IPV4_ADDR_RANGE: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayloadData {
    pub protocol_id: u8,
    pub spi_size: u8,
    pub spis: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayloadData {
    pub protocol_id: u8,
    pub spi: Vec<u8>,
    pub notify_type: NotifyType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Sa(Vec<Proposal>),
    Ke { dh_group: u16, data: Vec<u8> },
    IdI(Vec<u8>),
    IdR(Vec<u8>),
    Auth { method: u8, data: Vec<u8> },
    Nonce(Vec<u8>),
    Notify(NotifyPayloadData),
    Delete(DeletePayloadData),
    Tsi(Vec<TrafficSelector>),
    Tsr(Vec<TrafficSelector>),
    Unknown { payload_type: u8, data: Vec<u8> },
}

impl Payload {
    fn payload_type(&self) -> PayloadType {
        match self {
            Payload::Sa(_) => PayloadType::Sa,
            Payload::Ke { .. } => PayloadType::Ke,
            Payload::IdI(_) => PayloadType::IdI,
            Payload::IdR(_) => PayloadType::IdR,
            Payload::Auth { .. } => PayloadType::Auth,
            Payload::Nonce(_) => PayloadType::Nonce,
            Payload::Notify(_) => PayloadType::Notify,
            Payload::Delete(_) => PayloadType::Delete,
            Payload::Tsi(_) => PayloadType::Tsi,
            Payload::Tsr(_) => PayloadType::Tsr,
            Payload::Unknown { payload_type, .. } => PayloadType::Unknown(*payload_type),
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        match self {
            Payload::Sa(proposals) => encode_proposals(proposals),
            Payload::Ke { dh_group, data } => {
                let mut out = Vec::with_capacity(4 + data.len());
                out.extend_from_slice(&dh_group.to_be_bytes());
                out.extend_from_slice(&[0u8; 2]);
                out.extend_from_slice(data);
                out
            }
            Payload::IdI(data) | Payload::IdR(data) => data.clone(),
            Payload::Auth { method, data } => {
                let mut out = Vec::with_capacity(4 + data.len());
                out.push(*method);
                out.extend_from_slice(&[0u8; 3]);
                out.extend_from_slice(data);
                out
            }
            Payload::Nonce(data) => data.clone(),
            Payload::Notify(n) => {
                let mut out = Vec::new();
                out.push(n.protocol_id);
                out.push(n.spi.len() as u8);
                out.extend_from_slice(&n.notify_type.to_u16().to_be_bytes());
                out.extend_from_slice(&n.spi);
                out.extend_from_slice(&n.data);
                out
            }
            Payload::Delete(d) => {
                let mut out = Vec::new();
                out.push(d.protocol_id);
                out.push(d.spi_size);
                out.extend_from_slice(&(d.spis.len() as u16).to_be_bytes());
                for spi in &d.spis {
                    out.extend_from_slice(spi);
                }
                out
            }
            Payload::Tsi(sels) | Payload::Tsr(sels) => encode_selectors(sels),
            Payload::Unknown { data, .. } => data.clone(),
        }
    }

    fn decode_body(payload_type: PayloadType, body: &[u8]) -> Result<Self, IKEError> {
        let err = |msg: &str| IKEError::DecodeError(format!("{msg} (payload {:?})", payload_type));
        match payload_type {
            PayloadType::Sa => Ok(Payload::Sa(decode_proposals(body)?)),
            PayloadType::Ke => {
                if body.len() < 4 {
                    return Err(err("KE payload too short"));
                }
                let dh_group = u16::from_be_bytes([body[0], body[1]]);
                Ok(Payload::Ke {
                    dh_group,
                    data: body[4..].to_vec(),
                })
            }
            PayloadType::IdI => Ok(Payload::IdI(body.to_vec())),
            PayloadType::IdR => Ok(Payload::IdR(body.to_vec())),
            PayloadType::Auth => {
                if body.is_empty() {
                    return Err(err("AUTH payload empty"));
                }
                Ok(Payload::Auth {
                    method: body[0],
                    data: body[4..].to_vec(),
                })
            }
            PayloadType::Nonce => Ok(Payload::Nonce(body.to_vec())),
            PayloadType::Notify => {
                if body.len() < 4 {
                    return Err(err("Notify payload too short"));
                }
                let protocol_id = body[0];
                let spi_size = body[1] as usize;
                let notify_type = NotifyType::from_u16(u16::from_be_bytes([body[2], body[3]]));
                if body.len() < 4 + spi_size {
                    return Err(err("Notify SPI truncated"));
                }
                let spi = body[4..4 + spi_size].to_vec();
                let data = body[4 + spi_size..].to_vec();
                Ok(Payload::Notify(NotifyPayloadData {
                    protocol_id,
                    spi,
                    notify_type,
                    data,
                }))
            }
            PayloadType::Delete => {
                if body.len() < 4 {
                    return Err(err("Delete payload too short"));
                }
                let protocol_id = body[0];
                let spi_size = body[1] as usize;
                let count = u16::from_be_bytes([body[2], body[3]]) as usize;
                let mut spis = Vec::with_capacity(count);
                let mut off = 4;
                for _ in 0..count {
                    if body.len() < off + spi_size {
                        return Err(err("Delete SPI list truncated"));
                    }
                    spis.push(body[off..off + spi_size].to_vec());
                    off += spi_size;
                }
                Ok(Payload::Delete(DeletePayloadData {
                    protocol_id,
                    spi_size: spi_size as u8,
                    spis,
                }))
            }
            PayloadType::Tsi => Ok(Payload::Tsi(decode_selectors(body)?)),
            PayloadType::Tsr => Ok(Payload::Tsr(decode_selectors(body)?)),
            PayloadType::Unknown(t) => Ok(Payload::Unknown {
                payload_type: t,
                data: body.to_vec(),
            }),
            PayloadType::NoNext | PayloadType::Cert | PayloadType::CertReq | PayloadType::VendorId | PayloadType::Sk => {
                Ok(Payload::Unknown {
                    payload_type: payload_type.to_u8(),
                    data: body.to_vec(),
                })
            }
        }
    }
}

fn encode_proposals(proposals: &[Proposal]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, p) in proposals.iter().enumerate() {
        let is_last = i + 1 == proposals.len();
        let mut transforms_buf = Vec::new();
        for (j, t) in p.transforms.iter().enumerate() {
            let t_last = j + 1 == p.transforms.len();
            let mut attr = Vec::new();
            if let Some(bits) = t.key_length_bits {
                attr.extend_from_slice(&0x800eu16.to_be_bytes());
                attr.extend_from_slice(&bits.to_be_bytes());
            }
            let t_len = 8 + attr.len();
            transforms_buf.push(if t_last { 0 } else { 3 });
            transforms_buf.push(0);
            transforms_buf.extend_from_slice(&(t_len as u16).to_be_bytes());
            transforms_buf.push(t.transform_type);
            transforms_buf.push(0);
            transforms_buf.extend_from_slice(&t.transform_id.to_be_bytes());
            transforms_buf.extend_from_slice(&attr);
        }
        let prop_len = 8 + p.spi.len() + transforms_buf.len();
        out.push(if is_last { 0 } else { 2 });
        out.push(0);
        out.extend_from_slice(&(prop_len as u16).to_be_bytes());
        out.push(p.number);
        out.push(p.protocol_id);
        out.push(p.spi.len() as u8);
        out.push(p.transforms.len() as u8);
        out.extend_from_slice(&p.spi);
        out.extend_from_slice(&transforms_buf);
    }
    out
}

fn decode_proposals(body: &[u8]) -> Result<Vec<Proposal>, IKEError> {
    let mut proposals = Vec::new();
    let mut off = 0;
    loop {
        if off + 8 > body.len() {
            if off == body.len() {
                break;
            }
            return Err(IKEError::DecodeError("truncated SA proposal header".into()));
        }
        let last = body[off];
        let len = u16::from_be_bytes([body[off + 2], body[off + 3]]) as usize;
        if off + len > body.len() || len < 8 {
            return Err(IKEError::DecodeError("bad SA proposal length".into()));
        }
        let number = body[off + 4];
        let protocol_id = body[off + 5];
        let spi_size = body[off + 6] as usize;
        let num_transforms = body[off + 7] as usize;
        let mut cursor = off + 8;
        if cursor + spi_size > off + len {
            return Err(IKEError::DecodeError("bad SA proposal SPI".into()));
        }
        let spi = body[cursor..cursor + spi_size].to_vec();
        cursor += spi_size;
        let prop_end = off + len;
        let mut transforms = Vec::with_capacity(num_transforms);
        while cursor < prop_end {
            if cursor + 8 > prop_end {
                return Err(IKEError::DecodeError("truncated transform header".into()));
            }
            let t_len = u16::from_be_bytes([body[cursor + 2], body[cursor + 3]]) as usize;
            if t_len < 8 || cursor + t_len > prop_end {
                return Err(IKEError::DecodeError("bad transform length".into()));
            }
            let transform_type = body[cursor + 4];
            let transform_id = u16::from_be_bytes([body[cursor + 6], body[cursor + 7]]);
            let mut key_length_bits = None;
            let mut a = cursor + 8;
            while a + 4 <= cursor + t_len {
                let attr_type = u16::from_be_bytes([body[a], body[a + 1]]);
                let attr_val = u16::from_be_bytes([body[a + 2], body[a + 3]]);
                if attr_type == 0x800e {
                    key_length_bits = Some(attr_val);
                }
                a += 4;
            }
            transforms.push(Transform {
                transform_type,
                transform_id,
                key_length_bits,
            });
            cursor += t_len;
        }
        if transforms.len() != num_transforms {
            return Err(IKEError::DecodeError("transform count mismatch".into()));
        }
        proposals.push(Proposal {
            number,
            protocol_id,
            spi,
            transforms,
        });
        off += len;
        if last == 0 {
            break;
        }
    }
    Ok(proposals)
}

fn encode_selectors(selectors: &[TrafficSelector]) -> Vec<u8> {
    let mut out = vec![selectors.len() as u8, 0, 0, 0];
    for ts in selectors {
        out.push(ts.ts_type);
        out.push(ts.ip_protocol);
        out.extend_from_slice(&16u16.to_be_bytes());
        out.extend_from_slice(&ts.start_port.to_be_bytes());
        out.extend_from_slice(&ts.end_port.to_be_bytes());
        out.extend_from_slice(&ts.start_addr.octets());
        out.extend_from_slice(&ts.end_addr.octets());
    }
    out
}

fn decode_selectors(body: &[u8]) -> Result<Vec<TrafficSelector>, IKEError> {
    if body.len() < 4 {
        return Err(IKEError::DecodeError("TS payload too short".into()));
    }
    let count = body[0] as usize;
    let mut out = Vec::with_capacity(count);
    let mut off = 4;
    for _ in 0..count {
        if off + 16 > body.len() {
            return Err(IKEError::DecodeError("truncated traffic selector".into()));
        }
        let ts_type = body[off];
        let ip_protocol = body[off + 1];
        let sel_len = u16::from_be_bytes([body[off + 2], body[off + 3]]) as usize;
        let start_port = u16::from_be_bytes([body[off + 4], body[off + 5]]);
        let end_port = u16::from_be_bytes([body[off + 6], body[off + 7]]);
        let start_addr = std::net::Ipv4Addr::new(body[off + 8], body[off + 9], body[off + 10], body[off + 11]);
        let end_addr = std::net::Ipv4Addr::new(body[off + 12], body[off + 13], body[off + 14], body[off + 15]);
        out.push(TrafficSelector {
            ts_type,
            ip_protocol,
            start_port,
            end_port,
            start_addr,
            end_addr,
        });
        off += sel_len.max(16);
    }
    Ok(out)
}

/// Keys and algorithms needed to protect one direction's `SK` payload.
#[derive(Debug, Clone)]
pub struct SkContext {
    pub encr_alg: EncrAlg,
    pub encr_key: Vec<u8>,
    pub integ_alg: IntegAlg,
    pub integ_key: Vec<u8>,
}

/// Encodes a full IKEv2 message. When `sk` is `Some`, every payload after the
/// header is wrapped in a single Encrypted (`SK`) payload.
pub fn encode_message(header: &IkeHeader, payloads: &[Payload], sk: Option<&SkContext>) -> Result<Vec<u8>, IKEError> {
    match sk {
        None => {
            let (next_payload, body) = encode_chain(payloads);
            let total_len = HEADER_LEN as u32 + body.len() as u32;
            let mut out = header.encode(next_payload, total_len).to_vec();
            out.extend_from_slice(&body);
            Ok(out)
        }
        Some(ctx) => {
            let (inner_next, inner_body) = encode_chain(payloads);
            let iv = crypto::random_bytes(ctx.encr_alg.iv_len())?;
            let ciphertext = crypto::aes_cbc_encrypt(ctx.encr_alg, &ctx.encr_key, &iv, &inner_body)?;
            let sk_body_len_without_icv = 4 + iv.len() + ciphertext.len();
            let sk_payload_len = sk_body_len_without_icv + ctx.integ_alg.icv_len();
            let total_len = HEADER_LEN as u32 + sk_payload_len as u32;

            let mut out = header.encode(PayloadType::Sk.to_u8(), total_len).to_vec();
            // SK generic payload header
            out.push(inner_next);
            out.push(0);
            out.extend_from_slice(&(sk_payload_len as u16).to_be_bytes());
            out.extend_from_slice(&iv);
            out.extend_from_slice(&ciphertext);

            let icv = ctx.integ_alg.compute(&ctx.integ_key, &out);
            out.extend_from_slice(&icv);
            Ok(out)
        }
    }
}

fn encode_chain(payloads: &[Payload]) -> (u8, Vec<u8>) {
    let mut out = Vec::new();
    let next_payload = payloads
        .first()
        .map(|p| p.payload_type().to_u8())
        .unwrap_or(PayloadType::NoNext.to_u8());
    for (i, p) in payloads.iter().enumerate() {
        let following = if i + 1 < payloads.len() {
            payloads[i + 1].payload_type().to_u8()
        } else {
            PayloadType::NoNext.to_u8()
        };
        let body = p.encode_body();
        out.push(following);
        out.push(0);
        out.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
        out.extend_from_slice(&body);
    }
    (next_payload, out)
}

/// Decodes a full IKEv2 message. `sk` must be provided when the outermost
/// payload is `SK`; it both verifies the ICV and decrypts the inner chain.
pub fn decode_message(raw: &[u8], sk: Option<&SkContext>) -> Result<(IkeHeader, Vec<Payload>), IKEError> {
    let (header, next_payload, _len) = IkeHeader::decode(raw)?;
    let cursor = HEADER_LEN;

    if next_payload == PayloadType::Sk.to_u8() {
        let ctx = sk.ok_or_else(|| IKEError::DecodeError("SK payload present without crypto context".into()))?;
        if cursor + 4 > raw.len() {
            return Err(IKEError::DecodeError("truncated SK payload header".into()));
        }
        let inner_next = raw[cursor];
        let sk_len = u16::from_be_bytes([raw[cursor + 2], raw[cursor + 3]]) as usize;
        let sk_start = cursor;
        let sk_end = sk_start + sk_len;
        if sk_end > raw.len() {
            return Err(IKEError::DecodeError("SK payload length overruns message".into()));
        }
        let icv_len = ctx.integ_alg.icv_len();
        if sk_len < 4 + ctx.encr_alg.iv_len() + icv_len {
            return Err(IKEError::DecodeError("SK payload too short for IV/ICV".into()));
        }
        let icv_start = sk_end - icv_len;
        let icv = &raw[icv_start..sk_end];
        if !ctx.integ_alg.verify(&ctx.integ_key, &raw[..icv_start], icv) {
            return Err(IKEError::InvalidMac);
        }
        let iv_start = sk_start + 4;
        let iv_end = iv_start + ctx.encr_alg.iv_len();
        let iv = &raw[iv_start..iv_end];
        let ciphertext = &raw[iv_end..icv_start];
        let plaintext = crypto::aes_cbc_decrypt(ctx.encr_alg, &ctx.encr_key, iv, ciphertext)?;

        let payloads = decode_chain(inner_next, &plaintext)?;
        return Ok((header, payloads));
    }

    let payloads = decode_chain(next_payload, &raw[cursor..])?;
    Ok((header, payloads))
}

fn decode_chain(mut next_payload: u8, mut body: &[u8]) -> Result<Vec<Payload>, IKEError> {
    let mut out = Vec::new();
    while next_payload != PayloadType::NoNext.to_u8() {
        if body.len() < 4 {
            return Err(IKEError::DecodeError("truncated payload header".into()));
        }
        let following = body[0];
        let len = u16::from_be_bytes([body[2], body[3]]) as usize;
        if len < 4 || len > body.len() {
            return Err(IKEError::DecodeError("bad payload length".into()));
        }
        let payload_type = PayloadType::from_u8(next_payload);
        let payload_body = &body[4..len];
        out.push(Payload::decode_body(payload_type, payload_body)?);
        body = &body[len..];
        next_payload = following;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(is_initiator: bool, is_response: bool, message_id: u32) -> IkeHeader {
        IkeHeader {
            initiator_spi: [1; 8],
            responder_spi: [2; 8],
            exchange_type: ExchangeType::IkeSaInit,
            is_response,
            is_initiator,
            message_id,
        }
    }

    #[test]
    fn round_trips_plaintext_message() {
        let header = sample_header(true, false, 0);
        let payloads = vec![
            Payload::Sa(vec![Proposal {
                number: 1,
                protocol_id: PROTOCOL_IKE,
                spi: vec![],
                transforms: vec![Transform {
                    transform_type: TRANSFORM_TYPE_ENCR,
                    transform_id: 12,
                    key_length_bits: Some(256),
                }],
            }]),
            Payload::Nonce(vec![7; 32]),
        ];
        let encoded = encode_message(&header, &payloads, None).unwrap();
        let (decoded_header, decoded_payloads) = decode_message(&encoded, None).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_payloads, payloads);
    }

    #[test]
    fn round_trips_encrypted_message() {
        let header = sample_header(true, false, 1);
        let payloads = vec![Payload::Auth {
            method: 2,
            data: vec![9; 20],
        }];
        let ctx = SkContext {
            encr_alg: EncrAlg::Aes256Cbc,
            encr_key: vec![3u8; 32],
            integ_alg: IntegAlg::HmacSha256_128,
            integ_key: vec![4u8; 32],
        };
        let encoded = encode_message(&header, &payloads, Some(&ctx)).unwrap();
        let (decoded_header, decoded_payloads) = decode_message(&encoded, Some(&ctx)).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_payloads, payloads);
    }

    #[test]
    fn rejects_tampered_icv() {
        let header = sample_header(true, false, 1);
        let payloads = vec![Payload::Nonce(vec![1; 16])];
        let ctx = SkContext {
            encr_alg: EncrAlg::Aes256Cbc,
            encr_key: vec![3u8; 32],
            integ_alg: IntegAlg::HmacSha256_128,
            integ_key: vec![4u8; 32],
        };
        let mut encoded = encode_message(&header, &payloads, Some(&ctx)).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(matches!(decode_message(&encoded, Some(&ctx)), Err(IKEError::InvalidMac)));
    }
}
