//! Broker packet codec.
//!
//! Covers the MQTT 3.1.1 packets the printer's broker exchanges with slicers.
//! Decoding works on a byte buffer that may hold a partial packet:
//! `Ok(None)` means "read more", never an error.

/// Largest packet accepted. Slicer commands are a few hundred bytes.
pub const MAX_PACKET: usize = 1024 * 1024;

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

pub const CONNACK_ACCEPTED: u8 = 0;
pub const CONNACK_BAD_PROTOCOL: u8 = 1;
pub const CONNACK_NOT_AUTHORIZED: u8 = 5;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed remaining length")]
    MalformedLength,

    #[error("packet of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("unsupported packet type {0}")]
    UnsupportedType(u8),

    #[error("packet body truncated")]
    Truncated,

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid QoS {0}")]
    InvalidQos(u8),

    #[error("unknown protocol name {0:?}")]
    UnknownProtocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_level: u8,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    /// Present for QoS 1 and 2.
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

impl Publish {
    /// QoS 0 publish, the only kind the broker sends.
    pub fn at_most_once(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            qos: 0,
            retain: false,
            dup: false,
            packet_id: None,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: u8 },
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe { packet_id: u16, filters: Vec<(String, u8)> },
    SubAck { packet_id: u16, codes: Vec<u8> },
    Unsubscribe { packet_id: u16, filters: Vec<String> },
    UnsubAck { packet_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::ConnAck { .. } => "CONNACK",
            Self::Publish(_) => "PUBLISH",
            Self::PubAck { .. } => "PUBACK",
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::SubAck { .. } => "SUBACK",
            Self::Unsubscribe { .. } => "UNSUBSCRIBE",
            Self::UnsubAck { .. } => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

/// Decode the remaining-length field starting at `buf[0]`.
///
/// Returns the value and the number of bytes it occupied.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    for (i, byte) in buf.iter().enumerate().take(4) {
        value |= usize::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 4 {
        Err(CodecError::MalformedLength)
    } else {
        Ok(None)
    }
}

pub fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        // Masked to 7 bits, cannot truncate.
        #[allow(clippy::cast_possible_truncation)]
        let mut byte = (len & 0x7f) as u8;
        len >>= 7;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Decode one packet from the front of `buf`.
///
/// Returns the packet and the number of bytes consumed, or `None` when
/// `buf` does not yet hold a complete packet.
pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>, CodecError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let Some((remaining, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };
    let total = 1 + len_bytes + remaining;
    if total > MAX_PACKET {
        return Err(CodecError::TooLarge(total));
    }
    if buf.len() < total {
        return Ok(None);
    }

    let body = &buf[1 + len_bytes..total];
    let packet = decode_body(first >> 4, first & 0x0f, body)?;
    Ok(Some((packet, total)))
}

fn decode_body(kind: u8, flags: u8, body: &[u8]) -> Result<Packet, CodecError> {
    let mut r = Reader::new(body);
    let packet = match kind {
        CONNECT => Packet::Connect(decode_connect(&mut r)?),
        CONNACK => {
            let ack_flags = r.u8()?;
            Packet::ConnAck {
                session_present: ack_flags & 0x01 != 0,
                code: r.u8()?,
            }
        }
        PUBLISH => {
            let qos = (flags >> 1) & 0x03;
            if qos > 2 {
                return Err(CodecError::InvalidQos(qos));
            }
            let topic = r.string()?;
            let packet_id = if qos > 0 { Some(r.u16()?) } else { None };
            Packet::Publish(Publish {
                topic,
                qos,
                retain: flags & 0x01 != 0,
                dup: flags & 0x08 != 0,
                packet_id,
                payload: r.rest().to_vec(),
            })
        }
        PUBACK => Packet::PubAck { packet_id: r.u16()? },
        SUBSCRIBE => {
            let packet_id = r.u16()?;
            let mut filters = Vec::new();
            while !r.is_empty() {
                let filter = r.string()?;
                let qos = r.u8()?;
                filters.push((filter, qos & 0x03));
            }
            Packet::Subscribe { packet_id, filters }
        }
        SUBACK => Packet::SubAck {
            packet_id: r.u16()?,
            codes: r.rest().to_vec(),
        },
        UNSUBSCRIBE => {
            let packet_id = r.u16()?;
            let mut filters = Vec::new();
            while !r.is_empty() {
                filters.push(r.string()?);
            }
            Packet::Unsubscribe { packet_id, filters }
        }
        UNSUBACK => Packet::UnsubAck { packet_id: r.u16()? },
        PINGREQ => Packet::PingReq,
        PINGRESP => Packet::PingResp,
        DISCONNECT => Packet::Disconnect,
        other => return Err(CodecError::UnsupportedType(other)),
    };
    Ok(packet)
}

fn decode_connect(r: &mut Reader<'_>) -> Result<Connect, CodecError> {
    let protocol = r.string()?;
    if protocol != "MQTT" && protocol != "MQIsdp" {
        return Err(CodecError::UnknownProtocol(protocol));
    }
    let protocol_level = r.u8()?;
    let flags = r.u8()?;
    let keep_alive = r.u16()?;
    let client_id = r.string()?;

    if flags & 0x04 != 0 {
        // Will topic and message are read and dropped.
        r.string()?;
        r.binary()?;
    }
    let username = if flags & 0x80 != 0 { Some(r.string()?) } else { None };
    let password = if flags & 0x40 != 0 {
        Some(r.binary()?.to_vec())
    } else {
        None
    };

    Ok(Connect {
        protocol_level,
        client_id,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        username,
        password,
    })
}

/// Encode `packet` with its fixed header.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut body = Vec::new();
    let first = match packet {
        Packet::Connect(c) => {
            put_str(&mut body, "MQTT");
            body.push(c.protocol_level);
            let mut flags = 0u8;
            if c.clean_session {
                flags |= 0x02;
            }
            if c.username.is_some() {
                flags |= 0x80;
            }
            if c.password.is_some() {
                flags |= 0x40;
            }
            body.push(flags);
            body.extend_from_slice(&c.keep_alive.to_be_bytes());
            put_str(&mut body, &c.client_id);
            if let Some(user) = &c.username {
                put_str(&mut body, user);
            }
            if let Some(pass) = &c.password {
                put_bytes(&mut body, pass);
            }
            CONNECT << 4
        }
        Packet::ConnAck {
            session_present,
            code,
        } => {
            body.push(u8::from(*session_present));
            body.push(*code);
            CONNACK << 4
        }
        Packet::Publish(p) => {
            put_str(&mut body, &p.topic);
            if let Some(id) = p.packet_id {
                body.extend_from_slice(&id.to_be_bytes());
            }
            body.extend_from_slice(&p.payload);
            let mut flags = (p.qos & 0x03) << 1;
            if p.retain {
                flags |= 0x01;
            }
            if p.dup {
                flags |= 0x08;
            }
            (PUBLISH << 4) | flags
        }
        Packet::PubAck { packet_id } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            PUBACK << 4
        }
        Packet::Subscribe { packet_id, filters } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            for (filter, qos) in filters {
                put_str(&mut body, filter);
                body.push(*qos);
            }
            (SUBSCRIBE << 4) | 0x02
        }
        Packet::SubAck { packet_id, codes } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            body.extend_from_slice(codes);
            SUBACK << 4
        }
        Packet::Unsubscribe { packet_id, filters } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            for filter in filters {
                put_str(&mut body, filter);
            }
            (UNSUBSCRIBE << 4) | 0x02
        }
        Packet::UnsubAck { packet_id } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            UNSUBACK << 4
        }
        Packet::PingReq => PINGREQ << 4,
        Packet::PingResp => PINGRESP << 4,
        Packet::Disconnect => DISCONNECT << 4,
    };

    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(first);
    encode_remaining_length(body.len(), &mut out);
    out.extend_from_slice(&body);
    out
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    // Fields are bounded by MAX_PACKET well below u16::MAX in practice;
    // longer input is cut rather than producing a corrupt length prefix.
    let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&bytes[..usize::from(len)]);
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

/// Cursor over a packet body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    const fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn binary(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u16()?;
        self.take(usize::from(len))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let bytes = self.binary()?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        rest
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[path = "codec_tests.rs"]
mod tests;
