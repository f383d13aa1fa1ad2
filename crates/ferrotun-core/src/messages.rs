//! Handshake and transport message layouts.
//!
//! Every message starts with a one-byte type followed by three reserved
//! zero bytes (a little-endian `u32` on the wire). Integer fields are
//! little-endian.
//!
//! ```text
//! Initiation (148 bytes)
//! [type:1][reserved:3][sender:4][ephemeral:32][static:32+16][timestamp:12+16][mac1:16][mac2:16]
//!
//! Response (92 bytes)
//! [type:1][reserved:3][sender:4][receiver:4][ephemeral:32][empty:0+16][mac1:16][mac2:16]
//!
//! Cookie reply (64 bytes)
//! [type:1][reserved:3][receiver:4][nonce:24][cookie:16+16]
//!
//! Transport (>= 32 bytes)
//! [type:1][reserved:3][receiver:4][counter:8][ciphertext:n+16]
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    CoreError, COOKIE_LEN, COOKIE_NONCE_LEN, KEY_LEN, MAC_LEN, MAX_MESSAGE_SIZE, TAG_LEN,
    TIMESTAMP_LEN,
};

const TYPE_HEADER_LEN: usize = 4;

/// Message type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Handshake initiation (initiator → responder).
    Initiation = 1,
    /// Handshake response (responder → initiator).
    Response = 2,
    /// Cookie challenge issued by a responder under load.
    CookieReply = 3,
    /// Encrypted tunnel data.
    Transport = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Initiation),
            2 => Ok(Self::Response),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::Transport),
            _ => Err(CoreError::UnknownType(value)),
        }
    }
}

/// Classify a datagram by its type header.
pub fn message_type(packet: &[u8]) -> Result<MessageType, CoreError> {
    if packet.len() < TYPE_HEADER_LEN {
        return Err(CoreError::TooShort(packet.len(), TYPE_HEADER_LEN));
    }
    if packet[1..TYPE_HEADER_LEN] != [0u8; 3] {
        return Err(CoreError::ReservedBits);
    }
    MessageType::try_from(packet[0])
}

fn put_type(buf: &mut BytesMut, ty: MessageType) {
    buf.put_u8(ty as u8);
    buf.put_bytes(0, TYPE_HEADER_LEN - 1);
}

/// Validate type and exact length, returning the body after the type header.
fn fixed_body(packet: &[u8], ty: MessageType, size: usize) -> Result<&[u8], CoreError> {
    let found = message_type(packet)?;
    if found != ty {
        return Err(CoreError::UnexpectedType {
            found: found as u8,
            expected: ty as u8,
        });
    }
    if packet.len() != size {
        return Err(CoreError::InvalidLength(packet.len(), size));
    }
    Ok(&packet[TYPE_HEADER_LEN..])
}

fn take<const N: usize>(buf: &mut &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

/// First handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initiation {
    pub sender: u32,
    pub ephemeral: [u8; KEY_LEN],
    pub encrypted_static: [u8; KEY_LEN + TAG_LEN],
    pub encrypted_timestamp: [u8; TIMESTAMP_LEN + TAG_LEN],
    pub mac1: [u8; MAC_LEN],
    pub mac2: [u8; MAC_LEN],
}

impl Initiation {
    pub const SIZE: usize = 148;

    /// Serialize to wire form. MAC fields are written as they are; the
    /// cookie layer overwrites them in place.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        put_type(&mut buf, MessageType::Initiation);
        buf.put_u32_le(self.sender);
        buf.put_slice(&self.ephemeral);
        buf.put_slice(&self.encrypted_static);
        buf.put_slice(&self.encrypted_timestamp);
        buf.put_slice(&self.mac1);
        buf.put_slice(&self.mac2);
        buf
    }

    pub fn decode(packet: &[u8]) -> Result<Self, CoreError> {
        let mut body = fixed_body(packet, MessageType::Initiation, Self::SIZE)?;
        Ok(Self {
            sender: body.get_u32_le(),
            ephemeral: take(&mut body),
            encrypted_static: take(&mut body),
            encrypted_timestamp: take(&mut body),
            mac1: take(&mut body),
            mac2: take(&mut body),
        })
    }
}

/// Second handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub sender: u32,
    pub receiver: u32,
    pub ephemeral: [u8; KEY_LEN],
    pub encrypted_nothing: [u8; TAG_LEN],
    pub mac1: [u8; MAC_LEN],
    pub mac2: [u8; MAC_LEN],
}

impl Response {
    pub const SIZE: usize = 92;

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        put_type(&mut buf, MessageType::Response);
        buf.put_u32_le(self.sender);
        buf.put_u32_le(self.receiver);
        buf.put_slice(&self.ephemeral);
        buf.put_slice(&self.encrypted_nothing);
        buf.put_slice(&self.mac1);
        buf.put_slice(&self.mac2);
        buf
    }

    pub fn decode(packet: &[u8]) -> Result<Self, CoreError> {
        let mut body = fixed_body(packet, MessageType::Response, Self::SIZE)?;
        Ok(Self {
            sender: body.get_u32_le(),
            receiver: body.get_u32_le(),
            ephemeral: take(&mut body),
            encrypted_nothing: take(&mut body),
            mac1: take(&mut body),
            mac2: take(&mut body),
        })
    }
}

/// Cookie challenge returned instead of a response while under load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieReply {
    pub receiver: u32,
    pub nonce: [u8; COOKIE_NONCE_LEN],
    pub encrypted_cookie: [u8; COOKIE_LEN + TAG_LEN],
}

impl CookieReply {
    pub const SIZE: usize = 64;

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        put_type(&mut buf, MessageType::CookieReply);
        buf.put_u32_le(self.receiver);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.encrypted_cookie);
        buf
    }

    pub fn decode(packet: &[u8]) -> Result<Self, CoreError> {
        let mut body = fixed_body(packet, MessageType::CookieReply, Self::SIZE)?;
        Ok(Self {
            receiver: body.get_u32_le(),
            nonce: take(&mut body),
            encrypted_cookie: take(&mut body),
        })
    }
}

/// Header of an encrypted data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub receiver: u32,
    pub counter: u64,
}

impl TransportHeader {
    pub const SIZE: usize = 16;

    /// Start a transport message; the caller appends the ciphertext.
    pub fn encode(&self, ciphertext_len: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE + ciphertext_len);
        put_type(&mut buf, MessageType::Transport);
        buf.put_u32_le(self.receiver);
        buf.put_u64_le(self.counter);
        buf
    }

    /// Split a transport message into header and ciphertext (tag included).
    pub fn decode(packet: &[u8]) -> Result<(Self, &[u8]), CoreError> {
        let found = message_type(packet)?;
        if found != MessageType::Transport {
            return Err(CoreError::UnexpectedType {
                found: found as u8,
                expected: MessageType::Transport as u8,
            });
        }
        if packet.len() < Self::SIZE + TAG_LEN {
            return Err(CoreError::TooShort(packet.len(), Self::SIZE + TAG_LEN));
        }
        if packet.len() > MAX_MESSAGE_SIZE {
            return Err(CoreError::TooLarge(packet.len()));
        }

        let mut body = &packet[TYPE_HEADER_LEN..Self::SIZE];
        let header = Self {
            receiver: body.get_u32_le(),
            counter: body.get_u64_le(),
        };
        Ok((header, &packet[Self::SIZE..]))
    }
}
