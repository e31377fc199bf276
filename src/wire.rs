//! Userauth sub-protocol wire messages.
//!
//! Only the messages the relay inspects get typed representations here;
//! everything else is relayed as opaque packets. Primitive fields use the
//! `ssh-encoding` codecs (length-prefixed strings, big-endian u32,
//! comma-separated name-lists).

use ssh_encoding::{Decode, Encode, Reader};

use crate::error::WireError;

pub const MSG_IGNORE: u8 = 2;
pub const MSG_DEBUG: u8 = 4;
pub const MSG_SERVICE_REQUEST: u8 = 5;
pub const MSG_SERVICE_ACCEPT: u8 = 6;
pub const MSG_EXT_INFO: u8 = 7;
pub const MSG_KEX_INIT: u8 = 20;
pub const MSG_KEX_REPLY: u8 = 21;
pub const MSG_USERAUTH_REQUEST: u8 = 50;
pub const MSG_USERAUTH_FAILURE: u8 = 51;
pub const MSG_USERAUTH_SUCCESS: u8 = 52;
pub const MSG_USERAUTH_BANNER: u8 = 53;
pub const MSG_USERAUTH_PK_OK: u8 = 60;

/// Service negotiated before authentication may begin.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";
/// Service every authentication request must name.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

pub type WireResult<T> = Result<T, WireError>;

/// Returns the type byte of a packet, rejecting empty packets.
pub fn packet_type(packet: &[u8]) -> WireResult<u8> {
    packet.first().copied().ok_or(WireError::Truncated)
}

pub(crate) fn read_u8(reader: &mut impl Reader) -> WireResult<u8> {
    let mut byte = [0u8; 1];
    reader.read(&mut byte).map_err(|_| WireError::Truncated)?;
    Ok(byte[0])
}

pub(crate) fn read_bool(reader: &mut impl Reader) -> WireResult<bool> {
    Ok(read_u8(reader)? != 0)
}

pub(crate) fn read_string(reader: &mut impl Reader) -> WireResult<Vec<u8>> {
    Ok(Vec::<u8>::decode(reader)?)
}

pub(crate) fn read_text(reader: &mut impl Reader) -> WireResult<String> {
    Ok(String::decode(reader)?)
}

pub(crate) fn read_rest(reader: &mut impl Reader) -> WireResult<Vec<u8>> {
    let mut rest = vec![0u8; reader.remaining_len()];
    if !rest.is_empty() {
        reader.read(&mut rest).map_err(|_| WireError::Truncated)?;
    }
    Ok(rest)
}

pub(crate) fn put_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    // Infallible for Vec writers.
    let _ = bytes.encode(buf);
}

pub(crate) fn put_text(buf: &mut Vec<u8>, text: &str) {
    let _ = text.encode(buf);
}

pub(crate) fn put_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(u8::from(value));
}

/// SSH_MSG_SERVICE_REQUEST / SSH_MSG_SERVICE_ACCEPT. Both carry a single
/// service name; the type byte distinguishes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMessage {
    pub service: String,
}

impl ServiceMessage {
    pub fn request(service: &str) -> Vec<u8> {
        Self::encode_as(MSG_SERVICE_REQUEST, service)
    }

    pub fn accept(service: &str) -> Vec<u8> {
        Self::encode_as(MSG_SERVICE_ACCEPT, service)
    }

    fn encode_as(ty: u8, service: &str) -> Vec<u8> {
        let mut buf = vec![ty];
        put_text(&mut buf, service);
        buf
    }

    pub fn decode(packet: &[u8], expected_type: u8) -> WireResult<Self> {
        let actual = packet_type(packet)?;
        if actual != expected_type {
            return Err(WireError::UnexpectedMessage {
                expected: expected_type,
                actual,
            });
        }
        let mut reader = &packet[1..];
        let service = read_text(&mut reader)?;
        if !reader.is_finished() {
            return Err(WireError::TrailingBytes);
        }
        Ok(Self { service })
    }
}

/// SSH_MSG_USERAUTH_FAILURE: the methods that may continue and the
/// partial-success flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAuthFailure {
    pub methods: Vec<String>,
    pub partial: bool,
}

impl UserAuthFailure {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![MSG_USERAUTH_FAILURE];
        put_text(&mut buf, &self.methods.join(","));
        put_bool(&mut buf, self.partial);
        buf
    }

    pub fn decode(packet: &[u8]) -> WireResult<Self> {
        let actual = packet_type(packet)?;
        if actual != MSG_USERAUTH_FAILURE {
            return Err(WireError::UnexpectedMessage {
                expected: MSG_USERAUTH_FAILURE,
                actual,
            });
        }
        let mut reader = &packet[1..];
        let list = read_text(&mut reader)?;
        let partial = read_bool(&mut reader)?;
        let methods = if list.is_empty() {
            Vec::new()
        } else {
            list.split(',').map(str::to_owned).collect()
        };
        Ok(Self { methods, partial })
    }
}

/// SSH_MSG_USERAUTH_PK_OK: the reply to a public-key query, echoing the
/// algorithm and key blob the client asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkOk {
    pub algorithm: String,
    pub key_blob: Vec<u8>,
}

impl PkOk {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![MSG_USERAUTH_PK_OK];
        put_text(&mut buf, &self.algorithm);
        put_string(&mut buf, &self.key_blob);
        buf
    }

    pub fn decode(packet: &[u8]) -> WireResult<Self> {
        let actual = packet_type(packet)?;
        if actual != MSG_USERAUTH_PK_OK {
            return Err(WireError::UnexpectedMessage {
                expected: MSG_USERAUTH_PK_OK,
                actual,
            });
        }
        let mut reader = &packet[1..];
        let algorithm = read_text(&mut reader)?;
        let key_blob = read_string(&mut reader)?;
        if !reader.is_finished() {
            return Err(WireError::TrailingBytes);
        }
        Ok(Self { algorithm, key_blob })
    }
}

/// SSH_MSG_USERAUTH_SUCCESS carries no fields.
pub fn userauth_success() -> Vec<u8> {
    vec![MSG_USERAUTH_SUCCESS]
}

/// SSH_MSG_USERAUTH_BANNER with an empty language tag.
pub fn userauth_banner(message: &str) -> Vec<u8> {
    let mut buf = vec![MSG_USERAUTH_BANNER];
    put_text(&mut buf, message);
    put_text(&mut buf, "");
    buf
}
