//! Parsing and construction of SSH_MSG_USERAUTH_REQUEST messages.

use ssh_encoding::Decode;
use ssh_key::{public::KeyData, Signature};

use crate::error::{AuthError, WireError};
use crate::wire::{self, MSG_USERAUTH_REQUEST, SERVICE_CONNECTION};

/// Signature algorithms the relay will verify or produce. Certificate
/// algorithms are deliberately absent.
const ACCEPTABLE_SIG_ALGOS: &[&str] = &[
    "ssh-ed25519",
    "rsa-sha2-256",
    "rsa-sha2-512",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
];

pub fn acceptable_algorithm(name: &str) -> bool {
    ACCEPTABLE_SIG_ALGOS.contains(&name)
}

/// One authentication request as read off a channel. Immutable once parsed;
/// transformations construct a new request. The method-specific payload is
/// kept opaque until a view is requested.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub user: String,
    pub service: String,
    pub method: String,
    pub payload: Vec<u8>,
}

impl AuthRequest {
    /// Parses a USERAUTH_REQUEST packet. Requests naming a service other
    /// than ssh-connection are a protocol violation.
    pub fn decode(packet: &[u8]) -> Result<Self, AuthError> {
        let ty = wire::packet_type(packet)?;
        if ty != MSG_USERAUTH_REQUEST {
            return Err(WireError::UnexpectedMessage { expected: MSG_USERAUTH_REQUEST, actual: ty }.into());
        }
        let mut reader = &packet[1..];
        let user = wire::read_text(&mut reader)?;
        let service = wire::read_text(&mut reader)?;
        let method = wire::read_text(&mut reader)?;
        let payload = wire::read_rest(&mut reader)?;
        if service != SERVICE_CONNECTION {
            return Err(AuthError::Protocol(format!(
                "auth request for unknown service {service:?}"
            )));
        }
        Ok(Self { user, service, method, payload })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![MSG_USERAUTH_REQUEST];
        wire::put_text(&mut buf, &self.user);
        wire::put_text(&mut buf, &self.service);
        wire::put_text(&mut buf, &self.method);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// A method `none` request, used to make the backend advertise its
    /// acceptable methods again.
    pub fn none(user: &str) -> Self {
        Self {
            user: user.to_owned(),
            service: SERVICE_CONNECTION.to_owned(),
            method: "none".to_owned(),
            payload: Vec::new(),
        }
    }

    /// A password request. The password lives only in the message payload
    /// and must never be logged.
    pub fn password(user: &str, password: &str) -> Self {
        let mut payload = Vec::new();
        wire::put_bool(&mut payload, false);
        wire::put_text(&mut payload, password);
        Self {
            user: user.to_owned(),
            service: SERVICE_CONNECTION.to_owned(),
            method: "password".to_owned(),
            payload,
        }
    }

    /// Extracts the public-key view of the payload. Fails on any method
    /// other than `publickey` or on a malformed payload.
    pub fn public_key(&self) -> Result<PublicKeyPayload, AuthError> {
        if self.method != "publickey" {
            return Err(AuthError::Protocol(format!(
                "not a publickey request: method {:?}",
                self.method
            )));
        }
        let mut reader = self.payload.as_slice();
        let has_signature = wire::read_bool(&mut reader)?;
        let algorithm = wire::read_text(&mut reader)?;
        let key_blob = wire::read_string(&mut reader)?;
        let signature = if has_signature {
            let sig_blob = wire::read_string(&mut reader)?;
            if !reader.is_empty() {
                return Err(WireError::TrailingBytes.into());
            }
            Some(Signature::decode(&mut sig_blob.as_slice())?)
        } else {
            if !reader.is_empty() {
                return Err(WireError::TrailingBytes.into());
            }
            None
        };
        Ok(PublicKeyPayload { has_signature, algorithm, key_blob, signature })
    }

    /// Extracts the cleartext password of a plain request. Change requests
    /// carry two passwords and have no single extractable value. Callers
    /// must not log or persist the result.
    pub fn password_payload(&self) -> Result<String, AuthError> {
        if self.method != "password" {
            return Err(AuthError::Protocol(format!(
                "not a password request: method {:?}",
                self.method
            )));
        }
        let mut reader = self.payload.as_slice();
        let change_request = wire::read_bool(&mut reader)?;
        if change_request {
            return Err(AuthError::Protocol("password change request".into()));
        }
        Ok(wire::read_text(&mut reader)?)
    }
}

/// Decoded view of a `publickey` request payload.
#[derive(Debug, Clone)]
pub struct PublicKeyPayload {
    pub has_signature: bool,
    pub algorithm: String,
    pub key_blob: Vec<u8>,
    pub signature: Option<Signature>,
}

impl PublicKeyPayload {
    /// `true` for the first phase of public-key auth, where the client asks
    /// whether the key would be acceptable before computing a signature.
    pub fn is_query(&self) -> bool {
        !self.has_signature
    }

    pub fn key(&self) -> Result<KeyData, AuthError> {
        Ok(KeyData::decode(&mut self.key_blob.as_slice())?)
    }
}
