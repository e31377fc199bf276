//! Canonical signing format for public-key authentication.
//!
//! Authentication signatures bind to the session identifier of the channel
//! they are sent on, so a request relayed to the upstream channel must be
//! re-signed with a credential the relay holds. Both verification and
//! re-signing are pure functions of their inputs so they can be exercised
//! without a socket pair.

use signature::{Signer, Verifier};
use ssh_encoding::Encode;
use ssh_key::{Algorithm, HashAlg, PrivateKey};

use crate::auth::request::{AuthRequest, PublicKeyPayload};
use crate::error::{AuthError, WireError};
use crate::wire::{self, MSG_USERAUTH_REQUEST, SERVICE_CONNECTION};

/// Builds the byte sequence a public-key authentication signature covers:
///
/// ```text
/// string  session identifier
/// byte    SSH_MSG_USERAUTH_REQUEST
/// string  user name
/// string  service name
/// string  "publickey"
/// boolean TRUE
/// string  public key algorithm name
/// string  public key blob
/// ```
pub fn signed_auth_data(
    session_id: &[u8],
    user: &str,
    service: &str,
    algorithm: &str,
    key_blob: &[u8],
) -> Vec<u8> {
    let mut data = Vec::new();
    wire::put_string(&mut data, session_id);
    data.push(MSG_USERAUTH_REQUEST);
    wire::put_text(&mut data, user);
    wire::put_text(&mut data, service);
    wire::put_text(&mut data, "publickey");
    wire::put_bool(&mut data, true);
    wire::put_text(&mut data, algorithm);
    wire::put_string(&mut data, key_blob);
    data
}

/// Verifies the signature of a downstream request against the downstream
/// session identifier. Returns `Ok(false)` when the signature simply does
/// not verify; malformed keys or signatures are errors.
pub fn verify_request(
    session_id: &[u8],
    request: &AuthRequest,
    payload: &PublicKeyPayload,
) -> Result<bool, AuthError> {
    let signature = payload
        .signature
        .as_ref()
        .ok_or_else(|| AuthError::Protocol("publickey request lacks a signature".into()))?;
    let key = payload.key()?;
    let data = signed_auth_data(
        session_id,
        &request.user,
        &request.service,
        &payload.algorithm,
        &payload.key_blob,
    );
    Ok(key.verify(&data, signature).is_ok())
}

/// Produces a fully signed `publickey` request for `user` bound to
/// `session_id`, using a credential held by the relay. This is the crux of
/// the relay: the original client signature can never verify on the
/// upstream channel because session identifiers differ per connection.
pub fn sign_request(
    user: &str,
    signer: &PrivateKey,
    session_id: &[u8],
) -> Result<AuthRequest, AuthError> {
    let algorithm = signing_algorithm(signer);
    let mut key_blob = Vec::new();
    signer
        .public_key()
        .key_data()
        .encode(&mut key_blob)
        .map_err(WireError::from)?;

    let data = signed_auth_data(session_id, user, SERVICE_CONNECTION, &algorithm, &key_blob);
    let signature = signer
        .try_sign(&data)
        .map_err(|err| AuthError::Signing(err.to_string()))?;
    let mut sig_blob = Vec::new();
    signature.encode(&mut sig_blob).map_err(WireError::from)?;

    let mut payload = Vec::new();
    wire::put_bool(&mut payload, true);
    wire::put_text(&mut payload, &algorithm);
    wire::put_string(&mut payload, &key_blob);
    wire::put_string(&mut payload, &sig_blob);

    Ok(AuthRequest {
        user: user.to_owned(),
        service: SERVICE_CONNECTION.to_owned(),
        method: "publickey".to_owned(),
        payload,
    })
}

/// The algorithm name that will appear both in the signed data and in the
/// request. RSA keys sign as rsa-sha2-512; every other key type signs under
/// its own name.
fn signing_algorithm(signer: &PrivateKey) -> String {
    match signer.algorithm() {
        Algorithm::Rsa { .. } => Algorithm::Rsa { hash: Some(HashAlg::Sha512) }
            .as_str()
            .to_owned(),
        other => other.as_str().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn test_key() -> PrivateKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
    }

    #[test]
    fn signed_request_verifies_against_its_session() {
        let key = test_key();
        let session = [7u8; 32];
        let request = sign_request("alice", &key, &session).unwrap();
        let payload = request.public_key().unwrap();
        assert!(!payload.is_query());
        assert!(verify_request(&session, &request, &payload).unwrap());
    }

    #[test]
    fn signature_bound_to_other_session_fails() {
        let key = test_key();
        let request = sign_request("alice", &key, &[7u8; 32]).unwrap();
        let payload = request.public_key().unwrap();
        assert!(!verify_request(&[8u8; 32], &request, &payload).unwrap());
    }

    #[test]
    fn re_signing_is_idempotent_under_verification() {
        // Two independent signatures over the same logical request must both
        // verify; they need not be byte-identical.
        let key = test_key();
        let session = [3u8; 32];
        let first = sign_request("alice", &key, &session).unwrap();
        let second = sign_request("alice", &key, &session).unwrap();
        for request in [&first, &second] {
            let payload = request.public_key().unwrap();
            assert!(verify_request(&session, request, &payload).unwrap());
        }
    }

    #[test]
    fn tampered_user_invalidates_signature() {
        let key = test_key();
        let session = [9u8; 32];
        let mut request = sign_request("alice", &key, &session).unwrap();
        request.user = "mallory".into();
        let payload = request.public_key().unwrap();
        assert!(!verify_request(&session, &request, &payload).unwrap());
    }
}
