//! Token authentication for the RCL handshake.
//!
//! The server sends a random challenge in its `Hello`; the client answers
//! with HMAC-SHA256 keyed by its token, so the token itself never crosses
//! the wire.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type TokenMac = Hmac<Sha256>;

fn keyed(token: &str, challenge: &[u8]) -> Option<TokenMac> {
    // HMAC accepts keys of any length.
    let mut mac = <TokenMac as Mac>::new_from_slice(token.as_bytes()).ok()?;
    mac.update(challenge);
    Some(mac)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Client side: the answer to `challenge` for `token`.
pub fn compute_challenge_response(token: &str, challenge: &[u8]) -> Vec<u8> {
    keyed(token, challenge)
        .map(|mac| mac.finalize().into_bytes().to_vec())
        .unwrap_or_default()
}

/// Server side: constant-time check of a client's answer.
pub fn verify_challenge_response(token: &str, challenge: &[u8], response: &[u8]) -> bool {
    keyed(token, challenge).is_some_and(|mac| mac.verify_slice(response).is_ok())
}

pub fn generate_challenge(len: usize) -> Vec<u8> {
    random_bytes(len)
}

/// A fresh token for the configuration file, `bytes` of entropy hex-encoded.
pub fn generate_token(bytes: usize) -> String {
    hex::encode(random_bytes(bytes))
}
