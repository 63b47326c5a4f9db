//! Signed API keys presented at the WebSocket handshake.
//!
//! Composition, little-endian, base64 URL-safe without padding:
//! `[1: algorithm version][4: app id][2: key sequence][1: isRoot]
//! [16: truncated HMAC-SHA256 signature]` = 24 bytes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const KEY_VERSION: u8 = 1;
const CLAIMS_LEN: usize = 8; // version + app id + sequence + isRoot
const SIGNATURE_LEN: usize = 16;
const KEY_LEN: usize = CLAIMS_LEN + SIGNATURE_LEN;

fn sign(salt: &[u8], claims: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut mac = HmacSha256::new_from_slice(salt).expect("hmac accepts any key length");
    mac.update(claims);
    let full = mac.finalize().into_bytes();
    let mut sig = [0u8; SIGNATURE_LEN];
    sig.copy_from_slice(&full[..SIGNATURE_LEN]);
    sig
}

/// Validate a client-presented API key. Returns `(is_valid, is_root)`.
pub fn check_api_key(salt: &[u8], apikey: &str) -> (bool, bool) {
    let Ok(data) = URL_SAFE_NO_PAD.decode(apikey.as_bytes()) else {
        return (false, false);
    };
    if data.len() != KEY_LEN {
        return (false, false);
    }
    if data[0] != KEY_VERSION {
        tracing::debug!(version = data[0], "unknown api key signature algorithm");
        return (false, false);
    }

    let mut mac = HmacSha256::new_from_slice(salt).expect("hmac accepts any key length");
    mac.update(&data[..CLAIMS_LEN]);
    let full = mac.finalize().into_bytes();
    if full[..SIGNATURE_LEN] != data[CLAIMS_LEN..] {
        tracing::debug!("invalid api key signature");
        return (false, false);
    }

    let is_root = data[CLAIMS_LEN - 1] == 1;
    (true, is_root)
}

/// Mint a new API key. Used by deployment tooling, not the serving path.
pub fn generate_api_key(salt: &[u8], sequence: u16, is_root: bool) -> String {
    let mut claims = [0u8; CLAIMS_LEN];
    claims[0] = KEY_VERSION;
    rand::thread_rng().fill(&mut claims[1..5]);
    claims[5..7].copy_from_slice(&sequence.to_le_bytes());
    claims[7] = is_root as u8;

    let sig = sign(salt, &claims);
    let mut data = Vec::with_capacity(KEY_LEN);
    data.extend_from_slice(&claims);
    data.extend_from_slice(&sig);
    URL_SAFE_NO_PAD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn generated_key_validates() {
        let key = generate_api_key(SALT, 1, false);
        assert_eq!(check_api_key(SALT, &key), (true, false));

        let root_key = generate_api_key(SALT, 1, true);
        assert_eq!(check_api_key(SALT, &root_key), (true, true));
    }

    #[test]
    fn wrong_salt_fails() {
        let key = generate_api_key(SALT, 1, false);
        assert_eq!(check_api_key(b"another-salt-another-salt-123456", &key).0, false);
    }

    #[test]
    fn garbage_fails() {
        assert_eq!(check_api_key(SALT, "not base64 at all!").0, false);
        assert_eq!(check_api_key(SALT, "").0, false);
        assert_eq!(check_api_key(SALT, &URL_SAFE_NO_PAD.encode([0u8; 10])).0, false);
    }

    #[test]
    fn tampered_claims_fail() {
        let key = generate_api_key(SALT, 1, false);
        let mut raw = URL_SAFE_NO_PAD.decode(key.as_bytes()).unwrap();
        raw[7] = 1; // flip isRoot without re-signing
        let forged = URL_SAFE_NO_PAD.encode(raw);
        assert_eq!(check_api_key(SALT, &forged).0, false);
    }
}
