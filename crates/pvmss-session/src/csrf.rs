use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::store::SessionData;

pub const CSRF_TTL: Duration = Duration::from_secs(30 * 60);
const TOKEN_BYTES: usize = 32;

/// 32 bytes of CSPRNG output, base64url without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Returns the session's CSRF token, minting a fresh one when none exists
/// or the current one has outlived [`CSRF_TTL`]. Called on safe requests
/// so every rendered form carries a token.
pub fn ensure_token(data: &mut SessionData) -> String {
    let fresh_needed = match (&data.csrf_token, data.csrf_issued_at) {
        (Some(_), Some(issued)) => issued.elapsed() >= CSRF_TTL,
        _ => true,
    };
    if fresh_needed {
        data.csrf_token = Some(generate_token());
        data.csrf_issued_at = Some(Instant::now());
    }
    data.csrf_token.clone().expect("token just ensured")
}

/// Constant-time comparison of a presented token against the session's.
/// Absent session token or absent presentation both fail.
pub fn verify_token(data: &SessionData, presented: &str) -> bool {
    match &data.csrf_token {
        Some(expected) => {
            expected.as_bytes().ct_eq(presented.as_bytes()).into()
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_urlsafe() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(URL_SAFE_NO_PAD.decode(&a).unwrap().len(), TOKEN_BYTES);
        assert!(!a.contains('+') && !a.contains('/') && !a.contains('='));
    }

    #[test]
    fn token_reused_within_ttl() {
        let mut data = SessionData::default();
        let first = ensure_token(&mut data);
        let second = ensure_token(&mut data);
        assert_eq!(first, second);
    }

    #[test]
    fn token_rotates_after_ttl() {
        let mut data = SessionData::default();
        let first = ensure_token(&mut data);
        // An unrepresentable past (very fresh system clock) also forces a
        // fresh token, which is the behavior under test either way.
        data.csrf_issued_at = Instant::now().checked_sub(CSRF_TTL + Duration::from_secs(1));
        let second = ensure_token(&mut data);
        assert_ne!(first, second);
    }

    #[test]
    fn verification_matches_exactly() {
        let mut data = SessionData::default();
        let token = ensure_token(&mut data);
        assert!(verify_token(&data, &token));
        assert!(!verify_token(&data, ""));
        assert!(!verify_token(&data, &token[..token.len() - 1]));
        assert!(!verify_token(&SessionData::default(), &token));
    }
}
