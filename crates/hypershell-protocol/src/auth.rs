use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

/// The default authkey is a sentinel explicitly meant to fail or warn (spec
/// section 4.4) — operators are expected to supply a real key, or let
/// cluster mode autogenerate one.
pub const SENTINEL_AUTHKEY: &str = "--BADKEY--";

type HmacSha256 = Hmac<Sha256>;

/// A random 128 bit challenge issued by the server in WELCOME.
pub fn generate_challenge() -> [u8; 16] {
    let mut challenge = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// A random 128 bit hex authkey, generated by cluster mode when none was
/// supplied (spec section 4.4).
pub fn generate_authkey_hex() -> String {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    hex::encode(key)
}

/// Compute the keyed MAC a client returns over the server's challenge.
pub fn compute_mac(authkey: &str, challenge: &[u8; 16]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(authkey.as_bytes()).expect("HMAC accepts any key length");
    mac.update(challenge);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time verification of a client's MAC against the expected key.
pub fn verify_mac(authkey: &str, challenge: &[u8; 16], candidate: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(authkey.as_bytes()).expect("HMAC accepts any key length");
    mac.update(challenge);
    mac.verify_slice(candidate).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_mac_verifies() {
        let challenge = generate_challenge();
        let mac = compute_mac("secret", &challenge);
        assert!(verify_mac("secret", &challenge, &mac));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let challenge = generate_challenge();
        let mac = compute_mac("secret", &challenge);
        assert!(!verify_mac("other", &challenge, &mac));
    }

    #[test]
    fn sentinel_key_is_a_valid_but_discouraged_key() {
        let challenge = generate_challenge();
        let mac = compute_mac(SENTINEL_AUTHKEY, &challenge);
        assert!(verify_mac(SENTINEL_AUTHKEY, &challenge, &mac));
    }
}
