mod error;

use rand::{thread_rng, RngCore};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub use error::*;

/// Use the thread_rng CSPRNG to create a random UUID, formatted as a String.
/// This ought to be mildly more efficient than hammering the OS random source.
/// Not that we especially care, probably!
pub fn uuid_string() -> String {
    let mut bytes = [0u8; 16];
    thread_rng().fill_bytes(&mut bytes);
    let uu = uuid::Builder::from_random_bytes(bytes).into_uuid();
    uu.as_hyphenated().to_string()
}

/// Calculate the sha256 checksum of a &str and return it as a lowercase hex
/// String. Token cleartexts are random to begin with, so a plain unsalted
/// hash is all they need.
pub fn sha256sum(cleartext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cleartext);
    let hash = hasher.finalize();
    base16ct::lower::encode_string(&hash)
}

/// Milliseconds since the unix epoch, as an i64 (which is what sqlite
/// integers decay to anyway). Every timestamp the code does arithmetic
/// on (leases, TTLs, claim times) uses this.
pub fn now_ms() -> i64 {
    let now = OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_are_uuid_shaped() {
        let one = uuid_string();
        let two = uuid_string();
        assert_eq!(one.len(), 36);
        assert_ne!(one, two);
    }

    #[test]
    fn sha256sum_is_stable() {
        assert_eq!(sha256sum("hoardv1.test"), sha256sum("hoardv1.test"));
        assert_ne!(sha256sum("a"), sha256sum("b"));
        assert_eq!(sha256sum("a").len(), 64);
    }

    #[test]
    fn now_ms_is_plausible() {
        // Sometime after 2024 and clearly in milliseconds, not seconds.
        assert!(now_ms() > 1_700_000_000_000);
    }
}
