//! Passphrase stretching, verification and key unwrapping.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;
use zeroize::Zeroizing;

use crate::cipher::{self, KEY_LEN};
use crate::error::{Pws3Error, Result};
use crate::header::FileHeader;

/// Derived symmetric keys for one open/save cycle. Zeroed on drop; never
/// persisted in unwrapped form.
pub(crate) struct SessionKeys {
    pub record_key: Zeroizing<[u8; KEY_LEN]>,
    pub hmac_key: Zeroizing<[u8; KEY_LEN]>,
}

/// Stretch a passphrase: seed with `SHA256(passphrase ‖ salt)`, then apply
/// plain SHA-256 `iterations` times over the running digest.
pub fn stretch_passphrase(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Zeroizing<[u8; KEY_LEN]> {
    let mut hasher = Sha256::new();
    hasher.update(passphrase);
    hasher.update(salt);

    let mut digest = Zeroizing::new([0u8; KEY_LEN]);
    digest.copy_from_slice(&hasher.finalize());
    for _ in 0..iterations {
        let next = Sha256::digest(&digest[..]);
        digest.copy_from_slice(&next);
    }
    digest
}

/// Verify a passphrase against the header's stored hash and return the
/// stretched value along with the passphrase bytes that matched.
///
/// The primary attempt uses the UTF-8 bytes. On mismatch a single fallback
/// re-encodes the passphrase as Latin-1, tolerating a historical encoding
/// asymmetry between producer implementations; the fallback never masks a
/// genuinely wrong passphrase and its success is logged.
pub(crate) fn verify_passphrase(
    passphrase: &str,
    header: &FileHeader,
) -> Result<(Zeroizing<[u8; KEY_LEN]>, Zeroizing<Vec<u8>>)> {
    let primary = Zeroizing::new(passphrase.as_bytes().to_vec());
    let stretched = stretch_passphrase(&primary, &header.salt, header.iterations);
    if digest_matches(&stretched, &header.verify_hash) {
        return Ok((stretched, primary));
    }

    if let Some(fallback) = latin1_bytes(passphrase) {
        let fallback = Zeroizing::new(fallback);
        let stretched = stretch_passphrase(&fallback, &header.salt, header.iterations);
        if digest_matches(&stretched, &header.verify_hash) {
            warn!("passphrase verified via legacy platform-encoding fallback");
            return Ok((stretched, fallback));
        }
    }

    Err(Pws3Error::AuthenticationFailed)
}

fn digest_matches(stretched: &[u8; KEY_LEN], stored: &[u8]) -> bool {
    let digest: [u8; 32] = Sha256::digest(&stretched[..]).into();
    bool::from(digest[..].ct_eq(stored))
}

/// Latin-1 re-encoding of the passphrase, or None when it contains
/// characters outside U+0000..U+00FF (those could never have been written
/// by the buggy producer).
fn latin1_bytes(passphrase: &str) -> Option<Vec<u8>> {
    passphrase
        .chars()
        .map(|c| u8::try_from(c as u32).ok())
        .collect()
}

/// Unwrap the record and HMAC keys from the four header key blocks,
/// unchained mode, keyed by the stretched passphrase.
pub(crate) fn unwrap_keys(stretched: &[u8; KEY_LEN], header: &FileHeader) -> SessionKeys {
    let mut record_key = Zeroizing::new([0u8; KEY_LEN]);
    record_key[..16].copy_from_slice(&cipher::ecb_decrypt_block(stretched, &header.b1));
    record_key[16..].copy_from_slice(&cipher::ecb_decrypt_block(stretched, &header.b2));

    let mut hmac_key = Zeroizing::new([0u8; KEY_LEN]);
    hmac_key[..16].copy_from_slice(&cipher::ecb_decrypt_block(stretched, &header.b3));
    hmac_key[16..].copy_from_slice(&cipher::ecb_decrypt_block(stretched, &header.b4));

    SessionKeys {
        record_key,
        hmac_key,
    }
}

/// Wrap a 32-byte key into two header blocks under the stretched passphrase.
pub(crate) fn wrap_key(
    stretched: &[u8; KEY_LEN],
    key: &[u8; KEY_LEN],
) -> ([u8; 16], [u8; 16]) {
    let lo: [u8; 16] = key[..16].try_into().unwrap();
    let hi: [u8; 16] = key[16..].try_into().unwrap();
    (
        cipher::ecb_encrypt_block(stretched, &lo),
        cipher::ecb_encrypt_block(stretched, &hi),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MIN_ITERATIONS;

    #[test]
    fn stretching_is_deterministic() {
        let salt = [9u8; 32];
        let a = stretch_passphrase(b"passphrase", &salt, 2048);
        let b = stretch_passphrase(b"passphrase", &salt, 2048);
        assert_eq!(*a, *b);
    }

    #[test]
    fn stretching_depends_on_every_input() {
        let salt = [9u8; 32];
        let base = stretch_passphrase(b"passphrase", &salt, 2048);
        assert_ne!(*base, *stretch_passphrase(b"passphrasE", &salt, 2048));
        assert_ne!(*base, *stretch_passphrase(b"passphrase", &[8u8; 32], 2048));
        assert_ne!(*base, *stretch_passphrase(b"passphrase", &salt, 2049));
    }

    #[test]
    fn verify_accepts_correct_passphrase_and_unwraps_keys() {
        let record_key = [0xA1u8; KEY_LEN];
        let hmac_key = [0xB2u8; KEY_LEN];
        let header = FileHeader::generate(b"s3cret", MIN_ITERATIONS, &record_key, &hmac_key);

        let (stretched, matched) = verify_passphrase("s3cret", &header).unwrap();
        assert_eq!(&matched[..], b"s3cret");

        let keys = unwrap_keys(&stretched, &header);
        assert_eq!(*keys.record_key, record_key);
        assert_eq!(*keys.hmac_key, hmac_key);
    }

    #[test]
    fn verify_rejects_wrong_passphrase() {
        let header = FileHeader::generate(b"right", MIN_ITERATIONS, &[0; KEY_LEN], &[0; KEY_LEN]);
        assert!(matches!(
            verify_passphrase("wrong", &header),
            Err(Pws3Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn latin1_fallback_matches_legacy_producer() {
        // "Grüße" written by a producer that encoded the passphrase as
        // Latin-1 rather than UTF-8.
        let legacy = b"Gr\xfc\xdfe";
        let header = FileHeader::generate(legacy, MIN_ITERATIONS, &[7; KEY_LEN], &[8; KEY_LEN]);

        let (_, matched) = verify_passphrase("Grüße", &header).unwrap();
        assert_eq!(&matched[..], legacy);
    }

    #[test]
    fn fallback_does_not_mask_wrong_passphrase() {
        let header = FileHeader::generate(b"Gr\xfc\xdfe", MIN_ITERATIONS, &[0; KEY_LEN], &[0; KEY_LEN]);
        assert!(matches!(
            verify_passphrase("Grübe", &header),
            Err(Pws3Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn fallback_skipped_for_unencodable_passphrases() {
        let header = FileHeader::generate(b"x", MIN_ITERATIONS, &[0; KEY_LEN], &[0; KEY_LEN]);
        assert!(matches!(
            verify_passphrase("paßword→", &header),
            Err(Pws3Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn wrap_then_unwrap_roundtrips() {
        let stretched = stretch_passphrase(b"pw", &[1u8; 32], 2048);
        let key = [0xC3u8; KEY_LEN];
        let (lo, hi) = wrap_key(&stretched, &key);

        let mut header = FileHeader::generate(b"pw", MIN_ITERATIONS, &[0; KEY_LEN], &[0; KEY_LEN]);
        header.b1 = lo;
        header.b2 = hi;
        let keys = unwrap_keys(&stretched, &header);
        assert_eq!(*keys.record_key, key);
    }
}
