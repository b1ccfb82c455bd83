//! Running keyed-hash accumulation over plaintext record bytes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Pws3Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of the integrity trailer appended after the end-of-stream sentinel.
pub const TRAILER_LEN: usize = 32;

/// Accumulates HMAC-SHA256 over every plaintext record block of one open or
/// save session, in stream order. Header bytes are never fed to it.
///
/// `finalize` consumes the accumulator; calling `update` or `finalize` again
/// afterwards is a protocol error.
pub struct IntegrityTracker {
    mac: Option<HmacSha256>,
}

impl IntegrityTracker {
    pub fn new(key: &[u8]) -> Self {
        let mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
        Self { mac: Some(mac) }
    }

    pub fn update(&mut self, bytes: &[u8]) -> Result<()> {
        match self.mac.as_mut() {
            Some(mac) => {
                mac.update(bytes);
                Ok(())
            }
            None => Err(Pws3Error::InvalidState("integrity tracker already finalized")),
        }
    }

    /// Returns the accumulated digest. May be called at most once.
    pub fn finalize(&mut self) -> Result<[u8; TRAILER_LEN]> {
        let mac = self
            .mac
            .take()
            .ok_or(Pws3Error::InvalidState("integrity tracker already finalized"))?;
        Ok(mac.finalize().into_bytes().into())
    }

    /// Finalizes and compares against a stored trailer in constant time.
    pub fn verify(&mut self, trailer: &[u8]) -> Result<()> {
        let digest = self.finalize()?;
        if trailer.len() != TRAILER_LEN || !bool::from(digest[..].ct_eq(trailer)) {
            return Err(Pws3Error::IntegrityCheckFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation_matches_one_shot() {
        let key = b"hmac key";

        let mut split = IntegrityTracker::new(key);
        split.update(b"hello ").unwrap();
        split.update(b"world").unwrap();
        let a = split.finalize().unwrap();

        let mut whole = IntegrityTracker::new(key);
        whole.update(b"hello world").unwrap();
        let b = whole.finalize().unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn verify_accepts_matching_trailer() {
        let mut writer = IntegrityTracker::new(b"k");
        writer.update(b"record bytes").unwrap();
        let trailer = writer.finalize().unwrap();

        let mut reader = IntegrityTracker::new(b"k");
        reader.update(b"record bytes").unwrap();
        reader.verify(&trailer).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_trailer() {
        let mut writer = IntegrityTracker::new(b"k");
        writer.update(b"record bytes").unwrap();
        let mut trailer = writer.finalize().unwrap();
        trailer[0] ^= 0x01;

        let mut reader = IntegrityTracker::new(b"k");
        reader.update(b"record bytes").unwrap();
        assert!(matches!(
            reader.verify(&trailer),
            Err(Pws3Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn verify_rejects_short_trailer() {
        let mut tracker = IntegrityTracker::new(b"k");
        assert!(matches!(
            tracker.verify(&[0u8; 16]),
            Err(Pws3Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn double_finalize_is_invalid_state() {
        let mut tracker = IntegrityTracker::new(b"k");
        tracker.update(b"x").unwrap();
        tracker.finalize().unwrap();

        assert!(matches!(
            tracker.finalize(),
            Err(Pws3Error::InvalidState(_))
        ));
        assert!(matches!(
            tracker.update(b"y"),
            Err(Pws3Error::InvalidState(_))
        ));
    }
}
