//! Twofish primitives: the CBC stream used for record blocks and the ECB
//! helpers used to wrap and unwrap the 16-byte key blocks in the header.

use cbc::cipher::{Block, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit,
                  KeyIvInit};
use twofish::Twofish;

use crate::error::{Pws3Error, Result};

/// Cipher block size in bytes. Every record buffer crossing the core's
/// boundary must be a positive multiple of this.
pub const BLOCK_SIZE: usize = 16;

/// Marker terminating the record stream. Written to the wire unencrypted;
/// the integrity trailer follows immediately after it.
pub const EOF_SENTINEL: [u8; BLOCK_SIZE] = *b"PWS3-EOFPWS3-EOF";

/// Symmetric key length in bytes (record key and HMAC key).
pub const KEY_LEN: usize = 32;

pub(crate) fn check_block_multiple(len: usize) -> Result<()> {
    if len == 0 || len % BLOCK_SIZE != 0 {
        return Err(Pws3Error::InvalidBufferLength(len));
    }
    Ok(())
}

/// CBC decryption chain for one open session. The IV seeds the first block
/// only; subsequent blocks chain across calls. Not safe for concurrent use.
pub(crate) struct StreamDecryptor {
    inner: cbc::Decryptor<Twofish>,
}

impl StreamDecryptor {
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; BLOCK_SIZE]) -> Self {
        Self {
            inner: cbc::Decryptor::new(key.into(), iv.into()),
        }
    }

    pub fn decrypt_in_place(&mut self, buf: &mut [u8]) -> Result<()> {
        check_block_multiple(buf.len())?;
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.inner
                .decrypt_block_mut(Block::<Twofish>::from_mut_slice(chunk));
        }
        Ok(())
    }
}

/// CBC encryption chain for one save session, re-keyed with a fresh IV on
/// every header regeneration.
pub(crate) struct StreamEncryptor {
    inner: cbc::Encryptor<Twofish>,
}

impl StreamEncryptor {
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; BLOCK_SIZE]) -> Self {
        Self {
            inner: cbc::Encryptor::new(key.into(), iv.into()),
        }
    }

    pub fn encrypt_in_place(&mut self, buf: &mut [u8]) -> Result<()> {
        check_block_multiple(buf.len())?;
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.inner
                .encrypt_block_mut(Block::<Twofish>::from_mut_slice(chunk));
        }
        Ok(())
    }
}

/// Decrypt a single wrapped key block (unchained mode).
pub(crate) fn ecb_decrypt_block(key: &[u8; KEY_LEN], block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let cipher = Twofish::new(key.into());
    let mut out = Block::<Twofish>::clone_from_slice(block);
    cipher.decrypt_block(&mut out);
    out.into()
}

/// Encrypt a single key block for storage in the header (unchained mode).
pub(crate) fn ecb_encrypt_block(key: &[u8; KEY_LEN], block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let cipher = Twofish::new(key.into());
    let mut out = Block::<Twofish>::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [0x42; KEY_LEN];
    const IV: [u8; BLOCK_SIZE] = [0x07; BLOCK_SIZE];

    #[test]
    fn cbc_roundtrip_single_call() {
        let plaintext: Vec<u8> = (0..64).collect();

        let mut enc = StreamEncryptor::new(&KEY, &IV);
        let mut buf = plaintext.clone();
        enc.encrypt_in_place(&mut buf).unwrap();
        assert_ne!(buf, plaintext);

        let mut dec = StreamDecryptor::new(&KEY, &IV);
        dec.decrypt_in_place(&mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn cbc_chain_survives_split_calls() {
        let plaintext: Vec<u8> = (0..96).map(|i| (i * 3) as u8).collect();

        // Encrypt in one shot
        let mut enc = StreamEncryptor::new(&KEY, &IV);
        let mut ciphertext = plaintext.clone();
        enc.encrypt_in_place(&mut ciphertext).unwrap();

        // Decrypt the same bytes in three uneven calls; the chain state must
        // carry across them.
        let mut dec = StreamDecryptor::new(&KEY, &IV);
        let mut buf = ciphertext.clone();
        dec.decrypt_in_place(&mut buf[..16]).unwrap();
        dec.decrypt_in_place(&mut buf[16..64]).unwrap();
        dec.decrypt_in_place(&mut buf[64..]).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn split_encryption_matches_one_shot() {
        let plaintext: Vec<u8> = vec![0xAB; 80];

        let mut one_shot = StreamEncryptor::new(&KEY, &IV);
        let mut expected = plaintext.clone();
        one_shot.encrypt_in_place(&mut expected).unwrap();

        let mut split = StreamEncryptor::new(&KEY, &IV);
        let mut actual = plaintext;
        split.encrypt_in_place(&mut actual[..32]).unwrap();
        split.encrypt_in_place(&mut actual[32..]).unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn rejects_unaligned_buffers() {
        let mut dec = StreamDecryptor::new(&KEY, &IV);
        let mut enc = StreamEncryptor::new(&KEY, &IV);

        for len in [0usize, 1, 15, 17, 33] {
            let mut buf = vec![0u8; len];
            assert!(matches!(
                dec.decrypt_in_place(&mut buf),
                Err(Pws3Error::InvalidBufferLength(l)) if l == len
            ));
            assert!(matches!(
                enc.encrypt_in_place(&mut buf),
                Err(Pws3Error::InvalidBufferLength(l)) if l == len
            ));
        }
    }

    #[test]
    fn ecb_roundtrip() {
        let block = [0x5Au8; BLOCK_SIZE];
        let wrapped = ecb_encrypt_block(&KEY, &block);
        assert_ne!(wrapped, block);
        assert_eq!(ecb_decrypt_block(&KEY, &wrapped), block);
    }

    #[test]
    fn sentinel_is_sixteen_bytes_of_tag() {
        assert_eq!(&EOF_SENTINEL, b"PWS3-EOFPWS3-EOF");
    }
}
