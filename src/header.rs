//! Fixed binary file header.
//!
//! Wire layout (little-endian integers), 152 bytes total:
//!
//! ```text
//! [magic "PWS3": 4][salt: 32][iterations: 4][verify hash: 32]
//! [B1: 16][B2: 16][B3: 16][B4: 16][IV: 16]
//! ```
//!
//! B1..B4 hold the record and HMAC keys wrapped under the stretched
//! passphrase in unchained mode; the IV seeds the CBC chain for the record
//! stream that follows.

use rand::{thread_rng, RngCore};
use sha2::{Digest, Sha256};

use crate::cipher::{BLOCK_SIZE, KEY_LEN};
use crate::error::{Pws3Error, Result};
use crate::kdf;

/// Magic tag identifying a version 3 container.
pub const MAGIC: &[u8; 4] = b"PWS3";

pub const SALT_LEN: usize = 32;
pub const HASH_LEN: usize = 32;
/// Each wrapped key block is one cipher block.
pub const WRAP_LEN: usize = BLOCK_SIZE;
/// Total header length on the wire.
pub const HEADER_LEN: usize = 4 + SALT_LEN + 4 + HASH_LEN + 4 * WRAP_LEN + BLOCK_SIZE;

/// Floor for the stretch cost of newly generated headers.
pub const MIN_ITERATIONS: u32 = 2048;

#[derive(Clone)]
pub struct FileHeader {
    pub salt: [u8; SALT_LEN],
    pub iterations: u32,
    /// SHA-256 of the stretched passphrase; checked before any key unwrap.
    pub verify_hash: [u8; HASH_LEN],
    pub b1: [u8; WRAP_LEN],
    pub b2: [u8; WRAP_LEN],
    pub b3: [u8; WRAP_LEN],
    pub b4: [u8; WRAP_LEN],
    pub iv: [u8; BLOCK_SIZE],
}

impl FileHeader {
    /// Parse a header from the start of a raw container image.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Pws3Error::CorruptHeader(format!(
                "{} bytes is too short for a magic tag",
                data.len()
            )));
        }
        if &data[..4] != MAGIC {
            return Err(Pws3Error::UnsupportedVersion(format!(
                "magic tag {:02x?} is not PWS3",
                &data[..4]
            )));
        }
        if data.len() < HEADER_LEN {
            return Err(Pws3Error::CorruptHeader(format!(
                "{} bytes is shorter than the {} byte header",
                data.len(),
                HEADER_LEN
            )));
        }

        let mut offset = 4;
        let mut take = |len: usize| {
            let slice = &data[offset..offset + len];
            offset += len;
            slice
        };

        let mut header = Self {
            salt: [0; SALT_LEN],
            iterations: 0,
            verify_hash: [0; HASH_LEN],
            b1: [0; WRAP_LEN],
            b2: [0; WRAP_LEN],
            b3: [0; WRAP_LEN],
            b4: [0; WRAP_LEN],
            iv: [0; BLOCK_SIZE],
        };
        header.salt.copy_from_slice(take(SALT_LEN));
        header.iterations = u32::from_le_bytes(take(4).try_into().expect("fixed slice"));
        header.verify_hash.copy_from_slice(take(HASH_LEN));
        header.b1.copy_from_slice(take(WRAP_LEN));
        header.b2.copy_from_slice(take(WRAP_LEN));
        header.b3.copy_from_slice(take(WRAP_LEN));
        header.b4.copy_from_slice(take(WRAP_LEN));
        header.iv.copy_from_slice(take(BLOCK_SIZE));

        if header.iterations == 0 {
            return Err(Pws3Error::CorruptHeader(
                "iteration count must be positive".into(),
            ));
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let mut offset = 0;
        let mut put = |bytes: &[u8]| {
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);
            offset += bytes.len();
        };
        put(MAGIC);
        put(&self.salt);
        put(&self.iterations.to_le_bytes());
        put(&self.verify_hash);
        put(&self.b1);
        put(&self.b2);
        put(&self.b3);
        put(&self.b4);
        put(&self.iv);
        buf
    }

    /// Build a fresh header for a save or a newly created container: new
    /// random salt and IV, the existing unwrapped keys re-wrapped under a
    /// freshly stretched passphrase.
    pub fn generate(
        passphrase: &[u8],
        iterations: u32,
        record_key: &[u8; KEY_LEN],
        hmac_key: &[u8; KEY_LEN],
    ) -> Self {
        let iterations = iterations.max(MIN_ITERATIONS);
        let mut rng = thread_rng();

        let mut salt = [0u8; SALT_LEN];
        rng.fill_bytes(&mut salt);
        let mut iv = [0u8; BLOCK_SIZE];
        rng.fill_bytes(&mut iv);

        let stretched = kdf::stretch_passphrase(passphrase, &salt, iterations);
        let verify_hash: [u8; HASH_LEN] = Sha256::digest(&stretched[..]).into();

        let (b1, b2) = kdf::wrap_key(&stretched, record_key);
        let (b3, b4) = kdf::wrap_key(&stretched, hmac_key);

        Self {
            salt,
            iterations,
            verify_hash,
            b1,
            b2,
            b3,
            b4,
            iv,
        }
    }
}
