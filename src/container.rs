//! Container lifecycle: open (authenticate, decrypt, verify), save (re-key,
//! encrypt, append integrity trailer, commit) and dispose.
//!
//! A container instance owns its header, derived keys, cipher chain state
//! and integrity accumulator exclusively; it is not safe for concurrent use,
//! but independent containers share nothing.

use std::time::SystemTime;

use rand::{thread_rng, RngCore};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::{self, StreamDecryptor, StreamEncryptor, BLOCK_SIZE, EOF_SENTINEL, KEY_LEN};
use crate::error::{Pws3Error, Result};
use crate::header::{FileHeader, HEADER_LEN, MIN_ITERATIONS};
use crate::integrity::{IntegrityTracker, TRAILER_LEN};
use crate::kdf::{self, SessionKeys};
use crate::record::{BlockRead, BlockWrite, RecordCodec};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unopened,
    OpenReadWrite,
    OpenReadOnly,
    /// Terminal: all key material has been zeroed.
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

/// Decryption side of one open session: raw input cursor, CBC chain and
/// integrity accumulator.
struct ReadSession<'a> {
    input: &'a [u8],
    pos: usize,
    decryptor: StreamDecryptor,
    tracker: IntegrityTracker,
    ended: bool,
}

impl<'a> ReadSession<'a> {
    fn new(
        input: &'a [u8],
        record_key: &[u8; KEY_LEN],
        iv: &[u8; BLOCK_SIZE],
        hmac_key: &[u8],
    ) -> Self {
        Self {
            input,
            pos: 0,
            decryptor: StreamDecryptor::new(record_key, iv),
            tracker: IntegrityTracker::new(hmac_key),
            ended: false,
        }
    }

    /// Compare the accumulated HMAC against the trailer that follows the
    /// sentinel. Consumes the session; must come after the stream ended.
    fn verify_trailer(mut self) -> Result<()> {
        if !self.ended {
            return Err(Pws3Error::InvalidState("record stream not fully read"));
        }
        let remaining = &self.input[self.pos..];
        if remaining.len() < TRAILER_LEN {
            return Err(Pws3Error::IntegrityCheckFailed);
        }
        // The trailer is the last thing in the image; anything after it is
        // outside both the record stream and the HMAC.
        if remaining.len() > TRAILER_LEN {
            return Err(Pws3Error::CorruptHeader(
                "unexpected data after integrity trailer".into(),
            ));
        }
        self.tracker.verify(remaining)
    }
}

impl BlockRead for ReadSession<'_> {
    fn read_decrypted(&mut self, buf: &mut [u8]) -> Result<()> {
        cipher::check_block_multiple(buf.len())?;
        if self.ended || self.pos + buf.len() > self.input.len() {
            self.ended = true;
            return Err(Pws3Error::EndOfStream);
        }
        buf.copy_from_slice(&self.input[self.pos..self.pos + buf.len()]);
        self.pos += buf.len();

        // The sentinel sits on the wire unencrypted; recognize it before
        // feeding the block to the cipher.
        if buf.len() == BLOCK_SIZE && buf[..] == EOF_SENTINEL {
            self.ended = true;
            return Err(Pws3Error::EndOfStream);
        }

        self.decryptor.decrypt_in_place(buf)?;
        self.tracker.update(buf)
    }
}

/// Encryption side of one save session, building the complete output image
/// in memory so a failed save never touches the backing store.
struct WriteSession {
    out: Vec<u8>,
    encryptor: StreamEncryptor,
    tracker: IntegrityTracker,
}

impl WriteSession {
    fn new(
        header_image: Vec<u8>,
        record_key: &[u8; KEY_LEN],
        iv: &[u8; BLOCK_SIZE],
        hmac_key: &[u8],
    ) -> Self {
        Self {
            out: header_image,
            encryptor: StreamEncryptor::new(record_key, iv),
            tracker: IntegrityTracker::new(hmac_key),
        }
    }

    /// Append the sentinel and the integrity trailer, yielding the full
    /// image ready for a single commit.
    fn finish(mut self) -> Result<Vec<u8>> {
        self.out.extend_from_slice(&EOF_SENTINEL);
        let trailer = self.tracker.finalize()?;
        self.out.extend_from_slice(&trailer);
        Ok(self.out)
    }
}

impl BlockWrite for WriteSession {
    fn write_encrypted(&mut self, buf: &[u8]) -> Result<()> {
        cipher::check_block_multiple(buf.len())?;
        self.tracker.update(buf)?;
        let mut encrypted = buf.to_vec();
        self.encryptor.encrypt_in_place(&mut encrypted)?;
        self.out.extend_from_slice(&encrypted);
        Ok(())
    }
}

pub struct Container<C: RecordCodec> {
    codec: C,
    storage: Box<dyn Storage>,
    state: LifecycleState,
    passphrase: Zeroizing<Vec<u8>>,
    iterations: u32,
    keys: Option<SessionKeys>,
    header_record: Option<C::Record>,
    records: Vec<C::Record>,
    last_storage_change: Option<SystemTime>,
    modified: bool,
}

impl<C: RecordCodec> Container<C> {
    /// A container in the Unopened state, bound to its storage collaborator.
    pub fn new(codec: C, storage: Box<dyn Storage>) -> Self {
        Self {
            codec,
            storage,
            state: LifecycleState::Unopened,
            passphrase: Zeroizing::new(Vec::new()),
            iterations: MIN_ITERATIONS,
            keys: None,
            header_record: None,
            records: Vec::new(),
            last_storage_change: None,
            modified: false,
        }
    }

    /// Initialise a new, empty container in memory with freshly generated
    /// record and HMAC keys. Nothing is written until [`save`](Self::save).
    pub fn create(&mut self, passphrase: &str) -> Result<()> {
        if self.state != LifecycleState::Unopened {
            return Err(Pws3Error::InvalidState("container is already open"));
        }

        let mut rng = thread_rng();
        let mut record_key = Zeroizing::new([0u8; KEY_LEN]);
        rng.fill_bytes(&mut record_key[..]);
        let mut hmac_key = Zeroizing::new([0u8; KEY_LEN]);
        rng.fill_bytes(&mut hmac_key[..]);

        self.keys = Some(SessionKeys {
            record_key,
            hmac_key,
        });
        self.passphrase = Zeroizing::new(passphrase.as_bytes().to_vec());
        self.header_record = Some(self.codec.header_record());
        self.state = LifecycleState::OpenReadWrite;
        self.modified = true;
        Ok(())
    }

    /// Authenticate against the stored container image, unwrap the session
    /// keys, decrypt and verify the whole record stream.
    ///
    /// Any failure leaves the container Unopened with all derived key
    /// material zeroed; no record is exposed from a stream that did not
    /// verify.
    pub fn open(&mut self, passphrase: &str, mode: OpenMode) -> Result<()> {
        if self.state != LifecycleState::Unopened {
            return Err(Pws3Error::InvalidState("container is already open"));
        }

        let raw = self.storage.load()?;
        let last_change = self.storage.modified_time()?;
        let header = FileHeader::parse(&raw)?;
        debug!(iterations = header.iterations, "opening container");

        let (stretched, matched_passphrase) = kdf::verify_passphrase(passphrase, &header)?;
        let keys = kdf::unwrap_keys(&stretched, &header);
        drop(stretched);

        let mut session = ReadSession::new(
            &raw[HEADER_LEN..],
            &keys.record_key,
            &header.iv,
            &keys.hmac_key[..],
        );

        let header_record = match self.codec.decode(&mut session) {
            Ok(record) => record,
            Err(Pws3Error::EndOfStream) => {
                return Err(Pws3Error::CorruptHeader(
                    "missing header extension record".into(),
                ))
            }
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        loop {
            match self.codec.decode(&mut session) {
                Ok(record) => records.push(record),
                Err(Pws3Error::EndOfStream) => break,
                Err(e) => return Err(e),
            }
        }
        session.verify_trailer()?;

        self.passphrase = matched_passphrase;
        self.iterations = header.iterations;
        self.keys = Some(keys);
        self.header_record = Some(header_record);
        self.records = records;
        self.last_storage_change = last_change;
        self.modified = false;
        self.state = match mode {
            OpenMode::ReadWrite => LifecycleState::OpenReadWrite,
            OpenMode::ReadOnly => LifecycleState::OpenReadOnly,
        };
        Ok(())
    }

    /// Re-key, encrypt every resident record, append the integrity trailer
    /// and commit the complete image to storage in one call.
    ///
    /// Fails with [`Pws3Error::ConcurrentModification`] when the storage was
    /// changed externally since open; the backing store is left untouched by
    /// any failure because no partial write ever reaches it.
    pub fn save(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::OpenReadWrite => {}
            LifecycleState::OpenReadOnly => return Err(Pws3Error::ReadOnlyViolation),
            _ => return Err(Pws3Error::InvalidState("container is not open")),
        }
        let keys = self
            .keys
            .as_ref()
            .ok_or(Pws3Error::InvalidState("session keys are missing"))?;

        if let (Some(opened), Some(current)) =
            (self.last_storage_change, self.storage.modified_time()?)
        {
            if current > opened {
                return Err(Pws3Error::ConcurrentModification);
            }
        }

        // Fresh salt, IV and wrapped-key set; the unwrapped keys themselves
        // carry over unless the passphrase changed.
        let header = FileHeader::generate(
            &self.passphrase,
            self.iterations,
            &keys.record_key,
            &keys.hmac_key,
        );

        let mut session = WriteSession::new(
            header.to_bytes().to_vec(),
            &keys.record_key,
            &header.iv,
            &keys.hmac_key[..],
        );

        let header_record = self
            .header_record
            .as_ref()
            .ok_or(Pws3Error::InvalidState("header record is missing"))?;
        self.codec.encode(header_record, &mut session)?;
        for record in &self.records {
            if self.codec.is_header_record(record) {
                continue;
            }
            self.codec.encode(record, &mut session)?;
        }

        let image = session.finish()?;
        self.storage.save(&image)?;
        debug!(records = self.records.len(), "container committed");

        self.modified = false;
        let codec = &self.codec;
        if let Some(record) = self.header_record.as_mut() {
            codec.clear_modified(record);
        }
        for record in &mut self.records {
            codec.clear_modified(record);
        }
        self.last_storage_change = self.storage.modified_time()?;
        Ok(())
    }

    /// Zero all key material and transition to Disposed. Idempotent, legal
    /// from every state.
    pub fn dispose(&mut self) {
        self.passphrase.zeroize();
        self.keys = None;
        self.header_record = None;
        self.records.clear();
        self.state = LifecycleState::Disposed;
    }

    pub fn add_record(&mut self, record: C::Record) -> Result<()> {
        match self.state {
            LifecycleState::OpenReadWrite => {
                self.records.push(record);
                self.modified = true;
                Ok(())
            }
            LifecycleState::OpenReadOnly => Err(Pws3Error::ReadOnlyViolation),
            _ => Err(Pws3Error::InvalidState("container is not open")),
        }
    }

    pub fn remove_record(&mut self, index: usize) -> Result<C::Record> {
        match self.state {
            LifecycleState::OpenReadWrite => {
                if index >= self.records.len() {
                    return Err(Pws3Error::InvalidState("record index out of range"));
                }
                self.modified = true;
                Ok(self.records.remove(index))
            }
            LifecycleState::OpenReadOnly => Err(Pws3Error::ReadOnlyViolation),
            _ => Err(Pws3Error::InvalidState("container is not open")),
        }
    }

    /// Replace the passphrase; the next save re-wraps the session keys
    /// under it.
    pub fn set_passphrase(&mut self, passphrase: &str) -> Result<()> {
        match self.state {
            LifecycleState::OpenReadWrite => {
                self.passphrase = Zeroizing::new(passphrase.as_bytes().to_vec());
                self.modified = true;
                Ok(())
            }
            LifecycleState::OpenReadOnly => Err(Pws3Error::ReadOnlyViolation),
            _ => Err(Pws3Error::InvalidState("container is not open")),
        }
    }

    pub fn records(&self) -> &[C::Record] {
        &self.records
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }
}

impl<C: RecordCodec> Drop for Container<C> {
    fn drop(&mut self) {
        self.passphrase.zeroize();
        self.keys = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RawRecordCodec;
    use crate::storage::MemoryStorage;

    fn unopened() -> Container<RawRecordCodec> {
        Container::new(RawRecordCodec, Box::new(MemoryStorage::new()))
    }

    #[test]
    fn save_before_open_is_invalid_state() {
        let mut container = unopened();
        assert!(matches!(
            container.save(),
            Err(Pws3Error::InvalidState(_))
        ));
    }

    #[test]
    fn create_twice_is_invalid_state() {
        let mut container = unopened();
        container.create("pw").unwrap();
        assert!(matches!(
            container.create("pw"),
            Err(Pws3Error::InvalidState(_))
        ));
    }

    #[test]
    fn dispose_is_idempotent_and_legal_when_unopened() {
        let mut container = unopened();
        container.dispose();
        assert_eq!(container.state(), LifecycleState::Disposed);
        container.dispose();
        assert_eq!(container.state(), LifecycleState::Disposed);
    }

    #[test]
    fn disposed_container_refuses_everything() {
        let mut container = unopened();
        container.create("pw").unwrap();
        container.dispose();

        assert!(matches!(container.save(), Err(Pws3Error::InvalidState(_))));
        assert!(matches!(
            container.open("pw", OpenMode::ReadWrite),
            Err(Pws3Error::InvalidState(_))
        ));
        assert!(matches!(
            container.add_record(Default::default()),
            Err(Pws3Error::InvalidState(_))
        ));
    }

    #[test]
    fn open_on_empty_storage_propagates_io_error() {
        let mut container = unopened();
        assert!(matches!(
            container.open("pw", OpenMode::ReadWrite),
            Err(Pws3Error::Io(_))
        ));
        assert_eq!(container.state(), LifecycleState::Unopened);
    }
}
