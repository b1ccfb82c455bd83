//! pws3 - PasswordSafe V3 encrypted container engine
//!
//! The engine derives cryptographic keys from a user passphrase, streams the
//! record bytes through Twofish in CBC mode, and verifies end-to-end
//! integrity with HMAC-SHA256 over every plaintext record block.
//!
//! ## Container image layout
//!
//! ```text
//! [magic "PWS3"][salt][iterations][verify hash][B1..B4][IV]
//! [encrypted record blocks, 16-byte aligned ...]
//! [sentinel "PWS3-EOFPWS3-EOF"][HMAC-SHA256 trailer]
//! ```
//!
//! B1..B4 wrap the record key and the HMAC key under the stretched
//! passphrase; authentication (comparing the stored verification hash
//! against the freshly stretched passphrase) always precedes key unwrap.
//!
//! ## Collaborators
//!
//! Raw byte persistence goes through the [`Storage`] trait and record field
//! framing through the [`RecordCodec`] trait; the core itself only moves
//! block-aligned buffers and owes each caller exactly two guarantees: every
//! block handed back decrypted correctly, and the whole stream verified
//! against the integrity trailer.
//!
//! ## Example
//!
//! ```no_run
//! use pws3::{Container, MemoryStorage, OpenMode, RawRecord, RawRecordCodec};
//!
//! let storage = MemoryStorage::new();
//! let mut container = Container::new(RawRecordCodec, Box::new(storage.clone()));
//! container.create("correct horse battery staple").unwrap();
//!
//! let mut record = RawRecord::new();
//! record.add_field(0x03, b"example.org".to_vec());
//! container.add_record(record).unwrap();
//! container.save().unwrap();
//! container.dispose();
//!
//! let mut reopened = Container::new(RawRecordCodec, Box::new(storage));
//! reopened.open("correct horse battery staple", OpenMode::ReadOnly).unwrap();
//! assert_eq!(reopened.record_count(), 1);
//! ```

pub mod cipher;
pub mod container;
pub mod error;
pub mod header;
pub mod integrity;
pub mod kdf;
pub mod record;
pub mod storage;

pub use cipher::{BLOCK_SIZE, EOF_SENTINEL};
pub use container::{Container, LifecycleState, OpenMode};
pub use error::{Pws3Error, Result};
pub use header::FileHeader;
pub use integrity::IntegrityTracker;
pub use record::{BlockRead, BlockWrite, RawField, RawRecord, RawRecordCodec, RecordCodec};
pub use storage::{FileStorage, MemoryStorage, Storage};
