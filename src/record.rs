//! Record-codec collaborator seam.
//!
//! The container core moves opaque, block-aligned byte buffers; framing
//! those bytes into typed, length-delimited field records is the codec's
//! job. [`RawRecordCodec`] implements the standard framing — each field is
//! `[u32 LE length][u8 type][data]`, starts on a fresh cipher block and is
//! padded to the block size; a record is a field list terminated by the END
//! field — while leaving field semantics to the caller.

use rand::{thread_rng, RngCore};

use crate::cipher::BLOCK_SIZE;
use crate::error::{Pws3Error, Result};

/// Reads decrypted plaintext out of the container's record stream.
pub trait BlockRead {
    /// Fill `buf` with the next decrypted bytes. `buf` must be a positive
    /// multiple of [`BLOCK_SIZE`] long; returns
    /// [`Pws3Error::EndOfStream`] once the sentinel is reached.
    fn read_decrypted(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// Writes plaintext into the container's record stream, encrypting it.
pub trait BlockWrite {
    /// Encrypt and append `buf`, which must be a positive multiple of
    /// [`BLOCK_SIZE`] long.
    fn write_encrypted(&mut self, buf: &[u8]) -> Result<()>;
}

/// (De)serializes records through the container's block primitives.
pub trait RecordCodec {
    type Record;

    /// Read one whole record. Returns [`Pws3Error::EndOfStream`] when the
    /// stream sentinel is reached instead of a record.
    fn decode(&self, source: &mut dyn BlockRead) -> Result<Self::Record>;

    /// Write one whole record.
    fn encode(&self, record: &Self::Record, sink: &mut dyn BlockWrite) -> Result<()>;

    /// A fresh header-extension pseudo-record for a newly created container.
    fn header_record(&self) -> Self::Record;

    /// Whether `record` is the header-extension pseudo-record, which the
    /// container writes separately from the data records.
    fn is_header_record(&self, record: &Self::Record) -> bool;

    fn clear_modified(&self, record: &mut Self::Record);
}

/// Field type of the header-extension version field.
pub const FIELD_TYPE_VERSION: u8 = 0x00;
/// Field type terminating a record.
pub const FIELD_TYPE_END: u8 = 0xFF;
/// Version field payload: minor then major.
pub const VERSION_DATA: [u8; 2] = [1, 3];

/// Bytes of field data carried in the field's first block, after the
/// 4-byte length and 1-byte type.
const FIRST_BLOCK_DATA: usize = BLOCK_SIZE - 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawField {
    pub type_code: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RawRecord {
    fields: Vec<RawField>,
    modified: bool,
}

impl RawRecord {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            modified: true,
        }
    }

    pub fn add_field(&mut self, type_code: u8, data: Vec<u8>) {
        self.fields.push(RawField { type_code, data });
        self.modified = true;
    }

    pub fn fields(&self) -> &[RawField] {
        &self.fields
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

impl Default for RawRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Codec for the standard field framing with opaque field contents.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawRecordCodec;

impl RawRecordCodec {
    fn decode_field(&self, source: &mut dyn BlockRead, first: bool) -> Result<Option<RawField>> {
        let mut block = [0u8; BLOCK_SIZE];
        match source.read_decrypted(&mut block) {
            Ok(()) => {}
            // A sentinel at a record boundary ends the stream; one in the
            // middle of a record means the stream was cut short.
            Err(Pws3Error::EndOfStream) if first => return Err(Pws3Error::EndOfStream),
            Err(Pws3Error::EndOfStream) => {
                return Err(Pws3Error::CorruptHeader(
                    "record stream truncated mid-record".into(),
                ))
            }
            Err(e) => return Err(e),
        }

        let len = u32::from_le_bytes(block[..4].try_into().unwrap()) as usize;
        let type_code = block[4];
        if type_code == FIELD_TYPE_END && len == 0 {
            return Ok(None);
        }

        let mut data = Vec::with_capacity(len.min(BLOCK_SIZE * 256));
        data.extend_from_slice(&block[5..5 + len.min(FIRST_BLOCK_DATA)]);
        let mut remaining = len.saturating_sub(FIRST_BLOCK_DATA);
        while remaining > 0 {
            let mut extra = [0u8; BLOCK_SIZE];
            match source.read_decrypted(&mut extra) {
                Ok(()) => {}
                Err(Pws3Error::EndOfStream) => {
                    return Err(Pws3Error::CorruptHeader(
                        "record stream truncated mid-field".into(),
                    ))
                }
                Err(e) => return Err(e),
            }
            data.extend_from_slice(&extra[..remaining.min(BLOCK_SIZE)]);
            remaining = remaining.saturating_sub(BLOCK_SIZE);
        }

        Ok(Some(RawField { type_code, data }))
    }

    fn encode_field(&self, field: &RawField, sink: &mut dyn BlockWrite) -> Result<()> {
        let len = field.data.len();
        let blocks = 1 + len.saturating_sub(FIRST_BLOCK_DATA).div_ceil(BLOCK_SIZE);

        let mut buf = vec![0u8; blocks * BLOCK_SIZE];
        // Pad the tail with random bytes so field lengths leak less
        thread_rng().fill_bytes(&mut buf[5 + len.min(FIRST_BLOCK_DATA)..]);
        buf[..4].copy_from_slice(&(len as u32).to_le_bytes());
        buf[4] = field.type_code;
        buf[5..5 + len].copy_from_slice(&field.data);

        sink.write_encrypted(&buf)
    }
}

impl RecordCodec for RawRecordCodec {
    type Record = RawRecord;

    fn decode(&self, source: &mut dyn BlockRead) -> Result<RawRecord> {
        let mut fields = Vec::new();
        loop {
            match self.decode_field(source, fields.is_empty())? {
                Some(field) => fields.push(field),
                None => break,
            }
        }
        Ok(RawRecord {
            fields,
            modified: false,
        })
    }

    fn encode(&self, record: &RawRecord, sink: &mut dyn BlockWrite) -> Result<()> {
        for field in &record.fields {
            self.encode_field(field, sink)?;
        }
        self.encode_field(
            &RawField {
                type_code: FIELD_TYPE_END,
                data: Vec::new(),
            },
            sink,
        )
    }

    fn header_record(&self) -> RawRecord {
        let mut record = RawRecord::new();
        record.add_field(FIELD_TYPE_VERSION, VERSION_DATA.to_vec());
        record
    }

    fn is_header_record(&self, record: &RawRecord) -> bool {
        // The version field opens the header-extension record; a data record
        // may legitimately carry a type 0x00 field elsewhere.
        record.fields.first().is_some_and(|f| {
            f.type_code == FIELD_TYPE_VERSION && f.data.len() == VERSION_DATA.len()
        })
    }

    fn clear_modified(&self, record: &mut RawRecord) {
        record.modified = false;
    }
}
