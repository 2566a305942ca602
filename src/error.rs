use std::io;

use thiserror::Error;

/// Malformed or unsupported structure. Always fatal to the decode step
/// that raises it; never retried.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unknown KDZ header (size={size}, magic={magic:#010x})")]
    UnknownHeader { size: u32, magic: u32 },

    #[error("{what} truncated at offset {offset:#x} (need {need} bytes, have {have})")]
    Truncated {
        what: &'static str,
        offset: u64,
        need: usize,
        have: usize,
    },

    #[error("bad {what} magic at offset {offset:#x} (expected {expected:#010x}, found {found:#010x})")]
    BadMagic {
        what: &'static str,
        offset: u64,
        expected: u32,
        found: u32,
    },

    #[error("record {index} has an empty name with size={size} and offset={offset}")]
    CorruptRecord { index: usize, size: u64, offset: u64 },

    #[error("non-zero byte in {region} padding at offset {offset:#x}")]
    CorruptPadding { region: &'static str, offset: u64 },

    #[error("invalid {field} value {value:#x} at offset {offset:#x}")]
    InvalidField {
        field: &'static str,
        offset: u64,
        value: u64,
    },

    #[error("{field} at offset {offset:#x} is not NUL-padded ASCII")]
    InvalidString { field: &'static str, offset: u64 },

    #[error("unsupported DZ version {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },

    #[error("no secure partition table (found magic {found:#010x})")]
    NoSecurePartition { found: u32 },

    #[error("segment {index}: partition start sector mismatch (expected {expected}, got {got})")]
    SectorMismatch {
        index: usize,
        expected: u32,
        got: u32,
    },

    #[error("unsupported compression type {0:?}")]
    UnsupportedCompression(String),
}

/// Checksum or hash mismatch. Fatal by default; lenient decoding
/// downgrades these to surfaced warnings.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("DZ header CRC mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    HeaderCrcMismatch { stored: u32, computed: u32 },

    #[error("segment record hash mismatch (stored {stored:02x?}, computed {computed:02x?})")]
    RecordTableHashMismatch {
        stored: [u8; 16],
        computed: [u8; 16],
    },

    #[error("end-to-end data hash mismatch (stored {stored:02x?}, computed {computed:02x?})")]
    DataHashMismatch {
        stored: [u8; 16],
        computed: [u8; 16],
    },
}

/// I/O failure or mid-stream decompression corruption. Fatal to the one
/// partition being reconstructed; siblings are unaffected.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("decompression failed in {hw_part}.{name}, chunk {chunk:?}")]
    Decompress {
        hw_part: u32,
        name: String,
        chunk: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum KdzError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Data(#[from] DataError),
}

impl From<io::Error> for KdzError {
    fn from(err: io::Error) -> Self {
        KdzError::Data(DataError::Io(err))
    }
}
