pub mod cmd;
pub mod dz;
pub mod error;
pub mod extract;
pub mod kdz;
pub mod secure;

mod field;
#[cfg(test)]
mod testutil;

pub use crate::dz::{Chunk, Compression, DzHeader, LogicalPartition, Verify};
pub use crate::error::{DataError, FormatError, IntegrityError, KdzError};
pub use crate::extract::{ExtractOptions, ExtractSummary, extract_partitions};
pub use crate::kdz::{KdzHeader, KdzVersion, Record};
pub use crate::secure::SecurePartition;
