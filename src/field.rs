//! Helpers for the fixed-layout string and padding fields that every KDZ
//! structure uses: NUL-padded ASCII names and must-be-zero filler.

use crate::error::FormatError;

/// Decode a NUL-padded ASCII field, trimming trailing zero bytes.
///
/// `offset` is the absolute position of the field, used for error context.
pub(crate) fn asciiz(
    raw: &[u8],
    field: &'static str,
    offset: u64,
) -> Result<String, FormatError> {
    let end = raw
        .iter()
        .rposition(|&b| b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    let trimmed = &raw[..end];
    if !trimmed.is_ascii() {
        return Err(FormatError::InvalidString { field, offset });
    }
    // Safe per the check above; ASCII is valid UTF-8.
    Ok(String::from_utf8_lossy(trimmed).into_owned())
}

/// Require every byte of `raw` to be zero, reporting the absolute offset
/// of the first offender.
pub(crate) fn ensure_zero(
    raw: &[u8],
    region: &'static str,
    offset: u64,
) -> Result<(), FormatError> {
    match raw.iter().position(|&b| b != 0) {
        None => Ok(()),
        Some(p) => Err(FormatError::CorruptPadding {
            region,
            offset: offset + p as u64,
        }),
    }
}

/// Slice `count` bytes at `offset`, or fail with a truncation error that
/// names the structure being decoded.
pub(crate) fn window<'a>(
    data: &'a [u8],
    offset: u64,
    count: usize,
    what: &'static str,
) -> Result<&'a [u8], FormatError> {
    let start = usize::try_from(offset).map_err(|_| FormatError::Truncated {
        what,
        offset,
        need: count,
        have: 0,
    })?;
    data.get(start..start.saturating_add(count))
        .ok_or(FormatError::Truncated {
            what,
            offset,
            need: count,
            have: data.len().saturating_sub(start),
        })
}
