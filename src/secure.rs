use nom::{
    IResult,
    bytes::complete::take,
    number::complete::{le_u8, le_u32},
};

use crate::error::FormatError;
use crate::field::{asciiz, ensure_zero};

/// Secure partition table: an auxiliary, magic-tagged region at a fixed
/// absolute offset carrying the expected flash layout and a signature.
/// Purely diagnostic; extraction never depends on it, and its absence is
/// a recoverable condition (`FormatError::NoSecurePartition`).
pub const SECURE_PART_OFFSET: u64 = 1320;
pub const SECURE_PART_SIZE: usize = 82448;
pub const SECURE_PART_MAGIC: u32 = 0x5343_0799;
pub const SIG_SIZE_MAX: usize = 0x200;

const HDR_SIZE: usize = 16 + SIG_SIZE_MAX;
const ENTRY_SIZE: usize = 80;

/// One partition descriptor from the secure table.
#[derive(Debug, Clone)]
pub struct SecurePart {
    pub name: String,
    pub hw_part: u8,
    pub logical_part: u8,
    pub start_sect: u32,
    pub end_sect: u32,
    pub data_sect_cnt: u32,
    pub hash: [u8; 32],
}

/// Entries grouped by hardware partition and name, in table order.
#[derive(Debug, Clone)]
pub struct SecureGroup {
    pub hw_part: u8,
    pub name: String,
    pub entries: Vec<SecurePart>,
}

#[derive(Debug, Clone)]
pub struct SecurePartition {
    pub flags: u32,
    pub signature: Vec<u8>,
    pub groups: Vec<SecureGroup>,
}

fn raw_entry(input: &[u8]) -> IResult<&[u8], (&[u8], u8, u8, u32, u32, u32, u32, &[u8])> {
    let (input, name) = take(30usize)(input)?;
    let (input, hw_part) = le_u8(input)?;
    let (input, logical_part) = le_u8(input)?;
    let (input, start_sect) = le_u32(input)?;
    let (input, end_sect) = le_u32(input)?;
    let (input, data_sect_cnt) = le_u32(input)?;
    let (input, reserved) = le_u32(input)?;
    let (input, hash) = take(32usize)(input)?;
    Ok((
        input,
        (name, hw_part, logical_part, start_sect, end_sect, data_sect_cnt, reserved, hash),
    ))
}

impl SecurePartition {
    /// Decode the secure partition table from the container bytes.
    ///
    /// A container without the region (too short, or other data where the
    /// magic should be) reports `NoSecurePartition` rather than a hard
    /// format error so callers can continue extraction.
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        let start = SECURE_PART_OFFSET as usize;
        let region = match data.get(start..start + SECURE_PART_SIZE) {
            Some(region) => region,
            None => return Err(FormatError::NoSecurePartition { found: 0 }),
        };

        let magic = u32::from_le_bytes([region[0], region[1], region[2], region[3]]);
        if magic != SECURE_PART_MAGIC {
            return Err(FormatError::NoSecurePartition { found: magic });
        }
        let flags = u32::from_le_bytes([region[4], region[5], region[6], region[7]]);
        let part_count = u32::from_le_bytes([region[8], region[9], region[10], region[11]]);
        let sig_size = u32::from_le_bytes([region[12], region[13], region[14], region[15]]);

        if sig_size as usize > SIG_SIZE_MAX {
            return Err(FormatError::InvalidField {
                field: "signature size",
                offset: SECURE_PART_OFFSET + 12,
                value: u64::from(sig_size),
            });
        }
        let signature = &region[16..16 + SIG_SIZE_MAX];
        ensure_zero(
            &signature[sig_size as usize..],
            "signature",
            SECURE_PART_OFFSET + 16 + u64::from(sig_size),
        )?;

        let entry_data = &region[HDR_SIZE..];
        let table_len = part_count as usize * ENTRY_SIZE;
        if table_len > entry_data.len() {
            return Err(FormatError::InvalidField {
                field: "secure part count",
                offset: SECURE_PART_OFFSET + 8,
                value: u64::from(part_count),
            });
        }
        ensure_zero(
            &entry_data[table_len..],
            "secure partition table",
            SECURE_PART_OFFSET + (HDR_SIZE + table_len) as u64,
        )?;

        let mut groups: Vec<SecureGroup> = Vec::new();
        let mut input = &entry_data[..table_len];
        for index in 0..part_count as usize {
            let entry_offset = SECURE_PART_OFFSET + (HDR_SIZE + index * ENTRY_SIZE) as u64;
            let (rest, (raw_name, hw_part, logical_part, start_sect, end_sect, data_sect_cnt,
                reserved, raw_hash)) =
                raw_entry(input).map_err(|_| FormatError::Truncated {
                    what: "secure partition entry",
                    offset: entry_offset,
                    need: ENTRY_SIZE,
                    have: input.len(),
                })?;
            input = rest;

            if reserved != 0 {
                return Err(FormatError::InvalidField {
                    field: "reserved",
                    offset: entry_offset + 44,
                    value: u64::from(reserved),
                });
            }
            if data_sect_cnt == 0 {
                return Err(FormatError::InvalidField {
                    field: "data sector count",
                    offset: entry_offset + 40,
                    value: 0,
                });
            }
            // end_sect is not validated against start_sect + data_sect_cnt:
            // vendor images ship with inconsistent values there.

            let name = asciiz(raw_name, "secure partition name", entry_offset)?;
            let mut hash = [0u8; 32];
            hash.copy_from_slice(raw_hash);
            let part = SecurePart {
                name: name.clone(),
                hw_part,
                logical_part,
                start_sect,
                end_sect,
                data_sect_cnt,
                hash,
            };
            match groups
                .iter_mut()
                .find(|g| g.hw_part == hw_part && g.name == name)
            {
                Some(group) => group.entries.push(part),
                None => groups.push(SecureGroup { hw_part, name, entries: vec![part] }),
            }
        }

        Ok(SecurePartition {
            flags,
            signature: signature[..sig_size as usize].to_vec(),
            groups,
        })
    }

    /// Total number of entries across all groups.
    pub fn part_count(&self) -> usize {
        self.groups.iter().map(|g| g.entries.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn fixture(entries: &[(&str, u8, u32, u32)]) -> Vec<u8> {
        let mut data = vec![0u8; SECURE_PART_OFFSET as usize + SECURE_PART_SIZE];
        let base = SECURE_PART_OFFSET as usize;
        data[base..base + 4].copy_from_slice(&SECURE_PART_MAGIC.to_le_bytes());
        data[base + 4..base + 8].copy_from_slice(&1u32.to_le_bytes()); // flags
        data[base + 8..base + 12].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        data[base + 12..base + 16].copy_from_slice(&4u32.to_le_bytes()); // sig_size
        data[base + 16..base + 20].copy_from_slice(b"\x01\x02\x03\x04");
        let mut pos = base + HDR_SIZE;
        for (name, hw_part, start, count) in entries {
            data[pos..pos + name.len()].copy_from_slice(name.as_bytes());
            data[pos + 30] = *hw_part;
            data[pos + 31] = 1;
            data[pos + 32..pos + 36].copy_from_slice(&start.to_le_bytes());
            data[pos + 36..pos + 40].copy_from_slice(&(start + count).to_le_bytes());
            data[pos + 40..pos + 44].copy_from_slice(&count.to_le_bytes());
            pos += ENTRY_SIZE;
        }
        data
    }

    #[test]
    fn groups_by_hw_partition_and_name() {
        let data = fixture(&[
            ("boot_a", 0, 100, 8),
            ("boot_a", 0, 108, 8),
            ("modem", 1, 0, 16),
        ]);
        let sec = SecurePartition::parse(&data).unwrap();
        assert_eq!(sec.flags, 1);
        assert_eq!(sec.signature, vec![1, 2, 3, 4]);
        assert_eq!(sec.part_count(), 3);
        assert_eq!(sec.groups.len(), 2);
        assert_eq!(sec.groups[0].name, "boot_a");
        assert_eq!(sec.groups[0].entries.len(), 2);
        assert_eq!(sec.groups[1].hw_part, 1);
    }

    #[test]
    fn bad_magic_is_recoverable_not_found() {
        let mut data = fixture(&[("boot_a", 0, 100, 8)]);
        data[SECURE_PART_OFFSET as usize] ^= 0xff;
        assert!(matches!(
            SecurePartition::parse(&data),
            Err(FormatError::NoSecurePartition { .. })
        ));
    }

    #[test]
    fn short_container_reports_not_found() {
        assert!(matches!(
            SecurePartition::parse(&[0u8; 64]),
            Err(FormatError::NoSecurePartition { found: 0 })
        ));
    }

    #[test]
    fn nonzero_reserved_field_is_invalid() {
        let mut data = fixture(&[("boot_a", 0, 100, 8)]);
        let pos = SECURE_PART_OFFSET as usize + HDR_SIZE + 44;
        data[pos] = 1;
        assert!(matches!(
            SecurePartition::parse(&data),
            Err(FormatError::InvalidField { field: "reserved", .. })
        ));
    }

    #[test]
    fn empty_entry_is_invalid() {
        let data = fixture(&[("boot_a", 0, 100, 0)]);
        assert!(matches!(
            SecurePartition::parse(&data),
            Err(FormatError::InvalidField { field: "data sector count", .. })
        ));
    }

    #[test]
    fn stray_bytes_after_last_entry_are_corrupt() {
        let mut data = fixture(&[("boot_a", 0, 100, 8)]);
        let pos = SECURE_PART_OFFSET as usize + HDR_SIZE + ENTRY_SIZE + 3;
        data[pos] = 0x5a;
        assert!(matches!(
            SecurePartition::parse(&data),
            Err(FormatError::CorruptPadding { .. })
        ));
    }
}
