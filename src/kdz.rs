use nom::{
    IResult,
    bytes::complete::take,
    number::complete::{le_u8, le_u32, le_u64},
};

use crate::error::FormatError;
use crate::field::{asciiz, ensure_zero, window};

/// LG KDZ container header parser.
///
/// A KDZ file starts with a fixed-layout header whose first 8 bytes are a
/// `(size, magic)` pair identifying one of three header generations:
///
/// - v1: 1304 bytes, two sub-blob records (the DZ image and the flashing
///   DLL), 32-bit sizes and offsets.
/// - v2: 1320 bytes, four record slots with 64-bit sizes and offsets and a
///   single marker byte after the second slot. Unused slots are all-zero.
/// - v3: the v2 layout followed by an extended-memory ID, a tag, and
///   offset/size pairs for the suffix, SKU, and extended-SKU maps, plus
///   the FTM model name.
///
/// Everything past the last defined field up to the declared header size
/// must be zero. Parsing is a pure function of the byte window.
pub const V1_HDR_SIZE: u32 = 1304;
pub const V1_MAGIC: u32 = 0x5044_7932;
pub const V2_HDR_SIZE: u32 = 1320;
pub const V2_MAGIC: u32 = 0x8025_3134;
pub const V3_HDR_SIZE: u32 = 1320;
pub const V3_MAGIC: u32 = 0x2522_3824;

/// Absolute offset of the extended-memory ID data referenced by v3 headers.
pub const EXTENDED_MEM_ID_OFFSET: u64 = 0x14738;

const BASE_HDR_SIZE: usize = 8;
const V1_RECORD_SIZE: usize = 256 + 4 + 4;
const V2_RECORD_SIZE: usize = 256 + 8 + 8;

/// A named, sized, offset-addressed sub-blob inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub size: u64,
    pub offset: u64,
}

/// Offset/size pair for the v3 auxiliary map regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuxRecord {
    pub offset: u64,
    pub size: u32,
}

impl AuxRecord {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdzVersion {
    V1,
    V2,
    V3,
}

#[derive(Debug, Clone)]
pub struct KdzHeader {
    pub version: KdzVersion,

    /// Declared header size from the leading pair.
    pub size: u32,

    /// Generation magic from the leading pair.
    pub magic: u32,

    /// Named sub-blob records, in table order, empty slots omitted.
    pub records: Vec<Record>,

    /// v3 only; empty string otherwise.
    pub tag: String,

    /// v3 only; empty string otherwise.
    pub ftm_model_name: String,

    /// v3 only; declared total size of the auxiliary map regions.
    pub additional_records_size: u64,

    pub extended_mem_id: AuxRecord,
    pub suffix_map: AuxRecord,
    pub sku_map: AuxRecord,
    pub extended_sku_map: AuxRecord,
}

fn raw_record32(input: &[u8]) -> IResult<&[u8], (&[u8], u64, u64)> {
    let (input, name) = take(256usize)(input)?;
    let (input, size) = le_u32(input)?;
    let (input, offset) = le_u32(input)?;
    Ok((input, (name, u64::from(size), u64::from(offset))))
}

fn raw_record64(input: &[u8]) -> IResult<&[u8], (&[u8], u64, u64)> {
    let (input, name) = take(256usize)(input)?;
    let (input, size) = le_u64(input)?;
    let (input, offset) = le_u64(input)?;
    Ok((input, (name, size, offset)))
}

fn raw_aux(input: &[u8]) -> IResult<&[u8], AuxRecord> {
    let (input, offset) = le_u64(input)?;
    let (input, size) = le_u32(input)?;
    Ok((input, AuxRecord { offset, size }))
}

/// Map a nom failure on a pre-sized window to a truncation error. The
/// window is cut to the declared header size up front, so this only fires
/// on internal inconsistencies.
fn nom_failed(what: &'static str, data_len: usize) -> FormatError {
    FormatError::Truncated {
        what,
        offset: 0,
        need: V3_HDR_SIZE as usize,
        have: data_len,
    }
}

impl KdzHeader {
    /// Parse a KDZ container header from the start of `data`.
    ///
    /// Only the leading 8 bytes are examined before generation dispatch;
    /// an unrecognized `(size, magic)` pair fails without touching the
    /// rest of the input.
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        let base = window(data, 0, BASE_HDR_SIZE, "KDZ header")?;
        let size = u32::from_le_bytes([base[0], base[1], base[2], base[3]]);
        let magic = u32::from_le_bytes([base[4], base[5], base[6], base[7]]);

        // Newest first, like the flashing tools probe.
        if size == V3_HDR_SIZE && magic == V3_MAGIC {
            Self::parse_v3(window(data, 0, V3_HDR_SIZE as usize, "KDZ v3 header")?)
        } else if size == V2_HDR_SIZE && magic == V2_MAGIC {
            Self::parse_v2(window(data, 0, V2_HDR_SIZE as usize, "KDZ v2 header")?)
        } else if size == V1_HDR_SIZE && magic == V1_MAGIC {
            Self::parse_v1(window(data, 0, V1_HDR_SIZE as usize, "KDZ v1 header")?)
        } else {
            Err(FormatError::UnknownHeader { size, magic })
        }
    }

    fn parse_v1(hdr: &[u8]) -> Result<Self, FormatError> {
        let mut input = &hdr[BASE_HDR_SIZE..];
        let mut records = Vec::with_capacity(2);
        for index in 0..2 {
            let rec_offset = (BASE_HDR_SIZE + index * V1_RECORD_SIZE) as u64;
            let (rest, (raw_name, size, offset)) =
                raw_record32(input).map_err(|_| nom_failed("KDZ v1 header", hdr.len()))?;
            input = rest;
            let name = asciiz(raw_name, "record name", rec_offset)?;
            if name.is_empty() {
                // Both v1 slots are mandatory.
                return Err(FormatError::CorruptRecord { index, size, offset });
            }
            records.push(Record { name, size, offset });
        }
        let consumed = hdr.len() - input.len();
        ensure_zero(input, "KDZ v1 header", consumed as u64)?;

        Ok(KdzHeader {
            version: KdzVersion::V1,
            size: V1_HDR_SIZE,
            magic: V1_MAGIC,
            records,
            tag: String::new(),
            ftm_model_name: String::new(),
            additional_records_size: 0,
            extended_mem_id: AuxRecord::default(),
            suffix_map: AuxRecord::default(),
            sku_map: AuxRecord::default(),
            extended_sku_map: AuxRecord::default(),
        })
    }

    /// Parse the four v2/v3 record slots plus the marker byte wedged after
    /// the second slot. Returns the remaining input and the populated
    /// records.
    fn parse_record_slots<'a>(
        hdr: &'a [u8],
        what: &'static str,
    ) -> Result<(&'a [u8], Vec<Record>), FormatError> {
        let mut input = &hdr[BASE_HDR_SIZE..];
        let mut records = Vec::with_capacity(4);
        for index in 0..4 {
            if index == 2 {
                let (rest, marker) =
                    le_u8::<_, nom::error::Error<&[u8]>>(input)
                        .map_err(|_| nom_failed(what, hdr.len()))?;
                input = rest;
                if marker != 0 && marker != 3 {
                    return Err(FormatError::InvalidField {
                        field: "record marker",
                        offset: (BASE_HDR_SIZE + 2 * V2_RECORD_SIZE) as u64,
                        value: u64::from(marker),
                    });
                }
            }
            let rec_offset =
                (BASE_HDR_SIZE + index * V2_RECORD_SIZE + usize::from(index >= 2)) as u64;
            let (rest, (raw_name, size, offset)) =
                raw_record64(input).map_err(|_| nom_failed(what, hdr.len()))?;
            input = rest;
            let name = asciiz(raw_name, "record name", rec_offset)?;
            if name.is_empty() {
                if size != 0 || offset != 0 {
                    return Err(FormatError::CorruptRecord { index, size, offset });
                }
                continue;
            }
            records.push(Record { name, size, offset });
        }
        Ok((input, records))
    }

    fn parse_v2(hdr: &[u8]) -> Result<Self, FormatError> {
        let (input, records) = Self::parse_record_slots(hdr, "KDZ v2 header")?;
        let consumed = hdr.len() - input.len();
        ensure_zero(input, "KDZ v2 header", consumed as u64)?;

        Ok(KdzHeader {
            version: KdzVersion::V2,
            size: V2_HDR_SIZE,
            magic: V2_MAGIC,
            records,
            tag: String::new(),
            ftm_model_name: String::new(),
            additional_records_size: 0,
            extended_mem_id: AuxRecord::default(),
            suffix_map: AuxRecord::default(),
            sku_map: AuxRecord::default(),
            extended_sku_map: AuxRecord::default(),
        })
    }

    fn parse_v3(hdr: &[u8]) -> Result<Self, FormatError> {
        let (input, records) = Self::parse_record_slots(hdr, "KDZ v3 header")?;

        let tail = || nom_failed("KDZ v3 header", hdr.len());
        let (input, extended_mem_id_size) =
            le_u32::<_, nom::error::Error<&[u8]>>(input).map_err(|_| tail())?;
        let (input, raw_tag) =
            take::<_, _, nom::error::Error<&[u8]>>(5usize)(input).map_err(|_| tail())?;
        let (input, additional_records_size) =
            le_u64::<_, nom::error::Error<&[u8]>>(input).map_err(|_| tail())?;
        let (input, suffix_map) = raw_aux(input).map_err(|_| tail())?;
        let (input, sku_map) = raw_aux(input).map_err(|_| tail())?;
        let (input, raw_ftm_model_name) =
            take::<_, _, nom::error::Error<&[u8]>>(32usize)(input).map_err(|_| tail())?;
        let (input, extended_sku_map) = raw_aux(input).map_err(|_| tail())?;

        let consumed = hdr.len() - input.len();
        ensure_zero(input, "KDZ v3 header", consumed as u64)?;

        // Tail field offsets: slots end at 1097, tag at 1101, the declared
        // additional-records size at 1106, FTM model name at 1138.
        let tag = asciiz(raw_tag, "tag", 1101)?;
        let ftm_model_name = asciiz(raw_ftm_model_name, "FTM model name", 1138)?;

        let declared = u64::from(suffix_map.size)
            + u64::from(sku_map.size)
            + u64::from(extended_sku_map.size);
        if additional_records_size != declared {
            return Err(FormatError::InvalidField {
                field: "additional records size",
                offset: 1106,
                value: additional_records_size,
            });
        }

        Ok(KdzHeader {
            version: KdzVersion::V3,
            size: V3_HDR_SIZE,
            magic: V3_MAGIC,
            records,
            tag,
            ftm_model_name,
            additional_records_size,
            extended_mem_id: AuxRecord {
                offset: EXTENDED_MEM_ID_OFFSET,
                size: extended_mem_id_size,
            },
            suffix_map,
            sku_map,
            extended_sku_map,
        })
    }

    /// The record naming the DZ segment table, if the container has one.
    pub fn dz_record(&self) -> Option<&Record> {
        self.records.iter().find(|r| r.name.ends_with(".dz"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_name(buf: &mut [u8], name: &str) {
        buf[..name.len()].copy_from_slice(name.as_bytes());
    }

    pub(crate) fn v1_fixture() -> Vec<u8> {
        let mut hdr = vec![0u8; V1_HDR_SIZE as usize];
        hdr[0..4].copy_from_slice(&V1_HDR_SIZE.to_le_bytes());
        hdr[4..8].copy_from_slice(&V1_MAGIC.to_le_bytes());
        let mut pos = 8;
        for (name, size, offset) in [("image.dz", 9000u32, 1304u32), ("flash.dll", 500, 10304)] {
            put_name(&mut hdr[pos..pos + 256], name);
            hdr[pos + 256..pos + 260].copy_from_slice(&size.to_le_bytes());
            hdr[pos + 260..pos + 264].copy_from_slice(&offset.to_le_bytes());
            pos += 264;
        }
        hdr
    }

    pub(crate) fn v2_fixture() -> Vec<u8> {
        let mut hdr = vec![0u8; V2_HDR_SIZE as usize];
        hdr[0..4].copy_from_slice(&V2_HDR_SIZE.to_le_bytes());
        hdr[4..8].copy_from_slice(&V2_MAGIC.to_le_bytes());
        let mut pos = 8;
        for (name, size, offset) in [("image.dz", 90000u64, 83768u64), ("flash.dll", 700, 173768)]
        {
            put_name(&mut hdr[pos..pos + 256], name);
            hdr[pos + 256..pos + 264].copy_from_slice(&size.to_le_bytes());
            hdr[pos + 264..pos + 272].copy_from_slice(&offset.to_le_bytes());
            pos += 272;
        }
        hdr[pos] = 3; // marker byte, slots 3 and 4 left empty
        hdr
    }

    pub(crate) fn v3_fixture() -> Vec<u8> {
        let mut hdr = v2_fixture();
        hdr[4..8].copy_from_slice(&V3_MAGIC.to_le_bytes());
        // Tail starts right after the four slots and the marker byte.
        let mut pos = 8 + 4 * V2_RECORD_SIZE + 1;
        hdr[pos..pos + 4].copy_from_slice(&16u32.to_le_bytes()); // extended mem ID size
        hdr[pos + 4..pos + 7].copy_from_slice(b"OPT");
        pos += 9;
        hdr[pos..pos + 8].copy_from_slice(&(64u64 + 32).to_le_bytes()); // additional records
        pos += 8;
        hdr[pos..pos + 8].copy_from_slice(&200_000u64.to_le_bytes()); // suffix map offset
        hdr[pos + 8..pos + 12].copy_from_slice(&64u32.to_le_bytes());
        pos += 12;
        hdr[pos..pos + 8].copy_from_slice(&200_064u64.to_le_bytes()); // SKU map offset
        hdr[pos + 8..pos + 12].copy_from_slice(&32u32.to_le_bytes());
        pos += 12;
        put_name(&mut hdr[pos..pos + 32], "LM-G900");
        hdr
    }

    #[test]
    fn v1_round_trips() {
        let hdr = KdzHeader::parse(&v1_fixture()).unwrap();
        assert_eq!(hdr.version, KdzVersion::V1);
        assert_eq!(
            hdr.records,
            vec![
                Record { name: "image.dz".into(), size: 9000, offset: 1304 },
                Record { name: "flash.dll".into(), size: 500, offset: 10304 },
            ]
        );
    }

    #[test]
    fn v2_round_trips_and_skips_empty_slots() {
        let hdr = KdzHeader::parse(&v2_fixture()).unwrap();
        assert_eq!(hdr.version, KdzVersion::V2);
        assert_eq!(
            hdr.records,
            vec![
                Record { name: "image.dz".into(), size: 90000, offset: 83768 },
                Record { name: "flash.dll".into(), size: 700, offset: 173768 },
            ]
        );
        assert_eq!(hdr.dz_record().unwrap().name, "image.dz");
    }

    #[test]
    fn v3_round_trips_with_aux_records() {
        let hdr = KdzHeader::parse(&v3_fixture()).unwrap();
        assert_eq!(hdr.version, KdzVersion::V3);
        assert_eq!(hdr.records.len(), 2);
        assert_eq!(hdr.tag, "OPT");
        assert_eq!(hdr.ftm_model_name, "LM-G900");
        assert_eq!(hdr.extended_mem_id.offset, EXTENDED_MEM_ID_OFFSET);
        assert_eq!(hdr.extended_mem_id.size, 16);
        assert_eq!(hdr.suffix_map, AuxRecord { offset: 200_000, size: 64 });
        assert_eq!(hdr.sku_map, AuxRecord { offset: 200_064, size: 32 });
        assert!(hdr.extended_sku_map.is_empty());
        assert_eq!(hdr.additional_records_size, 96);
    }

    #[test]
    fn unknown_pair_fails_from_the_prefix_alone() {
        // Only 8 bytes supplied: dispatch must fail before asking for more.
        let mut base = [0u8; 8];
        base[0..4].copy_from_slice(&1320u32.to_le_bytes());
        base[4..8].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        assert!(matches!(
            KdzHeader::parse(&base),
            Err(FormatError::UnknownHeader { size: 1320, magic: 0xdead_beef })
        ));
    }

    #[test]
    fn empty_name_with_payload_is_corrupt() {
        let mut hdr = v2_fixture();
        // Third slot: no name, non-zero size.
        let pos = 8 + 2 * V2_RECORD_SIZE + 1;
        hdr[pos + 256..pos + 264].copy_from_slice(&1u64.to_le_bytes());
        assert!(matches!(
            KdzHeader::parse(&hdr),
            Err(FormatError::CorruptRecord { index: 2, size: 1, offset: 0 })
        ));
    }

    #[test]
    fn trailing_padding_must_be_zero() {
        let mut hdr = v1_fixture();
        let len = hdr.len();
        hdr[len - 1] = 0xaa;
        assert!(matches!(
            KdzHeader::parse(&hdr),
            Err(FormatError::CorruptPadding { .. })
        ));
    }

    #[test]
    fn bad_marker_byte_is_rejected() {
        let mut hdr = v2_fixture();
        hdr[8 + 2 * V2_RECORD_SIZE] = 7;
        assert!(matches!(
            KdzHeader::parse(&hdr),
            Err(FormatError::InvalidField { field: "record marker", .. })
        ));
    }
}
