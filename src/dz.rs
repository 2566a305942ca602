use chrono::{Datelike, NaiveDate, NaiveDateTime};
use nom::{
    IResult,
    bytes::complete::take,
    number::complete::{le_u8, le_u16, le_u32},
};

use crate::error::{FormatError, IntegrityError, KdzError};
use crate::field::{asciiz, ensure_zero, window};
use crate::kdz::Record;

/// DZ segment table parser.
///
/// The DZ sub-blob starts with a 512-byte fixed header followed by
/// `part_count` segment records, each immediately followed by that
/// segment's compressed chunk data. Three integrity surfaces cover the
/// table:
///
/// - a CRC32 of the header with the data-hash and CRC fields zeroed
///   (checked up front when the stored value is non-zero),
/// - an MD5 over the concatenated raw record headers (always checked),
/// - an optional end-to-end MD5 seeded with the header (data-hash field
///   replaced by `0xFF` bytes) and fed every record and every raw chunk
///   byte, checked after the whole table has been read.
///
/// Records come in two shapes selected by the header's minor version:
/// minor 0 has no sector placement and lands every chunk in one synthetic
/// hardware partition; minor 1 carries sector placement and a partition
/// start-sector hint that is cross-checked against a running accumulator.
pub const DZ_MAGIC: u32 = 0x7418_9632;
pub const CHUNK_MAGIC: u32 = 0x7895_1230;

/// Synthetic hardware partition for minor=0 tables, which carry no
/// placement at all.
pub const HW_PARTITION_NONE: u32 = 0x5000;

pub const DZ_HDR_SIZE: usize = 512;
pub const V0_RECORD_SIZE: usize = 124;
pub const V1_RECORD_SIZE: usize = 512;

/// Bound on single hash/decompress reads so chunk data is streamed, not
/// slurped.
pub(crate) const READ_CHUNK_SIZE: usize = 1 << 20;

const DATA_HASH_START: usize = 222;
const DATA_HASH_END: usize = 238;
const HEADER_CRC_START: usize = 308;
const HEADER_CRC_END: usize = 312;

/// Chunk compression declared by the DZ header, applied to every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zlib,
    Zstd,
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Zlib => f.write_str("zlib"),
            Compression::Zstd => f.write_str("zstd"),
        }
    }
}

impl Compression {
    /// Decode the 9-byte compression field. Newer images spell the
    /// algorithm out as ASCII; older ones use a single type byte.
    fn from_field(raw: &[u8], offset: u64) -> Result<Self, FormatError> {
        if raw[1] != 0 {
            let name = asciiz(raw, "compression", offset)?;
            match name.to_ascii_lowercase().as_str() {
                "zlib" => Ok(Compression::Zlib),
                "zstd" => Ok(Compression::Zstd),
                _ => Err(FormatError::UnsupportedCompression(name)),
            }
        } else {
            if raw[2..].iter().any(|&b| b != 0) {
                return Err(FormatError::UnsupportedCompression(hex::encode(raw)));
            }
            match raw[0] {
                1 => Ok(Compression::Zlib),
                4 => Ok(Compression::Zstd),
                b => Err(FormatError::UnsupportedCompression(b.to_string())),
            }
        }
    }
}

/// Verification knobs for the decode pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verify {
    /// Accumulate and check the end-to-end data MD5 (reads every chunk
    /// byte during decode).
    pub full: bool,
    /// Downgrade integrity mismatches to surfaced warnings.
    pub lenient: bool,
}

/// One independently compressed unit of partition data.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub name: String,
    /// Decompressed size.
    pub data_size: u32,
    /// Absolute offset of the compressed bytes in the container.
    pub file_offset: u64,
    /// Compressed size.
    pub file_size: u32,
    pub hash: [u8; 16],
    /// Present in minor=1 records only; zero otherwise.
    pub crc: u32,
    pub start_sector: u32,
    pub sector_count: u32,
    pub part_start_sector: u32,
    pub unique_part_id: u32,
    pub is_sparse: bool,
    pub is_ubi_image: bool,
}

/// A named flash target assembled from one or more chunks, in table order.
#[derive(Debug, Clone)]
pub struct LogicalPartition {
    pub hw_part: u32,
    pub name: String,
    pub chunks: Vec<Chunk>,
}

impl LogicalPartition {
    /// Size of the reconstructed image in bytes: the declared sector span
    /// for placed tables, the summed chunk sizes for minor=0 tables.
    pub fn image_size(&self) -> u64 {
        let first = &self.chunks[0];
        let last = &self.chunks[self.chunks.len() - 1];
        let end = u64::from(last.start_sector) + u64::from(last.sector_count);
        if end == 0 {
            self.chunks.iter().map(|c| u64::from(c.data_size)).sum()
        } else {
            (end - u64::from(first.part_start_sector)) * 4096
        }
    }
}

#[derive(Debug, Clone)]
pub struct DzHeader {
    pub major: u32,
    pub minor: u32,
    pub model_name: String,
    pub sw_version: String,
    /// `None` iff every build-date subfield is zero.
    pub build_date: Option<NaiveDateTime>,
    pub compression: Compression,
    pub secure_image_type: u8,
    pub swfv: String,
    pub build_type: String,
    pub android_ver: String,
    pub memory_size: String,
    pub signed_security: String,
    pub is_ufs: bool,
    pub anti_rollback_ver: u32,
    pub supported_mem: String,
    pub target_product: String,
    pub operator_code: Vec<String>,
    pub multi_panel_mask: u8,
    pub product_fuse_id: u8,
    pub is_factory_image: bool,
    pub chunk_hdrs_hash: [u8; 16],
    pub data_hash: [u8; 16],
    pub header_crc: u32,
    pub parts: Vec<LogicalPartition>,
}

struct RawDzHeader<'a> {
    magic: u32,
    major: u32,
    minor: u32,
    reserved: u32,
    model_name: &'a [u8],
    sw_version: &'a [u8],
    build_date: [u16; 8],
    part_count: u32,
    chunk_hdrs_hash: &'a [u8],
    secure_image_type: u8,
    compression: &'a [u8],
    data_hash: &'a [u8],
    swfv: &'a [u8],
    build_type: &'a [u8],
    unknown0: u32,
    header_crc: u32,
    android_ver: &'a [u8],
    memory_size: &'a [u8],
    signed_security: &'a [u8],
    is_ufs: u32,
    anti_rollback_ver: u32,
    supported_mem: &'a [u8],
    target_product: &'a [u8],
    multi_panel_mask: u8,
    product_fuse_id: u8,
    unknown1: u32,
    is_factory_image: u8,
    operator_code: &'a [u8],
    unknown2: u32,
    padding: &'a [u8],
}

fn raw_header(input: &[u8]) -> IResult<&[u8], RawDzHeader<'_>> {
    let (input, magic) = le_u32(input)?;
    let (input, major) = le_u32(input)?;
    let (input, minor) = le_u32(input)?;
    let (input, reserved) = le_u32(input)?;
    let (input, model_name) = take(32usize)(input)?;
    let (input, sw_version) = take(128usize)(input)?;
    let mut build_date = [0u16; 8];
    let mut input = input;
    for slot in build_date.iter_mut() {
        let (rest, word) = le_u16(input)?;
        *slot = word;
        input = rest;
    }
    let (input, part_count) = le_u32(input)?;
    let (input, chunk_hdrs_hash) = take(16usize)(input)?;
    let (input, secure_image_type) = le_u8(input)?;
    let (input, compression) = take(9usize)(input)?;
    let (input, data_hash) = take(16usize)(input)?;
    let (input, swfv) = take(50usize)(input)?;
    let (input, build_type) = take(16usize)(input)?;
    let (input, unknown0) = le_u32(input)?;
    let (input, header_crc) = le_u32(input)?;
    let (input, android_ver) = take(10usize)(input)?;
    let (input, memory_size) = take(11usize)(input)?;
    let (input, signed_security) = take(4usize)(input)?;
    let (input, is_ufs) = le_u32(input)?;
    let (input, anti_rollback_ver) = le_u32(input)?;
    let (input, supported_mem) = take(64usize)(input)?;
    let (input, target_product) = take(24usize)(input)?;
    let (input, multi_panel_mask) = le_u8(input)?;
    let (input, product_fuse_id) = le_u8(input)?;
    let (input, unknown1) = le_u32(input)?;
    let (input, is_factory_image) = le_u8(input)?;
    let (input, operator_code) = take(24usize)(input)?;
    let (input, unknown2) = le_u32(input)?;
    let (input, padding) = take(44usize)(input)?;
    Ok((
        input,
        RawDzHeader {
            magic,
            major,
            minor,
            reserved,
            model_name,
            sw_version,
            build_date,
            part_count,
            chunk_hdrs_hash,
            secure_image_type,
            compression,
            data_hash,
            swfv,
            build_type,
            unknown0,
            header_crc,
            android_ver,
            memory_size,
            signed_security,
            is_ufs,
            anti_rollback_ver,
            supported_mem,
            target_product,
            multi_panel_mask,
            product_fuse_id,
            unknown1,
            is_factory_image,
            operator_code,
            unknown2,
            padding,
        },
    ))
}

fn raw_v0_record(input: &[u8]) -> IResult<&[u8], (u32, &[u8], &[u8], u32, u32, &[u8])> {
    let (input, magic) = le_u32(input)?;
    let (input, part_name) = take(32usize)(input)?;
    let (input, chunk_name) = take(64usize)(input)?;
    let (input, data_size) = le_u32(input)?;
    let (input, file_size) = le_u32(input)?;
    let (input, hash) = take(16usize)(input)?;
    Ok((input, (magic, part_name, chunk_name, data_size, file_size, hash)))
}

#[allow(clippy::type_complexity)]
fn raw_v1_record(
    input: &[u8],
) -> IResult<&[u8], (u32, &[u8], &[u8], u32, u32, &[u8], [u32; 8], &[u8])> {
    let (input, (magic, part_name, chunk_name, data_size, file_size, hash)) =
        raw_v0_record(input)?;
    let mut words = [0u32; 8];
    let mut input = input;
    for slot in words.iter_mut() {
        let (rest, word) = le_u32(input)?;
        *slot = word;
        input = rest;
    }
    let (input, padding) = take(356usize)(input)?;
    Ok((
        input,
        (magic, part_name, chunk_name, data_size, file_size, hash, words, padding),
    ))
}

/// Running sector-placement accumulator for minor=1 tables.
///
/// The record layout has no cumulative offset field, so the partition
/// start sector is reconstructed by folding this state across records in
/// table order: a fresh hardware partition resets it, a fresh logical
/// name advances it by the previous partition's sector span, and a
/// non-zero per-record hint both seeds and cross-checks the result.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SectorTracker {
    part_start_sector: u64,
    part_sector_count: u64,
}

impl SectorTracker {
    /// First record of a hardware partition not seen before.
    pub(crate) fn enter_hw_partition(&mut self, hint: u32, start_sector: u32) {
        self.part_start_sector = 0;
        self.part_sector_count = 0;
        if hint > 0 && hint <= start_sector {
            self.part_start_sector = u64::from(hint);
        }
    }

    /// First record of a logical name not seen before under the current
    /// hardware partition.
    pub(crate) fn enter_part(&mut self, hint: u32, start_sector: u32) {
        if hint == 0 {
            self.part_start_sector = u64::from(start_sector);
        } else {
            self.part_start_sector += self.part_sector_count;
            if u64::from(hint) > self.part_start_sector && hint <= start_sector {
                self.part_start_sector = u64::from(hint);
            }
        }
        self.part_sector_count = 0;
    }

    /// Validate the record's hint against the computed start, fold the
    /// record's span into the running count, and yield the partition
    /// start sector for this chunk.
    pub(crate) fn commit(
        &mut self,
        index: usize,
        start_sector: u32,
        sector_count: u32,
        hint: u32,
        offset: u64,
    ) -> Result<u32, FormatError> {
        if hint != 0 && u64::from(hint) != self.part_start_sector {
            return Err(FormatError::SectorMismatch {
                index,
                expected: self.part_start_sector as u32,
                got: hint,
            });
        }
        if u64::from(start_sector) < self.part_start_sector {
            return Err(FormatError::InvalidField {
                field: "start sector",
                offset,
                value: u64::from(start_sector),
            });
        }
        let part_start =
            u32::try_from(self.part_start_sector).map_err(|_| FormatError::InvalidField {
                field: "partition start sector",
                offset,
                value: self.part_start_sector,
            })?;
        self.part_sector_count =
            (u64::from(start_sector) - self.part_start_sector) + u64::from(sector_count);
        Ok(part_start)
    }
}

/// Push a chunk into its `(hw_part, name)` group, creating the group on
/// first sight and keeping table order.
fn push_chunk(
    parts: &mut Vec<LogicalPartition>,
    hw_part: u32,
    name: &str,
    chunk: Chunk,
    offset: u64,
) -> Result<(), FormatError> {
    match parts
        .iter_mut()
        .find(|p| p.hw_part == hw_part && p.name == name)
    {
        Some(group) => {
            if let Some(prev) = group.chunks.last() {
                // Table order must equal ascending sector order.
                if chunk.start_sector < prev.start_sector {
                    return Err(FormatError::InvalidField {
                        field: "start sector",
                        offset,
                        value: u64::from(chunk.start_sector),
                    });
                }
            }
            group.chunks.push(chunk);
        }
        None => parts.push(LogicalPartition {
            hw_part,
            name: name.to_owned(),
            chunks: vec![chunk],
        }),
    }
    Ok(())
}

fn parse_build_date(words: &[u16; 8], offset: u64) -> Result<Option<NaiveDateTime>, FormatError> {
    if words.iter().all(|&w| w == 0) {
        return Ok(None);
    }
    let [year, month, weekday, day, hour, minute, second, millisec] = *words;
    let invalid = |value: u64| FormatError::InvalidField { field: "build date", offset, value };
    let date = NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
        .ok_or_else(|| invalid(u64::from(year)))?;
    let stamp = date
        .and_hms_milli_opt(
            u32::from(hour),
            u32::from(minute),
            u32::from(second),
            u32::from(millisec),
        )
        .ok_or_else(|| invalid(u64::from(hour)))?;
    if date.weekday().num_days_from_monday() != u32::from(weekday) {
        return Err(FormatError::InvalidField {
            field: "build weekday",
            offset,
            value: u64::from(weekday),
        });
    }
    Ok(Some(stamp))
}

/// Raise or collect an integrity mismatch depending on leniency.
fn integrity(
    err: IntegrityError,
    lenient: bool,
    warnings: &mut Vec<IntegrityError>,
) -> Result<(), KdzError> {
    if lenient {
        warnings.push(err);
        Ok(())
    } else {
        Err(err.into())
    }
}

impl DzHeader {
    /// Decode the DZ segment table named by `record` out of the container
    /// bytes. Returns the decoded table plus any integrity warnings
    /// collected in lenient mode.
    pub fn parse(
        data: &[u8],
        record: &Record,
        verify: Verify,
    ) -> Result<(Self, Vec<IntegrityError>), KdzError> {
        let base = record.offset;
        let hdr = window(data, base, DZ_HDR_SIZE, "DZ header")?;
        let (_, raw) =
            raw_header(hdr).map_err(|_| FormatError::Truncated {
                what: "DZ header",
                offset: base,
                need: DZ_HDR_SIZE,
                have: hdr.len(),
            })?;

        if raw.magic != DZ_MAGIC {
            return Err(FormatError::BadMagic {
                what: "DZ header",
                offset: base,
                expected: DZ_MAGIC,
                found: raw.magic,
            }
            .into());
        }

        let mut warnings = Vec::new();

        // Header CRC covers the header bytes with both mutable fields
        // (data hash, CRC itself) zeroed. A stored zero means "not set".
        if raw.header_crc != 0 {
            let mut patched = [0u8; DZ_HDR_SIZE];
            patched.copy_from_slice(hdr);
            patched[DATA_HASH_START..DATA_HASH_END].fill(0);
            patched[HEADER_CRC_START..HEADER_CRC_END].fill(0);
            let mut crc = crc32fast::Hasher::new();
            crc.update(&patched);
            let computed = crc.finalize();
            if computed != raw.header_crc {
                integrity(
                    IntegrityError::HeaderCrcMismatch { stored: raw.header_crc, computed },
                    verify.lenient,
                    &mut warnings,
                )?;
            }
        }

        let mut stored_data_hash = [0u8; 16];
        stored_data_hash.copy_from_slice(raw.data_hash);

        // The end-to-end hash is seeded with the header as it would look
        // before the data hash was filled in: that field all 0xFF, the
        // CRC kept as stored.
        let mut data_hash_ctx = if verify.full && stored_data_hash != [0xff; 16] {
            let mut patched = [0u8; DZ_HDR_SIZE];
            patched.copy_from_slice(hdr);
            patched[DATA_HASH_START..DATA_HASH_END].fill(0xff);
            let mut ctx = md5::Context::new();
            ctx.consume(patched);
            Some(ctx)
        } else {
            None
        };

        if raw.major > 2 || raw.minor > 1 {
            return Err(FormatError::UnsupportedVersion { major: raw.major, minor: raw.minor }
                .into());
        }
        if raw.reserved != 0 {
            return Err(FormatError::InvalidField {
                field: "reserved",
                offset: base + 12,
                value: u64::from(raw.reserved),
            }
            .into());
        }
        if raw.part_count == 0 {
            return Err(FormatError::InvalidField {
                field: "segment count",
                offset: base + 192,
                value: 0,
            }
            .into());
        }
        if raw.unknown0 != 0 {
            return Err(FormatError::InvalidField {
                field: "unknown0",
                offset: base + 304,
                value: u64::from(raw.unknown0),
            }
            .into());
        }
        if raw.unknown1 != 0 && raw.unknown1 != 0xffff_ffff {
            return Err(FormatError::InvalidField {
                field: "unknown1",
                offset: base + 435,
                value: u64::from(raw.unknown1),
            }
            .into());
        }
        if raw.unknown2 > 1 {
            return Err(FormatError::InvalidField {
                field: "unknown2",
                offset: base + 464,
                value: u64::from(raw.unknown2),
            }
            .into());
        }
        ensure_zero(raw.padding, "DZ header", base + 468)?;

        let compression = Compression::from_field(raw.compression, base + 213)?;
        let build_date = parse_build_date(&raw.build_date, base + 176)?;

        let mut chunk_hdrs_hash = [0u8; 16];
        chunk_hdrs_hash.copy_from_slice(raw.chunk_hdrs_hash);

        let mut header = DzHeader {
            major: raw.major,
            minor: raw.minor,
            model_name: asciiz(raw.model_name, "model name", base + 16)?,
            sw_version: asciiz(raw.sw_version, "SW version", base + 48)?,
            build_date,
            compression,
            secure_image_type: raw.secure_image_type,
            swfv: asciiz(raw.swfv, "SWFV", base + 238)?,
            build_type: asciiz(raw.build_type, "build type", base + 288)?,
            android_ver: asciiz(raw.android_ver, "Android version", base + 312)?,
            memory_size: asciiz(raw.memory_size, "memory size", base + 322)?,
            signed_security: asciiz(raw.signed_security, "signed security", base + 333)?,
            is_ufs: raw.is_ufs != 0,
            anti_rollback_ver: raw.anti_rollback_ver,
            supported_mem: asciiz(raw.supported_mem, "supported memories", base + 345)?,
            target_product: asciiz(raw.target_product, "target product", base + 409)?,
            operator_code: asciiz(raw.operator_code, "operator code", base + 440)?
                .split('.')
                .map(str::to_owned)
                .collect(),
            multi_panel_mask: raw.multi_panel_mask,
            product_fuse_id: raw.product_fuse_id,
            is_factory_image: raw.is_factory_image == b'F',
            chunk_hdrs_hash,
            data_hash: stored_data_hash,
            header_crc: raw.header_crc,
            parts: Vec::new(),
        };

        let part_count = raw.part_count as usize;
        header.parts = if header.minor == 0 {
            Self::parse_v0_records(data, base, part_count, &mut data_hash_ctx, &chunk_hdrs_hash,
                verify, &mut warnings)?
        } else {
            Self::parse_v1_records(data, base, part_count, &mut data_hash_ctx, &chunk_hdrs_hash,
                verify, &mut warnings)?
        };

        if let Some(ctx) = data_hash_ctx {
            let computed = ctx.compute().0;
            if computed != stored_data_hash {
                integrity(
                    IntegrityError::DataHashMismatch { stored: stored_data_hash, computed },
                    verify.lenient,
                    &mut warnings,
                )?;
            }
        }

        Ok((header, warnings))
    }

    /// Bounds-check one chunk's compressed data and feed it to the
    /// end-to-end hash in bounded reads. Returns the offset just past it.
    fn consume_chunk_data(
        data: &[u8],
        offset: u64,
        file_size: u32,
        data_hash_ctx: &mut Option<md5::Context>,
    ) -> Result<u64, FormatError> {
        let bytes = window(data, offset, file_size as usize, "chunk data")?;
        if let Some(ctx) = data_hash_ctx {
            for block in bytes.chunks(READ_CHUNK_SIZE) {
                ctx.consume(block);
            }
        }
        Ok(offset + u64::from(file_size))
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_v0_records(
        data: &[u8],
        base: u64,
        part_count: usize,
        data_hash_ctx: &mut Option<md5::Context>,
        stored_record_hash: &[u8; 16],
        verify: Verify,
        warnings: &mut Vec<IntegrityError>,
    ) -> Result<Vec<LogicalPartition>, KdzError> {
        let mut parts = Vec::new();
        let mut record_hash = md5::Context::new();
        let mut pos = base + DZ_HDR_SIZE as u64;

        for _ in 0..part_count {
            let rec = window(data, pos, V0_RECORD_SIZE, "segment record")?;
            let (_, (magic, raw_part_name, raw_chunk_name, data_size, file_size, raw_hash)) =
                raw_v0_record(rec).map_err(|_| FormatError::Truncated {
                    what: "segment record",
                    offset: pos,
                    need: V0_RECORD_SIZE,
                    have: rec.len(),
                })?;
            record_hash.consume(rec);
            if let Some(ctx) = data_hash_ctx {
                ctx.consume(rec);
            }

            Self::check_record(magic, data_size, file_size, pos)?;
            let part_name = asciiz(raw_part_name, "partition name", pos + 4)?;
            let chunk_name = asciiz(raw_chunk_name, "chunk name", pos + 36)?;
            let mut hash = [0u8; 16];
            hash.copy_from_slice(raw_hash);

            let data_offset = pos + V0_RECORD_SIZE as u64;
            let chunk = Chunk {
                name: chunk_name,
                data_size,
                file_offset: data_offset,
                file_size,
                hash,
                crc: 0,
                start_sector: 0,
                sector_count: 0,
                part_start_sector: 0,
                unique_part_id: 0,
                is_sparse: false,
                is_ubi_image: false,
            };
            push_chunk(&mut parts, HW_PARTITION_NONE, &part_name, chunk, pos)?;
            pos = Self::consume_chunk_data(data, data_offset, file_size, data_hash_ctx)?;
        }

        let computed = record_hash.compute().0;
        if computed != *stored_record_hash {
            integrity(
                IntegrityError::RecordTableHashMismatch {
                    stored: *stored_record_hash,
                    computed,
                },
                verify.lenient,
                warnings,
            )?;
        }
        Ok(parts)
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_v1_records(
        data: &[u8],
        base: u64,
        part_count: usize,
        data_hash_ctx: &mut Option<md5::Context>,
        stored_record_hash: &[u8; 16],
        verify: Verify,
        warnings: &mut Vec<IntegrityError>,
    ) -> Result<Vec<LogicalPartition>, KdzError> {
        let mut parts: Vec<LogicalPartition> = Vec::new();
        let mut record_hash = md5::Context::new();
        let mut tracker = SectorTracker::default();
        let mut pos = base + DZ_HDR_SIZE as u64;

        for index in 0..part_count {
            let rec = window(data, pos, V1_RECORD_SIZE, "segment record")?;
            let (_, (magic, raw_part_name, raw_chunk_name, data_size, file_size, raw_hash,
                words, padding)) =
                raw_v1_record(rec).map_err(|_| FormatError::Truncated {
                    what: "segment record",
                    offset: pos,
                    need: V1_RECORD_SIZE,
                    have: rec.len(),
                })?;
            record_hash.consume(rec);
            if let Some(ctx) = data_hash_ctx {
                ctx.consume(rec);
            }

            Self::check_record(magic, data_size, file_size, pos)?;
            ensure_zero(padding, "segment record", pos + 156)?;
            let [start_sector, sector_count, hw_partition, crc, unique_part_id, is_sparse,
                is_ubi_image, hint] = words;
            let part_name = asciiz(raw_part_name, "partition name", pos + 4)?;
            let chunk_name = asciiz(raw_chunk_name, "chunk name", pos + 36)?;
            let mut hash = [0u8; 16];
            hash.copy_from_slice(raw_hash);

            if !parts.iter().any(|p| p.hw_part == hw_partition) {
                tracker.enter_hw_partition(hint, start_sector);
            } else if !parts
                .iter()
                .any(|p| p.hw_part == hw_partition && p.name == part_name)
            {
                tracker.enter_part(hint, start_sector);
            }
            let part_start_sector =
                tracker.commit(index, start_sector, sector_count, hint, pos + 124)?;

            let data_offset = pos + V1_RECORD_SIZE as u64;
            let chunk = Chunk {
                name: chunk_name,
                data_size,
                file_offset: data_offset,
                file_size,
                hash,
                crc,
                start_sector,
                sector_count,
                part_start_sector,
                unique_part_id,
                is_sparse: is_sparse != 0,
                is_ubi_image: is_ubi_image != 0,
            };
            push_chunk(&mut parts, hw_partition, &part_name, chunk, pos)?;
            pos = Self::consume_chunk_data(data, data_offset, file_size, data_hash_ctx)?;
        }

        let computed = record_hash.compute().0;
        if computed != *stored_record_hash {
            integrity(
                IntegrityError::RecordTableHashMismatch {
                    stored: *stored_record_hash,
                    computed,
                },
                verify.lenient,
                warnings,
            )?;
        }
        Ok(parts)
    }

    fn check_record(magic: u32, data_size: u32, file_size: u32, pos: u64) -> Result<(), FormatError> {
        if magic != CHUNK_MAGIC {
            return Err(FormatError::BadMagic {
                what: "segment record",
                offset: pos,
                expected: CHUNK_MAGIC,
                found: magic,
            });
        }
        if data_size == 0 {
            return Err(FormatError::InvalidField {
                field: "data size",
                offset: pos + 100,
                value: 0,
            });
        }
        if file_size == 0 {
            return Err(FormatError::InvalidField {
                field: "file size",
                offset: pos + 104,
                value: 0,
            });
        }
        Ok(())
    }

    /// Total number of chunks across all logical partitions.
    pub fn chunk_count(&self) -> usize {
        self.parts.iter().map(|p| p.chunks.len()).sum()
    }
}
