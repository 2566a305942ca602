//! Test-only builders for synthetic DZ segment tables. Fixtures are
//! assembled with the same hash and codec crates the decoder verifies
//! with, so the integrity surfaces hold by construction.

use std::io::Write;

use crate::dz::{CHUNK_MAGIC, DZ_HDR_SIZE, DZ_MAGIC, V0_RECORD_SIZE, V1_RECORD_SIZE};

pub(crate) struct ChunkSpec {
    pub part: &'static str,
    pub name: &'static str,
    /// Uncompressed chunk payload.
    pub data: Vec<u8>,
    pub start_sector: u32,
    pub sector_count: u32,
    pub hw_partition: u32,
    pub hint: u32,
}

impl ChunkSpec {
    pub fn new(part: &'static str, name: &'static str, data: Vec<u8>) -> Self {
        ChunkSpec {
            part,
            name,
            data,
            start_sector: 0,
            sector_count: 0,
            hw_partition: 0,
            hint: 0,
        }
    }

    pub fn at(mut self, start_sector: u32, sector_count: u32) -> Self {
        self.start_sector = start_sector;
        self.sector_count = sector_count;
        self
    }

    pub fn on_hw(mut self, hw_partition: u32) -> Self {
        self.hw_partition = hw_partition;
        self
    }

    pub fn hinted(mut self, hint: u32) -> Self {
        self.hint = hint;
        self
    }
}

pub(crate) struct DzSpec {
    pub minor: u32,
    /// Raw 9-byte compression field.
    pub compression: [u8; 9],
    /// Emit a valid non-zero header CRC.
    pub header_crc: bool,
    /// Emit a valid end-to-end data hash instead of the absent sentinel.
    pub data_hash: bool,
    pub chunks: Vec<ChunkSpec>,
}

impl DzSpec {
    pub fn v1(chunks: Vec<ChunkSpec>) -> Self {
        DzSpec {
            minor: 1,
            compression: *b"zlib\0\0\0\0\0",
            header_crc: true,
            data_hash: true,
            chunks,
        }
    }

    pub fn v0(chunks: Vec<ChunkSpec>) -> Self {
        DzSpec { minor: 0, ..Self::v1(chunks) }
    }
}

pub(crate) fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub(crate) fn zstd_compress(data: &[u8]) -> Vec<u8> {
    zstd::encode_all(data, 0).unwrap()
}

fn compress_for(spec: &DzSpec, data: &[u8]) -> Vec<u8> {
    if spec.compression[1] != 0 {
        let tag = &spec.compression[..4];
        if tag.eq_ignore_ascii_case(b"zstd") {
            zstd_compress(data)
        } else {
            assert!(tag.eq_ignore_ascii_case(b"zlib"), "fixture compression {tag:?}");
            zlib_compress(data)
        }
    } else if spec.compression[0] == 4 {
        zstd_compress(data)
    } else {
        zlib_compress(data)
    }
}

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn build_record(spec: &DzSpec, chunk: &ChunkSpec, compressed: &[u8]) -> Vec<u8> {
    let size = if spec.minor == 0 { V0_RECORD_SIZE } else { V1_RECORD_SIZE };
    let mut rec = vec![0u8; size];
    put(&mut rec, 0, &CHUNK_MAGIC.to_le_bytes());
    put(&mut rec, 4, chunk.part.as_bytes());
    put(&mut rec, 36, chunk.name.as_bytes());
    put(&mut rec, 100, &(chunk.data.len() as u32).to_le_bytes());
    put(&mut rec, 104, &(compressed.len() as u32).to_le_bytes());
    put(&mut rec, 108, &md5::compute(compressed).0);
    if spec.minor == 1 {
        let mut crc = crc32fast::Hasher::new();
        crc.update(compressed);
        put(&mut rec, 124, &chunk.start_sector.to_le_bytes());
        put(&mut rec, 128, &chunk.sector_count.to_le_bytes());
        put(&mut rec, 132, &chunk.hw_partition.to_le_bytes());
        put(&mut rec, 136, &crc.finalize().to_le_bytes());
        put(&mut rec, 140, &1u32.to_le_bytes()); // unique part id
        put(&mut rec, 152, &chunk.hint.to_le_bytes());
    }
    rec
}

/// Build a complete DZ blob (header + records + chunk data) from a spec.
pub(crate) fn build_dz(spec: &DzSpec) -> Vec<u8> {
    let mut records = md5::Context::new();
    let mut body = Vec::new();
    for chunk in &spec.chunks {
        let compressed = compress_for(spec, &chunk.data);
        let rec = build_record(spec, chunk, &compressed);
        records.consume(&rec);
        body.extend_from_slice(&rec);
        body.extend_from_slice(&compressed);
    }

    let mut hdr = vec![0u8; DZ_HDR_SIZE];
    put(&mut hdr, 0, &DZ_MAGIC.to_le_bytes());
    put(&mut hdr, 4, &2u32.to_le_bytes()); // major
    put(&mut hdr, 8, &spec.minor.to_le_bytes());
    put(&mut hdr, 16, b"TESTMODEL");
    put(&mut hdr, 48, b"T99910a_00");
    // Build date: 2024-02-19 (a Monday), 12:30:05.250.
    for (i, word) in [2024u16, 2, 0, 19, 12, 30, 5, 250].iter().enumerate() {
        put(&mut hdr, 176 + i * 2, &word.to_le_bytes());
    }
    put(&mut hdr, 192, &(spec.chunks.len() as u32).to_le_bytes());
    put(&mut hdr, 196, &records.compute().0);
    put(&mut hdr, 213, &spec.compression);
    put(&mut hdr, 222, &[0xff; 16]);
    put(&mut hdr, 238, b"T99910a_00_NA");
    put(&mut hdr, 288, b"user");
    put(&mut hdr, 312, b"13");
    put(&mut hdr, 322, b"128GB");
    put(&mut hdr, 333, b"N");
    put(&mut hdr, 337, &1u32.to_le_bytes()); // is_ufs
    put(&mut hdr, 345, b"UFS");
    put(&mut hdr, 409, b"TESTPRODUCT");
    put(&mut hdr, 440, b"GLOBAL.COM");

    if spec.header_crc {
        let mut patched = hdr.clone();
        patched[222..238].fill(0);
        // CRC field is still zero at this point.
        let mut crc = crc32fast::Hasher::new();
        crc.update(&patched);
        put(&mut hdr, 308, &crc.finalize().to_le_bytes());
    }

    if spec.data_hash {
        // Seed: header with the data-hash field 0xFF and the CRC stored.
        let mut ctx = md5::Context::new();
        ctx.consume(&hdr);
        ctx.consume(&body);
        put(&mut hdr, 222, &ctx.compute().0);
    }

    hdr.extend_from_slice(&body);
    hdr
}

/// Wrap a DZ blob so it can be fed to `DzHeader::parse` directly.
pub(crate) fn dz_record(blob: &[u8]) -> crate::kdz::Record {
    crate::kdz::Record {
        name: "image.dz".into(),
        size: blob.len() as u64,
        offset: 0,
    }
}
