use std::error::Error as _;
use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueHint};
use console::Style;
use indicatif::HumanBytes;
use memmap2::Mmap;

use crate::dz::{DzHeader, Verify};
use crate::error::{FormatError, IntegrityError, KdzError};
use crate::extract::{ExtractOptions, extract_partitions};
use crate::kdz::{AuxRecord, KdzHeader, KdzVersion};
use crate::secure::SecurePartition;

#[derive(Debug, Parser)]
#[clap(
    about,
    disable_help_subcommand = true,
    help_template = FRIENDLY_HELP,
    propagate_version = true,
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cmd {
    /// KDZ firmware file to read.
    #[clap(value_hint = ValueHint::FilePath, value_name = "PATH")]
    kdz: PathBuf,

    /// Extract partition images into this directory (created if absent).
    /// Without it, the partition listing is printed.
    #[clap(long, short = 'e', value_hint = ValueHint::DirPath, value_name = "DIR")]
    extract_to: Option<PathBuf>,

    /// Dump every decoded header field for inspection
    #[clap(long, short, conflicts_with = "extract_to")]
    dump: bool,

    /// Extract only the selected logical partitions (comma-separated)
    #[clap(long, value_delimiter = ',', value_name = "PARTITIONS")]
    partitions: Vec<String>,

    /// Verify the end-to-end data hash while decoding the segment table
    #[clap(
        long,
        help = "Verify the end-to-end data hash while decoding. Reads every chunk byte up front, so it is slower, but corruption is caught before extraction begins."
    )]
    full_verify: bool,

    /// Downgrade checksum/hash mismatches to warnings (dangerous!)
    #[clap(long)]
    lenient: bool,

    /// Compute and print SHA-256 of each extracted partition image
    #[clap(
        long,
        help = "Compute and print the SHA-256 of each extracted partition image, hashed inline while writing."
    )]
    print_hash: bool,

    /// Number of threads to use during extraction
    #[clap(long, short, value_name = "NUMBER")]
    threads: Option<usize>,
}

pub enum KdzSource {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

// The Deref trait allows KdzSource to be treated like a byte slice `&[u8]`,
// making its use seamless with the parsing logic.
impl Deref for KdzSource {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            KdzSource::Mapped(mmap) => mmap,
            KdzSource::Owned(vec) => vec,
        }
    }
}

impl Cmd {
    pub fn run(&self) -> Result<()> {
        if let Some(t) = self.threads {
            match t {
                0 => { /* Use default - valid */ }
                1..=256 => { /* Valid range */ }
                _ => {
                    bail!(
                        "Thread count must be between 1 and 256, got {}. \
                        Use 0 or omit -t to use all available CPU cores (recommended).",
                        t
                    );
                }
            }
        }

        let source = self.open_kdz_file(&self.kdz)?;
        let data: &[u8] = &source;

        let kdz = KdzHeader::parse(data)
            .map_err(KdzError::from)
            .context("unable to parse KDZ header")?;

        let secure = match SecurePartition::parse(data) {
            Ok(secure) => Some(secure),
            Err(FormatError::NoSecurePartition { .. }) => None,
            Err(e) => {
                return Err(KdzError::from(e)).context("unable to parse secure partition table");
            }
        };

        let dz_record = kdz.dz_record().context("no DZ record in KDZ file")?;
        let verify = Verify { full: self.full_verify, lenient: self.lenient };
        let (dz, warnings) = DzHeader::parse(data, dz_record, verify)
            .context("unable to parse DZ segment table")?;
        self.report_warnings(&warnings);

        if self.dump {
            dump_kdz(&kdz, data);
            dump_secure(secure.as_ref());
            dump_dz(&dz);
            return Ok(());
        }

        if let Some(dir) = &self.extract_to {
            self.extract(data, &dz, dir)
        } else {
            self.list(&dz);
            Ok(())
        }
    }

    fn open_kdz_file(&self, path: &Path) -> Result<KdzSource> {
        let mut file = File::open(path)
            .with_context(|| format!("unable to open file for reading: {path:?}"))?;

        // Memory-map when possible; fall back to reading the whole file
        // (pipes, filesystems without mmap support).
        match unsafe { Mmap::map(&file) } {
            Ok(mmap) => Ok(KdzSource::Mapped(mmap)),
            Err(_) => {
                let mut buffer = Vec::new();
                file.read_to_end(&mut buffer)
                    .with_context(|| format!("unable to read file: {path:?}"))?;
                Ok(KdzSource::Owned(buffer))
            }
        }
    }

    fn report_warnings(&self, warnings: &[IntegrityError]) {
        let bold_yellow = Style::new().bold().yellow();
        for warning in warnings {
            eprintln!("{}: {warning}", bold_yellow.apply_to("WARNING"));
        }
    }

    fn list(&self, dz: &DzHeader) {
        let bold_green = Style::new().bold().green();
        for part in &dz.parts {
            println!(
                "{}.{} ({}, {} chunk{})",
                part.hw_part,
                bold_green.apply_to(&part.name),
                HumanBytes(part.image_size()),
                part.chunks.len(),
                if part.chunks.len() == 1 { "" } else { "s" },
            );
        }
    }

    fn extract(&self, data: &[u8], dz: &DzHeader, dir: &Path) -> Result<()> {
        for partition in &self.partitions {
            if !dz.parts.iter().any(|p| &p.name == partition) {
                bail!("partition \"{}\" not found in segment table", partition);
            }
        }

        let opts = ExtractOptions {
            partitions: self.partitions.clone(),
            print_hash: self.print_hash,
            threads: self.threads,
        };
        let summary = extract_partitions(data, dz, dir, &opts)?;

        let total: u64 = summary.written.iter().map(|r| r.bytes_written).sum();
        println!(
            "\nExtracted {} partition(s), {} total, to {}",
            summary.written.len(),
            HumanBytes(total),
            dir.display()
        );
        if self.print_hash && !summary.written.is_empty() {
            println!("Partition hashes (SHA-256):");
            for report in &summary.written {
                if let Some(hash) = &report.sha256 {
                    println!("{}.{}: sha256={}", report.hw_part, report.name, hash);
                }
            }
        }

        if !summary.failures.is_empty() {
            let bold_red = Style::new().bold().red();
            for failure in &summary.failures {
                match failure.error.source() {
                    Some(source) => eprintln!(
                        "{}: {}: {}",
                        bold_red.apply_to("ERROR"),
                        failure.error,
                        source
                    ),
                    None => eprintln!("{}: {}", bold_red.apply_to("ERROR"), failure.error),
                }
            }
            bail!(
                "{} partition(s) failed to extract; their partial images were left on disk and must not be flashed",
                summary.failures.len()
            );
        }
        Ok(())
    }
}

/// Render a v3 auxiliary map region as trimmed text for the field dump.
fn aux_text(data: &[u8], aux: &AuxRecord) -> String {
    let start = aux.offset as usize;
    match data.get(start..start + aux.size as usize) {
        Some(raw) => {
            let end = raw.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
            String::from_utf8_lossy(&raw[..end]).into_owned()
        }
        None => "<out of range>".into(),
    }
}

fn dump_kdz(kdz: &KdzHeader, data: &[u8]) {
    println!("KDZ Header");
    println!("==========");
    let version = match kdz.version {
        KdzVersion::V1 => 1,
        KdzVersion::V2 => 2,
        KdzVersion::V3 => 3,
    };
    println!("version = {}, magic = {:#010x}, size = {}", version, kdz.magic, kdz.size);
    println!("records = {}", kdz.records.len());
    for record in &kdz.records {
        println!("  {} (size={}, offset={:#x})", record.name, record.size, record.offset);
    }
    if kdz.version == KdzVersion::V3 {
        println!("tag = {}", kdz.tag);
        println!("ftm_model_name = {}", kdz.ftm_model_name);
        println!(
            "extended_mem_id = offset {:#x}, size {}",
            kdz.extended_mem_id.offset, kdz.extended_mem_id.size
        );
        println!("  data = {:?}", aux_text(data, &kdz.extended_mem_id));
        println!("additional_records_size = {}", kdz.additional_records_size);
        for (name, aux) in [
            ("suffix_map", &kdz.suffix_map),
            ("sku_map", &kdz.sku_map),
            ("extended_sku_map", &kdz.extended_sku_map),
        ] {
            println!("  {} = offset {:#x}, size {}", name, aux.offset, aux.size);
            if !aux.is_empty() {
                println!("    data = {:?}", aux_text(data, aux));
            }
        }
    }
    println!();
}

fn dump_secure(secure: Option<&SecurePartition>) {
    match secure {
        None => println!("No secure partition found"),
        Some(secure) => {
            println!("Secure Partition");
            println!("================");
            println!("flags = {:#x}", secure.flags);
            println!("signature = {}", hex::encode(&secure.signature));
            println!("parts = {}", secure.part_count());
            for group in &secure.groups {
                for part in &group.entries {
                    println!(
                        "  {}.{}: sectors {}..{} ({} data), hash {}",
                        part.hw_part,
                        part.name,
                        part.start_sect,
                        part.end_sect,
                        part.data_sect_cnt,
                        hex::encode(part.hash),
                    );
                }
            }
        }
    }
    println!();
}

fn dump_dz(dz: &DzHeader) {
    println!("DZ header");
    println!("=========");
    println!("version = {}.{}", dz.major, dz.minor);
    println!("model_name = {}", dz.model_name);
    println!("sw_version = {}", dz.sw_version);
    match dz.build_date {
        Some(stamp) => println!("build date = {stamp}"),
        None => println!("build date = <none>"),
    }
    println!("compression = {}", dz.compression);
    println!("secure_image_type = {}", dz.secure_image_type);
    println!("swfv = {}", dz.swfv);
    println!("build_type = {}", dz.build_type);
    println!("android_ver = {}", dz.android_ver);
    println!("memory_size = {}", dz.memory_size);
    println!("signed_security = {}", dz.signed_security);
    println!("is_ufs = {}", dz.is_ufs);
    println!("anti_rollback_ver = {:#x}", dz.anti_rollback_ver);
    println!("supported_mem = {}", dz.supported_mem);
    println!("target_product = {}", dz.target_product);
    println!("operator_code = {}", dz.operator_code.join("."));
    println!("multi_panel_mask = {:#x}", dz.multi_panel_mask);
    println!("product_fuse_id = {}", dz.product_fuse_id);
    println!("is_factory_image = {}", dz.is_factory_image);
    println!("chunk_hdrs_hash = {}", hex::encode(dz.chunk_hdrs_hash));
    println!("data_hash = {}", hex::encode(dz.data_hash));
    println!("header_crc = {:#010x}", dz.header_crc);
    println!("segments = {}", dz.chunk_count());
    println!();
    for part in &dz.parts {
        println!("Partition {}.{}:", part.hw_part, part.name);
        for (i, chunk) in part.chunks.iter().enumerate() {
            println!(
                "  {}. {} ({} bytes, sectors {}+{}, base {}, sparse: {})",
                i,
                chunk.name,
                u64::from(chunk.data_size).max(u64::from(chunk.sector_count) * 4096),
                chunk.start_sector,
                chunk.sector_count,
                chunk.part_start_sector,
                chunk.is_sparse,
            );
        }
        println!();
    }
}

// Friendlier, task-oriented help template shown for -h/--help
const FRIENDLY_HELP: &str = color_print::cstr!(
    "\
{before-help}<bold><underline>{name} {version}</underline></bold>
{about}

Quick start:
  - List the partitions inside a firmware file:
    kdzripper firmware.kdz
  - Extract everything:
    kdzripper firmware.kdz -e out

Common tasks:
  - Extract specific partition(s):
    kdzripper firmware.kdz -e out --partitions boot,modem
  - Dump every decoded header field:
    kdzripper firmware.kdz --dump
  - End-to-end data hash verification:
    kdzripper firmware.kdz -e out --full-verify

Safety and integrity:
  - The header CRC and segment record hash are always verified.
  - Use --lenient to turn mismatches into warnings; do NOT flash such images.
  - A failed partition leaves its partial image on disk; it is not trustworthy.

{usage-heading}
{usage}

Options:
{all-args}
{after-help}"
);
