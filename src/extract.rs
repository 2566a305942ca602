use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crossbeam_channel::unbounded;
use flate2::read::ZlibDecoder;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressFinish, ProgressStyle};
use rayon::ThreadPoolBuilder;
use sha2::{Digest, Sha256};

use crate::dz::{Compression, DzHeader, LogicalPartition, READ_CHUNK_SIZE};
use crate::error::{DataError, KdzError};

/// Fixed addressing unit for all sector arithmetic.
pub const SECTOR_SIZE: u64 = 4096;

const PROGRESS_UPDATE_FREQUENCY_HIGH: u8 = 2; // Hz when partition count <= 32
const PROGRESS_UPDATE_FREQUENCY_LOW: u8 = 1;

static ZERO_FILL: [u8; 64 * 1024] = [0; 64 * 1024];

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Only reconstruct these logical partition names; empty means all.
    pub partitions: Vec<String>,
    /// Compute and report the SHA-256 of every written image.
    pub print_hash: bool,
    /// Worker thread count; `None`/0 uses all cores.
    pub threads: Option<usize>,
}

/// One successfully reconstructed partition image.
#[derive(Debug, Clone)]
pub struct PartitionReport {
    pub hw_part: u32,
    pub name: String,
    pub path: PathBuf,
    pub bytes_written: u64,
    pub sha256: Option<String>,
}

/// One partition whose reconstruction failed. Its partial image stays on
/// disk and must be treated as untrustworthy.
#[derive(Debug)]
pub struct PartitionFailure {
    pub hw_part: u32,
    pub name: String,
    pub error: DataError,
}

#[derive(Debug, Default)]
pub struct ExtractSummary {
    pub written: Vec<PartitionReport>,
    pub failures: Vec<PartitionFailure>,
}

impl Compression {
    /// Acquire a fresh streaming decompressor over one chunk's compressed
    /// bytes. Instances are scoped to a single chunk and never reused.
    fn decompressor<'a>(self, src: &'a [u8]) -> io::Result<Box<dyn Read + 'a>> {
        match self {
            Compression::Zlib => Ok(Box::new(ZlibDecoder::new(src))),
            Compression::Zstd => Ok(Box::new(zstd::stream::read::Decoder::with_buffer(src)?)),
        }
    }
}

/// Reconstruct every (filtered) logical partition into `out_dir`, one
/// `{hw}.{name}.img` per partition.
///
/// Partitions are independent: each worker holds its own read view into
/// the mapped container, and a decompression failure poisons only its own
/// partition. The summary carries both outcomes; callers decide whether a
/// non-empty failure list is fatal.
pub fn extract_partitions(
    data: &[u8],
    dz: &DzHeader,
    out_dir: &Path,
    opts: &ExtractOptions,
) -> Result<ExtractSummary, KdzError> {
    fs::create_dir_all(out_dir).map_err(DataError::Io)?;

    let selected: Vec<&LogicalPartition> = dz
        .parts
        .iter()
        .filter(|p| opts.partitions.is_empty() || opts.partitions.contains(&p.name))
        .collect();

    let mut builder = ThreadPoolBuilder::new();
    if let Some(t) = opts.threads {
        if t > 0 {
            builder = builder.num_threads(t);
        }
    }
    let pool = builder.build().map_err(|e| {
        DataError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
    })?;

    let multiprogress = {
        // A fixed redraw frequency keeps many bars from flickering.
        let hz = if selected.len() > 32 {
            PROGRESS_UPDATE_FREQUENCY_LOW
        } else {
            PROGRESS_UPDATE_FREQUENCY_HIGH
        };
        MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(hz))
    };

    let (sender, receiver) = unbounded();
    pool.scope(|scope| {
        for (order, group) in selected.into_iter().enumerate() {
            let sender = sender.clone();
            let progress_bar = multiprogress.add(create_progress_bar(group));
            let compression = dz.compression;
            scope.spawn(move |_| {
                let result =
                    extract_group(data, compression, group, out_dir, opts.print_hash, &progress_bar);
                // The receiver outlives the scope; a send failure only
                // means the caller went away.
                let _ = sender.send((order, group, result));
            });
        }
    });
    drop(sender);

    let mut results: Vec<_> = receiver.iter().collect();
    results.sort_by_key(|(order, ..)| *order);

    let mut summary = ExtractSummary::default();
    for (_, group, result) in results {
        match result {
            Ok(report) => summary.written.push(report),
            Err(error) => summary.failures.push(PartitionFailure {
                hw_part: group.hw_part,
                name: group.name.clone(),
                error,
            }),
        }
    }
    Ok(summary)
}

fn create_progress_bar(group: &LogicalPartition) -> ProgressBar {
    let style = ProgressStyle::with_template(
        "{prefix:>16!.green.bold} [{wide_bar:.white.dim}] {percent:>3.white}%",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    ProgressBar::new(group.chunks.len() as u64)
        .with_finish(ProgressFinish::AndLeave)
        .with_prefix(format!("{}.{}", group.hw_part, group.name))
        .with_style(style)
}

struct ImageWriter<W: Write> {
    out: W,
    hasher: Option<Sha256>,
    written: u64,
}

impl<W: Write> ImageWriter<W> {
    fn new(out: W, hash: bool) -> Self {
        ImageWriter { out, hasher: hash.then(Sha256::new), written: 0 }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.out.write_all(buf)?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(buf);
        }
        self.written += buf.len() as u64;
        Ok(())
    }

    fn write_zeros(&mut self, mut len: u64) -> io::Result<()> {
        while len > 0 {
            let step = len.min(ZERO_FILL.len() as u64) as usize;
            self.write(&ZERO_FILL[..step])?;
            len -= step as u64;
        }
        Ok(())
    }

    fn finish(mut self) -> io::Result<(u64, Option<String>)> {
        self.out.flush()?;
        Ok((self.written, self.hasher.take().map(|h| hex::encode(h.finalize()))))
    }
}

/// Reconstruct one logical partition: decompress each chunk at its sector
/// offset, zero-filling declared gaps and the trailing span.
fn extract_group(
    data: &[u8],
    compression: Compression,
    group: &LogicalPartition,
    out_dir: &Path,
    print_hash: bool,
    progress_bar: &ProgressBar,
) -> Result<PartitionReport, DataError> {
    let path = out_dir.join(format!("{}.{}.img", group.hw_part, group.name));
    let file = File::create(&path)?;
    let mut image = ImageWriter::new(BufWriter::new(file), print_hash);

    // The first chunk's partition base anchors the image: everything is
    // written relative to part_start_sector.
    let first = &group.chunks[0];
    let mut cursor = u64::from(first.part_start_sector) * SECTOR_SIZE;

    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    for chunk in &group.chunks {
        let target = u64::from(chunk.start_sector) * SECTOR_SIZE;
        if target > cursor {
            image.write_zeros(target - cursor)?;
            cursor = target;
        }

        let start = chunk.file_offset as usize;
        let src = data
            .get(start..start + chunk.file_size as usize)
            .ok_or_else(|| {
                DataError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("chunk {:?} escapes the container", chunk.name),
                ))
            })?;

        let corrupt = |source: io::Error| DataError::Decompress {
            hw_part: group.hw_part,
            name: group.name.clone(),
            chunk: chunk.name.clone(),
            source,
        };
        let mut decompressor = compression.decompressor(src).map_err(corrupt)?;
        loop {
            let n = decompressor.read(&mut buf).map_err(corrupt)?;
            if n == 0 {
                break;
            }
            image.write(&buf[..n])?;
            cursor += n as u64;
        }
        progress_bar.inc(1);
    }

    // Pad the image out to the declared end of the last chunk.
    let last = &group.chunks[group.chunks.len() - 1];
    let end = (u64::from(last.start_sector) + u64::from(last.sector_count)) * SECTOR_SIZE;
    if end > cursor {
        image.write_zeros(end - cursor)?;
    }

    let (bytes_written, sha256) = image.finish()?;
    Ok(PartitionReport {
        hw_part: group.hw_part,
        name: group.name.clone(),
        path,
        bytes_written,
        sha256,
    })
}
