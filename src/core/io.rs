use crate::core::error::{Error, Result};
use flate2::read::MultiGzDecoder;
use gzp::deflate::{Bgzf, Mgzip};
use gzp::par::decompress::ParDecompressBuilder;
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

const MMAP_CHUNK: usize = 8 * 1024 * 1024;
const GZIP_CHUNK: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Fasta,
    Fastq,
}

pub struct MmapSource {
    mmap: Mmap,
}

impl MmapSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        // SAFETY: read-only file mapping.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
        Ok(Self { mmap })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }
}

pub struct MmapReader {
    source: MmapSource,
    pos: usize,
}

pub struct GzipReader {
    path: PathBuf,
    decoder: Box<dyn Read + Send>,
    scratch: Vec<u8>,
    filled: usize,
    primed: bool,
}

impl GzipReader {
    fn fill(&mut self) -> Result<usize> {
        let n = self
            .decoder
            .read(&mut self.scratch)
            .map_err(|e| Error::io(&self.path, e))?;
        self.filled = n;
        Ok(n)
    }
}

// Sequential raw-byte source over one input file. Plain files hand out
// zero-copy windows of the mapping; gzip files decompress into a reused
// scratch buffer.
pub enum InputReader {
    Mmap(MmapReader),
    Gzip(GzipReader),
}

impl InputReader {
    pub fn open(path: &Path, threads: usize) -> Result<(Self, Format)> {
        let len = std::fs::metadata(path)
            .map_err(|e| Error::io(path, e))?
            .len();
        if len == 0 {
            return Err(Error::file_parser(path, "empty input"));
        }
        match detect_input_kind(path)? {
            InputKind::Plain => {
                let source = MmapSource::open(path)?;
                let format = sniff_format(path, source.bytes())?;
                Ok((InputReader::Mmap(MmapReader { source, pos: 0 }), format))
            }
            InputKind::Gzip => {
                let decoder = open_gzip_reader(path, threads)?;
                let mut reader = GzipReader {
                    path: path.to_path_buf(),
                    decoder,
                    scratch: vec![0u8; GZIP_CHUNK],
                    filled: 0,
                    primed: false,
                };
                reader.fill()?;
                reader.primed = true;
                let format = sniff_format(path, &reader.scratch[..reader.filled])?;
                Ok((InputReader::Gzip(reader), format))
            }
        }
    }

    pub fn next_chunk(&mut self) -> Result<Option<&[u8]>> {
        match self {
            InputReader::Mmap(r) => {
                if r.pos >= r.source.len() {
                    return Ok(None);
                }
                let start = r.pos;
                let end = (start + MMAP_CHUNK).min(r.source.len());
                r.pos = end;
                Ok(Some(&r.source.bytes()[start..end]))
            }
            InputReader::Gzip(r) => {
                if r.primed {
                    r.primed = false;
                } else {
                    r.fill()?;
                }
                if r.filled == 0 {
                    Ok(None)
                } else {
                    Ok(Some(&r.scratch[..r.filled]))
                }
            }
        }
    }
}

fn sniff_format(path: &Path, head: &[u8]) -> Result<Format> {
    for &b in head {
        if b.is_ascii_whitespace() {
            continue;
        }
        return match b {
            b'>' => Ok(Format::Fasta),
            b'@' => Ok(Format::Fastq),
            _ => Err(Error::file_parser(
                path,
                format!("unrecognized leading byte 0x{:02x}", b),
            )),
        };
    }
    Err(Error::file_parser(path, "empty input"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum InputKind {
    Plain,
    Gzip,
}

fn detect_input_kind(path: &Path) -> Result<InputKind> {
    if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
        if ext.eq_ignore_ascii_case("gz") {
            return Ok(InputKind::Gzip);
        }
    }
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic).map_err(|e| Error::io(path, e))?;
    if n == 2 && magic == [0x1f, 0x8b] {
        Ok(InputKind::Gzip)
    } else {
        Ok(InputKind::Plain)
    }
}

#[derive(Clone, Copy, Debug)]
enum GzipVariant {
    Standard,
    Mgzip,
    Bgzf,
}

fn detect_gzip_variant(path: &Path) -> Result<GzipVariant> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut header = [0u8; 20];
    let n = file.read(&mut header).map_err(|e| Error::io(path, e))?;
    if n < 14 || header[0] != 0x1f || header[1] != 0x8b || header[3] & 4 == 0 {
        return Ok(GzipVariant::Standard);
    }
    if header[12] == b'B' && header[13] == b'C' {
        return Ok(GzipVariant::Bgzf);
    }
    if header[12] == b'I' && header[13] == b'G' {
        return Ok(GzipVariant::Mgzip);
    }
    Ok(GzipVariant::Standard)
}

fn open_gzip_reader(path: &Path, threads: usize) -> Result<Box<dyn Read + Send>> {
    let variant = detect_gzip_variant(path)?;
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let reader = BufReader::new(file);
    let reader: Box<dyn Read + Send> = match variant {
        GzipVariant::Bgzf => {
            if threads > 1 {
                Box::new(
                    ParDecompressBuilder::<Bgzf>::new()
                        .num_threads(threads)
                        .unwrap()
                        .from_reader(reader),
                )
            } else {
                Box::new(MultiGzDecoder::new(reader))
            }
        }
        GzipVariant::Mgzip => {
            if threads > 1 {
                Box::new(
                    ParDecompressBuilder::<Mgzip>::new()
                        .num_threads(threads)
                        .unwrap()
                        .from_reader(reader),
                )
            } else {
                Box::new(MultiGzDecoder::new(reader))
            }
        }
        GzipVariant::Standard => Box::new(MultiGzDecoder::new(reader)),
    };
    Ok(reader)
}
