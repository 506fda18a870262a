use crate::core::compacted::{
    packed_len, read_u32, read_u64, BitPacker, BitUnpacker, CompactedWriter,
};
use crate::core::error::{Error, Result};
use crate::core::hash::CountArray;
use crate::core::model::CounterKind;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

pub const SEGMENT_MAGIC: [u8; 8] = *b"mercseg\0";
pub const SEGMENT_VERSION: u32 = 1;

// magic + version + k + key_bits + value_bits + bucket count
const SEGMENT_HEADER_LEN: u64 = 28;
const RADIX_BITS: u32 = 6;

#[derive(Debug)]
pub struct Segment {
    pub path: PathBuf,
    pub records: u64,
}

// Segment record values must survive a later merge without loss, so counts
// keep a full word regardless of the final output width.
fn segment_value_bits(kind: CounterKind) -> u32 {
    match kind {
        CounterKind::Count => 64,
        CounterKind::Weight => 32,
    }
}

// Drain a quiescent table into one sorted segment file. Shard workers scan
// disjoint slot ranges into per-shard radix buckets keyed by the top bits of
// the key; buckets are then sorted and appended in order, so the segment is
// globally sorted. On failure the partial file is unlinked and the table is
// left untouched.
pub fn spill(array: &CountArray, path: &Path, workers: usize, k: u32) -> Result<Segment> {
    let res = spill_inner(array, path, workers, k);
    if res.is_err() {
        let _ = std::fs::remove_file(path);
    }
    res
}

fn spill_inner(array: &CountArray, path: &Path, workers: usize, k: u32) -> Result<Segment> {
    let size = array.size() as usize;
    let radix_bits = RADIX_BITS.min(array.key_bits());
    let buckets = 1usize << radix_bits;
    let shift = array.key_bits() - radix_bits;
    let shards = workers.max(1).min(size);

    let mut per_shard: Vec<Vec<Vec<(u64, u64)>>> = Vec::with_capacity(shards);
    thread::scope(|s| -> Result<()> {
        let handles: Vec<_> = (0..shards)
            .map(|m| {
                s.spawn(move || {
                    let lo = size * m / shards;
                    let hi = size * (m + 1) / shards;
                    let mut local: Vec<Vec<(u64, u64)>> = vec![Vec::new(); buckets];
                    for (key, val) in array.entries_range(lo, hi) {
                        local[(key >> shift) as usize].push((key, val));
                    }
                    local
                })
            })
            .collect();
        for h in handles {
            per_shard.push(
                h.join()
                    .map_err(|_| Error::Domain("spill worker panicked".into()))?,
            );
        }
        Ok(())
    })?;

    // cooperative per-bucket gather and sort
    let next = AtomicUsize::new(0);
    let value_bits = segment_value_bits(array.counter_kind());
    let key_bits = array.key_bits();
    let mut packed: Vec<(usize, Vec<u8>, u64)> = Vec::with_capacity(buckets);
    thread::scope(|s| -> Result<()> {
        let per_shard = &per_shard;
        let next = &next;
        let handles: Vec<_> = (0..shards)
            .map(|_| {
                s.spawn(move || {
                    let mut out: Vec<(usize, Vec<u8>, u64)> = Vec::new();
                    loop {
                        let b = next.fetch_add(1, Ordering::Relaxed);
                        if b >= buckets {
                            return out;
                        }
                        let mut records: Vec<(u64, u64)> = per_shard
                            .iter()
                            .flat_map(|shard| shard[b].iter().copied())
                            .collect();
                        records.sort_unstable_by_key(|r| r.0);
                        let mut packer = BitPacker::new();
                        for &(key, val) in &records {
                            packer.push(key, key_bits);
                            packer.push(val, value_bits);
                        }
                        out.push((b, packer.finish(), records.len() as u64));
                    }
                })
            })
            .collect();
        for h in handles {
            packed.extend(
                h.join()
                    .map_err(|_| Error::Domain("spill worker panicked".into()))?,
            );
        }
        Ok(())
    })?;
    packed.sort_unstable_by_key(|(b, _, _)| *b);

    let io_err = |e| Error::io(path, e);
    let file = File::create(path).map_err(io_err)?;
    let mut out = BufWriter::new(file);
    out.write_all(&SEGMENT_MAGIC).map_err(io_err)?;
    out.write_all(&SEGMENT_VERSION.to_le_bytes()).map_err(io_err)?;
    out.write_all(&k.to_le_bytes()).map_err(io_err)?;
    out.write_all(&key_bits.to_le_bytes()).map_err(io_err)?;
    out.write_all(&value_bits.to_le_bytes()).map_err(io_err)?;
    out.write_all(&(buckets as u32).to_le_bytes()).map_err(io_err)?;

    let mut index: Vec<(u64, u64)> = Vec::with_capacity(buckets);
    let mut offset = SEGMENT_HEADER_LEN;
    let mut records = 0u64;
    for (_, bytes, count) in &packed {
        index.push((offset, *count));
        out.write_all(bytes).map_err(io_err)?;
        offset += bytes.len() as u64;
        records += count;
    }
    let index_pos = offset;
    for &(off, count) in &index {
        out.write_all(&off.to_le_bytes()).map_err(io_err)?;
        out.write_all(&count.to_le_bytes()).map_err(io_err)?;
    }
    out.write_all(&index_pos.to_le_bytes()).map_err(io_err)?;
    out.flush().map_err(io_err)?;

    Ok(Segment {
        path: path.to_path_buf(),
        records,
    })
}

pub struct SegmentReader {
    path: PathBuf,
    input: BufReader<File>,
    key_bits: u32,
    value_bits: u32,
    index: Vec<(u64, u64)>,
    bucket: usize,
    current: std::vec::IntoIter<(u64, u64)>,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut input = BufReader::new(file);
        let mut magic = [0u8; 8];
        input
            .read_exact(&mut magic)
            .map_err(|e| Error::io(path, e))?;
        if magic != SEGMENT_MAGIC {
            return Err(Error::file_parser(path, "bad segment magic"));
        }
        let version = read_u32(&mut input, path)?;
        if version != SEGMENT_VERSION {
            return Err(Error::file_parser(
                path,
                format!("unsupported segment version {}", version),
            ));
        }
        let _k = read_u32(&mut input, path)?;
        let key_bits = read_u32(&mut input, path)?;
        let value_bits = read_u32(&mut input, path)?;
        let buckets = read_u32(&mut input, path)? as usize;
        if key_bits == 0 || key_bits > 64 || value_bits == 0 || value_bits > 64 {
            return Err(Error::file_parser(path, "corrupt segment header"));
        }

        input
            .seek(SeekFrom::End(-8))
            .map_err(|e| Error::io(path, e))?;
        let index_pos = read_u64(&mut input, path)?;
        input
            .seek(SeekFrom::Start(index_pos))
            .map_err(|e| Error::io(path, e))?;
        let mut index = Vec::with_capacity(buckets);
        for _ in 0..buckets {
            let off = read_u64(&mut input, path)?;
            let count = read_u64(&mut input, path)?;
            index.push((off, count));
        }
        Ok(Self {
            path: path.to_path_buf(),
            input,
            key_bits,
            value_bits,
            index,
            bucket: 0,
            current: Vec::new().into_iter(),
        })
    }

    pub fn next_record(&mut self) -> Result<Option<(u64, u64)>> {
        loop {
            if let Some(rec) = self.current.next() {
                return Ok(Some(rec));
            }
            if self.bucket >= self.index.len() {
                return Ok(None);
            }
            let (off, count) = self.index[self.bucket];
            self.bucket += 1;
            if count == 0 {
                continue;
            }
            self.input
                .seek(SeekFrom::Start(off))
                .map_err(|e| Error::io(&self.path, e))?;
            let nbytes = packed_len(count as usize, self.key_bits + self.value_bits);
            let mut bytes = vec![0u8; nbytes];
            self.input
                .read_exact(&mut bytes)
                .map_err(|e| Error::io(&self.path, e))?;
            let mut unpacker = BitUnpacker::new(&bytes);
            let mut records = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let key = unpacker.pop(self.key_bits);
                let val = unpacker.pop(self.value_bits);
                records.push((key, val));
            }
            self.current = records.into_iter();
        }
    }

    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }
}

// K-way merge across sorted segments; equal keys are summed and the result
// streams into the compacted writer in ascending key order.
pub fn merge(segments: &[Segment], kind: CounterKind, writer: &mut CompactedWriter) -> Result<u64> {
    let mut readers = Vec::with_capacity(segments.len());
    for seg in segments {
        readers.push(SegmentReader::open(&seg.path)?);
    }
    if let Some(first) = readers.first() {
        let kb = first.key_bits();
        if readers.iter().any(|r| r.key_bits() != kb) {
            return Err(Error::Domain("segments disagree on key width".into()));
        }
    }

    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::with_capacity(readers.len());
    let mut vals = vec![0u64; readers.len()];
    for (i, r) in readers.iter_mut().enumerate() {
        if let Some((key, val)) = r.next_record()? {
            vals[i] = val;
            heap.push(Reverse((key, i)));
        }
    }

    let mut written = 0u64;
    while let Some(Reverse((key, i))) = heap.pop() {
        let mut acc = vals[i];
        if let Some((k, v)) = readers[i].next_record()? {
            vals[i] = v;
            heap.push(Reverse((k, i)));
        }
        while let Some(&Reverse((k, j))) = heap.peek() {
            if k != key {
                break;
            }
            heap.pop();
            acc = kind.accumulate(acc, vals[j]);
            if let Some((nk, nv)) = readers[j].next_record()? {
                vals[j] = nv;
                heap.push(Reverse((nk, j)));
            }
        }
        writer.push(key, acc)?;
        written += 1;
    }
    Ok(written)
}
