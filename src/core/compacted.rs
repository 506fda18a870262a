use crate::core::error::{Error, Result};
use crate::core::matrix::RectangularBinaryMatrix;
use crate::core::model::CounterKind;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MAGIC: [u8; 8] = *b"mercount";
pub const VERSION: u32 = 1;

// magic + version + k + key_bits + value_bits
const RECORD_COUNT_OFFSET: u64 = 24;
const BLOCK_RECORDS: usize = 4096;

// Little-endian bit stream, flushed to bytes eagerly and padded to a byte
// boundary on finish.
pub(crate) struct BitPacker {
    buf: Vec<u8>,
    acc: u128,
    used: u32,
}

impl BitPacker {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::new(),
            acc: 0,
            used: 0,
        }
    }

    pub(crate) fn push(&mut self, value: u64, bits: u32) {
        debug_assert!(bits >= 1 && bits <= 64);
        let value = if bits == 64 {
            value
        } else {
            value & ((1u64 << bits) - 1)
        };
        self.acc |= (value as u128) << self.used;
        self.used += bits;
        while self.used >= 8 {
            self.buf.push(self.acc as u8);
            self.acc >>= 8;
            self.used -= 8;
        }
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.buf.push(self.acc as u8);
        }
        self.buf
    }
}

pub(crate) struct BitUnpacker<'a> {
    data: &'a [u8],
    pos: usize,
    acc: u128,
    avail: u32,
}

impl<'a> BitUnpacker<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            acc: 0,
            avail: 0,
        }
    }

    pub(crate) fn pop(&mut self, bits: u32) -> u64 {
        debug_assert!(bits >= 1 && bits <= 64);
        while self.avail < bits {
            let byte = if self.pos < self.data.len() {
                self.data[self.pos]
            } else {
                0
            };
            self.pos += 1;
            self.acc |= (byte as u128) << self.avail;
            self.avail += 8;
        }
        let v = (self.acc & ((1u128 << bits) - 1)) as u64;
        self.acc >>= bits;
        self.avail -= bits;
        v
    }
}

pub(crate) fn packed_len(records: usize, record_bits: u32) -> usize {
    (records * record_bits as usize + 7) / 8
}

#[derive(Clone, Debug)]
pub struct CompactedHeader {
    pub k: u32,
    pub key_bits: u32,
    pub value_bits: u32,
    pub record_count: u64,
}

// Sorted (key, value) records, bit-packed into record-count-prefixed blocks
// behind a fixed header and the hash matrix used to build them.
pub struct CompactedWriter {
    path: PathBuf,
    out: BufWriter<File>,
    k: u32,
    key_bits: u32,
    value_bits: u32,
    kind: CounterKind,
    record_count: u64,
    last_key: Option<u64>,
    block: Vec<(u64, u64)>,
}

impl CompactedWriter {
    pub fn create(
        path: &Path,
        k: u32,
        key_bits: u32,
        value_bits: u32,
        kind: CounterKind,
        matrix: &RectangularBinaryMatrix,
    ) -> Result<Self> {
        if key_bits == 0 || key_bits > 64 || value_bits == 0 || value_bits > 64 {
            return Err(Error::OutOfRange(format!(
                "record layout {}+{} bits",
                key_bits, value_bits
            )));
        }
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut out = BufWriter::new(file);
        let io_err = |e| Error::io(path, e);
        out.write_all(&MAGIC).map_err(io_err)?;
        out.write_all(&VERSION.to_le_bytes()).map_err(io_err)?;
        out.write_all(&k.to_le_bytes()).map_err(io_err)?;
        out.write_all(&key_bits.to_le_bytes()).map_err(io_err)?;
        out.write_all(&value_bits.to_le_bytes()).map_err(io_err)?;
        out.write_all(&0u64.to_le_bytes()).map_err(io_err)?;
        out.write_all(&matrix.r().to_le_bytes()).map_err(io_err)?;
        out.write_all(&matrix.c().to_le_bytes()).map_err(io_err)?;
        for &col in matrix.columns() {
            out.write_all(&col.to_le_bytes()).map_err(io_err)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            out,
            k,
            key_bits,
            value_bits,
            kind,
            record_count: 0,
            last_key: None,
            block: Vec::with_capacity(BLOCK_RECORDS),
        })
    }

    pub fn push(&mut self, key: u64, raw: u64) -> Result<()> {
        if let Some(last) = self.last_key {
            if key <= last {
                return Err(Error::Domain(format!(
                    "keys not strictly ascending: {:#x} after {:#x}",
                    key, last
                )));
            }
        }
        self.last_key = Some(key);
        self.block.push((key, raw));
        self.record_count += 1;
        if self.block.len() == BLOCK_RECORDS {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let mut packer = BitPacker::new();
        for &(key, raw) in &self.block {
            packer.push(key, self.key_bits);
            packer.push(self.kind.clamp_to_bits(raw, self.value_bits), self.value_bits);
        }
        let n = self.block.len() as u32;
        self.out
            .write_all(&n.to_le_bytes())
            .map_err(|e| Error::io(&self.path, e))?;
        self.out
            .write_all(&packer.finish())
            .map_err(|e| Error::io(&self.path, e))?;
        self.block.clear();
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64> {
        self.flush_block()?;
        self.out.flush().map_err(|e| Error::io(&self.path, e))?;
        let file = self.out.get_mut();
        file.seek(SeekFrom::Start(RECORD_COUNT_OFFSET))
            .map_err(|e| Error::io(&self.path, e))?;
        file.write_all(&self.record_count.to_le_bytes())
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(self.record_count)
    }

    pub fn k(&self) -> u32 {
        self.k
    }
}

pub struct CompactedReader {
    path: PathBuf,
    input: BufReader<File>,
    header: CompactedHeader,
    matrix: RectangularBinaryMatrix,
    remaining: u64,
    block: std::vec::IntoIter<(u64, u64)>,
}

impl CompactedReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut input = BufReader::new(file);
        let mut magic = [0u8; 8];
        input
            .read_exact(&mut magic)
            .map_err(|e| Error::io(path, e))?;
        if magic != MAGIC {
            return Err(Error::file_parser(path, "bad magic"));
        }
        let version = read_u32(&mut input, path)?;
        if version != VERSION {
            return Err(Error::file_parser(
                path,
                format!("unsupported version {}", version),
            ));
        }
        let k = read_u32(&mut input, path)?;
        let key_bits = read_u32(&mut input, path)?;
        let value_bits = read_u32(&mut input, path)?;
        let record_count = read_u64(&mut input, path)?;
        let r = read_u32(&mut input, path)?;
        let c = read_u32(&mut input, path)?;
        if c > 64 * 1024 {
            return Err(Error::file_parser(path, "implausible matrix size"));
        }
        let mut columns = vec![0u64; c as usize];
        for col in columns.iter_mut() {
            *col = read_u64(&mut input, path)?;
        }
        let matrix = RectangularBinaryMatrix::from_raw(&columns, r, c)?;
        Ok(Self {
            path: path.to_path_buf(),
            input,
            header: CompactedHeader {
                k,
                key_bits,
                value_bits,
                record_count,
            },
            matrix,
            remaining: record_count,
            block: Vec::new().into_iter(),
        })
    }

    pub fn header(&self) -> &CompactedHeader {
        &self.header
    }

    pub fn matrix(&self) -> &RectangularBinaryMatrix {
        &self.matrix
    }

    // Finite, non-restartable record sequence in ascending key order.
    pub fn next_record(&mut self) -> Result<Option<(u64, u64)>> {
        loop {
            if let Some(rec) = self.block.next() {
                return Ok(Some(rec));
            }
            if self.remaining == 0 {
                return Ok(None);
            }
            let n = read_u32(&mut self.input, &self.path)? as u64;
            if n == 0 || n > self.remaining {
                return Err(Error::file_parser(&self.path, "corrupt block header"));
            }
            let record_bits = self.header.key_bits + self.header.value_bits;
            let nbytes = packed_len(n as usize, record_bits);
            let mut bytes = vec![0u8; nbytes];
            self.input
                .read_exact(&mut bytes)
                .map_err(|e| Error::io(&self.path, e))?;
            let mut unpacker = BitUnpacker::new(&bytes);
            let mut records = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let key = unpacker.pop(self.header.key_bits);
                let value = unpacker.pop(self.header.value_bits);
                records.push((key, value));
            }
            self.remaining -= n;
            self.block = records.into_iter();
        }
    }

    pub fn records(mut self) -> Result<Vec<(u64, u64)>> {
        let mut all = Vec::with_capacity(self.header.record_count as usize);
        while let Some(rec) = self.next_record()? {
            all.push(rec);
        }
        Ok(all)
    }
}

pub(crate) fn read_u32(input: &mut impl Read, path: &Path) -> Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf).map_err(|e| Error::io(path, e))?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64(input: &mut impl Read, path: &Path) -> Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf).map_err(|e| Error::io(path, e))?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};

    fn test_matrix(bits: u32) -> RectangularBinaryMatrix {
        let mut rng = StdRng::seed_from_u64(21);
        let mut m = RectangularBinaryMatrix::new(bits, bits).unwrap();
        m.randomize_pseudo_inverse(&mut rng);
        m
    }

    #[test]
    fn bit_packer_round_trip() {
        let mut rng = StdRng::seed_from_u64(22);
        for &bits in &[1u32, 3, 7, 13, 24, 31, 40, 64] {
            let values: Vec<u64> = (0..100)
                .map(|_| rng.next_u64() & crate::core::model::ones(bits))
                .collect();
            let mut p = BitPacker::new();
            for &v in &values {
                p.push(v, bits);
            }
            let bytes = p.finish();
            assert_eq!(packed_len(values.len(), bits), bytes.len());
            let mut u = BitUnpacker::new(&bytes);
            for &v in &values {
                assert_eq!(v, u.pop(bits));
            }
        }
    }

    #[test]
    fn writer_reader_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.mc");
        let matrix = test_matrix(20);
        let mut rng = StdRng::seed_from_u64(23);

        let mut records: Vec<(u64, u64)> = Vec::new();
        let mut key = 0u64;
        for _ in 0..10_000 {
            key += rng.gen_range(1..50u64);
            records.push((key, rng.gen_range(1..1000u64)));
        }

        let mut w = CompactedWriter::create(&path, 10, 20, 16, CounterKind::Count, &matrix).unwrap();
        for &(k, v) in &records {
            w.push(k, v).unwrap();
        }
        assert_eq!(records.len() as u64, w.finish().unwrap());

        let r = CompactedReader::open(&path).unwrap();
        assert_eq!(10, r.header().k);
        assert_eq!(20, r.header().key_bits);
        assert_eq!(16, r.header().value_bits);
        assert_eq!(records.len() as u64, r.header().record_count);
        assert_eq!(&matrix, r.matrix());
        assert_eq!(records, r.records().unwrap());
    }

    #[test]
    fn writer_rejects_unsorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.mc");
        let matrix = test_matrix(16);
        let mut w = CompactedWriter::create(&path, 8, 16, 16, CounterKind::Count, &matrix).unwrap();
        w.push(5, 1).unwrap();
        assert!(matches!(w.push(5, 1), Err(Error::Domain(_))));
        assert!(matches!(w.push(3, 1), Err(Error::Domain(_))));
    }

    #[test]
    fn counts_saturate_to_value_width() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.mc");
        let matrix = test_matrix(16);
        let mut w = CompactedWriter::create(&path, 8, 16, 4, CounterKind::Count, &matrix).unwrap();
        w.push(1, 3).unwrap();
        w.push(2, 100).unwrap();
        w.finish().unwrap();

        let r = CompactedReader::open(&path).unwrap();
        assert_eq!(vec![(1, 3), (2, 15)], r.records().unwrap());
    }

    #[test]
    fn weight_records_keep_f32_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.mc");
        let matrix = test_matrix(16);
        let mut w = CompactedWriter::create(&path, 8, 16, 32, CounterKind::Weight, &matrix).unwrap();
        w.push(1, 0.75f32.to_bits() as u64).unwrap();
        w.push(9, 12.5f32.to_bits() as u64).unwrap();
        w.finish().unwrap();

        let r = CompactedReader::open(&path).unwrap();
        let records = r.records().unwrap();
        assert_eq!(0.75, f32::from_bits(records[0].1 as u32));
        assert_eq!(12.5, f32::from_bits(records[1].1 as u32));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.mc");
        std::fs::write(&path, b"not a compacted hash file").unwrap();
        assert!(matches!(
            CompactedReader::open(&path),
            Err(Error::FileParser { .. })
        ));
    }
}
