use crate::core::compacted::CompactedWriter;
use crate::core::dumper::{self, Segment};
use crate::core::error::Error;
use crate::core::hash::CountArray;
use crate::core::io::InputReader;
use crate::core::model::{kmer_mask, ArrayConfig, CountMode, CounterKind};
use crate::core::parser::{
    parser_for, QualityWeights, SeqBlock, CODES, CODE_IGNORE, CODE_RESET,
};
use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel as channel;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

// Room for one parser feed past the nominal buffer size.
const BLOCK_SLACK: usize = 64 * 1024;

pub struct CountConfig {
    pub files: Vec<PathBuf>,
    pub k: u32,
    pub size: u64,
    pub counter_bits: u32,
    pub out_counter_bits: u32,
    pub reprobe_limit: u32,
    pub threads: usize,
    pub canonical: bool,
    pub mode: CountMode,
    pub out: PathBuf,
    pub tmp_dir: Option<PathBuf>,
    pub buffer_size: usize,
    pub nb_buffers: usize,
    pub load_factor: f64,
}

impl CountConfig {
    pub fn new(files: Vec<PathBuf>, k: u32, size: u64, out: PathBuf) -> Self {
        Self {
            files,
            k,
            size,
            counter_bits: 7,
            out_counter_bits: 32,
            reprobe_limit: 62,
            threads: 1,
            canonical: false,
            mode: CountMode::Count,
            out,
            tmp_dir: None,
            buffer_size: 4 * 1024 * 1024,
            nb_buffers: 8,
            load_factor: 0.8,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CountSummary {
    pub distinct: u64,
    pub total: u64,
    pub spills: u32,
    pub bytes: u64,
}

// Workers rendezvous here when the table needs draining: new block
// processing holds off, in-flight blocks finish, then one thread runs the
// dump with the table quiescent. Touched only at block boundaries and on
// TableFull, never in the per-base loop.
struct SpillGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

#[derive(Default)]
struct GateState {
    active: usize,
    spilling: bool,
}

impl SpillGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, GateState>) -> MutexGuard<'a, GateState> {
        self.cv.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self) {
        let mut st = self.lock();
        while st.spilling {
            st = self.wait(st);
        }
        st.active += 1;
    }

    fn leave(&self) {
        let mut st = self.lock();
        st.active -= 1;
        if st.spilling && st.active == 0 {
            self.cv.notify_all();
        }
    }

    // Caller must be active. Either runs the dump itself once every other
    // active worker has parked, or waits out a dump another worker started.
    fn request_spill(&self, dump: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut st = self.lock();
        if st.spilling {
            st.active -= 1;
            if st.active == 0 {
                self.cv.notify_all();
            }
            while st.spilling {
                st = self.wait(st);
            }
            st.active += 1;
            return Ok(());
        }
        st.spilling = true;
        st.active -= 1;
        while st.active > 0 {
            st = self.wait(st);
        }
        drop(st);
        let res = dump();
        let mut st = self.lock();
        st.spilling = false;
        st.active += 1;
        self.cv.notify_all();
        drop(st);
        res
    }
}

struct SharedState<'a> {
    cfg: &'a CountConfig,
    array: &'a CountArray,
    gate: SpillGate,
    segments: Mutex<Vec<Segment>>,
    spill_no: AtomicU64,
    entries: AtomicU64,
    total: AtomicU64,
    bytes: AtomicU64,
    shutdown: AtomicBool,
    tmp_dir: PathBuf,
    seg_base: String,
    spill_threshold: u64,
}

impl SharedState<'_> {
    fn spill(&self) -> Result<()> {
        self.gate.request_spill(|| self.dump())
    }

    // Runs with the table quiescent (behind the gate or after the workers
    // have joined).
    fn dump(&self) -> Result<()> {
        let n = self.spill_no.fetch_add(1, Ordering::Relaxed);
        let path = self.tmp_dir.join(format!("{}.seg{}", self.seg_base, n));
        let seg = dumper::spill(self.array, &path, self.cfg.threads, self.cfg.k)
            .with_context(|| format!("spill to {} failed", path.display()))?;
        self.segments
            .lock()
            .map_err(|_| anyhow!("segment list poisoned"))?
            .push(seg);
        self.array.reset();
        self.entries.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn cleanup_segments(&self) {
        if let Ok(mut segs) = self.segments.lock() {
            for seg in segs.drain(..) {
                let _ = std::fs::remove_file(&seg.path);
            }
        }
    }
}

pub fn run(cfg: CountConfig) -> Result<CountSummary> {
    let stats = stats_enabled();
    if cfg.k == 0 || cfg.k > 32 {
        bail!("mer length must be in 1..=32");
    }
    if cfg.threads == 0 {
        bail!("thread count must be >= 1");
    }
    if cfg.files.is_empty() {
        bail!("no input files");
    }
    let kind = cfg.mode.counter_kind();

    let mut acfg = ArrayConfig::new(2 * cfg.k, cfg.size);
    acfg.counter_bits = cfg.counter_bits;
    acfg.reprobe_limit = cfg.reprobe_limit;
    acfg.kind = kind;
    let array = CountArray::new(&acfg, &mut rand::thread_rng())
        .context("failed to build counting table")?;

    let tmp_dir = match &cfg.tmp_dir {
        Some(d) => d.clone(),
        None => parent_dir(&cfg.out),
    };
    let seg_base = cfg
        .out
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("mer_counts")
        .to_string();
    let weights = match cfg.mode {
        CountMode::Quake { quality_start } => Some(QualityWeights::new(quality_start)),
        CountMode::Count => None,
    };

    let shared = SharedState {
        cfg: &cfg,
        array: &array,
        gate: SpillGate::new(),
        segments: Mutex::new(Vec::new()),
        spill_no: AtomicU64::new(0),
        entries: AtomicU64::new(0),
        total: AtomicU64::new(0),
        bytes: AtomicU64::new(0),
        shutdown: AtomicBool::new(false),
        tmp_dir,
        seg_base,
        spill_threshold: ((array.size() as f64 * cfg.load_factor) as u64).max(1),
    };

    let (free_tx, free_rx) = channel::bounded::<SeqBlock>(cfg.nb_buffers);
    let (ready_tx, ready_rx) = channel::bounded::<SeqBlock>(cfg.nb_buffers);
    let (err_tx, err_rx) = channel::bounded::<anyhow::Error>(cfg.threads + 1);
    let quake = kind == CounterKind::Weight;
    for _ in 0..cfg.nb_buffers {
        let _ = free_tx.send(SeqBlock::with_capacity(cfg.buffer_size + BLOCK_SLACK, quake));
    }

    let t_count = Instant::now();
    thread::scope(|s| {
        let shared = &shared;
        let weights = weights.as_ref();
        {
            let err_tx = err_tx.clone();
            s.spawn(move || {
                if let Err(e) = filler_loop(shared, free_rx, ready_tx) {
                    shared.shutdown.store(true, Ordering::Relaxed);
                    let _ = err_tx.send(e);
                }
            });
        }
        for _ in 0..cfg.threads {
            let ready_rx = ready_rx.clone();
            let free_tx = free_tx.clone();
            let err_tx = err_tx.clone();
            s.spawn(move || {
                if let Err(e) = worker_loop(shared, weights, ready_rx, free_tx) {
                    shared.shutdown.store(true, Ordering::Relaxed);
                    let _ = err_tx.send(e);
                }
            });
        }
        drop(ready_rx);
        drop(free_tx);
        drop(err_tx);
    });
    log_stage(stats, "engine.count", t_count);

    if let Ok(e) = err_rx.try_recv() {
        shared.cleanup_segments();
        return Err(e);
    }

    let t_merge = Instant::now();
    let result = finalize(&cfg, &shared, &array, kind);
    log_stage(stats, "engine.merge", t_merge);
    if result.is_err() {
        shared.cleanup_segments();
    }
    if stats {
        if let Ok(summary) = &result {
            eprintln!(
                "MERCOUNT_STATS distinct={} total={} spills={} bytes={}",
                summary.distinct, summary.total, summary.spills, summary.bytes
            );
        }
    }
    result
}

fn finalize(
    cfg: &CountConfig,
    shared: &SharedState<'_>,
    array: &CountArray,
    kind: CounterKind,
) -> Result<CountSummary> {
    // drain whatever is still in memory, then merge every segment
    shared.dump()?;
    let segments = {
        let mut guard = shared
            .segments
            .lock()
            .map_err(|_| anyhow!("segment list poisoned"))?;
        std::mem::take(&mut *guard)
    };
    let out_value_bits = match kind {
        CounterKind::Count => cfg.out_counter_bits,
        CounterKind::Weight => 32,
    };
    let mut writer = CompactedWriter::create(
        &cfg.out,
        cfg.k,
        2 * cfg.k,
        out_value_bits,
        kind,
        array.matrix(),
    )
    .with_context(|| format!("failed to create {}", cfg.out.display()))?;
    dumper::merge(&segments, kind, &mut writer)?;
    let distinct = writer.finish()?;
    for seg in &segments {
        let _ = std::fs::remove_file(&seg.path);
    }
    Ok(CountSummary {
        distinct,
        total: shared.total.load(Ordering::Relaxed),
        spills: (shared.spill_no.load(Ordering::Relaxed).saturating_sub(1)) as u32,
        bytes: shared.bytes.load(Ordering::Relaxed),
    })
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn filler_loop(
    shared: &SharedState<'_>,
    free_rx: channel::Receiver<SeqBlock>,
    ready_tx: channel::Sender<SeqBlock>,
) -> Result<()> {
    let cfg = shared.cfg;
    let quake = matches!(cfg.mode, CountMode::Quake { .. });
    let seam_len = cfg.k as usize - 1;
    let mut seam_seq: Vec<u8> = Vec::new();
    let mut seam_qual: Vec<u8> = Vec::new();
    let mut block = match free_rx.recv() {
        Ok(mut b) => {
            b.clear();
            b
        }
        Err(_) => return Ok(()),
    };
    for path in &cfg.files {
        if shared.shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        let (mut reader, format) = InputReader::open(path, cfg.threads)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut parser = parser_for(format, quake, path)?;
        while let Some(chunk) = reader.next_chunk()? {
            shared.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            let mut off = 0;
            while off < chunk.len() {
                if shared.shutdown.load(Ordering::Relaxed) {
                    return Ok(());
                }
                if block.seq.len() >= cfg.buffer_size {
                    block = match rotate(
                        block,
                        &free_rx,
                        &ready_tx,
                        &mut seam_seq,
                        &mut seam_qual,
                        seam_len,
                        quake,
                    ) {
                        Some(b) => b,
                        None => return Ok(()),
                    };
                }
                let room = cfg.buffer_size.saturating_sub(block.seq.len()).max(1);
                let take = (chunk.len() - off).min(room);
                parser.feed(&chunk[off..off + take], &mut block)?;
                off += take;
            }
        }
        parser.finish()?;
    }
    if !block.seq.is_empty() {
        let _ = ready_tx.send(block);
    }
    Ok(())
}

// Ship a filled block and start the next one primed with the last k-1 bases,
// so no mer straddling the boundary is lost. The seam can never produce a
// duplicate submission: k-1 bases are one short of completing a mer.
fn rotate(
    block: SeqBlock,
    free_rx: &channel::Receiver<SeqBlock>,
    ready_tx: &channel::Sender<SeqBlock>,
    seam_seq: &mut Vec<u8>,
    seam_qual: &mut Vec<u8>,
    seam_len: usize,
    quake: bool,
) -> Option<SeqBlock> {
    let tail = block.seq.len().saturating_sub(seam_len);
    seam_seq.clear();
    seam_seq.extend_from_slice(&block.seq[tail..]);
    if quake {
        seam_qual.clear();
        seam_qual.extend_from_slice(&block.qual[tail..]);
    }
    if ready_tx.send(block).is_err() {
        return None;
    }
    let mut next = free_rx.recv().ok()?;
    next.clear();
    next.seq.extend_from_slice(seam_seq);
    if quake {
        next.qual.extend_from_slice(seam_qual);
    }
    Some(next)
}

struct QualWindow {
    vals: Vec<f32>,
    pos: usize,
}

impl QualWindow {
    fn new(k: usize) -> Self {
        Self {
            vals: vec![0.0; k],
            pos: 0,
        }
    }

    fn reset(&mut self) {
        self.vals.fill(0.0);
        self.pos = 0;
    }

    fn append(&mut self, w: f32) {
        self.vals[self.pos] = w;
        self.pos = (self.pos + 1) % self.vals.len();
    }

    fn prod(&self) -> f32 {
        self.vals.iter().product()
    }
}

#[derive(Clone, Copy, Default)]
struct BlockStats {
    mers: u64,
    new_entries: u64,
}

fn worker_loop(
    shared: &SharedState<'_>,
    weights: Option<&QualityWeights>,
    ready_rx: channel::Receiver<SeqBlock>,
    free_tx: channel::Sender<SeqBlock>,
) -> Result<()> {
    let cfg = shared.cfg;
    let mask = kmer_mask(cfg.k);
    let lshift = 2 * (cfg.k - 1);
    let mut window = weights.map(|_| QualWindow::new(cfg.k as usize));
    let mut local_total = 0u64;
    for block in ready_rx.iter() {
        if shared.shutdown.load(Ordering::Relaxed) {
            let _ = free_tx.send(block);
            break;
        }
        shared.gate.enter();
        let res = count_block(shared, weights, &mut window, &block, mask, lshift);
        let spill_res = match &res {
            Ok(stats) => {
                let entries =
                    shared.entries.fetch_add(stats.new_entries, Ordering::Relaxed)
                        + stats.new_entries;
                if entries >= shared.spill_threshold {
                    shared.spill()
                } else {
                    Ok(())
                }
            }
            Err(_) => Ok(()),
        };
        shared.gate.leave();
        let stats = res?;
        spill_res?;
        local_total += stats.mers;
        let _ = free_tx.send(block);
    }
    shared.total.fetch_add(local_total, Ordering::Relaxed);
    Ok(())
}

fn count_block(
    shared: &SharedState<'_>,
    weights: Option<&QualityWeights>,
    window: &mut Option<QualWindow>,
    block: &SeqBlock,
    mask: u64,
    lshift: u32,
) -> Result<BlockStats> {
    let cfg = shared.cfg;
    let k = cfg.k;
    let mut kmer = 0u64;
    let mut rkmer = 0u64;
    let mut cmlen = 0u32;
    let mut stats = BlockStats::default();
    if let Some(w) = window.as_mut() {
        w.reset();
    }
    for (i, &b) in block.seq.iter().enumerate() {
        let code = CODES[b as usize];
        if code == CODE_RESET {
            kmer = 0;
            rkmer = 0;
            cmlen = 0;
            if let Some(w) = window.as_mut() {
                w.reset();
            }
            continue;
        }
        if code == CODE_IGNORE {
            continue;
        }
        let c = code as u64;
        kmer = ((kmer << 2) | c) & mask;
        rkmer = (rkmer >> 2) | ((3 - c) << lshift);
        if let (Some(w), Some(qw)) = (window.as_mut(), weights) {
            w.append(qw.weight(block.qual[i]));
        }
        if cmlen < k {
            cmlen += 1;
        }
        if cmlen >= k {
            let key = if cfg.canonical { kmer.min(rkmer) } else { kmer };
            let weight = window.as_ref().map(|w| w.prod());
            let is_new = submit(shared, key, weight)?;
            stats.mers += 1;
            stats.new_entries += u64::from(is_new);
        }
    }
    Ok(stats)
}

// TableFull triggers one spill-and-retry; a second failure on the same key is
// fatal.
fn submit(shared: &SharedState<'_>, key: u64, weight: Option<f32>) -> Result<bool> {
    let add = |key, weight: Option<f32>| match weight {
        None => shared.array.add(key, 1),
        Some(w) => shared.array.add_weight(key, w),
    };
    match add(key, weight) {
        Ok(new) => Ok(new),
        Err(Error::TableFull { .. }) => {
            shared.spill()?;
            if shared.shutdown.load(Ordering::Relaxed) {
                bail!("shutting down");
            }
            add(key, weight).context("table full immediately after spill")
        }
        Err(e) => Err(e.into()),
    }
}

fn stats_enabled() -> bool {
    matches!(std::env::var("MERCOUNT_STATS").as_deref(), Ok("1"))
}

fn log_stage(stats: bool, name: &str, t: Instant) {
    if stats {
        eprintln!("MERCOUNT_STATS stage={} time={}", name, fmt_dur(t.elapsed()));
    }
}

fn fmt_dur(d: Duration) -> String {
    if d.as_secs_f64() < 1.0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{:.3}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compacted::CompactedReader;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::fs;

    fn encode(s: &str) -> u64 {
        s.bytes().fold(0, |acc, b| (acc << 2) | CODES[b as usize] as u64)
    }

    fn revcomp(key: u64, k: u32) -> u64 {
        let mut out = 0u64;
        let mut key = key;
        for _ in 0..k {
            out = (out << 2) | (3 - (key & 3));
            key >>= 2;
        }
        out
    }

    // ground truth over cleaned base streams; N resets the mer
    fn reference_counts(streams: &[&str], k: u32, canonical: bool) -> HashMap<u64, u64> {
        let mask = kmer_mask(k);
        let lshift = 2 * (k - 1);
        let mut counts = HashMap::new();
        for s in streams {
            let mut kmer = 0u64;
            let mut rkmer = 0u64;
            let mut run = 0u32;
            for b in s.bytes() {
                let code = CODES[b as usize];
                if code == CODE_IGNORE {
                    continue;
                }
                if code == CODE_RESET {
                    kmer = 0;
                    rkmer = 0;
                    run = 0;
                    continue;
                }
                let c = code as u64;
                kmer = ((kmer << 2) | c) & mask;
                rkmer = (rkmer >> 2) | ((3 - c) << lshift);
                if run < k {
                    run += 1;
                }
                if run >= k {
                    let key = if canonical { kmer.min(rkmer) } else { kmer };
                    *counts.entry(key).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    struct Opts {
        canonical: bool,
        size: u64,
        threads: usize,
        buffer_size: usize,
        mode: CountMode,
    }

    impl Default for Opts {
        fn default() -> Self {
            Self {
                canonical: false,
                size: 1 << 12,
                threads: 2,
                buffer_size: 4 * 1024 * 1024,
                mode: CountMode::Count,
            }
        }
    }

    fn run_case(inputs: &[(&str, &[u8])], k: u32, opts: Opts) -> Vec<(u64, u64)> {
        let dir = tempfile::tempdir().unwrap();
        let files = inputs
            .iter()
            .map(|(name, content)| {
                let p = dir.path().join(name);
                fs::write(&p, content).unwrap();
                p
            })
            .collect();
        let out = dir.path().join("counts.mc");
        let mut cfg = CountConfig::new(files, k, opts.size, out.clone());
        cfg.canonical = opts.canonical;
        cfg.threads = opts.threads;
        cfg.buffer_size = opts.buffer_size;
        cfg.mode = opts.mode;
        run(cfg).unwrap();
        let reader = CompactedReader::open(&out).unwrap();
        assert_eq!(k, reader.header().k);
        reader.records().unwrap()
    }

    fn as_map(records: Vec<(u64, u64)>) -> HashMap<u64, u64> {
        records.into_iter().collect()
    }

    #[test]
    fn single_record_fasta() {
        let records = run_case(&[("s.fa", b">s\nACGT\n")], 2, Opts::default());
        assert_eq!(
            vec![(encode("AC"), 1), (encode("CG"), 1), (encode("GT"), 1)],
            records
        );
    }

    #[test]
    fn canonical_merges_reverse_complements() {
        let records = run_case(
            &[("s.fa", b">s\nACGT\n")],
            2,
            Opts {
                canonical: true,
                ..Opts::default()
            },
        );
        // revcomp(GT) = AC
        assert_eq!(vec![(encode("AC"), 2), (encode("CG"), 1)], records);
    }

    #[test]
    fn n_resets_the_mer() {
        let records = run_case(&[("s.fa", b">s\nACNGT\n")], 3, Opts::default());
        assert!(records.is_empty());
    }

    #[test]
    fn quake_weights_windows() {
        let records = run_case(
            &[("r.fq", b"@r\nACGT\n+\nIIII\n")],
            2,
            Opts {
                mode: CountMode::Quake {
                    quality_start: b'!',
                },
                ..Opts::default()
            },
        );
        let w = 1.0f32 - 1e-4;
        let expect = w * w;
        assert_eq!(3, records.len());
        let map = as_map(records);
        for mer in ["AC", "CG", "GT"] {
            let got = f32::from_bits(map[&encode(mer)] as u32);
            assert!((got - expect).abs() < 1e-5, "{}: {} vs {}", mer, got, expect);
        }
    }

    #[test]
    fn multiple_files_accumulate() {
        let records = run_case(
            &[("a.fa", b">a\nAAAA"), ("b.fa", b">b\nAAAA")],
            3,
            Opts {
                threads: 4,
                ..Opts::default()
            },
        );
        assert_eq!(vec![(encode("AAA"), 4)], records);
    }

    #[test]
    fn plain_fastq_counts_like_fasta() {
        let records = run_case(&[("r.fq", b"@r\nACGT\n+\nIIII\n")], 2, Opts::default());
        assert_eq!(
            vec![(encode("AC"), 1), (encode("CG"), 1), (encode("GT"), 1)],
            records
        );
    }

    fn random_dna(seed: u64, len: usize) -> String {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len)
            .map(|_| b"ACGT"[rng.gen_range(0..4)] as char)
            .collect()
    }

    #[test]
    fn spilling_is_transparent() {
        let seq = random_dna(41, 4000);
        let fasta = format!(">s\n{}\n", seq);
        let k = 10;

        let big = run_case(
            &[("s.fa", fasta.as_bytes())],
            k,
            Opts {
                size: 1 << 14,
                threads: 4,
                ..Opts::default()
            },
        );
        // 128 slots forces repeated spills over ~4000 distinct mers
        let small = run_case(
            &[("s.fa", fasta.as_bytes())],
            k,
            Opts {
                size: 128,
                threads: 4,
                ..Opts::default()
            },
        );
        assert_eq!(big, small);

        let stream = format!("N{}", seq);
        let expect = reference_counts(&[&stream], k, false);
        assert_eq!(expect, as_map(big));
    }

    #[test]
    fn tiny_buffers_preserve_boundary_mers() {
        let seq = random_dna(42, 2000);
        let fasta = format!(">s\n{}\n", seq);
        let k = 9;
        let records = run_case(
            &[("s.fa", fasta.as_bytes())],
            k,
            Opts {
                threads: 3,
                buffer_size: 64,
                ..Opts::default()
            },
        );
        let stream = format!("N{}", seq);
        let expect = reference_counts(&[&stream], k, false);
        assert_eq!(expect, as_map(records));
    }

    #[test]
    fn canonical_output_matches_reference() {
        let seq = random_dna(43, 1500);
        let fasta = format!(">s\n{}\n", seq);
        let k = 7;
        let records = run_case(
            &[("s.fa", fasta.as_bytes())],
            k,
            Opts {
                canonical: true,
                threads: 2,
                ..Opts::default()
            },
        );
        let stream = format!("N{}", seq);
        let expect = reference_counts(&[&stream], k, true);
        let got = as_map(records);
        assert_eq!(expect, got);
        // exactly one of (mer, revcomp) surfaces per pair
        for &key in got.keys() {
            let rc = revcomp(key, k);
            assert!(key <= rc);
            if key != rc {
                assert!(!got.contains_key(&rc));
            }
        }
    }

    #[test]
    fn gzip_input_matches_plain() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let seq = random_dna(44, 800);
        let fasta = format!(">s\n{}\n", seq);
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(fasta.as_bytes()).unwrap();
        let gz = enc.finish().unwrap();

        let plain = run_case(&[("s.fa", fasta.as_bytes())], 8, Opts::default());
        let zipped = run_case(&[("s.fa.gz", &gz)], 8, Opts::default());
        assert_eq!(plain, zipped);
    }

    #[test]
    fn unrecognized_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"this is not sequence data").unwrap();
        let cfg = CountConfig::new(
            vec![path],
            5,
            1 << 10,
            dir.path().join("counts.mc"),
        );
        let err = run(cfg).unwrap_err();
        let chain = format!("{:#}", err);
        assert!(chain.contains("invalid input file"), "{}", chain);
    }

    #[test]
    fn truncated_fastq_quality_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.fq");
        fs::write(&path, b"@r\nACGT\n+\nII").unwrap();
        let cfg = CountConfig::new(
            vec![path],
            2,
            1 << 10,
            dir.path().join("counts.mc"),
        );
        assert!(run(cfg).is_err());
    }

    #[test]
    fn summary_reports_spills_and_totals() {
        let dir = tempfile::tempdir().unwrap();
        let seq = random_dna(45, 3000);
        let path = dir.path().join("s.fa");
        fs::write(&path, format!(">s\n{}\n", seq)).unwrap();
        let mut cfg = CountConfig::new(
            vec![path],
            11,
            256,
            dir.path().join("counts.mc"),
        );
        cfg.threads = 2;
        let summary = run(cfg).unwrap();
        assert_eq!(3000 - 10, summary.total);
        assert!(summary.spills > 0);
        assert!(summary.distinct > 0);
        assert!(summary.bytes > 0);
    }
}
