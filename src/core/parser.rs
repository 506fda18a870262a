use crate::core::error::{Error, Result};
use std::path::{Path, PathBuf};

pub const CODE_A: u8 = 0;
pub const CODE_C: u8 = 1;
pub const CODE_G: u8 = 2;
pub const CODE_T: u8 = 3;
pub const CODE_IGNORE: u8 = 0xfe;
pub const CODE_RESET: u8 = 0xff;

// Action for a byte of cleaned sequence: A/C/G/T map to 0..3 and extend the
// current mer, '\n' is ignored, anything else resets it.
pub const CODES: [u8; 256] = build_codes();

const fn build_codes() -> [u8; 256] {
    let mut t = [CODE_RESET; 256];
    t[b'A' as usize] = CODE_A;
    t[b'a' as usize] = CODE_A;
    t[b'C' as usize] = CODE_C;
    t[b'c' as usize] = CODE_C;
    t[b'G' as usize] = CODE_G;
    t[b'g' as usize] = CODE_G;
    t[b'T' as usize] = CODE_T;
    t[b't' as usize] = CODE_T;
    t[b'\n' as usize] = CODE_IGNORE;
    t
}

pub const QUALITY_RANGE: usize = 41;

// 1 - p_error per quality value, indexed by q - quality_start.
pub struct QualityWeights {
    start: u8,
    one_minus_p: [f32; QUALITY_RANGE],
}

impl QualityWeights {
    pub fn new(quality_start: u8) -> Self {
        let mut one_minus_p = [0f32; QUALITY_RANGE];
        for (i, w) in one_minus_p.iter_mut().enumerate() {
            *w = 1.0 - 10f32.powf(-(i as f32) / 10.0);
        }
        Self {
            start: quality_start,
            one_minus_p,
        }
    }

    pub fn weight(&self, q: u8) -> f32 {
        let idx = (q.saturating_sub(self.start) as usize).min(QUALITY_RANGE - 1);
        self.one_minus_p[idx]
    }
}

// A pooled buffer of cleaned sequence bytes; qual runs parallel to seq in
// quality-aware mode and stays empty otherwise.
#[derive(Debug, Default)]
pub struct SeqBlock {
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
}

impl SeqBlock {
    pub fn with_capacity(cap: usize, quals: bool) -> Self {
        Self {
            seq: Vec::with_capacity(cap),
            qual: if quals {
                Vec::with_capacity(cap)
            } else {
                Vec::new()
            },
        }
    }

    pub fn clear(&mut self) {
        self.seq.clear();
        self.qual.clear();
    }
}

pub enum SequenceParser {
    Fasta(FastaParser),
    Fastq(FastqParser),
    Quake(QuakeParser),
}

impl SequenceParser {
    pub fn feed(&mut self, input: &[u8], out: &mut SeqBlock) -> Result<()> {
        match self {
            SequenceParser::Fasta(p) => {
                p.feed(input, out);
                Ok(())
            }
            SequenceParser::Fastq(p) => {
                p.feed(input, out);
                Ok(())
            }
            SequenceParser::Quake(p) => {
                p.feed(input, out);
                Ok(())
            }
        }
    }

    pub fn finish(&self) -> Result<()> {
        match self {
            SequenceParser::Fasta(_) => Ok(()),
            SequenceParser::Fastq(p) => p.finish(),
            SequenceParser::Quake(p) => p.finish(),
        }
    }
}

// Header lines collapse to a single 'N' reset sentinel, newlines are
// stripped, everything else is copied through for the code table to judge.
pub struct FastaParser {
    in_header: bool,
    prev: u8,
}

impl FastaParser {
    pub fn new() -> Self {
        Self {
            in_header: false,
            prev: b'\n',
        }
    }

    pub fn feed(&mut self, input: &[u8], out: &mut SeqBlock) {
        for &b in input {
            if self.in_header {
                if b == b'\n' {
                    self.in_header = false;
                    self.prev = b'\n';
                }
                continue;
            }
            match b {
                b'>' if self.prev == b'\n' => {
                    self.in_header = true;
                    out.seq.push(b'N');
                }
                b'\n' => self.prev = b'\n',
                _ => {
                    out.seq.push(b);
                    self.prev = b;
                }
            }
        }
    }
}

impl Default for FastaParser {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FqState {
    Seq,
    Header,
    QualHeader,
    Qual,
}

pub struct FastqParser {
    path: PathBuf,
    state: FqState,
    prev: u8,
    seq_len: usize,
    qual_left: usize,
}

impl FastqParser {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: FqState::Seq,
            prev: b'\n',
            seq_len: 0,
            qual_left: 0,
        }
    }

    pub fn feed(&mut self, input: &[u8], out: &mut SeqBlock) {
        for &b in input {
            match self.state {
                FqState::Header => {
                    if b == b'\n' {
                        self.state = FqState::Seq;
                        self.prev = b'\n';
                    }
                }
                FqState::QualHeader => {
                    if b == b'\n' {
                        self.prev = b'\n';
                        self.qual_left = self.seq_len;
                        self.seq_len = 0;
                        self.state = if self.qual_left == 0 {
                            FqState::Seq
                        } else {
                            FqState::Qual
                        };
                    }
                }
                FqState::Qual => {
                    if b != b'\n' {
                        self.qual_left -= 1;
                        if self.qual_left == 0 {
                            self.state = FqState::Seq;
                        }
                    }
                    self.prev = b;
                }
                FqState::Seq => match b {
                    b'@' if self.prev == b'\n' => {
                        self.state = FqState::Header;
                        self.seq_len = 0;
                        out.seq.push(b'N');
                    }
                    b'+' if self.prev == b'\n' => {
                        self.state = FqState::QualHeader;
                        self.prev = b;
                    }
                    b'\n' => self.prev = b'\n',
                    _ => {
                        out.seq.push(b);
                        self.seq_len += 1;
                        self.prev = b;
                    }
                },
            }
        }
    }

    pub fn finish(&self) -> Result<()> {
        if self.state == FqState::Qual {
            return Err(Error::file_parser(
                &self.path,
                format!("quality string ends {} bases short of sequence", self.qual_left),
            ));
        }
        Ok(())
    }
}

// Quality-aware FASTQ: sequence bytes are held back until the quality block
// arrives, then emitted paired with their quality byte.
pub struct QuakeParser {
    path: PathBuf,
    state: FqState,
    prev: u8,
    pending: Vec<u8>,
    pend_pos: usize,
}

impl QuakeParser {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: FqState::Seq,
            prev: b'\n',
            pending: Vec::new(),
            pend_pos: 0,
        }
    }

    pub fn feed(&mut self, input: &[u8], out: &mut SeqBlock) {
        for &b in input {
            match self.state {
                FqState::Header => {
                    if b == b'\n' {
                        self.state = FqState::Seq;
                        self.prev = b'\n';
                    }
                }
                FqState::QualHeader => {
                    if b == b'\n' {
                        self.prev = b'\n';
                        self.state = if self.pend_pos == self.pending.len() {
                            self.pending.clear();
                            self.pend_pos = 0;
                            FqState::Seq
                        } else {
                            FqState::Qual
                        };
                    }
                }
                FqState::Qual => {
                    if b != b'\n' {
                        out.seq.push(self.pending[self.pend_pos]);
                        out.qual.push(b);
                        self.pend_pos += 1;
                        if self.pend_pos == self.pending.len() {
                            self.pending.clear();
                            self.pend_pos = 0;
                            self.state = FqState::Seq;
                        }
                    }
                    self.prev = b;
                }
                FqState::Seq => match b {
                    b'@' if self.prev == b'\n' => {
                        self.state = FqState::Header;
                        self.pending.clear();
                        self.pend_pos = 0;
                        out.seq.push(b'N');
                        out.qual.push(0);
                    }
                    b'+' if self.prev == b'\n' => {
                        self.state = FqState::QualHeader;
                        self.prev = b;
                    }
                    b'\n' => self.prev = b'\n',
                    _ => {
                        self.pending.push(b);
                        self.prev = b;
                    }
                },
            }
        }
    }

    pub fn finish(&self) -> Result<()> {
        if !self.pending.is_empty() {
            return Err(Error::file_parser(
                &self.path,
                "record truncated before its quality string completed",
            ));
        }
        Ok(())
    }
}

pub fn parser_for(format: crate::core::io::Format, quake: bool, path: &Path) -> Result<SequenceParser> {
    use crate::core::io::Format;
    match (format, quake) {
        (Format::Fasta, false) => Ok(SequenceParser::Fasta(FastaParser::new())),
        (Format::Fastq, false) => Ok(SequenceParser::Fastq(FastqParser::new(path))),
        (Format::Fastq, true) => Ok(SequenceParser::Quake(QuakeParser::new(path))),
        (Format::Fasta, true) => Err(Error::file_parser(
            path,
            "quality-weighted counting requires FASTQ input",
        )),
    }
}
