use crate::core::error::{Error, Result};
use crate::core::matrix::RectangularBinaryMatrix;
use crate::core::model::{ones, Allocation, ArrayConfig, CounterKind};
use memmap2::{MmapMut, MmapOptions};
use rand::RngCore;
use std::fs::OpenOptions;
use std::sync::atomic::{AtomicU64, Ordering};

// One slot per 64-bit word, low to high:
//
//   [ value (v bits) | LARGE | LOCK | key field ]
//
// The key field is (stored_high_bits << offset_bits) | code, where code is
// reprobe-offset+1 for an entry's head slot and all-ones for a continuation
// slot holding overflow digits. A word of zero is an empty slot; any occupied
// slot has a non-zero code. Because the hash matrix is invertible, the full
// key is recoverable from (slot index, stored bits, reprobe offset).
pub struct CountArray {
    slab: Slab,
    size_mask: u64,
    lsize: u32,
    key_bits: u32,
    reprobe_limit: u32,
    strides: Vec<u64>,
    offset_bits: u32,
    cont_code: u64,
    key_field_mask: u64,
    key_shift: u32,
    value_bits: u32,
    value_mask: u64,
    large_bit: u64,
    lock_bit: u64,
    kind: CounterKind,
    matrix: RectangularBinaryMatrix,
    inverse: RectangularBinaryMatrix,
}

struct Slab {
    map: MmapMut,
    _file: Option<std::fs::File>,
}

impl Slab {
    fn new(cfg: &ArrayConfig, bytes: usize) -> Result<Self> {
        match cfg.allocation {
            Allocation::Anonymous => {
                let map = MmapOptions::new()
                    .len(bytes)
                    .map_anon()
                    .map_err(|e| Error::io("<anonymous slab>", e))?;
                Ok(Self { map, _file: None })
            }
            Allocation::FileBacked => {
                let path = cfg.backing_file.clone().ok_or_else(|| {
                    Error::Domain("file-backed slab requires a backing path".into())
                })?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(|e| Error::io(&path, e))?;
                file.set_len(bytes as u64).map_err(|e| Error::io(&path, e))?;
                // SAFETY: private file mapping owned by this process.
                let map = unsafe { MmapOptions::new().map_mut(&file) }
                    .map_err(|e| Error::io(&path, e))?;
                Ok(Self {
                    map,
                    _file: Some(file),
                })
            }
        }
    }

    fn as_atomics(&self) -> &[AtomicU64] {
        // SAFETY: the mapping is zero-initialized, 8-byte aligned (page
        // aligned), lives as long as self, and is only ever accessed through
        // atomic operations.
        unsafe {
            std::slice::from_raw_parts(self.map.as_ptr() as *const AtomicU64, self.map.len() / 8)
        }
    }
}

impl CountArray {
    pub fn new(cfg: &ArrayConfig, rng: &mut impl RngCore) -> Result<Self> {
        if cfg.key_bits == 0 || cfg.key_bits > 64 {
            return Err(Error::OutOfRange(format!(
                "key width {} not in 1..=64",
                cfg.key_bits
            )));
        }
        if cfg.size == 0 {
            return Err(Error::OutOfRange("hash size must be non-zero".into()));
        }
        let size = cfg.size.next_power_of_two();
        let lsize = size.trailing_zeros();
        if lsize > cfg.key_bits {
            return Err(Error::OutOfRange(format!(
                "table of 2^{} slots exceeds a {}-bit key space",
                lsize, cfg.key_bits
            )));
        }
        let value_bits = match cfg.kind {
            CounterKind::Count => cfg.counter_bits,
            CounterKind::Weight => 32,
        };
        if value_bits == 0 || value_bits > 60 {
            return Err(Error::OutOfRange(format!(
                "counter width {} not in 1..=60",
                value_bits
            )));
        }
        // codes 1..=reprobe_limit+1 identify heads, all-ones marks a
        // continuation slot, so the field needs to span reprobe_limit+3 values
        let offset_bits = 64 - (cfg.reprobe_limit as u64 + 2).leading_zeros();
        let stored_bits = cfg.key_bits - lsize;
        let key_field_bits = stored_bits + offset_bits;
        let key_shift = value_bits + 2;
        if key_shift + key_field_bits > 64 {
            return Err(Error::OutOfRange(format!(
                "slot layout overflows a word: {} value bits + {} key field bits",
                value_bits, key_field_bits
            )));
        }
        let strides = (0..=cfg.reprobe_limit as u64)
            .map(|o| o * (o + 1) / 2)
            .collect();
        let mut matrix = RectangularBinaryMatrix::new(cfg.key_bits, cfg.key_bits)?;
        let inverse = matrix.randomize_pseudo_inverse(rng);
        let slab = Slab::new(cfg, (size as usize) * 8)?;
        Ok(Self {
            slab,
            size_mask: size - 1,
            lsize,
            key_bits: cfg.key_bits,
            reprobe_limit: cfg.reprobe_limit,
            strides,
            offset_bits,
            cont_code: ones(offset_bits),
            key_field_mask: ones(key_field_bits),
            key_shift,
            value_bits,
            value_mask: ones(value_bits),
            large_bit: 1u64 << value_bits,
            lock_bit: 1u64 << (value_bits + 1),
            kind: cfg.kind,
            matrix,
            inverse,
        })
    }

    pub fn size(&self) -> u64 {
        self.size_mask + 1
    }

    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }

    pub fn counter_kind(&self) -> CounterKind {
        self.kind
    }

    pub fn matrix(&self) -> &RectangularBinaryMatrix {
        &self.matrix
    }

    fn slots(&self) -> &[AtomicU64] {
        self.slab.as_atomics()
    }

    fn slot_index(&self, bucket: u64, o: u32) -> usize {
        ((bucket.wrapping_add(self.strides[o as usize])) & self.size_mask) as usize
    }

    fn head_field(&self, stored: u64, o: u32) -> u64 {
        (stored << self.offset_bits) | (o as u64 + 1)
    }

    fn cont_field(&self, stored: u64) -> u64 {
        (stored << self.offset_bits) | self.cont_code
    }

    fn field_of(&self, w: u64) -> u64 {
        (w >> self.key_shift) & self.key_field_mask
    }

    pub fn add(&self, key: u64, delta: u64) -> Result<bool> {
        debug_assert_eq!(self.kind, CounterKind::Count);
        let h = self.matrix.apply(key);
        let bucket = h & self.size_mask;
        let stored = h >> self.lsize;
        let slots = self.slots();
        let sat = self.value_mask;
        for o in 0..=self.reprobe_limit {
            let idx = self.slot_index(bucket, o);
            let field = self.head_field(stored, o);
            let slot = &slots[idx];
            let mut w = slot.load(Ordering::Acquire);
            loop {
                if w == 0 {
                    let new = if delta < sat {
                        (field << self.key_shift) | delta
                    } else {
                        (field << self.key_shift) | self.lock_bit | self.large_bit | sat
                    };
                    match slot.compare_exchange(0, new, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(_) => {
                            if delta >= sat {
                                let res = self.chain_add(bucket, stored, o, delta - sat);
                                self.unlock(slot);
                                res?;
                            }
                            return Ok(true);
                        }
                        Err(cur) => {
                            w = cur;
                            continue;
                        }
                    }
                }
                if self.field_of(w) == field {
                    self.bump(slot, bucket, stored, o, delta)?;
                    return Ok(false);
                }
                break;
            }
        }
        Err(Error::TableFull {
            reprobes: self.reprobe_limit,
        })
    }

    fn bump(&self, slot: &AtomicU64, bucket: u64, stored: u64, o: u32, delta: u64) -> Result<()> {
        let sat = self.value_mask;
        loop {
            let w = slot.load(Ordering::Acquire);
            if w & self.lock_bit != 0 {
                std::hint::spin_loop();
                continue;
            }
            let val = w & self.value_mask;
            let room = sat - val;
            if delta < room {
                if slot
                    .compare_exchange_weak(w, w + delta, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            // value widening: serialize through the slot's lock bit
            if slot
                .compare_exchange(w, w | self.lock_bit, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let res = if val == sat {
                self.chain_add(bucket, stored, o, delta)
            } else {
                let widened =
                    (w & !self.value_mask) | self.lock_bit | self.large_bit | sat;
                slot.store(widened, Ordering::Release);
                self.chain_add(bucket, stored, o, delta - room)
            };
            self.unlock(slot);
            return res;
        }
    }

    fn unlock(&self, slot: &AtomicU64) {
        slot.fetch_and(!self.lock_bit, Ordering::Release);
    }

    // Locate or claim the next continuation slot at probe offsets *o and up.
    fn chain_slot(&self, bucket: u64, stored: u64, o: &mut u32) -> Result<&AtomicU64> {
        let cont = self.cont_field(stored);
        let slots = self.slots();
        while *o <= self.reprobe_limit {
            let idx = self.slot_index(bucket, *o);
            *o += 1;
            let s = &slots[idx];
            loop {
                let w = s.load(Ordering::Acquire);
                if w == 0 {
                    if s.compare_exchange(
                        0,
                        cont << self.key_shift,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                    {
                        return Ok(s);
                    }
                    continue;
                }
                if self.field_of(w) == cont {
                    return Ok(s);
                }
                break;
            }
        }
        Err(Error::TableFull {
            reprobes: self.reprobe_limit,
        })
    }

    // Caller holds the head's lock bit. The chain stores the excess over the
    // saturated head value as base-2^v digits in probe order.
    fn chain_add(&self, bucket: u64, stored: u64, head_o: u32, mut carry: u64) -> Result<()> {
        let base = self.value_mask + 1;
        let mut o = head_o + 1;
        while carry > 0 {
            let s = self.chain_slot(bucket, stored, &mut o)?;
            let w = s.load(Ordering::Acquire);
            let digit = w & self.value_mask;
            let sum = digit + carry % base;
            carry = carry / base + (sum >> self.value_bits);
            let mut new = (w & !self.value_mask) | (sum & self.value_mask);
            if carry > 0 {
                new |= self.large_bit;
            }
            s.store(new, Ordering::Release);
        }
        Ok(())
    }

    fn chain_value(&self, bucket: u64, stored: u64, head_o: u32) -> u64 {
        let cont = self.cont_field(stored);
        let slots = self.slots();
        let mut total: u128 = 0;
        let mut shift = 0u32;
        let mut more = true;
        let mut o = head_o + 1;
        while more && o <= self.reprobe_limit {
            let idx = self.slot_index(bucket, o);
            let w = slots[idx].load(Ordering::Acquire);
            if w != 0 && self.field_of(w) == cont {
                if shift < 128 {
                    total += ((w & self.value_mask) as u128) << shift;
                }
                shift += self.value_bits;
                more = w & self.large_bit != 0;
            }
            o += 1;
        }
        total.min(u64::MAX as u128) as u64
    }

    pub fn add_weight(&self, key: u64, weight: f32) -> Result<bool> {
        debug_assert_eq!(self.kind, CounterKind::Weight);
        let h = self.matrix.apply(key);
        let bucket = h & self.size_mask;
        let stored = h >> self.lsize;
        let slots = self.slots();
        for o in 0..=self.reprobe_limit {
            let idx = self.slot_index(bucket, o);
            let field = self.head_field(stored, o);
            let slot = &slots[idx];
            let mut w = slot.load(Ordering::Acquire);
            loop {
                if w == 0 {
                    let new = (field << self.key_shift) | weight.to_bits() as u64;
                    match slot.compare_exchange(0, new, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(_) => return Ok(true),
                        Err(cur) => {
                            w = cur;
                            continue;
                        }
                    }
                }
                if self.field_of(w) == field {
                    loop {
                        let w = slot.load(Ordering::Acquire);
                        let cur = f32::from_bits((w & self.value_mask) as u32);
                        let new =
                            (w & !self.value_mask) | (cur + weight).to_bits() as u64;
                        if slot
                            .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
                            .is_ok()
                        {
                            return Ok(false);
                        }
                    }
                }
                break;
            }
        }
        Err(Error::TableFull {
            reprobes: self.reprobe_limit,
        })
    }

    // Quiescent read of a single key's raw value (count, or f32 bits in
    // weight mode).
    pub fn lookup(&self, key: u64) -> Option<u64> {
        let h = self.matrix.apply(key);
        let bucket = h & self.size_mask;
        let stored = h >> self.lsize;
        let slots = self.slots();
        for o in 0..=self.reprobe_limit {
            let idx = self.slot_index(bucket, o);
            let w = slots[idx].load(Ordering::Acquire);
            if w == 0 {
                return None;
            }
            if self.field_of(w) == self.head_field(stored, o) {
                return Some(self.slot_value(w, bucket, stored, o));
            }
        }
        None
    }

    fn slot_value(&self, w: u64, bucket: u64, stored: u64, o: u32) -> u64 {
        let val = w & self.value_mask;
        if self.kind == CounterKind::Count && val == self.value_mask && w & self.large_bit != 0 {
            self.value_mask
                .saturating_add(self.chain_value(bucket, stored, o))
        } else {
            val
        }
    }

    // Walk all slots in index order, reconstructing keys through the inverse
    // matrix. The table must be quiescent.
    pub fn entries(&self) -> Entries<'_> {
        self.entries_range(0, self.size() as usize)
    }

    // Walk slots [lo, hi); entries whose head slot lies in the range are
    // yielded exactly once, so disjoint ranges partition the table.
    pub fn entries_range(&self, lo: usize, hi: usize) -> Entries<'_> {
        Entries {
            array: self,
            idx: lo,
            end: hi.min(self.size() as usize),
        }
    }

    // Rezero the slab for continued counting. The table must be quiescent.
    pub fn reset(&self) {
        for s in self.slots() {
            s.store(0, Ordering::Relaxed);
        }
    }
}

pub struct Entries<'a> {
    array: &'a CountArray,
    idx: usize,
    end: usize,
}

impl Iterator for Entries<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        let a = self.array;
        let slots = a.slots();
        while self.idx < self.end {
            let i = self.idx;
            self.idx += 1;
            let w = slots[i].load(Ordering::Relaxed);
            if w == 0 {
                continue;
            }
            let field = a.field_of(w);
            let code = field & a.cont_code;
            if code == 0 || code == a.cont_code {
                continue;
            }
            let o = (code - 1) as u32;
            if o > a.reprobe_limit {
                continue;
            }
            let stored = field >> a.offset_bits;
            let bucket = (i as u64).wrapping_sub(a.strides[o as usize]) & a.size_mask;
            let h = (stored << a.lsize) | bucket;
            let key = a.inverse.apply(h);
            return Some((key, a.slot_value(w, bucket, stored, o)));
        }
        None
    }
}
