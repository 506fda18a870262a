use crate::core::error::{Error, Result};
use crate::core::model::ones;
use crate::simd;
use rand::RngCore;

// An r x c matrix over GF(2), stored column-major: column i is a 64-bit word
// whose low r bits are the column vector. Bit j of an input vector selects
// column c-1-j, so a "low identity" matrix (rightmost r x r block = identity)
// passes the low r input bits through unchanged.
//
// A matrix with c > r stands for the square c x c map that leaves the high
// c-r input bits alone and mixes them into the low r output bits; pseudo
// multiplication is composition of such maps and the low-identity matrix is
// its neutral element.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RectangularBinaryMatrix {
    columns: Vec<u64>,
    r: u32,
}

fn check_dims(r: u32, c: u32) -> Result<()> {
    if r == 0 || r > 64 || c == 0 || c < r {
        return Err(Error::OutOfRange(format!(
            "invalid matrix dimensions {}x{}",
            r, c
        )));
    }
    Ok(())
}

impl RectangularBinaryMatrix {
    pub fn new(r: u32, c: u32) -> Result<Self> {
        check_dims(r, c)?;
        Ok(Self {
            columns: vec![0; c as usize],
            r,
        })
    }

    pub fn from_raw(words: &[u64], r: u32, c: u32) -> Result<Self> {
        check_dims(r, c)?;
        if words.len() != c as usize {
            return Err(Error::OutOfRange(format!(
                "expected {} column words, got {}",
                c,
                words.len()
            )));
        }
        let mask = ones(r);
        Ok(Self {
            columns: words.iter().map(|w| w & mask).collect(),
            r,
        })
    }

    pub fn r(&self) -> u32 {
        self.r
    }

    pub fn c(&self) -> u32 {
        self.columns.len() as u32
    }

    pub fn column(&self, i: u32) -> u64 {
        self.columns[i as usize]
    }

    pub fn columns(&self) -> &[u64] {
        &self.columns
    }

    pub fn is_zero(&self) -> bool {
        self.columns.iter().all(|&w| w == 0)
    }

    pub fn set_low_identity(&mut self) {
        let c = self.columns.len();
        self.columns.fill(0);
        for i in 0..self.r as usize {
            self.columns[c - 1 - i] = 1u64 << i;
        }
    }

    pub fn is_low_identity(&self) -> bool {
        let c = self.columns.len();
        let e = c - self.r as usize;
        for i in 0..self.r as usize {
            if self.columns[c - 1 - i] != 1u64 << i {
                return false;
            }
        }
        self.columns[..e].iter().all(|&w| w == 0)
    }

    pub fn randomize(&mut self, rng: &mut impl RngCore) {
        let mask = ones(self.r);
        for col in &mut self.columns {
            *col = rng.next_u64() & mask;
        }
    }

    // v holds c bits little-endian across words.
    pub fn times(&self, v: &[u64]) -> u64 {
        debug_assert!(v.len() * 64 >= self.columns.len());
        simd::matrix_times(&self.columns, v)
    }

    pub fn times_loop(&self, v: &[u64]) -> u64 {
        simd::times_loop(&self.columns, v)
    }

    pub fn times_u128(&self, v: &[u64]) -> u64 {
        simd::times_u128(&self.columns, v)
    }

    // Single-word convenience for square hash matrices (c <= 64).
    pub fn apply(&self, v: u64) -> u64 {
        debug_assert!(self.columns.len() <= 64);
        self.times(&[v])
    }

    // XOR of the right-block columns selected by the low r bits of x.
    fn apply_right(&self, mut x: u64) -> u64 {
        let c = self.columns.len();
        let mut res = 0u64;
        while x != 0 {
            let t = x.trailing_zeros() as usize;
            res ^= self.columns[c - 1 - t];
            x &= x - 1;
        }
        res
    }

    // Block composition [A_l|A_r] o [B_l|B_r] = [A_l ^ A_r*B_l | A_r*B_r].
    pub fn pseudo_multiplication(&self, rhs: &Self) -> Result<Self> {
        if self.r != rhs.r || self.columns.len() != rhs.columns.len() {
            return Err(Error::Domain(format!(
                "pseudo multiplication dimension mismatch: {}x{} vs {}x{}",
                self.r,
                self.c(),
                rhs.r,
                rhs.c()
            )));
        }
        let c = self.columns.len();
        let r = self.r as usize;
        let e = c - r;
        let mut out = vec![0u64; c];
        for t in 0..r {
            out[c - 1 - t] = self.apply_right(rhs.columns[c - 1 - t]);
        }
        for j in 0..e {
            out[e - 1 - j] = self.columns[e - 1 - j] ^ self.apply_right(rhs.columns[e - 1 - j]);
        }
        Ok(Self {
            columns: out,
            r: self.r,
        })
    }

    // Rank of the represented square map: (c - r) + rank of the right block.
    pub fn pseudo_rank(&self) -> u32 {
        let c = self.columns.len();
        let mut pivots = [0u64; 64];
        let mut rank = 0u32;
        for t in 0..self.r as usize {
            let mut x = self.columns[c - 1 - t];
            while x != 0 {
                let h = (63 - x.leading_zeros()) as usize;
                if pivots[h] == 0 {
                    pivots[h] = x;
                    rank += 1;
                    break;
                }
                x ^= pivots[h];
            }
        }
        (c - self.r as usize) as u32 + rank
    }

    // B with B pseudomult self = low identity; requires full pseudo-rank.
    pub fn pseudo_inverse(&self) -> Result<Self> {
        let c = self.columns.len();
        let r = self.r as usize;
        let e = c - r;
        // Gauss-Jordan on the rows of the right block, augmented with I.
        let mut rows = vec![0u64; r];
        for t in 0..r {
            let col = self.columns[c - 1 - t];
            for (i, row) in rows.iter_mut().enumerate() {
                if (col >> i) & 1 == 1 {
                    *row |= 1u64 << t;
                }
            }
        }
        let mut aug: Vec<u64> = (0..r).map(|i| 1u64 << i).collect();
        for t in 0..r {
            let p = (t..r)
                .find(|&i| (rows[i] >> t) & 1 == 1)
                .ok_or_else(|| Error::Domain("singular matrix has no pseudo-inverse".into()))?;
            rows.swap(t, p);
            aug.swap(t, p);
            for i in 0..r {
                if i != t && (rows[i] >> t) & 1 == 1 {
                    rows[i] ^= rows[t];
                    aug[i] ^= aug[t];
                }
            }
        }
        let mut inv_right = vec![0u64; r];
        for (t, inv) in inv_right.iter_mut().enumerate() {
            for (i, a) in aug.iter().enumerate() {
                if (a >> t) & 1 == 1 {
                    *inv |= 1u64 << i;
                }
            }
        }
        let mut out = vec![0u64; c];
        for t in 0..r {
            out[c - 1 - t] = inv_right[t];
        }
        for j in 0..e {
            let mut x = self.columns[e - 1 - j];
            let mut acc = 0u64;
            while x != 0 {
                let t = x.trailing_zeros() as usize;
                acc ^= inv_right[t];
                x &= x - 1;
            }
            out[e - 1 - j] = acc;
        }
        Ok(Self {
            columns: out,
            r: self.r,
        })
    }

    pub fn randomize_pseudo_inverse(&mut self, rng: &mut impl RngCore) -> Self {
        loop {
            self.randomize(rng);
            if let Ok(inv) = self.pseudo_inverse() {
                return inv;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn init_sizes() {
        let m = RectangularBinaryMatrix::new(5, 60).unwrap();
        assert_eq!(5, m.r());
        assert_eq!(60, m.c());
        assert!(m.is_zero());

        assert!(matches!(
            RectangularBinaryMatrix::new(100, 100),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(
            RectangularBinaryMatrix::new(0, 100),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(
            RectangularBinaryMatrix::new(10, 0),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(
            RectangularBinaryMatrix::new(10, 6),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn from_raw_masks_columns() {
        let mut rng = StdRng::seed_from_u64(1);
        let raw: Vec<u64> = (0..80).map(|_| rng.next_u64()).collect();
        let m = RectangularBinaryMatrix::from_raw(&raw, 19, 80).unwrap();
        assert_eq!(19, m.r());
        assert_eq!(80, m.c());
        let mask = (1u64 << 19) - 1;
        for i in 0..80 {
            assert_eq!(raw[i] & mask, m.column(i as u32));
        }
    }

    #[test]
    fn low_identity_structure() {
        let mut m = RectangularBinaryMatrix::new(30, 100).unwrap();
        assert!(!m.is_low_identity());

        m.set_low_identity();
        assert_eq!(1, m.column(m.c() - 1));
        let c = m.c();
        for i in (c - m.r() + 1..c).rev() {
            assert_eq!(m.column(i) << 1, m.column(i - 1));
        }
        for i in 0..c - m.r() {
            assert_eq!(0, m.column(i));
        }
        assert!(m.is_low_identity());

        let mut rng = StdRng::seed_from_u64(2);
        m.randomize(&mut rng);
        assert!(!m.is_low_identity());
    }

    #[test]
    fn times_all_ones() {
        let mut rng = StdRng::seed_from_u64(3);
        for &(r, c) in &[(51u32, 101u32), (50, 100), (30, 64), (64, 64)] {
            let mut m = RectangularBinaryMatrix::new(r, c).unwrap();
            m.randomize(&mut rng);
            let v = [u64::MAX; 2];
            let mut expect = 0u64;
            for i in 0..c {
                expect ^= m.column(i);
            }
            assert_eq!(expect, m.times_loop(&v));
        }
    }

    #[test]
    fn times_every_other_one() {
        let mut rng = StdRng::seed_from_u64(4);
        let v = [0xaaaaaaaaaaaaaaaau64; 2];

        // odd column count: odd bit positions hit odd column indices
        let mut mo = RectangularBinaryMatrix::new(51, 101).unwrap();
        mo.randomize(&mut rng);
        let mut expect = 0u64;
        for i in (1..mo.c()).step_by(2) {
            expect ^= mo.column(i);
        }
        assert_eq!(expect, mo.times_loop(&v));

        // even column count: odd bit positions hit even column indices
        let mut me = RectangularBinaryMatrix::new(50, 100).unwrap();
        me.randomize(&mut rng);
        let mut expect = 0u64;
        for i in (0..me.c()).step_by(2) {
            expect ^= me.column(i);
        }
        assert_eq!(expect, me.times_loop(&v));
    }

    #[test]
    fn times_variants_agree() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            let r = 2 * (rng.gen_range(0..31) + 1);
            let c = 2 * rng.gen_range(0..100) + r;
            let mut m = RectangularBinaryMatrix::new(r, c).unwrap();
            m.randomize(&mut rng);
            let words = (c as usize).div_ceil(64);
            let v: Vec<u64> = (0..words).map(|_| rng.next_u64()).collect();
            let reference = m.times_loop(&v);
            assert_eq!(reference, m.times_u128(&v));
            assert_eq!(reference, m.times(&v));
        }
    }

    #[test]
    fn pseudo_multiplication_dimensions() {
        let m = RectangularBinaryMatrix::new(30, 100).unwrap();
        let m1 = RectangularBinaryMatrix::new(32, 100).unwrap();
        let m2 = RectangularBinaryMatrix::new(30, 98).unwrap();
        assert!(matches!(
            m.pseudo_multiplication(&m1),
            Err(Error::Domain(_))
        ));
        assert!(matches!(
            m.pseudo_multiplication(&m2),
            Err(Error::Domain(_))
        ));
    }

    #[test]
    fn pseudo_multiplication_identity() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut m = RectangularBinaryMatrix::new(30, 100).unwrap();
        m.randomize(&mut rng);
        let mut i = RectangularBinaryMatrix::new(30, 100).unwrap();
        i.set_low_identity();

        assert_eq!(m, i.pseudo_multiplication(&m).unwrap());
        assert_eq!(m, m.pseudo_multiplication(&i).unwrap());
    }

    #[test]
    fn pseudo_multiplication_parity() {
        let nb_rows = 30u32;
        for &nb_cols in &[50u32, 70, 126, 130, 64, 128] {
            let bits = (1u64 << 18) - 1;
            let cols = vec![bits; nb_cols as usize];
            let m = RectangularBinaryMatrix::from_raw(&cols, nb_rows, nb_cols).unwrap();
            let p = m.pseudo_multiplication(&m).unwrap();
            let parity = (bits.count_ones() & 1) == 1;
            for i in 0..nb_cols - nb_rows {
                assert_eq!(if parity { 0 } else { bits }, p.column(i));
            }
            for i in nb_cols - nb_rows..nb_cols {
                assert_eq!(if parity { bits } else { 0 }, p.column(i));
            }
        }
    }

    #[test]
    fn pseudo_inverse_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut full_rank = 0;
        let mut singular = 0;
        for _ in 0..200 {
            let r = 2 * (rng.gen_range(0..31) + 1);
            let c = 2 * rng.gen_range(0..100) + r;
            let mut m = RectangularBinaryMatrix::new(r, c).unwrap();
            m.randomize(&mut rng);
            let snapshot = m.clone();
            if m.pseudo_rank() != c {
                singular += 1;
                assert!(matches!(m.pseudo_inverse(), Err(Error::Domain(_))));
            } else {
                full_rank += 1;
                let inv = m.pseudo_inverse().unwrap();
                let prod = inv.pseudo_multiplication(&m).unwrap();
                assert!(prod.is_low_identity());
            }
            assert_eq!(snapshot, m);
        }
        assert_eq!(200, full_rank + singular);
        assert_ne!(0, full_rank);
    }

    #[test]
    fn pseudo_rank_bounds() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut m = RectangularBinaryMatrix::new(50, 100).unwrap();
        for _ in 0..10 {
            m.randomize(&mut rng);
            let snapshot = m.clone();
            let rank = m.pseudo_rank();
            assert!(rank <= m.c());
            assert_eq!(snapshot, m);
        }
    }

    #[test]
    fn randomize_pseudo_inverse_is_full_rank() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut m = RectangularBinaryMatrix::new(50, 100).unwrap();
        for _ in 0..10 {
            let inv = m.randomize_pseudo_inverse(&mut rng);
            assert_eq!(m.c(), m.pseudo_rank());
            assert_eq!(m.c(), inv.pseudo_rank());
            assert!(m
                .pseudo_multiplication(&inv)
                .unwrap()
                .is_low_identity());
        }
    }

    #[test]
    fn square_apply_round_trips_through_inverse() {
        let mut rng = StdRng::seed_from_u64(10);
        for &bits in &[8u32, 22, 40, 64] {
            let mut m = RectangularBinaryMatrix::new(bits, bits).unwrap();
            let inv = m.randomize_pseudo_inverse(&mut rng);
            for _ in 0..100 {
                let key = rng.next_u64() & ones(bits);
                assert_eq!(key, inv.apply(m.apply(key)));
            }
        }
    }
}
