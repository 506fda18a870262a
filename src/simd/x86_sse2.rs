use std::arch::x86_64::*;

// Two columns per 128-bit lane. Memory order of a pair is
// [column c-2-j, column c-1-j], so the low lane pairs with bit j+1 and the
// high lane with bit j.
#[target_feature(enable = "sse2")]
pub unsafe fn times_sse2(columns: &[u64], v: &[u64]) -> u64 {
    let c = columns.len();
    let mut acc = _mm_setzero_si128();
    let mut res = 0u64;
    let mut j = 0usize;
    while j + 1 < c {
        let w = v[j >> 6] >> (j & 63);
        let m = _mm_set_epi64x(
            ((w & 1).wrapping_neg()) as i64,
            (((w >> 1) & 1).wrapping_neg()) as i64,
        );
        let cols = _mm_loadu_si128(columns.as_ptr().add(c - 2 - j) as *const __m128i);
        acc = _mm_xor_si128(acc, _mm_and_si128(cols, m));
        j += 2;
    }
    if j < c {
        let bit = (v[j >> 6] >> (j & 63)) & 1;
        res = columns[c - 1 - j] & bit.wrapping_neg();
    }
    let lo = _mm_cvtsi128_si64(acc) as u64;
    let hi = _mm_cvtsi128_si64(_mm_unpackhi_epi64(acc, acc)) as u64;
    res ^ lo ^ hi
}
