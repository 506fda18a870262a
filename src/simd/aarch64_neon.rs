use std::arch::aarch64::*;

// Two columns per 128-bit lane; lane 0 is column c-2-j (bit j+1), lane 1 is
// column c-1-j (bit j).
#[target_feature(enable = "neon")]
pub unsafe fn times_neon(columns: &[u64], v: &[u64]) -> u64 {
    let c = columns.len();
    let mut acc = vdupq_n_u64(0);
    let mut res = 0u64;
    let mut j = 0usize;
    while j + 1 < c {
        let w = v[j >> 6] >> (j & 63);
        let m = vcombine_u64(
            vcreate_u64(((w >> 1) & 1).wrapping_neg()),
            vcreate_u64((w & 1).wrapping_neg()),
        );
        let cols = vld1q_u64(columns.as_ptr().add(c - 2 - j));
        acc = veorq_u64(acc, vandq_u64(cols, m));
        j += 2;
    }
    if j < c {
        let bit = (v[j >> 6] >> (j & 63)) & 1;
        res = columns[c - 1 - j] & bit.wrapping_neg();
    }
    res ^ vgetq_lane_u64(acc, 0) ^ vgetq_lane_u64(acc, 1)
}
