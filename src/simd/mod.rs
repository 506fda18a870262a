#[cfg(target_arch = "aarch64")]
mod aarch64_neon;
mod scalar;
#[cfg(target_arch = "x86_64")]
mod x86_sse2;

pub use scalar::{times_loop, times_u128};

pub fn matrix_times(columns: &[u64], v: &[u64]) -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        return x86_sse2::times_sse2(columns, v);
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        return aarch64_neon::times_neon(columns, v);
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        scalar::times_u128(columns, v)
    }
}
