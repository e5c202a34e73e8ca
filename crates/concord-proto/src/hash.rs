/// FNV-1a hash functions.
///
/// Every node must place mapping ids on the mastership ring identically,
/// so the hash is fixed here rather than left to `std::hash`.

/// FNV-1a 64-bit initial basis.
const FNV1A_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
const FNV_64_PRIME: u64 = 0x0100_0000_01b3;

/// Compute FNV-1a hash over a byte buffer.
#[inline]
pub fn fnv_64a_buf(buf: &[u8], mut hval: u64) -> u64 {
    for &byte in buf {
        hval ^= byte as u64;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Compute FNV-1a hash over a single u64 value.
#[inline]
pub fn fnv_64a_64(val: u64, mut hval: u64) -> u64 {
    for i in 0..8 {
        hval ^= (val >> (i * 8)) & 0xff;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Hash a byte buffer to a u64 (double-hash for better distribution).
#[inline]
pub fn hash_bytes(buf: &[u8]) -> u64 {
    let hval = fnv_64a_buf(buf, FNV1A_64_INIT);
    fnv_64a_64(hval, hval)
}

/// Hash a string key, such as a node name or mapping id.
#[inline]
pub fn hash_str(key: &str) -> u64 {
    hash_bytes(key.as_bytes())
}

/// Hash the next value in a chain.
#[inline]
pub fn hash_next(hval: u64) -> u64 {
    fnv_64a_64(hval, hval)
}
