// Key hash functions. The function id is stored in the DB header and is
// immutable once the file holds entries, so ids are stable across versions
// and the table is append-only.

use md5::{Digest, Md5};
use sha1::Sha1;

use crate::common::HashVal;

pub type HashFn = fn(&[u8]) -> HashVal;

pub const HASH_CRC32: u8 = 0;
pub const HASH_EJB: u8 = 1;
pub const HASH_PHONG: u8 = 2;
pub const HASH_OZ: u8 = 3;
pub const HASH_TOREK: u8 = 4;
pub const HASH_FNV: u8 = 5;
pub const HASH_STL: u8 = 6;
pub const HASH_MD5: u8 = 7;
pub const HASH_SHA1: u8 = 8;
pub const HASH_JENKINS: u8 = 9;
pub const HASH_HSIEH: u8 = 10;

pub const DEFAULT_HASH: u8 = HASH_FNV;

pub const HASH_FUNC_COUNT: usize = 11;

pub static HASH_FUNCS: [HashFn; HASH_FUNC_COUNT] = [
    hash_crc32,
    hash_ejb,
    hash_phong,
    hash_oz,
    hash_torek,
    hash_fnv1a,
    hash_stl,
    hash_md5,
    hash_sha1,
    hash_jenkins,
    hash_hsieh,
];

pub static HASH_FUNC_NAMES: [&str; HASH_FUNC_COUNT] = [
    "CRC32", "EJB", "PHONG", "OZ", "TOREK", "FNV", "STL", "MD5", "SHA1", "JENKINS", "HSIEH",
];

pub fn hash_func(id: u8) -> Option<HashFn> {
    HASH_FUNCS.get(id as usize).copied()
}

fn hash_crc32(data: &[u8]) -> HashVal {
    crc32fast::hash(data)
}

fn hash_ejb(data: &[u8]) -> HashVal {
    // PJW-style with high-nibble folding.
    let mut h: u32 = 0;
    for &b in data {
        h = (h << 4).wrapping_add(b as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
            h &= !g;
        }
    }
    h
}

fn hash_phong(data: &[u8]) -> HashVal {
    let mut h: u32 = 0;
    for &b in data {
        h = h.wrapping_mul(129).wrapping_add(b as u32).wrapping_add(1);
    }
    h
}

fn hash_oz(data: &[u8]) -> HashVal {
    // sdbm polynomial (x65599).
    let mut h: u32 = 0;
    for &b in data {
        h = h.wrapping_mul(65599).wrapping_add(b as u32);
    }
    h
}

fn hash_torek(data: &[u8]) -> HashVal {
    let mut h: u32 = 0;
    for &b in data {
        h = h.wrapping_mul(33).wrapping_add(b as u32);
    }
    h
}

fn hash_fnv1a(data: &[u8]) -> HashVal {
    let mut h: u32 = 0x811c_9dc5;
    for &b in data {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

fn hash_stl(data: &[u8]) -> HashVal {
    let mut h: u32 = 0;
    for &b in data {
        h = h.wrapping_mul(5).wrapping_add(b as u32);
    }
    h
}

fn hash_md5(data: &[u8]) -> HashVal {
    let digest = Md5::digest(data);
    u32::from_le_bytes(digest[..4].try_into().unwrap())
}

fn hash_sha1(data: &[u8]) -> HashVal {
    let digest = Sha1::digest(data);
    u32::from_le_bytes(digest[..4].try_into().unwrap())
}

fn hash_jenkins(data: &[u8]) -> HashVal {
    // One-at-a-time.
    let mut h: u32 = 0;
    for &b in data {
        h = h.wrapping_add(b as u32);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}

fn hash_hsieh(data: &[u8]) -> HashVal {
    // SuperFastHash.
    let mut h: u32 = data.len() as u32;
    if data.is_empty() {
        return 0;
    }
    let mut chunks = data.chunks_exact(4);
    for c in &mut chunks {
        let lo = u16::from_le_bytes([c[0], c[1]]) as u32;
        let hi = u16::from_le_bytes([c[2], c[3]]) as u32;
        h = h.wrapping_add(lo);
        let tmp = (hi << 11) ^ h;
        h = (h << 16) ^ tmp;
        h = h.wrapping_add(h >> 11);
    }
    let rem = chunks.remainder();
    match rem.len() {
        3 => {
            h = h.wrapping_add(u16::from_le_bytes([rem[0], rem[1]]) as u32);
            h ^= h << 16;
            h ^= (rem[2] as u32) << 18;
            h = h.wrapping_add(h >> 11);
        }
        2 => {
            h = h.wrapping_add(u16::from_le_bytes([rem[0], rem[1]]) as u32);
            h ^= h << 11;
            h = h.wrapping_add(h >> 17);
        }
        1 => {
            h = h.wrapping_add(rem[0] as u32);
            h ^= h << 10;
            h = h.wrapping_add(h >> 1);
        }
        _ => {}
    }
    h ^= h << 3;
    h = h.wrapping_add(h >> 5);
    h ^= h << 4;
    h = h.wrapping_add(h >> 17);
    h ^= h << 25;
    h.wrapping_add(h >> 6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_vectors() {
        assert_eq!(hash_fnv1a(b""), 0x811c_9dc5);
        assert_eq!(hash_fnv1a(b"a"), 0xe40c_292c);
    }

    #[test]
    fn test_crc32_vector() {
        assert_eq!(hash_crc32(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn test_digest_hashes_use_leading_bytes() {
        // md5("") = d41d8cd9..., sha1("") = da39a3ee...
        assert_eq!(hash_md5(b""), u32::from_le_bytes([0xd4, 0x1d, 0x8c, 0xd9]));
        assert_eq!(hash_sha1(b""), u32::from_le_bytes([0xda, 0x39, 0xa3, 0xee]));
    }

    #[test]
    fn test_all_funcs_deterministic() {
        for (i, f) in HASH_FUNCS.iter().enumerate() {
            let a = f(b"some key");
            let b = f(b"some key");
            assert_eq!(a, b, "{} not deterministic", HASH_FUNC_NAMES[i]);
        }
    }

    #[test]
    fn test_table_lookup() {
        assert!(hash_func(DEFAULT_HASH).is_some());
        assert!(hash_func(HASH_FUNC_COUNT as u8).is_none());
    }
}
