// MIT License
//
// Copyright (c) 2020 Gregory Meyer
//
// Permission is hereby granted, free of charge, to any person
// obtaining a copy of this software and associated documentation files
// (the "Software"), to deal in the Software without restriction,
// including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software,
// and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
// BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
// ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Key hashing.
//!
//! Every supported key kind binds a 64-bit non-cryptographic hash function
//! specialized for its width; byte strings use the streaming form. All
//! specializations share the same prime schedule and final avalanche, so a
//! fixed-width key and its little-endian byte representation hash to the
//! same digest.

const PRIME_1: u64 = 11_400_714_785_074_694_791;
const PRIME_2: u64 = 14_029_467_366_897_019_727;
const PRIME_3: u64 = 1_609_587_929_392_839_161;
const PRIME_4: u64 = 9_650_029_242_287_828_579;
const PRIME_5: u64 = 2_870_177_450_012_600_261;

/// Types usable as keys of a [`HashMap`](crate::HashMap).
///
/// Implemented for the fixed-width integers, `f32`/`f64` (hashed by bit
/// pattern), `i128`/`u128`, `isize`/`usize`, and the byte-string kinds
/// `String`, `&'static str`, and `Vec<u8>`. A key type outside this set is
/// rejected at compile time by the trait bound.
///
/// Lookups compare keys with [`PartialEq`], so a floating-point key equal
/// to NaN can be inserted but never found again.
pub trait Key: PartialEq + Clone + Send + Sync + 'static {
    /// Returns the 64-bit digest of this key.
    fn hash(&self) -> u64;
}

impl Key for u8 {
    #[inline]
    fn hash(&self) -> u64 {
        hash1(*self)
    }
}

impl Key for i8 {
    #[inline]
    fn hash(&self) -> u64 {
        hash1(*self as u8)
    }
}

impl Key for u16 {
    #[inline]
    fn hash(&self) -> u64 {
        hash2(*self)
    }
}

impl Key for i16 {
    #[inline]
    fn hash(&self) -> u64 {
        hash2(*self as u16)
    }
}

impl Key for u32 {
    #[inline]
    fn hash(&self) -> u64 {
        hash4(*self)
    }
}

impl Key for i32 {
    #[inline]
    fn hash(&self) -> u64 {
        hash4(*self as u32)
    }
}

impl Key for f32 {
    #[inline]
    fn hash(&self) -> u64 {
        hash4(self.to_bits())
    }
}

impl Key for u64 {
    #[inline]
    fn hash(&self) -> u64 {
        hash8(*self)
    }
}

impl Key for i64 {
    #[inline]
    fn hash(&self) -> u64 {
        hash8(*self as u64)
    }
}

impl Key for f64 {
    #[inline]
    fn hash(&self) -> u64 {
        hash8(self.to_bits())
    }
}

impl Key for usize {
    #[inline]
    fn hash(&self) -> u64 {
        hash8(*self as u64)
    }
}

impl Key for isize {
    #[inline]
    fn hash(&self) -> u64 {
        hash8(*self as u64)
    }
}

impl Key for u128 {
    #[inline]
    fn hash(&self) -> u64 {
        hash16(*self)
    }
}

impl Key for i128 {
    #[inline]
    fn hash(&self) -> u64 {
        hash16(*self as u128)
    }
}

impl Key for String {
    #[inline]
    fn hash(&self) -> u64 {
        sum64(self.as_bytes())
    }
}

impl Key for &'static str {
    #[inline]
    fn hash(&self) -> u64 {
        sum64(self.as_bytes())
    }
}

impl Key for Vec<u8> {
    #[inline]
    fn hash(&self) -> u64 {
        sum64(self)
    }
}

/// Hashes a byte string with the streaming form of the map's hash function.
///
/// Inputs of 32 bytes or more run the four-lane accumulator; shorter inputs
/// take the tail path directly. Useful as a building block for custom
/// hashers installed with
/// [`HashMap::set_hasher`](crate::HashMap::set_hasher).
pub fn sum64(bytes: &[u8]) -> u64 {
    let mut b = bytes;

    let mut h = if b.len() >= 32 {
        let mut v1 = PRIME_1.wrapping_add(PRIME_2);
        let mut v2 = PRIME_2;
        let mut v3 = 0u64;
        let mut v4 = 0u64.wrapping_sub(PRIME_1);

        while b.len() >= 32 {
            v1 = round(v1, read_u64(&b[0..8]));
            v2 = round(v2, read_u64(&b[8..16]));
            v3 = round(v3, read_u64(&b[16..24]));
            v4 = round(v4, read_u64(&b[24..32]));
            b = &b[32..];
        }

        let mut h = v1
            .rotate_left(1)
            .wrapping_add(v2.rotate_left(7))
            .wrapping_add(v3.rotate_left(12))
            .wrapping_add(v4.rotate_left(18));

        h = merge_round(h, v1);
        h = merge_round(h, v2);
        h = merge_round(h, v3);
        h = merge_round(h, v4);

        h
    } else {
        PRIME_5
    };

    h = h.wrapping_add(bytes.len() as u64);

    while b.len() >= 8 {
        h ^= round(0, read_u64(&b[..8]));
        h = h.rotate_left(27).wrapping_mul(PRIME_1).wrapping_add(PRIME_4);
        b = &b[8..];
    }

    if b.len() >= 4 {
        h ^= (read_u32(&b[..4]) as u64).wrapping_mul(PRIME_1);
        h = h.rotate_left(23).wrapping_mul(PRIME_2).wrapping_add(PRIME_3);
        b = &b[4..];
    }

    for &byte in b {
        h ^= (byte as u64).wrapping_mul(PRIME_5);
        h = h.rotate_left(11).wrapping_mul(PRIME_1);
    }

    avalanche(h)
}

fn hash1(v: u8) -> u64 {
    let mut h = PRIME_5.wrapping_add(1);

    h ^= (v as u64).wrapping_mul(PRIME_5);
    h = h.rotate_left(11).wrapping_mul(PRIME_1);

    avalanche(h)
}

fn hash2(v: u16) -> u64 {
    let b = v.to_le_bytes();
    let mut h = PRIME_5.wrapping_add(2);

    h ^= (b[0] as u64).wrapping_mul(PRIME_5);
    h = h.rotate_left(11).wrapping_mul(PRIME_1);
    h ^= (b[1] as u64).wrapping_mul(PRIME_5);
    h = h.rotate_left(11).wrapping_mul(PRIME_1);

    avalanche(h)
}

fn hash4(v: u32) -> u64 {
    let mut h = PRIME_5.wrapping_add(4);

    h ^= (v as u64).wrapping_mul(PRIME_1);
    h = h.rotate_left(23).wrapping_mul(PRIME_2).wrapping_add(PRIME_3);

    avalanche(h)
}

fn hash8(v: u64) -> u64 {
    let mut h = PRIME_5.wrapping_add(8);

    h ^= round(0, v);
    h = h.rotate_left(27).wrapping_mul(PRIME_1).wrapping_add(PRIME_4);

    avalanche(h)
}

fn hash16(v: u128) -> u64 {
    let mut h = PRIME_5.wrapping_add(16);

    h ^= round(0, v as u64);
    h = h.rotate_left(27).wrapping_mul(PRIME_1).wrapping_add(PRIME_4);
    h ^= round(0, (v >> 64) as u64);
    h = h.rotate_left(27).wrapping_mul(PRIME_1).wrapping_add(PRIME_4);

    avalanche(h)
}

#[inline]
fn round(acc: u64, input: u64) -> u64 {
    acc.wrapping_add(input.wrapping_mul(PRIME_2))
        .rotate_left(31)
        .wrapping_mul(PRIME_1)
}

#[inline]
fn merge_round(acc: u64, val: u64) -> u64 {
    (acc ^ round(0, val))
        .wrapping_mul(PRIME_1)
        .wrapping_add(PRIME_4)
}

#[inline]
fn avalanche(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(PRIME_2);
    h ^= h >> 29;
    h = h.wrapping_mul(PRIME_3);
    h ^= h >> 32;

    h
}

#[inline]
fn read_u64(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

#[inline]
fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
