/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Big-endian helpers for fields kept in network byte order.
//!
//! Aggregated records store every value exactly as it appears on the wire, so
//! comparisons and counter arithmetic happen directly on the byte slices.

use std::cmp::Ordering;

pub fn read_u16_be(bs: &[u8]) -> u16 {
    assert!(bs.len() >= 2);
    u16::from_be_bytes(bs[..2].try_into().unwrap())
}

pub fn read_u32_be(bs: &[u8]) -> u32 {
    assert!(bs.len() >= 4);
    u32::from_be_bytes(bs[..4].try_into().unwrap())
}

pub fn read_u64_be(bs: &[u8]) -> u64 {
    assert!(bs.len() >= 8);
    u64::from_be_bytes(bs[..8].try_into().unwrap())
}

pub fn read_u32_ne(bs: &[u8]) -> u32 {
    assert!(bs.len() >= 4);
    u32::from_ne_bytes(bs[..4].try_into().unwrap())
}

pub fn write_u16_be(bs: &mut [u8], v: u16) {
    assert!(bs.len() >= 2);
    bs[0..2].copy_from_slice(v.to_be_bytes().as_slice())
}

pub fn write_u32_be(bs: &mut [u8], v: u32) {
    assert!(bs.len() >= 4);
    bs[0..4].copy_from_slice(v.to_be_bytes().as_slice())
}

pub fn write_u64_be(bs: &mut [u8], v: u64) {
    assert!(bs.len() >= 8);
    bs[0..8].copy_from_slice(v.to_be_bytes().as_slice())
}

pub fn write_u32_ne(bs: &mut [u8], v: u32) {
    assert!(bs.len() >= 4);
    bs[0..4].copy_from_slice(v.to_ne_bytes().as_slice())
}

/// Unsigned comparison of two equally sized big-endian integers.
pub fn cmp_be(a: &[u8], b: &[u8]) -> Ordering {
    assert_eq!(a.len(), b.len());
    a.cmp(b)
}

/// Keeps the lesser of `base` and `delta` in `base`.
pub fn min_be(base: &mut [u8], delta: &[u8]) {
    if cmp_be(delta, base) == Ordering::Less {
        base.copy_from_slice(delta);
    }
}

/// Keeps the greater of `base` and `delta` in `base`.
pub fn max_be(base: &mut [u8], delta: &[u8]) {
    if cmp_be(delta, base) == Ordering::Greater {
        base.copy_from_slice(delta);
    }
}

/// Wrapping addition of two equally sized big-endian integers, result in `base`.
pub fn add_be(base: &mut [u8], delta: &[u8]) {
    assert_eq!(base.len(), delta.len());
    let mut carry = 0u16;
    for (b, d) in base.iter_mut().rev().zip(delta.iter().rev()) {
        let sum = *b as u16 + *d as u16 + carry;
        *b = sum as u8;
        carry = sum >> 8;
    }
}

/// Wrapping addition of `v` to the big-endian integer in `base`.
///
/// `base` may be shorter than 8 bytes, in which case `v` is truncated to fit.
pub fn add_u64_be(base: &mut [u8], v: u64) {
    assert!(base.len() <= 8);
    let bytes = v.to_be_bytes();
    add_be(base, &bytes[8 - base.len()..]);
}

pub fn or_bytes(base: &mut [u8], delta: &[u8]) {
    for (b, d) in base.iter_mut().zip(delta) {
        *b |= *d;
    }
}

pub fn is_zero(bs: &[u8]) -> bool {
    bs.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_in_network_order() {
        let mut base = 300u32.to_be_bytes();
        min_be(&mut base, &20u32.to_be_bytes());
        assert_eq!(u32::from_be_bytes(base), 20);
        min_be(&mut base, &256u32.to_be_bytes());
        assert_eq!(u32::from_be_bytes(base), 20);

        let mut base = 1u64.to_be_bytes();
        max_be(&mut base, &0x1_0000_0000u64.to_be_bytes());
        assert_eq!(u64::from_be_bytes(base), 0x1_0000_0000);
    }

    #[test]
    fn add_with_carry_and_wrap() {
        let mut base = 0xffu64.to_be_bytes();
        add_be(&mut base, &1u64.to_be_bytes());
        assert_eq!(u64::from_be_bytes(base), 0x100);

        let mut base = u32::MAX.to_be_bytes();
        add_be(&mut base, &2u32.to_be_bytes());
        assert_eq!(u32::from_be_bytes(base), 1);

        let mut base = [0u8; 8];
        add_u64_be(&mut base, 1500);
        add_u64_be(&mut base, 40);
        assert_eq!(read_u64_be(&base), 1540);

        let mut short = [0x00, 0xff];
        add_u64_be(&mut short, 1);
        assert_eq!(read_u16_be(&short), 0x100);
    }

    #[test]
    fn or_and_zero() {
        let mut flags = [0x02u8];
        or_bytes(&mut flags, &[0x10]);
        assert_eq!(flags, [0x12]);
        assert!(is_zero(&[0, 0, 0]));
        assert!(!is_zero(&flags));
    }
}
