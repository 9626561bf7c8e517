// Copyright 2022 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Variable Length Coding (VLC) using Exponential Golomb codes.

use bitvec::prelude::{BitSlice, BitVec, Msb0};

/// Longest run of leading zero bits in a valid 32-bit code.
pub(crate) const MAX_LEADING_ZEROES: usize = 31;

#[inline]
fn num_bits(mut x: u32) -> u8 {
    if x == 0 {
        return 1;
    }
    let mut value = 0;
    while x != 0 {
        x >>= 1;
        value += 1;
    }
    value
}

#[test]
fn test_num_bits() {
    for x in 0..100000 {
        let nbits1 = format!("{:b}", x).len();
        let nbits2 = num_bits(x);
        assert_eq!(nbits1, nbits2 as usize);
    }
}

/// Number of bits in the Exp-Golomb code for `x`.
///
/// `x` must be less than `u32::MAX`.
#[inline]
pub(crate) fn exp_golomb_len(x: u32) -> usize {
    2 * num_bits(x + 1) as usize - 1
}

/// Exponential-Golomb coding, for unsigned numbers.
///
/// `x` must be less than `u32::MAX`. See
/// https://en.wikipedia.org/wiki/Exponential-Golomb_coding
#[inline]
fn bv_exp_golomb(bv: &mut BitVec<u8, Msb0>, x: u32) {
    let v = x + 1;
    let nbits = num_bits(v);

    let nbits_m_1 = nbits - 1;
    bv.extend((0..nbits_m_1).map(|_| false));

    for i in 0..nbits {
        let shift = nbits - 1 - i;
        let mask = 1u32 << shift;
        bv.push(v & mask != 0);
    }
}

#[test]
fn test_exp_goloumb() {
    fn exp_golomb(x: u32) -> Vec<bool> {
        let mut bv = BitVec::new();
        bv_exp_golomb(&mut bv, x);
        let mut result = vec![];
        for b in bv {
            result.push(b);
        }
        result
    }

    // tests from https://en.wikipedia.org/wiki/Exponential-Golomb_coding
    assert_eq!(exp_golomb(0), vec![true]);
    assert_eq!(exp_golomb(1), vec![false, true, false]);
    assert_eq!(exp_golomb(2), vec![false, true, true]);
    assert_eq!(exp_golomb(3), vec![false, false, true, false, false]);
    assert_eq!(exp_golomb(4), vec![false, false, true, false, true]);
    assert_eq!(exp_golomb(5), vec![false, false, true, true, false]);
    assert_eq!(exp_golomb(6), vec![false, false, true, true, true]);
    assert_eq!(
        exp_golomb(7),
        vec![false, false, false, true, false, false, false]
    );
    assert_eq!(
        exp_golomb(8),
        vec![false, false, false, true, false, false, true]
    );
}

/// Map a signed value onto the unsigned code number used by `se(v)`.
///
/// `x` must not be `i32::MIN`.
#[inline]
pub(crate) fn signed_to_code(x: i32) -> u32 {
    if x > 0 {
        2 * x as u32 - 1
    } else {
        2 * x.unsigned_abs()
    }
}

/// Inverse of [signed_to_code].
#[inline]
pub(crate) fn code_to_signed(k: u32) -> i32 {
    if k & 1 == 1 {
        // (k + 1) / 2 without overflow at k == u32::MAX - 1
        (k / 2 + 1) as i32
    } else {
        -((k / 2) as i32)
    }
}

/// Exponential-Golomb coding, with extension to negative numbers
///
/// See https://en.wikipedia.org/wiki/Exponential-Golomb_coding
#[inline]
fn bv_signed_exp_golomb(bv: &mut BitVec<u8, Msb0>, x: i32) {
    bv_exp_golomb(bv, signed_to_code(x));
}

#[test]
fn test_signed_exp_goloumb() {
    fn signed_exp_golomb(x: i32) -> Vec<bool> {
        let mut bv = BitVec::new();
        bv_signed_exp_golomb(&mut bv, x);
        let mut result = vec![];
        for b in bv {
            result.push(b);
        }
        result
    }

    // tests from https://en.wikipedia.org/wiki/Exponential-Golomb_coding
    assert_eq!(signed_exp_golomb(0), vec![true]);
    assert_eq!(signed_exp_golomb(1), vec![false, true, false]);
    assert_eq!(signed_exp_golomb(-1), vec![false, true, true]);
    assert_eq!(signed_exp_golomb(2), vec![false, false, true, false, false]);
    assert_eq!(signed_exp_golomb(-2), vec![false, false, true, false, true]);
    assert_eq!(signed_exp_golomb(3), vec![false, false, true, true, false]);
    assert_eq!(signed_exp_golomb(-3), vec![false, false, true, true, true]);
    assert_eq!(
        signed_exp_golomb(4),
        vec![false, false, false, true, false, false, false]
    );
    assert_eq!(
        signed_exp_golomb(-4),
        vec![false, false, false, true, false, false, true]
    );
}

/// Failure decoding an Exp-Golomb code.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum GolombError {
    /// The bitstream ended inside the code.
    BitstreamEnded,
    /// The prefix had 32 or more leading zeroes.
    TooManyZeroes,
}

/// Decode an unsigned Exp-Golomb code from the start of `bits`.
///
/// Returns the code number and the number of bits consumed.
pub(crate) fn decode_exp_golomb(bits: &BitSlice<u8, Msb0>) -> Result<(u32, usize), GolombError> {
    let mut leading_zeroes = 0;
    loop {
        match bits.get(leading_zeroes).map(|b| *b) {
            None => return Err(GolombError::BitstreamEnded),
            Some(true) => break,
            Some(false) => {
                leading_zeroes += 1;
                if leading_zeroes > MAX_LEADING_ZEROES {
                    return Err(GolombError::TooManyZeroes);
                }
            }
        }
    }
    let total = 2 * leading_zeroes + 1;
    if bits.len() < total {
        return Err(GolombError::BitstreamEnded);
    }
    let mut v: u32 = 1;
    for bit in bits[leading_zeroes + 1..total].iter().by_vals() {
        v = (v << 1) | u32::from(bit);
    }
    Ok((v - 1, total))
}

#[test]
fn test_decode_exp_golomb() {
    use bitvec::prelude::bitvec;

    for x in [0u32, 1, 2, 3, 7, 8, 254, 255, 65535, 1 << 20] {
        let mut bv = BitVec::new();
        bv_exp_golomb(&mut bv, x);
        assert_eq!(bv.len(), exp_golomb_len(x));
        assert_eq!(decode_exp_golomb(&bv), Ok((x, bv.len())));
    }

    let ended = bitvec![u8, Msb0; 0, 0, 1, 0];
    assert_eq!(decode_exp_golomb(&ended), Err(GolombError::BitstreamEnded));

    let zeroes = BitVec::<u8, Msb0>::repeat(false, 40);
    assert_eq!(decode_exp_golomb(&zeroes), Err(GolombError::TooManyZeroes));
}

#[test]
fn test_signed_code_mapping() {
    for x in [0, 1, -1, 2, -2, 127, -128, i32::MAX, i32::MIN + 1] {
        assert_eq!(code_to_signed(signed_to_code(x)), x);
    }
    assert_eq!(signed_to_code(i32::MAX), u32::MAX - 1);
}

pub(crate) trait BitVecGolomb {
    fn extend_exp_golomb(&mut self, value: u32);
    fn extend_signed_exp_golomb(&mut self, value: i32);
}

impl BitVecGolomb for BitVec<u8, Msb0> {
    fn extend_exp_golomb(&mut self, value: u32) {
        bv_exp_golomb(self, value)
    }
    fn extend_signed_exp_golomb(&mut self, value: i32) {
        bv_signed_exp_golomb(self, value)
    }
}
