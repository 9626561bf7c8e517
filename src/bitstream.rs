// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bit-level reading and writing of syntax elements.
//!
//! Every syntax structure in this crate is written once, as a function generic
//! over [SyntaxIo]. The [BitReader] implementation fills the structure from a
//! bitstream, the [BitWriter] implementation serializes it. Range checks and
//! inferred values are therefore identical in both directions.

use alloc::{format, vec::Vec};
use core::fmt;

use bitvec::prelude::{BitSlice, BitVec, Msb0};
use bitvec::view::BitView;
use bitvec::field::BitField;

use crate::golomb::{self, BitVecGolomb, GolombError};
use crate::{max_uint_bits, Error, Result};

/// Whether a syntax function is reading or writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("Read"),
            Direction::Write => f.write_str("Write"),
        }
    }
}

/// Storage type of an unsigned syntax element.
pub(crate) trait UnsignedField: Copy + Default + PartialEq + fmt::Debug {
    fn to_u32(self) -> u32;
    /// Convert from a value already checked against the field's range.
    fn from_u32(value: u32) -> Self;
}

impl UnsignedField for bool {
    fn to_u32(self) -> u32 {
        u32::from(self)
    }
    fn from_u32(value: u32) -> Self {
        value != 0
    }
}

macro_rules! unsigned_field {
    ($($t:ty),*) => {
        $(impl UnsignedField for $t {
            fn to_u32(self) -> u32 {
                u32::from(self)
            }
            #[allow(clippy::cast_possible_truncation)]
            fn from_u32(value: u32) -> Self {
                value as $t
            }
        })*
    };
}
unsigned_field!(u8, u16, u32);

/// Storage type of a signed syntax element.
pub(crate) trait SignedField: Copy + Default + PartialEq + fmt::Debug {
    fn to_i32(self) -> i32;
    /// Convert from a value already checked against the field's range.
    fn from_i32(value: i32) -> Self;
}

macro_rules! signed_field {
    ($($t:ty),*) => {
        $(impl SignedField for $t {
            fn to_i32(self) -> i32 {
                i32::from(self)
            }
            #[allow(clippy::cast_possible_truncation)]
            fn from_i32(value: i32) -> Self {
                value as $t
            }
        })*
    };
}
signed_field!(i8, i16, i32);

fn out_of_range<V: fmt::Display>(name: &str, value: V, min: V, max: V) -> Error {
    Error::invalid_data(format!(
        "{name} out of range: {value}, but must be in [{min},{max}]"
    ))
}

/// Fixed width fields are at most 32 bits wide.
fn check_width(width: u32, name: &str) -> Result<()> {
    if width > 32 {
        return Err(Error::invalid_data(format!(
            "Invalid width of {name}: {width} bits."
        )));
    }
    Ok(())
}

/// Operations shared by [BitReader] and [BitWriter].
///
/// On read, every method stores the decoded value into its `&mut` argument.
/// On write, it serializes the current value of that argument.
pub(crate) trait SyntaxIo {
    const DIRECTION: Direction;

    /// Current position in bits.
    fn position(&self) -> usize;

    fn byte_aligned(&self) -> bool {
        self.position() % 8 == 0
    }

    /// Emit a trace line naming the syntax structure about to be coded.
    fn header(&self, name: &str);

    /// Fixed-width unsigned field, `width` in 1..=32.
    fn u<T: UnsignedField>(
        &mut self,
        width: u32,
        name: &str,
        value: &mut T,
        min: u32,
        max: u32,
    ) -> Result<()>;

    fn flag(&mut self, name: &str, value: &mut bool) -> Result<()> {
        self.u(1, name, value, 0, 1)
    }

    /// Field which must always have the value `expected`.
    fn fixed(&mut self, width: u32, name: &str, expected: u32) -> Result<()>;

    /// Unsigned Exp-Golomb field, `ue(v)`.
    fn ue<T: UnsignedField>(&mut self, name: &str, value: &mut T, min: u32, max: u32)
        -> Result<()>;

    /// Signed Exp-Golomb field, `se(v)`.
    fn se<T: SignedField>(&mut self, name: &str, value: &mut T, min: i32, max: i32)
        -> Result<()>;

    /// A value not present in the bitstream.
    ///
    /// Reading sets `value` to `expected`. Writing checks that `value` already
    /// equals `expected`.
    fn infer<T: PartialEq + Copy + fmt::Debug>(
        &mut self,
        name: &str,
        value: &mut T,
        expected: T,
    ) -> Result<()>;

    /// Whether more data precedes the RBSP trailing bits.
    ///
    /// Reading determines `present` from the bitstream. Writing uses the
    /// value of `present` as given.
    fn more_rbsp_data(&mut self, present: &mut bool) -> Result<()>;

    /// Size `buf` to hold `len` elements.
    ///
    /// Reading allocates a zeroed buffer. Writing requires that `buf` already
    /// holds at least `len` elements.
    fn allocate<T: Default + Clone>(
        &mut self,
        name: &str,
        buf: &mut Vec<T>,
        len: usize,
    ) -> Result<()>;

    /// Make `buf[idx]` available for the next element of a self-terminating
    /// list.
    fn entry<T: Default>(&mut self, name: &str, buf: &mut Vec<T>, idx: usize) -> Result<()>;

    /// A run of `0xff` bytes.
    ///
    /// Reading counts the `0xff` bytes which follow. Writing emits `count` of
    /// them.
    fn ff_bytes(&mut self, name: &str, count: &mut u32) -> Result<()>;
}

/// `rbsp_trailing_bits()`
pub(crate) fn rbsp_trailing_bits<S: SyntaxIo>(io: &mut S) -> Result<()> {
    io.fixed(1, "rbsp_stop_one_bit", 1)?;
    while !io.byte_aligned() {
        io.fixed(1, "rbsp_alignment_zero_bit", 0)?;
    }
    Ok(())
}

/// Align with a one bit followed by zero bits, as after an SEI payload.
pub(crate) fn byte_alignment<S: SyntaxIo>(io: &mut S) -> Result<()> {
    io.fixed(1, "bit_equal_to_one", 1)?;
    while !io.byte_aligned() {
        io.fixed(1, "bit_equal_to_zero", 0)?;
    }
    Ok(())
}

// Reading ------------------------------

/// Reads syntax elements from an RBSP.
pub(crate) struct BitReader<'a> {
    bits: &'a BitSlice<u8, Msb0>,
    pos: usize,
    trace: bool,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(data: &'a [u8], trace: bool) -> Self {
        Self::from_bits(data.view_bits::<Msb0>(), trace)
    }

    pub(crate) fn from_bits(bits: &'a BitSlice<u8, Msb0>, trace: bool) -> Self {
        Self {
            bits,
            pos: 0,
            trace,
        }
    }

    pub(crate) fn bits_left(&self) -> usize {
        self.bits.len() - self.pos
    }

    /// Split off a reader for the next `len` bits and advance past them.
    pub(crate) fn sub_reader(&mut self, len: usize, name: &str) -> Result<BitReader<'a>> {
        if len > self.bits_left() {
            return Err(Error::invalid_data(format!(
                "Invalid {name}: {len} bits requested but only {} available.",
                self.bits_left()
            )));
        }
        let bits = &self.bits[self.pos..self.pos + len];
        self.pos += len;
        Ok(BitReader::from_bits(bits, self.trace))
    }

    fn read_bits(&mut self, width: u32, name: &str) -> Result<u32> {
        check_width(width, name)?;
        let width = width as usize;
        if width > self.bits_left() {
            return Err(Error::invalid_data(format!(
                "Invalid value at {name}: bitstream ended."
            )));
        }
        if width == 0 {
            return Ok(0);
        }
        let value = self.bits[self.pos..self.pos + width].load_be::<u32>();
        self.pos += width;
        Ok(value)
    }

    /// The next `width` bits without consuming them, zero padded past the end.
    fn peek_bits(&self, width: usize) -> u32 {
        let avail = width.min(self.bits_left());
        if avail == 0 {
            return 0;
        }
        let v = self.bits[self.pos..self.pos + avail].load_be::<u32>();
        v << (width - avail)
    }

    fn read_exp_golomb(&mut self, name: &str, kind: &str) -> Result<(u32, usize)> {
        golomb::decode_exp_golomb(&self.bits[self.pos..]).map_err(|e| {
            let why = match e {
                GolombError::BitstreamEnded => "bitstream ended",
                GolombError::TooManyZeroes => "more than 31 zeroes",
            };
            Error::invalid_data(format!("Invalid {kind}-golomb code at {name}: {why}."))
        })
    }

    fn trace<V: fmt::Display>(&self, position: usize, name: &str, width: usize, value: V) {
        if self.trace {
            log::trace!("{position:<10} {name:<50} {width:>2} bits = {value}");
        }
    }
}

impl SyntaxIo for BitReader<'_> {
    const DIRECTION: Direction = Direction::Read;

    fn position(&self) -> usize {
        self.pos
    }

    fn header(&self, name: &str) {
        if self.trace {
            log::trace!("{name}");
        }
    }

    fn u<T: UnsignedField>(
        &mut self,
        width: u32,
        name: &str,
        value: &mut T,
        min: u32,
        max: u32,
    ) -> Result<()> {
        let start = self.pos;
        let v = self.read_bits(width, name)?;
        self.trace(start, name, width as usize, v);
        if v < min || v > max {
            return Err(out_of_range(name, v, min, max));
        }
        *value = T::from_u32(v);
        Ok(())
    }

    fn fixed(&mut self, width: u32, name: &str, expected: u32) -> Result<()> {
        let start = self.pos;
        let v = self.read_bits(width, name)?;
        self.trace(start, name, width as usize, v);
        if v != expected {
            return Err(Error::invalid_data(format!(
                "{name} must be {expected}, but is {v}"
            )));
        }
        Ok(())
    }

    fn ue<T: UnsignedField>(
        &mut self,
        name: &str,
        value: &mut T,
        min: u32,
        max: u32,
    ) -> Result<()> {
        let start = self.pos;
        let (v, len) = self.read_exp_golomb(name, "ue")?;
        self.pos += len;
        self.trace(start, name, len, v);
        if v < min || v > max {
            return Err(out_of_range(name, v, min, max));
        }
        *value = T::from_u32(v);
        Ok(())
    }

    fn se<T: SignedField>(
        &mut self,
        name: &str,
        value: &mut T,
        min: i32,
        max: i32,
    ) -> Result<()> {
        let start = self.pos;
        let (k, len) = self.read_exp_golomb(name, "se")?;
        self.pos += len;
        let v = golomb::code_to_signed(k);
        self.trace(start, name, len, v);
        if v < min || v > max {
            return Err(out_of_range(name, v, min, max));
        }
        *value = T::from_i32(v);
        Ok(())
    }

    fn infer<T: PartialEq + Copy + fmt::Debug>(
        &mut self,
        name: &str,
        value: &mut T,
        expected: T,
    ) -> Result<()> {
        *value = expected;
        if self.trace {
            log::trace!("{name} = {expected:?} (inferred)");
        }
        Ok(())
    }

    fn more_rbsp_data(&mut self, present: &mut bool) -> Result<()> {
        let left = self.bits_left();
        *present = if left > 8 {
            true
        } else if left == 0 {
            false
        } else {
            // Anything other than a lone stop bit is more data.
            let rest = self.bits[self.pos..].load_be::<u32>();
            rest != 1 << (left - 1)
        };
        Ok(())
    }

    fn allocate<T: Default + Clone>(
        &mut self,
        _name: &str,
        buf: &mut Vec<T>,
        len: usize,
    ) -> Result<()> {
        buf.clear();
        buf.try_reserve_exact(len)?;
        buf.resize(len, T::default());
        Ok(())
    }

    fn entry<T: Default>(&mut self, _name: &str, buf: &mut Vec<T>, idx: usize) -> Result<()> {
        if idx == 0 {
            buf.clear();
        }
        debug_assert_eq!(buf.len(), idx);
        buf.try_reserve(1)?;
        buf.push(T::default());
        Ok(())
    }

    fn ff_bytes(&mut self, name: &str, count: &mut u32) -> Result<()> {
        *count = 0;
        while self.peek_bits(8) == 0xff {
            self.fixed(8, name, 0xff)?;
            *count += 1;
        }
        Ok(())
    }
}

// Writing ------------------------------

/// Writes syntax elements into a bit buffer of bounded size.
///
/// Exceeding the limit fails with [Error::InsufficientSpace]. The caller can
/// then raise the limit and write the unit again.
pub(crate) struct BitWriter {
    bits: BitVec<u8, Msb0>,
    limit: usize,
    trace: bool,
}

impl BitWriter {
    /// Create a writer holding at most `limit_bytes` bytes.
    pub(crate) fn new(limit_bytes: usize, trace: bool) -> Self {
        Self {
            bits: BitVec::new(),
            limit: limit_bytes.saturating_mul(8),
            trace,
        }
    }

    fn reserve(&self, width: usize) -> Result<()> {
        if self.bits.len() + width > self.limit {
            return Err(Error::insufficient_space());
        }
        Ok(())
    }

    fn write_bits(&mut self, width: u32, name: &str, value: u32) -> Result<()> {
        check_width(width, name)?;
        let width = width as usize;
        self.reserve(width)?;
        if width == 0 {
            return Ok(());
        }
        let start = self.bits.len();
        self.bits.resize(start + width, false);
        self.bits[start..].store_be(value);
        Ok(())
    }

    /// Append whole bytes. Only valid when byte aligned.
    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len() * 8)?;
        self.bits.extend_from_raw_slice(bytes);
        Ok(())
    }

    /// Append raw bits.
    pub(crate) fn write_bitslice(&mut self, bits: &BitSlice<u8, Msb0>) -> Result<()> {
        self.reserve(bits.len())?;
        self.bits.extend_from_bitslice(bits);
        Ok(())
    }

    /// Discard everything written after bit `position`.
    pub(crate) fn rewind(&mut self, position: usize) {
        self.bits.truncate(position);
    }

    /// Finish writing, returning the bytes and the number of padding bits in
    /// the final byte.
    pub(crate) fn into_bytes(mut self) -> (Vec<u8>, u8) {
        let padding = (8 - self.bits.len() % 8) % 8;
        self.bits.set_uninitialized(false);
        (self.bits.into_vec(), padding as u8)
    }

    fn trace<V: fmt::Display>(&self, position: usize, name: &str, width: usize, value: V) {
        if self.trace {
            log::trace!("{position:<10} {name:<50} {width:>2} bits = {value}");
        }
    }
}

impl SyntaxIo for BitWriter {
    const DIRECTION: Direction = Direction::Write;

    fn position(&self) -> usize {
        self.bits.len()
    }

    fn header(&self, name: &str) {
        if self.trace {
            log::trace!("{name}");
        }
    }

    fn u<T: UnsignedField>(
        &mut self,
        width: u32,
        name: &str,
        value: &mut T,
        min: u32,
        max: u32,
    ) -> Result<()> {
        let v = value.to_u32();
        if v < min || v > max {
            return Err(out_of_range(name, v, min, max));
        }
        if v > max_uint_bits(width) {
            return Err(Error::invalid_data(format!(
                "{name} does not fit in {width} bits: {v}"
            )));
        }
        self.trace(self.bits.len(), name, width as usize, v);
        self.write_bits(width, name, v)
    }

    fn fixed(&mut self, width: u32, name: &str, expected: u32) -> Result<()> {
        self.trace(self.bits.len(), name, width as usize, expected);
        self.write_bits(width, name, expected)
    }

    fn ue<T: UnsignedField>(
        &mut self,
        name: &str,
        value: &mut T,
        min: u32,
        max: u32,
    ) -> Result<()> {
        let v = value.to_u32();
        if v < min || v > max {
            return Err(out_of_range(name, v, min, max));
        }
        if v == u32::MAX {
            return Err(Error::invalid_data(format!(
                "{name} cannot be coded as ue-golomb: {v}"
            )));
        }
        let len = golomb::exp_golomb_len(v);
        self.reserve(len)?;
        self.trace(self.bits.len(), name, len, v);
        self.bits.extend_exp_golomb(v);
        Ok(())
    }

    fn se<T: SignedField>(
        &mut self,
        name: &str,
        value: &mut T,
        min: i32,
        max: i32,
    ) -> Result<()> {
        let v = value.to_i32();
        if v < min || v > max {
            return Err(out_of_range(name, v, min, max));
        }
        if v == i32::MIN {
            return Err(Error::invalid_data(format!(
                "{name} cannot be coded as se-golomb: {v}"
            )));
        }
        let len = golomb::exp_golomb_len(golomb::signed_to_code(v));
        self.reserve(len)?;
        self.trace(self.bits.len(), name, len, v);
        self.bits.extend_signed_exp_golomb(v);
        Ok(())
    }

    fn infer<T: PartialEq + Copy + fmt::Debug>(
        &mut self,
        name: &str,
        value: &mut T,
        expected: T,
    ) -> Result<()> {
        if *value != expected {
            return Err(Error::invalid_data(format!(
                "{name} does not match inferred value: {value:?}, but should be {expected:?}"
            )));
        }
        Ok(())
    }

    fn more_rbsp_data(&mut self, _present: &mut bool) -> Result<()> {
        Ok(())
    }

    fn allocate<T: Default + Clone>(
        &mut self,
        name: &str,
        buf: &mut Vec<T>,
        len: usize,
    ) -> Result<()> {
        if buf.len() < len {
            return Err(Error::invalid_data(format!(
                "{name} must be set for writing"
            )));
        }
        Ok(())
    }

    fn entry<T: Default>(&mut self, name: &str, buf: &mut Vec<T>, idx: usize) -> Result<()> {
        if idx >= buf.len() {
            return Err(Error::invalid_data(format!(
                "{name} list is not terminated"
            )));
        }
        Ok(())
    }

    fn ff_bytes(&mut self, name: &str, count: &mut u32) -> Result<()> {
        self.reserve(*count as usize * 8)?;
        for _ in 0..*count {
            self.fixed(8, name, 0xff)?;
        }
        Ok(())
    }
}
