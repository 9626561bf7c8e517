// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Units without references to parameter sets: access unit delimiter, filler
//! data, end of sequence and end of stream.

use crate::bitstream::{rbsp_trailing_bits, SyntaxIo};
use crate::nal_unit::{nal_unit_header, NalUnitHeader, NalUnitType};
use crate::Result;

/// Access unit delimiter, `access_unit_delimiter_rbsp()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aud {
    pub nal_unit_header: NalUnitHeader,
    pub primary_pic_type: u8,
}

impl Aud {
    pub fn new(primary_pic_type: u8) -> Self {
        Self {
            nal_unit_header: NalUnitHeader::new(0, NalUnitType::AccessUnitDelimiter),
            primary_pic_type,
        }
    }
}

impl Default for Aud {
    fn default() -> Self {
        // All slice types may be present.
        Self::new(7)
    }
}

pub(crate) fn aud<S: SyntaxIo>(io: &mut S, current: &mut Aud) -> Result<()> {
    io.header("Access Unit Delimiter");

    nal_unit_header(
        io,
        &mut current.nal_unit_header,
        1 << NalUnitType::AccessUnitDelimiter.nal_unit_type(),
    )?;

    io.u(3, "primary_pic_type", &mut current.primary_pic_type, 0, 7)?;

    rbsp_trailing_bits(io)
}

/// Filler data, `filler_data_rbsp()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filler {
    pub nal_unit_header: NalUnitHeader,
    /// Number of `0xff` bytes.
    pub filler_size: u32,
}

impl Filler {
    pub fn new(filler_size: u32) -> Self {
        Self {
            nal_unit_header: NalUnitHeader::new(0, NalUnitType::FillerData),
            filler_size,
        }
    }
}

impl Default for Filler {
    fn default() -> Self {
        Self::new(0)
    }
}

pub(crate) fn filler<S: SyntaxIo>(io: &mut S, current: &mut Filler) -> Result<()> {
    io.header("Filler Data");

    nal_unit_header(
        io,
        &mut current.nal_unit_header,
        1 << NalUnitType::FillerData.nal_unit_type(),
    )?;

    io.ff_bytes("ff_byte", &mut current.filler_size)?;

    rbsp_trailing_bits(io)
}

pub(crate) fn end_of_sequence<S: SyntaxIo>(io: &mut S, current: &mut NalUnitHeader) -> Result<()> {
    io.header("End of Sequence");

    nal_unit_header(
        io,
        current,
        1 << NalUnitType::EndOfSequence.nal_unit_type(),
    )
}

pub(crate) fn end_of_stream<S: SyntaxIo>(io: &mut S, current: &mut NalUnitHeader) -> Result<()> {
    io.header("End of Stream");

    nal_unit_header(
        io,
        current,
        1 << NalUnitType::EndOfStream.nal_unit_type(),
    )
}
