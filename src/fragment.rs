// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Splitting fragments into units and assembling units into fragments.
//!
//! Three framings are supported: Annex B byte streams with start codes,
//! length prefixed NAL units as stored in MP4 samples, and the
//! `AVCDecoderConfigurationRecord` (AVCC) holding SPS and PPS units.

use alloc::{format, vec::Vec};

use bytes::Bytes;

use crate::nal_unit::{calc_max_nal_buf_size, ebsp_to_rbsp, rbsp_to_ebsp, Fragment, Unit, UnitContent};
use crate::{Error, NalUnitType, Result};

const START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

/// Add the NAL unit in `ebsp` to `fragment`, dropping emulation prevention
/// and trailing zero bytes.
fn add_nal(fragment: &mut Fragment, ebsp: Bytes) -> Result<()> {
    let rbsp = ebsp_to_rbsp(ebsp)?;
    let len = rbsp.len() - rbsp.iter().rev().take_while(|b| **b == 0).count();
    if len == 0 {
        log::debug!("Discarding empty 0 NAL unit.");
        return Ok(());
    }
    fragment.units.try_reserve(1)?;
    fragment.units.push(Unit::from_data(rbsp.slice(..len)));
    Ok(())
}

/// Split Annex B data at `00 00 01` start codes. Bytes before the first start
/// code are ignored.
pub(crate) fn split_annex_b(fragment: &mut Fragment, data: &Bytes) -> Result<()> {
    let mut starts = memchr::memmem::find_iter(data, &START_CODE);
    let Some(first) = starts.next() else {
        return Err(Error::invalid_data("No start code is found."));
    };

    let mut begin = first + START_CODE.len();
    for next in starts {
        add_nal(fragment, data.slice(begin..next))?;
        begin = next + START_CODE.len();
    }
    add_nal(fragment, data.slice(begin..))
}

/// Split NAL units each preceded by a big endian length of
/// `nal_length_size` bytes.
pub(crate) fn split_length_prefixed(
    fragment: &mut Fragment,
    data: &Bytes,
    nal_length_size: u8,
) -> Result<()> {
    let nal_length_size = usize::from(nal_length_size);
    let mut pos = 0;
    while pos < data.len() {
        if data.len() - pos < nal_length_size {
            return Err(Error::invalid_data(format!(
                "Truncated NAL unit length: {} bytes left.",
                data.len() - pos
            )));
        }
        let len = data[pos..pos + nal_length_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        pos += nal_length_size;
        if len > data.len() - pos {
            return Err(Error::invalid_data(format!(
                "Invalid NAL unit size ({len} > {}).",
                data.len() - pos
            )));
        }
        add_nal(fragment, data.slice(pos..pos + len))?;
        pos += len;
    }
    Ok(())
}

/// Reads the fields of an AVCC header, checking every length before use.
struct AvccReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl AvccReader<'_> {
    fn left(&self) -> usize {
        self.data.len() - self.pos
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::invalid_data("Truncated AVCC header."))?;
        self.pos += 1;
        Ok(b)
    }

    /// Skip an array of `count` entries with 16-bit lengths, returning the
    /// byte range the entries occupy.
    fn array(&mut self, count: usize) -> Result<core::ops::Range<usize>> {
        let start = self.pos;
        for i in 0..count {
            if self.left() < 2 * (count - i) {
                return Err(Error::invalid_data("Truncated AVCC parameter set array."));
            }
            let size = usize::from(u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]));
            self.pos += 2;
            if self.left() < size {
                return Err(Error::invalid_data(format!(
                    "Invalid AVCC parameter set size {size}: {} bytes left.",
                    self.left()
                )));
            }
            self.pos += size;
        }
        Ok(start..self.pos)
    }
}

/// Split an `AVCDecoderConfigurationRecord`, returning its
/// `nal_length_size`.
pub(crate) fn split_avcc_header(fragment: &mut Fragment, data: &Bytes) -> Result<u8> {
    if data.len() < 6 {
        return Err(Error::invalid_data(format!(
            "Invalid AVCC header: {} bytes.",
            data.len()
        )));
    }
    let mut r = AvccReader {
        data: &data[..],
        pos: 0,
    };

    let version = r.byte()?;
    if version != 1 {
        return Err(Error::invalid_data(format!(
            "Invalid AVCC header: first byte {version}."
        )));
    }
    // profile, compatibility and level
    r.pos += 3;
    let nal_length_size = (r.byte()? & 3) + 1;

    let sps_count = usize::from(r.byte()? & 0x1f);
    let range = r.array(sps_count)?;
    split_length_prefixed(fragment, &data.slice(range), 2)?;

    if r.left() > 0 {
        let pps_count = usize::from(r.byte()?);
        let range = r.array(pps_count)?;
        split_length_prefixed(fragment, &data.slice(range), 2)?;
    }

    if r.left() > 0 {
        log::warn!("{} bytes left at end of AVCC header.", r.left());
    }

    Ok(nal_length_size)
}

fn is_parameter_set(unit: &Unit) -> bool {
    matches!(
        unit.unit_type(),
        NalUnitType::SequenceParameterSet | NalUnitType::PictureParameterSet
    )
}

/// Record the padding of the final unit in `fragment`.
fn check_padding(fragment: &mut Fragment) {
    let count = fragment.units.len();
    let mut final_padding = 0;
    for (i, unit) in fragment.units.iter().enumerate() {
        if unit.data_bit_padding > 0 {
            if i + 1 < count {
                log::warn!("Probably invalid unaligned padding on non-final NAL unit.");
            } else {
                final_padding = unit.data_bit_padding;
            }
        }
    }
    fragment.data_bit_padding = final_padding;
}

/// Append the EBSP form of `rbsp`.
///
/// An RBSP ending in a zero byte (a `cabac_zero_word`) gets a final
/// emulation prevention byte, so the NAL unit never ends in zero.
fn push_ebsp(out: &mut Vec<u8>, rbsp: &[u8]) {
    rbsp_to_ebsp(rbsp, out);
    if out.ends_with(&[0x00, 0x00]) {
        out.push(0x03);
    }
}

fn empty_unit_error(i: usize) -> Error {
    Error::invalid_data(format!("Unit {i} has no data to assemble."))
}

/// Join the units of `fragment` into an Annex B byte stream.
///
/// Parameter sets and the first unit get a four byte start code, all others
/// three bytes.
pub(crate) fn assemble_annex_b(fragment: &mut Fragment) -> Result<()> {
    let max_size = fragment
        .units
        .iter()
        .map(|unit| 4 + calc_max_nal_buf_size(unit.data.len()))
        .sum();
    let mut out = Vec::new();
    out.try_reserve(max_size)?;

    for (i, unit) in fragment.units.iter().enumerate() {
        if unit.data.is_empty() {
            return Err(empty_unit_error(i));
        }
        if i == 0 || is_parameter_set(unit) {
            // zero_byte
            out.push(0x00);
        }
        out.extend_from_slice(&START_CODE);
        push_ebsp(&mut out, &unit.data);
    }

    check_padding(fragment);
    fragment.data = Bytes::from(out);
    Ok(())
}

/// Join the units of `fragment` with big endian length prefixes, as in MP4
/// sample data.
pub(crate) fn assemble_length_prefixed(fragment: &mut Fragment, nal_length_size: u8) -> Result<()> {
    if !(1..=4).contains(&nal_length_size) {
        return Err(Error::invalid_data(format!(
            "Invalid NAL length size {nal_length_size}."
        )));
    }
    let max_len = if nal_length_size >= 4 {
        u32::MAX as usize
    } else {
        (1usize << (8 * nal_length_size)) - 1
    };
    let prefix = usize::from(nal_length_size);

    let mut out = Vec::new();
    out.try_reserve(
        fragment
            .units
            .iter()
            .map(|unit| prefix + calc_max_nal_buf_size(unit.data.len()))
            .sum(),
    )?;

    for (i, unit) in fragment.units.iter().enumerate() {
        if unit.data.is_empty() {
            return Err(empty_unit_error(i));
        }
        let len_pos = out.len();
        out.resize(len_pos + prefix, 0);
        push_ebsp(&mut out, &unit.data);
        let len = out.len() - len_pos - prefix;
        if len > max_len {
            return Err(Error::invalid_data(format!(
                "NAL unit of {len} bytes too large for {nal_length_size} byte length field."
            )));
        }
        let be = (len as u32).to_be_bytes();
        out[len_pos..len_pos + prefix].copy_from_slice(&be[4 - prefix..]);
    }

    check_padding(fragment);
    fragment.data = Bytes::from(out);
    Ok(())
}

fn avcc_array(out: &mut Vec<u8>, units: &[&Unit]) -> Result<()> {
    for unit in units {
        let mut ebsp = Vec::new();
        ebsp.try_reserve(calc_max_nal_buf_size(unit.data.len()))?;
        push_ebsp(&mut ebsp, &unit.data);
        let len = u16::try_from(ebsp.len()).map_err(|_| {
            Error::invalid_data(format!(
                "Parameter set of {} bytes too large for AVCC header.",
                ebsp.len()
            ))
        })?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&ebsp);
    }
    Ok(())
}

/// Build an `AVCDecoderConfigurationRecord` from the SPS and PPS units of
/// `fragment`, which must already hold written data.
pub(crate) fn assemble_avcc_header(fragment: &Fragment, nal_length_size: u8) -> Result<Bytes> {
    if !(1..=4).contains(&nal_length_size) || nal_length_size == 3 {
        return Err(Error::invalid_data(format!(
            "Invalid NAL length size {nal_length_size} for AVCC header."
        )));
    }

    let sps: Vec<&Unit> = fragment
        .units
        .iter()
        .filter(|u| u.unit_type() == NalUnitType::SequenceParameterSet)
        .collect();
    let pps: Vec<&Unit> = fragment
        .units
        .iter()
        .filter(|u| u.unit_type() == NalUnitType::PictureParameterSet)
        .collect();

    let first = sps
        .first()
        .ok_or_else(|| Error::invalid_data("AVCC header needs at least one SPS."))?;
    if first.data.len() < 4 {
        return Err(Error::invalid_data("SPS too short for AVCC header."));
    }
    if sps.len() > 31 || pps.len() > 255 {
        return Err(Error::invalid_data(format!(
            "Too many parameter sets for AVCC header: {} SPS, {} PPS.",
            sps.len(),
            pps.len()
        )));
    }

    let mut out = Vec::new();
    // configurationVersion, then profile_idc, profile compatibility and
    // level_idc as in the SPS.
    out.push(1);
    out.extend_from_slice(&first.data[1..4]);
    out.push(0xfc | (nal_length_size - 1));

    out.push(0xe0 | sps.len() as u8);
    avcc_array(&mut out, &sps)?;
    out.push(pps.len() as u8);
    avcc_array(&mut out, &pps)?;

    if let Some(UnitContent::Sps(sps)) = &first.content {
        if sps.is_high_profile() {
            out.push(0xfc | sps.chroma_format_idc);
            out.push(0xf8 | sps.bit_depth_luma_minus8);
            out.push(0xf8 | sps.bit_depth_chroma_minus8);
            // numOfSequenceParameterSetExt
            out.push(0);
        }
    }

    Ok(Bytes::from(out))
}
