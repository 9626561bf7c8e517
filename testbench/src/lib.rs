// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Builds decodable H.264 streams through cbs-avc for integration tests.
//!
//! Pictures are coded as IDR slices made only of `I_PCM` macroblocks, so the
//! decoded samples equal the generated ones exactly.

use std::sync::Arc;

use anyhow::Result;
use bitvec::prelude::*;
use bytes::Bytes;

use cbs_avc::{
    AnnexBWriter, Aud, CodedBitstream, Fragment, Pps, Slice, SliceData, SliceHeader, Sps, Unit,
    UnitContent,
};

/// `mb_type` of an `I_PCM` macroblock in an I slice.
const I_PCM: u32 = 25;

/// Size of one 8 bit 4:2:0 `I_PCM` macroblock payload.
pub const PCM_MB_BYTES: usize = 256 + 2 * 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PictureSize {
    pub width_mbs: usize,
    pub height_mbs: usize,
}

impl PictureSize {
    pub fn new(width_mbs: usize, height_mbs: usize) -> Self {
        Self {
            width_mbs,
            height_mbs,
        }
    }

    pub fn width(&self) -> usize {
        self.width_mbs * 16
    }

    pub fn height(&self) -> usize {
        self.height_mbs * 16
    }
}

/// Constrained baseline SPS for a 4:2:0 8 bit picture of `size`.
pub fn baseline_sps(size: PictureSize) -> Result<Sps> {
    Ok(Sps {
        profile_idc: 66,
        constraint_set0_flag: true,
        constraint_set1_flag: true,
        level_idc: 40,
        pic_order_cnt_type: 2,
        max_num_ref_frames: 1,
        pic_width_in_mbs_minus1: u16::try_from(size.width_mbs - 1)?,
        pic_height_in_map_units_minus1: u16::try_from(size.height_mbs - 1)?,
        frame_mbs_only_flag: true,
        direct_8x8_inference_flag: true,
        ..Default::default()
    })
}

/// Luma sample at (`x`, `y`) of picture number `frame`.
pub fn luma_sample(x: usize, y: usize, frame: usize) -> u8 {
    (16 + (x + y + 8 * frame) % 220) as u8
}

/// Chroma sample at (`x`, `y`) of picture number `frame`, for plane 0 (Cb)
/// or 1 (Cr).
pub fn chroma_sample(plane: usize, x: usize, y: usize, frame: usize) -> u8 {
    if plane == 0 {
        (64 + (x + frame) % 128) as u8
    } else {
        (64 + (y + frame) % 128) as u8
    }
}

/// The expected decoded picture as planar `yuv420p`.
pub fn expected_yuv420p(size: PictureSize, frame: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(size.width() * size.height() * 3 / 2);
    for y in 0..size.height() {
        for x in 0..size.width() {
            out.push(luma_sample(x, y, frame));
        }
    }
    for plane in 0..2 {
        for y in 0..size.height() / 2 {
            for x in 0..size.width() / 2 {
                out.push(chroma_sample(plane, x, y, frame));
            }
        }
    }
    out
}

fn push_ue(bits: &mut BitVec<u8, Msb0>, value: u32) {
    let coded = value + 1;
    let len = 32 - coded.leading_zeros();
    for _ in 1..len {
        bits.push(false);
    }
    for i in (0..len).rev() {
        bits.push((coded >> i) & 1 == 1);
    }
}

fn pcm_macroblock(bits: &mut BitVec<u8, Msb0>, mb_x: usize, mb_y: usize, frame: usize) {
    push_ue(bits, I_PCM);
    // pcm_alignment_zero_bit
    while bits.len() % 8 != 0 {
        bits.push(false);
    }

    let mut samples = Vec::with_capacity(PCM_MB_BYTES);
    for y in mb_y * 16..(mb_y + 1) * 16 {
        for x in mb_x * 16..(mb_x + 1) * 16 {
            samples.push(luma_sample(x, y, frame));
        }
    }
    for plane in 0..2 {
        for y in mb_y * 8..(mb_y + 1) * 8 {
            for x in mb_x * 8..(mb_x + 1) * 8 {
                samples.push(chroma_sample(plane, x, y, frame));
            }
        }
    }
    bits.extend_from_bitslice(samples.view_bits::<Msb0>());
}

/// Slice data of an intra picture coded entirely with `I_PCM` macroblocks.
///
/// The slice header must end at bit `bit_start` of its final byte, which is
/// where the returned data starts.
pub fn pcm_slice_data(bit_start: u8, size: PictureSize, frame: usize) -> SliceData {
    let mut bits: BitVec<u8, Msb0> = BitVec::repeat(false, usize::from(bit_start));
    for mb_y in 0..size.height_mbs {
        for mb_x in 0..size.width_mbs {
            pcm_macroblock(&mut bits, mb_x, mb_y, frame);
        }
    }
    // rbsp_stop_one_bit
    bits.push(true);
    SliceData {
        data: Bytes::from(bits.into_vec()),
        bit_start,
    }
}

/// Write the parameter sets for `size` into the cache of `cbs`, returning
/// the assembled fragment.
pub fn write_parameter_sets(cbs: &mut CodedBitstream, size: PictureSize) -> Result<Fragment> {
    let mut fragment = Fragment::default();
    fragment.insert_unit_content(None, UnitContent::Sps(Arc::new(baseline_sps(size)?)))?;
    fragment.insert_unit_content(None, UnitContent::Pps(Arc::new(Pps::default())))?;
    cbs.write_fragment_content(&mut fragment)?;
    Ok(fragment)
}

/// The units of one access unit holding picture number `frame`.
///
/// The parameter sets must already be cached in `cbs`.
pub fn pcm_access_unit(cbs: &mut CodedBitstream, size: PictureSize, frame: usize) -> Result<Fragment> {
    let header = SliceHeader {
        idr_pic_id: (frame % 2) as u16,
        ..Default::default()
    };

    // Write the header alone to learn where the slice data starts.
    let mut header_only = Unit::from_content(UnitContent::Slice(Box::new(Slice {
        header: header.clone(),
        data: None,
    })));
    cbs.write_unit(&mut header_only)?;
    let header_bits = header_only.data.len() * 8 - usize::from(header_only.data_bit_padding);
    let data = pcm_slice_data((header_bits % 8) as u8, size, frame);

    let mut fragment = Fragment::default();
    fragment.insert_unit_content(None, UnitContent::Aud(Aud::new(0)))?;
    fragment.insert_unit_content(
        None,
        UnitContent::Slice(Box::new(Slice {
            header,
            data: Some(data),
        })),
    )?;
    Ok(fragment)
}

/// An Annex B stream of `frames` pictures.
pub fn pcm_stream(size: PictureSize, frames: usize) -> Result<Vec<u8>> {
    let mut cbs = CodedBitstream::new();
    write_parameter_sets(&mut cbs, size)?;

    let mut wtr = AnnexBWriter::new(Vec::new());
    for frame in 0..frames {
        let mut access_unit = pcm_access_unit(&mut cbs, size, frame)?;
        wtr.write(&mut cbs, &mut access_unit)?;
    }
    Ok(wtr.into_inner())
}

#[test]
fn test_ue() {
    let mut bits: BitVec<u8, Msb0> = BitVec::new();
    push_ue(&mut bits, I_PCM);
    // pcm_alignment_zero_bit
    while bits.len() % 8 != 0 {
        bits.push(false);
    }
    assert_eq!(bits.as_raw_slice(), &[0x0d, 0x00]);
}
