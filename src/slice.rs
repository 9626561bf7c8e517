// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Slice header syntax and the opaque slice data which follows it.

use alloc::{format, vec::Vec};

use bitvec::prelude::{BitSlice, Msb0};
use bytes::Bytes;

use crate::bitstream::{rbsp_trailing_bits, BitReader, BitWriter, SyntaxIo};
use crate::nal_unit::{nal_unit_header, NalUnitHeader, NalUnitType};
use crate::parameter_sets::ParameterSets;
use crate::sps::Sps;
use crate::{log2, max_uint_bits, Error, Result, MAX_MB_PIC_SIZE, MAX_MMCO_COUNT, MAX_RPLM_COUNT};

/// `slice_type % 5`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    I,
    SP,
    SI,
}

impl SliceType {
    pub fn from_slice_type(slice_type: u8) -> Self {
        match slice_type % 5 {
            0 => Self::P,
            1 => Self::B,
            2 => Self::I,
            3 => Self::SP,
            _ => Self::SI,
        }
    }

    /// Whether the slice is intra coded (I or SI).
    pub fn is_intra(&self) -> bool {
        matches!(self, Self::I | Self::SI)
    }
}

/// One `ref_pic_list_modification()` operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RplmEntry {
    pub modification_of_pic_nums_idc: u8,
    pub abs_diff_pic_num_minus1: u32,
    pub long_term_pic_num: u32,
}

impl RplmEntry {
    /// The entry ending a modification list.
    pub fn end() -> Self {
        Self {
            modification_of_pic_nums_idc: 3,
            ..Default::default()
        }
    }
}

/// One `dec_ref_pic_marking()` memory management control operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmcoEntry {
    pub memory_management_control_operation: u8,
    pub difference_of_pic_nums_minus1: u32,
    pub long_term_pic_num: u32,
    pub long_term_frame_idx: u8,
    pub max_long_term_frame_idx_plus1: u8,
}

/// Explicit weights for one reference picture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeightEntry {
    pub luma_weight_flag: bool,
    pub luma_weight: i8,
    pub luma_offset: i8,
    pub chroma_weight_flag: bool,
    pub chroma_weight: [i8; 2],
    pub chroma_offset: [i8; 2],
}

/// `pred_weight_table()`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,
    pub l0: Vec<WeightEntry>,
    pub l1: Vec<WeightEntry>,
}

/// Slice header, `slice_header()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceHeader {
    pub nal_unit_header: NalUnitHeader,

    pub first_mb_in_slice: u32,
    pub slice_type: u8,

    pub pic_parameter_set_id: u8,

    pub colour_plane_id: u8,

    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,

    pub idr_pic_id: u16,

    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],

    pub redundant_pic_cnt: u8,
    pub direct_spatial_mv_pred_flag: bool,

    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,

    pub ref_pic_list_modification_flag_l0: bool,
    /// Modification operations for list 0, ending with [RplmEntry::end].
    pub rplm_l0: Vec<RplmEntry>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub rplm_l1: Vec<RplmEntry>,

    pub pred_weight_table: PredWeightTable,

    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,

    pub adaptive_ref_pic_marking_mode_flag: bool,
    /// Memory management control operations, ending with operation 0.
    pub mmco: Vec<MmcoEntry>,

    pub cabac_init_idc: u8,

    pub slice_qp_delta: i8,

    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i8,

    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,

    pub slice_group_change_cycle: u32,
}

impl Default for SliceHeader {
    fn default() -> Self {
        Self {
            nal_unit_header: NalUnitHeader::new(3, NalUnitType::CodedSliceOfAnIDRPicture),
            first_mb_in_slice: 0,
            slice_type: 7,
            pic_parameter_set_id: 0,
            colour_plane_id: 0,
            frame_num: 0,
            field_pic_flag: false,
            bottom_field_flag: false,
            idr_pic_id: 0,
            pic_order_cnt_lsb: 0,
            delta_pic_order_cnt_bottom: 0,
            delta_pic_order_cnt: [0; 2],
            redundant_pic_cnt: 0,
            direct_spatial_mv_pred_flag: false,
            num_ref_idx_active_override_flag: false,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            ref_pic_list_modification_flag_l0: false,
            rplm_l0: Vec::new(),
            ref_pic_list_modification_flag_l1: false,
            rplm_l1: Vec::new(),
            pred_weight_table: PredWeightTable::default(),
            no_output_of_prior_pics_flag: false,
            long_term_reference_flag: false,
            adaptive_ref_pic_marking_mode_flag: false,
            mmco: Vec::new(),
            cabac_init_idc: 0,
            slice_qp_delta: 0,
            sp_for_switch_flag: false,
            slice_qs_delta: 0,
            disable_deblocking_filter_idc: 0,
            slice_alpha_c0_offset_div2: 0,
            slice_beta_offset_div2: 0,
            slice_group_change_cycle: 0,
        }
    }
}

impl SliceHeader {
    pub fn kind(&self) -> SliceType {
        SliceType::from_slice_type(self.slice_type)
    }
}

/// The macroblock layer of a slice, which is not parsed.
///
/// `data` is a sub-range of the unit buffer and `bit_start` the position of
/// the first bit after the header in its first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceData {
    pub data: Bytes,
    pub bit_start: u8,
}

/// A coded slice: header plus opaque slice data.
///
/// Without `data` only the header is written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Slice {
    pub header: SliceHeader,
    pub data: Option<SliceData>,
}

fn ref_pic_list_modification_list<S: SyntaxIo>(
    io: &mut S,
    list: &mut Vec<RplmEntry>,
    field_pic_flag: bool,
    sps: &Sps,
) -> Result<()> {
    let max_pic_num = 1u32
        .checked_shl(sps.frame_num_bits())
        .and_then(|max_frame_num| max_frame_num.checked_mul(1 + u32::from(field_pic_flag)))
        .ok_or_else(|| {
            Error::invalid_data(format!(
                "Invalid log2_max_frame_num_minus4 {}.",
                sps.log2_max_frame_num_minus4
            ))
        })?;
    for i in 0..MAX_RPLM_COUNT {
        io.entry("ref_pic_list_modification", list, i)?;
        let entry = &mut list[i];
        io.ue(
            "modification_of_pic_nums_idc",
            &mut entry.modification_of_pic_nums_idc,
            0,
            3,
        )?;
        match entry.modification_of_pic_nums_idc {
            0 | 1 => io.ue(
                "abs_diff_pic_num_minus1",
                &mut entry.abs_diff_pic_num_minus1,
                0,
                max_pic_num,
            )?,
            2 => io.ue(
                "long_term_pic_num",
                &mut entry.long_term_pic_num,
                0,
                u32::from(sps.max_num_ref_frames).saturating_sub(1),
            )?,
            _ => return Ok(()),
        }
    }
    Err(Error::invalid_data(
        "Too many reference picture list modification operations.",
    ))
}

fn ref_pic_list_modification<S: SyntaxIo>(
    io: &mut S,
    current: &mut SliceHeader,
    sps: &Sps,
) -> Result<()> {
    let kind = current.kind();
    if !kind.is_intra() {
        io.flag(
            "ref_pic_list_modification_flag_l0",
            &mut current.ref_pic_list_modification_flag_l0,
        )?;
        if current.ref_pic_list_modification_flag_l0 {
            ref_pic_list_modification_list(io, &mut current.rplm_l0, current.field_pic_flag, sps)?;
        }
    }

    if kind == SliceType::B {
        io.flag(
            "ref_pic_list_modification_flag_l1",
            &mut current.ref_pic_list_modification_flag_l1,
        )?;
        if current.ref_pic_list_modification_flag_l1 {
            ref_pic_list_modification_list(io, &mut current.rplm_l1, current.field_pic_flag, sps)?;
        }
    }
    Ok(())
}

fn weight_list<S: SyntaxIo>(
    io: &mut S,
    name: &str,
    list: &mut Vec<WeightEntry>,
    count: usize,
    chroma: bool,
) -> Result<()> {
    io.allocate(name, list, count)?;
    for entry in list.iter_mut().take(count) {
        io.flag("luma_weight_flag", &mut entry.luma_weight_flag)?;
        if entry.luma_weight_flag {
            io.se("luma_weight", &mut entry.luma_weight, -128, 127)?;
            io.se("luma_offset", &mut entry.luma_offset, -128, 127)?;
        }
        if chroma {
            io.flag("chroma_weight_flag", &mut entry.chroma_weight_flag)?;
            if entry.chroma_weight_flag {
                for j in 0..2 {
                    io.se("chroma_weight", &mut entry.chroma_weight[j], -128, 127)?;
                    io.se("chroma_offset", &mut entry.chroma_offset[j], -128, 127)?;
                }
            }
        }
    }
    Ok(())
}

fn pred_weight_table<S: SyntaxIo>(
    io: &mut S,
    current: &mut SliceHeader,
    sps: &Sps,
) -> Result<()> {
    let chroma = sps.has_chroma();
    let l0_count = usize::from(current.num_ref_idx_l0_active_minus1) + 1;
    let l1_count = usize::from(current.num_ref_idx_l1_active_minus1) + 1;
    let is_b = current.kind() == SliceType::B;
    let table = &mut current.pred_weight_table;

    io.ue(
        "luma_log2_weight_denom",
        &mut table.luma_log2_weight_denom,
        0,
        7,
    )?;
    if chroma {
        io.ue(
            "chroma_log2_weight_denom",
            &mut table.chroma_log2_weight_denom,
            0,
            7,
        )?;
    }

    weight_list(io, "luma_weight_l0", &mut table.l0, l0_count, chroma)?;
    if is_b {
        weight_list(io, "luma_weight_l1", &mut table.l1, l1_count, chroma)?;
    }
    Ok(())
}

fn dec_ref_pic_marking<S: SyntaxIo>(
    io: &mut S,
    current: &mut SliceHeader,
    idr_pic_flag: bool,
    sps: &Sps,
) -> Result<()> {
    if idr_pic_flag {
        io.flag(
            "no_output_of_prior_pics_flag",
            &mut current.no_output_of_prior_pics_flag,
        )?;
        io.flag(
            "long_term_reference_flag",
            &mut current.long_term_reference_flag,
        )?;
        return Ok(());
    }

    io.flag(
        "adaptive_ref_pic_marking_mode_flag",
        &mut current.adaptive_ref_pic_marking_mode_flag,
    )?;
    if !current.adaptive_ref_pic_marking_mode_flag {
        return Ok(());
    }

    let max_num_ref_frames = u32::from(sps.max_num_ref_frames);
    for i in 0..MAX_MMCO_COUNT {
        io.entry("memory_management_control_operation", &mut current.mmco, i)?;
        let entry = &mut current.mmco[i];
        io.ue(
            "memory_management_control_operation",
            &mut entry.memory_management_control_operation,
            0,
            6,
        )?;

        let mmco = entry.memory_management_control_operation;
        if mmco == 0 {
            return Ok(());
        }

        if mmco == 1 || mmco == 3 {
            io.ue(
                "difference_of_pic_nums_minus1",
                &mut entry.difference_of_pic_nums_minus1,
                0,
                i32::MAX as u32,
            )?;
        }
        if mmco == 2 {
            io.ue(
                "long_term_pic_num",
                &mut entry.long_term_pic_num,
                0,
                max_num_ref_frames.saturating_sub(1),
            )?;
        }
        if mmco == 3 || mmco == 6 {
            io.ue(
                "long_term_frame_idx",
                &mut entry.long_term_frame_idx,
                0,
                max_num_ref_frames.saturating_sub(1),
            )?;
        }
        if mmco == 4 {
            io.ue(
                "max_long_term_frame_idx_plus1",
                &mut entry.max_long_term_frame_idx_plus1,
                0,
                max_num_ref_frames,
            )?;
        }
    }

    Err(Error::invalid_data(
        "Too many memory management control operations.",
    ))
}

pub(crate) fn slice_header<S: SyntaxIo>(
    io: &mut S,
    current: &mut SliceHeader,
    ps: &mut ParameterSets,
) -> Result<()> {
    io.header("Slice Header");

    nal_unit_header(
        io,
        &mut current.nal_unit_header,
        1 << NalUnitType::CodedSliceOfANonIDRPicture.nal_unit_type()
            | 1 << NalUnitType::CodedSliceOfAnIDRPicture.nal_unit_type()
            | 1 << NalUnitType::CodedSliceOfAnAuxiliaryPicture.nal_unit_type(),
    )?;

    let nal_unit_type = NalUnitType::from(current.nal_unit_header.nal_unit_type);
    let idr = NalUnitType::CodedSliceOfAnIDRPicture.nal_unit_type();
    let idr_pic_flag = if nal_unit_type == NalUnitType::CodedSliceOfAnAuxiliaryPicture {
        if ps.last_slice_nal_unit_type() == 0 {
            return Err(Error::invalid_data(
                "Auxiliary slice is not decodable without the main picture in the same access unit.",
            ));
        }
        ps.last_slice_nal_unit_type() == idr
    } else {
        current.nal_unit_header.nal_unit_type == idr
    };

    io.ue(
        "first_mb_in_slice",
        &mut current.first_mb_in_slice,
        0,
        MAX_MB_PIC_SIZE - 1,
    )?;
    io.ue("slice_type", &mut current.slice_type, 0, 9)?;

    let kind = current.kind();
    if idr_pic_flag && !kind.is_intra() {
        return Err(Error::invalid_data(format!(
            "Invalid slice type {} for IDR picture.",
            current.slice_type
        )));
    }

    io.ue(
        "pic_parameter_set_id",
        &mut current.pic_parameter_set_id,
        0,
        255,
    )?;

    let pps = ps.lookup_pps(current.pic_parameter_set_id)?.clone();
    ps.set_active_pps(current.pic_parameter_set_id);
    let sps = ps.lookup_sps(pps.seq_parameter_set_id)?.clone();
    ps.set_active_sps(pps.seq_parameter_set_id);

    if sps.separate_colour_plane_flag {
        io.u(2, "colour_plane_id", &mut current.colour_plane_id, 0, 2)?;
    }

    let frame_num_bits = sps.frame_num_bits();
    if frame_num_bits > 16 {
        return Err(Error::invalid_data(format!(
            "Invalid log2_max_frame_num_minus4 {} in SPS {}.",
            sps.log2_max_frame_num_minus4, sps.seq_parameter_set_id
        )));
    }
    io.u(
        frame_num_bits,
        "frame_num",
        &mut current.frame_num,
        0,
        max_uint_bits(frame_num_bits),
    )?;

    if !sps.frame_mbs_only_flag {
        io.flag("field_pic_flag", &mut current.field_pic_flag)?;
        if current.field_pic_flag {
            io.flag("bottom_field_flag", &mut current.bottom_field_flag)?;
        } else {
            io.infer("bottom_field_flag", &mut current.bottom_field_flag, false)?;
        }
    } else {
        io.infer("field_pic_flag", &mut current.field_pic_flag, false)?;
        io.infer("bottom_field_flag", &mut current.bottom_field_flag, false)?;
    }

    if idr_pic_flag {
        io.ue("idr_pic_id", &mut current.idr_pic_id, 0, 65535)?;
    }

    let bottom_field_pic_order =
        pps.bottom_field_pic_order_in_frame_present_flag && !current.field_pic_flag;
    if sps.pic_order_cnt_type == 0 {
        let lsb_bits = sps.pic_order_cnt_lsb_bits();
        if lsb_bits > 16 {
            return Err(Error::invalid_data(format!(
                "Invalid log2_max_pic_order_cnt_lsb_minus4 {} in SPS {}.",
                sps.log2_max_pic_order_cnt_lsb_minus4, sps.seq_parameter_set_id
            )));
        }
        io.u(
            lsb_bits,
            "pic_order_cnt_lsb",
            &mut current.pic_order_cnt_lsb,
            0,
            max_uint_bits(lsb_bits),
        )?;
        if bottom_field_pic_order {
            io.se(
                "delta_pic_order_cnt_bottom",
                &mut current.delta_pic_order_cnt_bottom,
                i32::MIN + 1,
                i32::MAX,
            )?;
        }
    } else if sps.pic_order_cnt_type == 1 {
        if !sps.delta_pic_order_always_zero_flag {
            io.se(
                "delta_pic_order_cnt[0]",
                &mut current.delta_pic_order_cnt[0],
                i32::MIN + 1,
                i32::MAX,
            )?;
            if bottom_field_pic_order {
                io.se(
                    "delta_pic_order_cnt[1]",
                    &mut current.delta_pic_order_cnt[1],
                    i32::MIN + 1,
                    i32::MAX,
                )?;
            } else {
                io.infer("delta_pic_order_cnt[1]", &mut current.delta_pic_order_cnt[1], 0)?;
            }
        } else {
            io.infer("delta_pic_order_cnt[0]", &mut current.delta_pic_order_cnt[0], 0)?;
            io.infer("delta_pic_order_cnt[1]", &mut current.delta_pic_order_cnt[1], 0)?;
        }
    }

    if pps.redundant_pic_cnt_present_flag {
        io.ue("redundant_pic_cnt", &mut current.redundant_pic_cnt, 0, 127)?;
    } else {
        io.infer("redundant_pic_cnt", &mut current.redundant_pic_cnt, 0)?;
    }

    if nal_unit_type != NalUnitType::CodedSliceOfAnAuxiliaryPicture && current.redundant_pic_cnt == 0
    {
        ps.set_last_slice_nal_unit_type(current.nal_unit_header.nal_unit_type);
    }

    if kind == SliceType::B {
        io.flag(
            "direct_spatial_mv_pred_flag",
            &mut current.direct_spatial_mv_pred_flag,
        )?;
    }

    if matches!(kind, SliceType::P | SliceType::SP | SliceType::B) {
        io.flag(
            "num_ref_idx_active_override_flag",
            &mut current.num_ref_idx_active_override_flag,
        )?;
        if current.num_ref_idx_active_override_flag {
            io.ue(
                "num_ref_idx_l0_active_minus1",
                &mut current.num_ref_idx_l0_active_minus1,
                0,
                31,
            )?;
            if kind == SliceType::B {
                io.ue(
                    "num_ref_idx_l1_active_minus1",
                    &mut current.num_ref_idx_l1_active_minus1,
                    0,
                    31,
                )?;
            }
        } else {
            io.infer(
                "num_ref_idx_l0_active_minus1",
                &mut current.num_ref_idx_l0_active_minus1,
                pps.num_ref_idx_l0_default_active_minus1,
            )?;
            io.infer(
                "num_ref_idx_l1_active_minus1",
                &mut current.num_ref_idx_l1_active_minus1,
                pps.num_ref_idx_l1_default_active_minus1,
            )?;
        }
    }

    ref_pic_list_modification(io, current, &sps)?;

    if (pps.weighted_pred_flag && matches!(kind, SliceType::P | SliceType::SP))
        || (pps.weighted_bipred_idc == 1 && kind == SliceType::B)
    {
        pred_weight_table(io, current, &sps)?;
    }

    if current.nal_unit_header.nal_ref_idc != 0 {
        dec_ref_pic_marking(io, current, idr_pic_flag, &sps)?;
    }

    if pps.entropy_coding_mode_flag && !kind.is_intra() {
        io.ue("cabac_init_idc", &mut current.cabac_init_idc, 0, 2)?;
    }

    let qp_range = 51 + 6 * i32::from(sps.bit_depth_luma_minus8);
    io.se(
        "slice_qp_delta",
        &mut current.slice_qp_delta,
        -qp_range,
        qp_range,
    )?;
    if matches!(kind, SliceType::SP | SliceType::SI) {
        if kind == SliceType::SP {
            io.flag("sp_for_switch_flag", &mut current.sp_for_switch_flag)?;
        }
        io.se("slice_qs_delta", &mut current.slice_qs_delta, -51, 51)?;
    }

    if pps.deblocking_filter_control_present_flag {
        io.ue(
            "disable_deblocking_filter_idc",
            &mut current.disable_deblocking_filter_idc,
            0,
            2,
        )?;
        if current.disable_deblocking_filter_idc != 1 {
            io.se(
                "slice_alpha_c0_offset_div2",
                &mut current.slice_alpha_c0_offset_div2,
                -6,
                6,
            )?;
            io.se(
                "slice_beta_offset_div2",
                &mut current.slice_beta_offset_div2,
                -6,
                6,
            )?;
        } else {
            io.infer(
                "slice_alpha_c0_offset_div2",
                &mut current.slice_alpha_c0_offset_div2,
                0,
            )?;
            io.infer(
                "slice_beta_offset_div2",
                &mut current.slice_beta_offset_div2,
                0,
            )?;
        }
    } else {
        io.infer(
            "disable_deblocking_filter_idc",
            &mut current.disable_deblocking_filter_idc,
            0,
        )?;
        io.infer(
            "slice_alpha_c0_offset_div2",
            &mut current.slice_alpha_c0_offset_div2,
            0,
        )?;
        io.infer(
            "slice_beta_offset_div2",
            &mut current.slice_beta_offset_div2,
            0,
        )?;
    }

    if pps.num_slice_groups_minus1 > 0 && (3..=5).contains(&pps.slice_group_map_type) {
        let pic_size = sps.pic_size_in_map_units();
        let max = pps
            .slice_group_change_rate_minus1
            .checked_add(1)
            .map(|rate| pic_size.div_ceil(rate))
            .filter(|max| *max > 0)
            .ok_or_else(|| {
                Error::invalid_data(format!(
                    "Invalid slice_group_change_rate_minus1 {} for {pic_size} map units.",
                    pps.slice_group_change_rate_minus1
                ))
            })?;
        // Ceil(Log2(max)), matching the width of Log2(2 * max - 1).
        let bits = log2(max) + u32::from(!max.is_power_of_two());
        io.u(
            bits,
            "slice_group_change_cycle",
            &mut current.slice_group_change_cycle,
            0,
            max,
        )?;
    }

    if pps.entropy_coding_mode_flag {
        while !io.byte_aligned() {
            io.fixed(1, "cabac_alignment_one_bit", 1)?;
        }
    }

    Ok(())
}

impl SliceData {
    /// The data following a header of `header_bits` bits in `unit_data`.
    ///
    /// Trailing zero bytes (`cabac_zero_word` or stream padding) are dropped.
    fn from_unit(unit_data: &Bytes, header_bits: usize) -> Option<Self> {
        let mut len = unit_data.len();
        let zeroes = unit_data.iter().rev().take_while(|b| **b == 0).count();
        if zeroes > 0 {
            log::debug!("Deleted {zeroes} trailing zeroes from slice data.");
            len -= zeroes;
        }

        let start = header_bits / 8;
        if start >= len {
            return None;
        }
        Some(Self {
            data: unit_data.slice(start..len),
            bit_start: (header_bits % 8) as u8,
        })
    }
}

pub(crate) fn read_slice(unit_data: &Bytes, ps: &mut ParameterSets, trace: bool) -> Result<Slice> {
    let mut header = SliceHeader::default();
    let mut r = BitReader::new(unit_data, trace);
    slice_header(&mut r, &mut header, ps)?;
    let data = SliceData::from_unit(unit_data, r.position());
    Ok(Slice { header, data })
}

/// Write the slice data bits up to, but not including, the stop bit, then
/// the RBSP trailing bits.
fn slice_data(w: &mut BitWriter, data: &SliceData) -> Result<()> {
    let bits = BitSlice::<u8, Msb0>::from_slice(&data.data);
    let payload = bits
        .get(usize::from(data.bit_start)..)
        .ok_or_else(|| Error::invalid_data("Slice data bit start out of range."))?;
    let stop = payload
        .last_one()
        .ok_or_else(|| Error::invalid_data("Slice data has no rbsp_stop_one_bit."))?;
    w.write_bitslice(&payload[..stop])?;
    rbsp_trailing_bits(w)
}

pub(crate) fn write_slice(w: &mut BitWriter, current: &mut Slice, ps: &mut ParameterSets) -> Result<()> {
    slice_header(w, &mut current.header, ps)?;
    if let Some(data) = &current.data {
        slice_data(w, data)?;
    }
    // Without data the header alone was requested, possibly unaligned.
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pps::Pps;
    use crate::pps::tests::{hello_parameter_sets, HELLO_PPS};
    use alloc::sync::Arc;

    // IDR slice header from the hello example, with nal_ref_idc 1.
    pub(crate) const HELLO_SLICE: &[u8] = &[0x25, 0x88, 0x84, 0x28, 0x68];

    pub(crate) fn hello_with_pps() -> ParameterSets {
        let mut ps = hello_parameter_sets();
        let mut pps = Pps::default();
        crate::pps::pps(&mut BitReader::new(HELLO_PPS, false), &mut pps, &ps).unwrap();
        ps.replace_pps(Arc::new(pps));
        ps
    }

    fn write(current: &mut Slice, ps: &mut ParameterSets) -> Result<(Vec<u8>, u8)> {
        let mut w = BitWriter::new(1024, false);
        write_slice(&mut w, current, ps)?;
        Ok(w.into_bytes())
    }

    /// Parameter sets with weighted prediction, CABAC and four reference
    /// frames, for 8x6 macroblocks.
    fn inter_parameter_sets() -> ParameterSets {
        let mut ps = ParameterSets::new();
        ps.replace_sps(Arc::new(Sps {
            profile_idc: 77,
            pic_width_in_mbs_minus1: 7,
            pic_height_in_map_units_minus1: 5,
            max_num_ref_frames: 4,
            pic_order_cnt_type: 2,
            ..Default::default()
        }));
        ps.replace_pps(Arc::new(Pps {
            pic_parameter_set_id: 1,
            entropy_coding_mode_flag: true,
            weighted_pred_flag: true,
            weighted_bipred_idc: 1,
            num_ref_idx_l0_default_active_minus1: 1,
            deblocking_filter_control_present_flag: true,
            ..Default::default()
        }));
        ps
    }

    #[test]
    fn test_hello_slice_roundtrip() {
        let mut ps = hello_with_pps();
        let data = Bytes::from_static(HELLO_SLICE);
        let mut slice = read_slice(&data, &mut ps, false).unwrap();

        assert_eq!(slice.header.kind(), SliceType::I);
        assert_eq!(slice.header.slice_type, 7);
        assert!(slice.header.no_output_of_prior_pics_flag);
        assert_eq!(ps.last_slice_nal_unit_type(), 5);
        assert_eq!(ps.active_pps().unwrap().pic_parameter_set_id, 0);
        assert!(ps.active_sps().is_some());

        let slice_data = slice.data.clone().unwrap();
        assert_eq!(slice_data.bit_start, 5);
        assert_eq!(&slice_data.data[..], &HELLO_SLICE[3..]);

        let (written, padding) = write(&mut slice, &mut ps).unwrap();
        assert_eq!(written, HELLO_SLICE);
        assert_eq!(padding, 0);
    }

    #[test]
    fn test_hello_slice_matches_h264_reader() {
        use h264_reader::nal::{pps::PicParameterSet, sps::SeqParameterSet, Nal, RefNal};
        use h264_reader::Context;

        let mut ctx = Context::default();
        ctx.put_seq_param_set(
            SeqParameterSet::from_bits(h264_reader::rbsp::BitReader::new(
                &crate::sps::tests::HELLO_SPS[1..],
            ))
            .unwrap(),
        );
        let pps = PicParameterSet::from_bits(&ctx, h264_reader::rbsp::BitReader::new(&HELLO_PPS[1..]))
            .unwrap();
        ctx.put_pic_param_set(pps);

        let nal = RefNal::new(HELLO_SLICE, &[], true);
        let theirs = h264_reader::nal::slice::SliceHeader::from_bits(
            &ctx,
            &mut nal.rbsp_bits(),
            nal.header().unwrap(),
        )
        .unwrap()
        .0;

        let mut ps = hello_with_pps();
        let ours = read_slice(&Bytes::from_static(HELLO_SLICE), &mut ps, false)
            .unwrap()
            .header;
        assert_eq!(theirs.first_mb_in_slice, ours.first_mb_in_slice);
        assert_eq!(theirs.frame_num, ours.frame_num);
        assert_eq!(theirs.slice_qp_delta, i32::from(ours.slice_qp_delta));
    }

    #[test]
    fn test_trailing_zeroes_trimmed() {
        let mut ps = hello_with_pps();
        let mut padded = HELLO_SLICE.to_vec();
        padded.extend_from_slice(&[0, 0, 0]);
        let mut slice = read_slice(&Bytes::from(padded), &mut ps, false).unwrap();
        assert_eq!(slice.data.as_ref().unwrap().data.len(), 2);
        assert_eq!(write(&mut slice, &mut ps).unwrap().0, HELLO_SLICE);
    }

    #[test]
    fn test_slice_data_without_stop_bit() {
        let mut ps = hello_with_pps();
        let mut slice = read_slice(&Bytes::from_static(HELLO_SLICE), &mut ps, false).unwrap();
        slice.data = Some(SliceData {
            data: Bytes::from_static(&[0xf8]),
            bit_start: 5,
        });
        let err = write(&mut slice, &mut ps).unwrap_err();
        assert!(format!("{err}").contains("rbsp_stop_one_bit"), "{err}");
    }

    #[test]
    fn test_header_only_write() {
        let mut ps = hello_with_pps();
        let mut slice = read_slice(&Bytes::from_static(HELLO_SLICE), &mut ps, false).unwrap();
        slice.data = None;
        let (written, padding) = write(&mut slice, &mut ps).unwrap();
        assert_eq!(written, [0x25, 0x88, 0x84, 0x28]);
        assert_eq!(padding, 3);
    }

    #[test]
    fn test_idr_requires_intra_slice() {
        let mut ps = hello_with_pps();
        let mut slice = Slice::default();
        slice.header.slice_type = 5;
        let err = write(&mut slice, &mut ps).unwrap_err();
        assert!(format!("{err}").contains("Invalid slice type 5 for IDR picture."));
    }

    #[test]
    fn test_missing_pps() {
        let mut ps = hello_parameter_sets();
        let err = read_slice(&Bytes::from_static(HELLO_SLICE), &mut ps, false).unwrap_err();
        assert!(matches!(
            err,
            Error::ReferenceNotAvailable { kind: "PPS", .. }
        ));
    }

    #[test]
    fn test_auxiliary_slice_uses_last_primary_type() {
        let mut ps = hello_with_pps();
        let mut aux = Slice::default();
        aux.header.nal_unit_header = NalUnitHeader::new(1, NalUnitType::CodedSliceOfAnAuxiliaryPicture);
        let err = write(&mut aux, &mut ps).unwrap_err();
        assert!(format!("{err}").contains("Auxiliary slice is not decodable"));

        // After an IDR slice the auxiliary slice is IDR too and carries
        // idr_pic_id.
        let mut primary = Slice::default();
        primary.header.idr_pic_id = 3;
        write(&mut primary, &mut ps).unwrap();
        assert_eq!(ps.last_slice_nal_unit_type(), 5);

        aux.header.idr_pic_id = 3;
        let (written, _) = write(&mut aux, &mut ps).unwrap();
        let parsed = read_slice(&Bytes::from(written), &mut ps, false).unwrap();
        assert_eq!(parsed.header, aux.header);
        // Auxiliary slices do not change the last primary type.
        assert_eq!(ps.last_slice_nal_unit_type(), 5);
    }

    #[test]
    fn test_inter_slice_roundtrip() {
        let mut ps = inter_parameter_sets();
        let mut slice = Slice::default();
        let header = &mut slice.header;
        header.nal_unit_header = NalUnitHeader::new(2, NalUnitType::CodedSliceOfANonIDRPicture);
        header.slice_type = 0;
        header.pic_parameter_set_id = 1;
        header.frame_num = 9;
        header.num_ref_idx_l0_active_minus1 = 1;
        header.ref_pic_list_modification_flag_l0 = true;
        header.rplm_l0 = alloc::vec![
            RplmEntry {
                modification_of_pic_nums_idc: 0,
                abs_diff_pic_num_minus1: 2,
                ..Default::default()
            },
            RplmEntry {
                modification_of_pic_nums_idc: 2,
                long_term_pic_num: 3,
                ..Default::default()
            },
            RplmEntry::end(),
        ];
        header.pred_weight_table.luma_log2_weight_denom = 5;
        header.pred_weight_table.chroma_log2_weight_denom = 2;
        header.pred_weight_table.l0 = alloc::vec![
            WeightEntry {
                luma_weight_flag: true,
                luma_weight: 40,
                luma_offset: -3,
                ..Default::default()
            },
            WeightEntry {
                chroma_weight_flag: true,
                chroma_weight: [4, -4],
                chroma_offset: [1, 127],
                ..Default::default()
            },
        ];
        header.adaptive_ref_pic_marking_mode_flag = true;
        header.mmco = alloc::vec![
            MmcoEntry {
                memory_management_control_operation: 3,
                difference_of_pic_nums_minus1: 1,
                long_term_frame_idx: 2,
                ..Default::default()
            },
            MmcoEntry {
                memory_management_control_operation: 4,
                max_long_term_frame_idx_plus1: 4,
                ..Default::default()
            },
            MmcoEntry::default(),
        ];
        header.cabac_init_idc = 2;
        header.slice_qp_delta = -10;
        header.disable_deblocking_filter_idc = 2;
        header.slice_alpha_c0_offset_div2 = -6;
        header.slice_beta_offset_div2 = 6;

        let (written, padding) = write(&mut slice, &mut ps).unwrap();
        // cabac_alignment_one_bit fills the final byte.
        assert_eq!(padding, 0);

        let parsed = read_slice(&Bytes::from(written), &mut ps, false).unwrap();
        assert_eq!(parsed.header, slice.header);
        assert!(parsed.data.is_none());
        assert_eq!(ps.last_slice_nal_unit_type(), 1);
    }

    #[test]
    fn test_inter_slice_limits() {
        let mut ps = inter_parameter_sets();
        let mut slice = Slice::default();
        slice.header.nal_unit_header = NalUnitHeader::new(2, NalUnitType::CodedSliceOfANonIDRPicture);
        slice.header.slice_type = 5;
        slice.header.pic_parameter_set_id = 1;
        slice.header.num_ref_idx_l0_active_minus1 = 1;
        slice.header.pred_weight_table.l0 = alloc::vec![WeightEntry::default(); 2];

        // The reference count must match the PPS default without override.
        slice.header.num_ref_idx_l1_active_minus1 = 3;
        let err = write(&mut slice, &mut ps).unwrap_err();
        assert!(format!("{err}").contains("num_ref_idx_l1_active_minus1"));
        slice.header.num_ref_idx_l1_active_minus1 = 0;
        write(&mut slice, &mut ps).unwrap();

        // Long term picture numbers are bounded by max_num_ref_frames.
        slice.header.ref_pic_list_modification_flag_l0 = true;
        slice.header.rplm_l0 = alloc::vec![
            RplmEntry {
                modification_of_pic_nums_idc: 2,
                long_term_pic_num: 4,
                ..Default::default()
            },
            RplmEntry::end(),
        ];
        assert!(write(&mut slice, &mut ps).is_err());

        // A list without terminator cannot be written.
        slice.header.rplm_l0 = alloc::vec![RplmEntry::default()];
        let err = write(&mut slice, &mut ps).unwrap_err();
        assert!(format!("{err}").contains("not terminated"), "{err}");
        slice.header.ref_pic_list_modification_flag_l0 = false;

        slice.header.adaptive_ref_pic_marking_mode_flag = true;
        slice.header.mmco = alloc::vec![
            MmcoEntry {
                memory_management_control_operation: 5,
                ..Default::default()
            };
            MAX_MMCO_COUNT
        ];
        let err = write(&mut slice, &mut ps).unwrap_err();
        assert!(
            format!("{err}").contains("Too many memory management control operations."),
            "{err}"
        );
    }

    #[test]
    fn test_out_of_range_cached_sps() {
        let mut ps = ParameterSets::new();
        ps.replace_sps(Arc::new(Sps {
            log2_max_frame_num_minus4: 28,
            pic_order_cnt_type: 2,
            ..Default::default()
        }));
        ps.replace_pps(Arc::new(Pps::default()));

        let mut slice = Slice::default();
        slice.header.nal_unit_header = NalUnitHeader::new(2, NalUnitType::CodedSliceOfANonIDRPicture);
        slice.header.slice_type = 0;
        slice.header.ref_pic_list_modification_flag_l0 = true;
        slice.header.rplm_l0 = alloc::vec![RplmEntry::end()];
        let err = write(&mut slice, &mut ps).unwrap_err();
        assert!(matches!(err, Error::InvalidData { .. }), "{err}");
        assert!(format!("{err}").contains("log2_max_frame_num_minus4 28"), "{err}");

        // The list width is checked on its own too.
        let mut w = BitWriter::new(64, false);
        let sps = ps.lookup_sps(0).unwrap().clone();
        let mut list = alloc::vec![RplmEntry::end()];
        let err = ref_pic_list_modification_list(&mut w, &mut list, true, &sps).unwrap_err();
        assert!(matches!(err, Error::InvalidData { .. }), "{err}");
    }

    #[test]
    fn test_slice_group_change_cycle() {
        let mut ps = ParameterSets::new();
        ps.replace_sps(Arc::new(Sps {
            pic_width_in_mbs_minus1: 7,
            pic_height_in_map_units_minus1: 5,
            pic_order_cnt_type: 2,
            ..Default::default()
        }));
        ps.replace_pps(Arc::new(Pps {
            num_slice_groups_minus1: 1,
            slice_group_map_type: 3,
            ..Default::default()
        }));

        // 48 map units changing one at a time take 6 bits.
        let mut slice = Slice::default();
        slice.header.slice_group_change_cycle = 48;
        let (written, _) = write(&mut slice, &mut ps).unwrap();
        let parsed = read_slice(&Bytes::from(written), &mut ps, false).unwrap();
        assert_eq!(parsed.header.slice_group_change_cycle, 48);
        slice.header.slice_group_change_cycle = 49;
        assert!(write(&mut slice, &mut ps).is_err());

        ps.replace_pps(Arc::new(Pps {
            num_slice_groups_minus1: 1,
            slice_group_map_type: 3,
            slice_group_change_rate_minus1: u32::MAX,
            ..Default::default()
        }));
        slice.header.slice_group_change_cycle = 0;
        let err = write(&mut slice, &mut ps).unwrap_err();
        assert!(
            format!("{err}").contains("Invalid slice_group_change_rate_minus1"),
            "{err}"
        );
    }
}
