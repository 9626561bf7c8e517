// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Picture parameter set (PPS) syntax.

use alloc::vec::Vec;

use crate::bitstream::{rbsp_trailing_bits, SyntaxIo};
use crate::nal_unit::{nal_unit_header, NalUnitHeader, NalUnitType};
use crate::parameter_sets::ParameterSets;
use crate::sps::{scaling_list, ScalingList};
use crate::{log2, Result};

/// Picture parameter set, `pic_parameter_set_rbsp()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pps {
    pub nal_unit_header: NalUnitHeader,

    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,

    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,

    pub num_slice_groups_minus1: u8,
    pub slice_group_map_type: u8,
    pub run_length_minus1: [u32; 8],
    pub top_left: [u32; 8],
    pub bottom_right: [u32; 8],
    pub slice_group_change_direction_flag: bool,
    pub slice_group_change_rate_minus1: u32,
    pub pic_size_in_map_units_minus1: u32,
    pub slice_group_id: Vec<u8>,

    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,

    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,

    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,

    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,

    /// Whether the fields from `transform_8x8_mode_flag` onwards are coded.
    pub more_rbsp_data: bool,

    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,
    pub pic_scaling_list_present_flag: [bool; 12],
    pub scaling_list_4x4: [ScalingList; 6],
    pub scaling_list_8x8: [ScalingList; 6],

    pub second_chroma_qp_index_offset: i8,
}

impl Default for Pps {
    fn default() -> Self {
        Self {
            nal_unit_header: NalUnitHeader::new(3, NalUnitType::PictureParameterSet),
            pic_parameter_set_id: 0,
            seq_parameter_set_id: 0,
            entropy_coding_mode_flag: false,
            bottom_field_pic_order_in_frame_present_flag: false,
            num_slice_groups_minus1: 0,
            slice_group_map_type: 0,
            run_length_minus1: [0; 8],
            top_left: [0; 8],
            bottom_right: [0; 8],
            slice_group_change_direction_flag: false,
            slice_group_change_rate_minus1: 0,
            pic_size_in_map_units_minus1: 0,
            slice_group_id: Vec::new(),
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            more_rbsp_data: false,
            transform_8x8_mode_flag: false,
            pic_scaling_matrix_present_flag: false,
            pic_scaling_list_present_flag: [false; 12],
            scaling_list_4x4: Default::default(),
            scaling_list_8x8: Default::default(),
            second_chroma_qp_index_offset: 0,
        }
    }
}

pub(crate) fn pps<S: SyntaxIo>(io: &mut S, current: &mut Pps, ps: &ParameterSets) -> Result<()> {
    io.header("Picture Parameter Set");

    nal_unit_header(
        io,
        &mut current.nal_unit_header,
        1 << NalUnitType::PictureParameterSet.nal_unit_type(),
    )?;

    io.ue(
        "pic_parameter_set_id",
        &mut current.pic_parameter_set_id,
        0,
        255,
    )?;
    io.ue(
        "seq_parameter_set_id",
        &mut current.seq_parameter_set_id,
        0,
        31,
    )?;

    let sps = ps.lookup_sps(current.seq_parameter_set_id)?;

    io.flag(
        "entropy_coding_mode_flag",
        &mut current.entropy_coding_mode_flag,
    )?;
    io.flag(
        "bottom_field_pic_order_in_frame_present_flag",
        &mut current.bottom_field_pic_order_in_frame_present_flag,
    )?;

    io.ue(
        "num_slice_groups_minus1",
        &mut current.num_slice_groups_minus1,
        0,
        7,
    )?;
    if current.num_slice_groups_minus1 > 0 {
        let pic_size = sps.pic_size_in_map_units();
        let groups = usize::from(current.num_slice_groups_minus1);

        io.ue(
            "slice_group_map_type",
            &mut current.slice_group_map_type,
            0,
            6,
        )?;

        match current.slice_group_map_type {
            0 => {
                for i in 0..=groups {
                    io.ue(
                        "run_length_minus1",
                        &mut current.run_length_minus1[i],
                        0,
                        pic_size - 1,
                    )?;
                }
            }
            2 => {
                for i in 0..groups {
                    io.ue("top_left", &mut current.top_left[i], 0, pic_size - 1)?;
                    let top_left = current.top_left[i];
                    io.ue(
                        "bottom_right",
                        &mut current.bottom_right[i],
                        top_left,
                        pic_size - 1,
                    )?;
                }
            }
            3..=5 => {
                io.flag(
                    "slice_group_change_direction_flag",
                    &mut current.slice_group_change_direction_flag,
                )?;
                io.ue(
                    "slice_group_change_rate_minus1",
                    &mut current.slice_group_change_rate_minus1,
                    0,
                    pic_size - 1,
                )?;
            }
            6 => {
                io.ue(
                    "pic_size_in_map_units_minus1",
                    &mut current.pic_size_in_map_units_minus1,
                    pic_size - 1,
                    pic_size - 1,
                )?;

                let len = current.pic_size_in_map_units_minus1 as usize + 1;
                io.allocate("slice_group_id", &mut current.slice_group_id, len)?;
                let bits = log2(2 * u32::from(current.num_slice_groups_minus1) + 1);
                for i in 0..len {
                    io.u(
                        bits,
                        "slice_group_id",
                        &mut current.slice_group_id[i],
                        0,
                        u32::from(current.num_slice_groups_minus1),
                    )?;
                }
            }
            // Map type 1 (dispersed) has no parameters.
            _ => {}
        }
    }

    io.ue(
        "num_ref_idx_l0_default_active_minus1",
        &mut current.num_ref_idx_l0_default_active_minus1,
        0,
        31,
    )?;
    io.ue(
        "num_ref_idx_l1_default_active_minus1",
        &mut current.num_ref_idx_l1_default_active_minus1,
        0,
        31,
    )?;

    io.flag("weighted_pred_flag", &mut current.weighted_pred_flag)?;
    io.u(
        2,
        "weighted_bipred_idc",
        &mut current.weighted_bipred_idc,
        0,
        2,
    )?;

    io.se(
        "pic_init_qp_minus26",
        &mut current.pic_init_qp_minus26,
        -26 - 6 * i32::from(sps.bit_depth_luma_minus8),
        25,
    )?;
    io.se(
        "pic_init_qs_minus26",
        &mut current.pic_init_qs_minus26,
        -26,
        25,
    )?;
    io.se(
        "chroma_qp_index_offset",
        &mut current.chroma_qp_index_offset,
        -12,
        12,
    )?;

    io.flag(
        "deblocking_filter_control_present_flag",
        &mut current.deblocking_filter_control_present_flag,
    )?;
    io.flag(
        "constrained_intra_pred_flag",
        &mut current.constrained_intra_pred_flag,
    )?;
    io.flag(
        "redundant_pic_cnt_present_flag",
        &mut current.redundant_pic_cnt_present_flag,
    )?;

    io.more_rbsp_data(&mut current.more_rbsp_data)?;
    if current.more_rbsp_data {
        io.flag(
            "transform_8x8_mode_flag",
            &mut current.transform_8x8_mode_flag,
        )?;

        io.flag(
            "pic_scaling_matrix_present_flag",
            &mut current.pic_scaling_matrix_present_flag,
        )?;
        if current.pic_scaling_matrix_present_flag {
            let lists_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };
            let count = 6 + lists_8x8 * usize::from(current.transform_8x8_mode_flag);
            for i in 0..count {
                io.flag(
                    "pic_scaling_list_present_flag",
                    &mut current.pic_scaling_list_present_flag[i],
                )?;
                if current.pic_scaling_list_present_flag[i] {
                    if i < 6 {
                        scaling_list(io, &mut current.scaling_list_4x4[i], 16)?;
                    } else {
                        scaling_list(io, &mut current.scaling_list_8x8[i - 6], 64)?;
                    }
                }
            }
        }

        io.se(
            "second_chroma_qp_index_offset",
            &mut current.second_chroma_qp_index_offset,
            -12,
            12,
        )?;
    } else {
        io.infer(
            "transform_8x8_mode_flag",
            &mut current.transform_8x8_mode_flag,
            false,
        )?;
        io.infer(
            "pic_scaling_matrix_present_flag",
            &mut current.pic_scaling_matrix_present_flag,
            false,
        )?;
        let chroma_qp_index_offset = current.chroma_qp_index_offset;
        io.infer(
            "second_chroma_qp_index_offset",
            &mut current.second_chroma_qp_index_offset,
            chroma_qp_index_offset,
        )?;
    }

    rbsp_trailing_bits(io)
}
