// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sequence parameter set (SPS) syntax, including VUI and HRD parameters.

use alloc::vec::Vec;

use crate::bitstream::{rbsp_trailing_bits, SyntaxIo};
use crate::nal_unit::{nal_unit_header, NalUnitHeader, NalUnitType};
use crate::{max_uint_bits, Result, MAX_DPB_FRAMES, MAX_HEIGHT, MAX_MB_HEIGHT, MAX_MB_WIDTH, MAX_WIDTH};

/// Profiles which carry chroma format, bit depth and scaling matrices in the
/// SPS.
const HIGH_PROFILES: [u8; 10] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138];

/// Profiles which, with `constraint_set3_flag`, are intra-only and therefore
/// need no reordering or frame buffering.
const INTRA_PROFILES: [u8; 6] = [44, 86, 100, 110, 122, 244];

/// Delta coded scaling list, `scaling_list()` in H.264 section 7.3.2.1.1.1.
///
/// Only the coded deltas are stored. Entries after the point where the
/// running scale reaches zero are not coded and remain zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingList {
    pub delta_scale: [i8; 64],
}

impl Default for ScalingList {
    fn default() -> Self {
        Self {
            delta_scale: [0; 64],
        }
    }
}

pub(crate) fn scaling_list<S: SyntaxIo>(
    io: &mut S,
    current: &mut ScalingList,
    size_of_scaling_list: usize,
) -> Result<()> {
    let mut scale: i32 = 8;
    for i in 0..size_of_scaling_list {
        io.se("delta_scale", &mut current.delta_scale[i], -128, 127)?;
        scale = (scale + i32::from(current.delta_scale[i]) + 256) % 256;
        if scale == 0 {
            break;
        }
    }
    Ok(())
}

/// Hypothetical reference decoder parameters, `hrd_parameters()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hrd {
    pub cpb_cnt_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,

    pub bit_rate_value_minus1: [u32; crate::MAX_CPB_CNT],
    pub cpb_size_value_minus1: [u32; crate::MAX_CPB_CNT],
    pub cbr_flag: [bool; crate::MAX_CPB_CNT],

    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

fn hrd_parameters<S: SyntaxIo>(io: &mut S, current: &mut Hrd) -> Result<()> {
    io.ue("cpb_cnt_minus1", &mut current.cpb_cnt_minus1, 0, 31)?;
    io.u(4, "bit_rate_scale", &mut current.bit_rate_scale, 0, 15)?;
    io.u(4, "cpb_size_scale", &mut current.cpb_size_scale, 0, 15)?;

    for i in 0..=usize::from(current.cpb_cnt_minus1) {
        io.ue(
            "bit_rate_value_minus1",
            &mut current.bit_rate_value_minus1[i],
            0,
            u32::MAX - 1,
        )?;
        io.ue(
            "cpb_size_value_minus1",
            &mut current.cpb_size_value_minus1[i],
            0,
            u32::MAX - 1,
        )?;
        io.flag("cbr_flag", &mut current.cbr_flag[i])?;
    }

    io.u(
        5,
        "initial_cpb_removal_delay_length_minus1",
        &mut current.initial_cpb_removal_delay_length_minus1,
        0,
        31,
    )?;
    io.u(
        5,
        "cpb_removal_delay_length_minus1",
        &mut current.cpb_removal_delay_length_minus1,
        0,
        31,
    )?;
    io.u(
        5,
        "dpb_output_delay_length_minus1",
        &mut current.dpb_output_delay_length_minus1,
        0,
        31,
    )?;
    io.u(5, "time_offset_length", &mut current.time_offset_length, 0, 31)?;
    Ok(())
}

/// Video usability information, `vui_parameters()`.
///
/// The [Default] value holds the values inferred when the VUI is absent
/// from an SPS with a profile that is not intra-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vui {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: Hrd,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: Hrd,
    pub low_delay_hrd_flag: bool,

    pub pic_struct_present_flag: bool,

    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u8,
    pub max_bits_per_mb_denom: u8,
    pub log2_max_mv_length_horizontal: u8,
    pub log2_max_mv_length_vertical: u8,
    pub max_num_reorder_frames: u8,
    pub max_dec_frame_buffering: u8,
}

impl Default for Vui {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: false,
            aspect_ratio_idc: 0,
            sar_width: 0,
            sar_height: 0,
            overscan_info_present_flag: false,
            overscan_appropriate_flag: false,
            video_signal_type_present_flag: false,
            video_format: 5,
            video_full_range_flag: false,
            colour_description_present_flag: false,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
            chroma_loc_info_present_flag: false,
            chroma_sample_loc_type_top_field: 0,
            chroma_sample_loc_type_bottom_field: 0,
            timing_info_present_flag: false,
            num_units_in_tick: 0,
            time_scale: 0,
            fixed_frame_rate_flag: false,
            nal_hrd_parameters_present_flag: false,
            nal_hrd_parameters: Hrd::default(),
            vcl_hrd_parameters_present_flag: false,
            vcl_hrd_parameters: Hrd::default(),
            low_delay_hrd_flag: true,
            pic_struct_present_flag: false,
            bitstream_restriction_flag: false,
            motion_vectors_over_pic_boundaries_flag: true,
            max_bytes_per_pic_denom: 2,
            max_bits_per_mb_denom: 1,
            log2_max_mv_length_horizontal: 15,
            log2_max_mv_length_vertical: 15,
            max_num_reorder_frames: MAX_DPB_FRAMES as u8,
            max_dec_frame_buffering: MAX_DPB_FRAMES as u8,
        }
    }
}

impl Vui {
    /// The hrd parameters used for timing, preferring NAL over VCL.
    pub fn hrd(&self) -> Option<&Hrd> {
        if self.nal_hrd_parameters_present_flag {
            Some(&self.nal_hrd_parameters)
        } else if self.vcl_hrd_parameters_present_flag {
            Some(&self.vcl_hrd_parameters)
        } else {
            None
        }
    }
}

/// Inferred `max_num_reorder_frames` and `max_dec_frame_buffering`.
fn inferred_dpb_frames(profile_idc: u8, constraint_set3_flag: bool) -> u8 {
    if INTRA_PROFILES.contains(&profile_idc) && constraint_set3_flag {
        0
    } else {
        MAX_DPB_FRAMES as u8
    }
}

fn infer_bitstream_restriction<S: SyntaxIo>(
    io: &mut S,
    current: &mut Vui,
    profile_idc: u8,
    constraint_set3_flag: bool,
) -> Result<()> {
    io.infer(
        "motion_vectors_over_pic_boundaries_flag",
        &mut current.motion_vectors_over_pic_boundaries_flag,
        true,
    )?;
    io.infer(
        "max_bytes_per_pic_denom",
        &mut current.max_bytes_per_pic_denom,
        2,
    )?;
    io.infer("max_bits_per_mb_denom", &mut current.max_bits_per_mb_denom, 1)?;
    io.infer(
        "log2_max_mv_length_horizontal",
        &mut current.log2_max_mv_length_horizontal,
        15,
    )?;
    io.infer(
        "log2_max_mv_length_vertical",
        &mut current.log2_max_mv_length_vertical,
        15,
    )?;

    let frames = inferred_dpb_frames(profile_idc, constraint_set3_flag);
    io.infer(
        "max_num_reorder_frames",
        &mut current.max_num_reorder_frames,
        frames,
    )?;
    io.infer(
        "max_dec_frame_buffering",
        &mut current.max_dec_frame_buffering,
        frames,
    )?;
    Ok(())
}

fn vui_parameters<S: SyntaxIo>(
    io: &mut S,
    current: &mut Vui,
    profile_idc: u8,
    constraint_set3_flag: bool,
) -> Result<()> {
    io.flag(
        "aspect_ratio_info_present_flag",
        &mut current.aspect_ratio_info_present_flag,
    )?;
    if current.aspect_ratio_info_present_flag {
        io.u(8, "aspect_ratio_idc", &mut current.aspect_ratio_idc, 0, 255)?;
        if current.aspect_ratio_idc == 255 {
            io.u(16, "sar_width", &mut current.sar_width, 0, 65535)?;
            io.u(16, "sar_height", &mut current.sar_height, 0, 65535)?;
        }
    } else {
        io.infer("aspect_ratio_idc", &mut current.aspect_ratio_idc, 0)?;
    }

    io.flag(
        "overscan_info_present_flag",
        &mut current.overscan_info_present_flag,
    )?;
    if current.overscan_info_present_flag {
        io.flag(
            "overscan_appropriate_flag",
            &mut current.overscan_appropriate_flag,
        )?;
    }

    io.flag(
        "video_signal_type_present_flag",
        &mut current.video_signal_type_present_flag,
    )?;
    if current.video_signal_type_present_flag {
        io.u(3, "video_format", &mut current.video_format, 0, 7)?;
        io.flag("video_full_range_flag", &mut current.video_full_range_flag)?;
        io.flag(
            "colour_description_present_flag",
            &mut current.colour_description_present_flag,
        )?;
        if current.colour_description_present_flag {
            io.u(8, "colour_primaries", &mut current.colour_primaries, 0, 255)?;
            io.u(
                8,
                "transfer_characteristics",
                &mut current.transfer_characteristics,
                0,
                255,
            )?;
            io.u(
                8,
                "matrix_coefficients",
                &mut current.matrix_coefficients,
                0,
                255,
            )?;
        }
    } else {
        io.infer("video_format", &mut current.video_format, 5)?;
        io.infer(
            "video_full_range_flag",
            &mut current.video_full_range_flag,
            false,
        )?;
        io.infer("colour_primaries", &mut current.colour_primaries, 2)?;
        io.infer(
            "transfer_characteristics",
            &mut current.transfer_characteristics,
            2,
        )?;
        io.infer("matrix_coefficients", &mut current.matrix_coefficients, 2)?;
    }

    io.flag(
        "chroma_loc_info_present_flag",
        &mut current.chroma_loc_info_present_flag,
    )?;
    if current.chroma_loc_info_present_flag {
        io.ue(
            "chroma_sample_loc_type_top_field",
            &mut current.chroma_sample_loc_type_top_field,
            0,
            5,
        )?;
        io.ue(
            "chroma_sample_loc_type_bottom_field",
            &mut current.chroma_sample_loc_type_bottom_field,
            0,
            5,
        )?;
    } else {
        io.infer(
            "chroma_sample_loc_type_top_field",
            &mut current.chroma_sample_loc_type_top_field,
            0,
        )?;
        io.infer(
            "chroma_sample_loc_type_bottom_field",
            &mut current.chroma_sample_loc_type_bottom_field,
            0,
        )?;
    }

    io.flag(
        "timing_info_present_flag",
        &mut current.timing_info_present_flag,
    )?;
    if current.timing_info_present_flag {
        io.u(
            32,
            "num_units_in_tick",
            &mut current.num_units_in_tick,
            1,
            u32::MAX,
        )?;
        io.u(32, "time_scale", &mut current.time_scale, 1, u32::MAX)?;
        io.flag("fixed_frame_rate_flag", &mut current.fixed_frame_rate_flag)?;
    } else {
        io.infer(
            "fixed_frame_rate_flag",
            &mut current.fixed_frame_rate_flag,
            false,
        )?;
    }

    io.flag(
        "nal_hrd_parameters_present_flag",
        &mut current.nal_hrd_parameters_present_flag,
    )?;
    if current.nal_hrd_parameters_present_flag {
        io.header("NAL HRD parameters");
        hrd_parameters(io, &mut current.nal_hrd_parameters)?;
    }

    io.flag(
        "vcl_hrd_parameters_present_flag",
        &mut current.vcl_hrd_parameters_present_flag,
    )?;
    if current.vcl_hrd_parameters_present_flag {
        io.header("VCL HRD parameters");
        hrd_parameters(io, &mut current.vcl_hrd_parameters)?;
    }

    if current.nal_hrd_parameters_present_flag || current.vcl_hrd_parameters_present_flag {
        io.flag("low_delay_hrd_flag", &mut current.low_delay_hrd_flag)?;
    } else {
        let low_delay = !current.fixed_frame_rate_flag;
        io.infer("low_delay_hrd_flag", &mut current.low_delay_hrd_flag, low_delay)?;
    }

    io.flag(
        "pic_struct_present_flag",
        &mut current.pic_struct_present_flag,
    )?;

    io.flag(
        "bitstream_restriction_flag",
        &mut current.bitstream_restriction_flag,
    )?;
    if current.bitstream_restriction_flag {
        io.flag(
            "motion_vectors_over_pic_boundaries_flag",
            &mut current.motion_vectors_over_pic_boundaries_flag,
        )?;
        io.ue(
            "max_bytes_per_pic_denom",
            &mut current.max_bytes_per_pic_denom,
            0,
            16,
        )?;
        io.ue(
            "max_bits_per_mb_denom",
            &mut current.max_bits_per_mb_denom,
            0,
            16,
        )?;
        // Older revisions of the standard allow 16 here.
        io.ue(
            "log2_max_mv_length_horizontal",
            &mut current.log2_max_mv_length_horizontal,
            0,
            16,
        )?;
        io.ue(
            "log2_max_mv_length_vertical",
            &mut current.log2_max_mv_length_vertical,
            0,
            16,
        )?;
        io.ue(
            "max_num_reorder_frames",
            &mut current.max_num_reorder_frames,
            0,
            MAX_DPB_FRAMES,
        )?;
        io.ue(
            "max_dec_frame_buffering",
            &mut current.max_dec_frame_buffering,
            0,
            MAX_DPB_FRAMES,
        )?;
    } else {
        infer_bitstream_restriction(io, current, profile_idc, constraint_set3_flag)?;
    }

    Ok(())
}

/// Values of an absent VUI.
fn vui_parameters_default<S: SyntaxIo>(
    io: &mut S,
    current: &mut Vui,
    profile_idc: u8,
    constraint_set3_flag: bool,
) -> Result<()> {
    io.infer("aspect_ratio_idc", &mut current.aspect_ratio_idc, 0)?;

    io.infer("video_format", &mut current.video_format, 5)?;
    io.infer(
        "video_full_range_flag",
        &mut current.video_full_range_flag,
        false,
    )?;
    io.infer("colour_primaries", &mut current.colour_primaries, 2)?;
    io.infer(
        "transfer_characteristics",
        &mut current.transfer_characteristics,
        2,
    )?;
    io.infer("matrix_coefficients", &mut current.matrix_coefficients, 2)?;

    io.infer(
        "chroma_sample_loc_type_top_field",
        &mut current.chroma_sample_loc_type_top_field,
        0,
    )?;
    io.infer(
        "chroma_sample_loc_type_bottom_field",
        &mut current.chroma_sample_loc_type_bottom_field,
        0,
    )?;

    io.infer(
        "fixed_frame_rate_flag",
        &mut current.fixed_frame_rate_flag,
        false,
    )?;
    io.infer("low_delay_hrd_flag", &mut current.low_delay_hrd_flag, true)?;

    io.infer(
        "pic_struct_present_flag",
        &mut current.pic_struct_present_flag,
        false,
    )?;

    infer_bitstream_restriction(io, current, profile_idc, constraint_set3_flag)
}

/// Sequence parameter set, `seq_parameter_set_rbsp()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub nal_unit_header: NalUnitHeader,

    pub profile_idc: u8,
    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,
    pub reserved_zero_2bits: u8,
    pub level_idc: u8,

    pub seq_parameter_set_id: u8,

    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,

    pub seq_scaling_matrix_present_flag: bool,
    pub seq_scaling_list_present_flag: [bool; 12],
    pub scaling_list_4x4: [ScalingList; 6],
    pub scaling_list_8x8: [ScalingList; 6],

    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: Vec<i32>,

    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_allowed_flag: bool,

    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,

    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u16,
    pub frame_crop_right_offset: u16,
    pub frame_crop_top_offset: u16,
    pub frame_crop_bottom_offset: u16,

    pub vui_parameters_present_flag: bool,
    pub vui: Vui,
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            nal_unit_header: NalUnitHeader::new(3, NalUnitType::SequenceParameterSet),
            profile_idc: 0,
            constraint_set0_flag: false,
            constraint_set1_flag: false,
            constraint_set2_flag: false,
            constraint_set3_flag: false,
            constraint_set4_flag: false,
            constraint_set5_flag: false,
            reserved_zero_2bits: 0,
            level_idc: 0,
            seq_parameter_set_id: 0,
            chroma_format_idc: 1,
            separate_colour_plane_flag: false,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            qpprime_y_zero_transform_bypass_flag: false,
            seq_scaling_matrix_present_flag: false,
            seq_scaling_list_present_flag: [false; 12],
            scaling_list_4x4: Default::default(),
            scaling_list_8x8: Default::default(),
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            delta_pic_order_always_zero_flag: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            num_ref_frames_in_pic_order_cnt_cycle: 0,
            offset_for_ref_frame: Vec::new(),
            max_num_ref_frames: 0,
            gaps_in_frame_num_allowed_flag: false,
            pic_width_in_mbs_minus1: 0,
            pic_height_in_map_units_minus1: 0,
            frame_mbs_only_flag: true,
            mb_adaptive_frame_field_flag: false,
            direct_8x8_inference_flag: false,
            frame_cropping_flag: false,
            frame_crop_left_offset: 0,
            frame_crop_right_offset: 0,
            frame_crop_top_offset: 0,
            frame_crop_bottom_offset: 0,
            vui_parameters_present_flag: false,
            vui: Vui::default(),
        }
    }
}

impl Sps {
    /// Width in bits of `frame_num` in slice headers.
    pub fn frame_num_bits(&self) -> u32 {
        u32::from(self.log2_max_frame_num_minus4) + 4
    }

    /// Width in bits of `pic_order_cnt_lsb` in slice headers.
    pub fn pic_order_cnt_lsb_bits(&self) -> u32 {
        u32::from(self.log2_max_pic_order_cnt_lsb_minus4) + 4
    }

    /// `PicSizeInMapUnits`
    pub fn pic_size_in_map_units(&self) -> u32 {
        (u32::from(self.pic_width_in_mbs_minus1) + 1)
            .saturating_mul(u32::from(self.pic_height_in_map_units_minus1) + 1)
    }

    /// Whether the chroma format, bit depth and scaling matrix fields are
    /// coded for this profile.
    pub fn is_high_profile(&self) -> bool {
        HIGH_PROFILES.contains(&self.profile_idc)
    }

    /// Whether the chroma planes take part in weighted prediction.
    pub(crate) fn has_chroma(&self) -> bool {
        !self.separate_colour_plane_flag && self.chroma_format_idc != 0
    }

    /// Byte 2 of the `profile_compatibility` field in an AVC configuration
    /// record: the constraint flags and reserved bits.
    pub fn constraint_flags(&self) -> u8 {
        (u8::from(self.constraint_set0_flag) << 7)
            | (u8::from(self.constraint_set1_flag) << 6)
            | (u8::from(self.constraint_set2_flag) << 5)
            | (u8::from(self.constraint_set3_flag) << 4)
            | (u8::from(self.constraint_set4_flag) << 3)
            | (u8::from(self.constraint_set5_flag) << 2)
            | self.reserved_zero_2bits
    }
}

pub(crate) fn sps<S: SyntaxIo>(io: &mut S, current: &mut Sps) -> Result<()> {
    io.header("Sequence Parameter Set");

    nal_unit_header(
        io,
        &mut current.nal_unit_header,
        1 << NalUnitType::SequenceParameterSet.nal_unit_type(),
    )?;

    io.u(8, "profile_idc", &mut current.profile_idc, 0, 255)?;

    io.flag("constraint_set0_flag", &mut current.constraint_set0_flag)?;
    io.flag("constraint_set1_flag", &mut current.constraint_set1_flag)?;
    io.flag("constraint_set2_flag", &mut current.constraint_set2_flag)?;
    io.flag("constraint_set3_flag", &mut current.constraint_set3_flag)?;
    io.flag("constraint_set4_flag", &mut current.constraint_set4_flag)?;
    io.flag("constraint_set5_flag", &mut current.constraint_set5_flag)?;

    io.u(2, "reserved_zero_2bits", &mut current.reserved_zero_2bits, 0, 0)?;

    io.u(8, "level_idc", &mut current.level_idc, 0, 255)?;

    io.ue(
        "seq_parameter_set_id",
        &mut current.seq_parameter_set_id,
        0,
        31,
    )?;

    if current.is_high_profile() {
        io.ue("chroma_format_idc", &mut current.chroma_format_idc, 0, 3)?;

        if current.chroma_format_idc == 3 {
            io.flag(
                "separate_colour_plane_flag",
                &mut current.separate_colour_plane_flag,
            )?;
        } else {
            io.infer(
                "separate_colour_plane_flag",
                &mut current.separate_colour_plane_flag,
                false,
            )?;
        }

        io.ue(
            "bit_depth_luma_minus8",
            &mut current.bit_depth_luma_minus8,
            0,
            6,
        )?;
        io.ue(
            "bit_depth_chroma_minus8",
            &mut current.bit_depth_chroma_minus8,
            0,
            6,
        )?;

        io.flag(
            "qpprime_y_zero_transform_bypass_flag",
            &mut current.qpprime_y_zero_transform_bypass_flag,
        )?;

        io.flag(
            "seq_scaling_matrix_present_flag",
            &mut current.seq_scaling_matrix_present_flag,
        )?;
        if current.seq_scaling_matrix_present_flag {
            let count = if current.chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..count {
                io.flag(
                    "seq_scaling_list_present_flag",
                    &mut current.seq_scaling_list_present_flag[i],
                )?;
                if current.seq_scaling_list_present_flag[i] {
                    if i < 6 {
                        scaling_list(io, &mut current.scaling_list_4x4[i], 16)?;
                    } else {
                        scaling_list(io, &mut current.scaling_list_8x8[i - 6], 64)?;
                    }
                }
            }
        }
    } else {
        let chroma_format_idc = if current.profile_idc == 183 { 0 } else { 1 };
        io.infer(
            "chroma_format_idc",
            &mut current.chroma_format_idc,
            chroma_format_idc,
        )?;

        io.infer(
            "separate_colour_plane_flag",
            &mut current.separate_colour_plane_flag,
            false,
        )?;
        io.infer(
            "bit_depth_luma_minus8",
            &mut current.bit_depth_luma_minus8,
            0,
        )?;
        io.infer(
            "bit_depth_chroma_minus8",
            &mut current.bit_depth_chroma_minus8,
            0,
        )?;
    }

    io.ue(
        "log2_max_frame_num_minus4",
        &mut current.log2_max_frame_num_minus4,
        0,
        12,
    )?;
    io.ue("pic_order_cnt_type", &mut current.pic_order_cnt_type, 0, 2)?;

    if current.pic_order_cnt_type == 0 {
        io.ue(
            "log2_max_pic_order_cnt_lsb_minus4",
            &mut current.log2_max_pic_order_cnt_lsb_minus4,
            0,
            12,
        )?;
    } else if current.pic_order_cnt_type == 1 {
        io.flag(
            "delta_pic_order_always_zero_flag",
            &mut current.delta_pic_order_always_zero_flag,
        )?;
        io.se(
            "offset_for_non_ref_pic",
            &mut current.offset_for_non_ref_pic,
            i32::MIN + 1,
            i32::MAX,
        )?;
        io.se(
            "offset_for_top_to_bottom_field",
            &mut current.offset_for_top_to_bottom_field,
            i32::MIN + 1,
            i32::MAX,
        )?;
        io.ue(
            "num_ref_frames_in_pic_order_cnt_cycle",
            &mut current.num_ref_frames_in_pic_order_cnt_cycle,
            0,
            255,
        )?;

        let count = usize::from(current.num_ref_frames_in_pic_order_cnt_cycle);
        io.allocate("offset_for_ref_frame", &mut current.offset_for_ref_frame, count)?;
        for i in 0..count {
            io.se(
                "offset_for_ref_frame",
                &mut current.offset_for_ref_frame[i],
                i32::MIN + 1,
                i32::MAX,
            )?;
        }
    }

    io.ue(
        "max_num_ref_frames",
        &mut current.max_num_ref_frames,
        0,
        MAX_DPB_FRAMES,
    )?;
    io.flag(
        "gaps_in_frame_num_allowed_flag",
        &mut current.gaps_in_frame_num_allowed_flag,
    )?;

    io.ue(
        "pic_width_in_mbs_minus1",
        &mut current.pic_width_in_mbs_minus1,
        0,
        MAX_MB_WIDTH,
    )?;
    io.ue(
        "pic_height_in_map_units_minus1",
        &mut current.pic_height_in_map_units_minus1,
        0,
        MAX_MB_HEIGHT,
    )?;

    io.flag("frame_mbs_only_flag", &mut current.frame_mbs_only_flag)?;
    if !current.frame_mbs_only_flag {
        io.flag(
            "mb_adaptive_frame_field_flag",
            &mut current.mb_adaptive_frame_field_flag,
        )?;
    }

    io.flag(
        "direct_8x8_inference_flag",
        &mut current.direct_8x8_inference_flag,
    )?;

    io.flag("frame_cropping_flag", &mut current.frame_cropping_flag)?;
    if current.frame_cropping_flag {
        io.ue(
            "frame_crop_left_offset",
            &mut current.frame_crop_left_offset,
            0,
            MAX_WIDTH,
        )?;
        io.ue(
            "frame_crop_right_offset",
            &mut current.frame_crop_right_offset,
            0,
            MAX_WIDTH,
        )?;
        io.ue(
            "frame_crop_top_offset",
            &mut current.frame_crop_top_offset,
            0,
            MAX_HEIGHT,
        )?;
        io.ue(
            "frame_crop_bottom_offset",
            &mut current.frame_crop_bottom_offset,
            0,
            MAX_HEIGHT,
        )?;
    }

    io.flag(
        "vui_parameters_present_flag",
        &mut current.vui_parameters_present_flag,
    )?;
    let (profile_idc, constraint_set3_flag) = (current.profile_idc, current.constraint_set3_flag);
    if current.vui_parameters_present_flag {
        io.header("VUI Parameters");
        vui_parameters(io, &mut current.vui, profile_idc, constraint_set3_flag)?;
    } else {
        vui_parameters_default(io, &mut current.vui, profile_idc, constraint_set3_flag)?;
    }

    rbsp_trailing_bits(io)
}

/// Sequence parameter set extension, `seq_parameter_set_extension_rbsp()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpsExtension {
    pub nal_unit_header: NalUnitHeader,

    pub seq_parameter_set_id: u8,

    pub aux_format_idc: u8,
    pub bit_depth_aux_minus8: u8,
    pub alpha_incr_flag: bool,
    pub alpha_opaque_value: u16,
    pub alpha_transparent_value: u16,

    pub additional_extension_flag: bool,
}

impl Default for SpsExtension {
    fn default() -> Self {
        Self {
            nal_unit_header: NalUnitHeader::new(3, NalUnitType::SequenceParameterSetExtension),
            seq_parameter_set_id: 0,
            aux_format_idc: 0,
            bit_depth_aux_minus8: 0,
            alpha_incr_flag: false,
            alpha_opaque_value: 0,
            alpha_transparent_value: 0,
            additional_extension_flag: false,
        }
    }
}

pub(crate) fn sps_extension<S: SyntaxIo>(io: &mut S, current: &mut SpsExtension) -> Result<()> {
    io.header("Sequence Parameter Set Extension");

    nal_unit_header(
        io,
        &mut current.nal_unit_header,
        1 << NalUnitType::SequenceParameterSetExtension.nal_unit_type(),
    )?;

    io.ue(
        "seq_parameter_set_id",
        &mut current.seq_parameter_set_id,
        0,
        31,
    )?;

    io.ue("aux_format_idc", &mut current.aux_format_idc, 0, 3)?;

    if current.aux_format_idc != 0 {
        io.ue(
            "bit_depth_aux_minus8",
            &mut current.bit_depth_aux_minus8,
            0,
            4,
        )?;
        io.flag("alpha_incr_flag", &mut current.alpha_incr_flag)?;

        let bits = u32::from(current.bit_depth_aux_minus8) + 9;
        io.u(
            bits,
            "alpha_opaque_value",
            &mut current.alpha_opaque_value,
            0,
            max_uint_bits(bits),
        )?;
        io.u(
            bits,
            "alpha_transparent_value",
            &mut current.alpha_transparent_value,
            0,
            max_uint_bits(bits),
        )?;
    }

    io.flag(
        "additional_extension_flag",
        &mut current.additional_extension_flag,
    )?;

    rbsp_trailing_bits(io)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bitstream::{BitReader, BitWriter};
    use crate::Error;

    // Data from https://www.cardinalpeak.com/blog/worlds-smallest-h-264-encoder
    pub(crate) const HELLO_SPS: &[u8] = &[0x67, 0x42, 0x00, 0x0a, 0xf8, 0x41, 0xa2];

    // High profile with VUI timing and bitstream restriction, containing
    // emulation prevention bytes.
    pub(crate) const HIGH_SPS: &[u8] = b"\x67\x64\x00\x0A\xAC\x72\x84\x44\x26\x84\x00\x00\x03\x00\x04\x00\x00\x03\x00\xCA\x3C\x48\x96\x11\x80";

    pub(crate) fn read_sps(rbsp: &[u8]) -> Result<Sps> {
        let mut sps_out = Sps::default();
        sps(&mut BitReader::new(rbsp, false), &mut sps_out)?;
        Ok(sps_out)
    }

    pub(crate) fn write_sps(current: &mut Sps) -> Result<Vec<u8>> {
        let mut w = BitWriter::new(1024, false);
        sps(&mut w, current)?;
        Ok(w.into_bytes().0)
    }

    #[test]
    fn test_hello_sps() {
        let mut parsed = read_sps(HELLO_SPS).unwrap();
        assert_eq!(parsed.profile_idc, 66);
        assert_eq!(parsed.level_idc, 10);
        assert_eq!(parsed.pic_width_in_mbs_minus1, 7);
        assert_eq!(parsed.pic_height_in_map_units_minus1, 5);
        assert_eq!(parsed.chroma_format_idc, 1);
        assert!(!parsed.vui_parameters_present_flag);
        assert_eq!(parsed.vui, Vui::default());

        assert_eq!(write_sps(&mut parsed).unwrap(), HELLO_SPS);
    }

    #[test]
    fn test_sps_matches_h264_reader() {
        use h264_reader::nal::sps::SeqParameterSet;
        use h264_reader::rbsp::BitReader;

        let high = h264_reader::rbsp::decode_nal(HIGH_SPS).unwrap();
        let theirs = SeqParameterSet::from_bits(BitReader::new(&high[..])).unwrap();
        let ours = read_sps(&crate::nal_unit::ebsp_to_rbsp(bytes::Bytes::from_static(HIGH_SPS)).unwrap())
            .unwrap();

        assert_eq!(
            u32::from(ours.pic_width_in_mbs_minus1),
            theirs.pic_width_in_mbs_minus1
        );
        assert_eq!(
            u32::from(ours.pic_height_in_map_units_minus1),
            theirs.pic_height_in_map_units_minus1
        );
        assert_eq!(ours.level_idc, theirs.level_idc);
        assert_eq!(ours.seq_parameter_set_id, theirs.seq_parameter_set_id.id());
        assert_eq!(ours.profile_idc, 100);
        assert_eq!(ours.max_num_ref_frames, 16);
        assert!(ours.vui_parameters_present_flag);
        assert!(ours.vui.timing_info_present_flag);
        assert_eq!(ours.vui.time_scale, 50);
        assert!(ours.vui.fixed_frame_rate_flag);
        assert!(!ours.vui.low_delay_hrd_flag);
        assert_eq!(ours.vui.max_num_reorder_frames, 2);
        assert_eq!(ours.vui.log2_max_mv_length_horizontal, 8);
    }

    #[test]
    fn test_high_sps_roundtrip() {
        let rbsp = crate::nal_unit::ebsp_to_rbsp(bytes::Bytes::from_static(HIGH_SPS)).unwrap();
        let mut parsed = read_sps(&rbsp).unwrap();
        assert_eq!(write_sps(&mut parsed).unwrap(), &rbsp[..]);
    }

    #[test]
    fn test_inferred_vui_checked_on_write() {
        let mut current = read_sps(HELLO_SPS).unwrap();
        current.vui.video_format = 1;
        let err = write_sps(&mut current).unwrap_err();
        assert!(matches!(err, Error::InvalidData { .. }));
        assert!(format!("{err}").contains("video_format"), "{err}");

        // Intra-only high profiles infer no frame buffering.
        let mut current = Sps {
            profile_idc: 100,
            constraint_set3_flag: true,
            ..Default::default()
        };
        let err = write_sps(&mut current).unwrap_err();
        assert!(format!("{err}").contains("max_num_reorder_frames"), "{err}");
        current.vui.max_num_reorder_frames = 0;
        current.vui.max_dec_frame_buffering = 0;
        let written = write_sps(&mut current).unwrap();
        assert_eq!(read_sps(&written).unwrap(), current);
    }

    #[test]
    fn test_low_delay_follows_fixed_frame_rate() {
        let mut current = Sps {
            vui_parameters_present_flag: true,
            ..Default::default()
        };
        current.vui.timing_info_present_flag = true;
        current.vui.num_units_in_tick = 1001;
        current.vui.time_scale = 60000;
        current.vui.fixed_frame_rate_flag = true;
        assert!(write_sps(&mut current).is_err());
        current.vui.low_delay_hrd_flag = false;
        let written = write_sps(&mut current).unwrap();
        assert_eq!(read_sps(&written).unwrap(), current);
    }

    #[test]
    fn test_profile_183_is_monochrome() {
        let mut current = Sps {
            profile_idc: 183,
            ..Default::default()
        };
        assert!(write_sps(&mut current).is_err());
        current.chroma_format_idc = 0;
        let written = write_sps(&mut current).unwrap();
        assert_eq!(read_sps(&written).unwrap().chroma_format_idc, 0);
    }

    #[test]
    fn test_scaling_list_early_termination() {
        // delta 8 at index 0 gives scale 16, -16 at index 1 gives 0.
        let mut list = ScalingList::default();
        list.delta_scale[0] = 8;
        list.delta_scale[1] = -16;
        list.delta_scale[2] = 5;
        let mut w = BitWriter::new(64, false);
        scaling_list(&mut w, &mut list, 16).unwrap();
        // se(8) is 9 bits, se(-16) is 11 bits; nothing else is written.
        assert_eq!(w.position(), 20);

        let (buf, _) = w.into_bytes();
        let mut r = BitReader::new(&buf, false);
        let mut parsed = ScalingList::default();
        scaling_list(&mut r, &mut parsed, 16).unwrap();
        assert_eq!(r.position(), 20);
        assert_eq!(parsed.delta_scale[..3], [8, -16, 0]);
    }

    #[test]
    fn test_high_profile_scaling_matrix_roundtrip() {
        let mut current = Sps {
            profile_idc: 100,
            level_idc: 40,
            seq_scaling_matrix_present_flag: true,
            pic_order_cnt_type: 1,
            num_ref_frames_in_pic_order_cnt_cycle: 2,
            offset_for_ref_frame: alloc::vec![-3, 7],
            ..Default::default()
        };
        current.seq_scaling_list_present_flag[0] = true;
        current.seq_scaling_list_present_flag[6] = true;
        current.scaling_list_4x4[0].delta_scale[0] = 4;
        current.scaling_list_4x4[0].delta_scale[1] = -12;
        for (i, d) in current.scaling_list_8x8[0].delta_scale.iter_mut().enumerate() {
            *d = if i % 2 == 0 { 1 } else { -1 };
        }
        let written = write_sps(&mut current).unwrap();
        assert_eq!(read_sps(&written).unwrap(), current);

        current.offset_for_ref_frame.clear();
        let err = write_sps(&mut current).unwrap_err();
        assert!(format!("{err}").contains("offset_for_ref_frame must be set for writing"));
    }

    #[test]
    fn test_sps_extension_roundtrip() {
        let mut ext = SpsExtension {
            seq_parameter_set_id: 2,
            aux_format_idc: 1,
            bit_depth_aux_minus8: 2,
            alpha_incr_flag: true,
            alpha_opaque_value: 1023,
            alpha_transparent_value: 0,
            ..Default::default()
        };
        let mut w = BitWriter::new(64, false);
        sps_extension(&mut w, &mut ext).unwrap();
        let (buf, padding) = w.into_bytes();
        assert_eq!(padding, 0);
        assert_eq!(buf[0], 0x6d);

        let mut parsed = SpsExtension::default();
        sps_extension(&mut BitReader::new(&buf, false), &mut parsed).unwrap();
        assert_eq!(parsed, ext);

        ext.alpha_opaque_value = 2048;
        let mut w = BitWriter::new(64, false);
        assert!(sps_extension(&mut w, &mut ext).is_err());
    }
}
