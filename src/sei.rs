// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Supplemental Enhancement Information (SEI)
//!
//! An SEI NAL unit carries a list of messages. Each message starts with its
//! `payload_type` and `payload_size`, both coded as a run of `0xff` bytes
//! (255 each) plus one final byte below 255. Known payload types are parsed
//! into [SeiPayload] variants, all others are kept as opaque bytes.
//!
//! On read, every payload must consume exactly its declared size. On write,
//! the declared size is recomputed from the written payload and
//! [SeiMessage::payload_size] is updated.

use alloc::{format, vec::Vec};

use crate::bitstream::{byte_alignment, rbsp_trailing_bits, BitReader, BitWriter, Direction, SyntaxIo};
use crate::nal_unit::{nal_unit_header, NalUnitHeader, NalUnitType};
use crate::parameter_sets::ParameterSets;
use crate::sps::Sps;
use crate::{max_uint_bits, Error, Result, MAX_SEI_PAYLOADS};

/// Initial CPB removal delay and offset for one CPB specification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitialCpbRemoval {
    pub initial_cpb_removal_delay: u32,
    pub initial_cpb_removal_delay_offset: u32,
}

/// Buffering period, payload type 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferingPeriod {
    pub seq_parameter_set_id: u8,
    /// One entry per CPB of the NAL HRD, if present.
    pub nal: Vec<InitialCpbRemoval>,
    /// One entry per CPB of the VCL HRD, if present.
    pub vcl: Vec<InitialCpbRemoval>,
}

/// `clock_timestamp` fields of a picture timing message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub ct_type: u8,
    pub nuit_field_based_flag: bool,
    pub counting_type: u8,
    pub full_timestamp_flag: bool,
    pub discontinuity_flag: bool,
    pub cnt_dropped_flag: bool,
    pub n_frames: u8,
    pub seconds_flag: bool,
    pub seconds_value: u8,
    pub minutes_flag: bool,
    pub minutes_value: u8,
    pub hours_flag: bool,
    pub hours_value: u8,
    pub time_offset: i32,
}

/// Picture timing, payload type 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PicTiming {
    pub cpb_removal_delay: u32,
    pub dpb_output_delay: u32,
    pub pic_struct: u8,
    pub clock_timestamp_flag: [bool; 3],
    pub timestamp: [Timestamp; 3],
}

/// Pan-scan rectangle, payload type 2.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PanScanRect {
    pub pan_scan_rect_id: u32,
    pub pan_scan_rect_cancel_flag: bool,
    pub pan_scan_cnt_minus1: u8,
    pub pan_scan_rect_left_offset: [i32; 3],
    pub pan_scan_rect_right_offset: [i32; 3],
    pub pan_scan_rect_top_offset: [i32; 3],
    pub pan_scan_rect_bottom_offset: [i32; 3],
    pub pan_scan_rect_repetition_period: u16,
}

/// User data registered by ITU-T T.35, payload type 4.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDataRegistered {
    pub itu_t_t35_country_code: u8,
    /// Present only when `itu_t_t35_country_code` is `0xff`.
    pub itu_t_t35_country_code_extension_byte: u8,
    pub data: Vec<u8>,
}

/// User data unregistered, payload type 5.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDataUnregistered {
    pub uuid: [u8; 16],
    pub payload: Vec<u8>,
}

impl UserDataUnregistered {
    pub fn new(uuid: [u8; 16], payload: Vec<u8>) -> Self {
        Self { uuid, payload }
    }
}

/// Recovery point, payload type 6.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryPoint {
    pub recovery_frame_cnt: u16,
    pub exact_match_flag: bool,
    pub broken_link_flag: bool,
    pub changing_slice_group_idc: u8,
}

/// Display orientation, payload type 47.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayOrientation {
    pub display_orientation_cancel_flag: bool,
    pub hor_flip: bool,
    pub ver_flip: bool,
    pub anticlockwise_rotation: u16,
    pub display_orientation_repetition_period: u16,
    pub display_orientation_extension_flag: bool,
}

/// Mastering display colour volume, payload type 137.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MasteringDisplayColourVolume {
    pub display_primaries_x: [u16; 3],
    pub display_primaries_y: [u16; 3],
    pub white_point_x: u16,
    pub white_point_y: u16,
    pub max_display_mastering_luminance: u32,
    pub min_display_mastering_luminance: u32,
}

/// Body of an SEI message, selected by payload type.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SeiPayload {
    BufferingPeriod(BufferingPeriod),
    PicTiming(PicTiming),
    PanScanRect(PanScanRect),
    /// Number of `0xff` filler bytes.
    FillerPayload(u32),
    UserDataRegistered(UserDataRegistered),
    UserDataUnregistered(UserDataUnregistered),
    RecoveryPoint(RecoveryPoint),
    DisplayOrientation(DisplayOrientation),
    MasteringDisplayColourVolume(MasteringDisplayColourVolume),
    /// Any payload type without a parser, kept as raw bytes.
    Other { payload_type: u32, data: Vec<u8> },
}

impl SeiPayload {
    /// An empty payload of the given type, ready to be read into.
    fn for_type(payload_type: u32) -> Self {
        match payload_type {
            0 => Self::BufferingPeriod(Default::default()),
            1 => Self::PicTiming(Default::default()),
            2 => Self::PanScanRect(Default::default()),
            3 => Self::FillerPayload(0),
            4 => Self::UserDataRegistered(Default::default()),
            5 => Self::UserDataUnregistered(Default::default()),
            6 => Self::RecoveryPoint(Default::default()),
            47 => Self::DisplayOrientation(Default::default()),
            137 => Self::MasteringDisplayColourVolume(Default::default()),
            _ => Self::Other {
                payload_type,
                data: Vec::new(),
            },
        }
    }

    pub fn payload_type(&self) -> u32 {
        match self {
            Self::BufferingPeriod(_) => 0,
            Self::PicTiming(_) => 1,
            Self::PanScanRect(_) => 2,
            Self::FillerPayload(_) => 3,
            Self::UserDataRegistered(_) => 4,
            Self::UserDataUnregistered(_) => 5,
            Self::RecoveryPoint(_) => 6,
            Self::DisplayOrientation(_) => 47,
            Self::MasteringDisplayColourVolume(_) => 137,
            Self::Other { payload_type, .. } => *payload_type,
        }
    }
}

/// One SEI message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeiMessage {
    /// Size of the payload in bytes, including its alignment bits.
    ///
    /// Set by reading. Writing recomputes it, so new messages may leave it
    /// at zero.
    pub payload_size: u32,
    pub payload: SeiPayload,
}

impl SeiMessage {
    pub fn new(payload: SeiPayload) -> Self {
        Self {
            payload_size: 0,
            payload,
        }
    }

    pub fn payload_type(&self) -> u32 {
        self.payload.payload_type()
    }
}

/// Supplemental Enhancement Information NAL unit, `sei_rbsp()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sei {
    pub nal_unit_header: NalUnitHeader,
    pub messages: Vec<SeiMessage>,
}

impl Sei {
    pub fn new(messages: Vec<SeiMessage>) -> Self {
        Self {
            nal_unit_header: NalUnitHeader::new(0, NalUnitType::SupplementalEnhancementInformation),
            messages,
        }
    }
}

impl Default for Sei {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// A payload type or size: `0xff` bytes worth 255 each and a last byte.
fn sei_value<S: SyntaxIo>(io: &mut S, ff_name: &str, last_name: &str, value: &mut u32) -> Result<()> {
    let mut ff_count = *value / 255;
    let mut last = (*value % 255) as u8;
    io.ff_bytes(ff_name, &mut ff_count)?;
    io.u(8, last_name, &mut last, 0, 254)?;
    *value = ff_count
        .checked_mul(255)
        .and_then(|v| v.checked_add(u32::from(last)))
        .ok_or_else(|| Error::invalid_data(format!("{last_name} too large.")))?;
    Ok(())
}

fn byte_array<S: SyntaxIo>(io: &mut S, name: &str, buf: &mut Vec<u8>, len: usize) -> Result<()> {
    io.allocate(name, buf, len)?;
    for byte in buf.iter_mut().take(len) {
        io.u(8, name, byte, 0, 255)?;
    }
    Ok(())
}

/// Remaining payload bytes after a `header_len` byte prefix.
///
/// Reading derives it from the declared payload size, writing from the data.
fn data_length<S: SyntaxIo>(
    payload_size: u32,
    header_len: u32,
    data: &[u8],
    err: &'static str,
) -> Result<usize> {
    match S::DIRECTION {
        Direction::Read => payload_size
            .checked_sub(header_len)
            .map(|len| len as usize)
            .ok_or_else(|| Error::invalid_data(err)),
        Direction::Write => Ok(data.len()),
    }
}

fn cpb_removal_list<S: SyntaxIo>(
    io: &mut S,
    name: &str,
    list: &mut Vec<InitialCpbRemoval>,
    hrd: &crate::Hrd,
) -> Result<()> {
    let len = u32::from(hrd.initial_cpb_removal_delay_length_minus1) + 1;
    let count = usize::from(hrd.cpb_cnt_minus1) + 1;
    io.allocate(name, list, count)?;
    for entry in list.iter_mut().take(count) {
        io.u(
            len,
            "initial_cpb_removal_delay",
            &mut entry.initial_cpb_removal_delay,
            1,
            max_uint_bits(len),
        )?;
        io.u(
            len,
            "initial_cpb_removal_delay_offset",
            &mut entry.initial_cpb_removal_delay_offset,
            0,
            max_uint_bits(len),
        )?;
    }
    Ok(())
}

fn buffering_period<S: SyntaxIo>(
    io: &mut S,
    current: &mut BufferingPeriod,
    ps: &mut ParameterSets,
) -> Result<()> {
    io.header("Buffering Period");

    io.ue(
        "seq_parameter_set_id",
        &mut current.seq_parameter_set_id,
        0,
        31,
    )?;

    let sps = ps.lookup_sps(current.seq_parameter_set_id)?.clone();
    ps.set_active_sps(current.seq_parameter_set_id);

    if sps.vui.nal_hrd_parameters_present_flag {
        cpb_removal_list(io, "nal", &mut current.nal, &sps.vui.nal_hrd_parameters)?;
    }
    if sps.vui.vcl_hrd_parameters_present_flag {
        cpb_removal_list(io, "vcl", &mut current.vcl, &sps.vui.vcl_hrd_parameters)?;
    }
    Ok(())
}

fn sign_extend(raw: u32, bits: u32) -> i32 {
    if bits == 0 {
        return 0;
    }
    let shift = 32 - bits;
    ((raw << shift) as i32) >> shift
}

fn timestamp<S: SyntaxIo>(io: &mut S, current: &mut Timestamp, sps: &Sps) -> Result<()> {
    io.u(2, "ct_type", &mut current.ct_type, 0, 2)?;
    io.flag("nuit_field_based_flag", &mut current.nuit_field_based_flag)?;
    io.u(5, "counting_type", &mut current.counting_type, 0, 6)?;
    io.flag("full_timestamp_flag", &mut current.full_timestamp_flag)?;
    io.flag("discontinuity_flag", &mut current.discontinuity_flag)?;
    io.flag("cnt_dropped_flag", &mut current.cnt_dropped_flag)?;
    io.u(8, "n_frames", &mut current.n_frames, 0, 255)?;

    if current.full_timestamp_flag {
        io.u(6, "seconds_value", &mut current.seconds_value, 0, 59)?;
        io.u(6, "minutes_value", &mut current.minutes_value, 0, 59)?;
        io.u(5, "hours_value", &mut current.hours_value, 0, 23)?;
    } else {
        io.flag("seconds_flag", &mut current.seconds_flag)?;
        if current.seconds_flag {
            io.u(6, "seconds_value", &mut current.seconds_value, 0, 59)?;
            io.flag("minutes_flag", &mut current.minutes_flag)?;
            if current.minutes_flag {
                io.u(6, "minutes_value", &mut current.minutes_value, 0, 59)?;
                io.flag("hours_flag", &mut current.hours_flag)?;
                if current.hours_flag {
                    io.u(5, "hours_value", &mut current.hours_value, 0, 23)?;
                }
            }
        }
    }

    let vui = &sps.vui;
    let time_offset_length = if vui.nal_hrd_parameters_present_flag {
        u32::from(vui.nal_hrd_parameters.time_offset_length)
    } else if vui.vcl_hrd_parameters_present_flag {
        u32::from(vui.vcl_hrd_parameters.time_offset_length)
    } else {
        24
    };

    if time_offset_length > 0 {
        // Two's complement, i(v).
        let max = max_uint_bits(time_offset_length);
        let mut raw = (current.time_offset as u32) & max;
        io.u(time_offset_length, "time_offset", &mut raw, 0, max)?;
        let value = sign_extend(raw, time_offset_length);
        if S::DIRECTION == Direction::Write && value != current.time_offset {
            return Err(Error::invalid_data(format!(
                "time_offset out of range: {} does not fit in {time_offset_length} bits",
                current.time_offset
            )));
        }
        current.time_offset = value;
    } else {
        io.infer("time_offset", &mut current.time_offset, 0)?;
    }
    Ok(())
}

fn pic_timing<S: SyntaxIo>(io: &mut S, current: &mut PicTiming, ps: &ParameterSets) -> Result<()> {
    io.header("Picture Timing");

    let sps = ps
        .timing_sps()
        .ok_or_else(|| Error::invalid_data("No active SPS for pic_timing."))?;

    if let Some(hrd) = sps.vui.hrd() {
        let len = u32::from(hrd.cpb_removal_delay_length_minus1) + 1;
        io.u(
            len,
            "cpb_removal_delay",
            &mut current.cpb_removal_delay,
            0,
            max_uint_bits(len),
        )?;
        let len = u32::from(hrd.dpb_output_delay_length_minus1) + 1;
        io.u(
            len,
            "dpb_output_delay",
            &mut current.dpb_output_delay,
            0,
            max_uint_bits(len),
        )?;
    }

    if sps.vui.pic_struct_present_flag {
        const NUM_CLOCK_TS: [usize; 9] = [1, 1, 1, 2, 2, 3, 3, 2, 3];

        io.u(4, "pic_struct", &mut current.pic_struct, 0, 8)?;
        for i in 0..NUM_CLOCK_TS[usize::from(current.pic_struct)] {
            io.flag("clock_timestamp_flag", &mut current.clock_timestamp_flag[i])?;
            if current.clock_timestamp_flag[i] {
                timestamp(io, &mut current.timestamp[i], sps)?;
            }
        }
    }
    Ok(())
}

fn pan_scan_rect<S: SyntaxIo>(io: &mut S, current: &mut PanScanRect) -> Result<()> {
    io.header("Pan-Scan Rectangle");

    io.ue(
        "pan_scan_rect_id",
        &mut current.pan_scan_rect_id,
        0,
        u32::MAX - 1,
    )?;
    io.flag(
        "pan_scan_rect_cancel_flag",
        &mut current.pan_scan_rect_cancel_flag,
    )?;

    if !current.pan_scan_rect_cancel_flag {
        io.ue("pan_scan_cnt_minus1", &mut current.pan_scan_cnt_minus1, 0, 2)?;
        for i in 0..=usize::from(current.pan_scan_cnt_minus1) {
            io.se(
                "pan_scan_rect_left_offset",
                &mut current.pan_scan_rect_left_offset[i],
                i32::MIN + 1,
                i32::MAX,
            )?;
            io.se(
                "pan_scan_rect_right_offset",
                &mut current.pan_scan_rect_right_offset[i],
                i32::MIN + 1,
                i32::MAX,
            )?;
            io.se(
                "pan_scan_rect_top_offset",
                &mut current.pan_scan_rect_top_offset[i],
                i32::MIN + 1,
                i32::MAX,
            )?;
            io.se(
                "pan_scan_rect_bottom_offset",
                &mut current.pan_scan_rect_bottom_offset[i],
                i32::MIN + 1,
                i32::MAX,
            )?;
        }
        io.ue(
            "pan_scan_rect_repetition_period",
            &mut current.pan_scan_rect_repetition_period,
            0,
            16384,
        )?;
    }
    Ok(())
}

fn user_data_registered<S: SyntaxIo>(
    io: &mut S,
    current: &mut UserDataRegistered,
    payload_size: u32,
) -> Result<()> {
    io.header("User Data Registered ITU-T T.35");

    io.u(
        8,
        "itu_t_t35_country_code",
        &mut current.itu_t_t35_country_code,
        0,
        255,
    )?;
    let header_len = if current.itu_t_t35_country_code != 0xff {
        1
    } else {
        io.u(
            8,
            "itu_t_t35_country_code_extension_byte",
            &mut current.itu_t_t35_country_code_extension_byte,
            0,
            255,
        )?;
        2
    };

    let len = data_length::<S>(
        payload_size,
        header_len,
        &current.data,
        "Invalid SEI user data registered payload.",
    )?;
    byte_array(io, "payload_byte", &mut current.data, len)
}

fn user_data_unregistered<S: SyntaxIo>(
    io: &mut S,
    current: &mut UserDataUnregistered,
    payload_size: u32,
) -> Result<()> {
    io.header("User Data Unregistered");

    let len = data_length::<S>(
        payload_size,
        16,
        &current.payload,
        "Invalid SEI user data unregistered payload.",
    )?;

    for byte in current.uuid.iter_mut() {
        io.u(8, "uuid_iso_iec_11578", byte, 0, 255)?;
    }
    byte_array(io, "user_data_payload_byte", &mut current.payload, len)
}

fn recovery_point<S: SyntaxIo>(io: &mut S, current: &mut RecoveryPoint) -> Result<()> {
    io.header("Recovery Point");

    io.ue(
        "recovery_frame_cnt",
        &mut current.recovery_frame_cnt,
        0,
        65535,
    )?;
    io.flag("exact_match_flag", &mut current.exact_match_flag)?;
    io.flag("broken_link_flag", &mut current.broken_link_flag)?;
    io.u(
        2,
        "changing_slice_group_idc",
        &mut current.changing_slice_group_idc,
        0,
        2,
    )
}

fn display_orientation<S: SyntaxIo>(io: &mut S, current: &mut DisplayOrientation) -> Result<()> {
    io.header("Display Orientation");

    io.flag(
        "display_orientation_cancel_flag",
        &mut current.display_orientation_cancel_flag,
    )?;
    if !current.display_orientation_cancel_flag {
        io.flag("hor_flip", &mut current.hor_flip)?;
        io.flag("ver_flip", &mut current.ver_flip)?;
        io.u(
            16,
            "anticlockwise_rotation",
            &mut current.anticlockwise_rotation,
            0,
            65535,
        )?;
        io.ue(
            "display_orientation_repetition_period",
            &mut current.display_orientation_repetition_period,
            0,
            16384,
        )?;
        io.flag(
            "display_orientation_extension_flag",
            &mut current.display_orientation_extension_flag,
        )?;
    }
    Ok(())
}

fn mastering_display_colour_volume<S: SyntaxIo>(
    io: &mut S,
    current: &mut MasteringDisplayColourVolume,
) -> Result<()> {
    io.header("Mastering Display Colour Volume");

    for i in 0..3 {
        io.u(
            16,
            "display_primaries_x",
            &mut current.display_primaries_x[i],
            0,
            50000,
        )?;
        io.u(
            16,
            "display_primaries_y",
            &mut current.display_primaries_y[i],
            0,
            50000,
        )?;
    }
    io.u(16, "white_point_x", &mut current.white_point_x, 0, 50000)?;
    io.u(16, "white_point_y", &mut current.white_point_y, 0, 50000)?;

    io.u(
        32,
        "max_display_mastering_luminance",
        &mut current.max_display_mastering_luminance,
        1,
        u32::MAX,
    )?;
    io.u(
        32,
        "min_display_mastering_luminance",
        &mut current.min_display_mastering_luminance,
        0,
        current.max_display_mastering_luminance.saturating_sub(1),
    )
}

/// The payload body followed by its alignment bits.
fn sei_payload<S: SyntaxIo>(
    io: &mut S,
    payload: &mut SeiPayload,
    payload_size: u32,
    ps: &mut ParameterSets,
) -> Result<()> {
    match payload {
        SeiPayload::BufferingPeriod(p) => buffering_period(io, p, ps)?,
        SeiPayload::PicTiming(p) => pic_timing(io, p, ps)?,
        SeiPayload::PanScanRect(p) => pan_scan_rect(io, p)?,
        SeiPayload::FillerPayload(size) => io.ff_bytes("ff_byte", size)?,
        SeiPayload::UserDataRegistered(p) => user_data_registered(io, p, payload_size)?,
        SeiPayload::UserDataUnregistered(p) => user_data_unregistered(io, p, payload_size)?,
        SeiPayload::RecoveryPoint(p) => recovery_point(io, p)?,
        SeiPayload::DisplayOrientation(p) => display_orientation(io, p)?,
        SeiPayload::MasteringDisplayColourVolume(p) => mastering_display_colour_volume(io, p)?,
        SeiPayload::Other { data, .. } => {
            let len = data_length::<S>(payload_size, 0, data, "Invalid SEI payload.")?;
            byte_array(io, "payload_byte", data, len)?;
        }
    }

    if !io.byte_aligned() {
        byte_alignment(io)?;
    }
    Ok(())
}

pub(crate) fn read_sei(r: &mut BitReader, current: &mut Sei, ps: &mut ParameterSets) -> Result<()> {
    r.header("Supplemental Enhancement Information");

    nal_unit_header(
        r,
        &mut current.nal_unit_header,
        1 << NalUnitType::SupplementalEnhancementInformation.nal_unit_type(),
    )?;

    current.messages.clear();
    loop {
        if current.messages.len() == MAX_SEI_PAYLOADS {
            return Err(Error::invalid_data(format!(
                "Too many payloads in SEI message: found {MAX_SEI_PAYLOADS}."
            )));
        }

        let mut payload_type = 0;
        let mut payload_size = 0;
        sei_value(r, "ff_byte", "last_payload_type_byte", &mut payload_type)?;
        sei_value(r, "ff_byte", "last_payload_size_byte", &mut payload_size)?;

        let mut sub = r.sub_reader(payload_size as usize * 8, "SEI payload size")?;
        let mut payload = SeiPayload::for_type(payload_type);
        sei_payload(&mut sub, &mut payload, payload_size, ps)?;
        if sub.bits_left() != 0 {
            return Err(Error::invalid_data(format!(
                "Incorrect SEI payload length: {} bits left over in payload type {payload_type}.",
                sub.bits_left()
            )));
        }

        current.messages.try_reserve(1)?;
        current.messages.push(SeiMessage {
            payload_size,
            payload,
        });

        let mut more = false;
        r.more_rbsp_data(&mut more)?;
        if !more {
            break;
        }
    }

    rbsp_trailing_bits(r)
}

pub(crate) fn write_sei(w: &mut BitWriter, current: &mut Sei, ps: &mut ParameterSets) -> Result<()> {
    w.header("Supplemental Enhancement Information");

    nal_unit_header(
        w,
        &mut current.nal_unit_header,
        1 << NalUnitType::SupplementalEnhancementInformation.nal_unit_type(),
    )?;

    if current.messages.is_empty() {
        return Err(Error::invalid_data("SEI NAL unit without messages."));
    }
    if current.messages.len() > MAX_SEI_PAYLOADS {
        return Err(Error::invalid_data(format!(
            "Too many payloads in SEI message: found {}.",
            current.messages.len()
        )));
    }

    for message in current.messages.iter_mut() {
        let start = w.position();
        let mut payload_type = message.payload_type();
        let mut payload_size = message.payload_size;

        // The size is coded before the payload. A wrong guess costs one
        // rewrite with the measured size, which then matches.
        let mut done = false;
        for _ in 0..2 {
            sei_value(w, "ff_byte", "last_payload_type_byte", &mut payload_type)?;
            sei_value(w, "ff_byte", "last_payload_size_byte", &mut payload_size)?;
            let payload_start = w.position();
            sei_payload(w, &mut message.payload, payload_size, ps)?;
            let written = u32::try_from((w.position() - payload_start) / 8)
                .map_err(|_| Error::invalid_data("SEI payload too large."))?;
            if written == payload_size {
                done = true;
                break;
            }
            w.rewind(start);
            payload_size = written;
        }
        if !done {
            return Err(Error::invalid_data(format!(
                "Incorrect SEI payload length for payload type {payload_type}."
            )));
        }
        message.payload_size = payload_size;
    }

    rbsp_trailing_bits(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sps::Hrd;
    use alloc::{sync::Arc, vec};

    fn write(current: &mut Sei, ps: &mut ParameterSets) -> Result<Vec<u8>> {
        let mut w = BitWriter::new(4096, false);
        write_sei(&mut w, current, ps)?;
        Ok(w.into_bytes().0)
    }

    fn read(data: &[u8], ps: &mut ParameterSets) -> Result<Sei> {
        let mut sei = Sei::default();
        read_sei(&mut BitReader::new(data, false), &mut sei, ps)?;
        Ok(sei)
    }

    /// An SPS with NAL HRD parameters and `pic_struct_present_flag`.
    fn timing_sps(id: u8) -> Arc<Sps> {
        let mut sps = Sps {
            seq_parameter_set_id: id,
            vui_parameters_present_flag: true,
            ..Default::default()
        };
        sps.vui.nal_hrd_parameters_present_flag = true;
        sps.vui.nal_hrd_parameters = Hrd {
            cpb_cnt_minus1: 1,
            initial_cpb_removal_delay_length_minus1: 23,
            cpb_removal_delay_length_minus1: 15,
            dpb_output_delay_length_minus1: 4,
            time_offset_length: 8,
            ..Default::default()
        };
        sps.vui.pic_struct_present_flag = true;
        Arc::new(sps)
    }

    #[test]
    fn test_sei_value_coding() {
        let cases: [(u32, &[u8]); 5] = [
            (0, &[0x00]),
            (254, &[0xfe]),
            (255, &[0xff, 0x00]),
            (509, &[0xff, 0xfe]),
            (510, &[0xff, 0xff, 0x00]),
        ];
        for (value, expected) in cases {
            let mut w = BitWriter::new(8, false);
            let mut v = value;
            sei_value(&mut w, "ff_byte", "last_byte", &mut v).unwrap();
            let buf = w.into_bytes().0;
            assert_eq!(buf, expected, "value {value}");

            let mut parsed = 0;
            sei_value(&mut BitReader::new(&buf, false), "ff_byte", "last_byte", &mut parsed).unwrap();
            assert_eq!(parsed, value);
        }
    }

    #[test]
    fn test_user_data_unregistered() {
        let mut ps = ParameterSets::new();
        let uuid = [
            0xdc, 0x45, 0xe9, 0xbd, 0xe6, 0xd9, 0x48, 0xb7, 0x96, 0x2c, 0xd8, 0x20, 0xd9, 0x23, 0xee,
            0xef,
        ];
        let udu = UserDataUnregistered::new(uuid, b"hello".to_vec());
        let mut sei = Sei::new(vec![SeiMessage::new(SeiPayload::UserDataUnregistered(udu))]);

        let written = write(&mut sei, &mut ps).unwrap();
        assert_eq!(&written[..3], &[0x06, 0x05, 21]);
        assert_eq!(&written[3..19], &uuid);
        assert_eq!(&written[19..24], b"hello");
        assert_eq!(written[24..], [0x80]);
        assert_eq!(sei.messages[0].payload_size, 21);

        assert_eq!(read(&written, &mut ps).unwrap(), sei);

        let err = read(&[0x06, 0x05, 0x02, 0xaa, 0xbb, 0x80], &mut ps).unwrap_err();
        assert!(format!("{err}").contains("Invalid SEI user data unregistered payload."));
    }

    #[test]
    fn test_size_rewritten_when_wrong() {
        let mut ps = ParameterSets::new();
        let data: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let mut sei = Sei::new(vec![SeiMessage {
            payload_size: 7,
            payload: SeiPayload::Other {
                payload_type: 200,
                data: data.clone(),
            },
        }]);
        let written = write(&mut sei, &mut ps).unwrap();
        assert_eq!(&written[..4], &[0x06, 200, 0xff, 45]);
        assert_eq!(&written[4..304], &data[..]);
        assert_eq!(written.len(), 305);
        assert_eq!(sei.messages[0].payload_size, 300);

        assert_eq!(read(&written, &mut ps).unwrap(), sei);
    }

    #[test]
    fn test_recovery_point_and_length_check() {
        let mut ps = ParameterSets::new();
        let mut sei = Sei::new(vec![SeiMessage::new(SeiPayload::RecoveryPoint(
            RecoveryPoint::default(),
        ))]);
        // recovery_frame_cnt 0, flags 0, then alignment 1 and 0s.
        assert_eq!(write(&mut sei, &mut ps).unwrap(), [0x06, 0x06, 0x01, 0x84, 0x80]);

        let err = read(&[0x06, 0x06, 0x02, 0x84, 0x00, 0x80], &mut ps).unwrap_err();
        assert!(format!("{err}").contains("Incorrect SEI payload length"), "{err}");

        // Declared size beyond the end of the unit.
        assert!(read(&[0x06, 0x06, 0x08, 0x84, 0x80], &mut ps).is_err());
    }

    #[test]
    fn test_too_many_payloads() {
        let mut ps = ParameterSets::new();
        let mut data = vec![0x06];
        for _ in 0..MAX_SEI_PAYLOADS {
            data.extend_from_slice(&[0x06, 0x01, 0x84]);
        }
        data.push(0x80);
        assert_eq!(read(&data, &mut ps).unwrap().messages.len(), MAX_SEI_PAYLOADS);

        data.pop();
        data.extend_from_slice(&[0x06, 0x01, 0x84, 0x80]);
        let err = read(&data, &mut ps).unwrap_err();
        assert!(format!("{err}").contains("Too many payloads in SEI message: found 64."));

        let message = SeiMessage::new(SeiPayload::RecoveryPoint(RecoveryPoint::default()));
        let mut sei = Sei::new(vec![message; MAX_SEI_PAYLOADS + 1]);
        assert!(write(&mut sei, &mut ps).is_err());
    }

    #[test]
    fn test_pic_timing_needs_sps() {
        let mut ps = ParameterSets::new();
        let mut sei = Sei::new(vec![SeiMessage::new(SeiPayload::PicTiming(
            PicTiming::default(),
        ))]);
        let err = write(&mut sei, &mut ps).unwrap_err();
        assert!(format!("{err}").contains("No active SPS for pic_timing."));

        // With exactly one cached SPS, that one is used.
        ps.replace_sps(timing_sps(2));
        let mut timing = PicTiming {
            cpb_removal_delay: 0xabcd,
            dpb_output_delay: 17,
            pic_struct: 3,
            clock_timestamp_flag: [true, true, false],
            ..Default::default()
        };
        timing.timestamp[0] = Timestamp {
            full_timestamp_flag: true,
            n_frames: 24,
            seconds_value: 59,
            minutes_value: 1,
            hours_value: 23,
            time_offset: -5,
            ..Default::default()
        };
        timing.timestamp[1] = Timestamp {
            ct_type: 1,
            counting_type: 6,
            seconds_flag: true,
            seconds_value: 3,
            minutes_flag: true,
            minutes_value: 4,
            time_offset: 127,
            ..Default::default()
        };
        sei.messages[0].payload = SeiPayload::PicTiming(timing);
        let written = write(&mut sei, &mut ps).unwrap();
        assert_eq!(read(&written, &mut ps).unwrap(), sei);

        // time_offset_length is 8 bits.
        if let SeiPayload::PicTiming(t) = &mut sei.messages[0].payload {
            t.timestamp[1].time_offset = 128;
        }
        let err = write(&mut sei, &mut ps).unwrap_err();
        assert!(format!("{err}").contains("time_offset out of range"), "{err}");

        // Ambiguous when two SPSs are cached and none is active.
        ps.replace_sps(timing_sps(3));
        assert!(read(&written, &mut ps).is_err());
    }

    #[test]
    fn test_buffering_period_activates_sps() {
        let mut ps = ParameterSets::new();
        ps.replace_sps(timing_sps(4));
        ps.replace_sps(timing_sps(5));

        let mut sei = Sei::new(vec![SeiMessage::new(SeiPayload::BufferingPeriod(
            BufferingPeriod {
                seq_parameter_set_id: 5,
                nal: vec![
                    InitialCpbRemoval {
                        initial_cpb_removal_delay: 90000,
                        initial_cpb_removal_delay_offset: 0,
                    },
                    InitialCpbRemoval {
                        initial_cpb_removal_delay: 1,
                        initial_cpb_removal_delay_offset: 0xff_ffff,
                    },
                ],
                vcl: Vec::new(),
            },
        ))]);
        let written = write(&mut sei, &mut ps).unwrap();
        assert_eq!(ps.active_sps().unwrap().seq_parameter_set_id, 5);

        ps.flush();
        assert_eq!(read(&written, &mut ps).unwrap(), sei);
        assert_eq!(ps.active_sps().unwrap().seq_parameter_set_id, 5);

        // A zero initial_cpb_removal_delay is out of range.
        if let SeiPayload::BufferingPeriod(bp) = &mut sei.messages[0].payload {
            bp.nal[0].initial_cpb_removal_delay = 0;
        }
        assert!(write(&mut sei, &mut ps).is_err());

        let mut ps = ParameterSets::new();
        let err = read(&written, &mut ps).unwrap_err();
        assert!(matches!(err, Error::ReferenceNotAvailable { kind: "SPS", id: 5, .. }));
    }

    #[test]
    fn test_mixed_messages_roundtrip() {
        let mut ps = ParameterSets::new();
        let mut sei = Sei::new(vec![
            SeiMessage::new(SeiPayload::PanScanRect(PanScanRect {
                pan_scan_rect_id: 9,
                pan_scan_cnt_minus1: 1,
                pan_scan_rect_left_offset: [-16, 16, 0],
                pan_scan_rect_bottom_offset: [i32::MAX, i32::MIN + 1, 0],
                pan_scan_rect_repetition_period: 1,
                ..Default::default()
            })),
            SeiMessage::new(SeiPayload::FillerPayload(5)),
            SeiMessage::new(SeiPayload::UserDataRegistered(UserDataRegistered {
                itu_t_t35_country_code: 0xff,
                itu_t_t35_country_code_extension_byte: 0x21,
                data: vec![0x00, 0x31, 0x47, 0x41],
            })),
            SeiMessage::new(SeiPayload::DisplayOrientation(DisplayOrientation {
                hor_flip: true,
                anticlockwise_rotation: 0x4000,
                display_orientation_repetition_period: 1,
                ..Default::default()
            })),
            SeiMessage::new(SeiPayload::MasteringDisplayColourVolume(
                MasteringDisplayColourVolume {
                    display_primaries_x: [13250, 7500, 34000],
                    display_primaries_y: [34500, 3000, 16000],
                    white_point_x: 15635,
                    white_point_y: 16450,
                    max_display_mastering_luminance: 10_000_000,
                    min_display_mastering_luminance: 50,
                },
            )),
        ]);
        let written = write(&mut sei, &mut ps).unwrap();
        let parsed = read(&written, &mut ps).unwrap();
        assert_eq!(parsed, sei);
        assert_eq!(
            parsed.messages.iter().map(SeiMessage::payload_type).collect::<Vec<_>>(),
            [2, 3, 4, 47, 137]
        );
        assert_eq!(parsed.messages[1].payload_size, 5);
        assert_eq!(parsed.messages[2].payload_size, 6);
        assert_eq!(parsed.messages[4].payload_size, 24);
    }

    #[test]
    fn test_mastering_display_luminance_order() {
        let mut ps = ParameterSets::new();
        let mut sei = Sei::new(vec![SeiMessage::new(
            SeiPayload::MasteringDisplayColourVolume(MasteringDisplayColourVolume {
                max_display_mastering_luminance: 100,
                min_display_mastering_luminance: 100,
                ..Default::default()
            }),
        )]);
        assert!(write(&mut sei, &mut ps).is_err());
    }
}
