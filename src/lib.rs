// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Coded bitstream (CBS) reading and writing of Advanced Video Coding (H.264)
//!
//! This crate converts between raw H.264 byte streams (Annex B or AVCC/MP4
//! length-prefixed) and a structured, validated representation of the syntax
//! elements carried in NAL units: sequence and picture parameter sets, slice
//! headers, SEI messages, access unit delimiters, filler data and
//! end-of-sequence/end-of-stream markers.
//!
//! Reading and writing share one implementation per syntax structure. Each
//! syntax function is generic over a bit reader or bit writer, so field order,
//! field widths and value ranges cannot drift apart between the two
//! directions. Writing an unmodified structure which was read from a
//! canonically encoded stream reproduces the original bits exactly.
//!
//! Slice data (the macroblock layer) is not parsed. It is kept as an opaque,
//! reference counted sub-range of the unit buffer and copied bit-exactly when
//! the slice is written again.
//!
//! The main entry point is [CodedBitstream]:
//!
//! ```
//! # fn main() -> cbs_avc::Result<()> {
//! use cbs_avc::{CodedBitstream, Fragment};
//!
//! // An access unit delimiter followed by end of stream.
//! let annex_b = [0, 0, 0, 1, 0x09, 0xf0, 0, 0, 1, 0x0b];
//! let mut cbs = CodedBitstream::new();
//! let mut fragment = Fragment::new(annex_b.to_vec());
//! cbs.split_fragment(&mut fragment, false)?;
//! cbs.read_fragment_content(&mut fragment)?;
//! assert_eq!(fragment.units.len(), 2);
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(feature = "backtrace", feature(error_generic_member_access))]
#![deny(unsafe_code)]

#[cfg(not(feature = "std"))]
extern crate core as std;

extern crate alloc;
use alloc::{collections::TryReserveError, string::String};

#[cfg(feature = "backtrace")]
use std::backtrace::Backtrace;

mod golomb;

mod bitstream;
pub use bitstream::Direction;

pub mod nal_unit;
pub use nal_unit::{Fragment, NalUnitHeader, NalUnitType, Unit, UnitContent};

pub mod unit_types;

pub mod parameter_sets;
pub use parameter_sets::ParameterSets;

pub mod sps;
pub use sps::{Hrd, ScalingList, Sps, SpsExtension, Vui};

pub mod pps;
pub use pps::Pps;

pub mod slice;
pub use slice::{Slice, SliceData, SliceHeader};

pub mod sei;
pub use sei::{Sei, SeiMessage, SeiPayload};

pub mod delimiter;
pub use delimiter::{Aud, Filler};

mod fragment;

mod context;
pub use context::{CodedBitstream, Config, DiscardLevel};

#[cfg(feature = "std")]
mod writer;
#[cfg(feature = "std")]
pub use writer::AnnexBWriter;

// Error type ----------------------

/// An error reading or writing H.264 syntax.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A field is malformed, out of range or does not match the value it must
    /// be inferred to have.
    #[error("invalid data: {msg}")]
    InvalidData {
        msg: String,
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    /// A parameter set referenced by id is not present in the cache.
    #[error("{kind} id {id} not available")]
    ReferenceNotAvailable {
        kind: &'static str,
        id: u32,
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    /// The write buffer is too small. The caller may grow it and retry.
    #[error("insufficient space in write buffer")]
    InsufficientSpace {
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    /// Allocating a buffer failed.
    #[error("out of memory")]
    OutOfMemory {
        source: TryReserveError,
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    /// Valid syntax which this crate does not handle (SVC, MVC, 3D-AVC).
    #[error("{msg} not supported")]
    Unsupported {
        msg: &'static str,
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    /// No syntax implementation exists for this NAL unit type.
    #[error("{direction} unimplemented for NAL unit type {nal_unit_type}")]
    NotImplemented {
        nal_unit_type: u8,
        direction: Direction,
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    #[cfg(feature = "std")]
    #[error("IO error: {source}")]
    IoError {
        source: std::io::Error,
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid_data<S: Into<String>>(msg: S) -> Self {
        Error::InvalidData {
            msg: msg.into(),
            #[cfg(feature = "backtrace")]
            backtrace: Backtrace::capture(),
        }
    }

    pub(crate) fn reference_not_available(kind: &'static str, id: u32) -> Self {
        Error::ReferenceNotAvailable {
            kind,
            id,
            #[cfg(feature = "backtrace")]
            backtrace: Backtrace::capture(),
        }
    }

    pub(crate) fn insufficient_space() -> Self {
        Error::InsufficientSpace {
            #[cfg(feature = "backtrace")]
            backtrace: Backtrace::capture(),
        }
    }

    pub(crate) fn unsupported(msg: &'static str) -> Self {
        Error::Unsupported {
            msg,
            #[cfg(feature = "backtrace")]
            backtrace: Backtrace::capture(),
        }
    }

    pub(crate) fn not_implemented(nal_unit_type: u8, direction: Direction) -> Self {
        Error::NotImplemented {
            nal_unit_type,
            direction,
            #[cfg(feature = "backtrace")]
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<TryReserveError> for Error {
    fn from(source: TryReserveError) -> Self {
        Error::OutOfMemory {
            source,
            #[cfg(feature = "backtrace")]
            backtrace: Backtrace::capture(),
        }
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::IoError {
            source,
            #[cfg(feature = "backtrace")]
            backtrace: Backtrace::capture(),
        }
    }
}

// H.264 definitions ------------------

/// Number of sequence parameter set slots (`seq_parameter_set_id` 0..=31).
pub const MAX_SPS_COUNT: usize = 32;
/// Number of picture parameter set slots (`pic_parameter_set_id` 0..=255).
pub const MAX_PPS_COUNT: usize = 256;
/// Maximum number of SEI payloads in one SEI NAL unit.
pub const MAX_SEI_PAYLOADS: usize = 64;
/// Maximum number of reference frames in the decoded picture buffer.
pub const MAX_DPB_FRAMES: u32 = 16;
/// Maximum number of entries in a reference picture list.
pub const MAX_REFS: usize = 2 * MAX_DPB_FRAMES as usize;
/// Bound on ref_pic_list_modification entries, including the terminator.
pub const MAX_RPLM_COUNT: usize = MAX_REFS + 1;
/// Bound on memory_management_control_operation entries, including the
/// terminator.
pub const MAX_MMCO_COUNT: usize = MAX_REFS * 2 + 2;
/// Maximum `cpb_cnt_minus1 + 1`.
pub const MAX_CPB_CNT: usize = 32;

/// Maximum `pic_width_in_mbs_minus1` accepted (level 6.2, 8:1 aspect).
pub const MAX_MB_WIDTH: u32 = 1055;
/// Maximum `pic_height_in_map_units_minus1` accepted.
pub const MAX_MB_HEIGHT: u32 = 1055;
/// Maximum picture size in macroblocks (level 6.2).
pub const MAX_MB_PIC_SIZE: u32 = 139264;
/// Maximum picture width in samples.
pub const MAX_WIDTH: u32 = 16888;
/// Maximum picture height in samples.
pub const MAX_HEIGHT: u32 = 16888;

// Utility functions -------------------

/// Floor of the base two logarithm, with `log2(0) == 0`.
#[inline]
pub(crate) fn log2(x: u32) -> u32 {
    if x == 0 {
        0
    } else {
        31 - x.leading_zeros()
    }
}

/// Largest value representable in `bits` bits.
#[inline]
pub(crate) fn max_uint_bits(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}
