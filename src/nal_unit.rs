// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Network Abstraction Layer (NAL) units and fragments

use alloc::{boxed::Box, format, sync::Arc, vec::Vec};

use bytes::Bytes;

use crate::bitstream::SyntaxIo;
use crate::delimiter::{Aud, Filler};
use crate::pps::Pps;
use crate::sei::Sei;
use crate::slice::Slice;
use crate::sps::{Sps, SpsExtension};
use crate::{Error, Result};

/// Possible values for the `nal_unit_type` field in `nal_unit`.
///
/// Encodes to 5 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Unspecified (0 and 24..=31)
    Unspecified(u8),
    /// Coded slice of a non-IDR picture
    CodedSliceOfANonIDRPicture,
    /// Coded slice data partition A
    CodedSliceDataPartitionA,
    /// Coded slice data partition B
    CodedSliceDataPartitionB,
    /// Coded slice data partition C
    CodedSliceDataPartitionC,
    /// Coded slice of an IDR picture
    CodedSliceOfAnIDRPicture,
    /// Supplemental enhancement information (SEI)
    SupplementalEnhancementInformation,
    /// Sequence parameter set
    SequenceParameterSet,
    /// Picture parameter set
    PictureParameterSet,
    /// Access unit delimiter
    AccessUnitDelimiter,
    /// End of sequence
    EndOfSequence,
    /// End of stream
    EndOfStream,
    /// Filler data
    FillerData,
    /// Sequence parameter set extension
    SequenceParameterSetExtension,
    /// Prefix NAL unit (SVC/MVC)
    PrefixNalUnit,
    /// Subset sequence parameter set
    SubsetSequenceParameterSet,
    /// Depth parameter set
    DepthParameterSet,
    /// Coded slice of an auxiliary coded picture without partitioning
    CodedSliceOfAnAuxiliaryPicture,
    /// Coded slice extension (SVC/MVC)
    CodedSliceExtension,
    /// Coded slice extension for a depth view component (3D-AVC)
    CodedSliceExtensionDepth,
    /// Reserved (17, 18, 22, 23)
    Reserved(u8),
}

impl NalUnitType {
    pub fn nal_unit_type(&self) -> u8 {
        match self {
            Self::Unspecified(v) | Self::Reserved(v) => *v,
            Self::CodedSliceOfANonIDRPicture => 1,
            Self::CodedSliceDataPartitionA => 2,
            Self::CodedSliceDataPartitionB => 3,
            Self::CodedSliceDataPartitionC => 4,
            Self::CodedSliceOfAnIDRPicture => 5,
            Self::SupplementalEnhancementInformation => 6,
            Self::SequenceParameterSet => 7,
            Self::PictureParameterSet => 8,
            Self::AccessUnitDelimiter => 9,
            Self::EndOfSequence => 10,
            Self::EndOfStream => 11,
            Self::FillerData => 12,
            Self::SequenceParameterSetExtension => 13,
            Self::PrefixNalUnit => 14,
            Self::SubsetSequenceParameterSet => 15,
            Self::DepthParameterSet => 16,
            Self::CodedSliceOfAnAuxiliaryPicture => 19,
            Self::CodedSliceExtension => 20,
            Self::CodedSliceExtensionDepth => 21,
        }
    }

    /// Whether this is a slice carrying picture data which this crate parses.
    pub fn is_slice(&self) -> bool {
        matches!(
            self,
            Self::CodedSliceOfANonIDRPicture
                | Self::CodedSliceOfAnIDRPicture
                | Self::CodedSliceOfAnAuxiliaryPicture
        )
    }
}

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        match value & 0x1f {
            1 => Self::CodedSliceOfANonIDRPicture,
            2 => Self::CodedSliceDataPartitionA,
            3 => Self::CodedSliceDataPartitionB,
            4 => Self::CodedSliceDataPartitionC,
            5 => Self::CodedSliceOfAnIDRPicture,
            6 => Self::SupplementalEnhancementInformation,
            7 => Self::SequenceParameterSet,
            8 => Self::PictureParameterSet,
            9 => Self::AccessUnitDelimiter,
            10 => Self::EndOfSequence,
            11 => Self::EndOfStream,
            12 => Self::FillerData,
            13 => Self::SequenceParameterSetExtension,
            14 => Self::PrefixNalUnit,
            15 => Self::SubsetSequenceParameterSet,
            16 => Self::DepthParameterSet,
            19 => Self::CodedSliceOfAnAuxiliaryPicture,
            20 => Self::CodedSliceExtension,
            21 => Self::CodedSliceExtensionDepth,
            v @ (17 | 18 | 22 | 23) => Self::Reserved(v),
            v => Self::Unspecified(v),
        }
    }
}

#[test]
fn test_nal_unit_type_values() {
    for v in 0..32u8 {
        assert_eq!(NalUnitType::from(v).nal_unit_type(), v);
    }
    assert!(NalUnitType::from(19).is_slice());
    assert!(!NalUnitType::from(2).is_slice());
}

/// The one byte header at the start of each NAL unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NalUnitHeader {
    pub nal_ref_idc: u8,
    pub nal_unit_type: u8,
    pub svc_extension_flag: bool,
    pub avc_3d_extension_flag: bool,
}

impl NalUnitHeader {
    pub fn new(nal_ref_idc: u8, nal_unit_type: NalUnitType) -> Self {
        Self {
            nal_ref_idc,
            nal_unit_type: nal_unit_type.nal_unit_type(),
            ..Default::default()
        }
    }
}

/// `nal_unit_header()`, accepting only the types set in `valid_type_mask`.
pub(crate) fn nal_unit_header<S: SyntaxIo>(
    io: &mut S,
    current: &mut NalUnitHeader,
    valid_type_mask: u32,
) -> Result<()> {
    io.fixed(1, "forbidden_zero_bit", 0)?;
    io.u(2, "nal_ref_idc", &mut current.nal_ref_idc, 0, 3)?;
    io.u(5, "nal_unit_type", &mut current.nal_unit_type, 0, 31)?;

    if (1u32 << current.nal_unit_type) & valid_type_mask == 0 {
        return Err(Error::invalid_data(format!(
            "Invalid NAL unit type {}.",
            current.nal_unit_type
        )));
    }

    if matches!(current.nal_unit_type, 14 | 20 | 21) {
        if current.nal_unit_type != 21 {
            io.flag("svc_extension_flag", &mut current.svc_extension_flag)?;
        } else {
            io.flag("avc_3d_extension_flag", &mut current.avc_3d_extension_flag)?;
        }

        return Err(if current.svc_extension_flag {
            Error::unsupported("SVC")
        } else if current.avc_3d_extension_flag {
            Error::unsupported("3DAVC")
        } else {
            Error::unsupported("MVC")
        });
    }

    Ok(())
}

/// Decomposed content of a [Unit].
#[derive(Debug, Clone, PartialEq)]
pub enum UnitContent {
    Sps(Arc<Sps>),
    SpsExtension(SpsExtension),
    Pps(Arc<Pps>),
    Slice(Box<Slice>),
    Sei(Box<Sei>),
    Aud(Aud),
    Filler(Filler),
    EndOfSequence(NalUnitHeader),
    EndOfStream(NalUnitHeader),
}

impl UnitContent {
    pub fn nal_unit_header(&self) -> &NalUnitHeader {
        match self {
            Self::Sps(sps) => &sps.nal_unit_header,
            Self::SpsExtension(ext) => &ext.nal_unit_header,
            Self::Pps(pps) => &pps.nal_unit_header,
            Self::Slice(slice) => &slice.header.nal_unit_header,
            Self::Sei(sei) => &sei.nal_unit_header,
            Self::Aud(aud) => &aud.nal_unit_header,
            Self::Filler(filler) => &filler.nal_unit_header,
            Self::EndOfSequence(header) | Self::EndOfStream(header) => header,
        }
    }
}

/// A single NAL unit.
///
/// `data` holds the RBSP, including the NAL unit header byte, with
/// emulation prevention bytes removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub nal_unit_type: u8,
    pub data: Bytes,
    /// Number of padding bits in the final byte of `data`.
    pub data_bit_padding: u8,
    pub content: Option<UnitContent>,
}

impl Unit {
    /// Create a unit from RBSP bytes. The type is taken from the first byte.
    pub fn from_data(data: Bytes) -> Self {
        let nal_unit_type = data.first().map(|b| b & 0x1f).unwrap_or(0);
        Self {
            nal_unit_type,
            data,
            data_bit_padding: 0,
            content: None,
        }
    }

    /// Create a unit holding decomposed content which has not been written.
    pub fn from_content(content: UnitContent) -> Self {
        Self {
            nal_unit_type: content.nal_unit_header().nal_unit_type,
            data: Bytes::new(),
            data_bit_padding: 0,
            content: Some(content),
        }
    }

    pub fn unit_type(&self) -> NalUnitType {
        NalUnitType::from(self.nal_unit_type)
    }
}

/// A chunk of bitstream, such as one packet or one access unit, and the
/// units it splits into.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    /// Bytes as stored in the container (Annex B, or length prefixed).
    pub data: Bytes,
    /// Number of padding bits in the final byte of `data`.
    pub data_bit_padding: u8,
    pub units: Vec<Unit>,
}

impl Fragment {
    /// Create a fragment which has not yet been split.
    pub fn new<B: Into<Bytes>>(data: B) -> Self {
        Self {
            data: data.into(),
            data_bit_padding: 0,
            units: Vec::new(),
        }
    }

    /// Drop all units and data so the fragment can be reused.
    pub fn reset(&mut self) {
        self.data = Bytes::new();
        self.data_bit_padding = 0;
        self.units.clear();
    }

    /// Insert a unit holding `content` at `position`, or at the end when
    /// `position` is `None`.
    pub fn insert_unit_content(
        &mut self,
        position: Option<usize>,
        content: UnitContent,
    ) -> Result<()> {
        self.insert_unit(position, Unit::from_content(content))
    }

    /// Insert a unit holding RBSP `data` at `position`, or at the end when
    /// `position` is `None`.
    pub fn insert_unit_data(&mut self, position: Option<usize>, data: Bytes) -> Result<()> {
        self.insert_unit(position, Unit::from_data(data))
    }

    fn insert_unit(&mut self, position: Option<usize>, unit: Unit) -> Result<()> {
        let position = position.unwrap_or(self.units.len());
        if position > self.units.len() {
            return Err(Error::invalid_data(format!(
                "Invalid unit position {position}: fragment has {} units.",
                self.units.len()
            )));
        }
        self.units.try_reserve(1)?;
        self.units.insert(position, unit);
        Ok(())
    }

    /// Remove and return the unit at `position`.
    pub fn delete_unit(&mut self, position: usize) -> Result<Unit> {
        if position >= self.units.len() {
            return Err(Error::invalid_data(format!(
                "Invalid unit position {position}: fragment has {} units.",
                self.units.len()
            )));
        }
        Ok(self.units.remove(position))
    }
}

// Emulation prevention ----------------------

/// Calculate the maximum possible NAL buffer size for a given RBSP size.
#[inline]
pub(crate) fn calc_max_nal_buf_size(rbsp_size: usize) -> usize {
    rbsp_size.div_ceil(2) * 3
}

/// Convert Raw byte sequence payload (RBSP) data to Encapsulated Byte Sequence
/// Payload (EBSP) bytes, appending them to `nal_buf`.
pub(crate) fn rbsp_to_ebsp(rbsp_buf: &[u8], nal_buf: &mut Vec<u8>) {
    let mut input_buf = rbsp_buf;

    while let Some(first_idx) = memchr::memchr(0x00, input_buf) {
        if first_idx + 1 < input_buf.len() {
            // more input exists
            if input_buf[first_idx + 1] == 0x00 {
                // two nulls in a row
                if first_idx + 2 < input_buf.len() {
                    let src = &input_buf[..first_idx + 2];
                    nal_buf.extend_from_slice(src);
                    if needs_protecting_in_pos3(input_buf[first_idx + 2]) {
                        nal_buf.push(0x03);
                    }
                    input_buf = &input_buf[src.len()..];
                } else {
                    // no more input
                    break;
                }
            } else {
                // next index is not null, use input up to and including null
                let src = &input_buf[..first_idx + 1];
                nal_buf.extend_from_slice(src);
                input_buf = &input_buf[src.len()..];
            }
        } else {
            // no more input
            break;
        }
    }

    nal_buf.extend_from_slice(input_buf);
}

#[inline]
/// Returns true if byte is 0x00, 0x01, 0x02 or 0x03.
fn needs_protecting_in_pos3(byte: u8) -> bool {
    matches!(byte, 0x00..=0x03)
}

/// Remove emulation prevention bytes, returning the RBSP.
///
/// When `ebsp` contains no emulation prevention byte, the returned buffer
/// shares storage with `ebsp`.
pub(crate) fn ebsp_to_rbsp(ebsp: Bytes) -> Result<Bytes> {
    if memchr::memmem::find(&ebsp, &[0x00, 0x00, 0x03]).is_none() {
        return Ok(ebsp);
    }
    let mut rbsp = Vec::new();
    rbsp.try_reserve_exact(ebsp.len())?;
    let mut zero_run = 0;
    for &byte in ebsp.iter() {
        if zero_run >= 2 && byte == 0x03 {
            // emulation_prevention_three_byte
            zero_run = 0;
            continue;
        }
        if byte == 0x00 {
            zero_run += 1;
        } else {
            zero_run = 0;
        }
        rbsp.push(byte);
    }
    Ok(Bytes::from(rbsp))
}

#[test]
fn test_bad_byte() {
    assert!(needs_protecting_in_pos3(0x00));
    assert!(needs_protecting_in_pos3(0x01));
    assert!(needs_protecting_in_pos3(0x02));
    assert!(needs_protecting_in_pos3(0x03));
    assert!(!needs_protecting_in_pos3(0x04));
    for byte in 4..=255 {
        assert!(!needs_protecting_in_pos3(byte));
    }
}

#[cfg(test)]
const TEST_VECS: &[&[u8]] = &[
    &[0x68, 0x00],
    &[0x68, 0x01],
    &[0x68, 0x02],
    &[0x68, 0x03],
    &[0x68, 0x04],
    &[0x68, 0x00, 0x00],
    &[0x68, 0x00, 0x01],
    &[0x68, 0x00, 0x02],
    &[0x68, 0x00, 0x03],
    &[0x68, 0x00, 0x04],
    &[0x68, 0x00, 0x00, 0x00],
    &[0x68, 0x00, 0x00, 0x01],
    &[0x68, 0x00, 0x00, 0x02],
    &[0x68, 0x00, 0x00, 0x03],
    &[0x68, 0x00, 0x00, 0x04],
    &[0x68, 0x00, 0x00, 0x00, 0x00],
    &[0x68, 0x00, 0x00, 0x00, 0x01],
    &[0x68, 0x00, 0x00, 0x00, 0x02],
    &[0x68, 0x00, 0x00, 0x00, 0x03],
    &[0x68, 0x00, 0x00, 0x00, 0x04],
    &[0x68, 0x00, 0x00, 0x00, 0x05],
    &[0x68, 0x03, 0x03, 0x03, 0x03],
    &[0x68, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x68, 0x00, 0x00, 0x00, 0x01, 0x00],
    &[0x68, 0x00, 0x00, 0x00, 0x02, 0x00],
    &[0x68, 0x00, 0x00, 0x00, 0x03, 0x00],
    &[0x68, 0x00, 0x00, 0x00, 0x04, 0x00],
    &[0x68, 0x00, 0x00, 0x00, 0x05, 0x00],
    &[0x68, 0x03, 0x03, 0x03, 0x03, 0x03],
    &[0x68, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00],
    &[0x68, 0x00, 0x00, 0x03, 0x00, 0x00, 0x01],
    &[0x68, 0x00, 0x00, 0x03, 0x00, 0x00, 0x02],
    &[0x68, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03],
    &[0x68, 0x00, 0x00, 0x03, 0x00, 0x00, 0x04],
    &[0x68, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x68, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01],
    &[0x68, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x68, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01],
    &[0x68, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02],
    &[0x68, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03],
    &[0x68, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04],
];

#[test]
fn test_nal_encoding_roundtrip() {
    // `h264_reader::rbsp::decode_nal` trims the first byte.
    for orig in TEST_VECS.iter() {
        let mut encoded = Vec::new();
        rbsp_to_ebsp(orig, &mut encoded);
        assert!(encoded.len() <= calc_max_nal_buf_size(orig.len()));

        let decoded = h264_reader::rbsp::decode_nal(&encoded).unwrap();
        assert_eq!(&orig[1..], decoded.as_ref());
    }
}

#[test]
fn test_emulation_prevention_inverse() {
    for orig in TEST_VECS.iter() {
        let mut encoded = Vec::new();
        rbsp_to_ebsp(orig, &mut encoded);
        let decoded = ebsp_to_rbsp(Bytes::from(encoded)).unwrap();
        assert_eq!(&orig[..], &decoded[..]);
    }

    let plain = Bytes::from_static(&[0x67, 0x00, 0x01, 0x00, 0x00, 0x04]);
    let same = ebsp_to_rbsp(plain.clone()).unwrap();
    assert_eq!(same.as_ptr(), plain.as_ptr());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::{BitReader, BitWriter};

    #[test]
    fn test_nal_unit_header_mask() {
        let buf = [0x67];
        let mut header = NalUnitHeader::default();
        nal_unit_header(&mut BitReader::new(&buf, false), &mut header, 1 << 7).unwrap();
        assert_eq!(header.nal_ref_idc, 3);
        assert_eq!(header.nal_unit_type, 7);

        let err = nal_unit_header(&mut BitReader::new(&buf, false), &mut header, 1 << 8)
            .unwrap_err();
        assert_eq!(format!("{err}"), "invalid data: Invalid NAL unit type 7.");
    }

    #[test]
    fn test_nal_unit_header_extensions_unsupported() {
        let mask = (1 << 14) | (1 << 20) | (1 << 21);
        for (buf, name) in [
            ([0x0e, 0x80], "SVC"),
            ([0x14, 0x00], "MVC"),
            ([0x15, 0x80], "3DAVC"),
        ] {
            let mut header = NalUnitHeader::default();
            let err = nal_unit_header(&mut BitReader::new(&buf, false), &mut header, mask)
                .unwrap_err();
            assert!(
                matches!(err, Error::Unsupported { msg, .. } if msg == name),
                "{err}"
            );
        }
    }

    #[test]
    fn test_nal_unit_header_write() {
        let mut header = NalUnitHeader::new(2, NalUnitType::PictureParameterSet);
        let mut w = BitWriter::new(1, false);
        nal_unit_header(&mut w, &mut header, 1 << 8).unwrap();
        assert_eq!(w.into_bytes().0, vec![0x48]);
    }

    #[test]
    fn test_fragment_units() {
        let mut frag = Fragment::default();
        frag.insert_unit_data(None, Bytes::from_static(&[0x09, 0xf0]))
            .unwrap();
        frag.insert_unit_content(
            Some(0),
            UnitContent::EndOfStream(NalUnitHeader::new(0, NalUnitType::EndOfStream)),
        )
        .unwrap();
        assert_eq!(frag.units.len(), 2);
        assert_eq!(frag.units[0].nal_unit_type, 11);
        assert_eq!(frag.units[1].unit_type(), NalUnitType::AccessUnitDelimiter);
        assert!(frag.insert_unit_data(Some(5), Bytes::new()).is_err());

        let removed = frag.delete_unit(0).unwrap();
        assert_eq!(removed.nal_unit_type, 11);
        assert!(frag.delete_unit(1).is_err());

        frag.reset();
        assert!(frag.units.is_empty());
        assert!(frag.data.is_empty());
    }
}
