// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Table of the NAL unit types with a syntax implementation.

use alloc::sync::Arc;

use bytes::Bytes;

use crate::nal_unit::{Unit, UnitContent};
use crate::{NalUnitType, Result};

/// How the decomposed content of a unit type holds its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Plain values only.
    Pod,
    /// Contains buffers which may be shared with the unit data or with the
    /// parameter set cache.
    InternalRefs,
    /// A list of variable sized messages.
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitTypeDescriptor {
    pub nal_unit_type: NalUnitType,
    pub name: &'static str,
    pub kind: ContentKind,
}

const fn entry(nal_unit_type: NalUnitType, name: &'static str, kind: ContentKind) -> UnitTypeDescriptor {
    UnitTypeDescriptor {
        nal_unit_type,
        name,
        kind,
    }
}

const DESCRIPTORS: &[UnitTypeDescriptor] = &[
    entry(NalUnitType::CodedSliceOfANonIDRPicture, "slice", ContentKind::InternalRefs),
    entry(NalUnitType::CodedSliceOfAnIDRPicture, "IDR slice", ContentKind::InternalRefs),
    entry(NalUnitType::SupplementalEnhancementInformation, "SEI", ContentKind::Complex),
    entry(NalUnitType::SequenceParameterSet, "SPS", ContentKind::Pod),
    entry(NalUnitType::PictureParameterSet, "PPS", ContentKind::InternalRefs),
    entry(NalUnitType::AccessUnitDelimiter, "AUD", ContentKind::Pod),
    entry(NalUnitType::EndOfSequence, "end of sequence", ContentKind::Pod),
    entry(NalUnitType::EndOfStream, "end of stream", ContentKind::Pod),
    entry(NalUnitType::FillerData, "filler data", ContentKind::Pod),
    entry(NalUnitType::SequenceParameterSetExtension, "SPS extension", ContentKind::Pod),
    entry(NalUnitType::CodedSliceOfAnAuxiliaryPicture, "auxiliary slice", ContentKind::InternalRefs),
];

/// The descriptor for `nal_unit_type`, or `None` if the type cannot be
/// read or written.
pub fn descriptor(nal_unit_type: u8) -> Option<&'static UnitTypeDescriptor> {
    let wanted = NalUnitType::from(nal_unit_type);
    DESCRIPTORS.iter().find(|d| d.nal_unit_type == wanted)
}

/// Make the content of `unit` safe to modify in place.
///
/// Parameter sets shared with the cache are cloned and slice data is copied
/// out of the split buffer, so that later changes affect only this unit.
pub fn make_content_writable(unit: &mut Unit) -> Result<()> {
    let Some(content) = unit.content.as_mut() else {
        return Ok(());
    };
    match content {
        UnitContent::Sps(sps) => {
            Arc::make_mut(sps);
        }
        UnitContent::Pps(pps) => {
            Arc::make_mut(pps);
        }
        UnitContent::Slice(slice) => {
            if let Some(data) = slice.data.as_mut() {
                data.data = Bytes::copy_from_slice(&data.data);
            }
        }
        UnitContent::SpsExtension(_)
        | UnitContent::Sei(_)
        | UnitContent::Aud(_)
        | UnitContent::Filler(_)
        | UnitContent::EndOfSequence(_)
        | UnitContent::EndOfStream(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::{Slice, SliceData};
    use alloc::boxed::Box;

    #[test]
    fn test_descriptor_table() {
        assert_eq!(descriptor(7).unwrap().name, "SPS");
        assert_eq!(descriptor(8).unwrap().kind, ContentKind::InternalRefs);
        assert_eq!(descriptor(6).unwrap().kind, ContentKind::Complex);
        assert_eq!(descriptor(19).unwrap().kind, ContentKind::InternalRefs);
        for unsupported in [0, 2, 3, 4, 14, 15, 20, 21, 24] {
            assert!(descriptor(unsupported).is_none(), "type {unsupported}");
        }
    }

    #[test]
    fn test_make_content_writable() {
        let shared = Bytes::from_static(&[0x25, 0x88, 0x84, 0x28, 0x68]);
        let mut unit = Unit::from_content(UnitContent::Slice(Box::new(Slice {
            data: Some(SliceData {
                data: shared.slice(3..),
                bit_start: 5,
            }),
            ..Default::default()
        })));
        make_content_writable(&mut unit).unwrap();

        let Some(UnitContent::Slice(slice)) = &unit.content else {
            panic!("expected slice");
        };
        let data = &slice.data.as_ref().unwrap().data;
        assert_eq!(&data[..], &[0x28, 0x68]);
        assert_ne!(data.as_ptr(), shared[3..].as_ptr());

        let sps = Arc::new(crate::Sps::default());
        let mut unit = Unit::from_content(UnitContent::Sps(sps.clone()));
        make_content_writable(&mut unit).unwrap();
        let Some(UnitContent::Sps(copy)) = &unit.content else {
            panic!("expected SPS");
        };
        assert!(!Arc::ptr_eq(copy, &sps));
        assert_eq!(**copy, *sps);
    }
}
