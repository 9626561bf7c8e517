// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Reading and writing whole units and fragments.

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use bytes::Bytes;

use crate::bitstream::{BitReader, BitWriter, Direction};
use crate::nal_unit::{Fragment, Unit, UnitContent};
use crate::parameter_sets::ParameterSets;
use crate::sps::{Sps, SpsExtension};
use crate::{delimiter, fragment, pps, sei, slice, sps, unit_types};
use crate::{Aud, Error, Filler, NalUnitHeader, NalUnitType, Pps, Result, Sei};

/// Options for a [CodedBitstream].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Log every syntax element read or written at trace level.
    pub trace_headers: bool,
    /// Initial size limit of the write buffer in bytes. The limit doubles
    /// whenever a unit does not fit.
    pub initial_write_buffer_size: usize,
    /// When set, only units of these types are decomposed by
    /// [CodedBitstream::read_fragment_content].
    pub decompose_unit_types: Option<Vec<u8>>,
    /// Length field size for length prefixed (MP4) input without an AVCC
    /// header. `None` means Annex B until an AVCC header is split.
    pub nal_length_size: Option<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace_headers: false,
            initial_write_buffer_size: 1024 * 1024,
            decompose_unit_types: None,
            nal_length_size: None,
        }
    }
}

/// How aggressively [CodedBitstream::discarded_unit] drops slices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiscardLevel {
    /// Keep everything.
    #[default]
    Default,
    /// Drop slices of non-reference pictures.
    NonRef,
    /// Also drop B slices.
    Bidir,
    /// Keep only intra slices.
    NonIntra,
    /// Keep only IDR slices.
    NonKey,
    /// Drop all slices.
    All,
}

/// Reads and writes the units of an H.264 stream.
///
/// Holds the parameter set cache and the decoding state which later units
/// depend on, so all fragments of one stream must pass through the same
/// instance in order.
#[derive(Debug, Clone)]
pub struct CodedBitstream {
    config: Config,
    parameter_sets: ParameterSets,
    nal_length_size: Option<u8>,
    write_buffer_size: usize,
}

impl Default for CodedBitstream {
    fn default() -> Self {
        Self::new()
    }
}

impl CodedBitstream {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            nal_length_size: config.nal_length_size,
            write_buffer_size: config.initial_write_buffer_size.max(1),
            parameter_sets: ParameterSets::new(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn parameter_sets(&self) -> &ParameterSets {
        &self.parameter_sets
    }

    pub fn parameter_sets_mut(&mut self) -> &mut ParameterSets {
        &mut self.parameter_sets
    }

    /// Size of the NAL unit length field when reading length prefixed data.
    pub fn nal_length_size(&self) -> Option<u8> {
        self.nal_length_size
    }

    /// Split `fragment.data` into units.
    ///
    /// With `header` set and data not starting with a zero byte, the data is
    /// an `AVCDecoderConfigurationRecord`; its NAL length size is remembered
    /// for the following length prefixed fragments. Otherwise the data is
    /// length prefixed if the NAL length size is known, and Annex B if not.
    pub fn split_fragment(&mut self, fragment: &mut Fragment, header: bool) -> Result<()> {
        fragment.units.clear();
        let data = fragment.data.clone();
        let Some(&first) = data.first() else {
            return Ok(());
        };

        let result = if header && first != 0 {
            fragment::split_avcc_header(fragment, &data).map(|nal_length_size| {
                self.nal_length_size = Some(nal_length_size);
            })
        } else {
            match self.nal_length_size {
                Some(n @ 1..=4) => fragment::split_length_prefixed(fragment, &data, n),
                Some(n) => Err(Error::invalid_data(alloc::format!(
                    "Invalid NAL length size {n}."
                ))),
                None => fragment::split_annex_b(fragment, &data),
            }
        };
        if result.is_err() {
            fragment.units.clear();
        }
        result
    }

    /// Decompose `unit.data` into `unit.content`.
    ///
    /// Parameter sets are stored in the cache. If reading fails, the
    /// decoding state is left as it was before the call.
    pub fn read_unit(&mut self, unit: &mut Unit) -> Result<()> {
        let saved = self.parameter_sets.save();
        match read_content(unit, &mut self.parameter_sets, self.config.trace_headers) {
            Ok(content) => {
                unit.content = Some(content);
                Ok(())
            }
            Err(e) => {
                self.parameter_sets.restore(saved);
                Err(e)
            }
        }
    }

    /// Serialize `unit.content` into `unit.data`.
    ///
    /// Parameter sets written are stored in the cache. If writing fails, the
    /// decoding state is left as it was before the call.
    pub fn write_unit(&mut self, unit: &mut Unit) -> Result<()> {
        let trace = self.config.trace_headers;
        let Some(content) = unit.content.as_mut() else {
            return Err(Error::invalid_data("Unit has no content to write."));
        };

        let (data, padding) = loop {
            let saved = self.parameter_sets.save();
            let mut w = BitWriter::new(self.write_buffer_size, trace);
            match write_content(&mut w, content, &mut self.parameter_sets) {
                Ok(()) => break w.into_bytes(),
                Err(Error::InsufficientSpace { .. }) => {
                    self.parameter_sets.restore(saved);
                    self.write_buffer_size = self
                        .write_buffer_size
                        .checked_mul(2)
                        .ok_or_else(Error::insufficient_space)?;
                    log::debug!(
                        "Reallocating write buffer: {} bytes.",
                        self.write_buffer_size
                    );
                }
                Err(e) => {
                    self.parameter_sets.restore(saved);
                    return Err(e);
                }
            }
        };

        unit.nal_unit_type = content.nal_unit_header().nal_unit_type;
        unit.data = Bytes::from(data);
        unit.data_bit_padding = padding;
        Ok(())
    }

    /// Decompose every unit of `fragment`.
    ///
    /// Units of types without a syntax implementation, or excluded by
    /// [Config::decompose_unit_types], keep no content. Any other failure
    /// stops reading.
    pub fn read_fragment_content(&mut self, fragment: &mut Fragment) -> Result<()> {
        for (i, unit) in fragment.units.iter_mut().enumerate() {
            let wanted = self
                .config
                .decompose_unit_types
                .as_ref()
                .map_or(true, |types| types.contains(&unit.nal_unit_type));
            if !wanted {
                log::debug!(
                    "Skipping decomposition of unit {i} (type {}).",
                    unit.nal_unit_type
                );
                unit.content = None;
                continue;
            }

            match self.read_unit(unit) {
                Ok(()) => {}
                Err(Error::NotImplemented { .. }) => {
                    log::debug!(
                        "Decomposition unimplemented for unit {i} (type {}).",
                        unit.nal_unit_type
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Split `fragment.data` and decompose the resulting units.
    pub fn read_fragment(&mut self, fragment: &mut Fragment, header: bool) -> Result<()> {
        self.split_fragment(fragment, header)?;
        self.read_fragment_content(fragment)
    }

    /// Write every unit of `fragment` holding content, then assemble the
    /// units into Annex B `fragment.data`.
    pub fn write_fragment_content(&mut self, fragment: &mut Fragment) -> Result<()> {
        for unit in fragment.units.iter_mut() {
            if unit.content.is_some() {
                self.write_unit(unit)?;
            }
        }
        self.assemble_fragment(fragment)
    }

    /// Join the unit data of `fragment` into Annex B `fragment.data`.
    pub fn assemble_fragment(&self, fragment: &mut Fragment) -> Result<()> {
        fragment::assemble_annex_b(fragment)
    }

    /// Join the unit data of `fragment` into length prefixed
    /// `fragment.data`, using the NAL length size of this stream (default
    /// 4).
    pub fn assemble_length_prefixed(&self, fragment: &mut Fragment) -> Result<()> {
        fragment::assemble_length_prefixed(fragment, self.nal_length_size.unwrap_or(4))
    }

    /// Build an `AVCDecoderConfigurationRecord` from the written SPS and PPS
    /// units of `fragment`.
    pub fn assemble_avcc_header(&self, fragment: &Fragment) -> Result<Bytes> {
        fragment::assemble_avcc_header(fragment, self.nal_length_size.unwrap_or(4))
    }

    /// Whether `unit` should be dropped at discard level `level`.
    ///
    /// Only slices are ever dropped. Slices must have been read for the
    /// levels which inspect the slice header.
    pub fn discarded_unit(&self, unit: &Unit, level: DiscardLevel) -> bool {
        if level <= DiscardLevel::Default {
            return false;
        }
        let unit_type = unit.unit_type();
        if !unit_type.is_slice() {
            return false;
        }
        if level >= DiscardLevel::All {
            return true;
        }
        if level >= DiscardLevel::NonKey && unit_type != NalUnitType::CodedSliceOfAnIDRPicture {
            return true;
        }

        let Some(UnitContent::Slice(slice)) = &unit.content else {
            log::warn!("Slice header is missing, missing decompose?");
            return false;
        };
        let header = &slice.header;

        if level >= DiscardLevel::NonRef && header.nal_unit_header.nal_ref_idc == 0 {
            return true;
        }
        if level >= DiscardLevel::Bidir && header.kind() == slice::SliceType::B {
            return true;
        }
        if level >= DiscardLevel::NonIntra && !header.kind().is_intra() {
            return true;
        }
        false
    }

    /// Forget the decoding state, keeping cached parameter sets.
    pub fn flush(&mut self) {
        self.parameter_sets.flush();
    }

    /// Drop all state, returning to a newly configured instance.
    pub fn close(&mut self) {
        self.parameter_sets.close();
        self.nal_length_size = self.config.nal_length_size;
        self.write_buffer_size = self.config.initial_write_buffer_size.max(1);
    }
}

fn read_content(unit: &Unit, ps: &mut ParameterSets, trace: bool) -> Result<UnitContent> {
    let unit_type = unit.unit_type();
    let Some(descriptor) = unit_types::descriptor(unit.nal_unit_type) else {
        return Err(Error::not_implemented(unit.nal_unit_type, Direction::Read));
    };
    log::trace!("Reading {} unit.", descriptor.name);

    let mut r = BitReader::new(&unit.data, trace);
    let content = match unit_type {
        NalUnitType::SequenceParameterSet => {
            let mut current = Sps::default();
            sps::sps(&mut r, &mut current)?;
            let current = Arc::new(current);
            ps.replace_sps(current.clone());
            UnitContent::Sps(current)
        }
        NalUnitType::SequenceParameterSetExtension => {
            let mut current = SpsExtension::default();
            sps::sps_extension(&mut r, &mut current)?;
            UnitContent::SpsExtension(current)
        }
        NalUnitType::PictureParameterSet => {
            let mut current = Pps::default();
            pps::pps(&mut r, &mut current, ps)?;
            let current = Arc::new(current);
            ps.replace_pps(current.clone());
            UnitContent::Pps(current)
        }
        NalUnitType::CodedSliceOfANonIDRPicture
        | NalUnitType::CodedSliceOfAnIDRPicture
        | NalUnitType::CodedSliceOfAnAuxiliaryPicture => {
            UnitContent::Slice(Box::new(slice::read_slice(&unit.data, ps, trace)?))
        }
        NalUnitType::SupplementalEnhancementInformation => {
            let mut current = Sei::default();
            sei::read_sei(&mut r, &mut current, ps)?;
            UnitContent::Sei(Box::new(current))
        }
        NalUnitType::AccessUnitDelimiter => {
            let mut current = Aud::default();
            delimiter::aud(&mut r, &mut current)?;
            UnitContent::Aud(current)
        }
        NalUnitType::FillerData => {
            let mut current = Filler::default();
            delimiter::filler(&mut r, &mut current)?;
            UnitContent::Filler(current)
        }
        NalUnitType::EndOfSequence => {
            let mut current = NalUnitHeader::default();
            delimiter::end_of_sequence(&mut r, &mut current)?;
            UnitContent::EndOfSequence(current)
        }
        NalUnitType::EndOfStream => {
            let mut current = NalUnitHeader::default();
            delimiter::end_of_stream(&mut r, &mut current)?;
            UnitContent::EndOfStream(current)
        }
        _ => return Err(Error::not_implemented(unit.nal_unit_type, Direction::Read)),
    };
    Ok(content)
}

fn write_content(w: &mut BitWriter, content: &mut UnitContent, ps: &mut ParameterSets) -> Result<()> {
    match content {
        UnitContent::Sps(current) => {
            sps::sps(w, Arc::make_mut(current))?;
            ps.replace_sps(current.clone());
        }
        UnitContent::SpsExtension(current) => sps::sps_extension(w, current)?,
        UnitContent::Pps(current) => {
            pps::pps(w, Arc::make_mut(current), ps)?;
            ps.replace_pps(current.clone());
        }
        UnitContent::Slice(current) => slice::write_slice(w, current, ps)?,
        UnitContent::Sei(current) => sei::write_sei(w, current, ps)?,
        UnitContent::Aud(current) => delimiter::aud(w, current)?,
        UnitContent::Filler(current) => delimiter::filler(w, current)?,
        UnitContent::EndOfSequence(current) => delimiter::end_of_sequence(w, current)?,
        UnitContent::EndOfStream(current) => delimiter::end_of_stream(w, current)?,
    }
    Ok(())
}
