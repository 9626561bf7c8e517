// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cache of parameter sets seen in a stream.
//!
//! Parameter sets are stored in fixed slots indexed by their id. The active
//! SPS and PPS are tracked by slot index and cleared whenever the slot they
//! refer to is replaced, so a stale parameter set is never used.

use alloc::{sync::Arc, vec, vec::Vec};

use crate::pps::Pps;
use crate::sps::Sps;
use crate::{Error, Result, MAX_PPS_COUNT, MAX_SPS_COUNT};

/// Parameter sets and decoding state shared between units of one stream.
#[derive(Debug, Clone)]
pub struct ParameterSets {
    sps: Vec<Option<Arc<Sps>>>,
    pps: Vec<Option<Arc<Pps>>>,
    active_sps: Option<usize>,
    active_pps: Option<usize>,
    last_slice_nal_unit_type: u8,
}

/// Mutable decoding state, saved before a unit is coded so a failed unit
/// leaves no trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActiveState {
    active_sps: Option<usize>,
    active_pps: Option<usize>,
    last_slice_nal_unit_type: u8,
}

impl Default for ParameterSets {
    fn default() -> Self {
        Self {
            sps: vec![None; MAX_SPS_COUNT],
            pps: vec![None; MAX_PPS_COUNT],
            active_sps: None,
            active_pps: None,
            last_slice_nal_unit_type: 0,
        }
    }
}

impl ParameterSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `sps` in the slot for its id, replacing any previous occupant.
    pub fn replace_sps(&mut self, sps: Arc<Sps>) {
        let id = usize::from(sps.seq_parameter_set_id);
        if self.active_sps == Some(id) {
            log::debug!("Replacing active SPS {id}.");
            self.active_sps = None;
        }
        self.sps[id] = Some(sps);
    }

    /// Store `pps` in the slot for its id, replacing any previous occupant.
    pub fn replace_pps(&mut self, pps: Arc<Pps>) {
        let id = usize::from(pps.pic_parameter_set_id);
        if self.active_pps == Some(id) {
            log::debug!("Replacing active PPS {id}.");
            self.active_pps = None;
        }
        self.pps[id] = Some(pps);
    }

    pub fn sps(&self, id: u8) -> Option<&Arc<Sps>> {
        self.sps.get(usize::from(id)).and_then(Option::as_ref)
    }

    pub fn pps(&self, id: u8) -> Option<&Arc<Pps>> {
        self.pps.get(usize::from(id)).and_then(Option::as_ref)
    }

    /// Like [Self::sps], but a missing SPS is an error.
    pub fn lookup_sps(&self, id: u8) -> Result<&Arc<Sps>> {
        self.sps(id)
            .ok_or_else(|| Error::reference_not_available("SPS", u32::from(id)))
    }

    /// Like [Self::pps], but a missing PPS is an error.
    pub fn lookup_pps(&self, id: u8) -> Result<&Arc<Pps>> {
        self.pps(id)
            .ok_or_else(|| Error::reference_not_available("PPS", u32::from(id)))
    }

    /// The SPS most recently referenced by a slice header or buffering
    /// period SEI message.
    pub fn active_sps(&self) -> Option<&Arc<Sps>> {
        self.active_sps.and_then(|id| self.sps[id].as_ref())
    }

    /// The PPS most recently referenced by a slice header.
    pub fn active_pps(&self) -> Option<&Arc<Pps>> {
        self.active_pps.and_then(|id| self.pps[id].as_ref())
    }

    pub(crate) fn set_active_sps(&mut self, id: u8) {
        self.active_sps = Some(usize::from(id));
    }

    pub(crate) fn set_active_pps(&mut self, id: u8) {
        self.active_pps = Some(usize::from(id));
    }

    /// NAL unit type of the last primary slice, or 0 if none was seen.
    pub fn last_slice_nal_unit_type(&self) -> u8 {
        self.last_slice_nal_unit_type
    }

    pub(crate) fn set_last_slice_nal_unit_type(&mut self, nal_unit_type: u8) {
        self.last_slice_nal_unit_type = nal_unit_type;
    }

    /// The SPS to use for timing information.
    ///
    /// This is the active SPS or, when none is active, the only cached SPS.
    pub(crate) fn timing_sps(&self) -> Option<&Arc<Sps>> {
        if let Some(sps) = self.active_sps() {
            return Some(sps);
        }
        let mut cached = self.iter_sps();
        match (cached.next(), cached.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }

    pub(crate) fn save(&self) -> ActiveState {
        ActiveState {
            active_sps: self.active_sps,
            active_pps: self.active_pps,
            last_slice_nal_unit_type: self.last_slice_nal_unit_type,
        }
    }

    pub(crate) fn restore(&mut self, state: ActiveState) {
        self.active_sps = state.active_sps;
        self.active_pps = state.active_pps;
        self.last_slice_nal_unit_type = state.last_slice_nal_unit_type;
    }

    /// All cached SPSs in id order.
    pub fn iter_sps(&self) -> impl Iterator<Item = &Arc<Sps>> {
        self.sps.iter().flatten()
    }

    /// All cached PPSs in id order.
    pub fn iter_pps(&self) -> impl Iterator<Item = &Arc<Pps>> {
        self.pps.iter().flatten()
    }

    /// Forget the decoding state but keep the cached parameter sets.
    pub fn flush(&mut self) {
        self.active_sps = None;
        self.active_pps = None;
        self.last_slice_nal_unit_type = 0;
    }

    /// Drop the cached parameter sets and the decoding state.
    pub fn close(&mut self) {
        self.flush();
        self.sps.iter_mut().for_each(|slot| *slot = None);
        self.pps.iter_mut().for_each(|slot| *slot = None);
    }
}
