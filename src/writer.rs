// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Writes fragments to an [std::io::Write] implementation as an Annex B
//! (`.h264`) byte stream.

use std::io::Write;

use crate::{CodedBitstream, Fragment, Result, UnitContent};

/// Whether the stream header has been written.
///
/// In the `Configured` state, nothing has been written yet. The first
/// fragment is preceded by the parameter sets, either from the extradata
/// given at construction or from the cache of the [CodedBitstream], and the
/// state moves to `Recording`.
#[derive(Debug)]
enum WriteState {
    Configured { extradata: Option<Fragment> },
    Recording,
}

/// Write fragments to an [std::io::Write] implementation in `.h264` file
/// format.
#[derive(Debug)]
pub struct AnnexBWriter<W> {
    wtr: W,
    state: WriteState,
}

impl<W: Write> AnnexBWriter<W> {
    /// Create a new [AnnexBWriter] which starts the stream with the cached
    /// parameter sets.
    pub fn new(wtr: W) -> Self {
        Self {
            wtr,
            state: WriteState::Configured { extradata: None },
        }
    }

    /// Create a new [AnnexBWriter] which starts the stream with the units of
    /// `extradata`, typically split from an AVCC header.
    pub fn with_extradata(wtr: W, extradata: Fragment) -> Self {
        Self {
            wtr,
            state: WriteState::Configured {
                extradata: Some(extradata),
            },
        }
    }

    /// Retrieve the underlying [std::io::Write] implementation.
    pub fn into_inner(self) -> W {
        self.wtr
    }

    /// Write the units of `fragment` holding content, then write the
    /// assembled fragment.
    pub fn write(&mut self, cbs: &mut CodedBitstream, fragment: &mut Fragment) -> Result<()> {
        if let WriteState::Configured { extradata } = &self.state {
            let mut header = match extradata {
                Some(extradata) => extradata.clone(),
                None => cached_parameter_sets(cbs)?,
            };
            if !header.units.is_empty() {
                // Rewriting the cache in place must not deactivate the
                // parameter sets of the stream being recorded.
                let saved = cbs.parameter_sets().save();
                let written = cbs.write_fragment_content(&mut header);
                if extradata.is_none() {
                    cbs.parameter_sets_mut().restore(saved);
                }
                written?;
                self.wtr.write_all(&header.data)?;
            }
            log::debug!("Wrote stream header of {} units.", header.units.len());
            self.state = WriteState::Recording;
        }

        cbs.write_fragment_content(fragment)?;
        self.wtr.write_all(&fragment.data)?;
        Ok(())
    }
}

fn cached_parameter_sets(cbs: &CodedBitstream) -> Result<Fragment> {
    let mut fragment = Fragment::default();
    for sps in cbs.parameter_sets().iter_sps() {
        fragment.insert_unit_content(None, UnitContent::Sps(sps.clone()))?;
    }
    for pps in cbs.parameter_sets().iter_pps() {
        fragment.insert_unit_content(None, UnitContent::Pps(pps.clone()))?;
    }
    Ok(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Aud;
    use alloc::sync::Arc;
    use bytes::Bytes;

    const HELLO_SPS: &[u8] = &[0x67, 0x42, 0x00, 0x0a, 0xf8, 0x41, 0xa2];
    const HELLO_PPS: &[u8] = &[0x68, 0xce, 0x38, 0x80];
    const HELLO_SLICE: &[u8] = &[0x25, 0x88, 0x84, 0x28, 0x68];

    fn hello_avcc() -> Bytes {
        let mut header = Fragment::default();
        header
            .insert_unit_data(None, Bytes::from_static(HELLO_SPS))
            .unwrap();
        header
            .insert_unit_data(None, Bytes::from_static(HELLO_PPS))
            .unwrap();
        CodedBitstream::new().assemble_avcc_header(&header).unwrap()
    }

    fn expected_stream() -> Vec<u8> {
        let mut expected = vec![0, 0, 0, 1];
        expected.extend_from_slice(HELLO_SPS);
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(HELLO_PPS);
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(HELLO_SLICE);
        expected
    }

    #[test]
    fn test_mp4_to_annex_b() -> Result<()> {
        let mut cbs = CodedBitstream::new();
        let mut extradata = Fragment::new(hello_avcc());
        cbs.read_fragment(&mut extradata, true)?;

        let mut sample = Fragment::new(vec![0, 0, 0, 5, 0x25, 0x88, 0x84, 0x28, 0x68]);
        cbs.read_fragment(&mut sample, false)?;

        let mut wtr = AnnexBWriter::new(Vec::new());
        wtr.write(&mut cbs, &mut sample)?;
        let buf = wtr.into_inner();
        assert_eq!(buf, expected_stream());
        Ok(())
    }

    #[test]
    fn test_header_written_once() -> Result<()> {
        let mut cbs = CodedBitstream::new();
        let mut extradata = Fragment::new(hello_avcc());
        cbs.split_fragment(&mut extradata, true)?;

        let mut wtr = AnnexBWriter::with_extradata(Vec::new(), extradata);
        let mut first = Fragment::default();
        first.insert_unit_content(None, UnitContent::Aud(Aud::new(0)))?;
        wtr.write(&mut cbs, &mut first)?;
        let mut second = first.clone();
        wtr.write(&mut cbs, &mut second)?;

        let buf = wtr.into_inner();
        let mut expected = expected_stream();
        expected.truncate(expected.len() - 4 - HELLO_SLICE.len());
        expected.extend_from_slice(&[0, 0, 0, 1, 0x09, 0x10]);
        expected.extend_from_slice(&[0, 0, 0, 1, 0x09, 0x10]);
        assert_eq!(buf, expected);
        Ok(())
    }

    #[test]
    fn test_header_keeps_active_parameter_sets() -> Result<()> {
        let mut cbs = CodedBitstream::new();
        let mut stream = Fragment::new(expected_stream());
        cbs.read_fragment(&mut stream, false)?;
        let mut other = crate::Unit::from_content(UnitContent::Sps(Arc::new(crate::Sps {
            seq_parameter_set_id: 1,
            ..(**cbs.parameter_sets().lookup_sps(0)?).clone()
        })));
        cbs.write_unit(&mut other)?;
        assert_eq!(cbs.parameter_sets().iter_sps().count(), 2);

        let mut wtr = AnnexBWriter::new(Vec::new());
        let mut fragment = Fragment::default();
        fragment.insert_unit_content(None, UnitContent::Aud(Aud::new(0)))?;
        wtr.write(&mut cbs, &mut fragment)?;

        let ps = cbs.parameter_sets();
        assert_eq!(ps.active_sps().map(|sps| sps.seq_parameter_set_id), Some(0));
        assert_eq!(ps.active_pps().map(|pps| pps.pic_parameter_set_id), Some(0));
        let buf = wtr.into_inner();
        assert!(buf.starts_with(&[0, 0, 0, 1, 0x67]));
        assert!(buf.ends_with(&[0, 0, 0, 1, 0x09, 0x10]));
        Ok(())
    }

    #[test]
    fn test_empty_cache_writes_no_header() -> Result<()> {
        let mut cbs = CodedBitstream::new();
        let mut wtr = AnnexBWriter::new(Vec::new());
        let mut fragment = Fragment::default();
        fragment.insert_unit_content(None, UnitContent::Aud(Aud::new(7)))?;
        wtr.write(&mut cbs, &mut fragment)?;
        assert_eq!(wtr.into_inner(), vec![0, 0, 0, 1, 0x09, 0xf0]);
        Ok(())
    }
}
