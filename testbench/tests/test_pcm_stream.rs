// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use anyhow::Result;
use h264_reader::nal::{pps::PicParameterSet, sps::SeqParameterSet, Nal, RefNal};

use cbs_avc::{CodedBitstream, DiscardLevel, Fragment, UnitContent};
use testbench::*;

const SIZE: PictureSize = PictureSize {
    width_mbs: 4,
    height_mbs: 3,
};

#[test]
fn test_stream_layout() -> Result<()> {
    let stream = pcm_stream(SIZE, 3)?;

    let mut cbs = CodedBitstream::new();
    let mut fragment = Fragment::new(stream);
    cbs.read_fragment(&mut fragment, false)?;

    let types: Vec<u8> = fragment.units.iter().map(|u| u.nal_unit_type).collect();
    assert_eq!(types, vec![7, 8, 9, 5, 9, 5, 9, 5]);

    let mut idr_pic_ids = Vec::new();
    for unit in fragment.units.iter() {
        if let Some(UnitContent::Slice(slice)) = &unit.content {
            idr_pic_ids.push(slice.header.idr_pic_id);
            let data_len = slice.data.as_ref().map_or(0, |d| d.data.len());
            assert!(data_len > SIZE.width_mbs * SIZE.height_mbs * PCM_MB_BYTES);
        }
    }
    assert_eq!(idr_pic_ids, vec![0, 1, 0]);
    Ok(())
}

#[test]
fn test_stream_matches_h264_reader() -> Result<()> {
    let stream = pcm_stream(SIZE, 1)?;
    let mut cbs = CodedBitstream::new();
    let mut fragment = Fragment::new(stream);
    cbs.split_fragment(&mut fragment, false)?;

    let sps = SeqParameterSet::from_bits(h264_reader::rbsp::BitReader::new(
        &fragment.units[0].data[1..],
    ))
    .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    assert_eq!(sps.pic_width_in_mbs_minus1 + 1, SIZE.width_mbs as u32);
    assert_eq!(
        sps.pic_height_in_map_units_minus1 + 1,
        SIZE.height_mbs as u32
    );

    let mut ctx = h264_reader::Context::default();
    ctx.put_seq_param_set(sps);
    let pps = PicParameterSet::from_bits(
        &ctx,
        h264_reader::rbsp::BitReader::new(&fragment.units[1].data[1..]),
    )
    .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    ctx.put_pic_param_set(pps);

    let nal = RefNal::new(&fragment.units[3].data, &[], true);
    let (header, _, _) = h264_reader::nal::slice::SliceHeader::from_bits(
        &ctx,
        &mut nal.rbsp_bits(),
        nal.header().map_err(|e| anyhow::anyhow!("{e:?}"))?,
    )
    .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    assert_eq!(header.first_mb_in_slice, 0);
    assert_eq!(header.frame_num, 0);
    Ok(())
}

#[test]
fn test_rewrite_is_identical() -> Result<()> {
    let stream = pcm_stream(SIZE, 2)?;
    let mut cbs = CodedBitstream::new();
    let mut fragment = Fragment::new(stream.clone());
    cbs.read_fragment(&mut fragment, false)?;
    cbs.write_fragment_content(&mut fragment)?;
    assert_eq!(&fragment.data[..], &stream[..]);
    Ok(())
}

#[test]
fn test_discard_levels() -> Result<()> {
    let stream = pcm_stream(SIZE, 2)?;
    let mut cbs = CodedBitstream::new();
    let mut fragment = Fragment::new(stream);
    cbs.read_fragment(&mut fragment, false)?;

    for (level, expected_kept) in [
        (DiscardLevel::Default, 6),
        (DiscardLevel::NonIntra, 6),
        (DiscardLevel::NonKey, 6),
        (DiscardLevel::All, 4),
    ] {
        let kept = fragment
            .units
            .iter()
            .filter(|unit| !cbs.discarded_unit(unit, level))
            .count();
        assert_eq!(kept, expected_kept, "{level:?}");
    }
    Ok(())
}

#[test]
fn test_length_prefixed_conversion() -> Result<()> {
    let stream = pcm_stream(SIZE, 1)?;
    let mut cbs = CodedBitstream::new();
    let mut fragment = Fragment::new(stream.clone());
    cbs.split_fragment(&mut fragment, false)?;

    // Parameter sets go to the AVCC header, the rest to a sample.
    let mut header = Fragment::default();
    let mut sample = Fragment::default();
    for unit in fragment.units.drain(..) {
        if unit.nal_unit_type == 7 || unit.nal_unit_type == 8 {
            header.units.push(unit);
        } else {
            sample.units.push(unit);
        }
    }
    let avcc = cbs.assemble_avcc_header(&header)?;
    cbs.assemble_length_prefixed(&mut sample)?;

    let mut mp4 = CodedBitstream::new();
    let mut extradata = Fragment::new(avcc);
    mp4.read_fragment(&mut extradata, true)?;
    let mut parsed = Fragment::new(sample.data.clone());
    mp4.read_fragment(&mut parsed, false)?;
    assert_eq!(parsed.units.len(), 2);

    let mut wtr = cbs_avc::AnnexBWriter::new(Vec::new());
    wtr.write(&mut mp4, &mut parsed)?;
    // The AUD opens each access unit with a four byte start code either way.
    assert_eq!(wtr.into_inner(), stream);
    Ok(())
}
