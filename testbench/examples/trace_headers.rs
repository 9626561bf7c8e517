//! Print the units of an Annex B `.h264` file, logging every syntax element
//! at trace level (`RUST_LOG=trace`).

use anyhow::Context;

use cbs_avc::{unit_types, CodedBitstream, Config, DiscardLevel, Fragment};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let fname = std::env::args()
        .nth(1)
        .context("usage: trace_headers <FILE.h264>")?;
    let data = std::fs::read(&fname).with_context(|| format!("reading {fname}"))?;

    let mut cbs = CodedBitstream::with_config(Config {
        trace_headers: true,
        ..Default::default()
    });
    let mut fragment = Fragment::new(data);
    cbs.read_fragment(&mut fragment, false)?;

    for (i, unit) in fragment.units.iter().enumerate() {
        let name = unit_types::descriptor(unit.nal_unit_type).map_or("unknown", |d| d.name);
        let key = !cbs.discarded_unit(unit, DiscardLevel::NonKey);
        println!(
            "{i}: type {} ({name}), {} bytes, key: {key}",
            unit.nal_unit_type,
            unit.data.len()
        );
    }
    Ok(())
}
