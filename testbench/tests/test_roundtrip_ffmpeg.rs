// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use anyhow::{Context, Result};

use testbench::*;

const ENV_VAR_NAME: &str = "CBSAVC_SAVE_TEST_H264";

fn do_save_output() -> bool {
    // Potentially do not delete temporary directory

    match std::env::var_os(ENV_VAR_NAME) {
        Some(v) => &v != "0",
        None => false,
    }
}

fn have_ffmpeg() -> bool {
    std::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

const SIZES: &[(usize, usize)] = &[(1, 1), (2, 3), (40, 30)];
const FRAMES: usize = 3;

#[test]
fn test_roundtrip_ffmpeg_pcm() -> Result<()> {
    if !have_ffmpeg() {
        println!("ffmpeg not found, skipping");
        return Ok(());
    }

    let tmpdir = tempfile::tempdir()?;
    let base_path = tmpdir.path().to_path_buf();

    println!("temporary directory with files: {}", base_path.display());

    // Potentially do not delete temporary directory
    if do_save_output() {
        std::mem::forget(tmpdir); // do not drop it, so do not delete it
    } else {
        println!(
            "  This temporary directory will be deleted. (Set environment \
            variable \"{ENV_VAR_NAME}\" to keep it.)"
        );
    }

    for (width_mbs, height_mbs) in SIZES.iter() {
        let size = PictureSize::new(*width_mbs, *height_mbs);
        let output_name = format!("test_cbs-avc_{}x{}.h264", size.width(), size.height());
        let yuv_name = format!("{output_name}.yuv");

        println!("** {output_name}: h264 output from cbs-avc");
        std::fs::write(base_path.join(&output_name), pcm_stream(size, FRAMES)?)?;

        let args = [
            "-i",
            output_name.as_str(),
            "-f",
            "rawvideo",
            "-pix_fmt",
            "yuv420p",
            yuv_name.as_str(),
        ];
        let output = std::process::Command::new("ffmpeg")
            .args(args)
            .current_dir(&base_path)
            .output()
            .with_context(|| format!("When running: ffmpeg {:?}", args))?;
        if !output.status.success() {
            anyhow::bail!(
                "'ffmpeg {}' failed. stdout: {}, stderr: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let decoded = std::fs::read(base_path.join(&yuv_name))?;
        let mut expected = Vec::new();
        for frame in 0..FRAMES {
            expected.extend(expected_yuv420p(size, frame));
        }
        assert_eq!(decoded.len(), expected.len());
        println!("left: (raw) -> cbs-avc --(ffmpeg)--> yuv");
        println!("right: (raw)");
        assert_eq!(decoded, expected);
    }

    Ok(())
}
