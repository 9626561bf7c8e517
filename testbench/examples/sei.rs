use chrono::TimeZone;

use cbs_avc::sei::*;
use cbs_avc::{AnnexBWriter, CodedBitstream, UnitContent};
use testbench::*;

/// Create precision time stamp as descripted in MISB Standard 0604
fn precision_time_stamp(timestamp: chrono::DateTime<chrono::Utc>) -> UserDataUnregistered {
    let precision_time_stamp = timestamp.timestamp_micros();
    let precision_time_stamp_bytes: [u8; 8] = precision_time_stamp.to_be_bytes();

    let mut payload: Vec<u8> = vec![0u8; 12];
    payload[0] = 0x0F;
    payload[1..3].copy_from_slice(&precision_time_stamp_bytes[0..2]);
    payload[3] = 0xff;
    payload[4..6].copy_from_slice(&precision_time_stamp_bytes[2..4]);
    payload[6] = 0xff;
    payload[7..9].copy_from_slice(&precision_time_stamp_bytes[4..6]);
    payload[9] = 0xff;
    payload[10..12].copy_from_slice(&precision_time_stamp_bytes[6..8]);

    UserDataUnregistered::new(*b"MISPmicrosectime", payload)
}

fn sei_comment(msg: Vec<u8>) -> UserDataUnregistered {
    // x264 says "random ID number generated according to ISO-11578", so we made up ours here.
    let uuid = b"\x05\xdeG\x06\x03u_T\xe9\x8e4P\x1d\x0erq";
    UserDataUnregistered::new(*uuid, msg)
}

fn to_unit_content(payloads: Vec<UserDataUnregistered>) -> UnitContent {
    let messages = payloads
        .into_iter()
        .map(|udu| SeiMessage::new(SeiPayload::UserDataUnregistered(udu)))
        .collect();
    UnitContent::Sei(Box::new(Sei::new(messages)))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let size = PictureSize::new(120, 68);
    let fd = std::fs::File::create("sei.h264")?;

    let mut timestamp = chrono::Utc
        .with_ymd_and_hms(2022, 11, 19, 12, 34, 56)
        .unwrap();

    let mut cbs = CodedBitstream::new();
    write_parameter_sets(&mut cbs, size)?;
    let mut wtr = AnnexBWriter::new(fd);

    for frame in 0..10 {
        let mut access_unit = pcm_access_unit(&mut cbs, size, frame)?;
        let mut payloads = vec![precision_time_stamp(timestamp)];
        if frame == 0 {
            payloads.push(sei_comment(b"hello from rust".to_vec()));
        }
        // SEI follows the access unit delimiter.
        access_unit.insert_unit_content(Some(1), to_unit_content(payloads))?;
        wtr.write(&mut cbs, &mut access_unit)?;
        timestamp += chrono::Duration::milliseconds(50);
    }
    Ok(())
}
