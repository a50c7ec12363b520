//! End-to-end test of the recording packet player: a synthetic TS
//! recording is written to disk and replayed through the demuxer
//! pipeline, checking stream-change ordering, the I-frame gate and seek.

mod common;

use common::*;
use pvrlink::net::{STREAM_CHANGE, STREAM_MUXPKT};
use pvrlink::rec::PacketPlayer;
use std::path::Path;

const SID: u16 = 0x11;
const PMT_PID: u16 = 0x20;
const VIDEO_PID: u16 = 0x100;

fn write_recording(dir: &Path, gops: usize) -> u64 {
    let entries = [PmtEntry {
        stream_type: 0x02,
        pid: VIDEO_PID,
        descriptors: vec![],
    }];

    let mut data = Vec::new();
    let mut continuity = 0u8;

    for i in 0..gops {
        data.extend_from_slice(&section_to_ts(0, &build_pat(0, SID, PMT_PID)));
        data.extend_from_slice(&section_to_ts(
            PMT_PID,
            &build_pmt(2, SID, VIDEO_PID, &entries),
        ));

        let pts = 90_000 + (i as i64) * 7200;
        let pes = build_pes(0xE0, pts + 3600, pts, &mpeg2_gop_payload());
        for packet in pes_to_ts(VIDEO_PID, &pes, &mut continuity) {
            data.extend_from_slice(&packet);
        }
    }

    // pad to whole 20-packet blocks
    while (data.len() / TS_PACKET_SIZE) % 20 != 0 {
        data.extend_from_slice(&null_packet());
    }

    // split over two files to exercise the segment mapping
    let half = (data.len() / TS_PACKET_SIZE / 2) * TS_PACKET_SIZE;
    std::fs::write(dir.join("00001.ts"), &data[..half]).unwrap();
    std::fs::write(dir.join("00002.ts"), &data[half..]).unwrap();

    data.len() as u64
}

#[test]
fn replay_produces_stream_change_then_mux_packets() {
    let dir = tempfile::tempdir().unwrap();
    let total = write_recording(dir.path(), 12);

    let mut player = PacketPlayer::open(dir.path()).unwrap();
    assert_eq!(player.total_length(), total);

    let mut opcodes = Vec::new();
    let mut mux_payloads = Vec::new();

    while let Some(mut packet) = player.get_packet().unwrap() {
        opcodes.push(packet.opcode);

        if packet.opcode == STREAM_MUXPKT {
            packet.rewind();
            let pid = packet.get_u16().unwrap();
            let _pts = packet.get_s64().unwrap();
            let _dts = packet.get_s64().unwrap();
            let _duration = packet.get_u32().unwrap();
            let size = packet.get_u32().unwrap() as usize;
            let _payload = packet.get_blob(size).unwrap();
            let position = packet.get_u64().unwrap();
            let total_length = packet.get_u64().unwrap();

            assert_eq!(pid, VIDEO_PID);
            assert!(position <= total);
            assert_eq!(total_length, total);
            mux_payloads.push(packet.stream_id);
        }
    }

    // the program description precedes all muxed packets
    assert_eq!(opcodes.first(), Some(&STREAM_CHANGE));
    assert!(opcodes.iter().filter(|&&o| o == STREAM_MUXPKT).count() > 2);

    // playback starts with a key frame
    assert_eq!(mux_payloads[0], 1, "first frame must be an I frame");
}

#[test]
fn seek_rearms_keyframe_gate_and_reports_position() {
    let dir = tempfile::tempdir().unwrap();
    let total = write_recording(dir.path(), 24);

    let mut player = PacketPlayer::open(dir.path()).unwrap();

    // drain a few packets, then jump to the middle
    for _ in 0..4 {
        player.get_packet().unwrap();
    }

    let target = total / 2;
    assert!(player.seek(target));
    assert_eq!(player.position() % TS_PACKET_SIZE as u64, 0);
    assert!(player.position() <= target);

    // after the seek: a stream change, then an I frame first
    let mut first_mux = None;
    let mut saw_change = false;

    while let Some(mut packet) = player.get_packet().unwrap() {
        match packet.opcode {
            STREAM_CHANGE => saw_change = true,
            STREAM_MUXPKT => {
                packet.rewind();
                let _pid = packet.get_u16().unwrap();
                first_mux = Some(packet.stream_id);
                break;
            }
            _ => {}
        }
    }

    assert!(saw_change, "no stream change after seek");
    assert_eq!(first_mux, Some(1), "playback after seek starts on an I frame");
}
