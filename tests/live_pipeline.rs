//! End-to-end tests of the live streaming pipeline: a loopback tuner is
//! fed a synthetic multiplex and a client socket receives the resulting
//! stream-change and muxed packets.

mod common;

use common::*;
use pvrlink::channels::{Channel, ChannelList};
use pvrlink::demux::{DemuxOutput, DemuxerBundle};
use pvrlink::demux::patpmt::PatPmtParser;
use pvrlink::live::streamer::StreamerOptions;
use pvrlink::live::{ChannelCache, LiveQueue, LiveStreamer, LoopbackTuner, TunerPool};
use pvrlink::net::{
    MsgPacket, SocketLock, STATUS_SIGNAL_LOST, STATUS_SIGNAL_RESTORED, STREAM_CHANGE,
    STREAM_MUXPKT, STREAM_STATUS,
};
use std::sync::Arc;
use std::time::Duration;

const SID: u16 = 0x2837;
const PMT_PID: u16 = 0x20;
const VIDEO_PID: u16 = 0x100;
const AUDIO_PID: u16 = 0x101;

fn test_channel() -> Channel {
    Channel {
        identity: "S19.2E-1-1019-10301".to_string(),
        name: "Test One".to_string(),
        number: 1,
        provider: "TestProv".to_string(),
        service: "TestSvc".to_string(),
        sid: SID,
        vpid: VIDEO_PID,
        vtype: 0x02,
        ..Default::default()
    }
}

/// One multiplex iteration: PAT, PMT and a video PES carrying a GOP.
fn multiplex_chunk(pts_base: i64, continuity: &mut u8) -> Vec<u8> {
    let entries = [PmtEntry {
        stream_type: 0x02,
        pid: VIDEO_PID,
        descriptors: vec![],
    }];

    let mut out = Vec::new();
    out.extend_from_slice(&section_to_ts(0, &build_pat(0, SID, PMT_PID)));
    out.extend_from_slice(&section_to_ts(PMT_PID, &build_pmt(1, SID, VIDEO_PID, &entries)));

    let pes = build_pes(0xE0, pts_base + 3600, pts_base, &mpeg2_gop_payload());
    for packet in pes_to_ts(VIDEO_PID, &pes, continuity) {
        out.extend_from_slice(&packet);
    }

    out
}

/// The demuxer pipeline alone: PAT/PMT discovery into a stream bundle,
/// then video parameters out of the elementary stream.
#[test]
fn demuxes_synthetic_multiplex() {
    let mut parser = PatPmtParser::new(Some(SID), 0);
    let mut demuxers = DemuxerBundle::new();
    let mut out = DemuxOutput::default();

    let mut continuity = 0u8;
    let mut emitted = Vec::new();

    for i in 0..4i64 {
        let chunk = multiplex_chunk(90_000 + i * 7200, &mut continuity);
        for packet in chunk.chunks(TS_PACKET_SIZE) {
            if let Some(bundle) = parser.process_ts_packet(packet) {
                demuxers.update_from(&bundle);
            }
            demuxers.process_ts_packet(packet, &mut out);
            emitted.append(&mut out.packets);
            out.clear();
        }
    }

    assert_eq!(demuxers.len(), 1);
    assert!(demuxers.is_ready(), "video stream must be parsed");

    let info = demuxers.iter().next().unwrap().info();
    assert_eq!(info.width, 720);
    assert_eq!(info.height, 576);
    assert_eq!(info.fps_rate, 25);

    assert!(!emitted.is_empty());
    for pkt in &emitted {
        assert_eq!(pkt.pid, VIDEO_PID);
    }

    // timestamps are rescaled to 1 MHz and non-decreasing per PID
    let mut last_dts = i64::MIN;
    for pkt in &emitted {
        assert!(pkt.dts >= last_dts);
        last_dts = pkt.dts;
    }
    assert_eq!(emitted[0].dts, 90_000 * 1_000_000 / 90_000);
}

struct LiveSetup {
    streamer: LiveStreamer,
    tuner: Arc<LoopbackTuner>,
    client: tokio::net::TcpStream,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

async fn start_live(timeout: Duration) -> LiveSetup {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (server_stream, _) = listener.accept().await.unwrap();
    let (_read_half, write_half) = server_stream.into_split();

    let cache_dir = tempfile::tempdir().unwrap();
    let shift_dir = tempfile::tempdir().unwrap();

    let channel = test_channel();
    let channels = Arc::new(ChannelList::new());
    channels.push(channel.clone());

    let tuner = Arc::new(LoopbackTuner::new("loopback #1"));
    let tuners = Arc::new(TunerPool::new(vec![tuner.clone()]));
    let cache = Arc::new(ChannelCache::new(cache_dir.path()));
    let sock = Arc::new(SocketLock::new(write_half));
    let queue = LiveQueue::new(shift_dir.path(), 1 << 20, 1);

    let options = StreamerOptions {
        timeout,
        ..Default::default()
    };

    let streamer = LiveStreamer::open(
        &channel, channels, tuners, cache, sock, queue, options,
    )
    .await
    .expect("channel switch must succeed");

    LiveSetup {
        streamer,
        tuner,
        client,
        _dirs: (cache_dir, shift_dir),
    }
}

/// Feed multiplex iterations until `predicate` matches a received packet,
/// returning every packet seen on the way.
async fn feed_until(
    setup: &mut LiveSetup,
    continuity: &mut u8,
    pts: &mut i64,
    predicate: impl Fn(&MsgPacket) -> bool,
) -> Vec<MsgPacket> {
    let mut seen = Vec::new();

    for _ in 0..200 {
        let chunk = multiplex_chunk(*pts, continuity);
        *pts += 7200;
        setup.tuner.feed(&chunk);

        // drain whatever arrived
        loop {
            let next = tokio::time::timeout(
                Duration::from_millis(50),
                MsgPacket::recv(&mut setup.client),
            )
            .await;

            match next {
                Ok(Ok(packet)) => {
                    let done = predicate(&packet);
                    seen.push(packet);
                    if done {
                        return seen;
                    }
                }
                _ => break,
            }
        }
    }

    panic!("expected packet did not arrive");
}

/// A stream change describing the program arrives before the first muxed
/// packet, and muxed packets carry the video PID.
#[tokio::test]
async fn live_stream_change_before_muxpkt() {
    let mut setup = start_live(Duration::from_secs(3)).await;
    assert!(setup.tuner.is_attached());
    assert_eq!(setup.tuner.tuned_sid(), SID);

    let mut continuity = 0u8;
    let mut pts = 90_000i64;
    let seen = feed_until(&mut setup, &mut continuity, &mut pts, |p| {
        p.opcode == STREAM_MUXPKT
    })
    .await;

    let first_change = seen.iter().position(|p| p.opcode == STREAM_CHANGE);
    let first_mux = seen.iter().position(|p| p.opcode == STREAM_MUXPKT);

    assert!(first_change.is_some(), "no stream change received");
    assert!(first_change.unwrap() < first_mux.unwrap());

    // the stream change describes our MPEG-2 video stream
    let mut change = seen[first_change.unwrap()].clone();
    change.rewind();
    assert_eq!(change.get_u32().unwrap(), VIDEO_PID as u32);
    assert_eq!(change.get_string().unwrap(), "MPEG2VIDEO");

    // the mux packet payload leads with the PID
    let mut mux = seen[first_mux.unwrap()].clone();
    mux.rewind();
    assert_eq!(mux.get_u16().unwrap(), VIDEO_PID);

    setup.streamer.close().await;
}

/// Cutting the receiver input raises exactly one SIGNAL_LOST; resuming
/// raises SIGNAL_RESTORED followed by a stream change and muxed packets.
#[tokio::test]
async fn live_signal_loss_and_restore() {
    let mut setup = start_live(Duration::from_millis(500)).await;

    let mut continuity = 0u8;
    let mut pts = 90_000i64;
    feed_until(&mut setup, &mut continuity, &mut pts, |p| {
        p.opcode == STREAM_MUXPKT
    })
    .await;

    // starve the receiver until the status message arrives
    let mut status_codes = Vec::new();
    loop {
        let next = tokio::time::timeout(
            Duration::from_secs(5),
            MsgPacket::recv(&mut setup.client),
        )
        .await
        .expect("expected SIGNAL_LOST before timeout")
        .expect("socket closed unexpectedly");

        if next.opcode == STREAM_STATUS {
            let mut p = next;
            p.rewind();
            status_codes.push(p.get_u32().unwrap());
            break;
        }
    }
    assert_eq!(status_codes, vec![STATUS_SIGNAL_LOST]);

    // resume the feed: restored status, then a stream change, then data
    let seen = feed_until(&mut setup, &mut continuity, &mut pts, |p| {
        p.opcode == STREAM_MUXPKT
    })
    .await;

    let restored = seen
        .iter()
        .position(|p| p.opcode == STREAM_STATUS)
        .expect("no SIGNAL_RESTORED");
    let mut p = seen[restored].clone();
    p.rewind();
    assert_eq!(p.get_u32().unwrap(), STATUS_SIGNAL_RESTORED);

    let change = seen
        .iter()
        .position(|p| p.opcode == STREAM_CHANGE)
        .expect("no stream change after restore");
    let mux = seen.iter().position(|p| p.opcode == STREAM_MUXPKT).unwrap();
    assert!(restored < change);
    assert!(change < mux);

    setup.streamer.close().await;
}
