//! # Transport-Stream Demultiplexing
//!
//! This module provides the per-PID demuxer pipeline of the server: TS
//! packets for one elementary stream go in, framed access units with
//! rescaled timestamps come out. Codec-specific header parsing lives in the
//! submodules; `Demuxer` owns one parser and one [`StreamInfo`] and reports
//! parsed stream parameters back through the [`DemuxListener`] seam.

use bytes::Bytes;

/// Per-stream metadata model
pub mod streaminfo;

/// Stream and demuxer collections for one program
pub mod bundle;

/// Parser seam, PES header handling and the two parser drivers
pub mod parser;

/// Byte-aligned audio parsers: MPEG-2 audio, AC-3, E-AC-3, AAC (ADTS)
pub mod audio;

/// AAC with LATM transport syntax
pub mod latm;

/// MPEG-2 video parser
pub mod mpeg2video;

/// H.264/AVC parser
pub mod h264;

/// H.265/HEVC parser
pub mod h265;

/// PAT/PMT section parsing and stream-type mapping
pub mod patpmt;

pub use bundle::{DemuxerBundle, StreamBundle};
pub use parser::{pts_add, NOPTS};
pub use streaminfo::StreamInfo;

/// Size of a Transport Stream packet in bytes
pub const TS_PACKET_SIZE: usize = 188;
/// TS packet sync byte
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Elementary stream codec type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamKind {
    #[default]
    None,
    Mpeg2Audio,
    Ac3,
    Eac3,
    Aac,
    Latm,
    Mpeg2Video,
    H264,
    H265,
    DvbSub,
    Teletext,
}

impl StreamKind {
    /// Wire name of the codec, as sent in STREAM_CHANGE messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            StreamKind::None => "NONE",
            StreamKind::Mpeg2Audio => "MPEG2AUDIO",
            StreamKind::Ac3 => "AC3",
            StreamKind::Eac3 => "EAC3",
            StreamKind::Aac | StreamKind::Latm => "AAC",
            StreamKind::Mpeg2Video => "MPEG2VIDEO",
            StreamKind::H264 => "H264",
            StreamKind::H265 => "H265",
            StreamKind::DvbSub => "DVBSUB",
            StreamKind::Teletext => "TELETEXT",
        }
    }

    pub fn content(&self) -> StreamContent {
        match self {
            StreamKind::Mpeg2Audio
            | StreamKind::Ac3
            | StreamKind::Eac3
            | StreamKind::Aac
            | StreamKind::Latm => StreamContent::Audio,
            StreamKind::Mpeg2Video | StreamKind::H264 | StreamKind::H265 => StreamContent::Video,
            StreamKind::DvbSub => StreamContent::Subtitle,
            StreamKind::Teletext => StreamContent::Teletext,
            StreamKind::None => StreamContent::None,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            StreamKind::None => 0,
            StreamKind::Mpeg2Audio => 1,
            StreamKind::Ac3 => 2,
            StreamKind::Eac3 => 3,
            StreamKind::Aac => 4,
            StreamKind::Latm => 5,
            StreamKind::Mpeg2Video => 6,
            StreamKind::H264 => 7,
            StreamKind::DvbSub => 8,
            StreamKind::Teletext => 9,
            StreamKind::H265 => 10,
        }
    }

    pub(crate) fn from_u8(v: u8) -> StreamKind {
        match v {
            1 => StreamKind::Mpeg2Audio,
            2 => StreamKind::Ac3,
            3 => StreamKind::Eac3,
            4 => StreamKind::Aac,
            5 => StreamKind::Latm,
            6 => StreamKind::Mpeg2Video,
            7 => StreamKind::H264,
            8 => StreamKind::DvbSub,
            9 => StreamKind::Teletext,
            10 => StreamKind::H265,
            _ => StreamKind::None,
        }
    }
}

/// Content class of an elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamContent {
    #[default]
    None,
    Video,
    Audio,
    Subtitle,
    Teletext,
}

impl StreamContent {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            StreamContent::None => 0,
            StreamContent::Video => 1,
            StreamContent::Audio => 2,
            StreamContent::Subtitle => 3,
            StreamContent::Teletext => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> StreamContent {
        match v {
            1 => StreamContent::Video,
            2 => StreamContent::Audio,
            3 => StreamContent::Subtitle,
            4 => StreamContent::Teletext,
            _ => StreamContent::None,
        }
    }
}

/// Picture type of a video access unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    #[default]
    Unknown,
    I,
    P,
    B,
    D,
}

impl FrameType {
    pub fn to_u16(self) -> u16 {
        match self {
            FrameType::Unknown => 0,
            FrameType::I => 1,
            FrameType::P => 2,
            FrameType::B => 3,
            FrameType::D => 4,
        }
    }
}

/// One framed access unit produced by a demuxer.
///
/// `dts`/`pts` are rescaled to 1 MHz; `rawdts`/`rawpts` keep the original
/// 90 kHz ticks. Packets are handed to the listener and never retained.
#[derive(Debug, Clone)]
pub struct StreamPacket {
    pub pid: u16,
    pub kind: StreamKind,
    pub content: StreamContent,
    pub frame_type: FrameType,
    pub dts: i64,
    pub pts: i64,
    pub rawdts: i64,
    pub rawpts: i64,
    /// Duration in 1 MHz ticks
    pub duration: u32,
    pub data: Bytes,
}

/// Callback seam between a demuxer and its owner.
pub trait DemuxListener {
    fn send_packet(&mut self, packet: StreamPacket);

    fn request_stream_change(&mut self);
}

/// Collecting listener used by the streamer and recording player loops.
#[derive(Debug, Default)]
pub struct DemuxOutput {
    pub packets: Vec<StreamPacket>,
    pub stream_change: bool,
}

impl DemuxOutput {
    pub fn clear(&mut self) {
        self.packets.clear();
        self.stream_change = false;
    }
}

impl DemuxListener for DemuxOutput {
    fn send_packet(&mut self, packet: StreamPacket) {
        self.packets.push(packet);
    }

    fn request_stream_change(&mut self) {
        self.stream_change = true;
    }
}

// TS packet field accessors

pub(crate) fn ts_pid(packet: &[u8]) -> u16 {
    (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16
}

pub(crate) fn ts_payload_start(packet: &[u8]) -> bool {
    packet[1] & 0x40 != 0
}

pub(crate) fn ts_error(packet: &[u8]) -> bool {
    packet[1] & 0x80 != 0
}

pub(crate) fn ts_is_scrambled(packet: &[u8]) -> bool {
    packet[3] & 0xC0 != 0
}

pub(crate) fn ts_has_payload(packet: &[u8]) -> bool {
    packet[3] & 0x10 != 0
}

/// Offset of the payload inside a TS packet, `None` if the adaptation
/// field swallows the whole packet.
pub(crate) fn ts_payload_offset(packet: &[u8]) -> Option<usize> {
    let offset = if packet[3] & 0x20 != 0 {
        4 + 1 + packet[4] as usize
    } else {
        4
    };
    if offset >= TS_PACKET_SIZE {
        None
    } else {
        Some(offset)
    }
}

const DVD_TIME_BASE: i64 = 1_000_000;

fn rescale(a: i64) -> i64 {
    if a == NOPTS {
        return NOPTS;
    }
    a * DVD_TIME_BASE / 90_000
}

/// Demultiplexer for one elementary stream.
///
/// Owns the stream metadata and the codec parser, accepts TS packets for
/// its PID and forwards framed access units to the listener with DTS/PTS
/// rescaled from 90 kHz to 1 MHz.
pub struct Demuxer {
    info: StreamInfo,
    parser: Option<Box<dyn parser::Parser>>,
    sink: parser::ParserSink,
}

impl Demuxer {
    pub fn new(mut info: StreamInfo) -> Self {
        let parser = parser::create_parser(info.kind);
        if parser.is_none() {
            log::error!("unrecognized stream type {:?}", info.kind);
            info.kind = StreamKind::None;
        }
        // teletext is a PES pass-through, there is nothing to parse
        if info.kind == StreamKind::Teletext {
            info.parsed = true;
        }
        Self {
            info,
            parser,
            sink: parser::ParserSink::default(),
        }
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn pid(&self) -> u16 {
        self.info.pid
    }

    pub fn kind(&self) -> StreamKind {
        self.info.kind
    }

    pub fn content(&self) -> StreamContent {
        self.info.content
    }

    pub fn is_parsed(&self) -> bool {
        self.info.parsed
    }

    /// Feed one TS packet. Returns false when the packet was rejected
    /// (bad sync, transport error, scrambled or malformed).
    pub fn process_ts_packet(&mut self, packet: &[u8], listener: &mut dyn DemuxListener) -> bool {
        if packet.len() != TS_PACKET_SIZE || packet[0] != TS_SYNC_BYTE {
            return false;
        }

        if ts_is_scrambled(packet) {
            return false;
        }

        if ts_error(packet) {
            log::error!("transport error on pid {}", self.info.pid);
            return false;
        }

        if !ts_has_payload(packet) {
            return true;
        }

        let offset = match ts_payload_offset(packet) {
            Some(o) => o,
            None => return false,
        };

        let pusi = ts_payload_start(packet);
        let payload = &packet[offset..];

        // a unit start must begin with a PES start code
        if pusi && !parser::pes_is_header(payload) {
            return false;
        }

        if let Some(p) = self.parser.as_mut() {
            self.sink.clear();
            p.parse(payload, pusi, &mut self.sink);
            self.apply_sink(listener);
        }

        true
    }

    fn apply_sink(&mut self, listener: &mut dyn DemuxListener) {
        let sink = std::mem::take(&mut self.sink);

        if let Some(sps) = sink.sps {
            self.info.set_sps(&sps);
        }
        if let Some(pps) = sink.pps {
            self.info.set_pps(&pps);
        }
        if let Some(vps) = sink.vps {
            self.info.set_vps(&vps);
        }

        if let Some(v) = sink.video_info {
            self.set_video_info(v, listener);
        }
        if let Some(a) = sink.audio_info {
            self.set_audio_info(a, listener);
        }

        for raw in sink.packets {
            self.forward(raw, listener);
        }
    }

    fn forward(&self, raw: parser::RawPacket, listener: &mut dyn DemuxListener) {
        let packet = StreamPacket {
            pid: self.info.pid,
            kind: self.info.kind,
            content: self.info.content,
            frame_type: raw.frame_type,
            rawdts: raw.dts,
            rawpts: raw.pts,
            dts: rescale(raw.dts),
            pts: rescale(raw.pts),
            duration: rescale(raw.duration as i64) as u32,
            data: raw.data,
        };
        listener.send_packet(packet);
    }

    fn set_video_info(&mut self, v: parser::VideoInfo, listener: &mut dyn DemuxListener) {
        // reject implausible picture information
        if v.width < 320 || v.height < 240 || v.aspect < 0.0 || v.par_num <= 0 || v.par_den <= 0 {
            return;
        }

        // only register changed video information
        if v.width == self.info.width
            && v.height == self.info.height
            && v.aspect == self.info.aspect
            && v.fps_scale == self.info.fps_scale
            && v.fps_rate == self.info.fps_rate
        {
            return;
        }

        log::info!(
            "new picture information on pid {}: {}x{} DAR {:.2} fps {}/{}",
            self.info.pid,
            v.width,
            v.height,
            v.aspect,
            v.fps_rate,
            v.fps_scale.max(1)
        );

        self.info.fps_scale = v.fps_scale;
        self.info.fps_rate = v.fps_rate;
        self.info.width = v.width;
        self.info.height = v.height;
        self.info.aspect = v.aspect;
        self.info.parsed = true;

        listener.request_stream_change();
    }

    fn set_audio_info(&mut self, a: parser::AudioInfo, listener: &mut dyn DemuxListener) {
        // only register changed audio information
        if a.channels == self.info.channels
            && a.sample_rate == self.info.sample_rate
            && a.bit_rate == self.info.bit_rate
        {
            return;
        }

        log::info!(
            "new audio information on pid {}: {} Hz, {} channels, {} bps",
            self.info.pid,
            a.sample_rate,
            a.channels,
            a.bit_rate
        );

        self.info.channels = a.channels;
        self.info.sample_rate = a.sample_rate;
        self.info.bit_rate = a.bit_rate;
        self.info.bits_per_sample = a.bits_per_sample;
        self.info.block_align = a.block_align;
        self.info.parsed = true;

        listener.request_stream_change();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_accessors() {
        let mut packet = [0u8; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = 0x41; // pusi + pid high
        packet[2] = 0x00; // pid 0x100
        packet[3] = 0x10; // payload only

        assert_eq!(ts_pid(&packet), 0x100);
        assert!(ts_payload_start(&packet));
        assert!(!ts_error(&packet));
        assert!(!ts_is_scrambled(&packet));
        assert!(ts_has_payload(&packet));
        assert_eq!(ts_payload_offset(&packet), Some(4));

        // with adaptation field of 10 bytes
        packet[3] = 0x30;
        packet[4] = 10;
        assert_eq!(ts_payload_offset(&packet), Some(15));
    }

    #[test]
    fn test_demuxer_rejects_bad_packets() {
        let info = StreamInfo::new(0x100, StreamKind::Mpeg2Audio);
        let mut dmx = Demuxer::new(info);
        let mut out = DemuxOutput::default();

        let mut packet = [0u8; TS_PACKET_SIZE];
        assert!(!dmx.process_ts_packet(&packet, &mut out)); // no sync byte

        packet[0] = TS_SYNC_BYTE;
        packet[1] = 0x80; // transport error
        packet[3] = 0x10;
        assert!(!dmx.process_ts_packet(&packet, &mut out));

        packet[1] = 0x00;
        packet[3] = 0x90; // scrambled
        assert!(!dmx.process_ts_packet(&packet, &mut out));
    }

    #[test]
    fn test_rescale() {
        assert_eq!(rescale(90_000), 1_000_000);
        assert_eq!(rescale(NOPTS), NOPTS);
    }

    #[test]
    fn test_teletext_born_parsed() {
        let dmx = Demuxer::new(StreamInfo::new(0x30, StreamKind::Teletext));
        assert!(dmx.is_parsed());
    }
}
