//! Parser seam shared by all codec parsers: PES header handling, the
//! 33-bit timestamp arithmetic, and the two parser drivers (byte-aligned
//! framed audio and whole-PES packets).

use super::FrameType;
use bytes::{Bytes, BytesMut};

/// Sentinel for "no timestamp", representable in both f64 and i64.
pub const NOPTS: i64 = -1 << 52;

const MAX_33BIT: i64 = 0x1_FFFF_FFFF;

/// Add two 90 kHz timestamps with explicit 33-bit wraparound.
pub fn pts_add(pts: i64, offset: i64) -> i64 {
    if pts == NOPTS {
        return NOPTS;
    }
    (pts + offset) & MAX_33BIT
}

/// True if the buffer starts with a PES start code.
pub fn pes_is_header(data: &[u8]) -> bool {
    data.len() >= 3 && data[0] == 0 && data[1] == 0 && data[2] == 1
}

/// Declared PES packet length (0 means unbounded).
fn pes_length(data: &[u8]) -> usize {
    ((data[4] as usize) << 8) | data[5] as usize
}

/// Offset of the payload behind the PES header.
fn pes_payload_offset(data: &[u8]) -> usize {
    9 + data[8] as usize
}

fn pes_has_pts(data: &[u8]) -> bool {
    data[7] & 0x80 != 0 && data[8] >= 5
}

fn pes_has_dts(data: &[u8]) -> bool {
    data[7] & 0x40 != 0 && data[8] >= 10
}

fn pes_get_pts(data: &[u8]) -> i64 {
    (((data[9] as i64) & 0x0E) << 29)
        | ((data[10] as i64) << 22)
        | (((data[11] as i64) & 0xFE) << 14)
        | ((data[12] as i64) << 7)
        | (((data[13] as i64) & 0xFE) >> 1)
}

fn pes_get_dts(data: &[u8]) -> i64 {
    (((data[14] as i64) & 0x0E) << 29)
        | ((data[15] as i64) << 22)
        | (((data[16] as i64) & 0xFE) << 14)
        | ((data[17] as i64) << 7)
        | (((data[18] as i64) & 0xFE) >> 1)
}

/// Video parameters reported by a parser.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub fps_scale: u32,
    pub fps_rate: u32,
    pub width: u32,
    pub height: u32,
    /// Display aspect ratio
    pub aspect: f64,
    /// Pixel aspect numerator/denominator
    pub par_num: i32,
    pub par_den: i32,
}

/// Audio parameters reported by a parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioInfo {
    pub channels: u32,
    pub sample_rate: u32,
    pub bit_rate: u32,
    pub bits_per_sample: u32,
    pub block_align: u32,
}

/// One access unit emitted by a parser, still in 90 kHz ticks.
#[derive(Debug)]
pub struct RawPacket {
    pub data: Bytes,
    pub dts: i64,
    pub pts: i64,
    /// Duration in 90 kHz ticks
    pub duration: u32,
    pub frame_type: FrameType,
}

/// Everything a parser produced for one input chunk. The demuxer drains
/// the sink after each `parse` call and applies it to its stream info.
#[derive(Debug, Default)]
pub struct ParserSink {
    pub packets: Vec<RawPacket>,
    pub video_info: Option<VideoInfo>,
    pub audio_info: Option<AudioInfo>,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
    pub vps: Option<Vec<u8>>,
}

impl ParserSink {
    pub fn clear(&mut self) {
        self.packets.clear();
        self.video_info = None;
        self.audio_info = None;
        self.sps = None;
        self.pps = None;
        self.vps = None;
    }
}

/// Codec parser interface. One TS payload chunk per call, in PID order.
pub trait Parser: Send + Sync {
    fn parse(&mut self, data: &[u8], pusi: bool, sink: &mut ParserSink);

    fn reset(&mut self);
}

/// Current decoding/presentation timestamps of one stream.
#[derive(Debug, Clone, Copy)]
pub struct PtsState {
    pub cur_pts: i64,
    pub cur_dts: i64,
}

impl Default for PtsState {
    fn default() -> Self {
        Self {
            cur_pts: NOPTS,
            cur_dts: NOPTS,
        }
    }
}

impl PtsState {
    /// Parse a PES header and take over its timestamps. Values only move
    /// forward; going backwards is accepted across a 33-bit wrap.
    /// Returns the header length.
    pub fn parse_pes_header(&mut self, data: &[u8]) -> usize {
        if data.len() < 9 || !pes_is_header(data) {
            return 0;
        }

        let hdr_len = pes_payload_offset(data);
        if data.len() < hdr_len.min(19) {
            return hdr_len;
        }

        let pts = if pes_has_pts(data) && data.len() >= 14 {
            pes_get_pts(data)
        } else {
            NOPTS
        };
        let mut dts = if pes_has_dts(data) && data.len() >= 19 {
            pes_get_dts(data)
        } else {
            NOPTS
        };

        if dts == NOPTS {
            dts = pts;
        }

        Self::advance(&mut self.cur_dts, dts);
        Self::advance(&mut self.cur_pts, pts);

        hdr_len
    }

    fn advance(cur: &mut i64, new: i64) {
        if new == NOPTS {
            return;
        }
        // monotonic, with the 33-bit wrap as the one allowed step back
        if *cur == NOPTS || new >= *cur || (*cur - new) > (1 << 32) {
            *cur = new;
        }
    }
}

/// Codec behind a [`FramedParser`]: byte-aligned frames found by an
/// alignment header in a rolling buffer.
pub trait FrameCodec: Send + Sync {
    /// Minimum number of bytes needed to evaluate an alignment header.
    fn header_size(&self) -> usize;

    /// Check for a frame header at the start of `buf`, returning the
    /// frame size in bytes.
    fn check_alignment(&self, buf: &[u8]) -> Option<usize>;

    /// Parse one complete frame, returning its parameters and duration
    /// in 90 kHz ticks.
    fn parse_frame(&mut self, frame: &[u8]) -> Option<(AudioInfo, u32)>;
}

/// Driver for the byte-aligned audio parsers (MPEG-2 audio, AC-3, E-AC-3,
/// ADTS AAC). Maintains a rolling buffer, re-finds sync after errors and
/// emits one packet per frame, advancing the timestamps by the frame
/// duration.
pub struct FramedParser<C: FrameCodec> {
    codec: C,
    buffer: BytesMut,
    times: PtsState,
    duration: u32,
    startup: bool,
}

impl<C: FrameCodec> FramedParser<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            buffer: BytesMut::new(),
            times: PtsState::default(),
            duration: 0,
            startup: true,
        }
    }

    fn drain_frames(&mut self, sink: &mut ParserSink) {
        let header_size = self.codec.header_size();

        loop {
            if self.buffer.len() <= header_size {
                return;
            }

            let framesize = match self.codec.check_alignment(&self.buffer) {
                Some(size) => size,
                None => {
                    // lost sync, scan forward
                    let mut offset = 1;
                    while offset + header_size < self.buffer.len()
                        && self.codec.check_alignment(&self.buffer[offset..]).is_none()
                    {
                        offset += 1;
                    }
                    if offset + header_size >= self.buffer.len() {
                        return;
                    }
                    log::info!("sync found at offset {}", offset);
                    let _ = self.buffer.split_to(offset);
                    continue;
                }
            };

            if framesize == 0 {
                // syncword matched but the header is garbage
                let _ = self.buffer.split_to(1);
                continue;
            }

            if self.buffer.len() < framesize {
                return;
            }

            let frame = self.buffer.split_to(framesize).freeze();

            if let Some((info, duration)) = self.codec.parse_frame(&frame) {
                self.duration = duration;
                sink.audio_info = Some(info);
            }

            sink.packets.push(RawPacket {
                data: frame,
                dts: self.times.cur_dts,
                pts: self.times.cur_pts,
                duration: self.duration,
                frame_type: FrameType::Unknown,
            });

            self.times.cur_pts = pts_add(self.times.cur_pts, self.duration as i64);
            self.times.cur_dts = pts_add(self.times.cur_dts, self.duration as i64);
        }
    }
}

impl<C: FrameCodec> Parser for FramedParser<C> {
    fn parse(&mut self, data: &[u8], pusi: bool, sink: &mut ParserSink) {
        let mut data = data;

        if pusi {
            let offset = self.times.parse_pes_header(data);
            data = &data[offset.min(data.len())..];
            self.startup = false;
        }

        if !self.startup && !data.is_empty() {
            self.buffer.extend_from_slice(data);
        }

        self.drain_frames(sink);
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.times = PtsState::default();
        self.startup = true;
    }
}

/// Shared state between a [`PesParser`] driver and its codec.
#[derive(Debug, Default)]
pub struct PesState {
    pub times: PtsState,
    /// Duration of one access unit in 90 kHz ticks
    pub duration: u32,
    /// Frame type of the assembled access unit
    pub frame_type: FrameType,
}

/// Codec behind a [`PesParser`]: payload handed over as one complete PES
/// packet.
pub trait PesPayloadCodec: Send + Sync {
    /// Parse one completed PES payload. Return `Some(len)` to have the
    /// driver emit `data[..len]` as a single packet with the current
    /// timestamps, or `None` when the codec emitted packets itself.
    fn parse_payload(
        &mut self,
        data: &[u8],
        st: &mut PesState,
        sink: &mut ParserSink,
    ) -> Option<usize>;

    fn reset(&mut self) {}
}

/// Driver for parsers that operate on whole PES packets (MPEG-2 video,
/// H.264, H.265, DVB subtitles, teletext).
pub struct PesParser<C: PesPayloadCodec> {
    codec: C,
    buffer: BytesMut,
    state: PesState,
    /// Declared payload length; 0 means unbounded
    length: usize,
    startup: bool,
}

impl<C: PesPayloadCodec> PesParser<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            buffer: BytesMut::new(),
            state: PesState::default(),
            length: 0,
            startup: true,
        }
    }
}

impl<C: PesPayloadCodec> Parser for PesParser<C> {
    fn parse(&mut self, data: &[u8], pusi: bool, sink: &mut ParserSink) {
        // packet completely assembled ?
        if !self.startup {
            let complete = (self.length != 0 && self.buffer.len() >= self.length)
                || (self.length == 0 && pusi);

            if complete && !self.buffer.is_empty() {
                let len = if self.length != 0 {
                    self.length.min(self.buffer.len())
                } else {
                    self.buffer.len()
                };

                let payload = self.buffer.split_to(len).freeze();
                if let Some(send_len) = self.codec.parse_payload(&payload, &mut self.state, sink) {
                    sink.packets.push(RawPacket {
                        data: payload.slice(..send_len.min(payload.len())),
                        dts: self.state.times.cur_dts,
                        pts: self.state.times.cur_pts,
                        duration: self.state.duration,
                        frame_type: self.state.frame_type,
                    });
                }
            }
        }

        let mut data = data;
        if pusi {
            // capture the declared payload length before stripping the header
            self.length = if data.len() >= 6 && pes_length(data) > 0 {
                pes_length(data).saturating_sub(pes_payload_offset(data).saturating_sub(6))
            } else {
                0
            };

            let offset = self.state.times.parse_pes_header(data);
            data = &data[offset.min(data.len())..];
            self.startup = false;
            self.buffer.clear();
        }

        if !self.startup {
            self.buffer.extend_from_slice(data);
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.state = PesState::default();
        self.codec.reset();
        self.length = 0;
        self.startup = true;
    }
}

/// Scan for a 32-bit start code, returning the offset of its first byte.
pub fn find_start_code(buffer: &[u8], offset: usize, startcode: u32) -> Option<usize> {
    let mut sc = 0xFFFF_FFFFu32;
    let mut pos = offset;

    while pos < buffer.len() {
        sc = (sc << 8) | buffer[pos] as u32;
        pos += 1;
        if sc == startcode {
            return Some(pos - 4);
        }
    }

    None
}

/// Build the parser matching a stream kind.
pub fn create_parser(kind: super::StreamKind) -> Option<Box<dyn Parser>> {
    use super::StreamKind;

    match kind {
        StreamKind::Mpeg2Video => Some(Box::new(super::mpeg2video::Mpeg2VideoParser::new())),
        StreamKind::H264 => Some(Box::new(super::h264::H264Parser::new())),
        StreamKind::H265 => Some(Box::new(super::h265::H265Parser::new())),
        StreamKind::Mpeg2Audio => Some(Box::new(FramedParser::new(
            super::audio::Mpeg2AudioCodec::new(),
        ))),
        StreamKind::Aac => Some(Box::new(FramedParser::new(super::audio::AdtsCodec::new()))),
        StreamKind::Latm => Some(Box::new(super::latm::LatmParser::new())),
        StreamKind::Ac3 => Some(Box::new(FramedParser::new(super::audio::Ac3Codec::new()))),
        StreamKind::Eac3 => Some(Box::new(FramedParser::new(super::audio::Eac3Codec::new()))),
        StreamKind::Teletext | StreamKind::DvbSub => {
            Some(Box::new(PesParser::new(PassThroughCodec)))
        }
        StreamKind::None => None,
    }
}

/// Pass-through for DVB subtitles and teletext: one packet per PES.
pub struct PassThroughCodec;

impl PesPayloadCodec for PassThroughCodec {
    fn parse_payload(
        &mut self,
        data: &[u8],
        _st: &mut PesState,
        _sink: &mut ParserSink,
    ) -> Option<usize> {
        Some(data.len())
    }
}
