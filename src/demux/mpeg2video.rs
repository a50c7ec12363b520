//! MPEG-2 video parser: splits PES payloads into pictures, extracts the
//! sequence header parameters and extrapolates missing timestamps.

use super::parser::{
    find_start_code, pts_add, ParserSink, PesParser, PesPayloadCodec, PesState, VideoInfo, NOPTS,
};
use super::FrameType;
use crate::utils::BitReader;
use bytes::Bytes;

const SEQUENCE_START: u32 = 0x0000_01B3;
const PICTURE_START: u32 = 0x0000_0100;

// frame durations in 90 kHz ticks, by frame-rate index
static FRAME_DURATIONS: [u32; 16] = [
    0, 3753, 3750, 3600, 3003, 3000, 1800, 1501, 1500, 0, 0, 0, 0, 0, 0, 0,
];

// frame rates as rate/scale, by frame-rate index
static FRAME_RATES: [(u32, u32); 16] = [
    (0, 0),
    (24000, 1001),
    (24, 1),
    (25, 1),
    (30000, 1001),
    (30, 1),
    (50, 1),
    (60000, 1001),
    (60, 1),
    (0, 0),
    (0, 0),
    (0, 0),
    (0, 0),
    (0, 0),
    (0, 0),
    (0, 0),
];

// display aspect ratios, by aspect index
static ASPECT_RATIOS: [f64; 16] = [
    0.0,
    1.0,
    1.333333333,
    1.777777778,
    2.21,
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
];

fn picture_frame_type(data: &[u8]) -> FrameType {
    let mut bs = BitReader::new(data);
    let raw = (|| -> crate::Result<u32> {
        bs.skip_bits(32)?; // picture start code
        bs.skip_bits(10)?; // temporal reference
        bs.read_bits(3)
    })()
    .unwrap_or(0);

    match raw {
        1 => FrameType::I,
        2 => FrameType::P,
        3 => FrameType::B,
        4 => FrameType::D,
        _ => FrameType::Unknown,
    }
}

pub struct Mpeg2VideoCodec {
    /// distance between PTS and DTS of the last I/P frame
    pdiff: i64,
    last_dts: i64,
}

impl Mpeg2VideoCodec {
    fn new() -> Self {
        Self {
            pdiff: 0,
            last_dts: NOPTS,
        }
    }

    fn parse_sequence_start(&mut self, data: &[u8], st: &mut PesState, sink: &mut ParserSink) {
        let mut bs = BitReader::new(data);
        if bs.remaining() < 32 {
            return;
        }

        let parsed = (|| -> crate::Result<(u32, u32, usize, usize)> {
            let width = bs.read_bits(12)?;
            let height = bs.read_bits(12)?;
            let aspect_index = bs.read_bits(4)? as usize;
            let rate_index = bs.read_bits(4)? as usize;
            Ok((width, height, aspect_index, rate_index))
        })();

        if let Ok((width, height, aspect_index, rate_index)) = parsed {
            st.duration = FRAME_DURATIONS[rate_index];

            sink.video_info = Some(VideoInfo {
                fps_scale: FRAME_RATES[rate_index].1,
                fps_rate: FRAME_RATES[rate_index].0,
                width,
                height,
                aspect: ASPECT_RATIOS[aspect_index],
                par_num: 1,
                par_den: 1,
            });
        }
    }

    fn parse_picture(&mut self, data: &[u8], st: &mut PesState) -> FrameType {
        let frame_type = picture_frame_type(data);
        let reference = matches!(frame_type, FrameType::I | FrameType::P);

        // remember the I/P frame PTS-DTS distance
        if reference && st.times.cur_dts != NOPTS && st.times.cur_pts != NOPTS {
            self.pdiff = st.times.cur_pts - st.times.cur_dts;
            self.last_dts = st.times.cur_dts;
            return frame_type;
        }

        // extrapolate DTS
        if st.times.cur_dts == NOPTS && st.duration != 0 {
            st.times.cur_dts = pts_add(self.last_dts, st.duration as i64);
            self.last_dts = st.times.cur_dts;
        }

        // B frames have DTS = PTS
        if frame_type == FrameType::B && st.times.cur_pts == NOPTS {
            st.times.cur_pts = st.times.cur_dts;
        }

        // extrapolate PTS of I/P frames
        if reference && st.times.cur_pts == NOPTS {
            st.times.cur_pts = pts_add(st.times.cur_dts, self.pdiff);
        }

        frame_type
    }
}

impl PesPayloadCodec for Mpeg2VideoCodec {
    fn parse_payload(
        &mut self,
        data: &[u8],
        st: &mut PesState,
        sink: &mut ParserSink,
    ) -> Option<usize> {
        // sequence header (width, height, aspect, duration)
        if let Some(o) = find_start_code(data, 0, SEQUENCE_START) {
            self.parse_sequence_start(&data[o + 4..], st, sink);
        }

        // nothing to emit without a known frame duration
        if st.duration == 0 {
            return None;
        }

        let first = match find_start_code(data, 0, PICTURE_START) {
            Some(s) => s,
            None => return None,
        };

        // divide this packet into frames
        let mut send_from = 0;
        let mut picture = first;
        let mut next = find_start_code(data, picture + 4, PICTURE_START);

        while let Some(e) = next {
            let frame_type = self.parse_picture(&data[picture..e], st);
            sink.packets.push(super::parser::RawPacket {
                data: Bytes::copy_from_slice(&data[send_from..e]),
                dts: st.times.cur_dts,
                pts: st.times.cur_pts,
                duration: st.duration,
                frame_type,
            });

            send_from = e;
            picture = e;
            next = find_start_code(data, picture + 4, PICTURE_START);

            st.times.cur_pts = NOPTS;
            st.times.cur_dts = pts_add(st.times.cur_dts, st.duration as i64);
        }

        // last part of the packet
        let frame_type = self.parse_picture(&data[picture..], st);
        sink.packets.push(super::parser::RawPacket {
            data: Bytes::copy_from_slice(&data[send_from..]),
            dts: st.times.cur_dts,
            pts: st.times.cur_pts,
            duration: st.duration,
            frame_type,
        });

        None
    }

    fn reset(&mut self) {
        self.pdiff = 0;
        self.last_dts = NOPTS;
    }
}

/// MPEG-2 video parser over whole PES packets.
pub struct Mpeg2VideoParser;

impl Mpeg2VideoParser {
    pub fn new() -> PesParser<Mpeg2VideoCodec> {
        PesParser::new(Mpeg2VideoCodec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::parser::PtsState;

    fn sequence_header(width: u32, height: u32, aspect_idx: u32, rate_idx: u32) -> Vec<u8> {
        let mut data = vec![0x00, 0x00, 0x01, 0xB3];
        data.push((width >> 4) as u8);
        data.push(((width << 4) as u8 & 0xF0) | ((height >> 8) as u8 & 0x0F));
        data.push(height as u8);
        data.push(((aspect_idx << 4) as u8) | rate_idx as u8);
        // bit_rate and the rest are not parsed
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        data
    }

    fn picture_header(frame_type: u32) -> Vec<u8> {
        // 10 bits temporal reference, 3 bits picture coding type
        let mut data = vec![0x00, 0x00, 0x01, 0x00];
        data.push(0x00);
        data.push(((frame_type & 0x7) << 3) as u8);
        data.push(0x00);
        data
    }

    #[test]
    fn test_sequence_parse() {
        let mut codec = Mpeg2VideoCodec::new();
        let mut st = PesState::default();
        let mut sink = ParserSink::default();

        // 720x576 @ 25fps, 4:3
        let seq = sequence_header(720, 576, 2, 3);
        codec.parse_sequence_start(&seq[4..], &mut st, &mut sink);

        let v = sink.video_info.unwrap();
        assert_eq!(v.width, 720);
        assert_eq!(v.height, 576);
        assert_eq!(v.fps_rate, 25);
        assert_eq!(v.fps_scale, 1);
        assert_eq!(st.duration, 3600);
    }

    #[test]
    fn test_picture_split_and_extrapolation() {
        let mut codec = Mpeg2VideoCodec::new();
        let mut st = PesState::default();
        st.times = PtsState {
            cur_pts: 10800,
            cur_dts: 7200,
        };
        let mut sink = ParserSink::default();

        let mut payload = sequence_header(720, 576, 2, 3);
        payload.extend_from_slice(&picture_header(1)); // I
        payload.extend_from_slice(&[0xAB; 16]);
        payload.extend_from_slice(&picture_header(3)); // B
        payload.extend_from_slice(&[0xCD; 16]);

        assert!(codec
            .parse_payload(&payload, &mut st, &mut sink)
            .is_none());

        assert_eq!(sink.packets.len(), 2);
        assert_eq!(sink.packets[0].frame_type, FrameType::I);
        assert_eq!(sink.packets[0].dts, 7200);
        assert_eq!(sink.packets[0].pts, 10800);

        // second picture: B frame with extrapolated DTS = PTS
        assert_eq!(sink.packets[1].frame_type, FrameType::B);
        assert_eq!(sink.packets[1].dts, 7200 + 3600);
        assert_eq!(sink.packets[1].pts, sink.packets[1].dts);
    }
}
