//! H.264/AVC parser: NAL unit iteration, slice-header frame typing and
//! SPS decoding for picture dimensions, aspect ratio and frame rate.

use super::parser::{find_start_code, ParserSink, PesParser, PesPayloadCodec, PesState, VideoInfo};
use super::FrameType;
use crate::utils::BitReader;
use crate::Result;

// H.264 profiles
const PROFILE_BASELINE: u32 = 66;
const PROFILE_MAIN: u32 = 77;
const PROFILE_EXTENDED: u32 = 88;
const PROFILE_HP: u32 = 100;
const PROFILE_HI10P: u32 = 110;
const PROFILE_HI422: u32 = 122;
const PROFILE_HI444: u32 = 244;
const PROFILE_CAVLC444: u32 = 44;

// NAL unit types
const NAL_SLH: u8 = 0x01;
const NAL_IDR: u8 = 0x05;
const NAL_SPS: u8 = 0x07;
const NAL_PPS: u8 = 0x08;
const NAL_FILLER: u8 = 0x0C;

const START_CODE: u32 = 0x0000_0001;

/// Pixel aspect ratios by aspect_ratio_idc, shared with the H.265 parser.
pub(crate) static ASPECT_RATIOS: [(i32, i32); 17] = [
    (0, 1),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// Copy a NAL unit, removing `00 00 03` emulation-prevention bytes.
pub(crate) fn nal_unescape(src: &[u8]) -> Vec<u8> {
    let mut dst = Vec::with_capacity(src.len());
    let mut s = 0;

    while s < src.len() {
        if s >= 2 && s < src.len() - 1 && src[s - 2] == 0 && src[s - 1] == 0 && src[s] == 3 {
            s += 1; // skip 03
            if s >= src.len() {
                break;
            }
        }
        dst.push(src[s]);
        s += 1;
    }

    dst
}

/// Extract the unescaped NAL payload starting at `offset`, bounded by the
/// next start code.
pub(crate) fn extract_nal(packet: &[u8], offset: usize) -> Option<Vec<u8>> {
    let end = find_start_code(packet, offset, START_CODE).unwrap_or(packet.len());
    if end <= offset {
        return None;
    }

    Some(nal_unescape(&packet[offset..end]))
}

/// Result of an SPS parse.
pub(crate) struct SpsInfo {
    pub width: u32,
    pub height: u32,
    pub par_num: i32,
    pub par_den: i32,
    /// Frame duration in 90 kHz ticks, 0 if the SPS carries no timing
    pub duration: u32,
    pub fps_rate: u32,
    pub fps_scale: u32,
}

fn skip_scaling_list(bs: &mut BitReader, size: usize) -> Result<()> {
    let mut last: i32 = 8;
    let mut next: i32 = 8;

    for _ in 0..size {
        if next != 0 {
            next = (last + bs.read_signed_golomb()? + 256) & 0xFF;
        }
        if next != 0 {
            last = next;
        }
    }

    Ok(())
}

fn parse_sps(data: &[u8]) -> Result<SpsInfo> {
    let mut bs = BitReader::new(data);

    let profile_idc = bs.read_bits(8)?;

    if !matches!(
        profile_idc,
        PROFILE_BASELINE
            | PROFILE_MAIN
            | PROFILE_EXTENDED
            | PROFILE_HP
            | PROFILE_HI10P
            | PROFILE_HI422
            | PROFILE_HI444
            | PROFILE_CAVLC444
    ) {
        return Err(crate::ServerError::Parser(format!(
            "invalid profile idc: {}",
            profile_idc
        )));
    }

    bs.skip_bits(8)?; // constraint flags + reserved
    bs.skip_bits(8)?; // level idc
    bs.read_golomb()?; // seq_parameter_set_id

    let high_profile = matches!(
        profile_idc,
        PROFILE_HP | PROFILE_HI10P | PROFILE_HI422 | PROFILE_HI444 | PROFILE_CAVLC444
    );

    if high_profile {
        let chroma_format_idc = bs.read_golomb()?;
        if chroma_format_idc == 3 {
            bs.skip_bits(1)?; // separate_colour_plane_flag
        }

        bs.read_golomb()?; // bit_depth_luma_minus8
        bs.read_golomb()?; // bit_depth_chroma_minus8
        bs.skip_bits(1)?; // transform_bypass

        if bs.read_bit()? {
            // seq_scaling_matrix_present
            for i in 0..8 {
                if bs.read_bit()? {
                    skip_scaling_list(&mut bs, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    bs.read_golomb()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = bs.read_golomb()?;

    if pic_order_cnt_type == 0 {
        bs.read_golomb()?; // log2_max_poc_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        bs.skip_bits(1)?; // delta_pic_order_always_zero
        bs.read_signed_golomb()?; // offset_for_non_ref_pic
        bs.read_signed_golomb()?; // offset_for_top_to_bottom_field
        let cycles = bs.read_golomb()?;
        for _ in 0..cycles {
            bs.read_signed_golomb()?; // offset_for_ref_frame
        }
    } else if pic_order_cnt_type != 2 {
        return Err(crate::ServerError::Parser(format!(
            "pic_order_cnt_type = {}",
            pic_order_cnt_type
        )));
    }

    bs.read_golomb()?; // max_num_ref_frames
    bs.skip_bits(1)?; // gaps_in_frame_num_allowed

    let mut width = (bs.read_golomb()? + 1) * 16;
    let frame_height_in_map_units = bs.read_golomb()? + 1;
    let frame_mbs_only = bs.read_bits(1)?;
    let mut height = frame_height_in_map_units * 16 * (2 - frame_mbs_only);

    if frame_mbs_only == 0 {
        bs.skip_bits(1)?; // mb_adaptive_frame_field_flag
    }

    bs.skip_bits(1)?; // direct_8x8_inference_flag

    if bs.read_bit()? {
        // frame_cropping_flag
        let crop_left = bs.read_golomb()?;
        let crop_right = bs.read_golomb()?;
        let crop_top = bs.read_golomb()?;
        let crop_bottom = bs.read_golomb()?;

        width = width.saturating_sub(2 * (crop_left + crop_right));
        let vertical = if frame_mbs_only == 1 { 2 } else { 4 };
        height = height.saturating_sub(vertical * (crop_top + crop_bottom));
    }

    let mut info = SpsInfo {
        width,
        height,
        par_num: 0,
        par_den: 1,
        duration: 0,
        fps_rate: 0,
        fps_scale: 0,
    };

    // VUI parameters
    if bs.read_bit()? {
        if bs.read_bit()? {
            // aspect_ratio_info_present
            let aspect_ratio_idc = bs.read_bits(8)? as usize;
            if aspect_ratio_idc == 255 {
                info.par_num = bs.read_bits(16)? as i32;
                info.par_den = bs.read_bits(16)? as i32;
            } else if aspect_ratio_idc < ASPECT_RATIOS.len() {
                info.par_num = ASPECT_RATIOS[aspect_ratio_idc].0;
                info.par_den = ASPECT_RATIOS[aspect_ratio_idc].1;
            }
        }

        if bs.read_bit()? {
            bs.skip_bits(1)?; // overscan_appropriate_flag
        }

        if bs.read_bit()? {
            // video signal type
            bs.skip_bits(4)?; // video_format + full_range
            if bs.read_bit()? {
                bs.skip_bits(24)?; // colour description
            }
        }

        if bs.read_bit()? {
            // chroma_loc_info
            bs.read_golomb()?;
            bs.read_golomb()?;
        }

        if bs.read_bit()? {
            // timing info
            let mut num_units_in_tick = bs.read_bits(32)?;
            let time_scale = bs.read_bits(32)?;

            if bs.read_bit()? && time_scale > 0 {
                // fixed frame rate
                num_units_in_tick *= 2;
                info.duration =
                    (90_000u64 * num_units_in_tick as u64 / time_scale as u64) as u32;
                info.fps_rate = time_scale;
                info.fps_scale = num_units_in_tick;
            }
        }
    }

    Ok(info)
}

fn slice_frame_type(data: &[u8]) -> FrameType {
    let mut bs = BitReader::new(data);
    let slice_type = (|| -> Result<u32> {
        bs.read_golomb()?; // first_mb_in_slice
        bs.read_golomb()
    })()
    .unwrap_or(u32::MAX);

    let slice_type = if slice_type > 4 && slice_type != u32::MAX {
        slice_type - 5
    } else {
        slice_type
    };

    match slice_type {
        0 => FrameType::P,
        1 => FrameType::B,
        2 => FrameType::I,
        _ => FrameType::Unknown,
    }
}

pub struct H264Codec;

impl PesPayloadCodec for H264Codec {
    fn parse_payload(
        &mut self,
        data: &[u8],
        st: &mut PesState,
        sink: &mut ParserSink,
    ) -> Option<usize> {
        let mut length = data.len();
        let mut sps_start = None;
        let mut pps_start = None;

        if length < 4 {
            return Some(length);
        }

        // iterate through all NAL units
        let mut o = 0;
        while let Some(start) = find_start_code(&data[..length], o, START_CODE) {
            o = start + 4;
            if o >= length {
                break;
            }

            let nal_type = data[o] & 0x1F;

            match nal_type {
                NAL_SLH | NAL_IDR if length - o > 1 => {
                    if let Some(nal) = extract_nal(&data[..length], o + 1) {
                        st.frame_type = slice_frame_type(&nal);
                    }
                }
                NAL_PPS if length - o > 1 => {
                    pps_start = Some(o + 1);
                }
                NAL_SPS if length - o > 1 => {
                    sps_start = Some(o + 1);
                }
                NAL_FILLER => {
                    // remove filler data
                    length = start;
                }
                _ => {}
            }
        }

        // register PPS data (decoder specific data)
        if let Some(pps) = pps_start.and_then(|p| extract_nal(&data[..length], p)) {
            sink.pps = Some(pps);
        }

        let sps = match sps_start.and_then(|p| extract_nal(&data[..length], p)) {
            Some(sps) => sps,
            None => return Some(length),
        };

        // register SPS data (decoder specific data)
        sink.sps = Some(sps.clone());

        let parsed = match parse_sps(&sps) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::error!("H264: {}", e);
                return Some(length);
            }
        };

        let par = parsed.par_num.max(1) as f64 / parsed.par_den.max(1) as f64;
        let dar = (par * parsed.width as f64) / parsed.height.max(1) as f64;

        if parsed.duration != 0 {
            st.duration = parsed.duration;
        }

        sink.video_info = Some(VideoInfo {
            fps_scale: parsed.fps_scale,
            fps_rate: parsed.fps_rate,
            width: parsed.width,
            height: parsed.height,
            aspect: dar,
            par_num: parsed.par_num.max(1),
            par_den: parsed.par_den.max(1),
        });

        Some(length)
    }
}

/// H.264 parser over whole PES packets.
pub struct H264Parser;

impl H264Parser {
    pub fn new() -> PesParser<H264Codec> {
        PesParser::new(H264Codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nal_unescape() {
        let src = [0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x03];
        assert_eq!(nal_unescape(&src), vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x03]);

        let plain = [0x12, 0x34, 0x56];
        assert_eq!(nal_unescape(&plain), plain.to_vec());
    }

    /// Bit writer for synthesizing parameter sets in tests.
    struct BitWriter {
        bytes: Vec<u8>,
        used: u8,
    }

    impl BitWriter {
        fn new() -> Self {
            Self {
                bytes: Vec::new(),
                used: 0,
            }
        }

        fn put_bits(&mut self, value: u32, count: u8) {
            for i in (0..count).rev() {
                let bit = (value >> i) & 1;
                if self.used == 0 {
                    self.bytes.push(0);
                }
                let last = self.bytes.last_mut().unwrap();
                *last |= (bit as u8) << (7 - self.used);
                self.used = (self.used + 1) % 8;
            }
        }

        fn put_golomb(&mut self, value: u32) {
            let code = value + 1;
            let bits = 32 - code.leading_zeros() as u8;
            self.put_bits(0, bits - 1);
            self.put_bits(code, bits);
        }

        fn finish(mut self) -> Vec<u8> {
            if self.used != 0 {
                self.put_bits(0, 8 - self.used);
            }
            self.bytes
        }
    }

    /// Baseline-profile SPS for 1280x720 with 16:9 square pixels and
    /// 50 fps VUI timing.
    fn synthetic_sps() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_bits(66, 8); // profile_idc baseline
        w.put_bits(0, 8); // constraint flags
        w.put_bits(31, 8); // level_idc
        w.put_golomb(0); // sps id
        w.put_golomb(0); // log2_max_frame_num_minus4
        w.put_golomb(2); // pic_order_cnt_type
        w.put_golomb(3); // max_num_ref_frames
        w.put_bits(0, 1); // gaps_in_frame_num_allowed
        w.put_golomb(79); // pic_width_in_mbs_minus1 (80*16=1280)
        w.put_golomb(44); // pic_height_in_map_units_minus1 (45*16=720)
        w.put_bits(1, 1); // frame_mbs_only
        w.put_bits(0, 1); // direct_8x8_inference
        w.put_bits(0, 1); // frame_cropping
        w.put_bits(1, 1); // vui_parameters_present
        w.put_bits(1, 1); // aspect_ratio_info_present
        w.put_bits(1, 8); // aspect_ratio_idc 1 (square)
        w.put_bits(0, 1); // overscan_info_present
        w.put_bits(0, 1); // video_signal_type_present
        w.put_bits(0, 1); // chroma_loc_info_present
        w.put_bits(1, 1); // timing_info_present
        w.put_bits(900, 32); // num_units_in_tick
        w.put_bits(90000, 32); // time_scale
        w.put_bits(1, 1); // fixed_frame_rate
        w.finish()
    }

    #[test]
    fn test_parse_sps_dimensions() {
        let sps = synthetic_sps();
        let info = parse_sps(&sps).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.par_num, 1);
        assert_eq!(info.par_den, 1);
        // 90000 / (900 * 2) = 50 fps
        assert_eq!(info.fps_rate, 90000);
        assert_eq!(info.fps_scale, 1800);
        assert_eq!(info.duration, 1800);
    }

    #[test]
    fn test_parse_sps_rejects_bad_profile() {
        let mut sps = synthetic_sps();
        sps[0] = 0x03;
        assert!(parse_sps(&sps).is_err());
    }

    /// Insert emulation-prevention bytes, the inverse of `nal_unescape`.
    fn escape(nal: &[u8]) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::with_capacity(nal.len());
        for &b in nal {
            let n = out.len();
            if n >= 2 && out[n - 2] == 0 && out[n - 1] == 0 && b <= 3 {
                out.push(3);
            }
            out.push(b);
        }
        out
    }

    #[test]
    fn test_payload_carries_frame_type_and_sps() {
        let sps = synthetic_sps();

        let mut payload = vec![0x00, 0x00, 0x00, 0x01, 0x67];
        payload.extend_from_slice(&escape(&sps));

        // IDR slice: first_mb 0, slice_type 7 (I)
        let mut slice = BitWriter::new();
        slice.put_golomb(0);
        slice.put_golomb(7);
        payload.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x65]);
        payload.extend_from_slice(&slice.finish());

        let mut codec = H264Codec;
        let mut st = PesState::default();
        let mut sink = ParserSink::default();

        let len = codec.parse_payload(&payload, &mut st, &mut sink).unwrap();
        assert_eq!(len, payload.len());
        assert_eq!(st.frame_type, FrameType::I);

        let v = sink.video_info.unwrap();
        assert_eq!((v.width, v.height), (1280, 720));
        assert!((v.aspect - 1.7777).abs() < 0.001);
        assert_eq!(sink.sps.unwrap(), sps);
    }
}
