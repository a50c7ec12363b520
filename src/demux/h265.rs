//! H.265/HEVC parser: VPS/SPS/PPS capture, key-frame detection via the
//! NAL type range and SPS decoding including conformance-window cropping.

use super::h264::{extract_nal, ASPECT_RATIOS};
use super::parser::{find_start_code, ParserSink, PesParser, PesPayloadCodec, PesState, VideoInfo};
use super::FrameType;
use crate::utils::BitReader;
use crate::Result;

// nal_unit_type values from H.265/HEVC (2014) Table 7-1
const BLA_W_LP: u8 = 16;
const CRA_NUT: u8 = 21;
const VPS_NUT: u8 = 32;
const SPS_NUT: u8 = 33;
const PPS_NUT: u8 = 34;

const START_CODE: u32 = 0x0000_0001;

struct SpsInfo {
    width: u32,
    height: u32,
    par_num: i32,
    par_den: i32,
}

fn skip_scaling_list(bs: &mut BitReader) -> Result<()> {
    for size_id in 0..4 {
        let step = if size_id == 3 { 3 } else { 1 };
        let mut matrix_id = 0;
        while matrix_id < 6 {
            if !bs.read_bit()? {
                // scaling_list_pred_matrix_id_delta
                bs.read_golomb()?;
            } else {
                let coef_num = std::cmp::min(64, 1 << (4 + (size_id << 1)));
                if size_id > 1 {
                    // scaling_list_dc_coef_minus8
                    bs.read_signed_golomb()?;
                }
                for _ in 0..coef_num {
                    bs.read_signed_golomb()?; // scaling_list_delta_coef
                }
            }
            matrix_id += step;
        }
    }
    Ok(())
}

fn skip_short_term_ref_pic_sets(bs: &mut BitReader) -> Result<()> {
    let num_sets = bs.read_golomb()?;
    let mut inter_pred = false;
    let mut previous_num_delta_pocs = 0u32;

    for idx in 0..num_sets {
        if idx != 0 {
            inter_pred = bs.read_bit()?;
        }

        if inter_pred {
            bs.skip_bits(1)?; // delta_rps_sign
            bs.read_golomb()?; // abs_delta_rps_minus1

            for _ in 0..=previous_num_delta_pocs {
                if bs.read_bit()? {
                    // used_by_curr_pic_flag
                    bs.skip_bits(1)?; // use_delta_flag
                }
            }
        } else {
            let num_negative = bs.read_golomb()?;
            let num_positive = bs.read_golomb()?;
            previous_num_delta_pocs = num_negative + num_positive;

            for _ in 0..num_negative {
                bs.read_golomb()?; // delta_poc_s0_minus1
                bs.skip_bits(1)?; // used_by_curr_pic_s0_flag
            }
            for _ in 0..num_positive {
                bs.read_golomb()?; // delta_poc_s1_minus1
                bs.skip_bits(1)?; // used_by_curr_pic_s1_flag
            }
        }
    }

    Ok(())
}

fn parse_sps(data: &[u8]) -> Result<SpsInfo> {
    let mut bs = BitReader::new(data);

    bs.skip_bits(8 + 4)?; // NAL header, sps_video_parameter_set_id
    let max_sub_layers_minus1 = bs.read_bits(3)?;
    bs.skip_bits(1)?; // sps_temporal_id_nesting_flag

    // profile_tier_level(1, sps_max_sub_layers_minus1)
    bs.skip_bits(88)?;
    bs.skip_bits(8)?; // general_level_idc

    let mut to_skip = 0;
    for _ in 0..max_sub_layers_minus1 {
        if bs.read_bit()? {
            // sub_layer_profile_present_flag
            to_skip += 89;
        }
        if bs.read_bit()? {
            // sub_layer_level_present_flag
            to_skip += 8;
        }
    }
    bs.skip_bits(to_skip)?;

    if max_sub_layers_minus1 > 0 {
        bs.skip_bits(2 * (8 - max_sub_layers_minus1))?;
    }

    bs.read_golomb()?; // sps_seq_parameter_set_id
    let chroma_format_idc = bs.read_golomb()?;

    if chroma_format_idc == 3 {
        bs.skip_bits(1)?; // separate_colour_plane_flag
    }

    let mut width = bs.read_golomb()?;
    let mut height = bs.read_golomb()?;

    if bs.read_bit()? {
        // conformance_window_flag
        let left = bs.read_golomb()?;
        let right = bs.read_golomb()?;
        let top = bs.read_golomb()?;
        let bottom = bs.read_golomb()?;

        // H.265/HEVC (2014) Table 6-1
        let sub_width_c = if chroma_format_idc == 1 || chroma_format_idc == 2 {
            2
        } else {
            1
        };
        let sub_height_c = if chroma_format_idc == 1 { 2 } else { 1 };
        width = width.saturating_sub(sub_width_c * (left + right));
        height = height.saturating_sub(sub_height_c * (top + bottom));
    }

    bs.read_golomb()?; // bit_depth_luma_minus8
    bs.read_golomb()?; // bit_depth_chroma_minus8
    let log2_max_pic_order_cnt_lsb_minus4 = bs.read_golomb()?;

    let sub_layer_ordering_info = bs.read_bit()?;
    let start = if sub_layer_ordering_info {
        0
    } else {
        max_sub_layers_minus1
    };
    for _ in start..=max_sub_layers_minus1 {
        bs.read_golomb()?; // sps_max_dec_pic_buffering_minus1
        bs.read_golomb()?; // sps_max_num_reorder_pics
        bs.read_golomb()?; // sps_max_latency_increase_plus1
    }

    bs.read_golomb()?; // log2_min_luma_coding_block_size_minus3
    bs.read_golomb()?; // log2_diff_max_min_luma_coding_block_size
    bs.read_golomb()?; // log2_min_luma_transform_block_size_minus2
    bs.read_golomb()?; // log2_diff_max_min_luma_transform_block_size
    bs.read_golomb()?; // max_transform_hierarchy_depth_inter
    bs.read_golomb()?; // max_transform_hierarchy_depth_intra

    // scaling_list_enabled_flag / sps_scaling_list_data_present_flag
    if bs.read_bit()? && bs.read_bit()? {
        skip_scaling_list(&mut bs)?;
    }

    bs.skip_bits(2)?; // amp_enabled_flag, sample_adaptive_offset_enabled_flag

    if bs.read_bit()? {
        // pcm_enabled_flag
        bs.skip_bits(8)?; // pcm sample bit depths
        bs.read_golomb()?; // log2_min_pcm_luma_coding_block_size_minus3
        bs.read_golomb()?; // log2_diff_max_min_pcm_luma_coding_block_size
        bs.skip_bits(1)?; // pcm_loop_filter_disabled_flag
    }

    skip_short_term_ref_pic_sets(&mut bs)?;

    if bs.read_bit()? {
        // long_term_ref_pics_present_flag
        let count = bs.read_golomb()?;
        for _ in 0..count {
            let lsb_len = log2_max_pic_order_cnt_lsb_minus4 + 4;
            bs.skip_bits(lsb_len + 1)?;
        }
    }

    bs.skip_bits(2)?; // sps_temporal_mvp_enabled, strong_intra_smoothing_enabled

    let mut info = SpsInfo {
        width,
        height,
        par_num: 1,
        par_den: 1,
    };

    if bs.read_bit()? {
        // vui_parameters_present_flag
        if bs.read_bit()? {
            // aspect_ratio_info_present_flag
            let aspect_ratio_idc = bs.read_bits(8)? as usize;
            if aspect_ratio_idc == 255 {
                info.par_num = bs.read_bits(16)? as i32;
                info.par_den = bs.read_bits(16)? as i32;
            } else if aspect_ratio_idc < ASPECT_RATIOS.len() {
                info.par_num = ASPECT_RATIOS[aspect_ratio_idc].0;
                info.par_den = ASPECT_RATIOS[aspect_ratio_idc].1;
            } else {
                log::error!("unexpected aspect_ratio_idc value: {}", aspect_ratio_idc);
            }
        }
    }

    Ok(info)
}

pub struct H265Codec;

impl PesPayloadCodec for H265Codec {
    fn parse_payload(
        &mut self,
        data: &[u8],
        st: &mut PesState,
        sink: &mut ParserSink,
    ) -> Option<usize> {
        let length = data.len();
        let mut sps_start = None;

        st.frame_type = FrameType::Unknown;

        if length < 4 {
            return Some(length);
        }

        // iterate through all NAL units
        let mut o = 0;
        while let Some(start) = find_start_code(data, o, START_CODE) {
            o = start + 4;
            if o >= length {
                break;
            }

            let nal_type = (data[o] & 0x7E) >> 1;

            // key frame ?
            if (BLA_W_LP..=CRA_NUT).contains(&nal_type) {
                st.frame_type = FrameType::I;
            }

            if nal_type == PPS_NUT && length - o > 1 {
                if let Some(pps) = extract_nal(data, o + 1) {
                    sink.pps = Some(pps);
                }
            } else if nal_type == VPS_NUT && length - o > 1 {
                if let Some(vps) = extract_nal(data, o + 1) {
                    sink.vps = Some(vps);
                }
            } else if nal_type == SPS_NUT && length - o > 1 {
                sps_start = Some(o + 1);
            }
        }

        let sps = match sps_start.and_then(|p| extract_nal(data, p)) {
            Some(sps) => sps,
            None => return Some(length),
        };

        // register SPS data (decoder specific data)
        sink.sps = Some(sps.clone());

        let parsed = match parse_sps(&sps) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::error!("H265: {}", e);
                return Some(length);
            }
        };

        let par = parsed.par_num.max(1) as f64 / parsed.par_den.max(1) as f64;
        let dar = (par * parsed.width as f64) / parsed.height.max(1) as f64;

        sink.video_info = Some(VideoInfo {
            fps_scale: 1,
            fps_rate: 50,
            width: parsed.width,
            height: parsed.height,
            aspect: dar,
            par_num: parsed.par_num,
            par_den: parsed.par_den,
        });

        Some(length)
    }
}

/// H.265 parser over whole PES packets.
pub struct H265Parser;

impl H265Parser {
    pub fn new() -> PesParser<H265Codec> {
        PesParser::new(H265Codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_nal_range() {
        // IDR_W_RADL is nal type 19, inside [16, 21]
        let mut payload = vec![0x00, 0x00, 0x00, 0x01];
        payload.push(19 << 1);
        payload.extend_from_slice(&[0x00; 8]);

        let mut codec = H265Codec;
        let mut st = PesState::default();
        let mut sink = ParserSink::default();

        codec.parse_payload(&payload, &mut st, &mut sink);
        assert_eq!(st.frame_type, FrameType::I);

        // a trailing picture (type 1) is not a key frame
        let mut payload = vec![0x00, 0x00, 0x00, 0x01];
        payload.push(1 << 1);
        payload.extend_from_slice(&[0x00; 8]);

        st.frame_type = FrameType::Unknown;
        codec.parse_payload(&payload, &mut st, &mut sink);
        assert_eq!(st.frame_type, FrameType::Unknown);
    }

    #[test]
    fn test_vps_capture() {
        let mut payload = vec![0x00, 0x00, 0x00, 0x01];
        payload.push(VPS_NUT << 1);
        payload.push(0x01);
        payload.extend_from_slice(&[0x44, 0x55, 0x66]);

        let mut codec = H265Codec;
        let mut st = PesState::default();
        let mut sink = ParserSink::default();

        codec.parse_payload(&payload, &mut st, &mut sink);
        // the second NAL header byte stays part of the extracted unit
        assert_eq!(sink.vps.unwrap(), vec![0x01, 0x44, 0x55, 0x66]);
    }
}
