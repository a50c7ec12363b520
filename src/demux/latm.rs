//! AAC with LATM transport syntax (AudioMuxElement framing inside PES).
//! The StreamMuxConfig is decoded once and cached; later frames reuse it.

use super::audio::AAC_SAMPLE_RATES;
use super::parser::{pts_add, AudioInfo, Parser, ParserSink, PtsState, RawPacket, NOPTS};
use super::FrameType;
use crate::utils::BitReader;
use crate::Result;
use bytes::{Bytes, BytesMut};

pub struct LatmParser {
    buffer: BytesMut,
    parse_ptr: usize,
    first_pusi_seen: bool,
    times: PtsState,

    configured: bool,
    frame_duration: u32,
    sample_rate: u32,
    channel_config: u32,
}

impl LatmParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            parse_ptr: 0,
            first_pusi_seen: false,
            times: PtsState::default(),
            configured: false,
            frame_duration: 0,
            sample_rate: 0,
            channel_config: 0,
        }
    }

    fn latm_value(bs: &mut BitReader) -> Result<u32> {
        let bytes = bs.read_bits(2)?;
        bs.read_bits((bytes * 8) as u8)
    }

    fn read_audio_specific_config(&mut self, bs: &mut BitReader, sink: &mut ParserSink) -> Result<()> {
        bs.skip_bits(5)?; // audio object type

        let sample_rate_index = bs.read_bits(4)? as usize;
        if sample_rate_index == 0xF || sample_rate_index >= AAC_SAMPLE_RATES.len() {
            return Ok(());
        }

        self.sample_rate = AAC_SAMPLE_RATES[sample_rate_index];
        self.frame_duration = 1024 * 90000 / self.sample_rate;
        self.channel_config = bs.read_bits(4)?;

        bs.skip_bits(1)?; // frame length flag
        if bs.read_bit()? {
            // depends on core coder
            bs.skip_bits(14)?;
        }

        if bs.read_bit()? {
            // extension flag
            bs.skip_bits(1)?;
        }

        sink.audio_info = Some(AudioInfo {
            channels: self.channel_config,
            sample_rate: self.sample_rate,
            ..Default::default()
        });

        Ok(())
    }

    fn read_stream_mux_config(&mut self, bs: &mut BitReader, sink: &mut ParserSink) -> Result<()> {
        let audio_mux_version = bs.read_bits(1)?;
        let mut audio_mux_version_a = 0;
        if audio_mux_version == 1 {
            audio_mux_version_a = bs.read_bits(1)?;
        }

        if audio_mux_version_a != 0 {
            log::error!("unsupported AudioMuxVersion");
            return Ok(());
        }

        if audio_mux_version == 1 {
            Self::latm_value(bs)?; // taraFullness
        }

        bs.skip_bits(1)?; // allStreamSameTimeFraming
        bs.skip_bits(6)?; // numSubFrames
        bs.skip_bits(4)?; // numPrograms

        // one program, one layer in DVB
        bs.skip_bits(3)?; // numLayer

        if audio_mux_version != 0 {
            return Ok(());
        }
        self.read_audio_specific_config(bs, sink)?;

        let frame_length_type = bs.read_bits(3)?;
        match frame_length_type {
            0 => {
                bs.read_bits(8)?;
            }
            1 => {
                bs.read_bits(9)?;
            }
            3 | 4 | 5 => {
                bs.read_bits(6)?; // celp_table_index
            }
            6 | 7 => {
                bs.read_bits(1)?; // hvxc_table_index
            }
            _ => {}
        }

        if bs.read_bit()? {
            // other data present
            loop {
                let esc = bs.read_bits(1)?;
                bs.skip_bits(8)?;
                if esc == 0 {
                    break;
                }
            }
        }

        if bs.read_bit()? {
            // crc present
            bs.skip_bits(8)?; // config_crc
        }

        self.configured = true;
        Ok(())
    }

    fn parse_audio_mux_element(&mut self, data: &[u8], sink: &mut ParserSink) {
        let mut bs = BitReader::new(data);

        let parsed = (|| -> Result<()> {
            bs.skip_bits(24)?; // syncword + mux length

            if !bs.read_bit()? {
                // useSameStreamMux == 0
                self.read_stream_mux_config(&mut bs, sink)?;
            }
            Ok(())
        })();

        if parsed.is_err() || !self.configured {
            return;
        }

        if self.times.cur_dts == NOPTS {
            return;
        }

        sink.packets.push(RawPacket {
            data: Bytes::copy_from_slice(data),
            dts: self.times.cur_dts,
            pts: self.times.cur_pts,
            duration: self.frame_duration,
            frame_type: FrameType::Unknown,
        });

        self.times.cur_dts = pts_add(self.times.cur_dts, self.frame_duration as i64);
    }
}

impl Parser for LatmParser {
    fn parse(&mut self, data: &[u8], pusi: bool, sink: &mut ParserSink) {
        if pusi {
            self.first_pusi_seen = true;
            self.buffer.clear();
            self.parse_ptr = 0;
        }

        if !self.first_pusi_seen {
            return;
        }

        self.buffer.extend_from_slice(data);

        if self.parse_ptr == 0 {
            if self.buffer.len() < 9 {
                return;
            }

            let hlen = self.times.parse_pes_header(&self.buffer);
            if hlen == 0 {
                return;
            }
            self.parse_ptr = hlen;
        }

        let mut p = self.parse_ptr;
        while self.buffer.len() > p + 3 {
            if self.buffer[p] == 0x56 && self.buffer[p + 1] & 0xE0 == 0xE0 {
                let muxlen =
                    ((((self.buffer[p + 1] & 0x1F) as usize) << 8) | self.buffer[p + 2] as usize)
                        + 3;

                if self.buffer.len() - p < muxlen {
                    break;
                }

                let element = self.buffer[p..p + muxlen].to_vec();
                self.parse_audio_mux_element(&element, sink);
                p += muxlen;
            } else {
                p += 1;
            }
        }
        self.parse_ptr = p;
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.parse_ptr = 0;
        self.first_pusi_seen = false;
        self.times = PtsState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latm_sync_detection() {
        let mut parser = LatmParser::new();
        let mut sink = ParserSink::default();

        // no unit start seen yet: data is ignored
        parser.parse(&[0x56, 0xE0, 0x10], false, &mut sink);
        assert!(sink.packets.is_empty());
        assert!(parser.buffer.is_empty());
    }

    #[test]
    fn test_unconfigured_frames_not_emitted() {
        let mut parser = LatmParser::new();
        let mut sink = ParserSink::default();

        // PES header without timestamps, then a mux element that claims
        // useSameStreamMux=1 while no config was ever seen
        let mut data = vec![0x00, 0x00, 0x01, 0xC0, 0x00, 0x00, 0x80, 0x00, 0x00];
        data.extend_from_slice(&[0x56, 0xE0, 0x02, 0x80, 0x00, 0x00]);

        parser.parse(&data, true, &mut sink);
        assert!(sink.packets.is_empty());
    }
}
