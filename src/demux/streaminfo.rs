//! Metadata for one elementary stream: identity (PID + codec), codec
//! parameters discovered by the parsers, and the serialized form used by
//! the channel cache.

use super::{StreamContent, StreamKind};
use crate::net::MsgPacket;
use crate::Result;

/// Sentinel separating StreamInfo items in serialized bundles.
const ITEM_SYNC: u32 = 0xFEFEFEFE;

/// Decoder-specific data (SPS/PPS/VPS) is capped at this size.
const MAX_DECODER_DATA: usize = 128;

/// Description of one elementary stream.
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub pid: u16,
    pub kind: StreamKind,
    pub content: StreamContent,

    /// ISO 639 language code(s); empty if undefined
    pub language: String,
    pub audio_type: u8,

    pub fps_scale: u32,
    pub fps_rate: u32,
    pub height: u32,
    pub width: u32,
    /// Display aspect ratio
    pub aspect: f64,

    pub channels: u32,
    pub sample_rate: u32,
    pub bit_rate: u32,
    pub bits_per_sample: u32,
    pub block_align: u32,

    pub subtitling_type: u8,
    pub composition_page_id: u16,
    pub ancillary_page_id: u16,

    /// True once enough headers have been seen to describe the stream
    pub parsed: bool,

    sps: Vec<u8>,
    pps: Vec<u8>,
    vps: Vec<u8>,
}

impl StreamInfo {
    pub fn new(pid: u16, kind: StreamKind) -> Self {
        Self {
            pid,
            kind,
            content: kind.content(),
            ..Default::default()
        }
    }

    pub fn with_language(pid: u16, kind: StreamKind, language: &str) -> Self {
        let mut info = Self::new(pid, kind);
        info.language = language.to_string();
        info
    }

    pub fn set_subtitling(&mut self, subtitling_type: u8, composition: u16, ancillary: u16) {
        self.subtitling_type = subtitling_type;
        self.composition_page_id = composition;
        self.ancillary_page_id = ancillary;
        self.parsed = true;
    }

    pub fn set_sps(&mut self, data: &[u8]) {
        self.sps = data[..data.len().min(MAX_DECODER_DATA)].to_vec();
    }

    pub fn set_pps(&mut self, data: &[u8]) {
        self.pps = data[..data.len().min(MAX_DECODER_DATA)].to_vec();
    }

    pub fn set_vps(&mut self, data: &[u8]) {
        self.vps = data[..data.len().min(MAX_DECODER_DATA)].to_vec();
    }

    pub fn sps(&self) -> &[u8] {
        &self.sps
    }

    pub fn pps(&self) -> &[u8] {
        &self.pps
    }

    pub fn vps(&self) -> &[u8] {
        &self.vps
    }

    /// Identity relation: same stream, details may differ. A re-scan can
    /// refresh parameters without counting as a different stream; AC-3 and
    /// E-AC-3 are considered compatible.
    pub fn is_meta_of(&self, other: &StreamInfo) -> bool {
        if self.content != other.content {
            return false;
        }

        if self.kind != other.kind
            && !(self.kind == StreamKind::Ac3 && other.kind == StreamKind::Eac3)
            && !(self.kind == StreamKind::Eac3 && other.kind == StreamKind::Ac3)
        {
            return false;
        }

        self.pid == other.pid
    }

    /// Language sent on the wire ("XXX" when undefined).
    fn wire_language(&self) -> &str {
        if self.language.is_empty() {
            "XXX"
        } else {
            &self.language
        }
    }

    /// Serialize for the channel cache.
    pub fn write_to(&self, p: &mut MsgPacket) {
        p.put_u32(ITEM_SYNC);

        p.put_u8(self.kind.to_u8());
        p.put_u8(self.content.to_u8());
        p.put_u16(self.pid);
        p.put_u8(self.parsed as u8);

        match self.content {
            StreamContent::Audio => {
                p.put_string(self.wire_language());
                p.put_u8(self.audio_type);
                p.put_u8(self.channels as u8);
                p.put_u32(self.sample_rate);
                p.put_u32(self.bit_rate);
                p.put_u8(self.bits_per_sample as u8);
                p.put_u32(self.block_align);
            }
            StreamContent::Video => {
                p.put_u32(self.fps_scale);
                p.put_u32(self.fps_rate);
                p.put_u16(self.height as u16);
                p.put_u16(self.width as u16);
                p.put_u64((self.aspect * 1_000_000_000.0) as u64);
                p.put_u8(self.sps.len() as u8);
                p.put_blob(&self.sps);
                p.put_u8(self.pps.len() as u8);
                p.put_blob(&self.pps);
                p.put_u8(self.vps.len() as u8);
                p.put_blob(&self.vps);
            }
            StreamContent::Subtitle => {
                p.put_string(self.wire_language());
                p.put_u8(self.subtitling_type);
                p.put_u16(self.composition_page_id);
                p.put_u16(self.ancillary_page_id);
            }
            StreamContent::Teletext | StreamContent::None => {}
        }
    }

    /// Deserialize from the channel cache.
    pub fn read_from(p: &mut MsgPacket) -> Result<StreamInfo> {
        let check = p.get_u32()?;
        if check != ITEM_SYNC {
            return Err(crate::ServerError::InvalidData(
                "stream info sync marker missing".into(),
            ));
        }

        let mut info = StreamInfo {
            kind: StreamKind::from_u8(p.get_u8()?),
            content: StreamContent::from_u8(p.get_u8()?),
            pid: p.get_u16()?,
            parsed: p.get_u8()? != 0,
            ..Default::default()
        };

        match info.content {
            StreamContent::Audio => {
                info.language = p.get_string()?;
                info.audio_type = p.get_u8()?;
                info.channels = p.get_u8()? as u32;
                info.sample_rate = p.get_u32()?;
                info.bit_rate = p.get_u32()?;
                info.bits_per_sample = p.get_u8()? as u32;
                info.block_align = p.get_u32()?;
            }
            StreamContent::Video => {
                info.fps_scale = p.get_u32()?;
                info.fps_rate = p.get_u32()?;
                info.height = p.get_u16()? as u32;
                info.width = p.get_u16()? as u32;
                info.aspect = p.get_u64()? as f64 / 1_000_000_000.0;
                let sps_len = p.get_u8()? as usize;
                info.sps = p.get_blob(sps_len)?;
                let pps_len = p.get_u8()? as usize;
                info.pps = p.get_blob(pps_len)?;
                let vps_len = p.get_u8()? as usize;
                info.vps = p.get_blob(vps_len)?;
            }
            StreamContent::Subtitle => {
                info.language = p.get_string()?;
                info.subtitling_type = p.get_u8()?;
                info.composition_page_id = p.get_u16()?;
                info.ancillary_page_id = p.get_u16()?;
            }
            StreamContent::Teletext | StreamContent::None => {}
        }

        if info.language == "XXX" {
            info.language.clear();
        }

        Ok(info)
    }

    /// One-line stream summary for the log.
    pub fn log_info(&self) {
        let detail = match self.content {
            StreamContent::Audio => format!(
                "{} Hz, {} channels, Lang: {}",
                self.sample_rate,
                self.channels,
                self.wire_language()
            ),
            StreamContent::Video => format!(
                "{}x{} DAR: {:.2} FPS: {:.3} SPS/PPS: {}/{} bytes",
                self.width,
                self.height,
                self.aspect,
                self.fps_rate as f64 / self.fps_scale.max(1) as f64,
                self.sps.len(),
                self.pps.len()
            ),
            StreamContent::Subtitle => format!("Lang: {}", self.wire_language()),
            StreamContent::Teletext => "TXT".to_string(),
            StreamContent::None => "None".to_string(),
        };

        log::info!(
            "Stream: {} PID: {} {} (parsed: {})",
            self.kind.type_name(),
            self.pid,
            detail,
            if self.parsed { "yes" } else { "no" }
        );
    }
}

impl PartialEq for StreamInfo {
    /// Full comparison of all semantically relevant fields; used to decide
    /// whether a stream change must be announced.
    fn eq(&self, other: &Self) -> bool {
        if !self.is_meta_of(other) {
            return false;
        }

        match self.content {
            StreamContent::None => false,
            StreamContent::Audio => {
                self.language == other.language
                    && self.audio_type == other.audio_type
                    && self.channels == other.channels
                    && self.sample_rate == other.sample_rate
            }
            StreamContent::Video => {
                self.width == other.width
                    && self.height == other.height
                    && self.aspect == other.aspect
                    && self.fps_scale == other.fps_scale
                    && self.fps_rate == other.fps_rate
            }
            StreamContent::Subtitle => {
                self.language == other.language
                    && self.subtitling_type == other.subtitling_type
                    && self.composition_page_id == other.composition_page_id
                    && self.ancillary_page_id == other.ancillary_page_id
            }
            StreamContent::Teletext => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{MsgPacket, OP_LOGIN};

    #[test]
    fn test_meta_of() {
        let a = StreamInfo::with_language(0x200, StreamKind::Ac3, "deu");
        let mut b = StreamInfo::with_language(0x200, StreamKind::Eac3, "eng");
        assert!(a.is_meta_of(&b));
        assert!(b.is_meta_of(&a));

        b.pid = 0x201;
        assert!(!a.is_meta_of(&b));

        let c = StreamInfo::new(0x200, StreamKind::Mpeg2Audio);
        assert!(!a.is_meta_of(&c));
    }

    #[test]
    fn test_equality_audio() {
        let a = StreamInfo::with_language(0x101, StreamKind::Mpeg2Audio, "deu");
        let mut b = a.clone();
        assert_eq!(a, b);

        b.sample_rate = 48000;
        assert_ne!(a, b);
    }

    #[test]
    fn test_equality_none_content() {
        let a = StreamInfo::new(0x101, StreamKind::None);
        let b = StreamInfo::new(0x101, StreamKind::None);
        // streams without content never compare equal
        assert_ne!(a, b);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut video = StreamInfo::new(0x100, StreamKind::H264);
        video.width = 1280;
        video.height = 720;
        video.aspect = 1.7777778;
        video.fps_scale = 1;
        video.fps_rate = 50;
        video.parsed = true;
        video.set_sps(&[0x67, 0x64, 0x00, 0x1F]);
        video.set_pps(&[0x68, 0xEB]);

        let mut p = MsgPacket::response(OP_LOGIN, 0);
        video.write_to(&mut p);
        p.rewind();

        let back = StreamInfo::read_from(&mut p).unwrap();
        assert_eq!(video, back);
        assert_eq!(back.sps(), &[0x67, 0x64, 0x00, 0x1F]);
        assert_eq!(back.pps(), &[0x68, 0xEB]);
        assert!(back.parsed);
    }

    #[test]
    fn test_serialization_bad_sync() {
        let mut p = MsgPacket::response(OP_LOGIN, 0);
        p.put_u32(0x12345678);
        p.rewind();
        assert!(StreamInfo::read_from(&mut p).is_err());
    }
}
