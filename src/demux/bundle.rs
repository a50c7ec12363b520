//! Stream collections for one program: the plain metadata set
//! ([`StreamBundle`]) and the ordered set of running demuxers built from
//! it ([`DemuxerBundle`]).

use super::streaminfo::StreamInfo;
use super::{DemuxListener, Demuxer, StreamContent, StreamKind};
use crate::channels::Channel;
use crate::net::{MsgPacket, STREAM_CHANGE};
use crate::Result;
use std::collections::BTreeMap;

/// The set of elementary streams of one program, keyed by PID.
#[derive(Debug, Clone, Default)]
pub struct StreamBundle {
    streams: BTreeMap<u16, StreamInfo>,
    changed: bool,
}

impl StreamBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stream. PID 0 and typeless streams are rejected, and only one
    /// video stream is allowed per bundle.
    pub fn add_stream(&mut self, info: StreamInfo) {
        if info.pid == 0 || info.kind == StreamKind::None {
            return;
        }

        if info.content == StreamContent::Video {
            for s in self.streams.values() {
                if s.content == StreamContent::Video && s.pid != info.pid {
                    return;
                }
            }
        }

        let old = self.streams.get(&info.pid).cloned();
        let differs = match &old {
            Some(old) => *old != info,
            None => true,
        };
        self.streams.insert(info.pid, info);
        self.changed = differs;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn get(&self, pid: u16) -> Option<&StreamInfo> {
        self.streams.get(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.values()
    }

    /// True when the bundle is non-empty and every stream is parsed.
    pub fn is_parsed(&self) -> bool {
        !self.streams.is_empty() && self.streams.values().all(|s| s.parsed)
    }

    pub fn contains(&self, info: &StreamInfo) -> bool {
        match self.streams.get(&info.pid) {
            Some(s) => s == info,
            None => false,
        }
    }

    /// Identity relation on bundles: same PIDs with compatible types.
    pub fn is_meta_of(&self, other: &StreamBundle) -> bool {
        if self.streams.len() != other.streams.len() {
            return false;
        }

        self.streams.values().all(|s| {
            other
                .streams
                .get(&s.pid)
                .map(|o| s.is_meta_of(o))
                .unwrap_or(false)
        })
    }

    /// Synthesize a bundle from the host channel's PID descriptors.
    pub fn from_channel(channel: &Channel) -> StreamBundle {
        let mut bundle = StreamBundle::new();

        // video stream
        let vkind = match channel.vtype {
            0x02 => StreamKind::Mpeg2Video,
            0x1B => StreamKind::H264,
            0x24 => StreamKind::H265,
            _ => StreamKind::None,
        };
        bundle.add_stream(StreamInfo::new(channel.vpid, vkind));

        // dolby streams
        for d in &channel.dpids {
            let kind = match d.stream_type {
                0x6A => StreamKind::Ac3,
                0x7A => StreamKind::Eac3,
                _ => StreamKind::None,
            };
            bundle.add_stream(StreamInfo::with_language(d.pid, kind, &d.language));
        }

        // audio streams
        for a in &channel.apids {
            let kind = match a.stream_type {
                0x03 | 0x04 => StreamKind::Mpeg2Audio,
                0x0F => StreamKind::Aac,
                0x11 => StreamKind::Latm,
                _ => StreamKind::None,
            };
            bundle.add_stream(StreamInfo::with_language(a.pid, kind, &a.language));
        }

        // teletext
        if channel.tpid != 0 {
            bundle.add_stream(StreamInfo::new(channel.tpid, StreamKind::Teletext));
        }

        // subtitle streams
        for s in &channel.spids {
            let mut info = StreamInfo::with_language(s.pid, StreamKind::DvbSub, &s.language);
            info.set_subtitling(s.subtitling_type, s.composition_page_id, s.ancillary_page_id);
            bundle.add_stream(info);
        }

        bundle
    }

    /// Serialize for the channel cache.
    pub fn write_to(&self, p: &mut MsgPacket) {
        p.put_u32(self.streams.len() as u32);
        for info in self.streams.values() {
            info.write_to(p);
        }
    }

    /// Deserialize from the channel cache.
    pub fn read_from(p: &mut MsgPacket) -> Result<StreamBundle> {
        let mut bundle = StreamBundle::new();
        let count = p.get_u32()?;

        for _ in 0..count {
            bundle.add_stream(StreamInfo::read_from(p)?);
        }

        Ok(bundle)
    }
}

/// Ordered set of demuxers for one program.
pub struct DemuxerBundle {
    demuxers: Vec<Demuxer>,
}

impl DemuxerBundle {
    pub fn new() -> Self {
        Self {
            demuxers: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.demuxers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.demuxers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.demuxers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Demuxer> {
        self.demuxers.iter()
    }

    pub fn pids(&self) -> Vec<u16> {
        self.demuxers.iter().map(|d| d.pid()).collect()
    }

    pub fn find_demuxer_mut(&mut self, pid: u16) -> Option<&mut Demuxer> {
        self.demuxers.iter_mut().find(|d| d.pid() == pid)
    }

    /// True when every demuxer has parsed its stream parameters.
    pub fn is_ready(&self) -> bool {
        for d in &self.demuxers {
            if !d.is_parsed() {
                log::debug!("stream with pid {} not parsed", d.pid());
                return false;
            }
        }
        !self.demuxers.is_empty()
    }

    /// Rebuild the demuxer set from a stream bundle, carrying over already
    /// parsed stream information where PID and type still match.
    pub fn update_from(&mut self, bundle: &StreamBundle) {
        let old: Vec<StreamInfo> = self.demuxers.iter().map(|d| d.info().clone()).collect();
        self.demuxers.clear();

        for info in bundle.iter() {
            let mut info = info.clone();

            // reuse previous stream information
            if let Some(prev) = old
                .iter()
                .find(|o| o.pid == info.pid && o.kind == info.kind)
            {
                info = prev.clone();
            }

            let dmx = Demuxer::new(info);
            dmx.info().log_info();
            self.demuxers.push(dmx);
        }
    }

    /// Route one TS packet to the demuxer owning its PID.
    pub fn process_ts_packet(&mut self, packet: &[u8], listener: &mut dyn DemuxListener) -> bool {
        let pid = super::ts_pid(packet);

        match self.find_demuxer_mut(pid) {
            Some(demuxer) => demuxer.process_ts_packet(packet, listener),
            None => false,
        }
    }

    /// Stable reorder by descending 32-bit weight:
    /// video, audio, subtitle class bits, preferred language, preferred
    /// audio codec, audio type, then PID-inverse as the last resort.
    pub fn reorder_streams(&mut self, language: &str, audio_kind: StreamKind) {
        const VIDEO_MASK: u32 = 0x8000_0000;
        const AUDIO_MASK: u32 = 0x0080_0000;
        const SUBTITLE_MASK: u32 = 0x0040_0000;
        const LANGUAGE_MASK: u32 = 0x0020_0000;
        const STREAMTYPE_MASK: u32 = 0x0010_0000;
        const AUDIOTYPE_MASK: u32 = 0x000F_0000;
        const PID_MASK: u32 = 0x0000_FFFF;

        let weight_of = |d: &Demuxer| -> u32 {
            // last resort ordering, the PID
            let mut w = 0xFFFF - (d.pid() as u32 & PID_MASK);

            match d.content() {
                StreamContent::Video => {
                    w |= VIDEO_MASK;
                }
                StreamContent::Audio => {
                    w |= AUDIO_MASK;
                    if d.kind() == audio_kind {
                        w |= STREAMTYPE_MASK;
                    }
                    w |= ((4u32.saturating_sub(d.info().audio_type as u32)) << 16)
                        & AUDIOTYPE_MASK;
                }
                StreamContent::Subtitle => {
                    w |= SUBTITLE_MASK;
                }
                _ => {}
            }

            if !language.is_empty() && d.info().language == language {
                w |= LANGUAGE_MASK;
            }

            w
        };

        self.demuxers.sort_by(|a, b| weight_of(b).cmp(&weight_of(a)));

        for d in &self.demuxers {
            log::debug!(
                "stream: type {} / {} weight: {:08X}",
                d.kind().type_name(),
                d.info().language,
                weight_of(d)
            );
        }
    }

    /// Snapshot of the current stream information, e.g. for the cache.
    pub fn to_stream_bundle(&self) -> StreamBundle {
        let mut bundle = StreamBundle::new();
        for d in &self.demuxers {
            bundle.add_stream(d.info().clone());
        }
        bundle
    }

    /// Build the stream-change message describing the current bundle, in
    /// bundle order.
    pub fn create_stream_change_packet(&self) -> MsgPacket {
        let mut resp = MsgPacket::stream(STREAM_CHANGE);

        for stream in &self.demuxers {
            let info = stream.info();
            resp.put_u32(info.pid as u32);

            match info.content {
                StreamContent::Audio => {
                    resp.put_string(info.kind.type_name());
                    resp.put_string(if info.language.is_empty() {
                        "XXX"
                    } else {
                        &info.language
                    });
                    resp.put_u32(info.channels);
                    resp.put_u32(info.sample_rate);
                    resp.put_u32(info.block_align);
                    resp.put_u32(info.bit_rate);
                    resp.put_u32(info.bits_per_sample);
                }
                StreamContent::Video => {
                    resp.put_string(info.kind.type_name());
                    resp.put_u32(info.fps_scale);
                    resp.put_u32(info.fps_rate);
                    resp.put_u32(info.height);
                    resp.put_u32(info.width);
                    resp.put_s64((info.aspect * 10000.0) as i64);

                    resp.put_u8(info.sps().len() as u8);
                    resp.put_blob(info.sps());
                    resp.put_u8(info.pps().len() as u8);
                    resp.put_blob(info.pps());
                    resp.put_u8(info.vps().len() as u8);
                    resp.put_blob(info.vps());
                }
                StreamContent::Subtitle => {
                    resp.put_string(info.kind.type_name());
                    resp.put_string(if info.language.is_empty() {
                        "XXX"
                    } else {
                        &info.language
                    });
                    resp.put_u32(info.composition_page_id as u32);
                    resp.put_u32(info.ancillary_page_id as u32);
                }
                StreamContent::Teletext => {
                    resp.put_string(info.kind.type_name());
                }
                StreamContent::None => {}
            }
        }

        resp
    }
}

impl Default for DemuxerBundle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(pid: u16, kind: StreamKind, lang: &str) -> StreamInfo {
        let mut info = StreamInfo::with_language(pid, kind, lang);
        info.parsed = true;
        info
    }

    #[test]
    fn test_bundle_rejects_invalid_streams() {
        let mut bundle = StreamBundle::new();
        bundle.add_stream(StreamInfo::new(0, StreamKind::H264));
        bundle.add_stream(StreamInfo::new(0x100, StreamKind::None));
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_bundle_single_video() {
        let mut bundle = StreamBundle::new();
        bundle.add_stream(StreamInfo::new(0x100, StreamKind::H264));
        bundle.add_stream(StreamInfo::new(0x110, StreamKind::Mpeg2Video));
        assert_eq!(bundle.len(), 1);
        assert!(bundle.get(0x100).is_some());

        // same PID may change its type
        bundle.add_stream(StreamInfo::new(0x100, StreamKind::H265));
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.get(0x100).unwrap().kind, StreamKind::H265);
    }

    #[test]
    fn test_bundle_is_parsed() {
        let mut bundle = StreamBundle::new();
        assert!(!bundle.is_parsed());

        bundle.add_stream(parsed(0x100, StreamKind::H264, ""));
        assert!(bundle.is_parsed());

        bundle.add_stream(StreamInfo::new(0x101, StreamKind::Mpeg2Audio));
        assert!(!bundle.is_parsed());
    }

    #[test]
    fn test_bundle_meta_of() {
        let mut a = StreamBundle::new();
        a.add_stream(parsed(0x100, StreamKind::H264, ""));
        a.add_stream(parsed(0x101, StreamKind::Ac3, "deu"));

        let mut b = StreamBundle::new();
        b.add_stream(StreamInfo::new(0x100, StreamKind::H264));
        b.add_stream(StreamInfo::with_language(0x101, StreamKind::Eac3, "eng"));

        assert!(a.is_meta_of(&b));

        b.add_stream(StreamInfo::new(0x102, StreamKind::Teletext));
        assert!(!a.is_meta_of(&b));
    }

    #[test]
    fn test_reorder_weights() {
        let mut bundle = StreamBundle::new();
        bundle.add_stream(parsed(0x400, StreamKind::Teletext, ""));
        bundle.add_stream(parsed(0x300, StreamKind::DvbSub, "deu"));
        bundle.add_stream(parsed(0x102, StreamKind::Ac3, "deu"));
        bundle.add_stream(parsed(0x101, StreamKind::Mpeg2Audio, "eng"));
        bundle.add_stream(parsed(0x100, StreamKind::H264, ""));

        let mut demuxers = DemuxerBundle::new();
        demuxers.update_from(&bundle);
        demuxers.reorder_streams("deu", StreamKind::Ac3);

        let pids: Vec<u16> = demuxers.iter().map(|d| d.pid()).collect();
        // video first, then the preferred (deu/AC3) audio, the other
        // audio, the subtitle and finally teletext
        assert_eq!(pids, vec![0x100, 0x102, 0x101, 0x300, 0x400]);

        // reorder is idempotent
        demuxers.reorder_streams("deu", StreamKind::Ac3);
        let pids2: Vec<u16> = demuxers.iter().map(|d| d.pid()).collect();
        assert_eq!(pids, pids2);
    }

    #[test]
    fn test_update_from_preserves_parsed_info() {
        let mut first = StreamBundle::new();
        let mut audio = parsed(0x101, StreamKind::Mpeg2Audio, "deu");
        audio.sample_rate = 48000;
        audio.channels = 2;
        first.add_stream(audio);

        let mut demuxers = DemuxerBundle::new();
        demuxers.update_from(&first);
        assert!(demuxers.is_ready());

        // same PID and type arrives unparsed from a new PMT
        let mut second = StreamBundle::new();
        second.add_stream(StreamInfo::with_language(
            0x101,
            StreamKind::Mpeg2Audio,
            "deu",
        ));
        demuxers.update_from(&second);

        assert!(demuxers.is_ready());
        let info = demuxers.iter().next().unwrap().info();
        assert_eq!(info.sample_rate, 48000);
    }

    #[test]
    fn test_stream_change_packet_order() {
        let mut bundle = StreamBundle::new();
        bundle.add_stream(parsed(0x101, StreamKind::Mpeg2Audio, "deu"));
        bundle.add_stream(parsed(0x100, StreamKind::H264, ""));

        let mut demuxers = DemuxerBundle::new();
        demuxers.update_from(&bundle);
        demuxers.reorder_streams("", StreamKind::None);

        let mut packet = demuxers.create_stream_change_packet();
        packet.rewind();

        // video stream must come first after reordering
        assert_eq!(packet.get_u32().unwrap(), 0x100);
        assert_eq!(packet.get_string().unwrap(), "H264");
    }
}
