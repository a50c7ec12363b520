//! PAT/PMT handling: PSI section assembly from TS packets, table parsing
//! with CRC validation, and the mapping from PMT stream entries to
//! [`StreamInfo`] via stream types and descriptors.

use super::streaminfo::StreamInfo;
use super::{StreamBundle, StreamKind, TS_PACKET_SIZE};
use crate::utils::Crc32Mpeg2;
use crate::{Result, ServerError};

/// Table id of the Program Association Table
pub const TABLE_ID_PAT: u8 = 0x00;
/// Table id of the Program Map Table
pub const TABLE_ID_PMT: u8 = 0x02;

// descriptor tags used for stream typing
const DESC_REGISTRATION: u8 = 0x05;
const DESC_ISO639_LANGUAGE: u8 = 0x0A;
const DESC_TELETEXT: u8 = 0x56;
const DESC_SUBTITLING: u8 = 0x59;
const DESC_AC3: u8 = 0x6A;
const DESC_AAC: u8 = 0x7C;
const DESC_ENHANCED_AC3: u8 = 0x7A;

/// Maximum streams accepted from one PMT.
const MAX_RECEIVE_PIDS: usize = 16;

/// One descriptor from a PMT descriptor loop.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub tag: u8,
    pub data: Vec<u8>,
}

/// One association from the PAT.
#[derive(Debug, Clone)]
pub struct PatAssociation {
    pub service_id: u16,
    pub pid: u16,
}

impl PatAssociation {
    /// Program number 0 maps to the network PID.
    pub fn is_nit(&self) -> bool {
        self.service_id == 0
    }
}

/// A parsed PAT section.
#[derive(Debug, Clone)]
pub struct PatSection {
    pub version: u8,
    pub associations: Vec<PatAssociation>,
}

/// One elementary stream entry of a PMT.
#[derive(Debug, Clone)]
pub struct PmtStream {
    pub pid: u16,
    pub stream_type: u8,
    pub descriptors: Vec<Descriptor>,
}

/// A parsed PMT section.
#[derive(Debug, Clone)]
pub struct PmtSection {
    pub service_id: u16,
    pub version: u8,
    pub pcr_pid: u16,
    pub streams: Vec<PmtStream>,
}

fn check_section(section: &[u8], table_id: u8) -> Result<usize> {
    if section.len() < 12 {
        return Err(ServerError::Parser("section too short".into()));
    }

    if section[0] != table_id {
        return Err(ServerError::Parser(format!(
            "unexpected table id {:#04x}",
            section[0]
        )));
    }

    let section_length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
    let total = section_length + 3;

    if total > section.len() || section_length < 9 {
        return Err(ServerError::Parser("truncated section".into()));
    }

    // CRC over the complete section including the stored CRC yields zero
    if Crc32Mpeg2::new().calculate(&section[..total]) != 0 {
        return Err(ServerError::Parser("section CRC mismatch".into()));
    }

    Ok(total)
}

/// Parse a PAT section (starting at the table id), validating the CRC.
pub fn parse_pat(section: &[u8]) -> Result<PatSection> {
    let total = check_section(section, TABLE_ID_PAT)?;

    let version = (section[5] >> 1) & 0x1F;
    let mut associations = Vec::new();

    let mut pos = 8;
    while pos + 4 <= total - 4 {
        let service_id = ((section[pos] as u16) << 8) | section[pos + 1] as u16;
        let pid = (((section[pos + 2] & 0x1F) as u16) << 8) | section[pos + 3] as u16;
        associations.push(PatAssociation { service_id, pid });
        pos += 4;
    }

    Ok(PatSection {
        version,
        associations,
    })
}

fn parse_descriptors(data: &[u8]) -> Vec<Descriptor> {
    let mut descriptors = Vec::new();
    let mut pos = 0;

    while pos + 2 <= data.len() {
        let tag = data[pos];
        let len = data[pos + 1] as usize;
        if pos + 2 + len > data.len() {
            break;
        }
        descriptors.push(Descriptor {
            tag,
            data: data[pos + 2..pos + 2 + len].to_vec(),
        });
        pos += 2 + len;
    }

    descriptors
}

/// Parse a PMT section (starting at the table id), validating the CRC.
pub fn parse_pmt(section: &[u8]) -> Result<PmtSection> {
    let total = check_section(section, TABLE_ID_PMT)?;

    let service_id = ((section[3] as u16) << 8) | section[4] as u16;
    let version = (section[5] >> 1) & 0x1F;
    let pcr_pid = (((section[8] & 0x1F) as u16) << 8) | section[9] as u16;
    let program_info_length = (((section[10] & 0x0F) as usize) << 8) | section[11] as usize;

    let mut streams = Vec::new();
    let mut pos = 12 + program_info_length;

    while pos + 5 <= total - 4 {
        let stream_type = section[pos];
        let pid = (((section[pos + 1] & 0x1F) as u16) << 8) | section[pos + 2] as u16;
        let es_info_length = (((section[pos + 3] & 0x0F) as usize) << 8) | section[pos + 4] as usize;
        pos += 5;

        if pos + es_info_length > total - 4 {
            break;
        }

        streams.push(PmtStream {
            pid,
            stream_type,
            descriptors: parse_descriptors(&section[pos..pos + es_info_length]),
        });
        pos += es_info_length;
    }

    Ok(PmtSection {
        service_id,
        version,
        pcr_pid,
        streams,
    })
}

fn language_from(descriptors: &[Descriptor]) -> (String, u8) {
    for d in descriptors {
        if d.tag == DESC_ISO639_LANGUAGE && d.data.len() >= 4 {
            let lang = String::from_utf8_lossy(&d.data[0..3]).into_owned();
            return (lang, d.data[3]);
        }
    }
    (String::new(), 0)
}

/// Map one PMT stream entry to a [`StreamInfo`], following the DVB
/// descriptor rules. `tpid` is the host channel's teletext PID.
pub fn map_stream(stream: &PmtStream, tpid: u16) -> Option<StreamInfo> {
    if stream.pid == 0 {
        return None;
    }

    match stream.stream_type {
        // ISO/IEC 11172 / 13818-2 video, ATSC MPEG-2 video
        0x01 | 0x02 | 0x80 => Some(StreamInfo::new(stream.pid, StreamKind::Mpeg2Video)),

        // ISO/IEC 11172 / 13818-3 audio
        0x03 | 0x04 => {
            let (lang, audio_type) = language_from(&stream.descriptors);
            let mut info = StreamInfo::with_language(stream.pid, StreamKind::Mpeg2Audio, &lang);
            info.audio_type = audio_type;
            Some(info)
        }

        // ISO/IEC 13818-7 audio with ADTS transport syntax
        0x0F => {
            let (lang, audio_type) = language_from(&stream.descriptors);
            let mut info = StreamInfo::with_language(stream.pid, StreamKind::Aac, &lang);
            info.audio_type = audio_type;
            Some(info)
        }

        // ISO/IEC 14496-3 audio with LATM transport syntax
        0x11 => {
            let (lang, audio_type) = language_from(&stream.descriptors);
            let mut info = StreamInfo::with_language(stream.pid, StreamKind::Latm, &lang);
            info.audio_type = audio_type;
            Some(info)
        }

        // ISO/IEC 14496-10 video (H.264)
        0x1B => Some(StreamInfo::new(stream.pid, StreamKind::H264)),

        // ISO/IEC 23008-2 video (H.265)
        0x24 => Some(StreamInfo::new(stream.pid, StreamKind::H265)),

        // private sections / private PES data: typed by descriptor
        0x05 | 0x06 => {
            for d in &stream.descriptors {
                match d.tag {
                    DESC_AC3 => {
                        let (lang, audio_type) = language_from(&stream.descriptors);
                        let mut info =
                            StreamInfo::with_language(stream.pid, StreamKind::Ac3, &lang);
                        info.audio_type = audio_type;
                        return Some(info);
                    }
                    DESC_ENHANCED_AC3 => {
                        let (lang, audio_type) = language_from(&stream.descriptors);
                        let mut info =
                            StreamInfo::with_language(stream.pid, StreamKind::Eac3, &lang);
                        info.audio_type = audio_type;
                        return Some(info);
                    }
                    DESC_AAC => {
                        let (lang, audio_type) = language_from(&stream.descriptors);
                        let mut info =
                            StreamInfo::with_language(stream.pid, StreamKind::Aac, &lang);
                        info.audio_type = audio_type;
                        return Some(info);
                    }
                    DESC_TELETEXT => {
                        return Some(StreamInfo::new(stream.pid, StreamKind::Teletext));
                    }
                    DESC_SUBTITLING => {
                        let mut info = StreamInfo::new(stream.pid, StreamKind::DvbSub);
                        let mut languages = Vec::new();

                        // up to three language sub-codes, 8 bytes each
                        for entry in d.data.chunks_exact(8).take(3) {
                            if entry[0] == 0 {
                                continue;
                            }
                            info.subtitling_type = entry[3];
                            info.composition_page_id =
                                ((entry[4] as u16) << 8) | entry[5] as u16;
                            info.ancillary_page_id = ((entry[6] as u16) << 8) | entry[7] as u16;
                            languages.push(String::from_utf8_lossy(&entry[0..3]).into_owned());
                            info.parsed = true;
                        }

                        info.language = languages.join("+");
                        return Some(info);
                    }
                    _ => {}
                }
            }

            // the host channel may know this PID as teletext
            if tpid != 0 && stream.pid == tpid {
                return Some(StreamInfo::new(stream.pid, StreamKind::Teletext));
            }

            None
        }

        // user-private stream types: AC-3 behind a registration descriptor
        t if t >= 0x81 => {
            for d in &stream.descriptors {
                if d.tag == DESC_REGISTRATION && d.data.len() >= 4 && &d.data[0..4] == b"AC-3" {
                    let (lang, audio_type) = language_from(&stream.descriptors);
                    let mut info = StreamInfo::with_language(stream.pid, StreamKind::Ac3, &lang);
                    info.audio_type = audio_type;
                    return Some(info);
                }
            }
            None
        }

        _ => None,
    }
}

/// Build a stream bundle from a parsed PMT.
pub fn bundle_from_pmt(pmt: &PmtSection, tpid: u16) -> StreamBundle {
    let mut bundle = StreamBundle::new();

    for stream in &pmt.streams {
        if bundle.len() >= MAX_RECEIVE_PIDS {
            break;
        }
        if let Some(info) = map_stream(stream, tpid) {
            bundle.add_stream(info);
        }
    }

    bundle
}

/// Reassembles PSI sections from TS packets of one PID.
#[derive(Debug, Default)]
pub struct SectionAssembler {
    buffer: Vec<u8>,
    expected: usize,
}

impl SectionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected = 0;
    }

    /// Feed one TS packet, returning a complete section when available.
    pub fn push_ts_packet(&mut self, packet: &[u8], pusi: bool) -> Option<Vec<u8>> {
        let offset = super::ts_payload_offset(packet)?;
        let mut payload = &packet[offset..];

        if pusi {
            // pointer field precedes the section start
            let pointer = payload[0] as usize;
            if 1 + pointer >= payload.len() {
                return None;
            }
            payload = &payload[1 + pointer..];
            self.buffer.clear();
            if payload.len() < 3 {
                return None;
            }
            self.expected = ((((payload[1] & 0x0F) as usize) << 8) | payload[2] as usize) + 3;
        } else if self.buffer.is_empty() {
            // continuation without a start
            return None;
        }

        self.buffer.extend_from_slice(payload);

        if self.expected > 0 && self.buffer.len() >= self.expected {
            let section = self.buffer[..self.expected].to_vec();
            self.reset();
            return Some(section);
        }

        None
    }
}

/// Tracks the PAT and the PMT of one program across a TS and rebuilds the
/// stream set on version changes. A changed PMT version forces a re-scan
/// through the PAT before the new program description is accepted.
pub struct PatPmtParser {
    target_sid: Option<u16>,
    tpid: u16,

    pmt_pid: Option<u16>,
    pmt_sid: u16,
    pat_version: Option<u8>,
    pmt_version: Option<u8>,

    pat_assembler: SectionAssembler,
    pmt_assembler: SectionAssembler,
}

impl PatPmtParser {
    /// `target_sid` selects the program; `None` takes the first program of
    /// the multiplex. `tpid` is handed through to the stream mapping.
    pub fn new(target_sid: Option<u16>, tpid: u16) -> Self {
        Self {
            target_sid,
            tpid,
            pmt_pid: None,
            pmt_sid: 0,
            pat_version: None,
            pmt_version: None,
            pat_assembler: SectionAssembler::new(),
            pmt_assembler: SectionAssembler::new(),
        }
    }

    pub fn reset(&mut self) {
        self.pmt_pid = None;
        self.pmt_sid = 0;
        self.pat_version = None;
        self.pmt_version = None;
        self.pat_assembler.reset();
        self.pmt_assembler.reset();
    }

    pub fn versions(&self) -> Option<(u8, u8)> {
        Some((self.pat_version?, self.pmt_version?))
    }

    pub fn pmt_version(&self) -> Option<u8> {
        self.pmt_version
    }

    /// Feed one TS packet. Returns a new stream bundle when a PMT with a
    /// new version number was accepted.
    pub fn process_ts_packet(&mut self, packet: &[u8]) -> Option<StreamBundle> {
        if packet.len() != TS_PACKET_SIZE || packet[0] != super::TS_SYNC_BYTE {
            return None;
        }

        let pid = super::ts_pid(packet);
        let pusi = super::ts_payload_start(packet);

        if pid == 0 {
            let section = self.pat_assembler.push_ts_packet(packet, pusi)?;
            match parse_pat(&section) {
                Ok(pat) => self.handle_pat(pat),
                Err(e) => log::debug!("PAT parse failed: {}", e),
            }
            return None;
        }

        if Some(pid) == self.pmt_pid {
            let section = self.pmt_assembler.push_ts_packet(packet, pusi)?;
            match parse_pmt(&section) {
                Ok(pmt) => return self.handle_pmt(pmt),
                Err(e) => log::debug!("PMT parse failed: {}", e),
            }
        }

        None
    }

    fn handle_pat(&mut self, pat: PatSection) {
        self.pat_version = Some(pat.version);

        for assoc in pat.associations.iter().filter(|a| !a.is_nit()) {
            let wanted = match self.target_sid {
                Some(sid) => assoc.service_id == sid,
                None => true,
            };

            if wanted && assoc.pid != 0 {
                if self.pmt_pid != Some(assoc.pid) {
                    log::debug!(
                        "PMT pid {} for service {}",
                        assoc.pid,
                        assoc.service_id
                    );
                    self.pmt_pid = Some(assoc.pid);
                    self.pmt_version = None;
                    self.pmt_assembler.reset();
                }
                self.pmt_sid = assoc.service_id;
                return;
            }
        }
    }

    fn handle_pmt(&mut self, pmt: PmtSection) -> Option<StreamBundle> {
        if pmt.service_id != self.pmt_sid {
            return None;
        }

        if let Some(version) = self.pmt_version {
            if version != pmt.version {
                // force a re-scan through the PAT
                log::info!("PMT version changed ({} -> {})", version, pmt.version);
                self.pmt_pid = None;
                self.pmt_version = None;
            }
            return None;
        }

        self.pmt_version = Some(pmt.version);
        Some(bundle_from_pmt(&pmt, self.tpid))
    }
}

#[cfg(test)]
pub(crate) mod testsupport {
    //! Builders for synthetic PAT/PMT TS packets, shared by the unit and
    //! integration tests.

    use super::*;

    pub fn section_to_ts(pid: u16, section: &[u8]) -> Vec<u8> {
        let mut packet = vec![0xFF; TS_PACKET_SIZE];
        packet[0] = 0x47;
        packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
        packet[2] = pid as u8;
        packet[3] = 0x10;
        packet[4] = 0x00; // pointer field
        packet[5..5 + section.len()].copy_from_slice(section);
        packet
    }

    pub fn build_pat(version: u8, sid: u16, pmt_pid: u16) -> Vec<u8> {
        let mut section = vec![
            TABLE_ID_PAT,
            0xB0,
            13, // section length
            0x00,
            0x01, // transport stream id
            0xC1 | (version << 1),
            0x00,
            0x00,
        ];
        section.extend_from_slice(&sid.to_be_bytes());
        section.push(0xE0 | (pmt_pid >> 8) as u8);
        section.push(pmt_pid as u8);

        let crc = Crc32Mpeg2::new().calculate(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    pub struct PmtEntry {
        pub stream_type: u8,
        pub pid: u16,
        pub descriptors: Vec<u8>,
    }

    pub fn build_pmt(version: u8, sid: u16, pcr_pid: u16, entries: &[PmtEntry]) -> Vec<u8> {
        let es_len: usize = entries.iter().map(|e| 5 + e.descriptors.len()).sum();
        let section_length = 9 + es_len + 4;

        let mut section = vec![
            TABLE_ID_PMT,
            0xB0 | ((section_length >> 8) as u8 & 0x0F),
            section_length as u8,
        ];
        section.extend_from_slice(&sid.to_be_bytes());
        section.push(0xC1 | (version << 1));
        section.push(0x00);
        section.push(0x00);
        section.push(0xE0 | (pcr_pid >> 8) as u8);
        section.push(pcr_pid as u8);
        section.extend_from_slice(&[0xF0, 0x00]); // program info length 0

        for e in entries {
            section.push(e.stream_type);
            section.push(0xE0 | (e.pid >> 8) as u8);
            section.push(e.pid as u8);
            section.push(0xF0 | ((e.descriptors.len() >> 8) as u8 & 0x0F));
            section.push(e.descriptors.len() as u8);
            section.extend_from_slice(&e.descriptors);
        }

        let crc = Crc32Mpeg2::new().calculate(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    pub fn iso639_descriptor(lang: &str, audio_type: u8) -> Vec<u8> {
        let mut d = vec![DESC_ISO639_LANGUAGE, 4];
        d.extend_from_slice(lang.as_bytes());
        d.push(audio_type);
        d
    }

    pub fn subtitling_descriptor(lang: &str, subtitling_type: u8, comp: u16, anc: u16) -> Vec<u8> {
        let mut d = vec![DESC_SUBTITLING, 8];
        d.extend_from_slice(lang.as_bytes());
        d.push(subtitling_type);
        d.extend_from_slice(&comp.to_be_bytes());
        d.extend_from_slice(&anc.to_be_bytes());
        d
    }

    pub fn ac3_descriptor() -> Vec<u8> {
        vec![DESC_AC3, 0]
    }
}

#[cfg(test)]
mod tests {
    use super::testsupport::*;
    use super::*;
    use crate::demux::StreamContent;

    #[test]
    fn test_pat_round_trip() {
        let section = build_pat(3, 0x2837, 0x1FC8);
        let pat = parse_pat(&section).unwrap();

        assert_eq!(pat.version, 3);
        assert_eq!(pat.associations.len(), 1);
        assert_eq!(pat.associations[0].service_id, 0x2837);
        assert_eq!(pat.associations[0].pid, 0x1FC8);
    }

    #[test]
    fn test_pat_crc_mismatch() {
        let mut section = build_pat(3, 0x2837, 0x1FC8);
        let last = section.len() - 1;
        section[last] ^= 0xFF;
        assert!(parse_pat(&section).is_err());
    }

    #[test]
    fn test_pmt_stream_mapping() {
        let entries = [
            PmtEntry {
                stream_type: 0x1B,
                pid: 0x100,
                descriptors: vec![],
            },
            PmtEntry {
                stream_type: 0x03,
                pid: 0x101,
                descriptors: iso639_descriptor("deu", 0),
            },
            PmtEntry {
                stream_type: 0x06,
                pid: 0x102,
                descriptors: ac3_descriptor(),
            },
            PmtEntry {
                stream_type: 0x06,
                pid: 0x200,
                descriptors: subtitling_descriptor("deu", 0x10, 1, 2),
            },
            PmtEntry {
                stream_type: 0x24,
                pid: 0x300,
                descriptors: vec![],
            },
        ];
        let section = build_pmt(1, 0x2837, 0x100, &entries);
        let pmt = parse_pmt(&section).unwrap();

        assert_eq!(pmt.service_id, 0x2837);
        assert_eq!(pmt.streams.len(), 5);

        let bundle = bundle_from_pmt(&pmt, 0);
        assert_eq!(bundle.len(), 5);
        assert_eq!(bundle.get(0x100).unwrap().kind, StreamKind::H264);

        let audio = bundle.get(0x101).unwrap();
        assert_eq!(audio.kind, StreamKind::Mpeg2Audio);
        assert_eq!(audio.language, "deu");

        assert_eq!(bundle.get(0x102).unwrap().kind, StreamKind::Ac3);

        let sub = bundle.get(0x200).unwrap();
        assert_eq!(sub.kind, StreamKind::DvbSub);
        assert_eq!(sub.content, StreamContent::Subtitle);
        assert_eq!(sub.language, "deu");
        assert_eq!(sub.composition_page_id, 1);
        assert_eq!(sub.ancillary_page_id, 2);
        assert!(sub.parsed);

        assert_eq!(bundle.get(0x300).unwrap().kind, StreamKind::H265);
    }

    #[test]
    fn test_registration_descriptor_ac3() {
        let mut reg = vec![DESC_REGISTRATION, 4];
        reg.extend_from_slice(b"AC-3");

        let stream = PmtStream {
            pid: 0x105,
            stream_type: 0x81,
            descriptors: parse_descriptors(&reg),
        };

        let info = map_stream(&stream, 0).unwrap();
        assert_eq!(info.kind, StreamKind::Ac3);
    }

    #[test]
    fn test_unknown_stream_type_ignored() {
        let stream = PmtStream {
            pid: 0x105,
            stream_type: 0x10,
            descriptors: vec![],
        };
        assert!(map_stream(&stream, 0).is_none());
    }

    #[test]
    fn test_tracker_version_flip() {
        let mut tracker = PatPmtParser::new(Some(0x2837), 0);

        let pat = section_to_ts(0, &build_pat(0, 0x2837, 0x20));
        let entries = [PmtEntry {
            stream_type: 0x1B,
            pid: 0x100,
            descriptors: vec![],
        }];
        let pmt_v3 = section_to_ts(0x20, &build_pmt(3, 0x2837, 0x100, &entries));

        assert!(tracker.process_ts_packet(&pat).is_none());
        let bundle = tracker.process_ts_packet(&pmt_v3).unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(tracker.versions(), Some((0, 3)));

        // same version again: no new bundle
        assert!(tracker.process_ts_packet(&pmt_v3).is_none());

        // version flip adds a subtitle stream; first sighting only forces
        // a re-PAT
        let entries_v4 = [
            PmtEntry {
                stream_type: 0x1B,
                pid: 0x100,
                descriptors: vec![],
            },
            PmtEntry {
                stream_type: 0x06,
                pid: 0x200,
                descriptors: subtitling_descriptor("deu", 0x10, 1, 2),
            },
        ];
        let pmt_v4 = section_to_ts(0x20, &build_pmt(4, 0x2837, 0x100, &entries_v4));

        assert!(tracker.process_ts_packet(&pmt_v4).is_none());
        assert!(tracker.process_ts_packet(&pat).is_none());
        let bundle = tracker.process_ts_packet(&pmt_v4).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(tracker.versions(), Some((0, 4)));
    }
}
