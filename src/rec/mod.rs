//! # Recording Playback
//!
//! Replays an on-disk TS recording through the demuxer pipeline. A
//! recording is a directory of sequentially numbered `NNNNN.ts` files;
//! [`SegmentReader`] maps them into one virtual linear byte space and
//! [`PacketPlayer`] turns blocks of TS packets into the same framed
//! stream packets the live path produces, plus random-access seek.

use crate::demux::patpmt::PatPmtParser;
use crate::demux::{DemuxOutput, DemuxerBundle, FrameType, StreamPacket, TS_PACKET_SIZE};
use crate::net::{MsgPacket, STREAM_MUXPKT};
use crate::{Result, ServerError};
use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Upper bound for one read call.
const MAX_READ: usize = 256 * 1024;

/// TS packets fetched per player iteration.
const BLOCK_PACKETS: usize = 20;

/// Minimum delay between directory re-scans of a growing recording.
const RESCAN_INTERVAL: Duration = Duration::from_secs(2);

/// One recording file mapped into the virtual address space.
#[derive(Debug, Clone, Copy)]
struct Segment {
    start: u64,
    end: u64,
}

/// Random-access reader over the numbered files of a recording.
pub struct SegmentReader {
    dir: PathBuf,
    segments: Vec<Segment>,
    total_length: u64,
    open_file: Option<(usize, std::fs::File)>,
    last_scan: Instant,
}

impl SegmentReader {
    pub fn open(dir: &Path) -> Result<SegmentReader> {
        let mut reader = SegmentReader {
            dir: dir.to_path_buf(),
            segments: Vec::new(),
            total_length: 0,
            open_file: None,
            last_scan: Instant::now(),
        };

        reader.scan();

        if reader.segments.is_empty() {
            // legacy PES recordings are not supported
            if dir.join("001.vdr").exists() {
                return Err(ServerError::InvalidData(
                    "legacy PES recording not supported".into(),
                ));
            }
            return Err(ServerError::Unknown(format!(
                "no recording files in {}",
                dir.display()
            )));
        }

        Ok(reader)
    }

    fn file_name(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{:05}.ts", index + 1))
    }

    fn scan(&mut self) {
        let previous = self.total_length;
        self.segments.clear();
        self.total_length = 0;
        self.open_file = None;
        self.last_scan = Instant::now();

        for index in 0.. {
            let meta = match std::fs::metadata(self.file_name(index)) {
                Ok(meta) => meta,
                Err(_) => break,
            };

            self.segments.push(Segment {
                start: self.total_length,
                end: self.total_length + meta.len(),
            });
            self.total_length += meta.len();
        }

        if previous != self.total_length {
            log::info!("recording scan: {} bytes", self.total_length);
        }
    }

    /// Re-scan a possibly growing recording, rate-limited.
    pub fn update(&mut self) {
        if self.last_scan.elapsed() >= RESCAN_INTERVAL {
            self.scan();
        }
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    fn open_segment(&mut self, index: usize) -> Result<&mut std::fs::File> {
        let reopen = match &self.open_file {
            Some((open_index, _)) => *open_index != index,
            None => true,
        };

        if reopen {
            let file = std::fs::File::open(self.file_name(index))?;
            self.open_file = Some((index, file));
        }

        Ok(&mut self.open_file.as_mut().unwrap().1)
    }

    /// Read up to `buf.len()` bytes at virtual position `pos`. Reads are
    /// clamped to 256 KiB; short reads at segment boundaries continue in
    /// the following segment.
    pub fn read(&mut self, buf: &mut [u8], pos: u64) -> Result<usize> {
        let mut amount = buf.len().min(MAX_READ);

        if pos >= self.total_length {
            return Ok(0);
        }
        amount = amount.min((self.total_length - pos) as usize);

        let mut done = 0;
        let mut pos = pos;

        while done < amount {
            let index = match self
                .segments
                .iter()
                .position(|s| pos >= s.start && pos < s.end)
            {
                Some(index) => index,
                None => break,
            };

            let file_pos = pos - self.segments[index].start;
            let file = self.open_segment(index)?;
            file.seek(SeekFrom::Start(file_pos))?;

            let n = file.read(&mut buf[done..amount])?;
            if n == 0 {
                break;
            }

            done += n;
            pos += n as u64;
        }

        Ok(done)
    }
}

/// Replays a recording through the demuxer pipeline.
pub struct PacketPlayer {
    reader: SegmentReader,
    demuxers: DemuxerBundle,
    parser: PatPmtParser,
    out: DemuxOutput,

    position: u64,
    request_stream_change: bool,
    first_keyframe_seen: bool,
    queue: VecDeque<MsgPacket>,
}

impl PacketPlayer {
    pub fn open(dir: &Path) -> Result<PacketPlayer> {
        Ok(PacketPlayer {
            reader: SegmentReader::open(dir)?,
            demuxers: DemuxerBundle::new(),
            parser: PatPmtParser::new(None, 0),
            out: DemuxOutput::default(),
            position: 0,
            request_stream_change: true,
            first_keyframe_seen: false,
            queue: VecDeque::new(),
        })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn total_length(&self) -> u64 {
        self.reader.total_length()
    }

    pub fn update(&mut self) {
        self.reader.update();
    }

    fn enqueue(&mut self, pkt: StreamPacket) {
        // streaming starts with a key frame
        if pkt.frame_type == FrameType::I && !self.first_keyframe_seen {
            log::info!("got first key frame");
            self.first_keyframe_seen = true;
        }

        if !self.first_keyframe_seen {
            return;
        }

        let mut msg = MsgPacket::stream(STREAM_MUXPKT);
        msg.stream_id = pkt.frame_type.to_u16() as u32;
        msg.duration = pkt.duration;
        msg.pts = pkt.rawpts;
        msg.dts = pkt.rawdts;

        msg.put_u16(pkt.pid);
        msg.put_s64(pkt.rawpts);
        msg.put_s64(pkt.rawdts);
        msg.put_u32(pkt.duration);
        msg.put_u32(pkt.data.len() as u32);
        msg.put_blob(&pkt.data);

        // scrub information for the client UI
        msg.put_u64(self.position);
        msg.put_u64(self.reader.total_length());

        self.queue.push_back(msg);
    }

    fn next_packet(&mut self) -> Result<Option<MsgPacket>> {
        let block_size = TS_PACKET_SIZE * BLOCK_PACKETS;
        let mut buffer = vec![0u8; block_size];

        let got = self.reader.read(&mut buffer, self.position)?;
        if got != block_size {
            // truncated tail, stop here
            self.position = self.reader.total_length();
            return Ok(None);
        }

        self.position += block_size as u64;

        for packet in buffer.chunks_exact(TS_PACKET_SIZE) {
            // new PAT / PMT version ?
            if let Some(bundle) = self.parser.process_ts_packet(packet) {
                log::info!("found new PMT version, updating demuxers");
                self.demuxers.update_from(&bundle);
                self.request_stream_change = true;
            }

            self.demuxers.process_ts_packet(packet, &mut self.out);

            if self.out.stream_change {
                self.request_stream_change = true;
            }

            let packets = std::mem::take(&mut self.out.packets);
            self.out.clear();
            for pkt in packets {
                self.enqueue(pkt);
            }
        }

        // stream change needed / requested
        if self.request_stream_change && self.parser.versions().is_some() {
            if !self.demuxers.is_ready() {
                return Ok(None);
            }

            log::info!("demuxers ready, creating stream change packet");
            for d in self.demuxers.iter() {
                d.info().log_info();
            }

            self.request_stream_change = false;
            return Ok(Some(self.demuxers.create_stream_change_packet()));
        }

        Ok(self.queue.pop_front())
    }

    /// Produce the next packet, reading ahead until one drops out or the
    /// end of the recording is reached.
    pub fn get_packet(&mut self) -> Result<Option<MsgPacket>> {
        if let Some(p) = self.queue.pop_front() {
            return Ok(Some(p));
        }

        while self.position < self.reader.total_length() {
            if let Some(p) = self.next_packet()? {
                return Ok(Some(p));
            }
        }

        Ok(None)
    }

    /// Seek to a byte position (rounded down to a TS packet boundary).
    /// Rearms the PAT/PMT parser, the I-frame gate and the stream-change
    /// request.
    pub fn seek(&mut self, position: u64) -> bool {
        let position = (position / TS_PACKET_SIZE as u64) * TS_PACKET_SIZE as u64;

        if position >= self.reader.total_length() {
            return false;
        }

        log::info!("seek: {} / {}", position, self.reader.total_length());
        self.position = position;

        self.parser.reset();
        self.request_stream_change = true;
        self.first_keyframe_seen = false;
        self.queue.clear();

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_recording(dir: &Path, sizes: &[usize]) {
        for (i, size) in sizes.iter().enumerate() {
            let name = dir.join(format!("{:05}.ts", i + 1));
            std::fs::write(name, vec![(i + 1) as u8; *size]).unwrap();
        }
    }

    #[test]
    fn test_segment_scan() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), &[188 * 10, 188 * 5]);

        let reader = SegmentReader::open(dir.path()).unwrap();
        assert_eq!(reader.total_length(), 188 * 15);
        assert_eq!(reader.segments.len(), 2);
        assert_eq!(reader.segments[1].start, 188 * 10);
    }

    #[test]
    fn test_read_crosses_segment_boundary() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), &[100, 100]);

        let mut reader = SegmentReader::open(dir.path()).unwrap();

        let mut buf = vec![0u8; 50];
        let n = reader.read(&mut buf, 80).unwrap();
        assert_eq!(n, 50);
        assert_eq!(&buf[..20], &[1u8; 20][..]);
        assert_eq!(&buf[20..], &[2u8; 30][..]);
    }

    #[test]
    fn test_read_clamps_to_end() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), &[100]);

        let mut reader = SegmentReader::open(dir.path()).unwrap();

        let mut buf = vec![0u8; 64];
        assert_eq!(reader.read(&mut buf, 90).unwrap(), 10);
        assert_eq!(reader.read(&mut buf, 100).unwrap(), 0);
        assert_eq!(reader.read(&mut buf, 1000).unwrap(), 0);
    }

    #[test]
    fn test_missing_recording() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SegmentReader::open(dir.path()).is_err());
    }

    #[test]
    fn test_legacy_pes_recording_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("001.vdr"), b"pes data").unwrap();

        match SegmentReader::open(dir.path()) {
            Err(ServerError::InvalidData(_)) => {}
            other => panic!("expected InvalidData, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_seek_alignment() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(dir.path(), &[188 * 100]);

        let mut player = PacketPlayer::open(dir.path()).unwrap();

        assert!(player.seek(188 * 50 + 17));
        assert_eq!(player.position(), 188 * 50);

        // beyond the end
        assert!(!player.seek(188 * 1000));
    }
}
