//! Byte-aligned audio frame codecs: MPEG-2 audio, AC-3, E-AC-3 and
//! AAC with ADTS transport syntax. Each implements [`FrameCodec`] and is
//! driven by the rolling-buffer [`FramedParser`](super::parser::FramedParser).

use super::parser::{AudioInfo, FrameCodec};
use crate::utils::BitReader;

const MPA_MONO: u32 = 3;

static MPA_FREQUENCIES: [u32; 3] = [44100, 48000, 32000];

static MPA_BITRATES: [[[u32; 15]; 3]; 2] = [
    [
        [
            0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448,
        ],
        [
            0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384,
        ],
        [
            0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
        ],
    ],
    [
        [
            0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256,
        ],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
    ],
];

struct MpaHeader {
    channels: u32,
    sample_rate: u32,
    bit_rate: u32,
    framesize: usize,
}

fn parse_mpa_header(buffer: &[u8]) -> Option<MpaHeader> {
    let header = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);

    // syncword FFE
    if header & 0xFFF0_0000 != 0xFFF0_0000 {
        return None;
    }

    let (lsf, mpeg25) = if header & (1 << 20) != 0 {
        (if header & (1 << 19) != 0 { 0 } else { 1 }, 0)
    } else {
        (1, 1)
    };

    let layer = 4 - ((header >> 17) & 3);
    let sample_rate_index = ((header >> 10) & 3) as usize;
    let padding = (header >> 9) & 1;
    let bitrate_index = ((header >> 12) & 0xF) as usize;
    let mode = (header >> 6) & 3;

    if layer == 0 || layer == 4 {
        return None;
    }

    if sample_rate_index > 2 || bitrate_index >= 15 {
        return None;
    }

    let sample_rate = MPA_FREQUENCIES[sample_rate_index] >> (lsf + mpeg25);
    let bit_rate = MPA_BITRATES[lsf as usize][(layer - 1) as usize][bitrate_index] * 1000;
    let channels = 2 - (mode == MPA_MONO) as u32;

    if bit_rate == 0 || sample_rate == 0 {
        return None;
    }

    let framesize = if layer == 1 {
        ((12 * bit_rate / sample_rate + padding) * 4) as usize
    } else {
        (144 * bit_rate / sample_rate + padding) as usize
    };

    Some(MpaHeader {
        channels,
        sample_rate,
        bit_rate,
        framesize,
    })
}

/// ISO/IEC 11172-3 / 13818-3 audio
pub struct Mpeg2AudioCodec;

impl Mpeg2AudioCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for Mpeg2AudioCodec {
    fn header_size(&self) -> usize {
        4
    }

    fn check_alignment(&self, buf: &[u8]) -> Option<usize> {
        parse_mpa_header(buf).map(|h| h.framesize)
    }

    fn parse_frame(&mut self, frame: &[u8]) -> Option<(AudioInfo, u32)> {
        let h = parse_mpa_header(frame)?;
        let duration = (h.framesize as u64 * 8 * 1000 * 90 / h.bit_rate as u64) as u32;

        Some((
            AudioInfo {
                channels: h.channels,
                sample_rate: h.sample_rate,
                bit_rate: h.bit_rate,
                ..Default::default()
            },
            duration,
        ))
    }
}

const AC3_HEADER_SIZE: usize = 7;
const AC3_CHMODE_MONO: u32 = 1;
const AC3_CHMODE_STEREO: u32 = 2;

static AC3_SAMPLE_RATES: [u32; 3] = [48000, 44100, 32000];

static AC3_BITRATES: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];

static AC3_CHANNELS: [u32; 8] = [2, 1, 2, 3, 3, 4, 4, 5];

#[rustfmt::skip]
static AC3_FRAME_SIZES: [[u16; 3]; 38] = [
    [64, 69, 96],       [64, 70, 96],       [80, 87, 120],      [80, 88, 120],
    [96, 104, 144],     [96, 105, 144],     [112, 121, 168],    [112, 122, 168],
    [128, 139, 192],    [128, 140, 192],    [160, 174, 240],    [160, 175, 240],
    [192, 208, 288],    [192, 209, 288],    [224, 243, 336],    [224, 244, 336],
    [256, 278, 384],    [256, 279, 384],    [320, 348, 480],    [320, 349, 480],
    [384, 417, 576],    [384, 418, 576],    [448, 487, 672],    [448, 488, 672],
    [512, 557, 768],    [512, 558, 768],    [640, 696, 960],    [640, 697, 960],
    [768, 835, 1152],   [768, 836, 1152],   [896, 975, 1344],   [896, 976, 1344],
    [1024, 1114, 1536], [1024, 1115, 1536], [1152, 1253, 1728], [1152, 1254, 1728],
    [1280, 1393, 1920], [1280, 1394, 1920],
];

/// Dolby Digital (AC-3)
pub struct Ac3Codec;

impl Ac3Codec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for Ac3Codec {
    fn header_size(&self) -> usize {
        AC3_HEADER_SIZE
    }

    fn check_alignment(&self, buf: &[u8]) -> Option<usize> {
        let mut bs = BitReader::new(&buf[..AC3_HEADER_SIZE]);

        if bs.read_bits(16).ok()? != 0x0B77 {
            return None;
        }

        bs.skip_bits(16).ok()?; // CRC
        let fscod = bs.read_bits(2).ok()? as usize;
        let frmsizcod = bs.read_bits(6).ok()? as usize;

        if fscod == 3 || frmsizcod > 37 {
            return None;
        }

        let bsid = bs.read_bits(5).ok()?;
        if bsid > 8 {
            return None;
        }

        Some(AC3_FRAME_SIZES[frmsizcod][fscod] as usize * 2)
    }

    fn parse_frame(&mut self, frame: &[u8]) -> Option<(AudioInfo, u32)> {
        let mut bs = BitReader::new(&frame[..AC3_HEADER_SIZE.min(frame.len())]);

        if bs.read_bits(16).ok()? != 0x0B77 {
            return None;
        }

        bs.skip_bits(16).ok()?; // CRC
        let fscod = bs.read_bits(2).ok()? as usize;
        let frmsizcod = bs.read_bits(6).ok()? as usize;
        let bsid = bs.read_bits(5).ok()?;

        if bsid > 8 || fscod == 3 || frmsizcod > 37 {
            return None;
        }

        bs.skip_bits(3).ok()?; // bitstream mode
        let acmod = bs.read_bits(3).ok()?;

        if acmod == AC3_CHMODE_STEREO {
            bs.skip_bits(2).ok()?; // dsurmod
        } else {
            if acmod & 1 != 0 && acmod != AC3_CHMODE_MONO {
                bs.skip_bits(2).ok()?;
            }
            if acmod & 4 != 0 {
                bs.skip_bits(2).ok()?;
            }
        }
        let lfeon = bs.read_bits(1).ok()?;

        let sample_rate = AC3_SAMPLE_RATES[fscod];
        let bit_rate = AC3_BITRATES[frmsizcod >> 1] * 1000;
        let channels = AC3_CHANNELS[acmod as usize] + lfeon;

        let framesize = AC3_FRAME_SIZES[frmsizcod][fscod] as u64 * 2;
        let duration = (framesize * 8 * 1000 * 90 / bit_rate as u64) as u32;

        Some((
            AudioInfo {
                channels,
                sample_rate,
                bit_rate,
                ..Default::default()
            },
            duration,
        ))
    }
}

const EAC3_FRAME_TYPE_RESERVED: u32 = 3;

static EAC3_BLOCKS: [u32; 4] = [1, 2, 3, 6];

/// Dolby Digital Plus (E-AC-3)
pub struct Eac3Codec;

impl Eac3Codec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for Eac3Codec {
    fn header_size(&self) -> usize {
        AC3_HEADER_SIZE
    }

    fn check_alignment(&self, buf: &[u8]) -> Option<usize> {
        let mut bs = BitReader::new(&buf[..AC3_HEADER_SIZE]);

        if bs.read_bits(16).ok()? != 0x0B77 {
            return None;
        }

        bs.skip_bits(2).ok()?; // frametype
        bs.skip_bits(3).ok()?; // substream id

        Some(((bs.read_bits(11).ok()? + 1) << 1) as usize)
    }

    fn parse_frame(&mut self, frame: &[u8]) -> Option<(AudioInfo, u32)> {
        let mut bs = BitReader::new(&frame[..AC3_HEADER_SIZE.min(frame.len())]);

        if bs.read_bits(16).ok()? != 0x0B77 {
            return None;
        }

        let frametype = bs.read_bits(2).ok()?;
        if frametype == EAC3_FRAME_TYPE_RESERVED {
            return None;
        }

        bs.skip_bits(3).ok()?;

        let framesize = ((bs.read_bits(11).ok()? + 1) << 1) as usize;
        if framesize < AC3_HEADER_SIZE {
            return None;
        }

        let mut num_blocks = 6;
        let sr_code = bs.read_bits(2).ok()? as usize;
        let sample_rate = if sr_code == 3 {
            let sr_code2 = bs.read_bits(2).ok()? as usize;
            if sr_code2 == 3 {
                return None;
            }
            AC3_SAMPLE_RATES[sr_code2] / 2
        } else {
            num_blocks = EAC3_BLOCKS[bs.read_bits(2).ok()? as usize];
            AC3_SAMPLE_RATES[sr_code]
        };

        let channel_mode = bs.read_bits(3).ok()?;
        let lfeon = bs.read_bits(1).ok()?;

        let bit_rate =
            (8.0 * framesize as f64 * sample_rate as f64 / (num_blocks as f64 * 256.0)) as u32;
        let channels = AC3_CHANNELS[channel_mode as usize] + lfeon;

        let duration = (framesize as u64 * 8 * 1000 * 90 / bit_rate as u64) as u32;

        Some((
            AudioInfo {
                channels,
                sample_rate,
                bit_rate,
                ..Default::default()
            },
            duration,
        ))
    }
}

// ADTS header is 9 bytes in the CRC-protected form
const ADTS_HEADER_SIZE: usize = 9;

pub(crate) static AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

static AAC_CHANNELS: [u32; 8] = [0, 1, 2, 3, 4, 5, 6, 8];

struct AdtsHeader {
    channels: u32,
    sample_rate: u32,
    framesize: usize,
}

fn parse_adts_header(buffer: &[u8]) -> Option<AdtsHeader> {
    if buffer.len() < ADTS_HEADER_SIZE {
        return None;
    }
    let mut bs = BitReader::new(&buffer[..ADTS_HEADER_SIZE]);

    if bs.read_bits(12).ok()? != 0xFFF {
        return None;
    }

    bs.skip_bits(1).ok()?; // MPEG version

    // layer is always 0
    if bs.read_bits(2).ok()? != 0 {
        return None;
    }

    bs.skip_bits(1).ok()?; // protection absent
    bs.skip_bits(2).ok()?; // AOT

    let samplerate_index = bs.read_bits(4).ok()? as usize;
    if samplerate_index >= 13 {
        return None;
    }

    bs.skip_bits(1).ok()?; // private bit

    let channel_index = bs.read_bits(3).ok()? as usize;
    if channel_index > 7 {
        return None;
    }

    bs.skip_bits(4).ok()?; // original, home, copyright id

    let framesize = bs.read_bits(13).ok()? as usize;

    Some(AdtsHeader {
        channels: AAC_CHANNELS[channel_index],
        sample_rate: AAC_SAMPLE_RATES[samplerate_index],
        framesize,
    })
}

/// AAC with ADTS transport syntax
pub struct AdtsCodec;

impl AdtsCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for AdtsCodec {
    fn header_size(&self) -> usize {
        ADTS_HEADER_SIZE
    }

    fn check_alignment(&self, buf: &[u8]) -> Option<usize> {
        parse_adts_header(buf).map(|h| h.framesize)
    }

    fn parse_frame(&mut self, frame: &[u8]) -> Option<(AudioInfo, u32)> {
        let h = parse_adts_header(frame)?;
        let duration = 1024 * 90000 / h.sample_rate;

        Some((
            AudioInfo {
                channels: h.channels,
                sample_rate: h.sample_rate,
                ..Default::default()
            },
            duration,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpa_header() {
        // MPEG-1 layer II, 48 kHz, 192 kbit/s, stereo
        let buf = [0xFF, 0xFC, 0xA4, 0x00];
        let h = parse_mpa_header(&buf).unwrap();
        assert_eq!(h.sample_rate, 48000);
        assert_eq!(h.bit_rate, 192_000);
        assert_eq!(h.channels, 2);
        assert_eq!(h.framesize, 144 * 192_000 / 48000);
    }

    #[test]
    fn test_mpa_rejects_bad_sync() {
        let buf = [0xFF, 0x00, 0xB4, 0x00];
        assert!(parse_mpa_header(&buf).is_none());
    }

    #[test]
    fn test_ac3_alignment() {
        // 0x0B77 sync, 16 bit CRC, fscod=0 (48 kHz), frmsizcod=16
        let mut buf = [0u8; 7];
        buf[0] = 0x0B;
        buf[1] = 0x77;
        buf[4] = 0x10; // fscod 0, frmsizcod 16
        buf[5] = 0x40; // bsid 8

        let codec = Ac3Codec::new();
        let framesize = codec.check_alignment(&buf).unwrap();
        assert_eq!(framesize, 256 * 2);
    }

    #[test]
    fn test_ac3_parse_frame() {
        // fscod=0, frmsizcod=16, bsid=8, bsmod=0, acmod=2 (stereo), lfe=0
        let mut buf = vec![0u8; 16];
        buf[0] = 0x0B;
        buf[1] = 0x77;
        buf[4] = 0x10;
        buf[5] = 0x40; // bsid=8, bsmod=0
        buf[6] = 0x40; // acmod=2 (010), dsurmod=00, lfe=0

        let mut codec = Ac3Codec::new();
        let (info, duration) = codec.parse_frame(&buf).unwrap();
        assert_eq!(info.sample_rate, 48000);
        assert_eq!(info.channels, 2);
        assert_eq!(info.bit_rate, 128_000);
        // framesize 512 bytes at 128 kbit/s
        assert_eq!(duration, 512 * 8 * 1000 * 90 / 128_000);
    }

    #[test]
    fn test_eac3_alignment() {
        // sync, frametype=0, substream=0, frmsize_code=511 -> 1024 bytes
        let mut buf = [0u8; 7];
        buf[0] = 0x0B;
        buf[1] = 0x77;
        buf[2] = 0x01; // 2 bits ft, 3 bits sub, first 3 bits of frmsize (001)
        buf[3] = 0xFF; // frmsize low

        let codec = Eac3Codec::new();
        assert_eq!(codec.check_alignment(&buf).unwrap(), (0x1FF + 1) << 1);
    }

    #[test]
    fn test_adts_header() {
        // AAC-LC, 48 kHz (index 3), stereo, framesize 1024
        let mut buf = [0u8; 9];
        buf[0] = 0xFF;
        buf[1] = 0xF1; // sync + mpeg4 + layer 0 + no crc... protection absent=1
        buf[2] = 0x4C; // profile 1, samplerate index 3, private 0
        buf[3] = 0x80; // channel config 2
        buf[4] = 0x80; // framesize bits
        buf[5] = 0x00;

        let h = parse_adts_header(&buf).unwrap();
        assert_eq!(h.sample_rate, 48000);
        assert_eq!(h.channels, 2);
        assert_eq!(h.framesize, 1024);
    }
}
