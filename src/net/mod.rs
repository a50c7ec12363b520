//! # Wire Protocol
//!
//! Length-prefixed message framing for the client connection. Two logical
//! channels share one TCP stream: the request/response channel and the
//! stream channel. All multi-byte integers are big-endian. The high bit of
//! the channel id marks a zlib-compressed payload (prefixed with the
//! uncompressed size).
//!
//! Request/response header: `channel | opcode | requestId | payloadLen`.
//! Stream header: `channel | opcode | streamId | duration | pts | dts |
//! payloadLen`. On MUXPKT packets the streamId slot carries the frame type
//! (the slot is otherwise unused by the stream channel).

use crate::{Result, ServerError};
use bytes::{BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// Request/response channel id
pub const CHANNEL_REQUEST_RESPONSE: u32 = 1;
/// Stream channel id
pub const CHANNEL_STREAM: u32 = 2;
/// Server-initiated status channel id
pub const CHANNEL_STATUS: u32 = 3;

const CHANNEL_COMPRESSED: u32 = 0x8000_0000;

/// Largest payload accepted from the network (sanity bound).
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

// Request/response opcodes
pub const OP_LOGIN: u32 = 1;
pub const OP_GETTIME: u32 = 2;
pub const OP_CHANNELSTREAM_OPEN: u32 = 20;
pub const OP_CHANNELSTREAM_CLOSE: u32 = 21;
pub const OP_CHANNELSTREAM_PAUSE: u32 = 22;
pub const OP_CHANNELSTREAM_SIGNAL: u32 = 23;
pub const OP_RECSTREAM_OPEN: u32 = 40;
pub const OP_RECSTREAM_CLOSE: u32 = 41;
pub const OP_RECSTREAM_GETPACKET: u32 = 42;
pub const OP_RECSTREAM_SEEK: u32 = 43;
pub const OP_CHANNELS_GETCOUNT: u32 = 61;
pub const OP_CHANNELS_GETCHANNELS: u32 = 63;
pub const OP_TIMER_GETCOUNT: u32 = 80;
pub const OP_TIMER_GETLIST: u32 = 81;
pub const OP_TIMER_ADD: u32 = 82;
pub const OP_TIMER_DELETE: u32 = 83;
pub const OP_TIMER_UPDATE: u32 = 84;
pub const OP_RECORDINGS_GETCOUNT: u32 = 100;
pub const OP_RECORDINGS_GETLIST: u32 = 101;
pub const OP_RECORDINGS_DELETE: u32 = 102;
pub const OP_EPG_GETFORCHANNEL: u32 = 120;
pub const OP_SCAN_SUPPORTED: u32 = 140;

// Stream channel opcodes
pub const STREAM_MUXPKT: u32 = 1;
pub const STREAM_CHANGE: u32 = 2;
pub const STREAM_STATUS: u32 = 3;
pub const STREAM_SIGNALINFO: u32 = 4;
pub const STREAM_DETACH: u32 = 5;

// STREAM_STATUS codes
pub const STATUS_SIGNAL_LOST: u32 = 1;
pub const STATUS_SIGNAL_RESTORED: u32 = 2;

/// One framed protocol message, request/response or stream.
#[derive(Debug, Clone)]
pub struct MsgPacket {
    pub channel: u32,
    pub opcode: u32,
    /// Request serial on the request/response channel
    pub request_id: u32,
    /// Stream header slot; carries the frame type on MUXPKT packets
    pub stream_id: u32,
    pub duration: u32,
    pub pts: i64,
    pub dts: i64,
    payload: BytesMut,
    read_pos: usize,
}

impl MsgPacket {
    fn empty(channel: u32, opcode: u32) -> Self {
        Self {
            channel,
            opcode,
            request_id: 0,
            stream_id: 0,
            duration: 0,
            pts: 0,
            dts: 0,
            payload: BytesMut::new(),
            read_pos: 0,
        }
    }

    /// A request/response channel message.
    pub fn response(opcode: u32, request_id: u32) -> Self {
        let mut p = Self::empty(CHANNEL_REQUEST_RESPONSE, opcode);
        p.request_id = request_id;
        p
    }

    /// A stream channel message.
    pub fn stream(opcode: u32) -> Self {
        Self::empty(CHANNEL_STREAM, opcode)
    }

    /// A status channel message.
    pub fn status(opcode: u32) -> Self {
        Self::empty(CHANNEL_STATUS, opcode)
    }

    pub fn put_u8(&mut self, v: u8) {
        self.payload.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.payload.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.payload.put_u32(v);
    }

    pub fn put_s32(&mut self, v: i32) {
        self.payload.put_i32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.payload.put_u64(v);
    }

    pub fn put_s64(&mut self, v: i64) {
        self.payload.put_i64(v);
    }

    /// NUL-terminated string.
    pub fn put_string(&mut self, s: &str) {
        self.payload.put_slice(s.as_bytes());
        self.payload.put_u8(0);
    }

    pub fn put_blob(&mut self, data: &[u8]) {
        self.payload.put_slice(data);
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.read_pos + n > self.payload.len() {
            return Err(ServerError::Protocol("packet payload underrun".into()));
        }
        let s = &self.payload[self.read_pos..self.read_pos + n];
        self.read_pos += n;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_s32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_s64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_string(&mut self) -> Result<String> {
        let rest = &self.payload[self.read_pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ServerError::Protocol("unterminated string".into()))?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.read_pos += end + 1;
        Ok(s)
    }

    pub fn get_blob(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn eop(&self) -> bool {
        self.read_pos >= self.payload.len()
    }

    /// Rewind the payload read cursor.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    fn header_len(channel: u32) -> usize {
        if channel & !CHANNEL_COMPRESSED == CHANNEL_STREAM {
            36
        } else {
            16
        }
    }

    /// Serialize into a complete wire frame. `compression` > 0 deflates the
    /// payload and sets the compressed channel flag.
    pub fn frame(&self, compression: u32) -> Result<BytesMut> {
        let mut channel = self.channel;
        let mut body: Vec<u8>;

        if compression > 0 && !self.payload.is_empty() {
            let mut enc = ZlibEncoder::new(
                Vec::with_capacity(self.payload.len() / 2 + 16),
                Compression::new(compression.min(9)),
            );
            enc.write_all(&self.payload)?;
            let compressed = enc.finish()?;

            channel |= CHANNEL_COMPRESSED;
            body = Vec::with_capacity(compressed.len() + 4);
            body.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
            body.extend_from_slice(&compressed);
        } else {
            body = self.payload.to_vec();
        }

        let mut out = BytesMut::with_capacity(Self::header_len(self.channel) + body.len());
        out.put_u32(channel);
        out.put_u32(self.opcode);

        if self.channel == CHANNEL_STREAM {
            out.put_u32(self.stream_id);
            out.put_u32(self.duration);
            out.put_i64(self.pts);
            out.put_i64(self.dts);
        } else {
            out.put_u32(self.request_id);
        }

        out.put_u32(body.len() as u32);
        out.put_slice(&body);
        Ok(out)
    }

    /// Write the frame to an async stream under a deadline.
    pub async fn send<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        compression: u32,
        deadline: Duration,
    ) -> Result<()> {
        let frame = self.frame(compression)?;
        tokio::time::timeout(deadline, writer.write_all(&frame))
            .await
            .map_err(|_| ServerError::Protocol("socket write timeout".into()))??;
        Ok(())
    }

    /// Read one frame from an async stream.
    pub async fn recv<R: AsyncRead + Unpin>(reader: &mut R) -> Result<MsgPacket> {
        let mut word = [0u8; 4];
        reader.read_exact(&mut word).await?;
        let raw_channel = u32::from_be_bytes(word);
        let compressed = raw_channel & CHANNEL_COMPRESSED != 0;
        let channel = raw_channel & !CHANNEL_COMPRESSED;

        let mut packet = Self::empty(channel, 0);

        reader.read_exact(&mut word).await?;
        packet.opcode = u32::from_be_bytes(word);

        if channel == CHANNEL_STREAM {
            let mut rest = [0u8; 24];
            reader.read_exact(&mut rest).await?;
            packet.stream_id = u32::from_be_bytes(rest[0..4].try_into().unwrap());
            packet.duration = u32::from_be_bytes(rest[4..8].try_into().unwrap());
            packet.pts = i64::from_be_bytes(rest[8..16].try_into().unwrap());
            packet.dts = i64::from_be_bytes(rest[16..24].try_into().unwrap());
        } else {
            reader.read_exact(&mut word).await?;
            packet.request_id = u32::from_be_bytes(word);
        }

        reader.read_exact(&mut word).await?;
        let len = u32::from_be_bytes(word) as usize;
        if len > MAX_PAYLOAD {
            return Err(ServerError::Protocol(format!(
                "oversized payload ({} bytes)",
                len
            )));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;

        if compressed {
            if body.len() < 4 {
                return Err(ServerError::Protocol("truncated compressed packet".into()));
            }
            let orig = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
            if orig > MAX_PAYLOAD {
                return Err(ServerError::Protocol("oversized compressed packet".into()));
            }
            let mut dec = ZlibDecoder::new(&body[4..]);
            let mut out = Vec::with_capacity(orig);
            dec.read_to_end(&mut out)?;
            packet.payload = BytesMut::from(&out[..]);
        } else {
            packet.payload = BytesMut::from(&body[..]);
        }

        Ok(packet)
    }

    /// Append the frame to a file (time-shift ring storage).
    pub fn write_to_file(&self, file: &mut std::fs::File) -> Result<()> {
        let frame = self.frame(0)?;
        file.write_all(&frame)?;
        Ok(())
    }

    /// Read one frame from a file. Returns `None` on a clean or truncated
    /// end of data (the ring read cursor caught up with the writer).
    pub fn read_from_file(file: &mut std::fs::File) -> Result<Option<MsgPacket>> {
        let mut word = [0u8; 4];
        match read_fully(file, &mut word) {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let raw_channel = u32::from_be_bytes(word);
        let channel = raw_channel & !CHANNEL_COMPRESSED;
        let extra = Self::header_len(channel) - 4;

        let mut rest = vec![0u8; extra];
        if !read_fully(file, &mut rest)? {
            return Ok(None);
        }

        let mut packet = Self::empty(channel, u32::from_be_bytes(rest[0..4].try_into().unwrap()));
        let len;
        if channel == CHANNEL_STREAM {
            packet.stream_id = u32::from_be_bytes(rest[4..8].try_into().unwrap());
            packet.duration = u32::from_be_bytes(rest[8..12].try_into().unwrap());
            packet.pts = i64::from_be_bytes(rest[12..20].try_into().unwrap());
            packet.dts = i64::from_be_bytes(rest[20..28].try_into().unwrap());
            len = u32::from_be_bytes(rest[28..32].try_into().unwrap()) as usize;
        } else {
            packet.request_id = u32::from_be_bytes(rest[4..8].try_into().unwrap());
            len = u32::from_be_bytes(rest[8..12].try_into().unwrap()) as usize;
        }

        if len > MAX_PAYLOAD {
            return Err(ServerError::Protocol("corrupt ring file frame".into()));
        }

        let mut body = vec![0u8; len];
        if !read_fully(file, &mut body)? {
            return Ok(None);
        }
        packet.payload = BytesMut::from(&body[..]);
        Ok(Some(packet))
    }
}

fn read_fully(file: &mut std::fs::File, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut done = 0;
    while done < buf.len() {
        let n = file.read(&mut buf[done..])?;
        if n == 0 {
            return Ok(false);
        }
        done += n;
    }
    Ok(true)
}

/// Serializes all writers of one client socket: command responses, stream
/// packets and the streamer's out-of-band notifications.
pub struct SocketLock {
    writer: Mutex<OwnedWriteHalf>,
}

impl SocketLock {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub async fn send(&self, packet: &MsgPacket, compression: u32, deadline: Duration) -> Result<()> {
        let mut writer = self.writer.lock().await;
        packet.send(&mut *writer, compression, deadline).await
    }
}
