//! The live streamer: owns the receiver ring, the demuxer bundle and the
//! delivery queue of one client stream. The streamer task pulls TS bytes
//! from the ring, keeps packet sync, routes packets through the PAT/PMT
//! filter and the per-PID demuxers, and emits framed packets plus the
//! out-of-band stream-change, status and signal messages.

use super::cache::ChannelCache;
use super::queue::LiveQueue;
use super::ring::PacketRing;
use super::tuner::{TunerDevice, TunerPool};
use crate::channels::{Channel, ChannelList};
use crate::demux::patpmt::PatPmtParser;
use crate::demux::{
    DemuxOutput, DemuxerBundle, StreamBundle, StreamContent, StreamKind, StreamPacket,
    TS_PACKET_SIZE, TS_SYNC_BYTE,
};
use crate::error::TuneError;
use crate::net::{
    MsgPacket, SocketLock, STATUS_SIGNAL_LOST, STATUS_SIGNAL_RESTORED, STREAM_DETACH,
    STREAM_MUXPKT, STREAM_SIGNALINFO, STREAM_STATUS,
};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline for out-of-band and stream-channel socket writes.
const SOCKET_DEADLINE: Duration = Duration::from_millis(500);

/// Retry interval while a channel switch fails.
const SWITCH_RETRY: Duration = Duration::from_millis(10);

/// Attach retries after a PMT-driven demuxer rebuild.
const ATTACH_RETRIES: usize = 3;
const ATTACH_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Tuning knobs of one live stream session.
#[derive(Debug, Clone)]
pub struct StreamerOptions {
    /// Signal-loss timeout
    pub timeout: Duration,
    /// Preferred audio language (ISO 639)
    pub language: String,
    /// Preferred audio codec
    pub audio_kind: StreamKind,
    /// Hold packets until the first I-frame passed
    pub wait_for_iframe: bool,
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            language: String::new(),
            audio_kind: StreamKind::Mpeg2Audio,
            wait_for_iframe: false,
        }
    }
}

struct Shared {
    running: AtomicBool,
    device: Mutex<Option<Arc<dyn TunerDevice>>>,
}

/// Client-facing handle of a running live stream.
pub struct LiveStreamer {
    shared: Arc<Shared>,
    queue: LiveQueue,
    channels: Arc<ChannelList>,
    uid: u32,
    task: tokio::task::JoinHandle<()>,
    delivery: tokio::task::JoinHandle<()>,
}

impl LiveStreamer {
    /// Switch to the channel and start the streamer and delivery tasks.
    /// Retries the switch until `options.timeout` elapses, then reports
    /// why the channel cannot be tuned.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        channel: &Channel,
        channels: Arc<ChannelList>,
        tuners: Arc<TunerPool>,
        cache: Arc<ChannelCache>,
        sock: Arc<SocketLock>,
        queue: LiveQueue,
        options: StreamerOptions,
    ) -> std::result::Result<LiveStreamer, TuneError> {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            device: Mutex::new(None),
        });

        let mut task = StreamerTask {
            uid: channel.uid(),
            channels: channels.clone(),
            tuners,
            cache,
            sock: sock.clone(),
            queue: queue.clone(),
            ring: PacketRing::new(PacketRing::DEFAULT_CAPACITY),
            shared: shared.clone(),
            options: options.clone(),
            demuxers: DemuxerBundle::new(),
            filter: PatPmtParser::new(Some(channel.sid), channel.tpid),
            attached: false,
            startup: true,
            signal_lost: false,
            request_stream_change: false,
            wait_for_iframe: options.wait_for_iframe,
            last_tick: Instant::now(),
            out: DemuxOutput::default(),
        };

        // initial switch, retried until the timeout elapses
        let deadline = Instant::now() + options.timeout;
        loop {
            match task.switch_channel(channel) {
                Ok(()) => break,
                Err(e) => {
                    if Instant::now() >= deadline {
                        log::error!("unable to tune channel {}: {}", channel.name, e);
                        return Err(e);
                    }
                    tokio::time::sleep(SWITCH_RETRY).await;
                }
            }
        }

        let uid = task.uid;
        let handle_queue = queue.clone();
        let streamer_task = tokio::spawn(task.run());

        let delivery_shared = shared.clone();
        let delivery = tokio::spawn(async move {
            while delivery_shared.running.load(Ordering::Acquire) {
                match queue.next_packet().await {
                    Some(packet) => {
                        if sock.send(&packet, 0, Duration::from_millis(1000)).await.is_err() {
                            log::info!("stream socket write failed, stopping delivery");
                            delivery_shared.running.store(false, Ordering::Release);
                            break;
                        }
                    }
                    None => {
                        // heartbeat timeout or closed queue
                        continue;
                    }
                }
            }
        });

        Ok(LiveStreamer {
            shared,
            queue: handle_queue,
            channels,
            uid,
            task: streamer_task,
            delivery,
        })
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn pause(&self, on: bool) {
        self.queue.pause(on);
    }

    pub fn is_paused(&self) -> bool {
        self.queue.is_paused()
    }

    /// Queue an out-of-band signal report for the client.
    pub fn request_signal_info(&self) {
        if self.queue.is_paused() {
            // do not pollute a paused client with signal information
            return;
        }

        let device = self.shared.device.lock().clone();
        let Some(device) = device else { return };

        let timeshift = self.queue.timeshift_mode();
        let status = device.signal_status();

        let mut resp = MsgPacket::stream(STREAM_SIGNALINFO);
        resp.put_string(&device.name());

        // quality: 0 no signal .. 4 sync
        let mut quality = status.quality;
        if timeshift {
            resp.put_string("TIMESHIFT");
        } else if quality == -1 {
            resp.put_string("UNKNOWN (incompatible device)");
            quality = 0;
        } else {
            resp.put_string(&format!(
                "{}:{}:{}:{}:{}",
                if quality > 4 { "LOCKED" } else { "-" },
                if quality > 0 { "SIGNAL" } else { "-" },
                if quality > 1 { "CARRIER" } else { "-" },
                if quality > 2 { "VITERBI" } else { "-" },
                if quality > 3 { "SYNC" } else { "-" }
            ));
        }

        resp.put_u32(((status.strength << 16) / 100) as u32);
        resp.put_u32(((quality << 16) / 100) as u32);
        resp.put_u32(0);
        resp.put_u32(0);

        match self.channels.get_by_uid(self.uid) {
            Some(channel) => {
                resp.put_string(&channel.provider);
                resp.put_string(&channel.service);
            }
            None => {
                resp.put_string("");
                resp.put_string("");
            }
        }

        self.queue.add(resp);
    }

    /// Stop both tasks and release the device.
    pub async fn close(self) {
        self.shared.running.store(false, Ordering::Release);
        self.queue.close();

        if let Some(device) = self.shared.device.lock().take() {
            device.detach();
        }

        let _ = self.task.await;
        let _ = self.delivery.await;
    }
}

/// Task-owned state of the streamer loop.
struct StreamerTask {
    uid: u32,
    channels: Arc<ChannelList>,
    tuners: Arc<TunerPool>,
    cache: Arc<ChannelCache>,
    sock: Arc<SocketLock>,
    queue: LiveQueue,
    ring: PacketRing,
    shared: Arc<Shared>,
    options: StreamerOptions,

    demuxers: DemuxerBundle,
    filter: PatPmtParser,

    attached: bool,
    startup: bool,
    signal_lost: bool,
    request_stream_change: bool,
    wait_for_iframe: bool,
    last_tick: Instant,
    out: DemuxOutput,
}

impl StreamerTask {
    fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    async fn run(mut self) {
        log::info!("streamer task started");
        let mut carry = BytesMut::new();
        self.last_tick = Instant::now();

        while self.running() {
            if !self.attached {
                self.try_channel_switch().await;
            }

            let chunk = self.ring.take(Duration::from_millis(100)).await;

            // signal lost ?
            if !self.startup
                && !self.signal_lost
                && self.last_tick.elapsed() > self.options.timeout
            {
                log::info!("timeout. signal lost!");
                self.send_status(STATUS_SIGNAL_LOST).await;
                self.signal_lost = true;
                self.detach();
            }

            let Some(chunk) = chunk else { continue };
            carry.extend_from_slice(&chunk);

            // sync to TS packet boundaries
            let mut skipped = 0;
            while carry.len() > TS_PACKET_SIZE
                && !(carry[0] == TS_SYNC_BYTE && carry[TS_PACKET_SIZE] == TS_SYNC_BYTE)
            {
                let _ = carry.split_to(1);
                skipped += 1;
            }
            if skipped > 0 {
                log::debug!("skipped {} bytes to regain packet sync", skipped);
            }

            while carry.len() >= TS_PACKET_SIZE && self.running() {
                if carry[0] != TS_SYNC_BYTE {
                    break;
                }

                let packet = carry.split_to(TS_PACKET_SIZE);

                if let Some(bundle) = self.filter.process_ts_packet(&packet) {
                    self.reconfigure(bundle).await;
                }

                self.demuxers.process_ts_packet(&packet, &mut self.out);
                self.drain_demuxed().await;
            }
        }

        self.detach();
        log::info!("streamer task ended");
    }

    async fn drain_demuxed(&mut self) {
        if self.out.stream_change {
            self.request_stream_change = true;
        }

        let packets = std::mem::take(&mut self.out.packets);
        self.out.clear();

        for packet in packets {
            self.emit(packet).await;
        }
    }

    /// Port of the packet gate chain: startup, stream change, I-frame
    /// wait and signal-loss bookkeeping, then the MUXPKT itself.
    async fn emit(&mut self, pkt: StreamPacket) {
        let ready = self.demuxers.is_ready();

        if !ready || pkt.data.is_empty() {
            return;
        }

        let av = matches!(pkt.content, StreamContent::Audio | StreamContent::Video);

        // wait for an A/V frame on startup
        if self.startup {
            if !av {
                return;
            }

            log::info!("streaming of channel started");
            self.last_tick = Instant::now();
            self.request_stream_change = true;
            self.startup = false;
        }

        // an A/V packet means the signal is restored; the stream change
        // announcing the (possibly new) program follows the status
        if self.signal_lost {
            if av {
                log::info!("signal restored");
                self.send_status(STATUS_SIGNAL_RESTORED).await;
                self.signal_lost = false;
                self.request_stream_change = true;
                self.last_tick = Instant::now();
            }
            return;
        }

        if self.request_stream_change {
            self.send_stream_change();
        }

        // wait for first I-frame (if enabled)
        if self.wait_for_iframe && pkt.frame_type != crate::demux::FrameType::I {
            return;
        }
        self.wait_for_iframe = false;

        let mut msg = MsgPacket::stream(STREAM_MUXPKT);
        // frame type rides in the client-id header slot
        msg.stream_id = pkt.frame_type.to_u16() as u32;
        msg.duration = pkt.duration;
        msg.pts = pkt.pts;
        msg.dts = pkt.dts;

        msg.put_u16(pkt.pid);
        msg.put_s64(pkt.pts);
        msg.put_s64(pkt.dts);
        msg.put_u32(pkt.duration);
        msg.put_u32(pkt.data.len() as u32);
        msg.put_blob(&pkt.data);

        self.queue.add(msg);
        self.last_tick = Instant::now();
    }

    fn send_stream_change(&mut self) {
        // keep the cache in sync with what we actually parsed
        self.cache.put(self.uid, self.demuxers.to_stream_bundle());

        self.demuxers
            .reorder_streams(&self.options.language, self.options.audio_kind);

        for d in self.demuxers.iter() {
            d.info().log_info();
        }

        self.queue.add(self.demuxers.create_stream_change_packet());
        self.request_stream_change = false;
    }

    async fn send_status(&self, code: u32) {
        let mut packet = MsgPacket::stream(STREAM_STATUS);
        packet.put_u32(code);

        if let Err(e) = self.sock.send(&packet, 0, SOCKET_DEADLINE).await {
            log::debug!("status message not delivered: {}", e);
        }
    }

    async fn send_detach(&self) {
        log::info!("sending detach message");
        let packet = MsgPacket::stream(STREAM_DETACH);

        if let Err(e) = self.sock.send(&packet, 0, SOCKET_DEADLINE).await {
            log::debug!("detach message not delivered: {}", e);
        }
    }

    /// The PAT/PMT filter saw a changed program description: compare with
    /// the cache, rebuild the demuxers and re-attach the receiver.
    async fn reconfigure(&mut self, bundle: StreamBundle) {
        let cached = self.cache.get(self.uid);

        // no currently unknown streams -> nothing to do
        if !cached.is_empty() && cached.is_meta_of(&bundle) {
            return;
        }

        log::info!("currently unknown streams found, requesting stream change");

        self.detach();
        self.demuxers.update_from(&bundle);
        self.request_stream_change = true;

        self.cache.put(self.uid, bundle);

        let mut attached = false;
        for _ in 0..ATTACH_RETRIES {
            if self.attach() {
                attached = true;
                break;
            }
            log::info!("unable to attach receiver, retrying ...");
            tokio::time::sleep(ATTACH_RETRY_DELAY).await;
        }

        if !attached {
            log::error!("failed to attach receiver, sending detach ...");
            self.send_detach().await;
        }
    }

    async fn try_channel_switch(&mut self) {
        let Some(channel) = self.channels.get_by_uid(self.uid) else {
            tokio::time::sleep(SWITCH_RETRY).await;
            return;
        };

        match self.switch_channel(&channel) {
            Ok(()) => {}
            Err(e) => {
                if self.last_tick.elapsed() >= self.options.timeout {
                    log::error!("cannot tune channel {} - {}", channel.name, e);
                    self.last_tick = Instant::now();
                }
                tokio::time::sleep(SWITCH_RETRY).await;
            }
        }
    }

    fn switch_channel(&mut self, channel: &Channel) -> std::result::Result<(), TuneError> {
        if self.attached {
            self.detach();
        }

        // check if any device is able to decrypt the channel
        if channel.encrypted && !self.tuners.can_decrypt(channel) {
            return Err(TuneError::Encrypted);
        }

        let device = match self.tuners.device_for(channel) {
            Some(device) => device,
            None => {
                if self.tuners.recording_active() {
                    return Err(TuneError::RecordingBlocked);
                }
                return Err(TuneError::AllTunersBusy);
            }
        };

        if !device.switch(channel) {
            log::error!("can't switch to channel {}", channel.name);
            return Err(TuneError::TuneFailed);
        }

        log::info!("found available device {}", device.name());
        *self.shared.device.lock() = Some(device);

        // get cached demuxer data, or synthesize it from the channel
        let mut bundle = self.cache.get(self.uid);
        if bundle.is_empty() {
            log::info!("adding channel to cache");
            self.cache.add_channel(channel);
            bundle = self.cache.get(self.uid);
        } else {
            log::info!("channel information found in cache");
        }

        // recheck cache item against the current channel description
        let current = StreamBundle::from_channel(channel);
        if !current.is_empty() && !current.is_meta_of(&bundle) {
            log::info!("current channel differs from cache item - updating");
            bundle = current;
            self.cache.put(self.uid, bundle.clone());
        }

        if !bundle.is_empty() {
            log::info!("creating demuxers");
            self.demuxers.update_from(&bundle);
        }

        self.request_stream_change = true;
        self.startup = true;
        self.wait_for_iframe = self.options.wait_for_iframe;
        if self.wait_for_iframe {
            log::info!("will wait for first I-frame ...");
        }

        // clear stale data
        self.ring.clear();
        self.queue.cleanup();
        self.filter = PatPmtParser::new(Some(channel.sid), channel.tpid);

        if !self.attach() {
            log::info!("unable to attach receiver!");
            return Err(TuneError::AllTunersBusy);
        }

        self.last_tick = Instant::now();
        log::info!("successfully switched to channel {}", channel.name);
        Ok(())
    }

    fn attach(&mut self) -> bool {
        let device = self.shared.device.lock().clone();
        match device {
            Some(device) => {
                self.attached = device.attach(self.ring.clone());
                self.attached
            }
            None => false,
        }
    }

    fn detach(&mut self) {
        if let Some(device) = self.shared.device.lock().as_ref() {
            device.detach();
        }
        self.attached = false;
    }
}
