//! # Server Loop and Command Dispatch
//!
//! TCP accept loop with a per-client task. Each client speaks the
//! length-prefixed two-channel protocol: requests are dispatched to thin
//! handlers here, while live streaming and recording playback run through
//! the core pipeline. At most one stream (live or recording) is active per
//! client; opening a second one tears down the first.

use crate::channels::ChannelList;
use crate::config::Config;
use crate::error::ResponseCode;
use crate::live::{ChannelCache, LiveQueue, LiveStreamer, TunerPool};
use crate::live::streamer::StreamerOptions;
use crate::net::*;
use crate::rec::PacketPlayer;
use crate::{Result, ServerError};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

/// Allowed-hosts file, one address or prefix per line.
const ALLOWED_HOSTS_FILE: &str = "allowed_hosts.conf";

/// Interval of the periodic channel-cache save.
const CACHE_SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for client tasks on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const SERVER_NAME: &str = "pvrlink";
const PROTOCOL_VERSION: u32 = 6;

/// Host ACL: plain addresses or prefixes, e.g. `192.168.` or `10.0.0.1`.
/// A missing file restricts access to the loopback interface.
struct AllowedHosts {
    patterns: Vec<String>,
}

impl AllowedHosts {
    fn load(path: &Path) -> AllowedHosts {
        let patterns = match std::fs::read_to_string(path) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect(),
            Err(_) => {
                log::error!(
                    "invalid or missing '{}', allowing loopback only",
                    path.display()
                );
                Vec::new()
            }
        };

        AllowedHosts { patterns }
    }

    fn acceptable(&self, addr: IpAddr) -> bool {
        if self.patterns.is_empty() {
            return addr.is_loopback();
        }

        let addr = addr.to_string();
        self.patterns.iter().any(|p| addr.starts_with(p.as_str()))
    }
}

/// The PVR server: owns the shared services and the accept loop.
pub struct Server {
    config: Config,
    channels: Arc<ChannelList>,
    tuners: Arc<TunerPool>,
    cache: Arc<ChannelCache>,
    client_ids: AtomicU64,
}

impl Server {
    pub fn new(config: Config, channels: Arc<ChannelList>, tuners: Arc<TunerPool>) -> Server {
        let cache = Arc::new(ChannelCache::new(&config.cache_dir));
        Server {
            config,
            channels,
            tuners,
            cache,
            client_ids: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> Arc<ChannelCache> {
        self.cache.clone()
    }

    /// Prepare persistent state: sweep stale time-shift rings and load the
    /// channel cache. Call before `run`.
    pub fn init(&self) {
        LiveQueue::remove_timeshift_files(&self.config.timeshift_dir);
        self.cache.load(&self.channels);
    }

    /// Accept clients until `shutdown` flips to true, then close the
    /// listener, signal the clients and wait for them with a bounded
    /// grace period.
    pub async fn run(
        self: Arc<Server>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let listener = TcpListener::bind(("::", self.config.listen_port)).await?;
        log::info!("server started on port {}", self.config.listen_port);
        log::info!(
            "channel streaming timeout: {} seconds",
            self.config.stream_timeout.as_secs()
        );

        let acl_path = self.config.cache_dir.join(ALLOWED_HOSTS_FILE);
        let mut clients = JoinSet::new();
        let mut save_timer = tokio::time::interval(CACHE_SAVE_INTERVAL);
        save_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.clone().accept_client(
                                stream,
                                peer.ip(),
                                &acl_path,
                                shutdown.clone(),
                                &mut clients,
                            );
                        }
                        Err(e) => log::error!("accept failed: {}", e),
                    }
                }
                _ = save_timer.tick() => {
                    // reap finished clients, then persist the cache
                    while clients.try_join_next().is_some() {}
                    if let Err(e) = self.cache.save() {
                        log::error!("channel cache save failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        log::info!("shutting down, waiting for {} client(s)", clients.len());

        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while clients.join_next().await.is_some() {}
        })
        .await;
        clients.abort_all();

        if let Err(e) = self.cache.save() {
            log::error!("channel cache save failed: {}", e);
        }

        log::info!("server stopped");
        Ok(())
    }

    fn accept_client(
        self: Arc<Server>,
        stream: TcpStream,
        peer: IpAddr,
        acl_path: &PathBuf,
        shutdown: tokio::sync::watch::Receiver<bool>,
        clients: &mut JoinSet<()>,
    ) {
        let acl = AllowedHosts::load(acl_path);
        if !acl.acceptable(peer) {
            log::error!("address {} not allowed to connect", peer);
            return;
        }

        let id = self.client_ids.fetch_add(1, Ordering::Relaxed);
        log::info!("client {} with id {} connected", peer, id);

        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let client = Client {
            id,
            server: self,
            sock: Arc::new(SocketLock::new(writer)),
            compression: 0,
            streamer: None,
            player: None,
        };

        clients.spawn(client.run(reader, shutdown));
    }
}

/// One connected client.
struct Client {
    id: u64,
    server: Arc<Server>,
    sock: Arc<SocketLock>,
    compression: u32,
    streamer: Option<LiveStreamer>,
    player: Option<PacketPlayer>,
}

impl Client {
    async fn run(
        mut self,
        mut reader: OwnedReadHalf,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            let request = tokio::select! {
                request = MsgPacket::recv(&mut reader) => request,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let mut request = match request {
                Ok(request) => request,
                Err(e) => {
                    log::info!("client {} disconnected ({})", self.id, e);
                    break;
                }
            };

            let response = self.dispatch(&mut request).await;
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    log::error!("request {} failed: {}", request.opcode, e);
                    let mut resp = MsgPacket::response(request.opcode, request.request_id);
                    resp.put_u32(ResponseCode::from(&e) as u32);
                    resp
                }
            };

            if self
                .sock
                .send(&response, self.compression, Duration::from_millis(1000))
                .await
                .is_err()
            {
                log::info!("client {} write failed, closing", self.id);
                break;
            }
        }

        self.teardown().await;
        log::info!("client {} finished", self.id);
    }

    async fn teardown(&mut self) {
        if let Some(streamer) = self.streamer.take() {
            streamer.close().await;
        }
        self.player = None;
    }

    fn response(request: &MsgPacket, code: ResponseCode) -> MsgPacket {
        let mut resp = MsgPacket::response(request.opcode, request.request_id);
        resp.put_u32(code as u32);
        resp
    }

    async fn dispatch(&mut self, request: &mut MsgPacket) -> Result<MsgPacket> {
        match request.opcode {
            OP_LOGIN => self.login(request),
            OP_GETTIME => self.gettime(request),

            OP_CHANNELSTREAM_OPEN => self.channelstream_open(request).await,
            OP_CHANNELSTREAM_CLOSE => {
                self.teardown().await;
                Ok(Self::response(request, ResponseCode::Ok))
            }
            OP_CHANNELSTREAM_PAUSE => self.channelstream_pause(request),
            OP_CHANNELSTREAM_SIGNAL => self.channelstream_signal(request),

            OP_RECSTREAM_OPEN => self.recstream_open(request).await,
            OP_RECSTREAM_CLOSE => {
                self.teardown().await;
                Ok(Self::response(request, ResponseCode::Ok))
            }
            OP_RECSTREAM_GETPACKET => self.recstream_getpacket(request).await,
            OP_RECSTREAM_SEEK => self.recstream_seek(request),

            OP_CHANNELS_GETCOUNT => {
                let mut resp = Self::response(request, ResponseCode::Ok);
                resp.put_u32(self.server.channels.len() as u32);
                Ok(resp)
            }
            OP_CHANNELS_GETCHANNELS => self.get_channels(request),

            // host PVR integrations not present in this build
            OP_TIMER_GETCOUNT | OP_TIMER_GETLIST | OP_TIMER_ADD | OP_TIMER_DELETE
            | OP_TIMER_UPDATE | OP_RECORDINGS_GETCOUNT | OP_RECORDINGS_GETLIST
            | OP_RECORDINGS_DELETE | OP_EPG_GETFORCHANNEL | OP_SCAN_SUPPORTED => {
                Ok(Self::response(request, ResponseCode::NotSupported))
            }

            _ => {
                log::error!("unknown opcode {}", request.opcode);
                Ok(Self::response(request, ResponseCode::DataInvalid))
            }
        }
    }

    fn login(&mut self, request: &mut MsgPacket) -> Result<MsgPacket> {
        let protocol = request.get_u32()?;
        self.compression = request.get_u8()? as u32;
        let name = request.get_string()?;

        log::info!(
            "client {} login: '{}' (protocol {}, compression {})",
            self.id,
            name,
            protocol,
            self.compression
        );

        let mut resp = Self::response(request, ResponseCode::Ok);
        resp.put_u32(PROTOCOL_VERSION);
        resp.put_u32(now_secs());
        resp.put_string(SERVER_NAME);
        Ok(resp)
    }

    fn gettime(&self, request: &MsgPacket) -> Result<MsgPacket> {
        let mut resp = Self::response(request, ResponseCode::Ok);
        resp.put_u32(now_secs());
        resp.put_s32(0); // GMT offset is the host's concern
        Ok(resp)
    }

    async fn channelstream_open(&mut self, request: &mut MsgPacket) -> Result<MsgPacket> {
        let uid = request.get_u32()?;
        let _priority = request.get_s32()?;
        let wait_for_iframe = request.get_u8().unwrap_or(0) != 0;

        // a second open atomically tears down the first
        self.teardown().await;

        let channel = self
            .server
            .channels
            .get_by_uid(uid)
            .ok_or_else(|| ServerError::Unknown(format!("channel uid {}", uid)))?;

        let config = &self.server.config;
        let queue = LiveQueue::new(
            &config.timeshift_dir,
            config.timeshift_max_bytes,
            self.id,
        );

        let options = StreamerOptions {
            timeout: config.stream_timeout,
            language: config.language.clone(),
            audio_kind: config.audio_kind,
            wait_for_iframe,
        };

        let streamer = LiveStreamer::open(
            &channel,
            self.server.channels.clone(),
            self.server.tuners.clone(),
            self.server.cache.clone(),
            self.sock.clone(),
            queue,
            options,
        )
        .await;

        match streamer {
            Ok(streamer) => {
                self.streamer = Some(streamer);
                Ok(Self::response(request, ResponseCode::Ok))
            }
            Err(e) => Ok(Self::response(request, (&ServerError::Tuner(e)).into())),
        }
    }

    fn channelstream_pause(&mut self, request: &mut MsgPacket) -> Result<MsgPacket> {
        let on = request.get_u8()? != 0;

        match &self.streamer {
            Some(streamer) => {
                streamer.pause(on);
                Ok(Self::response(request, ResponseCode::Ok))
            }
            None => Ok(Self::response(request, ResponseCode::DataUnknown)),
        }
    }

    fn channelstream_signal(&mut self, request: &MsgPacket) -> Result<MsgPacket> {
        match &self.streamer {
            Some(streamer) => {
                streamer.request_signal_info();
                Ok(Self::response(request, ResponseCode::Ok))
            }
            None => Ok(Self::response(request, ResponseCode::DataUnknown)),
        }
    }

    async fn recstream_open(&mut self, request: &mut MsgPacket) -> Result<MsgPacket> {
        let directory = request.get_string()?;

        self.teardown().await;

        let player = PacketPlayer::open(Path::new(&directory))?;

        let mut resp = Self::response(request, ResponseCode::Ok);
        resp.put_u64(player.total_length());
        self.player = Some(player);
        Ok(resp)
    }

    async fn recstream_getpacket(&mut self, request: &MsgPacket) -> Result<MsgPacket> {
        let player = self
            .player
            .as_mut()
            .ok_or_else(|| ServerError::Unknown("no recording open".into()))?;

        player.update();

        match player.get_packet()? {
            Some(packet) => {
                self.sock
                    .send(&packet, 0, Duration::from_millis(1000))
                    .await?;
                let mut resp = Self::response(request, ResponseCode::Ok);
                resp.put_u8(1);
                Ok(resp)
            }
            None => {
                // end of recording
                let mut resp = Self::response(request, ResponseCode::Ok);
                resp.put_u8(0);
                Ok(resp)
            }
        }
    }

    fn recstream_seek(&mut self, request: &mut MsgPacket) -> Result<MsgPacket> {
        let position = request.get_u64()?;

        let player = self
            .player
            .as_mut()
            .ok_or_else(|| ServerError::Unknown("no recording open".into()))?;

        if player.seek(position) {
            let mut resp = Self::response(request, ResponseCode::Ok);
            resp.put_u64(player.position());
            Ok(resp)
        } else {
            Ok(Self::response(request, ResponseCode::DataInvalid))
        }
    }

    fn get_channels(&self, request: &MsgPacket) -> Result<MsgPacket> {
        let mut resp = Self::response(request, ResponseCode::Ok);

        self.server.channels.for_each(|c| {
            resp.put_u32(c.number);
            resp.put_string(&c.name);
            resp.put_u32(c.uid());
            resp.put_u8(c.encrypted as u8);
            resp.put_string(&c.provider);
        });

        Ok(resp)
    }
}

fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
