//! Delivery queue between the streamer (real-time producer) and the client
//! socket (possibly slow or paused consumer).
//!
//! Live mode keeps a bounded in-memory FIFO and drops the oldest packet on
//! overflow. When the client pauses, every produced packet goes to a disk
//! ring file instead; the file wraps at its configured maximum size. After
//! resume the session keeps streaming from disk, which preserves ordering
//! across the pause.

use crate::net::MsgPacket;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Live-mode queue bound; overflow drops the oldest packet.
const MAX_LIVE_PACKETS: usize = 100;

/// Consumer heartbeat wake interval.
const WAKE_INTERVAL: Duration = Duration::from_secs(3);

const RING_PREFIX: &str = "ring-";

struct QueueState {
    queue: VecDeque<MsgPacket>,
    paused: bool,
    writer: Option<std::fs::File>,
    reader: Option<std::fs::File>,
}

impl QueueState {
    fn timeshift_mode(&self) -> bool {
        self.paused || self.writer.is_some()
    }

    fn leave_timeshift(&mut self) {
        self.paused = false;
        self.writer = None;
        self.reader = None;
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
    storage: PathBuf,
    max_bytes: u64,
}

/// Bounded delivery FIFO with optional disk-backed time-shift.
#[derive(Clone)]
pub struct LiveQueue {
    inner: Arc<QueueInner>,
}

impl LiveQueue {
    /// `id` distinguishes ring files of concurrent clients.
    pub fn new(timeshift_dir: &Path, max_bytes: u64, id: u64) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    paused: false,
                    writer: None,
                    reader: None,
                }),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                storage: timeshift_dir.join(format!("{}{:05}.data", RING_PREFIX, id)),
                max_bytes,
            }),
        }
    }

    /// Producer side. Returns false when the packet was dropped.
    pub fn add(&self, packet: MsgPacket) -> bool {
        let mut state = self.inner.state.lock();

        if state.timeshift_mode() {
            let result = state
                .writer
                .as_mut()
                .ok_or_else(|| crate::ServerError::InvalidData("no ring writer".into()))
                .and_then(|w| {
                    packet.write_to_file(w)?;
                    Ok(w.stream_position()?)
                });

            match result {
                Ok(length) => {
                    // ring-buffer wrap ?
                    if length >= self.inner.max_bytes {
                        if let Some(w) = state.writer.as_mut() {
                            let _ = w.set_len(length);
                            let _ = w.seek(SeekFrom::Start(0));
                        }
                    }
                    drop(state);
                    self.inner.notify.notify_one();
                    return true;
                }
                Err(e) => {
                    // fall back from time-shift to live
                    log::error!("unable to write packet into timeshift ringbuffer: {}", e);
                    state.leave_timeshift();
                    return false;
                }
            }
        }

        state.queue.push_back(packet);

        // queue too long ?
        while state.queue.len() > MAX_LIVE_PACKETS {
            state.queue.pop_front();
        }

        drop(state);
        self.inner.notify.notify_one();
        true
    }

    /// Toggle pause / time-shift. Returns false if the state did not
    /// change.
    pub fn pause(&self, on: bool) -> bool {
        let mut state = self.inner.state.lock();

        if !on {
            let was = state.paused;
            state.paused = false;
            drop(state);
            self.inner.notify.notify_one();
            return was;
        }

        if state.paused {
            return false;
        }

        // create the offline storage
        if state.reader.is_none() {
            log::debug!("timeshift file: {}", self.inner.storage.display());

            let writer = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.inner.storage);
            let reader = std::fs::File::open(&self.inner.storage);

            match (writer, reader) {
                (Ok(w), Ok(r)) => {
                    state.writer = Some(w);
                    state.reader = Some(r);
                }
                _ => {
                    log::error!("failed to create timeshift ringbuffer");
                    return false;
                }
            }
        }

        state.paused = true;

        // push all queued packets to the offline storage
        log::debug!(
            "writing {} packets into timeshift buffer",
            state.queue.len()
        );
        while let Some(p) = state.queue.pop_front() {
            if let Some(w) = state.writer.as_mut() {
                if let Err(e) = p.write_to_file(w) {
                    log::error!("timeshift write failed: {}", e);
                    break;
                }
            }
        }

        true
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    pub fn timeshift_mode(&self) -> bool {
        self.inner.state.lock().timeshift_mode()
    }

    /// Read the next packet from the disk ring, if any. Re-seeks to the
    /// file start once when the read cursor hits the wrap point.
    fn read_from_storage(&self, state: &mut QueueState) -> Option<MsgPacket> {
        let max_bytes = self.inner.max_bytes;
        let reader = state.reader.as_mut()?;

        match MsgPacket::read_from_file(reader) {
            Ok(Some(p)) => Some(p),
            Ok(None) => {
                // ring-buffer wrap ?
                let pos = reader.stream_position().ok()?;
                if pos < max_bytes {
                    return None;
                }
                reader.seek(SeekFrom::Start(0)).ok()?;
                MsgPacket::read_from_file(reader).ok().flatten()
            }
            Err(e) => {
                log::error!("timeshift read failed: {}", e);
                None
            }
        }
    }

    /// Consumer side: wait for the next deliverable packet. Wakes on
    /// "packet available", "pause toggled" or "shutdown"; returns `None`
    /// on a heartbeat timeout or once the queue is closed.
    pub async fn next_packet(&self) -> Option<MsgPacket> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }

            {
                let mut state = self.inner.state.lock();

                if !state.paused {
                    if let Some(p) = state.queue.pop_front() {
                        return Some(p);
                    }

                    if state.timeshift_mode() {
                        if let Some(p) = self.read_from_storage(&mut state) {
                            return Some(p);
                        }
                    }
                }
            }

            let notified = self.inner.notify.notified();
            if tokio::time::timeout(WAKE_INTERVAL, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Drop all queued packets.
    pub fn cleanup(&self) {
        self.inner.state.lock().queue.clear();
    }

    /// Shut down; wakes any waiting consumer.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Remove stale ring files of previous runs.
    pub fn remove_timeshift_files(dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(RING_PREFIX) {
                log::info!("removing old time-shift storage: {:?}", name);
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.leave_timeshift();
        if self.storage.exists() {
            let _ = std::fs::remove_file(&self.storage);
        }
    }
}
