//! Tuner abstraction. The host PVR owns the real devices; the core only
//! needs to pick one, switch it to a channel and attach a byte receiver.
//! [`LoopbackTuner`] is a software device for embedding and tests.

use super::ring::PacketRing;
use crate::channels::Channel;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Signal measurements of a device, as reported to clients.
#[derive(Debug, Clone, Default)]
pub struct SignalStatus {
    /// Signal strength 0..100
    pub strength: i32,
    /// Lock quality 0..4, -1 when the device cannot report it
    pub quality: i32,
}

/// One tuner device of the host PVR.
pub trait TunerDevice: Send + Sync {
    /// Human-readable device designation, e.g. "DVB-S2 #1 - STV090x"
    fn name(&self) -> String;

    /// Whether the device can receive the channel's transponder.
    fn provides(&self, channel: &Channel) -> bool;

    /// Whether a CAM slot of this device can decrypt the channel.
    fn can_decrypt(&self, channel: &Channel) -> bool;

    /// Tune to the channel's transponder.
    fn switch(&self, channel: &Channel) -> bool;

    /// Attach the receiver ring; data flows until detach.
    fn attach(&self, sink: PacketRing) -> bool;

    fn detach(&self);

    fn signal_status(&self) -> SignalStatus;
}

/// The set of tuner devices, plus host-side state the switch logic needs.
#[derive(Default)]
pub struct TunerPool {
    devices: Vec<Arc<dyn TunerDevice>>,
    recording_active: AtomicBool,
}

impl TunerPool {
    pub fn new(devices: Vec<Arc<dyn TunerDevice>>) -> Self {
        Self {
            devices,
            recording_active: AtomicBool::new(false),
        }
    }

    /// Pick a device able to receive the channel.
    pub fn device_for(&self, channel: &Channel) -> Option<Arc<dyn TunerDevice>> {
        self.devices.iter().find(|d| d.provides(channel)).cloned()
    }

    /// True when at least one device can decrypt the channel.
    pub fn can_decrypt(&self, channel: &Channel) -> bool {
        self.devices.iter().any(|d| d.can_decrypt(channel))
    }

    /// The host sets this while a recording occupies devices.
    pub fn set_recording_active(&self, active: bool) {
        self.recording_active.store(active, Ordering::Relaxed);
    }

    pub fn recording_active(&self) -> bool {
        self.recording_active.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

struct LoopbackState {
    sink: Option<PacketRing>,
    channel_sid: u16,
}

/// Software tuner fed by the embedder (or a test) with raw TS bytes.
pub struct LoopbackTuner {
    name: String,
    state: Mutex<LoopbackState>,
    decrypt: bool,
    signal: Mutex<SignalStatus>,
}

impl LoopbackTuner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(LoopbackState {
                sink: None,
                channel_sid: 0,
            }),
            decrypt: false,
            signal: Mutex::new(SignalStatus {
                strength: 100,
                quality: 4,
            }),
        }
    }

    /// Feed raw TS bytes into the attached receiver. Returns the number
    /// of bytes accepted.
    pub fn feed(&self, data: &[u8]) -> usize {
        match self.state.lock().sink.as_ref() {
            Some(sink) => sink.put(data),
            None => 0,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    pub fn tuned_sid(&self) -> u16 {
        self.state.lock().channel_sid
    }

    pub fn set_signal(&self, status: SignalStatus) {
        *self.signal.lock() = status;
    }
}

impl TunerDevice for LoopbackTuner {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn provides(&self, _channel: &Channel) -> bool {
        true
    }

    fn can_decrypt(&self, _channel: &Channel) -> bool {
        self.decrypt
    }

    fn switch(&self, channel: &Channel) -> bool {
        self.state.lock().channel_sid = channel.sid;
        true
    }

    fn attach(&self, sink: PacketRing) -> bool {
        self.state.lock().sink = Some(sink);
        true
    }

    fn detach(&self) {
        self.state.lock().sink = None;
    }

    fn signal_status(&self) -> SignalStatus {
        self.signal.lock().clone()
    }
}
