//! Host channel list. The embedding PVR owns channel discovery; the core
//! only reads this table to resolve UIDs, service ids and PID layouts.

use crate::utils::ChannelUid;
use parking_lot::RwLock;

/// One audio/data PID of a channel.
#[derive(Debug, Clone, Default)]
pub struct AudioPid {
    pub pid: u16,
    pub stream_type: u8,
    pub language: String,
}

/// One DVB subtitle PID of a channel.
#[derive(Debug, Clone, Default)]
pub struct SubtitlePid {
    pub pid: u16,
    pub language: String,
    pub subtitling_type: u8,
    pub composition_page_id: u16,
    pub ancillary_page_id: u16,
}

/// A channel as known to the host PVR.
#[derive(Debug, Clone, Default)]
pub struct Channel {
    /// Stable identity string, the input of the UID hash
    pub identity: String,
    pub name: String,
    pub number: u32,
    pub provider: String,
    pub service: String,
    /// DVB service id, matched against PAT associations
    pub sid: u16,
    /// True when a conditional-access id is set
    pub encrypted: bool,

    pub vpid: u16,
    pub vtype: u8,
    pub apids: Vec<AudioPid>,
    pub dpids: Vec<AudioPid>,
    pub spids: Vec<SubtitlePid>,
    pub tpid: u16,
}

impl Channel {
    /// 31-bit UID derived from the channel identity string.
    pub fn uid(&self) -> u32 {
        ChannelUid::new().hash(&self.identity)
    }
}

/// The host channel table. Readers take the shared lock; the rare write
/// paths (list updates from the host) take the exclusive lock briefly.
#[derive(Default)]
pub struct ChannelList {
    channels: RwLock<Vec<Channel>>,
}

impl ChannelList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, channels: Vec<Channel>) {
        *self.channels.write() = channels;
    }

    pub fn push(&self, channel: Channel) {
        self.channels.write().push(channel);
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    pub fn get_by_uid(&self, uid: u32) -> Option<Channel> {
        self.channels
            .read()
            .iter()
            .find(|c| c.uid() == uid)
            .cloned()
    }

    pub fn get_by_sid(&self, sid: u16) -> Option<Channel> {
        self.channels
            .read()
            .iter()
            .find(|c| c.sid == sid)
            .cloned()
    }

    /// UIDs of all current channels, e.g. for cache garbage collection.
    pub fn uids(&self) -> Vec<u32> {
        self.channels.read().iter().map(|c| c.uid()).collect()
    }

    /// Run `f` over all channels under the read lock.
    pub fn for_each<F: FnMut(&Channel)>(&self, mut f: F) {
        for c in self.channels.read().iter() {
            f(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(identity: &str, sid: u16) -> Channel {
        Channel {
            identity: identity.to_string(),
            name: identity.to_string(),
            sid,
            ..Default::default()
        }
    }

    #[test]
    fn test_lookup_by_uid() {
        let list = ChannelList::new();
        list.push(channel("S19.2E-1-1019-10301", 10301));
        list.push(channel("S19.2E-1-1019-10302", 10302));

        let uid = channel("S19.2E-1-1019-10302", 0).uid();
        let found = list.get_by_uid(uid).unwrap();
        assert_eq!(found.sid, 10302);

        assert!(list.get_by_uid(1).is_none());
    }

    #[test]
    fn test_uids() {
        let list = ChannelList::new();
        list.push(channel("S19.2E-1-1019-10301", 10301));
        assert_eq!(list.uids().len(), 1);
        assert_ne!(list.uids()[0], 0);
    }
}
