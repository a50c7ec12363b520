//! Persistent channel cache: one stream-bundle snapshot per channel UID,
//! so a tuned channel can start streaming with known stream parameters
//! before the first PMT arrives.

use crate::channels::{Channel, ChannelList};
use crate::demux::StreamBundle;
use crate::net::MsgPacket;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const CACHE_FILE: &str = "channelcache.data";
const CACHE_VERSION: &str = "V2";

/// Entries above this count mean a corrupt file.
const MAX_CACHE_ENTRIES: u32 = 10000;

/// Shared channel cache. All access is serialized by one mutex; the cache
/// is handed around as an `Arc` service handle owned by the server.
pub struct ChannelCache {
    filename: PathBuf,
    cache: Mutex<HashMap<u32, StreamBundle>>,
}

impl ChannelCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            filename: cache_dir.join(CACHE_FILE),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, uid: u32) -> StreamBundle {
        self.cache.lock().get(&uid).cloned().unwrap_or_default()
    }

    pub fn put(&self, uid: u32, bundle: StreamBundle) {
        if uid != 0 {
            self.cache.lock().insert(uid, bundle);
        }
    }

    /// Register a channel from its host PID descriptors, unless a
    /// non-empty entry already exists.
    pub fn add_channel(&self, channel: &Channel) {
        let uid = channel.uid();
        if uid == 0 {
            return;
        }

        let mut cache = self.cache.lock();
        if let Some(existing) = cache.get(&uid) {
            if !existing.is_empty() {
                return;
            }
        }

        cache.insert(uid, StreamBundle::from_channel(channel));
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Drop entries whose channel no longer exists in the host list.
    pub fn gc(&self, channels: &ChannelList) {
        let mut cache = self.cache.lock();
        log::info!("channel cache garbage collection ...");
        log::info!("before: {} channels in cache", cache.len());

        let mut new_cache = HashMap::new();
        for uid in channels.uids() {
            if uid == 0 {
                continue;
            }
            if let Some(bundle) = cache.remove(&uid) {
                new_cache.insert(uid, bundle);
            }
        }

        *cache = new_cache;
        log::info!("after: {} channels in cache", cache.len());
    }

    /// Atomic save: write to `<file>.bak`, then rename over the old file.
    pub fn save(&self) -> Result<()> {
        let backup = self.filename.with_extension("data.bak");

        let mut p = MsgPacket::response(0, 0);
        {
            let cache = self.cache.lock();
            p.put_string(CACHE_VERSION);
            p.put_u32(cache.len() as u32);

            for (uid, bundle) in cache.iter() {
                p.put_u32(*uid);
                bundle.write_to(&mut p);
            }
        }

        let mut file = std::fs::File::create(&backup)?;
        p.write_to_file(&mut file)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&backup, &self.filename)?;
        Ok(())
    }

    /// Load the cache file and garbage-collect against the host channel
    /// list. A missing or corrupt file leaves the cache empty.
    pub fn load(&self, channels: &ChannelList) {
        self.cache.lock().clear();

        match self.load_file() {
            Ok(count) => log::info!("loaded {} channels from cache", count),
            Err(e) => {
                log::error!(
                    "unable to load channel cache data file ({}): {}",
                    self.filename.display(),
                    e
                );
                self.cache.lock().clear();
                return;
            }
        }

        self.gc(channels);
    }

    fn load_file(&self) -> Result<u32> {
        let mut file = std::fs::File::open(&self.filename)?;
        let mut p = MsgPacket::read_from_file(&mut file)?
            .ok_or_else(|| crate::ServerError::InvalidData("empty cache file".into()))?;

        let version = p.get_string()?;
        if version != CACHE_VERSION {
            return Err(crate::ServerError::InvalidData(format!(
                "old channel cache detected ({})",
                version
            )));
        }

        let count = p.get_u32()?;
        if count > MAX_CACHE_ENTRIES {
            return Err(crate::ServerError::InvalidData(
                "implausible cache entry count".into(),
            ));
        }

        let mut cache = self.cache.lock();
        for _ in 0..count {
            let uid = p.get_u32()?;
            let bundle = StreamBundle::read_from(&mut p)?;
            if uid != 0 {
                cache.insert(uid, bundle);
            }
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{StreamInfo, StreamKind};

    fn bundle(pid: u16) -> StreamBundle {
        let mut b = StreamBundle::new();
        let mut info = StreamInfo::with_language(pid, StreamKind::Mpeg2Audio, "deu");
        info.parsed = true;
        info.sample_rate = 48000;
        b.add_stream(info);
        b
    }

    fn channel(identity: &str) -> Channel {
        Channel {
            identity: identity.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChannelCache::new(dir.path());

        let a = channel("S19.2E-1-1019-10301");
        let b = channel("S19.2E-1-1019-10302");
        cache.put(a.uid(), bundle(0x101));
        cache.put(b.uid(), bundle(0x201));
        cache.save().unwrap();

        let channels = ChannelList::new();
        channels.push(a.clone());
        channels.push(b.clone());

        let reloaded = ChannelCache::new(dir.path());
        reloaded.load(&channels);

        assert_eq!(reloaded.len(), 2);
        let back = reloaded.get(a.uid());
        assert_eq!(back.len(), 1);
        assert_eq!(back.get(0x101).unwrap().sample_rate, 48000);
    }

    #[test]
    fn test_gc_drops_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChannelCache::new(dir.path());

        let a = channel("S19.2E-1-1019-10301");
        let b = channel("S19.2E-1-1019-10302");
        let c = channel("S19.2E-1-1019-10303");
        cache.put(a.uid(), bundle(0x101));
        cache.put(b.uid(), bundle(0x201));
        cache.put(c.uid(), bundle(0x301));

        // host only knows a and c
        let channels = ChannelList::new();
        channels.push(a.clone());
        channels.push(c.clone());

        cache.gc(&channels);
        assert_eq!(cache.len(), 2);
        assert!(!cache.get(a.uid()).is_empty());
        assert!(cache.get(b.uid()).is_empty());
        assert!(!cache.get(c.uid()).is_empty());

        // survives a save/load cycle
        cache.save().unwrap();
        let reloaded = ChannelCache::new(dir.path());
        reloaded.load(&channels);
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_FILE), b"garbage").unwrap();

        let cache = ChannelCache::new(dir.path());
        cache.load(&ChannelList::new());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_add_channel_keeps_existing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChannelCache::new(dir.path());

        let mut ch = channel("S19.2E-1-1019-10301");
        ch.vpid = 0x100;
        ch.vtype = 0x1B;

        cache.put(ch.uid(), bundle(0x101));
        cache.add_channel(&ch);

        // the parsed entry was not replaced by the synthesized one
        assert!(cache.get(ch.uid()).get(0x101).is_some());
    }
}
