//! Server configuration: built-in defaults, overridden by a plain
//! `key = value` config file, overridden by `PVRLINK_*` environment
//! variables.

use crate::demux::StreamKind;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default TCP listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 34891;

/// Default signal-loss timeout in seconds.
pub const DEFAULT_STREAM_TIMEOUT_SEC: u64 = 3;

/// Default time-shift ring size (1 GiB).
pub const DEFAULT_TIMESHIFT_MAX_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub stream_timeout: Duration,
    pub timeshift_dir: PathBuf,
    pub timeshift_max_bytes: u64,
    pub cache_dir: PathBuf,
    /// Preferred audio language (ISO 639 code)
    pub language: String,
    /// Preferred audio codec
    pub audio_kind: StreamKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            stream_timeout: Duration::from_secs(DEFAULT_STREAM_TIMEOUT_SEC),
            timeshift_dir: PathBuf::from("/video"),
            timeshift_max_bytes: DEFAULT_TIMESHIFT_MAX_BYTES,
            cache_dir: PathBuf::from("/video"),
            language: String::new(),
            audio_kind: StreamKind::Mpeg2Audio,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the config file (if present),
    /// then environment overrides.
    pub fn load(path: Option<&Path>) -> Config {
        let mut config = Config::default();

        let candidates = [
            PathBuf::from("./pvrlink.conf"),
            PathBuf::from("/etc/pvrlink/pvrlink.conf"),
        ];

        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => candidates.iter().find(|p| p.exists()).cloned(),
        };

        if let Some(file) = file {
            match std::fs::read_to_string(&file) {
                Ok(content) => config.parse_file(&content),
                Err(e) => log::error!("cannot read {}: {}", file.display(), e),
            }
        }

        config.apply_env();
        config
    }

    fn parse_file(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((name, value)) = line.split_once('=') else {
                continue;
            };

            if !self.parse(name.trim(), value.trim()) {
                log::error!("unknown config parameter {} = {}", name.trim(), value.trim());
            }
        }
    }

    fn parse(&mut self, name: &str, value: &str) -> bool {
        match name.to_ascii_lowercase().as_str() {
            "listen_port" => {
                if let Ok(v) = value.parse() {
                    self.listen_port = v;
                }
            }
            "stream_timeout_sec" => {
                if let Ok(v) = value.parse() {
                    self.stream_timeout = Duration::from_secs(v);
                }
            }
            "timeshift_dir" => self.timeshift_dir = PathBuf::from(value),
            "timeshift_max_bytes" => {
                if let Ok(v) = value.parse() {
                    self.timeshift_max_bytes = v;
                }
            }
            "cache_dir" => self.cache_dir = PathBuf::from(value),
            "language" => self.language = value.to_string(),
            "audio_type" => self.audio_kind = parse_audio_kind(value),
            _ => return false,
        }
        true
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("PVRLINK_LISTEN_PORT") {
            let _ = self.parse("listen_port", &v);
        }
        if let Ok(v) = env::var("PVRLINK_STREAM_TIMEOUT_SEC") {
            let _ = self.parse("stream_timeout_sec", &v);
        }
        if let Ok(v) = env::var("PVRLINK_TIMESHIFT_DIR") {
            let _ = self.parse("timeshift_dir", &v);
        }
        if let Ok(v) = env::var("PVRLINK_TIMESHIFT_MAX_BYTES") {
            let _ = self.parse("timeshift_max_bytes", &v);
        }
        if let Ok(v) = env::var("PVRLINK_CACHE_DIR") {
            let _ = self.parse("cache_dir", &v);
        }
        if let Ok(v) = env::var("PVRLINK_LANGUAGE") {
            let _ = self.parse("language", &v);
        }
        if let Ok(v) = env::var("PVRLINK_AUDIO_TYPE") {
            let _ = self.parse("audio_type", &v);
        }
    }
}

fn parse_audio_kind(value: &str) -> StreamKind {
    match value.to_ascii_uppercase().as_str() {
        "AC3" => StreamKind::Ac3,
        "EAC3" => StreamKind::Eac3,
        "AAC" => StreamKind::Aac,
        "LATM" => StreamKind::Latm,
        _ => StreamKind::Mpeg2Audio,
    }
}

/// Creates a default config template file if it doesn't exist
pub fn create_default_config_template<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if !path.as_ref().exists() {
        let template = r#"# pvrlink configuration
# This is a template. Replace the values with your actual configuration.

listen_port = 34891
stream_timeout_sec = 3
timeshift_dir = /video
timeshift_max_bytes = 1073741824
cache_dir = /video
# preferred audio language and codec
language = eng
audio_type = AC3
"#;
        std::fs::write(path, template)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_port, 34891);
        assert_eq!(config.stream_timeout, Duration::from_secs(3));
        assert_eq!(config.timeshift_max_bytes, 1 << 30);
    }

    #[test]
    fn test_parse_file() {
        let mut config = Config::default();
        config.parse_file(
            "# comment\n\
             listen_port = 12345\n\
             timeshift_dir = /tmp/shift\n\
             audio_type = AC3\n\
             bogus = 1\n",
        );

        assert_eq!(config.listen_port, 12345);
        assert_eq!(config.timeshift_dir, PathBuf::from("/tmp/shift"));
        assert_eq!(config.audio_kind, StreamKind::Ac3);
    }
}
