use serde::Deserialize;
use session::SessionConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct SessionSection {
    pub read_timeout_ms: Option<u64>,
    pub ttl_timeout_ms: Option<u64>,
    pub read_buffer: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct OutputSection {
    pub format: Option<String>,
    pub transcript: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub session: Option<SessionSection>,
    pub output: Option<OutputSection>,
    pub log_level: Option<String>,
}

impl Config {
    /// Session settings: flag overrides, then file values, then defaults.
    pub fn session_config(&self, read_timeout_ms: Option<u64>, ttl_timeout_ms: Option<u64>) -> SessionConfig {
        let mut cfg = SessionConfig::default();
        let file = self.session.clone().unwrap_or_default();
        if let Some(ms) = read_timeout_ms.or(file.read_timeout_ms) {
            cfg.read_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = ttl_timeout_ms.or(file.ttl_timeout_ms) {
            cfg.ttl_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = file.read_buffer.filter(|n| *n > 0) {
            cfg.read_buffer = n;
        }
        cfg
    }

    pub fn format(&self) -> Option<&str> {
        self.output.as_ref()?.format.as_deref()
    }

    pub fn transcript(&self) -> Option<&Path> {
        self.output.as_ref()?.transcript.as_deref()
    }
}

/// Load `path`, or `./linxtap.yaml` when no path is given. Missing or
/// malformed files yield `None`.
pub fn load_config(path: Option<&Path>) -> Option<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("linxtap.yaml");
            if p.exists() { p.to_path_buf() } else { return None; }
        }
    };
    let s = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&s).ok()
}
