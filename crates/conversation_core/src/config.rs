use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "conversation.toml";
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub server_url: Option<String>,
    pub page_size: u32,
    pub mutation_timeout: Duration,
    pub tombstone_ttl: Duration,
    pub correlation_window: Duration,
    pub typing_timeout: Duration,
    pub typing_throttle: Duration,
    pub typing_idle: Duration,
    pub event_buffer: usize,
    pub command_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: None,
            page_size: 50,
            mutation_timeout: Duration::from_secs(10),
            tombstone_ttl: Duration::from_secs(120),
            correlation_window: Duration::from_secs(30),
            typing_timeout: Duration::from_secs(5),
            typing_throttle: Duration::from_secs(3),
            typing_idle: Duration::from_secs(3),
            event_buffer: 1024,
            command_buffer: 256,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    page_size: Option<u32>,
    mutation_timeout_ms: Option<u64>,
    tombstone_ttl_secs: Option<u64>,
    correlation_window_ms: Option<u64>,
    typing_timeout_ms: Option<u64>,
    typing_throttle_ms: Option<u64>,
    typing_idle_ms: Option<u64>,
    event_buffer: Option<usize>,
    command_buffer: Option<usize>,
}

/// Defaults, then `conversation.toml` in the working directory, then
/// `APP__*` environment variables.
pub fn load_settings() -> SyncSettings {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), "config: ignoring unreadable file: {err}"),
        }
    }

    apply_env(&mut settings, env);
    settings.sanitize()
}

fn apply_file(settings: &mut SyncSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = Some(v);
    }
    if let Some(v) = file_cfg.page_size {
        settings.page_size = v;
    }
    if let Some(v) = file_cfg.mutation_timeout_ms {
        settings.mutation_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.tombstone_ttl_secs {
        settings.tombstone_ttl = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.correlation_window_ms {
        settings.correlation_window = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.typing_timeout_ms {
        settings.typing_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.typing_throttle_ms {
        settings.typing_throttle = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.typing_idle_ms {
        settings.typing_idle = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.event_buffer {
        settings.event_buffer = v;
    }
    if let Some(v) = file_cfg.command_buffer {
        settings.command_buffer = v;
    }
}

fn apply_env(settings: &mut SyncSettings, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("SERVER_URL") {
        settings.server_url = Some(v);
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = Some(v);
    }
    if let Some(v) = parse_env::<u32>(&env, "APP__PAGE_SIZE") {
        settings.page_size = v;
    }
    if let Some(v) = parse_env::<u64>(&env, "APP__MUTATION_TIMEOUT_MS") {
        settings.mutation_timeout = Duration::from_millis(v);
    }
    if let Some(v) = parse_env::<u64>(&env, "APP__TOMBSTONE_TTL_SECS") {
        settings.tombstone_ttl = Duration::from_secs(v);
    }
    if let Some(v) = parse_env::<u64>(&env, "APP__CORRELATION_WINDOW_MS") {
        settings.correlation_window = Duration::from_millis(v);
    }
    if let Some(v) = parse_env::<u64>(&env, "APP__TYPING_TIMEOUT_MS") {
        settings.typing_timeout = Duration::from_millis(v);
    }
    if let Some(v) = parse_env::<u64>(&env, "APP__TYPING_THROTTLE_MS") {
        settings.typing_throttle = Duration::from_millis(v);
    }
    if let Some(v) = parse_env::<u64>(&env, "APP__TYPING_IDLE_MS") {
        settings.typing_idle = Duration::from_millis(v);
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = raw.as_str(), "config: ignoring unparsable override");
            None
        }
    }
}

impl SyncSettings {
    fn sanitize(mut self) -> Self {
        self.page_size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        self.event_buffer = self.event_buffer.max(1);
        self.command_buffer = self.command_buffer.max(1);
        if self.mutation_timeout.is_zero() {
            self.mutation_timeout = Self::default().mutation_timeout;
        }
        self
    }
}
