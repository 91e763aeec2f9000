use std::path::{Path, PathBuf};
use std::time::Duration;
use typerace_execution::lobby::{DEFAULT_COUNTDOWN, DEFAULT_ENTRY_FEE, DEFAULT_LEADERBOARD_CAPACITY};
use typerace_execution::{LobbyConfig, DEFAULT_STARTING_BALANCE};

const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_HTTP_RATE_LIMIT_PER_SECOND: u64 = 1_000;
const DEFAULT_HTTP_RATE_LIMIT_BURST: u32 = 5_000;
const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_WS_OUTBOUND_BUFFER: usize = 256;
const DEFAULT_WS_MAX_CONNECTIONS: usize = 20_000;
const DEFAULT_WS_MAX_CONNECTIONS_PER_IP: usize = 10;
const DEFAULT_WS_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Runtime configuration for the server binary.
///
/// `None` in a limit field means the limit is disabled. `None` in a sizing field means the
/// default applies.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// SQLite database; accounts live in memory when omitted.
    pub database_path: Option<PathBuf>,
    /// YAML article catalog; the built-in catalog is used when omitted.
    pub articles_path: Option<PathBuf>,
    pub upload_dir: Option<PathBuf>,
    pub entry_fee: Option<i64>,
    pub starting_balance: Option<i64>,
    pub countdown_ms: Option<u64>,
    pub leaderboard_cache: Option<usize>,
    pub http_rate_limit_per_second: Option<u64>,
    pub http_rate_limit_burst: Option<u32>,
    pub http_body_limit_bytes: Option<usize>,
    pub ws_outbound_buffer: Option<usize>,
    pub ws_max_connections: Option<usize>,
    pub ws_max_connections_per_ip: Option<usize>,
    pub ws_max_message_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            articles_path: None,
            upload_dir: Some(PathBuf::from(DEFAULT_UPLOAD_DIR)),
            entry_fee: Some(DEFAULT_ENTRY_FEE),
            starting_balance: Some(DEFAULT_STARTING_BALANCE),
            countdown_ms: Some(DEFAULT_COUNTDOWN.as_millis() as u64),
            leaderboard_cache: Some(DEFAULT_LEADERBOARD_CAPACITY),
            http_rate_limit_per_second: Some(DEFAULT_HTTP_RATE_LIMIT_PER_SECOND),
            http_rate_limit_burst: Some(DEFAULT_HTTP_RATE_LIMIT_BURST),
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
            ws_outbound_buffer: Some(DEFAULT_WS_OUTBOUND_BUFFER),
            ws_max_connections: Some(DEFAULT_WS_MAX_CONNECTIONS),
            ws_max_connections_per_ip: Some(DEFAULT_WS_MAX_CONNECTIONS_PER_IP),
            ws_max_message_bytes: Some(DEFAULT_WS_MAX_MESSAGE_BYTES),
        }
    }
}

impl ServerConfig {
    pub fn upload_dir(&self) -> &Path {
        self.upload_dir
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_UPLOAD_DIR))
    }

    pub fn starting_balance(&self) -> i64 {
        self.starting_balance.unwrap_or(DEFAULT_STARTING_BALANCE)
    }

    pub fn ws_outbound_capacity(&self) -> usize {
        self.ws_outbound_buffer.unwrap_or(DEFAULT_WS_OUTBOUND_BUFFER).max(1)
    }

    pub fn ws_max_message_bytes(&self) -> usize {
        self.ws_max_message_bytes
            .unwrap_or(DEFAULT_WS_MAX_MESSAGE_BYTES)
            .max(1)
    }

    /// The slice of configuration the lobby core consumes.
    pub fn lobby_config(&self) -> LobbyConfig {
        LobbyConfig {
            entry_fee: self.entry_fee.unwrap_or(DEFAULT_ENTRY_FEE),
            countdown: self
                .countdown_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_COUNTDOWN),
            leaderboard_capacity: self
                .leaderboard_cache
                .unwrap_or(DEFAULT_LEADERBOARD_CAPACITY)
                .max(1),
        }
    }
}
