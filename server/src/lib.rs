//! Network front end for the typerace lobby: the WebSocket transport, the account HTTP
//! routes, and the SQLite persistence adapter.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use typerace_execution::{Coordinator, LobbySnapshot, Store};

mod api;
pub use api::Api;

mod config;
pub use config::ServerConfig;

mod gateway;
pub use gateway::SocketGateway;

mod metrics;
pub use metrics::{
    HttpMetrics, HttpMetricsSnapshot, LatencySnapshot, SystemMetrics, SystemMetricsSnapshot,
    WsMetrics, WsMetricsSnapshot,
};

mod persistence;
pub use persistence::SqliteStore;

/// Parses an environment override; unset or malformed values read as `None`.
fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|value| value.trim().parse().ok())
}

/// Reads a boolean switch such as `ALLOW_HTTP_NO_ORIGIN`.
fn env_flag(var: &str) -> Option<bool> {
    match std::env::var(var).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[derive(Default)]
struct WsConnectionTracker {
    total: usize,
    per_ip: HashMap<IpAddr, usize>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WsConnectionRejection {
    GlobalLimit,
    PerIpLimit,
}

/// Holds one admitted WebSocket slot; dropping it frees the slot.
pub struct WsConnectionGuard {
    server: Arc<Server>,
    ip: IpAddr,
}

impl Drop for WsConnectionGuard {
    fn drop(&mut self) {
        self.server.release_ws_connection(self.ip);
    }
}

pub struct Server {
    pub config: ServerConfig,
    coordinator: Arc<Coordinator>,
    gateway: Arc<SocketGateway>,
    ws_metrics: Arc<WsMetrics>,
    http_metrics: HttpMetrics,
    system_metrics: SystemMetrics,
    ws_connections: Mutex<WsConnectionTracker>,
}

impl Server {
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        let ws_metrics = Arc::new(WsMetrics::default());
        let gateway = Arc::new(SocketGateway::new(ws_metrics.clone()));
        let coordinator = Arc::new(Coordinator::new(
            config.lobby_config(),
            store,
            gateway.clone(),
        ));
        Self {
            config,
            coordinator,
            gateway,
            ws_metrics,
            http_metrics: HttpMetrics::default(),
            system_metrics: SystemMetrics::new(),
            ws_connections: Mutex::new(WsConnectionTracker::default()),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub(crate) fn gateway(&self) -> &SocketGateway {
        &self.gateway
    }

    pub(crate) fn ws_metrics(&self) -> &WsMetrics {
        &self.ws_metrics
    }

    pub fn ws_metrics_snapshot(&self) -> WsMetricsSnapshot {
        self.ws_metrics.snapshot()
    }

    pub(crate) fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    pub fn http_metrics_snapshot(&self) -> HttpMetricsSnapshot {
        self.http_metrics.snapshot()
    }

    pub fn system_metrics_snapshot(&self) -> SystemMetricsSnapshot {
        self.system_metrics.snapshot()
    }

    pub fn lobby_snapshot(&self) -> LobbySnapshot {
        self.coordinator.snapshot()
    }

    fn connections(&self) -> MutexGuard<'_, WsConnectionTracker> {
        match self.ws_connections.lock() {
            Ok(tracker) => tracker,
            Err(poisoned) => {
                tracing::warn!("WebSocket connection tracker lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn try_acquire_ws_connection(
        self: &Arc<Self>,
        ip: IpAddr,
    ) -> Result<WsConnectionGuard, WsConnectionRejection> {
        // Environment variables override config
        let max_total = env_parse::<usize>("RATE_LIMIT_WS_CONNECTIONS")
            .or(self.config.ws_max_connections)
            .filter(|limit| *limit > 0);
        let max_per_ip = env_parse::<usize>("RATE_LIMIT_WS_CONNECTIONS_PER_IP")
            .or(self.config.ws_max_connections_per_ip)
            .filter(|limit| *limit > 0);
        let mut tracker = self.connections();

        if let Some(limit) = max_total {
            if tracker.total >= limit {
                self.ws_metrics.inc_connection_reject_global();
                return Err(WsConnectionRejection::GlobalLimit);
            }
        }

        let current_ip = tracker.per_ip.get(&ip).copied().unwrap_or(0);
        if let Some(limit) = max_per_ip {
            if current_ip >= limit {
                self.ws_metrics.inc_connection_reject_per_ip();
                return Err(WsConnectionRejection::PerIpLimit);
            }
        }

        tracker.total = tracker.total.saturating_add(1);
        tracker.per_ip.insert(ip, current_ip.saturating_add(1));
        Ok(WsConnectionGuard {
            server: Arc::clone(self),
            ip,
        })
    }

    fn release_ws_connection(&self, ip: IpAddr) {
        let mut tracker = self.connections();
        tracker.total = tracker.total.saturating_sub(1);
        match tracker.per_ip.get_mut(&ip) {
            Some(count) if *count > 1 => {
                *count -= 1;
            }
            Some(_) => {
                tracker.per_ip.remove(&ip);
            }
            None => {}
        }
    }
}
