use axum::{
    extract::{DefaultBodyLimit, Request, State as AxumState},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use governor::middleware::NoOpMiddleware;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::{GovernorConfig, GovernorConfigBuilder},
    key_extractor::SmartIpKeyExtractor,
    GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{env_flag, env_parse, Server, ServerConfig};

mod http;
mod ws;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

pub struct Api {
    server: Arc<Server>,
}

impl Api {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    pub fn router(&self) -> Router {
        let config = &self.server.config;
        let origins = OriginPolicy::from_env();
        let cors = origins.cors();

        let mut router = Router::new()
            .route("/healthz", get(http::healthz))
            .route("/ws", get(ws::lobby_ws))
            .route("/api/upload-profile-image", http::upload_route())
            .route("/api/get-profile-image/:id", get(http::get_profile_image))
            .route("/api/get-user-info/:id", get(http::get_user_info))
            .route("/api/get-user-money/:id", get(http::get_user_money))
            .route("/api/update-user-money", post(http::update_user_money))
            .route("/metrics/ws", get(http::ws_metrics))
            .route("/metrics/http", get(http::http_metrics))
            .route("/metrics/lobby", get(http::lobby_metrics))
            .route("/metrics/system", get(http::system_metrics))
            .nest_service("/uploads", ServeDir::new(config.upload_dir()));
        if let Some(governor) = rate_limit(config) {
            router = router.layer(GovernorLayer { config: governor });
        }
        let body_limit = match config.http_body_limit_bytes {
            Some(limit) if limit > 0 => DefaultBodyLimit::max(limit),
            _ => DefaultBodyLimit::disable(),
        };

        router
            .layer(cors)
            .layer(middleware::from_fn(move |req, next| {
                enforce_origin(origins.clone(), req, next)
            }))
            .layer(body_limit)
            .layer(middleware::from_fn_with_state(
                self.server.clone(),
                request_id,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self.server.clone())
    }
}

/// Browser origins accepted by the HTTP routes (`ALLOWED_HTTP_ORIGINS`, `*` for any).
#[derive(Clone)]
struct OriginPolicy {
    allowed: Arc<HashSet<String>>,
    any: bool,
    allow_missing: bool,
}

impl OriginPolicy {
    fn from_env() -> Self {
        let allowed: HashSet<String> = std::env::var("ALLOWED_HTTP_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();
        if allowed.is_empty() {
            tracing::warn!("ALLOWED_HTTP_ORIGINS is empty; browser requests will be rejected");
        }
        Self {
            any: allowed.contains("*"),
            allow_missing: env_flag("ALLOW_HTTP_NO_ORIGIN").unwrap_or(false),
            allowed: Arc::new(allowed),
        }
    }

    fn check(&self, origin: Option<&str>) -> Result<(), &'static str> {
        match origin {
            Some(origin) if self.any || self.allowed.contains(origin) => Ok(()),
            Some(_) => Err("Origin not allowed"),
            None if self.allow_missing => Ok(()),
            None => Err("Origin required"),
        }
    }

    fn cors(&self) -> CorsLayer {
        let allow_origin = if self.any {
            AllowOrigin::any()
        } else {
            AllowOrigin::list(self.allowed.iter().filter_map(|origin| {
                HeaderValue::from_str(origin)
                    .inspect_err(|_| tracing::warn!(%origin, "ignoring malformed allowed origin"))
                    .ok()
            }))
        };
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, REQUEST_ID])
            .expose_headers([REQUEST_ID])
    }
}

/// Per-IP limiter, built only when both the rate and the burst are positive.
/// `RATE_LIMIT_HTTP_PER_SEC` and `RATE_LIMIT_HTTP_BURST` override the config.
fn rate_limit(
    config: &ServerConfig,
) -> Option<Arc<GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>>> {
    let per_second = env_parse::<u64>("RATE_LIMIT_HTTP_PER_SEC")
        .or(config.http_rate_limit_per_second)
        .filter(|rate| *rate > 0)?;
    let burst = env_parse::<u32>("RATE_LIMIT_HTTP_BURST")
        .or(config.http_rate_limit_burst)
        .filter(|burst| *burst > 0)?;
    let period = Duration::from_nanos((1_000_000_000 / per_second).max(1));
    let governor = GovernorConfigBuilder::default()
        .period(period)
        .burst_size(burst)
        .key_extractor(SmartIpKeyExtractor)
        .finish();
    if governor.is_none() {
        tracing::warn!(per_second, burst, "rejected HTTP rate limit; requests are not limited");
    }
    governor.map(Arc::new)
}

async fn enforce_origin(policy: OriginPolicy, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if let Err(reason) = policy.check(origin) {
        return (StatusCode::FORBIDDEN, reason).into_response();
    }
    next.run(req).await
}

/// Tags each response with a request id and counts the rejections the outer layers produce.
async fn request_id(
    AxumState(server): AxumState<Arc<Server>>,
    req: Request,
    next: Next,
) -> Response {
    let id = req
        .headers()
        .get(&REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    match response.status() {
        StatusCode::FORBIDDEN => server.http_metrics().inc_reject_origin(),
        StatusCode::PAYLOAD_TOO_LARGE => server.http_metrics().inc_reject_body_limit(),
        StatusCode::TOO_MANY_REQUESTS => server.http_metrics().inc_reject_rate_limit(),
        _ => {}
    }
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    tracing::info!(
        request_id = %id,
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    use typerace_execution::MemoryStore;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_server() -> (Arc<Server>, SocketAddr, tempfile::TempDir) {
        std::env::set_var("ALLOW_HTTP_NO_ORIGIN", "1");
        let uploads = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            upload_dir: Some(uploads.path().to_path_buf()),
            http_rate_limit_per_second: None,
            ..ServerConfig::default()
        };
        let server = Arc::new(Server::new(config, Arc::new(MemoryStore::default())));
        let app = Api::new(server.clone()).router();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (server, addr, uploads)
    }

    /// Reads frames until one carries `event`.
    async fn wait_for(client: &mut Client, event: &str) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for event")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = frame {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["event"] == event {
                    return value;
                }
            }
        }
    }

    async fn send(client: &mut Client, value: Value) {
        client.send(Message::Text(value.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn socket_session_end_to_end() {
        let (server, addr, _uploads) = spawn_server().await;
        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        let connected = wait_for(&mut client, "connected").await;
        assert!(connected["data"]["connectionId"].is_string());

        client
            .send(Message::Text("not json".to_string()))
            .await
            .unwrap();
        let error = wait_for(&mut client, "actionError").await;
        assert_eq!(error["data"]["action"], "unknown");
        assert_eq!(error["data"]["code"], "INVALID_PAYLOAD");
        assert_eq!(server.ws_metrics_snapshot().parse_errors, 1);

        send(&mut client, json!({"event": "createRoom", "data": "sprint"})).await;
        send(&mut client, json!({"event": "getRooms"})).await;
        loop {
            let rooms = wait_for(&mut client, "updateRooms").await;
            if rooms["data"][0]["name"] == "sprint" {
                break;
            }
        }
        assert_eq!(server.lobby_snapshot().rooms, 1);

        client.close(None).await.unwrap();
        for _ in 0..100 {
            if server.lobby_snapshot().players == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = server.lobby_snapshot();
        assert_eq!(snapshot.players, 0);
        assert_eq!(snapshot.rooms, 0, "the only member left, so the room is gone");
    }

    #[test]
    fn origin_policy_rules() {
        let policy = OriginPolicy {
            allowed: Arc::new(HashSet::from(["https://typerace.example".to_string()])),
            any: false,
            allow_missing: false,
        };
        assert_eq!(policy.check(Some("https://typerace.example")), Ok(()));
        assert_eq!(policy.check(Some("https://evil.example")), Err("Origin not allowed"));
        assert_eq!(policy.check(None), Err("Origin required"));

        let open = OriginPolicy {
            allowed: Arc::new(HashSet::new()),
            any: true,
            allow_missing: true,
        };
        assert_eq!(open.check(Some("https://anything.example")), Ok(()));
        assert_eq!(open.check(None), Ok(()));
    }

    #[test]
    fn rate_limit_needs_rate_and_burst() {
        let config = ServerConfig {
            http_rate_limit_per_second: Some(10),
            http_rate_limit_burst: None,
            ..ServerConfig::default()
        };
        assert!(rate_limit(&config).is_none());
        let config = ServerConfig {
            http_rate_limit_per_second: Some(10),
            http_rate_limit_burst: Some(5),
            ..ServerConfig::default()
        };
        assert!(rate_limit(&config).is_some());
    }

    #[tokio::test]
    async fn healthz_over_http() {
        let (_, addr, _uploads) = spawn_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(
            &mut stream,
            b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
        let mut response = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut response)
            .await
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("x-request-id"));
        assert!(response.contains("\"ok\":true"));
    }
}
