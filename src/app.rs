use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::content::{ContentStore, InMemoryContentStore};
use crate::engine::{FlagEngine, MarkerWrite, Outcome, TracingNotifier};
use crate::models::{ContentId, RequestContext};
use crate::nonce;
use crate::notices::AdminNotices;
use crate::settings::SettingsStore;
use crate::window::{InMemoryWindowStore, WindowStore};
use anyhow::Result;
use chrono::{DateTime, Utc};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Form, Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use axum_extra::TypedHeader;
use constant_time_eq::constant_time_eq;
use headers::{authorization::Bearer, Authorization};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::sync::Mutex;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};

pub const PROBE_COOKIE: &str = "safeflag_probe";
pub const MARKER_COOKIE: &str = "sfrc_flags";
const MAX_BODY_BYTES: usize = 16 * 1024;
const PER_IP_LIMIT: u32 = 60; // per minute
const PER_IP_BURST: u32 = 10;
const MAX_RATE_LIMIT_ENTRIES: usize = 10_000;

#[derive(Clone)]
pub struct AppState {
    pub engine: FlagEngine,
    pub content: Arc<dyn ContentStore>,
    pub settings: Arc<SettingsStore>,
    pub notices: Arc<AdminNotices>,
    pub clock: Arc<dyn Clock>,
    pub nonce_secret: String,
    pub admin_token: String,
    pub trust_proxy: bool,
    pub throttle: Arc<RequestThrottle>,
}

#[derive(Debug, Clone, Copy)]
struct MinuteCount {
    minute: i64,
    count: u32,
}

#[derive(Debug, Default)]
pub struct RequestThrottle {
    counts: Mutex<HashMap<String, MinuteCount>>,
}

impl RequestThrottle {
    pub async fn allow(&self, address: &str, now: DateTime<Utc>) -> bool {
        let minute = now.timestamp().div_euclid(60);
        let mut counts = self.counts.lock().await;
        if counts.len() > MAX_RATE_LIMIT_ENTRIES {
            counts.retain(|_, c| c.minute == minute);
        }
        let slot = counts
            .entry(address.to_string())
            .and_modify(|c| {
                if c.minute != minute {
                    *c = MinuteCount { minute, count: 0 };
                }
            })
            .or_insert(MinuteCount { minute, count: 0 });
        if slot.count >= PER_IP_LIMIT + PER_IP_BURST {
            return false;
        }
        slot.count += 1;
        true
    }
}

impl AppState {
    pub fn in_memory(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let window = Arc::new(InMemoryWindowStore::new(clock.clone()));
        Self::new(config, clock, Arc::new(InMemoryContentStore::new()), window)
    }

    pub fn new(
        config: &Config,
        clock: Arc<dyn Clock>,
        content: Arc<dyn ContentStore>,
        window: Arc<dyn WindowStore>,
    ) -> Self {
        let notices = Arc::new(AdminNotices::new(clock.clone()));
        let settings = Arc::new(SettingsStore::new(config.settings, notices.clone()));
        let engine = FlagEngine::new(
            content.clone(),
            settings.clone(),
            window,
            Arc::new(TracingNotifier),
            config.engine.clone(),
        );
        Self {
            engine,
            content,
            settings,
            notices,
            clock,
            nonce_secret: config.nonce_secret.clone(),
            admin_token: config.admin_token.clone(),
            trust_proxy: config.trust_proxy,
            throttle: Arc::new(RequestThrottle::default()),
        }
    }
}

pub async fn run_server(config: Config) -> Result<()> {
    let state = AppState::in_memory(&config, Arc::new(SystemClock));
    // Same path as an administrator save, so a bad value leaves a notice.
    state.settings.save_threshold(config.settings.threshold).await;
    info!(
        enabled = config.settings.enabled,
        threshold = config.settings.threshold,
        grace = config.engine.grace,
        trust_proxy = config.trust_proxy,
        "Comment flagging configured"
    );

    let app = build_router(state);

    info!("Listening on {}", config.bind);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/comments/flag", post(flag_comment))
        .route("/comments/:id/flag", get(flag_status))
        .route("/admin/reports", get(list_reports))
        .route("/admin/comments/:id", put(register_comment))
        .route("/admin/comments/:id/release", post(release_comment))
        .route("/admin/notices", get(drain_notices))
        .route("/admin/settings", put(update_settings))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

type JsonReply = (StatusCode, Json<Value>);
type CookieReply = (StatusCode, CookieJar, Json<Value>);

#[derive(Debug, Deserialize)]
pub struct FlagForm {
    pub comment_id: Option<String>,
    pub sc_nonce: Option<String>,
}

async fn flag_comment(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    jar: CookieJar,
    Form(form): Form<FlagForm>,
) -> CookieReply {
    let ip = client_address(&state, connect_info, &headers);
    if !state.throttle.allow(&ip, state.clock.now()).await {
        warn!("Rate limit exceeded for {}", ip);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            jar,
            Json(json!({ "status": "rejected", "message": "Too many requests" })),
        );
    }

    let now = state.clock.now();
    let nonce_ok = form
        .sc_nonce
        .as_deref()
        .is_some_and(|n| nonce::verify(&state.nonce_secret, n, now));
    if !nonce_ok {
        warn!("Rejecting report from {}: missing or invalid nonce", ip);
        let outcome = Outcome::RejectedInvalid(state.engine.messages().invalid_nonce.clone());
        return outcome_reply(jar, &outcome);
    }

    let ctx = request_context(ip, &jar);
    let submission = state
        .engine
        .submit_report(form.comment_id.as_deref(), &ctx)
        .await;

    let jar = match submission.marker {
        Some(marker) => jar.add(marker_cookie(marker)),
        None => jar,
    };
    outcome_reply(jar, &submission.outcome)
}

async fn flag_status(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> CookieReply {
    let Some(id) = ContentId::parse(&raw_id) else {
        return (
            StatusCode::BAD_REQUEST,
            jar,
            Json(json!({ "error": "invalid comment id" })),
        );
    };
    match state.content.content_exists(id).await {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::NOT_FOUND,
                jar,
                Json(json!({ "error": "This comment does not exist." })),
            )
        }
        Err(e) => {
            error!("Failed to look up comment {}: {:?}", id, e);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                jar,
                Json(json!({ "error": "lookup failed" })),
            );
        }
    }

    let ip = client_address(&state, connect_info, &headers);
    let ctx = request_context(ip, &jar);
    let already_flagged = match state.engine.status(id, &ctx).await {
        Ok(flagged) => flagged,
        Err(e) => {
            error!("Failed to check flag status for {}: {:?}", id, e);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                jar,
                Json(json!({ "error": "status check failed" })),
            );
        }
    };
    let enabled = state.settings.snapshot().await.enabled;

    // Hand out the cookie probe so the next report can prove cookies work.
    let jar = if ctx.capability_probe {
        jar
    } else {
        jar.add(
            Cookie::build((PROBE_COOKIE, "1"))
                .path("/")
                .same_site(SameSite::Lax)
                .build(),
        )
    };

    (
        StatusCode::OK,
        jar,
        Json(json!({
            "comment_id": id,
            "enabled": enabled,
            "already_flagged": already_flagged,
            "nonce": nonce::issue(&state.nonce_secret, state.clock.now()),
        })),
    )
}

fn outcome_reply(jar: CookieJar, outcome: &Outcome) -> CookieReply {
    (
        StatusCode::OK,
        jar,
        Json(json!({ "status": outcome.as_str(), "message": outcome.message() })),
    )
}

fn marker_cookie(marker: MarkerWrite) -> Cookie<'static> {
    Cookie::build((MARKER_COOKIE, marker.value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(marker.ttl.num_seconds()))
        .build()
}

fn request_context(address: String, jar: &CookieJar) -> RequestContext {
    RequestContext {
        client_address: address,
        capability_probe: jar.get(PROBE_COOKIE).is_some(),
        marker: jar.get(MARKER_COOKIE).map(|c| c.value().to_string()),
    }
}

fn authorized(state: &AppState, auth: Option<TypedHeader<Authorization<Bearer>>>) -> bool {
    auth.is_some_and(|TypedHeader(Authorization(bearer))| {
        constant_time_eq(bearer.token().as_bytes(), state.admin_token.as_bytes())
    })
}

fn unauthorized() -> JsonReply {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "status": "error", "message": "Invalid or missing admin token" })),
    )
}

fn bad_id() -> JsonReply {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "error", "message": "invalid comment id" })),
    )
}

fn store_failure(context: &str, err: anyhow::Error) -> JsonReply {
    error!("{}: {:?}", context, err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "message": context })),
    )
}

async fn list_reports(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> JsonReply {
    if !authorized(&state, auth) {
        return unauthorized();
    }
    match state.content.list_reported().await {
        Ok(rows) => (StatusCode::OK, Json(json!({ "reports": rows }))),
        Err(e) => store_failure("Failed to list reported comments", e),
    }
}

async fn register_comment(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> JsonReply {
    if !authorized(&state, auth) {
        return unauthorized();
    }
    let Some(id) = ContentId::parse(&raw_id) else {
        return bad_id();
    };
    match state.content.register(id).await {
        Ok(true) => {
            info!("Registered comment {}", id);
            (StatusCode::CREATED, Json(json!({ "comment_id": id })))
        }
        Ok(false) => (StatusCode::OK, Json(json!({ "comment_id": id }))),
        Err(e) => store_failure("Failed to register comment", e),
    }
}

async fn release_comment(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> JsonReply {
    if !authorized(&state, auth) {
        return unauthorized();
    }
    let Some(id) = ContentId::parse(&raw_id) else {
        return bad_id();
    };
    match state.content.content_exists(id).await {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "status": "error", "message": "This comment does not exist." })),
            )
        }
        Err(e) => return store_failure("Failed to look up comment", e),
    }
    match state.engine.gate().release(id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "comment_id": id, "status": "visible", "moderated": true })),
        ),
        Err(e) => store_failure("Failed to release comment", e),
    }
}

async fn drain_notices(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> JsonReply {
    if !authorized(&state, auth) {
        return unauthorized();
    }
    let notices = state.notices.drain().await;
    (StatusCode::OK, Json(json!({ "notices": notices })))
}

#[derive(Debug, Deserialize)]
pub struct SettingsUpdate {
    pub enabled: Option<bool>,
    pub threshold: Option<i64>,
}

async fn update_settings(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Json(update): Json<SettingsUpdate>,
) -> JsonReply {
    if !authorized(&state, auth) {
        return unauthorized();
    }
    if let Some(enabled) = update.enabled {
        state.settings.set_enabled(enabled).await;
    }
    if let Some(threshold) = update.threshold {
        state.settings.save_threshold(threshold).await;
    }
    let settings = state.settings.snapshot().await;
    (
        StatusCode::OK,
        Json(json!({
            "enabled": settings.enabled,
            "threshold": settings.threshold,
            "notices": state.notices.pending().await,
        })),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}

fn client_address(
    state: &AppState,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
) -> String {
    if state.trust_proxy {
        if let Some(ip) = forwarded_ip(headers) {
            return ip.to_string();
        }
    }
    connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if let Some(single) = header("cf-connecting-ip").or_else(|| header("x-real-ip")) {
        return single.trim().parse().ok();
    }
    // Leading hops are client supplied; the trusted proxy appends the peer.
    header("x-forwarded-for")
        .and_then(|chain| chain.rsplit(',').next())
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::marker::ReportMap;
    use crate::models::Count;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use tower::util::ServiceExt;

    struct BrokenWindow;

    #[async_trait]
    impl WindowStore for BrokenWindow {
        async fn get(&self, _key: &str) -> Result<Option<ReportMap>> {
            anyhow::bail!("window backend unreachable")
        }

        async fn increment(&self, _key: &str, _id: ContentId, _ttl: chrono::Duration) -> Result<Count> {
            anyhow::bail!("window backend unreachable")
        }
    }

    fn config() -> Config {
        Config::from_lookup(|key: &str| match key {
            "SAFEFLAG_NONCE_SECRET" => Some("secret".to_string()),
            "SAFEFLAG_ADMIN_TOKEN" => Some("admin".to_string()),
            _ => None,
        })
        .expect("config")
    }

    #[tokio::test]
    async fn status_reports_unavailable_when_window_fails() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let content = Arc::new(InMemoryContentStore::new());
        let id = ContentId::new(3).expect("positive id");
        content.register(id).await.unwrap();
        let state = AppState::new(&config(), clock, content, Arc::new(BrokenWindow));

        let res = build_router(state)
            .oneshot(Request::get("/comments/3/flag").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn throttle_budget_resets_each_minute() {
        let throttle = RequestThrottle::default();
        let start = DateTime::from_timestamp(1_700_000_040, 0).expect("timestamp");
        for _ in 0..PER_IP_LIMIT + PER_IP_BURST {
            assert!(throttle.allow("192.0.2.1", start).await);
        }
        assert!(!throttle.allow("192.0.2.1", start).await);
        assert!(throttle.allow("192.0.2.2", start).await);
        assert!(throttle.allow("192.0.2.1", start + chrono::Duration::seconds(60)).await);
    }

    #[test]
    fn forwarded_ip_takes_hop_added_by_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.9.9.1, 203.0.113.9"),
        );
        assert_eq!(forwarded_ip(&headers), "203.0.113.9".parse().ok());

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(forwarded_ip(&headers), "198.51.100.4".parse().ok());

        headers.insert("x-real-ip", HeaderValue::from_static("not-an-ip"));
        assert_eq!(forwarded_ip(&headers), None);
    }

    #[test]
    fn marker_cookie_carries_lifetime() {
        let cookie = marker_cookie(MarkerWrite {
            value: "e30=".to_string(),
            ttl: chrono::Duration::days(7),
        });
        assert_eq!(cookie.name(), MARKER_COOKIE);
        assert_eq!(cookie.value(), "e30=");
        assert_eq!(cookie.max_age(), Some(time::Duration::days(7)));
        assert_eq!(cookie.http_only(), Some(true));
    }
}
