use anyhow::Context as _;

use crate::dns::DnsCache;
use crate::state::{Source, SourceStats, SourceTable};
use axum::{
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub sources: Arc<SourceTable>,
    pub dns: Option<Arc<DnsCache>>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SourceLabels {
    address: String,
    ifindex: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FamilyLabels {
    family: String,
}

/// Renders the current table in the Prometheus text format.
///
/// The registry is rebuilt on every scrape so pruned sources disappear from
/// the exposition instead of lingering at their last value.
pub fn render_metrics(table: &SourceTable) -> Result<String, std::fmt::Error> {
    let mut registry = Registry::default();

    let packets = Family::<SourceLabels, Counter>::default();
    for entry in table.sources.iter() {
        let labels = SourceLabels {
            address: entry.key().address.to_string(),
            ifindex: entry.key().ifindex.to_string(),
        };
        packets.get_or_create(&labels).inc_by(entry.value().packets);
    }
    registry.register(
        "pacer_packets",
        "Packets observed per source address and ingress interface",
        packets,
    );

    let records = Family::<FamilyLabels, Counter>::default();
    for (family, counter) in [("ipv4", &table.ipv4_records), ("ipv6", &table.ipv6_records)] {
        records
            .get_or_create(&FamilyLabels {
                family: family.to_string(),
            })
            .inc_by(counter.load(Ordering::Relaxed));
    }
    registry.register(
        "pacer_records",
        "Classification records read from the ring buffer",
        records,
    );

    let malformed = Counter::<u64>::default();
    malformed.inc_by(table.malformed_records.load(Ordering::Relaxed));
    registry.register(
        "pacer_malformed_records",
        "Ring buffer entries that could not be decoded",
        malformed,
    );

    let sources = Gauge::<i64>::default();
    sources.set(table.sources.len() as i64);
    registry.register("pacer_sources", "Distinct sources currently tracked", sources);

    let mut buf = String::new();
    encode(&mut buf, &registry)?;
    Ok(buf)
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    reader_alive: bool,
    uptime_seconds: u64,
    sources: usize,
    total_records: u64,
}

#[derive(Serialize)]
pub struct SourceEntry {
    #[serde(flatten)]
    source: Source,
    #[serde(flatten)]
    stats: SourceStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
}

#[derive(Deserialize)]
pub struct SourcesParams {
    limit: Option<usize>,
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Builds the HTTP app. Every `allowed_ips` entry must parse as a CIDR; an
/// empty list leaves the API open.
pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> anyhow::Result<Router> {
    let mut app = Router::new()
        .route("/metrics", get(get_metrics))
        .route("/api/health", get(get_health))
        .route("/api/sources", get(get_sources));

    if !allowed_ips.is_empty() {
        let nets = allowed_ips
            .iter()
            .map(|s| {
                s.parse::<IpNet>()
                    .with_context(|| format!("invalid allowlist entry {s:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let nets = Arc::new(nets);
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    Ok(app.layer(TraceLayer::new_for_http()).with_state(state))
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        tracing::debug!("rejecting API request from {ip}");
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let reader_alive = state.sources.is_reader_alive();
    Json(HealthResponse {
        status: if reader_alive { "ok" } else { "degraded" }.to_string(),
        reader_alive,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        sources: state.sources.sources.len(),
        total_records: state.sources.total_records(),
    })
}

async fn get_sources(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SourcesParams>,
) -> Json<Vec<SourceEntry>> {
    let limit = params.limit.unwrap_or(50).min(1000);
    let entries = state
        .sources
        .top(limit)
        .into_iter()
        .map(|(source, stats)| SourceEntry {
            hostname: state
                .dns
                .as_ref()
                .and_then(|cache| cache.hostname(source.address)),
            source,
            stats,
        })
        .collect();
    Json(entries)
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_metrics(&state.sources) {
        Ok(body) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pacer_common::{ClassificationRecord, SourceAddress};
    use tower::ServiceExt;

    fn table() -> Arc<SourceTable> {
        let table = SourceTable::new();
        let a = ClassificationRecord {
            ifindex: 2,
            source: SourceAddress::V4([10, 0, 0, 1]),
        };
        let b = ClassificationRecord {
            ifindex: 3,
            source: SourceAddress::V6([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
        };
        table.update(&a, 10);
        table.update(&a, 20);
        table.update(&b, 30);
        Arc::new(table)
    }

    fn app_state() -> Arc<AppState> {
        Arc::new(AppState {
            sources: table(),
            dns: None,
            start_time: Instant::now(),
        })
    }

    #[test]
    fn test_render_metrics() {
        let body = render_metrics(&table()).unwrap();
        assert!(body.contains(r#"pacer_packets_total{address="10.0.0.1",ifindex="2"} 2"#));
        assert!(body.contains(r#"pacer_packets_total{address="2001:db8::1",ifindex="3"} 1"#));
        assert!(body.contains(r#"pacer_records_total{family="ipv4"} 2"#));
        assert!(body.contains(r#"pacer_records_total{family="ipv6"} 1"#));
        assert!(body.contains("pacer_malformed_records_total 0"));
        assert!(body.contains("pacer_sources 2"));
    }

    #[test]
    fn test_pruned_sources_leave_exposition() {
        let table = table();
        table.prune_stale(std::time::Duration::from_millis(5), 30);
        let body = render_metrics(&table).unwrap();
        assert!(!body.contains("10.0.0.1"));
        assert!(body.contains("pacer_sources 1"));
    }

    #[tokio::test]
    async fn test_sources_endpoint_orders_and_limits() {
        let Json(entries) = get_sources(
            State(app_state()),
            Query(SourcesParams { limit: Some(1) }),
        )
        .await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source.address.to_string(), "10.0.0.1");
        assert_eq!(entries[0].stats.packets, 2);
        assert!(entries[0].hostname.is_none());

        let json = serde_json::to_value(&entries[0]).unwrap();
        assert_eq!(json["ifindex"], 2);
        assert_eq!(json["packets"], 2);
        assert!(json.get("hostname").is_none());
    }

    #[tokio::test]
    async fn test_health() {
        let Json(health) = get_health(State(app_state())).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.sources, 2);
        assert_eq!(health.total_records, 3);
    }

    #[tokio::test]
    async fn test_health_reports_stopped_reader() {
        let state = app_state();
        state.sources.mark_reader_stopped();
        let Json(health) = get_health(State(state)).await;
        assert_eq!(health.status, "degraded");
        assert!(!health.reader_alive);
    }

    async fn status_from(app: Router, peer: &str) -> StatusCode {
        let mut req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let peer: SocketAddr = peer.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(peer));
        app.oneshot(req).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_allowlist_admits_peer_inside_cidr() {
        let app = router(app_state(), &["10.0.0.0/8".to_string()]).unwrap();
        assert_eq!(status_from(app, "10.1.2.3:40000").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_allowlist_rejects_peer_outside_cidr() {
        let app = router(
            app_state(),
            &["10.0.0.0/8".to_string(), "2001:db8::/32".to_string()],
        )
        .unwrap();
        assert_eq!(
            status_from(app.clone(), "192.168.1.1:40000").await,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_from(app, "[2001:db8::7]:40000").await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_no_allowlist_is_open() {
        let app = router(app_state(), &[]).unwrap();
        assert_eq!(status_from(app, "203.0.113.9:1").await, StatusCode::OK);
    }

    #[test]
    fn test_invalid_allowlist_entry_is_an_error() {
        let err = router(app_state(), &["not-a-cidr".to_string()]).unwrap_err();
        assert!(err.to_string().contains("not-a-cidr"));
    }
}
