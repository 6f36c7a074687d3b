//! HTTP request handlers.

use super::AppState;
use crate::anomaly::FeedbackSubmission;
use crate::db::{AnomalyFilter, AnomalyStatus, AnomalyType, GeoPoint, Reading, ReadingSource, Station};
use crate::error::CoreError;
use crate::stats::{GroupBy, StatisticsQuery};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

// ============================================================================
// Errors and parameter parsing
// ============================================================================

fn status_for(e: &CoreError) -> StatusCode {
    match e {
        CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::InvalidTransition { .. } | CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: CoreError) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        tracing::error!("Request failed: {}", e);
    }
    (status, Json(json!({ "error": e.kind(), "message": e.to_string() }))).into_response()
}

/// Parse a time parameter. Accepts RFC 3339, `YYYY-MM-DD HH:MM[:SS]`,
/// `YYYY-MM-DDTHH:MM[:SS]` and bare dates; naive values are taken as UTC.
pub fn parse_time_param(name: &str, s: &str) -> Result<DateTime<Utc>, CoreError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.and_utc());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }
    Err(CoreError::invalid(format!("{}: unrecognized time {:?}", name, s)))
}

fn opt_time(name: &str, s: &Option<String>) -> Result<Option<DateTime<Utc>>, CoreError> {
    s.as_deref()
        .filter(|v| !v.trim().is_empty())
        .map(|v| parse_time_param(name, v))
        .transpose()
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_statuses(raw: &str) -> Result<Vec<AnomalyStatus>, CoreError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<AnomalyStatus>().map_err(CoreError::InvalidInput))
        .collect()
}

// ============================================================================
// Health
// ============================================================================

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check() {
        Ok(()) => Json(json!({ "status": "healthy", "timestamp": Utc::now() })).into_response(),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "message": e.to_string(), "timestamp": Utc::now() })),
            )
                .into_response()
        }
    }
}

// ============================================================================
// API: Stations
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StationsQuery {
    #[serde(default)]
    pub region_code: Option<String>,
}

pub async fn handle_get_stations(
    State(state): State<AppState>,
    Query(query): Query<StationsQuery>,
) -> impl IntoResponse {
    let prefix = non_empty(query.region_code);
    match state.store.get_stations(prefix.as_deref()) {
        Ok(stations) => Json(stations).into_response(),
        Err(e) => error_response(e.into()),
    }
}

pub async fn handle_get_station(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    match state.store.get_station(&code) {
        Ok(station) => Json(station).into_response(),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateStationRequest {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub river_name: Option<String>,
    pub admin_region_code: String,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub latitude: Option<f64>,
}

impl CreateStationRequest {
    fn into_station(self) -> Result<Station, CoreError> {
        let code = self.code.trim().to_string();
        let name = self.name.trim().to_string();
        let admin_region_code = self.admin_region_code.trim().to_string();
        if code.is_empty() || name.is_empty() || admin_region_code.is_empty() {
            return Err(CoreError::invalid("code, name and admin_region_code are required"));
        }
        let location = GeoPoint::from_parts(self.longitude, self.latitude).map_err(CoreError::InvalidInput)?;
        Ok(Station {
            code,
            name,
            river_name: non_empty(self.river_name),
            admin_region_code,
            location,
        })
    }
}

pub async fn handle_create_station(
    State(state): State<AppState>,
    Json(req): Json<CreateStationRequest>,
) -> impl IntoResponse {
    let station = match req.into_station() {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };

    match state.store.add_station(&station) {
        Ok(()) => {
            tracing::info!("Registered station {} ({})", station.code, station.name);
            (StatusCode::CREATED, Json(station)).into_response()
        }
        Err(e) => error_response(e.into()),
    }
}

pub async fn handle_get_regions(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_regions() {
        Ok(regions) => Json(regions).into_response(),
        Err(e) => error_response(e.into()),
    }
}

// ============================================================================
// API: Readings
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

pub async fn handle_get_readings(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<ReadingsQuery>,
) -> impl IntoResponse {
    let (start, end) = match (opt_time("start", &query.start), opt_time("end", &query.end)) {
        (Ok(s), Ok(e)) => {
            let end = e.unwrap_or_else(Utc::now);
            (s.unwrap_or_else(|| end - ChronoDuration::hours(24)), end)
        }
        (Err(e), _) | (_, Err(e)) => return error_response(e),
    };
    if start > end {
        return error_response(CoreError::invalid("start must not be after end"));
    }

    if let Err(e) = state.store.get_station(&code) {
        return error_response(e.into());
    }
    match state.store.get_readings(&code, start, end) {
        Ok(readings) => Json(readings).into_response(),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub station_code: String,
    pub timestamp: String,
    pub value: f64,
    #[serde(default)]
    pub source: ReadingSource,
}

pub async fn handle_ingest_reading(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> impl IntoResponse {
    let timestamp = match parse_time_param("timestamp", &req.timestamp) {
        Ok(t) => t,
        Err(e) => return error_response(e),
    };
    let reading = Reading {
        station_code: req.station_code.trim().to_string(),
        timestamp,
        value: req.value,
        source: req.source,
    };

    match state.ledger.ingest(reading) {
        Ok(report) => (StatusCode::CREATED, Json(report)).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReclassifyRequest {
    pub station_code: String,
    pub timestamp: String,
}

pub async fn handle_reclassify(
    State(state): State<AppState>,
    Json(req): Json<ReclassifyRequest>,
) -> impl IntoResponse {
    let timestamp = match parse_time_param("timestamp", &req.timestamp) {
        Ok(t) => t,
        Err(e) => return error_response(e),
    };
    match state.ledger.reclassify(req.station_code.trim(), timestamp) {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// API: Anomalies
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AnomaliesQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(default)]
    pub station_code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub latest_per_station: Option<bool>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

/// One page of a listing.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub pages: usize,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    /// Slice `items` down to the requested 1-based page.
    pub fn from_items(items: Vec<T>, page: usize, page_size: usize) -> Self {
        let total = items.len();
        let pages = total.div_ceil(page_size);
        let items = items
            .into_iter()
            .skip(page.saturating_sub(1).saturating_mul(page_size))
            .take(page_size)
            .collect();
        Self {
            total,
            page,
            page_size,
            pages,
            items,
        }
    }
}

impl AnomaliesQuery {
    fn filter(&self) -> Result<AnomalyFilter, CoreError> {
        Ok(AnomalyFilter {
            statuses: match self.status.as_deref().map(str::trim) {
                None | Some("") => vec![AnomalyStatus::Open],
                Some("all") => Vec::new(),
                Some(raw) => parse_statuses(raw)?,
            },
            region_code: non_empty(self.region_code.clone()),
            station_code: non_empty(self.station_code.clone()),
            station_name: non_empty(self.name.clone()),
            start: opt_time("start", &self.start)?,
            end: opt_time("end", &self.end)?,
        })
    }

    fn paging(&self) -> Result<(usize, usize), CoreError> {
        let page = self.page.unwrap_or(1);
        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page < 1 {
            return Err(CoreError::invalid("page must be at least 1"));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(CoreError::invalid(format!(
                "page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok((page, page_size))
    }
}

pub async fn handle_list_anomalies(
    State(state): State<AppState>,
    Query(query): Query<AnomaliesQuery>,
) -> impl IntoResponse {
    let (filter, (page, page_size)) = match (query.filter(), query.paging()) {
        (Ok(f), Ok(p)) => (f, p),
        (Err(e), _) | (_, Err(e)) => return error_response(e),
    };

    match state.ledger.list(&filter, query.latest_per_station.unwrap_or(false)) {
        Ok(rows) => Json(Page::from_items(rows, page, page_size)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_get_anomaly(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.ledger.get(id) {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LookupQuery {
    pub station_code: String,
    pub timestamp: String,
    pub anomaly_type: String,
}

pub async fn handle_lookup_anomaly(
    State(state): State<AppState>,
    Query(query): Query<LookupQuery>,
) -> impl IntoResponse {
    let timestamp = match parse_time_param("timestamp", &query.timestamp) {
        Ok(t) => t,
        Err(e) => return error_response(e),
    };
    let anomaly_type = match query.anomaly_type.parse::<AnomalyType>() {
        Ok(t) => t,
        Err(e) => return error_response(CoreError::InvalidInput(e)),
    };
    match state.ledger.find(query.station_code.trim(), timestamp, anomaly_type) {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_submit_feedback(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<FeedbackSubmission>,
) -> impl IntoResponse {
    match state.ledger.submit_feedback(id, req) {
        Ok(record) => Json(record).into_response(),
        Err(e) => {
            if matches!(e, CoreError::InvalidTransition { .. }) {
                tracing::warn!("Feedback rejected for anomaly {}: {}", id, e);
            }
            error_response(e)
        }
    }
}

// ============================================================================
// API: Statistics
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StatisticsParams {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub region_level: Option<String>,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(default)]
    pub include_status: Option<String>,
    #[serde(default)]
    pub apply_corrections: Option<bool>,
}

impl StatisticsParams {
    fn into_query(self) -> Result<StatisticsQuery, CoreError> {
        let start = opt_time("start", &self.start)?.ok_or_else(|| CoreError::invalid("start is required"))?;
        let end = opt_time("end", &self.end)?.ok_or_else(|| CoreError::invalid("end is required"))?;
        let group_by = self
            .group_by
            .as_deref()
            .ok_or_else(|| CoreError::invalid("group_by is required"))?;
        let group_by = GroupBy::parse(group_by.trim(), self.region_level.as_deref().map(str::trim))?;
        let include_status = match self.include_status.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Some(parse_statuses(raw)?.into_iter().collect()),
            _ => None,
        };

        Ok(StatisticsQuery {
            region_code: non_empty(self.region_code),
            start,
            end,
            group_by,
            include_status,
            apply_corrections: self.apply_corrections.unwrap_or(false),
        })
    }
}

pub async fn handle_statistics(
    State(state): State<AppState>,
    Query(params): Query<StatisticsParams>,
) -> impl IntoResponse {
    let query = match params.into_query() {
        Ok(q) => q,
        Err(e) => return error_response(e),
    };
    match state.aggregator.statistics(&query) {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_summary(State(state): State<AppState>) -> impl IntoResponse {
    match state.aggregator.summary() {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierConfig, ServerConfig};
    use crate::db::Store;
    use axum::body::to_bytes;
    use serde_json::Value;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn test_state() -> (NamedTempFile, AppState) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let config = ServerConfig {
            classifier: ClassifierConfig {
                sampling_interval_secs: 60,
                gap_tolerance_secs: 30,
                ..Default::default()
            },
            ..Default::default()
        };
        (tmp, AppState::new(config, store))
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn register(state: &AppState, code: &str, region: &str) -> Response {
        let req = CreateStationRequest {
            code: code.to_string(),
            name: format!("Gauge {}", code),
            river_name: None,
            admin_region_code: region.to_string(),
            longitude: Some(80.5),
            latitude: Some(40.5),
        };
        handle_create_station(State(state.clone()), Json(req)).await.into_response()
    }

    async fn ingest(state: &AppState, code: &str, timestamp: &str, value: f64) -> Response {
        let req = IngestRequest {
            station_code: code.to_string(),
            timestamp: timestamp.to_string(),
            value,
            source: ReadingSource::Sensor,
        };
        handle_ingest_reading(State(state.clone()), Json(req)).await.into_response()
    }

    #[test]
    fn test_parse_time_param() {
        let expected = parse_time_param("t", "2025-10-10T08:00:00Z").unwrap();
        assert_eq!(parse_time_param("t", "2025-10-10 08:00").unwrap(), expected);
        assert_eq!(parse_time_param("t", "2025-10-10 08:00:00").unwrap(), expected);
        assert_eq!(parse_time_param("t", "2025-10-10T10:00:00+02:00").unwrap(), expected);
        assert_eq!(
            parse_time_param("t", "2025-10-10").unwrap(),
            parse_time_param("t", "2025-10-10 00:00").unwrap()
        );
        assert!(matches!(parse_time_param("t", "10/10/2025"), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_page_slicing() {
        let page = Page::from_items((1..=45).collect::<Vec<i32>>(), 3, 20);
        assert_eq!(page.total, 45);
        assert_eq!(page.pages, 3);
        assert_eq!(page.items, vec![41, 42, 43, 44, 45]);

        let beyond = Page::from_items(vec![1, 2], 5, 20);
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.pages, 1);
    }

    #[test]
    fn test_page_far_past_the_end() {
        let page = Page::from_items(vec![1, 2, 3], usize::MAX, 20);
        assert_eq!(page.total, 3);
        assert_eq!(page.page, usize::MAX);
        assert!(page.items.is_empty());

        let query = AnomaliesQuery {
            page: Some(usize::MAX),
            page_size: Some(MAX_PAGE_SIZE),
            ..Default::default()
        };
        assert_eq!(query.paging().unwrap(), (usize::MAX, MAX_PAGE_SIZE));
    }

    #[test]
    fn test_listing_defaults_to_open() {
        let filter = AnomaliesQuery::default().filter().unwrap();
        assert_eq!(filter.statuses, vec![AnomalyStatus::Open]);

        let all = AnomaliesQuery {
            status: Some("all".to_string()),
            ..Default::default()
        };
        assert!(all.filter().unwrap().statuses.is_empty());

        let terminal = AnomaliesQuery {
            status: Some("confirmed, rejected".to_string()),
            ..Default::default()
        };
        assert_eq!(
            terminal.filter().unwrap().statuses,
            vec![AnomalyStatus::Confirmed, AnomalyStatus::Rejected]
        );
    }

    #[tokio::test]
    async fn test_station_registration() {
        let (_tmp, state) = test_state();
        assert_eq!(register(&state, "ST001", "661101").await.status(), StatusCode::CREATED);
        assert_eq!(register(&state, "ST001", "661101").await.status(), StatusCode::CONFLICT);

        let half_located = CreateStationRequest {
            code: "ST002".to_string(),
            name: "Half".to_string(),
            river_name: None,
            admin_region_code: "661101".to_string(),
            longitude: Some(80.0),
            latitude: None,
        };
        let resp = handle_create_station(State(state.clone()), Json(half_located))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "invalid_input");

        let resp = handle_get_station(State(state.clone()), Path("NOPE".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = handle_get_regions(State(state.clone())).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body[0]["admin_region_code"], "661101");
        assert_eq!(body[0]["station_count"], 1);
    }

    #[tokio::test]
    async fn test_ingest_feedback_flow() {
        let (_tmp, state) = test_state();
        register(&state, "ST001", "661101").await;

        let resp = ingest(&state, "ST001", "2025-10-10 08:00", 512.0).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["detections"][0]["anomaly_type"], "out_of_range");
        assert_eq!(body["detections"][0]["outcome"], "created");
        let id = body["detections"][0]["id"].as_i64().unwrap();

        let dup = ingest(&state, "ST001", "2025-10-10 08:00", 1.0).await;
        assert_eq!(dup.status(), StatusCode::CONFLICT);

        let query = AnomaliesQuery {
            status: Some("open".to_string()),
            ..Default::default()
        };
        let resp = handle_list_anomalies(State(state.clone()), Query(query)).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["items"][0]["value"], 512.0);
        assert_eq!(body["items"][0]["station_name"], "Gauge ST001");

        let reject = FeedbackSubmission {
            decision: Some(crate::anomaly::Decision::Reject),
            note: Some("maintenance flush".to_string()),
            ..Default::default()
        };
        let resp = handle_submit_feedback(State(state.clone()), Path(id), Json(reject.clone()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "rejected");
        assert_eq!(body["feedback"]["note"], "maintenance flush");

        let resp = handle_submit_feedback(State(state.clone()), Path(id), Json(reject.clone()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["error"], "invalid_transition");

        let resp = handle_submit_feedback(State(state.clone()), Path(id + 100), Json(reject))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let lookup = LookupQuery {
            station_code: "ST001".to_string(),
            timestamp: "2025-10-10T08:00:00Z".to_string(),
            anomaly_type: "out_of_range".to_string(),
        };
        let resp = handle_lookup_anomaly(State(state.clone()), Query(lookup)).await.into_response();
        assert_eq!(body_json(resp).await["id"], id);
    }

    #[tokio::test]
    async fn test_statistics_endpoint() {
        let (_tmp, state) = test_state();
        register(&state, "ST001", "661101").await;
        ingest(&state, "ST001", "2025-10-10 08:00", 1.0).await;
        ingest(&state, "ST001", "2025-10-10 08:01", 3.0).await;
        ingest(&state, "ST001", "2025-10-11 08:00", 2.0).await;

        let params = StatisticsParams {
            start: Some("2025-10-10".to_string()),
            end: Some("2025-10-11 23:59".to_string()),
            group_by: Some("day".to_string()),
            ..Default::default()
        };
        let resp = handle_statistics(State(state.clone()), Query(params)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["groups"][0]["key"], "2025-10-10");
        assert_eq!(body["groups"][0]["reading_count"], 2);
        assert_eq!(body["groups"][1]["key"], "2025-10-11");
        assert_eq!(body["groups"][1]["reading_count"], 1);
        // The day gap flags the third reading.
        assert_eq!(body["groups"][1]["anomaly_count"]["open"], 1);
        assert_eq!(body["totals"]["reading_count"], 3);

        let bad = StatisticsParams {
            start: Some("2025-10-11".to_string()),
            end: Some("2025-10-10".to_string()),
            group_by: Some("day".to_string()),
            ..Default::default()
        };
        let resp = handle_statistics(State(state.clone()), Query(bad)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let unknown = StatisticsParams {
            start: Some("2025-10-10".to_string()),
            end: Some("2025-10-11".to_string()),
            group_by: Some("week".to_string()),
            ..Default::default()
        };
        let resp = handle_statistics(State(state.clone()), Query(unknown)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = handle_summary(State(state.clone())).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["open_count"], 1);
    }

    #[test]
    fn test_health_blocking() {
        let (_tmp, state) = test_state();
        let resp = tokio_test::block_on(handle_health(State(state))).into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
