//! HTTP surface.
//!
//! Handlers translate requests into engine, coordinator and availability
//! calls. Store mutations run on a spawned task so a client that hangs up
//! cannot drop a commit halfway through.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use chrono::{NaiveDate, NaiveTime};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::availability::{service_rotations, SlotOption};
use crate::coordinator::{AssignError, AssignOutcome, Trigger};
use crate::engine::{now_ms, EngineError, ErrorClass, HoldRequest};
use crate::limits::MAX_HOLD_TTL_MS;
use crate::model::{Assignment, Booking, BookingStatus, Contact, Event, Hold, Ms, SeatingPreference};
use crate::observability;
use crate::policy::{PolicyError, ServiceKey, VenuePolicy};
use crate::registry::{Registry, Venue};
use crate::window::{assert_not_in_past, compute_booking_window, parse_time, WindowError};

// ── Errors ───────────────────────────────────────────────────────

/// Error body: `{ "code": ..., "message": ..., "details": ... }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match e.class() {
            ErrorClass::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Repository => {
                error!(error = %e, "store failure");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        let details = match &e {
            EngineError::TransitionNotAllowed { from, allowed, .. } => {
                Some(json!({ "from": from, "allowed_targets": allowed }))
            }
            EngineError::VersionConflict { expected, actual } => {
                Some(json!({ "expected": expected, "actual": actual }))
            }
            EngineError::HoldMetadataIncomplete { missing, .. } => Some(json!({ "missing": missing })),
            EngineError::PolicyDrift { quoted, current } => {
                Some(json!({ "quoted": quoted, "current": current }))
            }
            _ => None,
        };
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
            details,
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(e: PolicyError) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "INVALID_POLICY", e.to_string())
    }
}

impl From<WindowError> for ApiError {
    fn from(e: WindowError) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.code(), e.to_string())
    }
}

impl From<AssignError> for ApiError {
    fn from(e: AssignError) -> Self {
        match e {
            AssignError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, e.code(), e.to_string()),
            AssignError::Window(w) => w.into(),
            AssignError::Rejected(inner) | AssignError::Repository(inner) => inner.into(),
            AssignError::NoCapacity { ref attempts } => {
                let details = json!({ "attempts": attempts });
                Self::new(StatusCode::CONFLICT, e.code(), e.to_string()).with_details(details)
            }
            AssignError::Timeout { ref attempts, elapsed_ms } => {
                let details = json!({ "attempts": attempts, "elapsed_ms": elapsed_ms });
                Self::new(StatusCode::SERVICE_UNAVAILABLE, e.code(), e.to_string()).with_details(details)
            }
            AssignError::Cancelled => Self::new(StatusCode::SERVICE_UNAVAILABLE, e.code(), e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "code": self.code, "message": self.message });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run `fut` on its own task and wait for it.
async fn detached<T, F>(fut: F) -> ApiResult<T>
where
    F: Future<Output = ApiResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| ApiError::internal(format!("request task failed: {e}")))?
}

fn venue(registry: &Registry, id: &Ulid) -> ApiResult<Arc<Venue>> {
    registry.get(id).ok_or_else(|| {
        ApiError::new(StatusCode::NOT_FOUND, "RESTAURANT_NOT_FOUND", format!("restaurant not found: {id}"))
    })
}

fn required<T>(value: Option<T>, code: &'static str, field: &str) -> ApiResult<T> {
    value.ok_or_else(|| ApiError::bad_request(code, format!("{field} is required")))
}

fn parse_date(raw: &str) -> ApiResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request("INVALID_DATE", format!("invalid date: {raw}")))
}

fn parse_time_of_day(raw: &str) -> ApiResult<NaiveTime> {
    parse_time(raw).ok_or_else(|| ApiError::bad_request("INVALID_TIME", format!("invalid time: {raw}")))
}

// ── Router ───────────────────────────────────────────────────────

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/restaurants/{restaurant_id}/availability", get(availability))
        .route("/restaurants/{restaurant_id}/slots", get(slots))
        .route("/restaurants/{restaurant_id}/bookings", post(create_booking))
        .route("/restaurants/{restaurant_id}/bookings/{booking_id}", get(get_booking))
        .route("/restaurants/{restaurant_id}/bookings/{booking_id}/status", patch(update_status))
        .route("/restaurants/{restaurant_id}/bookings/{booking_id}/assign", post(assign_booking))
        .route("/restaurants/{restaurant_id}/holds", post(place_hold))
        .route("/restaurants/{restaurant_id}/holds/{hold_id}", axum::routing::delete(release_hold))
        .route("/internal/holds/{hold_id}/confirm", post(confirm_hold))
        .route("/restaurants/{restaurant_id}/policy", get(get_policy).put(replace_policy))
        .route("/restaurants/{restaurant_id}/capacity", get(capacity))
        .route("/restaurants/{restaurant_id}/events", get(events))
        .route_layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let started = Instant::now();
    let response = next.run(req).await;
    metrics::counter!(
        observability::HTTP_REQUESTS_TOTAL,
        "route" => route.clone(),
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    metrics::histogram!(observability::HTTP_REQUEST_DURATION_SECONDS, "route" => route)
        .record(started.elapsed().as_secs_f64());
    response
}

async fn health(State(registry): State<Arc<Registry>>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "restaurants": registry.venues().len() }))
}

// ── Availability ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AvailabilityParams {
    date: Option<String>,
    time: Option<String>,
    party_size: Option<u32>,
    #[serde(default)]
    seating_preference: SeatingPreference,
}

async fn availability(
    State(registry): State<Arc<Registry>>,
    Path(restaurant_id): Path<Ulid>,
    Query(params): Query<AvailabilityParams>,
) -> ApiResult<impl IntoResponse> {
    let venue = venue(&registry, &restaurant_id)?;
    let date = parse_date(&required(params.date, "DATE_REQUIRED", "date")?)?;
    let time = parse_time_of_day(&required(params.time, "TIME_REQUIRED", "time")?)?;
    let party_size = required(params.party_size, "PARTY_SIZE_REQUIRED", "party_size")?;

    let report = venue
        .check_slot(date, time, party_size, params.seating_preference)
        .await?;
    Ok(Json(report))
}

async fn slots(
    State(registry): State<Arc<Registry>>,
    Path(restaurant_id): Path<Ulid>,
    Query(params): Query<AvailabilityParams>,
) -> ApiResult<impl IntoResponse> {
    let venue = venue(&registry, &restaurant_id)?;
    let date = parse_date(&required(params.date, "DATE_REQUIRED", "date")?)?;
    let party_size = required(params.party_size, "PARTY_SIZE_REQUIRED", "party_size")?;

    let slots = venue
        .available_slots(date, party_size, params.seating_preference)
        .await?;
    Ok(Json(json!({ "date": date, "party_size": party_size, "slots": slots })))
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateBookingBody {
    date: Option<String>,
    time: Option<String>,
    party_size: Option<u32>,
    /// Service to book into. Inferred from the time when absent.
    booking_type: Option<ServiceKey>,
    #[serde(default)]
    seating_preference: SeatingPreference,
    #[serde(default)]
    contact: Contact,
}

/// What happened to a new or re-assigned booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum BookingOutcome {
    Confirmed,
    PendingAllocation,
    NoCapacity,
    Unassigned,
}

#[derive(Debug, Serialize)]
struct BookingResponse {
    outcome: BookingOutcome,
    booking: Booking,
    assignment: Option<Assignment>,
    table_numbers: Vec<String>,
    alternatives: Vec<SlotOption>,
}

async fn create_booking(
    State(registry): State<Arc<Registry>>,
    Path(restaurant_id): Path<Ulid>,
    Json(body): Json<CreateBookingBody>,
) -> ApiResult<impl IntoResponse> {
    let venue = venue(&registry, &restaurant_id)?;
    let date = parse_date(&required(body.date, "DATE_REQUIRED", "date")?)?;
    let time = parse_time_of_day(&required(body.time, "TIME_REQUIRED", "time")?)?;
    let party_size = required(body.party_size, "PARTY_SIZE_REQUIRED", "party_size")?;

    let policy = venue.policy().await;
    let window = compute_booking_window(date, time, party_size, &policy, body.booking_type)?;
    if !venue.settings.allow_backdating {
        assert_not_in_past(window.dining.start, now_ms(), venue.settings.past_grace_minutes)?;
    }

    let booking = Booking {
        id: Ulid::new(),
        restaurant_id,
        date,
        start_time: time,
        end_time: time + chrono::Duration::minutes(i64::from(window.duration_minutes)),
        service: window.service,
        party_size,
        seating_preference: body.seating_preference,
        status: BookingStatus::Pending,
        assigned_zone: None,
        dining: window.dining,
        block: window.block,
        contact: body.contact,
        created_at: now_ms(),
        version: 0,
    };

    let cancel = registry.shutdown_token().child_token();
    let response = detached(async move {
        let booking = venue.engine.create_booking(booking).await?;
        if !venue.settings.auto_assign {
            return Ok(BookingResponse {
                outcome: BookingOutcome::Unassigned,
                booking,
                assignment: None,
                table_numbers: Vec::new(),
                alternatives: Vec::new(),
            });
        }
        let result = venue.plan_and_assign(booking.id, Trigger::Creation, cancel).await;
        assignment_response(&venue, booking, result).await
    })
    .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Shape an assignment run into a response. Exhaustion is an answer, not an
/// error: the caller gets the booking back with nearby open times.
async fn assignment_response(
    venue: &Venue,
    booking: Booking,
    result: Result<AssignOutcome, AssignError>,
) -> ApiResult<BookingResponse> {
    let current = |b: &Booking| venue.engine.booking(&b.id).unwrap_or_else(|| b.clone());
    match result {
        Ok(AssignOutcome::Assigned { assignment, .. }) | Ok(AssignOutcome::Noop { assignment }) => {
            Ok(BookingResponse {
                outcome: BookingOutcome::Confirmed,
                booking: current(&booking),
                table_numbers: venue.graph.numbers_of(&assignment.table_ids),
                assignment: Some(assignment),
                alternatives: Vec::new(),
            })
        }
        Ok(AssignOutcome::Deferred { booking }) => Ok(BookingResponse {
            outcome: BookingOutcome::PendingAllocation,
            booking,
            assignment: None,
            table_numbers: Vec::new(),
            alternatives: Vec::new(),
        }),
        Err(AssignError::NoCapacity { .. }) => {
            let alternatives = venue
                .check_slot(booking.date, booking.start_time, booking.party_size, booking.seating_preference)
                .await
                .map(|report| report.alternatives)
                .unwrap_or_default();
            Ok(BookingResponse {
                outcome: BookingOutcome::NoCapacity,
                booking: current(&booking),
                assignment: None,
                table_numbers: Vec::new(),
                alternatives,
            })
        }
        Err(e @ AssignError::Timeout { .. }) => {
            let booking_id = booking.id;
            let mut err = ApiError::from(e);
            if let Some(details) = err.details.as_mut() {
                details["booking_id"] = json!(booking_id);
            }
            Err(err)
        }
        Err(e) => Err(e.into()),
    }
}

async fn get_booking(
    State(registry): State<Arc<Registry>>,
    Path((restaurant_id, booking_id)): Path<(Ulid, Ulid)>,
) -> ApiResult<impl IntoResponse> {
    let venue = venue(&registry, &restaurant_id)?;
    let booking = venue
        .engine
        .booking(&booking_id)
        .ok_or(EngineError::BookingNotFound(booking_id))?;
    let assignments = venue.engine.assignments_for_booking(&booking_id);
    let table_numbers: Vec<String> = assignments
        .iter()
        .flat_map(|a| venue.graph.numbers_of(&a.table_ids))
        .collect();
    Ok(Json(json!({
        "booking": booking,
        "assignments": assignments,
        "table_numbers": table_numbers,
    })))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
    expected_version: Option<u64>,
}

async fn update_status(
    State(registry): State<Arc<Registry>>,
    Path((restaurant_id, booking_id)): Path<(Ulid, Ulid)>,
    Json(body): Json<StatusBody>,
) -> ApiResult<impl IntoResponse> {
    let venue = venue(&registry, &restaurant_id)?;
    let to: BookingStatus = body
        .status
        .parse()
        .map_err(|e: crate::model::UnknownStatus| {
            ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "UNKNOWN_STATUS", e.to_string())
        })?;
    let booking = detached(async move {
        Ok(venue
            .engine
            .transition_booking(booking_id, to, body.expected_version)
            .await?)
    })
    .await?;
    Ok(Json(booking))
}

async fn assign_booking(
    State(registry): State<Arc<Registry>>,
    Path((restaurant_id, booking_id)): Path<(Ulid, Ulid)>,
) -> ApiResult<impl IntoResponse> {
    let venue = venue(&registry, &restaurant_id)?;
    let cancel = registry.shutdown_token().child_token();
    let response = detached(async move {
        let booking = venue
            .engine
            .booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let result = venue.plan_and_assign(booking_id, Trigger::Manual, cancel).await;
        assignment_response(&venue, booking, result).await
    })
    .await?;
    Ok(Json(response))
}

// ── Holds ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HoldBody {
    table_ids: Vec<Ulid>,
    /// Hold for this booking's window. Otherwise `date`, `time` and
    /// `party_size` describe the window.
    booking_id: Option<Ulid>,
    date: Option<String>,
    time: Option<String>,
    party_size: Option<u32>,
    ttl_secs: Option<u64>,
}

async fn place_hold(
    State(registry): State<Arc<Registry>>,
    Path(restaurant_id): Path<Ulid>,
    Json(body): Json<HoldBody>,
) -> ApiResult<impl IntoResponse> {
    let venue = venue(&registry, &restaurant_id)?;
    let policy = venue.policy().await;

    let span = match body.booking_id {
        Some(booking_id) => {
            venue
                .engine
                .booking(&booking_id)
                .ok_or(EngineError::BookingNotFound(booking_id))?
                .block
        }
        None => {
            let date = parse_date(&required(body.date, "DATE_REQUIRED", "date")?)?;
            let time = parse_time_of_day(&required(body.time, "TIME_REQUIRED", "time")?)?;
            let party_size = required(body.party_size, "PARTY_SIZE_REQUIRED", "party_size")?;
            compute_booking_window(date, time, party_size, &policy, None)?.block
        }
    };
    let ttl_ms = match body.ttl_secs {
        Some(secs) => (secs as Ms).saturating_mul(1000).min(MAX_HOLD_TTL_MS),
        None => venue.settings.hold_ttl_ms,
    };
    let zone_id = body
        .table_ids
        .first()
        .and_then(|id| venue.graph.table(id))
        .map(|t| t.zone_id);

    let req = HoldRequest {
        table_ids: body.table_ids,
        span,
        ttl_ms,
        booking_id: body.booking_id,
        zone_id,
        policy_version: Some(policy.version),
    };
    let hold: Hold = detached(async move {
        let table_ids = req.table_ids.clone();
        match venue.engine.acquire_hold(req).await {
            Ok(hold) => Ok(hold),
            Err(e @ EngineError::Conflict { .. }) => {
                let conflicts = venue.engine.find_hold_conflicts(&table_ids, &span, now_ms()).await;
                Err(ApiError::from(e).with_details(json!({ "conflicts": conflicts })))
            }
            Err(e) => Err(e.into()),
        }
    })
    .await?;
    Ok((StatusCode::CREATED, Json(hold)))
}

async fn release_hold(
    State(registry): State<Arc<Registry>>,
    Path((restaurant_id, hold_id)): Path<(Ulid, Ulid)>,
) -> ApiResult<impl IntoResponse> {
    let venue = venue(&registry, &restaurant_id)?;
    let released = detached(async move { Ok(venue.engine.release_hold(hold_id).await?) }).await?;
    Ok(Json(json!({ "hold_id": hold_id, "released": released })))
}

#[derive(Debug, Deserialize)]
struct ConfirmBody {
    booking_id: Ulid,
    table_ids: Option<Vec<Ulid>>,
}

async fn confirm_hold(
    State(registry): State<Arc<Registry>>,
    Path(hold_id): Path<Ulid>,
    Json(body): Json<ConfirmBody>,
) -> ApiResult<impl IntoResponse> {
    let assignment = detached(async move {
        Ok(registry
            .confirm_hold(hold_id, body.booking_id, body.table_ids)
            .await?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

// ── Policy ───────────────────────────────────────────────────────

async fn get_policy(
    State(registry): State<Arc<Registry>>,
    Path(restaurant_id): Path<Ulid>,
) -> ApiResult<impl IntoResponse> {
    let venue = venue(&registry, &restaurant_id)?;
    Ok(Json(venue.policy().await))
}

/// Holds quoted under the previous version fail to confirm with `POLICY_DRIFT`.
async fn replace_policy(
    State(registry): State<Arc<Registry>>,
    Path(restaurant_id): Path<Ulid>,
    Json(policy): Json<VenuePolicy>,
) -> ApiResult<impl IntoResponse> {
    let venue = venue(&registry, &restaurant_id)?;
    let version = venue.replace_policy(policy).await?;
    Ok(Json(json!({ "restaurant_id": restaurant_id, "version": version })))
}

/// Covers each service can seat under the current policy.
async fn capacity(
    State(registry): State<Arc<Registry>>,
    Path(restaurant_id): Path<Ulid>,
) -> ApiResult<impl IntoResponse> {
    let venue = venue(&registry, &restaurant_id)?;
    let policy = venue.policy().await;
    let services: Vec<serde_json::Value> = policy
        .ordered_services()
        .map(|(service, _)| json!({ "service": service, "covers": service_rotations(&policy, service, &venue.graph) }))
        .collect();
    Ok(Json(json!({ "policy_version": policy.version, "services": services })))
}

// ── Events ───────────────────────────────────────────────────────

/// SSE name for events that leave the process. Outbox bookkeeping stays internal.
fn event_name(event: &Event) -> Option<&'static str> {
    Some(match event {
        Event::BookingCreated(_) => "booking_created",
        Event::BookingUpdated { .. } => "booking_updated",
        Event::HoldPlaced(_) => "hold_placed",
        Event::HoldReleased { .. } => "hold_released",
        Event::AssignmentCreated(_) => "assignment_created",
        Event::AssignmentRemoved { .. } => "assignment_removed",
        Event::OutboxEnqueued(_) | Event::OutboxUpdated { .. } | Event::OutboxKeyRetained { .. } => {
            return None;
        }
    })
}

/// Committed changes for one restaurant as server-sent events.
async fn events(
    State(registry): State<Arc<Registry>>,
    Path(restaurant_id): Path<Ulid>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, axum::Error>>>> {
    let venue = venue(&registry, &restaurant_id)?;
    let rx = registry.notify().subscribe(venue.id);
    info!(restaurant_id = %restaurant_id, "event stream opened");

    let stream = futures::stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Some(name) = event_name(&event) else { continue };
                    return Some((SseEvent::default().event(name).json_data(&event), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(restaurant_id = %restaurant_id, skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .take_until(registry.shutdown_token().cancelled_owned());
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request};
    use chrono::{Duration, Utc};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{Config, VenueConfig};
    use crate::model::*;
    use crate::outbox::LogSink;
    use crate::policy::VenuePolicy;

    struct TestApp {
        app: Router,
        restaurant_id: Ulid,
        tables: Vec<Ulid>,
        date: String,
    }

    fn app(name: &str, auto_assign: bool) -> TestApp {
        let dir = std::env::temp_dir().join("tablewise_test_http").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let zone = Zone { id: Ulid::new(), name: "Main".into(), outdoor: false };
        let tables: Vec<Table> = [2, 4]
            .into_iter()
            .enumerate()
            .map(|(i, capacity)| Table {
                id: Ulid::new(),
                number: (i + 1).to_string(),
                zone_id: zone.id,
                category: TableCategory::Dining,
                seating_type: SeatingType::Standard,
                min_party_size: 1,
                capacity,
                features: vec![],
                adjacent: vec![],
                active: true,
            })
            .collect();
        let venue = VenueConfig {
            id: Ulid::new(),
            name: "Test".into(),
            policy: VenuePolicy::default(),
            zones: vec![zone],
            tables: tables.clone(),
        };

        let mut config = Config::default();
        config.server.data_dir = dir;
        config.features.auto_assign = auto_assign;
        config.restaurants.push(venue.clone());
        let registry = Registry::from_config(Arc::new(config), Arc::new(LogSink)).unwrap();

        let tz = VenuePolicy::default().timezone;
        let date = (Utc::now() + Duration::days(3)).with_timezone(&tz).date_naive();
        TestApp {
            app: router(Arc::new(registry)),
            restaurant_id: venue.id,
            tables: tables.iter().map(|t| t.id).collect(),
            date: date.format("%Y-%m-%d").to_string(),
        }
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn booking_body(date: &str, time: &str, party_size: u32) -> Value {
        json!({
            "date": date,
            "time": time,
            "party_size": party_size,
            "contact": { "name": "Ada", "email": "ada@example.com" }
        })
    }

    #[tokio::test]
    async fn health() {
        let t = app("health", true);
        let (status, body) = send(&t.app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["restaurants"], 1);
    }

    #[tokio::test]
    async fn availability_requires_time() {
        let t = app("availability_time", true);
        let uri = format!("/restaurants/{}/availability?date={}&party_size=2", t.restaurant_id, t.date);
        let (status, body) = send(&t.app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "TIME_REQUIRED");

        let uri = format!("/restaurants/{}/availability?time=19:00&party_size=2", t.restaurant_id);
        let (_, body) = send(&t.app, Method::GET, &uri, None).await;
        assert_eq!(body["code"], "DATE_REQUIRED");
    }

    #[tokio::test]
    async fn availability_reports_open_slot() {
        let t = app("availability_open", true);
        let uri = format!(
            "/restaurants/{}/availability?date={}&time=19:00&party_size=2",
            t.restaurant_id, t.date
        );
        let (status, body) = send(&t.app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["available"], true);
        assert_eq!(body["tables"]["table_numbers"], json!(["1"]));
    }

    #[tokio::test]
    async fn unknown_restaurant_is_404() {
        let t = app("unknown_restaurant", true);
        let uri = format!("/restaurants/{}/bookings/{}", Ulid::new(), Ulid::new());
        let (status, body) = send(&t.app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "RESTAURANT_NOT_FOUND");
    }

    #[tokio::test]
    async fn booking_is_created_and_assigned() {
        let t = app("create_assigned", true);
        let uri = format!("/restaurants/{}/bookings", t.restaurant_id);
        let (status, body) = send(&t.app, Method::POST, &uri, Some(booking_body(&t.date, "19:00", 2))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["outcome"], "confirmed");
        assert_eq!(body["table_numbers"], json!(["1"]));
        assert_eq!(body["booking"]["status"], "confirmed");

        let booking_id = body["booking"]["id"].as_str().unwrap().to_string();
        let uri = format!("/restaurants/{}/bookings/{booking_id}", t.restaurant_id);
        let (status, body) = send(&t.app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["assignments"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn full_house_answers_with_alternatives() {
        let t = app("full_house", true);
        let uri = format!("/restaurants/{}/bookings", t.restaurant_id);
        for _ in 0..2 {
            let (_, body) = send(&t.app, Method::POST, &uri, Some(booking_body(&t.date, "19:00", 2))).await;
            assert_eq!(body["outcome"], "confirmed");
        }
        let (status, body) = send(&t.app, Method::POST, &uri, Some(booking_body(&t.date, "19:00", 2))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["outcome"], "no_capacity");
        assert_eq!(body["booking"]["status"], "pending");
        assert!(!body["alternatives"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn booking_outside_service_is_422() {
        let t = app("outside_service", true);
        let uri = format!("/restaurants/{}/bookings", t.restaurant_id);
        let (status, body) = send(&t.app, Method::POST, &uri, Some(booking_body(&t.date, "23:30", 2))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "INVALID_WINDOW");
    }

    #[tokio::test]
    async fn status_updates_follow_the_lifecycle() {
        let t = app("status", true);
        let uri = format!("/restaurants/{}/bookings", t.restaurant_id);
        let (_, body) = send(&t.app, Method::POST, &uri, Some(booking_body(&t.date, "13:00", 2))).await;
        let booking_id = body["booking"]["id"].as_str().unwrap().to_string();
        let version = body["booking"]["version"].as_u64().unwrap();
        let status_uri = format!("/restaurants/{}/bookings/{booking_id}/status", t.restaurant_id);

        let (status, body) = send(&t.app, Method::PATCH, &status_uri, Some(json!({ "status": "seated" }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "UNKNOWN_STATUS");

        let (status, body) = send(&t.app, Method::PATCH, &status_uri, Some(json!({ "status": "completed" }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "TRANSITION_NOT_ALLOWED");
        assert_eq!(body["details"]["allowed_targets"], json!(["confirmed", "checked_in", "cancelled", "no_show"]));

        let stale = json!({ "status": "checked_in", "expected_version": version + 5 });
        let (status, body) = send(&t.app, Method::PATCH, &status_uri, Some(stale)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "VERSION_CONFLICT");

        let fresh = json!({ "status": "checked_in", "expected_version": version });
        let (status, body) = send(&t.app, Method::PATCH, &status_uri, Some(fresh)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "checked_in");
    }

    #[tokio::test]
    async fn manual_hold_and_confirm() {
        let t = app("hold_confirm", false);
        let uri = format!("/restaurants/{}/bookings", t.restaurant_id);
        let (_, body) = send(&t.app, Method::POST, &uri, Some(booking_body(&t.date, "19:00", 2))).await;
        assert_eq!(body["outcome"], "unassigned");
        let booking_id = body["booking"]["id"].as_str().unwrap().to_string();

        let holds_uri = format!("/restaurants/{}/holds", t.restaurant_id);
        let hold_body = json!({ "table_ids": [t.tables[0]], "booking_id": booking_id });
        let (status, hold) = send(&t.app, Method::POST, &holds_uri, Some(hold_body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let hold_id = hold["id"].as_str().unwrap().to_string();

        // Same table, same window.
        let (status, body) = send(&t.app, Method::POST, &holds_uri, Some(hold_body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "HOLD_CONFLICT");
        assert_eq!(body["details"]["conflicts"][0]["claim_id"], hold["id"]);
        assert_eq!(body["details"]["conflicts"][0]["kind"], "hold");

        let confirm_uri = format!("/internal/holds/{hold_id}/confirm");
        let wrong = json!({ "booking_id": Ulid::new() });
        let (status, body) = send(&t.app, Method::POST, &confirm_uri, Some(wrong)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "HOLD_BOOKING_MISMATCH");

        let (status, assignment) =
            send(&t.app, Method::POST, &confirm_uri, Some(json!({ "booking_id": booking_id }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(assignment["table_ids"], json!([t.tables[0]]));

        let (status, body) =
            send(&t.app, Method::POST, &confirm_uri, Some(json!({ "booking_id": booking_id }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "HOLD_NOT_FOUND");
    }

    #[tokio::test]
    async fn released_hold_frees_the_table() {
        let t = app("hold_release", false);
        let holds_uri = format!("/restaurants/{}/holds", t.restaurant_id);
        let body = json!({ "table_ids": [t.tables[1]], "date": t.date, "time": "18:00", "party_size": 4 });
        let (status, hold) = send(&t.app, Method::POST, &holds_uri, Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);

        let release_uri = format!("{holds_uri}/{}", hold["id"].as_str().unwrap());
        let (status, released) = send(&t.app, Method::DELETE, &release_uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(released["released"], true);
        let (_, again) = send(&t.app, Method::DELETE, &release_uri, None).await;
        assert_eq!(again["released"], false);

        let (status, _) = send(&t.app, Method::POST, &holds_uri, Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn policy_update_invalidates_quoted_holds() {
        let t = app("policy_drift", false);
        let uri = format!("/restaurants/{}/bookings", t.restaurant_id);
        let (_, body) = send(&t.app, Method::POST, &uri, Some(booking_body(&t.date, "19:00", 2))).await;
        let booking_id = body["booking"]["id"].as_str().unwrap().to_string();

        let holds_uri = format!("/restaurants/{}/holds", t.restaurant_id);
        let hold_body = json!({ "table_ids": [t.tables[0]], "booking_id": booking_id });
        let (status, hold) = send(&t.app, Method::POST, &holds_uri, Some(hold_body)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(hold["policy_version"], 1);

        let policy_uri = format!("/restaurants/{}/policy", t.restaurant_id);
        let (status, policy) = send(&t.app, Method::GET, &policy_uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&t.app, Method::PUT, &policy_uri, Some(policy)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 2);

        let confirm_uri = format!("/internal/holds/{}/confirm", hold["id"].as_str().unwrap());
        let (status, body) =
            send(&t.app, Method::POST, &confirm_uri, Some(json!({ "booking_id": booking_id }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "POLICY_DRIFT");
        assert_eq!(body["details"], json!({ "quoted": 1, "current": 2 }));
    }

    #[tokio::test]
    async fn capacity_reports_covers_per_service() {
        let t = app("capacity", false);
        let (status, body) = send(&t.app, Method::GET, &format!("/restaurants/{}/capacity", t.restaurant_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["policy_version"], 1);
        assert_eq!(body["services"][0]["service"], "lunch");
        // Two lunch turns each at the two-top and the four-top.
        assert_eq!(body["services"][0]["covers"], 2 * 2 + 2 * 4);
        assert_eq!(body["services"][1]["service"], "dinner");
    }

    #[tokio::test]
    async fn invalid_policy_is_rejected() {
        let t = app("policy_invalid", false);
        let policy_uri = format!("/restaurants/{}/policy", t.restaurant_id);
        let (_, mut policy) = send(&t.app, Method::GET, &policy_uri, None).await;
        policy["service_order"] = json!(["drinks"]);
        let (status, body) = send(&t.app, Method::PUT, &policy_uri, Some(policy)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "INVALID_POLICY");
    }

    #[tokio::test]
    async fn event_stream_carries_committed_changes() {
        let t = app("events", false);
        let request = Request::builder()
            .uri(format!("/restaurants/{}/events", t.restaurant_id))
            .body(Body::empty())
            .unwrap();
        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        let mut stream = response.into_body();

        let uri = format!("/restaurants/{}/bookings", t.restaurant_id);
        let (status, _) = send(&t.app, Method::POST, &uri, Some(booking_body(&t.date, "19:00", 2))).await;
        assert_eq!(status, StatusCode::CREATED);

        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), stream.frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        assert!(text.contains("event: booking_created"), "{text}");
        assert!(text.contains("\"BookingCreated\""), "{text}");
    }
}
