//! REST + SSE surface (§6): an OpenAPI-annotated router in this workspace's
//! usual shape, generalized from a single CRUD service to `CloudManager`'s
//! lifecycle operations plus a long-lived event stream.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use axum_helpers::{
    errors::responses::{
        BadRequestValidationResponse, InternalServerErrorResponse, NotFoundResponse, PaymentRequiredResponse,
        ServiceUnavailableResponse, TooManyRequestsResponse,
    },
    extract_ip_from_headers, extract_user_agent, AuditEvent, AuditOutcome,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc, time::Duration};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::CloudControlResult,
    manager::CloudManager,
    models::{CloudInstance, CloudInstanceFilter, CloudQuota, CommandResult, ConnectionInfo, ListInstancesResponse, ProvisionRequest},
};

/// OpenAPI documentation for the cloud control API.
#[derive(OpenApi)]
#[openapi(
    paths(
        create_instance,
        list_instances,
        get_instance,
        terminate_instance,
        start_instance,
        stop_instance,
        get_connection_info,
        get_logs,
        execute_command,
        get_quota,
    ),
    components(
        schemas(
            CloudInstance,
            CloudInstanceFilter,
            ProvisionRequest,
            ListInstancesResponse,
            ConnectionInfo,
            LogsResponse,
            ExecRequest,
            CommandResult,
            CloudQuota,
        ),
        responses(
            NotFoundResponse,
            BadRequestValidationResponse,
            InternalServerErrorResponse,
            TooManyRequestsResponse,
            PaymentRequiredResponse,
            ServiceUnavailableResponse,
        )
    ),
    tags(
        (name = "cloud", description = "Cloud instance provisioning and lifecycle management")
    )
)]
pub struct ApiDoc;

/// `GET /cloud/instances/{id}/logs` response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct LogsResponse {
    pub instance_id: Uuid,
    pub lines: usize,
    pub logs: String,
}

/// `POST /cloud/instances/{id}/exec` request body.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ExecRequest {
    #[validate(length(min = 1))]
    pub command: String,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct LogsQuery {
    #[serde(default = "default_log_lines")]
    pub lines: usize,
}

fn default_log_lines() -> usize {
    200
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct QuotaQuery {
    pub team_id: String,
}

/// Builds the `/cloud` router.
pub fn router(manager: CloudManager) -> Router {
    let manager = Arc::new(manager);

    Router::new()
        .route("/instances", post(create_instance).get(list_instances))
        .route("/instances/{id}", get(get_instance).delete(terminate_instance))
        .route("/instances/{id}/start", post(start_instance))
        .route("/instances/{id}/stop", post(stop_instance))
        .route("/instances/{id}/connect", get(get_connection_info))
        .route("/instances/{id}/logs", get(get_logs))
        .route("/instances/{id}/exec", post(execute_command))
        .route("/quota", get(get_quota))
        .route("/events", get(stream_events))
        .with_state(manager)
}

/// Provision a new cloud instance.
#[utoipa::path(
    post,
    path = "/cloud/instances",
    tag = "cloud",
    request_body = ProvisionRequest,
    responses(
        (status = 201, description = "Instance provisioning started", body = CloudInstance),
        (status = 400, response = BadRequestValidationResponse),
        (status = 402, response = PaymentRequiredResponse),
        (status = 429, response = TooManyRequestsResponse),
        (status = 503, response = ServiceUnavailableResponse),
        (status = 500, response = InternalServerErrorResponse),
    )
)]
async fn create_instance(
    State(manager): State<Arc<CloudManager>>,
    headers: HeaderMap,
    Json(request): Json<ProvisionRequest>,
) -> CloudControlResult<impl IntoResponse> {
    request
        .validate()
        .map_err(|e| crate::error::CloudControlError::InvalidState(e.to_string()))?;

    let instance = manager.create(request).await?;

    AuditEvent::new(
        None,
        "cloud_instance.create",
        Some(format!("cloud_instance:{}", instance.id)),
        AuditOutcome::Success,
    )
    .with_ip(extract_ip_from_headers(&headers))
    .with_user_agent(extract_user_agent(&headers))
    .with_details(serde_json::json!({
        "platform": instance.platform,
        "team_id": instance.team_id,
        "bot_package": instance.bot_package,
    }))
    .log();

    Ok((StatusCode::CREATED, Json(instance)))
}

/// List cloud instances with optional filters.
#[utoipa::path(
    get,
    path = "/cloud/instances",
    tag = "cloud",
    params(CloudInstanceFilter),
    responses(
        (status = 200, description = "Matching instances", body = ListInstancesResponse),
        (status = 500, response = InternalServerErrorResponse),
    )
)]
async fn list_instances(
    State(manager): State<Arc<CloudManager>>,
    Query(filter): Query<CloudInstanceFilter>,
) -> CloudControlResult<impl IntoResponse> {
    let instances = manager.list(&filter).await?;
    Ok(Json(ListInstancesResponse {
        count: instances.len(),
        instances,
        filters: filter,
    }))
}

/// Get a single cloud instance.
#[utoipa::path(
    get,
    path = "/cloud/instances/{id}",
    tag = "cloud",
    params(("id" = Uuid, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Instance found", body = CloudInstance),
        (status = 404, response = NotFoundResponse),
        (status = 500, response = InternalServerErrorResponse),
    )
)]
async fn get_instance(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<Uuid>,
) -> CloudControlResult<impl IntoResponse> {
    let instance = manager.get(id).await?;
    Ok(Json(instance))
}

/// Terminate a cloud instance (irreversible).
#[utoipa::path(
    delete,
    path = "/cloud/instances/{id}",
    tag = "cloud",
    params(("id" = Uuid, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Instance terminated", body = CloudInstance),
        (status = 404, response = NotFoundResponse),
        (status = 500, response = InternalServerErrorResponse),
    )
)]
async fn terminate_instance(
    State(manager): State<Arc<CloudManager>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> CloudControlResult<impl IntoResponse> {
    let instance = manager.terminate(id).await?;

    AuditEvent::new(None, "cloud_instance.terminate", Some(format!("cloud_instance:{id}")), AuditOutcome::Success)
        .with_ip(extract_ip_from_headers(&headers))
        .with_user_agent(extract_user_agent(&headers))
        .log();

    Ok(Json(instance))
}

/// Start a stopped cloud instance.
#[utoipa::path(
    post,
    path = "/cloud/instances/{id}/start",
    tag = "cloud",
    params(("id" = Uuid, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Instance started", body = CloudInstance),
        (status = 404, response = NotFoundResponse),
        (status = 500, response = InternalServerErrorResponse),
    )
)]
async fn start_instance(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<Uuid>,
) -> CloudControlResult<impl IntoResponse> {
    let instance = manager.start(id).await?;
    Ok(Json(instance))
}

/// Stop a running cloud instance.
#[utoipa::path(
    post,
    path = "/cloud/instances/{id}/stop",
    tag = "cloud",
    params(("id" = Uuid, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Instance stopped", body = CloudInstance),
        (status = 404, response = NotFoundResponse),
        (status = 500, response = InternalServerErrorResponse),
    )
)]
async fn stop_instance(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<Uuid>,
) -> CloudControlResult<impl IntoResponse> {
    let instance = manager.stop(id).await?;
    Ok(Json(instance))
}

/// Get connection details for a cloud instance.
#[utoipa::path(
    get,
    path = "/cloud/instances/{id}/connect",
    tag = "cloud",
    params(("id" = Uuid, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Connection info", body = ConnectionInfo),
        (status = 404, response = NotFoundResponse),
        (status = 500, response = InternalServerErrorResponse),
    )
)]
async fn get_connection_info(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<Uuid>,
) -> CloudControlResult<impl IntoResponse> {
    let info = manager.get_connection_info(id).await?;
    Ok(Json(info))
}

/// Tail logs from a cloud instance.
#[utoipa::path(
    get,
    path = "/cloud/instances/{id}/logs",
    tag = "cloud",
    params(("id" = Uuid, Path, description = "Instance ID"), LogsQuery),
    responses(
        (status = 200, description = "Log tail", body = LogsResponse),
        (status = 404, response = NotFoundResponse),
        (status = 500, response = InternalServerErrorResponse),
    )
)]
async fn get_logs(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> CloudControlResult<impl IntoResponse> {
    let logs = manager.get_logs(id, query.lines).await?;
    Ok(Json(LogsResponse {
        instance_id: id,
        lines: query.lines,
        logs,
    }))
}

/// Execute a one-off command inside a cloud instance.
#[utoipa::path(
    post,
    path = "/cloud/instances/{id}/exec",
    tag = "cloud",
    params(("id" = Uuid, Path, description = "Instance ID")),
    request_body = ExecRequest,
    responses(
        (status = 200, description = "Command result", body = CommandResult),
        (status = 400, response = BadRequestValidationResponse),
        (status = 404, response = NotFoundResponse),
        (status = 500, response = InternalServerErrorResponse),
    )
)]
async fn execute_command(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ExecRequest>,
) -> CloudControlResult<impl IntoResponse> {
    request
        .validate()
        .map_err(|e| crate::error::CloudControlError::InvalidState(e.to_string()))?;

    let result = manager.execute_command(id, &request.command).await?;
    Ok(Json(result))
}

/// Get a team's current billing quota and usage.
#[utoipa::path(
    get,
    path = "/cloud/quota",
    tag = "cloud",
    params(QuotaQuery),
    responses(
        (status = 200, description = "Team quota", body = CloudQuota),
        (status = 500, response = InternalServerErrorResponse),
    )
)]
async fn get_quota(
    State(manager): State<Arc<CloudManager>>,
    Query(query): Query<QuotaQuery>,
) -> CloudControlResult<impl IntoResponse> {
    let quota = manager.get_quota(&query.team_id).await?;
    Ok(Json(quota))
}

/// Drops its `EventBus` subscription when the SSE connection closes, so a
/// disconnected client doesn't leak a channel entry forever.
struct Subscription {
    events: crate::event_bus::EventBus,
    id: Uuid,
    receiver: tokio::sync::mpsc::Receiver<crate::models::CloudEvent>,
}

impl Stream for Subscription {
    type Item = crate::models::CloudEvent;

    fn poll_next(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let events = self.events.clone();
        let id = self.id;
        tokio::spawn(async move { events.unsubscribe(id).await });
    }
}

/// `GET /cloud/events`: replays the last ≤20 buffered events, then streams
/// live publishes, with a keep-alive comment every ~30s (§6).
async fn stream_events(
    State(manager): State<Arc<CloudManager>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = manager.events().clone();
    let (subscriber_id, receiver) = events.subscribe().await;
    let backlog = events.recent(20).await;

    let subscription = Subscription {
        events,
        id: subscriber_id,
        receiver,
    };

    let backlog_stream = tokio_stream::iter(backlog);
    let stream = backlog_stream.chain(subscription).map(|event| {
        Ok(Event::default()
            .id(event.id.to_string())
            .event(event.event_type.to_string())
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().event("error")))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("keep-alive"))
}
