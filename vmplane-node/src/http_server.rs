//! REST transport for the control plane.
//!
//! Every route lives under `/api/v1` and maps onto one [`NodeService`]
//! operation. Operations that run as tasks answer `202 Accepted` with the
//! task id; callers follow up with `/tasks/:id/wait` or the update feed.
//! The caller's debug token travels in the `x-debug-token` header.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use vmplane_core::{
    mask_features, DeviceRef, Error, FeedBatch, HostStat, NodeService, Pci, TaskInfo, Vbd, Vif, Vm,
};
use vmplane_hypervisor::{
    DiskRef, LockingMode, MigrateOptions, NetworkBackend, PciConfig, VbdConfig, VifConfig, VmConfig,
};

/// Header carrying the caller's debug token.
pub const DEBUG_HEADER: &str = "x-debug-token";

/// Longest a single request may block on a task or the update feed.
const MAX_WAIT: Duration = Duration::from_secs(300);

/// Shared state for HTTP handlers
pub struct AppState {
    pub service: NodeService,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct ApiError {
    /// Machine-readable error code
    error: String,
    message: String,
    /// The full error, when it came from the control plane
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
}

impl ApiError {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            detail: None,
        }
    }
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// HTTP status for a control-plane error.
fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::DoesNotExist { .. } => StatusCode::NOT_FOUND,
        Error::AlreadyExists { .. }
        | Error::BadPowerState { .. }
        | Error::DomainNotBuilt { .. }
        | Error::DeviceAlreadyConnected { .. }
        | Error::DeviceNotConnected { .. }
        | Error::DeviceDetachRejected { .. }
        | Error::MediaNotEjectable { .. }
        | Error::MediaPresent { .. }
        | Error::MediaNotPresent { .. }
        | Error::TaskInProgress { .. } => StatusCode::CONFLICT,
        Error::InvalidArgument { .. } | Error::InvalidVcpus { .. } | Error::InvalidMemoryRange { .. } => {
            StatusCode::BAD_REQUEST
        }
        Error::Unimplemented { .. } => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(e: Error) -> (StatusCode, Json<ApiError>) {
    let status = status_for(&e);
    let detail = serde_json::to_value(&e).ok();
    let code = detail
        .as_ref()
        .and_then(|d| d.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("internal")
        .to_string();

    if status.is_server_error() {
        warn!(error = %e, "Request failed");
    } else {
        debug!(error = %e, "Request rejected");
    }

    (
        status,
        Json(ApiError {
            error: code,
            message: e.to_string(),
            detail,
        }),
    )
}

fn bad_request(message: &str) -> (StatusCode, Json<ApiError>) {
    (StatusCode::BAD_REQUEST, Json(ApiError::new("invalid_argument", message)))
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskAccepted {
    task_id: String,
}

/// Answer for an operation that was admitted as a task.
fn accepted(result: vmplane_core::Result<String>) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    let task_id = result.map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

fn dbg(headers: &HeaderMap) -> String {
    headers
        .get(DEBUG_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http")
        .to_string()
}

fn wait_duration(timeout_ms: u64) -> Duration {
    Duration::from_millis(timeout_ms).min(MAX_WAIT)
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PowerRequest {
    /// Ask the guest first and give up after this long
    deadline_secs: Option<f64>,
}

impl PowerRequest {
    fn deadline(&self) -> Result<Option<Duration>, (StatusCode, Json<ApiError>)> {
        match self.deadline_secs {
            None => Ok(None),
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(|_| bad_request("deadline_secs must be a non-negative number")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiskRequest {
    disk: DiskRef,
}

#[derive(Debug, Deserialize)]
struct MigrateRequest {
    destination: String,
    #[serde(default)]
    options: MigrateOptions,
}

#[derive(Debug, Deserialize)]
struct VcpusRequest {
    count: u32,
}

#[derive(Debug, Deserialize)]
struct MemoryRangeRequest {
    min_mib: u64,
    max_mib: u64,
}

#[derive(Debug, Deserialize)]
struct ShadowRequest {
    multiplier: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UnplugRequest {
    force: bool,
}

#[derive(Debug, Deserialize)]
struct MoveRequest {
    backend: NetworkBackend,
}

#[derive(Debug, Deserialize)]
struct CarrierRequest {
    carrier: bool,
}

#[derive(Debug, Deserialize)]
struct LockingRequest {
    mode: LockingMode,
}

#[derive(Debug, Deserialize)]
struct BarrierRequest {
    barrier_id: u64,
}

#[derive(Debug, Deserialize)]
struct WorkersRequest {
    size: usize,
}

#[derive(Debug, Deserialize)]
struct MaskRequest {
    features: String,
    mask: String,
}

#[derive(Debug, Deserialize)]
struct GarbageRequest {
    watermark: u64,
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    #[serde(default = "default_task_wait_ms")]
    timeout_ms: u64,
}

fn default_task_wait_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize)]
struct UpdatesQuery {
    #[serde(default)]
    from: u64,
    #[serde(default)]
    timeout_ms: u64,
}

// ============================================================================
// Server
// ============================================================================

/// Serve the REST API on `addr` until the listener fails.
pub async fn run_http_server(addr: SocketAddr, service: NodeService) -> anyhow::Result<()> {
    let app = build_router(service);

    info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the application router with all routes
pub fn build_router(service: NodeService) -> Router {
    let state = Arc::new(AppState { service });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let api_routes = Router::new()
        // Host
        .route("/host", get(get_host))
        .route("/host/console", get(get_host_console))
        .route("/host/memory", get(get_host_memory))
        .route("/host/workers", put(set_workers))
        .route("/host/features/mask", post(post_mask_features))
        // VMs
        .route("/vms", get(list_vms).post(add_vm))
        .route("/vms/import", post(import_vm))
        .route("/vms/:vm_id", get(get_vm).delete(remove_vm))
        .route("/vms/:vm_id/metadata", get(export_vm))
        .route("/vms/:vm_id/start", post(start_vm))
        .route("/vms/:vm_id/shutdown", post(shutdown_vm))
        .route("/vms/:vm_id/reboot", post(reboot_vm))
        .route("/vms/:vm_id/pause", post(pause_vm))
        .route("/vms/:vm_id/unpause", post(unpause_vm))
        .route("/vms/:vm_id/suspend", post(suspend_vm))
        .route("/vms/:vm_id/resume", post(resume_vm))
        .route("/vms/:vm_id/migrate", post(migrate_vm))
        .route("/vms/:vm_id/create", post(create_vm))
        .route("/vms/:vm_id/build", post(build_vm))
        .route("/vms/:vm_id/device-model", post(create_device_model))
        .route("/vms/:vm_id/destroy", post(destroy_vm))
        .route("/vms/:vm_id/vcpus", put(set_vcpus))
        .route("/vms/:vm_id/memory", put(set_memory))
        .route("/vms/:vm_id/shadow-multiplier", put(set_shadow_multiplier))
        .route("/vms/:vm_id/xsdata", put(set_xsdata))
        .route("/vms/:vm_id/refresh", post(refresh_vm))
        .route("/vms/:vm_id/barriers", post(inject_barrier))
        // VBDs
        .route("/vms/:vm_id/vbds", get(list_vbds).post(add_vbd))
        .route("/vms/:vm_id/vbds/:device", get(get_vbd).delete(remove_vbd))
        .route("/vms/:vm_id/vbds/:device/plug", post(plug_vbd))
        .route("/vms/:vm_id/vbds/:device/unplug", post(unplug_vbd))
        .route("/vms/:vm_id/vbds/:device/eject", post(eject_vbd))
        .route("/vms/:vm_id/vbds/:device/insert", post(insert_vbd))
        // VIFs
        .route("/vms/:vm_id/vifs", get(list_vifs).post(add_vif))
        .route("/vms/:vm_id/vifs/:device", get(get_vif).delete(remove_vif))
        .route("/vms/:vm_id/vifs/:device/plug", post(plug_vif))
        .route("/vms/:vm_id/vifs/:device/unplug", post(unplug_vif))
        .route("/vms/:vm_id/vifs/:device/move", post(move_vif))
        .route("/vms/:vm_id/vifs/:device/carrier", put(set_vif_carrier))
        .route("/vms/:vm_id/vifs/:device/locking-mode", put(set_vif_locking_mode))
        // PCI devices
        .route("/vms/:vm_id/pcis", get(list_pcis).post(add_pci))
        .route("/vms/:vm_id/pcis/:device", get(get_pci).delete(remove_pci))
        .route("/vms/:vm_id/pcis/:device/plug", post(plug_pci))
        .route("/vms/:vm_id/pcis/:device/unplug", post(unplug_pci))
        // Tasks
        .route("/tasks", get(list_tasks))
        .route("/tasks/:task_id", get(get_task).delete(destroy_task))
        .route("/tasks/:task_id/wait", get(wait_task))
        .route("/tasks/:task_id/cancel", post(cancel_task))
        // Update feed
        .route("/updates", get(get_updates))
        .route("/updates/last", get(get_last_update_id))
        .route("/updates/gc", post(collect_garbage))
        .route("/barriers/:barrier_id", delete(remove_barrier))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .fallback(api_fallback)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn api_fallback() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new("not_found", "No such endpoint. The API lives under /api/v1")),
    )
}

// ============================================================================
// Host Handlers
// ============================================================================

/// GET /api/v1/host - CPU, memory and worker pool of the host
async fn get_host(State(state): State<Arc<AppState>>) -> ApiResult<Json<HostStat>> {
    state.service.host_stat().await.map(Json).map_err(api_error)
}

/// GET /api/v1/host/console - Hypervisor console log
async fn get_host_console(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let data = state.service.get_console_data().await.map_err(api_error)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], data).into_response())
}

/// GET /api/v1/host/memory - Total host memory
async fn get_host_memory(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let total = state.service.get_total_memory_mib().await.map_err(api_error)?;
    Ok(Json(json!({ "total_memory_mib": total })))
}

/// PUT /api/v1/host/workers - Resize the worker pool
async fn set_workers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<WorkersRequest>,
) -> ApiResult<StatusCode> {
    state
        .service
        .set_worker_pool_size(&dbg(&headers), req.size)
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/host/features/mask - AND a CPU feature string with a mask
async fn post_mask_features(Json(req): Json<MaskRequest>) -> ApiResult<Json<Value>> {
    let features = mask_features(&req.features, &req.mask).map_err(api_error)?;
    Ok(Json(json!({ "features": features })))
}

// ============================================================================
// VM Handlers
// ============================================================================

/// GET /api/v1/vms - List VMs
async fn list_vms(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Vm>>> {
    state.service.list_vms().map(Json).map_err(api_error)
}

/// POST /api/v1/vms - Register a VM
async fn add_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(config): Json<VmConfig>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = state.service.add_vm(&dbg(&headers), config).map_err(api_error)?;
    info!(vm_id = %id, "VM added via HTTP API");
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// POST /api/v1/vms/import - Register a VM and its devices from exported metadata
async fn import_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = state
        .service
        .import_metadata(&dbg(&headers), &body)
        .map_err(api_error)?;
    info!(vm_id = %id, "VM imported via HTTP API");
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// GET /api/v1/vms/:vm_id - VM configuration and state
async fn get_vm(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult<Json<Vm>> {
    state.service.stat_vm(&vm_id).map(Json).map_err(api_error)
}

/// DELETE /api/v1/vms/:vm_id - Forget a halted VM
async fn remove_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.remove_vm(&dbg(&headers), &vm_id).map_err(api_error)?;
    info!(vm_id = %vm_id, "VM removed via HTTP API");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/vms/:vm_id/metadata - Export VM and device configuration
async fn export_vm(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult<Response> {
    let metadata = state.service.export_metadata(&vm_id).map_err(api_error)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], metadata).into_response())
}

async fn start_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.start_vm(&dbg(&headers), &vm_id))
}

async fn shutdown_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(req): Json<PowerRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.shutdown_vm(&dbg(&headers), &vm_id, req.deadline()?))
}

async fn reboot_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(req): Json<PowerRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.reboot_vm(&dbg(&headers), &vm_id, req.deadline()?))
}

async fn pause_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.pause_vm(&dbg(&headers), &vm_id))
}

async fn unpause_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.unpause_vm(&dbg(&headers), &vm_id))
}

async fn suspend_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(req): Json<DiskRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.suspend_vm(&dbg(&headers), &vm_id, req.disk))
}

async fn resume_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(req): Json<DiskRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.resume_vm(&dbg(&headers), &vm_id, req.disk))
}

async fn migrate_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(req): Json<MigrateRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(
        state
            .service
            .migrate_vm(&dbg(&headers), &vm_id, &req.destination, req.options),
    )
}

async fn create_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.create_vm(&dbg(&headers), &vm_id))
}

async fn build_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.build_vm(&dbg(&headers), &vm_id))
}

async fn create_device_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.create_device_model(&dbg(&headers), &vm_id))
}

async fn destroy_vm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.destroy_vm(&dbg(&headers), &vm_id))
}

async fn set_vcpus(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(req): Json<VcpusRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.set_vcpus(&dbg(&headers), &vm_id, req.count))
}

async fn set_memory(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(req): Json<MemoryRangeRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(
        state
            .service
            .set_memory_dynamic_range(&dbg(&headers), &vm_id, req.min_mib, req.max_mib),
    )
}

async fn set_shadow_multiplier(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(req): Json<ShadowRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(
        state
            .service
            .set_shadow_multiplier(&dbg(&headers), &vm_id, req.multiplier),
    )
}

async fn set_xsdata(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(data): Json<BTreeMap<String, String>>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.set_xsdata(&dbg(&headers), &vm_id, data))
}

/// POST /api/v1/vms/:vm_id/refresh - Republish the VM and its devices on the feed
async fn refresh_vm(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult<StatusCode> {
    state.service.refresh_vm(&vm_id).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/vms/:vm_id/barriers - Mark the feed position for a VM
async fn inject_barrier(
    State(state): State<Arc<AppState>>,
    Path(vm_id): Path<String>,
    Json(req): Json<BarrierRequest>,
) -> ApiResult<Json<Value>> {
    let seq = state
        .service
        .inject_barrier(&vm_id, req.barrier_id)
        .map_err(api_error)?;
    Ok(Json(json!({ "seq": seq })))
}

// ============================================================================
// Device Handlers
// ============================================================================

/// Reject a device body that names a different VM than the path.
fn check_owner(vm_id: &str, owner: &str) -> ApiResult<()> {
    if vm_id != owner {
        return Err(bad_request(&format!(
            "device belongs to VM {} but was posted to VM {}",
            owner, vm_id
        )));
    }
    Ok(())
}

async fn list_vbds(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult<Json<Vec<Vbd>>> {
    state.service.list_vbds(&vm_id).map(Json).map_err(api_error)
}

async fn add_vbd(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(config): Json<VbdConfig>,
) -> ApiResult<(StatusCode, Json<DeviceRef>)> {
    check_owner(&vm_id, &config.vm)?;
    let r = state.service.add_vbd(&dbg(&headers), config).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(r)))
}

async fn get_vbd(
    State(state): State<Arc<AppState>>,
    Path((vm_id, device)): Path<(String, String)>,
) -> ApiResult<Json<Vbd>> {
    state
        .service
        .stat_vbd(&DeviceRef::new(vm_id, device))
        .map(Json)
        .map_err(api_error)
}

async fn remove_vbd(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .service
        .remove_vbd(&dbg(&headers), &DeviceRef::new(vm_id, device))
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn plug_vbd(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.plug_vbd(&dbg(&headers), &DeviceRef::new(vm_id, device)))
}

async fn unplug_vbd(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
    Json(req): Json<UnplugRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(
        state
            .service
            .unplug_vbd(&dbg(&headers), &DeviceRef::new(vm_id, device), req.force),
    )
}

async fn eject_vbd(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.eject_vbd(&dbg(&headers), &DeviceRef::new(vm_id, device)))
}

async fn insert_vbd(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
    Json(req): Json<DiskRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(
        state
            .service
            .insert_vbd(&dbg(&headers), &DeviceRef::new(vm_id, device), req.disk),
    )
}

async fn list_vifs(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult<Json<Vec<Vif>>> {
    state.service.list_vifs(&vm_id).map(Json).map_err(api_error)
}

async fn add_vif(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(config): Json<VifConfig>,
) -> ApiResult<(StatusCode, Json<DeviceRef>)> {
    check_owner(&vm_id, &config.vm)?;
    let r = state.service.add_vif(&dbg(&headers), config).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(r)))
}

async fn get_vif(
    State(state): State<Arc<AppState>>,
    Path((vm_id, device)): Path<(String, String)>,
) -> ApiResult<Json<Vif>> {
    state
        .service
        .stat_vif(&DeviceRef::new(vm_id, device))
        .map(Json)
        .map_err(api_error)
}

async fn remove_vif(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .service
        .remove_vif(&dbg(&headers), &DeviceRef::new(vm_id, device))
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn plug_vif(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.plug_vif(&dbg(&headers), &DeviceRef::new(vm_id, device)))
}

async fn unplug_vif(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
    Json(req): Json<UnplugRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(
        state
            .service
            .unplug_vif(&dbg(&headers), &DeviceRef::new(vm_id, device), req.force),
    )
}

async fn move_vif(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
    Json(req): Json<MoveRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(
        state
            .service
            .move_vif(&dbg(&headers), &DeviceRef::new(vm_id, device), req.backend),
    )
}

async fn set_vif_carrier(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
    Json(req): Json<CarrierRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(
        state
            .service
            .set_vif_carrier(&dbg(&headers), &DeviceRef::new(vm_id, device), req.carrier),
    )
}

async fn set_vif_locking_mode(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
    Json(req): Json<LockingRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(
        state
            .service
            .set_vif_locking_mode(&dbg(&headers), &DeviceRef::new(vm_id, device), req.mode),
    )
}

async fn list_pcis(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult<Json<Vec<Pci>>> {
    state.service.list_pcis(&vm_id).map(Json).map_err(api_error)
}

async fn add_pci(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Json(config): Json<PciConfig>,
) -> ApiResult<(StatusCode, Json<DeviceRef>)> {
    check_owner(&vm_id, &config.vm)?;
    let r = state.service.add_pci(&dbg(&headers), config).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(r)))
}

async fn get_pci(
    State(state): State<Arc<AppState>>,
    Path((vm_id, device)): Path<(String, String)>,
) -> ApiResult<Json<Pci>> {
    state
        .service
        .stat_pci(&DeviceRef::new(vm_id, device))
        .map(Json)
        .map_err(api_error)
}

async fn remove_pci(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .service
        .remove_pci(&dbg(&headers), &DeviceRef::new(vm_id, device))
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn plug_pci(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(state.service.plug_pci(&dbg(&headers), &DeviceRef::new(vm_id, device)))
}

async fn unplug_pci(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((vm_id, device)): Path<(String, String)>,
    Json(req): Json<UnplugRequest>,
) -> ApiResult<(StatusCode, Json<TaskAccepted>)> {
    accepted(
        state
            .service
            .unplug_pci(&dbg(&headers), &DeviceRef::new(vm_id, device), req.force),
    )
}

// ============================================================================
// Task Handlers
// ============================================================================

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskInfo>> {
    Json(state.service.list_tasks())
}

async fn get_task(State(state): State<Arc<AppState>>, Path(task_id): Path<String>) -> ApiResult<Json<TaskInfo>> {
    state.service.stat_task(&task_id).map(Json).map_err(api_error)
}

/// GET /api/v1/tasks/:task_id/wait - Block until the task finishes or the timeout passes
async fn wait_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<Json<TaskInfo>> {
    state
        .service
        .wait_task(&task_id, wait_duration(query.timeout_ms))
        .await
        .map(Json)
        .map_err(api_error)
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .service
        .cancel_task(&dbg(&headers), &task_id)
        .map_err(api_error)?;
    Ok(StatusCode::ACCEPTED)
}

async fn destroy_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .service
        .destroy_task(&dbg(&headers), &task_id)
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Update Feed Handlers
// ============================================================================

/// GET /api/v1/updates?from=N&timeout_ms=T - Entries after `from`, long-polling up to T
async fn get_updates(State(state): State<Arc<AppState>>, Query(query): Query<UpdatesQuery>) -> Json<FeedBatch> {
    Json(
        state
            .service
            .get_updates(query.from, wait_duration(query.timeout_ms))
            .await,
    )
}

async fn get_last_update_id(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "last_id": state.service.last_update_id() }))
}

async fn collect_garbage(State(state): State<Arc<AppState>>, Json(req): Json<GarbageRequest>) -> Json<Value> {
    let dropped = state.service.collect_garbage(req.watermark);
    Json(json!({ "dropped": dropped }))
}

async fn remove_barrier(State(state): State<Arc<AppState>>, Path(barrier_id): Path<u64>) -> ApiResult<StatusCode> {
    state.service.remove_barrier(barrier_id).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use vmplane_core::{PowerState, ServiceConfig, TaskState};
    use vmplane_hypervisor::{MockBackend, MockStorage};

    fn test_router() -> Router {
        let service = NodeService::new(
            ServiceConfig::default(),
            Arc::new(MockBackend::new()),
            Arc::new(MockStorage::new()),
        );
        build_router(service)
    }

    fn vm_body(id: &str) -> Value {
        json!({
            "id": id,
            "name": id,
            "boot": {"pv": {"direct": {"kernel": "/boot/vmlinuz", "ramdisk": null}}},
            "memory": {"static_max_mib": 1024, "dynamic_max_mib": 512, "dynamic_min_mib": 256},
            "vcpus": {"max": 2, "current": 1}
        })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(DEBUG_HEADER, "http-test");
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
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
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&Error::DoesNotExist {
                kind: vmplane_core::ObjectKind::Vm,
                id: "x".into()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&Error::BadPowerState {
                expected: vec![PowerState::Halted],
                actual: PowerState::Running
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::InvalidVcpus { requested: 9, max: 4 }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::Unimplemented {
                operation: "x".into()
            }),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(status_for(&Error::NoBootableDevice), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_vm_lifecycle_over_http() {
        let app = test_router();

        let (status, body) = send(&app, "POST", "/api/v1/vms", Some(vm_body("vm1"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], "vm1");

        let (status, body) = send(&app, "POST", "/api/v1/vms/vm1/start", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let task_id = body["task_id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "GET", &format!("/api/v1/tasks/{}/wait?timeout_ms=10000", task_id), None).await;
        assert_eq!(status, StatusCode::OK);
        let info: TaskInfo = serde_json::from_value(body).unwrap();
        assert!(matches!(info.state, TaskState::Completed { .. }), "{:?}", info.state);
        assert_eq!(info.dbg, "http-test");

        let (status, body) = send(&app, "GET", "/api/v1/vms/vm1", None).await;
        assert_eq!(status, StatusCode::OK);
        let vm: Vm = serde_json::from_value(body).unwrap();
        assert_eq!(vm.state.power_state, PowerState::Running);

        // Removing a running VM is a conflict
        let (status, body) = send(&app, "DELETE", "/api/v1/vms/vm1", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "bad_power_state");

        let (status, body) = send(&app, "POST", "/api/v1/vms/vm1/shutdown", Some(json!({}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let task_id = body["task_id"].as_str().unwrap().to_string();
        send(&app, "GET", &format!("/api/v1/tasks/{}/wait", task_id), None).await;

        let (status, _) = send(&app, "DELETE", "/api/v1/vms/vm1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, "GET", "/api/v1/vms/vm1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "does_not_exist");
    }

    #[tokio::test]
    async fn test_rejected_operation_creates_no_task() {
        let app = test_router();
        send(&app, "POST", "/api/v1/vms", Some(vm_body("vm1"))).await;

        let (status, body) = send(&app, "POST", "/api/v1/vms/vm1/pause", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["detail"]["actual"], "halted");

        let (_, body) = send(&app, "GET", "/api/v1/tasks", None).await;
        assert_eq!(body.as_array().unwrap().len(), 0);

        let (status, body) = send(&app, "PUT", "/api/v1/vms/vm1/vcpus", Some(json!({"count": 3}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_vcpus");
    }

    #[tokio::test]
    async fn test_device_owner_must_match_path() {
        let app = test_router();
        send(&app, "POST", "/api/v1/vms", Some(vm_body("vm1"))).await;

        let vbd = json!({
            "vm": "other",
            "id": "xvda",
            "position": null,
            "backend": {"local": "/images/a.img"},
            "qos": null
        });
        let (status, _) = send(&app, "POST", "/api/v1/vms/vm1/vbds", Some(vbd.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut vbd = vbd;
        vbd["vm"] = json!("vm1");
        let (status, body) = send(&app, "POST", "/api/v1/vms/vm1/vbds", Some(vbd)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, json!({"vm": "vm1", "device": "xvda"}));

        let (status, body) = send(&app, "GET", "/api/v1/vms/vm1/vbds/xvda", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["status"]["active"], true);
    }

    #[tokio::test]
    async fn test_update_feed_over_http() {
        let app = test_router();
        send(&app, "POST", "/api/v1/vms", Some(vm_body("vm1"))).await;

        let (_, body) = send(&app, "GET", "/api/v1/updates/last", None).await;
        let last = body["last_id"].as_u64().unwrap();
        assert!(last > 0);

        let (status, body) = send(&app, "GET", &format!("/api/v1/updates?from={}", last), None).await;
        assert_eq!(status, StatusCode::OK);
        let batch: FeedBatch = serde_json::from_value(body).unwrap();
        assert!(batch.entries.is_empty());
        assert_eq!(batch.last_id, last);

        let (status, body) = send(&app, "POST", "/api/v1/vms/vm1/barriers", Some(json!({"barrier_id": 1}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["seq"], last + 1);

        let (status, _) = send(&app, "DELETE", "/api/v1/barriers/1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", "/api/v1/barriers/1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_host_endpoints() {
        let app = test_router();

        let (status, body) = send(&app, "GET", "/api/v1/host", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["worker_pool_size"].as_u64().unwrap() >= 1);

        let (status, _) = send(&app, "PUT", "/api/v1/host/workers", Some(json!({"size": 3}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = send(&app, "GET", "/api/v1/host", None).await;
        assert_eq!(body["worker_pool_size"], 3);

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/host/features/mask",
            Some(json!({"features": "ffffffff-0000ffff", "mask": "0f0f0f0f-ffffffff"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["features"], "0f0f0f0f-0000ffff");

        let (status, _) = send(&app, "GET", "/nowhere", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
