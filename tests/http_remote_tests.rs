//! `HttpRemote` against an in-process axum server that speaks the hazard
//! service's REST dialect.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;

use cascade_sync::connectivity::Connectivity;
use cascade_sync::coordinator::HybridCoordinator;
use cascade_sync::http_remote::HttpRemote;
use cascade_sync::model::{ListOptions, NewMediaFile, ReportPatch, Severity, Status};
use cascade_sync::remote::{FileUpload, RemoteError, RemoteGateway};
use cascade_sync::storage::Storage;

use common::new_report;

// ---------------------------------------------------------------------------
// Fake service
// ---------------------------------------------------------------------------

struct StoredFile {
    id: String,
    report_id: String,
    filename: String,
    content_type: String,
    data: Vec<u8>,
    metadata: Map<String, Value>,
}

#[derive(Default)]
struct Service {
    hazards: Vec<Value>,
    files: Vec<StoredFile>,
    next_id: u64,
    fail_with: Option<u16>,
    last_list_query: HashMap<String, String>,
}

impl Service {
    fn allocate(&mut self) -> String {
        self.next_id += 1;
        format!("65b1c2d3e4f5a6b7c8d9{:04x}", self.next_id)
    }

    fn injected(&self) -> Option<Response> {
        self.fail_with.map(|code| {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error(status, "injected failure")
        })
    }

    fn hazard_mut(&mut self, id: &str) -> Option<&mut Value> {
        self.hazards.iter_mut().find(|h| h["_id"] == id)
    }
}

type Shared = Arc<Mutex<Service>>;

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn file_doc(file: &StoredFile) -> Value {
    let mut metadata = file.metadata.clone();
    metadata.insert("reportId".to_string(), json!(file.report_id));
    metadata.insert("contentType".to_string(), json!(file.content_type));
    json!({
        "_id": file.id,
        "filename": file.filename,
        "length": file.data.len(),
        "uploadDate": "2024-01-12T08:30:00Z",
        "metadata": metadata,
    })
}

async fn list_hazards(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let mut svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    let limit = query
        .get("limit")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(usize::MAX);
    svc.last_list_query = query;
    let docs: Vec<Value> = svc.hazards.iter().take(limit).cloned().collect();
    Json(docs).into_response()
}

async fn create_hazard(State(state): State<Shared>, Json(mut body): Json<Value>) -> Response {
    let mut svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    if body["title"].as_str().unwrap_or("").trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "Title is required");
    }
    let id = svc.allocate();
    let now = chrono::Utc::now().to_rfc3339();
    body["_id"] = json!(id);
    body["createdAt"] = json!(now);
    body["updatedAt"] = json!(now);
    svc.hazards.push(body.clone());
    (StatusCode::CREATED, Json(body)).into_response()
}

async fn get_hazard(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    match svc.hazard_mut(&id) {
        Some(doc) => Json(json!({ "hazard": doc })).into_response(),
        None => error(StatusCode::NOT_FOUND, "Hazard not found"),
    }
}

async fn update_hazard(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Map<String, Value>>,
) -> Response {
    let mut svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    let Some(doc) = svc.hazard_mut(&id) else {
        return error(StatusCode::NOT_FOUND, "Hazard not found");
    };
    for (key, value) in body {
        doc[key.as_str()] = value;
    }
    doc["updatedAt"] = json!(chrono::Utc::now().to_rfc3339());
    Json(doc.clone()).into_response()
}

async fn delete_hazard(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    let before = svc.hazards.len();
    svc.hazards.retain(|h| h["_id"] != id.as_str());
    if svc.hazards.len() == before {
        return error(StatusCode::NOT_FOUND, "Hazard not found");
    }
    Json(json!({ "message": "Hazard deleted" })).into_response()
}

async fn kpis(State(state): State<Shared>) -> Response {
    let svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    Json(json!({
        "totalReports": svc.hazards.len(),
        "verifiedReports": 0,
        "pendingVerification": svc.hazards.len(),
        "closedReports": 0,
        "criticalHazards": 0,
        "activeLocations": 1,
    }))
    .into_response()
}

async fn charts(State(state): State<Shared>) -> Response {
    let svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    Json(json!({
        "hazardsByType": [{ "name": "Flood", "value": 2, "fill": "hsl(0, 70%, 50%)" }],
        "hazardsByStatus": [],
        "hazardsBySeverity": [],
    }))
    .into_response()
}

async fn upload(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    let report_id = query.get("reportId").cloned().unwrap_or_default();
    if svc.hazard_mut(&report_id).is_none() {
        return error(StatusCode::NOT_FOUND, "Hazard not found");
    }
    let metadata = query
        .get("metadata")
        .and_then(|m| serde_json::from_str::<Map<String, Value>>(m).ok())
        .unwrap_or_default();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let id = svc.allocate();
    svc.files.push(StoredFile {
        id: id.clone(),
        report_id: report_id.clone(),
        filename: query.get("filename").cloned().unwrap_or_default(),
        content_type,
        data: body.to_vec(),
        metadata,
    });
    if let Some(doc) = svc.hazard_mut(&report_id) {
        if let Some(media) = doc["mediaFiles"].as_array_mut() {
            media.push(json!(id));
        }
    }
    Json(json!({ "message": "Files uploaded", "fileIds": [id] })).into_response()
}

async fn list_files(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    let owner = query.get("reportId").cloned().unwrap_or_default();
    let docs: Vec<Value> = svc
        .files
        .iter()
        .filter(|f| f.report_id == owner)
        .map(file_doc)
        .collect();
    Json(docs).into_response()
}

async fn file_bytes(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    match svc.files.iter().find(|f| f.id == id) {
        Some(file) => (
            [(header::CONTENT_TYPE, file.content_type.clone())],
            file.data.clone(),
        )
            .into_response(),
        None => error(StatusCode::NOT_FOUND, "File not found"),
    }
}

async fn file_metadata(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    match svc.files.iter().find(|f| f.id == id) {
        Some(file) => Json(file_doc(file)).into_response(),
        None => error(StatusCode::NOT_FOUND, "File not found"),
    }
}

async fn patch_metadata(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Map<String, Value>>,
) -> Response {
    let mut svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    let Some(file) = svc.files.iter_mut().find(|f| f.id == id) else {
        return error(StatusCode::NOT_FOUND, "File not found");
    };
    for (key, value) in body {
        file.metadata.insert(key, value);
    }
    Json(file_doc(file)).into_response()
}

async fn delete_file(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut svc = state.lock().unwrap();
    if let Some(resp) = svc.injected() {
        return resp;
    }
    let before = svc.files.len();
    svc.files.retain(|f| f.id != id);
    if svc.files.len() == before {
        return error(StatusCode::NOT_FOUND, "File not found");
    }
    Json(json!({ "message": "File deleted" })).into_response()
}

async fn start_service() -> (String, Shared, oneshot::Sender<()>) {
    let shared: Shared = Arc::new(Mutex::new(Service::default()));
    let app = Router::new()
        .route("/api/hazards", get(list_hazards).post(create_hazard))
        .route(
            "/api/hazards/:id",
            get(get_hazard).put(update_hazard).delete(delete_hazard),
        )
        .route("/api/kpis", get(kpis))
        .route("/api/charts", get(charts))
        .route("/api/upload", post(upload))
        .route("/api/files", get(list_files))
        .route("/api/files/:id", get(file_bytes).delete(delete_file))
        .route(
            "/api/files/:id/metadata",
            get(file_metadata).patch(patch_metadata),
        )
        .with_state(Arc::clone(&shared));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind service");
    let addr = listener.local_addr().expect("service addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{}", addr), shared, shutdown_tx)
}

fn client(base_url: &str) -> Arc<HttpRemote> {
    Arc::new(HttpRemote::new(base_url, Duration::from_secs(5)))
}

/// Run a blocking gateway call off the runtime thread.
async fn blocking<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.expect("blocking task")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn report_lifecycle_over_http() {
    let (base_url, service, shutdown_tx) = start_service().await;
    let remote = client(&base_url);

    let created = blocking({
        let remote = Arc::clone(&remote);
        move || remote.create_report(&new_report("Flood", Severity::High))
    })
    .await
    .unwrap();
    assert!(created.id.is_permanent());
    assert_eq!(created.id.as_str().len(), 24);
    assert_eq!(created.date_reported, 1_705_048_200_000);
    assert_eq!(created.status, Status::Unverified);

    let id = created.id.as_str().to_string();
    let fetched = blocking({
        let remote = Arc::clone(&remote);
        let id = id.clone();
        move || remote.get_report(&id)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(fetched.title, "Flood");

    let mut edited = new_report("Flood", Severity::High);
    edited.status = Status::Verified;
    let updated = blocking({
        let remote = Arc::clone(&remote);
        let id = id.clone();
        move || remote.update_report(&id, &edited)
    })
    .await
    .unwrap();
    assert_eq!(updated.status, Status::Verified);

    let options = ListOptions {
        limit: Some(10),
        ..ListOptions::default()
    };
    let listed = blocking({
        let remote = Arc::clone(&remote);
        move || remote.list_reports(&options)
    })
    .await
    .unwrap();
    assert_eq!(listed.len(), 1);
    {
        let svc = service.lock().unwrap();
        assert_eq!(svc.last_list_query.get("sortBy").map(String::as_str), Some("dateReported"));
        assert_eq!(svc.last_list_query.get("sortOrder").map(String::as_str), Some("desc"));
        assert_eq!(svc.last_list_query.get("limit").map(String::as_str), Some("10"));
    }

    let (first, second, gone) = blocking({
        let remote = Arc::clone(&remote);
        move || {
            (
                remote.delete_report(&id),
                remote.delete_report(&id),
                remote.get_report(&id),
            )
        }
    })
    .await;
    assert_eq!(first, Ok(true));
    assert_eq!(second, Ok(false));
    assert_eq!(gone, Ok(None));

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn client_errors_are_rejections() {
    let (base_url, _service, shutdown_tx) = start_service().await;
    let remote = client(&base_url);

    let result = blocking(move || remote.create_report(&new_report("  ", Severity::Low))).await;
    assert_eq!(
        result.unwrap_err(),
        RemoteError::Rejected {
            status: 400,
            message: "Title is required".to_string(),
        }
    );

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn server_errors_are_transient() {
    let (base_url, service, shutdown_tx) = start_service().await;
    let remote = client(&base_url);

    service.lock().unwrap().fail_with = Some(503);
    let (result, reachable) = blocking({
        let remote = Arc::clone(&remote);
        move || (remote.kpis(), remote.reachable())
    })
    .await;
    let err = result.unwrap_err();
    assert!(err.is_transient(), "unexpected {err:?}");
    assert!(!reachable);

    service.lock().unwrap().fail_with = Some(404);
    let reachable = blocking(move || remote.reachable()).await;
    assert!(reachable);

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn refused_connection_is_unavailable() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let remote = client(&format!("http://127.0.0.1:{port}"));

    let (result, reachable) = blocking(move || (remote.kpis(), remote.reachable())).await;
    assert!(matches!(result, Err(RemoteError::Unavailable(_))));
    assert!(!reachable);
}

#[tokio::test]
async fn kpis_and_charts_decode() {
    let (base_url, _service, shutdown_tx) = start_service().await;
    let remote = client(&base_url);

    let (kpis, charts) = blocking(move || {
        remote.create_report(&new_report("Storm", Severity::Medium))?;
        Ok::<_, RemoteError>((remote.kpis()?, remote.chart_data()?))
    })
    .await
    .unwrap();
    assert_eq!(kpis.total_reports, 1);
    assert_eq!(kpis.active_locations, 1);
    assert_eq!(charts.hazards_by_type[0].name, "Flood");
    assert_eq!(charts.hazards_by_type[0].value, 2);

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn files_upload_and_manage_over_http() {
    let (base_url, service, shutdown_tx) = start_service().await;
    let remote = client(&base_url);

    let report = blocking({
        let remote = Arc::clone(&remote);
        move || remote.create_report(&new_report("Oil Spill", Severity::Critical))
    })
    .await
    .unwrap();

    let mut metadata = Map::new();
    metadata.insert("camera".to_string(), json!("rear"));
    let upload = FileUpload {
        report_id: report.id.as_str().to_string(),
        filename: "sheen.jpg".to_string(),
        content_type: "image/jpeg".to_string(),
        data: vec![0xff, 0xd8, 0xff, 0xe0, 9, 9],
        metadata,
    };
    let file_id = blocking({
        let remote = Arc::clone(&remote);
        move || remote.upload_file(&upload)
    })
    .await
    .unwrap();
    {
        let svc = service.lock().unwrap();
        assert_eq!(svc.files.len(), 1);
        assert_eq!(svc.files[0].content_type, "image/jpeg");
        assert_eq!(svc.files[0].metadata.get("camera"), Some(&json!("rear")));
        assert_eq!(svc.hazards[0]["mediaFiles"], json!([file_id.clone()]));
    }

    let report_id = report.id.as_str().to_string();
    let (file, listed) = blocking({
        let remote = Arc::clone(&remote);
        let file_id = file_id.clone();
        move || (remote.get_file(&file_id), remote.list_files(&report_id))
    })
    .await;
    let file = file.unwrap().unwrap();
    assert_eq!(file.data, vec![0xff, 0xd8, 0xff, 0xe0, 9, 9]);
    assert_eq!(file.size, 6);
    assert_eq!(file.report_id, report.id);
    assert_eq!(file.content_type, "image/jpeg");
    assert_eq!(listed.unwrap().len(), 1);

    let mut caption = Map::new();
    caption.insert("caption".to_string(), json!("north jetty"));
    let (patched, deleted, gone) = blocking({
        let remote = Arc::clone(&remote);
        move || {
            (
                remote.update_file_metadata(&file_id, &caption),
                remote.delete_file(&file_id),
                remote.get_file(&file_id),
            )
        }
    })
    .await;
    let patched = patched.unwrap();
    assert_eq!(patched.metadata.get("camera"), Some(&json!("rear")));
    assert_eq!(patched.metadata.get("caption"), Some(&json!("north jetty")));
    assert_eq!(deleted, Ok(true));
    assert_eq!(gone, Ok(None));

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn offline_work_syncs_through_http() {
    let (base_url, service, shutdown_tx) = start_service().await;
    let gateway: Arc<dyn RemoteGateway> = client(&base_url);
    let connectivity = Connectivity::new(false);
    let hub = HybridCoordinator::new(
        Storage::open_in_memory().unwrap(),
        gateway,
        connectivity.clone(),
    );

    let local = hub
        .create_hazard(new_report("Oil Spill", Severity::Critical))
        .await
        .unwrap();
    hub.update_hazard(&local.id, &ReportPatch::status(Status::Verified))
        .await
        .unwrap();
    hub.upload_file(NewMediaFile {
        report_id: local.id.clone(),
        filename: "sheen.jpg".to_string(),
        content_type: "image/jpeg".to_string(),
        data: vec![1, 2, 3],
        metadata: Map::new(),
    })
    .await
    .unwrap();

    connectivity.set_online(true);
    let report = hub.sync_pending_changes().await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(hub.pending_count().await.unwrap(), 0);

    let svc = service.lock().unwrap();
    assert_eq!(svc.hazards.len(), 1);
    assert_eq!(svc.hazards[0]["status"], "Verified");
    assert_eq!(svc.files.len(), 1);
    assert_eq!(svc.hazards[0]["_id"], svc.files[0].report_id.as_str());
    drop(svc);

    shutdown_tx.send(()).ok();
}
