//! Boundary to the authoritative remote service.
//!
//! [`RemoteGateway`] is blocking; async callers go through [`call`], which
//! runs the request on tokio's blocking pool.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::model::{ChartData, FileInfo, Kpis, ListOptions, MediaFile, NewReport, Report};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure, timeout or server-side error. Worth retrying later.
    Unavailable(String),
    /// The remote understood the request and refused it. Retrying the same
    /// payload will fail the same way.
    Rejected { status: u16, message: String },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Unavailable(msg) => write!(f, "remote unavailable: {msg}"),
            RemoteError::Rejected { status, message } => {
                write!(f, "remote rejected request ({status}): {message}")
            }
        }
    }
}

impl std::error::Error for RemoteError {}

/// A media file upload. `report_id` is always a permanent id.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub report_id: String,
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
    pub metadata: Map<String, Value>,
}

impl FileUpload {
    pub fn new(file: &MediaFile, report_id: &str) -> Self {
        Self {
            report_id: report_id.to_string(),
            filename: file.filename.clone(),
            content_type: file.content_type.clone(),
            data: file.data.clone(),
            metadata: file.metadata.clone(),
        }
    }
}

/// Operations the remote service offers. Ids passed in are permanent; ids
/// handed back are permanent.
pub trait RemoteGateway: Send + Sync {
    fn list_reports(&self, options: &ListOptions) -> Result<Vec<Report>, RemoteError>;
    fn get_report(&self, id: &str) -> Result<Option<Report>, RemoteError>;
    fn create_report(&self, report: &NewReport) -> Result<Report, RemoteError>;
    fn update_report(&self, id: &str, report: &NewReport) -> Result<Report, RemoteError>;
    /// `Ok(false)` when the report was already gone.
    fn delete_report(&self, id: &str) -> Result<bool, RemoteError>;
    fn kpis(&self) -> Result<Kpis, RemoteError>;
    fn chart_data(&self) -> Result<ChartData, RemoteError>;
    /// Returns the permanent id of the stored file.
    fn upload_file(&self, upload: &FileUpload) -> Result<String, RemoteError>;
    fn get_file(&self, id: &str) -> Result<Option<MediaFile>, RemoteError>;
    fn list_files(&self, report_id: &str) -> Result<Vec<FileInfo>, RemoteError>;
    fn update_file_metadata(
        &self,
        id: &str,
        metadata: &Map<String, Value>,
    ) -> Result<FileInfo, RemoteError>;
    fn delete_file(&self, id: &str) -> Result<bool, RemoteError>;
}

/// Gateway used when no remote is configured. Every call is unavailable, so
/// the coordinator serves everything locally and keeps the outbox growing.
pub struct NoRemote;

impl NoRemote {
    fn unavailable<T>() -> Result<T, RemoteError> {
        Err(RemoteError::Unavailable("no remote configured".to_string()))
    }
}

impl RemoteGateway for NoRemote {
    fn list_reports(&self, _options: &ListOptions) -> Result<Vec<Report>, RemoteError> {
        Self::unavailable()
    }
    fn get_report(&self, _id: &str) -> Result<Option<Report>, RemoteError> {
        Self::unavailable()
    }
    fn create_report(&self, _report: &NewReport) -> Result<Report, RemoteError> {
        Self::unavailable()
    }
    fn update_report(&self, _id: &str, _report: &NewReport) -> Result<Report, RemoteError> {
        Self::unavailable()
    }
    fn delete_report(&self, _id: &str) -> Result<bool, RemoteError> {
        Self::unavailable()
    }
    fn kpis(&self) -> Result<Kpis, RemoteError> {
        Self::unavailable()
    }
    fn chart_data(&self) -> Result<ChartData, RemoteError> {
        Self::unavailable()
    }
    fn upload_file(&self, _upload: &FileUpload) -> Result<String, RemoteError> {
        Self::unavailable()
    }
    fn get_file(&self, _id: &str) -> Result<Option<MediaFile>, RemoteError> {
        Self::unavailable()
    }
    fn list_files(&self, _report_id: &str) -> Result<Vec<FileInfo>, RemoteError> {
        Self::unavailable()
    }
    fn update_file_metadata(
        &self,
        _id: &str,
        _metadata: &Map<String, Value>,
    ) -> Result<FileInfo, RemoteError> {
        Self::unavailable()
    }
    fn delete_file(&self, _id: &str) -> Result<bool, RemoteError> {
        Self::unavailable()
    }
}

/// Run a blocking gateway call on the blocking pool.
pub async fn call<T, F>(gateway: &Arc<dyn RemoteGateway>, f: F) -> Result<T, RemoteError>
where
    F: FnOnce(&dyn RemoteGateway) -> Result<T, RemoteError> + Send + 'static,
    T: Send + 'static,
{
    let gateway = Arc::clone(gateway);
    match tokio::task::spawn_blocking(move || f(gateway.as_ref())).await {
        Ok(result) => result,
        Err(e) => Err(RemoteError::Unavailable(format!("remote call aborted: {e}"))),
    }
}
