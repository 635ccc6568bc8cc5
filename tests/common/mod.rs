//! Shared fixtures for the integration tests: an in-memory remote that
//! records every call, and helpers to build a coordinator around it.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};

use cascade_sync::connectivity::Connectivity;
use cascade_sync::coordinator::HybridCoordinator;
use cascade_sync::model::{
    now_millis, ChartData, EntityId, FileInfo, Kpis, ListOptions, MediaFile, NewReport, Report,
    Severity, SortOrder, Status,
};
use cascade_sync::remote::{FileUpload, RemoteError, RemoteGateway};
use cascade_sync::stats;
use cascade_sync::storage::Storage;

type Hook = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    reports: Vec<Report>,
    files: Vec<MediaFile>,
    calls: Vec<String>,
    unavailable: bool,
    rejections: Vec<(String, u16, String)>,
    next_id: u64,
    delay: Duration,
}

/// Remote service kept in memory. Ids are 24 hex digits, like the real one.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
    hook: Mutex<Option<Hook>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Refuse every subsequent call named `op`.
    pub fn reject(&self, op: &str, status: u16, message: &str) {
        self.state
            .lock()
            .unwrap()
            .rejections
            .push((op.to_string(), status, message.to_string()));
    }

    pub fn clear_rejections(&self) {
        self.state.lock().unwrap().rejections.clear();
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Run `hook` with the operation name at the start of every call.
    pub fn on_call<F: Fn(&str) + Send + Sync + 'static>(&self, hook: F) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.state.lock().unwrap().reports.clone()
    }

    pub fn files(&self) -> Vec<MediaFile> {
        self.state.lock().unwrap().files.clone()
    }

    /// Store a report directly, as if another client had created it.
    pub fn seed_report(&self, new: NewReport) -> Report {
        let mut st = self.state.lock().unwrap();
        let id = Self::allocate(&mut st);
        let report = Report::from_new(id, new, now_millis());
        st.reports.push(report.clone());
        report
    }

    fn allocate(st: &mut FakeState) -> EntityId {
        st.next_id += 1;
        EntityId::permanent(format!("65a0f0c2e4b0{:012x}", st.next_id))
    }

    fn enter(&self, op: &str, target: &str) -> Result<(), RemoteError> {
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(op);
        }
        let delay = {
            let mut st = self.state.lock().unwrap();
            st.calls.push(if target.is_empty() {
                op.to_string()
            } else {
                format!("{op} {target}")
            });
            if st.unavailable {
                return Err(RemoteError::Unavailable("connection refused".to_string()));
            }
            if let Some((_, status, message)) = st.rejections.iter().find(|(name, _, _)| name == op) {
                return Err(RemoteError::Rejected {
                    status: *status,
                    message: message.clone(),
                });
            }
            st.delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(())
    }
}

impl RemoteGateway for FakeRemote {
    fn list_reports(&self, options: &ListOptions) -> Result<Vec<Report>, RemoteError> {
        self.enter("list_reports", "")?;
        let mut reports: Vec<Report> = self
            .reports()
            .into_iter()
            .filter(|r| options.status.map_or(true, |s| r.status == s))
            .filter(|r| options.severity.map_or(true, |s| r.severity == s))
            .filter(|r| {
                options
                    .hazard_type
                    .as_ref()
                    .map_or(true, |t| &r.hazard_type == t)
            })
            .collect();
        reports.sort_by_key(|r| r.date_reported);
        if options.order == SortOrder::Desc {
            reports.reverse();
        }
        if let Some(limit) = options.limit {
            reports.truncate(limit);
        }
        Ok(reports)
    }

    fn get_report(&self, id: &str) -> Result<Option<Report>, RemoteError> {
        self.enter("get_report", id)?;
        Ok(self.reports().into_iter().find(|r| r.id.as_str() == id))
    }

    fn create_report(&self, report: &NewReport) -> Result<Report, RemoteError> {
        self.enter("create_report", "")?;
        let mut st = self.state.lock().unwrap();
        let id = Self::allocate(&mut st);
        let created = Report::from_new(id, report.clone(), now_millis());
        st.reports.push(created.clone());
        Ok(created)
    }

    fn update_report(&self, id: &str, report: &NewReport) -> Result<Report, RemoteError> {
        self.enter("update_report", id)?;
        let mut st = self.state.lock().unwrap();
        let Some(existing) = st.reports.iter_mut().find(|r| r.id.as_str() == id) else {
            return Err(RemoteError::Rejected {
                status: 404,
                message: "Hazard not found".to_string(),
            });
        };
        let mut updated = Report::from_new(existing.id.clone(), report.clone(), now_millis());
        updated.created_at = existing.created_at;
        *existing = updated.clone();
        Ok(updated)
    }

    fn delete_report(&self, id: &str) -> Result<bool, RemoteError> {
        self.enter("delete_report", id)?;
        let mut st = self.state.lock().unwrap();
        let before = st.reports.len();
        st.reports.retain(|r| r.id.as_str() != id);
        Ok(st.reports.len() != before)
    }

    fn kpis(&self) -> Result<Kpis, RemoteError> {
        self.enter("kpis", "")?;
        Ok(stats::kpis(&self.reports()))
    }

    fn chart_data(&self) -> Result<ChartData, RemoteError> {
        self.enter("chart_data", "")?;
        Ok(stats::chart_data(&self.reports()))
    }

    fn upload_file(&self, upload: &FileUpload) -> Result<String, RemoteError> {
        self.enter("upload_file", &upload.report_id)?;
        let mut st = self.state.lock().unwrap();
        if !st.reports.iter().any(|r| r.id.as_str() == upload.report_id) {
            return Err(RemoteError::Rejected {
                status: 404,
                message: "Hazard not found".to_string(),
            });
        }
        let id = Self::allocate(&mut st);
        st.files.push(MediaFile {
            id: id.clone(),
            report_id: EntityId::permanent(upload.report_id.clone()),
            filename: upload.filename.clone(),
            content_type: upload.content_type.clone(),
            size: upload.data.len() as u64,
            data: upload.data.clone(),
            metadata: upload.metadata.clone(),
            created_at: now_millis(),
        });
        if let Some(owner) = st
            .reports
            .iter_mut()
            .find(|r| r.id.as_str() == upload.report_id)
        {
            owner.media_files.push(id.clone());
        }
        Ok(id.as_str().to_string())
    }

    fn get_file(&self, id: &str) -> Result<Option<MediaFile>, RemoteError> {
        self.enter("get_file", id)?;
        Ok(self.files().into_iter().find(|f| f.id.as_str() == id))
    }

    fn list_files(&self, report_id: &str) -> Result<Vec<FileInfo>, RemoteError> {
        self.enter("list_files", report_id)?;
        Ok(self
            .files()
            .iter()
            .filter(|f| f.report_id.as_str() == report_id)
            .map(MediaFile::info)
            .collect())
    }

    fn update_file_metadata(
        &self,
        id: &str,
        metadata: &Map<String, Value>,
    ) -> Result<FileInfo, RemoteError> {
        self.enter("update_file_metadata", id)?;
        let mut st = self.state.lock().unwrap();
        let Some(file) = st.files.iter_mut().find(|f| f.id.as_str() == id) else {
            return Err(RemoteError::Rejected {
                status: 404,
                message: "File not found".to_string(),
            });
        };
        for (key, value) in metadata {
            file.metadata.insert(key.clone(), value.clone());
        }
        Ok(file.info())
    }

    fn delete_file(&self, id: &str) -> Result<bool, RemoteError> {
        self.enter("delete_file", id)?;
        let mut st = self.state.lock().unwrap();
        let before = st.files.len();
        st.files.retain(|f| f.id.as_str() != id);
        Ok(st.files.len() != before)
    }
}

/// Coordinator over an in-memory store and `remote`, with a short debounce.
pub fn coordinator(remote: &Arc<FakeRemote>, online: bool) -> (HybridCoordinator, Connectivity) {
    let connectivity = Connectivity::new(online);
    let gateway: Arc<dyn RemoteGateway> = Arc::clone(remote) as Arc<dyn RemoteGateway>;
    let coordinator = HybridCoordinator::new(
        Storage::open_in_memory().unwrap(),
        gateway,
        connectivity.clone(),
    )
    .with_debounce(Duration::from_millis(20));
    (coordinator, connectivity)
}

pub fn new_report(title: &str, severity: Severity) -> NewReport {
    NewReport {
        title: title.to_string(),
        description: format!("{title} reported near the harbour"),
        location: "Harbour Road".to_string(),
        specific_location: None,
        hazard_type: "Environmental".to_string(),
        severity,
        status: Status::Unverified,
        date_reported: 1_705_048_200_000,
        reported_by: "field team".to_string(),
        coordinates: None,
        media_files: Vec::new(),
        contact_info: None,
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
