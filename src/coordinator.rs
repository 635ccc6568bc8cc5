//! Hybrid coordinator: the single data-access surface for the presentation
//! layer.
//!
//! Reads go to the remote while online and fall back to the local store when
//! the remote is unreachable. Writes always land in the local store first
//! (with their outbox entry) and are then mirrored to the remote when online.
//! A transient remote failure is never surfaced: the local result is returned
//! and the sync driver picks the entry up later.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::connectivity::Connectivity;
use crate::logging;
use crate::model::{
    Action, ChartData, EntityId, FileInfo, Kpis, ListOptions, MediaFile, NewMediaFile, NewReport,
    OutboxEntry, Report, ReportPatch, Target,
};
use crate::remote::{self, FileUpload, RemoteError, RemoteGateway};
use crate::stats;
use crate::storage::{SchemaState, Storage, StorageError};
use crate::sync::{reconnect_sync_loop, Claim, SyncDriver, SyncReport};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug)]
pub enum HybridError {
    Storage(StorageError),
    /// The remote refused the mirrored write. The local change is kept and
    /// its outbox entry is marked so it is not retried blindly.
    Rejected { status: u16, message: String },
    AlreadyInitialized,
}

impl std::fmt::Display for HybridError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HybridError::Storage(e) => write!(f, "{e}"),
            HybridError::Rejected { status, message } => {
                write!(f, "remote rejected the change ({status}): {message}")
            }
            HybridError::AlreadyInitialized => write!(f, "coordinator already initialized"),
        }
    }
}

impl std::error::Error for HybridError {}

impl From<StorageError> for HybridError {
    fn from(e: StorageError) -> Self {
        HybridError::Storage(e)
    }
}

/// Keeps the reconnect loop alive; dropping it stops the loop.
pub struct SyncLoopHandle {
    task: JoinHandle<()>,
}

impl SyncLoopHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SyncLoopHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct HybridCoordinator {
    storage: Arc<Mutex<Storage>>,
    remote: Arc<dyn RemoteGateway>,
    connectivity: Connectivity,
    driver: Arc<SyncDriver>,
    debounce: Duration,
    initialized: AtomicBool,
}

impl HybridCoordinator {
    pub fn new(storage: Storage, remote: Arc<dyn RemoteGateway>, connectivity: Connectivity) -> Self {
        let storage = Arc::new(Mutex::new(storage));
        let driver = Arc::new(SyncDriver::new(
            Arc::clone(&storage),
            Arc::clone(&remote),
            connectivity.clone(),
        ));
        Self {
            storage,
            remote,
            connectivity,
            driver,
            debounce: DEFAULT_DEBOUNCE,
            initialized: AtomicBool::new(false),
        }
    }

    /// Open (or rebuild) the store at `path` and wrap it. The schema state is
    /// handed back so the caller can warn when local data was discarded.
    pub fn open(
        path: &Path,
        remote: Arc<dyn RemoteGateway>,
        connectivity: Connectivity,
    ) -> Result<(Self, SchemaState), HybridError> {
        let (storage, state) = Storage::open(path)?;
        if let SchemaState::Reset { reason } = &state {
            crate::clog!("coordinator: local store was reset ({reason}); unsynced changes are lost");
        }
        Ok((Self::new(storage, remote, connectivity), state))
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Start the reconnect loop and, if online with work pending, run a
    /// first pass. Must be called from within a tokio runtime, once.
    pub async fn initialize(&self) -> Result<SyncLoopHandle, HybridError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(HybridError::AlreadyInitialized);
        }
        let task = tokio::spawn(reconnect_sync_loop(
            Arc::clone(&self.driver),
            self.connectivity.watch(),
            self.debounce,
        ));
        let handle = SyncLoopHandle { task };

        let pending = self.storage.lock().await.pending_count()?;
        if self.connectivity.is_online() && pending > 0 {
            crate::clog!("coordinator: {pending} change(s) pending at startup, syncing");
            self.driver.sync_pending_changes().await?;
        }
        Ok(handle)
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Ask the remote while online; on a transient failure, or offline,
    /// answer from the local store.
    async fn read_through<T, R, L>(&self, what: &str, from_remote: R, from_local: L) -> Result<T, HybridError>
    where
        T: Send + 'static,
        R: FnOnce(&dyn RemoteGateway) -> Result<T, RemoteError> + Send + 'static,
        L: FnOnce(&Storage) -> Result<T, StorageError>,
    {
        if self.connectivity.is_online() {
            match remote::call(&self.remote, from_remote).await {
                Ok(value) => return Ok(value),
                Err(RemoteError::Unavailable(reason)) => {
                    crate::clog!("coordinator: {what}: remote unavailable ({reason}), using local store");
                }
                Err(RemoteError::Rejected { status, message }) => {
                    return Err(HybridError::Rejected { status, message });
                }
            }
        }
        let st = self.storage.lock().await;
        Ok(from_local(&st)?)
    }

    pub async fn get_all_hazards(&self, options: &ListOptions) -> Result<Vec<Report>, HybridError> {
        let remote_options = options.clone();
        self.read_through(
            "list reports",
            move |r| r.list_reports(&remote_options),
            |st| st.list_reports(options),
        )
        .await
    }

    pub async fn get_hazard_by_id(&self, id: &EntityId) -> Result<Option<Report>, HybridError> {
        if id.is_local() {
            return Ok(self.storage.lock().await.get_report(id)?);
        }
        let remote_id = id.as_str().to_string();
        let found = self
            .read_through(
                "get report",
                move |r| r.get_report(&remote_id),
                |st| st.get_report(id),
            )
            .await?;
        if let Some(report) = &found {
            if report.id.is_permanent() {
                self.storage.lock().await.cache_report(report)?;
            }
        }
        Ok(found)
    }

    pub async fn get_kpis(&self) -> Result<Kpis, HybridError> {
        self.read_through(
            "kpis",
            |r| r.kpis(),
            |st| Ok(stats::kpis(&st.list_reports(&ListOptions::default())?)),
        )
        .await
    }

    pub async fn get_chart_data(&self) -> Result<ChartData, HybridError> {
        self.read_through(
            "chart data",
            |r| r.chart_data(),
            |st| Ok(stats::chart_data(&st.list_reports(&ListOptions::default())?)),
        )
        .await
    }

    pub async fn get_file(&self, id: &EntityId) -> Result<Option<MediaFile>, HybridError> {
        if id.is_local() {
            return Ok(self.storage.lock().await.get_file(id)?);
        }
        let remote_id = id.as_str().to_string();
        self.read_through(
            "get file",
            move |r| r.get_file(&remote_id),
            |st| st.get_file(id),
        )
        .await
    }

    pub async fn list_files(&self, report_id: &EntityId) -> Result<Vec<FileInfo>, HybridError> {
        if report_id.is_local() {
            return Ok(self.storage.lock().await.list_files(report_id)?);
        }
        let remote_id = report_id.as_str().to_string();
        self.read_through(
            "list files",
            move |r| r.list_files(&remote_id),
            |st| st.list_files(report_id),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Claim to mirror a write now, or `None` to leave it to the sync pass:
    /// offline, or a pass is already pushing the same entity.
    fn mirror_claim<'a>(&self, claim: Option<Claim<'a>>, entry_id: i64) -> Option<Claim<'a>> {
        if !self.connectivity.is_online() {
            return None;
        }
        if claim.is_none() {
            crate::clog!(
                "coordinator: {} queued, a sync pass is pushing the same entity",
                logging::entry(entry_id)
            );
        }
        claim
    }

    /// Handle the outcome of mirroring one write. Transient failures leave
    /// the entry pending and yield `None`; rejections mark the entry.
    async fn settle<T>(&self, entry_id: i64, result: Result<T, RemoteError>) -> Result<Option<T>, HybridError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(RemoteError::Unavailable(reason)) => {
                crate::clog!(
                    "coordinator: {} stays pending, remote unavailable: {reason}",
                    logging::entry(entry_id)
                );
                Ok(None)
            }
            Err(RemoteError::Rejected { status, message }) => {
                self.storage
                    .lock()
                    .await
                    .record_rejection(entry_id, status, &message)?;
                crate::clog!("coordinator: {} rejected ({status}): {message}", logging::entry(entry_id));
                Err(HybridError::Rejected { status, message })
            }
        }
    }

    /// Store the report locally, then try to create it on the remote. Returns
    /// the permanent record on success, the local one otherwise.
    pub async fn create_hazard(&self, new: NewReport) -> Result<Report, HybridError> {
        let (local, entry_id, claim) = {
            let st = self.storage.lock().await;
            let (local, entry_id) = st.create_report(new)?;
            let claim = self.driver.claim(&local.id);
            (local, entry_id, claim)
        };
        let Some(_claim) = self.mirror_claim(claim, entry_id) else {
            return Ok(local);
        };

        let payload = NewReport::from(&local);
        let result = remote::call(&self.remote, move |r| r.create_report(&payload)).await;
        let Some(created) = self.settle(entry_id, result).await? else {
            return Ok(local);
        };
        let st = self.storage.lock().await;
        st.adopt_permanent_report(&local.id, &created, entry_id)?;
        Ok(st.get_report(&created.id)?.unwrap_or(created))
    }

    pub async fn update_hazard(&self, id: &EntityId, patch: &ReportPatch) -> Result<Option<Report>, HybridError> {
        let (local, entry_id, claim) = {
            let st = self.storage.lock().await;
            let Some((local, entry_id)) = st.update_report(id, patch)? else {
                return Ok(None);
            };
            let claim = self.driver.claim(&local.id);
            (local, entry_id, claim)
        };
        if local.id.is_local() {
            return Ok(Some(local));
        }
        let Some(_claim) = self.mirror_claim(claim, entry_id) else {
            return Ok(Some(local));
        };

        let remote_id = local.id.as_str().to_string();
        let payload = NewReport::from(&local);
        let result = remote::call(&self.remote, move |r| r.update_report(&remote_id, &payload)).await;
        let Some(updated) = self.settle(entry_id, result).await? else {
            return Ok(Some(local));
        };
        let st = self.storage.lock().await;
        let swept = st.mark_duplicates_as_synced(Target::Reports, &[Action::Update], &local.id, entry_id)?;
        if swept > 1 {
            crate::clog!(
                "coordinator: {} retired {} older update(s)",
                logging::entity(&local.id),
                swept - 1
            );
        }
        st.cache_report(&updated)?;
        Ok(Some(updated))
    }

    /// Delete locally and on the remote. Once the remote delete lands, any
    /// earlier update still queued for the report is moot and retired too.
    pub async fn delete_hazard(&self, id: &EntityId) -> Result<bool, HybridError> {
        let (entry_id, claim) = {
            let st = self.storage.lock().await;
            let Some(entry_id) = st.delete_report(id)? else {
                return Ok(false);
            };
            (entry_id, self.driver.claim(id))
        };
        if id.is_local() {
            return Ok(true);
        }
        let Some(_claim) = self.mirror_claim(claim, entry_id) else {
            return Ok(true);
        };
        let remote_id = id.as_str().to_string();
        let result = remote::call(&self.remote, move |r| r.delete_report(&remote_id)).await;
        if self.settle(entry_id, result).await?.is_some() {
            self.storage.lock().await.mark_duplicates_as_synced(
                Target::Reports,
                &[Action::Update, Action::Delete],
                id,
                entry_id,
            )?;
        }
        Ok(true)
    }

    /// Store the file locally and upload it if its owner already has a
    /// permanent id. Otherwise the upload waits for the owner to sync.
    pub async fn upload_file(&self, new: NewMediaFile) -> Result<FileInfo, HybridError> {
        let (file, entry_id, claim) = {
            let st = self.storage.lock().await;
            let (file, entry_id) = st.create_file(new)?;
            let claim = self.driver.claim(&file.id);
            (file, entry_id, claim)
        };
        let Some(_claim) = self.mirror_claim(claim, entry_id) else {
            return Ok(file.info());
        };
        let owner = if file.report_id.is_permanent() {
            Some(file.report_id.clone())
        } else {
            self.storage.lock().await.permanent_id_for(&file.report_id)?
        };
        let Some(owner) = owner else {
            crate::clog!(
                "coordinator: upload of {} waits for {} to sync",
                logging::entity(&file.id),
                logging::entity(&file.report_id)
            );
            return Ok(file.info());
        };

        let upload = FileUpload::new(&file, owner.as_str());
        let result = remote::call(&self.remote, move |r| r.upload_file(&upload)).await;
        let Some(file_id) = self.settle(entry_id, result).await? else {
            return Ok(file.info());
        };
        let permanent = EntityId::permanent(file_id);
        let st = self.storage.lock().await;
        st.adopt_permanent_file(&file.id, &permanent, &owner, entry_id)?;
        let mut info = file.info();
        info.id = permanent.clone();
        info.report_id = owner;
        Ok(st.get_file_info(&permanent)?.unwrap_or(info))
    }

    pub async fn update_file_metadata(
        &self,
        id: &EntityId,
        metadata: Map<String, Value>,
    ) -> Result<Option<FileInfo>, HybridError> {
        let (local, entry_id, claim) = {
            let st = self.storage.lock().await;
            let Some((local, entry_id)) = st.update_file_metadata(id, &metadata)? else {
                return Ok(None);
            };
            let claim = self.driver.claim(&local.id);
            (local, entry_id, claim)
        };
        if local.id.is_local() {
            return Ok(Some(local));
        }
        let Some(_claim) = self.mirror_claim(claim, entry_id) else {
            return Ok(Some(local));
        };
        let remote_id = local.id.as_str().to_string();
        let merged = local.metadata.clone();
        let result =
            remote::call(&self.remote, move |r| r.update_file_metadata(&remote_id, &merged)).await;
        if self.settle(entry_id, result).await?.is_some() {
            self.storage.lock().await.mark_duplicates_as_synced(
                Target::Files,
                &[Action::Update],
                &local.id,
                entry_id,
            )?;
        }
        Ok(Some(local))
    }

    pub async fn delete_file(&self, id: &EntityId) -> Result<bool, HybridError> {
        let (entry_id, claim) = {
            let st = self.storage.lock().await;
            let Some(entry_id) = st.delete_file(id)? else {
                return Ok(false);
            };
            (entry_id, self.driver.claim(id))
        };
        if id.is_local() {
            return Ok(true);
        }
        let Some(_claim) = self.mirror_claim(claim, entry_id) else {
            return Ok(true);
        };
        let remote_id = id.as_str().to_string();
        let result = remote::call(&self.remote, move |r| r.delete_file(&remote_id)).await;
        if self.settle(entry_id, result).await?.is_some() {
            self.storage.lock().await.mark_duplicates_as_synced(
                Target::Files,
                &[Action::Update, Action::Delete],
                id,
                entry_id,
            )?;
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Outbox
    // -----------------------------------------------------------------------

    pub async fn sync_pending_changes(&self) -> Result<SyncReport, HybridError> {
        Ok(self.driver.sync_pending_changes().await?)
    }

    pub async fn pending_count(&self) -> Result<u64, HybridError> {
        Ok(self.storage.lock().await.pending_count()?)
    }

    pub async fn pending_changes(&self) -> Result<Vec<OutboxEntry>, HybridError> {
        Ok(self.storage.lock().await.scan_pending()?)
    }

    /// Drop a pending change without sending it. The local row is untouched.
    pub async fn discard_pending(&self, entry_id: i64) -> Result<bool, HybridError> {
        let discarded = self.storage.lock().await.discard(entry_id)?;
        if discarded {
            crate::clog!("coordinator: discarded {}", logging::entry(entry_id));
        }
        Ok(discarded)
    }

    /// Lift a rejection so the next pass sends the entry again.
    pub async fn retry_rejected(&self, entry_id: i64) -> Result<bool, HybridError> {
        Ok(self.storage.lock().await.clear_rejection(entry_id)?)
    }
}
