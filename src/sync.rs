//! Sync driver: replays the outbox against the remote once connectivity is
//! back, and the background loop that triggers it.
//!
//! A pass walks pending entries in the order they were recorded. Creates are
//! pushed with the entity's current local row, the permanent id the remote
//! hands back is adopted by the store, and later entries that still name the
//! local id are resolved through the pass's local-to-permanent map. Only one
//! pass runs at a time, and an entity is never pushed by the pass and by a
//! direct write at once: both take a [`Claim`] on it first.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::connectivity::Connectivity;
use crate::logging;
use crate::model::{Action, EntityId, FileInfo, MediaFile, NewReport, OutboxEntry, OutboxOp, Report, Target};
use crate::remote::{self, FileUpload, RemoteError, RemoteGateway};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    /// Every pending entry was examined.
    Completed,
    /// Connectivity dropped mid-pass; the rest stays pending.
    Interrupted,
    /// Offline when triggered; nothing was attempted.
    Offline,
    /// Another pass was already running.
    AlreadyRunning,
}

/// What a single pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub status: PassStatus,
    pub examined: usize,
    /// Entries applied on the remote.
    pub pushed: usize,
    /// Entries retired without a remote call (superseded, or never needed).
    pub retired: usize,
    /// Entries left for a later pass: their owner is not synced yet, or a
    /// direct write to the same entity was in flight.
    pub deferred: usize,
    /// Entries that hit a transient failure.
    pub failed: usize,
    /// Entries the remote refused during this pass.
    pub rejected: usize,
    /// Entries skipped because of an earlier rejection.
    pub blocked: usize,
    /// Local ids that received a permanent id.
    pub remapped: Vec<(EntityId, EntityId)>,
}

impl SyncReport {
    fn new(status: PassStatus) -> Self {
        Self {
            status,
            examined: 0,
            pushed: 0,
            retired: 0,
            deferred: 0,
            failed: 0,
            rejected: 0,
            blocked: 0,
            remapped: Vec::new(),
        }
    }
}

enum Outcome {
    Pushed,
    Retired,
    Deferred,
}

#[derive(Debug)]
enum PassError {
    Remote(RemoteError),
    Storage(StorageError),
}

impl From<RemoteError> for PassError {
    fn from(e: RemoteError) -> Self {
        PassError::Remote(e)
    }
}

impl From<StorageError> for PassError {
    fn from(e: StorageError) -> Self {
        PassError::Storage(e)
    }
}

/// State carried across the entries of one pass.
struct Pass {
    local_to_permanent: HashMap<String, EntityId>,
    processed_creates: HashSet<String>,
    report: SyncReport,
}

impl Pass {
    fn resolve(&self, id: &EntityId) -> Option<EntityId> {
        if id.is_permanent() {
            Some(id.clone())
        } else {
            self.local_to_permanent.get(id.as_str()).cloned()
        }
    }
}

/// Clears the single-flight flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Exclusive right to push one entity to the remote. Released on drop.
pub struct Claim<'a> {
    held: &'a StdMutex<HashSet<String>>,
    key: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct SyncDriver {
    storage: Arc<Mutex<Storage>>,
    remote: Arc<dyn RemoteGateway>,
    connectivity: Connectivity,
    syncing: AtomicBool,
    in_flight: StdMutex<HashSet<String>>,
}

impl SyncDriver {
    pub fn new(
        storage: Arc<Mutex<Storage>>,
        remote: Arc<dyn RemoteGateway>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            storage,
            remote,
            connectivity,
            syncing: AtomicBool::new(false),
            in_flight: StdMutex::new(HashSet::new()),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Reserve `id` for a remote call. `None` while another caller holds it.
    ///
    /// Take it under the store lock, together with the outbox read or write
    /// it covers, so the other side sees the entry and the claim together.
    pub fn claim(&self, id: &EntityId) -> Option<Claim<'_>> {
        let key = id.as_str().to_string();
        let mut held = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(key.clone()) {
            return None;
        }
        Some(Claim {
            held: &self.in_flight,
            key,
        })
    }

    /// Replay every pending outbox entry against the remote.
    ///
    /// Remote failures never abort the pass: a transient failure leaves the
    /// entry pending for the next pass, a rejection marks it. Only a local
    /// store failure is returned as an error.
    pub async fn sync_pending_changes(&self) -> Result<SyncReport, StorageError> {
        if !self.connectivity.is_online() {
            crate::clog!("sync: offline, skipping pass");
            return Ok(SyncReport::new(PassStatus::Offline));
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            crate::clog!("sync: pass already running");
            return Ok(SyncReport::new(PassStatus::AlreadyRunning));
        }
        let _guard = PassGuard(&self.syncing);

        let (pending, mappings) = {
            let st = self.storage.lock().await;
            (st.scan_pending()?, st.id_mappings()?)
        };
        if pending.is_empty() {
            return Ok(SyncReport::new(PassStatus::Completed));
        }
        crate::clog!("sync: {} pending change(s)", pending.len());

        let mut pass = Pass {
            local_to_permanent: mappings,
            processed_creates: HashSet::new(),
            report: SyncReport::new(PassStatus::Completed),
        };

        for entry in pending {
            if !self.connectivity.is_online() {
                crate::clog!("sync: connectivity lost, stopping pass");
                pass.report.status = PassStatus::Interrupted;
                break;
            }
            pass.report.examined += 1;

            // Dedup sweeps earlier in this pass may already have retired it.
            let claim = {
                let st = self.storage.lock().await;
                if st.is_synced(entry.id)? {
                    continue;
                }
                self.claim(entry.op.entity_id())
            };
            let Some(_claim) = claim else {
                crate::clog!(
                    "sync: deferring {}, a direct write to {} is in flight",
                    logging::entry(entry.id),
                    logging::entity(entry.op.entity_id())
                );
                pass.report.deferred += 1;
                continue;
            };
            if let Some(rejection) = &entry.rejection {
                crate::clog!(
                    "sync: {} blocked by earlier rejection ({}: {})",
                    logging::entry(entry.id),
                    rejection.status,
                    rejection.reason
                );
                pass.report.blocked += 1;
                continue;
            }

            match self.dispatch(&entry, &mut pass).await {
                Ok(Outcome::Pushed) => pass.report.pushed += 1,
                Ok(Outcome::Retired) => pass.report.retired += 1,
                Ok(Outcome::Deferred) => pass.report.deferred += 1,
                Err(PassError::Remote(RemoteError::Unavailable(reason))) => {
                    crate::clog!(
                        "sync: {} left pending, remote unavailable: {reason}",
                        logging::entry(entry.id)
                    );
                    pass.report.failed += 1;
                }
                Err(PassError::Remote(RemoteError::Rejected { status, message })) => {
                    crate::clog!(
                        "sync: {} rejected ({status}): {message}",
                        logging::entry(entry.id)
                    );
                    self.storage
                        .lock()
                        .await
                        .record_rejection(entry.id, status, &message)?;
                    pass.report.rejected += 1;
                }
                Err(PassError::Storage(e)) => return Err(e),
            }
        }

        let r = &pass.report;
        crate::clog!(
            "sync: pass done: pushed {}, retired {}, deferred {}, failed {}, rejected {}, blocked {}",
            r.pushed,
            r.retired,
            r.deferred,
            r.failed,
            r.rejected,
            r.blocked
        );
        Ok(pass.report)
    }

    async fn dispatch(&self, entry: &OutboxEntry, pass: &mut Pass) -> Result<Outcome, PassError> {
        match &entry.op {
            OutboxOp::CreateReport { report } => self.push_report_create(entry.id, report, pass).await,
            OutboxOp::UpdateReport { report } => self.push_report_update(entry.id, report, pass).await,
            OutboxOp::DeleteReport { id } => {
                self.push_delete(Target::Reports, entry.id, id, pass).await
            }
            OutboxOp::CreateFile { file } => self.push_file_create(entry.id, file, pass).await,
            OutboxOp::UpdateFile { file } => self.push_file_update(entry.id, file, pass).await,
            OutboxOp::DeleteFile { id } => self.push_delete(Target::Files, entry.id, id, pass).await,
        }
    }

    async fn retire(&self, entry_id: i64, why: &str) -> Result<Outcome, PassError> {
        crate::clog!("sync: retiring {}: {why}", logging::entry(entry_id));
        self.storage.lock().await.mark_synced(entry_id)?;
        Ok(Outcome::Retired)
    }

    async fn push_report_create(
        &self,
        entry_id: i64,
        snapshot: &Report,
        pass: &mut Pass,
    ) -> Result<Outcome, PassError> {
        let local = snapshot.id.clone();
        if local.is_permanent() {
            // Written under an id the remote already assigned: an upsert.
            return self.push_report_update(entry_id, snapshot, pass).await;
        }
        if pass.local_to_permanent.contains_key(local.as_str())
            || !pass.processed_creates.insert(local.as_str().to_string())
        {
            return self.retire(entry_id, "report already created").await;
        }

        let (current, watermark) = {
            let st = self.storage.lock().await;
            (st.get_report(&local)?, st.outbox_watermark()?)
        };
        let Some(current) = current else {
            return self.retire(entry_id, "report deleted before it was synced").await;
        };

        let payload = NewReport::from(&current);
        let created = remote::call(&self.remote, move |r| r.create_report(&payload)).await?;
        let permanent = created.id.clone();
        {
            let st = self.storage.lock().await;
            st.adopt_permanent_report(&local, &created, watermark)?;
            st.mark_synced(entry_id)?;
        }
        pass.local_to_permanent
            .insert(local.as_str().to_string(), permanent.clone());
        pass.report.remapped.push((local, permanent));
        Ok(Outcome::Pushed)
    }

    async fn push_report_update(
        &self,
        entry_id: i64,
        snapshot: &Report,
        pass: &mut Pass,
    ) -> Result<Outcome, PassError> {
        if snapshot.id.is_local() {
            // Either the create earlier in this pass carried this state, or
            // the report never reached the remote at all.
            let why = if pass.resolve(&snapshot.id).is_some() {
                "folded into the create"
            } else {
                "report never reached the remote"
            };
            return self.retire(entry_id, why).await;
        }

        let id = snapshot.id.as_str().to_string();
        let payload = NewReport::from(snapshot);
        remote::call(&self.remote, move |r| r.update_report(&id, &payload)).await?;
        self.storage.lock().await.mark_synced(entry_id)?;
        Ok(Outcome::Pushed)
    }

    async fn push_delete(
        &self,
        target: Target,
        entry_id: i64,
        id: &EntityId,
        pass: &mut Pass,
    ) -> Result<Outcome, PassError> {
        let Some(permanent) = pass.resolve(id) else {
            return self.retire(entry_id, "deleted before it reached the remote").await;
        };
        let remote_id = permanent.as_str().to_string();
        let existed = match target {
            Target::Reports => {
                remote::call(&self.remote, move |r| r.delete_report(&remote_id)).await?
            }
            Target::Files => remote::call(&self.remote, move |r| r.delete_file(&remote_id)).await?,
        };
        if !existed {
            crate::clog!("sync: {} already gone on the remote", logging::entity(&permanent));
        }
        self.storage.lock().await.mark_synced(entry_id)?;
        Ok(Outcome::Pushed)
    }

    async fn push_file_create(
        &self,
        entry_id: i64,
        snapshot: &MediaFile,
        pass: &mut Pass,
    ) -> Result<Outcome, PassError> {
        let local = snapshot.id.clone();
        if local.is_permanent() || pass.local_to_permanent.contains_key(local.as_str()) {
            return self.retire(entry_id, "file already uploaded").await;
        }

        let (current, watermark) = {
            let st = self.storage.lock().await;
            (st.get_file(&local)?, st.outbox_watermark()?)
        };
        let Some(current) = current else {
            return self.retire(entry_id, "file deleted before it was uploaded").await;
        };

        let owner = match pass.resolve(&current.report_id) {
            Some(owner) => owner,
            None => {
                let st = self.storage.lock().await;
                let owner_pending = st.get_report(&current.report_id)?.is_some()
                    || st.has_pending(Target::Reports, Action::Create, &current.report_id)?;
                drop(st);
                if owner_pending {
                    crate::clog!(
                        "sync: deferring {}, owner {} not synced yet",
                        logging::entry(entry_id),
                        logging::entity(&current.report_id)
                    );
                    return Ok(Outcome::Deferred);
                }
                return self.retire(entry_id, "owning report was deleted").await;
            }
        };

        let upload = FileUpload::new(&current, owner.as_str());
        let file_id = remote::call(&self.remote, move |r| r.upload_file(&upload)).await?;
        let permanent = EntityId::permanent(file_id);
        {
            let st = self.storage.lock().await;
            st.adopt_permanent_file(&local, &permanent, &owner, watermark)?;
            st.mark_synced(entry_id)?;
        }
        pass.local_to_permanent
            .insert(local.as_str().to_string(), permanent.clone());
        pass.report.remapped.push((local, permanent));
        Ok(Outcome::Pushed)
    }

    async fn push_file_update(
        &self,
        entry_id: i64,
        snapshot: &FileInfo,
        pass: &mut Pass,
    ) -> Result<Outcome, PassError> {
        if snapshot.id.is_local() {
            let why = if pass.resolve(&snapshot.id).is_some() {
                "folded into the upload"
            } else {
                "file never reached the remote"
            };
            return self.retire(entry_id, why).await;
        }
        let id = snapshot.id.as_str().to_string();
        let metadata = snapshot.metadata.clone();
        remote::call(&self.remote, move |r| r.update_file_metadata(&id, &metadata)).await?;
        self.storage.lock().await.mark_synced(entry_id)?;
        Ok(Outcome::Pushed)
    }
}

/// Run a pass after every settled offline-to-online transition.
///
/// Bursts of changes closer together than `debounce` collapse into one: the
/// loop waits until the state has been quiet for `debounce` before acting on
/// it. Returns when the connectivity feed is dropped.
pub async fn reconnect_sync_loop(
    driver: Arc<SyncDriver>,
    mut changes: watch::Receiver<bool>,
    debounce: Duration,
) {
    let mut was_online = *changes.borrow_and_update();
    loop {
        if changes.changed().await.is_err() {
            return;
        }
        let online = loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(debounce) => break *changes.borrow_and_update(),
            }
        };

        if online && !was_online {
            crate::clog!("connectivity: back online, syncing");
            if let Err(e) = driver.sync_pending_changes().await {
                crate::clog!("sync: pass failed: {e}");
            }
        } else if !online && was_online {
            crate::clog!("connectivity: offline, serving from the local store");
        }
        was_online = online;
    }
}
