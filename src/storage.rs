//! SQLite-backed durable local store.
//!
//! Holds the local copies of reports and media files together with the
//! outbox: the ordered log of mutations the remote service has not confirmed
//! yet. Every entity mutation writes its row and its outbox entry in one
//! transaction, so a crash never leaves one without the other.
//!
//! The store also owns identity reconciliation bookkeeping: the persisted
//! local-to-permanent id map and the rejection marks that keep an entry the
//! remote refused from being retried forever.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::clog;
use crate::logging;
use crate::model::{
    now_millis, Action, EntityId, FileInfo, IdOrigin, ListOptions, MediaFile, NewMediaFile,
    NewReport, OutboxEntry, OutboxOp, Rejection, Report, ReportPatch, SortOrder, Target,
};

/// Bumped whenever the table layout changes. A store written with any other
/// version is discarded and rebuilt.
pub const SCHEMA_VERSION: i64 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    /// The store could not be opened, even after recreating it.
    Unavailable(String),
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Serde(serde_json::Error),
    NotFound(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Unavailable(msg) => write!(f, "local store unavailable: {msg}"),
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
            StorageError::Serde(e) => write!(f, "serialization error: {e}"),
            StorageError::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e)
    }
}

/// How the schema looked when the store was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaState {
    /// Fresh database, schema written now.
    Created,
    /// Existing database with the expected schema.
    Ready,
    /// Existing data was discarded to get back to a usable store.
    Reset { reason: String },
}

impl SchemaState {
    pub fn is_reset(&self) -> bool {
        matches!(self, SchemaState::Reset { .. })
    }
}

/// Outcome of rekeying a locally created entity to its permanent id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Adoption {
    /// Pending entries for the local id that were retired.
    pub swept: usize,
    /// Entries re-enqueued under the permanent id because they were recorded
    /// after the pushed snapshot was read.
    pub requeued: usize,
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS reports (
        id                TEXT PRIMARY KEY,
        id_origin         TEXT NOT NULL,
        title             TEXT NOT NULL,
        description       TEXT NOT NULL,
        location          TEXT NOT NULL,
        specific_location TEXT,
        hazard_type       TEXT NOT NULL,
        severity          TEXT NOT NULL,
        status            TEXT NOT NULL,
        date_reported     INTEGER NOT NULL,
        reported_by       TEXT NOT NULL,
        coordinates       TEXT,
        media_files       TEXT NOT NULL DEFAULT '[]',
        contact_info      TEXT,
        created_at        INTEGER NOT NULL,
        updated_at        INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_reports_status ON reports(status);
    CREATE INDEX IF NOT EXISTS idx_reports_severity ON reports(severity);
    CREATE INDEX IF NOT EXISTS idx_reports_type ON reports(hazard_type);
    CREATE INDEX IF NOT EXISTS idx_reports_date ON reports(date_reported);

    CREATE TABLE IF NOT EXISTS files (
        id               TEXT PRIMARY KEY,
        id_origin        TEXT NOT NULL,
        report_id        TEXT NOT NULL,
        report_id_origin TEXT NOT NULL,
        filename         TEXT NOT NULL,
        content_type     TEXT NOT NULL,
        size_bytes       INTEGER NOT NULL,
        metadata         TEXT NOT NULL DEFAULT '{}',
        created_at       INTEGER NOT NULL,
        data             BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_files_report ON files(report_id);

    CREATE TABLE IF NOT EXISTS outbox (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        action      TEXT NOT NULL,
        target      TEXT NOT NULL,
        entity_id   TEXT NOT NULL,
        snapshot    TEXT NOT NULL,
        created_at  INTEGER NOT NULL,
        synced      INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(synced, created_at, id);
    CREATE INDEX IF NOT EXISTS idx_outbox_entity ON outbox(target, entity_id);

    CREATE TABLE IF NOT EXISTS id_map (
        local_id     TEXT PRIMARY KEY,
        permanent_id TEXT NOT NULL,
        target       TEXT NOT NULL,
        mapped_at    INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS outbox_rejections (
        entry_id    INTEGER PRIMARY KEY REFERENCES outbox(id),
        status      INTEGER NOT NULL,
        reason      TEXT NOT NULL,
        rejected_at INTEGER NOT NULL
    );
";

const REQUIRED_OBJECTS: &[(&str, &str)] = &[
    ("table", "reports"),
    ("table", "files"),
    ("table", "outbox"),
    ("table", "id_map"),
    ("table", "outbox_rejections"),
    ("index", "idx_reports_status"),
    ("index", "idx_reports_severity"),
    ("index", "idx_reports_type"),
    ("index", "idx_reports_date"),
    ("index", "idx_files_report"),
    ("index", "idx_outbox_pending"),
    ("index", "idx_outbox_entity"),
];

enum Inspection {
    Empty,
    Complete,
    Broken(String),
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

const REPORT_COLUMNS: &str = "id, id_origin, title, description, location, specific_location, \
     hazard_type, severity, status, date_reported, reported_by, coordinates, media_files, \
     contact_info, created_at, updated_at";

const FILE_INFO_COLUMNS: &str = "id, id_origin, report_id, report_id_origin, filename, \
     content_type, size_bytes, metadata, created_at";

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn json_opt<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conversion_error(idx, e))
}

fn entity_id(row: &Row<'_>, value_idx: usize, origin_idx: usize) -> rusqlite::Result<EntityId> {
    let value: String = row.get(value_idx)?;
    let origin: IdOrigin = parsed(row, origin_idx)?;
    Ok(EntityId::new(value, origin))
}

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<Report> {
    Ok(Report {
        id: entity_id(row, 0, 1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        location: row.get(4)?,
        specific_location: row.get(5)?,
        hazard_type: row.get(6)?,
        severity: parsed(row, 7)?,
        status: parsed(row, 8)?,
        date_reported: row.get::<_, i64>(9)? as u64,
        reported_by: row.get(10)?,
        coordinates: json_opt(row, 11)?,
        media_files: json(row, 12)?,
        contact_info: json_opt(row, 13)?,
        created_at: row.get::<_, i64>(14)? as u64,
        updated_at: row.get::<_, i64>(15)? as u64,
    })
}

fn file_info_from_row(row: &Row<'_>) -> rusqlite::Result<FileInfo> {
    Ok(FileInfo {
        id: entity_id(row, 0, 1)?,
        report_id: entity_id(row, 2, 3)?,
        filename: row.get(4)?,
        content_type: row.get(5)?,
        size: row.get::<_, i64>(6)? as u64,
        metadata: json(row, 7)?,
        created_at: row.get::<_, i64>(8)? as u64,
    })
}

fn media_file_from_row(row: &Row<'_>) -> rusqlite::Result<MediaFile> {
    let info = file_info_from_row(row)?;
    Ok(MediaFile {
        id: info.id,
        report_id: info.report_id,
        filename: info.filename,
        content_type: info.content_type,
        size: info.size,
        data: row.get(9)?,
        metadata: info.metadata,
        created_at: info.created_at,
    })
}

// ---------------------------------------------------------------------------
// Statement helpers shared by transactional operations
// ---------------------------------------------------------------------------

fn write_report(conn: &Connection, report: &Report) -> Result<(), StorageError> {
    let coordinates = report
        .coordinates
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let contact_info = report
        .contact_info
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT OR REPLACE INTO reports (id, id_origin, title, description, location,
             specific_location, hazard_type, severity, status, date_reported, reported_by,
             coordinates, media_files, contact_info, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            report.id.as_str(),
            report.id.origin().as_str(),
            report.title,
            report.description,
            report.location,
            report.specific_location,
            report.hazard_type,
            report.severity.as_str(),
            report.status.as_str(),
            report.date_reported as i64,
            report.reported_by,
            coordinates,
            serde_json::to_string(&report.media_files)?,
            contact_info,
            report.created_at as i64,
            report.updated_at as i64,
        ],
    )?;
    Ok(())
}

fn read_report(conn: &Connection, id: &str) -> Result<Option<Report>, StorageError> {
    let report = conn
        .query_row(
            &format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = ?1"),
            params![id],
            report_from_row,
        )
        .optional()?;
    Ok(report)
}

fn read_file(conn: &Connection, id: &str) -> Result<Option<MediaFile>, StorageError> {
    let file = conn
        .query_row(
            &format!("SELECT {FILE_INFO_COLUMNS}, data FROM files WHERE id = ?1"),
            params![id],
            media_file_from_row,
        )
        .optional()?;
    Ok(file)
}

fn read_file_info(conn: &Connection, id: &str) -> Result<Option<FileInfo>, StorageError> {
    let info = conn
        .query_row(
            &format!("SELECT {FILE_INFO_COLUMNS} FROM files WHERE id = ?1"),
            params![id],
            file_info_from_row,
        )
        .optional()?;
    Ok(info)
}

fn append_entry(conn: &Connection, op: &OutboxOp, now: u64) -> Result<i64, StorageError> {
    let snapshot = serde_json::to_string(op)?;
    conn.execute(
        "INSERT INTO outbox (action, target, entity_id, snapshot, created_at, synced)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![
            op.action().as_str(),
            op.target().as_str(),
            op.entity_id().as_str(),
            snapshot,
            now as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// A fresh edit may fix whatever the remote objected to, so it lifts the
/// rejection marks on the entity's pending entries.
fn clear_rejections_for(conn: &Connection, target: Target, entity: &str) -> Result<usize, StorageError> {
    let cleared = conn.execute(
        "DELETE FROM outbox_rejections WHERE entry_id IN
             (SELECT id FROM outbox WHERE synced = 0 AND target = ?1 AND entity_id = ?2)",
        params![target.as_str(), entity],
    )?;
    Ok(cleared)
}

fn action_list(actions: &[Action]) -> String {
    actions
        .iter()
        .map(|a| format!("'{}'", a.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn sweep(
    conn: &Connection,
    target: Target,
    actions: &[Action],
    entity: &str,
    up_to: i64,
) -> Result<usize, StorageError> {
    if actions.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "UPDATE outbox SET synced = 1
         WHERE synced = 0 AND target = ?1 AND entity_id = ?2 AND id <= ?3
           AND action IN ({})",
        action_list(actions)
    );
    Ok(conn.execute(&sql, params![target.as_str(), entity, up_to])?)
}

fn count_pending_after(
    conn: &Connection,
    target: Target,
    action: Action,
    entity: &str,
    after: i64,
) -> Result<i64, StorageError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM outbox
         WHERE synced = 0 AND target = ?1 AND action = ?2 AND entity_id = ?3 AND id > ?4",
        params![target.as_str(), action.as_str(), entity, after],
        |row| row.get(0),
    )?)
}

fn rewrite_media_files<F>(conn: &Connection, report_id: &str, edit: F) -> Result<bool, StorageError>
where
    F: FnOnce(&mut Vec<EntityId>),
{
    let raw: Option<String> = conn
        .query_row(
            "SELECT media_files FROM reports WHERE id = ?1",
            params![report_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(false);
    };
    let mut media: Vec<EntityId> = serde_json::from_str(&raw)?;
    edit(&mut media);
    conn.execute(
        "UPDATE reports SET media_files = ?2 WHERE id = ?1",
        params![report_id, serde_json::to_string(&media)?],
    )?;
    Ok(true)
}

fn record_mapping(conn: &Connection, local: &EntityId, permanent: &EntityId, target: Target) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR REPLACE INTO id_map (local_id, permanent_id, target, mapped_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![local.as_str(), permanent.as_str(), target.as_str(), now_millis() as i64],
    )?;
    Ok(())
}

fn remove_db_files(path: &Path) {
    let _ = std::fs::remove_file(path);
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        let _ = std::fs::remove_file(Path::new(&side));
    }
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Handle on the local SQLite database.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create the store at `path`.
    ///
    /// A file that is not a database, a wrong schema version, or a missing
    /// table or index all lead to the store being rebuilt empty; the returned
    /// [`SchemaState::Reset`] tells the caller local data was lost.
    pub fn open(path: &Path) -> Result<(Self, SchemaState), StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let storage = match Self::open_file(path) {
            Ok(storage) => storage,
            Err(e) => return Self::recreate(path, e.to_string()),
        };
        match storage.inspect_schema() {
            Ok(Inspection::Empty) => {
                storage.create_schema()?;
                Ok((storage, SchemaState::Created))
            }
            Ok(Inspection::Complete) => Ok((storage, SchemaState::Ready)),
            Ok(Inspection::Broken(reason)) => {
                clog!("storage: schema unusable ({reason}), rebuilding");
                storage.drop_all()?;
                storage.create_schema()?;
                Ok((storage, SchemaState::Reset { reason }))
            }
            Err(e) => {
                drop(storage);
                Self::recreate(path, e.to_string())
            }
        }
    }

    /// In-memory store, schema created. Used by tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    fn open_file(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    fn recreate(path: &Path, reason: String) -> Result<(Self, SchemaState), StorageError> {
        clog!("storage: {} is unreadable ({reason}), recreating", path.display());
        remove_db_files(path);
        let storage = Self::open_file(path)
            .map_err(|e| StorageError::Unavailable(format!("{}: {e}", path.display())))?;
        storage
            .create_schema()
            .map_err(|e| StorageError::Unavailable(format!("{}: {e}", path.display())))?;
        Ok((storage, SchemaState::Reset { reason }))
    }

    fn inspect_schema(&self) -> Result<Inspection, StorageError> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let mut stmt = self
            .conn
            .prepare("SELECT type, name FROM sqlite_master WHERE name NOT LIKE 'sqlite_%'")?;
        let present: HashSet<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        if present.is_empty() && version == 0 {
            return Ok(Inspection::Empty);
        }
        if version != SCHEMA_VERSION {
            return Ok(Inspection::Broken(format!(
                "schema version {version}, expected {SCHEMA_VERSION}"
            )));
        }
        let missing: Vec<&str> = REQUIRED_OBJECTS
            .iter()
            .filter(|(kind, name)| !present.contains(&(kind.to_string(), name.to_string())))
            .map(|(_, name)| *name)
            .collect();
        if missing.is_empty() {
            Ok(Inspection::Complete)
        } else {
            Ok(Inspection::Broken(format!("missing {}", missing.join(", "))))
        }
    }

    fn drop_all(&self) -> Result<(), StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT type, name FROM sqlite_master
             WHERE name NOT LIKE 'sqlite_%' AND type IN ('table', 'view', 'trigger')",
        )?;
        let objects: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        self.conn.execute_batch("PRAGMA foreign_keys=OFF;")?;
        for (kind, name) in objects {
            let kind = kind.to_uppercase();
            let name = name.replace('"', "\"\"");
            self.conn
                .execute_batch(&format!("DROP {kind} IF EXISTS \"{name}\";"))?;
        }
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(())
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(SCHEMA)?;
        self.conn
            .execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reports
    // -----------------------------------------------------------------------

    /// Create a report under a fresh local id and record a CREATE entry.
    pub fn create_report(&self, new: NewReport) -> Result<(Report, i64), StorageError> {
        let report = Report::from_new(EntityId::generate_local(), new, now_millis());
        let entry = self.put_report(&report)?;
        Ok((report, entry))
    }

    /// Write a report under the id it already carries, recording CREATE if
    /// the row is new and UPDATE otherwise.
    pub fn put_report(&self, report: &Report) -> Result<i64, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let exists = read_report(&tx, report.id.as_str())?.is_some();
        write_report(&tx, report)?;
        let op = if exists {
            OutboxOp::UpdateReport {
                report: report.clone(),
            }
        } else {
            OutboxOp::CreateReport {
                report: report.clone(),
            }
        };
        let entry = append_entry(&tx, &op, report.updated_at)?;
        clear_rejections_for(&tx, Target::Reports, report.id.as_str())?;
        tx.commit()?;
        Ok(entry)
    }

    /// Apply `patch` to the stored report. `None` when no such report exists.
    pub fn update_report(
        &self,
        id: &EntityId,
        patch: &ReportPatch,
    ) -> Result<Option<(Report, i64)>, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let Some(mut report) = read_report(&tx, id.as_str())? else {
            return Ok(None);
        };
        patch.apply(&mut report);
        report.updated_at = now_millis().max(report.updated_at);
        write_report(&tx, &report)?;
        let entry = append_entry(
            &tx,
            &OutboxOp::UpdateReport {
                report: report.clone(),
            },
            report.updated_at,
        )?;
        clear_rejections_for(&tx, Target::Reports, id.as_str())?;
        tx.commit()?;
        Ok(Some((report, entry)))
    }

    /// Remove a report. Its files stay until deleted on their own.
    pub fn delete_report(&self, id: &EntityId) -> Result<Option<i64>, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let Some(existing) = read_report(&tx, id.as_str())? else {
            return Ok(None);
        };
        tx.execute("DELETE FROM reports WHERE id = ?1", params![id.as_str()])?;
        let entry = append_entry(
            &tx,
            &OutboxOp::DeleteReport {
                id: existing.id.clone(),
            },
            now_millis(),
        )?;
        clear_rejections_for(&tx, Target::Reports, id.as_str())?;
        tx.commit()?;
        Ok(Some(entry))
    }

    pub fn get_report(&self, id: &EntityId) -> Result<Option<Report>, StorageError> {
        read_report(&self.conn, id.as_str())
    }

    pub fn list_reports(&self, options: &ListOptions) -> Result<Vec<Report>, StorageError> {
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = options.status {
            args.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(severity) = options.severity {
            args.push(severity.as_str().to_string());
            clauses.push(format!("severity = ?{}", args.len()));
        }
        if let Some(hazard_type) = &options.hazard_type {
            args.push(hazard_type.clone());
            clauses.push(format!("hazard_type = ?{}", args.len()));
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let order = match options.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let limit = options
            .limit
            .map(|n| format!("LIMIT {n}"))
            .unwrap_or_default();
        let sql = format!(
            "SELECT {REPORT_COLUMNS} FROM reports {filter}
             ORDER BY {} {order}, id {order} {limit}",
            options.sort_by.column()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), report_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Store a record fetched from the remote without recording an outbox
    /// entry. Skipped (returns false) while the report has unsent local
    /// changes, so a stale remote copy never overwrites them.
    pub fn cache_report(&self, report: &Report) -> Result<bool, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let pending: i64 = tx.query_row(
            "SELECT COUNT(*) FROM outbox WHERE synced = 0 AND target = ?1 AND entity_id = ?2",
            params![Target::Reports.as_str(), report.id.as_str()],
            |row| row.get(0),
        )?;
        if pending > 0 {
            return Ok(false);
        }
        let mut merged = report.clone();
        if let Some(existing) = read_report(&tx, report.id.as_str())? {
            for id in existing.media_files.iter().filter(|id| id.is_local()) {
                if !merged.media_files.contains(id) {
                    merged.media_files.push(id.clone());
                }
            }
        }
        write_report(&tx, &merged)?;
        tx.commit()?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    /// Store a media file under a fresh local id, link it into the owning
    /// report's media list and record a CREATE entry.
    pub fn create_file(&self, new: NewMediaFile) -> Result<(MediaFile, i64), StorageError> {
        let file = MediaFile {
            id: EntityId::generate_local(),
            report_id: new.report_id,
            filename: new.filename,
            content_type: new.content_type,
            size: new.data.len() as u64,
            data: new.data,
            metadata: new.metadata,
            created_at: now_millis(),
        };
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            &format!("INSERT INTO files ({FILE_INFO_COLUMNS}, data)
                      VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                file.id.as_str(),
                file.id.origin().as_str(),
                file.report_id.as_str(),
                file.report_id.origin().as_str(),
                file.filename,
                file.content_type,
                file.size as i64,
                serde_json::to_string(&file.metadata)?,
                file.created_at as i64,
                file.data,
            ],
        )?;
        let linked = rewrite_media_files(&tx, file.report_id.as_str(), |media| {
            media.push(file.id.clone());
        })?;
        if !linked {
            clog!(
                "storage: file {} references unknown report {}",
                logging::entity(&file.id),
                logging::entity(&file.report_id)
            );
        }
        let entry = append_entry(&tx, &OutboxOp::CreateFile { file: file.clone() }, file.created_at)?;
        tx.commit()?;
        Ok((file, entry))
    }

    pub fn get_file(&self, id: &EntityId) -> Result<Option<MediaFile>, StorageError> {
        read_file(&self.conn, id.as_str())
    }

    pub fn get_file_info(&self, id: &EntityId) -> Result<Option<FileInfo>, StorageError> {
        read_file_info(&self.conn, id.as_str())
    }

    pub fn list_files(&self, report_id: &EntityId) -> Result<Vec<FileInfo>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FILE_INFO_COLUMNS} FROM files WHERE report_id = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params![report_id.as_str()], file_info_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Merge `metadata` into the file's metadata object.
    pub fn update_file_metadata(
        &self,
        id: &EntityId,
        metadata: &Map<String, Value>,
    ) -> Result<Option<(FileInfo, i64)>, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let Some(mut info) = read_file_info(&tx, id.as_str())? else {
            return Ok(None);
        };
        for (key, value) in metadata {
            info.metadata.insert(key.clone(), value.clone());
        }
        tx.execute(
            "UPDATE files SET metadata = ?2 WHERE id = ?1",
            params![id.as_str(), serde_json::to_string(&info.metadata)?],
        )?;
        let entry = append_entry(&tx, &OutboxOp::UpdateFile { file: info.clone() }, now_millis())?;
        clear_rejections_for(&tx, Target::Files, id.as_str())?;
        tx.commit()?;
        Ok(Some((info, entry)))
    }

    pub fn delete_file(&self, id: &EntityId) -> Result<Option<i64>, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let Some(info) = read_file_info(&tx, id.as_str())? else {
            return Ok(None);
        };
        tx.execute("DELETE FROM files WHERE id = ?1", params![id.as_str()])?;
        rewrite_media_files(&tx, info.report_id.as_str(), |media| {
            media.retain(|m| m.as_str() != id.as_str());
        })?;
        let entry = append_entry(&tx, &OutboxOp::DeleteFile { id: info.id.clone() }, now_millis())?;
        clear_rejections_for(&tx, Target::Files, id.as_str())?;
        tx.commit()?;
        Ok(Some(entry))
    }

    // -----------------------------------------------------------------------
    // Outbox
    // -----------------------------------------------------------------------

    /// Append an entry without touching entity rows.
    pub fn enqueue_raw(&self, op: &OutboxOp) -> Result<i64, StorageError> {
        append_entry(&self.conn, op, now_millis())
    }

    /// Unsynced entries in replay order: `(created_at, id)` ascending.
    /// Entries whose snapshot cannot be decoded are logged and left out.
    pub fn scan_pending(&self) -> Result<Vec<OutboxEntry>, StorageError> {
        self.query_entries("WHERE o.synced = 0", [])
    }

    pub fn get_entry(&self, entry_id: i64) -> Result<Option<OutboxEntry>, StorageError> {
        Ok(self
            .query_entries("WHERE o.id = ?1", [entry_id])?
            .into_iter()
            .next())
    }

    fn query_entries<P: rusqlite::Params>(
        &self,
        filter: &str,
        args: P,
    ) -> Result<Vec<OutboxEntry>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT o.id, o.snapshot, o.created_at, o.synced, r.status, r.reason, r.rejected_at
             FROM outbox o LEFT JOIN outbox_rejections r ON r.entry_id = o.id
             {filter} ORDER BY o.created_at, o.id"
        ))?;
        let rows = stmt.query_map(args, |row| {
            let status: Option<i64> = row.get(4)?;
            let rejection = match status {
                Some(status) => Some(Rejection {
                    status: status as u16,
                    reason: row.get(5)?,
                    rejected_at: row.get::<_, i64>(6)? as u64,
                }),
                None => None,
            };
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? as u64,
                row.get::<_, i32>(3)? != 0,
                rejection,
            ))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (id, snapshot, created_at, synced, rejection) = row?;
            match serde_json::from_str::<OutboxOp>(&snapshot) {
                Ok(op) => result.push(OutboxEntry {
                    id,
                    op,
                    created_at,
                    synced,
                    rejection,
                }),
                Err(e) => clog!("storage: skipping undecodable entry {}: {e}", logging::entry(id)),
            }
        }
        Ok(result)
    }

    pub fn pending_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM outbox WHERE synced = 0", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_synced(&self, entry_id: i64) -> Result<bool, StorageError> {
        let synced: Option<i32> = self
            .conn
            .query_row(
                "SELECT synced FROM outbox WHERE id = ?1",
                params![entry_id],
                |row| row.get(0),
            )
            .optional()?;
        match synced {
            Some(flag) => Ok(flag != 0),
            None => Err(StorageError::NotFound(format!("outbox entry {entry_id}"))),
        }
    }

    /// Highest entry id recorded so far. Everything at or below it is
    /// reflected in rows read at the same time.
    pub fn outbox_watermark(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM outbox", [], |row| row.get(0))?)
    }

    pub fn mark_synced(&self, entry_id: i64) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE outbox SET synced = 1 WHERE id = ?1 AND synced = 0",
            params![entry_id],
        )?;
        Ok(affected > 0)
    }

    /// Retire every pending entry for `entity` with one of `actions`, up to
    /// and including entry `up_to`. Returns how many entries were retired.
    pub fn mark_duplicates_as_synced(
        &self,
        target: Target,
        actions: &[Action],
        entity: &EntityId,
        up_to: i64,
    ) -> Result<usize, StorageError> {
        sweep(&self.conn, target, actions, entity.as_str(), up_to)
    }

    /// Whether an unsynced entry exists for the entity with the given action.
    pub fn has_pending(&self, target: Target, action: Action, entity: &EntityId) -> Result<bool, StorageError> {
        Ok(count_pending_after(&self.conn, target, action, entity.as_str(), 0)? > 0)
    }

    pub fn record_rejection(&self, entry_id: i64, status: u16, reason: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO outbox_rejections (entry_id, status, reason, rejected_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![entry_id, status as i64, reason, now_millis() as i64],
        )?;
        Ok(())
    }

    /// Lift the rejection mark so the next pass tries the entry again.
    pub fn clear_rejection(&self, entry_id: i64) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "DELETE FROM outbox_rejections WHERE entry_id = ?1",
            params![entry_id],
        )?;
        Ok(affected > 0)
    }

    /// Give up on a pending entry: it is retired without reaching the remote.
    pub fn discard(&self, entry_id: i64) -> Result<bool, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let affected = tx.execute(
            "UPDATE outbox SET synced = 1 WHERE id = ?1 AND synced = 0",
            params![entry_id],
        )?;
        tx.execute(
            "DELETE FROM outbox_rejections WHERE entry_id = ?1",
            params![entry_id],
        )?;
        tx.commit()?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Identity reconciliation
    // -----------------------------------------------------------------------

    pub fn permanent_id_for(&self, local: &EntityId) -> Result<Option<EntityId>, StorageError> {
        let permanent: Option<String> = self
            .conn
            .query_row(
                "SELECT permanent_id FROM id_map WHERE local_id = ?1",
                params![local.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(permanent.map(EntityId::permanent))
    }

    /// Every recorded local-to-permanent mapping, keyed by local id.
    pub fn id_mappings(&self) -> Result<HashMap<String, EntityId>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT local_id, permanent_id FROM id_map")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (local, permanent) = row?;
            map.insert(local, EntityId::permanent(permanent));
        }
        Ok(map)
    }

    /// Rekey a locally created report to the id the remote assigned.
    ///
    /// In one transaction: the row moves to the permanent id, files pointing
    /// at the local id are repointed, the mapping is recorded, and every
    /// pending entry for the local id is retired. `sent_through` is the
    /// outbox watermark at the moment the pushed payload was read; edits
    /// recorded after it are re-enqueued against the permanent id instead of
    /// being lost.
    pub fn adopt_permanent_report(
        &self,
        local: &EntityId,
        remote: &Report,
        sent_through: i64,
    ) -> Result<Adoption, StorageError> {
        let permanent = remote.id.clone();
        let tx = self.conn.unchecked_transaction()?;
        let now = now_millis();
        let raced_updates =
            count_pending_after(&tx, Target::Reports, Action::Update, local.as_str(), sent_through)?;
        let raced_deletes =
            count_pending_after(&tx, Target::Reports, Action::Delete, local.as_str(), sent_through)?;
        let mut requeued = 0;

        match read_report(&tx, local.as_str())? {
            Some(current) => {
                let mut merged = if raced_updates > 0 {
                    current.clone()
                } else {
                    remote.clone()
                };
                merged.id = permanent.clone();
                merged.media_files = remote.media_files.clone();
                for id in &current.media_files {
                    if !merged.media_files.contains(id) {
                        merged.media_files.push(id.clone());
                    }
                }
                tx.execute("DELETE FROM reports WHERE id = ?1", params![local.as_str()])?;
                write_report(&tx, &merged)?;
                if raced_updates > 0 {
                    append_entry(&tx, &OutboxOp::UpdateReport { report: merged }, now)?;
                    requeued += 1;
                }
            }
            None if raced_deletes > 0 => {
                append_entry(
                    &tx,
                    &OutboxOp::DeleteReport {
                        id: permanent.clone(),
                    },
                    now,
                )?;
                requeued += 1;
            }
            None => write_report(&tx, remote)?,
        }

        tx.execute(
            "UPDATE files SET report_id = ?2, report_id_origin = ?3 WHERE report_id = ?1",
            params![local.as_str(), permanent.as_str(), IdOrigin::Permanent.as_str()],
        )?;
        record_mapping(&tx, local, &permanent, Target::Reports)?;
        let swept = sweep(
            &tx,
            Target::Reports,
            &[Action::Create, Action::Update, Action::Delete],
            local.as_str(),
            i64::MAX,
        )?;
        tx.commit()?;

        clog!(
            "storage: report {} is now {} (retired {swept}, requeued {requeued})",
            logging::entity(local),
            logging::entity(&permanent)
        );
        Ok(Adoption { swept, requeued })
    }

    /// Rekey a locally created file to the id the remote assigned and point
    /// it at its owner's permanent id. Mirrors [`Self::adopt_permanent_report`].
    pub fn adopt_permanent_file(
        &self,
        local: &EntityId,
        permanent: &EntityId,
        owner: &EntityId,
        sent_through: i64,
    ) -> Result<Adoption, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = now_millis();
        let raced_updates =
            count_pending_after(&tx, Target::Files, Action::Update, local.as_str(), sent_through)?;
        let raced_deletes =
            count_pending_after(&tx, Target::Files, Action::Delete, local.as_str(), sent_through)?;
        let mut requeued = 0;

        match read_file_info(&tx, local.as_str())? {
            Some(mut info) => {
                tx.execute(
                    "UPDATE files SET id = ?2, id_origin = ?3, report_id = ?4, report_id_origin = ?5
                     WHERE id = ?1",
                    params![
                        local.as_str(),
                        permanent.as_str(),
                        IdOrigin::Permanent.as_str(),
                        owner.as_str(),
                        owner.origin().as_str(),
                    ],
                )?;
                if raced_updates > 0 {
                    info.id = permanent.clone();
                    info.report_id = owner.clone();
                    append_entry(&tx, &OutboxOp::UpdateFile { file: info }, now)?;
                    requeued += 1;
                }
            }
            None if raced_deletes > 0 => {
                append_entry(
                    &tx,
                    &OutboxOp::DeleteFile {
                        id: permanent.clone(),
                    },
                    now,
                )?;
                requeued += 1;
            }
            None => {}
        }

        rewrite_media_files(&tx, owner.as_str(), |media| {
            for id in media.iter_mut() {
                if id == local {
                    *id = permanent.clone();
                }
            }
            let mut seen = HashSet::new();
            media.retain(|id| seen.insert(id.clone()));
        })?;
        record_mapping(&tx, local, permanent, Target::Files)?;
        let swept = sweep(
            &tx,
            Target::Files,
            &[Action::Create, Action::Update, Action::Delete],
            local.as_str(),
            i64::MAX,
        )?;
        tx.commit()?;

        clog!(
            "storage: file {} is now {} (retired {swept}, requeued {requeued})",
            logging::entity(local),
            logging::entity(permanent)
        );
        Ok(Adoption { swept, requeued })
    }
}
