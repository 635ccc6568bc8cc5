//! Domain types shared by the local store, the remote gateway and the
//! coordinator: reports, media files, identities and outbox operations.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current time as milliseconds since UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Returned when a stored or user-supplied string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Where an identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdOrigin {
    /// Generated on this client; only valid until the remote confirms the entity.
    Local,
    /// Assigned by the remote service.
    Permanent,
}

impl IdOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdOrigin::Local => "local",
            IdOrigin::Permanent => "permanent",
        }
    }
}

impl FromStr for IdOrigin {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(IdOrigin::Local),
            "permanent" => Ok(IdOrigin::Permanent),
            other => Err(UnknownVariant {
                kind: "id origin",
                value: other.to_string(),
            }),
        }
    }
}

/// An entity identifier tagged with its origin.
///
/// The origin travels with the value everywhere (rows, snapshots, foreign
/// references) so nothing downstream has to guess it from the string shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    value: String,
    origin: IdOrigin,
}

impl EntityId {
    pub fn new(value: impl Into<String>, origin: IdOrigin) -> Self {
        Self {
            value: value.into(),
            origin,
        }
    }

    pub fn local(value: impl Into<String>) -> Self {
        Self::new(value, IdOrigin::Local)
    }

    pub fn permanent(value: impl Into<String>) -> Self {
        Self::new(value, IdOrigin::Permanent)
    }

    /// Generate a fresh local identifier: 16 random bytes from the OS RNG,
    /// formatted as an RFC 4122 version-4 UUID.
    pub fn generate_local() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        let h = hex::encode(bytes);
        let value = format!(
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        );
        Self::local(value)
    }

    /// Classify an untyped identifier by its shape.
    ///
    /// Only for input that arrives without an origin (command-line arguments,
    /// hand-written JSON). Everything the crate stores carries its origin.
    pub fn parse(raw: &str) -> Self {
        if has_local_shape(raw) {
            Self::local(raw)
        } else {
            Self::permanent(raw)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn origin(&self) -> IdOrigin {
        self.origin
    }

    pub fn is_local(&self) -> bool {
        self.origin == IdOrigin::Local
    }

    pub fn is_permanent(&self) -> bool {
        self.origin == IdOrigin::Permanent
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// 36 characters, hyphens at 8/13/18/23, hex digits elsewhere.
pub fn has_local_shape(raw: &str) -> bool {
    raw.len() == 36
        && raw.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Verification status of a report. Any status may follow any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Unverified,
    Verified,
    Closed,
}

impl Status {
    pub const ALL: [Status; 3] = [Status::Unverified, Status::Verified, Status::Closed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unverified => "Unverified",
            Status::Verified => "Verified",
            Status::Closed => "Closed",
        }
    }
}

impl FromStr for Status {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant {
                kind: "status",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

impl FromStr for Severity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant {
                kind: "severity",
                value: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// One hazard observation. Timestamps are milliseconds since UNIX epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: EntityId,
    pub title: String,
    pub description: String,
    pub location: String,
    #[serde(default)]
    pub specific_location: Option<String>,
    pub hazard_type: String,
    pub severity: Severity,
    pub status: Status,
    pub date_reported: u64,
    pub reported_by: String,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub media_files: Vec<EntityId>,
    #[serde(default)]
    pub contact_info: Option<ContactInfo>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Report {
    pub fn from_new(id: EntityId, new: NewReport, now: u64) -> Self {
        Self {
            id,
            title: new.title,
            description: new.description,
            location: new.location,
            specific_location: new.specific_location,
            hazard_type: new.hazard_type,
            severity: new.severity,
            status: new.status,
            date_reported: new.date_reported,
            reported_by: new.reported_by,
            coordinates: new.coordinates,
            media_files: new.media_files,
            contact_info: new.contact_info,
            created_at: now,
            updated_at: now,
        }
    }
}

fn default_status() -> Status {
    Status::Unverified
}

/// Report content without identity or bookkeeping timestamps: what a caller
/// submits, and what is sent to the remote on create/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReport {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub location: String,
    #[serde(default)]
    pub specific_location: Option<String>,
    pub hazard_type: String,
    pub severity: Severity,
    #[serde(default = "default_status")]
    pub status: Status,
    pub date_reported: u64,
    pub reported_by: String,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub media_files: Vec<EntityId>,
    #[serde(default)]
    pub contact_info: Option<ContactInfo>,
}

/// Strips identity and timestamps. Media references that are still local are
/// dropped: the remote links those files itself when they are uploaded.
impl From<&Report> for NewReport {
    fn from(report: &Report) -> Self {
        Self {
            title: report.title.clone(),
            description: report.description.clone(),
            location: report.location.clone(),
            specific_location: report.specific_location.clone(),
            hazard_type: report.hazard_type.clone(),
            severity: report.severity,
            status: report.status,
            date_reported: report.date_reported,
            reported_by: report.reported_by.clone(),
            coordinates: report.coordinates,
            media_files: report
                .media_files
                .iter()
                .filter(|id| id.is_permanent())
                .cloned()
                .collect(),
            contact_info: report.contact_info.clone(),
        }
    }
}

/// Partial edit of a report. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub specific_location: Option<String>,
    pub hazard_type: Option<String>,
    pub severity: Option<Severity>,
    pub status: Option<Status>,
    pub date_reported: Option<u64>,
    pub reported_by: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub media_files: Option<Vec<EntityId>>,
    pub contact_info: Option<ContactInfo>,
}

impl ReportPatch {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, report: &mut Report) {
        if let Some(v) = &self.title {
            report.title = v.clone();
        }
        if let Some(v) = &self.description {
            report.description = v.clone();
        }
        if let Some(v) = &self.location {
            report.location = v.clone();
        }
        if let Some(v) = &self.specific_location {
            report.specific_location = Some(v.clone());
        }
        if let Some(v) = &self.hazard_type {
            report.hazard_type = v.clone();
        }
        if let Some(v) = self.severity {
            report.severity = v;
        }
        if let Some(v) = self.status {
            report.status = v;
        }
        if let Some(v) = self.date_reported {
            report.date_reported = v;
        }
        if let Some(v) = &self.reported_by {
            report.reported_by = v.clone();
        }
        if let Some(v) = self.coordinates {
            report.coordinates = Some(v);
        }
        if let Some(v) = &self.media_files {
            report.media_files = v.clone();
        }
        if let Some(v) = &self.contact_info {
            report.contact_info = Some(v.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Media files
// ---------------------------------------------------------------------------

/// An uploaded binary attachment, payload included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    pub id: EntityId,
    /// Owning report, expressed with whatever id the report had at creation.
    pub report_id: EntityId,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    #[serde(with = "b64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: u64,
}

impl MediaFile {
    pub fn info(&self) -> FileInfo {
        FileInfo {
            id: self.id.clone(),
            report_id: self.report_id.clone(),
            filename: self.filename.clone(),
            content_type: self.content_type.clone(),
            size: self.size,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        }
    }
}

/// A media file without its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: EntityId,
    pub report_id: EntityId,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMediaFile {
    pub report_id: EntityId,
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
    pub metadata: Map<String, Value>,
}

mod b64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    DateReported,
    CreatedAt,
    UpdatedAt,
    Title,
}

impl SortField {
    /// Field name used by the remote API.
    pub fn wire_name(&self) -> &'static str {
        match self {
            SortField::DateReported => "dateReported",
            SortField::CreatedAt => "createdAt",
            SortField::UpdatedAt => "updatedAt",
            SortField::Title => "title",
        }
    }

    pub(crate) fn column(&self) -> &'static str {
        match self {
            SortField::DateReported => "date_reported",
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::Title => "title",
        }
    }
}

impl FromStr for SortField {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dateReported" | "date_reported" | "date" => Ok(SortField::DateReported),
            "createdAt" | "created_at" => Ok(SortField::CreatedAt),
            "updatedAt" | "updated_at" => Ok(SortField::UpdatedAt),
            "title" => Ok(SortField::Title),
            other => Err(UnknownVariant {
                kind: "sort field",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

impl FromStr for SortOrder {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(UnknownVariant {
                kind: "sort order",
                value: s.to_string(),
            }),
        }
    }
}

/// Listing options for reports. Defaults to newest-reported first, unbounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub sort_by: SortField,
    pub order: SortOrder,
    pub status: Option<Status>,
    pub severity: Option<Severity>,
    pub hazard_type: Option<String>,
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kpis {
    pub total_reports: u64,
    pub verified_reports: u64,
    pub pending_verification: u64,
    pub closed_reports: u64,
    pub critical_hazards: u64,
    pub active_locations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub name: String,
    pub value: u64,
    pub fill: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub hazards_by_type: Vec<ChartPoint>,
    pub hazards_by_status: Vec<ChartPoint>,
    pub hazards_by_severity: Vec<ChartPoint>,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Entity table an outbox entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Reports,
    Files,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Reports => "reports",
            Target::Files => "files",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }
}

/// One recorded mutation with the snapshot taken when it was enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OutboxOp {
    CreateReport { report: Report },
    UpdateReport { report: Report },
    DeleteReport { id: EntityId },
    CreateFile { file: MediaFile },
    UpdateFile { file: FileInfo },
    DeleteFile { id: EntityId },
}

impl OutboxOp {
    pub fn target(&self) -> Target {
        match self {
            OutboxOp::CreateReport { .. }
            | OutboxOp::UpdateReport { .. }
            | OutboxOp::DeleteReport { .. } => Target::Reports,
            OutboxOp::CreateFile { .. }
            | OutboxOp::UpdateFile { .. }
            | OutboxOp::DeleteFile { .. } => Target::Files,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            OutboxOp::CreateReport { .. } | OutboxOp::CreateFile { .. } => Action::Create,
            OutboxOp::UpdateReport { .. } | OutboxOp::UpdateFile { .. } => Action::Update,
            OutboxOp::DeleteReport { .. } | OutboxOp::DeleteFile { .. } => Action::Delete,
        }
    }

    /// Identifier of the entity the snapshot describes.
    pub fn entity_id(&self) -> &EntityId {
        match self {
            OutboxOp::CreateReport { report } | OutboxOp::UpdateReport { report } => &report.id,
            OutboxOp::CreateFile { file } => &file.id,
            OutboxOp::UpdateFile { file } => &file.id,
            OutboxOp::DeleteReport { id } | OutboxOp::DeleteFile { id } => id,
        }
    }
}

/// A rejection recorded against an outbox entry. Rejected entries are not
/// retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub status: u16,
    pub reason: String,
    pub rejected_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: i64,
    pub op: OutboxOp,
    pub created_at: u64,
    pub synced: bool,
    pub rejection: Option<Rejection>,
}
