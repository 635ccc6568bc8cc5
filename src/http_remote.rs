//! [`RemoteGateway`] over the service's REST API.
//!
//! Documents on the wire use `_id` for identity, camelCase field names and
//! RFC 3339 timestamps. Files are uploaded as the raw request body with the
//! owning report passed as a query parameter.

use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{
    ChartData, ContactInfo, Coordinates, EntityId, FileInfo, Kpis, ListOptions, MediaFile,
    NewReport, Report, Severity, Status,
};
use crate::remote::{FileUpload, RemoteError, RemoteGateway};

// ---------------------------------------------------------------------------
// Wire documents
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportDoc {
    #[serde(rename = "_id")]
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    specific_location: Option<String>,
    hazard_type: String,
    severity: Severity,
    status: Status,
    date_reported: DateTime<Utc>,
    #[serde(default)]
    reported_by: String,
    #[serde(default)]
    coordinates: Option<Coordinates>,
    #[serde(default)]
    media_files: Vec<String>,
    #[serde(default)]
    contact_info: Option<ContactInfo>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl From<ReportDoc> for Report {
    fn from(doc: ReportDoc) -> Self {
        let created_at = doc.created_at.map(to_millis).unwrap_or_default();
        Report {
            id: EntityId::permanent(doc.id),
            title: doc.title,
            description: doc.description,
            location: doc.location,
            specific_location: doc.specific_location,
            hazard_type: doc.hazard_type,
            severity: doc.severity,
            status: doc.status,
            date_reported: to_millis(doc.date_reported),
            reported_by: doc.reported_by,
            coordinates: doc.coordinates,
            media_files: doc.media_files.into_iter().map(EntityId::permanent).collect(),
            contact_info: doc.contact_info,
            created_at,
            updated_at: doc.updated_at.map(to_millis).unwrap_or(created_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportBody<'a> {
    title: &'a str,
    description: &'a str,
    location: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    specific_location: Option<&'a str>,
    hazard_type: &'a str,
    severity: Severity,
    status: Status,
    date_reported: DateTime<Utc>,
    reported_by: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    coordinates: Option<Coordinates>,
    media_files: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    contact_info: Option<&'a ContactInfo>,
}

impl<'a> From<&'a NewReport> for ReportBody<'a> {
    fn from(report: &'a NewReport) -> Self {
        ReportBody {
            title: &report.title,
            description: &report.description,
            location: &report.location,
            specific_location: report.specific_location.as_deref(),
            hazard_type: &report.hazard_type,
            severity: report.severity,
            status: report.status,
            date_reported: from_millis(report.date_reported),
            reported_by: &report.reported_by,
            coordinates: report.coordinates,
            media_files: report
                .media_files
                .iter()
                .filter(|id| id.is_permanent())
                .map(EntityId::as_str)
                .collect(),
            contact_info: report.contact_info.as_ref(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HazardEnvelope {
    hazard: ReportDoc,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileDoc {
    #[serde(rename = "_id")]
    id: String,
    filename: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    length: u64,
    #[serde(default)]
    upload_date: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl From<FileDoc> for FileInfo {
    fn from(doc: FileDoc) -> Self {
        let mut metadata = doc.metadata;
        let report_id = match metadata.remove("reportId") {
            Some(Value::String(id)) => id,
            _ => String::new(),
        };
        let content_type = match metadata.remove("contentType") {
            Some(Value::String(ct)) => Some(ct),
            _ => None,
        };
        FileInfo {
            id: EntityId::permanent(doc.id),
            report_id: EntityId::permanent(report_id),
            filename: doc.filename,
            content_type: doc
                .content_type
                .or(content_type)
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: doc.length,
            metadata,
            created_at: doc.upload_date.map(to_millis).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

fn to_millis(dt: DateTime<Utc>) -> u64 {
    dt.timestamp_millis().max(0) as u64
}

fn from_millis(ms: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms as i64).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Transport failures, timeouts, 5xx, 408 and 429 are transient; every other
/// status means the remote refused the request as sent.
fn classify(error: ureq::Error) -> RemoteError {
    match error {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            if code >= 500 || code == 408 || code == 429 {
                RemoteError::Unavailable(format!("remote returned {code}: {message}"))
            } else {
                RemoteError::Rejected {
                    status: code,
                    message,
                }
            }
        }
        ureq::Error::Transport(transport) => RemoteError::Unavailable(transport.to_string()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(response: ureq::Response, what: &str) -> Result<T, RemoteError> {
    response
        .into_json()
        .map_err(|e| RemoteError::Unavailable(format!("decode {what}: {e}")))
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct HttpRemote {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Whether the service answers at all. Any response short of a server
    /// error counts.
    pub fn reachable(&self) -> bool {
        match self.agent.get(&self.url("/api/kpis")).call() {
            Ok(_) => true,
            Err(ureq::Error::Status(code, _)) => code < 500,
            Err(ureq::Error::Transport(_)) => false,
        }
    }
}

impl RemoteGateway for HttpRemote {
    fn list_reports(&self, options: &ListOptions) -> Result<Vec<Report>, RemoteError> {
        let mut request = self
            .agent
            .get(&self.url("/api/hazards"))
            .query("sortBy", options.sort_by.wire_name())
            .query("sortOrder", options.order.as_str());
        if let Some(limit) = options.limit {
            request = request.query("limit", &limit.to_string());
        }
        if let Some(status) = options.status {
            request = request.query("status", status.as_str());
        }
        if let Some(severity) = options.severity {
            request = request.query("severity", severity.as_str());
        }
        if let Some(hazard_type) = &options.hazard_type {
            request = request.query("hazardType", hazard_type);
        }
        let response = request.call().map_err(classify)?;
        let docs: Vec<ReportDoc> = decode(response, "report list")?;
        Ok(docs.into_iter().map(Report::from).collect())
    }

    fn get_report(&self, id: &str) -> Result<Option<Report>, RemoteError> {
        match self.agent.get(&self.url(&format!("/api/hazards/{id}"))).call() {
            Ok(response) => {
                let envelope: HazardEnvelope = decode(response, "report")?;
                Ok(Some(envelope.hazard.into()))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(classify(e)),
        }
    }

    fn create_report(&self, report: &NewReport) -> Result<Report, RemoteError> {
        let response = self
            .agent
            .post(&self.url("/api/hazards"))
            .send_json(ReportBody::from(report))
            .map_err(classify)?;
        let doc: ReportDoc = decode(response, "created report")?;
        Ok(doc.into())
    }

    fn update_report(&self, id: &str, report: &NewReport) -> Result<Report, RemoteError> {
        let response = self
            .agent
            .put(&self.url(&format!("/api/hazards/{id}")))
            .send_json(ReportBody::from(report))
            .map_err(classify)?;
        let doc: ReportDoc = decode(response, "updated report")?;
        Ok(doc.into())
    }

    fn delete_report(&self, id: &str) -> Result<bool, RemoteError> {
        match self.agent.delete(&self.url(&format!("/api/hazards/{id}"))).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }

    fn kpis(&self) -> Result<Kpis, RemoteError> {
        let response = self.agent.get(&self.url("/api/kpis")).call().map_err(classify)?;
        decode(response, "kpis")
    }

    fn chart_data(&self) -> Result<ChartData, RemoteError> {
        let response = self
            .agent
            .get(&self.url("/api/charts"))
            .call()
            .map_err(classify)?;
        decode(response, "chart data")
    }

    fn upload_file(&self, upload: &FileUpload) -> Result<String, RemoteError> {
        let metadata = Value::Object(upload.metadata.clone()).to_string();
        let response = self
            .agent
            .post(&self.url("/api/upload"))
            .query("reportId", &upload.report_id)
            .query("filename", &upload.filename)
            .query("metadata", &metadata)
            .set("Content-Type", &upload.content_type)
            .send_bytes(&upload.data)
            .map_err(classify)?;
        let body: UploadResponse = decode(response, "upload response")?;
        body.file_ids
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::Unavailable("upload response carried no file id".to_string()))
    }

    fn get_file(&self, id: &str) -> Result<Option<MediaFile>, RemoteError> {
        let info = match self
            .agent
            .get(&self.url(&format!("/api/files/{id}/metadata")))
            .call()
        {
            Ok(response) => FileInfo::from(decode::<FileDoc>(response, "file metadata")?),
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(e) => return Err(classify(e)),
        };
        let response = match self.agent.get(&self.url(&format!("/api/files/{id}"))).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(e) => return Err(classify(e)),
        };
        let mut data = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut data)
            .map_err(|e| RemoteError::Unavailable(format!("read file body: {e}")))?;
        Ok(Some(MediaFile {
            id: info.id,
            report_id: info.report_id,
            filename: info.filename,
            content_type: info.content_type,
            size: data.len() as u64,
            data,
            metadata: info.metadata,
            created_at: info.created_at,
        }))
    }

    fn list_files(&self, report_id: &str) -> Result<Vec<FileInfo>, RemoteError> {
        let response = self
            .agent
            .get(&self.url("/api/files"))
            .query("reportId", report_id)
            .call()
            .map_err(classify)?;
        let docs: Vec<FileDoc> = decode(response, "file list")?;
        Ok(docs.into_iter().map(FileInfo::from).collect())
    }

    fn update_file_metadata(
        &self,
        id: &str,
        metadata: &Map<String, Value>,
    ) -> Result<FileInfo, RemoteError> {
        let response = self
            .agent
            .request("PATCH", &self.url(&format!("/api/files/{id}/metadata")))
            .send_json(metadata)
            .map_err(classify)?;
        let doc: FileDoc = decode(response, "file metadata")?;
        Ok(doc.into())
    }

    fn delete_file(&self, id: &str) -> Result<bool, RemoteError> {
        match self.agent.delete(&self.url(&format!("/api/files/{id}"))).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_doc_maps_wire_fields() {
        let json = r#"{
            "_id": "65a0f0c2e4b0a1b2c3d4e5f6",
            "title": "Oil Spill",
            "description": "Sheen near the jetty",
            "location": "Kochi",
            "hazardType": "Oil Spill",
            "severity": "Critical",
            "status": "Verified",
            "dateReported": "2024-01-12T08:30:00Z",
            "reportedBy": "Asha",
            "mediaFiles": ["65a0f0c2e4b0a1b2c3d4e5f7"],
            "createdAt": "2024-01-12T08:31:00.000Z"
        }"#;
        let doc: ReportDoc = serde_json::from_str(json).unwrap();
        let report = Report::from(doc);
        assert!(report.id.is_permanent());
        assert_eq!(report.severity, Severity::Critical);
        assert_eq!(report.date_reported, 1_705_048_200_000);
        assert_eq!(report.updated_at, report.created_at);
        assert!(report.media_files[0].is_permanent());
    }

    #[test]
    fn report_body_uses_camel_case_and_rfc3339() {
        let new = NewReport {
            title: "Flood".to_string(),
            description: String::new(),
            location: "Alappuzha".to_string(),
            specific_location: None,
            hazard_type: "Flood".to_string(),
            severity: Severity::High,
            status: Status::Unverified,
            date_reported: 1_705_048_200_000,
            reported_by: "Ravi".to_string(),
            coordinates: None,
            media_files: vec![
                EntityId::permanent("65a0f0c2e4b0a1b2c3d4e5f7"),
                EntityId::local("0f8fad5b-d9cb-469f-a165-70867728950e"),
            ],
            contact_info: None,
        };
        let value = serde_json::to_value(ReportBody::from(&new)).unwrap();
        assert_eq!(value["hazardType"], "Flood");
        assert_eq!(value["dateReported"], "2024-01-12T08:30:00Z");
        assert_eq!(value["mediaFiles"].as_array().unwrap().len(), 1);
        assert!(value.get("specificLocation").is_none());
    }

    #[test]
    fn file_doc_pulls_owner_from_metadata() {
        let json = r#"{
            "_id": "65a0f0c2e4b0a1b2c3d4e5f8",
            "filename": "sheen.jpg",
            "length": 2048,
            "metadata": {"reportId": "65a0f0c2e4b0a1b2c3d4e5f6", "contentType": "image/jpeg", "camera": "rear"}
        }"#;
        let info = FileInfo::from(serde_json::from_str::<FileDoc>(json).unwrap());
        assert_eq!(info.report_id.as_str(), "65a0f0c2e4b0a1b2c3d4e5f6");
        assert_eq!(info.content_type, "image/jpeg");
        assert_eq!(info.size, 2048);
        assert_eq!(info.metadata.len(), 1);
    }
}
