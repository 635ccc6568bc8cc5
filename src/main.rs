//! `cascade-sync`: operator command line over the hybrid coordinator.

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use serde_json::{Map, Value};

use cascade_sync::config::{Cli, Command, Config};
use cascade_sync::connectivity::Connectivity;
use cascade_sync::coordinator::HybridCoordinator;
use cascade_sync::http_remote::HttpRemote;
use cascade_sync::logging;
use cascade_sync::model::{
    now_millis, Coordinates, EntityId, ListOptions, NewMediaFile, NewReport, OutboxOp, ReportPatch,
    Severity, SortField, SortOrder, Status,
};
use cascade_sync::remote::{NoRemote, RemoteGateway};

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(error) = run(Cli::parse()).await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn probe(remote: &Arc<HttpRemote>) -> bool {
    let remote = Arc::clone(remote);
    tokio::task::spawn_blocking(move || remote.reachable())
        .await
        .unwrap_or(false)
}

fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn describe(op: &OutboxOp) -> String {
    format!(
        "{} {} {}",
        op.action().as_str(),
        op.target().as_str(),
        logging::entity(op.entity_id())
    )
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = Config::from_cli_and_env(&cli.global);

    let http = match (&config.remote_url, config.force_offline) {
        (Some(url), false) => Some(Arc::new(HttpRemote::new(url, config.timeout))),
        _ => None,
    };
    let online = match &http {
        Some(remote) => probe(remote).await,
        None => false,
    };
    let remote: Arc<dyn RemoteGateway> = match &http {
        Some(remote) => Arc::clone(remote) as Arc<dyn RemoteGateway>,
        None => Arc::new(NoRemote) as Arc<dyn RemoteGateway>,
    };
    let connectivity = Connectivity::new(online);

    let (coordinator, state) =
        HybridCoordinator::open(&config.db_path(), remote, connectivity.clone())?;
    if state.is_reset() {
        eprintln!("warning: the local store was unreadable and has been reset");
    }
    let coordinator = coordinator.with_debounce(config.debounce);
    let _sync_loop = coordinator.initialize().await?;

    match cli.command {
        Command::Status => {
            println!("store:   {}", config.db_path().display());
            println!(
                "remote:  {}",
                config.remote_url.as_deref().unwrap_or("(none)")
            );
            println!(
                "online:  {}",
                if coordinator.is_online() { "yes" } else { "no" }
            );
            println!("pending: {}", coordinator.pending_count().await?);
        }
        Command::Pending => {
            let entries = coordinator.pending_changes().await?;
            if entries.is_empty() {
                println!("nothing pending");
            }
            for entry in entries {
                let note = entry
                    .rejection
                    .map(|r| format!("  [rejected {}: {}]", r.status, r.reason))
                    .unwrap_or_default();
                println!("{} {}{note}", logging::entry(entry.id), describe(&entry.op));
            }
        }
        Command::Sync => {
            let report = coordinator.sync_pending_changes().await?;
            println!(
                "{:?}: pushed {}, retired {}, deferred {}, failed {}, rejected {}, blocked {}",
                report.status,
                report.pushed,
                report.retired,
                report.deferred,
                report.failed,
                report.rejected,
                report.blocked
            );
            for (local, permanent) in &report.remapped {
                println!("  {local} -> {permanent}");
            }
        }
        Command::List {
            limit,
            sort_by,
            order,
            status,
            severity,
            hazard_type,
        } => {
            let options = ListOptions {
                limit,
                sort_by: sort_by.parse::<SortField>()?,
                order: order.parse::<SortOrder>()?,
                status: status.map(|s| s.parse::<Status>()).transpose()?,
                severity: severity.map(|s| s.parse::<Severity>()).transpose()?,
                hazard_type,
            };
            for report in coordinator.get_all_hazards(&options).await? {
                println!(
                    "{}  {:<10}  {:<8}  {}  ({})",
                    report.id,
                    report.status.as_str(),
                    report.severity.as_str(),
                    report.title,
                    report.location
                );
            }
        }
        Command::Show { id } => match coordinator.get_hazard_by_id(&EntityId::parse(&id)).await? {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => println!("no report {id}"),
        },
        Command::Report {
            title,
            description,
            location,
            specific_location,
            hazard_type,
            severity,
            reported_by,
            lat,
            lng,
        } => {
            let new = NewReport {
                title,
                description,
                location,
                specific_location,
                hazard_type,
                severity: severity.parse()?,
                status: Status::Unverified,
                date_reported: now_millis(),
                reported_by,
                coordinates: lat.zip(lng).map(|(lat, lng)| Coordinates { lat, lng }),
                media_files: Vec::new(),
                contact_info: None,
            };
            let report = coordinator.create_hazard(new).await?;
            let note = if report.id.is_local() {
                " (stored locally, will sync later)"
            } else {
                ""
            };
            println!("{}{note}", report.id);
        }
        Command::SetStatus { id, status } => {
            let patch = ReportPatch::status(status.parse()?);
            match coordinator.update_hazard(&EntityId::parse(&id), &patch).await? {
                Some(report) => println!("{} is now {}", report.id, report.status.as_str()),
                None => println!("no report {id}"),
            }
        }
        Command::Delete { id } => {
            if coordinator.delete_hazard(&EntityId::parse(&id)).await? {
                println!("deleted {id}");
            } else {
                println!("no report {id}");
            }
        }
        Command::Attach {
            report_id,
            path,
            content_type,
        } => {
            let data = std::fs::read(&path)?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".to_string());
            let mut metadata = Map::new();
            metadata.insert("originalName".to_string(), Value::String(filename.clone()));
            let new = NewMediaFile {
                report_id: EntityId::parse(&report_id),
                filename,
                content_type: content_type
                    .unwrap_or_else(|| guess_content_type(&path).to_string()),
                data,
                metadata,
            };
            let info = coordinator.upload_file(new).await?;
            println!("{} ({} bytes) attached to {}", info.id, info.size, info.report_id);
        }
        Command::Discard { entry } => {
            if coordinator.discard_pending(entry).await? {
                println!("discarded {}", logging::entry(entry));
            } else {
                println!("{} is not pending", logging::entry(entry));
            }
        }
        Command::Retry { entry } => {
            if coordinator.retry_rejected(entry).await? {
                println!("{} will be retried on the next sync", logging::entry(entry));
            } else {
                println!("{} has no rejection", logging::entry(entry));
            }
        }
        Command::Kpis => {
            let kpis = coordinator.get_kpis().await?;
            println!("{}", serde_json::to_string_pretty(&kpis)?);
        }
        Command::Watch => {
            let Some(http) = http else {
                return Err("watch needs a remote URL and no --offline".into());
            };
            println!(
                "watching {} every {}s, ctrl-c to stop",
                http.base_url(),
                config.probe_interval.as_secs()
            );
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = tokio::time::sleep(config.probe_interval) => {
                        let reachable = probe(&http).await;
                        if connectivity.set_online(reachable) {
                            let state = if reachable { "online" } else { "offline" };
                            println!("{state}, {} pending", coordinator.pending_count().await?);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
