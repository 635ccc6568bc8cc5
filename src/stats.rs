//! KPI and chart aggregation over locally stored reports, used when the
//! remote cannot answer.

use std::collections::{HashMap, HashSet};

use crate::model::{ChartData, ChartPoint, Kpis, Report, Severity, Status};

const DEFAULT_FILL: &str = "hsl(215, 20%, 65%)";

fn status_fill(status: Status) -> &'static str {
    match status {
        Status::Verified => "hsl(142, 76%, 36%)",
        Status::Unverified => "hsl(48, 96%, 53%)",
        Status::Closed => DEFAULT_FILL,
    }
}

fn severity_fill(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "hsl(0, 84%, 60%)",
        Severity::High => "hsl(25, 95%, 53%)",
        Severity::Medium => "hsl(48, 96%, 53%)",
        Severity::Low => "hsl(142, 76%, 36%)",
    }
}

/// Hazard types get evenly spaced hues in order of first appearance.
fn type_fill(index: usize, count: usize) -> String {
    let hue = (index * 360) as f64 / count.max(1) as f64;
    format!("hsl({hue}, 70%, 50%)")
}

pub fn kpis(reports: &[Report]) -> Kpis {
    let mut kpis = Kpis {
        total_reports: reports.len() as u64,
        ..Kpis::default()
    };
    let mut locations = HashSet::new();
    for report in reports {
        match report.status {
            Status::Verified => kpis.verified_reports += 1,
            Status::Unverified => kpis.pending_verification += 1,
            Status::Closed => kpis.closed_reports += 1,
        }
        if report.status != Status::Closed {
            if report.severity == Severity::Critical {
                kpis.critical_hazards += 1;
            }
            locations.insert(report.location.as_str());
        }
    }
    kpis.active_locations = locations.len() as u64;
    kpis
}

pub fn chart_data(reports: &[Report]) -> ChartData {
    let mut type_order: Vec<&str> = Vec::new();
    let mut type_counts: HashMap<&str, u64> = HashMap::new();
    let mut status_counts: HashMap<Status, u64> = HashMap::new();
    let mut severity_counts: HashMap<Severity, u64> = HashMap::new();

    for report in reports {
        let count = type_counts.entry(report.hazard_type.as_str()).or_insert(0);
        if *count == 0 {
            type_order.push(report.hazard_type.as_str());
        }
        *count += 1;
        *status_counts.entry(report.status).or_insert(0) += 1;
        *severity_counts.entry(report.severity).or_insert(0) += 1;
    }

    let hazards_by_type = type_order
        .iter()
        .enumerate()
        .map(|(index, name)| ChartPoint {
            name: name.to_string(),
            value: type_counts[name],
            fill: type_fill(index, type_order.len()),
        })
        .collect();

    // Only categories that occur; zero bars are left out.
    let hazards_by_status = Status::ALL
        .into_iter()
        .filter_map(|status| {
            status_counts.get(&status).map(|&value| ChartPoint {
                name: status.as_str().to_string(),
                value,
                fill: status_fill(status).to_string(),
            })
        })
        .collect();

    let hazards_by_severity = Severity::ALL
        .into_iter()
        .filter_map(|severity| {
            severity_counts.get(&severity).map(|&value| ChartPoint {
                name: severity.as_str().to_string(),
                value,
                fill: severity_fill(severity).to_string(),
            })
        })
        .collect();

    ChartData {
        hazards_by_type,
        hazards_by_status,
        hazards_by_severity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityId;

    fn report(hazard_type: &str, severity: Severity, status: Status, location: &str) -> Report {
        Report {
            id: EntityId::generate_local(),
            title: hazard_type.to_string(),
            description: String::new(),
            location: location.to_string(),
            specific_location: None,
            hazard_type: hazard_type.to_string(),
            severity,
            status,
            date_reported: 0,
            reported_by: "Asha".to_string(),
            coordinates: None,
            media_files: Vec::new(),
            contact_info: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn kpis_count_open_critical_and_locations() {
        let reports = vec![
            report("Oil Spill", Severity::Critical, Status::Verified, "Kochi"),
            report("Oil Spill", Severity::Critical, Status::Closed, "Kollam"),
            report("Flood", Severity::High, Status::Unverified, "Kochi"),
            report("Erosion", Severity::Low, Status::Unverified, "Varkala"),
        ];
        let kpis = kpis(&reports);
        assert_eq!(
            kpis,
            Kpis {
                total_reports: 4,
                verified_reports: 1,
                pending_verification: 2,
                closed_reports: 1,
                critical_hazards: 1,
                active_locations: 2,
            }
        );
    }

    #[test]
    fn chart_data_orders_types_by_first_appearance() {
        let reports = vec![
            report("Flood", Severity::High, Status::Unverified, "Kochi"),
            report("Oil Spill", Severity::Critical, Status::Verified, "Kochi"),
            report("Flood", Severity::Medium, Status::Unverified, "Kochi"),
        ];
        let charts = chart_data(&reports);
        let types: Vec<(&str, u64, &str)> = charts
            .hazards_by_type
            .iter()
            .map(|p| (p.name.as_str(), p.value, p.fill.as_str()))
            .collect();
        assert_eq!(
            types,
            vec![
                ("Flood", 2, "hsl(0, 70%, 50%)"),
                ("Oil Spill", 1, "hsl(180, 70%, 50%)"),
            ]
        );
        assert_eq!(type_fill(1, 7), "hsl(51.42857142857143, 70%, 50%)");
        assert_eq!(charts.hazards_by_status.len(), 2);
        assert_eq!(charts.hazards_by_status[0].name, "Unverified");
        assert_eq!(charts.hazards_by_status[0].fill, "hsl(48, 96%, 53%)");
        let critical = charts
            .hazards_by_severity
            .iter()
            .find(|p| p.name == "Critical")
            .unwrap();
        assert_eq!(critical.fill, "hsl(0, 84%, 60%)");
    }

    #[test]
    fn empty_store_yields_zeroes() {
        assert_eq!(kpis(&[]), Kpis::default());
        assert_eq!(chart_data(&[]), ChartData::default());
    }
}
