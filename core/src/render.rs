use crate::analytics::{Severity, VulnerabilityAnalytics};
use crate::record::ScanRecord;
use crate::report::{HostStatus, ParsedReport};
use comfy_table::{presets::ASCII_FULL, Table};
use std::fmt::Write;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(ASCII_FULL);
    table.set_header(header.to_vec());
    table
}

fn timestamp(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_default()
}

fn score(value: Option<f64>) -> String {
    value.map(|score| format!("{score:.1}")).unwrap_or_else(|| "n/a".to_string())
}

pub fn render_scans(scans: &[ScanRecord]) -> String {
    if scans.is_empty() {
        return "No scans.".to_string();
    }

    let mut display = table(&["ID", "Name", "Target", "Status", "Started", "Finished", "Duration"]);
    for scan in scans {
        display.add_row(vec![
            scan.id.to_string(),
            scan.name.clone(),
            scan.target.clone(),
            scan.status.to_string(),
            timestamp(scan.start_time),
            scan.end_time.map(timestamp).unwrap_or_default(),
            scan.duration()
                .map(|duration| format!("{}s", duration.whole_seconds()))
                .unwrap_or_default(),
        ]);
    }
    display.to_string()
}

/// One row per port of every host, hosts without ports get a single row.
pub fn render_report(report: &ParsedReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} (started {}), {} host(s)",
        report.scanner,
        report.version,
        report.scan_time,
        report.hosts.len()
    );

    let mut display = table(&["Host", "Status", "Port", "State", "Service", "Vulnerabilities"]);
    for host in &report.hosts {
        let status = match host.status {
            HostStatus::Up => "up",
            HostStatus::Down => "down",
            HostStatus::Unknown => "unknown",
        };
        if host.ports.is_empty() {
            display.add_row(vec![
                host.primary_address().to_string(),
                status.to_string(),
                String::new(),
                String::new(),
                String::new(),
                "0".to_string(),
            ]);
            continue;
        }
        for port in &host.ports {
            let service = match &port.service {
                Some(service) => [&service.name, &service.product, &service.version]
                    .iter()
                    .filter(|part| !part.is_empty())
                    .map(|part| part.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
                None => String::new(),
            };
            display.add_row(vec![
                host.primary_address().to_string(),
                status.to_string(),
                format!("{}/{}", port.port, port.protocol),
                port.state.as_str().to_string(),
                service,
                port.vulnerabilities.len().to_string(),
            ]);
        }
    }
    out.push_str(&display.to_string());
    out
}

pub fn render_analytics(analytics: &VulnerabilityAnalytics) -> String {
    let mut out = String::new();

    let mut summary = table(&["Metric", "Value"]);
    summary.add_row(vec![
        "Total vulnerabilities".to_string(),
        analytics.total_vulnerabilities.to_string(),
    ]);
    summary.add_row(vec![
        "Hosts with vulnerabilities".to_string(),
        analytics.hosts_with_vulnerabilities.to_string(),
    ]);
    for severity in Severity::ALL {
        summary.add_row(vec![severity.to_string(), analytics.count(severity).to_string()]);
    }
    let _ = writeln!(out, "Summary:\n{summary}");

    if analytics.top_vulnerabilities.is_empty() {
        out.push_str("\nNo vulnerabilities found.");
        return out;
    }

    let mut top = table(&["Rank", "Vulnerability", "Occurrences", "Score"]);
    for (rank, entry) in analytics.top_vulnerabilities.iter().enumerate() {
        top.add_row(vec![
            (rank + 1).to_string(),
            entry.id.clone(),
            entry.count.to_string(),
            score(entry.score),
        ]);
    }
    let _ = writeln!(out, "\nTop vulnerabilities:\n{top}");

    for severity in Severity::ALL {
        let entries = analytics.vulnerabilities_by_severity.get(severity);
        if entries.is_empty() {
            continue;
        }
        let mut band = table(&["Vulnerability", "Score", "Host", "Port", "Service"]);
        for entry in entries {
            band.add_row(vec![
                entry.id.clone(),
                score(entry.score),
                entry.host.clone(),
                entry.port.to_string(),
                entry.service.clone(),
            ]);
        }
        let _ = writeln!(out, "\n{} ({}):\n{band}", severity, entries.len());
    }

    out.trim_end().to_string()
}
