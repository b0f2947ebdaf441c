use crate::report::ParsedReport;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const TOP_VULNERABILITIES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ];

    /// Bands use inclusive lower bounds. Unscored, zero and negative scores
    /// belong to no band.
    pub fn from_score(score: Option<f64>) -> Option<Self> {
        let score = score?;
        if score >= 9.0 {
            Some(Severity::Critical)
        } else if score >= 7.0 {
            Some(Severity::High)
        } else if score >= 4.0 {
            Some(Severity::Medium)
        } else if score > 0.0 {
            Some(Severity::Low)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityEntry {
    pub id: String,
    pub score: Option<f64>,
    pub host: String,
    pub port: u16,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostVulnerability {
    pub id: String,
    pub score: Option<f64>,
    pub port: u16,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostVulnerabilities {
    pub host: String,
    pub vulnerability_count: usize,
    pub vulnerabilities: Vec<HostVulnerability>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedVulnerability {
    pub id: String,
    pub count: usize,
    /// Score of the first occurrence seen.
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeverityBuckets {
    pub critical: Vec<VulnerabilityEntry>,
    pub high: Vec<VulnerabilityEntry>,
    pub medium: Vec<VulnerabilityEntry>,
    pub low: Vec<VulnerabilityEntry>,
}

impl SeverityBuckets {
    pub fn get(&self, severity: Severity) -> &[VulnerabilityEntry] {
        match severity {
            Severity::Critical => &self.critical,
            Severity::High => &self.high,
            Severity::Medium => &self.medium,
            Severity::Low => &self.low,
        }
    }

    fn get_mut(&mut self, severity: Severity) -> &mut Vec<VulnerabilityEntry> {
        match severity {
            Severity::Critical => &mut self.critical,
            Severity::High => &mut self.high,
            Severity::Medium => &mut self.medium,
            Severity::Low => &mut self.low,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityAnalytics {
    pub total_vulnerabilities: usize,
    pub hosts_with_vulnerabilities: usize,
    pub critical_count: usize,
    pub high_count: usize,
    pub medium_count: usize,
    pub low_count: usize,
    pub vulnerabilities_by_host: Vec<HostVulnerabilities>,
    pub top_vulnerabilities: Vec<RankedVulnerability>,
    pub vulnerabilities_by_severity: SeverityBuckets,
}

impl VulnerabilityAnalytics {
    pub fn count(&self, severity: Severity) -> usize {
        match severity {
            Severity::Critical => self.critical_count,
            Severity::High => self.high_count,
            Severity::Medium => self.medium_count,
            Severity::Low => self.low_count,
        }
    }
}

fn score_key(score: Option<f64>) -> f64 {
    score.unwrap_or(0.0)
}

/// Aggregates a parsed report in a single pass. Sorting is stable throughout,
/// so equal scores and equal occurrence counts keep first-encountered order.
pub fn analyze(report: &ParsedReport) -> VulnerabilityAnalytics {
    let mut analytics = VulnerabilityAnalytics::default();
    let mut ranking: Vec<RankedVulnerability> = Vec::new();
    let mut ranking_index: HashMap<&str, usize> = HashMap::new();

    for host in &report.hosts {
        let address = host.primary_address();
        let mut host_vulnerabilities = Vec::new();

        for port in &host.ports {
            let service = port.service_name();
            for vulnerability in &port.vulnerabilities {
                analytics.total_vulnerabilities += 1;

                if let Some(severity) = Severity::from_score(vulnerability.score) {
                    analytics
                        .vulnerabilities_by_severity
                        .get_mut(severity)
                        .push(VulnerabilityEntry {
                            id: vulnerability.id.clone(),
                            score: vulnerability.score,
                            host: address.to_string(),
                            port: port.port,
                            service: service.to_string(),
                        });
                }

                host_vulnerabilities.push(HostVulnerability {
                    id: vulnerability.id.clone(),
                    score: vulnerability.score,
                    port: port.port,
                    service: service.to_string(),
                });

                match ranking_index.get(vulnerability.id.as_str()) {
                    Some(&index) => ranking[index].count += 1,
                    None => {
                        ranking_index.insert(vulnerability.id.as_str(), ranking.len());
                        ranking.push(RankedVulnerability {
                            id: vulnerability.id.clone(),
                            count: 1,
                            score: vulnerability.score,
                        });
                    }
                }
            }
        }

        if !host_vulnerabilities.is_empty() {
            analytics.hosts_with_vulnerabilities += 1;
            analytics.vulnerabilities_by_host.push(HostVulnerabilities {
                host: address.to_string(),
                vulnerability_count: host_vulnerabilities.len(),
                vulnerabilities: host_vulnerabilities,
            });
        }
    }

    for severity in Severity::ALL {
        analytics
            .vulnerabilities_by_severity
            .get_mut(severity)
            .sort_by(|a, b| score_key(b.score).total_cmp(&score_key(a.score)));
    }
    let buckets = &analytics.vulnerabilities_by_severity;
    analytics.critical_count = buckets.critical.len();
    analytics.high_count = buckets.high.len();
    analytics.medium_count = buckets.medium.len();
    analytics.low_count = buckets.low.len();

    ranking.sort_by(|a, b| b.count.cmp(&a.count));
    ranking.truncate(TOP_VULNERABILITIES);
    analytics.top_vulnerabilities = ranking;

    analytics
}
