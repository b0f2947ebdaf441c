use crate::error::ScanError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Placeholder for report metadata and host addresses the document omits.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedReport {
    pub scanner: String,
    pub version: String,
    pub scan_time: String,
    pub hosts: Vec<Host>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Up,
    Down,
    Unknown,
}

impl HostStatus {
    fn from_attr(value: &str) -> Self {
        match value {
            "up" => HostStatus::Up,
            "down" => HostStatus::Down,
            _ => HostStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
    Unknown,
}

impl PortState {
    // nmap also reports the ambiguous "open|filtered" and "closed|filtered".
    fn from_attr(value: &str) -> Self {
        match value {
            "open" => PortState::Open,
            "closed" => PortState::Closed,
            "unfiltered" => PortState::Unknown,
            other if other.contains("filtered") => PortState::Filtered,
            _ => PortState::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Filtered => "filtered",
            PortState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub status: HostStatus,
    pub addresses: Vec<Address>,
    pub hostnames: Vec<Hostname>,
    pub ports: Vec<Port>,
}

impl Host {
    fn new() -> Self {
        Self {
            status: HostStatus::Unknown,
            addresses: Vec::new(),
            hostnames: Vec::new(),
            ports: Vec::new(),
        }
    }

    pub fn primary_address(&self) -> &str {
        self.addresses
            .first()
            .map(|address| address.addr.as_str())
            .unwrap_or(UNKNOWN)
    }

    pub fn vulnerability_count(&self) -> usize {
        self.ports.iter().map(|port| port.vulnerabilities.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub addr: String,
    pub addr_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hostname {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub protocol: String,
    pub port: u16,
    pub state: PortState,
    pub service: Option<Service>,
    pub vulnerabilities: Vec<Vulnerability>,
}

impl Port {
    pub fn service_name(&self) -> &str {
        self.service
            .as_ref()
            .map(|service| service.name.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub product: String,
    pub version: String,
    pub extra_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    /// `None` when the tool printed no usable score.
    pub score: Option<f64>,
}

/// Turns one script's free-text output into vulnerabilities.
pub trait VulnerabilityExtractor: Send + Sync {
    fn extract(&self, script_id: &str, output: &str) -> Vec<Vulnerability>;
}

/// Line-oriented heuristic over the `vulners` NSE script output.
///
/// Assumptions about the tool's format, and the only contract with it:
/// - only scripts whose id equals `script_id` are read (`None` reads all);
/// - a line is a finding when it contains `marker` (`CVE-` by default);
/// - the trimmed line is split on `delimiter` (a tab); field 0 is the id,
///   field 1 the score. A missing or non-numeric score is "not available".
#[derive(Debug, Clone)]
pub struct DelimitedCveExtractor {
    pub script_id: Option<String>,
    pub marker: String,
    pub delimiter: char,
}

impl Default for DelimitedCveExtractor {
    fn default() -> Self {
        Self {
            script_id: Some("vulners".to_string()),
            marker: "CVE-".to_string(),
            delimiter: '\t',
        }
    }
}

impl VulnerabilityExtractor for DelimitedCveExtractor {
    fn extract(&self, script_id: &str, output: &str) -> Vec<Vulnerability> {
        if let Some(expected) = &self.script_id {
            if expected != script_id {
                return Vec::new();
            }
        }

        output
            .lines()
            .filter(|line| line.contains(self.marker.as_str()))
            .filter_map(|line| {
                let mut fields = line.trim().split(self.delimiter).map(str::trim);
                let id = fields.next().filter(|id| !id.is_empty())?;
                let score = fields
                    .next()
                    .and_then(|field| field.parse::<f64>().ok())
                    .filter(|score| score.is_finite());
                Some(Vulnerability {
                    id: id.to_string(),
                    score,
                })
            })
            .collect()
    }
}

pub struct ReportParser {
    extractor: Box<dyn VulnerabilityExtractor>,
}

impl Default for ReportParser {
    fn default() -> Self {
        Self::with_extractor(DelimitedCveExtractor::default())
    }
}

impl std::fmt::Debug for ReportParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportParser").finish_non_exhaustive()
    }
}

impl ReportParser {
    pub fn with_extractor(extractor: impl VulnerabilityExtractor + 'static) -> Self {
        Self {
            extractor: Box::new(extractor),
        }
    }

    pub fn parse_file(&self, path: &Path) -> Result<ParsedReport, ScanError> {
        let xml = fs::read(path)
            .map_err(|err| ScanError::malformed(path, format!("unreadable artifact: {err}")))?;
        self.parse_document(&xml)
            .map_err(|reason| ScanError::malformed(path, reason))
    }

    pub fn parse_bytes(&self, xml: &[u8]) -> Result<ParsedReport, ScanError> {
        self.parse_document(xml)
            .map_err(|reason| ScanError::malformed("<memory>", reason))
    }

    fn parse_document(&self, xml: &[u8]) -> Result<ParsedReport, String> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut report: Option<ParsedReport> = None;
        let mut current_host: Option<Host> = None;
        let mut current_port: Option<Port> = None;
        // Open elements, root included. Reaching EOF with any left open means
        // the artifact was cut off.
        let mut depth = 0usize;

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|err| format!("XML parsing error at {}: {err}", reader.buffer_position()))?;
            let opens = matches!(event, Event::Start(_));

            match event {
                Event::Start(_) | Event::Empty(_) if report.is_some() && depth == 0 => {
                    return Err("content after the root element".to_string());
                }
                Event::Start(element) | Event::Empty(element) if report.is_none() => {
                    if element.name() != QName(b"nmaprun") {
                        return Err(format!(
                            "unexpected root element <{}>",
                            String::from_utf8_lossy(element.name().as_ref())
                        ));
                    }
                    report = Some(ParsedReport {
                        scanner: attr_or(&element, b"scanner", UNKNOWN),
                        version: attr_or(&element, b"version", UNKNOWN),
                        scan_time: attr_or(&element, b"start", UNKNOWN),
                        hosts: Vec::new(),
                    });
                    if opens {
                        depth += 1;
                    }
                }
                Event::Start(element) => {
                    depth += 1;
                    self.open_element(&element, &mut current_host, &mut current_port);
                }
                Event::Empty(element) => {
                    self.open_element(&element, &mut current_host, &mut current_port);
                    close_element(
                        element.name(),
                        &mut report,
                        &mut current_host,
                        &mut current_port,
                    );
                }
                Event::End(element) => {
                    depth = depth.saturating_sub(1);
                    close_element(
                        element.name(),
                        &mut report,
                        &mut current_host,
                        &mut current_port,
                    );
                }
                Event::Eof if depth > 0 => {
                    return Err(format!(
                        "unexpected end of document: {depth} element(s) left open"
                    ));
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        report.ok_or_else(|| "document has no root element".to_string())
    }

    fn open_element(
        &self,
        element: &BytesStart<'_>,
        current_host: &mut Option<Host>,
        current_port: &mut Option<Port>,
    ) {
        match element.name() {
            QName(b"host") => {
                *current_host = Some(Host::new());
            }
            QName(b"status") => {
                if let Some(host) = current_host.as_mut() {
                    host.status = HostStatus::from_attr(&attr_or(element, b"state", "unknown"));
                }
            }
            QName(b"address") => {
                if let Some(host) = current_host.as_mut() {
                    host.addresses.push(Address {
                        addr: attr_or(element, b"addr", ""),
                        addr_type: attr_or(element, b"addrtype", ""),
                    });
                }
            }
            QName(b"hostname") => {
                if let Some(host) = current_host.as_mut() {
                    host.hostnames.push(Hostname {
                        name: attr_or(element, b"name", ""),
                        kind: attr_or(element, b"type", ""),
                    });
                }
            }
            QName(b"port") => {
                *current_port = Some(Port {
                    protocol: attr_or(element, b"protocol", ""),
                    port: attr(element, b"portid")
                        .and_then(|value| value.parse::<u16>().ok())
                        .unwrap_or(0),
                    state: PortState::Unknown,
                    service: None,
                    vulnerabilities: Vec::new(),
                });
            }
            QName(b"state") => {
                if let Some(port) = current_port.as_mut() {
                    port.state = PortState::from_attr(&attr_or(element, b"state", "unknown"));
                }
            }
            QName(b"service") => {
                if let Some(port) = current_port.as_mut() {
                    port.service = Some(Service {
                        name: attr_or(element, b"name", ""),
                        product: attr_or(element, b"product", ""),
                        version: attr_or(element, b"version", ""),
                        extra_info: attr_or(element, b"extrainfo", ""),
                    });
                }
            }
            QName(b"script") => {
                if let Some(port) = current_port.as_mut() {
                    let id = attr_or(element, b"id", "");
                    let output = attr_or(element, b"output", "");
                    port.vulnerabilities
                        .extend(self.extractor.extract(&id, &output));
                }
            }
            _ => {}
        }
    }
}

fn close_element(
    name: QName<'_>,
    report: &mut Option<ParsedReport>,
    current_host: &mut Option<Host>,
    current_port: &mut Option<Port>,
) {
    match name {
        QName(b"port") => {
            if let (Some(host), Some(port)) = (current_host.as_mut(), current_port.take()) {
                host.ports.push(port);
            }
        }
        QName(b"host") => {
            if let (Some(report), Some(host)) = (report.as_mut(), current_host.take()) {
                report.hosts.push(host);
            }
        }
        _ => {}
    }
}

fn attr(element: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attribute| attribute.key.as_ref() == key)
        .map(|attribute| match attribute.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&attribute.value).into_owned(),
        })
}

fn attr_or(element: &BytesStart<'_>, key: &[u8], default: &str) -> String {
    attr(element, key).unwrap_or_else(|| default.to_string())
}

/// Parses an artifact with the default `vulners` extractor.
pub fn parse_report(path: &Path) -> Result<ParsedReport, ScanError> {
    ReportParser::default().parse_file(path)
}

#[cfg(test)]
pub(crate) const SAMPLE_REPORT: &str = include_str!("testdata/sample_report.xml");
