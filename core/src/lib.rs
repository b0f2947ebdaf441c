pub mod analytics;
pub mod config;
pub mod controller;
pub mod error;
pub mod record;
pub mod registry;
pub mod render;
pub mod report;
pub mod store;
pub mod tool;

pub use analytics::{
    analyze, HostVulnerabilities, HostVulnerability, RankedVulnerability, Severity,
    SeverityBuckets, VulnerabilityAnalytics, VulnerabilityEntry, TOP_VULNERABILITIES,
};
pub use config::ControllerConfig;
pub use controller::{ScanController, ScanFilter};
pub use error::ScanError;
pub use record::{NewScan, ScanId, ScanRecord, ScanStatus, ScanStatusSnapshot, Transition};
pub use registry::{JobRegistry, ProcessHandle};
pub use render::{render_analytics, render_report, render_scans};
pub use report::{
    parse_report, Address, DelimitedCveExtractor, Host, HostStatus, Hostname, ParsedReport,
    Port, PortState, ReportParser, Service, Vulnerability, VulnerabilityExtractor,
};
pub use store::{JsonScanStore, MemoryScanStore, ScanStore};
pub use tool::ToolCommand;
