use crate::record::ScanId;
use crate::tool::ToolCommand;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub reports_dir: PathBuf,
    pub report_file_name: String,
    pub error_log_name: String,
    pub tool: ToolCommand,
    /// How often a running scan re-reads its record to notice a cancel
    /// issued by another process.
    pub cancel_check_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reports_dir: PathBuf::from("reports"),
            report_file_name: "report.xml".to_string(),
            error_log_name: "error.log".to_string(),
            tool: ToolCommand::default(),
            cancel_check_interval_ms: 1000,
        }
    }
}

impl ControllerConfig {
    pub fn with_reports_dir(mut self, reports_dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = reports_dir.into();
        self
    }

    pub fn with_tool(mut self, tool: ToolCommand) -> Self {
        self.tool = tool;
        self
    }

    pub fn with_cancel_check_interval(mut self, interval: Duration) -> Self {
        self.cancel_check_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn cancel_check_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_check_interval_ms.max(1))
    }

    pub fn scan_dir(&self, id: ScanId) -> PathBuf {
        self.reports_dir.join(format!("scan_{id}"))
    }

    pub fn report_path(&self, id: ScanId) -> PathBuf {
        self.scan_dir(id).join(&self.report_file_name)
    }

    pub fn error_log_path(&self, id: ScanId) -> PathBuf {
        self.scan_dir(id).join(&self.error_log_name)
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }
}
