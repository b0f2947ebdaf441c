use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use tokio::process::Command;

const TARGET: &str = "{target}";
const OUTPUT_DIR: &str = "{output_dir}";
const REPORT: &str = "{report}";

/// External scanner invocation template.
///
/// Arguments may reference `{target}`, `{output_dir}` (the per-scan artifact
/// directory) and `{report}` (the full path the tool must write its XML to).
/// A template that never mentions `{target}` gets the target appended as the
/// last argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn nmap_vulners() -> Self {
        Self::new(
            "nmap",
            ["-sV", "--script", "vulners", "-oX", REPORT, TARGET],
        )
    }

    /// The flan-scan container writes `report.xml` into its `/shared` volume.
    pub fn flan_docker() -> Self {
        Self::new(
            "docker",
            [
                "run",
                "--rm",
                "-v",
                "{output_dir}:/shared",
                "quay.io/flanscan/flanscan",
                "-t",
                TARGET,
                "-o",
                "/shared",
            ],
        )
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn invocation(&self, target: &str, output_dir: &Path, report: &Path) -> Vec<String> {
        let output_dir = output_dir.to_string_lossy();
        let report = report.to_string_lossy();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace(TARGET, target)
                    .replace(OUTPUT_DIR, &output_dir)
                    .replace(REPORT, &report)
            })
            .collect();
        if !self.args.iter().any(|arg| arg.contains(TARGET)) {
            args.push(target.to_string());
        }
        args
    }

    pub fn command(&self, target: &str, output_dir: &Path, report: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.invocation(target, output_dir, report))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for ToolCommand {
    fn default() -> Self {
        Self::nmap_vulners()
    }
}

impl FromStr for ToolCommand {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = shell_words::split(s)
            .map_err(|err| ScanError::InvalidCommand(format!("failed to parse '{s}': {err}")))?
            .into_iter();
        let program = parts
            .next()
            .filter(|program| !program.is_empty())
            .ok_or_else(|| ScanError::InvalidCommand("empty command".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl TryFrom<String> for ToolCommand {
    type Error = ScanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ToolCommand> for String {
    fn from(value: ToolCommand) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(&self.program).chain(self.args.iter());
        f.write_str(&shell_words::join(words))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn nmap_preset_substitutes_placeholders() {
        let args = ToolCommand::nmap_vulners().invocation(
            "10.0.0.0/24",
            Path::new("/srv/reports/scan_4"),
            Path::new("/srv/reports/scan_4/report.xml"),
        );
        assert_eq!(
            args,
            vec![
                "-sV",
                "--script",
                "vulners",
                "-oX",
                "/srv/reports/scan_4/report.xml",
                "10.0.0.0/24"
            ]
        );
    }

    #[test]
    fn flan_preset_mounts_output_dir() {
        let args = ToolCommand::flan_docker().invocation(
            "scanme.example.org",
            Path::new("/tmp/scan_1"),
            Path::new("/tmp/scan_1/report.xml"),
        );
        assert!(args.contains(&"/tmp/scan_1:/shared".to_string()));
        assert!(args.contains(&"scanme.example.org".to_string()));
    }

    #[test]
    fn parses_quoted_template_and_appends_missing_target() {
        let tool: ToolCommand = "my-scanner --out '{report}' --label \"nightly run\""
            .parse()
            .expect("valid template");
        assert_eq!(tool.program(), "my-scanner");

        let report = PathBuf::from("/data/scan_2/report.xml");
        let args = tool.invocation("192.168.0.10", Path::new("/data/scan_2"), &report);
        assert_eq!(
            args,
            vec![
                "--out",
                "/data/scan_2/report.xml",
                "--label",
                "nightly run",
                "192.168.0.10"
            ]
        );
    }

    #[test]
    fn rejects_empty_and_unbalanced_templates() {
        assert!(matches!(
            "   ".parse::<ToolCommand>(),
            Err(ScanError::InvalidCommand(_))
        ));
        assert!(matches!(
            "nmap 'unterminated".parse::<ToolCommand>(),
            Err(ScanError::InvalidCommand(_))
        ));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let tool = ToolCommand::new("sh", ["-c", "echo hi > {report}"]);
        let reparsed: ToolCommand = tool.to_string().parse().expect("reparse");
        assert_eq!(reparsed, tool);
    }
}
