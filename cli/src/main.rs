use anyhow::{anyhow, Context};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use scanward_core::{
    render_analytics, render_report, render_scans, ControllerConfig, JsonScanStore,
    ScanController, ScanFilter, ScanId, ScanRecord, ScanStatus, ToolCommand,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(author, version, about = "Run vulnerability scans and inspect their reports")]
struct ScanwardCli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Scan record store (JSON)
    #[arg(long, global = true)]
    data_file: Option<PathBuf>,
    /// Directory receiving per-scan artifacts
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan one or more targets and wait for the results (Ctrl-C cancels them)
    Scan {
        /// Host, address or CIDR range. Repeat for multiple scans.
        #[arg(required = true)]
        targets: Vec<String>,
        /// Human-readable scan name
        #[arg(long)]
        name: Option<String>,
        /// Tool command template, e.g. "nmap -sV --script vulners -oX {report} {target}"
        #[arg(long)]
        tool: Option<ToolCommand>,
    },
    /// List recorded scans
    List {
        /// Only queued or running scans
        #[arg(long, conflicts_with = "completed")]
        active: bool,
        /// Only completed scans
        #[arg(long)]
        completed: bool,
        #[arg(long, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Show the status of a scan
    Status {
        id: ScanId,
        #[arg(long, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Show vulnerability analytics for a completed scan
    Report {
        id: ScanId,
        #[arg(long, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
        /// Show the parsed report instead of analytics
        #[arg(long)]
        raw: bool,
    },
    /// Cancel a queued or running scan. A scan running under another
    /// `scanward scan` is stopped by that process within a second.
    Cancel { id: ScanId },
    /// Delete a finished scan and its artifacts
    Delete { id: ScanId },
    /// Mark scans left active by a process that exited as failed
    Reconcile,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Yaml,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            OutputFormat::Table => "table",
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
        };
        write!(f, "{value}")
    }
}

/// Shape of the `--config` YAML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    data_file: Option<PathBuf>,
    reports_dir: Option<PathBuf>,
    tool: Option<ToolCommand>,
}

#[derive(Debug)]
struct Settings {
    data_file: PathBuf,
    controller: ControllerConfig,
}

impl Settings {
    fn resolve(cli: &ScanwardCli, file: FileConfig) -> Self {
        let data_file = cli
            .data_file
            .clone()
            .or(file.data_file)
            .unwrap_or_else(|| PathBuf::from("./data/scans.json"));
        let reports_dir = cli
            .reports_dir
            .clone()
            .or(file.reports_dir)
            .unwrap_or_else(|| PathBuf::from("./reports"));
        let tool = file.tool.unwrap_or_default();
        Self {
            data_file,
            controller: ControllerConfig::default()
                .with_reports_dir(reports_dir)
                .with_tool(tool),
        }
    }
}

fn load_file_config(path: Option<&PathBuf>) -> anyhow::Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    serde_yaml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = ScanwardCli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let file = load_file_config(cli.config.as_ref())?;
    let mut settings = Settings::resolve(&cli, file);
    if let Command::Scan {
        tool: Some(tool), ..
    } = &cli.command
    {
        settings.controller.tool = tool.clone();
    }

    let store = JsonScanStore::open(&settings.data_file)
        .with_context(|| format!("failed to open scan store {}", settings.data_file.display()))?;
    info!(store = %store.path().display(), "scan store opened");
    let controller = ScanController::new(Arc::new(store), settings.controller);

    match cli.command {
        Command::Scan { targets, name, .. } => run_scans(&controller, &targets, name).await?,
        Command::List {
            active,
            completed,
            format,
        } => {
            let filter = if active {
                ScanFilter::Active
            } else if completed {
                ScanFilter::Completed
            } else {
                ScanFilter::All
            };
            let scans = controller.list_scans(filter)?;
            output(scans.as_slice(), format, render_scans)?;
        }
        Command::Status { id, format } => {
            let record = controller
                .get_scan(id)?
                .ok_or_else(|| anyhow!("scan {id} not found"))?;
            output(&record.snapshot(), format, |_| {
                render_scans(std::slice::from_ref(&record))
            })?;
        }
        Command::Report { id, format, raw } => output_report(&controller, id, format, raw)?,
        Command::Cancel { id } => {
            if controller.cancel_scan(id)? {
                println!("Cancelled scan {id}.");
            } else {
                let status = controller
                    .get_scan_status(id)?
                    .map(|snapshot| snapshot.status.to_string())
                    .unwrap_or_default();
                println!("Scan {id} finished before it could be cancelled ({status}).");
            }
        }
        Command::Delete { id } => {
            controller.delete_scan(id)?;
            println!("Deleted scan {id}.");
        }
        Command::Reconcile => {
            let failed = controller.reconcile()?;
            if failed.is_empty() {
                println!("No orphaned scans.");
            } else {
                let ids: Vec<String> = failed.iter().map(ScanId::to_string).collect();
                println!("Marked {} scan(s) as failed: {}", failed.len(), ids.join(", "));
            }
        }
    }

    Ok(())
}

async fn run_scans(
    controller: &ScanController,
    targets: &[String],
    name: Option<String>,
) -> anyhow::Result<()> {
    let mut ids = Vec::with_capacity(targets.len());
    for target in targets {
        let id = controller.submit_scan(target, name.clone())?;
        println!("Started scan {id} against {}", target.trim());
        ids.push(id);
    }

    let waiters: Vec<_> = ids
        .iter()
        .map(|&id| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.wait_for_completion(id, POLL_INTERVAL).await })
        })
        .collect();
    let wait_all = async move {
        let mut records = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            records.push(waiter.await??);
        }
        Ok::<Vec<ScanRecord>, anyhow::Error>(records)
    };

    let records = tokio::select! {
        records = wait_all => records?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            warn!("interrupted; cancelling {} scan(s)", ids.len());
            for &id in &ids {
                match controller.cancel_scan(id) {
                    Ok(_) => {}
                    Err(err) => info!(scan_id = %id, error = %err, "scan not cancelled"),
                }
            }
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while !controller.registry().is_empty() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
            if drained.is_err() {
                warn!("scan processes still running after cancellation; they are killed on exit");
            }
            let mut records = Vec::with_capacity(ids.len());
            for &id in &ids {
                if let Some(record) = controller.get_scan(id)? {
                    records.push(record);
                }
            }
            records
        }
    };

    println!("{}", render_scans(&records));
    let unfinished = records
        .iter()
        .filter(|record| record.status != ScanStatus::Completed)
        .count();
    if unfinished > 0 {
        anyhow::bail!("{unfinished} scan(s) did not complete");
    }
    Ok(())
}

fn output_report(
    controller: &ScanController,
    id: ScanId,
    format: OutputFormat,
    raw: bool,
) -> anyhow::Result<()> {
    let unavailable = || anyhow!("report unavailable for scan {id}");
    if raw {
        let report = controller.report(id)?.ok_or_else(unavailable)?;
        output(&report, format, render_report)
    } else {
        let analytics = controller.analytics(id)?.ok_or_else(unavailable)?;
        output(&analytics, format, render_analytics)
    }
}

fn output<T: Serialize + ?Sized>(
    value: &T,
    format: OutputFormat,
    table: impl FnOnce(&T) -> String,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => println!("{}", table(value)),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(value)?;
            print!("{yaml}");
        }
    }
    Ok(())
}
