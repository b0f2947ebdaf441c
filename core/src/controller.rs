use crate::analytics::{analyze, VulnerabilityAnalytics};
use crate::config::ControllerConfig;
use crate::error::ScanError;
use crate::record::{NewScan, ScanId, ScanRecord, ScanStatus, ScanStatusSnapshot, Transition};
use crate::registry::{JobRegistry, ProcessHandle};
use crate::report::{ParsedReport, ReportParser};
use crate::store::ScanStore;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const FINISH_ATTEMPTS: u32 = 5;
const FINISH_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanFilter {
    #[default]
    All,
    Active,
    Completed,
}

/// Drives scans from `queued` to a terminal state.
///
/// Each started scan runs on its own tokio task which owns the external
/// process. Outcomes are only ever reported through the store, so callers
/// poll (`get_scan_status`, `wait_for_completion`) rather than being called
/// back.
#[derive(Clone)]
pub struct ScanController {
    store: Arc<dyn ScanStore>,
    registry: Arc<JobRegistry>,
    config: Arc<ControllerConfig>,
    parser: Arc<ReportParser>,
}

impl fmt::Debug for ScanController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanController")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum Outcome {
    Finished(Transition),
    Cancelled,
}

impl ScanController {
    pub fn new(store: Arc<dyn ScanStore>, config: ControllerConfig) -> Self {
        Self::with_registry(store, Arc::new(JobRegistry::new()), config)
    }

    pub fn with_registry(
        store: Arc<dyn ScanStore>,
        registry: Arc<JobRegistry>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config: Arc::new(config),
            parser: Arc::new(ReportParser::default()),
        }
    }

    pub fn with_parser(mut self, parser: ReportParser) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    pub fn store(&self) -> &Arc<dyn ScanStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Records a new `queued` scan and starts it.
    pub fn submit_scan(&self, target: &str, name: Option<String>) -> Result<ScanId, ScanError> {
        let target = target.trim();
        if target.is_empty() || target.starts_with('-') {
            return Err(ScanError::InvalidTarget(target.to_string()));
        }

        let name = name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(default_scan_name);
        let id = self.store.insert(NewScan {
            name,
            target: target.to_string(),
        })?;
        info!(scan_id = %id, target, "scan queued");

        drop(self.start_scan(id, target.to_string()));
        Ok(id)
    }

    /// Spawns the execution unit for `id` and returns immediately. Must be
    /// called from within a tokio runtime. The returned handle may be dropped.
    pub fn start_scan(&self, id: ScanId, target: String) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move { controller.run_scan(id, target).await })
    }

    async fn run_scan(&self, id: ScanId, target: String) {
        match self.store.get(id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                error!(scan_id = %id, "scan record not found; nothing to run");
                return;
            }
            Err(err) => {
                error!(scan_id = %id, error = %err, "failed to load scan record");
                return;
            }
        }

        match self.store.transition(id, Transition::Start) {
            Ok(_) => debug!(scan_id = %id, target = %target, "scan running"),
            Err(ScanError::InvalidTransition { from, .. }) => {
                info!(scan_id = %id, status = %from, "scan is no longer queued; not starting");
                return;
            }
            Err(err) => {
                error!(scan_id = %id, error = %err, "failed to mark scan running");
                self.finish(id, Transition::Fail).await;
                return;
            }
        }

        match self.execute(id, &target).await {
            Ok(Outcome::Finished(transition)) => self.finish(id, transition).await,
            Ok(Outcome::Cancelled) => {}
            Err(err) => {
                self.registry.unregister(id);
                error!(scan_id = %id, error = %err, "scan aborted");
                self.finish(id, Transition::Fail).await;
            }
        }
    }

    async fn execute(&self, id: ScanId, target: &str) -> Result<Outcome, ScanError> {
        let scan_dir = self.config.scan_dir(id);
        tokio::fs::create_dir_all(&scan_dir).await?;
        let report_path = self.config.report_path(id);

        let tool = &self.config.tool;
        let mut child = tool
            .command(target, &scan_dir, &report_path)
            .spawn()
            .map_err(|source| ScanError::ProcessSpawn {
                program: tool.program().to_string(),
                source,
            })?;

        let handle = ProcessHandle::new(child.id());
        self.registry.register(id, handle.clone());
        info!(scan_id = %id, pid = ?child.id(), command = %tool, "scan process started");

        // A cancel that landed after `Start` but before registration found
        // nothing to signal.
        if let Ok(Some(record)) = self.store.get(id) {
            if record.status != ScanStatus::Running {
                handle.terminate();
            }
        }

        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let exited = tokio::select! {
            biased;
            status = child.wait() => Some(status),
            _ = handle.token().cancelled() => None,
            _ = self.stopped_elsewhere(id) => None,
        };

        let Some(status) = exited else {
            if let Err(err) = child.start_kill() {
                debug!(scan_id = %id, error = %err, "scan process already gone");
            }
            if let Err(err) = child.wait().await {
                warn!(scan_id = %id, error = %err, "failed to reap cancelled scan process");
            }
            stdout_task.abort();
            stderr_task.abort();
            self.registry.unregister(id);
            info!(scan_id = %id, "scan process terminated");
            return Ok(Outcome::Cancelled);
        };

        self.registry.unregister(id);
        let status = status?;
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let failure = if !status.success() {
            format!("tool exited with {status}")
        } else if is_file(&report_path).await {
            info!(scan_id = %id, report = %report_path.display(), "scan completed");
            return Ok(Outcome::Finished(Transition::Complete { report_path }));
        } else {
            format!(
                "tool exited successfully but wrote no report to {}",
                report_path.display()
            )
        };

        let err = ScanError::ToolExecution { id, reason: failure };
        warn!(scan_id = %id, error = %err, stderr = %truncate_output(&stderr), "scan failed");
        self.write_error_log(id, &stdout, &stderr).await;
        Ok(Outcome::Finished(Transition::Fail))
    }

    async fn write_error_log(&self, id: ScanId, stdout: &[u8], stderr: &[u8]) {
        let path = self.config.error_log_path(id);
        let contents = format!(
            "STDOUT:\n{}\n\nSTDERR:\n{}",
            String::from_utf8_lossy(stdout),
            String::from_utf8_lossy(stderr)
        );
        if let Err(err) = tokio::fs::write(&path, contents).await {
            error!(scan_id = %id, path = %path.display(), error = %err, "failed to write error log");
        }
    }

    /// Resolves once the record stops being `running` without this process
    /// signalling the handle, e.g. a `cancel` issued by another process sharing
    /// the store.
    async fn stopped_elsewhere(&self, id: ScanId) {
        let mut interval = tokio::time::interval(self.config.cancel_check_interval());
        interval.tick().await;
        loop {
            interval.tick().await;
            match self.store.get(id) {
                Ok(Some(record)) if record.status == ScanStatus::Running => {}
                Ok(_) => return,
                Err(err) => debug!(scan_id = %id, error = %err, "failed to poll scan status"),
            }
        }
    }

    /// Writes the worker's terminal transition, retrying store failures so
    /// the record does not stay `running` with no worker behind it.
    async fn finish(&self, id: ScanId, transition: Transition) {
        let action = transition.action();
        for attempt in 1..=FINISH_ATTEMPTS {
            match self.store.transition(id, transition.clone()) {
                Ok(record) => {
                    debug!(scan_id = %id, status = %record.status, "scan outcome recorded");
                    return;
                }
                Err(ScanError::InvalidTransition { from, .. }) => {
                    debug!(scan_id = %id, status = %from, action, "scan already terminal; keeping its state");
                    return;
                }
                Err(err) if attempt < FINISH_ATTEMPTS => {
                    warn!(scan_id = %id, error = %err, attempt, "failed to record scan outcome; retrying");
                    tokio::time::sleep(FINISH_BACKOFF * attempt).await;
                }
                Err(err) => error!(
                    scan_id = %id,
                    error = %err,
                    action,
                    "giving up recording scan outcome; `reconcile` will fail the scan"
                ),
            }
        }
    }

    /// Signals the scan's process and moves the record to `cancelled`.
    ///
    /// Returns `Ok(false)` when the scan reached a terminal state on its own
    /// between the status check and the write; that state is kept.
    pub fn cancel_scan(&self, id: ScanId) -> Result<bool, ScanError> {
        let record = self.require(id)?;
        if !record.is_active() {
            return Err(ScanError::InvalidTransition {
                id,
                from: record.status,
                action: "cancel",
            });
        }

        let signalled = self.registry.terminate(id);
        match self.store.transition(id, Transition::Cancel) {
            Ok(_) => {
                info!(scan_id = %id, signalled, "scan cancelled");
                Ok(true)
            }
            Err(ScanError::InvalidTransition { from, .. }) => {
                info!(scan_id = %id, status = %from, "scan finished before it could be cancelled");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub fn get_scan_status(&self, id: ScanId) -> Result<Option<ScanStatusSnapshot>, ScanError> {
        Ok(self.store.get(id)?.map(|record| record.snapshot()))
    }

    pub fn get_scan(&self, id: ScanId) -> Result<Option<ScanRecord>, ScanError> {
        self.store.get(id)
    }

    pub fn list_scans(&self, filter: ScanFilter) -> Result<Vec<ScanRecord>, ScanError> {
        match filter {
            ScanFilter::All => self.store.all(),
            ScanFilter::Active => self.store.active(),
            ScanFilter::Completed => self.store.completed(),
        }
    }

    /// Removes the record and its artifact directory. Active scans must be
    /// cancelled first.
    pub fn delete_scan(&self, id: ScanId) -> Result<(), ScanError> {
        let record = self.require(id)?;
        if record.is_active() {
            return Err(ScanError::InvalidTransition {
                id,
                from: record.status,
                action: "delete",
            });
        }

        let scan_dir = self.config.scan_dir(id);
        match fs::remove_dir_all(&scan_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.store.delete(id)?;
        info!(scan_id = %id, "scan deleted");
        Ok(())
    }

    /// Parses the scan's artifact. `None` covers unknown ids, scans that are
    /// not completed, and artifacts that are missing or malformed.
    pub fn report(&self, id: ScanId) -> Result<Option<ParsedReport>, ScanError> {
        let Some(record) = self.store.get(id)? else {
            return Ok(None);
        };
        if record.status != ScanStatus::Completed {
            return Ok(None);
        }
        let Some(path) = record.report_path else {
            return Ok(None);
        };

        match self.parser.parse_file(&path) {
            Ok(report) => Ok(Some(report)),
            Err(err @ ScanError::MalformedReport { .. }) => {
                warn!(scan_id = %id, error = %err, "report unavailable");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn analytics(&self, id: ScanId) -> Result<Option<VulnerabilityAnalytics>, ScanError> {
        Ok(self.report(id)?.map(|report| analyze(&report)))
    }

    pub async fn wait_for_completion(
        &self,
        id: ScanId,
        poll_interval: Duration,
    ) -> Result<ScanRecord, ScanError> {
        loop {
            let record = self.require(id)?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Fails every active record that has no live process in this
    /// controller's registry, i.e. scans orphaned by a previous process that
    /// exited mid-scan. Only meaningful before this controller starts scans
    /// and while no other process shares the store.
    pub fn reconcile(&self) -> Result<Vec<ScanId>, ScanError> {
        let live = self.registry.active_ids();
        let mut failed = Vec::new();
        for record in self.store.active()? {
            if live.contains(&record.id) {
                continue;
            }
            match self.store.transition(record.id, Transition::Fail) {
                Ok(_) => {
                    warn!(scan_id = %record.id, status = %record.status, "marked orphaned scan as failed");
                    failed.push(record.id);
                }
                Err(ScanError::InvalidTransition { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(failed)
    }

    fn require(&self, id: ScanId) -> Result<ScanRecord, ScanError> {
        self.store.get(id)?.ok_or(ScanError::RecordNotFound(id))
    }
}

fn default_scan_name() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!(
            "Scan_[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| "Scan".to_string())
}

async fn drain<R>(pipe: Option<R>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(err) = pipe.read_to_end(&mut buf).await {
            debug!(error = %err, "failed to drain scan process output");
        }
    }
    buf
}

async fn is_file(path: &std::path::Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

fn truncate_output(bytes: &[u8]) -> String {
    const MAX: usize = 512;
    let text = String::from_utf8_lossy(bytes);
    match text.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.into_owned(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::report::SAMPLE_REPORT;
    use crate::store::MemoryScanStore;
    use crate::tool::ToolCommand;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tokio::time::timeout;

    const POLL: Duration = Duration::from_millis(20);
    const DEADLINE: Duration = Duration::from_secs(20);

    struct Harness {
        controller: ScanController,
        store: Arc<MemoryScanStore>,
        dir: TempDir,
    }

    impl Harness {
        fn new(script: impl FnOnce(&Path) -> String) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let fixture = dir.path().join("fixture.xml");
            fs::write(&fixture, SAMPLE_REPORT).expect("write fixture");

            let tool = ToolCommand::new("sh", ["-c".to_string(), script(&fixture)]);
            Self::with_tool(dir, tool)
        }

        fn with_tool(dir: TempDir, tool: ToolCommand) -> Self {
            let store = Arc::new(MemoryScanStore::new());
            let config = ControllerConfig::default()
                .with_reports_dir(dir.path().join("reports"))
                .with_tool(tool);
            let controller = ScanController::new(store.clone(), config);
            Self {
                controller,
                store,
                dir,
            }
        }

        async fn finished(&self, id: ScanId) -> ScanRecord {
            let record = timeout(DEADLINE, self.controller.wait_for_completion(id, POLL))
                .await
                .expect("scan finished in time")
                .expect("scan record present");
            assert_invariants(&record);
            record
        }

        async fn until_registered(&self, id: ScanId) {
            timeout(DEADLINE, async {
                while self.controller.registry().lookup(id).is_none() {
                    tokio::time::sleep(POLL).await;
                }
            })
            .await
            .expect("scan process registered in time");
        }

        fn queue(&self, target: &str) -> ScanId {
            self.store
                .insert(NewScan {
                    name: format!("test {target}"),
                    target: target.to_string(),
                })
                .expect("insert")
        }
    }

    fn copy_fixture(fixture: &Path) -> String {
        format!("cp '{}' '{{report}}'", fixture.display())
    }

    fn assert_invariants(record: &ScanRecord) {
        assert_eq!(record.end_time.is_some(), record.status.is_terminal());
        assert_eq!(
            record.report_path.is_some(),
            record.status == ScanStatus::Completed
        );
    }

    #[tokio::test]
    async fn completed_scan_produces_report_and_analytics() {
        let harness = Harness::new(copy_fixture);
        let id = harness
            .controller
            .submit_scan("10.0.0.0/30", Some("nightly".to_string()))
            .expect("submit");

        let record = harness.finished(id).await;
        assert_eq!(record.status, ScanStatus::Completed);
        assert_eq!(record.name, "nightly");
        assert_eq!(
            record.report_path,
            Some(harness.controller.config().report_path(id))
        );
        assert!(harness.controller.registry().is_empty());

        let analytics = harness
            .controller
            .analytics(id)
            .expect("analytics")
            .expect("report available");
        assert_eq!(analytics.total_vulnerabilities, 7);
        assert_eq!(analytics.critical_count, 2);
    }

    #[tokio::test]
    async fn status_right_after_start_is_not_terminal() {
        let harness = Harness::new(|fixture| format!("sleep 0.3; {}", copy_fixture(fixture)));
        let id = harness
            .controller
            .submit_scan("10.0.0.1", None)
            .expect("submit");

        let snapshot = harness
            .controller
            .get_scan_status(id)
            .expect("status")
            .expect("record present");
        assert!(snapshot.status.is_active());
        assert!(snapshot.end_time.is_none());

        let record = harness.finished(id).await;
        assert_eq!(record.status, ScanStatus::Completed);
        assert!(record.name.starts_with("Scan_"));
    }

    #[tokio::test]
    async fn non_zero_exit_fails_and_keeps_diagnostics() {
        let harness = Harness::new(|_| "echo partial; echo 'host unreachable' >&2; exit 3".to_string());
        let id = harness
            .controller
            .submit_scan("10.9.9.9", None)
            .expect("submit");

        let record = harness.finished(id).await;
        assert_eq!(record.status, ScanStatus::Failed);

        let log = fs::read_to_string(harness.controller.config().error_log_path(id))
            .expect("error log written");
        assert!(log.starts_with("STDOUT:\npartial"));
        assert!(log.contains("STDERR:\nhost unreachable"));
        assert!(harness.controller.analytics(id).expect("analytics").is_none());
    }

    #[tokio::test]
    async fn success_without_artifact_fails() {
        let harness = Harness::new(|_| "echo scanned".to_string());
        let id = harness
            .controller
            .submit_scan("10.0.0.2", None)
            .expect("submit");

        let record = harness.finished(id).await;
        assert_eq!(record.status, ScanStatus::Failed);
        assert!(record.report_path.is_none());
    }

    #[tokio::test]
    async fn spawn_failure_fails_the_scan() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("no-such-scanner");
        let harness = Harness::with_tool(
            dir,
            ToolCommand::new(missing.display().to_string(), Vec::<String>::new()),
        );
        let id = harness
            .controller
            .submit_scan("10.0.0.3", None)
            .expect("submit still succeeds");

        let record = harness.finished(id).await;
        assert_eq!(record.status, ScanStatus::Failed);
        assert!(harness.controller.registry().is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_running_scan_kills_it() {
        let harness = Harness::new(|_| "exec sleep 30".to_string());
        let id = harness.queue("10.0.0.4");
        let worker = harness.controller.start_scan(id, "10.0.0.4".to_string());
        harness.until_registered(id).await;

        assert!(harness.controller.cancel_scan(id).expect("cancel"));
        timeout(DEADLINE, worker)
            .await
            .expect("worker exits after cancellation")
            .expect("worker did not panic");

        let record = harness.store.get(id).expect("get").expect("present");
        assert_eq!(record.status, ScanStatus::Cancelled);
        assert_invariants(&record);
        assert!(harness.controller.registry().is_empty());
    }

    #[tokio::test]
    async fn cancelled_while_queued_never_runs() {
        let harness = Harness::new(copy_fixture);
        let id = harness.queue("10.0.0.5");

        assert!(harness.controller.cancel_scan(id).expect("cancel queued"));
        harness
            .controller
            .start_scan(id, "10.0.0.5".to_string())
            .await
            .expect("worker did not panic");

        let record = harness.store.get(id).expect("get").expect("present");
        assert_eq!(record.status, ScanStatus::Cancelled);
        assert!(!harness.controller.config().scan_dir(id).exists());
    }

    #[tokio::test]
    async fn cancelling_a_terminal_scan_is_rejected() {
        let harness = Harness::new(copy_fixture);
        let id = harness
            .controller
            .submit_scan("10.0.0.6", None)
            .expect("submit");
        let before = harness.finished(id).await;

        let err = harness
            .controller
            .cancel_scan(id)
            .expect_err("completed scans cannot be cancelled");
        assert!(matches!(
            err,
            ScanError::InvalidTransition {
                from: ScanStatus::Completed,
                ..
            }
        ));
        assert_eq!(harness.store.get(id).expect("get"), Some(before));
    }

    #[tokio::test]
    async fn cancel_from_another_controller_stops_the_process() {
        let harness = Harness::new(|_| "exec sleep 30".to_string());
        let config = harness
            .controller
            .config()
            .clone()
            .with_cancel_check_interval(Duration::from_millis(50));
        let owner = ScanController::new(harness.store.clone(), config.clone());
        // Separate registry, as in a second `scanward` process.
        let other = ScanController::new(harness.store.clone(), config);

        let id = harness.queue("10.0.0.15");
        let worker = owner.start_scan(id, "10.0.0.15".to_string());
        timeout(DEADLINE, async {
            while owner.registry().lookup(id).is_none() {
                tokio::time::sleep(POLL).await;
            }
        })
        .await
        .expect("scan process registered in time");

        assert!(other.cancel_scan(id).expect("cancel"));
        timeout(DEADLINE, worker)
            .await
            .expect("worker notices the cancel")
            .expect("worker did not panic");

        let record = harness.store.get(id).expect("get").expect("present");
        assert_eq!(record.status, ScanStatus::Cancelled);
        assert!(owner.registry().is_empty());
    }

    /// Fails the first `failures` terminal writes with a store error.
    struct FlakyStore {
        inner: MemoryScanStore,
        failures: std::sync::atomic::AtomicUsize,
    }

    impl ScanStore for FlakyStore {
        fn get(&self, id: ScanId) -> Result<Option<ScanRecord>, ScanError> {
            self.inner.get(id)
        }

        fn all(&self) -> Result<Vec<ScanRecord>, ScanError> {
            self.inner.all()
        }

        fn insert(&self, scan: NewScan) -> Result<ScanId, ScanError> {
            self.inner.insert(scan)
        }

        fn update(&self, record: &ScanRecord) -> Result<(), ScanError> {
            self.inner.update(record)
        }

        fn delete(&self, id: ScanId) -> Result<bool, ScanError> {
            self.inner.delete(id)
        }

        fn transition(&self, id: ScanId, transition: Transition) -> Result<ScanRecord, ScanError> {
            use std::sync::atomic::Ordering;
            if transition != Transition::Start
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok()
            {
                return Err(ScanError::Store("disk full".to_string()));
            }
            self.inner.transition(id, transition)
        }
    }

    #[tokio::test]
    async fn terminal_write_is_retried_after_store_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = dir.path().join("fixture.xml");
        fs::write(&fixture, SAMPLE_REPORT).expect("write fixture");
        let store = Arc::new(FlakyStore {
            inner: MemoryScanStore::new(),
            failures: std::sync::atomic::AtomicUsize::new(2),
        });
        let config = ControllerConfig::default()
            .with_reports_dir(dir.path().join("reports"))
            .with_tool(ToolCommand::new("sh", ["-c".to_string(), copy_fixture(&fixture)]));
        let controller = ScanController::new(store.clone(), config);

        let id = controller.submit_scan("10.0.0.16", None).expect("submit");
        let record = timeout(DEADLINE, controller.wait_for_completion(id, POLL))
            .await
            .expect("scan finished in time")
            .expect("record present");

        assert_eq!(record.status, ScanStatus::Completed);
        assert_invariants(&record);
        assert_eq!(store.failures.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    /// Lets the worker's completion land between the cancel path's status
    /// check and its write.
    struct CompletesFirst {
        inner: MemoryScanStore,
    }

    impl ScanStore for CompletesFirst {
        fn get(&self, id: ScanId) -> Result<Option<ScanRecord>, ScanError> {
            self.inner.get(id)
        }

        fn all(&self) -> Result<Vec<ScanRecord>, ScanError> {
            self.inner.all()
        }

        fn insert(&self, scan: NewScan) -> Result<ScanId, ScanError> {
            self.inner.insert(scan)
        }

        fn update(&self, record: &ScanRecord) -> Result<(), ScanError> {
            self.inner.update(record)
        }

        fn delete(&self, id: ScanId) -> Result<bool, ScanError> {
            self.inner.delete(id)
        }

        fn transition(&self, id: ScanId, transition: Transition) -> Result<ScanRecord, ScanError> {
            if transition == Transition::Cancel {
                self.inner.transition(
                    id,
                    Transition::Complete {
                        report_path: PathBuf::from("reports/scan_1/report.xml"),
                    },
                )?;
            }
            self.inner.transition(id, transition)
        }
    }

    #[test]
    fn cancel_racing_natural_completion_keeps_completed_state() {
        let store = Arc::new(CompletesFirst {
            inner: MemoryScanStore::new(),
        });
        let id = store
            .insert(NewScan {
                name: "race".to_string(),
                target: "10.0.0.7".to_string(),
            })
            .expect("insert");
        store.inner.transition(id, Transition::Start).expect("start");

        let controller = ScanController::new(store.clone(), ControllerConfig::default());
        assert!(!controller.cancel_scan(id).expect("cancel reports the lost race"));

        let record = store.get(id).expect("get").expect("present");
        assert_eq!(record.status, ScanStatus::Completed);
        assert_invariants(&record);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_scans_use_isolated_outputs() {
        let harness = Harness::new(|fixture| {
            format!(
                "echo \"$0\" > '{{output_dir}}/target.txt'; sleep 0.2; {}",
                copy_fixture(fixture)
            )
        });
        let first = harness
            .controller
            .submit_scan("10.1.0.0/24", None)
            .expect("submit first");
        let second = harness
            .controller
            .submit_scan("10.2.0.0/24", None)
            .expect("submit second");

        let (a, b) = tokio::join!(harness.finished(first), harness.finished(second));
        assert_eq!(a.status, ScanStatus::Completed);
        assert_eq!(b.status, ScanStatus::Completed);
        assert_ne!(a.report_path, b.report_path);

        for (id, target) in [(first, "10.1.0.0/24"), (second, "10.2.0.0/24")] {
            let written = fs::read_to_string(
                harness.controller.config().scan_dir(id).join("target.txt"),
            )
            .expect("target marker");
            assert_eq!(written.trim(), target);
        }
    }

    #[tokio::test]
    async fn delete_removes_record_and_artifacts() {
        let harness = Harness::new(copy_fixture);
        let id = harness
            .controller
            .submit_scan("10.0.0.8", None)
            .expect("submit");
        harness.finished(id).await;
        let scan_dir = harness.controller.config().scan_dir(id);
        assert!(scan_dir.exists());

        harness.controller.delete_scan(id).expect("delete");
        assert!(!scan_dir.exists());
        assert!(harness.controller.get_scan(id).expect("get").is_none());
        assert!(harness.controller.analytics(id).expect("analytics").is_none());
        assert!(matches!(
            harness.controller.delete_scan(id),
            Err(ScanError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn active_scans_cannot_be_deleted() {
        let harness = Harness::new(copy_fixture);
        let id = harness.queue("10.0.0.9");
        assert!(matches!(
            harness.controller.delete_scan(id),
            Err(ScanError::InvalidTransition { action: "delete", .. })
        ));
        assert!(harness.store.get(id).expect("get").is_some());
    }

    #[tokio::test]
    async fn corrupted_artifact_leaves_scan_completed_but_unreportable() {
        let harness = Harness::new(copy_fixture);
        let id = harness
            .controller
            .submit_scan("10.0.0.10", None)
            .expect("submit");
        let record = harness.finished(id).await;

        let report_path = record.report_path.expect("report path");
        fs::write(&report_path, "<nmaprun><host>").expect("corrupt artifact");

        assert!(harness.controller.report(id).expect("report").is_none());
        let status = harness
            .controller
            .get_scan_status(id)
            .expect("status")
            .expect("present");
        assert_eq!(status.status, ScanStatus::Completed);
    }

    #[test]
    fn reconcile_fails_orphaned_scans() {
        let harness = Harness::with_tool(
            tempfile::tempdir().expect("tempdir"),
            ToolCommand::default(),
        );
        let orphan = harness.queue("10.0.0.11");
        harness
            .store
            .transition(orphan, Transition::Start)
            .expect("start");
        let queued = harness.queue("10.0.0.12");
        let done = harness.queue("10.0.0.13");
        harness
            .store
            .transition(done, Transition::Fail)
            .expect("fail");

        let failed = harness.controller.reconcile().expect("reconcile");
        assert_eq!(failed, vec![orphan, queued]);
        for id in [orphan, queued] {
            let record = harness.store.get(id).expect("get").expect("present");
            assert_eq!(record.status, ScanStatus::Failed);
            assert_invariants(&record);
        }
        assert!(harness.dir.path().exists());
    }

    #[test]
    fn rejects_blank_and_option_like_targets() {
        let harness = Harness::with_tool(
            tempfile::tempdir().expect("tempdir"),
            ToolCommand::default(),
        );
        for target in ["", "   ", "--script=evil"] {
            assert!(matches!(
                harness.controller.submit_scan(target, None),
                Err(ScanError::InvalidTarget(_))
            ));
        }
        assert!(harness.store.all().expect("all").is_empty());
    }
}
