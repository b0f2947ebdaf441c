use crate::error::ScanError;
use crate::record::{NewScan, ScanId, ScanRecord, ScanStatus, Transition};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;
use time::OffsetDateTime;

/// Persistence boundary for scan records.
///
/// Every method is atomic with respect to a single record. `transition` is the
/// compare-and-swap primitive the controller relies on: the check against the
/// current status and the write happen under the same lock, so a cancel and a
/// worker completion racing on one scan cannot both win.
pub trait ScanStore: Send + Sync {
    fn get(&self, id: ScanId) -> Result<Option<ScanRecord>, ScanError>;

    fn all(&self) -> Result<Vec<ScanRecord>, ScanError>;

    fn active(&self) -> Result<Vec<ScanRecord>, ScanError> {
        let mut scans = self.all()?;
        scans.retain(ScanRecord::is_active);
        Ok(scans)
    }

    fn completed(&self) -> Result<Vec<ScanRecord>, ScanError> {
        let mut scans = self.all()?;
        scans.retain(|scan| scan.status == ScanStatus::Completed);
        Ok(scans)
    }

    fn insert(&self, scan: NewScan) -> Result<ScanId, ScanError>;

    /// Full replace keyed by `record.id`.
    fn update(&self, record: &ScanRecord) -> Result<(), ScanError>;

    fn delete(&self, id: ScanId) -> Result<bool, ScanError>;

    fn transition(&self, id: ScanId, transition: Transition) -> Result<ScanRecord, ScanError>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ScanTable {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    scans: Vec<ScanRecord>,
}

impl ScanTable {
    fn get(&self, id: ScanId) -> Option<&ScanRecord> {
        self.scans.iter().find(|scan| scan.id == id)
    }

    fn get_mut(&mut self, id: ScanId) -> Result<&mut ScanRecord, ScanError> {
        self.scans
            .iter_mut()
            .find(|scan| scan.id == id)
            .ok_or(ScanError::RecordNotFound(id))
    }

    fn insert(&mut self, scan: NewScan) -> ScanId {
        let highest = self.scans.iter().map(|scan| scan.id.0).max().unwrap_or(0);
        let id = ScanId(self.next_id.max(highest + 1).max(1));
        self.next_id = id.0 + 1;
        self.scans
            .push(ScanRecord::queued(id, scan, OffsetDateTime::now_utc()));
        id
    }

    fn update(&mut self, record: &ScanRecord) -> Result<(), ScanError> {
        let existing = self.get_mut(record.id)?;
        *existing = record.clone();
        Ok(())
    }

    fn delete(&mut self, id: ScanId) -> bool {
        let before = self.scans.len();
        self.scans.retain(|scan| scan.id != id);
        self.scans.len() != before
    }

    fn transition(&mut self, id: ScanId, transition: Transition) -> Result<ScanRecord, ScanError> {
        let record = self.get_mut(id)?;
        record.apply(transition, OffsetDateTime::now_utc())?;
        Ok(record.clone())
    }
}

fn poisoned<T>(_: T) -> ScanError {
    ScanError::Store("scan store lock poisoned".to_string())
}

#[derive(Debug, Default)]
pub struct MemoryScanStore {
    table: Mutex<ScanTable>,
}

impl MemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ScanTable>, ScanError> {
        self.table.lock().map_err(poisoned)
    }
}

impl ScanStore for MemoryScanStore {
    fn get(&self, id: ScanId) -> Result<Option<ScanRecord>, ScanError> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn all(&self) -> Result<Vec<ScanRecord>, ScanError> {
        Ok(self.lock()?.scans.clone())
    }

    fn insert(&self, scan: NewScan) -> Result<ScanId, ScanError> {
        Ok(self.lock()?.insert(scan))
    }

    fn update(&self, record: &ScanRecord) -> Result<(), ScanError> {
        self.lock()?.update(record)
    }

    fn delete(&self, id: ScanId) -> Result<bool, ScanError> {
        Ok(self.lock()?.delete(id))
    }

    fn transition(&self, id: ScanId, transition: Transition) -> Result<ScanRecord, ScanError> {
        self.lock()?.transition(id, transition)
    }
}

/// Flat-file store: one pretty-printed JSON document holding every record and
/// the id counter. Each operation re-reads the file, so several processes can
/// share it. Operations are serialized across processes by an advisory lock
/// on a sidecar `<file>.lock`, held shared for reads and exclusive for
/// read-modify-write. Writes land in a uniquely named temp file that is then
/// renamed over the document.
#[derive(Debug)]
pub struct JsonScanStore {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl JsonScanStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ScanError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        let store = Self {
            path,
            lock_path: PathBuf::from(lock_path),
            guard: Mutex::new(()),
        };
        {
            let lock = store.lock_file()?;
            lock.lock_exclusive()?;
            if !store.path.exists() {
                store.save(&ScanTable::default())?;
            }
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> Result<fs::File, ScanError> {
        Ok(fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)?)
    }

    fn load(&self) -> Result<ScanTable, ScanError> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(ScanTable::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(ScanTable::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, table: &ScanTable) -> Result<(), ScanError> {
        let bytes = serde_json::to_vec_pretty(table)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&ScanTable) -> T) -> Result<T, ScanError> {
        let _guard = self.guard.lock().map_err(poisoned)?;
        let lock = self.lock_file()?;
        lock.lock_shared()?;
        let table = self.load()?;
        Ok(f(&table))
    }

    fn modify<T>(
        &self,
        f: impl FnOnce(&mut ScanTable) -> Result<T, ScanError>,
    ) -> Result<T, ScanError> {
        let _guard = self.guard.lock().map_err(poisoned)?;
        let lock = self.lock_file()?;
        lock.lock_exclusive()?;
        let mut table = self.load()?;
        let value = f(&mut table)?;
        self.save(&table)?;
        Ok(value)
    }
}

impl ScanStore for JsonScanStore {
    fn get(&self, id: ScanId) -> Result<Option<ScanRecord>, ScanError> {
        self.read(|table| table.get(id).cloned())
    }

    fn all(&self) -> Result<Vec<ScanRecord>, ScanError> {
        self.read(|table| table.scans.clone())
    }

    fn insert(&self, scan: NewScan) -> Result<ScanId, ScanError> {
        self.modify(|table| Ok(table.insert(scan)))
    }

    fn update(&self, record: &ScanRecord) -> Result<(), ScanError> {
        self.modify(|table| table.update(record))
    }

    fn delete(&self, id: ScanId) -> Result<bool, ScanError> {
        self.modify(|table| Ok(table.delete(id)))
    }

    fn transition(&self, id: ScanId, transition: Transition) -> Result<ScanRecord, ScanError> {
        self.modify(|table| table.transition(id, transition))
    }
}
