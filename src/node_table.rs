use crate::prelude::*;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Entries = BTreeMap<u16, LongAddress>;

/// Node id to hardware address mapping learned from topology reports.
///
/// The in-memory table is authoritative for the session; the file at `path`
/// only has to survive restarts. Writes happen outside the table lock.
#[derive(Clone)]
pub struct NodeTable {
    path: PathBuf,
    entries: Arc<Mutex<Entries>>,
    dirty: Arc<AtomicBool>,
    // serializes writers so a flush waits for an in-flight background save
    write_lock: Arc<Mutex<()>>,
}

impl NodeTable {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self::with_entries(path.into(), Entries::new())
    }

    /// Loads the table stored at `path`. A missing, empty or unreadable store
    /// gives an empty table.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let entries = match Self::read(&path) {
            Ok(entries) => {
                info!("Loaded node table from {} ({} nodes)", path.display(), entries.len());
                entries
            }
            Err(err) => {
                warn!("{} - starting with an empty node table", err);
                Entries::new()
            }
        };

        Self::with_entries(path, entries)
    }

    fn with_entries(path: PathBuf, entries: Entries) -> Self {
        Self {
            path,
            entries: Arc::new(Mutex::new(entries)),
            dirty: Arc::new(AtomicBool::new(false)),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn read(path: &Path) -> Result<Entries> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| anyhow!("error reading node table {}: {}", path.display(), err))?;

        if content.trim().is_empty() {
            bail!("node table {} is empty", path.display());
        }

        serde_json::from_str(&content)
            .map_err(|err| anyhow!("node table {} is corrupt: {}", path.display(), err))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, node_id: u16) -> Option<LongAddress> {
        self.entries().get(&node_id).copied()
    }

    /// Records `address` for `node_id`. Returns false when the table already
    /// held exactly this mapping.
    pub fn upsert(&self, node_id: u16, address: LongAddress) -> bool {
        let mut entries = self.entries();
        if entries.get(&node_id) == Some(&address) {
            return false;
        }

        entries.insert(node_id, address);
        self.dirty.store(true, Ordering::SeqCst);
        true
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<u16, LongAddress> {
        self.entries().clone()
    }

    /// Writes the current table to disk.
    pub fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.persist_locked()
    }

    /// Writes the table only if it changed since the last successful write.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.persist_locked()
    }

    /// Saves on a blocking worker. Failures are logged and the table stays
    /// dirty, so the next update or flush tries again.
    pub fn persist_in_background(&self) -> tokio::task::JoinHandle<()> {
        let table = self.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = table.persist() {
                error!("Failed to save node table: {}", err);
            }
        })
    }

    fn persist_locked(&self) -> Result<()> {
        // cleared before the snapshot so a concurrent upsert marks it again
        self.dirty.store(false, Ordering::SeqCst);
        let snapshot = self.snapshot();

        if let Err(err) = self.write(&snapshot) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(err);
        }

        debug!("Node table saved to {} ({} nodes)", self.path.display(), snapshot.len());
        Ok(())
    }

    // data reaches the disk before the rename does, so a power cut leaves
    // either the old table or the new one
    fn write(&self, entries: &Entries) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent)?;
                parent
            }
            _ => Path::new("."),
        };

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let content = serde_json::to_vec_pretty(entries)?;
        Self::write_synced(&tmp, &content)
            .map_err(|err| anyhow!("error writing {}: {}", tmp.display(), err))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|err| anyhow!("error renaming {} to {}: {}", tmp.display(), self.path.display(), err))?;

        // best effort; not every platform can open a directory
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }

        Ok(())
    }

    fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(content)?;
        file.flush()?;
        file.sync_all()
    }

    /// Human readable dump, one row per node.
    pub fn render(&self) -> String {
        let mut r = String::new();
        r.push_str("----------------------------------\n");
        r.push_str("| NODE | ADDRESS                 |\n");
        for (node_id, address) in self.entries().iter() {
            r.push_str(&format!("| {:04} | {} |\n", node_id, address));
        }
        r.push_str("----------------------------------\n");
        r
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
