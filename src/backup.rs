//! Point-in-time store backups with bounded writer concurrency.
//!
//! A backup captures a consistent image of the store (see
//! [`KvStore::snapshot`](crate::KvStore::snapshot)) and hands it to a
//! detached writer thread, so mutations resume immediately and never
//! wait on the disk write. At most `max_backups` writers run at once;
//! a request at the cap blocks until one of them finishes.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, warn};

use crate::Result;

/// Runs backup writers, keeping no more than `max_backups` alive.
pub struct BackupEngine {
    max_backups: usize,
    active: Mutex<usize>,
    done: Condvar,
}

impl BackupEngine {
    /// Creates an engine allowing `max_backups` concurrent writers.
    pub fn new(max_backups: usize) -> Self {
        assert!(max_backups > 0, "max_backups must be positive");
        Self {
            max_backups,
            active: Mutex::new(0),
            done: Condvar::new(),
        }
    }

    /// Writes `snapshot` to `path` on a detached writer thread.
    ///
    /// Blocks while `max_backups` writers are already running. A writer
    /// that cannot create its file logs the failure and is otherwise
    /// silent; spawn failures surface to the caller and leave the
    /// active count untouched.
    pub fn spawn(self: &Arc<Self>, snapshot: Vec<(String, String)>, path: PathBuf) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        while *active >= self.max_backups {
            active = self.done.wait(active).unwrap();
        }
        *active += 1;
        drop(active);

        let engine = self.clone();
        let spawned = thread::Builder::new()
            .name("backup-writer".to_owned())
            .spawn(move || {
                debug!("writing backup {}", path.display());
                if let Err(e) = write_backup(&path, &snapshot) {
                    warn!("backup {} failed: {e}", path.display());
                }
                let mut active = engine.active.lock().unwrap();
                *active -= 1;
                engine.done.notify_all();
            });

        if let Err(e) = spawned {
            let mut active = self.active.lock().unwrap();
            *active -= 1;
            self.done.notify_all();
            return Err(e.into());
        }
        Ok(())
    }

    /// Blocks until every outstanding writer has exited.
    pub fn drain(&self) {
        let mut active = self.active.lock().unwrap();
        while *active > 0 {
            active = self.done.wait(active).unwrap();
        }
    }

    /// Number of writers currently running.
    pub fn active(&self) -> usize {
        *self.active.lock().unwrap()
    }
}

/// Builds the backup file path `<dir>/<base>-<seq>.bck`.
pub fn backup_path(dir: &Path, base: &str, seq: u32) -> PathBuf {
    dir.join(format!("{base}-{seq}.bck"))
}

fn write_backup(path: &Path, entries: &[(String, String)]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for (key, value) in entries {
        writeln!(out, "({key}, {value})")?;
    }
    out.flush()
}
