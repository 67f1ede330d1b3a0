//! Batch driver for `.job` command files.
//!
//! The jobs directory is scanned once at startup; a fixed pool of
//! worker threads claims files off the shared list and processes each
//! one sequentially, writing command output to the matching `.out`
//! file. Job workers never touch the session layer, but they share the
//! store, the notifier and the backup engine with it.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::backup::{backup_path, BackupEngine};
use crate::parser::{parse_command, Command};
use crate::store::{KvStore, KVS_ERROR, KVS_MISSING};
use crate::subs::SessionTable;
use crate::{KvsError, Result};

const HELP_TEXT: &str = "Available commands:
  WRITE [(key,value)(key2,value2),...]
  READ [key,key2,...]
  DELETE [key,key2,...]
  SHOW
  WAIT <delay_ms>
  BACKUP
  HELP
";

/// Runs every job file in a directory over a shared store.
pub struct JobRunner {
    store: KvStore,
    sessions: Arc<SessionTable>,
    backups: Arc<BackupEngine>,
    jobs_dir: PathBuf,
}

impl JobRunner {
    /// Creates a runner over the given store and jobs directory.
    pub fn new(
        store: KvStore,
        sessions: Arc<SessionTable>,
        backups: Arc<BackupEngine>,
        jobs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            sessions,
            backups,
            jobs_dir: jobs_dir.into(),
        }
    }

    /// Processes every `.job` file with `max_threads` worker threads.
    ///
    /// Returns once all files have been processed. Individual files
    /// that fail are logged and skipped.
    pub fn run(&self, max_threads: usize) -> Result<()> {
        let jobs = scan_jobs(&self.jobs_dir)?;
        info!(
            "processing {} job file(s) with {max_threads} thread(s)",
            jobs.len()
        );
        let next = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..max_threads {
                s.spawn(|| self.worker(&jobs, &next));
            }
        });
        Ok(())
    }

    fn worker(&self, jobs: &[PathBuf], next: &AtomicUsize) {
        loop {
            let index = next.fetch_add(1, Ordering::Relaxed);
            let Some(path) = jobs.get(index) else {
                return;
            };
            if let Err(e) = self.run_job(path) {
                error!("failed to process {}: {e}", path.display());
            }
        }
    }

    fn run_job(&self, input_path: &Path) -> Result<()> {
        let base = input_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                KvsError::StringError(format!("bad job file name: {}", input_path.display()))
            })?;
        let input = fs::read_to_string(input_path)?;
        let mut out = BufWriter::new(File::create(input_path.with_extension("out"))?);

        debug!("running job {}", input_path.display());
        let mut backup_seq = 0u32;
        for line in input.lines() {
            match parse_command(line) {
                Ok(Some(command)) => {
                    self.exec(command, &mut out, base, &mut backup_seq)?;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("{}: {e}", input_path.display());
                    warn!("Invalid command. See HELP for usage");
                }
            }
        }
        out.flush()?;
        Ok(())
    }

    fn exec(
        &self,
        command: Command,
        out: &mut impl Write,
        base: &str,
        backup_seq: &mut u32,
    ) -> Result<()> {
        match command {
            Command::Write(pairs) => {
                self.store.write_pairs(&pairs);
                // Change events go out after every store lock is released.
                for (key, value) in &pairs {
                    self.sessions.notify(key, Some(value));
                }
            }
            Command::Read(keys) => {
                write!(out, "[")?;
                for (key, value) in self.store.read_keys(&keys) {
                    match value {
                        Some(v) => write!(out, "({key},{v})")?,
                        None => write!(out, "({key},{KVS_ERROR})")?,
                    }
                }
                writeln!(out, "]")?;
            }
            Command::Delete(keys) => {
                let outcome = self.store.delete_keys(&keys);
                // Any absent key makes the whole request list come back
                // tagged; an all-present delete prints nothing.
                if !outcome.missing.is_empty() {
                    write!(out, "[")?;
                    for key in &keys {
                        write!(out, "({key},{KVS_MISSING})")?;
                    }
                    writeln!(out, "]")?;
                }
                for key in &outcome.deleted {
                    self.sessions.notify(key, None);
                }
            }
            Command::Show => self.store.show(out)?,
            Command::Wait(delay_ms) => {
                debug!("job {base}: waiting {delay_ms} ms");
                thread::sleep(Duration::from_millis(delay_ms));
            }
            Command::Backup => {
                *backup_seq += 1;
                let snapshot = self.store.snapshot();
                let path = backup_path(&self.jobs_dir, base, *backup_seq);
                if let Err(e) = self.backups.spawn(snapshot, path) {
                    warn!("job {base}: backup failed: {e}");
                }
            }
            Command::Help => print!("{HELP_TEXT}"),
        }
        Ok(())
    }
}

/// Lists `<dir>/*.job` in name order.
///
/// Entries that cannot be inspected are logged and skipped, as are
/// files with any other extension (`.out` and `.bck` in particular).
pub fn scan_jobs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut jobs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable directory entry: {e}");
                continue;
            }
        };
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "job") {
            jobs.push(path);
        }
    }
    jobs.sort();
    Ok(jobs)
}
