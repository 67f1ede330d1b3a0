//! Session registry and change notification fanout.
//!
//! Connected clients occupy one of `MAX_SESSION_COUNT` fixed slots; each
//! session owns up to `MAX_SUBS` key subscriptions. Mutations fan out
//! through [`SessionTable::notify`], which scans every active session
//! under read locks and writes one fixed-width frame per matching
//! subscription to the session's notification pipe.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{debug, warn};

use crate::protocol::notification_frame;
use crate::store::KvStore;
use crate::{KvsError, Result};

/// Maximum number of concurrently connected sessions.
pub const MAX_SESSION_COUNT: usize = 8;
/// Maximum number of subscription slots per session.
pub const MAX_SUBS: usize = 16;

/// Server-side state of one connected session.
pub struct Session {
    notif_path: PathBuf,
    /// Subscription slots. A `Some` entry is an active subscription.
    /// Write-held by subscribe/unsubscribe, read-held by the notifier.
    subs: RwLock<[Option<String>; MAX_SUBS]>,
}

impl Session {
    fn new(notif_path: PathBuf) -> Self {
        Self {
            notif_path,
            subs: RwLock::new(std::array::from_fn(|_| None)),
        }
    }

    /// Subscribes this session to `key`.
    ///
    /// The key must currently exist in the store, the key must not
    /// already be subscribed on this session, and a free slot must be
    /// available; otherwise the subscription is refused.
    pub fn subscribe(&self, key: &str, store: &KvStore) -> bool {
        let mut subs = self.subs.write().unwrap();
        if !store.contains(key) {
            debug!("subscribe refused, no such key: {key}");
            return false;
        }
        if subs.iter().flatten().any(|k| k == key) {
            debug!("subscribe refused, duplicate key: {key}");
            return false;
        }
        match subs.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(key.to_owned());
                true
            }
            None => {
                debug!("subscribe refused, no free slot for key: {key}");
                false
            }
        }
    }

    /// Drops the subscription for `key`, returning whether it existed.
    pub fn unsubscribe(&self, key: &str) -> bool {
        let mut subs = self.subs.write().unwrap();
        match subs.iter_mut().find(|slot| slot.as_deref() == Some(key)) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// Deactivates every subscription slot.
    pub fn unsubscribe_all(&self) {
        let mut subs = self.subs.write().unwrap();
        subs.fill(None);
    }

    fn is_subscribed(&self, key: &str) -> bool {
        let subs = self.subs.read().unwrap();
        subs.iter().flatten().any(|k| k == key)
    }
}

/// Fixed-capacity table of connected sessions.
///
/// Insertion takes the first empty slot; removal clears it. The slot
/// array sits behind one read/write lock: add/remove write-hold it, the
/// notifier scan only read-holds it. Linear scans are fine at this
/// capacity.
pub struct SessionTable {
    slots: RwLock<Vec<Option<Arc<Session>>>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    /// Creates an empty table with `MAX_SESSION_COUNT` slots.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; MAX_SESSION_COUNT]),
        }
    }

    /// Registers a session, returning its slot index and shared state.
    pub fn insert(&self, notif_path: PathBuf) -> Result<(usize, Arc<Session>)> {
        let mut slots = self.slots.write().unwrap();
        let index = slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(KvsError::SessionLimit)?;
        let session = Arc::new(Session::new(notif_path));
        slots[index] = Some(session.clone());
        Ok((index, session))
    }

    /// Unsubscribes everything and frees the slot.
    pub fn remove(&self, index: usize) {
        let mut slots = self.slots.write().unwrap();
        if let Some(session) = slots[index].take() {
            session.unsubscribe_all();
        }
    }

    /// Number of occupied slots.
    pub fn active(&self) -> usize {
        let slots = self.slots.read().unwrap();
        slots.iter().flatten().count()
    }

    /// Fans a change (`Some(value)`) or deletion (`None`) of `key` out
    /// to every session subscribed to it.
    ///
    /// Each matching session gets one fixed-width frame on its
    /// notification pipe. A session whose pipe cannot be opened or
    /// written (client gone, pipe full) is skipped; its subscription
    /// stays active until it disconnects.
    pub fn notify(&self, key: &str, value: Option<&str>) {
        let slots = self.slots.read().unwrap();
        for session in slots.iter().flatten() {
            if !session.is_subscribed(key) {
                continue;
            }
            if let Err(e) = send_notification(&session.notif_path, key, value) {
                warn!(
                    "skipping notification on {}: {e}",
                    session.notif_path.display()
                );
            }
        }
    }
}

/// Opens the pipe's write end without blocking, writes one frame and
/// closes it. Fails with `ENXIO` when the client no longer holds the
/// read end open.
fn send_notification(path: &Path, key: &str, value: Option<&str>) -> Result<()> {
    let mut pipe = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    pipe.write_all(&notification_frame(key, value))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;
    use std::thread;
    use std::time::Duration;

    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use tempfile::TempDir;

    use crate::protocol::NOTIF_FRAME_LEN;

    fn store_with(key: &str) -> KvStore {
        let store = KvStore::new();
        store.write_pairs(&[(key.to_string(), "v0".to_string())]);
        store
    }

    #[test]
    fn subscribe_requires_existing_key() {
        let table = SessionTable::new();
        let (_, session) = table.insert(PathBuf::from("/tmp/notif-none")).unwrap();
        let store = store_with("present");

        assert!(!session.subscribe("absent", &store));
        assert!(session.subscribe("present", &store));
    }

    #[test]
    fn duplicate_subscription_is_refused() {
        let table = SessionTable::new();
        let (_, session) = table.insert(PathBuf::from("/tmp/notif-none")).unwrap();
        let store = store_with("k");

        assert!(session.subscribe("k", &store));
        assert!(!session.subscribe("k", &store));
    }

    #[test]
    fn subscription_slots_are_bounded() {
        let table = SessionTable::new();
        let (_, session) = table.insert(PathBuf::from("/tmp/notif-none")).unwrap();
        let store = KvStore::new();
        let pairs: Vec<_> = (0..=MAX_SUBS)
            .map(|i| (format!("k{i}"), "v".to_string()))
            .collect();
        store.write_pairs(&pairs);

        for i in 0..MAX_SUBS {
            assert!(session.subscribe(&format!("k{i}"), &store));
        }
        assert!(!session.subscribe(&format!("k{MAX_SUBS}"), &store));

        assert!(session.unsubscribe("k0"));
        assert!(session.subscribe(&format!("k{MAX_SUBS}"), &store));
    }

    #[test]
    fn unsubscribe_missing_reports_not_found() {
        let table = SessionTable::new();
        let (_, session) = table.insert(PathBuf::from("/tmp/notif-none")).unwrap();

        assert!(!session.unsubscribe("never"));
    }

    #[test]
    fn session_slots_are_bounded_and_reusable() {
        let table = SessionTable::new();
        let mut indices = Vec::new();
        for i in 0..MAX_SESSION_COUNT {
            let (index, _) = table.insert(PathBuf::from(format!("/tmp/n{i}"))).unwrap();
            indices.push(index);
        }
        assert!(matches!(
            table.insert(PathBuf::from("/tmp/overflow")),
            Err(KvsError::SessionLimit)
        ));

        table.remove(indices[3]);
        let (index, _) = table.insert(PathBuf::from("/tmp/again")).unwrap();
        assert_eq!(index, indices[3]);
    }

    #[test]
    fn notify_delivers_one_frame_to_subscriber() {
        let dir = TempDir::new().unwrap();
        let notif_path = dir.path().join("notif");
        mkfifo(&notif_path, Mode::from_bits_truncate(0o640)).unwrap();

        let table = SessionTable::new();
        let (_, session) = table.insert(notif_path.clone()).unwrap();
        let store = store_with("k");
        assert!(session.subscribe("k", &store));

        let reader = thread::spawn(move || {
            let mut pipe = File::open(&notif_path).unwrap();
            let mut frame = [0u8; NOTIF_FRAME_LEN];
            pipe.read_exact(&mut frame).unwrap();
            frame
        });
        // Let the reader block in open() before the write end opens.
        thread::sleep(Duration::from_millis(50));

        table.notify("k", Some("v1"));
        let frame = reader.join().unwrap();
        assert_eq!(crate::protocol::notification_text(&frame), "(k,v1)");
    }

    #[test]
    fn notify_skips_sessions_without_reader() {
        let dir = TempDir::new().unwrap();
        let notif_path = dir.path().join("notif");
        mkfifo(&notif_path, Mode::from_bits_truncate(0o640)).unwrap();

        let table = SessionTable::new();
        let (_, session) = table.insert(notif_path).unwrap();
        let store = store_with("k");
        assert!(session.subscribe("k", &store));

        // No reader on the pipe: the fanout must skip it, not block.
        table.notify("k", Some("v1"));
        table.notify("k", None);
    }

    #[test]
    fn removed_session_gets_no_notifications() {
        let table = SessionTable::new();
        let (index, session) = table.insert(PathBuf::from("/tmp/gone")).unwrap();
        let store = store_with("k");
        assert!(session.subscribe("k", &store));

        table.remove(index);
        assert!(!session.is_subscribed("k"));
        assert_eq!(table.active(), 0);
    }
}
