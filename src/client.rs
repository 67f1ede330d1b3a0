//! Client side of the session protocol.
//!
//! A client owns three FIFOs (request, response, notification), created
//! before connecting and unlinked on disconnect. Requests go out on the
//! held request pipe; each acknowledgment is collected from a fresh
//! open of the response pipe, mirroring how the server sends them.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;

use crate::protocol::{
    encode_key_request, notification_text, SessionPipes, NOTIF_FRAME_LEN, OP_CONNECT,
    OP_DISCONNECT, OP_SUBSCRIBE, OP_UNSUBSCRIBE,
};
use crate::server::create_fifo;
use crate::{KvsError, Result};

/// How long the notification listener sleeps when the pipe is idle.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Builds the conventional pipe paths for a client id:
/// `/tmp/req<id>`, `/tmp/resp<id>` and `/tmp/notif<id>`.
pub fn session_pipes(client_id: &str) -> SessionPipes {
    SessionPipes {
        request: PathBuf::from(format!("/tmp/req{client_id}")),
        response: PathBuf::from(format!("/tmp/resp{client_id}")),
        notification: PathBuf::from(format!("/tmp/notif{client_id}")),
    }
}

/// A connected interactive session.
pub struct KvsClient {
    pipes: SessionPipes,
    /// Request pipe write end, held open for the whole session.
    request: File,
}

impl KvsClient {
    /// Creates the client FIFOs and connects through the server FIFO.
    ///
    /// Any stale pipe files from a previous run are replaced. Blocks
    /// until the server acknowledges the connection.
    pub fn connect(pipes: SessionPipes, server_pipe: &Path) -> Result<Self> {
        for path in [&pipes.request, &pipes.response, &pipes.notification] {
            create_fifo(path)?;
        }

        let record = pipes.encode()?;
        {
            let mut server = OpenOptions::new().write(true).open(server_pipe)?;
            server.write_all(&record)?;
        }

        let status = read_response(&pipes.response, OP_CONNECT)?;
        if status != 0 {
            return Err(KvsError::StringError(format!(
                "server refused connection (status {status})"
            )));
        }

        // Blocks until the worker thread opens the read end.
        let request = OpenOptions::new().write(true).open(&pipes.request)?;
        debug!("connected via {}", pipes.request.display());
        Ok(Self { pipes, request })
    }

    /// The pipe paths this session is using.
    pub fn pipes(&self) -> &SessionPipes {
        &self.pipes
    }

    /// Subscribes to change notifications for `key`.
    ///
    /// Returns whether the server accepted the subscription; it refuses
    /// when the key does not exist or no slot is free.
    pub fn subscribe(&mut self, key: &str) -> Result<bool> {
        let frame = encode_key_request(OP_SUBSCRIBE, key)?;
        self.request.write_all(&frame)?;
        Ok(read_response(&self.pipes.response, OP_SUBSCRIBE)? == 1)
    }

    /// Drops the subscription for `key`.
    ///
    /// Returns whether a subscription was actually removed.
    pub fn unsubscribe(&mut self, key: &str) -> Result<bool> {
        let frame = encode_key_request(OP_UNSUBSCRIBE, key)?;
        self.request.write_all(&frame)?;
        Ok(read_response(&self.pipes.response, OP_UNSUBSCRIBE)? == 0)
    }

    /// Ends the session and removes the client FIFOs.
    pub fn disconnect(mut self) -> Result<()> {
        self.request.write_all(&[OP_DISCONNECT])?;
        let status = read_response(&self.pipes.response, OP_DISCONNECT)?;
        drop(self.request);
        for path in [&self.pipes.request, &self.pipes.response, &self.pipes.notification] {
            let _ = std::fs::remove_file(path);
        }
        if status != 0 {
            return Err(KvsError::StringError(format!(
                "disconnect failed (status {status})"
            )));
        }
        Ok(())
    }
}

/// Reads one two-byte acknowledgment from a fresh open of the response
/// pipe, verifying the echoed opcode.
fn read_response(path: &Path, expect_op: u8) -> Result<u8> {
    let mut pipe = File::open(path)?;
    let mut frame = [0u8; 2];
    pipe.read_exact(&mut frame)?;
    if frame[0] != expect_op {
        return Err(KvsError::Protocol(format!(
            "response opcode {} does not match request {expect_op}",
            frame[0]
        )));
    }
    Ok(frame[1])
}

/// Background reader of a session's notification pipe.
///
/// Collects complete 42-byte frames and hands their text to a callback.
/// The pipe is opened non-blocking so the listener starts before any
/// notification has been sent.
pub struct NotificationListener {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl NotificationListener {
    /// Spawns the listener thread for `path`.
    pub fn spawn<F>(path: &Path, mut on_frame: F) -> Result<Self>
    where
        F: FnMut(String) + Send + 'static,
    {
        let mut pipe = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("notif-listener".to_owned())
            .spawn(move || {
                let mut frame = [0u8; NOTIF_FRAME_LEN];
                let mut filled = 0;
                while !flag.load(Ordering::Relaxed) {
                    match pipe.read(&mut frame[filled..]) {
                        // No writer on the pipe right now.
                        Ok(0) => thread::sleep(IDLE_SLEEP),
                        Ok(n) => {
                            filled += n;
                            if filled == NOTIF_FRAME_LEN {
                                filled = 0;
                                on_frame(notification_text(&frame));
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(IDLE_SLEEP)
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            debug!("notification listener stopping: {e}");
                            return;
                        }
                    }
                }
            })?;
        Ok(Self { stop, handle })
    }

    /// Stops the listener and waits for its thread to exit.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_pipes_follow_the_naming_convention() {
        let pipes = session_pipes("7");
        assert_eq!(pipes.request, PathBuf::from("/tmp/req7"));
        assert_eq!(pipes.response, PathBuf::from("/tmp/resp7"));
        assert_eq!(pipes.notification, PathBuf::from("/tmp/notif7"));
    }
}
