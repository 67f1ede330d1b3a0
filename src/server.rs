//! Connection acceptor, bounded session handoff and worker pool.
//!
//! The acceptor thread reads connect records off the well-known server
//! FIFO and enqueues them into a bounded channel; a fixed pool of
//! worker threads dequeues sessions and speaks the request/response
//! protocol until the client disconnects or a drain is requested.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::protocol::{
    decode_key, SessionPipes, CONNECT_FRAME_LEN, KEY_FRAME_LEN, OP_CONNECT, OP_DISCONNECT,
    OP_SUBSCRIBE, OP_UNSUBSCRIBE,
};
use crate::store::KvStore;
use crate::subs::{Session, SessionTable, MAX_SESSION_COUNT};
use crate::{KvsError, Result};

/// How often blocked readers re-check the shutdown flags.
const POLL_INTERVAL_MS: u16 = 100;

/// Shutdown coordination shared by the signal thread, the acceptor and
/// the workers.
///
/// A drain (`SIGUSR1`) pauses the acceptor and asks every worker to
/// close its session gracefully; the last one out wakes the acceptor,
/// which resumes accepting. Termination (`SIGINT`) ends every loop.
pub struct Shutdown {
    drain: AtomicBool,
    term: AtomicBool,
    clients: Mutex<usize>,
    idle: Condvar,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Creates the shared shutdown state.
    pub fn new() -> Self {
        Self {
            drain: AtomicBool::new(false),
            term: AtomicBool::new(false),
            clients: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    /// Requests a graceful tear-down of every active session.
    pub fn begin_drain(&self) {
        self.drain.store(true, Ordering::SeqCst);
    }

    /// Whether a session drain is in progress.
    pub fn draining(&self) -> bool {
        self.drain.load(Ordering::SeqCst)
    }

    /// Requests server termination.
    pub fn terminate(&self) {
        self.term.store(true, Ordering::SeqCst);
    }

    /// Whether server termination was requested.
    pub fn terminating(&self) -> bool {
        self.term.load(Ordering::SeqCst)
    }

    /// Number of sessions currently being served.
    pub fn active_clients(&self) -> usize {
        *self.clients.lock().unwrap()
    }

    fn client_enter(&self) {
        *self.clients.lock().unwrap() += 1;
    }

    fn client_exit(&self) {
        let mut clients = self.clients.lock().unwrap();
        *clients -= 1;
        if *clients == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_for_drain(&self) {
        let mut clients = self.clients.lock().unwrap();
        while *clients > 0 {
            clients = self.idle.wait(clients).unwrap();
        }
        self.drain.store(false, Ordering::SeqCst);
    }
}

enum Wait {
    Readable,
    Drain,
    Term,
}

/// The session-serving half of the key-value server.
pub struct KvsServer {
    store: KvStore,
    sessions: Arc<SessionTable>,
    shutdown: Arc<Shutdown>,
    fifo_path: PathBuf,
}

impl KvsServer {
    /// Creates a server that will listen on `fifo_path`.
    pub fn new(
        store: KvStore,
        sessions: Arc<SessionTable>,
        shutdown: Arc<Shutdown>,
        fifo_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            sessions,
            shutdown,
            fifo_path: fifo_path.into(),
        }
    }

    /// Path of the server FIFO.
    pub fn fifo_path(&self) -> &Path {
        &self.fifo_path
    }

    /// Creates the server FIFO, starts the worker pool and accepts
    /// connections until termination is requested.
    pub fn run(&self) -> Result<()> {
        create_fifo(&self.fifo_path)?;
        let (tx, rx) = channel::bounded::<SessionPipes>(MAX_SESSION_COUNT);

        let result = thread::scope(|s| {
            for id in 0..MAX_SESSION_COUNT {
                let rx = rx.clone();
                s.spawn(move || self.worker_loop(id, rx));
            }
            drop(rx);
            self.accept_loop(tx)
        });

        let _ = fs::remove_file(&self.fifo_path);
        result
    }

    fn accept_loop(&self, tx: Sender<SessionPipes>) -> Result<()> {
        // Opened read+write: the open never blocks waiting for a client
        // and the descriptor never reaches EOF between connects.
        let mut fifo = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.fifo_path)?;
        info!("listening on {}", self.fifo_path.display());

        loop {
            match wait_readable(&fifo, &self.shutdown)? {
                Wait::Term => return Ok(()),
                Wait::Drain => {
                    info!(
                        "draining {} active session(s)",
                        self.shutdown.active_clients()
                    );
                    self.shutdown.wait_for_drain();
                    info!("drain complete, accepting connections again");
                    continue;
                }
                Wait::Readable => {}
            }

            let mut op = [0u8; 1];
            match fifo.read_exact(&mut op) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if op[0] != OP_CONNECT {
                warn!("discarding unknown opcode {} on server FIFO", op[0]);
                continue;
            }

            let mut payload = [0u8; CONNECT_FRAME_LEN - 1];
            fifo.read_exact(&mut payload)?;
            let pipes = match SessionPipes::decode(&payload) {
                Ok(pipes) => pipes,
                Err(e) => {
                    warn!("discarding malformed connect record: {e}");
                    continue;
                }
            };
            info!("new client connection via {}", pipes.request.display());
            // Blocks while every worker is busy and the queue is full.
            if tx.send(pipes).is_err() {
                return Ok(());
            }
        }
    }

    fn worker_loop(&self, id: usize, rx: Receiver<SessionPipes>) {
        while let Ok(pipes) = rx.recv() {
            if self.shutdown.terminating() {
                return;
            }
            self.shutdown.client_enter();
            if let Err(e) = self.serve_session(&pipes) {
                warn!("worker {id}: session ended with error: {e}");
            }
            self.shutdown.client_exit();
        }
    }

    /// Serves one session from connect acknowledgment to tear-down.
    /// The session slot is released on every exit path.
    fn serve_session(&self, pipes: &SessionPipes) -> Result<()> {
        let (slot, session) = match self.sessions.insert(pipes.notification.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                let _ = send_response(&pipes.response, OP_CONNECT, 1);
                return Err(e);
            }
        };
        let result = self.session_loop(pipes, &session);
        self.sessions.remove(slot);
        result
    }

    fn session_loop(&self, pipes: &SessionPipes, session: &Arc<Session>) -> Result<()> {
        send_response(&pipes.response, OP_CONNECT, 0)?;
        // Blocks until the client opens its write end.
        let mut request = File::open(&pipes.request)?;

        loop {
            match wait_readable(&request, &self.shutdown)? {
                Wait::Term => return Ok(()),
                Wait::Drain => {
                    debug!("drain: disconnecting {}", pipes.request.display());
                    let _ = send_response(&pipes.response, OP_DISCONNECT, 0);
                    return Ok(());
                }
                Wait::Readable => {}
            }

            let mut op = [0u8; 1];
            match request.read_exact(&mut op) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("client closed {}", pipes.request.display());
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            match op[0] {
                OP_DISCONNECT => {
                    session.unsubscribe_all();
                    send_response(&pipes.response, OP_DISCONNECT, 0)?;
                    info!("client disconnected: {}", pipes.request.display());
                    return Ok(());
                }
                OP_SUBSCRIBE => {
                    let key = read_key(&mut request)?;
                    let subscribed = session.subscribe(&key, &self.store);
                    send_response(&pipes.response, OP_SUBSCRIBE, u8::from(subscribed))?;
                }
                OP_UNSUBSCRIBE => {
                    let key = read_key(&mut request)?;
                    let removed = session.unsubscribe(&key);
                    send_response(&pipes.response, OP_UNSUBSCRIBE, u8::from(!removed))?;
                }
                other => {
                    return Err(KvsError::Protocol(format!(
                        "unknown opcode {other} on request pipe"
                    )))
                }
            }
        }
    }
}

/// Replaces any stale FIFO at `path` with a fresh one, mode 0640.
pub fn create_fifo(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    mkfifo(path, Mode::from_bits_truncate(0o640))?;
    Ok(())
}

fn read_key(request: &mut File) -> Result<String> {
    let mut field = [0u8; KEY_FRAME_LEN];
    request
        .read_exact(&mut field)
        .map_err(|e| KvsError::Protocol(format!("truncated key field: {e}")))?;
    decode_key(&field)
}

/// Opens the response pipe's write end, sends one `<opcode, status>`
/// acknowledgment and closes it again.
fn send_response(path: &Path, op: u8, status: u8) -> Result<()> {
    let mut pipe = OpenOptions::new().write(true).open(path)?;
    pipe.write_all(&[op, status])?;
    Ok(())
}

/// Polls `file` for input, waking every `POLL_INTERVAL_MS` to re-check
/// the shutdown flags so a blocked reader cannot miss a drain.
fn wait_readable(file: &File, shutdown: &Shutdown) -> Result<Wait> {
    loop {
        if shutdown.terminating() {
            return Ok(Wait::Term);
        }
        if shutdown.draining() {
            return Ok(Wait::Drain);
        }
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) => continue,
            Ok(_) => return Ok(Wait::Readable),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
