use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use log::{error, info};
use nix::sys::signal::{signal, SigHandler, Signal};
use signal_hook::consts::{SIGINT, SIGUSR1};
use signal_hook::iterator::Signals;

use pipekv::{
    BackupEngine, JobRunner, KvStore, KvsError, KvsServer, Result, SessionTable, Shutdown,
};

#[derive(Parser)]
#[command(
    name = "pipekv-server",
    version,
    about = "An in-memory key-value store server over named pipes"
)]
struct Cli {
    /// Directory containing .job files
    jobs_dir: PathBuf,

    /// Number of job worker threads
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    max_threads: u32,

    /// Maximum number of concurrent backup writers
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    max_backups: u32,

    /// Name of the server FIFO, created under /tmp
    server_pipe_name: String,
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e);
        exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    // A client that vanishes mid-write must surface as EPIPE on the
    // write, not kill the whole server.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;

    let store = KvStore::new();
    let sessions = Arc::new(SessionTable::new());
    let backups = Arc::new(BackupEngine::new(cli.max_backups as usize));
    let shutdown = Arc::new(Shutdown::new());

    let fifo_path = PathBuf::from(format!("/tmp/{}", cli.server_pipe_name));
    let server = Arc::new(KvsServer::new(
        store.clone(),
        sessions.clone(),
        shutdown.clone(),
        fifo_path,
    ));

    spawn_signal_thread(shutdown, backups.clone(), server.clone())?;

    info!("pipekv-server {}", env!("CARGO_PKG_VERSION"));
    let session_server = server.clone();
    let acceptor = thread::Builder::new()
        .name("acceptor".to_owned())
        .spawn(move || {
            if let Err(e) = session_server.run() {
                error!("session server failed: {e}");
                exit(1);
            }
        })?;

    let runner = JobRunner::new(store, sessions, backups.clone(), cli.jobs_dir);
    runner.run(cli.max_threads as usize)?;
    backups.drain();
    info!("job processing complete");

    // Interactive sessions keep being served until SIGINT.
    acceptor
        .join()
        .map_err(|_| KvsError::StringError("acceptor thread panicked".to_owned()))?;
    Ok(())
}

/// Routes SIGUSR1 to a session drain and SIGINT to server tear-down.
fn spawn_signal_thread(
    shutdown: Arc<Shutdown>,
    backups: Arc<BackupEngine>,
    server: Arc<KvsServer>,
) -> Result<()> {
    let mut signals = Signals::new([SIGUSR1, SIGINT])?;
    thread::Builder::new()
        .name("signals".to_owned())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGUSR1 => {
                        info!("received SIGUSR1, draining active sessions");
                        shutdown.begin_drain();
                    }
                    SIGINT => {
                        info!("received SIGINT, shutting down");
                        shutdown.terminate();
                        backups.drain();
                        let _ = std::fs::remove_file(server.fifo_path());
                        exit(0);
                    }
                    _ => {}
                }
            }
        })?;
    Ok(())
}
