use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::exit;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{error, warn};

use pipekv::{
    parse_client_command, session_pipes, ClientCommand, KvsClient, NotificationListener, Result,
};

#[derive(Parser)]
#[command(
    name = "pipekv-client",
    version,
    about = "Interactive client for the pipekv server"
)]
struct Cli {
    /// Unique client id; names the session pipes under /tmp
    client_id: String,

    /// Path of the server FIFO
    server_pipe: PathBuf,
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
    let pipes = session_pipes(&cli.client_id);
    let mut client = KvsClient::connect(pipes, &cli.server_pipe)?;
    let listener = NotificationListener::spawn(&client.pipes().notification, |text| {
        println!("{text}");
    })?;

    for line in io::stdin().lock().lines() {
        let line = line?;
        match parse_client_command(&line) {
            Ok(Some(ClientCommand::Subscribe(key))) => {
                if !client.subscribe(&key)? {
                    warn!("subscription refused for {key}");
                }
            }
            Ok(Some(ClientCommand::Unsubscribe(key))) => {
                if !client.unsubscribe(&key)? {
                    warn!("no subscription for {key}");
                }
            }
            Ok(Some(ClientCommand::Delay(ms))) => thread::sleep(Duration::from_millis(ms)),
            Ok(Some(ClientCommand::Disconnect)) => break,
            Ok(None) => {}
            Err(e) => {
                warn!("{e}");
                warn!("Invalid command. See HELP for usage");
            }
        }
    }

    client.disconnect()?;
    listener.stop();
    println!("Disconnected from server.");
    Ok(())
}
