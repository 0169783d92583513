use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tnfsd::modules::auth::load_accounts;
use tnfsd::modules::constants::DEFAULT_PORT;
use tnfsd::{ServerConfig, Tnfsd};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Refuse every operation that changes the tree
    #[arg(short, long)]
    read_only: bool,

    /// UDP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// JSON file with the accounts allowed to mount
    #[arg(short, long)]
    accounts: Option<PathBuf>,

    /// Seconds of inactivity after which a session is dropped
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Directory to export
    root: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger based on verbose flag
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new().filter_level(log_level).init();

    let mut config = ServerConfig::new(cli.root)
        .with_port(cli.port)
        .with_bind_addr(cli.bind)
        .read_only(cli.read_only);
    if let Some(path) = &cli.accounts {
        let accounts = load_accounts(path).context("loading accounts")?;
        info!("Loaded {} accounts from {}", accounts.len(), path.display());
        config = config.with_accounts(accounts);
    }
    if let Some(secs) = cli.timeout {
        config = config.with_session_timeout(Duration::from_secs(secs));
    }

    let tnfsd = Tnfsd::default();
    let handle = tnfsd.handle();

    // Signal handling
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();
    let watcher = thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("Received signal {}, stopping...", sig);
            handle.stop();
        }
    });

    let result = tnfsd.start_with_config(&config);
    signals_handle.close();
    if watcher.join().is_err() {
        error!("Signal watcher panicked");
    }

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(-e.code());
    }
    Ok(())
}
