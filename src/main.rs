//! Command line entry point for the nuttssh switchboard daemon.

use std::path::PathBuf;

use clap::Parser;
use slog::Drain;

/// SSH switchboard server.
///
/// Clients with the `listen` access level publish virtual listening ports;
/// clients with the `initiate` access level connect to them by name. Traffic
/// is spliced between the two SSH connections without binding any of the
/// advertised ports on this host.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address and port to listen on.
    #[arg(short, long, default_value = nuttssh::options::DEFAULT_BIND_ADDRESS)]
    bind: String,
    /// Path to the host key presented to clients.
    #[arg(long, default_value = nuttssh::options::DEFAULT_HOST_KEY_FILE)]
    host_key: PathBuf,
    /// Path to the authorized keys file; re-read on every connection.
    #[arg(long, default_value = nuttssh::options::DEFAULT_AUTHORIZED_KEYS_FILE)]
    authorized_keys: PathBuf,
    /// Show more in logs; may be given multiple times.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn root_logger(verbose: u8) -> slog::Logger {
    let level = match verbose {
        0 => slog::Level::Info,
        1 => slog::Level::Debug,
        _ => slog::Level::Trace,
    };
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

async fn run(args: Args, logger: slog::Logger) -> Result<(), nuttssh::ServerError> {
    nuttssh::Server::builder()
        .bind_address(args.bind)
        .host_key(args.host_key)
        .authorized_keys(args.authorized_keys)
        .logger(logger)
        .build()?
        .listen()
        .await
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let logger = root_logger(args.verbose);

    if let Err(err) = run(args, logger).await {
        eprintln!("Error starting server: {err}");
        std::process::exit(1);
    }
}
