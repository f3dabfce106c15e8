//! A tiny demo server built on `corort_net`: one coroutine per connection,
//! serving a document root over a one-line request/response protocol.
//!
//! ```text
//! $ coro-httpd --port 6969 --docroot ./docroot
//! ```

mod handler;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use corort_net::{AcceptStatus, DispatcherConfig, Server};

#[derive(Parser)]
#[command(name = "coro-httpd", version, about = "Example server built on corort-net")]
struct Cli {
    /// Address to bind (binds all interfaces if omitted)
    #[arg(long)]
    host: Option<IpAddr>,

    /// Port to listen on
    #[arg(long, default_value_t = 6969)]
    port: u16,

    /// Listen backlog
    #[arg(long, default_value_t = 128)]
    backlog: i32,

    /// Worker thread count (defaults to the detected CPU count, clamped to 256)
    #[arg(long)]
    threads: Option<usize>,

    /// Directory containing index.html
    #[arg(long, default_value = "docroot")]
    docroot: PathBuf,

    /// Raise logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let index_path = cli.docroot.join("index.html");
    let document = match std::fs::read(&index_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("error: failed to read {}: {e}", index_path.display());
            return ExitCode::FAILURE;
        }
    };
    handler::set_document(document);

    let config = DispatcherConfig {
        thread_count: cli.threads.unwrap_or_else(|| DispatcherConfig::default().thread_count),
        backlog: cli.backlog,
    };

    let server = match Server::bind_with(cli.host, cli.port, config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("error: failed to bind {:?}:{}: {e}", cli.host, cli.port);
            return ExitCode::FAILURE;
        }
    };
    log::info!("coro-httpd listening on port {} with {} worker thread(s)", cli.port, config.thread_count);

    loop {
        match server.accept(handler::serve) {
            AcceptStatus::Connected(client) => {
                log::debug!("accepted connection from {}", client.remote_addr());
            }
            AcceptStatus::ShutdownRequested => {
                log::info!("shutdown requested, draining workers");
                break;
            }
            AcceptStatus::Error(e) => {
                // A single accept(2) failure (ECONNABORTED, EMFILE, ...) is
                // per-connection, not fatal to the server; only a shutdown
                // request ends the loop, matching the original's behavior.
                log::error!("accept failed: {e}");
            }
        }
    }

    if let Err(e) = server.close() {
        eprintln!("error while closing server: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}
