//! Checkpoint client side executable.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use tokio::runtime::Builder;

use checkpointd::{logger_init, pf_error, CheckpointdError, CkptSession};

mod repl;

use crate::repl::ClientRepl;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client-facing API address of the daemon to attach to.
    #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], 52700)))]
    daemon: SocketAddr,

    /// Per-call timeout passed to the daemon in millisecs; 0 uses the
    /// daemon's own limit.
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(timeout_ms)` on success
    /// or `Err(CheckpointdError)` on any error.
    fn sanitize(&self) -> Result<Option<u64>, CheckpointdError> {
        if self.threads < 2 {
            Err(CheckpointdError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else if self.daemon.port() <= 1024 {
            Err(CheckpointdError::msg(format!(
                "invalid daemon port {}",
                self.daemon.port()
            )))
        } else if self.timeout_ms == 0 {
            Ok(None)
        } else {
            Ok(Some(self.timeout_ms))
        }
    }
}

/// Actual main function of the checkpoint client executable.
fn client_main() -> Result<(), CheckpointdError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let timeout_ms = args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    // enter tokio runtime, connect to the daemon, and run the REPL
    runtime.block_on(async move {
        let session =
            CkptSession::init(rand::random(), args.daemon, timeout_ms).await?;
        println!("Initialized as client {}", session.client());

        ClientRepl::new(session).run().await?;

        Ok::<(), CheckpointdError>(()) // give type hint for this async closure
    })
}

/// Main function of the checkpoint client executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
