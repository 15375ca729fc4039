//! Checkpoint daemon node executable.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

use checkpointd::{
    logger_init, parsed_config, pf_error, pf_info, pf_warn, ChanCaps,
    CheckpointNode, CheckpointdError, NodeName, ServiceConfig, ME,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Name of this node; must be unique in the group.
    #[arg(short, long)]
    name: String,

    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Client-facing API port.
    #[arg(short, long, default_value_t = 52700)]
    api_port: u16,

    /// Peer-facing port.
    #[arg(short, long, default_value_t = 52800)]
    p2p_port: u16,

    /// Peer node given as 'name=ip:port'; repeat for each peer.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Service configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(peer_addrs)` on success
    /// or `Err(CheckpointdError)` on any error.
    fn sanitize(
        &self,
    ) -> Result<HashMap<NodeName, SocketAddr>, CheckpointdError> {
        if self.name.is_empty() {
            return Err(CheckpointdError::msg("empty node name"));
        }
        if self.api_port <= 1024 {
            return Err(CheckpointdError::msg(format!(
                "invalid api_port {}",
                self.api_port
            )));
        }
        if self.p2p_port <= 1024 {
            return Err(CheckpointdError::msg(format!(
                "invalid p2p_port {}",
                self.p2p_port
            )));
        }
        if self.api_port == self.p2p_port {
            return Err(CheckpointdError::msg(format!(
                "api_port == p2p_port {}",
                self.api_port
            )));
        }
        if self.threads < 2 {
            return Err(CheckpointdError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        let mut peer_addrs = HashMap::new();
        for peer in &self.peers {
            let (name, addr) = peer.split_once('=').ok_or_else(|| {
                CheckpointdError::msg(format!("invalid peer entry '{}'", peer))
            })?;
            if name.is_empty() || name == self.name {
                return Err(CheckpointdError::msg(format!(
                    "invalid peer name '{}'",
                    name
                )));
            }
            let addr: SocketAddr = addr.parse()?;
            if peer_addrs.insert(name.to_string(), addr).is_some() {
                return Err(CheckpointdError::msg(format!(
                    "duplicate peer name '{}' given",
                    name
                )));
            }
        }
        Ok(peer_addrs)
    }
}

/// Actual main function of the checkpoint daemon.
fn server_main() -> Result<(), CheckpointdError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    let peer_addrs = args.sanitize()?;
    if ME.set(args.name.clone()).is_err() {
        pf_warn!("node name prefix already set");
    }

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(&args.config[..])
    };
    let config = parsed_config!(config_str => ServiceConfig;
                                request_timeout_ms, operation_timeout_ms)?;

    let p2p_addr = SocketAddr::new(args.bind_ip.into(), args.p2p_port);
    let api_addr = SocketAddr::new(args.bind_ip.into(), args.api_port);

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-checkpointd")
            .build()?;

        // enter tokio runtime, connect to the group, and start the main
        // event loop logic
        runtime.block_on(async move {
            pf_info!("connecting to {} peers", peer_addrs.len());
            let mut node = CheckpointNode::new_and_setup(
                args.name,
                p2p_addr,
                api_addr,
                peer_addrs,
                config,
                ChanCaps::default(),
            )
            .await?;

            node.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), CheckpointdError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the checkpoint daemon.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn args() -> CliArgs {
        CliArgs {
            name: "n1".into(),
            bind_ip: Ipv4Addr::LOCALHOST,
            api_port: 40000,
            p2p_port: 40001,
            peers: vec![
                "n2=127.0.0.1:40011".into(),
                "n3=127.0.0.1:40021".into(),
            ],
            config: String::new(),
            threads: 2,
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), CheckpointdError> {
        let peer_addrs = args().sanitize()?;
        assert_eq!(peer_addrs.len(), 2);
        assert_eq!(peer_addrs["n3"], "127.0.0.1:40021".parse()?);
        Ok(())
    }

    #[test]
    fn sanitize_invalid_ports() {
        let mut a = args();
        a.api_port = 1023;
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.p2p_port = a.api_port;
        assert!(a.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let mut a = args();
        a.threads = 1;
        assert!(a.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_peers() {
        let mut a = args();
        a.peers.push("n2=127.0.0.1:40031".into());
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.peers.push("n1=127.0.0.1:40031".into());
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.peers.push("n4".into());
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.peers.push("n4=nowhere".into());
        assert!(a.sanitize().is_err());
    }

    #[test]
    fn config_overlay() -> Result<(), CheckpointdError> {
        let config = parsed_config!(Some("request_timeout_ms = 500") => ServiceConfig;
                                    request_timeout_ms, operation_timeout_ms)?;
        assert_eq!(config.request_timeout_ms, 500);
        assert_eq!(config.operation_timeout_ms, 8000);
        assert!(parsed_config!(Some("bogus = 1") => ServiceConfig;
                               request_timeout_ms, operation_timeout_ms)
        .is_err());
        Ok(())
    }
}
