//! Command-line entry point: run a node, or act as a client of a running cluster.
//!
//! Start a 3-node cluster:
//! ```bash
//! maelstromdb serve --id 1 --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//! maelstromdb serve --id 2 --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//! maelstromdb serve --id 3 --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! maelstromdb write --cluster 127.0.0.1:7101,127.0.0.1:7102,127.0.0.1:7103 color blue
//! maelstromdb query --cluster 127.0.0.1:7101,127.0.0.1:7102,127.0.0.1:7103 color
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use maelstrom_core::NodeState;
use maelstrom_server::cli::{Cli, ClusterArgs, Command, ServeArgs};
use maelstrom_server::{spawn_node, LeaderProxy, ReadMode, Server, TcpTransport};
use maelstrom_storage::FileStorage;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Write(args) => {
            let committed = proxy(&args.cluster).put(args.key, args.value).await?;
            println!("ok (index {})", committed.index);
        }
        Command::Delete(args) => {
            let existed = proxy(&args.cluster).delete(args.key).await?;
            println!("{}", if existed { "deleted" } else { "not found" });
        }
        Command::Query(args) => {
            let mode = if args.stale { ReadMode::Stale } else { ReadMode::Linearizable };
            match proxy(&args.cluster).get(args.key, mode).await? {
                Some(value) => println!("{value}"),
                None => println!("(not found)"),
            }
        }
        Command::Status(args) => status(&args).await,
    }

    Ok(())
}

fn proxy(args: &ClusterArgs) -> LeaderProxy {
    LeaderProxy::new(args.cluster.clone()).with_timeout(Duration::from_millis(args.timeout_ms))
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.into_config().context("invalid node configuration")?;
    let options = config.node_options()?;
    let data_dir = config.data_dir();

    let storage = FileStorage::with_page_size(&data_dir, config.max_page_bytes)
        .with_context(|| format!("failed to open storage in {}", data_dir.display()))?;
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let transport = TcpTransport::connect(config.node_id, &options.cluster);
    let (handle, worker) = spawn_node(options, storage, transport, inbound_rx)?;
    let server = Server::new(listener, handle.clone(), inbound_tx);
    info!(node = config.node_id, addr = %server.local_addr()?, data_dir = %data_dir.display(), "node started");

    tokio::select! {
        served = server.run_until_ctrl_c() => {
            served?;
            handle.shutdown().await;
        }
        finished = worker => {
            // the decision loop only ends on its own when the node halts
            finished.context("decision loop panicked")??;
            warn!(node = config.node_id, "decision loop exited");
        }
    }
    Ok(())
}

async fn status(args: &ClusterArgs) {
    let mut proxy = proxy(args);
    for addr in &args.cluster {
        match proxy.status(addr).await {
            Ok(status) => {
                let role = match status.state {
                    NodeState::Leader => "leader",
                    NodeState::Candidate => "candidate",
                    NodeState::Follower => "follower",
                };
                println!(
                    "{addr}: node {} {role} term {} leader {:?} commit {} applied {} last {}",
                    status.id,
                    status.term,
                    status.leader_id,
                    status.commit_index,
                    status.last_applied,
                    status.last_log_index
                );
            }
            Err(err) => println!("{addr}: unreachable ({err})"),
        }
    }
}
