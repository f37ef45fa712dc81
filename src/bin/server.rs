//! quorumkv node binary.
//!
//! Runs a single node with separate listeners for peer RPC and the client
//! API.
//!
//! Example for a 3-node cluster:
//!   server --id 1 --transport-port 8001 --api-port 9001 --log-path /tmp/qkv1/log --peers 2=127.0.0.1:8002,3=127.0.0.1:8003
//!   server --id 2 --transport-port 8002 --api-port 9002 --log-path /tmp/qkv2/log --peers 1=127.0.0.1:8001,3=127.0.0.1:8003
//!   server --id 3 --transport-port 8003 --api-port 9003 --log-path /tmp/qkv3/log --peers 1=127.0.0.1:8001,2=127.0.0.1:8002
//!
//! Options:
//!   --local-ip IP               Advertised IP (default 127.0.0.1)
//!   --election-timeout-ms N     Base election timeout (default 1000)
//!   --heartbeat-interval-ms N   Heartbeat interval (default timeout / 3)
//!   --segment-size BYTES        Segment rollover size (default 64 MiB)
//!   --log-type KIND             memory | simple-file | segmented-file
//!   --data-path DIR             Backing store directory

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use quorumkv::api::client_http::create_client_router;
use quorumkv::core::{Config, LogKind, RaftServer};
use quorumkv::log::{Log, MemoryLog, SegmentedLog, SimpleFileLog};
use quorumkv::state_machine::shared_store;
use quorumkv::transport::http::{create_raft_router, HttpTransport};

struct Args {
    config: Config,
    transport_port: u16,
    api_port: u16,
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().collect();

    let mut id: Option<u64> = None;
    let mut local_ip = "127.0.0.1".to_string();
    let mut transport_port: Option<u16> = None;
    let mut api_port: Option<u16> = None;
    let mut peers: HashMap<u64, String> = HashMap::new();
    let mut config = Config::default();
    let mut heartbeat_override: Option<Duration> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--id" => {
                id = Some(args[i + 1].parse().expect("invalid node id"));
                i += 2;
            }
            "--local-ip" => {
                local_ip = args[i + 1].clone();
                i += 2;
            }
            "--transport-port" => {
                transport_port = Some(args[i + 1].parse().expect("invalid transport port"));
                i += 2;
            }
            "--api-port" => {
                api_port = Some(args[i + 1].parse().expect("invalid api port"));
                i += 2;
            }
            "--peers" => {
                // Format: 2=127.0.0.1:8002,3=127.0.0.1:8003
                for spec in args[i + 1].split(',') {
                    let parts: Vec<&str> = spec.split('=').collect();
                    if parts.len() == 2 {
                        let peer_id: u64 = parts[0].parse().expect("invalid peer id");
                        peers.insert(peer_id, parts[1].to_string());
                    }
                }
                i += 2;
            }
            "--log-path" => {
                config.log_path = args[i + 1].clone().into();
                i += 2;
            }
            "--data-path" => {
                config.data_path = args[i + 1].clone().into();
                i += 2;
            }
            "--election-timeout-ms" => {
                let ms: u64 = args[i + 1].parse().expect("invalid election timeout");
                config = config.with_election_timeout(Duration::from_millis(ms));
                i += 2;
            }
            "--heartbeat-interval-ms" => {
                let ms: u64 = args[i + 1].parse().expect("invalid heartbeat interval");
                heartbeat_override = Some(Duration::from_millis(ms));
                i += 2;
            }
            "--segment-size" => {
                config.segment_size = args[i + 1].parse().expect("invalid segment size");
                i += 2;
            }
            "--log-type" => {
                config.log_kind = args[i + 1].parse().unwrap_or_else(|e| {
                    eprintln!("{}", e);
                    process::exit(2);
                });
                i += 2;
            }
            "--vote-target-index" => {
                config.vote_target_index = args[i + 1].parse().expect("invalid vote target index");
                i += 2;
            }
            "--vote-target-term" => {
                config.vote_target_term = args[i + 1].parse().expect("invalid vote target term");
                i += 2;
            }
            other => {
                eprintln!("unknown argument: {}", other);
                process::exit(2);
            }
        }
    }

    let id = id.expect("--id is required");
    let transport_port = transport_port.expect("--transport-port is required");
    let api_port = api_port.expect("--api-port is required");
    if let Some(interval) = heartbeat_override {
        config.heartbeat_interval = interval;
    }
    config.id = id;
    // The advertised address is the cluster-facing one, matching the
    // entries peers carry for us.
    config.local_addr = format!("{}:{}", local_ip, transport_port);
    config.peer_addrs = peers;

    Args {
        config,
        transport_port,
        api_port,
    }
}

fn open_log(config: &Config) -> Box<dyn Log> {
    match config.log_kind {
        LogKind::Memory => Box::new(MemoryLog::new()),
        LogKind::SimpleFile => Box::new(
            SimpleFileLog::open(&config.log_path).expect("failed to open simple-file log"),
        ),
        LogKind::SegmentedFile => Box::new(
            SegmentedLog::open_with_segment_size(&config.log_path, config.segment_size)
                .expect("failed to open segmented log"),
        ),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args();
    let config = args.config;
    info!(
        id = config.id,
        transport_port = args.transport_port,
        api_port = args.api_port,
        log_path = %config.log_path.display(),
        peers = ?config.peer_addrs,
        "starting node"
    );

    let log = open_log(&config);
    let store = shared_store();
    let transport = Arc::new(
        HttpTransport::new(config.peer_addrs.clone(), config.heartbeat_interval)
            .expect("failed to build http transport"),
    );

    let server = RaftServer::start(config, log, store, transport);

    let raft_router = create_raft_router(server.clone());
    let client_router = create_client_router(server);

    let transport_addr: SocketAddr = format!("0.0.0.0:{}", args.transport_port)
        .parse()
        .expect("invalid transport address");
    let transport_listener = tokio::net::TcpListener::bind(transport_addr)
        .await
        .expect("failed to bind transport listener");
    info!(%transport_addr, "peer RPC listening");
    tokio::spawn(async move {
        axum::serve(transport_listener, raft_router)
            .await
            .expect("transport server failed");
    });

    let api_addr: SocketAddr = format!("0.0.0.0:{}", args.api_port)
        .parse()
        .expect("invalid api address");
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .expect("failed to bind api listener");
    info!(%api_addr, "client API listening");
    axum::serve(api_listener, client_router)
        .await
        .expect("api server failed");
}
