//! MojetteStor CLI
//!
//! Inspects layout geometry and runs the storage client against an
//! in-memory cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          mojettestor                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Placement   │───▶│ StorageClient│───▶│  In-memory   │       │
//! │  │  + Balancer  │    │  + BlockIo   │    │   cluster    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mojettestor::adapters::{InMemoryCluster, InMemoryMetadata, NodePool};
use mojettestor::config::{ClusterConfig, Config, StorageConfig, VolumeConfig};
use mojettestor::domain::ports::{ConnectionPool, VolumeId};
use mojettestor::ec::{Layout, LayoutParams, BLOCK_SIZE};
use mojettestor::{metrics, CapacityBalancer, PlacementService, StorageClient};

// =============================================================================
// CLI Arguments
// =============================================================================

/// MojetteStor - Mojette erasure-coded storage client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "MOJETTESTOR_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address for /metrics and /healthz
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the geometry of a layout
    Layout {
        /// Layout number (defaults to the configured one)
        #[arg(long)]
        layout: Option<Layout>,
    },

    /// Write and verify files on an in-memory cluster
    Simulate(SimulateArgs),
}

#[derive(ClapArgs, Debug)]
struct SimulateArgs {
    /// Number of files to write
    #[arg(long, default_value = "4")]
    files: usize,

    /// Bytes per file
    #[arg(long, default_value = "1048576")]
    size: usize,

    /// Bytes per application write
    #[arg(long, default_value = "65536")]
    io_size: usize,

    /// Capacity of each simulated storage host in bytes
    #[arg(long, default_value = "1073741824")]
    capacity: u64,

    /// Hosts to take offline after the first balancing pass
    #[arg(long)]
    offline: Vec<String>,

    /// Extra hosts beyond `safe` when no topology is configured
    #[arg(long, default_value = "1")]
    spare: usize,

    /// Keep serving metrics after the run until Ctrl-C
    #[arg(long)]
    hold: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(addr) = args.metrics_addr.clone() {
        tokio::spawn(async move {
            if let Err(e) = run_http_server(&addr).await {
                error!("HTTP server error: {:#}", e);
            }
        });
    }

    match args.command {
        Command::Layout { layout } => print_layout(layout.unwrap_or(config.layout)),
        Command::Simulate(opts) => simulate(config, opts).await,
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

fn print_layout(layout: Layout) -> anyhow::Result<()> {
    let params = LayoutParams::new(layout)?;
    let report = json!({
        "layout": params.layout,
        "inverse": params.inverse,
        "forward": params.forward,
        "safe": params.safe,
        "rows": params.rows(),
        "cols": params.cols(),
        "slopes": params.angles.iter().map(|a| a.p).collect::<Vec<_>>(),
        "sizes": params.sizes,
        "fragment_bytes": (0..params.forward)
            .map(|mp| params.projection_bytes(mp, 1))
            .collect::<Vec<_>>(),
        "storage_overhead": params.storage_overhead(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn simulate(config: Config, opts: SimulateArgs) -> anyhow::Result<()> {
    if opts.io_size == 0 {
        bail!("--io-size must be > 0");
    }
    let params = Arc::new(config.layout_params()?);
    let volumes = if config.volumes.is_empty() {
        default_topology(params.safe + opts.spare)
    } else {
        config.volumes.clone()
    };
    let volume = volumes
        .first()
        .map(|v| VolumeId(v.id))
        .context("configuration has no volume")?;

    info!("Starting simulation");
    info!("  Layout: {}", params.layout);
    info!("  Files: {} x {} bytes", opts.files, opts.size);
    info!("  Offline hosts: {:?}", opts.offline);

    let cluster = Arc::new(InMemoryCluster::new());
    for storage in volumes
        .iter()
        .flat_map(|v| v.clusters.iter())
        .flat_map(|c| c.storages.iter())
    {
        cluster.add_node(&storage.host, opts.capacity);
    }

    let placement = Arc::new(PlacementService::new(&params, &volumes));
    let pool: Arc<dyn ConnectionPool> = Arc::new(NodePool::new(cluster.clone()));
    let balancer = CapacityBalancer::new(placement.clone(), pool.clone(), config.balance_interval());
    balancer.balance_once().await?;

    let shutdown = CancellationToken::new();
    let balancer_task = tokio::spawn(balancer.run(shutdown.clone()));

    for host in &opts.offline {
        if cluster.node(host).is_none() {
            warn!("Unknown host {} ignored", host);
        }
        cluster.set_online(host, false);
    }

    let metadata = Arc::new(InMemoryMetadata::new());
    let client = StorageClient::new(
        params.clone(),
        config.client.clone(),
        placement,
        metadata,
        pool,
    );

    let mut files = Vec::with_capacity(opts.files);
    let mut failures = 0;
    for i in 0..opts.files {
        let data = pattern(opts.size, i as u64 + 1);

        let mut file = client
            .create(volume)
            .await
            .with_context(|| format!("creating file {}", i))?;
        for (k, chunk) in data.chunks(opts.io_size).enumerate() {
            file.write((k * opts.io_size) as u64, chunk)
                .await
                .with_context(|| format!("writing file {}", i))?;
        }
        let attrs = file.close().await?;

        let mut file = client.open(attrs.fid).await?;
        let back = file
            .read(0, data.len())
            .await
            .with_context(|| format!("reading file {}", i))?;
        let verified = back == data;
        if !verified {
            failures += 1;
            error!(fid = %attrs.fid, "read back differs from written data");
        }

        files.push(json!({
            "fid": attrs.fid,
            "size": attrs.size,
            "cluster": attrs.placement.cluster,
            "targets": attrs.placement.targets.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            "verified": verified,
        }));
    }

    shutdown.cancel();
    balancer_task.await?;

    let report = json!({
        "layout": params.layout,
        "blocks_per_file": opts.size.div_ceil(BLOCK_SIZE),
        "files": files,
        "fragment_writes": cluster.total_writes(),
        "fragment_reads": cluster.total_reads(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if opts.hold {
        info!("Holding for metrics scrape, Ctrl-C to exit");
        tokio::signal::ctrl_c().await?;
    }

    if failures > 0 {
        bail!("{} of {} files failed verification", failures, opts.files);
    }
    info!("Simulation complete");
    Ok(())
}

/// One volume, one cluster of `storages` hosts
fn default_topology(storages: usize) -> Vec<VolumeConfig> {
    vec![VolumeConfig {
        id: 1,
        clusters: vec![ClusterConfig {
            id: 1,
            storages: (1..=storages)
                .map(|sid| StorageConfig {
                    sid: sid as u8,
                    host: format!("node-{}", sid),
                })
                .collect(),
        }],
    }]
}

/// Deterministic xorshift fill
fn pattern(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

// =============================================================================
// HTTP Server
// =============================================================================

async fn run_http_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    async fn handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
            "/metrics" => {
                let mut response = respond(StatusCode::OK, metrics::gather_text());
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid HTTP server address {}", addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP server on {}", addr))?;

    info!("HTTP server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("HTTP server accept error")?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                tracing::error!("HTTP server connection error: {}", e);
            }
        });
    }
}
