//! kiln-workerd - remote build worker daemon
//!
//! Accepts build requests over HTTP, materializes their inputs from the
//! content store into a per-action sandbox, runs the action, and publishes
//! the produced outputs (plus an action-cache record) back to the store.

mod service;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use kiln_cache::{DiskCache, HttpStore};
use service::Worker;

#[derive(Parser, Debug)]
#[command(
    name = "kiln-workerd",
    version,
    about = "Remote build worker: executes hermetic actions against a content-addressed store"
)]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 1234)]
    port: u16,

    /// Base URL of the remote content store
    #[arg(
        long,
        default_value = "http://localhost:5701/hazelcast/rest/maps/build-cache"
    )]
    cache_base_url: String,

    /// Directory to create per-action working directories in
    #[arg(long, default_value = "/tmp")]
    workdir_root: Utf8PathBuf,

    /// Directory to store cached objects
    #[arg(long, default_value = "/tmp/kiln-worker-cache")]
    cachedir: Utf8PathBuf,

    /// Log command executions (and their stdout/stderr on failure)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    log_commands: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kiln_workerd=info")),
        )
        .init();

    let args = Args::parse();

    tokio::fs::create_dir_all(&args.cachedir).await?;

    let store = HttpStore::new(args.cache_base_url.clone());
    let cache = DiskCache::new(args.cachedir.clone(), store.clone());
    let worker = Worker::new(store, cache, args.workdir_root.clone(), args.log_commands);

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    tracing::info!("worker listening on port {}", args.port);
    tracing::info!("  store:    {}", args.cache_base_url);
    tracing::info!("  cache:    {}", args.cachedir);
    tracing::info!("  workdirs: {}", args.workdir_root);

    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let worker = worker.clone();

        tokio::spawn(async move {
            tracing::debug!("new connection from {}", peer_addr);

            let io = TokioIo::new(socket);
            let served = http1::Builder::new()
                .serve_connection(
                    io,
                    service_fn(move |request| {
                        let worker = worker.clone();
                        async move { worker.handle(request).await }
                    }),
                )
                .await;
            if let Err(e) = served {
                tracing::warn!("connection error from {}: {}", peer_addr, e);
            }

            tracing::debug!("connection from {} closed", peer_addr);
        });
    }
}
