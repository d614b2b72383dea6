//! main
use std::net::TcpStream;

use clap::Parser;
use log::{error, info};

use segdb::api;
use segdb::store::error::Result;
use segdb::store::{settings, OpenOptions, Storage};
use segdb::utils::server::Server;
use segdb::utils::threadpool::ThreadPool;

/// Key value service over a segmented append-only store.
#[derive(Parser, Debug)]
#[command(name = "segdb")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "database")]
    dir: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8083)]
    port: u16,

    /// Segment size limit in bytes
    #[arg(long, default_value_t = settings::DEFAULT_SEGMENT_SIZE)]
    segment_size: u64,

    /// Number of segments that triggers a compaction
    #[arg(long, default_value_t = settings::DEFAULT_COMPACTION_THRESHOLD)]
    compaction_threshold: usize,

    /// fsync every write before acknowledging it
    #[arg(long)]
    sync: bool,

    /// Number of connection worker threads
    #[arg(short, long, default_value_t = 4)]
    workers: usize,
}

fn main() -> Result<()> {
    // Init log config from env.
    env_logger::init();

    let args = Args::parse();

    let store = OpenOptions::new()
        .segment_size_bytes(args.segment_size)
        .compaction_threshold(args.compaction_threshold)
        .sync(args.sync)
        .open(&args.dir)?;
    info!("store opened at {}", args.dir);

    let addr = format!("{}:{}", "0.0.0.0", args.port);
    info!("Starting server at {addr} ...");

    let server = Server::bind(&addr)?;
    server.shutdown_on_signal()?;

    {
        let pool = ThreadPool::new(args.workers)?;

        server.running(|stream: TcpStream| {
            let handle = store.clone();

            let queued = pool.execute(move || {
                api::handle_connection(stream, &handle).unwrap_or_else(|e| error!("{}", e));
            });
            if let Err(e) = queued {
                error!("failed to queue connection: {}", e);
            }
        })?;
        // dropping the pool drains the queued connections.
    }

    info!("closing store ...");
    store.close()
}
