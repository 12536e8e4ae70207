use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kairos::manager::{self, SystemProfile};
use kairos::server::KairosServer;
use kairos::{HashingEmbedder, Metric, QueryEngine, Result, StoreConfig, VectorStore};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, env = "KAIROS_ADDR", default_value = "127.0.0.1:9000")]
    addr: String,

    /// JSON store settings; flags below override it.
    #[clap(long, env = "KAIROS_CONFIG")]
    config: Option<PathBuf>,

    #[clap(long, env = "KAIROS_DATA")]
    data: Option<PathBuf>,

    #[clap(long, env = "KAIROS_DIMENSION")]
    dimension: Option<usize>,

    #[clap(long, env = "KAIROS_METRIC")]
    metric: Option<Metric>,

    #[clap(long, env = "KAIROS_SEARCH_TIMEOUT_MS", default_value = "2000")]
    search_timeout_ms: u64,
}

impl Args {
    fn store_config(&self, profile: &SystemProfile) -> Result<StoreConfig> {
        let mut config = match &self.config {
            Some(path) => StoreConfig::from_file(path)?,
            None => StoreConfig::default(),
        };
        if let Some(data) = &self.data {
            config.data_path = data.clone();
        }
        if let Some(dimension) = self.dimension {
            config.dimension = dimension;
        }
        if let Some(metric) = self.metric {
            config.metric = metric;
        }
        config.strict_durability &= profile.strict_durability;
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,kairos=info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let profile = SystemProfile::detect();
    info!(
        cores = profile.logical_cores,
        workers = profile.worker_threads,
        strict_durability = profile.strict_durability,
        "resource profile"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(profile.worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "could not start runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(args, profile)) {
        error!(kind = e.kind(), error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn async_main(args: Args, profile: SystemProfile) -> Result<()> {
    let config = args.store_config(&profile)?;
    info!(
        path = %config.data_path.display(),
        dimension = config.dimension,
        metric = ?config.metric,
        "opening record store"
    );

    let embedder = Arc::new(HashingEmbedder::new(config.dimension, config.max_tokens));
    let compaction = config.compaction_interval_secs;
    let store = Arc::new(VectorStore::open(config)?);
    store.create_schema()?;

    if let Some(secs) = compaction {
        manager::start_compaction_thread(&store, Duration::from_secs(secs));
    }

    let engine = QueryEngine::new(store.clone(), embedder)?;
    let server = Arc::new(KairosServer::new(engine, Duration::from_millis(args.search_timeout_ms))?);

    let addr = args.addr.clone();
    let serving = tokio::spawn(async move { server.run(&addr).await });

    tokio::select! {
        res = serving => match res {
            Ok(res) => res?,
            Err(e) => error!(error = %e, "server task aborted"),
        },
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
