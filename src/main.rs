use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use regent::lease::LeaseStore;
use regent::manager::LeaseManager;
use regent::settings::AppConfig;
use regent::store::{DocumentStore, MemStore};
use regent::time::StoreClock;
use regent::trace;

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Leadership lease control plane daemon
struct Args {
    /// whether to be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.verbose {
        println!("DEBUG {args:?}");
    }

    let cfg = AppConfig::load(args.config.as_deref())?;
    trace::init(cfg.log.format);

    let store: Arc<dyn DocumentStore> = Arc::new(MemStore::new());
    let clock = Arc::new(StoreClock::open(Arc::clone(&store)).await?);
    let leases = LeaseStore::new(store);
    let (manager, worker) = LeaseManager::start(leases, clock);

    info!("regent running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    manager.shutdown();
    worker.await?;
    Ok(())
}
