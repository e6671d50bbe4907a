use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bookshelf::clock::SystemClock;
use bookshelf::config::{DeletePolicy, FieldPolicy, Settings, UpdatePolicy};
use bookshelf::guard::EntryPoint;
use bookshelf::manager::{self, SystemProfile};
use bookshelf::server::BookServer;
use bookshelf::VersionedStore;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON settings file; flags below override it.
    #[clap(long)]
    config: Option<PathBuf>,

    #[clap(long)]
    addr: Option<String>,

    #[clap(long)]
    data_dir: Option<PathBuf>,

    /// Keep everything in memory (no journal).
    #[clap(long)]
    in_memory: bool,

    #[clap(long, value_enum)]
    update_policy: Option<UpdatePolicy>,

    #[clap(long, value_enum)]
    delete_policy: Option<DeletePolicy>,

    #[clap(long, value_enum)]
    field_policy: Option<FieldPolicy>,

    #[clap(long)]
    lock_timeout_ms: Option<u64>,

    #[clap(long)]
    max_attempts: Option<u32>,

    /// Seconds between journal checkpoints; 0 disables them.
    #[clap(long)]
    checkpoint_secs: Option<u64>,
}

impl Args {
    fn settings(&self) -> Result<Settings, Box<dyn std::error::Error>> {
        let mut s = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        if let Some(v) = &self.addr { s.addr = v.clone(); }
        if let Some(v) = &self.data_dir { s.data_dir = v.clone(); }
        if self.in_memory { s.in_memory = true; }
        if let Some(v) = self.update_policy { s.update_policy = v; }
        if let Some(v) = self.delete_policy { s.delete_policy = v; }
        if let Some(v) = self.field_policy { s.field_policy = v; }
        if let Some(v) = self.lock_timeout_ms { s.lock_timeout_ms = v; }
        if let Some(v) = self.max_attempts { s.max_attempts = v; }
        if let Some(v) = self.checkpoint_secs { s.checkpoint_secs = v; }
        Ok(s)
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bookshelf=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let settings = match args.settings() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "could not load settings");
            std::process::exit(2);
        }
    };

    let profile = SystemProfile::detect();
    info!(
        cores = profile.logical_cores,
        workers = profile.worker_threads,
        strict_durability = profile.strict_durability,
        "resource profile"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(profile.worker_threads)
        .max_blocking_threads(profile.blocking_threads)
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    if let Err(e) = runtime.block_on(async_main(settings, profile)) {
        error!(error = %e, "server stopped");
        std::process::exit(1);
    }
}

async fn async_main(settings: Settings, profile: SystemProfile) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = settings.addr.parse()?;
    let config = settings.store_config(profile.strict_durability);
    info!(?config, field_policy = ?settings.field_policy, "store configuration");

    let store = if settings.in_memory {
        info!("running without a journal, state is lost on exit");
        Arc::new(VersionedStore::in_memory(config, SystemClock))
    } else {
        std::fs::create_dir_all(&settings.data_dir)?;
        Arc::new(VersionedStore::open(&settings.journal_path(), config, SystemClock)?)
    };

    if !settings.in_memory && settings.checkpoint_secs > 0 {
        manager::start_checkpoint_thread(store.clone(), Duration::from_secs(settings.checkpoint_secs));
    }

    let entry = EntryPoint::new(store, settings.field_policy);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    };

    BookServer::new(entry).run(addr, shutdown).await?;
    Ok(())
}
