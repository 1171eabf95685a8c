use super::args::*;
use refiner_core::config::{self, RefinerConfig};
use refiner_core::errors::ConfigError;
use refiner_core::storage::Store;
use std::path::{Path, PathBuf};

pub mod run;
pub mod runs;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const RUN_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Init(args) => cmd_init(args),
        Command::Run(args) => run::cmd_run(args).await,
        Command::Runs(args) => runs::cmd_runs(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(args: InitArgs) -> anyhow::Result<i32> {
    if args.config.exists() {
        eprintln!("note: {} already exists", args.config.display());
        return Ok(exit_codes::OK);
    }
    if let Some(parent) = args.config.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    config::write_sample_config(&args.config)?;
    eprintln!("created {}", args.config.display());
    Ok(exit_codes::OK)
}

/// Config file (or defaults when absent) with `--db` applied on top.
pub(crate) fn load_config(
    path: &Path,
    db: Option<&PathBuf>,
    strict: bool,
) -> Result<RefinerConfig, ConfigError> {
    let mut cfg = config::load_or_default(path, strict)?;
    if let Some(db) = db {
        cfg.database = db.clone();
    }
    Ok(cfg)
}

pub(crate) fn open_store(cfg: &RefinerConfig) -> anyhow::Result<Store> {
    let store = Store::open(&cfg.database)?;
    store.init_schema()?;
    Ok(store)
}
