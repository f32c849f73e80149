//! The postgraph server: a GraphQL API over users, posts and comments.

use clap::Parser;
use std::{env, time::Duration};

use crate::{
    args::{Args, Command},
    config::Config,
    prelude::*,
};

mod api;
mod args;
mod cmd;
mod config;
mod db;
mod http;
mod logger;
mod metrics;
mod prelude;
mod telemetry;


#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;


#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Log error in case stdout is not connected and it is logged into a file.
        error!("{:?}", e);

        eprintln!();
        eprintln!();
        bunt::eprintln!("{$red}▶▶▶ {$bold}Error:{/$}{/$} {[yellow+intense]}", e);
        eprintln!();
        if e.chain().len() > 1 {
            bunt::eprintln!("{$red+italic}Caused by:{/$}");
        }

        for (i, cause) in e.chain().skip(1).enumerate() {
            eprint!(" {: >1$}", "", i * 2);
            eprintln!("‣ {cause}");
        }

        std::process::exit(1);
    }
}

/// Main entry point.
async fn run() -> Result<()> {
    // Backtraces are almost always useful when something goes wrong at
    // startup, so we enable them unless the user decided otherwise.
    if env::var("RUST_BACKTRACE") == Err(env::VarError::NotPresent) {
        env::set_var("RUST_BACKTRACE", "1");
    }

    // Values from a `.env` file are treated like real environment variables.
    // A missing file is not an error.
    let dotenv_path = dotenvy::dotenv().ok();

    let args = Args::parse();
    bunt::set_stdout_color_choice(args.stdout_color());
    bunt::set_stderr_color_choice(args.stderr_color());

    match &args.cmd {
        Command::Serve { shared } => {
            let config = load_config_and_init_logger(shared, &args)?;
            if let Some(path) = dotenv_path {
                debug!("Loaded environment from '{}'", path.display());
            }
            start_server(config).await?;
        }
        Command::Db { cmd, shared } => {
            let config = load_config_and_init_logger(shared, &args)?;
            db::cmd::run(cmd, &config).await?;
        }
        Command::Check { shared } => cmd::check::run(shared, &args).await?,
        Command::WriteConfig { target } => config::write_template(target.as_ref())?,
        Command::ExportApiSchema { target } => cmd::export_api_schema(target.as_ref())?,
    }

    Ok(())
}

async fn start_server(config: Config) -> Result<()> {
    info!("Starting postgraph {} ...", env!("CARGO_PKG_VERSION"));
    trace!("Configuration: {:#?}", config);

    let db = connect_and_migrate_db(&config).await?;
    let reporter = telemetry::ErrorReporter::init(&config.sentry)?;

    let root_node = api::root_node();
    http::serve(config, root_node, db, reporter.clone(), http::shutdown_signal()).await
        .context("failed to start HTTP server")?;

    telemetry::shutdown_tracing().await;
    reporter.flush(Duration::from_secs(2));
    info!("Shut down cleanly");
    Ok(())
}

pub(crate) fn load_config_and_init_logger(shared: &args::Shared, args: &Args) -> Result<Config> {
    let (config, path) = match &shared.config {
        Some(path) => {
            let config = Config::load_from(path)
                .context(format!("failed to load config from '{}'", path.display()))?;
            (config, Some(path.clone()))
        }
        None => Config::from_env_or_default_locations()?,
    };

    // The tracing layer needs the telemetry config, so the logger can only
    // be initialized after loading the config.
    logger::init(&config.log, &config.telemetry, args, args.cmd.name())?;
    match path {
        Some(path) => info!("Loaded config from '{}'", path.display()),
        None => info!("No config file found, using environment variables and defaults"),
    }

    Ok(config)
}

async fn connect_and_migrate_db(config: &Config) -> Result<deadpool_postgres::Pool> {
    let db = db::create_pool(&config.db).await
        .context("failed to create database connection pool (database not running?)")?;
    db::migrate(&mut *db.get().await?).await
        .context("failed to check/run DB migrations")?;
    Ok(db)
}
