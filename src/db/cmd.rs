use std::{
    convert::Infallible,
    io,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::Command,
};
use secrecy::ExposeSecret;
use tokio_postgres::{Client, IsolationLevel};

use crate::{prelude::*, config::Config};
use super::{DbConfig, create_pool, query, util::quote_ident};


#[derive(Debug, clap::Subcommand)]
pub(crate) enum DbCommand {
    /// Removes all data and tables from the database.
    Clear,

    /// Runs an `.sql` script with the configured database connection.
    Script {
        /// Path to a file containing an SQL script.
        script: PathBuf,
    },

    /// Runs the database migrations that also automatically run when starting
    /// the server.
    Migrate,

    /// Connects to the database and gives you an SQL prompt.
    /// This just starts the `psql` client, so make sure that is installed
    /// and accessible in your `PATH`.
    Console,

    /// Equivalent to `db clear` followed by `db migrate`.
    Reset,
}

/// Entry point for `db` commands.
pub(crate) async fn run(cmd: &DbCommand, config: &Config) -> Result<()> {
    if let DbCommand::Console = cmd {
        return console(&config.db).map(|_| ());
    }

    let pool = create_pool(&config.db).await?;
    let mut db = pool.get().await?;

    match cmd {
        DbCommand::Clear => clear(&mut db, &config.db).await?,
        DbCommand::Migrate => super::migrate(&mut db).await?,
        DbCommand::Reset => {
            clear(&mut db, &config.db).await?;
            super::migrate(&mut db).await?;
        }
        DbCommand::Script { script } => run_script(&db, script).await?,
        DbCommand::Console => unreachable!("already handled above"),
    }

    Ok(())
}


/// Clears the whole database by removing and re-creating the `public` schema.
/// Asks the user for confirmation first.
async fn clear(db: &mut Client, config: &DbConfig) -> Result<()> {
    let tx = db.build_transaction()
        .isolation_level(IsolationLevel::Serializable)
        .start()
        .await?;

    warn!("You are about to delete all existing data, tables, types and everything in \
        the 'public' schema of the database!");

    // Print some data about this machine and the database
    println!();
    if let Ok(Ok(hostname)) = hostname::get().map(|n| n.into_string()) {
        println!("Hostname: {hostname}");
    }
    println!("Database: {}", config.display_target());

    println!();
    println!("The database currently holds these tables:");
    for name in query::all_table_names(&tx).await? {
        let num_rows = query::count_rows(&tx, &name).await?;
        println!(" - {name} ({num_rows} rows)");
    }

    println!();
    println!("Are you sure you want to completely remove everything in this database? \
        This completely drops the 'public' schema. \
        Please double-check the server you are running this on!\n\
        Type 'yes' to proceed to delete the data.");
    crate::cmd::prompt_for_yes()?;

    let user = tx.query_one("select current_user::text", &[]).await?.get::<_, String>(0);
    tx.batch_execute(&format!(
        "drop schema public cascade;
        create schema public;
        grant all on schema public to {};
        grant all on schema public to public;
        comment on schema public is 'standard public schema';",
        quote_ident(&user),
    )).await?;
    tx.commit().await.context("failed to commit clear transaction")?;

    info!("Dropped and recreated schema 'public'");
    Ok(())
}

async fn run_script(db: &Client, script_path: &Path) -> Result<()> {
    let script = tokio::fs::read_to_string(script_path)
        .await
        .context(format!("failed to read script file '{}'", script_path.display()))?;

    db.batch_execute(&script).await.context("failed to execute script")?;
    info!("Successfully ran SQL script");

    Ok(())
}

fn console(config: &DbConfig) -> Result<Infallible> {
    let error = Command::new("psql").arg(connection_uri(config)).exec();
    let message = match error.kind() {
        io::ErrorKind::NotFound => "`psql` was not found in your `PATH`",
        io::ErrorKind::PermissionDenied => "you don't have sufficient permissions to execute `psql`",
        _ => "an error occured while trying to execute `psql`",
    };
    Err(error).context(message)
}

/// The connection URI `psql` understands, with the password included.
fn connection_uri(config: &DbConfig) -> String {
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
    let encode = |s| utf8_percent_encode(s, NON_ALPHANUMERIC);

    if let Some(url) = &config.url {
        return url.expose_secret().to_owned();
    }

    let password = config.password.as_ref()
        .map(|pw| format!(":{}", encode(pw.expose_secret())))
        .unwrap_or_default();
    format!(
        "postgresql://{}{}@{}:{}/{}",
        encode(&config.user),
        password,
        config.host,
        config.port,
        encode(&config.database),
    )
}
