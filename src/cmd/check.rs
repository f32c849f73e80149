//! A subcommand making sure various things are working. Useful before
//! deploying a new version, to find problems as early as possible.

use deadpool_postgres::Pool;

use crate::{
    args::{self, Args},
    config::Config,
    db::{self, MigrationPlan},
    load_config_and_init_logger,
    prelude::*,
};


pub(crate) async fn run(shared: &args::Shared, args: &Args) -> Result<()> {
    let config = load_config_and_init_logger(shared, args)
        .context("failed to load config: cannot proceed with `check` command")?;


    // Perform main checks
    info!("Starting to verify various things...");
    let referenced_files = check_referenced_files(&config);
    let db_pool = db::create_pool(&config.db).await
        .with_context(|| format!("failed to connect to {}", config.db.display_target()));
    let migrations = match &db_pool {
        Ok(pool) => check_migrations(pool).await,
        Err(_) => Err(anyhow!("no database connection")),
    };
    info!("Done verifying various things");


    // Print summary after all log output
    let mut any_errors = false;
    println!();
    bunt::println!("{$bold+blue+intense}Summary{/$}");
    println!();
    print_outcome(&mut any_errors, "Load configuration", &Ok(()));
    print_outcome(&mut any_errors, "Checking all referenced files", &referenced_files);
    print_outcome(&mut any_errors, "Connection to DB", &db_pool);
    print_outcome(&mut any_errors, "DB migrations", &migrations);
    if let Ok(plan) = &migrations {
        let note = match plan {
            MigrationPlan::UpToDate => "database is up to date".to_owned(),
            MigrationPlan::EmptyDb => "database is empty, all migrations will be applied".to_owned(),
            MigrationPlan::Migrate { new_migrations } => {
                format!("{new_migrations} new migration(s) will be applied on `serve`")
            }
        };
        bunt::println!("      {$dimmed}({}){/$}", note);
    }

    println!();
    if any_errors {
        bunt::println!("{$red+intense}➡  Errors have occured!{/$}");
        std::process::exit(1);
    } else {
        bunt::println!("{$green+intense}⮕  Everything OK{/$} \
            {$dimmed}(postgraph probably works in this environment){/$}");
        println!();
        Ok(())
    }
}

fn print_outcome<T>(any_errors: &mut bool, label: &str, result: &Result<T>) {
    match result {
        Ok(_) => {
            bunt::println!(" ▸ {[bold+intense]}  {$green+bold}✔ ok{/$}", label);
        }
        Err(e) => {
            *any_errors = true;
            bunt::println!(" ▸ {[bold+intense]}  {$red+bold}✘ error{/$}", label);
            bunt::println!("      {$red}▶▶▶ {$bold}Error:{/$}{/$} {[yellow+intense]}", e);
            if e.chain().len() > 1 {
                println!();
                bunt::println!("      {$red+italic}Caused by:{/$}");
            }

            for (i, cause) in e.chain().skip(1).enumerate() {
                print!("       {: >1$}", "", i * 2);
                println!("‣ {cause}");
            }
            println!();
        }
    }
}

fn check_referenced_files(config: &Config) -> Result<()> {
    config.db.check_server_cert()?;

    if let Some(path) = &config.log.file {
        // Only the directory has to exist, the file itself is created.
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = dir {
            if !dir.is_dir() {
                bail!("directory of log file '{}' does not exist", path.display());
            }
        }
    }

    Ok(())
}

/// Figures out which migrations `serve` would apply, without changing
/// anything.
async fn check_migrations(pool: &Pool) -> Result<MigrationPlan> {
    let mut conn = pool.get().await?;
    let tx = conn.transaction().await?;
    let plan = MigrationPlan::build(&tx).await?;
    tx.rollback().await?;
    Ok(plan)
}
