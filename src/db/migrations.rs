use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::{collections::BTreeMap, time::Duration, num::NonZeroU64};
use tokio_postgres::{Client, IsolationLevel, Transaction, error::SqlState};

use crate::prelude::*;


/// Describes the actions needed to bring the database into a state that we
/// expect.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MigrationPlan {
    /// The database is completely empty: we need to create the meta table and
    /// apply all migrations.
    EmptyDb,

    /// The database is completely up to date and all migrations match.
    UpToDate,

    /// The DB can be migrated to the state we expect by applying that many new
    /// migrations.
    Migrate {
        new_migrations: NonZeroU64,
    },
}

impl MigrationPlan {
    /// Builds a migration plan by querying the current state of the DB. If the
    /// DB is in a state that we cannot fix, `Err` is returned. Does not modify
    /// the DB.
    pub(crate) async fn build(tx: &Transaction<'_>) -> Result<Self> {
        if !super::query::does_table_exist(tx, "__db_migrations").await? {
            // Other tables without the meta table means somebody else owns
            // this database. We don't touch it then.
            let tables = super::query::all_table_names(tx).await?;
            if !tables.is_empty() {
                bail!(
                    "migration table '__db_migrations' does not exist, but some other \
                        tables ({}) do exist. Is this the correct database?",
                    tables.join(", "),
                );
            }

            return Ok(Self::EmptyDb);
        }

        #[derive(Debug)]
        struct AppliedMigration {
            name: String,
            applied_on: DateTime<Utc>,
            script: String,
        }

        debug!("Checking DB migrations");
        let applied = tx
            .query_raw("select id, name, applied_on, script from __db_migrations", dbargs![])
            .await
            .context("failed to query meta migrations table")?
            .map_ok(|row| (
                row.get::<_, i64>("id") as u64,
                AppliedMigration {
                    name: row.get("name"),
                    applied_on: row.get("applied_on"),
                    script: row.get("script"),
                },
            ))
            .try_collect::<BTreeMap<_, _>>()
            .await?;

        if !applied.keys().copied().eq(1..applied.len() as u64 + 1) {
            bail!("The IDs of the applied migrations are not consecutive. This is unexpected.");
        }

        for (id, actual) in &applied {
            let expected = MIGRATIONS.get(id).ok_or_else(|| anyhow!(
                "The migration '{}-{}' is applied in the database (on {}), but no such \
                    migration is known to this postgraph binary. Is the binary outdated?",
                id,
                actual.name,
                actual.applied_on,
            ))?;

            if actual.script != expected.script {
                debug!("Expected script for '{}-{}':\n{}", id, expected.name, expected.script);
                debug!("Actual (in database) script for '{}-{}':\n{}", id, actual.name, actual.script);

                bail!(
                    "The script of applied migration '{}-{}' (applied on {}) does not match \
                        the expected script for that migration. This is unexpected.",
                    id,
                    actual.name,
                    actual.applied_on,
                );
            }
        }

        // Every applied migration is known, so `MIGRATIONS` is at least as
        // long as `applied`.
        match NonZeroU64::new(MIGRATIONS.len() as u64 - applied.len() as u64) {
            None => Ok(Self::UpToDate),
            Some(new_migrations) => Ok(Self::Migrate { new_migrations }),
        }
    }

    /// Executes this plan on the database, bringing it into the state we expect.
    pub(crate) async fn execute(&self, tx: &Transaction<'_>) -> Result<()> {
        let new_migrations = match self {
            Self::UpToDate => {
                info!("All migrations are already applied: database schema is up to date.");
                return Ok(());
            }
            Self::EmptyDb => {
                info!("Database is empty. Creating table '__db_migrations'...");
                tx.batch_execute(include_str!("db-migrations.sql"))
                    .await
                    .context("could not create migrations meta table")?;
                MIGRATIONS.len() as u64
            }
            Self::Migrate { new_migrations } => new_migrations.get(),
        };

        info!("The database is missing {new_migrations} migrations. Applying them now.");
        let first_new = MIGRATIONS.len() as u64 - new_migrations + 1;
        for (id, migration) in MIGRATIONS.range(first_new..) {
            debug!("Applying migration '{}-{}' ...", id, migration.name);
            trace!("Executing:\n{}", migration.script);

            tx.batch_execute(migration.script)
                .await
                .context(format!("failed to run script for '{}-{}'", id, migration.name))?;

            let query = "insert into __db_migrations (id, name, applied_on, script) \
                values ($1, $2, now(), $3)";
            tx.execute(query, &[&(*id as i64), &migration.name, &migration.script])
                .await
                .context("failed to update __db_migrations")?;
        }

        info!("Applied {new_migrations} migrations. DB is up to date now.");
        Ok(())
    }
}


/// Makes sure the database schema is up to date by checking the applied
/// migrations and applying all missing ones.
///
/// If anything unexpected is noticed, an error is returned to notify the user
/// they have to manually deal with it.
pub(crate) async fn migrate(db: &mut Client) -> Result<()> {
    // Everything runs in one serializable transaction so that only one
    // postgraph instance ever applies migrations. If two instances start at
    // the same time, the commit of one fails and it retries; in the second
    // iteration it sees the work of the other instance.
    loop {
        let tx = db.build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await?;

        let plan = MigrationPlan::build(&tx).await?;
        plan.execute(&tx).await?;

        match tx.commit().await {
            Ok(_) => return Ok(()),

            Err(e) if e.code() == Some(&SqlState::T_R_SERIALIZATION_FAILURE) => {
                let backoff_duration = Duration::from_millis(500);
                warn!(
                    "Database migration transaction failed to commit. This is likely because \
                    another postgraph instance ran the same transaction concurrently. \
                    Will try again in {:?}.",
                    backoff_duration,
                );

                tokio::time::sleep(backoff_duration).await;
            }

            Err(e) => return Err(e.into()),
        }
    }
}

// Includes the scripts from the `migrations` folder and adds them to a map.
// The checks in here would ideally be compile errors, but they run on first
// access and are covered by a unit test.
macro_rules! include_migrations {
    ( $( $id:literal : $name:literal ,)+ ) => {
        Lazy::new(|| {
            let mut m = BTreeMap::new();
            $(
                let prev = m.insert($id, Migration {
                    name: $name,
                    script: include_str!(
                        concat!("migrations/", stringify!($id), "-", $name, ".sql")
                    ),
                });

                assert!(prev.is_none(), "duplicate key in `include_migrations!`");
            )+

            if !m.keys().copied().eq(1..m.len() as u64 + 1) {
                panic!("migration IDs in `include_migrations!` are not consecutive");
            }

            m
        })
    };
}

#[derive(Debug)]
struct Migration {
    name: &'static str,
    script: &'static str,
}

static MIGRATIONS: Lazy<BTreeMap<u64, Migration>> = include_migrations![
    01: "users",
    02: "posts",
    03: "comments",
];


#[cfg(test)]
mod tests {
    use super::MIGRATIONS;

    #[test]
    fn registry_is_consistent() {
        assert_eq!(MIGRATIONS.len(), 3);
        assert!(MIGRATIONS.keys().copied().eq(1..=3));
        for m in MIGRATIONS.values() {
            assert!(m.script.contains("create table"), "'{}' creates no table", m.name);
        }
    }

    #[test]
    fn unique_email_constraint_has_expected_name() {
        // `signupUser` maps violations of this constraint to an input error.
        assert!(MIGRATIONS[&1].script.contains("constraint users_email_unique"));
    }
}
