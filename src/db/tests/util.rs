use deadpool_postgres::{Manager, Pool};
use std::str::FromStr;
use tokio_postgres::{Client, NoTls};

use crate::{
    api::model::{PostCreateInput, UserCreateInput, post::Post, user::User},
    db::Db,
    prelude::*,
};


/// Connection URL of a database the tests may use to create temporary
/// databases.
const URL_ENV: &str = "POSTGRAPH_TEST_DATABASE_URL";

async fn conn(config: &tokio_postgres::Config) -> Result<Client> {
    let (client, connection) = config.connect(NoTls).await
        .context("could not connect to DB in test")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            panic!("PG connection error: {e}");
        }
    });

    Ok(client)
}

/// A temporary DB used for a single unit test. Is removed on drop.
///
/// Be sure to use the multi threaded Tokio runtime or else `drop` will
/// panic!
pub(super) struct TestDb {
    pool: Pool,
    controller: Client,
    db_name: String,
}

impl TestDb {
    /// Creates a new temporary database with all migrations applied.
    pub(super) async fn new() -> Result<Self> {
        let url = std::env::var(URL_ENV)
            .with_context(|| format!("`{URL_ENV}` has to be set for DB tests"))?;
        let mut pg_config = tokio_postgres::Config::from_str(&url)
            .with_context(|| format!("invalid `{URL_ENV}`"))?;
        pg_config.application_name("postgraph DB tests");

        // Create connection to original database and create a new temporary one.
        let controller = conn(&pg_config).await?;
        let db_name = format!("postgraph_test_{}", rand::random::<u64>());
        controller.execute(&format!("create database {db_name}"), &[]).await
            .context("failed to create temporary test DB")?;

        pg_config.dbname(&db_name);
        let manager = Manager::new(pg_config, NoTls);
        let pool = Pool::builder(manager).max_size(4).build()
            .context("failed to build test pool")?;

        let out = Self { pool, controller, db_name };
        crate::db::migrate(&mut *out.pool.get().await?).await
            .context("failed to run migrations on test DB")?;

        Ok(out)
    }

    pub(super) fn pool(&self) -> &Pool {
        &self.pool
    }

    /// A fresh connection, like the one of an API request.
    pub(super) async fn db(&self) -> Result<Db> {
        Ok(Db::new(self.pool.get().await?))
    }

    pub(super) async fn add_user(&self, email: &str, posts: &[(&str, bool)]) -> Result<(User, Vec<Post>)> {
        let db = self.db().await?;
        let user = User::create(&db, UserCreateInput {
            email: email.into(),
            name: None,
            posts: None,
        }).await?;

        let mut out = Vec::new();
        for (title, published) in posts {
            let post = Post::create_draft(&db, PostCreateInput {
                title: (*title).into(),
                content: Some(format!("Content of {title}")),
            }, email).await?;
            let post = Post::set_published(&db, post.id, Some(*published)).await?;
            out.push(post);
        }

        Ok((user, out))
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        // There is no "async drop", so we block this worker thread. All pooled
        // connections have to be closed before the database can be dropped.
        self.pool.close();
        let query = format!("drop database {} with (force)", self.db_name);
        let controller = &self.controller;
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async {
                if let Err(e) = controller.execute(&query, &[]).await {
                    eprintln!("failed to drop temporary test DB: {e}");
                }
            });
        });
    }
}
