use std::sync::atomic::{AtomicBool, Ordering};
use deadpool_postgres::Pool;
use tokio::sync::OnceCell;

use crate::{
    api::err::ApiResult,
    db::{self, Db},
    prelude::*,
    telemetry::ErrorReporter,
};


/// Information about the HTTP request an API call belongs to.
#[derive(Debug, Clone)]
pub(crate) struct RequestMeta {
    pub(crate) path: String,
    pub(crate) request_id: String,
}

/// The context that is accessible to every resolver in our API.
pub(crate) struct Context {
    pool: Pool,
    db: OnceCell<Db>,
    db_unavailable: AtomicBool,
    pub(crate) meta: RequestMeta,
    pub(crate) reporter: ErrorReporter,
}

impl juniper::Context for Context {}

impl Context {
    pub(crate) fn new(pool: Pool, meta: RequestMeta, reporter: ErrorReporter) -> Self {
        Self {
            pool,
            db: OnceCell::new(),
            db_unavailable: AtomicBool::new(false),
            meta,
            reporter,
        }
    }

    /// Returns the DB connection of this request. It is checked out of the
    /// pool on first use, so requests that never reach a resolver don't
    /// occupy a connection.
    pub(crate) async fn db(&self) -> ApiResult<&Db> {
        self.db.get_or_try_init(|| async {
            match db::get_conn(&self.pool).await {
                Ok(conn) => Ok(Db::new(conn)),
                Err(e) => {
                    warn!(request_id = %self.meta.request_id, "No DB connection for API request");
                    self.db_unavailable.store(true, Ordering::Relaxed);
                    Err(e.into())
                }
            }
        }).await
    }

    /// Number of SQL queries executed for this request so far.
    pub(crate) fn num_queries(&self) -> u32 {
        self.db.get().map_or(0, Db::num_queries)
    }

    /// Whether a resolver failed to get a DB connection.
    pub(crate) fn db_unavailable(&self) -> bool {
        self.db_unavailable.load(Ordering::Relaxed)
    }
}
