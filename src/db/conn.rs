use std::sync::atomic::{AtomicU32, Ordering};
use postgres_types::{BorrowToSql, ToSql};
use tokio_postgres::{Error, Row, RowStream};

use crate::prelude::*;
use super::DbConnection;


/// A database connection checked out for one API request. Every resolver gets
/// access to it through the API context.
pub(crate) struct Db {
    inner: DbConnection,
    num_queries: AtomicU32,
}

impl Db {
    pub(crate) fn new(inner: DbConnection) -> Self {
        Self { inner, num_queries: AtomicU32::new(0) }
    }

    pub(crate) fn num_queries(&self) -> u32 {
        self.num_queries.load(Ordering::Relaxed)
    }

    fn increase_num_queries(&self) {
        self.num_queries.fetch_add(1, Ordering::Relaxed);
    }

    // The following methods shadow the ones from the pooled client and
    // automatically use the statement cache of that connection. Our queries
    // are all static strings (or built from a small set of fragments), so the
    // cache stays small.

    pub(crate) async fn query_one(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, Error> {
        trace!("Executing SQL query: \"{}\" with {:?}", query, params);
        let statement = self.inner.prepare_cached(query).await?;
        self.increase_num_queries();
        self.inner.query_one(&statement, params).await
    }

    pub(crate) async fn query_opt(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, Error> {
        trace!("Executing SQL query: \"{}\" with {:?}", query, params);
        let statement = self.inner.prepare_cached(query).await?;
        self.increase_num_queries();
        self.inner.query_opt(&statement, params).await
    }

    pub(crate) async fn query_raw<P, I>(&self, query: &str, params: I) -> Result<RowStream, Error>
    where
        P: BorrowToSql,
        I: IntoIterator<Item = P> + std::fmt::Debug,
        I::IntoIter: ExactSizeIterator,
    {
        trace!("Executing SQL query: \"{}\" with {:?}", query, params);
        let statement = self.inner.prepare_cached(query).await?;
        self.increase_num_queries();
        self.inner.query_raw(&statement, params).await
    }

    /// Runs the query and collects all rows, converted with `f`.
    pub(crate) async fn query_mapped<P, I, T>(
        &self,
        query: &str,
        params: I,
        f: impl FnMut(Row) -> T,
    ) -> Result<Vec<T>, Error>
    where
        P: BorrowToSql,
        I: IntoIterator<Item = P> + std::fmt::Debug,
        I::IntoIter: ExactSizeIterator,
    {
        self.query_raw(query, params).await?
            .map_ok(f)
            .try_collect()
            .await
    }
}
