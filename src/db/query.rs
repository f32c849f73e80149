use tokio_postgres::GenericClient;

use crate::prelude::*;
use super::util::quote_ident;


/// Returns the names of all tables in the `public` schema, sorted.
pub(super) async fn all_table_names(db: &impl GenericClient) -> Result<Vec<String>> {
    let rows = db.query_raw(
            "select table_name::text from information_schema.tables \
                where table_schema = 'public' and table_type = 'BASE TABLE' \
                order by table_name",
            dbargs![],
        )
        .await?
        .map_ok(|row| row.get::<_, String>(0));

    Ok(rows.try_collect().await?)
}

/// Checks if a table with the name `table_name` exists in the public schema.
pub(super) async fn does_table_exist(db: &impl GenericClient, table_name: &str) -> Result<bool> {
    let row = db.query_one(
        "select exists(
            select * from information_schema.tables
                where table_schema = 'public' and table_name = $1
        )",
        &[&table_name],
    ).await?;

    Ok(row.get::<_, bool>(0))
}

/// Returns the number of rows in the given table.
pub(super) async fn count_rows(db: &impl GenericClient, table_name: &str) -> Result<i64> {
    let query = format!("select count(*) from {}", quote_ident(table_name));
    let row = db.query_one(&query, &[]).await?;
    Ok(row.get::<_, i64>(0))
}
