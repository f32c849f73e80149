/// Helper macro to pass arguments to `query_raw` and similar calls.
///
/// Helps you with casting to `&dyn ToSql` and type inference. Note: use `[]` for
/// the macro invocation, e.g. `dbargs![&id, &email]`.
macro_rules! dbargs {
    () => {
        [] as [&(dyn postgres_types::ToSql + Sync); 0]
    };
    ($($arg:expr),+ $(,)?) => {
        [$($arg as &(dyn postgres_types::ToSql + Sync)),+]
    };
}

pub(crate) use dbargs;


/// Quotes a name for use as an SQL identifier (e.g. a table or role name)
/// that cannot be passed as query parameter.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}


#[cfg(test)]
mod tests {
    use super::quote_ident;

    #[test]
    fn quoting() {
        assert_eq!(quote_ident("posts"), r#""posts""#);
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }
}
