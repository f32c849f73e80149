//! API error handling.
//!
//! We define our own error to use for all resolvers. It has `From` impls to be
//! created from other common errors that occur (e.g. DB errors). This module
//! also offers a couple macros to easily create an error.
//!
//! Clients get the message as is, a coarse "error kind" in the `extensions`
//! of each GraphQL error and optionally a "key" that identifies the exact
//! error case. The kind prefix is only part of the `Display` output, which
//! we use for logs and error reports.

use juniper::{FieldError, IntoFieldError, ScalarValue, graphql_value};

use crate::prelude::*;


pub(crate) type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub(crate) struct ApiError {
    pub(crate) msg: String,
    pub(crate) kind: ApiErrorKind,
    pub(crate) key: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApiErrorKind {
    /// The arguments passed to an endpoint are invalid somehow.
    InvalidInput,

    /// A record that the operation needs does not exist.
    NotFound,

    /// Some server error out of control of the API user.
    InternalServerError,
}

impl ApiErrorKind {
    pub(crate) const INTERNAL_SERVER_ERROR: &'static str = "INTERNAL_SERVER_ERROR";

    pub(crate) fn kind_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::NotFound => "NOT_FOUND",
            Self::InternalServerError => Self::INTERNAL_SERVER_ERROR,
        }
    }

    fn message_prefix(&self) -> &str {
        match self {
            Self::InvalidInput => "Invalid input",
            Self::NotFound => "Not found",
            Self::InternalServerError => "Internal server error",
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.message_prefix(), self.msg)
    }
}

impl std::error::Error for ApiError {}

impl From<tokio_postgres::Error> for ApiError {
    fn from(src: tokio_postgres::Error) -> Self {
        // This is the last place where we have the full error at hand, so we
        // log it here. The client only gets a short message.
        error!("DB Error when executing query: {src}");
        debug!("Detailed error: {src:#?}");

        Self {
            msg: "database operation failed".into(),
            kind: ApiErrorKind::InternalServerError,
            key: None,
        }
    }
}

impl From<deadpool_postgres::PoolError> for ApiError {
    fn from(src: deadpool_postgres::PoolError) -> Self {
        error!("Failed to obtain DB connection for API request: {src}");
        Self {
            msg: "database unavailable".into(),
            kind: ApiErrorKind::InternalServerError,
            key: Some("db.unavailable"),
        }
    }
}

impl<S: ScalarValue> IntoFieldError<S> for ApiError {
    fn into_field_error(self) -> FieldError<S> {
        let ext = if let Some(key) = self.key {
            graphql_value!({
                "kind": (self.kind.kind_str()),
                "key": key,
            })
        } else {
            graphql_value!({
                "kind": (self.kind.kind_str()),
            })
        };

        FieldError::new(self.msg, ext)
    }
}


// ===== Helper macros to easily create errors ==================================================

/// Creates an `ApiError` with a `format!` like syntax.
macro_rules! api_err {
    ($kind:ident, key = $key:literal, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::api::err::ApiError {
            msg: format!($fmt $(, $arg)*),
            kind: $crate::api::err::ApiErrorKind::$kind,
            key: Some($key.into()),
        }
    };
    ($kind:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::api::err::ApiError {
            msg: format!($fmt $(, $arg)*),
            kind: $crate::api::err::ApiErrorKind::$kind,
            key: None,
        }
    };
}

macro_rules! invalid_input {
    ($($t:tt)+) => { $crate::api::err::api_err!(InvalidInput, $($t)*) };
}

macro_rules! not_found {
    ($($t:tt)+) => { $crate::api::err::api_err!(NotFound, $($t)*) };
}

macro_rules! internal_server_error {
    ($($t:tt)+) => { $crate::api::err::api_err!(InternalServerError, $($t)*) };
}

pub(crate) use api_err;
pub(crate) use internal_server_error;
pub(crate) use invalid_input;
pub(crate) use not_found;


// ===== Helper macro to inspect DbError ==================================================

/// Helps you map some special DB errors to specific API errors (instead of a
/// generic "internal server error"). Usage:
///
/// ```ignore
/// // `result` needs to be `Result<T, tokio_postgres::error::Error>`.
/// map_db_err!(result, {
///     if constraint == "users_email_unique" => invalid_input!("email taken"),
///     if /* field */ == /* value */ => /* expression returning ApiError */,
///     // ...
/// })
/// ```
///
/// The macro returns `Result<T, ApiError>`.
macro_rules! map_db_err {
    ($result:expr, { $(
        if $field:ident == $value:expr => $then:expr
    ),* $(,)? }) => {
        match $result {
            Ok(v) => Ok(v),
            Err(e) => {
                if let Some(db_error) = e.as_db_error() {
                    let new_err: $crate::api::err::ApiError = if false { unreachable!() }
                    $(
                        else if db_error.$field()
                            == $crate::api::err::map_db_err!(@wrap $field $value)
                        { $then.into() }
                    )*
                    else { e.into() };
                    Err(new_err)
                } else {
                    Err(e.into())
                }
            }
        }
    };
    (@wrap constraint $value:expr) => { Some($value) };
    (@wrap code $value:expr) => { &$value };
}

pub(crate) use map_db_err;


#[cfg(test)]
mod tests {
    use juniper::{DefaultScalarValue, IntoFieldError, graphql_value};

    use super::ApiError;

    fn field_error(e: ApiError) -> juniper::FieldError<DefaultScalarValue> {
        e.into_field_error()
    }

    #[test]
    fn extensions_contain_kind() {
        let e = field_error(not_found!("no user with email '{}'", "a@b.c"));
        assert_eq!(e.message(), "no user with email 'a@b.c'");
        assert_eq!(e.extensions(), &graphql_value!({ "kind": "NOT_FOUND" }));
    }

    #[test]
    fn extensions_contain_key_if_set() {
        let e = field_error(invalid_input!(key = "feed.negative-take", "`take` is negative"));
        assert_eq!(e.message(), "`take` is negative");
        assert_eq!(e.extensions(), &graphql_value!({
            "kind": "INVALID_INPUT",
            "key": "feed.negative-take",
        }));
    }

    #[test]
    fn display_has_kind_prefix() {
        let e = internal_server_error!("database operation failed");
        assert_eq!(e.to_string(), "Internal server error: database operation failed");
        assert_eq!(field_error(e).message(), "database operation failed");
    }
}
