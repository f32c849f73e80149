//! GraphQL over HTTP: reading requests, executing them and building the
//! response.

use bytes::Bytes;
use http_body_util::{BodyExt, Limited, LengthLimitError};
use hyper::{Method, StatusCode, body::Body, header::CONTENT_TYPE};
use juniper::{
    Definition, InputValue, OperationType,
    http::{GraphQLBatchRequest, GraphQLBatchResponse, GraphQLRequest, GraphQLResponse},
    parser::parse_document_source,
};
use std::time::Instant;
use tracing::Instrument;

use crate::{api, prelude::*, telemetry};
use super::{Context, Request, Response, response};


/// Handles a request to `/graphql`.
pub(super) async fn handle<B>(req: Request<B>, ctx: &Context, meta: api::RequestMeta) -> Response
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let before = Instant::now();
    let method = req.method().clone();

    let batch = match parse_request(req, ctx.config.http.max_body_size).await {
        Ok(batch) => batch,
        Err(response) => return response,
    };

    // Mutations over GET could be triggered by simple links.
    if method != Method::POST && requests(&batch).iter().any(|r| {
        operation(r, &ctx.api_root).is_some_and(|(kind, _)| kind == OperationType::Mutation)
    }) {
        return response::plain(StatusCode::METHOD_NOT_ALLOWED, "mutations can only be sent via POST");
    }

    let api_context = api::Context::new(ctx.db_pool.clone(), meta, ctx.reporter.clone());
    let out = execute(&batch, &ctx.api_root, &api_context).await;
    let status = if api_context.db_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else if out.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };

    let out = match serde_json::to_value(&out) {
        Ok(out) => out,
        Err(e) => {
            error!("Failed to serialize GraphQL response: {e}");
            return response::internal_server_error();
        }
    };
    for msg in telemetry::internal_errors(&out) {
        ctx.reporter.report(msg);
    }
    if api_context.db_unavailable() {
        ctx.reporter.report("GraphQL request failed: database unavailable");
    }

    debug!(
        "Finished GraphQL request with status {} in {:.2?} (with {} SQL queries)",
        status.as_u16(),
        before.elapsed(),
        api_context.num_queries(),
    );

    response::json(status, out.to_string())
}

/// Executes all requests of the batch one after another, as they share the
/// DB connection of `ctx`.
async fn execute(
    batch: &GraphQLBatchRequest,
    root: &api::RootNode,
    ctx: &api::Context,
) -> GraphQLBatchResponse {
    match batch {
        GraphQLBatchRequest::Single(request) => {
            GraphQLBatchResponse::Single(execute_one(request, root, ctx).await)
        }
        GraphQLBatchRequest::Batch(requests) => {
            let mut responses = Vec::with_capacity(requests.len());
            for request in requests {
                responses.push(execute_one(request, root, ctx).await);
            }
            GraphQLBatchResponse::Batch(responses)
        }
    }
}

/// Executes a single request inside a `graphql` span named after the
/// operation.
async fn execute_one(
    request: &GraphQLRequest,
    root: &api::RootNode,
    ctx: &api::Context,
) -> GraphQLResponse {
    let op = operation(request, root);
    let kind = op.map_or("unknown", |(kind, _)| kind_str(kind));
    let name = op.and_then(|(_, name)| name);
    let span_name = match name {
        Some(name) => format!("{kind} {name}"),
        None => kind.to_owned(),
    };
    let span = tracing::info_span!(
        "graphql",
        otel.name = %span_name,
        graphql.operation.type = kind,
        graphql.operation.name = name,
    );

    request.execute(root, ctx).instrument(span).await
}

fn requests(batch: &GraphQLBatchRequest) -> &[GraphQLRequest] {
    match batch {
        GraphQLBatchRequest::Single(request) => std::slice::from_ref(request),
        GraphQLBatchRequest::Batch(requests) => requests,
    }
}

/// Type and name of the operation `request` selects. `None` if the document
/// does not parse or contains no such operation. Execution reports these
/// problems to the client.
fn operation<'a>(
    request: &'a GraphQLRequest,
    root: &api::RootNode,
) -> Option<(OperationType, Option<&'a str>)> {
    let document = parse_document_source(&request.query, &root.schema).ok()?;
    document.into_iter()
        .filter_map(|def| match def {
            Definition::Operation(op) => Some(op.item),
            Definition::Fragment(_) => None,
        })
        .find(|op| match request.operation_name.as_deref() {
            Some(wanted) => op.name.as_ref().is_some_and(|name| name.item == wanted),
            None => true,
        })
        .map(|op| (op.operation_type, op.name.map(|name| name.item)))
}

fn kind_str(kind: OperationType) -> &'static str {
    match kind {
        OperationType::Query => "query",
        OperationType::Mutation => "mutation",
        OperationType::Subscription => "subscription",
    }
}


// ===== Parsing ==================================================================================

async fn parse_request<B>(req: Request<B>, max_body_size: usize) -> Result<GraphQLBatchRequest, Response>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() == Method::GET {
        return parse_get(req.uri().query()).map_err(|e| response::bad_request(Some(&e)));
    }

    let content_type = req.headers().get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_owned());
    let body = match Limited::new(req.into_body(), max_body_size).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => return Err(response::payload_too_large()),
        Err(e) => {
            warn!("Failed to read request body: {e}");
            return Err(response::bad_request(None));
        }
    };

    parse_post(content_type.as_deref(), &body).map_err(|e| response::bad_request(Some(&e)))
}

fn parse_get(query_string: Option<&str>) -> Result<GraphQLBatchRequest, String> {
    let mut query = None;
    let mut operation_name = None;
    let mut variables = None;
    for (key, value) in form_urlencoded::parse(query_string.unwrap_or("").as_bytes()) {
        match &*key {
            "query" => query = Some(value.into_owned()),
            "operationName" => operation_name = Some(value.into_owned()),
            "variables" => {
                variables = serde_json::from_str::<Option<InputValue>>(&value)
                    .map_err(|e| format!("invalid 'variables' parameter: {e}"))?;
            }
            _ => {}
        }
    }

    let query = query.ok_or_else(|| "missing 'query' parameter".to_owned())?;
    Ok(GraphQLBatchRequest::Single(GraphQLRequest::new(query, operation_name, variables)))
}

fn parse_post(content_type: Option<&str>, body: &[u8]) -> Result<GraphQLBatchRequest, String> {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|s| s.trim().to_ascii_lowercase());

    match mime.as_deref() {
        Some("application/graphql") => {
            let query = std::str::from_utf8(body)
                .map_err(|_| "request body is not valid UTF-8".to_owned())?;
            Ok(GraphQLBatchRequest::Single(GraphQLRequest::new(query.to_owned(), None, None)))
        }
        None | Some("application/json") => serde_json::from_slice(body)
            .map_err(|e| format!("invalid GraphQL request: {e}")),
        Some(other) => Err(format!("unsupported content type '{other}'")),
    }
}
