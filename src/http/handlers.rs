use bytes::Bytes;
use hyper::{Method, StatusCode, body::Body, header::HeaderValue};
use std::sync::Arc;
use tracing::Instrument;

use crate::{
    api::RequestMeta,
    metrics::HttpReqCategory,
    prelude::*,
    telemetry,
};
use super::{Context, Request, Response, graphql, log, response};


const REQUEST_ID_HEADER: &str = "x-request-id";

/// This is the main HTTP entry point, called for each incoming request.
pub(super) async fn handle<B>(req: Request<B>, ctx: Arc<Context>) -> Response
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let meta = RequestMeta {
        path: req.uri().path().to_owned(),
        request_id: ctx.next_request_id(),
    };
    let otel_name = format!("{} {}", req.method(), meta.path);
    let span = tracing::info_span!(
        "http_request",
        otel.name = %otel_name,
        http.method = %req.method(),
        http.path = %meta.path,
        request_id = %meta.request_id,
    );
    telemetry::set_remote_parent(&span, req.headers());

    let route = route(req, &ctx, meta.clone()).instrument(span);
    let mut response = ctx.reporter.bind(&meta, route).await;
    if let Ok(value) = HeaderValue::from_str(&meta.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn route<B>(req: Request<B>, ctx: &Context, meta: RequestMeta) -> Response
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    log::req::log(&req);
    if ctx.config.log.log_http_headers {
        log::headers::log(&req);
    }

    let method = req.method().clone();
    let path = match req.uri().path().trim_end_matches('/') {
        "" => "/",
        p => p,
    }.to_owned();
    let is_explorer = path == ctx.config.http.explorer_path.trim_end_matches('/')
        || path == "/graphiql";

    match path.as_str() {
        // The GraphQL endpoint. This is the only path for which POST is
        // allowed.
        "/graphql" if method == Method::GET || method == Method::POST => {
            ctx.metrics.register_http_req(HttpReqCategory::GraphQL);
            graphql::handle(req, ctx, meta).await
        }

        // From this point on, we only support GET and HEAD requests.
        _ if method != Method::GET && method != Method::HEAD => {
            ctx.metrics.register_http_req(HttpReqCategory::Other);
            response::method_not_allowed()
        }

        // Health check. This does not touch the database so that the process
        // is considered alive even if the DB is temporarily unreachable.
        "/" => {
            ctx.metrics.register_http_req(HttpReqCategory::Health);
            response::json(StatusCode::OK, r#"{"up":true}"#)
        }

        // The interactive GraphQL API explorer/IDE. It does not expose any
        // information that isn't already exposed by the API itself.
        _ if is_explorer => {
            ctx.metrics.register_http_req(HttpReqCategory::Explorer);
            response::html(juniper::http::graphiql::graphiql_source("/graphql", None))
        }

        "/~metrics" => {
            ctx.metrics.register_http_req(HttpReqCategory::Metrics);
            let out = ctx.metrics.gather_and_encode(&ctx.db_pool).await;
            Response::builder()
                .header(hyper::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
                .body(http_body_util::Full::new(Bytes::from(out)))
                .unwrap()
        }

        _ => {
            ctx.metrics.register_http_req(HttpReqCategory::Other);
            debug!("Responding with 404 to {:?} '{}'", method, path);
            response::not_found()
        }
    }
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::{Request, StatusCode, header::CONTENT_TYPE};
    use std::sync::Arc;

    use super::{super::{Context, Response, tests::test_context}, handle};

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::get(path).body(Full::new(Bytes::new())).unwrap()
    }

    fn post_json(path: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::post(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn send(ctx: &Arc<Context>, req: Request<Full<Bytes>>) -> Response {
        handle(req, Arc::clone(ctx)).await
    }

    #[tokio::test]
    async fn health_check() {
        let ctx = test_context();
        let response = send(&ctx, get("/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-request-id"], "req-1");
        let body = body_string(response).await;
        assert_eq!(body, r#"{"up":true}"#);
        assert_eq!(serde_json::from_str::<serde_json::Value>(&body).unwrap()["up"], true);
    }

    #[tokio::test]
    async fn unknown_routes_and_methods() {
        let ctx = test_context();
        assert_eq!(send(&ctx, get("/nope")).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(send(&ctx, post_json("/", "{}")).await.status(), StatusCode::METHOD_NOT_ALLOWED);

        let delete = Request::delete("/graphql").body(Full::new(Bytes::new())).unwrap();
        let response = send(&ctx, delete).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()["x-request-id"], "req-3");
    }

    #[tokio::test]
    async fn explorer_routes() {
        let ctx = test_context();
        for path in ["/altair", "/altair/", "/graphiql"] {
            let response = send(&ctx, get(path)).await;
            assert_eq!(response.status(), StatusCode::OK, "{path}");
            assert!(body_string(response).await.contains("/graphql"));
        }
    }

    #[tokio::test]
    async fn malformed_graphql_requests() {
        let ctx = test_context();
        let response = send(&ctx, post_json("/graphql", "{ nope")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&ctx, post_json("/graphql", "[]")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&ctx, get("/graphql")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn validation_errors_are_400() {
        let ctx = test_context();
        let response = send(&ctx, post_json("/graphql", r#"{ "query": "{ nope }" }"#)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert!(body["errors"].as_array().is_some_and(|e| !e.is_empty()));
    }

    #[tokio::test]
    async fn mutations_need_post() {
        let ctx = test_context();
        let response = send(&ctx, get("/graphql?query=mutation%7BdeletePost(id%3A1)%7Bid%7D%7D")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn unavailable_db_is_503() {
        let ctx = test_context();
        let response = send(&ctx, post_json("/graphql", r#"{ "query": "{ allUsers { id } }" }"#)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["errors"][0]["extensions"]["key"], "db.unavailable");
    }

    #[tokio::test]
    async fn batches_without_db_access() {
        let ctx = test_context();
        let response = send(&ctx, post_json(
            "/graphql",
            r#"[{ "query": "{ __typename }" }, { "query": "query Q { __typename }" }]"#,
        )).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body[0]["data"]["__typename"], "Query");
        assert_eq!(body[1]["data"]["__typename"], "Query");
    }

    #[tokio::test]
    async fn metrics_count_requests() {
        let ctx = test_context();
        send(&ctx, get("/")).await;
        send(&ctx, get("/nope")).await;

        let response = send(&ctx, get("/~metrics")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains(r#"postgraph_http_requests_total{category="Health"} 1"#), "{body}");
        assert!(body.contains(r#"postgraph_http_requests_total{category="Other"} 1"#), "{body}");
    }
}
