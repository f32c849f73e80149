use deadpool_postgres::Pool;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue, text::encode},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::{Metric, Registry},
};

use crate::prelude::*;


struct MetricDesc {
    name: &'static str,
    help: &'static str,
}

const HTTP_REQUESTS: MetricDesc = MetricDesc {
    name: "http_requests",
    help: "Number of incoming HTTP requests",
};
const BUILD_INFO: MetricDesc = MetricDesc {
    name: "build_info",
    help: "Different information about the app",
};
const DB_POOL_SIZE: MetricDesc = MetricDesc {
    name: "db_pool_size",
    help: "Number of open connections in the database pool",
};
const DB_POOL_AVAILABLE: MetricDesc = MetricDesc {
    name: "db_pool_available",
    help: "Number of idle connections in the database pool",
};
const NUM_ITEMS: MetricDesc = MetricDesc {
    name: "num_items",
    help: "Number of different kinds of items in the DB",
};


pub(crate) struct Metrics {
    http_requests: Family<HttpReqLabels, Counter>,
}

impl Metrics {
    pub(crate) fn new() -> Self {
        Self {
            http_requests: <Family<HttpReqLabels, Counter>>::default(),
        }
    }

    pub(crate) fn register_http_req(&self, category: HttpReqCategory) {
        self.http_requests.get_or_create(&HttpReqLabels { category }).inc();
    }

    pub(crate) async fn gather_and_encode(&self, db_pool: &Pool) -> String {
        let mut reg = <Registry>::default();

        add_any(&mut reg, HTTP_REQUESTS, self.http_requests.clone());

        let info = <Family<Vec<(String, String)>, Gauge>>::default();
        info.get_or_create(&vec![
            ("version".into(), env!("CARGO_PKG_VERSION").into()),
        ]).set(1);
        add_any(&mut reg, BUILD_INFO, info);

        let status = db_pool.status();
        add_gauge(&mut reg, DB_POOL_SIZE, status.size as i64);
        add_gauge(&mut reg, DB_POOL_AVAILABLE, status.available as i64);

        // Information from the DB. If it's not reachable, these are just
        // missing from the output.
        match db_pool.get().await {
            Ok(db) => {
                let item_count = <Family<ItemLabels, Gauge>>::default();
                let items = [
                    (ItemKind::Users, "users"),
                    (ItemKind::Posts, "posts"),
                    (ItemKind::Comments, "comments"),
                ];
                for (kind, table) in items {
                    let query = format!("select count(*) from {table}");
                    if let Ok(row) = db.query_one(&query, &[]).await {
                        item_count.get_or_create(&ItemLabels { item: kind }).set(row.get::<_, i64>(0));
                    }
                }
                add_any(&mut reg, NUM_ITEMS, item_count);
            }
            Err(e) => debug!("Skipping DB metrics, no connection: {e}"),
        }

        let mut out = String::new();
        if let Err(e) = encode(&mut out, &reg) {
            error!("Failed to encode Prometheus metrics: {e}");
        }
        out
    }
}

fn add_any(reg: &mut Registry, metric: MetricDesc, value: impl Metric) {
    reg.register(format!("postgraph_{}", metric.name), metric.help, value);
}

fn add_gauge(reg: &mut Registry, metric: MetricDesc, value: i64) {
    let gauge = <Gauge>::default();
    gauge.set(value);
    add_any(reg, metric, gauge);
}


#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct HttpReqLabels {
    category: HttpReqCategory,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EncodeLabelValue)]
pub(crate) enum HttpReqCategory {
    /// `GET /`
    Health,
    /// `GET|POST /graphql`
    GraphQL,
    /// The GraphQL explorer
    Explorer,
    /// `GET /~metrics`
    Metrics,
    /// Everything else
    Other,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ItemLabels {
    item: ItemKind,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EncodeLabelValue)]
enum ItemKind {
    Users,
    Posts,
    Comments,
}


#[cfg(test)]
mod tests {
    use confique::Config as _;

    use crate::db::{self, DbConfig};
    use super::{HttpReqCategory, Metrics};

    #[tokio::test]
    async fn encodes_request_counters_without_db() {
        let mut config = DbConfig::builder().load().unwrap();
        config.port = 1;
        let pool = db::build_pool(&config).unwrap();

        let metrics = Metrics::new();
        metrics.register_http_req(HttpReqCategory::GraphQL);
        metrics.register_http_req(HttpReqCategory::GraphQL);
        metrics.register_http_req(HttpReqCategory::Health);

        let out = metrics.gather_and_encode(&pool).await;
        assert!(out.contains(r#"postgraph_http_requests_total{category="GraphQL"} 2"#), "{out}");
        assert!(out.contains(r#"postgraph_http_requests_total{category="Health"} 1"#), "{out}");
        assert!(out.contains("postgraph_db_pool_size 0"), "{out}");
        assert!(!out.contains("postgraph_num_items"), "{out}");
    }
}
