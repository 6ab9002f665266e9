use callisto::group::{FnGetter, Group, GroupRegistry};
use callisto::http::HttpPool;
use callisto::server::Server;
use callisto::{config, fmt, signals, spawn, CALLISTO_REVISION, CALLISTO_VERSION};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    callisto::init_logging();
    log::info!(
        "||. CALLISTO (v {} - rev {}) running on {} core(s) in {} CPU(s)",
        CALLISTO_VERSION,
        CALLISTO_REVISION,
        num_cpus::get(),
        num_cpus::get_physical()
    );

    let settings = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/settings.yml".to_owned());
    let config = config::install(&settings, true).await;
    let handle = config.current();

    // The "slow database" backing the demo cache...
    let mut db = HashMap::new();
    let _ = db.insert("Tom", "630");
    let _ = db.insert("Jack", "589");
    let _ = db.insert("Sam", "567");

    let max_memory = handle.config()["cache"]["max_memory"]
        .as_str()
        .and_then(|size| fmt::parse_size(size).ok())
        .unwrap_or(2 << 10);

    let registry = GroupRegistry::new();
    let group = registry.create(
        "scores",
        max_memory,
        Arc::new(FnGetter::new(move |key| {
            log::info!("[SlowDB] search key {}...", key);
            db.get(key)
                .map(|value| value.as_bytes().to_vec())
                .ok_or_else(|| anyhow::anyhow!("{} not exist", key))
        })),
    );

    if let Some(self_address) = handle.config()["cluster"]["self"].as_str() {
        let nodes: Vec<String> = handle.config()["cluster"]["nodes"]
            .as_vec()
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|node| node.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        let pool = HttpPool::new(self_address);
        pool.set(&nodes);
        group.register_nodes(pool);
    }

    if let Some(port) = handle.config()["api"]["port"].as_i64() {
        start_api_server(port as u16, group.clone());
    }

    let server = Server::new(config, registry);
    signals::install(server.clone());
    server.event_loop().await;

    log::info!("{}", group.stats());
}

/// Serves the client facing endpoint: `GET /api?key=...` yields the cached value.
fn start_api_server(port: u16, group: Arc<Group>) {
    spawn!(async move {
        let address = SocketAddr::from(([127, 0, 0, 1], port));
        let make_svc = make_service_fn(move |_conn| {
            let group = group.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request: Request<Body>| {
                    let group = group.clone();
                    async move {
                        let key = request
                            .uri()
                            .query()
                            .and_then(|query| {
                                query.split('&').find_map(|part| part.strip_prefix("key="))
                            })
                            .map(|key| urlencoding::decode(key).unwrap_or_default().into_owned())
                            .unwrap_or_default();

                        let mut response = match group.get(&key).await {
                            Ok(view) => Response::new(Body::from(view.to_vec())),
                            Err(error) => {
                                let mut response = Response::new(Body::from(error.to_string()));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                response
                            }
                        };
                        let _ = response.headers_mut().insert(
                            hyper::header::CONTENT_TYPE,
                            hyper::header::HeaderValue::from_static("application/octet-stream"),
                        );

                        Ok::<_, Infallible>(response)
                    }
                }))
            }
        });

        log::info!("API server is running on port {}...", port);
        if let Err(error) = hyper::server::Server::bind(&address).serve(make_svc).await {
            log::error!("The API server failed: {}", error);
        }
    });
}
