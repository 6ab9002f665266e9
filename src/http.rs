//! Provides the reference HTTP transport of the peer protocol.
//!
//! The protocol is deliberately minimal: the complete value of the key **key** in the group
//! **group** is served under `GET {base_path}{group}/{key}` (both segments percent-encoded) as
//! raw bytes. There is no framing, no envelope and no content negotiation - any node (and any
//! human with *curl*) can fetch any value.
//!
//! This module contains the three parts of the transport:
//! * [HttpNodeClient](HttpNodeClient) - the outbound side, fetching values from one peer.
//! * [HttpPool](HttpPool) - the routing table: a consistent-hash [Ring](crate::ring::Ring) over
//!   all node addresses plus one client per remote peer.
//! * [handle](handle) - the inbound side, resolving a request against a
//!   [GroupRegistry](crate::group::GroupRegistry).
//!
//! # Status codes
//! The inbound handler answers with **200** and the raw value on success, **400** if the path
//! doesn't decompose into a group and a key, **404** if the named group isn't registered on
//! this node and **500** if the group could not produce the value (failed loader or failed
//! peer fetch).
use crate::group::GroupRegistry;
use crate::peers::{FetchError, NodeGetter, NodeSelector};
use crate::ring::Ring;
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Contains the path prefix under which every node exposes its peer endpoint.
///
/// All nodes of a cluster have to agree on this prefix, therefore it is simply a constant.
pub const DEFAULT_BASE_PATH: &str = "/_cache/";

/// Contains the number of virtual nodes placed on the ring per real node.
pub const DEFAULT_REPLICAS: usize = 50;

/// Fetches values from a single remote peer via HTTP.
///
/// This is the [NodeGetter](NodeGetter) half of the transport. Instances are created (and
/// owned) by an [HttpPool](HttpPool) - one per remote node address.
pub struct HttpNodeClient {
    base_url: String,
    client: Client<HttpConnector>,
}

impl HttpNodeClient {
    fn new(node: &str, base_path: &str) -> Self {
        HttpNodeClient {
            base_url: format!("{}{}", node, base_path),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl NodeGetter for HttpNodeClient {
    async fn fetch(&self, group: &str, key: &str) -> Result<Vec<u8>, FetchError> {
        let url = format!(
            "{}{}/{}",
            self.base_url,
            urlencoding::encode(group),
            urlencoding::encode(key)
        );
        let uri = url.parse::<Uri>().map_err(FetchError::InvalidUrl)?;

        let response = self
            .client
            .get(uri)
            .await
            .map_err(FetchError::Unreachable)?;

        if response.status() != StatusCode::OK {
            return Err(FetchError::BadStatus(response.status()));
        }

        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(FetchError::Body)?;

        Ok(bytes.to_vec())
    }
}

/// The per-topology state of a pool: the ring and one client per node.
///
/// Both are always rebuilt together so that the node names on the ring and the keys of the
/// client map never diverge.
struct Topology {
    ring: Ring,
    clients: HashMap<String, Arc<HttpNodeClient>>,
}

/// Routes keys to the nodes of a cluster.
///
/// An **HttpPool** knows the address of the local node (**self_address**) and, once
/// [set](HttpPool::set) was called, the addresses of all nodes of the cluster. As a
/// [NodeSelector](NodeSelector) it answers the only question a [Group](crate::group::Group)
/// ever asks: "which peer owns this key - or is it mine?".
///
/// # Examples
/// ```
/// # use callisto::http::HttpPool;
/// # use callisto::peers::NodeSelector;
/// let pool = HttpPool::new("http://127.0.0.1:8001");
/// pool.set(&["http://127.0.0.1:8001"]);
///
/// // Being the only node of the cluster, we own every key ourselves...
/// assert!(pool.select_node("Tom").is_none());
/// ```
pub struct HttpPool {
    self_address: String,
    base_path: String,
    replicas: usize,
    topology: Mutex<Topology>,
}

impl HttpPool {
    /// Creates a new pool for the node reachable under the given address.
    ///
    /// The address has to be the exact string under which the other nodes list this node in
    /// their [set](HttpPool::set) calls - it is how the pool recognizes itself on the ring.
    pub fn new(self_address: &str) -> Arc<Self> {
        Arc::new(HttpPool {
            self_address: self_address.to_owned(),
            base_path: DEFAULT_BASE_PATH.to_owned(),
            replicas: DEFAULT_REPLICAS,
            topology: Mutex::new(Topology {
                ring: Ring::new(DEFAULT_REPLICAS),
                clients: HashMap::new(),
            }),
        })
    }

    /// Installs the given node addresses as the cluster topology.
    ///
    /// This rebuilds the ring and the client table from scratch - the previous topology is
    /// replaced, not extended. The local address should be part of the list (otherwise the
    /// local node owns nothing and forwards every key).
    pub fn set<S: AsRef<str>>(&self, nodes: &[S]) {
        let mut ring = Ring::new(self.replicas);
        ring.add(nodes);

        let mut clients = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let _ = clients.insert(
                node.as_ref().to_owned(),
                Arc::new(HttpNodeClient::new(node.as_ref(), &self.base_path)),
            );
        }

        log::info!(
            "Installing a cluster topology of {} node(s) on {}...",
            nodes.len(),
            self.self_address
        );

        let mut topology = self.topology.lock().unwrap();
        topology.ring = ring;
        topology.clients = clients;
    }

    /// Returns the path prefix under which this pool expects the peer endpoints.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Returns the address under which the local node is known to the cluster.
    pub fn self_address(&self) -> &str {
        &self.self_address
    }
}

impl NodeSelector for HttpPool {
    fn select_node(&self, key: &str) -> Option<Arc<dyn NodeGetter>> {
        let topology = self.topology.lock().unwrap();

        match topology.ring.get(key) {
            Some(node) if node != self.self_address => {
                log::debug!("Key {} is owned by {}...", key, node);
                match topology.clients.get(node) {
                    Some(client) => {
                        let client: Arc<dyn NodeGetter> = client.clone();
                        Some(client)
                    }
                    None => None,
                }
            }
            _ => None,
        }
    }
}

/// Resolves an inbound peer request against the given registry.
///
/// The request path has to be `{base_path}{group}/{key}` - receiving any other prefix here
/// means the surrounding HTTP routing is broken, which is a programmer error and therefore
/// handled by a panic rather than a status code. See the module documentation for the status
/// codes of all regular outcomes.
pub async fn handle(
    registry: &Arc<GroupRegistry>,
    base_path: &str,
    request: Request<Body>,
) -> Response<Body> {
    let path = request.uri().path().to_owned();
    log::debug!("Received peer request for {}...", path);

    if !path.starts_with(base_path) {
        panic!(
            "The peer endpoint received a request for an unexpected path: {}",
            path
        );
    }

    let mut parts = path[base_path.len()..].splitn(2, '/');
    let (group_name, key) = match (parts.next(), parts.next()) {
        (Some(group_name), Some(key)) => (group_name, key),
        _ => return error_response(StatusCode::BAD_REQUEST, "bad request"),
    };

    let (group_name, key) = match (urlencoding::decode(group_name), urlencoding::decode(key)) {
        (Ok(group_name), Ok(key)) => (group_name, key),
        _ => return error_response(StatusCode::BAD_REQUEST, "bad request"),
    };

    let group = match registry.lookup(&group_name) {
        Some(group) => group,
        None => {
            return error_response(
                StatusCode::NOT_FOUND,
                &format!("no such group: {}", group_name),
            )
        }
    };

    match group.get(&key).await {
        Ok(view) => {
            let mut response = Response::new(Body::from(view.to_vec()));
            let _ = response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        }
        Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &error.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_owned()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use crate::group::{FnGetter, GroupRegistry};
    use crate::http::{handle, HttpPool, DEFAULT_BASE_PATH};
    use crate::peers::NodeSelector;
    use crate::testing::test_async;
    use hyper::{Body, Request, StatusCode};
    use std::sync::Arc;

    fn scores_registry() -> Arc<GroupRegistry> {
        let registry = GroupRegistry::new();
        let _ = registry.create(
            "scores",
            2 << 10,
            Arc::new(FnGetter::new(|key| match key {
                "Tom" => Ok(b"630".to_vec()),
                "Tom & Jerry" => Ok(b"1195".to_vec()),
                _ => Err(anyhow::anyhow!("{} not exist", key)),
            })),
        );

        registry
    }

    fn request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[test]
    fn values_are_served_as_raw_bytes() {
        test_async(async {
            let registry = scores_registry();

            let response = handle(&registry, DEFAULT_BASE_PATH, request("/_cache/scores/Tom")).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers()[hyper::header::CONTENT_TYPE],
                "application/octet-stream"
            );

            let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
            assert_eq!(&body[..], b"630");
        });
    }

    #[test]
    fn path_segments_are_percent_decoded() {
        test_async(async {
            let registry = scores_registry();

            let response = handle(
                &registry,
                DEFAULT_BASE_PATH,
                request("/_cache/scores/Tom%20%26%20Jerry"),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);

            let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
            assert_eq!(&body[..], b"1195");
        });
    }

    #[test]
    fn incomplete_paths_are_rejected() {
        test_async(async {
            let registry = scores_registry();

            let response = handle(&registry, DEFAULT_BASE_PATH, request("/_cache/scores")).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        });
    }

    #[test]
    fn unknown_groups_are_reported_as_not_found() {
        test_async(async {
            let registry = scores_registry();

            let response =
                handle(&registry, DEFAULT_BASE_PATH, request("/_cache/unknown/Tom")).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);

            let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
            assert_eq!(&body[..], b"no such group: unknown");
        });
    }

    #[test]
    fn loader_failures_are_reported_as_server_errors() {
        test_async(async {
            let registry = scores_registry();

            let response =
                handle(&registry, DEFAULT_BASE_PATH, request("/_cache/scores/Missing")).await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

            let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
            assert_eq!(&body[..], b"Missing not exist");
        });
    }

    #[test]
    #[should_panic]
    fn foreign_paths_indicate_broken_routing() {
        test_async(async {
            let registry = scores_registry();
            let _ = handle(&registry, DEFAULT_BASE_PATH, request("/api/scores/Tom")).await;
        });
    }

    #[test]
    fn a_single_node_cluster_never_selects_a_peer() {
        let pool = HttpPool::new("http://127.0.0.1:8001");
        pool.set(&["http://127.0.0.1:8001"]);

        // Every key is owned by the local node, therefore no lookup ever selects a peer -
        // otherwise the node would perform RPC loops to itself...
        for index in 0..100 {
            assert!(pool.select_node(&format!("key-{}", index)).is_none());
        }
    }

    #[test]
    fn remote_keys_are_routed_to_peers() {
        let pool = HttpPool::new("http://127.0.0.1:8001");
        pool.set(&["http://127.0.0.1:8001", "http://127.0.0.1:8002"]);

        // In a two node cluster, roughly half of the key space belongs to the remote node...
        let remote = (0..1000)
            .filter(|index| pool.select_node(&format!("key-{}", index)).is_some())
            .count();

        assert!(remote > 0, "no keys were routed to the remote node");
        assert!(remote < 1000, "the local node owns nothing at all");
    }

    #[test]
    fn an_empty_topology_handles_everything_locally() {
        let pool = HttpPool::new("http://127.0.0.1:8001");
        assert!(pool.select_node("Tom").is_none());
    }
}
