//! Contains the server component of Callisto.
//!
//! Opens a server-socket on the specified port (**server.port** in the config or 2410 as
//! fallback) and binds it to the selected IP (**server.host** in the config or 0.0.0.0 as
//! fallback). Each incoming connection is expected to speak plain HTTP/1 and is answered by
//! the peer endpoint ([http::handle](crate::http::handle)) against the
//! [GroupRegistry](crate::group::GroupRegistry) of this node.
//!
//! Note that in order to achieve zero downtime / ultra high availability demands, the server
//! will periodically try to bind the socket to the selected port, therefore a "new" instance
//! can be started and the "old" one can bleed out and the port will be "handed through" with
//! minimal downtime. Also, this will listen to change events of the config and will relocate
//! to another port or host if changed.
//!
//! # Example
//!
//! ```no_run
//! use callisto::config::Config;
//! use callisto::group::{FnGetter, GroupRegistry};
//! use callisto::server::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::new("config/settings.yml");
//!     let registry = GroupRegistry::new();
//!     let _scores = registry.create(
//!         "scores",
//!         2 << 10,
//!         Arc::new(FnGetter::new(|key| Ok(key.as_bytes().to_vec()))),
//!     );
//!
//!     // Run the peer endpoint of this node...
//!     Server::new(config, registry).event_loop().await;
//! }
//! ```
use crate::average::Average;
use crate::config::Config;
use crate::fmt::format_duration;
use crate::group::GroupRegistry;
use crate::spawn;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};

/// Specifies the timeout when waiting for a new incoming connection.
///
/// When waiting for a new connection we need to interrupt this every once in a while so that
/// we can check if the server has been terminated.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Represents a server which answers peer requests for the groups of this node.
pub struct Server {
    running: AtomicBool,
    active: AtomicBool,
    current_address: Mutex<Option<String>>,
    config: Arc<Config>,
    registry: Arc<GroupRegistry>,
    base_path: String,
    requests: Average,
    started: Instant,
}

impl Server {
    /// Creates a new server for the given config and group registry.
    ///
    /// The registry is what inbound requests are resolved against - every group which should
    /// be reachable for peers has to be registered there. Note that this will not technically
    /// start the server. This has to be done manually via [event_loop](Server::event_loop) as
    /// it is most probably done in the main thread.
    pub fn new(config: Arc<Config>, registry: Arc<GroupRegistry>) -> Arc<Self> {
        Arc::new(Server {
            running: AtomicBool::new(false),
            active: AtomicBool::new(true),
            current_address: Mutex::new(None),
            config,
            registry,
            base_path: crate::http::DEFAULT_BASE_PATH.to_owned(),
            requests: Average::new(),
            started: Instant::now(),
        })
    }

    /// Determines if the server is still active or if [terminate](Server::terminate) has
    /// already been called.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Terminates the server.
    ///
    /// This will make the event loop (and therefore most probably the whole process) exit
    /// within the connection wait timeout.
    pub fn terminate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Provides the average duration and total number of handled peer requests.
    pub fn requests(&self) -> &Average {
        &self.requests
    }

    /// Determines if the server socket should keep listening for incoming connections.
    ///
    /// In contrast to **is_active** this is not used to control the shutdown of the server.
    /// Rather we toggle this flag to false if a config and therefore address change was
    /// detected. This way **server_loop** will exit and a new server socket for the
    /// appropriate address will be set up by the **event_loop**.
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Determines the server address based on the current configuration.
    ///
    /// If no, an invalid or a partial config is present, fallback values are used. By default
    /// we use port 2410 and bind to "0.0.0.0".
    fn address(&self) -> String {
        let handle = self.config.current();
        format!(
            "{}:{}",
            handle.config()["server"]["host"].as_str().unwrap_or("0.0.0.0"),
            handle.config()["server"]["port"]
                .as_i64()
                .filter(|port| *port > 0 && *port <= u16::MAX as i64)
                .unwrap_or(2410)
        )
    }

    /// Starts the event loop in a separate thread.
    ///
    /// This is most probably used by test scenarios where the tests itself run in the main
    /// thread.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            cloned_server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate thread and waits until the server is up and running.
    ///
    /// Just like **fork** this is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while server.current_address.lock().unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Tries to open a server socket on the specified address to serve incoming peer requests.
    ///
    /// The task of this loop is to bind the server socket to the specified address. Once this
    /// was successful, we enter the [server_loop](Server::server_loop) to actually handle
    /// incoming connections. Once this loop returns, either the server was terminated and we
    /// should exit, or the config has changed and we should try to bind the server to the new
    /// address.
    pub async fn event_loop(self: &Arc<Self>) {
        let mut address = String::new();
        let mut last_bind_error_reported = Instant::now();

        while self.is_active() {
            // If the server is started for the first time or if it has been restarted due to
            // a config change, we need to reload the address...
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            // Bind and hopefully enter the server_loop...
            if let Ok(listener) = TcpListener::bind(&address).await {
                log::info!("Opened server socket on {}...", &address);
                *self.current_address.lock().unwrap() = Some(address.clone());
                self.server_loop(&listener).await;
                log::info!("Closing server socket on {}.", &address);
            } else {
                // If we were unable to bind to the server, we log this every once in a while
                // (every 5s). Otherwise we would jam the log as we retry every 500ms.
                if Instant::now()
                    .duration_since(last_bind_error_reported)
                    .as_secs()
                    > 5
                {
                    log::error!(
                        "Cannot open server address: {}. Retrying every 500ms...",
                        &address
                    );
                    last_bind_error_reported = Instant::now();
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        log::info!(
            "Server halted after {}.",
            format_duration(self.started.elapsed())
        );
    }

    /// Runs the main server loop which processes incoming connections.
    ///
    /// This also listens on config changes and exits to the event_loop if necessary (server
    /// address changed...).
    async fn server_loop(self: &Arc<Self>, listener: &TcpListener) {
        let mut config_changed_flag = self.config.notifier();

        while self.is_active() && self.is_running() {
            tokio::select! {
                // We use a timeout here so that the while condition (esp. is_active()) is
                // checked every once in a while...
                timeout_stream = tokio::time::timeout(CONNECT_WAIT_TIMEOUT, listener.accept()) => {
                    // We're only interested in a positive result here, as an Err simply
                    // indicates that the timeout was hit - in this case we do nothing as the
                    // while condition is all that needs to be checked...
                    if let Ok(stream) = timeout_stream {
                        // If a stream is present, we treat this as new connection and
                        // eventually serve HTTP on it...
                        if let Ok((stream, _)) = stream {
                            self.handle_new_connection(stream);
                        } else {
                            // Otherwise the socket has been closed therefore we exit to the
                            // event_loop which will either completely exit or try to re-create
                            // the socket.
                            return;
                        }
                    }
                }
                _ = config_changed_flag.recv() => {
                    // If the config was changed, we need to check if the address itself
                    // changed...
                    let new_address = self.address();
                    if let Some(current_address) = &*self.current_address.lock().unwrap() {
                       if current_address != &new_address {
                           log::info!("Server address has changed. Restarting server socket...");

                           // Force the event_loop to re-evaluate the expected server address...
                           self.running.store(false, Ordering::Release);

                           // Return to event_loop so that the server socket is re-created...
                           return;
                       }
                    }
               }
            }
        }
    }

    /// Handles a new incoming connection.
    ///
    /// This forks a "thread" which drives HTTP/1 on the connection and dispatches every
    /// request into the peer endpoint. Keep-alive is supported, as we expect our peers to use
    /// pooled, rather long running connections.
    fn handle_new_connection(self: &Arc<Self>, stream: TcpStream) {
        let server = self.clone();
        spawn!(async move {
            // Mark the connection as nodelay, as responses are written in one go anyway.
            let _ = stream.set_nodelay(true);

            let peer_address = stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "<unknown>".to_owned());
            log::debug!("Opened connection from {}...", peer_address);

            let service_server = server.clone();
            let service = service_fn(move |request| {
                let server = service_server.clone();
                async move {
                    let watch = Instant::now();
                    let response =
                        crate::http::handle(&server.registry, &server.base_path, request).await;
                    server.requests.add(watch.elapsed().as_micros() as i32);

                    Ok::<_, Infallible>(response)
                }
            });

            if let Err(error) = Http::new().serve_connection(stream, service).await {
                log::debug!(
                    "An IO error occurred in connection {}: {}",
                    peer_address,
                    error
                );
            }

            log::debug!("Closing connection to {}...", peer_address);
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::group::{FnGetter, Group, GroupRegistry};
    use crate::http::HttpPool;
    use crate::server::Server;
    use crate::testing::test_async;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Boots a complete cache node: config, registry, "scores" group, pool and server.
    ///
    /// The loader labels every value with the port of the node which computed it, so that
    /// tests can verify on which node a value was produced.
    async fn start_node(port: u16, nodes: &[&str]) -> (Arc<Server>, Arc<Group>) {
        let config = Config::new("config/missing.yml");
        config
            .load_from_string(
                &format!(
                    "
                    server:
                        host: 127.0.0.1
                        port: {}
                    ",
                    port
                ),
                None,
            )
            .unwrap();

        let registry = GroupRegistry::new();
        let group = registry.create(
            "scores",
            2 << 10,
            Arc::new(FnGetter::new(move |key| {
                Ok(format!("{}@{}", key, port).into_bytes())
            })),
        );

        let pool = HttpPool::new(&format!("http://127.0.0.1:{}", port));
        pool.set(nodes);
        group.register_nodes(pool);

        let server = Server::new(config, registry);
        Server::fork_and_await(&server).await;

        (server, group)
    }

    #[test]
    fn cluster_nodes_serve_each_others_keys() {
        crate::init_logging();

        // We want exclusive access to our test port range on which we fire up local servers
        // for our integration tests...
        log::info!("Acquiring shared resources...");
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        log::info!("Successfully acquired shared resources.");

        test_async(async {
            let nodes = ["http://127.0.0.1:7201", "http://127.0.0.1:7202"];
            let (server_a, group_a) = start_node(7201, &nodes).await;
            let (server_b, group_b) = start_node(7202, &nodes).await;

            let mut owners = HashSet::new();
            for index in 0..40 {
                let key = format!("key-{}", index);
                let from_a = group_a.get(&key).await.unwrap().to_vec();
                let from_b = group_b.get(&key).await.unwrap().to_vec();

                // No matter which node is asked, the value was computed by the owner of the
                // key - therefore both nodes have to agree on it...
                assert_eq!(from_a, from_b);

                let value = String::from_utf8(from_a).unwrap();
                let _ = owners.insert(value.rsplit('@').next().unwrap().to_owned());
            }

            // ...and with 40 keys on 2 nodes, both nodes own a share of the key space.
            assert_eq!(owners.len(), 2);

            server_a.terminate();
            server_b.terminate();
        });
    }

    #[test]
    fn the_peer_endpoint_speaks_plain_http() {
        crate::init_logging();

        log::info!("Acquiring shared resources...");
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        log::info!("Successfully acquired shared resources.");

        test_async(async {
            let nodes = ["http://127.0.0.1:7203"];
            let (server, _group) = start_node(7203, &nodes).await;

            // A cached value is served as raw bytes...
            let client = hyper::Client::new();
            let response = client
                .get("http://127.0.0.1:7203/_cache/scores/Tom".parse().unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), hyper::StatusCode::OK);
            let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
            assert_eq!(&body[..], b"Tom@7203");

            // ...while an unknown group yields a 404.
            let response = client
                .get("http://127.0.0.1:7203/_cache/unknown/Tom".parse().unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), hyper::StatusCode::NOT_FOUND);

            assert!(server.requests().count() >= 2);

            server.terminate();
        });
    }
}
