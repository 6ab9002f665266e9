//! Callisto is a library for building distributed in-process caches which shard keys across
//! peer nodes via consistent hashing.
//!
//! # Introduction
//! **Callisto** lets a cluster of equal peer nodes jointly cache values which are expensive to
//! compute or fetch. Each key has exactly one owning node, determined by a consistent-hash ring
//! over the cluster members. A node which is asked for a key it doesn't own forwards the request
//! to the owner via a minimal HTTP protocol and keeps the answer in its own bounded cache.
//! This way hot values end up close to where they are requested while the expensive computation
//! for each key runs on the node owning it.
//!
//! This is the classic *groupcache / memcached* pattern: the application embeds the cache as a
//! library (there is no separate cache server process to operate) and supplies a loader callback
//! which is only invoked for keys the local node owns and which aren't cached yet.
//!
//! # Features
//! * **Consistent hashing with virtual nodes** - adding a node to the cluster only re-assigns a
//!   small fraction of the key space. See [ring](ring).
//! * **Size constrained LRU caches** - each named cache group keeps its memory usage below a
//!   configured budget by evicting the least recently used entries. See [lru](lru).
//! * **Named cache groups** - several independent caches (each with its own loader and memory
//!   budget) can live in one process and are addressed by name, locally as well as via the peer
//!   protocol. See [group](group).
//! * **Minimal HTTP peer protocol** - a single GET route per cached value and raw bytes on the
//!   wire, so that every node (and every debugging human with *curl*) can talk to every other
//!   node. See [http](http).
//! * **100% Async/Await** - the whole library builds upon [tokio](https://tokio.rs/) and
//!   async/await primitives as provided by Rust.
//!
//! # Modules
//! * **ring**: the consistent-hash ring which maps keys to owning nodes.
//! * **lru**: the bounded LRU cache with byte-exact size accounting.
//! * **view**: the immutable [ByteView](view::ByteView) wrapper handed out for cached values.
//! * **group**: cache groups, the loader seam and the group registry.
//! * **peers**: the routing and transport seams of a group.
//! * **http**: the reference HTTP transport (client, router and request handler).
//! * **server**: the per-node listener which answers peer requests.
//!
//! # Examples
//! A complete multi-node example can be found in the **callisto-io** binary of this repository.
//!
//! Using a single-node cache group is a matter of a few lines:
//! ```
//! # use std::sync::Arc;
//! # use callisto::group::{FnGetter, GroupRegistry};
//! # #[tokio::main]
//! # async fn main() {
//! let registry = GroupRegistry::new();
//! let group = registry.create(
//!     "scores",
//!     2 << 10,
//!     Arc::new(FnGetter::new(|key| Ok(format!("value of {}", key).into_bytes()))),
//! );
//!
//! let value = group.get("Tom").await.unwrap();
//! assert_eq!(value.to_vec(), b"value of Tom");
//! # }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod config;
pub mod fmt;
pub mod group;
pub mod http;
pub mod lru;
pub mod peers;
pub mod ring;
pub mod server;
pub mod signals;
pub mod view;

/// Contains the version of the Callisto library.
pub const CALLISTO_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Callisto build being used.
pub const CALLISTO_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that this is guarded internally, therefore it can be invoked several times (e.g. once
/// per integration test) without crashing.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate callisto;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources. This is mainly our test port range (7201..) on which we start local
        /// servers for integration tests. Using this lock, we can still execute all other
        /// tests in parallel and only block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }
}
