//! Provides cache groups, the loader seam and the group registry.
//!
//! A [Group](Group) is a named cache namespace with its own memory budget and its own
//! [Getter](Getter) - the callback which computes or fetches a value from the source of truth.
//! Several groups can coexist in one process (e.g. one for rendered snippets, one for search
//! metadata) without sharing any storage.
//!
//! The single externally visible operation is [Group::get](Group::get): it probes the local
//! cache, routes to the owning peer if one is attached via
//! [register_nodes](Group::register_nodes) and otherwise invokes the getter - and caches the
//! result in every case.
//!
//! Groups are created and looked up through a [GroupRegistry](GroupRegistry). The registry is
//! built once at process start and passed by reference to whatever dispatches requests (most
//! notably the [server](crate::server)), so that inbound peer requests can resolve a group by
//! its name.
//!
//! # Concurrency
//! Each group guards its cache with one exclusive lock which is only held for the in-memory
//! probe or insert, never across a load. As a consequence, two tasks which miss the same key
//! concurrently will both invoke the loader (or both ask the owning peer). There is no in-flight
//! de-duplication of loads - callers which expect heavy thundering-herd traffic should coalesce
//! requests before reaching the cache.
use crate::lru::LRUCache;
use crate::peers::{FetchError, NodeSelector};
use crate::view::ByteView;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, RwLock};

/// Loads the value for a key from the source of truth.
///
/// The getter of a group is only invoked for keys which this node owns and which aren't cached
/// yet. Whatever it returns is cached verbatim - a failing getter is reported to the caller and
/// nothing is cached, so the next lookup will try again.
#[async_trait]
pub trait Getter: Send + Sync {
    /// Produces the value for the given key.
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

/// Adapts a plain function or closure to the [Getter](Getter) trait.
///
/// # Examples
/// ```
/// # use callisto::group::{FnGetter, Getter};
/// # #[tokio::main]
/// # async fn main() {
/// let getter = FnGetter::new(|key| Ok(key.to_uppercase().into_bytes()));
/// assert_eq!(getter.get("tom").await.unwrap(), b"TOM");
/// # }
/// ```
pub struct FnGetter<F>
where
    F: Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    callback: F,
}

impl<F> FnGetter<F>
where
    F: Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    /// Wraps the given function into a getter.
    pub fn new(callback: F) -> Self {
        FnGetter { callback }
    }
}

#[async_trait]
impl<F> Getter for FnGetter<F>
where
    F: Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        (self.callback)(key)
    }
}

/// Represents an error when looking up a value via [Group::get](Group::get).
///
/// We distinguish the three ways a lookup can go wrong: the caller passed no key at all, the
/// user-supplied loader failed, or the owning peer could not deliver the value. Note that a
/// failed peer fetch is terminal for the lookup - the peer is the authoritative owner of the
/// key, so we don't silently compute the value locally (which would defeat the ownership model
/// and hammer the source of truth from every node).
#[derive(Debug)]
pub enum CacheError {
    /// The key was empty. No I/O is attempted for such requests.
    KeyRequired,

    /// The loader of the group failed to produce a value. The underlying error is passed
    /// through verbatim and nothing is cached.
    Load(anyhow::Error),

    /// The peer owning the key failed to deliver it.
    Remote(FetchError),
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::KeyRequired => write!(f, "key is required"),
            CacheError::Load(e) => write!(f, "{}", e),
            CacheError::Remote(e) => write!(f, "Failed to fetch value from peer: {}", e),
        }
    }
}

impl Error for CacheError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CacheError::KeyRequired => None,
            CacheError::Load(_) => None,
            CacheError::Remote(e) => Some(e),
        }
    }
}

impl From<FetchError> for CacheError {
    fn from(error: FetchError) -> Self {
        CacheError::Remote(error)
    }
}

/// Provides a point-in-time snapshot of the metrics of a group.
///
/// Obtained via [Group::stats](Group::stats), mainly intended for logging and maintenance
/// tooling.
pub struct GroupStats {
    /// Contains the name of the group.
    pub name: String,

    /// Contains the number of entries currently cached.
    pub entries: usize,

    /// Contains the number of bytes allocated for keys and values.
    pub allocated_memory: usize,

    /// Contains the memory budget of the group (0 = unbounded).
    pub max_memory: usize,

    /// Contains the total number of cache reads.
    pub reads: usize,

    /// Contains the total number of cache writes.
    pub writes: usize,

    /// Contains the cache hit rate in percent.
    pub hit_rate: f32,
}

impl Display for GroupStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} entries, {} of {}, {} reads, {} writes, {:.2} % hit rate",
            self.name,
            self.entries,
            crate::fmt::format_size(self.allocated_memory),
            crate::fmt::format_size(self.max_memory),
            self.reads,
            self.writes,
            self.hit_rate
        )
    }
}

/// A named cache namespace with its own loader, memory budget and (optional) peer routing.
///
/// Groups are created via [GroupRegistry::create](GroupRegistry::create) and live for the rest
/// of the process - there is no way to tear one down.
pub struct Group {
    name: String,
    getter: Arc<dyn Getter>,
    main_cache: Mutex<LRUCache<ByteView>>,
    nodes: ArcSwap<Option<Arc<dyn NodeSelector>>>,
}

impl Group {
    fn new(name: &str, max_memory: usize, getter: Arc<dyn Getter>) -> Self {
        Group {
            name: name.to_owned(),
            getter,
            main_cache: Mutex::new(LRUCache::new(max_memory)),
            nodes: ArcSwap::new(Arc::new(None)),
        }
    }

    /// Returns the name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches a node selector so that lookups can be routed to the owning peer.
    ///
    /// Without a selector, every key is owned by the local node and all misses go to the
    /// getter - which is exactly what a single-node deployment wants. The selector is expected
    /// to be attached once during startup; a second registration is refused (and logged), as
    /// silently swapping the routing topology under live traffic is almost certainly an
    /// accident.
    pub fn register_nodes(&self, nodes: Arc<dyn NodeSelector>) {
        if self.nodes.load().is_some() {
            log::error!(
                "Not going to re-register the node selector of group {} - one is already present.",
                self.name
            );
            return;
        }

        self.nodes.store(Arc::new(Some(nodes)));
    }

    /// Looks up the value for the given key.
    ///
    /// This probes the local cache first. On a miss, the key is routed to its owning peer (if
    /// peers are attached and the owner isn't the local node) or loaded via the getter. Either
    /// way the obtained value is placed in the local cache, so the next lookup is a hit.
    ///
    /// Note that concurrent lookups for the same missing key are *not* coalesced - each of them
    /// loads independently (see the module documentation).
    ///
    /// # Examples
    /// ```
    /// # use std::sync::Arc;
    /// # use callisto::group::{FnGetter, GroupRegistry};
    /// # #[tokio::main]
    /// # async fn main() {
    /// let registry = GroupRegistry::new();
    /// let group = registry.create(
    ///     "scores",
    ///     2 << 10,
    ///     Arc::new(FnGetter::new(|key| match key {
    ///         "Tom" => Ok(b"630".to_vec()),
    ///         _ => Err(anyhow::anyhow!("{} not exist", key)),
    ///     })),
    /// );
    ///
    /// assert_eq!(group.get("Tom").await.unwrap().to_vec(), b"630");
    /// assert_eq!(group.get("Jack").await.is_err(), true);
    /// # }
    /// ```
    pub async fn get(&self, key: &str) -> Result<ByteView, CacheError> {
        if key.is_empty() {
            return Err(CacheError::KeyRequired);
        }

        // The lock is only held for the probe itself and released before any load - otherwise
        // a slow loader would stall every other lookup of this group...
        if let Some(value) = self.main_cache.lock().unwrap().get(key) {
            log::debug!("Cache hit for {} in {}...", key, self.name);
            return Ok(value.clone());
        }

        self.load(key).await
    }

    /// Loads a missing key, either from the owning peer or via the local getter.
    async fn load(&self, key: &str) -> Result<ByteView, CacheError> {
        if let Some(nodes) = &*self.nodes.load_full() {
            if let Some(peer) = nodes.select_node(key) {
                let value = match peer.fetch(&self.name, key).await {
                    Ok(bytes) => ByteView::from(bytes),
                    Err(error) => {
                        log::error!(
                            "Failed to fetch {} of group {} from its owning peer: {}",
                            key,
                            self.name,
                            error
                        );
                        return Err(error.into());
                    }
                };

                self.populate(key, value.clone());
                return Ok(value);
            }
        }

        self.load_locally(key).await
    }

    /// Invokes the getter and caches its result.
    async fn load_locally(&self, key: &str) -> Result<ByteView, CacheError> {
        let bytes = self.getter.get(key).await.map_err(CacheError::Load)?;

        let value = ByteView::from(bytes);
        self.populate(key, value.clone());

        Ok(value)
    }

    fn populate(&self, key: &str, value: ByteView) {
        self.main_cache.lock().unwrap().put(key.to_owned(), value);
    }

    /// Reports the current metrics of this group.
    pub fn stats(&self) -> GroupStats {
        let cache = self.main_cache.lock().unwrap();

        GroupStats {
            name: self.name.clone(),
            entries: cache.len(),
            allocated_memory: cache.allocated_memory(),
            max_memory: cache.max_memory(),
            reads: cache.reads(),
            writes: cache.writes(),
            hit_rate: cache.hit_rate(),
        }
    }
}

/// Keeps track of all named groups of a process.
///
/// The registry is deliberately an explicit object (rather than some global state): it is
/// created once at startup and handed to the components which need to resolve groups by name -
/// locally as well as for inbound peer requests.
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use callisto::group::{FnGetter, GroupRegistry};
/// let registry = GroupRegistry::new();
/// let _scores = registry.create(
///     "scores",
///     2 << 10,
///     Arc::new(FnGetter::new(|_key| Ok(Vec::new()))),
/// );
///
/// assert_eq!(registry.lookup("scores").is_some(), true);
/// assert_eq!(registry.lookup("unknown").is_none(), true);
/// ```
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl GroupRegistry {
    /// Creates a new and empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(GroupRegistry {
            groups: RwLock::new(HashMap::new()),
        })
    }

    /// Creates and registers a group with the given name, memory budget and getter.
    ///
    /// A **max_memory** of 0 yields an unbounded group. Note that creating a group for a name
    /// which is already taken replaces the previous group (and logs a warning) - the previous
    /// group keeps working for everyone still holding a reference onto it, but it is no longer
    /// reachable by name.
    pub fn create(&self, name: &str, max_memory: usize, getter: Arc<dyn Getter>) -> Arc<Group> {
        let group = Arc::new(Group::new(name, max_memory, getter));

        log::info!("Creating new cache group {}...", name);
        if let Some(_previous) = self
            .groups
            .write()
            .unwrap()
            .insert(name.to_owned(), group.clone())
        {
            log::warn!(
                "Replaced the existing cache group {} - this is almost certainly a double \
                 registration.",
                name
            );
        }

        group
    }

    /// Resolves a group by its name.
    ///
    /// Many readers can resolve groups concurrently - only [create](GroupRegistry::create)
    /// briefly locks the registry exclusively.
    pub fn lookup(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().unwrap().get(name).cloned()
    }

    /// Lists the names of all registered groups.
    pub fn names(&self) -> Vec<String> {
        self.groups.read().unwrap().keys().cloned().collect()
    }
}
