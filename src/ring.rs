//! Provides the consistent-hash ring which maps cache keys to owning nodes.
//!
//! Every real node is represented by a configurable number of *virtual nodes* on the ring. A key
//! is owned by the node whose virtual position is the first one at or after the hash of the key,
//! wrapping around at the end of the ring. The virtual nodes smooth the load distribution across
//! small clusters, while the ring structure guarantees that adding a node only re-assigns the
//! keys falling between its virtual positions and their predecessors - everything else keeps its
//! owner.
//!
//! Note that the ring only deals in node *names* (commonly the base URL of a peer). Mapping a
//! name to an actual transport is the job of [HttpPool](crate::http::HttpPool) or whatever else
//! implements [NodeSelector](crate::peers::NodeSelector).
use fnv::FnvHasher;
use std::collections::HashMap;
use std::hash::Hasher;

/// Determines the hash function used to place virtual nodes and keys on the ring.
///
/// The function must be deterministic and should distribute arbitrary short strings evenly
/// across the full **u32** range. It can be replaced (mainly by tests) via
/// [Ring::with_hash_fn](Ring::with_hash_fn).
pub type HashFn = fn(&[u8]) -> u32;

/// Hashes the given bytes using FNV-1a, folded down to 32 bits.
///
/// This is the default hash of a [Ring](Ring). FNV is a non-cryptographic hash which is more
/// than good enough here: we don't defend against adversarial keys, we only need an even spread.
fn fnv32(data: &[u8]) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(data);
    let hash = hasher.finish();

    (hash >> 32) as u32 ^ (hash & 0xFFFFFFFF) as u32
}

/// Maps string keys to one of a fixed set of named nodes using consistent hashing.
///
/// # Examples
/// ```
/// # use callisto::ring::Ring;
/// let mut ring = Ring::new(50);
/// ring.add(&["http://node-a", "http://node-b", "http://node-c"]);
///
/// // Every key is owned by exactly one node...
/// let owner = ring.get("some-key").unwrap();
///
/// // ...and repeated lookups are stable.
/// assert_eq!(ring.get("some-key"), Some(owner));
/// ```
pub struct Ring {
    hash_fn: HashFn,
    replicas: usize,
    ring: Vec<u32>,
    nodes: HashMap<u32, String>,
}

impl Ring {
    /// Creates an empty ring which will place the given number of virtual nodes per real node.
    ///
    /// More replicas yield a smoother key distribution at the cost of a larger ring. Values
    /// around 50 are a reasonable default for small clusters.
    pub fn new(replicas: usize) -> Self {
        Ring::with_hash_fn(replicas, fnv32)
    }

    /// Creates an empty ring using the given hash function.
    ///
    /// This is mainly used by tests which need full control over key placement.
    ///
    /// # Examples
    /// ```
    /// # use callisto::ring::Ring;
    /// // A "hash" which simply parses the key as a number makes placement fully predictable...
    /// let mut ring = Ring::with_hash_fn(3, |data| {
    ///     std::str::from_utf8(data).unwrap().parse().unwrap()
    /// });
    ///
    /// // "2", "12" and "22" become the virtual nodes of node "2"...
    /// ring.add(&["2"]);
    /// assert_eq!(ring.get("7"), Some("2"));
    /// ```
    pub fn with_hash_fn(replicas: usize, hash_fn: HashFn) -> Self {
        Ring {
            hash_fn,
            replicas,
            ring: Vec::new(),
            nodes: HashMap::new(),
        }
    }

    /// Adds the given nodes to the ring.
    ///
    /// For each node we insert `replicas` virtual positions, hashed from the virtual node name
    /// which is the replica index concatenated with the node name. The ring is re-sorted once
    /// after all insertions.
    ///
    /// Note that adding the same node twice duplicates its virtual nodes - the caller has to
    /// guard against double registration. Also note that if two virtual node names hash to the
    /// same position, the later insertion silently takes over that position. With a 32 bit hash
    /// and rings of a few thousand virtual nodes this is too rare to warrant handling.
    pub fn add<S: AsRef<str>>(&mut self, nodes: &[S]) {
        for node in nodes {
            for index in 0..self.replicas {
                let virtual_node = format!("{}{}", index, node.as_ref());
                let hash = (self.hash_fn)(virtual_node.as_bytes());
                self.ring.push(hash);
                let _ = self.nodes.insert(hash, node.as_ref().to_owned());
            }
        }

        self.ring.sort_unstable();
    }

    /// Determines the node owning the given key.
    ///
    /// Returns **None** if the ring is empty - the caller has to treat this as "no peers
    /// available, handle locally".
    ///
    /// # Examples
    /// ```
    /// # use callisto::ring::Ring;
    /// let mut ring = Ring::new(50);
    /// assert_eq!(ring.get("anything"), None);
    ///
    /// ring.add(&["http://node-a"]);
    /// assert_eq!(ring.get("anything"), Some("http://node-a"));
    /// ```
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }

        let hash = (self.hash_fn)(key.as_bytes());

        // Find the first virtual node at or after the hash of the key. If the key hashes
        // beyond the last position, the search yields the ring length and the modulo wraps
        // around to the first position - which is what makes this a ring.
        let index = match self.ring.binary_search(&hash) {
            Ok(index) => index,
            Err(index) => index,
        } % self.ring.len();

        self.nodes.get(&self.ring[index]).map(|node| node.as_str())
    }

    /// Returns the number of virtual nodes on the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Determines if the ring has no nodes at all.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::ring::Ring;

    /// Parses the key as a number so that tests fully control the ring layout.
    fn numeric_hash(data: &[u8]) -> u32 {
        std::str::from_utf8(data).unwrap().parse().unwrap()
    }

    #[test]
    fn keys_are_routed_to_the_next_virtual_node() {
        let mut ring = Ring::with_hash_fn(3, numeric_hash);

        // Node "6" owns the virtual positions 6, 16 and 26, node "4" owns 4, 14 and 24 and
        // node "2" owns 2, 12 and 22...
        ring.add(&["6", "4", "2"]);

        assert_eq!(ring.get("2"), Some("2"));
        assert_eq!(ring.get("11"), Some("2"));
        assert_eq!(ring.get("23"), Some("4"));

        // ...and a key beyond the highest position (26) wraps around to the lowest (2).
        assert_eq!(ring.get("27"), Some("2"));
    }

    #[test]
    fn adding_a_node_only_moves_keys_onto_it() {
        let mut ring = Ring::with_hash_fn(3, numeric_hash);
        ring.add(&["6", "4", "2"]);

        // "27" wraps around to node "2" - until node "8" claims the position 28...
        assert_eq!(ring.get("27"), Some("2"));
        ring.add(&["8"]);
        assert_eq!(ring.get("27"), Some("8"));

        // ...while keys owned by other nodes stay put.
        assert_eq!(ring.get("2"), Some("2"));
        assert_eq!(ring.get("11"), Some("2"));
        assert_eq!(ring.get("23"), Some("4"));
    }

    #[test]
    fn lookups_are_deterministic_across_rebuilds() {
        let keys = ["Tom", "Jack", "Sam", "some/longer/key", ""];

        let mut first = Ring::new(50);
        first.add(&["http://node-a", "http://node-b", "http://node-c"]);

        // An identically constructed ring routes every key identically - even if the nodes
        // are registered in a different order...
        let mut second = Ring::new(50);
        second.add(&["http://node-c", "http://node-a", "http://node-b"]);

        for key in keys {
            assert_eq!(first.get(key), second.get(key));
            assert_eq!(first.get(key), first.get(key));
        }
    }

    #[test]
    fn adding_a_node_moves_only_a_fraction_of_the_key_space() {
        let mut before = Ring::new(50);
        before.add(&["http://node-a", "http://node-b", "http://node-c"]);

        let mut after = Ring::new(50);
        after.add(&["http://node-a", "http://node-b", "http://node-c"]);
        after.add(&["http://node-d"]);

        let total = 10_000;
        let moved = (0..total)
            .map(|index| format!("key-{}", index))
            .filter(|key| before.get(key) != after.get(key))
            .count();

        // In expectation a quarter of the keys move to the fourth node. We allow a generous
        // margin as the distribution depends on the hash layout of this exact node set.
        assert!(moved > 0, "no keys moved to the new node");
        assert!(
            moved < total / 2,
            "{} of {} keys moved - ring is unstable",
            moved,
            total
        );

        // Every key that moved now belongs to the new node...
        for index in 0..total {
            let key = format!("key-{}", index);
            if before.get(&key) != after.get(&key) {
                assert_eq!(after.get(&key), Some("http://node-d"));
            }
        }
    }

    #[test]
    fn empty_ring_yields_no_node() {
        let ring = Ring::new(50);
        assert_eq!(ring.get("anything"), None);
        assert_eq!(ring.len(), 0);
        assert!(ring.is_empty());
    }
}
