//! Maps keys onto their owning cluster member via consistent hashing.
//!
//! Each member contributes a configurable number of virtual nodes (points) to the ring.
//! The owner of a key is the member behind the first point at or after the key's hash,
//! wrapping around at the end of the point table. Virtual nodes smooth out the load
//! distribution; lookups are a binary search over the sorted point table.
//!
//! Membership changes are copy-on-write: [Ring::set_members] builds a complete
//! replacement table and swaps it in atomically, so concurrent lookups observe either
//! the full old ring or the full new ring and never a torn state. The swap is backed
//! by `arc-swap`, which keeps [Ring::get_owner] entirely lock free.
//!
//! Point generation has to be reproducible across processes: members are sorted by id
//! before their points are placed and hash collisions are resolved by a deterministic
//! prefix extension, therefore two nodes constructing a ring from the same membership
//! set agree on every owner.
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;

use arc_swap::ArcSwap;
use fnv::FnvHasher;
use md5::{Digest, Md5};

use crate::cache::Error;
use crate::member::{members_equal, Member};

/// The hash function used to place points and look up keys.
///
/// The function receives raw bytes (ring seeds are not guaranteed to be UTF-8 once the
/// collision prefix has been applied) and yields a signed 64 bit position on the ring.
/// Hashing is fallible so that exotic implementations (e.g. keyed hashes) can report
/// failures; the default never fails.
pub type HashFn = Arc<dyn Fn(&[u8]) -> anyhow::Result<i64> + Send + Sync>;

/// Returns the default ring hash: FNV-1a (64 bit) over an MD5 digest of the input.
///
/// Plain FNV correlates strongly for the short, sequential seed strings used for
/// virtual nodes ("0node-1", "1node-1", ...), which clusters points and skews the key
/// distribution. Passing the seed through MD5 first decorrelates adjacent seeds. The
/// FNV stage on top of the already well-mixed digest is redundant, but it is kept so
/// that the resulting owner mapping stays bit-identical to existing deployments.
pub fn default_hash_fn() -> HashFn {
    Arc::new(|bytes| {
        let digest = Md5::digest(bytes);
        let mut hasher = FnvHasher::default();
        hasher.write(digest.as_slice());
        Ok(hasher.finish() as i64)
    })
}

/// The consistent-hash ring.
///
/// Cheap to share: lookups load the current state through an atomic pointer.
pub struct Ring {
    state: ArcSwap<RingState>,
}

struct RingState {
    members: Vec<Member>,
    virtual_nodes: usize,
    hash_fn: HashFn,
    points: Vec<i64>,
    owners: HashMap<i64, usize>,
}

impl RingState {
    /// Builds a complete point table for the given members.
    ///
    /// Members are sorted by id first so that collision resolution produces identical
    /// results on every node. A single-member ring skips the point table entirely as
    /// every key maps to that member anyway.
    fn build(
        mut members: Vec<Member>,
        virtual_nodes: usize,
        hash_fn: HashFn,
    ) -> Result<RingState, Error> {
        if members.is_empty() {
            return Err(Error::MissingMembers);
        }

        members.sort_by(|a, b| a.id.cmp(&b.id));

        let mut points = Vec::new();
        let mut owners = HashMap::new();

        if members.len() > 1 {
            points.reserve(members.len() * virtual_nodes);

            for (index, member) in members.iter().enumerate() {
                for n in 0..virtual_nodes {
                    let seed = format!("{}{}", n, member.id);

                    // Extend the seed with "-" prefixes until a free point is found. This
                    // terminates as long as the hash range vastly exceeds the total number
                    // of points, which is the documented expectation for ring hashes.
                    let mut candidate = seed.into_bytes();
                    loop {
                        let point = (hash_fn)(&candidate).map_err(Error::internal)?;
                        if let std::collections::hash_map::Entry::Vacant(slot) =
                            owners.entry(point)
                        {
                            let _ = slot.insert(index);
                            points.push(point);
                            break;
                        }
                        candidate.insert(0, b'-');
                    }
                }
            }

            points.sort_unstable();
        }

        Ok(RingState {
            members,
            virtual_nodes,
            hash_fn,
            points,
            owners,
        })
    }
}

impl Ring {
    /// Creates a new ring for the given members.
    ///
    /// # Example
    /// ```
    /// # use ganymede::member::Member;
    /// # use ganymede::ring::{default_hash_fn, Ring};
    /// let ring = Ring::new(
    ///     vec![
    ///         Member::new("node-1", "127.0.0.1:2410"),
    ///         Member::new("node-2", "127.0.0.1:2411"),
    ///     ],
    ///     64,
    ///     default_hash_fn(),
    /// )
    /// .unwrap();
    ///
    /// // Lookups are deterministic...
    /// assert_eq!(ring.get_owner("some-key").unwrap(), ring.get_owner("some-key").unwrap());
    /// ```
    pub fn new(members: Vec<Member>, virtual_nodes: usize, hash_fn: HashFn) -> Result<Ring, Error> {
        Ok(Ring {
            state: ArcSwap::from_pointee(RingState::build(members, virtual_nodes, hash_fn)?),
        })
    }

    /// Determines the member which owns the given key.
    ///
    /// This only fails if the installed hash function fails.
    pub fn get_owner(&self, key: &str) -> Result<Member, Error> {
        let state = self.state.load();

        if state.members.len() == 1 {
            return Ok(state.members[0].clone());
        }

        let sum = (state.hash_fn)(key.as_bytes()).map_err(Error::internal)?;

        // First point at or after the hash, wrapping to the start of the table...
        let index = state.points.partition_point(|point| *point < sum);
        let point = if index == state.points.len() {
            state.points[0]
        } else {
            state.points[index]
        };

        Ok(state.members[state.owners[&point]].clone())
    }

    /// Atomically replaces the ring membership.
    ///
    /// If the new set equals the current one (order independent on ids), this is a
    /// no-op. Otherwise a fresh point table is built off to the side and swapped in;
    /// on failure the current ring remains untouched.
    pub fn set_members(&self, members: Vec<Member>) -> Result<(), Error> {
        let current = self.state.load_full();
        if members_equal(&current.members, &members) {
            return Ok(());
        }

        let next = RingState::build(members, current.virtual_nodes, current.hash_fn.clone())?;
        self.state.store(Arc::new(next));

        Ok(())
    }

    /// Returns a copy of the current membership, sorted by id.
    pub fn members(&self) -> Vec<Member> {
        self.state.load().members.clone()
    }

    /// Returns a copy of the current point table, sorted ascending.
    pub fn points(&self) -> Vec<i64> {
        self.state.load().points.clone()
    }

    /// Returns the number of virtual nodes per member.
    pub fn virtual_nodes(&self) -> usize {
        self.state.load().virtual_nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[&str]) -> Vec<Member> {
        ids.iter()
            .enumerate()
            .map(|(n, id)| Member::new(*id, format!("127.0.0.1:{}", 2410 + n)))
            .collect()
    }

    #[test]
    fn the_point_table_is_complete_sorted_and_unique() {
        let ring = Ring::new(members(&["a", "b", "c"]), 64, default_hash_fn()).unwrap();

        let points = ring.points();
        assert_eq!(points.len(), 3 * 64);
        assert_eq!(points.windows(2).all(|w| w[0] < w[1]), true);
    }

    #[test]
    fn single_member_rings_skip_the_point_table() {
        let ring = Ring::new(members(&["a"]), 64, default_hash_fn()).unwrap();

        assert_eq!(ring.points().len(), 0);
        assert_eq!(ring.get_owner("anything").unwrap().id, "a");
    }

    #[test]
    fn ownership_is_deterministic_across_instances() {
        // Two rings built from the same set in different order have to agree on
        // every point and every owner...
        let left = Ring::new(members(&["a", "b", "c"]), 32, default_hash_fn()).unwrap();
        let mut reversed = members(&["a", "b", "c"]);
        reversed.reverse();
        let right = Ring::new(reversed, 32, default_hash_fn()).unwrap();

        assert_eq!(left.points(), right.points());
        for n in 0..100 {
            let key = format!("key-{}", n);
            assert_eq!(
                left.get_owner(&key).unwrap().id,
                right.get_owner(&key).unwrap().id
            );
        }
    }

    #[test]
    fn collisions_are_resolved_by_prefix_extension() {
        // A hash which only looks at the input length collides for every seed of the
        // same length, forcing the prefix extension path.
        let by_length: HashFn = Arc::new(|bytes| Ok(bytes.len() as i64));
        let ring = Ring::new(members(&["1", "2"]), 1, by_length).unwrap();

        // Seeds "01" and "02" both hash to 2; the second member gets re-seeded as
        // "-02" which hashes to 3.
        assert_eq!(ring.points(), vec![2, 3]);
        assert_eq!(ring.get_owner("ab").unwrap().id, "1");
        assert_eq!(ring.get_owner("abc").unwrap().id, "2");

        // Keys hashing past the last point wrap around to the first one...
        assert_eq!(ring.get_owner("abcd").unwrap().id, "1");
    }

    #[test]
    fn set_members_replaces_the_ring_atomically() {
        let ring = Ring::new(members(&["a", "b"]), 16, default_hash_fn()).unwrap();
        let before = ring.points();

        // Replacing with an equal set (different order) is a no-op...
        let mut shuffled = members(&["a", "b"]);
        shuffled.reverse();
        ring.set_members(shuffled).unwrap();
        assert_eq!(ring.points(), before);

        // An actual change rebuilds the point table...
        ring.set_members(members(&["a", "b", "c"])).unwrap();
        assert_eq!(ring.points().len(), 3 * 16);

        // ...and shrinking to a single member clears it.
        ring.set_members(members(&["a"])).unwrap();
        assert_eq!(ring.points().len(), 0);
        assert_eq!(ring.get_owner("key").unwrap().id, "a");
    }

    #[test]
    fn empty_membership_is_rejected() {
        assert!(matches!(
            Ring::new(Vec::new(), 16, default_hash_fn()),
            Err(Error::MissingMembers)
        ));
    }
}
