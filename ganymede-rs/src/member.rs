//! Describes the members of the cluster and validates membership sets.
//!
//! A [Member] is the identity of one peer: its `id` is what the consistent-hash ring
//! operates on and what the peer-client pool is keyed by, its `addr` is the socket
//! address the peer serves on. Both have to be unique within a membership set.
//!
//! Membership sets are always passed through [validate_members] before they reach the
//! ring or the client pool. This normalizes the set (the local node is injected if the
//! caller forgot to include it) and rejects configs which would silently misbehave
//! later (duplicate ids route two peers onto the same ring points, duplicate addresses
//! make two clients talk to the same server).
use std::collections::HashSet;
use std::net::SocketAddr;

use crate::cache::Error;

/// Represents a single cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Member {
    /// The unique identity of the peer on the ring.
    pub id: String,

    /// The socket address (`host:port`) the peer serves the cache protocol on.
    pub addr: String,
}

impl Member {
    /// Creates a new member.
    ///
    /// # Example
    /// ```
    /// # use ganymede::member::Member;
    /// let member = Member::new("node-1", "127.0.0.1:2410");
    /// assert_eq!(member.id, "node-1");
    /// ```
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Member {
            id: id.into(),
            addr: addr.into(),
        }
    }
}

/// Validates and normalizes a membership set.
///
/// Ensures the set is non-empty, every address parses as a socket address, and neither
/// ids nor addresses repeat. The local member is appended if it is missing, therefore
/// the returned set always contains `this`.
pub(crate) fn validate_members(this: &Member, peers: &[Member]) -> Result<Vec<Member>, Error> {
    if peers.is_empty() {
        return Err(Error::MissingMembers);
    }

    let mut ids = HashSet::new();
    let mut addrs = HashSet::new();
    let mut contains_self = false;

    for peer in peers {
        if peer.addr.parse::<SocketAddr>().is_err() {
            return Err(Error::InvalidPeerAddr(peer.addr.clone()));
        }
        if !ids.insert(peer.id.as_str()) {
            return Err(Error::DuplicatePeer(format!("id {}", peer.id)));
        }
        if !addrs.insert(peer.addr.as_str()) {
            return Err(Error::DuplicatePeer(format!("address {}", peer.addr)));
        }
        if peer.id == this.id {
            contains_self = true;
        }
    }

    let mut members = peers.to_vec();
    if !contains_self {
        members.push(this.clone());
    }

    Ok(members)
}

/// Checks two membership sets for order independent equality on their ids.
pub(crate) fn members_equal(left: &[Member], right: &[Member]) -> bool {
    if left.len() != right.len() {
        return false;
    }

    let ids: HashSet<&str> = left.iter().map(|m| m.id.as_str()).collect();
    right.iter().all(|m| ids.contains(m.id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, addr: &str) -> Member {
        Member::new(id, addr)
    }

    #[test]
    fn the_local_member_is_injected() {
        let this = member("1", "127.0.0.1:2410");
        let members =
            validate_members(&this, &[member("2", "127.0.0.1:2411")]).unwrap();

        assert_eq!(members.len(), 2);
        assert_eq!(members.iter().any(|m| m.id == "1"), true);
    }

    #[test]
    fn broken_membership_sets_are_rejected() {
        let this = member("1", "127.0.0.1:2410");

        assert!(matches!(
            validate_members(&this, &[]),
            Err(Error::MissingMembers)
        ));
        assert!(matches!(
            validate_members(&this, &[member("2", "not-an-address")]),
            Err(Error::InvalidPeerAddr(_))
        ));
        assert!(matches!(
            validate_members(
                &this,
                &[member("2", "127.0.0.1:2411"), member("2", "127.0.0.1:2412")]
            ),
            Err(Error::DuplicatePeer(_))
        ));
        assert!(matches!(
            validate_members(
                &this,
                &[member("2", "127.0.0.1:2411"), member("3", "127.0.0.1:2411")]
            ),
            Err(Error::DuplicatePeer(_))
        ));
    }

    #[test]
    fn membership_equality_ignores_order() {
        let a = vec![member("1", "127.0.0.1:1"), member("2", "127.0.0.1:2")];
        let b = vec![member("2", "127.0.0.1:2"), member("1", "127.0.0.1:1")];
        let c = vec![member("1", "127.0.0.1:1"), member("3", "127.0.0.1:3")];

        assert_eq!(members_equal(&a, &b), true);
        assert_eq!(members_equal(&a, &c), false);
        assert_eq!(members_equal(&a, &a[..1]), false);
    }
}
