//! Defines the unit of storage which is passed between stores, peers and codecs.
//!
//! Within the cache, values are always handled as opaque bytes wrapped in an [Item]. The
//! typed surface of a table (see [crate::table]) encodes values into an item before they
//! enter the store or the wire and decodes them right before they are handed back to the
//! caller. This keeps everything below the table boundary (storage engines, per-key locks,
//! the RPC surface and the hot cache) free of generics.
//!
//! An item also carries its expiry as microseconds since the UNIX epoch, where **0** means
//! "lives forever". Expiry is deliberately a wall-clock timestamp (and not a relative TTL),
//! as items travel between peers and must expire at the same instant everywhere.
use std::time::Duration;

use bytes::Bytes;

/// Returns the current wall-clock time in microseconds since the UNIX epoch.
pub(crate) fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Represents a stored value along with its key and expiry.
///
/// An item with an empty key is the **zero item** which represents a miss. This sentinel
/// is what travels over the wire when an owner has nothing to report for a key, so that
/// a miss and a transport error remain distinguishable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Item {
    /// The key under which the value is (or was) stored.
    pub key: String,

    /// The encoded value bytes. The encoding is determined by the codec of the owning table.
    pub value: Bytes,

    /// The expiry in microseconds since the UNIX epoch. 0 indicates that no TTL applies.
    pub expire: i64,
}

impl Item {
    /// Creates a new item for the given key and value.
    ///
    /// A zero `ttl` creates an item without expiry.
    pub fn new(key: impl Into<String>, value: Bytes, ttl: Duration) -> Self {
        let expire = if ttl.is_zero() {
            0
        } else {
            now_micros() + ttl.as_micros() as i64
        };

        Item {
            key: key.into(),
            value,
            expire,
        }
    }

    /// Creates the zero item which signals a miss.
    pub fn zero() -> Self {
        Item::default()
    }

    /// Determines if this item is the miss sentinel.
    pub fn is_zero(&self) -> bool {
        self.key.is_empty()
    }

    /// Determines if this item carries a TTL which has already elapsed.
    pub fn is_expired(&self) -> bool {
        self.expire != 0 && self.expire < now_micros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_without_ttl_never_expire() {
        let item = Item::new("key", Bytes::from_static(b"value"), Duration::ZERO);
        assert_eq!(item.expire, 0);
        assert_eq!(item.is_expired(), false);
        assert_eq!(item.is_zero(), false);
    }

    #[test]
    fn expiry_is_computed_from_the_ttl() {
        let item = Item::new("key", Bytes::from_static(b"value"), Duration::from_secs(3600));
        assert_eq!(item.is_expired(), false);

        // An item whose expiry lies in the past is reported as expired...
        let stale = Item {
            expire: now_micros() - 1,
            ..item.clone()
        };
        assert_eq!(stale.is_expired(), true);
    }

    #[test]
    fn the_zero_item_is_detected() {
        assert_eq!(Item::zero().is_zero(), true);

        // ...even if it carries bytes, as only the key decides.
        let odd = Item {
            key: String::new(),
            value: Bytes::from_static(b"data"),
            expire: 0,
        };
        assert_eq!(odd.is_zero(), true);
    }
}
