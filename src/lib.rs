//! A Kademlia routing table backed by a prefix trie of buckets.
//!
//! Each bucket covers the identifiers sharing a prefix with it and holds at most `k` live
//! contacts plus a bounded replacement cache. Buckets split when they fill up, as long as they lie
//! on the local node's path, are the smallest subtree next to it, or aren't too deep yet.
//!
//! Notable features:
//!
//! 1. Contacts are tracked through a small liveness state machine (unknown, alive, dead) with
//!    failure thresholds depending on whether a contact has ever answered.
//! 2. A live contact is never displaced by an unverified one, and a node claiming the identifier
//!    of a live contact from another endpoint only takes over once the existing contact stops
//!    answering.
//! 3. Refresh targets are generated for buckets that went idle, aren't full or hold dead contacts.
//!
//! The core [`RouteTable`] doesn't perform any I/O: operations that need to verify a contact
//! return a [`Ping`] for the caller to send. With the `sync` feature enabled, [`SyncRouteTable`]
//! takes care of that over a user-supplied [`Transport`].

#![cfg_attr(doc_cfg, feature(doc_cfg))]

mod core;
pub mod router;

pub use crate::core::{
    config::{Config, ConfigError},
    contact::{Contact, ContactBuilder, ContactError, Role, State, Vendor},
    id::{Kuid, KuidError},
    traits::{PingError, Transport},
};
#[cfg(feature = "sync")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
pub use crate::router::SyncRouteTable;
pub use crate::router::{Bucket, BucketError, Ping, RouteTable, RoutingStats};
