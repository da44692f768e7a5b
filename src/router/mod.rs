//! Core routing table implementation.
//!
//! The table is a trie of [`Bucket`]s keyed by identifier prefix. It never performs I/O itself:
//! when the algorithm wants to know whether a contact is still there, the operation returns a
//! [`Ping`] for the caller to send, and the outcome is fed back through [`RouteTable::add`],
//! [`RouteTable::handle_failure`] or [`RouteTable::spoof_check_timed_out`].

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    net::{Ipv4Addr, SocketAddr},
};

use time::OffsetDateTime;
use tracing::{debug, error, info, trace, warn};

use crate::core::{
    config::{Config, ConfigError},
    contact::{elapsed_since, Contact},
    id::Kuid,
};

mod bucket;
#[cfg(feature = "sync")]
mod sync;

pub use bucket::{Bucket, BucketError};
#[cfg(feature = "sync")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
pub use sync::SyncRouteTable;

/// A ping the routing table needs sent on its behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ping {
    /// Checks a live contact is still there, giving a cached contact the chance to take its slot.
    ///
    /// Report a response with [`RouteTable::add`] and a failure with
    /// [`RouteTable::handle_failure`].
    Probe(Contact),
    /// Checks `existing` still answers before `contender` takes over its identifier.
    ///
    /// Report a response with [`RouteTable::spoof_check_answered`] and a failure with
    /// [`RouteTable::spoof_check_timed_out`]. Until either is called, or the check outlives the
    /// configured timeout, further contenders for the identifier are ignored.
    SpoofCheck {
        existing: Contact,
        contender: Contact,
    },
}

/// Counters describing what the routing table has been up to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoutingStats {
    /// Alive contacts inserted into a live set.
    pub live_added: u64,
    /// Unverified contacts inserted into a live set.
    pub unknown_added: u64,
    /// Contacts placed in a replacement cache.
    pub replacements: u64,
    /// Contacts evicted after being declared dead.
    pub dead_evicted: u64,
    /// Buckets currently in the trie.
    pub buckets: u64,
    /// Refresh targets handed out.
    pub refresh_targets: u64,
}

/// The core routing table implementation.
#[derive(Debug, Clone)]
pub struct RouteTable {
    config: Config,
    // The node's own contact, also stored in the bucket covering its identifier.
    local: Contact,
    // Keyed by bucket identifier; the owner of an identifier is the closest key at or below it.
    buckets: BTreeMap<Kuid, Bucket>,
    // The sibling split off the local node's path most recently, as (bucket_id, depth).
    smallest_subtree: Option<(Kuid, usize)>,
    // Failures reported since a contact was last heard from.
    consecutive_failures: usize,
    // Identifiers with a spoof check in flight, and when it started.
    spoof_checks: HashMap<Kuid, OffsetDateTime>,
    stats: RoutingStats,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::with_valid_config(
            Kuid::random(),
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            Config::default(),
        )
    }
}

impl RouteTable {
    /// Creates a new routing table for the local node.
    pub fn new(local_id: Kuid, local_addr: SocketAddr, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self::with_valid_config(local_id, local_addr, config))
    }

    fn with_valid_config(local_id: Kuid, local_addr: SocketAddr, config: Config) -> Self {
        let mut rt = Self {
            config,
            local: Contact::local(local_id, local_addr),
            buckets: BTreeMap::new(),
            smallest_subtree: None,
            consecutive_failures: 0,
            spoof_checks: HashMap::new(),
            stats: RoutingStats::default(),
        };
        rt.init();

        rt
    }

    // Installs the root bucket covering the whole identifier space and puts the local node in it.
    fn init(&mut self) {
        let mut root = Bucket::new(Kuid::MIN, 0, self.config);
        if let Err(err) = root.add_live(self.local.clone()) {
            Self::invariant_violated(err);
        }

        self.buckets.clear();
        self.buckets.insert(root.bucket_id(), root);
        self.smallest_subtree = None;
        self.consecutive_failures = 0;
        self.spoof_checks.clear();
        self.stats.buckets = 1;
    }

    /// Returns this node's identifier.
    pub fn local_id(&self) -> Kuid {
        self.local.node_id()
    }

    /// Returns this node's contact.
    pub fn local_node(&self) -> &Contact {
        &self.local
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> RoutingStats {
        self.stats
    }

    /// Failure reports counted since a contact was last added.
    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn invariant_violated(err: BucketError) {
        error!(%err, "routing table invariant violated");

        if cfg!(debug_assertions) {
            panic!("routing table invariant violated: {err}");
        }
    }

    // Resolves the key of the bucket owning the identifier.
    fn owning_key(&self, id: &Kuid) -> Option<Kuid> {
        let key = self.buckets.range(..=*id).next_back().map(|(key, _)| *key);

        // The root bucket starts at the bottom of the space, so there is always an owner.
        if key.is_none() {
            error!(%id, "no bucket owns the identifier");
        }

        key
    }

    // Bucket keys ordered by the distance of their range to the target, closest first.
    fn keys_by_distance(&self, target: &Kuid) -> Vec<Kuid> {
        // Ranges are disjoint, so the XOR of their prefixes with the target orders every contact
        // of one bucket before every contact of the next.
        let mut keys: Vec<(Kuid, Kuid)> = self
            .buckets
            .values()
            .map(|bucket| {
                (
                    bucket.bucket_id().xor(target).prefix(bucket.depth()),
                    bucket.bucket_id(),
                )
            })
            .collect();
        keys.sort_unstable();

        keys.into_iter().map(|(_, key)| key).collect()
    }

    /// Adds a freshly observed contact, returning a ping to send if the table wants one.
    ///
    /// Firewalled contacts are ignored unless they describe this node. When the contact ends up
    /// in a replacement cache, the least recently seen live contact is only probed if it hasn't
    /// been heard from within the reconnection window, which bounds the probes a burst of
    /// newcomers can cause.
    pub fn add(&mut self, contact: Contact) -> Option<Ping> {
        if contact.is_local() && contact.node_id() != self.local_id() {
            warn!(%contact, "ignoring a local contact that isn't this node");
            return None;
        }

        if contact.is_firewalled() && !contact.is_local() {
            trace!(%contact, "not adding firewalled contact");
            return None;
        }

        // Hearing from anyone means we're still connected.
        self.consecutive_failures = 0;

        let id = contact.node_id();
        loop {
            let key = self.owning_key(&id)?;
            let bucket = self.buckets.get(&key)?;

            if let Some(existing) = bucket.get(&id).cloned() {
                return self.update_existing(key, existing, contact);
            }

            if !bucket.is_live_full() {
                self.add_to_bucket(key, contact);
                return None;
            }

            // Retry against the children if the bucket split.
            if !self.split(key) {
                return self.replace_in_bucket(key, contact);
            }
        }
    }

    fn add_to_bucket(&mut self, key: Kuid, contact: Contact) {
        let Some(bucket) = self.buckets.get_mut(&key) else {
            return;
        };

        trace!(%contact, bucket = %bucket, "adding contact");
        let alive = contact.is_alive();
        match bucket.add_live(contact) {
            Ok(()) if alive => self.stats.live_added += 1,
            Ok(()) => self.stats.unknown_added += 1,
            Err(err) => Self::invariant_violated(err),
        }
    }

    fn update_existing(&mut self, key: Kuid, existing: Contact, incoming: Contact) -> Option<Ping> {
        debug_assert_eq!(existing.node_id(), incoming.node_id());

        if existing.is_local() && !incoming.is_local() {
            // The other node is expected to pick a new identifier.
            warn!(contact = %incoming, "contact collides with the local node identifier");
            return None;
        }

        // A contact we haven't heard from directly never downgrades a live record.
        if existing.is_alive() && !incoming.is_alive() {
            trace!(%existing, "ignoring unverified update of a live contact");
            return None;
        }

        if !existing.is_alive()
            || incoming.is_local()
            || existing == incoming
            || existing.is_same_endpoint(&incoming)
        {
            return self.replace_existing(key, &existing, incoming);
        }

        // Two live endpoints claim the same identifier: keep the one we know until it stops
        // answering.
        let id = existing.node_id();
        if self.spoof_check_in_flight(&id) {
            trace!(%existing, contender = %incoming, "spoof check already in flight");
            return None;
        }

        debug!(%existing, contender = %incoming, "starting spoof check");
        self.spoof_checks.insert(id, OffsetDateTime::now_utc());
        Some(Ping::SpoofCheck {
            existing,
            contender: incoming,
        })
    }

    // Swaps the stored record for `incoming`, carrying over the history of `existing`.
    fn replace_existing(
        &mut self,
        key: Kuid,
        existing: &Contact,
        mut incoming: Contact,
    ) -> Option<Ping> {
        if let Err(err) = incoming.update_with_existing(existing) {
            error!(%err, "can't merge contact history");
            return None;
        }

        let id = incoming.node_id();
        let alive = incoming.is_alive();
        let bucket = self.buckets.get_mut(&key)?;

        let cached = bucket.contains_cached(&id);
        let cooled_down = bucket.ping_cooldown_elapsed();

        trace!(contact = %incoming, cached, "updating contact");
        if let Err(err) = bucket.update(incoming) {
            Self::invariant_violated(err);
            return None;
        }

        if alive {
            bucket.touch();
        }

        // A cached contact just proved itself, see if the live set has a slot for it.
        if cached && cooled_down {
            return bucket
                .least_recently_seen_live()
                .filter(|lrs| !lrs.is_local())
                .cloned()
                .map(Ping::Probe);
        }

        None
    }

    // Splits the bucket if it's eligible, returns `true` if it did.
    fn split(&mut self, key: Kuid) -> bool {
        let local_id = self.local_id();
        let Some(bucket) = self.buckets.get(&key) else {
            return false;
        };

        // Three conditions for splitting:
        // 1. the bucket contains the local node,
        // 2. the bucket is the smallest subtree next to the local node's path,
        // 3. the bucket isn't too deep.
        let contains_local = bucket.contains(&local_id);
        let is_smallest_subtree =
            self.smallest_subtree == Some((bucket.bucket_id(), bucket.depth()));

        if !(contains_local || is_smallest_subtree || !bucket.is_too_deep())
            || bucket.depth() >= Kuid::BITS
        {
            return false;
        }

        let Some(mut bucket) = self.buckets.remove(&key) else {
            return false;
        };

        // Caches only fill up in buckets that couldn't split, flush them regardless.
        let flushed = bucket.take_cache();

        let (mut left, mut right) = match bucket.split() {
            Ok(children) => children,
            Err((mut bucket, err)) => {
                for contact in flushed.into_iter().rev() {
                    let _ = bucket.add_cache(contact);
                }
                self.buckets.insert(key, bucket);
                Self::invariant_violated(err);

                return false;
            }
        };

        debug!(
            bucket = %key,
            depth = left.depth() - 1,
            left = left.live_size(),
            right = right.live_size(),
            "split bucket"
        );

        if contains_local {
            let sibling = if left.contains(&local_id) {
                &right
            } else {
                &left
            };
            self.smallest_subtree = Some((sibling.bucket_id(), sibling.depth()));
        }

        // Least recently seen first so the cache order survives.
        let split_bit = left.depth() - 1;
        for contact in flushed.into_iter().rev() {
            let child = if contact.node_id().is_bit_set(split_bit) {
                &mut right
            } else {
                &mut left
            };

            if let Err(err) = child.add_cache(contact) {
                Self::invariant_violated(err);
            }
        }

        self.buckets.insert(left.bucket_id(), left);
        self.buckets.insert(right.bucket_id(), right);
        self.stats.buckets += 1;

        true
    }

    fn replace_in_bucket(&mut self, key: Kuid, contact: Contact) -> Option<Ping> {
        let config = self.config;
        let bucket = self.buckets.get_mut(&key)?;

        if contact.is_alive() {
            let evictable = bucket
                .least_recently_seen_live()
                .filter(|lrs| !lrs.is_local() && (lrs.is_unknown() || lrs.is_dead()))
                .map(Contact::node_id);

            if let Some(lrs_id) = evictable {
                debug!(evicted = %lrs_id, %contact, "replacing unverified contact");
                bucket.remove_live(&lrs_id);

                match bucket.add_live(contact) {
                    Ok(()) => self.stats.live_added += 1,
                    Err(err) => Self::invariant_violated(err),
                }

                return None;
            }
        }

        trace!(%contact, bucket = %bucket, "adding contact to replacement cache");
        match bucket.add_cache(contact) {
            Ok(true) => self.stats.replacements += 1,
            Ok(false) => trace!("replacement cache kept its entries"),
            Err(err) => Self::invariant_violated(err),
        }

        // Probe the least recently seen contact, if it's gone the cache can take over.
        bucket
            .least_recently_seen_live()
            .filter(|lrs| !lrs.is_local() && !lrs.has_been_recently_alive(&config))
            .cloned()
            .map(Ping::Probe)
    }

    /// Completes a spoof check whose ping went unanswered.
    ///
    /// The trie may have changed since the check started, so the record is looked up again; if
    /// it's gone or was heard from in the meantime, nothing happens.
    pub fn spoof_check_timed_out(&mut self, existing: &Contact, contender: Contact) -> Option<Ping> {
        let id = existing.node_id();
        self.spoof_checks.remove(&id);
        let key = self.owning_key(&id)?;

        let current = match self.buckets.get(&key).and_then(|bucket| bucket.get(&id)) {
            Some(current) => current.clone(),
            None => {
                debug!(%existing, "spoof check target is gone");
                return None;
            }
        };

        if current != *existing || current.time_stamp() != existing.time_stamp() {
            debug!(%existing, "spoof check target changed in the meantime");
            return None;
        }

        info!(%existing, %contender, "contact did not respond, replacing it");
        self.replace_existing(key, &current, contender)
    }

    /// Completes a spoof check the existing contact answered, refreshing its record.
    pub fn spoof_check_answered(&mut self, refreshed: Contact) -> Option<Ping> {
        self.spoof_checks.remove(&refreshed.node_id());
        self.add(refreshed)
    }

    // A check that outlived the timeout was dropped by the caller.
    fn spoof_check_in_flight(&mut self, id: &Kuid) -> bool {
        match self.spoof_checks.get(id) {
            Some(started) if elapsed_since(*started) < self.config.timeout => true,
            Some(_) => {
                self.spoof_checks.remove(id);
                false
            }
            None => false,
        }
    }

    /// Records a failed request to a contact, evicting it once it's dead.
    ///
    /// Reports for an unknown identifier, the local node or a stale address are ignored, as is
    /// everything past the consecutive failure ceiling: at that point it's more likely this node
    /// lost its connection than every peer going away at once.
    pub fn handle_failure(&mut self, node_id: Option<Kuid>, addr: SocketAddr) {
        // Pings sent to a bare address have no identifier to blame.
        let Some(node_id) = node_id else {
            return;
        };

        if node_id == self.local_id() {
            return;
        }

        let config = self.config;
        let Some(key) = self.owning_key(&node_id) else {
            return;
        };
        let Some(bucket) = self.buckets.get_mut(&key) else {
            return;
        };
        let Some(contact) = bucket.get_mut(&node_id) else {
            return;
        };

        if contact.contact_addr() != addr {
            trace!(%contact, %addr, "ignoring failure for a stale address");
            return;
        }

        if self.consecutive_failures >= config.max_consecutive_failures {
            trace!(%contact, "ignoring failure, we appear to be disconnected");
            return;
        }

        self.consecutive_failures += 1;
        contact.handle_failure(&config);

        if !contact.is_dead() {
            return;
        }

        self.stats.dead_evicted += 1;

        if bucket.remove_live(&node_id).is_some() {
            debug!(%node_id, "evicted dead contact");

            if let Some(mut promoted) = bucket.pop_most_recently_seen_cached() {
                // It has to prove itself again once it's live.
                promoted.unknown();
                debug!(contact = %promoted, "promoting cached contact");

                match bucket.add_live(promoted) {
                    Ok(()) => bucket.touch(),
                    Err(err) => Self::invariant_violated(err),
                }
            }
        } else {
            debug!(%node_id, "evicted dead contact from cache");
            bucket.remove_cached(&node_id);
        }
    }

    /// Removes a contact, the local node can't be removed.
    pub fn remove(&mut self, id: &Kuid) -> Option<Contact> {
        if *id == self.local_id() {
            return None;
        }

        let key = self.owning_key(id)?;
        self.buckets.get_mut(&key)?.remove(id)
    }

    /// Returns the stored record for the identifier, live or cached.
    pub fn get(&self, id: &Kuid) -> Option<Contact> {
        let key = self.owning_key(id)?;
        self.buckets.get(&key)?.get(id).cloned()
    }

    /// Returns `true` if the identifier falls in the local node's bucket.
    pub fn is_close_to_local(&self, id: &Kuid) -> bool {
        self.owning_key(id)
            .and_then(|key| self.buckets.get(&key))
            .map(|bucket| bucket.contains(&self.local_id()))
            .unwrap_or(false)
    }

    /// Returns up to `count` live contacts ordered by ascending distance to `target`.
    ///
    /// The local node is included like any other contact.
    pub fn select(&self, target: &Kuid, count: usize) -> Vec<Contact> {
        let mut contacts = Vec::with_capacity(count);

        for key in self.keys_by_distance(target) {
            let remaining = count - contacts.len();
            if remaining == 0 {
                break;
            }

            if let Some(bucket) = self.buckets.get(&key) {
                contacts.extend(bucket.select(target, remaining));
            }
        }

        contacts
    }

    /// Returns the live contact closest to `target`.
    pub fn select_one(&self, target: &Kuid) -> Option<Contact> {
        self.select(target, 1).pop()
    }

    /// Returns up to `count` remote contacts without failures ordered by ascending distance to
    /// `target`, marking the buckets they came from as touched since they're about to be
    /// contacted.
    pub fn select_for_lookup(&mut self, target: &Kuid, count: usize) -> Vec<Contact> {
        let mut contacts = Vec::with_capacity(count);

        for key in self.keys_by_distance(target) {
            let remaining = count - contacts.len();
            if remaining == 0 {
                break;
            }

            let Some(bucket) = self.buckets.get_mut(&key) else {
                continue;
            };

            contacts.extend(
                bucket
                    .select(target, bucket.live_size())
                    .into_iter()
                    .filter(|contact| !contact.is_local() && !contact.has_failed())
                    .take(remaining),
            );
            bucket.touch();
        }

        contacts
    }

    /// Every live and cached contact, for persisting the table.
    pub fn contacts(&self) -> Vec<Contact> {
        let mut contacts = self.live_contacts();
        contacts.extend(self.cached_contacts());
        contacts
    }

    pub fn live_contacts(&self) -> Vec<Contact> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.live_contacts().cloned())
            .collect()
    }

    pub fn cached_contacts(&self) -> Vec<Contact> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.cached_contacts().cloned())
            .collect()
    }

    /// Snapshots of the buckets, ordered by bucket identifier.
    pub fn buckets(&self) -> Vec<Bucket> {
        self.buckets.values().cloned().collect()
    }

    /// Adds previously persisted contacts. Their liveness is unverified, so they're added as
    /// unknown.
    pub fn load<I>(&mut self, contacts: I) -> Vec<Ping>
    where
        I: IntoIterator<Item = Contact>,
    {
        contacts
            .into_iter()
            .filter(|contact| !contact.is_local())
            .filter_map(|mut contact| {
                contact.unknown();
                self.add(contact)
            })
            .collect()
    }

    /// Returns random identifiers to look up so that stale or under-filled buckets get
    /// repopulated.
    ///
    /// The local node's bucket is skipped unless bootstrapping, in which case every bucket gets a
    /// target regardless of its state.
    pub fn refresh_targets(&mut self, bootstrapping: bool) -> Vec<Kuid> {
        let local_id = self.local_id();

        let targets: Vec<Kuid> = self
            .buckets
            .values()
            .filter(|bucket| {
                bootstrapping || (!bucket.contains(&local_id) && bucket.needs_refresh())
            })
            .map(|bucket| {
                let target = Kuid::random_with_prefix(&bucket.bucket_id(), bucket.depth());
                trace!(bucket = %bucket, %target, "refreshing bucket");
                target
            })
            .collect();

        debug!(count = targets.len(), bootstrapping, "computed refresh targets");
        self.stats.refresh_targets += targets.len() as u64;

        targets
    }

    /// Drops every contact and bucket, leaving only the local node.
    pub fn clear(&mut self) {
        self.init();
    }
}

impl fmt::Display for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Local: {}", self.local)?;

        for bucket in self.buckets.values() {
            writeln!(f, "{bucket}")?;
        }

        writeln!(f, "Total Buckets: {}", self.buckets.len())?;
        writeln!(
            f,
            "Total Live Contacts: {}",
            self.buckets.values().map(Bucket::live_size).sum::<usize>()
        )?;
        writeln!(
            f,
            "Total Cached Contacts: {}",
            self.buckets.values().map(Bucket::cache_size).sum::<usize>()
        )
    }
}
