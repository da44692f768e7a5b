//! Buckets: the nodes of the routing trie.

use std::{
    collections::HashMap,
    fmt,
    num::NonZeroUsize,
    time::Duration,
};

use lru::LruCache;
use thiserror::Error;
use time::OffsetDateTime;

use crate::core::{
    config::Config,
    contact::{elapsed_since, Contact, State},
    id::Kuid,
};

/// Violations of the bucket invariants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BucketError {
    #[error("{id} does not fall under bucket {bucket_id}/{depth}")]
    PrefixMismatch {
        id: Kuid,
        bucket_id: Kuid,
        depth: usize,
    },
    #[error("the live set of bucket {0} is full")]
    LiveFull(Kuid),
    #[error("{0} is already present in the bucket")]
    Duplicate(Kuid),
    #[error("{0} is not present in the bucket")]
    NotPresent(Kuid),
    #[error("bucket {0} can't be split while its cache holds contacts")]
    CacheNotEmpty(Kuid),
    #[error("bucket {0} is already at the maximum depth")]
    MaxDepth(Kuid),
}

/// A node of the routing trie covering every identifier that starts with the first `depth` bits
/// of `bucket_id`.
///
/// Holds at most `k` live contacts used for routing plus a bounded replacement cache of contacts
/// waiting for a live slot to open up. A contact is never in both.
pub struct Bucket {
    bucket_id: Kuid,
    depth: usize,
    config: Config,
    live: HashMap<Kuid, Contact>,
    // Ordered from most to least recently seen.
    cache: LruCache<Kuid, Contact>,
    last_touched: Option<OffsetDateTime>,
}

impl Bucket {
    /// Creates an empty bucket.
    pub(crate) fn new(bucket_id: Kuid, depth: usize, config: Config) -> Self {
        let cap = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            bucket_id: bucket_id.prefix(depth),
            depth,
            config,
            live: HashMap::with_capacity(config.k),
            cache: LruCache::new(cap),
            last_touched: None,
        }
    }

    pub fn bucket_id(&self) -> Kuid {
        self.bucket_id
    }

    /// The prefix length in bits.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The last time a live contact in this bucket was heard from, `None` if never.
    pub fn last_touched(&self) -> Option<OffsetDateTime> {
        self.last_touched
    }

    pub(crate) fn touch(&mut self) {
        self.last_touched = Some(OffsetDateTime::now_utc());
    }

    /// Returns `true` if the identifier falls within this bucket's range.
    pub fn contains(&self, id: &Kuid) -> bool {
        self.bucket_id.shares_prefix(id, self.depth)
    }

    pub fn get(&self, id: &Kuid) -> Option<&Contact> {
        self.live.get(id).or_else(|| self.cache.peek(id))
    }

    pub(crate) fn get_mut(&mut self, id: &Kuid) -> Option<&mut Contact> {
        match self.live.get_mut(id) {
            Some(contact) => Some(contact),
            None => self.cache.peek_mut(id),
        }
    }

    pub fn contains_live(&self, id: &Kuid) -> bool {
        self.live.contains_key(id)
    }

    pub fn contains_cached(&self, id: &Kuid) -> bool {
        self.cache.contains(id)
    }

    pub fn live_size(&self) -> usize {
        self.live.len()
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn is_live_full(&self) -> bool {
        self.live.len() >= self.config.k
    }

    pub fn is_cache_full(&self) -> bool {
        self.cache.len() >= self.cache.cap().get()
    }

    /// The live contacts, in no particular order.
    pub fn live_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.live.values()
    }

    /// The cached contacts, most recently seen first.
    pub fn cached_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.cache.iter().map(|(_, contact)| contact)
    }

    fn check_prefix(&self, id: &Kuid) -> Result<(), BucketError> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(BucketError::PrefixMismatch {
                id: *id,
                bucket_id: self.bucket_id,
                depth: self.depth,
            })
        }
    }

    /// Inserts a contact into the live set, which must have room for it.
    pub(crate) fn add_live(&mut self, contact: Contact) -> Result<(), BucketError> {
        let id = contact.node_id();
        self.check_prefix(&id)?;

        if self.is_live_full() {
            return Err(BucketError::LiveFull(self.bucket_id));
        }

        if self.get(&id).is_some() {
            return Err(BucketError::Duplicate(id));
        }

        if contact.is_alive() {
            self.touch();
        }

        self.live.insert(id, contact);

        Ok(())
    }

    /// Inserts a contact into the replacement cache, returning `false` if it was turned away.
    ///
    /// When the cache is full its least recently seen entry makes room, unless that entry is
    /// alive and recently seen while the newcomer isn't.
    pub(crate) fn add_cache(&mut self, contact: Contact) -> Result<bool, BucketError> {
        let id = contact.node_id();
        self.check_prefix(&id)?;

        if self.contains_live(&id) {
            return Err(BucketError::Duplicate(id));
        }

        if self.cache.contains(&id) {
            self.cache.put(id, contact);
            return Ok(true);
        }

        if self.is_cache_full() {
            let keep_lrs = match self.cache.peek_lru() {
                Some((_, lrs)) => {
                    lrs.is_alive()
                        && lrs.has_been_recently_alive(&self.config)
                        && !contact.is_alive()
                }
                None => false,
            };

            if keep_lrs {
                return Ok(false);
            }

            self.cache.pop_lru();
        }

        self.cache.put(id, contact);

        Ok(true)
    }

    /// Replaces the stored record for the contact's identifier, returning the previous one.
    ///
    /// Live contacts keep their slot; cached contacts become the most recently seen entry.
    pub(crate) fn update(&mut self, contact: Contact) -> Result<Contact, BucketError> {
        let id = contact.node_id();

        if let Some(existing) = self.live.get_mut(&id) {
            return Ok(std::mem::replace(existing, contact));
        }

        if self.cache.contains(&id) {
            return self
                .cache
                .put(id, contact)
                .ok_or(BucketError::NotPresent(id));
        }

        Err(BucketError::NotPresent(id))
    }

    pub(crate) fn remove_live(&mut self, id: &Kuid) -> Option<Contact> {
        self.live.remove(id)
    }

    pub(crate) fn remove_cached(&mut self, id: &Kuid) -> Option<Contact> {
        self.cache.pop(id)
    }

    pub(crate) fn remove(&mut self, id: &Kuid) -> Option<Contact> {
        self.remove_live(id).or_else(|| self.remove_cached(id))
    }

    /// The live contact heard from the longest time ago; never-seen contacts come first and ties
    /// are broken by identifier.
    pub fn least_recently_seen_live(&self) -> Option<&Contact> {
        self.live.values().min_by(|a, b| {
            a.time_stamp()
                .cmp(&b.time_stamp())
                .then_with(|| a.node_id().cmp(&b.node_id()))
        })
    }

    pub fn most_recently_seen_cached(&self) -> Option<&Contact> {
        self.cache.iter().next().map(|(_, contact)| contact)
    }

    /// Removes and returns the most recently seen cached contact.
    pub(crate) fn pop_most_recently_seen_cached(&mut self) -> Option<Contact> {
        let id = self.most_recently_seen_cached()?.node_id();
        self.cache.pop(&id)
    }

    /// Empties the replacement cache, most recently seen first.
    pub(crate) fn take_cache(&mut self) -> Vec<Contact> {
        let mut flushed = Vec::with_capacity(self.cache.len());
        while let Some((_, contact)) = self.cache.pop_lru() {
            flushed.push(contact);
        }
        flushed.reverse();
        flushed
    }

    /// Returns up to `count` live contacts ordered by ascending distance to `target`.
    pub fn select(&self, target: &Kuid, count: usize) -> Vec<Contact> {
        let mut contacts: Vec<&Contact> = self.live.values().collect();
        // Identifiers are unique within a bucket, so the order is total.
        contacts.sort_unstable_by_key(|contact| contact.node_id().xor(target));
        contacts.into_iter().take(count).cloned().collect()
    }

    /// Splits the bucket along its next bit into a left (bit unset) and a right (bit set) child.
    ///
    /// The cache must be empty; live contacts are moved to the child matching their identifier.
    pub(crate) fn split(self) -> Result<(Bucket, Bucket), (Bucket, BucketError)> {
        if !self.cache.is_empty() {
            let err = BucketError::CacheNotEmpty(self.bucket_id);
            return Err((self, err));
        }

        if self.depth >= Kuid::BITS {
            let err = BucketError::MaxDepth(self.bucket_id);
            return Err((self, err));
        }

        let depth = self.depth + 1;
        let mut left = Bucket::new(self.bucket_id.unset_bit(self.depth), depth, self.config);
        let mut right = Bucket::new(self.bucket_id.set_bit(self.depth), depth, self.config);
        left.last_touched = self.last_touched;
        right.last_touched = self.last_touched;

        let parent_size = self.live.len();
        for (id, contact) in self.live {
            if id.is_bit_set(self.depth) {
                right.live.insert(id, contact);
            } else {
                left.live.insert(id, contact);
            }
        }

        debug_assert_eq!(left.live_size() + right.live_size(), parent_size);

        Ok((left, right))
    }

    /// Returns `true` if the bucket went idle for longer than the refresh period, isn't filled
    /// up or still holds dead contacts.
    pub fn needs_refresh(&self) -> bool {
        let idle = self
            .last_touched
            .map(elapsed_since)
            .unwrap_or(Duration::MAX);

        idle > self.config.refresh_period
            || self.live.len() < self.config.k
            || self.live.values().any(|contact| contact.state() == State::Dead)
    }

    /// Returns `true` if the bucket has passed the depth limit.
    pub fn is_too_deep(&self) -> bool {
        self.depth >= self.config.depth_limit
    }

    /// Returns `true` if the bucket has been idle for at least the ping cool-down.
    pub(crate) fn ping_cooldown_elapsed(&self) -> bool {
        self.last_touched
            .map(|touched| elapsed_since(touched) >= self.config.bucket_ping_cooldown)
            .unwrap_or(true)
    }
}

impl Clone for Bucket {
    fn clone(&self) -> Self {
        let mut cache = LruCache::new(self.cache.cap());
        // Insert least recently seen first to preserve the order.
        for (id, contact) in self.cache.iter().rev() {
            cache.put(*id, contact.clone());
        }

        Self {
            bucket_id: self.bucket_id,
            depth: self.depth,
            config: self.config,
            live: self.live.clone(),
            cache,
            last_touched: self.last_touched,
        }
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("bucket_id", &self.bucket_id)
            .field("depth", &self.depth)
            .field("live", &self.live.len())
            .field("cache", &self.cache.len())
            .field("last_touched", &self.last_touched)
            .finish()
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} (live: {}/{}, cached: {})",
            self.bucket_id,
            self.depth,
            self.live.len(),
            self.config.k,
            self.cache.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, net::SocketAddr};

    use super::*;

    fn localhost_with_port(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    // An identifier with the supplied leading byte, the rest zero.
    fn id_with_first_byte(byte: u8) -> Kuid {
        let mut bytes = [0u8; Kuid::BYTES];
        bytes[0] = byte;
        Kuid::new(bytes)
    }

    fn contact(id: Kuid, port: u16, alive: bool) -> Contact {
        let builder = Contact::builder(id, localhost_with_port(port));
        let builder = if alive { builder.alive() } else { builder };
        builder.build().unwrap()
    }

    fn small_config(k: usize, cache_size: usize) -> Config {
        Config {
            k,
            cache_size,
            ..Default::default()
        }
    }

    #[test]
    fn new_bucket() {
        let bucket = Bucket::new(Kuid::MIN, 0, Config::default());
        assert_eq!(bucket.depth(), 0);
        assert_eq!(bucket.live_size(), 0);
        assert_eq!(bucket.cache_size(), 0);
        assert!(bucket.last_touched().is_none());
        assert!(bucket.contains(&Kuid::random()));
        assert!(bucket.needs_refresh());
    }

    #[test]
    fn contains_respects_prefix() {
        // Covers 1xxx...
        let bucket = Bucket::new(id_with_first_byte(0x80), 1, Config::default());
        assert!(bucket.contains(&id_with_first_byte(0xff)));
        assert!(bucket.contains(&id_with_first_byte(0x80)));
        assert!(!bucket.contains(&id_with_first_byte(0x7f)));
    }

    #[test]
    fn add_live() {
        let mut bucket = Bucket::new(Kuid::MIN, 0, small_config(2, 2));

        assert!(bucket.add_live(contact(id_with_first_byte(1), 1, true)).is_ok());
        assert!(bucket.last_touched().is_some());
        assert!(bucket.add_live(contact(id_with_first_byte(2), 2, false)).is_ok());
        assert!(bucket.is_live_full());

        assert_eq!(
            bucket.add_live(contact(id_with_first_byte(3), 3, true)),
            Err(BucketError::LiveFull(Kuid::MIN))
        );
    }

    #[test]
    fn add_live_rejects_duplicates_and_foreign_ids() {
        let mut bucket = Bucket::new(id_with_first_byte(0x80), 1, small_config(4, 2));

        let id = id_with_first_byte(0x81);
        assert!(bucket.add_live(contact(id, 1, true)).is_ok());
        assert_eq!(
            bucket.add_live(contact(id, 2, true)),
            Err(BucketError::Duplicate(id))
        );

        assert!(matches!(
            bucket.add_live(contact(id_with_first_byte(0x01), 1, true)),
            Err(BucketError::PrefixMismatch { .. })
        ));
    }

    #[test]
    fn add_cache_evicts_least_recently_seen() {
        let mut bucket = Bucket::new(Kuid::MIN, 0, small_config(1, 2));

        let a = contact(id_with_first_byte(1), 1, false);
        let b = contact(id_with_first_byte(2), 2, false);
        let c = contact(id_with_first_byte(3), 3, false);

        assert_eq!(bucket.add_cache(a.clone()), Ok(true));
        assert_eq!(bucket.add_cache(b.clone()), Ok(true));
        assert!(bucket.is_cache_full());

        assert_eq!(bucket.add_cache(c.clone()), Ok(true));
        assert!(!bucket.contains_cached(&a.node_id()));
        assert!(bucket.contains_cached(&b.node_id()));
        assert!(bucket.contains_cached(&c.node_id()));
        assert_eq!(
            bucket.most_recently_seen_cached().map(Contact::node_id),
            Some(c.node_id())
        );
    }

    #[test]
    fn add_cache_keeps_recently_alive_over_unknown() {
        let mut bucket = Bucket::new(Kuid::MIN, 0, small_config(1, 1));

        let alive = contact(id_with_first_byte(1), 1, true);
        let unknown = contact(id_with_first_byte(2), 2, false);

        assert_eq!(bucket.add_cache(alive.clone()), Ok(true));
        assert_eq!(bucket.add_cache(unknown.clone()), Ok(false));
        assert!(bucket.contains_cached(&alive.node_id()));
        assert!(!bucket.contains_cached(&unknown.node_id()));

        // An alive newcomer still gets in.
        let newcomer = contact(id_with_first_byte(3), 3, true);
        assert_eq!(bucket.add_cache(newcomer.clone()), Ok(true));
        assert!(bucket.contains_cached(&newcomer.node_id()));
        assert!(!bucket.contains_cached(&alive.node_id()));
    }

    #[test]
    fn add_cache_rejects_live_ids() {
        let mut bucket = Bucket::new(Kuid::MIN, 0, small_config(2, 2));
        let a = contact(id_with_first_byte(1), 1, true);
        bucket.add_live(a.clone()).unwrap();

        assert_eq!(bucket.add_cache(a.clone()), Err(BucketError::Duplicate(a.node_id())));
    }

    #[test]
    fn update() {
        let mut bucket = Bucket::new(Kuid::MIN, 0, small_config(1, 2));

        let live = contact(id_with_first_byte(1), 1, false);
        let cached_a = contact(id_with_first_byte(2), 2, false);
        let cached_b = contact(id_with_first_byte(3), 3, false);
        bucket.add_live(live.clone()).unwrap();
        bucket.add_cache(cached_a.clone()).unwrap();
        bucket.add_cache(cached_b.clone()).unwrap();

        // Live update keeps the slot.
        let replaced = bucket.update(contact(live.node_id(), 10, true)).unwrap();
        assert_eq!(replaced.contact_addr(), localhost_with_port(1));
        assert!(bucket.contains_live(&live.node_id()));
        assert!(bucket.get(&live.node_id()).unwrap().is_alive());

        // Cache update moves the entry to the front.
        let replaced = bucket.update(contact(cached_a.node_id(), 20, true)).unwrap();
        assert_eq!(replaced.contact_addr(), localhost_with_port(2));
        assert_eq!(
            bucket.most_recently_seen_cached().map(Contact::contact_addr),
            Some(localhost_with_port(20))
        );

        let missing = id_with_first_byte(9);
        assert_eq!(
            bucket.update(contact(missing, 9, true)).map(|c| c.node_id()),
            Err(BucketError::NotPresent(missing))
        );
    }

    #[test]
    fn least_recently_seen_prefers_never_seen() {
        let mut bucket = Bucket::new(Kuid::MIN, 0, small_config(3, 1));

        let seen = contact(id_with_first_byte(1), 1, true);
        let never = contact(id_with_first_byte(2), 2, false);
        bucket.add_live(seen).unwrap();
        bucket.add_live(never.clone()).unwrap();

        assert_eq!(
            bucket.least_recently_seen_live().map(Contact::node_id),
            Some(never.node_id())
        );
    }

    #[test]
    fn least_recently_seen_orders_by_time_stamp() {
        let mut bucket = Bucket::new(Kuid::MIN, 0, small_config(3, 1));

        let old = contact(id_with_first_byte(9), 1, true);
        std::thread::sleep(Duration::from_millis(2));
        let new = contact(id_with_first_byte(1), 2, true);
        bucket.add_live(new).unwrap();
        bucket.add_live(old.clone()).unwrap();

        assert_eq!(
            bucket.least_recently_seen_live().map(Contact::node_id),
            Some(old.node_id())
        );
    }

    #[test]
    fn select_orders_by_distance() {
        let mut bucket = Bucket::new(Kuid::MIN, 0, small_config(4, 1));
        for (i, byte) in [0x10, 0x20, 0x30, 0x40].into_iter().enumerate() {
            bucket
                .add_live(contact(id_with_first_byte(byte), i as u16 + 1, true))
                .unwrap();
        }

        let selected: Vec<_> = bucket
            .select(&id_with_first_byte(0x31), 3)
            .iter()
            .map(Contact::node_id)
            .collect();

        assert_eq!(
            selected,
            vec![
                id_with_first_byte(0x30),
                id_with_first_byte(0x20),
                id_with_first_byte(0x10)
            ]
        );
        assert!(bucket.select(&Kuid::MIN, 0).is_empty());
    }

    #[test]
    fn split_partitions_live_contacts() {
        let mut bucket = Bucket::new(Kuid::MIN, 0, small_config(4, 1));
        for (i, byte) in [0x01, 0x7f, 0x80, 0xff].into_iter().enumerate() {
            bucket
                .add_live(contact(id_with_first_byte(byte), i as u16 + 1, true))
                .unwrap();
        }

        let (left, right) = bucket.split().unwrap();

        assert_eq!(left.depth(), 1);
        assert_eq!(right.depth(), 1);
        assert_eq!(left.bucket_id(), Kuid::MIN);
        assert_eq!(right.bucket_id(), id_with_first_byte(0x80));
        assert_eq!(left.live_size() + right.live_size(), 4);
        assert!(left.live_contacts().all(|c| !c.node_id().is_bit_set(0)));
        assert!(right.live_contacts().all(|c| c.node_id().is_bit_set(0)));
    }

    // Replaces the first `depth` bits of the identifier with those of the prefix.
    fn with_prefix(id: Kuid, prefix: &Kuid, depth: usize) -> Kuid {
        (0..depth).fold(id, |id, bit| {
            if prefix.is_bit_set(bit) {
                id.set_bit(bit)
            } else {
                id.unset_bit(bit)
            }
        })
    }

    proptest::proptest! {
        #[test]
        fn split_preserves_live_contacts(
            prefix in proptest::prelude::any::<[u8; Kuid::BYTES]>(),
            depth in 0usize..16,
            raw_ids in proptest::collection::vec(proptest::prelude::any::<[u8; Kuid::BYTES]>(), 0..32),
        ) {
            let prefix = Kuid::new(prefix).prefix(depth);
            let ids: HashSet<Kuid> = raw_ids
                .into_iter()
                .map(|bytes| with_prefix(Kuid::new(bytes), &prefix, depth))
                .collect();

            let mut bucket = Bucket::new(prefix, depth, small_config(64, 1));
            for (i, id) in ids.iter().enumerate() {
                bucket.add_live(contact(*id, i as u16 + 1, true)).unwrap();
            }

            let (left, right) = bucket.split().unwrap();

            proptest::prop_assert_eq!(left.bucket_id(), prefix);
            proptest::prop_assert_eq!(right.bucket_id(), prefix.set_bit(depth));
            proptest::prop_assert_eq!(left.live_size() + right.live_size(), ids.len());
            proptest::prop_assert!(left.live_contacts().all(|c| !c.node_id().is_bit_set(depth)));
            proptest::prop_assert!(right.live_contacts().all(|c| c.node_id().is_bit_set(depth)));

            let split_ids: HashSet<Kuid> = left
                .live_contacts()
                .chain(right.live_contacts())
                .map(Contact::node_id)
                .collect();
            proptest::prop_assert_eq!(split_ids, ids);
        }
    }

    #[test]
    fn split_requires_empty_cache() {
        let mut bucket = Bucket::new(Kuid::MIN, 0, small_config(1, 1));
        bucket.add_live(contact(id_with_first_byte(1), 1, true)).unwrap();
        bucket.add_cache(contact(id_with_first_byte(2), 2, true)).unwrap();

        let (bucket, err) = bucket.split().unwrap_err();
        assert_eq!(err, BucketError::CacheNotEmpty(Kuid::MIN));
        // The bucket is handed back untouched.
        assert_eq!(bucket.live_size(), 1);
        assert_eq!(bucket.cache_size(), 1);
    }

    #[test]
    fn split_at_max_depth_fails() {
        let bucket = Bucket::new(Kuid::MAX, Kuid::BITS, Config::default());
        assert!(matches!(
            bucket.split(),
            Err((_, BucketError::MaxDepth(_)))
        ));
    }

    #[test]
    fn take_cache_flushes_most_recent_first() {
        let mut bucket = Bucket::new(Kuid::MIN, 0, small_config(1, 3));
        for (i, byte) in [1u8, 2, 3].into_iter().enumerate() {
            bucket
                .add_cache(contact(id_with_first_byte(byte), i as u16 + 1, false))
                .unwrap();
        }

        let flushed: Vec<_> = bucket.take_cache().iter().map(Contact::node_id).collect();
        assert_eq!(
            flushed,
            vec![
                id_with_first_byte(3),
                id_with_first_byte(2),
                id_with_first_byte(1)
            ]
        );
        assert_eq!(bucket.cache_size(), 0);
    }

    #[test]
    fn needs_refresh() {
        let config = Config {
            k: 1,
            ..Default::default()
        };
        let mut bucket = Bucket::new(Kuid::MIN, 0, config);
        // Empty.
        assert!(bucket.needs_refresh());

        let id = id_with_first_byte(1);
        bucket.add_live(contact(id, 1, true)).unwrap();
        // Full and freshly touched.
        assert!(!bucket.needs_refresh());

        // Holds a dead contact.
        let config = Config::default();
        let contact = bucket.get_mut(&id).unwrap();
        for _ in 0..config.max_alive_failures {
            contact.handle_failure(&config);
        }
        assert!(bucket.needs_refresh());
    }

    #[test]
    fn needs_refresh_when_idle() {
        let config = Config {
            k: 1,
            refresh_period: Duration::ZERO,
            ..Default::default()
        };
        let mut bucket = Bucket::new(Kuid::MIN, 0, config);
        bucket
            .add_live(contact(id_with_first_byte(1), 1, true))
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert!(bucket.needs_refresh());
    }

    #[test]
    fn too_deep() {
        let config = Config {
            depth_limit: 2,
            ..Default::default()
        };
        assert!(!Bucket::new(Kuid::MIN, 1, config).is_too_deep());
        assert!(Bucket::new(Kuid::MIN, 2, config).is_too_deep());
    }

    #[test]
    fn clone_preserves_cache_order() {
        let mut bucket = Bucket::new(Kuid::MIN, 0, small_config(1, 3));
        for (i, byte) in [1u8, 2, 3].into_iter().enumerate() {
            bucket
                .add_cache(contact(id_with_first_byte(byte), i as u16 + 1, false))
                .unwrap();
        }

        let cloned = bucket.clone();
        let original: Vec<_> = bucket.cached_contacts().map(Contact::node_id).collect();
        let copied: Vec<_> = cloned.cached_contacts().map(Contact::node_id).collect();
        assert_eq!(original, copied);
    }
}
