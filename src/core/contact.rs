//! Peer records and their liveness state machine.

use std::{
    fmt,
    hash::{Hash, Hasher},
    net::SocketAddr,
    time::Duration,
};

use thiserror::Error;
use time::OffsetDateTime;

use crate::core::{config::Config, id::Kuid};

/// Rejected contact constructions and merges.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContactError {
    #[error("contact address {0} has port 0 and no source address to fall back to")]
    Unreachable(SocketAddr),
    #[error("cannot merge history of {existing} into {contact}")]
    IdMismatch { contact: Kuid, existing: Kuid },
}

/// Whether a contact describes this node or a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Local,
    Remote,
}

/// The liveness of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Unknown,
    Alive,
    Dead,
}

/// A four-character vendor code, e.g. `LIME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Vendor(pub [u8; 4]);

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '.' };
            write!(f, "{c}")?;
        }

        Ok(())
    }
}

/// Returns how long ago `then` was, zero if it lies in the future.
pub(crate) fn elapsed_since(then: OffsetDateTime) -> Duration {
    Duration::try_from(OffsetDateTime::now_utc() - then).unwrap_or_default()
}

/// A node in the network: identity, addresses and liveness history.
///
/// Equality (and hashing) only considers the node identifier and the contact address.
#[derive(Debug, Clone)]
pub struct Contact {
    role: Role,
    node_id: Kuid,
    contact_addr: SocketAddr,
    source_addr: Option<SocketAddr>,
    vendor: Vendor,
    version: u16,
    instance_id: u8,
    firewalled: bool,
    rtt: Option<Duration>,
    time_stamp: Option<OffsetDateTime>,
    last_failed: Option<OffsetDateTime>,
    failures: u32,
    state: State,
}

impl Contact {
    /// Creates the contact describing this node.
    pub fn local(node_id: Kuid, contact_addr: SocketAddr) -> Self {
        Self {
            role: Role::Local,
            node_id,
            contact_addr,
            source_addr: None,
            vendor: Vendor::default(),
            version: 0,
            instance_id: 0,
            firewalled: false,
            rtt: None,
            time_stamp: None,
            last_failed: None,
            failures: 0,
            state: State::Unknown,
        }
    }

    /// Starts building a remote contact.
    pub fn builder(node_id: Kuid, contact_addr: SocketAddr) -> ContactBuilder {
        ContactBuilder {
            node_id,
            contact_addr,
            source_addr: None,
            vendor: Vendor::default(),
            version: 0,
            instance_id: 0,
            firewalled: false,
            rtt: None,
            alive: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_local(&self) -> bool {
        self.role == Role::Local
    }

    pub fn node_id(&self) -> Kuid {
        self.node_id
    }

    /// The address requests to this node should be sent to.
    pub fn contact_addr(&self) -> SocketAddr {
        self.contact_addr
    }

    /// The address the last message from this node arrived from.
    pub fn source_addr(&self) -> Option<SocketAddr> {
        self.source_addr
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn instance_id(&self) -> u8 {
        self.instance_id
    }

    pub fn is_firewalled(&self) -> bool {
        self.firewalled
    }

    /// The last measured round trip time, `None` if unknown.
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn set_round_trip_time(&mut self, rtt: Duration) {
        if self.is_local() {
            return;
        }

        self.rtt = Some(rtt);
    }

    /// The last time this node was successfully contacted, `None` if never.
    ///
    /// The local node always reports the current time so it never looks stale next to a peer.
    pub fn time_stamp(&self) -> Option<OffsetDateTime> {
        match self.role {
            Role::Local => Some(OffsetDateTime::now_utc()),
            Role::Remote => self.time_stamp,
        }
    }

    pub fn last_failed_time(&self) -> Option<OffsetDateTime> {
        self.last_failed
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn has_failed(&self) -> bool {
        self.failures > 0
    }

    pub fn state(&self) -> State {
        match self.role {
            Role::Local => State::Unknown,
            Role::Remote => self.state,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state() == State::Alive
    }

    pub fn is_unknown(&self) -> bool {
        self.state() == State::Unknown
    }

    pub fn is_dead(&self) -> bool {
        self.state() == State::Dead
    }

    /// Records a successful exchange with the node.
    pub fn alive(&mut self) {
        if self.is_local() {
            return;
        }

        self.state = State::Alive;
        self.failures = 0;
        self.time_stamp = Some(OffsetDateTime::now_utc());
    }

    /// Forgets everything known about the node's liveness.
    pub fn unknown(&mut self) {
        if self.is_local() {
            return;
        }

        self.state = State::Unknown;
        self.failures = 0;
        self.time_stamp = None;
    }

    /// Records a failed exchange, declaring the node dead once it has failed too often.
    ///
    /// A node that has never been alive is given fewer chances than one that has.
    pub fn handle_failure(&mut self, config: &Config) {
        if self.is_local() {
            return;
        }

        self.failures = self.failures.saturating_add(1);
        self.last_failed = Some(OffsetDateTime::now_utc());

        let max_failures = if self.time_stamp.is_some() {
            config.max_alive_failures
        } else {
            config.max_unknown_failures
        };

        if self.failures >= max_failures {
            self.state = State::Dead;
        }
    }

    /// Returns `true` if the node was contacted within the minimum reconnection window.
    pub fn has_been_recently_alive(&self, config: &Config) -> bool {
        self.time_stamp()
            .map(|ts| elapsed_since(ts) < config.min_reconnection_window)
            .unwrap_or(false)
    }

    /// Timeout to use for the next request to this node.
    ///
    /// Scales with the round trip time and grows with every failure, clamped to the configured
    /// bounds; the ceiling applies while the RTT is unknown or the node isn't alive.
    pub fn adaptive_timeout(&self, config: &Config) -> Duration {
        match self.rtt {
            Some(rtt) if self.is_alive() && !rtt.is_zero() => {
                let factor = 2u32.saturating_add(self.failures);
                rtt.saturating_mul(factor)
                    .clamp(config.min_timeout, config.timeout)
            }
            _ => config.timeout,
        }
    }

    /// Carries the history of a previous record for the same node over to this one.
    pub fn update_with_existing(&mut self, existing: &Contact) -> Result<(), ContactError> {
        if self.node_id != existing.node_id {
            return Err(ContactError::IdMismatch {
                contact: self.node_id,
                existing: existing.node_id,
            });
        }

        if self.is_local() {
            return Ok(());
        }

        if self.rtt.is_none() {
            self.rtt = existing.rtt;
        }

        // Only keep our own liveness if it's fresher than what we knew before.
        if !self.is_alive() || self.time_stamp <= existing.time_stamp() {
            self.time_stamp = existing.time_stamp();
            self.last_failed = existing.last_failed;
            self.failures = existing.failures;
        }

        Ok(())
    }

    /// Returns `true` if both records point at the same endpoint: the same address, or the same
    /// port on loopback interfaces of this machine.
    pub fn is_same_endpoint(&self, other: &Contact) -> bool {
        let (a, b) = (self.contact_addr, other.contact_addr);
        a == b || (a.ip().is_loopback() && b.ip().is_loopback() && a.port() == b.port())
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id && self.contact_addr == other.contact_addr
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
        self.contact_addr.hash(state);
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {:?}, failures: {}",
            self.node_id,
            self.contact_addr,
            self.state(),
            self.failures
        )?;

        if self.is_local() {
            write!(f, ", local")?;
        }

        if self.firewalled {
            write!(f, ", firewalled")?;
        }

        write!(f, ")")
    }
}

/// Builder for remote contacts, validating the address invariants on [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct ContactBuilder {
    node_id: Kuid,
    contact_addr: SocketAddr,
    source_addr: Option<SocketAddr>,
    vendor: Vendor,
    version: u16,
    instance_id: u8,
    firewalled: bool,
    rtt: Option<Duration>,
    alive: bool,
}

impl ContactBuilder {
    pub fn source_addr(mut self, addr: SocketAddr) -> Self {
        self.source_addr = Some(addr);
        self
    }

    pub fn vendor(mut self, vendor: Vendor) -> Self {
        self.vendor = vendor;
        self
    }

    pub fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    pub fn instance_id(mut self, instance_id: u8) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn firewalled(mut self, firewalled: bool) -> Self {
        self.firewalled = firewalled;
        self
    }

    pub fn round_trip_time(mut self, rtt: Duration) -> Self {
        self.rtt = Some(rtt);
        self
    }

    /// Marks the contact as heard from directly, i.e. built from a message it sent us.
    pub fn alive(mut self) -> Self {
        self.alive = true;
        self
    }

    /// Builds the contact.
    ///
    /// A contact address with port 0 can't be contacted directly: the contact is forced to
    /// firewalled and its contact address replaced by the source address, which must be known.
    pub fn build(self) -> Result<Contact, ContactError> {
        let mut contact_addr = self.contact_addr;
        let mut firewalled = self.firewalled;

        if contact_addr.port() == 0 {
            match self.source_addr {
                Some(source) if source.port() != 0 => {
                    contact_addr = source;
                    firewalled = true;
                }
                _ => return Err(ContactError::Unreachable(contact_addr)),
            }
        }

        let (state, time_stamp) = if self.alive {
            (State::Alive, Some(OffsetDateTime::now_utc()))
        } else {
            (State::Unknown, None)
        };

        Ok(Contact {
            role: Role::Remote,
            node_id: self.node_id,
            contact_addr,
            source_addr: self.source_addr,
            vendor: self.vendor,
            version: self.version,
            instance_id: self.instance_id,
            firewalled,
            rtt: self.rtt,
            time_stamp,
            last_failed: None,
            failures: 0,
            state,
        })
    }
}
