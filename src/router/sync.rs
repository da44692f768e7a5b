use std::{fmt, net::SocketAddr, sync::Arc};

use parking_lot::RwLock;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, trace, warn};

use crate::{
    core::{
        config::Config,
        contact::Contact,
        id::Kuid,
        traits::{PingError, Transport},
    },
    router::{Bucket, Ping, RouteTable, RoutingStats},
};

#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
/// A routing table implementation suitable for use in async contexts.
///
/// It wraps [`RouteTable`] and sends the pings it asks for over the supplied [`Transport`],
/// feeding the outcomes back in. Pings run on spawned tasks, so the methods that can produce
/// them must be called from within a Tokio runtime.
pub struct SyncRouteTable<T> {
    route_table: Arc<RwLock<RouteTable>>,
    transport: Arc<T>,
}

impl<T> Clone for SyncRouteTable<T> {
    fn clone(&self) -> Self {
        Self {
            route_table: Arc::clone(&self.route_table),
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T> fmt::Debug for SyncRouteTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRouteTable")
            .field("route_table", &*self.route_table.read())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> SyncRouteTable<T> {
    pub fn new(route_table: RouteTable, transport: T) -> Self {
        Self {
            route_table: Arc::new(RwLock::new(route_table)),
            transport: Arc::new(transport),
        }
    }

    pub fn local_id(&self) -> Kuid {
        self.route_table.read().local_id()
    }

    pub fn local_node(&self) -> Contact {
        self.route_table.read().local_node().clone()
    }

    pub fn config(&self) -> Config {
        *self.route_table.read().config()
    }

    pub fn stats(&self) -> RoutingStats {
        self.route_table.read().stats()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns a copy of the current state of the table.
    pub fn snapshot(&self) -> RouteTable {
        self.route_table.read().clone()
    }

    /// Adds a freshly observed contact, returning the handle of the ping task if one was needed.
    pub fn add(&self, contact: Contact) -> Option<JoinHandle<()>> {
        let ping = self.route_table.write().add(contact)?;
        Some(self.dispatch(ping))
    }

    /// Adds previously persisted contacts, returning the handles of the resulting ping tasks.
    pub fn load(&self, contacts: Vec<Contact>) -> Vec<JoinHandle<()>> {
        let pings = self.route_table.write().load(contacts);
        pings.into_iter().map(|ping| self.dispatch(ping)).collect()
    }

    pub fn handle_failure(&self, node_id: Option<Kuid>, addr: SocketAddr) {
        self.route_table.write().handle_failure(node_id, addr)
    }

    pub fn remove(&self, id: &Kuid) -> Option<Contact> {
        self.route_table.write().remove(id)
    }

    pub fn get(&self, id: &Kuid) -> Option<Contact> {
        self.route_table.read().get(id)
    }

    pub fn is_close_to_local(&self, id: &Kuid) -> bool {
        self.route_table.read().is_close_to_local(id)
    }

    pub fn select(&self, target: &Kuid, count: usize) -> Vec<Contact> {
        self.route_table.read().select(target, count)
    }

    pub fn select_one(&self, target: &Kuid) -> Option<Contact> {
        self.route_table.read().select_one(target)
    }

    pub fn select_for_lookup(&self, target: &Kuid, count: usize) -> Vec<Contact> {
        self.route_table.write().select_for_lookup(target, count)
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.route_table.read().contacts()
    }

    pub fn live_contacts(&self) -> Vec<Contact> {
        self.route_table.read().live_contacts()
    }

    pub fn cached_contacts(&self) -> Vec<Contact> {
        self.route_table.read().cached_contacts()
    }

    pub fn buckets(&self) -> Vec<Bucket> {
        self.route_table.read().buckets()
    }

    pub fn refresh_targets(&self, bootstrapping: bool) -> Vec<Kuid> {
        self.route_table.write().refresh_targets(bootstrapping)
    }

    pub fn clear(&self) {
        self.route_table.write().clear()
    }

    /// Pings the contact, bounded by its adaptive timeout.
    ///
    /// On success the returned contact is marked alive and carries the measured round trip time.
    pub async fn ping(&self, contact: &Contact) -> Result<Contact, PingError> {
        let timeout = contact.adaptive_timeout(&self.config());
        let start = Instant::now();

        let mut refreshed = tokio::time::timeout(timeout, self.transport.ping(contact))
            .await
            .map_err(|_| PingError::Timeout(timeout))??;

        refreshed.set_round_trip_time(start.elapsed());
        refreshed.alive();

        Ok(refreshed)
    }

    fn dispatch(&self, ping: Ping) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move { table.run_pings(ping).await })
    }

    // Keeps the lock out of the async context.
    fn with_table<R>(&self, f: impl FnOnce(&mut RouteTable) -> R) -> R {
        f(&mut self.route_table.write())
    }

    // Sends the ping and whatever follow-up pings the outcome produces.
    async fn run_pings(&self, mut ping: Ping) {
        loop {
            let next = match ping {
                Ping::Probe(contact) => match self.ping(&contact).await {
                    Ok(refreshed) => {
                        trace!(contact = %refreshed, "probe answered");
                        self.with_table(|rt| rt.add(refreshed))
                    }
                    Err(err) => {
                        debug!(%contact, %err, "probe failed");
                        self.with_table(|rt| {
                            rt.handle_failure(Some(contact.node_id()), contact.contact_addr())
                        });
                        None
                    }
                },
                Ping::SpoofCheck {
                    existing,
                    contender,
                } => match self.ping(&existing).await {
                    Ok(refreshed) => {
                        warn!(
                            %existing,
                            %contender,
                            "contact answered, rejecting another node claiming its identifier"
                        );
                        self.with_table(|rt| rt.spoof_check_answered(refreshed))
                    }
                    Err(err) => {
                        debug!(%existing, %err, "spoof check failed");
                        self.with_table(|rt| rt.spoof_check_timed_out(&existing, contender))
                    }
                },
            };

            match next {
                Some(follow_up) => ping = follow_up,
                None => break,
            }
        }
    }
}
