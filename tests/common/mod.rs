use std::net::SocketAddr;

use kadtrie::{Config, Contact, Kuid};
use tracing_subscriber::{fmt, EnvFilter};

#[cfg(feature = "sync")]
pub use self::transport::MockTransport;

#[allow(dead_code)]
pub fn enable_tracing() {
    fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

#[allow(dead_code)]
pub fn localhost_with_port(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// An identifier with the supplied leading byte, the rest zero.
#[allow(dead_code)]
pub fn id_with_first_byte(byte: u8) -> Kuid {
    let mut bytes = [0u8; Kuid::BYTES];
    bytes[0] = byte;
    Kuid::new(bytes)
}

#[allow(dead_code)]
pub fn alive_contact(id: Kuid, addr: SocketAddr) -> Contact {
    Contact::builder(id, addr).alive().build().unwrap()
}

/// Two live contacts per bucket, buckets off the local path stop splitting at depth 1.
#[allow(dead_code)]
pub fn small_config() -> Config {
    Config {
        k: 2,
        cache_size: 2,
        depth_limit: 1,
        ..Default::default()
    }
}

#[cfg(feature = "sync")]
mod transport {
    use std::{collections::HashSet, net::SocketAddr, time::Duration};

    use kadtrie::{Contact, Kuid, PingError, Transport};
    use parking_lot::RwLock;
    use tracing::*;

    /// Answers pings to responsive addresses, stays silent for silent ones and fails the rest
    /// right away.
    #[derive(Default)]
    pub struct MockTransport {
        pub responsive: RwLock<HashSet<SocketAddr>>,
        pub silent: RwLock<HashSet<SocketAddr>>,
        pub pinged: RwLock<Vec<Kuid>>,
    }

    #[allow(dead_code)]
    impl MockTransport {
        pub fn responding_to(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
            Self {
                responsive: RwLock::new(addrs.into_iter().collect()),
                ..Default::default()
            }
        }

        pub fn silent_on(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
            Self {
                silent: RwLock::new(addrs.into_iter().collect()),
                ..Default::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn ping(&self, contact: &Contact) -> Result<Contact, PingError> {
            info!("pinging {}", contact);
            self.pinged.write().push(contact.node_id());

            let addr = contact.contact_addr();
            if self.silent.read().contains(&addr) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }

            if self.responsive.read().contains(&addr) {
                Ok(contact.clone())
            } else {
                Err(PingError::Unreachable(addr.to_string()))
            }
        }
    }
}
