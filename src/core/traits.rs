use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::contact::Contact;

/// Why a ping didn't produce a response.
#[derive(Debug, Error)]
pub enum PingError {
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The network capability the routing table needs from its environment.
///
/// Kadtrie doesn't make any assumptions about the wire protocol, it only needs to be able to ask
/// whether a contact is still there. Implementations should refresh the contact from the response
/// (address, RTT, version) and mark it alive before returning it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a ping to the contact and waits for the response.
    async fn ping(&self, contact: &Contact) -> Result<Contact, PingError>;
}
