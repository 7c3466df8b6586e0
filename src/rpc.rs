//! Transport seam.
//!
//! The server never talks to the network directly: it hands
//! [`Envelope`]-shaped messages to an [`Rpc`] implementation and receives
//! inbound messages through `RaftServer::dispatch`. All sends are
//! fire-and-forget; responses arrive as separate inbound messages, in any
//! order, possibly duplicated — the decision core is idempotent against
//! both.

use crate::error::Result;
use crate::message::Message;
use crate::types::{ServerAddress, ServerId};
use async_trait::async_trait;

/// Outbound side of the transport.
#[async_trait]
pub trait Rpc: Send + Sync {
    /// Send one protocol message to a peer. Failures are swallowed by
    /// the caller: periodic replication retries cover lost messages.
    async fn send(&self, to: ServerId, message: Message) -> Result<()>;

    /// A configuration added a member; the transport should establish
    /// whatever connection state `address.info` describes.
    async fn add_server(&self, address: ServerAddress) -> Result<()>;

    /// A committed configuration removed a member; its connection state
    /// can be torn down.
    async fn remove_server(&self, id: ServerId) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;

    /// Captures everything sent, for assertions.
    #[derive(Default)]
    pub struct CapturingRpc {
        pub sent: Mutex<Vec<(ServerId, Message)>>,
        pub added: Mutex<Vec<ServerAddress>>,
        pub removed: Mutex<Vec<ServerId>>,
    }

    #[async_trait]
    impl Rpc for CapturingRpc {
        async fn send(&self, to: ServerId, message: Message) -> Result<()> {
            self.sent.lock().push((to, message));
            Ok(())
        }

        async fn add_server(&self, address: ServerAddress) -> Result<()> {
            self.added.lock().push(address);
            Ok(())
        }

        async fn remove_server(&self, id: ServerId) -> Result<()> {
            self.removed.lock().push(id);
            Ok(())
        }
    }
}
