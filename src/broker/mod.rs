//! Broker access seam.
//!
//! The services in this crate consume AMQP-style semantics (connections,
//! channels, exchanges, queues, bindings) through the traits below rather
//! than through a concrete wire client. Coordinators receive broker handles
//! as explicit dependencies, which keeps every failure path drivable from
//! tests. [`local::LocalBroker`] is the in-process implementation used by
//! the daemon and the test suite.

use crate::SbResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod local;
pub use local::LocalBroker;

/// Access ticket returned by [`BrokerChannel::access_request`].
///
/// The deployed broker variant requires the ticket on every exchange and
/// queue operation issued on the channel that obtained it.
pub type Ticket = u32;

/// Exchange types used by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

/// A message handed to a consumer (or to a channel's return handler when
/// a publish matched no binding).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: Option<String>,
    pub payload: Bytes,
}

/// Direct-routed exchange where the routing key is the consumer's server-id.
pub const EXCHANGE_TARGETED: &str = "targeted";
/// Direct-routed per-call control exchange.
pub const EXCHANGE_CALLCTL: &str = "callctl";
/// Topic exchange carrying call events, including media requests.
pub const EXCHANGE_CALLEVT: &str = "callevt";
/// Fanout exchange for cluster-wide announcements.
pub const EXCHANGE_BROADCAST: &str = "broadcast";
/// Topic exchange serving call-manager requests (auth, routing, registration).
pub const EXCHANGE_CALLMGR: &str = "callmgr";
/// Topic exchange for monitoring traffic.
pub const EXCHANGE_MONITOR: &str = "monitor";

/// The fixed exchange set declared on every channel the session manager opens.
pub const KNOWN_EXCHANGES: &[(&str, ExchangeKind)] = &[
    (EXCHANGE_TARGETED, ExchangeKind::Direct),
    (EXCHANGE_CALLCTL, ExchangeKind::Direct),
    (EXCHANGE_CALLEVT, ExchangeKind::Topic),
    (EXCHANGE_BROADCAST, ExchangeKind::Fanout),
    (EXCHANGE_CALLMGR, ExchangeKind::Topic),
    (EXCHANGE_MONITOR, ExchangeKind::Topic),
];

/// Entry point to a broker cluster: one connection per host on demand.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a connection to the broker on `host`.
    ///
    /// A refused connection surfaces as [`crate::Error::NoBroker`].
    async fn connect(&self, host: &str) -> SbResult<Arc<dyn BrokerConnection>>;
}

/// A live connection to one broker host.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Open a new channel multiplexed on this connection.
    async fn open_channel(&self) -> SbResult<Arc<dyn BrokerChannel>>;

    /// Liveness watch: the returned token is cancelled exactly when the
    /// connection dies, whether by peer failure or by [`close`].
    ///
    /// [`close`]: BrokerConnection::close
    fn monitor(&self) -> CancellationToken;

    /// Tear the connection down, killing every channel opened on it.
    fn close(&self);
}

/// A channel multiplexed on a [`BrokerConnection`].
///
/// Operations that touch exchanges or queues require the [`Ticket`] obtained
/// from [`access_request`] on the same channel.
///
/// [`access_request`]: BrokerChannel::access_request
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Request access to `realm`, obtaining the ticket for later operations.
    async fn access_request(&self, realm: &str) -> SbResult<Ticket>;

    /// Declare an exchange. Redeclaring with the same kind is a no-op;
    /// redeclaring with a different kind is a protocol error.
    async fn exchange_declare(
        &self,
        ticket: Ticket,
        exchange: &str,
        kind: ExchangeKind,
    ) -> SbResult<()>;

    /// Declare a queue and return its name. An empty `queue` asks the broker
    /// for a server-assigned name.
    async fn queue_declare(
        &self,
        ticket: Ticket,
        queue: &str,
        exclusive: bool,
        auto_delete: bool,
    ) -> SbResult<String>;

    /// Bind `queue` to `exchange` under `routing_key`.
    async fn queue_bind(
        &self,
        ticket: Ticket,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> SbResult<()>;

    /// Delete a queue. Deleting an unknown queue succeeds.
    async fn queue_delete(&self, ticket: Ticket, queue: &str) -> SbResult<()>;

    /// Start consuming from `queue`. A queue supports a single consumer; the
    /// receiver yields deliveries until the queue or the channel goes away.
    async fn consume(
        &self,
        ticket: Ticket,
        queue: &str,
    ) -> SbResult<mpsc::UnboundedReceiver<Delivery>>;

    /// Publish `payload` to `exchange` under `routing_key`.
    async fn publish(
        &self,
        ticket: Ticket,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: Bytes,
    ) -> SbResult<()>;

    /// Register the recipient of un-routable messages published on this
    /// channel. Replaces any previously registered handler.
    fn register_return_handler(&self, handler: mpsc::UnboundedSender<Delivery>);

    /// Liveness watch: cancelled exactly when the channel dies.
    fn monitor(&self) -> CancellationToken;

    /// Close the channel, deleting the exclusive queues declared on it.
    fn close(&self);
}
