//! Broker session manager.
//!
//! Owns one broker connection per host and opens channels on behalf of
//! client processes. Every stored handle (connection, channel, client) is
//! paired with a liveness watch; a watch firing is the only trigger for
//! teardown, so no handle can outlive the reason for holding it and no
//! crashed client can block someone else's channel.
//!
//! All operations are serialized by a single coordinator task consuming a
//! typed command mailbox. The broker library's channel-open and
//! exchange-declare round-trips run inside the coordinator; they are
//! expected to be fast, and a slow broker stalling the coordinator is
//! accepted.

use crate::broker::{
    Broker, BrokerChannel, BrokerConnection, Delivery, Ticket, KNOWN_EXCHANGES,
};
use crate::{Error, SbResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

pub type ClientId = String;

/// Asynchronous notifications delivered to a channel-holding client.
#[derive(Debug)]
pub enum SessionEvent {
    /// The broker host backing the client's channel went away. Sent once
    /// per held channel; the client decides how to re-request.
    BrokerHostDown(String),
    /// A message published on the client's channel matched no binding.
    Returned(Delivery),
}

/// Identity, liveness, and mailbox of a client process requesting a channel.
#[derive(Debug, Clone)]
pub struct ClientRef {
    pub id: ClientId,
    /// Cancelled exactly when the client goes away.
    pub liveness: CancellationToken,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// A live channel plus the access ticket obtained at open.
#[derive(Clone)]
pub struct ChannelLease {
    pub channel: Arc<dyn BrokerChannel>,
    pub ticket: Ticket,
}

impl fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLease")
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

/// Typed command mailbox of the coordinator.
enum Command {
    IsAvailable {
        host: String,
        reply: oneshot::Sender<bool>,
    },
    OpenChannel {
        client: ClientRef,
        host: String,
        reply: oneshot::Sender<SbResult<ChannelLease>>,
    },
    CloseChannel {
        client: ClientId,
        host: String,
    },
    ChannelDown {
        client: ClientId,
        host: String,
    },
    ClientDown {
        client: ClientId,
        host: String,
    },
    ConnectionDown {
        host: String,
    },
    NodeDown {
        node: String,
    },
}

/// Handle to a running session manager.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Returns true if a live connection to `host` exists or can be created
    /// on demand. A connection refusal yields `false`, never an error.
    pub async fn is_available(&self, host: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let command = Command::IsAvailable {
            host: host.to_string(),
            reply,
        };
        if self.tx.send(command).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Return the client's existing live channel for `host`, or open one,
    /// opening the host connection first if needed.
    pub async fn open_channel(&self, client: ClientRef, host: &str) -> SbResult<ChannelLease> {
        let (reply, rx) = oneshot::channel();
        let command = Command::OpenChannel {
            client,
            host: host.to_string(),
            reply,
        };
        self.tx.send(command).map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Asynchronously close the channel held by `(client, host)`. Unknown
    /// targets are logged and ignored.
    pub fn close_channel(&self, client: &str, host: &str) {
        let _ = self.tx.send(Command::CloseChannel {
            client: client.to_string(),
            host: host.to_string(),
        });
    }

    /// Operator signal: a cluster node named `rabbit@<host>` went down.
    pub fn node_down(&self, node: &str) {
        let _ = self.tx.send(Command::NodeDown {
            node: node.to_string(),
        });
    }
}

/// Spawns the coordinator task and returns its handle.
pub struct SessionManager;

impl SessionManager {
    /// `shutdown` is the daemon-wide stop watch; cancelling it makes the
    /// coordinator close everything it holds and exit.
    pub fn spawn(broker: Arc<dyn Broker>, shutdown: CancellationToken) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            broker,
            hosts: HashMap::new(),
            tx: tx.clone(),
        };
        tokio::spawn(coordinator.run(rx, shutdown));
        SessionHandle { tx }
    }
}

struct HostEntry {
    connection: Arc<dyn BrokerConnection>,
    /// Connection watch; cancelled by drop when the entry is torn down.
    _watch: DropGuard,
    channels: HashMap<ClientId, ChannelEntry>,
}

struct ChannelEntry {
    client: ClientRef,
    channel: Arc<dyn BrokerChannel>,
    ticket: Ticket,
    _client_watch: DropGuard,
    _channel_watch: DropGuard,
    /// Stops the unroutable-return forwarder task.
    _return_forward: DropGuard,
}

struct Coordinator {
    broker: Arc<dyn Broker>,
    hosts: HashMap<String, HostEntry>,
    /// Mailbox sender cloned into watcher tasks.
    tx: mpsc::UnboundedSender<Command>,
}

impl Coordinator {
    #[tracing::instrument(skip_all)]
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, shutdown: CancellationToken) {
        info!("session manager started");
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command).await;
        }

        for (host, entry) in self.hosts.drain() {
            debug!(%host, "closing connection at shutdown");
            for (_, channel) in entry.channels {
                channel.channel.close();
            }
            entry.connection.close();
        }
        info!("session manager stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::IsAvailable { host, reply } => {
                let available = self.ensure_connection(&host).await.is_ok();
                let _ = reply.send(available);
            }
            Command::OpenChannel {
                client,
                host,
                reply,
            } => {
                let result = self.open_channel(client, host).await;
                let _ = reply.send(result);
            }
            Command::CloseChannel { client, host } => self.close_channel(&client, &host),
            Command::ChannelDown { client, host } => self.channel_down(client, host).await,
            Command::ClientDown { client, host } => self.client_down(&client, &host),
            Command::ConnectionDown { host } => self.connection_down(&host, false),
            Command::NodeDown { node } => {
                // Broker nodes are named `rabbit@<host>`.
                let host = node.strip_prefix("rabbit@").unwrap_or(&node).to_string();
                self.connection_down(&host, true);
            }
        }
    }

    /// Make sure a live connection to `host` exists, dialing on demand.
    async fn ensure_connection(&mut self, host: &str) -> SbResult<()> {
        if let Some(entry) = self.hosts.get(host) {
            if !entry.connection.monitor().is_cancelled() {
                return Ok(());
            }
            // The watch will report this too, but don't hand out channels on
            // a connection already known dead.
            self.connection_down(host, true);
        }

        let connection = self.broker.connect(host).await?;
        let watch = spawn_watch(
            connection.monitor(),
            self.tx.clone(),
            Command::ConnectionDown {
                host: host.to_string(),
            },
        );
        info!(host, "connected to broker");
        self.hosts.insert(
            host.to_string(),
            HostEntry {
                connection,
                _watch: watch,
                channels: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn open_channel(&mut self, client: ClientRef, host: String) -> SbResult<ChannelLease> {
        self.ensure_connection(&host).await?;
        let Some(entry) = self.hosts.get_mut(&host) else {
            return Err(Error::NoBroker);
        };

        if let Some(existing) = entry.channels.get(&client.id) {
            if !existing.channel.monitor().is_cancelled() {
                debug!(client = %client.id, %host, "reusing existing channel");
                return Ok(ChannelLease {
                    channel: existing.channel.clone(),
                    ticket: existing.ticket,
                });
            }
            entry.channels.remove(&client.id);
        }

        let (channel, ticket, return_forward) =
            negotiate(entry.connection.as_ref(), &client).await?;
        let lease = ChannelLease {
            channel: channel.clone(),
            ticket,
        };
        let channel_entry = ChannelEntry {
            _client_watch: spawn_watch(
                client.liveness.clone(),
                self.tx.clone(),
                Command::ClientDown {
                    client: client.id.clone(),
                    host: host.clone(),
                },
            ),
            _channel_watch: spawn_watch(
                channel.monitor(),
                self.tx.clone(),
                Command::ChannelDown {
                    client: client.id.clone(),
                    host: host.clone(),
                },
            ),
            _return_forward: return_forward,
            client: client.clone(),
            channel,
            ticket,
        };
        debug!(client = %channel_entry.client.id, %host, ticket, "channel opened");
        entry.channels.insert(client.id, channel_entry);
        Ok(lease)
    }

    fn close_channel(&mut self, client: &str, host: &str) {
        match self
            .hosts
            .get_mut(host)
            .and_then(|entry| entry.channels.remove(client))
        {
            Some(entry) => {
                debug!(client, host, "channel closed on request");
                entry.channel.close();
                // Dropping the entry cancels its watches.
            }
            None => warn!(client, host, "close_channel for unknown target ignored"),
        }
    }

    /// Channel watch fired. If the client is still alive, re-open the
    /// channel on the existing connection; otherwise drop the entry.
    async fn channel_down(&mut self, client: ClientId, host: String) {
        let Some(host_entry) = self.hosts.get_mut(&host) else {
            debug!(%client, %host, "spurious channel-down ignored");
            return;
        };
        let Some(entry) = host_entry.channels.remove(&client) else {
            debug!(%client, %host, "spurious channel-down ignored");
            return;
        };
        if !entry.channel.monitor().is_cancelled() {
            // The entry was already replaced with a live channel; the watch
            // fired for its predecessor.
            debug!(%client, %host, "stale channel-down ignored");
            host_entry.channels.insert(client, entry);
            return;
        }
        // Stale watches are cancelled by dropping the removed entry below.
        if entry.client.liveness.is_cancelled() {
            entry.channel.close();
            return;
        }

        info!(%client, %host, "channel died with live client, re-opening");
        match negotiate(host_entry.connection.as_ref(), &entry.client).await {
            Ok((channel, ticket, return_forward)) => {
                let replacement = ChannelEntry {
                    _client_watch: spawn_watch(
                        entry.client.liveness.clone(),
                        self.tx.clone(),
                        Command::ClientDown {
                            client: client.clone(),
                            host: host.clone(),
                        },
                    ),
                    _channel_watch: spawn_watch(
                        channel.monitor(),
                        self.tx.clone(),
                        Command::ChannelDown {
                            client: client.clone(),
                            host: host.clone(),
                        },
                    ),
                    _return_forward: return_forward,
                    client: entry.client.clone(),
                    channel,
                    ticket,
                };
                host_entry.channels.insert(client, replacement);
            }
            Err(err) => {
                warn!(%client, %host, %err, "channel re-open failed, dropping entry");
            }
        }
    }

    /// Client watch fired: shut that one channel. The connection and other
    /// clients' channels remain.
    fn client_down(&mut self, client: &str, host: &str) {
        match self
            .hosts
            .get_mut(host)
            .and_then(|entry| entry.channels.remove(client))
        {
            Some(entry) => {
                debug!(client, host, "client went away, closing its channel");
                entry.channel.close();
            }
            None => debug!(client, host, "spurious client-down ignored"),
        }
    }

    /// Connection watch fired (or a node-down arrived): destroy the whole
    /// host entry, notifying every still-living client. `force` skips the
    /// staleness check for teardowns not driven by the watch itself.
    fn connection_down(&mut self, host: &str, force: bool) {
        let Some(entry) = self.hosts.remove(host) else {
            debug!(host, "spurious connection-down ignored");
            return;
        };
        if !force && !entry.connection.monitor().is_cancelled() {
            // Watch fired for a connection this entry no longer holds.
            debug!(host, "stale connection-down ignored");
            self.hosts.insert(host.to_string(), entry);
            return;
        }
        warn!(
            host,
            channels = entry.channels.len(),
            "broker host down, tearing down"
        );
        for (client, channel_entry) in entry.channels {
            channel_entry.channel.close();
            if !channel_entry.client.liveness.is_cancelled() {
                let notified = channel_entry
                    .client
                    .events
                    .send(SessionEvent::BrokerHostDown(host.to_string()));
                if notified.is_err() {
                    debug!(%client, "client mailbox gone, skipping host-down notice");
                }
            }
        }
        entry.connection.close();
    }
}

/// Run the channel-open protocol on an existing connection: open the
/// channel, register the client as its return handler, obtain the access
/// ticket, and declare the known exchange set. Any failure closes the
/// half-open channel and surfaces as `ChannelOpenFailed`.
async fn negotiate(
    connection: &dyn BrokerConnection,
    client: &ClientRef,
) -> SbResult<(Arc<dyn BrokerChannel>, Ticket, DropGuard)> {
    let channel = connection.open_channel().await.map_err(open_failed)?;

    let (return_tx, return_rx) = mpsc::unbounded_channel();
    channel.register_return_handler(return_tx);
    let return_forward = spawn_return_forwarder(return_rx, client.events.clone());

    let ticket = match channel.access_request("/").await {
        Ok(ticket) => ticket,
        Err(err) => {
            channel.close();
            return Err(open_failed(err));
        }
    };
    for (exchange, kind) in KNOWN_EXCHANGES {
        if let Err(err) = channel.exchange_declare(ticket, exchange, *kind).await {
            channel.close();
            return Err(open_failed(err));
        }
    }
    Ok((channel, ticket, return_forward))
}

fn open_failed(err: Error) -> Error {
    match err {
        Error::ChannelOpenFailed(_) => err,
        other => Error::ChannelOpenFailed(other.to_string()),
    }
}

/// Forward un-routable returns into the client's event mailbox until the
/// channel (or the client) goes away.
fn spawn_return_forwarder(
    mut returns: mpsc::UnboundedReceiver<Delivery>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> DropGuard {
    let stop = CancellationToken::new();
    let guard = stop.clone().drop_guard();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                delivery = returns.recv() => match delivery {
                    Some(delivery) => {
                        if events.send(SessionEvent::Returned(delivery)).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
    guard
}

/// Install a liveness watch: when `fired` cancels, deliver `command` to the
/// coordinator. Dropping the returned guard cancels the watch instead.
fn spawn_watch(
    fired: CancellationToken,
    tx: mpsc::UnboundedSender<Command>,
    command: Command,
) -> DropGuard {
    let stop = CancellationToken::new();
    let guard = stop.clone().drop_guard();
    tokio::spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = fired.cancelled() => {
                let _ = tx.send(command);
            }
        }
    });
    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    struct TestClient {
        client: ClientRef,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        liveness: CancellationToken,
    }

    fn test_client(id: &str) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let liveness = CancellationToken::new();
        TestClient {
            client: ClientRef {
                id: id.to_string(),
                liveness: liveness.clone(),
                events: tx,
            },
            events: rx,
            liveness,
        }
    }

    fn start(broker: &LocalBroker) -> (SessionHandle, CancellationToken) {
        let shutdown = CancellationToken::new();
        let handle = SessionManager::spawn(Arc::new(broker.clone()), shutdown.clone());
        (handle, shutdown)
    }

    #[tokio::test]
    async fn open_channel_reuses_per_client_entry() {
        let broker = LocalBroker::new();
        let (session, _shutdown) = start(&broker);
        let client = test_client("client-a");

        let first = assert_ok!(session.open_channel(client.client.clone(), "h1").await);
        let second =
            assert_ok!(session.open_channel(client.client.clone(), "h1").await);

        assert!(Arc::ptr_eq(&first.channel, &second.channel));
        assert_eq!(first.ticket, second.ticket);
    }

    #[tokio::test]
    async fn refused_connection_surfaces_no_broker() {
        let broker = LocalBroker::new();
        broker.set_host_down("h1", true);
        let (session, _shutdown) = start(&broker);
        let client = test_client("client-a");

        assert!(!session.is_available("h1").await);
        let err = session
            .open_channel(client.client.clone(), "h1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoBroker));
    }

    #[tokio::test]
    async fn host_death_notifies_and_rebuilds_on_demand() {
        let broker = LocalBroker::new();
        let (session, _shutdown) = start(&broker);
        let mut client = test_client("client-p");

        let lease = session
            .open_channel(client.client.clone(), "h1")
            .await
            .unwrap();

        broker.kill_host("h1");

        let event = timeout(Duration::from_secs(1), client.events.recv())
            .await
            .expect("no host-down notice")
            .unwrap();
        assert!(matches!(event, SessionEvent::BrokerHostDown(host) if host == "h1"));
        assert!(lease.channel.monitor().is_cancelled());

        // A subsequent open transparently rebuilds connection and channel.
        let rebuilt = session
            .open_channel(client.client.clone(), "h1")
            .await
            .unwrap();
        assert!(!rebuilt.channel.monitor().is_cancelled());
        assert!(!Arc::ptr_eq(&lease.channel, &rebuilt.channel));
    }

    #[tokio::test]
    async fn node_down_signal_tears_down_host() {
        let broker = LocalBroker::new();
        let (session, _shutdown) = start(&broker);
        let mut client = test_client("client-p");

        session
            .open_channel(client.client.clone(), "h2")
            .await
            .unwrap();

        session.node_down("rabbit@h2");

        let event = timeout(Duration::from_secs(1), client.events.recv())
            .await
            .expect("no host-down notice")
            .unwrap();
        assert!(matches!(event, SessionEvent::BrokerHostDown(host) if host == "h2"));
    }

    #[tokio::test]
    async fn client_death_closes_only_its_channel() {
        let broker = LocalBroker::new();
        let (session, _shutdown) = start(&broker);
        let client_a = test_client("client-a");
        let client_b = test_client("client-b");

        let lease_a = session
            .open_channel(client_a.client.clone(), "h1")
            .await
            .unwrap();
        let lease_b = session
            .open_channel(client_b.client.clone(), "h1")
            .await
            .unwrap();

        client_a.liveness.cancel();

        let watch = lease_a.channel.monitor();
        timeout(Duration::from_secs(1), watch.cancelled())
            .await
            .expect("channel of dead client should close");
        assert!(!lease_b.channel.monitor().is_cancelled());
    }

    #[tokio::test]
    async fn channel_death_with_live_client_reopens() {
        let broker = LocalBroker::new();
        let (session, _shutdown) = start(&broker);
        let client = test_client("client-a");

        let lease = session
            .open_channel(client.client.clone(), "h1")
            .await
            .unwrap();
        lease.channel.close();

        // The coordinator replaces the entry; polling open_channel returns
        // the replacement once installed.
        let rebuilt = timeout(Duration::from_secs(1), async {
            loop {
                let lease = session
                    .open_channel(client.client.clone(), "h1")
                    .await
                    .unwrap();
                if !lease.channel.monitor().is_cancelled() {
                    break lease;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!Arc::ptr_eq(&lease.channel, &rebuilt.channel));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn close_channel_unknown_target_is_ignored() {
        let broker = LocalBroker::new();
        let (session, _shutdown) = start(&broker);
        session.close_channel("nobody", "nowhere");
        // Still serving afterwards, and the bogus target is only logged.
        assert!(session.is_available("h1").await);
        assert!(logs_contain("close_channel for unknown target ignored"));
    }
}
