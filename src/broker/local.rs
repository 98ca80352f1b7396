//! In-process broker implementation of the [`Broker`] seam.
//!
//! One `LocalBroker` models a broker cluster: any host name connects to the
//! same in-memory node unless the host has been marked down. Routing covers
//! the direct, topic, and fanout exchange kinds, queues are single-consumer,
//! and exclusive queues are removed when their consumer goes away, matching
//! the auto-delete semantics the services rely on.
//!
//! Failure injection for tests and operators: [`LocalBroker::set_host_down`]
//! refuses future connects, [`LocalBroker::kill_host`] tears down every live
//! connection to a host.

use super::{Broker, BrokerChannel, BrokerConnection, Delivery, ExchangeKind, Ticket};
use crate::{Error, SbResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Ticket values start above zero so an unset ticket can never validate.
static NEXT_TICKET: AtomicU32 = AtomicU32::new(1);

#[derive(Debug)]
struct QueueState {
    tx: mpsc::UnboundedSender<Delivery>,
    /// Receiver half, held until the single consumer claims it.
    pending: Option<mpsc::UnboundedReceiver<Delivery>>,
    auto_delete: bool,
}

#[derive(Debug)]
struct Binding {
    queue: String,
    key: String,
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Debug, Default)]
struct NodeState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    down_hosts: HashSet<String>,
    connections: Vec<Weak<LocalConnection>>,
    named_queues: u64,
}

/// Shared broker node. All state sits behind one mutex; critical sections
/// are small and never held across an await.
#[derive(Debug, Default)]
struct Node {
    state: Mutex<NodeState>,
}

impl Node {
    /// Remove a queue and every binding that points at it. Idempotent.
    fn delete_queue(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if state.queues.remove(name).is_some() {
            debug!(queue = name, "queue deleted");
        }
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != name);
        }
    }
}

/// In-process broker node implementing [`Broker`].
#[derive(Debug, Clone, Default)]
pub struct LocalBroker {
    node: Arc<Node>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `host` as refusing connections (or accepting them again).
    /// Live connections are unaffected; pair with [`kill_host`] to take a
    /// host fully down.
    ///
    /// [`kill_host`]: LocalBroker::kill_host
    pub fn set_host_down(&self, host: &str, down: bool) {
        let mut state = self.node.state.lock().unwrap();
        if down {
            state.down_hosts.insert(host.to_string());
        } else {
            state.down_hosts.remove(host);
        }
    }

    /// Kill every live connection to `host`, firing their liveness watches.
    /// Future connects still succeed unless the host is also marked down.
    pub fn kill_host(&self, host: &str) {
        let victims: Vec<Arc<LocalConnection>> = {
            let mut state = self.node.state.lock().unwrap();
            state.connections.retain(|c| c.strong_count() > 0);
            state
                .connections
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|c| c.host == host)
                .collect()
        };
        for conn in victims {
            conn.close();
        }
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn connect(&self, host: &str) -> SbResult<Arc<dyn BrokerConnection>> {
        let mut state = self.node.state.lock().unwrap();
        if state.down_hosts.contains(host) {
            return Err(Error::NoBroker);
        }
        let conn = Arc::new(LocalConnection {
            host: host.to_string(),
            node: self.node.clone(),
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        });
        state.connections.push(Arc::downgrade(&conn));
        debug!(host, "broker connection opened");
        Ok(conn)
    }
}

/// One live connection to the in-process node.
#[derive(Debug)]
pub struct LocalConnection {
    host: String,
    node: Arc<Node>,
    token: CancellationToken,
    closed: AtomicBool,
    channels: Mutex<Vec<Weak<LocalChannel>>>,
}

#[async_trait]
impl BrokerConnection for LocalConnection {
    async fn open_channel(&self) -> SbResult<Arc<dyn BrokerChannel>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelOpenFailed("connection closed".into()));
        }
        let channel = Arc::new(LocalChannel {
            node: self.node.clone(),
            // Child token: a dying connection fires every channel watch too.
            token: self.token.child_token(),
            closed: AtomicBool::new(false),
            ticket: AtomicU32::new(0),
            return_handler: Mutex::new(None),
            exclusive_queues: Mutex::new(Vec::new()),
        });
        self.channels.lock().unwrap().push(Arc::downgrade(&channel));
        Ok(channel)
    }

    fn monitor(&self) -> CancellationToken {
        self.token.clone()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels: Vec<Arc<LocalChannel>> = self
            .channels
            .lock()
            .unwrap()
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        for channel in channels {
            channel.close();
        }
        self.token.cancel();
        debug!(host = %self.host, "broker connection closed");
    }
}

/// One channel multiplexed on a [`LocalConnection`].
#[derive(Debug)]
pub struct LocalChannel {
    node: Arc<Node>,
    token: CancellationToken,
    closed: AtomicBool,
    ticket: AtomicU32,
    return_handler: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    /// Queues declared exclusive on this channel; removed at close.
    exclusive_queues: Mutex<Vec<String>>,
}

impl LocalChannel {
    /// Reject operations on a dead channel or with a ticket the channel
    /// never issued.
    fn check(&self, ticket: Ticket) -> SbResult<()> {
        if self.closed.load(Ordering::Acquire) || self.token.is_cancelled() {
            return Err(Error::Protocol("channel closed".into()));
        }
        if ticket == 0 || ticket != self.ticket.load(Ordering::Acquire) {
            return Err(Error::Protocol(format!("invalid access ticket {ticket}")));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for LocalChannel {
    async fn access_request(&self, realm: &str) -> SbResult<Ticket> {
        if self.closed.load(Ordering::Acquire) || self.token.is_cancelled() {
            return Err(Error::Protocol("channel closed".into()));
        }
        let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
        self.ticket.store(ticket, Ordering::Release);
        debug!(realm, ticket, "access granted");
        Ok(ticket)
    }

    async fn exchange_declare(
        &self,
        ticket: Ticket,
        exchange: &str,
        kind: ExchangeKind,
    ) -> SbResult<()> {
        self.check(ticket)?;
        let mut state = self.node.state.lock().unwrap();
        match state.exchanges.get(exchange) {
            Some(existing) if existing.kind != kind => Err(Error::Protocol(format!(
                "exchange `{exchange}` already declared as {:?}",
                existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    exchange.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        ticket: Ticket,
        queue: &str,
        exclusive: bool,
        auto_delete: bool,
    ) -> SbResult<String> {
        self.check(ticket)?;
        let mut state = self.node.state.lock().unwrap();
        let name = if queue.is_empty() {
            state.named_queues += 1;
            format!("amq.gen-{}", state.named_queues)
        } else {
            queue.to_string()
        };
        if !state.queues.contains_key(&name) {
            let (tx, rx) = mpsc::unbounded_channel();
            state.queues.insert(
                name.clone(),
                QueueState {
                    tx,
                    pending: Some(rx),
                    auto_delete,
                },
            );
        }
        if exclusive {
            self.exclusive_queues.lock().unwrap().push(name.clone());
        }
        Ok(name)
    }

    async fn queue_bind(
        &self,
        ticket: Ticket,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> SbResult<()> {
        self.check(ticket)?;
        let mut state = self.node.state.lock().unwrap();
        if !state.queues.contains_key(queue) {
            return Err(Error::Protocol(format!("no such queue `{queue}`")));
        }
        let Some(ex) = state.exchanges.get_mut(exchange) else {
            return Err(Error::Protocol(format!("no such exchange `{exchange}`")));
        };
        if !ex
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.key == routing_key)
        {
            ex.bindings.push(Binding {
                queue: queue.to_string(),
                key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn queue_delete(&self, ticket: Ticket, queue: &str) -> SbResult<()> {
        self.check(ticket)?;
        self.node.delete_queue(queue);
        Ok(())
    }

    async fn consume(
        &self,
        ticket: Ticket,
        queue: &str,
    ) -> SbResult<mpsc::UnboundedReceiver<Delivery>> {
        self.check(ticket)?;
        let (rx, auto_delete, tx) = {
            let mut state = self.node.state.lock().unwrap();
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(Error::Protocol(format!("no such queue `{queue}`")));
            };
            let Some(rx) = q.pending.take() else {
                return Err(Error::Protocol(format!(
                    "queue `{queue}` already has a consumer"
                )));
            };
            (rx, q.auto_delete, q.tx.clone())
        };
        if auto_delete {
            // The sender resolves `closed()` once the consumer receiver is
            // dropped; that is the queue's auto-delete trigger.
            let node = self.node.clone();
            let name = queue.to_string();
            tokio::spawn(async move {
                tx.closed().await;
                node.delete_queue(&name);
            });
        }
        Ok(rx)
    }

    async fn publish(
        &self,
        ticket: Ticket,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: Bytes,
    ) -> SbResult<()> {
        self.check(ticket)?;
        let delivery = Delivery {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            content_type: Some(content_type.to_string()),
            payload,
        };
        let targets: Vec<mpsc::UnboundedSender<Delivery>> = {
            let state = self.node.state.lock().unwrap();
            let Some(ex) = state.exchanges.get(exchange) else {
                return Err(Error::Protocol(format!("no such exchange `{exchange}`")));
            };
            ex.bindings
                .iter()
                .filter(|b| match ex.kind {
                    ExchangeKind::Direct => b.key == routing_key,
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_match(&b.key, routing_key),
                })
                .filter_map(|b| state.queues.get(&b.queue))
                .map(|q| q.tx.clone())
                .collect()
        };
        if targets.is_empty() {
            // Un-routable: hand the message back on the publishing channel.
            match &*self.return_handler.lock().unwrap() {
                Some(handler) => {
                    let _ = handler.send(delivery);
                }
                None => warn!(exchange, routing_key, "unroutable message dropped"),
            }
            return Ok(());
        }
        for tx in targets {
            let _ = tx.send(delivery.clone());
        }
        Ok(())
    }

    fn register_return_handler(&self, handler: mpsc::UnboundedSender<Delivery>) {
        *self.return_handler.lock().unwrap() = Some(handler);
    }

    fn monitor(&self) -> CancellationToken {
        self.token.clone()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for queue in self.exclusive_queues.lock().unwrap().drain(..) {
            self.node.delete_queue(&queue);
        }
        *self.return_handler.lock().unwrap() = None;
        self.token.cancel();
    }
}

/// AMQP topic match: `*` matches one segment, `#` matches zero or more.
fn topic_match(pattern: &str, key: &str) -> bool {
    fn rec(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                rec(&pattern[1..], key) || (!key.is_empty() && rec(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => rec(&pattern[1..], &key[1..]),
            (Some(&seg), Some(&k)) => seg == k && rec(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    rec(&pattern, &key)
}
