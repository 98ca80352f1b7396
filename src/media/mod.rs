//! Media request dispatcher.
//!
//! A single consumer ingests media-fetch requests from the call-event
//! exchange and spawns a handler task per request, so the consumer loop
//! never blocks on document lookups or stream startup. The dispatcher also
//! owns a pool of pre-bound TCP listener ports for streaming endpoints and
//! a registry of live streaming children for "join existing stream"
//! requests.
//!
//! The broker side is deliberately fragile: on any consume failure or a
//! host-down notice the dispatcher drops its consumer and re-bootstraps on
//! a retry timer until the broker comes back.

pub mod ports;
pub mod store;
pub mod stream;

use crate::broker::{
    BrokerChannel, Delivery, ExchangeKind, EXCHANGE_CALLEVT, EXCHANGE_CALLMGR, EXCHANGE_TARGETED,
};
use crate::envelope::{
    self, MediaErrorCode, RequestKind, CONTENT_TYPE_JSON, SERVER_ID,
};
use crate::session::{ChannelLease, ClientRef, SessionEvent, SessionHandle};
use crate::{Error, SbResult};
use ports::{PortLease, PortPool, PortRange, MAX_RESERVED_PORTS};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use store::MediaStore;
use stream::{MediaLocator, StreamChild, StreamMode, StreamSupervisor};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Delay between consumer bootstrap attempts while the broker is away.
pub const CONSUMER_RETRY_PERIOD: Duration = Duration::from_millis(1000);

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Broker host the consumer channel is opened on.
    pub host: String,
    pub bind_addr: IpAddr,
    pub port_range: PortRange,
    pub max_reserved_ports: usize,
    /// Database assumed when a `Media-Name` names no db.
    pub default_media_db: String,
}

impl MediaConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: PortRange::Any,
            max_reserved_ports: MAX_RESERVED_PORTS,
            default_media_db: "media".to_string(),
        }
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_port_range(mut self, range: PortRange) -> Self {
        self.port_range = range;
        self
    }

    pub fn with_max_reserved_ports(mut self, max: usize) -> Self {
        self.max_reserved_ports = max;
        self
    }

    pub fn with_media_db(mut self, db: impl Into<String>) -> Self {
        self.default_media_db = db.into();
        self
    }
}

enum MediaMsg {
    AddStream {
        media: String,
        child: StreamChild,
    },
    LookupStream {
        media: String,
        reply: oneshot::Sender<Option<StreamChild>>,
    },
    RemoveStream {
        media: String,
        child_id: u64,
    },
    NextPort {
        reply: oneshot::Sender<Option<PortLease>>,
    },
    ConsumerQueue {
        reply: oneshot::Sender<Option<String>>,
    },
    Bootstrap,
    HostDown(String),
}

/// Handle to a running media dispatcher.
#[derive(Debug, Clone)]
pub struct MediaHandle {
    tx: mpsc::UnboundedSender<MediaMsg>,
}

impl MediaHandle {
    /// Register a live streaming child for future join requests.
    pub fn add_stream(&self, media: impl Into<String>, child: StreamChild) {
        let _ = self.tx.send(MediaMsg::AddStream {
            media: media.into(),
            child,
        });
    }

    /// Look up the registered stream child for a media name.
    pub async fn lookup_stream(&self, media: &str) -> Option<StreamChild> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MediaMsg::LookupStream {
                media: media.to_string(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Lease the next pre-bound port.
    pub async fn next_port(&self) -> SbResult<PortLease> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MediaMsg::NextPort { reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?.ok_or(Error::NoPorts)
    }

    /// Name of the active consumer queue, `None` while the broker is away.
    pub async fn consumer_queue(&self) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(MediaMsg::ConsumerQueue { reply }).ok()?;
        rx.await.ok().flatten()
    }
}

/// Spawns the dispatcher coordinator.
pub struct MediaDispatcher;

impl MediaDispatcher {
    /// `shutdown` is the daemon-wide stop watch; cancelling it makes the
    /// coordinator drop its consumer and exit.
    pub fn spawn(
        session: SessionHandle,
        store: Arc<dyn MediaStore>,
        supervisor: Arc<dyn StreamSupervisor>,
        config: MediaConfig,
        shutdown: CancellationToken,
    ) -> MediaHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        spawn_event_forwarder(events_rx, tx.clone());

        let liveness = CancellationToken::new();
        let ports = PortPool::new(config.bind_addr, config.port_range, config.max_reserved_ports);
        let coordinator = Coordinator {
            session,
            store,
            supervisor,
            tx: tx.clone(),
            events_tx,
            _liveness: liveness.clone().drop_guard(),
            liveness,
            lease: None,
            queue: None,
            broker_up: false,
            retry_scheduled: false,
            ports,
            streams: HashMap::new(),
            config,
        };
        // Startup: the bootstrap fires as the coordinator's first message.
        let _ = tx.send(MediaMsg::Bootstrap);
        tokio::spawn(coordinator.run(rx, shutdown));
        MediaHandle { tx }
    }
}

struct StreamEntry {
    child: StreamChild,
    _watch: DropGuard,
}

struct Coordinator {
    session: SessionHandle,
    store: Arc<dyn MediaStore>,
    supervisor: Arc<dyn StreamSupervisor>,
    tx: mpsc::UnboundedSender<MediaMsg>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    /// Our identity towards the session manager; cancelled on exit.
    liveness: CancellationToken,
    _liveness: DropGuard,
    lease: Option<ChannelLease>,
    /// Current consumer queue name; kept across failures so a retry can
    /// issue a best-effort delete of the stale queue.
    queue: Option<String>,
    broker_up: bool,
    retry_scheduled: bool,
    ports: PortPool,
    streams: HashMap<String, StreamEntry>,
    config: MediaConfig,
}

impl Coordinator {
    #[tracing::instrument(skip_all)]
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MediaMsg>, shutdown: CancellationToken) {
        info!(host = %self.config.host, "media dispatcher started");
        let mut consumer: Option<mpsc::UnboundedReceiver<Delivery>> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg, &mut consumer).await,
                    None => break,
                },
                delivery = recv_some(&mut consumer), if consumer.is_some() => match delivery {
                    Some(delivery) => self.dispatch(delivery).await,
                    None => {
                        warn!("media consumer lost, scheduling retry");
                        consumer = None;
                        self.lease = None;
                        self.broker_up = false;
                        self.schedule_retry();
                    }
                },
            }
        }
        info!("media dispatcher stopped");
    }

    async fn handle(
        &mut self,
        msg: MediaMsg,
        consumer: &mut Option<mpsc::UnboundedReceiver<Delivery>>,
    ) {
        match msg {
            MediaMsg::Bootstrap => self.bootstrap(consumer).await,
            MediaMsg::HostDown(host) => {
                if self
                    .lease
                    .as_ref()
                    .is_some_and(|l| !l.channel.monitor().is_cancelled())
                {
                    debug!(%host, "stale host-down notice ignored");
                    return;
                }
                warn!(%host, "broker host down, entering retry mode");
                self.broker_up = false;
                self.lease = None;
                *consumer = None;
                self.schedule_retry();
            }
            MediaMsg::AddStream { media, child } => self.add_stream(media, child),
            MediaMsg::LookupStream { media, reply } => {
                let _ = reply.send(self.streams.get(&media).map(|e| e.child.clone()));
            }
            MediaMsg::RemoveStream { media, child_id } => self.remove_stream(&media, child_id),
            MediaMsg::NextPort { reply } => {
                let _ = reply.send(self.ports.next_port().await);
            }
            MediaMsg::ConsumerQueue { reply } => {
                let active = if self.broker_up {
                    self.queue.clone()
                } else {
                    None
                };
                let _ = reply.send(active);
            }
        }
    }

    /// Declare + bind + consume the request queue, remembering its name as
    /// our identity. Any broker failure records the marker and arms the
    /// retry timer.
    async fn bootstrap(&mut self, consumer: &mut Option<mpsc::UnboundedReceiver<Delivery>>) {
        self.retry_scheduled = false;
        match self.try_bootstrap().await {
            Ok((lease, queue, deliveries)) => {
                info!(%queue, "media consumer established");
                self.lease = Some(lease);
                self.queue = Some(queue);
                *consumer = Some(deliveries);
                self.broker_up = true;
                self.ports.fill().await;
            }
            Err(err) => {
                warn!(%err, "media consumer bootstrap failed, retrying");
                self.lease = None;
                self.broker_up = false;
                self.schedule_retry();
            }
        }
    }

    async fn try_bootstrap(
        &mut self,
    ) -> SbResult<(ChannelLease, String, mpsc::UnboundedReceiver<Delivery>)> {
        let client = ClientRef {
            id: "media-dispatcher".to_string(),
            liveness: self.liveness.clone(),
            events: self.events_tx.clone(),
        };
        let lease = self.session.open_channel(client, &self.config.host).await?;
        let (channel, ticket) = (&lease.channel, lease.ticket);
        channel
            .exchange_declare(ticket, EXCHANGE_CALLMGR, ExchangeKind::Topic)
            .await?;
        channel
            .exchange_declare(ticket, EXCHANGE_TARGETED, ExchangeKind::Direct)
            .await?;
        if let Some(stale) = self.queue.take() {
            // Best effort: the previous incarnation's queue may linger.
            let _ = channel.queue_delete(ticket, &stale).await;
        }
        let queue = channel.queue_declare(ticket, "", true, true).await?;
        channel
            .queue_bind(ticket, &queue, EXCHANGE_CALLEVT, "media_req")
            .await?;
        channel
            .queue_bind(ticket, &queue, EXCHANGE_TARGETED, &queue)
            .await?;
        let deliveries = channel.consume(ticket, &queue).await?;
        Ok((lease, queue, deliveries))
    }

    fn schedule_retry(&mut self) {
        if self.retry_scheduled {
            return;
        }
        self.retry_scheduled = true;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CONSUMER_RETRY_PERIOD).await;
            let _ = tx.send(MediaMsg::Bootstrap);
        });
    }

    /// Take one port and hand the request to a fresh handler task so the
    /// consumer loop never blocks, then top the port pool back up.
    async fn dispatch(&mut self, delivery: Delivery) {
        let Some(lease) = self.lease.clone() else {
            return;
        };
        let port = self.ports.next_port().await;
        let handler = RequestHandler {
            store: self.store.clone(),
            supervisor: self.supervisor.clone(),
            media: MediaHandle {
                tx: self.tx.clone(),
            },
            lease,
            default_db: self.config.default_media_db.clone(),
        };
        tokio::spawn(handler.run(delivery, port));
        self.ports.fill().await;
    }

    fn add_stream(&mut self, media: String, child: StreamChild) {
        if self.streams.contains_key(&media) {
            debug!(%media, "replacing registered stream");
        }
        let watch = spawn_stream_watch(
            child.liveness.clone(),
            self.tx.clone(),
            media.clone(),
            child.id,
        );
        self.streams.insert(
            media,
            StreamEntry {
                child,
                _watch: watch,
            },
        );
    }

    fn remove_stream(&mut self, media: &str, child_id: u64) {
        match self.streams.get(media) {
            Some(entry) if entry.child.id == child_id => {
                debug!(media, "stream child exited, deregistered");
                self.streams.remove(media);
            }
            _ => debug!(media, child_id, "spurious stream-down ignored"),
        }
    }
}

/// Per-request handler, spawned for every consumed message.
struct RequestHandler {
    store: Arc<dyn MediaStore>,
    supervisor: Arc<dyn StreamSupervisor>,
    media: MediaHandle,
    lease: ChannelLease,
    default_db: String,
}

impl RequestHandler {
    #[tracing::instrument(skip_all)]
    async fn run(self, delivery: Delivery, port: Option<PortLease>) {
        let request = match serde_json::from_slice::<Value>(&delivery.payload) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!("undecodable media request dropped");
                return;
            }
        };
        let reply_to = request
            .get(SERVER_ID)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let media_name = request
            .get("Media-Name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let outcome = if envelope::shape(RequestKind::MediaReq, request.clone()).is_err() {
            Err((MediaErrorCode::Other, Some("invalid media request".to_string())))
        } else {
            self.process(&media_name, &request, &reply_to, port).await
        };

        if let Err((code, msg)) = outcome {
            debug!(%media_name, code = code.as_str(), "media request failed");
            self.send_error(&reply_to, &media_name, code, msg.as_deref())
                .await;
        }
    }

    /// Resolve the media name against the store and start or join a stream.
    async fn process(
        &self,
        media_name: &str,
        request: &Map<String, Value>,
        reply_to: &str,
        port: Option<PortLease>,
    ) -> Result<(), (MediaErrorCode, Option<String>)> {
        let name = envelope::parse_media_name(media_name)
            .map_err(|_| (MediaErrorCode::NotFound, None))?;
        let db = name.db.unwrap_or_else(|| self.default_db.clone());
        let doc = self
            .store
            .lookup(&db, &name.doc)
            .await
            .ok_or((MediaErrorCode::NotFound, None))?;
        if !doc.streamable || doc.attachments.is_empty() {
            return Err((MediaErrorCode::NoData, None));
        }
        let attachment = match &name.attachment {
            Some(wanted) => doc
                .attachments
                .iter()
                .find(|a| &a.name == wanted)
                .cloned()
                .ok_or((
                    MediaErrorCode::NotFound,
                    Some(format!("no attachment `{wanted}`")),
                ))?,
            // First attachment in declaration order.
            None => doc.attachments[0].clone(),
        };
        let locator = MediaLocator {
            db,
            doc: name.doc,
            attachment: attachment.name,
            content_type: attachment.content_type,
        };

        let stream_type = request
            .get("Stream-Type")
            .and_then(Value::as_str)
            .unwrap_or("new");
        match stream_type {
            "new" => {
                let port = port.ok_or((
                    MediaErrorCode::Other,
                    Some("no media ports available".to_string()),
                ))?;
                self.supervisor
                    .start_stream(locator, reply_to, StreamMode::Single, port)
                    .await
                    .map_err(|err| (MediaErrorCode::Other, Some(err.to_string())))?;
            }
            "extant" => {
                if let Some(child) = self.media.lookup_stream(media_name).await {
                    if child.add_listener(reply_to) {
                        debug!(%media_name, reply_to, "joined running stream");
                        return Ok(());
                    }
                    // The registered child is gone; fall through and start a
                    // fresh continuous stream.
                }
                let port = port.ok_or((
                    MediaErrorCode::Other,
                    Some("no media ports available".to_string()),
                ))?;
                let child = self
                    .supervisor
                    .start_stream(locator, reply_to, StreamMode::Continuous, port)
                    .await
                    .map_err(|err| (MediaErrorCode::Other, Some(err.to_string())))?;
                self.media.add_stream(media_name, child);
            }
            other => {
                return Err((
                    MediaErrorCode::Other,
                    Some(format!("unknown Stream-Type `{other}`")),
                ));
            }
        }
        Ok(())
    }

    /// Publish an error envelope to the requester's `Server-ID`.
    async fn send_error(
        &self,
        reply_to: &str,
        media_name: &str,
        code: MediaErrorCode,
        msg: Option<&str>,
    ) {
        if reply_to.is_empty() {
            warn!(media_name, "media request without Server-ID, cannot reply");
            return;
        }
        let envelope = envelope::media_error(media_name, code, msg);
        let body = match serde_json::to_vec(&Value::Object(envelope)) {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, "failed to encode media error");
                return;
            }
        };
        if let Err(err) = self
            .lease
            .channel
            .publish(
                self.lease.ticket,
                EXCHANGE_TARGETED,
                reply_to,
                CONTENT_TYPE_JSON,
                body.into(),
            )
            .await
        {
            warn!(%err, reply_to, "failed to publish media error");
        }
    }
}

async fn recv_some(consumer: &mut Option<mpsc::UnboundedReceiver<Delivery>>) -> Option<Delivery> {
    match consumer {
        Some(rx) => rx.recv().await,
        // Guarded by the select precondition; never polled when `None`.
        None => std::future::pending().await,
    }
}

/// Forward session events into the coordinator mailbox.
fn spawn_event_forwarder(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    tx: mpsc::UnboundedSender<MediaMsg>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::BrokerHostDown(host) => {
                    if tx.send(MediaMsg::HostDown(host)).is_err() {
                        break;
                    }
                }
                SessionEvent::Returned(delivery) => {
                    debug!(routing_key = %delivery.routing_key, "returned media message ignored");
                }
            }
        }
    });
}

/// Watch a stream child's liveness and deregister it on death.
fn spawn_stream_watch(
    fired: CancellationToken,
    tx: mpsc::UnboundedSender<MediaMsg>,
    media: String,
    child_id: u64,
) -> DropGuard {
    let stop = CancellationToken::new();
    let guard = stop.clone().drop_guard();
    tokio::spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = fired.cancelled() => {
                let _ = tx.send(MediaMsg::RemoveStream { media, child_id });
            }
        }
    });
    guard
}
