//! Elastic request/reply worker pool.
//!
//! Outbound request/response transactions ride exclusive reply queues: each
//! worker declares a server-named queue bound to the targeted exchange, stamps
//! its queue name into the request's `Server-ID`, publishes, and waits for a
//! single reply. Workers are reused in FIFO order; the pool spawns a worker
//! when none is free and trims back toward the configured baseline on a
//! periodic tick.
//!
//! The pool coordinator never suspends on broker I/O: workers do their own
//! channel setup and reply waiting, and talk back to the coordinator purely
//! by message passing.

use crate::broker::{BrokerChannel, Delivery, EXCHANGE_TARGETED};
use crate::envelope::{self, RequestKind, CONTENT_TYPE_JSON, SERVER_ID};
use crate::session::{ChannelLease, ClientRef, SessionEvent, SessionHandle};
use crate::{Error, SbResult};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between labor-force trim ticks.
pub const BACKOFF_PERIOD: Duration = Duration::from_millis(2500);
/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);
/// Pause before a worker that failed broker setup exits, so baseline
/// replacement cannot hot-spin while the broker is down.
const SETUP_FAILURE_PAUSE: Duration = Duration::from_secs(1);

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Broker host the workers open their channels on.
    pub host: String,
    /// Worker count the pool returns to during quiescent trim ticks.
    pub baseline: usize,
    pub trim_interval: Duration,
    pub default_timeout: Duration,
}

impl PoolConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            baseline: 10,
            trim_interval: BACKOFF_PERIOD,
            default_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_baseline(mut self, baseline: usize) -> Self {
        self.baseline = baseline.max(1);
        self
    }

    pub fn with_trim_interval(mut self, interval: Duration) -> Self {
        self.trim_interval = interval;
        self
    }
}

type WorkerId = u64;

/// One queued transaction: payload, kind, and the caller's reply slot.
struct Job {
    kind: RequestKind,
    payload: Map<String, Value>,
    reply: oneshot::Sender<SbResult<Value>>,
}

enum PoolMsg {
    Request(Job),
    WorkerFree(WorkerId),
    WorkerExited(WorkerId),
    Stats(oneshot::Sender<PoolStats>),
}

enum WorkerMsg {
    Job(Job),
    Shutdown,
}

/// Point-in-time pool counters, mainly for operators and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub worker_count: usize,
    pub free: usize,
    pub baseline: usize,
    /// Requests accepted since the last trim tick.
    pub served: u64,
}

/// Handle to a running pool.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    tx: mpsc::UnboundedSender<PoolMsg>,
    default_timeout: Duration,
}

impl PoolHandle {
    pub async fn auth_req(
        &self,
        payload: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> SbResult<Value> {
        self.call(RequestKind::AuthReq, payload, timeout).await
    }

    pub async fn route_req(
        &self,
        payload: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> SbResult<Value> {
        self.call(RequestKind::RouteReq, payload, timeout).await
    }

    pub async fn reg_query(
        &self,
        payload: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> SbResult<Value> {
        self.call(RequestKind::RegQuery, payload, timeout).await
    }

    pub async fn media_req(
        &self,
        payload: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> SbResult<Value> {
        self.call(RequestKind::MediaReq, payload, timeout).await
    }

    pub async fn stats(&self) -> SbResult<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolMsg::Stats(reply))
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    async fn call(
        &self,
        kind: RequestKind,
        payload: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> SbResult<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolMsg::Request(Job {
                kind,
                payload,
                reply,
            }))
            .map_err(|_| Error::Closed)?;
        match tokio::time::timeout(timeout.unwrap_or(self.default_timeout), rx).await {
            // Dropping `rx` here is what tells the worker we gave up.
            Err(_) => Err(Error::Timeout),
            // The worker died before replying; indistinguishable from a
            // lost reply for the caller.
            Ok(Err(_)) => Err(Error::Timeout),
            Ok(Ok(result)) => result,
        }
    }
}

/// Spawns the pool coordinator and its baseline workers.
pub struct RequestPool;

impl RequestPool {
    /// `shutdown` is the daemon-wide stop watch; cancelling it stops the
    /// free workers and lets busy ones finish their in-flight request.
    pub fn spawn(
        session: SessionHandle,
        config: PoolConfig,
        shutdown: CancellationToken,
    ) -> PoolHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = PoolHandle {
            tx: tx.clone(),
            default_timeout: config.default_timeout,
        };
        let coordinator = Coordinator {
            session,
            config,
            tx,
            free: VecDeque::new(),
            busy: HashMap::new(),
            retiring: HashSet::new(),
            worker_count: 0,
            served: 0,
            next_worker: 0,
        };
        tokio::spawn(coordinator.run(rx, shutdown));
        handle
    }
}

struct WorkerHandle {
    id: WorkerId,
    tx: mpsc::UnboundedSender<WorkerMsg>,
}

struct Coordinator {
    session: SessionHandle,
    config: PoolConfig,
    tx: mpsc::UnboundedSender<PoolMsg>,
    /// Idle workers, reused first-in-first-out for fairness.
    free: VecDeque<WorkerHandle>,
    /// Workers currently serving a request, by id.
    busy: HashMap<WorkerId, WorkerHandle>,
    /// Workers told to shut down whose exit notice is still in flight.
    retiring: HashSet<WorkerId>,
    worker_count: usize,
    /// Requests accepted since the last trim tick.
    served: u64,
    next_worker: WorkerId,
}

impl Coordinator {
    #[tracing::instrument(skip_all)]
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PoolMsg>, shutdown: CancellationToken) {
        info!(baseline = self.config.baseline, "worker pool started");
        // Startup top-up: bring Free to the baseline before serving.
        while self.free.len() < self.config.baseline {
            let worker = self.spawn_worker();
            self.free.push_back(worker);
        }
        let mut trim = interval_at(
            Instant::now() + self.config.trim_interval,
            self.config.trim_interval,
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = trim.tick() => self.reduce_labor_force(),
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }

        debug!("pool shutting down, stopping free workers");
        for worker in self.free.drain(..) {
            let _ = worker.tx.send(WorkerMsg::Shutdown);
        }
        // Busy workers finish their in-flight request and exit once their
        // mailbox closes with the coordinator.
        info!("worker pool stopped");
    }

    fn handle(&mut self, msg: PoolMsg) {
        match msg {
            PoolMsg::Request(job) => self.dispatch(job),
            PoolMsg::WorkerFree(id) => match self.busy.remove(&id) {
                Some(worker) => self.free.push_back(worker),
                None => debug!(worker = id, "free notice from unknown worker ignored"),
            },
            PoolMsg::WorkerExited(id) => self.worker_exited(id),
            PoolMsg::Stats(reply) => {
                let _ = reply.send(PoolStats {
                    worker_count: self.worker_count,
                    free: self.free.len(),
                    baseline: self.config.baseline,
                    served: self.served,
                });
            }
        }
    }

    /// Hand the job to the head of Free, or spawn a worker for it.
    fn dispatch(&mut self, job: Job) {
        self.served += 1;
        let mut job = job;
        loop {
            match self.free.pop_front() {
                Some(worker) => match worker.tx.send(WorkerMsg::Job(job)) {
                    Ok(()) => {
                        self.busy.insert(worker.id, worker);
                        return;
                    }
                    Err(mpsc::error::SendError(msg)) => {
                        // Worker died; its exit notice is still queued. Try
                        // the next one.
                        match msg {
                            WorkerMsg::Job(j) => job = j,
                            WorkerMsg::Shutdown => unreachable!(),
                        }
                    }
                },
                None => {
                    let worker = self.spawn_worker();
                    debug!(worker = worker.id, "no free worker, spawned one");
                    let _ = worker.tx.send(WorkerMsg::Job(job));
                    self.busy.insert(worker.id, worker);
                    return;
                }
            }
        }
    }

    fn worker_exited(&mut self, id: WorkerId) {
        if self.retiring.remove(&id) {
            // Already accounted for when it was told to shut down.
            return;
        }
        self.free.retain(|w| w.id != id);
        self.busy.remove(&id);
        self.worker_count = self.worker_count.saturating_sub(1);
        warn!(worker = id, count = self.worker_count, "worker exited");
        if self.worker_count < self.config.baseline {
            let worker = self.spawn_worker();
            self.free.push_back(worker);
        }
    }

    /// Periodic trim: shrink back toward the baseline when the tick served
    /// fewer requests than there are workers. Only Free workers are drawn;
    /// a Busy worker is never shut down.
    fn reduce_labor_force(&mut self) {
        let served = self.served as usize;
        let count = self.worker_count;
        let baseline = self.config.baseline;
        if served < baseline && count > baseline {
            // Quiet period: return to baseline.
            while self.free.len() > baseline {
                self.retire_one();
            }
        } else if served < count && count > baseline {
            // Partial shrink by the surplus over what was actually used.
            let mut surplus = count - served;
            while surplus > 0 && self.free.len() > baseline {
                self.retire_one();
                surplus -= 1;
            }
        }
        // A fully-busy tick (or an exactly-baseline pool) changes nothing.
        self.served = 0;
    }

    fn retire_one(&mut self) {
        if let Some(worker) = self.free.pop_front() {
            debug!(worker = worker.id, "retiring worker");
            let _ = worker.tx.send(WorkerMsg::Shutdown);
            self.retiring.insert(worker.id);
            self.worker_count -= 1;
        }
    }

    fn spawn_worker(&mut self) -> WorkerHandle {
        self.next_worker += 1;
        let id = self.next_worker;
        let (tx, rx) = mpsc::unbounded_channel();
        self.worker_count += 1;
        let worker = Worker {
            id,
            session: self.session.clone(),
            host: self.config.host.clone(),
            pool: self.tx.clone(),
        };
        tokio::spawn(worker.run(rx));
        WorkerHandle { id, tx }
    }
}

/// A worker's broker-side standing: channel lease, reply queue, consumer.
struct Station {
    lease: ChannelLease,
    queue: String,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    /// Cancelled on drop, telling the session manager this client is gone.
    _liveness: tokio_util::sync::DropGuard,
    /// Session events (host-down notices); kept so sends don't error.
    _events: mpsc::UnboundedReceiver<SessionEvent>,
}

struct Worker {
    id: WorkerId,
    session: SessionHandle,
    host: String,
    pool: mpsc::UnboundedSender<PoolMsg>,
}

/// Reports the worker's exit to the pool on every path, panics included.
struct ExitGuard {
    id: WorkerId,
    pool: mpsc::UnboundedSender<PoolMsg>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.pool.send(PoolMsg::WorkerExited(self.id));
    }
}

impl Worker {
    #[tracing::instrument(skip_all, fields(worker = self.id))]
    async fn run(self, mut jobs: mpsc::UnboundedReceiver<WorkerMsg>) {
        let _exit = ExitGuard {
            id: self.id,
            pool: self.pool.clone(),
        };

        let mut station = match self.setup().await {
            Ok(station) => station,
            Err(err) => {
                warn!(%err, "worker broker setup failed");
                // Fail anything already queued to us, then back off.
                while let Ok(msg) = jobs.try_recv() {
                    if let WorkerMsg::Job(job) = msg {
                        let _ = job.reply.send(Err(Error::NoBroker));
                    }
                }
                tokio::time::sleep(SETUP_FAILURE_PAUSE).await;
                return;
            }
        };

        loop {
            tokio::select! {
                msg = jobs.recv() => match msg {
                    Some(WorkerMsg::Job(job)) => {
                        self.serve(&mut station, job).await;
                        if self.pool.send(PoolMsg::WorkerFree(self.id)).is_err() {
                            break;
                        }
                    }
                    Some(WorkerMsg::Shutdown) | None => {
                        debug!("worker shutting down");
                        break;
                    }
                },
                delivery = station.deliveries.recv() => match delivery {
                    // A reply landing while Free belongs to a caller that
                    // already gave up.
                    Some(delivery) => {
                        debug!(routing_key = %delivery.routing_key, "stale reply ignored");
                    }
                    None => {
                        warn!("reply queue lost, worker exiting");
                        break;
                    }
                },
            }
        }
    }

    /// Declare the exclusive server-named reply queue, bind it to the
    /// targeted exchange under its own name, and start consuming.
    async fn setup(&self) -> SbResult<Station> {
        let liveness = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = ClientRef {
            id: format!("pool-worker-{}", self.id),
            liveness: liveness.clone(),
            events: events_tx,
        };
        let lease = self.session.open_channel(client, &self.host).await?;
        let queue = lease
            .channel
            .queue_declare(lease.ticket, "", true, true)
            .await?;
        lease
            .channel
            .queue_bind(lease.ticket, &queue, EXCHANGE_TARGETED, &queue)
            .await?;
        let deliveries = lease.channel.consume(lease.ticket, &queue).await?;
        debug!(%queue, "worker consuming on reply queue");
        Ok(Station {
            lease,
            queue,
            deliveries,
            _liveness: liveness.drop_guard(),
            _events: events_rx,
        })
    }

    /// One transaction: shape, publish, then block on either the single
    /// reply or the caller going away.
    async fn serve(&self, station: &mut Station, job: Job) {
        let Job {
            kind,
            mut payload,
            mut reply,
        } = job;

        // Replace whatever Server-ID the caller carried with our reply
        // address.
        payload.remove(SERVER_ID);
        payload.insert(
            SERVER_ID.to_string(),
            Value::String(station.queue.clone()),
        );

        let shaped = match envelope::shape(kind, payload) {
            Ok(shaped) => shaped,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let body = match serde_json::to_vec(&Value::Object(shaped)) {
            Ok(body) => body,
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return;
            }
        };
        let (exchange, routing_key) = kind.publish_target();
        if let Err(err) = station
            .lease
            .channel
            .publish(
                station.lease.ticket,
                exchange,
                routing_key,
                CONTENT_TYPE_JSON,
                body.into(),
            )
            .await
        {
            warn!(%err, kind = kind.name(), "publish failed");
            let _ = reply.send(Err(Error::NoBroker));
            return;
        }
        debug!(kind = kind.name(), "published, awaiting reply");

        tokio::select! {
            delivery = station.deliveries.recv() => match delivery {
                Some(delivery) => match serde_json::from_slice::<Value>(&delivery.payload) {
                    Ok(tree) => {
                        let _ = reply.send(Ok(tree));
                    }
                    Err(err) => {
                        warn!(%err, "reply was not valid json");
                        let _ = reply.send(Err(err.into()));
                    }
                },
                // Queue gone mid-wait; the caller's timeout covers it.
                None => warn!("reply queue lost while awaiting reply"),
            },
            _ = reply.closed() => {
                debug!(kind = kind.name(), "caller went away, abandoning reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        Broker, BrokerConnection, ExchangeKind, LocalBroker, EXCHANGE_CALLEVT, EXCHANGE_CALLMGR,
    };
    use crate::session::SessionManager;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::time::{sleep, timeout};

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    struct Rig {
        broker: LocalBroker,
        pool: PoolHandle,
        _shutdown: CancellationToken,
    }

    fn rig(config: PoolConfig) -> Rig {
        let broker = LocalBroker::new();
        let shutdown = CancellationToken::new();
        let session = SessionManager::spawn(Arc::new(broker.clone()), shutdown.clone());
        let pool = RequestPool::spawn(session, config, shutdown.clone());
        Rig {
            broker,
            pool,
            _shutdown: shutdown,
        }
    }

    /// Echo responder: consumes one routing key off the given topic exchange
    /// and answers each request at its `Server-ID` with the given body,
    /// after waiting out `delay`.
    async fn spawn_responder_after(
        broker: &LocalBroker,
        exchange: &'static str,
        routing_key: &'static str,
        body: Value,
        delay: Duration,
    ) {
        let conn = broker.connect("h1").await.unwrap();
        let ch = conn.open_channel().await.unwrap();
        let ticket = ch.access_request("/").await.unwrap();
        ch.exchange_declare(ticket, exchange, ExchangeKind::Topic)
            .await
            .unwrap();
        ch.exchange_declare(ticket, EXCHANGE_TARGETED, ExchangeKind::Direct)
            .await
            .unwrap();
        let queue = ch.queue_declare(ticket, "", true, true).await.unwrap();
        ch.queue_bind(ticket, &queue, exchange, routing_key)
            .await
            .unwrap();
        let mut deliveries = ch.consume(ticket, &queue).await.unwrap();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let request: Value = serde_json::from_slice(&delivery.payload).unwrap();
                let reply_to = request[SERVER_ID].as_str().unwrap().to_string();
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                ch.publish(
                    ticket,
                    EXCHANGE_TARGETED,
                    &reply_to,
                    CONTENT_TYPE_JSON,
                    serde_json::to_vec(&body).unwrap().into(),
                )
                .await
                .unwrap();
            }
        });
    }

    async fn spawn_responder(
        broker: &LocalBroker,
        exchange: &'static str,
        routing_key: &'static str,
        body: Value,
    ) {
        spawn_responder_after(broker, exchange, routing_key, body, Duration::ZERO).await;
    }

    #[tokio::test]
    async fn auth_round_trip() {
        let rig = rig(PoolConfig::new("h1").with_baseline(10));
        spawn_responder(&rig.broker, EXCHANGE_CALLMGR, "auth_req", json!({"Result": "granted"})).await;

        let reply = rig
            .pool
            .auth_req(obj(json!({"Msg-ID": "m1", "To": "u@d"})), None)
            .await
            .unwrap();
        assert_eq!(reply, json!({"Result": "granted"}));
    }

    #[tokio::test]
    async fn validation_failure_is_synchronous_and_unpublished() {
        let rig = rig(PoolConfig::new("h1").with_baseline(2));
        // Watch the routing key the request would have used.
        let conn = rig.broker.connect("h1").await.unwrap();
        let ch = conn.open_channel().await.unwrap();
        let ticket = ch.access_request("/").await.unwrap();
        ch.exchange_declare(ticket, EXCHANGE_CALLMGR, ExchangeKind::Topic)
            .await
            .unwrap();
        let queue = ch.queue_declare(ticket, "", true, true).await.unwrap();
        ch.queue_bind(ticket, &queue, EXCHANGE_CALLMGR, "route_req")
            .await
            .unwrap();
        let mut watched = ch.consume(ticket, &queue).await.unwrap();

        let err = rig.pool.route_req(Map::new(), None).await.unwrap_err();
        assert!(matches!(err, Error::EnvelopeInvalid("route_req")));

        sleep(Duration::from_millis(50)).await;
        assert!(watched.try_recv().is_err(), "nothing may have been published");
    }

    #[tokio::test]
    async fn elastic_scale_up_and_trim_down() {
        let rig = rig(
            PoolConfig::new("h1")
                .with_baseline(10)
                .with_trim_interval(Duration::from_millis(400)),
        );

        // Barrier responder: hold every request until all 25 arrived, so the
        // pool cannot reuse freed workers and must grow to full demand.
        let conn = rig.broker.connect("h1").await.unwrap();
        let ch = conn.open_channel().await.unwrap();
        let ticket = ch.access_request("/").await.unwrap();
        ch.exchange_declare(ticket, EXCHANGE_CALLMGR, ExchangeKind::Topic)
            .await
            .unwrap();
        ch.exchange_declare(ticket, EXCHANGE_TARGETED, ExchangeKind::Direct)
            .await
            .unwrap();
        let queue = ch.queue_declare(ticket, "", true, true).await.unwrap();
        ch.queue_bind(ticket, &queue, EXCHANGE_CALLMGR, "reg_query")
            .await
            .unwrap();
        let mut deliveries = ch.consume(ticket, &queue).await.unwrap();
        tokio::spawn(async move {
            let mut pending = Vec::new();
            while pending.len() < 25 {
                let delivery = deliveries.recv().await.unwrap();
                let request: Value = serde_json::from_slice(&delivery.payload).unwrap();
                pending.push(request[SERVER_ID].as_str().unwrap().to_string());
            }
            for reply_to in pending {
                ch.publish(
                    ticket,
                    EXCHANGE_TARGETED,
                    &reply_to,
                    CONTENT_TYPE_JSON,
                    serde_json::to_vec(&json!({"Fields": []})).unwrap().into(),
                )
                .await
                .unwrap();
            }
        });

        let calls: Vec<_> = (0..25)
            .map(|i| {
                let pool = rig.pool.clone();
                tokio::spawn(async move {
                    pool.reg_query(
                        obj(json!({
                            "Msg-ID": format!("m{i}"),
                            "Username": "u",
                            "Realm": "r"
                        })),
                        None,
                    )
                    .await
                })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }

        let peak = rig.pool.stats().await.unwrap();
        assert_eq!(peak.worker_count, 25, "pool should have grown to demand");

        // Give the trim timer a few ticks to settle back down.
        sleep(Duration::from_millis(1000)).await;
        let settled = rig.pool.stats().await.unwrap();
        assert_eq!(settled.worker_count, 10);
        assert_eq!(settled.free, 10);
    }

    #[tokio::test]
    async fn fully_busy_tick_does_not_shrink() {
        let rig = rig(
            PoolConfig::new("h1")
                .with_baseline(2)
                .with_trim_interval(Duration::from_millis(60)),
        );
        spawn_responder(&rig.broker, EXCHANGE_CALLMGR, "auth_req", json!({"Result": "ok"})).await;

        for i in 0..4 {
            rig.pool
                .auth_req(obj(json!({"Msg-ID": format!("m{i}"), "To": "u@d"})), None)
                .await
                .unwrap();
            sleep(Duration::from_millis(25)).await;
        }
        // Served kept pace with the worker count, so the pool holds steady.
        let stats = rig.pool.stats().await.unwrap();
        assert_eq!(stats.worker_count, 2);
    }

    #[tokio::test]
    async fn caller_timeout_frees_the_worker() {
        // No responder: replies never come.
        let rig = rig(PoolConfig::new("h1").with_baseline(1));

        let err = rig
            .pool
            .auth_req(
                obj(json!({"Msg-ID": "m1", "To": "u@d"})),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        // The worker observed the caller's death and went back to Free.
        let freed = timeout(Duration::from_secs(1), async {
            loop {
                let stats = rig.pool.stats().await.unwrap();
                if stats.free == 1 {
                    break stats;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker never returned to the free queue");
        assert_eq!(freed.worker_count, 1);

        // And it still serves.
        spawn_responder(&rig.broker, EXCHANGE_CALLMGR, "auth_req", json!({"Result": "late"})).await;
        let reply = rig
            .pool
            .auth_req(obj(json!({"Msg-ID": "m2", "To": "u@d"})), None)
            .await
            .unwrap();
        assert_eq!(reply["Result"], "late");
    }

    #[tokio::test]
    async fn media_req_round_trip_rides_the_call_event_exchange() {
        let rig = rig(PoolConfig::new("h1").with_baseline(2));
        spawn_responder(
            &rig.broker,
            EXCHANGE_CALLEVT,
            "media_req",
            json!({"Stream-URL": "shout://127.0.0.1:31337/greeting.mp3"}),
        )
        .await;

        let reply = rig
            .pool
            .media_req(
                obj(json!({"Msg-ID": "m1", "Media-Name": "greeting.wav"})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(reply["Stream-URL"], "shout://127.0.0.1:31337/greeting.mp3");
    }

    #[tokio::test]
    async fn stale_reply_after_timeout_is_drained() {
        let rig = rig(PoolConfig::new("h1").with_baseline(1));
        // The reply arrives well past the caller's deadline.
        spawn_responder_after(
            &rig.broker,
            EXCHANGE_CALLMGR,
            "auth_req",
            json!({"Result": "too late"}),
            Duration::from_millis(300),
        )
        .await;

        let err = rig
            .pool
            .auth_req(
                obj(json!({"Msg-ID": "m1", "To": "u@d"})),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        // Wait past the late reply; the worker must have drained it while
        // Free and still be available.
        sleep(Duration::from_millis(500)).await;
        let stats = rig.pool.stats().await.unwrap();
        assert_eq!(stats.worker_count, 1);
        assert_eq!(stats.free, 1);

        // Had the stale body stayed queued, the next transaction on this
        // worker would read it as its own reply.
        spawn_responder(&rig.broker, EXCHANGE_CALLMGR, "reg_query", json!({"Fields": []})).await;
        let reply = rig
            .pool
            .reg_query(
                obj(json!({"Msg-ID": "m2", "Username": "u", "Realm": "r"})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(reply, json!({"Fields": []}));
    }

    #[tokio::test]
    async fn dead_workers_are_replaced_up_to_baseline() {
        let rig = rig(PoolConfig::new("h1").with_baseline(3));
        spawn_responder(&rig.broker, EXCHANGE_CALLMGR, "auth_req", json!({"Result": "ok"})).await;

        // Let the baseline workers finish setup, then kill their host.
        rig.pool
            .auth_req(obj(json!({"Msg-ID": "m0", "To": "u@d"})), None)
            .await
            .unwrap();
        rig.broker.kill_host("h1");

        let stats = timeout(Duration::from_secs(2), async {
            loop {
                let stats = rig.pool.stats().await.unwrap();
                if stats.worker_count == 3 && stats.free == 3 {
                    break stats;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("pool never recovered to baseline");
        assert_eq!(stats.worker_count, 3);

        // The responder died with the host, so just verify dispatch works.
        spawn_responder(&rig.broker, EXCHANGE_CALLMGR, "reg_query", json!({"Fields": []})).await;
        let reply = rig
            .pool
            .reg_query(
                obj(json!({"Msg-ID": "m1", "Username": "u", "Realm": "r"})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(reply, json!({"Fields": []}));
    }
}
