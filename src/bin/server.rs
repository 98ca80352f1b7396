use clap::Parser;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use switchboard::broker::LocalBroker;
use switchboard::media::ports::{PortLease, PortRange};
use switchboard::media::store::{Attachment, MediaDoc, MemoryStore};
use switchboard::media::stream::{AddListener, MediaLocator, StreamChild, StreamMode, StreamSupervisor};
use switchboard::{
    MediaConfig, MediaDispatcher, PoolConfig, RequestPool, SbResult, SessionManager,
    DEFAULT_BROKER_HOST,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = ServerCli::parse();
    // Root stop watch for every coordinator, cancelled from ctrl-c.
    let shutdown = CancellationToken::new();

    let broker = Arc::new(LocalBroker::new());
    let session = SessionManager::spawn(broker.clone(), shutdown.clone());

    let pool = RequestPool::spawn(
        session.clone(),
        PoolConfig::new(&cli.broker_host).with_baseline(cli.pool_baseline),
        shutdown.clone(),
    );

    let store = Arc::new(MemoryStore::new());
    store.insert(
        &cli.media_db,
        "system_greeting",
        MediaDoc {
            streamable: true,
            attachments: vec![Attachment {
                name: "greeting.mp3".to_string(),
                content_type: Some("audio/mpeg".to_string()),
                length: Some(48_000),
            }],
        },
    );

    let port_range = match (cli.media_port_low, cli.media_port_high) {
        (Some(lo), Some(hi)) => PortRange::Range(lo, hi),
        _ => PortRange::Any,
    };
    let media = MediaDispatcher::spawn(
        session.clone(),
        store,
        Arc::new(LocalStreamSupervisor::default()),
        MediaConfig::new(&cli.broker_host)
            .with_bind_addr(cli.bind_addr)
            .with_port_range(port_range)
            .with_max_reserved_ports(cli.max_reserved_ports)
            .with_media_db(&cli.media_db),
        shutdown.clone(),
    );

    info!(host = %cli.broker_host, "switchboard up, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    shutdown.cancel();
    drop(pool);
    drop(media);

    Ok(())
}

#[derive(Debug, Parser)]
#[command(name = "switchboard", version, author)]
/// Broker-backed request/response and media dispatch daemon.
struct ServerCli {
    /// Broker host the services open their channels on.
    #[arg(long, default_value = DEFAULT_BROKER_HOST)]
    broker_host: String,
    /// Worker count the request pool idles at.
    #[arg(long, default_value_t = 10)]
    pool_baseline: usize,
    /// Low end of the media port range; omit for OS-assigned ports.
    #[arg(long, requires = "media_port_high")]
    media_port_low: Option<u16>,
    /// High end of the media port range.
    #[arg(long, requires = "media_port_low")]
    media_port_high: Option<u16>,
    /// Cap on pre-bound media ports held in reserve.
    #[arg(long, default_value_t = 10)]
    max_reserved_ports: usize,
    /// Database assumed for unqualified media names.
    #[arg(long, default_value = "media")]
    media_db: String,
    /// Address the media ports bind on.
    #[arg(long, default_value = "0.0.0.0")]
    bind_addr: IpAddr,
}

/// Stream supervisor for local development: each child owns its pre-bound
/// listener, logs subscriber connects, and logs join requests.
#[derive(Debug, Default)]
struct LocalStreamSupervisor {
    next_id: AtomicU64,
}

#[async_trait::async_trait]
impl StreamSupervisor for LocalStreamSupervisor {
    async fn start_stream(
        &self,
        media: MediaLocator,
        reply_to: &str,
        mode: StreamMode,
        port: PortLease,
    ) -> SbResult<StreamChild> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (listeners, mut joins) = mpsc::unbounded_channel::<AddListener>();
        let liveness = CancellationToken::new();
        let listener = port.into_listener();
        info!(
            stream = id,
            port = listener.local_addr()?.port(),
            doc = %media.doc,
            ?mode,
            reply_to,
            "stream child started"
        );

        let token = liveness.clone();
        tokio::spawn(async move {
            let _exit = token.drop_guard();
            loop {
                tokio::select! {
                    join = joins.recv() => match join {
                        Some(join) => info!(stream = id, reply_to = %join.reply_to, "listener joined"),
                        None => break,
                    },
                    accepted = listener.accept() => match accepted {
                        Ok((_socket, peer)) => info!(stream = id, %peer, "subscriber connected"),
                        Err(err) => {
                            warn!(stream = id, %err, "accept failed, stream child exiting");
                            break;
                        }
                    },
                }
            }
        });

        Ok(StreamChild {
            id,
            listeners,
            liveness,
        })
    }
}
