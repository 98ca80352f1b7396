//! Pre-bound TCP listener pool for streaming endpoints.
//!
//! Ports are bound in advance and handed out as live listeners: on narrow
//! port ranges, binding at hand-out time races other processes, so the pool
//! holds the bound socket itself and a lease transfers ownership. Once
//! leased, a port is never returned to the pool.

use std::collections::VecDeque;
use std::net::IpAddr;
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Cap on the number of pre-bound listeners held at once.
pub const MAX_RESERVED_PORTS: usize = 10;

/// How the pool picks ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRange {
    /// Ask the OS for any free port on each bind.
    Any,
    /// Bind ports in `[lo, hi]` in order, wrapping back to `lo` past `hi`.
    Range(u16, u16),
}

/// An OS-bound TCP listener held until handed to a stream child.
#[derive(Debug)]
pub struct PortLease {
    listener: TcpListener,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// Transfer ownership of the bound socket to a stream child.
    pub fn into_listener(self) -> TcpListener {
        self.listener
    }
}

/// Ordered queue of pre-bound listeners, refilled lazily.
#[derive(Debug)]
pub struct PortPool {
    bind_addr: IpAddr,
    range: PortRange,
    max_reserved: usize,
    /// Next port to try in `Range` mode.
    cursor: u16,
    leases: VecDeque<PortLease>,
}

impl PortPool {
    pub fn new(bind_addr: IpAddr, range: PortRange, max_reserved: usize) -> Self {
        let cursor = match range {
            PortRange::Range(lo, _) => lo,
            PortRange::Any => 0,
        };
        Self {
            bind_addr,
            range,
            max_reserved: max_reserved.max(1),
            cursor,
            leases: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Top the queue up to the cap. In range mode each attempt advances the
    /// cursor with wrap-around and individual bind failures are skipped; one
    /// full sweep of the range bounds the work.
    pub async fn fill(&mut self) {
        match self.range {
            PortRange::Any => {
                while self.leases.len() < self.max_reserved {
                    match TcpListener::bind((self.bind_addr, 0)).await {
                        Ok(listener) => self.leases.push_back(PortLease { listener }),
                        Err(err) => {
                            warn!(%err, "media port bind failed");
                            break;
                        }
                    }
                }
            }
            PortRange::Range(lo, hi) => {
                let span = (hi as u32 - lo as u32 + 1) as usize;
                let mut attempts = 0;
                while self.leases.len() < self.max_reserved && attempts < span {
                    let port = self.cursor;
                    self.cursor = if self.cursor >= hi { lo } else { self.cursor + 1 };
                    attempts += 1;
                    match TcpListener::bind((self.bind_addr, port)).await {
                        Ok(listener) => {
                            debug!(port, "media port reserved");
                            self.leases.push_back(PortLease { listener });
                        }
                        Err(err) => debug!(port, %err, "media port skipped"),
                    }
                }
            }
        }
    }

    /// Lease the head of the queue, refilling first when it ran dry.
    /// `None` means the whole range is currently exhausted.
    pub async fn next_port(&mut self) -> Option<PortLease> {
        if self.leases.is_empty() {
            self.fill().await;
        }
        self.leases.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn any_mode_respects_the_cap() {
        let mut pool = PortPool::new(LOCALHOST, PortRange::Any, 4);
        pool.fill().await;
        assert_eq!(pool.len(), 4);
        pool.fill().await;
        assert_eq!(pool.len(), 4);
    }

    #[tokio::test]
    async fn leased_ports_are_live_listeners() {
        let mut pool = PortPool::new(LOCALHOST, PortRange::Any, 2);
        let lease = pool.next_port().await.unwrap();
        assert_ne!(lease.port(), 0);
        // The socket is already bound; a second bind on the port must fail.
        let clash = TcpListener::bind((LOCALHOST, lease.port())).await;
        assert!(clash.is_err());
    }

    #[tokio::test]
    async fn occupied_range_yields_no_ports() {
        // Hold the only port of a single-port range.
        let holder = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let mut pool = PortPool::new(LOCALHOST, PortRange::Range(port, port), 4);
        assert!(pool.next_port().await.is_none());
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn exhausted_range_wraps_back_to_the_low_end() {
        // Find a free port, then use a single-port range around it.
        let probe = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut pool = PortPool::new(LOCALHOST, PortRange::Range(port, port), 4);
        let first = pool.next_port().await.expect("port should bind");
        assert_eq!(first.port(), port);
        // Range exhausted while the lease is alive.
        assert!(pool.next_port().await.is_none());

        // Releasing the lease lets the wrapped cursor retry from the low end.
        drop(first);
        let again = pool.next_port().await.expect("wrap should rebind");
        assert_eq!(again.port(), port);
    }
}
