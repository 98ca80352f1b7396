//! Broker-backed services for a telephony call-management platform.
//!
//! Three long-running services mediate traffic between application code and
//! a shared message broker:
//!
//! - [`session::SessionManager`] owns per-host broker connections and opens
//!   channels on behalf of client processes, tearing everything down through
//!   liveness watches.
//! - [`pool::RequestPool`] serves outbound request/response transactions
//!   over exclusive reply queues with an elastic worker pool.
//! - [`media::MediaDispatcher`] consumes media-fetch requests, reserves
//!   pre-bound TCP listener ports, and starts or joins streaming children.
//!
//! The broker itself is reached through the [`broker`] trait seam;
//! [`broker::LocalBroker`] is the in-process implementation.

pub mod broker;
pub mod envelope;
pub mod error;
pub mod media;
pub mod pool;
pub mod session;

pub use error::Error;
pub use media::{MediaConfig, MediaDispatcher, MediaHandle};
pub use pool::{PoolConfig, PoolHandle, RequestPool};
pub use session::{SessionHandle, SessionManager};

pub const DEFAULT_BROKER_HOST: &str = "localhost";

pub type SbResult<T> = std::result::Result<T, crate::error::Error>;
