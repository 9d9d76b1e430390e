//! Market Data Watchlist
//!
//! Consumer-side subscription multiplexing over a single provider channel:
//! - Login and service directory tracking
//! - Item request aggregation onto shared streams
//! - View (field subset) merging with staged commit/rollback
//! - Open-window pacing, pause/resume and priority aggregation
//! - Post acknowledgement tracking with timeouts
//! - Stream recovery across channel loss
//!
//! # Architecture
//!
//! ```text
//!   Application
//!       │ submit_msg / poll_event
//!   ┌───▼──────────────────────────┐
//!   │ Watchlist                    │
//!   │  ├─ login / directory        │
//!   │  ├─ requests ──► streams     │
//!   │  ├─ service cache, groups    │
//!   │  └─ timers ──► notifier task │
//!   └───┬──────────────────────────┘
//!       │ Codec + Transport
//!   Provider channel
//! ```
//!
//! The watchlist is single-owner: all calls come from one thread. Only the
//! timeout notifier runs on the tokio runtime, and it never touches state.

pub mod arena;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod item_group;
pub mod list;
pub mod notifier;
pub mod pool;
pub mod post;
pub mod request;
pub mod service_cache;
pub mod stream;
pub mod timer;
pub mod transport;
pub mod view;
pub mod watchlist;

pub use codec::{Codec, CodecError, JsonCodec};
pub use config::WatchlistConfig;
pub use error::WatchlistError;
pub use events::{SubmitOptions, WatchlistEvent, WatchlistStats};
pub use notifier::{ExpiryNotice, TimeoutNotifier};
pub use transport::{SendBuffer, SubmitStatus, Transport, TransportError};
pub use watchlist::{TimerOwner, Watchlist};

// Service version
pub const SERVICE_VERSION: &str = "0.1.0";
