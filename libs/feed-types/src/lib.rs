//! Types library for the market-data watchlist
//!
//! This library provides the message model exchanged between the watchlist,
//! the transport/codec collaborators beneath it, and the application above it.
//! Everything here is plain data: no I/O, no timers, no shared state.
//!
//! # Modules
//! - `ids`: Stream, service and group identifiers
//! - `domain`: Message domains (login, directory, market price, ...)
//! - `qos`: Quality-of-service and range matching
//! - `state`: Stream/data state carried by refresh and status messages
//! - `key`: Message keys
//! - `view`: Field subsets requested on item streams
//! - `directory`: Service directory entries and symbol-list entries
//! - `msg`: The eight message classes
//! - `errors`: Error taxonomy

pub mod ids;
pub mod domain;
pub mod qos;
pub mod state;
pub mod key;
pub mod view;
pub mod directory;
pub mod msg;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::domain::*;
    pub use crate::qos::*;
    pub use crate::state::*;
    pub use crate::key::*;
    pub use crate::view::*;
    pub use crate::directory::*;
    pub use crate::msg::*;
    pub use crate::errors::*;
}
