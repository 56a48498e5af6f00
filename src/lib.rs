//! # panmux
//!
//! Multipath session layer for path-aware networks.
//!
//! panmux keeps a quality record of every known path to a peer, picks a
//! subset of those paths with a pluggable selector, and maintains one
//! connection per selected path. The selection is revisited periodically
//! and the live connections are converged to it with as little churn as
//! possible.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Application Layer                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          SessionController (listen / connect / read / write)    │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │   Selector + history         │   Scheduler (first path, RR)     │
//! ├──────────────────────────────┼──────────────────────────────────┤
//! │   PathQualityDatabase        │   ConnectionSet + reconcile      │
//! │   (PathLookup, PathMetrics)  │   multi-port handshake           │
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │               Transport (TCP frames / in-memory)                │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)]        // Numeric literals are clear
#![allow(clippy::cast_possible_truncation)]  // Bandwidth and port arithmetic
#![allow(clippy::cast_sign_loss)]            // Rates are always positive
#![allow(clippy::cast_precision_loss)]       // Acceptable for stats
#![allow(clippy::similar_names)]             // read/write pairs are intentionally named
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::redundant_pub_crate)]       // Explicit visibility
#![allow(clippy::too_many_lines)]            // Complete implementations
#![allow(clippy::future_not_send)]           // Async internals
#![allow(clippy::struct_excessive_bools)]    // Boolean config fields are appropriate
#![allow(clippy::match_same_arms)]           // Explicit arm per variant is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::ignored_unit_patterns)]     // Ok(_) vs Ok(()) is stylistic

pub mod config;
pub mod error;
pub mod metrics;
pub mod path;
pub mod protocol;
pub mod quality;
pub mod selection;
pub mod session;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for wire compatibility
pub const PROTOCOL_VERSION: u8 = 1;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::{MetricsRegistry, PathMetrics};
    pub use crate::path::{Path, PathId, PathLookup, StaticTopology};
    pub use crate::quality::{PathQuality, PathQualityDatabase, PathSet};
    pub use crate::selection::{DisjointSelector, SelectionHistory, Selector, SelectorKind};
    pub use crate::session::{ConnectOptions, SessionController, SessionEvent};
    pub use crate::transport::{create_transport, MemoryNetwork, Transport, TransportConfig};
    pub use crate::types::*;
}
