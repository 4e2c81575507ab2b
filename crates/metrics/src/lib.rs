//! Metric names for feedlink, recorded through the `metrics` facade.
//!
//! Crates gate their instrumentation behind a `metrics` cargo feature and record
//! with the re-exported macros:
//!
//! ```rust,ignore
//! use feedlink_metrics::{counter, feeds as feed_metrics};
//!
//! counter!(feed_metrics::MESSAGES_RECEIVED_TOTAL).increment(1);
//! ```
//!
//! Nothing is exported until the embedding process installs a recorder.

mod definitions;

pub use definitions::*;

pub use metrics::{counter, gauge};
