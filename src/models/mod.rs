//! Data models

pub mod anomaly;
pub mod change;
pub mod conversation;
pub mod flag;
pub mod metrics;
pub mod prediction;

pub use anomaly::*;
pub use change::*;
pub use conversation::*;
pub use flag::*;
pub use metrics::*;
pub use prediction::*;
