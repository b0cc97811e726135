//! Capability ports (driven/secondary ports)
//!
//! The coordination core never touches OS or provider APIs directly. Each
//! external capability is a small trait implemented by an adapter and
//! injected at startup. Ports return `anyhow::Result` because their errors
//! are adapter-specific; the services translate them into the taxonomy.

pub mod activity_source;
pub mod clock;
pub mod cloud_connector;
pub mod escalation_sink;
pub mod profile_detector;

pub use activity_source::{ActivitySnapshot, ActivitySource};
pub use clock::{Clock, SystemClock};
pub use cloud_connector::{CloudConnector, FileSyncState, SyncProgressSample};
pub use escalation_sink::EscalationSink;
pub use profile_detector::{DetectedProfile, ProfileDetector};
