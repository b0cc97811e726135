//! Cutover Bus - local message transport
//!
//! The privileged service and the per-user agents talk over a Unix-domain
//! socket carrying length-prefixed JSON frames (see `cutover-proto`).
//!
//! - [`ConnHub`] accepts connections, runs one sequential read loop per
//!   client, dispatches frames and serializes writes per connection.
//! - [`Dispatcher`] routes a decoded message to the single handler
//!   registered for its type, synthesizing acknowledgments and enforcing a
//!   per-call timeout and replay idempotency.
//! - [`ReconClient`] is the agent-side counterpart with an offline send
//!   queue, exponential-backoff reconnection and heartbeats.

pub mod client;
pub mod dispatcher;
pub mod hub;

pub use client::{ReconClient, ReconClientConfig};
pub use dispatcher::{Dispatcher, Handler, HandlerContext, HandlerResult};
pub use hub::{ConnHub, HubEvent};
