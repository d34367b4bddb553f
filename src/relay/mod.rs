//! Notification relay polling.
//!
//! Approximates push notifications by polling a relay topic on a fixed interval and
//! surfacing messages newer than the subscription's cursor.

mod message;
mod poller;
mod topic;

pub use poller::{PollSettings, Poller};
pub use topic::generate_topic;
