//! Wire protocol shared by the backend and the client.
//!
//! - **Framing**: decimal length prefix, JSON payload, newline
//! - **Messages**: `command`-tagged JSON envelopes

pub mod frame;
pub mod message;

pub use frame::{read_frame, write_frame};
pub use message::{Inbound, Outbound};
