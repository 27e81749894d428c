//! qbridge Core - Live object graph synchronization for UI clients.
//!
//! This crate exposes a graph of backend objects to a client over any byte
//! stream. The client sees each object's properties, calls its methods and
//! receives its signals. List models are kept in sync with row deltas.
//!
//! # Example
//!
//! ```rust,ignore
//! use qbridge_core::{Connection, Context, Object, QPtr, TypeBuilder};
//!
//! #[derive(Default)]
//! struct Counter {
//!     value: i64,
//! }
//!
//! impl Counter {
//!     fn add(&mut self, cx: &mut Context<'_>, amount: i64) {
//!         self.value += amount;
//!         cx.changed_this("value");
//!     }
//! }
//!
//! impl Object for Counter {
//!     fn describe(t: &mut TypeBuilder<Self>) {
//!         t.property("value", |c: &Counter| &c.value)
//!             .method("add", |c: &mut Counter, cx, (amount,): (i64,)| c.add(cx, amount));
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> qbridge_core::Result<()> {
//!     let root = QPtr::new(Counter::default());
//!     let mut conn = Connection::new_split(tokio::io::stdin(), tokio::io::stdout(), root);
//!     conn.run().await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod introspect;
pub mod model;
pub mod object;
pub mod protocol;

// Re-export commonly used types
pub use config::{ConnectionConfig, LifecycleConfig, ProtocolConfig};
pub use connection::{Connection, Context, SharedConnection};
pub use error::{BridgeError, InvokeError, Result};
pub use introspect::{
    FromArg, FromArgs, Marshal, MarshalContext, MethodReturn, Parsed, SignalArgs, SignalParam,
    TypeBuilder, TypeInfo, WireType, WireTyped,
};
pub use model::{
    sort_inserted, DataSource, Model, ModelApi, RowsBulkSource, SortableDataSource,
};
pub use object::{Object, QPtr};

#[doc(hidden)]
pub use serde_json;
