//! Type introspection and value conversion.
//!
//! - **types**: wire type tags and the [`TypeInfo`] descriptor
//! - **builder**: per-type member declarations and the descriptor cache
//! - **marshal**: backend values to wire values
//! - **args**: wire values to method arguments

pub mod args;
pub mod builder;
pub mod marshal;
pub mod types;

pub use args::{ArgResolver, FromArg, FromArgs, MethodReturn, Parsed, SignalArgs};
pub use builder::{TypeBuilder, RESERVED_METHODS};
pub use marshal::{Marshal, MarshalContext};
pub use types::{changed_signal, lower_first, SignalParam, TypeInfo, WireType, WireTyped};
