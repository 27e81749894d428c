//! Wire values to method arguments, and signal arguments to wire values.
//!
//! Every parameter is converted in a fixed order:
//!
//! 1. A tagged object reference resolves through the registry. An unknown
//!    identifier resolves to nil instead of failing.
//! 2. A value whose wire shape already matches passes through.
//! 3. Numbers convert between integer and floating widths.
//! 4. [`Parsed`] parameters accept a string and parse it with `FromStr`.
//!
//! Nil becomes the zero value of scalar parameters and `None` for options.

use super::marshal::{Marshal, MarshalContext};
use super::types::{WireType, WireTyped};
use crate::config::ProtocolConfig;
use crate::error::InvokeError;
use crate::object::registry::Registry;
use crate::object::{AnyNode, Object, QPtr};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

/// Read-only view of the registry used while converting arguments.
pub struct ArgResolver<'a> {
    registry: &'a Registry,
}

pub(crate) enum Resolved<'v> {
    Nil,
    Object(Arc<dyn AnyNode>),
    Value(&'v Value),
}

impl<'a> ArgResolver<'a> {
    pub(crate) fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    pub(crate) fn resolve<'v>(&self, value: &'v Value) -> Resolved<'v> {
        if let Some(id) = object_ref_identifier(value) {
            return match self.registry.node(id) {
                Some(node) => Resolved::Object(node),
                None => Resolved::Nil,
            };
        }
        if value.is_null() {
            Resolved::Nil
        } else {
            Resolved::Value(value)
        }
    }

    /// True for null and for references to objects that do not exist.
    pub fn is_nil(&self, value: &Value) -> bool {
        matches!(self.resolve(value), Resolved::Nil)
    }
}

/// Identifier of a tagged object reference map.
pub(crate) fn object_ref_identifier(value: &Value) -> Option<&str> {
    let map = value.as_object()?;
    if map.get(ProtocolConfig::OBJECT_TAG_KEY)?.as_str()? != ProtocolConfig::OBJECT_TAG_VALUE {
        return None;
    }
    map.get("identifier")?.as_str()
}

fn mismatch(resolved: &Resolved<'_>) -> String {
    let kind = match resolved {
        Resolved::Nil => "null",
        Resolved::Object(_) => "object",
        Resolved::Value(Value::Null) => "null",
        Resolved::Value(Value::Bool(_)) => "bool",
        Resolved::Value(Value::Number(_)) => "number",
        Resolved::Value(Value::String(_)) => "string",
        Resolved::Value(Value::Array(_)) => "array",
        Resolved::Value(Value::Object(_)) => "map",
    };
    format!("got {}", kind)
}

/// A single method parameter type.
pub trait FromArg: WireTyped + Sized {
    fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String>;
}

impl FromArg for bool {
    fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String> {
        match args.resolve(value) {
            Resolved::Nil => Ok(false),
            Resolved::Value(Value::Bool(b)) => Ok(*b),
            other => Err(mismatch(&other)),
        }
    }
}

fn number_to_int<T>(n: &Number) -> Result<T, String>
where
    T: TryFrom<i64> + TryFrom<u64>,
{
    let converted = if let Some(i) = n.as_i64() {
        <T as TryFrom<i64>>::try_from(i).ok()
    } else if let Some(u) = n.as_u64() {
        <T as TryFrom<u64>>::try_from(u).ok()
    } else {
        n.as_f64()
            .map(f64::trunc)
            .filter(|f| *f >= i64::MIN as f64 && *f < i64::MAX as f64)
            .and_then(|f| <T as TryFrom<i64>>::try_from(f as i64).ok())
    };
    converted.ok_or_else(|| format!("{} is out of range", n))
}

macro_rules! from_arg_int {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl FromArg for $ty {
                fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String> {
                    match args.resolve(value) {
                        Resolved::Nil => Ok(0),
                        Resolved::Value(Value::Number(n)) => number_to_int(n),
                        other => Err(mismatch(&other)),
                    }
                }
            }
        )+
    };
}

from_arg_int!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! from_arg_float {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl FromArg for $ty {
                fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String> {
                    match args.resolve(value) {
                        Resolved::Nil => Ok(0.0),
                        Resolved::Value(Value::Number(n)) => n
                            .as_f64()
                            .map(|f| f as $ty)
                            .ok_or_else(|| format!("{} is not representable", n)),
                        other => Err(mismatch(&other)),
                    }
                }
            }
        )+
    };
}

from_arg_float!(f32, f64);

impl FromArg for String {
    fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String> {
        match args.resolve(value) {
            Resolved::Nil => Ok(String::new()),
            Resolved::Value(Value::String(s)) => Ok(s.clone()),
            other => Err(mismatch(&other)),
        }
    }
}

impl FromArg for Value {
    fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String> {
        match args.resolve(value) {
            Resolved::Nil => Ok(Value::Null),
            _ => Ok(value.clone()),
        }
    }
}

impl FromArg for Map<String, Value> {
    fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String> {
        match args.resolve(value) {
            Resolved::Nil => Ok(Map::new()),
            Resolved::Value(Value::Object(map)) => Ok(map.clone()),
            other => Err(mismatch(&other)),
        }
    }
}

impl<T: FromArg> FromArg for Vec<T> {
    fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String> {
        match args.resolve(value) {
            Resolved::Nil => Ok(Vec::new()),
            Resolved::Value(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    T::from_arg(item, args).map_err(|e| format!("element {}: {}", i, e))
                })
                .collect(),
            other => Err(mismatch(&other)),
        }
    }
}

fn map_entries<V: FromArg>(
    value: &Value,
    args: &ArgResolver<'_>,
) -> Result<Vec<(String, V)>, String> {
    match args.resolve(value) {
        Resolved::Nil => Ok(Vec::new()),
        Resolved::Value(Value::Object(map)) => map
            .iter()
            .map(|(key, item)| {
                V::from_arg(item, args)
                    .map(|v| (key.clone(), v))
                    .map_err(|e| format!("key {}: {}", key, e))
            })
            .collect(),
        other => Err(mismatch(&other)),
    }
}

impl<V: FromArg> FromArg for HashMap<String, V> {
    fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String> {
        map_entries(value, args).map(|entries| entries.into_iter().collect())
    }
}

impl<V: FromArg> FromArg for BTreeMap<String, V> {
    fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String> {
        map_entries(value, args).map(|entries| entries.into_iter().collect())
    }
}

impl<T: FromArg> FromArg for Option<T> {
    fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String> {
        if args.is_nil(value) {
            Ok(None)
        } else {
            T::from_arg(value, args).map(Some)
        }
    }
}

/// A handle parameter must name a live object. References to unknown
/// identifiers and null fail the conversion; take `Option<QPtr<T>>` to
/// receive them as `None` instead.
impl<T: Object> FromArg for QPtr<T> {
    fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String> {
        match args.resolve(value) {
            Resolved::Nil => Err("no such object".to_string()),
            Resolved::Object(node) => QPtr::from_any(node)
                .ok_or_else(|| format!("object is not a {}", T::type_name())),
            other => Err(mismatch(&other)),
        }
    }
}

/// Parameter parsed from its text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Parsed<T>(pub T);

impl<T> Parsed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Parsed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> WireTyped for Parsed<T> {
    fn wire_type() -> WireType {
        WireType::String
    }
}

impl<T> FromArg for Parsed<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    fn from_arg(value: &Value, args: &ArgResolver<'_>) -> Result<Self, String> {
        match args.resolve(value) {
            Resolved::Value(Value::String(s)) => {
                s.parse::<T>().map(Parsed).map_err(|e| e.to_string())
            }
            other => Err(mismatch(&other)),
        }
    }
}

/// Full positional parameter list of a method.
pub trait FromArgs: Sized {
    fn arg_types() -> Vec<WireType>;
    fn from_args(method: &str, params: &[Value], args: &ArgResolver<'_>)
        -> Result<Self, InvokeError>;
}

fn check_count(method: &str, params: &[Value], expected: usize) -> Result<(), InvokeError> {
    if params.len() != expected {
        return Err(InvokeError::ArgumentCount {
            method: method.to_string(),
            expected,
            provided: params.len(),
        });
    }
    Ok(())
}

fn convert<A: FromArg>(
    method: &str,
    params: &[Value],
    index: usize,
    args: &ArgResolver<'_>,
) -> Result<A, InvokeError> {
    A::from_arg(&params[index], args).map_err(|message| InvokeError::ArgumentType {
        method: method.to_string(),
        index,
        expected: A::wire_type().to_string(),
        message,
    })
}

impl FromArgs for () {
    fn arg_types() -> Vec<WireType> {
        Vec::new()
    }

    fn from_args(
        method: &str,
        params: &[Value],
        _args: &ArgResolver<'_>,
    ) -> Result<Self, InvokeError> {
        check_count(method, params, 0)
    }
}

macro_rules! from_args_tuple {
    ($len:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: FromArg),+> FromArgs for ($($name,)+) {
            fn arg_types() -> Vec<WireType> {
                vec![$($name::wire_type()),+]
            }

            fn from_args(
                method: &str,
                params: &[Value],
                args: &ArgResolver<'_>,
            ) -> Result<Self, InvokeError> {
                check_count(method, params, $len)?;
                Ok(($(convert::<$name>(method, params, $idx, args)?,)+))
            }
        }
    };
}

from_args_tuple!(1; A: 0);
from_args_tuple!(2; A: 0, B: 1);
from_args_tuple!(3; A: 0, B: 1, C: 2);
from_args_tuple!(4; A: 0, B: 1, C: 2, D: 3);
from_args_tuple!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
from_args_tuple!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

/// Positional arguments of an emitted signal.
pub trait SignalArgs {
    fn arg_types() -> Vec<WireType>;
    fn marshal_args(&self, cx: &mut MarshalContext<'_>) -> crate::Result<Vec<Value>>;
}

impl SignalArgs for () {
    fn arg_types() -> Vec<WireType> {
        Vec::new()
    }

    fn marshal_args(&self, _cx: &mut MarshalContext<'_>) -> crate::Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

macro_rules! signal_args_tuple {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Marshal + WireTyped),+> SignalArgs for ($($name,)+) {
            fn arg_types() -> Vec<WireType> {
                vec![$($name::wire_type()),+]
            }

            fn marshal_args(&self, cx: &mut MarshalContext<'_>) -> crate::Result<Vec<Value>> {
                Ok(vec![$(self.$idx.marshal(cx)?),+])
            }
        }
    };
}

signal_args_tuple!(A: 0);
signal_args_tuple!(A: 0, B: 1);
signal_args_tuple!(A: 0, B: 1, C: 2);
signal_args_tuple!(A: 0, B: 1, C: 2, D: 3);
signal_args_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);
signal_args_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

/// Return value of a method. Only failures are reported.
pub trait MethodReturn {
    fn into_invoke_result(self) -> Result<(), InvokeError>;
}

impl MethodReturn for () {
    fn into_invoke_result(self) -> Result<(), InvokeError> {
        Ok(())
    }
}

impl<T, E> MethodReturn for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn into_invoke_result(self) -> Result<(), InvokeError> {
        self.map(|_| ()).map_err(|e| InvokeError::Failed(e.into()))
    }
}
