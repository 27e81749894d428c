//! Structural type descriptors sent to the client.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Loose wire-level type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireType {
    Bool,
    Int,
    Double,
    String,
    Array,
    Map,
    Object,
    Var,
}

impl WireType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireType::Bool => "bool",
            WireType::Int => "int",
            WireType::Double => "double",
            WireType::String => "string",
            WireType::Array => "array",
            WireType::Map => "map",
            WireType::Object => "object",
            WireType::Var => "var",
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(WireType::Bool),
            "int" => Ok(WireType::Int),
            "double" => Ok(WireType::Double),
            "string" => Ok(WireType::String),
            "array" => Ok(WireType::Array),
            "map" => Ok(WireType::Map),
            "object" => Ok(WireType::Object),
            "var" => Ok(WireType::Var),
            other => Err(format!("unknown wire type '{}'", other)),
        }
    }
}

/// A named signal parameter, serialized as `"<type> <name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SignalParam {
    pub wire_type: WireType,
    pub name: String,
}

impl From<SignalParam> for String {
    fn from(param: SignalParam) -> Self {
        format!("{} {}", param.wire_type, param.name)
    }
}

impl TryFrom<String> for SignalParam {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (ty, name) = value
            .split_once(' ')
            .ok_or_else(|| format!("signal parameter '{}' has no name", value))?;
        Ok(SignalParam {
            wire_type: ty.parse()?,
            name: name.to_string(),
        })
    }
}

/// Complete description of one object type.
///
/// Maps are ordered so descriptors serialize deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub name: String,
    pub properties: BTreeMap<String, WireType>,
    pub methods: BTreeMap<String, Vec<WireType>>,
    pub signals: BTreeMap<String, Vec<SignalParam>>,
}

impl TypeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Lowercase the first character of a member name.
///
/// Applied to every method, signal and property name before it reaches
/// the client.
pub fn lower_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Name of the change signal for a property.
pub fn changed_signal(property: &str) -> String {
    format!("{}Changed", lower_first(property))
}

/// Compile-time wire type of a backend value.
pub trait WireTyped {
    fn wire_type() -> WireType;
}

macro_rules! wire_typed {
    ($wire:expr => $($ty:ty),+ $(,)?) => {
        $(
            impl WireTyped for $ty {
                fn wire_type() -> WireType {
                    $wire
                }
            }
        )+
    };
}

wire_typed!(WireType::Bool => bool);
wire_typed!(WireType::Int => i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);
wire_typed!(WireType::Double => f32, f64);
wire_typed!(WireType::String => String, str, char);
wire_typed!(WireType::Var => serde_json::Value);
wire_typed!(WireType::Map => serde_json::Map<String, serde_json::Value>);

impl<T: WireTyped> WireTyped for Vec<T> {
    fn wire_type() -> WireType {
        WireType::Array
    }
}

impl<T: WireTyped> WireTyped for [T] {
    fn wire_type() -> WireType {
        WireType::Array
    }
}

impl<V, S> WireTyped for HashMap<String, V, S> {
    fn wire_type() -> WireType {
        WireType::Map
    }
}

impl<V> WireTyped for BTreeMap<String, V> {
    fn wire_type() -> WireType {
        WireType::Map
    }
}

impl<T: WireTyped> WireTyped for Option<T> {
    fn wire_type() -> WireType {
        T::wire_type()
    }
}

impl<T: WireTyped + ?Sized> WireTyped for Box<T> {
    fn wire_type() -> WireType {
        T::wire_type()
    }
}

impl<T: WireTyped + ?Sized> WireTyped for &T {
    fn wire_type() -> WireType {
        T::wire_type()
    }
}
