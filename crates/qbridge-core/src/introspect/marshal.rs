//! Backend values to wire values.
//!
//! Marshaling stops at object boundaries: a [`QPtr`] becomes a tagged
//! reference map and its own properties are never walked. Every object
//! encountered this way is registered on the spot and recorded as a child
//! of whatever is being marshaled.

use super::types::lower_first;
use crate::object::registry::Registry;
use crate::object::{Object, QPtr};
use crate::Result;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Conversion of a backend value into its wire representation.
pub trait Marshal {
    fn marshal(&self, cx: &mut MarshalContext<'_>) -> Result<Value>;
}

/// State for one marshaling pass.
pub struct MarshalContext<'a> {
    registry: &'a mut Registry,
    children: Vec<String>,
}

impl<'a> MarshalContext<'a> {
    pub(crate) fn new(registry: &'a mut Registry) -> Self {
        Self {
            registry,
            children: Vec::new(),
        }
    }

    /// Register `object` if needed and return its reference map.
    pub fn object_ref<T: Object>(&mut self, object: &QPtr<T>) -> Result<Value> {
        let id = self.registry.register(object.node(), None)?;
        self.registry.touch(&id);
        let value = self.registry.reference_value(&id)?;
        self.children.push(id);
        Ok(value)
    }

    /// Marshal a plain aggregate as a map of named fields.
    ///
    /// Field names go through the same first-letter lowering as property
    /// names.
    pub fn fields(&mut self, fields: &[(&str, &dyn Marshal)]) -> Result<Value> {
        let mut map = Map::with_capacity(fields.len());
        for (name, value) in fields {
            map.insert(lower_first(name), value.marshal(self)?);
        }
        Ok(Value::Object(map))
    }

    /// Identifiers of every object reached so far, duplicates included.
    pub(crate) fn into_children(self) -> Vec<String> {
        self.children
    }
}

macro_rules! marshal_via_json {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, _cx: &mut MarshalContext<'_>) -> Result<Value> {
                    Ok(Value::from(self.clone()))
                }
            }
        )+
    };
}

marshal_via_json!(bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64, String);

impl Marshal for str {
    fn marshal(&self, _cx: &mut MarshalContext<'_>) -> Result<Value> {
        Ok(Value::from(self))
    }
}

impl Marshal for char {
    fn marshal(&self, _cx: &mut MarshalContext<'_>) -> Result<Value> {
        Ok(Value::String(self.to_string()))
    }
}

impl Marshal for Value {
    fn marshal(&self, _cx: &mut MarshalContext<'_>) -> Result<Value> {
        Ok(self.clone())
    }
}

impl Marshal for Map<String, Value> {
    fn marshal(&self, _cx: &mut MarshalContext<'_>) -> Result<Value> {
        Ok(Value::Object(self.clone()))
    }
}

impl<T: Marshal> Marshal for [T] {
    fn marshal(&self, cx: &mut MarshalContext<'_>) -> Result<Value> {
        self.iter()
            .map(|item| item.marshal(cx))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array)
    }
}

impl<T: Marshal> Marshal for Vec<T> {
    fn marshal(&self, cx: &mut MarshalContext<'_>) -> Result<Value> {
        self.as_slice().marshal(cx)
    }
}

impl<V: Marshal, S> Marshal for HashMap<String, V, S> {
    fn marshal(&self, cx: &mut MarshalContext<'_>) -> Result<Value> {
        let mut map = Map::with_capacity(self.len());
        for (key, value) in self {
            map.insert(key.clone(), value.marshal(cx)?);
        }
        Ok(Value::Object(map))
    }
}

impl<V: Marshal> Marshal for BTreeMap<String, V> {
    fn marshal(&self, cx: &mut MarshalContext<'_>) -> Result<Value> {
        let mut map = Map::new();
        for (key, value) in self {
            map.insert(key.clone(), value.marshal(cx)?);
        }
        Ok(Value::Object(map))
    }
}

impl<T: Marshal> Marshal for Option<T> {
    fn marshal(&self, cx: &mut MarshalContext<'_>) -> Result<Value> {
        match self {
            Some(value) => value.marshal(cx),
            None => Ok(Value::Null),
        }
    }
}

impl<T: Marshal + ?Sized> Marshal for Box<T> {
    fn marshal(&self, cx: &mut MarshalContext<'_>) -> Result<Value> {
        (**self).marshal(cx)
    }
}

impl<T: Marshal + ?Sized> Marshal for &T {
    fn marshal(&self, cx: &mut MarshalContext<'_>) -> Result<Value> {
        (**self).marshal(cx)
    }
}

impl<T: Object> Marshal for QPtr<T> {
    fn marshal(&self, cx: &mut MarshalContext<'_>) -> Result<Value> {
        cx.object_ref(self)
    }
}

/// Implement [`Marshal`] and [`WireTyped`](crate::WireTyped) through
/// `serde` for a type that can never contain an object.
///
/// The wire type defaults to `map`.
#[macro_export]
macro_rules! marshal_with_serde {
    ($ty:ty) => {
        $crate::marshal_with_serde!($ty => $crate::WireType::Map);
    };
    ($ty:ty => $wire:expr) => {
        impl $crate::Marshal for $ty {
            fn marshal(
                &self,
                _cx: &mut $crate::MarshalContext<'_>,
            ) -> $crate::Result<$crate::serde_json::Value> {
                Ok($crate::serde_json::to_value(self)?)
            }
        }

        impl $crate::WireTyped for $ty {
            fn wire_type() -> $crate::WireType {
                $wire
            }
        }
    };
}
