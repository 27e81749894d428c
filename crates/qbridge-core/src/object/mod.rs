//! Backend objects and the handles that point at them.
//!
//! Application types implement [`Object`] and are shared through
//! [`QPtr`]. The handle owns the value behind a mutex and carries the
//! registry identity next to it, so an object never needs bookkeeping
//! fields of its own.

pub mod registry;

use crate::connection::Context;
use crate::error::InvokeError;
use crate::introspect::builder::{short_type_name, TypeCache, TypeDef};
use crate::introspect::{MarshalContext, TypeBuilder, TypeInfo, WireType, WireTyped};
use crate::{BridgeError, Result};
use registry::Registry;
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

/// A type that can be exposed to the client.
pub trait Object: Sized + Send + 'static {
    /// Declare properties, methods and signals.
    fn describe(t: &mut TypeBuilder<Self>);

    /// Name of the type as seen by the client.
    fn type_name() -> String {
        short_type_name::<Self>()
    }

    /// Called once, when the object is first registered.
    fn init(&mut self) {}
}

pub(crate) struct Node<T> {
    handle: OnceLock<String>,
    def: OnceLock<Arc<TypeDef<T>>>,
    value: Mutex<T>,
}

impl<T: Object> Node<T> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn def(&self) -> Option<&Arc<TypeDef<T>>> {
        self.def.get()
    }
}

/// Type-erased view of a node, as stored in the registry.
pub(crate) trait AnyNode: Send + Sync {
    fn id(&self) -> Option<&str>;

    fn assign_id(&self, id: &str);

    /// Resolve the type descriptor, describing the type on first use.
    fn prepare(&self, types: &mut TypeCache) -> Result<Arc<TypeInfo>>;

    fn marshal_properties(&self, cx: &mut MarshalContext<'_>) -> Result<Map<String, Value>>;

    fn invoke(
        &self,
        method: &str,
        params: &[Value],
        cx: &mut Context<'_>,
    ) -> std::result::Result<(), InvokeError>;

    /// Run the attach hook and `Object::init` after first registration.
    fn attached(self: Arc<Self>, registry: &mut Registry) -> Result<()>;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Object> AnyNode for Node<T> {
    fn id(&self) -> Option<&str> {
        self.handle.get().map(String::as_str)
    }

    fn assign_id(&self, id: &str) {
        let _ = self.handle.set(id.to_string());
    }

    fn prepare(&self, types: &mut TypeCache) -> Result<Arc<TypeInfo>> {
        if let Some(def) = self.def() {
            return Ok(def.info.clone());
        }
        let def = types.get::<T>()?;
        Ok(self.def.get_or_init(|| def).info.clone())
    }

    fn marshal_properties(&self, cx: &mut MarshalContext<'_>) -> Result<Map<String, Value>> {
        let def = self
            .def()
            .cloned()
            .ok_or_else(|| BridgeError::Other(format!("{} is not registered", T::type_name())))?;

        let value = self.lock();
        let mut data = Map::new();
        for (name, get) in &def.members.properties {
            data.insert(name.clone(), get(&value, cx)?);
        }
        Ok(data)
    }

    fn invoke(
        &self,
        method: &str,
        params: &[Value],
        cx: &mut Context<'_>,
    ) -> std::result::Result<(), InvokeError> {
        let unknown = || InvokeError::UnknownMethod {
            method: method.to_string(),
        };
        let def = self.def().cloned().ok_or_else(unknown)?;
        let invoke = def.members.methods.get(method).ok_or_else(unknown)?;

        let mut value = self.lock();
        invoke(&mut value, cx, params)
    }

    fn attached(self: Arc<Self>, registry: &mut Registry) -> Result<()> {
        if let Some(hook) = self.def().and_then(|def| def.members.attach) {
            hook(&self, registry)?;
        }
        self.lock().init();
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Shared handle to a backend object.
///
/// Cloning the handle shares the object. Identity is assigned the first
/// time the object is registered and kept for the life of the handle,
/// including across eviction and reactivation.
pub struct QPtr<T> {
    node: Arc<Node<T>>,
}

impl<T: Object> QPtr<T> {
    pub fn new(value: T) -> Self {
        Self {
            node: Arc::new(Node {
                handle: OnceLock::new(),
                def: OnceLock::new(),
                value: Mutex::new(value),
            }),
        }
    }

    /// Handle whose descriptor is fixed up front, as for creatable types.
    pub(crate) fn with_def(value: T, def: Arc<TypeDef<T>>) -> Self {
        let ptr = Self::new(value);
        let _ = ptr.node.def.set(def);
        ptr
    }

    /// Lock the object for reading or mutation.
    ///
    /// The connection locks objects while marshaling and invoking; do not
    /// hold this guard across calls into the connection.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.node.lock()
    }

    /// Registry identifier, once the object has been registered.
    pub fn id(&self) -> Option<&str> {
        self.node.handle.get().map(String::as_str)
    }

    pub fn is_initialized(&self) -> bool {
        self.node.handle.get().is_some()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.node, &b.node)
    }

    pub(crate) fn node(&self) -> Arc<dyn AnyNode> {
        self.node.clone()
    }

    pub(crate) fn from_any(node: Arc<dyn AnyNode>) -> Option<Self> {
        node.as_any()
            .downcast::<Node<T>>()
            .ok()
            .map(|node| Self { node })
    }
}

impl<T> Clone for QPtr<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T: Object> PartialEq for QPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T: Object> Eq for QPtr<T> {}

impl<T: Object> fmt::Debug for QPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QPtr")
            .field("type", &T::type_name())
            .field("id", &self.id())
            .finish()
    }
}

impl<T: Object> WireTyped for QPtr<T> {
    fn wire_type() -> WireType {
        WireType::Object
    }
}
