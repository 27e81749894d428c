//! Per-type member declarations and the type descriptor cache.
//!
//! A type declares its properties, methods and signals once through
//! [`Object::describe`]. The resulting [`TypeDef`] holds both the
//! [`TypeInfo`] sent to the client and the accessors used to marshal and
//! invoke instances.

use super::args::{FromArgs, MethodReturn, SignalArgs};
use super::marshal::{Marshal, MarshalContext};
use super::types::{changed_signal, lower_first, SignalParam, TypeInfo, WireType, WireTyped};
use crate::connection::Context;
use crate::error::InvokeError;
use crate::object::registry::Registry;
use crate::object::{Node, Object};
use crate::{BridgeError, Result};
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Method names owned by the object infrastructure. Never exposed.
pub const RESERVED_METHODS: [&str; 8] = [
    "marshalJSON",
    "connection",
    "identifier",
    "referenced",
    "emit",
    "resetProperties",
    "changed",
    "initObject",
];

pub(crate) type Getter<T> =
    Arc<dyn Fn(&T, &mut MarshalContext<'_>) -> Result<Value> + Send + Sync>;
pub(crate) type Invoker<T> = Arc<
    dyn Fn(&mut T, &mut Context<'_>, &[Value]) -> std::result::Result<(), InvokeError>
        + Send
        + Sync,
>;
pub(crate) type AttachHook<T> = fn(&Arc<Node<T>>, &mut Registry) -> Result<()>;

struct Member<K> {
    name: String,
    depth: usize,
    kind: K,
}

/// Collects the members of one type.
pub struct TypeBuilder<T> {
    name: String,
    properties: Vec<Member<(WireType, Getter<T>)>>,
    methods: Vec<Member<(Vec<WireType>, Invoker<T>)>>,
    signals: Vec<Member<Vec<SignalParam>>>,
    attach: Option<AttachHook<T>>,
    errors: Vec<String>,
}

impl<T: Object> TypeBuilder<T> {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            methods: Vec::new(),
            signals: Vec::new(),
            attach: None,
            errors: Vec::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.name
    }

    /// Declare a property read through a field accessor.
    pub fn property<P, F>(&mut self, name: &str, get: F) -> &mut Self
    where
        P: Marshal + WireTyped + ?Sized,
        F: Fn(&T) -> &P + Send + Sync + 'static,
    {
        let getter: Getter<T> =
            Arc::new(move |value: &T, cx: &mut MarshalContext<'_>| get(value).marshal(cx));
        self.push_property(lower_first(name), 0, P::wire_type(), getter);
        self
    }

    /// Declare a property whose wire value is computed on every marshal.
    pub fn property_fn<F>(&mut self, name: &str, wire_type: WireType, get: F) -> &mut Self
    where
        F: Fn(&T, &mut MarshalContext<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        self.push_property(lower_first(name), 0, wire_type, Arc::new(get));
        self
    }

    /// Declare a method callable by the client.
    ///
    /// Reserved infrastructure names are skipped with a warning.
    pub fn method<A, R, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: FromArgs + 'static,
        R: MethodReturn + 'static,
        F: Fn(&mut T, &mut Context<'_>, A) -> R + Send + Sync + 'static,
    {
        let name = lower_first(name);
        if RESERVED_METHODS.contains(&name.as_str()) {
            warn!(
                type_name = %self.name,
                method = %name,
                "Skipping method with reserved name"
            );
            return self;
        }
        if self.methods.iter().any(|m| m.depth == 0 && m.name == name) {
            self.errors.push(format!("method {} declared twice", name));
            return self;
        }

        let method = name.clone();
        let invoker: Invoker<T> =
            Arc::new(move |value: &mut T, cx: &mut Context<'_>, params: &[Value]| {
                let args = A::from_args(&method, params, &cx.arg_resolver())?;
                f(value, cx, args).into_invoke_result()
            });
        self.methods.push(Member {
            name,
            depth: 0,
            kind: (A::arg_types(), invoker),
        });
        self
    }

    /// Declare a signal. Every parameter needs a name.
    pub fn signal<A: SignalArgs>(&mut self, name: &str, params: &[&str]) -> &mut Self {
        let name = lower_first(name);
        let types = A::arg_types();
        if types.len() != params.len() {
            self.errors.push(format!(
                "signal {} has {} parameters but {} names",
                name,
                types.len(),
                params.len()
            ));
            return self;
        }
        if params.iter().any(|p| p.trim().is_empty() || p.contains(' ')) {
            self.errors
                .push(format!("signal {} has an unnamed parameter", name));
            return self;
        }
        if self.signals.iter().any(|s| s.depth == 0 && s.name == name) {
            self.errors.push(format!("signal {} declared twice", name));
            return self;
        }

        let params = types
            .into_iter()
            .zip(params)
            .map(|(wire_type, name)| SignalParam {
                wire_type,
                name: name.to_string(),
            })
            .collect();
        self.signals.push(Member {
            name,
            depth: 0,
            kind: params,
        });
        self
    }

    /// Inherit the members of `B`, reached through a projection.
    ///
    /// Lookup is breadth-first: members declared directly on this type
    /// shadow inherited ones of the same name, and shallower inheritance
    /// shadows deeper.
    pub fn include<B: Object>(
        &mut self,
        project: fn(&T) -> &B,
        project_mut: fn(&mut T) -> &mut B,
    ) -> &mut Self {
        let mut base = TypeBuilder::<B>::new(B::type_name());
        B::describe(&mut base);

        self.errors.extend(
            base.errors
                .into_iter()
                .map(|e| format!("inherited from {}: {}", base.name, e)),
        );
        for m in base.properties {
            let (wire_type, get) = m.kind;
            let getter: Getter<T> =
                Arc::new(move |value: &T, cx: &mut MarshalContext<'_>| get(project(value), cx));
            self.push_property(m.name, m.depth + 1, wire_type, getter);
        }
        for m in base.methods {
            let (types, invoke) = m.kind;
            let invoker: Invoker<T> =
                Arc::new(move |value: &mut T, cx: &mut Context<'_>, params: &[Value]| {
                    invoke(project_mut(value), cx, params)
                });
            self.methods.push(Member {
                name: m.name,
                depth: m.depth + 1,
                kind: (types, invoker),
            });
        }
        for m in base.signals {
            self.signals.push(Member {
                name: m.name,
                depth: m.depth + 1,
                kind: m.kind,
            });
        }
        self
    }

    pub(crate) fn set_attach(&mut self, hook: AttachHook<T>) {
        self.attach = Some(hook);
    }

    fn push_property(&mut self, name: String, depth: usize, wire_type: WireType, get: Getter<T>) {
        if depth == 0 && self.properties.iter().any(|m| m.depth == 0 && m.name == name) {
            self.errors.push(format!("property {} declared twice", name));
            return;
        }
        self.properties.push(Member {
            name,
            depth,
            kind: (wire_type, get),
        });
    }

    pub(crate) fn build(self) -> Result<TypeDef<T>> {
        if let Some(message) = self.errors.into_iter().next() {
            return Err(BridgeError::type_definition(&self.name, message));
        }

        let mut info = TypeInfo::new(self.name.clone());
        let mut properties = Vec::new();
        for m in shallowest(self.properties) {
            let (wire_type, get) = m.kind;
            info.properties.insert(m.name.clone(), wire_type);
            properties.push((m.name, get));
        }

        let mut methods = HashMap::new();
        for m in shallowest(self.methods) {
            let (types, invoke) = m.kind;
            info.methods.insert(m.name.clone(), types);
            methods.insert(m.name, invoke);
        }

        for m in shallowest(self.signals) {
            info.signals.insert(m.name, m.kind);
        }

        for (property, _) in &properties {
            let signal = changed_signal(property);
            match info.signals.get(&signal) {
                Some(params) if !params.is_empty() => {
                    return Err(BridgeError::type_definition(
                        &self.name,
                        format!("change signal {} must not have parameters", signal),
                    ));
                }
                Some(_) => {}
                None => {
                    info.signals.insert(signal, Vec::new());
                }
            }
        }

        Ok(TypeDef {
            info: Arc::new(info),
            members: Arc::new(Members {
                properties,
                methods,
                attach: self.attach,
            }),
        })
    }
}

/// Keep the first member of each name at the smallest depth.
fn shallowest<K>(mut members: Vec<Member<K>>) -> Vec<Member<K>> {
    members.sort_by_key(|m| m.depth);
    let mut seen = HashSet::new();
    members.retain(|m| seen.insert(m.name.clone()));
    members
}

pub(crate) struct Members<T> {
    pub(crate) properties: Vec<(String, Getter<T>)>,
    pub(crate) methods: HashMap<String, Invoker<T>>,
    pub(crate) attach: Option<AttachHook<T>>,
}

/// Descriptor plus accessors for one backend type.
pub(crate) struct TypeDef<T> {
    pub(crate) info: Arc<TypeInfo>,
    pub(crate) members: Arc<Members<T>>,
}

impl<T> TypeDef<T> {
    /// Same members under another type name.
    pub(crate) fn renamed(&self, name: &str) -> Self {
        let mut info = (*self.info).clone();
        info.name = name.to_string();
        Self {
            info: Arc::new(info),
            members: self.members.clone(),
        }
    }
}

/// Descriptors computed so far, keyed by backend type.
///
/// The client caches descriptors by name, so each type name belongs to
/// exactly one backend type.
#[derive(Default)]
pub(crate) struct TypeCache {
    defs: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    names: HashMap<String, TypeId>,
}

impl TypeCache {
    pub(crate) fn get<T: Object>(&mut self) -> Result<Arc<TypeDef<T>>> {
        if let Some(def) = self.defs.get(&TypeId::of::<T>()) {
            if let Ok(def) = def.clone().downcast::<TypeDef<T>>() {
                return Ok(def);
            }
        }

        let name = T::type_name();
        self.claim::<T>(&name)?;
        let mut builder = TypeBuilder::new(name);
        T::describe(&mut builder);
        let def = Arc::new(builder.build()?);
        debug!(
            type_name = %def.info.name,
            properties = def.info.properties.len(),
            methods = def.info.methods.len(),
            "Described type"
        );
        self.defs.insert(TypeId::of::<T>(), def.clone());
        Ok(def)
    }

    /// Reserve a client-visible name for `T`.
    pub(crate) fn claim<T: Object>(&mut self, name: &str) -> Result<()> {
        let id = TypeId::of::<T>();
        match self.names.get(name) {
            Some(owner) if *owner != id => Err(BridgeError::type_definition(
                name,
                format!(
                    "{} cannot use a name owned by another type",
                    std::any::type_name::<T>()
                ),
            )),
            Some(_) => Ok(()),
            None => {
                self.names.insert(name.to_string(), id);
                Ok(())
            }
        }
    }
}

/// Last path segment of a Rust type name, without generic arguments.
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
