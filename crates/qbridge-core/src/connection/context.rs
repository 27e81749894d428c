//! Access to the connection from inside method calls and embedder code.

use crate::introspect::{lower_first, ArgResolver, MarshalContext, SignalArgs};
use crate::model::{self, DataSource, SortableDataSource};
use crate::object::registry::Registry;
use crate::object::{Object, QPtr};
use crate::Result;
use serde_json::Value;
use tracing::{debug, warn};

/// Outbound work produced while application code runs.
///
/// Property snapshots are taken when the work is flushed, after the
/// object lock has been released. Signal arguments are marshaled right
/// away so they capture the values at the time of emission.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Pending {
    Reset {
        identifier: String,
    },
    Emit {
        identifier: String,
        signal: String,
        parameters: Vec<Value>,
    },
}

/// Handle to the connection state while application code runs.
///
/// A context is passed to every invoked method and to the closure given
/// to [`Connection::with_context`](crate::Connection::with_context).
/// Notifications queued through it are written once that code returns,
/// before the next inbound message is handled.
pub struct Context<'a> {
    registry: &'a mut Registry,
    this: Option<String>,
    pending: Vec<Pending>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(registry: &'a mut Registry, this: Option<String>) -> Self {
        Self {
            registry,
            this,
            pending: Vec::new(),
        }
    }

    pub(crate) fn arg_resolver(&self) -> ArgResolver<'_> {
        ArgResolver::new(&*self.registry)
    }

    pub(crate) fn marshal(&mut self) -> MarshalContext<'_> {
        MarshalContext::new(&mut *self.registry)
    }

    pub(crate) fn into_pending(self) -> Vec<Pending> {
        self.pending
    }

    /// Identifier of the object whose method is being invoked.
    pub fn this(&self) -> Option<&str> {
        self.this.as_deref()
    }

    /// Register an object ahead of its first use as a property value.
    pub fn init_object<T: Object>(&mut self, object: &QPtr<T>) -> Result<String> {
        self.registry.register(object.node(), None)
    }

    /// Look up a registered object by identifier.
    pub fn object<T: Object>(&self, identifier: &str) -> Option<QPtr<T>> {
        self.registry.node(identifier).and_then(QPtr::from_any)
    }

    pub fn is_referenced<T: Object>(&self, object: &QPtr<T>) -> bool {
        object
            .id()
            .and_then(|id| self.registry.is_referenced(id))
            .unwrap_or(false)
    }

    /// Report a property change. The client receives a full snapshot.
    pub fn changed<T: Object>(&mut self, object: &QPtr<T>, property: &str) {
        if let Some(id) = object.id() {
            let id = id.to_string();
            self.queue_changed(&id, property);
        }
    }

    /// Send a full snapshot of every property.
    pub fn reset_properties<T: Object>(&mut self, object: &QPtr<T>) {
        if let Some(id) = object.id() {
            let id = id.to_string();
            self.queue_reset(&id);
        }
    }

    /// [`changed`](Self::changed) for the object being invoked.
    pub fn changed_this(&mut self, property: &str) {
        if let Some(id) = self.this.clone() {
            self.queue_changed(&id, property);
        }
    }

    /// Emit a signal on an object.
    ///
    /// Objects among the arguments are registered if needed. Emission
    /// is dropped for unreferenced objects.
    pub fn emit<T: Object, A: SignalArgs>(&mut self, object: &QPtr<T>, signal: &str, args: A) {
        if let Some(id) = object.id() {
            let id = id.to_string();
            self.emit_with(&id, signal, |cx| args.marshal_args(cx));
        }
    }

    /// [`emit`](Self::emit) on the object being invoked.
    pub fn emit_this<A: SignalArgs>(&mut self, signal: &str, args: A) {
        self.emit_this_with(signal, |cx| args.marshal_args(cx));
    }

    pub(crate) fn emit_this_with<F>(&mut self, signal: &str, marshal: F)
    where
        F: FnOnce(&mut MarshalContext<'_>) -> Result<Vec<Value>>,
    {
        if let Some(id) = self.this.clone() {
            self.emit_with(&id, signal, marshal);
        }
    }

    fn emit_with<F>(&mut self, id: &str, signal: &str, marshal: F)
    where
        F: FnOnce(&mut MarshalContext<'_>) -> Result<Vec<Value>>,
    {
        let signal = lower_first(signal);
        if self.registry.is_referenced(id) != Some(true) {
            debug!(identifier = %id, signal = %signal, "Dropping emit for unreferenced object");
            return;
        }
        let Some(info) = self.registry.type_info(id) else {
            return;
        };
        let Some(declared) = info.signals.get(&signal) else {
            warn!(
                identifier = %id,
                type_name = %info.name,
                signal = %signal,
                "Dropping emit of undeclared signal"
            );
            return;
        };

        let parameters = match marshal(&mut self.marshal()) {
            Ok(parameters) => parameters,
            Err(e) => {
                warn!(
                    identifier = %id,
                    signal = %signal,
                    "Marshal of signal arguments failed: {}",
                    e
                );
                return;
            }
        };
        if parameters.len() != declared.len() {
            warn!(
                identifier = %id,
                signal = %signal,
                expected = declared.len(),
                provided = parameters.len(),
                "Dropping emit with wrong number of arguments"
            );
            return;
        }

        self.pending.push(Pending::Emit {
            identifier: id.to_string(),
            signal,
            parameters,
        });
    }

    fn queue_changed(&mut self, id: &str, property: &str) {
        if let Some(info) = self.registry.type_info(id) {
            let property = lower_first(property);
            if !info.properties.contains_key(&property) {
                warn!(
                    identifier = %id,
                    type_name = %info.name,
                    property = %property,
                    "Change reported for unknown property"
                );
            }
        }
        self.queue_reset(id);
    }

    fn queue_reset(&mut self, id: &str) {
        if self.registry.is_referenced(id) != Some(true) {
            return;
        }
        let reset = Pending::Reset {
            identifier: id.to_string(),
        };
        if self.pending.last() != Some(&reset) {
            self.pending.push(reset);
        }
    }

    /// Send every row of a model again.
    pub fn model_reset<T: DataSource>(&mut self, source: &T) {
        let api = source.model().api();
        let Some(id) = api.id().map(str::to_string) else {
            return;
        };
        let batch_size = api.lock().batch_size();
        self.emit_with(&id, "modelReset", |cx| {
            let (rows, more) = model::get_rows(source, cx, 0, -1, batch_size)?;
            Ok(vec![Value::Array(rows), Value::from(more)])
        });
    }

    /// Report `count` new rows at `start`.
    pub fn model_inserted<T: DataSource>(&mut self, source: &T, start: usize, count: usize) {
        let api = source.model().api();
        let Some(id) = api.id().map(str::to_string) else {
            return;
        };
        let batch_size = api.lock().batch_size();
        self.emit_with(&id, "modelInsert", |cx| {
            let (rows, more) =
                model::get_rows(source, cx, start as i64, count as i64, batch_size)?;
            Ok(vec![Value::from(start), Value::Array(rows), Value::from(more)])
        });
    }

    /// Report that rows `start..start + count` were removed.
    pub fn model_removed<T: DataSource>(&mut self, source: &T, start: usize, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(id) = source.model().api().id().map(str::to_string) {
            self.emit_with(&id, "modelRemove", |_| {
                Ok(vec![Value::from(start), Value::from(start + count - 1)])
            });
        }
    }

    /// Report that rows `start..start + count` moved to `destination`.
    pub fn model_moved<T: DataSource>(
        &mut self,
        source: &T,
        start: usize,
        count: usize,
        destination: usize,
    ) {
        if count == 0 {
            return;
        }
        if let Some(id) = source.model().api().id().map(str::to_string) {
            self.emit_with(&id, "modelMove", |_| {
                Ok(vec![
                    Value::from(start),
                    Value::from(start + count - 1),
                    Value::from(destination),
                ])
            });
        }
    }

    /// Send the current data of one row.
    pub fn model_updated<T: DataSource>(&mut self, source: &T, row: usize) {
        if row >= source.row_count() {
            warn!(row, rows = source.row_count(), "Update of row out of range");
            return;
        }
        if let Some(id) = source.model().api().id().map(str::to_string) {
            self.emit_with(&id, "modelUpdate", |cx| {
                let data = crate::Marshal::marshal(&source.row(row), cx)?;
                Ok(vec![Value::from(row), data])
            });
        }
    }

    /// Move rows `start..end`, freshly appended and not yet reported, into
    /// sorted position and report them as inserted.
    pub fn sort_inserted<T: SortableDataSource>(&mut self, source: &mut T, start: usize, end: usize) {
        model::sort_inserted(source, start, end, |source, start, count| {
            self.model_inserted(source, start, count)
        });
    }
}
