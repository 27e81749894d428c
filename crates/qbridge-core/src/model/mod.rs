//! List models synchronized by row deltas.
//!
//! A model type embeds a [`Model`], implements [`DataSource`], and calls
//! [`TypeBuilder::model`] from its `describe`. The model then publishes a
//! companion `modelAPI` object under the `_qb_model` property. Row
//! notifications are addressed to that companion, so they never mix with
//! property updates of the model itself.

pub mod sort;

pub use sort::sort_inserted;

use crate::config::ProtocolConfig;
use crate::connection::Context;
use crate::introspect::{Marshal, MarshalContext, TypeBuilder, WireType, WireTyped};
use crate::object::registry::Registry;
use crate::object::{Node, Object, QPtr};
use crate::Result;
use serde_json::Value;
use std::sync::{Arc, Weak};

/// Row data provider of a model.
pub trait DataSource: Object {
    type Row: Marshal;

    fn model(&self) -> &Model;
    fn row_count(&self) -> usize;
    fn row(&self, row: usize) -> Self::Row;
    fn role_names(&self) -> Vec<String>;

    /// Direct access to all rows, when the source keeps them in a slice.
    fn as_bulk(&self) -> Option<&dyn RowsBulkSource<Row = Self::Row>> {
        None
    }
}

/// Data source that can hand out every row at once.
pub trait RowsBulkSource {
    type Row;

    fn rows(&self) -> &[Self::Row];
}

/// Data source that can keep itself sorted with [`sort_inserted`].
pub trait SortableDataSource: DataSource {
    fn row_less(&self, a: usize, b: usize) -> bool;

    /// Move row `src` to index `dst` without notifying anyone.
    fn row_move(&mut self, src: usize, dst: usize);
}

/// Model state embedded in every model type.
pub struct Model {
    api: QPtr<ModelApi>,
}

impl Model {
    pub fn new() -> Self {
        Self {
            api: QPtr::new(ModelApi::default()),
        }
    }

    pub fn api(&self) -> &QPtr<ModelApi> {
        &self.api
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Marshal for Model {
    fn marshal(&self, cx: &mut MarshalContext<'_>) -> Result<Value> {
        cx.object_ref(&self.api)
    }
}

impl WireTyped for Model {
    fn wire_type() -> WireType {
        WireType::Object
    }
}

impl<T: DataSource> TypeBuilder<T> {
    /// Publish this type as a list model.
    pub fn model(&mut self) -> &mut Self {
        self.property(ProtocolConfig::MODEL_API_PROPERTY, |source: &T| source.model());
        self.set_attach(attach::<T>);
        self
    }
}

/// Type-erased row access used by the model API object.
pub(crate) trait RowSource: Send + Sync {
    fn rows(
        &self,
        cx: &mut MarshalContext<'_>,
        start: i64,
        count: i64,
        batch_size: i64,
    ) -> Result<(Vec<Value>, i64)>;
}

impl<T: DataSource> RowSource for Node<T> {
    fn rows(
        &self,
        cx: &mut MarshalContext<'_>,
        start: i64,
        count: i64,
        batch_size: i64,
    ) -> Result<(Vec<Value>, i64)> {
        let source = self.lock();
        get_rows(&*source, cx, start, count, batch_size)
    }
}

fn attach<T: DataSource>(node: &Arc<Node<T>>, registry: &mut Registry) -> Result<()> {
    let api = {
        let source = node.lock();
        let api = source.model().api().clone();
        let weak: Weak<Node<T>> = Arc::downgrade(node);
        let weak: Weak<dyn RowSource> = weak;
        let mut state = api.lock();
        state.source = Some(weak);
        state.role_names = source.role_names();
        drop(state);
        api
    };
    registry.register(api.node(), None)?;
    Ok(())
}

/// Clamp a requested row range to the rows that exist.
///
/// A negative start reads from the first row. A negative count means all
/// remaining rows.
fn clamp_range(row_count: usize, start: i64, count: i64) -> (usize, usize) {
    let row_count = i64::try_from(row_count).unwrap_or(i64::MAX);
    let start = start.clamp(0, row_count);
    let remaining = row_count - start;
    let count = if count < 0 {
        remaining
    } else {
        count.min(remaining)
    };
    (start as usize, count as usize)
}

/// Marshal a range of rows, limited to `batch_size` when it is positive.
///
/// Returns the rows and the number of rows left out by the batch limit.
pub(crate) fn get_rows<T: DataSource>(
    source: &T,
    cx: &mut MarshalContext<'_>,
    start: i64,
    count: i64,
    batch_size: i64,
) -> Result<(Vec<Value>, i64)> {
    let (start, mut count) = clamp_range(source.row_count(), start, count);
    let mut more = 0;
    if batch_size > 0 && count as i64 > batch_size {
        more = count as i64 - batch_size;
        count = batch_size as usize;
    }

    let rows = match source.as_bulk() {
        Some(bulk) => bulk
            .rows()
            .get(start..start + count)
            .unwrap_or(&[])
            .iter()
            .map(|row| row.marshal(cx))
            .collect::<Result<Vec<_>>>()?,
        None => (start..start + count)
            .map(|i| source.row(i).marshal(cx))
            .collect::<Result<Vec<_>>>()?,
    };
    Ok((rows, more))
}

/// Companion object that carries row notifications for one model.
#[derive(Default)]
pub struct ModelApi {
    source: Option<Weak<dyn RowSource>>,
    role_names: Vec<String>,
    batch_size: i64,
}

impl ModelApi {
    pub fn role_names(&self) -> &[String] {
        &self.role_names
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    fn source(&self) -> Option<Arc<dyn RowSource>> {
        self.source.as_ref().and_then(Weak::upgrade)
    }

    fn reset(&mut self, cx: &mut Context<'_>) {
        let Some(source) = self.source() else {
            return;
        };
        let batch_size = self.batch_size;
        cx.emit_this_with("modelReset", |cx| {
            let (rows, more) = source.rows(cx, 0, -1, batch_size)?;
            Ok(vec![Value::Array(rows), Value::from(more)])
        });
    }

    /// Rows asked for by the client. The batch size does not apply.
    fn request_rows(&mut self, cx: &mut Context<'_>, start: i64, count: i64) {
        let Some(source) = self.source() else {
            return;
        };
        cx.emit_this_with("modelRowData", |cx| {
            let (rows, _) = source.rows(cx, start, count, 0)?;
            Ok(vec![Value::from(start.max(0)), Value::Array(rows)])
        });
    }

    fn set_batch_size(&mut self, cx: &mut Context<'_>, size: i64) {
        self.batch_size = size.max(0);
        cx.changed_this("batchSize");
    }
}

impl Object for ModelApi {
    fn type_name() -> String {
        "modelAPI".to_string()
    }

    fn describe(t: &mut TypeBuilder<Self>) {
        t.property("roleNames", |m: &ModelApi| &m.role_names)
            .property("batchSize", |m: &ModelApi| &m.batch_size)
            .method("reset", |m: &mut ModelApi, cx, ()| m.reset(cx))
            .method(
                "requestRows",
                |m: &mut ModelApi, cx, (start, count): (i64, i64)| {
                    m.request_rows(cx, start, count)
                },
            )
            .method("setBatchSize", |m: &mut ModelApi, cx, (size,): (i64,)| {
                m.set_batch_size(cx, size)
            })
            .signal::<(Vec<Value>, i64)>("modelReset", &["rowData", "moreRows"])
            .signal::<(i64, Vec<Value>, i64)>("modelInsert", &["start", "rowData", "moreRows"])
            .signal::<(i64, i64)>("modelRemove", &["start", "end"])
            .signal::<(i64, i64, i64)>("modelMove", &["start", "end", "destination"])
            .signal::<(i64, Value)>("modelUpdate", &["row", "data"])
            .signal::<(i64, Vec<Value>)>("modelRowData", &["start", "rowData"]);
    }
}
