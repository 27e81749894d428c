//! Protocol engine for one client connection.
//!
//! A [`Connection`] owns the transport, the object registry and the list
//! of creatable types. Nothing happens until it is driven: the first call
//! to [`Connection::process`], [`Connection::ready`], [`Connection::run`]
//! or [`Connection::run_lockable`] writes the handshake and starts a
//! reader task.
//!
//! # Scheduling
//!
//! The reader task only decodes frames into a bounded queue. Commands are
//! handled by whoever drives the connection, one at a time, so backend
//! objects are never touched by two commands at once. Notifications queued
//! while a command runs are written before the next command is handled.
//!
//! # Failure
//!
//! Fatal errors close both directions of the transport. The error is
//! returned once from the driving call, and every later call returns
//! [`BridgeError::Closed`].

mod context;
mod lockable;

pub use context::Context;
pub use lockable::SharedConnection;

use crate::config::{ConnectionConfig, ProtocolConfig};
use crate::introspect::{SignalArgs, TypeInfo};
use crate::object::registry::Registry;
use crate::object::{AnyNode, Object, QPtr};
use crate::protocol::{read_frame, write_frame, Inbound, Outbound};
use crate::{BridgeError, Result};
use context::Pending;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Factory = Box<dyn Fn() -> Arc<dyn AnyNode> + Send>;

/// Item handed from the reader task to the driving side.
pub(crate) enum ReaderEvent {
    Frame(Vec<u8>),
    Failed(BridgeError),
}

struct Creatable {
    info: Arc<TypeInfo>,
    factory: Factory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unstarted,
    Running,
    Closed,
}

/// A connection to one client.
pub struct Connection {
    config: ConnectionConfig,
    state: State,
    root: Arc<dyn AnyNode>,
    registry: Registry,
    creatable: Vec<Creatable>,
    reader: Option<Reader>,
    writer: Option<Writer>,
    reader_task: Option<JoinHandle<()>>,
    events: Option<mpsc::Receiver<ReaderEvent>>,
    buffered: VecDeque<ReaderEvent>,
    last_collection: Instant,
}

impl Connection {
    /// Create a connection over a bidirectional stream.
    pub fn new<S, R>(stream: S, root: QPtr<R>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        R: Object,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new_split(reader, writer, root)
    }

    /// Create a connection over separate read and write halves, such as
    /// standard input and output.
    pub fn new_split<Rd, W, R>(reader: Rd, writer: W, root: QPtr<R>) -> Self
    where
        Rd: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        R: Object,
    {
        let config = ConnectionConfig::default();
        Self {
            registry: Registry::new(config.grace_period),
            config,
            state: State::Unstarted,
            root: root.node(),
            creatable: Vec::new(),
            reader: Some(Box::new(reader)),
            writer: Some(Box::new(writer)),
            reader_task: None,
            events: None,
            buffered: VecDeque::new(),
            last_collection: Instant::now(),
        }
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.registry.set_grace_period(config.grace_period);
        self.config = config;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Whether the handshake has been sent and the connection is open.
    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Make `name` creatable by the client, with new instances cloned from
    /// `template`.
    pub fn register_type<T: Object + Clone>(&mut self, name: &str, template: T) -> Result<()> {
        self.register_type_factory(name, move || template.clone())
    }

    /// Make `name` creatable by the client, with new instances built by
    /// `factory`.
    ///
    /// Registering after the connection has started, or beyond the limit
    /// of creatable types, is fatal for the connection.
    pub fn register_type_factory<T, F>(&mut self, name: &str, factory: F) -> Result<()>
    where
        T: Object,
        F: Fn() -> T + Send + 'static,
    {
        let refuse = |message: &str| BridgeError::TypeRegistration {
            type_name: name.to_string(),
            message: message.to_string(),
        };
        match self.state {
            State::Closed => return Err(BridgeError::Closed),
            State::Running => return Err(self.fail(refuse("connection already started"))),
            State::Unstarted => {}
        }
        if self.creatable.len() >= ProtocolConfig::MAX_CREATABLE_TYPES {
            return Err(self.fail(refuse("too many creatable types")));
        }
        if self.creatable.iter().any(|c| c.info.name == name) {
            return Err(refuse("name already registered"));
        }

        let types = self.registry.types();
        let def = types.get::<T>()?;
        types.claim::<T>(name)?;
        let def = Arc::new(def.renamed(name));
        let info = def.info.clone();
        self.creatable.push(Creatable {
            info,
            factory: Box::new(move || QPtr::with_def(factory(), def.clone()).node()),
        });
        info!("Registered creatable type {}", name);
        Ok(())
    }

    /// Register an object with a generated identifier.
    pub fn init_object<T: Object>(&mut self, object: &QPtr<T>) -> Result<String> {
        self.check_open()?;
        self.registry.register(object.node(), None)
    }

    /// Register an object under a chosen identifier.
    pub fn init_object_id<T: Object>(&mut self, object: &QPtr<T>, identifier: &str) -> Result<()> {
        self.check_open()?;
        self.registry.register(object.node(), Some(identifier))?;
        Ok(())
    }

    /// Look up a registered object by identifier.
    pub fn object<T: Object>(&self, identifier: &str) -> Option<QPtr<T>> {
        self.registry.node(identifier).and_then(QPtr::from_any)
    }

    /// Run embedder code with access to the connection.
    ///
    /// Notifications queued by `f` are written before this returns. Before
    /// the connection has started there is nobody to notify, so they are
    /// discarded.
    pub async fn with_context<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Context<'_>) -> T,
    {
        self.check_open()?;
        let mut cx = Context::new(&mut self.registry, None);
        let out = f(&mut cx);
        let pending = cx.into_pending();

        if self.state == State::Running {
            if let Err(e) = self.flush(pending).await {
                return Err(self.abort(e).await);
            }
        }
        Ok(out)
    }

    /// Report a property change on `object`.
    pub async fn changed<T: Object>(&mut self, object: &QPtr<T>, property: &str) -> Result<()> {
        self.with_context(|cx| cx.changed(object, property)).await
    }

    /// Send a full snapshot of `object`.
    pub async fn reset_properties<T: Object>(&mut self, object: &QPtr<T>) -> Result<()> {
        self.with_context(|cx| cx.reset_properties(object)).await
    }

    /// Emit `signal` on `object`.
    pub async fn emit<T: Object, A: SignalArgs>(
        &mut self,
        object: &QPtr<T>,
        signal: &str,
        args: A,
    ) -> Result<()> {
        self.with_context(|cx| cx.emit(object, signal, args)).await
    }

    /// Handle every command queued so far without waiting for more.
    ///
    /// Starts the connection on first use and sweeps unreferenced objects
    /// when the collection interval has passed.
    pub async fn process(&mut self) -> Result<()> {
        self.ensure_started().await?;

        while let Some(event) = self.next_event() {
            let result = match event {
                ReaderEvent::Frame(payload) => self.dispatch(&payload).await,
                ReaderEvent::Failed(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(self.abort(e).await),
                Err(e) => warn!("Command skipped: {}", e),
            }
        }

        self.collect_if_due();
        Ok(())
    }

    /// Wait until at least one command is ready for [`process`](Self::process).
    pub async fn ready(&mut self) -> Result<()> {
        self.ensure_started().await?;
        if !self.buffered.is_empty() {
            return Ok(());
        }

        let events = self.events.as_mut().ok_or_else(|| {
            BridgeError::Other("connection events are handled by run_lockable".to_string())
        })?;
        let event = events
            .recv()
            .await
            .unwrap_or(ReaderEvent::Failed(BridgeError::Disconnected));
        self.buffered.push_back(event);
        Ok(())
    }

    /// Process commands until the connection fails.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.ready().await?;
            self.process().await?;
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.state == State::Closed {
            return Err(BridgeError::Closed);
        }
        Ok(())
    }

    async fn ensure_started(&mut self) -> Result<()> {
        match self.state {
            State::Running => return Ok(()),
            State::Closed => return Err(BridgeError::Closed),
            State::Unstarted => {}
        }
        self.state = State::Running;

        if let Err(e) = self.handshake().await {
            return Err(self.abort(e).await);
        }
        self.spawn_reader();
        self.last_collection = Instant::now();
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        self.send(&Outbound::Version {
            version: ProtocolConfig::VERSION,
        })
        .await?;

        let types = self.creatable.iter().map(|c| (*c.info).clone()).collect();
        self.send(&Outbound::CreatableTypes { types }).await?;

        let identifier = self
            .registry
            .register(self.root.clone(), Some(ProtocolConfig::ROOT_IDENTIFIER))?;
        self.registry.pin(&identifier);
        self.registry.set_referenced(&identifier, true);
        let type_info = self
            .registry
            .type_info(&identifier)
            .ok_or_else(|| BridgeError::Other("root object has no type".to_string()))?;
        let data = self.registry.snapshot(&identifier)?;
        self.send(&Outbound::Root {
            identifier,
            type_info: (*type_info).clone(),
            data,
        })
        .await?;

        info!(
            "Connection started with root type {} and {} creatable types",
            type_info.name,
            self.creatable.len()
        );
        Ok(())
    }

    fn spawn_reader(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        self.reader_task = Some(tokio::spawn(read_loop(
            reader,
            tx,
            self.config.max_message_size,
        )));
        self.events = Some(rx);
    }

    fn next_event(&mut self) -> Option<ReaderEvent> {
        if let Some(event) = self.buffered.pop_front() {
            return Some(event);
        }
        match self.events.as_mut()?.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(ReaderEvent::Failed(BridgeError::Disconnected)),
        }
    }

    async fn dispatch(&mut self, payload: &[u8]) -> Result<()> {
        let message = Inbound::parse(payload)?;
        debug!(identifier = %message.identifier(), "Received {:?}", message);

        match message {
            Inbound::ObjectRef { identifier } => {
                if !self.registry.set_referenced(&identifier, true) {
                    warn!("Reference of unknown object {}", identifier);
                }
            }
            Inbound::ObjectDeref { identifier } => {
                if !self.registry.set_referenced(&identifier, false) {
                    warn!("Dereference of unknown object {}", identifier);
                }
            }
            Inbound::ObjectQuery { identifier } => match self.registry.is_referenced(&identifier) {
                None => {
                    return Err(BridgeError::UnknownObject {
                        action: "query".to_string(),
                        identifier,
                    })
                }
                Some(false) => debug!("Ignoring query of unreferenced object {}", identifier),
                Some(true) => self.send_reset(&identifier).await?,
            },
            Inbound::ObjectCreate {
                identifier,
                type_name,
            } => {
                if self.registry.contains(&identifier) {
                    return Err(BridgeError::DuplicateIdentifier { identifier });
                }
                let creatable = self
                    .creatable
                    .iter()
                    .find(|c| c.info.name == type_name)
                    .ok_or_else(|| BridgeError::UnknownType {
                        type_name: type_name.clone(),
                    })?;
                let node = (creatable.factory)();
                self.registry.register(node, Some(&identifier))?;
                self.registry.set_referenced(&identifier, true);
                debug!("Created {} object {}", type_name, identifier);
            }
            Inbound::Invoke {
                identifier,
                method,
                parameters,
            } => {
                let node =
                    self.registry
                        .node(&identifier)
                        .ok_or_else(|| BridgeError::UnknownObject {
                            action: "invoke".to_string(),
                            identifier: identifier.clone(),
                        })?;

                let mut cx = Context::new(&mut self.registry, Some(identifier.clone()));
                let result = node.invoke(&method, &parameters, &mut cx);
                let pending = cx.into_pending();
                if let Err(e) = result {
                    warn!(identifier = %identifier, "Invoke of {} failed: {}", method, e);
                }
                self.flush(pending).await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self, pending: Vec<Pending>) -> Result<()> {
        for item in pending {
            match item {
                Pending::Reset { identifier } => self.send_reset(&identifier).await?,
                Pending::Emit {
                    identifier,
                    signal,
                    parameters,
                } => {
                    self.send(&Outbound::Emit {
                        identifier,
                        method: signal,
                        parameters,
                    })
                    .await?
                }
            }
        }
        Ok(())
    }

    /// Send a snapshot of a referenced object. Marshal failures skip it.
    async fn send_reset(&mut self, identifier: &str) -> Result<()> {
        if self.registry.is_referenced(identifier) != Some(true) {
            return Ok(());
        }
        let data = match self.registry.snapshot(identifier) {
            Ok(data) => data,
            Err(e) if !e.is_fatal() => {
                warn!("Skipping snapshot: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.send(&Outbound::ObjectReset {
            identifier: identifier.to_string(),
            data,
        })
        .await
    }

    async fn send(&mut self, message: &Outbound) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(BridgeError::Closed)?;
        let payload = serde_json::to_vec(message)?;
        write_frame(writer, &payload).await?;
        debug!(bytes = payload.len(), "Sent {}", message.command());
        Ok(())
    }

    fn collect_if_due(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_collection) < self.config.collection_interval {
            return;
        }
        self.last_collection = now;

        let evicted = self.registry.collect(now);
        if !evicted.is_empty() {
            debug!(
                remaining = self.registry.len(),
                "Collected {} unreferenced objects",
                evicted.len()
            );
        }
    }

    /// Shut the writer down, then close the connection.
    async fn abort(&mut self, err: BridgeError) -> BridgeError {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Writer shutdown failed: {}", e);
            }
        }
        self.fail(err)
    }

    fn fail(&mut self, err: BridgeError) -> BridgeError {
        error!("Connection failed: {}", err);
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.reader = None;
        self.writer = None;
        self.events = None;
        self.buffered.clear();
        self.state = State::Closed;
        err
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Decode frames until the stream ends or breaks.
///
/// The last event sent is always a failure.
async fn read_loop(reader: Reader, events: mpsc::Sender<ReaderEvent>, max_message_size: usize) {
    let mut reader = BufReader::new(reader);
    loop {
        let event = match read_frame(&mut reader, max_message_size).await {
            Ok(Some(payload)) => ReaderEvent::Frame(payload),
            Ok(None) => ReaderEvent::Failed(BridgeError::Disconnected),
            Err(e) => ReaderEvent::Failed(e),
        };
        let last = matches!(event, ReaderEvent::Failed(_));
        if events.send(event).await.is_err() || last {
            break;
        }
    }
    debug!("Reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::TypeBuilder;

    #[derive(Clone, Default)]
    struct Note {
        text: String,
    }

    impl Object for Note {
        fn describe(t: &mut TypeBuilder<Self>) {
            t.property("text", |n: &Note| &n.text);
        }
    }

    #[derive(Default)]
    struct Root;

    impl Object for Root {
        fn describe(_: &mut TypeBuilder<Self>) {}
    }

    fn connection() -> Connection {
        let (local, _remote) = tokio::io::duplex(1024);
        Connection::new(local, QPtr::new(Root))
    }

    #[tokio::test]
    async fn test_duplicate_creatable_name_is_not_fatal() {
        let mut conn = connection();
        conn.register_type("Note", Note::default()).unwrap();
        let err = conn.register_type("Note", Note::default()).unwrap_err();
        assert!(matches!(err, BridgeError::TypeRegistration { .. }));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_creatable_type_limit_is_fatal() {
        let mut conn = connection();
        for i in 0..ProtocolConfig::MAX_CREATABLE_TYPES {
            conn.register_type(&format!("Note{}", i), Note::default())
                .unwrap();
        }
        let err = conn.register_type("OneTooMany", Note::default()).unwrap_err();
        assert!(matches!(err, BridgeError::TypeRegistration { .. }));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.register_type("Late", Note::default()),
            Err(BridgeError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_context_before_start_discards_notifications() {
        let mut conn = connection();
        let note = QPtr::new(Note::default());
        let id = conn.init_object(&note).unwrap();
        conn.changed(&note, "text").await.unwrap();
        assert!(!conn.is_running());
        assert!(conn.object::<Note>(&id).is_some());
        assert!(conn.object::<Root>(&id).is_none());
    }
}
