//! End-to-end tests driving a connection through an in-memory stream.

use qbridge_core::protocol::{read_frame, write_frame};
use qbridge_core::{
    BridgeError, Connection, ConnectionConfig, Context, DataSource, Model, Object, QPtr,
    SortableDataSource, TypeBuilder,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

const MAX_FRAME: usize = 1024 * 1024;

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
struct Counter {
    value: i64,
    child: Option<QPtr<Note>>,
}

impl Counter {
    fn add(&mut self, cx: &mut Context<'_>, amount: i64) {
        self.value += amount;
        cx.changed_this("value");
    }
}

impl Object for Counter {
    fn describe(t: &mut TypeBuilder<Self>) {
        t.property("value", |c: &Counter| &c.value)
            .property("child", |c: &Counter| &c.child)
            .method("add", |c: &mut Counter, cx, (amount,): (i64,)| c.add(cx, amount))
            .method("fail", |_: &mut Counter, _cx, ()| -> anyhow::Result<()> {
                anyhow::bail!("refused")
            })
            .method("ping", |_: &mut Counter, cx, (text,): (String,)| {
                cx.emit_this("pinged", (text,))
            })
            .method("spawn", |_: &mut Counter, cx, (text,): (String,)| {
                cx.emit_this("spawned", (QPtr::new(Note { text }),))
            })
            .signal::<(String,)>("pinged", &["text"])
            .signal::<(QPtr<Note>,)>("spawned", &["note"]);
    }
}

struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Client {
    async fn send(&mut self, message: Value) {
        let payload = serde_json::to_vec(&message).unwrap();
        write_frame(&mut self.writer, &payload).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let payload = read_frame(&mut self.reader, MAX_FRAME)
            .await
            .unwrap()
            .expect("connection sent a frame");
        serde_json::from_slice(&payload).unwrap()
    }

    async fn recv_eof(&mut self) -> bool {
        matches!(read_frame(&mut self.reader, MAX_FRAME).await, Ok(None))
    }

    /// Read the three handshake messages and return the ROOT message.
    async fn handshake(&mut self) -> Value {
        assert_eq!(self.recv().await["command"], "VERSION");
        assert_eq!(self.recv().await["command"], "CREATABLE_TYPES");
        let root = self.recv().await;
        assert_eq!(root["command"], "ROOT");
        root
    }
}

fn pair<R: Object>(root: QPtr<R>) -> (Connection, Client) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(remote);
    let client = Client {
        reader: BufReader::new(reader),
        writer,
    };
    (Connection::new(local, root), client)
}

/// Wait for one inbound message and handle it.
async fn step(conn: &mut Connection) {
    conn.ready().await.unwrap();
    conn.process().await.unwrap();
}

async fn started() -> (Connection, Client, QPtr<Counter>) {
    let root = QPtr::new(Counter::default());
    let (mut conn, mut client) = pair(root.clone());
    conn.process().await.unwrap();
    client.handshake().await;
    (conn, client, root)
}

#[tokio::test]
async fn test_handshake_order_and_contents() {
    let root = QPtr::new(Counter::default());
    let (mut conn, mut client) = pair(root);
    conn.register_type("Note", Note::default()).unwrap();
    conn.process().await.unwrap();

    assert_eq!(
        client.recv().await,
        json!({"command": "VERSION", "version": 2})
    );

    let types = client.recv().await;
    assert_eq!(types["command"], "CREATABLE_TYPES");
    assert_eq!(types["types"][0]["name"], "Note");
    assert_eq!(types["types"][0]["properties"]["text"], "string");

    let root = client.recv().await;
    assert_eq!(root["identifier"], "root");
    assert_eq!(root["type"]["name"], "Counter");
    assert_eq!(root["type"]["properties"]["value"], "int");
    assert_eq!(root["type"]["properties"]["child"], "object");
    assert_eq!(root["type"]["methods"]["add"], json!(["int"]));
    assert_eq!(root["type"]["signals"]["valueChanged"], json!([]));
    assert_eq!(root["type"]["signals"]["pinged"], json!(["string text"]));
    assert_eq!(root["data"], json!({"value": 0, "child": null}));
}

#[tokio::test]
async fn test_invoke_updates_property() {
    let (mut conn, mut client, root) = started().await;

    client
        .send(json!({"command": "INVOKE", "identifier": "root", "method": "add", "parameters": [4]}))
        .await;
    step(&mut conn).await;
    let reset = client.recv().await;
    assert_eq!(reset["command"], "OBJECT_RESET");
    assert_eq!(reset["data"]["value"], 4);

    client
        .send(json!({"command": "INVOKE", "identifier": "root", "method": "add", "parameters": [1]}))
        .await;
    step(&mut conn).await;
    assert_eq!(client.recv().await["data"]["value"], 5);
    assert_eq!(root.lock().value, 5);
}

#[tokio::test]
async fn test_invoke_failures_are_not_fatal() {
    let (mut conn, mut client, root) = started().await;

    let calls = [
        json!({"command": "INVOKE", "identifier": "root", "method": "missing", "parameters": []}),
        json!({"command": "INVOKE", "identifier": "root", "method": "add", "parameters": ["x"]}),
        json!({"command": "INVOKE", "identifier": "root", "method": "add", "parameters": [1, 2]}),
        json!({"command": "INVOKE", "identifier": "root", "method": "fail", "parameters": []}),
    ];
    for call in calls {
        client.send(call).await;
        step(&mut conn).await;
    }

    client
        .send(json!({"command": "INVOKE", "identifier": "root", "method": "add", "parameters": [2]}))
        .await;
    step(&mut conn).await;
    assert_eq!(client.recv().await["data"]["value"], 2);
    assert_eq!(root.lock().value, 2);
}

#[tokio::test]
async fn test_signal_emission() {
    let (mut conn, mut client, _root) = started().await;

    client
        .send(json!({"command": "INVOKE", "identifier": "root", "method": "ping", "parameters": ["hi"]}))
        .await;
    step(&mut conn).await;
    assert_eq!(
        client.recv().await,
        json!({"command": "EMIT", "identifier": "root", "method": "pinged", "parameters": ["hi"]})
    );
}

#[tokio::test]
async fn test_unknown_command_is_fatal() {
    let (mut conn, mut client, _root) = started().await;

    client.send(json!({"command": "NOPE"})).await;
    conn.ready().await.unwrap();
    let err = conn.process().await.unwrap_err();
    assert!(matches!(err, BridgeError::UnknownCommand { command } if command == "NOPE"));
    assert!(client.recv_eof().await);

    assert!(matches!(conn.process().await, Err(BridgeError::Closed)));
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_query_of_unknown_object_is_fatal() {
    let (mut conn, mut client, _root) = started().await;

    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": "ghost"}))
        .await;
    conn.ready().await.unwrap();
    let err = conn.process().await.unwrap_err();
    assert!(matches!(err, BridgeError::UnknownObject { .. }));
}

#[tokio::test]
async fn test_reference_of_unknown_object_is_a_warning() {
    let (mut conn, mut client, _root) = started().await;

    client
        .send(json!({"command": "OBJECT_REF", "identifier": "ghost"}))
        .await;
    step(&mut conn).await;

    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": "root"}))
        .await;
    step(&mut conn).await;
    let reset = client.recv().await;
    assert_eq!(reset["command"], "OBJECT_RESET");
    assert_eq!(reset["identifier"], "root");
}

#[tokio::test]
async fn test_peer_disconnect_is_reported_once() {
    let (mut conn, mut client, _root) = started().await;

    client.writer.shutdown().await.unwrap();
    conn.ready().await.unwrap();
    assert!(matches!(conn.process().await, Err(BridgeError::Disconnected)));
    assert!(matches!(conn.ready().await, Err(BridgeError::Closed)));
}

#[tokio::test]
async fn test_create_registered_type() {
    let root = QPtr::new(Counter::default());
    let (mut conn, mut client) = pair(root);
    conn.register_type(
        "Note",
        Note {
            text: "fresh".into(),
        },
    )
    .unwrap();
    conn.process().await.unwrap();
    client.handshake().await;

    client
        .send(json!({"command": "OBJECT_CREATE", "identifier": "n1", "typeName": "Note"}))
        .await;
    step(&mut conn).await;
    let note = conn.object::<Note>("n1").expect("created object");
    assert_eq!(note.lock().text, "fresh");

    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": "n1"}))
        .await;
    step(&mut conn).await;
    assert_eq!(
        client.recv().await,
        json!({"command": "OBJECT_RESET", "identifier": "n1", "data": {"text": "fresh"}})
    );

    client
        .send(json!({"command": "OBJECT_CREATE", "identifier": "n2", "typeName": "Missing"}))
        .await;
    conn.ready().await.unwrap();
    assert!(matches!(
        conn.process().await,
        Err(BridgeError::UnknownType { type_name }) if type_name == "Missing"
    ));
}

#[tokio::test]
async fn test_create_through_factory() {
    let root = QPtr::new(Counter::default());
    let (mut conn, mut client) = pair(root);
    let made = Arc::new(AtomicUsize::new(0));
    let counter = made.clone();
    conn.register_type_factory("Memo", move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Note {
            text: format!("memo {}", n),
        }
    })
    .unwrap();

    // Describing Note for Memo claimed the name "Note"
    let err = conn
        .register_type_factory("Note", Counter::default)
        .unwrap_err();
    assert!(matches!(err, BridgeError::TypeDefinition { .. }));
    assert!(!conn.is_closed());
    conn.register_type("Note", Note::default()).unwrap();

    conn.process().await.unwrap();
    assert_eq!(client.recv().await["command"], "VERSION");
    let types = client.recv().await;
    assert_eq!(types["types"].as_array().unwrap().len(), 2);
    assert_eq!(types["types"][0]["name"], "Memo");
    assert_eq!(types["types"][0]["properties"]["text"], "string");
    client.recv().await;
    assert_eq!(made.load(Ordering::SeqCst), 0);

    for id in ["m1", "m2"] {
        client
            .send(json!({"command": "OBJECT_CREATE", "identifier": id, "typeName": "Memo"}))
            .await;
        step(&mut conn).await;
    }
    assert_eq!(made.load(Ordering::SeqCst), 2);
    assert_eq!(conn.object::<Note>("m1").unwrap().lock().text, "memo 1");
    assert_eq!(conn.object::<Note>("m2").unwrap().lock().text, "memo 2");

    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": "m2"}))
        .await;
    step(&mut conn).await;
    assert_eq!(
        client.recv().await,
        json!({"command": "OBJECT_RESET", "identifier": "m2", "data": {"text": "memo 2"}})
    );
}

#[tokio::test]
async fn test_init_object_id_collision() {
    let (mut conn, mut client, _root) = started().await;

    let first = QPtr::new(Note { text: "a".into() });
    let second = QPtr::new(Note { text: "b".into() });
    conn.init_object_id(&first, "note").unwrap();
    // Registering the same object again is harmless
    conn.init_object_id(&first, "note").unwrap();

    let err = conn.init_object_id(&second, "note").unwrap_err();
    assert!(matches!(err, BridgeError::DuplicateIdentifier { identifier } if identifier == "note"));
    let err = conn.init_object_id(&second, "root").unwrap_err();
    assert!(matches!(err, BridgeError::DuplicateIdentifier { .. }));
    assert_eq!(second.id(), None);

    let found = conn.object::<Note>("note").unwrap();
    assert_eq!(found.lock().text, "a");

    // The connection keeps serving
    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": "note"}))
        .await;
    step(&mut conn).await;
    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": "root"}))
        .await;
    step(&mut conn).await;
    assert_eq!(client.recv().await["identifier"], "root");
}

#[tokio::test(start_paused = true)]
async fn test_signal_argument_object_lifecycle() {
    let root = QPtr::new(Counter::default());
    let (conn, mut client) = pair(root);
    let mut conn = conn.with_config(ConnectionConfig {
        grace_period: Duration::from_secs(2),
        collection_interval: Duration::from_secs(1),
        ..ConnectionConfig::default()
    });
    conn.process().await.unwrap();
    client.handshake().await;

    client
        .send(json!({"command": "INVOKE", "identifier": "root", "method": "spawn", "parameters": ["new"]}))
        .await;
    step(&mut conn).await;
    let emit = client.recv().await;
    assert_eq!(emit["command"], "EMIT");
    assert_eq!(emit["method"], "spawned");
    let tag = &emit["parameters"][0];
    assert_eq!(tag["_qbackend_"], "object");
    assert_eq!(tag["type"]["name"], "Note");
    assert_eq!(tag["type"]["properties"]["text"], "string");
    let id = tag["identifier"].as_str().unwrap().to_string();
    assert_eq!(conn.object::<Note>(&id).unwrap().lock().text, "new");

    // A sweep inside the grace period keeps it
    tokio::time::advance(Duration::from_millis(1500)).await;
    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": "root"}))
        .await;
    step(&mut conn).await;
    client.recv().await;
    assert!(conn.object::<Note>(&id).is_some());

    tokio::time::advance(Duration::from_secs(1)).await;
    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": "root"}))
        .await;
    step(&mut conn).await;
    client.recv().await;
    assert!(conn.object::<Note>(&id).is_none());
}

#[tokio::test]
async fn test_emit_on_unreferenced_object_is_dropped() {
    let (mut conn, mut client, _root) = started().await;

    let note = QPtr::new(Note::default());
    conn.init_object(&note).unwrap();
    conn.emit(&note, "textChanged", ()).await.unwrap();

    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": "root"}))
        .await;
    step(&mut conn).await;
    let next = client.recv().await;
    assert_eq!(next["command"], "OBJECT_RESET");
    assert_eq!(next["identifier"], "root");
}

#[tokio::test(start_paused = true)]
async fn test_child_object_lifecycle() {
    let root = QPtr::new(Counter::default());
    let (conn, mut client) = pair(root.clone());
    let mut conn = conn.with_config(ConnectionConfig {
        grace_period: Duration::from_secs(1),
        collection_interval: Duration::from_secs(1),
        ..ConnectionConfig::default()
    });
    conn.process().await.unwrap();
    client.handshake().await;

    let note = QPtr::new(Note { text: "a".into() });
    conn.with_context(|cx| {
        root.lock().child = Some(note.clone());
        cx.changed(&root, "child");
    })
    .await
    .unwrap();

    let reset = client.recv().await;
    let child = &reset["data"]["child"];
    assert_eq!(child["_qbackend_"], "object");
    assert_eq!(child["type"]["name"], "Note");
    let id = child["identifier"].as_str().unwrap().to_string();
    assert_eq!(note.id(), Some(id.as_str()));

    client
        .send(json!({"command": "OBJECT_REF", "identifier": id}))
        .await;
    step(&mut conn).await;

    conn.with_context(|cx| {
        root.lock().child = None;
        cx.changed(&root, "child");
    })
    .await
    .unwrap();
    assert_eq!(client.recv().await["data"]["child"], Value::Null);

    // Still referenced by the client, so it survives a sweep.
    tokio::time::advance(Duration::from_secs(2)).await;
    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": "root"}))
        .await;
    step(&mut conn).await;
    client.recv().await;
    assert!(conn.object::<Note>(&id).is_some());

    client
        .send(json!({"command": "OBJECT_DEREF", "identifier": id}))
        .await;
    step(&mut conn).await;
    assert!(conn.object::<Note>(&id).is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": "root"}))
        .await;
    step(&mut conn).await;
    client.recv().await;
    assert!(conn.object::<Note>(&id).is_none());
    assert_eq!(note.id(), Some(id.as_str()));
}

struct Scores {
    model: Model,
    rows: Vec<i64>,
}

impl Object for Scores {
    fn describe(t: &mut TypeBuilder<Self>) {
        t.model();
    }
}

impl DataSource for Scores {
    type Row = i64;

    fn model(&self) -> &Model {
        &self.model
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn row(&self, row: usize) -> i64 {
        self.rows[row]
    }

    fn role_names(&self) -> Vec<String> {
        vec!["score".to_string()]
    }
}

impl SortableDataSource for Scores {
    fn row_less(&self, a: usize, b: usize) -> bool {
        self.rows[a] < self.rows[b]
    }

    fn row_move(&mut self, src: usize, dst: usize) {
        let row = self.rows.remove(src);
        self.rows.insert(dst, row);
    }
}

struct Board {
    scores: QPtr<Scores>,
}

impl Object for Board {
    fn describe(t: &mut TypeBuilder<Self>) {
        t.property("scores", |b: &Board| &b.scores);
    }
}

/// Start a connection rooted at a board and reference its model and the
/// model's API object. Returns the API identifier.
async fn model_session(rows: Vec<i64>) -> (Connection, Client, QPtr<Scores>, String) {
    let scores = QPtr::new(Scores {
        model: Model::new(),
        rows,
    });
    let (mut conn, mut client) = pair(QPtr::new(Board {
        scores: scores.clone(),
    }));
    conn.process().await.unwrap();

    let root = client.handshake().await;
    let scores_id = root["data"]["scores"]["identifier"]
        .as_str()
        .unwrap()
        .to_string();
    client
        .send(json!({"command": "OBJECT_REF", "identifier": scores_id}))
        .await;
    step(&mut conn).await;
    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": scores_id}))
        .await;
    step(&mut conn).await;
    let reset = client.recv().await;
    let api_id = reset["data"]["_qb_model"]["identifier"]
        .as_str()
        .unwrap()
        .to_string();
    client
        .send(json!({"command": "OBJECT_REF", "identifier": api_id}))
        .await;
    step(&mut conn).await;
    (conn, client, scores, api_id)
}

#[tokio::test]
async fn test_model_moved_and_reset() {
    let (mut conn, mut client, scores, api_id) = model_session(vec![1, 2, 3, 4]).await;

    conn.with_context(|cx| {
        let mut source = scores.lock();
        // rows 0..2 go after the last row
        source.rows.rotate_left(2);
        cx.model_moved(&*source, 0, 2, 4);
        cx.model_moved(&*source, 1, 0, 3);
    })
    .await
    .unwrap();
    assert_eq!(
        client.recv().await,
        json!({"command": "EMIT", "identifier": api_id, "method": "modelMove", "parameters": [0, 1, 4]})
    );

    conn.with_context(|cx| {
        let mut source = scores.lock();
        source.rows = vec![9, 8];
        cx.model_reset(&*source);
    })
    .await
    .unwrap();
    assert_eq!(
        client.recv().await,
        json!({"command": "EMIT", "identifier": api_id, "method": "modelReset", "parameters": [[9, 8], 0]})
    );
}

#[tokio::test]
async fn test_batch_size_limits_pushed_rows() {
    let (mut conn, mut client, scores, api_id) = model_session(Vec::new()).await;

    client
        .send(json!({"command": "INVOKE", "identifier": api_id, "method": "setBatchSize", "parameters": [2]}))
        .await;
    step(&mut conn).await;
    let reset = client.recv().await;
    assert_eq!(reset["command"], "OBJECT_RESET");
    assert_eq!(reset["identifier"], api_id.as_str());
    assert_eq!(reset["data"]["batchSize"], 2);
    assert_eq!(reset["data"]["roleNames"], json!(["score"]));

    conn.with_context(|cx| {
        let mut source = scores.lock();
        source.rows.extend([5, 6, 7, 8, 9]);
        cx.model_inserted(&*source, 0, 5);
    })
    .await
    .unwrap();
    assert_eq!(
        client.recv().await["parameters"],
        json!([0, [5, 6], 3])
    );

    client
        .send(json!({"command": "INVOKE", "identifier": api_id, "method": "reset", "parameters": []}))
        .await;
    step(&mut conn).await;
    let reset = client.recv().await;
    assert_eq!(reset["method"], "modelReset");
    assert_eq!(reset["parameters"], json!([[5, 6], 3]));

    // Rows the client asks for are not batched
    client
        .send(json!({"command": "INVOKE", "identifier": api_id, "method": "requestRows", "parameters": [2, -1]}))
        .await;
    step(&mut conn).await;
    assert_eq!(
        client.recv().await["parameters"],
        json!([2, [7, 8, 9]])
    );
}

#[tokio::test]
async fn test_model_row_notifications() {
    let scores = QPtr::new(Scores {
        model: Model::new(),
        rows: Vec::new(),
    });
    let (mut conn, mut client) = pair(QPtr::new(Board {
        scores: scores.clone(),
    }));
    conn.process().await.unwrap();

    let root = client.handshake().await;
    let scores_tag = &root["data"]["scores"];
    assert_eq!(scores_tag["type"]["properties"]["_qb_model"], "object");
    let scores_id = scores_tag["identifier"].as_str().unwrap().to_string();

    client
        .send(json!({"command": "OBJECT_REF", "identifier": scores_id}))
        .await;
    step(&mut conn).await;
    client
        .send(json!({"command": "OBJECT_QUERY", "identifier": scores_id}))
        .await;
    step(&mut conn).await;
    let reset = client.recv().await;
    let api_tag = &reset["data"]["_qb_model"];
    assert_eq!(api_tag["type"]["name"], "modelAPI");
    assert_eq!(api_tag["type"]["properties"]["roleNames"], "array");
    let api_id = api_tag["identifier"].as_str().unwrap().to_string();

    client
        .send(json!({"command": "OBJECT_REF", "identifier": api_id}))
        .await;
    step(&mut conn).await;

    conn.with_context(|cx| {
        let mut source = scores.lock();
        source.rows.extend([3, 1, 2]);
        cx.sort_inserted(&mut *source, 0, 3);
    })
    .await
    .unwrap();
    assert_eq!(
        client.recv().await,
        json!({"command": "EMIT", "identifier": api_id, "method": "modelInsert", "parameters": [0, [1, 2, 3], 0]})
    );

    conn.with_context(|cx| {
        let mut source = scores.lock();
        source.rows.remove(0);
        cx.model_removed(&*source, 0, 1);
    })
    .await
    .unwrap();
    assert_eq!(
        client.recv().await["parameters"],
        json!([0, 0])
    );

    client
        .send(json!({"command": "INVOKE", "identifier": api_id, "method": "requestRows", "parameters": [0, -1]}))
        .await;
    step(&mut conn).await;
    let rows = client.recv().await;
    assert_eq!(rows["method"], "modelRowData");
    assert_eq!(rows["parameters"], json!([0, [2, 3]]));
}

#[tokio::test]
async fn test_lockable_connection_shares_state() {
    let root = QPtr::new(Counter::default());
    let (conn, mut client) = pair(root.clone());
    let (shared, task) = conn.run_lockable().await.unwrap();
    client.handshake().await;

    client
        .send(json!({"command": "INVOKE", "identifier": "root", "method": "add", "parameters": [3]}))
        .await;
    assert_eq!(client.recv().await["data"]["value"], 3);

    shared
        .lock()
        .await
        .with_context(|cx| {
            root.lock().value = 10;
            cx.changed(&root, "value");
        })
        .await
        .unwrap();
    assert_eq!(client.recv().await["data"]["value"], 10);

    client.writer.shutdown().await.unwrap();
    let result = task.await.unwrap();
    assert!(matches!(result, Err(BridgeError::Disconnected)));
    assert!(shared.lock().await.is_closed());
}
