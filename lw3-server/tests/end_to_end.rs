//! End-to-end tests: a real server on a loopback port, driven by raw TCP
//! lines and by `lw3-client`.

use lw3_client::{
    Client, ClientError, ClientEvent, ConnectionConfig, Credentials, Transport, Value,
};
use lw3_protocol::ErrorCode;
use lw3_server::{Server, ServerConfig};
use lw3_tree::{Method, MethodError, Property, Tree};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

fn sample_tree() -> Tree {
    let tree = Tree::new();
    let node = tree.node("/PATH/TO/MY/NODE").unwrap();
    node.define_property("TestProperty", Property::new("").manual("Free text"))
        .unwrap();
    node.define_property("Locked", Property::read_only("fixed"))
        .unwrap();
    node.set("SignalPresent", false).unwrap();

    let p = tree.node("/P").unwrap();
    p.define_method(
        "subtract",
        Method::from_fn(|args| {
            let a = args.first().and_then(Value::as_f64).unwrap_or(0.0);
            let b = args.get(1).and_then(Value::as_f64).unwrap_or(0.0);
            Ok(Some(Value::Number(a - b)))
        })
        .manual("Subtracts the second argument from the first"),
    )
    .unwrap();
    p.define_method(
        "fail",
        Method::from_fn(|_| Err(MethodError::Internal("boom".into()))),
    )
    .unwrap();
    p.define_method(
        "reject",
        Method::from_fn(|_| Err(MethodError::Protocol(ErrorCode::InvalidValue))),
    )
    .unwrap();
    tree
}

async fn start(tree: Tree) -> (Arc<Server>, SocketAddr) {
    start_with(ServerConfig::default(), tree).await
}

async fn start_with(config: ServerConfig, tree: Tree) -> (Arc<Server>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(config, tree));
    let running = server.clone();
    tokio::spawn(async move { running.serve(listener).await });
    (server, addr)
}

async fn connect_client(addr: SocketAddr) -> Client {
    let config = ConnectionConfig::new(addr.ip().to_string(), addr.port());
    let client = Client::new(config);
    client.wait_connected(Duration::from_secs(5)).await.unwrap();
    client
}

struct RawConnection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RawConnection {
    async fn open(addr: SocketAddr) -> Self {
        let (read, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn line(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }
}

#[tokio::test]
async fn test_raw_set_round_trip() {
    let tree = sample_tree();
    let (server, addr) = start(tree.clone()).await;
    let mut conn = RawConnection::open(addr).await;

    conn.send("SET /PATH/TO/MY/NODE.TestProperty=sample\\nvalue")
        .await;
    assert_eq!(
        conn.line().await,
        "pw /PATH/TO/MY/NODE.TestProperty=sample\\nvalue"
    );
    let node = tree.resolve("/PATH/TO/MY/NODE").unwrap();
    assert_eq!(
        node.property("TestProperty").unwrap().value,
        "sample\nvalue"
    );

    conn.send("0001#SET /PATH/TO/MY/NODE.Locked=other").await;
    assert_eq!(conn.line().await, "{0001");
    assert_eq!(
        conn.line().await,
        "-E SET /PATH/TO/MY/NODE.Locked=other %E007:Access denied"
    );
    assert_eq!(conn.line().await, "}");
    assert_eq!(node.property("Locked").unwrap().value, "fixed");

    conn.send("FETCH /").await;
    assert!(conn.line().await.ends_with("%E001:Syntax error"));
    server.shutdown();
}

#[tokio::test]
async fn test_raw_method_errors() {
    let (server, addr) = start(sample_tree()).await;
    let mut conn = RawConnection::open(addr).await;

    conn.send("CALL /P:subtract(10,2)").await;
    assert_eq!(conn.line().await, "mO /P:subtract=8");

    conn.send("CALL /P:fail(10,2)").await;
    assert_eq!(conn.line().await, "mE /P:fail=boom %E010:Internal error");

    conn.send("CALL /P:reject()").await;
    assert_eq!(conn.line().await, "mE /P:reject %E004:Invalid value");

    conn.send("CALL /P:missing()").await;
    assert!(conn.line().await.ends_with("%E002:Not exists"));
    server.shutdown();
}

#[tokio::test]
async fn test_client_requests() {
    let (server, addr) = start(sample_tree()).await;
    let client = connect_client(addr).await;

    client
        .set("/PATH/TO/MY/NODE.TestProperty", "a (b)")
        .await
        .unwrap();
    assert_eq!(
        client.get("/PATH/TO/MY/NODE.TestProperty").await.unwrap(),
        Value::String("a (b)".into())
    );

    let err = client
        .set("/PATH/TO/MY/NODE.Locked", "x")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::AccessDenied));

    let err = client.get("/PATH/TO/MY/NODE.Missing").await.unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::NotExists));

    assert_eq!(client.call("/P:subtract", "10,2").await.unwrap(), "8");
    match client.call("/P:fail", "").await.unwrap_err() {
        ClientError::Method { code, message } => {
            assert_eq!(code, ErrorCode::InternalError);
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    assert_eq!(client.children("/PATH/TO").await.unwrap(), vec!["/PATH/TO/MY"]);
    let manuals = client.manual("/P:subtract").await.unwrap();
    assert_eq!(
        manuals,
        vec![(
            "/P:subtract".to_string(),
            "Subtracts the second argument from the first".to_string()
        )]
    );
    server.shutdown();
}

#[tokio::test]
async fn test_client_subscription_filter() {
    let tree = sample_tree();
    let (server, addr) = start(tree.clone()).await;
    let client = connect_client(addr).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    client
        .open(
            "/PATH/TO/MY/NODE",
            "SignalPresent=true",
            None,
            move |_, _, value| {
                assert_eq!(value, &Value::Bool(true));
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap();

    let node = tree.resolve("/PATH/TO/MY/NODE").unwrap();
    node.set("test1", "x").unwrap();
    node.set("SignalPresent", false).unwrap();
    node.set("SignalPresent", true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    // A round trip flushes any notification still in flight.
    client.call("/P:subtract", "1,1").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        client.get("/PATH/TO/MY/NODE.test1").await.unwrap(),
        Value::String("x".into())
    );
    server.shutdown();
}

#[tokio::test]
async fn test_client_wait_for_and_view() {
    let tree = sample_tree();
    let (server, addr) = start(tree.clone()).await;
    let client = connect_client(addr).await;

    let view = client.view("/PATH/TO/MY/NODE").await.unwrap();
    assert_eq!(view.get("Locked"), Some(Value::String("fixed".into())));
    assert_eq!(view.get("SignalPresent"), Some(Value::Bool(false)));

    let waiter = client.clone();
    let wait = tokio::spawn(async move {
        waiter
            .wait_for("/PATH/TO/MY/NODE", "SignalPresent=true")
            .await
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.subscription_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tree.resolve("/PATH/TO/MY/NODE")
        .unwrap()
        .set("SignalPresent", true)
        .unwrap();
    assert_eq!(wait.await.unwrap().unwrap(), Value::Bool(true));
    client.sync().await.unwrap();
    assert_eq!(view.get("SignalPresent"), Some(Value::Bool(true)));

    view.close().await.unwrap();
    assert_eq!(client.subscription_count(), 0);
    let node = server.tree().resolve("/PATH/TO/MY/NODE").unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while node.listener_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_client_over_websocket_with_credentials() {
    let config = ServerConfig::default()
        .with_transport(Transport::WebSocket)
        .with_credentials(Credentials::new("admin", "secret"));
    let (_server, addr) = start_with(config, sample_tree()).await;

    let url = format!("ws://{}", addr);
    let config = ConnectionConfig::parse(&url)
        .unwrap()
        .with_credentials(Credentials::new("admin", "secret"));
    let client = Client::new(config);
    client.wait_connected(Duration::from_secs(5)).await.unwrap();

    client.set("/PATH/TO/MY/NODE.TestProperty", "over ws").await.unwrap();
    assert_eq!(
        client.get("/PATH/TO/MY/NODE.TestProperty").await.unwrap(),
        Value::String("over ws".into())
    );
    assert_eq!(client.call("/P:subtract", "10,2").await.unwrap(), "8");

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    client
        .open("/PATH/TO/MY/NODE", "SignalPresent", None, move |_, _, value| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(value.clone());
            }
        })
        .await
        .unwrap();
    client.set("/PATH/TO/MY/NODE.SignalPresent", true).await.unwrap();
    let value = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, Value::Bool(true));
}

#[tokio::test]
async fn test_websocket_wrong_password_stays_disconnected() {
    let config = ServerConfig::default()
        .with_transport(Transport::WebSocket)
        .with_credentials(Credentials::new("admin", "secret"));
    let (_server, addr) = start_with(config, sample_tree()).await;

    let config = ConnectionConfig::new(addr.ip().to_string(), addr.port())
        .with_transport(Transport::WebSocket)
        .with_credentials(Credentials::new("admin", "guess"))
        .with_retry_timeout(Duration::from_secs(60));
    let client = Client::new(config);
    let mut events = client.subscribe_events();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, ClientEvent::Error(ClientError::Unauthorized.to_string()));
    assert!(!client.is_connected());
    assert!(matches!(
        client.get("/PATH/TO/MY/NODE.TestProperty").await.unwrap_err(),
        ClientError::NotConnected
    ));
}
