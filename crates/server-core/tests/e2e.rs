//! End-to-end tests over a real TLS listener.

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use server_core::{Broker, Server, ServerConfig, ServerError};

struct Stack {
    broker: Arc<Broker>,
    input_tx: mpsc::Sender<String>,
    addr: std::net::SocketAddr,
    fingerprint: String,
    root: CancellationToken,
    server: tokio::task::JoinHandle<Result<(), ServerError>>,
    _broker_task: tokio::task::JoinHandle<Result<(), ServerError>>,
}

async fn stack(one_shell: bool) -> Stack {
    let (input_tx, input_rx) = mpsc::channel(1024);
    let (output_tx, mut output_rx) = mpsc::channel(1024);
    // The terminal isn't under test; just drain it.
    tokio::spawn(async move { while output_rx.recv().await.is_some() {} });

    let broker = Broker::new(input_rx, output_tx.clone()).unwrap();
    let root = CancellationToken::new();
    let broker_task = tokio::spawn({
        let broker = broker.clone();
        let ctx = root.clone();
        async move { broker.run(ctx).await }
    });

    let server = Server::new(
        ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            one_shell,
            ..ServerConfig::default()
        },
        broker.clone(),
        output_tx,
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let fingerprint = server.fingerprint().to_string();
    let server = tokio::spawn({
        let ctx = root.clone();
        async move { server.run(ctx).await }
    });

    Stack {
        broker,
        input_tx,
        addr,
        fingerprint,
        root,
        server,
        _broker_task: broker_task,
    }
}

/// Open a pinned TLS connection to the server.
async fn pinned_connect(
    stack: &Stack,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let cfg = client_core::pinned_tls_config(&stack.fingerprint).unwrap();
    let connector = TlsConnector::from(Arc::new(cfg));
    let tcp = TcpStream::connect(stack.addr).await.unwrap();
    let name = tokio_rustls::rustls::pki_types::ServerName::try_from("localhost").unwrap();
    connector.connect(name, tcp).await.unwrap()
}

#[tokio::test]
async fn script_is_served_over_pinned_tls() {
    let stack = stack(false).await;

    let mut tls = pinned_connect(&stack).await;
    let req = format!(
        "GET /c HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        stack.addr,
    );
    tls.write_all(req.as_bytes()).await.unwrap();

    let mut response = String::new();
    timeout(Duration::from_secs(5), tls.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(
        response.contains(&format!("sha256//{}", stack.fingerprint)),
        "script must pin our fingerprint: {response}",
    );
    assert!(
        response.contains(&format!("https://{}", stack.addr)),
        "script must call back to the Host header: {response}",
    );

    stack.root.cancel();
    let _ = timeout(Duration::from_secs(5), stack.server).await.unwrap();
    drop(stack.input_tx);
}

#[tokio::test]
async fn one_shell_mode_closes_the_listener_and_exits_cleanly() {
    let stack = stack(true).await;

    // Fresh connections work before any shell shows up.
    drop(pinned_connect(&stack).await);

    // Pair a session directly against the broker.
    let ctx = stack.root.child_token();
    let (in_w, _in_r) = tokio::io::duplex(2048);
    let (out_w, out_r) = tokio::io::duplex(2048);
    let broker = stack.broker.clone();
    let c = ctx.clone();
    let t_in =
        tokio::spawn(async move { broker.connect_in(&c, "t", in_w, b"abc").await });
    let broker = stack.broker.clone();
    let c = ctx.clone();
    let t_out =
        tokio::spawn(async move { broker.connect_out(&c, "t", out_r, b"abc").await });

    // The listener must close shortly after the session pairs.
    let mut closed = false;
    for _ in 0..100 {
        if TcpStream::connect(stack.addr).await.is_err() {
            closed = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(closed, "listener still accepting after first shell connected");

    // Ending the session ends the server with the one-shell sentinel.
    drop(out_w);
    let res = timeout(Duration::from_secs(5), stack.server)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(ServerError::OneShellClosed)), "{res:?}");

    t_out.await.unwrap();
    t_in.await.unwrap();
    stack.root.cancel();
}
