use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use stilt::http::codec::{self, DecodedResponse};
use stilt::{
    handler, header, ws_handler, Address, PoolKind, Response, Route, Server, ServerConfig,
    StatusCode,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn start(server: &Arc<Server>) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let handle = {
        let server = Arc::clone(server);
        tokio::spawn(async move {
            server.start().await.unwrap();
        })
    };
    let address = server.wait_until_listening().await;
    let address = address.as_inet().expect("expected an inet listener");
    assert_ne!(address.port(), 0);
    (address, handle)
}

fn local_server() -> Arc<Server> {
    Arc::new(Server::bind(
        "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
    ))
}

fn read_response(stream: &mut TcpStream) -> DecodedResponse {
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(response) = codec::decode_response(&mut buf).unwrap() {
            return response;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before a full response arrived");
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn send(addr: SocketAddr, request: &[u8]) -> DecodedResponse {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(request).unwrap();
    read_response(&mut stream)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_route_table_answers_404() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    let response = send(addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn appended_route_serves_its_body() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    // routes may be appended while the server is live
    server.route("GET /hello", handler(|_| async { Ok(Response::text("hi")) }));

    let response = send(addr, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"hi");
    assert_eq!(response.headers.get(&header::CONTENT_LENGTH), Some("2"));

    let response = send(addr, b"GET /other HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn captures_reach_the_handler() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    server.route(
        "GET /users/:id",
        handler(|request| async move {
            let id: u32 = request.parameter("id")?;
            Ok(Response::text(format!("user {}", id)))
        }),
    );

    let response = send(addr, b"GET /users/42 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(&response.body[..], b"user 42");

    // a failed conversion is unhandled, so the table falls through to 404
    let response = send(addr, b"GET /users/fish HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sleeping_handlers_run_concurrently() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    server.route(
        "GET /sleep",
        handler(|_| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(Response::text("slept"))
        }),
    );

    let started = Instant::now();
    let clients: Vec<_> = (0..2)
        .map(|_| {
            std::thread::spawn(move || {
                let response = send(addr, b"GET /sleep HTTP/1.1\r\nHost: x\r\n\r\n");
                assert_eq!(response.status, StatusCode::OK);
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }
    // both responses together must take roughly one sleep, not two
    assert!(started.elapsed() < Duration::from_millis(950));

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keep_alive_serves_pipelined_requests() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    server.route("GET /a", handler(|_| async { Ok(Response::text("first")) }));
    server.route("GET /b", handler(|_| async { Ok(Response::text("second")) }));

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let first = read_response(&mut stream);
    assert_eq!(&first.body[..], b"first");
    let second = read_response(&mut stream);
    assert_eq!(&second.body[..], b"second");

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_close_is_honored() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    server.route("GET /bye", handler(|_| async { Ok(Response::text("bye")) }));

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /bye HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.headers.get(&header::CONNECTION), Some("close"));

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunked_request_bodies_are_decoded() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    server.route(
        "POST /echo",
        handler(|request| async move {
            Ok(Response::bytes(StatusCode::OK, request.body.clone()))
        }),
    );

    let response = send(
        addr,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
          4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    );
    assert_eq!(&response.body[..], b"Wikipedia");

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_requests_get_400() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    let response = send(addr, b"GET / HTTP/2\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let response = send(
        addr,
        b"POST / HTTP/1.1\r\nContent-Length: 2\r\nTransfer-Encoding: chunked\r\n\r\nhi",
    );
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streamed_responses_use_chunked_framing() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    server.route(
        "GET /stream",
        handler(|_| async {
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            tokio::spawn(async move {
                for part in ["str", "eam", "ing"] {
                    if tx.send(Bytes::from_static(part.as_bytes())).await.is_err() {
                        return;
                    }
                }
            });
            Ok(Response::stream(StatusCode::OK, rx))
        }),
    );

    let response = send(addr, b"GET /stream HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(
        response.headers.get(&header::TRANSFER_ENCODING),
        Some("chunked")
    );
    assert_eq!(&response.body[..], b"streaming");

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn websocket_echo_round_trip() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    server.route(
        "GET /socket",
        handler(|_| async {
            Ok(Response::websocket(ws_handler(|mut rx, tx| async move {
                while let Some(message) = rx.recv().await {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
            })))
        }),
    );

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(
            b"GET /socket HTTP/1.1\r\n\
              Host: x\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

    // 101 with the RFC 6455 accept key
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"));
    assert!(head.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    // masked text frame "ping"
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let mut frame = vec![0x81, 0x84];
    frame.extend_from_slice(&mask);
    frame.extend(b"ping".iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    stream.write_all(&frame).unwrap();

    // unmasked echo
    let mut echo = [0u8; 6];
    stream.read_exact(&mut echo).unwrap();
    assert_eq!(&echo[..2], &[0x81, 0x04]);
    assert_eq!(&echo[2..], b"ping");

    // masked close, mirrored back unmasked
    let close = [0x88u8, 0x80, 0x01, 0x02, 0x03, 0x04];
    stream.write_all(&close).unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0x88, 0x00]);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upgrade_without_key_is_rejected() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    server.route(
        "GET /socket",
        handler(|_| async {
            Ok(Response::websocket(ws_handler(|_rx, _tx| async {})))
        }),
    );

    let response = send(addr, b"GET /socket HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_deadline_closes_inflight_connections() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    server.route(
        "GET /slow",
        handler(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Response::text("late"))
        }),
    );

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopping = Instant::now();
    server.stop_within(Duration::from_millis(100)).await;
    handle.await.unwrap();
    assert!(stopping.elapsed() < Duration::from_millis(500));

    // the in-flight connection was force-closed
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut rest = Vec::new();
    let eof = stream.read_to_end(&mut rest);
    assert!(eof.is_ok() && rest.is_empty(), "expected EOF, got {:?}", rest);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_start_closes_idle_connections() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    server.route("GET /hello", handler(|_| async { Ok(Response::text("hi")) }));

    // park a fleet of idle keep-alive connections
    let mut clients = Vec::new();
    for _ in 0..100 {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let response = read_response(&mut stream);
        assert_eq!(response.status, StatusCode::OK);
        clients.push(stream);
    }

    handle.abort();
    let _ = handle.await;

    // every client must observe EOF promptly once the task is gone
    for mut stream in clients {
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut rest = Vec::new();
        let eof = stream.read_to_end(&mut rest);
        assert!(eof.is_ok() && rest.is_empty(), "client did not observe EOF");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn poll_backend_serves_requests() {
    init_logging();
    let mut config = ServerConfig::new("127.0.0.1:0".parse::<SocketAddr>().unwrap());
    config.pool = PoolKind::poll();
    let server = Arc::new(Server::new(config));
    let (addr, handle) = start(&server).await;

    server.route("GET /hello", handler(|_| async { Ok(Response::text("hi")) }));

    let response = send(addr, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"hi");

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unix_listener_cleans_up_its_path() {
    init_logging();
    let path = std::env::temp_dir().join(format!("stilt-test-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let server = Arc::new(Server::bind(Address::unix(&path)));
    let handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            server.start().await.unwrap();
        })
    };
    let address = server.wait_until_listening().await;
    assert_eq!(address, Address::unix(&path));

    server.route("GET /hello", handler(|_| async { Ok(Response::text("hi")) }));

    let mut stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 4096];
    let response = loop {
        if let Some(response) = codec::decode_response(&mut buf).unwrap() {
            break response;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0);
        buf.extend_from_slice(&chunk[..n]);
    };
    assert_eq!(&response.body[..], b"hi");

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
    assert!(!path.exists(), "socket path should be removed on close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn route_predicates_filter_queries() {
    init_logging();
    let server = local_server();
    let (addr, handle) = start(&server).await;

    server.append_route(
        Route::new("GET /hello?time=*"),
        handler(|request| async move {
            let time = request.query_value("time").unwrap_or("sometime").to_owned();
            Ok(Response::text(format!("good {}", time)))
        }),
    );

    let response = send(addr, b"GET /hello?time=morning HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(&response.body[..], b"good morning");

    let response = send(addr, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    server.stop_within(Duration::from_secs(1)).await;
    handle.await.unwrap();
}
