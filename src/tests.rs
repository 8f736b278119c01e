use std::{sync::Arc, time::Duration};

use http::StatusCode;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::Instrument;
use tracing_test::traced_test;
use url::Url;

use crate::{
    echo, session::close_all, ClientBuilder, ClientConnection, CloseReason, Event, Server,
    ServerBuilder, Session, SessionError, SessionId, SessionState, Shutdown, TracingObserver,
};

const TIMEOUT: Duration = Duration::from_secs(10);

async fn server(builder: ServerBuilder) -> Server {
    let server = builder
        .build()
        .instrument(tracing::error_span!("server-ep"))
        .await
        .unwrap();

    tokio::spawn({
        let server = server.clone();
        async move { server.run().await }.instrument(tracing::error_span!("server"))
    });

    server
}

async fn connect(server: &Server) -> ClientConnection {
    let client = ClientBuilder::new()
        .build()
        .instrument(tracing::error_span!("client-ep"))
        .await
        .unwrap();

    client.connect(server.endpoint_addr()).await.unwrap()
}

fn url(server: &Server, path: &str) -> Url {
    format!("https://{}{path}", server.endpoint_id())
        .parse()
        .unwrap()
}

// Serves "/echo" and reports each accepted session.
fn route_echo(server: &Server) -> mpsc::UnboundedReceiver<Session> {
    let (tx, rx) = mpsc::unbounded_channel();
    server.route("/echo", move |session: &Session| {
        echo::serve(session);
        tx.send(session.clone()).ok();
    });
    rx
}

#[tokio::test]
#[traced_test]
async fn echo_smoke() -> n0_error::Result<()> {
    let server = server(ServerBuilder::new()).await;
    let mut accepted = route_echo(&server);

    let conn = connect(&server).await;
    assert_eq!(conn.remote_id(), server.endpoint_id());

    let session = conn.create_session(url(&server, "/echo")).open().await.unwrap();
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(session.url().path(), "/echo");

    let remote = accepted.recv().await.unwrap();
    assert_eq!(remote.id(), session.id());
    assert_eq!(remote.url(), session.url());

    let reply = echo::round_trip(&session, b"Hello, world!").await.unwrap();
    assert_eq!(&reply[..], b"Hello, world!");

    session.close(0, "done");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn echo_on_every_path() -> n0_error::Result<()> {
    let server = server(ServerBuilder::new()).await;
    for path in echo::PATHS {
        server.route(path, |session: &Session| echo::serve(session));
    }

    // Both sessions share one connection.
    let conn = connect(&server).await;
    for path in echo::PATHS {
        let session = conn.create_session(url(&server, path)).open().await.unwrap();
        assert_eq!(session.url().path(), path);

        let reply = echo::round_trip(&session, path.as_bytes()).await.unwrap();
        assert_eq!(&reply[..], path.as_bytes());
    }
    assert_eq!(server.sessions().len(), 2);

    Ok(())
}

#[tokio::test]
#[traced_test]
async fn echo_empty_and_large_payloads() -> n0_error::Result<()> {
    let server = server(ServerBuilder::new()).await;
    let _accepted = route_echo(&server);

    let conn = connect(&server).await;
    let session = conn.create_session(url(&server, "/echo")).open().await.unwrap();

    let reply = echo::round_trip(&session, b"").await.unwrap();
    assert!(reply.is_empty());

    let payload: Vec<u8> = (0..1 << 20).map(|i| (i % 251) as u8).collect();
    let reply = echo::round_trip(&session, &payload).await.unwrap();
    assert_eq!(reply.len(), payload.len());
    assert_eq!(&reply[..], &payload[..]);

    Ok(())
}

#[tokio::test]
#[traced_test]
async fn echo_reports_events() -> n0_error::Result<()> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let server = server(ServerBuilder::new().with_observer(move |event: &Event| {
        tx.send(event.clone()).ok();
    }))
    .await;
    let _accepted = route_echo(&server);

    let conn = connect(&server).await;
    let session = conn.create_session(url(&server, "/echo")).open().await.unwrap();
    echo::round_trip(&session, b"ping").await.unwrap();

    let mut opened = false;
    tokio::time::timeout(TIMEOUT, async {
        while let Some(event) = events.recv().await {
            match event {
                Event::SessionOpened { session: id, .. } => {
                    assert_eq!(id, session.id());
                    opened = true;
                }
                Event::StreamEchoed { bytes, .. } => {
                    assert_eq!(bytes, 4);
                    break;
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(opened);

    Ok(())
}

#[tokio::test]
#[traced_test]
async fn unknown_path_is_rejected() -> n0_error::Result<()> {
    let server = server(ServerBuilder::new()).await;
    let _accepted = route_echo(&server);

    let conn = connect(&server).await;

    let terminated = Arc::new(Mutex::new(Vec::new()));
    let pending = conn.create_session(url(&server, "/missing")).on_terminated({
        let terminated = terminated.clone();
        move |code, _reason: &str| terminated.lock().push(code)
    });
    assert_eq!(pending.state(), SessionState::Opening);

    let err = pending.open().await.unwrap_err();
    assert_eq!(err.rejected_status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(*terminated.lock(), vec![0]);

    // The connection survives the rejection.
    let session = conn.create_session(url(&server, "/echo")).open().await.unwrap();
    let reply = echo::round_trip(&session, b"still here").await.unwrap();
    assert_eq!(&reply[..], b"still here");

    Ok(())
}

// A HEADERS frame for `https://a/` whose `:method` field is `method`, QPACK encoded.
fn plain_request(method: &[u8]) -> Vec<u8> {
    let mut fields = vec![0x00, 0x00];
    fields.extend_from_slice(method);
    fields.extend_from_slice(&[0xd7, 0xc1, 0x50, 0x01, b'a']);

    let mut frame = vec![0x01, fields.len() as u8];
    frame.extend(fields);
    frame
}

async fn send_plain_request(conn: &ClientConnection, method: &[u8]) -> StatusCode {
    let (mut send, mut recv) = conn.conn().open_bi().await.unwrap();
    send.write_all(&plain_request(method)).await.unwrap();
    send.finish().unwrap();

    let response = web_transport_proto::ConnectResponse::read(&mut recv);
    match tokio::time::timeout(TIMEOUT, response).await.unwrap() {
        Ok(response) => response.status,
        Err(web_transport_proto::ConnectError::WrongStatus(Some(status))) => status,
        Err(err) => panic!("unexpected response: {err}"),
    }
}

#[tokio::test]
#[traced_test]
async fn plain_requests_are_answered_by_the_gate() -> n0_error::Result<()> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let server = server(ServerBuilder::new().with_observer(move |event: &Event| {
        tx.send(event.clone()).ok();
    }))
    .await;
    let _accepted = route_echo(&server);

    let conn = connect(&server).await;

    // Static table entries for GET, POST and CONNECT.
    assert_eq!(send_plain_request(&conn, &[0xd1]).await, StatusCode::OK);
    assert_eq!(
        send_plain_request(&conn, &[0xd4]).await,
        StatusCode::METHOD_NOT_ALLOWED
    );
    // CONNECT without `:protocol`.
    assert_eq!(
        send_plain_request(&conn, &[0xcf]).await,
        StatusCode::METHOD_NOT_ALLOWED
    );
    // An empty `:method` literal.
    assert_eq!(
        send_plain_request(&conn, &[0x5f, 0x00, 0x00]).await,
        StatusCode::METHOD_NOT_ALLOWED
    );

    let mut rejected = Vec::new();
    tokio::time::timeout(TIMEOUT, async {
        while rejected.len() < 3 {
            match events.recv().await {
                Some(Event::RequestRejected { request, status }) => {
                    rejected.push((request, status))
                }
                Some(_) => {}
                None => break,
            }
        }
    })
    .await
    .unwrap();
    rejected.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        rejected,
        vec![
            ("<none> request".to_owned(), StatusCode::METHOD_NOT_ALLOWED),
            ("CONNECT request".to_owned(), StatusCode::METHOD_NOT_ALLOWED),
            ("POST request".to_owned(), StatusCode::METHOD_NOT_ALLOWED),
        ]
    );

    // The connection still carries sessions afterwards.
    let session = conn.create_session(url(&server, "/echo")).open().await.unwrap();
    let reply = echo::round_trip(&session, b"after").await.unwrap();
    assert_eq!(&reply[..], b"after");

    Ok(())
}

#[tokio::test]
#[traced_test]
async fn connection_loss_terminates_sessions() -> n0_error::Result<()> {
    let server = server(ServerBuilder::new()).await;
    let mut accepted = route_echo(&server);

    let conn = connect(&server).await;
    let session = conn.create_session(url(&server, "/echo")).open().await.unwrap();
    let remote = accepted.recv().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    remote.on_terminated({
        let seen = seen.clone();
        move |code, reason: &str| seen.lock().push((code, reason.to_owned()))
    });

    conn.close(9, "gone");

    // The server reads the session code back out of the connection close.
    let err = tokio::time::timeout(TIMEOUT, remote.closed()).await.unwrap();
    assert!(
        matches!(&err, SessionError::Terminated(reason) if *reason == CloseReason::new(9, "gone")),
        "{err}"
    );
    assert_eq!(*seen.lock(), vec![(9, "gone".to_owned())]);
    assert!(server.sessions().is_empty());

    let err = tokio::time::timeout(TIMEOUT, session.closed()).await.unwrap();
    assert!(
        matches!(&err, SessionError::Terminated(reason) if reason.code == 0),
        "{err}"
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[traced_test]
async fn streams_racing_termination_are_dropped() -> n0_error::Result<()> {
    let server = server(ServerBuilder::new()).await;
    let conn = connect(&server).await;

    let mut streams = Vec::new();
    for _ in 0..16 {
        streams.push(conn.conn().open_bi().await.unwrap());
    }

    let session = Session::new(
        conn.conn().clone(),
        SessionId::new(0),
        url(&server, "/echo"),
        SessionState::Open,
        Arc::new(TracingObserver),
    )
    .unwrap();

    let start = Arc::new(tokio::sync::Barrier::new(streams.len() + 1));
    let deliveries: Vec<_> = streams
        .into_iter()
        .map(|(send, recv)| {
            let session = session.clone();
            let start = start.clone();
            tokio::spawn(async move {
                start.wait().await;
                session.deliver_bi(send, recv);
            })
        })
        .collect();

    start.wait().await;
    session.terminate(CloseReason::new(3, "gone"));
    for delivery in deliveries {
        delivery.await.unwrap();
    }

    // Queued streams are returned before termination is checked, so any leak shows here.
    assert!(matches!(
        session.accept_bi().await,
        Err(SessionError::Terminated(reason)) if reason.code == 3
    ));

    Ok(())
}

#[tokio::test]
#[traced_test]
async fn close_gives_up_on_unflushed_sessions() -> n0_error::Result<()> {
    let server = server(ServerBuilder::new()).await;
    let conn = connect(&server).await;

    // Nothing drives a CONNECT stream for this session, so its close is never flushed.
    let session = Session::new(
        conn.conn().clone(),
        SessionId::new(0),
        url(&server, "/echo"),
        SessionState::Open,
        Arc::new(TracingObserver),
    )
    .unwrap();

    tokio::time::timeout(
        TIMEOUT,
        close_all(vec![session.clone()], 4, "closing", Duration::from_millis(100)),
    )
    .await
    .unwrap();
    assert_eq!(session.close_reason(), Some(CloseReason::new(4, "closing")));

    server.close().await;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn close_unblocks_pending_read() -> n0_error::Result<()> {
    let server = server(ServerBuilder::new()).await;
    // Never answers, so the client's read can only end with the session.
    server.route("/sink", |session: &Session| {
        session.set_stream_handler(|mut stream| async move {
            stream.recv().read_all().await.ok();
        });
    });

    let conn = connect(&server).await;
    let session = conn.create_session(url(&server, "/sink")).open().await.unwrap();

    let (mut send, mut recv) = session.open_bi().await.unwrap().into_parts();
    send.write_all(b"hello?").await.unwrap();

    let read = tokio::spawn(async move { recv.read_all().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    session.close(7, "done");

    let err = tokio::time::timeout(TIMEOUT, read)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(err.is_session_terminated(), "{err}");

    let err = send.write_all(b"more").await.unwrap_err();
    assert!(err.is_session_terminated(), "{err}");
    assert!(matches!(
        session.open_bi().await,
        Err(SessionError::Terminated(_))
    ));

    Ok(())
}

#[tokio::test]
#[traced_test]
async fn termination_is_delivered_once() -> n0_error::Result<()> {
    let server = server(ServerBuilder::new()).await;
    let mut accepted = route_echo(&server);

    let conn = connect(&server).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let session = conn
        .create_session(url(&server, "/echo"))
        .on_terminated({
            let seen = seen.clone();
            move |code, reason: &str| seen.lock().push((code, reason.to_owned()))
        })
        .open()
        .await.unwrap();
    let remote = accepted.recv().await.unwrap();

    session.close(42, "bye");
    session.close(43, "again");
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(session.close_reason(), Some(CloseReason::new(42, "bye")));

    // The server learns the code and reason from the close capsule.
    let err = tokio::time::timeout(TIMEOUT, remote.closed()).await.unwrap();
    assert!(
        matches!(&err, SessionError::Terminated(reason) if *reason == CloseReason::new(42, "bye")),
        "{err}"
    );

    // Listeners registered late are replayed immediately.
    let late = Arc::new(Mutex::new(Vec::new()));
    remote.on_terminated({
        let late = late.clone();
        move |code, reason: &str| late.lock().push((code, reason.to_owned()))
    });

    assert_eq!(*seen.lock(), vec![(42, "bye".to_owned())]);
    assert_eq!(*late.lock(), vec![(42, "bye".to_owned())]);

    Ok(())
}

#[tokio::test]
#[traced_test]
async fn stalled_session_does_not_block_others() -> n0_error::Result<()> {
    let server = server(ServerBuilder::new()).await;
    let _accepted = route_echo(&server);

    let conn = connect(&server).await;
    let stalled = conn.create_session(url(&server, "/echo")).open().await.unwrap();
    let session = conn.create_session(url(&server, "/echo")).open().await.unwrap();
    assert_ne!(stalled.id(), session.id());

    // An echo stream that never finishes.
    let (mut send, _recv) = stalled.open_bi().await.unwrap().into_parts();
    send.write_all(b"partial").await.unwrap();

    // A raw stream whose header never completes.
    let (mut raw, _raw_recv) = conn.conn().open_bi().await.unwrap();
    raw.write_all(&[0x40]).await.unwrap();

    let reply = tokio::time::timeout(TIMEOUT, echo::round_trip(&session, b"Hello, world!"))
        .await
        .unwrap().unwrap();
    assert_eq!(&reply[..], b"Hello, world!");

    // Closing one session leaves the other running.
    stalled.close(1, "stalled");
    let reply = echo::round_trip(&session, b"again").await.unwrap();
    assert_eq!(&reply[..], b"again");

    Ok(())
}

#[tokio::test]
#[traced_test]
async fn shutdown_closes_sessions_then_server() -> n0_error::Result<()> {
    let server = server(ServerBuilder::new()).await;
    let mut accepted = route_echo(&server);
    let addr = server.endpoint_addr();

    let client = ClientBuilder::new().build().await.unwrap();
    let session = client
        .connect(addr.clone())
        .await
        .unwrap()
        .create_session(url(&server, "/echo"))
        .open()
        .await.unwrap();
    let remote = accepted.recv().await.unwrap();

    let mut shutdown = Shutdown::new()
        .with_server(server.clone())
        .with_client(client);
    shutdown.track(&session);

    let res: anyhow::Result<&str> = shutdown.finish(Ok("done")).await;
    assert_eq!(res.unwrap(), "done");

    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(remote.state(), SessionState::Terminated);
    assert!(server.sessions().is_empty());

    let late = ClientBuilder::new()
        .with_connect_timeout(Duration::from_secs(2))
        .build()
        .await.unwrap();
    assert!(late.connect(addr).await.is_err());

    Ok(())
}

#[tokio::test]
#[traced_test]
async fn shutdown_keeps_the_original_error() {
    let shutdown = Shutdown::new();
    let res: anyhow::Result<()> = shutdown.finish(Err(anyhow::anyhow!("boom"))).await;
    assert_eq!(res.unwrap_err().to_string(), "boom");
}
