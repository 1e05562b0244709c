use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use serde_derive::Deserialize;
use serde_json::json;

use crate::*;

fn session_pair() -> (Arc<Session>, Arc<Session>) {
    let (a, b) = UnixStream::pair().unwrap();
    let a = Session::new(Stream::Unix(UnixConn::new(a))).unwrap();
    let b = Session::new(Stream::Unix(UnixConn::new(b))).unwrap();
    (Arc::new(a), Arc::new(b))
}

fn test_ctx() -> Context {
    Context::background().with_timeout(Duration::from_secs(10))
}

fn serve_in_background(server: Server, session: Arc<Session>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        server.serve_session(&Context::background(), session.clone());
        let _ = session.close();
    })
}

/// Open/close gate for making handlers block deterministically.
#[derive(Clone)]
struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    fn new() -> Gate {
        Gate {
            state: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    fn wait(&self) {
        let (lock, cv) = &*self.state;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cv.wait(open).unwrap();
        }
    }

    fn open(&self) {
        let (lock, cv) = &*self.state;
        *lock.lock().unwrap() = true;
        cv.notify_all();
    }
}

fn wait_until<F: Fn() -> bool>(pred: F) {
    for _ in 0..1000 {
        if pred() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within 5s");
}

#[test]
fn test_uri_parsing() {
    let uri = Uri::parse("unix:@org.example.ping;mode=0600").unwrap();
    assert_eq!(uri.scheme, "unix");
    assert_eq!(uri.address, "@org.example.ping");

    let uri = Uri::parse("tcp:127.0.0.1:12345").unwrap();
    assert_eq!(uri.scheme, "tcp");
    assert_eq!(uri.address, "127.0.0.1:12345");
    assert_eq!(uri.to_string(), "tcp:127.0.0.1:12345");

    assert!(Uri::parse("no-scheme-separator").is_err());
}

#[test]
fn test_wire_format() {
    let call = Call::new("org.example.ping.Ping");
    assert_eq!(
        serde_json::to_string(&call).unwrap(),
        r#"{"method":"org.example.ping.Ping"}"#
    );

    let call = Call::new("org.example.ping.Ping")
        .with_oneway()
        .with_parameters(json!({"ping": "hi"}));
    assert_eq!(
        serde_json::to_string(&call).unwrap(),
        r#"{"method":"org.example.ping.Ping","oneway":true,"parameters":{"ping":"hi"}}"#
    );

    // Replies always carry parameters, even when logically empty.
    assert_eq!(
        serde_json::to_string(&Reply::new()).unwrap(),
        r#"{"parameters":{}}"#
    );
    assert_eq!(
        serde_json::to_string(&Reply::new().with_continues()).unwrap(),
        r#"{"parameters":{},"continues":true}"#
    );

    let reply: Reply = serde_json::from_str("{}").unwrap();
    assert_eq!(reply.parameters, json!({}));
    assert!(!reply.continues);
    assert!(reply.error.is_none());
}

#[test]
fn test_decode_params() {
    #[derive(Deserialize, Debug)]
    #[serde(deny_unknown_fields)]
    struct PingArgs {
        ping: String,
    }

    let args: PingArgs = decode_params(Some(&json!({"ping": "hi"}))).unwrap();
    assert_eq!(args.ping, "hi");

    let err = decode_params::<PingArgs>(Some(&json!({"ping": "hi", "extra": 1}))).unwrap_err();
    assert_eq!(err.code(), "org.varlink.service.InvalidParameter");
    assert_eq!(err.parameters().unwrap()["parameter"], "extra");

    let err = decode_params::<PingArgs>(Some(&json!({}))).unwrap_err();
    assert_eq!(err.code(), "org.varlink.service.InvalidParameter");
    assert_eq!(err.parameters().unwrap()["parameter"], "ping");

    // A field of the wrong type names that field, like an unknown one.
    let err = decode_params::<PingArgs>(Some(&json!({"ping": 7}))).unwrap_err();
    assert_eq!(err.code(), "org.varlink.service.InvalidParameter");
    assert_eq!(err.parameters().unwrap()["parameter"], "ping");

    #[derive(Deserialize, Debug)]
    struct NestedArgs {
        #[allow(dead_code)]
        shipment: ShipmentArgs,
    }
    #[derive(Deserialize, Debug)]
    struct ShipmentArgs {
        #[allow(dead_code)]
        weight: i64,
    }
    let err = decode_params::<NestedArgs>(Some(&json!({"shipment": {"weight": "heavy"}})))
        .unwrap_err();
    assert_eq!(err.code(), "org.varlink.service.InvalidParameter");
    assert_eq!(err.parameters().unwrap()["parameter"], "shipment.weight");

    // Failures with no field to point at stay generic.
    let err = decode_params::<PingArgs>(Some(&json!("not an object"))).unwrap_err();
    assert_eq!(err.code(), "io.varlink.session.UnmarshalError");
}

#[test]
fn test_error_kind_from_reply() {
    let reply = Reply::from(&VarlinkError::method_not_found("org.example.ping.Nope"));
    assert_eq!(
        ErrorKind::from_reply(&reply),
        ErrorKind::MethodNotFound("org.example.ping.Nope".to_string())
    );

    let reply = Reply::new()
        .with_error("org.example.custom.Failure")
        .with_parameters(json!({"detail": 1}));
    match ErrorKind::from_reply(&reply) {
        ErrorKind::VarlinkErrorReply(err) => {
            assert_eq!(err.code(), "org.example.custom.Failure");
            assert_eq!(err.parameters().unwrap()["detail"], 1);
        }
        other => panic!("expected VarlinkErrorReply, got {:?}", other),
    }
}

#[test]
fn test_oneway_more_conflict() {
    let (client, _server) = session_pair();
    let ctx = test_ctx();
    let err = client
        .write_call(&ctx, &Call::new("a.b.C").with_oneway().with_more())
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidCall(_)));
}

#[test]
fn test_ping_echo() {
    let (client, server_side) = session_pair();

    let mut mux = ServeMux::new();
    mux.handle(
        "org.example.ping.Ping",
        |w: &ReplyWriter, call: &Call| {
            let params = call.parameters.clone().unwrap_or_else(|| json!({}));
            let _ = w.write_reply(Reply::new().with_parameters(params));
        },
    );
    let server = Server::builder().handler(mux).build();
    let serving = serve_in_background(server, server_side);

    let ctx = test_ctx();
    let transport = Transport::new();
    let mut stream = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.example.ping.Ping").with_parameters(json!({"echo": "hi"})),
        )
        .unwrap();

    assert!(stream.next());
    assert_eq!(stream.reply().parameters, json!({"echo": "hi"}));
    assert!(!stream.reply().continues);
    assert!(stream.error().is_none());
    assert!(!stream.next());

    client.close().unwrap();
    serving.join().unwrap();
}

#[test]
fn test_more_call_streams_replies() {
    let (client, server_side) = session_pair();

    let mut mux = ServeMux::new();
    mux.handle("org.example.more.Count", |w: &ReplyWriter, _call: &Call| {
        for i in 0..2 {
            w.write_reply(
                Reply::new()
                    .with_parameters(json!({ "i": i }))
                    .with_continues(),
            )
            .unwrap();
        }
        w.write_reply(Reply::new().with_parameters(json!({ "i": 2 })))
            .unwrap();
    });
    let serving = serve_in_background(Server::builder().handler(mux).build(), server_side);

    let ctx = test_ctx();
    let transport = Transport::new();
    let mut stream = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.example.more.Count").with_more(),
        )
        .unwrap();

    for i in 0..3 {
        assert!(stream.next());
        assert_eq!(stream.reply().parameters, json!({ "i": i }));
        assert_eq!(stream.reply().continues, i < 2);
        assert!(stream.error().is_none());
    }
    assert!(!stream.next());
    assert!(stream.error().is_none());

    client.close().unwrap();
    serving.join().unwrap();
}

#[test]
fn test_oneway_suppresses_replies() {
    let (client, server_side) = session_pair();

    let invoked = Arc::new(AtomicUsize::new(0));
    let mut mux = ServeMux::new();
    {
        let invoked = invoked.clone();
        mux.handle("org.example.ping.Ping", move |w: &ReplyWriter, call: &Call| {
            invoked.fetch_add(1, Ordering::SeqCst);
            let params = call.parameters.clone().unwrap_or_else(|| json!({}));
            let _ = w.write_reply(Reply::new().with_parameters(params));
        });
    }
    let serving = serve_in_background(Server::builder().handler(mux).build(), server_side);

    let ctx = test_ctx();
    let transport = Transport::new();

    let mut oneway = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.example.ping.Ping")
                .with_parameters(json!({"echo": "dropped"}))
                .with_oneway(),
        )
        .unwrap();
    assert!(!oneway.next());
    assert!(oneway.error().is_none());

    // The next reply on the wire belongs to the next non-oneway call.
    let mut stream = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.example.ping.Ping").with_parameters(json!({"echo": "kept"})),
        )
        .unwrap();
    assert!(stream.next());
    assert_eq!(stream.reply().parameters, json!({"echo": "kept"}));

    assert_eq!(invoked.load(Ordering::SeqCst), 2);

    client.close().unwrap();
    serving.join().unwrap();
}

#[test]
fn test_reply_fifo_with_interleaved_peer_call() {
    let (client, server) = session_pair();
    let ctx = test_ctx();

    let h1 = client.write_call(&ctx, &Call::new("org.example.t.A")).unwrap();
    let h2 = client.write_call(&ctx, &Call::new("org.example.t.B")).unwrap();
    let h3 = client.write_call(&ctx, &Call::new("org.example.t.C")).unwrap();

    let peer = {
        let server = server.clone();
        let ctx = ctx.clone();
        thread::spawn(move || {
            let c1 = server.read_call(&ctx).unwrap();
            assert_eq!(c1.method, "org.example.t.A");
            server
                .write_reply(&ctx, &Reply::new().with_parameters(json!({"n": 1})))
                .unwrap();

            // A server-initiated call lands between two replies.
            let _ = server
                .write_call(&ctx, &Call::new("org.example.client.Notify").with_oneway())
                .unwrap();

            let c2 = server.read_call(&ctx).unwrap();
            assert_eq!(c2.method, "org.example.t.B");
            server
                .write_reply(&ctx, &Reply::new().with_parameters(json!({"n": 2})))
                .unwrap();

            let c3 = server.read_call(&ctx).unwrap();
            assert_eq!(c3.method, "org.example.t.C");
            server
                .write_reply(&ctx, &Reply::new().with_parameters(json!({"n": 3})))
                .unwrap();
        })
    };

    assert_eq!(
        client.read_reply(&ctx, h1).unwrap().parameters,
        json!({"n": 1})
    );
    assert_eq!(
        client.read_reply(&ctx, h2).unwrap().parameters,
        json!({"n": 2})
    );
    assert_eq!(
        client.read_reply(&ctx, h3).unwrap().parameters,
        json!({"n": 3})
    );

    // The interleaved peer call was parked for read_call.
    let parked = client.read_call(&ctx).unwrap();
    assert_eq!(parked.method, "org.example.client.Notify");
    assert!(parked.oneway);

    peer.join().unwrap();
}

#[test]
fn test_out_of_order_reply_readers() {
    let (client, server) = session_pair();
    let ctx = test_ctx();

    let h1 = client.write_call(&ctx, &Call::new("org.example.t.A")).unwrap();
    let h2 = client.write_call(&ctx, &Call::new("org.example.t.B")).unwrap();

    // The reader for the second call arrives first and must wait its turn.
    let second = {
        let client = client.clone();
        let ctx = ctx.clone();
        thread::spawn(move || client.read_reply(&ctx, h2).unwrap())
    };
    thread::sleep(Duration::from_millis(20));

    for n in 1..=2 {
        let _ = server.read_call(&ctx).unwrap();
        server
            .write_reply(&ctx, &Reply::new().with_parameters(json!({ "n": n })))
            .unwrap();
    }

    assert_eq!(
        client.read_reply(&ctx, h1).unwrap().parameters,
        json!({"n": 1})
    );
    assert_eq!(second.join().unwrap().parameters, json!({"n": 2}));
}

#[test]
fn test_handler_terminal_reply_invariant() {
    let (client, server_side) = session_pair();

    let mut mux = ServeMux::new();
    mux.handle("org.example.lazy.*", |_w: &ReplyWriter, _call: &Call| {
        // returns without replying
    });
    let serving = serve_in_background(Server::builder().handler(mux).build(), server_side);

    let ctx = test_ctx();
    let transport = Transport::new();
    let mut stream = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.example.lazy.DoNothing"),
        )
        .unwrap();

    assert!(stream.next());
    match stream.error().map(|e| e.kind().clone()) {
        Some(ErrorKind::MethodNotImplemented(method)) => {
            assert_eq!(method, "org.example.lazy.DoNothing")
        }
        other => panic!("expected MethodNotImplemented, got {:?}", other),
    }

    client.close().unwrap();
    serving.join().unwrap();
}

#[test]
fn test_nil_handler_replies_method_not_found() {
    let (client, server_side) = session_pair();
    let serving = serve_in_background(Server::builder().build(), server_side);

    let ctx = test_ctx();
    let transport = Transport::new();
    let mut stream = transport
        .round_trip(&ctx, Some(client.clone()), Call::new("org.example.t.A"))
        .unwrap();

    assert!(stream.next());
    match stream.error().map(|e| e.kind().clone()) {
        Some(ErrorKind::MethodNotFound(method)) => assert_eq!(method, "org.example.t.A"),
        other => panic!("expected MethodNotFound, got {:?}", other),
    }

    client.close().unwrap();
    serving.join().unwrap();
}

#[test]
fn test_pipeline_backpressure() {
    let (client, server_side) = session_pair();

    let gate = Gate::new();
    let started = Arc::new(AtomicUsize::new(0));
    let mut mux = ServeMux::new();
    {
        let gate = gate.clone();
        let started = started.clone();
        mux.handle("org.example.slow.*", move |w: &ReplyWriter, _call: &Call| {
            started.fetch_add(1, Ordering::SeqCst);
            gate.wait();
            let _ = w.write_parameters(&json!({"done": true}));
        });
    }
    let server = Server::builder().handler(mux).max_pipeline_size(1).build();
    let serving = serve_in_background(server, server_side);

    let ctx = test_ctx();
    let transport = Transport::new();
    let mut streams = Vec::new();
    for i in 0..3 {
        streams.push(
            transport
                .round_trip(
                    &ctx,
                    Some(client.clone()),
                    Call::new(format!("org.example.slow.Call{}", i)),
                )
                .unwrap(),
        );
    }

    // With the worker parked in the first call and the pipeline holding
    // one more, nothing else reaches the handler.
    wait_until(|| started.load(Ordering::SeqCst) == 1);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(started.load(Ordering::SeqCst), 1);

    gate.open();
    for stream in &mut streams {
        assert!(stream.next());
        assert_eq!(stream.reply().parameters, json!({"done": true}));
    }
    assert_eq!(started.load(Ordering::SeqCst), 3);

    client.close().unwrap();
    serving.join().unwrap();
}

#[test]
fn test_pipeline_overflow_error() {
    let (client, server_side) = session_pair();

    let gate = Gate::new();
    let started = Arc::new(AtomicUsize::new(0));
    let mut mux = ServeMux::new();
    {
        let gate = gate.clone();
        let started = started.clone();
        mux.handle("org.example.slow.*", move |w: &ReplyWriter, _call: &Call| {
            started.fetch_add(1, Ordering::SeqCst);
            gate.wait();
            let _ = w.write_parameters(&json!({"done": true}));
        });
    }
    let server = Server::builder()
        .handler(mux)
        .max_pipeline_size(1)
        .pipeline_overflow_error(|call| {
            VarlinkError::new(
                "org.example.test.TooBusy",
                Some(json!({ "method": call.method })),
            )
        })
        .build();
    let serving = serve_in_background(server, server_side);

    let ctx = test_ctx();
    let transport = Transport::new();

    // The worker parks inside the first call; one more fills the
    // pipeline. Neither expects a reply.
    let mut first = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.example.slow.A").with_oneway(),
        )
        .unwrap();
    wait_until(|| started.load(Ordering::SeqCst) == 1);
    let mut second = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.example.slow.B").with_oneway(),
        )
        .unwrap();

    // The next call overflows and is answered without reaching the
    // handler.
    let mut third = transport
        .round_trip(&ctx, Some(client.clone()), Call::new("org.example.slow.C"))
        .unwrap();
    assert!(third.next());
    match third.error().map(|e| e.kind().clone()) {
        Some(ErrorKind::VarlinkErrorReply(err)) => {
            assert_eq!(err.code(), "org.example.test.TooBusy");
            assert_eq!(err.parameters().unwrap()["method"], "org.example.slow.C");
        }
        other => panic!("expected overflow error, got {:?}", other),
    }
    assert_eq!(started.load(Ordering::SeqCst), 1);

    assert!(!first.next());
    assert!(!second.next());

    gate.open();
    client.close().unwrap();
    serving.join().unwrap();
}

#[test]
fn test_peer_disconnect_cancels_handler_context() {
    let (client, server_side) = session_pair();

    let started = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(Mutex::new(None));
    let mut mux = ServeMux::new();
    {
        let started = started.clone();
        let observed = observed.clone();
        mux.handle("org.example.hang.*", move |w: &ReplyWriter, _call: &Call| {
            started.fetch_add(1, Ordering::SeqCst);
            let ctx = w.context();
            for _ in 0..1000 {
                if ctx.is_done() {
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
            *observed.lock().unwrap() = ctx.cause();
        });
    }
    let serving = serve_in_background(Server::builder().handler(mux).build(), server_side);

    let ctx = test_ctx();
    let transport = Transport::new();
    let _stream = transport
        .round_trip(&ctx, Some(client.clone()), Call::new("org.example.hang.Wait"))
        .unwrap();
    wait_until(|| started.load(Ordering::SeqCst) == 1);

    client.close().unwrap();
    serving.join().unwrap();

    assert_eq!(*observed.lock().unwrap(), Some(Cause::PeerDisconnected));
}

#[test]
fn test_fd_passing() {
    let (client, server_side) = session_pair();

    let mut mux = ServeMux::new();
    mux.handle("org.example.fdpass.Open", |w: &ReplyWriter, _call: &Call| {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        // The kernel duplicates the descriptor while the reply is
        // written, so dropping the file afterwards is fine.
        let _ = w.write_reply(Reply::new().with_fd(file.as_raw_fd()));
    });
    let serving = serve_in_background(Server::builder().handler(mux).build(), server_side);

    let ctx = test_ctx();
    let transport = Transport::new();
    let mut stream = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.example.fdpass.Open").with_parameters(json!({"path": "/x"})),
        )
        .unwrap();

    assert!(stream.next());
    assert!(stream.error().is_none());
    let fds = &stream.reply().file_descriptors;
    assert_eq!(fds.len(), 1);

    // Received descriptors carry CLOEXEC.
    let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFD) };
    assert!(flags >= 0 && flags & libc::FD_CLOEXEC != 0);

    let mut file = unsafe { std::fs::File::from_raw_fd(fds[0]) };
    let mut contents = String::new();
    file.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "hello");

    client.close().unwrap();
    serving.join().unwrap();
}

#[test]
fn test_unclaimed_fds_closed_with_connection() {
    use std::os::unix::fs::MetadataExt;

    // Counts how many of this process' descriptors reference the file.
    fn fds_referencing(meta: &std::fs::Metadata) -> usize {
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter(|entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(_) => return false,
                };
                match std::fs::metadata(entry.path()) {
                    Ok(m) => m.dev() == meta.dev() && m.ino() == meta.ino(),
                    Err(_) => false,
                }
            })
            .count()
    }

    let (a, b) = UnixStream::pair().unwrap();
    let a = UnixConn::new(a);
    let b = UnixConn::new(b);

    let file = tempfile::tempfile().unwrap();
    let meta = file.metadata().unwrap();
    assert_eq!(fds_referencing(&meta), 1);

    a.pass_fds(&[file.as_raw_fd()]);
    a.send(b"x\0").unwrap();

    let mut buf = [0u8; 16];
    b.recv(&mut buf).unwrap();
    // The received duplicate now sits unclaimed in the receive queue.
    assert_eq!(fds_referencing(&meta), 2);

    drop(b);
    // Closing the connection closed the unclaimed duplicate.
    assert_eq!(fds_referencing(&meta), 1);
}

#[test]
fn test_read_reply_cancellation() {
    let (client, _server) = session_pair();
    let ctx = test_ctx();

    let handle = client
        .write_call(&ctx, &Call::new("org.example.t.Never"))
        .unwrap();

    let short = Context::background().with_timeout(Duration::from_millis(50));
    let err = client.read_reply(&short, handle).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Cancelled);

    // The session survives the cancelled read.
    assert!(client.close().is_ok());
}

#[test]
fn test_server_calls_back_over_same_session() {
    let (client_side, server_side) = session_pair();

    // The client serves calls arriving on its end of the session.
    let mut client_mux = ServeMux::new();
    client_mux.handle(
        "org.example.client.GetToken",
        |w: &ReplyWriter, _call: &Call| {
            let _ = w.write_parameters(&json!({"token": "t0k"}));
        },
    );
    let client_serving =
        serve_in_background(Server::builder().handler(client_mux).build(), client_side.clone());

    // The server handler calls back before answering.
    let mut mux = ServeMux::new();
    mux.handle("org.example.svc.Login", |w: &ReplyWriter, _call: &Call| {
        let mut callback = w.call(Call::new("org.example.client.GetToken")).unwrap();
        assert!(callback.next());
        let token = callback.reply().parameters["token"].clone();
        let _ = w.write_parameters(&json!({ "got": token }));
    });
    let serving = serve_in_background(Server::builder().handler(mux).build(), server_side);

    let ctx = test_ctx();
    let transport = Transport::new();
    let mut stream = transport
        .round_trip(
            &ctx,
            Some(client_side.clone()),
            Call::new("org.example.svc.Login"),
        )
        .unwrap();

    assert!(stream.next());
    assert_eq!(stream.reply().parameters, json!({"got": "t0k"}));

    client_side.close().unwrap();
    serving.join().unwrap();
    client_serving.join().unwrap();
}

#[test]
fn test_hijack_returns_buffered_bytes() {
    let (mut raw, b) = UnixStream::pair().unwrap();
    let session = Arc::new(Session::new(Stream::Unix(UnixConn::new(b))).unwrap());
    let ctx = test_ctx();

    raw.write_all(b"{\"method\":\"org.example.up.Go\",\"upgrade\":true}\0raw-payload")
        .unwrap();

    let call = session.read_call(&ctx).unwrap();
    assert_eq!(call.method, "org.example.up.Go");
    assert!(call.upgrade);

    let (conn, buffered) = session.hijack().unwrap();
    assert_eq!(buffered, b"raw-payload");

    // The session is unusable after the hijack.
    let err = session.read_call(&ctx).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::ConnectionClosed);

    drop(conn);
}

#[test]
fn test_introspection() {
    let (client, server_side) = session_pair();

    let description =
        "interface org.example.ping\nmethod Ping(ping: string) -> (pong: string)\n";
    let mut mux = ServeMux::new();
    mux.set_description("org.example.ping", description);
    mux.set_info("Example Vendor", "", "", "");
    let serving = serve_in_background(Server::builder().handler(mux).build(), server_side);

    let ctx = test_ctx();
    let transport = Transport::new();

    let mut stream = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.varlink.service.GetInfo"),
        )
        .unwrap();
    assert!(stream.next());
    let info: ServiceInfo = stream.unmarshal().unwrap();
    assert_eq!(info.vendor, "Example Vendor");
    assert!(!info.product.is_empty());
    assert_eq!(
        info.interfaces,
        vec!["org.example.ping".to_string(), "org.varlink.service".to_string()]
    );

    let mut stream = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.varlink.service.GetInterfaceDescription")
                .with_parameters(json!({"interface": "org.example.ping"})),
        )
        .unwrap();
    assert!(stream.next());
    assert!(stream.error().is_none());
    assert_eq!(stream.reply().parameters["description"], description);

    let mut stream = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.varlink.service.GetInterfaceDescription")
                .with_parameters(json!({"interface": "org.missing"})),
        )
        .unwrap();
    assert!(stream.next());
    match stream.error().map(|e| e.kind().clone()) {
        Some(ErrorKind::InterfaceNotFound(interface)) => assert_eq!(interface, "org.missing"),
        other => panic!("expected InterfaceNotFound, got {:?}", other),
    }

    let mut stream = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.example.ping.Nope"),
        )
        .unwrap();
    assert!(stream.next());
    match stream.error().map(|e| e.kind().clone()) {
        Some(ErrorKind::MethodNotFound(method)) => assert_eq!(method, "org.example.ping.Nope"),
        other => panic!("expected MethodNotFound, got {:?}", other),
    }

    client.close().unwrap();
    serving.join().unwrap();
}

#[test]
fn test_mux_pattern_order() {
    let (client, server_side) = session_pair();

    let mut mux = ServeMux::new();
    mux.handle("org.example.glob.Special", |w: &ReplyWriter, _call: &Call| {
        let _ = w.write_parameters(&json!({"handler": "special"}));
    });
    mux.handle("org.example.glob.*", |w: &ReplyWriter, _call: &Call| {
        let _ = w.write_parameters(&json!({"handler": "wildcard"}));
    });
    let serving = serve_in_background(Server::builder().handler(mux).build(), server_side);

    let ctx = test_ctx();
    let transport = Transport::new();

    // Patterns resolve in sorted order, and "*" sorts before "S".
    let mut stream = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.example.glob.Special"),
        )
        .unwrap();
    assert!(stream.next());
    assert_eq!(stream.reply().parameters, json!({"handler": "wildcard"}));

    let mut stream = transport
        .round_trip(
            &ctx,
            Some(client.clone()),
            Call::new("org.example.glob.Anything"),
        )
        .unwrap();
    assert!(stream.next());
    assert_eq!(stream.reply().parameters, json!({"handler": "wildcard"}));

    client.close().unwrap();
    serving.join().unwrap();
}

#[test]
fn test_endpoint_defaulting_rejects_malformed_method() {
    let transport = Transport::new();
    let ctx = test_ctx();
    let err = transport
        .round_trip(&ctx, None, Call::new("nodots"))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::MalformedMethodName(_)));
}

#[test]
fn test_endpoint_defaulting_dials_abstract_socket() {
    // The interface name doubles as the abstract socket name.
    let interface = format!("org.example.default-{}", std::process::id());
    let method = format!("{}.Ping", interface);

    let mut mux = ServeMux::new();
    mux.handle("*.Ping", |w: &ReplyWriter, _call: &Call| {
        let _ = w.write_parameters(&json!({"pong": true}));
    });
    let server = Server::builder().handler(mux).build();
    let listener = Listener::bind(&Uri::parse(&format!("unix:@{}", interface)).unwrap()).unwrap();
    let _accepting = thread::spawn(move || {
        let _ = server.serve(listener);
    });

    let ctx = test_ctx();
    let client = Client::new(Transport::new());
    let mut stream = client.call(&ctx, Call::new(method)).unwrap();
    assert!(stream.next());
    assert_eq!(stream.reply().parameters, json!({"pong": true}));

    client.transport().close_idle_sessions();
}

#[test]
#[should_panic(expected = "invalid method pattern")]
fn test_invalid_mux_pattern_panics() {
    let mut mux = ServeMux::new();
    mux.handle("org.example.[", |_w: &ReplyWriter, _call: &Call| {});
}

#[test]
fn test_transport_pool_reuses_sessions_over_listener() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("org.example.pool");
    let uri = format!("unix:{}", path.display());

    let mut mux = ServeMux::new();
    mux.handle("org.example.pool.Ping", |w: &ReplyWriter, _call: &Call| {
        let _ = w.write_parameters(&json!({"pong": true}));
    });
    let server = Server::builder().handler(mux).build();
    let listener = Listener::bind(&Uri::parse(&uri).unwrap()).unwrap();
    let accepting = thread::spawn(move || {
        let _ = server.serve(listener);
    });

    let ctx = test_ctx();
    let transport = Transport::new();

    for _ in 0..3 {
        let mut stream = transport
            .round_trip(
                &ctx,
                None,
                Call::new("org.example.pool.Ping").with_uri(Uri::parse(&uri).unwrap()),
            )
            .unwrap();
        assert!(stream.next());
        assert_eq!(stream.reply().parameters, json!({"pong": true}));
        assert!(!stream.next());
    }

    transport.close_idle_sessions();
    drop(accepting);
}
