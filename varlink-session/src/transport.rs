//! Client-side transport: per-URI session pooling and round trips.

use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use crate::{context, map_context};
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use tracing::debug;

use crate::error::*;
use crate::server::Server;
use crate::session::{CallHandle, Session};
use crate::sync::Context;
use crate::{Call, Reply, Uri, VarlinkError};

type SessionContextFn = dyn Fn(&Uri, &Arc<Session>) -> Context + Send + Sync;

struct PoolEntry {
    tx: SyncSender<Arc<Session>>,
    rx: Mutex<Receiver<Arc<Session>>>,
}

struct TransportInner {
    /// Dispatcher driving the reverse direction of sessions this
    /// transport opens, so servers may call back to us.
    server: RwLock<Option<Server>>,
    max_keep_alive_sessions: usize,
    session_context: Option<Box<SessionContextFn>>,
    pool: Mutex<HashMap<Uri, PoolEntry>>,
}

/// Writes calls on pooled [`Session`]s and produces [`ReplyStream`]s.
///
/// Cloning a transport is cheap and shares the session pool.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Default for Transport {
    fn default() -> Transport {
        Transport::builder().build()
    }
}

impl Transport {
    pub fn new() -> Transport {
        Transport::default()
    }

    pub fn builder() -> TransportBuilder {
        TransportBuilder {
            max_keep_alive_sessions: 1,
            session_context: None,
        }
    }

    /// Sets the server used to dispatch peer-initiated calls arriving on
    /// sessions this transport opens.
    pub fn set_server(&self, server: Server) {
        *self.inner.server.write().unwrap() = Some(server);
    }

    /// Writes `call` and returns the stream of its replies.
    ///
    /// With `session` unset, the session is taken from the pool for the
    /// call's URI (or dialed), and returned to the pool afterwards unless
    /// the call upgrades the connection. A call without a URI defaults to
    /// `unix:@<interface>`, derived from the method name.
    pub fn round_trip(
        &self,
        ctx: &Context,
        session: Option<Arc<Session>>,
        call: Call,
    ) -> Result<ReplyStream> {
        match session {
            Some(session) => self.start_stream(ctx, session, call, None),
            None => {
                let uri = self.call_uri(&call)?;
                let session = self.take_session(ctx, &uri)?;
                let pool_uri = (!call.upgrade).then(|| uri);
                self.start_stream(ctx, session, call, pool_uri)
            }
        }
    }

    fn start_stream(
        &self,
        ctx: &Context,
        session: Arc<Session>,
        call: Call,
        pool_uri: Option<Uri>,
    ) -> Result<ReplyStream> {
        match session.write_call(ctx, &call) {
            Ok(handle) => {
                let handle = (!call.oneway).then_some(handle);
                if let Some(uri) = pool_uri {
                    // The in-flight queue keeps reply association correct
                    // even when another caller picks the session up while
                    // our replies are still pending.
                    self.give_session(&uri, session.clone());
                }
                Ok(ReplyStream::new(ctx.clone(), call, handle, session))
            }
            Err(e) => {
                // A session that failed a write never reenters the pool.
                if pool_uri.is_some() {
                    let _ = session.close();
                }
                Err(e)
            }
        }
    }

    fn call_uri(&self, call: &Call) -> Result<Uri> {
        if let Some(uri) = &call.uri {
            return Ok(uri.clone());
        }
        match call.method.rfind('.') {
            None | Some(0) => Err(context!(ErrorKind::MalformedMethodName(call.method.clone()))),
            Some(i) => Ok(Uri {
                scheme: "unix".to_string(),
                address: format!("@{}", &call.method[..i]),
            }),
        }
    }

    fn take_session(&self, ctx: &Context, uri: &Uri) -> Result<Arc<Session>> {
        {
            let pool = self.inner.pool.lock().unwrap();
            if let Some(entry) = pool.get(uri) {
                if let Ok(session) = entry.rx.lock().unwrap().try_recv() {
                    return Ok(session);
                }
            }
        }

        let session = Arc::new(Session::dial(ctx, uri)?);
        debug!(uri = %uri, "new transport session");

        // Drive the reverse direction so the peer may call back through
        // this same session.
        let serve_ctx = match &self.inner.session_context {
            Some(f) => f(uri, &session),
            None => Context::background(),
        };
        let server = match &*self.inner.server.read().unwrap() {
            Some(server) => server.clone(),
            None => Server::builder().transport(self.clone()).build(),
        };
        let reverse = session.clone();
        thread::Builder::new()
            .name("varlink-reverse".to_string())
            .spawn(move || server.serve_session(&serve_ctx, reverse))
            .map_err(map_context!())?;

        Ok(session)
    }

    fn give_session(&self, uri: &Uri, session: Arc<Session>) {
        let mut pool = self.inner.pool.lock().unwrap();
        let max = self.inner.max_keep_alive_sessions.max(1);
        let entry = pool.entry(uri.clone()).or_insert_with(|| {
            let (tx, rx) = sync_channel(max);
            PoolEntry {
                tx,
                rx: Mutex::new(rx),
            }
        });
        if let Err(TrySendError::Full(session) | TrySendError::Disconnected(session)) =
            entry.tx.try_send(session)
        {
            drop(pool);
            let _ = session.close();
        }
    }

    /// Closes every idle pooled session.
    pub fn close_idle_sessions(&self) {
        let pool = self.inner.pool.lock().unwrap();
        for entry in pool.values() {
            while let Ok(session) = entry.rx.lock().unwrap().try_recv() {
                let _ = session.close();
            }
        }
    }
}

pub struct TransportBuilder {
    max_keep_alive_sessions: usize,
    session_context: Option<Box<SessionContextFn>>,
}

impl TransportBuilder {
    /// How many idle sessions to keep alive per URI. The default is 1.
    pub fn max_keep_alive_sessions(mut self, max: usize) -> TransportBuilder {
        self.max_keep_alive_sessions = max;
        self
    }

    /// Called whenever a new session is created for a URI; returns the
    /// context that scopes call handling on that session.
    pub fn session_context<F>(mut self, f: F) -> TransportBuilder
    where
        F: Fn(&Uri, &Arc<Session>) -> Context + Send + Sync + 'static,
    {
        self.session_context = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Transport {
        Transport {
            inner: Arc::new(TransportInner {
                server: RwLock::new(None),
                max_keep_alive_sessions: self.max_keep_alive_sessions,
                session_context: self.session_context,
                pool: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// The consumer side of one call's reply sequence.
///
/// [`ReplyStream::next`] advances to the next reply and returns whether
/// one was produced; a stream for a oneway call starts exhausted. After
/// `next` returns false, [`ReplyStream::error`] distinguishes normal
/// completion from failure.
pub struct ReplyStream {
    ctx: Context,
    call: Call,
    handle: Option<CallHandle>,
    session: Arc<Session>,
    cur: Reply,
    err: Option<Error>,
    more: bool,
}

impl ReplyStream {
    pub(crate) fn new(
        ctx: Context,
        call: Call,
        handle: Option<CallHandle>,
        session: Arc<Session>,
    ) -> ReplyStream {
        ReplyStream {
            ctx,
            call,
            handle,
            session,
            cur: Reply::new(),
            err: None,
            more: handle.is_some(),
        }
    }

    /// Advances the stream by one reply, and returns whether a reply was
    /// produced. Error replies still count as replies; they are lifted
    /// into [`ReplyStream::error`].
    pub fn next(&mut self) -> bool {
        if !self.more {
            return false;
        }
        let handle = match self.handle {
            Some(handle) => handle,
            None => return false,
        };
        match self.session.read_reply(&self.ctx, handle) {
            Err(e) => {
                self.err = Some(e);
                self.more = false;
                false
            }
            Ok(reply) => {
                self.err = reply
                    .error
                    .as_ref()
                    .map(|_| context!(ErrorKind::from_reply(&reply)));
                self.more = reply.continues;
                self.cur = reply;
                true
            }
        }
    }

    /// The current error in the stream: a transport failure, or an error
    /// reply lifted into a typed error.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// The current reply. Valid until the next call to `next`.
    pub fn reply(&self) -> &Reply {
        &self.cur
    }

    /// The call that initiated this stream.
    pub fn call(&self) -> &Call {
        &self.call
    }

    /// Deserializes the current reply's parameters.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> std::result::Result<T, VarlinkError> {
        self.cur.unmarshal()
    }
}

/// Issues method calls through a [`Transport`].
#[derive(Clone, Default)]
pub struct Client {
    transport: Transport,
}

impl Client {
    pub fn new(transport: Transport) -> Client {
        Client { transport }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Performs a method call using the underlying transport.
    pub fn call(&self, ctx: &Context, call: Call) -> Result<ReplyStream> {
        self.transport.round_trip(ctx, None, call)
    }

    /// Convenience wrapper serializing `params` into a call.
    pub fn call_method<T: Serialize>(
        &self,
        ctx: &Context,
        method: &str,
        params: Option<&T>,
    ) -> Result<ReplyStream> {
        let mut call = Call::new(method);
        if let Some(params) = params {
            call.parameters = Some(serde_json::to_value(params).map_err(map_context!())?);
        }
        self.call(ctx, call)
    }
}
