//! Server dispatch: accept loop, per-session reader, bounded call
//! pipeline and handler invocation.

use std::sync::{Arc, Mutex};
use std::thread;

use crate::{context, map_context};
use serde::ser::Serialize;
use tracing::{debug, warn};

use crate::error::*;
use crate::session::Session;
use crate::stream::{Listener, Stream};
use crate::sync::{Cause, Context, Pipeline};
use crate::transport::{ReplyStream, Transport};
use crate::{Call, Reply, Uri, VarlinkError};

const DEFAULT_MAX_PIPELINE_SIZE: usize = 128;

/// Implemented by anything that serves varlink method calls. Closures
/// with the right shape implement it directly.
pub trait MethodHandler: Send + Sync {
    fn serve_method(&self, w: &ReplyWriter, call: &Call);
}

impl<F> MethodHandler for F
where
    F: Fn(&ReplyWriter, &Call) + Send + Sync,
{
    fn serve_method(&self, w: &ReplyWriter, call: &Call) {
        self(w, call)
    }
}

/// Handed to method handlers to reply to one call.
///
/// Every call gets exactly one terminal reply (a reply without
/// `continues`, or an error); the server synthesizes one if the handler
/// returns without writing it. For oneway calls every write is silently
/// suppressed.
pub struct ReplyWriter {
    session: Arc<Session>,
    ctx: Context,
    transport: Transport,
    oneway: bool,
    replied: Mutex<bool>,
}

impl ReplyWriter {
    /// The context scoping this call. Done on session close, peer
    /// disconnect, or server shutdown.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Serializes the reply and transmits it with any attached file
    /// descriptors.
    ///
    /// # Panics
    ///
    /// Panics if a terminal reply has already been written for this call.
    pub fn write_reply(&self, reply: Reply) -> Result<()> {
        self.ctx.check()?;
        self.write(reply)
    }

    fn write(&self, reply: Reply) -> Result<()> {
        let mut replied = self.replied.lock().unwrap();
        if *replied {
            panic!("method call has already been replied to");
        }
        if !reply.continues {
            *replied = true;
        }
        if self.oneway {
            // The caller asked for no reply, and associates the next
            // reply on the wire with its next call.
            return Ok(());
        }
        let res = self.session.write_reply(&self.ctx, &reply);
        if let Err(e) = &res {
            if matches!(e.kind(), ErrorKind::PeerDisconnected) {
                self.ctx.cancel(Cause::PeerDisconnected);
            }
        }
        res
    }

    /// Replies with the given protocol error.
    pub fn write_error(&self, err: VarlinkError) -> Result<()> {
        self.write_reply(Reply::from(&err))
    }

    /// Convenience wrapper serializing `params` into a terminal reply.
    pub fn write_parameters<T: Serialize>(&self, params: &T) -> Result<()> {
        let value = serde_json::to_value(params).map_err(map_context!())?;
        self.write_reply(Reply::new().with_parameters(value))
    }

    /// Performs a method call back to the peer that initiated this
    /// session, multiplexed over the same connection.
    pub fn call(&self, call: Call) -> Result<ReplyStream> {
        self.ctx.check()?;
        self.transport.round_trip(&self.ctx, Some(self.session.clone()), call)
    }

    pub fn has_replied(&self) -> bool {
        *self.replied.lock().unwrap()
    }
}

struct ServerInner {
    handler: Option<Box<dyn MethodHandler>>,
    transport: Transport,
    max_pipeline_size: usize,
    pipeline_overflow_error: Option<Box<dyn Fn(&Call) -> VarlinkError + Send + Sync>>,
}

/// Accepts varlink connections and dispatches their calls to the
/// configured [`MethodHandler`].
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

pub struct ServerBuilder {
    handler: Option<Box<dyn MethodHandler>>,
    transport: Option<Transport>,
    max_pipeline_size: usize,
    pipeline_overflow_error: Option<Box<dyn Fn(&Call) -> VarlinkError + Send + Sync>>,
}

impl ServerBuilder {
    /// The handler serving method calls. Without one, every call is
    /// answered with `MethodNotFound`.
    pub fn handler<H: MethodHandler + 'static>(mut self, handler: H) -> ServerBuilder {
        self.handler = Some(Box::new(handler));
        self
    }

    /// The transport driving server-to-client calls.
    pub fn transport(mut self, transport: Transport) -> ServerBuilder {
        self.transport = Some(transport);
        self
    }

    /// The maximum number of calls a session queues before the server
    /// stops actively reading from it. Going over the limit is not fatal;
    /// the socket simply stops being drained, so flow control propagates
    /// to the peer and disconnects are noticed at the next I/O operation
    /// instead of immediately. 0 means the default of 128.
    pub fn max_pipeline_size(mut self, max: usize) -> ServerBuilder {
        self.max_pipeline_size = max;
        self
    }

    /// When set, calls going over the pipeline limit are immediately
    /// answered with the returned error instead of applying backpressure.
    pub fn pipeline_overflow_error<F>(mut self, f: F) -> ServerBuilder
    where
        F: Fn(&Call) -> VarlinkError + Send + Sync + 'static,
    {
        self.pipeline_overflow_error = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                handler: self.handler,
                transport: self.transport.unwrap_or_default(),
                max_pipeline_size: match self.max_pipeline_size {
                    0 => DEFAULT_MAX_PIPELINE_SIZE,
                    n => n,
                },
                pipeline_overflow_error: self.pipeline_overflow_error,
            }),
        }
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            handler: None,
            transport: None,
            max_pipeline_size: 0,
            pipeline_overflow_error: None,
        }
    }

    /// Accepts connections in a loop, spawning a session thread per
    /// connection. Returns when the listener fails.
    pub fn serve(&self, listener: Listener) -> Result<()> {
        let ctx = Context::background().with_cancel();

        loop {
            let conn = match listener.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    ctx.cancel(Cause::Cancelled);
                    return Err(e);
                }
            };
            let session = match Session::new(conn) {
                Ok(session) => Arc::new(session),
                Err(e) => {
                    warn!(error = %e, "failed to set up accepted connection");
                    continue;
                }
            };
            debug!("accepted varlink session");

            let server = self.clone();
            let session_ctx = ctx.clone();
            let spawned = thread::Builder::new()
                .name("varlink-session".to_string())
                .spawn(move || {
                    server.serve_session(&session_ctx, session.clone());
                    let _ = session.close();
                });
            if let Err(e) = spawned {
                warn!(error = %e, "failed to spawn session thread");
            }
        }
    }

    /// Serves a single connection; the session is closed when it returns.
    pub fn serve_conn(&self, ctx: &Context, conn: Stream) -> Result<()> {
        let session = Arc::new(Session::new(conn)?);
        self.serve_session(ctx, session.clone());
        session.close()
    }

    /// Runs the per-session read loop and handler worker. Does not close
    /// the session; callers that own it do.
    pub fn serve_session(&self, ctx: &Context, session: Arc<Session>) {
        let ctx = ctx.with_cancel();
        let pipeline = Arc::new(Pipeline::new(self.inner.max_pipeline_size));

        let worker = {
            let server = self.clone();
            let ctx = ctx.clone();
            let session = session.clone();
            let pipeline = pipeline.clone();
            thread::Builder::new()
                .name("varlink-worker".to_string())
                .spawn(move || server.handle_calls(&ctx, &session, &pipeline))
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                warn!(error = %e, "failed to spawn session worker");
                return;
            }
        };

        loop {
            let call = match session.read_call(&ctx) {
                Ok(call) => call,
                Err(e) => {
                    if matches!(e.kind(), ErrorKind::PeerDisconnected) {
                        ctx.cancel(Cause::PeerDisconnected);
                    }
                    break;
                }
            };

            match &self.inner.pipeline_overflow_error {
                None => {
                    // Natural backpressure: block until the worker makes
                    // room, or the session context ends.
                    if pipeline.send(&ctx, call).is_err() {
                        break;
                    }
                }
                Some(overflow) => {
                    if let Err(call) = pipeline.try_send(call) {
                        let w = self.reply_writer(&ctx, &session, call.oneway);
                        let _ = w.write_error(overflow(&call));
                    }
                }
            }
        }

        pipeline.close();
        let _ = worker.join();
    }

    fn handle_calls(&self, ctx: &Context, session: &Arc<Session>, pipeline: &Pipeline<Call>) {
        while let Ok(Some(call)) = pipeline.recv(ctx) {
            let w = self.reply_writer(ctx, session, call.oneway);

            match &self.inner.handler {
                None => {
                    let _ = w.write_error(VarlinkError::method_not_found(&call.method));
                    continue;
                }
                Some(handler) => handler.serve_method(&w, &call),
            }

            if ctx.is_done() {
                return;
            }
            if !w.has_replied() {
                let _ = w.write_error(VarlinkError::method_not_implemented(&call.method));
            }
        }
    }

    fn reply_writer(&self, ctx: &Context, session: &Arc<Session>, oneway: bool) -> ReplyWriter {
        ReplyWriter {
            session: session.clone(),
            ctx: ctx.clone(),
            transport: self.inner.transport.clone(),
            oneway,
            replied: Mutex::new(false),
        }
    }
}

/// Binds `uri` and serves method calls with `handler` until the listener
/// fails.
pub fn listen_and_serve<H: MethodHandler + 'static>(uri: &str, handler: H) -> Result<()> {
    let uri: Uri = uri.parse()?;
    let listener = Listener::bind(&uri)?;
    Server::builder().handler(handler).build().serve(listener)
}
