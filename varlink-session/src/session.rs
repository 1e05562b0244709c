//! Full-duplex varlink sessions.
//!
//! A session multiplexes a single bidirectional stream that may carry both
//! outbound calls awaiting replies and inbound calls from the peer. Replies
//! are associated to outbound calls in write order; messages of the wrong
//! flavour are parked for the matching consumer. Only one thread reads from
//! the socket at any instant; the others wait on a condition variable and
//! pick up parked messages when signalled.

use std::collections::VecDeque;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::{context, map_context};
use serde_derive::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::*;
use crate::stream::{wait_readable, wait_writable, Stream};
use crate::sync::{Cond, Context};
use crate::{empty_object, Call, Reply, Uri};

/// Identifies one outbound call on its session. Returned by
/// [`Session::write_call`] and handed back to [`Session::read_reply`] so
/// concurrent readers receive their replies in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHandle {
    id: u64,
}

struct ReadState {
    reading: bool,
    cq: VecDeque<Call>,
    rq: VecDeque<Reply>,
}

struct FlightState {
    inflight: VecDeque<u64>,
}

enum Message {
    Call(Call),
    Reply(Reply),
}

#[derive(Deserialize)]
struct WireMessage {
    method: Option<String>,
    #[serde(default)]
    oneway: bool,
    #[serde(default)]
    more: bool,
    #[serde(default)]
    upgrade: bool,
    #[serde(default)]
    continues: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    parameters: Option<Value>,
}

/// A varlink connection. The session owns the underlying stream; closing
/// the session shuts the connection down and releases any received file
/// descriptors that were never claimed.
pub struct Session {
    conn: Stream,
    write: Mutex<()>,
    read: Cond<ReadState>,
    flight: Cond<FlightState>,
    rbuf: Mutex<Vec<u8>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    hijacked: AtomicBool,
}

impl Session {
    /// Creates a session from a connection, taking ownership of it.
    pub fn new(conn: Stream) -> Result<Session> {
        conn.set_nonblocking(true).map_err(map_context!())?;
        Ok(Session {
            conn,
            write: Mutex::new(()),
            read: Cond::new(ReadState {
                reading: false,
                cq: VecDeque::new(),
                rq: VecDeque::new(),
            }),
            flight: Cond::new(FlightState {
                inflight: VecDeque::new(),
            }),
            rbuf: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            hijacked: AtomicBool::new(false),
        })
    }

    /// Opens a session for the specified URI.
    pub fn dial(ctx: &Context, uri: &Uri) -> Result<Session> {
        ctx.check()?;
        let conn = Stream::connect(uri)?;
        debug!(uri = %uri, "dialed varlink session");
        Session::new(conn)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(context!(ErrorKind::ConnectionClosed));
        }
        Ok(())
    }

    /// Writes a call to the connection. Non-oneway calls join the
    /// in-flight queue, in wire order, for reply association.
    pub fn write_call(&self, ctx: &Context, call: &Call) -> Result<CallHandle> {
        ctx.check()?;
        if call.oneway && call.more {
            return Err(context!(ErrorKind::InvalidCall(
                "oneway and more are mutually exclusive".to_string()
            )));
        }

        let payload = serde_json::to_vec(call).map_err(map_context!())?;

        let write = self.write.lock().unwrap();
        self.check_open()?;
        self.write_msg(ctx, &payload, &call.file_descriptors)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !call.oneway {
            // Enqueued before the write lock drops, so the in-flight order
            // can never diverge from the wire order.
            let mut q = self.flight.lock();
            q.inflight.push_back(id);
        }
        drop(write);

        Ok(CallHandle { id })
    }

    /// Writes a reply to the connection.
    pub fn write_reply(&self, ctx: &Context, reply: &Reply) -> Result<()> {
        ctx.check()?;
        let payload = serde_json::to_vec(reply).map_err(map_context!())?;

        let _write = self.write.lock().unwrap();
        self.check_open()?;
        self.write_msg(ctx, &payload, &reply.file_descriptors)
    }

    /// Reads the reply for `initiator`, blocking until it is at the head
    /// of the in-flight queue. Calls received in the meantime are parked
    /// for a concurrent [`Session::read_call`].
    ///
    /// # Panics
    ///
    /// Panics if no calls are in flight.
    pub fn read_reply(&self, ctx: &Context, initiator: CallHandle) -> Result<Reply> {
        self.check_open()?;
        self.wait_turn(ctx, initiator)?;

        let reply = self.read_reply_queued(ctx)?;

        if !reply.continues {
            let mut q = self.flight.lock();
            let head = q.inflight.pop_front();
            debug_assert_eq!(head, Some(initiator.id));
            self.flight.broadcast(&mut q);
        }
        Ok(reply)
    }

    fn wait_turn(&self, ctx: &Context, initiator: CallHandle) -> Result<()> {
        let mut q = self.flight.lock();
        loop {
            match q.inflight.front() {
                None => panic!(
                    "programming error: read_reply called but no rpc calls have been initiated"
                ),
                Some(head) if *head == initiator.id => return Ok(()),
                Some(_) => q = self.flight.wait(ctx, q)?,
            }
        }
    }

    fn read_reply_queued(&self, ctx: &Context) -> Result<Reply> {
        let mut rs = self.read.lock();
        while rs.reading && rs.rq.is_empty() {
            rs = self.read.wait(ctx, rs)?;
        }
        if let Some(reply) = rs.rq.pop_front() {
            return Ok(reply);
        }

        rs.reading = true;
        drop(rs);

        loop {
            let msg = self.read_call_or_reply(ctx);
            let mut rs = self.read.lock();
            self.read.broadcast(&mut rs);
            match msg {
                Err(e) => {
                    rs.reading = false;
                    return Err(e);
                }
                Ok(Message::Reply(reply)) => {
                    rs.reading = false;
                    return Ok(reply);
                }
                Ok(Message::Call(call)) => rs.cq.push_back(call),
            }
        }
    }

    /// Reads a call from the connection. Replies received in the meantime
    /// are parked for a matching [`Session::read_reply`].
    pub fn read_call(&self, ctx: &Context) -> Result<Call> {
        self.check_open()?;

        let mut rs = self.read.lock();
        while rs.reading && rs.cq.is_empty() {
            rs = self.read.wait(ctx, rs)?;
        }
        if let Some(call) = rs.cq.pop_front() {
            return Ok(call);
        }

        rs.reading = true;
        drop(rs);

        loop {
            let msg = self.read_call_or_reply(ctx);
            let mut rs = self.read.lock();
            self.read.broadcast(&mut rs);
            match msg {
                Err(e) => {
                    rs.reading = false;
                    return Err(e);
                }
                Ok(Message::Call(call)) => {
                    rs.reading = false;
                    return Ok(call);
                }
                Ok(Message::Reply(reply)) => rs.rq.push_back(reply),
            }
        }
    }

    fn read_call_or_reply(&self, ctx: &Context) -> Result<Message> {
        let (payload, fds) = self.read_msg(ctx)?;

        let msg: WireMessage = match serde_json::from_slice(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                // Descriptors that rode along with an undecodable message
                // must not leak into the process.
                for fd in fds {
                    unsafe {
                        let _ = libc::close(fd);
                    }
                }
                return Err(context!(
                    e,
                    ErrorKind::SerdeJsonDe(String::from_utf8_lossy(&payload).to_string())
                ));
            }
        };

        match msg.method {
            Some(method) => Ok(Message::Call(Call {
                uri: None,
                method,
                oneway: msg.oneway,
                more: msg.more,
                upgrade: msg.upgrade,
                parameters: msg.parameters,
                file_descriptors: fds,
            })),
            None => Ok(Message::Reply(Reply {
                parameters: msg.parameters.unwrap_or_else(empty_object),
                continues: msg.continues,
                error: msg.error,
                file_descriptors: fds,
            })),
        }
    }

    /// Reads one NUL-framed message and the descriptors received with it.
    fn read_msg(&self, ctx: &Context) -> Result<(Vec<u8>, Vec<std::os::unix::io::RawFd>)> {
        let mut rbuf = self.rbuf.lock().unwrap();
        loop {
            if let Some(pos) = rbuf.iter().position(|&b| b == 0) {
                let mut payload: Vec<u8> = rbuf.drain(..=pos).collect();
                payload.pop();
                let fds = self.conn.collect_fds();
                return Ok((payload, fds));
            }

            let mut chunk = [0u8; 8192];
            match self.conn.recv(&mut chunk) {
                Ok(0) => return Err(context!(ErrorKind::PeerDisconnected)),
                Ok(n) => rbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    wait_readable(ctx, self.conn.as_raw_fd())?;
                }
                Err(e) => return Err(e).map_err(map_context!()),
            }
        }
    }

    fn write_msg(
        &self,
        ctx: &Context,
        payload: &[u8],
        fds: &[std::os::unix::io::RawFd],
    ) -> Result<()> {
        if !fds.is_empty() {
            self.conn.pass_fds(fds)?;
        }
        self.write_all(ctx, payload)?;
        self.write_all(ctx, b"\0")
    }

    fn write_all(&self, ctx: &Context, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.conn.send(buf) {
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    wait_writable(ctx, self.conn.as_raw_fd())?;
                }
                Err(e) => return Err(e).map_err(map_context!()),
            }
        }
        Ok(())
    }

    /// Atomically stops session I/O and transfers the connection out,
    /// along with any bytes that were buffered but not yet consumed. The
    /// session is unusable afterwards.
    pub fn hijack(&self) -> Result<(Stream, Vec<u8>)> {
        let _write = self.write.lock().unwrap();
        let _rs = self.read.lock();
        self.check_open()?;
        self.hijacked.store(true, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        let buffered = mem::take(&mut *self.rbuf.lock().unwrap());
        let conn = self.conn.try_clone().map_err(map_context!())?;
        Ok((conn, buffered))
    }

    /// Terminates the session and shuts down the underlying connection.
    /// Unclaimed received file descriptors are closed.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing varlink session");
        {
            let mut q = self.flight.lock();
            self.flight.broadcast(&mut q);
        }
        {
            let mut rs = self.read.lock();
            self.read.broadcast(&mut rs);
        }
        if !self.hijacked.load(Ordering::SeqCst) {
            let _ = self.conn.shutdown();
        }
        self.conn.close_received_fds();
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
