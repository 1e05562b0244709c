//! Cancellation contexts and cancellation-aware coordination primitives.
//!
//! Every blocking operation in this crate takes a [`Context`]. Cancelling a
//! context (or letting its deadline expire) wakes condition-variable waits
//! through registered wakers and socket waits through a lazily-created wake
//! pipe that is polled alongside the socket.

use std::collections::VecDeque;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::{context, map_context};

use crate::error::*;

/// Why a context became done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// Explicit cancellation or deadline expiry.
    Cancelled,
    /// The peer closed its end of the connection.
    PeerDisconnected,
}

impl Cause {
    fn error_kind(self) -> ErrorKind {
        match self {
            Cause::Cancelled => ErrorKind::Cancelled,
            Cause::PeerDisconnected => ErrorKind::PeerDisconnected,
        }
    }
}

pub(crate) trait Wake: Send + Sync {
    fn wake(&self);
}

struct WakePipe {
    rd: RawFd,
    wr: RawFd,
}

impl WakePipe {
    fn new() -> WakePipe {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc < 0 {
            panic!(
                "pipe2 for context wakeups failed: {}",
                std::io::Error::last_os_error()
            );
        }
        WakePipe {
            rd: fds[0],
            wr: fds[1],
        }
    }

    fn notify(&self) {
        let b = [1u8];
        // EAGAIN means the pipe already holds a wakeup byte.
        unsafe {
            let _ = libc::write(self.wr, b.as_ptr() as *const libc::c_void, 1);
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.rd);
            let _ = libc::close(self.wr);
        }
    }
}

struct ContextShared {
    done: AtomicBool,
    cause: Mutex<Option<Cause>>,
    deadline: Option<Instant>,
    wakers: Mutex<Vec<Weak<dyn Wake>>>,
    children: Mutex<Vec<Weak<ContextShared>>>,
    pipe: OnceLock<WakePipe>,
}

impl ContextShared {
    fn new(deadline: Option<Instant>) -> ContextShared {
        ContextShared {
            done: AtomicBool::new(false),
            cause: Mutex::new(None),
            deadline,
            wakers: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            pipe: OnceLock::new(),
        }
    }

    fn cancel(&self, cause: Cause) {
        {
            let mut c = lock(&self.cause);
            if c.is_some() {
                return;
            }
            *c = Some(cause);
        }
        self.done.store(true, Ordering::SeqCst);

        if let Some(pipe) = self.pipe.get() {
            pipe.notify();
        }
        let wakers = mem::take(&mut *lock(&self.wakers));
        for waker in wakers {
            if let Some(waker) = waker.upgrade() {
                waker.wake();
            }
        }
        let children = mem::take(&mut *lock(&self.children));
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel(cause);
            }
        }
    }

    fn is_done(&self) -> bool {
        if self.done.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.cancel(Cause::Cancelled);
                return true;
            }
        }
        false
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking handler must not wedge the session teardown path.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A cancellation token passed to every blocking operation.
///
/// Contexts form a tree: cancelling a context cancels all of its children.
/// Both explicit cancellation and deadline expiry surface as the
/// distinguished [`ErrorKind::Cancelled`] error, except when the cause is a
/// peer disconnect, which surfaces as [`ErrorKind::PeerDisconnected`].
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextShared>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Context {
        Context {
            inner: Arc::new(ContextShared::new(None)),
        }
    }

    /// Derives a cancellable child context.
    pub fn with_cancel(&self) -> Context {
        self.child(self.inner.deadline)
    }

    /// Derives a child context that cancels itself after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        let deadline = Instant::now() + timeout;
        let deadline = match self.inner.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        self.child(Some(deadline))
    }

    fn child(&self, deadline: Option<Instant>) -> Context {
        let child = Context {
            inner: Arc::new(ContextShared::new(deadline)),
        };
        if let Some(cause) = self.cause() {
            child.inner.cancel(cause);
        } else {
            lock(&self.inner.children).push(Arc::downgrade(&child.inner));
            // The parent may have been cancelled while we registered.
            if let Some(cause) = self.cause() {
                child.inner.cancel(cause);
            }
        }
        child
    }

    /// Cancels this context and all of its children.
    pub fn cancel(&self, cause: Cause) {
        self.inner.cancel(cause);
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// The cancellation cause, if the context is done.
    pub fn cause(&self) -> Option<Cause> {
        if !self.inner.is_done() {
            return None;
        }
        *lock(&self.inner.cause)
    }

    /// Errors out if the context is done.
    pub(crate) fn check(&self) -> Result<()> {
        match self.cause() {
            Some(cause) => Err(context!(cause.error_kind())),
            None => Ok(()),
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// File descriptor that becomes readable when the context is done.
    pub(crate) fn wake_fd(&self) -> RawFd {
        let pipe = self.inner.pipe.get_or_init(WakePipe::new);
        // A cancel that raced pipe creation may have missed the notify.
        if self.inner.done.load(Ordering::SeqCst) {
            pipe.notify();
        }
        pipe.rd
    }

    pub(crate) fn register(&self, waker: Weak<dyn Wake>) -> WakeRegistration {
        lock(&self.inner.wakers).push(waker.clone());
        WakeRegistration {
            shared: self.inner.clone(),
            waker,
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("done", &self.inner.done.load(Ordering::Relaxed))
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

pub(crate) struct WakeRegistration {
    shared: Arc<ContextShared>,
    waker: Weak<dyn Wake>,
}

impl Drop for WakeRegistration {
    fn drop(&mut self) {
        let mut wakers = lock(&self.shared.wakers);
        if let Some(i) = wakers.iter().position(|w| Weak::ptr_eq(w, &self.waker)) {
            let _ = wakers.swap_remove(i);
        }
    }
}

struct CondInner<T> {
    lock: Mutex<T>,
    cv: Condvar,
}

impl<T: Send> Wake for CondInner<T> {
    fn wake(&self) {
        // Locking before notifying closes the race between a waiter's
        // done-check and its sleep.
        let _guard = lock(&self.lock);
        self.cv.notify_all();
    }
}

/// A condition variable that owns its lock and whose waits honour a
/// [`Context`]. Signal and broadcast require the caller to hold the guard.
pub(crate) struct Cond<T> {
    inner: Arc<CondInner<T>>,
}

impl<T: Send + 'static> Cond<T> {
    pub fn new(value: T) -> Cond<T> {
        Cond {
            inner: Arc::new(CondInner {
                lock: Mutex::new(value),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        lock(&self.inner.lock)
    }

    /// Releases the guard, waits for a signal or cancellation, and
    /// reacquires the guard. Spurious wakeups are possible; callers loop on
    /// their predicate.
    pub fn wait<'a>(
        &'a self,
        ctx: &Context,
        guard: MutexGuard<'a, T>,
    ) -> Result<MutexGuard<'a, T>> {
        let waker: Weak<dyn Wake> = Arc::downgrade(&self.inner);
        let _reg = ctx.register(waker);
        // Checked while holding the guard: a cancel arriving after this
        // point blocks in wake() until the wait releases the lock.
        ctx.check()?;

        let guard = match ctx.deadline() {
            None => self
                .inner
                .cv
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner()),
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                let (guard, _) = self
                    .inner
                    .cv
                    .wait_timeout(guard, timeout)
                    .unwrap_or_else(|e| e.into_inner());
                guard
            }
        };

        ctx.check()?;
        Ok(guard)
    }

    pub fn broadcast(&self, _guard: &mut MutexGuard<'_, T>) {
        self.inner.cv.notify_all();
    }
}

struct PipelineState<T> {
    queue: VecDeque<T>,
    cap: usize,
    closed: bool,
}

/// A bounded queue between a session's reader and its handler worker.
/// Sends and receives honour cancellation; `try_send` never blocks.
pub(crate) struct Pipeline<T> {
    cond: Cond<PipelineState<T>>,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn new(cap: usize) -> Pipeline<T> {
        Pipeline {
            cond: Cond::new(PipelineState {
                queue: VecDeque::with_capacity(cap),
                cap,
                closed: false,
            }),
        }
    }

    /// Blocks while the queue is full. Errors on cancellation or close.
    pub fn send(&self, ctx: &Context, item: T) -> Result<()> {
        let mut state = self.cond.lock();
        while state.queue.len() >= state.cap && !state.closed {
            state = self.cond.wait(ctx, state)?;
        }
        if state.closed {
            return Err(context!(ErrorKind::ConnectionClosed));
        }
        state.queue.push_back(item);
        self.cond.broadcast(&mut state);
        Ok(())
    }

    /// Hands the item back if the queue is full or closed.
    pub fn try_send(&self, item: T) -> std::result::Result<(), T> {
        let mut state = self.cond.lock();
        if state.closed || state.queue.len() >= state.cap {
            return Err(item);
        }
        state.queue.push_back(item);
        self.cond.broadcast(&mut state);
        Ok(())
    }

    /// Returns `None` once the pipeline is closed and drained.
    pub fn recv(&self, ctx: &Context) -> Result<Option<T>> {
        let mut state = self.cond.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                self.cond.broadcast(&mut state);
                return Ok(Some(item));
            }
            if state.closed {
                return Ok(None);
            }
            state = self.cond.wait(ctx, state)?;
        }
    }

    pub fn close(&self) {
        let mut state = self.cond.lock();
        state.closed = true;
        self.cond.broadcast(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_context_cancel_propagates_to_children() {
        let parent = Context::background().with_cancel();
        let child = parent.with_cancel();
        assert!(!child.is_done());

        parent.cancel(Cause::PeerDisconnected);
        assert!(child.is_done());
        assert_eq!(child.cause(), Some(Cause::PeerDisconnected));
        assert_eq!(
            *child.check().unwrap_err().kind(),
            ErrorKind::PeerDisconnected
        );
    }

    #[test]
    fn test_context_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        assert!(!ctx.is_done());
        thread::sleep(Duration::from_millis(40));
        assert!(ctx.is_done());
        assert_eq!(ctx.cause(), Some(Cause::Cancelled));
    }

    #[test]
    fn test_child_of_done_context_is_done() {
        let parent = Context::background().with_cancel();
        parent.cancel(Cause::Cancelled);
        assert!(parent.with_cancel().is_done());
    }

    #[test]
    fn test_cond_wait_cancellation() {
        let cond = Arc::new(Cond::new(false));
        let ctx = Context::background().with_cancel();

        let waiter = {
            let cond = cond.clone();
            let ctx = ctx.clone();
            thread::spawn(move || -> Option<ErrorKind> {
                let mut ready = cond.lock();
                while !*ready {
                    ready = match cond.wait(&ctx, ready) {
                        Ok(g) => g,
                        Err(e) => return Some(e.kind().clone()),
                    };
                }
                None
            })
        };

        thread::sleep(Duration::from_millis(20));
        ctx.cancel(Cause::Cancelled);
        assert_eq!(waiter.join().unwrap(), Some(ErrorKind::Cancelled));
    }

    #[test]
    fn test_cond_wait_deadline() {
        let cond = Cond::new(());
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let mut guard = cond.lock();
        let err = loop {
            match cond.wait(&ctx, guard) {
                // spurious wakeup, keep waiting
                Ok(g) => guard = g,
                Err(e) => break e,
            }
        };
        assert_eq!(*err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_pipeline_bound() {
        let pipeline: Pipeline<u32> = Pipeline::new(2);
        let ctx = Context::background();

        pipeline.send(&ctx, 1).unwrap();
        pipeline.send(&ctx, 2).unwrap();
        assert_eq!(pipeline.try_send(3), Err(3));

        // A full send blocks until cancelled.
        let short = ctx.with_timeout(Duration::from_millis(20));
        assert_eq!(
            *pipeline.send(&short, 3).unwrap_err().kind(),
            ErrorKind::Cancelled
        );

        assert_eq!(pipeline.recv(&ctx).unwrap(), Some(1));
        pipeline.try_send(3).unwrap();

        pipeline.close();
        assert_eq!(pipeline.recv(&ctx).unwrap(), Some(2));
        assert_eq!(pipeline.recv(&ctx).unwrap(), Some(3));
        assert_eq!(pipeline.recv(&ctx).unwrap(), None);
        assert_eq!(pipeline.try_send(4), Err(4));
    }

    #[test]
    fn test_pipeline_send_unblocks_on_recv() {
        let pipeline: Arc<Pipeline<u32>> = Arc::new(Pipeline::new(1));
        let ctx = Context::background();
        pipeline.send(&ctx, 1).unwrap();

        let sender = {
            let pipeline = pipeline.clone();
            let ctx = ctx.clone();
            thread::spawn(move || pipeline.send(&ctx, 2).map_err(|e| e.kind().clone()))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(pipeline.recv(&ctx).unwrap(), Some(1));
        sender.join().unwrap().unwrap();
        assert_eq!(pipeline.recv(&ctx).unwrap(), Some(2));
    }
}
