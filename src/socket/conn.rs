//! Event-driven TCP connection.
//!
//! A [`Conn`] owns one TCP socket plus its resolve and connect lifecycle,
//! and reports everything that happens to it as an ordered stream of
//! [`ConnEvent`]s delivered to a single callback on its [`EventLoop`].
//!
//! ```text
//! Idle -> Resolving -> Connecting -> Connected -> Closed
//!                                        \
//!                                         Error
//! ```
//!
//! `Closed` and `Error` are terminal. [`Conn::delete`] is legal in any
//! state, including from inside the connection's own callback: every watch,
//! timer and pending lookup is torn down before `delete` returns and no
//! further event is delivered.
//!
//! ```rust,ignore
//! use netloop::base::EventLoop;
//! use netloop::socket::{Conn, ConnEvent};
//!
//! let event_loop = EventLoop::new()?;
//! let conn = Conn::new(&event_loop, "example.com", 80, |conn, event| match event {
//!     ConnEvent::Connect => {
//!         conn.write(b"GET / HTTP/1.0\r\n\r\n");
//!         conn.readline();
//!     }
//!     ConnEvent::Read(line) => println!("{:?}", line),
//!     _ => conn.delete(),
//! });
//! conn.connect();
//! event_loop.run()?;
//! ```

use super::readqueue::{ReadQueue, ReadRequest};
use super::writequeue::{Finished, ReleaseFn, WriteId, WriteQueue};
use crate::base::context::IoResultExt;
use crate::base::eventloop::EventLoop;
use crate::base::neterror::NetError;
use crate::dns::{HostResolver, Resolution, ResolveHandle, ResolveRequest, SocketAddrs};
use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Poll;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Something that happened on a [`Conn`].
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// Connection established.
    Connect,
    /// Data for a `read`, `readn` or `readline` request.
    Read(Bytes),
    /// A queued buffer was sent in full.
    Write(WriteId),
    /// Socket readable. Only with [`Conn::set_watch_readable`].
    Readable,
    /// Socket writable. Only with [`Conn::set_watch_writable`].
    Writable,
    /// Peer closed the connection.
    Close,
    /// The timer fired with an operation outstanding. The connection has
    /// been closed.
    Timeout,
    Error(NetError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Resolving,
    Connecting,
    Connected,
    Closed,
    Error,
}

impl ConnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Error)
    }
}

type ConnCallback = Box<dyn FnMut(&Conn, ConnEvent)>;

/// Handle to an event-driven connection.
///
/// Clones share the connection. The socket is closed when the last handle
/// is dropped or [`Conn::delete`] is called, whichever comes first.
#[derive(Clone)]
pub struct Conn {
    shared: Rc<ConnShared>,
}

struct ConnShared {
    id: u64,
    event_loop: EventLoop,
    resolver: RefCell<HostResolver>,
    inner: RefCell<ConnInner>,
    callback: RefCell<Option<ConnCallback>>,
    callback_epoch: Cell<u64>,
    deleted: Cell<bool>,
}

struct ConnInner {
    host: String,
    port: u16,
    addr: Option<SocketAddr>,
    state: ConnState,
    stream: Option<TcpStream>,
    reads: ReadQueue,
    writes: WriteQueue,
    read_eof: bool,
    watch_readable: bool,
    watch_writable: bool,
    resolve: Option<ResolveHandle>,
    connect_task: Option<JoinHandle<()>>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
    timer_task: Option<JoinHandle<()>>,
}

impl ConnInner {
    fn new(host: String, port: u16, addr: Option<SocketAddr>) -> Self {
        Self {
            host,
            port,
            addr,
            state: ConnState::Idle,
            stream: None,
            reads: ReadQueue::new(),
            writes: WriteQueue::new(),
            read_eof: false,
            watch_readable: false,
            watch_writable: false,
            resolve: None,
            connect_task: None,
            read_task: None,
            write_task: None,
            timer_task: None,
        }
    }

    fn wants_read(&self) -> bool {
        self.watch_readable || self.reads.wants_data()
    }

    fn wants_write(&self) -> bool {
        self.watch_writable || !self.writes.is_empty()
    }

    /// Whether a timeout firing now should close the connection.
    fn has_outstanding(&self) -> bool {
        matches!(self.state, ConnState::Resolving | ConnState::Connecting)
            || self.wants_read()
            || self.wants_write()
    }
}

fn is_running(task: &Option<JoinHandle<()>>) -> bool {
    task.as_ref().is_some_and(|t| !t.is_finished())
}

impl Conn {
    /// Connection to `host:port`. A numeric `host` skips resolution.
    ///
    /// Nothing happens until [`Conn::connect`].
    pub fn new<F>(event_loop: &EventLoop, host: &str, port: u16, callback: F) -> Self
    where
        F: FnMut(&Conn, ConnEvent) + 'static,
    {
        let addr = SocketAddrs::try_parse(host, port).and_then(|mut addrs| addrs.next());
        Self::build(event_loop, ConnInner::new(host.to_string(), port, addr), callback)
    }

    /// Connection to a known address.
    pub fn from_addr<F>(event_loop: &EventLoop, addr: SocketAddr, callback: F) -> Self
    where
        F: FnMut(&Conn, ConnEvent) + 'static,
    {
        let inner = ConnInner::new(addr.ip().to_string(), addr.port(), Some(addr));
        Self::build(event_loop, inner, callback)
    }

    /// Adopt an already connected socket. No `Connect` event is emitted.
    pub fn from_std<F>(
        event_loop: &EventLoop,
        stream: std::net::TcpStream,
        callback: F,
    ) -> Result<Self, NetError>
    where
        F: FnMut(&Conn, ConnEvent) + 'static,
    {
        stream.set_nonblocking(true).socket_context()?;
        let peer = stream.peer_addr().socket_context()?;
        let stream = {
            let _guard = event_loop.enter();
            TcpStream::from_std(stream).socket_context()?
        };

        let mut inner = ConnInner::new(peer.ip().to_string(), peer.port(), Some(peer));
        inner.stream = Some(stream);
        inner.state = ConnState::Connected;
        Ok(Self::build(event_loop, inner, callback))
    }

    fn build<F>(event_loop: &EventLoop, inner: ConnInner, callback: F) -> Self
    where
        F: FnMut(&Conn, ConnEvent) + 'static,
    {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn = id, host = %inner.host, port = inner.port, "conn created");
        Self {
            shared: Rc::new(ConnShared {
                id,
                event_loop: event_loop.clone(),
                resolver: RefCell::new(HostResolver::default()),
                inner: RefCell::new(inner),
                callback: RefCell::new(Some(Box::new(callback))),
                callback_epoch: Cell::new(0),
                deleted: Cell::new(false),
            }),
        }
    }

    /// Use `resolver` for hostname lookups instead of the system resolver.
    pub fn with_resolver(self, resolver: HostResolver) -> Self {
        *self.shared.resolver.borrow_mut() = resolver;
        self
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ConnState {
        self.shared.inner.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn host(&self) -> String {
        self.shared.inner.borrow().host.clone()
    }

    pub fn port(&self) -> u16 {
        self.shared.inner.borrow().port
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let inner = self.shared.inner.borrow();
        inner.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.shared.inner.borrow();
        inner.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Replace the event callback. Takes effect for the next event, even
    /// when called from inside the current callback.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(&Conn, ConnEvent) + 'static,
    {
        if !self.check_alive("set_callback") {
            return;
        }
        let old = self.shared.callback.borrow_mut().replace(Box::new(callback));
        self.shared
            .callback_epoch
            .set(self.shared.callback_epoch.get() + 1);
        drop(old);
    }

    /// Start connecting. Emits `Connect` or `Error`.
    ///
    /// A resolution failure emits `Error` and returns the connection to
    /// `Idle`; a connect failure leaves it in `Error`.
    pub fn connect(&self) {
        if !self.check_alive("connect") {
            return;
        }
        let (host, port, addr) = {
            let inner = self.shared.inner.borrow();
            if inner.state != ConnState::Idle {
                tracing::warn!(conn = self.shared.id, state = ?inner.state, "connect outside Idle ignored");
                return;
            }
            (inner.host.clone(), inner.port, inner.addr)
        };

        if let Some(addr) = addr {
            start_connect(&self.shared, vec![addr]);
            return;
        }

        self.shared.inner.borrow_mut().state = ConnState::Resolving;
        tracing::debug!(conn = self.shared.id, host = %host, port, "resolving");

        let weak = Rc::downgrade(&self.shared);
        let resolver = self.shared.resolver.borrow().clone();
        let handle = resolver.resolve(
            ResolveRequest::forward_all(host, port),
            &self.shared.event_loop,
            move |result| {
                if let Some(shared) = weak.upgrade() {
                    on_resolved(&shared, result);
                }
            },
        );
        self.shared.inner.borrow_mut().resolve = Some(handle);
    }

    /// Close the socket and drop everything queued. No event is emitted.
    pub fn disconnect(&self) {
        tracing::debug!(conn = self.shared.id, "disconnect");
        self.shared.teardown(ConnState::Closed);
    }

    /// Tear the connection down for good. Safe from inside the callback;
    /// no further events are delivered.
    pub fn delete(&self) {
        if self.shared.deleted.replace(true) {
            return;
        }
        tracing::debug!(conn = self.shared.id, "delete");
        self.shared.teardown(ConnState::Closed);
        let callback = self.shared.callback.borrow_mut().take();
        drop(callback);
    }

    /// Deliver incoming data as it arrives, chunk by chunk, until `Close`.
    pub fn read(&self) {
        self.queue_read(None);
    }

    /// Deliver exactly `n` bytes once.
    pub fn readn(&self, n: usize) {
        if n == 0 {
            debug_assert!(false, "readn(0)");
            tracing::warn!(conn = self.shared.id, "readn of zero bytes ignored");
            return;
        }
        self.queue_read(Some(ReadRequest::Exact(n)));
    }

    /// Deliver one line, without its terminator, once.
    pub fn readline(&self) {
        self.queue_read(Some(ReadRequest::Line));
    }

    fn queue_read(&self, request: Option<ReadRequest>) {
        if !self.check_alive("read") || !self.check_open("read") {
            return;
        }
        {
            let mut inner = self.shared.inner.borrow_mut();
            match request {
                Some(request) => inner.reads.push(request),
                None => inner.reads.set_streaming(true),
            }
        }
        arm(&self.shared);
    }

    /// Queue a copy of `data`.
    pub fn write(&self, data: &[u8]) -> WriteId {
        self.queue_write(Bytes::copy_from_slice(data), None)
    }

    /// Queue `data` without copying.
    pub fn write_bytes(&self, data: Bytes) -> WriteId {
        self.queue_write(data, None)
    }

    /// Queue `data`; `release` gets it back once fully sent or discarded.
    pub fn write_direct<R>(&self, data: Bytes, release: R) -> WriteId
    where
        R: FnOnce(Bytes) + 'static,
    {
        self.queue_write(data, Some(Box::new(release)))
    }

    fn queue_write(&self, data: Bytes, release: Option<ReleaseFn>) -> WriteId {
        let (id, discarded) = {
            let mut inner = self.shared.inner.borrow_mut();
            let id = inner.writes.push(data, release);
            let dead = self.shared.deleted.get() || inner.state.is_terminal();
            (id, if dead { inner.writes.drain() } else { Vec::new() })
        };
        if !discarded.is_empty() {
            self.check_alive("write");
            tracing::debug!(conn = self.shared.id, "write on closed connection discarded");
            discarded.into_iter().for_each(Finished::release);
            return id;
        }
        arm(&self.shared);
        id
    }

    /// Emit `Readable` whenever the socket has data instead of reading it.
    pub fn set_watch_readable(&self, on: bool) {
        if !self.check_alive("set_watch_readable") {
            return;
        }
        self.shared.inner.borrow_mut().watch_readable = on;
        arm(&self.shared);
    }

    /// Emit `Writable` whenever the socket accepts data instead of sending
    /// the write queue.
    pub fn set_watch_writable(&self, on: bool) {
        if !self.check_alive("set_watch_writable") {
            return;
        }
        self.shared.inner.borrow_mut().watch_writable = on;
        arm(&self.shared);
    }

    /// Read straight from the socket. For use with `Readable`.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let inner = self.shared.inner.borrow();
        match inner.stream.as_ref() {
            Some(stream) => stream.try_read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Write straight to the socket. For use with `Writable`.
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        let inner = self.shared.inner.borrow();
        match inner.stream.as_ref() {
            Some(stream) => stream.try_write(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Arm a one-shot timer, replacing any previous one. `0` disables.
    ///
    /// Firing while a resolve, connect, read or write is outstanding
    /// closes the connection and emits `Timeout`.
    pub fn timeout(&self, ms: u64) {
        if !self.check_alive("timeout") {
            return;
        }
        let mut inner = self.shared.inner.borrow_mut();
        if let Some(timer) = inner.timer_task.take() {
            timer.abort();
        }
        if ms == 0 || inner.state.is_terminal() {
            return;
        }
        let weak = Rc::downgrade(&self.shared);
        inner.timer_task = Some(self.shared.event_loop.spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if let Some(shared) = weak.upgrade() {
                on_timer(&shared);
            }
        }));
    }

    fn check_alive(&self, op: &str) -> bool {
        if self.shared.deleted.get() {
            debug_assert!(false, "{op} on deleted conn {}", self.shared.id);
            tracing::warn!(conn = self.shared.id, op, "operation on deleted conn");
            return false;
        }
        true
    }

    fn check_open(&self, op: &str) -> bool {
        let state = self.state();
        if state.is_terminal() {
            tracing::debug!(conn = self.shared.id, op, ?state, "operation on closed conn ignored");
            return false;
        }
        true
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.borrow();
        f.debug_struct("Conn")
            .field("id", &self.shared.id)
            .field("host", &inner.host)
            .field("port", &inner.port)
            .field("state", &inner.state)
            .field("writes", &inner.writes)
            .finish_non_exhaustive()
    }
}

impl ConnShared {
    /// Hand `event` to the callback. The callback is taken out of its slot
    /// for the call so it may replace itself or delete the connection.
    fn emit(self: &Rc<Self>, event: ConnEvent) {
        if self.deleted.get() {
            return;
        }
        let Some(mut callback) = self.callback.borrow_mut().take() else {
            tracing::trace!(conn = self.id, ?event, "no callback, event dropped");
            return;
        };
        let epoch = self.callback_epoch.get();
        tracing::trace!(conn = self.id, ?event, "emit");

        let handle = Conn {
            shared: self.clone(),
        };
        callback(&handle, event);
        drop(handle);

        if !self.deleted.get() && self.callback_epoch.get() == epoch {
            *self.callback.borrow_mut() = Some(callback);
        }
    }

    /// Synchronously stop every task, cancel the lookup, close the socket
    /// and discard queued I/O.
    fn teardown(&self, final_state: ConnState) {
        let (resolve, stream, discarded) = {
            let mut inner = self.inner.borrow_mut();
            let tasks = [
                inner.connect_task.take(),
                inner.read_task.take(),
                inner.write_task.take(),
                inner.timer_task.take(),
            ];
            for task in tasks.into_iter().flatten() {
                task.abort();
            }
            inner.reads.clear();
            inner.read_eof = false;
            inner.watch_readable = false;
            inner.watch_writable = false;
            inner.state = final_state;
            (inner.resolve.take(), inner.stream.take(), inner.writes.drain())
        };

        if let Some(resolve) = resolve {
            resolve.cancel();
        }
        drop(stream);
        for finished in discarded {
            finished.release();
        }
    }

    fn fail(self: &Rc<Self>, error: NetError) {
        tracing::debug!(conn = self.id, error = %error, "conn error");
        self.teardown(ConnState::Error);
        self.emit(ConnEvent::Error(error));
    }
}

impl Drop for ConnShared {
    fn drop(&mut self) {
        self.teardown(ConnState::Closed);
    }
}

fn on_resolved(shared: &Rc<ConnShared>, result: Result<Resolution, NetError>) {
    {
        let mut inner = shared.inner.borrow_mut();
        inner.resolve = None;
        if inner.state != ConnState::Resolving {
            return;
        }
    }
    match result {
        Ok(resolution) => start_connect(shared, resolution.addrs().to_vec()),
        Err(error) => {
            tracing::debug!(conn = shared.id, error = %error, "resolution failed");
            shared.inner.borrow_mut().state = ConnState::Idle;
            shared.emit(ConnEvent::Error(error));
        }
    }
}

fn start_connect(shared: &Rc<ConnShared>, addrs: Vec<SocketAddr>) {
    let weak = Rc::downgrade(shared);
    let mut inner = shared.inner.borrow_mut();
    inner.state = ConnState::Connecting;
    let host = inner.host.clone();
    let port = inner.port;
    tracing::debug!(conn = shared.id, host = %host, count = addrs.len(), "connecting");

    inner.connect_task = Some(shared.event_loop.spawn_local(async move {
        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no address to connect to");
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "connect attempt failed");
                    last_error = e;
                }
            }
        }

        let Some(shared) = weak.upgrade() else {
            return;
        };
        match connected {
            Some(stream) => {
                {
                    let mut inner = shared.inner.borrow_mut();
                    inner.addr = stream.peer_addr().ok();
                    inner.stream = Some(stream);
                    inner.state = ConnState::Connected;
                }
                tracing::debug!(conn = shared.id, "connected");
                shared.emit(ConnEvent::Connect);
                arm(&shared);
            }
            None => {
                let result: Result<(), io::Error> = Err(last_error);
                if let Err(error) = result.connection_context(&host, port) {
                    shared.fail(error);
                }
            }
        }
    }));
}

/// Start the read and write tasks that are wanted and not yet running.
fn arm(shared: &Rc<ConnShared>) {
    let mut inner = shared.inner.borrow_mut();
    if inner.state != ConnState::Connected {
        return;
    }
    if inner.wants_read() && !is_running(&inner.read_task) {
        let weak = Rc::downgrade(shared);
        inner.read_task = Some(shared.event_loop.spawn_local(read_loop(weak)));
    }
    if inner.wants_write() && !is_running(&inner.write_task) {
        let weak = Rc::downgrade(shared);
        inner.write_task = Some(shared.event_loop.spawn_local(write_loop(weak)));
    }
}

enum ReadOutcome {
    Readable,
    Data,
    Eof,
    WouldBlock,
    Failed(io::Error),
}

async fn read_loop(weak: Weak<ConnShared>) {
    loop {
        {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if !process_reads(&shared) {
                return;
            }
        }

        let ready = poll_fn(|cx| {
            let Some(shared) = weak.upgrade() else {
                return Poll::Ready(None);
            };
            let inner = shared.inner.borrow();
            match inner.stream.as_ref() {
                Some(stream) => stream.poll_read_ready(cx).map(Some),
                None => Poll::Ready(None),
            }
        })
        .await;

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let outcome = match ready {
            None => return,
            Some(Err(e)) => ReadOutcome::Failed(e),
            Some(Ok(())) => {
                let mut inner = shared.inner.borrow_mut();
                let ConnInner {
                    stream,
                    reads,
                    watch_readable,
                    read_eof,
                    ..
                } = &mut *inner;
                match stream.as_ref() {
                    None => return,
                    Some(_) if *watch_readable => ReadOutcome::Readable,
                    Some(stream) => {
                        reads.prepare_read();
                        match stream.try_read_buf(reads.buffer_mut()) {
                            Ok(0) => {
                                *read_eof = true;
                                ReadOutcome::Eof
                            }
                            Ok(n) => {
                                tracing::trace!(conn = shared.id, bytes = n, "read");
                                ReadOutcome::Data
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                ReadOutcome::WouldBlock
                            }
                            Err(e) => ReadOutcome::Failed(e),
                        }
                    }
                }
            }
        };

        match outcome {
            ReadOutcome::Readable => shared.emit(ConnEvent::Readable),
            ReadOutcome::Eof => tracing::debug!(conn = shared.id, "end of stream"),
            ReadOutcome::Data | ReadOutcome::WouldBlock => {}
            ReadOutcome::Failed(e) => {
                let error: Result<(), NetError> = Err(e).socket_context();
                if let Err(error) = error {
                    shared.fail(error);
                }
                return;
            }
        }
        drop(shared);
        tokio::task::yield_now().await;
    }
}

/// Deliver whatever the buffer satisfies. Returns false when the read task
/// should stop.
fn process_reads(shared: &Rc<ConnShared>) -> bool {
    loop {
        let (chunk, eof) = {
            let mut inner = shared.inner.borrow_mut();
            if inner.state != ConnState::Connected || shared.deleted.get() {
                return false;
            }
            let eof = inner.read_eof;
            (inner.reads.next_ready(eof), eof)
        };

        if let Some(data) = chunk {
            shared.emit(ConnEvent::Read(data));
            continue;
        }

        let (wanted, watching) = {
            let inner = shared.inner.borrow();
            if inner.state != ConnState::Connected {
                return false;
            }
            (inner.wants_read(), inner.watch_readable)
        };
        if !wanted {
            return false;
        }
        if eof && !watching {
            // Nothing more can satisfy the outstanding requests.
            shared.teardown(ConnState::Closed);
            shared.emit(ConnEvent::Close);
            return false;
        }
        return true;
    }
}

enum WriteOutcome {
    Writable,
    Sent(Option<Finished>),
    WouldBlock,
    Failed(io::Error),
}

async fn write_loop(weak: Weak<ConnShared>) {
    loop {
        {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let inner = shared.inner.borrow();
            if inner.state != ConnState::Connected || !inner.wants_write() {
                return;
            }
        }

        let ready = poll_fn(|cx| {
            let Some(shared) = weak.upgrade() else {
                return Poll::Ready(None);
            };
            let inner = shared.inner.borrow();
            match inner.stream.as_ref() {
                Some(stream) => stream.poll_write_ready(cx).map(Some),
                None => Poll::Ready(None),
            }
        })
        .await;

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let outcome = match ready {
            None => return,
            Some(Err(e)) => WriteOutcome::Failed(e),
            Some(Ok(())) => {
                let mut inner = shared.inner.borrow_mut();
                if inner.watch_writable {
                    WriteOutcome::Writable
                } else {
                    let Some(head) = inner.writes.front() else {
                        return;
                    };
                    let sent = match inner.stream.as_ref() {
                        Some(stream) => stream.try_write(&head),
                        None => return,
                    };
                    match sent {
                        Ok(n) => {
                            tracing::trace!(conn = shared.id, bytes = n, "wrote");
                            WriteOutcome::Sent(inner.writes.advance(n))
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            WriteOutcome::WouldBlock
                        }
                        Err(e) => WriteOutcome::Failed(e),
                    }
                }
            }
        };

        match outcome {
            WriteOutcome::Writable => shared.emit(ConnEvent::Writable),
            WriteOutcome::Sent(Some(finished)) => {
                let id = finished.id;
                finished.release();
                shared.emit(ConnEvent::Write(id));
            }
            WriteOutcome::Sent(None) | WriteOutcome::WouldBlock => {}
            WriteOutcome::Failed(e) => {
                let error: Result<(), NetError> = Err(e).socket_context();
                if let Err(error) = error {
                    shared.fail(error);
                }
                return;
            }
        }
        drop(shared);
        tokio::task::yield_now().await;
    }
}

fn on_timer(shared: &Rc<ConnShared>) {
    let outstanding = {
        let mut inner = shared.inner.borrow_mut();
        // Detach our own handle; the task ends right after this call.
        inner.timer_task = None;
        inner.has_outstanding()
    };
    if !outstanding {
        tracing::trace!(conn = shared.id, "timer fired with nothing outstanding");
        return;
    }
    tracing::debug!(conn = shared.id, "timeout");
    shared.teardown(ConnState::Closed);
    shared.emit(ConnEvent::Timeout);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Name, Resolve, ResolverConfig, Resolving};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;
    use tokio::sync::Notify;

    type Log = Rc<RefCell<Vec<String>>>;

    fn describe(event: &ConnEvent) -> String {
        match event {
            ConnEvent::Read(data) => format!("read:{}", String::from_utf8_lossy(data)),
            ConnEvent::Write(_) => "write".into(),
            ConnEvent::Error(e) => format!("error:{}", e.code()),
            other => format!("{other:?}").to_lowercase(),
        }
    }

    fn wait(event_loop: &EventLoop, done: &Rc<Notify>) {
        let done = done.clone();
        event_loop
            .run_until(async move {
                tokio::time::timeout(Duration::from_secs(5), done.notified())
                    .await
                    .expect("event never arrived");
            })
            .unwrap();
    }

    fn serve<F>(handler: F) -> SocketAddr
    where
        F: FnOnce(std::net::TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handler(stream);
        });
        addr
    }

    #[test]
    fn test_connect_write_readline() {
        let addr = serve(|stream| {
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let mut stream = stream;
            stream.write_all(format!("echo {line}").as_bytes()).unwrap();
        });

        let event_loop = EventLoop::new().unwrap();
        let log: Log = Rc::default();
        let done = Rc::new(Notify::new());
        let (sink, notify) = (log.clone(), done.clone());
        let conn = Conn::from_addr(&event_loop, addr, move |conn, event| {
            sink.borrow_mut().push(describe(&event));
            match event {
                ConnEvent::Connect => {
                    conn.write(b"ping\r\n");
                    conn.readline();
                }
                ConnEvent::Read(_) => notify.notify_one(),
                _ => {}
            }
        });
        conn.connect();
        assert_eq!(conn.state(), ConnState::Connecting);

        wait(&event_loop, &done);
        assert_eq!(*log.borrow(), vec!["connect", "write", "read:echo ping"]);
        assert!(conn.is_connected());
        assert_eq!(conn.peer_addr(), Some(addr));
    }

    #[test]
    fn test_readn_spans_socket_reads() {
        let addr = serve(|mut stream| {
            stream.write_all(b"abc").unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(30));
            stream.write_all(b"defghij").unwrap();
        });

        let event_loop = EventLoop::new().unwrap();
        let log: Log = Rc::default();
        let done = Rc::new(Notify::new());
        let (sink, notify) = (log.clone(), done.clone());
        let conn = Conn::from_addr(&event_loop, addr, move |conn, event| match event {
            ConnEvent::Connect => {
                conn.readn(8);
                conn.readn(2);
            }
            ConnEvent::Read(_) => {
                sink.borrow_mut().push(describe(&event));
                if sink.borrow().len() == 2 {
                    notify.notify_one();
                }
            }
            _ => {}
        });
        conn.connect();

        wait(&event_loop, &done);
        assert_eq!(*log.borrow(), vec!["read:abcdefgh", "read:ij"]);
    }

    #[test]
    fn test_streaming_read_ends_with_close() {
        let addr = serve(|mut stream| {
            stream.write_all(b"hello world").unwrap();
        });

        let event_loop = EventLoop::new().unwrap();
        let received = Rc::new(RefCell::new(Vec::new()));
        let events: Log = Rc::default();
        let done = Rc::new(Notify::new());
        let (data, sink, notify) = (received.clone(), events.clone(), done.clone());
        let conn = Conn::from_addr(&event_loop, addr, move |conn, event| {
            match &event {
                ConnEvent::Connect => conn.read(),
                ConnEvent::Read(chunk) => data.borrow_mut().extend_from_slice(chunk),
                ConnEvent::Close => notify.notify_one(),
                _ => {}
            }
            sink.borrow_mut().push(describe(&event));
        });
        conn.connect();

        wait(&event_loop, &done);
        event_loop.run_for(Duration::from_millis(20)).unwrap();
        assert_eq!(received.borrow().as_slice(), b"hello world");
        assert_eq!(events.borrow().last().map(String::as_str), Some("close"));
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_delete_inside_callback_stops_events() {
        let addr = serve(|mut stream| {
            for _ in 0..5 {
                stream.write_all(b"line\n").unwrap();
                stream.flush().unwrap();
                thread::sleep(Duration::from_millis(5));
            }
        });

        let event_loop = EventLoop::new().unwrap();
        let log: Log = Rc::default();
        let sink = log.clone();
        let conn = Conn::from_addr(&event_loop, addr, move |conn, event| {
            sink.borrow_mut().push(describe(&event));
            match event {
                ConnEvent::Connect => conn.read(),
                ConnEvent::Read(_) => conn.delete(),
                _ => {}
            }
        });
        conn.connect();
        event_loop.run_for(Duration::from_millis(200)).unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), 2, "events after delete: {log:?}");
        assert_eq!(log[0], "connect");
        assert!(log[1].starts_with("read:"));
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_drop_inside_callback() {
        let addr = serve(|mut stream| {
            stream.write_all(b"x").unwrap();
            thread::sleep(Duration::from_millis(50));
        });

        let event_loop = EventLoop::new().unwrap();
        let slot: Rc<RefCell<Option<Conn>>> = Rc::default();
        let count = Rc::new(Cell::new(0));
        let (owner, hits) = (slot.clone(), count.clone());
        let conn = Conn::from_addr(&event_loop, addr, move |conn, event| {
            hits.set(hits.get() + 1);
            match event {
                ConnEvent::Connect => conn.read(),
                _ => drop(owner.borrow_mut().take()),
            }
        });
        conn.connect();
        *slot.borrow_mut() = Some(conn);

        event_loop.run_for(Duration::from_millis(100)).unwrap();
        assert!(slot.borrow().is_none());
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_timeout_closes_outstanding_read() {
        let addr = serve(|stream| {
            thread::sleep(Duration::from_millis(300));
            drop(stream);
        });

        let event_loop = EventLoop::new().unwrap();
        let log: Log = Rc::default();
        let done = Rc::new(Notify::new());
        let (sink, notify) = (log.clone(), done.clone());
        let conn = Conn::from_addr(&event_loop, addr, move |conn, event| {
            sink.borrow_mut().push(describe(&event));
            match event {
                ConnEvent::Connect => {
                    conn.readline();
                    conn.timeout(30);
                }
                ConnEvent::Timeout => notify.notify_one(),
                _ => {}
            }
        });
        conn.connect();

        wait(&event_loop, &done);
        assert_eq!(*log.borrow(), vec!["connect", "timeout"]);
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_timeout_zero_disables() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let conn = Conn::new(&event_loop, "127.0.0.1", 9, move |_, event| {
            if matches!(event, ConnEvent::Timeout) {
                flag.set(true);
            }
        });
        // A queued read counts as outstanding.
        conn.readline();
        conn.timeout(10);
        conn.timeout(0);
        event_loop.run_for(Duration::from_millis(40)).unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn test_connect_refused_reports_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let event_loop = EventLoop::new().unwrap();
        let error = Rc::new(RefCell::new(None));
        let done = Rc::new(Notify::new());
        let (slot, notify) = (error.clone(), done.clone());
        let conn = Conn::from_addr(&event_loop, addr, move |_, event| {
            if let ConnEvent::Error(e) = event {
                *slot.borrow_mut() = Some(e);
                notify.notify_one();
            }
        });
        conn.connect();

        wait(&event_loop, &done);
        match error.borrow().as_ref() {
            Some(NetError::ConnectionFailedTo { port, .. }) => assert_eq!(*port, addr.port()),
            other => panic!("expected ConnectionFailedTo, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnState::Error);
    }

    struct FailingResolver;

    impl Resolve for FailingResolver {
        fn resolve(&self, name: Name) -> Resolving {
            Box::pin(async move {
                Err(NetError::dns_failed(
                    name.as_str(),
                    io::Error::new(io::ErrorKind::NotFound, "no such host"),
                ))
            })
        }
    }

    #[test]
    fn test_resolve_failure_returns_to_idle() {
        let event_loop = EventLoop::new().unwrap();
        let errors = Rc::new(Cell::new(0));
        let done = Rc::new(Notify::new());
        let (count, notify) = (errors.clone(), done.clone());
        let resolver =
            HostResolver::with_backend(Arc::new(FailingResolver), ResolverConfig::default());
        let conn = Conn::new(&event_loop, "nowhere.invalid", 80, move |_, event| {
            if let ConnEvent::Error(NetError::NameNotResolvedFor { .. }) = event {
                count.set(count.get() + 1);
                notify.notify_one();
            }
        })
        .with_resolver(resolver);
        conn.connect();
        assert_eq!(conn.state(), ConnState::Resolving);

        wait(&event_loop, &done);
        assert_eq!(errors.get(), 1);
        assert_eq!(conn.state(), ConnState::Idle);
    }

    #[test]
    fn test_delete_while_resolving() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let count = hits.clone();
        let resolver =
            HostResolver::with_backend(Arc::new(FailingResolver), ResolverConfig::default());
        let conn = Conn::new(&event_loop, "nowhere.invalid", 80, move |_, _| {
            count.set(count.get() + 1);
        })
        .with_resolver(resolver);
        conn.connect();
        conn.delete();
        event_loop.run_for(Duration::from_millis(50)).unwrap();
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_write_direct_releases_buffer() {
        let addr = serve(|mut stream| {
            let mut buf = [0u8; 7];
            stream.read_exact(&mut buf).unwrap();
        });

        let event_loop = EventLoop::new().unwrap();
        let released = Rc::new(RefCell::new(None));
        let done = Rc::new(Notify::new());
        let (slot, notify) = (released.clone(), done.clone());
        let conn = Conn::from_addr(&event_loop, addr, move |_, event| {
            if let ConnEvent::Write(_) = event {
                notify.notify_one();
            }
        });
        let id = conn.write_direct(Bytes::from_static(b"payload"), move |buf| {
            *slot.borrow_mut() = Some(buf);
        });
        conn.connect();

        wait(&event_loop, &done);
        assert!(id.get() > 0);
        assert_eq!(released.borrow().as_deref(), Some(&b"payload"[..]));
    }

    #[test]
    fn test_adopted_socket_with_readable_watch() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(b"raw").unwrap();
            thread::sleep(Duration::from_millis(100));
        });
        let (accepted, _) = listener.accept().unwrap();

        let event_loop = EventLoop::new().unwrap();
        let got = Rc::new(RefCell::new(Vec::new()));
        let done = Rc::new(Notify::new());
        let (sink, notify) = (got.clone(), done.clone());
        let conn = Conn::from_std(&event_loop, accepted, move |conn, event| {
            if let ConnEvent::Readable = event {
                let mut buf = [0u8; 16];
                if let Ok(n) = conn.try_read(&mut buf) {
                    sink.borrow_mut().extend_from_slice(&buf[..n]);
                    conn.set_watch_readable(false);
                    notify.notify_one();
                }
            }
        })
        .unwrap();
        assert!(conn.is_connected());
        conn.set_watch_readable(true);

        wait(&event_loop, &done);
        assert_eq!(got.borrow().as_slice(), b"raw");
        client.join().unwrap();
    }
}
