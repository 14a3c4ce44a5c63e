//! HTTP/1.x client exchange on top of [`Conn`].
//!
//! An [`HttpConn`] performs one logical request: it resolves the server,
//! connects, sends the request, decodes the response and follows
//! redirects, reporting each step as an [`HttpEvent`]. Every hop uses a
//! fresh [`Conn`]; the previous one is deleted before the next lookup
//! starts, so its events can never be observed afterwards.
//!
//! Two ways to drive it:
//! - [`HttpConn::run`] iterates the event loop until a terminal event and
//!   returns the outcome. The callback, if any, still sees every event.
//! - [`HttpConn::run_async`] returns at once; events arrive while the
//!   caller iterates the loop.
//!
//! ```rust,ignore
//! use netloop::base::EventLoop;
//! use netloop::http::{HttpConn, HttpEvent};
//!
//! let event_loop = EventLoop::new()?;
//! let conn = HttpConn::new(&event_loop);
//! conn.set_uri("example.com/index.html")?;
//! conn.set_callback(|_, event| {
//!     if let HttpEvent::Response(head) = event {
//!         println!("{} {}", head.status(), head.reason());
//!     }
//! });
//! conn.run()?;
//! let body = conn.take_body();
//! ```

use super::decoder::{DecodeEvent, Framing, ResponseDecoder};
use super::event::{DataProgress, HttpEvent, RedirectInfo};
use super::orderedheaders::{HeaderFlags, RequestHeaders};
use super::requestbody::RequestBody;
use super::response::{HttpResponse, ResponseHead};
use crate::base::eventloop::EventLoop;
use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::client::HttpConfig;
use crate::dns::{HostResolver, Resolution, ResolveHandle, ResolveRequest};
use crate::socket::{Conn, ConnEvent, ProxySettings, WriteId};
use bytes::{Bytes, BytesMut};
use http::Method;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use url::Url;

static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

/// Largest slice of a request body queued as one write.
const BODY_WRITE_SIZE: usize = 64 * 1024;

type HttpCallback = Box<dyn FnMut(&HttpConn, HttpEvent)>;

/// Exchange progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Resolving,
    Connecting,
    Sending,
    Waiting,
    Reading,
    Done,
}

impl State {
    fn to_load_state(self) -> LoadState {
        match self {
            State::Idle | State::Done => LoadState::Idle,
            State::Resolving => LoadState::ResolvingHost,
            State::Connecting => LoadState::Connecting,
            State::Sending => LoadState::SendingRequest,
            State::Waiting => LoadState::WaitingForResponse,
            State::Reading => LoadState::ReadingResponse,
        }
    }
}

/// Handle to one HTTP exchange. Clones share it.
#[derive(Clone)]
pub struct HttpConn {
    shared: Rc<HttpShared>,
}

struct HttpShared {
    id: u64,
    event_loop: EventLoop,
    resolver: RefCell<HostResolver>,
    inner: RefCell<Exchange>,
    callback: RefCell<Option<HttpCallback>>,
    callback_epoch: Cell<u64>,
    deleted: Cell<bool>,
    done: Notify,
}

struct Exchange {
    // Request
    url: Option<Url>,
    method: Method,
    body: Option<RequestBody>,
    headers: RequestHeaders,
    user_agent: String,
    timeout_ms: u64,
    max_redirects: u32,
    auto_redirect: bool,
    skip_header_check: bool,
    expect_continue: bool,
    stream_only: bool,
    proxy: Option<ProxySettings>,

    // Progress
    state: State,
    generation: u64,
    conn: Option<Conn>,
    resolve: Option<ResolveHandle>,
    timer: Option<JoinHandle<()>>,
    decoder: ResponseDecoder,
    held_body: Option<Bytes>,
    last_write: Option<WriteId>,
    response: Option<ResponseHead>,
    buffer: BytesMut,
    received: u64,
    content_length: Option<u64>,
    num_redirects: u32,
    visited: Vec<Url>,
    outcome: Option<Result<(), NetError>>,
}

impl Exchange {
    fn from_config(config: &HttpConfig) -> Self {
        Self {
            url: None,
            method: Method::GET,
            body: None,
            headers: RequestHeaders::new(),
            user_agent: config
                .user_agent
                .as_deref()
                .map(agent_string)
                .unwrap_or_else(default_user_agent),
            timeout_ms: config.timeout_ms,
            max_redirects: config.max_redirects,
            auto_redirect: config.auto_redirect,
            skip_header_check: config.skip_header_check,
            expect_continue: config.expect_continue,
            stream_only: config.stream_only,
            proxy: config.proxy.clone(),
            state: State::Idle,
            generation: 0,
            conn: None,
            resolve: None,
            timer: None,
            decoder: ResponseDecoder::default(),
            held_body: None,
            last_write: None,
            response: None,
            buffer: BytesMut::new(),
            received: 0,
            content_length: None,
            num_redirects: 0,
            visited: Vec::new(),
            outcome: None,
        }
    }

    fn active_proxy(&self) -> Option<&ProxySettings> {
        self.proxy.as_ref().filter(|p| p.is_enabled())
    }

    /// Where the socket goes: the proxy if one is on, else the server.
    fn connect_target(&self) -> Result<(String, u16), NetError> {
        if let Some(proxy) = self.active_proxy() {
            let (host, port) = proxy.host_port().ok_or(NetError::InvalidUrl)?;
            return Ok((host.to_string(), port));
        }
        let url = self.url.as_ref().ok_or(NetError::InvalidUrl)?;
        let host = url.host_str().ok_or(NetError::InvalidUrl)?;
        let port = url.port_or_known_default().ok_or(NetError::InvalidUrl)?;
        Ok((host.to_string(), port))
    }

    /// Serialize the request head; the body is returned separately so it
    /// can be held back for `100 Continue`.
    fn build_request(&self) -> Result<(Bytes, Option<Bytes>), NetError> {
        let url = self.url.as_ref().ok_or(NetError::InvalidUrl)?;
        let host = url.host_str().ok_or(NetError::InvalidUrl)?;
        let proxy = self.active_proxy();

        let target = if proxy.is_some() {
            let mut absolute = url.clone();
            absolute.set_fragment(None);
            absolute.to_string()
        } else {
            match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            }
        };

        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, target);
        match url.port() {
            Some(port) if port != 80 => out.push_str(&format!("Host: {host}:{port}\r\n")),
            _ => out.push_str(&format!("Host: {host}\r\n")),
        }

        let mut headers = self.headers.clone();
        for (name, value) in [
            ("User-Agent", self.user_agent.as_str()),
            ("Accept", "*/*"),
            ("Connection", "close"),
        ] {
            if !headers.contains(name) {
                headers.insert(name, value, false);
            }
        }

        let body = self.body.as_ref().filter(|b| !b.is_empty());
        if let Some(body) = body {
            if !headers.contains("Content-Length") {
                headers.insert("Content-Length", &body.len().to_string(), false);
            }
            if let Some(content_type) = body.content_type() {
                if !headers.contains("Content-Type") {
                    headers.insert("Content-Type", content_type, false);
                }
            }
            if self.expect_continue {
                headers.insert("Expect", "100-continue", true);
            }
        }
        if let Some(auth) = proxy.and_then(ProxySettings::auth_header) {
            headers.insert("Proxy-Authorization", &auth, true);
        }
        headers.write_to(&mut out);
        out.push_str("\r\n");

        Ok((Bytes::from(out), body.map(|b| b.bytes().clone())))
    }

    fn reset_hop(&mut self) {
        self.decoder = ResponseDecoder::new(self.method == Method::HEAD);
        self.held_body = None;
        self.last_write = None;
        self.response = None;
        self.buffer.clear();
        self.received = 0;
        self.content_length = None;
    }
}

fn agent_string(agent: &str) -> String {
    format!("{agent} (netloop/{})", env!("CARGO_PKG_VERSION"))
}

fn default_user_agent() -> String {
    let program = std::env::args_os()
        .next()
        .and_then(|arg| {
            Path::new(&arg)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "netloop".to_string());
    agent_string(&program)
}

/// Parse a request URI. A missing scheme means `http://`.
fn parse_uri(uri: &str) -> Result<Url, NetError> {
    let url = if uri.contains("://") {
        Url::parse(uri)
    } else {
        Url::parse(&format!("http://{uri}"))
    }
    .map_err(|e| {
        tracing::debug!(uri, error = %e, "invalid uri");
        NetError::InvalidUrl
    })?;

    if url.scheme() != "http" {
        tracing::debug!(scheme = url.scheme(), "unsupported scheme");
        return Err(NetError::UnsupportedProtocol);
    }
    if url.host_str().is_none() {
        return Err(NetError::InvalidUrl);
    }
    Ok(url)
}

impl HttpConn {
    /// Exchange with default settings.
    pub fn new(event_loop: &EventLoop) -> Self {
        Self::with_config(event_loop, &HttpConfig::default())
    }

    pub fn with_config(event_loop: &EventLoop, config: &HttpConfig) -> Self {
        let id = NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(exchange = id, "http conn created");
        Self {
            shared: Rc::new(HttpShared {
                id,
                event_loop: event_loop.clone(),
                resolver: RefCell::new(HostResolver::new(config.resolver.clone())),
                inner: RefCell::new(Exchange::from_config(config)),
                callback: RefCell::new(None),
                callback_epoch: Cell::new(0),
                deleted: Cell::new(false),
                done: Notify::new(),
            }),
        }
    }

    /// Use `resolver` for lookups of the server and proxy.
    pub fn with_resolver(self, resolver: HostResolver) -> Self {
        *self.shared.resolver.borrow_mut() = resolver;
        self
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(&HttpConn, HttpEvent) + 'static,
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

    /// Target of the request. A missing scheme gets `http://`; other
    /// schemes fail with [`NetError::UnsupportedProtocol`].
    pub fn set_uri(&self, uri: &str) -> Result<(), NetError> {
        let url = parse_uri(uri)?;
        self.shared.inner.borrow_mut().url = Some(url);
        Ok(())
    }

    /// Current target, following any redirects taken so far.
    pub fn url(&self) -> Option<Url> {
        self.shared.inner.borrow().url.clone()
    }

    pub fn set_method(&self, method: Method, body: Option<RequestBody>) {
        let mut inner = self.shared.inner.borrow_mut();
        inner.method = method;
        inner.body = body;
    }

    /// Add a request header. `Host` is generated and cannot be set.
    ///
    /// Unless the exchange was configured with `skip_header_check`, only
    /// well-known request headers pass without [`HeaderFlags::SKIP_CHECK`].
    pub fn set_header(&self, name: &str, value: &str, flags: HeaderFlags) -> Result<(), NetError> {
        if name.eq_ignore_ascii_case("Host") {
            tracing::debug!("Host header is generated");
            return Err(NetError::InvalidHeader);
        }
        let mut inner = self.shared.inner.borrow_mut();
        let flags = if inner.skip_header_check {
            flags | HeaderFlags::SKIP_CHECK
        } else {
            flags
        };
        inner.headers.set(name, value, flags)
    }

    /// `None` restores the default agent (the program name).
    pub fn set_user_agent(&self, agent: Option<&str>) {
        self.shared.inner.borrow_mut().user_agent = match agent {
            Some(agent) => agent_string(agent),
            None => default_user_agent(),
        };
    }

    /// Milliseconds without progress before `Timeout`; `0` disables.
    pub fn set_timeout(&self, ms: u64) {
        self.shared.inner.borrow_mut().timeout_ms = ms;
    }

    /// `0` disables following redirects.
    pub fn set_max_redirects(&self, max: u32) {
        self.shared.inner.borrow_mut().max_redirects = max;
    }

    pub fn set_auto_redirect(&self, on: bool) {
        self.shared.inner.borrow_mut().auto_redirect = on;
    }

    /// Send `Expect: 100-continue` with a body and hold the body back
    /// until the server says `100 Continue`.
    pub fn set_expect_continue(&self, on: bool) {
        self.shared.inner.borrow_mut().expect_continue = on;
    }

    /// Deliver body bytes through `DataPartial` only, without buffering.
    pub fn set_stream_only(&self, on: bool) {
        self.shared.inner.borrow_mut().stream_only = on;
    }

    pub fn set_proxy(&self, proxy: Option<ProxySettings>) {
        self.shared.inner.borrow_mut().proxy = proxy;
    }

    /// Run the exchange to completion on the event loop.
    ///
    /// Returns `Ok` after `DataComplete`, the error after `Error`,
    /// [`NetError::TimedOut`] after `Timeout` and [`NetError::Aborted`]
    /// when cancelled or deleted. Fails with [`NetError::Unexpected`] if
    /// the loop is already running.
    pub fn run(&self) -> Result<(), NetError> {
        if self.shared.event_loop.is_running() {
            debug_assert!(false, "HttpConn::run from inside the event loop");
            tracing::warn!(exchange = self.shared.id, "synchronous run inside running loop");
            return Err(NetError::Unexpected);
        }
        self.run_async()?;

        let shared = self.shared.clone();
        self.shared.event_loop.run_until(async move {
            loop {
                if let Some(outcome) = shared.inner.borrow_mut().outcome.take() {
                    return outcome;
                }
                shared.done.notified().await;
            }
        })?
    }

    /// Start the exchange and return. Events arrive as the loop runs.
    pub fn run_async(&self) -> Result<(), NetError> {
        if self.shared.deleted.get() {
            debug_assert!(false, "run on deleted HttpConn {}", self.shared.id);
            return Err(NetError::Aborted);
        }
        {
            let mut inner = self.shared.inner.borrow_mut();
            if !matches!(inner.state, State::Idle | State::Done) {
                tracing::warn!(exchange = self.shared.id, state = ?inner.state, "exchange already running");
                return Err(NetError::Unexpected);
            }
            let url = inner.url.clone().ok_or(NetError::InvalidUrl)?;
            inner.num_redirects = 0;
            inner.visited = vec![url];
            inner.outcome = None;
        }
        start_hop(&self.shared);
        Ok(())
    }

    /// Stop the exchange. No terminal event follows; a synchronous `run`
    /// returns [`NetError::Aborted`].
    pub fn cancel(&self) {
        tracing::debug!(exchange = self.shared.id, "cancel");
        self.shared.abort();
    }

    /// Stop the exchange and drop the callback. Safe from inside it.
    pub fn delete(&self) {
        if self.shared.deleted.replace(true) {
            return;
        }
        tracing::debug!(exchange = self.shared.id, "delete");
        self.shared.abort();
        let callback = self.shared.callback.borrow_mut().take();
        drop(callback);
    }

    pub fn load_state(&self) -> LoadState {
        self.shared.inner.borrow().state.to_load_state()
    }

    /// Head of the last response received.
    pub fn response(&self) -> Option<ResponseHead> {
        self.shared.inner.borrow().response.clone()
    }

    /// Copy of the body received so far.
    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.shared.inner.borrow().buffer)
    }

    /// Take the body received so far, leaving the buffer empty.
    pub fn take_body(&self) -> Bytes {
        self.shared.inner.borrow_mut().buffer.split().freeze()
    }

    /// Final URL, head and body of a finished exchange.
    pub fn take_response(&self) -> Option<HttpResponse> {
        let mut inner = self.shared.inner.borrow_mut();
        let url = inner.url.clone()?;
        let head = inner.response.clone()?;
        let body = inner.buffer.split().freeze();
        Some(HttpResponse::new(url, head, body))
    }

    fn check_alive(&self, op: &str) -> bool {
        if self.shared.deleted.get() {
            debug_assert!(false, "{op} on deleted HttpConn {}", self.shared.id);
            tracing::warn!(exchange = self.shared.id, op, "operation on deleted HttpConn");
            return false;
        }
        true
    }
}

impl fmt::Debug for HttpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.borrow();
        f.debug_struct("HttpConn")
            .field("id", &self.shared.id)
            .field("url", &inner.url.as_ref().map(Url::as_str))
            .field("method", &inner.method)
            .field("state", &inner.state)
            .field("redirects", &inner.num_redirects)
            .finish_non_exhaustive()
    }
}

impl HttpShared {
    fn emit(self: &Rc<Self>, event: HttpEvent) {
        if self.deleted.get() {
            return;
        }
        let Some(mut callback) = self.callback.borrow_mut().take() else {
            return;
        };
        let epoch = self.callback_epoch.get();
        let handle = HttpConn {
            shared: self.clone(),
        };
        callback(&handle, event);
        drop(handle);

        if !self.deleted.get() && self.callback_epoch.get() == epoch {
            *self.callback.borrow_mut() = Some(callback);
        }
    }

    /// Whether work started under `generation` may still proceed.
    fn is_current(&self, generation: u64) -> bool {
        let inner = self.inner.borrow();
        !self.deleted.get() && inner.generation == generation && inner.state != State::Done
    }

    /// Delete the connection, cancel the lookup and stop the timer.
    fn stop_io(&self) {
        let (conn, resolve, timer) = {
            let mut inner = self.inner.borrow_mut();
            (inner.conn.take(), inner.resolve.take(), inner.timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(resolve) = resolve {
            resolve.cancel();
        }
        if let Some(conn) = conn {
            conn.delete();
        }
    }

    fn abort(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, State::Idle | State::Done) {
                return;
            }
            inner.state = State::Done;
            inner.generation += 1;
            inner.outcome = Some(Err(NetError::Aborted));
        }
        self.stop_io();
        self.done.notify_one();
    }

    /// Deliver the one terminal event of the exchange.
    fn finish(self: &Rc<Self>, event: HttpEvent) {
        let outcome = match &event {
            HttpEvent::Error(e) => Err(e.clone()),
            HttpEvent::Timeout => Err(NetError::TimedOut),
            _ => Ok(()),
        };
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == State::Done {
                return;
            }
            inner.state = State::Done;
            inner.generation += 1;
            inner.outcome = Some(outcome);
        }
        tracing::debug!(exchange = self.id, ?event, "exchange finished");
        self.stop_io();
        self.emit(event);
        self.done.notify_one();
    }
}

impl Drop for HttpShared {
    fn drop(&mut self) {
        self.stop_io();
    }
}

/// (Re)arm the progress timer for the current generation.
fn arm_timer(shared: &Rc<HttpShared>) {
    let mut inner = shared.inner.borrow_mut();
    if let Some(timer) = inner.timer.take() {
        timer.abort();
    }
    if inner.timeout_ms == 0 {
        return;
    }
    let ms = inner.timeout_ms;
    let generation = inner.generation;
    let weak = Rc::downgrade(shared);
    inner.timer = Some(shared.event_loop.spawn_local(async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if shared.is_current(generation) {
            tracing::debug!(exchange = shared.id, ms, "no progress, timing out");
            shared.finish(HttpEvent::Timeout);
        }
    }));
}

/// Look up the server (or proxy) for the current URL.
fn start_hop(shared: &Rc<HttpShared>) {
    let target = {
        let mut inner = shared.inner.borrow_mut();
        inner.generation += 1;
        inner.state = State::Resolving;
        inner.reset_hop();
        inner.connect_target().map(|t| (t, inner.generation))
    };
    let ((host, port), generation) = match target {
        Ok(target) => target,
        Err(e) => {
            // Never call back from inside `run_async`.
            let generation = shared.inner.borrow().generation;
            let weak = Rc::downgrade(shared);
            shared.event_loop.spawn_local(async move {
                if let Some(shared) = weak.upgrade() {
                    if shared.is_current(generation) {
                        shared.finish(HttpEvent::Error(e));
                    }
                }
            });
            return;
        }
    };
    tracing::debug!(exchange = shared.id, host = %host, port, "resolving");
    arm_timer(shared);

    let weak = Rc::downgrade(shared);
    let resolver = shared.resolver.borrow().clone();
    let handle = resolver.resolve(
        ResolveRequest::forward(host, port),
        &shared.event_loop,
        move |result| {
            if let Some(shared) = weak.upgrade() {
                on_resolved(&shared, generation, result);
            }
        },
    );
    shared.inner.borrow_mut().resolve = Some(handle);
}

fn on_resolved(shared: &Rc<HttpShared>, generation: u64, result: Result<Resolution, NetError>) {
    if !shared.is_current(generation) {
        return;
    }
    shared.inner.borrow_mut().resolve = None;

    let addr = result.and_then(|r| r.addrs().first().copied().ok_or(NetError::NameNotResolved));
    let addr = match addr {
        Ok(addr) => addr,
        Err(e) => {
            shared.emit(HttpEvent::Resolved(Err(e.clone())));
            if shared.is_current(generation) {
                shared.finish(HttpEvent::Error(e));
            }
            return;
        }
    };

    shared.emit(HttpEvent::Resolved(Ok(addr)));
    if !shared.is_current(generation) {
        return;
    }

    let weak = Rc::downgrade(shared);
    let conn = Conn::from_addr(&shared.event_loop, addr, move |conn, event| {
        if let Some(shared) = weak.upgrade() {
            on_conn_event(&shared, conn, event);
        }
    });
    {
        let mut inner = shared.inner.borrow_mut();
        inner.state = State::Connecting;
        inner.conn = Some(conn.clone());
    }
    conn.connect();
}

fn on_conn_event(shared: &Rc<HttpShared>, conn: &Conn, event: ConnEvent) {
    let generation = {
        let inner = shared.inner.borrow();
        if inner.conn.as_ref().map(Conn::id) != Some(conn.id()) {
            return;
        }
        inner.generation
    };

    match event {
        ConnEvent::Connect => on_connected(shared, conn, generation),
        ConnEvent::Read(data) => {
            arm_timer(shared);
            shared.inner.borrow_mut().decoder.feed(&data);
            drive_decoder(shared, generation);
        }
        ConnEvent::Close => {
            shared.inner.borrow_mut().decoder.finish();
            drive_decoder(shared, generation);
        }
        ConnEvent::Write(id) => {
            arm_timer(shared);
            let mut inner = shared.inner.borrow_mut();
            if inner.state == State::Sending
                && inner.last_write == Some(id)
                && inner.held_body.is_none()
            {
                inner.state = State::Waiting;
            }
        }
        ConnEvent::Error(e) => shared.finish(HttpEvent::Error(e)),
        ConnEvent::Timeout | ConnEvent::Readable | ConnEvent::Writable => {}
    }
}

fn on_connected(shared: &Rc<HttpShared>, conn: &Conn, generation: u64) {
    shared.emit(HttpEvent::Connected);
    if !shared.is_current(generation) {
        return;
    }
    arm_timer(shared);

    let request = shared.inner.borrow().build_request();
    let (head, body) = match request {
        Ok(request) => request,
        Err(e) => return shared.finish(HttpEvent::Error(e)),
    };

    let hold = shared.inner.borrow().expect_continue && body.is_some();
    let mut last = conn.write_bytes(head);
    let held = match body {
        Some(body) if hold => Some(body),
        Some(body) => {
            last = write_body(conn, body).unwrap_or(last);
            None
        }
        None => None,
    };
    {
        let mut inner = shared.inner.borrow_mut();
        inner.state = State::Sending;
        inner.last_write = Some(last);
        inner.held_body = held;
    }
    conn.read();
}

/// Pull events out of the decoder until it needs input or the exchange
/// moves on.
fn drive_decoder(shared: &Rc<HttpShared>, generation: u64) {
    while shared.is_current(generation) {
        let step = shared.inner.borrow_mut().decoder.decode();
        match step {
            Err(e) => return shared.finish(HttpEvent::Error(e)),
            Ok(None) => return,
            Ok(Some(DecodeEvent::Interim(status))) => send_held_body(shared, status),
            Ok(Some(DecodeEvent::Head(head))) => on_head(shared, head, generation),
            Ok(Some(DecodeEvent::Data(chunk))) => on_data(shared, chunk),
            Ok(Some(DecodeEvent::Complete)) => {
                let received = shared.inner.borrow().received;
                return shared.finish(HttpEvent::DataComplete { received });
            }
        }
    }
}

fn send_held_body(shared: &Rc<HttpShared>, status: u16) {
    let (conn, body) = {
        let mut inner = shared.inner.borrow_mut();
        if status != 100 {
            return;
        }
        match (inner.conn.clone(), inner.held_body.take()) {
            (Some(conn), Some(body)) => (conn, body),
            _ => return,
        }
    };
    tracing::debug!(exchange = shared.id, bytes = body.len(), "100 Continue, sending body");
    if let Some(id) = write_body(&conn, body) {
        shared.inner.borrow_mut().last_write = Some(id);
    }
}

/// Queue the body in slices so every completed slice counts as progress.
fn write_body(conn: &Conn, body: Bytes) -> Option<WriteId> {
    let mut last = None;
    let mut offset = 0;
    while offset < body.len() {
        let end = body.len().min(offset + BODY_WRITE_SIZE);
        last = Some(conn.write_bytes(body.slice(offset..end)));
        offset = end;
    }
    last
}

/// What to do about a 3xx.
enum RedirectPlan {
    /// Not a redirect, or no usable Location.
    None,
    /// Report it; the 3xx completes the exchange.
    Report(String),
    Follow(Url, Method, bool),
}

fn plan_redirect(ex: &Exchange, head: &ResponseHead) -> Result<RedirectPlan, NetError> {
    if !head.is_redirect() || head.status() == 304 {
        return Ok(RedirectPlan::None);
    }
    let (Some(location), Some(base)) = (head.location(), ex.url.as_ref()) else {
        return Ok(RedirectPlan::None);
    };
    let target = match base.join(location) {
        Ok(target) => target,
        Err(_) if !ex.auto_redirect || ex.max_redirects == 0 => {
            return Ok(RedirectPlan::Report(location.to_string()));
        }
        Err(_) => return Err(NetError::InvalidRedirect),
    };

    let post_301 = head.status() == 301 && ex.method == Method::POST;
    if !ex.auto_redirect || ex.max_redirects == 0 || post_301 {
        return Ok(RedirectPlan::Report(target.to_string()));
    }
    if ex.num_redirects >= ex.max_redirects {
        return Err(NetError::TooManyRedirects);
    }
    if target.scheme() != "http" {
        return Err(NetError::UnsupportedProtocol);
    }
    if ex.visited.contains(&target) {
        return Err(NetError::RedirectCycleDetected);
    }

    // 303, and 302 after POST, continue as GET without a body.
    let to_get = head.status() == 303 || (head.status() == 302 && ex.method == Method::POST);
    let method = if to_get && ex.method != Method::HEAD {
        Method::GET
    } else {
        ex.method.clone()
    };
    Ok(RedirectPlan::Follow(target, method, to_get))
}

fn on_head(shared: &Rc<HttpShared>, head: ResponseHead, generation: u64) {
    let plan = {
        let mut inner = shared.inner.borrow_mut();
        inner.state = State::Reading;
        inner.held_body = None;
        inner.response = Some(head.clone());
        inner.content_length = match inner.decoder.framing() {
            Some(Framing::ContentLength(n)) => Some(n),
            Some(Framing::None) => Some(0),
            _ => None,
        };
        plan_redirect(&inner, &head)
    };

    shared.emit(HttpEvent::Response(head));
    if !shared.is_current(generation) {
        return;
    }

    let (num_redirects, max_redirects) = {
        let inner = shared.inner.borrow();
        (inner.num_redirects, inner.max_redirects)
    };
    match plan {
        Err(e) => shared.finish(HttpEvent::Error(e)),
        Ok(RedirectPlan::None) => {}
        Ok(RedirectPlan::Report(location)) => {
            shared.emit(HttpEvent::Redirect(RedirectInfo {
                location,
                num_redirects,
                max_redirects,
                auto: false,
            }));
        }
        Ok(RedirectPlan::Follow(target, method, drop_body)) => {
            tracing::debug!(exchange = shared.id, location = %target, "following redirect");
            shared.emit(HttpEvent::Redirect(RedirectInfo {
                location: target.to_string(),
                num_redirects: num_redirects + 1,
                max_redirects,
                auto: true,
            }));
            if !shared.is_current(generation) {
                return;
            }

            // Old connection goes first; nothing from it is seen again.
            shared.stop_io();
            {
                let mut inner = shared.inner.borrow_mut();
                inner.num_redirects += 1;
                inner.visited.push(target.clone());
                inner.url = Some(target);
                inner.method = method;
                if drop_body {
                    inner.body = None;
                }
            }
            start_hop(shared);
        }
    }
}

fn on_data(shared: &Rc<HttpShared>, chunk: Bytes) {
    let progress = {
        let mut inner = shared.inner.borrow_mut();
        inner.received += chunk.len() as u64;
        if !inner.stream_only {
            inner.buffer.extend_from_slice(&chunk);
        }
        DataProgress {
            chunk,
            received: inner.received,
            content_length: inner.content_length,
        }
    };
    shared.emit(HttpEvent::DataPartial(progress));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(uri: &str) -> Exchange {
        let mut ex = Exchange::from_config(&HttpConfig::default());
        ex.url = Some(parse_uri(uri).unwrap());
        ex.user_agent = agent_string("test");
        ex
    }

    fn request_text(ex: &Exchange) -> String {
        let (head, _) = ex.build_request().unwrap();
        String::from_utf8(head.to_vec()).unwrap()
    }

    #[test]
    fn test_parse_uri_defaults_scheme() {
        let url = parse_uri("example.com/a b?q=1").unwrap();
        assert_eq!(url.as_str(), "http://example.com/a%20b?q=1");
        assert!(matches!(
            parse_uri("https://example.com/"),
            Err(NetError::UnsupportedProtocol)
        ));
        assert!(parse_uri("http://").is_err());
    }

    #[test]
    fn test_get_request_layout() {
        let text = request_text(&exchange("example.com/path?x=1"));
        assert!(text.starts_with("GET /path?x=1 HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(text.contains("\r\nAccept: */*\r\n"));
        assert!(text.contains("\r\nConnection: close\r\n"));
        assert!(text.contains(&format!(
            "\r\nUser-Agent: test (netloop/{})\r\n",
            env!("CARGO_PKG_VERSION")
        )));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_host_carries_non_default_port() {
        let text = request_text(&exchange("http://127.0.0.1:8080/"));
        assert!(text.contains("\r\nHost: 127.0.0.1:8080\r\n"));
    }

    #[test]
    fn test_post_with_expect_continue() {
        let mut ex = exchange("example.com/upload");
        ex.method = Method::POST;
        ex.body = Some(RequestBody::from("a=1").with_content_type("application/x-www-form-urlencoded"));
        ex.expect_continue = true;

        let (head, body) = ex.build_request().unwrap();
        let text = String::from_utf8(head.to_vec()).unwrap();
        assert!(text.starts_with("POST /upload HTTP/1.1\r\n"));
        assert!(text.contains("\r\nContent-Length: 3\r\n"));
        assert!(text.contains("\r\nContent-Type: application/x-www-form-urlencoded\r\n"));
        assert!(text.contains("\r\nExpect: 100-continue\r\n"));
        assert_eq!(body.as_deref(), Some(&b"a=1"[..]));
    }

    #[test]
    fn test_caller_headers_override_defaults() {
        let mut ex = exchange("example.com/");
        ex.headers
            .set("Accept", "text/html", HeaderFlags::NONE)
            .unwrap();
        let text = request_text(&ex);
        assert!(text.contains("\r\nAccept: text/html\r\n"));
        assert!(!text.contains("*/*"));
    }

    #[test]
    fn test_proxy_uses_absolute_form() {
        let mut ex = exchange("example.com/p#frag");
        ex.proxy = Some(
            ProxySettings::new("proxy.local:3128")
                .unwrap()
                .with_auth("u", "p"),
        );
        assert_eq!(ex.connect_target().unwrap(), ("proxy.local".to_string(), 3128));
        let text = request_text(&ex);
        assert!(text.starts_with("GET http://example.com/p HTTP/1.1\r\n"));
        assert!(text.contains("\r\nProxy-Authorization: Basic dTpw\r\n"));

        ex.proxy.as_mut().unwrap().set_enabled(false);
        assert_eq!(ex.connect_target().unwrap(), ("example.com".to_string(), 80));
    }

    fn redirect(status: u16, location: Option<&str>) -> ResponseHead {
        let mut head = ResponseHead::new("HTTP/1.1".into(), status, "Moved".into());
        if let Some(location) = location {
            head.headers.push(("Location".into(), location.into()));
        }
        head
    }

    #[test]
    fn test_plan_redirect_rules() {
        let mut ex = exchange("example.com/a");
        ex.visited = vec![ex.url.clone().unwrap()];

        match plan_redirect(&ex, &redirect(302, Some("/b"))).unwrap() {
            RedirectPlan::Follow(url, method, _) => {
                assert_eq!(url.as_str(), "http://example.com/b");
                assert_eq!(method, Method::GET);
            }
            _ => panic!("expected follow"),
        }
        assert!(matches!(
            plan_redirect(&ex, &redirect(301, None)).unwrap(),
            RedirectPlan::None
        ));
        assert!(matches!(
            plan_redirect(&ex, &redirect(302, Some("/a"))),
            Err(NetError::RedirectCycleDetected)
        ));

        ex.method = Method::POST;
        assert!(matches!(
            plan_redirect(&ex, &redirect(301, Some("/b"))).unwrap(),
            RedirectPlan::Report(_)
        ));

        ex.method = Method::GET;
        ex.max_redirects = 0;
        assert!(matches!(
            plan_redirect(&ex, &redirect(301, Some("/b"))).unwrap(),
            RedirectPlan::Report(_)
        ));

        ex.max_redirects = 2;
        ex.num_redirects = 2;
        assert!(matches!(
            plan_redirect(&ex, &redirect(302, Some("/c"))),
            Err(NetError::TooManyRedirects)
        ));
    }

    #[test]
    fn test_set_header_rejects_host() {
        let event_loop = EventLoop::new().unwrap();
        let conn = HttpConn::new(&event_loop);
        assert!(matches!(
            conn.set_header("host", "evil", HeaderFlags::SKIP_CHECK),
            Err(NetError::InvalidHeader)
        ));
        assert!(conn.set_header("X-Mine", "1", HeaderFlags::NONE).is_err());
        conn.set_header("X-Mine", "1", HeaderFlags::SKIP_CHECK).unwrap();
    }

    #[test]
    fn test_run_without_uri() {
        let event_loop = EventLoop::new().unwrap();
        let conn = HttpConn::new(&event_loop);
        assert!(matches!(conn.run(), Err(NetError::InvalidUrl)));
        assert_eq!(conn.load_state(), LoadState::Idle);
    }

    #[test]
    fn test_cancel_while_resolving() {
        let event_loop = EventLoop::new().unwrap();
        let conn = HttpConn::new(&event_loop);
        conn.set_uri("127.0.0.1:9/").unwrap();
        let seen = Rc::new(Cell::new(0));
        let count = seen.clone();
        conn.set_callback(move |_, _| count.set(count.get() + 1));

        conn.run_async().unwrap();
        assert_eq!(conn.load_state(), LoadState::ResolvingHost);
        conn.cancel();
        event_loop.run_for(Duration::from_millis(20)).unwrap();
        assert_eq!(seen.get(), 0);
        assert_eq!(conn.load_state(), LoadState::Idle);
    }

    #[test]
    fn test_early_failure_is_reported_from_the_loop() {
        let event_loop = EventLoop::new().unwrap();
        let conn = HttpConn::new(&event_loop);
        conn.shared.inner.borrow_mut().url = Some(Url::parse("data:,no-host").unwrap());
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        conn.set_callback(move |_, event| {
            if let HttpEvent::Error(e) = event {
                sink.borrow_mut().push(e);
            }
        });

        conn.run_async().unwrap();
        assert!(errors.borrow().is_empty());

        event_loop.iterate().unwrap();
        assert!(matches!(errors.borrow().as_slice(), [NetError::InvalidUrl]));
        assert_eq!(conn.load_state(), LoadState::Idle);
    }

    #[test]
    fn test_cancel_before_early_failure_is_delivered() {
        let event_loop = EventLoop::new().unwrap();
        let conn = HttpConn::new(&event_loop);
        conn.shared.inner.borrow_mut().url = Some(Url::parse("data:,no-host").unwrap());
        let seen = Rc::new(Cell::new(0));
        let count = seen.clone();
        conn.set_callback(move |_, _| count.set(count.get() + 1));

        conn.run_async().unwrap();
        conn.cancel();
        event_loop.iterate().unwrap();
        assert_eq!(seen.get(), 0);
    }

    #[test]
    fn test_run_reports_early_failure() {
        let event_loop = EventLoop::new().unwrap();
        let conn = HttpConn::new(&event_loop);
        conn.shared.inner.borrow_mut().url = Some(Url::parse("data:,no-host").unwrap());
        assert!(matches!(conn.run(), Err(NetError::InvalidUrl)));
    }
}
