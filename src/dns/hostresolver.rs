//! Loop-facing, cancellable name resolution.
//!
//! [`HostResolver::resolve`] starts a lookup on a worker thread and delivers
//! the result to a callback on the event loop the caller named. Delivery is
//! never synchronous: even numeric addresses, which skip the worker, are
//! dispatched through the loop.
//!
//! Cancellation goes through [`ResolveHandle::cancel`]. A cancelled request
//! never invokes its result callback, and its `on_destroy` notification
//! fires exactly once however the request ends: delivered, failed,
//! cancelled before the worker started, cancelled while the worker was
//! blocked, or cancelled after the worker finished but before dispatch.

use super::gai::{GaiResolver, SocketAddrs};
use super::{Name, Resolve};
use crate::base::eventloop::EventLoop;
use crate::base::neterror::NetError;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Address-family preference applied to forward lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpPolicy {
    /// IPv4 addresses first, then IPv6.
    #[default]
    Ipv4ThenIpv6,
    /// IPv6 addresses first, then IPv4.
    Ipv6ThenIpv4,
    Ipv4Only,
    Ipv6Only,
}

/// Resolver configuration, fixed at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub ip_policy: IpPolicy,
}

impl ResolverConfig {
    pub fn with_ip_policy(mut self, policy: IpPolicy) -> Self {
        self.ip_policy = policy;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// First address after policy ordering.
    ForwardSingle,
    /// Every address, policy ordered.
    ForwardAll,
    /// Address to host name.
    Reverse,
}

/// Successful lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Addrs(Vec<SocketAddr>),
    Name(String),
}

impl Resolution {
    /// Addresses of a forward lookup; empty for reverse results.
    pub fn addrs(&self) -> &[SocketAddr] {
        match self {
            Resolution::Addrs(addrs) => addrs,
            Resolution::Name(_) => &[],
        }
    }

    /// Host name of a reverse lookup.
    pub fn name(&self) -> Option<&str> {
        match self {
            Resolution::Name(name) => Some(name),
            Resolution::Addrs(_) => None,
        }
    }
}

/// What to look up, and who to tell when the request is gone.
pub struct ResolveRequest {
    target: String,
    port: u16,
    mode: LookupMode,
    on_destroy: Option<Box<dyn FnOnce()>>,
}

impl ResolveRequest {
    pub fn new(target: impl Into<String>, port: u16, mode: LookupMode) -> Self {
        Self {
            target: target.into(),
            port,
            mode,
            on_destroy: None,
        }
    }

    /// Forward lookup delivering the preferred address.
    pub fn forward(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, LookupMode::ForwardSingle)
    }

    /// Forward lookup delivering every address.
    pub fn forward_all(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, LookupMode::ForwardAll)
    }

    pub fn reverse(addr: IpAddr) -> Self {
        Self::new(addr.to_string(), 0, LookupMode::Reverse)
    }

    /// Called exactly once when the request is finished with, after the
    /// result callback if there was one.
    pub fn on_destroy(mut self, notify: impl FnOnce() + 'static) -> Self {
        self.on_destroy = Some(Box::new(notify));
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn mode(&self) -> LookupMode {
        self.mode
    }
}

impl fmt::Debug for ResolveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveRequest")
            .field("target", &self.target)
            .field("port", &self.port)
            .field("mode", &self.mode)
            .field("on_destroy", &self.on_destroy.is_some())
            .finish()
    }
}

type ResolveCallback = Box<dyn FnOnce(Result<Resolution, NetError>)>;

/// Cancellation flag shared between the loop and the worker thread.
#[derive(Clone, Default)]
struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Returns true if this call performed the cancellation.
    fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Callback plus destroy notification. Dropping it fires the notification,
/// so every path that discards a request notifies exactly once.
struct Pending {
    callback: Option<ResolveCallback>,
    on_destroy: Option<Box<dyn FnOnce()>>,
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.callback.take();
        if let Some(notify) = self.on_destroy.take() {
            notify();
        }
    }
}

struct RequestState {
    id: u64,
    token: CancelToken,
    pending: RefCell<Option<Pending>>,
    in_callback: Cell<bool>,
    worker: RefCell<Option<JoinHandle<()>>>,
    dispatch: RefCell<Option<JoinHandle<()>>>,
}

/// Handle to an outstanding lookup.
#[derive(Clone)]
pub struct ResolveHandle {
    state: Rc<RequestState>,
}

impl ResolveHandle {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.token.is_cancelled()
    }

    /// Whether the request has been delivered or discarded.
    pub fn is_finished(&self) -> bool {
        self.state.pending.borrow().is_none()
    }

    /// Cancel the lookup. Idempotent.
    ///
    /// Ignored from inside the request's own result callback, where the
    /// result has already been delivered.
    pub fn cancel(&self) {
        let state = &self.state;
        if state.in_callback.get() {
            tracing::trace!(request = state.id, "cancel from result callback ignored");
            return;
        }
        if !state.token.cancel() {
            return;
        }
        tracing::debug!(request = state.id, "resolution cancelled");

        // A blocking job that has not started yet never starts; one that is
        // blocked finishes on its own and discards its result.
        if let Some(worker) = state.worker.borrow_mut().take() {
            worker.abort();
        }
        if let Some(dispatch) = state.dispatch.borrow_mut().take() {
            dispatch.abort();
        }
        let pending = state.pending.borrow_mut().take();
        drop(pending);
    }
}

impl fmt::Debug for ResolveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveHandle")
            .field("id", &self.state.id)
            .field("cancelled", &self.state.token.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Asynchronous, cancellable resolver bound to no particular loop.
///
/// ```rust,ignore
/// use netloop::base::EventLoop;
/// use netloop::dns::{HostResolver, ResolveRequest};
///
/// let event_loop = EventLoop::new()?;
/// let resolver = HostResolver::default();
/// let handle = resolver.resolve(ResolveRequest::forward("localhost", 80), &event_loop, |res| {
///     println!("{:?}", res);
/// });
/// ```
#[derive(Clone)]
pub struct HostResolver {
    backend: Arc<dyn Resolve>,
    config: ResolverConfig,
}

impl Default for HostResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

impl HostResolver {
    /// System resolver (`getaddrinfo`) with the given configuration.
    pub fn new(config: ResolverConfig) -> Self {
        Self::with_backend(Arc::new(GaiResolver::new()), config)
    }

    pub fn with_backend(backend: Arc<dyn Resolve>, config: ResolverConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Start a lookup. `callback` runs on `event_loop`, never before this
    /// call returns.
    pub fn resolve<F>(
        &self,
        request: ResolveRequest,
        event_loop: &EventLoop,
        callback: F,
    ) -> ResolveHandle
    where
        F: FnOnce(Result<Resolution, NetError>) + 'static,
    {
        let ResolveRequest {
            target,
            port,
            mode,
            on_destroy,
        } = request;

        let state = Rc::new(RequestState {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            token: CancelToken::default(),
            pending: RefCell::new(Some(Pending {
                callback: Some(Box::new(callback)),
                on_destroy,
            })),
            in_callback: Cell::new(false),
            worker: RefCell::new(None),
            dispatch: RefCell::new(None),
        });
        tracing::debug!(request = state.id, target = %target, port, ?mode, "resolve");

        let policy = self.config.ip_policy;

        // Numeric targets and malformed reverse targets need no worker.
        let immediate = match mode {
            LookupMode::ForwardSingle | LookupMode::ForwardAll => {
                SocketAddrs::try_parse(&target, port)
                    .map(|addrs| select_addrs(&target, addrs.order_by_policy(policy), mode))
            }
            LookupMode::Reverse => match target.parse::<IpAddr>() {
                Ok(_) => None,
                Err(_) => Some(Err(NetError::InvalidArgument)),
            },
        };

        if let Some(result) = immediate {
            let dispatch_state = state.clone();
            let task = event_loop.spawn_local(async move {
                dispatch(&dispatch_state, result);
            });
            *state.dispatch.borrow_mut() = Some(task);
            return ResolveHandle { state };
        }

        let (tx, rx) = oneshot::channel();
        let backend = self.backend.clone();
        let token = state.token.clone();
        let id = state.id;
        let worker = event_loop.spawn_blocking(move || {
            if token.is_cancelled() {
                tracing::trace!(request = id, "lookup cancelled before start");
                return;
            }
            let runtime = tokio::runtime::Handle::current();
            let result = runtime.block_on(lookup(backend, target, port, mode, policy));
            if token.is_cancelled() {
                tracing::debug!(request = id, "discarding result of cancelled lookup");
                return;
            }
            let _ = tx.send(result);
        });
        *state.worker.borrow_mut() = Some(worker);

        let dispatch_state = state.clone();
        let task = event_loop.spawn_local(async move {
            // A dropped sender is either a cancellation, which `dispatch`
            // filters, or a worker that died before producing a result.
            let result = rx.await.unwrap_or_else(|_| {
                if !dispatch_state.token.is_cancelled() {
                    tracing::warn!(
                        request = dispatch_state.id,
                        "lookup worker ended without a result"
                    );
                }
                Err(NetError::Failed)
            });
            dispatch(&dispatch_state, result);
        });
        *state.dispatch.borrow_mut() = Some(task);

        ResolveHandle { state }
    }

    /// Same as [`ResolveHandle::cancel`].
    pub fn cancel(&self, handle: &ResolveHandle) {
        handle.cancel();
    }
}

impl fmt::Debug for HostResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostResolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Runs on the loop: deliver unless cancelled in the meantime.
fn dispatch(state: &RequestState, result: Result<Resolution, NetError>) {
    if state.token.is_cancelled() {
        return;
    }
    let Some(mut pending) = state.pending.borrow_mut().take() else {
        return;
    };
    let Some(callback) = pending.callback.take() else {
        return;
    };

    tracing::debug!(request = state.id, ok = result.is_ok(), "resolution dispatched");
    state.in_callback.set(true);
    callback(result);
    state.in_callback.set(false);

    // Fires on_destroy after the result.
    drop(pending);
}

fn select_addrs(
    target: &str,
    addrs: SocketAddrs,
    mode: LookupMode,
) -> Result<Resolution, NetError> {
    let mut addrs = addrs.into_vec();
    if addrs.is_empty() {
        return Err(NetError::dns_failed(
            target,
            io::Error::new(
                io::ErrorKind::NotFound,
                "no address matches the address-family policy",
            ),
        ));
    }
    if mode == LookupMode::ForwardSingle {
        addrs.truncate(1);
    }
    Ok(Resolution::Addrs(addrs))
}

/// Worker-side lookup, driven on a blocking thread.
async fn lookup(
    backend: Arc<dyn Resolve>,
    target: String,
    port: u16,
    mode: LookupMode,
    policy: IpPolicy,
) -> Result<Resolution, NetError> {
    match mode {
        LookupMode::ForwardSingle | LookupMode::ForwardAll => {
            let addrs = backend.resolve(Name::new(target.as_str())).await?;
            let addrs = SocketAddrs::new(addrs.collect())
                .with_port(port)
                .order_by_policy(policy);
            select_addrs(&target, addrs, mode)
        }
        LookupMode::Reverse => {
            let addr: IpAddr = target.parse().map_err(|_| NetError::InvalidArgument)?;
            match backend.resolve_reverse(addr).await {
                Ok(name) => Ok(Resolution::Name(name.as_str().to_string())),
                Err(e) => {
                    // No PTR record: fall back to the canonical address text
                    tracing::debug!(addr = %addr, error = %e, "reverse lookup fell back to address");
                    Ok(Resolution::Name(addr.to_string()))
                }
            }
        }
    }
}
