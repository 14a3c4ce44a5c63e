/// Progress of an HTTP exchange, as reported by `HttpConn::load_state`.
/// Roughly follows net/base/load_states.h, trimmed to the states a
/// single-connection client can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// Nothing in flight.
    #[default]
    Idle,

    /// Resolving the host.
    ResolvingHost,

    /// Connecting to the host (TCP handshake).
    Connecting,

    /// Sending the HTTP request.
    SendingRequest,

    /// Waiting for the server response (TTFB).
    WaitingForResponse,

    /// Reading the response body.
    ReadingResponse,
}
