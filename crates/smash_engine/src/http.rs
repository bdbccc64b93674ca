//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so applications can plug
//! in whichever HTTP library they already use. Bodies are JSON.

use crate::error::{SmashError, SmashResult};
use crate::transport::SessionTransport;
use parking_lot::RwLock;
use smash_protocol::{
    Ack, CreateSessionRequest, CreateSessionResponse, Endpoint, EnumSessionsRequest,
    EnumSessionsResponse, Fault, GetRowsRequest, GetRowsResponse, JoinSessionRequest,
    JoinSessionResponse, ModifySessionRequest, SendRowsRequest, SendRowsResponse,
    WipeSessionRequest, WireMessage,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request, giving up after `timeout`.
    ///
    /// Errors are connection-level failures; HTTP error statuses are
    /// returned as responses.
    fn post(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<HttpResponse, String>;

    /// Checks if the client is healthy.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Interrupts in-flight requests, if the client supports it.
    fn cancel(&self) {}
}

/// HTTP-based session transport.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the coordination service (e.g., "https://smash.example.com").
    base_url: String,
    client: C,
    /// Timeout for calls that do not hold open.
    request_timeout: Duration,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            request_timeout: Duration::from_secs(30),
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Sets the timeout for calls that do not hold open.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    fn post_json<Req, Res>(
        &self,
        endpoint: Endpoint,
        request: &Req,
        timeout: Duration,
    ) -> SmashResult<Res>
    where
        Req: WireMessage,
        Res: WireMessage,
    {
        if !self.is_connected() {
            return Err(SmashError::NotConnected);
        }

        let body = request.encode()?;
        let url = format!("{}{}", self.base_url, endpoint.path());
        let response = self.client.post(&url, body, timeout).map_err(|e| {
            self.set_error(&e);
            SmashError::transport_retryable(e)
        })?;

        if !response.is_success() {
            let fault = Fault::decode(&response.body)
                .unwrap_or_else(|_| Fault::new(response.status, "unreadable fault body"));
            self.set_error(&fault.message);
            return Err(SmashError::Server {
                status: response.status,
                message: fault.message,
            });
        }

        self.clear_error();
        Ok(Res::decode(&response.body)?)
    }
}

impl<C: HttpClient> SessionTransport for HttpTransport<C> {
    fn join_session(&self, request: &JoinSessionRequest) -> SmashResult<JoinSessionResponse> {
        self.post_json(Endpoint::JoinSession, request, self.request_timeout)
    }

    fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> SmashResult<CreateSessionResponse> {
        self.post_json(Endpoint::CreateSession, request, self.request_timeout)
    }

    fn get_rows(&self, request: &GetRowsRequest) -> SmashResult<GetRowsResponse> {
        let hold = Duration::from_millis(request.timeout_ms);
        self.post_json(Endpoint::GetRows, request, hold + self.request_timeout)
    }

    fn send_rows(&self, request: &SendRowsRequest) -> SmashResult<SendRowsResponse> {
        self.post_json(Endpoint::SendRows, request, self.request_timeout)
    }

    fn modify_session(&self, request: &ModifySessionRequest) -> SmashResult<()> {
        self.post_json::<_, Ack>(Endpoint::ModifySession, request, self.request_timeout)
            .map(|_| ())
    }

    fn wipe_session(&self, request: &WipeSessionRequest) -> SmashResult<()> {
        self.post_json::<_, Ack>(Endpoint::WipeSession, request, self.request_timeout)
            .map(|_| ())
    }

    fn enum_sessions(&self, request: &EnumSessionsRequest) -> SmashResult<EnumSessionsResponse> {
        self.post_json(Endpoint::EnumSessions, request, self.request_timeout)
    }

    fn cancel_get_rows(&self) {
        self.client.cancel();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> SmashResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST request and returns the response.
    fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse;
}

impl<F> LoopbackServer for F
where
    F: Fn(&str, &[u8]) -> HttpResponse,
{
    fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse {
        self(path, body)
    }
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>, _timeout: Duration) -> Result<HttpResponse, String> {
        let path = url.find("/smash/").map(|i| &url[i..]).unwrap_or(url);
        Ok(self.server.handle_post(path, &body))
    }
}
