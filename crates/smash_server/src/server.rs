//! Main coordination server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::store::{SessionStore, StoreStats};
use smash_protocol::{
    Ack, CreateSessionRequest, CreateSessionResponse, Endpoint, EnumSessionsRequest,
    EnumSessionsResponse, GetRowsRequest, GetRowsResponse, JoinSessionRequest,
    JoinSessionResponse, ModifySessionRequest, SendRowsRequest, SendRowsResponse,
    WipeSessionRequest, WireMessage,
};
use std::sync::Arc;
use tracing::warn;

/// The coordination server.
///
/// Hosts sessions in memory and answers the Smash endpoints. Transport is
/// left to the embedder: route each POST body through
/// [`CoordinationServer::handle_post`].
///
/// # Example
///
/// ```
/// use smash_server::{CoordinationServer, ServerConfig};
///
/// let server = CoordinationServer::new(ServerConfig::default());
///
/// // In a real application, an HTTP listener forwards each POST:
/// let (status, _body) = server.handle_post("/smash/Unknown", b"{}");
/// assert_eq!(status, 404);
/// ```
pub struct CoordinationServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl CoordinationServer {
    /// Creates a new coordination server.
    pub fn new(config: ServerConfig) -> Self {
        let store = Arc::new(SessionStore::new(config.row_cache_window));
        Self::with_store(config, store)
    }

    /// Creates a coordination server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<SessionStore>) -> Self {
        let context = Arc::new(HandlerContext::new(config, store));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Handles a CreateSession request.
    pub fn handle_create(
        &self,
        request: CreateSessionRequest,
    ) -> ServerResult<CreateSessionResponse> {
        self.handler.handle_create(request)
    }

    /// Handles a JoinSession request.
    pub fn handle_join(&self, request: JoinSessionRequest) -> ServerResult<JoinSessionResponse> {
        self.handler.handle_join(request)
    }

    /// Handles a GetRows request, blocking while nothing is new.
    pub fn handle_get_rows(&self, request: GetRowsRequest) -> ServerResult<GetRowsResponse> {
        self.handler.handle_get_rows(request)
    }

    /// Handles a SendRows request.
    pub fn handle_send_rows(&self, request: SendRowsRequest) -> ServerResult<SendRowsResponse> {
        self.handler.handle_send_rows(request)
    }

    /// Handles a ModifySession request.
    pub fn handle_modify(&self, request: ModifySessionRequest) -> ServerResult<Ack> {
        self.handler.handle_modify(request)
    }

    /// Handles a WipeSession request.
    pub fn handle_wipe(&self, request: WipeSessionRequest) -> ServerResult<Ack> {
        self.handler.handle_wipe(request)
    }

    /// Handles an EnumSessions request.
    pub fn handle_enum(&self, request: EnumSessionsRequest) -> ServerResult<EnumSessionsResponse> {
        self.handler.handle_enum(request)
    }

    /// Handles a raw POST: decodes the body, dispatches by path and encodes
    /// the response.
    ///
    /// Failures come back as a JSON fault body with a 4xx or 5xx status.
    pub fn handle_post(&self, path: &str, body: &[u8]) -> (u16, Vec<u8>) {
        match self.route(path, body) {
            Ok(encoded) => (200, encoded),
            Err(err) => {
                if err.is_server_error() {
                    warn!(path, error = %err, "request failed");
                }
                let status = err.status();
                let body = err.to_fault().encode().unwrap_or_default();
                (status, body)
            }
        }
    }

    fn route(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        let endpoint =
            Endpoint::from_path(path).ok_or_else(|| ServerError::UnknownEndpoint(path.into()))?;
        let encoded = match endpoint {
            Endpoint::JoinSession => self.handle_join(decode(body)?)?.encode(),
            Endpoint::CreateSession => self.handle_create(decode(body)?)?.encode(),
            Endpoint::GetRows => self.handle_get_rows(decode(body)?)?.encode(),
            Endpoint::SendRows => self.handle_send_rows(decode(body)?)?.encode(),
            Endpoint::ModifySession => self.handle_modify(decode(body)?)?.encode(),
            Endpoint::WipeSession => self.handle_wipe(decode(body)?)?.encode(),
            Endpoint::EnumSessions => self.handle_enum(decode(body)?)?.encode(),
        };
        encoded.map_err(|e| ServerError::Internal(e.to_string()))
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Returns store counters.
    pub fn stats(&self) -> StoreStats {
        self.context.store.stats()
    }
}

fn decode<T: WireMessage>(body: &[u8]) -> ServerResult<T> {
    Ok(T::decode(body)?)
}
