//! Request handlers for coordination endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::SessionStore;
use smash_protocol::{
    Ack, CreateSessionRequest, CreateSessionResponse, EnumSessionsRequest, EnumSessionsResponse,
    GetRowsRequest, GetRowsResponse, JoinSessionRequest, JoinSessionResponse,
    ModifySessionRequest, SendRowsRequest, SendRowsResponse, WipeSessionRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Session state (shared across all handlers).
    pub store: Arc<SessionStore>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, store: Arc<SessionStore>) -> Self {
        Self { config, store }
    }
}

/// Handler for coordination requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a CreateSession request.
    pub fn handle_create(
        &self,
        request: CreateSessionRequest,
    ) -> ServerResult<CreateSessionResponse> {
        request.validate()?;
        let max = self.context.config.max_session_lifetime;
        if Duration::from_secs(request.lifetime_secs) > max {
            return Err(ServerError::InvalidRequest(format!(
                "lifetime {}s exceeds {}s",
                request.lifetime_secs,
                max.as_secs()
            )));
        }

        let session_id = self.context.store.create(&request)?;
        info!(session = %session_id, name = %request.session_name, "session created");
        Ok(CreateSessionResponse { session_id })
    }

    /// Handles a JoinSession request.
    pub fn handle_join(&self, request: JoinSessionRequest) -> ServerResult<JoinSessionResponse> {
        request.validate()?;
        let response = self.context.store.join(&request)?;
        info!(
            session = %response.session_id,
            client = %response.client_id,
            device = %request.device_name,
            "participant joined"
        );
        Ok(response)
    }

    /// Handles a GetRows request.
    ///
    /// Blocks the calling thread for at most the smaller of the requested
    /// timeout and the configured ceiling.
    pub fn handle_get_rows(&self, request: GetRowsRequest) -> ServerResult<GetRowsResponse> {
        let hold = Duration::from_millis(request.timeout_ms)
            .min(self.context.config.long_poll_ceiling);
        let rows = self.context.store.rows_since(&request, hold)?;
        debug!(
            client = %request.client_id,
            since = request.last_known_row_version,
            rows = rows.len(),
            "rows served"
        );
        Ok(GetRowsResponse::new(rows))
    }

    /// Handles a SendRows request.
    pub fn handle_send_rows(&self, request: SendRowsRequest) -> ServerResult<SendRowsResponse> {
        request.validate()?;
        let max = self.context.config.max_send_batch;
        if request.rows.len() > max {
            return Err(ServerError::InvalidRequest(format!(
                "too many rows: {} > {}",
                request.rows.len(),
                max
            )));
        }

        let client = request.client_id;
        let response = self.context.store.append(request)?;
        debug!(
            client = %client,
            first_version = response.time_stamp_start,
            rows = response.row_guids.len(),
            "rows accepted"
        );
        Ok(response)
    }

    /// Handles a ModifySession request.
    pub fn handle_modify(&self, request: ModifySessionRequest) -> ServerResult<Ack> {
        self.context.store.modify(&request)?;
        debug!(
            session = %request.session_id,
            added = request.attendees_add.len(),
            removed = request.attendees_remove.len(),
            "attendees changed"
        );
        Ok(Ack {})
    }

    /// Handles a WipeSession request.
    pub fn handle_wipe(&self, request: WipeSessionRequest) -> ServerResult<Ack> {
        self.context.store.wipe(&request)?;
        info!(session = %request.session_id, "session wiped");
        Ok(Ack {})
    }

    /// Handles an EnumSessions request.
    pub fn handle_enum(&self, request: EnumSessionsRequest) -> ServerResult<EnumSessionsResponse> {
        Ok(EnumSessionsResponse {
            sessions: self.context.store.enumerate(request.management_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smash_protocol::{DataRow, ManagementId, RowAction, MAX_ROW_PAYLOAD_BYTES};
    use uuid::Uuid;

    fn handler(config: ServerConfig) -> RequestHandler {
        let store = Arc::new(SessionStore::new(config.row_cache_window));
        RequestHandler::new(Arc::new(HandlerContext::new(config, store)))
    }

    fn create_request(lifetime_secs: u64) -> CreateSessionRequest {
        CreateSessionRequest {
            meeting_token: "token".into(),
            session_name: "standup".into(),
            owner_name: "Ada".into(),
            owner_email: "ada@example.com".into(),
            attendees: Vec::new(),
            lifetime_secs,
            management_id: ManagementId::new(),
        }
    }

    #[test]
    fn create_respects_configured_lifetime() {
        let config = ServerConfig::new().with_max_session_lifetime(Duration::from_secs(60));
        let handler = handler(config);
        assert!(matches!(
            handler.handle_create(create_request(120)),
            Err(ServerError::InvalidRequest(_))
        ));
        assert!(handler.handle_create(create_request(60)).is_ok());
    }

    #[test]
    fn create_rejects_invalid_requests() {
        let handler = handler(ServerConfig::default());
        let err = handler.handle_create(create_request(0)).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn send_rows_limits() {
        let handler = handler(ServerConfig::new().with_max_send_batch(2));
        let session_id = handler
            .handle_create(create_request(3_600))
            .unwrap()
            .session_id;
        let joined = handler
            .handle_join(JoinSessionRequest::new("token", "Bob", "bob@example.com", "phone"))
            .unwrap();

        let send = |rows: Vec<DataRow>| {
            handler.handle_send_rows(SendRowsRequest {
                meeting_token: "token".into(),
                session_id,
                client_id: joined.client_id,
                rows,
            })
        };
        let row = |size| DataRow::new(RowAction::Add, Uuid::new_v4(), 1, vec![0; size]);

        assert!(matches!(
            send(vec![row(1), row(1), row(1)]),
            Err(ServerError::InvalidRequest(_))
        ));
        assert!(matches!(
            send(vec![row(MAX_ROW_PAYLOAD_BYTES + 1)]),
            Err(ServerError::Protocol(_))
        ));

        let accepted = send(vec![row(1), row(1)]).unwrap();
        assert_eq!(accepted.time_stamp_start, 1);
        assert_eq!(accepted.row_guids.len(), 2);
    }

    #[test]
    fn get_rows_hold_is_capped() {
        let config = ServerConfig::new().with_long_poll_ceiling(Duration::from_millis(20));
        let handler = handler(config);
        let session_id = handler
            .handle_create(create_request(3_600))
            .unwrap()
            .session_id;
        let joined = handler
            .handle_join(JoinSessionRequest::new("token", "Bob", "bob@example.com", "phone"))
            .unwrap();

        let started = std::time::Instant::now();
        let response = handler
            .handle_get_rows(GetRowsRequest {
                meeting_token: "token".into(),
                session_id,
                client_id: joined.client_id,
                last_known_row_version: 0,
                timeout_ms: 60_000,
                cached: false,
            })
            .unwrap();
        assert!(response.rows.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
