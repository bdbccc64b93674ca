//! Typed clients over a [`SessionTransport`].

use crate::config::SessionConfig;
use crate::error::{SmashError, SmashResult};
use crate::transport::SessionTransport;
use smash_protocol::{
    ClientId, CreateSessionRequest, DataRow, EnumSessionsRequest, GetRowsRequest,
    GetRowsResponse, JoinSessionRequest, ManagementId, ModifySessionRequest, SendRowsRequest,
    SessionId, SessionInfo, WipeSessionRequest,
};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

/// Identity of a joined participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Meeting token the session was joined with.
    pub meeting_token: String,
    /// Joined session.
    pub session_id: SessionId,
    /// Id assigned to this participant.
    pub client_id: ClientId,
}

/// Participant-side client of one joined session.
pub struct SessionClient {
    transport: Arc<dyn SessionTransport>,
    config: SessionConfig,
    participant: Participant,
}

impl SessionClient {
    /// Joins a session.
    ///
    /// The request is validated before anything is sent.
    pub fn join(
        transport: Arc<dyn SessionTransport>,
        config: SessionConfig,
        request: &JoinSessionRequest,
    ) -> SmashResult<Self> {
        config.validate()?;
        request.validate()?;

        let response = transport.join_session(request)?;
        info!(
            session = %response.session_id,
            client = %response.client_id,
            host = config.effective_host(),
            "joined session"
        );

        Ok(Self {
            transport,
            config,
            participant: Participant {
                meeting_token: request.meeting_token.clone(),
                session_id: response.session_id,
                client_id: response.client_id,
            },
        })
    }

    /// Identity assigned on join.
    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Id assigned on join.
    pub fn client_id(&self) -> ClientId {
        self.participant.client_id
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Submits rows and returns the `(version, guid)` the server assigned to
    /// each, in submission order.
    pub fn send_rows(&self, rows: Vec<DataRow>) -> SmashResult<Vec<(u64, Uuid)>> {
        let expected = rows.len();
        let request = SendRowsRequest {
            meeting_token: self.participant.meeting_token.clone(),
            session_id: self.participant.session_id,
            client_id: self.participant.client_id,
            rows,
        };
        request.validate()?;

        let response = self.transport.send_rows(&request)?;
        if response.row_guids.len() != expected {
            return Err(SmashError::Codec(format!(
                "server confirmed {} rows, {} were sent",
                response.row_guids.len(),
                expected
            )));
        }
        let assignments = response
            .assignments()
            .map_err(|e| SmashError::Codec(format!("invalid SendRows response: {e}")))?;
        debug!(
            rows = expected,
            first_version = response.time_stamp_start,
            "rows accepted"
        );
        Ok(assignments)
    }

    /// Fetches rows newer than `last_known_row_version`.
    ///
    /// Fails with [`SmashError::Timeout`] once the configured deadline
    /// passes and with [`SmashError::Aborted`] when `abort` is notified.
    /// Either way the transport is asked to cancel the call; one that cannot
    /// is left to finish on its blocking worker and its reply is discarded.
    pub async fn get_rows(
        &self,
        last_known_row_version: u64,
        cached: bool,
        abort: &Notify,
    ) -> SmashResult<GetRowsResponse> {
        let request = GetRowsRequest {
            meeting_token: self.participant.meeting_token.clone(),
            session_id: self.participant.session_id,
            client_id: self.participant.client_id,
            last_known_row_version,
            timeout_ms: self.config.server_wait().as_millis() as u64,
            cached,
        };

        let transport = Arc::clone(&self.transport);
        let call = tokio::task::spawn_blocking(move || transport.get_rows(&request));

        tokio::select! {
            joined = call => match joined {
                Ok(result) => result,
                Err(e) => Err(SmashError::transport_fatal(format!("GetRows task failed: {e}"))),
            },
            _ = abort.notified() => {
                self.transport.cancel_get_rows();
                Err(SmashError::Aborted)
            }
            _ = tokio::time::sleep(self.config.request_deadline()) => {
                self.transport.cancel_get_rows();
                Err(SmashError::Timeout)
            }
        }
    }

    /// Closes the underlying transport.
    pub fn close(&self) -> SmashResult<()> {
        self.transport.close()
    }
}

/// Owner-side client for session administration.
pub struct ManagementClient {
    transport: Arc<dyn SessionTransport>,
    management_id: ManagementId,
}

impl ManagementClient {
    /// Creates a client acting with the given owner secret.
    pub fn new(transport: Arc<dyn SessionTransport>, management_id: ManagementId) -> Self {
        Self {
            transport,
            management_id,
        }
    }

    /// Owner secret used on every request.
    pub fn management_id(&self) -> ManagementId {
        self.management_id
    }

    /// Creates a session owned by this client.
    ///
    /// Lifetimes outside 1 second to 30 days are rejected before sending.
    pub fn create_session(&self, mut request: CreateSessionRequest) -> SmashResult<SessionId> {
        request.management_id = self.management_id;
        request.validate()?;
        let response = self.transport.create_session(&request)?;
        info!(session = %response.session_id, name = %request.session_name, "session created");
        Ok(response.session_id)
    }

    /// Adds and removes attendees.
    pub fn modify_session(
        &self,
        meeting_token: impl Into<String>,
        session_id: SessionId,
        attendees_add: Vec<String>,
        attendees_remove: Vec<String>,
    ) -> SmashResult<()> {
        let request = ModifySessionRequest {
            meeting_token: meeting_token.into(),
            session_id,
            management_id: self.management_id,
            attendees_add,
            attendees_remove,
        };
        self.transport.modify_session(&request)
    }

    /// Deletes all rows and participants of a session.
    pub fn wipe_session(
        &self,
        meeting_token: impl Into<String>,
        session_id: SessionId,
    ) -> SmashResult<()> {
        let request = WipeSessionRequest {
            meeting_token: meeting_token.into(),
            session_id,
            management_id: self.management_id,
        };
        self.transport.wipe_session(&request)?;
        info!(session = %session_id, "session wiped");
        Ok(())
    }

    /// Lists the sessions owned by this client.
    pub fn enum_sessions(&self) -> SmashResult<Vec<SessionInfo>> {
        let request = EnumSessionsRequest {
            management_id: self.management_id,
        };
        Ok(self.transport.enum_sessions(&request)?.sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockReply, MockTransport};
    use smash_protocol::{JoinSessionResponse, RowAction, MAX_SESSION_LIFETIME_SECS};
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig::default()
            .with_long_poll_timeout(Duration::from_millis(50))
            .with_timeout_margin(Duration::from_millis(50))
    }

    fn join(mock: &Arc<MockTransport>) -> SessionClient {
        let request = JoinSessionRequest::new("token", "Ada", "ada@example.com", "laptop");
        SessionClient::join(mock.clone(), config(), &request).unwrap()
    }

    #[test]
    fn join_records_identity() {
        let mock = Arc::new(MockTransport::new());
        let session_id = SessionId::new();
        mock.set_join_response(JoinSessionResponse {
            session_id,
            client_id: ClientId(9),
        });

        let client = join(&mock);
        assert_eq!(client.client_id(), ClientId(9));
        assert_eq!(client.participant().session_id, session_id);
        assert_eq!(client.participant().meeting_token, "token");
    }

    #[test]
    fn join_validates_before_sending() {
        let mock = Arc::new(MockTransport::new());
        mock.set_connected(false);
        let request = JoinSessionRequest::new("", "Ada", "ada@example.com", "laptop");
        let result = SessionClient::join(mock, config(), &request);
        assert!(matches!(result, Err(SmashError::Validation(_))));
    }

    #[test]
    fn send_rows_rejects_empty_batches() {
        let mock = Arc::new(MockTransport::new());
        let client = join(&mock);
        assert!(matches!(
            client.send_rows(Vec::new()),
            Err(SmashError::Validation(_))
        ));
        assert!(mock.sent_requests().is_empty());
    }

    #[test]
    fn send_rows_carries_identity() {
        let mock = Arc::new(MockTransport::new());
        let client = join(&mock);
        let row = DataRow::new(RowAction::Add, Uuid::new_v4(), 1, vec![1, 2]);
        client.send_rows(vec![row]).unwrap();

        let sent = mock.sent_requests();
        assert_eq!(sent[0].client_id, client.client_id());
        assert_eq!(sent[0].meeting_token, "token");
    }

    #[test]
    fn send_rows_rejects_overflowing_versions() {
        let mock = Arc::new(MockTransport::new());
        mock.set_next_version(u64::MAX);
        let client = join(&mock);
        let rows = (0..2)
            .map(|_| DataRow::new(RowAction::Add, Uuid::new_v4(), 1, vec![0]))
            .collect();
        assert!(matches!(client.send_rows(rows), Err(SmashError::Codec(_))));
    }

    #[test]
    fn send_rows_returns_assignments() {
        let mock = Arc::new(MockTransport::new());
        mock.set_next_version(10);
        let client = join(&mock);
        let row = DataRow::new(RowAction::Add, Uuid::new_v4(), 1, vec![0]);
        let guid = row.guid;
        assert_eq!(client.send_rows(vec![row]).unwrap(), vec![(10, guid)]);
    }

    #[tokio::test]
    async fn get_rows_times_out_at_deadline() {
        let mock = Arc::new(MockTransport::new());
        mock.push_reply(MockReply::Stall(Duration::from_millis(400)));
        let client = join(&mock);

        let abort = Notify::new();
        let result = client.get_rows(0, false, &abort).await;
        assert!(matches!(result, Err(SmashError::Timeout)));
        assert_eq!(mock.get_requests()[0].timeout_ms, 50);
        assert_eq!(mock.cancelled_calls(), 1);
    }

    #[tokio::test]
    async fn get_rows_can_be_aborted() {
        let mock = Arc::new(MockTransport::new());
        mock.push_reply(MockReply::Stall(Duration::from_millis(400)));
        let client = join(&mock);

        let abort = Notify::new();
        abort.notify_one();
        let result = client.get_rows(3, true, &abort).await;
        assert!(matches!(result, Err(SmashError::Aborted)));
        assert_eq!(mock.cancelled_calls(), 1);
    }

    #[tokio::test]
    async fn completed_get_rows_is_not_cancelled() {
        let mock = Arc::new(MockTransport::new());
        let client = join(&mock);

        let abort = Notify::new();
        let response = client.get_rows(0, false, &abort).await.unwrap();
        assert!(response.rows.is_empty());
        assert_eq!(mock.cancelled_calls(), 0);
    }

    #[test]
    fn create_session_enforces_lifetime() {
        let mock = Arc::new(MockTransport::new());
        let owner = ManagementClient::new(mock, ManagementId::new());
        let request = CreateSessionRequest {
            meeting_token: "token".into(),
            session_name: "standup".into(),
            owner_name: "Ada".into(),
            owner_email: "ada@example.com".into(),
            attendees: Vec::new(),
            lifetime_secs: MAX_SESSION_LIFETIME_SECS + 1,
            management_id: ManagementId::new(),
        };
        assert!(matches!(
            owner.create_session(request.clone()),
            Err(SmashError::Validation(_))
        ));

        let request = CreateSessionRequest {
            lifetime_secs: 3_600,
            ..request
        };
        assert!(owner.create_session(request).is_ok());
    }
}
