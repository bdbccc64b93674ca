//! Protocol messages for the coordination service.
//!
//! Every endpoint takes one JSON request body and answers with one JSON
//! response body. Failures travel as a [`Fault`].

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{ClientId, ManagementId, SessionId};
use crate::row::DataRow;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest lifetime a session may be created with (30 days).
pub const MAX_SESSION_LIFETIME_SECS: u64 = 30 * 24 * 60 * 60;

/// JSON encoding shared by every message.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Encodes to JSON bytes.
    fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON bytes.
    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Coordination service endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Join an existing session.
    JoinSession,
    /// Create a new session.
    CreateSession,
    /// Long-poll for rows newer than a watermark.
    GetRows,
    /// Submit locally authored rows.
    SendRows,
    /// Change a session's attendee list.
    ModifySession,
    /// Delete all of a session's rows and participants.
    WipeSession,
    /// List sessions owned by a management id.
    EnumSessions,
}

impl Endpoint {
    /// All endpoints.
    pub const ALL: [Endpoint; 7] = [
        Endpoint::JoinSession,
        Endpoint::CreateSession,
        Endpoint::GetRows,
        Endpoint::SendRows,
        Endpoint::ModifySession,
        Endpoint::WipeSession,
        Endpoint::EnumSessions,
    ];

    /// Returns the HTTP path of the endpoint.
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::JoinSession => "/smash/JoinSession",
            Endpoint::CreateSession => "/smash/CreateSession",
            Endpoint::GetRows => "/smash/GetRows",
            Endpoint::SendRows => "/smash/SendRows",
            Endpoint::ModifySession => "/smash/ModifySession",
            Endpoint::WipeSession => "/smash/WipeSession",
            Endpoint::EnumSessions => "/smash/EnumSessions",
        }
    }

    /// Resolves an endpoint from a request path.
    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.path() == path)
    }
}

fn require_non_empty(field: &'static str, value: &str) -> ProtocolResult<()> {
    if value.trim().is_empty() {
        return Err(ProtocolError::invalid_field(field, "must not be empty"));
    }
    Ok(())
}

/// Request to join a session as a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionRequest {
    /// Shared meeting token.
    pub meeting_token: String,
    /// Display name of the participant.
    pub user_name: String,
    /// E-mail of the participant.
    pub user_email: String,
    /// Device the participant joins from.
    pub device_name: String,
    /// Force a fresh client id even if this user/device already joined.
    pub force_rejoin: bool,
}

impl JoinSessionRequest {
    /// Creates a join request.
    pub fn new(
        meeting_token: impl Into<String>,
        user_name: impl Into<String>,
        user_email: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            meeting_token: meeting_token.into(),
            user_name: user_name.into(),
            user_email: user_email.into(),
            device_name: device_name.into(),
            force_rejoin: false,
        }
    }

    /// Sets the force-rejoin flag.
    pub fn with_force_rejoin(mut self, force: bool) -> Self {
        self.force_rejoin = force;
        self
    }

    /// Validates the request before it is sent.
    pub fn validate(&self) -> ProtocolResult<()> {
        require_non_empty("meeting_token", &self.meeting_token)?;
        require_non_empty("user_name", &self.user_name)
    }
}

impl WireMessage for JoinSessionRequest {}

/// Identifiers assigned on join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionResponse {
    /// Session that was joined.
    pub session_id: SessionId,
    /// Id of the joining participant.
    pub client_id: ClientId,
}

impl WireMessage for JoinSessionResponse {}

/// Request to create a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Meeting token participants will join with.
    pub meeting_token: String,
    /// Human-readable session name.
    pub session_name: String,
    /// Owner display name.
    pub owner_name: String,
    /// Owner e-mail.
    pub owner_email: String,
    /// Invited attendee e-mails.
    pub attendees: Vec<String>,
    /// Lifetime in seconds, at most [`MAX_SESSION_LIFETIME_SECS`].
    pub lifetime_secs: u64,
    /// Owner secret.
    pub management_id: ManagementId,
}

impl CreateSessionRequest {
    /// Validates the request before it is sent.
    pub fn validate(&self) -> ProtocolResult<()> {
        require_non_empty("meeting_token", &self.meeting_token)?;
        require_non_empty("session_name", &self.session_name)?;
        if self.lifetime_secs == 0 || self.lifetime_secs > MAX_SESSION_LIFETIME_SECS {
            return Err(ProtocolError::invalid_field(
                "lifetime_secs",
                format!(
                    "{} is outside 1..={}",
                    self.lifetime_secs, MAX_SESSION_LIFETIME_SECS
                ),
            ));
        }
        Ok(())
    }
}

impl WireMessage for CreateSessionRequest {}

/// Id of a newly created session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    /// Created session.
    pub session_id: SessionId,
}

impl WireMessage for CreateSessionResponse {}

/// Long-poll request for rows newer than a watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRowsRequest {
    /// Meeting token.
    pub meeting_token: String,
    /// Session id.
    pub session_id: SessionId,
    /// Caller's client id.
    pub client_id: ClientId,
    /// Highest row version the caller has seen; zero requests everything.
    pub last_known_row_version: u64,
    /// How long the server may hold the request open.
    pub timeout_ms: u64,
    /// Allow serving from the server's short-lived row cache.
    pub cached: bool,
}

impl WireMessage for GetRowsRequest {}

/// Rows newer than the requested watermark, in version order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRowsResponse {
    /// Returned rows.
    pub rows: Vec<DataRow>,
}

impl GetRowsResponse {
    /// Creates a response.
    pub fn new(rows: Vec<DataRow>) -> Self {
        Self { rows }
    }

    /// Highest version among the returned rows.
    pub fn max_version(&self) -> Option<u64> {
        self.rows.iter().map(|r| r.version).max()
    }
}

impl WireMessage for GetRowsResponse {}

/// Submission of locally authored rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRowsRequest {
    /// Meeting token.
    pub meeting_token: String,
    /// Session id.
    pub session_id: SessionId,
    /// Caller's client id.
    pub client_id: ClientId,
    /// Rows in submission order.
    pub rows: Vec<DataRow>,
}

impl SendRowsRequest {
    /// Validates every row before the request is sent.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.rows.is_empty() {
            return Err(ProtocolError::invalid_field("rows", "must not be empty"));
        }
        self.rows.iter().try_for_each(DataRow::validate)
    }
}

impl WireMessage for SendRowsRequest {}

/// Versions and ids the server assigned to submitted rows.
///
/// Row `i` of the request received version `time_stamp_start + i` and id
/// `row_guids[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRowsResponse {
    /// Version of the first accepted row.
    pub time_stamp_start: u64,
    /// Ids of the accepted rows in submission order.
    pub row_guids: Vec<Uuid>,
}

impl SendRowsResponse {
    /// Returns the `(version, guid)` pair assigned to each row.
    ///
    /// Fails if the version range does not fit in a `u64`.
    pub fn assignments(&self) -> ProtocolResult<Vec<(u64, Uuid)>> {
        let start = self.time_stamp_start;
        self.row_guids
            .iter()
            .enumerate()
            .map(|(i, guid)| {
                let version = start.checked_add(i as u64).ok_or_else(|| {
                    ProtocolError::invalid_field(
                        "timeStampStart",
                        format!("version range starting at {start} overflows"),
                    )
                })?;
                Ok((version, *guid))
            })
            .collect()
    }
}

impl WireMessage for SendRowsResponse {}

/// Owner request to change the attendee list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifySessionRequest {
    /// Meeting token.
    pub meeting_token: String,
    /// Session id.
    pub session_id: SessionId,
    /// Owner secret.
    pub management_id: ManagementId,
    /// Attendees to invite.
    pub attendees_add: Vec<String>,
    /// Attendees to remove.
    pub attendees_remove: Vec<String>,
}

impl WireMessage for ModifySessionRequest {}

/// Owner request to wipe a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WipeSessionRequest {
    /// Meeting token.
    pub meeting_token: String,
    /// Session id.
    pub session_id: SessionId,
    /// Owner secret.
    pub management_id: ManagementId,
}

impl WireMessage for WipeSessionRequest {}

/// Owner request to list sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumSessionsRequest {
    /// Owner secret.
    pub management_id: ManagementId,
}

impl WireMessage for EnumSessionsRequest {}

/// Summary of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Session id.
    pub session_id: SessionId,
    /// Session name.
    pub session_name: String,
    /// Meeting token.
    pub meeting_token: String,
    /// Owner display name.
    pub owner_name: String,
    /// Owner e-mail.
    pub owner_email: String,
    /// Invited attendees.
    pub attendees: Vec<String>,
    /// Number of participants that joined.
    pub participant_count: u32,
    /// Number of rows stored.
    pub row_count: u64,
    /// Expiry, in seconds since the Unix epoch.
    pub expires_at_secs: u64,
}

/// Sessions owned by a management id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumSessionsResponse {
    /// Owned sessions.
    pub sessions: Vec<SessionInfo>,
}

impl WireMessage for EnumSessionsResponse {}

/// Empty success body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ack {}

impl WireMessage for Ack {}

/// Error body returned instead of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fault {
    /// HTTP-like status code (4xx client, 5xx server).
    pub status: u16,
    /// Error message.
    pub message: String,
}

impl Fault {
    /// Creates a fault.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Returns true for 5xx faults.
    pub fn is_server_fault(&self) -> bool {
        self.status >= 500
    }
}

impl WireMessage for Fault {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowAction;

    #[test]
    fn endpoint_paths_resolve() {
        for endpoint in Endpoint::ALL {
            assert_eq!(Endpoint::from_path(endpoint.path()), Some(endpoint));
        }
        assert_eq!(Endpoint::from_path("/smash/Unknown"), None);
    }

    #[test]
    fn get_rows_request_json() {
        let request = GetRowsRequest {
            meeting_token: "token".into(),
            session_id: SessionId(Uuid::nil()),
            client_id: ClientId(2),
            last_known_row_version: 50,
            timeout_ms: 30_000,
            cached: true,
        };
        let bytes = request.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["lastKnownRowVersion"], 50);
        assert_eq!(json["clientId"], 2);
        assert_eq!(GetRowsRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn send_rows_assignments() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let response = SendRowsResponse {
            time_stamp_start: 100,
            row_guids: vec![a, b],
        };
        assert_eq!(response.assignments().unwrap(), vec![(100, a), (101, b)]);
    }

    #[test]
    fn send_rows_assignments_reject_overflow() {
        let response = SendRowsResponse {
            time_stamp_start: u64::MAX,
            row_guids: vec![Uuid::new_v4(), Uuid::new_v4()],
        };
        assert!(matches!(
            response.assignments(),
            Err(ProtocolError::InvalidField {
                field: "timeStampStart",
                ..
            })
        ));

        let last = SendRowsResponse {
            time_stamp_start: u64::MAX,
            row_guids: vec![Uuid::nil()],
        };
        assert_eq!(last.assignments().unwrap(), vec![(u64::MAX, Uuid::nil())]);
    }

    #[test]
    fn send_rows_validation() {
        let mut request = SendRowsRequest {
            meeting_token: "token".into(),
            session_id: SessionId::new(),
            client_id: ClientId(1),
            rows: vec![],
        };
        assert!(request.validate().is_err());

        request
            .rows
            .push(DataRow::new(RowAction::Add, Uuid::new_v4(), 1, vec![1]));
        assert!(request.validate().is_ok());

        request.rows.push(DataRow::new(
            RowAction::Add,
            Uuid::new_v4(),
            1,
            vec![0; crate::MAX_ROW_PAYLOAD_BYTES + 1],
        ));
        assert!(matches!(
            request.validate(),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn create_session_lifetime_bounds() {
        let mut request = CreateSessionRequest {
            meeting_token: "token".into(),
            session_name: "standup".into(),
            owner_name: "Owner".into(),
            owner_email: "owner@example.com".into(),
            attendees: vec![],
            lifetime_secs: MAX_SESSION_LIFETIME_SECS,
            management_id: ManagementId::new(),
        };
        assert!(request.validate().is_ok());

        request.lifetime_secs = MAX_SESSION_LIFETIME_SECS + 1;
        assert!(request.validate().is_err());

        request.lifetime_secs = 0;
        assert!(request.validate().is_err());
    }

    #[test]
    fn join_requires_token() {
        let request = JoinSessionRequest::new("  ", "Ana", "ana@example.com", "laptop");
        assert!(request.validate().is_err());
        let request = JoinSessionRequest::new("abc", "Ana", "ana@example.com", "laptop");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn fault_classification() {
        assert!(Fault::new(503, "busy").is_server_fault());
        assert!(!Fault::new(404, "unknown session").is_server_fault());
        let decoded = Fault::decode(&Fault::new(400, "bad").encode().unwrap()).unwrap();
        assert_eq!(decoded.message, "bad");
    }
}
