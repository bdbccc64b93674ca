//! Transport layer abstraction for the coordination service.

use crate::error::{SmashError, SmashResult};
use parking_lot::{Condvar, Mutex};
use smash_protocol::{
    ClientId, CreateSessionRequest, CreateSessionResponse, EnumSessionsRequest,
    EnumSessionsResponse, GetRowsRequest, GetRowsResponse, JoinSessionRequest,
    JoinSessionResponse, ModifySessionRequest, SendRowsRequest, SendRowsResponse, SessionId,
    WipeSessionRequest,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A transport carries requests to the coordination service.
///
/// Calls are blocking; the session runs them off its async runtime and
/// enforces deadlines around them.
pub trait SessionTransport: Send + Sync {
    /// Joins a session.
    fn join_session(&self, request: &JoinSessionRequest) -> SmashResult<JoinSessionResponse>;

    /// Creates a session.
    fn create_session(&self, request: &CreateSessionRequest)
        -> SmashResult<CreateSessionResponse>;

    /// Fetches rows newer than the request watermark, holding the call open
    /// up to the requested timeout.
    fn get_rows(&self, request: &GetRowsRequest) -> SmashResult<GetRowsResponse>;

    /// Called when the caller stops waiting on a GetRows call.
    ///
    /// Transports that can interrupt a held-open request should do so here.
    /// The default does nothing and lets the call run to completion.
    fn cancel_get_rows(&self) {}

    /// Submits rows.
    fn send_rows(&self, request: &SendRowsRequest) -> SmashResult<SendRowsResponse>;

    /// Changes a session's attendee list.
    fn modify_session(&self, request: &ModifySessionRequest) -> SmashResult<()>;

    /// Deletes all rows and participants of a session.
    fn wipe_session(&self, request: &WipeSessionRequest) -> SmashResult<()>;

    /// Lists sessions owned by a management id.
    fn enum_sessions(&self, request: &EnumSessionsRequest) -> SmashResult<EnumSessionsResponse>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport.
    fn close(&self) -> SmashResult<()>;
}

/// Scripted reply to a GetRows call on a [`MockTransport`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with these rows.
    Rows(GetRowsResponse),
    /// Fail with a retryable transport error.
    Fail(String),
    /// Block for the duration, then answer with no rows.
    Stall(Duration),
}

/// A mock transport for testing.
///
/// GetRows replies are taken from a script; once it runs dry the mock
/// answers with no rows after a short idle delay. SendRows assigns
/// consecutive versions and echoes the submitted ids.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    join_response: Mutex<JoinSessionResponse>,
    replies: Mutex<VecDeque<MockReply>>,
    idle_delay: Mutex<Duration>,
    get_requests: Mutex<Vec<GetRowsRequest>>,
    sent: Mutex<Vec<SendRowsRequest>>,
    send_failure: Mutex<Option<String>>,
    next_version: AtomicU64,
    cancels: Mutex<u64>,
    cancelled: Condvar,
}

impl MockTransport {
    /// Creates a mock that assigns versions starting at 1.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            join_response: Mutex::new(JoinSessionResponse {
                session_id: SessionId::new(),
                client_id: ClientId(1),
            }),
            replies: Mutex::new(VecDeque::new()),
            idle_delay: Mutex::new(Duration::from_millis(5)),
            get_requests: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            send_failure: Mutex::new(None),
            next_version: AtomicU64::new(1),
            cancels: Mutex::new(0),
            cancelled: Condvar::new(),
        }
    }

    /// Sets the join response.
    pub fn set_join_response(&self, response: JoinSessionResponse) {
        *self.join_response.lock() = response;
    }

    /// Queues a GetRows reply.
    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    /// Sets the delay of an unscripted empty GetRows reply.
    pub fn set_idle_delay(&self, delay: Duration) {
        *self.idle_delay.lock() = delay;
    }

    /// Makes every SendRows call fail with the given message.
    pub fn fail_sends(&self, message: Option<String>) {
        *self.send_failure.lock() = message;
    }

    /// Sets the version the next accepted row receives.
    pub fn set_next_version(&self, version: u64) {
        self.next_version.store(version, Ordering::SeqCst);
    }

    /// GetRows requests observed so far.
    pub fn get_requests(&self) -> Vec<GetRowsRequest> {
        self.get_requests.lock().clone()
    }

    /// SendRows requests observed so far.
    pub fn sent_requests(&self) -> Vec<SendRowsRequest> {
        self.sent.lock().clone()
    }

    /// Number of GetRows calls the caller gave up on.
    pub fn cancelled_calls(&self) -> u64 {
        *self.cancels.lock()
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> SmashResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SmashError::NotConnected)
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTransport for MockTransport {
    fn join_session(&self, _request: &JoinSessionRequest) -> SmashResult<JoinSessionResponse> {
        self.ensure_connected()?;
        Ok(*self.join_response.lock())
    }

    fn create_session(
        &self,
        _request: &CreateSessionRequest,
    ) -> SmashResult<CreateSessionResponse> {
        self.ensure_connected()?;
        Ok(CreateSessionResponse {
            session_id: SessionId::new(),
        })
    }

    fn get_rows(&self, request: &GetRowsRequest) -> SmashResult<GetRowsResponse> {
        self.ensure_connected()?;
        self.get_requests.lock().push(request.clone());

        let reply = self.replies.lock().pop_front();
        match reply {
            Some(MockReply::Rows(response)) => Ok(response),
            Some(MockReply::Fail(message)) => Err(SmashError::transport_retryable(message)),
            Some(MockReply::Stall(delay)) => {
                let deadline = Instant::now() + delay;
                let mut cancels = self.cancels.lock();
                let seen = *cancels;
                while *cancels == seen {
                    if self.cancelled.wait_until(&mut cancels, deadline).timed_out() {
                        return Ok(GetRowsResponse::new(Vec::new()));
                    }
                }
                Err(SmashError::Aborted)
            }
            None => {
                let delay = *self.idle_delay.lock();
                std::thread::sleep(delay);
                Ok(GetRowsResponse::new(Vec::new()))
            }
        }
    }

    fn cancel_get_rows(&self) {
        *self.cancels.lock() += 1;
        self.cancelled.notify_all();
    }

    fn send_rows(&self, request: &SendRowsRequest) -> SmashResult<SendRowsResponse> {
        self.ensure_connected()?;
        if let Some(message) = self.send_failure.lock().clone() {
            return Err(SmashError::transport_retryable(message));
        }
        self.sent.lock().push(request.clone());

        let count = request.rows.len() as u64;
        let start = self.next_version.fetch_add(count, Ordering::SeqCst);
        Ok(SendRowsResponse {
            time_stamp_start: start,
            row_guids: request.rows.iter().map(|row| row.guid).collect(),
        })
    }

    fn modify_session(&self, _request: &ModifySessionRequest) -> SmashResult<()> {
        self.ensure_connected()
    }

    fn wipe_session(&self, _request: &WipeSessionRequest) -> SmashResult<()> {
        self.ensure_connected()
    }

    fn enum_sessions(&self, _request: &EnumSessionsRequest) -> SmashResult<EnumSessionsResponse> {
        self.ensure_connected()?;
        Ok(EnumSessionsResponse {
            sessions: Vec::new(),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SmashResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smash_protocol::{DataRow, RowAction};
    use uuid::Uuid;

    fn get_rows_request(last: u64) -> GetRowsRequest {
        GetRowsRequest {
            meeting_token: "token".into(),
            session_id: SessionId::new(),
            client_id: ClientId(1),
            last_known_row_version: last,
            timeout_ms: 0,
            cached: false,
        }
    }

    #[test]
    fn mock_transport_connection() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());

        transport.set_connected(false);
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.get_rows(&get_rows_request(0)),
            Err(SmashError::NotConnected)
        ));

        transport.set_connected(true);
        transport.close().unwrap();
        assert!(!transport.is_connected());
    }

    #[test]
    fn scripted_replies_then_idle() {
        let transport = MockTransport::new();
        transport.set_idle_delay(Duration::ZERO);
        transport.push_reply(MockReply::Fail("boom".into()));

        let first = transport.get_rows(&get_rows_request(0));
        assert!(matches!(first, Err(SmashError::Transport { retryable: true, .. })));

        let second = transport.get_rows(&get_rows_request(7)).unwrap();
        assert!(second.rows.is_empty());

        let seen: Vec<u64> = transport
            .get_requests()
            .iter()
            .map(|r| r.last_known_row_version)
            .collect();
        assert_eq!(seen, vec![0, 7]);
    }

    #[test]
    fn send_rows_assigns_consecutive_versions() {
        let transport = MockTransport::new();
        transport.set_next_version(40);
        let rows: Vec<DataRow> = (0..3)
            .map(|_| DataRow::new(RowAction::Add, Uuid::new_v4(), 1, vec![0]))
            .collect();
        let request = SendRowsRequest {
            meeting_token: "token".into(),
            session_id: SessionId::new(),
            client_id: ClientId(1),
            rows: rows.clone(),
        };

        let response = transport.send_rows(&request).unwrap();
        let assigned = response.assignments().unwrap();
        assert_eq!(assigned[0], (40, rows[0].guid));
        assert_eq!(assigned[2], (42, rows[2].guid));
        assert_eq!(transport.sent_requests().len(), 1);
    }
}
