//! In-memory session state.

use crate::error::{ServerError, ServerResult};
use parking_lot::{Condvar, Mutex};
use smash_protocol::{
    ClientId, CreateSessionRequest, DataRow, GetRowsRequest, JoinSessionRequest,
    JoinSessionResponse, ManagementId, ModifySessionRequest, SendRowsRequest, SendRowsResponse,
    SessionId, SessionInfo, WipeSessionRequest,
};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Counters describing the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Hosted sessions.
    pub sessions: usize,
    /// Rows held across all sessions.
    pub rows_stored: usize,
    /// GetRows calls answered from the recent-row window.
    pub cached_reads: u64,
    /// GetRows calls answered from the full row log.
    pub full_reads: u64,
    /// Version the next accepted row receives.
    pub next_version: u64,
}

/// One hosted session.
struct HostedSession {
    id: SessionId,
    name: String,
    meeting_token: String,
    owner_name: String,
    owner_email: String,
    attendees: Vec<String>,
    management_id: ManagementId,
    expires_at_secs: u64,
    /// (lowercased email, device) -> assigned id.
    participants: HashMap<(String, String), ClientId>,
    next_client_id: u32,
    /// Every accepted row in version order.
    rows: Vec<DataRow>,
    /// Tail of `rows` used for cached reads.
    recent: VecDeque<DataRow>,
    /// Version of the newest row no longer in `recent`.
    window_floor: u64,
}

impl HostedSession {
    fn is_expired(&self, now_secs: u64) -> bool {
        now_secs >= self.expires_at_secs
    }

    fn is_participant(&self, client_id: ClientId) -> bool {
        self.participants.values().any(|c| *c == client_id)
    }

    fn may_join(&self, email: &str) -> bool {
        self.attendees.is_empty()
            || self.owner_email.eq_ignore_ascii_case(email)
            || self.attendees.iter().any(|a| a.eq_ignore_ascii_case(email))
    }

    /// Rows newer than `watermark`, and whether the window served them.
    fn rows_after(&self, watermark: u64, cached: bool) -> (Vec<DataRow>, bool) {
        if cached && watermark >= self.window_floor {
            let rows = self
                .recent
                .iter()
                .filter(|r| r.version > watermark)
                .cloned()
                .collect();
            return (rows, true);
        }
        let start = self.rows.partition_point(|r| r.version <= watermark);
        (self.rows[start..].to_vec(), false)
    }

    fn push_row(&mut self, row: DataRow, window: usize) {
        self.rows.push(row.clone());
        self.recent.push_back(row);
        while self.recent.len() > window {
            if let Some(evicted) = self.recent.pop_front() {
                self.window_floor = evicted.version;
            }
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            session_name: self.name.clone(),
            meeting_token: self.meeting_token.clone(),
            owner_name: self.owner_name.clone(),
            owner_email: self.owner_email.clone(),
            attendees: self.attendees.clone(),
            participant_count: self.participants.len() as u32,
            row_count: self.rows.len() as u64,
            expires_at_secs: self.expires_at_secs,
        }
    }
}

struct StoreState {
    sessions: HashMap<SessionId, HostedSession>,
    tokens: HashMap<String, SessionId>,
    next_version: u64,
    cached_reads: u64,
    full_reads: u64,
}

impl StoreState {
    fn session_mut(
        &mut self,
        meeting_token: &str,
        session_id: SessionId,
    ) -> ServerResult<&mut HostedSession> {
        match self.tokens.get(meeting_token) {
            None => return Err(ServerError::UnknownToken),
            Some(id) if *id != session_id => return Err(ServerError::UnknownSession(session_id)),
            Some(_) => {}
        }
        self.sessions
            .get_mut(&session_id)
            .ok_or(ServerError::UnknownSession(session_id))
    }

    fn live_session_mut(
        &mut self,
        meeting_token: &str,
        session_id: SessionId,
        now_secs: u64,
    ) -> ServerResult<&mut HostedSession> {
        let session = self.session_mut(meeting_token, session_id)?;
        if session.is_expired(now_secs) {
            return Err(ServerError::SessionExpired(session_id));
        }
        Ok(session)
    }

    fn owned_session_mut(
        &mut self,
        meeting_token: &str,
        session_id: SessionId,
        management_id: ManagementId,
    ) -> ServerResult<&mut HostedSession> {
        let session = self.session_mut(meeting_token, session_id)?;
        if session.management_id != management_id {
            return Err(ServerError::NotAuthorized(
                "management id does not own this session".into(),
            ));
        }
        Ok(session)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Sessions, participants and row logs, shared by all handlers.
///
/// Versions come from one counter shared by every session, so they are
/// strictly increasing server-wide. GetRows callers wait on a condition
/// variable that is signalled whenever rows are appended or a session is
/// wiped.
pub struct SessionStore {
    state: Mutex<StoreState>,
    rows_changed: Condvar,
    cache_window: usize,
}

impl SessionStore {
    /// Creates an empty store keeping `cache_window` recent rows per session.
    pub fn new(cache_window: usize) -> Self {
        Self {
            state: Mutex::new(StoreState {
                sessions: HashMap::new(),
                tokens: HashMap::new(),
                next_version: 1,
                cached_reads: 0,
                full_reads: 0,
            }),
            rows_changed: Condvar::new(),
            cache_window,
        }
    }

    /// Creates a session.
    ///
    /// Fails if another session already uses the meeting token.
    pub fn create(&self, request: &CreateSessionRequest) -> ServerResult<SessionId> {
        let mut state = self.state.lock();
        if state.tokens.contains_key(&request.meeting_token) {
            return Err(ServerError::InvalidRequest(
                "meeting token is already in use".into(),
            ));
        }

        let id = SessionId::new();
        let session = HostedSession {
            id,
            name: request.session_name.clone(),
            meeting_token: request.meeting_token.clone(),
            owner_name: request.owner_name.clone(),
            owner_email: request.owner_email.clone(),
            attendees: request.attendees.clone(),
            management_id: request.management_id,
            expires_at_secs: now_secs().saturating_add(request.lifetime_secs),
            participants: HashMap::new(),
            next_client_id: 1,
            rows: Vec::new(),
            recent: VecDeque::new(),
            window_floor: 0,
        };
        state.tokens.insert(request.meeting_token.clone(), id);
        state.sessions.insert(id, session);
        Ok(id)
    }

    /// Adds a participant, or returns the id it already holds.
    ///
    /// `force_rejoin` always assigns a fresh id.
    pub fn join(&self, request: &JoinSessionRequest) -> ServerResult<JoinSessionResponse> {
        let mut state = self.state.lock();
        let session_id = *state
            .tokens
            .get(&request.meeting_token)
            .ok_or(ServerError::UnknownToken)?;
        let session = state.live_session_mut(&request.meeting_token, session_id, now_secs())?;

        if !session.may_join(&request.user_email) {
            return Err(ServerError::NotAuthorized(format!(
                "{} is not an attendee",
                request.user_email
            )));
        }

        let key = (
            request.user_email.to_lowercase(),
            request.device_name.clone(),
        );
        let client_id = match session.participants.get(&key) {
            Some(existing) if !request.force_rejoin => *existing,
            _ => {
                let assigned = ClientId(session.next_client_id);
                session.next_client_id += 1;
                session.participants.insert(key, assigned);
                assigned
            }
        };

        Ok(JoinSessionResponse {
            session_id,
            client_id,
        })
    }

    /// Returns rows newer than the caller's watermark.
    ///
    /// Blocks for up to `hold` while there is nothing new. An empty result
    /// means the hold ran out.
    pub fn rows_since(
        &self,
        request: &GetRowsRequest,
        hold: Duration,
    ) -> ServerResult<Vec<DataRow>> {
        let deadline = Instant::now() + hold;
        let mut state = self.state.lock();
        loop {
            let session =
                state.live_session_mut(&request.meeting_token, request.session_id, now_secs())?;
            if !session.is_participant(request.client_id) {
                return Err(ServerError::NotAuthorized(format!(
                    "{} has not joined this session",
                    request.client_id
                )));
            }

            let (rows, from_cache) =
                session.rows_after(request.last_known_row_version, request.cached);
            if !rows.is_empty() || Instant::now() >= deadline {
                if from_cache {
                    state.cached_reads += 1;
                } else {
                    state.full_reads += 1;
                }
                return Ok(rows);
            }

            self.rows_changed.wait_until(&mut state, deadline);
        }
    }

    /// Appends rows and assigns them consecutive versions.
    ///
    /// The stored rows carry the caller as creator regardless of what
    /// the request claimed.
    pub fn append(&self, request: SendRowsRequest) -> ServerResult<SendRowsResponse> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let start = state.next_version;
        let session =
            state.live_session_mut(&request.meeting_token, request.session_id, now_secs())?;
        if !session.is_participant(request.client_id) {
            return Err(ServerError::NotAuthorized(format!(
                "{} has not joined this session",
                request.client_id
            )));
        }

        let mut row_guids = Vec::with_capacity(request.rows.len());
        for (offset, mut row) in request.rows.into_iter().enumerate() {
            row.version = start + offset as u64;
            row.creator = request.client_id;
            row_guids.push(row.guid);
            session.push_row(row, self.cache_window);
        }
        state.next_version = start + row_guids.len() as u64;
        drop(guard);

        self.rows_changed.notify_all();
        Ok(SendRowsResponse {
            time_stamp_start: start,
            row_guids,
        })
    }

    /// Adds and removes attendees.
    pub fn modify(&self, request: &ModifySessionRequest) -> ServerResult<()> {
        let mut state = self.state.lock();
        let session = state.owned_session_mut(
            &request.meeting_token,
            request.session_id,
            request.management_id,
        )?;

        for attendee in &request.attendees_add {
            if !session
                .attendees
                .iter()
                .any(|a| a.eq_ignore_ascii_case(attendee))
            {
                session.attendees.push(attendee.clone());
            }
        }
        session.attendees.retain(|a| {
            !request
                .attendees_remove
                .iter()
                .any(|r| r.eq_ignore_ascii_case(a))
        });
        Ok(())
    }

    /// Deletes every row and participant of a session.
    ///
    /// Waiting GetRows calls wake up and fail, since their callers are no
    /// longer participants.
    pub fn wipe(&self, request: &WipeSessionRequest) -> ServerResult<()> {
        let mut state = self.state.lock();
        let session = state.owned_session_mut(
            &request.meeting_token,
            request.session_id,
            request.management_id,
        )?;
        session.rows.clear();
        session.recent.clear();
        session.window_floor = 0;
        session.participants.clear();
        drop(state);

        self.rows_changed.notify_all();
        Ok(())
    }

    /// Lists sessions owned by `management_id`, ordered by name.
    pub fn enumerate(&self, management_id: ManagementId) -> Vec<SessionInfo> {
        let state = self.state.lock();
        let mut sessions: Vec<SessionInfo> = state
            .sessions
            .values()
            .filter(|s| s.management_id == management_id)
            .map(HostedSession::info)
            .collect();
        sessions.sort_by(|a, b| {
            a.session_name
                .cmp(&b.session_name)
                .then_with(|| a.session_id.0.cmp(&b.session_id.0))
        });
        sessions
    }

    /// Returns current counters.
    pub fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        StoreStats {
            sessions: state.sessions.len(),
            rows_stored: state.sessions.values().map(|s| s.rows.len()).sum(),
            cached_reads: state.cached_reads,
            full_reads: state.full_reads,
            next_version: state.next_version,
        }
    }
}
