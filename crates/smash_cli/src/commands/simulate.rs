//! Simulate command implementation.

use serde::{Deserialize, Serialize};
use smash_engine::{
    HttpResponse, HttpTransport, LoopbackClient, ManagementClient, Record, SaveHandle, Session,
    SessionConfig, SessionStats, SessionTransport, Table, ADD_COST, CHANGE_UNIT_LIMIT,
};
use smash_protocol::{CreateSessionRequest, JoinSessionRequest, ManagementId};
use smash_server::{CoordinationServer, ServerConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const MEETING_TOKEN: &str = "simulation";
const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Note {
    author: String,
    index: usize,
}

/// Per-participant outcome.
#[derive(Debug, Serialize)]
pub struct ClientReport {
    /// Participant name.
    pub name: String,
    /// Server-assigned client id.
    pub client_id: u32,
    /// Records in the participant's table.
    pub records: usize,
    /// Records still awaiting confirmation.
    pub pending: usize,
    /// Highest version received from the network.
    pub watermark: u64,
    /// Session counters.
    pub stats: SessionStats,
}

/// Outcome of a simulation run.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Records every table should hold.
    pub expected_records: usize,
    /// Whether every table reached the expected state.
    pub converged: bool,
    /// Time from the first join until convergence or give-up.
    pub elapsed_ms: u128,
    /// Per-participant results.
    pub clients: Vec<ClientReport>,
    /// Rows held by the server.
    pub server_rows: usize,
    /// Server reads answered from the recent-row window.
    pub cached_reads: u64,
    /// Server reads answered from the full row log.
    pub full_reads: u64,
}

/// Runs the simulate command.
pub fn run(
    clients: usize,
    records: usize,
    refresh_ms: Option<u64>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if clients == 0 {
        return Err("at least one client is required".into());
    }

    let report = simulate(clients, records, refresh_ms)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    if !report.converged {
        return Err("participants did not converge".into());
    }
    Ok(())
}

fn loopback(server: &Arc<CoordinationServer>) -> Arc<dyn SessionTransport> {
    let server = Arc::clone(server);
    let client = LoopbackClient::new(move |path: &str, body: &[u8]| {
        let (status, body) = server.handle_post(path, body);
        HttpResponse::new(status, body)
    });
    Arc::new(HttpTransport::new("http://loopback", client))
}

fn session_config(refresh_ms: Option<u64>) -> SessionConfig {
    let config = SessionConfig::new("http://loopback")
        .with_long_poll_timeout(Duration::from_secs(1))
        .with_timeout_margin(Duration::from_secs(2))
        .with_poll_backoff(Duration::from_millis(100));
    match refresh_ms {
        Some(ms) => config.with_refresh_interval(Duration::from_millis(ms)),
        None => config,
    }
}

struct Participant {
    name: String,
    session: Session,
    table: Arc<Table<Note>>,
}

impl Participant {
    /// Adds `count` records, splitting them across as many change contexts
    /// as the change budget requires.
    fn add_notes(&self, count: usize) -> Result<Vec<SaveHandle>, Box<dyn std::error::Error>> {
        let per_context = (CHANGE_UNIT_LIMIT / ADD_COST) as usize;
        let mut handles = Vec::new();
        let mut index = 0;
        while index < count {
            let batch_end = count.min(index + per_context);
            let mut ctx = self.session.change_context(&self.table)?;
            for i in index..batch_end {
                ctx.add(Record::new(Note {
                    author: self.name.clone(),
                    index: i,
                }))?;
            }
            handles.push(ctx.save_changes()?);
            index = batch_end;
        }
        Ok(handles)
    }

    fn is_settled(&self, expected: usize) -> bool {
        self.table.len() == expected && self.table.iter().all(|r| !r.is_pending())
    }

    fn report(&self) -> ClientReport {
        ClientReport {
            name: self.name.clone(),
            client_id: self.session.participant().client_id.0,
            records: self.table.len(),
            pending: self.table.iter().filter(|r| r.is_pending()).count(),
            watermark: self.session.last_known_row_version(),
            stats: self.session.stats(),
        }
    }
}

fn simulate(
    clients: usize,
    records: usize,
    refresh_ms: Option<u64>,
) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    let server = Arc::new(CoordinationServer::new(ServerConfig::default()));
    let owner = ManagementClient::new(loopback(&server), ManagementId::new());
    owner.create_session(CreateSessionRequest {
        meeting_token: MEETING_TOKEN.into(),
        session_name: "simulate".into(),
        owner_name: "simulator".into(),
        owner_email: "owner@simulation.local".into(),
        attendees: Vec::new(),
        lifetime_secs: 3_600,
        management_id: owner.management_id(),
    })?;

    let started = Instant::now();
    let config = session_config(refresh_ms);
    let mut participants = Vec::with_capacity(clients);
    for n in 0..clients {
        let name = format!("participant-{n}");
        let email = format!("{name}@simulation.local");
        let request = JoinSessionRequest::new(MEETING_TOKEN, name.clone(), email, "cli");
        let session = Session::join(loopback(&server), config.clone(), &request)?;
        let table = session.join_table::<Note>("notes")?;
        participants.push(Participant {
            name,
            session,
            table,
        });
    }

    let mut handles = Vec::new();
    for participant in &participants {
        handles.extend(participant.add_notes(records)?);
    }
    for handle in handles {
        handle.wait()?;
    }
    info!(clients, records, "all saves confirmed");

    let expected_records = clients * records;
    let deadline = started + CONVERGENCE_TIMEOUT;
    let converged = loop {
        if participants.iter().all(|p| p.is_settled(expected_records)) {
            break true;
        }
        if Instant::now() >= deadline {
            break false;
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    let elapsed_ms = started.elapsed().as_millis();

    let server_stats = server.stats();
    Ok(SimulationReport {
        expected_records,
        converged,
        elapsed_ms,
        clients: participants.iter().map(Participant::report).collect(),
        server_rows: server_stats.rows_stored,
        cached_reads: server_stats.cached_reads,
        full_reads: server_stats.full_reads,
    })
}

fn print_text_output(report: &SimulationReport) {
    let outcome = if report.converged {
        "converged"
    } else {
        "did not converge"
    };
    println!(
        "Simulation {} in {} ms ({} records expected per table)",
        outcome, report.elapsed_ms, report.expected_records
    );
    println!("================");
    println!();

    for client in &report.clients {
        println!(
            "{:16} client-{:<4} records={} pending={} watermark={}",
            client.name, client.client_id, client.records, client.pending, client.watermark
        );
        let stats = &client.stats;
        println!(
            "{:16} polls={} received={} applied={} duplicates={} resyncs={} timeouts={} abandoned={}",
            "",
            stats.polls,
            stats.rows_received,
            stats.rows_applied,
            stats.duplicates_dropped,
            stats.resyncs,
            stats.timeouts,
            stats.abandoned_polls
        );
    }

    println!();
    println!(
        "Server: {} rows, {} cached reads, {} full reads",
        report.server_rows, report.cached_reads, report.full_reads
    );
}
