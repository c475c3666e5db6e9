#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use incident_copilot_domain::{
    format_rfc3339, now_utc, parse_rfc3339, AgentType, IncidentId, PendingAction, TransitionEvent,
    TransitionRow, WorkflowError, WorkflowId, WorkflowState, WorkflowStep,
};
use incident_copilot_state_core::StateStore;
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;

const STATE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_states (
  workflow_id TEXT PRIMARY KEY,
  incident_id TEXT NOT NULL,
  agent_type TEXT NOT NULL CHECK (agent_type IN ('triage','resolution')),
  current_step TEXT NOT NULL CHECK (current_step IN (
    'initialized','retrieving_context','context_retrieved','calling_llm',
    'llm_completed','validating','validation_complete','policy_evaluating',
    'policy_evaluated','paused_for_review','resumed_from_review','storing',
    'completed','rejected','cancelled','error'
  )),
  state_data_json TEXT NOT NULL,
  pending_action_json TEXT,
  version INTEGER NOT NULL CHECK (version >= 1),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK ((current_step = 'paused_for_review') = (pending_action_json IS NOT NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_workflow_states_one_active
  ON workflow_states(incident_id, agent_type)
  WHERE current_step NOT IN ('completed','rejected','cancelled','error');

CREATE INDEX IF NOT EXISTS idx_workflow_states_incident
  ON workflow_states(incident_id, created_at);

CREATE TABLE IF NOT EXISTS workflow_transitions (
  transition_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  workflow_id TEXT NOT NULL,
  incident_id TEXT NOT NULL,
  agent_type TEXT NOT NULL,
  from_step TEXT,
  to_step TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  actor_type TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  detail_json TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL,
  FOREIGN KEY (workflow_id) REFERENCES workflow_states(workflow_id)
);

CREATE INDEX IF NOT EXISTS idx_transitions_workflow_seq
  ON workflow_transitions(workflow_id, transition_seq);
CREATE INDEX IF NOT EXISTS idx_transitions_incident_seq
  ON workflow_transitions(incident_id, transition_seq);

CREATE TRIGGER IF NOT EXISTS trg_workflow_transitions_no_update
BEFORE UPDATE ON workflow_transitions
BEGIN
  SELECT RAISE(FAIL, 'workflow_transitions is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_workflow_transitions_no_delete
BEFORE DELETE ON workflow_transitions
BEGIN
  SELECT RAISE(FAIL, 'workflow_transitions is append-only');
END;
";

pub struct SqliteStateStore {
    conn: Connection,
}

impl SqliteStateStore {
    /// Open or create a `SQLite` state database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }
}

impl StateStore for SqliteStateStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply state schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STATE_SCHEMA_VERSION, now],
            )
            .context("failed to record state migration")?;

        Ok(())
    }

    fn insert_workflow(&self, state: &WorkflowState) -> Result<()> {
        state.validate()?;
        self.conn
            .execute(
                "INSERT INTO workflow_states(
                    workflow_id, incident_id, agent_type, current_step,
                    state_data_json, pending_action_json, version, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    state.workflow_id.to_string(),
                    state.incident_id.as_str(),
                    state.agent_type.as_str(),
                    state.current_step.as_str(),
                    serde_json::to_string(&state.state_data)?,
                    state
                        .pending_action
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    state.version,
                    format_rfc3339(state.created_at)?,
                    format_rfc3339(state.updated_at)?,
                ],
            )
            .context("failed to insert workflow state")?;
        Ok(())
    }

    fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowState>> {
        self.conn
            .query_row(
                &format!("{SELECT_STATE} WHERE workflow_id = ?1"),
                params![workflow_id.to_string()],
                row_to_state,
            )
            .optional()
            .context("failed to load workflow state")
    }

    fn get_latest(
        &self,
        incident_id: &IncidentId,
        agent_type: AgentType,
    ) -> Result<Option<WorkflowState>> {
        self.conn
            .query_row(
                &format!(
                    "{SELECT_STATE} WHERE incident_id = ?1 AND agent_type = ?2
                     ORDER BY created_at DESC, workflow_id DESC LIMIT 1"
                ),
                params![incident_id.as_str(), agent_type.as_str()],
                row_to_state,
            )
            .optional()
            .context("failed to load latest workflow state")
    }

    fn get_active(
        &self,
        incident_id: &IncidentId,
        agent_type: AgentType,
    ) -> Result<Option<WorkflowState>> {
        self.conn
            .query_row(
                &format!(
                    "{SELECT_STATE} WHERE incident_id = ?1 AND agent_type = ?2
                       AND current_step NOT IN ('completed','rejected','cancelled','error')"
                ),
                params![incident_id.as_str(), agent_type.as_str()],
                row_to_state,
            )
            .optional()
            .context("failed to load active workflow state")
    }

    fn list_active(&self) -> Result<Vec<WorkflowState>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_STATE}
             WHERE current_step NOT IN ('completed','rejected','cancelled','error')
             ORDER BY created_at ASC, workflow_id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_state)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn list_for_incident(&self, incident_id: &IncidentId) -> Result<Vec<WorkflowState>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_STATE} WHERE incident_id = ?1
             ORDER BY created_at ASC, workflow_id ASC"
        ))?;
        let rows = stmt.query_map(params![incident_id.as_str()], row_to_state)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn commit_transition(
        &self,
        state: &WorkflowState,
        expected_version: i64,
        event: &TransitionEvent,
    ) -> Result<i64> {
        state.validate()?;
        if state.version != expected_version + 1 {
            return Err(anyhow!(
                "commit version {} does not follow expected version {expected_version}",
                state.version
            ));
        }

        let tx = self.conn.unchecked_transaction()?;

        let changes = tx
            .execute(
                "UPDATE workflow_states SET
                    current_step = ?2,
                    state_data_json = ?3,
                    pending_action_json = ?4,
                    version = ?5,
                    updated_at = ?6
                 WHERE workflow_id = ?1 AND version = ?7",
                params![
                    state.workflow_id.to_string(),
                    state.current_step.as_str(),
                    serde_json::to_string(&state.state_data)?,
                    state
                        .pending_action
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    state.version,
                    format_rfc3339(state.updated_at)?,
                    expected_version,
                ],
            )
            .context("failed to update workflow state")?;

        if changes == 0 {
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM workflow_states WHERE workflow_id = ?1",
                params![state.workflow_id.to_string()],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(anyhow!("unknown workflow {}", state.workflow_id));
            }
            return Err(anyhow::Error::new(WorkflowError::Conflict {
                workflow_id: state.workflow_id,
                expected: expected_version,
            }));
        }

        let seq = insert_transition(&tx, event)?;
        tx.commit().context("failed to commit transition")?;
        Ok(seq)
    }

    fn append_creation_event(&self, event: &TransitionEvent) -> Result<i64> {
        insert_transition(&self.conn, event)
    }

    fn list_transitions(&self, workflow_id: WorkflowId) -> Result<Vec<TransitionRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_TRANSITION} WHERE workflow_id = ?1 ORDER BY transition_seq ASC"
        ))?;
        let rows = stmt.query_map(params![workflow_id.to_string()], row_to_transition)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn list_transitions_for_incident(
        &self,
        incident_id: &IncidentId,
    ) -> Result<Vec<TransitionRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_TRANSITION} WHERE incident_id = ?1 ORDER BY transition_seq ASC"
        ))?;
        let rows = stmt.query_map(params![incident_id.as_str()], row_to_transition)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn last_event_hash(&self, workflow_id: WorkflowId) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT event_hash FROM workflow_transitions
                 WHERE workflow_id = ?1 ORDER BY transition_seq DESC LIMIT 1",
                params![workflow_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load last event hash")
    }
}

const SELECT_STATE: &str = "SELECT workflow_id, incident_id, agent_type, current_step,
    state_data_json, pending_action_json, version, created_at, updated_at
 FROM workflow_states";

const SELECT_TRANSITION: &str = "SELECT transition_seq, event_id, workflow_id, incident_id,
    agent_type, from_step, to_step, occurred_at, recorded_at, actor_type, actor_id,
    detail_json, payload_hash, prev_event_hash, event_hash
 FROM workflow_transitions";

fn insert_transition(conn: &Connection, event: &TransitionEvent) -> Result<i64> {
    conn.execute(
        "INSERT INTO workflow_transitions(
            event_id, workflow_id, incident_id, agent_type, from_step, to_step,
            occurred_at, recorded_at, actor_type, actor_id,
            detail_json, payload_hash, prev_event_hash, event_hash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            event.event_id.to_string(),
            event.workflow_id.to_string(),
            event.incident_id.as_str(),
            event.agent_type.as_str(),
            event.from_step.map(WorkflowStep::as_str),
            event.to_step.as_str(),
            format_rfc3339(event.occurred_at)?,
            format_rfc3339(event.recorded_at)?,
            event.actor_type,
            event.actor_id,
            serde_json::to_string(&event.detail_json)?,
            event.payload_hash,
            event.prev_event_hash,
            event.event_hash,
        ],
    )
    .context("failed to append transition event")?;
    Ok(conn.last_insert_rowid())
}

fn invalid_data(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn parse_ulid(column: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_str(raw).map_err(|err| invalid_data(column, format!("invalid ULID: {err}")))
}

fn parse_step(column: usize, raw: &str) -> rusqlite::Result<WorkflowStep> {
    WorkflowStep::parse(raw)
        .ok_or_else(|| invalid_data(column, format!("invalid workflow step: {raw}")))
}

fn parse_timestamp(
    column: usize,
    raw: &str,
) -> rusqlite::Result<incident_copilot_domain::DateTimeUtc> {
    parse_rfc3339(raw).map_err(|err| invalid_data(column, err.to_string()))
}

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowState> {
    let workflow_id_raw: String = row.get(0)?;
    let incident_id_raw: String = row.get(1)?;
    let agent_type_raw: String = row.get(2)?;
    let current_step_raw: String = row.get(3)?;
    let state_data_raw: String = row.get(4)?;
    let pending_action_raw: Option<String> = row.get(5)?;
    let version: i64 = row.get(6)?;
    let created_at_raw: String = row.get(7)?;
    let updated_at_raw: String = row.get(8)?;

    let agent_type = AgentType::parse(&agent_type_raw)
        .ok_or_else(|| invalid_data(2, format!("invalid agent_type: {agent_type_raw}")))?;
    let state_data = serde_json::from_str(&state_data_raw)
        .map_err(|err| invalid_data(4, format!("invalid state_data_json: {err}")))?;
    let pending_action: Option<PendingAction> = pending_action_raw
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|err| invalid_data(5, format!("invalid pending_action_json: {err}")))?;

    Ok(WorkflowState {
        workflow_id: WorkflowId(parse_ulid(0, &workflow_id_raw)?),
        incident_id: IncidentId::new(incident_id_raw),
        agent_type,
        current_step: parse_step(3, &current_step_raw)?,
        state_data,
        pending_action,
        version,
        created_at: parse_timestamp(7, &created_at_raw)?,
        updated_at: parse_timestamp(8, &updated_at_raw)?,
    })
}

fn row_to_transition(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransitionRow> {
    let transition_seq: i64 = row.get(0)?;
    let event_id_raw: String = row.get(1)?;
    let workflow_id_raw: String = row.get(2)?;
    let incident_id_raw: String = row.get(3)?;
    let agent_type_raw: String = row.get(4)?;
    let from_step_raw: Option<String> = row.get(5)?;
    let to_step_raw: String = row.get(6)?;
    let occurred_at_raw: String = row.get(7)?;
    let recorded_at_raw: String = row.get(8)?;
    let actor_type: String = row.get(9)?;
    let actor_id: String = row.get(10)?;
    let detail_raw: String = row.get(11)?;
    let payload_hash: String = row.get(12)?;
    let prev_event_hash: Option<String> = row.get(13)?;
    let event_hash: String = row.get(14)?;

    let agent_type = AgentType::parse(&agent_type_raw)
        .ok_or_else(|| invalid_data(4, format!("invalid agent_type: {agent_type_raw}")))?;
    let from_step = from_step_raw
        .as_deref()
        .map(|raw| parse_step(5, raw))
        .transpose()?;
    let detail_json = serde_json::from_str(&detail_raw)
        .map_err(|err| invalid_data(11, format!("invalid detail_json: {err}")))?;

    Ok(TransitionRow {
        transition_seq,
        event: TransitionEvent {
            event_id: parse_ulid(1, &event_id_raw)?,
            workflow_id: WorkflowId(parse_ulid(2, &workflow_id_raw)?),
            incident_id: IncidentId::new(incident_id_raw),
            agent_type,
            from_step,
            to_step: parse_step(6, &to_step_raw)?,
            occurred_at: parse_timestamp(7, &occurred_at_raw)?,
            recorded_at: parse_timestamp(8, &recorded_at_raw)?,
            actor_type,
            actor_id,
            detail_json,
            payload_hash,
            prev_event_hash,
            event_hash,
        },
    })
}
