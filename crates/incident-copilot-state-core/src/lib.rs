#![forbid(unsafe_code)]

use anyhow::Result;
use incident_copilot_domain::{
    AgentType, IncidentId, TransitionEvent, TransitionRow, WorkflowId, WorkflowState,
};

/// Durable storage for workflow snapshots and their append-only
/// transition log. The single source of truth shared by every component;
/// all implementations must provide single-writer semantics per workflow
/// via the version compare-and-swap in [`StateStore::commit_transition`].
pub trait StateStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// Insert a freshly created workflow at version 1.
    #[allow(clippy::missing_errors_doc)]
    fn insert_workflow(&self, state: &WorkflowState) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowState>>;

    /// The most recent run for the pair, terminal or not.
    #[allow(clippy::missing_errors_doc)]
    fn get_latest(
        &self,
        incident_id: &IncidentId,
        agent_type: AgentType,
    ) -> Result<Option<WorkflowState>>;

    /// The single active (non-terminal) run for the pair, if any.
    #[allow(clippy::missing_errors_doc)]
    fn get_active(
        &self,
        incident_id: &IncidentId,
        agent_type: AgentType,
    ) -> Result<Option<WorkflowState>>;

    /// Every non-terminal run, for the restart recovery pass.
    #[allow(clippy::missing_errors_doc)]
    fn list_active(&self) -> Result<Vec<WorkflowState>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_for_incident(&self, incident_id: &IncidentId) -> Result<Vec<WorkflowState>>;

    /// Atomically persist one transition: the snapshot update (guarded by
    /// `expected_version`) and the transition event either both commit or
    /// neither does. Returns the event's sequence number. A stale
    /// `expected_version` fails with a wrapped
    /// [`incident_copilot_domain::WorkflowError::Conflict`].
    #[allow(clippy::missing_errors_doc)]
    fn commit_transition(
        &self,
        state: &WorkflowState,
        expected_version: i64,
        event: &TransitionEvent,
    ) -> Result<i64>;

    /// Append the creation event for a run inserted via
    /// [`StateStore::insert_workflow`].
    #[allow(clippy::missing_errors_doc)]
    fn append_creation_event(&self, event: &TransitionEvent) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn list_transitions(&self, workflow_id: WorkflowId) -> Result<Vec<TransitionRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_transitions_for_incident(
        &self,
        incident_id: &IncidentId,
    ) -> Result<Vec<TransitionRow>>;

    /// Hash of the most recent transition event for a workflow, used to
    /// continue the hash chain across process restarts.
    #[allow(clippy::missing_errors_doc)]
    fn last_event_hash(&self, workflow_id: WorkflowId) -> Result<Option<String>>;
}
