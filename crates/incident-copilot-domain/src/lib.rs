#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WorkflowId(pub Ulid);

impl WorkflowId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one pause instance. A fresh name is minted every time a
/// workflow suspends, so a response can be correlated to the exact pause
/// that issued it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ActionName(pub Ulid);

impl ActionName {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ActionName {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Foreign reference to the incident being processed. Opaque and
/// caller-supplied; the orchestration layer never generates these.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IncidentId(pub String);

impl IncidentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IncidentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Triage,
    Resolution,
}

impl AgentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::Resolution => "resolution",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "triage" => Some(Self::Triage),
            "resolution" => Some(Self::Resolution),
            _ => None,
        }
    }

    #[must_use]
    pub fn review_kind(self) -> PendingActionKind {
        match self {
            Self::Triage => PendingActionKind::ReviewTriage,
            Self::Resolution => PendingActionKind::ReviewResolution,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The workflow state machine. Linear states advance only on confirmed
/// completion of the corresponding external call; `retrieving_context`,
/// `calling_llm` and `storing` are attempt markers committed before the
/// call they name, which is what makes recovery re-drive an unconfirmed
/// step instead of assuming it succeeded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Initialized,
    RetrievingContext,
    ContextRetrieved,
    CallingLlm,
    LlmCompleted,
    Validating,
    ValidationComplete,
    PolicyEvaluating,
    PolicyEvaluated,
    PausedForReview,
    ResumedFromReview,
    Storing,
    Completed,
    Rejected,
    Cancelled,
    Error,
}

impl WorkflowStep {
    pub const ALL: [Self; 16] = [
        Self::Initialized,
        Self::RetrievingContext,
        Self::ContextRetrieved,
        Self::CallingLlm,
        Self::LlmCompleted,
        Self::Validating,
        Self::ValidationComplete,
        Self::PolicyEvaluating,
        Self::PolicyEvaluated,
        Self::PausedForReview,
        Self::ResumedFromReview,
        Self::Storing,
        Self::Completed,
        Self::Rejected,
        Self::Cancelled,
        Self::Error,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::RetrievingContext => "retrieving_context",
            Self::ContextRetrieved => "context_retrieved",
            Self::CallingLlm => "calling_llm",
            Self::LlmCompleted => "llm_completed",
            Self::Validating => "validating",
            Self::ValidationComplete => "validation_complete",
            Self::PolicyEvaluating => "policy_evaluating",
            Self::PolicyEvaluated => "policy_evaluated",
            Self::PausedForReview => "paused_for_review",
            Self::ResumedFromReview => "resumed_from_review",
            Self::Storing => "storing",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == value)
    }

    /// Terminal states permit no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::Cancelled | Self::Error
        )
    }

    /// The forward successors of a step, excluding `error` and
    /// `cancelled`, which are reachable from every non-terminal step.
    #[must_use]
    pub fn forward_successors(self) -> &'static [Self] {
        match self {
            Self::Initialized => &[Self::RetrievingContext],
            Self::RetrievingContext => &[Self::ContextRetrieved],
            Self::ContextRetrieved => &[Self::CallingLlm],
            Self::CallingLlm => &[Self::LlmCompleted],
            Self::LlmCompleted => &[Self::Validating],
            Self::Validating => &[Self::ValidationComplete],
            Self::ValidationComplete => &[Self::PolicyEvaluating],
            Self::PolicyEvaluating => &[Self::PolicyEvaluated],
            Self::PolicyEvaluated => &[Self::PausedForReview, Self::Storing],
            Self::PausedForReview => &[Self::ResumedFromReview, Self::Rejected],
            Self::ResumedFromReview => &[Self::Storing],
            Self::Storing => &[Self::Completed],
            Self::Completed | Self::Rejected | Self::Cancelled | Self::Error => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Self::Error | Self::Cancelled) {
            return true;
        }
        self.forward_successors().contains(&next)
    }
}

impl std::fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PolicyBand {
    Auto,
    Propose,
    Review,
}

impl PolicyBand {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Propose => "propose",
            Self::Review => "review",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::Auto),
            "propose" => Some(Self::Propose),
            "review" => Some(Self::Review),
            _ => None,
        }
    }
}

impl std::fmt::Display for PolicyBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub severity: Severity,
    pub confidence: f64,
    pub summary: String,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub summary: String,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceItem {
    pub source: String,
    pub reference: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceSet {
    pub items: Vec<EvidenceItem>,
    #[serde(with = "time::serde::rfc3339")]
    pub retrieved_at: DateTimeUtc,
}

impl EvidenceSet {
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PolicyDecision {
    pub policy_band: PolicyBand,
    pub can_auto_apply: bool,
    pub requires_approval: bool,
    pub notification_required: bool,
    pub rollback_required: bool,
    pub policy_reason: String,
}

impl PolicyDecision {
    /// Build a decision whose derived booleans agree with the band. The
    /// band/approval biconditional holds by construction:
    /// AUTO ⇒ auto-apply and no approval; PROPOSE/REVIEW ⇒ approval.
    #[must_use]
    pub fn from_band(
        policy_band: PolicyBand,
        notification_required: bool,
        rollback_required: bool,
        policy_reason: impl Into<String>,
    ) -> Self {
        let can_auto_apply = policy_band == PolicyBand::Auto;
        Self {
            policy_band,
            can_auto_apply,
            requires_approval: !can_auto_apply,
            notification_required,
            rollback_required,
            policy_reason: policy_reason.into(),
        }
    }

    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let auto = self.policy_band == PolicyBand::Auto;
        self.can_auto_apply == auto && self.requires_approval == !auto
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PendingActionKind {
    ReviewTriage,
    ReviewResolution,
}

impl PendingActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReviewTriage => "review_triage",
            Self::ReviewResolution => "review_resolution",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "review_triage" => Some(Self::ReviewTriage),
            "review_resolution" => Some(Self::ReviewResolution),
            _ => None,
        }
    }
}

impl std::fmt::Display for PendingActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted human checkpoint. Present on a workflow if and only if the
/// workflow is at `paused_for_review`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingAction {
    pub action_name: ActionName,
    pub action_type: PendingActionKind,
    pub payload: Value,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

/// A reviewer's answer to a pending action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResponse {
    pub action_name: ActionName,
    pub approved: bool,
    #[serde(default)]
    pub user_edited: Option<Value>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub policy_band_override: Option<PolicyBand>,
    pub responded_by: String,
}

/// Audit record of a reviewer explicitly overriding the automatic policy
/// band. Kept distinct from the original `PolicyDecision`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HumanOverrideRecord {
    pub original_band: PolicyBand,
    pub override_band: PolicyBand,
    pub responded_by: String,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub decided_at: DateTimeUtc,
}

/// One workflow run for an (incident, agent type) pair.
///
/// Everything outside `state_data` is the fixed envelope the orchestration
/// layer owns; `state_data` is a JSON object the engine writes well-known
/// keys into and otherwise stores and forwards without interpreting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub incident_id: IncidentId,
    pub agent_type: AgentType,
    pub current_step: WorkflowStep,
    pub state_data: Value,
    pub pending_action: Option<PendingAction>,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
}

impl WorkflowState {
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        incident_id: IncidentId,
        agent_type: AgentType,
        state_data: Value,
    ) -> Self {
        let now = now_utc();
        Self {
            workflow_id,
            incident_id,
            agent_type,
            current_step: WorkflowStep::Initialized,
            state_data,
            pending_action: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.current_step.is_terminal()
    }

    /// Check structural invariants before a write.
    ///
    /// # Errors
    /// Returns an error when `state_data` is not a JSON object, the
    /// version is below 1, or the pending action does not agree with the
    /// paused step.
    pub fn validate(&self) -> Result<()> {
        if !self.state_data.is_object() {
            return Err(anyhow!("state_data MUST be a JSON object"));
        }
        if self.version < 1 {
            return Err(anyhow!("version MUST be >= 1, got {}", self.version));
        }
        let paused = self.current_step == WorkflowStep::PausedForReview;
        if paused != self.pending_action.is_some() {
            return Err(anyhow!(
                "pending_action MUST be present exactly when paused_for_review (step: {})",
                self.current_step
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn data(&self, key: &str) -> Option<&Value> {
        self.state_data.get(key)
    }

    /// Insert or replace a well-known key in `state_data`.
    ///
    /// # Errors
    /// Returns an error when `state_data` is not a JSON object.
    pub fn insert_data(&mut self, key: &str, value: Value) -> Result<()> {
        let object = self
            .state_data
            .as_object_mut()
            .ok_or_else(|| anyhow!("state_data MUST be a JSON object"))?;
        object.insert(key.to_string(), value);
        Ok(())
    }

    /// Remember an action name that was issued and is no longer the
    /// active pending action. Responses naming it are stale, not merely
    /// mis-timed.
    ///
    /// # Errors
    /// Returns an error when `state_data` is not a JSON object.
    pub fn record_consumed_action(&mut self, action_name: ActionName) -> Result<()> {
        let object = self
            .state_data
            .as_object_mut()
            .ok_or_else(|| anyhow!("state_data MUST be a JSON object"))?;
        let entry = object
            .entry("consumed_actions".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        let list = entry
            .as_array_mut()
            .ok_or_else(|| anyhow!("consumed_actions MUST be a JSON array"))?;
        list.push(Value::String(action_name.to_string()));
        Ok(())
    }

    #[must_use]
    pub fn action_was_consumed(&self, action_name: ActionName) -> bool {
        let needle = action_name.to_string();
        self.data("consumed_actions")
            .and_then(Value::as_array)
            .is_some_and(|list| {
                list.iter()
                    .any(|entry| entry.as_str() == Some(needle.as_str()))
            })
    }
}

/// One committed transition in the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionEvent {
    pub event_id: Ulid,
    pub workflow_id: WorkflowId,
    pub incident_id: IncidentId,
    pub agent_type: AgentType,
    pub from_step: Option<WorkflowStep>,
    pub to_step: WorkflowStep,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: DateTimeUtc,
    pub actor_type: String,
    pub actor_id: String,
    pub detail_json: Value,
    pub payload_hash: String,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRow {
    pub transition_seq: i64,
    pub event: TransitionEvent,
}

/// Build a hash-chained transition event.
///
/// # Errors
/// Returns an error when the event material cannot be serialized.
#[allow(clippy::too_many_arguments)]
pub fn build_transition_event(
    workflow_id: WorkflowId,
    incident_id: &IncidentId,
    agent_type: AgentType,
    from_step: Option<WorkflowStep>,
    to_step: WorkflowStep,
    actor_type: &str,
    actor_id: &str,
    detail_json: Value,
    prev_event_hash: Option<String>,
) -> Result<TransitionEvent> {
    let occurred_at = now_utc();
    let recorded_at = occurred_at;
    let payload_hash = hash_json(&detail_json)?;
    let event_id = Ulid::new();

    let material = serde_json::json!({
        "event_id": event_id,
        "workflow_id": workflow_id,
        "incident_id": incident_id,
        "agent_type": agent_type,
        "from_step": from_step,
        "to_step": to_step,
        "occurred_at": format_rfc3339(occurred_at)?,
        "recorded_at": format_rfc3339(recorded_at)?,
        "actor_type": actor_type,
        "actor_id": actor_id,
        "payload_hash": payload_hash,
        "prev_event_hash": prev_event_hash,
    });
    let event_hash = hash_json(&material)?;

    Ok(TransitionEvent {
        event_id,
        workflow_id,
        incident_id: incident_id.clone(),
        agent_type,
        from_step,
        to_step,
        occurred_at,
        recorded_at,
        actor_type: actor_type.to_string(),
        actor_id: actor_id.to_string(),
        detail_json,
        payload_hash,
        prev_event_hash,
        event_hash,
    })
}

/// The typed error taxonomy. Operational code wraps these in
/// `anyhow::Error`; callers recover them with `downcast_ref`.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WorkflowError {
    #[error("external {stage} call failed: {message}")]
    ExternalCall { stage: String, message: String },
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: WorkflowStep,
        to: WorkflowStep,
    },
    #[error("response references action {submitted}, which is not the active pending action")]
    StaleAction { submitted: ActionName },
    #[error("workflow is not paused for review (current step: {current})")]
    NotPaused { current: WorkflowStep },
    #[error("write conflict for workflow {workflow_id}: version {expected} is no longer current")]
    Conflict {
        workflow_id: WorkflowId,
        expected: i64,
    },
    #[error("an active {agent_type} workflow already exists for incident {incident_id}")]
    ActiveExists {
        incident_id: IncidentId,
        agent_type: AgentType,
    },
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Render a timestamp as RFC3339 for persistence and hashing.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

/// Parse an RFC3339 timestamp.
///
/// # Errors
/// Returns an error when the input is not valid RFC3339.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 timestamp: {err}"))
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

#[must_use]
pub fn empty_state_data() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::{
        build_transition_event, empty_state_data, ActionName, AgentType, IncidentId, PolicyBand,
        PolicyDecision, WorkflowId, WorkflowState, WorkflowStep,
    };
    use serde_json::json;

    #[test]
    fn step_codec_round_trips() {
        for step in WorkflowStep::ALL {
            assert_eq!(WorkflowStep::parse(step.as_str()), Some(step));
        }
        assert_eq!(WorkflowStep::parse("no_such_step"), None);
    }

    #[test]
    fn terminal_steps_permit_no_transitions() {
        for step in WorkflowStep::ALL {
            if step.is_terminal() {
                for next in WorkflowStep::ALL {
                    assert!(
                        !step.can_transition_to(next),
                        "{step} must not transition to {next}"
                    );
                }
            }
        }
    }

    #[test]
    fn error_and_cancelled_reachable_from_every_non_terminal_step() {
        for step in WorkflowStep::ALL {
            if !step.is_terminal() {
                assert!(step.can_transition_to(WorkflowStep::Error));
                assert!(step.can_transition_to(WorkflowStep::Cancelled));
            }
        }
    }

    #[test]
    fn gating_step_cannot_be_skipped() {
        // The only ways out of the policy decision point are the pause or
        // the store; completion is never directly reachable.
        assert!(!WorkflowStep::PolicyEvaluated.can_transition_to(WorkflowStep::Completed));
        assert!(!WorkflowStep::PolicyEvaluating.can_transition_to(WorkflowStep::Storing));
        assert!(WorkflowStep::PolicyEvaluated.can_transition_to(WorkflowStep::PausedForReview));
        assert!(WorkflowStep::PolicyEvaluated.can_transition_to(WorkflowStep::Storing));
        // A paused workflow resumes or is rejected; it never stores the
        // draft without passing through the resume step.
        assert!(!WorkflowStep::PausedForReview.can_transition_to(WorkflowStep::Storing));
        assert!(WorkflowStep::PausedForReview.can_transition_to(WorkflowStep::ResumedFromReview));
        assert!(WorkflowStep::PausedForReview.can_transition_to(WorkflowStep::Rejected));
    }

    #[test]
    fn linear_prefix_is_single_successor() {
        let linear = [
            WorkflowStep::Initialized,
            WorkflowStep::RetrievingContext,
            WorkflowStep::ContextRetrieved,
            WorkflowStep::CallingLlm,
            WorkflowStep::LlmCompleted,
            WorkflowStep::Validating,
            WorkflowStep::ValidationComplete,
            WorkflowStep::PolicyEvaluating,
        ];
        for step in linear {
            assert_eq!(step.forward_successors().len(), 1, "{step}");
        }
    }

    #[test]
    fn policy_decision_from_band_is_consistent_for_every_band() {
        for band in [PolicyBand::Auto, PolicyBand::Propose, PolicyBand::Review] {
            let decision = PolicyDecision::from_band(band, false, false, "test");
            assert!(decision.is_consistent(), "band {band}");
            assert_eq!(decision.can_auto_apply, band == PolicyBand::Auto);
            assert_eq!(decision.requires_approval, band != PolicyBand::Auto);
        }
    }

    #[test]
    fn validate_rejects_pending_action_mismatch() {
        let mut state = WorkflowState::new(
            WorkflowId::new(),
            IncidentId::new("INC-1"),
            AgentType::Triage,
            empty_state_data(),
        );
        assert!(state.validate().is_ok());

        state.current_step = WorkflowStep::PausedForReview;
        assert!(state.validate().is_err());
    }

    #[test]
    fn consumed_actions_are_remembered() {
        let mut state = WorkflowState::new(
            WorkflowId::new(),
            IncidentId::new("INC-2"),
            AgentType::Triage,
            empty_state_data(),
        );
        let first = ActionName::new();
        let second = ActionName::new();
        assert!(state.record_consumed_action(first).is_ok());
        assert!(state.action_was_consumed(first));
        assert!(!state.action_was_consumed(second));
    }

    #[test]
    fn transition_event_chain_links_previous_hash() {
        let workflow_id = WorkflowId::new();
        let incident_id = IncidentId::new("INC-3");
        let first = build_transition_event(
            workflow_id,
            &incident_id,
            AgentType::Triage,
            None,
            WorkflowStep::Initialized,
            "system",
            "engine",
            json!({"note": "created"}),
            None,
        );
        assert!(first.is_ok());
        let first = first.unwrap_or_else(|_| unreachable!());
        assert!(first.prev_event_hash.is_none());
        assert!(!first.event_hash.is_empty());

        let second = build_transition_event(
            workflow_id,
            &incident_id,
            AgentType::Triage,
            Some(WorkflowStep::Initialized),
            WorkflowStep::RetrievingContext,
            "system",
            "engine",
            json!({}),
            Some(first.event_hash.clone()),
        );
        assert!(second.is_ok());
        let second = second.unwrap_or_else(|_| unreachable!());
        assert_eq!(second.prev_event_hash.as_deref(), Some(first.event_hash.as_str()));
        assert_ne!(second.event_hash, first.event_hash);
    }
}
