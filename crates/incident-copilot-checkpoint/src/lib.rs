#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use incident_copilot_domain::{
    now_utc, ActionName, ActionResponse, AgentType, HumanOverrideRecord, IncidentId, PendingAction,
    PolicyBand, WorkflowError, WorkflowState, WorkflowStep,
};
use incident_copilot_state_core::StateStore;
use serde_json::Value;

/// Creates and resolves human checkpoints. The engine owns the actual
/// state writes; this component owns the pause protocol — fresh action
/// names, response correlation, and the stale/not-paused distinction.
pub struct CheckpointManager<'a> {
    store: &'a dyn StateStore,
}

/// The validated outcome of a response, ready for the engine to apply.
#[derive(Debug, Clone)]
pub struct ResolvedCheckpoint {
    pub state: WorkflowState,
    pub action: PendingAction,
    pub approved: bool,
    pub merged_draft: Option<Value>,
    pub human_override: Option<HumanOverrideRecord>,
}

impl<'a> CheckpointManager<'a> {
    #[must_use]
    pub fn new(store: &'a dyn StateStore) -> Self {
        Self { store }
    }

    /// Materialize a pending action for a workflow about to suspend. The
    /// action name is fresh, distinct from every name previously issued
    /// for this workflow. The payload carries what a reviewer needs to
    /// render a decision: the draft under review and the policy decision
    /// that forced the pause.
    #[must_use]
    pub fn materialize(
        &self,
        state: &WorkflowState,
        draft: Value,
        policy_decision: Value,
        description: impl Into<String>,
    ) -> PendingAction {
        PendingAction {
            action_name: ActionName::new(),
            action_type: state.agent_type.review_kind(),
            payload: serde_json::json!({
                "draft": draft,
                "policy_decision": policy_decision,
            }),
            description: description.into(),
            created_at: now_utc(),
        }
    }

    /// Look up the paused workflow for the pair and validate a response
    /// against its pending action.
    ///
    /// # Errors
    /// Fails with [`WorkflowError::NotPaused`] when the workflow is not at
    /// `paused_for_review`, or [`WorkflowError::StaleAction`] when the
    /// submitted name is not the active pending action (including names
    /// that were already consumed by an earlier response or cancellation).
    /// Neither failure mutates any state.
    pub fn resolve(
        &self,
        incident_id: &IncidentId,
        agent_type: AgentType,
        response: &ActionResponse,
    ) -> Result<ResolvedCheckpoint> {
        let state = self
            .store
            .get_latest(incident_id, agent_type)?
            .ok_or_else(|| anyhow!("no {agent_type} workflow found for incident {incident_id}"))?;

        if state.current_step != WorkflowStep::PausedForReview {
            // A name this workflow issued and later invalidated is stale,
            // not merely mis-timed.
            if state.action_was_consumed(response.action_name) {
                return Err(anyhow::Error::new(WorkflowError::StaleAction {
                    submitted: response.action_name,
                }));
            }
            return Err(anyhow::Error::new(WorkflowError::NotPaused {
                current: state.current_step,
            }));
        }

        let action = state
            .pending_action
            .clone()
            .ok_or_else(|| anyhow!("paused workflow {} has no pending action", state.workflow_id))?;

        if action.action_name != response.action_name {
            return Err(anyhow::Error::new(WorkflowError::StaleAction {
                submitted: response.action_name,
            }));
        }

        let merged_draft = response.user_edited.as_ref().map(|edits| {
            let draft = action.payload.get("draft").cloned().unwrap_or(Value::Null);
            merge_draft(&draft, edits)
        });

        let human_override = match response.policy_band_override {
            Some(override_band) => Some(HumanOverrideRecord {
                original_band: original_band_of(&action)?,
                override_band,
                responded_by: response.responded_by.clone(),
                notes: response.notes.clone(),
                decided_at: now_utc(),
            }),
            None => None,
        };

        Ok(ResolvedCheckpoint {
            state,
            action,
            approved: response.approved,
            merged_draft,
            human_override,
        })
    }
}

fn original_band_of(action: &PendingAction) -> Result<PolicyBand> {
    let raw = action
        .payload
        .get("policy_decision")
        .and_then(|decision| decision.get("policy_band"))
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("pending action payload is missing policy_decision.policy_band"))?;
    PolicyBand::parse(raw).ok_or_else(|| anyhow!("invalid policy band in pending action: {raw}"))
}

/// Overlay reviewer edits onto the draft. Objects merge key-by-key
/// (reviewer keys win, recursively); any other value replaces the draft
/// field wholesale.
#[must_use]
pub fn merge_draft(draft: &Value, edits: &Value) -> Value {
    match (draft, edits) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                let replacement = match merged.get(key) {
                    Some(existing) => merge_draft(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), replacement);
            }
            Value::Object(merged)
        }
        _ => edits.clone(),
    }
}
