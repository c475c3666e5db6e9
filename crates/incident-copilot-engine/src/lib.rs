#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use incident_copilot_checkpoint::CheckpointManager;
use incident_copilot_domain::{
    build_transition_event, empty_state_data, format_rfc3339, hash_json, now_utc, ActionResponse,
    AgentType, Classification, EvidenceItem, EvidenceSet, IncidentId, PolicyBand, PolicyDecision,
    Recommendation, WorkflowError, WorkflowId, WorkflowState, WorkflowStep,
};
use incident_copilot_policy::{decide, PolicyThresholds};
use incident_copilot_publisher::{StatePublisher, Subscription};
use incident_copilot_reasoner::{ReasonerAdapter, ReasonerBinding, ReasonerRequest};
use incident_copilot_state_core::StateStore;
use serde_json::{json, Value};

/// Supplies supporting material for an incident. Opaque to the engine
/// beyond being storable and countable.
pub trait EvidenceRetriever {
    #[allow(clippy::missing_errors_doc)]
    fn retrieve(
        &self,
        incident_id: &IncidentId,
        incident: &Value,
        timeout_ms: u64,
    ) -> Result<EvidenceSet>;
}

/// Fixture-backed retriever keyed by incident id. Unknown incidents get
/// an empty evidence set.
#[derive(Debug, Clone, Default)]
pub struct StaticEvidenceRetriever {
    by_incident: BTreeMap<String, Vec<EvidenceItem>>,
}

impl StaticEvidenceRetriever {
    #[must_use]
    pub fn with_items(by_incident: BTreeMap<String, Vec<EvidenceItem>>) -> Self {
        Self { by_incident }
    }
}

impl EvidenceRetriever for StaticEvidenceRetriever {
    fn retrieve(
        &self,
        incident_id: &IncidentId,
        _incident: &Value,
        _timeout_ms: u64,
    ) -> Result<EvidenceSet> {
        Ok(EvidenceSet {
            items: self
                .by_incident
                .get(incident_id.as_str())
                .cloned()
                .unwrap_or_default(),
            retrieved_at: now_utc(),
        })
    }
}

/// Durable system of record for finished triage/resolution results.
/// `commit` must be idempotent under retry.
pub trait OutputStore {
    #[allow(clippy::missing_errors_doc)]
    fn commit(&self, incident_id: &IncidentId, agent_type: AgentType, document: &Value)
        -> Result<()>;
}

/// In-memory output store for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingOutputStore {
    committed: Mutex<Vec<(IncidentId, AgentType, Value)>>,
}

impl RecordingOutputStore {
    #[must_use]
    pub fn committed(&self) -> Vec<(IncidentId, AgentType, Value)> {
        match self.committed.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl OutputStore for RecordingOutputStore {
    fn commit(
        &self,
        incident_id: &IncidentId,
        agent_type: AgentType,
        document: &Value,
    ) -> Result<()> {
        let mut guard = match self.committed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Replace an earlier commit for the same pair rather than
        // duplicating it.
        guard.retain(|(id, agent, _)| !(id == incident_id && *agent == agent_type));
        guard.push((incident_id.clone(), agent_type, document.clone()));
        Ok(())
    }
}

/// Writes one canonical JSON file per (incident, agent type); rewriting
/// the same file on retry keeps the commit idempotent.
#[derive(Debug, Clone)]
pub struct DirectoryOutputStore {
    root: PathBuf,
}

impl DirectoryOutputStore {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl OutputStore for DirectoryOutputStore {
    fn commit(
        &self,
        incident_id: &IncidentId,
        agent_type: AgentType,
        document: &Value,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let sanitized: String = incident_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path = self
            .root
            .join(format!("{sanitized}-{}.json", agent_type.as_str()));
        std::fs::write(&path, serde_json::to_string_pretty(document)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub thresholds: PolicyThresholds,
    pub binding: ReasonerBinding,
    pub retrieval_timeout_ms: u64,
    pub reasoner_timeout_ms: u64,
    pub engine_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thresholds: PolicyThresholds::default(),
            binding: ReasonerBinding::default(),
            retrieval_timeout_ms: 10_000,
            reasoner_timeout_ms: 30_000,
            engine_version: "incident-copilot.v0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub workflow_id: Option<WorkflowId>,
    /// Cancel an existing active run for the pair instead of failing with
    /// `ActiveExists`.
    pub supersede: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    AwaitingReview,
    Resumed { final_step: WorkflowStep },
    Failed { message: String },
}

#[derive(Debug, Clone)]
pub struct RecoverySummary {
    pub workflow_id: WorkflowId,
    pub incident_id: IncidentId,
    pub agent_type: AgentType,
    pub outcome: RecoveryOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineReport {
    pub workflow_id: WorkflowId,
    pub events: usize,
    pub chain_valid: bool,
}

/// Drives incidents through the triage/resolution state machine.
///
/// The engine is stateless between calls: every decision is derived from
/// the persisted snapshot, every transition is a compare-and-swap commit,
/// and suspension is purely logical — a paused run is nothing but its row
/// in the state store until a response arrives.
pub struct WorkflowEngine<'a> {
    store: &'a dyn StateStore,
    retriever: &'a dyn EvidenceRetriever,
    reasoner: &'a dyn ReasonerAdapter,
    output_store: &'a dyn OutputStore,
    publisher: &'a StatePublisher,
    config: EngineConfig,
}

impl<'a> WorkflowEngine<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn StateStore,
        retriever: &'a dyn EvidenceRetriever,
        reasoner: &'a dyn ReasonerAdapter,
        output_store: &'a dyn OutputStore,
        publisher: &'a StatePublisher,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            retriever,
            reasoner,
            output_store,
            publisher,
            config,
        }
    }

    /// Create a run for the pair and drive it to its first suspension
    /// point (pause, terminal state, or error).
    ///
    /// # Errors
    /// Fails with [`WorkflowError::ActiveExists`] when an active run
    /// already exists and supersession was not requested, or with
    /// [`WorkflowError::ExternalCall`] when a collaborator call fails (the
    /// run is then persisted at `error`).
    pub fn start_workflow(
        &self,
        incident_id: &IncidentId,
        agent_type: AgentType,
        incident: Value,
        options: StartOptions,
    ) -> Result<WorkflowState> {
        if let Some(active) = self.store.get_active(incident_id, agent_type)? {
            if !options.supersede {
                return Err(anyhow::Error::new(WorkflowError::ActiveExists {
                    incident_id: incident_id.clone(),
                    agent_type,
                }));
            }
            self.cancel_run(active, "superseded", "system", "engine")?;
        }

        let workflow_id = options.workflow_id.unwrap_or_default();
        let mut state = WorkflowState::new(
            workflow_id,
            incident_id.clone(),
            agent_type,
            empty_state_data(),
        );
        state.insert_data("incident", incident)?;
        state.validate()?;
        self.store.insert_workflow(&state)?;

        let event = build_transition_event(
            state.workflow_id,
            incident_id,
            agent_type,
            None,
            WorkflowStep::Initialized,
            "system",
            "engine",
            json!({"engine_version": self.config.engine_version}),
            None,
        )?;
        self.store.append_creation_event(&event)?;
        tracing::info!(
            workflow_id = %state.workflow_id,
            incident_id = %incident_id,
            agent_type = %agent_type,
            "workflow created"
        );
        self.publisher.publish(&state);

        self.run_to_suspension(state)
    }

    /// Latest run snapshot for the pair, terminal or not.
    ///
    /// # Errors
    /// Fails only on storage errors.
    pub fn get_state(
        &self,
        incident_id: &IncidentId,
        agent_type: AgentType,
    ) -> Result<Option<WorkflowState>> {
        self.store.get_latest(incident_id, agent_type)
    }

    /// Attach a live observer. The subscription is seeded with the latest
    /// snapshot of every run for the incident before any delta can reach
    /// it.
    ///
    /// # Errors
    /// Fails only on storage errors.
    pub fn subscribe(&self, incident_id: &IncidentId) -> Result<Subscription> {
        let mut snapshot = Vec::new();
        for agent_type in [AgentType::Triage, AgentType::Resolution] {
            if let Some(state) = self.store.get_latest(incident_id, agent_type)? {
                snapshot.push(state);
            }
        }
        Ok(self.publisher.subscribe(incident_id, snapshot))
    }

    /// Apply a reviewer response to a paused run.
    ///
    /// Approval merges any edits into the draft, resumes, and drives the
    /// run to completion; rejection terminates the run in `rejected`
    /// without committing the draft anywhere.
    ///
    /// # Errors
    /// Fails with [`WorkflowError::StaleAction`] / [`WorkflowError::NotPaused`]
    /// per the checkpoint protocol, with the workflow left untouched.
    pub fn respond_to_action(
        &self,
        incident_id: &IncidentId,
        agent_type: AgentType,
        response: &ActionResponse,
    ) -> Result<WorkflowState> {
        let checkpoints = CheckpointManager::new(self.store);
        let resolved = checkpoints.resolve(incident_id, agent_type, response)?;
        let mut state = resolved.state;

        state.insert_data("review", serde_json::to_value(response)?)?;
        if let Some(record) = &resolved.human_override {
            state.insert_data("human_override", serde_json::to_value(record)?)?;
            tracing::info!(
                workflow_id = %state.workflow_id,
                original_band = %record.original_band,
                override_band = %record.override_band,
                responded_by = %record.responded_by,
                "policy band overridden by reviewer"
            );
        }

        if resolved.approved {
            if let Some(merged) = &resolved.merged_draft {
                if let Some(classification) = merged.get("classification") {
                    state.insert_data("classification", classification.clone())?;
                }
                if let Some(recommendation) = merged.get("recommendation") {
                    state.insert_data("recommendation", recommendation.clone())?;
                }
            }
            self.commit(
                &mut state,
                WorkflowStep::ResumedFromReview,
                json!({
                    "action_name": resolved.action.action_name.to_string(),
                    "approved": true,
                    "responded_by": response.responded_by,
                    "edited": resolved.merged_draft.is_some(),
                }),
                "human",
                &response.responded_by,
            )?;
            self.run_to_suspension(state)
        } else {
            self.commit(
                &mut state,
                WorkflowStep::Rejected,
                json!({
                    "action_name": resolved.action.action_name.to_string(),
                    "approved": false,
                    "responded_by": response.responded_by,
                    "notes": response.notes,
                }),
                "human",
                &response.responded_by,
            )?;
            Ok(state)
        }
    }

    /// Cancel the active run for the pair, whatever its current step.
    ///
    /// # Errors
    /// Fails when no active run exists or on storage errors.
    pub fn cancel(
        &self,
        incident_id: &IncidentId,
        agent_type: AgentType,
        reason: &str,
    ) -> Result<WorkflowState> {
        let state = self
            .store
            .get_active(incident_id, agent_type)?
            .ok_or_else(|| {
                anyhow!("no active {agent_type} workflow for incident {incident_id}")
            })?;
        self.cancel_run(state, reason, "caller", "cancel")
    }

    /// Restart recovery: re-drive every non-terminal run. Paused runs
    /// stay paused, awaiting their response; anything persisted at an
    /// attempt marker gets its unconfirmed step re-driven.
    ///
    /// # Errors
    /// Fails only on storage errors; per-run failures are reported in the
    /// summaries (the runs end up at `error`).
    pub fn recover(&self) -> Result<Vec<RecoverySummary>> {
        let active = self.store.list_active()?;
        let mut summaries = Vec::with_capacity(active.len());

        for state in active {
            let workflow_id = state.workflow_id;
            let incident_id = state.incident_id.clone();
            let agent_type = state.agent_type;

            let outcome = if state.current_step == WorkflowStep::PausedForReview {
                RecoveryOutcome::AwaitingReview
            } else {
                match self.run_to_suspension(state) {
                    Ok(finished) => RecoveryOutcome::Resumed {
                        final_step: finished.current_step,
                    },
                    Err(err) => RecoveryOutcome::Failed {
                        message: err.to_string(),
                    },
                }
            };

            tracing::info!(
                workflow_id = %workflow_id,
                incident_id = %incident_id,
                outcome = ?outcome,
                "recovery pass handled workflow"
            );
            summaries.push(RecoverySummary {
                workflow_id,
                incident_id,
                agent_type,
                outcome,
            });
        }

        Ok(summaries)
    }

    /// Verify the transition log hash chain for a run.
    ///
    /// # Errors
    /// Fails only on storage errors.
    pub fn verify_timeline(&self, workflow_id: WorkflowId) -> Result<TimelineReport> {
        let rows = self.store.list_transitions(workflow_id)?;
        let mut prev: Option<String> = None;
        for row in &rows {
            if row.event.prev_event_hash != prev {
                return Ok(TimelineReport {
                    workflow_id,
                    events: rows.len(),
                    chain_valid: false,
                });
            }
            prev = Some(row.event.event_hash.clone());
        }
        Ok(TimelineReport {
            workflow_id,
            events: rows.len(),
            chain_valid: true,
        })
    }

    /// Advance a run until it suspends: pause, terminal state, or error.
    #[allow(clippy::too_many_lines)]
    fn run_to_suspension(&self, mut state: WorkflowState) -> Result<WorkflowState> {
        loop {
            match state.current_step {
                WorkflowStep::Initialized => {
                    self.commit(
                        &mut state,
                        WorkflowStep::RetrievingContext,
                        json!({}),
                        "system",
                        "engine",
                    )?;
                }
                WorkflowStep::RetrievingContext => {
                    let incident = state.data("incident").cloned().unwrap_or(Value::Null);
                    match self.retriever.retrieve(
                        &state.incident_id,
                        &incident,
                        self.config.retrieval_timeout_ms,
                    ) {
                        Ok(evidence) => {
                            let detail = json!({"evidence_items": evidence.item_count()});
                            state.insert_data("evidence", serde_json::to_value(&evidence)?)?;
                            self.commit(
                                &mut state,
                                WorkflowStep::ContextRetrieved,
                                detail,
                                "system",
                                "engine",
                            )?;
                        }
                        Err(err) => return self.fail(state, "retrieval", &err.to_string()),
                    }
                }
                WorkflowStep::ContextRetrieved => {
                    self.commit(
                        &mut state,
                        WorkflowStep::CallingLlm,
                        json!({"model_id": self.config.binding.model_id}),
                        "system",
                        "engine",
                    )?;
                }
                WorkflowStep::CallingLlm => {
                    let request = match self.build_reasoner_request(&state) {
                        Ok(request) => request,
                        Err(err) => return self.fail(state, "reasoning", &err.to_string()),
                    };
                    match self.drive_reasoning(&mut state, &request) {
                        Ok(detail) => {
                            self.commit(
                                &mut state,
                                WorkflowStep::LlmCompleted,
                                detail,
                                "system",
                                "engine",
                            )?;
                        }
                        Err(err) => return self.fail(state, "reasoning", &err.to_string()),
                    }
                }
                WorkflowStep::LlmCompleted => {
                    self.commit(
                        &mut state,
                        WorkflowStep::Validating,
                        json!({}),
                        "system",
                        "engine",
                    )?;
                }
                WorkflowStep::Validating => match validate_draft(&state) {
                    Ok(()) => {
                        self.commit(
                            &mut state,
                            WorkflowStep::ValidationComplete,
                            json!({}),
                            "system",
                            "engine",
                        )?;
                    }
                    Err(message) => return self.fail(state, "validation", &message),
                },
                WorkflowStep::ValidationComplete => {
                    self.commit(
                        &mut state,
                        WorkflowStep::PolicyEvaluating,
                        json!({}),
                        "system",
                        "engine",
                    )?;
                }
                WorkflowStep::PolicyEvaluating => {
                    let classification = read_classification(&state)?;
                    let decision = decide(&classification, &self.config.thresholds);
                    let detail = json!({
                        "policy_band": decision.policy_band.as_str(),
                        "policy_reason": decision.policy_reason,
                        "requires_approval": decision.requires_approval,
                    });
                    state.insert_data("policy_decision", serde_json::to_value(&decision)?)?;
                    self.commit(
                        &mut state,
                        WorkflowStep::PolicyEvaluated,
                        detail,
                        "system",
                        "policy",
                    )?;
                }
                WorkflowStep::PolicyEvaluated => {
                    let decision = read_policy_decision(&state)?;
                    if decision.requires_approval {
                        self.pause_for_review(&mut state, &decision)?;
                        return Ok(state);
                    }
                    self.commit(
                        &mut state,
                        WorkflowStep::Storing,
                        json!({"mode": "auto", "policy_band": decision.policy_band.as_str()}),
                        "system",
                        "engine",
                    )?;
                }
                WorkflowStep::ResumedFromReview => {
                    self.commit(
                        &mut state,
                        WorkflowStep::Storing,
                        json!({"mode": "approved"}),
                        "system",
                        "engine",
                    )?;
                }
                WorkflowStep::Storing => {
                    let document = self.result_document(&state)?;
                    match self
                        .output_store
                        .commit(&state.incident_id, state.agent_type, &document)
                    {
                        Ok(()) => {
                            self.commit(
                                &mut state,
                                WorkflowStep::Completed,
                                json!({"result_schema": "incident_result.v1"}),
                                "system",
                                "engine",
                            )?;
                        }
                        Err(err) => return self.fail(state, "storage", &err.to_string()),
                    }
                }
                WorkflowStep::PausedForReview
                | WorkflowStep::Completed
                | WorkflowStep::Rejected
                | WorkflowStep::Cancelled
                | WorkflowStep::Error => return Ok(state),
            }
        }
    }

    fn pause_for_review(
        &self,
        state: &mut WorkflowState,
        decision: &PolicyDecision,
    ) -> Result<()> {
        let checkpoints = CheckpointManager::new(self.store);
        let mut draft = serde_json::Map::new();
        if let Some(classification) = state.data("classification") {
            draft.insert("classification".to_string(), classification.clone());
        }
        if let Some(recommendation) = state.data("recommendation") {
            draft.insert("recommendation".to_string(), recommendation.clone());
        }
        let description = format!(
            "review {} draft for incident {} ({})",
            state.agent_type, state.incident_id, decision.policy_reason
        );
        let action = checkpoints.materialize(
            state,
            Value::Object(draft),
            serde_json::to_value(decision)?,
            description,
        );
        let detail = json!({
            "action_name": action.action_name.to_string(),
            "action_type": action.action_type.as_str(),
            "policy_band": decision.policy_band.as_str(),
        });
        state.pending_action = Some(action);
        self.commit(state, WorkflowStep::PausedForReview, detail, "system", "engine")?;
        tracing::info!(
            workflow_id = %state.workflow_id,
            incident_id = %state.incident_id,
            "workflow suspended for human review"
        );
        Ok(())
    }

    fn drive_reasoning(
        &self,
        state: &mut WorkflowState,
        request: &ReasonerRequest,
    ) -> Result<Value> {
        let mut calls: Vec<Value> = Vec::new();

        let classification = match self.prior_triage_classification(state)? {
            Some(classification) => classification,
            None => {
                let invocation = self.reasoner.classify(request)?;
                calls.push(serde_json::to_value(&invocation.call)?);
                invocation.classification
            }
        };
        state.insert_data("classification", serde_json::to_value(&classification)?)?;

        if state.agent_type == AgentType::Resolution {
            let invocation = self.reasoner.recommend(request, &classification)?;
            calls.push(serde_json::to_value(&invocation.call)?);
            state.insert_data(
                "recommendation",
                serde_json::to_value(&invocation.recommendation)?,
            )?;
        }

        let detail = json!({
            "model_id": request.binding.model_id,
            "reasoner_calls": calls.len(),
        });
        state.insert_data("reasoner_calls", Value::Array(calls))?;
        Ok(detail)
    }

    /// A resolution run reuses the classification of the incident's most
    /// recent completed triage run instead of re-classifying.
    fn prior_triage_classification(
        &self,
        state: &WorkflowState,
    ) -> Result<Option<Classification>> {
        if state.agent_type != AgentType::Resolution {
            return Ok(None);
        }
        let Some(prior) = self
            .store
            .get_latest(&state.incident_id, AgentType::Triage)?
        else {
            return Ok(None);
        };
        if prior.current_step != WorkflowStep::Completed {
            return Ok(None);
        }
        let Some(raw) = prior.data("classification") else {
            return Ok(None);
        };
        let classification = serde_json::from_value(raw.clone())
            .map_err(|err| anyhow!("invalid stored triage classification: {err}"))?;
        Ok(Some(classification))
    }

    fn build_reasoner_request(&self, state: &WorkflowState) -> Result<ReasonerRequest> {
        let incident = state.data("incident").cloned().unwrap_or(Value::Null);
        let evidence_raw = state
            .data("evidence")
            .cloned()
            .ok_or_else(|| anyhow!("workflow {} has no retrieved evidence", state.workflow_id))?;
        let evidence: EvidenceSet = serde_json::from_value(evidence_raw)
            .map_err(|err| anyhow!("invalid stored evidence: {err}"))?;

        let mut request = ReasonerRequest {
            workflow_id: state.workflow_id,
            incident_id: state.incident_id.clone(),
            agent_type: state.agent_type,
            binding: self.config.binding.clone(),
            incident,
            evidence,
            timeout_ms: self.config.reasoner_timeout_ms,
            input_hash: String::new(),
        };
        request.input_hash = hash_json(&serde_json::to_value(&request)?)?;
        Ok(request)
    }

    fn result_document(&self, state: &WorkflowState) -> Result<Value> {
        let decision = read_policy_decision(state)?;
        let effective_band = state
            .data("human_override")
            .and_then(|record| record.get("override_band"))
            .and_then(Value::as_str)
            .and_then(PolicyBand::parse)
            .unwrap_or(decision.policy_band);

        Ok(json!({
            "schema": "incident_result.v1",
            "workflow_id": state.workflow_id.to_string(),
            "incident_id": state.incident_id.to_string(),
            "agent_type": state.agent_type.as_str(),
            "classification": state.data("classification"),
            "recommendation": state.data("recommendation"),
            "policy_decision": state.data("policy_decision"),
            "human_override": state.data("human_override"),
            "effective_band": effective_band.as_str(),
            "completed_at": format_rfc3339(now_utc())?,
            "engine_version": self.config.engine_version,
        }))
    }

    fn cancel_run(
        &self,
        mut state: WorkflowState,
        reason: &str,
        actor_type: &str,
        actor_id: &str,
    ) -> Result<WorkflowState> {
        state.insert_data("cancel_reason", json!(reason))?;
        self.commit(
            &mut state,
            WorkflowStep::Cancelled,
            json!({"reason": reason}),
            actor_type,
            actor_id,
        )?;
        tracing::info!(
            workflow_id = %state.workflow_id,
            incident_id = %state.incident_id,
            reason,
            "workflow cancelled"
        );
        Ok(state)
    }

    /// Record the failure, drive the run to `error`, and surface the
    /// failure to the caller. The run remains queryable like any other
    /// terminal state.
    fn fail(&self, mut state: WorkflowState, stage: &str, message: &str) -> Result<WorkflowState> {
        state.insert_data("failure", json!({"stage": stage, "message": message}))?;
        self.commit(
            &mut state,
            WorkflowStep::Error,
            json!({"stage": stage, "message": message}),
            "system",
            "engine",
        )?;
        tracing::warn!(
            workflow_id = %state.workflow_id,
            incident_id = %state.incident_id,
            stage,
            message,
            "workflow failed"
        );
        Err(anyhow::Error::new(WorkflowError::ExternalCall {
            stage: stage.to_string(),
            message: message.to_string(),
        }))
    }

    /// Commit one transition: graph check, hash-chained event, CAS write,
    /// publish. Moving out of the pause consumes the pending action.
    fn commit(
        &self,
        state: &mut WorkflowState,
        next: WorkflowStep,
        detail: Value,
        actor_type: &str,
        actor_id: &str,
    ) -> Result<()> {
        let from = state.current_step;
        if !from.can_transition_to(next) {
            return Err(anyhow::Error::new(WorkflowError::InvalidTransition {
                from,
                to: next,
            }));
        }

        let prev_hash = self.store.last_event_hash(state.workflow_id)?;
        let event = build_transition_event(
            state.workflow_id,
            &state.incident_id,
            state.agent_type,
            Some(from),
            next,
            actor_type,
            actor_id,
            detail,
            prev_hash,
        )?;

        let expected = state.version;
        state.current_step = next;
        state.version += 1;
        state.updated_at = event.recorded_at;

        if next != WorkflowStep::PausedForReview {
            if let Some(action) = state.pending_action.take() {
                state.record_consumed_action(action.action_name)?;
            }
        }

        state.validate()?;
        self.store.commit_transition(state, expected, &event)?;
        tracing::debug!(
            workflow_id = %state.workflow_id,
            from = %from,
            to = %next,
            version = state.version,
            "transition committed"
        );
        self.publisher.publish(state);
        Ok(())
    }
}

fn read_classification(state: &WorkflowState) -> Result<Classification> {
    let raw = state
        .data("classification")
        .cloned()
        .ok_or_else(|| anyhow!("workflow {} has no classification", state.workflow_id))?;
    serde_json::from_value(raw).map_err(|err| anyhow!("invalid stored classification: {err}"))
}

fn read_policy_decision(state: &WorkflowState) -> Result<PolicyDecision> {
    let raw = state
        .data("policy_decision")
        .cloned()
        .ok_or_else(|| anyhow!("workflow {} has no policy decision", state.workflow_id))?;
    serde_json::from_value(raw).map_err(|err| anyhow!("invalid stored policy decision: {err}"))
}

/// Check the draft against the output contract before policy evaluation.
fn validate_draft(state: &WorkflowState) -> std::result::Result<(), String> {
    let classification = match read_classification(state) {
        Ok(classification) => classification,
        Err(err) => return Err(err.to_string()),
    };
    if !classification.confidence.is_finite()
        || !(0.0..=1.0).contains(&classification.confidence)
    {
        return Err(format!(
            "classification confidence {} is outside [0, 1]",
            classification.confidence
        ));
    }
    if classification.summary.trim().is_empty() {
        return Err("classification summary is empty".to_string());
    }

    if state.agent_type == AgentType::Resolution {
        let raw = state
            .data("recommendation")
            .cloned()
            .ok_or_else(|| "resolution draft has no recommendation".to_string())?;
        let recommendation: Recommendation = serde_json::from_value(raw)
            .map_err(|err| format!("invalid stored recommendation: {err}"))?;
        if recommendation.summary.trim().is_empty() {
            return Err("recommendation summary is empty".to_string());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        EngineConfig, EvidenceRetriever, RecordingOutputStore, RecoveryOutcome,
        StartOptions, StaticEvidenceRetriever, WorkflowEngine,
    };
    use anyhow::Result;
    use incident_copilot_domain::{
        empty_state_data, now_utc, ActionName, ActionResponse, AgentType, EvidenceSet, IncidentId,
        PolicyBand, WorkflowError, WorkflowId, WorkflowState, WorkflowStep,
    };
    use incident_copilot_publisher::StatePublisher;
    use incident_copilot_reasoner::{
        ClassifyInvocation, MockReasoner, ReasonerAdapter, ReasonerRequest, RecommendInvocation,
    };
    use incident_copilot_state_core::StateStore;
    use incident_copilot_state_sqlite::SqliteStateStore;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    fn temp_db(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "incident-copilot-engine-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn open_store(name: &str) -> SqliteStateStore {
        let store = SqliteStateStore::open(&temp_db(name));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    #[derive(Default)]
    struct CountingReasoner {
        inner: MockReasoner,
        classify_calls: AtomicUsize,
        recommend_calls: AtomicUsize,
    }

    impl ReasonerAdapter for CountingReasoner {
        fn adapter_name(&self) -> &'static str {
            "mock"
        }

        fn classify(&self, request: &ReasonerRequest) -> Result<ClassifyInvocation> {
            self.classify_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.classify(request)
        }

        fn recommend(
            &self,
            request: &ReasonerRequest,
            classification: &incident_copilot_domain::Classification,
        ) -> Result<RecommendInvocation> {
            self.recommend_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.recommend(request, classification)
        }
    }

    struct FailingRetriever;

    impl EvidenceRetriever for FailingRetriever {
        fn retrieve(
            &self,
            _incident_id: &IncidentId,
            _incident: &Value,
            _timeout_ms: u64,
        ) -> Result<EvidenceSet> {
            Err(anyhow::anyhow!("search backend timed out"))
        }
    }

    struct Fixture {
        store: SqliteStateStore,
        retriever: StaticEvidenceRetriever,
        reasoner: CountingReasoner,
        outputs: RecordingOutputStore,
        publisher: StatePublisher,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            Self {
                store: open_store(name),
                retriever: StaticEvidenceRetriever::default(),
                reasoner: CountingReasoner::default(),
                outputs: RecordingOutputStore::default(),
                publisher: StatePublisher::default(),
            }
        }

        fn engine(&self) -> WorkflowEngine<'_> {
            WorkflowEngine::new(
                &self.store,
                &self.retriever,
                &self.reasoner,
                &self.outputs,
                &self.publisher,
                EngineConfig::default(),
            )
        }
    }

    fn auto_incident() -> Value {
        json!({"severity": "low", "confidence": 0.95, "title": "disk space warning"})
    }

    fn review_incident() -> Value {
        json!({"severity": "critical", "confidence": 0.99, "title": "database outage"})
    }

    fn approve(action_name: ActionName) -> ActionResponse {
        ActionResponse {
            action_name,
            approved: true,
            user_edited: None,
            notes: None,
            policy_band_override: None,
            responded_by: "oncall".to_string(),
        }
    }

    fn pending_action_name(state: &WorkflowState) -> ActionName {
        let action = state.pending_action.as_ref();
        assert!(action.is_some());
        action.map(|a| a.action_name).unwrap_or_else(|| unreachable!())
    }

    #[test]
    fn auto_path_runs_to_completion_and_commits_the_result() {
        let fixture = Fixture::new("auto-path");
        let engine = fixture.engine();
        let incident = IncidentId::new("INC-100");

        let result = engine.start_workflow(
            &incident,
            AgentType::Triage,
            auto_incident(),
            StartOptions::default(),
        );
        assert!(result.is_ok());
        let state = result.unwrap_or_else(|_| unreachable!());
        assert_eq!(state.current_step, WorkflowStep::Completed);
        assert!(state.pending_action.is_none());

        let committed = fixture.outputs.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].0, incident);
        assert_eq!(committed[0].2["effective_band"], "auto");

        let transitions = fixture.store.list_transitions(state.workflow_id);
        assert!(transitions.is_ok());
        let transitions = transitions.unwrap_or_else(|_| unreachable!());
        let steps: Vec<WorkflowStep> = transitions.iter().map(|row| row.event.to_step).collect();
        assert_eq!(
            steps,
            vec![
                WorkflowStep::Initialized,
                WorkflowStep::RetrievingContext,
                WorkflowStep::ContextRetrieved,
                WorkflowStep::CallingLlm,
                WorkflowStep::LlmCompleted,
                WorkflowStep::Validating,
                WorkflowStep::ValidationComplete,
                WorkflowStep::PolicyEvaluating,
                WorkflowStep::PolicyEvaluated,
                WorkflowStep::Storing,
                WorkflowStep::Completed,
            ]
        );

        let report = engine.verify_timeline(state.workflow_id);
        assert!(report.is_ok());
        assert!(report.unwrap_or_else(|_| unreachable!()).chain_valid);
    }

    #[test]
    fn review_path_pauses_with_a_persisted_pending_action() {
        let fixture = Fixture::new("review-pause");
        let engine = fixture.engine();
        let incident = IncidentId::new("INC-101");

        let result = engine.start_workflow(
            &incident,
            AgentType::Triage,
            review_incident(),
            StartOptions::default(),
        );
        assert!(result.is_ok());
        let state = result.unwrap_or_else(|_| unreachable!());
        assert_eq!(state.current_step, WorkflowStep::PausedForReview);
        assert!(state.pending_action.is_some());

        // The pause is durable, not an in-memory artifact.
        let reloaded = engine.get_state(&incident, AgentType::Triage);
        assert!(reloaded.is_ok());
        let reloaded = reloaded.unwrap_or_else(|_| unreachable!());
        assert!(reloaded.is_some());
        let reloaded = reloaded.unwrap_or_else(|| unreachable!());
        assert_eq!(reloaded.current_step, WorkflowStep::PausedForReview);
        assert!(reloaded.pending_action.is_some());
        assert!(fixture.outputs.committed().is_empty());
    }

    #[test]
    fn approval_resumes_to_completion_and_a_replay_is_stale() {
        let fixture = Fixture::new("approve");
        let engine = fixture.engine();
        let incident = IncidentId::new("INC-102");

        let paused = engine.start_workflow(
            &incident,
            AgentType::Triage,
            review_incident(),
            StartOptions::default(),
        );
        assert!(paused.is_ok());
        let paused = paused.unwrap_or_else(|_| unreachable!());
        let action_name = pending_action_name(&paused);

        let resumed = engine.respond_to_action(&incident, AgentType::Triage, &approve(action_name));
        assert!(resumed.is_ok());
        let resumed = resumed.unwrap_or_else(|_| unreachable!());
        assert_eq!(resumed.current_step, WorkflowStep::Completed);
        assert_eq!(fixture.outputs.committed().len(), 1);

        // The consumed action name no longer resumes anything.
        let replay = engine.respond_to_action(&incident, AgentType::Triage, &approve(action_name));
        assert!(replay.is_err());
        let err = replay.err().unwrap_or_else(|| unreachable!());
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::StaleAction { .. })
        ));

        let unchanged = engine.get_state(&incident, AgentType::Triage);
        assert!(unchanged.is_ok());
        let unchanged = unchanged.unwrap_or_else(|_| unreachable!());
        assert_eq!(
            unchanged.map(|s| (s.current_step, s.version)),
            Some((resumed.current_step, resumed.version))
        );
    }

    #[test]
    fn mismatched_action_name_rejects_without_mutating_state() {
        let fixture = Fixture::new("stale");
        let engine = fixture.engine();
        let incident = IncidentId::new("INC-103");

        let paused = engine.start_workflow(
            &incident,
            AgentType::Triage,
            review_incident(),
            StartOptions::default(),
        );
        assert!(paused.is_ok());
        let paused = paused.unwrap_or_else(|_| unreachable!());

        let result =
            engine.respond_to_action(&incident, AgentType::Triage, &approve(ActionName::new()));
        assert!(result.is_err());
        let err = result.err().unwrap_or_else(|| unreachable!());
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::StaleAction { .. })
        ));

        let current = engine.get_state(&incident, AgentType::Triage);
        assert!(current.is_ok());
        let current = current.unwrap_or_else(|_| unreachable!());
        assert_eq!(
            current.map(|s| (s.current_step, s.version)),
            Some((WorkflowStep::PausedForReview, paused.version))
        );
    }

    #[test]
    fn responding_to_a_running_workflow_is_not_paused() {
        let fixture = Fixture::new("not-paused");
        let engine = fixture.engine();
        let incident = IncidentId::new("INC-104");

        let done = engine.start_workflow(
            &incident,
            AgentType::Triage,
            auto_incident(),
            StartOptions::default(),
        );
        assert!(done.is_ok());

        let result =
            engine.respond_to_action(&incident, AgentType::Triage, &approve(ActionName::new()));
        assert!(result.is_err());
        let err = result.err().unwrap_or_else(|| unreachable!());
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::NotPaused { .. })
        ));
    }

    #[test]
    fn rejection_terminates_without_storing_the_draft() {
        let fixture = Fixture::new("reject");
        let engine = fixture.engine();
        let incident = IncidentId::new("INC-105");

        let paused = engine.start_workflow(
            &incident,
            AgentType::Triage,
            review_incident(),
            StartOptions::default(),
        );
        assert!(paused.is_ok());
        let paused = paused.unwrap_or_else(|_| unreachable!());

        let response = ActionResponse {
            action_name: pending_action_name(&paused),
            approved: false,
            user_edited: None,
            notes: Some("not actionable".to_string()),
            policy_band_override: None,
            responded_by: "oncall".to_string(),
        };
        let rejected = engine.respond_to_action(&incident, AgentType::Triage, &response);
        assert!(rejected.is_ok());
        let rejected = rejected.unwrap_or_else(|_| unreachable!());
        assert_eq!(rejected.current_step, WorkflowStep::Rejected);
        assert!(fixture.outputs.committed().is_empty());
    }

    #[test]
    fn band_override_and_edits_are_applied_and_audited() {
        let fixture = Fixture::new("override");
        let engine = fixture.engine();
        let incident = IncidentId::new("INC-106");

        let paused = engine.start_workflow(
            &incident,
            AgentType::Triage,
            review_incident(),
            StartOptions::default(),
        );
        assert!(paused.is_ok());
        let paused = paused.unwrap_or_else(|_| unreachable!());

        let response = ActionResponse {
            action_name: pending_action_name(&paused),
            approved: true,
            user_edited: Some(json!({"classification": {"severity": "high"}})),
            notes: Some("known failure mode".to_string()),
            policy_band_override: Some(PolicyBand::Auto),
            responded_by: "oncall".to_string(),
        };
        let resumed = engine.respond_to_action(&incident, AgentType::Triage, &response);
        assert!(resumed.is_ok());
        let resumed = resumed.unwrap_or_else(|_| unreachable!());
        assert_eq!(resumed.current_step, WorkflowStep::Completed);

        let record = resumed.data("human_override");
        assert!(record.is_some());
        let record = record.unwrap_or_else(|| unreachable!());
        assert_eq!(record["original_band"], "review");
        assert_eq!(record["override_band"], "auto");

        let committed = fixture.outputs.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].2["effective_band"], "auto");
        assert_eq!(committed[0].2["classification"]["severity"], "high");
        // The original automatic decision stays intact alongside.
        assert_eq!(committed[0].2["policy_decision"]["policy_band"], "review");
    }

    #[test]
    fn cancelling_a_paused_run_invalidates_its_action() {
        let fixture = Fixture::new("cancel");
        let engine = fixture.engine();
        let incident = IncidentId::new("INC-107");

        let paused = engine.start_workflow(
            &incident,
            AgentType::Triage,
            review_incident(),
            StartOptions::default(),
        );
        assert!(paused.is_ok());
        let paused = paused.unwrap_or_else(|_| unreachable!());
        let action_name = pending_action_name(&paused);

        let cancelled = engine.cancel(&incident, AgentType::Triage, "duplicate alert");
        assert!(cancelled.is_ok());
        let cancelled = cancelled.unwrap_or_else(|_| unreachable!());
        assert_eq!(cancelled.current_step, WorkflowStep::Cancelled);
        assert!(cancelled.pending_action.is_none());

        let result = engine.respond_to_action(&incident, AgentType::Triage, &approve(action_name));
        assert!(result.is_err());
        let err = result.err().unwrap_or_else(|| unreachable!());
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::StaleAction { .. })
        ));
    }

    #[test]
    fn starting_over_an_active_run_requires_supersession() {
        let fixture = Fixture::new("supersede");
        let engine = fixture.engine();
        let incident = IncidentId::new("INC-108");

        let paused = engine.start_workflow(
            &incident,
            AgentType::Triage,
            review_incident(),
            StartOptions::default(),
        );
        assert!(paused.is_ok());
        let paused = paused.unwrap_or_else(|_| unreachable!());

        let duplicate = engine.start_workflow(
            &incident,
            AgentType::Triage,
            review_incident(),
            StartOptions::default(),
        );
        assert!(duplicate.is_err());
        let err = duplicate.err().unwrap_or_else(|| unreachable!());
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::ActiveExists { .. })
        ));

        let superseding = engine.start_workflow(
            &incident,
            AgentType::Triage,
            auto_incident(),
            StartOptions {
                workflow_id: None,
                supersede: true,
            },
        );
        assert!(superseding.is_ok());
        let superseding = superseding.unwrap_or_else(|_| unreachable!());
        assert_ne!(superseding.workflow_id, paused.workflow_id);

        // The old run was cancelled, not deleted.
        let old = fixture.store.get_workflow(paused.workflow_id);
        assert!(old.is_ok());
        let old = old.unwrap_or_else(|_| unreachable!());
        assert_eq!(old.map(|s| s.current_step), Some(WorkflowStep::Cancelled));
    }

    #[test]
    fn retrieval_failure_lands_in_a_queryable_error_state() {
        let store = open_store("retrieval-failure");
        let retriever = FailingRetriever;
        let reasoner = CountingReasoner::default();
        let outputs = RecordingOutputStore::default();
        let publisher = StatePublisher::default();
        let engine = WorkflowEngine::new(
            &store,
            &retriever,
            &reasoner,
            &outputs,
            &publisher,
            EngineConfig::default(),
        );
        let incident = IncidentId::new("INC-109");

        let result = engine.start_workflow(
            &incident,
            AgentType::Triage,
            auto_incident(),
            StartOptions::default(),
        );
        assert!(result.is_err());
        let err = result.err().unwrap_or_else(|| unreachable!());
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::ExternalCall { .. })
        ));

        let state = engine.get_state(&incident, AgentType::Triage);
        assert!(state.is_ok());
        let state = state.unwrap_or_else(|_| unreachable!());
        assert!(state.is_some());
        let state = state.unwrap_or_else(|| unreachable!());
        assert_eq!(state.current_step, WorkflowStep::Error);
        assert_eq!(state.data("failure").map(|f| f["stage"].clone()), Some(json!("retrieval")));
        assert_eq!(reasoner.classify_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recovery_redrives_an_unconfirmed_reasoner_call_and_leaves_pauses_alone() {
        let fixture = Fixture::new("recovery");

        // A run that crashed mid reasoner call: persisted at the attempt
        // marker with evidence already confirmed.
        let mut interrupted = WorkflowState::new(
            WorkflowId::new(),
            IncidentId::new("INC-110"),
            AgentType::Triage,
            empty_state_data(),
        );
        assert!(interrupted.insert_data("incident", auto_incident()).is_ok());
        let evidence = EvidenceSet {
            items: Vec::new(),
            retrieved_at: now_utc(),
        };
        let evidence_json = serde_json::to_value(&evidence);
        assert!(evidence_json.is_ok());
        assert!(interrupted
            .insert_data("evidence", evidence_json.unwrap_or_else(|_| unreachable!()))
            .is_ok());
        interrupted.current_step = WorkflowStep::CallingLlm;
        assert!(fixture.store.insert_workflow(&interrupted).is_ok());

        // A paused run that must stay paused.
        let engine = fixture.engine();
        let paused = engine.start_workflow(
            &IncidentId::new("INC-111"),
            AgentType::Triage,
            review_incident(),
            StartOptions::default(),
        );
        assert!(paused.is_ok());

        let before = fixture.reasoner.classify_calls.load(Ordering::SeqCst);
        let summaries = engine.recover();
        assert!(summaries.is_ok());
        let summaries = summaries.unwrap_or_else(|_| unreachable!());
        assert_eq!(summaries.len(), 2);

        for summary in &summaries {
            match summary.incident_id.as_str() {
                "INC-110" => assert_eq!(
                    summary.outcome,
                    RecoveryOutcome::Resumed {
                        final_step: WorkflowStep::Completed
                    }
                ),
                "INC-111" => assert_eq!(summary.outcome, RecoveryOutcome::AwaitingReview),
                other => panic!("unexpected incident in recovery summaries: {other}"),
            }
        }

        // The unconfirmed call was re-driven exactly once.
        assert_eq!(
            fixture.reasoner.classify_calls.load(Ordering::SeqCst),
            before + 1
        );
    }

    #[test]
    fn late_subscriber_sees_snapshot_before_deltas() {
        let fixture = Fixture::new("subscribe");
        let engine = fixture.engine();
        let incident = IncidentId::new("INC-112");

        let paused = engine.start_workflow(
            &incident,
            AgentType::Triage,
            review_incident(),
            StartOptions::default(),
        );
        assert!(paused.is_ok());
        let paused = paused.unwrap_or_else(|_| unreachable!());

        // Joined mid-workflow: the first observation is the full current
        // snapshot, never an incremental delta.
        let subscription = engine.subscribe(&incident);
        assert!(subscription.is_ok());
        let subscription = subscription.unwrap_or_else(|_| unreachable!());

        let resumed = engine.respond_to_action(
            &incident,
            AgentType::Triage,
            &approve(pending_action_name(&paused)),
        );
        assert!(resumed.is_ok());

        let received = subscription.drain();
        assert!(received.len() >= 4);
        assert_eq!(received[0].current_step, WorkflowStep::PausedForReview);
        assert_eq!(received[1].current_step, WorkflowStep::ResumedFromReview);
        assert_eq!(
            received.last().map(|s| s.current_step),
            Some(WorkflowStep::Completed)
        );
        for pair in received.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn resolution_reuses_the_completed_triage_classification() {
        let fixture = Fixture::new("resolution-reuse");
        let engine = fixture.engine();
        let incident = IncidentId::new("INC-113");

        let triage = engine.start_workflow(
            &incident,
            AgentType::Triage,
            auto_incident(),
            StartOptions::default(),
        );
        assert!(triage.is_ok());
        let classify_after_triage = fixture.reasoner.classify_calls.load(Ordering::SeqCst);

        let resolution = engine.start_workflow(
            &incident,
            AgentType::Resolution,
            auto_incident(),
            StartOptions::default(),
        );
        assert!(resolution.is_ok());
        let resolution = resolution.unwrap_or_else(|_| unreachable!());
        assert_eq!(resolution.current_step, WorkflowStep::Completed);
        assert!(resolution.data("recommendation").is_some());

        // The triage classification was reused, not recomputed.
        assert_eq!(
            fixture.reasoner.classify_calls.load(Ordering::SeqCst),
            classify_after_triage
        );
        assert_eq!(fixture.reasoner.recommend_calls.load(Ordering::SeqCst), 1);

        let committed = fixture.outputs.committed();
        assert_eq!(committed.len(), 2);
    }
}
