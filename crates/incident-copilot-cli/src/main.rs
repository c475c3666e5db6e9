use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use incident_copilot_domain::{
    ActionName, ActionResponse, AgentType, EvidenceItem, IncidentId, PolicyBand, WorkflowStep,
};
use incident_copilot_engine::{
    DirectoryOutputStore, EngineConfig, RecoveryOutcome, StartOptions, StaticEvidenceRetriever,
    WorkflowEngine,
};
use incident_copilot_policy::{load_thresholds_from_path, PolicyThresholds};
use incident_copilot_publisher::StatePublisher;
use incident_copilot_reasoner::{route_reasoner, ReasonerBinding};
use incident_copilot_state_core::StateStore;
use incident_copilot_state_sqlite::SqliteStateStore;
use serde_json::Value;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "incident-copilot")]
#[command(about = "Durable incident triage/resolution workflows with human checkpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Start(StartArgs),
    State(StateArgs),
    Respond(RespondArgs),
    Cancel(CancelArgs),
    Recover(RecoverArgs),
    Timeline(TimelineArgs),
    Export(ExportArgs),
}

#[derive(Debug, Args)]
struct EngineArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long, default_value = "results")]
    out_dir: PathBuf,
    #[arg(long)]
    policy_config: Option<PathBuf>,
    #[arg(long, default_value = "mock")]
    adapter: String,
    #[arg(long, default_value = "mock-model-v1")]
    model_id: String,
    #[arg(long)]
    reasoner_params: Option<String>,
}

#[derive(Debug, Args)]
struct StartArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    incident: String,
    #[arg(long, default_value = "triage")]
    agent_type: String,
    /// Inline incident payload as JSON.
    #[arg(long)]
    payload: Option<String>,
    /// Incident payload file; wins over --payload.
    #[arg(long)]
    payload_file: Option<PathBuf>,
    /// JSON file with an array of evidence items for this incident.
    #[arg(long)]
    evidence_json: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    non_interactive: bool,
    #[arg(long, default_value_t = false)]
    supersede: bool,
    /// Print every streamed state transition after the run settles.
    #[arg(long, default_value_t = false)]
    follow: bool,
}

#[derive(Debug, Args)]
struct StateArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    incident: String,
    #[arg(long, default_value = "triage")]
    agent_type: String,
}

#[derive(Debug, Args)]
struct RespondArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    incident: String,
    #[arg(long, default_value = "triage")]
    agent_type: String,
    #[arg(long)]
    action_name: String,
    #[arg(long, default_value_t = false, conflicts_with = "reject")]
    approve: bool,
    #[arg(long, default_value_t = false)]
    reject: bool,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    band_override: Option<String>,
    #[arg(long)]
    edited_json: Option<PathBuf>,
    #[arg(long)]
    responded_by: Option<String>,
}

#[derive(Debug, Args)]
struct CancelArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    incident: String,
    #[arg(long, default_value = "triage")]
    agent_type: String,
    #[arg(long, default_value = "cancelled by operator")]
    reason: String,
}

#[derive(Debug, Args)]
struct RecoverArgs {
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Args)]
struct TimelineArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    incident: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    incident: String,
    #[arg(long)]
    out: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => start_command(&args),
        Commands::State(args) => state_command(&args),
        Commands::Respond(args) => respond_command(&args),
        Commands::Cancel(args) => cancel_command(&args),
        Commands::Recover(args) => recover_command(&args),
        Commands::Timeline(args) => timeline_command(&args),
        Commands::Export(args) => export_command(&args),
    }
}

/// Everything the engine borrows, owned for the lifetime of one command.
struct EngineHost {
    store: SqliteStateStore,
    retriever: StaticEvidenceRetriever,
    reasoner: Box<dyn incident_copilot_reasoner::ReasonerAdapter>,
    outputs: DirectoryOutputStore,
    publisher: StatePublisher,
    config: EngineConfig,
}

impl EngineHost {
    fn open(args: &EngineArgs, retriever: StaticEvidenceRetriever) -> Result<Self> {
        let store = SqliteStateStore::open(&args.db)?;
        store.migrate()?;

        let thresholds = match &args.policy_config {
            Some(path) => load_thresholds_from_path(path)?,
            None => PolicyThresholds::default(),
        };
        let params = match &args.reasoner_params {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|err| anyhow!("invalid --reasoner-params JSON: {err}"))?,
            None => Value::Null,
        };
        let binding = ReasonerBinding {
            adapter_name: args.adapter.clone(),
            model_id: args.model_id.clone(),
            params,
        };
        let reasoner = route_reasoner(&binding)?;
        let config = EngineConfig {
            thresholds,
            binding,
            ..EngineConfig::default()
        };

        Ok(Self {
            store,
            retriever,
            reasoner,
            outputs: DirectoryOutputStore::new(&args.out_dir),
            publisher: StatePublisher::default(),
            config,
        })
    }

    fn engine(&self) -> WorkflowEngine<'_> {
        WorkflowEngine::new(
            &self.store,
            &self.retriever,
            &*self.reasoner,
            &self.outputs,
            &self.publisher,
            self.config.clone(),
        )
    }
}

fn start_command(args: &StartArgs) -> Result<()> {
    let incident_id = IncidentId::new(args.incident.clone());
    let agent_type = parse_agent_type(&args.agent_type)?;
    let payload = load_payload(args)?;
    let retriever = load_retriever(args.evidence_json.as_deref(), &incident_id)?;

    let host = EngineHost::open(&args.engine, retriever)?;
    let engine = host.engine();
    let subscription = args
        .follow
        .then(|| engine.subscribe(&incident_id))
        .transpose()?;

    let mut state = engine.start_workflow(
        &incident_id,
        agent_type,
        payload,
        StartOptions {
            workflow_id: None,
            supersede: args.supersede,
        },
    )?;

    if state.current_step == WorkflowStep::PausedForReview && !args.non_interactive {
        state = prompt_and_respond(&engine, &state)?;
    }

    print_summary(&state);

    if let Some(subscription) = subscription {
        for observed in subscription.drain() {
            println!("{}", serde_json::to_string(&observed)?);
        }
    }

    Ok(())
}

fn state_command(args: &StateArgs) -> Result<()> {
    let store = SqliteStateStore::open(&args.db)?;
    let incident_id = IncidentId::new(args.incident.clone());
    let agent_type = parse_agent_type(&args.agent_type)?;
    let state = store
        .get_latest(&incident_id, agent_type)?
        .ok_or_else(|| anyhow!("no {agent_type} workflow found for incident {incident_id}"))?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn respond_command(args: &RespondArgs) -> Result<()> {
    if args.approve == args.reject {
        return Err(anyhow!("pass exactly one of --approve or --reject"));
    }
    let incident_id = IncidentId::new(args.incident.clone());
    let agent_type = parse_agent_type(&args.agent_type)?;

    let user_edited = args
        .edited_json
        .as_deref()
        .map(read_json_file)
        .transpose()?;
    let policy_band_override = args
        .band_override
        .as_deref()
        .map(parse_band)
        .transpose()?;

    let response = ActionResponse {
        action_name: parse_action_name(&args.action_name)?,
        approved: args.approve,
        user_edited,
        notes: args.notes.clone(),
        policy_band_override,
        responded_by: args
            .responded_by
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "human.cli".to_string()),
    };

    let host = EngineHost::open(&args.engine, StaticEvidenceRetriever::default())?;
    let state = host
        .engine()
        .respond_to_action(&incident_id, agent_type, &response)?;
    print_summary(&state);
    Ok(())
}

fn cancel_command(args: &CancelArgs) -> Result<()> {
    let incident_id = IncidentId::new(args.incident.clone());
    let agent_type = parse_agent_type(&args.agent_type)?;
    let host = EngineHost::open(&args.engine, StaticEvidenceRetriever::default())?;
    let state = host.engine().cancel(&incident_id, agent_type, &args.reason)?;
    print_summary(&state);
    Ok(())
}

fn recover_command(args: &RecoverArgs) -> Result<()> {
    let host = EngineHost::open(&args.engine, StaticEvidenceRetriever::default())?;
    let summaries = host.engine().recover()?;
    if summaries.is_empty() {
        println!("no non-terminal workflows found");
        return Ok(());
    }
    for summary in summaries {
        let outcome = match summary.outcome {
            RecoveryOutcome::AwaitingReview => "awaiting_review".to_string(),
            RecoveryOutcome::Resumed { final_step } => format!("resumed:{final_step}"),
            RecoveryOutcome::Failed { message } => format!("failed:{message}"),
        };
        println!(
            "workflow_id={} incident_id={} agent_type={} outcome={}",
            summary.workflow_id, summary.incident_id, summary.agent_type, outcome
        );
    }
    Ok(())
}

fn timeline_command(args: &TimelineArgs) -> Result<()> {
    let store = SqliteStateStore::open(&args.db)?;
    let incident_id = IncidentId::new(args.incident.clone());
    let rows = store.list_transitions_for_incident(&incident_id)?;
    for row in rows {
        println!("{}", serde_json::to_string(&row)?);
    }
    Ok(())
}

fn export_command(args: &ExportArgs) -> Result<()> {
    let store = SqliteStateStore::open(&args.db)?;
    let incident_id = IncidentId::new(args.incident.clone());
    let rows = store.list_transitions_for_incident(&incident_id)?;
    let event_count = rows.len();

    let output = File::create(&args.out)?;
    let mut writer = BufWriter::new(output);
    for row in &rows {
        writeln!(writer, "{}", serde_json::to_string(&row)?)?;
    }
    writer.flush()?;

    println!("exported {} events to {}", event_count, args.out.display());
    Ok(())
}

fn prompt_and_respond(
    engine: &WorkflowEngine<'_>,
    state: &incident_copilot_domain::WorkflowState,
) -> Result<incident_copilot_domain::WorkflowState> {
    let action = state
        .pending_action
        .as_ref()
        .ok_or_else(|| anyhow!("paused workflow has no pending action"))?;

    eprintln!(
        "Human checkpoint '{}' ({}) for incident {}:",
        action.action_name, action.action_type, state.incident_id
    );
    eprintln!("  {}", action.description);
    eprint!("Approve? [y/N]: ");
    std::io::stderr().flush()?;

    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    let approved = matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes");

    eprint!("Notes (optional): ");
    std::io::stderr().flush()?;
    let mut notes = String::new();
    std::io::stdin().read_line(&mut notes)?;
    let notes = if notes.trim().is_empty() {
        None
    } else {
        Some(notes.trim().to_string())
    };

    let response = ActionResponse {
        action_name: action.action_name,
        approved,
        user_edited: None,
        notes,
        policy_band_override: None,
        responded_by: std::env::var("USER").unwrap_or_else(|_| "human.cli".to_string()),
    };
    engine.respond_to_action(&state.incident_id, state.agent_type, &response)
}

fn print_summary(state: &incident_copilot_domain::WorkflowState) {
    let action_suffix = state
        .pending_action
        .as_ref()
        .map(|action| format!(" action_name={}", action.action_name))
        .unwrap_or_default();
    println!(
        "workflow_id={} incident_id={} agent_type={} step={} version={}{}",
        state.workflow_id,
        state.incident_id,
        state.agent_type,
        state.current_step,
        state.version,
        action_suffix
    );
}

fn load_payload(args: &StartArgs) -> Result<Value> {
    if let Some(path) = &args.payload_file {
        return read_json_file(path);
    }
    if let Some(raw) = &args.payload {
        return serde_json::from_str(raw).map_err(|err| anyhow!("invalid --payload JSON: {err}"));
    }
    Ok(serde_json::json!({}))
}

fn load_retriever(
    evidence_json: Option<&Path>,
    incident_id: &IncidentId,
) -> Result<StaticEvidenceRetriever> {
    let Some(path) = evidence_json else {
        return Ok(StaticEvidenceRetriever::default());
    };
    let raw = read_json_file(path)?;
    let items: Vec<EvidenceItem> = serde_json::from_value(raw)
        .map_err(|err| anyhow!("invalid evidence file {}: {err}", path.display()))?;
    let mut by_incident = BTreeMap::new();
    by_incident.insert(incident_id.as_str().to_string(), items);
    Ok(StaticEvidenceRetriever::with_items(by_incident))
}

fn read_json_file(path: &Path) -> Result<Value> {
    let body = std::fs::read_to_string(path)
        .map_err(|err| anyhow!("failed to read {}: {err}", path.display()))?;
    serde_json::from_str(&body).map_err(|err| anyhow!("invalid JSON in {}: {err}", path.display()))
}

fn parse_agent_type(input: &str) -> Result<AgentType> {
    AgentType::parse(input)
        .ok_or_else(|| anyhow!("invalid agent type '{input}'; use 'triage' or 'resolution'"))
}

fn parse_action_name(input: &str) -> Result<ActionName> {
    let value = Ulid::from_str(input).map_err(|err| anyhow!("invalid action name ULID: {err}"))?;
    Ok(ActionName(value))
}

fn parse_band(input: &str) -> Result<PolicyBand> {
    PolicyBand::parse(input)
        .ok_or_else(|| anyhow!("invalid policy band '{input}'; use auto, propose, or review"))
}
