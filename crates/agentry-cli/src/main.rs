//! Agentry CLI
//!
//! The `agentry` command drives multi-agent build, verify and operate runs.
//!
//! ## Commands
//!
//! - `run`: Execute a run specification
//! - `validate`: Check a run specification without running it
//! - `init`: Write a starter specification
//! - `logs`: Show an NDJSON run log, or summarise agent interactions
//! - `version`: Print version information

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn, Level};

use agentry_core::domain::{kinds, LogFormat, Phase};
use agentry_core::sink::{parse_records, LogRecord};
use agentry_core::{
    load_run_spec, telemetry, ConfigFormat, Engine, RunOutcome, RunSpecification, RunStatus,
    Template,
};
use agentry_io::{open_sinks, LocalExecutor, OpenAiBackend};

const EXIT_OK: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_INVALID: u8 = 2;

const FOLLOW_POLL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "agentry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-agent build, verify and operate orchestration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a run specification
    Run {
        /// Run specification (.json, .yaml, .yml or .toml)
        config: PathBuf,

        /// Validate and print the plan without starting agents
        #[arg(long)]
        dry_run: bool,

        /// Cancel the run after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Also write every run event to this NDJSON file
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,

        /// Exit non-zero when an agent failed or the gate rejected
        #[arg(long)]
        strict: bool,

        /// Project directory agents write into (default: constraints.target_directory)
        #[arg(long, env = "AGENTRY_WORKDIR")]
        workdir: Option<PathBuf>,
    },

    /// Check a run specification without running it
    Validate {
        config: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Write a starter run specification
    Init {
        /// Output file; the extension picks the format
        output: PathBuf,

        #[arg(long, default_value = "minimal")]
        template: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show an NDJSON run log
    Logs {
        file: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Only records whose type or agent id contains this text
        #[arg(long)]
        filter: Option<String>,

        /// Keep printing records as they are appended
        #[arg(long)]
        follow: bool,

        /// Summarise agent messages: who talked to whom, and when
        #[arg(long, conflicts_with = "follow")]
        interactions: bool,
    },

    /// Print version information
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };

    let result = match cli.command {
        Commands::Run {
            config,
            dry_run,
            timeout,
            log_file,
            strict,
            workdir,
        } => {
            let options = RunOptions {
                dry_run,
                timeout: timeout.map(Duration::from_secs),
                log_file,
                strict,
                workdir,
                verbose: cli.verbose,
                json: cli.json,
            };
            cmd_run(&config, options).await
        }
        Commands::Validate { config, format } => {
            telemetry::init_tracing(cli.json, level);
            cmd_validate(&config, format)
        }
        Commands::Init {
            output,
            template,
            force,
        } => {
            telemetry::init_tracing(cli.json, level);
            cmd_init(&output, &template, force)
        }
        Commands::Logs {
            file,
            format,
            filter,
            follow,
            interactions,
        } => {
            telemetry::init_tracing(cli.json, level);
            if interactions {
                cmd_interactions(&file, format).await
            } else {
                cmd_logs(&file, format, filter.as_deref(), follow).await
            }
        }
        Commands::Version => {
            cmd_version();
            Ok(EXIT_OK)
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunOptions {
    dry_run: bool,
    timeout: Option<Duration>,
    log_file: Option<PathBuf>,
    strict: bool,
    workdir: Option<PathBuf>,
    verbose: bool,
    json: bool,
}

async fn cmd_run(config: &Path, options: RunOptions) -> Result<u8> {
    let spec = match load_run_spec(config) {
        Ok(spec) => spec,
        Err(err) => {
            eprintln!("error: {err}");
            return Ok(EXIT_INVALID);
        }
    };

    let level = if options.verbose {
        Level::DEBUG
    } else {
        spec.logging.level.as_tracing()
    };
    telemetry::init_tracing(options.json || spec.logging.format == LogFormat::Json, level);

    if options.dry_run {
        print!("{}", render_plan(&spec));
        return Ok(EXIT_OK);
    }

    let workdir = options
        .workdir
        .clone()
        .unwrap_or_else(|| spec.constraints.target_directory.clone());
    let executor = LocalExecutor::create(&workdir)
        .await
        .with_context(|| format!("Failed to prepare project directory {}", workdir.display()))?;
    let backend = OpenAiBackend::from_env().context("Failed to configure the LLM backend")?;
    let sinks = open_sinks(&spec.logging, options.log_file.as_deref())
        .await
        .context("Failed to open log sinks")?;

    let mut engine = match Engine::new(spec, Arc::new(backend), Arc::new(executor)) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("error: {err}");
            return Ok(EXIT_INVALID);
        }
    };
    for sink in sinks {
        engine = engine.with_sink(sink);
    }

    let handle = engine.handle();
    info!(run_id = %engine.run_id(), workdir = %workdir.display(), "starting run");

    let timeout = options.timeout;
    let watcher = tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("interrupt received, cancelling run"),
            _ = deadline => warn!(timeout_secs = timeout.map(|t| t.as_secs()), "run timed out, cancelling"),
        }
        handle.cancel_run().await.ok();
    });
    let outcome = engine.run().await;
    watcher.abort();
    let outcome = outcome.context("Run failed")?;

    print!("{}", render_summary(&outcome));
    Ok(exit_code(&outcome, options.strict))
}

fn exit_code(outcome: &RunOutcome, strict: bool) -> u8 {
    match outcome.status {
        RunStatus::Aborted => EXIT_FAILED,
        RunStatus::Completed if strict && outcome.has_failures() => EXIT_FAILED,
        RunStatus::Completed => EXIT_OK,
    }
}

fn render_plan(spec: &RunSpecification) -> String {
    let mut out = format!("Project: {}\n", spec.project.name);
    if let Some(verify) = &spec.verify {
        out.push_str(&format!("Verify strategy: {:?}\n", verify.strategy).to_lowercase());
    }
    for phase in [Phase::Build, Phase::Verify, Phase::Operate] {
        let agents = spec.agents_for(phase);
        if agents.is_empty() {
            continue;
        }
        let budget = spec.phase_budget(phase);
        out.push_str(&format!("\n[{phase}] {} instance(s)", budget.instance_count));
        if let Some(cap) = budget.max_cost_usd {
            out.push_str(&format!(", cost cap ${cap:.2}"));
        }
        if let Some(secs) = budget.max_runtime_secs {
            out.push_str(&format!(", time cap {:.0}s", secs));
        }
        out.push('\n');
        for (index, agent) in agents.iter().enumerate() {
            for replica in 1..=agent.count {
                let id = agentry_core::domain::agent_id_for(agent.role, index + 1, replica);
                out.push_str(&format!("  {id:<16} {}\n", agent.model));
            }
        }
    }
    out
}

fn render_summary(outcome: &RunOutcome) -> String {
    let status = match outcome.status {
        RunStatus::Completed => "completed",
        RunStatus::Aborted => "aborted",
    };
    let mut out = format!("\nRun {} {status}", outcome.run_id);
    if let Some(reason) = &outcome.reason {
        out.push_str(&format!(": {reason}"));
    }
    out.push('\n');
    out.push_str(&format!(
        "Cost: ${:.4}  Tokens: {}  Duration: {:.1}s  Events: {}\n",
        outcome.ledger.total.cost_usd,
        outcome.ledger.total.prompt_tokens + outcome.ledger.total.completion_tokens,
        outcome.duration_ms as f64 / 1000.0,
        outcome.events.total_events
    ));
    if let Some(artifact) = &outcome.artifact {
        out.push_str(&format!(
            "Artifact: {} ({} files)\n",
            &artifact.artifact_id[..artifact.artifact_id.len().min(12)],
            artifact.files.len()
        ));
    }
    if let Some(decision) = &outcome.decision {
        match decision {
            agentry_core::PromotionDecision::Promoted => out.push_str("Gate: promoted\n"),
            agentry_core::PromotionDecision::Rejected { violations } => {
                out.push_str("Gate: rejected\n");
                for violation in violations {
                    out.push_str(&format!("  - {}\n", violation.reason));
                }
            }
        }
    }
    out.push_str("\nAgents:\n");
    for agent in &outcome.agents {
        let cost = outcome
            .ledger
            .agents
            .get(&agent.agent_id)
            .map(|u| u.cost_usd)
            .unwrap_or_default();
        out.push_str(&format!(
            "  {:<16} {:<10} ${cost:.4}",
            agent.agent_id,
            format!("{:?}", agent.state).to_lowercase()
        ));
        if let Some(error) = &agent.error {
            out.push_str(&format!("  {error}"));
        }
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ValidationReport {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agents: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn validation_report(config: &Path) -> ValidationReport {
    match load_run_spec(config) {
        Ok(spec) => ValidationReport {
            valid: true,
            agents: Some(
                [Phase::Build, Phase::Verify, Phase::Operate]
                    .into_iter()
                    .map(|p| spec.phase_budget(p).instance_count)
                    .sum(),
            ),
            project: Some(spec.project.name),
            error: None,
        },
        Err(err) => ValidationReport {
            valid: false,
            project: None,
            agents: None,
            error: Some(err.to_string()),
        },
    }
}

fn cmd_validate(config: &Path, format: OutputFormat) -> Result<u8> {
    let report = validation_report(config);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text if report.valid => println!(
            "{}: valid ({}, {} agent instance(s))",
            config.display(),
            report.project.as_deref().unwrap_or_default(),
            report.agents.unwrap_or_default()
        ),
        OutputFormat::Text => println!(
            "{}: invalid: {}",
            config.display(),
            report.error.as_deref().unwrap_or_default()
        ),
    }
    Ok(if report.valid { EXIT_OK } else { EXIT_INVALID })
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path, template: &str, force: bool) -> Result<u8> {
    let template = Template::from_str(template)?;
    let format = ConfigFormat::from_path(output).with_context(|| {
        format!(
            "{}: unsupported extension (expected .json, .yaml, .yml or .toml)",
            output.display()
        )
    })?;
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }
    let content = template.render(format)?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(output, content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Wrote {template:?} template to {}", output.display());
    Ok(EXIT_OK)
}

// ---------------------------------------------------------------------------
// logs
// ---------------------------------------------------------------------------

fn matches_filter(record: &LogRecord, filter: Option<&str>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    record.event_type.contains(filter)
        || record
            .agent_id
            .as_deref()
            .is_some_and(|id| id.contains(filter))
}

fn render_record(record: &LogRecord, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Text => record.render_text(),
        OutputFormat::Json => serde_json::to_string(record)?,
    })
}

fn render_records(text: &str, format: OutputFormat, filter: Option<&str>) -> Result<Vec<String>> {
    parse_records(text)
        .iter()
        .filter(|r| matches_filter(r, filter))
        .map(|r| render_record(r, format))
        .collect()
}

async fn cmd_logs(
    file: &Path,
    format: OutputFormat,
    filter: Option<&str>,
    follow: bool,
) -> Result<u8> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    // Only complete lines; a partial trailing line is picked up when following.
    let mut offset = text.rfind('\n').map_or(0, |i| i + 1);
    for line in render_records(&text[..offset], format, filter)? {
        println!("{line}");
    }
    if !follow {
        return Ok(EXIT_OK);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(EXIT_OK),
            _ = tokio::time::sleep(FOLLOW_POLL) => {}
        }
        let text = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        if text.get(offset..).is_none() {
            // Truncated or replaced: start over.
            offset = 0;
        }
        let Some(end) = text[offset..].rfind('\n').map(|i| offset + i + 1) else {
            continue;
        };
        for line in render_records(&text[offset..end], format, filter)? {
            println!("{line}");
        }
        offset = end;
    }
}

/// Agent messages in a log. Messages without a `to` are broadcasts (`*`).
#[derive(Debug, Default, Serialize)]
struct InteractionSummary {
    total_messages: usize,
    pairs: Vec<InteractionPair>,
    timeline: Vec<Interaction>,
}

#[derive(Debug, Serialize, PartialEq)]
struct InteractionPair {
    from: String,
    to: String,
    count: usize,
}

#[derive(Debug, Serialize)]
struct Interaction {
    seq: u64,
    ts: chrono::DateTime<chrono::Utc>,
    from: String,
    to: String,
}

fn interaction_summary(records: &[LogRecord]) -> InteractionSummary {
    let timeline: Vec<Interaction> = records
        .iter()
        .filter(|r| r.event_type == kinds::AGENT_MESSAGE)
        .map(|r| Interaction {
            seq: r.seq,
            ts: r.ts,
            from: r.agent_id.clone().unwrap_or_else(|| "engine".to_string()),
            to: r
                .payload
                .get("to")
                .and_then(|v| v.as_str())
                .unwrap_or("*")
                .to_string(),
        })
        .collect();

    let mut counts: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    for item in &timeline {
        *counts.entry((&item.from, &item.to)).or_default() += 1;
    }
    let pairs = counts
        .into_iter()
        .map(|((from, to), count)| InteractionPair {
            from: from.to_string(),
            to: to.to_string(),
            count,
        })
        .collect();

    InteractionSummary {
        total_messages: timeline.len(),
        pairs,
        timeline,
    }
}

fn render_interactions(summary: &InteractionSummary, format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(summary)?);
    }
    let mut out = format!("{} agent messages\n", summary.total_messages);
    if summary.total_messages == 0 {
        return Ok(out);
    }
    out.push_str("\ninteractions:\n");
    for pair in &summary.pairs {
        out.push_str(&format!("  {} -> {}: {}\n", pair.from, pair.to, pair.count));
    }
    out.push_str("\ntimeline:\n");
    for item in &summary.timeline {
        out.push_str(&format!(
            "  #{:<5} {} {} -> {}\n",
            item.seq,
            item.ts.format("%H:%M:%S%.3f"),
            item.from,
            item.to
        ));
    }
    Ok(out)
}

async fn cmd_interactions(file: &Path, format: OutputFormat) -> Result<u8> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let summary = interaction_summary(&parse_records(&text));
    print!("{}", render_interactions(&summary, format)?);
    Ok(EXIT_OK)
}

// ---------------------------------------------------------------------------
// version
// ---------------------------------------------------------------------------

fn cmd_version() {
    println!("agentry {}", env!("CARGO_PKG_VERSION"));
    println!("config formats: json, yaml, toml");
    println!("backend: openai-compatible ({})", agentry_io::openai::DEFAULT_BASE_URL);
}
