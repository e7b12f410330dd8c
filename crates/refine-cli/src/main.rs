//! Refine - targeted content refinement CLI
//!
//! The `refine` command runs the refinement loop against remote evaluator,
//! generation and verification services.
//!
//! ## Commands
//!
//! - `run`: Refine a lesson and write an auditable report artifact
//! - `show`: Verify and print a recorded report artifact
//! - `config`: Print the resolved run configuration
//! - `rubric`: Validate a rubric file, or print the standard rubric

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use refine_core::{
    write_report_artifact, ConfigOverrides, EvaluatorPanel, LessonContent, PanelMember,
    PlanDisplay, RefinementConfig, RefinementEngine, RefinementMode, RefinementOutcome,
    RefinementReport, RefinementRequest, Rubric,
};
use refine_http::{HttpEvaluator, HttpGenerationService, HttpVerificationService, ServiceEndpoint};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};

const DEFAULT_ARTIFACTS_DIR: &str = ".refine/runs";

#[derive(Parser)]
#[command(name = "refine")]
#[command(version = refine_core::VERSION)]
#[command(about = "Targeted content refinement with a multi-judge panel", long_about = None)]
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
    /// Refine a lesson until it is accepted or a stop condition is reached
    Run {
        /// Path to the lesson content (JSON)
        #[arg(long)]
        content: PathBuf,

        /// Operating mode: semi-auto or full-auto
        #[arg(short, long, default_value = "semi-auto")]
        mode: RefinementMode,

        /// TOML file with configuration overrides
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Rubric definition (TOML or JSON); defaults to the standard rubric
        #[arg(long)]
        rubric: Option<PathBuf>,

        /// Source material files handed to the judges
        #[arg(long = "source")]
        sources: Vec<PathBuf>,

        /// Root directory for report artifacts (default: .refine/runs)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Always consult all three judges instead of the two-judge fast path
        #[arg(long)]
        full_panel: bool,

        /// Do not print progress events to stdout
        #[arg(long)]
        no_progress: bool,

        #[command(flatten)]
        services: ServiceArgs,
    },

    /// Verify a recorded report artifact and print it
    Show {
        /// Run ID to show
        run: String,

        /// Root directory containing report artifacts (default: .refine/runs)
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,
    },

    /// Print the resolved configuration as TOML
    Config {
        /// Operating mode: semi-auto or full-auto
        #[arg(short, long, default_value = "semi-auto")]
        mode: RefinementMode,

        /// TOML file with configuration overrides
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Validate a rubric file, or print the standard rubric as JSON
    Rubric {
        /// Rubric definition (TOML or JSON)
        file: Option<PathBuf>,
    },
}

/// Where the remote services live.
#[derive(clap::Args, Debug)]
struct ServiceArgs {
    /// Evaluator base URLs: two primaries, optionally followed by the tiebreaker
    #[arg(long = "evaluator", env = "REFINE_EVALUATOR_URLS", value_delimiter = ',')]
    evaluator_urls: Vec<String>,

    /// Tiebreaker evaluator base URL
    #[arg(long = "tiebreaker", env = "REFINE_TIEBREAKER_URL")]
    tiebreaker_url: Option<String>,

    /// Generation service base URL
    #[arg(long, env = "REFINE_GENERATOR_URL")]
    generator_url: String,

    /// Verification judge base URL (defaults to the tiebreaker evaluator)
    #[arg(long, env = "REFINE_VERIFIER_URL")]
    verifier_url: Option<String>,

    /// Bearer token sent to every service
    #[arg(long, env = "REFINE_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Per-call timeout in seconds
    #[arg(long, env = "REFINE_SERVICE_TIMEOUT_SECS", default_value = "60")]
    service_timeout_secs: u64,
}

impl ServiceArgs {
    fn endpoint(&self, url: &str) -> ServiceEndpoint {
        let endpoint = ServiceEndpoint::new(url)
            .with_timeout(Duration::from_secs(self.service_timeout_secs));
        match &self.api_token {
            Some(token) => endpoint.with_token(token.clone()),
            None => endpoint,
        }
    }

    /// The three judge URLs: two primaries then the tiebreaker.
    fn judge_urls(&self) -> Result<[&str; 3]> {
        match (self.evaluator_urls.as_slice(), self.tiebreaker_url.as_deref()) {
            ([a, b], Some(c)) => Ok([a.as_str(), b.as_str(), c]),
            ([a, b, c], None) => Ok([a.as_str(), b.as_str(), c.as_str()]),
            (urls, tiebreaker) => anyhow::bail!(
                "Expected two evaluators plus a tiebreaker, got {} evaluator URL(s) and {}",
                urls.len(),
                if tiebreaker.is_some() {
                    "a tiebreaker"
                } else {
                    "no tiebreaker"
                }
            ),
        }
    }

    fn panel(&self, full_panel: bool) -> Result<EvaluatorPanel> {
        let [a, b, c] = self.judge_urls()?;
        let member = |id: &str, url: &str| -> Result<PanelMember> {
            let judge = HttpEvaluator::new(id, self.endpoint(url))
                .with_context(|| format!("Failed to create evaluator client for {url}"))?;
            Ok(PanelMember::new(Arc::new(judge)))
        };
        let (a, b, c) = (member("judge-a", a)?, member("judge-b", b)?, member("judge-c", c)?);
        Ok(if full_panel {
            EvaluatorPanel::full_panel(a, b, c)
        } else {
            EvaluatorPanel::fast_path(a, b, c)
        })
    }

    /// Falls back to the tiebreaker judge.
    fn verifier_url(&self) -> Option<&str> {
        self.verifier_url
            .as_deref()
            .or_else(|| self.judge_urls().ok().map(|[_, _, c]| c))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    refine_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            content,
            mode,
            config,
            rubric,
            sources,
            out,
            full_panel,
            no_progress,
            services,
        } => {
            cmd_run(RunArgs {
                content,
                mode,
                config,
                rubric,
                sources,
                out,
                full_panel,
                no_progress,
                services,
            })
            .await
        }
        Commands::Show { run, artifacts_dir } => cmd_show(&run, artifacts_dir.as_deref()),
        Commands::Config { mode, config } => cmd_config(mode, config.as_deref()),
        Commands::Rubric { file } => cmd_rubric(file.as_deref()),
    }
}

struct RunArgs {
    content: PathBuf,
    mode: RefinementMode,
    config: Option<PathBuf>,
    rubric: Option<PathBuf>,
    sources: Vec<PathBuf>,
    out: Option<PathBuf>,
    full_panel: bool,
    no_progress: bool,
    services: ServiceArgs,
}

/// Mode defaults, then the optional TOML overrides.
fn resolve_config(mode: RefinementMode, path: Option<&Path>) -> Result<RefinementConfig> {
    let mut builder = RefinementConfig::builder(mode);
    if let Some(path) = path {
        let overrides = ConfigOverrides::from_toml_file(path)
            .with_context(|| format!("Failed to load config overrides: {:?}", path))?;
        builder = builder.overrides(&overrides);
    }
    builder.build().context("Invalid refinement configuration")
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {what}: {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid {what} JSON: {:?}", path))
}

/// Rubrics are TOML when the extension says so, JSON otherwise.
fn read_rubric(path: &Path) -> Result<Rubric> {
    let rubric: Rubric = if path.extension().is_some_and(|ext| ext == "toml") {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rubric: {:?}", path))?;
        toml::from_str(&raw).with_context(|| format!("Invalid rubric TOML: {:?}", path))?
    } else {
        read_json(path, "rubric")?
    };
    rubric
        .validate()
        .with_context(|| format!("Rubric rejected: {:?}", path))?;
    Ok(rubric)
}

fn artifacts_root(dir: Option<&Path>) -> PathBuf {
    dir.map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACTS_DIR))
}

/// Run one refinement and record its report
async fn cmd_run(args: RunArgs) -> Result<()> {
    let config = resolve_config(args.mode, args.config.as_deref())?;
    let lesson: LessonContent = read_json(&args.content, "lesson")?;
    let rubric = match &args.rubric {
        Some(path) => read_rubric(path)?,
        None => Rubric::standard(),
    };
    let sources = args
        .sources
        .iter()
        .map(|p| {
            std::fs::read_to_string(p).with_context(|| format!("Failed to read source: {:?}", p))
        })
        .collect::<Result<Vec<_>>>()?;

    let services = &args.services;
    let panel = services.panel(args.full_panel)?;
    let generator = HttpGenerationService::new(services.endpoint(&services.generator_url))
        .context("Failed to create generation client")?;
    let verifier_url = services
        .verifier_url()
        .context("No verifier URL and no evaluator URLs configured")?;
    let verifier = HttpVerificationService::new(services.endpoint(verifier_url))
        .context("Failed to create verification client")?;

    let engine = RefinementEngine::new(config, panel, Arc::new(generator), Arc::new(verifier))
        .context("Failed to build refinement engine")?;
    info!(run_id = %engine.run_id(), lesson = %lesson.id, "starting refinement");

    let mut events = engine.subscribe();
    let print_progress = !args.no_progress;
    let printer = tokio::spawn(async move {
        let mut display = PlanDisplay::default();
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    display.apply(&envelope.event);
                    if print_progress {
                        match serde_json::to_string(&envelope) {
                            Ok(line) => println!("{line}"),
                            Err(e) => warn!(error = %e, "failed to encode progress event"),
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "progress consumer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        display
    });

    let request = RefinementRequest::new(lesson)
        .with_rubric(rubric)
        .with_source_materials(sources);
    let result = engine.run(request).await;
    drop(engine);
    let display = printer.await.context("Progress printer task failed")?;
    let report = result.context("Refinement run failed")?;

    let root = artifacts_root(args.out.as_deref());
    let path = write_report_artifact(&report, &root)
        .with_context(|| format!("Failed to write report artifact under {:?}", root))?;

    print_summary(&report, &display);
    eprintln!("Report written to {:?}", path);
    Ok(())
}

fn print_summary(report: &RefinementReport, display: &PlanDisplay) {
    eprintln!("Run:         {}", report.run_id);
    eprintln!("Outcome:     {}", report.outcome.kind());
    match &report.outcome {
        RefinementOutcome::Accepted { score, .. } => {
            eprintln!("Score:       {:.3}", score);
        }
        RefinementOutcome::Escalated {
            reason, best_score, ..
        } => {
            eprintln!("Reason:      {:?}", reason);
            if let Some(score) = best_score {
                eprintln!("Best score:  {:.3}", score);
            }
        }
        RefinementOutcome::BestEffort(best) => {
            eprintln!(
                "Best score:  {:.3} (iteration {}, {:?})",
                best.best_score, best.iteration, best.quality_status
            );
            for hint in &best.improvement_hints {
                eprintln!("  hint: {}", hint);
            }
        }
        RefinementOutcome::RestartRequired {
            section_id, reason, ..
        } => {
            eprintln!("Restart:     section {} ({})", section_id, reason);
        }
    }
    if let Some(stop) = &report.stop_reason {
        eprintln!("Stopped:     {}", stop);
    }
    eprintln!("Iterations:  {}", report.iterations);
    eprintln!("Tokens:      {}", report.tokens_used);
    for (section, reason) in &report.locked_sections {
        eprintln!("Locked:      {} ({})", section, reason);
    }
    if report.requires_human_review || display.requires_human_review {
        eprintln!("Judges disagreed: human review recommended");
    }
}

/// Verify a recorded report and print it
fn cmd_show(run_id: &str, artifacts_dir: Option<&Path>) -> Result<()> {
    let root = artifacts_root(artifacts_dir);
    let artifact = refine_core::read_report_artifact(run_id, &root)
        .with_context(|| format!("Failed to load report for run {}", run_id))?;
    let json = serde_json::to_string_pretty(&artifact.report)?;
    println!("{}", json);
    eprintln!("Report digest verified: {}", artifact.report_digest);
    Ok(())
}

fn cmd_config(mode: RefinementMode, path: Option<&Path>) -> Result<()> {
    let config = resolve_config(mode, path)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    print!("{}", rendered);
    Ok(())
}

fn cmd_rubric(file: Option<&Path>) -> Result<()> {
    let Some(path) = file else {
        println!("{}", serde_json::to_string_pretty(&Rubric::standard())?);
        return Ok(());
    };
    let rubric = read_rubric(path)?;
    println!("Rubric OK: {} criteria", rubric.criteria.len());
    Ok(())
}
