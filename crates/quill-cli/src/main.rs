//! `quill` command-line interface.
//!
//! Offline scoring, extraction and validation with the built-in domain
//! profiles, plus end-to-end runs against scripted backends.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quill_core::types::{ExtractionResult, ValidationReport};
use quill_core::{BackendTable, CaseRecord, CompiledProfile, DomainProfile, SelectionPolicy};
use quill_runtime::{Engine, EngineConfig, RunEvent, RunOverrides, ScriptBook};

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Score cases, generate artifacts, extract fields, validate drafts", long_about = None)]
#[command(version)]
struct Cli {
    /// Domain profile YAML to use instead of the built-in one
    #[arg(long, global = true)]
    profile: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Yaml,
}

#[derive(Subcommand)]
enum Commands {
    /// List built-in profiles
    Profiles,

    /// Score a case and print its classification
    Score {
        #[arg(long)]
        case: PathBuf,

        #[arg(long)]
        task: String,
    },

    /// Extract structured fields from a draft
    Extract {
        #[arg(long)]
        task: String,

        /// Draft text file
        #[arg(long)]
        input: PathBuf,
    },

    /// Run the checklist over a draft
    Validate {
        #[arg(long)]
        task: String,

        #[arg(long)]
        case: PathBuf,

        /// Draft text file
        #[arg(long)]
        input: PathBuf,
    },

    /// Run the full pipeline against scripted backends
    Run {
        #[arg(long)]
        case: PathBuf,

        #[arg(long)]
        task: String,

        /// Backend script YAML
        #[arg(long)]
        script: PathBuf,

        /// Echo streamed deltas to stderr
        #[arg(long)]
        stream: bool,

        /// Try this backend first
        #[arg(long)]
        backend: Option<String>,

        /// Engine configuration YAML
        #[arg(long)]
        config: Option<PathBuf>,

        /// Backend descriptor table YAML
        #[arg(long)]
        table: Option<PathBuf>,

        /// Selection policy YAML
        #[arg(long)]
        policy: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct ValidateOutput {
    extraction: ExtractionResult,
    report: ValidationReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the result only.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let format = cli.format;

    match cli.command {
        Commands::Profiles => {
            for profile in DomainProfile::builtins().context("Failed to load built-in profiles")? {
                println!(
                    "{:<20} {:<12} {:<22} {}",
                    profile.task_type,
                    profile.domain,
                    format!("{:?}", profile.deficiency_policy),
                    profile.description
                );
            }
        }

        Commands::Score { case, task } => {
            let profile = load_profile(cli.profile.as_deref(), &task)?;
            let case = load_case(&case)?;
            print_output(format, &profile.scorer.score(&case))?;
        }

        Commands::Extract { task, input } => {
            let profile = load_profile(cli.profile.as_deref(), &task)?;
            let draft = read_text(&input)?;
            print_output(format, &profile.extractor.extract(&draft))?;
        }

        Commands::Validate { task, case, input } => {
            let profile = load_profile(cli.profile.as_deref(), &task)?;
            let case = load_case(&case)?;
            let draft = read_text(&input)?;

            let extraction = profile.extractor.extract(&draft);
            let report = profile.validator.validate(&draft, &extraction, &case);
            print_output(format, &ValidateOutput { extraction, report })?;
        }

        Commands::Run {
            case,
            task,
            script,
            stream,
            backend,
            config,
            table,
            policy,
        } => {
            let case = load_case(&case)?;
            let book = ScriptBook::from_yaml_file(&script)
                .with_context(|| format!("Failed to load script {}", script.display()))?;

            let table = match table {
                Some(path) => BackendTable::from_yaml_file(&path)
                    .with_context(|| format!("Failed to load table {}", path.display()))?,
                None => BackendTable::builtin()?,
            };
            let policy = match policy {
                Some(path) => SelectionPolicy::from_yaml_file(&path)
                    .with_context(|| format!("Failed to load policy {}", path.display()))?,
                None => SelectionPolicy::builtin()?,
            };
            let config = match config {
                Some(path) => EngineConfig::from_yaml_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => EngineConfig::default(),
            };

            let mut builder = Engine::builder().config(config).policy(policy);
            for id in table.ids() {
                builder = builder.backend_arc(Arc::new(book.backend(id)));
            }
            builder = builder.table(table);
            builder = match &cli.profile {
                Some(path) => builder.profile(
                    DomainProfile::from_yaml_file(path)
                        .with_context(|| format!("Failed to load profile {}", path.display()))?,
                ),
                None => builder.builtin_profiles(),
            };
            let engine = builder.build().context("Invalid engine configuration")?;

            let overrides = RunOverrides {
                backend,
                streaming: stream.then_some(true),
                ..Default::default()
            };
            let mut handle = engine.start_run(case, &task, overrides)?;

            let echo = handle.events().map(|mut events| {
                tokio::spawn(async move {
                    let mut stderr = std::io::stderr();
                    while let Some(event) = events.recv().await {
                        match event {
                            RunEvent::Delta(delta) if stream => {
                                let _ = write!(stderr, "{}", delta.text);
                                let _ = stderr.flush();
                            }
                            RunEvent::BackendFailed {
                                backend_id, reason, ..
                            } if stream => {
                                let _ = writeln!(stderr, "\n[{} failed: {}]", backend_id, reason);
                            }
                            _ => {}
                        }
                    }
                    if stream {
                        let _ = writeln!(stderr);
                    }
                })
            });

            let result = handle.wait().await;
            if let Some(echo) = echo {
                let _ = echo.await;
            }

            let outcome = result.context("Run failed")?;
            tracing::info!(
                run_id = %outcome.run_id,
                backend = %outcome.final_backend,
                attempts = outcome.backends_attempted.len(),
                verdict = ?outcome.verdict(),
                "Run finished"
            );
            print_output(format, &outcome)?;
        }
    }

    Ok(())
}

fn load_profile(path: Option<&Path>, task: &str) -> Result<CompiledProfile> {
    let profile = match path {
        Some(path) => DomainProfile::from_yaml_file(path)
            .with_context(|| format!("Failed to load profile {}", path.display()))?,
        None => DomainProfile::builtin(task)
            .with_context(|| format!("No built-in profile for task '{}'", task))?,
    };
    if profile.task_type != task {
        anyhow::bail!(
            "Profile serves task '{}', not '{}'",
            profile.task_type,
            task
        );
    }
    CompiledProfile::new(profile).context("Failed to compile profile")
}

fn load_case(path: &Path) -> Result<CaseRecord> {
    CaseRecord::from_json_file(path)
        .with_context(|| format!("Failed to load case {}", path.display()))
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn print_output<T: Serialize>(format: Format, value: &T) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Format::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
