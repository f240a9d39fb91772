#![forbid(unsafe_code)]

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use insight_harness::contract::{route_intent, validate_intent};
use insight_harness::gateway::{ProviderGateway, TracingUsageSink};
use insight_harness::plan::ColumnProfile;
use insight_harness::recovery::{recover_array, recover_object};
use insight_harness::schema::SchemaName;
use insight_harness::Settings;

#[derive(Parser)]
#[command(name = "insight", version, about = "Structured-output tooling for LLM data analysis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Dialect {
    Gemini,
    Openai,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a compiled response schema
    Schema {
        /// One of: action_response, plan_list, refined_plans, intent_contract,
        /// data_transform, filter_function
        name: SchemaName,
        #[arg(long, value_enum, default_value = "openai")]
        dialect: Dialect,
    },
    /// Recover JSON from noisy model output (file path or '-' for stdin)
    Recover {
        input: PathBuf,
        /// Recover an array instead of an object
        #[arg(long)]
        array: bool,
    },
    /// Validate an intent contract (file path or '-' for stdin)
    Intent { input: PathBuf },
    /// Route a question through the configured provider
    Route {
        #[arg(long)]
        question: String,
        /// JSON array of {"name", "type"} column profiles
        #[arg(long)]
        columns: PathBuf,
        /// Settings JSON file; environment variables are used otherwise
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Schema { name, dialect } => {
            let compiled = name.compiled()?;
            match dialect {
                Dialect::Gemini => print_json(&compiled.gemini)?,
                Dialect::Openai => print_json(&compiled.openai)?,
            }
        }
        Commands::Recover { input, array } => {
            let raw = read_input(&input)?;
            if array {
                print_json(&recover_array(&raw)?)?;
            } else {
                print_json(&recover_object(&raw)?)?;
            }
        }
        Commands::Intent { input } => {
            let raw = read_input(&input)?;
            let candidate = Value::Object(recover_object(&raw)?);
            match validate_intent(&candidate) {
                Ok(contract) => print_json(&contract)?,
                Err(violations) => {
                    print_json(&violations.violations())?;
                    bail!("{} contract violation(s)", violations.violations().len());
                }
            }
        }
        Commands::Route {
            question,
            columns,
            config,
        } => {
            let settings = match config {
                Some(path) => Settings::from_json_file(&path)?,
                None => Settings::from_env()?,
            };
            let columns: Vec<ColumnProfile> = serde_json::from_str(&read_input(&columns)?)
                .context("columns must be a JSON array of {\"name\", \"type\"} objects")?;
            let gateway = ProviderGateway::from_settings(&settings, Arc::new(TracingUsageSink))?;
            let contract = route_intent(
                &gateway,
                &settings.retry_policy(),
                &settings.chat_model(),
                &question,
                &columns,
                None,
            )
            .await?;
            print_json(&contract)?;
        }
    }

    Ok(())
}
