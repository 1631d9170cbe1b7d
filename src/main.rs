use anyhow::{Result, bail};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use zkhydra::config::Config;
use zkhydra::output;
use zkhydra::runner::{self, RunSettings};
use zkhydra::tools::{Analyzer, ToolRegistry};

const LOG_FILE: &str = "zkhydra.log";

#[derive(Parser)]
#[command(
    name = "zkhydra",
    about = "Run ZK-circuit security analyzers and score their findings against known bugs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (defaults to zkhydra.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Also write logs to <output>/zkhydra.log
    #[arg(long, global = true)]
    log_file: bool,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Comma-separated tool names, or "all"
    #[arg(long, default_value = "all")]
    tools: String,

    /// Circuit language
    #[arg(long, default_value = "circom")]
    dsl: String,

    /// Per-tool timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Directory the timestamped run directory is created in
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run analyzers on one circuit, without ground truth
    Analyze {
        /// Circuit file
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run analyzers on one bug and judge them against its ground truth
    Evaluate {
        /// Bug directory or its zkbugs_config.json
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Evaluate every bug in a zkbugs dataset
    Zkbugs {
        /// Dataset root, searched recursively for zkbugs_config.json
        #[arg(short, long)]
        dataset: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Re-parse the stored tool output of a previous run
    Reprocess {
        /// Run directory to reprocess in place
        #[arg(short, long)]
        output: PathBuf,

        /// Re-evaluate against ground truth (reviewed items are kept)
        #[arg(long)]
        eval: bool,
    },

    /// Rebuild summary.json and manual_review_todo.md for a run directory
    Summarize {
        /// Run directory
        run_dir: PathBuf,
    },

    /// List available analyzers
    Tools,
}

impl Command {
    fn log_dir(&self, config: &Config) -> PathBuf {
        let explicit = match self {
            Self::Analyze { run, .. } | Self::Evaluate { run, .. } | Self::Zkbugs { run, .. } => run.output.clone(),
            Self::Reprocess { output, .. } => Some(output.clone()),
            Self::Summarize { run_dir } => Some(run_dir.clone()),
            Self::Tools => None,
        };
        explicit.unwrap_or_else(|| config.app.output.clone())
    }
}

fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(format!("zkhydra={level}")))?;
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

fn select_tools(registry: &ToolRegistry, config: &Config, run: &RunArgs) -> Result<Vec<Arc<dyn Analyzer>>> {
    let dsl = run.dsl.to_ascii_lowercase();
    if dsl != "circom" {
        bail!("Unsupported DSL '{}': only circom is supported", run.dsl);
    }
    let names = config.tool_names(&run.tools, &dsl);
    let tools = registry.resolve(&names);
    if tools.is_empty() {
        bail!(
            "No tools resolved from '{}'. Available: {}",
            run.tools,
            registry.names().join(", ")
        );
    }
    Ok(tools)
}

fn settings(config: &Config, run: &RunArgs) -> Result<RunSettings> {
    let timeout = run.timeout.unwrap_or(config.app.timeout);
    if timeout == 0 {
        bail!("--timeout must be greater than 0");
    }
    Ok(RunSettings {
        output: run.output.clone().unwrap_or_else(|| config.app.output.clone()),
        timeout: Duration::from_secs(timeout),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = Config::resolve(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.app.log_level = level.clone();
    }
    let log_file = (cli.log_file || config.app.file_logging).then(|| cli.command.log_dir(&config).join(LOG_FILE));
    init_logging(&config.app.log_level, log_file.as_deref())?;

    let registry = ToolRegistry::with_defaults(&config.tools);

    match cli.command {
        Command::Analyze { input, run } => {
            let tools = select_tools(&registry, &config, &run)?;
            let summary = runner::analyze(&tools, &input, &settings(&config, &run)?).await?;
            output::print_analyze(&summary);
        }
        Command::Evaluate { input, run } => {
            let tools = select_tools(&registry, &config, &run)?;
            let summary = runner::evaluate(&tools, &input, &settings(&config, &run)?).await?;
            output::print_summary(&summary);
        }
        Command::Zkbugs { dataset, run } => {
            let tools = select_tools(&registry, &config, &run)?;
            let summary = runner::zkbugs(&tools, &dataset, &settings(&config, &run)?).await?;
            output::print_summary(&summary);
        }
        Command::Reprocess { output: run_dir, eval } => {
            let summary = runner::reprocess(&registry, &run_dir, eval)?;
            output::print_summary(&summary);
        }
        Command::Summarize { run_dir } => {
            let summary = output::rebuild(&run_dir)?;
            output::print_summary(&summary);
        }
        Command::Tools => {
            for tool in registry.all() {
                println!("{:<14} {}", tool.name(), tool.policy());
            }
        }
    }
    Ok(())
}
