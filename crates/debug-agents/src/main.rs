use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use debug_agents::config::AgentConfig;
use debug_agents::{
    Collaborators, KeywordKnowledgeBase, KnowledgeRetriever, LocalSandbox, LoopSettings,
    NoKnowledge, OpenAiCompletionClient, OrchestrationLoop, SessionReport, SessionRequest,
    Supervisor, SupervisorSettings,
};
use diagnostics::context::ContextAssembler;
use diagnostics::project::scan;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "debug-agents",
    about = "Repair failing Python code with a language model, verified in a sandbox",
    version
)]
struct Cli {
    /// Debug-level logging (RUST_LOG still wins when set)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fix a failing file
    Fix {
        /// The Python file that fails
        file: PathBuf,

        /// File holding the traceback, or `-` for stdin
        #[arg(long)]
        trace: String,

        /// Project root for cross-file context
        #[arg(long)]
        project: Option<PathBuf>,

        /// Script that starts the program, relative to the project root
        /// (default: outermost traceback frame in the project)
        #[arg(long, requires = "project")]
        entry: Option<String>,

        #[arg(long, value_enum, default_value_t = Mode::Supervisor)]
        mode: Mode,

        /// Retries after the first attempt (supervisor mode)
        #[arg(long)]
        max_retries: Option<u32>,

        /// Iteration limit (loop mode)
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Print the session report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Scan a project and print the index summary
    Scan {
        dir: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Print the context assembled for one error site
    Context {
        dir: PathBuf,

        /// Failing file, relative to the project root
        #[arg(long)]
        file: String,

        #[arg(long)]
        line: Option<usize>,

        #[arg(long, default_value = "NameError")]
        error_type: String,

        /// The undefined or missing name
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Single-shot fixes with retry
    Supervisor,
    /// Think/act/observe tool loop
    Loop,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let fallback = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

/// `Ok(false)` means the command ran but the session did not find a fix.
async fn run(command: Commands) -> Result<bool> {
    match command {
        Commands::Fix {
            file,
            trace,
            project,
            entry,
            mode,
            max_retries,
            max_iterations,
            json,
        } => {
            let source = std::fs::read_to_string(&file)
                .context(format!("Failed to read {}", file.display()))?;
            let failure_report = read_trace(&trace)?;

            let config_dir = project
                .clone()
                .or_else(|| file.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("."));
            let mut config = AgentConfig::load(&config_dir)?;
            if let Some(n) = max_retries {
                config.debug.max_retries = n;
            }
            if let Some(n) = max_iterations {
                config.debug.max_iterations = n;
            }

            let collaborators = build_collaborators(&config)?;
            let budget = match mode {
                Mode::Supervisor => config.debug.max_retries,
                Mode::Loop => config.debug.max_iterations,
            };
            let mut request = SessionRequest::new(source, failure_report, budget);
            if let Some(root) = &project {
                request = request.with_project(root, relative_to(&file, root));
            }
            if let Some(entry) = entry {
                request = request.with_entry_script(entry);
            }

            info!(file = %file.display(), mode = ?mode, budget, "Debugging session starting");
            let report = match mode {
                Mode::Supervisor => {
                    Supervisor::new(collaborators, SupervisorSettings::from_config(&config))
                        .run(&request)
                        .await?
                }
                Mode::Loop => {
                    OrchestrationLoop::new(collaborators, LoopSettings::from_config(&config))
                        .run(&request)
                        .await?
                }
            };
            print_report(&report, json)?;
            Ok(report.success)
        }

        Commands::Scan { dir, json } => {
            let config = AgentConfig::load(&dir)?;
            let index = scan(&dir, &config.scan)?;
            if json {
                let summary = serde_json::json!({
                    "root": index.root(),
                    "stats": index.stats,
                    "modules": index.module_names(),
                    "symbols": index.symbol_names(),
                    "circular_imports": index.find_circular_imports(),
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let stats = &index.stats;
                println!("Root:      {}", index.root().display());
                println!("Files:     {} ({} skipped by size)", stats.files_scanned, stats.files_skipped_size);
                println!("Symbols:   {}", stats.symbols_indexed);
                println!("Imports:   {} ({} resolved edges)", stats.imports_recorded, stats.resolved_edges);
                for parse_error in &stats.parse_errors {
                    println!("Parse error: {parse_error:?}");
                }
                for cycle in index.find_circular_imports() {
                    println!("Cycle:     {}", cycle.join(" -> "));
                }
                println!("Scanned in {}ms", stats.duration_ms);
            }
            Ok(true)
        }

        Commands::Context {
            dir,
            file,
            line,
            error_type,
            name,
            json,
        } => {
            let config = AgentConfig::load(&dir)?;
            let assembler = ContextAssembler::from_root(&dir, &config.scan)?;
            let bundle =
                assembler.get_context_for_error(&file, line, &error_type, name.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&bundle)?);
            } else {
                print!("{}", bundle.render());
            }
            Ok(true)
        }
    }
}

fn build_collaborators(config: &AgentConfig) -> Result<Collaborators> {
    let completion = OpenAiCompletionClient::new(&config.llm)?;
    let sandbox = LocalSandbox::new(
        &config.debug.interpreter,
        Duration::from_secs(config.debug.sandbox_timeout_secs),
    )?
    .with_memory_limit(config.debug.sandbox_memory_mb);
    let knowledge: Arc<dyn KnowledgeRetriever> = match &config.debug.knowledge_path {
        Some(path) => Arc::new(KeywordKnowledgeBase::from_file(path)?),
        None => Arc::new(NoKnowledge),
    };
    info!(endpoint = %completion.endpoint(), model = %config.llm.model, "Completion client ready");
    Ok(Collaborators::new(Arc::new(completion), Arc::new(sandbox), knowledge))
}

fn read_trace(trace: &str) -> Result<String> {
    if trace == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read traceback from stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(trace).context(format!("Failed to read {trace}"))
    }
}

/// `file` relative to `root` with `/` separators, when it lies under it.
fn relative_to(file: &Path, root: &Path) -> Option<String> {
    let file = file.canonicalize().unwrap_or_else(|_| file.to_path_buf());
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    file.strip_prefix(&root)
        .ok()
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
}

fn print_report(report: &SessionReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let status = if report.success { "FIXED" } else { "NOT FIXED" };
    println!("Status:   {status}");
    println!("Attempts: {}", report.attempt_count);
    if let Some(iterations) = report.iterations {
        println!("Iterations: {iterations}");
    }
    if !report.explanation.is_empty() {
        println!("Explanation: {}", report.explanation);
    }
    println!("\n{}", report.fixed_source.trim_end());
    Ok(())
}
