//! Stackform CLI entrypoint.
//!
//! Reports and plans go to stdout; progress, prompts and logs go to stderr.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stackform::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use stackform::config::{ConfigParser, StackDeclaration, StateBackend, find_config_file};
use stackform::engine::{Engine, EngineConfig};
use stackform::error::Result;
use stackform::graph::GraphBuilder;
use stackform::model::ResourceValidator;
use stackform::planner::{ApplyReport, CancelToken, Plan};
use stackform::provider::{HttpProvisioner, ProviderSettings, Provisioner};
use stackform::state::{
    LocalStateStore, MemoryStateStore, RunOperation, STATE_DIR, StateStore, generate_holder_id,
};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.output);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool, output: OutputFormat) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match output {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph { dot } => cmd_graph(config, dot, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply {
            yes,
            fail_fast,
            parallelism,
        } => cmd_apply(config, yes, fail_fast, parallelism, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new stack directory.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("stackform.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Declaration already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/stack.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.lines().any(|l| l.trim() == state_entry);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Stackform")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set the provider token");
    eprintln!("  2. Edit stackform.yaml to describe your resources");
    eprintln!("  3. Run 'stackform validate' to check the declaration");
    eprintln!("  4. Run 'stackform plan' to see what will change");
    eprintln!("  5. Run 'stackform apply' to provision the stack");

    Ok(())
}

/// Validate the declaration and its graph.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (declaration, _) = load_declaration(config_path)?;

    let report = ResourceValidator::new().check(&declaration);
    emit(&formatter.format_validation(&report, show_warnings))?;
    if !report.is_valid() {
        return Ok(ExitCode::FAILURE);
    }

    let graph = GraphBuilder::new().build(&declaration.resources)?;
    eprintln!(
        "\n{}: {} resources, {} dependencies",
        declaration.qualified_name(),
        graph.len(),
        graph.edge_count()
    );

    Ok(ExitCode::SUCCESS)
}

/// Print the dependency graph.
fn cmd_graph(config_path: Option<&PathBuf>, dot: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (declaration, _) = load_declaration(config_path)?;

    ResourceValidator::new().validate_stack(&declaration)?;
    let graph = GraphBuilder::new().build(&declaration.resources)?;
    emit(&formatter.format_graph(&graph, dot))?;

    Ok(ExitCode::SUCCESS)
}

/// Show the plan.
async fn cmd_plan(config_path: Option<&PathBuf>, detailed: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (declaration, config_file) = load_declaration(config_path)?;
    let store = create_state_store(&declaration, &config_file);
    let engine = build_engine(&declaration, EngineConfig::from_provider(&declaration.provider), store)?;

    let plan = engine.plan(&declaration).await?;
    emit(&formatter.format_plan(&plan, detailed))?;

    Ok(ExitCode::SUCCESS)
}

/// Apply the plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    fail_fast: bool,
    parallelism: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (declaration, config_file) = load_declaration(config_path)?;
    let store = create_state_store(&declaration, &config_file);

    let mut engine_config = EngineConfig::from_provider(&declaration.provider).with_fail_fast(fail_fast);
    if let Some(parallelism) = parallelism {
        engine_config = engine_config.with_parallelism(parallelism.max(1));
    }
    let engine = build_engine(&declaration, engine_config, store)?;

    let plan = engine.plan(&declaration).await?;
    emit(&formatter.format_plan(&plan, false))?;

    if !plan.has_changes() {
        return Ok(ExitCode::SUCCESS);
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let report = execute_locked(&engine, &plan, RunOperation::Apply).await?;
    emit(&formatter.format_report(&report))?;

    Ok(exit_code(&report))
}

/// Destroy every recorded resource.
async fn cmd_destroy(config_path: Option<&PathBuf>, auto_approve: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (declaration, config_file) = load_declaration(config_path)?;
    let store = create_state_store(&declaration, &config_file);
    let engine = build_engine(&declaration, EngineConfig::from_provider(&declaration.provider), store)?;

    let plan = engine.plan_destroy(&declaration).await?;
    if !plan.has_changes() {
        eprintln!("No resources to destroy.");
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("The following resources will be destroyed:");
    for change in plan.changes.actionable() {
        let handle = change.recorded_handle.as_ref().map_or("", |h| h.as_str());
        eprintln!("  - {} ({}) {handle}", change.resource, change.kind);
    }

    if !auto_approve && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let report = execute_locked(&engine, &plan, RunOperation::Destroy).await?;
    emit(&formatter.format_report(&report))?;

    Ok(exit_code(&report))
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (declaration, config_file) = load_declaration(config_path)?;
    let store = create_state_store(&declaration, &config_file);
    let engine = build_engine(&declaration, EngineConfig::from_provider(&declaration.provider), store)?;

    let report = engine.check_drift(&declaration).await?;
    emit(&formatter.format_drift(&report))?;

    Ok(ExitCode::SUCCESS)
}

/// State management commands.
async fn cmd_state(config_path: Option<&PathBuf>, command: StateCommands, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (declaration, config_file) = load_declaration(config_path)?;
    let store = create_state_store(&declaration, &config_file);

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                emit(&formatter.format_state(&state))?;
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            eprintln!("State locked: {} (expires {})", lock.lock_id, lock.expires_at);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = store.get_lock_info().await? {
                    store.release_lock(&lock.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Runs a plan under the stack lock, cancelling on Ctrl-C.
async fn execute_locked(engine: &Engine, plan: &Plan, operation: RunOperation) -> Result<ApplyReport> {
    let lock = engine.store().acquire_lock(&generate_holder_id()).await?;
    debug!("Acquired stack lock {}", lock.lock_id);

    let cancel = CancelToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted: waiting for in-flight changes to finish");
                cancel.cancel();
            }
        })
    };

    let result = engine.execute(plan, operation, &cancel).await;
    interrupt.abort();

    if let Err(e) = engine.store().release_lock(&lock.lock_id).await {
        warn!("Failed to release stack lock {}: {e}", lock.lock_id);
    }

    result
}

fn exit_code(report: &ApplyReport) -> ExitCode {
    if report.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Asks for confirmation on stderr and compares the answer.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes formatted output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", output.trim_end())?;
    Ok(())
}

/// Resolves the declaration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads `.env` and the declaration with environment overrides.
fn load_declaration(config_path: Option<&PathBuf>) -> Result<(StackDeclaration, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading declaration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;

    let declaration = parser.load_with_env(&config_file)?;
    Ok((declaration, config_file))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Creates the state store selected by the declaration.
fn create_state_store(declaration: &StackDeclaration, config_file: &Path) -> Arc<dyn StateStore> {
    match declaration.state.backend {
        StateBackend::Local => {
            let dir = declaration
                .state
                .path
                .as_ref()
                .map_or_else(|| config_dir(config_file).join(STATE_DIR), PathBuf::from);
            Arc::new(LocalStateStore::with_base_dir(dir))
        }
        StateBackend::Memory => {
            warn!("Using the memory state backend: nothing will be persisted");
            Arc::new(MemoryStateStore::new())
        }
    }
}

/// Builds the engine over the HTTP provisioner.
fn build_engine(declaration: &StackDeclaration, config: EngineConfig, store: Arc<dyn StateStore>) -> Result<Engine> {
    let token = ConfigParser::get_provider_token();
    if token.is_none() {
        debug!("No provider token set; requests will be unauthenticated");
    }

    let settings = ProviderSettings::from_config(&declaration.provider, token);
    let provider: Arc<dyn Provisioner> = Arc::new(HttpProvisioner::new(settings)?);

    Ok(Engine::new(config, provider, store))
}
