use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use logicforge::correction::{self, CancelFlag, CorrectionConfig, TranspileRequest, TranspileResult};
use logicforge::dsl::ast::Variable;
use logicforge::dsl::cluster::Strategy;
use logicforge::dsl::error::Defect;
use logicforge::dsl::render::render_program;
use logicforge::dsl::{self, CheckReport};
use logicforge::error::AppError;
use logicforge::llm::{GenerationService, HttpGenerationService, OfflineService};
use logicforge::settings::{self, LlmConfigInfo, LlmProvider, TranspilerSettings};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "logicforge", about = "Pseudocode DSL to Python workflow transpiler", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory override
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// JSON file with the upstream variables (`[{name, type, value}]`)
    #[arg(long, global = true)]
    vars: Option<PathBuf>,

    /// Output raw JSON instead of formatted text
    #[arg(long, global = true)]
    json: bool,

    /// More logging (-v debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a DSL file
    Check { file: PathBuf },
    /// Apply deterministic repairs and print the repaired DSL
    Repair { file: PathBuf },
    /// Repair and compile a DSL file without regeneration
    Compile {
        file: PathBuf,
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,
        /// Write the Python program here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Run the full self-correction loop with the configured provider
    Transpile {
        /// First draft. Without it the provider writes the first draft.
        file: Option<PathBuf>,
        #[arg(long)]
        requirement: String,
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Settings management
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Show current settings (API key redacted)
    Show,
    /// Print the JSON schema of settings.json
    Schema,
    /// Store the API key (empty string removes it)
    SetKey { key: String },
    /// Choose the generation provider
    SetProvider {
        #[arg(value_enum)]
        provider: LlmProvider,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
}

// ── Helpers ──────────────────────────────────────────────────────

/// `RUST_LOG` wins when set; otherwise `-v` picks the level.
fn filter_directives(verbose: u8, rust_log: Option<String>) -> String {
    match rust_log {
        Some(directives) if !directives.trim().is_empty() => directives,
        _ if verbose > 0 => "debug".to_string(),
        _ => "warn".to_string(),
    }
}

fn init_tracing(verbose: u8) {
    let directives = filter_directives(verbose, std::env::var(EnvFilter::DEFAULT_ENV).ok());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_writer(std::io::stderr)
        .init();
}

fn config_dir(cli: &Cli) -> Result<PathBuf, AppError> {
    cli.config_dir
        .clone()
        .or_else(logicforge::paths::default_config_dir)
        .ok_or_else(|| AppError::NotFound {
            what: "config directory".to_string(),
        })
}

fn read_source(path: &Path) -> Result<String, AppError> {
    std::fs::read_to_string(path).map_err(|e| AppError::IoError {
        message: format!("{}: {e}", path.display()),
    })
}

fn load_variables(path: Option<&Path>) -> Result<Vec<Variable>, AppError> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let text = read_source(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Print defects to stderr. Pass the text the spans refer to, or "" to
/// omit source lines.
fn print_defects(defects: &[Defect], source: &str) {
    for defect in defects {
        eprintln!("{}", defect.format_with_source(source));
    }
    let errors = defects.iter().filter(|d| d.is_error()).count();
    eprintln!("{errors} error(s), {} warning(s)", defects.len() - errors);
}

fn write_program(program: &str, output: Option<&Path>) -> Result<(), AppError> {
    match output {
        Some(path) => {
            std::fs::write(path, program)?;
            eprintln!("Wrote {}", path.display());
        }
        None => print!("{program}"),
    }
    Ok(())
}

// ── Commands ─────────────────────────────────────────────────────

fn run_check(file: &Path, vars: &[Variable], settings: &TranspilerSettings, json: bool) -> Result<bool, AppError> {
    let source = read_source(file)?;
    let options = CorrectionConfig::from(&settings.correction).validate;
    let report = dsl::check_source(&source, vars, &options);
    if json {
        print_json(&serde_json::json!({
            "clean": report.is_clean(),
            "defects": report.defects,
        }));
    } else if report.defects.is_empty() {
        println!("No defects.");
    } else {
        print_defects(&report.defects, &source);
    }
    Ok(report.is_clean())
}

fn run_repair(file: &Path, vars: &[Variable], settings: &TranspilerSettings, json: bool) -> Result<bool, AppError> {
    let source = read_source(file)?;
    let config = CorrectionConfig::from(&settings.correction);
    let mut report: CheckReport = dsl::check_source(&source, vars, &config.validate);
    let mut fixed = Vec::new();
    let mut renames = Vec::new();

    for _ in 0..config.max_repair_rounds {
        if report.is_clean() {
            break;
        }
        let round = dsl::repair_report(&report, vars, &config.validate);
        if !round.made_progress() {
            break;
        }
        fixed.extend(round.fixed);
        renames.extend(round.renames);
        report = round.report;
    }

    let repaired = render_program(&report.statements);
    if json {
        print_json(&serde_json::json!({
            "clean": report.is_clean(),
            "dsl": repaired,
            "fixed": fixed,
            "renames": renames,
            "defects": report.defects,
        }));
    } else {
        print!("{repaired}");
        for rename in &renames {
            eprintln!(
                "renamed {} -> {} ({}, line {})",
                rename.original,
                rename.replacement,
                rename.reason.label(),
                rename.span
            );
        }
        eprintln!("{} defect(s) fixed", fixed.len());
        if !report.defects.is_empty() {
            print_defects(&report.defects, &source);
        }
    }
    Ok(report.is_clean())
}

fn report_result(
    result: &TranspileResult,
    output: Option<&Path>,
    json: bool,
) -> Result<bool, AppError> {
    if json {
        print_json(&serde_json::to_value(result)?);
        return Ok(result.is_success());
    }

    if let Some(program) = &result.program {
        write_program(program, output)?;
        if !result.defects.is_empty() {
            print_defects(&result.defects, "");
        }
        eprintln!(
            "Session {} succeeded after {} attempt(s)",
            result.session_id, result.attempts_used
        );
        return Ok(true);
    }

    eprintln!(
        "Session {} failed after {} attempt(s): {:?}",
        result.session_id, result.attempts_used, result.failure
    );
    for record in &result.attempt_log {
        eprintln!(
            "  attempt {}: {:?} ({} -> {} error(s))",
            record.attempt_number, record.action_taken, record.defects_before, record.defects_after
        );
    }
    print_defects(&result.defects, "");
    Ok(false)
}

async fn run_session(
    request: &TranspileRequest,
    service: &dyn GenerationService,
    config: &CorrectionConfig,
    settings: &TranspilerSettings,
    config_dir: &Path,
) -> TranspileResult {
    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling after the current step");
            on_interrupt.cancel();
        }
    });

    let result = correction::transpile(request, service, config, &cancel).await;
    if settings.correction.persist_attempt_logs {
        if let Some(path) =
            logicforge::audit::log_attempts(config_dir, result.session_id, &result.attempt_log)
        {
            tracing::debug!(path = %path.display(), "attempt log written");
        }
    }
    result
}

fn run_settings(action: &SettingsAction, config_dir: &Path, json: bool) -> Result<(), AppError> {
    match action {
        SettingsAction::Show => {
            let settings = settings::load_or_default(config_dir)?;
            let value = serde_json::json!({
                "config_dir": config_dir,
                "llm": LlmConfigInfo::from_config(&settings.llm),
                "correction": settings.correction,
            });
            if json {
                print_json(&value);
            } else {
                let info = LlmConfigInfo::from_config(&settings.llm);
                println!("Config dir: {}", config_dir.display());
                println!("Provider:   {:?}", info.provider);
                println!("API key:    {}", if info.has_api_key { "set" } else { "not set" });
                if let Some(url) = &info.base_url {
                    println!("Base URL:   {url}");
                }
                if let Some(model) = &info.model {
                    println!("Model:      {model}");
                }
                let c = &settings.correction;
                println!("Strategy:   {:?}", c.strategy);
                println!("Attempts:   {} (timeout {}s, {} repair rounds)", c.max_attempts, c.generation_timeout_secs, c.max_repair_rounds);
                println!("Nesting:    {}", c.max_nesting_depth);
            }
        }
        SettingsAction::Schema => {
            print_json(&serde_json::to_value(settings::settings_schema())?);
        }
        SettingsAction::SetKey { key } => {
            settings::save_api_key(config_dir, key.trim())?;
            println!("{}", if key.trim().is_empty() { "API key removed." } else { "API key saved." });
        }
        SettingsAction::SetProvider {
            provider,
            base_url,
            model,
        } => {
            let mut settings = settings::load_or_default(config_dir)?;
            settings.llm.provider = *provider;
            settings.llm.base_url.clone_from(base_url);
            settings.llm.model.clone_from(model);
            settings::save_settings(config_dir, &settings)?;
            println!("Provider set to {provider:?}.");
        }
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<bool, AppError> {
    let config_dir = config_dir(cli)?;
    if let Commands::Settings { action } = &cli.command {
        run_settings(action, &config_dir, cli.json)?;
        return Ok(true);
    }

    let settings = settings::load_or_default(&config_dir)?;
    let vars = load_variables(cli.vars.as_deref())?;

    match &cli.command {
        Commands::Check { file } => run_check(file, &vars, &settings, cli.json),
        Commands::Repair { file } => run_repair(file, &vars, &settings, cli.json),
        Commands::Compile {
            file,
            strategy,
            output,
        } => {
            let mut config = CorrectionConfig::from(&settings.correction);
            config.max_attempts = 1;
            if let Some(strategy) = strategy {
                config.strategy = *strategy;
            }
            let request = TranspileRequest {
                requirement: String::new(),
                variables: vars,
                draft: Some(read_source(file)?),
            };
            let result = run_session(&request, &OfflineService, &config, &settings, &config_dir).await;
            report_result(&result, output.as_deref(), cli.json)
        }
        Commands::Transpile {
            file,
            requirement,
            strategy,
            max_attempts,
            output,
        } => {
            let service = HttpGenerationService::new(&settings.llm)
                .map_err(|message| AppError::NoProvider { message })?;
            let mut config = CorrectionConfig::from(&settings.correction);
            if let Some(strategy) = strategy {
                config.strategy = *strategy;
            }
            if let Some(n) = max_attempts {
                config.max_attempts = (*n).max(1);
            }
            let draft = match file {
                Some(path) => Some(read_source(path)?),
                None => None,
            };
            let request = TranspileRequest {
                requirement: requirement.clone(),
                variables: vars,
                draft,
            };
            let result = run_session(&request, &service, &config, &settings, &config_dir).await;
            report_result(&result, output.as_deref(), cli.json)
        }
        Commands::Settings { .. } => Ok(true),
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(2);
        }
    }
}
