use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use brainx::config::{Config, CONFIG_FILE, KEYS};
use brainx::runlog::{collapse_attempts, read_records, AttemptStatus};
use brainx::{Engine, ExecutionRequest, Params, RunLogger, RunReport, TaskLoader};

#[derive(Parser)]
#[command(name = "brainx")]
#[command(about = "Run named tasks with dependencies, retries and timeouts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: brainx.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more tasks and their dependencies
    Run {
        /// Task names
        #[arg(required = true)]
        tasks: Vec<String>,

        /// Run top-level tasks concurrently
        #[arg(long)]
        parallel: bool,

        /// Parameter passed to every task (key=value, value parsed as JSON when valid)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,

        /// Retries after the first attempt
        #[arg(long)]
        max_retries: Option<u32>,

        /// Per-attempt timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Stop after the first failed task (sequential runs only)
        #[arg(long)]
        fail_fast: bool,
    },

    /// List available tasks
    List,

    /// Show recorded attempts from the run log
    Log {
        /// Only show attempts of this task
        #[arg(short, long)]
        task: Option<String>,

        /// Show the most recent N attempts
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Inspect or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Set one configuration key
    Set { key: String, value: String },
    /// Restore defaults
    Reset,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = std::env::var("BRAINX_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let base_dir = base_dir(&config_path)?;

    let config = Config::load(&config_path)
        .with_context(|| format!("Could not load {}", config_path.display()))?;

    match cli.command {
        Commands::Run {
            tasks,
            parallel,
            params,
            max_retries,
            timeout,
            fail_fast,
        } => {
            let request = ExecutionRequest::new(tasks)
                .params(params.into_iter().collect::<Params>())
                .max_retries(max_retries.unwrap_or(config.max_retries))
                .timeout(timeout.map(Duration::from_secs).unwrap_or_else(|| config.timeout()))
                .parallel(parallel)
                .fail_fast(fail_fast);
            if request.timeout.is_zero() {
                bail!("--timeout must be greater than 0");
            }
            cmd_run(&config, &base_dir, &request)
        }
        Commands::List => cmd_list(&config, &base_dir),
        Commands::Log { task, limit } => cmd_log(&config, &base_dir, task.as_deref(), limit),
        Commands::Config { action } => cmd_config(config, &config_path, action),
    }
}

/// Directory that relative config paths resolve against
fn base_dir(config_path: &Path) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("Could not determine current directory")?;
    let dir = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => cwd.join(parent),
        _ => cwd,
    };
    Ok(dir)
}

fn parse_param(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid parameter '{}': expected key=value", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid parameter '{}': empty key", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn cmd_run(config: &Config, base_dir: &Path, request: &ExecutionRequest) -> Result<()> {
    let loader = TaskLoader::new(config.task_dir(base_dir)?);
    let logger = RunLogger::new(config.log_file(base_dir)?);
    let engine = Engine::new(loader, logger, config.engine_settings())?;

    println!(
        "\n{} Running {} task(s){}\n",
        "▶".cyan().bold(),
        request.tasks.len(),
        if request.parallel && request.tasks.len() > 1 { " in parallel" } else { "" }
    );

    let started = Instant::now();
    let report = engine.run(request);
    print_results(&report);
    print_summary(&report, started.elapsed());

    if let Some(ref err) = report.error {
        bail!("{}", err);
    }
    if !report.success() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_results(report: &RunReport) {
    for result in &report.results {
        for output in &result.outputs {
            println!("{} {}", "✓".green().bold(), output.task.cyan());
            for line in output.output.lines() {
                println!("    {}", line);
            }
        }
        if let Some(ref err) = result.error {
            println!("{} {}", "✗".red().bold(), result.name.cyan());
            println!("    {}", err.to_string().red());
        }
    }
}

fn print_summary(report: &RunReport, elapsed: Duration) {
    let total = report.results.len();
    let failed = report.failed().len();
    let total_time = elapsed.as_millis();

    println!("{}", "─".repeat(50).dimmed());

    if failed == 0 {
        println!(
            "{} All {} task(s) completed successfully ({}ms)",
            "✓".green().bold(),
            total,
            total_time
        );
    } else {
        println!(
            "{} {}/{} task(s) failed ({}ms)",
            "✗".red().bold(),
            failed,
            total,
            total_time
        );

        println!("\n{}", "Failed tasks:".red());
        for result in report.failed() {
            println!("  {} {}", "•".red(), result.name);
        }
    }
}

fn cmd_list(config: &Config, base_dir: &Path) -> Result<()> {
    let loader = TaskLoader::new(config.task_dir(base_dir)?);
    let names = loader.list()?;

    println!("\n{} {}\n", "📦".cyan(), loader.task_dir().display().to_string().bold());

    if names.is_empty() {
        println!("  {}", "No tasks defined".dimmed());
        return Ok(());
    }

    println!("{}", "Tasks:".bold());

    for name in names {
        println!("  {} {}", "•".green(), name.cyan());
        match loader.load(&name) {
            Ok(task) => {
                if let Some(ref description) = task.description {
                    println!("    {} {}", "description:".dimmed(), description);
                }
                if !task.depends_on.is_empty() {
                    println!("    {} {}", "depends_on:".dimmed(), task.depends_on.join(", "));
                }
            }
            Err(e) => println!("    {} {}", "error:".red(), e),
        }
    }
    println!();

    Ok(())
}

fn cmd_log(config: &Config, base_dir: &Path, task: Option<&str>, limit: usize) -> Result<()> {
    let path = config.log_file(base_dir)?;
    let records: Vec<_> = collapse_attempts(read_records(&path)?)
        .into_iter()
        .filter(|r| task.map_or(true, |t| r.task_name == t))
        .collect();

    if records.is_empty() {
        println!("  {}", "No attempts recorded".dimmed());
        return Ok(());
    }

    let skip = records.len().saturating_sub(limit);
    for record in &records[skip..] {
        let status = match record.status {
            AttemptStatus::Completed => record.status.as_str().green(),
            AttemptStatus::Failed => record.status.as_str().red(),
            AttemptStatus::Running => record.status.as_str().yellow(),
        };
        println!(
            "{} {} #{} {} ({:.2}s)",
            record.start_time.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            record.task_name.cyan(),
            record.attempt,
            status,
            record.duration
        );
        if let Some(ref error) = record.error {
            println!("    {}", error.dimmed());
        }
    }

    Ok(())
}

fn cmd_config(mut config: Config, config_path: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            for key in KEYS {
                let value = config.get(key).unwrap_or_default();
                let value = if value.is_empty() { "(default)".dimmed().to_string() } else { value };
                println!("{} = {}", key.cyan(), value);
            }
        }
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save(config_path)?;
            println!("{} {} = {}", "✓".green().bold(), key.cyan(), value);
        }
        ConfigAction::Reset => {
            Config::default().save(config_path)?;
            println!("{} Configuration reset to defaults", "✓".green().bold());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_param_json_and_string() {
        assert_eq!(parse_param("n=3").unwrap(), ("n".to_string(), json!(3)));
        assert_eq!(parse_param("flag=true").unwrap(), ("flag".to_string(), json!(true)));
        assert_eq!(
            parse_param("env=staging").unwrap(),
            ("env".to_string(), json!("staging"))
        );
        assert_eq!(parse_param("url=a=b").unwrap(), ("url".to_string(), json!("a=b")));
    }

    #[test]
    fn test_parse_param_rejects_malformed() {
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["brainx", "run", "a", "b", "--parallel", "-p", "x=1"]).unwrap();
        match cli.command {
            Commands::Run { tasks, parallel, params, .. } => {
                assert_eq!(tasks, vec!["a", "b"]);
                assert!(parallel);
                assert_eq!(params, vec![("x".to_string(), json!(1))]);
            }
            _ => panic!("expected run"),
        }
    }
}
