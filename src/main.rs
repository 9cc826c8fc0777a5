//! scriptbox - CLI entry point
//!
//! Runs one untrusted script against a JSON input and prints the JSON form of
//! its `result` to stdout. Diagnostics and logs go to stderr so stdout only
//! ever carries the result.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use scriptbox::compiler::DEFAULT_FILENAME;
use scriptbox::config::PolicyConfig;
use scriptbox::sandbox::{parse_input, ExecutionReport, Sandbox};
use scriptbox::SandboxError;

/// Exit status when the script raised.
const EXIT_RUNTIME_ERROR: u8 = 1;
/// Exit status when the script was rejected by the compiler.
const EXIT_COMPILE_ERROR: u8 = 2;
/// Exit status for bad arguments, input or policy (EX_USAGE).
const EXIT_USAGE: u8 = 64;

/// How the script text is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum RunMode {
    /// A program; the outcome is whatever it assigns to `result`
    #[default]
    Exec,
    /// A single expression; the outcome is its value
    Eval,
}

/// scriptbox - Run untrusted scripts in a restricted sandbox
///
/// The script sees the JSON input as `input` and reports back by assigning
/// `result`. Attribute access, item access and iteration are guarded and only
/// safe builtins are available.
///
/// # Examples
///
/// Add two fields:
///     scriptbox --script "result = input['a'] + input['b']" --input '{"a": 2, "b": 3}'
///
/// Run a file under a custom policy:
///     scriptbox --script-file job.py --policy ./policy.json --input '[1, 2, 3]'
///
/// Show what a script can reach:
///     scriptbox --list-capabilities
#[derive(Parser, Debug)]
#[command(name = "scriptbox")]
#[command(about = "Run untrusted scripts in a restricted sandbox")]
#[command(version)]
pub struct Cli {
    /// Script source text
    #[arg(
        long,
        conflicts_with = "script_file",
        required_unless_present_any = ["script_file", "list_capabilities"]
    )]
    script: Option<String>,

    /// Read the script from a file instead
    #[arg(long, short = 'f')]
    script_file: Option<PathBuf>,

    /// JSON value bound to `input`
    #[arg(long, short = 'i', default_value = "null")]
    input: String,

    /// Path to a policy JSON file
    ///
    /// Restricts the available builtins and adds blocked attributes.
    /// Without one, every safe builtin is available.
    #[arg(long, short = 'p')]
    policy: Option<PathBuf>,

    /// Interpret the script as a program or as one expression
    #[arg(long, short = 'm', value_enum, default_value_t = RunMode::Exec)]
    mode: RunMode,

    /// Echo the script's print output to stderr
    #[arg(long)]
    show_output: bool,

    /// Print the capability table as JSON and exit
    #[arg(long)]
    list_capabilities: bool,

    /// Enable debug logging
    ///
    /// Logs policy loading, invocation state changes and captured output
    /// to stderr.
    #[arg(long, short = 'd')]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => return ExitCode::from(report_usage(&err)),
    };

    if let Err(err) = initialize_logging(cli.debug) {
        eprintln!("Error: {:#}", err);
        return ExitCode::from(EXIT_USAGE);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(EXIT_USAGE)
        }
    }
}

/// Prints a clap usage error or help text and returns the exit status.
///
/// `--help` and `--version` come back as errors too; they exit 0.
fn report_usage(err: &clap::Error) -> u8 {
    if let Err(io) = err.print() {
        eprintln!("Error: failed to print usage: {}", io);
    }
    if err.use_stderr() {
        EXIT_USAGE
    } else {
        0
    }
}

/// Loads the policy, runs the script and reports the outcome.
///
/// Usage-level failures come back as `Err`; compile and runtime failures are
/// reported here and mapped to their exit codes.
async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_policy(cli.policy.as_deref())?;
    let sandbox = Sandbox::new(config).context("Failed to create sandbox")?;

    if cli.list_capabilities {
        let table = serde_json::to_string_pretty(sandbox.capabilities())
            .context("Failed to serialize capability table")?;
        println!("{}", table);
        return Ok(ExitCode::SUCCESS);
    }

    let (source, filename) = read_script(cli.script.as_deref(), cli.script_file.as_deref())?;
    let input = parse_input(&cli.input).context("Failed to parse --input")?;
    let mode = cli.mode;

    let outcome = tokio::task::spawn_blocking(move || match mode {
        RunMode::Exec => sandbox.execute_named(&source, &filename, input),
        RunMode::Eval => sandbox.evaluate_named(&source, &filename, input),
    })
    .await
    .context("Sandbox task failed")?;

    match outcome {
        Ok(report) => {
            if cli.show_output {
                eprint!("{}", report.printed);
            }
            println!("{}", render_result(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("{}", err);
            Ok(ExitCode::from(exit_code(&err)))
        }
    }
}

/// Loads the policy file, or the default policy when none is given.
fn load_policy(path: Option<&Path>) -> Result<PolicyConfig> {
    match path {
        Some(path) => {
            tracing::info!("Loading policy from: {}", path.display());
            PolicyConfig::from_file(path)
        }
        None => {
            tracing::debug!("Using default policy");
            Ok(PolicyConfig::default())
        }
    }
}

/// Returns the script source and the filename used in diagnostics.
fn read_script(script: Option<&str>, script_file: Option<&Path>) -> Result<(String, String)> {
    match (script, script_file) {
        (Some(source), _) => Ok((source.to_string(), DEFAULT_FILENAME.to_string())),
        (None, Some(path)) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read script file: {}", path.display()))?;
            Ok((source, path.display().to_string()))
        }
        (None, None) => anyhow::bail!("No script given; use --script or --script-file"),
    }
}

fn render_result(report: &ExecutionReport) -> Result<String> {
    serde_json::to_string(&report.result_or_null()).context("Failed to serialize result")
}

fn exit_code(err: &SandboxError) -> u8 {
    match err {
        SandboxError::Compile(_) => EXIT_COMPILE_ERROR,
        SandboxError::Execution(_) | SandboxError::Worker(_) => EXIT_RUNTIME_ERROR,
        SandboxError::InvalidInput(_) | SandboxError::Config(_) => EXIT_USAGE,
    }
}

/// Initializes the logging system.
///
/// Logs go to stderr. The default level is `warn`, or `debug` when `debug`
/// is set; `RUST_LOG` overrides both.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
fn initialize_logging(debug: bool) -> Result<()> {
    let log_level = if debug { "debug" } else { "warn" };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
