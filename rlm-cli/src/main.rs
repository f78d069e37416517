//! Thin command-line front end for the RLM runtime.
//!
//! Grounded on `kowalski-rlm/examples/basic_rlm.rs`'s builder-then-execute
//! shape and on the `clap::Parser`/`Subcommand` derive idiom used throughout
//! the example pack's agent CLIs (e.g. an interactive chat loop reading
//! lines from stdin). Owns process-wide concerns a library crate must not:
//! subscriber installation, argument parsing, and exit status.

use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rlm_driver::{Rlm, RlmSession};
use serde_json::json;

#[derive(Parser)]
#[command(name = "rlm", author, version, about = "Recursive Language Model runtime CLI", long_about = None)]
struct Cli {
    /// Path to a TOML config file. Defaults to the platform config
    /// directory (`rlm/config.toml`) if present, otherwise built-in
    /// defaults.
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ConfigOverrides {
    /// Backend kind: "direct" (Ollama-style `/api/generate`) or
    /// "http_proxy"/"openai_compat".
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Base URL of the root backend's provider.
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Model name passed to the provider.
    #[arg(long, global = true)]
    model: Option<String>,

    /// API key, for backends that need one.
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Environment kind: in_process, subprocess, container, remote.
    #[arg(long, global = true)]
    environment: Option<String>,

    /// Maximum recursion depth.
    #[arg(long, global = true)]
    max_depth: Option<u32>,

    /// Maximum iterations per completion before DEFAULT_ANSWER.
    #[arg(long, global = true)]
    max_iterations: Option<u32>,

    /// Print per-iteration tracing events at debug level regardless of
    /// `RUST_LOG`.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single completion and print the final answer.
    Run {
        /// The task text. Reads stdin if omitted.
        prompt: Option<String>,
    },
    /// Run an interactive, persistent-session REPL over stdin/stdout.
    Chat,
    /// Print the resolved configuration as JSON and exit.
    PrintConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    install_tracing(cli.overrides.verbose);

    let config = resolve_config(&cli.config, &cli.overrides)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start the tokio runtime")?;
    runtime.block_on(run(config, cli.command))
}

fn install_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

fn resolve_config(
    config_path: &Option<std::path::PathBuf>,
    overrides: &ConfigOverrides,
) -> Result<rlm_core::RlmConfig> {
    let mut config = match config_path {
        Some(path) => rlm_core::RlmConfig::load_from_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load config from {}: {e}", path.display()))?,
        None => match rlm_core::RlmConfig::default_config_path() {
            Some(path) if path.exists() => rlm_core::RlmConfig::load_from_file(&path)
                .map_err(|e| anyhow::anyhow!("failed to load config from {}: {e}", path.display()))?,
            _ => rlm_core::RlmConfig::default(),
        },
    };
    config = config.apply_env_overrides();

    if let Some(backend) = &overrides.backend {
        config.backend.backend = backend.clone();
    }
    if let Some(base_url) = &overrides.base_url {
        config.backend.backend_kwargs.insert("base_url".to_string(), json!(base_url));
    }
    if let Some(model) = &overrides.model {
        config.backend.backend_kwargs.insert("model_name".to_string(), json!(model));
    }
    if let Some(api_key) = &overrides.api_key {
        config.backend.backend_kwargs.insert("api_key".to_string(), json!(api_key));
    }
    if let Some(environment) = &overrides.environment {
        config.environment = environment.clone();
    }
    if let Some(max_depth) = overrides.max_depth {
        config.max_depth = max_depth;
    }
    if let Some(max_iterations) = overrides.max_iterations {
        config.max_iterations = max_iterations;
    }
    if overrides.verbose {
        config.verbose = true;
    }

    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}

async fn run(config: rlm_core::RlmConfig, command: Commands) -> Result<()> {
    match command {
        Commands::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run { prompt } => {
            let prompt = match prompt {
                Some(prompt) => prompt,
                None => read_stdin_to_string()?,
            };
            let rlm = Rlm::from_config(config).map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let completion = rlm.completion(prompt).await.context("completion failed")?;
            print_completion(&completion);
            Ok(())
        }
        Commands::Chat => chat_loop(config).await,
    }
}

async fn chat_loop(config: rlm_core::RlmConfig) -> Result<()> {
    let mut config = config;
    config.persistent = true;
    let session = RlmSession::from_config(config).map_err(|e| anyhow::anyhow!(e.to_string()))?;

    println!("rlm chat — persistent session. Empty line to exit.");
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }

        match session.completion(line).await {
            Ok(completion) => print_completion(&completion),
            Err(err) => eprintln!("error: {err}"),
        }
    }

    session.close().await.map_err(|e| anyhow::anyhow!(e.to_string()))
}

fn read_stdin_to_string() -> Result<String> {
    let mut buf = String::new();
    io::Read::read_to_string(&mut io::stdin(), &mut buf).context("failed to read prompt from stdin")?;
    Ok(buf)
}

fn print_completion(completion: &rlm_core::ChatCompletion) {
    if completion.is_error() {
        eprintln!(
            "error ({}): {}",
            completion.error_type.as_deref().unwrap_or("unknown"),
            completion.error.as_deref().unwrap_or("")
        );
    }
    println!("{}", completion.response);
    tracing::info!(
        root_model = %completion.root_model,
        elapsed_ms = completion.execution_time.as_millis() as u64,
        "completion finished"
    );
}
