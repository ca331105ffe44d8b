use std::path::Path;

use tracing::info;

use crate::analysis::SafetyAnalyzer;
use crate::cli::args::{
    AnalyzeArgs, ConfigAction, ConfigArgs, InitArgs, OutputFormat, PreprocessArgs, RunArgs,
    ServeArgs,
};
use crate::config::loader::get_config_path;
use crate::config::types::RunpadConfig;
use crate::error::{Result, RunpadError};
use crate::execution::{Orchestrator, RuntimeTable};
use crate::model::{ExecutionOutput, ExecutionRequest, ExecutionResult, OutputKind, META_PATH};
use crate::preprocess::{rewrite_unsupported, strip_program_wrapper};
use crate::server;

// ============================================================================
// Server
// ============================================================================

/// Start the HTTP server
pub async fn serve(args: ServeArgs, mut config: RunpadConfig) -> Result<()> {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(root) = args.storage_root {
        config.storage.root = Some(root);
    }
    server::serve(&config).await
}

// ============================================================================
// Source Commands
// ============================================================================

/// Execute a source file once (batch mode)
pub async fn run(args: RunArgs, config: RunpadConfig, format: OutputFormat) -> Result<()> {
    info!(file = %args.file.display(), runtime = %args.runtime, "Running source file");

    let code = read_source(&args.file)?;
    let orchestrator = Orchestrator::from_config(&config)?;
    let request = ExecutionRequest::new(code, args.runtime).with_packages(args.packages);
    let result = orchestrator.execute(request).await;

    output_execution_result(&result, format)?;
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

/// Report dangerous API usage
pub async fn analyze(args: AnalyzeArgs, config: RunpadConfig, format: OutputFormat) -> Result<()> {
    let code = read_source(&args.file)?;
    let verdict = SafetyAnalyzer::new(config.safety.policy).analyze(&code);

    match format {
        OutputFormat::Text => {
            if verdict.is_safe {
                println!("No dangerous API usage found");
            }
            for warning in &verdict.warnings {
                println!("{}", warning);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        }
    }

    if !verdict.is_safe {
        std::process::exit(1);
    }
    Ok(())
}

/// Print the source as the backend would receive it
pub async fn preprocess(args: PreprocessArgs, config: RunpadConfig) -> Result<()> {
    let code = read_source(&args.file)?;
    let code = if args.strip_wrapper {
        strip_program_wrapper(
            &code,
            &config.execution.entry_class,
            &config.execution.entry_method,
        )
    } else {
        code
    };
    print!("{}", rewrite_unsupported(&code, &config.preprocess));
    Ok(())
}

/// List runtime tags
pub async fn runtimes(config: RunpadConfig, format: OutputFormat) -> Result<()> {
    let table = RuntimeTable::new(&config.runtimes);
    match format {
        OutputFormat::Text => {
            println!("{:<16} LANGUAGE VERSION", "RUNTIME");
            for info in table.list() {
                println!("{:<16} {}", info.runtime, info.language_version);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&table.list())?);
        }
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

/// Initialize configuration
pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let default_config = RunpadConfig::default();
    let toml_str =
        toml::to_string_pretty(&default_config).map_err(|e| RunpadError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Check a snippet for dangerous API usage");
    println!("  runpad analyze snippet.csx");
    println!();
    println!("  # Run a snippet once");
    println!("  runpad run snippet.csx --package Newtonsoft.Json@13.0.3");
    println!();
    println!("  # Serve batch and streaming execution over HTTP");
    println!("  runpad serve --port 5080");

    Ok(())
}

/// Show configuration
pub async fn config(args: ConfigArgs, config: RunpadConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str =
                toml::to_string_pretty(&config).map_err(|e| RunpadError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| RunpadError::Config(format!("Cannot read {}: {}", path.display(), e)))
}

fn output_execution_result(result: &ExecutionResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for output in &result.outputs {
                print_output(output);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
    }
    Ok(())
}

fn print_output(output: &ExecutionOutput) {
    match output.kind {
        OutputKind::CompileError | OutputKind::RuntimeError => eprintln!("{}", output.content),
        OutputKind::BinaryFile => {
            let path = output
                .metadata
                .get(META_PATH)
                .map(String::as_str)
                .unwrap_or(output.content.as_str());
            println!("[file] {}", path);
        }
        OutputKind::ConsoleInputRequest => {}
        _ => println!("{}", output.content),
    }
}
