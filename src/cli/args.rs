use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::model::PackageRef;

#[derive(Parser, Debug)]
#[clap(name = "runpad")]
#[clap(version, about = "Snippet execution server with sandboxed storage and interactive sessions")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "RUNPAD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),

    /// Execute a source file once and print its result
    Run(RunArgs),

    /// Report dangerous API usage in a source file
    Analyze(AnalyzeArgs),

    /// Print a source file as it would be handed to the backend
    Preprocess(PreprocessArgs),

    /// List known runtime tags and their language versions
    Runtimes,

    /// Initialize a new runpad configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Server
// ============================================================================

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind (overrides the config file)
    #[clap(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides the config file)
    #[clap(short, long)]
    pub port: Option<u16>,

    /// Sandbox root (overrides the config file)
    #[clap(long)]
    pub storage_root: Option<PathBuf>,
}

// ============================================================================
// Source Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Source file to execute
    pub file: PathBuf,

    /// Target runtime tag
    #[clap(short, long, default_value = ".net8.0")]
    pub runtime: String,

    /// Package dependency (id@version), repeatable
    #[clap(long = "package", short = 'p', value_parser = parse_package)]
    pub packages: Vec<PackageRef>,
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Source file to analyze
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct PreprocessArgs {
    /// Source file to preprocess
    pub file: PathBuf,

    /// Unwrap a full program down to its entry method body
    #[clap(long)]
    pub strip_wrapper: bool,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

fn parse_package(s: &str) -> Result<PackageRef, String> {
    // Format: id@version
    match s.split_once('@') {
        Some((id, version)) if !id.is_empty() && !version.is_empty() => {
            Ok(PackageRef::new(id, version))
        }
        _ => Err("Package format: id@version".to_string()),
    }
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_package() {
        let package = parse_package("Newtonsoft.Json@13.0.3").unwrap();
        assert_eq!(package, PackageRef::new("Newtonsoft.Json", "13.0.3"));
        assert!(parse_package("NoVersion").is_err());
        assert!(parse_package("@1.0").is_err());
    }

    #[test]
    fn test_run_command_line() {
        let cli = Cli::try_parse_from([
            "runpad", "-vv", "--format", "json", "run", "main.csx", "-p", "Dapper@2.1.35",
        ])
        .unwrap();
        assert_eq!(cli.global_opts.verbose, 2);
        assert!(matches!(cli.global_opts.format, OutputFormat::Json));
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.runtime, ".net8.0");
                assert_eq!(args.packages.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
