//! Screener CLI - compile queries to SQL, or serve the compile API.
//!
//! Usage:
//!   screener compile <query.json> [--risky] [--diagram] [--config <toml>]
//!   screener serve [--port <port>] [--risky] [--config <toml>]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use screener::compile::{compile, CompileOptions};
use screener::config::Config;
use screener::query::UserQuery;
use screener::web::server;

#[derive(Parser)]
#[command(name = "screener")]
#[command(about = "Compiles declarative screener queries to parameterized ClickHouse SQL")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a query file to SQL
    Compile {
        /// Path to the UserQuery JSON file
        file: PathBuf,

        /// Enable the risky optimizer passes
        #[arg(long)]
        risky: bool,

        /// Print the Mermaid diagram instead of SQL
        #[arg(long)]
        diagram: bool,

        /// Path to a screener.toml config (market-data default otherwise)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Serve the compile API over HTTP
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        /// Enable the risky optimizer passes
        #[arg(long)]
        risky: bool,

        /// Path to a screener.toml config (market-data default otherwise)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Compile {
            file,
            risky,
            diagram,
            config,
        } => cmd_compile(file, risky, diagram, config),
        Commands::Serve {
            port,
            risky,
            config,
        } => cmd_serve(port, risky, config).await,
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config, ExitCode> {
    Config::load(path.as_deref()).map_err(|err| {
        eprintln!("Error loading config: {}", err);
        ExitCode::FAILURE
    })
}

fn cmd_compile(
    file: PathBuf,
    risky: bool,
    diagram: bool,
    config_path: Option<PathBuf>,
) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let source = match std::fs::read_to_string(&file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Error reading file '{}': {}", file.display(), err);
            return ExitCode::FAILURE;
        }
    };

    let query: UserQuery = match serde_json::from_str(&source) {
        Ok(query) => query,
        Err(err) => {
            eprintln!("Invalid query JSON: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let options = CompileOptions::default().with_risky(risky);
    match compile(&query, &config, options) {
        Ok(output) => {
            if diagram {
                println!("{}", output.diagram);
            } else {
                println!("{}", output.sql);
                if !output.parameters.is_empty() {
                    let parameters = serde_json::Value::Object(output.parameters);
                    match serde_json::to_string_pretty(&parameters) {
                        Ok(text) => println!("\n-- parameters\n{}", text),
                        Err(err) => eprintln!("Error rendering parameters: {}", err),
                    }
                }
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Compilation failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_serve(port: u16, risky: bool, config_path: Option<PathBuf>) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let options = CompileOptions::default().with_risky(risky);
    match server::serve(config, options, port).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Server error: {}", err);
            ExitCode::FAILURE
        }
    }
}
