use clap::{Parser, Subcommand};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use wit_bridge::abi::{FlatType, MAX_FLAT_PARAMS, MAX_FLAT_RESULTS, TypeDesc};
use wit_bridge::config::{ConfigError, LogFormat, LoggingConfig, RuntimeConfig};
use wit_bridge::wit::{WitTypeError, load_wit_type_from_string};

/// CLI-specific errors.
#[derive(Error, Debug)]
pub enum AppError {
    /// Library error (wraps all wit_bridge errors)
    #[error(transparent)]
    Library(#[from] wit_bridge::Error),

    /// IO error
    #[error("IO error reading '{path}': {source}")]
    Io { path: String, source: std::io::Error },

    /// Invalid log filter
    #[error("Invalid log filter '{0}'")]
    LogFilter(String),
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        Self::Library(e.into())
    }
}

#[derive(Parser)]
#[command(name = "wit-bridge")]
#[command(about = "Inspect canonical ABI layouts and runtime configuration")]
struct Cli {
    /// Runtime configuration used for logging
    #[arg(short, long, global = true, env = "WIT_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the canonical ABI layout of a WIT type
    Layout {
        /// Path to the WIT file containing the type definition
        #[arg(short, long)]
        wit: PathBuf,

        /// Name of the type to use (if not specified, uses the first type found)
        #[arg(short = 't', long)]
        type_name: Option<String>,
    },

    /// Validate a runtime configuration file
    CheckConfig {
        /// Path to the TOML configuration
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprint!("{}", format_error(&err));
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), AppError> {
    let logging = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)?.logging,
        None => LoggingConfig::default(),
    };
    init_logging(&logging)?;

    match cli.command {
        Commands::Layout { wit, type_name } => {
            let definition = read_file(&wit)?;
            let (_, _, desc) = load_wit_type_from_string(&definition, type_name.as_deref())?;
            tracing::debug!(kind = ?desc.kind(), "type loaded");
            print!("{}", describe_layout(&desc));
        }
        Commands::CheckConfig { file } => {
            let config = RuntimeConfig::from_file(&file)?;
            tracing::info!(path = %file.display(), "configuration is valid");
            println!("encoding:    {}", config.options.encoding.name());
            println!("memory_size: {}", config.connection.memory_size);
            println!("timeout:     {:?}", config.connection.timeout());
            println!("log level:   {}", config.logging.level);
        }
    }
    Ok(())
}

fn read_file(path: &Path) -> Result<String, AppError> {
    std::fs::read_to_string(path).map_err(|source| AppError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn flat_name(ty: FlatType) -> &'static str {
    match ty {
        FlatType::I32 => "i32",
        FlatType::I64 => "i64",
        FlatType::F32 => "f32",
        FlatType::F64 => "f64",
    }
}

fn describe_layout(desc: &TypeDesc) -> String {
    let flat = desc.flat_types();
    let names: Vec<_> = flat.iter().map(|ty| flat_name(*ty)).collect();
    let mut output = String::new();
    output.push_str(&format!("size:      {}\n", desc.size()));
    output.push_str(&format!("alignment: {}\n", desc.alignment()));
    output.push_str(&format!("flat:      [{}]\n", names.join(", ")));
    output.push_str(&format!("as param:  {}\n", if flat.len() > MAX_FLAT_PARAMS { "spilled to memory" } else { "flat" }));
    output.push_str(&format!(
        "as result: {}\n",
        if flat.len() > MAX_FLAT_RESULTS { "returned through memory" } else { "flat" }
    ));
    output
}

fn init_logging(config: &LoggingConfig) -> Result<(), AppError> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directive) => EnvFilter::try_new(&directive).map_err(|_| AppError::LogFilter(directive))?,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|_| AppError::LogFilter(config.level.clone()))?,
    };
    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Text => registry
            .with(fmt::layer().with_ansi(io::stderr().is_terminal()).with_writer(io::stderr))
            .init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(io::stderr)).init(),
    }
    Ok(())
}

fn format_error(err: &AppError) -> String {
    let use_colors = io::stderr().is_terminal();

    let (red, yellow, reset) = if use_colors {
        ("\x1b[0;31m", "\x1b[0;33m", "\x1b[0m")
    } else {
        ("", "", "")
    };

    let mut output = format!("{}Error:{} {}\n", red, reset, err);

    if let Some(hint) = get_error_hint(err) {
        output.push_str(&format!("{}Hint:{} {}\n", yellow, reset, hint));
    }

    output
}

/// Get a helpful hint for common errors
fn get_error_hint(err: &AppError) -> Option<&'static str> {
    match err {
        AppError::Library(wit_bridge::Error::WitType(WitTypeError::TypeNotFound(_))) => {
            Some("Check the type name with --type-name, or omit it to use the first named type")
        }
        AppError::Library(wit_bridge::Error::WitType(WitTypeError::Unsupported(_))) => {
            Some("Futures, streams, maps and error-context have no canonical layout here")
        }
        AppError::Library(wit_bridge::Error::Config(ConfigError::Parse(_))) => {
            Some("Valid sections are [options], [connection] and [logging]")
        }
        AppError::LogFilter(_) => Some("Use a tracing filter such as 'info' or 'wit_bridge=debug'"),
        _ => None,
    }
}
