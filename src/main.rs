use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cloudrecon::identity;
use cloudrecon::retry::ErrorClass;
use cloudrecon::{diff, Attributes, CallClass, EngineConfig};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Version injected at compile time via CLOUDRECON_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("CLOUDRECON_VERSION") {
    Some(v) => v,
    None => "dev",
};

/// Inspect identities, diffs and retry schedules of the reconciliation engine
#[derive(Parser, Debug)]
#[command(name = "cloudrecon", version = VERSION, about, long_about = None)]
struct Args {
    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode or decode composite identities
    Id {
        #[command(subcommand)]
        action: IdAction,
    },
    /// Diff two JSON attribute files
    Diff {
        /// Desired attributes (JSON object)
        #[arg(long)]
        desired: PathBuf,
        /// Observed attributes (JSON object)
        #[arg(long)]
        observed: PathBuf,
        /// Keys owned by someone else, comma separated
        #[arg(long, value_delimiter = ',')]
        unmanaged: Vec<String>,
    },
    /// Print the un-jittered backoff schedule for a call class
    Backoff {
        #[arg(long, value_enum, default_value = "read")]
        class: ClassArg,
        /// Treat failures as throttling (applies the rate-limit floor)
        #[arg(long)]
        throttled: bool,
        #[arg(long, default_value_t = 8)]
        attempts: u32,
    },
    /// Show or initialize the engine configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum IdAction {
    Encode {
        #[arg(required = true)]
        components: Vec<String>,
    },
    Decode {
        id: String,
        #[arg(long)]
        arity: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration to the config path
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClassArg {
    Read,
    Write,
}

impl From<ClassArg> for CallClass {
    fn from(arg: ClassArg) -> Self {
        match arg {
            ClassArg::Read => CallClass::Read,
            ClassArg::Write => CallClass::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let tracing_level = level.to_tracing_level()?;

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Logging disabled, cannot open {:?}: {}", log_path, e);
            return None;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("cloudrecon {} started with log level: {:?}", VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Some(guard)
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("cloudrecon").join("cloudrecon.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".cloudrecon").join("cloudrecon.log");
    }
    PathBuf::from("cloudrecon.log")
}

fn read_attributes(path: &Path) -> Result<Attributes> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("{:?} is not a JSON object", path))
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Id { action } => match action {
            IdAction::Encode { components } => {
                println!("{}", identity::encode(&components)?);
            }
            IdAction::Decode { id, arity } => {
                let components = identity::decode(&id, arity)?;
                println!("{}", serde_json::to_string_pretty(&components)?);
            }
        },
        Command::Diff {
            desired,
            observed,
            unmanaged,
        } => {
            let desired = read_attributes(&desired)?;
            let observed = read_attributes(&observed)?;
            let unmanaged: BTreeSet<String> = unmanaged.into_iter().collect();
            let result = diff(&desired, &observed, &unmanaged);
            tracing::debug!("Diff touches {} key(s)", result.len());
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Backoff {
            class,
            throttled,
            attempts,
        } => {
            let config = EngineConfig::load();
            let controller = config.retry.controller(class.into());
            let error_class = if throttled {
                ErrorClass::RateLimited
            } else {
                ErrorClass::Transient
            };
            let mut total = std::time::Duration::ZERO;
            for attempt in 0..attempts.min(controller.max_attempts) {
                let wait = controller.wait(attempt, error_class);
                total += wait;
                println!("attempt {:>3}: wait {:.1?} (total {:.1?})", attempt + 1, wait, total);
            }
            println!("budget: {:?}", controller.policy.budget());
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                let config = EngineConfig::load();
                if let Some(path) = EngineConfig::config_path() {
                    println!("# {}", path.display());
                }
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Init { force } => {
                let path = EngineConfig::config_path().context("No config directory available")?;
                if path.exists() && !force {
                    anyhow::bail!("{:?} already exists (use --force to overwrite)", path);
                }
                let path = EngineConfig::default().save()?;
                println!("Wrote {}", path.display());
            }
        },
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level);

    if let Err(err) = run(args.command) {
        tracing::error!("{:#}", err);
        return Err(err);
    }
    Ok(())
}
