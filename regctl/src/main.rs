/*!
# Register Tree Driver

Builds a register tree from a TOML description, backs it with an emulated
memory space and drives write, verify and read passes over it.

## Features

- Devices, register fields and bulk memory windows described in TOML
- Shared-word fields packed into one block transaction
- Write-then-verify for memory windows with mismatch reporting
- Background polling with live update output
- Text or JSON readback

## Usage

### Generate a sample configuration
```bash
regctl config --output regctl.toml
```

### Apply configured values and read the tree back
```bash
regctl --config regctl.toml run
regctl run --json
```

### Poll the tree until Ctrl+C
```bash
regctl monitor --period-ms 250
```
*/

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod session;

use config::AppConfig;
use session::{render_text, Session};

#[derive(Parser)]
#[command(name = "regctl")]
#[command(about = "Register tree driver over an emulated memory space")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "regctl.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Write configured values, then read back every variable
    Run {
        /// Print the readback as JSON
        #[arg(long)]
        json: bool,
    },

    /// Poll the tree and print updates until interrupted
    Monitor {
        /// Poll period in milliseconds (defaults to the configured period)
        #[arg(short, long)]
        period_ms: Option<u64>,

        /// Print updates as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "regctl.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so readback output stays clean on stdout
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Run { json } => run_once(cli.config, json),
        Commands::Monitor { period_ms, json } => run_monitor(cli.config, period_ms, json),
        Commands::Config { output } => generate_config_file(output),
    }
}

fn run_once(config_path: PathBuf, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load_from_file(&config_path)?;
    info!("📄 Loaded configuration from {}", config_path.display());

    let session = Session::new(&config)?;
    session.apply()?;

    let dump = session.dump()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&dump)?);
    } else {
        print!("{}", render_text(&dump));
    }

    info!(
        "✅ Run completed: {} writes, {} reads, {} errors",
        dump.stats.writes, dump.stats.reads, dump.stats.errors
    );
    Ok(())
}

fn run_monitor(
    config_path: PathBuf,
    period_ms: Option<u64>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load_from_file(&config_path)?;
    let period = Duration::from_millis(period_ms.unwrap_or(config.root.poll_period_ms).max(1));

    let session = Session::new(&config)?;
    session.apply()?;

    let running = session.get_running_flag();
    ctrlc::set_handler(move || {
        eprintln!("🛑 Received Ctrl+C, shutting down gracefully...");
        running.store(false, Ordering::SeqCst);
    })?;

    eprintln!("🚀 Monitoring {} every {:?}", config.root.name, period);
    session.monitor(period, json)?;
    eprintln!("✅ Monitor completed");
    Ok(())
}

fn generate_config_file(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::default();
    config.save_to_file(&output)?;
    println!("✅ Configuration file generated: {}", output.display());
    Ok(())
}
