//! BirdBath CLI - orchestrator, child process roles and sensor tools

use birdbath::config::{DriverConfig, LoopConfig};
use birdbath::driver::{run_driver_process, ActuationDriver};
use birdbath::nozzle::NozzleLayout;
use birdbath::orchestrator::Orchestrator;
use birdbath::sensor::{send_sample, ChannelReader, SensorSample};
use birdbath::supervisor::ChildCommand;
use birdbath::worker::serve;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing::Level;

/// How often `monitor` polls the FIFO
const MONITOR_POLL: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(name = "birdbath")]
#[command(about = "BirdBath nozzle pattern engine", long_about = None)]
struct Cli {
    /// Log at debug level (passed on to child processes)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the frame loop until interrupted
    Run {
        /// Pattern configuration file
        #[arg(short, long, default_value = "patterns.toml")]
        config: PathBuf,
    },

    /// Serve one pattern over stdin/stdout
    #[command(hide = true)]
    Worker {
        /// Pattern name
        #[arg(short, long)]
        pattern: String,

        /// Worker slot
        #[arg(short, long, default_value = "0")]
        index: usize,
    },

    /// Forward frames from stdin to the nozzle controllers
    #[command(hide = true)]
    Driver {
        /// Driver configuration file
        #[arg(short, long, default_value = "driver.toml")]
        config: PathBuf,
    },

    /// Print sensor samples arriving on a FIFO
    Monitor {
        /// FIFO path (created if missing)
        pipe: PathBuf,
    },

    /// Write one sensor sample into a FIFO
    Emit {
        /// FIFO path
        #[arg(short, long)]
        pipe: PathBuf,

        /// Channel name
        #[arg(short, long)]
        channel: String,

        /// Value, clamped to [-1, 1] by the reader
        #[arg(short = 'V', long, allow_hyphen_values = true)]
        value: f64,
    },

    /// Print the nozzle geometry table
    Layout,
}

fn install_interrupt_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received...");
        r.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // stdout carries IPC for child processes, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    match cli.command {
        Commands::Run { config } => {
            let loop_config = LoopConfig::load(&config)?;
            info!(
                "Loaded {} patterns from {}",
                loop_config.patterns.len(),
                config.display()
            );

            let command = ChildCommand::current_exe()?.verbose(cli.verbose);
            let running = install_interrupt_handler()?;
            let mut orchestrator = Orchestrator::launch(&loop_config, &command)?;
            orchestrator.run(&running);
        }

        Commands::Worker { pattern, index } => {
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            serve(index, &pattern, stdin.lock(), stdout.lock())?;
        }

        Commands::Driver { config } => {
            let driver_config = DriverConfig::load(&config)?;
            let mut driver = ActuationDriver::new(driver_config)?;
            let stdin = std::io::stdin();
            run_driver_process(stdin.lock(), &mut driver)?;
        }

        Commands::Monitor { pipe } => {
            let mut reader = ChannelReader::open(&pipe)?;
            let running = install_interrupt_handler()?;
            println!("Monitoring {} (Ctrl+C to stop)", pipe.display());

            while running.load(Ordering::SeqCst) {
                for sample in reader.poll() {
                    let stamp = sample
                        .timestamp
                        .map_or_else(|| "-".to_string(), |t| format!("{:.3}", t));
                    println!(
                        "channel={:<12} value={:>7.4} timestamp={}",
                        sample.channel, sample.value, stamp
                    );
                }
                std::thread::sleep(MONITOR_POLL);
            }
        }

        Commands::Emit {
            pipe,
            channel,
            value,
        } => {
            send_sample(&pipe, &SensorSample::now(channel, value))?;
        }

        Commands::Layout => {
            for nozzle in NozzleLayout::new().nozzles() {
                println!("{}", nozzle);
            }
        }
    }

    Ok(())
}
