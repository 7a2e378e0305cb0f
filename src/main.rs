//! CLI entry point for the microscope device server.
//!
//! ```bash
//! # Construct and initialise every configured device, then wait for stdin to close
//! microscope serve --config rig.toml
//!
//! # Print the settings of the second device as JSON
//! microscope describe --config rig.toml --index 1
//!
//! # Grab five frames from the first device
//! microscope grab --config rig.toml --index 0 --count 5
//! ```

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use rust_microscope::camera::Camera;
use rust_microscope::config::ServerConfig;
use rust_microscope::device::DeviceControl;
use rust_microscope::logging;
use rust_microscope::server::{self, DeviceServer, RunningDevice};
use rust_microscope::simulators::{self, SimulatedCamera};

/// How long `grab` waits for each frame.
const GRAB_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "microscope")]
#[command(about = "Serve and exercise microscope devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every configured device and keep them up until stdin closes
    Serve {
        /// Device server configuration (TOML)
        #[arg(long)]
        config: PathBuf,
    },

    /// Print device settings as JSON
    Describe {
        /// Device server configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Only describe the device at this position in the configuration
        #[arg(long)]
        index: Option<usize>,
    },

    /// Grab frames from a simulated camera
    Grab {
        /// Device server configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Position of the camera in the configuration
        #[arg(long)]
        index: usize,

        /// Number of frames to grab
        #[arg(long, default_value = "1")]
        count: usize,
    },
}

fn load(path: &Path) -> Result<ServerConfig> {
    let config = ServerConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    logging::init(&config.log_level).context("Failed to initialise logging")?;
    Ok(config)
}

fn device_server(config: &ServerConfig) -> DeviceServer {
    DeviceServer::new(simulators::builtin_registry(), config.retry_policy())
}

fn start_one(server: &DeviceServer, config: &ServerConfig, index: usize) -> Result<RunningDevice> {
    let definition = config
        .devices
        .get(index)
        .ok_or_else(|| anyhow!("No device #{index}; configuration lists {}", config.devices.len()))?;
    let uid_maps = server::uid_maps(&config.devices);
    let uid_map = uid_maps.get(&definition.class).cloned().unwrap_or_default();
    server
        .start(definition, &uid_map)
        .with_context(|| format!("Failed to start {} at {}", definition.class, definition.address()))
}

fn serve(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    let running = device_server(&config).start_all(&config);
    if running.is_empty() && !config.devices.is_empty() {
        bail!("No device could be started");
    }
    for device in &running {
        info!(class = %device.class, device = %device.device.name(), address = %device.address, "Serving");
    }

    info!("Close stdin to shut down");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        if line.is_err() {
            break;
        }
    }

    server::shutdown_all(running);
    Ok(())
}

fn describe(config_path: &Path, index: Option<usize>) -> Result<()> {
    let config = load(config_path)?;
    let indices: Vec<usize> = match index {
        Some(i) => vec![i],
        None => (0..config.devices.len()).collect(),
    };
    let server = device_server(&config);
    let mut described = Vec::with_capacity(indices.len());
    for i in indices {
        let running = start_one(&server, &config, i)?;
        let mut settings = serde_json::Map::new();
        for (name, description) in running.device.describe_settings() {
            settings.insert(name, serde_json::to_value(description)?);
        }
        described.push(serde_json::json!({
            "class": running.class,
            "address": running.address.to_string(),
            "name": running.device.name(),
            "settings": settings,
        }));
        running.device.shutdown();
    }
    println!("{}", serde_json::to_string_pretty(&described)?);
    Ok(())
}

fn grab(config_path: &Path, index: usize, count: usize) -> Result<()> {
    let config = load(config_path)?;
    let running = start_one(&device_server(&config), &config, index)?;
    let camera = running
        .device
        .as_any()
        .downcast_ref::<Camera<SimulatedCamera>>()
        .ok_or_else(|| anyhow!("{} is not a simulated camera", running.class))?;
    camera.enable().context("Failed to enable camera")?;
    for n in 0..count {
        let frame = camera
            .grab_next_data_timeout(true, GRAB_TIMEOUT)
            .with_context(|| format!("Failed to grab frame {n}"))?;
        let values = frame.pixels().as_f64();
        let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
        println!(
            "frame {n}: {}x{} {} mean={mean:.1}",
            frame.width(),
            frame.height(),
            frame.pixels().type_name()
        );
    }
    camera.shutdown();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => serve(&config),
        Commands::Describe { config, index } => describe(&config, index),
        Commands::Grab {
            config,
            index,
            count,
        } => grab(&config, index, count),
    }
}
