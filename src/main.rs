use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use audio_output_coordinator::audio::{AudioDevice, Channel, Scope};
use audio_output_coordinator::config::{ConfigLoader, ConfigPreferenceStore};
use audio_output_coordinator::logging::{self, LoggingConfig};
use audio_output_coordinator::service::{OutputRoutingService, SignalHandler};
use audio_output_coordinator::system::{
    AudioHardware, HardwareVirtualDevice, PreferenceStore, StandardFileSystem,
    StaticPermissionGate,
};
use audio_output_coordinator::Config;

#[derive(Parser)]
#[command(name = "audio-output-coordinator")]
#[command(about = "Routes system audio through a virtual device and follows the preferred output device")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator until SIGTERM/SIGINT (default)
    Run,
    /// List all audio devices
    ListDevices {
        /// Show volume, mute and data source details
        #[arg(long)]
        details: bool,
    },
    /// Show the system default output device and the stored preference
    ShowCurrent,
    /// Validate configuration file
    CheckConfig,
    /// Remember a device as the preferred output device
    Prefer {
        /// Device UID, as printed by list-devices
        uid: String,
    },
    /// Forget the preferred output device
    ClearPreference,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = match &cli.config {
        Some(path) => ConfigLoader::new_production(PathBuf::from(path)),
        None => ConfigLoader::new_with_default_path()?,
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(loader, cli.verbose).await,
        command => {
            let (_guard, _) = logging::initialize_logging(LoggingConfig::console_only(cli.verbose))?;
            match command {
                Commands::ListDevices { details } => list_devices(details),
                Commands::ShowCurrent => show_current(&loader),
                Commands::CheckConfig => check_config(&loader),
                Commands::Prefer { uid } => set_preferred(loader, Some(uid)),
                Commands::ClearPreference => set_preferred(loader, None),
                Commands::Run => Ok(()),
            }
        }
    }
}

#[cfg(target_os = "macos")]
fn audio_hardware() -> Result<Arc<dyn AudioHardware>> {
    Ok(Arc::new(
        audio_output_coordinator::system::CoreAudioHardware::new(),
    ))
}

#[cfg(not(target_os = "macos"))]
fn audio_hardware() -> Result<Arc<dyn AudioHardware>> {
    anyhow::bail!("No audio hardware backend is available on this platform")
}

async fn run_service(loader: ConfigLoader<StandardFileSystem>, verbose: bool) -> Result<()> {
    let config = loader.load_config()?;
    let (_guard, log_dir) = logging::initialize_logging(LoggingConfig::from_config(&config, verbose))?;

    info!("Starting audio output coordinator");
    if let Some(log_dir) = &log_dir {
        info!("Writing logs to {}", log_dir.display());
        if let Err(e) = logging::cleanup_old_logs(log_dir, config.logging.keep_days) {
            warn!("Failed to clean up old logs: {}", e);
        }
    }

    let hardware = audio_hardware()?;
    let virtual_device = HardwareVirtualDevice::find(Arc::clone(&hardware), &config.virtual_device.uid)
        .context("Virtual device is not available")?;
    let preference_store: Arc<dyn PreferenceStore> = Arc::new(ConfigPreferenceStore::new(loader));

    let mut service = OutputRoutingService::new(
        hardware,
        Arc::new(virtual_device),
        Arc::new(StaticPermissionGate::default()),
        preference_store,
    );

    if let Err(e) = service.start().await {
        error!("Failed to start: {}", e);
        service.shutdown();
        return Err(e.into());
    }

    let signals = SignalHandler::spawn()?;
    let result = service.run(signals).await;
    if let Err(e) = &result {
        error!("Coordinator stopped: {}", e);
    }

    service.shutdown();
    result.map_err(Into::into)
}

fn list_devices(details: bool) -> Result<()> {
    let hardware = audio_hardware()?;
    let ids = hardware
        .device_ids()
        .map_err(|status| anyhow::anyhow!("Failed to enumerate devices: {}", status))?;
    let default_output = hardware.default_output_device().ok().flatten();

    println!("Available audio devices:");
    if ids.is_empty() {
        println!("  No audio devices found!");
        return Ok(());
    }

    for (i, id) in ids.iter().enumerate() {
        let device = AudioDevice::new(*id, Arc::clone(&hardware));
        let output = device.supports_output().unwrap_or(false);
        println!(
            "  {}. {} [{}]{}{}",
            i + 1,
            device.display_name(Scope::Output),
            device.uid().unwrap_or_else(|_| "no uid".to_string()),
            if output { "" } else { " (input only)" },
            if default_output == Some(*id) { " (default output)" } else { "" }
        );

        if details && output {
            print_device_details(&device);
        }
    }

    Ok(())
}

fn print_device_details(device: &AudioDevice) {
    match device.volume(Scope::Output, Channel::Master) {
        Ok(volume) => println!("     Volume: {:.0}%", volume * 100.0),
        Err(e) => println!("     Volume: {}", e),
    }
    match device.is_muted(Scope::Output, Channel::Master) {
        Ok(muted) => println!("     Muted: {}", muted),
        Err(e) => println!("     Muted: {}", e),
    }
    if let Ok(source) = device.data_source(Scope::Output) {
        let name = device
            .data_source_name(Scope::Output, source)
            .unwrap_or_else(|_| source.to_string());
        println!("     Data source: {}", name);
    }
}

fn show_current(loader: &ConfigLoader<StandardFileSystem>) -> Result<()> {
    let config = loader.load_or_default()?;
    let hardware = audio_hardware()?;

    match hardware.default_output_device() {
        Ok(Some(id)) => {
            let device = AudioDevice::new(id, Arc::clone(&hardware));
            let uid = device.uid().unwrap_or_default();
            println!("Default output: {} [{}]", device.display_name(Scope::Output), uid);
            if uid == config.virtual_device.uid {
                println!("  Audio is routed through the virtual device");
            }
        }
        Ok(None) => println!("Default output: none"),
        Err(status) => println!("Default output: unavailable ({})", status),
    }

    print_preference(&config);
    Ok(())
}

fn check_config(loader: &ConfigLoader<StandardFileSystem>) -> Result<()> {
    println!("Configuration file: {}", loader.get_config_path().display());
    if !loader.config_exists() {
        println!("  File does not exist, defaults are used");
    }

    let config = loader.load_or_default()?;
    let problems = config.validate();

    println!("  Log level: {}", config.general.log_level);
    println!("  Virtual device UID: {}", config.virtual_device.uid);
    print_preference(&config);

    if problems.is_empty() {
        println!("Configuration is valid");
        Ok(())
    } else {
        for problem in &problems {
            println!("  Problem: {}", problem);
        }
        anyhow::bail!("Configuration has {} problem(s)", problems.len())
    }
}

fn set_preferred(loader: ConfigLoader<StandardFileSystem>, uid: Option<String>) -> Result<()> {
    let store = ConfigPreferenceStore::new(loader);
    let mut record = store.load()?;
    record.preferred_output_uid = uid;
    store.save(&record)?;

    match &record.preferred_output_uid {
        Some(uid) => println!("Preferred output device set to {}", uid),
        None => println!("Preferred output device cleared"),
    }
    println!("Send SIGHUP to a running coordinator to apply the change");
    Ok(())
}

fn print_preference(config: &Config) {
    println!(
        "  Preferred output: {}",
        config
            .preferences
            .preferred_output_uid
            .as_deref()
            .unwrap_or("none")
    );
    println!(
        "  Newly connected devices take over: {}",
        config.preferences.most_recent_wins
    );
}
