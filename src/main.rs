use anyhow::Result;
use camera_service::{ServiceConfig, ServiceManager};
use clap::Parser;
use std::path::Path;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "camera-service")]
#[command(about = "Camera discovery, recording orchestration and JSON-RPC control for MediaMTX")]
#[command(version)]
#[command(long_about = "Discovers USB cameras, publishes them through a MediaMTX media server \
and exposes camera, recording, snapshot and file management over an authenticated JSON-RPC 2.0 \
WebSocket API.")]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "camera-service.toml",
        help = "Path to TOML configuration file"
    )]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the service")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Dry run mode - initialize but don't start components
    #[arg(long, help = "Perform dry run - build components but don't start them")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let config = match ServiceConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", args.config, e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    // Held for the life of the process so buffered file logs are flushed
    let log_guard = init_logging(&args, &config)?;

    info!("Starting camera service v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    let mut manager = ServiceManager::new(config).map_err(|e| {
        error!("Failed to create service manager: {}", e);
        e
    })?;

    manager.initialize().await.map_err(|e| {
        error!("Failed to initialize service: {}", e);
        e
    })?;

    if args.dry_run {
        info!("Dry run mode - components built but not started");
        println!("✓ Dry run completed successfully - all components initialized");
        return Ok(());
    }

    if let Err(e) = manager.start().await {
        error!("Failed to start service: {}", e);
        if let Err(shutdown_error) = manager.shutdown().await {
            warn!("Cleanup after failed start also failed: {}", shutdown_error);
        }
        return Err(e.into());
    }

    let exit_code = manager.run().await.map_err(|e| {
        error!("Service error during execution: {}", e);
        e
    })?;

    info!("Camera service exited with code: {}", exit_code);

    // Exit with appropriate code for systemd
    drop(log_guard);
    std::process::exit(exit_code);
}

fn init_logging(args: &Args, config: &ServiceConfig) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Command line flags win over the configured level
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        config.logging.level.as_str()
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("camera_service={}", log_level)));

    let format = args
        .log_format
        .as_deref()
        .unwrap_or(config.logging.format.as_str());

    let fmt_layer = match format {
        "json" => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        "compact" => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        "pretty" => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        other => {
            eprintln!("Warning: Unknown log format '{}', using default", other);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    let (file_layer, guard) = match config.logging.file_path.as_deref() {
        Some(file_path) => {
            let path = Path::new(file_path);
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "camera-service.log".to_string());

            std::fs::create_dir_all(directory)?;
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Camera Service Configuration File");
    println!("# This is the default configuration with all available options.");
    println!("# Every key can be overridden from the environment, e.g.");
    println!("# CAMSVC_SERVER__PORT=9000 or CAMSVC_SECURITY__JWT_SECRET=...");
    println!();
    println!("{}", ServiceConfig::default().to_toml()?);
    Ok(())
}
