use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tidfu_core::dfu::{DfuDriver, RetryPolicy, SystemClock};
use tidfu_core::events::{ChannelObserver, FlashEvent, TracingObserver};
use tidfu_core::session::{FlashPlan, FlashSession, SessionConfig, StageFile};
use tidfu_core::transport::{NusbBackend, list_dfu_targets};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "TI board flasher over USB DFU (Pure Rust)", long_about = None)]
struct Cli {
    /// USB vendor ID (hex)
    #[arg(long, global = true, value_parser = parse_hex_u16)]
    vendor: Option<u16>,

    /// USB product ID (hex)
    #[arg(long, global = true, value_parser = parse_hex_u16)]
    product: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List DFU alternate settings on the bus
    List,
    /// Download one file to an alternate setting
    Download {
        file: PathBuf,
        #[arg(long)]
        alt: String,
        /// Keep the device attached after the download
        #[arg(long)]
        no_reset: bool,
    },
    /// Stream a large file to an alternate setting
    Stream {
        file: PathBuf,
        #[arg(long)]
        alt: String,
    },
    /// Boot the board through every stage and write the system image
    Flash(FlashArgs),
    /// Write the default configuration as TOML
    Config {
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct FlashArgs {
    /// System image streamed to the eMMC target
    #[arg(long)]
    image: PathBuf,

    /// Directory holding tiboot3.bin, tispl.bin and u-boot.img
    #[arg(long, conflicts_with_all = ["tiboot3", "tispl", "uboot"])]
    boot_dir: Option<PathBuf>,

    #[arg(long, requires_all = ["tispl", "uboot"])]
    tiboot3: Option<PathBuf>,

    #[arg(long)]
    tispl: Option<PathBuf>,

    #[arg(long)]
    uboot: Option<PathBuf>,

    /// Session configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex ID '{s}': {e}"))
}

fn main() {
    let args = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting tidfu (nusb backend)...");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Cli) -> Result<()> {
    match args.command {
        Command::List => list(args.vendor, args.product),
        Command::Download {
            ref file,
            ref alt,
            no_reset,
        } => {
            let config = base_config(None, &args)?;
            let mut driver = open_driver(&config, alt)?;
            let outcome = driver
                .download_file(file, !no_reset, &TracingObserver)
                .with_context(|| format!("DFU failed (alt: {alt})"))?;
            info!(?outcome, "Download finished");
            Ok(())
        }
        Command::Stream { ref file, ref alt } => {
            let config = base_config(None, &args)?;
            let mut driver = open_driver(&config, alt)?;
            let outcome = driver
                .download_file_streaming(file, &TracingObserver)
                .with_context(|| format!("DFU failed (alt: {alt})"))?;
            info!(?outcome, "Stream finished");
            Ok(())
        }
        Command::Flash(ref flash_args) => {
            let config = base_config(flash_args.config.as_deref(), &args)?;
            flash(config, flash_args)
        }
        Command::Config { ref output } => {
            base_config(None, &args)?.save_to_file(output)?;
            info!(path = %output.display(), "Configuration written");
            Ok(())
        }
    }
}

fn base_config(path: Option<&Path>, args: &Cli) -> Result<SessionConfig> {
    let mut config = match path {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(vid) = args.vendor {
        config.vendor_id = vid;
    }
    if let Some(pid) = args.product {
        config.product_id = pid;
    }
    Ok(config)
}

fn open_driver(
    config: &SessionConfig,
    alt: &str,
) -> Result<DfuDriver<tidfu_core::NusbTransport, SystemClock>> {
    let policy: RetryPolicy = config.retry_policy();
    let driver = DfuDriver::open(&mut NusbBackend, config.criteria(alt), &policy, SystemClock)
        .with_context(|| format!("DFU failed (alt: {alt})"))?;
    Ok(driver.with_progress_step(config.progress_step_bytes))
}

fn list(vendor: Option<u16>, product: Option<u16>) -> Result<()> {
    let targets = list_dfu_targets(vendor, product)?;
    if targets.is_empty() {
        println!("No DFU devices found");
        return Ok(());
    }
    for t in targets {
        println!(
            "Found DFU: [{:04x}:{:04x}] bus={} addr={} intf={} alt={} name=\"{}\" transfer_size={}",
            t.vendor_id,
            t.product_id,
            t.bus_id,
            t.device_address,
            t.interface_number,
            t.alt_setting,
            t.alt_name.as_deref().unwrap_or("UNKNOWN"),
            t.transfer_size
        );
    }
    Ok(())
}

fn flash(config: SessionConfig, args: &FlashArgs) -> Result<()> {
    let plan = match (&args.boot_dir, &args.tiboot3, &args.tispl, &args.uboot) {
        (Some(dir), ..) => FlashPlan::from_dir(&config, dir, &args.image),
        (None, Some(tiboot3), Some(tispl), Some(uboot)) => {
            if config.boot_stages.len() != 3 {
                bail!("Individual boot files need exactly three configured stages");
            }
            let files = [tiboot3, tispl, uboot];
            FlashPlan {
                stages: config
                    .boot_stages
                    .iter()
                    .zip(files)
                    .map(|(stage, path)| StageFile {
                        alt: stage.alt.clone(),
                        path: path.clone(),
                    })
                    .collect(),
                image: args.image.clone(),
            }
        }
        _ => bail!("Either --boot-dir or all of --tiboot3, --tispl and --uboot are required"),
    };

    let (tx, rx) = mpsc::channel();
    let session = FlashSession::with_observer(config, Arc::new(ChannelObserver::new(tx)));
    let worker = session.spawn(plan);

    for event in rx.iter() {
        match &event {
            FlashEvent::Progress { percent, message } => println!("[{percent:>3}%] {message}"),
            FlashEvent::Status { message } => println!("       {message}"),
            FlashEvent::DeviceConnected { vid, pid, alt } => {
                println!("       Connected {vid:04x}:{pid:04x} ({alt})")
            }
            FlashEvent::Transfer { alt, sent, total } => {
                info!(alt = %alt, sent, total, "Transfer")
            }
            FlashEvent::Complete => println!("Flash complete"),
            FlashEvent::Error { message } => eprintln!("Flash failed: {message}"),
        }
        if event.is_terminal() {
            break;
        }
    }

    match worker.join() {
        Ok(result) => result,
        Err(_) => bail!("Flash worker panicked"),
    }
}
