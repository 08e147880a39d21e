//! Flash session - high-level orchestrator for the boot-and-flash flow.
//!
//! A board in USB boot mode first takes a chain of bootloader stages,
//! each exposed as a DFU alternate setting that only appears once the
//! previous stage is running. The final stage exposes `rawemmc`, which
//! takes the system image.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::dfu::{Clock, DfuDriver, RetryPolicy, SystemClock};
use crate::events::{FlashEvent, FlashObserver, TracingObserver};
use crate::extract::{BootImageSource, ExtractError, StagedBootFiles, stage_boot_files};
use crate::protocol::constants::*;
use crate::transport::{DeviceEnumerator, MatchCriteria, NusbBackend};

/// One bootloader stage: the file inside the boot partition and the
/// alternate setting it is sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootStage {
    pub alt: String,
    pub file: String,
}

impl BootStage {
    pub fn new(alt: &str, file: &str) -> Self {
        Self {
            alt: alt.to_string(),
            file: file.to_string(),
        }
    }
}

/// Configuration for a flash session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Alternate setting receiving the system image.
    pub image_alt: String,
    /// Partition of the system image holding the boot files.
    pub boot_partition: usize,
    pub locate_attempts: u32,
    pub locate_retry_delay_ms: u64,
    /// Pause between boot stages while the next one enumerates.
    pub stage_settle_ms: u64,
    /// Pause before looking for the image target.
    pub image_settle_ms: u64,
    /// Pause after the image while the board commits boot binaries.
    pub finalize_wait_ms: u64,
    pub stream_timeout_secs: u64,
    /// Bytes between streaming progress reports.
    pub progress_step_bytes: u64,
    /// Boot stages, in the order they are sent.
    pub boot_stages: Vec<BootStage>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vendor_id: TI_VENDOR_ID,
            product_id: TI_PRODUCT_ID,
            image_alt: ALT_RAWEMMC.to_string(),
            boot_partition: BOOT_PARTITION,
            locate_attempts: LOCATE_ATTEMPTS,
            locate_retry_delay_ms: LOCATE_RETRY_DELAY.as_millis() as u64,
            stage_settle_ms: 2000,
            image_settle_ms: 3000,
            finalize_wait_ms: 15000,
            stream_timeout_secs: STREAM_TIMEOUT.as_secs(),
            progress_step_bytes: PROGRESS_STEP,
            boot_stages: vec![
                BootStage::new(ALT_BOOTLOADER, FILE_TIBOOT3),
                BootStage::new(ALT_TISPL, FILE_TISPL),
                BootStage::new(ALT_UBOOT, FILE_UBOOT),
            ],
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.locate_attempts,
            inter_retry_delay: Duration::from_millis(self.locate_retry_delay_ms),
        }
    }

    pub fn criteria(&self, alt: &str) -> MatchCriteria {
        MatchCriteria::new(self.vendor_id, self.product_id, alt)
    }
}

/// A boot file ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFile {
    pub alt: String,
    pub path: PathBuf,
}

/// Everything a session sends, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashPlan {
    pub stages: Vec<StageFile>,
    pub image: PathBuf,
}

impl FlashPlan {
    /// Pair each configured stage with its staged file.
    pub fn from_staged(
        config: &SessionConfig,
        staged: &StagedBootFiles,
        image: impl Into<PathBuf>,
    ) -> Result<Self, ExtractError> {
        let stages = config
            .boot_stages
            .iter()
            .map(|stage| {
                staged
                    .path_of(&stage.file)
                    .map(|path| StageFile {
                        alt: stage.alt.clone(),
                        path: path.to_path_buf(),
                    })
                    .ok_or_else(|| ExtractError::FileNotFound(stage.file.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            stages,
            image: image.into(),
        })
    }

    /// Take boot files from `dir` by the configured names.
    pub fn from_dir(config: &SessionConfig, dir: &Path, image: impl Into<PathBuf>) -> Self {
        Self {
            stages: config
                .boot_stages
                .iter()
                .map(|stage| StageFile {
                    alt: stage.alt.clone(),
                    path: dir.join(&stage.file),
                })
                .collect(),
            image: image.into(),
        }
    }
}

/// Flash session - drives every stage of a flash in order.
pub struct FlashSession<B: DeviceEnumerator, O: FlashObserver, C: Clock = SystemClock> {
    config: SessionConfig,
    backend: B,
    observer: Arc<O>,
    clock: C,
}

impl FlashSession<NusbBackend, TracingObserver> {
    /// Create a new session on real hardware with the tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: FlashObserver> FlashSession<NusbBackend, O> {
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self::with_parts(config, NusbBackend, observer, SystemClock)
    }
}

impl<B, O, C> FlashSession<B, O, C>
where
    B: DeviceEnumerator,
    O: FlashObserver,
    C: Clock + Clone,
{
    pub fn with_parts(config: SessionConfig, backend: B, observer: Arc<O>, clock: C) -> Self {
        Self {
            config,
            backend,
            observer,
            clock,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }

    fn progress(&self, percent: usize, message: impl Into<String>) {
        let percent = percent.min(100) as u8;
        self.emit(FlashEvent::progress(percent, message));
    }

    fn open(&mut self, alt: &str) -> Result<DfuDriver<B::Transport, C>> {
        let criteria = self.config.criteria(alt);
        let driver = DfuDriver::open(
            &mut self.backend,
            criteria,
            &self.config.retry_policy(),
            self.clock.clone(),
        )?;
        self.emit(FlashEvent::DeviceConnected {
            vid: self.config.vendor_id,
            pid: self.config.product_id,
            alt: alt.to_string(),
        });
        Ok(driver
            .with_stream_timeout(Duration::from_secs(self.config.stream_timeout_secs))
            .with_progress_step(self.config.progress_step_bytes))
    }

    /// Send one bootloader stage and let the device reboot into it.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub fn send_stage(&mut self, alt: &str, path: &Path) -> Result<()> {
        let observer = Arc::clone(&self.observer);
        let mut driver = self
            .open(alt)
            .with_context(|| format!("DFU failed (alt: {alt})"))?;
        let outcome = driver
            .download_file(path, true, observer.as_ref())
            .with_context(|| format!("DFU failed (alt: {alt})"))?;
        info!(?outcome, "Stage sent");
        Ok(())
    }

    /// Stream the system image to the image target.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub fn send_image(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            bail!("Image not found: {}", path.display());
        }
        let alt = self.config.image_alt.clone();
        let observer = Arc::clone(&self.observer);
        let mut driver = self
            .open(&alt)
            .with_context(|| format!("DFU failed (alt: {alt})"))?;
        let outcome = driver
            .download_file_streaming(path, observer.as_ref())
            .with_context(|| format!("DFU failed (alt: {alt})"))?;
        info!(?outcome, "Image sent");
        driver.close();
        Ok(())
    }

    /// Run the complete flash sequence for a prepared plan.
    #[instrument(skip_all, fields(image = %plan.image.display()))]
    pub fn run(&mut self, plan: &FlashPlan) -> Result<()> {
        self.progress(45, "Sending bootloader files...");
        let count = plan.stages.len();
        for (i, stage) in plan.stages.iter().enumerate() {
            self.progress(45 + i * 10, format!("Sending {}...", stage.alt));
            self.send_stage(&stage.alt, &stage.path)?;
            self.progress(55 + i * 10, format!("{} sent", stage.alt));

            if i + 1 < count {
                self.progress(55 + i * 10, "Waiting for device to reconnect...");
                self.clock
                    .sleep(Duration::from_millis(self.config.stage_settle_ms));
            }
        }

        self.progress(77, "Waiting for device to enter DFU mode...");
        self.clock
            .sleep(Duration::from_millis(self.config.image_settle_ms));

        self.progress(80, "Sending image to device (this may take several minutes)...");
        self.send_image(&plan.image)?;

        self.progress(95, "Writing boot binaries to eMMC (do not power off)...");
        self.clock
            .sleep(Duration::from_millis(self.config.finalize_wait_ms));

        self.progress(100, "System image sent successfully!");
        Ok(())
    }

    /// Extract the boot files through `source`, then run the sequence.
    ///
    /// Staged files are removed before this returns.
    pub fn run_from_source<S: BootImageSource + ?Sized>(
        &mut self,
        source: &mut S,
        image: &Path,
        staging_dir: &Path,
    ) -> Result<()> {
        self.progress(38, "Extracting bootloader files from image...");
        let names: Vec<&str> = self
            .config
            .boot_stages
            .iter()
            .map(|stage| stage.file.as_str())
            .collect();
        let staged = stage_boot_files(source, self.config.boot_partition, &names, staging_dir)?;
        let plan = FlashPlan::from_staged(&self.config, &staged, image)?;
        self.run(&plan)
    }

    /// Report the end of a run to the observer: exactly one terminal
    /// event per run.
    pub fn finish(&self, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => self.emit(FlashEvent::Complete),
            Err(e) => self.emit(FlashEvent::Error {
                message: format!("{e:#}"),
            }),
        }
        result
    }
}

impl<B, O, C> FlashSession<B, O, C>
where
    B: DeviceEnumerator + Send + 'static,
    O: FlashObserver + 'static,
    C: Clock + Clone + 'static,
{
    /// Run `plan` on a worker thread. The observer receives the terminal
    /// event from that thread.
    pub fn spawn(mut self, plan: FlashPlan) -> JoinHandle<Result<()>> {
        thread::spawn(move || {
            let result = self.run(&plan);
            self.finish(result)
        })
    }
}
