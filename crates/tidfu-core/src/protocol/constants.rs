//! DFU class constants and TI target parameters.

use std::time::Duration;

// USB interface class/subclass for DFU
pub const DFU_CLASS: u8 = 0xFE;
pub const DFU_SUBCLASS: u8 = 0x01;

// DFU class requests (DFU 1.1, table 3.2)
pub const DFU_DETACH: u8 = 0;
pub const DFU_DNLOAD: u8 = 1;
pub const DFU_GETSTATUS: u8 = 3;
pub const DFU_CLRSTATUS: u8 = 4;
pub const DFU_ABORT: u8 = 6;

/// Length of the DFU_GETSTATUS response.
pub const DFU_STATUS_LEN: u16 = 6;

// Functional descriptor
pub const DFU_DESC_TYPE: u8 = 0x21;
pub const DFU_DESC_LEN: usize = 9;

// DFU file suffix
pub const DFU_SUFFIX_LEN: usize = 16;
pub const DFU_SUFFIX_SIGNATURE: [u8; 3] = *b"UFD";

/// Transfer size used by whole-file downloads when the device reports none.
pub const DEFAULT_TRANSFER_SIZE: u16 = 1024;
/// Transfer size used by streaming downloads when the device reports none.
pub const DEFAULT_STREAM_TRANSFER_SIZE: u16 = 4096;

/// Control transfer / status query timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
/// Timeout while streaming to a flash-backed target.
/// U-Boot's rawemmc alt-setting can take minutes to flush its buffer to eMMC.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// wValue sent with DFU_DETACH, in milliseconds.
pub const DETACH_TIMEOUT_MS: u16 = 1000;

/// Minimum interval between two status polls while downloading.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Manifest poll interval when the device advertises none.
pub const MANIFEST_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Extra wait while the device reports dfuMANIFEST-SYNC / dfuMANIFEST.
pub const MANIFEST_SETTLE: Duration = Duration::from_millis(1000);

/// Streaming progress granularity.
pub const PROGRESS_STEP: u64 = 10 * 1024 * 1024;

// Device locate retry budget
pub const LOCATE_ATTEMPTS: u32 = 15;
pub const LOCATE_RETRY_DELAY: Duration = Duration::from_secs(1);

// Texas Instruments AM6x ROM / U-Boot DFU gadget
pub const TI_VENDOR_ID: u16 = 0x0451;
pub const TI_PRODUCT_ID: u16 = 0x6165;

pub const ALT_BOOTLOADER: &str = "bootloader";
pub const ALT_TISPL: &str = "tispl.bin";
pub const ALT_UBOOT: &str = "u-boot.img";
pub const ALT_RAWEMMC: &str = "rawemmc";

// Boot files inside the image's FAT boot partition
pub const FILE_TIBOOT3: &str = "tiboot3.bin";
pub const FILE_TISPL: &str = "tispl.bin";
pub const FILE_UBOOT: &str = "u-boot.img";

/// FAT boot partition index inside the disk image.
pub const BOOT_PARTITION: usize = 1;
