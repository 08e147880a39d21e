//! Staging boot files pulled out of a disk image.
//!
//! Reading the image's filesystem is left to a [`BootImageSource`]
//! implementation. The staged copies live in a scratch directory that
//! is removed when the [`StagedBootFiles`] handle is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Bootloader file not found in image: {0}")]
    FileNotFound(String),

    #[error("Partition {0} not found in image")]
    PartitionNotFound(usize),

    #[error("Failed to stage {name}: {source}")]
    Stage {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Error reading bootloader files from image: {0}")]
    Io(#[from] io::Error),
}

/// Something boot files can be read from.
pub trait BootImageSource {
    /// Contents of `name` on `partition`, `None` when absent.
    fn read_file(&mut self, partition: usize, name: &str) -> Result<Option<Vec<u8>>, ExtractError>;
}

/// A directory holding an already extracted boot partition.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BootImageSource for DirectorySource {
    fn read_file(&mut self, _partition: usize, name: &str) -> Result<Option<Vec<u8>>, ExtractError> {
        match fs::read(self.root.join(name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub name: String,
    pub path: PathBuf,
    pub size: usize,
}

/// Boot files copied to a scratch directory.
#[derive(Debug)]
pub struct StagedBootFiles {
    dir: PathBuf,
    files: Vec<StagedFile>,
    owns_dir: bool,
}

impl StagedBootFiles {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files(&self) -> &[StagedFile] {
        &self.files
    }

    pub fn path_of(&self, name: &str) -> Option<&Path> {
        self.files
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.path.as_path())
    }
}

impl Drop for StagedBootFiles {
    fn drop(&mut self) {
        for file in &self.files {
            if let Err(e) = fs::remove_file(&file.path) {
                debug!(path = %file.path.display(), error = %e, "Failed to remove staged file");
            }
        }
        if self.owns_dir {
            if let Err(e) = fs::remove_dir(&self.dir) {
                warn!(dir = %self.dir.display(), error = %e, "Failed to remove staging directory");
            }
        }
    }
}

/// Copy `names` from `partition` of `source` into `dir`.
///
/// An absent or empty file fails the whole extraction.
pub fn stage_boot_files<S, N>(
    source: &mut S,
    partition: usize,
    names: &[N],
    dir: &Path,
) -> Result<StagedBootFiles, ExtractError>
where
    S: BootImageSource + ?Sized,
    N: AsRef<str>,
{
    let owns_dir = !dir.exists();
    fs::create_dir_all(dir).map_err(|source| ExtractError::Stage {
        name: dir.display().to_string(),
        source,
    })?;

    // Files staged so far are cleaned up if a later one fails
    let mut staged = StagedBootFiles {
        dir: dir.to_path_buf(),
        files: Vec::with_capacity(names.len()),
        owns_dir,
    };

    for name in names {
        let name = name.as_ref();
        let data = match source.read_file(partition, name)? {
            Some(data) if !data.is_empty() => data,
            _ => return Err(ExtractError::FileNotFound(name.to_string())),
        };
        let path = dir.join(name);
        fs::write(&path, &data).map_err(|source| ExtractError::Stage {
            name: name.to_string(),
            source,
        })?;
        info!(name, size = data.len(), "Extracted boot file");
        staged.files.push(StagedFile {
            name: name.to_string(),
            path,
            size: data.len(),
        });
    }

    Ok(staged)
}
