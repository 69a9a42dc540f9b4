use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::page;

/// Configuration supplied when opening a [`super::StorageEnv`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StorageOptions {
    /// Base page size in bytes; a power of two.
    pub page_size: u32,
    /// Largest temporary page the decompression pool hands out, in bytes.
    pub max_compressed_page_size: u32,
    /// Size in bytes after which the scratch pool rolls over to another file.
    pub max_scratch_file_size: u64,
    /// Maximum number of scratch files alive at once.
    pub max_scratch_files: usize,
    /// Unused scratch files kept for recycling after cleanup.
    pub retained_recycled_files: usize,
    /// Pages each decompression pager may hand out before it is superseded.
    pub decompression_pager_pages: u64,
    /// Directory for file-backed scratch pagers; in-memory when unset.
    pub scratch_dir: Option<PathBuf>,
    /// Journal file; in-memory when unset.
    pub journal_path: Option<PathBuf>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            max_compressed_page_size: page::DEFAULT_MAX_COMPRESSED_PAGE_SIZE,
            max_scratch_file_size: 64 * 1024 * 1024,
            max_scratch_files: 32,
            retained_recycled_files: 2,
            decompression_pager_pages: 1024,
            scratch_dir: None,
            journal_path: None,
        }
    }
}

impl StorageOptions {
    /// Sets the base page size.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the largest temporary page size.
    pub fn max_compressed_page_size(mut self, bytes: u32) -> Self {
        self.max_compressed_page_size = bytes;
        self
    }

    /// Sets the scratch file roll-over size.
    pub fn max_scratch_file_size(mut self, bytes: u64) -> Self {
        self.max_scratch_file_size = bytes;
        self
    }

    /// Sets the maximum number of scratch files.
    pub fn max_scratch_files(mut self, files: usize) -> Self {
        self.max_scratch_files = files;
        self
    }

    /// Sets how many unused scratch files survive cleanup.
    pub fn retained_recycled_files(mut self, files: usize) -> Self {
        self.retained_recycled_files = files;
        self
    }

    /// Sets the page budget of each decompression pager.
    pub fn decompression_pager_pages(mut self, pages: u64) -> Self {
        self.decompression_pager_pages = pages;
        self
    }

    /// Places scratch files under `dir`.
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Writes the journal to `path`.
    pub fn journal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    /// Scratch file size limit in pages.
    pub fn max_scratch_file_pages(&self) -> u64 {
        self.max_scratch_file_size / self.page_size as u64
    }

    /// Checks that the options describe a usable environment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if page::validate_page_size(self.page_size).is_err() {
            return Err(ConfigError::Invalid {
                field: "page_size",
                reason: "must be a power of two between 512 and 65536",
            });
        }
        if !self.max_compressed_page_size.is_power_of_two()
            || self.max_compressed_page_size < self.page_size
        {
            return Err(ConfigError::Invalid {
                field: "max_compressed_page_size",
                reason: "must be a power of two no smaller than page_size",
            });
        }
        if self.max_scratch_file_pages() == 0 {
            return Err(ConfigError::Invalid {
                field: "max_scratch_file_size",
                reason: "must hold at least one page",
            });
        }
        if self.max_scratch_files == 0 {
            return Err(ConfigError::Invalid {
                field: "max_scratch_files",
                reason: "must be at least one",
            });
        }
        let largest = (self.max_compressed_page_size / self.page_size) as u64;
        if self.decompression_pager_pages < largest {
            return Err(ConfigError::Invalid {
                field: "decompression_pager_pages",
                reason: "must fit the largest temporary page",
            });
        }
        Ok(())
    }

    /// Loads options from `explicit`, or the default location when `None`.
    ///
    /// A missing file yields the defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let options = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => Self::default(),
        };
        options.validate()?;
        Ok(options)
    }

    /// Writes the options as TOML to `target`, creating parent directories.
    pub fn persist(&self, target: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized =
            toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(target, serialized).map_err(|source| ConfigError::Write {
            path: target.to_path_buf(),
            source,
        })
    }
}

fn read_file(path: &Path) -> Result<StorageOptions, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Errors raised while loading or validating [`StorageOptions`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read storage config {path}: {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Config file is not valid TOML for [`StorageOptions`].
    #[error("failed to parse storage config {path}: {source}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// Options could not be rendered as TOML.
    #[error("failed to serialize storage config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// Config file could not be written.
    #[error("failed to write storage config {path}: {source}")]
    Write {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Config directory could not be created.
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A field holds an unusable value.
    #[error("storage option '{field}' {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What the field must satisfy.
        reason: &'static str,
    },
}

/// Default location of the storage config file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("penumbra").join("storage.toml"))
}
