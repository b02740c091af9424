//! Disk configuration.
//!
//! One disk per line:
//!
//! ```text
//! # path, capacity in MiB, access method, options
//! disk=/var/tmp/extmem.0,4096,syscall direct
//! disk=/var/tmp/extmem.1,0,uring delete queue=1
//! ```
//!
//! A capacity of `0` makes the disk grow on demand.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::{info, warn};

const MIB: u64 = 1 << 20;

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "GEODE_EXTMEM_CONFIG";
pub const CONFIG_FILE_NAME: &str = ".geode_extmem";

const DEFAULT_SCRATCH_MIB: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMethod {
    /// Positional reads and writes from a worker thread.
    Syscall,
    /// File served by the io_uring queue where available.
    Uring,
    /// RAM only; the path is just a label.
    Memory,
}

impl AccessMethod {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "syscall" => Some(AccessMethod::Syscall),
            "uring" | "linuxaio" => Some(AccessMethod::Uring),
            "memory" => Some(AccessMethod::Memory),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AccessMethod::Syscall => "syscall",
            AccessMethod::Uring => "uring",
            AccessMethod::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskConfig {
    pub path: PathBuf,
    /// Bytes.
    pub capacity: u64,
    pub method: AccessMethod,
    pub autogrow: bool,
    /// Remove the backing file once the process no longer needs it.
    pub delete_on_exit: bool,
    pub direct: bool,
    /// Explicit queue identity; defaults to the disk's position.
    pub queue: Option<usize>,
    pub lock: bool,
}

impl DiskConfig {
    /// Capacities beyond the `u64` byte range saturate.
    pub fn new(path: impl Into<PathBuf>, capacity_mib: u64, method: AccessMethod) -> Self {
        Self {
            path: path.into(),
            capacity: capacity_mib.saturating_mul(MIB),
            method,
            autogrow: capacity_mib == 0,
            delete_on_exit: false,
            direct: false,
            queue: None,
            lock: true,
        }
    }

    fn apply_option(&mut self, option: &str) -> Result<(), String> {
        match option {
            "autogrow" => self.autogrow = true,
            "delete" | "unlink" => self.delete_on_exit = true,
            "direct" => self.direct = true,
            "nolock" => self.lock = false,
            _ => match option.split_once('=') {
                Some(("queue", id)) => {
                    let id = id
                        .parse()
                        .map_err(|_| format!("invalid queue id `{id}`"))?;
                    self.queue = Some(id);
                }
                _ => return Err(format!("unknown option `{option}`")),
            },
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub disks: Vec<DiskConfig>,
    /// File the configuration came from, `None` for the built-in fallback.
    pub source: Option<PathBuf>,
}

impl Config {
    pub fn new(disks: Vec<DiskConfig>) -> Self {
        Self {
            disks,
            source: None,
        }
    }

    /// Parses configuration text; `origin` only labels error messages.
    pub fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let mut disks = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let number = index + 1;
            let parse_error = |reason: String| ConfigError::Parse {
                path: origin.to_string(),
                line: number,
                reason,
            };

            let Some(spec) = line.strip_prefix("disk=") else {
                return Err(parse_error(format!("expected `disk=...`, got `{line}`")));
            };

            let mut fields = spec.splitn(3, ',');
            let path = fields.next().unwrap_or("").trim();
            let size = fields.next().map(str::trim);
            let rest = fields.next().map(str::trim);

            if path.is_empty() {
                return Err(parse_error("missing disk path".to_string()));
            }
            let Some(size) = size else {
                return Err(parse_error("missing capacity".to_string()));
            };
            let capacity_mib: u64 = size
                .parse()
                .map_err(|_| parse_error(format!("invalid capacity `{size}`")))?;
            if capacity_mib.checked_mul(MIB).is_none() {
                return Err(parse_error(format!("capacity of {size} MiB is too large")));
            }

            let mut words = rest.unwrap_or("").split_whitespace();
            let Some(method_name) = words.next() else {
                return Err(parse_error("missing access method".to_string()));
            };
            let method =
                AccessMethod::parse(method_name).ok_or_else(|| ConfigError::UnknownMethod {
                    path: origin.to_string(),
                    line: number,
                    method: method_name.to_string(),
                })?;

            let mut disk = DiskConfig::new(path, capacity_mib, method);
            for option in words {
                disk.apply_option(option).map_err(parse_error)?;
            }
            disks.push(disk);
        }

        Ok(Self {
            disks,
            source: Some(PathBuf::from(origin)),
        })
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let label = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: label.clone(),
            source,
        })?;
        Self::parse(&text, &label)
    }

    /// Candidate configuration files, in lookup order.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(path) = env::var_os(CONFIG_ENV) {
            paths.push(PathBuf::from(path));
        }
        paths.push(PathBuf::from(CONFIG_FILE_NAME));
        if let Some(home) = env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(CONFIG_FILE_NAME));
        }
        paths
    }

    /// Loads the first configuration file found, or the scratch fallback if
    /// there is none. A file that exists but does not parse is an error.
    pub fn load() -> anyhow::Result<Self> {
        let Some(path) = Self::search_paths().into_iter().find(|p| p.is_file()) else {
            let config = Self::default_scratch();
            warn!(
                path = %config.disks[0].path.display(),
                "no disk configuration found, using a temporary scratch disk"
            );
            return Ok(config);
        };

        let config = Self::load_from(&path)
            .with_context(|| format!("loading disk configuration {}", path.display()))?;
        if config.disks.is_empty() {
            warn!(path = %path.display(), "disk configuration lists no disks, using a temporary scratch disk");
            return Ok(Self::default_scratch());
        }

        info!(path = %path.display(), disks = config.disks.len(), "loaded disk configuration");
        Ok(config)
    }

    /// One auto-growing scratch file in the temp directory, removed at exit.
    pub fn default_scratch() -> Self {
        let path = env::temp_dir().join(format!("geode_extmem.{}.tmp", std::process::id()));
        let mut disk = DiskConfig::new(path, DEFAULT_SCRATCH_MIB, AccessMethod::Syscall);
        disk.autogrow = true;
        disk.delete_on_exit = true;
        Self::new(vec![disk])
    }

    pub fn total_capacity(&self) -> u64 {
        self.disks.iter().map(|disk| disk.capacity).sum()
    }
}
