//! Kernel construction options.
//!
//! Options are usually built in code, but can also be read from a JSON file
//! in the platform config directory:
//! - Linux: ~/.config/worker-kernel/options.json
//! - macOS: ~/Library/Application Support/worker-kernel/options.json
//! - Windows: C:\Users\<User>\AppData\Roaming\worker-kernel\options.json

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};

use shared_channel::DEFAULT_CAPACITY;

/// Largest stdin region a kernel will allocate.
pub const MAX_STDIN_CAPACITY: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelOptions {
    /// Where the interpreter runtime fetches its own assets from.
    pub base_url: Option<String>,

    /// Package index consulted when preloading packages.
    pub index_url: Option<String>,

    /// Packages to preload during initialization.
    #[serde(deserialize_with = "deserialize_package_list")]
    pub packages: Vec<String>,

    /// Working directory inside the interpreter.
    pub location: String,

    /// Bind `location` from the host filesystem into the interpreter.
    pub mount_drive: bool,

    /// Size in bytes of the shared stdin region.
    pub stdin_capacity: usize,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            index_url: None,
            packages: Vec::new(),
            location: ".".to_string(),
            mount_drive: false,
            stdin_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Accepts `["a", "b"]` as well as `"a, b"`.
fn deserialize_package_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PackageList {
        Joined(String),
        Items(Vec<String>),
    }

    let items = match PackageList::deserialize(deserializer)? {
        PackageList::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        PackageList::Items(items) => items,
    };
    Ok(items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect())
}

pub fn options_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("worker-kernel")
        .join("options.json")
}

impl KernelOptions {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Load from [`options_path`], falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load_or_default() -> Self {
        let path = options_path();
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            warn!("[options] {:#}; using defaults", e);
            Self::default()
        })
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.stdin_capacity < 2 || self.stdin_capacity > MAX_STDIN_CAPACITY {
            return Err(format!(
                "stdin_capacity must be between 2 and {} bytes, got {}",
                MAX_STDIN_CAPACITY, self.stdin_capacity
            ));
        }
        if self.location.is_empty() {
            return Err("location must not be empty".to_string());
        }
        Ok(())
    }
}
