//! Profile file on disk
//!
//! ```json
//! {
//!   "version": "0.4.0",
//!   "Backyard CPC": { "interfaceKind": "StellariumSerial", "serialPort": "/dev/ttyUSB0", ... }
//! }
//! ```
//!
//! A file written by another version, or one that cannot be parsed, is
//! renamed out of the way and an empty profile set is used instead.

use crate::error::StoreError;
use crate::profile::ConnectionProfile;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Version written to and expected in the profile file
pub const PROFILE_FILE_VERSION: &str = "0.4.0";

/// Top-level key holding the file version; never a profile name
pub const VERSION_KEY: &str = "version";

#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all profiles. A missing file is an empty set.
    pub fn load(&self) -> Result<Vec<ConnectionProfile>, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No profile file at {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        match parse_profiles(&text) {
            Ok(profiles) => {
                tracing::info!("Loaded {} profiles from {}", profiles.len(), self.path.display());
                Ok(profiles)
            }
            Err(e @ (StoreError::VersionMismatch { .. } | StoreError::Json(_))) => {
                let backup = self.back_up()?;
                tracing::warn!(
                    "Ignoring profile file {}: {}; moved to {}",
                    self.path.display(),
                    e,
                    backup.display()
                );
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Write all profiles, replacing the file atomically
    pub fn save<'a>(&self, profiles: impl IntoIterator<Item = &'a ConnectionProfile>) -> Result<(), StoreError> {
        let mut root = Map::new();
        root.insert(VERSION_KEY.to_string(), Value::from(PROFILE_FILE_VERSION));
        let mut count = 0;
        for profile in profiles {
            if profile.name == VERSION_KEY {
                tracing::warn!("Not saving profile with reserved name {:?}", profile.name);
                continue;
            }
            root.insert(profile.name.clone(), serde_json::to_value(profile)?);
            count += 1;
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&Value::Object(root))?)?;
        fs::rename(&tmp, &self.path)?;
        tracing::info!("Saved {} profiles to {}", count, self.path.display());
        Ok(())
    }

    /// Rename the current file to `<file>.<YYYYMMDD-HHMMSS>.bak`
    fn back_up(&self) -> Result<PathBuf, StoreError> {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}.bak", stamp));
        let backup = PathBuf::from(name);
        fs::rename(&self.path, &backup)?;
        Ok(backup)
    }
}

/// Profiles from file contents; entries that do not parse are skipped
pub fn parse_profiles(text: &str) -> Result<Vec<ConnectionProfile>, StoreError> {
    let root: Map<String, Value> = serde_json::from_str(text)?;
    let version = root.get(VERSION_KEY).and_then(Value::as_str);
    if version != Some(PROFILE_FILE_VERSION) {
        return Err(StoreError::VersionMismatch {
            found: version.map(str::to_string),
            expected: PROFILE_FILE_VERSION,
        });
    }

    let mut profiles = Vec::new();
    for (name, entry) in root {
        if name == VERSION_KEY {
            continue;
        }
        match serde_json::from_value::<ConnectionProfile>(entry) {
            Ok(mut profile) => {
                profile.name = name;
                profiles.push(profile);
            }
            Err(e) => tracing::warn!("Skipping unreadable profile {}: {}", name, e),
        }
    }
    Ok(profiles)
}
