//! Launch profiles available to `create`.

use std::path::PathBuf;
use webterm_core::{Profile, WebtermError, WebtermResult};

/// Id of the always-present shell profile.
pub const DEFAULT_PROFILE_ID: &str = "default";

/// Read-only lookup of launch templates.
pub trait ProfileStore: Send + Sync {
    fn get(&self, id: &str) -> WebtermResult<Profile>;
    fn list(&self) -> Vec<Profile>;
}

/// Profiles from the config file plus the seeded `default` shell.
#[derive(Debug, Clone)]
pub struct ConfiguredProfiles {
    profiles: Vec<Profile>,
}

impl ConfiguredProfiles {
    /// A configured profile with id `default` replaces the seeded one.
    pub fn new(configured: Vec<Profile>, default_shell: &str, default_cwd: PathBuf) -> Self {
        let mut profiles = Vec::with_capacity(configured.len() + 1);
        if !configured.iter().any(|p| p.id == DEFAULT_PROFILE_ID) {
            let mut shell = Profile::new(DEFAULT_PROFILE_ID, default_shell).with_cwd(default_cwd);
            shell.name = "Default shell".into();
            profiles.push(shell);
        }
        profiles.extend(configured);
        Self { profiles }
    }
}

impl ProfileStore for ConfiguredProfiles {
    fn get(&self, id: &str) -> WebtermResult<Profile> {
        self.profiles
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| WebtermError::ProfileNotFound(id.to_string()))
    }

    fn list(&self) -> Vec<Profile> {
        self.profiles.clone()
    }
}
