// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Target registry
//
// Saved SSH targets, one TOML file per name under the config directory.
// The file carries the full SshTarget including auth material, so it is
// written owner-readable only.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use wirelift_common::SshTarget;

pub struct TargetRegistry {
    dir: PathBuf,
}

impl TargetRegistry {
    /// Open the registry at its default location, ~/.config/wirelift/targets
    pub fn open() -> Result<Self> {
        let dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("wirelift")
            .join("targets");
        Ok(Self { dir })
    }

    pub fn at(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        // Names become filenames; keep them boring
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!(
                "invalid target name '{}' (letters, digits, '-' and '_' only)",
                name
            );
        }
        Ok(self.dir.join(format!("{}.toml", name)))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn save(&self, name: &str, target: &SshTarget, overwrite: bool) -> Result<PathBuf> {
        let path = self.path_for(name)?;
        if path.exists() && !overwrite {
            anyhow::bail!("a target named '{}' already exists", name);
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let contents = toml::to_string_pretty(target).context("failed to serialize target")?;
        fs::write(&path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        restrict_permissions(&path)?;
        Ok(path)
    }

    pub fn load(&self, name: &str) -> Result<SshTarget> {
        let path = self.path_for(name)?;
        if !path.exists() {
            anyhow::bail!("target '{}' not found", name);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn remove(&self, name: &str) -> Result<PathBuf> {
        let path = self.path_for(name)?;
        if !path.exists() {
            anyhow::bail!("target '{}' not found", name);
        }
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
        Ok(path)
    }

    /// All saved targets, sorted by name
    pub fn list(&self) -> Result<Vec<(String, SshTarget)>> {
        let mut entries = Vec::new();
        if !self.dir.exists() {
            return Ok(entries);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "toml") != Some(true) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(name) {
                Ok(target) => entries.push((name.to_string(), target)),
                Err(e) => tracing::warn!("Skipping unreadable target file {}: {}", path.display(), e),
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirelift_common::SshAuth;

    fn target(host: &str) -> SshTarget {
        SshTarget {
            host: host.to_string(),
            port: 22,
            username: "ops".to_string(),
            auth: SshAuth::Key {
                key_path: PathBuf::from("/home/ops/.ssh/id_ed25519"),
                passphrase: None,
            },
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let reg = TargetRegistry::at(dir.path().to_path_buf());
        reg.save("lab", &target("gw.example.net"), false).unwrap();
        let loaded = reg.load("lab").unwrap();
        assert_eq!(loaded.host, "gw.example.net");
        assert!(reg.exists("lab"));
    }

    #[test]
    fn duplicate_name_requires_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let reg = TargetRegistry::at(dir.path().to_path_buf());
        reg.save("lab", &target("a"), false).unwrap();
        assert!(reg.save("lab", &target("b"), false).is_err());
        reg.save("lab", &target("b"), true).unwrap();
        assert_eq!(reg.load("lab").unwrap().host, "b");
    }

    #[test]
    fn remove_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let reg = TargetRegistry::at(dir.path().to_path_buf());
        assert!(reg.load("nope").is_err());
        assert!(reg.remove("nope").is_err());
        reg.save("lab", &target("a"), false).unwrap();
        reg.remove("lab").unwrap();
        assert!(!reg.exists("lab"));
    }

    #[test]
    fn list_is_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let reg = TargetRegistry::at(dir.path().to_path_buf());
        reg.save("zeta", &target("z"), false).unwrap();
        reg.save("alpha", &target("a"), false).unwrap();
        let names: Vec<_> = reg.list().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn hostile_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = TargetRegistry::at(dir.path().to_path_buf());
        assert!(reg.save("../escape", &target("a"), false).is_err());
        assert!(reg.save("", &target("a"), false).is_err());
    }
}
