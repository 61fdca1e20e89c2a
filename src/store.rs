//! Known-servers cache: the registry's contents as pretty JSON.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;

use crate::discovery::ServerDescriptor;

/// `<data dir>/lanchat/servers.json`, falling back to the working directory.
pub fn default_servers_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("lanchat"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("servers.json")
}

/// Reads previously saved servers. A missing file is an empty list.
pub fn load_servers(path: &Path) -> Result<Vec<ServerDescriptor>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read server cache {:?}", path))?;
    let servers: Vec<ServerDescriptor> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse server cache {:?}", path))?;
    debug!("Loaded {} cached server(s) from {:?}", servers.len(), path);
    Ok(servers)
}

pub fn save_servers(path: &Path, servers: &[ServerDescriptor]) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create cache dir {:?}", dir))?;
        }
    }
    let json = serde_json::to_string_pretty(servers)?;
    fs::write(path, json).with_context(|| format!("Failed to write server cache {:?}", path))?;
    debug!("Saved {} server(s) to {:?}", servers.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::registry::ServerRegistry;

    fn descriptor(name: &str, addr: &str, online: bool, last_seen: Option<u64>) -> ServerDescriptor {
        ServerDescriptor {
            name: name.to_string(),
            address: addr.parse().unwrap(),
            description: "lab".to_string(),
            version: "1.0".to_string(),
            users_count: 2,
            max_users: 50,
            password_protected: false,
            is_online: online,
            last_seen,
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_servers(&dir.path().join("servers.json")).unwrap().is_empty());
    }

    #[test]
    fn saved_registry_seeds_a_new_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("servers.json");

        let registry = ServerRegistry::new();
        registry.seed(vec![
            descriptor("Alpha", "192.168.1.10:8000", true, Some(1_700_000_000)),
            descriptor("Beta", "192.168.1.11:8000", false, None),
        ]);
        save_servers(&path, &registry.list_all()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  "), "pretty printed");

        let restored = ServerRegistry::with_seed(load_servers(&path).unwrap());
        assert_eq!(restored.list_all(), registry.list_all());
        // Seeded entries keep their stored flags until a probe refreshes them.
        assert_eq!(restored.list_online().len(), 1);
    }

    #[test]
    fn corrupt_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        fs::write(&path, "{not json").unwrap();
        assert!(load_servers(&path).is_err());
    }
}
