//! Small JSON config-file underlay for executor identity, layered beneath
//! environment variables and CLI flags. Adapted from the teacher's
//! submitter identity file (`crates/client-core/src/submitter.rs`): same XDG
//! location convention, same atomic tmp-then-rename write.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorIdentity {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub fn identity_config_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("wexec").join("identity.json"))
}

pub fn load_identity() -> anyhow::Result<ExecutorIdentity> {
    let path = identity_config_path()?;
    if !path.exists() {
        return Ok(ExecutorIdentity::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn save_identity(identity: &ExecutorIdentity) -> anyhow::Result<()> {
    let path = identity_config_path()?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid identity config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(identity)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Load the identity file, minting and persisting a fresh uuid if one is not
/// already on disk.
pub fn ensure_identity() -> anyhow::Result<ExecutorIdentity> {
    let mut identity = load_identity()?;
    if identity.uuid.is_none() {
        identity.uuid = Some(Uuid::new_v4().to_string());
        save_identity(&identity)?;
    }
    Ok(identity)
}
