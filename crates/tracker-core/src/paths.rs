use crate::error::{CoreError, CoreResult};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "SecureTracker";
pub const APP_NAME: &str = "secure-tracker";

pub const LOCAL_DATA_DIR: &str = "local_data";
pub const CREDENTIALS_FILE: &str = "credentials.json";
pub const DATA_KEY_FILE: &str = "encryption.key";
pub const AGENT_CONFIG_FILE: &str = "agent.json";

pub fn data_dir() -> CoreResult<PathBuf> {
    if let Ok(override_dir) = std::env::var("TRACKER_DATA_DIR") {
        if !override_dir.trim().is_empty() {
            return Ok(PathBuf::from(override_dir));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or(CoreError::NoDataDir)?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn local_data_dir(base: &Path) -> PathBuf {
    base.join(LOCAL_DATA_DIR)
}

pub fn credentials_path(base: &Path) -> PathBuf {
    base.join(CREDENTIALS_FILE)
}

pub fn data_key_path(base: &Path) -> PathBuf {
    base.join(DATA_KEY_FILE)
}

pub fn agent_config_path(base: &Path) -> PathBuf {
    base.join(AGENT_CONFIG_FILE)
}
