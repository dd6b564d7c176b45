use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use common::config::EngineConfig;
use common::crypto::{random_bytes, CryptoError, KeyRing};
use common::loopback::{LoopbackError, LoopbackService};
use common::types::UserHandle;

use crate::store::write_atomic;

pub const APP_NAME: &str = "cumulus";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const KEY_FILE_NAME: &str = "key.pem";
pub const STORE_FILE_NAME: &str = "state.bin";
pub const MIRROR_FILE_NAME: &str = "mirror.bin";
pub const LOG_DIR_NAME: &str = "logs";

/// One local folder kept in sync with one remote folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPair {
    /// Absolute path of the local folder
    pub local: PathBuf,
    /// `/`-separated folder path below the cloud drive root
    pub remote: String,
}

impl std::str::FromStr for SyncPair {
    type Err = String;

    /// Parses `LOCAL=REMOTE`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (local, remote) = s
            .split_once('=')
            .ok_or_else(|| format!("expected LOCAL=REMOTE, got {:?}", s))?;
        if local.is_empty() || remote.trim_matches('/').is_empty() {
            return Err(format!("empty side in {:?}", s));
        }
        Ok(Self {
            local: PathBuf::from(local),
            remote: remote.trim_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default log directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Also write a daily rolling log file under the state directory
    #[serde(default)]
    pub log_to_file: bool,
    /// Milliseconds between engine rounds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default)]
    pub syncs: Vec<SyncPair>,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_ms() -> u64 {
    100
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_to_file: false,
            tick_ms: default_tick_ms(),
            syncs: Vec::new(),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the state directory (~/.cumulus)
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    /// Account master key and identity
    pub key_path: PathBuf,
    /// Node and local tree cache
    pub store_path: PathBuf,
    /// Local mirror of the remote service
    pub mirror_path: PathBuf,
    pub log_dir: PathBuf,
    pub config: AppConfig,
}

impl AppState {
    /// Get the state directory path (custom or default ~/.cumulus)
    pub fn state_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }
        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    fn paths(state_dir: PathBuf, config: AppConfig) -> Self {
        Self {
            config_path: state_dir.join(CONFIG_FILE_NAME),
            key_path: state_dir.join(KEY_FILE_NAME),
            store_path: state_dir.join(STORE_FILE_NAME),
            mirror_path: state_dir.join(MIRROR_FILE_NAME),
            log_dir: state_dir.join(LOG_DIR_NAME),
            state_dir,
            config,
        }
    }

    /// Initialize a new state directory with a fresh account key
    pub fn init(custom_path: Option<PathBuf>, config: Option<AppConfig>) -> Result<Self, StateError> {
        let state_dir = Self::state_dir(custom_path)?;
        if state_dir.join(CONFIG_FILE_NAME).exists() {
            return Err(StateError::AlreadyInitialized);
        }
        fs::create_dir_all(&state_dir)?;

        let state = Self::paths(state_dir, config.unwrap_or_default());

        let mut id = [0u8; 8];
        random_bytes(&mut id)?;
        let keyring = KeyRing::generate(UserHandle::from_u64(u64::from_le_bytes(id)))?;
        write_atomic(&state.key_path, keyring.to_pem().as_bytes())?;

        let mirror = LoopbackService::new(keyring.me);
        write_atomic(&state.mirror_path, &mirror.to_bytes()?)?;

        state.save_config()?;
        Ok(state)
    }

    /// Load existing state from the state directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let state_dir = Self::state_dir(custom_path)?;
        if !state_dir.exists() {
            return Err(StateError::NotInitialized);
        }
        let config_path = state_dir.join(CONFIG_FILE_NAME);
        for (path, name) in [
            (&config_path, CONFIG_FILE_NAME),
            (&state_dir.join(KEY_FILE_NAME), KEY_FILE_NAME),
            (&state_dir.join(MIRROR_FILE_NAME), MIRROR_FILE_NAME),
        ] {
            if !path.exists() {
                return Err(StateError::MissingFile(name.to_string()));
            }
        }
        let config: AppConfig = toml::from_str(&fs::read_to_string(&config_path)?)?;
        Ok(Self::paths(state_dir, config))
    }

    pub fn save_config(&self) -> Result<(), StateError> {
        let config_toml = toml::to_string_pretty(&self.config)?;
        write_atomic(&self.config_path, config_toml.as_bytes())?;
        Ok(())
    }

    pub fn load_keyring(&self) -> Result<KeyRing, StateError> {
        let pem = fs::read_to_string(&self.key_path)?;
        KeyRing::from_pem(&pem).map_err(|e| StateError::InvalidKey(e.to_string()))
    }

    pub fn load_mirror(&self) -> Result<LoopbackService, StateError> {
        Ok(LoopbackService::from_bytes(&fs::read(&self.mirror_path)?)?)
    }

    pub fn save_mirror(&self, mirror: &LoopbackService) -> Result<(), StateError> {
        write_atomic(&self.mirror_path, &mirror.to_bytes()?)?;
        Ok(())
    }

    /// Log directory when file logging is on
    pub fn log_dir(&self) -> Option<&Path> {
        self.config.log_to_file.then_some(self.log_dir.as_path())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state directory not initialized. Run 'cumulus init' first")]
    NotInitialized,

    #[error("state directory already initialized")]
    AlreadyInitialized,

    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("missing required file: {0}")]
    MissingFile(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("mirror error: {0}")]
    Mirror(#[from] LoopbackError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_init_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let custom = Some(dir.path().join("state"));
        let config = AppConfig {
            syncs: vec!["/home/me/Documents=Docs".parse().unwrap()],
            ..AppConfig::default()
        };
        let created = AppState::init(custom.clone(), Some(config)).unwrap();
        let loaded = AppState::load(custom).unwrap();

        assert_eq!(loaded.config.syncs, created.config.syncs);
        assert_eq!(loaded.config.engine, EngineConfig::default());
        let keyring = loaded.load_keyring().unwrap();
        let mirror = loaded.load_mirror().unwrap();
        assert_eq!(mirror.node(&mirror.root()).map(|n| n.owner), Some(keyring.me));
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let custom = Some(dir.path().to_path_buf());
        AppState::init(custom.clone(), None).unwrap();
        assert!(matches!(
            AppState::init(custom, None),
            Err(StateError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_load_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AppState::load(Some(dir.path().join("missing"))),
            Err(StateError::NotInitialized)
        ));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            tick_ms = 250

            [[syncs]]
            local = "/data/photos"
            remote = "Photos"

            [engine]
            max_uploads = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.tick_ms, 250);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.engine.max_uploads, 2);
        assert_eq!(config.engine.max_downloads, EngineConfig::default().max_downloads);
        assert_eq!(config.syncs[0].remote, "Photos");
    }

    #[test]
    fn test_sync_pair_parsing() {
        let pair: SyncPair = "/a/b=/Docs/Work/".parse().unwrap();
        assert_eq!(pair.local, PathBuf::from("/a/b"));
        assert_eq!(pair.remote, "Docs/Work");
        assert!("/a/b".parse::<SyncPair>().is_err());
        assert!("/a/b=/".parse::<SyncPair>().is_err());
    }
}
