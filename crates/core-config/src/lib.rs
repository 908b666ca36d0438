//! Persisted documents: login credentials, tunable settings, accumulated bot
//! data, and the input-callback vocabulary. Login and settings are
//! human-edited, so they're TOML; bot data and input callbacks are
//! machine-written, so they're JSON. A `PersistenceBackend` abstracts the
//! actual storage so tests can swap in an in-memory one without touching
//! the filesystem.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path} as TOML: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize document as TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("failed to parse {path} as JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Bot login credentials (`login.toml`). Human-edited once at setup time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Login {
    pub bot_name: String,
    pub password: String,
    pub channel_name: String,
}

/// Tunable runtime settings (`settings.toml`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub message_cooldown_ms: u64,
    pub main_thread_sleep_ms: u64,
    pub bot_message_char_limit: usize,
    pub connect_message: String,
    /// Sigil prefixing the chat command surface (`!addmacro`, `!removemacro`, ...). Spec default
    /// is `!`; `{1}` of `connect_message` is filled in with this.
    pub command_sigil: char,
    pub auto_whitelist_enabled: bool,
    pub auto_whitelist_input_count: u64,
    pub auto_whitelist_msg: String,
    pub use_chat_bot: bool,
    pub credits_time_secs: u64,
    pub credits_amount: u32,
    pub max_input_duration_ms: u64,
    pub max_simultaneous_duration_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            message_cooldown_ms: 1000,
            main_thread_sleep_ms: 50,
            bot_message_char_limit: 500,
            connect_message: "{0} connected and ready for input (commands start with {1})".to_string(),
            command_sigil: '!',
            auto_whitelist_enabled: true,
            auto_whitelist_input_count: 20,
            auto_whitelist_msg: "{0} has been auto-whitelisted".to_string(),
            use_chat_bot: true,
            credits_time_secs: 300,
            credits_amount: 1,
            max_input_duration_ms: 10_000,
            max_simultaneous_duration_ms: 30_000,
        }
    }
}

/// One user record as persisted in `bot_data.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PersistedUser {
    pub access_level: String,
    pub opted_out: bool,
    pub auto_whitelisted: bool,
    pub message_count: u64,
    pub valid_input_count: u64,
}

/// Accumulated bot state that must survive a restart (`bot_data.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BotData {
    pub users: HashMap<String, PersistedUser>,
    pub memes: HashMap<String, String>,
    pub macros: HashMap<String, String>,
    pub parser_macro_index: u64,
    pub last_controller_type: Option<String>,
    pub joystick_count: usize,
}

/// One entry in the valid-input vocabulary, persisted so operators can add
/// inputs without recompiling (`input_callbacks.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputCallbackEntry {
    pub is_axis: bool,
    pub min_access_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InputCallbacks {
    pub entries: HashMap<String, InputCallbackEntry>,
}

/// Storage abstraction for the four persisted documents. A filesystem
/// implementation ships below; tests use an in-memory one.
pub trait PersistenceBackend: Send + Sync {
    fn load_login(&self) -> Result<Login, PersistenceError>;
    fn save_login(&self, login: &Login) -> Result<(), PersistenceError>;
    fn load_settings(&self) -> Result<Settings, PersistenceError>;
    fn save_settings(&self, settings: &Settings) -> Result<(), PersistenceError>;
    fn load_bot_data(&self) -> Result<BotData, PersistenceError>;
    fn save_bot_data(&self, data: &BotData) -> Result<(), PersistenceError>;
    fn load_input_callbacks(&self) -> Result<InputCallbacks, PersistenceError>;
    fn save_input_callbacks(&self, callbacks: &InputCallbacks) -> Result<(), PersistenceError>;
}

/// Best-effort config directory following platform conventions, preferring
/// a local override directory over the platform config dir.
pub fn discover_dir(app_name: &str) -> PathBuf {
    let local = PathBuf::from(format!("{app_name}-data"));
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join(app_name);
    }
    local
}

/// Plain-file persistence backend: TOML for human-edited documents, JSON for
/// machine-written ones, all under one directory.
pub struct FilesystemBackend {
    dir: PathBuf,
}

impl FilesystemBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    fn read_toml<T: for<'de> Deserialize<'de> + Default>(&self, file_name: &str) -> Result<T, PersistenceError> {
        let path = self.path(file_name);
        match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(|source| PersistenceError::Toml { path, source }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(source) => Err(PersistenceError::Read { path, source }),
        }
    }

    fn write_toml<T: Serialize>(&self, file_name: &str, value: &T) -> Result<(), PersistenceError> {
        let path = self.path(file_name);
        let content = toml::to_string_pretty(value)?;
        fs::write(&path, content).map_err(|source| PersistenceError::Write { path, source })
    }

    fn read_json<T: for<'de> Deserialize<'de> + Default>(&self, file_name: &str) -> Result<T, PersistenceError> {
        let path = self.path(file_name);
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| PersistenceError::Json { path, source }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(source) => Err(PersistenceError::Read { path, source }),
        }
    }

    fn write_json<T: Serialize>(&self, file_name: &str, value: &T) -> Result<(), PersistenceError> {
        let path = self.path(file_name);
        let content = serde_json::to_string_pretty(value).expect("in-memory documents always serialize");
        fs::write(&path, content).map_err(|source| PersistenceError::Write { path, source })
    }
}

impl PersistenceBackend for FilesystemBackend {
    fn load_login(&self) -> Result<Login, PersistenceError> {
        let path = self.path("login.toml");
        let content = fs::read_to_string(&path).map_err(|source| PersistenceError::Read { path: path.clone(), source })?;
        toml::from_str(&content).map_err(|source| PersistenceError::Toml { path, source })
    }

    fn save_login(&self, login: &Login) -> Result<(), PersistenceError> {
        self.write_toml("login.toml", login)
    }

    fn load_settings(&self) -> Result<Settings, PersistenceError> {
        self.read_toml("settings.toml")
    }

    fn save_settings(&self, settings: &Settings) -> Result<(), PersistenceError> {
        self.write_toml("settings.toml", settings)
    }

    fn load_bot_data(&self) -> Result<BotData, PersistenceError> {
        self.read_json("bot_data.json")
    }

    fn save_bot_data(&self, data: &BotData) -> Result<(), PersistenceError> {
        self.write_json("bot_data.json", data)
    }

    fn load_input_callbacks(&self) -> Result<InputCallbacks, PersistenceError> {
        self.read_json("input_callbacks.json")
    }

    fn save_input_callbacks(&self, callbacks: &InputCallbacks) -> Result<(), PersistenceError> {
        self.write_json("input_callbacks.json", callbacks)
    }
}

#[cfg(test)]
fn ensure_dir(path: &Path) {
    fs::create_dir_all(path).expect("test temp dir creation");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.message_cooldown_ms, 1000);
        assert!(settings.auto_whitelist_enabled);
        assert_eq!(settings.command_sigil, '!');
    }

    #[test]
    fn message_placeholders_use_positional_tokens() {
        let settings = Settings::default();
        assert!(settings.connect_message.contains("{0}"));
        assert!(settings.connect_message.contains("{1}"));
        assert!(settings.auto_whitelist_msg.contains("{0}"));
    }

    #[test]
    fn load_settings_falls_back_to_default_when_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(tmp.path());
        let loaded = backend.load_settings().unwrap();
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn save_then_load_settings_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        ensure_dir(tmp.path());
        let backend = FilesystemBackend::new(tmp.path());
        let mut settings = Settings::default();
        settings.message_cooldown_ms = 2500;
        backend.save_settings(&settings).unwrap();
        let loaded = backend.load_settings().unwrap();
        assert_eq!(loaded.message_cooldown_ms, 2500);
    }

    #[test]
    fn load_login_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(tmp.path());
        let err = backend.load_login().unwrap_err();
        assert!(matches!(err, PersistenceError::Read { .. }));
    }

    #[test]
    fn save_then_load_login_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        ensure_dir(tmp.path());
        let backend = FilesystemBackend::new(tmp.path());
        let login = Login {
            bot_name: "playsbot".to_string(),
            password: "oauth:secret".to_string(),
            channel_name: "somechannel".to_string(),
        };
        backend.save_login(&login).unwrap();
        assert_eq!(backend.load_login().unwrap(), login);
    }

    #[test]
    fn bot_data_round_trips_through_json() {
        let tmp = tempfile::tempdir().unwrap();
        ensure_dir(tmp.path());
        let backend = FilesystemBackend::new(tmp.path());
        let mut data = BotData::default();
        data.macros.insert("#smash(*,*)".to_string(), "<0> <1> <0>".to_string());
        data.joystick_count = 2;
        backend.save_bot_data(&data).unwrap();
        let loaded = backend.load_bot_data().unwrap();
        assert_eq!(loaded.joystick_count, 2);
        assert_eq!(loaded.macros.get("#smash(*,*)").unwrap(), "<0> <1> <0>");
    }

    #[test]
    fn input_callbacks_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        ensure_dir(tmp.path());
        let backend = FilesystemBackend::new(tmp.path());
        let mut callbacks = InputCallbacks::default();
        callbacks.entries.insert(
            "a".to_string(),
            InputCallbackEntry {
                is_axis: false,
                min_access_level: None,
            },
        );
        backend.save_input_callbacks(&callbacks).unwrap();
        let loaded = backend.load_input_callbacks().unwrap();
        assert_eq!(loaded.entries.len(), 1);
    }

    #[test]
    fn malformed_toml_settings_surfaces_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        ensure_dir(tmp.path());
        std::fs::write(tmp.path().join("settings.toml"), "not = [valid toml").unwrap();
        let backend = FilesystemBackend::new(tmp.path());
        let err = backend.load_settings().unwrap_err();
        assert!(matches!(err, PersistenceError::Toml { .. }));
    }
}
