use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arbor_llm::{Capabilities, DEFAULT_OPENAI_MODEL, Model, ProviderConfig, capabilities_for};
use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tempfile::NamedTempFile;

use crate::context::TurnOptions;

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "arbor";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "arbor.db";
pub const ENV_PREFIX: &str = "ARBOR_";
pub const FALLBACK_API_KEY_VAR: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub model_name: String,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    /// Overrides the built-in reasoning flag for this model.
    #[serde(default)]
    pub thinking: Option<bool>,
    #[serde(default)]
    pub audio: Option<bool>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_OPENAI_MODEL.to_string(),
            max_tokens: None,
            thinking: None,
            audio: None,
        }
    }
}

impl ModelSettings {
    fn normalized(mut self) -> Option<Self> {
        self.model_name = self.model_name.trim().to_string();
        if self.model_name.is_empty() {
            return None;
        }

        Some(self)
    }

    pub fn capabilities(&self) -> Capabilities {
        let known = capabilities_for(&self.model_name);
        Capabilities::new(
            self.thinking.unwrap_or(known.thinking),
            self.audio.unwrap_or(known.audio),
        )
    }

    pub fn as_model(&self) -> Model {
        let mut model =
            Model::from_id(self.model_name.clone()).with_capabilities(self.capabilities());
        if let Some(max_tokens) = self.max_tokens {
            model = model.with_description(format!("max_tokens={max_tokens}"));
        }
        model
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_models")]
    pub models: Vec<ModelSettings>,
    /// Model used for branch labels; the first configured model when unset.
    #[serde(default)]
    pub title_model: Option<String>,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub preamble: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            models: default_models(),
            title_model: None,
            database_path: None,
            preamble: None,
            temperature: None,
        }
    }
}

impl Settings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint)
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn default_model_name(&self) -> String {
        self.models
            .first()
            .map(|model| model.model_name.clone())
            .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string())
    }

    pub fn configured_models(&self) -> Vec<Model> {
        self.models.iter().map(ModelSettings::as_model).collect()
    }

    fn model(&self, model_name: &str) -> ModelSettings {
        self.models
            .iter()
            .find(|model| model.model_name == model_name)
            .cloned()
            .unwrap_or_else(|| ModelSettings {
                model_name: model_name.to_string(),
                ..ModelSettings::default()
            })
    }

    pub fn turn_options(&self, model_name: Option<&str>) -> TurnOptions {
        let model = self.model(model_name.unwrap_or(&self.default_model_name()));
        TurnOptions {
            capabilities: model.capabilities(),
            max_tokens: model.max_tokens,
            model_id: model.model_name,
            preamble: self.preamble.clone(),
            temperature: self.temperature,
        }
    }

    /// Options for label generation: no reasoning, no audio, no preamble.
    pub fn title_options(&self) -> TurnOptions {
        let model_name = self
            .title_model
            .clone()
            .unwrap_or_else(|| self.default_model_name());
        TurnOptions {
            capabilities: Capabilities::default(),
            max_tokens: self.model(&model_name).max_tokens,
            model_id: model_name,
            preamble: None,
            temperature: None,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| SettingsStore::default_config_dir().join(DATABASE_FILE_NAME))
    }

    pub fn normalized(self) -> Self {
        let mut models: Vec<ModelSettings> = self
            .models
            .into_iter()
            .filter_map(ModelSettings::normalized)
            .collect();
        if models.is_empty() {
            models = default_models();
        }

        Self {
            provider_id: trimmed_or(self.provider_id, default_provider_id),
            api_key: self.api_key.trim().to_string(),
            endpoint: trimmed_or(self.endpoint, default_endpoint),
            models,
            title_model: self
                .title_model
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
            preamble: self.preamble.filter(|text| !text.trim().is_empty()),
            ..self
        }
    }
}

/// Shared, hot-swappable settings backed by a JSON file.
///
/// Reads never block writers: callers hold an `Arc<Settings>` snapshot while
/// `update` swaps in the next one.
pub struct SettingsStore {
    current: ArcSwap<Settings>,
    path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        match dirs::config_dir() {
            Some(base) => base.join(SETTINGS_DIRECTORY_NAME),
            None => PathBuf::from(".arbor"),
        }
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(path: PathBuf) -> Self {
        Self {
            current: ArcSwap::from_pointee(Self::read_layers(&path)),
            path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.current.load_full()
    }

    /// Normalizes, writes to disk, then publishes.
    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let settings = Arc::new(settings.normalized());
        self.write_file(&settings)?;
        self.current.store(settings);
        Ok(())
    }

    /// Applies an in-memory change without touching the settings file.
    pub fn override_with(&self, apply: impl FnOnce(&mut Settings)) {
        let mut next = Settings::clone(&self.current.load());
        apply(&mut next);
        self.current.store(Arc::new(next.normalized()));
    }

    fn layers(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["models"]))
    }

    fn read_layers(path: &Path) -> Settings {
        let mut settings = Self::layers(path)
            .extract::<Settings>()
            .map(Settings::normalized)
            .unwrap_or_else(|error| {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "unreadable settings, using defaults"
                );
                Settings::default()
            });

        if !settings.has_api_key() {
            match std::env::var(FALLBACK_API_KEY_VAR) {
                Ok(key) => {
                    tracing::debug!(
                        variable = FALLBACK_API_KEY_VAR,
                        "api key taken from environment"
                    );
                    settings.api_key = key.trim().to_string();
                }
                Err(_) => tracing::info!(path = %path.display(), "no api key configured"),
            }
        }
        settings
    }

    fn write_file(&self, settings: &Settings) -> Result<(), SettingsError> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&directory).context(PrepareDirectorySnafu {
            stage: "settings-write-directory",
            path: directory.clone(),
        })?;

        let encoded = serde_json::to_vec_pretty(settings).context(EncodeSnafu {
            stage: "settings-write-encode",
        })?;

        // Stage beside the target so the rename stays on one filesystem.
        let mut staged = NamedTempFile::new_in(&directory).context(StageFileSnafu {
            stage: "settings-write-stage",
            path: directory.clone(),
        })?;
        staged.write_all(&encoded).context(StageFileSnafu {
            stage: "settings-write-contents",
            path: staged.path().to_path_buf(),
        })?;
        staged.persist(&self.path).context(ReplaceFileSnafu {
            stage: "settings-write-replace",
            path: self.path.clone(),
        })?;

        tracing::info!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot create settings directory {} during {stage}", path.display()))]
    PrepareDirectory {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode settings during {stage}: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot stage settings in {} during {stage}", path.display()))]
    StageFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot replace {} during {stage}: {source}", path.display()))]
    ReplaceFile {
        stage: &'static str,
        path: PathBuf,
        source: tempfile::PersistError,
    },
}

fn trimmed_or(value: String, fallback: fn() -> String) -> String {
    match value.trim() {
        "" => fallback(),
        trimmed => trimmed.to_string(),
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_models() -> Vec<ModelSettings> {
    vec![ModelSettings::default()]
}
