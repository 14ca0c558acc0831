use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use pitchscore_judge::{JudgeProviderConfig, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_TEMPERATURE};
use pitchscore_schema::CompletenessPolicy;
use serde::{Deserialize, Serialize};

use crate::{BackfillOptions, EvaluationSettings};

pub const CONFIG_FILE_NAME: &str = "config.yaml";

const DEFAULT_API_KEY_REF: &str = "${OPENAI_API_KEY}";

fn default_max_output_tokens() -> u32 {
    DEFAULT_MAX_OUTPUT_TOKENS
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(flatten)]
    pub provider: JudgeProviderConfig,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            provider: JudgeProviderConfig::default(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file; relative paths resolve against the root directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PitchscoreConfig {
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rating: CompletenessPolicy,
    #[serde(default)]
    pub backfill: BackfillOptions,
}

impl PitchscoreConfig {
    pub fn evaluation_settings(&self) -> EvaluationSettings {
        EvaluationSettings {
            max_output_tokens: self.judge.max_output_tokens,
            temperature: self.judge.temperature,
            policy: self.rating,
        }
    }

    pub fn store_path(&self, root: &Path) -> PathBuf {
        match &self.store.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => root.join(path),
            None => root.join("data").join("pitchscore.db"),
        }
    }
}

/// Replace every `${VAR}` with the variable's value (empty when unset).
pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

/// Load `<root>/config.yaml`. A missing file yields the defaults.
pub fn load_config(root: &Path) -> Result<PitchscoreConfig> {
    let path = root.join(CONFIG_FILE_NAME);
    let mut config = if path.exists() {
        read_yaml_file(&path)?
    } else {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        PitchscoreConfig::default()
    };
    resolve_judge_env(&mut config.judge.provider);
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &PitchscoreConfig) -> Result<()> {
    let judge = &config.judge;
    if !(0.0..=2.0).contains(&judge.temperature) {
        return Err(anyhow!(
            "judge.temperature must be within 0-2, got {}",
            judge.temperature
        ));
    }
    if judge.max_output_tokens == 0 {
        return Err(anyhow!("judge.max_output_tokens must be greater than 0"));
    }
    if judge.provider.timeout_secs == 0 {
        return Err(anyhow!("judge.timeout_secs must be greater than 0"));
    }
    if judge.provider.model.trim().is_empty() {
        return Err(anyhow!("judge.model must not be empty"));
    }
    if config.backfill.page_size == 0 {
        return Err(anyhow!("backfill.page_size must be greater than 0"));
    }
    if config.backfill.workers == 0 {
        return Err(anyhow!("backfill.workers must be greater than 0"));
    }
    Ok(())
}

fn read_yaml_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))
}

fn resolve_judge_env(judge: &mut JudgeProviderConfig) {
    let key = judge.api_key.as_deref().unwrap_or(DEFAULT_API_KEY_REF);
    let resolved = resolve_env_var(key);
    judge.api_key = (!resolved.trim().is_empty()).then_some(resolved);
    if let Some(base) = &judge.api_base {
        judge.api_base = Some(resolve_env_var(base));
    }
}
