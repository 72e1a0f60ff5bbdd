// Language allow-list and per-language sandbox settings, loaded from languages.json
use anyhow::{bail, Context, Result};
use arbiter_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub image: String,
    /// File the source is written to inside the sandbox working directory
    pub source_file: String,
    /// Shell command that compiles or syntax-checks the source; absent for none
    #[serde(default)]
    pub compile_command: Option<String>,
    /// Shell command that runs the program, reading the test input on stdin
    pub run_command: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LanguagesFile {
    pub languages: Vec<LanguageConfig>,
}

impl LanguagesFile {
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Language config file not found: {}", path.display());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize languages")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }
}

/// Registry of configured languages.
/// This is the authoritative source for which languages a submission may use.
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_configs(LanguagesFile::read(path)?.languages)
    }

    pub fn from_configs(configs: Vec<LanguageConfig>) -> Result<Self> {
        let mut map = HashMap::new();
        for config in configs {
            let language: Language = config
                .name
                .parse()
                .map_err(|e: String| anyhow::anyhow!("{} in languages config", e))?;
            if map.insert(language, config).is_some() {
                bail!("Language '{}' configured twice", language);
            }
        }
        if map.is_empty() {
            bail!("No languages configured");
        }
        Ok(Self { configs: map })
    }

    pub fn is_enabled(&self, language: Language) -> bool {
        self.configs.contains_key(&language)
    }

    pub fn get(&self, language: Language) -> Option<&LanguageConfig> {
        self.configs.get(&language)
    }

    pub fn list_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.configs.keys().copied().collect();
        languages.sort_by_key(|l| l.as_str());
        languages
    }
}
