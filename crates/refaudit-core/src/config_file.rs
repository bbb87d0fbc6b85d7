use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Config;

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub credentials: Option<CredentialsConfig>,
    pub matching: Option<MatchingConfig>,
    pub cache: Option<CacheConfig>,
    pub concurrency: Option<ConcurrencyConfig>,
    pub registries: Option<RegistriesConfig>,
    pub model: Option<ModelSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub crossref_mailto: Option<String>,
    pub ncbi_api_key: Option<String>,
    pub model_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub similarity_threshold_fuzzy_match: Option<f64>,
    pub similarity_threshold_duplicate: Option<f64>,
    pub doi_mismatch_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: Option<String>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub max_concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub model_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistriesConfig {
    pub disabled: Option<Vec<String>>,
}

/// `[model]`: the classification endpoint. Present without `enabled = false`
/// means the model is used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSection {
    pub enabled: Option<bool>,
    pub endpoint: Option<String>,
    pub name: Option<String>,
}

/// Platform config directory path: `<config_dir>/refaudit/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("refaudit").join("config.toml"))
}

/// Load config by cascading CWD `.refaudit.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".refaudit.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
            None
        }
    }
}

/// Overlay value if set, else the base value.
fn pick<S, T>(base: &Option<S>, overlay: &Option<S>, field: impl Fn(&S) -> Option<T>) -> Option<T> {
    overlay
        .as_ref()
        .and_then(&field)
        .or_else(|| base.as_ref().and_then(&field))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (b, o) = (&base, &overlay);
    ConfigFile {
        credentials: Some(CredentialsConfig {
            crossref_mailto: pick(&b.credentials, &o.credentials, |c| c.crossref_mailto.clone()),
            ncbi_api_key: pick(&b.credentials, &o.credentials, |c| c.ncbi_api_key.clone()),
            model_api_key: pick(&b.credentials, &o.credentials, |c| c.model_api_key.clone()),
        }),
        matching: Some(MatchingConfig {
            similarity_threshold_fuzzy_match: pick(&b.matching, &o.matching, |m| {
                m.similarity_threshold_fuzzy_match
            }),
            similarity_threshold_duplicate: pick(&b.matching, &o.matching, |m| {
                m.similarity_threshold_duplicate
            }),
            doi_mismatch_threshold: pick(&b.matching, &o.matching, |m| m.doi_mismatch_threshold),
        }),
        cache: Some(CacheConfig {
            path: pick(&b.cache, &o.cache, |c| c.path.clone()),
            ttl_secs: pick(&b.cache, &o.cache, |c| c.ttl_secs),
        }),
        concurrency: Some(ConcurrencyConfig {
            max_concurrency: pick(&b.concurrency, &o.concurrency, |c| c.max_concurrency),
            max_retries: pick(&b.concurrency, &o.concurrency, |c| c.max_retries),
            retry_base_delay_ms: pick(&b.concurrency, &o.concurrency, |c| c.retry_base_delay_ms),
            request_timeout_secs: pick(&b.concurrency, &o.concurrency, |c| c.request_timeout_secs),
            model_timeout_secs: pick(&b.concurrency, &o.concurrency, |c| c.model_timeout_secs),
        }),
        registries: Some(RegistriesConfig {
            disabled: pick(&b.registries, &o.registries, |r| r.disabled.clone()),
        }),
        model: match (&b.model, &o.model) {
            (None, None) => None,
            (bm, om) => Some(ModelSection {
                enabled: pick(bm, om, |m| m.enabled),
                endpoint: pick(bm, om, |m| m.endpoint.clone()),
                name: pick(bm, om, |m| m.name.clone()),
            }),
        },
    }
}

impl ConfigFile {
    /// Copy every value this file sets onto `config`, leaving the rest alone.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref c) = self.credentials {
            if let Some(ref mailto) = c.crossref_mailto {
                config.crossref_mailto = Some(mailto.clone());
            }
            if let Some(ref key) = c.ncbi_api_key {
                config.ncbi_api_key = Some(key.clone());
            }
        }
        if let Some(ref m) = self.matching {
            if let Some(v) = m.similarity_threshold_fuzzy_match {
                config.similarity_threshold_fuzzy_match = v;
            }
            if let Some(v) = m.similarity_threshold_duplicate {
                config.similarity_threshold_duplicate = v;
            }
            if let Some(v) = m.doi_mismatch_threshold {
                config.doi_mismatch_threshold = v;
            }
        }
        if let Some(ref c) = self.cache {
            if let Some(ref path) = c.path {
                config.cache_path = Some(PathBuf::from(path));
            }
            if let Some(ttl) = c.ttl_secs {
                config.cache_ttl_secs = ttl;
            }
        }
        if let Some(ref c) = self.concurrency {
            if let Some(v) = c.max_concurrency {
                config.max_concurrency = v;
            }
            if let Some(v) = c.max_retries {
                config.max_retries = v;
            }
            if let Some(v) = c.retry_base_delay_ms {
                config.retry_base_delay_ms = v;
            }
            if let Some(v) = c.request_timeout_secs {
                config.request_timeout_secs = v;
            }
            if let Some(v) = c.model_timeout_secs {
                config.model_timeout_secs = v;
            }
        }
        if let Some(ref r) = self.registries
            && let Some(ref disabled) = r.disabled
        {
            config.disabled_registries = disabled.clone();
        }
        if let Some(ref m) = self.model
            && m.enabled != Some(false)
        {
            let mut model = config.model.take().unwrap_or_default();
            if let Some(ref endpoint) = m.endpoint {
                model.endpoint = endpoint.clone();
            }
            if let Some(ref name) = m.name {
                model.model = name.clone();
            }
            if let Some(key) = self.credentials.as_ref().and_then(|c| c.model_api_key.clone()) {
                model.api_key = Some(key);
            }
            config.model = Some(model);
        }
    }
}

/// Save the current config to the platform config directory.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf, String> {
    let path = config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
    save_to_path(config, &path)?;
    Ok(path)
}

pub fn save_to_path(config: &ConfigFile, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("Failed to serialize config: {}", e))?;
    std::fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_round_trip_toml() {
        let config = ConfigFile {
            cache: Some(CacheConfig {
                path: Some("/tmp/test_cache.db".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: ConfigFile = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.cache.unwrap().path.unwrap(), "/tmp/test_cache.db");
    }

    #[test]
    fn partial_sections_deserialize() {
        let toml_str = "[matching]\nsimilarity_threshold_fuzzy_match = 0.8\n\n[registries]\ndisabled = [\"PubMed\"]\n";
        let parsed: ConfigFile = toml::from_str(toml_str).unwrap();
        let matching = parsed.matching.unwrap();
        assert_eq!(matching.similarity_threshold_fuzzy_match, Some(0.8));
        assert!(matching.similarity_threshold_duplicate.is_none());
        assert_eq!(parsed.registries.unwrap().disabled.unwrap(), vec!["PubMed"]);
        assert!(parsed.credentials.is_none());
    }

    #[test]
    fn merge_overlay_wins_and_base_fills_gaps() {
        let base = ConfigFile {
            credentials: Some(CredentialsConfig {
                crossref_mailto: Some("base@example.org".into()),
                ncbi_api_key: Some("base-key".into()),
                ..Default::default()
            }),
            concurrency: Some(ConcurrencyConfig {
                max_concurrency: Some(8),
                ..Default::default()
            }),
            ..Default::default()
        };
        let overlay = ConfigFile {
            credentials: Some(CredentialsConfig {
                crossref_mailto: Some("overlay@example.org".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merge(base, overlay);
        let credentials = merged.credentials.unwrap();
        assert_eq!(credentials.crossref_mailto.as_deref(), Some("overlay@example.org"));
        assert_eq!(credentials.ncbi_api_key.as_deref(), Some("base-key"));
        assert_eq!(merged.concurrency.unwrap().max_concurrency, Some(8));
        assert!(merged.model.is_none());
    }

    #[test]
    fn apply_to_overrides_only_set_values() {
        let file = ConfigFile {
            matching: Some(MatchingConfig {
                similarity_threshold_duplicate: Some(0.95),
                ..Default::default()
            }),
            cache: Some(CacheConfig {
                ttl_secs: Some(60),
                path: Some("/tmp/refaudit.db".into()),
            }),
            registries: Some(RegistriesConfig {
                disabled: Some(vec!["PubMed".into()]),
            }),
            ..Default::default()
        };
        let mut config = Config::default();
        file.apply_to(&mut config);

        assert_eq!(config.similarity_threshold_duplicate, 0.95);
        assert_eq!(config.similarity_threshold_fuzzy_match, 0.85);
        assert_eq!(config.cache_ttl_secs, 60);
        assert_eq!(config.cache_path, Some(PathBuf::from("/tmp/refaudit.db")));
        assert!(config.is_registry_disabled("pubmed"));
        assert!(config.model.is_none());
    }

    #[test]
    fn model_section_enables_model() {
        let file: ConfigFile = toml::from_str(
            "[credentials]\nmodel_api_key = \"sk-test\"\n\n[model]\nname = \"qwen-plus\"\n",
        )
        .unwrap();
        let mut config = Config::default();
        file.apply_to(&mut config);
        let model = config.model.unwrap();
        assert_eq!(model.model, "qwen-plus");
        assert_eq!(model.api_key.as_deref(), Some("sk-test"));
        assert_eq!(model.endpoint, crate::model::chat::DEFAULT_ENDPOINT);

        let disabled: ConfigFile = toml::from_str("[model]\nenabled = false\n").unwrap();
        let mut config = Config::default();
        disabled.apply_to(&mut config);
        assert!(config.model.is_none());
    }

    #[test]
    fn missing_or_broken_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_from_path(&dir.path().join("nope.toml")).is_none());

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[matching\nthreshold = ").unwrap();
        assert!(load_from_path(&broken).is_none());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = ConfigFile {
            concurrency: Some(ConcurrencyConfig {
                max_retries: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };
        save_to_path(&config, &path).unwrap();
        assert_eq!(load_from_path(&path), Some(config));
    }
}
