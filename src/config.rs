use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCfg {
    pub kind: String, // "gemini" | "mock"
    pub model: String,
    pub api_key_env: String,
    pub base_url: String,
}

impl Default for ProviderCfg {
    fn default() -> Self {
        Self {
            kind: "gemini".into(),
            model: "gemini-2.5-flash-image-preview".into(),
            api_key_env: "API_KEY".into(),
            base_url: "https://generativelanguage.googleapis.com".into(),
        }
    }
}

impl ProviderCfg {
    /// Reads the credential once; absence is reported when a call is attempted.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerCfg {
    pub bind: String,
    /// Directory with the browser page, served at `/` when set.
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self { bind: "127.0.0.1:8787".into(), static_dir: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppCfg {
    pub provider: ProviderCfg,
    pub server: ServerCfg,
    /// Template catalog YAML; the built-in catalog is used when unset.
    pub catalog: Option<PathBuf>,
    pub out_dir: PathBuf,
}

impl Default for AppCfg {
    fn default() -> Self {
        Self {
            provider: ProviderCfg::default(),
            server: ServerCfg::default(),
            catalog: None,
            out_dir: PathBuf::from("out"),
        }
    }
}

impl AppCfg {
    /// Loads the YAML file when given, then applies `PROMPTBOOK_*` overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let txt = tokio::fs::read_to_string(p)
                    .await
                    .with_context(|| format!("Failed to read config file: {}", p.display()))?;
                Self::from_yaml(&txt).context("Failed to parse config YAML")?
            }
            None => Self::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok());
        Ok(cfg)
    }

    pub fn from_yaml(txt: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(txt)?)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = var("PROMPTBOOK_BIND") { self.server.bind = bind; }
        if let Some(dir) = var("PROMPTBOOK_OUT_DIR") { self.out_dir = PathBuf::from(dir); }
        if let Some(kind) = var("PROMPTBOOK_PROVIDER") { self.provider.kind = kind; }
        if let Some(model) = var("PROMPTBOOK_MODEL") { self.provider.model = model; }
    }
}
