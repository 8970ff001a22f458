pub mod api;
pub mod config;
pub mod events;
pub mod form;
pub mod generate;
pub mod io;
pub mod prompts;
pub mod providers;
pub mod session;

use anyhow::{bail, Result};
use std::sync::Arc;

use config::AppCfg;
use prompts::Catalog;
use providers::{GeminiGenerator, ImageGenerator, MockGenerator};

pub async fn load_catalog(cfg: &AppCfg) -> Result<Arc<Catalog>> {
    let catalog = match &cfg.catalog {
        Some(path) => Catalog::load(path).await?,
        None => Catalog::builtin()?,
    };
    Ok(Arc::new(catalog))
}

pub fn build_generator(cfg: &AppCfg) -> Result<Arc<dyn ImageGenerator>> {
    let generator: Arc<dyn ImageGenerator> = match cfg.provider.kind.as_str() {
        "gemini" => {
            let gen = GeminiGenerator::new(&cfg.provider, cfg.provider.api_key());
            if !gen.has_credential() {
                tracing::warn!(env = %cfg.provider.api_key_env, "no API key configured; generation requests will fail");
            }
            Arc::new(gen)
        }
        "mock" => Arc::new(MockGenerator),
        other => bail!("unknown provider '{other}' (expected gemini or mock)"),
    };
    Ok(generator)
}
