use std::{path::PathBuf, time::Duration};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use promptbook::{
    api, build_generator,
    config::AppCfg,
    events::FormEvent,
    form::UploadSlot,
    io::{read_upload, save_output, save_prompt},
    load_catalog,
    prompts::Language,
    session::{self, Session},
};

#[derive(Parser)]
#[command(name = "promptbook", version, about = "Prompt Book: AI ad image generator")]
struct Cli {
    /// YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the HTTP API for the browser form
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// List categories and their templates
    Templates {
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value = "en")]
        lang: Language,
    },
    /// Print the composed prompt
    Prompt {
        #[command(flatten)]
        fields: FieldArgs,
        /// Also write prompt.txt into this directory
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Generate an ad image from a product photo
    Generate {
        #[command(flatten)]
        fields: FieldArgs,
        /// Product photo
        #[arg(long)]
        image: PathBuf,
        /// Brand logo (png, jpeg, webp or svg)
        #[arg(long)]
        logo: Option<PathBuf>,
        /// gemini | mock
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct FieldArgs {
    #[arg(long)]
    category: Option<String>,
    #[arg(long, default_value = "en")]
    lang: Language,
    /// Template id within the category
    #[arg(long)]
    template: Option<u32>,
    #[arg(long)]
    ratio: Option<String>,
    #[arg(long)]
    product_name: Option<String>,
    #[arg(long)]
    brand_name: Option<String>,
    #[arg(long)]
    price: Option<String>,
    #[arg(long)]
    discount: Option<String>,
    /// Replace the composed prompt with this text
    #[arg(long)]
    prompt: Option<String>,
}

impl FieldArgs {
    /// Form events in the order a user would make them.
    fn into_events(self) -> Vec<FormEvent> {
        let mut evs = Vec::new();
        if let Some(category) = self.category { evs.push(FormEvent::SelectCategory { category }); }
        evs.push(FormEvent::SelectLanguage { lang: self.lang });
        if let Some(id) = self.template { evs.push(FormEvent::SelectTemplate { id }); }
        if let Some(id) = self.ratio { evs.push(FormEvent::SelectRatio { id }); }
        if let Some(value) = self.product_name { evs.push(FormEvent::SetProductName { value }); }
        if let Some(value) = self.brand_name { evs.push(FormEvent::SetBrandName { value }); }
        if let Some(value) = self.price { evs.push(FormEvent::SetPrice { value }); }
        if let Some(value) = self.discount { evs.push(FormEvent::SetDiscount { value }); }
        if let Some(text) = self.prompt { evs.push(FormEvent::EditPrompt { text }); }
        evs
    }
}

fn fill_session(session: &mut Session, fields: FieldArgs) -> Result<()> {
    for ev in fields.into_events() {
        session.apply(ev)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut cfg = AppCfg::load(cli.config.as_deref()).await?;
    let catalog = load_catalog(&cfg).await?;

    match cli.cmd {
        Cmd::Serve { bind } => {
            if let Some(bind) = bind { cfg.server.bind = bind; }
            let generator = build_generator(&cfg)?;
            api::serve(&cfg, catalog, generator).await
        }
        Cmd::Templates { category, lang } => {
            for cat in catalog.categories.iter().filter(|c| category.as_deref().map_or(true, |n| n == c.name)) {
                println!("{}", cat.name);
                for t in &cat.templates {
                    println!("  [{}] {}", t.id, t.body(lang));
                }
            }
            let ratios: Vec<&str> = catalog.ratios.iter().map(|r| r.label.as_str()).collect();
            println!("Ratios: {}", ratios.join(", "));
            Ok(())
        }
        Cmd::Prompt { fields, out } => {
            let mut session = Session::new(catalog);
            fill_session(&mut session, fields)?;
            let prompt = session.form().editable_prompt();
            println!("{prompt}");
            if let Some(dir) = out {
                let path = save_prompt(&dir, prompt).await?;
                tracing::info!(path = %path.display(), "prompt written");
            }
            Ok(())
        }
        Cmd::Generate { fields, image, logo, provider, out_dir } => {
            if let Some(kind) = provider { cfg.provider.kind = kind; }
            let out_dir = out_dir.unwrap_or_else(|| cfg.out_dir.clone());
            let generator = build_generator(&cfg)?;

            let mut session = Session::new(catalog);
            fill_session(&mut session, fields)?;
            session.upload_product(read_upload(&image, UploadSlot::Product).await?)?;
            if let Some(logo) = logo {
                session.upload_logo(read_upload(&logo, UploadSlot::Logo).await?)?;
            }
            let shared = Mutex::new(session);

            let spinner = ProgressBar::new_spinner();
            spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
            spinner.set_message("Generating...");
            spinner.enable_steady_tick(Duration::from_millis(100));
            let result = session::submit(&shared, generator.as_ref()).await;
            spinner.finish_and_clear();
            result?;

            let generated = shared.lock().generated().cloned().context("generation finished without an image")?;
            let path = save_output(&out_dir, &generated, generator.name(), generator.model()).await?;
            println!("Ad image generated successfully! Saved to {}", path.display());
            Ok(())
        }
    }
}
