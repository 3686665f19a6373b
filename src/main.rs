use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use dialoguer::{theme::ColorfulTheme, Input, Select};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use oi_copilot_core::background::MenuEffect;
use oi_copilot_core::bridge::StreamUpdate;
use oi_copilot_core::hub::Hub;
use oi_copilot_core::hub::PageInbox;
use oi_copilot_core::page::{self, PageSession};
use oi_copilot_core::relay::DeliveryOutcome;
use oi_copilot_core::rewrite::{ERROR_CLASS, REWRITTEN_CLASS};
use oi_copilot_core::{
    glossary, menus, AskOutcome, Background, Config, ContextId, Credentials, Document, MenuItem,
    MenuSettings, Request, Response, SiliconFlowClient, Stores,
};

const DEFAULT_PAGE_URL: &str = "https://oi-wiki.org/";

#[derive(Parser)]
#[command(name = "oi-copilot")]
#[command(about = "OI-Wiki companion: glossary annotations and an AI ask/rewrite assistant")]
struct Cli {
    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed the predefined annotations and refresh menus
    Init,
    /// Manage glossary annotations
    Annotations {
        #[command(subcommand)]
        action: AnnotationAction,
    },
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show or toggle context menu entries
    Menus {
        #[command(subcommand)]
        action: MenuAction,
    },
    /// Annotate a text document and print the resulting HTML
    Annotate {
        /// Plain text file; blank lines separate paragraphs
        file: PathBuf,
        /// Page URL the document stands for
        #[arg(long, default_value = DEFAULT_PAGE_URL)]
        url: String,
    },
    /// Ask the AI a question, streaming the answer
    Ask {
        question: String,
        /// Page text used as context
        #[arg(short, long)]
        page: Option<PathBuf>,
        /// Quote this passage from the page
        #[arg(short, long)]
        select: Option<String>,
    },
    /// Rewrite a passage for beginners
    Rewrite {
        /// The passage to rewrite (must occur in --page when given)
        text: String,
        #[arg(short, long)]
        page: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_PAGE_URL)]
        url: String,
    },
    /// Print the wiki search URL for a term
    Search { term: String },
}

#[derive(Subcommand)]
enum AnnotationAction {
    List,
    /// Add or replace an entry (an empty explanation masks the term)
    Add {
        keyword: String,
        explanation: Option<String>,
    },
    Remove { keyword: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set {
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Completion endpoint
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[derive(Subcommand)]
enum MenuAction {
    Show,
    Enable { entry: MenuItem },
    Disable { entry: MenuItem },
}

/// Background process plus the hub connecting it to pages.
struct Runtime {
    config: Config,
    stores: Stores,
    hub: Hub,
    background: Background,
}

impl Runtime {
    async fn start(config: Config) -> Result<Self> {
        let data_dir = config.data_dir()?;
        tracing::debug!(data_dir = %data_dir.display(), "opening stores");
        let stores = Stores::open(&data_dir);
        let (hub, inbox) = Hub::new();
        let background = Background::new(
            stores.clone(),
            Arc::new(SiliconFlowClient::new(&config.endpoint)),
            Arc::new(hub.messenger()),
        )
        .with_default_model(&config.default_model);
        tokio::spawn(background.clone().run(inbox));
        background.refresh_menus().await?;
        Ok(Self {
            config,
            stores,
            hub,
            background,
        })
    }

    async fn open_page(&self, url: &str, doc: Document) -> Result<(ContextId, PageSession, PageInbox)> {
        let (ctx, session, inbox) = page::open(&self.hub, url, doc, &self.stores).await?;
        let session = session
            .with_context_chars(self.config.page_context_chars)
            .with_retention_days(self.config.rewrite_retention_days);
        Ok((ctx, session, inbox))
    }

    /// Clicks a menu entry on a running page and hands the page back once
    /// the action has been delivered.
    async fn click(
        &self,
        item: MenuItem,
        url: &str,
        doc: Document,
        selection: Option<&str>,
    ) -> Result<(PageSession, MenuEffect)> {
        let selection = selection.map(str::trim);
        let (ctx, mut session, mut inbox) = self.open_page(url, doc).await?;
        if let Some(text) = selection {
            if !session.select_text(text) {
                return Err(anyhow!("\"{}\" does not occur on the page", text));
            }
        }

        let task = tokio::spawn(async move {
            session.run(&mut inbox).await;
            session
        });
        let effect = self.background.on_menu_click(item, Some(ctx), selection).await;
        self.hub.close_page(ctx).await;
        let session = task.await?;
        Ok((session, effect?))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "oi_copilot=info,oi_copilot_core=info,warn".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let runtime = Runtime::start(config).await?;

    match cli.command {
        Commands::Init => init(&runtime).await?,
        Commands::Annotations { action } => annotations(&runtime, action).await?,
        Commands::Config { action } => configure(&runtime, action, cli.config.as_deref()).await?,
        Commands::Menus { action } => menu_settings(&runtime, action).await?,
        Commands::Annotate { file, url } => annotate_file(&runtime, &file, &url).await?,
        Commands::Ask {
            question,
            page,
            select,
        } => ask(&runtime, &question, page.as_deref(), select.as_deref()).await?,
        Commands::Rewrite { text, page, url } => rewrite(&runtime, &text, page.as_deref(), &url).await?,
        Commands::Search { term } => {
            match runtime
                .background
                .on_menu_click(MenuItem::Search, None, Some(&term))
                .await?
            {
                MenuEffect::OpenUrl(url) => println!("{}", url.underline()),
                _ => println!("{}", "Search entry is disabled or the term is empty".yellow()),
            }
        }
    }

    Ok(())
}

async fn init(runtime: &Runtime) -> Result<()> {
    let merged = runtime.background.on_installed().await?;
    println!("{} {} annotations", "✅ Seeded".green().bold(), merged.len().to_string().bold());

    let credentials = Credentials::load(runtime.stores.synced.as_ref()).await?;
    if credentials.for_stream().is_none() {
        println!(
            "Set your API key and model with: {}",
            "oi-copilot config set --api-key <key> --model <model>".bold()
        );
    }
    Ok(())
}

async fn annotations(runtime: &Runtime, action: AnnotationAction) -> Result<()> {
    let synced = runtime.stores.synced.as_ref();
    match action {
        AnnotationAction::List => {
            let annotations = glossary::load(synced).await?;
            if annotations.is_empty() {
                println!("{}", "No annotations yet. Run `oi-copilot init` to add the defaults.".yellow());
                return Ok(());
            }
            println!("\n{}", "📚 Annotations".bold().blue());
            println!("{}", "=".repeat(40).dimmed());
            for (keyword, explanation) in &annotations {
                if explanation.is_empty() {
                    println!("  • {} {}", keyword.bold().yellow(), "(masked)".dimmed());
                } else {
                    println!("  • {}  {}", keyword.bold().yellow(), explanation);
                }
            }
        }
        AnnotationAction::Add {
            keyword,
            explanation,
        } => {
            let explanation = match explanation {
                Some(explanation) => explanation,
                None => Input::<String>::with_theme(&ColorfulTheme::default())
                    .with_prompt(format!("为 \"{}\" 输入注释内容 (留空可用于屏蔽)", keyword))
                    .allow_empty(true)
                    .interact_text()?,
            };
            glossary::upsert(synced, &keyword, &explanation).await?;
            notify_pages(runtime).await;
            println!("{} {}", "✅ Saved".green().bold(), keyword.bold());
        }
        AnnotationAction::Remove { keyword } => {
            if glossary::remove(synced, &keyword).await? {
                notify_pages(runtime).await;
                println!("{} {}", "🗑  Removed".green().bold(), keyword.bold());
            } else {
                println!("{} {}", "No annotation named".yellow(), keyword.bold());
            }
        }
    }
    Ok(())
}

/// Tells every open page to rebuild with the new annotations.
async fn notify_pages(runtime: &Runtime) {
    for (ctx, url) in runtime.hub.pages().await {
        if runtime.background.notify_annotation_added(ctx).await.is_some() {
            tracing::debug!(%ctx, %url, "page notified");
        }
    }
}

async fn configure(runtime: &Runtime, action: ConfigAction, config_path: Option<&Path>) -> Result<()> {
    let synced = runtime.stores.synced.as_ref();
    match action {
        ConfigAction::Show => {
            let credentials = Credentials::load(synced).await?;
            let key = match credentials.api_key.as_deref() {
                Some(key) if key.chars().count() > 8 => {
                    let chars: Vec<char> = key.chars().collect();
                    let head: String = chars[..4].iter().collect();
                    let tail: String = chars[chars.len() - 4..].iter().collect();
                    format!("{}…{}", head, tail)
                }
                Some(_) => "set".to_string(),
                None => "not set".red().to_string(),
            };
            println!("\n{}", "⚙️  Settings".bold().blue());
            println!("{}", "=".repeat(30).dimmed());
            println!("  API key:   {}", key);
            println!(
                "  Model:     {}",
                credentials.model_id.as_deref().unwrap_or("not set")
            );
            println!("  Endpoint:  {}", runtime.config.endpoint);
            println!("  Data dir:  {}", runtime.config.data_dir()?.display());
        }
        ConfigAction::Set {
            api_key,
            model,
            endpoint,
        } => {
            if let Some(endpoint) = endpoint {
                let mut config = runtime.config.clone();
                config.endpoint = endpoint;
                match config_path {
                    Some(path) => config.save_to(path)?,
                    None => config.save()?,
                }
                println!("{}", "✅ Endpoint saved".green().bold());
            }

            let current = Credentials::load(synced).await?;
            let api_key = match api_key.or(current.api_key) {
                Some(key) => key,
                None => Input::<String>::with_theme(&ColorfulTheme::default())
                    .with_prompt("API key")
                    .interact_text()?,
            };
            let model = match model.or(current.model_id) {
                Some(model) => model,
                None => {
                    let models = SiliconFlowClient::list_models();
                    let choice = Select::with_theme(&ColorfulTheme::default())
                        .with_prompt("Select a model")
                        .items(&models)
                        .default(0)
                        .interact()?;
                    models[choice].clone()
                }
            };
            Credentials::save(synced, api_key.trim(), model.trim())
                .await
                .context("Settings not saved")?;
            println!("{}", "✅ Settings saved".green().bold());
        }
    }
    Ok(())
}

async fn menu_settings(runtime: &Runtime, action: MenuAction) -> Result<()> {
    let synced = runtime.stores.synced.as_ref();
    let settings = match action {
        MenuAction::Show => MenuSettings::load(synced).await?,
        MenuAction::Enable { entry } => menus::set_enabled(synced, entry, true).await?,
        MenuAction::Disable { entry } => menus::set_enabled(synced, entry, false).await?,
    };

    let client = runtime.hub.client(None);
    match client.request(Request::UpdateMenus).await {
        Ok(Response::Ack) => {}
        Ok(other) => tracing::warn!(?other, "unexpected reply to menu update"),
        Err(e) => tracing::warn!(error = %e, "could not refresh menus"),
    }

    println!("\n{}", "📋 Context menu".bold().blue());
    println!("{}", "=".repeat(30).dimmed());
    for item in MenuItem::ALL {
        let state = if settings.is_enabled(item) {
            "on".green()
        } else {
            "off".red()
        };
        println!("  [{}] {}  {}", state, item.title(), item.id().dimmed());
    }
    Ok(())
}

fn read_page(path: Option<&Path>, fallback: &str) -> Result<Document> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Could not read {}", path.display()))?;
            Ok(Document::from_text(&text))
        }
        None => Ok(Document::from_text(fallback)),
    }
}

async fn annotate_file(runtime: &Runtime, file: &Path, url: &str) -> Result<()> {
    let doc = read_page(Some(file), "")?;
    let (ctx, session, _inbox) = runtime.open_page(url, doc).await?;
    runtime.hub.close_page(ctx).await;

    let doc = session.doc();
    println!("{}", doc.inner_html(doc.body()));
    Ok(())
}

async fn ask(runtime: &Runtime, question: &str, page_file: Option<&Path>, select: Option<&str>) -> Result<()> {
    let doc = read_page(page_file, "")?;
    let (mut session, effect) = runtime
        .click(MenuItem::AskAi, DEFAULT_PAGE_URL, doc, select)
        .await?;
    report_delivery(&effect);

    if session.ask_session().is_none() {
        return Err(anyhow!("The ask dialog did not open"));
    }

    println!("🤖 {}\n", question.bold().cyan());
    let mut printed = 0;
    let outcome = session
        .ask_question(question, |update| {
            if let StreamUpdate::Progress(text) | StreamUpdate::Done(text) = update {
                if let Some(fresh) = text.get(printed..) {
                    print!("{}", fresh);
                    let _ = std::io::stdout().flush();
                    printed = text.len();
                }
            }
        })
        .await;
    println!();

    match outcome {
        Some(AskOutcome::Failed(error)) => println!("{} {}", "出错了:".red().bold(), error),
        Some(AskOutcome::Ignored) => println!("{}", "Empty question, nothing sent".yellow()),
        _ => {}
    }
    Ok(())
}

async fn rewrite(runtime: &Runtime, text: &str, page_file: Option<&Path>, url: &str) -> Result<()> {
    let text = text.trim();
    if text.is_empty() {
        return Err(anyhow!("Nothing to rewrite"));
    }
    if text.contains("\n\n") {
        return Err(anyhow!("The passage must stay within one paragraph (no blank lines)"));
    }
    let doc = read_page(page_file, text)?;
    let (session, effect) = runtime.click(MenuItem::Rewrite, url, doc, Some(text)).await?;
    report_delivery(&effect);

    let doc = session.doc();
    if let Some(el) = doc.find_first(|el| el.has_class(REWRITTEN_CLASS)) {
        println!("{}", "✨ Rewritten:".bold().green());
        let content = doc.children(el).first().copied().unwrap_or(el);
        println!("{}", doc.text_content(content));
    } else if let Some(el) = doc.find_first(|el| el.has_class(ERROR_CLASS)) {
        println!("{}", doc.text_content(el).red());
    } else {
        println!("{}", "Nothing was rewritten".yellow());
    }
    Ok(())
}

fn report_delivery(effect: &MenuEffect) {
    match effect {
        MenuEffect::Queued(DeliveryOutcome::Deferred) => {
            println!("{}", "⚠️  Page unreachable; the action will run on next load".yellow())
        }
        MenuEffect::None => println!("{}", "⚠️  This menu entry is disabled".yellow()),
        _ => tracing::debug!(?effect, "menu action delivered"),
    }
}
