use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kobo_client::KoboClient;
use kobo_store::PgSubmissionStore;
use kobo_sync::{
    maybe_build_scheduler, open_store, BatchFetcher, BatchRequest, SubmissionSource, SyncConfig,
};
use kobo_web::{AppState, WebConfig};
use tracing::{info, warn, Level};

#[derive(Debug, Parser)]
#[command(name = "kobo-cli")]
#[command(about = "Sync KoboToolbox submissions and serve them")]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch submissions for a form and reconcile them into the store
    Fetch {
        /// Form/asset UID (defaults to KOBO_FORM_UID)
        form_uid: Option<String>,

        /// Fetch a single page of at most this many submissions
        #[arg(long)]
        limit: Option<usize>,

        /// Overwrite submissions that are already stored
        #[arg(long)]
        force_update: bool,
    },
    /// List forms visible to the configured token
    ListForms,
    /// Apply database migrations
    Migrate,
    /// Run the web server, plus the fetch scheduler when enabled
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let config = SyncConfig::from_env();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Fetch {
            form_uid,
            limit,
            force_update,
        } => fetch(&config, form_uid, limit, force_update).await?,
        Commands::ListForms => list_forms().await?,
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgSubmissionStore::connect(url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => serve(&config).await?,
    }

    Ok(())
}

async fn fetch(
    config: &SyncConfig,
    form_uid: Option<String>,
    limit: Option<usize>,
    force_update: bool,
) -> Result<()> {
    let Some(form_uid) = form_uid.or_else(|| config.form_uid.clone()) else {
        bail!("Form UID is required. Provide it as argument or set KOBO_FORM_UID env variable.");
    };

    let client = KoboClient::from_env().context("configuring KoboToolbox client")?;
    let store = open_store(config).await?;
    let fetcher = BatchFetcher::new(Arc::new(client), store);

    let summary = fetcher
        .run(&BatchRequest::from_cli(form_uid, limit, force_update))
        .await?;

    println!("=== Sync Summary ===");
    println!(
        "Form: {} ({})",
        summary.form_uid,
        summary.form_name.as_deref().unwrap_or("Unknown")
    );
    if let Some(total) = summary.reported_total {
        println!("Available: {total}");
    }
    println!("Fetched: {}", summary.fetched);
    println!("Created: {} new submissions", summary.created);
    if force_update {
        println!("Updated: {}", summary.updated);
    }
    println!("Skipped: {} ({} without uuid)", summary.skipped, summary.missing_uuid);
    println!("Total in database: {}", summary.stored_total);
    Ok(())
}

async fn list_forms() -> Result<()> {
    let client = KoboClient::from_env().context("configuring KoboToolbox client")?;
    let forms = match client.list_forms().await {
        Ok(forms) => forms,
        Err(err) => {
            eprintln!("Error connecting to KoboToolbox API: {err}");
            eprintln!(
                "Check KOBO_TOKEN, and that KOBO_BASE_URL ({}) matches your server:",
                client.base_url()
            );
            eprintln!("  - https://kf.kobotoolbox.org");
            eprintln!("  - https://kobo.humanitarianresponse.info");
            return Err(err.into());
        }
    };

    if forms.is_empty() {
        println!("No forms found. Check your KOBO_TOKEN and KOBO_BASE_URL.");
        return Ok(());
    }

    println!("Found {} form(s):", forms.len());
    for (idx, form) in forms.iter().enumerate() {
        println!();
        println!("{}. {}", idx + 1, form.name.as_deref().unwrap_or("Untitled"));
        println!("   UID: {}", form.uid);
        println!("   Type: {}", form.asset_type.as_deref().unwrap_or("N/A"));
        println!("   Deployed: {}", if form.has_deployment { "Yes" } else { "No" });
        println!("   URL: {}", form.url.as_deref().unwrap_or("N/A"));
    }
    println!();
    println!("Use the UID value as KOBO_FORM_UID");
    Ok(())
}

async fn serve(config: &SyncConfig) -> Result<()> {
    let store = open_store(config).await?;
    let source: Result<Arc<dyn SubmissionSource>, String> = match KoboClient::from_env() {
        Ok(client) => Ok(Arc::new(client) as Arc<dyn SubmissionSource>),
        Err(err) => {
            warn!(error = %err, "remote sync disabled");
            Err(err.to_string())
        }
    };

    let mut scheduler = match &source {
        Ok(source) => {
            let fetcher = Arc::new(BatchFetcher::new(source.clone(), store.clone()));
            maybe_build_scheduler(config, fetcher).await?
        }
        Err(_) if config.scheduler_enabled => {
            bail!("KOBO_SCHEDULER_ENABLED requires KOBO_TOKEN");
        }
        Err(_) => None,
    };
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduled fetch enabled");
    }

    let state = AppState::new(store, source, WebConfig::from_env());
    tokio::select! {
        res = kobo_web::serve(state) => res?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}
