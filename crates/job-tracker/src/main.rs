use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use job_tracker::classifier::LlmClassifier;
use job_tracker::config::{Config, Settings};
use job_tracker::fetchers::{GmailClient, OutlookClient};
use job_tracker::pipeline::{run_sync, ProviderFetchers, SyncOptions, SyncReport};
use job_tracker::recorder::Recorder;
use job_tracker::scheduler::{DailyScheduler, ScheduleZone};
use job_tracker::state::SyncState;
use job_tracker::store::{ApplicationStore, JsonLinesStore, MemoryStore, SheetsStore};
use job_types::{EmailProvider, JobApplicationRecord};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser)]
#[command(name = "job-tracker")]
#[command(about = "Track job applications from your inboxes in a spreadsheet")]
#[command(
    long_about = "Polls Gmail, Outlook and IMAP accounts, classifies each email with an LLM \
    and appends job application updates to a Google Sheet (or a JSON lines file).\n\n\
    Every email is recorded at most once, so runs can be repeated safely."
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        default_value = "config/config.toml",
        env = "JOB_TRACKER_CONFIG"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync all enabled accounts once
    Run {
        /// Classify and report without writing to the sheet or the sync state
        #[arg(long)]
        dry_run: bool,

        /// Only sync the account with this name
        #[arg(short, long, value_name = "NAME")]
        account: Option<String>,
    },

    /// Keep running and sync at the times in `settings.sync_schedule`
    Daemon,

    /// Sign in to a Gmail or Outlook account and store its token
    ///
    /// Gmail opens the browser consent page; Outlook prints a device code
    /// to enter at microsoft.com/devicelogin.
    Auth {
        /// Account name as written in the config
        account: String,
    },

    /// List configured accounts with their credentials and last sync
    Accounts,

    /// Validate the configuration and print a summary
    CheckConfig,

    /// Print an example configuration file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Commands::ExampleConfig = cli.command {
        print!("{}", toml::to_string_pretty(&Config::example())?);
        return Ok(());
    }

    let config = Config::load(&cli.config)?;
    init_tracing(&config.settings)?;

    // Both the Gmail hub and the Sheets auth client go through rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    match cli.command {
        Commands::Run { dry_run, account } => {
            let options = SyncOptions { account, dry_run };
            let report = if dry_run {
                let recorder = Recorder::new(MemoryStore::new());
                let report = sync_once(&config, &options, &recorder).await?;
                print_would_append(&recorder.store().rows());
                report
            } else {
                let recorder = Recorder::new(open_store(&config).await?);
                sync_once(&config, &options, &recorder).await?
            };

            print_report(&report);
            if !report.is_success() {
                anyhow::bail!(
                    "{} account(s) failed to sync",
                    report.failed_accounts().count()
                );
            }
        }
        Commands::Daemon => run_daemon(&config).await?,
        Commands::Auth { account } => authorize(&config, &account).await?,
        Commands::Accounts => list_accounts(&config)?,
        Commands::CheckConfig => print_config_summary(&cli.config, &config)?,
        // Printed before the config is loaded
        Commands::ExampleConfig => {}
    }

    Ok(())
}

/// Console output filtered by `RUST_LOG` or `log_level`, plus an optional
/// detailed log file with its own level.
fn init_tracing(settings: &Settings) -> Result<()> {
    let console_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("job_tracker={}", settings.log_level).into());
    let console_layer = tracing_subscriber::fmt::layer().with_filter(console_filter);

    let file_layer = match settings.log_file_path() {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;

            let filter = tracing_subscriber::EnvFilter::try_new(format!(
                "job_tracker={}",
                settings.log_file_level
            ))
            .with_context(|| format!("Invalid log_file_level '{}'", settings.log_file_level))?;

            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file))
                    .with_filter(filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = settings.log_file_path() {
        tracing::debug!("Logging to {}", path.display());
    }
    Ok(())
}

/// Sheets when configured, otherwise the local JSON lines file
async fn open_store(config: &Config) -> Result<Box<dyn ApplicationStore>> {
    match config.sheets() {
        Some(sheets) => Ok(Box::new(SheetsStore::connect(sheets).await?)),
        None => Ok(Box::new(JsonLinesStore::new(&config.output.jsonl_path))),
    }
}

fn classifier(config: &Config) -> Result<LlmClassifier> {
    let llm = config
        .llm
        .clone()
        .context("No [llm] section in config")?;
    let classifier = LlmClassifier::new(llm)?;
    tracing::info!("Classifying with {}", classifier.describe());
    Ok(classifier)
}

async fn sync_once<S: ApplicationStore>(
    config: &Config,
    options: &SyncOptions,
    recorder: &Recorder<S>,
) -> Result<SyncReport> {
    let classifier = classifier(config)?;
    let mut state = SyncState::load(&config.settings.state_file)?;

    run_sync(
        config,
        options,
        &mut state,
        &ProviderFetchers,
        &classifier,
        recorder,
    )
    .await
}

async fn run_daemon(config: &Config) -> Result<()> {
    let slots = config.schedule()?;
    let zone = ScheduleZone::from_setting(config.settings.timezone.as_deref())?;
    let scheduler = DailyScheduler::new(slots, zone);

    let recorder = Recorder::new(open_store(config).await?);
    let options = SyncOptions::default();
    let recorder = &recorder;
    let options = &options;

    tracing::info!("Job tracker daemon running. Press Ctrl+C to stop.");

    tokio::select! {
        result = scheduler.run(move || async move {
            let report = sync_once(config, options, recorder).await?;
            tracing::info!("Sync finished: {} new row(s)", report.total_appended());
            if report.is_success() {
                Ok(())
            } else {
                Err(anyhow::anyhow!(
                    "{} account(s) failed to sync",
                    report.failed_accounts().count()
                ))
            }
        }) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping...");
        }
    }

    Ok(())
}

async fn authorize(config: &Config, name: &str) -> Result<()> {
    let account = config
        .account(name)
        .with_context(|| format!("No account named '{}' in config", name))?;

    match account.provider {
        EmailProvider::Gmail => GmailClient::authorize(account).await?,
        EmailProvider::Outlook => OutlookClient::from_account(account)?.authorize().await?,
        EmailProvider::Imap => {
            println!(
                "'{}' is an IMAP account; it signs in with an app password, nothing to authorize.",
                account.name
            );
            return Ok(());
        }
    }

    println!("✓ Authorized {} ({})", account.name, account.email);
    Ok(())
}

fn list_accounts(config: &Config) -> Result<()> {
    let state = SyncState::load(&config.settings.state_file)?;

    if config.accounts.is_empty() {
        println!("No accounts configured.");
        return Ok(());
    }

    for account in &config.accounts {
        let enabled = if account.enabled { "✓" } else { "○" };
        let credentials = match account.provider {
            EmailProvider::Gmail | EmailProvider::Outlook => {
                if account.token_exists() {
                    "token saved"
                } else {
                    "not authorized"
                }
            }
            EmailProvider::Imap => match account.imap_password() {
                Ok(_) => "app password",
                Err(_) => "password missing",
            },
        };

        println!(
            "{} {} <{}> [{}] {}",
            enabled,
            account.name,
            account.email,
            account.provider.as_str(),
            credentials
        );

        match state.get(&account.name) {
            Some(s) => {
                let last = s
                    .last_synced
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!("    last sync: {} ({})", last, s.status.as_str());
                if let Some(err) = &s.last_error {
                    println!("    last error: {}", err);
                }
            }
            None => println!("    last sync: never"),
        }
    }

    Ok(())
}

fn print_config_summary(path: &std::path::Path, config: &Config) -> Result<()> {
    let slots = config.schedule()?;
    let zone = config.settings.timezone.as_deref().unwrap_or("local time");

    println!("✓ {} is valid", path.display());
    println!(
        "  Accounts: {} ({} enabled)",
        config.accounts.len(),
        config.enabled_accounts().count()
    );
    println!(
        "  Window: {}h ({} days on first sync)",
        config.settings.fetch_hours, config.settings.backfill_days
    );
    println!(
        "  Schedule: {} ({})",
        slots
            .iter()
            .map(|t| t.format("%H:%M").to_string())
            .collect::<Vec<_>>()
            .join(", "),
        zone
    );
    match config.sheets() {
        Some(sheets) => println!(
            "  Store: Google Sheet {} / {}",
            sheets.spreadsheet_id, sheets.sheet_name
        ),
        None => println!("  Store: {}", config.output.jsonl_path.display()),
    }
    match &config.llm {
        Some(llm) => {
            let key = if llm.resolved_api_key().is_some() {
                "key found"
            } else {
                "no API key"
            };
            println!(
                "  LLM: {} / {} ({})",
                llm.provider.as_str(),
                llm.model(),
                key
            );
        }
        None => println!("  LLM: not configured"),
    }

    Ok(())
}

fn print_report(report: &SyncReport) {
    println!();
    for account in &report.accounts {
        match &account.error {
            None => println!(
                "✓ {}: {} fetched, {} job related, {} new, {} unclassified",
                account.account,
                account.fetched,
                account.job_related,
                account.appended,
                account.errors
            ),
            Some(err) => println!("✗ {}: {}", account.account, err),
        }
        if let Some(reason) = account.incomplete_reason() {
            println!("  ! {} (will be retried next run)", reason);
        }
    }
    println!("Total new rows: {}", report.total_appended());
}

fn print_would_append(rows: &[JobApplicationRecord]) {
    if rows.is_empty() {
        println!("Dry run: nothing to append.");
        return;
    }

    println!("Dry run: would append {} row(s):", rows.len());
    for row in rows {
        println!("  {}", row.to_row().join(" | "));
    }
}
