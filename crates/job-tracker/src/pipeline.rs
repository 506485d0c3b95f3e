//! One sync run: fetch, classify and record for every enabled account.

use crate::classifier::Classifier;
use crate::config::{AccountConfig, Config};
use crate::fetchers::{self, EmailFetcher};
use crate::recorder::Recorder;
use crate::state::SyncState;
use crate::store::ApplicationStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use job_types::JobApplicationRecord;

/// Hands out a fetcher per account
#[async_trait]
pub trait FetcherSource: Send + Sync {
    async fn fetcher_for(&self, account: &AccountConfig) -> Result<Box<dyn EmailFetcher>>;
}

/// Connects to the real provider configured for each account
pub struct ProviderFetchers;

#[async_trait]
impl FetcherSource for ProviderFetchers {
    async fn fetcher_for(&self, account: &AccountConfig) -> Result<Box<dyn EmailFetcher>> {
        fetchers::connect(account).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Only sync the account with this name
    pub account: Option<String>,
    /// Leave the sync state untouched
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountReport {
    pub account: String,
    pub fetched: usize,
    pub classified: usize,
    pub job_related: usize,
    pub appended: usize,
    /// Emails that could not be classified
    pub errors: usize,
    /// The fetch returned `max_emails_per_account` messages, so older mail in
    /// the window may not have been seen
    pub hit_limit: bool,
    /// Set when the account's sync failed as a whole
    pub error: Option<String>,
}

impl AccountReport {
    fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Why a successful run still left mail behind, if it did
    pub fn incomplete_reason(&self) -> Option<String> {
        let mut reasons = Vec::new();
        if self.errors > 0 {
            reasons.push(format!("{} email(s) could not be classified", self.errors));
        }
        if self.hit_limit {
            reasons.push(format!(
                "fetch stopped at {} emails; raise max_emails_per_account to see older mail",
                self.fetched
            ));
        }
        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("; "))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub accounts: Vec<AccountReport>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.accounts.iter().all(AccountReport::succeeded)
    }

    pub fn total_appended(&self) -> usize {
        self.accounts.iter().map(|a| a.appended).sum()
    }

    pub fn failed_accounts(&self) -> impl Iterator<Item = &AccountReport> {
        self.accounts.iter().filter(|a| !a.succeeded())
    }
}

/// Run one sync over the configured accounts.
///
/// A failing account is recorded in its report and in the sync state; the
/// remaining accounts still run. Only a store that cannot be prepared aborts
/// the whole run.
pub async fn run_sync<S, C, F>(
    config: &Config,
    options: &SyncOptions,
    state: &mut SyncState,
    fetchers: &F,
    classifier: &C,
    recorder: &Recorder<S>,
) -> Result<SyncReport>
where
    S: ApplicationStore,
    C: Classifier + ?Sized,
    F: FetcherSource + ?Sized,
{
    let accounts: Vec<&AccountConfig> = match &options.account {
        Some(name) => {
            let account = config
                .account(name)
                .with_context(|| format!("No account named '{}' in config", name))?;
            vec![account]
        }
        None => config.enabled_accounts().collect(),
    };

    if accounts.is_empty() {
        tracing::warn!("No enabled accounts to sync");
        return Ok(SyncReport::default());
    }

    recorder
        .store()
        .prepare()
        .await
        .context("Failed to prepare store")?;

    tracing::info!(
        "Syncing {} account(s) into {}",
        accounts.len(),
        recorder.store().describe()
    );

    let mut report = SyncReport::default();
    for account in accounts {
        let started = Utc::now();
        let mut account_report = AccountReport::new(&account.name);

        let result = sync_account(
            config,
            state,
            account,
            fetchers,
            classifier,
            recorder,
            &mut account_report,
        )
        .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    "{}: fetched {}, job related {}, appended {}",
                    account.name,
                    account_report.fetched,
                    account_report.job_related,
                    account_report.appended
                );
                if !options.dry_run {
                    match account_report.incomplete_reason() {
                        None => state.mark_success(&account.name, started),
                        Some(reason) => {
                            tracing::warn!(
                                "{}: {}; the same window is fetched again next run",
                                account.name,
                                reason
                            );
                            state.mark_incomplete(&account.name, &reason);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    "Failed to sync account {} ({}): {:#}",
                    account.name,
                    account.email,
                    e
                );
                account_report.error = Some(format!("{:#}", e));
                if !options.dry_run {
                    state.mark_failure(&account.name, &format!("{:#}", e));
                }
            }
        }

        if !options.dry_run {
            state.save()?;
        }
        report.accounts.push(account_report);
    }

    Ok(report)
}

async fn sync_account<S, C, F>(
    config: &Config,
    state: &SyncState,
    account: &AccountConfig,
    fetchers: &F,
    classifier: &C,
    recorder: &Recorder<S>,
    report: &mut AccountReport,
) -> Result<()>
where
    S: ApplicationStore,
    C: Classifier + ?Sized,
    F: FetcherSource + ?Sized,
{
    let settings = &config.settings;
    let since = state.window_start(
        &account.name,
        Utc::now(),
        settings.backfill_days,
        settings.fetch_hours,
    );
    if !state.is_backfill_complete(&account.name) {
        tracing::info!(
            "{}: first sync, backfilling {} days",
            account.name,
            settings.backfill_days
        );
    }

    tracing::info!(
        "Polling {} ({}) since {}...",
        account.name,
        account.email,
        since.format("%Y-%m-%d %H:%M")
    );
    let fetcher = fetchers.fetcher_for(account).await?;
    let mut emails = fetcher
        .fetch_since(since, settings.max_emails_per_account)
        .await?;
    report.fetched = emails.len();
    report.hit_limit = emails.len() >= settings.max_emails_per_account as usize;

    // Oldest first so rows land in the sheet chronologically
    emails.sort_by_key(|e| e.received_at);

    let mut records = Vec::new();
    for email in &emails {
        let classification = match classifier.classify(email).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(
                    "  Could not classify {} ({}): {:#}",
                    email.id,
                    email.subject,
                    e
                );
                report.errors += 1;
                continue;
            }
        };
        report.classified += 1;

        if !classification.category.is_job_related() {
            continue;
        }

        tracing::debug!(
            "  {} -> {} ({} / {})",
            email.subject,
            classification.category,
            classification.company,
            classification.position
        );
        report.job_related += 1;
        records.push(JobApplicationRecord::from_classification(email, classification));
    }

    report.appended = recorder.record(&records).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::state::SyncStatus;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Duration};
    use job_types::{ApplicationCategory, Classification, EmailMessage, EmailProvider};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn account(name: &str) -> AccountConfig {
        AccountConfig {
            name: name.to_string(),
            provider: EmailProvider::Imap,
            email: format!("{}@example.com", name.to_lowercase()),
            enabled: true,
            token_file: None,
            credentials_file: None,
            imap_server: Some("imap.example.com".to_string()),
            imap_port: 993,
            app_password: Some("secret".to_string()),
            app_password_env: None,
            mailbox: "INBOX".to_string(),
            client_id: None,
            tenant_id: "common".to_string(),
        }
    }

    fn config(accounts: Vec<AccountConfig>) -> Config {
        Config {
            settings: Settings::default(),
            accounts,
            llm: None,
            google_sheets: None,
            output: Default::default(),
        }
    }

    fn email(id: &str, subject: &str, age_hours: i64) -> EmailMessage {
        EmailMessage {
            id: id.to_string(),
            account_name: String::new(),
            subject: subject.to_string(),
            from: "hr@acme.com".to_string(),
            snippet: String::new(),
            body: None,
            received_at: Utc::now() - Duration::hours(age_hours),
        }
    }

    /// Returns a fixed mailbox and remembers the windows it was asked for
    struct StubFetcher {
        emails: Vec<EmailMessage>,
        windows: std::sync::Arc<Mutex<Vec<DateTime<Utc>>>>,
    }

    #[async_trait]
    impl EmailFetcher for StubFetcher {
        async fn fetch_since(&self, since: DateTime<Utc>, max: u32) -> Result<Vec<EmailMessage>> {
            self.windows.lock().unwrap().push(since);
            let mut emails: Vec<_> = self
                .emails
                .iter()
                .filter(|e| e.received_at >= since)
                .cloned()
                .collect();
            emails.sort_by_key(|e| std::cmp::Reverse(e.received_at));
            emails.truncate(max as usize);
            Ok(emails)
        }
    }

    #[derive(Default)]
    struct StubFetchers {
        mailboxes: HashMap<String, Vec<EmailMessage>>,
        windows: std::sync::Arc<Mutex<Vec<DateTime<Utc>>>>,
    }

    impl StubFetchers {
        fn with(mut self, account: &str, emails: Vec<EmailMessage>) -> Self {
            self.mailboxes.insert(account.to_string(), emails);
            self
        }
    }

    #[async_trait]
    impl FetcherSource for StubFetchers {
        async fn fetcher_for(&self, account: &AccountConfig) -> Result<Box<dyn EmailFetcher>> {
            let emails = self
                .mailboxes
                .get(&account.name)
                .cloned()
                .with_context(|| format!("Login failed for {}", account.email))?;
            Ok(Box::new(StubFetcher {
                emails,
                windows: self.windows.clone(),
            }))
        }
    }

    async fn sync(
        config: &Config,
        options: &SyncOptions,
        state: &mut SyncState,
        fetchers: &StubFetchers,
        recorder: &Recorder<MemoryStore>,
    ) -> Result<SyncReport> {
        run_sync(config, options, state, fetchers, &SubjectClassifier, recorder).await
    }

    /// Classifies by subject keyword
    struct SubjectClassifier;

    #[async_trait]
    impl Classifier for SubjectClassifier {
        async fn classify(&self, email: &EmailMessage) -> Result<Classification> {
            let category = if email.subject.contains("garbled") {
                anyhow::bail!("unparseable answer");
            } else if email.subject.contains("Interview") {
                ApplicationCategory::Interview
            } else if email.subject.contains("Application") {
                ApplicationCategory::NewApplication
            } else {
                ApplicationCategory::NotJobRelated
            };

            Ok(Classification {
                category,
                company: "Acme".to_string(),
                position: "Engineer".to_string(),
                detail: email.subject.clone(),
                interview_at: None,
            })
        }
    }

    #[tokio::test]
    async fn records_job_related_mail_and_rerun_appends_nothing() {
        let config = config(vec![account("Gmail")]);
        let fetchers = StubFetchers::default().with(
            "Gmail",
            vec![
                email("m1", "Application received", 3),
                email("m2", "Weekly newsletter", 2),
                email("m3", "Interview invitation", 1),
            ],
        );
        let recorder = Recorder::new(MemoryStore::new());
        let mut state = SyncState::default();

        let report = sync(&config, &SyncOptions::default(), &mut state, &fetchers, &recorder)
            .await
            .unwrap();

        assert!(report.is_success());
        let gmail = &report.accounts[0];
        assert_eq!(gmail.fetched, 3);
        assert_eq!(gmail.classified, 3);
        assert_eq!(gmail.errors, 0);
        assert_eq!(gmail.job_related, 2);
        assert_eq!(gmail.appended, 2);
        assert!(gmail.incomplete_reason().is_none());

        let ids: Vec<_> = recorder
            .store()
            .rows()
            .into_iter()
            .map(|r| r.source_email_id)
            .collect();
        assert_eq!(ids, vec!["m1", "m3"]);

        let rerun = sync(&config, &SyncOptions::default(), &mut state, &fetchers, &recorder)
            .await
            .unwrap();
        assert_eq!(rerun.total_appended(), 0);
        assert_eq!(recorder.store().len(), 2);
    }

    #[tokio::test]
    async fn unclassified_mail_keeps_the_backfill_open() {
        let config = config(vec![account("Gmail")]);
        let fetchers = StubFetchers::default().with(
            "Gmail",
            vec![
                email("m1", "Application received", 24 * 10),
                email("m2", "garbled", 24 * 10),
            ],
        );
        let recorder = Recorder::new(MemoryStore::new());
        let mut state = SyncState::default();

        let report = sync(&config, &SyncOptions::default(), &mut state, &fetchers, &recorder)
            .await
            .unwrap();

        let gmail = &report.accounts[0];
        assert_eq!(gmail.errors, 1);
        assert_eq!(gmail.appended, 1);
        assert!(gmail.incomplete_reason().unwrap().contains("could not be classified"));

        let entry = state.get("Gmail").unwrap();
        assert_eq!(entry.status, SyncStatus::Partial);
        assert!(entry.last_synced.is_none());
        assert!(!state.is_backfill_complete("Gmail"));

        // The next run asks for the full backfill window again
        sync(&config, &SyncOptions::default(), &mut state, &fetchers, &recorder)
            .await
            .unwrap();
        let windows = fetchers.windows.lock().unwrap();
        assert!(Utc::now() - windows[1] >= Duration::days(15));
        assert_eq!(recorder.store().len(), 1);
    }

    #[tokio::test]
    async fn fetch_limit_keeps_the_backfill_open() {
        let mut config = config(vec![account("Gmail")]);
        config.settings.max_emails_per_account = 2;
        let fetchers = StubFetchers::default().with(
            "Gmail",
            vec![
                email("m1", "Application received", 24 * 12),
                email("m2", "Interview invitation", 24 * 2),
                email("m3", "Application received", 1),
            ],
        );
        let recorder = Recorder::new(MemoryStore::new());
        let mut state = SyncState::default();

        let report = sync(&config, &SyncOptions::default(), &mut state, &fetchers, &recorder)
            .await
            .unwrap();

        let gmail = &report.accounts[0];
        assert_eq!(gmail.fetched, 2);
        assert!(gmail.hit_limit);
        assert!(gmail.incomplete_reason().unwrap().contains("max_emails_per_account"));
        assert!(!state.is_backfill_complete("Gmail"));
    }

    #[tokio::test]
    async fn backfill_window_only_on_first_sync() {
        let config = config(vec![account("Gmail")]);
        let fetchers = StubFetchers::default().with(
            "Gmail",
            vec![
                email("old", "Application received", 24 * 10),
                email("new", "Interview invitation", 2),
            ],
        );
        let recorder = Recorder::new(MemoryStore::new());
        let mut state = SyncState::default();

        let first = sync(&config, &SyncOptions::default(), &mut state, &fetchers, &recorder)
            .await
            .unwrap();
        assert_eq!(first.accounts[0].fetched, 2);
        assert!(state.is_backfill_complete("Gmail"));

        let second = sync(&config, &SyncOptions::default(), &mut state, &fetchers, &recorder)
            .await
            .unwrap();
        assert_eq!(second.accounts[0].fetched, 1);

        let windows = fetchers.windows.lock().unwrap();
        let first_age = Utc::now() - windows[0];
        let second_age = Utc::now() - windows[1];
        assert!(first_age >= Duration::days(15));
        assert!(first_age < Duration::days(15) + Duration::minutes(5));
        assert!(second_age >= Duration::hours(24) && second_age < Duration::hours(25));
    }

    #[tokio::test]
    async fn failing_account_does_not_stop_the_others() {
        let config = config(vec![account("Broken"), account("Gmail")]);
        let fetchers =
            StubFetchers::default().with("Gmail", vec![email("m1", "Application received", 1)]);
        let recorder = Recorder::new(MemoryStore::new());
        let mut state = SyncState::default();

        let report = sync(&config, &SyncOptions::default(), &mut state, &fetchers, &recorder)
            .await
            .unwrap();

        assert!(!report.is_success());
        let failed: Vec<_> = report
            .failed_accounts()
            .map(|a| a.account.as_str())
            .collect();
        assert_eq!(failed, vec!["Broken"]);
        assert_eq!(report.total_appended(), 1);
        let broken = state.get("Broken").unwrap();
        assert!(broken.last_error.as_deref().unwrap().contains("Login failed"));
        assert!(!state.is_backfill_complete("Broken"));
    }

    #[tokio::test]
    async fn dry_run_leaves_state_untouched_and_account_filter_applies() {
        let config = config(vec![account("Gmail"), account("iCloud")]);
        let fetchers = StubFetchers::default()
            .with("Gmail", vec![email("g1", "Application received", 1)])
            .with("iCloud", vec![email("i1", "Interview invitation", 1)]);
        let recorder = Recorder::new(MemoryStore::new());
        let mut state = SyncState::default();
        let options = SyncOptions {
            account: Some("iCloud".to_string()),
            dry_run: true,
        };

        let report = sync(&config, &options, &mut state, &fetchers, &recorder)
            .await
            .unwrap();

        assert_eq!(report.accounts.len(), 1);
        assert_eq!(report.accounts[0].account, "iCloud");
        assert!(state.get("iCloud").is_none());

        let unknown = SyncOptions {
            account: Some("Nope".to_string()),
            dry_run: true,
        };
        assert!(sync(&config, &unknown, &mut state, &fetchers, &recorder)
            .await
            .is_err());
    }
}
