use crate::error::TrackerError;
use crate::scheduler;
use chrono::NaiveTime;
use job_types::EmailProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// General sync behaviour
    #[serde(default)]
    pub settings: Settings,

    /// Email accounts to poll
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    /// LLM used to classify emails
    #[serde(default)]
    pub llm: Option<LlmConfig>,

    /// Spreadsheet the job applications are recorded in
    #[serde(default)]
    pub google_sheets: Option<GoogleSheetsConfig>,

    /// Local output used when Google Sheets is disabled
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Hours to look back on every run after the initial backfill
    #[serde(default = "default_fetch_hours")]
    pub fetch_hours: u32,

    /// Days to look back the first time an account is synced
    #[serde(default = "default_backfill_days")]
    pub backfill_days: u32,

    /// Daily sync times in 24-hour "HH:MM" form
    #[serde(default = "default_sync_schedule")]
    pub sync_schedule: Vec<String>,

    /// IANA timezone for the schedule (e.g. "Europe/Berlin"); local time if unset
    #[serde(default)]
    pub timezone: Option<String>,

    /// Default tracing filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log file written alongside the console output; an empty path disables it
    #[serde(default = "default_log_file")]
    pub log_file: Option<PathBuf>,

    /// Tracing filter for the log file
    #[serde(default = "default_log_file_level")]
    pub log_file_level: String,

    /// Where per-account sync progress is kept between runs
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Maximum emails fetched from one account in a single run
    #[serde(default = "default_max_emails")]
    pub max_emails_per_account: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fetch_hours: default_fetch_hours(),
            backfill_days: default_backfill_days(),
            sync_schedule: default_sync_schedule(),
            timezone: None,
            log_level: default_log_level(),
            log_file: default_log_file(),
            log_file_level: default_log_file_level(),
            state_file: default_state_file(),
            max_emails_per_account: default_max_emails(),
        }
    }
}

impl Settings {
    pub fn log_file_path(&self) -> Option<&Path> {
        self.log_file
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}

fn default_fetch_hours() -> u32 {
    24
}

fn default_backfill_days() -> u32 {
    15
}

fn default_sync_schedule() -> Vec<String> {
    vec!["08:00".to_string(), "13:00".to_string(), "18:00".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("logs/job_tracker.log"))
}

fn default_log_file_level() -> String {
    "debug".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from("data/sync_state.json")
}

fn default_max_emails() -> u32 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Display name for this account (e.g. "Personal Gmail")
    pub name: String,

    pub provider: EmailProvider,

    /// Email address
    pub email: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// OAuth token cache (gmail, outlook)
    #[serde(default)]
    pub token_file: Option<PathBuf>,

    /// Google OAuth client secret JSON (gmail)
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,

    /// IMAP server hostname (imap)
    #[serde(default)]
    pub imap_server: Option<String>,

    #[serde(default = "default_imap_port")]
    pub imap_port: u16,

    /// App-specific password (imap)
    #[serde(default)]
    pub app_password: Option<String>,

    /// Environment variable holding the app password, instead of `app_password`
    #[serde(default)]
    pub app_password_env: Option<String>,

    /// Mailbox to read (imap)
    #[serde(default = "default_mailbox")]
    pub mailbox: String,

    /// Azure application (client) id (outlook)
    #[serde(default)]
    pub client_id: Option<String>,

    /// Azure tenant (outlook)
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
}

fn default_true() -> bool {
    true
}

fn default_imap_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_tenant() -> String {
    "common".to_string()
}

impl AccountConfig {
    /// Token file path, required for OAuth providers
    pub fn require_token_file(&self) -> anyhow::Result<&Path> {
        self.token_file
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Account '{}' has no token_file configured", self.name))
    }

    /// Resolve the IMAP password from config or the named environment variable
    pub fn imap_password(&self) -> anyhow::Result<String> {
        if let Some(password) = &self.app_password {
            return Ok(password.clone());
        }

        match &self.app_password_env {
            Some(var) => std::env::var(var).map_err(|_| {
                anyhow::anyhow!(
                    "Credentials not found: environment variable '{}' is not set",
                    var
                )
            }),
            None => anyhow::bail!("Account '{}' has no app password configured", self.name),
        }
    }

    pub fn token_exists(&self) -> bool {
        self.token_file.as_deref().is_some_and(Path::exists)
    }

    fn validate(&self) -> Result<(), TrackerError> {
        let missing = |field: &str| {
            TrackerError::config(format!(
                "account '{}' ({}) requires '{}'",
                self.name,
                self.provider.as_str(),
                field
            ))
        };

        if self.name.trim().is_empty() {
            return Err(TrackerError::config("account name must not be empty"));
        }

        match self.provider {
            EmailProvider::Gmail => {
                if self.token_file.is_none() {
                    return Err(missing("token_file"));
                }
                if self.credentials_file.is_none() {
                    return Err(missing("credentials_file"));
                }
            }
            EmailProvider::Outlook => {
                if self.token_file.is_none() {
                    return Err(missing("token_file"));
                }
                if self.client_id.is_none() {
                    return Err(missing("client_id"));
                }
            }
            EmailProvider::Imap => {
                if self.imap_server.is_none() {
                    return Err(missing("imap_server"));
                }
                if self.app_password.is_none() && self.app_password_env.is_none() {
                    return Err(missing("app_password or app_password_env"));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Google,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &str {
        match self {
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::OpenAi => "openai",
            LlmProvider::Google => "google",
            LlmProvider::Ollama => "ollama",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "claude-3-5-haiku-latest",
            LlmProvider::OpenAi => "gpt-4o-mini",
            LlmProvider::Google => "gemini-1.5-flash",
            LlmProvider::Ollama => "llama3.1",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "https://api.anthropic.com",
            LlmProvider::OpenAi => "https://api.openai.com",
            LlmProvider::Google => "https://generativelanguage.googleapis.com",
            LlmProvider::Ollama => "http://localhost:11434",
        }
    }

    /// Environment variable consulted when no key is set in the config file
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            LlmProvider::Anthropic => Some("ANTHROPIC_API_KEY"),
            LlmProvider::OpenAi => Some("OPENAI_API_KEY"),
            LlmProvider::Google => Some("GOOGLE_API_KEY"),
            LlmProvider::Ollama => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    /// Email bodies are cut to this many characters before prompting
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,

    /// Skip the LLM call for emails without any job-related keywords
    #[serde(default = "default_true")]
    pub prefilter: bool,
}

fn default_max_body_chars() -> usize {
    4000
}

impl LlmConfig {
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
            .trim_end_matches('/')
    }

    /// API key from config, falling back to the provider's environment variable
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.provider
                .api_key_env()
                .and_then(|var| std::env::var(var).ok())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleSheetsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub spreadsheet_id: String,

    /// Service account key JSON
    pub credentials_file: PathBuf,

    /// Tab name within the spreadsheet
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,
}

fn default_sheet_name() -> String {
    "JobApplications".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_jsonl_path")]
    pub jsonl_path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            jsonl_path: default_jsonl_path(),
        }
    }
}

fn default_jsonl_path() -> PathBuf {
    PathBuf::from("data/applications.jsonl")
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!(
                "Configuration file not found or unreadable: {} ({})",
                path.display(),
                e
            )
        })?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        let mut names = HashSet::new();
        for account in &self.accounts {
            account.validate()?;
            if !names.insert(account.name.as_str()) {
                return Err(TrackerError::config(format!(
                    "duplicate account name '{}'",
                    account.name
                )));
            }
        }

        if self.settings.fetch_hours == 0 {
            return Err(TrackerError::config("settings.fetch_hours must be at least 1"));
        }

        self.schedule()?;
        if let Some(tz) = &self.settings.timezone {
            tz.parse::<chrono_tz::Tz>()
                .map_err(|_| TrackerError::config(format!("unknown timezone '{}'", tz)))?;
        }

        if let Some(sheets) = &self.google_sheets {
            if sheets.enabled && sheets.spreadsheet_id.trim().is_empty() {
                return Err(TrackerError::config(
                    "google_sheets.spreadsheet_id must not be empty",
                ));
            }
        }

        Ok(())
    }

    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }

    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.name == name)
    }

    /// Parsed daily sync times, sorted
    pub fn schedule(&self) -> Result<Vec<NaiveTime>, TrackerError> {
        scheduler::parse_schedule(&self.settings.sync_schedule)
    }

    /// The Sheets section, only if present and enabled
    pub fn sheets(&self) -> Option<&GoogleSheetsConfig> {
        self.google_sheets.as_ref().filter(|s| s.enabled)
    }

    pub fn example() -> Self {
        Config {
            settings: Settings::default(),
            accounts: vec![
                AccountConfig {
                    name: "Personal Gmail".to_string(),
                    provider: EmailProvider::Gmail,
                    email: "you@gmail.com".to_string(),
                    enabled: true,
                    token_file: Some(PathBuf::from("config/tokens/gmail_personal.json")),
                    credentials_file: Some(PathBuf::from("config/gmail_credentials.json")),
                    imap_server: None,
                    imap_port: default_imap_port(),
                    app_password: None,
                    app_password_env: None,
                    mailbox: default_mailbox(),
                    client_id: None,
                    tenant_id: default_tenant(),
                },
                AccountConfig {
                    name: "iCloud".to_string(),
                    provider: EmailProvider::Imap,
                    email: "you@icloud.com".to_string(),
                    enabled: true,
                    token_file: None,
                    credentials_file: None,
                    imap_server: Some("imap.mail.me.com".to_string()),
                    imap_port: default_imap_port(),
                    app_password: None,
                    app_password_env: Some("ICLOUD_APP_PASSWORD".to_string()),
                    mailbox: default_mailbox(),
                    client_id: None,
                    tenant_id: default_tenant(),
                },
            ],
            llm: Some(LlmConfig {
                provider: LlmProvider::Anthropic,
                model: None,
                api_key: None,
                base_url: None,
                max_body_chars: default_max_body_chars(),
                prefilter: true,
            }),
            google_sheets: Some(GoogleSheetsConfig {
                enabled: true,
                spreadsheet_id: "your-spreadsheet-id".to_string(),
                credentials_file: PathBuf::from("config/sheets_service_account.json"),
                sheet_name: default_sheet_name(),
            }),
            output: OutputConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[settings]
fetch_hours = 12
sync_schedule = ["07:30", "19:00"]

[[accounts]]
name = "Personal Gmail"
provider = "gmail"
email = "me@gmail.com"
token_file = "config/tokens/gmail.json"
credentials_file = "config/credentials.json"

[[accounts]]
name = "Work Outlook"
provider = "outlook"
email = "me@outlook.com"
enabled = false
token_file = "config/tokens/outlook.json"
client_id = "00000000-0000-0000-0000-000000000000"

[llm]
provider = "openai"
model = "gpt-4o"

[google_sheets]
spreadsheet_id = "abc123"
credentials_file = "config/service_account.json"
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = Config::parse(SAMPLE).unwrap();

        assert_eq!(config.settings.fetch_hours, 12);
        assert_eq!(config.settings.backfill_days, 15);
        assert_eq!(config.settings.max_emails_per_account, 200);
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.enabled_accounts().count(), 1);
        assert_eq!(config.accounts[1].tenant_id, "common");

        let llm = config.llm.as_ref().unwrap();
        assert_eq!(llm.provider, LlmProvider::OpenAi);
        assert_eq!(llm.model(), "gpt-4o");
        assert_eq!(llm.base_url(), "https://api.openai.com");
        assert!(llm.prefilter);

        let sheets = config.sheets().unwrap();
        assert_eq!(sheets.sheet_name, "JobApplications");
        assert_eq!(config.schedule().unwrap().len(), 2);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.accounts.is_empty());
        assert!(config.llm.is_none());
        assert!(config.sheets().is_none());
        assert_eq!(config.settings.sync_schedule, vec!["08:00", "13:00", "18:00"]);
        assert_eq!(config.output.jsonl_path, PathBuf::from("data/applications.jsonl"));
        assert_eq!(
            config.settings.log_file_path(),
            Some(Path::new("logs/job_tracker.log"))
        );
        assert_eq!(config.settings.log_file_level, "debug");
    }

    #[test]
    fn empty_log_file_disables_file_logging() {
        let config = Config::parse("[settings]\nlog_file = \"\"\n").unwrap();
        assert!(config.settings.log_file_path().is_none());
    }

    #[test]
    fn rejects_duplicate_account_names() {
        let toml = r#"
[[accounts]]
name = "Mail"
provider = "imap"
email = "a@example.com"
imap_server = "imap.example.com"
app_password = "x"

[[accounts]]
name = "Mail"
provider = "imap"
email = "b@example.com"
imap_server = "imap.example.com"
app_password = "y"
"#;
        let err = Config::parse(toml).unwrap_err();
        assert!(err.to_string().contains("duplicate account name"));
    }

    #[test]
    fn rejects_missing_provider_fields() {
        let toml = r#"
[[accounts]]
name = "iCloud"
provider = "imap"
email = "me@icloud.com"
"#;
        let err = Config::parse(toml).unwrap_err();
        assert!(err.to_string().contains("imap_server"));
    }

    #[test]
    fn rejects_bad_schedule_and_timezone() {
        let err = Config::parse("[settings]\nsync_schedule = [\"25:00\"]\n").unwrap_err();
        assert!(err.to_string().contains("25:00"));

        let err = Config::parse("[settings]\ntimezone = \"Mars/Olympus\"\n").unwrap_err();
        assert!(err.to_string().contains("unknown timezone"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let toml = r#"
[[accounts]]
name = "Yahoo"
provider = "yahoo"
email = "me@yahoo.com"
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn example_config_is_valid() {
        let example = Config::example();
        example.validate().unwrap();

        let rendered = toml::to_string(&example).unwrap();
        let reparsed = Config::parse(&rendered).unwrap();
        assert_eq!(reparsed.accounts.len(), example.accounts.len());
    }

    #[test]
    fn shipped_example_file_parses() {
        let config =
            Config::parse(include_str!("../../../config/config.toml.example")).unwrap();

        assert_eq!(config.accounts.len(), 3);
        assert_eq!(config.enabled_accounts().count(), 2);
        assert_eq!(
            config.account("Work Outlook").unwrap().provider,
            EmailProvider::Outlook
        );
        assert_eq!(config.sheets().unwrap().sheet_name, "JobApplications");
        assert_eq!(config.schedule().unwrap().len(), 3);
    }

    #[test]
    fn imap_password_from_env() {
        let mut account = Config::example().accounts[1].clone();
        account.app_password_env = Some("JOB_TRACKER_TEST_IMAP_PASSWORD".to_string());
        std::env::set_var("JOB_TRACKER_TEST_IMAP_PASSWORD", "secret");
        assert_eq!(account.imap_password().unwrap(), "secret");

        account.app_password = Some("inline".to_string());
        assert_eq!(account.imap_password().unwrap(), "inline");
    }
}
