//! Defines the configuration settings for the lead-attribution application.

use crate::models::ReengagementSource;
use crate::phone::DEFAULT_COUNTRY_CODE;
use crate::sanitize::DEFAULT_MAX_VALUE_LENGTH;
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command line arguments for lead-attribution
#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-touch UTM and WhatsApp lead attribution", long_about = None)]
pub(crate) struct AppArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file (TOML format)
    #[arg(long, global = true, env = "LEAD_ATTRIBUTION_CONFIG")]
    pub config_file: Option<String>,

    /// Directory holding the session and durable attribution state files
    #[arg(long, global = true, env = "LEAD_ATTRIBUTION_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Base URL of the CRM REST API
    #[arg(long, global = true, env = "LEAD_ATTRIBUTION_CRM_BASE_URL")]
    pub crm_base_url: Option<String>,

    /// CRM API key
    #[arg(long, global = true, env = "BREVO_API_KEY", hide_env_values = true)]
    pub crm_api_key: Option<String>,

    /// URL of the "track re-engagement" endpoint
    #[arg(long, global = true, env = "LEAD_ATTRIBUTION_REENGAGEMENT_ENDPOINT")]
    pub reengagement_endpoint: Option<String>,

    /// HTTP request timeout in seconds
    #[arg(long, global = true, env = "LEAD_ATTRIBUTION_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// Country calling code used to normalize local phone numbers
    #[arg(long, global = true, env = "LEAD_ATTRIBUTION_COUNTRY_CODE")]
    pub country_code: Option<String>,

    /// Minimum sleep between CRM requests during backfill (seconds)
    #[arg(long, global = true, env = "LEAD_ATTRIBUTION_MIN_SLEEP")]
    pub min_sleep: Option<f32>,

    /// Maximum sleep between CRM requests during backfill (seconds)
    #[arg(long, global = true, env = "LEAD_ATTRIBUTION_MAX_SLEEP")]
    pub max_sleep: Option<f32>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Capture UTM parameters from a page load into the attribution store
    Capture {
        /// Full URL of the page being loaded
        #[arg(long)]
        url: String,
        /// HTTP referrer of the page load
        #[arg(long)]
        referrer: Option<String>,
        /// Raw Cookie header sent with the page load
        #[arg(long)]
        cookies: Option<String>,
    },
    /// Print the enriched attribution payload for a form submission
    Resolve {
        /// Page the form is submitted from
        #[arg(long)]
        url: Option<String>,
        /// HTTP referrer of the submitting page
        #[arg(long)]
        referrer: Option<String>,
    },
    /// Forget the current session's last-touch data
    EndSession {
        /// Also forget first-touch data, the client id and the stored email
        #[arg(long)]
        forget_visitor: bool,
    },
    /// Push a WhatsApp lead into the CRM, preserving existing first-touch data
    Whatsapp {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        course: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        message: Option<String>,
    },
    /// Report a returning visitor's re-engagement to the CRM
    Reengage {
        /// Interaction that identified the visitor
        #[arg(long)]
        source: ReengagementSource,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        contact_id: Option<i64>,
        /// Raw Cookie header carrying the analytics client id
        #[arg(long)]
        cookies: Option<String>,
        /// Current page URL
        #[arg(long)]
        url: Option<String>,
        /// Current page referrer
        #[arg(long)]
        referrer: Option<String>,
    },
    /// Process a JSON file of WhatsApp leads against the CRM
    Backfill {
        /// Path to the input JSON file
        #[arg(short, long)]
        input: PathBuf,
        /// Path to the output JSON file
        #[arg(short, long)]
        output: PathBuf,
        /// Number of concurrent workers
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Start the API server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
}

/// TOML Configuration file structure
#[derive(Deserialize, Debug, Default)]
struct ConfigFile {
    crm: Option<CrmConfig>,
    attribution: Option<AttributionConfig>,
    storage: Option<StorageConfig>,
    reengagement: Option<ReengagementConfig>,
    backfill: Option<BackfillConfig>,
    server: Option<ServerConfig>,
}

#[derive(Deserialize, Debug, Default)]
struct CrmConfig {
    base_url: Option<String>,
    api_key: Option<String>,
    request_timeout: Option<u64>,
    contact_scan_limit: Option<u32>,
    whatsapp_email_domain: Option<String>,
    user_agent: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct AttributionConfig {
    country_code: Option<String>,
    max_value_length: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
struct StorageConfig {
    state_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
struct ReengagementConfig {
    endpoint: Option<String>,
    dedup_window_hours: Option<i64>,
    dedup_retention_days: Option<i64>,
}

#[derive(Deserialize, Debug, Default)]
struct BackfillConfig {
    min_sleep: Option<f32>,
    max_sleep: Option<f32>,
    max_concurrency: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
struct ServerConfig {
    port: Option<u16>,
    max_concurrent_requests: Option<usize>,
}

/// Application configuration settings.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// Base URL of the CRM REST API.
    pub crm_base_url: String,
    /// CRM API key; CRM-backed commands refuse to start without it.
    pub crm_api_key: Option<String>,
    /// Timeout applied to every outbound HTTP call.
    pub request_timeout: Duration,
    /// How many recent contacts are scanned when matching by phone.
    pub contact_scan_limit: u32,
    /// Domain of the placeholder email given to WhatsApp leads without one.
    pub whatsapp_email_domain: String,
    /// User agent string to use for HTTP requests.
    pub user_agent: String,
    /// Country calling code used by phone normalization.
    pub country_code: String,
    /// Longest stored value for a marketing parameter.
    pub max_value_length: usize,
    /// Directory holding the file-backed attribution store.
    pub state_dir: PathBuf,
    /// URL of the "track re-engagement" endpoint.
    pub reengagement_endpoint: String,
    /// Re-engagement for the same email is suppressed within this window.
    pub dedup_window: chrono::Duration,
    /// De-duplication entries older than this are pruned.
    pub dedup_retention: chrono::Duration,
    /// Minimum and maximum sleep duration between backfill requests (seconds).
    pub sleep_between_requests: (f32, f32),
    /// Maximum number of leads processed concurrently during backfill.
    pub max_concurrency: usize,
    /// Port the API server listens on.
    pub server_port: u16,
    /// Maximum number of API requests served concurrently.
    pub max_concurrent_requests: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            crm_base_url: "https://api.brevo.com/v3".to_string(),
            crm_api_key: None,
            request_timeout: Duration::from_secs(10),
            contact_scan_limit: 100,
            whatsapp_email_domain: "admi.africa".to_string(),
            user_agent: concat!("lead-attribution/", env!("CARGO_PKG_VERSION")).to_string(),
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            max_value_length: DEFAULT_MAX_VALUE_LENGTH,
            state_dir: PathBuf::from(".attribution"),
            reengagement_endpoint: "http://localhost:8080/api/v3/track-reengagement".to_string(),
            dedup_window: chrono::Duration::hours(24),
            dedup_retention: chrono::Duration::days(7),
            sleep_between_requests: (0.1, 0.5),
            max_concurrency: 5,
            server_port: 8080,
            max_concurrent_requests: 10,
        }
    }
}

/// Load configuration from a TOML file
fn load_config_file(file_path: &str) -> anyhow::Result<ConfigFile> {
    let path = Path::new(file_path);
    if !path.exists() {
        tracing::warn!("Configuration file {} not found, using defaults", file_path);
        return Ok(ConfigFile::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file: {}", file_path))?;

    let config: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse TOML configuration from {}", file_path))?;

    tracing::info!("Loaded configuration from {}", file_path);
    Ok(config)
}

fn apply_file_config(config: &mut Config, file_config: &ConfigFile) {
    if let Some(crm) = &file_config.crm {
        if let Some(base_url) = &crm.base_url {
            config.crm_base_url = base_url.clone();
        }
        if let Some(api_key) = &crm.api_key {
            config.crm_api_key = Some(api_key.clone());
        }
        if let Some(timeout) = crm.request_timeout {
            config.request_timeout = Duration::from_secs(timeout);
        }
        if let Some(limit) = crm.contact_scan_limit {
            config.contact_scan_limit = limit;
        }
        if let Some(domain) = &crm.whatsapp_email_domain {
            config.whatsapp_email_domain = domain.clone();
        }
        if let Some(user_agent) = &crm.user_agent {
            config.user_agent = user_agent.clone();
        }
    }

    if let Some(attribution) = &file_config.attribution {
        if let Some(code) = &attribution.country_code {
            config.country_code = code.clone();
        }
        if let Some(max_len) = attribution.max_value_length {
            config.max_value_length = max_len;
        }
    }

    if let Some(storage) = &file_config.storage {
        if let Some(dir) = &storage.state_dir {
            config.state_dir = dir.clone();
        }
    }

    if let Some(reengagement) = &file_config.reengagement {
        if let Some(endpoint) = &reengagement.endpoint {
            config.reengagement_endpoint = endpoint.clone();
        }
        if let Some(hours) = reengagement.dedup_window_hours {
            config.dedup_window = chrono::Duration::hours(hours);
        }
        if let Some(days) = reengagement.dedup_retention_days {
            config.dedup_retention = chrono::Duration::days(days);
        }
    }

    if let Some(backfill) = &file_config.backfill {
        if let Some(min_sleep) = backfill.min_sleep {
            config.sleep_between_requests.0 = min_sleep;
        }
        if let Some(max_sleep) = backfill.max_sleep {
            config.sleep_between_requests.1 = max_sleep;
        }
        if let Some(concurrency) = backfill.max_concurrency {
            config.max_concurrency = concurrency;
        }
    }

    if let Some(server) = &file_config.server {
        if let Some(port) = server.port {
            config.server_port = port;
        }
        if let Some(max_requests) = server.max_concurrent_requests {
            config.max_concurrent_requests = max_requests;
        }
    }
}

/// Apply command line arguments to the Config instance
fn apply_cli_args(config: &mut Config, args: &AppArgs) {
    if let Some(ref dir) = args.state_dir {
        config.state_dir = dir.clone();
    }

    if let Some(ref base_url) = args.crm_base_url {
        config.crm_base_url = base_url.clone();
    }

    if let Some(ref api_key) = args.crm_api_key {
        config.crm_api_key = Some(api_key.clone());
    }

    if let Some(ref endpoint) = args.reengagement_endpoint {
        config.reengagement_endpoint = endpoint.clone();
    }

    if let Some(timeout) = args.request_timeout {
        config.request_timeout = Duration::from_secs(timeout);
    }

    if let Some(ref code) = args.country_code {
        config.country_code = code.clone();
    }

    if let Some(min_sleep) = args.min_sleep {
        config.sleep_between_requests.0 = min_sleep;
    }

    if let Some(max_sleep) = args.max_sleep {
        config.sleep_between_requests.1 = max_sleep;
    }

    match args.command {
        Command::Backfill {
            workers: Some(workers),
            ..
        } => config.max_concurrency = workers,
        Command::Serve { port: Some(port) } => config.server_port = port,
        _ => {}
    }
}

fn validate_config(config: &mut Config) -> anyhow::Result<()> {
    if config.sleep_between_requests.0 > config.sleep_between_requests.1 {
        config.sleep_between_requests.1 = config.sleep_between_requests.0;
        tracing::warn!(
            "Min sleep was greater than max sleep. Setting both to {}",
            config.sleep_between_requests.0
        );
    }

    if config.max_value_length == 0 {
        config.max_value_length = DEFAULT_MAX_VALUE_LENGTH;
        tracing::warn!(
            "Max value length was set to 0. Setting to {}.",
            DEFAULT_MAX_VALUE_LENGTH
        );
    }

    if config.country_code.is_empty() || !config.country_code.bytes().all(|b| b.is_ascii_digit()) {
        tracing::warn!(
            "Country code '{}' is not numeric. Setting to {}.",
            config.country_code,
            DEFAULT_COUNTRY_CODE
        );
        config.country_code = DEFAULT_COUNTRY_CODE.to_string();
    }

    if config.dedup_retention < config.dedup_window {
        config.dedup_retention = config.dedup_window;
        tracing::warn!("De-duplication retention was shorter than the window. Setting it to the window.");
    }

    if config.max_concurrency == 0 {
        config.max_concurrency = 1;
        tracing::warn!("Concurrency was set to 0. Setting to 1.");
    }

    if config.max_concurrent_requests == 0 {
        config.max_concurrent_requests = 1;
        tracing::warn!("Max concurrent requests was set to 0. Setting to 1.");
    }

    if config.contact_scan_limit == 0 {
        config.contact_scan_limit = 100;
        tracing::warn!("Contact scan limit was set to 0. Setting to 100.");
    }

    url::Url::parse(&config.crm_base_url)
        .with_context(|| format!("Invalid CRM base URL: {}", config.crm_base_url))?;

    Ok(())
}

pub(crate) fn build_config(args: &AppArgs) -> anyhow::Result<Config> {
    let mut config = Config::default();

    if let Some(ref file_path) = args.config_file {
        match load_config_file(file_path) {
            Ok(file_config) => apply_file_config(&mut config, &file_config),
            Err(e) => {
                tracing::error!("Failed to load configuration file: {}", e);
            }
        }
    } else {
        for path in ["./lead-attribution.toml", "./config.toml"].iter() {
            if Path::new(path).exists() {
                match load_config_file(path) {
                    Ok(file_config) => {
                        apply_file_config(&mut config, &file_config);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load configuration from {}: {}", path, e);
                    }
                }
            }
        }
    }

    apply_cli_args(&mut config, args);

    validate_config(&mut config)?;

    tracing::debug!("Final configuration: {:?}", RedactedConfig(&config));

    Ok(config)
}

/// Debug view of the configuration that never prints the API key.
struct RedactedConfig<'a>(&'a Config);

impl std::fmt::Debug for RedactedConfig<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut config = self.0.clone();
        if config.crm_api_key.is_some() {
            config.crm_api_key = Some("<redacted>".to_string());
        }
        config.fmt(f)
    }
}

pub(crate) fn get_random_sleep_duration(config: &Config) -> Duration {
    use rand::Rng;
    let (min, max) = config.sleep_between_requests;
    if min >= max {
        return Duration::from_secs_f32(min.max(0.0));
    }
    let duration_secs = rand::thread_rng().gen_range(min..max);
    Duration::from_secs_f32(duration_secs.max(0.0))
}
