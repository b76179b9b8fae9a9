use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::models::Gender;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";

/// Janchwi API client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// API base URL
    #[arg(short = 'u', long, env = "API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    pub base_url: String,

    /// Path to the session SQLite database
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// Retries for idempotent requests on transient errors
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "2")]
    pub http_retries: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Log in with email and password
    Login {
        #[arg(short, long)]
        email: String,
        /// Prompted for when omitted
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Create an account (verify the email afterwards)
    Signup {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        nickname: String,
        /// YYYY-MM-DD
        #[arg(short, long)]
        birth_date: String,
        #[arg(short, long, value_enum)]
        gender: Option<Gender>,
        #[arg(long)]
        profile_image_url: Option<String>,
        #[arg(long)]
        bio: Option<String>,
        /// Prompted for when omitted
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Check whether an email address is still available
    CheckEmail { email: String },

    /// Send a verification code to an email address
    SendVerification { email: String },

    /// Verify an email address with the received code (logs in)
    VerifyEmail {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        code: String,
    },

    /// Log out and clear the local session
    Logout,

    /// Issue an authenticated request
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,
        /// Path relative to the base URL
        path: String,
        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,
    },

    /// Show whether a session is stored
    Status,
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_base_url: String,

    // Session persistence
    pub session_db_file: PathBuf,

    // HTTP client
    pub http_request_timeout: u64,
    pub http_connect_timeout: u64,
    pub http_max_retries: u32,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults.
    /// Call `dotenvy::dotenv()` before parsing so `.env` values act as ENV.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let session_db_file = match &args.db_file {
            Some(path) => expand_tilde(path),
            None => default_session_db_file()
                .context("Could not determine a data directory; set SESSION_DB_FILE")?,
        };

        Ok(Config {
            api_base_url: args.base_url.trim_end_matches('/').to_string(),
            session_db_file,
            http_request_timeout: args.http_timeout,
            http_connect_timeout: args.connect_timeout,
            http_max_retries: args.http_retries,
            log_level: args.log_level.clone(),
            log_format: parse_log_format(&args.log_format),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", self.api_base_url))?;

        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("API_BASE_URL must use http or https: {}", self.api_base_url);
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }
}

/// Default location of the session database
fn default_session_db_file() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("janchwi").join("session.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}
