use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Password;
use serde_json::{json, Value};
use std::sync::Arc;

use janchwi_client::api::AuthApi;
use janchwi_client::config::{CliArgs, Command, Config, LogFormat};
use janchwi_client::error::ApiError;
use janchwi_client::http_client::ApiClient;
use janchwi_client::models::{
    LoginRequest, SendVerificationRequest, SignupRequest, VerifyEmailRequest,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::from_args(&args)?;
    config.validate()?;

    init_logging(&config);
    tracing::debug!(
        base_url = %config.api_base_url,
        session_db = %config.session_db_file.display(),
        "Configuration loaded"
    );

    let client = Arc::new(ApiClient::from_config(&config)?);
    let auth = AuthApi::new(client.clone());

    match run(args.command, &client, &auth).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            tracing::debug!("Command failed: {:?}", e);
            eprintln!("error: {}", e.user_message());
            if let Some(http) = e.http_error() {
                for field in &http.field_errors {
                    eprintln!("  {}: {}", field.field, field.message);
                }
                if http.is_account_locked() {
                    eprintln!("  The account is locked. Try again later.");
                } else if http.is_email_not_verified() {
                    eprintln!("  Verify your email with `janchwi send-verification`.");
                }
            }
            std::process::exit(1);
        }
    }
}

/// Initialize logging with the configured level and format
fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(command: Command, client: &ApiClient, auth: &AuthApi) -> Result<Value, ApiError> {
    match command {
        Command::Login { email, password } => {
            let password = password_or_prompt(password)?;
            let response = auth.login(&LoginRequest { email, password }).await?;
            Ok(json!({ "userId": response.user_id, "authenticated": true }))
        }

        Command::Signup {
            email,
            nickname,
            birth_date,
            gender,
            profile_image_url,
            bio,
            password,
        } => {
            let password = password_or_prompt(password)?;
            let response = auth
                .signup(&SignupRequest {
                    email,
                    password,
                    nickname,
                    birth_date,
                    profile_image_url,
                    gender,
                    bio,
                })
                .await?;
            Ok(json!({ "userId": response.user_id }))
        }

        Command::CheckEmail { email } => {
            let response = auth.check_email(&email).await?;
            Ok(json!({ "email": email, "available": response.available }))
        }

        Command::SendVerification { email } => {
            let response = auth
                .send_verification(&SendVerificationRequest { email })
                .await?;
            Ok(json!({ "message": response.message }))
        }

        Command::VerifyEmail { email, code } => {
            let response = auth
                .verify_email(&VerifyEmailRequest { email, code })
                .await?;
            Ok(json!({ "userId": response.user_id, "authenticated": true }))
        }

        Command::Logout => {
            let response = auth.logout().await?;
            Ok(json!({ "message": response.message }))
        }

        Command::Request { method, path, body } => {
            let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
                .map_err(|_| ApiError::Config(format!("Unknown HTTP method: {}", method)))?;
            let body = body
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .map_err(|e| ApiError::Config(format!("--body is not valid JSON: {}", e)))?;
            client.request(method, &path, body).await
        }

        Command::Status => Ok(json!({
            "baseUrl": client.base_url(),
            "authenticated": client.store().is_authenticated(),
        })),
    }
}

/// Use the given password, or prompt for one without echo
fn password_or_prompt(password: Option<String>) -> Result<String, ApiError> {
    match password {
        Some(password) => Ok(password),
        None => Password::new()
            .with_prompt("Password")
            .interact()
            .context("Failed to read password")
            .map_err(ApiError::Internal),
    }
}
