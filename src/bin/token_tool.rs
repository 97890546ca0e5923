use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use camera_service::{JwtHandler, Role, ServiceConfig};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

/// Mint and inspect JSON-RPC access tokens signed with the service secret.
#[derive(Parser, Debug)]
#[command(name = "camtoken")]
#[command(about = "Issue and verify camera service access tokens")]
#[command(version)]
struct Args {
    /// Path to camera service configuration file (for the JWT secret)
    #[arg(short = 'c', long, default_value = "camera-service.toml")]
    config: PathBuf,

    /// Signing secret; overrides the configured one
    #[arg(long, env = "CAMSVC_SECURITY__JWT_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Print JSON instead of plain text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a token for a user
    Issue {
        /// User identifier carried in the token
        #[arg(short, long)]
        user: String,

        /// viewer, operator or admin
        #[arg(short, long, default_value = "viewer")]
        role: String,

        /// Lifetime in hours (defaults to security.token_expiry_hours)
        #[arg(long)]
        hours: Option<u64>,
    },
    /// Check a token's signature and expiry
    Verify {
        token: String,
    },
}

#[derive(Debug, Serialize)]
struct TokenReport {
    valid: bool,
    user_id: Option<String>,
    role: Option<String>,
    expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServiceConfig::load_from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let secret = args
        .secret
        .clone()
        .unwrap_or_else(|| config.security.jwt_secret.clone());
    let default_expiry = Duration::from_secs(config.security.token_expiry_hours * 3600);
    let handler = JwtHandler::new(&secret, default_expiry)
        .map_err(|e| anyhow!("invalid signing secret: {}", e))?;

    let report = match &args.command {
        Command::Issue { user, role, hours } => {
            let role =
                Role::parse(role).ok_or_else(|| anyhow!("unknown role '{}'", role))?;
            let expiry = hours.map(|h| Duration::from_secs(h * 3600));
            let token = handler
                .generate_token(user, role, expiry)
                .map_err(|e| anyhow!("{}", e))?;

            // Read the claims back so the report shows what was signed
            let result = handler.authenticate(&token);
            TokenReport {
                valid: result.authenticated,
                user_id: result.user_id,
                role: result.role.map(|r| r.as_str().to_string()),
                expires_at: result.expires_at.map(format_timestamp),
                token: Some(token),
                error: result.error_message,
            }
        }
        Command::Verify { token } => {
            let result = handler.authenticate(token);
            TokenReport {
                valid: result.authenticated,
                user_id: result.user_id,
                role: result.role.map(|r| r.as_str().to_string()),
                expires_at: result.expires_at.map(format_timestamp),
                token: None,
                error: result.error_message,
            }
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if let Some(token) = &report.token {
        println!("{}", token);
        eprintln!(
            "user={} role={} expires={}",
            report.user_id.as_deref().unwrap_or("-"),
            report.role.as_deref().unwrap_or("-"),
            report.expires_at.as_deref().unwrap_or("-")
        );
    } else if report.valid {
        println!(
            "valid: user={} role={} expires={}",
            report.user_id.as_deref().unwrap_or("-"),
            report.role.as_deref().unwrap_or("-"),
            report.expires_at.as_deref().unwrap_or("-")
        );
    } else {
        println!(
            "invalid: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }

    if report.valid {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn format_timestamp(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string())
}
