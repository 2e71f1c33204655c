pub mod commands;
pub mod doctor;

use crate::errors::ProxyError;
use clap::Parser;

/// Exit codes: 0 success, 1 generic error, 2 configuration invalid,
/// 3 authentication required.
pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_AUTH: i32 = 3;

pub async fn run() -> i32 {
    let cli = commands::Cli::parse();
    match commands::execute(cli).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(error: &ProxyError) -> i32 {
    match error {
        ProxyError::Validation(_) | ProxyError::ImmutableField { .. } => EXIT_CONFIG,
        ProxyError::AuthRequired { .. } | ProxyError::Unauthorized(_) => EXIT_AUTH,
        _ => EXIT_ERROR,
    }
}
