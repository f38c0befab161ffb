//!
//! marketgate server binary
//! ------------------------
//! Command-line entry point for starting the marketgate auth HTTP server.
//! Supports configuration via CLI flags and environment variables.

use anyhow::Result;
use std::env;

fn parse_port_env(name: &str) -> Option<u16> {
    match env::var(name) {
        Ok(val) => val.parse::<u16>().ok(),
        Err(_) => None,
    }
}

fn parse_port_arg(args: &[String], flag: &str) -> Option<u16> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag
            && i + 1 < args.len() {
                return args[i + 1].parse::<u16>().ok();
            }
        i += 1;
    }
    None
}

fn parse_string_arg(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag {
            if i + 1 < args.len() {
                return Some(args[i + 1].clone());
            }
            break;
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[tokio::main]
async fn main() -> Result<()> {
    println!(r"                         _           _                  _
 _ __ ___    __ _  _ __ | | __  ___ | |_   __ _   __ _ | |_   ___
| '_ ` _ \  / _` || '__|| |/ / / _ \| __| / _` | / _` || __| / _ \
| | | | | || (_| || |   |   < |  __/| |_ | (_| || (_| || |_ |  __/
|_| |_| |_| \__,_||_|   |_|\_\ \___| \__| \__, | \__,_| \__| \___|
                                          |___/                   ");

    // Initialize tracing subscriber with env filter if provided
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("marketgate Server\n\nUSAGE:\n  marketgate_server [--http-port N] [--data-dir PATH]\n\nOPTIONS:\n  --http-port N     HTTP API port (env: MARKETGATE_HTTP_PORT, default 7890)\n  --data-dir PATH   Auth data folder (env: MARKETGATE_DATA_DIR, default data)\n");
        return Ok(());
    }

    // Defaults
    let default_http: u16 = 7890;
    let default_data: &str = "data";

    // Environment variables
    let env_http = parse_port_env("MARKETGATE_HTTP_PORT");
    let env_data = env::var("MARKETGATE_DATA_DIR").ok();

    // CLI arguments override environment
    let arg_http = parse_port_arg(&args, "--http-port");
    let arg_data = parse_string_arg(&args, "--data-dir");

    let http_port = arg_http.or(env_http).unwrap_or(default_http);
    let data_dir = arg_data.or(env_data).unwrap_or_else(|| default_data.to_string());

    println!("marketgate starting: http={}, data_dir={}", http_port, data_dir);
    tracing::info!("Using port: http={}, data_dir={}", http_port, data_dir);

    marketgate::server::run_with_port(http_port, &data_dir).await
}
