//! Board Link CLI - talk to an embedded board over the framed link.
//!
//! This is the main binary entry point. See the `board_link` library for
//! the core functionality.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use board_link::{LinkConfig, Message, PeerLink, SimulatedBoard};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "board-link")]
#[command(version)]
#[command(about = "Resilient framed TCP link to an embedded board")]
struct Cli {
    /// Configuration file (defaults to <config dir>/board-link/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Board host, overriding the configuration
    #[arg(long, global = true)]
    host: Option<String>,

    /// Board port, overriding the configuration
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Label used in log lines
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log every message the board sends until interrupted
    Watch,
    /// Send one settings update and print the board's replies
    Set {
        /// Settings as KEY=VALUE; values are parsed as JSON, else taken as strings
        #[arg(required = true, value_parser = parse_setting)]
        settings: Vec<(String, Value)>,

        /// Seconds to wait for replies before disconnecting
        #[arg(long, default_value_t = 2)]
        wait: u64,
    },
    /// Run a simulated board until interrupted
    Simulate {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:5000")]
        bind: String,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the configuration file
        #[arg(long)]
        write: bool,
    },
}

/// Parse `KEY=VALUE` into a settings entry.
fn parse_setting(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

impl Cli {
    fn link_config(&self) -> Result<LinkConfig> {
        let mut config = LinkConfig::load(self.config.as_deref())?;
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Connect, or give up quietly if interrupted first.
///
/// Returns `false` when Ctrl-C arrived before the link came up.
async fn connect_or_interrupt(link: &PeerLink) -> Result<bool> {
    tokio::select! {
        () = link.connect() => Ok(true),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            Ok(false)
        }
    }
}

async fn run_watch(config: LinkConfig) -> Result<()> {
    let name = config.name.clone();
    let link = PeerLink::with_handler(config.endpoint(), move |message| {
        log::info!("[{}] {}", name, Value::Object(message));
    });

    if connect_or_interrupt(&link).await? {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }

    println!("Shutting down...");
    link.disconnect().await;
    Ok(())
}

async fn run_set(config: LinkConfig, settings: Vec<(String, Value)>, wait: u64) -> Result<()> {
    let link = PeerLink::with_handler(config.endpoint(), |message| {
        println!("{}", Value::Object(message));
    });

    if !connect_or_interrupt(&link).await? {
        link.disconnect().await;
        return Ok(());
    }

    let settings: Message = settings.into_iter().collect();
    let result = link.update_settings(settings).await;
    if result.is_ok() {
        tokio::time::sleep(Duration::from_secs(wait)).await;
    }

    link.disconnect().await;
    result.context("Failed to send settings")
}

async fn run_simulate(bind: &str) -> Result<()> {
    let board = SimulatedBoard::bind(bind)
        .await
        .with_context(|| format!("Failed to bind simulated board on {bind}"))?;
    println!("Simulated board listening on {}", board.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!("Shutting down...");
    board.shutdown().await;
    Ok(())
}

fn run_config(cli: &Cli, write: bool) -> Result<()> {
    let config = cli.link_config()?;
    println!("{}", serde_json::to_string_pretty(&config)?);

    if write {
        let path = match &cli.config {
            Some(path) => path.clone(),
            None => LinkConfig::default_path()?,
        };
        config.save(&path)?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Watch => run_watch(cli.link_config()?).await,
        Commands::Set { settings, wait } => {
            run_set(cli.link_config()?, settings.clone(), *wait).await
        }
        Commands::Simulate { bind } => run_simulate(bind).await,
        Commands::Config { write } => run_config(&cli, *write),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setting_json_value() {
        assert_eq!(
            parse_setting("pwm01=128").unwrap(),
            ("pwm01".to_string(), Value::from(128))
        );
        assert_eq!(
            parse_setting("enabled=true").unwrap(),
            ("enabled".to_string(), Value::Bool(true))
        );
    }

    #[test]
    fn test_parse_setting_falls_back_to_string() {
        assert_eq!(
            parse_setting("mode=strobe").unwrap(),
            ("mode".to_string(), Value::from("strobe"))
        );
        assert_eq!(
            parse_setting("note=a=b").unwrap(),
            ("note".to_string(), Value::from("a=b"))
        );
    }

    #[test]
    fn test_parse_setting_rejects_missing_separator() {
        assert!(parse_setting("pwm01").is_err());
        assert!(parse_setting("=3").is_err());
    }

    #[test]
    fn test_cli_parses_set_command() {
        let cli = Cli::try_parse_from(["board-link", "--port", "5100", "set", "pwm01=5", "--wait", "0"])
            .unwrap();
        assert_eq!(cli.port, Some(5100));
        match cli.command {
            Commands::Set { settings, wait } => {
                assert_eq!(settings, vec![("pwm01".to_string(), Value::from(5))]);
                assert_eq!(wait, 0);
            }
            _ => panic!("expected set command"),
        }
    }
}
