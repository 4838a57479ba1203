use crate::app::metrics;
use crate::config::Config;
use crate::core::notify::{LogNotifier, Notifier};
use crate::core::{build_workers, Clock, Service, SystemClock};
use crate::exchange::registry::CredentialSource;
use crate::storage::postgres::{PassthroughDecryptor, PostgresCredentialSource, PostgresRepository};
use crate::storage::OrderRepository;
use crate::{Error, Result};
use std::env;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use tracing::info;

pub fn run() -> Result<()> {
    metrics::init_start_time();
    let args: Vec<String> = env::args().collect();
    let cli = parse_args(&args)?;

    if cli.show_help {
        print_usage();
        return Ok(());
    }

    let config = Config::load_or_default(&cli.config_path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Command::Migrate => {
            let repository =
                PostgresRepository::new(&config.storage.postgres_dsn, Arc::clone(&clock));
            repository.ensure_schema()?;
            println!("schema applied");
            Ok(())
        }
        Command::Run => {
            let repository: Arc<dyn OrderRepository> = Arc::new(PostgresRepository::new(
                &config.storage.postgres_dsn,
                Arc::clone(&clock),
            ));
            let credentials: Arc<dyn CredentialSource> = Arc::new(PostgresCredentialSource::new(
                &config.storage.postgres_dsn,
                Arc::new(PassthroughDecryptor),
            ));
            let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

            if cli.once {
                let (engine, reconciler) =
                    build_workers(&config, repository, credentials, notifier, clock)?;
                engine.tick();
                reconciler.sweep();
                metrics::write_if_configured()?;
                return Ok(());
            }

            let _service = Service::start(&config, repository, credentials, notifier, clock)?;
            info!(
                fast_tick_secs = config.engine.fast_tick_secs,
                slow_tick_secs = config.engine.slow_tick_secs,
                "tiller running"
            );
            loop {
                sleep(Duration::from_secs(60));
                metrics::write_if_configured()?;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Run,
    Migrate,
}

struct CliArgs {
    config_path: String,
    command: Command,
    once: bool,
    show_help: bool,
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut config_path = "config.toml".to_string();
    let mut command = Command::Run;
    let mut once = false;
    let mut show_help = false;

    let mut index = 1;
    while index < args.len() {
        match args[index].as_str() {
            "--help" | "-h" => {
                show_help = true;
                index += 1;
            }
            "--config" | "-c" => {
                let value = args
                    .get(index + 1)
                    .ok_or_else(|| Error::new("missing value for --config"))?;
                config_path = value.to_string();
                index += 2;
            }
            "--once" => {
                once = true;
                index += 1;
            }
            "run" => {
                command = Command::Run;
                index += 1;
            }
            "migrate" => {
                command = Command::Migrate;
                index += 1;
            }
            unknown => {
                return Err(Error::new(format!("unknown argument: {unknown}")));
            }
        }
    }

    Ok(CliArgs {
        config_path,
        command,
        once,
        show_help,
    })
}

fn print_usage() {
    println!("usage: tiller [run|migrate] [--config <path>] [--once]");
    println!("  run        Start the trading engine and reconciliation worker (default)");
    println!("  migrate    Apply DB_SCHEMA.sql to the configured database");
    println!("  -c, --config   Path to config.toml (default: config.toml)");
    println!("      --once     Execute a single tick and sweep, then exit");
    println!("  -h, --help     Show this help");
}

#[cfg(test)]
mod tests {
    use super::{parse_args, Command};

    #[test]
    fn parses_defaults() {
        let args = vec!["tiller".to_string()];
        let parsed = parse_args(&args).expect("parse");
        assert_eq!(parsed.config_path, "config.toml");
        assert_eq!(parsed.command, Command::Run);
        assert!(!parsed.once);
        assert!(!parsed.show_help);
    }

    #[test]
    fn parses_overrides() {
        let args = vec![
            "tiller".to_string(),
            "migrate".to_string(),
            "--config".to_string(),
            "custom.toml".to_string(),
            "--once".to_string(),
        ];
        let parsed = parse_args(&args).expect("parse");
        assert_eq!(parsed.config_path, "custom.toml");
        assert_eq!(parsed.command, Command::Migrate);
        assert!(parsed.once);
    }

    #[test]
    fn rejects_unknown_flags() {
        let args = vec!["tiller".to_string(), "--bogus".to_string()];
        assert!(parse_args(&args).is_err());
    }
}
