mod telemetry;

use std::error::Error;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use db_infra::config::db::{MigrationConfig, SingleTierConfig, TargetConfig, TwoTierConfig};
use db_infra::{clean, orchestrate_migration, status, DbInfraError, RunOptions};
use migration::Service;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Command {
    /// Provision (two-tier) and apply every migration
    Up,
    /// Drop the target database and role
    Clean,
    /// Show tables and recorded migrations on the target
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServiceArg {
    NaughtsAndCrosses,
    Draughts,
    AuthServer,
}

impl From<ServiceArg> for Service {
    fn from(arg: ServiceArg) -> Self {
        match arg {
            ServiceArg::NaughtsAndCrosses => Service::NaughtsAndCrosses,
            ServiceArg::Draughts => Service::Draughts,
            ServiceArg::AuthServer => Service::AuthServer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TierArg {
    /// Target credentials only; the database must already exist
    Single,
    /// Admin credentials provision the target first
    Two,
}

#[derive(Debug, Parser)]
#[command(name = "migrate")]
#[command(about = "Provision a service database and apply its migrations")]
struct Args {
    /// Command to run
    #[arg(value_enum, default_value_t = Command::Up)]
    command: Command,

    /// Service whose migrations to apply
    #[arg(short, long, value_enum, env = "MIGRATE_SERVICE")]
    service: ServiceArg,

    /// Credential layout
    #[arg(short, long, value_enum, env = "MIGRATE_TIER", default_value_t = TierArg::Two)]
    tier: TierArg,
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // --help and --version land here too
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    let service = Service::from(args.service);
    match run(&args, service, &cancel).await {
        Ok(()) => {
            info!("migrate=complete service={} command={:?}", service.name(), args.command);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log_error_chain(service, &e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args, service: Service, cancel: &CancellationToken) -> Result<(), DbInfraError> {
    let options = RunOptions::from_env()?;
    let migrations = service.migrations().to_vec();

    match args.command {
        Command::Up => {
            let config = match args.tier {
                TierArg::Single => MigrationConfig::SingleTier(SingleTierConfig::from_env(migrations)?),
                TierArg::Two => MigrationConfig::TwoTier(TwoTierConfig::from_env(migrations)?),
            };
            let outcome = orchestrate_migration(&config, &options, cancel).await?;
            if let Some(report) = outcome.provision {
                info!(
                    role_created = report.role_created,
                    database_created = report.database_created,
                    "Provisioning finished"
                );
            }
            info!(
                applied = outcome.run.applied.len(),
                skipped = outcome.run.skipped.len(),
                "Migrations finished"
            );
        }
        Command::Clean => {
            if args.tier == TierArg::Single {
                return Err(DbInfraError::config(
                    "clean needs admin credentials; run it with --tier two",
                ));
            }
            let config = TwoTierConfig::from_env(Vec::new())?;
            clean(&config.admin, &config.target, &options, cancel).await?;
        }
        Command::Status => {
            let target = TargetConfig::from_env()?;
            let found = status(&target, &options, cancel).await?;
            info!(
                service = service.name(),
                registry = migrations.len(),
                tables = ?found.tables,
                "Target status"
            );
            match found.ledger {
                Some(entries) => {
                    for entry in entries {
                        info!(
                            id = entry.id,
                            name = %entry.name,
                            checksum = %entry.checksum,
                            applied_at = %entry.applied_at,
                            "Recorded migration"
                        );
                    }
                }
                None => info!("No migration ledger on target"),
            }
        }
    }

    Ok(())
}

fn log_error_chain(service: Service, err: &DbInfraError) {
    match err.migration_index() {
        Some(index) => error!(
            "migrate=failed service={} index={} error={}",
            service.name(),
            index,
            err
        ),
        None => error!("migrate=failed service={} error={}", service.name(), err),
    }

    let mut source = err.source();
    while let Some(cause) = source {
        error!("caused_by={cause}");
        source = cause.source();
    }
}

/// Cancel `cancel` on Ctrl-C or SIGTERM so the in-flight migration rolls back.
fn cancel_on_shutdown(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, cancelling");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults_to_up() {
        let args = Args::try_parse_from(["migrate", "--service", "draughts", "--tier", "two"]).unwrap();
        assert_eq!(args.command, Command::Up);
        assert_eq!(Service::from(args.service), Service::Draughts);
    }

    #[test]
    fn test_parses_command_and_tier() {
        let args = Args::try_parse_from([
            "migrate",
            "status",
            "--service",
            "naughts-and-crosses",
            "--tier",
            "single",
        ])
        .unwrap();
        assert_eq!(args.command, Command::Status);
        assert_eq!(args.tier, TierArg::Single);
        assert_eq!(Service::from(args.service), Service::NaughtsAndCrosses);
    }

    #[test]
    fn test_service_names_match_registry() {
        for service in Service::ALL {
            let args = Args::try_parse_from(["migrate", "--service", service.name()]).unwrap();
            assert_eq!(Service::from(args.service), service);
        }
    }

    #[test]
    fn test_unknown_command_is_usage_error() {
        let err = Args::try_parse_from(["migrate", "sideways", "--service", "draughts"]).unwrap_err();
        assert!(err.use_stderr());
    }
}
