//! Lockstep Migration CLI Tool
//!
//! Applies, rolls back and reports versioned SQL migrations. Exit codes:
//! 0 success, 1 failure, 2 usage error, 75 migrations already running elsewhere.

use anyhow::Context;
use clap::{CommandFactory, Parser};
use colored::Colorize;
use lockstep::connection::{connect_checked, redact_connection_string};
use lockstep::{MigrateConfig, MigrationSource, Migrator, PgSession};
use lockstep_migrate::cli::{Cli, Commands, RunOptions};
use lockstep_migrate::commands::{self, EXIT_SUCCESS, EXIT_USAGE};
use std::path::Path;
use std::process;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // Help and version exit 0; usage errors exit 2
        Err(e) => e.exit(),
    };

    let Some(command) = cli.command else {
        eprintln!("{}", Cli::command().render_usage());
        eprintln!("\nCommands: migrate, rollback, status");
        process::exit(EXIT_USAGE);
    };

    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_filter())).init();

    let result = load_options(&cli).and_then(|options| execute(command, &options));
    write_metrics(cli.metrics_file.as_deref());

    match result {
        Ok(()) => process::exit(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("{} {:#}", "❌ Error:".red().bold(), e);
            process::exit(commands::exit_code(&e));
        }
    }
}

fn load_options(cli: &Cli) -> anyhow::Result<RunOptions> {
    let config = MigrateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let options = cli.resolve(&config, std::env::var("DATABASE_URL").ok())?;
    log::debug!(
        "Using database {} and migrations in {}",
        redact_connection_string(&options.database_url),
        options.migrations_dir.display()
    );
    Ok(options)
}

fn execute(command: Commands, options: &RunOptions) -> anyhow::Result<()> {
    let client = connect_checked(&options.database_url).with_context(|| {
        format!(
            "Could not connect to {}",
            redact_connection_string(&options.database_url)
        )
    })?;
    let session = PgSession::new(client);
    let source = MigrationSource::from_dir(&options.migrations_dir);
    let migrator = Migrator::new(&session, &source, &options.settings);

    let stdout = std::io::stdout();
    commands::run(command, &migrator, &mut stdout.lock())
}

#[cfg(feature = "metrics")]
fn write_metrics(path: Option<&Path>) {
    let Some(path) = path else {
        return;
    };
    let written = lockstep::metrics::render()
        .map_err(anyhow::Error::from)
        .and_then(|text| std::fs::write(path, text).map_err(anyhow::Error::from));
    if let Err(e) = written {
        log::warn!("Failed to write metrics to {}: {}", path.display(), e);
    }
}

#[cfg(not(feature = "metrics"))]
fn write_metrics(path: Option<&Path>) {
    if let Some(path) = path {
        log::warn!(
            "Built without metrics support; not writing {}",
            path.display()
        );
    }
}
