//! Command handlers and exit codes

use crate::cli::Commands;
use anyhow::Result;
use colored::Colorize;
use lockstep::migration::{LedgerEntry, MigrationError, Migrator};
use std::io::Write;

/// Process exit codes
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
/// `EX_TEMPFAIL`: another run holds the lock; retry later
pub const EXIT_LOCK_BUSY: i32 = 75;

/// Exit code for a failed run
pub fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<MigrationError>() {
        Some(e) if e.is_retryable() => EXIT_LOCK_BUSY,
        _ => EXIT_FAILURE,
    }
}

/// Run `command` and write the operator-facing report to `out`
pub fn run(command: Commands, migrator: &Migrator<'_>, out: &mut dyn Write) -> Result<()> {
    match command {
        Commands::Migrate => handle_migrate(migrator, out),
        Commands::Rollback => handle_rollback(migrator, out),
        Commands::Status { pending } => handle_status(migrator, pending, out),
    }
}

fn handle_migrate(migrator: &Migrator<'_>, out: &mut dyn Write) -> Result<()> {
    let report = migrator.migrate()?;

    if report.is_noop() {
        writeln!(
            out,
            "{} Database is up to date ({} migration(s) already applied)",
            "✅".green(),
            report.skipped
        )?;
        return Ok(());
    }

    for name in &report.applied {
        writeln!(out, "  {} {}", "✓".green(), name)?;
    }
    writeln!(out, "{} Applied {} migration(s)", "✅".green(), report.applied.len())?;
    Ok(())
}

fn handle_rollback(migrator: &Migrator<'_>, out: &mut dyn Write) -> Result<()> {
    match migrator.rollback()? {
        Some(entry) => writeln!(out, "{} Rolled back {}", "✅".green(), entry.name.bold())?,
        None => writeln!(out, "{} No migrations to roll back", "✅".green())?,
    }
    Ok(())
}

fn handle_status(migrator: &Migrator<'_>, show_pending: bool, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "\n📊 {}\n", "Migration Status".bold())?;

    if !show_pending {
        return write_applied(&migrator.status()?, out);
    }

    let status = migrator.overview()?;
    write_applied(&status.applied, out)?;

    writeln!(out)?;
    if status.pending.is_empty() {
        writeln!(out, "{} Pending Migrations: None", "⏳".yellow())?;
    } else {
        writeln!(out, "{} Pending Migrations ({}):", "⏳".yellow(), status.pending_count)?;
        for script in &status.pending {
            let undo = if script.has_undo { "" } else { " (no undo script)" };
            writeln!(out, "  {} {}{}", "⏳".yellow(), script.name, undo.dimmed())?;
        }
    }

    writeln!(
        out,
        "\n📈 Summary: {} total, {} applied, {} pending",
        status.total, status.applied_count, status.pending_count
    )?;
    match (status.latest_applied_version(), status.next_pending_version()) {
        (_, None) => writeln!(out, "{} Database is up to date", "✅".green())?,
        (Some(latest), Some(next)) => writeln!(out, "   Current version {latest}, next {next}")?,
        (None, Some(next)) => writeln!(out, "   No version applied yet, next {next}")?,
    }

    Ok(())
}

fn write_applied(applied: &[LedgerEntry], out: &mut dyn Write) -> Result<()> {
    if applied.is_empty() {
        writeln!(out, "{} Applied Migrations: None", "✅".green())?;
    } else {
        writeln!(out, "{} Applied Migrations ({}):", "✅".green(), applied.len())?;
        for entry in applied {
            writeln!(out, "  {}", format_entry(entry))?;
        }
    }
    Ok(())
}

fn format_entry(entry: &LedgerEntry) -> String {
    format!(
        "{} {} ({})",
        "✓".green(),
        entry.name,
        entry.applied_at.format("%Y-%m-%d %H:%M:%S")
    )
}
