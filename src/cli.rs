use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::commands::{self, CommandReport};

/// Exit status for a run stopped by Ctrl+C after a clean checkpoint.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "mailshift: resumable, crash-safe bulk mail migration",
    long_about = None
)]
struct Cli {
    /// Emit JSON output instead of key=value lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Move every item of the source folders into the destination",
        after_help = "EXAMPLES:\n    # One pass over the configured folders\n    mailshift run\n\n    # Machine-readable summary\n    mailshift run --json"
    )]
    Run,

    #[command(
        about = "Show transaction log counts, last run and recent failures",
        after_help = "EXAMPLES:\n    mailshift status\n    mailshift status --json"
    )]
    Status,

    #[command(
        about = "Show the recovery summary written by the last run",
        after_help = "EXAMPLES:\n    mailshift recovery"
    )]
    Recovery,

    #[command(
        about = "Delete the transaction log and recovery summary",
        after_help = "EXAMPLES:\n    # Prompt for confirmation\n    mailshift clear\n\n    # Non-interactive\n    mailshift clear --yes"
    )]
    Clear(ClearArgs),

    #[command(
        about = "Give failed items a fresh attempt budget",
        after_help = "EXAMPLES:\n    # Every failed item\n    mailshift requeue\n\n    # One item\n    mailshift requeue --signature <64-hex>"
    )]
    Requeue(RequeueArgs),

    #[command(
        about = "Delete source copies of items already confirmed in the destination",
        after_help = "EXAMPLES:\n    # After manual-cleanup items were reported\n    mailshift reconcile"
    )]
    Reconcile,
}

#[derive(Args, Debug)]
struct ClearArgs {
    /// Skip the interactive confirmation.
    #[arg(long)]
    yes: bool,
}

#[derive(Args, Debug)]
struct RequeueArgs {
    /// Only requeue the record with this signature.
    #[arg(long)]
    signature: Option<String>,
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("command={} ok={}", report.command, report.ok);
    for detail in &report.details {
        println!("{detail}");
    }
    for issue in &report.issues {
        println!("issue: {issue}");
    }
    Ok(())
}

/// Parse arguments, dispatch, print. Returns the process exit status.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();

    let (report, interrupted) = match &cli.command {
        Commands::Run => {
            let out = commands::run::run()?;
            (out.report, out.interrupted)
        }
        Commands::Status => (commands::status::run()?, false),
        Commands::Recovery => (commands::recovery::run()?, false),
        Commands::Clear(args) => (commands::clear::run(args.yes)?, false),
        Commands::Requeue(args) => (commands::requeue::run(args.signature.as_deref())?, false),
        Commands::Reconcile => (commands::reconcile::run()?, false),
    };

    print_report(&report, cli.json)?;
    if interrupted {
        return Ok(EXIT_INTERRUPTED);
    }
    Ok(if report.ok { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn json_flag_is_global() {
        let cli = Cli::try_parse_from(["mailshift", "clear", "--yes", "--json"]).expect("parse");
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Clear(ClearArgs { yes: true })));
    }
}
