pub mod commands;

use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "leadline",
    about = "Leadline operator CLI",
    long_about = "Operate the Leadline conversation runtime: readiness, migrations, config inspection, \
                  session and threshold administration, and smoke validation.",
    after_help = "Examples:\n  leadline doctor --json\n  leadline threshold show --tenant acme --from seller --to buyer\n  leadline smoke"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Run end-to-end readiness checks with per-check timing details")]
    Smoke,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, model settings, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Inspect or close conversation sessions")]
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    #[command(about = "Inspect or override learned handoff thresholds")]
    Threshold {
        #[command(subcommand)]
        action: ThresholdAction,
    },
    #[command(about = "Record the downstream outcome of a handoff event")]
    Outcome {
        #[arg(long, help = "Handoff event id")]
        event: String,
        #[arg(long, help = "success or failure")]
        outcome: String,
    },
    #[command(about = "Archive sessions past the inactivity window")]
    Archive,
}

#[derive(Debug, Subcommand)]
enum SessionAction {
    #[command(about = "Print the stored session as JSON")]
    Show { id: String },
    #[command(about = "Close a session after a CRM close signal")]
    Close { id: String },
}

#[derive(Debug, Args)]
struct EdgeArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long, help = "Source state: unassigned, seller, buyer, lead")]
    from: String,
    #[arg(long, help = "Target bot: seller, buyer, lead")]
    to: String,
}

#[derive(Debug, Subcommand)]
enum ThresholdAction {
    #[command(about = "Show one edge, or all learned edges for a tenant")]
    Show {
        #[arg(long)]
        tenant: String,
        #[arg(long, requires = "to")]
        from: Option<String>,
        #[arg(long, requires = "from")]
        to: Option<String>,
    },
    #[command(about = "Override an edge threshold (0.0 to 1.0)")]
    Set {
        #[command(flatten)]
        edge: EdgeArgs,
        #[arg(long)]
        value: f64,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Smoke => commands::smoke::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Session { action: SessionAction::Show { id } } => commands::session::show(&id),
        Command::Session { action: SessionAction::Close { id } } => commands::session::close(&id),
        Command::Threshold { action: ThresholdAction::Show { tenant, from, to } } => {
            let edge = from.as_deref().zip(to.as_deref());
            commands::threshold::show(&tenant, edge)
        }
        Command::Threshold { action: ThresholdAction::Set { edge, value } } => {
            commands::threshold::set(&edge.tenant, &edge.from, &edge.to, value)
        }
        Command::Outcome { event, outcome } => commands::outcome::record(&event, &outcome),
        Command::Archive => commands::archive::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
