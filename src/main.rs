use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mender_ci::config::{clamp_retry_limit, Config};
use mender_ci::diagnose::HealingAgent;
use mender_ci::github::GitHubClient;
use mender_ci::orchestrator::{Orchestrator, OrchestratorOptions, RunStatus};

#[derive(Parser, Debug)]
#[command(
    name = "mender",
    about = "Autonomous build-healing agent: clone, test, fix, push, repeat",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Clone a repository, heal its failing tests, and push the fixes
    Run {
        /// Repository URL to heal
        repo_url: String,

        /// Team name recorded in the result (default from TEAM_NAME)
        #[arg(long)]
        team: Option<String>,

        /// Leader name recorded in the result (default from LEADER_NAME)
        #[arg(long)]
        leader: Option<String>,

        /// Maximum heal iterations, clamped to 1-20
        #[arg(short, long)]
        retries: Option<u32>,

        /// Run every pipeline stage except push and CI polling
        #[arg(long)]
        dry_run: bool,
    },
    /// Diagnose recent failed CI runs and apply remediations
    Diagnose {
        /// Only print diagnoses; do not rerun workflows or open issues
        #[arg(long)]
        report_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Run {
            repo_url,
            team,
            leader,
            retries,
            dry_run,
        } => run_pipeline(config, repo_url, team, leader, retries, dry_run).await,
        Commands::Diagnose { report_only } => diagnose_runs(config, report_only).await,
    }
}

async fn run_pipeline(
    config: Config,
    repo_url: String,
    team: Option<String>,
    leader: Option<String>,
    retries: Option<u32>,
    dry_run: bool,
) -> Result<()> {
    let (tx, mut rx) =
        tokio::sync::mpsc::unbounded_channel::<mender_ci::orchestrator::TimelineEntry>();

    let printer = tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            match entry.detail {
                Some(detail) => eprintln!("  [{}] {}", entry.event, detail),
                None => eprintln!("  [{}]", entry.event),
            }
        }
    });

    let orchestrator = Orchestrator::new(config).with_progress(tx);
    let result = orchestrator
        .run(OrchestratorOptions {
            repo_url,
            team_name: team,
            leader_name: leader,
            retry_limit: retries.map(clamp_retry_limit),
            dry_run,
        })
        .await;

    drop(orchestrator);
    let _ = printer.await;

    // Judge lines go to stdout; everything else is stderr.
    for line in &result.formatted_failures {
        println!("{}", line);
    }

    eprintln!();
    eprintln!("Repository:  {}", result.repository);
    eprintln!("Status:      {}", result.status);
    eprintln!("Iterations:  {}", result.iterations);
    eprintln!(
        "Fixes:       {}/{} applied",
        result.total_fixes, result.total_failures
    );
    if let Some(url) = &result.pull_request_url {
        eprintln!("Pull request: {}", url);
    }
    eprintln!("Time:        {}ms", result.time_taken);

    if result.status == RunStatus::Passed {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn diagnose_runs(config: Config, report_only: bool) -> Result<()> {
    let retry_limit = config.retry_limit;
    let github = GitHubClient::new(&config)?;
    let agent = HealingAgent::new(&github, retry_limit);

    let failed = github.failed_runs().await?;
    if failed.is_empty() {
        eprintln!("No failed workflow runs found.");
        return Ok(());
    }

    for run in &failed {
        let diagnosis = agent.diagnose(run).await?;
        eprintln!();
        eprintln!("Run {}: {}", diagnosis.run_id, diagnosis.category);
        eprintln!("{}", diagnosis.summary);
        eprintln!("Suggested fix: {}", diagnosis.suggested_fix);

        if !report_only {
            let outcome = agent.heal(&diagnosis).await;
            for action in &outcome.actions {
                eprintln!("  - {}", action);
            }
            eprintln!(
                "Healing {} after {} attempt(s)",
                if outcome.success { "succeeded" } else { "failed" },
                outcome.attempts
            );
            if let Some(err) = &outcome.error {
                eprintln!("  error: {}", err);
            }
        }
    }

    Ok(())
}
