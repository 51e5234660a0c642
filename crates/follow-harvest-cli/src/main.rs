//! fharvest: enumerate an X following list and run unfollow batches.

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use follow_harvest::{
    CanonicalRecord, FollowingHarvester, HarvestConfig, HarvestEvent, MemberIdentity, Roster,
    RosterFilter, RosterSort, SimMember, VirtualListConfig, VirtualListSurface,
};
use follow_harvest_cli::{
    resolve_config_path, resolve_profile_dir, BrowserOptions, ChromiumSurface, StdioTransport,
};

#[derive(Parser)]
#[command(
    name = "fharvest",
    about = "Enumerate a virtualized following list and run rate-limited unfollow batches",
    version
)]
struct Cli {
    /// Path to a JSON config file.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// DevTools websocket URL of a running, logged-in browser.
    #[arg(long, global = true)]
    connect: Option<String>,

    /// Profile directory for a launched browser.
    #[arg(long, global = true)]
    user_data_dir: Option<String>,

    /// Open `<profile_base>/<handle>/following` after attaching.
    #[arg(long, global = true)]
    handle: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to a browser and serve the JSON protocol over stdio.
    Serve,

    /// Crawl the following list once and print it.
    Load {
        /// Stop after this many members.
        #[arg(long)]
        limit: Option<usize>,

        /// Only members who do not follow back.
        #[arg(long)]
        not_following_back: bool,

        #[arg(long, value_enum, default_value = "discovery")]
        sort: SortArg,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Crawl, then unfollow the given handles or everyone not following back.
    Unfollow {
        handles: Vec<String>,

        #[arg(long)]
        not_following_back: bool,

        /// Crawl limit.
        #[arg(long)]
        limit: Option<usize>,

        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },

    /// Run a crawl against a simulated virtualized list (no browser).
    Simulate {
        #[arg(long, default_value_t = 500)]
        members: usize,

        /// Every K-th member follows back.
        #[arg(long)]
        follow_back_every: Option<usize>,

        /// Only page in data through a "Show more" control.
        #[arg(long)]
        load_more: bool,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   fharvest completions bash > ~/.local/share/bash-completion/completions/fharvest
    ///   fharvest completions zsh > ~/.zfunc/_fharvest
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Discovery,
    FirstSeen,
    LastActivity,
    Handle,
}

impl From<SortArg> for RosterSort {
    fn from(s: SortArg) -> Self {
        match s {
            SortArg::Discovery => RosterSort::Discovery,
            SortArg::FirstSeen => RosterSort::FirstSeenDesc,
            SortArg::LastActivity => RosterSort::LastActivityAsc,
            SortArg::Handle => RosterSort::Identity,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = HarvestConfig::load(config_path.as_deref()).with_context(|| match &config_path {
        Some(p) => format!("failed to load config from {}", p.display()),
        None => "invalid configuration".to_string(),
    })?;

    match &cli.command {
        Commands::Serve => {
            let surface = Arc::new(attach(&cli, &config).await?);
            let harvester = FollowingHarvester::new(surface.clone(), config);
            surface.forward_payloads(harvester.payload_sink());
            StdioTransport::new(harvester, surface).run().await?;
        }

        Commands::Load {
            limit,
            not_following_back,
            sort,
            json,
        } => {
            let surface = Arc::new(attach(&cli, &config).await?);
            let limit = limit.unwrap_or(config.crawl.target_count);
            let mut harvester = FollowingHarvester::new(surface.clone(), config);
            surface.forward_payloads(harvester.payload_sink());

            let roster = crawl_into_roster(&mut harvester, limit).await?;
            let filter = if *not_following_back {
                RosterFilter::NotFollowingBack
            } else {
                RosterFilter::All
            };
            print_records(&roster.view(filter, (*sort).into()), *json)?;
        }

        Commands::Unfollow {
            handles,
            not_following_back,
            limit,
            yes,
        } => {
            if handles.is_empty() && !not_following_back {
                bail!("name handles to unfollow or pass --not-following-back");
            }
            let surface = Arc::new(attach(&cli, &config).await?);
            let limit = limit.unwrap_or(config.crawl.target_count);
            let mut harvester = FollowingHarvester::new(surface.clone(), config);
            surface.forward_payloads(harvester.payload_sink());

            let mut roster = crawl_into_roster(&mut harvester, limit).await?;
            let targets: Vec<MemberIdentity> = if handles.is_empty() {
                roster
                    .view(RosterFilter::NotFollowingBack, RosterSort::Discovery)
                    .into_iter()
                    .map(|r| r.identity.clone())
                    .collect()
            } else {
                handles.iter().map(|h| MemberIdentity::new(h.trim_start_matches('@'))).collect()
            };
            if targets.is_empty() {
                println!("Nothing to unfollow.");
                return Ok(());
            }
            if !yes && !confirm(&format!("Unfollow {} account(s)?", targets.len()))? {
                println!("Aborted.");
                return Ok(());
            }

            let report = harvester.unfollow_report(&targets).await;
            roster.remove(&targets);
            println!(
                "Unfollowed {} account(s); {} remain listed.",
                report.completed,
                roster.len()
            );
            for (identity, reason) in &report.skipped {
                println!("  skipped @{identity}: {reason:?}");
            }
        }

        Commands::Simulate {
            members,
            follow_back_every,
            load_more,
            limit,
            json,
        } => {
            let sim_config = VirtualListConfig {
                requires_load_more: *load_more,
                ..VirtualListConfig::default()
            };
            let surface = Arc::new(VirtualListSurface::new(
                SimMember::generate(*members, *follow_back_every),
                sim_config,
            ));
            let limit = limit.unwrap_or(config.crawl.target_count);
            let mut harvester = FollowingHarvester::new(surface.clone(), config);
            surface.attach_payload_sink(harvester.payload_sink()).await;

            let outcome = harvester.crawl(limit, false).await?;
            if *json {
                print_records(&outcome.records.iter().collect::<Vec<_>>(), true)?;
            } else {
                eprintln!(
                    "Simulated crawl: {} of {} members ({}, {} steps, {} stalls, {:.1}s)",
                    outcome.records.len(),
                    members,
                    outcome.reason,
                    outcome.steps,
                    outcome.stalls,
                    outcome.elapsed.as_secs_f64()
                );
                print_records(&outcome.records.iter().collect::<Vec<_>>(), false)?;
            }
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "fharvest", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn attach(cli: &Cli, config: &HarvestConfig) -> Result<ChromiumSurface> {
    let opts = BrowserOptions {
        connect: cli.connect.clone(),
        chromium_path: None,
        user_data_dir: Some(resolve_profile_dir(cli.user_data_dir.as_deref())),
        start_url: cli
            .handle
            .as_deref()
            .map(|h| format!("{}/following", config.profile_url(h.trim_start_matches('@')))),
    };
    ChromiumSurface::attach(&opts).await
}

/// One fresh crawl with a live counter on stderr.
async fn crawl_into_roster(harvester: &mut FollowingHarvester, limit: usize) -> Result<Roster> {
    let mut events = harvester.subscribe();
    let counter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let HarvestEvent::Progress { count } = event {
                eprint!("\rLoaded {count} …");
            }
        }
    });

    let result = harvester.crawl(limit, false).await;
    counter.abort();
    eprintln!();

    let outcome = result?;
    tracing::info!(
        "loaded {} members ({}) in {:.1}s",
        outcome.records.len(),
        outcome.reason,
        outcome.elapsed.as_secs_f64()
    );
    let mut roster = Roster::new();
    roster.extend(outcome.records);
    Ok(roster)
}

fn print_records(records: &[&CanonicalRecord], json: bool) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if json {
        serde_json::to_writer_pretty(&mut out, records)?;
        writeln!(out)?;
        return Ok(());
    }
    for r in records {
        writeln!(
            out,
            "@{:<20} {:<30} {:<5} {:<10} {:<10}",
            r.identity,
            truncate(&r.display_name, 30),
            if r.reciprocal { "yes" } else { "no" },
            date(r.first_seen_at),
            date(r.last_activity_at),
        )?;
    }
    Ok(())
}

fn date(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(max - 1).collect();
        t.push('…');
        t
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [y/N] ");
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
