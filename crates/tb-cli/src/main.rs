//! TimeBlocker CLI
//!
//! Manage a TimeBlocker state file, check hostnames against it and replay
//! recorded browser events through the background service.

mod replay;
mod store;

use std::fs;
use std::future::Future;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use tb_core::{
    BackgroundService, BrowserEvent, Clock, Decision, ManualClock, Message, Millis, Overview,
    Presenter, Reply, SystemClock, TabId, ThresholdContext, TrackedWebsite, TrackerConfig,
};
use tb_core::types::MS_PER_MINUTE;

use crate::store::JsonFileStore;

#[derive(Parser)]
#[command(name = "tb-cli")]
#[command(about = "TimeBlocker state management and tools")]
struct Cli {
    /// State file (same keys as the extension's storage)
    #[arg(long, global = true, default_value = "timeblocker.json")]
    state: String,

    /// Configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<String>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage permanently blocked sites
    Block {
        #[command(subcommand)]
        action: BlockAction,
    },

    /// Manage websites with a daily time limit
    Track {
        #[command(subcommand)]
        action: TrackAction,
    },

    /// Switch blocking and tracking on or off
    Toggle {
        #[arg(value_enum)]
        state: Switch,
    },

    /// Decide what happens to a hostname
    Check {
        hostname: String,

        /// Evaluate at this time (epoch milliseconds) instead of now
        #[arg(long)]
        at: Option<Millis>,

        /// Use the popup list warning band instead of the overlay one
        #[arg(long)]
        list: bool,
    },

    /// Record time spent on a tracked website, ending now (or at --at)
    Record {
        domain: String,
        minutes: u32,

        #[arg(long)]
        at: Option<Millis>,
    },

    /// Show the overview
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay browser events (JSON lines) through the background service
    Replay {
        /// Event log file
        events: String,
    },
}

#[derive(Subcommand)]
enum BlockAction {
    Add { site: String },
    Remove { site: String },
    List,
}

#[derive(Subcommand)]
enum TrackAction {
    Add {
        domain: String,
        /// Daily limit in minutes
        minutes: u32,
    },
    Remove {
        domain: String,
    },
    /// Zero today's time for a website
    Reset {
        domain: String,
    },
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = load_config(cli.config.as_deref()).and_then(|config| {
        let ctx = Context {
            state: cli.state,
            config,
        };
        match cli.command {
            Commands::Block { action } => cmd_block(&ctx, action),
            Commands::Track { action } => cmd_track(&ctx, action),
            Commands::Toggle { state } => cmd_message(
                &ctx,
                None,
                Message::ToggleExtension {
                    enabled: matches!(state, Switch::On),
                },
            ),
            Commands::Check { hostname, at, list } => cmd_check(&ctx, &hostname, at, list),
            Commands::Record { domain, minutes, at } => cmd_record(&ctx, &domain, minutes, at),
            Commands::Status { json } => cmd_status(&ctx, json),
            Commands::Replay { events } => replay::run_replay(&ctx, &events),
        }
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn load_config(path: Option<&str>) -> Result<TrackerConfig, String> {
    let Some(path) = path else {
        return Ok(TrackerConfig::default());
    };
    let text = fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path, e))?;
    TrackerConfig::from_json_str(&text).map_err(|e| format!("Invalid config '{}': {}", path, e))
}

// =============================================================================
// Service Plumbing
// =============================================================================

pub(crate) struct Context {
    pub state: String,
    pub config: TrackerConfig,
}

pub(crate) type Service = BackgroundService<JsonFileStore, PrintPresenter, Arc<ManualClock>>;

/// Prints what the extension would do to its tabs.
pub(crate) struct PrintPresenter;

impl Presenter for PrintPresenter {
    fn redirect_tab(&self, tab_id: TabId, url: &str) {
        println!("tab {}: redirect to {}", tab_id, url);
    }

    fn notify(&self, tab_id: TabId, decision: &Decision) {
        println!("tab {}: {}", tab_id, describe_decision(decision));
    }
}

pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output, String> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;
    Ok(runtime.block_on(future))
}

/// Start the service on the state file with its clock at `at` (or now).
pub(crate) async fn open(ctx: &Context, at: Option<Millis>) -> (Service, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(at.unwrap_or_else(|| SystemClock.now())));
    let service = BackgroundService::start(
        JsonFileStore::new(&ctx.state),
        PrintPresenter,
        clock.clone(),
        ctx.config.clone(),
    )
    .await;
    (service, clock)
}

/// Send one message and wait for its writes. A rejection becomes an error.
fn send(ctx: &Context, at: Option<Millis>, message: Message) -> Result<Reply, String> {
    block_on(async {
        let (service, _) = open(ctx, at).await;
        let reply = service.handle_message(&message).await;
        service.shutdown().await;
        reply
    })
    .and_then(|reply| match reply {
        Reply::Rejected { reason } => Err(reason),
        other => Ok(other),
    })
}

fn overview(ctx: &Context) -> Result<Overview, String> {
    match send(ctx, None, Message::GetOverview)? {
        Reply::Overview { overview } => Ok(overview),
        other => Err(format!("Unexpected reply: {:?}", other)),
    }
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_message(ctx: &Context, at: Option<Millis>, message: Message) -> Result<(), String> {
    match send(ctx, at, message)? {
        Reply::Website { website } => println!("{}", describe_website(&website)),
        Reply::Decision { decision } => println!("{}", describe_decision(&decision)),
        _ => println!("OK"),
    }
    Ok(())
}

fn cmd_block(ctx: &Context, action: BlockAction) -> Result<(), String> {
    match action {
        BlockAction::Add { site } => cmd_message(ctx, None, Message::AddBlockedSite { site }),
        BlockAction::Remove { site } => cmd_message(ctx, None, Message::RemoveBlockedSite { site }),
        BlockAction::List => {
            for site in overview(ctx)?.blocked_sites {
                println!("{}", site);
            }
            Ok(())
        }
    }
}

fn cmd_track(ctx: &Context, action: TrackAction) -> Result<(), String> {
    match action {
        TrackAction::Add { domain, minutes } => cmd_message(
            ctx,
            None,
            Message::AddWebsite {
                domain,
                time_limit_minutes: minutes,
            },
        ),
        TrackAction::Remove { domain } => cmd_message(ctx, None, Message::RemoveWebsite { domain }),
        TrackAction::Reset { domain } => cmd_message(ctx, None, Message::ResetWebsite { domain }),
        TrackAction::List => {
            for status in overview(ctx)?.websites {
                println!("{}  [{:?}]", describe_website(&status.website), status.threshold);
            }
            Ok(())
        }
    }
}

fn cmd_check(ctx: &Context, hostname: &str, at: Option<Millis>, list: bool) -> Result<(), String> {
    let context = if list {
        ThresholdContext::List
    } else {
        ThresholdContext::Overlay
    };
    cmd_message(
        ctx,
        at,
        Message::CheckBlocked {
            hostname: hostname.to_string(),
            context,
        },
    )
}

fn cmd_record(ctx: &Context, domain: &str, minutes: u32, at: Option<Millis>) -> Result<(), String> {
    const TAB: TabId = 0;
    let end = at.unwrap_or_else(|| SystemClock.now());
    let start = end - Millis::from(minutes) * MS_PER_MINUTE;
    let events = [
        BrowserEvent::TabNavigatedComplete {
            tab_id: TAB,
            hostname: domain.to_ascii_lowercase(),
            timestamp: start,
        },
        BrowserEvent::TabBecameActive {
            tab_id: TAB,
            timestamp: start,
        },
        BrowserEvent::TabBecameInactive {
            tab_id: TAB,
            timestamp: end,
        },
    ];

    let website = block_on(async {
        let (service, _) = open(ctx, Some(end)).await;
        for event in &events {
            service.handle_event(event).await;
        }
        let website = service
            .snapshot()
            .await
            .budgets
            .lookup(&domain.to_ascii_lowercase())
            .cloned();
        service.shutdown().await;
        website
    })?;

    match website {
        Some(website) => {
            println!("{}", describe_website(&website));
            Ok(())
        }
        None => Err(format!("'{}' is not tracked", domain)),
    }
}

fn cmd_status(ctx: &Context, json: bool) -> Result<(), String> {
    let overview = overview(ctx)?;
    if json {
        let text = serde_json::to_string_pretty(&overview)
            .map_err(|e| format!("Failed to encode overview: {}", e))?;
        println!("{}", text);
        return Ok(());
    }
    print_overview(&overview);
    Ok(())
}

pub(crate) fn print_overview(overview: &Overview) {
    println!(
        "TimeBlocker: {}",
        if overview.enabled { "enabled" } else { "disabled" }
    );
    println!(
        "  Blocked sites:  {} ({} blocks today)",
        overview.blocked_count, overview.today_blocked_count
    );
    println!("  Tracked sites:  {}", overview.websites.len());
    for status in &overview.websites {
        println!(
            "    {:<30} {:>4}/{:<4} min  {:?}",
            status.website.domain,
            status.website.time_spent_minutes,
            status.website.time_limit_minutes,
            status.threshold
        );
    }
}

// =============================================================================
// Formatting
// =============================================================================

fn describe_website(website: &TrackedWebsite) -> String {
    format!(
        "{}: {}/{} min{}",
        website.domain,
        website.time_spent_minutes,
        website.time_limit_minutes,
        if website.is_locked { " (locked)" } else { "" }
    )
}

fn describe_decision(decision: &Decision) -> String {
    match decision {
        Decision::Allow => "allow".to_string(),
        Decision::BlockPermanent { domain } => format!("blocked (permanently, '{}')", domain),
        Decision::BlockTimeExceeded { website } => {
            format!("blocked (time limit reached, {})", describe_website(website))
        }
        Decision::Warn { website } => format!(
            "warning ({} min left, {})",
            website.minutes_remaining(),
            describe_website(website)
        ),
    }
}
