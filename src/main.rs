use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ssh_monitor::logging::{init_logging, LogFormat};
use ssh_monitor::model::describe_event;
use ssh_monitor::server::{self, AppState, FilterRequest};
use ssh_monitor::store::{parse_time_bound, DEFAULT_YEAR};
use ssh_monitor::{to_csv, EventCategories, Granularity, LogStore, Pipeline};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_BIND: &str = "0.0.0.0:9357";
const DEFAULT_UI_DIR: &str = "ui/dist";

#[derive(Parser, Debug)]
#[command(
    name = "ssh_monitor",
    version,
    about = "SSH authentication log dashboard"
)]
struct Cli {
    /// CSV export of sshd events
    #[arg(long, global = true, default_value = "datasetssh.csv")]
    data: PathBuf,

    /// Year applied to every timestamp (the log format has none)
    #[arg(long, global = true, default_value_t = DEFAULT_YEAR)]
    year: i32,

    /// Time-series bucket width: hour or day
    #[arg(long, global = true, default_value = "hour")]
    granularity: Granularity,

    /// Event codes counted as failed authentications [default: E9,E10]
    #[arg(long, global = true, value_delimiter = ',')]
    failure_codes: Vec<String>,

    /// Event codes counted as break-in attempts [default: E27]
    #[arg(long, global = true, value_delimiter = ',')]
    intrusion_codes: Vec<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the dashboard API (default)
    Serve {
        #[arg(long, default_value = DEFAULT_BIND)]
        bind: String,

        /// Directory holding the built frontend
        #[arg(long, default_value = DEFAULT_UI_DIR)]
        ui_dir: PathBuf,
    },

    /// Print the dashboard metrics for one filter and optionally export rows
    Report(ReportArgs),
}

#[derive(Args, Debug)]
struct ReportArgs {
    #[arg(long = "event", value_delimiter = ',')]
    events: Vec<String>,

    #[arg(long = "ip", value_delimiter = ',')]
    ips: Vec<String>,

    #[arg(long)]
    top_n: Option<usize>,

    #[arg(long)]
    ip_pattern: Option<String>,

    #[arg(long = "user", value_delimiter = ',')]
    users: Vec<String>,

    /// Range start, e.g. "Dec 10 06:00:00"
    #[arg(long)]
    from: Option<String>,

    /// Range end, e.g. "Dec 10 18:00:00"
    #[arg(long)]
    to: Option<String>,

    /// Write the filtered rows to this CSV file
    #[arg(long)]
    export: Option<PathBuf>,
}

impl Cli {
    fn categories(&self) -> EventCategories {
        let defaults = EventCategories::default();
        EventCategories {
            failure: if self.failure_codes.is_empty() {
                defaults.failure
            } else {
                self.failure_codes.iter().cloned().collect()
            },
            intrusion: if self.intrusion_codes.is_empty() {
                defaults.intrusion
            } else {
                self.intrusion_codes.iter().cloned().collect()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    // A broken dataset stops everything; there is no partial dashboard.
    let store = match LogStore::from_path(&cli.data, cli.year) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, path = %cli.data.display(), "cannot load log data");
            return Err(e).context("failed to load SSH log data");
        }
    };

    let categories = cli.categories();
    info!(
        failure = ?categories.failure,
        intrusion = ?categories.intrusion,
        granularity = %cli.granularity,
        "event categories"
    );

    let command = cli.command.unwrap_or(Command::Serve {
        bind: DEFAULT_BIND.to_string(),
        ui_dir: PathBuf::from(DEFAULT_UI_DIR),
    });

    match command {
        Command::Report(args) => report(&store, Pipeline::new(categories, cli.granularity), &args),
        Command::Serve { bind, ui_dir } => {
            let state = Arc::new(AppState::new(store, categories, cli.granularity));
            server::serve(&bind, state, &ui_dir).await
        }
    }
}

fn report(store: &LogStore, pipeline: Pipeline, args: &ReportArgs) -> Result<()> {
    let bound = |text: &Option<String>| {
        text.as_deref()
            .map(|t| parse_time_bound(t, store.year()))
            .transpose()
    };

    let request = FilterRequest {
        event_ids: args.events.clone(),
        ips: args.ips.clone(),
        top_n: args.top_n,
        ip_pattern: args.ip_pattern.clone(),
        users: args.users.clone(),
        from: bound(&args.from)?,
        to: bound(&args.to)?,
        ..FilterRequest::default()
    };
    let spec = request.to_spec(store)?;
    let result = pipeline.apply(store, &spec);

    if result.is_empty() {
        println!("No events match the selected filters.");
    } else {
        println!(
            "Events:            {} of {} ({:.1}%)",
            result.total,
            store.len(),
            result.coverage(store) * 100.0
        );
        println!("Unique IPs:        {}", result.distinct_ip_count);
        println!("Unique users:      {}", result.distinct_user_count);
        println!(
            "Failed auth:       {} ({:.1}%)",
            result.failed_auth_count,
            result.failed_auth_ratio() * 100.0
        );
        println!("Break-in attempts: {}", result.break_in_count);

        println!("\nTop IPs:");
        for ip in &result.top_ips {
            println!("    {:<18} {}", ip.ip, ip.count);
        }

        println!("\nEvent types:");
        for event in &result.event_type_counts {
            println!(
                "    {:<5} {:<32} {}",
                event.event_id,
                describe_event(&event.event_id),
                event.count
            );
        }

        if let Some(stats) = result.series_stats() {
            println!(
                "\nBusiest {}: {} ({} events), quietest: {} ({}), mean {:.1}",
                pipeline.granularity(),
                stats.busiest.start.format("%d/%m %H:%M"),
                stats.busiest.count,
                stats.quietest.start.format("%d/%m %H:%M"),
                stats.quietest.count,
                stats.mean
            );
        }
    }

    if let Some(path) = &args.export {
        let bytes = to_csv(&result)?;
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(rows = result.total, path = %path.display(), "filtered rows exported");
    }

    Ok(())
}
