use std::{path::PathBuf, time::Duration};

use anyhow::{ensure, Result};
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand};

mod config;
mod driver;
mod feed;
mod ids;
mod merge;
mod model;
mod poll;
mod reconcile;
mod refresh;
mod store;
#[cfg(test)]
mod testing;

use config::{DbConfig, FeedConfig, PollConfig, RunConfig};
use feed::NextbusClient;
use model::AgencyTag;
use store::PgGateway;

#[derive(Parser, Debug)]
#[command(name = "nextbus-ingest")]
#[command(about = "Loads NextBus agencies, routes, stops and vehicle locations into PostGIS")]
struct Cli {
    #[command(flatten)]
    db: DbArgs,

    #[command(flatten)]
    feed: FeedArgs,

    /// Log level, RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct DbArgs {
    #[arg(long, env = "PGHOST", default_value = "localhost")]
    db_host: String,

    #[arg(long, env = "PGPORT", default_value_t = 5432)]
    db_port: u16,

    #[arg(long, env = "PGDATABASE")]
    db_name: String,

    #[arg(long, env = "PGUSER")]
    db_user: String,

    /// Falls back to ~/.pgpass when not given
    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    db_password: Option<String>,
}

#[derive(Args, Debug)]
struct FeedArgs {
    #[arg(long, default_value = config::DEFAULT_FEED_URL)]
    feed_url: String,

    /// Seconds before a single feed request is abandoned
    #[arg(long, default_value_t = 30.0)]
    fetch_timeout: f64,

    /// Route requests in flight at once
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
}

#[derive(Args, Debug)]
struct AgencyArgs {
    /// Agency tag, e.g. sf-muni
    #[arg(short, long)]
    agency: String,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    agency: AgencyArgs,

    /// Timezone whose midnight triggers the daily refresh, e.g. America/Los_Angeles
    #[arg(short = 'z', long)]
    timezone: Tz,

    /// Seconds to rest between vehicle polls
    #[arg(short = 'r', long)]
    poll_interval: f64,

    #[arg(long, default_value_t = 10)]
    refresh_tries: u32,

    /// JSON file that keeps route watermarks across restarts
    #[arg(long)]
    state_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RefreshArgs {
    #[command(flatten)]
    agency: AgencyArgs,

    #[arg(long, default_value_t = 10)]
    refresh_tries: u32,
}

#[derive(Args, Debug)]
struct VehiclesArgs {
    #[command(flatten)]
    agency: AgencyArgs,

    #[arg(long)]
    state_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh the agency every day and poll its vehicles until killed
    Run(RunArgs),
    /// Refresh routes, services, stops and stop orders of an agency once
    Refresh(RefreshArgs),
    /// Update the agency list once
    Agencies,
    /// Poll the vehicle locations of an agency once
    Vehicles(VehiclesArgs),
}

fn seconds(value: f64, name: &str) -> Result<Duration> {
    ensure!(
        value.is_finite() && value > 0.0,
        "{} must be a positive number of seconds",
        name
    );
    Ok(Duration::from_secs_f64(value))
}

impl DbArgs {
    fn to_config(&self) -> DbConfig {
        DbConfig {
            host: self.db_host.clone(),
            port: self.db_port,
            name: self.db_name.clone(),
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            max_connections: 4,
        }
    }
}

impl FeedArgs {
    fn to_config(&self) -> Result<FeedConfig> {
        Ok(FeedConfig {
            base_url: self.feed_url.clone(),
            fetch_timeout: seconds(self.fetch_timeout, "--fetch-timeout")?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    simple_logger::SimpleLogger::new()
        .with_level(cli.log_level)
        .env()
        .init()?;

    let feed_config = cli.feed.to_config()?;
    let poll_config = PollConfig::new(cli.feed.concurrency, feed_config.fetch_timeout);
    let feed = NextbusClient::new(&feed_config)?;
    let gateway = PgGateway::connect(&cli.db.to_config()).await?;
    gateway.migrate().await?;

    match cli.command {
        Command::Run(args) => {
            let config = RunConfig {
                agency: AgencyTag::new(&args.agency.agency),
                timezone: args.timezone,
                poll_interval: seconds(args.poll_interval, "--poll-interval")?,
                refresh_tries: args.refresh_tries,
                state_file: args.state_file,
                poll: poll_config,
            };
            driver::run_forever(&feed, &gateway, &config).await?;
        }
        Command::Refresh(args) => {
            let agency = AgencyTag::new(&args.agency.agency);
            refresh::update_agencies(&feed, &gateway).await?;
            let summary = driver::refresh_with_retries(
                &feed,
                &gateway,
                agency,
                &poll_config,
                args.refresh_tries,
            )
            .await?;
            log::info!("Refreshed {}: {:?}", agency, summary);
        }
        Command::Agencies => {
            refresh::update_agencies(&feed, &gateway).await?;
        }
        Command::Vehicles(args) => {
            let agency = AgencyTag::new(&args.agency.agency);
            let mut watermarks = match &args.state_file {
                Some(path) => driver::load_watermarks(path)?,
                None => merge::Watermarks::default(),
            };
            let report =
                poll::poll_vehicles(&feed, &gateway, agency, &mut watermarks, &poll_config).await?;
            log::info!(
                "Inserted {} of {} vehicle locations from {} routes ({} failed, {} unresolved).",
                report.inserted,
                report.rows,
                report.routes,
                report.failures.len(),
                report.unresolved
            );
            if let Some(path) = &args.state_file {
                driver::save_watermarks(path, &watermarks)?;
            }
        }
    }

    Ok(())
}
