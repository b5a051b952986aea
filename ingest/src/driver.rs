use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use chrono_tz::Tz;

use crate::{
    config::{PollConfig, RunConfig},
    feed::FeedClient,
    merge::Watermarks,
    model::AgencyTag,
    poll,
    refresh::{self, RefreshSummary},
    store::Gateway,
};

/// Delay between vehicle polls. Doubles after each failed cycle, capped at ten intervals.
#[derive(Debug, Clone)]
pub struct Backoff {
    interval: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(interval: Duration) -> Self {
        Backoff {
            interval,
            current: interval,
        }
    }

    pub fn delay(&self) -> Duration {
        self.current
    }

    pub fn succeeded(&mut self) {
        self.current = self.interval;
    }

    pub fn failed(&mut self) {
        self.current = (self.current * 2).min(self.interval * 10);
    }
}

pub fn local_date(now: DateTime<Utc>, timezone: Tz) -> NaiveDate {
    now.with_timezone(&timezone).date_naive()
}

/// Runs a full agency refresh, trying up to `tries` times.
pub async fn refresh_with_retries<F: FeedClient, G: Gateway>(
    feed: &F,
    gateway: &G,
    agency: AgencyTag,
    settings: &PollConfig,
    tries: u32,
) -> Result<RefreshSummary> {
    let mut last_error = None;
    for attempt in 1..=tries.max(1) {
        let observed_at = Utc::now().trunc_subsecs(0);
        match refresh::refresh_agency(feed, gateway, agency, settings, observed_at).await {
            Ok(summary) => return Ok(summary),
            Err(err) => {
                log::warn!("Refresh attempt {}/{} failed: {:#}", attempt, tries, err);
                last_error = Some(err);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("no refresh attempt was made"))
        .context(format!("refreshing {} failed after {} tries", agency, tries)))
}

pub fn load_watermarks(path: &Path) -> Result<Watermarks> {
    if !path.exists() {
        return Ok(Watermarks::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading watermarks from {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("parsing watermarks in {:?}", path))
}

pub fn save_watermarks(path: &Path, watermarks: &Watermarks) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, serde_json::to_string_pretty(watermarks)?)
        .with_context(|| format!("writing watermarks to {:?}", tmp_path))?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Polls vehicles until the local date changes, then returns.
pub async fn poll_until_midnight<F: FeedClient, G: Gateway>(
    feed: &F,
    gateway: &G,
    config: &RunConfig,
    watermarks: &mut Watermarks,
) {
    let today = local_date(Utc::now(), config.timezone);
    let mut backoff = Backoff::new(config.poll_interval);
    while local_date(Utc::now(), config.timezone) == today {
        tokio::time::sleep(backoff.delay()).await;
        match poll::poll_vehicles(feed, gateway, config.agency, watermarks, &config.poll).await {
            Ok(report) if report.all_failed() => {
                backoff.failed();
                log::warn!(
                    "All {} routes failed, next poll in {:?}.",
                    report.routes,
                    backoff.delay()
                );
            }
            Ok(report) => {
                log::info!(
                    "Inserted {} of {} vehicle locations from {} routes ({} failed, {} unresolved).",
                    report.inserted,
                    report.rows,
                    report.routes,
                    report.failures.len(),
                    report.unresolved
                );
                backoff.succeeded();
            }
            Err(err) => {
                backoff.failed();
                log::error!("Vehicle poll failed, next poll in {:?}: {:#}", backoff.delay(), err);
            }
        }
        if let Some(path) = &config.state_file {
            if let Err(err) = save_watermarks(path, watermarks) {
                log::error!("Could not save watermarks: {:#}", err);
            }
        }
    }
}

/// Refreshes the agency once per local day and polls vehicles in between. Never returns
/// unless the agency list cannot be loaded at startup.
pub async fn run_forever<F: FeedClient, G: Gateway>(
    feed: &F,
    gateway: &G,
    config: &RunConfig,
) -> Result<()> {
    refresh::update_agencies(feed, gateway).await?;
    let mut watermarks = match &config.state_file {
        Some(path) => load_watermarks(path)?,
        None => Watermarks::default(),
    };
    loop {
        match refresh_with_retries(feed, gateway, config.agency, &config.poll, config.refresh_tries)
            .await
        {
            Ok(summary) => log::info!("Refreshed {}: {:?}", config.agency, summary),
            Err(err) => log::error!("{:#}", err),
        }
        poll_until_midnight(feed, gateway, config, &mut watermarks).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        merge::Watermark,
        model::RouteTag,
        testing::{direction, route_config, stop, FakeFeed, FakeGateway},
    };
    use chrono::TimeZone;

    #[test]
    fn backoff_doubles_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(15));
        backoff.failed();
        assert_eq!(backoff.delay(), Duration::from_secs(30));
        for _ in 0..10 {
            backoff.failed();
        }
        assert_eq!(backoff.delay(), Duration::from_secs(150));
        backoff.succeeded();
        assert_eq!(backoff.delay(), Duration::from_secs(15));
    }

    #[test]
    fn local_date_follows_timezone() {
        let now = Utc.with_ymd_and_hms(2025, 1, 12, 5, 0, 0).unwrap();
        assert_eq!(
            local_date(now, chrono_tz::America::Los_Angeles),
            NaiveDate::from_ymd_opt(2025, 1, 11).unwrap()
        );
        assert_eq!(
            local_date(now, chrono_tz::Europe::Berlin),
            NaiveDate::from_ymd_opt(2025, 1, 12).unwrap()
        );
    }

    #[tokio::test]
    async fn refresh_gives_up_after_all_tries() {
        let feed = FakeFeed::default().with_routes(&["N"]);
        let gateway = FakeGateway::default();
        let settings = PollConfig::new(1, Duration::from_secs(5));
        let result = refresh_with_retries(&feed, &gateway, AgencyTag::new("sf-muni"), &settings, 3).await;
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("after 3 tries"), "{}", message);
    }

    #[tokio::test]
    async fn refresh_succeeds_with_complete_feed() {
        let feed = FakeFeed::default()
            .with_routes(&["N"])
            .with_config("N", route_config(vec![stop("1", 1.0, 1.0)], vec![direction("N_OUT", &["1"])]));
        let gateway = FakeGateway::default();
        let settings = PollConfig::new(1, Duration::from_secs(5));
        let summary = refresh_with_retries(&feed, &gateway, AgencyTag::new("sf-muni"), &settings, 3)
            .await
            .unwrap();
        assert_eq!(summary.routes, 1);
    }

    #[tokio::test]
    async fn agency_list_is_upserted() {
        let feed = FakeFeed::default()
            .with_agency("sf-muni", "San Francisco Muni")
            .with_agency("", "Tagless");
        let gateway = FakeGateway::default();
        assert_eq!(refresh::update_agencies(&feed, &gateway).await.unwrap(), 1);
        assert_eq!(gateway.state().agencies[0].name, "San Francisco Muni");
    }

    #[tokio::test]
    async fn repeated_agency_tags_are_upserted_once() {
        let feed = FakeFeed::default()
            .with_agency("ttc", "Toronto Transit Commission")
            .with_agency("ttc", "TTC again");
        let gateway = FakeGateway::default();
        assert_eq!(refresh::update_agencies(&feed, &gateway).await.unwrap(), 1);
        let state = gateway.state();
        assert_eq!(state.agencies.len(), 1);
        assert_eq!(state.agencies[0].name, "Toronto Transit Commission");
    }

    #[test]
    fn watermarks_survive_a_restart() {
        let dir = std::env::temp_dir().join(format!("nextbus-ingest-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("watermarks.json");

        assert_eq!(load_watermarks(&path).unwrap(), Watermarks::default());
        let mut watermarks = Watermarks::default();
        watermarks.set(RouteTag::new("N"), Watermark::Known(1_485_294_755_416));
        save_watermarks(&path, &watermarks).unwrap();
        assert_eq!(load_watermarks(&path).unwrap(), watermarks);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
