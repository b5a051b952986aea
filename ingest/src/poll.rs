use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;

use crate::{
    config::PollConfig,
    feed::{self, FeedClient},
    merge::{self, RouteFailure, RouteOutcome, ServiceTable, Watermarks},
    model::AgencyTag,
    store::Gateway,
};

#[derive(Debug, Default)]
pub struct PollReport {
    pub routes: usize,
    pub rows: usize,
    pub inserted: u64,
    pub unresolved: usize,
    pub failures: Vec<RouteFailure>,
}

impl PollReport {
    /// True when there were routes to poll and none of them could be fetched.
    pub fn all_failed(&self) -> bool {
        self.routes > 0 && self.failures.len() == self.routes
    }
}

/// Polls the vehicle locations of every route of an agency once.
///
/// Route fetches run concurrently, but their outcomes are merged in route order. A route
/// whose fetch fails or times out keeps its watermark and does not stop the others.
/// Watermarks only advance once the cycle's rows are stored.
pub async fn poll_vehicles<F: FeedClient, G: Gateway>(
    feed: &F,
    gateway: &G,
    agency: AgencyTag,
    watermarks: &mut Watermarks,
    settings: &PollConfig,
) -> Result<PollReport> {
    let services = ServiceTable::new(gateway.services(agency).await?);
    let requests: Vec<_> = services
        .routes()
        .iter()
        .map(|route| (*route, watermarks.get(route.tag)))
        .collect();

    let outcomes: Vec<RouteOutcome> = futures::stream::iter(requests)
        .map(|(route, watermark)| async move {
            let result = feed::with_timeout(
                settings.fetch_timeout,
                feed.fetch_vehicle_locations(agency.as_str(), route.tag.as_str(), watermark.since()),
            )
            .await;
            RouteOutcome { route, result }
        })
        .buffered(settings.concurrency)
        .collect()
        .await;

    let routes = outcomes.len();
    let mut staged = watermarks.clone();
    let cycle = merge::merge_cycle(&services, outcomes, &mut staged, Utc::now());
    for diagnostic in &cycle.diagnostics {
        log::warn!("{}", diagnostic);
    }
    for failure in &cycle.failures {
        log::warn!("Skipping route {}: {}", failure.route, failure.error);
    }

    let inserted = if cycle.rows.is_empty() {
        log::debug!("No vehicle locations for {}.", agency);
        0
    } else {
        gateway.insert_vehicle_locations(&cycle.rows).await?
    };
    *watermarks = staged;

    Ok(PollReport {
        routes,
        rows: cycle.rows.len(),
        inserted,
        unresolved: cycle
            .diagnostics
            .iter()
            .filter(|d| matches!(d, merge::Diagnostic::UnresolvedService { .. }))
            .count(),
        failures: cycle.failures,
    })
}
