use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};

use crate::{
    config::PollConfig,
    feed::{self, FeedClient},
    ids::{IdTable, ServiceKey, StopKey},
    model::*,
    reconcile::{self, RouteStops, StopRecord},
    store::Gateway,
};

/// A route together with the config fetched for it during a refresh.
#[derive(Debug, Clone)]
pub struct RouteSnapshot {
    pub route: RouteRow,
    pub config: feed::RouteConfig,
}

impl RouteSnapshot {
    fn route_ref(&self) -> RouteRef {
        RouteRef {
            id: self.route.id,
            tag: self.route.tag,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefreshSummary {
    pub routes: usize,
    pub services: usize,
    pub stops: usize,
    pub placeholder_stops: usize,
    pub stop_orders_inserted: u64,
}

pub async fn update_agencies<F: FeedClient, G: Gateway>(feed: &F, gateway: &G) -> Result<usize> {
    let agencies = feed.fetch_agencies().await.context("fetching agency list")?;
    let mut seen = HashSet::new();
    let rows: Vec<AgencyRow> = agencies
        .into_iter()
        .filter(|agency| !agency.tag.is_empty() && seen.insert(agency.tag.clone()))
        .map(|agency| AgencyRow {
            tag: AgencyTag::new(&agency.tag),
            name: agency.title,
            region: agency.region_title,
        })
        .collect();
    gateway.upsert_agencies(&rows).await?;
    log::info!("Upserted {} agencies.", rows.len());
    Ok(rows.len())
}

/// Refreshes the routes, services, stops and stop orders of one agency.
pub async fn refresh_agency<F: FeedClient, G: Gateway>(
    feed: &F,
    gateway: &G,
    agency: AgencyTag,
    settings: &PollConfig,
    observed_at: DateTime<Utc>,
) -> Result<RefreshSummary> {
    log::info!("Refreshing routes of {}.", agency);
    let routes = feed::with_timeout(settings.fetch_timeout, feed.fetch_routes(agency.as_str()))
        .await
        .with_context(|| format!("fetching route list of {}", agency))?;

    let mut route_ids = IdTable::new(gateway.route_ids(agency).await?);
    let mut seen = HashSet::new();
    let route_rows: Vec<RouteRow> = routes
        .into_iter()
        .filter(|route| !route.tag.is_empty() && seen.insert(route.tag.clone()))
        .map(|route| {
            let tag = RouteTag::new(&route.tag);
            RouteRow {
                id: route_ids.resolve(tag),
                agency,
                tag,
                name: route.title,
            }
        })
        .collect();
    gateway.upsert_routes(&route_rows).await?;
    log::info!(
        "Upserted {} routes ({} new).",
        route_rows.len(),
        route_ids.minted()
    );

    let snapshots = fetch_route_configs(feed, agency, route_rows, settings).await?;
    let route_id_list: Vec<RouteId> = snapshots.iter().map(|s| s.route.id).collect();

    let mut service_ids = IdTable::new(gateway.service_ids(&route_id_list).await?);
    let services = service_rows(&snapshots, &mut service_ids);
    gateway.upsert_services(&services).await?;
    log::info!("Upserted {} services.", services.len());

    let records = reconcile_snapshot_stops(&snapshots)?;
    let placeholder_stops = records.iter().filter(|r| r.location().is_none()).count();
    let mut stop_ids = IdTable::new(gateway.stop_ids(&route_id_list).await?);
    let stops = stop_rows(records, &mut stop_ids);
    gateway.upsert_stops(&stops).await?;
    log::info!(
        "Upserted {} stops ({} without position).",
        stops.len(),
        placeholder_stops
    );

    let orders = stop_order_rows(&snapshots, &services, &stops, observed_at);
    let stop_orders_inserted = gateway.insert_service_stop_orders(&orders).await?;
    log::info!(
        "Inserted {} of {} service stop orders.",
        stop_orders_inserted,
        orders.len()
    );

    Ok(RefreshSummary {
        routes: snapshots.len(),
        services: services.len(),
        stops: stops.len(),
        placeholder_stops,
        stop_orders_inserted,
    })
}

async fn fetch_route_configs<F: FeedClient>(
    feed: &F,
    agency: AgencyTag,
    routes: Vec<RouteRow>,
    settings: &PollConfig,
) -> Result<Vec<RouteSnapshot>> {
    let progress = indicatif::ProgressBar::new(routes.len() as u64).with_style(
        indicatif::ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {human_pos:>7}/{human_len:7} {msg}",
        )?,
    );
    progress.set_message("Fetch route configs.");

    let snapshots = futures::stream::iter(routes)
        .map(|route| {
            let progress = &progress;
            async move {
                let config = feed::with_timeout(
                    settings.fetch_timeout,
                    feed.fetch_route_config(agency.as_str(), route.tag.as_str()),
                )
                .await
                .with_context(|| format!("fetching config of route {}", route.tag))?;
                progress.inc(1);
                anyhow::Ok(RouteSnapshot { route, config })
            }
        })
        .buffered(settings.concurrency)
        .try_collect()
        .await;
    progress.finish();
    snapshots
}

/// One service per direction plus each route's "no active service" row.
pub fn service_rows(
    snapshots: &[RouteSnapshot],
    ids: &mut IdTable<ServiceKey, ServiceId>,
) -> Vec<ServiceRow> {
    let mut rows = vec![];
    for snapshot in snapshots {
        let route_id = snapshot.route.id;
        let mut seen = HashSet::new();
        for direction in &snapshot.config.directions {
            if direction.tag.is_empty() {
                log::warn!("Route {} has a direction without a tag.", snapshot.route.tag);
                continue;
            }
            let tag = ServiceTag::new(&direction.tag);
            if !seen.insert(tag) {
                continue;
            }
            rows.push(ServiceRow {
                id: ids.resolve((route_id, Some(tag))),
                route_id,
                tag: Some(tag),
                name: direction.title.clone(),
                direction: direction.name.clone(),
                use_for_ui: direction.use_for_ui,
            });
        }
        rows.push(ServiceRow {
            id: ids.resolve((route_id, None)),
            route_id,
            tag: None,
            name: None,
            direction: None,
            use_for_ui: false,
        });
    }
    rows
}

pub fn reconcile_snapshot_stops(snapshots: &[RouteSnapshot]) -> Result<Vec<StopRecord>> {
    let referenced: Vec<_> = snapshots
        .iter()
        .map(|snapshot| snapshot.config.referenced_stop_tags())
        .collect();
    let inputs: Vec<RouteStops> = snapshots
        .iter()
        .zip(&referenced)
        .map(|(snapshot, referenced)| RouteStops {
            route: snapshot.route_ref(),
            explicit: &snapshot.config.stops,
            referenced,
        })
        .collect();
    Ok(reconcile::reconcile_stops(&inputs)?)
}

pub fn stop_rows(records: Vec<StopRecord>, ids: &mut IdTable<StopKey, StopId>) -> Vec<StopRow> {
    records
        .into_iter()
        .map(|record| {
            let location = record.location();
            StopRow {
                id: ids.resolve(StopKey::new(record.route_id, record.tag, location)),
                route_id: record.route_id,
                tag: record.tag,
                name: record.name,
                location,
            }
        })
        .collect()
}

/// The order of stops along each service, 1-based, as observed at `observed_at`.
pub fn stop_order_rows(
    snapshots: &[RouteSnapshot],
    services: &[ServiceRow],
    stops: &[StopRow],
    observed_at: DateTime<Utc>,
) -> Vec<ServiceStopOrderRow> {
    let service_by_key: HashMap<_, _> = services
        .iter()
        .filter_map(|service| Some(((service.route_id, service.tag?), service.id)))
        .collect();
    let stop_by_key: HashMap<_, _> = stops
        .iter()
        .map(|stop| ((stop.route_id, stop.tag.as_str()), stop.id))
        .collect();

    let mut rows = vec![];
    for snapshot in snapshots {
        let route_id = snapshot.route.id;
        let mut seen = HashSet::new();
        for direction in &snapshot.config.directions {
            let Some(&service_id) =
                service_by_key.get(&(route_id, ServiceTag::new(&direction.tag)))
            else {
                continue;
            };
            if !seen.insert(service_id) {
                continue;
            }
            for (i, stop_tag) in direction.stop_tags.iter().enumerate() {
                match stop_by_key.get(&(route_id, stop_tag.trim())) {
                    Some(&stop_id) => rows.push(ServiceStopOrderRow {
                        service_id,
                        stop_id,
                        order_index: i as i32 + 1,
                        observed_at,
                    }),
                    None => log::debug!(
                        "No stop {} on route {} for service {}.",
                        stop_tag,
                        snapshot.route.tag,
                        direction.tag
                    ),
                }
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{direction, route_config, stop, FakeFeed, FakeGateway};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn snapshot(n: u128, tag: &str, config: feed::RouteConfig) -> RouteSnapshot {
        RouteSnapshot {
            route: RouteRow {
                id: RouteId(Uuid::from_u128(n)),
                agency: AgencyTag::new("sf-muni"),
                tag: RouteTag::new(tag),
                name: None,
            },
            config,
        }
    }

    fn observed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 4, 0, 0).unwrap()
    }

    #[test]
    fn each_route_gets_a_null_service() {
        let snapshots = [snapshot(
            1,
            "N",
            route_config(
                vec![],
                vec![
                    direction("N_OUT", &[]),
                    direction("N_IN", &[]),
                    direction("N_OUT", &[]),
                ],
            ),
        )];
        let mut ids = IdTable::new(HashMap::new());
        let rows = service_rows(&snapshots, &mut ids);
        let tags: Vec<_> = rows
            .iter()
            .map(|row| row.tag.map(|tag| tag.to_string()))
            .collect();
        assert_eq!(
            tags,
            vec![Some("N_OUT".to_string()), Some("N_IN".to_string()), None]
        );
        assert!(!rows[2].use_for_ui);
    }

    #[test]
    fn service_ids_survive_a_second_refresh() {
        let snapshots = [snapshot(1, "N", route_config(vec![], vec![direction("N_OUT", &[])]))];
        let mut ids = IdTable::new(HashMap::new());
        let first = service_rows(&snapshots, &mut ids);
        let existing: HashMap<_, _> = first.iter().map(|row| ((row.route_id, row.tag), row.id)).collect();
        let mut ids = IdTable::new(existing);
        let second = service_rows(&snapshots, &mut ids);
        assert_eq!(first, second);
        assert_eq!(ids.minted(), 0);
    }

    #[test]
    fn stop_orders_follow_direction_lists() {
        let snapshots = [snapshot(
            1,
            "N",
            route_config(
                vec![stop("a", 1.0, 1.0), stop("b", 2.0, 2.0)],
                vec![direction("N_OUT", &["a", "b", "c"]), direction("N_IN", &["c", "a"])],
            ),
        )];
        let mut service_ids = IdTable::new(HashMap::new());
        let services = service_rows(&snapshots, &mut service_ids);
        let records = reconcile_snapshot_stops(&snapshots).unwrap();
        let mut stop_ids = IdTable::new(HashMap::new());
        let stops = stop_rows(records, &mut stop_ids);
        let orders = stop_order_rows(&snapshots, &services, &stops, observed_at());

        let stop_tag = |id: StopId| stops.iter().find(|s| s.id == id).unwrap().tag.to_string();
        let outbound: Vec<_> = orders
            .iter()
            .filter(|o| o.service_id == services[0].id)
            .map(|o| (o.order_index, stop_tag(o.stop_id)))
            .collect();
        assert_eq!(
            outbound,
            vec![(1, "a".to_string()), (2, "b".to_string()), (3, "c".to_string())]
        );
        let inbound: Vec<_> = orders
            .iter()
            .filter(|o| o.service_id == services[1].id)
            .map(|o| (o.order_index, stop_tag(o.stop_id)))
            .collect();
        assert_eq!(inbound, vec![(1, "c".to_string()), (2, "a".to_string())]);
        assert!(orders.iter().all(|o| o.observed_at == observed_at()));
    }

    #[tokio::test]
    async fn refresh_writes_reconciled_rows() {
        let feed = FakeFeed::default()
            .with_routes(&["J", "N"])
            .with_config(
                "J",
                route_config(vec![stop("42", 0.0, 2.0)], vec![direction("J_OUT", &["42"])]),
            )
            .with_config(
                "N",
                route_config(vec![stop("1", 5.0, 5.0)], vec![direction("N_OUT", &["1", "42", "77"])]),
            );
        let gateway = FakeGateway::default();
        let settings = PollConfig::new(2, std::time::Duration::from_secs(5));

        let summary = refresh_agency(&feed, &gateway, AgencyTag::new("sf-muni"), &settings, observed_at())
            .await
            .unwrap();

        assert_eq!(summary.routes, 2);
        assert_eq!(summary.services, 4);
        assert_eq!(summary.stops, 4);
        assert_eq!(summary.placeholder_stops, 1);
        assert_eq!(summary.stop_orders_inserted, 4);

        let state = gateway.state();
        let n_id = state.routes.iter().find(|r| r.tag.as_str() == "N").unwrap().id;
        let borrowed = state
            .stops
            .iter()
            .find(|s| s.route_id == n_id && s.tag.as_str() == "42")
            .unwrap();
        assert_eq!(borrowed.location, Some(Point::new(0.0, 2.0)));
    }

    #[tokio::test]
    async fn second_refresh_reuses_route_ids() {
        let feed = FakeFeed::default()
            .with_routes(&["N"])
            .with_config("N", route_config(vec![stop("1", 5.0, 5.0)], vec![direction("N_OUT", &["1"])]));
        let gateway = FakeGateway::default();
        let settings = PollConfig::new(1, std::time::Duration::from_secs(5));
        let agency = AgencyTag::new("sf-muni");

        refresh_agency(&feed, &gateway, agency, &settings, observed_at()).await.unwrap();
        let first = gateway.state().routes.clone();
        refresh_agency(&feed, &gateway, agency, &settings, observed_at()).await.unwrap();
        let state = gateway.state();
        assert_eq!(state.routes, first);
        assert_eq!(state.services.len(), 2);
        assert_eq!(state.stops.len(), 1);
    }

    #[tokio::test]
    async fn failed_route_config_fails_the_refresh() {
        let feed = FakeFeed::default().with_routes(&["N"]);
        let gateway = FakeGateway::default();
        let settings = PollConfig::new(1, std::time::Duration::from_secs(5));
        let result = refresh_agency(&feed, &gateway, AgencyTag::new("sf-muni"), &settings, observed_at()).await;
        assert!(result.is_err());
        assert!(gateway.state().stops.is_empty());
    }
}
