use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use ustr::Ustr;

use crate::{
    feed::{FetchError, Vehicle, VehicleBatch},
    model::*,
};

/// Resolves a vehicle's service tag to a service id.
///
/// Lookups are scoped to the vehicle's route first. Tags that are unknown on the route
/// fall back to the agency-wide table. When several routes share a tag, the agency-wide
/// entry belongs to the route whose tag sorts first.
#[derive(Debug, Default)]
pub struct ServiceTable {
    by_route: HashMap<(RouteTag, Option<ServiceTag>), ServiceId>,
    agency_wide: HashMap<ServiceTag, ServiceId>,
    routes: Vec<RouteRef>,
}

impl ServiceTable {
    pub fn new(entries: impl IntoIterator<Item = ServiceEntry>) -> Self {
        let mut entries: Vec<ServiceEntry> = entries.into_iter().collect();
        entries.sort_by(|a, b| {
            a.route_tag
                .as_str()
                .cmp(b.route_tag.as_str())
                .then_with(|| {
                    let a_tag = a.tag.as_ref().map(|tag| tag.as_str());
                    let b_tag = b.tag.as_ref().map(|tag| tag.as_str());
                    a_tag.cmp(&b_tag)
                })
        });

        let mut table = ServiceTable::default();
        for entry in entries {
            let route = RouteRef {
                id: entry.route_id,
                tag: entry.route_tag,
            };
            if table.routes.last() != Some(&route) {
                table.routes.push(route);
            }
            table
                .by_route
                .entry((entry.route_tag, entry.tag))
                .or_insert(entry.id);
            if let Some(tag) = entry.tag {
                table.agency_wide.entry(tag).or_insert(entry.id);
            }
        }
        table
    }

    /// Routes that have at least one service, ordered by route tag.
    pub fn routes(&self) -> &[RouteRef] {
        &self.routes
    }

    /// A missing tag resolves to the route's "no active service" row.
    pub fn resolve(&self, route: RouteTag, dir_tag: Option<&str>) -> Option<ServiceId> {
        let Some(dir_tag) = dir_tag.filter(|tag| !tag.is_empty()) else {
            return self.by_route.get(&(route, None)).copied();
        };
        // Tags that were never interned cannot belong to any service.
        let tag = ServiceTag(Ustr::from_existing(dir_tag)?);
        self.by_route
            .get(&(route, Some(tag)))
            .or_else(|| self.agency_wide.get(&tag))
            .copied()
    }
}

/// The request time of a route's last successful vehicle poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Watermark {
    #[default]
    Never,
    /// Epoch milliseconds returned by the feed.
    Known(i64),
    /// The last poll succeeded but did not report its request time.
    Unknown,
}

impl Watermark {
    /// Value for the feed's "since" parameter.
    pub fn since(&self) -> i64 {
        match self {
            Watermark::Known(time) => *time,
            Watermark::Never | Watermark::Unknown => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermarks(HashMap<RouteTag, Watermark>);

impl Watermarks {
    pub fn get(&self, route: RouteTag) -> Watermark {
        self.0.get(&route).copied().unwrap_or_default()
    }

    pub fn set(&mut self, route: RouteTag, watermark: Watermark) {
        self.0.insert(route, watermark);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    UnresolvedService {
        route: RouteTag,
        vehicle: String,
        dir_tag: Option<String>,
    },
    InvalidPosition {
        route: RouteTag,
        vehicle: String,
    },
    InvalidReportAge {
        route: RouteTag,
        vehicle: String,
    },
    MissingRequestTime {
        route: RouteTag,
    },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::UnresolvedService {
                route,
                vehicle,
                dir_tag,
            } => write!(
                f,
                "vehicle {} on route {}: service tag {:?} is unknown for this agency",
                vehicle, route, dir_tag
            ),
            Diagnostic::InvalidPosition { route, vehicle } => {
                write!(f, "vehicle {} on route {}: unusable position", vehicle, route)
            }
            Diagnostic::InvalidReportAge { route, vehicle } => {
                write!(f, "vehicle {} on route {}: unusable report age", vehicle, route)
            }
            Diagnostic::MissingRequestTime { route } => {
                write!(f, "route {}: feed did not report its request time", route)
            }
        }
    }
}

#[derive(Debug)]
pub struct RouteMerge {
    pub rows: Vec<VehicleLocationRow>,
    pub diagnostics: Vec<Diagnostic>,
    pub watermark: Watermark,
}

/// Turns one route's vehicle batch into location rows.
pub fn merge_route_batch(
    services: &ServiceTable,
    route: RouteTag,
    batch: &VehicleBatch,
    now: DateTime<Utc>,
) -> RouteMerge {
    let mut diagnostics = vec![];
    let request_time = batch
        .request_time
        .as_deref()
        .and_then(|time| time.trim().parse::<i64>().ok())
        .and_then(|millis| DateTime::from_timestamp_millis(millis).map(|time| (millis, time)));
    let (reference_time, watermark) = match request_time {
        Some((millis, time)) => (time, Watermark::Known(millis)),
        None => {
            diagnostics.push(Diagnostic::MissingRequestTime { route });
            (now.trunc_subsecs(0), Watermark::Unknown)
        }
    };

    let mut rows = vec![];
    for vehicle in &batch.vehicles {
        match vehicle_row(services, route, vehicle, reference_time) {
            Ok(row) => rows.push(row),
            Err(diagnostic) => diagnostics.push(diagnostic),
        }
    }

    RouteMerge {
        rows,
        diagnostics,
        watermark,
    }
}

fn vehicle_row(
    services: &ServiceTable,
    route: RouteTag,
    vehicle: &Vehicle,
    reference_time: DateTime<Utc>,
) -> Result<VehicleLocationRow, Diagnostic> {
    let service_id = services
        .resolve(route, vehicle.dir_tag.as_deref())
        .ok_or_else(|| Diagnostic::UnresolvedService {
            route,
            vehicle: vehicle.id.clone(),
            dir_tag: vehicle.dir_tag.clone(),
        })?;

    let location = match (
        parse_finite(vehicle.longitude.as_deref()),
        parse_finite(vehicle.latitude.as_deref()),
    ) {
        (Some(longitude), Some(latitude)) => Point::new(longitude, latitude),
        _ => {
            return Err(Diagnostic::InvalidPosition {
                route,
                vehicle: vehicle.id.clone(),
            })
        }
    };

    let observed_at = vehicle
        .secs_since_report
        .as_deref()
        .and_then(|secs| secs.trim().parse::<i64>().ok())
        .and_then(Duration::try_seconds)
        .and_then(|age| reference_time.checked_sub_signed(age))
        .ok_or_else(|| Diagnostic::InvalidReportAge {
            route,
            vehicle: vehicle.id.clone(),
        })?;

    Ok(VehicleLocationRow {
        service_id,
        vehicle_tag: vehicle.id.clone(),
        location,
        heading: parse_finite(vehicle.heading.as_deref())
            .filter(|heading| (0.0..=360.0).contains(heading)),
        speed: parse_finite(vehicle.speed.as_deref()).filter(|speed| *speed >= 0.0),
        observed_at,
        is_predictable: vehicle.predictable.as_deref() == Some("true"),
    })
}

fn parse_finite(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// The result of one route's fetch within a polling cycle.
#[derive(Debug)]
pub struct RouteOutcome {
    pub route: RouteRef,
    pub result: Result<VehicleBatch, FetchError>,
}

#[derive(Debug)]
pub struct RouteFailure {
    pub route: RouteTag,
    pub error: FetchError,
}

#[derive(Debug, Default)]
pub struct CycleMerge {
    pub rows: Vec<VehicleLocationRow>,
    pub diagnostics: Vec<Diagnostic>,
    pub failures: Vec<RouteFailure>,
}

/// Merges all route outcomes of a polling cycle in the given order.
///
/// Successful routes replace their watermark, failed routes keep it. Rows sharing
/// (service, vehicle, observed_at) keep only the first one.
pub fn merge_cycle(
    services: &ServiceTable,
    outcomes: Vec<RouteOutcome>,
    watermarks: &mut Watermarks,
    now: DateTime<Utc>,
) -> CycleMerge {
    let mut cycle = CycleMerge::default();
    let mut seen = HashSet::new();

    for outcome in outcomes {
        match outcome.result {
            Ok(batch) => {
                let merged = merge_route_batch(services, outcome.route.tag, &batch, now);
                watermarks.set(outcome.route.tag, merged.watermark);
                cycle.diagnostics.extend(merged.diagnostics);
                for row in merged.rows {
                    if seen.insert((row.service_id, row.vehicle_tag.clone(), row.observed_at)) {
                        cycle.rows.push(row);
                    }
                }
            }
            Err(error) => cycle.failures.push(RouteFailure {
                route: outcome.route.tag,
                error,
            }),
        }
    }
    cycle
}
