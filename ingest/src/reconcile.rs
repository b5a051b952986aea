use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashMap, HashSet},
};

use crate::{feed, model::*};

/// What one route contributes to stop reconciliation.
#[derive(Debug, Clone, Copy)]
pub struct RouteStops<'a> {
    pub route: RouteRef,
    /// Stops defined with name and position in the route's own config.
    pub explicit: &'a [feed::Stop],
    /// Stop tags the route uses anywhere else, e.g. in direction stop lists.
    pub referenced: &'a BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopRecord {
    pub route_id: RouteId,
    pub tag: StopTag,
    pub name: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

impl StopRecord {
    fn placeholder(route_id: RouteId, tag: StopTag) -> Self {
        StopRecord {
            route_id,
            tag,
            name: None,
            longitude: None,
            latitude: None,
        }
    }

    fn borrowed_from(route_id: RouteId, source: &StopRecord) -> Self {
        StopRecord {
            route_id,
            tag: source.tag,
            name: source.name.clone(),
            longitude: source.longitude,
            latitude: source.latitude,
        }
    }

    pub fn location(&self) -> Option<Point> {
        Point::from_parts(self.longitude, self.latitude)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    #[error("route {route} has a stop without a tag")]
    MissingTag { route: RouteTag },
}

/// Builds exactly one stop record per (route, tag) pair used by the agency's routes.
///
/// Stops a route references without defining are borrowed from another route's
/// definition of the same tag. When several routes define it, the smallest candidate
/// by (tag, longitude, latitude, name, route id) wins, so the result only depends on
/// the input. Tags no route defines become placeholders without name or position.
pub fn reconcile_stops(routes: &[RouteStops]) -> Result<Vec<StopRecord>, ReconcileError> {
    let mut records = vec![];
    let mut present = HashSet::new();

    for route in routes {
        for stop in route.explicit {
            let tag = stop_tag(&stop.tag, route)?;
            if present.insert((route.route.id, tag)) {
                records.push(StopRecord {
                    route_id: route.route.id,
                    tag,
                    name: stop.title.clone(),
                    longitude: stop.longitude,
                    latitude: stop.latitude,
                });
            } else {
                log::debug!("Route {} defines stop {} twice.", route.route.tag, tag);
            }
        }
    }

    let mut missing = vec![];
    for route in routes {
        for raw_tag in route.referenced {
            let tag = stop_tag(raw_tag, route)?;
            if present.insert((route.route.id, tag)) {
                missing.push((route.route.id, tag));
            }
        }
    }

    let synthesized: Vec<StopRecord> = {
        let mut best_by_tag: HashMap<StopTag, &StopRecord> = HashMap::new();
        for record in &records {
            best_by_tag
                .entry(record.tag)
                .and_modify(|best| {
                    if candidate_order(record, *best) == Ordering::Less {
                        *best = record;
                    }
                })
                .or_insert(record);
        }
        missing
            .into_iter()
            .map(|(route_id, tag)| match best_by_tag.get(&tag) {
                Some(source) => StopRecord::borrowed_from(route_id, source),
                None => StopRecord::placeholder(route_id, tag),
            })
            .collect()
    };

    log::debug!(
        "Reconciled {} defined and {} borrowed or placeholder stops.",
        records.len(),
        synthesized.len()
    );
    records.extend(synthesized);
    Ok(records)
}

fn stop_tag(raw: &str, route: &RouteStops) -> Result<StopTag, ReconcileError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ReconcileError::MissingTag {
            route: route.route.tag,
        });
    }
    Ok(StopTag::new(raw))
}

fn candidate_order(a: &StopRecord, b: &StopRecord) -> Ordering {
    a.tag
        .as_str()
        .cmp(b.tag.as_str())
        .then_with(|| compare_coordinate(a.longitude, b.longitude))
        .then_with(|| compare_coordinate(a.latitude, b.latitude))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.route_id.cmp(&b.route_id))
}

// A missing coordinate sorts last, so positioned candidates win.
fn compare_coordinate(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (a, b) => b.is_some().cmp(&a.is_some()),
    }
}
