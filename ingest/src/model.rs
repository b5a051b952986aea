use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ustr::Ustr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgencyTag(pub Ustr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteTag(pub Ustr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceTag(pub Ustr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StopTag(pub Ustr);

macro_rules! tag_impls {
    ($($tag:ident),*) => {
        $(
            impl $tag {
                pub fn new(tag: &str) -> Self {
                    $tag(ustr::ustr(tag))
                }

                pub fn as_str(&self) -> &str {
                    self.0.as_str()
                }
            }

            impl std::fmt::Display for $tag {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.write_str(self.0.as_str())
                }
            }
        )*
    };
}

tag_impls!(AgencyTag, RouteTag, ServiceTag, StopTag);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteId(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StopId(pub Uuid);

/// A WGS84 position. Stored as `geometry(Point, 4326)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub longitude: f64,
    pub latitude: f64,
}

/// Bitwise identity of a point, usable as a hash key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointKey(u64, u64);

impl Point {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Point {
            longitude,
            latitude,
        }
    }

    pub fn from_parts(longitude: Option<f64>, latitude: Option<f64>) -> Option<Self> {
        match (longitude, latitude) {
            (Some(longitude), Some(latitude)) => Some(Point::new(longitude, latitude)),
            _ => None,
        }
    }

    pub fn key(&self) -> PointKey {
        PointKey(self.longitude.to_bits(), self.latitude.to_bits())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgencyRow {
    pub tag: AgencyTag,
    pub name: String,
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteRow {
    pub id: RouteId,
    pub agency: AgencyTag,
    pub tag: RouteTag,
    pub name: Option<String>,
}

/// A directional variant of a route. A `None` tag is the route's "no active service" row.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRow {
    pub id: ServiceId,
    pub route_id: RouteId,
    pub tag: Option<ServiceTag>,
    pub name: Option<String>,
    pub direction: Option<String>,
    pub use_for_ui: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopRow {
    pub id: StopId,
    pub route_id: RouteId,
    pub tag: StopTag,
    pub name: Option<String>,
    pub location: Option<Point>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStopOrderRow {
    pub service_id: ServiceId,
    pub stop_id: StopId,
    pub order_index: i32,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VehicleLocationRow {
    pub service_id: ServiceId,
    pub vehicle_tag: String,
    pub location: Point,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub observed_at: DateTime<Utc>,
    pub is_predictable: bool,
}

/// Service as seen by the vehicle merger: its id plus the route it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEntry {
    pub id: ServiceId,
    pub route_id: RouteId,
    pub route_tag: RouteTag,
    pub tag: Option<ServiceTag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteRef {
    pub id: RouteId,
    pub tag: RouteTag,
}
