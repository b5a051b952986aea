use std::{collections::BTreeSet, future::Future, time::Duration};

pub mod nextbus;

pub use nextbus::NextbusClient;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("could not parse feed response: {0}")]
    Parse(#[from] quick_xml::de::DeError),
    #[error("feed error (retry: {should_retry}): {message}")]
    Api { message: String, should_retry: bool },
    #[error("route config for {0} is missing")]
    MissingRoute(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Agency {
    pub tag: String,
    pub title: String,
    pub region_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub tag: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stop {
    pub tag: String,
    pub title: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Direction {
    pub tag: String,
    pub title: Option<String>,
    pub name: Option<String>,
    pub use_for_ui: bool,
    /// Stop tags in service order.
    pub stop_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouteConfig {
    pub stops: Vec<Stop>,
    pub directions: Vec<Direction>,
}

impl RouteConfig {
    /// Every stop tag the route mentions outside of its stop definitions.
    pub fn referenced_stop_tags(&self) -> BTreeSet<String> {
        self.directions
            .iter()
            .flat_map(|direction| direction.stop_tags.iter().cloned())
            .collect()
    }
}

/// Vehicle telemetry as reported. Numeric fields stay textual until the merger validates them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Vehicle {
    pub id: String,
    pub dir_tag: Option<String>,
    pub longitude: Option<String>,
    pub latitude: Option<String>,
    pub heading: Option<String>,
    pub speed: Option<String>,
    pub secs_since_report: Option<String>,
    pub predictable: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VehicleBatch {
    /// Epoch milliseconds of this request, as returned by the feed.
    pub request_time: Option<String>,
    pub vehicles: Vec<Vehicle>,
}

#[allow(async_fn_in_trait)]
pub trait FeedClient {
    async fn fetch_agencies(&self) -> Result<Vec<Agency>, FetchError>;

    async fn fetch_routes(&self, agency: &str) -> Result<Vec<Route>, FetchError>;

    async fn fetch_route_config(&self, agency: &str, route: &str)
        -> Result<RouteConfig, FetchError>;

    async fn fetch_vehicle_locations(
        &self,
        agency: &str,
        route: &str,
        since: i64,
    ) -> Result<VehicleBatch, FetchError>;
}

pub async fn with_timeout<T>(
    limit: Duration,
    fetch: impl Future<Output = Result<T, FetchError>>,
) -> Result<T, FetchError> {
    tokio::time::timeout(limit, fetch)
        .await
        .map_err(|_| FetchError::Timeout(limit))?
}
