use serde::Deserialize;

use super::*;
use crate::config::FeedConfig;

/// Client for the NextBus public XML feed.
pub struct NextbusClient {
    client: reqwest::Client,
    base_url: String,
}

impl NextbusClient {
    pub fn new(config: &FeedConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()?;
        Ok(NextbusClient {
            client,
            base_url: config.base_url.clone(),
        })
    }

    async fn get(&self, params: &[(&str, &str)]) -> Result<String, FetchError> {
        log::debug!("GET {} {:?}", self.base_url, params);
        let response = self
            .client
            .get(&self.base_url)
            .query(params)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

impl FeedClient for NextbusClient {
    async fn fetch_agencies(&self) -> Result<Vec<Agency>, FetchError> {
        parse_agency_list(&self.get(&[("command", "agencyList")]).await?)
    }

    async fn fetch_routes(&self, agency: &str) -> Result<Vec<Route>, FetchError> {
        parse_route_list(&self.get(&[("command", "routeList"), ("a", agency)]).await?)
    }

    async fn fetch_route_config(
        &self,
        agency: &str,
        route: &str,
    ) -> Result<RouteConfig, FetchError> {
        let xml = self
            .get(&[
                ("command", "routeConfig"),
                ("a", agency),
                ("r", route),
                ("verbose", "true"),
            ])
            .await?;
        parse_route_config(&xml, route)
    }

    async fn fetch_vehicle_locations(
        &self,
        agency: &str,
        route: &str,
        since: i64,
    ) -> Result<VehicleBatch, FetchError> {
        let since = since.to_string();
        let xml = self
            .get(&[
                ("command", "vehicleLocations"),
                ("a", agency),
                ("r", route),
                ("t", &since),
            ])
            .await?;
        parse_vehicle_locations(&xml)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorXml {
    #[serde(rename = "@shouldRetry", default)]
    should_retry: Option<String>,
    #[serde(rename = "$text", default)]
    message: String,
}

impl ErrorXml {
    fn into_fetch_error(self) -> FetchError {
        FetchError::Api {
            message: self.message.trim().to_string(),
            should_retry: self.should_retry.as_deref() == Some("true"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgencyListXml {
    #[serde(rename = "Error", default)]
    error: Option<ErrorXml>,
    #[serde(rename = "agency", default)]
    agencies: Vec<AgencyXml>,
}

#[derive(Debug, Deserialize)]
struct AgencyXml {
    #[serde(rename = "@tag")]
    tag: String,
    #[serde(rename = "@title", default)]
    title: String,
    #[serde(rename = "@regionTitle", default)]
    region_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RouteListXml {
    #[serde(rename = "Error", default)]
    error: Option<ErrorXml>,
    #[serde(rename = "route", default)]
    routes: Vec<RouteXml>,
}

#[derive(Debug, Deserialize)]
struct RouteXml {
    #[serde(rename = "@tag")]
    tag: String,
    #[serde(rename = "@title", default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RouteConfigXml {
    #[serde(rename = "Error", default)]
    error: Option<ErrorXml>,
    #[serde(rename = "route", default)]
    route: Option<RouteDetailXml>,
}

#[derive(Debug, Deserialize)]
struct RouteDetailXml {
    #[serde(rename = "stop", default)]
    stops: Vec<StopXml>,
    #[serde(rename = "direction", default)]
    directions: Vec<DirectionXml>,
}

#[derive(Debug, Deserialize)]
struct StopXml {
    #[serde(rename = "@tag", default)]
    tag: String,
    #[serde(rename = "@title", default)]
    title: Option<String>,
    #[serde(rename = "@lat", default)]
    lat: Option<f64>,
    #[serde(rename = "@lon", default)]
    lon: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DirectionXml {
    #[serde(rename = "@tag", default)]
    tag: String,
    #[serde(rename = "@title", default)]
    title: Option<String>,
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@useForUI", default)]
    use_for_ui: Option<String>,
    #[serde(rename = "stop", default)]
    stops: Vec<StopRefXml>,
}

#[derive(Debug, Deserialize)]
struct StopRefXml {
    #[serde(rename = "@tag", default)]
    tag: String,
}

#[derive(Debug, Deserialize)]
struct VehicleLocationsXml {
    #[serde(rename = "Error", default)]
    error: Option<ErrorXml>,
    #[serde(rename = "vehicle", default)]
    vehicles: Vec<VehicleXml>,
    #[serde(rename = "lastTime", default)]
    last_time: Option<LastTimeXml>,
}

#[derive(Debug, Deserialize)]
struct VehicleXml {
    #[serde(rename = "@id", default)]
    id: String,
    #[serde(rename = "@dirTag", default)]
    dir_tag: Option<String>,
    #[serde(rename = "@lat", default)]
    lat: Option<String>,
    #[serde(rename = "@lon", default)]
    lon: Option<String>,
    #[serde(rename = "@secsSinceReport", default)]
    secs_since_report: Option<String>,
    #[serde(rename = "@predictable", default)]
    predictable: Option<String>,
    #[serde(rename = "@heading", default)]
    heading: Option<String>,
    #[serde(rename = "@speedKmHr", default)]
    speed_km_hr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LastTimeXml {
    #[serde(rename = "@time", default)]
    time: Option<String>,
}

pub(crate) fn parse_agency_list(xml: &str) -> Result<Vec<Agency>, FetchError> {
    let body: AgencyListXml = quick_xml::de::from_str(xml)?;
    if let Some(error) = body.error {
        return Err(error.into_fetch_error());
    }
    Ok(body
        .agencies
        .into_iter()
        .map(|agency| Agency {
            tag: agency.tag,
            title: agency.title,
            region_title: agency.region_title,
        })
        .collect())
}

pub(crate) fn parse_route_list(xml: &str) -> Result<Vec<Route>, FetchError> {
    let body: RouteListXml = quick_xml::de::from_str(xml)?;
    if let Some(error) = body.error {
        return Err(error.into_fetch_error());
    }
    Ok(body
        .routes
        .into_iter()
        .map(|route| Route {
            tag: route.tag,
            title: route.title,
        })
        .collect())
}

pub(crate) fn parse_route_config(xml: &str, route_tag: &str) -> Result<RouteConfig, FetchError> {
    let body: RouteConfigXml = quick_xml::de::from_str(xml)?;
    if let Some(error) = body.error {
        return Err(error.into_fetch_error());
    }
    let route = body
        .route
        .ok_or_else(|| FetchError::MissingRoute(route_tag.to_string()))?;
    Ok(RouteConfig {
        stops: route
            .stops
            .into_iter()
            .map(|stop| Stop {
                tag: stop.tag,
                title: stop.title,
                longitude: stop.lon,
                latitude: stop.lat,
            })
            .collect(),
        directions: route
            .directions
            .into_iter()
            .map(|direction| Direction {
                tag: direction.tag,
                title: direction.title,
                name: direction.name,
                use_for_ui: direction.use_for_ui.as_deref() == Some("true"),
                stop_tags: direction.stops.into_iter().map(|stop| stop.tag).collect(),
            })
            .collect(),
    })
}

pub(crate) fn parse_vehicle_locations(xml: &str) -> Result<VehicleBatch, FetchError> {
    let body: VehicleLocationsXml = quick_xml::de::from_str(xml)?;
    if let Some(error) = body.error {
        return Err(error.into_fetch_error());
    }
    Ok(VehicleBatch {
        request_time: body.last_time.and_then(|last_time| last_time.time),
        vehicles: body
            .vehicles
            .into_iter()
            .map(|vehicle| Vehicle {
                id: vehicle.id,
                dir_tag: vehicle.dir_tag.filter(|tag| !tag.is_empty()),
                longitude: vehicle.lon,
                latitude: vehicle.lat,
                heading: vehicle.heading,
                speed: vehicle.speed_km_hr,
                secs_since_report: vehicle.secs_since_report,
                predictable: vehicle.predictable,
            })
            .collect(),
    })
}
