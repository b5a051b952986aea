//! In-memory feed and store used by the driver level tests.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use anyhow::Result;

use crate::{
    feed::{self, FeedClient, FetchError},
    ids::{ServiceKey, StopKey},
    model::*,
    store::Gateway,
};

pub fn stop(tag: &str, lon: f64, lat: f64) -> feed::Stop {
    feed::Stop {
        tag: tag.into(),
        title: Some(format!("Stop {}", tag)),
        longitude: Some(lon),
        latitude: Some(lat),
    }
}

pub fn direction(tag: &str, stop_tags: &[&str]) -> feed::Direction {
    feed::Direction {
        tag: tag.into(),
        title: Some(format!("Direction {}", tag)),
        name: None,
        use_for_ui: true,
        stop_tags: stop_tags.iter().map(|tag| tag.to_string()).collect(),
    }
}

pub fn route_config(stops: Vec<feed::Stop>, directions: Vec<feed::Direction>) -> feed::RouteConfig {
    feed::RouteConfig { stops, directions }
}

#[derive(Debug, Clone)]
pub enum VehicleReply {
    Batch(feed::VehicleBatch),
    Fail,
    Hang,
}

#[derive(Default)]
pub struct FakeFeed {
    agencies: Vec<feed::Agency>,
    routes: Vec<feed::Route>,
    configs: HashMap<String, feed::RouteConfig>,
    vehicles: HashMap<String, VehicleReply>,
    vehicle_requests: Mutex<Vec<(String, i64)>>,
}

impl FakeFeed {
    pub fn with_agency(mut self, tag: &str, title: &str) -> Self {
        self.agencies.push(feed::Agency {
            tag: tag.into(),
            title: title.into(),
            region_title: None,
        });
        self
    }

    pub fn with_routes(mut self, tags: &[&str]) -> Self {
        self.routes.extend(tags.iter().map(|tag| feed::Route {
            tag: tag.to_string(),
            title: Some(format!("Route {}", tag)),
        }));
        self
    }

    pub fn with_config(mut self, route: &str, config: feed::RouteConfig) -> Self {
        self.configs.insert(route.into(), config);
        self
    }

    pub fn with_vehicles(mut self, route: &str, reply: VehicleReply) -> Self {
        self.vehicles.insert(route.into(), reply);
        self
    }

    /// (route, since) of every vehicle request so far.
    pub fn vehicle_requests(&self) -> Vec<(String, i64)> {
        self.vehicle_requests.lock().unwrap().clone()
    }
}

impl FeedClient for FakeFeed {
    async fn fetch_agencies(&self) -> Result<Vec<feed::Agency>, FetchError> {
        Ok(self.agencies.clone())
    }

    async fn fetch_routes(&self, _agency: &str) -> Result<Vec<feed::Route>, FetchError> {
        Ok(self.routes.clone())
    }

    async fn fetch_route_config(
        &self,
        _agency: &str,
        route: &str,
    ) -> Result<feed::RouteConfig, FetchError> {
        self.configs
            .get(route)
            .cloned()
            .ok_or_else(|| FetchError::MissingRoute(route.into()))
    }

    async fn fetch_vehicle_locations(
        &self,
        _agency: &str,
        route: &str,
        since: i64,
    ) -> Result<feed::VehicleBatch, FetchError> {
        self.vehicle_requests
            .lock()
            .unwrap()
            .push((route.to_string(), since));
        match self.vehicles.get(route).cloned() {
            Some(VehicleReply::Batch(batch)) => Ok(batch),
            Some(VehicleReply::Hang) => std::future::pending().await,
            Some(VehicleReply::Fail) | None => Err(FetchError::Api {
                message: format!("no vehicles for {}", route),
                should_retry: true,
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct StoreState {
    pub agencies: Vec<AgencyRow>,
    pub routes: Vec<RouteRow>,
    pub services: Vec<ServiceRow>,
    pub stops: Vec<StopRow>,
    pub stop_orders: Vec<ServiceStopOrderRow>,
    pub vehicle_locations: Vec<VehicleLocationRow>,
    pub vehicle_insert_calls: usize,
}

#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<StoreState>,
    fail_vehicle_inserts: bool,
}

impl FakeGateway {
    pub fn failing_vehicle_inserts() -> Self {
        FakeGateway {
            fail_vehicle_inserts: true,
            ..Default::default()
        }
    }

    pub fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }
}

impl Gateway for FakeGateway {
    async fn upsert_agencies(&self, rows: &[AgencyRow]) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        for row in rows {
            match state.agencies.iter_mut().find(|a| a.tag == row.tag) {
                Some(existing) => *existing = row.clone(),
                None => state.agencies.push(row.clone()),
            }
        }
        Ok(())
    }

    async fn route_ids(&self, agency: AgencyTag) -> Result<HashMap<RouteTag, RouteId>> {
        Ok(self
            .state()
            .routes
            .iter()
            .filter(|route| route.agency == agency)
            .map(|route| (route.tag, route.id))
            .collect())
    }

    async fn upsert_routes(&self, rows: &[RouteRow]) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        for row in rows {
            match state
                .routes
                .iter_mut()
                .find(|r| r.agency == row.agency && r.tag == row.tag)
            {
                Some(existing) => existing.name = row.name.clone(),
                None => state.routes.push(row.clone()),
            }
        }
        Ok(())
    }

    async fn service_ids(&self, routes: &[RouteId]) -> Result<HashMap<ServiceKey, ServiceId>> {
        Ok(self
            .state()
            .services
            .iter()
            .filter(|service| routes.contains(&service.route_id))
            .map(|service| ((service.route_id, service.tag), service.id))
            .collect())
    }

    async fn upsert_services(&self, rows: &[ServiceRow]) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        for row in rows {
            match state
                .services
                .iter_mut()
                .find(|s| s.route_id == row.route_id && s.tag == row.tag)
            {
                Some(existing) => {
                    existing.name = row.name.clone();
                    existing.direction = row.direction.clone();
                    existing.use_for_ui = row.use_for_ui;
                }
                None => state.services.push(row.clone()),
            }
        }
        Ok(())
    }

    async fn stop_ids(&self, routes: &[RouteId]) -> Result<HashMap<StopKey, StopId>> {
        Ok(self
            .state()
            .stops
            .iter()
            .filter(|stop| routes.contains(&stop.route_id))
            .map(|stop| (StopKey::new(stop.route_id, stop.tag, stop.location), stop.id))
            .collect())
    }

    async fn upsert_stops(&self, rows: &[StopRow]) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        for row in rows {
            let key = StopKey::new(row.route_id, row.tag, row.location);
            match state
                .stops
                .iter_mut()
                .find(|s| StopKey::new(s.route_id, s.tag, s.location) == key)
            {
                Some(existing) => existing.name = row.name.clone(),
                None => state.stops.push(row.clone()),
            }
        }
        Ok(())
    }

    async fn insert_service_stop_orders(&self, rows: &[ServiceStopOrderRow]) -> Result<u64> {
        let mut state = self.state();
        let mut inserted = 0;
        for row in rows {
            let exists = state.stop_orders.iter().any(|o| {
                o.service_id == row.service_id
                    && o.order_index == row.order_index
                    && o.observed_at == row.observed_at
            });
            if !exists {
                state.stop_orders.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn services(&self, agency: AgencyTag) -> Result<Vec<ServiceEntry>> {
        let state = self.state();
        let mut entries = vec![];
        for service in &state.services {
            let Some(route) = state
                .routes
                .iter()
                .find(|r| r.id == service.route_id && r.agency == agency)
            else {
                continue;
            };
            entries.push(ServiceEntry {
                id: service.id,
                route_id: route.id,
                route_tag: route.tag,
                tag: service.tag,
            });
        }
        Ok(entries)
    }

    async fn insert_vehicle_locations(&self, rows: &[VehicleLocationRow]) -> Result<u64> {
        let mut state = self.state();
        state.vehicle_insert_calls += 1;
        anyhow::ensure!(!self.fail_vehicle_inserts, "database is down");
        let mut inserted = 0;
        for row in rows {
            let exists = state.vehicle_locations.iter().any(|v| {
                v.service_id == row.service_id
                    && v.vehicle_tag == row.vehicle_tag
                    && v.observed_at == row.observed_at
            });
            if !exists {
                state.vehicle_locations.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}
