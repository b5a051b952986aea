use std::collections::HashMap;

use anyhow::Result;

use crate::{
    ids::{ServiceKey, StopKey},
    model::*,
};

pub mod postgres;

pub use postgres::PgGateway;

/// Idempotent writes and the id lookups needed to keep surrogate ids stable.
#[allow(async_fn_in_trait)]
pub trait Gateway {
    async fn upsert_agencies(&self, rows: &[AgencyRow]) -> Result<()>;

    async fn route_ids(&self, agency: AgencyTag) -> Result<HashMap<RouteTag, RouteId>>;

    async fn upsert_routes(&self, rows: &[RouteRow]) -> Result<()>;

    async fn service_ids(&self, routes: &[RouteId]) -> Result<HashMap<ServiceKey, ServiceId>>;

    async fn upsert_services(&self, rows: &[ServiceRow]) -> Result<()>;

    async fn stop_ids(&self, routes: &[RouteId]) -> Result<HashMap<StopKey, StopId>>;

    async fn upsert_stops(&self, rows: &[StopRow]) -> Result<()>;

    /// Rows whose (service, order index, observed_at) already exists are skipped.
    async fn insert_service_stop_orders(&self, rows: &[ServiceStopOrderRow]) -> Result<u64>;

    async fn services(&self, agency: AgencyTag) -> Result<Vec<ServiceEntry>>;

    /// Rows whose (service, vehicle, observed_at) already exists are skipped.
    async fn insert_vehicle_locations(&self, rows: &[VehicleLocationRow]) -> Result<u64>;
}
