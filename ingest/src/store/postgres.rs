use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    query_builder::Separated,
    PgPool, Postgres, QueryBuilder, Row,
};
use uuid::Uuid;

use super::Gateway;
use crate::{
    config::DbConfig,
    ids::{ServiceKey, StopKey},
    model::*,
};

// Keeps every statement well below the 65535 bind parameter limit.
const MAX_ROWS_PER_STATEMENT: usize = 1000;

pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.name)
            .username(&config.user);
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        log::info!(
            "Connecting to database {} on {}:{} as {}",
            config.name,
            config.host,
            config.port,
            config.user
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to database {}", config.name))?;
        Ok(PgGateway { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }
}

fn push_point(
    values: &mut Separated<'_, '_, Postgres, &'static str>,
    longitude: Option<f64>,
    latitude: Option<f64>,
) {
    // ST_MakePoint is strict, so a missing coordinate gives a NULL geometry.
    values.push("ST_SetSRID(ST_MakePoint(");
    values.push_bind_unseparated(longitude);
    values.push_unseparated(", ");
    values.push_bind_unseparated(latitude);
    values.push_unseparated("), 4326)");
}

fn route_id_list(routes: &[RouteId]) -> Vec<Uuid> {
    routes.iter().map(|route| route.0).collect()
}

impl Gateway for PgGateway {
    async fn upsert_agencies(&self, rows: &[AgencyRow]) -> Result<()> {
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query =
                QueryBuilder::<Postgres>::new("INSERT INTO nextbus.agency (agency_id, name, region) ");
            query.push_values(chunk, |mut values, agency| {
                values
                    .push_bind(agency.tag.as_str())
                    .push_bind(agency.name.as_str())
                    .push_bind(agency.region.as_deref());
            });
            query.push(
                " ON CONFLICT (agency_id) DO UPDATE SET (name, region) = (EXCLUDED.name, EXCLUDED.region)",
            );
            query
                .build()
                .execute(&self.pool)
                .await
                .context("upserting agencies")?;
        }
        Ok(())
    }

    async fn route_ids(&self, agency: AgencyTag) -> Result<HashMap<RouteTag, RouteId>> {
        let rows = sqlx::query("SELECT id, tag FROM nextbus.route WHERE agency_id = $1")
            .bind(agency.as_str())
            .fetch_all(&self.pool)
            .await
            .context("loading route ids")?;
        let mut ids = HashMap::new();
        for row in rows {
            let tag: &str = row.try_get("tag")?;
            ids.insert(RouteTag::new(tag), RouteId(row.try_get("id")?));
        }
        Ok(ids)
    }

    async fn upsert_routes(&self, rows: &[RouteRow]) -> Result<()> {
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query =
                QueryBuilder::<Postgres>::new("INSERT INTO nextbus.route (id, agency_id, tag, name) ");
            query.push_values(chunk, |mut values, route| {
                values
                    .push_bind(route.id.0)
                    .push_bind(route.agency.as_str())
                    .push_bind(route.tag.as_str())
                    .push_bind(route.name.as_deref());
            });
            query.push(" ON CONFLICT (agency_id, tag) DO UPDATE SET name = EXCLUDED.name");
            query
                .build()
                .execute(&self.pool)
                .await
                .context("upserting routes")?;
        }
        Ok(())
    }

    async fn service_ids(&self, routes: &[RouteId]) -> Result<HashMap<ServiceKey, ServiceId>> {
        let rows =
            sqlx::query("SELECT id, route_id, tag FROM nextbus.service WHERE route_id = ANY($1)")
                .bind(route_id_list(routes))
                .fetch_all(&self.pool)
                .await
                .context("loading service ids")?;
        let mut ids = HashMap::new();
        for row in rows {
            let tag: Option<&str> = row.try_get("tag")?;
            let key = (RouteId(row.try_get("route_id")?), tag.map(ServiceTag::new));
            ids.insert(key, ServiceId(row.try_get("id")?));
        }
        Ok(ids)
    }

    async fn upsert_services(&self, rows: &[ServiceRow]) -> Result<()> {
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO nextbus.service (id, route_id, tag, name, direction, use_for_ui) ",
            );
            query.push_values(chunk, |mut values, service| {
                values
                    .push_bind(service.id.0)
                    .push_bind(service.route_id.0)
                    .push_bind(service.tag.as_ref().map(|tag| tag.as_str()))
                    .push_bind(service.name.as_deref())
                    .push_bind(service.direction.as_deref())
                    .push_bind(service.use_for_ui);
            });
            query.push(
                " ON CONFLICT (route_id, (COALESCE(tag, ''))) DO UPDATE SET \
                 (name, direction, use_for_ui) = (EXCLUDED.name, EXCLUDED.direction, EXCLUDED.use_for_ui)",
            );
            query
                .build()
                .execute(&self.pool)
                .await
                .context("upserting services")?;
        }
        Ok(())
    }

    async fn stop_ids(&self, routes: &[RouteId]) -> Result<HashMap<StopKey, StopId>> {
        let rows = sqlx::query(
            "SELECT id, route_id, tag, ST_X(location) AS longitude, ST_Y(location) AS latitude \
             FROM nextbus.stop WHERE route_id = ANY($1)",
        )
        .bind(route_id_list(routes))
        .fetch_all(&self.pool)
        .await
        .context("loading stop ids")?;
        let mut ids = HashMap::new();
        for row in rows {
            let tag: &str = row.try_get("tag")?;
            let location = Point::from_parts(row.try_get("longitude")?, row.try_get("latitude")?);
            let key = StopKey::new(RouteId(row.try_get("route_id")?), StopTag::new(tag), location);
            ids.insert(key, StopId(row.try_get("id")?));
        }
        Ok(ids)
    }

    async fn upsert_stops(&self, rows: &[StopRow]) -> Result<()> {
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO nextbus.stop (id, route_id, tag, name, location) ",
            );
            query.push_values(chunk, |mut values, stop| {
                values
                    .push_bind(stop.id.0)
                    .push_bind(stop.route_id.0)
                    .push_bind(stop.tag.as_str())
                    .push_bind(stop.name.as_deref());
                push_point(
                    &mut values,
                    stop.location.map(|point| point.longitude),
                    stop.location.map(|point| point.latitude),
                );
            });
            query.push(
                " ON CONFLICT (route_id, tag, (COALESCE(ST_AsEWKB(location), ''::bytea))) \
                 DO UPDATE SET name = EXCLUDED.name",
            );
            query
                .build()
                .execute(&self.pool)
                .await
                .context("upserting stops")?;
        }
        Ok(())
    }

    async fn insert_service_stop_orders(&self, rows: &[ServiceStopOrderRow]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO nextbus.service_stop_order (service_id, stop_id, order_index, observed_at) ",
            );
            query.push_values(chunk, |mut values, order| {
                values
                    .push_bind(order.service_id.0)
                    .push_bind(order.stop_id.0)
                    .push_bind(order.order_index)
                    .push_bind(order.observed_at);
            });
            query.push(" ON CONFLICT (service_id, order_index, observed_at) DO NOTHING");
            inserted += query
                .build()
                .execute(&self.pool)
                .await
                .context("inserting service stop orders")?
                .rows_affected();
        }
        Ok(inserted)
    }

    async fn services(&self, agency: AgencyTag) -> Result<Vec<ServiceEntry>> {
        let rows = sqlx::query(
            "SELECT s.id, s.route_id, r.tag AS route_tag, s.tag \
             FROM nextbus.service s JOIN nextbus.route r ON r.id = s.route_id \
             WHERE r.agency_id = $1",
        )
        .bind(agency.as_str())
        .fetch_all(&self.pool)
        .await
        .context("loading services")?;
        let mut services = vec![];
        for row in rows {
            let route_tag: &str = row.try_get("route_tag")?;
            let tag: Option<&str> = row.try_get("tag")?;
            services.push(ServiceEntry {
                id: ServiceId(row.try_get("id")?),
                route_id: RouteId(row.try_get("route_id")?),
                route_tag: RouteTag::new(route_tag),
                tag: tag.map(ServiceTag::new),
            });
        }
        Ok(services)
    }

    async fn insert_vehicle_locations(&self, rows: &[VehicleLocationRow]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO nextbus.vehicle_location \
                 (service_id, vehicle_tag, location, heading, speed, observed_at, is_predictable) ",
            );
            query.push_values(chunk, |mut values, vehicle| {
                values
                    .push_bind(vehicle.service_id.0)
                    .push_bind(vehicle.vehicle_tag.as_str());
                push_point(
                    &mut values,
                    Some(vehicle.location.longitude),
                    Some(vehicle.location.latitude),
                );
                values
                    .push_bind(vehicle.heading)
                    .push_bind(vehicle.speed)
                    .push_bind(vehicle.observed_at)
                    .push_bind(vehicle.is_predictable);
            });
            query.push(" ON CONFLICT (service_id, vehicle_tag, observed_at) DO NOTHING");
            inserted += query
                .build()
                .execute(&self.pool)
                .await
                .context("inserting vehicle locations")?
                .rows_affected();
        }
        Ok(inserted)
    }
}
