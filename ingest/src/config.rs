use std::{path::PathBuf, time::Duration};

use chrono_tz::Tz;

use crate::model::AgencyTag;

pub const DEFAULT_FEED_URL: &str = "http://webservices.nextbus.com/service/publicXMLFeed";

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Upper bound on route fetches in flight at once.
    pub concurrency: usize,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub agency: AgencyTag,
    pub timezone: Tz,
    pub poll_interval: Duration,
    pub refresh_tries: u32,
    pub state_file: Option<PathBuf>,
    pub poll: PollConfig,
}

impl PollConfig {
    pub fn new(concurrency: usize, fetch_timeout: Duration) -> Self {
        PollConfig {
            concurrency: concurrency.max(1),
            fetch_timeout,
        }
    }
}
