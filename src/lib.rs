pub mod config;
pub mod database;
pub mod executor;
pub mod language;
pub mod routes;
pub mod sandbox;
pub mod web_server;
pub mod workspace;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
