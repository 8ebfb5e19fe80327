use crate::config::AppConfig;
use reqwest::Client;
use std::time::Duration;

pub fn build_client(config: &AppConfig) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .connect_timeout(Duration::from_secs(config.http_connect_timeout_secs))
        .build()
        .unwrap_or_else(|_| Client::new())
}
