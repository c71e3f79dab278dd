use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

use crate::config::CONFIG;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    build_http_client(CONFIG.vendor_request_timeout_seconds)
        .expect("Failed to build HTTP client")
});

pub fn build_http_client(timeout_seconds: u64) -> reqwest::Result<Client> {
    let mut builder = Client::builder().gzip(true).brotli(true);
    if timeout_seconds > 0 {
        builder = builder.timeout(Duration::from_secs(timeout_seconds));
    }
    builder.build()
}

pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}
