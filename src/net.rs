use crate::error::{GodoError, Result};
use reqwest::blocking::{Client, Response};
use std::time::Duration;

const USER_AGENT: &str = concat!("godo/", env!("CARGO_PKG_VERSION"));

pub fn download_client() -> Result<Client> {
    Ok(Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(15))
        .timeout(Duration::from_secs(300))
        .build()?)
}

/// GETs `url`, rejecting non-2xx statuses. The body is left unread for streaming.
pub fn open_download(client: &Client, url: &str) -> Result<Response> {
    let response = client.get(url).send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(GodoError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}
