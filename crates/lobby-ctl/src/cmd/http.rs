//! Shared HTTP request helpers for CLI commands.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Where the daemon's admin API lives and how to authenticate to it.
pub struct Target {
    pub port: u16,
    pub token: Option<String>,
}

impl Target {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}/api{}", self.port, path)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    url: &str,
    resp: reqwest::Result<reqwest::Response>,
) -> Result<T> {
    let resp =
        resp.with_context(|| format!("failed to connect to lobbyd at {} — is it running?", url))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("{} returned {}: {}", url, status, body);
    }
    resp.json::<T>().await.context("failed to parse response")
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(target: &Target, path: &str) -> Result<T> {
    let url = target.url(path);
    let resp = target.authed(reqwest::Client::new().get(&url)).send().await;
    read_json(&url, resp).await
}

pub async fn post_json<T: for<'de> Deserialize<'de>>(target: &Target, path: &str) -> Result<T> {
    let url = target.url(path);
    let resp = target.authed(reqwest::Client::new().post(&url)).send().await;
    read_json(&url, resp).await
}

pub async fn post_json_body<T, R>(target: &Target, path: &str, body: &T) -> Result<R>
where
    T: Serialize,
    R: for<'de> Deserialize<'de>,
{
    let url = target.url(path);
    let resp = target
        .authed(reqwest::Client::new().post(&url).json(body))
        .send()
        .await;
    read_json(&url, resp).await
}
