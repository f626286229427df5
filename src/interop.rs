//! Client for the interop server that supplies the drop-target coordinate.

use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::InteropConfig;
use crate::state::Coords2D;

/// Source of the mission's drop objective. Fetched at most once per
/// controller lifetime; the result is treated as read-only afterwards.
#[async_trait]
pub trait TargetSource: Send {
    async fn get_drop_target(&self) -> anyhow::Result<Coords2D>;
}

pub struct InteropClient {
    http: reqwest::Client,
    base_url: reqwest::Url,
}

impl InteropClient {
    pub fn new(config: &InteropConfig) -> anyhow::Result<Self> {
        Ok(InteropClient {
            http: reqwest::Client::new(),
            base_url: reqwest::Url::from_str(&config.address)
                .context("invalid interop server url")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct UgvData {
    result: UgvResult,
}

#[derive(Debug, Deserialize)]
struct UgvResult {
    drop: Coords2D,
}

#[async_trait]
impl TargetSource for InteropClient {
    async fn get_drop_target(&self) -> anyhow::Result<Coords2D> {
        let endpoint = self
            .base_url
            .join("/api/v1/ugv")
            .context("could not create interop request url")?;

        let data: UgvData = self
            .http
            .get(endpoint)
            .send()
            .await
            .context("interop server request failed")?
            .error_for_status()
            .context("interop server rejected the request")?
            .json()
            .await
            .context("interop server returned a malformed payload")?;

        debug!("received drop target {:?}", data.result.drop);

        Ok(data.result.drop)
    }
}
