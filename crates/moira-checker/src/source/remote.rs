use super::{MetricSource, DEFAULT_STEP};
use crate::error::{CheckError, Result};
use crate::series::Series;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    /// Graphite base URL, e.g. `http://graphite:8080`.
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

/// Evaluates targets on a Graphite-compatible `/render` endpoint.
pub struct RemoteSource {
    client: reqwest::Client,
    settings: RemoteSettings,
}

impl RemoteSource {
    pub fn new(settings: RemoteSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { client, settings })
    }
}

#[derive(Deserialize)]
struct RenderedSeries {
    target: String,
    datapoints: Vec<(Option<f64>, i64)>,
}

/// Decodes a `/render?format=json` body.
pub fn parse_render(body: &[u8]) -> Result<Vec<Series>> {
    let rendered: Vec<RenderedSeries> = serde_json::from_slice(body)
        .map_err(|e| CheckError::Remote(format!("bad render response: {e}")))?;
    Ok(rendered
        .into_iter()
        .map(|r| {
            let start = r.datapoints.first().map(|(_, ts)| *ts).unwrap_or(0);
            let step = match r.datapoints.as_slice() {
                [(_, a), (_, b), ..] if b > a => b - a,
                _ => DEFAULT_STEP,
            };
            let values = r.datapoints.into_iter().map(|(v, _)| v).collect();
            Series::new(r.target, start, step, values)
        })
        .collect())
}

#[async_trait]
impl MetricSource for RemoteSource {
    async fn fetch(&self, target: &str, from: i64, until: i64) -> Result<Vec<Series>> {
        let url = format!("{}/render", self.settings.url.trim_end_matches('/'));
        let mut request = self.client.get(&url).query(&[
            ("target", target.to_string()),
            ("from", from.to_string()),
            ("until", until.to_string()),
            ("format", "json".to_string()),
        ]);
        if let Some(user) = &self.settings.user {
            request = request.basic_auth(user, self.settings.password.as_ref());
        }
        let response = request.send().await?.error_for_status()?;
        let body = response.bytes().await?;
        parse_render(&body)
    }
}
