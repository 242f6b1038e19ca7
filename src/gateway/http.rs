use crate::database::AnimeRecord;
use crate::error::AppError;
use crate::gateway::SourceGateway;
use crate::normalize;
use async_trait::async_trait;
use serde_json::Value;

/// Reqwest-backed gateway against the source's JSON endpoints, with bounded
/// retry on transport faults.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| AppError::Gateway(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// GET a JSON document with automatic retry. `Ok(None)` on HTTP 404,
    /// `AppError::Gateway` once the retry budget is spent.
    async fn get_json(&self, path: &str, url_param: Option<&str>) -> Result<Option<Value>, AppError> {
        let endpoint = format!("{}{}", self.base_url, path);
        let backoff_delays = [2u64, 8, 30];

        for attempt in 0..3usize {
            let mut request = self.client.get(&endpoint);
            if let Some(url) = url_param {
                request = request.query(&[("url", url)]);
            }

            match request.send().await {
                Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {
                    return Ok(None);
                }
                Ok(response) if response.status().is_success() => {
                    let value = response.json::<Value>().await.map_err(|e| {
                        AppError::Gateway(format!("Bad JSON from {}: {}", endpoint, e))
                    })?;
                    return Ok(Some(value));
                }
                Ok(response) => {
                    return Err(AppError::Gateway(format!(
                        "{} returned status {}",
                        endpoint,
                        response.status()
                    )));
                }
                Err(e) => {
                    if attempt < 2 {
                        let delay = backoff_delays[attempt];
                        log::warn!(
                            "Request attempt {} failed, retrying in {}s: {}",
                            attempt + 1,
                            delay,
                            e
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                    } else {
                        return Err(AppError::Gateway(format!(
                            "Request failed after 3 attempts: {}",
                            e
                        )));
                    }
                }
            }
        }

        unreachable!()
    }
}

#[async_trait]
impl SourceGateway for HttpGateway {
    async fn fetch_anime(&self, url: &str) -> Result<AnimeRecord, AppError> {
        let value = self
            .get_json("/api/anime", Some(url))
            .await?
            .ok_or_else(|| AppError::NotFound(url.to_string()))?;

        let mut record = normalize::anime_from_value(&value)?;

        // Some source pages omit episode numbers; fall back to the number
        // embedded in the episode url.
        for ep in &mut record.episodes {
            if ep.number.is_none() {
                ep.number = extract_episode_number(&ep.url);
            }
        }

        Ok(record)
    }

    async fn resolve_episode_owner(
        &self,
        episode_url: &str,
    ) -> Result<Option<String>, AppError> {
        let value = match self.get_json("/api/episode-owner", Some(episode_url)).await? {
            Some(value) => value,
            None => return Ok(None),
        };
        Ok(value
            .get("anime")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()))
    }

    async fn list_anime_urls(&self) -> Result<Vec<String>, AppError> {
        let value = self
            .get_json("/api/directory", None)
            .await?
            .ok_or_else(|| AppError::Gateway("directory endpoint missing".to_string()))?;
        let urls = value
            .as_array()
            .ok_or_else(|| AppError::Gateway("directory is not an array".to_string()))?
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect();
        Ok(urls)
    }
}

fn extract_episode_number(url: &str) -> Option<f64> {
    // Trailing "-12" or "-12-5" (12.5) on the episode slug
    let re = regex::Regex::new(r"-(\d+)(?:-(\d+))?/?$").ok()?;
    let caps = re.captures(url)?;
    let whole: f64 = caps.get(1)?.as_str().parse().ok()?;
    match caps.get(2) {
        Some(frac) => format!("{}.{}", whole, frac.as_str()).parse().ok(),
        None => Some(whole),
    }
}
