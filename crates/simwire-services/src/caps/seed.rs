//! Seed capability negotiation.
//!
//! The client POSTs the names it wants to the seed URI and gets back a
//! name → URI map. Every failure except 404 is retried with capped
//! exponential backoff.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use reqwest::{StatusCode, Url};
use serde_json::Value;

use simwire_core::config::CapsConfig;

use super::CapsError;

/// Result of a single seed request.
#[derive(Debug)]
pub enum SeedOutcome {
    Granted(HashMap<String, Url>),
    /// Retrying cannot help.
    Terminal(CapsError),
    /// Worth another attempt after a delay.
    Transient(String),
}

pub struct SeedNegotiator {
    client: reqwest::Client,
    request_timeout: Duration,
    retry_initial: Duration,
    retry_max: Duration,
}

impl SeedNegotiator {
    pub fn new(client: reqwest::Client, config: &CapsConfig) -> Self {
        Self {
            client,
            request_timeout: config.request_timeout(),
            retry_initial: config.retry_initial(),
            retry_max: config.retry_max(),
        }
    }

    pub async fn request_once(&self, seed: &Url, names: &[String]) -> SeedOutcome {
        let response = match self
            .client
            .post(seed.clone())
            .timeout(self.request_timeout)
            .json(names)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return SeedOutcome::Transient(format!("request failed: {e}")),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return SeedOutcome::Terminal(CapsError::NotFoundOnInit {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return SeedOutcome::Transient(format!("seed returned {status}"));
        }

        match response.json::<Value>().await {
            Ok(body) => match parse_capabilities(body) {
                Ok(map) => SeedOutcome::Granted(map),
                Err(reason) => SeedOutcome::Transient(reason),
            },
            Err(e) => SeedOutcome::Transient(format!("unreadable body: {e}")),
        }
    }

    /// Request until the seed grants a map or fails terminally.
    pub async fn negotiate(
        &self,
        seed: &Url,
        names: &[String],
    ) -> Result<HashMap<String, Url>, CapsError> {
        let mut delay = self.retry_initial;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.request_once(seed, names).await {
                SeedOutcome::Granted(map) => {
                    tracing::info!(%seed, attempt, count = map.len(), "capabilities granted");
                    return Ok(map);
                }
                SeedOutcome::Terminal(e) => {
                    tracing::error!(%seed, attempt, error = %e, "seed negotiation failed");
                    return Err(e);
                }
                SeedOutcome::Transient(reason) => {
                    let wait = jittered(delay);
                    tracing::warn!(
                        %seed,
                        attempt,
                        %reason,
                        retry_in_ms = wait.as_millis() as u64,
                        "seed request failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    delay = (delay * 2).min(self.retry_max);
                }
            }
        }
    }
}

/// Scale by a random factor in [0.8, 1.2].
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(factor)
}

fn parse_capabilities(body: Value) -> Result<HashMap<String, Url>, String> {
    let Value::Object(entries) = body else {
        return Err("seed body is not an object".to_string());
    };
    entries
        .into_iter()
        .map(|(name, value)| {
            let uri = value
                .as_str()
                .ok_or_else(|| format!("{name} is not a string"))?;
            let url = Url::parse(uri).map_err(|e| format!("{name} is not a URI: {e}"))?;
            Ok((name, url))
        })
        .collect()
}
