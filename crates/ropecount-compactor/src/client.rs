//! HTTP client for invoking remote compactor instances.
//!
//! As the owner of the compactor we fix the lookup and balancing policy
//! for every consumer: instances are resolved from Consul under the
//! `compactor` service name with the `prod` tag, passing health checks
//! only, balanced round-robin, with up to three attempts of 500 ms each.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;

use ropecount_core::{Error, Result};

use crate::service::ProcessRequest;

const CONSUL_SERVICE: &str = "compactor";
const CONSUL_TAG: &str = "prod";
const RETRY_MAX: usize = 3;
const RETRY_TIMEOUT: Duration = Duration::from_millis(500);

/// Wire shape of the process response. Business errors travel in-band
/// with HTTP 200.
#[derive(Debug, Deserialize)]
struct ProcessResponse {
    err: Option<String>,
}

/// The slice of a Consul health entry we read.
#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
}

/// A load-balanced client over the compactor instances registered in
/// Consul.
#[derive(Debug)]
pub struct CompactorClient {
    consul_url: String,
    http: reqwest::Client,
    cursor: AtomicUsize,
}

impl CompactorClient {
    /// Creates a client resolving instances from the Consul agent at
    /// `consul_addr` (`host:port` or a full URL).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the HTTP client cannot be built.
    pub fn new(consul_addr: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(RETRY_TIMEOUT)
            .build()
            .map_err(|e| Error::storage_with_source("http client construction failed", e))?;
        let consul_url = if consul_addr.starts_with("http") {
            consul_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{consul_addr}")
        };
        Ok(Self {
            consul_url,
            http,
            cursor: AtomicUsize::new(0),
        })
    }

    async fn discover(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/health/service/{CONSUL_SERVICE}", self.consul_url);
        let entries: Vec<HealthEntry> = self
            .http
            .get(url)
            .query(&[("passing", "true"), ("tag", CONSUL_TAG)])
            .send()
            .await
            .map_err(|e| Error::storage_with_source("consul lookup failed", e))?
            .json()
            .await
            .map_err(|e| Error::storage_with_source("consul response did not parse", e))?;

        let instances: Vec<String> = entries
            .into_iter()
            .map(|e| format!("http://{}:{}", e.service.address, e.service.port))
            .collect();
        if instances.is_empty() {
            return Err(Error::storage(format!(
                "no passing {CONSUL_SERVICE:?} instance registered"
            )));
        }
        Ok(instances)
    }

    /// Invokes `Process` on one of the discovered instances.
    ///
    /// Transport failures rotate to the next instance until the attempt
    /// budget runs out. A business error reported by the service is final
    /// and not retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for discovery failures, exhausted
    /// retries, or a business error from the service.
    pub async fn process(&self, request: &ProcessRequest) -> Result<()> {
        let instances = self.discover().await?;

        let mut last_err = Error::storage("no compactor attempt was made");
        for _ in 0..RETRY_MAX {
            let pick = self.cursor.fetch_add(1, Ordering::Relaxed) % instances.len();
            let instance = &instances[pick];

            let response = match self.http.post(format!("{instance}/")).json(request).send().await {
                Ok(response) => response,
                Err(e) => {
                    last_err =
                        Error::storage_with_source(format!("request to {instance} failed"), e);
                    continue;
                }
            };

            if !response.status().is_success() {
                last_err = Error::storage(format!("{instance} answered {}", response.status()));
                continue;
            }

            let body: ProcessResponse = response
                .json()
                .await
                .map_err(|e| Error::storage_with_source("process response did not parse", e))?;
            return match body.err {
                Some(message) => Err(Error::storage(message)),
                None => Ok(()),
            };
        }

        Err(last_err)
    }
}
