//! Transitland REST client and the records it returns.
//!
//! Pipelines only see the [`TransitProvider`] trait so they can be driven by
//! an in-memory provider in tests.

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

use crate::config::TransitConfig;
use crate::error::TransitError;
use crate::models::{BoundingBox, ScheduleRelationship};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopsResponse {
    pub stops: Option<Vec<StopRecord>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopRecord {
    /// Numeric in Transitland v2, but kept loose.
    pub id: Option<serde_json::Value>,
    pub onestop_id: Option<String>,
    pub stop_name: Option<String>,
    pub geometry: Option<Geometry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Geometry {
    /// `[lon, lat]`
    pub coordinates: Option<Vec<Option<f64>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeparturesResponse {
    pub stops: Option<Vec<DepartureStop>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DepartureStop {
    #[serde(default)]
    pub departures: Vec<DepartureRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DepartureRecord {
    #[serde(default)]
    pub arrival: StopTimeRecord,
    #[serde(default)]
    pub departure: StopTimeRecord,
    #[serde(default)]
    pub trip: TripRecord,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopTimeRecord {
    pub scheduled: Option<String>,
    pub estimated: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TripRecord {
    pub trip_id: Option<String>,
    pub trip_headsign: Option<String>,
    pub schedule_relationship: Option<ScheduleRelationship>,
}

pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransitError>> + Send + 'a>>;

/// Read-only access to stop and departure data.
pub trait TransitProvider: Send + Sync {
    fn stops_in_bbox<'a>(&'a self, bbox: BoundingBox, limit: usize)
        -> ProviderFuture<'a, StopsResponse>;

    fn search_stops<'a>(
        &'a self,
        query: &'a str,
        operators: &'a [String],
        limit: usize,
    ) -> ProviderFuture<'a, StopsResponse>;

    /// Every stop served by any of `operators`, up to `limit`.
    fn stops_served_by<'a>(
        &'a self,
        operators: &'a [String],
        limit: usize,
    ) -> ProviderFuture<'a, StopsResponse>;

    fn departures<'a>(&'a self, stop_id: &'a str, limit: usize)
        -> ProviderFuture<'a, DeparturesResponse>;
}

#[derive(Debug, Clone)]
pub struct TransitlandClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl TransitlandClient {
    pub fn new(config: &TransitConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: &TransitConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransitError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| TransitError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| TransitError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, TransitError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .query(query)
            .query(&[("api_key", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransitError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

impl TransitProvider for TransitlandClient {
    fn stops_in_bbox<'a>(
        &'a self,
        bbox: BoundingBox,
        limit: usize,
    ) -> ProviderFuture<'a, StopsResponse> {
        Box::pin(async move {
            let url = self.endpoint(&["stops"])?;
            let query = [("bbox", bbox.to_string()), ("limit", limit.to_string())];
            self.get_json(url, &query).await
        })
    }

    fn search_stops<'a>(
        &'a self,
        query: &'a str,
        operators: &'a [String],
        limit: usize,
    ) -> ProviderFuture<'a, StopsResponse> {
        Box::pin(async move {
            let url = self.endpoint(&["stops"])?;
            let params = [
                ("search", query.to_string()),
                ("operator_onestop_id", operators.join(",")),
                ("limit", limit.to_string()),
            ];
            self.get_json(url, &params).await
        })
    }

    fn stops_served_by<'a>(
        &'a self,
        operators: &'a [String],
        limit: usize,
    ) -> ProviderFuture<'a, StopsResponse> {
        Box::pin(async move {
            let url = self.endpoint(&["stops"])?;
            let params = [
                ("served_by_onestop_ids", operators.join(",")),
                ("limit", limit.to_string()),
            ];
            self.get_json(url, &params).await
        })
    }

    fn departures<'a>(
        &'a self,
        stop_id: &'a str,
        limit: usize,
    ) -> ProviderFuture<'a, DeparturesResponse> {
        Box::pin(async move {
            let url = self.endpoint(&["stops", stop_id, "departures"])?;
            self.get_json(url, &[("limit", limit.to_string())]).await
        })
    }
}
