use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::TransitConfig;
use crate::debounce::{RequestSequencer, Ticket};
use crate::error::{Pipeline, PipelineError, TransitError};
use crate::models::{Coordinate, Region, Stop, ViewState};
use crate::provider::{StopRecord, StopsResponse, TransitProvider};

pub const UNNAMED_STOP: &str = "Unnamed Stop";

/// Maps one provider record to a [`Stop`]. Records without an id or without a
/// usable `[lon, lat]` pair yield `None`.
pub fn normalize_stop(record: &StopRecord) -> Option<Stop> {
    let id = match record.id.as_ref()? {
        serde_json::Value::String(s) if !s.is_empty() => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };

    let coordinates = record.geometry.as_ref()?.coordinates.as_ref()?;
    let longitude = (*coordinates.first()?)?;
    let latitude = (*coordinates.get(1)?)?;
    if !longitude.is_finite() || !latitude.is_finite() {
        return None;
    }

    Some(Stop {
        id,
        coordinate: Coordinate {
            latitude,
            longitude,
        },
        name: record
            .stop_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| UNNAMED_STOP.to_string()),
        onestop_id: record.onestop_id.clone(),
    })
}

pub fn normalize_stops(records: &[StopRecord]) -> Vec<Stop> {
    let stops: Vec<Stop> = records.iter().filter_map(normalize_stop).collect();
    if stops.len() < records.len() {
        debug!(
            "Dropped {} stop records without id or coordinates",
            records.len() - stops.len()
        );
    }
    stops
}

pub(crate) fn require_stops<T>(stops: Option<Vec<T>>) -> Result<Vec<T>, TransitError> {
    stops.ok_or_else(|| TransitError::MalformedBody("response has no stops array".to_string()))
}

/// Stops seen during a map session, keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopCollection {
    stops: BTreeMap<String, Stop>,
}

impl StopCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unions `fresh` into the collection. A stop already present is replaced
    /// by the newer record. Returns how many ids were not present before.
    pub fn merge(&mut self, fresh: impl IntoIterator<Item = Stop>) -> usize {
        let mut added = 0;
        for stop in fresh {
            if self.stops.insert(stop.id.clone(), stop).is_none() {
                added += 1;
            }
        }
        added
    }

    pub fn replace(&mut self, stops: impl IntoIterator<Item = Stop>) {
        self.stops = stops.into_iter().map(|s| (s.id.clone(), s)).collect();
    }

    pub fn get(&self, id: &str) -> Option<&Stop> {
        self.stops.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.stops.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Stop> {
        self.stops.values().cloned().collect()
    }
}

impl Serialize for StopCollection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.stops.values())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// The response was applied; carries the number of stops it contained.
    Applied(usize),
    /// A newer request was issued while this one was in flight.
    Superseded,
}

/// Viewport-driven stop lookup for a single map session.
pub struct StopLookup {
    provider: Arc<dyn TransitProvider>,
    limit: usize,
    operators: Vec<String>,
    network_limit: usize,
    sequencer: RequestSequencer,
    state: watch::Sender<ViewState<StopCollection>>,
}

#[derive(Debug, Clone, Copy)]
enum Apply {
    Merge,
    Replace,
}

impl StopLookup {
    pub fn new(provider: Arc<dyn TransitProvider>, config: &TransitConfig) -> Self {
        let (state, _) = watch::channel(ViewState::default());
        Self {
            provider,
            limit: config.bbox_limit,
            operators: config.operators.clone(),
            network_limit: config.network_limit,
            sequencer: RequestSequencer::new(),
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState<StopCollection>> {
        self.state.subscribe()
    }

    pub fn view(&self) -> ViewState<StopCollection> {
        self.state.borrow().clone()
    }

    pub fn stops(&self) -> Vec<Stop> {
        self.state.borrow().data.to_vec()
    }

    /// Fetches the stops inside `region` and merges them into the collection.
    pub async fn refresh(&self, region: Region) -> Result<Refresh, PipelineError> {
        let bbox = region
            .bounding_box()
            .map_err(|e| PipelineError::new(Pipeline::Stops, e))?;

        let ticket = self.begin();
        let result = self.provider.stops_in_bbox(bbox, self.limit).await;
        self.settle(ticket, result, Apply::Merge, &format!("bbox {}", bbox))
    }

    /// Fetches every stop served by the configured operators and replaces
    /// the collection with it. Viewport responses still in flight are dropped.
    pub async fn load_all(&self) -> Result<Refresh, PipelineError> {
        let ticket = self.begin();
        let result = self
            .provider
            .stops_served_by(&self.operators, self.network_limit)
            .await;
        self.settle(ticket, result, Apply::Replace, "the whole network")
    }

    fn begin(&self) -> Ticket {
        let ticket = self.sequencer.issue();
        self.state.send_modify(|view| {
            view.loading = true;
            view.error = None;
        });
        ticket
    }

    fn settle(
        &self,
        ticket: Ticket,
        result: Result<StopsResponse, TransitError>,
        apply: Apply,
        scope: &str,
    ) -> Result<Refresh, PipelineError> {
        if !self.sequencer.is_latest(ticket) {
            debug!("Discarding superseded stops response for {}", scope);
            return Ok(Refresh::Superseded);
        }

        match result.and_then(|response| require_stops(response.stops)) {
            Ok(records) => {
                let fresh = normalize_stops(&records);
                let count = fresh.len();
                self.state.send_modify(|view| {
                    let added = match apply {
                        Apply::Merge => view.data.merge(fresh),
                        Apply::Replace => {
                            view.data.replace(fresh);
                            count
                        }
                    };
                    info!(
                        "Fetched {} stops for {} ({} new, {} total)",
                        count,
                        scope,
                        added,
                        view.data.len()
                    );
                    view.loading = false;
                    view.error = None;
                });
                Ok(Refresh::Applied(count))
            }
            Err(source) => {
                let err = PipelineError::new(Pipeline::Stops, source);
                error!("Failed to fetch or process stops: {}", err);
                self.state.send_modify(|view| {
                    view.loading = false;
                    view.error = Some(err.user_message().to_string());
                });
                Err(err)
            }
        }
    }
}
