//! GTFS-realtime trip updates: which trips are about to reach a given stop.

use chrono::{DateTime, Utc};
use prost::Message;
use serde::Deserialize;
use tracing::{error, info};

use crate::config::{FeedFormat, TransitConfig};
use crate::error::{Pipeline, PipelineError, TransitError};
use crate::models::IncomingTrip;

/// uint64 fields arrive as strings in the protobuf JSON mapping, but some
/// producers emit plain numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LooseInt {
    Number(i64),
    Text(String),
}

impl LooseInt {
    fn value(&self) -> Option<i64> {
        match self {
            LooseInt::Number(n) => Some(*n),
            LooseInt::Text(s) => s.trim().parse().ok(),
        }
    }
}

fn loose_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<LooseInt> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|v| v.value()))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RtFeed {
    #[serde(default)]
    pub header: RtHeader,
    #[serde(default)]
    pub entity: Vec<RtEntity>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RtHeader {
    #[serde(default, deserialize_with = "loose_int")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RtEntity {
    #[serde(default)]
    pub id: String,
    pub trip_update: Option<RtTripUpdate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RtTripUpdate {
    #[serde(default)]
    pub trip: RtTrip,
    #[serde(default, deserialize_with = "loose_int")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub stop_time_update: Vec<RtStopTimeUpdate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RtTrip {
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RtStopTimeUpdate {
    pub stop_id: Option<String>,
    pub stop_sequence: Option<u32>,
    pub arrival: Option<RtStopTimeEvent>,
    pub departure: Option<RtStopTimeEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RtStopTimeEvent {
    #[serde(default, deserialize_with = "loose_int")]
    pub delay: Option<i64>,
}

impl From<gtfs_realtime::trip_update::StopTimeEvent> for RtStopTimeEvent {
    fn from(event: gtfs_realtime::trip_update::StopTimeEvent) -> Self {
        Self {
            delay: event.delay.map(i64::from),
        }
    }
}

impl From<gtfs_realtime::FeedMessage> for RtFeed {
    fn from(message: gtfs_realtime::FeedMessage) -> Self {
        let entity = message
            .entity
            .into_iter()
            .map(|entity| RtEntity {
                id: entity.id,
                trip_update: entity.trip_update.map(|update| RtTripUpdate {
                    trip: RtTrip {
                        trip_id: update.trip.trip_id,
                        route_id: update.trip.route_id,
                    },
                    timestamp: update.timestamp.and_then(|t| i64::try_from(t).ok()),
                    stop_time_update: update
                        .stop_time_update
                        .into_iter()
                        .map(|stu| RtStopTimeUpdate {
                            stop_id: stu.stop_id,
                            stop_sequence: stu.stop_sequence,
                            arrival: stu.arrival.map(RtStopTimeEvent::from),
                            departure: stu.departure.map(RtStopTimeEvent::from),
                        })
                        .collect(),
                }),
            })
            .collect();

        RtFeed {
            header: RtHeader {
                timestamp: message.header.timestamp.and_then(|t| i64::try_from(t).ok()),
            },
            entity,
        }
    }
}

pub fn decode_feed(body: &[u8], format: FeedFormat) -> Result<RtFeed, TransitError> {
    match format {
        FeedFormat::Json => Ok(serde_json::from_slice(body)?),
        FeedFormat::Protobuf => Ok(gtfs_realtime::FeedMessage::decode(body)?.into()),
    }
}

/// Trips whose stop-time updates touch `stop_id`, with the expected arrival
/// taken as the update timestamp plus the reported delay. Soonest first.
pub fn incoming_at_stop(feed: &RtFeed, stop_id: &str) -> Vec<IncomingTrip> {
    let mut incoming: Vec<IncomingTrip> = feed
        .entity
        .iter()
        .filter_map(|entity| {
            let update = entity.trip_update.as_ref()?;
            let stop_update = update
                .stop_time_update
                .iter()
                .find(|stu| stu.stop_id.as_deref() == Some(stop_id))?;

            let delay = stop_update
                .arrival
                .as_ref()
                .and_then(|event| event.delay)
                .or_else(|| stop_update.departure.as_ref().and_then(|event| event.delay))
                .unwrap_or(0);
            let base = update.timestamp.or(feed.header.timestamp)?;

            Some(IncomingTrip {
                trip_id: update.trip.trip_id.clone(),
                route_id: update.trip.route_id.clone(),
                stop_id: stop_id.to_string(),
                delay_seconds: delay,
                expected_arrival: DateTime::<Utc>::from_timestamp(base.checked_add(delay)?, 0)?,
            })
        })
        .collect();
    incoming.sort_by_key(|trip| trip.expected_arrival);
    incoming
}

#[derive(Debug, Clone)]
pub struct TripUpdatesClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    format: FeedFormat,
}

impl TripUpdatesClient {
    pub fn new(config: &TransitConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: &TransitConfig) -> Self {
        Self {
            client,
            url: config.gtfsr_url.clone(),
            api_key: config.gtfsr_api_key.clone(),
            format: config.gtfsr_format,
        }
    }

    pub async fn fetch(&self) -> Result<RtFeed, TransitError> {
        let mut request = self.client.get(&self.url).header("x-api-key", &self.api_key);
        if self.format == FeedFormat::Json {
            request = request.query(&[("format", "json")]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransitError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        decode_feed(&body, self.format)
    }

    pub async fn incoming_at_stop(&self, stop_id: &str) -> Result<Vec<IncomingTrip>, PipelineError> {
        match self.fetch().await {
            Ok(feed) => {
                let incoming = incoming_at_stop(&feed, stop_id);
                info!(
                    "{} of {} trip updates touch stop {}",
                    incoming.len(),
                    feed.entity.len(),
                    stop_id
                );
                Ok(incoming)
            }
            Err(source) => {
                let err = PipelineError::new(Pipeline::TripUpdates, source);
                error!("Failed to fetch trip updates: {}", err);
                Err(err)
            }
        }
    }
}
