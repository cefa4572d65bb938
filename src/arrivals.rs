use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::TransitConfig;
use crate::debounce::RequestSequencer;
use crate::error::{Pipeline, PipelineError, TransitError};
use crate::models::{Arrival, ScheduleRelationship, ViewState};
use crate::provider::{DepartureRecord, TransitProvider};
use crate::stops::require_stops;

/// Parses `H:M[:S]` into an offset from midnight. Hours past 23 are kept, as
/// GTFS uses them for trips running after midnight.
pub fn parse_time_of_day(raw: &str) -> Option<TimeDelta> {
    let mut parts = raw.trim().split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = match parts.next() {
        Some(s) => s.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() || hours < 0 || !(0..60).contains(&minutes) || !(0..60).contains(&seconds) {
        return None;
    }
    TimeDelta::try_seconds(hours * 3600 + minutes * 60 + seconds)
}

/// Places a wall-clock departure time on today's date in `now`'s zone,
/// rolling it to the next day when that instant has already passed.
pub fn departure_instant<Z: TimeZone>(raw: &str, now: &DateTime<Z>) -> Option<DateTime<Z>> {
    let offset = parse_time_of_day(raw)?;
    let zone = now.timezone();
    let today = now.date_naive();

    let instant = on_day(&zone, today, offset)?;
    if instant < *now {
        on_day(&zone, today.succ_opt()?, offset)
    } else {
        Some(instant)
    }
}

fn on_day<Z: TimeZone>(zone: &Z, date: NaiveDate, offset: TimeDelta) -> Option<DateTime<Z>> {
    let wall = date.and_hms_opt(0, 0, 0)?.checked_add_signed(offset)?;
    // An ambiguous wall time takes its first occurrence; one skipped by a
    // spring-forward gap is read an hour later.
    zone.from_local_datetime(&wall).earliest().or_else(|| {
        let shifted = wall.checked_add_signed(TimeDelta::hours(1))?;
        zone.from_local_datetime(&shifted).earliest()
    })
}

pub fn minutes_until<Z: TimeZone>(instant: &DateTime<Z>, now: &DateTime<Z>) -> i64 {
    let millis = (instant.timestamp_millis() - now.timestamp_millis()) as f64;
    (millis / 60_000.0).round() as i64
}

fn normalize_departure<Z: TimeZone>(
    record: &DepartureRecord,
    now: &DateTime<Z>,
    horizon_minutes: i64,
) -> Option<Arrival> {
    let relationship = record
        .trip
        .schedule_relationship
        .unwrap_or(ScheduleRelationship::Unknown);
    if relationship == ScheduleRelationship::Static {
        return None;
    }

    let departure_time = record
        .departure
        .estimated
        .as_deref()
        .or(record.departure.scheduled.as_deref())?;

    let instant = match departure_instant(departure_time, now) {
        Some(instant) => instant,
        None => {
            warn!(
                "Skipping departure with unreadable time '{}' (trip {:?})",
                departure_time, record.trip.trip_id
            );
            return None;
        }
    };

    let minutes = minutes_until(&instant, now);
    if minutes > horizon_minutes {
        return None;
    }

    Some(Arrival {
        id: record.trip.trip_id.clone().unwrap_or_default(),
        scheduled_arrival: record.arrival.scheduled.clone(),
        scheduled_departure: record.departure.scheduled.clone(),
        estimated_arrival: record.arrival.estimated.clone(),
        estimated_departure: record.departure.estimated.clone(),
        minutes_until_departure: minutes,
        schedule_relationship: relationship,
        trip_headsign: record.trip.trip_headsign.clone().unwrap_or_default(),
    })
}

/// Turns raw departures into imminent, live-tracked arrivals, soonest first.
pub fn normalize_departures<Z: TimeZone>(
    records: &[DepartureRecord],
    now: &DateTime<Z>,
    horizon_minutes: i64,
) -> Vec<Arrival> {
    let mut arrivals: Vec<Arrival> = records
        .iter()
        .filter_map(|record| normalize_departure(record, now, horizon_minutes))
        .collect();
    arrivals.sort_by_key(|arrival| arrival.minutes_until_departure);
    arrivals
}

/// One departures round trip for `stop_id`, normalized against `now`.
pub async fn fetch_arrivals(
    provider: &dyn TransitProvider,
    stop_id: &str,
    limit: usize,
    horizon_minutes: i64,
    now: &DateTime<Tz>,
) -> Result<Vec<Arrival>, TransitError> {
    let response = provider.departures(stop_id, limit).await?;
    let stop = require_stops(response.stops)?
        .into_iter()
        .next()
        .ok_or_else(|| TransitError::MalformedBody("departures response has no stop".to_string()))?;

    let arrivals = normalize_departures(&stop.departures, now, horizon_minutes);
    info!(
        "Formatted {} of {} departures for stop {}",
        arrivals.len(),
        stop.departures.len(),
        stop_id
    );
    Ok(arrivals)
}

/// What a board load produced. A superseded load still carries its own
/// arrivals, which were not published to the board.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
    Current(T),
    Superseded(T),
}

impl<T> Loaded<T> {
    pub fn is_current(&self) -> bool {
        matches!(self, Loaded::Current(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Loaded::Current(data) | Loaded::Superseded(data) => data,
        }
    }
}

/// Departures for the selected stop. Each load replaces the board.
pub struct ArrivalsBoard {
    provider: Arc<dyn TransitProvider>,
    limit: usize,
    horizon_minutes: i64,
    timezone: Tz,
    sequencer: RequestSequencer,
    state: watch::Sender<ViewState<Vec<Arrival>>>,
}

impl ArrivalsBoard {
    pub fn new(provider: Arc<dyn TransitProvider>, config: &TransitConfig) -> Self {
        let (state, _) = watch::channel(ViewState::default());
        Self {
            provider,
            limit: config.departures_limit,
            horizon_minutes: config.arrival_horizon_minutes,
            timezone: config.timezone,
            sequencer: RequestSequencer::new(),
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState<Vec<Arrival>>> {
        self.state.subscribe()
    }

    pub fn view(&self) -> ViewState<Vec<Arrival>> {
        self.state.borrow().clone()
    }

    pub fn arrivals(&self) -> Vec<Arrival> {
        self.state.borrow().data.clone()
    }

    pub async fn load(&self, stop_id: &str) -> Result<Loaded<Vec<Arrival>>, PipelineError> {
        let now = Utc::now().with_timezone(&self.timezone);
        self.load_at(stop_id, now).await
    }

    pub async fn load_at(
        &self,
        stop_id: &str,
        now: DateTime<Tz>,
    ) -> Result<Loaded<Vec<Arrival>>, PipelineError> {
        let ticket = self.sequencer.issue();
        self.state.send_modify(|view| {
            view.loading = true;
            view.error = None;
        });

        let result = fetch_arrivals(
            self.provider.as_ref(),
            stop_id,
            self.limit,
            self.horizon_minutes,
            &now,
        )
        .await
        .map_err(|source| PipelineError::new(Pipeline::Arrivals, source));

        if !self.sequencer.is_latest(ticket) {
            debug!("Not publishing superseded departures for stop {}", stop_id);
            return result.map(Loaded::Superseded);
        }

        match result {
            Ok(arrivals) => {
                self.state.send_modify(|view| {
                    view.data = arrivals.clone();
                    view.loading = false;
                    view.error = None;
                });
                Ok(Loaded::Current(arrivals))
            }
            Err(err) => {
                error!("Failed to fetch or process arrivals: {}", err);
                self.state.send_modify(|view| {
                    view.data.clear();
                    view.loading = false;
                    view.error = Some(err.user_message().to_string());
                });
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LOAD_FAILED_MESSAGE;
    use crate::models::BoundingBox;
    use crate::provider::{
        DepartureStop, DeparturesResponse, ProviderFuture, StopTimeRecord, StopsResponse,
        TripRecord,
    };
    use chrono_tz::Europe::Dublin;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    fn at(day: u32, h: u32, m: u32, s: u32) -> DateTime<Tz> {
        Dublin.with_ymd_and_hms(2025, 3, day, h, m, s).unwrap()
    }

    fn departure(
        trip: &str,
        scheduled: &str,
        estimated: Option<&str>,
        relationship: ScheduleRelationship,
    ) -> DepartureRecord {
        DepartureRecord {
            arrival: StopTimeRecord {
                scheduled: Some(scheduled.to_string()),
                estimated: estimated.map(str::to_string),
            },
            departure: StopTimeRecord {
                scheduled: Some(scheduled.to_string()),
                estimated: estimated.map(str::to_string),
            },
            trip: TripRecord {
                trip_id: Some(trip.to_string()),
                trip_headsign: Some(format!("To {}", trip)),
                schedule_relationship: Some(relationship),
            },
        }
    }

    fn one_stop(departures: Vec<DepartureRecord>) -> DeparturesResponse {
        DeparturesResponse {
            stops: Some(vec![DepartureStop { departures }]),
        }
    }

    fn trip_ids(arrivals: &[Arrival]) -> Vec<&str> {
        arrivals.iter().map(|a| a.id.as_str()).collect()
    }

    #[test]
    fn parses_gtfs_times() {
        assert_eq!(parse_time_of_day("23:55:00"), TimeDelta::try_seconds(86_100));
        assert_eq!(parse_time_of_day("25:10:30"), TimeDelta::try_seconds(90_630));
        assert_eq!(parse_time_of_day("07:05"), TimeDelta::try_seconds(25_500));
        assert_eq!(parse_time_of_day("7:61:00"), None);
        assert_eq!(parse_time_of_day("soon"), None);
        assert_eq!(parse_time_of_day("1:2:3:4"), None);
    }

    #[test]
    fn same_day_departure_does_not_roll_over() {
        let now = at(10, 23, 50, 0);
        let instant = departure_instant("23:55:00", &now).unwrap();
        assert_eq!(instant, at(10, 23, 55, 0));
        assert_eq!(minutes_until(&instant, &now), 5);
    }

    #[test]
    fn after_midnight_departure_rolls_to_next_day() {
        let now = at(10, 23, 50, 0);
        let instant = departure_instant("00:05:00", &now).unwrap();
        assert_eq!(instant, at(11, 0, 5, 0));
        assert_eq!(minutes_until(&instant, &now), 15);
    }

    #[test]
    fn minutes_are_rounded() {
        let now = at(10, 12, 0, 0);
        assert_eq!(minutes_until(&at(10, 12, 2, 29), &now), 2);
        assert_eq!(minutes_until(&at(10, 12, 2, 30), &now), 3);
        assert_eq!(minutes_until(&now, &now), 0);
    }

    #[test]
    fn countdown_spans_spring_forward() {
        // Clocks jump from 01:00 GMT to 02:00 IST on 30 March 2025.
        let now = at(30, 0, 50, 0);
        let instant = departure_instant("02:15:00", &now).unwrap();
        assert_eq!(minutes_until(&instant, &now), 25);

        let skipped = departure_instant("01:30:00", &now).unwrap();
        assert_eq!(skipped, at(30, 2, 30, 0));
        assert_eq!(minutes_until(&skipped, &now), 40);
    }

    #[test]
    fn countdown_spans_fall_back() {
        // 02:00 IST becomes 01:00 GMT on 26 October 2025.
        let now = Dublin.with_ymd_and_hms(2025, 10, 26, 0, 50, 0).unwrap();
        let repeated = departure_instant("01:30:00", &now).unwrap();
        assert_eq!(minutes_until(&repeated, &now), 40);

        let after = departure_instant("02:10:00", &now).unwrap();
        assert_eq!(minutes_until(&after, &now), 140);
    }

    #[test]
    fn static_and_distant_departures_are_filtered_and_rest_sorted() {
        let now = at(10, 12, 0, 0);
        let records = vec![
            departure("late", "12:30:00", Some("12:40:00"), ScheduleRelationship::Scheduled),
            departure("timetable", "12:05:00", None, ScheduleRelationship::Static),
            departure("far", "13:21:00", None, ScheduleRelationship::Scheduled),
            departure("edge", "13:20:00", None, ScheduleRelationship::Added),
            departure("soon", "12:03:00", None, ScheduleRelationship::Scheduled),
        ];

        let arrivals = normalize_departures(&records, &now, 80);
        let order: Vec<(&str, i64)> = arrivals
            .iter()
            .map(|a| (a.id.as_str(), a.minutes_until_departure))
            .collect();
        assert_eq!(order, vec![("soon", 3), ("late", 40), ("edge", 80)]);
        assert_eq!(arrivals[1].estimated_departure.as_deref(), Some("12:40:00"));
        assert_eq!(arrivals[1].trip_headsign, "To late");
    }

    #[test]
    fn departure_already_gone_falls_outside_horizon() {
        let now = at(10, 12, 0, 0);
        let records = vec![departure("gone", "11:59:00", None, ScheduleRelationship::Scheduled)];
        assert!(normalize_departures(&records, &now, 80).is_empty());
    }

    #[test]
    fn unreadable_or_missing_times_are_skipped() {
        let now = at(10, 12, 0, 0);
        let mut missing = departure("missing", "12:10:00", None, ScheduleRelationship::Scheduled);
        missing.departure = StopTimeRecord::default();
        let records = vec![
            departure("garbled", "noon", None, ScheduleRelationship::Scheduled),
            missing,
        ];
        assert!(normalize_departures(&records, &now, 80).is_empty());
    }

    /// Answers departures per stop id, each after its own delay. Unknown
    /// stops get a 404.
    #[derive(Default)]
    struct DeparturesByStop {
        boards: Mutex<HashMap<String, (Duration, Result<DeparturesResponse, TransitError>)>>,
    }

    impl DeparturesByStop {
        fn with(
            self: Arc<Self>,
            stop_id: &str,
            delay: Duration,
            response: Result<DeparturesResponse, TransitError>,
        ) -> Arc<Self> {
            self.boards
                .lock()
                .unwrap()
                .insert(stop_id.to_string(), (delay, response));
            self
        }
    }

    impl TransitProvider for DeparturesByStop {
        fn stops_in_bbox<'a>(
            &'a self,
            _bbox: BoundingBox,
            _limit: usize,
        ) -> ProviderFuture<'a, StopsResponse> {
            Box::pin(async { Ok(StopsResponse::default()) })
        }

        fn search_stops<'a>(
            &'a self,
            _query: &'a str,
            _operators: &'a [String],
            _limit: usize,
        ) -> ProviderFuture<'a, StopsResponse> {
            Box::pin(async { Ok(StopsResponse::default()) })
        }

        fn stops_served_by<'a>(
            &'a self,
            _operators: &'a [String],
            _limit: usize,
        ) -> ProviderFuture<'a, StopsResponse> {
            Box::pin(async { Ok(StopsResponse::default()) })
        }

        fn departures<'a>(
            &'a self,
            stop_id: &'a str,
            _limit: usize,
        ) -> ProviderFuture<'a, DeparturesResponse> {
            let (delay, response) = self
                .boards
                .lock()
                .unwrap()
                .remove(stop_id)
                .unwrap_or((Duration::ZERO, Err(TransitError::Status(404))));
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                response
            })
        }
    }

    #[tokio::test]
    async fn board_publishes_sorted_arrivals() {
        let provider = Arc::new(DeparturesByStop::default()).with(
            "s-gc7x-kilbarrack",
            Duration::ZERO,
            Ok(one_stop(vec![
                departure("b", "12:20:00", None, ScheduleRelationship::Scheduled),
                departure("a", "12:10:00", None, ScheduleRelationship::Scheduled),
            ])),
        );
        let board = ArrivalsBoard::new(provider, &TransitConfig::default());

        let outcome = board.load_at("s-gc7x-kilbarrack", at(10, 12, 0, 0)).await.unwrap();
        assert!(outcome.is_current());
        assert_eq!(trip_ids(&outcome.into_inner()), vec!["a", "b"]);

        assert_eq!(trip_ids(&board.arrivals()), vec!["a", "b"]);
        assert!(!board.view().loading);
    }

    #[tokio::test]
    async fn empty_stops_array_is_an_error() {
        let provider = Arc::new(DeparturesByStop::default()).with(
            "s-x",
            Duration::ZERO,
            Ok(DeparturesResponse {
                stops: Some(vec![]),
            }),
        );
        let board = ArrivalsBoard::new(provider, &TransitConfig::default());

        let err = board.load_at("s-x", at(10, 12, 0, 0)).await.unwrap_err();
        assert!(matches!(err.source, TransitError::MalformedBody(_)));
        assert_eq!(board.view().error.as_deref(), Some(LOAD_FAILED_MESSAGE));
    }

    #[tokio::test]
    async fn failure_clears_previous_arrivals() {
        let provider = Arc::new(DeparturesByStop::default()).with(
            "s-x",
            Duration::ZERO,
            Ok(one_stop(vec![departure(
                "a",
                "12:10:00",
                None,
                ScheduleRelationship::Scheduled,
            )])),
        );
        let board = ArrivalsBoard::new(provider, &TransitConfig::default());
        board.load_at("s-x", at(10, 12, 0, 0)).await.unwrap();
        assert_eq!(board.arrivals().len(), 1);

        // Unknown stop gets the provider's 404.
        assert!(board.load_at("s-y", at(10, 12, 0, 0)).await.is_err());
        let view = board.view();
        assert!(view.data.is_empty());
        assert_eq!(view.error.as_deref(), Some(LOAD_FAILED_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_load_returns_its_own_stop() {
        let provider = Arc::new(DeparturesByStop::default())
            .with(
                "s-slow",
                Duration::from_secs(3),
                Ok(one_stop(vec![departure(
                    "slow-trip",
                    "12:10:00",
                    None,
                    ScheduleRelationship::Scheduled,
                )])),
            )
            .with(
                "s-fast",
                Duration::from_millis(100),
                Ok(one_stop(vec![departure(
                    "fast-trip",
                    "12:05:00",
                    None,
                    ScheduleRelationship::Scheduled,
                )])),
            );
        let board = Arc::new(ArrivalsBoard::new(provider, &TransitConfig::default()));

        let slow = {
            let board = board.clone();
            tokio::spawn(async move { board.load_at("s-slow", at(10, 12, 0, 0)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let fast = board.load_at("s-fast", at(10, 12, 0, 0)).await.unwrap();
        assert_eq!(trip_ids(&fast.into_inner()), vec!["fast-trip"]);

        let slow = slow.await.unwrap().unwrap();
        assert!(!slow.is_current());
        assert_eq!(trip_ids(&slow.into_inner()), vec!["slow-trip"]);

        assert_eq!(trip_ids(&board.arrivals()), vec!["fast-trip"]);
        assert!(!board.view().loading);
    }
}
