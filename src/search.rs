use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::TransitConfig;
use crate::debounce::RequestSequencer;
use crate::error::{Pipeline, PipelineError, TransitError};
use crate::models::{Stop, ViewState};
use crate::provider::TransitProvider;
use crate::stops::{normalize_stops, require_stops, Refresh};

/// Trims `query` and returns it when it is long enough to send.
pub fn searchable(query: &str, min_query_len: usize) -> Option<&str> {
    let query = query.trim();
    (query.chars().count() >= min_query_len).then_some(query)
}

/// One search round trip, without any view state.
pub async fn find_stops(
    provider: &dyn TransitProvider,
    query: &str,
    operators: &[String],
    limit: usize,
) -> Result<Vec<Stop>, TransitError> {
    info!("Searching for: \"{}\"", query);
    let response = provider.search_stops(query, operators, limit).await?;
    let records = require_stops(response.stops)?;
    Ok(normalize_stops(&records))
}

/// Free-text stop search across the configured operators. Every answer
/// replaces the previous one.
pub struct StopSearch {
    provider: Arc<dyn TransitProvider>,
    operators: Vec<String>,
    limit: usize,
    min_query_len: usize,
    sequencer: RequestSequencer,
    state: watch::Sender<ViewState<Vec<Stop>>>,
}

impl StopSearch {
    pub fn new(provider: Arc<dyn TransitProvider>, config: &TransitConfig) -> Self {
        let (state, _) = watch::channel(ViewState::default());
        Self {
            provider,
            operators: config.operators.clone(),
            limit: config.search_limit,
            min_query_len: config.min_query_len,
            sequencer: RequestSequencer::new(),
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState<Vec<Stop>>> {
        self.state.subscribe()
    }

    pub fn view(&self) -> ViewState<Vec<Stop>> {
        self.state.borrow().clone()
    }

    pub fn results(&self) -> Vec<Stop> {
        self.state.borrow().data.clone()
    }

    pub async fn search(&self, query: &str) -> Result<Refresh, PipelineError> {
        let ticket = self.sequencer.issue();

        let Some(query) = searchable(query, self.min_query_len) else {
            self.state.send_modify(|view| {
                view.data.clear();
                view.loading = false;
                view.error = None;
            });
            return Ok(Refresh::Applied(0));
        };

        self.state.send_modify(|view| {
            view.loading = true;
            view.error = None;
        });

        let result = find_stops(self.provider.as_ref(), query, &self.operators, self.limit).await;

        if !self.sequencer.is_latest(ticket) {
            debug!("Discarding superseded search response for \"{}\"", query);
            return Ok(Refresh::Superseded);
        }

        match result {
            Ok(found) => {
                let count = found.len();
                self.state.send_modify(|view| {
                    view.data = found;
                    view.loading = false;
                    view.error = None;
                });
                Ok(Refresh::Applied(count))
            }
            Err(source) => {
                let err = PipelineError::new(Pipeline::Search, source);
                error!("Failed to search for stops: {}", err);
                self.state.send_modify(|view| {
                    view.loading = false;
                    view.error = Some(err.user_message().to_string());
                });
                Err(err)
            }
        }
    }
}
