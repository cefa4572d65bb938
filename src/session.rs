//! One map screen's worth of state: debounced viewport and search inputs
//! feeding the stop pipelines. This is the in-process surface; HTTP clients
//! debounce on their side.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::TransitConfig;
use crate::debounce::{Debounced, Debouncer};
use crate::models::{Region, Stop, ViewState};
use crate::provider::TransitProvider;
use crate::search::StopSearch;
use crate::stops::{Refresh, StopCollection, StopLookup};

pub struct MapSession {
    lookup: Arc<StopLookup>,
    search: Arc<StopSearch>,
    regions: Debouncer<Region>,
    queries: Debouncer<String>,
    workers: Vec<JoinHandle<()>>,
}

impl MapSession {
    /// Must be called from within a tokio runtime.
    pub fn new(provider: Arc<dyn TransitProvider>, config: &TransitConfig) -> Self {
        let lookup = Arc::new(StopLookup::new(provider.clone(), config));
        let search = Arc::new(StopSearch::new(provider, config));
        let (regions, settled_regions) = Debouncer::new(config.debounce);
        let (queries, settled_queries) = Debouncer::new(config.debounce);

        let workers = vec![
            tokio::spawn(refresh_on_region(lookup.clone(), settled_regions)),
            tokio::spawn(search_on_query(search.clone(), settled_queries)),
        ];

        Self {
            lookup,
            search,
            regions,
            queries,
            workers,
        }
    }

    /// Called on every pan/zoom settle event from the map view.
    pub fn region_changed(&mut self, region: Region) {
        self.regions.push(region);
    }

    /// Called on every keystroke in the search box.
    pub fn query_changed(&mut self, query: impl Into<String>) {
        self.queries.push(query.into());
    }

    pub fn stops(&self) -> watch::Receiver<ViewState<StopCollection>> {
        self.lookup.subscribe()
    }

    pub fn search_results(&self) -> watch::Receiver<ViewState<Vec<Stop>>> {
        self.search.subscribe()
    }
}

impl Drop for MapSession {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

// Each settled value fires its own request; the pipelines drop responses
// that a later request has superseded.
async fn refresh_on_region(lookup: Arc<StopLookup>, mut settled: Debounced<Region>) {
    while let Some(region) = settled.recv().await {
        let lookup = lookup.clone();
        tokio::spawn(async move {
            // Failures land in the stop view.
            if let Ok(Refresh::Superseded) = lookup.refresh(region).await {
                debug!("Viewport refresh superseded by a later pan");
            }
        });
    }
}

async fn search_on_query(search: Arc<StopSearch>, mut settled: Debounced<String>) {
    while let Some(query) = settled.recv().await {
        let search = search.clone();
        tokio::spawn(async move {
            // Failures land in the search view.
            if let Ok(Refresh::Superseded) = search.search(&query).await {
                debug!("Search for \"{}\" superseded by a later query", query);
            }
        });
    }
}
