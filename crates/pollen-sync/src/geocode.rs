//! Process-lifetime reverse-geocode cache keyed by H3 cell id.

use std::collections::HashMap;
use std::sync::Arc;

use pollen_adapters::{AdapterError, ReverseGeocoder};
use pollen_core::{cell_to_lat_lng, PlaceInfo};
use pollen_storage::{Store, StoreError};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Cell id → place lookup shared by every sync routine of a run.
///
/// The only constructor is [`GeocodeCache::warm`], so a cache always starts from the
/// enrichment already persisted. Each cell id is looked up upstream at most once;
/// concurrent callers for the same cell wait on the first lookup instead of issuing
/// their own. Entries are never evicted.
pub struct GeocodeCache {
    geocoder: Arc<dyn ReverseGeocoder>,
    entries: Mutex<HashMap<String, Arc<OnceCell<PlaceInfo>>>>,
}

impl GeocodeCache {
    pub async fn warm(
        geocoder: Arc<dyn ReverseGeocoder>,
        store: &dyn Store,
    ) -> Result<Self, StoreError> {
        let places = store.cached_places().await?;
        let mut entries = HashMap::with_capacity(places.len());
        for (cell_id, place) in places {
            entries.insert(cell_id, Arc::new(OnceCell::new_with(Some(place))));
        }
        info!(entries = entries.len(), "geocode cache warmed from storage");
        Ok(Self {
            geocoder,
            entries: Mutex::new(entries),
        })
    }

    /// Number of cell ids with a known or pending place.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn resolve(&self, cell_id: &str) -> Result<PlaceInfo, AdapterError> {
        let slot = {
            let mut entries = self.entries.lock().await;
            entries.entry(cell_id.to_string()).or_default().clone()
        };
        let place = slot.get_or_try_init(|| self.lookup(cell_id)).await?;
        Ok(place.clone())
    }

    async fn lookup(&self, cell_id: &str) -> Result<PlaceInfo, AdapterError> {
        let (lat, lng) = match cell_to_lat_lng(cell_id) {
            Ok(center) => center,
            Err(err) => {
                warn!(cell_id, error = %err, "not an H3 cell; leaving place empty");
                return Ok(PlaceInfo::default());
            }
        };
        debug!(cell_id, lat, lng, "reverse geocoding");
        let place = self.geocoder.reverse(lat, lng).await?;
        Ok(PlaceInfo {
            lat,
            lng,
            address: place.display_name,
            suburb: place.address.suburb,
            city: place.address.city,
            state: place.address.state,
            town: place.address.town,
            county: place.address.county,
        })
    }
}
