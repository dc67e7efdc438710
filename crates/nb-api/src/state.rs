use std::sync::Arc;

use nb_driver::PoolDriver;

use crate::config::AppConfig;
use crate::placements::PlacementStore;

#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<PoolDriver>,
    pub placements: Arc<dyn PlacementStore>,
    pub config: AppConfig,
}
