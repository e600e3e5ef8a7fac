use std::sync::Arc;

use common::{storage::db::SurrealDbClient, utils::config::AppConfig};
use research_pipeline::ResearchServices;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub research: ResearchServices,
}

impl ApiState {
    pub fn new(db: Arc<SurrealDbClient>, config: &AppConfig, research: ResearchServices) -> Self {
        Self {
            db,
            config: config.clone(),
            research,
        }
    }
}
