use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub http_port: u16,
    #[serde(default = "default_engine_url")]
    pub research_engine_url: String,
    #[serde(default = "default_worker_count")]
    pub research_worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub research_queue_capacity: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub research_job_timeout_secs: u64,
    #[serde(default = "default_search_min_query_len")]
    pub research_search_min_query_len: usize,
    #[serde(default = "default_max_question_bytes")]
    pub research_max_question_bytes: usize,
}

fn default_engine_url() -> String {
    "http://127.0.0.1:8100".to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

// Matches the hard time limit research tasks always had.
fn default_job_timeout_secs() -> u64 {
    3600
}

fn default_search_min_query_len() -> usize {
    3
}

fn default_max_question_bytes() -> usize {
    4_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "research".to_string(),
            surrealdb_database: "research".to_string(),
            http_port: 3000,
            research_engine_url: default_engine_url(),
            research_worker_count: default_worker_count(),
            research_queue_capacity: default_queue_capacity(),
            research_job_timeout_secs: default_job_timeout_secs(),
            research_search_min_query_len: default_search_min_query_len(),
            research_max_question_bytes: default_max_question_bytes(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
