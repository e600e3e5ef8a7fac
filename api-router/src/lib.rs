use api_state::ApiState;
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, patch, post},
    Router,
};
use routes::{
    health::{live, ready},
    research::{
        cancel_research_job, delete_research_job, get_research_job, list_research_jobs,
        search_research_jobs, submit_research, update_research_metadata,
    },
    stream::stream_research_progress,
};

pub mod api_state;
pub mod error;
mod routes;

const REQUEST_BODY_HEADROOM_BYTES: usize = 16 * 1024;

/// Router for API functionality, version 1
pub fn api_routes_v1<S>(app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Health checks for k8s/systemd
    let health = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    let research = Router::new()
        .route("/research", post(submit_research).get(list_research_jobs))
        .route("/research/search", get(search_research_jobs))
        .route(
            "/research/{id}",
            get(get_research_job).delete(delete_research_job),
        )
        .route(
            "/research/{id}/cancel",
            post(cancel_research_job).delete(cancel_research_job),
        )
        .route("/research/{id}/metadata", patch(update_research_metadata))
        .route("/research/{id}/stream", get(stream_research_progress))
        .layer(DefaultBodyLimit::max(
            app_state
                .config
                .research_max_question_bytes
                .saturating_add(REQUEST_BODY_HEADROOM_BYTES),
        ));

    health.merge(research)
}

#[cfg(test)]
mod tests;
