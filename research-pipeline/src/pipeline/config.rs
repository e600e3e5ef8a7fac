use std::time::Duration;

use common::utils::config::AppConfig;

#[derive(Debug, Clone)]
pub struct ResearchTuning {
    pub job_timeout: Duration,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub subscriber_capacity: usize,
}

impl Default for ResearchTuning {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(3600),
            worker_count: 4,
            queue_capacity: 256,
            subscriber_capacity: crate::progress::DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResearchConfig {
    pub tuning: ResearchTuning,
}

impl ResearchConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            tuning: ResearchTuning {
                job_timeout: Duration::from_secs(config.research_job_timeout_secs.max(1)),
                worker_count: config.research_worker_count.max(1),
                queue_capacity: config.research_queue_capacity.max(1),
                ..ResearchTuning::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_tuning_from_app_config() {
        let app = AppConfig {
            research_job_timeout_secs: 90,
            research_worker_count: 0,
            research_queue_capacity: 8,
            ..AppConfig::default()
        };

        let config = ResearchConfig::from_app_config(&app);
        assert_eq!(config.tuning.job_timeout, Duration::from_secs(90));
        assert_eq!(config.tuning.worker_count, 1);
        assert_eq!(config.tuning.queue_capacity, 8);
    }
}
