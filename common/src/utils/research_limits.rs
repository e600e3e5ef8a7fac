use super::config::AppConfig;
use crate::error::AppError;

pub fn validate_research_request(
    config: &AppConfig,
    subject_ref: &str,
    question: &str,
) -> Result<(), AppError> {
    if subject_ref.trim().is_empty() {
        return Err(AppError::Validation(
            "A dataset reference is required".to_string(),
        ));
    }

    if question.trim().is_empty() {
        return Err(AppError::Validation("Question must not be empty".to_string()));
    }

    if question.len() > config.research_max_question_bytes {
        return Err(AppError::Validation(format!(
            "Question is too large. Maximum allowed is {} bytes",
            config.research_max_question_bytes
        )));
    }

    Ok(())
}

pub fn validate_search_query(config: &AppConfig, query: &str) -> Result<(), AppError> {
    let length = query.trim().chars().count();
    if length < config.research_search_min_query_len {
        return Err(AppError::Validation(format!(
            "Search query must be at least {} characters",
            config.research_search_min_query_len
        )));
    }

    Ok(())
}
