//! Input bound limits and validation

use crate::error::{MarketError, MarketResult};

pub const MAX_NEED_LEN: usize = 50_000;
pub const MAX_CONTEXT_LEN: usize = 100_000;
pub const MAX_RESULT_LEN: usize = 500_000;
pub const MAX_FEEDBACK_LEN: usize = 5_000;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_CAPABILITIES_LEN: usize = 2_000;
pub const MAX_TAGS: usize = 10;
pub const MAX_TAG_LEN: usize = 50;
pub const MIN_TASK_CREDITS: u64 = 1;
pub const MAX_TASK_CREDITS: u64 = 100_000;
pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

fn check_len(field: &str, value: &str, max: usize) -> MarketResult<()> {
    if value.chars().count() > max {
        return Err(MarketError::InvalidInput(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(())
}

fn check_not_empty(field: &str, value: &str) -> MarketResult<()> {
    if value.trim().is_empty() {
        return Err(MarketError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Validate an agent display name.
pub fn validate_name(name: &str) -> MarketResult<()> {
    check_not_empty("name", name)?;
    check_len("name", name, MAX_NAME_LEN)
}

/// Validate an agent capability description.
pub fn validate_capabilities(capabilities: &str) -> MarketResult<()> {
    check_len("capabilities", capabilities, MAX_CAPABILITIES_LEN)
}

/// Validate a task need statement.
pub fn validate_need(need: &str) -> MarketResult<()> {
    check_not_empty("need", need)?;
    check_len("need", need, MAX_NEED_LEN)
}

/// Validate optional task context.
pub fn validate_context(context: &str) -> MarketResult<()> {
    check_len("context", context, MAX_CONTEXT_LEN)
}

/// Validate a delivery result.
pub fn validate_result(result: &str) -> MarketResult<()> {
    check_len("result", result, MAX_RESULT_LEN)
}

/// Validate rejection reason or rating feedback.
pub fn validate_feedback(feedback: &str) -> MarketResult<()> {
    check_len("feedback", feedback, MAX_FEEDBACK_LEN)
}

/// Validate the credit cap of a new task.
pub fn validate_max_credits(max_credits: u64) -> MarketResult<()> {
    if !(MIN_TASK_CREDITS..=MAX_TASK_CREDITS).contains(&max_credits) {
        return Err(MarketError::InvalidInput(format!(
            "max_credits must be between {MIN_TASK_CREDITS} and {MAX_TASK_CREDITS}"
        )));
    }
    Ok(())
}

/// Validate a rating score.
pub fn validate_rating(score: u8) -> MarketResult<()> {
    if !(MIN_RATING..=MAX_RATING).contains(&score) {
        return Err(MarketError::InvalidInput(format!(
            "rating must be between {MIN_RATING} and {MAX_RATING}"
        )));
    }
    Ok(())
}

/// Validate a tag set: at most `MAX_TAGS` tags, each non-empty, at most
/// `MAX_TAG_LEN` characters, drawn from `[a-z0-9_-]`.
pub fn validate_tags(tags: &[String]) -> MarketResult<()> {
    if tags.len() > MAX_TAGS {
        return Err(MarketError::InvalidInput(format!(
            "at most {MAX_TAGS} tags per task"
        )));
    }
    for tag in tags {
        if tag.is_empty() || tag.len() > MAX_TAG_LEN {
            return Err(MarketError::InvalidInput(format!(
                "tag {tag:?} must be 1-{MAX_TAG_LEN} characters"
            )));
        }
        if !tag
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        {
            return Err(MarketError::InvalidInput(format!(
                "tag {tag:?} may only contain lowercase letters, digits, '_' and '-'"
            )));
        }
    }
    Ok(())
}
