use serde::{Deserialize, Serialize};

pub mod cache;
pub mod provider;
pub mod templates;

pub use cache::{CachedInsight, InsightCache};
pub use provider::{AnthropicCoach, CompletionUsage};
pub use templates::template_insight;

/// Request body for the quick-insight endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickInsightParams {
    pub habit_name: String,
    pub streak: u32,
    pub completion_rate: f32,
}

impl QuickInsightParams {
    /// Field-level validation beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), String> {
        if self.habit_name.trim().is_empty() {
            return Err("habit_name must not be empty".to_string());
        }
        if self.habit_name.len() > 200 {
            return Err("habit_name must be at most 200 characters".to_string());
        }
        if !(0.0..=100.0).contains(&self.completion_rate) {
            return Err("completion_rate must be between 0 and 100".to_string());
        }
        Ok(())
    }
}

/// Message served when the AI backend is disabled and no template applies.
pub fn fallback_insight(params: &QuickInsightParams) -> String {
    format!(
        "Keep showing up for {} — every completed day strengthens the habit.",
        params.habit_name.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(habit_name: &str, streak: u32, completion_rate: f32) -> QuickInsightParams {
        QuickInsightParams {
            habit_name: habit_name.to_string(),
            streak,
            completion_rate,
        }
    }

    #[test]
    fn test_validate_rejects_empty_habit() {
        assert!(params("  ", 3, 50.0).validate().is_err());
        assert!(params("Morning run", 3, 50.0).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_completion() {
        assert!(params("Morning run", 3, 101.0).validate().is_err());
        assert!(params("Morning run", 3, -1.0).validate().is_err());
        assert!(params("Morning run", 3, 0.0).validate().is_ok());
        assert!(params("Morning run", 3, 100.0).validate().is_ok());
    }

    #[test]
    fn test_fallback_mentions_habit() {
        let message = fallback_insight(&params("Meditation", 3, 60.0));
        assert!(message.contains("Meditation"));
    }
}
