use crate::insight::QuickInsightParams;

/// One deterministic insight rule: a predicate over the request and a
/// renderer for the message.
struct TemplateRule {
    matches: fn(&QuickInsightParams) -> bool,
    render: fn(&QuickInsightParams) -> String,
}

// Evaluated top to bottom, first match wins. Streak rules come before
// completion-rate rules; the order is part of the contract.
const RULES: &[TemplateRule] = &[
    TemplateRule {
        matches: |p| p.streak == 0,
        render: |p| {
            format!(
                "Every streak starts with day 1. Make today day 1 for {}.",
                p.habit_name.trim()
            )
        },
    },
    TemplateRule {
        matches: |p| p.streak == 1,
        render: |p| {
            format!(
                "Day 1 is done. Show up for {} again tomorrow and it starts becoming momentum.",
                p.habit_name.trim()
            )
        },
    },
    TemplateRule {
        matches: |p| (7..14).contains(&p.streak),
        render: |p| {
            format!(
                "One week of {} in a row — a full week is where habits start to stick.",
                p.habit_name.trim()
            )
        },
    },
    TemplateRule {
        matches: |p| p.streak >= 21,
        render: |p| {
            format!(
                "{} days of {} speaks for itself. Protect the chain.",
                p.streak,
                p.habit_name.trim()
            )
        },
    },
    TemplateRule {
        matches: |p| p.completion_rate >= 80.0,
        render: |p| {
            format!(
                "{:.0}% completion on {} — that kind of consistency is rare. Keep it up.",
                p.completion_rate,
                p.habit_name.trim()
            )
        },
    },
    TemplateRule {
        matches: |p| p.completion_rate < 50.0,
        render: |p| {
            format!(
                "Try a smaller version of {} — one you can finish even on rough days.",
                p.habit_name.trim()
            )
        },
    },
];

/// Deterministic, rule-based insight requiring no AI call. `None` means no
/// rule matched and the caller should fall through to the AI path (or the
/// fallback message when AI is disabled).
pub fn template_insight(params: &QuickInsightParams) -> Option<String> {
    RULES
        .iter()
        .find(|rule| (rule.matches)(params))
        .map(|rule| (rule.render)(params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(streak: u32, completion_rate: f32) -> QuickInsightParams {
        QuickInsightParams {
            habit_name: "Morning run".to_string(),
            streak,
            completion_rate,
        }
    }

    #[test]
    fn test_streak_zero_mentions_day_1() {
        let insight = template_insight(&params(0, 60.0)).unwrap();
        assert!(insight.contains("day 1"));
    }

    #[test]
    fn test_streak_one_mentions_day_1_done() {
        let insight = template_insight(&params(1, 60.0)).unwrap();
        assert!(insight.contains("Day 1 is done"));
    }

    #[test]
    fn test_week_streak_boundaries() {
        assert!(template_insight(&params(7, 60.0)).unwrap().contains("One week"));
        assert!(template_insight(&params(13, 60.0)).unwrap().contains("One week"));
        // 14 falls out of the week rule and (with mid-range completion) out of
        // every other rule
        assert!(template_insight(&params(14, 60.0)).is_none());
    }

    #[test]
    fn test_long_streak_includes_count() {
        let insight = template_insight(&params(21, 60.0)).unwrap();
        assert!(insight.contains("21"));
        let insight = template_insight(&params(45, 60.0)).unwrap();
        assert!(insight.contains("45"));
    }

    #[test]
    fn test_high_completion_mentions_percentage() {
        let insight = template_insight(&params(3, 80.0)).unwrap();
        assert!(insight.contains("80%"));
        let insight = template_insight(&params(3, 92.4)).unwrap();
        assert!(insight.contains("92%"));
    }

    #[test]
    fn test_low_completion_suggests_smaller_version() {
        let insight = template_insight(&params(3, 49.9)).unwrap();
        assert!(insight.contains("smaller version"));
    }

    #[test]
    fn test_no_match_falls_through() {
        // Mid streak, mid completion: no rule applies
        assert!(template_insight(&params(3, 60.0)).is_none());
        assert!(template_insight(&params(15, 79.9)).is_none());
    }

    #[test]
    fn test_streak_rules_win_over_completion_rules() {
        // streak 8 + completion 90: the week rule fires, not the percentage one
        let insight = template_insight(&params(8, 90.0)).unwrap();
        assert!(insight.contains("One week"));

        // streak 25 + completion 10: the long-streak rule fires, not the
        // smaller-version one
        let insight = template_insight(&params(25, 10.0)).unwrap();
        assert!(insight.contains("25"));

        // streak 0 + completion 90: day-1 rule fires first
        let insight = template_insight(&params(0, 90.0)).unwrap();
        assert!(insight.contains("day 1"));
    }
}
