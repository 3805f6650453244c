//! Best-model selection.

use crate::parser::ModelStatistics;

/// Model number with the fewest bound violations; the lowest model number
/// wins ties. `None` for an empty set.
pub fn pick_best(stats: &[ModelStatistics]) -> Option<usize> {
    stats
        .iter()
        .min_by_key(|s| (s.bound_violations(), s.model))
        .map(|s| s.model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(model: usize, upper: u32, lower: u32) -> ModelStatistics {
        ModelStatistics {
            model,
            num_upper_bound_violations: upper,
            num_lower_bound_violations: lower,
            ..ModelStatistics::default()
        }
    }

    #[test]
    fn test_pick_fewest_violations() {
        let set = [stats(1, 5, 2), stats(2, 1, 1), stats(3, 4, 0)];
        assert_eq!(pick_best(&set), Some(2));
    }

    #[test]
    fn test_tie_goes_to_lowest_model() {
        let set = [stats(1, 3, 3), stats(2, 2, 0), stats(3, 0, 2), stats(4, 1, 1)];
        assert_eq!(pick_best(&set), Some(2));
    }

    #[test]
    fn test_upper_and_lower_count_equally() {
        let set = [stats(1, 0, 4), stats(2, 4, 0)];
        assert_eq!(pick_best(&set), Some(1));
    }

    #[test]
    fn test_empty() {
        assert_eq!(pick_best(&[]), None);
    }
}
