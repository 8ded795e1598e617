use crate::dataset::EvalType;
use crate::metrics::Metric;
use std::collections::BTreeSet;

const SINGLE_TURN: &[Metric] = &[
    Metric::AnswerRelevancy,
    Metric::TaskCompletion,
    Metric::Hallucination,
    Metric::Toxicity,
    Metric::Bias,
    Metric::Faithfulness,
];

/// Single-turn metrics applied to the final exchange plus the conversational set.
const CONVERSATIONAL: &[Metric] = &Metric::ALL;

/// Metrics that apply to an eval type.
///
/// Multi-turn and autonomous items get all nine: single-turn metrics read the
/// final exchange and conversational metrics read the whole transcript.
pub fn applicable_metrics(eval_type: EvalType) -> &'static [Metric] {
    match eval_type {
        EvalType::SingleTurn => SINGLE_TURN,
        EvalType::MultiTurn | EvalType::Autonomous => CONVERSATIONAL,
    }
}

/// Applicable metrics restricted to a run's metric selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricRegistry {
    selection: Option<BTreeSet<Metric>>,
}

impl MetricRegistry {
    /// Registry without a selection: every applicable metric is scored.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_selection(selection: impl IntoIterator<Item = Metric>) -> Self {
        Self {
            selection: Some(selection.into_iter().collect()),
        }
    }

    pub fn selection(&self) -> Option<&BTreeSet<Metric>> {
        self.selection.as_ref()
    }

    /// Metrics to score for an item, in canonical order.
    pub fn metrics_for(&self, eval_type: EvalType) -> Vec<Metric> {
        applicable_metrics(eval_type)
            .iter()
            .copied()
            .filter(|m| self.selection.as_ref().map_or(true, |s| s.contains(m)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricKind;

    #[test]
    fn test_single_turn_set() {
        let metrics = applicable_metrics(EvalType::SingleTurn);
        assert_eq!(metrics.len(), 6);
        assert!(metrics.iter().all(|m| m.kind() == MetricKind::SingleTurn));
        assert!(metrics.contains(&Metric::Faithfulness));
    }

    #[test]
    fn test_conversational_types_get_everything() {
        for eval_type in [EvalType::MultiTurn, EvalType::Autonomous] {
            let metrics: BTreeSet<_> = applicable_metrics(eval_type).iter().copied().collect();
            assert_eq!(metrics, Metric::ALL.into_iter().collect());
        }
    }

    #[test]
    fn test_lookup_is_idempotent() {
        for eval_type in [EvalType::SingleTurn, EvalType::MultiTurn, EvalType::Autonomous] {
            let first = applicable_metrics(eval_type);
            for _ in 0..3 {
                assert_eq!(applicable_metrics(eval_type), first);
            }
        }
    }

    #[test]
    fn test_selection_intersects() {
        let registry = MetricRegistry::with_selection([Metric::Toxicity, Metric::RoleAdherence]);
        assert_eq!(registry.metrics_for(EvalType::SingleTurn), vec![Metric::Toxicity]);
        assert_eq!(
            registry.metrics_for(EvalType::MultiTurn),
            vec![Metric::Toxicity, Metric::RoleAdherence]
        );
        assert_eq!(MetricRegistry::new().metrics_for(EvalType::Autonomous).len(), 9);
    }
}
