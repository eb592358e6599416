/// Streaming weighted mean, matching the usual metric-accumulator contract:
/// `update` folds in a batch, `value` reads the running result and the
/// accumulator is simply dropped (or replaced) to reset.
#[derive(Debug, Default, Clone)]
pub struct Mean {
    total: f64,
    weight: u64,
}

impl Mean {
    pub fn update(&mut self, value: f64, weight: u64) {
        self.total += value * weight as f64;
        self.weight += weight;
    }

    pub fn value(&self) -> Option<f64> {
        if self.weight == 0 {
            None
        } else {
            Some(self.total / self.weight as f64)
        }
    }
}

/// Loss and accuracy accumulated over one evaluation pass.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss: Mean,
    correct: u64,
    examples: u64,
}

impl EvaluationMetrics {
    pub fn update(&mut self, batch_loss: f64, correct: u64, examples: u64) {
        debug_assert!(correct <= examples);
        self.loss.update(batch_loss, examples);
        self.correct += correct;
        self.examples += examples;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.examples == 0 {
            return None;
        }
        Some(EvaluationSummary {
            accuracy: self.correct as f64 / self.examples as f64,
            mean_loss: self.loss.value().unwrap_or(0.0),
            examples: self.examples,
        })
    }
}

/// Result of evaluating one split exactly once.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationSummary {
    /// Fraction of correctly classified examples, in `[0, 1]`.
    pub accuracy: f64,
    /// Mean per-example loss, non-negative for cross entropy.
    pub mean_loss: f64,
    pub examples: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_weights_batches_by_example_count() {
        let mut mean = Mean::default();
        mean.update(2.0, 3);
        mean.update(4.0, 1);
        // (2*3 + 4*1) / 4 = 2.5
        assert!((mean.value().unwrap() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn empty_mean_has_no_value() {
        assert!(Mean::default().value().is_none());
    }

    #[test]
    fn summary_reports_bounded_accuracy() {
        let mut metrics = EvaluationMetrics::default();
        metrics.update(0.7, 8, 10);
        metrics.update(0.5, 5, 10);
        let summary = metrics.finalize().unwrap();
        assert!((summary.accuracy - 0.65).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&summary.accuracy));
        assert!(summary.mean_loss >= 0.0);
        assert_eq!(summary.examples, 20);
    }

    #[test]
    fn empty_pass_produces_no_summary() {
        assert!(EvaluationMetrics::default().finalize().is_none());
    }
}
