use crate::TrainingError;

/// Piecewise-constant learning rate keyed by the global step. With
/// boundaries `[b0, b1]` and values `[v0, v1, v2]`:
///
///   step <= b0        -> v0
///   b0 < step <= b1   -> v1
///   step > b1         -> v2
#[derive(Debug, Clone)]
pub struct PiecewiseConstant {
    boundaries: Vec<usize>,
    values: Vec<f64>,
}

impl PiecewiseConstant {
    pub fn new(boundaries: Vec<usize>, values: Vec<f64>) -> Result<Self, TrainingError> {
        if values.len() != boundaries.len() + 1 {
            return Err(TrainingError::initialization(format!(
                "schedule needs exactly one more value than boundary (got {} values, {} boundaries)",
                values.len(),
                boundaries.len()
            )));
        }
        if !boundaries.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(TrainingError::initialization(
                "schedule boundaries must be strictly increasing",
            ));
        }
        if values.iter().any(|&value| value <= 0.0) {
            return Err(TrainingError::initialization(
                "schedule values must be greater than zero",
            ));
        }
        Ok(Self { boundaries, values })
    }

    pub fn lr_for_step(&self, step: usize) -> f64 {
        let index = self.boundaries.partition_point(|&boundary| boundary < step);
        self.values[index]
    }
}
