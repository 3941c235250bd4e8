use rayon::prelude::*;

use crate::{Error, Result};

/// Selects calibration anchors from a scanned response: the samples that are strictly larger than
/// every other sample within `order` positions on either side. Samples closer than `order` to
/// either end of the scan are never selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMaximaPicker {
    order: usize,
}

impl LocalMaximaPicker {
    /// # Errors
    /// `InvalidConfiguration` for `order == 0`, where every sample would be its own window.
    pub fn new(order: usize) -> Result<Self> {
        if order == 0 {
            return Err(Error::invalid("local maxima window order must be at least 1"));
        }
        Ok(LocalMaximaPicker { order })
    }

    #[inline]
    #[must_use]
    pub fn order(&self) -> usize {
        self.order
    }

    /// Indices of the local maxima of `values`, in ascending order.
    #[must_use]
    pub fn indices(&self, values: &[f64]) -> Vec<usize> {
        let order = self.order;
        if values.len() <= 2 * order {
            return Vec::new();
        }
        (order..values.len() - order)
            .into_par_iter()
            .filter(|&i| {
                let y = values[i];
                values[i - order..i].iter().all(|&other| y > other)
                    && values[i + 1..=i + order].iter().all(|&other| y > other)
            })
            .collect()
    }

    /// The `(x, y)` pairs of `points` whose `y` is a local maximum.
    #[must_use]
    pub fn pick(&self, points: &[(f64, f64)]) -> Vec<(f64, f64)> {
        let values: Vec<f64> = points.iter().map(|&(_, y)| y).collect();
        self.indices(&values)
            .into_iter()
            .map(|i| points[i])
            .collect()
    }
}
