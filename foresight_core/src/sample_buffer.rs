//! Bounded, arrival-ordered history of pointer samples.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One observation from the pointer sampling front end.
///
/// `t` is a timestamp in milliseconds on any monotonic clock; only
/// differences between samples are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
    pub t: f64,
}

impl Sample {
    pub fn new(x: f64, y: f64, t: f64) -> Self {
        Self { x, y, t }
    }
}

/// Fixed-capacity ring of recent samples. The oldest sample is evicted on
/// overflow; iteration order is arrival order.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl SampleBuffer {
    /// Creates an empty buffer. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a sample, evicting the oldest one when full.
    pub fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, Sample> {
        self.samples.iter()
    }

    /// Velocities (units/sec) between consecutive samples.
    ///
    /// Pairs whose time difference is not positive are skipped.
    pub fn velocities(&self) -> Vec<(f64, f64)> {
        self.samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .filter_map(|(a, b)| {
                let dt = (b.t - a.t) / 1000.0;
                (dt > 0.0).then(|| ((b.x - a.x) / dt, (b.y - a.y) / dt))
            })
            .collect()
    }
}

/// Population variance of `values` (0 for fewer than two values).
pub(crate) fn variance(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count();
    if n < 2 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut buffer = SampleBuffer::new(3);
        for i in 0..5 {
            buffer.push(Sample::new(i as f64, 0.0, i as f64 * 10.0));
        }

        assert_eq!(buffer.len(), 3);
        let xs: Vec<f64> = buffer.iter().map(|s| s.x).collect();
        assert_eq!(xs, vec![2.0, 3.0, 4.0]);
        assert_eq!(buffer.latest().map(|s| s.x), Some(4.0));
    }

    #[test]
    fn test_velocities_in_units_per_second() {
        let mut buffer = SampleBuffer::new(10);
        buffer.push(Sample::new(0.0, 0.0, 0.0));
        buffer.push(Sample::new(10.0, 5.0, 100.0));
        buffer.push(Sample::new(10.0, 5.0, 100.0)); // duplicate timestamp

        let v = buffer.velocities();
        assert_eq!(v.len(), 1);
        assert_relative_eq!(v[0].0, 100.0);
        assert_relative_eq!(v[0].1, 50.0);
    }

    #[test]
    fn test_variance() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_relative_eq!(variance(values.iter().copied()), 4.0);
        assert_eq!(variance([3.0].iter().copied()), 0.0);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut buffer = SampleBuffer::new(0);
        buffer.push(Sample::new(1.0, 1.0, 0.0));
        buffer.push(Sample::new(2.0, 2.0, 1.0));
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.len(), 1);
    }
}
