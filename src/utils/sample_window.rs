//! Fixed-capacity FIFO sample history.
//!
//! Pushing into a full window evicts the oldest sample in O(1); the backing
//! `VecDeque` is allocated once at its final capacity.
use std::collections::{VecDeque, vec_deque};

#[derive(Debug, Clone)]
pub struct SampleWindow<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T> SampleWindow<T> {
    /// Create a window holding at most `capacity` samples (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, returning the evicted one if the window was full.
    pub fn push(&mut self, sample: T) -> Option<T> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
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

    /// Oldest to newest.
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<&T> {
        self.samples.back()
    }
}

impl SampleWindow<f64> {
    /// Arithmetic mean of the retained samples, 0.0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_evicts_oldest() {
        let mut window = SampleWindow::new(3);
        assert_eq!(window.push(1), None);
        assert_eq!(window.push(2), None);
        assert_eq!(window.push(3), None);
        assert_eq!(window.push(4), Some(1));
        assert_eq!(window.len(), 3);
        assert_eq!(window.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(window.latest(), Some(&4));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut window = SampleWindow::new(0);
        assert_eq!(window.capacity(), 1);
        window.push("a");
        assert_eq!(window.push("b"), Some("a"));
    }

    #[test]
    fn test_mean() {
        let mut window = SampleWindow::new(1_000);
        assert_eq!(window.mean(), 0.0);
        for value in [10.0, 20.0, 30.0] {
            window.push(value);
        }
        assert!((window.mean() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cap_holds_under_many_pushes() {
        let mut window = SampleWindow::new(1_000);
        for i in 0..5_000 {
            window.push(i);
        }
        assert_eq!(window.len(), 1_000);
        assert_eq!(window.iter().next(), Some(&4_000));
    }
}
