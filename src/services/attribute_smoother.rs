//! Majority-vote smoothing for noisy per-identity emotion labels

use std::collections::VecDeque;

/// Bounded label history with a stable mode.
///
/// Ties are broken by first occurrence: among equally frequent labels, the
/// one that appears earliest in the buffer (oldest) wins.
#[derive(Debug, Clone)]
pub struct EmotionSmoother {
    history: VecDeque<String>,
    capacity: usize,
}

impl EmotionSmoother {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { history: VecDeque::with_capacity(capacity), capacity }
    }

    /// Append a label, evicting the oldest when full, and return the new mode
    pub fn observe<'a>(&'a mut self, label: &'a str) -> &'a str {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(label.to_string());
        self.mode().unwrap_or(label)
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    fn mode(&self) -> Option<&str> {
        let mut best: Option<(&str, usize)> = None;
        for (i, label) in self.history.iter().enumerate() {
            // Count each distinct label once, at its first occurrence
            if self.history.iter().take(i).any(|prev| prev == label) {
                continue;
            }
            let count = self.history.iter().filter(|l| *l == label).count();
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((label.as_str(), count));
            }
        }
        best.map(|(label, _)| label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_returns_raw_label() {
        let mut smoother = EmotionSmoother::new(7);
        assert!(smoother.is_empty());
        assert_eq!(smoother.observe("happy"), "happy");
    }

    #[test]
    fn test_observe_owned_label() {
        let mut smoother = EmotionSmoother::new(3);
        let raw = String::from("surprise");
        let stable = smoother.observe(&raw).to_string();
        drop(raw);
        assert_eq!(stable, "surprise");
        assert_eq!(smoother.observe(&"fear".to_string()), "surprise");
    }

    #[test]
    fn test_majority_wins() {
        let mut smoother = EmotionSmoother::new(7);
        smoother.observe("happy");
        smoother.observe("sad");
        smoother.observe("happy");
        assert_eq!(smoother.observe("sad"), "happy");
        assert_eq!(smoother.observe("sad"), "sad");
    }

    #[test]
    fn test_tie_broken_by_first_occurrence() {
        let mut smoother = EmotionSmoother::new(7);
        smoother.observe("neutral");
        assert_eq!(smoother.observe("angry"), "neutral");
        smoother.observe("angry");
        assert_eq!(smoother.observe("neutral"), "neutral");
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut smoother = EmotionSmoother::new(7);
        for _ in 0..4 {
            smoother.observe("happy");
        }
        for _ in 0..2 {
            smoother.observe("sad");
        }
        assert_eq!(smoother.observe("sad"), "happy");
        assert_eq!(smoother.len(), 7);

        // Evicts one "happy": 3 happy vs 4 sad
        assert_eq!(smoother.observe("sad"), "sad");
        assert_eq!(smoother.len(), 7);
    }
}
