//! Queue priorities: the order in which a worker visits its queues.
//!
//! Weighted mode uses smooth weighted round-robin: every call puts one
//! queue first, and over `sum(weights)` calls each queue is first exactly
//! `weight` times. Low-priority queues are therefore delayed by a bounded
//! number of claims, never starved. Strict mode always visits by weight.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueWeight {
    pub name: String,
    pub weight: u32,
}

impl QueueWeight {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Per-worker scheduler. Each worker owns one, so no state is shared.
#[derive(Debug, Clone)]
pub struct QueueSelector {
    queues: Vec<QueueWeight>,
    current: Vec<i64>,
    strict: bool,
}

impl QueueSelector {
    pub fn new(queues: &[QueueWeight], strict: bool) -> Self {
        let mut queues = queues.to_vec();
        // stable: equal weights keep configuration order
        queues.sort_by(|a, b| b.weight.cmp(&a.weight));
        let current = vec![0; queues.len()];
        Self {
            queues,
            current,
            strict,
        }
    }

    /// Queue names in the order to try for the next claim.
    pub fn next_order(&mut self) -> Vec<String> {
        if self.strict || self.queues.len() <= 1 {
            return self.queues.iter().map(|q| q.name.clone()).collect();
        }

        let total: i64 = self.queues.iter().map(|q| q.weight as i64).sum();
        let mut best = 0;
        for (i, queue) in self.queues.iter().enumerate() {
            self.current[i] += queue.weight as i64;
            if self.current[i] > self.current[best] {
                best = i;
            }
        }
        self.current[best] -= total;

        let mut order = Vec::with_capacity(self.queues.len());
        order.push(self.queues[best].name.clone());
        order.extend(
            self.queues
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != best)
                .map(|(_, q)| q.name.clone()),
        );
        order
    }
}

/// Parse `critical=6,default=3,low=1`. A bare name gets weight 1.
pub fn parse_queue_weights(spec: &str) -> Result<Vec<QueueWeight>, String> {
    spec.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((name, weight)) => weight
                .trim()
                .parse::<u32>()
                .map(|w| QueueWeight::new(name.trim(), w))
                .map_err(|e| format!("queue '{}': bad weight '{}': {e}", name.trim(), weight)),
            None => Ok(QueueWeight::new(part, 1)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn weights() -> Vec<QueueWeight> {
        vec![
            QueueWeight::new("low", 1),
            QueueWeight::new("critical", 6),
            QueueWeight::new("default", 3),
        ]
    }

    #[test]
    fn weighted_order_is_proportional_over_a_cycle() {
        let mut selector = QueueSelector::new(&weights(), false);
        let mut firsts: HashMap<String, usize> = HashMap::new();

        for _ in 0..10 {
            let order = selector.next_order();
            assert_eq!(order.len(), 3);
            *firsts.entry(order[0].clone()).or_default() += 1;
        }

        assert_eq!(firsts["critical"], 6);
        assert_eq!(firsts["default"], 3);
        assert_eq!(firsts["low"], 1);
    }

    #[test]
    fn low_priority_queue_is_never_starved() {
        let mut selector = QueueSelector::new(&weights(), false);
        let mut gap = 0;
        let mut max_gap = 0;
        for _ in 0..100 {
            if selector.next_order()[0] == "low" {
                gap = 0;
            } else {
                gap += 1;
                max_gap = max_gap.max(gap);
            }
        }
        assert!(max_gap < 10);
    }

    #[test]
    fn strict_order_always_by_weight() {
        let mut selector = QueueSelector::new(&weights(), true);
        for _ in 0..5 {
            assert_eq!(selector.next_order(), vec!["critical", "default", "low"]);
        }
    }

    #[test]
    fn parses_weight_spec() {
        let parsed = parse_queue_weights("critical=6, default=3,low").unwrap();
        assert_eq!(
            parsed,
            vec![
                QueueWeight::new("critical", 6),
                QueueWeight::new("default", 3),
                QueueWeight::new("low", 1),
            ]
        );
        assert!(parse_queue_weights("critical=high").is_err());
    }
}
