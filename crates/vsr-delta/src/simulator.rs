//! Unordered delivery simulator.
//!
//! Models a transport that may reorder, duplicate, or withhold messages.
//! Withheld messages are not lost for good: [`DeliverySimulator::release_withheld`]
//! puts them back in flight, the way a slow broker eventually delivers.
//! Randomness comes from a seeded LCG so every run is reproducible.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Delivery fault probabilities, each in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Probability a message is withheld (surfaces downstream as a gap).
    pub loss_rate: f64,
    /// Probability a message is delivered twice.
    pub dup_rate: f64,
    /// Probability a message overtakes one already in flight.
    pub reorder_rate: f64,
    /// Seed for the fault generator.
    pub seed: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            dup_rate: 0.0,
            reorder_rate: 0.0,
            seed: 12345,
        }
    }
}

impl NetworkConfig {
    /// A network that withholds messages.
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Default::default()
        }
    }

    /// A network that duplicates messages.
    pub fn with_dups(dup_rate: f64) -> Self {
        Self {
            dup_rate,
            ..Default::default()
        }
    }

    /// A network that reorders messages.
    pub fn reordering(reorder_rate: f64) -> Self {
        Self {
            reorder_rate,
            ..Default::default()
        }
    }

    /// All faults at once.
    pub fn chaotic() -> Self {
        Self {
            loss_rate: 0.1,
            dup_rate: 0.2,
            reorder_rate: 0.4,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// True when no fault can ever fire.
    pub fn is_perfect(&self) -> bool {
        self.loss_rate <= 0.0 && self.dup_rate <= 0.0 && self.reorder_rate <= 0.0
    }
}

/// Counters of faults injected so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub sent: u64,
    pub withheld: u64,
    pub duplicated: u64,
    pub reordered: u64,
}

/// In-flight queue with injected faults.
#[derive(Debug)]
pub struct DeliverySimulator<M> {
    in_flight: VecDeque<M>,
    withheld: Vec<M>,
    config: NetworkConfig,
    rng_state: u64,
    stats: DeliveryStats,
}

impl<M: Clone> DeliverySimulator<M> {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            in_flight: VecDeque::new(),
            withheld: Vec::new(),
            rng_state: config.seed,
            config,
            stats: DeliveryStats::default(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    fn next_random(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.rng_state >> 33) as f64) / ((1u64 << 31) as f64)
    }

    /// Put a message on the wire.
    pub fn send(&mut self, msg: M) {
        self.stats.sent += 1;

        if self.next_random() < self.config.loss_rate {
            self.stats.withheld += 1;
            self.withheld.push(msg);
            return;
        }

        if self.next_random() < self.config.dup_rate {
            self.stats.duplicated += 1;
            self.in_flight.push_back(msg.clone());
        }

        if !self.in_flight.is_empty() && self.next_random() < self.config.reorder_rate {
            let pos = (self.next_random() * self.in_flight.len() as f64) as usize;
            let pos = pos.min(self.in_flight.len() - 1);
            self.stats.reordered += 1;
            self.in_flight.insert(pos, msg);
        } else {
            self.in_flight.push_back(msg);
        }
    }

    /// Take the next message off the wire.
    pub fn receive(&mut self) -> Option<M> {
        self.in_flight.pop_front()
    }

    /// Drain everything currently in flight.
    pub fn drain(&mut self) -> Vec<M> {
        self.in_flight.drain(..).collect()
    }

    /// Put withheld messages back in flight, after anything already queued.
    pub fn release_withheld(&mut self) {
        let withheld: Vec<M> = self.withheld.drain(..).collect();
        for msg in withheld {
            self.in_flight.push_back(msg);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn withheld_count(&self) -> usize {
        self.withheld.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_network_is_fifo() {
        let mut net = DeliverySimulator::new(NetworkConfig::default());
        for i in 0..10 {
            net.send(i);
        }
        assert_eq!(net.drain(), (0..10).collect::<Vec<_>>());
        assert!(NetworkConfig::default().is_perfect());
    }

    #[test]
    fn test_withheld_messages_come_back() {
        let mut net = DeliverySimulator::new(NetworkConfig::lossy(1.0));
        net.send(1);
        net.send(2);

        assert!(net.is_empty());
        assert_eq!(net.withheld_count(), 2);

        net.release_withheld();
        assert_eq!(net.drain(), vec![1, 2]);
    }

    #[test]
    fn test_duplication() {
        let mut net = DeliverySimulator::new(NetworkConfig::with_dups(1.0));
        net.send(7);
        assert_eq!(net.drain(), vec![7, 7]);
        assert_eq!(net.stats().duplicated, 1);
    }

    #[test]
    fn test_reordering_keeps_every_message() {
        let mut net = DeliverySimulator::new(NetworkConfig::reordering(0.9).with_seed(7));
        for i in 0..50 {
            net.send(i);
        }
        let mut received = net.drain();
        assert_ne!(received, (0..50).collect::<Vec<_>>());
        received.sort();
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_seed_same_schedule() {
        let run = |seed| {
            let mut net = DeliverySimulator::new(NetworkConfig::chaotic().with_seed(seed));
            for i in 0..30 {
                net.send(i);
            }
            net.release_withheld();
            net.drain()
        };
        assert_eq!(run(3), run(3));
    }
}
