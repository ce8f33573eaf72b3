use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use pulsewatch_domain::{RoutingError, ServerInstance};

/// Picks one of the healthy candidates. `candidates` is never empty and
/// keeps registration order.
pub trait RoutingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn pick(&self, candidates: &[ServerInstance], client_key: Option<&str>) -> usize;
}

pub fn from_name(name: &str) -> Result<Box<dyn RoutingStrategy>, RoutingError> {
    let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
    let strategy: Box<dyn RoutingStrategy> = match normalized.as_str() {
        "round_robin" => Box::new(RoundRobin::default()),
        "least_connections" => Box::new(LeastConnections),
        "weighted" => Box::new(Weighted::from_entropy()),
        "ip_hash" => Box::new(IpHash),
        "least_response_time" => Box::new(LeastResponseTime),
        _ => return Err(RoutingError::UnknownStrategy(name.to_string())),
    };
    Ok(strategy)
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoutingStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn pick(&self, candidates: &[ServerInstance], _client_key: Option<&str>) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % candidates.len()
    }
}

#[derive(Debug, Default)]
pub struct LeastConnections;

fn fewest_connections(candidates: &[ServerInstance]) -> usize {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, instance)| instance.open_connections)
        .map(|(index, _)| index)
        .unwrap_or(0)
}

impl RoutingStrategy for LeastConnections {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn pick(&self, candidates: &[ServerInstance], _client_key: Option<&str>) -> usize {
        fewest_connections(candidates)
    }
}

/// Probability proportional to remaining headroom (`100 - load`).
#[derive(Debug)]
pub struct Weighted {
    rng: Mutex<SmallRng>,
}

impl Weighted {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }
}

impl RoutingStrategy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn pick(&self, candidates: &[ServerInstance], _client_key: Option<&str>) -> usize {
        let weights: Vec<u32> = candidates
            .iter()
            .map(|instance| 100 - u32::from(instance.load.min(100)))
            .collect();
        let total: u32 = weights.iter().sum();
        let mut rng = self.rng.lock().expect("weighted rng lock poisoned");
        if total == 0 {
            return rng.gen_range(0..candidates.len());
        }
        let mut roll = rng.gen_range(0..total);
        for (index, weight) in weights.iter().enumerate() {
            if roll < *weight {
                return index;
            }
            roll -= weight;
        }
        candidates.len() - 1
    }
}

/// Session affinity on the caller key; keyless calls use least-connections.
#[derive(Debug, Default)]
pub struct IpHash;

pub fn key_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

impl RoutingStrategy for IpHash {
    fn name(&self) -> &'static str {
        "ip_hash"
    }

    fn pick(&self, candidates: &[ServerInstance], client_key: Option<&str>) -> usize {
        match client_key {
            Some(key) => (key_hash(key) % candidates.len() as u64) as usize,
            None => fewest_connections(candidates),
        }
    }
}

/// Lowest rolling response time once every candidate has history.
#[derive(Debug, Default)]
pub struct LeastResponseTime;

impl RoutingStrategy for LeastResponseTime {
    fn name(&self) -> &'static str {
        "least_response_time"
    }

    fn pick(&self, candidates: &[ServerInstance], _client_key: Option<&str>) -> usize {
        let timings: Option<Vec<f64>> = candidates
            .iter()
            .map(|instance| instance.avg_response_ms)
            .collect();
        match timings {
            Some(timings) => timings
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(index, _)| index)
                .unwrap_or(0),
            None => fewest_connections(candidates),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, load: u8, open: u32, avg: Option<f64>) -> ServerInstance {
        ServerInstance {
            id: id.into(),
            address: format!("http://{id}:8080"),
            healthy: true,
            load,
            open_connections: open,
            last_health_check: None,
            avg_response_ms: avg,
        }
    }

    #[test]
    fn round_robin_rotates() {
        let strategy = RoundRobin::default();
        let pool = [instance("a", 0, 0, None), instance("b", 0, 0, None)];
        let picks: Vec<_> = (0..4).map(|_| strategy.pick(&pool, None)).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn weighted_never_picks_fully_loaded_instance() {
        let strategy = Weighted::seeded(7);
        let pool = [instance("busy", 100, 0, None), instance("idle", 10, 0, None)];
        for _ in 0..200 {
            assert_eq!(strategy.pick(&pool, None), 1);
        }
        let saturated = [instance("a", 100, 0, None), instance("b", 100, 0, None)];
        assert!(strategy.pick(&saturated, None) < 2);
    }

    #[test]
    fn ip_hash_is_sticky_and_falls_back_without_key() {
        let strategy = IpHash;
        let pool = [
            instance("a", 0, 4, None),
            instance("b", 0, 1, None),
            instance("c", 0, 9, None),
        ];
        let first = strategy.pick(&pool, Some("10.0.0.7"));
        for _ in 0..10 {
            assert_eq!(strategy.pick(&pool, Some("10.0.0.7")), first);
        }
        assert_eq!(strategy.pick(&pool, None), 1);
    }

    #[test]
    fn least_response_time_needs_full_history() {
        let strategy = LeastResponseTime;
        let partial = [instance("a", 0, 3, Some(5.0)), instance("b", 0, 0, None)];
        assert_eq!(strategy.pick(&partial, None), 1);
        let full = [instance("a", 0, 3, Some(5.0)), instance("b", 0, 0, Some(50.0))];
        assert_eq!(strategy.pick(&full, None), 0);
    }

    #[test]
    fn names_resolve() {
        assert_eq!(from_name("least-connections").unwrap().name(), "least_connections");
        assert!(matches!(
            from_name("random"),
            Err(RoutingError::UnknownStrategy(name)) if name == "random"
        ));
    }
}
