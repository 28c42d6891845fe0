// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Least active route implemention

use crate::registry::ServerDescriptor;
use crate::ServerId;
use rand::seq::SliceRandom;
use std::collections::HashMap;

/// Pick counters of one server type.
///
/// Counters only grow: they count routed calls, not calls in flight.
#[derive(Debug, Clone, Default)]
pub(crate) struct LeastActive {
    actives: HashMap<ServerId, u64>,
}

impl LeastActive {
    /// Picks a server with the lowest counter, breaking ties at random. `pool` must not be empty.
    pub(crate) fn pick(&mut self, pool: &[ServerDescriptor]) -> ServerId {
        let mut min = u64::MAX;
        let mut candidates: Vec<&ServerId> = Vec::new();
        for server in pool {
            let count = self.actives.get(&server.id).copied().unwrap_or(0);
            if count < min {
                min = count;
                candidates.clear();
                candidates.push(&server.id);
            } else if count == min {
                candidates.push(&server.id);
            }
        }
        let id = candidates.choose(&mut rand::thread_rng()).map_or_else(|| pool[0].id.clone(), |id| (*id).clone());
        *self.actives.entry(id.clone()).or_default() += 1;
        id
    }

    /// Forgets the counter of a removed server.
    pub(crate) fn forget(&mut self, id: &str) {
        self.actives.remove(id);
    }

    #[cfg(test)]
    fn count(&self, id: &str) -> u64 {
        self.actives.get(id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: u16) -> Vec<ServerDescriptor> {
        (0..n).map(|i| ServerDescriptor::new(format!("s{i}"), "chat", "127.0.0.1", 3000 + i)).collect()
    }

    #[test]
    fn never_picks_a_busier_server() {
        let pool = pool(4);
        let mut la = LeastActive::default();
        for _ in 0..100 {
            let before: Vec<u64> = pool.iter().map(|s| la.count(&s.id)).collect();
            let min = *before.iter().min().unwrap();
            let id = la.pick(&pool);
            assert_eq!(la.count(&id) - 1, min);
        }
        assert!(pool.iter().all(|s| la.count(&s.id) == 25));
    }

    #[test]
    fn new_server_catches_up_first() {
        let mut pool = pool(2);
        let mut la = LeastActive::default();
        for _ in 0..10 {
            la.pick(&pool);
        }
        pool.push(ServerDescriptor::new("s9", "chat", "127.0.0.1", 3009));
        for _ in 0..5 {
            assert_eq!(la.pick(&pool), "s9");
        }
    }

    #[test]
    fn forget_resets_counter() {
        let pool = pool(1);
        let mut la = LeastActive::default();
        la.pick(&pool);
        la.forget("s0");
        assert_eq!(la.count("s0"), 0);
    }
}
