// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Round robin route implemention

use crate::registry::ServerDescriptor;
use crate::ServerId;

/// Cursor of one server type.
#[derive(Debug, Clone, Default)]
pub(crate) struct RoundRobin {
    cursor: u64,
}

impl RoundRobin {
    /// Returns `pool[cursor % len]` and advances the cursor. `pool` must not be empty.
    pub(crate) fn pick(&mut self, pool: &[ServerDescriptor]) -> ServerId {
        let index = (self.cursor % pool.len() as u64) as usize;
        self.cursor = self.cursor.checked_add(1).unwrap_or(0);
        pool[index].id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: u16) -> Vec<ServerDescriptor> {
        (0..n).map(|i| ServerDescriptor::new(format!("s{i}"), "chat", "127.0.0.1", 3000 + i)).collect()
    }

    #[test]
    fn visits_each_server_once_per_cycle_in_order() {
        let pool = pool(3);
        let mut rr = RoundRobin::default();
        let picks: Vec<_> = (0..9).map(|_| rr.pick(&pool)).collect();
        assert_eq!(picks, vec!["s0", "s1", "s2", "s0", "s1", "s2", "s0", "s1", "s2"]);
    }

    #[test]
    fn cursor_wraps_to_zero() {
        let pool = pool(3);
        let mut rr = RoundRobin { cursor: u64::MAX };
        rr.pick(&pool);
        assert_eq!(rr.cursor, 0);
        assert_eq!(rr.pick(&pool), "s0");
    }
}
