// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Random route implemention

use crate::registry::ServerDescriptor;
use crate::ServerId;
use rand::Rng;

/// Picks a uniformly random server. `pool` must not be empty.
#[inline]
pub(crate) fn pick(pool: &[ServerDescriptor]) -> ServerId {
    let index = rand::thread_rng().gen_range(0..pool.len());
    pool[index].id.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn picks_only_pool_members() {
        let pool: Vec<_> = (0..4).map(|i| ServerDescriptor::new(format!("s{i}"), "chat", "127.0.0.1", 3000 + i)).collect();
        let mut seen = HashSet::new();
        for _ in 0..400 {
            let id = pick(&pool);
            assert!(pool.iter().any(|s| s.id == id));
            seen.insert(id);
        }
        assert_eq!(seen.len(), 4);
    }
}
