// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Session affinity route implemention

use super::random;
use crate::registry::ServerDescriptor;
use crate::ServerId;

/// Picks `pool[crc32(route_param) % pool.len()]`. Calls without a route parameter, or with an
/// empty one, go to a random server. `pool` must not be empty.
pub(crate) fn pick(route_param: Option<&str>, pool: &[ServerDescriptor]) -> ServerId {
    match route_param.filter(|p| !p.is_empty()) {
        Some(param) => {
            let index = crc32fast::hash(param.as_bytes()) as usize % pool.len();
            pool[index].id.clone()
        },
        None => random::pick(pool),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: u16) -> Vec<ServerDescriptor> {
        (0..n).map(|i| ServerDescriptor::new(format!("connector-{i}"), "connector", "127.0.0.1", 3150 + i)).collect()
    }

    #[test]
    fn index_is_the_checksum_modulo_pool_size() {
        // crc32("123456789") = 0xCBF43926
        assert_eq!(pick(Some("123456789"), &pool(3)), "connector-2");
        assert_eq!(pick(Some("123456789"), &pool(4)), "connector-2");
        assert_eq!(pick(Some("123456789"), &pool(5)), format!("connector-{}", 0xCBF4_3926u32 % 5));
    }

    #[test]
    fn same_param_sticks_to_one_server() {
        let pool = pool(7);
        for uid in ["1001", "1002", "tom", "jerry"] {
            let first = pick(Some(uid), &pool);
            for _ in 0..20 {
                assert_eq!(pick(Some(uid), &pool), first);
            }
        }
    }

    #[test]
    fn missing_param_falls_back_to_random() {
        let pool = pool(3);
        for _ in 0..50 {
            let id = pick(None, &pool);
            assert!(pool.iter().any(|s| s.id == id));
            let id = pick(Some(""), &pool);
            assert!(pool.iter().any(|s| s.id == id));
        }
    }
}
