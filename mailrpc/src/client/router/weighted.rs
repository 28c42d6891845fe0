// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Weighted round robin route implemention

use crate::error::RouteError;
use crate::registry::ServerDescriptor;
use crate::ServerId;

/// Interleaved weighted round robin state of one server type.
///
/// Each pass over the pool lowers the weight threshold by one; a server is picked while its
/// weight reaches the threshold. Over a full cycle every server is picked `weight` times.
#[derive(Debug, Clone, Default)]
pub(crate) struct WeightedRoundRobin {
    index: Option<usize>,
    weight: i64,
}

impl WeightedRoundRobin {
    /// `pool` must not be empty.
    pub(crate) fn pick(&mut self, server_type: &str, pool: &[ServerDescriptor]) -> Result<ServerId, RouteError> {
        let max = max_weight(pool);
        if max <= 0 {
            return Err(RouteError::InvalidWeight(server_type.to_owned()));
        }
        loop {
            let index = self.index.map_or(0, |i| (i + 1) % pool.len());
            self.index = Some(index);
            if index == 0 {
                self.weight -= 1;
                if self.weight <= 0 {
                    self.weight = max;
                }
            }
            let server = &pool[index];
            if server.weight.is_some_and(|w| w as i64 >= self.weight) {
                return Ok(server.id.clone());
            }
        }
    }
}

/// Servers without a weight are ignored.
fn max_weight(pool: &[ServerDescriptor]) -> i64 {
    pool.iter().filter_map(|s| s.weight).map(i64::from).max().unwrap_or(-1)
}
