// =============================================================================
// Trellis Matrix NextServer - Utilities
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// =============================================================================

pub mod dock;
pub mod error;

use std::time::{SystemTime, UNIX_EPOCH};

use rand::prelude::*;

/// Seconds since the unix epoch. Request timestamps (`started`, `last`,
/// `finished`) use this resolution; zero means not-yet.
pub fn secs_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_secs()
}

/// Uniformly random element of a slice.
pub fn random_element<T>(items: &[T]) -> Option<&T> {
    items.choose(&mut rand::thread_rng())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_element_of_empty_is_none() {
        let empty: Vec<u8> = vec![];
        assert!(random_element(&empty).is_none());
    }

    #[test]
    fn random_element_is_member() {
        let items = [1u8, 2, 3, 4];
        for _ in 0..32 {
            let picked = *random_element(&items).unwrap();
            assert!(items.contains(&picked));
        }
    }
}
