#![allow(dead_code)]

pub use launchvisor_test_utils::builders;
pub use launchvisor_test_utils::fake_adapter;
pub use launchvisor_test_utils::{
    init_tracing, state_path, transitions, wait_for_state, wait_until, with_timeout,
};

use std::collections::BTreeMap;

/// A resolved environment built from literal pairs.
pub fn env_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
