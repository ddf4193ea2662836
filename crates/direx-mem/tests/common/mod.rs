// Shared helpers for direx-mem integration tests.

#![allow(dead_code)]

use direx_mem::config::MB;
use direx_mem::Arena;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Creates an arena of `mb` mebibytes, honouring `DIREX_LOG` for the run.
pub fn arena(mb: usize) -> Arena {
    direx_log::init_from_env();
    Arena::new(mb * MB).expect("arena")
}

/// Deterministic generator so failures reproduce.
pub fn rng() -> StdRng {
    StdRng::seed_from_u64(0x00d1_5ec7)
}

pub fn random_ints(rng: &mut StdRng, count: usize) -> Vec<i64> {
    (0..count).map(|_| rng.r#gen::<i64>()).collect()
}

/// Short decimal strings, like the textual form of random integers.
pub fn random_numbers(rng: &mut StdRng, count: usize) -> Vec<String> {
    (0..count).map(|_| rng.r#gen::<u32>().to_string()).collect()
}
