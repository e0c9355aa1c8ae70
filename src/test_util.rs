//! Helpers shared by the unit tests.

use crate::runtime::{Runtime, RuntimeConfig};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Runs `f` as the main thread of a fresh runtime configured from the environment.
pub fn run<F, T>(f: F) -> T
where
    F: FnOnce() -> T
{
    init_logging();
    Runtime::new().run(f)
}

pub fn run_with_config<F, T>(config: RuntimeConfig, f: F) -> T
where
    F: FnOnce() -> T
{
    init_logging();
    Runtime::with_config(config).unwrap().run(f)
}
