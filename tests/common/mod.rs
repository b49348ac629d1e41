#![allow(dead_code)]

use std::error::Error;

pub use builddag_test_utils::builders::{unit, ConfigFileBuilder, UnitConfigBuilder};
pub use builddag_test_utils::{init_tracing, with_timeout};

pub type TestResult = Result<(), Box<dyn Error>>;
