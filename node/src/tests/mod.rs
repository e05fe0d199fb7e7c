//! Test modules for the node crate

mod registry_tests;
mod test_utils;
mod worker_tests;
