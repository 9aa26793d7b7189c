#![allow(dead_code)]
#![allow(unused_imports)]

pub mod db;
pub mod mocks;

pub use db::{seed_assignment, seed_course, TestDb};
pub use mocks::{MockBackend, MockScheduler};
