//! Container lifecycle orchestration for the funclet node agent.
//!
//! [`engine::Funclet`] drives a fixed pool of container slots through
//! Init, Warmup, Reset, Reborn and Cooldown on top of an external OCI
//! runtime, the cgroup resource planner, the bridge network allocator and
//! the asynchronous path reclaim pipeline.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod backend;
pub mod brn;
pub mod bundle;
pub mod code;
pub mod container;
pub mod engine;
pub mod metrics;
pub mod paths;
pub mod reclaim;
pub mod registry;
pub mod resource;
pub mod tmp;
