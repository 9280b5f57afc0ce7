//! `procd`: a Unix process supervisor daemon. See `SPEC_FULL.md` for the
//! full requirements this crate implements and `DESIGN.md` for the
//! grounding ledger.

pub mod config;
pub mod context;
pub mod event;
pub mod executor;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod pid_cache;
pub mod reaper;
pub mod restart;
pub mod service;
pub mod signal;
pub mod supervisor;
