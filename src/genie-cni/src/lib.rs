//! Genie CNI meta-plugin
//!
//! Attaches a workload through one or more CNI backends chosen per workload,
//! and merges their results into a single CNI result.

pub mod cluster;
pub mod config;
pub mod error;
pub mod genie;
pub mod invoke;
pub mod logging;
pub mod merge;
pub mod multi_ip;
pub mod netconf;
pub mod ranking;
pub mod registry;
pub mod resolver;
pub mod result;
pub mod selector;
pub mod workload;
