//! Runwatch: run a long-lived node process and alert on its log output.
//!
//! Before the child starts, port-bearing keys in its YAML configuration are
//! rewritten to free ports. The child's stdout and stderr are then scanned
//! line by line against ordered regex rules, and matches are sent to a chat
//! webhook subject to per-pattern cooldowns.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alerts;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod line_log;
pub mod logging;
pub mod ports;
pub mod supervisor;
