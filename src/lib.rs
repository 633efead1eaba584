#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod agent;
pub mod capability;
pub mod cli;
pub mod client;
pub mod config;
pub mod decode;
pub mod error;
pub mod exec;
pub mod logging;
pub mod paths;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod transfer;

#[cfg(test)]
mod testing;
