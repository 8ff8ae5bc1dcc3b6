//! HyperShell: distributed shell-command execution. This crate wires the
//! `hypershell-*` library crates together behind the `hyper-shell` binary's
//! CLI (spec section 6).

pub mod config;
pub mod submit;
