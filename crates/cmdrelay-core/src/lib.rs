//! Core library for `cmdrelay`.
//!
//! Contains the operation registry, parameter validators, argv templates,
//! the bounded process executor, the gateway pipeline, and the audit system.
//! This crate knows nothing about HTTP; `cmdrelay-server` exposes it.

pub mod audit;
pub mod audit_file;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod param;
pub mod registry;
pub mod result;
pub mod template;
