//! Authentication and session service for a clinical trial data-capture
//! platform.
//!
//! Participants enroll with a sponsor-issued linking code; the code's prefix
//! routes them to the right sponsor backend. [`auth`] holds the core
//! (passwords, tokens, rate limiting, pattern matching, repositories),
//! [`api`] the HTTP surface, and [`cli`] the command line entry point.

pub mod api;
pub mod auth;
pub mod cli;
