//! Low-level ACME client implementation.
//!
//! Covers the subset of RFC 8555 needed to issue certificates with DNS-01 challenges: directory
//! discovery, nonces, account registration and lookup, orders, authorizations, finalization and
//! certificate download. Deciding which challenge to solve and how lives in [`crate::ca`].

pub mod client;
pub mod error;
pub mod http;
pub mod object;
