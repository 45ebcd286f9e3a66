#![deny(missing_docs)]
//! Protocol core of the tally network.
//!
//! This crate implements the two pure pieces of the privacy-preserving
//! aggregation protocol, free of any I/O:
//!
//! * [`sharing`] — additive secret sharing over the ring of integers
//!   modulo 2^32: splitting a contribution into shares, reconstructing a
//!   total from a complete share set, and componentwise addition of share
//!   vectors.
//! * [`aggregation`] — the per-computation state machine a coordinator
//!   runs: the initialization barrier, the share collection window, the
//!   deadline-triggered partial sum, and the reveal exchange that
//!   combines all three partial sums into the final result.
//!
//! The state machine is clock-free and event-driven; the hosting service
//! owns all timers and messaging and feeds events in. This keeps every
//! transition unit-testable without a runtime.

pub mod aggregation;
pub mod sharing;
