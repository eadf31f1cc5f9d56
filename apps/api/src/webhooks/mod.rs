//! Webhook subsystem: subscription management, event fan-out, and signed
//! delivery with escalating retries and auto-disable.
//!
//! Delivery records are kept for auditability; entries older than the
//! retention window are pruned by an external sweep, not by this code.

pub mod delivery;
pub mod handlers;
pub mod service;
pub mod signature;
