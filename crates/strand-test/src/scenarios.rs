//! End-to-end sync scenarios
//!
//! Each scenario drives real nodes over the loopback network:
//! - Board genesis and restart
//! - Repeated and concurrent admission of one bundle
//! - Master history gating member history
//! - Fork resolution under arbitrary arrival order
//! - Me-log replay on a second device
//! - Pull sync of member and content logs, including across a partition
