//! A lightweight publish/subscribe message fabric.
//!
//! Two cooperating services share this crate: a [broker](broker::Broker)
//! that fans topic-addressed messages out to subscribers, and a
//! [gateway](gateway::Gateway) that terminates publisher connections,
//! buffers their traffic in a bounded queue, and forwards it to the broker
//! over a single reconnecting link.
//!
//! Both speak the line-oriented control protocol defined in [`protocol`],
//! with payloads carried as 4-byte big-endian length-prefixed binary blobs.
//! Delivery is best-effort: exact-match topics, no persistence, no
//! acknowledgements from the broker to publishers.

#![warn(
    anonymous_parameters,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_qualifications,
    variant_size_differences
)]

pub mod broker;
pub mod connection;
pub mod gateway;
pub mod protocol;
pub mod topics;
