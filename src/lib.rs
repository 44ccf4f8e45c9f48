//! A native-protocol session dispatcher for an audio mixing daemon: framed
//! tagged-record codec, per-connection command dispatch, and a
//! flow-controlled playback pipeline bridging network ingress to a
//! pull-based mixer sink input.

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

pub mod command;
pub mod connection;
pub mod cookie;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod mixer;
pub mod queue;
pub mod record;
pub mod ringbuf;
pub mod sample_spec;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub mod testutil;
