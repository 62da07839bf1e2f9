//! deltaup - signed, delta-based self-update for versioned application bundles

pub mod engine;
