//! Table updaters (C4). Each submodule owns one normalized table and follows the
//! same four-step algorithm: pre-cascade dependent lookups, build rows, bulk
//! `INSERT ... ON CONFLICT DO NOTHING RETURNING`, then post-cascade into
//! dependents for newly-inserted rows only.

pub mod compressed_json;
pub mod decode_error;
pub mod device_descriptor;
pub mod envelope;
pub mod location;
pub mod message;
pub mod psd_eirp;
pub mod request_response;

pub use message::MessageUpdater;
