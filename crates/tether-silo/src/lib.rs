//! Out-of-process hosting for tether.
//!
//! The parent side ([`ProcessSilo`]) spawns a host executable, walks its
//! stdout boot protocol (`booting`, port, `ready`), connects an endpoint to
//! the advertised port, and supervises the child with a heartbeat. The
//! child side ([`run_host`]) is the matching runtime, used by the
//! `tether-host` binary; hosted children die with their parent via the
//! watchdog.
//!
//! Faults from the endpoint and the heartbeat are aggregated: the first
//! report fires `on_fault_detected`, exactly one cleanup pass runs, and
//! `on_fault_handled` follows.

mod host;
mod local;
mod silo;
pub mod stdout;
pub mod watchdog;

pub use host::{run_host, HostConfig, HostError};
pub use local::LocalProcessSilo;
pub use silo::{
    map_disconnect_reason, FaultDetectedCallback, FaultHandledCallback, FaultHandling,
    HostOutputCallback, ProcessSilo, SiloConfig, SiloError, SiloFaultReason,
};
