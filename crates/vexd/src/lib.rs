//! vexd enforcement daemon library.
//!
//! The daemon owns every kernel side-effect and the authoritative persisted
//! state. The binary in `main.rs` wires the subsystem coordinators together;
//! everything else lives here so the integration tests can drive the full
//! command router over a real socket without privileges (dry-run mode).
//!
//! Subsystems, in dependency order:
//!
//! - [`audit`]: append-only audit log
//! - [`persist`]: atomic state persistence
//! - [`exec`]: external-command seam shared by kernel-facing modules
//! - [`compute`]: cgroup CPU quota and `oom_score_adj`
//! - [`shaper`]: qdisc traffic shaping
//! - [`firewall`]: nftables domain blocking with DNS refresh
//! - [`input`]: keyboard surveillance and latency injection
//! - [`reaper`]: forbidden-process monitor (eBPF or procfs backend)
//! - [`penance`]: manifest enforcement and compliance transitions
//! - [`antitamper`]: periodic integrity checks with cooldown escalation
//! - [`server`] / [`handlers`]: the Unix-socket command router

#![warn(clippy::all)]

pub mod antitamper;
pub mod audit;
pub mod compute;
pub mod exec;
pub mod firewall;
pub mod handlers;
pub mod input;
pub mod penance;
pub mod persist;
pub mod reaper;
pub mod server;
pub mod shaper;
