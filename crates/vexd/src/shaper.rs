//! Traffic shaping via the root qdisc.
//!
//! A profile with only a rate uses a token-bucket discipline; when packet
//! loss is also requested, rate and loss are combined in a single netem
//! discipline so the two never fight over the root handle. Clearing the
//! root qdisc ignores "not found": an unshaped interface is already in the
//! desired state.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use vex_core::profile::Profile;

use crate::exec::{output_text, CommandRunner};

/// Environment variable overriding interface auto-detection.
pub const INTERFACE_ENV: &str = "VEX_INTERFACE";

/// Physical interface names probed when no default route is found.
const FALLBACK_INTERFACES: [&str; 4] = ["enp9s0", "enp0s31f6", "eth0", "eno1"];

/// Shaper errors.
#[derive(Debug, Error)]
pub enum ShaperError {
    /// No usable interface could be determined at init.
    #[error("no usable network interface found (set {INTERFACE_ENV} to override)")]
    NoInterface,

    /// `tc` could not be spawned.
    #[error("failed to run tc: {0}")]
    Spawn(#[from] std::io::Error),

    /// `tc` exited non-zero.
    #[error("tc {verb} failed on {interface}: {stderr}")]
    TcFailed {
        /// The qdisc operation attempted.
        verb: &'static str,
        /// Target interface.
        interface: String,
        /// Captured stderr.
        stderr: String,
    },
}

/// Applies shaping profiles to one egress interface.
pub struct NetShaper {
    interface: String,
    runner: Arc<dyn CommandRunner>,
}

impl NetShaper {
    /// Detects the target interface: explicit env override, then the
    /// default-route interface, then a fixed candidate probe.
    ///
    /// # Errors
    ///
    /// Returns [`ShaperError::NoInterface`] only if every strategy fails.
    pub fn detect(runner: Arc<dyn CommandRunner>) -> Result<Self, ShaperError> {
        if let Ok(iface) = std::env::var(INTERFACE_ENV) {
            if !iface.is_empty() {
                info!(interface = %iface, "shaper attached (from {INTERFACE_ENV})");
                return Ok(Self::with_interface(&iface, runner));
            }
        }

        if let Some(iface) = default_route_interface("/proc/net/route") {
            info!(interface = %iface, "shaper attached (default route)");
            return Ok(Self::with_interface(&iface, runner));
        }

        for candidate in FALLBACK_INTERFACES {
            if Path::new("/sys/class/net").join(candidate).exists() {
                info!(interface = candidate, "shaper attached (fallback probe)");
                return Ok(Self::with_interface(candidate, runner));
            }
        }

        Err(ShaperError::NoInterface)
    }

    /// A shaper pinned to a known interface.
    #[must_use]
    pub fn with_interface(interface: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            interface: interface.to_string(),
            runner,
        }
    }

    /// The interface this shaper drives.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Applies a profile with no artificial loss.
    ///
    /// # Errors
    ///
    /// Returns [`ShaperError`] if the qdisc cannot be installed; the root
    /// qdisc has already been cleared by then.
    pub fn apply_profile(&self, profile: Profile) -> Result<(), ShaperError> {
        self.clear_root()?;

        let Some(params) = profile.tbf_params() else {
            info!(profile = %profile, "profile applied (restrictions lifted)");
            return Ok(());
        };

        let rate = format!("{}bps", params.rate_bytes);
        let burst = params.burst.to_string();
        let limit = params.limit.to_string();
        self.tc(
            "add",
            &[
                "qdisc", "add", "dev", &self.interface, "root", "handle", "1:", "tbf", "rate",
                &rate, "burst", &burst, "limit", &limit,
            ],
        )?;

        info!(profile = %profile, interface = %self.interface, "profile applied");
        Ok(())
    }

    /// Applies a profile combined with artificial packet loss.
    ///
    /// Zero loss degrades to [`Self::apply_profile`] so pure rate limiting
    /// keeps token-bucket precision.
    ///
    /// # Errors
    ///
    /// Returns [`ShaperError`] if the combined discipline cannot be
    /// installed.
    pub fn apply_profile_with_entropy(
        &self,
        profile: Profile,
        loss_pct: f32,
    ) -> Result<(), ShaperError> {
        if loss_pct <= 0.0 {
            return self.apply_profile(profile);
        }

        self.clear_root()?;

        let mut args: Vec<String> = vec![
            "qdisc".into(),
            "add".into(),
            "dev".into(),
            self.interface.clone(),
            "root".into(),
            "handle".into(),
            "1:".into(),
            "netem".into(),
            "loss".into(),
            format!("{loss_pct:.2}%"),
        ];
        let rate = profile.rate_bytes();
        if rate > 0 {
            args.push("rate".into());
            args.push(format!("{rate}bps"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.tc("add", &arg_refs)?;

        info!(
            profile = %profile,
            loss_pct = f64::from(loss_pct),
            interface = %self.interface,
            "profile applied with entropy"
        );
        Ok(())
    }

    /// Deletes the root qdisc, tolerating its absence.
    fn clear_root(&self) -> Result<(), ShaperError> {
        let output = self
            .runner
            .run("tc", &["qdisc", "del", "dev", &self.interface, "root"])?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = output_text(&output);
        // "RTNETLINK answers: No such file or directory" means nothing to clear.
        if stderr.contains("No such file or directory") || stderr.contains("Invalid handle") {
            debug!(interface = %self.interface, "no root qdisc to clear");
            return Ok(());
        }
        Err(ShaperError::TcFailed {
            verb: "del",
            interface: self.interface.clone(),
            stderr,
        })
    }

    fn tc(&self, verb: &'static str, args: &[&str]) -> Result<(), ShaperError> {
        let output = self.runner.run("tc", args)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ShaperError::TcFailed {
                verb,
                interface: self.interface.clone(),
                stderr: output_text(&output),
            })
        }
    }
}

/// Parses the kernel's route table for the default-route interface.
///
/// `/proc/net/route` rows are `Iface Destination Gateway ...` with the
/// destination in zero-padded little-endian hex; `00000000` marks the
/// default gateway.
fn default_route_interface(route_file: &str) -> Option<String> {
    let contents = std::fs::read_to_string(route_file).ok()?;
    parse_default_route(&contents)
}

fn parse_default_route(contents: &str) -> Option<String> {
    for line in contents.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let iface = fields.next()?;
        let destination = fields.next()?;
        if destination == "00000000" && !iface.is_empty() {
            return Some(iface.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::MockRunner;

    fn shaper(mock: &Arc<MockRunner>) -> NetShaper {
        NetShaper::with_interface("eth0", mock.clone())
    }

    #[test]
    fn standard_profile_only_clears_root() {
        let mock = Arc::new(MockRunner::ok());
        shaper(&mock).apply_profile(Profile::Standard).unwrap();

        let calls = mock.calls_to("tc");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args, ["qdisc", "del", "dev", "eth0", "root"]);
    }

    #[test]
    fn choke_installs_token_bucket_after_clear() {
        let mock = Arc::new(MockRunner::ok());
        shaper(&mock).apply_profile(Profile::Choke).unwrap();

        let calls = mock.calls_to("tc");
        assert_eq!(calls.len(), 2);
        let add = &calls[1].args;
        assert!(add.contains(&"tbf".to_string()));
        assert!(add.contains(&"125000bps".to_string()));
        assert!(add.contains(&"100000".to_string()));
        assert!(add.contains(&"1000000".to_string()));
    }

    #[test]
    fn black_hole_rate_permits_heartbeats_only() {
        let mock = Arc::new(MockRunner::ok());
        shaper(&mock).apply_profile(Profile::BlackHole).unwrap();
        let add = &mock.calls_to("tc")[1].args;
        assert!(add.contains(&"125bps".to_string()));
    }

    #[test]
    fn entropy_combines_loss_and_rate_in_one_netem() {
        let mock = Arc::new(MockRunner::ok());
        shaper(&mock)
            .apply_profile_with_entropy(Profile::DialUp, 12.5)
            .unwrap();

        let calls = mock.calls_to("tc");
        assert_eq!(calls.len(), 2);
        let add = &calls[1].args;
        assert!(add.contains(&"netem".to_string()));
        assert!(add.contains(&"12.50%".to_string()));
        assert!(add.contains(&"7000bps".to_string()));
        assert!(!add.contains(&"tbf".to_string()));
    }

    #[test]
    fn zero_loss_uses_token_bucket_precision() {
        let mock = Arc::new(MockRunner::ok());
        shaper(&mock)
            .apply_profile_with_entropy(Profile::Choke, 0.0)
            .unwrap();
        let add = &mock.calls_to("tc")[1].args;
        assert!(add.contains(&"tbf".to_string()));
    }

    #[test]
    fn apply_is_idempotent_under_repeat() {
        let mock = Arc::new(MockRunner::ok());
        let s = shaper(&mock);
        s.apply_profile(Profile::Choke).unwrap();
        s.apply_profile(Profile::Choke).unwrap();
        // Same clear+add pair both times; the second run replaces the first.
        assert_eq!(mock.calls_to("tc").len(), 4);
    }

    #[test]
    fn clear_ignores_missing_root_qdisc() {
        let mock = Arc::new(MockRunner::ok());
        mock.fail("tc", "RTNETLINK answers: No such file or directory");
        shaper(&mock).apply_profile(Profile::Standard).unwrap();
    }

    #[test]
    fn real_tc_failure_is_surfaced() {
        let mock = Arc::new(MockRunner::ok());
        mock.fail("tc", "RTNETLINK answers: Operation not permitted");
        let err = shaper(&mock).apply_profile(Profile::Choke).unwrap_err();
        assert!(matches!(err, ShaperError::TcFailed { .. }));
    }

    #[test]
    fn default_route_parsing_finds_gateway_row() {
        let table = "Iface\tDestination\tGateway\tFlags\n\
                     wlan0\t0000A8C0\t00000000\t0001\n\
                     enp9s0\t00000000\t0101A8C0\t0003\n";
        assert_eq!(parse_default_route(table), Some("enp9s0".to_string()));
    }

    #[test]
    fn no_default_route_yields_none() {
        let table = "Iface\tDestination\tGateway\tFlags\n\
                     wlan0\t0000A8C0\t00000000\t0001\n";
        assert_eq!(parse_default_route(table), None);
    }
}
