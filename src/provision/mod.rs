//! Fallback provisioning.
//!
//! One capability, an ordered list of acquisition strategies. The first
//! strategy after which the capability probes as present wins; nothing after
//! it runs. Failures are collected in order and never cut the chain short.

pub mod strategy;

use serde::Serialize;
use tracing::{info, warn};

use crate::capability::{Capability, Prober};
use crate::env::LaunchEnv;
use crate::error::StrategyError;

/// Recorded as the winning strategy when nothing had to be acquired.
pub const PREEXISTING: &str = "preexisting";

/// One acquisition step that attempts to make a capability usable.
pub trait Strategy {
    fn name(&self) -> &str;

    /// Perform the acquisition. Success here does not mean the capability is
    /// satisfied; the provisioner re-probes afterwards.
    fn acquire(&self, env: &mut LaunchEnv) -> Result<(), StrategyError>;
}

/// A failed strategy and why it failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub strategy: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningOutcome {
    Satisfied {
        by: String,
        version: Option<String>,
    },
    Unsatisfied {
        attempts: Vec<Attempt>,
    },
}

impl ProvisioningOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied { .. })
    }
}

/// Progress notifications, for the execution log.
#[derive(Debug)]
pub enum AttemptEvent<'a> {
    Started { strategy: &'a str },
    Failed(&'a Attempt),
    Succeeded { strategy: &'a str },
}

/// Satisfy `capability` with the first strategy that makes its probe pass.
pub fn provision<F>(
    prober: &dyn Prober,
    capability: &Capability,
    strategies: &[Box<dyn Strategy>],
    env: &mut LaunchEnv,
    mut on_event: F,
) -> ProvisioningOutcome
where
    F: FnMut(&AttemptEvent<'_>),
{
    let report = prober.probe(&capability.probe, env);
    if report.present {
        info!(capability = %capability.name, version = ?report.version, "already available");
        return ProvisioningOutcome::Satisfied {
            by: PREEXISTING.to_string(),
            version: report.version,
        };
    }

    let mut attempts = Vec::new();
    for strategy in strategies {
        let name = strategy.name();
        info!(capability = %capability.name, strategy = name, "trying acquisition strategy");
        on_event(&AttemptEvent::Started { strategy: name });

        let reason = match strategy.acquire(env) {
            Ok(()) => {
                let report = prober.probe(&capability.probe, env);
                if report.present {
                    info!(
                        capability = %capability.name,
                        strategy = name,
                        version = ?report.version,
                        "capability acquired"
                    );
                    on_event(&AttemptEvent::Succeeded { strategy: name });
                    return ProvisioningOutcome::Satisfied {
                        by: name.to_string(),
                        version: report.version,
                    };
                }
                format!("post-condition probe failed after {name}")
            }
            Err(e) => e.to_string(),
        };

        warn!(capability = %capability.name, strategy = name, reason = %reason, "acquisition strategy failed");
        let attempt = Attempt {
            strategy: name.to_string(),
            reason,
        };
        on_event(&AttemptEvent::Failed(&attempt));
        attempts.push(attempt);
    }

    ProvisioningOutcome::Unsatisfied { attempts }
}
