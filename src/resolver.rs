//! Dependency resolution: every declared capability, one at a time, in
//! declaration order. Required capabilities that stay unsatisfied make the
//! job unrunnable; optional ones only warn.

use tracing::{info, warn};

use crate::capability::{Capability, ProbeReport, Prober};
use crate::env::LaunchEnv;
use crate::error::Error;
use crate::provision::{self, AttemptEvent, ProvisioningOutcome, Strategy};

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub name: String,
    pub required: bool,
    pub outcome: ProvisioningOutcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub entries: Vec<Resolved>,
}

impl Resolution {
    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&ProvisioningOutcome> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.outcome)
    }

    /// Fails on the first required capability that was not satisfied.
    pub fn ensure_required(&self) -> Result<(), Error> {
        for entry in &self.entries {
            if let ProvisioningOutcome::Unsatisfied { attempts } = &entry.outcome {
                if entry.required {
                    return Err(Error::CapabilityUnsatisfiable {
                        capability: entry.name.clone(),
                        attempts: attempts.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn missing_optional(&self) -> impl Iterator<Item = &Resolved> {
        self.entries
            .iter()
            .filter(|e| !e.required && !e.outcome.is_satisfied())
    }

    pub fn render(&self) -> String {
        let width = self.entries.iter().map(|e| e.name.len()).max().unwrap_or(0);
        let mut out = String::new();
        for entry in &self.entries {
            match &entry.outcome {
                ProvisioningOutcome::Satisfied { by, version } => {
                    let version = version
                        .as_deref()
                        .map(|v| format!(" ({v})"))
                        .unwrap_or_default();
                    out.push_str(&format!(
                        "  satisfied  {:<width$}  by {by}{version}\n",
                        entry.name
                    ));
                }
                ProvisioningOutcome::Unsatisfied { attempts } => {
                    let label = if entry.required { "MISSING  " } else { "missing  " };
                    out.push_str(&format!("  {label}  {:<width$}", entry.name));
                    if !entry.required {
                        out.push_str("  (optional)");
                    }
                    out.push('\n');
                    for attempt in attempts {
                        out.push_str(&format!(
                            "             - {}: {}\n",
                            attempt.strategy, attempt.reason
                        ));
                    }
                }
            }
        }
        out
    }
}

/// Resolve `capabilities` in order. `on_event` sees every strategy transition.
pub fn resolve_all<F>(
    prober: &dyn Prober,
    capabilities: &[Capability],
    python: &str,
    env: &mut LaunchEnv,
    mut on_event: F,
) -> Resolution
where
    F: FnMut(&Capability, &AttemptEvent<'_>),
{
    let mut resolution = Resolution::default();
    for capability in capabilities {
        let strategies: Vec<Box<dyn Strategy>> = capability
            .strategies
            .iter()
            .map(|spec| spec.build(python))
            .collect();
        let outcome = provision::provision(prober, capability, &strategies, env, |event| {
            on_event(capability, event)
        });

        if !outcome.is_satisfied() {
            if capability.required {
                warn!(capability = %capability.name, "required capability unavailable");
            } else {
                warn!(capability = %capability.name, "optional capability unavailable; continuing");
            }
        }
        resolution.entries.push(Resolved {
            name: capability.name.clone(),
            required: capability.required,
            outcome,
        });
    }
    info!(
        total = resolution.entries.len(),
        satisfied = resolution
            .entries
            .iter()
            .filter(|e| e.outcome.is_satisfied())
            .count(),
        "dependency resolution finished"
    );
    resolution
}

/// Probe every capability without acquiring anything.
pub fn probe_all(
    prober: &dyn Prober,
    capabilities: &[Capability],
    env: &LaunchEnv,
) -> Vec<(Capability, ProbeReport)> {
    capabilities
        .iter()
        .map(|cap| (cap.clone(), prober.probe(&cap.probe, env)))
        .collect()
}

pub fn render_probe_report(results: &[(Capability, ProbeReport)]) -> String {
    let width = results.iter().map(|(c, _)| c.name.len()).max().unwrap_or(0);
    let mut out = String::new();
    for (cap, report) in results {
        let mark = if report.present { "ok  " } else { "FAIL" };
        let version = report.version.as_deref().unwrap_or("-");
        let optional = if cap.required { "" } else { "  (optional)" };
        out.push_str(&format!(
            "  {mark}  {:<width$}  {version:<14}  {}{optional}\n",
            cap.name,
            cap.probe.describe()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Probe;
    use crate::provision::strategy::StrategySpec;
    use crate::provision::{Attempt, PREEXISTING};

    /// Reports present for the capabilities named in `present`.
    struct NamedProber {
        present: Vec<&'static str>,
    }

    impl Prober for NamedProber {
        fn probe(&self, probe: &Probe, _env: &LaunchEnv) -> ProbeReport {
            let module = match probe {
                Probe::PythonModule { module, .. } => module.as_str(),
                Probe::Executable { program, .. } => program.as_str(),
                Probe::PythonCheck { code } => code.as_str(),
            };
            if self.present.contains(&module) {
                ProbeReport::present(None)
            } else {
                ProbeReport::absent()
            }
        }
    }

    fn cap(name: &str, required: bool, strategies: Vec<StrategySpec>) -> Capability {
        Capability {
            name: name.to_string(),
            required,
            probe: Probe::PythonModule {
                module: name.to_string(),
                attr: None,
            },
            strategies,
        }
    }

    fn failing_command(name: &str) -> StrategySpec {
        StrategySpec::Command {
            name: Some(name.to_string()),
            program: "definitely-missing-runwarden-installer".to_string(),
            args: vec![],
        }
    }

    #[test]
    fn resolves_in_declaration_order() {
        let prober = NamedProber {
            present: vec!["torch", "diffusers"],
        };
        let caps = vec![cap("torch", true, vec![]), cap("diffusers", true, vec![])];
        let resolution = resolve_all(&prober, &caps, "python3", &mut LaunchEnv::new(), |_, _| {});
        let names: Vec<_> = resolution.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["torch", "diffusers"]);
        assert!(resolution.ensure_required().is_ok());
        assert_eq!(
            resolution.get("torch"),
            Some(&ProvisioningOutcome::Satisfied {
                by: PREEXISTING.to_string(),
                version: None
            })
        );
    }

    #[test]
    fn missing_required_capability_is_fatal_with_all_attempts() {
        let prober = NamedProber { present: vec![] };
        let caps = vec![cap(
            "ffmpeg",
            true,
            vec![failing_command("first"), failing_command("second")],
        )];
        let resolution = resolve_all(&prober, &caps, "python3", &mut LaunchEnv::new(), |_, _| {});
        let err = resolution.ensure_required().unwrap_err();
        match err {
            Error::CapabilityUnsatisfiable {
                capability,
                attempts,
            } => {
                assert_eq!(capability, "ffmpeg");
                let names: Vec<_> = attempts.iter().map(|a| a.strategy.as_str()).collect();
                assert_eq!(names, vec!["first", "second"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_optional_capability_only_warns() {
        let prober = NamedProber {
            present: vec!["torch"],
        };
        let caps = vec![cap("torch", true, vec![]), cap("openai", false, vec![])];
        let resolution = resolve_all(&prober, &caps, "python3", &mut LaunchEnv::new(), |_, _| {});
        assert!(resolution.ensure_required().is_ok());
        let missing: Vec<_> = resolution.missing_optional().map(|e| e.name.as_str()).collect();
        assert_eq!(missing, vec!["openai"]);
        assert!(resolution.render().contains("(optional)"));
    }

    #[test]
    fn later_capabilities_resolve_after_an_optional_failure() {
        let prober = NamedProber {
            present: vec!["transformers"],
        };
        let caps = vec![
            cap("openai", false, vec![failing_command("pip")]),
            cap("transformers", true, vec![]),
        ];
        let mut events = Vec::new();
        let resolution = resolve_all(&prober, &caps, "python3", &mut LaunchEnv::new(), |cap, event| {
            if let AttemptEvent::Failed(Attempt { strategy, .. }) = event {
                events.push(format!("{}:{strategy}", cap.name));
            }
        });
        assert_eq!(events, vec!["openai:pip"]);
        assert!(resolution.get("transformers").unwrap().is_satisfied());
    }

    #[test]
    fn render_lists_attempts_under_missing_capability() {
        let resolution = Resolution {
            entries: vec![Resolved {
                name: "ffmpeg".to_string(),
                required: true,
                outcome: ProvisioningOutcome::Unsatisfied {
                    attempts: vec![Attempt {
                        strategy: "module-load".to_string(),
                        reason: "`module load ffmpeg` exited with exit status: 1".to_string(),
                    }],
                },
            }],
        };
        let rendered = resolution.render();
        assert!(rendered.contains("MISSING"));
        assert!(rendered.contains("- module-load: `module load ffmpeg`"));
    }

    #[test]
    fn probe_report_marks_absent_capabilities() {
        let prober = NamedProber {
            present: vec!["torch"],
        };
        let caps = vec![cap("torch", true, vec![]), cap("openai", false, vec![])];
        let results = probe_all(&prober, &caps, &LaunchEnv::new());
        let rendered = render_probe_report(&results);
        assert!(rendered.contains("ok    torch"));
        assert!(rendered.contains("FAIL  openai"));
        assert!(rendered.contains("import openai"));
    }
}
