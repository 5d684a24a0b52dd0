//! Route selection: renew, settle, probe, evaluate, repeat.
//!
//! One selection run spends a bounded number of attempts trying to land
//! an instance on a route that satisfies its region constraint. Each
//! attempt renews the circuit, waits for the new circuit to settle,
//! measures through the proxy and evaluates the result.
//!
//! ```text
//!  Idle -> Renewing -> Probing -> Evaluating -> Accepted
//!            ^                        |
//!            `------- Retrying <-----'         (budget left)
//!                                     `------> Exhausted (budget spent)
//! ```
//!
//! The engine drives this against a live instance; tests drive it with
//! a scripted [`RouteSource`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use torpool_store::{AcceptancePolicy, RegionCode, RouteResult};
use tracing::{debug, info, warn};

use crate::control::ControlError;
use crate::probe::{ProbeError, ProbeReport};

/// Where a selection run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    Idle,
    Renewing,
    Probing,
    Evaluating,
    Accepted,
    Retrying,
    Exhausted,
}

impl SelectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SelectionState::Accepted | SelectionState::Exhausted)
    }
}

/// The two operations a selection run needs from an instance.
pub trait RouteSource: Send + Sync {
    /// Ask for a fresh circuit.
    fn renew(&self) -> impl Future<Output = Result<(), ControlError>> + Send;
    /// Measure the current route.
    fn measure(&self) -> impl Future<Output = Result<ProbeReport, ProbeError>> + Send;
}

/// Cooperative cancellation, checked between steps of a run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SelectionSpec {
    pub region: RegionCode,
    /// Maximum attempts, each costing at most one renewal.
    pub budget: u32,
    /// Pause between renewal and measurement.
    pub settle: Duration,
    pub policy: AcceptancePolicy,
}

/// Why an attempt did not produce an accepted route.
#[derive(Debug, Clone)]
pub enum RejectReason {
    RegionMismatch {
        wanted: RegionCode,
        got: Option<RegionCode>,
    },
    RenewalFailed(String),
    ProbeFailed(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::RegionMismatch { wanted, got } => match got {
                Some(got) => write!(f, "exit in {got}, wanted {wanted}"),
                None => write!(f, "exit region unknown, wanted {wanted}"),
            },
            RejectReason::RenewalFailed(err) => write!(f, "renewal failed: {err}"),
            RejectReason::ProbeFailed(err) => write!(f, "probe failed: {err}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteRejection {
    pub attempt: u32,
    pub reason: RejectReason,
}

#[derive(Debug)]
pub enum SelectionOutcome {
    /// A qualifying route was found.
    Accepted(RouteResult),
    /// The budget ran out without one.
    Exhausted,
    /// The cancel flag was raised between steps.
    Cancelled,
}

#[derive(Debug)]
pub struct SelectionRun {
    pub outcome: SelectionOutcome,
    pub attempts: u32,
    pub rejections: Vec<RouteRejection>,
}

impl SelectionRun {
    pub fn final_state(&self) -> SelectionState {
        match self.outcome {
            SelectionOutcome::Accepted(_) => SelectionState::Accepted,
            SelectionOutcome::Exhausted => SelectionState::Exhausted,
            SelectionOutcome::Cancelled => SelectionState::Idle,
        }
    }
}

/// Drive one selection run to a terminal state. The budget caps circuit
/// renewals: a run with budget N renews at most N times.
pub async fn run_selection<S: RouteSource>(
    source: &S,
    spec: &SelectionSpec,
    cancel: &CancelFlag,
) -> SelectionRun {
    let mut state = SelectionState::Idle;
    let mut attempts = 0u32;
    let mut rejections: Vec<RouteRejection> = Vec::new();
    let mut best: Option<RouteResult> = None;

    while attempts < spec.budget {
        if cancel.is_cancelled() {
            return cancelled(attempts, rejections);
        }
        attempts += 1;

        transition(&mut state, SelectionState::Renewing);
        if let Err(err) = source.renew().await {
            warn!(attempt = attempts, error = %err, "circuit renewal failed");
            rejections.push(RouteRejection {
                attempt: attempts,
                reason: RejectReason::RenewalFailed(err.to_string()),
            });
            transition(&mut state, SelectionState::Retrying);
            continue;
        }

        if cancel.is_cancelled() {
            return cancelled(attempts, rejections);
        }
        if !spec.settle.is_zero() {
            sleep(spec.settle).await;
        }
        if cancel.is_cancelled() {
            return cancelled(attempts, rejections);
        }

        transition(&mut state, SelectionState::Probing);
        let report = match source.measure().await {
            Ok(report) => report,
            Err(err) => {
                debug!(attempt = attempts, error = %err, "probe failed");
                rejections.push(RouteRejection {
                    attempt: attempts,
                    reason: RejectReason::ProbeFailed(err.to_string()),
                });
                transition(&mut state, SelectionState::Retrying);
                continue;
            }
        };

        transition(&mut state, SelectionState::Evaluating);
        if !spec.region.accepts(report.region.as_ref()) {
            debug!(
                attempt = attempts,
                wanted = %spec.region,
                got = ?report.region,
                "route rejected on region"
            );
            rejections.push(RouteRejection {
                attempt: attempts,
                reason: RejectReason::RegionMismatch {
                    wanted: spec.region.clone(),
                    got: report.region.clone(),
                },
            });
            transition(&mut state, SelectionState::Retrying);
            continue;
        }

        let route = report.into_route(attempts);
        match spec.policy {
            AcceptancePolicy::FirstImprovement => {
                transition(&mut state, SelectionState::Accepted);
                info!(attempt = attempts, exit = %route.exit_ip, "route accepted");
                return SelectionRun {
                    outcome: SelectionOutcome::Accepted(route),
                    attempts,
                    rejections,
                };
            }
            AcceptancePolicy::BestOfBudget => {
                let keep = match &best {
                    None => true,
                    Some(current) => prefer(&route, current),
                };
                if keep {
                    debug!(attempt = attempts, exit = %route.exit_ip, "new best candidate");
                    best = Some(route);
                }
                transition(&mut state, SelectionState::Retrying);
            }
        }
    }

    match best {
        Some(route) => {
            transition(&mut state, SelectionState::Accepted);
            info!(attempts, exit = %route.exit_ip, "best route of budget accepted");
            SelectionRun {
                outcome: SelectionOutcome::Accepted(route),
                attempts,
                rejections,
            }
        }
        None => {
            transition(&mut state, SelectionState::Exhausted);
            SelectionRun {
                outcome: SelectionOutcome::Exhausted,
                attempts,
                rejections,
            }
        }
    }
}

fn cancelled(attempts: u32, rejections: Vec<RouteRejection>) -> SelectionRun {
    info!(attempts, "selection cancelled");
    SelectionRun {
        outcome: SelectionOutcome::Cancelled,
        attempts,
        rejections,
    }
}

/// Ranking between qualifying routes: lower latency first, higher
/// throughput as the tie break.
fn prefer(candidate: &RouteResult, current: &RouteResult) -> bool {
    if candidate.latency_ms != current.latency_ms {
        return candidate.latency_ms < current.latency_ms;
    }
    candidate.throughput_bps.unwrap_or(0) > current.throughput_bps.unwrap_or(0)
}

fn transition(state: &mut SelectionState, next: SelectionState) {
    debug!(from = ?state, to = ?next, "selection state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use std::time::Instant;

    enum Step {
        Route(ProbeReport),
        RenewFail,
        ProbeFail,
    }

    struct ScriptedSource {
        steps: Mutex<VecDeque<Step>>,
        renewals: AtomicU32,
        measures: AtomicU32,
        cancel_after_measure: Option<CancelFlag>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                renewals: AtomicU32::new(0),
                measures: AtomicU32::new(0),
                cancel_after_measure: None,
            }
        }

        fn renewals(&self) -> u32 {
            self.renewals.load(Ordering::SeqCst)
        }

        fn measures(&self) -> u32 {
            self.measures.load(Ordering::SeqCst)
        }
    }

    impl RouteSource for ScriptedSource {
        async fn renew(&self) -> Result<(), ControlError> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            let mut steps = self.steps.lock().unwrap();
            if matches!(steps.front(), Some(Step::RenewFail)) {
                steps.pop_front();
                return Err(ControlError::Closed);
            }
            Ok(())
        }

        async fn measure(&self) -> Result<ProbeReport, ProbeError> {
            self.measures.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop_front();
            if let Some(flag) = &self.cancel_after_measure {
                flag.cancel();
            }
            match step {
                Some(Step::Route(report)) => Ok(report),
                _ => Err(ProbeError::Connection("scripted failure".to_string())),
            }
        }
    }

    fn exit(region: &str, latency_ms: u64) -> Step {
        Step::Route(ProbeReport {
            exit_ip: "185.220.101.1".parse().unwrap(),
            region: Some(RegionCode::parse(region).unwrap()),
            city: None,
            latency_ms,
            throughput_bps: None,
        })
    }

    fn unknown_exit(latency_ms: u64) -> Step {
        Step::Route(ProbeReport {
            exit_ip: "185.220.101.1".parse().unwrap(),
            region: None,
            city: None,
            latency_ms,
            throughput_bps: None,
        })
    }

    fn spec(region: &str, budget: u32, policy: AcceptancePolicy) -> SelectionSpec {
        SelectionSpec {
            region: RegionCode::parse(region).unwrap(),
            budget,
            settle: Duration::ZERO,
            policy,
        }
    }

    #[tokio::test]
    async fn test_first_improvement_takes_first_qualifying() {
        let source = ScriptedSource::new(vec![
            exit("us", 120),
            exit("us", 95),
            exit("us", 110),
        ]);
        let run = run_selection(
            &source,
            &spec("us", 3, AcceptancePolicy::FirstImprovement),
            &CancelFlag::new(),
        )
        .await;

        let SelectionOutcome::Accepted(route) = run.outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(route.latency_ms, 120);
        assert_eq!(run.attempts, 1);
        assert_eq!(source.measures(), 1);
        assert!(run.rejections.is_empty());
    }

    #[tokio::test]
    async fn test_best_of_budget_spends_everything() {
        let source = ScriptedSource::new(vec![
            exit("us", 120),
            exit("us", 95),
            exit("us", 110),
        ]);
        let run = run_selection(
            &source,
            &spec("us", 3, AcceptancePolicy::BestOfBudget),
            &CancelFlag::new(),
        )
        .await;

        let SelectionOutcome::Accepted(route) = run.outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(route.latency_ms, 95);
        assert_eq!(run.attempts, 3);
        assert_eq!(source.measures(), 3);
    }

    #[tokio::test]
    async fn test_budget_caps_renewals() {
        let source = ScriptedSource::new(vec![Step::ProbeFail, Step::ProbeFail, Step::ProbeFail]);
        let run = run_selection(
            &source,
            &spec("us", 3, AcceptancePolicy::FirstImprovement),
            &CancelFlag::new(),
        )
        .await;

        assert!(matches!(run.outcome, SelectionOutcome::Exhausted));
        assert_eq!(run.attempts, 3);
        assert_eq!(source.renewals(), 3);
        assert_eq!(run.rejections.len(), 3);
        assert_eq!(run.final_state(), SelectionState::Exhausted);
    }

    #[tokio::test]
    async fn test_region_hunt_until_match() {
        // Two wrong-region exits, then the right one.
        let source = ScriptedSource::new(vec![
            exit("de", 50),
            exit("de", 60),
            exit("us", 80),
        ]);
        let run = run_selection(
            &source,
            &spec("us", 3, AcceptancePolicy::FirstImprovement),
            &CancelFlag::new(),
        )
        .await;

        let SelectionOutcome::Accepted(route) = run.outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(route.latency_ms, 80);
        assert_eq!(route.attempts, 3);
        assert_eq!(run.attempts, 3);
        assert_eq!(run.rejections.len(), 2);
        assert!(matches!(
            run.rejections[0].reason,
            RejectReason::RegionMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_region_never_satisfies_specific() {
        let source = ScriptedSource::new(vec![unknown_exit(40)]);
        let run = run_selection(
            &source,
            &spec("us", 1, AcceptancePolicy::FirstImprovement),
            &CancelFlag::new(),
        )
        .await;

        assert!(matches!(run.outcome, SelectionOutcome::Exhausted));
        assert!(matches!(
            run.rejections[0].reason,
            RejectReason::RegionMismatch { got: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_wildcard_accepts_unknown_region() {
        let source = ScriptedSource::new(vec![unknown_exit(40)]);
        let run = run_selection(
            &source,
            &spec("any", 1, AcceptancePolicy::FirstImprovement),
            &CancelFlag::new(),
        )
        .await;

        assert!(matches!(run.outcome, SelectionOutcome::Accepted(_)));
    }

    #[tokio::test]
    async fn test_renewal_failure_consumes_attempt() {
        let source = ScriptedSource::new(vec![Step::RenewFail, exit("us", 100)]);
        let run = run_selection(
            &source,
            &spec("us", 2, AcceptancePolicy::FirstImprovement),
            &CancelFlag::new(),
        )
        .await;

        let SelectionOutcome::Accepted(route) = run.outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(route.attempts, 2);
        assert_eq!(run.rejections.len(), 1);
        assert!(matches!(
            run.rejections[0].reason,
            RejectReason::RenewalFailed(_)
        ));

        let source = ScriptedSource::new(vec![Step::RenewFail]);
        let run = run_selection(
            &source,
            &spec("us", 1, AcceptancePolicy::FirstImprovement),
            &CancelFlag::new(),
        )
        .await;
        assert!(matches!(run.outcome, SelectionOutcome::Exhausted));
    }

    #[tokio::test]
    async fn test_cancel_before_first_attempt() {
        let source = ScriptedSource::new(vec![exit("us", 100)]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let run = run_selection(
            &source,
            &spec("us", 3, AcceptancePolicy::FirstImprovement),
            &cancel,
        )
        .await;

        assert!(matches!(run.outcome, SelectionOutcome::Cancelled));
        assert_eq!(run.attempts, 0);
        assert_eq!(source.renewals(), 0);
        assert_eq!(run.final_state(), SelectionState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_between_attempts() {
        let cancel = CancelFlag::new();
        let mut source = ScriptedSource::new(vec![exit("de", 50), exit("us", 60)]);
        source.cancel_after_measure = Some(cancel.clone());

        let run = run_selection(
            &source,
            &spec("us", 3, AcceptancePolicy::FirstImprovement),
            &cancel,
        )
        .await;

        // First attempt is rejected on region, then the flag stops the run.
        assert!(matches!(run.outcome, SelectionOutcome::Cancelled));
        assert_eq!(run.attempts, 1);
        assert_eq!(source.measures(), 1);
    }

    #[tokio::test]
    async fn test_settle_interval_is_waited() {
        let source = ScriptedSource::new(vec![exit("us", 100)]);
        let mut selection = spec("us", 1, AcceptancePolicy::FirstImprovement);
        selection.settle = Duration::from_millis(60);

        let started = Instant::now();
        let run = run_selection(&source, &selection, &CancelFlag::new()).await;
        assert!(matches!(run.outcome, SelectionOutcome::Accepted(_)));
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_best_of_budget_ranks_latency_then_throughput() {
        let report = |latency_ms, throughput_bps| {
            Step::Route(ProbeReport {
                exit_ip: "185.220.101.1".parse().unwrap(),
                region: Some(RegionCode::parse("us").unwrap()),
                city: None,
                latency_ms,
                throughput_bps,
            })
        };

        // Latency decides first, even against a higher-throughput route.
        let source = ScriptedSource::new(vec![
            report(50, Some(100_000)),
            report(200, Some(500_000)),
        ]);
        let run = run_selection(
            &source,
            &spec("us", 2, AcceptancePolicy::BestOfBudget),
            &CancelFlag::new(),
        )
        .await;
        let SelectionOutcome::Accepted(route) = run.outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(route.latency_ms, 50);
        assert_eq!(route.throughput_bps, Some(100_000));

        // Equal latency falls back to throughput.
        let source = ScriptedSource::new(vec![
            report(80, Some(100_000)),
            report(80, Some(500_000)),
            report(80, None),
        ]);
        let run = run_selection(
            &source,
            &spec("us", 3, AcceptancePolicy::BestOfBudget),
            &CancelFlag::new(),
        )
        .await;
        let SelectionOutcome::Accepted(route) = run.outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(route.throughput_bps, Some(500_000));
    }
}
