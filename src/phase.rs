//! Pipeline vocabulary: the fixed Scout → Plan → Build → Review order and
//! the status enums shared by runs, workspaces, and phase records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One stage of the pipeline. The order is fixed; `ALL` is the only
/// sequence a workspace may execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Scout,
    Plan,
    Build,
    Review,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Scout, Phase::Plan, Phase::Build, Phase::Review];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Scout => "scout",
            Phase::Plan => "plan",
            Phase::Build => "build",
            Phase::Review => "review",
        }
    }

    /// The phase that follows this one, or `None` after review.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Scout => Some(Phase::Plan),
            Phase::Plan => Some(Phase::Build),
            Phase::Build => Some(Phase::Review),
            Phase::Review => None,
        }
    }

    /// The run/workspace status while this phase is in flight.
    pub fn active_status(&self) -> RunStatus {
        match self {
            Phase::Scout => RunStatus::Scouting,
            Phase::Plan => RunStatus::Planning,
            Phase::Build => RunStatus::Building,
            Phase::Review => RunStatus::Reviewing,
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scout" => Ok(Phase::Scout),
            "plan" => Ok(Phase::Plan),
            "build" => Ok(Phase::Build),
            "review" => Ok(Phase::Review),
            _ => Err(format!("Invalid phase name: {}", s)),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single phase record within a workspace's sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Succeeded => "succeeded",
            PhaseStatus::Failed => "failed",
        }
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PhaseStatus::Pending),
            "running" => Ok(PhaseStatus::Running),
            "succeeded" => Ok(PhaseStatus::Succeeded),
            "failed" => Ok(PhaseStatus::Failed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Overall pipeline status. Used both for a run's stored status and for the
/// stage derived from a workspace's phase records: PENDING → SCOUTING →
/// PLANNING → BUILDING → REVIEWING → DONE, with FAILED reachable from any
/// active state and ABORTED only via explicit cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Scouting,
    Planning,
    Building,
    Reviewing,
    Done,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Scouting => "scouting",
            RunStatus::Planning => "planning",
            RunStatus::Building => "building",
            RunStatus::Reviewing => "reviewing",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Done | RunStatus::Failed | RunStatus::Aborted
        )
    }

    /// Position along the forward path, used to pick the frontier when
    /// rolling workspace stages up into a run status.
    pub fn progress(&self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Scouting => 1,
            RunStatus::Planning => 2,
            RunStatus::Building => 3,
            RunStatus::Reviewing => 4,
            RunStatus::Done => 5,
            RunStatus::Failed => 5,
            RunStatus::Aborted => 5,
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "scouting" => Ok(RunStatus::Scouting),
            "planning" => Ok(RunStatus::Planning),
            "building" => Ok(RunStatus::Building),
            "reviewing" => Ok(RunStatus::Reviewing),
            "done" => Ok(RunStatus::Done),
            "failed" => Ok(RunStatus::Failed),
            "aborted" => Ok(RunStatus::Aborted),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_run_in_fixed_order() {
        assert_eq!(
            Phase::ALL,
            [Phase::Scout, Phase::Plan, Phase::Build, Phase::Review]
        );
        assert_eq!(Phase::Scout.next(), Some(Phase::Plan));
        assert_eq!(Phase::Plan.next(), Some(Phase::Build));
        assert_eq!(Phase::Build.next(), Some(Phase::Review));
        assert_eq!(Phase::Review.next(), None);
    }

    #[test]
    fn phase_names_roundtrip() {
        for name in &["scout", "plan", "build", "review"] {
            let phase: Phase = name.parse().unwrap();
            assert_eq!(phase.as_str(), *name);
            assert_eq!(phase.to_string(), *name);
        }
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn phase_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Phase::Scout).unwrap(), "\"scout\"");
        let parsed: Phase = serde_json::from_str("\"review\"").unwrap();
        assert_eq!(parsed, Phase::Review);
    }

    #[test]
    fn active_status_maps_each_phase_to_its_stage() {
        assert_eq!(Phase::Scout.active_status(), RunStatus::Scouting);
        assert_eq!(Phase::Plan.active_status(), RunStatus::Planning);
        assert_eq!(Phase::Build.active_status(), RunStatus::Building);
        assert_eq!(Phase::Review.active_status(), RunStatus::Reviewing);
    }

    #[test]
    fn phase_status_roundtrips() {
        for name in &["pending", "running", "succeeded", "failed"] {
            let status: PhaseStatus = name.parse().unwrap();
            assert_eq!(status.as_str(), *name);
        }
        assert!("done".parse::<PhaseStatus>().is_err());
    }

    #[test]
    fn run_status_roundtrips() {
        for name in &[
            "pending",
            "scouting",
            "planning",
            "building",
            "reviewing",
            "done",
            "failed",
            "aborted",
        ] {
            let status: RunStatus = name.parse().unwrap();
            assert_eq!(status.as_str(), *name);
        }
        assert!("queued".parse::<RunStatus>().is_err());
    }

    #[test]
    fn only_done_failed_aborted_are_terminal() {
        assert!(RunStatus::Done.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Building.is_terminal());
    }

    #[test]
    fn progress_is_monotonic_along_the_pipeline() {
        let order = [
            RunStatus::Pending,
            RunStatus::Scouting,
            RunStatus::Planning,
            RunStatus::Building,
            RunStatus::Reviewing,
            RunStatus::Done,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].progress() < pair[1].progress());
        }
    }
}
