//! Equipment survey: a fixed list of receiver positions visited one scan at a time.

use serde::{Deserialize, Serialize};

use crate::beamforming::Direction;
use crate::config::SurveyConfig;

/// Ground-truth receiver placement. `range` is in the survey's own units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurveyPosition {
    pub range: u32,
    pub theta_deg: u32,
    pub phi_deg: u32,
}

impl SurveyPosition {
    pub fn direction(&self) -> Direction {
        Direction::new(self.theta_deg as f64, self.phi_deg as f64)
    }
}

impl std::fmt::Display for SurveyPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(R={}, θ={}, φ={})", self.range, self.theta_deg, self.phi_deg)
    }
}

/// Ordered positions: range outermost, then θ, then φ. Broadside (θ = 0)
/// appears once per range with φ = 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurveyPlan {
    positions: Vec<SurveyPosition>,
}

fn stepped(start: u32, end: u32, step: u32) -> impl Iterator<Item = u32> {
    (start..=end).step_by(step.max(1) as usize)
}

impl SurveyPlan {
    pub fn from_config(config: &SurveyConfig) -> Self {
        let mut positions = Vec::new();
        for range in stepped(config.range_start, config.range_end, config.range_step) {
            for theta_deg in stepped(config.theta_start, config.theta_end, config.theta_step) {
                if theta_deg == 0 {
                    positions.push(SurveyPosition {
                        range,
                        theta_deg,
                        phi_deg: 0,
                    });
                    continue;
                }
                for phi_deg in stepped(config.phi_start, config.phi_end, config.phi_step) {
                    positions.push(SurveyPosition {
                        range,
                        theta_deg,
                        phi_deg,
                    });
                }
            }
        }
        let end = config.end_index.unwrap_or(positions.len()).min(positions.len());
        let start = config.start_index.min(end);
        Self {
            positions: positions[start..end].to_vec(),
        }
    }

    pub fn standard() -> Self {
        Self::from_config(&SurveyConfig::default())
    }

    pub fn positions(&self) -> &[SurveyPosition] {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Cursor over a plan, advanced once per completed scan.
#[derive(Debug, Clone)]
pub struct Survey {
    plan: SurveyPlan,
    index: usize,
}

impl Survey {
    pub fn new(plan: SurveyPlan) -> Self {
        Self { plan, index: 0 }
    }

    pub fn current(&self) -> Option<SurveyPosition> {
        self.plan.positions.get(self.index).copied()
    }

    /// Moves to the next position and returns it, or `None` once the plan is exhausted.
    pub fn advance(&mut self) -> Option<SurveyPosition> {
        if self.index < self.plan.len() {
            self.index += 1;
        }
        self.current()
    }

    pub fn is_complete(&self) -> bool {
        self.index >= self.plan.len()
    }

    /// `(completed, total)`
    pub fn progress(&self) -> (usize, usize) {
        (self.index, self.plan.len())
    }
}
