use serde::Serialize;
use tracing::info;

use crate::domain::{AcquisitionKind, PerKind, PhaseEncoding};
use crate::overview::Dataset;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopupDecision {
    pub feasible: bool,
    pub only: PerKind<bool>,
    pub dwi_and_fmap_combine: bool,
    pub directions: PerKind<Vec<PhaseEncoding>>,
}

impl TopupDecision {
    pub fn only(&self, kind: AcquisitionKind) -> bool {
        *self.only.get(kind)
    }
}

pub fn has_opposite_directions(directions: &[PhaseEncoding]) -> bool {
    directions
        .iter()
        .any(|direction| directions.contains(&direction.opposite()))
}

pub fn eligible_directions(dataset: &Dataset, kind: AcquisitionKind) -> Vec<PhaseEncoding> {
    dataset
        .of_kind(kind)
        .iter()
        .filter(|acquisition| acquisition.is_topup_eligible())
        .map(|acquisition| acquisition.phase_encoding)
        .collect()
}

// Only the DWI + fieldmap path decides feasibility; the per-kind flags pick
// which inputs feed topup once it is feasible.
pub fn resolve(dataset: &Dataset) -> TopupDecision {
    let directions = PerKind::from_fn(|kind| eligible_directions(dataset, kind));
    let only = PerKind::from_fn(|kind| has_opposite_directions(directions.get(kind)));

    let combined: Vec<PhaseEncoding> = directions
        .dwi
        .iter()
        .chain(directions.fmap.iter())
        .copied()
        .collect();
    let dwi_and_fmap_combine = has_opposite_directions(&combined);

    let decision = TopupDecision {
        feasible: dwi_and_fmap_combine,
        only,
        dwi_and_fmap_combine,
        directions,
    };
    info!(
        feasible = decision.feasible,
        only_dwi = decision.only.dwi,
        only_fmap = decision.only.fmap,
        only_sbref = decision.only.sbref,
        dwi_fmap_combined = decision.dwi_and_fmap_combine,
        "topup compatibility resolved"
    );
    decision
}
