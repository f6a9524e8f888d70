use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{AcquisitionKind, Axis, PhaseEncoding};
use crate::error::PrepError;
use crate::overview::Dataset;
use crate::topup::TopupDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopupSource {
    SbrefOnly,
    FmapOnly,
    DwiFmapCombined,
}

fn sbref_only(decision: &TopupDecision) -> bool {
    decision.only(AcquisitionKind::Sbref)
}

fn fmap_only(decision: &TopupDecision) -> bool {
    decision.only(AcquisitionKind::Fmap)
}

fn dwi_fmap_combined(decision: &TopupDecision) -> bool {
    decision.dwi_and_fmap_combine
}

// Evaluated top to bottom, first match wins.
const SOURCE_PRIORITY: [(TopupSource, fn(&TopupDecision) -> bool); 3] = [
    (TopupSource::SbrefOnly, sbref_only),
    (TopupSource::FmapOnly, fmap_only),
    (TopupSource::DwiFmapCombined, dwi_fmap_combined),
];

pub fn select_source(decision: &TopupDecision) -> Option<TopupSource> {
    SOURCE_PRIORITY
        .iter()
        .find(|(_, applies)| applies(decision))
        .map(|(source, _)| *source)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AcqpRow {
    pub phase_encoding: PhaseEncoding,
    pub readout_time: f64,
}

impl AcqpRow {
    pub fn new(phase_encoding: PhaseEncoding, readout_time: f64) -> Self {
        Self {
            phase_encoding,
            readout_time,
        }
    }

    pub fn direction(&self) -> [i8; 3] {
        self.phase_encoding.direction_vector()
    }
}

impl fmt::Display for AcqpRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [dx, dy, dz] = self.direction();
        write!(f, "{dx} {dy} {dz} {}", self.readout_time)
    }
}

impl FromStr for AcqpRow {
    type Err = PrepError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [dx, dy, dz, readout] = tokens.as_slice() else {
            return Err(PrepError::AcqpParse(format!(
                "expected 4 columns, got {}: {line:?}",
                tokens.len()
            )));
        };
        let component = |token: &str| {
            token
                .parse::<i8>()
                .map_err(|_| PrepError::AcqpParse(format!("bad direction component {token:?}")))
        };
        let vector = [component(dx)?, component(dy)?, component(dz)?];
        let phase_encoding = match vector {
            [x, 0, 0] if x.abs() == 1 => PhaseEncoding::new(Axis::X, x < 0),
            [0, y, 0] if y.abs() == 1 => PhaseEncoding::new(Axis::Y, y < 0),
            [0, 0, z] if z.abs() == 1 => PhaseEncoding::new(Axis::Z, z < 0),
            _ => {
                return Err(PrepError::AcqpParse(format!(
                    "direction {vector:?} is not a unit axis"
                )));
            }
        };
        let readout_time = readout
            .parse::<f64>()
            .map_err(|_| PrepError::AcqpParse(format!("bad readout time {readout:?}")))?;
        Ok(Self::new(phase_encoding, readout_time))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AcqpTable {
    pub rows: Vec<AcqpRow>,
}

impl AcqpTable {
    // 1-based row index of the first row encoded like `target`.
    pub fn index_of(&self, target: PhaseEncoding) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.phase_encoding == target)
            .map(|i| i + 1)
    }
}

impl fmt::Display for AcqpTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in &self.rows {
            writeln!(f, "{row}")?;
        }
        Ok(())
    }
}

impl FromStr for AcqpTable {
    type Err = PrepError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let rows = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rows })
    }
}

pub fn format_index(index: &[usize]) -> String {
    let joined = index
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    format!("{joined}\n")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopupInput {
    pub kind: AcquisitionKind,
    pub path: Utf8PathBuf,
    pub frame: Option<usize>,
    pub rows: usize,
    pub phase_encoding: PhaseEncoding,
    pub readout_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopupPlan {
    pub source: TopupSource,
    pub inputs: Vec<TopupInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "from")]
pub enum MaskSource {
    TopupCorrectedMean,
    FirstLowB { volume: usize },
}

// What topup left behind for eddy: `base` is the value passed to --topup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopupOutputs {
    pub base: Utf8PathBuf,
    pub fieldcoef: Utf8PathBuf,
    pub movpar: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EddyInputs {
    pub acqp: AcqpTable,
    pub index: Vec<usize>,
    pub mask: MaskSource,
    pub topup: Option<TopupPlan>,
    pub topup_outputs: Option<TopupOutputs>,
}

impl EddyInputs {
    pub fn with_topup_outputs(mut self, outputs: TopupOutputs) -> Self {
        self.topup_outputs = Some(outputs);
        self
    }
}

pub fn assemble(dataset: &Dataset, decision: &TopupDecision) -> Result<EddyInputs, PrepError> {
    let dwi = dataset.primary_dwi()?;

    if !decision.feasible {
        // The fallback mask is cut from a b0 frame, so one is still required.
        let volume = dwi
            .first_low_b()
            .ok_or_else(|| PrepError::NoLowBVolume(dwi.path.to_string()))?;
        let acqp = AcqpTable {
            rows: vec![AcqpRow::new(dwi.phase_encoding, dwi.total_readout_time)],
        };
        info!(phase_encoding = %dwi.phase_encoding, "topup not feasible, synthesizing acqp row");
        return Ok(EddyInputs {
            acqp,
            index: vec![1; dwi.frames],
            mask: MaskSource::FirstLowB { volume },
            topup: None,
            topup_outputs: None,
        });
    }

    let source = select_source(decision).ok_or_else(|| {
        PrepError::InternalInvariant(
            "topup marked feasible but no input source applies".to_string(),
        )
    })?;
    let inputs = topup_inputs(dataset, source);

    let rows = inputs
        .iter()
        .flat_map(|input| {
            std::iter::repeat_n(
                AcqpRow::new(input.phase_encoding, input.readout_time),
                input.rows,
            )
        })
        .collect();
    let acqp = AcqpTable { rows };
    let row = acqp.index_of(dwi.phase_encoding).unwrap_or(1);
    debug!(?source, rows = acqp.rows.len(), index = row, "eddy acqp assembled");

    Ok(EddyInputs {
        acqp,
        index: vec![row; dwi.frames],
        mask: MaskSource::TopupCorrectedMean,
        topup: Some(TopupPlan { source, inputs }),
        topup_outputs: None,
    })
}

fn topup_inputs(dataset: &Dataset, source: TopupSource) -> Vec<TopupInput> {
    let whole = |kind: AcquisitionKind, per_frame: bool| {
        dataset
            .of_kind(kind)
            .iter()
            .map(|acquisition| TopupInput {
                kind,
                path: acquisition.path.clone(),
                frame: None,
                rows: if per_frame { acquisition.frames } else { 1 },
                phase_encoding: acquisition.phase_encoding,
                readout_time: acquisition.total_readout_time,
            })
            .collect::<Vec<_>>()
    };

    match source {
        TopupSource::SbrefOnly => whole(AcquisitionKind::Sbref, false),
        TopupSource::FmapOnly => whole(AcquisitionKind::Fmap, true),
        TopupSource::DwiFmapCombined => {
            let mut inputs: Vec<TopupInput> = dataset
                .dwi
                .iter()
                .filter_map(|dwi| {
                    dwi.first_low_b().map(|volume| TopupInput {
                        kind: AcquisitionKind::Dwi,
                        path: dwi.path.clone(),
                        frame: Some(volume),
                        rows: 1,
                        phase_encoding: dwi.phase_encoding,
                        readout_time: dwi.total_readout_time,
                    })
                })
                .collect();
            inputs.extend(whole(AcquisitionKind::Fmap, true));
            inputs
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskGeometry {
    Matching,
    Recoverable,
    Mismatched,
}

// Compares voxel sizes of the topup-derived mask against the DWI b0 mask.
// Differences within `tolerance` (relative, averaged over axes) are fixed by
// copying the DWI mask geometry.
pub fn compare_mask_geometry(
    corrected: [f64; 3],
    reference: [f64; 3],
    tolerance: f64,
) -> MaskGeometry {
    if corrected == reference {
        return MaskGeometry::Matching;
    }
    let mean_ratio = corrected
        .iter()
        .zip(reference.iter())
        .map(|(a, b)| a / b)
        .sum::<f64>()
        / 3.0;
    if (mean_ratio - 1.0).abs() < tolerance {
        MaskGeometry::Recoverable
    } else {
        MaskGeometry::Mismatched
    }
}
