use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::MergePolicy;
use crate::domain::{AcquisitionKind, PhaseEncoding};
use crate::error::PrepError;

const MERGED_METADATA_FIELDS: [&str; 4] = ["ProtocolName", "SAR", "SeriesNumber", "WipMemBlock"];

// One discovered file as handed over by BIDS discovery: sidecar metadata plus,
// for DWI, the raw text of its .bval file.
#[derive(Debug, Clone)]
pub struct RawAcquisition {
    pub kind: AcquisitionKind,
    pub path: Utf8PathBuf,
    pub metadata: Map<String, Value>,
    pub bvals: Option<String>,
    pub frames: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BvalTable {
    pub bvals: Vec<f64>,
    pub low_b: Vec<usize>,
    pub high_b: Vec<usize>,
}

impl BvalTable {
    pub fn partition(bvals: Vec<f64>, threshold: u32) -> Self {
        let threshold = f64::from(threshold);
        let (low_b, high_b): (Vec<usize>, Vec<usize>) =
            (0..bvals.len()).partition(|&i| bvals[i] < threshold);
        Self {
            bvals,
            low_b,
            high_b,
        }
    }

    pub fn parse(text: &str, path: &str, threshold: u32) -> Result<Self, PrepError> {
        let bvals = text
            .split_whitespace()
            .map(|token| {
                token
                    .parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .ok_or_else(|| PrepError::MalformedBvals {
                        path: path.to_string(),
                        token: token.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::partition(bvals, threshold))
    }

    pub fn first_low_b(&self) -> Option<usize> {
        self.low_b.first().copied()
    }

    pub fn first_high_b(&self) -> Option<usize> {
        self.high_b.first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Acquisition {
    pub kind: AcquisitionKind,
    pub path: Utf8PathBuf,
    pub phase_encoding: PhaseEncoding,
    pub total_readout_time: f64,
    pub frames: usize,
    pub diffusion: Option<BvalTable>,
    #[serde(skip)]
    pub metadata: Map<String, Value>,
    pub sources: Vec<Utf8PathBuf>,
}

impl Acquisition {
    pub fn dwi(
        path: impl Into<Utf8PathBuf>,
        phase_encoding: PhaseEncoding,
        total_readout_time: f64,
        table: BvalTable,
    ) -> Self {
        let path = path.into();
        Self {
            kind: AcquisitionKind::Dwi,
            frames: table.bvals.len(),
            sources: vec![path.clone()],
            path,
            phase_encoding,
            total_readout_time,
            diffusion: Some(table),
            metadata: Map::new(),
        }
    }

    pub fn auxiliary(
        kind: AcquisitionKind,
        path: impl Into<Utf8PathBuf>,
        phase_encoding: PhaseEncoding,
        total_readout_time: f64,
    ) -> Self {
        let path = path.into();
        Self {
            kind,
            frames: 1,
            sources: vec![path.clone()],
            path,
            phase_encoding,
            total_readout_time,
            diffusion: None,
            metadata: Map::new(),
        }
    }

    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames.max(1);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    // Auxiliary acquisitions are filtered at overview time, so only DWI can be
    // ineligible: it needs at least one low-b volume to estimate distortion.
    pub fn is_topup_eligible(&self) -> bool {
        match &self.diffusion {
            Some(table) => !table.low_b.is_empty(),
            None => true,
        }
    }

    pub fn first_low_b(&self) -> Option<usize> {
        self.diffusion.as_ref().and_then(BvalTable::first_low_b)
    }

    pub fn partial_fourier(&self) -> Option<f64> {
        self.metadata.get("PartialFourier").and_then(Value::as_f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Dataset {
    pub dwi: Vec<Acquisition>,
    pub fmap: Vec<Acquisition>,
    pub sbref: Vec<Acquisition>,
}

impl Dataset {
    pub fn of_kind(&self, kind: AcquisitionKind) -> &[Acquisition] {
        match kind {
            AcquisitionKind::Dwi => &self.dwi,
            AcquisitionKind::Fmap => &self.fmap,
            AcquisitionKind::Sbref => &self.sbref,
        }
    }

    pub fn primary_dwi(&self) -> Result<&Acquisition, PrepError> {
        self.dwi.first().ok_or(PrepError::NoDwi)
    }

    // Merges the first DWI with every later DWI sharing its phase encoding.
    // Returns a new dataset; DWI with other encodings keep their position.
    pub fn merge_dwi(
        &self,
        merged_path: &Utf8Path,
        threshold: u32,
        policy: MergePolicy,
    ) -> Result<Dataset, PrepError> {
        let Some(first) = self.dwi.first() else {
            return Err(PrepError::NoDwi);
        };
        let (group, rest): (Vec<&Acquisition>, Vec<&Acquisition>) = self
            .dwi
            .iter()
            .partition(|dwi| dwi.phase_encoding == first.phase_encoding);

        if group.len() < 2 {
            return Ok(self.clone());
        }

        let first_table = first.diffusion.as_ref();
        let mut bvals = Vec::new();
        let mut metadata = first.metadata.clone();
        let mut sources = Vec::new();
        for (i, dwi) in group.iter().enumerate() {
            let table = dwi.diffusion.as_ref();
            if policy == MergePolicy::Strict && table != first_table {
                return Err(PrepError::DwiMergeMismatch {
                    first: first.path.to_string(),
                    other: dwi.path.to_string(),
                });
            }
            if let Some(table) = table {
                bvals.extend_from_slice(&table.bvals);
            }
            if i > 0 {
                join_metadata(&mut metadata, &dwi.metadata);
            }
            sources.extend(dwi.sources.iter().cloned());
        }

        info!(
            runs = group.len(),
            phase_encoding = %first.phase_encoding,
            "merging dwi runs"
        );

        let merged = Acquisition {
            kind: AcquisitionKind::Dwi,
            path: merged_path.to_path_buf(),
            phase_encoding: first.phase_encoding,
            total_readout_time: first.total_readout_time,
            frames: bvals.len(),
            diffusion: Some(BvalTable::partition(bvals, threshold)),
            metadata,
            sources,
        };

        let mut dwi = Vec::with_capacity(rest.len() + 1);
        dwi.push(merged);
        dwi.extend(rest.into_iter().cloned());
        Ok(Dataset {
            dwi,
            fmap: self.fmap.clone(),
            sbref: self.sbref.clone(),
        })
    }

    // Same dataset with the primary DWI pointing at a processed copy.
    pub fn with_primary_path(&self, path: &Utf8Path) -> Dataset {
        let mut next = self.clone();
        if let Some(first) = next.dwi.first_mut() {
            first.path = path.to_path_buf();
        }
        next
    }

    pub fn merge_candidates(&self) -> Vec<&Acquisition> {
        match self.dwi.first() {
            Some(first) => self
                .dwi
                .iter()
                .filter(|dwi| dwi.phase_encoding == first.phase_encoding)
                .collect(),
            None => Vec::new(),
        }
    }
}

fn join_metadata(target: &mut Map<String, Value>, other: &Map<String, Value>) {
    for field in MERGED_METADATA_FIELDS {
        let left = target.get(field).map(value_text).unwrap_or_default();
        let right = other.get(field).map(value_text).unwrap_or_default();
        target.insert(field.to_string(), Value::String(format!("{left},{right}")));
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn merge_bval_text(tables: &[String]) -> String {
    let joined = tables
        .iter()
        .map(|table| table.trim())
        .collect::<Vec<_>>()
        .join(" ");
    format!("{joined}\n")
}

// bvec files are 3 rows by N columns; runs are concatenated column-wise.
pub fn merge_bvec_text(tables: &[(String, String)]) -> Result<String, PrepError> {
    let mut rows: [Vec<String>; 3] = Default::default();
    for (path, text) in tables {
        let parsed: Vec<Vec<&str>> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.split_whitespace().collect())
            .collect();
        if parsed.len() != 3 {
            return Err(PrepError::BvecShape {
                path: path.clone(),
                message: format!("expected 3 rows, found {}", parsed.len()),
            });
        }
        if parsed.iter().any(|row| row.len() != parsed[0].len()) {
            return Err(PrepError::BvecShape {
                path: path.clone(),
                message: "rows have different lengths".to_string(),
            });
        }
        for (target, row) in rows.iter_mut().zip(parsed) {
            target.extend(row.into_iter().map(str::to_string));
        }
    }
    Ok(rows
        .iter()
        .map(|row| format!("{}\n", row.join(" ")))
        .collect())
}

pub fn build_overview(raw: Vec<RawAcquisition>, threshold: u32) -> Result<Dataset, PrepError> {
    let mut dataset = Dataset::default();
    let (dwi_raw, aux_raw): (Vec<_>, Vec<_>) = raw
        .into_iter()
        .partition(|item| item.kind == AcquisitionKind::Dwi);

    for item in dwi_raw {
        let table = BvalTable::parse(
            item.bvals.as_deref().ok_or_else(|| {
                PrepError::MissingFile(item.path.with_extension("").with_extension("bval"))
            })?,
            item.path.as_str(),
            threshold,
        )?;
        let phase_encoding = phase_encoding_of(&item)?;
        let readout = readout_time_of(&item)?;
        debug!(
            path = %item.path,
            volumes = table.bvals.len(),
            low_b = table.low_b.len(),
            "dwi acquisition"
        );
        dataset.dwi.push(
            Acquisition::dwi(item.path.clone(), phase_encoding, readout, table)
                .with_metadata(item.metadata),
        );
    }

    let dwi_stems: Vec<String> = dataset
        .dwi
        .iter()
        .filter_map(|dwi| bids_stem(&dwi.path, AcquisitionKind::Dwi))
        .collect();

    for item in aux_raw {
        if !is_intended_for_dwi(&item, &dwi_stems) {
            debug!(path = %item.path, kind = %item.kind, "not intended for dwi, skipping");
            continue;
        }
        let phase_encoding = phase_encoding_of(&item)?;
        let readout = readout_time_of(&item)?;
        let acquisition =
            Acquisition::auxiliary(item.kind, item.path.clone(), phase_encoding, readout)
                .with_frames(item.frames.unwrap_or(1))
                .with_metadata(item.metadata);
        if item.kind == AcquisitionKind::Fmap {
            dataset.fmap.push(acquisition);
        } else {
            dataset.sbref.push(acquisition);
        }
    }

    info!(
        dwi = dataset.dwi.len(),
        fmap = dataset.fmap.len(),
        sbref = dataset.sbref.len(),
        "dataset overview built"
    );
    Ok(dataset)
}

fn phase_encoding_of(item: &RawAcquisition) -> Result<PhaseEncoding, PrepError> {
    item.metadata
        .get("PhaseEncodingDirection")
        .and_then(Value::as_str)
        .ok_or_else(|| PrepError::MissingMetadata {
            path: item.path.to_string(),
            field: "PhaseEncodingDirection",
        })?
        .parse()
}

fn readout_time_of(item: &RawAcquisition) -> Result<f64, PrepError> {
    item.metadata
        .get("TotalReadoutTime")
        .and_then(Value::as_f64)
        .ok_or_else(|| PrepError::MissingMetadata {
            path: item.path.to_string(),
            field: "TotalReadoutTime",
        })
}

// IntendedFor decides when present; otherwise fall back to a DWI sharing the
// same BIDS stem.
fn is_intended_for_dwi(item: &RawAcquisition, dwi_stems: &[String]) -> bool {
    match item.metadata.get("IntendedFor") {
        Some(Value::String(target)) => target.contains("dwi"),
        Some(Value::Array(targets)) => targets
            .iter()
            .filter_map(Value::as_str)
            .any(|target| target.contains("dwi")),
        _ => bids_stem(&item.path, item.kind)
            .map(|stem| dwi_stems.contains(&stem))
            .unwrap_or(false),
    }
}

pub fn bids_stem(path: &Utf8Path, kind: AcquisitionKind) -> Option<String> {
    let name = path.file_name()?;
    let base = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))?;
    base.strip_suffix(&format!("_{}", kind.bids_suffix()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bvals_partition_around_threshold() {
        let table = BvalTable::parse("0 1000 5 1000 100\n", "run.bval", 100).unwrap();
        assert_eq!(table.low_b, vec![0, 2]);
        assert_eq!(table.high_b, vec![1, 3, 4]);
    }

    #[test]
    fn stem_strips_suffix_and_extension() {
        let stem = bids_stem(
            Utf8Path::new("/bids/sub-1/ses-1/dwi/sub-1_ses-1_run-01_sbref.nii.gz"),
            AcquisitionKind::Sbref,
        );
        assert_eq!(stem.as_deref(), Some("sub-1_ses-1_run-01"));
    }
}
