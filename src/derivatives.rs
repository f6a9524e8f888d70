use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::eddy::{EddyInputs, MaskGeometry, TopupSource};
use crate::error::PrepError;
use crate::layout::{
    WorkLayout, copy_file_atomic, ensure_dir, read_text, write_bytes_atomic, write_json_atomic,
};
use crate::tools::ToolVersions;
use crate::topup::TopupDecision;

pub const BIDS_VERSION: &str = "1.4.0";

pub const CONFOUND_COLUMNS: [&str; 11] = [
    "eddy_movement_rms_relative_to_first",
    "eddy_movement_rms_relative_to_previous",
    "eddy_restricted_movement_rms_relative_to_first",
    "eddy_restricted_movement_rms_relative_to_previous",
    "trans_x",
    "trans_y",
    "trans_z",
    "rot_x",
    "rot_y",
    "rot_z",
    "bval",
];

// Work-directory files that end up in the derivatives tree.
#[derive(Debug, Clone)]
pub struct DerivativeInputs {
    pub dwi: Utf8PathBuf,
    pub bval: Utf8PathBuf,
    pub rotated_bvec: Utf8PathBuf,
    pub cnr: Utf8PathBuf,
    pub mask: Utf8PathBuf,
    pub movement_rms: Utf8PathBuf,
    pub restricted_movement_rms: Utf8PathBuf,
    pub parameters: Utf8PathBuf,
    pub dtifit_dir: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SdcRecord {
    pub decision: TopupDecision,
    pub source: Option<TopupSource>,
    pub acqp: Vec<String>,
    pub index: Option<usize>,
    pub mask_geometry: Option<MaskGeometry>,
}

impl SdcRecord {
    pub fn new(
        decision: &TopupDecision,
        eddy: &EddyInputs,
        mask_geometry: Option<MaskGeometry>,
    ) -> Self {
        Self {
            decision: decision.clone(),
            source: eddy.topup.as_ref().map(|plan| plan.source),
            acqp: eddy.acqp.rows.iter().map(ToString::to_string).collect(),
            index: eddy.index.first().copied(),
            mask_geometry,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Provenance {
    pub application_name: String,
    pub raw_sources: Vec<String>,
    pub versions: ToolVersions,
    pub denoise_window: u32,
    pub sdc: SdcRecord,
}

pub fn export(
    layout: &WorkLayout,
    inputs: &DerivativeInputs,
    provenance: &Provenance,
) -> Result<Vec<Utf8PathBuf>, PrepError> {
    let dwi_dir = layout.derivatives_dwi_dir();
    ensure_dir(&dwi_dir)?;
    write_dataset_description(layout.derivatives_root(), &provenance.application_name)?;

    let mut written = Vec::new();
    let copies = [
        (&inputs.dwi, "preproc_dwi.nii.gz"),
        (&inputs.bval, "preproc_dwi.bval"),
        (&inputs.rotated_bvec, "preproc_dwi.bvec"),
        (&inputs.cnr, "preproc_cnr.nii.gz"),
        (&inputs.mask, "preproc_mask.nii.gz"),
    ];
    for (source, name) in copies {
        let dest = layout.derivative_path(name);
        copy_file_atomic(source, &dest)?;
        written.push(dest);
    }

    for (parameter, source) in dtifit_outputs(&inputs.dtifit_dir)? {
        let dest = layout.derivative_path(&format!(
            "preproc_model-DTI_parameter-{parameter}_diffmodel.nii.gz"
        ));
        copy_file_atomic(&source, &dest)?;
        written.push(dest);
    }

    let confounds = build_confounds(&ConfoundTables {
        movement_rms: &read_text(&inputs.movement_rms)?,
        restricted_movement_rms: &read_text(&inputs.restricted_movement_rms)?,
        parameters: &read_text(&inputs.parameters)?,
        bvals: &read_text(&inputs.bval)?,
    })?;
    let confounds_path = layout.derivative_path("confounds.tsv");
    write_bytes_atomic(&confounds_path, confounds.as_bytes())?;
    written.push(confounds_path);

    for (name, sidecar) in sidecars(provenance) {
        let dest = layout.derivative_path(name);
        write_json_atomic(&dest, &sidecar)?;
        written.push(dest);
    }
    let sdc_path = layout.derivative_path("preproc_sdc.json");
    write_json_atomic(&sdc_path, &provenance.sdc)?;
    written.push(sdc_path);

    info!(files = written.len(), dir = %dwi_dir, "derivatives written");
    Ok(written)
}

// Existing descriptions are left untouched so reruns keep the first one.
pub fn write_dataset_description(
    root: &Utf8Path,
    application_name: &str,
) -> Result<bool, PrepError> {
    let path = root.join("dataset_description.json");
    if path.as_std_path().exists() {
        debug!(path = %path, "dataset description already present");
        return Ok(false);
    }
    let description = json!({
        "Name": format!("{application_name} outputs"),
        "BIDSVersion": BIDS_VERSION,
        "DatasetType": "derivative",
        "PipelineDescription": {
            "Name": application_name,
            "Version": env!("CARGO_PKG_VERSION"),
        },
    });
    write_json_atomic(&path, &description)?;
    Ok(true)
}

fn sidecars(provenance: &Provenance) -> [(&'static str, Value); 3] {
    let versions = &provenance.versions;
    let denoising = match provenance.denoise_window {
        0 => Value::Null,
        window => Value::String(format!("mrtrix3 dwidenoise, filter: {window}")),
    };
    [
        (
            "preproc_mask.json",
            json!({
                "RawSources": provenance.raw_sources,
                "Type": "Brain",
                "SpatialReference": "orig",
            }),
        ),
        (
            "preproc_dwi.json",
            json!({
                "RawSources": provenance.raw_sources,
                "SpatialReference": "orig",
                "SkullStripped": false,
                "Denoising": denoising,
                "MotionCorrection": true,
                "EddyCurrentCorrection": true,
                "HMC model": "fsl eddy",
                "BiasFieldCorrection": "ants N4BiasFieldCorrection",
                "fsl version": versions.fsl,
                "mrtrix3 version": versions.mrtrix3,
                "ants version": versions.ants,
            }),
        ),
        (
            "preproc_model-DTI_diffmodel.json",
            json!({
                "Parameters": { "FitMethod": "OLS" },
                "command": "dtifit",
                "fsl version": versions.fsl,
            }),
        ),
    ]
}

// dtifit__FA.nii.gz -> ("FA", path), sorted by parameter.
fn dtifit_outputs(dir: &Utf8Path) -> Result<Vec<(String, Utf8PathBuf)>, PrepError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| PrepError::Filesystem(format!("read {dir}: {err}")))?;
    let mut outputs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| PrepError::Filesystem(err.to_string()))?;
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        let parameter = path
            .file_name()
            .and_then(|name| name.strip_prefix("dtifit__"))
            .and_then(|name| name.strip_suffix(".nii.gz"));
        if let Some(parameter) = parameter {
            outputs.push((parameter.to_string(), path.clone()));
        }
    }
    outputs.sort();
    Ok(outputs)
}

#[derive(Debug, Clone, Copy)]
pub struct ConfoundTables<'a> {
    pub movement_rms: &'a str,
    pub restricted_movement_rms: &'a str,
    pub parameters: &'a str,
    pub bvals: &'a str,
}

// One row per volume: both rms tables (2 columns each), the first six eddy
// parameters (translations then rotations) and the b-value.
pub fn build_confounds(tables: &ConfoundTables<'_>) -> Result<String, PrepError> {
    let movement = columns(tables.movement_rms, "eddy_movement_rms", 2)?;
    let restricted = columns(tables.restricted_movement_rms, "eddy_restricted_movement_rms", 2)?;
    let parameters = columns(tables.parameters, "eddy_parameters", 6)?;
    let bvals: Vec<&str> = tables.bvals.split_whitespace().collect();

    let volumes = movement.len();
    for (name, len) in [
        ("eddy_restricted_movement_rms", restricted.len()),
        ("eddy_parameters", parameters.len()),
        ("bval", bvals.len()),
    ] {
        if len != volumes {
            return Err(PrepError::EddyOutput {
                path: name.to_string(),
                message: format!("{len} rows, expected {volumes}"),
            });
        }
    }

    let mut tsv = CONFOUND_COLUMNS.join("\t");
    tsv.push('\n');
    for i in 0..volumes {
        let row: Vec<&str> = movement[i]
            .iter()
            .chain(&restricted[i])
            .chain(&parameters[i])
            .copied()
            .chain(std::iter::once(bvals[i]))
            .collect();
        tsv.push_str(&row.join("\t"));
        tsv.push('\n');
    }
    Ok(tsv)
}

fn columns<'a>(text: &'a str, name: &str, width: usize) -> Result<Vec<Vec<&'a str>>, PrepError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < width {
                return Err(PrepError::EddyOutput {
                    path: name.to_string(),
                    message: format!(
                        "row {} has {} columns, expected {width}",
                        i + 1,
                        tokens.len()
                    ),
                });
            }
            Ok(tokens[..width].to_vec())
        })
        .collect()
}
