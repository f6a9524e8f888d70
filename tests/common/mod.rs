#![allow(dead_code)]

use std::cell::RefCell;
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use tempfile::TempDir;

use dmri_preprocessing::domain::{AcquisitionKind, PhaseEncoding};
use dmri_preprocessing::error::PrepError;
use dmri_preprocessing::layout::nifti_with_suffix;
use dmri_preprocessing::overview::{Acquisition, BvalTable, Dataset};
use dmri_preprocessing::tools::{Invocation, ToolRunner, ToolSuite};

pub const SUBJECT: &str = "01";
pub const SESSION: &str = "01";
pub const READOUT: f64 = 0.05;
pub const VOXEL: [f64; 3] = [2.0, 2.0, 2.0];

pub fn nifti_header(dims: &[usize], voxel: [f64; 3]) -> Vec<u8> {
    let mut bytes = vec![0u8; 352];
    bytes[0..4].copy_from_slice(&348i32.to_le_bytes());
    bytes[40..42].copy_from_slice(&(dims.len() as i16).to_le_bytes());
    for (i, dim) in dims.iter().enumerate() {
        let offset = 42 + 2 * i;
        bytes[offset..offset + 2].copy_from_slice(&(*dim as i16).to_le_bytes());
    }
    for (i, size) in voxel.iter().enumerate() {
        let offset = 80 + 4 * i;
        bytes[offset..offset + 4].copy_from_slice(&(*size as f32).to_le_bytes());
    }
    // float32 data right after the header
    bytes[70..72].copy_from_slice(&16i16.to_le_bytes());
    bytes[72..74].copy_from_slice(&32i16.to_le_bytes());
    bytes[108..112].copy_from_slice(&352f32.to_le_bytes());
    bytes[344..348].copy_from_slice(b"n+1\0");
    bytes
}

pub fn write_nifti(path: &Utf8Path, dims: &[usize], voxel: [f64; 3]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let header = nifti_header(dims, voxel);
    if path.as_str().ends_with(".gz") {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&header).unwrap();
        fs::write(path, encoder.finish().unwrap()).unwrap();
    } else {
        fs::write(path, header).unwrap();
    }
}

pub fn dwi(path: &str, pe: &str, bvals: &[f64]) -> Acquisition {
    Acquisition::dwi(
        path,
        pe.parse().unwrap(),
        READOUT,
        BvalTable::partition(bvals.to_vec(), 100),
    )
}

pub fn aux(kind: AcquisitionKind, path: &str, pe: &str) -> Acquisition {
    Acquisition::auxiliary(kind, path, pe.parse().unwrap(), READOUT)
}

pub fn pe(label: &str) -> PhaseEncoding {
    label.parse().unwrap()
}

pub fn dataset(dwi: Vec<Acquisition>, fmap: Vec<Acquisition>, sbref: Vec<Acquisition>) -> Dataset {
    Dataset { dwi, fmap, sbref }
}

// BIDS session tree under a temp dir, written file by file.
pub struct BidsSession {
    _root: TempDir,
    root: Utf8PathBuf,
}

impl BidsSession {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(root.path().to_path_buf()).unwrap();
        fs::create_dir_all(path.join(format!("sub-{SUBJECT}/ses-{SESSION}"))).unwrap();
        Self { _root: root, root: path }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn session_dir(&self) -> Utf8PathBuf {
        self.root.join(format!("sub-{SUBJECT}/ses-{SESSION}"))
    }

    fn image(&self, datatype: &str, entities: &str, suffix: &str) -> Utf8PathBuf {
        let prefix = format!("sub-{SUBJECT}_ses-{SESSION}");
        let name = if entities.is_empty() {
            format!("{prefix}_{suffix}.nii.gz")
        } else {
            format!("{prefix}_{entities}_{suffix}.nii.gz")
        };
        self.session_dir().join(datatype).join(name)
    }

    pub fn add_dwi(&self, entities: &str, pe: &str, bvals: &str) -> Utf8PathBuf {
        self.add_dwi_with(entities, pe, bvals, json!({}))
    }

    pub fn add_dwi_with(&self, entities: &str, pe: &str, bvals: &str, extra: Value) -> Utf8PathBuf {
        let path = self.image("dwi", entities, "dwi");
        let volumes = bvals.split_whitespace().count();
        write_nifti(&path, &[2, 2, 2, volumes], VOXEL);
        write_sidecar(&path, pe, extra);
        fs::write(sibling(&path, "bval"), format!("{bvals}\n")).unwrap();
        let row = vec!["0"; volumes].join(" ");
        fs::write(sibling(&path, "bvec"), format!("{row}\n{row}\n{row}\n")).unwrap();
        path
    }

    pub fn add_fmap(&self, entities: &str, pe: &str, frames: usize, extra: Value) -> Utf8PathBuf {
        let path = self.image("fmap", entities, "epi");
        write_nifti(&path, &[2, 2, 2, frames], VOXEL);
        write_sidecar(&path, pe, extra);
        path
    }

    pub fn add_sbref(&self, datatype: &str, entities: &str, pe: &str, extra: Value) -> Utf8PathBuf {
        let path = self.image(datatype, entities, "sbref");
        write_nifti(&path, &[2, 2, 2], VOXEL);
        write_sidecar(&path, pe, extra);
        path
    }
}

pub fn sibling(image: &Utf8Path, extension: &str) -> Utf8PathBuf {
    let name = image.file_name().unwrap();
    let stem = name.strip_suffix(".nii.gz").unwrap_or(name);
    image.with_file_name(format!("{stem}.{extension}"))
}

fn write_sidecar(image: &Utf8Path, pe: &str, extra: Value) {
    let mut sidecar = json!({
        "PhaseEncodingDirection": pe,
        "TotalReadoutTime": READOUT,
    });
    if let (Some(target), Value::Object(extra)) = (sidecar.as_object_mut(), extra) {
        target.extend(extra);
    }
    fs::write(sibling(image, "json"), serde_json::to_string_pretty(&sidecar).unwrap()).unwrap();
}

// Records every invocation and writes what each tool would produce so
// later stages find their inputs.
pub struct MockRunner {
    pub calls: RefCell<Vec<Invocation>>,
    pub topup_voxel: [f64; 3],
    pub fail_on: Option<&'static str>,
    pub omit: Option<&'static str>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            topup_voxel: VOXEL,
            fail_on: None,
            omit: None,
        }
    }

    pub fn with_topup_voxel(mut self, voxel: [f64; 3]) -> Self {
        self.topup_voxel = voxel;
        self
    }

    pub fn failing_on(mut self, program: &'static str) -> Self {
        self.fail_on = Some(program);
        self
    }

    // Leaves out any output whose path ends with `suffix`.
    pub fn omitting(mut self, suffix: &'static str) -> Self {
        self.omit = Some(suffix);
        self
    }

    fn skipped(&self, path: &str) -> bool {
        self.omit.is_some_and(|suffix| path.ends_with(suffix))
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|call| call.program.clone())
            .collect()
    }

    pub fn find(&self, program: &str) -> Vec<Invocation> {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.program == program)
            .cloned()
            .collect()
    }

    fn produce(&self, invocation: &Invocation) {
        let args = &invocation.args;
        let path = |arg: &str| Utf8PathBuf::from(arg);
        match invocation.program.as_str() {
            "fslroi" => write_nifti(&path(&args[1]), &[2, 2, 2, 1], VOXEL),
            "fslmerge" | "dwidenoise" | "mrdegibbs" => {
                write_nifti(&path(&args[1]), &[2, 2, 2, 1], VOXEL)
            }
            "fslmaths" => {
                let output = path(args.last().unwrap());
                write_nifti(&output, &[2, 2, 2, 1], VOXEL);
            }
            "bet" => {
                let brain = path(&args[1]);
                let voxel = if args[0].contains("AP_PA") {
                    self.topup_voxel
                } else {
                    VOXEL
                };
                write_nifti(&brain, &[2, 2, 2], voxel);
                write_nifti(&nifti_with_suffix(&brain, "_mask"), &[2, 2, 2], voxel);
            }
            "topup" => {
                let iout = flag_value(args, "iout").unwrap();
                write_nifti(&path(&iout), &[2, 2, 2, 2], self.topup_voxel);
                let base = flag_value(args, "out").unwrap();
                let fieldcoef = format!("{base}_fieldcoef.nii.gz");
                if !self.skipped(&fieldcoef) {
                    write_nifti(&path(&fieldcoef), &[2, 2, 2], self.topup_voxel);
                }
                let movpar = format!("{base}_movpar.txt");
                if !self.skipped(&movpar) {
                    write_text(&movpar, &"0 0 0 0 0 0\n".repeat(2));
                }
            }
            "eddy" => {
                let base = flag_value(args, "out").unwrap();
                let bvals = fs::read_to_string(flag_value(args, "bvals").unwrap()).unwrap();
                let volumes = bvals.split_whitespace().count();
                write_nifti(&path(&format!("{base}.nii.gz")), &[2, 2, 2, volumes], VOXEL);
                write_nifti(
                    &path(&format!("{base}.eddy_cnr_maps.nii.gz")),
                    &[2, 2, 2, 2],
                    VOXEL,
                );
                let row = vec!["0"; volumes].join(" ");
                let bvecs = format!("{row}\n{row}\n{row}\n");
                write_text(&format!("{base}.eddy_rotated_bvecs"), &bvecs);
                let rms = "0.1 0.2\n".repeat(volumes);
                write_text(&format!("{base}.eddy_movement_rms"), &rms);
                write_text(&format!("{base}.eddy_restricted_movement_rms"), &rms);
                let parameters = "1 2 3 4 5 6 0 0 0 0 0 0 0 0 0 0\n".repeat(volumes);
                write_text(&format!("{base}.eddy_parameters"), &parameters);
            }
            "N4BiasFieldCorrection" => {
                let position = args.iter().position(|arg| arg == "-o").unwrap();
                let outputs = args[position + 1].trim_matches(|ch| ch == '[' || ch == ']');
                for output in outputs.split(',') {
                    write_nifti(&path(output), &[2, 2, 2], VOXEL);
                }
            }
            "dtifit" => {
                let position = args.iter().position(|arg| arg == "-o").unwrap();
                let base = &args[position + 1];
                for parameter in ["FA", "MD", "L1", "L2", "L3", "V1"] {
                    write_nifti(&path(&format!("{base}_{parameter}.nii.gz")), &[2, 2, 2], VOXEL);
                }
            }
            _ => {}
        }
    }
}

impl ToolRunner for MockRunner {
    fn run(&self, invocation: &Invocation) -> Result<(), PrepError> {
        self.calls.borrow_mut().push(invocation.clone());
        if self.fail_on == Some(invocation.program.as_str()) {
            return Err(PrepError::ToolFailed {
                tool: invocation.program.clone(),
                message: "exited with status 1".to_string(),
            });
        }
        self.produce(invocation);
        Ok(())
    }

    fn version(&self, suite: ToolSuite) -> Option<String> {
        match suite {
            ToolSuite::Fsl => Some("6.0.7".to_string()),
            ToolSuite::Mrtrix3 => Some("3.0.4".to_string()),
            ToolSuite::Ants => None,
        }
    }
}

pub fn flag_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("--{name}=");
    args.iter()
        .find_map(|arg| arg.strip_prefix(&prefix))
        .map(str::to_string)
}

fn write_text(path: &str, content: &str) {
    fs::write(path, content).unwrap();
}
