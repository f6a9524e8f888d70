use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::domain::{SessionLabel, SubjectLabel};
use crate::error::PrepError;

pub const PRE_HMC_DIR: &str = "00_pre_hmc";
pub const EDDY_DIR: &str = "01_hmc";
pub const BIAS_DIR: &str = "02_n4biasfieldcorrection";
pub const DTIFIT_DIR: &str = "03_dtifit";
pub const TOPUP_BASENAME: &str = "AP_PA";
pub const EDDY_BASENAME: &str = "eddy_corrected";

#[derive(Debug, Clone)]
pub struct WorkLayout {
    subject_root: Utf8PathBuf,
    derivatives_root: Utf8PathBuf,
    subject: SubjectLabel,
    session: SessionLabel,
}

impl WorkLayout {
    pub fn new(
        work_dir: &Utf8Path,
        output_dir: &Utf8Path,
        application_name: &str,
        subject: SubjectLabel,
        session: SessionLabel,
    ) -> Self {
        let subject_root = work_dir
            .join(format!("{application_name}_wf"))
            .join(format!("{}_{}_wf", subject.entity(), session.entity()));
        Self {
            subject_root,
            derivatives_root: output_dir.join(application_name),
            subject,
            session,
        }
    }

    pub fn subject(&self) -> &SubjectLabel {
        &self.subject
    }

    pub fn session(&self) -> &SessionLabel {
        &self.session
    }

    pub fn subject_root(&self) -> &Utf8Path {
        &self.subject_root
    }

    pub fn pre_hmc_dir(&self) -> Utf8PathBuf {
        self.subject_root.join(PRE_HMC_DIR)
    }

    pub fn topup_dir(&self) -> Utf8PathBuf {
        self.pre_hmc_dir().join("topup")
    }

    pub fn copygeom_dir(&self) -> Utf8PathBuf {
        self.pre_hmc_dir().join("copygeom")
    }

    pub fn eddy_dir(&self) -> Utf8PathBuf {
        self.subject_root.join(EDDY_DIR)
    }

    pub fn bias_dir(&self) -> Utf8PathBuf {
        self.subject_root.join(BIAS_DIR)
    }

    pub fn dtifit_dir(&self) -> Utf8PathBuf {
        self.subject_root.join(DTIFIT_DIR)
    }

    pub fn merged_dwi_path(&self) -> Utf8PathBuf {
        self.pre_hmc_dir().join(format!(
            "{}_{}_dwi.nii.gz",
            self.subject.entity(),
            self.session.entity()
        ))
    }

    pub fn topup_merged_path(&self) -> Utf8PathBuf {
        self.pre_hmc_dir().join(format!("{TOPUP_BASENAME}.nii.gz"))
    }

    pub fn topup_acqp_path(&self) -> Utf8PathBuf {
        self.topup_dir().join(format!("{TOPUP_BASENAME}_acqp.txt"))
    }

    pub fn topup_base(&self) -> Utf8PathBuf {
        self.topup_dir().join(format!("{TOPUP_BASENAME}_base"))
    }

    pub fn topup_corrected_path(&self) -> Utf8PathBuf {
        self.topup_dir()
            .join(format!("{TOPUP_BASENAME}_corrected.nii.gz"))
    }

    pub fn topup_fieldcoef_path(&self) -> Utf8PathBuf {
        self.topup_dir()
            .join(format!("{TOPUP_BASENAME}_base_fieldcoef.nii.gz"))
    }

    pub fn topup_movpar_path(&self) -> Utf8PathBuf {
        self.topup_dir()
            .join(format!("{TOPUP_BASENAME}_base_movpar.txt"))
    }

    pub fn eddy_base(&self) -> Utf8PathBuf {
        self.eddy_dir().join(EDDY_BASENAME)
    }

    pub fn eddy_output(&self, suffix: &str) -> Utf8PathBuf {
        self.eddy_dir().join(format!("{EDDY_BASENAME}{suffix}"))
    }

    // dtifit appends "_<PARAM>" to its base, giving dtifit__FA.nii.gz etc.
    pub fn dtifit_base(&self) -> Utf8PathBuf {
        self.dtifit_dir().join("dtifit_")
    }

    pub fn dtifit_output(&self, parameter: &str) -> Utf8PathBuf {
        self.dtifit_dir().join(format!("dtifit__{parameter}.nii.gz"))
    }

    pub fn derivatives_root(&self) -> &Utf8Path {
        &self.derivatives_root
    }

    pub fn derivatives_dwi_dir(&self) -> Utf8PathBuf {
        self.derivatives_root
            .join(self.subject.entity())
            .join(self.session.entity())
            .join("dwi")
    }

    pub fn derivative_prefix(&self) -> String {
        format!(
            "{}_{}_space-orig_desc-",
            self.subject.entity(),
            self.session.entity()
        )
    }

    pub fn derivative_path(&self, name: &str) -> Utf8PathBuf {
        self.derivatives_dwi_dir()
            .join(format!("{}{name}", self.derivative_prefix()))
    }

    pub fn ensure_work_dirs(&self) -> Result<(), PrepError> {
        for dir in [self.pre_hmc_dir(), self.topup_dir(), self.eddy_dir()] {
            ensure_dir(&dir)?;
        }
        for dir in [self.bias_dir(), self.dtifit_dir(), self.copygeom_dir()] {
            ensure_dir(&dir)?;
        }
        Ok(())
    }
}

// sub-1_dwi.nii.gz + "_denoised" -> sub-1_dwi_denoised.nii.gz
pub fn nifti_with_suffix(path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or_default();
    let (stem, ext) = match name.strip_suffix(".nii.gz") {
        Some(stem) => (stem, ".nii.gz"),
        None => match name.strip_suffix(".nii") {
            Some(stem) => (stem, ".nii"),
            None => (name, ""),
        },
    };
    path.with_file_name(format!("{stem}{suffix}{ext}"))
}

pub fn nifti_stem(path: &Utf8Path) -> &str {
    let name = path.file_name().unwrap_or_default();
    name.strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(name)
}

pub fn ensure_dir(dir: &Utf8Path) -> Result<(), PrepError> {
    fs::create_dir_all(dir.as_std_path())
        .map_err(|err| PrepError::Filesystem(format!("create {dir}: {err}")))
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), PrepError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| PrepError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| PrepError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn write_json_atomic<T: serde::Serialize>(path: &Utf8Path, value: &T) -> Result<(), PrepError> {
    let content = serde_json::to_vec_pretty(value)
        .map_err(|err| PrepError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path, &content)
}

pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), PrepError> {
    if !source.as_std_path().is_file() {
        return Err(PrepError::MissingFile(source.to_path_buf()));
    }
    let parent = dest
        .parent()
        .ok_or_else(|| PrepError::Filesystem("invalid destination path".to_string()))?;
    ensure_dir(parent)?;
    let temp = Builder::new()
        .prefix("dmri-prep-file")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| PrepError::Filesystem(err.to_string()))?;
    fs::copy(source.as_std_path(), temp.path())
        .map_err(|err| PrepError::Filesystem(format!("copy {source}: {err}")))?;
    temp.persist(dest.as_std_path())
        .map_err(|err| PrepError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn read_text(path: &Utf8Path) -> Result<String, PrepError> {
    if !path.as_std_path().is_file() {
        return Err(PrepError::MissingFile(path.to_path_buf()));
    }
    fs::read_to_string(path.as_std_path())
        .map_err(|err| PrepError::Filesystem(format!("read {path}: {err}")))
}
