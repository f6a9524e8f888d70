use std::fs;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::{AcquisitionKind, SessionLabel, SubjectLabel};
use crate::error::PrepError;
use crate::nifti;
use crate::overview::RawAcquisition;

static BIDS_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^sub-(?P<sub>[A-Za-z0-9]+)_ses-(?P<ses>[A-Za-z0-9]+)(?:_[A-Za-z]+-[A-Za-z0-9]+)*_(?P<suffix>dwi|epi|sbref)\.nii(?:\.gz)?$",
    )
    .expect("static regex")
});

#[derive(Debug, Clone)]
pub struct BidsLayout {
    root: Utf8PathBuf,
}

impl BidsLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn session_dir(&self, subject: &SubjectLabel, session: &SessionLabel) -> Utf8PathBuf {
        self.root.join(subject.entity()).join(session.entity())
    }

    pub fn relative<'a>(&self, path: &'a Utf8Path) -> &'a Utf8Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    pub fn discover(
        &self,
        subject: &SubjectLabel,
        session: &SessionLabel,
    ) -> Result<Vec<RawAcquisition>, PrepError> {
        let session_dir = self.session_dir(subject, session);
        if !session_dir.as_std_path().is_dir() {
            return Err(PrepError::InputNotFound(session_dir));
        }

        let mut found = Vec::new();
        let searches = [
            ("dwi", AcquisitionKind::Dwi),
            ("fmap", AcquisitionKind::Fmap),
            ("dwi", AcquisitionKind::Sbref),
            ("fmap", AcquisitionKind::Sbref),
        ];
        for (datatype, kind) in searches {
            for path in images(&session_dir.join(datatype), subject, session, kind)? {
                found.push(self.load(path, kind)?);
            }
        }
        debug!(session = %session_dir, files = found.len(), "bids discovery finished");
        Ok(found)
    }

    fn load(&self, path: Utf8PathBuf, kind: AcquisitionKind) -> Result<RawAcquisition, PrepError> {
        let metadata = read_sidecar(&companion(&path, "json"))?;
        let (bvals, frames) = match kind {
            AcquisitionKind::Dwi => {
                ensure_exists(&companion(&path, "bvec"))?;
                let bval_path = companion(&path, "bval");
                ensure_exists(&bval_path)?;
                let text = fs::read_to_string(bval_path.as_std_path())
                    .map_err(|err| PrepError::Filesystem(format!("read {bval_path}: {err}")))?;
                (Some(text), None)
            }
            AcquisitionKind::Fmap => (None, Some(nifti::read_header(&path)?.frames())),
            AcquisitionKind::Sbref => (None, Some(1)),
        };
        Ok(RawAcquisition {
            kind,
            path,
            metadata,
            bvals,
            frames,
        })
    }
}

fn images(
    dir: &Utf8Path,
    subject: &SubjectLabel,
    session: &SessionLabel,
    kind: AcquisitionKind,
) -> Result<Vec<Utf8PathBuf>, PrepError> {
    if !dir.as_std_path().is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| PrepError::Filesystem(format!("read {dir}: {err}")))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| PrepError::Filesystem(err.to_string()))?;
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        let Some(name) = path.file_name() else {
            continue;
        };
        let Some(caps) = BIDS_IMAGE.captures(name) else {
            continue;
        };
        if &caps["sub"] == subject.as_str()
            && &caps["ses"] == session.as_str()
            && &caps["suffix"] == kind.bids_suffix()
        {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

// Sibling file with the NIfTI extension (.nii or .nii.gz) replaced.
pub fn companion(image: &Utf8Path, extension: &str) -> Utf8PathBuf {
    let name = image.file_name().unwrap_or_default();
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(name);
    image.with_file_name(format!("{stem}.{extension}"))
}

fn ensure_exists(path: &Utf8Path) -> Result<(), PrepError> {
    if path.as_std_path().is_file() {
        Ok(())
    } else {
        Err(PrepError::MissingFile(path.to_path_buf()))
    }
}

fn read_sidecar(path: &Utf8Path) -> Result<Map<String, Value>, PrepError> {
    ensure_exists(path)?;
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| PrepError::Filesystem(format!("read {path}: {err}")))?;
    match serde_json::from_str(&content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(PrepError::Filesystem(format!(
            "{path}: sidecar is not a JSON object"
        ))),
        Err(err) => Err(PrepError::Filesystem(format!("{path}: {err}"))),
    }
}
