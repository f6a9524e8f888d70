mod common;

use std::fs;

use assert_matches::assert_matches;
use serde_json::json;

use common::{BidsSession, SESSION, SUBJECT, VOXEL, nifti_header, sibling, write_nifti};
use dmri_preprocessing::bids::{BidsLayout, companion};
use dmri_preprocessing::domain::{AcquisitionKind, SessionLabel, SubjectLabel};
use dmri_preprocessing::error::PrepError;
use dmri_preprocessing::nifti;

fn labels() -> (SubjectLabel, SessionLabel) {
    (SUBJECT.parse().unwrap(), SESSION.parse().unwrap())
}

#[test]
fn discovers_every_kind_in_order() {
    let bids = BidsSession::new();
    bids.add_dwi("dir-AP_run-02", "j-", "0 1000");
    bids.add_dwi("dir-AP_run-01", "j-", "0 1000 1000");
    bids.add_fmap("dir-PA", "j", 3, json!({}));
    bids.add_sbref("dwi", "dir-AP_run-01", "j-", json!({}));
    bids.add_sbref("fmap", "dir-PA", "j", json!({}));
    let (subject, session) = labels();

    let found = BidsLayout::new(bids.root()).discover(&subject, &session).unwrap();

    let kinds: Vec<AcquisitionKind> = found.iter().map(|raw| raw.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AcquisitionKind::Dwi,
            AcquisitionKind::Dwi,
            AcquisitionKind::Fmap,
            AcquisitionKind::Sbref,
            AcquisitionKind::Sbref,
        ]
    );
    assert!(found[0].path.as_str().ends_with("run-01_dwi.nii.gz"));
    assert_eq!(found[0].bvals.as_deref(), Some("0 1000 1000\n"));
    assert_eq!(found[2].frames, Some(3));
    assert_eq!(found[3].frames, Some(1));
    assert_eq!(found[2].metadata["PhaseEncodingDirection"], "j");
}

#[test]
fn ignores_other_subjects_and_stray_files() {
    let bids = BidsSession::new();
    bids.add_dwi("", "j-", "0 1000");
    let dwi_dir = bids.session_dir().join("dwi");
    write_nifti(&dwi_dir.join("sub-02_ses-01_dwi.nii.gz"), &[2, 2, 2, 1], VOXEL);
    fs::write(dwi_dir.join("notes.txt"), "scanner log").unwrap();
    let (subject, session) = labels();

    let found = BidsLayout::new(bids.root()).discover(&subject, &session).unwrap();
    assert_eq!(found.len(), 1);
}

#[test]
fn dwi_without_bvec_is_missing_file() {
    let bids = BidsSession::new();
    let dwi = bids.add_dwi("", "j-", "0 1000");
    fs::remove_file(sibling(&dwi, "bvec")).unwrap();
    let (subject, session) = labels();

    let err = BidsLayout::new(bids.root()).discover(&subject, &session).unwrap_err();
    assert_matches!(err, PrepError::MissingFile(path) if path.as_str().ends_with("_dwi.bvec"));
}

#[test]
fn image_without_sidecar_is_missing_file() {
    let bids = BidsSession::new();
    let fmap = bids.add_fmap("dir-PA", "j", 1, json!({}));
    fs::remove_file(sibling(&fmap, "json")).unwrap();
    let (subject, session) = labels();

    let err = BidsLayout::new(bids.root()).discover(&subject, &session).unwrap_err();
    assert_matches!(err, PrepError::MissingFile(_));
}

#[test]
fn missing_session_directory() {
    let bids = BidsSession::new();
    let subject: SubjectLabel = "99".parse().unwrap();
    let (_, session) = labels();
    let err = BidsLayout::new(bids.root()).discover(&subject, &session).unwrap_err();
    assert_matches!(err, PrepError::InputNotFound(_));
}

#[test]
fn companion_swaps_nifti_extension() {
    let bids = BidsSession::new();
    let dwi = bids.add_dwi("", "j-", "0");
    assert_eq!(companion(&dwi, "bval"), sibling(&dwi, "bval"));
    assert!(companion(&dwi, "json").as_std_path().is_file());
}

#[test]
fn header_reader_handles_plain_and_gzip() {
    let bids = BidsSession::new();
    let plain = bids.session_dir().join("anat/plain.nii");
    write_nifti(&plain, &[4, 4, 3, 7], [1.5, 1.5, 3.0]);
    let header = nifti::read_header(&plain).unwrap();
    assert_eq!(header.dims, vec![4, 4, 3, 7]);
    assert_eq!(header.frames(), 7);
    assert_eq!(header.voxel_size, [1.5, 1.5, 3.0]);

    let gz = bids.session_dir().join("anat/packed.nii.gz");
    write_nifti(&gz, &[4, 4, 3], VOXEL);
    assert_eq!(nifti::read_header(&gz).unwrap().frames(), 1);
}

#[test]
fn unreadable_header_is_a_nifti_error() {
    let bids = BidsSession::new();
    let anat = bids.session_dir().join("anat");
    fs::create_dir_all(&anat).unwrap();

    let mut bytes = nifti_header(&[2, 2, 2], VOXEL);
    bytes[0..4].copy_from_slice(&12i32.to_le_bytes());
    let garbage = anat.join("garbage.nii");
    fs::write(&garbage, &bytes).unwrap();
    let err = nifti::read_header(&garbage).unwrap_err();
    assert_matches!(err, PrepError::Nifti { path, .. } if path.ends_with("garbage.nii"));

    let truncated = anat.join("truncated.nii");
    fs::write(&truncated, &nifti_header(&[2, 2, 2], VOXEL)[..100]).unwrap();
    assert_matches!(nifti::read_header(&truncated), Err(PrepError::Nifti { .. }));

    let missing = anat.join("absent.nii.gz");
    assert_matches!(nifti::read_header(&missing), Err(PrepError::Nifti { .. }));
}
