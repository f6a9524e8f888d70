use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bids::{BidsLayout, companion};
use crate::config::ResolvedConfig;
use crate::derivatives::{self, DerivativeInputs, Provenance, SdcRecord};
use crate::domain::{SessionLabel, SubjectLabel};
use crate::eddy::{
    self, EddyInputs, MaskGeometry, MaskSource, TopupOutputs, TopupPlan, TopupSource,
};
use crate::error::PrepError;
use crate::layout::{
    WorkLayout, copy_file_atomic, nifti_stem, nifti_with_suffix, read_text, write_bytes_atomic,
};
use crate::nifti;
use crate::overview::{self, Dataset, merge_bval_text, merge_bvec_text};
use crate::tools::{self, EddyArgs, ToolRunner, ToolVersions};
use crate::topup::{self, TopupDecision};

#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub subject: SubjectLabel,
    pub session: SessionLabel,
    pub dataset: Dataset,
    pub decision: TopupDecision,
    pub eddy: EddyInputs,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub subject: SubjectLabel,
    pub session: SessionLabel,
    pub decision: TopupDecision,
    pub eddy: EddyInputs,
    pub mask_geometry: Option<MaskGeometry>,
    pub versions: ToolVersions,
    pub derivatives: Vec<Utf8PathBuf>,
    pub started_at: String,
    pub finished_at: String,
}

// DWI copied or merged into the work directory, with its gradient tables and
// the brain mask of its first low-b frame.
#[derive(Debug, Clone)]
struct Gathered {
    dataset: Dataset,
    bval: Utf8PathBuf,
    bvec: Utf8PathBuf,
    b0_mask: Utf8PathBuf,
}

#[derive(Debug, Clone)]
struct EddyFiles {
    mask: Utf8PathBuf,
    acqp: Utf8PathBuf,
    index: Utf8PathBuf,
    geometry: Option<MaskGeometry>,
}

pub struct Pipeline<'a, R: ToolRunner> {
    runner: &'a R,
    bids: &'a BidsLayout,
    layout: &'a WorkLayout,
    config: &'a ResolvedConfig,
}

impl<'a, R: ToolRunner> Pipeline<'a, R> {
    pub fn new(
        runner: &'a R,
        bids: &'a BidsLayout,
        layout: &'a WorkLayout,
        config: &'a ResolvedConfig,
    ) -> Self {
        Self {
            runner,
            bids,
            layout,
            config,
        }
    }

    pub fn overview(&self) -> Result<Dataset, PrepError> {
        let raw = self
            .bids
            .discover(self.layout.subject(), self.layout.session())?;
        overview::build_overview(raw, self.config.b0_threshold)
    }

    // Everything up to the eddy inputs, without touching any tool.
    pub fn plan(&self) -> Result<RunPlan, PrepError> {
        let dataset = self.merged(&self.overview()?)?;
        let decision = topup::resolve(&dataset);
        let eddy = eddy::assemble(&dataset, &decision)?;
        Ok(RunPlan {
            subject: self.layout.subject().clone(),
            session: self.layout.session().clone(),
            dataset,
            decision,
            eddy,
        })
    }

    pub fn run(&self) -> Result<RunOutcome, PrepError> {
        let started_at = now_rfc3339();
        let dataset = self.overview()?;
        self.layout.ensure_work_dirs()?;

        let gathered = self.gather(&dataset)?;
        let dataset = self.denoise(gathered.dataset.clone())?;
        let dataset = self.degibbs(dataset)?;

        let decision = topup::resolve(&dataset);
        let inputs = eddy::assemble(&dataset, &decision)?;
        let inputs = match inputs.topup.clone() {
            Some(plan) => {
                let outputs = self.topup(&plan, &inputs)?;
                inputs.with_topup_outputs(outputs)
            }
            None => inputs,
        };
        let files = self.prepare_eddy(&dataset, &inputs, &gathered)?;
        let corrected = self.eddy(&dataset, &files, &gathered, inputs.topup_outputs.as_ref())?;
        let bias_corrected = self.bias_correct(&dataset, &corrected)?;
        let rotated_bvec = self.layout.eddy_output(".eddy_rotated_bvecs");
        self.dtifit(&bias_corrected, &files.mask, &rotated_bvec, &gathered.bval)?;

        let versions = self.runner.versions();
        let provenance = Provenance {
            application_name: self.config.application_name.clone(),
            raw_sources: self.raw_sources(&dataset, &inputs),
            versions: versions.clone(),
            denoise_window: self.config.denoise_window,
            sdc: SdcRecord::new(&decision, &inputs, files.geometry),
        };
        let derivative_inputs = DerivativeInputs {
            dwi: bias_corrected,
            bval: gathered.bval.clone(),
            rotated_bvec,
            cnr: self.layout.eddy_output(".eddy_cnr_maps.nii.gz"),
            mask: files.mask.clone(),
            movement_rms: self.layout.eddy_output(".eddy_movement_rms"),
            restricted_movement_rms: self.layout.eddy_output(".eddy_restricted_movement_rms"),
            parameters: self.layout.eddy_output(".eddy_parameters"),
            dtifit_dir: self.layout.dtifit_dir(),
        };
        let written = derivatives::export(self.layout, &derivative_inputs, &provenance)?;

        Ok(RunOutcome {
            subject: self.layout.subject().clone(),
            session: self.layout.session().clone(),
            decision,
            eddy: inputs,
            mask_geometry: files.geometry,
            versions,
            derivatives: written,
            started_at,
            finished_at: now_rfc3339(),
        })
    }

    fn merged(&self, dataset: &Dataset) -> Result<Dataset, PrepError> {
        if dataset.merge_candidates().len() < 2 {
            return Ok(dataset.clone());
        }
        dataset.merge_dwi(
            &self.layout.merged_dwi_path(),
            self.config.b0_threshold,
            self.config.merge_policy,
        )
    }

    fn gather(&self, dataset: &Dataset) -> Result<Gathered, PrepError> {
        let candidates: Vec<Utf8PathBuf> = dataset
            .merge_candidates()
            .iter()
            .map(|dwi| dwi.path.clone())
            .collect();

        let (dataset, bval, bvec) = if candidates.len() > 1 {
            let merged_path = self.layout.merged_dwi_path();
            let merged = self.merged(dataset)?;
            let inputs: Vec<&Utf8Path> = candidates.iter().map(|path| path.as_path()).collect();
            self.runner.run(&tools::fslmerge(&merged_path, &inputs))?;

            let mut bvals = Vec::with_capacity(candidates.len());
            let mut bvecs = Vec::with_capacity(candidates.len());
            for path in &candidates {
                bvals.push(read_text(&companion(path, "bval"))?);
                let bvec_path = companion(path, "bvec");
                bvecs.push((bvec_path.to_string(), read_text(&bvec_path)?));
            }
            let bval = companion(&merged_path, "bval");
            let bvec = companion(&merged_path, "bvec");
            write_bytes_atomic(&bval, merge_bval_text(&bvals).as_bytes())?;
            write_bytes_atomic(&bvec, merge_bvec_text(&bvecs)?.as_bytes())?;
            (merged, bval, bvec)
        } else {
            let source = &dataset.primary_dwi()?.path;
            let dest = self
                .layout
                .pre_hmc_dir()
                .join(source.file_name().unwrap_or("dwi.nii.gz"));
            copy_file_atomic(source, &dest)?;
            let bval = companion(&dest, "bval");
            let bvec = companion(&dest, "bvec");
            copy_file_atomic(&companion(source, "bval"), &bval)?;
            copy_file_atomic(&companion(source, "bvec"), &bvec)?;
            (dataset.with_primary_path(&dest), bval, bvec)
        };

        let dwi = dataset.primary_dwi()?;
        let low_b = dwi
            .first_low_b()
            .ok_or_else(|| PrepError::NoLowBVolume(dwi.path.to_string()))?;
        let b0 = self.extract_frame(&dwi.path, low_b, &self.layout.pre_hmc_dir())?;
        let b0_mask = self.brain_mask(&b0)?;
        info!(dwi = %dwi.path, runs = candidates.len(), "inputs gathered");

        Ok(Gathered {
            dataset,
            bval,
            bvec,
            b0_mask,
        })
    }

    fn denoise(&self, dataset: Dataset) -> Result<Dataset, PrepError> {
        let Some(extent) = self.config.denoise_extent() else {
            debug!("denoising disabled");
            return Ok(dataset);
        };
        let input = &dataset.primary_dwi()?.path;
        let output = nifti_with_suffix(input, "_denoised");
        self.runner.run(&tools::dwidenoise(
            input,
            &output,
            extent,
            self.config.n_cpus,
        ))?;
        Ok(dataset.with_primary_path(&output))
    }

    fn degibbs(&self, dataset: Dataset) -> Result<Dataset, PrepError> {
        let dwi = dataset.primary_dwi()?;
        if dwi.partial_fourier() != Some(1.0) {
            debug!(partial_fourier = ?dwi.partial_fourier(), "skipping gibbs ringing removal");
            return Ok(dataset);
        }
        let output = nifti_with_suffix(&dwi.path, "_mrdegibbs");
        self.runner
            .run(&tools::mrdegibbs(&dwi.path, &output, self.config.n_cpus))?;
        Ok(dataset.with_primary_path(&output))
    }

    fn topup(&self, plan: &TopupPlan, inputs: &EddyInputs) -> Result<TopupOutputs, PrepError> {
        let topup_dir = self.layout.topup_dir();
        let mut volumes = Vec::with_capacity(plan.inputs.len());
        for input in &plan.inputs {
            match input.frame {
                Some(frame) => volumes.push(self.extract_frame(&input.path, frame, &topup_dir)?),
                None => volumes.push(input.path.clone()),
            }
        }
        let merged = self.layout.topup_merged_path();
        let refs: Vec<&Utf8Path> = volumes.iter().map(|path| path.as_path()).collect();
        self.runner.run(&tools::fslmerge(&merged, &refs))?;

        let acqp = self.layout.topup_acqp_path();
        write_bytes_atomic(&acqp, inputs.acqp.to_string().as_bytes())?;
        self.runner.run(&tools::topup(
            &merged,
            &acqp,
            &self.layout.topup_base(),
            &self.layout.topup_corrected_path(),
        ))?;
        let outputs = TopupOutputs {
            base: self.layout.topup_base(),
            fieldcoef: self.layout.topup_fieldcoef_path(),
            movpar: self.layout.topup_movpar_path(),
        };
        for path in [&outputs.fieldcoef, &outputs.movpar] {
            if !path.as_std_path().is_file() {
                return Err(PrepError::ToolFailed {
                    tool: "topup".to_string(),
                    message: format!("finished without writing {path}"),
                });
            }
        }
        info!(source = ?plan.source, volumes = volumes.len(), "topup finished");
        Ok(outputs)
    }

    fn prepare_eddy(
        &self,
        dataset: &Dataset,
        inputs: &EddyInputs,
        gathered: &Gathered,
    ) -> Result<EddyFiles, PrepError> {
        let dwi = dataset.primary_dwi()?;
        let pre_hmc = self.layout.pre_hmc_dir();
        let stem = nifti_stem(&dwi.path);

        let (mask, acqp, geometry) = match inputs.mask {
            MaskSource::TopupCorrectedMean => {
                let mean = nifti_with_suffix(&self.layout.topup_corrected_path(), "_mean");
                self.runner.run(&tools::fslmaths_mean(
                    &self.layout.topup_corrected_path(),
                    &mean,
                ))?;
                let topup_mask = self.brain_mask(&mean)?;
                let (mask, geometry) = self.reconcile_geometry(&topup_mask, &gathered.b0_mask)?;
                (mask, self.layout.topup_acqp_path(), Some(geometry))
            }
            MaskSource::FirstLowB { .. } => {
                let acqp = pre_hmc.join(format!("{stem}_acq_param.txt"));
                write_bytes_atomic(&acqp, inputs.acqp.to_string().as_bytes())?;
                (gathered.b0_mask.clone(), acqp, None)
            }
        };

        let index = pre_hmc.join(format!("{stem}_index.txt"));
        write_bytes_atomic(&index, eddy::format_index(&inputs.index).as_bytes())?;
        Ok(EddyFiles {
            mask,
            acqp,
            index,
            geometry,
        })
    }

    // Small voxel-size drift between the topup mask and the DWI is repaired by
    // copying the DWI mask geometry onto a copy of the topup mask.
    fn reconcile_geometry(
        &self,
        topup_mask: &Utf8Path,
        b0_mask: &Utf8Path,
    ) -> Result<(Utf8PathBuf, MaskGeometry), PrepError> {
        let corrected = nifti::read_header(topup_mask)?.voxel_size;
        let reference = nifti::read_header(b0_mask)?.voxel_size;
        let geometry = eddy::compare_mask_geometry(
            corrected,
            reference,
            self.config.mask_geometry_tolerance,
        );
        match geometry {
            MaskGeometry::Matching => Ok((topup_mask.to_path_buf(), geometry)),
            MaskGeometry::Recoverable => {
                let copy = self
                    .layout
                    .copygeom_dir()
                    .join(topup_mask.file_name().unwrap_or("mask.nii.gz"));
                copy_file_atomic(topup_mask, &copy)?;
                self.runner.run(&tools::fslcpgeom(b0_mask, &copy))?;
                info!(mask = %copy, "copied dwi geometry onto topup mask");
                Ok((copy, geometry))
            }
            MaskGeometry::Mismatched => {
                warn!(
                    ?corrected,
                    ?reference,
                    "topup mask voxel size differs from dwi, using mask unchanged"
                );
                Ok((topup_mask.to_path_buf(), geometry))
            }
        }
    }

    fn eddy(
        &self,
        dataset: &Dataset,
        files: &EddyFiles,
        gathered: &Gathered,
        topup: Option<&TopupOutputs>,
    ) -> Result<Utf8PathBuf, PrepError> {
        let dwi = dataset.primary_dwi()?;
        let out_base = self.layout.eddy_base();
        let args = EddyArgs {
            imain: &dwi.path,
            mask: &files.mask,
            acqp: &files.acqp,
            index: &files.index,
            bvecs: &gathered.bvec,
            bvals: &gathered.bval,
            topup_base: topup.map(|outputs| outputs.base.as_path()),
            out_base: &out_base,
            threads: self.config.n_cpus,
        };
        self.runner
            .run(&tools::eddy(&self.config.eddy_command, &args))?;

        let corrected = self.layout.eddy_output(".nii.gz");
        if !corrected.as_std_path().is_file() {
            return Err(PrepError::EddyOutput {
                path: corrected.to_string(),
                message: "eddy finished without writing its corrected image".to_string(),
            });
        }
        info!(output = %corrected, topup = topup.is_some(), "eddy finished");
        Ok(corrected)
    }

    fn bias_correct(
        &self,
        dataset: &Dataset,
        corrected: &Utf8Path,
    ) -> Result<Utf8PathBuf, PrepError> {
        let dwi = dataset.primary_dwi()?;
        let low_b = dwi
            .first_low_b()
            .ok_or_else(|| PrepError::NoLowBVolume(dwi.path.to_string()))?;
        let bias_dir = self.layout.bias_dir();
        let b0 = self.extract_frame(corrected, low_b, &bias_dir)?;
        let field = bias_dir.join("bias_field_b0.nii.gz");
        self.runner.run(&tools::n4_bias_field(
            &b0,
            &nifti_with_suffix(&b0, "_corrected"),
            &field,
        ))?;
        let output = nifti_with_suffix(corrected, "_bias_corrected");
        self.runner
            .run(&tools::fslmaths_div(corrected, &field, &output))?;
        Ok(output)
    }

    fn dtifit(
        &self,
        dwi: &Utf8Path,
        mask: &Utf8Path,
        bvecs: &Utf8Path,
        bvals: &Utf8Path,
    ) -> Result<(), PrepError> {
        self.runner.run(&tools::dtifit(
            dwi,
            &self.layout.dtifit_base(),
            mask,
            bvecs,
            bvals,
        ))?;
        // RD = (L2 + L3) / 2
        self.runner.run(&tools::fslmaths_mean_of_pair(
            &self.layout.dtifit_output("L2"),
            &self.layout.dtifit_output("L3"),
            &self.layout.dtifit_output("RD"),
        ))
    }

    fn extract_frame(
        &self,
        input: &Utf8Path,
        frame: usize,
        dir: &Utf8Path,
    ) -> Result<Utf8PathBuf, PrepError> {
        let output = dir.join(format!("{}_{frame:02}.nii.gz", nifti_stem(input)));
        if output.as_std_path().is_file() {
            debug!(frame = %output, "frame already extracted");
            return Ok(output);
        }
        self.runner.run(&tools::fslroi(input, &output, frame))?;
        Ok(output)
    }

    // bet -m writes <image>_brain.nii.gz and <image>_brain_mask.nii.gz.
    fn brain_mask(&self, image: &Utf8Path) -> Result<Utf8PathBuf, PrepError> {
        let brain = nifti_with_suffix(image, "_brain");
        self.runner
            .run(&tools::bet(image, &brain, self.config.bet_fraction))?;
        Ok(nifti_with_suffix(image, "_brain_mask"))
    }

    // DWI sources, then the sbref sources when topup ran on sbref alone,
    // otherwise the fieldmap sources; relative to the BIDS root.
    fn raw_sources(&self, dataset: &Dataset, inputs: &EddyInputs) -> Vec<String> {
        let sbref_only = inputs
            .topup
            .as_ref()
            .is_some_and(|plan| plan.source == TopupSource::SbrefOnly);
        let auxiliary = if sbref_only {
            &dataset.sbref
        } else {
            &dataset.fmap
        };
        dataset
            .dwi
            .iter()
            .chain(auxiliary)
            .flat_map(|acquisition| &acquisition.sources)
            .map(|path| format!("/{}", self.bids.relative(path)))
            .collect()
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
