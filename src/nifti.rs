use camino::Utf8Path;

use crate::error::PrepError;

// Geometry the pipeline needs from a NIfTI header: image dimensions and the
// spatial voxel size.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageHeader {
    pub dims: Vec<usize>,
    pub voxel_size: [f64; 3],
}

impl ImageHeader {
    pub fn frames(&self) -> usize {
        self.dims.get(3).copied().filter(|&n| n > 0).unwrap_or(1)
    }
}

// .nii.gz files are decompressed by the nifti crate based on the extension.
pub fn read_header(path: &Utf8Path) -> Result<ImageHeader, PrepError> {
    let header =
        ::nifti::NiftiHeader::from_file(path.as_std_path()).map_err(|err| PrepError::Nifti {
            path: path.to_string(),
            message: err.to_string(),
        })?;

    let dim = header.dim;
    let rank = (dim[0] as usize).min(7);
    let dims = dim[1..=rank].iter().map(|&n| n as usize).collect();
    let pixdim = header.pixdim;
    Ok(ImageHeader {
        dims,
        voxel_size: [pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64],
    })
}
