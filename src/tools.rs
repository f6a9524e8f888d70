use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

use camino::Utf8Path;
use serde::Serialize;
use tracing::debug;

use crate::error::PrepError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn flag(self, name: &str, value: impl fmt::Display) -> Self {
        self.arg(format!("--{name}={value}"))
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSuite {
    Fsl,
    Mrtrix3,
    Ants,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolVersions {
    pub fsl: Option<String>,
    pub mrtrix3: Option<String>,
    pub ants: Option<String>,
}

pub trait ToolRunner {
    fn run(&self, invocation: &Invocation) -> Result<(), PrepError>;
    fn version(&self, suite: ToolSuite) -> Option<String>;

    fn versions(&self) -> ToolVersions {
        ToolVersions {
            fsl: self.version(ToolSuite::Fsl),
            mrtrix3: self.version(ToolSuite::Mrtrix3),
            ants: self.version(ToolSuite::Ants),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemToolRunner;

impl SystemToolRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ToolRunner for SystemToolRunner {
    fn run(&self, invocation: &Invocation) -> Result<(), PrepError> {
        let program = find_in_path(&invocation.program)
            .ok_or_else(|| PrepError::MissingTool(invocation.program.clone()))?;
        debug!(command = %invocation, "running");
        let output = Command::new(&program)
            .args(&invocation.args)
            .output()
            .map_err(|err| PrepError::ToolFailed {
                tool: invocation.program.clone(),
                message: err.to_string(),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr
        };
        Err(PrepError::ToolFailed {
            tool: invocation.program.clone(),
            message,
        })
    }

    fn version(&self, suite: ToolSuite) -> Option<String> {
        match suite {
            ToolSuite::Fsl => {
                let fsldir = std::env::var_os("FSLDIR")?;
                let path = PathBuf::from(fsldir).join("etc").join("fslversion");
                let text = fs::read_to_string(path).ok()?;
                text.split(':').next().map(|v| v.trim().to_string())
            }
            ToolSuite::Mrtrix3 => {
                let stdout = tool_stdout("dwidenoise", &["-version"])?;
                stdout
                    .lines()
                    .next()
                    .map(|line| line.trim_matches(|ch: char| ch == '=' || ch.is_whitespace()))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .map(str::to_string)
            }
            ToolSuite::Ants => {
                let stdout = tool_stdout("antsRegistration", &["--version"])?;
                stdout
                    .lines()
                    .find(|line| line.contains("Version"))
                    .and_then(|line| line.split_whitespace().last())
                    .map(str::to_string)
            }
        }
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn tool_stdout(name: &str, args: &[&str]) -> Option<String> {
    let program = find_in_path(name)?;
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() { None } else { Some(stdout) }
}

pub fn fslmerge(output: &Utf8Path, inputs: &[&Utf8Path]) -> Invocation {
    let cmd = Invocation::new("fslmerge").arg("-t").arg(output);
    inputs.iter().fold(cmd, |cmd, input| cmd.arg(input))
}

pub fn fslroi(input: &Utf8Path, output: &Utf8Path, frame: usize) -> Invocation {
    Invocation::new("fslroi")
        .arg(input)
        .arg(output)
        .arg(frame)
        .arg(1)
}

// bet writes the mask next to `output` as <output>_mask.nii.gz.
pub fn bet(input: &Utf8Path, output: &Utf8Path, fraction: f64) -> Invocation {
    Invocation::new("bet")
        .arg(input)
        .arg(output)
        .arg("-m")
        .arg("-f")
        .arg(fraction)
}

pub fn fslmaths_mean(input: &Utf8Path, output: &Utf8Path) -> Invocation {
    Invocation::new("fslmaths").arg(input).arg("-Tmean").arg(output)
}

pub fn fslmaths_div(input: &Utf8Path, divisor: &Utf8Path, output: &Utf8Path) -> Invocation {
    Invocation::new("fslmaths")
        .arg(input)
        .arg("-div")
        .arg(divisor)
        .arg(output)
}

pub fn fslmaths_mean_of_pair(
    first: &Utf8Path,
    second: &Utf8Path,
    output: &Utf8Path,
) -> Invocation {
    Invocation::new("fslmaths")
        .arg(first)
        .arg("-add")
        .arg(second)
        .arg("-div")
        .arg(2)
        .arg(output)
}

pub fn fslcpgeom(source: &Utf8Path, dest: &Utf8Path) -> Invocation {
    Invocation::new("fslcpgeom").arg(source).arg(dest)
}

pub fn dwidenoise(
    input: &Utf8Path,
    output: &Utf8Path,
    extent: [u32; 3],
    threads: usize,
) -> Invocation {
    let [x, y, z] = extent;
    Invocation::new("dwidenoise")
        .arg(input)
        .arg(output)
        .arg("-extent")
        .arg(format!("{x},{y},{z}"))
        .arg("-nthreads")
        .arg(threads)
        .arg("-force")
}

pub fn mrdegibbs(input: &Utf8Path, output: &Utf8Path, threads: usize) -> Invocation {
    Invocation::new("mrdegibbs")
        .arg(input)
        .arg(output)
        .arg("-nthreads")
        .arg(threads)
        .arg("-force")
}

pub fn topup(
    imain: &Utf8Path,
    datain: &Utf8Path,
    out_base: &Utf8Path,
    corrected: &Utf8Path,
) -> Invocation {
    Invocation::new("topup")
        .flag("imain", imain)
        .flag("datain", datain)
        .flag("config", "b02b0.cnf")
        .flag("out", out_base)
        .flag("iout", corrected)
}

pub struct EddyArgs<'a> {
    pub imain: &'a Utf8Path,
    pub mask: &'a Utf8Path,
    pub acqp: &'a Utf8Path,
    pub index: &'a Utf8Path,
    pub bvecs: &'a Utf8Path,
    pub bvals: &'a Utf8Path,
    pub topup_base: Option<&'a Utf8Path>,
    pub out_base: &'a Utf8Path,
    pub threads: usize,
}

pub fn eddy(program: &str, args: &EddyArgs<'_>) -> Invocation {
    let mut cmd = Invocation::new(program)
        .flag("imain", args.imain)
        .flag("mask", args.mask)
        .flag("acqp", args.acqp)
        .flag("index", args.index)
        .flag("bvecs", args.bvecs)
        .flag("bvals", args.bvals);
    if let Some(base) = args.topup_base {
        cmd = cmd.flag("topup", base);
    }
    cmd.flag("out", args.out_base)
        .arg("--cnr_maps")
        .arg("--repol")
        .flag("nthr", args.threads)
}

pub fn n4_bias_field(input: &Utf8Path, corrected: &Utf8Path, bias: &Utf8Path) -> Invocation {
    Invocation::new("N4BiasFieldCorrection")
        .arg("-d")
        .arg(3)
        .arg("-i")
        .arg(input)
        .arg("-o")
        .arg(format!("[{corrected},{bias}]"))
}

pub fn dtifit(
    dwi: &Utf8Path,
    out_base: &Utf8Path,
    mask: &Utf8Path,
    bvecs: &Utf8Path,
    bvals: &Utf8Path,
) -> Invocation {
    Invocation::new("dtifit")
        .arg("-k")
        .arg(dwi)
        .arg("-o")
        .arg(out_base)
        .arg("-m")
        .arg(mask)
        .arg("-r")
        .arg(bvecs)
        .arg("-b")
        .arg(bvals)
}
