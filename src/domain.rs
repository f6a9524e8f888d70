use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PrepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    fn letter(self) -> char {
        match self {
            Axis::X => 'x',
            Axis::Y => 'y',
            Axis::Z => 'z',
        }
    }
}

// Physical-space phase encoding: an axis plus polarity. Parsed from the BIDS
// image-space labels (i, j, k) or from already normalized labels (x, y, z),
// each with an optional trailing "-".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhaseEncoding {
    axis: Axis,
    reversed: bool,
}

impl PhaseEncoding {
    pub fn new(axis: Axis, reversed: bool) -> Self {
        Self { axis, reversed }
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    pub fn opposite(&self) -> Self {
        Self {
            axis: self.axis,
            reversed: !self.reversed,
        }
    }

    pub fn direction_vector(&self) -> [i8; 3] {
        let mut vector = [0i8; 3];
        vector[self.axis.index()] = if self.reversed { -1 } else { 1 };
        vector
    }
}

impl fmt::Display for PhaseEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reversed {
            write!(f, "{}-", self.axis.letter())
        } else {
            write!(f, "{}", self.axis.letter())
        }
    }
}

impl FromStr for PhaseEncoding {
    type Err = PrepError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (letter, reversed) = match trimmed.strip_suffix('-') {
            Some(rest) => (rest, true),
            None => (trimmed, false),
        };
        let axis = match letter {
            "i" | "x" => Axis::X,
            "j" | "y" => Axis::Y,
            "k" | "z" => Axis::Z,
            _ => return Err(PrepError::InvalidPhaseEncoding(value.to_string())),
        };
        Ok(Self { axis, reversed })
    }
}

impl Serialize for PhaseEncoding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PhaseEncoding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionKind {
    Dwi,
    Fmap,
    Sbref,
}

impl AcquisitionKind {
    pub const ALL: [AcquisitionKind; 3] = [
        AcquisitionKind::Dwi,
        AcquisitionKind::Fmap,
        AcquisitionKind::Sbref,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionKind::Dwi => "dwi",
            AcquisitionKind::Fmap => "fmap",
            AcquisitionKind::Sbref => "sbref",
        }
    }

    pub fn bids_suffix(&self) -> &'static str {
        match self {
            AcquisitionKind::Dwi => "dwi",
            AcquisitionKind::Fmap => "epi",
            AcquisitionKind::Sbref => "sbref",
        }
    }
}

impl fmt::Display for AcquisitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerKind<T> {
    pub dwi: T,
    pub fmap: T,
    pub sbref: T,
}

impl<T> PerKind<T> {
    pub fn get(&self, kind: AcquisitionKind) -> &T {
        match kind {
            AcquisitionKind::Dwi => &self.dwi,
            AcquisitionKind::Fmap => &self.fmap,
            AcquisitionKind::Sbref => &self.sbref,
        }
    }

    pub fn from_fn(mut build: impl FnMut(AcquisitionKind) -> T) -> Self {
        Self {
            dwi: build(AcquisitionKind::Dwi),
            fmap: build(AcquisitionKind::Fmap),
            sbref: build(AcquisitionKind::Sbref),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectLabel(String);

impl SubjectLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn entity(&self) -> String {
        format!("sub-{}", self.0)
    }
}

impl fmt::Display for SubjectLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubjectLabel {
    type Err = PrepError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let label = strip_entity(value, "sub-");
        if !is_bids_label(label) {
            return Err(PrepError::InvalidSubjectLabel(value.to_string()));
        }
        Ok(Self(label.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionLabel(String);

impl SessionLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn entity(&self) -> String {
        format!("ses-{}", self.0)
    }
}

impl fmt::Display for SessionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionLabel {
    type Err = PrepError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let label = strip_entity(value, "ses-");
        if !is_bids_label(label) {
            return Err(PrepError::InvalidSessionLabel(value.to_string()));
        }
        Ok(Self(label.to_string()))
    }
}

fn strip_entity<'a>(value: &'a str, prefix: &str) -> &'a str {
    let trimmed = value.trim();
    trimmed.strip_prefix(prefix).unwrap_or(trimmed)
}

fn is_bids_label(label: &str) -> bool {
    !label.is_empty() && label.chars().all(|ch| ch.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn image_space_labels_normalize_to_physical_axes() {
        let expected = ["x", "y", "z", "x-", "y-", "z-"];
        for (label, want) in ["i", "j", "k", "i-", "j-", "k-"].iter().zip(expected) {
            let pe: PhaseEncoding = label.parse().unwrap();
            assert_eq!(pe.to_string(), want);
        }
    }

    #[test]
    fn rejects_unknown_axis() {
        let err = "q-".parse::<PhaseEncoding>().unwrap_err();
        assert_matches!(err, PrepError::InvalidPhaseEncoding(_));
    }

    #[test]
    fn subject_prefix_is_stripped() {
        let label: SubjectLabel = "sub-CON02".parse().unwrap();
        assert_eq!(label.as_str(), "CON02");
        assert_eq!(label.entity(), "sub-CON02");
    }
}
