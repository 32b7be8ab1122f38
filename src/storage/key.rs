use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::subgrid::CellAddress;

/// Key of spatially partitioned data: a leaf's directory, or one of its
/// segments when `segment` is set.
///
/// String form: `{project}-{subgrid_x}-{subgrid_y}[-{segment}]`, where the
/// subgrid coordinates are the leaf's origin cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpatialAffinityKey {
    pub project: Uuid,
    pub subgrid_x: u32,
    pub subgrid_y: u32,
    pub segment: Option<String>,
}

impl SpatialAffinityKey {
    pub fn new(project: Uuid, origin: CellAddress) -> Self {
        Self {
            project,
            subgrid_x: origin.x,
            subgrid_y: origin.y,
            segment: None,
        }
    }

    pub fn with_segment(&self, segment: impl Into<String>) -> Self {
        Self {
            segment: Some(segment.into()),
            ..self.clone()
        }
    }

    /// Key of the directory owning this key.
    pub fn directory(&self) -> Self {
        Self {
            segment: None,
            ..self.clone()
        }
    }

    pub fn origin(&self) -> CellAddress {
        CellAddress::new(self.subgrid_x, self.subgrid_y)
    }
}

impl fmt::Display for SpatialAffinityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.project, self.subgrid_x, self.subgrid_y)?;
        if let Some(segment) = &self.segment {
            write!(f, "-{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for SpatialAffinityKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Decode(format!("spatial key {:?}", s));

        // A hyphenated uuid is 36 characters and itself contains hyphens
        let (project, rest) = (s.get(..36).ok_or_else(bad)?, s.get(36..).ok_or_else(bad)?);
        let project = Uuid::parse_str(project).map_err(|_| bad())?;
        let rest = rest.strip_prefix('-').ok_or_else(bad)?;

        let mut parts = rest.splitn(3, '-');
        let subgrid_x = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let subgrid_y = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let segment = match parts.next() {
            Some("") => return Err(bad()),
            Some(segment) => Some(segment.to_string()),
            None => None,
        };

        Ok(Self {
            project,
            subgrid_x,
            subgrid_y,
            segment,
        })
    }
}

/// Key of project-wide data that has no spatial partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonSpatialAffinityKey {
    pub project: Uuid,
    pub name: String,
}

impl NonSpatialAffinityKey {
    pub fn new(project: Uuid, name: impl Into<String>) -> Self {
        Self {
            project,
            name: name.into(),
        }
    }
}

impl fmt::Display for NonSpatialAffinityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.project, self.name)
    }
}
