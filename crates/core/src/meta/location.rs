//! Reported device locations.
//!
//! A [`Location`] is what a [`MetaTensor`](super::MetaTensor) *claims* to live on.
//! It never influences where shape computation happens: every proxy is backed by
//! virtual storage ([`Location::Meta`]).

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, DeviceLocation};
use thiserror::Error;

/// Opaque device identifier advertised by a proxy tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    /// Virtual storage: metadata only, no element buffer.
    Meta,
    Cpu,
    Cuda(usize),
    Metal(usize),
    /// Any backend candle does not model (`"vulkan"`, `"xla:0"`, ...).
    Named(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationParseError {
    #[error("empty location string")]
    Empty,

    #[error("invalid ordinal {ordinal:?} in location {location:?}")]
    InvalidOrdinal { location: String, ordinal: String },
}

impl Location {
    /// Whether this is the virtual storage location.
    pub fn is_meta(&self) -> bool {
        matches!(self, Location::Meta)
    }
}

impl Default for Location {
    fn default() -> Self {
        Location::Meta
    }
}

impl From<&Device> for Location {
    fn from(device: &Device) -> Self {
        match device.location() {
            DeviceLocation::Cpu => Location::Cpu,
            DeviceLocation::Cuda { gpu_id } => Location::Cuda(gpu_id),
            DeviceLocation::Metal { gpu_id } => Location::Metal(gpu_id),
        }
    }
}

impl From<Device> for Location {
    fn from(device: Device) -> Self {
        Location::from(&device)
    }
}

impl FromStr for Location {
    type Err = LocationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LocationParseError::Empty);
        }
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => (kind, Some(ordinal)),
            None => (s, None),
        };
        let parse_ordinal = |ordinal: Option<&str>| -> Result<usize, LocationParseError> {
            match ordinal {
                None => Ok(0),
                Some(o) => o.parse().map_err(|_| LocationParseError::InvalidOrdinal {
                    location: s.to_string(),
                    ordinal: o.to_string(),
                }),
            }
        };
        match kind.to_ascii_lowercase().as_str() {
            "meta" if ordinal.is_none() => Ok(Location::Meta),
            "cpu" if ordinal.is_none() => Ok(Location::Cpu),
            "cuda" => Ok(Location::Cuda(parse_ordinal(ordinal)?)),
            "metal" | "mps" => Ok(Location::Metal(parse_ordinal(ordinal)?)),
            _ => Ok(Location::Named(s.to_string())),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Meta => write!(f, "meta"),
            Location::Cpu => write!(f, "cpu"),
            Location::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Location::Metal(ordinal) => write!(f, "metal:{ordinal}"),
            Location::Named(name) => write!(f, "{name}"),
        }
    }
}
