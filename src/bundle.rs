//! Firmware bundle types
//!
//! A bundle is a set of named parts, each carrying its payload and an
//! attribute map. Bundles are produced by an external unpacker; the
//! flasher only consumes them. The `addr` attribute is mandatory for
//! flashable parts and `type == "sys_params"` is semantically significant
//! to the planner.

use std::collections::BTreeMap;

/// One part of a firmware bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePart {
    pub name: String,
    pub attrs: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

impl FirmwarePart {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        FirmwarePart {
            name: name.into(),
            attrs: BTreeMap::new(),
            data,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// A named collection of firmware parts.
#[derive(Debug, Clone, Default)]
pub struct FirmwareBundle {
    pub name: String,
    pub parts: Vec<FirmwarePart>,
}

impl FirmwareBundle {
    pub fn new(name: impl Into<String>) -> Self {
        FirmwareBundle {
            name: name.into(),
            parts: Vec::new(),
        }
    }

    pub fn push(&mut self, part: FirmwarePart) {
        self.parts.push(part);
    }
}
