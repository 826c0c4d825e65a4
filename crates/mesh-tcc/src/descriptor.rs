//! Compensable service metadata.

use serde::{Deserialize, Serialize};
use std::ops::BitOr;

/// Which second-stage methods a service implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompensableFlags(u8);

impl CompensableFlags {
    pub const NONE: Self = Self(0);
    pub const CONFIRM: Self = Self(0b01);
    pub const CANCEL: Self = Self(0b10);
    pub const BOTH: Self = Self(0b11);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::BOTH.0)
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn has_confirm(&self) -> bool {
        self.contains(Self::CONFIRM)
    }

    pub fn has_cancel(&self) -> bool {
        self.contains(Self::CANCEL)
    }
}

impl BitOr for CompensableFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Registration record of a compensable service. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensableDescriptor {
    pub service_name: String,
    pub try_method: String,
    pub confirm_method: String,
    pub cancel_method: String,
    pub flags: CompensableFlags,
    pub is_propagator: bool,
}

impl CompensableDescriptor {
    /// Descriptor with only a Try method.
    pub fn new(service_name: impl Into<String>, try_method: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            try_method: try_method.into(),
            confirm_method: String::new(),
            cancel_method: String::new(),
            flags: CompensableFlags::NONE,
            is_propagator: false,
        }
    }

    pub fn with_confirm(mut self, method: impl Into<String>) -> Self {
        self.confirm_method = method.into();
        self.flags = self.flags | CompensableFlags::CONFIRM;
        self
    }

    pub fn with_cancel(mut self, method: impl Into<String>) -> Self {
        self.cancel_method = method.into();
        self.flags = self.flags | CompensableFlags::CANCEL;
        self
    }

    pub fn propagator(mut self) -> Self {
        self.is_propagator = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        assert!(CompensableFlags::BOTH.has_confirm());
        assert!(CompensableFlags::BOTH.has_cancel());
        assert!(!CompensableFlags::CONFIRM.has_cancel());
        assert_eq!(CompensableFlags::CONFIRM | CompensableFlags::CANCEL, CompensableFlags::BOTH);
        assert_eq!(CompensableFlags::from_bits(0xff), CompensableFlags::BOTH);
    }

    #[test]
    fn test_descriptor_builder() {
        let descriptor = CompensableDescriptor::new("orders", "TryReserve")
            .with_confirm("ConfirmReserve")
            .with_cancel("CancelReserve");

        assert_eq!(descriptor.flags, CompensableFlags::BOTH);
        assert_eq!(descriptor.confirm_method, "ConfirmReserve");
        assert!(!descriptor.is_propagator);
        assert!(CompensableDescriptor::new("edge", "Forward").propagator().is_propagator);
    }
}
