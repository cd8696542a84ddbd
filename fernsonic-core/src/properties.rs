//! The property model.
//!
//! Every externally visible object declares its properties through a static
//! descriptor table: id, kind, and for numeric kinds an inclusive range, for
//! object kinds a capability check. External writes validate synchronously
//! against the table, then travel through a bounded ring and are applied on
//! the audio thread at the top of the next block, before any commands run.

use std::sync::{Arc, Weak};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::config::PROPERTY_RING_CAPACITY;
use crate::error::{Error, Result};
use crate::handle::Exposable;

/// Stable identifiers for every property in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyId {
    Gain,
    Position,
    Orientation,
    Azimuth,
    Elevation,
    PanningScalar,
    PannerStrategy,
    DistanceModel,
    DistanceRef,
    DistanceMax,
    Rolloff,
    ClosenessBoost,
    ClosenessBoostDistance,
    Buffer,
    Looping,
    PlaybackPosition,
    PitchBend,
}

/// A type-checked property value crossing the external boundary.
#[derive(Clone)]
pub enum PropertyValue {
    Int(i32),
    Double(f64),
    Double3([f64; 3]),
    Double6([f64; 6]),
    Object(Option<Arc<dyn Exposable>>),
}

impl std::fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "Int({v})"),
            Self::Double(v) => write!(f, "Double({v})"),
            Self::Double3(v) => write!(f, "Double3({v:?})"),
            Self::Double6(v) => write!(f, "Double6({v:?})"),
            Self::Object(Some(_)) => write!(f, "Object(..)"),
            Self::Object(None) => write!(f, "Object(None)"),
        }
    }
}

impl PropertyValue {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Double(_) => "double",
            Self::Double3(_) => "double3",
            Self::Double6(_) => "double6",
            Self::Object(_) => "object",
        }
    }
}

/// The declared shape of one property.
#[derive(Clone, Copy)]
pub enum PropertyKind {
    Int {
        min: i32,
        max: i32,
    },
    Double {
        min: f64,
        max: f64,
    },
    Double3,
    Double6,
    /// `check` must accept the object for the write to validate.
    Object {
        check: fn(&Arc<dyn Exposable>) -> bool,
        expects: &'static str,
    },
}

pub struct PropertyDescriptor {
    pub id: PropertyId,
    pub kind: PropertyKind,
}

impl PropertyDescriptor {
    pub const fn int(id: PropertyId, min: i32, max: i32) -> Self {
        Self {
            id,
            kind: PropertyKind::Int { min, max },
        }
    }

    pub const fn double(id: PropertyId, min: f64, max: f64) -> Self {
        Self {
            id,
            kind: PropertyKind::Double { min, max },
        }
    }

    pub const fn double3(id: PropertyId) -> Self {
        Self {
            id,
            kind: PropertyKind::Double3,
        }
    }

    pub const fn double6(id: PropertyId) -> Self {
        Self {
            id,
            kind: PropertyKind::Double6,
        }
    }

    pub const fn object(
        id: PropertyId,
        check: fn(&Arc<dyn Exposable>) -> bool,
        expects: &'static str,
    ) -> Self {
        Self {
            id,
            kind: PropertyKind::Object { check, expects },
        }
    }
}

/// Validates a value against a descriptor table.
pub fn validate_against(
    descriptors: &[PropertyDescriptor],
    id: PropertyId,
    value: &PropertyValue,
) -> Result<()> {
    let descriptor = descriptors
        .iter()
        .find(|d| d.id == id)
        .ok_or_else(|| Error::PropertyDoesNotExist(format!("{id:?}")))?;

    match (&descriptor.kind, value) {
        (PropertyKind::Int { min, max }, PropertyValue::Int(v)) => {
            if v < min || v > max {
                return Err(Error::Range(format!(
                    "{id:?}: {v} is outside [{min}, {max}]"
                )));
            }
        }
        (PropertyKind::Double { min, max }, PropertyValue::Double(v)) => {
            if !(*v >= *min && *v <= *max) {
                return Err(Error::Range(format!(
                    "{id:?}: {v} is outside [{min}, {max}]"
                )));
            }
        }
        (PropertyKind::Double3, PropertyValue::Double3(_)) => {}
        (PropertyKind::Double6, PropertyValue::Double6(_)) => {}
        (PropertyKind::Object { .. }, PropertyValue::Object(None)) => {}
        (PropertyKind::Object { check, expects }, PropertyValue::Object(Some(obj))) => {
            if !check(obj) {
                return Err(Error::HandleType(format!("{id:?} expects a {expects}")));
            }
        }
        (expected, got) => {
            let expected = match expected {
                PropertyKind::Int { .. } => "int",
                PropertyKind::Double { .. } => "double",
                PropertyKind::Double3 => "double3",
                PropertyKind::Double6 => "double6",
                PropertyKind::Object { .. } => "object",
            };
            return Err(Error::PropertyType(format!(
                "{id:?} is {expected}, got {}",
                got.kind_name()
            )));
        }
    }
    Ok(())
}

/// Property getter/setter dispatch. Implementations match their own ids and
/// delegate the rest to the state they wrap, bottoming out at
/// `PropertyDoesNotExist`.
pub trait PropertyHost {
    fn property_descriptors(&self) -> &'static [PropertyDescriptor];

    /// Returns the last-applied value. Called on the audio thread (or on the
    /// caller's thread in headless mode).
    fn get_property(&self, id: PropertyId) -> Result<PropertyValue>;

    /// Applies a validated value. Called only on the audio thread.
    fn set_property(&self, id: PropertyId, value: PropertyValue) -> Result<()>;

    fn has_property(&self, id: PropertyId) -> bool {
        self.property_descriptors().iter().any(|d| d.id == id)
    }

    fn validate_property(&self, id: PropertyId, value: &PropertyValue) -> Result<()> {
        validate_against(self.property_descriptors(), id, value)
    }
}

struct PropertyWrite {
    target: Weak<dyn Exposable>,
    id: PropertyId,
    value: PropertyValue,
}

/// Bounded ring of validated-but-unapplied property writes.
pub(crate) struct PropertyRing {
    tx: Sender<PropertyWrite>,
    rx: Receiver<PropertyWrite>,
}

impl PropertyRing {
    pub(crate) fn new() -> Self {
        let (tx, rx) = bounded(PROPERTY_RING_CAPACITY);
        Self { tx, rx }
    }

    /// Pushes a write. The value must already have been validated.
    pub(crate) fn enqueue(
        &self,
        target: &Arc<dyn Exposable>,
        id: PropertyId,
        value: PropertyValue,
    ) -> Result<()> {
        let write = PropertyWrite {
            target: Arc::downgrade(target),
            id,
            value,
        };
        match self.tx.try_send(write) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(Error::ResourceExhausted("property ring is full".into()))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(Error::Internal("property ring is disconnected".into()))
            }
        }
    }

    /// Applies every pending write in order. Targets that died in the
    /// meantime are skipped; application errors are logged, never fatal.
    pub(crate) fn apply_all(&self) {
        while let Ok(write) = self.rx.try_recv() {
            let Some(target) = write.target.upgrade() else {
                continue;
            };
            if let Err(e) = target.set_property(write.id, write.value) {
                log::error!("Failed to apply property write {:?}: {}", write.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTORS: &[PropertyDescriptor] = &[
        PropertyDescriptor::double(PropertyId::Gain, 0.0, f64::MAX),
        PropertyDescriptor::int(PropertyId::Looping, 0, 1),
        PropertyDescriptor::double3(PropertyId::Position),
    ];

    #[test]
    fn test_range_rejected() {
        let err = validate_against(DESCRIPTORS, PropertyId::Gain, &PropertyValue::Double(-1.0))
            .unwrap_err();
        assert!(matches!(err, Error::Range(_)));
    }

    #[test]
    fn test_nan_rejected() {
        let err = validate_against(
            DESCRIPTORS,
            PropertyId::Gain,
            &PropertyValue::Double(f64::NAN),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Range(_)));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let err = validate_against(DESCRIPTORS, PropertyId::Gain, &PropertyValue::Int(1))
            .unwrap_err();
        assert!(matches!(err, Error::PropertyType(_)));
    }

    #[test]
    fn test_unknown_property_rejected() {
        let err = validate_against(DESCRIPTORS, PropertyId::Azimuth, &PropertyValue::Double(0.0))
            .unwrap_err();
        assert!(matches!(err, Error::PropertyDoesNotExist(_)));
    }

    #[test]
    fn test_valid_write_accepted() {
        validate_against(DESCRIPTORS, PropertyId::Looping, &PropertyValue::Int(1)).unwrap();
        validate_against(
            DESCRIPTORS,
            PropertyId::Position,
            &PropertyValue::Double3([1.0, 2.0, 3.0]),
        )
        .unwrap();
    }
}
