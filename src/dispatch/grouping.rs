//! Image grouping keys and masks
//!
//! Consecutive images belong to the same group as long as every *masked*
//! index field keeps the same value. The mask is declared by a capability,
//! validated once per session, and owned by that session's dispatch engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use mrd::{ImageHeader, MrdError, Result};

/// The fixed set of image index fields available for grouping comparisons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexField {
    MeasurementUid,
    Average,
    Slice,
    Contrast,
    Phase,
    Repetition,
    Set,
    ImageType,
    ImageSeriesIndex,
}

impl IndexField {
    /// Every field, in wire-header order
    pub const ALL: [IndexField; 9] = [
        IndexField::MeasurementUid,
        IndexField::Average,
        IndexField::Slice,
        IndexField::Contrast,
        IndexField::Phase,
        IndexField::Repetition,
        IndexField::Set,
        IndexField::ImageType,
        IndexField::ImageSeriesIndex,
    ];

    pub fn name(self) -> &'static str {
        match self {
            IndexField::MeasurementUid => "measurement_uid",
            IndexField::Average => "average",
            IndexField::Slice => "slice",
            IndexField::Contrast => "contrast",
            IndexField::Phase => "phase",
            IndexField::Repetition => "repetition",
            IndexField::Set => "set",
            IndexField::ImageType => "image_type",
            IndexField::ImageSeriesIndex => "image_series_index",
        }
    }
}

impl fmt::Display for IndexField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for IndexField {
    type Err = MrdError;

    fn from_str(s: &str) -> Result<Self> {
        IndexField::ALL
            .iter()
            .copied()
            .find(|field| field.name() == s)
            .ok_or_else(|| {
                MrdError::config(format!("Unknown image index field '{}'", s))
            })
    }
}

/// The subset of index fields a session compares when grouping images
///
/// Constructed once per session from a capability's declared field list and
/// passed explicitly into every key comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingMask {
    fields: Vec<IndexField>,
}

impl GroupingMask {
    /// Build a mask from declared fields, preserving declaration order
    pub fn new(fields: &[IndexField]) -> Self {
        let mut selected = Vec::new();
        for field in fields {
            if !selected.contains(field) {
                selected.push(*field);
            }
        }
        Self { fields: selected }
    }

    /// Build a mask from textual field names, rejecting unknown names
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut fields = Vec::with_capacity(names.len());
        for name in names {
            fields.push(name.as_ref().parse::<IndexField>()?);
        }
        Ok(Self::new(&fields))
    }

    /// Mask selecting every index field
    pub fn all() -> Self {
        Self::new(&IndexField::ALL)
    }

    pub fn contains(&self, field: IndexField) -> bool {
        self.fields.contains(&field)
    }

    pub fn fields(&self) -> &[IndexField] {
        &self.fields
    }
}

/// Snapshot of the index-field values of one image header
///
/// Comparisons consult only the fields selected by the mask supplied to
/// [`GroupingKey::differs_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupingKey {
    values: [u32; 9],
}

impl GroupingKey {
    pub fn from_header(header: &ImageHeader) -> Self {
        let mut values = [0u32; 9];
        for (slot, field) in values.iter_mut().zip(IndexField::ALL) {
            *slot = match field {
                IndexField::MeasurementUid => header.measurement_uid,
                IndexField::Average => header.average as u32,
                IndexField::Slice => header.slice as u32,
                IndexField::Contrast => header.contrast as u32,
                IndexField::Phase => header.phase as u32,
                IndexField::Repetition => header.repetition as u32,
                IndexField::Set => header.set as u32,
                IndexField::ImageType => header.image_type.to_wire() as u32,
                IndexField::ImageSeriesIndex => header.image_series_index as u32,
            };
        }
        Self { values }
    }

    fn value(&self, field: IndexField) -> u32 {
        let position = IndexField::ALL
            .iter()
            .position(|f| *f == field)
            .expect("field is in the fixed set");
        self.values[position]
    }

    /// Masked fields whose values differ between the two keys
    ///
    /// The returned names feed the flush diagnostics; equality under the mask
    /// is an empty difference.
    pub fn differs_from(&self, other: &GroupingKey, mask: &GroupingMask) -> Vec<IndexField> {
        mask.fields()
            .iter()
            .copied()
            .filter(|field| self.value(*field) != other.value(*field))
            .collect()
    }

    /// Equality restricted to the masked fields
    pub fn matches(&self, other: &GroupingKey, mask: &GroupingMask) -> bool {
        self.differs_from(other, mask).is_empty()
    }
}
