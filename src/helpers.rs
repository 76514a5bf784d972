//! Helper routines shared by capabilities
//!
//! Header translation from raw readouts to images, and the serialized
//! attribute list carried alongside every image.

use mrd::{AcquisitionHeader, ImageHeader, ImageType};

/// Populate image header fields from an acquisition header
///
/// Matrix size, channels and data type are set by the image constructor;
/// field of view must come from the session metadata, not from here.
pub fn image_header_from_raw(raw: &AcquisitionHeader) -> ImageHeader {
    let mut header = ImageHeader {
        version: raw.version,
        flags: raw.flags,
        measurement_uid: raw.measurement_uid,
        position: raw.position,
        read_dir: raw.read_dir,
        phase_dir: raw.phase_dir,
        slice_dir: raw.slice_dir,
        patient_table_position: raw.patient_table_position,
        average: raw.idx.average,
        slice: raw.idx.slice,
        contrast: raw.idx.contrast,
        phase: raw.idx.phase,
        repetition: raw.idx.repetition,
        set: raw.idx.set,
        acquisition_time_stamp: raw.acquisition_time_stamp,
        physiology_time_stamp: raw.physiology_time_stamp,
        ..Default::default()
    };
    // Defaults, to be updated by the capability
    header.image_type = ImageType::Magnitude;
    header.image_index = 1;
    header.image_series_index = 0;
    header
}

/// Ordered key/value attribute list, serialized in the image meta format
///
/// Values repeat for array-valued attributes. Parsing is forgiving: anything
/// outside `<meta>` elements is ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaAttributes {
    entries: Vec<(String, Vec<String>)>,
}

impl MetaAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the values stored under `name`
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => *values = vec![value],
            None => self.entries.push((name, vec![value])),
        }
    }

    /// Append one more value under `name`
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value.into()),
            None => self.entries.push((name, vec![value.into()])),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the attribute string stored on an image
    pub fn serialize(&self) -> String {
        let mut out = String::from("<ismrmrdMeta>");
        for (name, values) in &self.entries {
            out.push_str("<meta><name>");
            out.push_str(name);
            out.push_str("</name>");
            for value in values {
                out.push_str("<value>");
                out.push_str(value);
                out.push_str("</value>");
            }
            out.push_str("</meta>");
        }
        out.push_str("</ismrmrdMeta>");
        out
    }

    /// Parse an attribute string; unknown content is skipped
    pub fn deserialize(text: &str) -> Self {
        let mut attrs = Self::new();
        let mut rest = text;
        while let Some(start) = rest.find("<meta>") {
            let Some(end) = rest[start..].find("</meta>") else {
                break;
            };
            let element = &rest[start + 6..start + end];
            rest = &rest[start + end + 7..];

            let Some(name) = extract_between(element, "<name>", "</name>") else {
                continue;
            };
            let mut values = element;
            while let Some(value) = extract_between(values, "<value>", "</value>") {
                attrs.append(name, value);
                let consumed = values.find("</value>").unwrap() + 8;
                values = &values[consumed..];
            }
        }
        attrs
    }
}

fn extract_between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = start + text[start..].find(close)?;
    Some(&text[start..end])
}
