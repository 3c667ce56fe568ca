//! Axis and button code mapping
//!
//! Configured names (`ABS_X`, `BTN_SOUTH`, ...) are resolved once against the
//! device capabilities. The output arrays keep one slot per configured name,
//! so a name that cannot be resolved leaves a slot that stays at zero.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::device::codes::{self, EV_ABS, EV_KEY};
use crate::device::{Capabilities, InputEvent};

/// `value / abs_max`; a zero range is treated as 1.
pub fn normalize(value: i32, abs_max: i32) -> f32 {
    let abs_max = if abs_max == 0 { 1 } else { abs_max };
    (f64::from(value) / f64::from(abs_max)) as f32
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AxisMapping {
    indices: BTreeMap<u16, usize>,
    abs_max: BTreeMap<u16, i32>,
    len: usize,
}

impl AxisMapping {
    pub fn build(names: &[String], capabilities: &Capabilities) -> Self {
        let mut mapping = Self {
            len: names.len(),
            ..Self::default()
        };

        for (index, name) in names.iter().enumerate() {
            let Some(code) = codes::code_from_name(EV_ABS, name) else {
                warn!(
                    "There is no axis event (EV_ABS) '{}'. Skipping this axis!",
                    name
                );
                continue;
            };
            let Some(info) = capabilities.abs_info(code) else {
                warn!(
                    "Device '{}' does not report axis '{}'. Skipping this axis!",
                    capabilities.name, name
                );
                continue;
            };

            let abs_max = info.minimum.unsigned_abs().max(info.maximum.unsigned_abs());
            if abs_max == 0 {
                warn!(
                    "Axis '{}' reports an empty range [{}, {}]. Skipping this axis!",
                    name, info.minimum, info.maximum
                );
                continue;
            }
            if mapping.indices.contains_key(&code) {
                warn!(
                    "Axis '{}' is configured twice, keeping output index {}",
                    name, mapping.indices[&code]
                );
                continue;
            }

            debug!(
                "Axis {} -> index {} (range [{}, {}])",
                name, index, info.minimum, info.maximum
            );
            mapping.indices.insert(code, index);
            // i32::MIN has no positive counterpart
            mapping
                .abs_max
                .insert(code, i32::try_from(abs_max).unwrap_or(i32::MAX));
        }

        mapping
    }

    /// Number of output slots, one per configured name.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mapped(&self) -> usize {
        self.indices.len()
    }

    pub fn index_of(&self, code: u16) -> Option<usize> {
        self.indices.get(&code).copied()
    }

    pub fn abs_max(&self, code: u16) -> Option<i32> {
        self.abs_max.get(&code).copied()
    }

    /// Output index and normalized value for a raw axis reading.
    pub fn normalize(&self, code: u16, value: i32) -> Option<(usize, f32)> {
        let index = self.index_of(code)?;
        let abs_max = self.abs_max(code)?;
        Some((index, normalize(value, abs_max)))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ButtonMapping {
    indices: BTreeMap<u16, usize>,
    len: usize,
}

impl ButtonMapping {
    pub fn build(names: &[String], capabilities: &Capabilities) -> Self {
        let mut mapping = Self {
            len: names.len(),
            ..Self::default()
        };

        for (index, name) in names.iter().enumerate() {
            let Some(code) = codes::code_from_name(EV_KEY, name) else {
                warn!(
                    "There is no button event (EV_KEY) '{}'. Skipping this button!",
                    name
                );
                continue;
            };
            if !capabilities.has_key(code) {
                warn!(
                    "Device '{}' does not report button '{}'. Skipping this button!",
                    capabilities.name, name
                );
                continue;
            }
            if mapping.indices.contains_key(&code) {
                warn!(
                    "Button '{}' is configured twice, keeping output index {}",
                    name, mapping.indices[&code]
                );
                continue;
            }

            debug!("Button {} -> index {}", name, index);
            mapping.indices.insert(code, index);
        }

        mapping
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mapped(&self) -> usize {
        self.indices.len()
    }

    pub fn index_of(&self, code: u16) -> Option<usize> {
        self.indices.get(&code).copied()
    }
}

/// Where a mapped event lands in the snapshot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MappedValue {
    Axis { index: usize, value: f32 },
    Button { index: usize, value: i32 },
}

/// Both mappings, built together from one capability descriptor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodeMapper {
    pub axes: AxisMapping,
    pub buttons: ButtonMapping,
}

impl CodeMapper {
    pub fn build(axis_names: &[String], button_names: &[String], capabilities: &Capabilities) -> Self {
        if capabilities.has_axes() {
            info!("Looks like a controller with axes!");
        }
        if capabilities.has_buttons() {
            info!("Looks like a controller with buttons!");
        }

        let axes = AxisMapping::build(axis_names, capabilities);
        let buttons = ButtonMapping::build(button_names, capabilities);
        info!(
            "Mapped {}/{} axes and {}/{} buttons",
            axes.mapped(),
            axes.len(),
            buttons.mapped(),
            buttons.len()
        );

        Self { axes, buttons }
    }

    /// Unmapped codes and other event types yield `None`.
    pub fn map(&self, event: &InputEvent) -> Option<MappedValue> {
        match event.kind {
            EV_ABS => self
                .axes
                .normalize(event.code, event.value)
                .map(|(index, value)| MappedValue::Axis { index, value }),
            // key repeat (2) still means pressed
            EV_KEY => self.buttons.index_of(event.code).map(|index| MappedValue::Button {
                index,
                value: i32::from(event.value != 0),
            }),
            _ => None,
        }
    }
}
