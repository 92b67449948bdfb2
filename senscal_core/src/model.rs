//! Calibration vocabulary and the persisted calibration map.
//!
//! Every enum here is persisted by an explicit string tag (see `as_str`), never
//! by ordinal, so reordering variants cannot corrupt stored data. Declaration
//! order of `CalibrationGroup` still matters: it is the order in which groups
//! are attempted.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use senscal_traits::{SensorId, SensorKind, SensorLocation, WorkflowStore};
use serde_json::{Map, Value};

use crate::error::{CalibError, Result};
use crate::store::{WorkflowStoreExt, keys};

/// A physical part that takes part in the repair workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    Unknown,
    BaseAccelerometer,
    LidAccelerometer,
    BaseGyroscope,
    LidGyroscope,
    // Tracked by the wider repair workflow, never calibrated here.
    Battery,
    Camera,
    Keyboard,
    Touchpad,
}

impl Component {
    pub const ALL: [Self; 9] = [
        Self::Unknown,
        Self::BaseAccelerometer,
        Self::LidAccelerometer,
        Self::BaseGyroscope,
        Self::LidGyroscope,
        Self::Battery,
        Self::Camera,
        Self::Keyboard,
        Self::Touchpad,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::BaseAccelerometer => "base_accelerometer",
            Self::LidAccelerometer => "lid_accelerometer",
            Self::BaseGyroscope => "base_gyroscope",
            Self::LidGyroscope => "lid_gyroscope",
            Self::Battery => "battery",
            Self::Camera => "camera",
            Self::Keyboard => "keyboard",
            Self::Touchpad => "touchpad",
        }
    }

    /// Component backed by a probed motion sensor.
    pub fn from_sensor(id: SensorId) -> Self {
        match (id.kind, id.location) {
            (SensorKind::Accelerometer, SensorLocation::Base) => Self::BaseAccelerometer,
            (SensorKind::Accelerometer, SensorLocation::Lid) => Self::LidAccelerometer,
            (SensorKind::Gyroscope, SensorLocation::Base) => Self::BaseGyroscope,
            (SensorKind::Gyroscope, SensorLocation::Lid) => Self::LidGyroscope,
        }
    }

    /// Inverse of `from_sensor`; `None` for components that are not motion sensors.
    pub fn sensor(self) -> Option<SensorId> {
        let (kind, location) = match self {
            Self::BaseAccelerometer => (SensorKind::Accelerometer, SensorLocation::Base),
            Self::LidAccelerometer => (SensorKind::Accelerometer, SensorLocation::Lid),
            Self::BaseGyroscope => (SensorKind::Gyroscope, SensorLocation::Base),
            Self::LidGyroscope => (SensorKind::Gyroscope, SensorLocation::Lid),
            _ => return None,
        };
        Some(SensorId::new(kind, location))
    }
}

impl FromStr for Component {
    type Err = CalibError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CalibError::InvalidComponent(s.to_owned()))
    }
}

/// Per-component calibration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CalibrationStatus {
    /// Never a legal persisted value.
    Unknown,
    Waiting,
    InProgress,
    Complete,
    Failed,
    Skip,
}

impl CalibrationStatus {
    pub const ALL: [Self; 6] = [
        Self::Unknown,
        Self::Waiting,
        Self::InProgress,
        Self::Complete,
        Self::Failed,
        Self::Skip,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Waiting => "waiting",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Skip => "skip",
        }
    }

    /// Status implied by a calibration progress value.
    ///
    /// `>= 1.0` is complete, negative is failed, anything else is in progress.
    pub fn from_progress(progress: f64) -> Self {
        if progress >= 1.0 {
            Self::Complete
        } else if progress < 0.0 {
            Self::Failed
        } else {
            Self::InProgress
        }
    }
}

impl FromStr for CalibrationStatus {
    type Err = CalibError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CalibError::InvalidStatus(s.to_owned()))
    }
}

/// The physical placement step shared by a set of components, plus sentinels.
///
/// Variants are ordered: the lowest real group with pending work runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CalibrationGroup {
    Unknown,
    /// The map has not been initialized or could not be read.
    NeedToCheck,
    PlaceBaseOnFlatSurface,
    PlaceLidOnFlatSurface,
    /// Nothing left to calibrate.
    NoNeedCalibration,
}

impl CalibrationGroup {
    pub const ALL: [Self; 5] = [
        Self::Unknown,
        Self::NeedToCheck,
        Self::PlaceBaseOnFlatSurface,
        Self::PlaceLidOnFlatSurface,
        Self::NoNeedCalibration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::NeedToCheck => "need_to_check",
            Self::PlaceBaseOnFlatSurface => "place_base_on_flat_surface",
            Self::PlaceLidOnFlatSurface => "place_lid_on_flat_surface",
            Self::NoNeedCalibration => "no_need_calibration",
        }
    }

    pub fn is_sentinel(self) -> bool {
        matches!(
            self,
            Self::Unknown | Self::NeedToCheck | Self::NoNeedCalibration
        )
    }

    /// Operator-facing instruction for the placement step.
    pub fn instruction(self) -> &'static str {
        match self {
            Self::PlaceBaseOnFlatSurface => {
                "Place the base of the device on a flat, stable surface and keep it still."
            }
            Self::PlaceLidOnFlatSurface => {
                "Open the device fully, lay the lid on a flat, stable surface and keep it still."
            }
            Self::NeedToCheck => "Calibration state must be re-checked.",
            Self::NoNeedCalibration => "No calibration needed.",
            Self::Unknown => "Unknown calibration step.",
        }
    }
}

impl FromStr for CalibrationGroup {
    type Err = CalibError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CalibError::InvalidGroup(s.to_owned()))
    }
}

macro_rules! tagged_enum_impls {
    ($($ty:ty),+) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
                let tag = String::deserialize(d)?;
                tag.parse().map_err(serde::de::Error::custom)
            }
        }
    )+};
}

tagged_enum_impls!(Component, CalibrationStatus, CalibrationGroup);

/// Static grouping table: the only place that says which step a sensor belongs to.
const GROUPING: [(Component, CalibrationGroup); 4] = [
    (
        Component::BaseAccelerometer,
        CalibrationGroup::PlaceBaseOnFlatSurface,
    ),
    (
        Component::BaseGyroscope,
        CalibrationGroup::PlaceBaseOnFlatSurface,
    ),
    (
        Component::LidAccelerometer,
        CalibrationGroup::PlaceLidOnFlatSurface,
    ),
    (
        Component::LidGyroscope,
        CalibrationGroup::PlaceLidOnFlatSurface,
    ),
];

#[inline]
fn lookup_group(component: Component) -> Option<CalibrationGroup> {
    GROUPING
        .iter()
        .find(|(c, _)| *c == component)
        .map(|(_, g)| *g)
}

/// True iff `component` appears in the grouping table.
pub fn is_valid_component(component: Component) -> bool {
    lookup_group(component).is_some()
}

/// Group of a calibratable component; `Unknown` (with a warning) otherwise.
pub fn group_of(component: Component) -> CalibrationGroup {
    lookup_group(component).unwrap_or_else(|| {
        tracing::warn!(%component, "component is not calibratable");
        CalibrationGroup::Unknown
    })
}

/// Components listed in the grouping table.
pub fn calibratable_components() -> impl Iterator<Item = Component> {
    GROUPING.iter().map(|(c, _)| *c)
}

/// Work remains unless the component is complete or skipped.
pub fn should_calibrate(status: CalibrationStatus) -> bool {
    matches!(
        status,
        CalibrationStatus::Waiting | CalibrationStatus::InProgress | CalibrationStatus::Failed
    )
}

pub fn should_calibrate_component(component: Component, status: CalibrationStatus) -> bool {
    if !is_valid_component(component) || status == CalibrationStatus::Unknown {
        return false;
    }
    should_calibrate(status)
}

/// `group -> (component -> status)`: the only durable state of the subsystem.
///
/// Mutators uphold the invariants `load` checks: no `Unknown` status, only
/// calibratable components, each filed under its table group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalibrationMap {
    groups: BTreeMap<CalibrationGroup, BTreeMap<Component, CalibrationStatus>>,
}

impl CalibrationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted map. Fails as a whole on any invalid entry.
    pub fn load(store: &dyn WorkflowStore) -> Result<Self> {
        let value: Value = store
            .get(keys::CALIBRATION_MAP)
            .map_err(|e| CalibError::Malformed(e.to_string()))?
            .ok_or(CalibError::MapMissing)?;
        Self::from_value(&value)
    }

    /// Like `load`, but a map that was never written is empty rather than an error.
    pub fn load_or_empty(store: &dyn WorkflowStore) -> Result<Self> {
        match Self::load(store) {
            Err(CalibError::MapMissing) => Ok(Self::new()),
            other => other,
        }
    }

    pub fn store(&self, store: &dyn WorkflowStore) -> Result<()> {
        store.set(keys::CALIBRATION_MAP, &self.to_value())?;
        Ok(())
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(groups) = value else {
            return Err(CalibError::Malformed(
                "expected an object keyed by group".into(),
            ));
        };

        let mut map = Self::new();
        for (group_tag, components) in groups {
            let group: CalibrationGroup = group_tag.parse()?;
            let Value::Object(components) = components else {
                return Err(CalibError::Malformed(format!(
                    "group `{group_tag}` is not an object"
                )));
            };
            let mut entries = BTreeMap::new();
            for (component_tag, status) in components {
                let component: Component = component_tag.parse()?;
                let status: CalibrationStatus = status
                    .as_str()
                    .ok_or_else(|| {
                        CalibError::Malformed(format!("status of `{component_tag}` is not a string"))
                    })?
                    .parse()?;
                let Some(expected) = lookup_group(component) else {
                    return Err(CalibError::NotCalibratable(component));
                };
                if status == CalibrationStatus::Unknown {
                    return Err(CalibError::UnknownStatus(component));
                }
                if expected != group {
                    return Err(CalibError::WrongGroup {
                        component,
                        found: group,
                        expected,
                    });
                }
                entries.insert(component, status);
            }
            if !entries.is_empty() {
                map.groups.insert(group, entries);
            }
        }
        Ok(map)
    }

    pub fn to_value(&self) -> Value {
        let groups: Map<String, Value> = self
            .groups
            .iter()
            .map(|(group, components)| {
                let inner: Map<String, Value> = components
                    .iter()
                    .map(|(c, s)| (c.as_str().to_owned(), Value::from(s.as_str())))
                    .collect();
                (group.as_str().to_owned(), Value::Object(inner))
            })
            .collect();
        Value::Object(groups)
    }

    pub fn status(&self, component: Component) -> Option<CalibrationStatus> {
        let group = lookup_group(component)?;
        self.groups.get(&group)?.get(&component).copied()
    }

    pub fn contains(&self, component: Component) -> bool {
        self.status(component).is_some()
    }

    /// Record `status` for `component`, returning the previous status.
    pub fn set_status(
        &mut self,
        component: Component,
        status: CalibrationStatus,
    ) -> Result<Option<CalibrationStatus>> {
        let group = lookup_group(component).ok_or(CalibError::NotCalibratable(component))?;
        if status == CalibrationStatus::Unknown {
            return Err(CalibError::UnknownStatus(component));
        }
        Ok(self
            .groups
            .entry(group)
            .or_default()
            .insert(component, status))
    }

    /// Add every calibratable component not yet tracked as `Waiting`.
    /// Tracked components keep their status. Returns the newly added ones.
    pub fn insert_probed(&mut self, components: impl IntoIterator<Item = Component>) -> Vec<Component> {
        let mut added = Vec::new();
        for component in components {
            let Some(group) = lookup_group(component) else {
                continue;
            };
            let entries = self.groups.entry(group).or_default();
            if !entries.contains_key(&component) {
                entries.insert(component, CalibrationStatus::Waiting);
                added.push(component);
            }
        }
        added
    }

    /// Force `InProgress`/`Unknown` entries to `Failed`. These only exist
    /// legitimately while calibration is running, so finding them means the
    /// previous session was interrupted.
    pub fn fail_interrupted(&mut self) -> Vec<Component> {
        let mut failed = Vec::new();
        for components in self.groups.values_mut() {
            for (component, status) in components.iter_mut() {
                if matches!(
                    status,
                    CalibrationStatus::InProgress | CalibrationStatus::Unknown
                ) {
                    *status = CalibrationStatus::Failed;
                    failed.push(*component);
                }
            }
        }
        failed
    }

    /// Put the `Failed` components of `group` back to `Waiting` for another attempt.
    pub fn rearm_failed(&mut self, group: CalibrationGroup) -> Vec<Component> {
        let mut rearmed = Vec::new();
        if let Some(components) = self.groups.get_mut(&group) {
            for (component, status) in components.iter_mut() {
                if *status == CalibrationStatus::Failed {
                    *status = CalibrationStatus::Waiting;
                    rearmed.push(*component);
                }
            }
        }
        rearmed
    }

    /// Components and statuses filed under `group`.
    pub fn group(
        &self,
        group: CalibrationGroup,
    ) -> impl Iterator<Item = (Component, CalibrationStatus)> + '_ {
        self.groups
            .get(&group)
            .into_iter()
            .flat_map(|components| components.iter().map(|(c, s)| (*c, *s)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (CalibrationGroup, Component, CalibrationStatus)> + '_ {
        self.groups.iter().flat_map(|(group, components)| {
            components.iter().map(move |(c, s)| (*group, *c, *s))
        })
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lowest group that still has a component needing calibration, or
    /// `NoNeedCalibration`. Pure function of the statuses.
    pub fn current_group(&self) -> CalibrationGroup {
        self.groups
            .iter()
            .find(|(_, components)| {
                components
                    .iter()
                    .any(|(c, s)| should_calibrate_component(*c, *s))
            })
            .map_or(CalibrationGroup::NoNeedCalibration, |(group, _)| *group)
    }
}

/// Current group of the persisted map; `NeedToCheck` when the map is missing
/// or cannot be read.
pub fn current_group_in(store: &dyn WorkflowStore) -> CalibrationGroup {
    match CalibrationMap::load(store) {
        Ok(map) => map.current_group(),
        Err(e) => {
            tracing::debug!(error = %e, "calibration map unavailable");
            CalibrationGroup::NeedToCheck
        }
    }
}
