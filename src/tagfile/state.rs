use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::cells::{
    AutomaticsMode, GpsMode, MachineDirection, OnGroundState, PassTargets, VibrationState,
    NULL_AMPLITUDE, NULL_CCA, NULL_CCV, NULL_FREQUENCY, NULL_MATERIAL_TEMPERATURE, NULL_MDP,
};

/// Seconds GPS time runs ahead of UTC.
pub const GPS_LEAP_SECONDS: i64 = 18;

/// Start of GPS week 0: 1980-01-06T00:00:00Z, as Unix seconds.
const GPS_EPOCH_UNIX_SECONDS: i64 = 315_964_800;

const MILLIS_PER_WEEK: i64 = 7 * 24 * 60 * 60 * 1000;

/// UTC instant of `ms_of_week` into GPS week `week`.
pub fn gps_to_utc(week: u16, ms_of_week: u32) -> Option<DateTime<Utc>> {
    let gps_millis = week as i64 * MILLIS_PER_WEEK + ms_of_week as i64;
    let epoch = Utc.timestamp_opt(GPS_EPOCH_UNIX_SECONDS, 0).single()?;
    epoch.checked_add_signed(Duration::milliseconds(gps_millis - GPS_LEAP_SECONDS * 1000))
}

/// Which pair of machine points positions a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointSet {
    Blade = 0,
    Track = 1,
    Wheel = 2,
}

impl PointSet {
    /// Preference order when choosing a position for an epoch.
    pub const PRIORITY: [PointSet; 3] = [PointSet::Blade, PointSet::Track, PointSet::Wheel];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Easting,
    Northing,
    Height,
}

/// A 3D point whose ordinates may individually be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TagPoint {
    pub easting: Option<f64>,
    pub northing: Option<f64>,
    pub height: Option<f64>,
}

impl TagPoint {
    pub fn ordinate_mut(&mut self, axis: Axis) -> &mut Option<f64> {
        match axis {
            Axis::Easting => &mut self.easting,
            Axis::Northing => &mut self.northing,
            Axis::Height => &mut self.height,
        }
    }

    pub fn ordinate(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::Easting => self.easting,
            Axis::Northing => self.northing,
            Axis::Height => self.height,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.easting.is_some() && self.northing.is_some() && self.height.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointPair {
    pub left: TagPoint,
    pub right: TagPoint,
}

impl PointPair {
    pub fn side_mut(&mut self, side: Side) -> &mut TagPoint {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    /// Midpoint of the pair when all six ordinates are known.
    pub fn midpoint(&self) -> Option<(f64, f64, f64)> {
        let (l, r) = (&self.left, &self.right);
        Some((
            (l.easting? + r.easting?) / 2.0,
            (l.northing? + r.northing?) / 2.0,
            (l.height? + r.height?) / 2.0,
        ))
    }
}

/// Who produced a TAG file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineIdentity {
    pub machine_name: String,
    pub hardware_id: String,
    pub machine_type: u8,
    pub radio_serial: String,
    pub radio_type: String,
}

/// Measurements and machine modes in effect for the current epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochAttributes {
    pub ccv: i16,
    pub mdp: i16,
    pub cca: u8,
    pub temperature: u16,
    pub amplitude: u16,
    pub frequency: u16,
    pub gps_mode: GpsMode,
    pub valid_position: Option<bool>,
    pub direction: MachineDirection,
    pub layer: Option<u16>,
    pub vibration: VibrationState,
    pub automatics: AutomaticsMode,
    pub on_ground: OnGroundState,
    pub targets: PassTargets,
}

impl Default for EpochAttributes {
    fn default() -> Self {
        Self {
            ccv: NULL_CCV,
            mdp: NULL_MDP,
            cca: NULL_CCA,
            temperature: NULL_MATERIAL_TEMPERATURE,
            amplitude: NULL_AMPLITUDE,
            frequency: NULL_FREQUENCY,
            gps_mode: GpsMode::Unknown,
            valid_position: None,
            direction: MachineDirection::Unknown,
            layer: None,
            vibration: VibrationState::Invalid,
            automatics: AutomaticsMode::Unknown,
            on_ground: OnGroundState::Unknown,
            targets: PassTargets::default(),
        }
    }
}

/// Everything the value matchers have accumulated so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagProcessorState {
    pub gps_week: Option<u16>,
    pub gps_ms_of_week: Option<u32>,
    pub have_seen_a_time_value: bool,
    pub points: [PointPair; 3],
    pub identity: MachineIdentity,
    pub design_name: String,
    pub attributes: EpochAttributes,
}

impl TagProcessorState {
    /// UTC of the current epoch, when both week and time are known.
    pub fn current_time(&self) -> Option<DateTime<Utc>> {
        gps_to_utc(self.gps_week?, self.gps_ms_of_week?)
    }

    pub fn points(&self, set: PointSet) -> &PointPair {
        &self.points[set as usize]
    }

    pub fn points_mut(&mut self, set: PointSet) -> &mut PointPair {
        &mut self.points[set as usize]
    }

    /// The highest priority point set with every ordinate known.
    pub fn positioning_points(&self) -> Option<(PointSet, (f64, f64, f64))> {
        PointSet::PRIORITY
            .iter()
            .find_map(|set| self.points(*set).midpoint().map(|mid| (*set, mid)))
    }
}
