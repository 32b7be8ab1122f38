//! The cell pass: one timestamped measurement of one ground cell by one
//! machine.
//!
//! Cell passes are immutable once written. Every integer attribute has a
//! null sentinel so a pass can record "not measured" without an `Option`
//! per field, which keeps the fixed-width binary record below compact.
//!
//! # Record format
//!
//! ```text
//! +---------+-----------+--------+-----+-----+-----+-----+------+------+-------+
//! | time:i64| machine:u16|height:f32|ccv:i16|mdp:i16|cca:u8|amp:u16|freq:u16|temp:u16|
//! +---------+-----------+--------+-----+-----+-----+-----+------+------+-------+
//! | speed:u16 | gps:u8 | half:u8 | type:u8 | vibe:u8 | auto:u8 | ground:u8 | targets (14 bytes) |
//! +-----------+--------+---------+---------+---------+---------+-----------+-------------------+
//! ```
//!
//! All multi-byte fields are big-endian; time is milliseconds since the
//! Unix epoch.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::subgrid::CellAddress;

pub const NULL_HEIGHT: f32 = f32::MIN;
pub const NULL_CCV: i16 = i16::MAX;
pub const NULL_MDP: i16 = i16::MAX;
pub const NULL_CCA: u8 = u8::MAX;
pub const NULL_AMPLITUDE: u16 = u16::MAX;
pub const NULL_FREQUENCY: u16 = u16::MAX;
pub const NULL_MATERIAL_TEMPERATURE: u16 = 4096;
pub const NULL_MACHINE_SPEED: u16 = u16::MAX;
pub const NULL_PASS_COUNT: u16 = 0;
pub const NULL_MACHINE_ID: u16 = u16::MAX;

/// Size in bytes of one encoded cell pass.
pub const CELL_PASS_RECORD_SIZE: usize = 47;

macro_rules! u8_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(u8)]
        pub enum $name {
            #[default]
            $($variant = $value),+
        }

        impl $name {
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

u8_enum!(
    /// Positioning quality reported by the machine's GNSS receiver.
    GpsMode {
        Unknown = 15,
        Old = 0,
        Fixed = 1,
        Float = 2,
        Autonomous = 3,
        Differential = 4,
        Sbas = 5,
    }
);

u8_enum!(
    VibrationState {
        Invalid = 2,
        Off = 0,
        On = 1,
    }
);

u8_enum!(
    AutomaticsMode {
        Unknown = 255,
        Manual = 0,
        Automatic = 1,
    }
);

u8_enum!(
    OnGroundState {
        Unknown = 255,
        No = 0,
        Yes = 1,
    }
);

u8_enum!(
    /// Which part of the machine produced the pass.
    PassType {
        Front = 0,
        Rear = 1,
        Track = 2,
        Wheel = 3,
    }
);

u8_enum!(
    MachineDirection {
        Unknown = 255,
        Forward = 0,
        Reverse = 1,
    }
);

/// Target values active on the machine when the pass was captured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassTargets {
    pub ccv: i16,
    pub mdp: i16,
    pub pass_count: u16,
    pub lift_thickness: f32,
    pub temperature_min: u16,
    pub temperature_max: u16,
}

impl Default for PassTargets {
    fn default() -> Self {
        Self {
            ccv: NULL_CCV,
            mdp: NULL_MDP,
            pass_count: NULL_PASS_COUNT,
            lift_thickness: NULL_HEIGHT,
            temperature_min: NULL_MATERIAL_TEMPERATURE,
            temperature_max: NULL_MATERIAL_TEMPERATURE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellPass {
    pub time: DateTime<Utc>,
    pub machine_id: u16,
    pub height: f32,
    pub ccv: i16,
    pub mdp: i16,
    pub cca: u8,
    pub amplitude: u16,
    pub frequency: u16,
    /// Tenths of a degree Celsius
    pub material_temperature: u16,
    /// Centimetres per second
    pub machine_speed: u16,
    pub gps_mode: GpsMode,
    /// A half pass contributes one half to the cell's pass count
    pub half_pass: bool,
    pub pass_type: PassType,
    pub vibration: VibrationState,
    pub automatics: AutomaticsMode,
    pub on_ground: OnGroundState,
    pub targets: PassTargets,
}

impl CellPass {
    /// A pass at `time` with every measurement null.
    pub fn null_at(time: DateTime<Utc>) -> Self {
        Self {
            time,
            machine_id: NULL_MACHINE_ID,
            height: NULL_HEIGHT,
            ccv: NULL_CCV,
            mdp: NULL_MDP,
            cca: NULL_CCA,
            amplitude: NULL_AMPLITUDE,
            frequency: NULL_FREQUENCY,
            material_temperature: NULL_MATERIAL_TEMPERATURE,
            machine_speed: NULL_MACHINE_SPEED,
            gps_mode: GpsMode::Unknown,
            half_pass: false,
            pass_type: PassType::Front,
            vibration: VibrationState::Invalid,
            automatics: AutomaticsMode::Unknown,
            on_ground: OnGroundState::Unknown,
            targets: PassTargets::default(),
        }
    }

    pub fn pass_count_contribution(&self) -> f32 {
        if self.half_pass {
            0.5
        } else {
            1.0
        }
    }

    pub fn has_height(&self) -> bool {
        self.height != NULL_HEIGHT
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_i64::<BigEndian>(self.time.timestamp_millis()).unwrap();
        buf.write_u16::<BigEndian>(self.machine_id).unwrap();
        buf.write_f32::<BigEndian>(self.height).unwrap();
        buf.write_i16::<BigEndian>(self.ccv).unwrap();
        buf.write_i16::<BigEndian>(self.mdp).unwrap();
        buf.write_u8(self.cca).unwrap();
        buf.write_u16::<BigEndian>(self.amplitude).unwrap();
        buf.write_u16::<BigEndian>(self.frequency).unwrap();
        buf.write_u16::<BigEndian>(self.material_temperature).unwrap();
        buf.write_u16::<BigEndian>(self.machine_speed).unwrap();
        buf.write_u8(self.gps_mode as u8).unwrap();
        buf.write_u8(self.half_pass as u8).unwrap();
        buf.write_u8(self.pass_type as u8).unwrap();
        buf.write_u8(self.vibration as u8).unwrap();
        buf.write_u8(self.automatics as u8).unwrap();
        buf.write_u8(self.on_ground as u8).unwrap();

        buf.write_i16::<BigEndian>(self.targets.ccv).unwrap();
        buf.write_i16::<BigEndian>(self.targets.mdp).unwrap();
        buf.write_u16::<BigEndian>(self.targets.pass_count).unwrap();
        buf.write_f32::<BigEndian>(self.targets.lift_thickness).unwrap();
        buf.write_u16::<BigEndian>(self.targets.temperature_min).unwrap();
        buf.write_u16::<BigEndian>(self.targets.temperature_max).unwrap();
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let millis = cursor.read_i64::<BigEndian>()?;
        let time = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| Error::Decode(format!("cell pass time {}", millis)))?;

        let machine_id = cursor.read_u16::<BigEndian>()?;
        let height = cursor.read_f32::<BigEndian>()?;
        let ccv = cursor.read_i16::<BigEndian>()?;
        let mdp = cursor.read_i16::<BigEndian>()?;
        let cca = cursor.read_u8()?;
        let amplitude = cursor.read_u16::<BigEndian>()?;
        let frequency = cursor.read_u16::<BigEndian>()?;
        let material_temperature = cursor.read_u16::<BigEndian>()?;
        let machine_speed = cursor.read_u16::<BigEndian>()?;
        let gps_mode = decode_enum(cursor.read_u8()?, GpsMode::from_u8, "gps mode")?;
        let half_pass = cursor.read_u8()? != 0;
        let pass_type = decode_enum(cursor.read_u8()?, PassType::from_u8, "pass type")?;
        let vibration = decode_enum(cursor.read_u8()?, VibrationState::from_u8, "vibration")?;
        let automatics = decode_enum(cursor.read_u8()?, AutomaticsMode::from_u8, "automatics")?;
        let on_ground = decode_enum(cursor.read_u8()?, OnGroundState::from_u8, "on ground")?;

        let targets = PassTargets {
            ccv: cursor.read_i16::<BigEndian>()?,
            mdp: cursor.read_i16::<BigEndian>()?,
            pass_count: cursor.read_u16::<BigEndian>()?,
            lift_thickness: cursor.read_f32::<BigEndian>()?,
            temperature_min: cursor.read_u16::<BigEndian>()?,
            temperature_max: cursor.read_u16::<BigEndian>()?,
        };

        Ok(Self {
            time,
            machine_id,
            height,
            ccv,
            mdp,
            cca,
            amplitude,
            frequency,
            material_temperature,
            machine_speed,
            gps_mode,
            half_pass,
            pass_type,
            vibration,
            automatics,
            on_ground,
            targets,
        })
    }
}

fn decode_enum<T>(value: u8, from: fn(u8) -> Option<T>, what: &str) -> Result<T> {
    from(value).ok_or_else(|| Error::Decode(format!("{} value {}", what, value)))
}

/// A committed pass together with the cell it lands in and the world
/// position it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedCellPass {
    pub cell: CellAddress,
    pub easting: f64,
    pub northing: f64,
    pub pass: CellPass,
}

/// Test helper: a front pass with a height and machine 0 at `millis`.
#[cfg(test)]
pub(crate) fn pass_at(millis: i64, height: f32) -> CellPass {
    let mut pass = CellPass::null_at(DateTime::from_timestamp_millis(millis).unwrap());
    pass.machine_id = 0;
    pass.height = height;
    pass
}
