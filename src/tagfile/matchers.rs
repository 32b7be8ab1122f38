//! Value matchers: per-name handlers that fold TAG values into processor
//! state.
//!
//! The registry is an explicit table from dictionary name to a shared
//! matcher instance. Names that differ only by side or axis share one
//! instance, which reads the side and axis back out of the name:
//!
//! ```text
//!  "LEB" ─┐
//!  "RNB" ─┼──► OrdinateMatcher(Blade)    name[0] = L|R, name[1] = E|N|H
//!  "RHB" ─┘
//!  "TIME" ───► TimeMatcher               absolute or 10 ms increments
//!  "CCV"  ───► AttributeMatcher(Ccv)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use super::state::{gps_to_utc, Axis, PointSet, Side, TagProcessorState};
use super::{TagDataType, TagDictionaryEntry};
use crate::cells::{
    AutomaticsMode, GpsMode, MachineDirection, OnGroundState, PassTargets, VibrationState,
    NULL_AMPLITUDE, NULL_CCA, NULL_CCV, NULL_FREQUENCY, NULL_HEIGHT, NULL_MATERIAL_TEMPERATURE,
    NULL_MDP, NULL_PASS_COUNT,
};

const MILLIS_PER_WEEK: u64 = 7 * 24 * 60 * 60 * 1000;

/// Units of relative TIME values.
const TIME_INCREMENT_MILLIS: u64 = 10;

/// What a matcher mutates.
pub trait ValueMatcherTarget {
    fn state(&self) -> &TagProcessorState;

    fn state_mut(&mut self) -> &mut TagProcessorState;

    /// Commits the epoch accumulated so far. Called just before time
    /// advances and once more when the stream ends.
    fn process_epoch_context(&mut self);
}

/// Handles the values of one or more dictionary names. Each method returns
/// `false` when the matcher does not accept that payload type.
pub trait ValueMatcher: Send + Sync {
    fn process_empty(&self, _entry: &TagDictionaryEntry, _target: &mut dyn ValueMatcherTarget) -> bool {
        false
    }

    fn process_integer(
        &self,
        _entry: &TagDictionaryEntry,
        _value: i32,
        _target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        false
    }

    fn process_unsigned(
        &self,
        _entry: &TagDictionaryEntry,
        _value: u32,
        _target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        false
    }

    fn process_single(
        &self,
        _entry: &TagDictionaryEntry,
        _value: f32,
        _target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        false
    }

    fn process_double(
        &self,
        _entry: &TagDictionaryEntry,
        _value: f64,
        _target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        false
    }

    fn process_ansi(
        &self,
        _entry: &TagDictionaryEntry,
        _value: &[u8],
        _target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        false
    }

    fn process_unicode(
        &self,
        _entry: &TagDictionaryEntry,
        _value: &str,
        _target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatcherKind {
    Time,
    Week,
    Ordinates(PointSet),
    Attr(Attribute),
    Ident(IdentityField),
}

use Attribute as A;
use IdentityField as I;
use MatcherKind::*;

const STANDARD_TABLE: &[(&str, MatcherKind)] = &[
    ("TIME", Time),
    ("WEEK", Week),
    ("LEB", Ordinates(PointSet::Blade)),
    ("LNB", Ordinates(PointSet::Blade)),
    ("LHB", Ordinates(PointSet::Blade)),
    ("REB", Ordinates(PointSet::Blade)),
    ("RNB", Ordinates(PointSet::Blade)),
    ("RHB", Ordinates(PointSet::Blade)),
    ("LET", Ordinates(PointSet::Track)),
    ("LNT", Ordinates(PointSet::Track)),
    ("LHT", Ordinates(PointSet::Track)),
    ("RET", Ordinates(PointSet::Track)),
    ("RNT", Ordinates(PointSet::Track)),
    ("RHT", Ordinates(PointSet::Track)),
    ("LEW", Ordinates(PointSet::Wheel)),
    ("LNW", Ordinates(PointSet::Wheel)),
    ("LHW", Ordinates(PointSet::Wheel)),
    ("REW", Ordinates(PointSet::Wheel)),
    ("RNW", Ordinates(PointSet::Wheel)),
    ("RHW", Ordinates(PointSet::Wheel)),
    ("GPSMODE", Attr(A::GpsMode)),
    ("VALID_POS", Attr(A::ValidPosition)),
    ("CCV", Attr(A::Ccv)),
    ("MDP", Attr(A::Mdp)),
    ("CCA", Attr(A::Cca)),
    ("TEMP", Attr(A::Temperature)),
    ("FREQ", Attr(A::Frequency)),
    ("AMP", Attr(A::Amplitude)),
    ("VIBE", Attr(A::Vibration)),
    ("AUTO", Attr(A::Automatics)),
    ("ON_GROUND", Attr(A::OnGround)),
    ("DIRECTION", Attr(A::Direction)),
    ("LAYER", Attr(A::Layer)),
    ("TGT_CCV", Attr(A::TargetCcv)),
    ("TGT_MDP", Attr(A::TargetMdp)),
    ("TGT_PASSES", Attr(A::TargetPasses)),
    ("TGT_LIFT", Attr(A::TargetLift)),
    ("TEMP_MIN", Attr(A::TemperatureMin)),
    ("TEMP_MAX", Attr(A::TemperatureMax)),
    ("MACHINE", Ident(I::MachineName)),
    ("HWID", Ident(I::HardwareId)),
    ("MACHINE_TYPE", Ident(I::MachineType)),
    ("RADIO_SERIAL", Ident(I::RadioSerial)),
    ("RADIO_TYPE", Ident(I::RadioType)),
    ("DESIGN", Ident(I::Design)),
];

/// Dictionary name to matcher.
#[derive(Clone, Default)]
pub struct MatcherRegistry {
    matchers: HashMap<String, Arc<dyn ValueMatcher>>,
}

impl MatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard machine value types.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        let time: Arc<dyn ValueMatcher> = Arc::new(TimeMatcher);
        let week: Arc<dyn ValueMatcher> = Arc::new(WeekMatcher);
        let ordinates: [Arc<dyn ValueMatcher>; 3] = [
            Arc::new(OrdinateMatcher::new(PointSet::Blade)),
            Arc::new(OrdinateMatcher::new(PointSet::Track)),
            Arc::new(OrdinateMatcher::new(PointSet::Wheel)),
        ];

        for (name, kind) in STANDARD_TABLE {
            let matcher: Arc<dyn ValueMatcher> = match kind {
                Time => time.clone(),
                Week => week.clone(),
                Ordinates(set) => ordinates[*set as usize].clone(),
                Attr(attribute) => Arc::new(AttributeMatcher(*attribute)),
                Ident(field) => Arc::new(IdentityMatcher(*field)),
            };
            registry.register(*name, matcher);
        }
        registry
    }

    /// Adds or replaces the matcher for `name`.
    pub fn register(&mut self, name: impl Into<String>, matcher: Arc<dyn ValueMatcher>) {
        self.matchers.insert(name.into(), matcher);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ValueMatcher>> {
        self.matchers.get(name)
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}

/// TIME: absolute GPS milliseconds of week as `UInt32`, otherwise an
/// increment in units of 10 ms.
struct TimeMatcher;

impl TimeMatcher {
    fn advance(target: &mut dyn ValueMatcherTarget, ms_of_week: Option<u32>) {
        if target.state().have_seen_a_time_value {
            target.process_epoch_context();
        }
        let state = target.state_mut();
        state.gps_ms_of_week = ms_of_week;
        state.have_seen_a_time_value = true;
    }
}

impl ValueMatcher for TimeMatcher {
    fn process_unsigned(
        &self,
        entry: &TagDictionaryEntry,
        value: u32,
        target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        if entry.data_type == TagDataType::UInt32 {
            TimeMatcher::advance(target, Some(value));
            return true;
        }

        let state = target.state();
        let next = state.gps_ms_of_week.map(|current| {
            current as u64 + value as u64 * TIME_INCREMENT_MILLIS
        });
        match next {
            Some(millis) if millis >= MILLIS_PER_WEEK => {
                TimeMatcher::advance(target, Some((millis - MILLIS_PER_WEEK) as u32));
                let state = target.state_mut();
                state.gps_week = state.gps_week.map(|week| week.saturating_add(1));
            }
            Some(millis) => TimeMatcher::advance(target, Some(millis as u32)),
            // An increment with no absolute base cannot place the epoch
            None => {}
        }
        true
    }

    fn process_empty(&self, _entry: &TagDictionaryEntry, target: &mut dyn ValueMatcherTarget) -> bool {
        TimeMatcher::advance(target, None);
        true
    }
}

struct WeekMatcher;

impl ValueMatcher for WeekMatcher {
    fn process_unsigned(
        &self,
        _entry: &TagDictionaryEntry,
        value: u32,
        target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        match u16::try_from(value) {
            Ok(week) if gps_to_utc(week, 0).is_some() => {
                target.state_mut().gps_week = Some(week);
                true
            }
            _ => false,
        }
    }
}

/// Integer values are millimetre deltas against the current value and are
/// ignored while it is unknown.
pub fn apply_ordinate_delta(current: &mut Option<f64>, delta_mm: i32) {
    if let Some(value) = current.as_mut() {
        *value += delta_mm as f64 / 1000.0;
    }
}

/// The six ordinates of one point set. Side and axis come from the first
/// two characters of the name.
pub struct OrdinateMatcher {
    set: PointSet,
}

impl OrdinateMatcher {
    pub fn new(set: PointSet) -> Self {
        Self { set }
    }

    fn ordinate<'a>(
        &self,
        entry: &TagDictionaryEntry,
        state: &'a mut TagProcessorState,
    ) -> Option<&'a mut Option<f64>> {
        let mut chars = entry.name.chars();
        let side = match chars.next()? {
            'L' => Side::Left,
            'R' => Side::Right,
            _ => return None,
        };
        let axis = match chars.next()? {
            'E' => Axis::Easting,
            'N' => Axis::Northing,
            'H' => Axis::Height,
            _ => return None,
        };
        Some(state.points_mut(self.set).side_mut(side).ordinate_mut(axis))
    }
}

impl ValueMatcher for OrdinateMatcher {
    fn process_integer(
        &self,
        entry: &TagDictionaryEntry,
        value: i32,
        target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        match self.ordinate(entry, target.state_mut()) {
            Some(ordinate) => {
                apply_ordinate_delta(ordinate, value);
                true
            }
            None => false,
        }
    }

    fn process_double(
        &self,
        entry: &TagDictionaryEntry,
        value: f64,
        target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        match self.ordinate(entry, target.state_mut()) {
            Some(ordinate) => {
                *ordinate = Some(value);
                true
            }
            None => false,
        }
    }

    fn process_single(
        &self,
        entry: &TagDictionaryEntry,
        value: f32,
        target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        self.process_double(entry, value as f64, target)
    }

    fn process_empty(&self, entry: &TagDictionaryEntry, target: &mut dyn ValueMatcherTarget) -> bool {
        match self.ordinate(entry, target.state_mut()) {
            Some(ordinate) => {
                *ordinate = None;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attribute {
    GpsMode,
    ValidPosition,
    Ccv,
    Mdp,
    Cca,
    Temperature,
    Frequency,
    Amplitude,
    Vibration,
    Automatics,
    OnGround,
    Direction,
    Layer,
    TargetCcv,
    TargetMdp,
    TargetPasses,
    TargetLift,
    TemperatureMin,
    TemperatureMax,
}

/// One integer-valued epoch attribute. Empty resets it to null; values
/// that do not fit the attribute are stored as null.
struct AttributeMatcher(Attribute);

impl AttributeMatcher {
    fn apply(&self, state: &mut TagProcessorState, value: Option<i64>) {
        let attributes = &mut state.attributes;
        let targets = &mut attributes.targets;
        let defaults = PassTargets::default();

        match self.0 {
            A::GpsMode => {
                attributes.gps_mode = value
                    .and_then(|v| u8::try_from(v).ok())
                    .and_then(GpsMode::from_u8)
                    .unwrap_or(GpsMode::Unknown)
            }
            A::ValidPosition => attributes.valid_position = value.map(|v| v != 0),
            A::Ccv => attributes.ccv = fit(value, NULL_CCV),
            A::Mdp => attributes.mdp = fit(value, NULL_MDP),
            A::Cca => attributes.cca = fit(value, NULL_CCA),
            A::Temperature => attributes.temperature = fit(value, NULL_MATERIAL_TEMPERATURE),
            A::Frequency => attributes.frequency = fit(value, NULL_FREQUENCY),
            A::Amplitude => attributes.amplitude = fit(value, NULL_AMPLITUDE),
            A::Vibration => {
                attributes.vibration = value
                    .and_then(|v| u8::try_from(v).ok())
                    .and_then(VibrationState::from_u8)
                    .unwrap_or(VibrationState::Invalid)
            }
            A::Automatics => {
                attributes.automatics = value
                    .and_then(|v| u8::try_from(v).ok())
                    .and_then(AutomaticsMode::from_u8)
                    .unwrap_or(AutomaticsMode::Unknown)
            }
            A::OnGround => {
                attributes.on_ground = value
                    .and_then(|v| u8::try_from(v).ok())
                    .and_then(OnGroundState::from_u8)
                    .unwrap_or(OnGroundState::Unknown)
            }
            A::Direction => {
                attributes.direction = value
                    .and_then(|v| u8::try_from(v).ok())
                    .and_then(MachineDirection::from_u8)
                    .unwrap_or(MachineDirection::Unknown)
            }
            A::Layer => attributes.layer = value.and_then(|v| u16::try_from(v).ok()),
            A::TargetCcv => targets.ccv = fit(value, defaults.ccv),
            A::TargetMdp => targets.mdp = fit(value, defaults.mdp),
            A::TargetPasses => targets.pass_count = fit(value, NULL_PASS_COUNT),
            A::TargetLift => {
                targets.lift_thickness = value.map_or(NULL_HEIGHT, |mm| mm as f32 / 1000.0)
            }
            A::TemperatureMin => {
                targets.temperature_min = fit(value, defaults.temperature_min)
            }
            A::TemperatureMax => {
                targets.temperature_max = fit(value, defaults.temperature_max)
            }
        }
    }
}

fn fit<T: TryFrom<i64>>(value: Option<i64>, null: T) -> T {
    value.and_then(|v| T::try_from(v).ok()).unwrap_or(null)
}

impl ValueMatcher for AttributeMatcher {
    fn process_integer(
        &self,
        _entry: &TagDictionaryEntry,
        value: i32,
        target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        self.apply(target.state_mut(), Some(value as i64));
        true
    }

    fn process_unsigned(
        &self,
        _entry: &TagDictionaryEntry,
        value: u32,
        target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        self.apply(target.state_mut(), Some(value as i64));
        true
    }

    fn process_double(
        &self,
        _entry: &TagDictionaryEntry,
        value: f64,
        target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        // Lift thickness is the one attribute also sent in metres
        if self.0 != A::TargetLift {
            return false;
        }
        target.state_mut().attributes.targets.lift_thickness = value as f32;
        true
    }

    fn process_empty(&self, _entry: &TagDictionaryEntry, target: &mut dyn ValueMatcherTarget) -> bool {
        self.apply(target.state_mut(), None);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityField {
    MachineName,
    HardwareId,
    MachineType,
    RadioSerial,
    RadioType,
    Design,
}

struct IdentityMatcher(IdentityField);

impl IdentityMatcher {
    fn set_text(&self, state: &mut TagProcessorState, value: String) -> bool {
        let identity = &mut state.identity;
        match self.0 {
            I::MachineName => identity.machine_name = value,
            I::HardwareId => identity.hardware_id = value,
            I::RadioSerial => identity.radio_serial = value,
            I::RadioType => identity.radio_type = value,
            I::Design => state.design_name = value,
            I::MachineType => return false,
        }
        true
    }
}

impl ValueMatcher for IdentityMatcher {
    fn process_ansi(
        &self,
        _entry: &TagDictionaryEntry,
        value: &[u8],
        target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        self.set_text(target.state_mut(), String::from_utf8_lossy(value).into_owned())
    }

    fn process_unicode(
        &self,
        _entry: &TagDictionaryEntry,
        value: &str,
        target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        self.set_text(target.state_mut(), value.to_string())
    }

    fn process_unsigned(
        &self,
        _entry: &TagDictionaryEntry,
        value: u32,
        target: &mut dyn ValueMatcherTarget,
    ) -> bool {
        match (self.0, u8::try_from(value)) {
            (I::MachineType, Ok(machine_type)) => {
                target.state_mut().identity.machine_type = machine_type;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Recorder {
        state: TagProcessorState,
        epochs: Vec<Option<u32>>,
    }

    impl ValueMatcherTarget for Recorder {
        fn state(&self) -> &TagProcessorState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut TagProcessorState {
            &mut self.state
        }

        fn process_epoch_context(&mut self) {
            self.epochs.push(self.state.gps_ms_of_week);
        }
    }

    fn entry(name: &str, data_type: TagDataType) -> TagDictionaryEntry {
        TagDictionaryEntry::new(name, data_type, 1)
    }

    #[test]
    fn test_standard_registry_shares_ordinate_matchers() {
        let registry = MatcherRegistry::standard();
        assert_eq!(registry.len(), STANDARD_TABLE.len());

        let leb = registry.get("LEB").unwrap();
        let rhb = registry.get("RHB").unwrap();
        let let_ = registry.get("LET").unwrap();
        assert!(Arc::ptr_eq(leb, rhb));
        assert!(!Arc::ptr_eq(leb, let_));
        assert!(registry.get("NOT_A_TYPE").is_none());
    }

    #[test]
    fn test_time_commits_previous_epoch() {
        let registry = MatcherRegistry::standard();
        let time = registry.get("TIME").unwrap();
        let absolute = entry("TIME", TagDataType::UInt32);
        let relative = entry("TIME", TagDataType::UInt8);
        let mut target = Recorder::default();

        // Increments before any absolute time are dropped
        assert!(time.process_unsigned(&relative, 5, &mut target));
        assert!(!target.state.have_seen_a_time_value);

        assert!(time.process_unsigned(&absolute, 1_000, &mut target));
        assert!(target.epochs.is_empty());

        assert!(time.process_unsigned(&relative, 10, &mut target));
        assert_eq!(target.epochs, vec![Some(1_000)]);
        assert_eq!(target.state.gps_ms_of_week, Some(1_100));
    }

    #[test]
    fn test_time_increment_rolls_week() {
        let time = TimeMatcher;
        let mut target = Recorder::default();
        target.state.gps_week = Some(2_000);
        time.process_unsigned(&entry("TIME", TagDataType::UInt32), (MILLIS_PER_WEEK - 5) as u32, &mut target);
        time.process_unsigned(&entry("TIME", TagDataType::UInt4), 1, &mut target);
        assert_eq!(target.state.gps_week, Some(2_001));
        assert_eq!(target.state.gps_ms_of_week, Some(5));
    }

    #[test]
    fn test_attribute_values_and_reset() {
        let registry = MatcherRegistry::standard();
        let mut target = Recorder::default();

        let ccv = registry.get("CCV").unwrap();
        assert!(ccv.process_unsigned(&entry("CCV", TagDataType::UInt12), 420, &mut target));
        assert_eq!(target.state.attributes.ccv, 420);
        assert!(ccv.process_unsigned(&entry("CCV", TagDataType::UInt32), 70_000, &mut target));
        assert_eq!(target.state.attributes.ccv, NULL_CCV);

        let lift = registry.get("TGT_LIFT").unwrap();
        assert!(lift.process_unsigned(&entry("TGT_LIFT", TagDataType::UInt16), 250, &mut target));
        assert_eq!(target.state.attributes.targets.lift_thickness, 0.25);

        let valid = registry.get("VALID_POS").unwrap();
        assert!(valid.process_unsigned(&entry("VALID_POS", TagDataType::UInt4), 0, &mut target));
        assert_eq!(target.state.attributes.valid_position, Some(false));
        assert!(valid.process_empty(&entry("VALID_POS", TagDataType::Empty), &mut target));
        assert_eq!(target.state.attributes.valid_position, None);
        assert!(!valid.process_double(&entry("VALID_POS", TagDataType::Double), 1.0, &mut target));
    }

    #[test]
    fn test_identity_values() {
        let registry = MatcherRegistry::standard();
        let mut target = Recorder::default();

        registry
            .get("MACHINE")
            .unwrap()
            .process_ansi(&entry("MACHINE", TagDataType::AnsiString), b"CB54", &mut target);
        registry
            .get("DESIGN")
            .unwrap()
            .process_unicode(&entry("DESIGN", TagDataType::UnicodeString), "Lift 3", &mut target);
        registry
            .get("MACHINE_TYPE")
            .unwrap()
            .process_unsigned(&entry("MACHINE_TYPE", TagDataType::UInt8), 25, &mut target);

        assert_eq!(target.state.identity.machine_name, "CB54");
        assert_eq!(target.state.design_name, "Lift 3");
        assert_eq!(target.state.identity.machine_type, 25);
    }

    #[derive(Debug, Clone)]
    enum OrdinateOp {
        Delta(i32),
        Absolute(f64),
        Clear,
    }

    fn ordinate_op() -> impl Strategy<Value = OrdinateOp> {
        prop_oneof![
            (-100_000i32..100_000).prop_map(OrdinateOp::Delta),
            (-1.0e6f64..1.0e6).prop_map(OrdinateOp::Absolute),
            Just(OrdinateOp::Clear),
        ]
    }

    proptest! {
        #[test]
        fn prop_ordinate_law(ops in proptest::collection::vec(ordinate_op(), 0..40)) {
            let matcher = OrdinateMatcher::new(PointSet::Track);
            let mut target = Recorder::default();
            let mut expected: Option<f64> = None;

            for op in &ops {
                match op {
                    OrdinateOp::Delta(mm) => {
                        prop_assert!(matcher.process_integer(&entry("RNT", TagDataType::Int16), *mm, &mut target));
                        expected = expected.map(|v| v + *mm as f64 / 1000.0);
                    }
                    OrdinateOp::Absolute(v) => {
                        prop_assert!(matcher.process_double(&entry("RNT", TagDataType::Double), *v, &mut target));
                        expected = Some(*v);
                    }
                    OrdinateOp::Clear => {
                        prop_assert!(matcher.process_empty(&entry("RNT", TagDataType::Empty), &mut target));
                        expected = None;
                    }
                }
            }

            let actual = target.state.points(PointSet::Track).right.northing;
            match (actual, expected) {
                (Some(a), Some(e)) => prop_assert!((a - e).abs() < 1e-6),
                (a, e) => prop_assert_eq!(a, e),
            }
            // Other ordinates are untouched
            prop_assert_eq!(target.state.points(PointSet::Track).left.northing, None);
            prop_assert_eq!(target.state.points(PointSet::Blade).right.northing, None);
        }
    }
}
