use chrono::{DateTime, Utc};

use super::matchers::ValueMatcherTarget;
use super::state::{PointSet, TagProcessorState};
use crate::cells::{
    CellPass, MachineDirection, PassType, ProcessedCellPass, NULL_MACHINE_SPEED,
};
use crate::error::Result;
use crate::subgrid::{BitmaskLeaf, BitmaskLeafFactory, CellAddress, SubGridTree};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochStats {
    pub seen: u64,
    pub committed: u64,
    pub skipped: u64,
}

/// Where the previous pass was committed, for machine speed.
#[derive(Debug, Clone, Copy)]
struct CommittedEpoch {
    time: DateTime<Utc>,
    easting: f64,
    northing: f64,
}

/// Turns epochs of matcher state into cell passes.
///
/// Each commit positions the pass at the midpoint of the best complete
/// point pair (blade, then track, then wheel) and records the touched
/// cell in a coverage tree.
pub struct TagProcessor {
    state: TagProcessorState,
    grid: SubGridTree<BitmaskLeaf>,
    passes: Vec<ProcessedCellPass>,
    stats: EpochStats,
    previous: Option<CommittedEpoch>,
}

impl TagProcessor {
    pub fn new(tree_levels: u8, cell_size: f64) -> Result<Self> {
        Ok(Self {
            state: TagProcessorState::default(),
            grid: SubGridTree::new(tree_levels, cell_size, Arc::new(BitmaskLeafFactory))?,
            passes: Vec::new(),
            stats: EpochStats::default(),
            previous: None,
        })
    }

    pub fn passes(&self) -> &[ProcessedCellPass] {
        &self.passes
    }

    pub fn stats(&self) -> EpochStats {
        self.stats
    }

    /// Leaves of the cells that received a pass.
    pub fn coverage(&self) -> &SubGridTree<BitmaskLeaf> {
        &self.grid
    }

    pub fn into_parts(self) -> (TagProcessorState, Vec<ProcessedCellPass>, EpochStats) {
        (self.state, self.passes, self.stats)
    }

    fn commit_epoch(&mut self) -> Option<ProcessedCellPass> {
        let time = self.state.current_time()?;
        let attributes = self.state.attributes;
        if attributes.valid_position == Some(false) {
            return None;
        }

        let (set, (easting, northing, height)) = self.state.positioning_points()?;
        let cell = self.grid.cell_for_world(easting, northing)?;

        let mut pass = CellPass::null_at(time);
        pass.height = height as f32;
        pass.ccv = attributes.ccv;
        pass.mdp = attributes.mdp;
        pass.cca = attributes.cca;
        pass.amplitude = attributes.amplitude;
        pass.frequency = attributes.frequency;
        pass.material_temperature = attributes.temperature;
        pass.gps_mode = attributes.gps_mode;
        pass.vibration = attributes.vibration;
        pass.automatics = attributes.automatics;
        pass.on_ground = attributes.on_ground;
        pass.targets = attributes.targets;
        pass.machine_speed = self.speed_to(time, easting, northing);
        pass.pass_type = match (set, attributes.direction) {
            (PointSet::Blade, MachineDirection::Reverse) => PassType::Rear,
            (PointSet::Blade, _) => PassType::Front,
            (PointSet::Track, _) => PassType::Track,
            (PointSet::Wheel, _) => PassType::Wheel,
        };

        self.mark_coverage(cell);
        self.previous = Some(CommittedEpoch {
            time,
            easting,
            northing,
        });

        Some(ProcessedCellPass {
            cell,
            easting,
            northing,
            pass,
        })
    }

    /// Centimetres per second since the previous committed epoch.
    fn speed_to(&self, time: DateTime<Utc>, easting: f64, northing: f64) -> u16 {
        let previous = match self.previous {
            Some(previous) if time > previous.time => previous,
            _ => return NULL_MACHINE_SPEED,
        };
        let seconds = (time - previous.time).num_milliseconds() as f64 / 1000.0;
        let distance = (easting - previous.easting).hypot(northing - previous.northing);
        let speed = (distance / seconds * 100.0).round();
        if speed.is_finite() && speed < NULL_MACHINE_SPEED as f64 {
            speed as u16
        } else {
            NULL_MACHINE_SPEED
        }
    }

    fn mark_coverage(&mut self, cell: CellAddress) {
        let (x, y) = cell.leaf_offset();
        if let Ok(leaf) = self.grid.locate(cell.x, cell.y) {
            leaf.set(x, y);
        }
    }
}

impl ValueMatcherTarget for TagProcessor {
    fn state(&self) -> &TagProcessorState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TagProcessorState {
        &mut self.state
    }

    fn process_epoch_context(&mut self) {
        self.stats.seen += 1;
        match self.commit_epoch() {
            Some(pass) => {
                self.stats.committed += 1;
                self.passes.push(pass);
            }
            None => self.stats.skipped += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subgrid::Addressable;
    use crate::tagfile::state::TagPoint;

    fn processor() -> TagProcessor {
        TagProcessor::new(6, 0.34).unwrap()
    }

    fn place(state: &mut TagProcessorState, set: PointSet, easting: f64) {
        let point = TagPoint {
            easting: Some(easting),
            northing: Some(100.0),
            height: Some(50.0),
        };
        state.points_mut(set).left = point;
        state.points_mut(set).right = TagPoint {
            easting: Some(easting + 2.0),
            ..point
        };
    }

    #[test]
    fn test_epoch_without_time_is_skipped() {
        let mut processor = processor();
        place(processor.state_mut(), PointSet::Blade, 10.0);
        processor.process_epoch_context();
        assert_eq!(
            processor.stats(),
            EpochStats {
                seen: 1,
                committed: 0,
                skipped: 1
            }
        );
    }

    #[test]
    fn test_invalid_position_is_skipped() {
        let mut processor = processor();
        let state = processor.state_mut();
        state.gps_week = Some(2_300);
        state.gps_ms_of_week = Some(1_000);
        state.attributes.valid_position = Some(false);
        place(state, PointSet::Track, 10.0);

        processor.process_epoch_context();
        assert_eq!(processor.stats().skipped, 1);
        assert!(processor.passes().is_empty());
    }

    #[test]
    fn test_commit_positions_and_speed() {
        let mut processor = processor();
        let state = processor.state_mut();
        state.gps_week = Some(2_300);
        state.gps_ms_of_week = Some(1_000);
        place(state, PointSet::Wheel, 10.0);
        processor.process_epoch_context();

        let state = processor.state_mut();
        state.gps_ms_of_week = Some(2_000);
        place(state, PointSet::Wheel, 13.0);
        processor.process_epoch_context();

        let passes = processor.passes();
        assert_eq!(passes.len(), 2);
        assert_eq!(passes[0].easting, 11.0);
        assert_eq!(passes[0].pass.pass_type, PassType::Wheel);
        assert_eq!(passes[0].pass.machine_speed, NULL_MACHINE_SPEED);
        assert_eq!(passes[1].pass.machine_speed, 300);
        assert_eq!(passes[1].pass.height, 50.0);

        let expected = processor.coverage().cell_for_world(14.0, 100.0).unwrap();
        assert_eq!(passes[1].cell, expected);
        let leaf = processor
            .coverage()
            .lookup(expected.x, expected.y)
            .expect("coverage leaf");
        let (x, y) = leaf.cell_offset(expected);
        assert!(leaf.is_set(x, y));
    }
}
