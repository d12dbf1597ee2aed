#![allow(dead_code)]

use std::sync::Arc;

use apparatus::{ApparatusResult, Mechanism, MechanismConfig};

pub const SUBJECTS_SMALL: usize = 100_000;
pub const SUBJECTS_MED: usize = 1_000_000;
pub const SUBJECTS_LARGE: usize = 10_000_000;

#[derive(Clone, Copy, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

#[derive(Clone, Copy, Default)]
pub struct Wealth {
    pub value: f32,
}

#[derive(Clone, Copy, Default)]
pub struct Productivity {
    pub rate: f32,
}

pub fn make_mechanism(min_rows_per_thread: usize) -> ApparatusResult<Arc<Mechanism>> {
    Mechanism::with_config(MechanismConfig {
        chunk_initial_capacity: 4_096,
        min_rows_per_thread,
        ..MechanismConfig::default()
    })
}

pub fn populate(mechanism: &Mechanism, subject_count: usize) -> ApparatusResult<()> {
    for i in 0..subject_count {
        if i % 4 == 0 {
            mechanism.spawn_with((Position { x: 0.0, y: 0.0 }, Wealth { value: 100.0 }))?;
        } else {
            mechanism.spawn_with((
                Position { x: 0.0, y: 0.0 },
                Wealth { value: 100.0 },
                Productivity { rate: 1.0 },
            ))?;
        }
    }
    Ok(())
}

pub fn setup_mechanism(subject_count: usize) -> ApparatusResult<Arc<Mechanism>> {
    let mechanism = make_mechanism(4_096)?;
    populate(&mechanism, subject_count)?;
    Ok(mechanism)
}
