// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use ensemble::{CellId, WalkerIdSource};
use tempfile::TempDir;

use crate::test_support::{
    add_completed_walker, system_with_cells, total_weight, weights_in_cell,
};
use crate::{OneColor, Resample};

const EPSILON: f64 = 1e-12;

fn assert_close(expected: f64, actual: f64) {
    assert!(
        (expected - actual).abs() < EPSILON,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn four_walkers_equalize_to_quarter_weights() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    for weight in [0.5, 0.25, 0.125, 0.125] {
        add_completed_walker(&mut system, &mut ids, 0, 0, weight);
    }

    let mut resampler = OneColor::new(4, dir.path()).unwrap();
    let next = resampler.resample(&system, &mut ids).unwrap();

    let weights = weights_in_cell(&next, 0);
    assert_eq!(4, weights.len());
    for weight in &weights {
        assert_close(0.25, *weight);
    }
    assert_close(1.0, total_weight(&next));
}

#[test]
fn split_and_merge_reach_half_weights() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    add_completed_walker(&mut system, &mut ids, 0, 0, 0.9);
    add_completed_walker(&mut system, &mut ids, 0, 0, 0.1);

    let mut resampler = OneColor::new(2, dir.path()).unwrap();
    let next = resampler.resample(&system, &mut ids).unwrap();

    let weights = weights_in_cell(&next, 0);
    assert_eq!(2, weights.len());
    for weight in &weights {
        assert_close(0.5, *weight);
    }
}

#[test]
fn lone_walker_splits_n_ways() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    add_completed_walker(&mut system, &mut ids, 0, 0, 0.75);

    let mut resampler = OneColor::new(5, dir.path()).unwrap();
    let next = resampler.resample(&system, &mut ids).unwrap();

    let weights = weights_in_cell(&next, 0);
    assert_eq!(5, weights.len());
    for weight in &weights {
        assert_close(0.15, *weight);
    }
}

#[test]
fn equal_population_is_fixed_point() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    for _ in 0..3 {
        add_completed_walker(&mut system, &mut ids, 0, 0, 0.2);
    }

    let mut resampler = OneColor::new(3, dir.path()).unwrap();
    let next = resampler.resample(&system, &mut ids).unwrap();

    let weights = weights_in_cell(&next, 0);
    assert_eq!(3, weights.len());
    for weight in &weights {
        assert_close(0.2, *weight);
    }
}

#[test]
fn empty_cells_are_skipped_but_kept() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None), (1, None)]);
    add_completed_walker(&mut system, &mut ids, 0, 0, 1.0);

    let mut resampler = OneColor::new(2, dir.path()).unwrap();
    let next = resampler.resample(&system, &mut ids).unwrap();

    assert!(next.has_cell(CellId(1)));
    assert_eq!(2, next.nwalkers());
    assert!(weights_in_cell(&next, 1).is_empty());
}

#[test]
fn per_cell_weight_is_conserved_across_cells() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None), (1, None)]);
    for weight in [0.3, 0.3] {
        add_completed_walker(&mut system, &mut ids, 0, 0, weight);
    }
    for weight in [0.2, 0.2] {
        add_completed_walker(&mut system, &mut ids, 1, 0, weight);
    }

    let mut resampler = OneColor::new(2, dir.path()).unwrap();
    let next = resampler.resample(&system, &mut ids).unwrap();

    let cell0 = weights_in_cell(&next, 0);
    let cell1 = weights_in_cell(&next, 1);
    assert_eq!(2, cell0.len());
    assert_eq!(2, cell1.len());
    for weight in &cell0 {
        assert_close(0.3, *weight);
    }
    for weight in &cell1 {
        assert_close(0.2, *weight);
    }
    assert_close(1.0, total_weight(&next));
}

#[test]
fn uneven_population_still_hits_the_target_everywhere() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None), (1, None), (2, None)]);
    let loads: &[(u32, &[f64])] = &[
        (0, &[0.01, 0.02, 0.04, 0.08, 0.16]),
        (1, &[0.5]),
        (2, &[0.06, 0.06, 0.07]),
    ];
    for &(cell, weights) in loads {
        for &weight in weights {
            add_completed_walker(&mut system, &mut ids, cell, 0, weight);
        }
    }

    let mut resampler = OneColor::new(4, dir.path()).unwrap();
    let next = resampler.resample(&system, &mut ids).unwrap();

    for &(cell, weights) in loads {
        let total: f64 = weights.iter().sum();
        let resampled = weights_in_cell(&next, cell);
        assert_eq!(4, resampled.len(), "cell {cell}");
        for weight in &resampled {
            assert_close(total / 4.0, *weight);
        }
    }
}

#[test]
fn new_ids_are_monotonic_and_initids_survive() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    for weight in [0.6, 0.4] {
        add_completed_walker(&mut system, &mut ids, 0, 0, weight);
    }
    let max_parent = system.walkers().map(|w| w.id()).max().unwrap();
    let parent_initids: Vec<_> = system.walkers().map(|w| w.initid()).collect();

    let mut resampler = OneColor::new(4, dir.path()).unwrap();
    let next = resampler.resample(&system, &mut ids).unwrap();

    for walker in next.walkers() {
        assert!(walker.id() > max_parent);
        assert!(parent_initids.contains(&walker.initid()));
        assert_eq!(None, walker.end());
    }
}

#[test]
fn split_lineage_is_recorded() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    add_completed_walker(&mut system, &mut ids, 0, 0, 1.0);

    let mut resampler = OneColor::new(3, dir.path()).unwrap();
    resampler.resample(&system, &mut ids).unwrap();

    let history = std::fs::read_to_string(dir.path().join("walker-history.csv")).unwrap();
    let lines: Vec<&str> = history.lines().collect();
    assert_eq!("origID,parentID,currentID", lines[0]);
    // One lineage row per committed walker.
    assert_eq!(4, lines.len());
    for line in &lines[1..] {
        assert_eq!(3, line.split(',').count());
    }
}

#[test]
fn zero_target_is_rejected() {
    let dir = TempDir::new().unwrap();
    assert!(OneColor::new(0, dir.path()).is_err());
}
