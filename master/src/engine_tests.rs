// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::Path;
use std::sync::atomic::Ordering;

use ensemble::{CellId, System, Walker, WalkerIdSource};
use resample::{OneColor, Resampler};
use tempfile::TempDir;
use testutil::{
    add_walker, complete_failed, complete_ok, system_with_cells, ScriptedTransport,
};
use transport::TaskTag;

use crate::{EngineConfig, IterationEngine};

fn engine_with(
    system: System,
    ids: WalkerIdSource,
    resampler: Resampler,
    transport: ScriptedTransport,
    dir: &Path,
    config: EngineConfig,
) -> IterationEngine {
    IterationEngine::new(
        system,
        resampler,
        Box::new(transport),
        ids,
        config.rooted_at(dir),
    )
    .unwrap()
}

fn tag_walker(tag: &str) -> u64 {
    TaskTag::parse(tag).unwrap().walker.0
}

#[test]
fn one_iteration_rebalances_the_population() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    add_walker(&mut system, &mut ids, 0, 0, 0.75);
    add_walker(&mut system, &mut ids, 0, 0, 0.25);

    let transport = ScriptedTransport::new(1, |task| complete_ok(task, 0));
    let resampler = Resampler::OneColor(OneColor::new(2, dir.path()).unwrap());
    let mut engine = engine_with(
        system,
        ids,
        resampler,
        transport.clone(),
        dir.path(),
        EngineConfig::new(1),
    );

    engine.run().unwrap();

    assert_eq!(1, engine.iteration());
    assert_eq!(2, engine.system().nwalkers());
    for walker in engine.system().walkers() {
        assert!((walker.weight() - 0.5).abs() < 1e-12);
        // The resampled generation is ready for the next submit phase.
        assert_eq!(None, walker.end());
    }
    assert_eq!(2, transport.submitted_tags().len());
    assert!(dir.path().join("debug/trax.cpt").exists());
}

#[test]
fn results_update_assignment_and_record_the_transition() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None), (1, None)]);
    let walker = add_walker(&mut system, &mut ids, 0, 0, 1.0);

    let transport = ScriptedTransport::new(1, |task| complete_ok(task, 1));
    let mut engine = engine_with(
        system,
        ids,
        Resampler::Identity,
        transport,
        dir.path(),
        EngineConfig::new(1),
    );

    engine.run().unwrap();

    let moved = engine.system().walker(walker).unwrap();
    assert_eq!(CellId(1), moved.assignment());
    assert!(moved.end().is_some());
    assert!(dir.path().join("debug/cell-transitions.log.gz").exists());
}

#[test]
fn failed_tasks_are_restarted_with_the_same_tag() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    add_walker(&mut system, &mut ids, 0, 0, 1.0);

    let mut failures = 1;
    let transport = ScriptedTransport::new(1, move |task| {
        if failures > 0 {
            failures -= 1;
            complete_failed(task, 3, "segment crashed\n");
        } else {
            complete_ok(task, 0);
        }
    });
    let mut engine = engine_with(
        system,
        ids,
        Resampler::Identity,
        transport.clone(),
        dir.path(),
        EngineConfig::new(1),
    );

    engine.run().unwrap();

    let submitted = transport.submitted_tags();
    assert_eq!(2, submitted.len());
    assert_eq!(submitted[0], submitted[1]);
    assert!(engine.system().walkers().all(|w| w.end().is_some()));
}

#[test]
fn the_restart_cap_is_fatal() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    add_walker(&mut system, &mut ids, 0, 0, 1.0);

    let transport = ScriptedTransport::new(1, |task| complete_failed(task, 3, "hopeless\n"));
    let mut config = EngineConfig::new(1);
    config.restarts = Some(0);
    let mut engine = engine_with(
        system,
        ids,
        Resampler::Identity,
        transport,
        dir.path(),
        config,
    );

    let err = engine.run().unwrap_err();
    assert!(err.contains("restart cap"), "{err}");
}

#[test]
fn unparsable_results_are_restarted() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    add_walker(&mut system, &mut ids, 0, 0, 1.0);

    let mut corrupt = 1;
    let transport = ScriptedTransport::new(1, move |task| {
        if corrupt > 0 {
            corrupt -= 1;
            // The task reports success but the archive is garbage.
            std::fs::write(&task.outputs[0].local_path, b"not a tar archive").unwrap();
            task.result = 0;
            task.return_status = 0;
            task.output = "segment complete\n".to_owned();
        } else {
            complete_ok(task, 0);
        }
    });
    let mut engine = engine_with(
        system,
        ids,
        Resampler::Identity,
        transport.clone(),
        dir.path(),
        EngineConfig::new(1),
    );

    engine.run().unwrap();
    assert_eq!(2, transport.submitted_tags().len());
}

#[test]
fn invalid_models_restart_from_a_donor() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    let donor = add_walker(&mut system, &mut ids, 0, 0, 0.5);
    let sick = {
        let walker = Walker::new(
            ids.next_id(),
            vec![[9.0, 9.0, 9.0], [8.0, 8.0, 8.0]],
            CellId(0),
            0,
            0.5,
        )
        .unwrap();
        let id = walker.id();
        system.add_walker(walker).unwrap();
        id
    };
    let donor_start = system.walker(donor).unwrap().start().cloned().unwrap();

    let sick_id = sick.0;
    let mut nan_reports = 1;
    let transport = ScriptedTransport::new(1, move |task| {
        if tag_walker(&task.tag) == sick_id && nan_reports > 0 {
            nan_reports -= 1;
            complete_failed(task, 1, "NaN detected in positions\n");
        } else {
            complete_ok(task, 0);
        }
    });
    let mut engine = engine_with(
        system,
        ids,
        Resampler::Identity,
        transport,
        dir.path(),
        EngineConfig::new(1),
    );

    engine.run().unwrap();

    let repaired = engine.system().walker(sick).unwrap();
    assert!(repaired.is_valid());
    assert!(repaired.end().is_some());
    // The walker was restarted from the donor's coordinates.
    assert_eq!(Some(&donor_start), repaired.start());
}

#[test]
fn an_invalid_model_with_no_donor_is_fatal() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    add_walker(&mut system, &mut ids, 0, 0, 1.0);

    let transport = ScriptedTransport::new(1, |task| {
        complete_failed(task, 1, "NaN detected in positions\n")
    });
    let mut engine = engine_with(
        system,
        ids,
        Resampler::Identity,
        transport,
        dir.path(),
        EngineConfig::new(1),
    );

    let err = engine.run().unwrap_err();
    assert!(err.contains("No valid donor"), "{err}");
}

#[test]
fn idle_workers_trigger_speculative_duplicates() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    add_walker(&mut system, &mut ids, 0, 0, 0.5);
    add_walker(&mut system, &mut ids, 0, 0, 0.5);

    let transport = ScriptedTransport::new(4, |task| complete_ok(task, 0));
    let mut config = EngineConfig::new(1);
    config.maxreps = Some(2);
    let mut engine = engine_with(
        system,
        ids,
        Resampler::Identity,
        transport.clone(),
        dir.path(),
        config,
    );

    engine.run().unwrap();

    // Accepting the first result leaves idle workers, so the remaining tag
    // is replicated up to maxreps; the duplicates die when the original
    // result is accepted.
    let submitted = transport.submitted_tags();
    assert_eq!(4, submitted.len());
    let duplicated = &submitted[2];
    assert_eq!(submitted[3], *duplicated);
    assert_eq!(2, transport.cancelled_tags().len());
    assert!(transport
        .cancelled_tags()
        .iter()
        .all(|tag| tag == duplicated));
}

#[test]
fn maxreps_zero_disables_duplication() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    add_walker(&mut system, &mut ids, 0, 0, 0.5);
    add_walker(&mut system, &mut ids, 0, 0, 0.5);

    let transport = ScriptedTransport::new(8, |task| complete_ok(task, 0));
    let mut config = EngineConfig::new(1);
    config.maxreps = Some(0);
    let mut engine = engine_with(
        system,
        ids,
        Resampler::Identity,
        transport.clone(),
        dir.path(),
        config,
    );

    engine.run().unwrap();
    assert_eq!(2, transport.submitted_tags().len());
    assert!(transport.cancelled_tags().is_empty());
}

#[test]
fn recovery_reproduces_the_pre_crash_system() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    add_walker(&mut system, &mut ids, 0, 0, 0.75);
    add_walker(&mut system, &mut ids, 0, 0, 0.25);
    let initial = system.clone();

    // First life: the barrier completes (results land in the walker log),
    // then the process dies before the next checkpoint.
    let transport = ScriptedTransport::new(1, |task| complete_ok(task, 0));
    let mut engine = engine_with(
        system,
        WalkerIdSource::starting_at(2),
        Resampler::Identity,
        transport,
        dir.path(),
        EngineConfig::new(1),
    );
    engine.run().unwrap();
    drop(engine);

    // Second life: recovery replays the committed walkers over the iteration
    // checkpoint.
    let transport = ScriptedTransport::new(1, |task| complete_ok(task, 0));
    let mut recovered = engine_with(
        initial.clone(),
        WalkerIdSource::starting_at(2),
        Resampler::Identity,
        transport,
        dir.path(),
        EngineConfig::new(1),
    );
    recovered.recover().unwrap();

    assert_eq!(1, recovered.iteration());
    // The handler echoed each walker's structure back, so the pre-crash
    // state is the initial population with end = start.
    let mut expected = initial;
    let pending: Vec<_> = expected.walkers().map(|w| w.id()).collect();
    for id in pending {
        let start = expected.walker(id).unwrap().start().cloned().unwrap();
        expected.walker_mut(id).unwrap().set_end(start);
    }
    assert_eq!(&expected, recovered.system());
}

#[test]
fn an_interrupt_before_the_first_iteration_is_a_clean_stop() {
    let dir = TempDir::new().unwrap();
    let mut ids = WalkerIdSource::new();
    let mut system = system_with_cells(&[(0, None)]);
    add_walker(&mut system, &mut ids, 0, 0, 1.0);

    let transport = ScriptedTransport::new(1, |task| complete_ok(task, 0));
    let mut engine = engine_with(
        system,
        ids,
        Resampler::Identity,
        transport.clone(),
        dir.path(),
        EngineConfig::new(5),
    );
    engine.interrupt_flag().store(true, Ordering::Relaxed);

    engine.run().unwrap();
    assert_eq!(0, engine.iteration());
    assert!(transport.submitted_tags().is_empty());
}

#[test]
fn running_without_walkers_is_an_error() {
    let dir = TempDir::new().unwrap();
    let system = system_with_cells(&[(0, None)]);
    let transport = ScriptedTransport::new(1, |task| complete_ok(task, 0));
    let mut engine = engine_with(
        system,
        WalkerIdSource::new(),
        Resampler::Identity,
        transport,
        dir.path(),
        EngineConfig::new(1),
    );
    assert!(engine.run().is_err());
}
