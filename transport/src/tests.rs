// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;

use ensemble::{CellId, WalkerId};

use crate::{CachedFile, TaskTag, TransportConfig};

#[test]
fn tag_round_trips() {
    let tag = TaskTag {
        outfile: PathBuf::from("/tmp/awe-tmp.xyz/results.7.tar"),
        cell: CellId(12),
        weight: 0.0625,
        walker: WalkerId(7),
    };
    let encoded = tag.encode();
    assert_eq!("/tmp/awe-tmp.xyz/results.7.tar+12+0.0625+7", encoded);
    assert_eq!(tag, TaskTag::parse(&encoded).unwrap());
}

#[test]
fn tag_tolerates_plus_in_the_outfile_path() {
    let tag = TaskTag {
        outfile: PathBuf::from("/scratch/run+1/results.tar"),
        cell: CellId(3),
        weight: 0.5,
        walker: WalkerId(42),
    };
    let parsed = TaskTag::parse(&tag.encode()).unwrap();
    assert_eq!(tag, parsed);
}

#[test]
fn tag_rejects_garbage() {
    assert!(TaskTag::parse("no separators here").is_err());
    assert!(TaskTag::parse("a+b+c+d").is_err());
    assert!(TaskTag::parse("out+1+0.5").is_err());
}

#[test]
fn task_ok_requires_both_statuses() {
    let mut task = crate::Task::new("./run.sh");
    assert!(task.ok());
    task.return_status = 1;
    assert!(!task.ok());
    task.return_status = 0;
    task.result = 2;
    assert!(!task.ok());
}

#[test]
fn materialize_task_attaches_executable_and_cache() {
    let mut config = TransportConfig::new(9123);
    config.execute("bin/run-segment.sh");
    config.cache_file("data/cells.dat");
    config.cached_files.push(CachedFile::with_remote_name(
        "data/topology.pdb",
        "system.pdb",
    ));

    let task = config.materialize_task().unwrap();
    assert_eq!("./run-segment.sh", task.command);
    assert_eq!(3, task.input_files.len());
    assert_eq!("system.pdb", task.input_files[2].remote_name);
}

#[test]
fn materialize_task_requires_an_executable() {
    let config = TransportConfig::new(9123);
    assert!(config.materialize_task().is_err());
}
