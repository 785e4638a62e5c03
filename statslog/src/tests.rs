// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::Read;

use flate2::read::MultiGzDecoder;
use tempfile::TempDir;

use crate::{StatsLogger, Timer};

fn read_log(path: &std::path::Path) -> String {
    let file = std::fs::File::open(path).unwrap();
    let mut decoder = MultiGzDecoder::new(file);
    let mut text = String::new();
    decoder.read_to_string(&mut text).unwrap();
    text
}

#[test]
fn update_writes_timestamped_lines() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("debug/stats.log.gz");
    {
        let mut logger = StatsLogger::new(&path).unwrap();
        logger.update("AWE", "iteration", 3).unwrap();
        logger.update("AWE", "walkers", 128).unwrap();
        logger.close().unwrap();
    }

    let text = read_log(&path);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(2, lines.len());
    let fields: Vec<&str> = lines[0].split_whitespace().collect();
    assert_eq!(4, fields.len());
    assert!(fields[0].parse::<f64>().unwrap() > 0.0);
    assert_eq!(&["AWE", "iteration", "3"], &fields[1..]);
}

#[test]
fn append_across_sessions_concatenates_members() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stats.log.gz");
    for session in 0..2 {
        let mut logger = StatsLogger::new(&path).unwrap();
        logger.update("AWE", "session", session).unwrap();
        logger.close().unwrap();
    }

    let text = read_log(&path);
    assert_eq!(2, text.lines().count());
}

#[test]
fn output_appends_raw_text() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("task_output.log.gz");
    let mut logger = StatsLogger::new(&path).unwrap();
    logger.output("<====== START task t output ======>\n").unwrap();
    logger.output("NaN in positions\n").unwrap();
    logger.close().unwrap();

    let text = read_log(&path);
    assert!(text.contains("NaN in positions"));
}

#[test]
fn closed_logger_rejects_writes_until_reopened() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stats.log.gz");
    let mut logger = StatsLogger::new(&path).unwrap();
    logger.close().unwrap();
    assert!(logger.update("AWE", "x", 1).is_err());
    logger.open().unwrap();
    assert!(logger.update("AWE", "x", 1).is_ok());
}

#[test]
fn timer_reports_elapsed_only_after_start() {
    let mut timer = Timer::new();
    assert_eq!(std::time::Duration::ZERO, timer.elapsed());
    assert!(!timer.is_running());

    timer.start();
    assert!(timer.is_running());
    std::thread::sleep(std::time::Duration::from_millis(2));
    timer.stop();
    assert!(!timer.is_running());
    let frozen = timer.elapsed();
    assert!(frozen >= std::time::Duration::from_millis(2));
    // A stopped timer's elapsed time does not advance.
    assert_eq!(frozen, timer.elapsed());
}
