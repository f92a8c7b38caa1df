//! Scans running one iterator per top-level master.

mod common;

use acq_chain::acquisition::AcqParams;
use acq_chain::config::{ChainSettings, SimulationSettings};
use acq_chain::error::Phase;
use acq_chain::{sim, AcqError, Chain, Scan, ScanState};
use common::{Journal, Recorder};
use std::time::Instant;
use tokio::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_simulated_step_scan() {
    let simulation = SimulationSettings {
        npoints: 5,
        count_time_ms: 2,
        counters: vec!["diode".to_string(), "monitor".to_string()],
        ..Default::default()
    };
    let step = sim::step_scan(&simulation, &ChainSettings::default()).unwrap();
    let stats = step.chain.stats();

    let mut scan = Scan::new(step.chain);
    assert_ok!(scan.run().await);
    assert_eq!(scan.state(), ScanState::Done);

    assert_eq!(step.motor.channel().points(), 5);
    assert_eq!(step.timer.triggers(), 5);
    assert_eq!(step.timer.channel().points(), 5);
    for counter in &step.counters {
        assert_eq!(counter.counted(), 5);
        assert_eq!(counter.channel().points(), 5);
    }
    assert_eq!(stats.count("motor", Phase::Prepare), 5);
    assert_eq!(stats.count("timer", Phase::Prepare), 1);
    assert_eq!(stats.count("diode", Phase::Stop), 1);
}

#[tokio::test]
async fn test_stopper_ends_the_scan() {
    let journal = Journal::new();
    let short = Recorder::new("A", &journal).points(2).master(AcqParams::new());
    let long = Recorder::new("B", &journal)
        .points(1000)
        .master(AcqParams::new());

    let mut chain = Chain::new();
    chain
        .add(&short, &Recorder::new("DA", &journal).device(AcqParams::new()))
        .unwrap();
    chain
        .add(
            &long,
            &Recorder::new("DB", &journal)
                .reading_time(Duration::from_millis(5))
                .device(AcqParams::new()),
        )
        .unwrap();
    chain.set_stopper(&long, false).unwrap();

    let started = Instant::now();
    let mut scan = Scan::new(chain);
    assert_ok!(scan.run().await);
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(journal.count("A", "prepare"), 2);
    assert!(journal.count("B", "prepare") < 1000);
    assert_eq!(journal.count("B", "stop"), 1);
    assert_eq!(journal.count("DB", "stop"), 1);
}

#[tokio::test]
async fn test_non_stopper_that_finishes_early() {
    let journal = Journal::new();
    let quick = Recorder::new("Q", &journal).points(1).master(AcqParams::new());
    let main = Recorder::new("MAIN", &journal)
        .points(3)
        .master(AcqParams::new());

    let mut chain = Chain::new();
    chain
        .add(&quick, &Recorder::new("DQ", &journal).device(AcqParams::new()))
        .unwrap();
    chain
        .add(&main, &Recorder::new("DM", &journal).device(AcqParams::new()))
        .unwrap();
    chain.set_stopper(&quick, false).unwrap();

    let mut scan = Scan::new(chain);
    scan.run().await.unwrap();

    assert_eq!(journal.count("Q", "prepare"), 1);
    assert_eq!(journal.count("MAIN", "prepare"), 3);
    assert_eq!(journal.count("DM", "start"), 3);
    assert_eq!(journal.count("Q", "stop"), 1);
    assert_eq!(journal.count("MAIN", "stop"), 1);
}

#[tokio::test]
async fn test_failure_stops_every_iterator() {
    let journal = Journal::new();
    let first = Recorder::new("M1", &journal).points(3).master(AcqParams::new());
    let second = Recorder::new("M2", &journal).points(3).master(AcqParams::new());

    let mut chain = Chain::new();
    chain
        .add(
            &first,
            &Recorder::new("BAD", &journal)
                .failing("start")
                .device(AcqParams::new()),
        )
        .unwrap();
    chain
        .add(&second, &Recorder::new("OK", &journal).device(AcqParams::new()))
        .unwrap();
    // only the failing side may end the run
    chain.set_stopper(&second, false).unwrap();

    let mut scan = Scan::new(chain);
    let mut state = scan.watch();
    let err = assert_err!(scan.run().await);
    assert!(matches!(
        err,
        AcqError::Device {
            phase: Phase::Start,
            ..
        }
    ));
    assert_eq!(scan.state(), ScanState::Failed);
    assert_eq!(*state.borrow_and_update(), ScanState::Failed);

    for name in ["M1", "BAD", "M2", "OK"] {
        assert_eq!(journal.count(name, "stop"), 1, "{} stopped once", name);
    }
}

#[tokio::test]
async fn test_prepare_hook_runs_once_before_devices() {
    let journal = Journal::new();
    let master = Recorder::new("M", &journal).points(3).master(AcqParams::new());
    let mut chain = Chain::new();
    chain
        .add(&master, &Recorder::new("D", &journal).device(AcqParams::new()))
        .unwrap();

    let hook_journal = journal.clone();
    let mut scan = Scan::new(chain).with_prepare_hook(async move {
        hook_journal.record("hook", "run");
        Ok(())
    });
    scan.run().await.unwrap();

    assert_eq!(journal.count("hook", "run"), 1);
    assert!(journal.first("hook", "run") < journal.first("D", "prepare"));
    assert_eq!(journal.count("D", "prepare"), 3);
}

#[tokio::test]
async fn test_empty_chain_scan_is_done() {
    let mut scan = Scan::new(Chain::new());
    assert_ok!(scan.run().await);
    assert_eq!(scan.state(), ScanState::Done);
    assert!(!scan.run_id().is_nil());
}
