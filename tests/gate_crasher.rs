mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sleipnir_base::event::Event;
use sleipnir_base::{Camera, Direction, Discipline, GateCrasher, SleipnirError};

#[test]
fn drag_race_is_timed_gate_by_gate_and_finishes_the_run() {
    let mut rig = common::rig();
    rig.bring_cameras_online();

    let mut gate_crasher = GateCrasher::new(rig.station.clone(), 2).unwrap();
    gate_crasher.set_level_by_name("Drag Race").unwrap();
    let gate_crasher = Arc::new(Mutex::new(gate_crasher));
    rig.events.subscribe(gate_crasher.clone());
    gate_crasher.lock().unwrap().start_run().unwrap();

    rig.fly_right(Camera::A, 1_000);
    assert_eq!(gate_crasher.lock().unwrap().current_gate(), 1);
    assert!(gate_crasher.lock().unwrap().current_runtime_ms() > 0);

    rig.clock.advance(Duration::from_secs(1));
    rig.fly_right(Camera::B, 3_000);
    let seen = rig.drain();

    let hits: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            Event::GateHit(hit) => Some(hit.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].gate_number, 0);
    assert_eq!(hits[0].camera, Camera::A);
    assert_eq!(hits[0].time_ms, 0);
    assert_eq!(hits[1].gate_number, 1);
    assert_eq!(hits[1].direction, Direction::Right);
    assert_eq!(hits[1].time_ms, 2_000);
    assert!(seen
        .iter()
        .any(|e| matches!(e, Event::CourseFinished { total_ms: 2_000 })));

    // Finishing the course ends the run and persists the gates.
    assert!(!gate_crasher.lock().unwrap().is_running());
    assert!(!rig.server.is_accepting());
    assert_eq!(rig.db.fetch_gate_announcements(2).unwrap(), hits);
}

#[test]
fn missed_gate_restarts_the_course() {
    let mut rig = common::rig();
    rig.bring_cameras_online();

    let mut gate_crasher = GateCrasher::new(rig.station.clone(), 2).unwrap();
    gate_crasher.set_level_by_name("Drag Race").unwrap();
    let gate_crasher = Arc::new(Mutex::new(gate_crasher));
    rig.events.subscribe(gate_crasher.clone());
    gate_crasher.lock().unwrap().start_run().unwrap();

    rig.fly_right(Camera::A, 1_000);
    assert_eq!(gate_crasher.lock().unwrap().announcements().len(), 1);
    rig.drain();

    rig.clock.advance(Duration::from_millis(15_001));
    let still = common::sky_with_plane(0, 200);
    rig.upload(Camera::B, 1, 30_000, &still);
    let seen = rig.drain();

    assert!(seen.iter().any(|e| matches!(e, Event::CourseRestarted)));
    let gate_crasher = gate_crasher.lock().unwrap();
    assert_eq!(gate_crasher.current_gate(), 0);
    assert!(gate_crasher.announcements().is_empty());
    assert_eq!(gate_crasher.current_runtime_ms(), 0);
}

#[test]
fn level_selection_is_locked_during_a_run() {
    let mut rig = common::rig();
    rig.bring_cameras_online();

    let mut gate_crasher = GateCrasher::new(rig.station.clone(), 2).unwrap();
    assert_eq!(gate_crasher.level().name, "Daytona");
    assert_eq!(gate_crasher.level_names(), vec!["Daytona", "Imola", "Drag Race"]);
    gate_crasher.set_level(1).unwrap();
    assert_eq!(gate_crasher.level().name, "Imola");
    assert!(gate_crasher.set_level(3).is_err());
    assert!(gate_crasher.set_level_by_name("Monza").is_err());

    gate_crasher.start_run().unwrap();
    assert!(matches!(
        gate_crasher.set_level(0),
        Err(SleipnirError::IllegalState(_))
    ));
    gate_crasher.stop_run().unwrap();
    gate_crasher.set_level(0).unwrap();
}
