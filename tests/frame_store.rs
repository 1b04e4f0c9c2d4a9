use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

use sleipnir_base::storage::FrameRepository;
use sleipnir_base::{Camera, Database, Frame, FrameCollection, Game, SleipnirError};

#[test]
fn cameras_upload_concurrently_into_one_flight() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path()).unwrap());
    let frames = Arc::new(FrameCollection::new(db.clone(), Game::SpeedTrap, 6));

    let uploads: Vec<_> = Camera::ALL
        .into_iter()
        .map(|camera| {
            let frames = frames.clone();
            let db = db.clone();
            thread::spawn(move || {
                for position in 1..=50u32 {
                    let timestamp = position as i64 * 11 + camera.index() as i64;
                    let frame = Frame::new(6, camera, position, timestamp, None);
                    frames.add_frame(frame.clone()).unwrap();
                    db.store(Game::SpeedTrap, &frame, &[position as u8]).unwrap();
                }
            })
        })
        .collect();
    for upload in uploads {
        upload.join().unwrap();
    }

    for camera in Camera::ALL {
        assert_eq!(frames.get_frame_count(camera), 50);
        let timestamps = db.load_flight_timestamps(Game::SpeedTrap, 6, camera).unwrap();
        assert_eq!(timestamps.len(), 50);
        assert!(timestamps.windows(2).all(|w| w[0].0 + 1 == w[1].0));
    }
    // Camera B's first frame is 1 ms later, so it defines the start.
    assert_eq!(frames.get_start_timestamp().unwrap(), 12);
    let last = frames.get_last_frame(Camera::A).unwrap().unwrap();
    assert_eq!(frames.time_of(&last).unwrap(), 550 - 12);
}

#[test]
fn gaps_are_rejected_and_purge_starts_over() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path()).unwrap());
    let frames = FrameCollection::new(db.clone(), Game::GateCrasher, 9);

    let first = Frame::new(9, Camera::B, 1, 100, None);
    frames.add_frame(first.clone()).unwrap();
    db.store(Game::GateCrasher, &first, b"jpeg").unwrap();

    match frames.add_frame(Frame::new(9, Camera::B, 3, 122, None)) {
        Err(SleipnirError::SequenceGap {
            camera,
            position,
            expected,
        }) => {
            assert_eq!(camera, Camera::B);
            assert_eq!(position, 3);
            assert_eq!(expected, 2);
        }
        other => panic!("expected a sequence gap, got {:?}", other),
    }

    frames.purge().unwrap();
    assert_eq!(frames.get_frame_count(Camera::B), 0);
    assert!(db.load(Game::GateCrasher, 9, Camera::B, 1).unwrap().is_none());
    assert!(frames.get_frame(Camera::B, 1).unwrap_err().is_not_found());
    frames.add_frame(Frame::new(9, Camera::B, 1, 500, None)).unwrap();
}
