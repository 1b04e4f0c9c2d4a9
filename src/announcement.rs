//! Scored results and their persistence.
//!
//! Announcements are immutable once created. A flight's announcements are
//! written as a whole when a run stops, replacing whatever was stored before.

use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::SleipnirResult;
use crate::frame::Camera;
use crate::storage::Database;
use crate::Direction;

/// A completed Speed-Trap pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeedAnnouncement {
    pub cam1_position: u32,
    pub cam2_position: u32,
    pub duration_ms: i64,
    pub speed_kmh: f64,
    pub direction: Direction,
}

/// One gate hit in a Gate-Crasher run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateAnnouncement {
    pub level_name: String,
    pub gate_number: u32,
    pub camera: Camera,
    pub position: u32,
    pub timestamp: i64,
    pub direction: Direction,
    /// Time since the previous gate, 0 for the first gate.
    pub time_ms: i64,
}

/// Fastest pass in each direction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaxSpeeds {
    pub right: Option<SpeedAnnouncement>,
    pub left: Option<SpeedAnnouncement>,
}

pub fn max_speeds(announcements: &[SpeedAnnouncement]) -> MaxSpeeds {
    let mut out = MaxSpeeds::default();
    for announcement in announcements {
        let slot = match announcement.direction {
            Direction::Right => &mut out.right,
            Direction::Left => &mut out.left,
        };
        // Later passes win ties.
        let replace = slot
            .as_ref()
            .map_or(true, |best| best.speed_kmh <= announcement.speed_kmh);
        if replace {
            *slot = Some(announcement.clone());
        }
    }
    out
}

impl Database {
    pub fn store_speed_announcements(
        &self,
        flight: u32,
        announcements: &[SpeedAnnouncement],
    ) -> SleipnirResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM speed_trap_announcement WHERE flight = ?1",
            params![flight],
        )?;
        for announcement in announcements {
            tx.execute(
                r#"
                INSERT INTO speed_trap_announcement
                  (flight, cam1_position, cam2_position, duration, speed, direction)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    flight,
                    announcement.cam1_position,
                    announcement.cam2_position,
                    announcement.duration_ms,
                    announcement.speed_kmh,
                    announcement.direction.signum()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn fetch_speed_announcements(&self, flight: u32) -> SleipnirResult<Vec<SpeedAnnouncement>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT cam1_position, cam2_position, duration, speed, direction
            FROM speed_trap_announcement WHERE flight = ?1 ORDER BY id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![flight])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let direction: i32 = row.get(4)?;
            out.push(SpeedAnnouncement {
                cam1_position: row.get(0)?,
                cam2_position: row.get(1)?,
                duration_ms: row.get(2)?,
                speed_kmh: row.get(3)?,
                direction: Direction::from_signum(direction).unwrap_or(Direction::Right),
            });
        }
        Ok(out)
    }

    pub fn store_gate_announcements(
        &self,
        flight: u32,
        announcements: &[GateAnnouncement],
    ) -> SleipnirResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM gate_crasher_announcement WHERE flight = ?1",
            params![flight],
        )?;
        for announcement in announcements {
            // angle and altitude are reserved columns; nothing classifies them yet.
            tx.execute(
                r#"
                INSERT INTO gate_crasher_announcement
                  (flight, level_name, gate_number, camera, position, timestamp,
                   direction, angle, altitude, time)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8)
                "#,
                params![
                    flight,
                    announcement.level_name,
                    announcement.gate_number,
                    announcement.camera.db_id(),
                    announcement.position,
                    announcement.timestamp,
                    announcement.direction.signum(),
                    announcement.time_ms
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn fetch_gate_announcements(&self, flight: u32) -> SleipnirResult<Vec<GateAnnouncement>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT level_name, gate_number, camera, position, timestamp, direction, time
            FROM gate_crasher_announcement WHERE flight = ?1 ORDER BY id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![flight])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let camera: i64 = row.get(2)?;
            let direction: i32 = row.get(5)?;
            out.push(GateAnnouncement {
                level_name: row.get(0)?,
                gate_number: row.get(1)?,
                camera: Camera::from_db_id(camera).unwrap_or(Camera::B),
                position: row.get(3)?,
                timestamp: row.get(4)?,
                direction: Direction::from_signum(direction).unwrap_or(Direction::Right),
                time_ms: row.get(6)?,
            });
        }
        Ok(out)
    }
}
