//! Homing sequence.
//!
//! Homing drives every axis onto its reference switch and redefines the
//! controller counters there as zero. The lateral axis has one sensor for both
//! ends of travel, so an active sensor at the start is disambiguated with a short
//! forward probe before anything else moves.
//!
//! Phases:
//! 1. power-cycle the motors and pick the homing speed
//! 2. probe the shared lateral sensor if it is active
//! 3. back every axis off its reference direction
//! 4. jog every axis toward its reference switch and wait
//! 5. verify the stop codes, check fault flags and zero the counters

use super::actor::RigActor;
use super::fault::RigFault;
use super::status::{Direction, LimitState, Status, StopCode};
use crate::axis::{Axis, PerAxisSpeed};
use crate::protocol::Command;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

impl RigActor {
    #[instrument(skip(self), err)]
    pub(super) async fn home(&mut self, seq: u64) -> Result<(), RigFault> {
        info!("Homing started");
        self.status = Status::Homing;
        self.position_known = false;
        self.motion_seq = None;
        self.publish();

        self.link.execute(&Command::Stop).await?;
        self.link.execute(&Command::MotorsOff).await?;
        tokio::time::sleep(self.timing.retry_sleep).await;
        self.link.execute(&Command::ServoHere).await?;
        let speed = self.model.scale_speed(self.motion.homing_speed);

        self.probe_shared_sensor(speed).await?;
        self.back_off(speed).await?;
        let seeking = self.seek_reference(speed).await?;

        for axis in seeking {
            let expected = StopCode::limit_for(axis.homing_direction());
            let actual = self.telemetry[axis.index()].stop_code;
            if let Some(expected) = expected {
                if actual != expected {
                    return Err(RigFault::HomingFailed {
                        axis,
                        expected,
                        actual,
                    });
                }
            }
        }

        let faults = self.link.faults().await?;
        if !faults.is_empty() {
            return Err(RigFault::Hardware(faults));
        }

        tokio::time::sleep(self.timing.settle_time).await;
        for axis in Axis::ALL {
            self.link
                .execute(&Command::DefinePosition(axis.channel(), 0))
                .await?;
        }
        for axis in Axis::ALL {
            let t = &mut self.telemetry[axis.index()];
            t.limit_state = LimitState::reached_by(axis.homing_direction());
            t.movement_direction = Direction::None;
        }
        self.position_known = true;
        self.configure_limits().await?;
        for axis in Axis::ALL {
            let channel = axis.channel();
            let position = self.link.position(channel).await?;
            let stop_code = self.link.stop_code(channel).await?;
            let t = &mut self.telemetry[axis.index()];
            t.position_counts = position;
            t.stop_code = stop_code;
        }

        self.status = Status::Stopped;
        self.settled_seq = seq;
        info!("Homing complete");
        Ok(())
    }

    /// Resolve which end of travel an active lateral sensor belongs to.
    async fn probe_shared_sensor(&mut self, speed: PerAxisSpeed) -> Result<(), RigFault> {
        let lateral = Axis::Lateral;
        let channel = lateral.channel();
        if !self.link.forward_limit_active(channel).await? {
            self.telemetry[lateral.index()].limit_state = LimitState::Clear;
            return Ok(());
        }

        debug!("Lateral sensor active, probing forward");
        for t in &mut self.telemetry {
            t.movement_direction = Direction::None;
        }
        let t = &mut self.telemetry[lateral.index()];
        t.limit_state = LimitState::AtNegative;
        t.movement_direction = Direction::Forward;
        self.configure_limits().await?;

        let distance = self.model.to_counts(lateral, self.motion.probe_distance);
        self.link
            .execute(&Command::Speed(channel, speed.get(lateral)))
            .await?;
        self.link
            .execute(&Command::PositionRelative(channel, distance))
            .await?;
        self.link.execute(&Command::Begin(vec![channel])).await?;
        self.wait_motion_complete(&[lateral]).await?;

        let still_active = self.link.forward_limit_active(channel).await?;
        let t = &mut self.telemetry[lateral.index()];
        t.limit_state = if still_active {
            LimitState::AtPositive
        } else {
            LimitState::Clear
        };
        t.movement_direction = Direction::None;
        debug!(limit = ?t.limit_state, "Lateral sensor resolved");
        Ok(())
    }

    /// Move every axis a short way against its homing direction.
    ///
    /// An axis already pinned in the back-off direction stays where it is.
    async fn back_off(&mut self, speed: PerAxisSpeed) -> Result<(), RigFault> {
        let mut moving = Vec::new();
        for axis in Axis::ALL {
            let direction = axis.homing_direction().opposite();
            let t = &mut self.telemetry[axis.index()];
            if t.limit_state.blocks(direction) {
                debug!(%axis, "Already at limit, skipping back-off");
                t.movement_direction = Direction::None;
            } else {
                t.movement_direction = direction;
                moving.push(axis);
            }
        }
        if moving.is_empty() {
            return Ok(());
        }

        self.configure_limits().await?;
        for axis in &moving {
            let channel = axis.channel();
            let distance = self.model.to_counts(*axis, self.motion.backoff_distance);
            let sign = self.telemetry[axis.index()].movement_direction.sign();
            self.link
                .execute(&Command::Speed(channel, speed.get(*axis)))
                .await?;
            self.link
                .execute(&Command::PositionRelative(channel, sign * distance))
                .await?;
        }
        self.link
            .execute(&Command::Begin(Self::channels(&moving)))
            .await?;
        self.wait_motion_complete(&moving).await?;
        for t in &mut self.telemetry {
            t.movement_direction = Direction::None;
        }
        Ok(())
    }

    /// Jog toward the reference switches; returns the axes that moved.
    async fn seek_reference(&mut self, speed: PerAxisSpeed) -> Result<Vec<Axis>, RigFault> {
        let mut seeking = Vec::new();
        for axis in Axis::ALL {
            let direction = axis.homing_direction();
            let t = &mut self.telemetry[axis.index()];
            if t.limit_state == LimitState::reached_by(direction) {
                debug!(%axis, "Already on reference switch");
                t.movement_direction = Direction::None;
            } else {
                t.movement_direction = direction;
                seeking.push(axis);
            }
        }
        if seeking.is_empty() {
            return Ok(seeking);
        }

        self.configure_limits().await?;
        for axis in &seeking {
            let sign = axis.homing_direction().sign();
            self.link
                .execute(&Command::Jog(axis.channel(), sign * speed.get(*axis)))
                .await?;
        }
        self.link
            .execute(&Command::Begin(Self::channels(&seeking)))
            .await?;
        self.wait_motion_complete(&seeking).await?;
        Ok(seeking)
    }

    /// Wait until none of `axes` is running, keeping limit enablement current.
    pub(super) async fn wait_motion_complete(&mut self, axes: &[Axis]) -> Result<(), RigFault> {
        let deadline = Instant::now() + self.timing.homing_timeout;
        loop {
            for axis in axes {
                let code = self.link.stop_code(axis.channel()).await?;
                self.telemetry[axis.index()].stop_code = code;
            }
            self.update_limits().await?;

            if !axes
                .iter()
                .any(|a| self.telemetry[a.index()].stop_code.is_running())
            {
                break;
            }
            if Instant::now() >= deadline {
                warn!(?axes, "Motion did not complete in time, stopping");
                if let Err(e) = self.link.execute(&Command::Stop).await {
                    warn!(error = %e, "Stop failed after homing timeout");
                }
                return Err(RigFault::HomingTimeout(self.timing.homing_timeout));
            }
            tokio::time::sleep(self.timing.retry_sleep).await;
        }

        for axis in axes {
            let t = &mut self.telemetry[axis.index()];
            match t.stop_code {
                StopCode::DecelStopFwdLim => t.limit_state = LimitState::AtPositive,
                StopCode::DecelStopRevLim => t.limit_state = LimitState::AtNegative,
                _ => {}
            }
        }
        Ok(())
    }
}
