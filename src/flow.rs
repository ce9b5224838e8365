//! User-driven calibration flow on top of a [`CalibrationSession`].
//!
//! ```text
//! Welcome --any--> Capturing --full / Calibrate--> Calibrating --ok--> Done
//!                      ^                                |  err           |
//!                      +--------------------------------+                |
//!                      +------------------------Capture / Reset---------+
//! ```
//!
//! `Cancel` returns to `Welcome` from every state and drops all samples.

use std::fmt;

use log::{error, info};

use crate::camera::{CalibrationError, CameraParameters};
use crate::frame::FrameSource;
use crate::optimization::ReprojectionErrors;
use crate::session::CalibrationSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Welcome,
    Capturing,
    Calibrating,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    /// Accept the current detection.
    Capture,
    Undo,
    Reset,
    /// Calibrate now, with fewer than the maximum number of samples.
    Calibrate,
    Cancel,
}

/// Receives the outcome of a successful calibration.
pub trait ResultSink {
    fn calibration_result(&mut self, params: &CameraParameters, errors: &ReprojectionErrors);
}

impl<F> ResultSink for F
where
    F: FnMut(&CameraParameters, &ReprojectionErrors),
{
    fn calibration_result(&mut self, params: &CameraParameters, errors: &ReprojectionErrors) {
        self(params, errors)
    }
}

pub struct CalibrationFlow {
    session: CalibrationSession,
    sink: Box<dyn ResultSink>,
    state: FlowState,
}

impl fmt::Debug for CalibrationFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalibrationFlow")
            .field("state", &self.state)
            .field("samples", &self.session.sample_count())
            .finish()
    }
}

impl CalibrationFlow {
    pub fn new(session: CalibrationSession, sink: Box<dyn ResultSink>) -> Self {
        CalibrationFlow {
            session,
            sink,
            state: FlowState::Welcome,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn session(&self) -> &CalibrationSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut CalibrationSession {
        &mut self.session
    }

    /// One capture-loop cycle; see [`CalibrationSession::frame`].
    pub fn frame(&mut self, source: &mut dyn FrameSource) -> Result<bool, CalibrationError> {
        self.session.frame(source)
    }

    /// Overlay text for the current state.
    pub fn status_text(&self) -> String {
        match self.state {
            FlowState::Welcome => "Press capture to begin calibration".to_string(),
            FlowState::Capturing => format!(
                "Captured {}/{}",
                self.session.sample_count(),
                self.session.max_samples()
            ),
            FlowState::Calibrating => "Calibrating...".to_string(),
            FlowState::Done => "Calibration complete".to_string(),
        }
    }

    /// Applies one user event. Returns whether the event had an effect.
    ///
    /// # Errors
    ///
    /// A failed calibration is returned as the error; the flow goes back to
    /// `Capturing` with every sample kept so the user can undo and retake.
    pub fn handle_event(&mut self, event: FlowEvent) -> Result<bool, CalibrationError> {
        if event == FlowEvent::Cancel {
            self.session.reset_all();
            let changed = self.state != FlowState::Welcome;
            self.state = FlowState::Welcome;
            return Ok(changed);
        }

        match self.state {
            FlowState::Welcome => {
                self.state = FlowState::Capturing;
                Ok(true)
            }
            FlowState::Capturing => match event {
                FlowEvent::Capture => {
                    if !self.session.accept_current_result() {
                        return Ok(false);
                    }
                    if self.session.is_full() {
                        self.calibrate()?;
                    }
                    Ok(true)
                }
                FlowEvent::Undo => Ok(self.session.undo_last()),
                FlowEvent::Reset => Ok(self.session.reset_all()),
                FlowEvent::Calibrate => {
                    if self.session.sample_count() < self.session.min_samples() {
                        info!(
                            "need at least {} samples, have {}",
                            self.session.min_samples(),
                            self.session.sample_count()
                        );
                        return Ok(false);
                    }
                    self.calibrate()?;
                    Ok(true)
                }
                FlowEvent::Cancel => Ok(false),
            },
            FlowState::Calibrating => Ok(false),
            FlowState::Done => match event {
                FlowEvent::Capture | FlowEvent::Reset => {
                    self.session.reset_all();
                    self.state = FlowState::Capturing;
                    Ok(true)
                }
                _ => Ok(false),
            },
        }
    }

    fn calibrate(&mut self) -> Result<(), CalibrationError> {
        self.state = FlowState::Calibrating;
        match self.session.solve() {
            Ok((params, errors)) => {
                self.sink.calibration_result(&params, &errors);
                self.state = FlowState::Done;
                Ok(())
            }
            Err(e) => {
                error!("calibration failed: {e}");
                self.state = FlowState::Capturing;
                Err(e)
            }
        }
    }
}
