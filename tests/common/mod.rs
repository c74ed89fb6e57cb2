//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camstream::capture::{CaptureSource, Frame, FrameMetadata, PixelFormat};
use camstream::error::CaptureError;
use camstream::CaptureConfig;

/// Minimal valid-looking JPEG payload tagged with `sequence`.
pub fn jpeg_frame(sequence: u64) -> Frame {
    Frame::new(
        vec![0xFFu8, 0xD8, sequence as u8, 0xFF, 0xD9],
        FrameMetadata {
            sequence,
            width: 2,
            height: 2,
            stride: 0,
            format: PixelFormat::Mjpeg,
            device_timestamp: None,
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Frame,
    ReadError,
    /// Block for the whole read timeout, then time out
    Stall,
}

#[derive(Default)]
pub struct Script {
    pub open_results: VecDeque<bool>,
    pub reads: VecDeque<Step>,
    pub opens: u32,
    pub closes: u32,
    pub reads_served: u64,
    pub last_timeout: Option<Duration>,
}

/// Camera double driven by a shared script. Opens succeed and reads yield
/// frames once the script runs out.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    pub script: Arc<Mutex<Script>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_opens(&self, count: usize) -> &Self {
        self.script
            .lock()
            .unwrap()
            .open_results
            .extend(std::iter::repeat(false).take(count));
        self
    }

    pub fn then_reads(&self, steps: &[Step]) -> &Self {
        self.script.lock().unwrap().reads.extend(steps.iter().copied());
        self
    }

    pub fn opens(&self) -> u32 {
        self.script.lock().unwrap().opens
    }

    pub fn closes(&self) -> u32 {
        self.script.lock().unwrap().closes
    }

    pub fn last_timeout(&self) -> Option<Duration> {
        self.script.lock().unwrap().last_timeout
    }
}

impl CaptureSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&mut self, _config: &CaptureConfig) -> Result<(), CaptureError> {
        let mut script = self.script.lock().unwrap();
        script.opens += 1;
        match script.open_results.pop_front() {
            Some(false) => Err(CaptureError::unavailable("scripted", "device busy")),
            _ => Ok(()),
        }
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        let mut script = self.script.lock().unwrap();
        script.last_timeout = Some(timeout);
        match script.reads.pop_front() {
            Some(Step::ReadError) => Err(CaptureError::read("scripted read error")),
            Some(Step::Stall) => {
                drop(script);
                std::thread::sleep(timeout);
                Err(CaptureError::timed_out(timeout))
            }
            _ => {
                script.reads_served += 1;
                Ok(jpeg_frame(script.reads_served))
            }
        }
    }

    fn close(&mut self) {
        self.script.lock().unwrap().closes += 1;
    }
}
