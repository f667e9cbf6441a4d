//! Report payloads published by the broker.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};
use tokio::sync::watch;
use vprinter_core::identity::FIRMWARE_VERSION;

use crate::discovery::ADVERTISED_SIGNAL_DBM;

/// Topic every report is published on.
pub fn report_topic(serial: &str) -> String {
    format!("device/{serial}/report")
}

/// Topic slicers publish commands on.
pub fn request_topic(serial: &str) -> String {
    format!("device/{serial}/request")
}

/// Printer state as carried in `gcode_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcodeState {
    #[default]
    Idle,
    Prepare,
    Running,
    Pause,
    Finish,
    Failed,
}

impl GcodeState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Prepare => "PREPARE",
            Self::Running => "RUNNING",
            Self::Pause => "PAUSE",
            Self::Finish => "FINISH",
            Self::Failed => "FAILED",
        }
    }
}

/// Job fields reported to every connected slicer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobState {
    pub state: GcodeState,
    pub filename: String,
    pub prepare_percent: u8,
}

impl JobState {
    fn new(state: GcodeState, filename: &str, prepare_percent: u8) -> Self {
        Self {
            state,
            filename: filename.to_string(),
            prepare_percent: prepare_percent.min(100),
        }
    }
}

/// Identifies one write to a [`JobTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision(u64);

/// Shared job state.
///
/// The lifecycle manager writes it while processing an upload; the broker's
/// push task and sessions read it. Cloning shares the same state.
///
/// Every write bumps a revision, always under the channel's lock, so a writer
/// can later replace only its own state with [`JobTracker::replace_if_current`].
#[derive(Debug, Clone)]
pub struct JobTracker {
    tx: Arc<watch::Sender<JobState>>,
    revision: Arc<AtomicU64>,
}

impl JobTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(JobState::default());
        Self {
            tx: Arc::new(tx),
            revision: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the job state. `prepare_percent` is clamped to 100.
    pub fn set_job_state(&self, state: GcodeState, filename: &str, prepare_percent: u8) -> Revision {
        let mut written = Revision(0);
        self.tx.send_modify(|job| {
            *job = JobState::new(state, filename, prepare_percent);
            written = self.bump();
        });
        written
    }

    /// Replace the job state only if nobody wrote since `expected`.
    ///
    /// Returns the new revision, or `None` when another writer took over.
    pub fn replace_if_current(
        &self,
        expected: Revision,
        state: GcodeState,
        filename: &str,
        prepare_percent: u8,
    ) -> Option<Revision> {
        let mut written = None;
        self.tx.send_if_modified(|job| {
            if Revision(self.revision.load(Ordering::Acquire)) != expected {
                return false;
            }
            *job = JobState::new(state, filename, prepare_percent);
            written = Some(self.bump());
            true
        });
        written
    }

    fn bump(&self) -> Revision {
        Revision(self.revision.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn current(&self) -> JobState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.tx.subscribe()
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Full status snapshot, the `push_status` report.
pub fn status_report(job: &JobState, sequence_id: u64) -> Value {
    let subtask = Path::new(&job.filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let print_type = if job.state == GcodeState::Idle { "idle" } else { "local" };

    json!({
        "print": {
            "command": "push_status",
            "msg": 0,
            "sequence_id": sequence_id.to_string(),
            "gcode_state": job.state.as_str(),
            "gcode_file": job.filename,
            "subtask_name": subtask,
            "print_type": print_type,
            "gcode_file_prepare_percent": job.prepare_percent.to_string(),
            "mc_percent": 0,
            "mc_remaining_time": 0,
            "mc_print_stage": "1",
            "layer_num": 0,
            "total_layer_num": 0,
            "nozzle_temper": 25.0,
            "nozzle_target_temper": 0.0,
            "bed_temper": 25.0,
            "bed_target_temper": 0.0,
            "chamber_temper": 25.0,
            "cooling_fan_speed": "0",
            "spd_lvl": 1,
            "spd_mag": 100,
            "wifi_signal": format!("{ADVERTISED_SIGNAL_DBM}dBm"),
            "sdcard": true,
            "home_flag": 0,
            "hms": [],
            "lights_report": [{"node": "chamber_light", "mode": "off"}],
            "ipcam": {"ipcam_dev": "0", "ipcam_record": "disable", "timelapse": "disable"},
            "upgrade_state": {"status": "IDLE", "progress": "", "message": ""},
        }
    })
}

/// Module table answering `get_version`.
pub fn version_report(serial: &str, sequence_id: &str) -> Value {
    let module = |name: &str| {
        json!({
            "name": name,
            "sw_ver": FIRMWARE_VERSION,
            "hw_ver": "",
            "sn": serial,
        })
    };
    json!({
        "info": {
            "command": "get_version",
            "sequence_id": sequence_id,
            "module": [module("ota"), module("mc")],
            "result": "success",
            "reason": "",
        }
    })
}

/// Acknowledgement of a `print` command.
///
/// `project_file` acks also carry the job state so slicers show "preparing"
/// without waiting for the next push.
pub fn command_ack(command: &str, sequence_id: &str, job: &JobState) -> Value {
    let mut ack = json!({
        "print": {
            "command": command,
            "sequence_id": sequence_id,
            "result": "success",
            "reason": "success",
        }
    });
    if command == "project_file" {
        ack["print"]["gcode_state"] = json!(job.state.as_str());
        ack["print"]["gcode_file"] = json!(job.filename);
        ack["print"]["gcode_file_prepare_percent"] = json!(job.prepare_percent.to_string());
    }
    ack
}
