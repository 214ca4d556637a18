//! Jail state machine
//!
//! Lifecycle transitions are enforced by the state-machines crate in dynamic
//! dispatch mode; [`JailStatus`] is the public view of the machine's state.

use serde::Serialize;
use std::fmt;

use state_machines::state_machine;

state_machine! {
    name: JailMachine,
    dynamic: true,
    initial: Stopped,
    states: [Stopped, Starting, Running, Stopping, Failed],
    events {
        start {
            transition: { from: Stopped, to: Starting }
        }
        started {
            transition: { from: Starting, to: Running }
        }
        stop {
            transition: { from: [Running, Failed], to: Stopping }
        }
        stopped {
            transition: { from: Stopping, to: Stopped }
        }
        fail {
            transition: { from: [Starting, Stopping], to: Failed }
        }
    }
}

/// Lifecycle status of a jail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum JailStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    /// A start or stop failed; recover with stop or destroy
    Error = 4,
}

impl JailStatus {
    /// Map a machine state name to a status
    pub fn from_state(state: &str) -> Self {
        match state {
            "Starting" => JailStatus::Starting,
            "Running" => JailStatus::Running,
            "Stopping" => JailStatus::Stopping,
            "Failed" => JailStatus::Error,
            _ => JailStatus::Stopped,
        }
    }

    /// Decode the value stored in the manager's atomic status cell
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => JailStatus::Starting,
            2 => JailStatus::Running,
            3 => JailStatus::Stopping,
            4 => JailStatus::Error,
            _ => JailStatus::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JailStatus::Stopped => "STOPPED",
            JailStatus::Starting => "STARTING",
            JailStatus::Running => "RUNNING",
            JailStatus::Stopping => "STOPPING",
            JailStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for JailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Lifecycle events accepted by [`Lifecycle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Started,
    Stop,
    Stopped,
    Fail,
}

impl Transition {
    fn event(self) -> JailMachineEvent {
        match self {
            Transition::Start => JailMachineEvent::Start,
            Transition::Started => JailMachineEvent::Started,
            Transition::Stop => JailMachineEvent::Stop,
            Transition::Stopped => JailMachineEvent::Stopped,
            Transition::Fail => JailMachineEvent::Fail,
        }
    }
}

/// Dynamic-dispatch state machine for one jail
pub struct Lifecycle {
    machine: DynamicJailMachine<()>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            machine: JailMachine::new(()).into_dynamic(),
        }
    }

    /// Current status
    pub fn status(&self) -> JailStatus {
        JailStatus::from_state(self.machine.current_state())
    }

    /// Fire an event, returning the rejection reason if the machine refuses it
    pub fn fire(&mut self, transition: Transition) -> Result<JailStatus, String> {
        self.machine
            .handle(transition.event())
            .map_err(|e| format!("{:?} rejected: {:?}", transition, e))?;
        Ok(self.status())
    }

    /// Drive a fresh machine to an already-established status
    ///
    /// Used when runtime state is restored from disk.
    pub fn resume(status: JailStatus) -> Self {
        let mut lifecycle = Self::new();
        let path: &[Transition] = match status {
            JailStatus::Stopped => &[],
            JailStatus::Starting => &[Transition::Start],
            JailStatus::Running => &[Transition::Start, Transition::Started],
            JailStatus::Stopping => &[Transition::Start, Transition::Started, Transition::Stop],
            JailStatus::Error => &[Transition::Start, Transition::Fail],
        };
        for step in path {
            // Each path is valid from Stopped
            let _ = lifecycle.fire(*step);
        }
        lifecycle
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
