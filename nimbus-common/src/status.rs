use serde::{Deserialize, Serialize};
use std::fmt;

// --- VM states ---

/// Coarse VM state as reported by the control plane (`STATE` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    Init,
    Pending,
    Hold,
    Active,
    Stopped,
    Suspended,
    Done,
    Failed,
    Poweroff,
    Undeployed,
    Cloning,
    CloningFailure,
}

impl VmState {
    pub fn from_code(code: i64) -> Option<Self> {
        let state = match code {
            0 => VmState::Init,
            1 => VmState::Pending,
            2 => VmState::Hold,
            3 => VmState::Active,
            4 => VmState::Stopped,
            5 => VmState::Suspended,
            6 => VmState::Done,
            7 => VmState::Failed,
            8 => VmState::Poweroff,
            9 => VmState::Undeployed,
            10 => VmState::Cloning,
            11 => VmState::CloningFailure,
            _ => return None,
        };
        Some(state)
    }

    pub fn code(&self) -> i64 {
        match self {
            VmState::Init => 0,
            VmState::Pending => 1,
            VmState::Hold => 2,
            VmState::Active => 3,
            VmState::Stopped => 4,
            VmState::Suspended => 5,
            VmState::Done => 6,
            VmState::Failed => 7,
            VmState::Poweroff => 8,
            VmState::Undeployed => 9,
            VmState::Cloning => 10,
            VmState::CloningFailure => 11,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Init => "INIT",
            VmState::Pending => "PENDING",
            VmState::Hold => "HOLD",
            VmState::Active => "ACTIVE",
            VmState::Stopped => "STOPPED",
            VmState::Suspended => "SUSPENDED",
            VmState::Done => "DONE",
            VmState::Failed => "FAILED",
            VmState::Poweroff => "POWEROFF",
            VmState::Undeployed => "UNDEPLOYED",
            VmState::Cloning => "CLONING",
            VmState::CloningFailure => "CLONING_FAILURE",
        }
    }
}

// Life-cycle manager sub-states, indexed by LCM_STATE code.
const LCM_STATES: &[&str] = &[
    "LCM_INIT",
    "PROLOG",
    "BOOT",
    "RUNNING",
    "MIGRATE",
    "SAVE_STOP",
    "SAVE_SUSPEND",
    "SAVE_MIGRATE",
    "PROLOG_MIGRATE",
    "PROLOG_RESUME",
    "EPILOG_STOP",
    "EPILOG",
    "SHUTDOWN",
    "CANCEL",
    "FAILURE",
    "CLEANUP_RESUBMIT",
    "UNKNOWN",
    "HOTPLUG",
    "SHUTDOWN_POWEROFF",
    "BOOT_UNKNOWN",
    "BOOT_POWEROFF",
    "BOOT_SUSPENDED",
    "BOOT_STOPPED",
    "CLEANUP_DELETE",
    "HOTPLUG_SNAPSHOT",
    "HOTPLUG_NIC",
    "HOTPLUG_SAVEAS",
    "HOTPLUG_SAVEAS_POWEROFF",
    "HOTPLUG_SAVEAS_SUSPENDED",
    "SHUTDOWN_UNDEPLOY",
    "EPILOG_UNDEPLOY",
    "PROLOG_UNDEPLOY",
    "BOOT_UNDEPLOY",
    "HOTPLUG_PROLOG_POWEROFF",
    "HOTPLUG_EPILOG_POWEROFF",
    "BOOT_MIGRATE",
    "BOOT_FAILURE",
    "BOOT_MIGRATE_FAILURE",
    "PROLOG_MIGRATE_FAILURE",
    "PROLOG_FAILURE",
    "EPILOG_FAILURE",
    "EPILOG_STOP_FAILURE",
    "EPILOG_UNDEPLOY_FAILURE",
    "PROLOG_MIGRATE_POWEROFF",
    "PROLOG_MIGRATE_POWEROFF_FAILURE",
    "PROLOG_MIGRATE_SUSPEND",
    "PROLOG_MIGRATE_SUSPEND_FAILURE",
    "BOOT_UNDEPLOY_FAILURE",
    "BOOT_STOPPED_FAILURE",
    "PROLOG_RESUME_FAILURE",
    "PROLOG_UNDEPLOY_FAILURE",
];

/// Label of an LCM sub-state code (`LCM_<n>` for codes we do not know).
pub fn lcm_state_name(code: i64) -> String {
    usize::try_from(code)
        .ok()
        .and_then(|i| LCM_STATES.get(i))
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("LCM_{}", code))
}

/// Label of the coarse "powered on" projection.
pub const STATUS_ON: &str = "RUNNING";
/// Label of the coarse "powered off" projection.
pub const STATUS_OFF: &str = "POWEROFF";

/// Observed status of an instance.
///
/// The label is the LCM sub-state while the VM is ACTIVE (e.g. `RUNNING`,
/// `BOOT_FAILURE`), and the VM state name otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub state: VmState,
    pub lcm_state: Option<String>,
}

impl InstanceStatus {
    pub fn new(state: VmState) -> Self {
        Self {
            state,
            lcm_state: None,
        }
    }

    pub fn active(lcm_state: &str) -> Self {
        Self {
            state: VmState::Active,
            lcm_state: Some(lcm_state.to_string()),
        }
    }

    pub fn from_codes(state: i64, lcm_state: i64) -> Option<Self> {
        let state = VmState::from_code(state)?;
        let lcm_state = (state == VmState::Active).then(|| lcm_state_name(lcm_state));
        Some(Self { state, lcm_state })
    }

    pub fn running() -> Self {
        Self::active(STATUS_ON)
    }

    pub fn poweroff() -> Self {
        Self::new(VmState::Poweroff)
    }

    pub fn label(&self) -> &str {
        match (&self.state, &self.lcm_state) {
            (VmState::Active, Some(lcm)) => lcm.as_str(),
            (state, _) => state.as_str(),
        }
    }

    pub fn is_on(&self) -> bool {
        self.label() == STATUS_ON
    }

    pub fn is_off(&self) -> bool {
        self.label() == STATUS_OFF
    }

    /// Any `*FAILURE*` label is absorbing: the VM will not leave it on its own.
    pub fn is_failure(&self) -> bool {
        self.label().contains("FAILURE")
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a status poll is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTarget {
    On,
    Off,
    State(VmState),
}

impl StatusTarget {
    pub fn matches(&self, status: &InstanceStatus) -> bool {
        match self {
            StatusTarget::On => status.is_on(),
            StatusTarget::Off => status.is_off(),
            StatusTarget::State(state) => status.state == *state,
        }
    }
}

impl fmt::Display for StatusTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusTarget::On => f.write_str(STATUS_ON),
            StatusTarget::Off => f.write_str(STATUS_OFF),
            StatusTarget::State(state) => f.write_str(state.as_str()),
        }
    }
}
