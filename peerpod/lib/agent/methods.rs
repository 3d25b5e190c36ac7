//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The in-VM agent's main service.
pub const AGENT_SERVICE: &str = "grpc.AgentService";

/// The in-VM agent's health service.
pub const HEALTH_SERVICE: &str = "grpc.Health";

/// The methods of [`AGENT_SERVICE`].
pub const AGENT_METHODS: &[&str] = &[
    "CreateContainer",
    "StartContainer",
    "RemoveContainer",
    "ExecProcess",
    "SignalProcess",
    "WaitProcess",
    "UpdateContainer",
    "UpdateEphemeralMounts",
    "StatsContainer",
    "PauseContainer",
    "ResumeContainer",
    "RemoveStaleVirtiofsShareMounts",
    "WriteStdin",
    "ReadStdout",
    "ReadStderr",
    "CloseStdin",
    "TtyWinResize",
    "UpdateInterface",
    "UpdateRoutes",
    "ListInterfaces",
    "ListRoutes",
    "AddARPNeighbors",
    "GetIPTables",
    "SetIPTables",
    "GetMetrics",
    "MemAgentMemcgSet",
    "MemAgentCompactSet",
    "CreateSandbox",
    "DestroySandbox",
    "OnlineCPUMem",
    "ReseedRandomDev",
    "GetGuestDetails",
    "MemHotplugByProbe",
    "SetGuestDateTime",
    "CopyFile",
    "GetOOMEvent",
    "AddSwap",
    "AddSwapPath",
    "GetVolumeStats",
    "ResizeVolume",
    "SetPolicy",
    "PullImage",
];

/// The methods of [`HEALTH_SERVICE`].
pub const HEALTH_METHODS: &[&str] = &["Check", "Version"];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An agent method that gets more than plain forwarding somewhere along the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMethod {
    /// `CreateContainer`.
    CreateContainer,

    /// `CreateSandbox`.
    CreateSandbox,

    /// `SetPolicy`.
    SetPolicy,

    /// `StartContainer`.
    StartContainer,

    /// `RemoveContainer`.
    RemoveContainer,

    /// `DestroySandbox`.
    DestroySandbox,

    /// `PullImage`.
    PullImage,

    /// Any other method of the agent surface.
    Other,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether `service/method` belongs to the agent surface.
pub fn is_agent_method(service: &str, method: &str) -> bool {
    match service {
        AGENT_SERVICE => AGENT_METHODS.contains(&method),
        HEALTH_SERVICE => HEALTH_METHODS.contains(&method),
        _ => false,
    }
}

/// Classifies an agent service method.
pub fn agent_method(service: &str, method: &str) -> AgentMethod {
    if service != AGENT_SERVICE {
        return AgentMethod::Other;
    }

    match method {
        "CreateContainer" => AgentMethod::CreateContainer,
        "CreateSandbox" => AgentMethod::CreateSandbox,
        "SetPolicy" => AgentMethod::SetPolicy,
        "StartContainer" => AgentMethod::StartContainer,
        "RemoveContainer" => AgentMethod::RemoveContainer,
        "DestroySandbox" => AgentMethod::DestroySandbox,
        "PullImage" => AgentMethod::PullImage,
        _ => AgentMethod::Other,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_surface() {
        assert_eq!(AGENT_METHODS.len() + HEALTH_METHODS.len(), 44);
        assert!(is_agent_method(AGENT_SERVICE, "ExecProcess"));
        assert!(is_agent_method(HEALTH_SERVICE, "Check"));
        assert!(!is_agent_method(HEALTH_SERVICE, "ExecProcess"));
        assert!(!is_agent_method("grpc.Other", "Check"));

        assert_eq!(
            agent_method(AGENT_SERVICE, "CreateSandbox"),
            AgentMethod::CreateSandbox
        );
        assert_eq!(agent_method(HEALTH_SERVICE, "CreateSandbox"), AgentMethod::Other);
        assert_eq!(agent_method(AGENT_SERVICE, "ReadStdout"), AgentMethod::Other);
    }
}
