//! Control commands accepted on the WebSocket endpoints

use proxbox_engine::SyncScope;
use std::fmt;

/// A recognized control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `Start`: nodes, then virtual machines
    Start,
    /// `Sync Nodes`
    SyncNodes,
    /// `Sync Virtual Machines`
    SyncVirtualMachines,
}

impl Command {
    /// Exact wire text of the command
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "Start",
            Command::SyncNodes => "Sync Nodes",
            Command::SyncVirtualMachines => "Sync Virtual Machines",
        }
    }

    /// Parse the first text frame of a session. Matching is exact.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "Start" => Some(Command::Start),
            "Sync Nodes" => Some(Command::SyncNodes),
            "Sync Virtual Machines" => Some(Command::SyncVirtualMachines),
            _ => None,
        }
    }

    /// Sync run the command triggers
    pub fn scope(&self) -> SyncScope {
        match self {
            Command::Start => SyncScope::Full,
            Command::SyncNodes => SyncScope::Nodes,
            Command::SyncVirtualMachines => SyncScope::VirtualMachines,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands an endpoint accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSet {
    /// `/ws`: every command
    All,
    /// `/ws/virtual-machine`: virtual machine sync only
    VirtualMachines,
}

impl CommandSet {
    /// Check if the endpoint accepts a command
    pub fn accepts(&self, command: Command) -> bool {
        match self {
            CommandSet::All => true,
            CommandSet::VirtualMachines => command == Command::SyncVirtualMachines,
        }
    }

    /// Parse text and keep it only if this endpoint accepts it
    pub fn parse(&self, text: &str) -> Option<Command> {
        Command::parse(text).filter(|command| self.accepts(*command))
    }
}
