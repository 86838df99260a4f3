use std::fmt;
use std::str::FromStr;

pub enum LauncherEvent {
    /// A command typed by the user.
    Command(Command),
    /// A filtered output line from the managed application, or a progress
    /// line from a launch or update.
    Output(String),
    /// An observer fired: the supervisor settled into a new state.
    StatusChanged,
    /// A background operation finished with a message for the user, or an
    /// error that needs attention.
    TaskFinished {
        task: TaskKind,
        result: Result<String, String>,
    },
    /// Ctrl+C received or stdin closed; stop the managed process and exit.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Launch,
    Stop,
    Update,
    Reinstall,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskKind::Launch => "launch",
            TaskKind::Stop => "stop",
            TaskKind::Update => "update",
            TaskKind::Reinstall => "reinstall",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    /// Start when idle, stop when running.
    Toggle,
    CheckUpdates,
    Reinstall,
    Companion(bool),
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "commands: start | stop | toggle | update | reinstall | companion on|off | status | help | quit";

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace().map(str::to_ascii_lowercase);
        let Some(verb) = words.next() else {
            return Err("empty command".to_string());
        };
        let arg = words.next();
        let command = match (verb.as_str(), arg.as_deref()) {
            ("start" | "launch", None) => Command::Start,
            ("stop", None) => Command::Stop,
            ("toggle", None) => Command::Toggle,
            ("update" | "check", None) => Command::CheckUpdates,
            ("reinstall", None) => Command::Reinstall,
            ("companion" | "tf2", Some("on" | "true" | "yes")) => Command::Companion(true),
            ("companion" | "tf2", Some("off" | "false" | "no")) => Command::Companion(false),
            ("status", None) => Command::Status,
            ("help" | "?", None) => Command::Help,
            ("quit" | "exit", None) => Command::Quit,
            _ => return Err(format!("unknown command: {}", s.trim())),
        };
        Ok(command)
    }
}
