use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::LifecycleError;

/// Signals a caller may request through `Container::kill`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopSignal {
    #[serde(rename = "SIGHUP")]
    Hup,
    #[serde(rename = "SIGINT")]
    Int,
    #[serde(rename = "SIGQUIT")]
    Quit,
    #[default]
    #[serde(rename = "SIGKILL")]
    Kill,
    #[serde(rename = "SIGTERM")]
    Term,
}

impl StopSignal {
    pub fn number(self) -> i32 {
        match self {
            Self::Hup => 1,
            Self::Int => 2,
            Self::Quit => 3,
            Self::Kill => 9,
            Self::Term => 15,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hup => "SIGHUP",
            Self::Int => "SIGINT",
            Self::Quit => "SIGQUIT",
            Self::Kill => "SIGKILL",
            Self::Term => "SIGTERM",
        }
    }

    /// Exit status a shell reports for a process terminated by this signal.
    pub fn exit_code(self) -> i32 {
        128 + self.number()
    }
}

impl std::fmt::Display for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StopSignal {
    type Err = LifecycleError;

    /// Accepts `SIGTERM`, `TERM`, `term` or `15`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(upper.as_str());
        match bare {
            "HUP" | "1" => Ok(Self::Hup),
            "INT" | "2" => Ok(Self::Int),
            "QUIT" | "3" => Ok(Self::Quit),
            "KILL" | "9" => Ok(Self::Kill),
            "TERM" | "15" => Ok(Self::Term),
            _ => Err(LifecycleError::SignalDeliveryFailed(format!(
                "unsupported signal: {}",
                s
            ))),
        }
    }
}

/// Deliver `signal` to the process with the given pid.
#[cfg(unix)]
pub fn deliver(pid: u32, signal: StopSignal) -> Result<(), LifecycleError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let sig = match signal {
        StopSignal::Hup => Signal::SIGHUP,
        StopSignal::Int => Signal::SIGINT,
        StopSignal::Quit => Signal::SIGQUIT,
        StopSignal::Kill => Signal::SIGKILL,
        StopSignal::Term => Signal::SIGTERM,
    };
    kill(Pid::from_raw(pid as i32), sig).map_err(|e| {
        LifecycleError::SignalDeliveryFailed(format!("{} to pid {}: {}", signal, pid, e))
    })
}

#[cfg(not(unix))]
pub fn deliver(pid: u32, signal: StopSignal) -> Result<(), LifecycleError> {
    Err(LifecycleError::SignalDeliveryFailed(format!(
        "{} to pid {}: signals are not supported on this platform",
        signal, pid
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_spellings() {
        assert_eq!("SIGTERM".parse::<StopSignal>().unwrap(), StopSignal::Term);
        assert_eq!("term".parse::<StopSignal>().unwrap(), StopSignal::Term);
        assert_eq!("9".parse::<StopSignal>().unwrap(), StopSignal::Kill);
        assert_eq!(" sigint ".parse::<StopSignal>().unwrap(), StopSignal::Int);
        assert!("SIGUSR1".parse::<StopSignal>().is_err());
    }

    #[test]
    fn exit_codes_follow_shell_convention() {
        assert_eq!(StopSignal::Kill.exit_code(), 137);
        assert_eq!(StopSignal::Term.exit_code(), 143);
    }

    #[test]
    fn serde_uses_signal_names() {
        let json = serde_json::to_string(&StopSignal::Term).unwrap();
        assert_eq!(json, "\"SIGTERM\"");
        let back: StopSignal = serde_json::from_str("\"SIGHUP\"").unwrap();
        assert_eq!(back, StopSignal::Hup);
    }

    #[cfg(unix)]
    #[test]
    fn delivering_to_missing_pid_fails() {
        // pid_max on Linux tops out well below this
        let err = deliver(0x3fff_fff0, StopSignal::Term).unwrap_err();
        assert_eq!(err.error_code(), "signal_delivery_failed");
    }
}
