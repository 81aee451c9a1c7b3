//! The closed registry of collection commands.
//!
//! Modeled as a tagged-variant table rather than runtime polymorphism (spec
//! §9): the set of recognized commands is fixed at compile time, callers
//! cannot inject arbitrary shell strings, and adding a command means adding
//! a variant here, not registering a trait object somewhere at runtime.

/// One entry in the closed command registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKey {
    Cpu,
    Memory,
    Disk,
    Network,
    SysInfo,
    Uptime,
    Load,
}

impl CommandKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKey::Cpu => "cpu",
            CommandKey::Memory => "memory",
            CommandKey::Disk => "disk",
            CommandKey::Network => "network",
            CommandKey::SysInfo => "sysinfo",
            CommandKey::Uptime => "uptime",
            CommandKey::Load => "load",
        }
    }

    /// Commands executed every collection cycle (sysinfo is refreshed on a
    /// separate, slower cadence by the Scheduler).
    pub const PER_CYCLE: [CommandKey; 4] =
        [CommandKey::Cpu, CommandKey::Memory, CommandKey::Disk, CommandKey::Network];
}

/// A registered command's shell text and default timeout.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub key: CommandKey,
    pub command: &'static str,
    pub default_timeout_secs: u64,
}

/// The closed registry. Commands read only `/proc`-derived output or
/// well-known coreutils; none depend on a particular distribution's
/// userland beyond the documented output shape.
pub const REGISTRY: &[CommandSpec] = &[
    CommandSpec {
        key: CommandKey::Cpu,
        command: "cat /proc/stat",
        default_timeout_secs: 5,
    },
    CommandSpec {
        key: CommandKey::Memory,
        command: "free -b",
        default_timeout_secs: 5,
    },
    CommandSpec {
        key: CommandKey::Disk,
        command: "df -B1 -P -x tmpfs -x devtmpfs -x squashfs",
        default_timeout_secs: 8,
    },
    CommandSpec {
        key: CommandKey::Network,
        command: "cat /proc/net/dev",
        default_timeout_secs: 8,
    },
    CommandSpec {
        key: CommandKey::SysInfo,
        command: "uname -a && cat /proc/cpuinfo && cat /proc/meminfo",
        default_timeout_secs: 10,
    },
    CommandSpec {
        key: CommandKey::Uptime,
        command: "uptime",
        default_timeout_secs: 8,
    },
    CommandSpec {
        key: CommandKey::Load,
        command: "cat /proc/loadavg",
        default_timeout_secs: 5,
    },
];

pub fn spec_for(key: CommandKey) -> &'static CommandSpec {
    REGISTRY
        .iter()
        .find(|spec| spec.key == key)
        .expect("REGISTRY covers every CommandKey variant")
}

/// Per-[`CommandKey`] timeout overrides resolved once from [`crate::config::Config`]
/// at startup (spec §6: `command_timeout_s.<key>`), so the Scheduler doesn't
/// re-read the config map on every cycle.
#[derive(Debug, Clone, Copy)]
pub struct CommandTimeouts {
    timeouts: [std::time::Duration; 7],
}

impl CommandTimeouts {
    pub fn from_config(config: &crate::config::Config) -> Self {
        let mut timeouts = [std::time::Duration::ZERO; 7];
        for (i, key) in ALL_KEYS.iter().enumerate() {
            timeouts[i] = config.command_timeout(key.as_str());
        }
        Self { timeouts }
    }

    pub fn get(&self, key: CommandKey) -> std::time::Duration {
        self.timeouts[ALL_KEYS.iter().position(|k| *k == key).expect("ALL_KEYS covers every CommandKey")]
    }
}

const ALL_KEYS: [CommandKey; 7] = [
    CommandKey::Cpu,
    CommandKey::Memory,
    CommandKey::Disk,
    CommandKey::Network,
    CommandKey::SysInfo,
    CommandKey::Uptime,
    CommandKey::Load,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_one_entry_per_key() {
        for key in [
            CommandKey::Cpu,
            CommandKey::Memory,
            CommandKey::Disk,
            CommandKey::Network,
            CommandKey::SysInfo,
            CommandKey::Uptime,
            CommandKey::Load,
        ] {
            assert_eq!(spec_for(key).key, key);
        }
    }

    #[test]
    fn command_timeouts_fall_back_to_spec_defaults_when_unconfigured() {
        let timeouts = CommandTimeouts::from_config(&crate::config::Config::default());
        assert_eq!(timeouts.get(CommandKey::Cpu), std::time::Duration::from_secs(5));
        assert_eq!(timeouts.get(CommandKey::Disk), std::time::Duration::from_secs(8));
        assert_eq!(timeouts.get(CommandKey::SysInfo), std::time::Duration::from_secs(10));
    }

    #[test]
    fn command_timeouts_honor_per_command_override() {
        let mut config = crate::config::Config::default();
        config.command_timeout_s.insert("cpu".to_string(), 2);
        let timeouts = CommandTimeouts::from_config(&config);
        assert_eq!(timeouts.get(CommandKey::Cpu), std::time::Duration::from_secs(2));
        assert_eq!(timeouts.get(CommandKey::Memory), std::time::Duration::from_secs(5));
    }
}
