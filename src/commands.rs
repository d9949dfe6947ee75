//! GDB/MI command sets for each session lifecycle phase
//!
//! Everything here is a pure function of the session configuration. OpenOCD-specific
//! commands are routed through gdb's `monitor` passthrough via `interpreter-exec console`.

use crate::config::{RequestKind, ResolvedRttConfig, SessionConfig};
use crate::error::{ControllerError, Result};

const RESET_HALT: &str = "reset halt";
const HALT: &str = "halt";

/// Wrap an OpenOCD command so gdb forwards it to the server
pub fn monitor(command: &str) -> String {
    format!("interpreter-exec console \"monitor {}\"", command)
}

/// Select OpenOCD's gdb port as the remote target
pub fn init_commands(config: &SessionConfig) -> Result<Vec<String>> {
    let target = config.gdb_target.trim();
    if target.is_empty() {
        return Err(ControllerError::InvalidConfig("gdbTarget must not be empty".to_string()));
    }
    Ok(vec![format!("target-select extended-remote {}", target)])
}

/// Download the program, then force a reset-and-halt
pub fn launch_commands(config: &SessionConfig) -> Result<Vec<String>> {
    let mut commands = download_commands(config, &[monitor(RESET_HALT)])?;
    commands.push(monitor(RESET_HALT));
    Ok(commands)
}

/// Halt only. Attach must never reset a running target.
pub fn attach_commands() -> Vec<String> {
    vec![monitor(HALT)]
}

pub fn restart_commands() -> Vec<String> {
    vec![monitor(RESET_HALT)]
}

/// RTT setup sequence for a fresh launch or attach.
///
/// The trailing `rtt start` is issued before the firmware has had a chance to initialize its
/// control block; there is no handshake for that, so the RTT monitor retries on later pauses.
pub fn rtt_commands(config: &SessionConfig, rtt: &ResolvedRttConfig) -> Vec<String> {
    let mut commands = Vec::new();
    if !rtt.enabled || config.pvt_restart_or_reset {
        return commands;
    }

    if config.request == RequestKind::Launch && rtt.clear_search {
        // A control block left over from a previous run would make OpenOCD lock onto garbage
        commands.push(monitor(&format!("mwb {} 0 {}", rtt.address, rtt.search_size)));
    }
    commands.push(monitor(&format!(
        "rtt setup {} {} {{{}}}",
        rtt.address, rtt.search_size, rtt.search_id
    )));
    if rtt.polling_interval > 0 {
        commands.push(monitor(&format!("rtt polling_interval {}", rtt.polling_interval)));
    }
    commands.push(monitor("rtt start"));
    commands
}

/// Program download sequence.
///
/// `load_files = Some([])` means "load nothing". Otherwise `pre_load` runs first, followed by
/// either each listed file or the session executable.
pub fn download_commands(config: &SessionConfig, pre_load: &[String]) -> Result<Vec<String>> {
    match &config.load_files {
        Some(files) if files.is_empty() => Ok(Vec::new()),
        Some(files) => {
            let mut commands = pre_load.to_vec();
            for file in files {
                let file = file.replace('\\', "/");
                commands.push(format!("file-exec-file \"{}\"", file));
                commands.push("target-download".to_string());
            }
            Ok(commands)
        }
        None => {
            let executable = config
                .executable
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .ok_or_else(|| {
                    ControllerError::InvalidConfig(
                        "executable is required for launch when loadFiles is not set".to_string(),
                    )
                })?;
            let mut commands = pre_load.to_vec();
            commands.push(format!("file-exec-and-symbols \"{}\"", executable.replace('\\', "/")));
            commands.push("target-download".to_string());
            Ok(commands)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RttConfig;

    fn launch_config() -> SessionConfig {
        SessionConfig {
            executable: Some("build/zephyr/zephyr.elf".to_string()),
            ..SessionConfig::default()
        }
    }

    fn rtt_config() -> RttConfig {
        RttConfig {
            enabled: true,
            address: "0x20000000".to_string(),
            search_id: "SEGGER RTT".to_string(),
            search_size: 11,
            clear_search: true,
            ..RttConfig::default()
        }
    }

    fn has_reset(commands: &[String]) -> bool {
        commands.iter().any(|c| c.contains("reset"))
    }

    #[test]
    fn test_init_selects_extended_remote() {
        let config = SessionConfig { gdb_target: "10.0.0.5:3333".into(), ..SessionConfig::default() };
        assert_eq!(
            init_commands(&config).unwrap(),
            vec!["target-select extended-remote 10.0.0.5:3333"]
        );
    }

    #[test]
    fn test_init_rejects_empty_target() {
        let config = SessionConfig { gdb_target: String::new(), ..SessionConfig::default() };
        assert!(matches!(init_commands(&config), Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_reset_presence_per_phase() {
        let config = launch_config();
        assert!(!has_reset(&attach_commands()));
        assert!(has_reset(&restart_commands()));
        assert!(has_reset(&launch_commands(&config).unwrap()));

        let no_download = SessionConfig { load_files: Some(vec![]), ..SessionConfig::default() };
        assert_eq!(
            launch_commands(&no_download).unwrap(),
            vec!["interpreter-exec console \"monitor reset halt\""]
        );
    }

    #[test]
    fn test_launch_downloads_executable_then_resets() {
        let commands = launch_commands(&launch_config()).unwrap();
        assert_eq!(
            commands,
            vec![
                "interpreter-exec console \"monitor reset halt\"",
                "file-exec-and-symbols \"build/zephyr/zephyr.elf\"",
                "target-download",
                "interpreter-exec console \"monitor reset halt\"",
            ]
        );
    }

    #[test]
    fn test_launch_load_files_normalizes_separators() {
        let config = SessionConfig {
            load_files: Some(vec!["C:\\fw\\boot.hex".into(), "app.elf".into()]),
            ..SessionConfig::default()
        };
        let commands = launch_commands(&config).unwrap();
        assert_eq!(commands[1], "file-exec-file \"C:/fw/boot.hex\"");
        assert_eq!(commands[2], "target-download");
        assert_eq!(commands[3], "file-exec-file \"app.elf\"");
        assert_eq!(commands.len(), 6);
    }

    #[test]
    fn test_launch_without_executable_is_config_error() {
        let config = SessionConfig::default();
        assert!(matches!(launch_commands(&config), Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_rtt_launch_with_clear_search() {
        let config = SessionConfig { rtt_config: rtt_config(), ..launch_config() };
        let commands = rtt_commands(&config, &config.rtt_config.resolve());
        assert_eq!(
            commands,
            vec![
                "interpreter-exec console \"monitor mwb 0x20000000 0 11\"",
                "interpreter-exec console \"monitor rtt setup 0x20000000 11 {SEGGER RTT}\"",
                "interpreter-exec console \"monitor rtt start\"",
            ]
        );
    }

    #[test]
    fn test_rtt_attach_skips_clear_and_adds_polling() {
        let mut rtt = rtt_config();
        rtt.polling_interval = 20;
        let config = SessionConfig {
            request: RequestKind::Attach,
            rtt_config: rtt,
            ..SessionConfig::default()
        };
        let commands = rtt_commands(&config, &config.rtt_config.resolve());
        assert_eq!(commands.len(), 3);
        assert!(commands[0].contains("rtt setup"));
        assert_eq!(commands[1], "interpreter-exec console \"monitor rtt polling_interval 20\"");
        assert!(commands[2].contains("rtt start"));
    }

    #[test]
    fn test_rtt_empty_when_disabled_or_restarting() {
        let mut config = SessionConfig { rtt_config: rtt_config(), ..launch_config() };
        config.pvt_restart_or_reset = true;
        assert!(rtt_commands(&config, &config.rtt_config.resolve()).is_empty());

        let config = launch_config();
        assert!(rtt_commands(&config, &config.rtt_config.resolve()).is_empty());
    }
}
