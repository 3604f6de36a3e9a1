//! Content of command files.
//!
//! Reading a command file never runs the command. It yields a small shell
//! script that hands the device, the command and its own arguments to the
//! runner program, so executing the file is what invokes the command.

use tangofs_db::{CommandInfo, DataType};

/// Script served as the content of a command file.
pub fn render(runner: &str, device: &str, info: &CommandInfo) -> String {
    let mut script = String::new();
    script.push_str("#!/bin/sh\n");
    script.push_str(&format!("# Runs {}() on {}\n", info.name, device));
    script.push_str(&format!("# in:  {} {}\n", info.in_type, info.in_desc));
    script.push_str(&format!("# out: {} {}\n", info.out_type, info.out_desc));
    if info.in_type == DataType::Void {
        script.push_str(&format!(
            "exec {} run \"{}\" \"{}\"\n",
            runner, device, info.name
        ));
    } else {
        script.push_str(&format!(
            "exec {} run \"{}\" \"{}\" \"$@\"\n",
            runner, device, info.name
        ));
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_void_command_takes_no_arguments() {
        let info = CommandInfo::new("Init", DataType::Void, DataType::Void);
        let script = render("tangofs", "sys/tg_test/1", &info);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("exec tangofs run \"sys/tg_test/1\" \"Init\"\n"));
        assert!(!script.contains("$@"));
    }

    #[test]
    fn test_argument_forwarded() {
        let info = CommandInfo::new("DevLong", DataType::Long, DataType::Long);
        let script = render("/usr/bin/tangofs", "sys/tg_test/1", &info);
        assert!(script.contains("# in:  DevLong"));
        assert!(script.ends_with("\"DevLong\" \"$@\"\n"));
    }
}
