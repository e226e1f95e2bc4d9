use crate::error::ChannelError;
use crate::system::{run_command, CommandOutput, CommandRunner};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Runs each command through the platform's privilege-elevation prompt.
/// Once the user denies a prompt, every later command short-circuits so
/// one declined operation never produces a second dialog.
pub struct ElevatedRunner {
    denied: AtomicBool,
}

impl ElevatedRunner {
    pub fn new() -> Self {
        Self {
            denied: AtomicBool::new(false),
        }
    }

    pub fn was_denied(&self) -> bool {
        self.denied.load(Ordering::SeqCst)
    }
}

impl Default for ElevatedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for ElevatedRunner {
    #[cfg(target_os = "macos")]
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        if self.was_denied() {
            return Err(io::Error::new(io::ErrorKind::Other, "authorization already denied"));
        }
        let mut shell_cmd = shell_quote(program);
        for arg in args {
            shell_cmd.push(' ');
            shell_cmd.push_str(&shell_quote(arg));
        }
        let script = format!(
            "do shell script {} with administrator privileges",
            applescript_quote(&shell_cmd)
        );
        let out = run_command("osascript", ["-e", script.as_str()])?;
        if !out.success && out.output.contains("User canceled") {
            self.denied.store(true, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "authorization denied"));
        }
        Ok(out)
    }

    #[cfg(not(target_os = "macos"))]
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        if self.was_denied() {
            return Err(io::Error::new(io::ErrorKind::Other, "authorization already denied"));
        }
        let mut full = vec![program];
        full.extend_from_slice(args);
        let out = run_command("pkexec", &full)?;
        // pkexec reserves 126 for dismissed dialogs and 127 for
        // authorization failures
        if matches!(out.code, Some(126) | Some(127)) {
            self.denied.store(true, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "authorization denied"));
        }
        Ok(out)
    }
}

/// POSIX single-quoting; embedded quotes become `'\''`.
#[allow(dead_code)]
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// AppleScript string literal: backslashes and double quotes escaped.
#[allow(dead_code)]
pub(crate) fn applescript_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', r"\\").replace('"', "\\\""))
}

const SERVICE_LABEL: &str = "org.dnsctl.daemon";

/// Registers the current executable as a boot-time system service so
/// later operations reach an already-privileged engine with no prompt.
pub struct ServiceInstaller {
    runner: ElevatedRunner,
}

impl ServiceInstaller {
    pub fn new() -> Self {
        Self {
            runner: ElevatedRunner::new(),
        }
    }

    pub fn install(&self) -> Result<(), ChannelError> {
        let exe = std::env::current_exe()
            .map_err(|e| ChannelError::InstallFailed(format!("cannot locate executable: {}", e)))?;
        let staged = self
            .stage_definition(&exe)
            .map_err(|e| ChannelError::InstallFailed(e.to_string()))?;
        let result = self.register(&staged);
        let _ = std::fs::remove_file(&staged);
        result
    }

    fn stage_definition(&self, exe: &std::path::Path) -> io::Result<PathBuf> {
        let path = std::env::temp_dir().join(self.definition_name());
        std::fs::write(&path, self.render_definition(exe))?;
        Ok(path)
    }

    #[cfg(target_os = "macos")]
    fn definition_name(&self) -> String {
        format!("{}.plist", SERVICE_LABEL)
    }

    #[cfg(not(target_os = "macos"))]
    fn definition_name(&self) -> String {
        "dnsctl.service".to_string()
    }

    #[cfg(target_os = "macos")]
    fn render_definition(&self, exe: &std::path::Path) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>Label</key>
  <string>{label}</string>
  <key>ProgramArguments</key>
  <array>
    <string>{exe}</string>
    <string>daemon</string>
  </array>
  <key>RunAtLoad</key>
  <true/>
  <key>KeepAlive</key>
  <true/>
</dict>
</plist>
"#,
            label = SERVICE_LABEL,
            exe = exe.to_string_lossy(),
        )
    }

    #[cfg(not(target_os = "macos"))]
    fn render_definition(&self, exe: &std::path::Path) -> String {
        format!(
            "[Unit]\nDescription=dnsctl privileged DNS engine\nAfter=network.target\n\n[Service]\nExecStart={} daemon\nRestart=on-failure\n\n[Install]\nWantedBy=multi-user.target\n",
            exe.to_string_lossy()
        )
    }

    fn elevated(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ChannelError> {
        match self.runner.run(program, args) {
            Ok(out) => Ok(out),
            Err(_) if self.runner.was_denied() => Err(ChannelError::AuthorizationDenied),
            Err(e) => Err(ChannelError::InstallFailed(e.to_string())),
        }
    }

    #[cfg(target_os = "macos")]
    fn register(&self, staged: &std::path::Path) -> Result<(), ChannelError> {
        let target = format!("/Library/LaunchDaemons/{}.plist", SERVICE_LABEL);
        let out = self.elevated("cp", &[&staged.to_string_lossy(), &target])?;
        if !out.success {
            return Err(ChannelError::InstallFailed(out.output));
        }
        let out = self.elevated("launchctl", &["load", "-w", &target])?;
        if !out.success {
            return Err(ChannelError::InstallFailed(out.output));
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    fn register(&self, staged: &std::path::Path) -> Result<(), ChannelError> {
        let target = "/etc/systemd/system/dnsctl.service";
        let out = self.elevated("cp", &[&staged.to_string_lossy(), target])?;
        if !out.success {
            return Err(ChannelError::InstallFailed(out.output));
        }
        let out = self.elevated("systemctl", &["daemon-reload"])?;
        if !out.success {
            return Err(ChannelError::InstallFailed(out.output));
        }
        let out = self.elevated("systemctl", &["enable", "--now", "dnsctl.service"])?;
        if !out.success {
            return Err(ChannelError::InstallFailed(out.output));
        }
        Ok(())
    }
}

impl Default for ServiceInstaller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain_and_embedded() {
        assert_eq!(shell_quote("networksetup"), "'networksetup'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_applescript_quote_escapes() {
        assert_eq!(applescript_quote(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(applescript_quote(r"a\b"), r#""a\\b""#);
    }

    #[test]
    fn test_denied_flag_latches() {
        let runner = ElevatedRunner::new();
        assert!(!runner.was_denied());
        runner.denied.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(runner.run("true", &[]).is_err());
    }
}
