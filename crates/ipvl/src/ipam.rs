//! Address allocation through an external IPAM plugin.
//!
//! The delegate is a separate executable speaking the same protocol as this
//! plugin: the payload on stdin, the command in `CNI_COMMAND`, a result or
//! an error object on stdout. Failing to run it and getting an unusable
//! answer back are reported as different errors.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use ipvl_common::{ErrorReport, IpamResult, IpvlError, IpvlResult};

/// Command passed to the delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpamCommand {
    /// Allocate addresses.
    Add,
    /// Release addresses.
    Del,
}

impl IpamCommand {
    /// Value of `CNI_COMMAND` for this command.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
        }
    }
}

/// Runs a delegate plugin and returns its stdout.
pub trait PluginExec {
    /// Run `plugin` for `command` with `stdin` as its input.
    ///
    /// # Errors
    ///
    /// Returns [`IpvlError::Delegate`] if the plugin cannot be run or exits
    /// non-zero.
    fn exec(&self, plugin: &str, command: IpamCommand, stdin: &[u8]) -> IpvlResult<Vec<u8>>;
}

/// [`PluginExec`] that runs executables found on the plugin search path.
///
/// The child inherits this process's environment, so the rest of the
/// invocation context reaches the delegate unchanged.
#[derive(Debug, Clone, Default)]
pub struct ExecPlugin {
    search_path: Vec<PathBuf>,
}

impl ExecPlugin {
    /// Search `search_path` for delegates. Empty entries are skipped.
    pub fn new(search_path: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            search_path: search_path
                .into_iter()
                .filter(|p| !p.as_os_str().is_empty())
                .collect(),
        }
    }

    /// First regular file named `plugin` on the search path.
    #[must_use]
    pub fn find(&self, plugin: &str) -> Option<PathBuf> {
        self.search_path
            .iter()
            .map(|dir| dir.join(plugin))
            .find(|candidate| candidate.is_file())
    }

    fn run(path: &Path, command: IpamCommand, stdin: &[u8]) -> io::Result<std::process::Output> {
        let mut child = Command::new(path)
            .env("CNI_COMMAND", command.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        // Feed stdin while stdout is drained; a plugin may answer before (or
        // without) reading its input.
        let input = child.stdin.take();
        thread::scope(|scope| {
            let writer = scope.spawn(move || match input {
                Some(mut input) => match input.write_all(stdin) {
                    Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                },
                None => Ok(()),
            });
            let output = child.wait_with_output();
            writer
                .join()
                .map_err(|_| io::Error::other("stdin writer panicked"))??;
            output
        })
    }
}

impl PluginExec for ExecPlugin {
    fn exec(&self, plugin: &str, command: IpamCommand, stdin: &[u8]) -> IpvlResult<Vec<u8>> {
        let delegate_err = |message: String| IpvlError::Delegate {
            plugin: plugin.to_string(),
            message,
        };

        let path = self.find(plugin).ok_or_else(|| {
            delegate_err(format!(
                "failed to find plugin in path {:?}",
                self.search_path
            ))
        })?;

        tracing::debug!(plugin, path = %path.display(), command = command.as_str(), "Running IPAM plugin");
        let output = Self::run(&path, command, stdin)
            .map_err(|e| delegate_err(format!("failed to execute {}: {e}", path.display())))?;

        if !output.status.success() {
            let message = match serde_json::from_slice::<ErrorReport>(&output.stdout) {
                Ok(report) => match report.details {
                    Some(details) => format!("{}: {details}", report.msg),
                    None => report.msg,
                },
                Err(_) => format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stdout).trim()
                ),
            };
            return Err(delegate_err(message));
        }

        Ok(output.stdout)
    }
}

/// Allocates and releases addresses through a delegate plugin.
#[derive(Debug, Clone)]
pub struct AddressDelegate<E> {
    exec: E,
}

impl<E: PluginExec> AddressDelegate<E> {
    /// Wrap a delegate runner.
    pub const fn new(exec: E) -> Self {
        Self { exec }
    }

    /// Ask `plugin` for an allocation.
    ///
    /// # Errors
    ///
    /// Returns [`IpvlError::Delegate`] if the plugin fails or its answer does
    /// not parse, and [`IpvlError::Validation`] if the allocation has no IPv4
    /// configuration.
    pub fn allocate(&self, plugin: &str, payload: &[u8]) -> IpvlResult<IpamResult> {
        let stdout = self.exec.exec(plugin, IpamCommand::Add, payload)?;
        let result: IpamResult =
            serde_json::from_slice(&stdout).map_err(|e| IpvlError::Delegate {
                plugin: plugin.to_string(),
                message: format!("malformed result: {e}"),
            })?;

        let Some(ip4) = &result.ip4 else {
            return Err(IpvlError::Validation {
                message: "IPAM plugin returned missing IPv4 config".to_string(),
            });
        };

        tracing::debug!(plugin, ip = %ip4.ip, "IPAM allocation received");
        Ok(result)
    }

    /// Ask `plugin` to release whatever it allocated for this payload.
    ///
    /// # Errors
    ///
    /// Returns [`IpvlError::Delegate`] if the plugin fails.
    pub fn release(&self, plugin: &str, payload: &[u8]) -> IpvlResult<()> {
        self.exec.exec(plugin, IpamCommand::Del, payload)?;
        tracing::debug!(plugin, "IPAM allocation released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    struct Canned {
        stdout: &'static str,
        calls: RefCell<Vec<IpamCommand>>,
    }

    impl Canned {
        fn new(stdout: &'static str) -> Self {
            Self {
                stdout,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl PluginExec for &Canned {
        fn exec(&self, _plugin: &str, command: IpamCommand, _stdin: &[u8]) -> IpvlResult<Vec<u8>> {
            self.calls.borrow_mut().push(command);
            Ok(self.stdout.as_bytes().to_vec())
        }
    }

    #[test]
    fn allocate_parses_result() {
        let exec = Canned::new(r#"{"ip4": {"ip": "10.1.2.3/24", "gateway": "10.1.2.1"}}"#);
        let delegate = AddressDelegate::new(&exec);
        let result = delegate.allocate("host-local", b"{}").unwrap();
        assert_eq!(result.ip4.unwrap().ip.to_string(), "10.1.2.3/24");
        assert_eq!(*exec.calls.borrow(), vec![IpamCommand::Add]);
    }

    #[test]
    fn allocate_without_ipv4_is_validation_error() {
        let exec = Canned::new(r#"{"ip6": {"ip": "fd00::3/64"}}"#);
        let err = AddressDelegate::new(&exec)
            .allocate("host-local", b"{}")
            .unwrap_err();
        assert!(matches!(err, IpvlError::Validation { .. }));
    }

    #[test]
    fn allocate_with_garbage_is_delegate_error() {
        let exec = Canned::new("not json");
        let err = AddressDelegate::new(&exec)
            .allocate("host-local", b"{}")
            .unwrap_err();
        assert!(matches!(err, IpvlError::Delegate { ref plugin, .. } if plugin == "host-local"));
    }

    #[test]
    fn release_runs_del() {
        let exec = Canned::new("");
        AddressDelegate::new(&exec).release("host-local", b"{}").unwrap();
        assert_eq!(*exec.calls.borrow(), vec![IpamCommand::Del]);
    }

    #[test]
    fn empty_search_path_entries_are_dropped() {
        let exec = ExecPlugin::new(vec![PathBuf::new(), PathBuf::from("/opt/cni/bin")]);
        assert_eq!(exec.search_path, vec![PathBuf::from("/opt/cni/bin")]);
    }

    #[test]
    fn missing_plugin_is_delegate_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ExecPlugin::new(vec![dir.path().to_path_buf()]);
        assert!(exec.find("host-local").is_none());
        let err = exec.exec("host-local", IpamCommand::Add, b"{}").unwrap_err();
        assert!(err.to_string().contains("failed to find plugin"));
    }
}
