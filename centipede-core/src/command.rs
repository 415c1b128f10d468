// SPDX-License-Identifier: Apache-2.0

//! Command / fork server (§4.7): wraps an external binary with arguments,
//! environment, optional output redirection, timeout, and an `@@`
//! placeholder for a temp file path. Two execution modes: a one-shot
//! subshell, or a persistent fork server synchronized over two FIFOs.

use std::fs::File;
use std::io::Write as _;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command as StdCommand, Stdio};
use std::time::{Duration, Instant};

use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, Pid};
use tempfile::TempDir;

use crate::error::{CentipedeError, Result};

const PLACEHOLDER: &str = "@@";

/// Quote `s` as a single POSIX shell word, for embedding literal values
/// (like `CENTIPEDE_RUNNER_FLAGS`) into the fork-server stub script.
fn shell_single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Description of an external target invocation (§4.7).
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub use_forkserver: bool,
}

impl CommandSpec {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdout_path: None,
            stderr_path: None,
            timeout: None,
            use_forkserver: true,
        }
    }

    fn render_args(&self, input_path: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                if a == PLACEHOLDER {
                    input_path.to_string_lossy().into_owned()
                } else {
                    a.clone()
                }
            })
            .collect()
    }
}

/// Exit status of a single command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Exited(i32),
    TimedOut,
}

/// Either a subshell runner or a persistent fork server, behind one
/// interface (§4.7).
pub enum CommandRunner {
    Subshell(CommandSpec),
    ForkServer(ForkServer),
}

impl CommandRunner {
    pub fn new(spec: CommandSpec) -> Result<Self> {
        if spec.use_forkserver {
            Ok(Self::ForkServer(ForkServer::start(spec)?))
        } else {
            Ok(Self::Subshell(spec))
        }
    }

    pub fn execute(&mut self, input_path: &Path) -> Result<ExecStatus> {
        match self {
            CommandRunner::Subshell(spec) => execute_subshell(spec, input_path),
            CommandRunner::ForkServer(fs) => fs.execute(input_path),
        }
    }
}

fn execute_subshell(spec: &CommandSpec, input_path: &Path) -> Result<ExecStatus> {
    let mut cmd = StdCommand::new(&spec.binary);
    cmd.args(spec.render_args(input_path));
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    cmd.stdout(redirect(&spec.stdout_path)?);
    cmd.stderr(redirect(&spec.stderr_path)?);

    let mut child = cmd.spawn()?;
    let status = wait_with_timeout(&mut child, spec.timeout)?;
    Ok(status)
}

fn redirect(path: &Option<PathBuf>) -> Result<Stdio> {
    Ok(match path {
        Some(p) => Stdio::from(File::create(p)?),
        None => Stdio::null(),
    })
}

fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> Result<ExecStatus> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ExecStatus::Exited(status.code().unwrap_or(-1)));
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(ExecStatus::TimedOut);
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// `{dev, inode}` pair identifying the fork-server process' executable at
/// startup, used to guard against PID recycling (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExeIdentity {
    dev: u64,
    ino: u64,
}

fn exe_identity(pid: i32) -> Result<ExeIdentity> {
    let meta = std::fs::metadata(format!("/proc/{pid}/exe"))?;
    Ok(ExeIdentity {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

fn process_exists(pid: Pid) -> bool {
    nix::sys::signal::kill(pid, None).is_ok()
}

/// A persistent child process reached over two FIFOs: the parent writes a
/// single wakeup byte on `wakeup_path`, then polls `exit_code_path` for an
/// `i32` exit code up to `timeout` (§4.7).
pub struct ForkServer {
    spec: CommandSpec,
    child: Child,
    pid: Pid,
    identity: ExeIdentity,
    wakeup: File,
    exit_code: File,
    _fifo_dir: TempDir,
}

impl ForkServer {
    /// Write a shell stub that launches the binary against the two FIFOs,
    /// spawn it, and record the startup `{pid, dev, inode}` (§4.7).
    fn start(spec: CommandSpec) -> Result<Self> {
        let fifo_dir = TempDir::new()?;
        let wakeup_path = fifo_dir.path().join("wakeup.fifo");
        let exit_path = fifo_dir.path().join("exit.fifo");
        mkfifo(&wakeup_path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| CentipedeError::Io {
            source: std::io::Error::from(e),
        })?;
        mkfifo(&exit_path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| CentipedeError::Io {
            source: std::io::Error::from(e),
        })?;

        let stub_path = fifo_dir.path().join("forkserver-stub.sh");
        let mut stub = File::create(&stub_path)?;
        let env_exports: String = spec
            .env
            .iter()
            .map(|(k, v)| format!("export {k}={}\n", shell_single_quote(v)))
            .collect();
        writeln!(
            stub,
            "#!/bin/sh\n{env_exports}while read -r _ <\"{wakeup}\"; do\n  \"{binary}\" {args} >/dev/null 2>&1\n  echo $? >\"{exit}\"\ndone\n",
            wakeup = wakeup_path.display(),
            binary = spec.binary.display(),
            args = spec.args.join(" "),
            exit = exit_path.display(),
        )?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub_path, std::fs::Permissions::from_mode(0o755))?;
        }

        let mut child = StdCommand::new("/bin/sh").arg(&stub_path).spawn()?;
        let pid = child.id() as i32;
        // Give the stub a moment to exist before stat'ing /proc/<pid>/exe;
        // tolerate a missing entry by retrying briefly.
        let mut identity = None;
        for _ in 0..50 {
            if let Ok(id) = exe_identity(pid) {
                identity = Some(id);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let identity = identity.ok_or_else(|| {
            CentipedeError::Precondition("fork server did not start".into())
        })?;

        let wakeup = File::options().write(true).open(&wakeup_path)?;
        let exit_code = File::options().read(true).open(&exit_path)?;

        Ok(Self {
            spec,
            child,
            pid: Pid::from_raw(pid),
            identity,
            wakeup,
            exit_code,
            _fifo_dir: fifo_dir,
        })
    }

    /// Verify the fork-server PID still exists and `/proc/<pid>/exe`
    /// resolves to the `{dev, inode}` recorded at startup (§4.7).
    fn check_liveness(&self) -> Result<()> {
        if !process_exists(self.pid) {
            return Err(CentipedeError::Precondition(
                "fork server process is no longer alive".into(),
            ));
        }
        let current = exe_identity(self.pid.as_raw())?;
        if current != self.identity {
            return Err(CentipedeError::Precondition(
                "fork server pid was recycled by a different process".into(),
            ));
        }
        Ok(())
    }

    fn execute(&mut self, _input_path: &Path) -> Result<ExecStatus> {
        self.check_liveness()?;
        self.wakeup.write_all(b"\n")?;
        self.wakeup.flush()?;

        let deadline = self
            .spec
            .timeout
            .map(|t| Instant::now() + t)
            .unwrap_or(Instant::now() + Duration::from_secs(3600));

        let mut line = String::new();
        loop {
            match read_line_nonblocking(&mut self.exit_code, &mut line) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Ok(ExecStatus::TimedOut);
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let code: i32 = line.trim().parse().unwrap_or(-1);
        Ok(ExecStatus::Exited(code))
    }
}

fn read_line_nonblocking(file: &mut File, into: &mut String) -> std::io::Result<bool> {
    use std::io::{BufRead, BufReader};
    // A fresh BufReader per poll keeps this simple; the FIFO is only ever
    // read a line at a time between wakeups.
    let mut reader = BufReader::new(file.try_clone()?);
    into.clear();
    let n = reader.read_line(into)?;
    Ok(n > 0)
}

impl Drop for ForkServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subshell_true_exits_zero() {
        let mut spec = CommandSpec::new("/bin/true");
        spec.use_forkserver = false;
        let mut runner = CommandRunner::new(spec).unwrap();
        let status = runner.execute(Path::new("/dev/null")).unwrap();
        assert_eq!(status, ExecStatus::Exited(0));
    }

    #[test]
    fn subshell_false_exits_nonzero() {
        let mut spec = CommandSpec::new("/bin/false");
        spec.use_forkserver = false;
        let mut runner = CommandRunner::new(spec).unwrap();
        let status = runner.execute(Path::new("/dev/null")).unwrap();
        assert_eq!(status, ExecStatus::Exited(1));
    }

    #[test]
    fn subshell_timeout_is_detected() {
        let mut spec = CommandSpec::new("/bin/sleep");
        spec.args = vec!["5".into()];
        spec.use_forkserver = false;
        spec.timeout = Some(Duration::from_millis(50));
        let mut runner = CommandRunner::new(spec).unwrap();
        let status = runner.execute(Path::new("/dev/null")).unwrap();
        assert_eq!(status, ExecStatus::TimedOut);
    }

    #[test]
    fn fork_server_forwards_env_to_the_child() {
        // The stub always redirects the child's own stdout/stderr, so the
        // helper writes to a path baked into its own script body instead of
        // relying on shell redirection passed through `args`.
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("env.out");
        let helper_path = dir.path().join("helper.sh");
        std::fs::write(
            &helper_path,
            format!("#!/bin/sh\nprintenv CENTIPEDE_TEST_VAR > '{}'\n", out_path.display()),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&helper_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut spec = CommandSpec::new(&helper_path);
        spec.env = vec![("CENTIPEDE_TEST_VAR".into(), "hello world".into())];
        let mut runner = CommandRunner::new(spec).unwrap();
        runner.execute(Path::new("/dev/null")).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let contents = std::fs::read_to_string(&out_path).unwrap_or_default();
        assert_eq!(contents.trim(), "hello world");
    }

    #[test]
    fn shell_single_quote_escapes_embedded_quotes() {
        assert_eq!(shell_single_quote("a'b"), "'a'\\''b'");
    }

    #[test]
    fn at_placeholder_is_substituted() {
        let mut spec = CommandSpec::new("/bin/cat");
        spec.args = vec![PLACEHOLDER.to_string()];
        assert_eq!(
            spec.render_args(Path::new("/tmp/in")),
            vec!["/tmp/in".to_string()]
        );
    }
}
