//! The coverage executor runs the target as a sub program for each capture
use std::{
    collections::BTreeMap,
    io::{self, Write},
    os::{
        fd::{AsFd, AsRawFd},
        unix::process::{CommandExt, ExitStatusExt},
    },
    process::{Child, ChildStdin, Command, Stdio},
    time::Instant,
};

use covmap_bolts::{
    os::install_signal_cleanup,
    shmem::{CoverageShMem, ShMemId, SHM_ENV_VAR},
};
use log::{debug, warn};
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::wait::{waitid, Id, WaitPidFlag},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    executors::{
        timeout::{has_exited, RunState, Watchdog, TIMEOUT_SIGNAL},
        ExecutionResult,
    },
    inputs::ExecutionRequest,
    Error,
};

/// How long a blocked input write waits before checking on the target again
const INPUT_POLL_MS: u16 = 20;

/// How the [`CoverageExecutor`] sets up each child.
///
/// Build one with [`ExecutorConfig::builder()`], or deserialize it from a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct ExecutorConfig {
    /// If set to true, the child output will remain visible.
    /// By default, the child output is hidden to increase execution speed.
    #[builder(default)]
    pub debug_child: bool,
    /// Start the child with an empty environment instead of ours.
    /// The coverage map id is always set.
    #[builder(default)]
    pub isolate_env: bool,
    /// Do not fail the capture if the child exits before reading all of its input.
    #[builder(default)]
    pub tolerate_broken_pipe: bool,
    /// Extra variables for the child, applied on top of the (possibly cleared) environment.
    #[builder(default, setter(into))]
    pub env: BTreeMap<String, String>,
    /// Hook fatal signals so the coverage map is removed even if this process dies.
    #[builder(default = true)]
    pub signal_cleanup: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Runs the target once per [`CoverageExecutor::capture`] and collects its coverage map.
///
/// The executor owns one coverage map for its whole lifetime and zeroes it before every
/// run. To run several targets in parallel, use one executor per thread.
#[derive(Debug)]
pub struct CoverageExecutor {
    shmem: CoverageShMem,
    config: ExecutorConfig,
}

impl CoverageExecutor {
    /// Creates the coverage map. Failing here is fatal, nothing can run without a map.
    pub fn new(config: ExecutorConfig) -> Result<Self, Error> {
        let shmem = CoverageShMem::new()?;
        if config.signal_cleanup {
            if let Err(err) = install_signal_cleanup() {
                warn!("Could not hook fatal signals, the coverage map may leak on a crash: {err}");
            }
        }
        Ok(Self { shmem, config })
    }

    /// The configuration this executor was built with
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// The coverage map shared with the children
    #[must_use]
    pub fn shmem(&self) -> &CoverageShMem {
        &self.shmem
    }

    /// The id children find in [`SHM_ENV_VAR`]
    #[must_use]
    pub fn map_id(&self) -> ShMemId {
        self.shmem.id()
    }

    /// Destroy the coverage map now instead of on drop. Further captures fail.
    pub fn release(&mut self) {
        self.shmem.release();
    }

    fn command(&self, request: &ExecutionRequest<'_>) -> Command {
        let mut command = Command::new(request.program());
        command.args(request.args());
        if self.config.isolate_env {
            command.env_clear();
        }
        command.envs(&self.config.env);
        command.env(SHM_ENV_VAR, self.shmem.id().to_string());
        // the timeout kills the whole group
        command.process_group(0);
        if !self.config.debug_child {
            command.stdout(Stdio::null());
            command.stderr(Stdio::null());
        }
        command
    }

    /// Run the target once and collect its coverage.
    ///
    /// Crashes and timeouts are part of the [`ExecutionResult`]. Errors are returned if
    /// the target could not be launched or its input could not be delivered; the
    /// executor stays usable either way.
    pub fn capture(&mut self, request: ExecutionRequest<'_>) -> Result<ExecutionResult, Error> {
        self.shmem.reset()?;

        let (stdin, pending) = request.input().stdio()?;
        let mut command = self.command(&request);
        command.stdin(stdin);

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|err| Error::launch(request.program().to_string_lossy(), err))?;
        drop(command);
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(child.id() as i32);
        debug!("Spawned {:?} as {pid}", request.program());

        let watchdog = match Watchdog::arm(pid, request.timeout()) {
            Ok(watchdog) => watchdog,
            Err(err) => {
                kill_and_reap(&mut child);
                return Err(err);
            }
        };

        let written = match (pending, child.stdin.take()) {
            (Some(bytes), Some(pipe)) => feed_input(pipe, bytes, pid, &watchdog),
            _ => Ok(()),
        };

        if let Err(err) = wait_for_exit(pid) {
            let _ = watchdog.disarm();
            kill_and_reap(&mut child);
            return Err(err);
        }
        let timed_out = watchdog.disarm() == RunState::TimedOut;
        let status = child.wait()?;
        let exec_time = started.elapsed();

        if let Err(err) = written {
            if timed_out {
                debug!("Input write to {pid} failed after the timeout fired: {err}");
            } else if err.kind() == io::ErrorKind::BrokenPipe && self.config.tolerate_broken_pipe {
                debug!("{pid} exited before reading all of its input");
            } else {
                return Err(Error::file(err));
            }
        }

        let signal = status.signal();
        let crashed = match signal {
            _ if timed_out => None,
            Some(sig) if sig == TIMEOUT_SIGNAL as i32 => {
                warn!("{pid} was killed by {TIMEOUT_SIGNAL} from outside, not reporting it as a crash");
                None
            }
            sig => sig,
        };
        debug!(
            "{pid} finished after {exec_time:?}: exit code {:?}, signal {signal:?}, timed out: {timed_out}",
            status.code()
        );

        Ok(ExecutionResult {
            coverage: self.shmem.snapshot()?,
            crashed,
            timed_out,
            exit_code: status.code(),
            signal,
            exec_time,
        })
    }
}

/// Write `bytes` into the target's stdin, then close it.
///
/// Never blocks for good: once the deadline fired or the target itself exited, the
/// rest of the input is given up with [`io::ErrorKind::BrokenPipe`], even if some
/// descendant still holds the pipe open without reading it.
fn feed_input(
    mut pipe: ChildStdin,
    bytes: &[u8],
    pid: Pid,
    watchdog: &Watchdog,
) -> io::Result<()> {
    fcntl(pipe.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

    let mut rest = bytes;
    while !rest.is_empty() {
        match pipe.write(rest) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(written) => rest = &rest[written..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if watchdog.state() != RunState::Running || has_exited(pid) {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        format!("{} of {} input bytes were never read", rest.len(), bytes.len()),
                    ));
                }
                let mut fds = [PollFd::new(pipe.as_fd(), PollFlags::POLLOUT)];
                match poll(&mut fds, PollTimeout::from(INPUT_POLL_MS)) {
                    Ok(_) | Err(Errno::EINTR) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err),
        }
    }
    // dropping the pipe tells the target there is no more input
    Ok(())
}

/// Block until `pid` terminated, but leave it unreaped so its pid stays reserved.
fn wait_for_exit(pid: Pid) -> Result<(), Error> {
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => {}
            Err(err) => return Err(err.into()),
        }
    }
}

fn kill_and_reap(child: &mut Child) {
    // if this fails, there is not much we can do. let's hope it failed because the process finished
    // in the meantime.
    drop(child.kill());
    // finally, try to wait to properly clean up system resources.
    drop(child.wait());
}

#[cfg(test)]
mod tests {
    use core::time::Duration;
    use std::{collections::BTreeMap, io, time::Instant};

    use nix::sys::signal::Signal;

    use super::{CoverageExecutor, ExecutorConfig};
    use crate::{
        executors::ExitKind,
        inputs::{ExecutionRequest, InputSource},
        Error,
    };

    fn sh(script: &str) -> [&str; 3] {
        ["/bin/sh", "-c", script]
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn clean_exit() -> Result<(), Error> {
        let mut executor = CoverageExecutor::new(ExecutorConfig::default())?;
        let res = executor.capture(ExecutionRequest::new(sh("exit 0"), InputSource::from_bytes(b""))?)?;
        assert_eq!(res.exit_kind(), ExitKind::Ok);
        assert_eq!(res.exit_code, Some(0));
        assert_eq!(res.crashed, None);
        assert!(!res.timed_out);
        // nobody wrote coverage
        assert_eq!(res.coverage.count_nonzero(), 0);

        let res = executor.capture(ExecutionRequest::new(sh("exit 3"), InputSource::from_bytes(b""))?)?;
        assert_eq!(res.exit_kind(), ExitKind::Ok);
        assert_eq!(res.exit_code, Some(3));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn crash_is_classified() -> Result<(), Error> {
        let mut executor = CoverageExecutor::new(ExecutorConfig::default())?;
        let res = executor.capture(ExecutionRequest::new(
            sh("kill -SEGV $$"),
            InputSource::from_bytes(b""),
        )?)?;
        assert_eq!(res.exit_kind(), ExitKind::Crash);
        assert_eq!(res.crashed, Some(Signal::SIGSEGV as i32));
        assert!(!res.timed_out);
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn external_sigkill_is_not_a_crash() -> Result<(), Error> {
        let mut executor = CoverageExecutor::new(ExecutorConfig::default())?;
        let res = executor.capture(ExecutionRequest::new(
            sh("kill -KILL $$"),
            InputSource::from_bytes(b""),
        )?)?;
        assert_eq!(res.crashed, None);
        assert!(!res.timed_out);
        assert_eq!(res.signal, Some(Signal::SIGKILL as i32));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn timeout_kills_the_target() -> Result<(), Error> {
        let mut executor = CoverageExecutor::new(ExecutorConfig::default())?;
        let timeout = Duration::from_millis(300);
        let start = Instant::now();
        let res = executor.capture(
            ExecutionRequest::new(["sleep", "30"], InputSource::from_bytes(b""))?
                .with_timeout(timeout),
        )?;
        assert!(res.timed_out);
        assert_eq!(res.crashed, None);
        assert_eq!(res.exit_kind(), ExitKind::Timeout);
        assert!(start.elapsed() < timeout + Duration::from_secs(5));

        // the next run is not affected by the previous deadline
        let res = executor.capture(
            ExecutionRequest::new(sh("sleep 0.5; exit 0"), InputSource::from_bytes(b""))?
                .with_timeout(Duration::from_secs(10)),
        )?;
        assert!(!res.timed_out);
        assert_eq!(res.exit_code, Some(0));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn launch_failure_keeps_the_executor_usable() -> Result<(), Error> {
        let mut executor = CoverageExecutor::new(ExecutorConfig::default())?;
        let res = executor.capture(ExecutionRequest::new(
            ["/nonexistent/covmap-target"],
            InputSource::from_bytes(b""),
        )?);
        match res {
            Err(Error::Launch(_, err, _)) => assert_eq!(err.kind(), io::ErrorKind::NotFound),
            other => panic!("expected a launch error, got {other:?}"),
        }

        let res = executor.capture(ExecutionRequest::new(sh("exit 0"), InputSource::from_bytes(b""))?)?;
        assert_eq!(res.exit_kind(), ExitKind::Ok);
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn broken_pipe_is_reported_unless_tolerated() -> Result<(), Error> {
        // way more than fits into a pipe buffer, the target never reads it
        let input = vec![b'A'; 4 << 20];

        let mut executor = CoverageExecutor::new(ExecutorConfig::default())?;
        let res = executor.capture(ExecutionRequest::new(sh("exit 0"), InputSource::from_bytes(&input))?);
        match res {
            Err(Error::File(err, _)) => assert_eq!(err.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected a broken pipe, got {other:?}"),
        }

        let mut executor = CoverageExecutor::new(
            ExecutorConfig::builder().tolerate_broken_pipe(true).build(),
        )?;
        let res = executor.capture(ExecutionRequest::new(sh("exit 0"), InputSource::from_bytes(&input))?)?;
        assert_eq!(res.exit_code, Some(0));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn blocked_input_still_times_out() -> Result<(), Error> {
        let input = vec![b'A'; 4 << 20];
        let mut executor = CoverageExecutor::new(ExecutorConfig::default())?;
        let res = executor.capture(
            ExecutionRequest::new(["sleep", "30"], InputSource::from_bytes(&input))?
                .with_timeout(Duration::from_millis(200)),
        )?;
        assert!(res.timed_out);
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn wrapper_script_with_blocked_input_times_out() -> Result<(), Error> {
        // the shell is killed, its `sleep` keeps the input pipe open unless it dies too
        let input = vec![b'A'; 4 << 20];
        let mut executor = CoverageExecutor::new(ExecutorConfig::default())?;
        let timeout = Duration::from_millis(200);
        let start = Instant::now();
        let res = executor.capture(
            ExecutionRequest::new(sh("sleep 6; exit 0"), InputSource::from_bytes(&input))?
                .with_timeout(timeout),
        )?;
        assert!(res.timed_out);
        assert_eq!(res.crashed, None);
        assert!(start.elapsed() < Duration::from_secs(3));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn descendant_holding_stdin_does_not_stall_capture() -> Result<(), Error> {
        // the background `sleep` inherits the pipe and outlives the shell without reading
        let script = "exec 3<&0; sleep 5 <&3 & exit 0";
        let input = vec![b'A'; 4 << 20];

        let mut executor = CoverageExecutor::new(ExecutorConfig::default())?;
        let start = Instant::now();
        let res = executor.capture(ExecutionRequest::new(sh(script), InputSource::from_bytes(&input))?);
        match res {
            Err(Error::File(err, _)) => assert_eq!(err.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected a broken pipe, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(3));

        let mut executor = CoverageExecutor::new(
            ExecutorConfig::builder().tolerate_broken_pipe(true).build(),
        )?;
        let res = executor.capture(ExecutionRequest::new(sh(script), InputSource::from_bytes(&input))?)?;
        assert_eq!(res.exit_code, Some(0));
        assert!(!res.timed_out);
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn environment_is_passed_or_isolated() -> Result<(), Error> {
        let check = r#"test "$COVMAP_MARK" = yes && test -n "$__AFL_SHM_ID" && test -z "$COVMAP_PARENT_ONLY""#;
        let env = BTreeMap::from([("COVMAP_MARK".to_string(), "yes".to_string())]);

        let mut executor = CoverageExecutor::new(
            ExecutorConfig::builder()
                .isolate_env(true)
                .env(env.clone())
                .build(),
        )?;
        let res = executor.capture(ExecutionRequest::new(sh(check), InputSource::from_bytes(b""))?)?;
        assert_eq!(res.exit_code, Some(0));

        let id_check = format!(r#"test "$__AFL_SHM_ID" = "{}""#, executor.map_id());
        let res = executor.capture(ExecutionRequest::new(
            sh(&id_check),
            InputSource::from_bytes(b""),
        )?)?;
        assert_eq!(res.exit_code, Some(0));

        let mut executor = CoverageExecutor::new(ExecutorConfig::builder().env(env).build())?;
        // PATH comes from our own environment
        let res = executor.capture(ExecutionRequest::new(
            sh(r#"test -n "$PATH" && test "$COVMAP_MARK" = yes"#),
            InputSource::from_bytes(b""),
        )?)?;
        assert_eq!(res.exit_code, Some(0));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn released_executor_refuses_to_run() -> Result<(), Error> {
        let mut executor = CoverageExecutor::new(ExecutorConfig::default())?;
        executor.release();
        executor.release();
        let res = executor.capture(ExecutionRequest::new(sh("exit 0"), InputSource::from_bytes(b""))?);
        assert!(matches!(res, Err(Error::IllegalState(..))));
        Ok(())
    }

    #[test]
    fn config_from_json() -> Result<(), Error> {
        let config: ExecutorConfig = serde_json::from_str(r#"{"isolate_env": true, "env": {"A": "b"}}"#)?;
        assert!(config.isolate_env);
        assert!(config.signal_cleanup);
        assert!(!config.debug_child);
        assert_eq!(config.env.get("A").map(String::as_str), Some("b"));
        Ok(())
    }
}
