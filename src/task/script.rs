//! Shell-command tasks described by manifests

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use super::{param_to_string, Runnable, TaskContext};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const PARAM_ENV_PREFIX: &str = "BRAINX_PARAM_";

/// Runs `cmd` through the platform shell, capturing stdout as output
#[derive(Debug, Clone)]
pub struct ScriptTask {
    cmd: String,
    cwd: PathBuf,
    env: HashMap<String, String>,
}

impl ScriptTask {
    pub fn new(cmd: String, cwd: PathBuf, env: HashMap<String, String>) -> Self {
        Self { cmd, cwd, env }
    }

    fn command(&self, ctx: &TaskContext) -> Command {
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.args(["/C", &self.cmd]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", &self.cmd]);
            c
        };

        cmd.current_dir(&self.cwd)
            .envs(&self.env)
            .env("BRAINX_TASK", &ctx.task_name)
            .env("BRAINX_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (key, value) in ctx.params.iter() {
            cmd.env(param_env_name(key), param_to_string(value));
        }

        // Own process group, so a kill reaches pipelines and subshells too
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd
    }
}

impl Runnable for ScriptTask {
    fn run(&self, ctx: &TaskContext) -> Result<String> {
        let mut child = self
            .command(ctx)
            .spawn()
            .with_context(|| format!("Failed to spawn `{}`", self.cmd))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if ctx.is_cancelled() {
                kill(&mut child);
                bail!("cancelled");
            }
            thread::sleep(POLL_INTERVAL);
        };

        let output = stdout.join().unwrap_or_default();
        let errors = stderr.join().unwrap_or_default();

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let errors = errors.trim();
            if errors.is_empty() {
                bail!("command exited with status {}", code);
            }
            bail!("command exited with status {}: {}", code, errors);
        }

        Ok(output)
    }
}

/// Read a pipe to completion on its own thread so the child never blocks on a full pipe
fn drain<R>(pipe: Option<R>) -> thread::JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

/// Kill the shell and everything it started, then reap it
fn kill(child: &mut Child) {
    #[cfg(unix)]
    {
        // The shell is the group leader and is not reaped yet, so its pid
        // still names the group.
        let pgid = child.id() as libc::pid_t;
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// `release-tag` becomes `BRAINX_PARAM_RELEASE_TAG`
pub fn param_env_name(key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}{}", PARAM_ENV_PREFIX, key)
}
