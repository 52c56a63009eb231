//! External capture programs chained through pipes

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::{LibcameraSource, WebcamSource};

/// One program in a capture chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl CaptureCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `argv[0]` is the program; `None` for an empty list
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.iter().cloned()))
    }

    /// ffmpeg reading a V4L2 device and writing MJPEG to stdout
    pub fn webcam(device: &str, source: &WebcamSource) -> Self {
        let mut args = vec!["-f".to_string(), "v4l2".into()];
        if let Some(format) = source.format {
            args.extend(["-input_format".to_string(), format.ffmpeg_name().into()]);
        }
        args.extend([
            "-video_size".to_string(),
            format!("{}x{}", source.width, source.height),
            "-framerate".into(),
            source.framerate.to_string(),
            "-i".into(),
            device.into(),
            "-f".into(),
            "mjpeg".into(),
            "-q:v".into(),
            source.quality.to_string(),
            "-".into(),
        ]);
        Self::new("ffmpeg", args)
    }

    /// libcamera-vid raw YUV420 output transcoded to MJPEG by ffmpeg
    pub fn libcamera(source: &LibcameraSource) -> Vec<Self> {
        let size = format!("{}x{}", source.width, source.height);
        let capture = Self::new(
            "libcamera-vid",
            [
                "-t".to_string(),
                "0".into(),
                "--width".into(),
                source.width.to_string(),
                "--height".into(),
                source.height.to_string(),
                "--framerate".into(),
                source.framerate.to_string(),
                "--codec".into(),
                "yuv420".into(),
                "--inline".into(),
                "-o".into(),
                "-".into(),
            ],
        );
        let transcode = Self::new(
            "ffmpeg",
            [
                "-f".to_string(),
                "rawvideo".into(),
                "-pixel_format".into(),
                "yuv420p".into(),
                "-video_size".into(),
                size,
                "-framerate".into(),
                source.framerate.to_string(),
                "-i".into(),
                "-".into(),
                "-f".into(),
                "mjpeg".into(),
                "-q:v".into(),
                source.quality.to_string(),
                "-".into(),
            ],
        );
        vec![capture, transcode]
    }
}

impl fmt::Display for CaptureCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

struct Stage {
    program: String,
    child: Child,
}

/// Running capture chain. Each stage's stdout feeds the next stage's stdin;
/// the last stage's stdout is the frame source.
pub struct CaptureProcess {
    stages: Vec<Stage>,
    stdout: Option<ChildStdout>,
}

impl CaptureProcess {
    /// Spawn every stage. Stages already started are killed if a later one fails.
    pub fn spawn(commands: &[CaptureCommand]) -> Result<Self> {
        let mut stages: Vec<Stage> = Vec::with_capacity(commands.len());
        let mut upstream: Option<ChildStdout> = None;

        for cmd in commands {
            let mut command = Command::new(&cmd.program);
            command
                .args(&cmd.args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            match upstream.take() {
                Some(previous) => {
                    let stdin: Stdio = previous.try_into()?;
                    command.stdin(stdin);
                }
                None => {
                    command.stdin(Stdio::null());
                }
            }

            let mut child = command.spawn().map_err(|source| RelayError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;

            if let Some(stderr) = child.stderr.take() {
                forward_stderr(cmd.program.clone(), stderr);
            }
            upstream = Some(
                child
                    .stdout
                    .take()
                    .ok_or_else(|| RelayError::MissingStdout(cmd.program.clone()))?,
            );

            info!(pid = child.id(), "Spawned capture stage: {}", cmd);
            stages.push(Stage {
                program: cmd.program.clone(),
                child,
            });
        }

        Ok(Self {
            stages,
            stdout: upstream,
        })
    }

    /// Output of the last stage; can be taken once
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.stages.iter().filter_map(|s| s.child.id()).collect()
    }

    /// SIGTERM every stage, wait up to `grace`, then SIGKILL whatever is left.
    pub async fn terminate(&mut self, grace: Duration) {
        self.stdout.take();

        for stage in &self.stages {
            if let Some(pid) = stage.child.id() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!(pid, "SIGTERM to {} failed: {}", stage.program, e);
                }
            }
        }

        let deadline = Instant::now() + grace;
        for stage in &mut self.stages {
            match timeout_at(deadline, stage.child.wait()).await {
                Ok(Ok(status)) => debug!("{} exited: {}", stage.program, status),
                Ok(Err(e)) => warn!("Failed to wait for {}: {}", stage.program, e),
                Err(_) => {
                    warn!(
                        "{} did not exit within {:?}, killing",
                        stage.program, grace
                    );
                    if let Err(e) = stage.child.kill().await {
                        warn!("Failed to kill {}: {}", stage.program, e);
                    }
                }
            }
        }
    }

    /// Describe how each stage ended, waiting at most `wait` in total.
    pub async fn exit_report(&mut self, wait: Duration) -> String {
        let deadline = Instant::now() + wait;
        let mut parts = Vec::with_capacity(self.stages.len());
        for stage in &mut self.stages {
            let part = match timeout_at(deadline, stage.child.wait()).await {
                Ok(Ok(status)) => format!("{} {}", stage.program, status),
                Ok(Err(e)) => format!("{} unknown status ({e})", stage.program),
                Err(_) => format!("{} still running", stage.program),
            };
            parts.push(part);
        }
        parts.join("; ")
    }
}

fn forward_stderr(program: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "camrelay::capture::stderr", "{program}: {line}");
        }
    });
}
