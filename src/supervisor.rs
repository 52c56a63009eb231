//! Owns every stream pipeline: capture task, HTTP server task, shutdown

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{
    CaptureCommand, CaptureProcess, Delimiters, FrameExtractor, FrameReader, Slideshow,
};
use crate::error::{RelayError, Result};
use crate::pipeline::StreamPipeline;
use crate::{server, utils, Config, SourceConfig, StreamConfig};

/// Extra time allowed on top of the shutdown timeout for a forced kill
const KILL_ALLOWANCE: Duration = Duration::from_secs(1);

/// Why a capture task ended without being asked to
#[derive(Debug)]
pub enum PipelineEvent {
    /// The source ran out normally (a finished slideshow)
    Finished { stream: String },
    /// The capture process died or its output failed
    Failed { stream: String, error: RelayError },
}

/// What feeds a pipeline, resolved before anything is spawned
pub enum CaptureSource {
    Process(Vec<CaptureCommand>),
    Slideshow(Slideshow),
}

impl CaptureSource {
    pub fn prepare(stream: &StreamConfig) -> Result<Self> {
        let source = match &stream.source {
            SourceConfig::Webcam(cam) => {
                let mut cam = cam.clone();
                let device = match cam.device.as_deref() {
                    Some(device) if !device.is_empty() => device.to_owned(),
                    _ => {
                        let found = utils::auto_detect_device()?;
                        cam.format = Some(found.format);
                        found.path
                    }
                };
                CaptureSource::Process(vec![CaptureCommand::webcam(&device, &cam)])
            }
            SourceConfig::Libcamera(cam) => CaptureSource::Process(CaptureCommand::libcamera(cam)),
            SourceConfig::Command(cmd) => CaptureSource::Process(
                cmd.stages
                    .iter()
                    .map(|argv| {
                        CaptureCommand::from_argv(argv).ok_or_else(|| {
                            RelayError::InvalidConfig(format!(
                                "stream `{}`: empty command stage",
                                stream.name
                            ))
                        })
                    })
                    .collect::<Result<_>>()?,
            ),
            SourceConfig::Slideshow(show) => CaptureSource::Slideshow(Slideshow::load(show.clone())?),
        };
        Ok(source)
    }
}

#[derive(Clone)]
struct CaptureSettings {
    delimiters: Delimiters,
    max_frame_len: usize,
    grace: Duration,
}

struct PipelineHandle {
    pipeline: Arc<StreamPipeline>,
    local_addr: SocketAddr,
    capture: Option<JoinHandle<()>>,
    server: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    async fn stop(&mut self, timeout: Duration) {
        let name = self.pipeline.name().to_owned();
        self.pipeline.shutdown();

        join_within(&name, "capture", self.capture.take(), timeout + KILL_ALLOWANCE).await;
        join_within(&name, "server", self.server.take(), timeout).await;
    }
}

async fn join_within(stream: &str, what: &str, handle: Option<JoinHandle<()>>, limit: Duration) {
    let Some(mut handle) = handle else {
        return;
    };
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(())) => debug!(stream, "{} task stopped", what),
        Ok(Err(e)) => warn!(stream, "{} task failed: {}", what, e),
        Err(_) => {
            warn!(
                stream,
                "{} task did not stop within {:?}, aborting", what, limit
            );
            handle.abort();
        }
    }
}

pub struct Supervisor {
    pipelines: Vec<PipelineHandle>,
    events: flume::Receiver<PipelineEvent>,
    shutdown_timeout: Duration,
}

impl Supervisor {
    /// Bind every stream's port and start its capture and server tasks.
    /// Anything already started is stopped again if a later stream fails.
    pub async fn start(config: &Config) -> Result<Self> {
        config.validate()?;

        let (events_tx, events) = flume::unbounded();
        let mut supervisor = Self {
            pipelines: Vec::with_capacity(config.streams.len()),
            events,
            shutdown_timeout: config.shutdown_timeout(),
        };

        for stream in &config.streams {
            if let Err(e) = supervisor.launch(stream, &events_tx).await {
                supervisor.shutdown().await;
                return Err(e);
            }
        }
        Ok(supervisor)
    }

    async fn launch(
        &mut self,
        stream: &StreamConfig,
        events: &flume::Sender<PipelineEvent>,
    ) -> Result<()> {
        // A busy port fails before any capture process starts
        let listener = server::bind(stream.addr()).await?;
        let local_addr = listener.local_addr()?;
        let source = CaptureSource::prepare(stream)?;
        let pipeline = Arc::new(StreamPipeline::from_config(stream));

        let settings = CaptureSettings {
            delimiters: stream.delimiters()?,
            max_frame_len: stream.max_frame_bytes,
            grace: self.shutdown_timeout,
        };

        let server = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                if let Err(e) = server::serve(listener, pipeline.clone()).await {
                    error!(stream = %pipeline.name(), "HTTP server error: {}", e);
                }
            })
        };
        let capture = tokio::spawn(run_capture(
            source,
            pipeline.clone(),
            events.clone(),
            settings,
        ));

        info!(
            "Stream {} live at http://{}/ (status at /status)",
            stream.name, local_addr
        );
        self.pipelines.push(PipelineHandle {
            pipeline,
            local_addr,
            capture: Some(capture),
            server: Some(server),
        });
        Ok(())
    }

    /// Bound address of every stream, in configuration order
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.pipelines
            .iter()
            .map(|h| (h.pipeline.name().to_owned(), h.local_addr))
            .collect()
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<StreamPipeline>> {
        self.pipelines
            .iter()
            .find(|h| h.pipeline.name() == name)
            .map(|h| h.pipeline.clone())
    }

    fn running(&self) -> usize {
        self.pipelines
            .iter()
            .filter(|h| !h.pipeline.is_shutting_down())
            .count()
    }

    /// Wait for `shutdown` while handling pipeline events.
    ///
    /// A failed pipeline is torn down on its own; once no pipeline is left
    /// the failure is returned. Returns `Ok` when `shutdown` resolves.
    /// Call [`Supervisor::shutdown`] afterwards in both cases.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            let event = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                event = self.events.recv_async() => event,
            };

            match event {
                Ok(PipelineEvent::Finished { stream }) => {
                    info!(%stream, "Source finished, server keeps running");
                }
                Ok(PipelineEvent::Failed { stream, error }) => {
                    error!(%stream, "Capture pipeline failed: {}", error);
                    let timeout = self.shutdown_timeout;
                    if let Some(handle) = self
                        .pipelines
                        .iter_mut()
                        .find(|h| h.pipeline.name() == stream)
                    {
                        handle.stop(timeout).await;
                    }
                    if self.running() == 0 {
                        return Err(error);
                    }
                }
                // Every capture task has ended; servers keep running until stopped
                Err(_) => {
                    debug!("No capture tasks left, waiting for shutdown");
                    (&mut shutdown).await;
                    info!("Shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    /// Stop every pipeline: flag shutdown, clear buffers, terminate capture
    /// processes and join all tasks, each bounded by the shutdown timeout.
    pub async fn shutdown(&mut self) {
        let timeout = self.shutdown_timeout;
        for handle in &self.pipelines {
            handle.pipeline.shutdown();
        }
        join_all(self.pipelines.iter_mut().map(|h| h.stop(timeout))).await;
        info!("All pipelines stopped");
    }
}

#[instrument(skip_all, fields(stream = %pipeline.name()))]
async fn run_capture(
    source: CaptureSource,
    pipeline: Arc<StreamPipeline>,
    events: flume::Sender<PipelineEvent>,
    settings: CaptureSettings,
) {
    let outcome = match source {
        CaptureSource::Process(commands) => capture_process(&commands, &pipeline, &settings).await,
        CaptureSource::Slideshow(show) => show.run(pipeline.clone()).await,
    };

    if pipeline.is_shutting_down() {
        if let Err(e) = outcome {
            debug!("Capture ended during shutdown: {}", e);
        }
        return;
    }

    let stream = pipeline.name().to_owned();
    let event = match outcome {
        Ok(()) => PipelineEvent::Finished { stream },
        Err(error) => PipelineEvent::Failed { stream, error },
    };
    if events.send(event).is_err() {
        warn!("Supervisor gone, capture event dropped");
    }
}

/// Read frames from the capture chain until cancelled or the output ends.
/// The chain is always terminated before returning.
async fn capture_process(
    commands: &[CaptureCommand],
    pipeline: &StreamPipeline,
    settings: &CaptureSettings,
) -> Result<()> {
    let mut process = CaptureProcess::spawn(commands)?;
    let stdout = match process.take_stdout() {
        Some(stdout) => stdout,
        None => {
            process.terminate(settings.grace).await;
            return Err(RelayError::MissingStdout(
                commands.last().map(|c| c.program.clone()).unwrap_or_default(),
            ));
        }
    };

    let extractor = FrameExtractor::new(settings.delimiters.clone(), settings.max_frame_len);
    let mut reader = FrameReader::new(stdout, extractor);
    let cancel = pipeline.cancel_token().clone();

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            next = reader.next_frame() => next,
        };

        match next {
            Ok(Some(frame)) => {
                pipeline.publish(frame);
                pipeline.record_progress(reader.bytes_read(), reader.extractor().bytes_discarded());
            }
            Ok(None) => {
                let report = process.exit_report(settings.grace).await;
                break Err(RelayError::ProcessExited(report));
            }
            Err(e) => break Err(e),
        }
    };

    pipeline.record_progress(reader.bytes_read(), reader.extractor().bytes_discarded());
    drop(reader);
    process.terminate(settings.grace).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandSource;

    #[test]
    fn command_source_keeps_stage_order() {
        let stream = StreamConfig {
            source: SourceConfig::Command(CommandSource {
                stages: vec![
                    vec!["libcamera-vid".into(), "-o".into(), "-".into()],
                    vec!["ffmpeg".into(), "-i".into(), "-".into()],
                ],
            }),
            ..StreamConfig::default()
        };

        match CaptureSource::prepare(&stream).unwrap() {
            CaptureSource::Process(commands) => {
                assert_eq!(commands.len(), 2);
                assert_eq!(commands[0].program, "libcamera-vid");
                assert_eq!(commands[1].args, vec!["-i", "-"]);
            }
            CaptureSource::Slideshow(_) => panic!("expected a process source"),
        }
    }

    #[test]
    fn configured_webcam_device_skips_detection() {
        match CaptureSource::prepare(&StreamConfig::default()).unwrap() {
            CaptureSource::Process(commands) => {
                assert_eq!(commands.len(), 1);
                assert!(commands[0].args.contains(&"/dev/video0".to_string()));
            }
            CaptureSource::Slideshow(_) => panic!("expected a process source"),
        }
    }

    #[test]
    fn slideshow_without_images_fails_to_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let stream = StreamConfig {
            source: SourceConfig::Slideshow(crate::SlideshowSource {
                folder: dir.path().to_path_buf(),
                ..Default::default()
            }),
            ..StreamConfig::default()
        };
        assert!(matches!(
            CaptureSource::prepare(&stream),
            Err(RelayError::Slideshow(_))
        ));
    }
}
