//! Audio pipeline: input device → ring buffer → fixed 20 ms frames → engine.
//! The device callback only writes into the ring buffer. A dedicated analysis
//! thread slices frames, normalizes them to [-1, 1] and invokes the frame
//! callback synchronously, in arrival order.

pub mod noise;
pub mod ring_buffer;
pub mod vad;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::CaptureConfig;
use crate::error::EngineError;
use ring_buffer::RingBuffer;

/// Receives each normalized mono frame on the capture side's thread.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Anything that can deliver fixed-length normalized frames.
pub trait FrameSource: Send {
    /// Pre-flight check before capture is started.
    fn is_available(&self) -> bool;

    /// Begin delivering frames to `on_frame`. Must not block on the first frame.
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), EngineError>;

    /// Stop delivering frames. Idempotent.
    fn stop(&mut self);
}

/// Convert a 16-bit PCM sample to [-1.0, 1.0).
#[inline]
pub fn normalize_sample(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Normalize a PCM buffer into `out` (resized to match).
pub fn normalize_into(samples: &[i16], out: &mut Vec<f32>) {
    out.clear();
    out.extend(samples.iter().map(|&s| normalize_sample(s)));
}

/// Default input device via cpal, 16 kHz mono i16.
pub struct CpalFrameSource {
    config: CaptureConfig,
    running: Option<CaptureHandle>,
}

impl CpalFrameSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }
}

impl FrameSource for CpalFrameSource {
    fn is_available(&self) -> bool {
        use cpal::traits::HostTrait;
        cpal::default_host().default_input_device().is_some()
    }

    fn start(&mut self, on_frame: FrameCallback) -> Result<(), EngineError> {
        if self.running.is_some() {
            return Ok(());
        }
        self.running = Some(CaptureHandle::start(&self.config, on_frame)?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut handle) = self.running.take() {
            handle.shutdown();
        }
    }
}

/// Keeps the device stream thread and the analysis thread alive.
struct CaptureHandle {
    stop_flag: Arc<AtomicBool>,
    /// Dropping this sender ends the stream thread, which drops the stream.
    shutdown_tx: Option<std_mpsc::Sender<()>>,
    stream_thread: Option<thread::JoinHandle<()>>,
    analysis_thread: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle {
    fn start(config: &CaptureConfig, on_frame: FrameCallback) -> Result<Self, EngineError> {
        let ring = Arc::new(Mutex::new(RingBuffer::new(
            config.sample_rate,
            config.ring_buffer_secs,
        )));
        let stop_flag = Arc::new(AtomicBool::new(false));

        // cpal::Stream is not Send on every platform, so it lives on its own thread.
        let (init_tx, init_rx) = std_mpsc::sync_channel::<Result<(), EngineError>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let stream_config = config.clone();
        let ring_capture = Arc::clone(&ring);
        let stream_thread = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || match build_capture_stream(&stream_config, ring_capture) {
                Ok(stream) => {
                    let _ = init_tx.send(Ok(()));
                    // Blocks until the sender is dropped.
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    info!("audio capture stream closed");
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                }
            })
            .map_err(|e| EngineError::Capture(format!("failed to spawn capture thread: {e}")))?;

        let init = init_rx
            .recv()
            .unwrap_or_else(|_| Err(EngineError::Capture("capture thread exited during init".into())));
        if let Err(e) = init {
            let _ = stream_thread.join();
            return Err(e);
        }

        let frame_size = config.frame_size().max(1);
        let idle_sleep = config.frame_duration() / 4;
        let stop_proc = Arc::clone(&stop_flag);
        let analysis_thread = thread::Builder::new()
            .name("audio-analysis".into())
            .spawn(move || run_frame_loop(ring, frame_size, idle_sleep, stop_proc, on_frame));

        let analysis_thread = match analysis_thread {
            Ok(handle) => handle,
            Err(e) => {
                drop(shutdown_tx);
                let _ = stream_thread.join();
                return Err(EngineError::Capture(format!(
                    "failed to spawn audio analysis thread: {e}"
                )));
            }
        };

        Ok(Self {
            stop_flag,
            shutdown_tx: Some(shutdown_tx),
            stream_thread: Some(stream_thread),
            analysis_thread: Some(analysis_thread),
        })
    }

    fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.shutdown_tx.take();
        for handle in [self.analysis_thread.take(), self.stream_thread.take()]
            .into_iter()
            .flatten()
        {
            // Stopping from inside the frame callback must not self-join.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_capture_stream(
    config: &CaptureConfig,
    ring: Arc<Mutex<RingBuffer>>,
) -> Result<cpal::Stream, EngineError> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(EngineError::DeviceUnavailable)?;

    let stream_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let channels = config.channels.max(1) as usize;

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let mut rb = ring.lock();
                if channels == 1 {
                    rb.write(data);
                } else {
                    // Keep the first channel only.
                    for frame in data.chunks(channels) {
                        rb.write(&frame[..1]);
                    }
                }
            },
            |err| {
                error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| EngineError::Capture(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| EngineError::Capture(format!("failed to start audio stream: {e}")))?;
    info!(
        sample_rate = config.sample_rate,
        frame_ms = config.frame_ms,
        "audio capture stream started"
    );
    Ok(stream)
}

/// Slice the ring buffer into frames and hand each to the callback.
fn run_frame_loop(
    ring: Arc<Mutex<RingBuffer>>,
    frame_size: usize,
    idle_sleep: Duration,
    stop_flag: Arc<AtomicBool>,
    mut on_frame: FrameCallback,
) {
    let mut pcm = vec![0i16; frame_size];
    let mut frame = Vec::with_capacity(frame_size);
    let mut reported_dropped = 0u64;

    info!(frame_size, "audio analysis loop started");

    while !stop_flag.load(Ordering::Relaxed) {
        let (read, dropped) = {
            let mut rb = ring.lock();
            if rb.available() < frame_size {
                (0, rb.dropped())
            } else {
                (rb.read(&mut pcm), rb.dropped())
            }
        };

        if dropped > reported_dropped {
            warn!(dropped_samples = dropped - reported_dropped, "analysis fell behind capture");
            reported_dropped = dropped;
        }

        if read < frame_size {
            thread::sleep(idle_sleep);
            continue;
        }

        normalize_into(&pcm, &mut frame);
        on_frame(&frame);
    }

    info!("audio analysis loop stopping");
}
