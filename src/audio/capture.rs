//! Microphone capture via `cpal`.
//!
//! [`CaptureDevice::open`] starts a hardware stream and returns a
//! [`CaptureStream`] handle.  The cpal callback converts every buffer to
//! `i16`, cuts it into fixed-duration mono frames with a [`FrameAssembler`]
//! and pushes them into a bounded drop-oldest [`FrameQueue`].  The callback
//! never waits on the consumer.
//!
//! `cpal::Stream` is not `Send` on every platform, so [`CpalCapture`] keeps
//! the stream on a dedicated thread that lives until the handle is closed or
//! dropped.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};

use super::error::DeviceError;
use super::frame::{AudioFrame, FrameAssembler};
use super::queue::{CaptureRead, FrameQueue};

// ---------------------------------------------------------------------------
// CaptureRequest
// ---------------------------------------------------------------------------

/// Parameters for opening a capture stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    /// Case-insensitive substring of the device name; `None` = host default.
    pub device: Option<String>,
    pub sample_rate: u32,
    pub frame_duration: Duration,
    /// Frames buffered before the oldest is dropped.
    pub queue_frames: usize,
}

// ---------------------------------------------------------------------------
// CaptureDevice
// ---------------------------------------------------------------------------

/// Anything that can open a capture stream.
///
/// Object-safe so the orchestrator can hold an `Arc<dyn CaptureDevice>`.
pub trait CaptureDevice: Send + Sync {
    /// Open the device and start delivering frames.
    fn open(&self, request: &CaptureRequest) -> Result<CaptureStream, DeviceError>;
}

// ---------------------------------------------------------------------------
// CaptureStream
// ---------------------------------------------------------------------------

/// Handle to a running capture stream.
///
/// Dropping the handle stops the hardware stream.
pub struct CaptureStream {
    queue: Arc<FrameQueue>,
    worker: Option<StreamWorker>,
}

impl CaptureStream {
    /// Wrap a queue that is fed by something other than a hardware stream.
    pub fn from_queue(queue: Arc<FrameQueue>) -> Self {
        Self {
            queue,
            worker: None,
        }
    }

    /// Wait for the next frame, or `EndOfStream` once closed and drained.
    pub async fn read_frame(&self) -> Result<CaptureRead, DeviceError> {
        self.queue.recv().await
    }

    /// Pop a buffered frame without waiting.
    pub fn try_read_frame(&self) -> Option<AudioFrame> {
        self.queue.try_pop()
    }

    /// Stop the hardware stream.  Frames already queued stay readable.
    ///
    /// Joins the stream thread; from async code use [`shutdown`](Self::shutdown).
    pub fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
        self.queue.close();
    }

    /// [`close`](Self::close) with the thread join moved to the blocking pool.
    pub async fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || worker.stop()).await {
                log::error!("capture: stream shutdown task failed: {e}");
            }
        }
        self.queue.close();
    }

    /// Frames dropped because the consumer could not keep up.
    pub fn overflows(&self) -> u64 {
        self.queue.overflows()
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns the thread that keeps a `cpal::Stream` alive.
struct StreamWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl StreamWorker {
    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.thread.join().is_err() {
            log::error!("capture: stream thread panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// CpalCapture
// ---------------------------------------------------------------------------

/// Production [`CaptureDevice`] backed by the default cpal host.
#[derive(Debug, Default, Clone)]
pub struct CpalCapture;

impl CpalCapture {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureDevice for CpalCapture {
    fn open(&self, request: &CaptureRequest) -> Result<CaptureStream, DeviceError> {
        let queue = Arc::new(FrameQueue::new(request.queue_frames.max(1)));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), DeviceError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread_queue = Arc::clone(&queue);
        let thread_request = request.clone();
        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match build_capture_stream(&thread_request, Arc::clone(&thread_queue))
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Park until close(); the stream stops when dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| DeviceError::Worker(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(CaptureStream {
                queue,
                worker: Some(StreamWorker { stop_tx, thread }),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Worker("capture thread exited during setup".into()))
            }
        }
    }
}

/// Resolve a device by name substring, or the host default.
pub(crate) fn find_device(
    host: &cpal::Host,
    name: Option<&str>,
    input: bool,
) -> Result<cpal::Device, DeviceError> {
    let direction = if input { "input" } else { "output" };
    match name {
        None => {
            let device = if input {
                host.default_input_device()
            } else {
                host.default_output_device()
            };
            device.ok_or(DeviceError::NoDefault(direction))
        }
        Some(wanted) => {
            let wanted_lower = wanted.to_lowercase();
            let devices = if input {
                host.input_devices()
            } else {
                host.output_devices()
            }
            .map_err(|e| DeviceError::Config {
                direction,
                reason: e.to_string(),
            })?;
            devices
                .into_iter()
                .find(|d| {
                    d.name()
                        .map(|n| n.to_lowercase().contains(&wanted_lower))
                        .unwrap_or(false)
                })
                .ok_or_else(|| DeviceError::NotFound {
                    direction,
                    name: wanted.to_string(),
                })
        }
    }
}

fn build_capture_stream(
    request: &CaptureRequest,
    queue: Arc<FrameQueue>,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = find_device(&host, request.device.as_deref(), true)?;
    let supported = device
        .default_input_config()
        .map_err(|e| DeviceError::Config {
            direction: "input",
            reason: e.to_string(),
        })?;

    let channels = supported.channels();
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(request.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    log::info!(
        "capture: opening {:?} rate={} channels={} format={:?} frame_ms={}",
        device.name().unwrap_or_default(),
        request.sample_rate,
        channels,
        supported.sample_format(),
        request.frame_duration.as_millis()
    );

    let assembler = FrameAssembler::new(request.sample_rate, channels, request.frame_duration);
    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => input_stream::<f32>(&device, &config, assembler, queue),
        cpal::SampleFormat::I16 => input_stream::<i16>(&device, &config, assembler, queue),
        cpal::SampleFormat::U16 => input_stream::<u16>(&device, &config, assembler, queue),
        cpal::SampleFormat::I32 => input_stream::<i32>(&device, &config, assembler, queue),
        other => return Err(DeviceError::UnsupportedFormat(format!("{other:?}"))),
    }
    .map_err(|e| DeviceError::BuildStream {
        direction: "input",
        reason: e.to_string(),
    })?;

    stream.play().map_err(|e| DeviceError::PlayStream {
        direction: "input",
        reason: e.to_string(),
    })?;
    Ok(stream)
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut assembler: FrameAssembler,
    queue: Arc<FrameQueue>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let error_queue = Arc::clone(&queue);
    let mut scratch: Vec<i16> = Vec::new();

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| i16::from_sample(s)));
            assembler.push(&scratch, |frame| {
                if !queue.push(frame) {
                    log::trace!("capture: queue full, dropped oldest frame");
                }
            });
        },
        move |err: cpal::StreamError| {
            log::error!("capture: stream error: {err}");
            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                error_queue.fail(err.to_string());
            }
        },
        None,
    )
}

// ---------------------------------------------------------------------------
// FakeCapture  (test-only)
// ---------------------------------------------------------------------------

/// Test double that replays a fixed list of frames, or fails to open.
#[cfg(test)]
pub struct FakeCapture {
    frames: Vec<AudioFrame>,
    fail_open: bool,
    /// Device failure reported after the frames, instead of end-of-stream.
    disconnect: Option<String>,
    /// `open` blocks the calling thread this long, like a slow driver.
    open_delay: Duration,
    opened: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FakeCapture {
    /// Replays `frames` then reports end-of-stream.
    pub fn with_frames(frames: Vec<AudioFrame>) -> Self {
        Self {
            frames,
            fail_open: false,
            disconnect: None,
            open_delay: Duration::ZERO,
            opened: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Replays `frames`, then the device goes away with `reason`.
    pub fn disconnecting(frames: Vec<AudioFrame>, reason: &str) -> Self {
        Self {
            disconnect: Some(reason.to_string()),
            ..Self::with_frames(frames)
        }
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Every `open` fails with [`DeviceError::NotFound`].
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::with_frames(Vec::new())
        }
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl CaptureDevice for FakeCapture {
    fn open(&self, request: &CaptureRequest) -> Result<CaptureStream, DeviceError> {
        self.opened
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        std::thread::sleep(self.open_delay);
        if self.fail_open {
            return Err(DeviceError::NotFound {
                direction: "input",
                name: request.device.clone().unwrap_or_else(|| "default".into()),
            });
        }
        let queue = Arc::new(FrameQueue::new(self.frames.len().max(1)));
        for frame in &self.frames {
            queue.push(frame.clone());
        }
        match &self.disconnect {
            Some(reason) => queue.fail(reason.clone()),
            None => queue.close(),
        }
        Ok(CaptureStream::from_queue(queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CaptureRequest {
        CaptureRequest {
            device: Some("mic".into()),
            sample_rate: 16_000,
            frame_duration: Duration::from_millis(20),
            queue_frames: 8,
        }
    }

    #[test]
    fn capture_stream_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CaptureStream>();
    }

    #[test]
    fn capture_device_is_object_safe() {
        let _: Box<dyn CaptureDevice> = Box::new(CpalCapture::new());
    }

    #[tokio::test]
    async fn fake_capture_replays_then_ends() {
        let frames = vec![AudioFrame::mono(vec![1; 320], 16_000); 3];
        let capture = FakeCapture::with_frames(frames);
        let stream = capture.open(&request()).unwrap();

        for _ in 0..3 {
            assert!(matches!(
                stream.read_frame().await.unwrap(),
                CaptureRead::Frame(_)
            ));
        }
        assert_eq!(stream.read_frame().await.unwrap(), CaptureRead::EndOfStream);
    }

    #[tokio::test]
    async fn close_keeps_buffered_frames_readable() {
        let queue = Arc::new(FrameQueue::new(4));
        queue.push(AudioFrame::mono(vec![5; 320], 16_000));
        let mut stream = CaptureStream::from_queue(Arc::clone(&queue));

        stream.close();
        assert!(stream.try_read_frame().is_some());
        assert_eq!(stream.read_frame().await.unwrap(), CaptureRead::EndOfStream);
        // frames pushed after close are discarded
        assert!(!queue.push(AudioFrame::mono(vec![0; 320], 16_000)));
    }

    #[tokio::test]
    async fn shutdown_keeps_buffered_frames_readable() {
        let queue = Arc::new(FrameQueue::new(4));
        queue.push(AudioFrame::mono(vec![5; 320], 16_000));
        let mut stream = CaptureStream::from_queue(Arc::clone(&queue));

        stream.shutdown().await;
        assert!(stream.try_read_frame().is_some());
        assert_eq!(stream.read_frame().await.unwrap(), CaptureRead::EndOfStream);
    }

    #[tokio::test]
    async fn disconnecting_fake_fails_after_frames() {
        let frames = vec![AudioFrame::mono(vec![1; 320], 16_000)];
        let stream = FakeCapture::disconnecting(frames, "unplugged")
            .open(&request())
            .unwrap();

        assert!(matches!(
            stream.read_frame().await.unwrap(),
            CaptureRead::Frame(_)
        ));
        assert!(stream.read_frame().await.unwrap_err().is_disconnect());
    }

    #[test]
    fn failing_fake_reports_device_error() {
        let capture = FakeCapture::failing();
        let err = capture.open(&request()).err().expect("open should fail");
        assert!(matches!(err, DeviceError::NotFound { .. }));
        assert_eq!(capture.open_count(), 1);
    }
}
