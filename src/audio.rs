//! Amplitude and frequency extraction from a 16-bit mono PCM stream.
//!
//! The sampler runs on its own blocking thread and publishes the newest features on a
//! `watch` channel. An unseen value on that channel is the "has data" flag; the channel closing
//! means the sampler is gone and audio is unavailable until re-enabled.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;

/// Samples within this distance of zero never count as a sign change.
const ZERO_CROSSING_HYSTERESIS: i16 = 32;
const FULL_SCALE: f64 = 65536.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AudioFeatures {
    /// Peak-to-peak swing as a percentage of the 16-bit range.
    pub amplitude: f64,
    pub frequency: f64,
}

pub trait AudioInput: Send {
    fn sample_rate(&self) -> u32;

    /// Fills `buf` with up to `buf.len()` samples. `Ok(0)` means the stream ended.
    fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize>;
}

/// Raw little-endian 16-bit mono PCM from any reader (device node, FIFO, file).
pub struct PcmStreamInput<R> {
    reader: R,
    sample_rate: u32,
    bytes: Vec<u8>,
}

impl PcmStreamInput<BufReader<File>> {
    pub fn open(path: &Path, sample_rate: u32) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("open audio device {}", path.display()))?;
        Ok(Self::new(BufReader::new(file), sample_rate))
    }
}

impl<R: Read + Send> PcmStreamInput<R> {
    pub fn new(reader: R, sample_rate: u32) -> Self {
        Self {
            reader,
            sample_rate,
            bytes: Vec::new(),
        }
    }
}

impl<R: Read + Send> AudioInput for PcmStreamInput<R> {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize> {
        self.bytes.resize(buf.len() * 2, 0);
        let mut filled = 0;
        while filled < self.bytes.len() {
            match self.reader.read(&mut self.bytes[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("read audio frame"),
            }
        }
        let samples = filled / 2;
        for (slot, pair) in buf.iter_mut().zip(self.bytes[..samples * 2].chunks_exact(2)) {
            *slot = i16::from_le_bytes([pair[0], pair[1]]);
        }
        Ok(samples)
    }
}

/// Scans one frame. `None` for an empty frame or a zero sample rate.
pub fn analyze_frame(samples: &[i16], sample_rate: u32) -> Option<AudioFeatures> {
    if samples.is_empty() || sample_rate == 0 {
        return None;
    }

    // Silence reads as zero swing, so both ends start at zero.
    let mut lowest: i32 = 0;
    let mut highest: i32 = 0;
    let mut crossings: u32 = 0;
    let mut last_sign: i8 = 0;

    for &sample in samples {
        let value = i32::from(sample);
        lowest = lowest.min(value);
        highest = highest.max(value);

        let sign = if sample > ZERO_CROSSING_HYSTERESIS {
            1
        } else if sample < -ZERO_CROSSING_HYSTERESIS {
            -1
        } else {
            0
        };
        if sign != 0 {
            if last_sign != 0 && sign != last_sign {
                crossings += 1;
            }
            last_sign = sign;
        }
    }

    let seconds = samples.len() as f64 / f64::from(sample_rate);
    Some(AudioFeatures {
        amplitude: f64::from(highest - lowest) / FULL_SCALE * 100.0,
        frequency: f64::from(crossings) / seconds / 2.0,
    })
}

/// How long `stop` waits for a blocked read before leaving the thread behind.
const STOP_GRACE: Duration = Duration::from_millis(500);

type SharedSender = Arc<Mutex<Option<watch::Sender<AudioFeatures>>>>;

/// Handle to a running sampler thread.
pub struct AudioSampler {
    stop: Arc<AtomicBool>,
    tx: SharedSender,
    done_rx: std_mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl AudioSampler {
    /// `open` runs on the sampler thread. If it fails the thread logs and exits without
    /// publishing, which closes `tx`.
    pub fn spawn<F>(
        open: F,
        frame_samples: usize,
        tx: watch::Sender<AudioFeatures>,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn AudioInput>> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let tx: SharedSender = Arc::new(Mutex::new(Some(tx)));
        let (done_tx, done_rx) = std_mpsc::channel::<()>();
        let stop_flag = stop.clone();
        let thread_tx = tx.clone();
        let thread = std::thread::Builder::new()
            .name("audio-sampler".to_string())
            .spawn(move || {
                run_sampler(open, frame_samples.max(1), thread_tx, stop_flag);
                drop(done_tx);
            })
            .context("failed to spawn audio thread")?;
        Ok(Self {
            stop,
            tx,
            done_rx,
            thread: Some(thread),
        })
    }

    /// Nothing is published once this returns. The thread is joined if it exits within the
    /// stop grace period; one stuck in a blocking read is detached and exits on its next wakeup.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        take_sender(&self.tx);
        let Some(thread) = self.thread.take() else {
            return;
        };
        match self.done_rx.recv_timeout(STOP_GRACE) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("audio read still blocked; detaching sampler thread");
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    tracing::error!("audio sampler thread panicked");
                }
            }
        }
    }
}

impl Drop for AudioSampler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn take_sender(tx: &SharedSender) {
    match tx.lock() {
        Ok(mut guard) => drop(guard.take()),
        Err(poisoned) => drop(poisoned.into_inner().take()),
    }
}

/// Publishes under the lock so a concurrent `stop` either sees the send complete or wins.
fn publish(tx: &SharedSender, features: AudioFeatures) -> bool {
    let Ok(guard) = tx.lock() else {
        return false;
    };
    match guard.as_ref() {
        Some(sender) => sender.send(features).is_ok(),
        None => false,
    }
}

fn run_sampler<F>(open: F, frame_samples: usize, tx: SharedSender, stop: Arc<AtomicBool>)
where
    F: FnOnce() -> Result<Box<dyn AudioInput>>,
{
    let mut input = match open() {
        Ok(input) => input,
        Err(err) => {
            tracing::warn!(error=%err, "audio input unavailable");
            take_sender(&tx);
            return;
        }
    };
    let sample_rate = input.sample_rate();
    tracing::info!(sample_rate, frame_samples, "audio sampling started");

    let mut frame = vec![0i16; frame_samples];
    while !stop.load(Ordering::Relaxed) {
        let read = match input.read_frame(&mut frame) {
            Ok(0) => {
                tracing::info!("audio stream ended");
                break;
            }
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(error=%err, "audio read failed; stopping sampler");
                break;
            }
        };
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if let Some(features) = analyze_frame(&frame[..read], sample_rate) {
            if !publish(&tx, features) {
                break;
            }
        }
    }

    take_sender(&tx);
    drop(input);
    tracing::info!("audio sampling stopped");
}
