//! The four-stage concurrent pipeline: Write, ReadAndJoin, PostProcess,
//! Callback.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::accelerator::{AcceleratorDevice, FrameConverter, IdentityConverter, OutputBuffer, OutputStream};
use crate::channel::{Channel, DropPolicy};
use crate::config::PipelineConfig;
use crate::decoder::{AnchorConfig, SegmentationDecoder};
use crate::error::{PipelineError, Result};
use crate::frame::{FrameContext, FrameIdentifier, Rect, Segment, SegmentationResult};
use crate::stats::PipelineStats;

/// The pending tensor planes for one in-flight frame, harvested by the
/// ReadAndJoin barrier and handed to a PostProcess worker alongside the ctx.
type PostItem = (FrameContext, Vec<OutputBuffer>);

/// One slot per output stream, filled by that stream's reader thread and
/// drained by whichever thread completes the join barrier.
type JoinSlots = Vec<Mutex<Option<OutputBuffer>>>;

/// Owns the accelerator device, the decoder, and the four stage channels.
/// `load` wires everything up; `start` launches the worker threads;
/// `submit` is the only entry point for frames.
pub struct Pipeline {
    device: Mutex<Box<dyn AcceleratorDevice>>,
    decoder: Arc<dyn SegmentationDecoder>,
    converter: Arc<dyn FrameConverter>,
    config: PipelineConfig,
    input_width: u32,
    input_height: u32,
    num_outputs: usize,

    write_ch: Arc<Channel<FrameContext>>,
    post_ch: Arc<Channel<PostItem>>,
    callback_ch: Arc<Channel<FrameContext>>,

    stats: Arc<PipelineStats>,
    next_iteration: AtomicU64,
    write_mutex: Mutex<()>,
    running: Arc<AtomicBool>,
    confidence_bits: AtomicU32,

    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Open the pipeline against an already-constructed accelerator device
    /// and decoder, assuming frames submitted to it already match the
    /// device's native input shape (see [`IdentityConverter`]).
    ///
    /// Opening the real accelerator SDK (device enumeration, model load from
    /// a filesystem path) is an external collaborator's job; callers
    /// construct `device` however their SDK binding requires and hand it to
    /// `load` already open.
    pub fn load(
        device: Box<dyn AcceleratorDevice>,
        decoder: Arc<dyn SegmentationDecoder>,
        config: PipelineConfig,
    ) -> Result<Self> {
        Self::load_with_converter(device, decoder, Arc::new(IdentityConverter), config)
    }

    pub fn load_with_converter(
        mut device: Box<dyn AcceleratorDevice>,
        decoder: Arc<dyn SegmentationDecoder>,
        converter: Arc<dyn FrameConverter>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let metadata = device.metadata().clone();
        if metadata.num_outputs() == 0 {
            return Err(PipelineError::ModelLoad {
                path: PathBuf::from("<device>"),
                reason: "model exposes no output streams".into(),
            });
        }

        let stats = Arc::new(PipelineStats::new(1, metadata.num_outputs() as u32, 0, 0));

        let write_ch = Arc::new(Channel::new(config.channels.write, DropPolicy::Oldest));
        let post_ch = Arc::new(Channel::new(config.channels.post, DropPolicy::Oldest));
        let callback_ch = Arc::new(Channel::new(config.channels.callback, DropPolicy::Oldest));

        let write_stats = stats.clone();
        write_ch.connect_dropped(move |ctx: &FrameContext| {
            write_stats.write.frame_dropped(ctx.iteration);
        });
        let post_stats = stats.clone();
        post_ch.connect_dropped(move |item: &PostItem| {
            post_stats.post.frame_dropped(item.0.iteration);
        });
        let callback_stats = stats.clone();
        callback_ch.connect_dropped(move |ctx: &FrameContext| {
            callback_stats.callback.frame_dropped(ctx.iteration);
        });

        Ok(Self {
            device: Mutex::new(device),
            decoder,
            converter,
            input_width: metadata.input_width,
            input_height: metadata.input_height,
            num_outputs: metadata.num_outputs(),
            config: config.clone(),
            write_ch,
            post_ch,
            callback_ch,
            stats,
            next_iteration: AtomicU64::new(0),
            write_mutex: Mutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
            confidence_bits: AtomicU32::new(config.default_confidence_threshold.to_bits()),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn confidence_threshold(&self) -> f32 {
        f32::from_bits(self.confidence_bits.load(Ordering::Relaxed))
    }

    pub fn set_confidence_threshold(&self, value: f32) {
        self.confidence_bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Launch the worker sets. Must be called before `submit`. `post_workers`
    /// defaults to the host core count, `callback_workers` to
    /// `config.callback_workers` (2 by default).
    pub fn start<F>(&self, callback: F, post_workers: Option<usize>, callback_workers: Option<usize>) -> Result<()>
    where
        F: Fn(SegmentationResult) + Send + Sync + 'static,
    {
        let post_workers = post_workers
            .or(self.config.post_workers)
            .unwrap_or_else(|| thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
        let callback_workers = callback_workers.unwrap_or(self.config.callback_workers).max(1);

        self.stats.post.set_thread_count(post_workers as u32);
        self.stats.callback.set_thread_count(callback_workers as u32);

        self.running.store(true, Ordering::Release);

        let output_streams = {
            let mut device = self.device.lock().unwrap();
            device.take_output_streams()
        };
        if output_streams.len() != self.num_outputs {
            return Err(PipelineError::InvariantViolation(format!(
                "device reported {} outputs at load but handed back {} streams at start",
                self.num_outputs,
                output_streams.len()
            )));
        }

        let n = output_streams.len() as u64;
        let read_join_counter = Arc::new(AtomicU64::new(0));
        let slots: Arc<JoinSlots> = Arc::new((0..output_streams.len()).map(|_| Mutex::new(None)).collect());

        let callback = Arc::new(callback);
        let mut handles = Vec::new();

        for (index, stream) in output_streams.into_iter().enumerate() {
            let running = self.running.clone();
            let counter = read_join_counter.clone();
            let slots = slots.clone();
            let write_ch = self.write_ch.clone();
            let post_ch = self.post_ch.clone();
            let stats = self.stats.clone();
            handles.push(thread::spawn(move || {
                read_and_join_worker(index, n, stream, running, counter, slots, write_ch, post_ch, stats)
            }));
        }

        for _ in 0..post_workers {
            let running = self.running.clone();
            let post_ch = self.post_ch.clone();
            let callback_ch = self.callback_ch.clone();
            let decoder = self.decoder.clone();
            let stats = self.stats.clone();
            let network_dims = self.config.network_dims();
            let anchors = self.config.anchor_config();
            let orig_w = self.input_width;
            let orig_h = self.input_height;
            handles.push(thread::spawn(move || {
                post_process_worker(
                    running, post_ch, callback_ch, decoder, stats, network_dims, anchors, orig_w, orig_h,
                )
            }));
        }

        for _ in 0..callback_workers {
            let running = self.running.clone();
            let callback_ch = self.callback_ch.clone();
            let callback = callback.clone();
            let stats = self.stats.clone();
            handles.push(thread::spawn(move || callback_worker(running, callback_ch, callback, stats)));
        }

        *self.workers.lock().unwrap() = handles;
        info!(post_workers, callback_workers, outputs = n, "pipeline started");
        Ok(())
    }

    /// Submit one frame. Non-blocking: drops under load rather than
    /// blocking the caller, per the write mutex's ordering guarantee and the
    /// channel drop policies.
    pub fn submit(&self, frame: &[u8], roi: Rect, id: FrameIdentifier, threshold: Option<f32>) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(PipelineError::Cancelled);
        }

        if self.stats.read_join.behind() >= self.config.behind_threshold {
            self.stats.write.frame_dropped(self.stats.write.last_iteration());
            debug!(camera_id = id.camera_id, frame_id = id.frame_id, "pre-admission drop");
            return Ok(());
        }

        let converted = self
            .converter
            .convert(frame, roi, self.input_width, self.input_height)?;

        let mut ctx = FrameContext::new(id, roi, threshold.unwrap_or_else(|| self.confidence_threshold()));
        ctx.write_watch.start();

        let _guard = self.write_mutex.lock().unwrap();
        let iteration = self.next_iteration.fetch_add(1, Ordering::AcqRel);
        ctx.iteration = iteration;

        {
            let mut device = self.device.lock().unwrap();
            device.write_input(&converted)?;
        }

        ctx.write_watch.stop();
        ctx.inference_and_read_watch.start();
        let processed_ns = ctx.write_watch.total().as_nanos() as u64;

        if self.write_ch.try_write(ctx) {
            self.stats.write.frame_processed(processed_ns, iteration);
        }
        // else: the drop-listener wired in `load` already charged Write.

        Ok(())
    }

    /// Stop accepting work, cancel every channel, join all worker threads,
    /// and release whatever is still in flight.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);

        {
            let mut device = self.device.lock().unwrap();
            device.abort_input();
        }

        self.write_ch.cancel();
        self.post_ch.cancel();
        self.callback_ch.cancel();

        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }

        let write_drained = self.write_ch.drain().len();
        let post_drained = self.post_ch.drain().len();
        let callback_drained = self.callback_ch.drain().len();
        if write_drained + post_drained + callback_drained > 0 {
            debug!(
                write_drained,
                post_drained, callback_drained, "drained in-flight frames on shutdown"
            );
        }
    }
}

/// One ReadAndJoin thread, reading a single output stream for the
/// pipeline's lifetime. The thread whose read completes the `N`-way cycle
/// becomes the joiner: it dequeues the matching `FrameContext` from
/// `write_ch`, harvests every stream's buffer out of `slots`, and hands both
/// on to `post_ch`.
#[allow(clippy::too_many_arguments)]
fn read_and_join_worker(
    index: usize,
    n: u64,
    mut stream: Box<dyn OutputStream>,
    running: Arc<AtomicBool>,
    counter: Arc<AtomicU64>,
    slots: Arc<JoinSlots>,
    write_ch: Arc<Channel<FrameContext>>,
    post_ch: Arc<Channel<PostItem>>,
    stats: Arc<PipelineStats>,
) {
    while running.load(Ordering::Acquire) {
        match stream.read(Duration::from_millis(200)) {
            Ok(Some(buf)) => {
                *slots[index].lock().unwrap() = Some(buf);

                let prev = counter.fetch_add(1, Ordering::AcqRel);
                if prev + 1 == n {
                    counter.fetch_sub(n, Ordering::AcqRel);
                    join_frame(&slots, &write_ch, &post_ch, &stats);
                }
            }
            Ok(None) => continue,
            Err(PipelineError::Cancelled) => break,
            Err(e) => {
                error!(stream = index, error = %e, "output stream read failed, exiting reader");
                break;
            }
        }
    }

    stream.abort();
}

fn join_frame(
    slots: &JoinSlots,
    write_ch: &Channel<FrameContext>,
    post_ch: &Channel<PostItem>,
    stats: &PipelineStats,
) {
    match write_ch.try_read(Duration::from_secs(1)) {
        Ok(Some(mut ctx)) => {
            let elapsed = ctx.inference_and_read_watch.stop();
            ctx.post_process_watch.start();
            stats.read_join.frame_processed(elapsed.as_nanos() as u64, ctx.iteration);

            let tensors: Vec<OutputBuffer> = slots
                .iter()
                .map(|slot| slot.lock().unwrap().take().expect("join barrier fired with an empty slot"))
                .collect();

            post_ch.try_write((ctx, tensors));
            // else: the drop-listener wired in `load` already charged PostProcess.
        }
        Ok(None) => {
            error!("read_join barrier fired but write_ch was empty past its timeout");
        }
        Err(PipelineError::Cancelled) => {}
        Err(e) => {
            error!(error = %e, "unexpected error dequeuing write_ch at join barrier");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn post_process_worker(
    running: Arc<AtomicBool>,
    post_ch: Arc<Channel<PostItem>>,
    callback_ch: Arc<Channel<FrameContext>>,
    decoder: Arc<dyn SegmentationDecoder>,
    stats: Arc<PipelineStats>,
    network_dims: (u32, u32),
    anchors: AnchorConfig,
    orig_w: u32,
    orig_h: u32,
) {
    while running.load(Ordering::Acquire) {
        match post_ch.try_read(Duration::from_secs(10)) {
            Ok(Some((mut ctx, mut tensors))) => {
                tensors.sort_by_key(|t| t.shape.width);

                match decoder.decode(&tensors, network_dims, anchors, Rect::unit(), orig_w, orig_h, ctx.threshold) {
                    Ok(pairs) => {
                        let mut result = SegmentationResult::new(ctx.id, ctx.roi, ctx.threshold);
                        for (detection, mask) in pairs {
                            let resolution = (mask.ncols() as u32, mask.nrows() as u32);
                            let segment = Segment {
                                class_id: detection.class_id,
                                label: detection.label,
                                resolution,
                                bbox: detection.bbox,
                                confidence: detection.confidence,
                                mask,
                            };
                            result.push(segment, detection.uncertain);
                        }
                        ctx.result = Some(result);

                        let elapsed = ctx.post_process_watch.stop();
                        stats.post.frame_processed(elapsed.as_nanos() as u64, ctx.iteration);
                        callback_ch.try_write(ctx);
                        // else: the drop-listener wired in `load` already charged Callback.
                    }
                    Err(e) => {
                        error!(iteration = ctx.iteration, error = %e, "decode failed, dropping frame");
                        stats.post.frame_dropped(ctx.iteration);
                    }
                }
            }
            Ok(None) => continue,
            Err(PipelineError::Cancelled) => break,
            Err(e) => {
                error!(error = %e, "post_ch read failed");
                break;
            }
        }
    }
}

fn callback_worker(
    running: Arc<AtomicBool>,
    callback_ch: Arc<Channel<FrameContext>>,
    callback: Arc<dyn Fn(SegmentationResult) + Send + Sync>,
    stats: Arc<PipelineStats>,
) {
    while running.load(Ordering::Acquire) {
        match callback_ch.try_read(Duration::from_secs(5)) {
            Ok(Some(mut ctx)) => {
                if let Some(result) = ctx.result.take() {
                    callback(result);
                }
                let elapsed = ctx.total_watch.stop();
                stats.callback.frame_processed(elapsed.as_nanos() as u64, ctx.iteration);
                stats.total.frame_processed(elapsed.as_nanos() as u64, ctx.iteration);
            }
            Ok(None) => continue,
            Err(PipelineError::Cancelled) => break,
            Err(e) => {
                error!(error = %e, "callback_ch read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::{ModelMetadata, OutputShape, QuantInfo, SimulatedAccelerator};
    use crate::decoder::StubDecoder;
    use std::sync::mpsc;

    fn metadata(n: usize) -> ModelMetadata {
        ModelMetadata {
            input_width: 16,
            input_height: 16,
            input_frame_size: (16 * 16 * 3) / 2,
            output_names: (0..n).map(|i| format!("s{i}")).collect(),
            output_shapes: (0..n)
                .map(|i| OutputShape {
                    width: 4 + i as u32,
                    height: 4 + i as u32,
                    features: 1,
                })
                .collect(),
            output_quant: (0..n).map(|_| QuantInfo { scale: 1.0, zero_point: 0 }).collect(),
        }
    }

    fn pipeline_with(n: usize, config: PipelineConfig) -> Pipeline {
        let device = Box::new(SimulatedAccelerator::new(metadata(n), Duration::from_millis(2)));
        let decoder = Arc::new(StubDecoder::new(1, (4, 4)));
        Pipeline::load(device, decoder, config).expect("load pipeline")
    }

    #[test]
    fn one_frame_round_trips_to_callback() {
        let pipeline = pipeline_with(3, PipelineConfig::default());
        let (tx, rx) = mpsc::channel();
        pipeline
            .start(move |result| tx.send(result).unwrap(), Some(1), Some(1))
            .expect("start pipeline");

        let frame = vec![0u8; (16 * 16 * 3) / 2];
        pipeline
            .submit(&frame, Rect::unit(), FrameIdentifier::new(1, 1), None)
            .expect("submit frame");

        let result = rx.recv_timeout(Duration::from_secs(5)).expect("callback delivered");
        assert_eq!(result.segments.len(), 1);

        pipeline.stop();
        assert_eq!(pipeline.stats().callback.processed(), 1);
    }

    #[test]
    fn submit_after_stop_is_cancelled() {
        let pipeline = pipeline_with(2, PipelineConfig::default());
        pipeline.start(|_| {}, Some(1), Some(1)).expect("start pipeline");
        pipeline.stop();

        let frame = vec![0u8; (16 * 16 * 3) / 2];
        let result = pipeline.submit(&frame, Rect::unit(), FrameIdentifier::new(1, 1), None);
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[test]
    fn pre_admission_drop_charges_write_when_behind() {
        let mut config = PipelineConfig::default();
        config.behind_threshold = 0;
        let pipeline = pipeline_with(2, config);
        pipeline.start(|_| {}, Some(1), Some(1)).expect("start pipeline");

        // Manufacture a "behind" condition: write has processed one frame
        // further than read_join has (no frame has actually been submitted,
        // so read_join's workers have nothing to catch up on).
        pipeline.stats.write.frame_processed(0, 5);

        let frame = vec![0u8; (16 * 16 * 3) / 2];
        pipeline
            .submit(&frame, Rect::unit(), FrameIdentifier::new(1, 2), None)
            .expect("submit should not error on pre-admission drop");

        assert_eq!(pipeline.stats().write.dropped(), 1);
        pipeline.stop();
    }

    #[test]
    fn confidence_threshold_accessors_govern_default() {
        let pipeline = pipeline_with(1, PipelineConfig::default());
        assert_eq!(pipeline.confidence_threshold(), 0.6);
        pipeline.set_confidence_threshold(0.8);
        assert_eq!(pipeline.confidence_threshold(), 0.8);
    }

    #[test]
    fn stats_report_is_stable_before_start() {
        let pipeline = pipeline_with(1, PipelineConfig::default());
        let report = pipeline.stats().report();
        assert!(report.contains("write"));
    }
}
