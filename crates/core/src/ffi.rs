//! `extern "C"` surface exposing the pipeline to foreign runtimes.
//!
//! Every fallible entry point records its error on a thread-local "last
//! error" register rather than a process-wide global, so concurrent callers
//! on different threads never see each other's errors (mirrors the original
//! `HailoException`/`get_last_hailo_error` design).
//!
//! The accelerator SDK and the YOLO decoder are external collaborators this
//! crate only reaches through traits; `pipeline_load` below wires up the
//! in-repo [`SimulatedAccelerator`]/[`StubDecoder`] pair as the default
//! backend. Linking a real device means swapping those constructors for
//! SDK-backed ones, which is out of scope here.

use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString};
use std::path::Path;
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use crate::accelerator::{ModelMetadata, OutputShape, QuantInfo, SimulatedAccelerator};
use crate::config::PipelineConfig;
use crate::decoder::StubDecoder;
use crate::frame::{FrameIdentifier, Rect, Segment, SegmentationResult};
use crate::pipeline::Pipeline;
use crate::stats::{PipelineStats, StageStats};

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(message: impl std::fmt::Display) {
    let text = message.to_string();
    // Embedded NULs can't round-trip through a C string; truncate at the
    // first one rather than failing to report the error at all.
    let truncated = match text.find('\0') {
        Some(at) => &text[..at],
        None => &text,
    };
    let cstring = CString::new(truncated).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(cstring));
}

/// Last error recorded on the calling thread, or null if there isn't one.
/// The returned pointer is valid until the next fallible call on this
/// thread; callers must copy it out before making another FFI call.
#[no_mangle]
pub extern "C" fn get_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map(|c| c.as_ptr()).unwrap_or(ptr::null()))
}

fn default_metadata() -> ModelMetadata {
    // A representative YOLOv8-seg output layout: three detection heads at
    // strides 8/16/32 over a 640x640 input, plus a mask-prototype plane.
    ModelMetadata {
        input_width: 640,
        input_height: 640,
        input_frame_size: (640 * 640 * 3) / 2,
        output_names: vec!["stride8".into(), "stride16".into(), "stride32".into(), "proto".into()],
        output_shapes: vec![
            OutputShape { width: 80, height: 80, features: 116 },
            OutputShape { width: 40, height: 40, features: 116 },
            OutputShape { width: 20, height: 20, features: 116 },
            OutputShape { width: 160, height: 160, features: 32 },
        ],
        output_quant: vec![QuantInfo { scale: 1.0, zero_point: 0 }; 4],
    }
}

/// Open the pipeline. `model_path` is accepted for parity with the public
/// contract but, absent a linked accelerator SDK, only used in diagnostics;
/// `config_path` is loaded via [`PipelineConfig::load_from_path`] if
/// non-null, layered with `HAILOSEG_*` environment overrides either way.
///
/// # Safety
/// `model_path` and `config_path`, when non-null, must point at valid,
/// NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn pipeline_load(model_path: *const c_char, config_path: *const c_char) -> *mut Pipeline {
    let model_path_str = if model_path.is_null() {
        String::new()
    } else {
        match CStr::from_ptr(model_path).to_str() {
            Ok(s) => s.to_string(),
            Err(e) => {
                set_last_error(format!("model_path is not valid UTF-8: {e}"));
                return ptr::null_mut();
            }
        }
    };

    let config = if config_path.is_null() {
        PipelineConfig::default()
    } else {
        match CStr::from_ptr(config_path).to_str() {
            Ok(s) => match PipelineConfig::load_from_path(Path::new(s)) {
                Ok(cfg) => cfg,
                Err(e) => {
                    set_last_error(format!("failed to load config: {e}"));
                    return ptr::null_mut();
                }
            },
            Err(e) => {
                set_last_error(format!("config_path is not valid UTF-8: {e}"));
                return ptr::null_mut();
            }
        }
    }
    .with_env_overrides();

    let device = Box::new(SimulatedAccelerator::new(default_metadata(), Duration::from_millis(5)));
    let decoder = Arc::new(StubDecoder::new(1, (160, 160)));

    match Pipeline::load(device, decoder, config) {
        Ok(pipeline) => {
            tracing::info!(model_path = %model_path_str, "pipeline loaded");
            Box::into_raw(Box::new(pipeline))
        }
        Err(e) => {
            set_last_error(e);
            ptr::null_mut()
        }
    }
}

type ResultCallback = extern "C" fn(result: *mut SegmentationResult, user_ctx: *mut c_void);

/// Wraps a raw user context pointer so it can cross into the worker closure.
/// Sound because the pointer is never dereferenced by Rust code — it is
/// handed back to `callback_fn` verbatim, on whichever thread a callback
/// worker happens to run on, exactly as the caller's C API contract expects.
struct SendPtr(*mut c_void);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// # Safety
/// `handle` must be a live pointer from `pipeline_load`. `callback_fn` must
/// be safely callable from any thread with the given `user_ctx`.
#[no_mangle]
pub unsafe extern "C" fn pipeline_start_async(
    handle: *mut Pipeline,
    callback_fn: ResultCallback,
    user_ctx: *mut c_void,
    post_workers: i32,
    callback_workers: i32,
) -> bool {
    let Some(pipeline) = handle.as_ref() else {
        set_last_error("pipeline_start_async: null handle");
        return false;
    };

    let user_ctx = SendPtr(user_ctx);
    let post_workers = (post_workers > 0).then_some(post_workers as usize);
    let callback_workers = (callback_workers > 0).then_some(callback_workers as usize);

    let result = pipeline.start(
        move |result: SegmentationResult| {
            let boxed = Box::into_raw(Box::new(result));
            callback_fn(boxed, user_ctx.0);
        },
        post_workers,
        callback_workers,
    );

    match result {
        Ok(()) => true,
        Err(e) => {
            set_last_error(e);
            false
        }
    }
}

/// # Safety
/// `handle` must be live. `buf` must point at an I420 buffer of
/// `frame_w * frame_h * 3 / 2` readable bytes (Y plane followed by U and V,
/// no padding). `threshold` is an override when `>= 0.0`; negative means
/// "use the pipeline's default confidence threshold".
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn pipeline_write_frame(
    handle: *mut Pipeline,
    buf: *const u8,
    camera_id: u32,
    frame_id: u64,
    frame_w: u32,
    frame_h: u32,
    roi_x: i32,
    roi_y: i32,
    roi_w: i32,
    roi_h: i32,
    threshold: f32,
) -> bool {
    let Some(pipeline) = handle.as_ref() else {
        set_last_error("pipeline_write_frame: null handle");
        return false;
    };
    if buf.is_null() {
        set_last_error("pipeline_write_frame: null buffer");
        return false;
    }

    let len = (frame_w as usize * frame_h as usize * 3) / 2;
    let frame = slice::from_raw_parts(buf, len);
    let roi = Rect::new(roi_x, roi_y, roi_w, roi_h);
    let id = FrameIdentifier::new(camera_id, frame_id);
    let threshold = (threshold >= 0.0).then_some(threshold);

    match pipeline.submit(frame, roi, id, threshold) {
        Ok(()) => true,
        Err(e) => {
            set_last_error(e);
            false
        }
    }
}

/// # Safety
/// `handle` must be a live pointer from `pipeline_load`.
#[no_mangle]
pub unsafe extern "C" fn pipeline_stop(handle: *mut Pipeline) {
    if let Some(pipeline) = handle.as_ref() {
        pipeline.stop();
    }
}

/// # Safety
/// `handle` must be a live pointer from `pipeline_load`, not used again
/// after this call.
#[no_mangle]
pub unsafe extern "C" fn pipeline_dispose(handle: *mut Pipeline) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// # Safety
/// `handle` must be live; `out_stats` must point at writable
/// `PipelineStatsDto` storage.
#[no_mangle]
pub unsafe extern "C" fn pipeline_update_stats(handle: *mut Pipeline, out_stats: *mut PipelineStatsDto) {
    let (Some(pipeline), false) = (handle.as_ref(), out_stats.is_null()) else {
        return;
    };
    *out_stats = PipelineStatsDto::from(pipeline.stats());
}

/// # Safety
/// `handle` must be a live pointer from `pipeline_load`.
#[no_mangle]
pub unsafe extern "C" fn pipeline_get_confidence(handle: *mut Pipeline) -> f32 {
    handle.as_ref().map(|p| p.confidence_threshold()).unwrap_or(0.0)
}

/// # Safety
/// `handle` must be a live pointer from `pipeline_load`.
#[no_mangle]
pub unsafe extern "C" fn pipeline_set_confidence(handle: *mut Pipeline, value: f32) {
    if let Some(pipeline) = handle.as_ref() {
        pipeline.set_confidence_threshold(value);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct StageStatsDto {
    pub processed: u64,
    pub dropped: u64,
    pub last_iteration: u64,
    pub behind: u64,
    pub total_processing_time_ns: i64,
    pub thread_count: i32,
}

impl From<&StageStats> for StageStatsDto {
    fn from(s: &StageStats) -> Self {
        Self {
            processed: s.processed(),
            dropped: s.dropped(),
            last_iteration: s.last_iteration(),
            behind: s.behind(),
            total_processing_time_ns: s.total_ns() as i64,
            thread_count: s.thread_count() as i32,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStatsDto {
    pub write: StageStatsDto,
    pub read_join: StageStatsDto,
    pub post: StageStatsDto,
    pub callback: StageStatsDto,
    pub total: StageStatsDto,
    pub in_flight: u64,
    pub dropped_total: u64,
}

impl From<&PipelineStats> for PipelineStatsDto {
    fn from(s: &PipelineStats) -> Self {
        Self {
            write: StageStatsDto::from(s.write.as_ref()),
            read_join: StageStatsDto::from(s.read_join.as_ref()),
            post: StageStatsDto::from(s.post.as_ref()),
            callback: StageStatsDto::from(s.callback.as_ref()),
            total: StageStatsDto::from(s.total.as_ref()),
            in_flight: s.in_flight(),
            dropped_total: s.dropped_total(),
        }
    }
}

/// # Safety
/// `handle` must be a live pointer from a delivered callback.
#[no_mangle]
pub unsafe extern "C" fn result_count(handle: *mut SegmentationResult) -> usize {
    handle.as_ref().map(|r| r.len()).unwrap_or(0)
}

/// Returns a pointer to the segment at `index`, valid as long as `handle`
/// has not been disposed. Null if `handle` is null or `index` is out of range.
///
/// # Safety
/// `handle` must be a live pointer from a delivered callback.
#[no_mangle]
pub unsafe extern "C" fn result_get(handle: *mut SegmentationResult, index: usize) -> *const Segment {
    match handle.as_ref() {
        Some(result) => result.segments.get(index).map(|s| s as *const Segment).unwrap_or(ptr::null()),
        None => ptr::null(),
    }
}

/// # Safety
/// `handle` must be a live pointer from a delivered callback, not used
/// again after this call.
#[no_mangle]
pub unsafe extern "C" fn result_dispose(handle: *mut SegmentationResult) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// # Safety
/// `handle` must be live; `out_camera_id`/`out_frame_id` must be writable.
#[no_mangle]
pub unsafe extern "C" fn result_id(handle: *mut SegmentationResult, out_camera_id: *mut u32, out_frame_id: *mut u64) {
    if let Some(result) = handle.as_ref() {
        if !out_camera_id.is_null() {
            *out_camera_id = result.id.camera_id;
        }
        if !out_frame_id.is_null() {
            *out_frame_id = result.id.frame_id;
        }
    }
}

/// # Safety
/// `handle` must be live; the four `out_*` pointers must be writable.
#[no_mangle]
pub unsafe extern "C" fn result_roi(
    handle: *mut SegmentationResult,
    out_x: *mut i32,
    out_y: *mut i32,
    out_w: *mut i32,
    out_h: *mut i32,
) {
    let Some(result) = handle.as_ref() else { return };
    write_rect(result.roi, out_x, out_y, out_w, out_h);
}

/// # Safety
/// `handle` must be a live pointer from a delivered callback.
#[no_mangle]
pub unsafe extern "C" fn result_threshold(handle: *mut SegmentationResult) -> f32 {
    handle.as_ref().map(|r| r.threshold).unwrap_or(0.0)
}

/// # Safety
/// `handle` must be a live pointer from a delivered callback.
#[no_mangle]
pub unsafe extern "C" fn result_uncertain_counter(handle: *mut SegmentationResult) -> u32 {
    handle.as_ref().map(|r| r.uncertain_counter).unwrap_or(0)
}

/// # Safety
/// `handle` must be a pointer returned by `result_get` for a still-live result.
#[no_mangle]
pub unsafe extern "C" fn segment_get_confidence(handle: *const Segment) -> f32 {
    handle.as_ref().map(|s| s.confidence).unwrap_or(0.0)
}

/// # Safety
/// `handle` must be a pointer returned by `result_get` for a still-live result.
#[no_mangle]
pub unsafe extern "C" fn segment_get_classid(handle: *const Segment) -> i32 {
    handle.as_ref().map(|s| s.class_id).unwrap_or(-1)
}

/// Copies up to `buf_len - 1` bytes of the segment's label into `buf`,
/// NUL-terminated, and returns the number of bytes written (excluding the
/// terminator). Returns 0 if `handle` or `buf` is null, or `buf_len` is 0.
///
/// # Safety
/// `handle` must be a pointer returned by `result_get` for a still-live
/// result; `buf` must point at `buf_len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn segment_get_label(handle: *const Segment, buf: *mut c_char, buf_len: usize) -> usize {
    let (Some(segment), false) = (handle.as_ref(), buf.is_null() || buf_len == 0) else {
        return 0;
    };

    let bytes = segment.label.as_bytes();
    let copy_len = bytes.len().min(buf_len - 1);
    let dst = slice::from_raw_parts_mut(buf as *mut u8, buf_len);
    dst[..copy_len].copy_from_slice(&bytes[..copy_len]);
    dst[copy_len] = 0;
    copy_len
}

/// Copies the segment's raw mask, row-major, up to `max_len` `f32` samples,
/// and returns the number of samples written. Use
/// [`segment_get_resolution`] to know the mask's `(width, height)` first.
///
/// # Safety
/// `handle` must be a pointer returned by `result_get` for a still-live
/// result; `out_buf` must point at `max_len` writable `f32` slots.
#[no_mangle]
pub unsafe extern "C" fn segment_get_data(handle: *const Segment, out_buf: *mut f32, max_len: usize) -> usize {
    let (Some(segment), false) = (handle.as_ref(), out_buf.is_null()) else {
        return 0;
    };

    let dst = slice::from_raw_parts_mut(out_buf, max_len);
    let mut written = 0;
    for value in segment.mask.iter() {
        if written >= max_len {
            break;
        }
        dst[written] = *value;
        written += 1;
    }
    written
}

/// # Safety
/// `handle` must be a pointer returned by `result_get`; the four `out_*`
/// pointers must be writable.
#[no_mangle]
pub unsafe extern "C" fn segment_get_bbox(
    handle: *const Segment,
    out_x: *mut f32,
    out_y: *mut f32,
    out_w: *mut f32,
    out_h: *mut f32,
) {
    let Some(segment) = handle.as_ref() else { return };
    let (x, y, w, h) = segment.bbox;
    if !out_x.is_null() {
        *out_x = x;
    }
    if !out_y.is_null() {
        *out_y = y;
    }
    if !out_w.is_null() {
        *out_w = w;
    }
    if !out_h.is_null() {
        *out_h = h;
    }
}

/// # Safety
/// `handle` must be a pointer returned by `result_get`; both `out_*`
/// pointers must be writable.
#[no_mangle]
pub unsafe extern "C" fn segment_get_resolution(handle: *const Segment, out_w: *mut u32, out_h: *mut u32) {
    let Some(segment) = handle.as_ref() else { return };
    let (w, h) = segment.resolution;
    if !out_w.is_null() {
        *out_w = w;
    }
    if !out_h.is_null() {
        *out_h = h;
    }
}

/// Writes up to `max_len` `(x, y)` contour points, flattened as
/// `x0, y0, x1, y1, ...`, into `out_buf` and returns the number of `i32`
/// values written (twice the point count). Returns 0 for a degenerate
/// contour (see [`Segment::compute_polygon`]).
///
/// # Safety
/// `handle` must be a pointer returned by `result_get`; `out_buf` must point
/// at `max_len` writable `i32` slots.
#[no_mangle]
pub unsafe extern "C" fn segment_compute_polygon(
    handle: *const Segment,
    threshold: f32,
    out_buf: *mut i32,
    max_len: usize,
) -> usize {
    let (Some(segment), false) = (handle.as_ref(), out_buf.is_null()) else {
        return 0;
    };

    let max_points = max_len / 2;
    let points = segment.compute_polygon(threshold, max_points);
    let dst = slice::from_raw_parts_mut(out_buf, max_len);
    let mut written = 0;
    for (x, y) in points {
        if written + 1 >= max_len {
            break;
        }
        dst[written] = x;
        dst[written + 1] = y;
        written += 2;
    }
    written
}

unsafe fn write_rect(roi: Rect, out_x: *mut i32, out_y: *mut i32, out_w: *mut i32, out_h: *mut i32) {
    if !out_x.is_null() {
        *out_x = roi.x;
    }
    if !out_y.is_null() {
        *out_y = roi.y;
    }
    if !out_w.is_null() {
        *out_w = roi.width;
    }
    if !out_h.is_null() {
        *out_h = roi.height;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    static DELIVERED: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn record_delivery(result: *mut SegmentationResult, user_ctx: *mut c_void) {
        DELIVERED.fetch_add(1, Ordering::SeqCst);
        unsafe {
            let sender = &*(user_ctx as *const mpsc::Sender<()>);
            let _ = sender.send(());
            result_dispose(result);
        }
    }

    #[test]
    fn load_start_write_stop_dispose_round_trip() {
        unsafe {
            let handle = pipeline_load(ptr::null(), ptr::null());
            assert!(!handle.is_null());

            let (tx, rx) = mpsc::channel::<()>();
            let ok = pipeline_start_async(handle, record_delivery, &tx as *const _ as *mut c_void, 1, 1);
            assert!(ok);

            let frame = vec![0u8; (640 * 640 * 3) / 2];
            let wrote = pipeline_write_frame(handle, frame.as_ptr(), 1, 1, 640, 640, 0, 0, 1, 1, -1.0);
            assert!(wrote);

            rx.recv_timeout(Duration::from_secs(5)).expect("callback delivered");

            pipeline_stop(handle);
            pipeline_dispose(handle);
        }
    }

    #[test]
    fn get_last_error_reports_null_handle_failures() {
        unsafe {
            let wrote = pipeline_write_frame(ptr::null_mut(), ptr::null(), 0, 0, 0, 0, 0, 0, 1, 1, -1.0);
            assert!(!wrote);
            let err = get_last_error();
            assert!(!err.is_null());
            let message = CStr::from_ptr(err).to_str().unwrap();
            assert!(message.contains("null"));
        }
    }

    #[test]
    fn stats_dto_reflects_stage_counters() {
        unsafe {
            let handle = pipeline_load(ptr::null(), ptr::null());
            assert!(!handle.is_null());
            let mut dto = PipelineStatsDto::default();
            pipeline_update_stats(handle, &mut dto as *mut _);
            assert_eq!(dto.write.processed, 0);
            pipeline_dispose(handle);
        }
    }

    #[test]
    fn confidence_accessors_round_trip() {
        unsafe {
            let handle = pipeline_load(ptr::null(), ptr::null());
            pipeline_set_confidence(handle, 0.42);
            assert!((pipeline_get_confidence(handle) - 0.42).abs() < 1e-6);
            pipeline_dispose(handle);
        }
    }

    extern "C" fn forward_handle(result: *mut SegmentationResult, user_ctx: *mut c_void) {
        unsafe {
            let sender = &*(user_ctx as *const mpsc::Sender<usize>);
            let _ = sender.send(result as usize);
        }
    }

    #[test]
    fn segment_accessors_read_back_a_delivered_result() {
        unsafe {
            let handle = pipeline_load(ptr::null(), ptr::null());
            let (tx, rx) = mpsc::channel::<usize>();
            assert!(pipeline_start_async(handle, forward_handle, &tx as *const _ as *mut c_void, 1, 1));

            let frame = vec![0u8; (640 * 640 * 3) / 2];
            assert!(pipeline_write_frame(handle, frame.as_ptr(), 1, 1, 640, 640, 0, 0, 1, 1, -1.0));

            let result_ptr = rx.recv_timeout(Duration::from_secs(5)).expect("callback delivered") as *mut SegmentationResult;
            assert_eq!(result_count(result_ptr), 1);

            let segment = result_get(result_ptr, 1);
            assert!(segment.is_null());

            let segment = result_get(result_ptr, 0);
            assert!(!segment.is_null());

            let mut width = 0u32;
            let mut height = 0u32;
            segment_get_resolution(segment, &mut width, &mut height);
            assert_eq!((width, height), (160, 160));

            let mut data = vec![0f32; (width * height) as usize];
            let written = segment_get_data(segment, data.as_mut_ptr(), data.len());
            assert_eq!(written, data.len());

            let mut points = vec![0i32; 64];
            let written = segment_compute_polygon(segment, 0.5, points.as_mut_ptr(), points.len());
            assert_eq!(written, 0); // flat zero mask never exceeds the threshold

            result_dispose(result_ptr);
            pipeline_stop(handle);
            pipeline_dispose(handle);
        }
    }
}
