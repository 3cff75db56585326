//! Super-resolution inference on top of `ort`.
//!
//! The model is a Real-ESRGAN x4plus RRDB network exported to ONNX
//! (3 in / 3 out channels, 64 features, 23 RRDB blocks, 32 growth channels,
//! native 4x). It expects NCHW float32 input in the 0-255 range.

use crate::config::ModelSettings;
use crate::upscaler::{output_dimensions, InferenceError, Upscaler};
use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{imageops::FilterType, DynamicImage, GenericImageView, GrayImage, RgbImage, RgbaImage};
use ndarray::{s, Array4};
use ort::{
    execution_providers::{
        CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{Arc, Mutex};

/// Model requires spatial dimensions to be multiples of this.
const PAD_ALIGN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeDevice {
    Accelerated,
    Cpu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    Full,
    Half,
}

/// Resolved once at startup, never re-probed per request.
pub fn probe_device() -> ComputeDevice {
    let cuda = CUDAExecutionProvider::default();
    if cuda.is_available().unwrap_or(false) {
        ComputeDevice::Accelerated
    } else {
        tracing::warn!("CUDA EP is not available, inference will run on CPU");
        ComputeDevice::Cpu
    }
}

#[derive(Clone)]
pub struct OrtUpscaler {
    inner: Arc<Inner>,
}

struct Inner {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    native_scale: u32,
    tile_size: usize,
    tile_pad: usize,
    pre_pad: usize,
}

impl OrtUpscaler {
    pub fn new(model: &ModelSettings, device: ComputeDevice) -> Result<Self> {
        // Reduced precision only when accelerated compute was selected.
        let precision = match device {
            ComputeDevice::Accelerated => Precision::Half,
            ComputeDevice::Cpu => Precision::Full,
        };

        let builder =
            Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

        let model_path = model.get_model_path();
        let session = match device {
            ComputeDevice::Accelerated => builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_fp16(precision == Precision::Half)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(&model_path)
                .with_context(|| format!("Failed to load ONNX model: {:?}", model_path))?,
            ComputeDevice::Cpu => builder
                .commit_from_file(&model_path)
                .with_context(|| format!("Failed to load ONNX model: {:?}", model_path))?,
        };

        let input_name = session.inputs()[0].name().to_string();
        let output_name = session.outputs()[0].name().to_string();

        tracing::info!(
            ?device,
            ?precision,
            native_scale = model.native_scale,
            tile_size = model.tile_size,
            tile_pad = model.tile_pad,
            pre_pad = model.pre_pad,
            "Loaded super-resolution model"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                session: Mutex::new(session),
                input_name,
                output_name,
                native_scale: model.native_scale,
                tile_size: model.tile_size,
                tile_pad: model.tile_pad,
                pre_pad: model.pre_pad,
            }),
        })
    }
}

#[async_trait]
impl Upscaler for OrtUpscaler {
    async fn upscale(
        &self,
        image: DynamicImage,
        outscale: f32,
    ) -> Result<DynamicImage, InferenceError> {
        let inner = Arc::clone(&self.inner);
        // The forward pass is blocking and CPU/GPU-bound; keep it off the
        // cooperative scheduler.
        tokio::task::spawn_blocking(move || inner.upscale_image(image, outscale)).await?
    }
}

impl Inner {
    fn upscale_image(
        &self,
        image: DynamicImage,
        outscale: f32,
    ) -> Result<DynamicImage, InferenceError> {
        let (in_w, in_h) = image.dimensions();
        let has_alpha = image.color().has_alpha();
        let rgb = image.to_rgb8();

        let input = rgb_to_nchw(&rgb);
        let padded = reflect_pad(&input, self.pre_pad, PAD_ALIGN);
        let output = self.infer_padded(&padded, in_h as usize, in_w as usize)?;

        let scale = self.native_scale as usize;
        let sr = nchw_to_rgb(&output, in_h as usize * scale, in_w as usize * scale)?;

        let (target_w, target_h) = output_dimensions(in_w, in_h, outscale);
        let mut result = DynamicImage::ImageRgb8(sr);
        if (target_w, target_h) != (in_w * self.native_scale, in_h * self.native_scale) {
            result = result.resize_exact(target_w, target_h, FilterType::Lanczos3);
        }

        // The model only sees RGB; an alpha plane is upscaled by plain
        // interpolation and re-attached.
        if has_alpha {
            let alpha = extract_alpha(&image);
            let alpha_up = image::imageops::resize(&alpha, target_w, target_h, FilterType::Triangle);
            result = DynamicImage::ImageRgba8(merge_alpha(&result.to_rgb8(), &alpha_up));
        }

        Ok(result)
    }

    /// Runs the padded input through the network, whole-image or tiled, and
    /// crops the result back to `orig * native_scale`.
    fn infer_padded(
        &self,
        padded: &Array4<f32>,
        orig_h: usize,
        orig_w: usize,
    ) -> Result<Array4<f32>, InferenceError> {
        let scale = self.native_scale as usize;
        let output = if self.tile_size > 0 {
            self.infer_tiled(padded, orig_h, orig_w)?
        } else {
            self.run_session(padded)?
        };

        let out_h = orig_h * scale;
        let out_w = orig_w * scale;
        if output.shape()[2] < out_h || output.shape()[3] < out_w {
            return Err(InferenceError::Tensor(format!(
                "model output {:?} smaller than expected {}x{}",
                output.shape(),
                out_h,
                out_w
            )));
        }
        if output.shape()[2] != out_h || output.shape()[3] != out_w {
            Ok(output.slice(s![.., .., ..out_h, ..out_w]).to_owned())
        } else {
            Ok(output)
        }
    }

    /// Overlapping-tile inference, stitched without seams. `tile_pad` is the
    /// context carried on each tile side; only the inner region of each tile
    /// output lands in the stitched result.
    fn infer_tiled(
        &self,
        input: &Array4<f32>,
        orig_h: usize,
        orig_w: usize,
    ) -> Result<Array4<f32>, InferenceError> {
        let scale = self.native_scale as usize;
        let overlap = self.tile_pad;
        if self.tile_size <= overlap * 2 {
            return Err(InferenceError::Tensor(format!(
                "tile_size ({}) too small for tile_pad ({})",
                self.tile_size, overlap
            )));
        }

        let out_h = orig_h * scale;
        let out_w = orig_w * scale;
        let mut output = Array4::<f32>::zeros((1, 3, out_h, out_w));

        let padded_h = input.shape()[2];
        let padded_w = input.shape()[3];

        tracing::debug!(
            tile_size = self.tile_size,
            overlap,
            padded_h,
            padded_w,
            "Starting tiled inference"
        );

        for rect in tile_grid(
            orig_h,
            orig_w,
            padded_h,
            padded_w,
            self.tile_size,
            overlap,
            scale,
        ) {
            let tile = input
                .slice(s![.., .., rect.in_y0..rect.in_y1, rect.in_x0..rect.in_x1])
                .to_owned();
            let tile = reflect_pad(&tile, 0, PAD_ALIGN);
            let tile_out = self.run_session(&tile)?;

            output
                .slice_mut(s![
                    ..,
                    ..,
                    rect.dst_y0..rect.dst_y0 + rect.h_px,
                    rect.dst_x0..rect.dst_x0 + rect.w_px
                ])
                .assign(&tile_out.slice(s![
                    ..,
                    ..,
                    rect.src_y0..rect.src_y0 + rect.h_px,
                    rect.src_x0..rect.src_x0 + rect.w_px
                ]));
        }

        Ok(output)
    }

    fn run_session(&self, input: &Array4<f32>) -> Result<Array4<f32>, InferenceError> {
        let mut session = self
            .session
            .lock()
            .map_err(|e| InferenceError::Tensor(format!("session mutex poisoned: {}", e)))?;

        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| InferenceError::Tensor(format!("failed to build tensor: {}", e)))?;

        let outputs = session.run(ort::inputs![self.input_name.as_str() => tensor_ref])?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Tensor(format!("failed to extract tensor: {}", e)))?;

        let ix = shape.to_ixdyn();
        let array = ndarray::ArrayD::from_shape_vec(ix, data.to_vec())
            .map_err(|e| InferenceError::Tensor(format!("invalid tensor shape: {}", e)))?;

        array
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| InferenceError::Tensor(format!("output is not NCHW: {}", e)))
    }
}

/// One tile's read window in the padded input plus where its usable output
/// region lands in the stitched result. Offsets suffixed `_y0`/`_x0` and the
/// `h_px`/`w_px` extents are in output pixels (already scaled), except the
/// `in_*` read window, which is in input pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TileRect {
    in_y0: usize,
    in_y1: usize,
    in_x0: usize,
    in_x1: usize,
    src_y0: usize,
    src_x0: usize,
    dst_y0: usize,
    dst_x0: usize,
    h_px: usize,
    w_px: usize,
}

/// Tile placement for overlapping-tile inference. Each tile reads `overlap`
/// pixels of context on its leading sides; the context rows are cropped out
/// of the tile output before stitching. Caller guarantees
/// `tile_size > 2 * overlap`.
fn tile_grid(
    orig_h: usize,
    orig_w: usize,
    padded_h: usize,
    padded_w: usize,
    tile_size: usize,
    overlap: usize,
    scale: usize,
) -> Vec<TileRect> {
    let step = tile_size - overlap * 2;
    let out_h = orig_h * scale;
    let out_w = orig_w * scale;

    let mut rects = Vec::new();
    for ty in (0..orig_h).step_by(step) {
        for tx in (0..orig_w).step_by(step) {
            let in_y0 = ty.saturating_sub(overlap);
            let in_x0 = tx.saturating_sub(overlap);
            let in_y1 = (ty + tile_size).min(padded_h);
            let in_x1 = (tx + tile_size).min(padded_w);
            let tile_h = in_y1 - in_y0;
            let tile_w = in_x1 - in_x0;

            let usable_h = (tile_h - (ty - in_y0)).min(orig_h - ty);
            let usable_w = (tile_w - (tx - in_x0)).min(orig_w - tx);

            let dst_y0 = ty * scale;
            let dst_x0 = tx * scale;
            let h_px = (usable_h * scale).min(out_h - dst_y0);
            let w_px = (usable_w * scale).min(out_w - dst_x0);

            rects.push(TileRect {
                in_y0,
                in_y1,
                in_x0,
                in_x1,
                src_y0: (ty - in_y0) * scale,
                src_x0: (tx - in_x0) * scale,
                dst_y0,
                dst_x0,
                h_px,
                w_px,
            });
        }
    }
    rects
}

/// Interleaved RGB u8 -> NCHW `[1,3,H,W]` float32 in the 0-255 range
/// (Real-ESRGAN convention, no normalization).
fn rgb_to_nchw(img: &RgbImage) -> Array4<f32> {
    let (w, h) = img.dimensions();
    let mut nchw = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        nchw[[0, 0, y as usize, x as usize]] = r as f32;
        nchw[[0, 1, y as usize, x as usize]] = g as f32;
        nchw[[0, 2, y as usize, x as usize]] = b as f32;
    }
    nchw
}

/// NCHW `[1,3,H,W]` float32 -> interleaved RGB u8, clamped to 0-255.
fn nchw_to_rgb(arr: &Array4<f32>, out_h: usize, out_w: usize) -> Result<RgbImage, InferenceError> {
    if arr.shape() != [1, 3, out_h, out_w] {
        return Err(InferenceError::Tensor(format!(
            "expected [1, 3, {}, {}] output, got {:?}",
            out_h,
            out_w,
            arr.shape()
        )));
    }
    let mut img = RgbImage::new(out_w as u32, out_h as u32);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let (x, y) = (x as usize, y as usize);
        pixel.0 = [
            arr[[0, 0, y, x]].clamp(0.0, 255.0) as u8,
            arr[[0, 1, y, x]].clamp(0.0, 255.0) as u8,
            arr[[0, 2, y, x]].clamp(0.0, 255.0) as u8,
        ];
    }
    Ok(img)
}

/// Reflection-pads bottom and right so dimensions reach `h + extra` and
/// `w + extra`, rounded up to a multiple of `align`.
fn reflect_pad(arr: &Array4<f32>, extra: usize, align: usize) -> Array4<f32> {
    let h = arr.shape()[2];
    let w = arr.shape()[3];
    let new_h = round_up(h + extra, align);
    let new_w = round_up(w + extra, align);
    if new_h == h && new_w == w {
        return arr.clone();
    }

    let mut padded = Array4::<f32>::zeros((1, 3, new_h, new_w));
    padded.slice_mut(s![.., .., ..h, ..w]).assign(arr);

    for c in 0..3 {
        for y in h..new_h {
            let src_y = reflect_index(y, h);
            for x in 0..w {
                padded[[0, c, y, x]] = arr[[0, c, src_y, x]];
            }
        }
        for x in w..new_w {
            let src_x = reflect_index(x, w);
            for y in 0..new_h {
                let src_y = if y < h { y } else { reflect_index(y, h) };
                padded[[0, c, y, x]] = arr[[0, c, src_y, src_x]];
            }
        }
    }

    padded
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Mirror an out-of-bounds index back into `0..len` without repeating the
/// edge sample: `len + k` maps to `len - 2 - k`, oscillating with period
/// `2 * (len - 1)` when the overshoot exceeds the extent.
fn reflect_index(i: usize, len: usize) -> usize {
    debug_assert!(i >= len);
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let phase = i % period;
    if phase < len {
        phase
    } else {
        period - phase
    }
}

fn extract_alpha(image: &DynamicImage) -> GrayImage {
    let rgba = image.to_rgba8();
    let (w, h) = rgba.dimensions();
    let mut alpha = GrayImage::new(w, h);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        alpha.get_pixel_mut(x, y).0 = [pixel.0[3]];
    }
    alpha
}

fn merge_alpha(rgb: &RgbImage, alpha: &GrayImage) -> RgbaImage {
    let (w, h) = rgb.dimensions();
    let mut rgba = RgbaImage::new(w, h);
    for (x, y, pixel) in rgba.enumerate_pixels_mut() {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let [a] = alpha.get_pixel(x, y).0;
        pixel.0 = [r, g, b, a];
    }
    rgba
}
