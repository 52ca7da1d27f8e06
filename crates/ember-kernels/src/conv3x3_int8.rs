//! Quantized 3×3 convolution via integer Winograd F(2×2, 3×3).
//!
//! The output is cut into 2×2 tiles. Tile ranges are split across
//! `thread_num` tasks; each task owns a private scratch set and a disjoint
//! slice of the int8 staging buffer, so no locking is needed. After the
//! join, staging is scattered into the NHWC output and cropped to bounds.
//!
//! Numeric path per tile:
//! 1. gather the 4×4 input window, zero point removed, widened to i16
//!    (out-of-bounds taps are 0)
//! 2. `V = B^T d B` per input channel
//! 3. `M[k][oc] = Σ_ic V[k][ic] * U[k][oc][ic]` in checked i32
//! 4. `Y = A^T M A / 4`, add bias, requantize, clamp, saturate to i8

use rayon::prelude::*;

use ember_core::{EmberError, Result, Tensor};

use crate::conv_int8::{prepare_quant_conv, QuantConvSetup};
use crate::kernel::{task_tile_range, tiles_per_task, Kernel, KernelBase, KernelConfig, OpDesc, RunContext};
use crate::param::{ConvGeometry, ConvParam};
use crate::winograd::{self, INPUT_UNIT, OUTPUT_UNIT, TILE_ELEMS};

/// Output pixels per tile.
const TILE_PIXELS: usize = OUTPUT_UNIT * OUTPUT_UNIT;

/// Per-task scratch. Each task touches only its own instance.
#[derive(Debug, Clone, Default)]
struct TaskScratch {
    /// Gathered input window `[16][C_in]`.
    tile_buffer: Vec<i16>,
    /// Transformed window `[16][C_in]`.
    block_unit: Vec<i16>,
    /// Transformed-domain accumulator `[16][C_out]`.
    tmp_dst: Vec<i32>,
}

impl TaskScratch {
    fn new(in_c: usize, out_c: usize) -> Self {
        Self {
            tile_buffer: vec![0; TILE_ELEMS * in_c],
            block_unit: vec![0; TILE_ELEMS * in_c],
            tmp_dst: vec![0; TILE_ELEMS * out_c],
        }
    }
}

pub struct Conv3x3Int8Kernel {
    base: KernelBase,
    param: ConvParam,
    setup: Option<QuantConvSetup>,
    /// `[16][C_out][C_in]`, read-only during `run`.
    transformed_filter: Vec<i16>,
    filter_version: Option<u64>,
    /// Whole input with the zero point removed, `[N, H, W, C_in]`.
    input_i16: Vec<i16>,
    /// `[tile_count][4][C_out]`.
    staging: Vec<i8>,
    scratch: Vec<TaskScratch>,
    tile_h: usize,
    tile_w: usize,
}

impl Conv3x3Int8Kernel {
    /// True when `param` names an explicit 3×3 filter with unit stride and
    /// dilation and a single group.
    pub fn supports(param: &ConvParam) -> bool {
        param.kernel_h == 3
            && param.kernel_w == 3
            && param.stride_h == 1
            && param.stride_w == 1
            && param.dilation_h == 1
            && param.dilation_w == 1
            && param.group <= 1
    }

    pub fn new(desc: &OpDesc, config: &KernelConfig) -> Result<Self> {
        let param = *desc.param.as_conv()?;
        let size_ok = matches!(param.kernel_h, 0 | 3) && matches!(param.kernel_w, 0 | 3);
        let inferred = ConvParam {
            kernel_h: 3,
            kernel_w: 3,
            ..param
        };
        if !size_ok || !Self::supports(&inferred) {
            return Err(EmberError::param(format!(
                "conv '{}' needs a 3x3 filter with stride 1, dilation 1 and one group, got {}x{} stride {}x{} dilation {}x{} group {}",
                desc.name,
                param.kernel_h,
                param.kernel_w,
                param.stride_h,
                param.stride_w,
                param.dilation_h,
                param.dilation_w,
                param.group
            )));
        }
        Ok(Self {
            base: KernelBase::new(desc, config),
            param,
            setup: None,
            transformed_filter: Vec::new(),
            filter_version: None,
            input_i16: Vec::new(),
            staging: Vec::new(),
            scratch: Vec::new(),
            tile_h: 0,
            tile_w: 0,
        })
    }

    /// Number of 2×2 output tiles across the batch.
    pub fn tile_count(&self) -> usize {
        self.setup.as_ref().map_or(0, |s| s.geometry.batch) * self.tile_h * self.tile_w
    }

    pub fn transformed_filter(&self) -> &[i16] {
        &self.transformed_filter
    }

    /// Re-run the filter transform if the weight tensor changed since the last one.
    fn refresh_filter(&mut self, weight: &Tensor) -> Result<()> {
        if self.filter_version == Some(weight.version()) {
            return Ok(());
        }
        let setup = self
            .setup
            .as_ref()
            .ok_or_else(|| EmberError::param(format!("conv '{}' used before init", self.base.name)))?;
        let g = setup.geometry;
        if g.kernel_h != 3 || g.kernel_w != 3 {
            return Err(EmberError::param(format!(
                "conv '{}' weight is {}x{}, expected 3x3",
                self.base.name, g.kernel_h, g.kernel_w
            )));
        }
        self.transformed_filter = winograd::transform_filter(weight.as_i8()?, &setup.weight_zps, g.out_c, g.in_c);
        self.filter_version = Some(weight.version());
        tracing::debug!(kernel = %self.base.name, version = weight.version(), "filter transformed");
        Ok(())
    }
}

impl Kernel for Conv3x3Int8Kernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }

    fn init(&mut self, tensors: &mut [Tensor]) -> Result<()> {
        self.filter_version = None;
        self.resize(tensors)
    }

    fn resize(&mut self, tensors: &mut [Tensor]) -> Result<()> {
        let setup = prepare_quant_conv(&self.base, &self.param, tensors)?;
        let g = setup.geometry;
        self.setup = Some(setup);
        self.refresh_filter(&tensors[self.base.inputs[1]])?;

        self.tile_h = g.out_h.div_ceil(OUTPUT_UNIT);
        self.tile_w = g.out_w.div_ceil(OUTPUT_UNIT);
        let tile_count = self.tile_count();
        self.input_i16 = vec![0; g.batch * g.in_h * g.in_w * g.in_c];
        self.staging = vec![0; tile_count * TILE_PIXELS * g.out_c];
        self.scratch = vec![TaskScratch::new(g.in_c, g.out_c); self.base.thread_num];
        tracing::debug!(
            kernel = %self.base.name,
            out_h = g.out_h,
            out_w = g.out_w,
            tiles = tile_count,
            threads = self.base.thread_num,
            "conv3x3 int8 resized"
        );
        Ok(())
    }

    fn run(&mut self, inputs: &[&Tensor], outputs: &mut [Tensor], ctx: &mut RunContext<'_>) -> Result<()> {
        self.refresh_filter(inputs[1])?;
        let setup = self
            .setup
            .as_ref()
            .ok_or_else(|| EmberError::param(format!("conv '{}' run before init", self.base.name)))?;
        let g = setup.geometry;
        if inputs[0].shape() != &g.input_shape() {
            return Err(EmberError::param(format!(
                "conv '{}' input is {} but was prepared for {}; call resize",
                self.base.name,
                inputs[0].shape(),
                g.input_shape()
            )));
        }

        for (dst, &x) in self.input_i16.iter_mut().zip(inputs[0].as_i8()?) {
            *dst = (i32::from(x) - setup.input_zp) as i16;
        }

        let tile_count = self.tile_count();
        if tile_count == 0 || g.out_c == 0 {
            return Ok(());
        }
        let thread_num = self.base.thread_num;
        let chunk = tiles_per_task(thread_num, tile_count) * TILE_PIXELS * g.out_c;
        let job = TileJob {
            geometry: &g,
            setup,
            input: &self.input_i16,
            filter: &self.transformed_filter,
            tile_h: self.tile_h,
            tile_w: self.tile_w,
        };
        let run_task = |(task_id, (dst, scratch)): (usize, (&mut [i8], &mut TaskScratch))| {
            job.run_impl(task_id, task_tile_range(task_id, thread_num, tile_count), dst, scratch)
        };

        let staging = &mut self.staging;
        let scratch = &mut self.scratch;
        let results: Vec<Result<()>> = match ctx.pool {
            Some(pool) => pool.install(|| {
                staging
                    .par_chunks_mut(chunk)
                    .zip(scratch.par_iter_mut())
                    .enumerate()
                    .map(run_task)
                    .collect()
            }),
            None => staging
                .chunks_mut(chunk)
                .zip(scratch.iter_mut())
                .enumerate()
                .map(run_task)
                .collect(),
        };
        results.into_iter().collect::<Result<()>>()?;

        scatter_tiles(&g, self.tile_h, self.tile_w, &self.staging, outputs[0].as_i8_mut()?);
        Ok(())
    }
}

/// Read-only state shared by every task of one `run`.
struct TileJob<'a> {
    geometry: &'a ConvGeometry,
    setup: &'a QuantConvSetup,
    input: &'a [i16],
    filter: &'a [i16],
    tile_h: usize,
    tile_w: usize,
}

impl TileJob<'_> {
    /// Compute tiles `range` into `dst`, which starts at tile `range.start`.
    fn run_impl(
        &self,
        task_id: usize,
        range: std::ops::Range<usize>,
        dst: &mut [i8],
        scratch: &mut TaskScratch,
    ) -> Result<()> {
        let g = self.geometry;
        let (in_c, out_c) = (g.in_c, g.out_c);
        if dst.len() < range.len() * TILE_PIXELS * out_c {
            return Err(EmberError::worker(
                task_id,
                format!("staging slice holds {} values, tiles {:?} need more", dst.len(), range),
            ));
        }
        let tiles_per_image = self.tile_h * self.tile_w;

        for (local, tile) in range.enumerate() {
            let b = tile / tiles_per_image;
            let th = (tile % tiles_per_image) / self.tile_w;
            let tw = tile % self.tile_w;
            if b >= g.batch {
                return Err(EmberError::worker(task_id, format!("tile {tile} is out of bounds")));
            }

            self.gather(b, th, tw, &mut scratch.tile_buffer);

            let mut d = [0i16; TILE_ELEMS];
            for ic in 0..in_c {
                for (k, v) in d.iter_mut().enumerate() {
                    *v = scratch.tile_buffer[k * in_c + ic];
                }
                let v = winograd::input_transform(&d);
                for (k, &val) in v.iter().enumerate() {
                    scratch.block_unit[k * in_c + ic] = val;
                }
            }

            winograd::tile_multiply(&scratch.block_unit, self.filter, &mut scratch.tmp_dst, in_c, out_c)
                .ok_or_else(|| EmberError::worker(task_id, format!("accumulator overflow in tile {tile}")))?;

            let out = &mut dst[local * TILE_PIXELS * out_c..(local + 1) * TILE_PIXELS * out_c];
            let mut m = [0i32; TILE_ELEMS];
            for oc in 0..out_c {
                for (k, v) in m.iter_mut().enumerate() {
                    *v = scratch.tmp_dst[k * out_c + oc];
                }
                let y = winograd::output_transform(&m)
                    .ok_or_else(|| EmberError::worker(task_id, format!("inverse transform overflow in tile {tile}")))?;
                for (p, &val) in y.iter().enumerate() {
                    let acc = val
                        .checked_add(self.setup.bias[oc])
                        .ok_or_else(|| EmberError::worker(task_id, format!("bias overflow in tile {tile}")))?;
                    out[p * out_c + oc] = self.setup.requant.apply(acc, oc);
                }
            }
        }
        Ok(())
    }

    /// Copy the 4×4 window of tile (`th`, `tw`) of image `b` into `buf` as `[16][C_in]`.
    fn gather(&self, b: usize, th: usize, tw: usize, buf: &mut [i16]) {
        let g = self.geometry;
        let in_c = g.in_c;
        let row0 = (th * OUTPUT_UNIT) as isize - g.pad_top as isize;
        let col0 = (tw * OUTPUT_UNIT) as isize - g.pad_left as isize;
        for r in 0..INPUT_UNIT {
            let ih = row0 + r as isize;
            for c in 0..INPUT_UNIT {
                let iw = col0 + c as isize;
                let slot = &mut buf[(r * INPUT_UNIT + c) * in_c..(r * INPUT_UNIT + c + 1) * in_c];
                if ih < 0 || iw < 0 || ih as usize >= g.in_h || iw as usize >= g.in_w {
                    slot.fill(0);
                } else {
                    let base = ((b * g.in_h + ih as usize) * g.in_w + iw as usize) * in_c;
                    slot.copy_from_slice(&self.input[base..base + in_c]);
                }
            }
        }
    }
}

/// Move staged tiles into the NHWC output, dropping the pixels a partial edge
/// tile computes past `out_h` / `out_w`.
fn scatter_tiles(g: &ConvGeometry, tile_h: usize, tile_w: usize, staging: &[i8], out: &mut [i8]) {
    let out_c = g.out_c;
    for b in 0..g.batch {
        for th in 0..tile_h {
            for tw in 0..tile_w {
                let tile = (b * tile_h + th) * tile_w + tw;
                for dy in 0..OUTPUT_UNIT {
                    let oh = th * OUTPUT_UNIT + dy;
                    if oh >= g.out_h {
                        continue;
                    }
                    for dx in 0..OUTPUT_UNIT {
                        let ow = tw * OUTPUT_UNIT + dx;
                        if ow >= g.out_w {
                            continue;
                        }
                        let src = (tile * TILE_PIXELS + dy * OUTPUT_UNIT + dx) * out_c;
                        let dst = ((b * g.out_h + oh) * g.out_w + ow) * out_c;
                        out[dst..dst + out_c].copy_from_slice(&staging[src..src + out_c]);
                    }
                }
            }
        }
    }
}
