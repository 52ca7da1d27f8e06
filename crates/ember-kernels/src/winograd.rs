//! Integer Winograd F(2×2, 3×3) transforms.
//!
//! Filter: `U = G' g G'^T` with `G' = 2G`, so every entry is an integer.
//! Input:  `V = B^T d B`.
//! Output: `Y = A^T (U ⊙ V) A / 4`; the division is exact.

/// Output tile edge.
pub const OUTPUT_UNIT: usize = 2;
/// Input tile edge (`OUTPUT_UNIT + 3 - 1`).
pub const INPUT_UNIT: usize = 4;
/// Elements in one transformed tile.
pub const TILE_ELEMS: usize = INPUT_UNIT * INPUT_UNIT;

const G2: [[i32; 3]; 4] = [[2, 0, 0], [1, 1, 1], [1, -1, 1], [0, 0, 2]];

/// Transform int8 weights `[C_out, 3, 3, C_in]` into `[16][C_out][C_in]` i16,
/// subtracting the per-channel (or per-tensor) weight zero point first.
pub fn transform_filter(weights: &[i8], zero_points: &[i32], out_c: usize, in_c: usize) -> Vec<i16> {
    let mut out = vec![0i16; TILE_ELEMS * out_c * in_c];
    for oc in 0..out_c {
        let zp = zero_points.get(oc).or_else(|| zero_points.first()).copied().unwrap_or(0);
        for ic in 0..in_c {
            let mut g = [[0i32; 3]; 3];
            for (kh, row) in g.iter_mut().enumerate() {
                for (kw, v) in row.iter_mut().enumerate() {
                    *v = i32::from(weights[((oc * 3 + kh) * 3 + kw) * in_c + ic]) - zp;
                }
            }
            // G' g
            let mut gg = [[0i32; 3]; 4];
            for i in 0..4 {
                for j in 0..3 {
                    gg[i][j] = (0..3).map(|k| G2[i][k] * g[k][j]).sum();
                }
            }
            // (G' g) G'^T
            for i in 0..4 {
                for j in 0..4 {
                    let u: i32 = (0..3).map(|k| gg[i][k] * G2[j][k]).sum();
                    // |u| <= 9 * 255
                    out[((i * 4 + j) * out_c + oc) * in_c + ic] = u as i16;
                }
            }
        }
    }
    out
}

/// `B^T d B` for one channel of a 4×4 input tile (row-major).
#[inline]
pub fn input_transform(d: &[i16; TILE_ELEMS]) -> [i16; TILE_ELEMS] {
    let mut t = [0i16; TILE_ELEMS];
    for c in 0..4 {
        let (d0, d1, d2, d3) = (d[c], d[4 + c], d[8 + c], d[12 + c]);
        t[c] = d0 - d2;
        t[4 + c] = d1 + d2;
        t[8 + c] = d2 - d1;
        t[12 + c] = d1 - d3;
    }
    let mut v = [0i16; TILE_ELEMS];
    for r in 0..4 {
        let (t0, t1, t2, t3) = (t[r * 4], t[r * 4 + 1], t[r * 4 + 2], t[r * 4 + 3]);
        v[r * 4] = t0 - t2;
        v[r * 4 + 1] = t1 + t2;
        v[r * 4 + 2] = t2 - t1;
        v[r * 4 + 3] = t1 - t3;
    }
    v
}

/// `A^T m A / 4` for one output channel. Returns `None` if a value leaves i32.
#[inline]
pub fn output_transform(m: &[i32; TILE_ELEMS]) -> Option<[i32; 4]> {
    let m = m.map(i64::from);
    let mut t = [0i64; 8];
    for c in 0..4 {
        t[c] = m[c] + m[4 + c] + m[8 + c];
        t[4 + c] = m[4 + c] - m[8 + c] - m[12 + c];
    }
    let mut y = [0i32; 4];
    for r in 0..2 {
        let (t0, t1, t2, t3) = (t[r * 4], t[r * 4 + 1], t[r * 4 + 2], t[r * 4 + 3]);
        let a = (t0 + t1 + t2) / 4;
        let b = (t1 - t2 - t3) / 4;
        y[r * 2] = i32::try_from(a).ok()?;
        y[r * 2 + 1] = i32::try_from(b).ok()?;
    }
    Some(y)
}

/// Element-wise multiply-accumulate across input channels.
///
/// `v` is `[16][C_in]`, `u` is `[16][C_out][C_in]`, `m` receives `[16][C_out]`.
/// Returns `None` on i32 overflow.
pub fn tile_multiply(v: &[i16], u: &[i16], m: &mut [i32], in_c: usize, out_c: usize) -> Option<()> {
    for k in 0..TILE_ELEMS {
        let v_k = &v[k * in_c..(k + 1) * in_c];
        for oc in 0..out_c {
            let u_k = &u[(k * out_c + oc) * in_c..(k * out_c + oc + 1) * in_c];
            let mut acc = 0i32;
            for (&a, &b) in v_k.iter().zip(u_k) {
                acc = acc.checked_add(i32::from(a) * i32::from(b))?;
            }
            m[k * out_c + oc] = acc;
        }
    }
    Some(())
}
