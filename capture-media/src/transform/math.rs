// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Row-vector 4×4 matrix math.
//!
//! Matrices are row-major and multiply row vectors from the left
//! (`v' = v * M`), so translation lives in the fourth row and `A * B` applies
//! `A` first. This matches the layout the host receives in the state callback.

use std::ops::Mul;

/// Byte size of a serialized matrix (16 little-endian `f32`).
pub const MATRIX_BLOB_SIZE: usize = 64;

/// Three-component vector.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec3 {
    /// X.
    pub x: f32,
    /// Y.
    pub y: f32,
    /// Z.
    pub z: f32,
}

impl Vec3 {
    /// Creates a vector.
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Rotation quaternion `(x, y, z, w)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quaternion {
    /// X.
    pub x: f32,
    /// Y.
    pub y: f32,
    /// Z.
    pub z: f32,
    /// W.
    pub w: f32,
}

impl Quaternion {
    /// The identity rotation.
    pub const IDENTITY: Quaternion = Quaternion::new(0.0, 0.0, 0.0, 1.0);

    /// Creates a quaternion.
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Row-major 4×4 `f32` matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Float4x4 {
    /// Rows of the matrix.
    pub m: [[f32; 4]; 4],
}

impl Default for Float4x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Float4x4 {
    /// The identity matrix.
    pub const IDENTITY: Float4x4 = Float4x4::from_rows([
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]);

    /// Builds a matrix from its rows.
    pub const fn from_rows(m: [[f32; 4]; 4]) -> Self {
        Self { m }
    }

    /// Translation by `v`.
    pub fn translation(v: Vec3) -> Self {
        let mut result = Self::IDENTITY;
        result.m[3][0] = v.x;
        result.m[3][1] = v.y;
        result.m[3][2] = v.z;
        result
    }

    /// Rotation described by `q`. `q` is expected to be normalized.
    pub fn from_quaternion(q: Quaternion) -> Self {
        let (xx, yy, zz) = (q.x * q.x, q.y * q.y, q.z * q.z);
        let (xy, wz, xz) = (q.x * q.y, q.z * q.w, q.z * q.x);
        let (wy, yz, wx) = (q.y * q.w, q.y * q.z, q.x * q.w);

        Self::from_rows([
            [
                1.0 - 2.0 * (yy + zz),
                2.0 * (xy + wz),
                2.0 * (xz - wy),
                0.0,
            ],
            [
                2.0 * (xy - wz),
                1.0 - 2.0 * (zz + xx),
                2.0 * (yz + wx),
                0.0,
            ],
            [
                2.0 * (xz + wy),
                2.0 * (yz - wx),
                1.0 - 2.0 * (yy + xx),
                0.0,
            ],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Returns the inverse, or `None` if the matrix is singular.
    pub fn invert(&self) -> Option<Self> {
        let [
            [a, b, c, d],
            [e, f, g, h],
            [i, j, k, l],
            [m, n, o, p],
        ] = self.m;

        let kp_lo = k * p - l * o;
        let jp_ln = j * p - l * n;
        let jo_kn = j * o - k * n;
        let ip_lm = i * p - l * m;
        let io_km = i * o - k * m;
        let in_jm = i * n - j * m;

        let a11 = f * kp_lo - g * jp_ln + h * jo_kn;
        let a12 = -(e * kp_lo - g * ip_lm + h * io_km);
        let a13 = e * jp_ln - f * ip_lm + h * in_jm;
        let a14 = -(e * jo_kn - f * io_km + g * in_jm);

        let det = a * a11 + b * a12 + c * a13 + d * a14;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let inv_det = 1.0 / det;

        let gp_ho = g * p - h * o;
        let fp_hn = f * p - h * n;
        let fo_gn = f * o - g * n;
        let ep_hm = e * p - h * m;
        let eo_gm = e * o - g * m;
        let en_fm = e * n - f * m;

        let gl_hk = g * l - h * k;
        let fl_hj = f * l - h * j;
        let fk_gj = f * k - g * j;
        let el_hi = e * l - h * i;
        let ek_gi = e * k - g * i;
        let ej_fi = e * j - f * i;

        Some(Self::from_rows([
            [
                a11 * inv_det,
                -(b * kp_lo - c * jp_ln + d * jo_kn) * inv_det,
                (b * gp_ho - c * fp_hn + d * fo_gn) * inv_det,
                -(b * gl_hk - c * fl_hj + d * fk_gj) * inv_det,
            ],
            [
                a12 * inv_det,
                (a * kp_lo - c * ip_lm + d * io_km) * inv_det,
                -(a * gp_ho - c * ep_hm + d * eo_gm) * inv_det,
                (a * gl_hk - c * el_hi + d * ek_gi) * inv_det,
            ],
            [
                a13 * inv_det,
                -(a * jp_ln - b * ip_lm + d * in_jm) * inv_det,
                (a * fp_hn - b * ep_hm + d * en_fm) * inv_det,
                -(a * fl_hj - b * el_hi + d * ej_fi) * inv_det,
            ],
            [
                a14 * inv_det,
                (a * jo_kn - b * io_km + c * in_jm) * inv_det,
                -(a * fo_gn - b * eo_gm + c * en_fm) * inv_det,
                (a * fk_gj - b * ek_gi + c * ej_fi) * inv_det,
            ],
        ]))
    }

    /// Parses a 64-byte little-endian row-major blob.
    ///
    /// Returns `None` if `bytes` is not exactly [`MATRIX_BLOB_SIZE`] long.
    pub fn from_blob(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != MATRIX_BLOB_SIZE {
            return None;
        }
        let mut result = Self::IDENTITY;
        for (index, chunk) in bytes.chunks_exact(4).enumerate() {
            result.m[index / 4][index % 4] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(result)
    }

    /// Serializes to a 64-byte little-endian row-major blob.
    pub fn to_blob(&self) -> Vec<u8> {
        self.m
            .iter()
            .flatten()
            .flat_map(|value| value.to_le_bytes())
            .collect()
    }

    /// Returns true if every element is within `epsilon` of `other`.
    pub fn approx_eq(&self, other: &Self, epsilon: f32) -> bool {
        self.m
            .iter()
            .flatten()
            .zip(other.m.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= epsilon)
    }
}

impl Mul for Float4x4 {
    type Output = Float4x4;

    fn mul(self, rhs: Float4x4) -> Float4x4 {
        let mut result = [[0.0f32; 4]; 4];
        for (row, out) in result.iter_mut().enumerate() {
            for (col, value) in out.iter_mut().enumerate() {
                *value = (0..4).map(|k| self.m[row][k] * rhs.m[k][col]).sum();
            }
        }
        Float4x4::from_rows(result)
    }
}
