// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Dense vector/matrix arithmetic for the discrete-time controller.
//!
//! Only the handful of operations the control law needs are provided, as
//! named combinators. Shape mismatches are checked results rather than
//! process aborts; the wiring code validates dimensions at load time so a
//! mismatch surfacing here indicates a logic bug upstream.

use std::fmt;
use std::path::Path;

use anyhow::bail;
use anyhow::Result;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Vector {
    data: Vec<f64>,
}

impl Vector {
    pub fn zeros(n: usize) -> Self {
        Self { data: vec![0.0; n] }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn iter(&self) -> std::slice::Iter<'_, f64> {
        self.data.iter()
    }

    /// Load a vector from a file of whitespace-separated reals.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => {
                bail!("Failed to open or read file {:?}", path);
            }
        };
        let mut data = vec![];
        for tok in text.split_whitespace() {
            match tok.parse::<f64>() {
                Ok(v) => data.push(v),
                Err(_) => {
                    bail!("Failed to parse {:?} in {:?}", tok, path);
                }
            }
        }
        Ok(Self { data })
    }

    fn check_len(&self, rhs: &Vector, op: &str) -> Result<()> {
        if self.len() != rhs.len() {
            bail!(
                "Vector length mismatch in {}: {} vs {}",
                op,
                self.len(),
                rhs.len()
            );
        }
        Ok(())
    }

    pub fn add(&self, rhs: &Vector) -> Result<Vector> {
        self.check_len(rhs, "add")?;
        Ok(self
            .iter()
            .zip(rhs.iter())
            .map(|(a, b)| a + b)
            .collect::<Vec<_>>()
            .into())
    }

    pub fn sub(&self, rhs: &Vector) -> Result<Vector> {
        self.check_len(rhs, "sub")?;
        Ok(self
            .iter()
            .zip(rhs.iter())
            .map(|(a, b)| a - b)
            .collect::<Vec<_>>()
            .into())
    }

    /// Elementwise product.
    pub fn mul_elem(&self, rhs: &Vector) -> Result<Vector> {
        self.check_len(rhs, "mul_elem")?;
        Ok(self
            .iter()
            .zip(rhs.iter())
            .map(|(a, b)| a * b)
            .collect::<Vec<_>>()
            .into())
    }

    pub fn scale(&self, k: f64) -> Vector {
        self.iter().map(|a| a * k).collect::<Vec<_>>().into()
    }
}

impl From<Vec<f64>> for Vector {
    fn from(data: Vec<f64>) -> Self {
        Self { data }
    }
}

impl std::ops::Index<usize> for Vector {
    type Output = f64;

    fn index(&self, idx: usize) -> &f64 {
        &self.data[idx]
    }
}

impl std::ops::IndexMut<usize> for Vector {
    fn index_mut(&mut self, idx: usize) -> &mut f64 {
        &mut self.data[idx]
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for v in self.iter() {
            write!(f, "{}{}", sep, v)?;
            sep = " ";
        }
        Ok(())
    }
}

/// Row-major dense matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Load a rows x cols matrix from a file of whitespace-separated
    /// row-major reals. The value count must match exactly.
    pub fn from_file(path: &Path, rows: usize, cols: usize) -> Result<Self> {
        let flat = Vector::from_file(path)?;
        if flat.len() != rows * cols {
            bail!(
                "{:?} holds {} values, expected {}x{}",
                path,
                flat.len(),
                rows,
                cols
            );
        }
        Ok(Self {
            rows,
            cols,
            data: flat.as_slice().to_vec(),
        })
    }

    /// Matrix-vector product.
    pub fn matvec(&self, v: &Vector) -> Result<Vector> {
        if self.cols != v.len() {
            bail!(
                "Matrix-vector shape mismatch: {}x{} vs {}",
                self.rows,
                self.cols,
                v.len()
            );
        }
        let mut out = Vector::zeros(self.rows);
        for r in 0..self.rows {
            out[r] = self
                .row(r)
                .iter()
                .zip(v.iter())
                .map(|(m, x)| m * x)
                .sum();
        }
        Ok(out)
    }
}
