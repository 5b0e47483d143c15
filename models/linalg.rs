//! Bridge between `ndarray` storage and `faer` factorizations.

use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),

    #[error("Linear system is not positive definite even after adding a ridge of {ridge:e}.")]
    NotPositiveDefinite { ridge: f64 },
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

/// Zero-copy view of an `ndarray` matrix when the layout allows it.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => {
                FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, rows, cols))
            }
            Some(slice) if array.t().is_standard_layout() => {
                FaerStorage::Borrowed(MatRef::from_column_major_slice(slice, rows, cols))
            }
            _ => FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)])),
        };
        Self { storage }
    }

    pub fn as_ref(&self) -> MatRef<'_, f64> {
        match &self.storage {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

pub struct CholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl CholeskyFactor {
    pub fn solve_vec<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix1>) -> Array1<f64> {
        let rhs_mat = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let sol = self.factor.solve(rhs_mat.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)])
    }

    pub fn solve_mat<S: Data<Elem = f64>>(&self, rhs: &ArrayBase<S, Ix2>) -> Array2<f64> {
        let view = FaerArrayView::new(rhs);
        let sol = self.factor.solve(view.as_ref());
        Array2::from_shape_fn((sol.nrows(), sol.ncols()), |(i, j)| sol[(i, j)])
    }
}

pub trait Cholesky {
    fn cholesky(&self) -> Result<CholeskyFactor, LinalgError>;
}

impl<S: Data<Elem = f64>> Cholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self) -> Result<CholeskyFactor, LinalgError> {
        let view = FaerArrayView::new(self);
        let factor = view
            .as_ref()
            .llt(Side::Lower)
            .map_err(LinalgError::Cholesky)?;
        Ok(CholeskyFactor { factor })
    }
}

/// Solves the symmetric system `a x = b`, adding a growing diagonal ridge when
/// `a` is numerically singular.
pub fn solve_symmetric(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, LinalgError> {
    if let Ok(factor) = a.cholesky() {
        return Ok(factor.solve_vec(b));
    }
    let scale = a
        .diag()
        .iter()
        .fold(0.0_f64, |acc, v| acc.max(v.abs()))
        .max(1.0);
    let mut ridge = scale * 1e-10;
    for _ in 0..8 {
        let mut jittered = a.clone();
        jittered.diag_mut().mapv_inplace(|d| d + ridge);
        if let Ok(factor) = jittered.cholesky() {
            log::debug!("Solved symmetric system with diagonal ridge {ridge:e}");
            return Ok(factor.solve_vec(b));
        }
        ridge *= 100.0;
    }
    Err(LinalgError::NotPositiveDefinite { ridge })
}
