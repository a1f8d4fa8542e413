//! Gauss-Jordan elimination for solution of systems of linear equations
//!
//! Used to solve the LDA generalized eigenvalue problem (Sw.dot(x) = Sb), and
//! by the smoothing spline to apply inverse penalty and smoother matrices.

use super::matrix::Matrix;

/// Pivots smaller than this (relative to the largest absolute entry of the
/// left matrix) are treated as zero
const SINGULAR: f64 = 1E-12;

#[derive(Debug)]
pub struct Gauss {
    pub left: Matrix,
    pub right: Matrix,
    tolerance: f64,
}

impl Matrix {
    fn swap_rows(&mut self, i: usize, j: usize) {
        for k in 0..self.cols {
            let tmp = self[(i, k)];
            self[(i, k)] = self[(j, k)];
            self[(j, k)] = tmp;
        }
    }
}

impl Gauss {
    /// Solve `left.dot(x) = right` for `x`. Returns `None` if `left` is
    /// singular or the system produces non-finite values
    pub fn solve(left: Matrix, right: Matrix) -> Option<Matrix> {
        assert_eq!(left.rows, left.cols, "left matrix must be square");
        assert_eq!(left.rows, right.rows, "left and right must have equal rows");

        let scale = left
            .values()
            .iter()
            .fold(0.0f64, |acc, x| acc.max(x.abs()));
        if scale == 0.0 || !scale.is_finite() {
            return None;
        }

        let mut g = Gauss {
            left,
            right,
            tolerance: scale * SINGULAR,
        };
        if !g.echelon() {
            return None;
        }
        g.backfill();

        let finite = g.right.values().iter().all(|x| x.is_finite());
        finite.then_some(g.right)
    }

    /// Inverse of a square matrix
    pub fn invert(matrix: Matrix) -> Option<Matrix> {
        let n = matrix.rows;
        Gauss::solve(matrix, Matrix::identity(n))
    }

    // Forward elimination with partial pivoting on the largest absolute value.
    // Each pivot row is normalized so that the diagonal is all ones.
    fn echelon(&mut self) -> bool {
        let n = self.left.rows;
        for k in 0..n {
            let mut pivot = k;
            for i in k + 1..n {
                if self.left[(i, k)].abs() > self.left[(pivot, k)].abs() {
                    pivot = i;
                }
            }
            if self.left[(pivot, k)].abs() <= self.tolerance {
                return false;
            }
            if pivot != k {
                self.left.swap_rows(pivot, k);
                self.right.swap_rows(pivot, k);
            }

            let x = self.left[(k, k)];
            for j in k..n {
                self.left[(k, j)] /= x;
            }
            for j in 0..self.right.cols {
                self.right[(k, j)] /= x;
            }

            // Clear rows below pivot row
            for i in k + 1..n {
                let factor = self.left[(i, k)];
                if factor == 0.0 {
                    continue;
                }
                self.left[(i, k)] = 0.0;
                for j in k + 1..n {
                    self.left[(i, j)] -= self.left[(k, j)] * factor;
                }
                for j in 0..self.right.cols {
                    self.right[(i, j)] -= self.right[(k, j)] * factor;
                }
            }
        }
        true
    }

    // Solve the upper triangular matrix
    fn backfill(&mut self) {
        let n = self.left.rows;
        for i in (0..n).rev() {
            for k in 0..i {
                let factor = self.left[(k, i)];
                if factor == 0.0 {
                    continue;
                }
                self.left[(k, i)] = 0.0;
                for h in 0..self.right.cols {
                    self.right[(k, h)] -= self.right[(i, h)] * factor;
                }
            }
        }
    }
}
