//! Dense matrix of f64, sized for standardised feature tables and the small
//! square systems of LDA and the smoothing spline.

use super::norm;
use rayon::prelude::*;
use std::ops::{AddAssign, Index, IndexMut};

/// Row-major storage: one row per entity, one column per feature
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    data: Vec<f64>,
    pub rows: usize,
    pub cols: usize,
}

impl Matrix {
    /// # Panics
    ///
    /// * Panics if `data` does not have len == rows * cols
    pub fn new<T: Into<Vec<f64>>>(t: T, rows: usize, cols: usize) -> Matrix {
        let data = t.into();
        assert_eq!(
            data.len(),
            rows * cols,
            "matrix data does not have shape ({}, {})",
            rows,
            cols
        );
        Matrix { data, rows, cols }
    }

    pub fn zeros(rows: usize, cols: usize) -> Matrix {
        Matrix::new(vec![0.0; rows * cols], rows, cols)
    }

    pub fn identity(size: usize) -> Matrix {
        let mut matrix = Matrix::zeros(size, size);
        matrix.add_diagonal(1.0);
        matrix
    }

    pub fn col_vector(data: Vec<f64>) -> Matrix {
        let rows = data.len();
        Matrix::new(data, rows, 1)
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Every entry, row by row
    pub fn values(&self) -> &[f64] {
        &self.data
    }

    /// Build a new matrix from a subset of rows, in the order given
    pub fn select_rows(&self, rows: &[usize]) -> Matrix {
        let data = rows
            .iter()
            .flat_map(|&row| self.row(row).iter().copied())
            .collect::<Vec<_>>();
        Matrix::new(data, rows.len(), self.cols)
    }

    pub fn trace(&self) -> f64 {
        (0..self.rows.min(self.cols)).map(|i| self[(i, i)]).sum()
    }

    pub fn add_diagonal(&mut self, value: f64) {
        for i in 0..self.rows.min(self.cols) {
            self[(i, i)] += value;
        }
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|x| *x *= factor);
    }

    /// Unit eigenvector of the dominant eigenvalue, by power iteration from
    /// `initial`
    pub fn power_method(&self, initial: &[f64]) -> Vec<f64> {
        let n = norm(initial);
        let mut v = initial.iter().map(|i| i / n).collect::<Vec<_>>();

        let mut last_eig = 0.0;
        for _ in 0..100 {
            let mut v1 = self.dotv(&v);
            let norm = norm(&v1);
            if norm == 0.0 || !norm.is_finite() {
                break;
            }
            v1.iter_mut().for_each(|x| *x /= norm);
            v = v1;
            if (norm - last_eig).abs() < 1E-10 {
                break;
            }
            last_eig = norm;
        }
        v
    }

    pub fn transpose(&self) -> Matrix {
        let mut mat = Matrix::zeros(self.cols, self.rows);
        for row in 0..self.rows {
            for col in 0..self.cols {
                mat[(col, row)] = self[(row, col)]
            }
        }
        mat
    }

    /// Matrix-vector product. Every output element is accumulated
    /// sequentially, so results do not depend on the thread count.
    pub fn dotv(&self, rhs: &[f64]) -> Vec<f64> {
        assert_eq!(
            self.cols,
            rhs.len(),
            "lhs has shape ({},{}), rhs has length {}",
            self.rows,
            self.cols,
            rhs.len()
        );
        (0..self.rows)
            .into_par_iter()
            .map(|row| dot(self.row(row), rhs))
            .collect()
    }

    pub fn dot(&self, rhs: &Matrix) -> Matrix {
        assert_eq!(
            self.cols, rhs.rows,
            "lhs has shape ({},{}), rhs has shape ({},{})",
            self.rows, self.cols, rhs.rows, rhs.cols
        );
        let columns = rhs.transpose();
        let columns = &columns;
        let data = (0..self.rows)
            .into_par_iter()
            .flat_map_iter(|row| {
                let lhs = self.row(row);
                (0..columns.rows).map(move |col| dot(lhs, columns.row(col)))
            })
            .collect::<Vec<_>>();
        Matrix::new(data, self.rows, rhs.cols)
    }

    /// Mean of every column
    pub fn mean(&self) -> Vec<f64> {
        let mut sum = vec![0.0; self.cols];
        for row in 0..self.rows {
            sum.iter_mut().zip(self.row(row)).for_each(|(s, x)| *s += x);
        }
        sum.into_iter().map(|s| s / self.rows as f64).collect()
    }

    /// Scatter matrix of the rows about `center`: sum of (x - c)(x - c)^T
    pub fn scatter(&self, center: &[f64]) -> Matrix {
        assert_eq!(center.len(), self.cols);
        let mut out = Matrix::zeros(self.cols, self.cols);
        for row in 0..self.rows {
            let x = self.row(row);
            for i in 0..self.cols {
                let di = x[i] - center[i];
                for j in i..self.cols {
                    out[(i, j)] += di * (x[j] - center[j]);
                }
            }
        }
        for i in 0..self.cols {
            for j in 0..i {
                out[(i, j)] = out[(j, i)];
            }
        }
        out
    }

    pub fn take(self) -> Vec<f64> {
        self.data
    }
}

fn dot(lhs: &[f64], rhs: &[f64]) -> f64 {
    lhs.iter().zip(rhs).fold(0.0, |acc, (x, y)| acc + x * y)
}

impl Index<(usize, usize)> for Matrix {
    type Output = f64;

    fn index(&self, (row, col): (usize, usize)) -> &Self::Output {
        &self.data[self.cols * row + col]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut Self::Output {
        &mut self.data[self.cols * row + col]
    }
}

impl AddAssign<Matrix> for Matrix {
    fn add_assign(&mut self, rhs: Matrix) {
        assert_eq!(
            (self.rows, self.cols),
            (rhs.rows, rhs.cols),
            "matrices must have equal shape to add"
        );
        self.data
            .iter_mut()
            .zip(rhs.data)
            .for_each(|(x, y)| *x += y);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ml::all_close;

    #[test]
    fn matrix_vector() {
        let a = Matrix::new([1., 2., 3., 4.], 2, 2);
        assert_eq!(a.dotv(&[0.5, 0.5]), vec![1.5, 3.5]);
        assert!(all_close(
            &a.power_method(&[0.54, 0.34]),
            &[0.4159736, 0.90937671],
            1E-5
        ));
    }

    #[test]
    fn products() {
        let a = Matrix::new(vec![1., 2., 3., 4., 5., 6.], 3, 2);
        let t = a.transpose();
        assert_eq!((t.rows, t.cols), (2, 3));
        assert_eq!(t.row(1), &[2., 4., 6.]);

        // a^T a
        let gram = t.dot(&a);
        assert_eq!(gram.take(), vec![35., 44., 44., 56.]);
        assert_eq!(Matrix::identity(2).dot(&t), t);
    }

    #[test]
    fn scatter_and_select() {
        let a = Matrix::new(vec![1., 2., 3., 4., 5., 6.], 3, 2);
        let s = a.select_rows(&[2, 0]);
        assert_eq!(s.take(), vec![5., 6., 1., 2.]);

        let mean = a.mean();
        assert_eq!(mean, vec![3., 4.]);
        let mut scatter = a.scatter(&mean);
        assert_eq!(scatter.trace(), 16.0);
        scatter += Matrix::identity(2);
        assert_eq!(scatter.take(), vec![9., 8., 8., 9.]);
    }
}
