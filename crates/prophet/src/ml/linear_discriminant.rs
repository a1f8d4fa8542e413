//! Linear Discriminant Analysis
//!
//! Fisher's two-class discriminant, solved as the generalized eigenvalue
//! problem Sw.dot(x) = Sb with Gauss-Jordan elimination and the power method.

use super::gauss::Gauss;
use super::matrix::Matrix;

/// Relative ridge added to the within-class scatter, so that constant or
/// perfectly collinear features do not make the system singular
const RIDGE: f64 = 1E-6;

#[derive(Clone, Debug, PartialEq)]
pub struct LinearDiscriminantAnalysis {
    eigenvector: Vec<f64>,
}

impl LinearDiscriminantAnalysis {
    /// Fit a discriminant separating targets (`decoy[i] == false`) from
    /// decoys. Returns `None` if either class is empty, or the fit does not
    /// produce a finite coefficient vector.
    pub fn train(features: &Matrix, decoy: &[bool]) -> Option<LinearDiscriminantAnalysis> {
        assert_eq!(features.rows, decoy.len());

        let x_bar = features.mean();
        let mut scatter_within = Matrix::zeros(features.cols, features.cols);
        let mut scatter_between = Matrix::zeros(features.cols, features.cols);
        let mut class_means = Vec::with_capacity(2 * features.cols);

        for class in [true, false] {
            let rows = decoy
                .iter()
                .enumerate()
                .filter(|(_, &label)| label == class)
                .map(|(row, _)| row)
                .collect::<Vec<_>>();
            if rows.is_empty() {
                return None;
            }

            let class_data = features.select_rows(&rows);
            let class_mean = class_data.mean();
            scatter_within += class_data.scatter(&class_mean);

            let diff = Matrix::col_vector(
                class_mean
                    .iter()
                    .zip(x_bar.iter())
                    .map(|(x, y)| x - y)
                    .collect::<Vec<_>>(),
            );
            let mut between = diff.dot(&diff.transpose());
            between.scale(rows.len() as f64);
            scatter_between += between;
            class_means.extend(class_mean);
        }

        let ridge = RIDGE * (scatter_within.trace() / features.cols as f64).max(1.0);
        scatter_within.add_diagonal(ridge);

        // With two classes Sb has rank one, spanned by the difference of the
        // class means: start the power method there
        let initial = (0..features.cols)
            .map(|col| class_means[features.cols + col] - class_means[col])
            .collect::<Vec<_>>();
        if !initial.iter().any(|&x| x != 0.0) || !initial.iter().all(|x| x.is_finite()) {
            log::trace!("- class means are identical, LDA cannot separate classes");
            return None;
        }

        let mut evec =
            Gauss::solve(scatter_within, scatter_between).map(|mat| mat.power_method(&initial))?;

        // Power method can return the eigenvector with signs flipped - make it
        // so that target scores are higher than decoy scores
        let class_means = Matrix::new(class_means, 2, features.cols);
        let coef = class_means.dotv(&evec);
        if coef[1] < coef[0] {
            evec.iter_mut().for_each(|c| *c *= -1.0);
        }

        if !evec.iter().all(|f| f.is_finite()) || evec.iter().all(|&f| f == 0.0) {
            log::warn!("linear model eigenvector is degenerate: {:?}", evec);
            return None;
        }

        log::trace!("- linear model fit with eigenvector: {:?}", evec);
        Some(LinearDiscriminantAnalysis { eigenvector: evec })
    }

    pub fn from_coefficients(eigenvector: Vec<f64>) -> Self {
        LinearDiscriminantAnalysis { eigenvector }
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.eigenvector
    }

    pub fn score(&self, features: &Matrix) -> Vec<f64> {
        features.dotv(&self.eigenvector)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn linear_discriminant() {
        #[rustfmt::skip]
        let feats = Matrix::new(
            [
                5., 4., 3., 2.,
                4., 5., 4., 3.,
                6., 3., 4., 5.,
                1., 0., 2., 9.,
                5., 4., 4., 3.,
                2., 1., 1., 9.5,
                1., 0., 2., 8.,
                3., 2., -2., 10.,
            ],
            8,
            4,
        );
        let decoy = [false, false, false, true, false, true, true, true];

        let lda = LinearDiscriminantAnalysis::train(&feats, &decoy).unwrap();
        let scores = lda.score(&feats);

        let min_target = scores
            .iter()
            .zip(decoy)
            .filter(|(_, d)| !d)
            .map(|(s, _)| *s)
            .fold(f64::INFINITY, f64::min);
        let max_decoy = scores
            .iter()
            .zip(decoy)
            .filter(|(_, d)| *d)
            .map(|(s, _)| *s)
            .fold(f64::NEG_INFINITY, f64::max);
        assert!(min_target > max_decoy, "{:?}", scores);
    }

    #[test]
    fn single_class_is_rejected() {
        let feats = Matrix::new([1., 2., 3., 4.], 2, 2);
        assert!(LinearDiscriminantAnalysis::train(&feats, &[true, true]).is_none());
    }

    #[test]
    fn constant_feature_does_not_break_fit() {
        #[rustfmt::skip]
        let feats = Matrix::new(
            [
                1., 3.,
                1., 4.,
                1., 3.5,
                1., 0.,
                1., 0.5,
                1., 1.,
            ],
            6,
            2,
        );
        let decoy = [false, false, false, true, true, true];
        let lda = LinearDiscriminantAnalysis::train(&feats, &decoy).unwrap();
        assert!(lda.coefficients()[1] > 0.0);
    }
}
