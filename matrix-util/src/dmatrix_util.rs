use crate::traits::MissingOps;
use nalgebra::DMatrix;
use num_traits::Float;

impl<T> MissingOps for DMatrix<T>
where
    T: Float + nalgebra::Scalar,
{
    fn column_has_missing(&self, j: usize) -> bool {
        self.column(j).iter().any(|x| !x.is_finite())
    }

    fn observed_rows(&self, j: usize) -> Vec<usize> {
        self.column(j)
            .iter()
            .enumerate()
            .filter_map(|(i, x)| if x.is_finite() { Some(i) } else { None })
            .collect()
    }

    fn num_missing(&self) -> usize {
        self.iter().filter(|x| !x.is_finite()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_rows_skip_nan() {
        let mat = DMatrix::from_row_slice(3, 2, &[0.1, f64::NAN, 0.2, 0.3, 0.4, f64::NAN]);

        assert!(!mat.column_has_missing(0));
        assert!(mat.column_has_missing(1));
        assert_eq!(mat.observed_rows(0), vec![0, 1, 2]);
        assert_eq!(mat.observed_rows(1), vec![1]);
        assert_eq!(mat.num_missing(), 2);
    }
}
