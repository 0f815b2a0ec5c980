use crate::common_io::{read_lines_of_words_delim, write_lines, Delimiter};
use crate::traits::*;
pub use nalgebra::DMatrix;
use num_traits::Float;

use std::fmt::{Debug, Display};
use std::str::FromStr;

/// Tokens treated as a missing value
const MISSING_TOKENS: [&str; 6] = ["", "NA", "NaN", "nan", "na", "."];

fn parse_entry<T>(word: &str) -> anyhow::Result<T>
where
    T: Float + FromStr,
    <T as FromStr>::Err: Debug,
{
    if MISSING_TOKENS.contains(&word) {
        return Ok(T::nan());
    }
    word.parse::<T>()
        .map_err(|e| anyhow::anyhow!("failed to parse `{}`: {:?}", word, e))
}

fn format_entry<T: Float + Display>(x: T) -> String {
    if x.is_finite() {
        format!("{}", x)
    } else {
        "NA".to_string()
    }
}

impl<T> IoOps for DMatrix<T>
where
    T: Float + FromStr + Display + nalgebra::Scalar + Send + Sync,
    <T as FromStr>::Err: Debug,
{
    type Mat = Self;

    fn read_data(
        file_path: &str,
        delim: impl Into<Delimiter>,
        row_name_index: usize,
    ) -> anyhow::Result<MatWithNames<Self::Mat>> {
        let out = read_lines_of_words_delim(file_path, delim, 0)?;

        if out.header.len() <= row_name_index {
            return Err(anyhow::anyhow!(
                "header of {} has no row name column {}",
                file_path,
                row_name_index
            ));
        }

        let cols: Vec<Box<str>> = out
            .header
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != row_name_index)
            .map(|(_, x)| x.clone())
            .collect();

        let ncols = cols.len();
        let mut rows = Vec::with_capacity(out.lines.len());
        let mut data = Vec::with_capacity(out.lines.len() * ncols);

        for (i, words) in out.lines.iter().enumerate() {
            if words.len() != ncols + 1 {
                return Err(anyhow::anyhow!(
                    "{}: line {} has {} fields, expected {}",
                    file_path,
                    i + 2,
                    words.len(),
                    ncols + 1
                ));
            }
            for (j, w) in words.iter().enumerate() {
                if j == row_name_index {
                    rows.push(w.clone());
                } else {
                    data.push(parse_entry::<T>(w)?);
                }
            }
        }

        let nrows = rows.len();
        Ok(MatWithNames {
            rows,
            cols,
            mat: DMatrix::<T>::from_row_iterator(nrows, ncols, data),
        })
    }

    fn write_data(
        &self,
        file_path: &str,
        delim: &str,
        rows: &[Box<str>],
        cols: &[Box<str>],
        row_header: &str,
    ) -> anyhow::Result<()> {
        if rows.len() != self.nrows() || cols.len() != self.ncols() {
            return Err(anyhow::anyhow!(
                "names ({} x {}) don't match the matrix ({} x {})",
                rows.len(),
                cols.len(),
                self.nrows(),
                self.ncols()
            ));
        }

        let mut lines = Vec::with_capacity(self.nrows() + 1);
        lines.push(
            std::iter::once(row_header)
                .chain(cols.iter().map(|c| c.as_ref()))
                .collect::<Vec<_>>()
                .join(delim),
        );

        // keep the row order; no parallel iterator here
        for (name, row) in rows.iter().zip(self.row_iter()) {
            let fields = std::iter::once(name.to_string())
                .chain(row.iter().map(|&x| format_entry(x)))
                .collect::<Vec<_>>();
            lines.push(fields.join(delim));
        }

        write_lines(&lines, file_path)
    }
}
