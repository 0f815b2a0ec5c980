use crate::common_io::Delimiter;

/// A matrix with row and column names
#[derive(Debug, Clone)]
pub struct MatWithNames<T> {
    pub rows: Vec<Box<str>>,
    pub cols: Vec<Box<str>>,
    pub mat: T,
}

/// Read and write named matrices from and to delimited text files.
///
/// Missing values are written as `NA` and read back as `NaN`.
pub trait IoOps {
    type Mat;

    /// Read a matrix whose first line is a header. The column at
    /// `row_name_index` holds the row names and the remaining header
    /// fields name the columns.
    fn read_data(
        file_path: &str,
        delim: impl Into<Delimiter>,
        row_name_index: usize,
    ) -> anyhow::Result<MatWithNames<Self::Mat>>;

    /// Read a tab- or comma-separated matrix with row names in the first column
    fn read_named_table(file_path: &str) -> anyhow::Result<MatWithNames<Self::Mat>> {
        Self::read_data(file_path, &['\t', ','], 0)
    }

    /// Write the matrix together with its row and column names.
    /// * `row_header` - the header field above the row names
    fn write_data(
        &self,
        file_path: &str,
        delim: &str,
        rows: &[Box<str>],
        cols: &[Box<str>],
        row_header: &str,
    ) -> anyhow::Result<()>;

    fn to_tsv_with_names(
        &self,
        file_path: &str,
        rows: &[Box<str>],
        cols: &[Box<str>],
        row_header: &str,
    ) -> anyhow::Result<()> {
        self.write_data(file_path, "\t", rows, cols, row_header)
    }
}

/// Column-wise bookkeeping of missing (non-finite) entries
pub trait MissingOps {
    /// whether column `j` has at least one missing entry
    fn column_has_missing(&self, j: usize) -> bool;

    /// row indexes of the observed (finite) entries of column `j`
    fn observed_rows(&self, j: usize) -> Vec<usize>;

    /// number of missing entries in the whole matrix
    fn num_missing(&self) -> usize;
}
