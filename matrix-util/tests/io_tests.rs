use matrix_util::common_io::{create_temp_dir_file, read_lines_of_words};
use matrix_util::traits::{IoOps, MissingOps};
use nalgebra::DMatrix;

fn names(prefix: &str, n: usize) -> Vec<Box<str>> {
    (0..n)
        .map(|i| format!("{}{}", prefix, i).into_boxed_str())
        .collect()
}

#[test]
fn dmatrix_named_io_test() -> anyhow::Result<()> {
    let xx = DMatrix::<f64>::from_fn(20, 4, |i, j| ((i * 4 + j) as f64) / 80.0);
    let rows = names("region_", 20);
    let cols = names("sample_", 4);

    let tsv_file = create_temp_dir_file("tsv.gz")?;
    let tsv_file = tsv_file.to_str().unwrap();
    xx.to_tsv_with_names(tsv_file, &rows, &cols, "region")?;

    let yy = DMatrix::<f64>::read_named_table(tsv_file)?;

    assert_eq!(yy.rows, rows);
    assert_eq!(yy.cols, cols);
    approx::assert_abs_diff_eq!(xx, yy.mat, epsilon = 1e-12);
    Ok(())
}

#[test]
fn dmatrix_missing_values_test() -> anyhow::Result<()> {
    let mut xx = DMatrix::<f64>::from_element(3, 2, 0.5);
    xx[(1, 1)] = f64::NAN;

    let tsv_file = create_temp_dir_file("tsv")?;
    let tsv_file = tsv_file.to_str().unwrap();
    xx.to_tsv_with_names(tsv_file, &names("r", 3), &names("s", 2), "region")?;

    // written as `NA`
    let words = read_lines_of_words(tsv_file, 0)?;
    assert_eq!(words.lines[1][2].as_ref(), "NA");

    let yy = DMatrix::<f64>::read_named_table(tsv_file)?.mat;
    assert_eq!(yy.num_missing(), 1);
    assert!(yy[(1, 1)].is_nan());
    assert_eq!(yy.observed_rows(1), vec![0, 2]);
    Ok(())
}

#[test]
fn dmatrix_ragged_line_test() -> anyhow::Result<()> {
    let tsv_file = create_temp_dir_file("tsv")?;
    let tsv_file = tsv_file.to_str().unwrap();
    matrix_util::common_io::write_lines(&["region\ta\tb", "r0\t0.1\t0.2", "r1\t0.3"], tsv_file)?;

    assert!(DMatrix::<f64>::read_named_table(tsv_file).is_err());
    Ok(())
}
