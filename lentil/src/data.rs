use crate::common::*;
use matrix_util::common_io::read_lines_of_words;
use matrix_util::traits::{IoOps, MatWithNames};
use std::collections::{HashMap, HashSet};

/// Anything that yields a region x sample methylation matrix with
/// identifiers. Missing entries are `NaN`.
pub trait MethylationSource {
    /// where the data came from (platform or container name)
    fn source_tag(&self) -> &str;
    fn region_names(&self) -> &[Box<str>];
    fn sample_names(&self) -> &[Box<str>];
    fn methylation(&self) -> &Mat;

    fn num_regions(&self) -> usize {
        self.methylation().nrows()
    }

    fn num_samples(&self) -> usize {
        self.methylation().ncols()
    }
}

/// Region x sample methylation levels in `[0, 1]`
#[derive(Debug, Clone)]
pub struct MethylationMatrix {
    tag: Box<str>,
    regions: Vec<Box<str>>,
    samples: Vec<Box<str>>,
    mat: Mat,
}

impl MethylationMatrix {
    pub fn new(regions: Vec<Box<str>>, samples: Vec<Box<str>>, mat: Mat) -> DeconvResult<Self> {
        if regions.len() != mat.nrows() || samples.len() != mat.ncols() {
            return Err(DeconvError::ShapeMismatch(format!(
                "{} regions and {} samples for a {} x {} matrix",
                regions.len(),
                samples.len(),
                mat.nrows(),
                mat.ncols()
            )));
        }
        Ok(Self {
            tag: "MethylationMatrix".into(),
            regions,
            samples,
            mat,
        })
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = tag.into();
        self
    }

    /// Read a table with regions in rows and samples in columns
    pub fn from_file(file_path: &str) -> anyhow::Result<Self> {
        let MatWithNames { rows, cols, mat } = Mat::read_named_table(file_path)?;
        Ok(Self::new(rows, cols, mat)?.with_tag("MethylationTable"))
    }
}

impl MethylationSource for MethylationMatrix {
    fn source_tag(&self) -> &str {
        &self.tag
    }
    fn region_names(&self) -> &[Box<str>] {
        &self.regions
    }
    fn sample_names(&self) -> &[Box<str>] {
        &self.samples
    }
    fn methylation(&self) -> &Mat {
        &self.mat
    }
}

/// Region x cell-type methylation signatures (read-only during a run)
#[derive(Debug, Clone)]
pub struct SignatureMatrix {
    pub regions: Vec<Box<str>>,
    pub cell_types: Vec<Box<str>>,
    pub mat: Mat,
}

impl SignatureMatrix {
    /// Entries must be observed and lie in `[0, 1]`; cell types unique
    pub fn new(regions: Vec<Box<str>>, cell_types: Vec<Box<str>>, mat: Mat) -> DeconvResult<Self> {
        if regions.len() != mat.nrows() || cell_types.len() != mat.ncols() {
            return Err(DeconvError::ShapeMismatch(format!(
                "{} regions and {} cell types for a {} x {} signature",
                regions.len(),
                cell_types.len(),
                mat.nrows(),
                mat.ncols()
            )));
        }
        if mat.ncols() == 0 {
            return Err(DeconvError::InvalidConfig("no cell types".into()));
        }
        if let Some(x) = mat.iter().find(|x| !(0.0..=1.0).contains(*x)) {
            return Err(DeconvError::InvalidConfig(format!(
                "signature entries must be observed values in [0, 1], found {}",
                x
            )));
        }
        let unique: HashSet<&str> = cell_types.iter().map(|x| x.as_ref()).collect();
        if unique.len() != cell_types.len() {
            return Err(DeconvError::InvalidConfig(
                "duplicate cell type labels".into(),
            ));
        }
        Ok(Self {
            regions,
            cell_types,
            mat,
        })
    }

    pub fn from_file(file_path: &str) -> anyhow::Result<Self> {
        let MatWithNames { rows, cols, mat } = Mat::read_named_table(file_path)?;
        Ok(Self::new(rows, cols, mat)?)
    }

    pub fn num_regions(&self) -> usize {
        self.mat.nrows()
    }

    pub fn num_cell_types(&self) -> usize {
        self.mat.ncols()
    }
}

/// Regions known, from independent reference data, to be reliably
/// unmethylated or methylated in every cell type
#[derive(Debug, Clone, Default)]
pub struct AnchorRegions {
    pub unmethylated: Vec<Box<str>>,
    pub methylated: Vec<Box<str>>,
}

impl AnchorRegions {
    /// Signature rows that are 0 (or 1) for every cell type
    pub fn from_signature(signature: &SignatureMatrix) -> Self {
        let mut ret = Self::default();
        for (name, row) in signature.regions.iter().zip(signature.mat.row_iter()) {
            if row.iter().all(|&x| x == 0.0) {
                ret.unmethylated.push(name.clone());
            } else if row.iter().all(|&x| x == 1.0) {
                ret.methylated.push(name.clone());
            }
        }
        ret
    }

    /// Two columns: region name and state (`unmethylated`/`0` or
    /// `methylated`/`1`). No header line.
    pub fn from_file(file_path: &str) -> anyhow::Result<Self> {
        let mut ret = Self::default();
        for (i, words) in read_lines_of_words(file_path, -1)?.lines.iter().enumerate() {
            if words.len() < 2 {
                return Err(anyhow::anyhow!("{}: line {} needs two fields", file_path, i + 1));
            }
            match words[1].to_lowercase().as_str() {
                "unmethylated" | "0" => ret.unmethylated.push(words[0].clone()),
                "methylated" | "1" => ret.methylated.push(words[0].clone()),
                other => {
                    return Err(anyhow::anyhow!(
                        "{}: unknown anchor state `{}` at line {}",
                        file_path,
                        other,
                        i + 1
                    ))
                }
            }
        }
        Ok(ret)
    }

    /// Positions of the unmethylated and methylated anchors among `regions`
    pub fn locate(&self, regions: &[Box<str>]) -> (Vec<usize>, Vec<usize>) {
        let unmeth: HashSet<&str> = self.unmethylated.iter().map(|x| x.as_ref()).collect();
        let meth: HashSet<&str> = self.methylated.iter().map(|x| x.as_ref()).collect();

        let mut ret = (vec![], vec![]);
        for (r, name) in regions.iter().enumerate() {
            if unmeth.contains(name.as_ref()) {
                ret.0.push(r);
            } else if meth.contains(name.as_ref()) {
                ret.1.push(r);
            }
        }
        ret
    }
}

/// Check the observation matrix before any estimation work
pub fn validate_observations<S>(source: &S) -> DeconvResult<()>
where
    S: MethylationSource + ?Sized,
{
    let mat = source.methylation();
    if mat.ncols() == 0 {
        return Err(DeconvError::InvalidConfig("no samples".into()));
    }
    if source.sample_names().len() != mat.ncols() || source.region_names().len() != mat.nrows() {
        return Err(DeconvError::ShapeMismatch(format!(
            "{} x {} names for a {} x {} observation matrix",
            source.region_names().len(),
            source.sample_names().len(),
            mat.nrows(),
            mat.ncols()
        )));
    }
    let unique: HashSet<&str> = source.sample_names().iter().map(|x| x.as_ref()).collect();
    if unique.len() != mat.ncols() {
        return Err(DeconvError::InvalidConfig("duplicate sample names".into()));
    }
    if let Some(x) = mat
        .iter()
        .find(|x| x.is_finite() && !(0.0..=1.0).contains(*x))
    {
        return Err(DeconvError::InvalidConfig(format!(
            "methylation levels must lie in [0, 1], found {}",
            x
        )));
    }
    if let Some(x) = mat.iter().find(|x| x.is_infinite()) {
        return Err(DeconvError::InvalidConfig(format!(
            "methylation level {} is not a valid value",
            x
        )));
    }
    Ok(())
}

/// Observation rows in the signature's region order.
///
/// Identical region lists pass through; otherwise rows are matched by
/// name and every signature region must be present.
pub fn align_regions<S>(source: &S, signature: &SignatureMatrix) -> DeconvResult<Mat>
where
    S: MethylationSource + ?Sized,
{
    let regions = source.region_names();
    if regions == signature.regions.as_slice() {
        return Ok(source.methylation().clone());
    }

    let position: HashMap<&str, usize> = regions
        .iter()
        .enumerate()
        .map(|(i, r)| (r.as_ref(), i))
        .collect();

    let mut rows = Vec::with_capacity(signature.num_regions());
    for name in signature.regions.iter() {
        match position.get(name.as_ref()) {
            Some(&i) => rows.push(i),
            None => {
                return Err(DeconvError::InvalidConfig(format!(
                    "signature region `{}` is absent from the observations",
                    name
                )))
            }
        }
    }

    debug!(
        "aligned {} of {} observed regions to the signature",
        rows.len(),
        regions.len()
    );
    Ok(source.methylation().select_rows(rows.iter()))
}
