use approx::assert_abs_diff_eq;
use lentil::common::*;
use lentil::em::EmStatus;
use lentil::simulate::*;
use lentil::*;
use matrix_util::common_io::create_temp_dir_file;
use matrix_util::traits::IoOps;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const NTYPES: usize = 3;
const NSAMPLES: usize = 20;

/// `per_type` regions specific to each cell type, 30 regions shared by
/// two types and optionally 10 all-0 and 10 all-1 rows
fn signature(per_type: usize, with_constant_rows: bool) -> SignatureMatrix {
    let mut rows: Vec<[f64; NTYPES]> = vec![];
    for k in 0..NTYPES {
        for _ in 0..per_type {
            let mut z = [0.0; NTYPES];
            z[k] = 1.0;
            rows.push(z);
        }
    }
    for _ in 0..10 {
        rows.push([1.0, 1.0, 0.0]);
        rows.push([1.0, 0.0, 1.0]);
        rows.push([0.0, 1.0, 1.0]);
    }
    if with_constant_rows {
        for _ in 0..10 {
            rows.push([0.0; NTYPES]);
            rows.push([1.0; NTYPES]);
        }
    }

    let regions = (0..rows.len())
        .map(|r| format!("chr1:{}-{}", r * 1000, r * 1000 + 500).into_boxed_str())
        .collect();
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    SignatureMatrix::new(
        regions,
        vec!["neutrophil".into(), "tcell".into(), "monocyte".into()],
        Mat::from_row_slice(rows.len(), NTYPES, &flat),
    )
    .unwrap()
}

/// First sample is purely the first cell type
fn true_proportions() -> Mat {
    let mut ret = Mat::from_fn(NSAMPLES, NTYPES, |j, k| match k {
        0 => (j % 5 + 1) as f64,
        1 => (j % 3 + 1) as f64,
        _ => (j % 4 + 1) as f64,
    });
    ret.row_mut(0).copy_from_slice(&[1.0, 0.0, 0.0]);
    ret.row_mut(1).copy_from_slice(&[0.0, 3.0, 7.0]);
    for mut row in ret.row_iter_mut() {
        let tot = row.sum();
        row /= tot;
    }
    ret
}

fn theta() -> StateParams {
    StateParams::new(0.1, 0.85, 0.002, 0.002, 5e-4).unwrap()
}

fn simulate(signature: &SignatureMatrix, seed: u64) -> SimOut {
    simulate_with_proportions(signature, &true_proportions(), &theta(), 0.0, seed).unwrap()
}

fn max_abs_diff(a: &Mat, b: &Mat) -> f64 {
    (a - b).amax()
}

fn check_simplex(pi: &Mat) {
    for row in pi.row_iter() {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-8);
        assert!(row.iter().all(|&x| x >= -1e-8 && x <= 1.0 + 1e-8));
    }
}

#[test]
fn recovers_known_proportions() -> anyhow::Result<()> {
    let signature = signature(60, false);
    let sim = simulate(&signature, 1);

    let out = estimate_cell_counts(&sim.obs, &signature, &EstimateConfig::default())?;

    check_simplex(&out.proportions);
    let err = max_abs_diff(&out.proportions, &sim.proportions);
    assert!(err < 0.05, "max error {}", err);
    assert!(out.proportions[(0, 0)] > 0.95);

    assert_eq!(out.sample_names(), sim.obs.sample_names());
    assert_eq!(out.cell_types(), signature.cell_types.as_slice());
    assert_eq!(out.metadata.source_tag.as_ref(), "Simulation");
    assert_eq!(out.metadata.init_method, InitMethod::Random);
    assert!(out
        .metadata
        .regions_used
        .iter()
        .all(|&r| r == signature.num_regions()));
    Ok(())
}

#[test]
fn samples_with_missing_values_are_fitted_alone() -> anyhow::Result<()> {
    let signature = signature(60, false);
    let sim = simulate(&signature, 2);

    let mut mat = sim.obs.methylation().clone();
    for r in (0..mat.nrows()).step_by(10) {
        mat[(r, 0)] = f64::NAN;
        mat[(r + 1, 5)] = f64::NAN;
    }
    let nblank = mat.nrows().div_ceil(10);
    let obs = MethylationMatrix::new(
        sim.obs.region_names().to_vec(),
        sim.obs.sample_names().to_vec(),
        mat,
    )?;

    let out = estimate_cell_counts(&obs, &signature, &EstimateConfig::default())?;
    check_simplex(&out.proportions);

    let diag = &out.metadata.diagnostics;
    assert_eq!(diag[0].regions_used, signature.num_regions() - nblank);
    assert_eq!(diag[5].regions_used, signature.num_regions() - nblank);
    assert_eq!(diag[1].regions_used, signature.num_regions());
    assert_ne!(diag[0].batch, diag[5].batch);
    assert_ne!(diag[0].batch, diag[1].batch);

    for j in [0, 5] {
        for k in 0..NTYPES {
            assert_abs_diff_eq!(
                out.proportions[(j, k)],
                sim.proportions[(j, k)],
                epsilon = 0.1
            );
        }
    }
    Ok(())
}

#[test]
fn single_sample_agrees_with_batch() -> anyhow::Result<()> {
    let signature = signature(60, false);
    let sim = simulate(&signature, 3);
    let config = EstimateConfig::default();

    let batch = estimate_cell_counts(&sim.obs, &signature, &config)?;

    let j = 7;
    let single = MethylationMatrix::new(
        sim.obs.region_names().to_vec(),
        vec![sim.obs.sample_names()[j].clone()],
        sim.obs.methylation().columns(j, 1).into_owned(),
    )?;
    let alone = estimate_cell_counts(&single, &signature, &config)?;

    assert_eq!(alone.proportions.nrows(), 1);
    for k in 0..NTYPES {
        assert_abs_diff_eq!(
            alone.proportions[(0, k)],
            batch.proportions[(j, k)],
            epsilon = 0.1
        );
    }
    Ok(())
}

#[test]
fn fewer_regions_than_cell_types_is_insufficient() -> anyhow::Result<()> {
    let signature = SignatureMatrix::new(
        vec!["r0".into(), "r1".into()],
        vec!["a".into(), "b".into(), "c".into()],
        Mat::from_row_slice(2, 3, &[1., 0., 0., 0., 1., 0.]),
    )?;
    let obs = MethylationMatrix::new(
        vec!["r0".into(), "r1".into()],
        vec!["s0".into()],
        Mat::from_column_slice(2, 1, &[0.8, 0.2]),
    )?;

    let err = estimate_cell_counts(&obs, &signature, &EstimateConfig::default()).unwrap_err();
    assert!(matches!(err, DeconvError::InsufficientSignal(_)));
    assert!(err.to_string().contains("region-inclusion"));
    Ok(())
}

#[test]
fn two_region_pairs_scenario() -> anyhow::Result<()> {
    let signature = SignatureMatrix::new(
        vec!["r0".into(), "r1".into(), "r2".into(), "r3".into()],
        vec!["a".into(), "b".into()],
        Mat::from_row_slice(4, 2, &[1., 0., 1., 0., 0., 1., 0., 1.]),
    )?;
    let obs = MethylationMatrix::new(
        signature.regions.clone(),
        vec!["s1".into(), "s2".into()],
        Mat::from_row_slice(4, 2, &[0.05, 0.5, 0.07, 0.48, 0.9, 0.52, 0.92, 0.5]),
    )?;

    let out = estimate_cell_counts(&obs, &signature, &EstimateConfig::default())?;
    check_simplex(&out.proportions);
    assert!(out.proportions[(0, 1)] > 0.9, "{}", out.proportions);
    assert_abs_diff_eq!(out.proportions[(1, 0)], 0.5, epsilon = 0.1);
    Ok(())
}

#[test]
fn fixed_start_is_reproducible() -> anyhow::Result<()> {
    let signature = signature(30, false);
    let sim = simulate(&signature, 4);
    let config = EstimateConfig {
        overrides: StateOverrides {
            a0: Some(0.15),
            a1: Some(0.8),
            sig0: Some(0.01),
            sig1: Some(0.01),
            tau: Some(0.01),
        },
        batch_size: 6,
        ..Default::default()
    };

    let a = estimate_cell_counts(&sim.obs, &signature, &config)?;
    let b = estimate_cell_counts(&sim.obs, &signature, &config)?;
    assert_eq!(a.proportions, b.proportions);

    let llik_a: Vec<f64> = a.metadata.diagnostics.iter().map(|d| d.log_likelihood).collect();
    let llik_b: Vec<f64> = b.metadata.diagnostics.iter().map(|d| d.log_likelihood).collect();
    assert_eq!(llik_a, llik_b);
    Ok(())
}

#[test]
fn known_regions_from_constant_signature_rows() -> anyhow::Result<()> {
    let signature = signature(60, true);
    let sim = simulate(&signature, 5);
    let config = EstimateConfig {
        init_method: InitMethod::KnownRegions,
        anchors: Some(AnchorRegions::from_signature(&signature)),
        ..Default::default()
    };

    let out = estimate_cell_counts(&sim.obs, &signature, &config)?;
    check_simplex(&out.proportions);
    let err = max_abs_diff(&out.proportions, &sim.proportions);
    assert!(err < 0.05, "max error {}", err);
    assert_eq!(out.metadata.init_method, InitMethod::KnownRegions);

    let config = EstimateConfig {
        init_method: InitMethod::KnownRegions,
        anchors: Some(AnchorRegions {
            unmethylated: vec!["elsewhere".into()],
            methylated: vec![],
        }),
        ..Default::default()
    };
    let err = estimate_cell_counts(&sim.obs, &signature, &config).unwrap_err();
    assert!(matches!(err, DeconvError::InsufficientSignal(_)));
    Ok(())
}

#[test]
fn small_batches_keep_sample_order() -> anyhow::Result<()> {
    let signature = signature(60, false);
    let sim = simulate(&signature, 6);

    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    let config = EstimateConfig {
        batch_size: 3,
        progress: Some(Arc::new(move |event: &ProgressEvent| {
            if let ProgressEvent::BatchFinished { samples, .. } = event {
                counter.fetch_add(*samples, Ordering::SeqCst);
            }
        })),
        ..Default::default()
    };

    let out = estimate_cell_counts(&sim.obs, &signature, &config)?;
    assert_eq!(finished.load(Ordering::SeqCst), NSAMPLES);

    let batches: Vec<usize> = out.metadata.diagnostics.iter().map(|d| d.batch).collect();
    let expected: Vec<usize> = (0..NSAMPLES).map(|j| j / 3).collect();
    assert_eq!(batches, expected);

    let names: Vec<&str> = out
        .metadata
        .diagnostics
        .iter()
        .map(|d| d.sample.as_ref())
        .collect();
    let input: Vec<&str> = sim.obs.sample_names().iter().map(|x| x.as_ref()).collect();
    assert_eq!(names, input);

    let err = max_abs_diff(&out.proportions, &sim.proportions);
    assert!(err < 0.1, "max error {}", err);
    Ok(())
}

#[test]
fn iteration_cap_is_reported_per_sample() -> anyhow::Result<()> {
    let signature = signature(30, false);
    let sim = simulate(&signature, 7);
    let config = EstimateConfig {
        epsilon: 0.0,
        max_iter: 2,
        ..Default::default()
    };
    let out = estimate_cell_counts(&sim.obs, &signature, &config)?;
    check_simplex(&out.proportions);
    assert_eq!(out.num_capped(), NSAMPLES);
    assert!(out
        .metadata
        .diagnostics
        .iter()
        .all(|d| d.status == EmStatus::IterationCapped && d.iterations == 2));
    Ok(())
}

#[test]
fn invalid_configuration_is_rejected_early() -> anyhow::Result<()> {
    let signature = signature(30, false);
    let sim = simulate(&signature, 8);

    let config = EstimateConfig {
        init_method: InitMethod::KnownRegions,
        ..Default::default()
    };
    assert!(matches!(
        estimate_cell_counts(&sim.obs, &signature, &config),
        Err(DeconvError::InvalidConfig(_))
    ));

    assert!("kmeans".parse::<InitMethod>().is_err());
    assert_eq!("known_regions".parse::<InitMethod>()?, InitMethod::KnownRegions);

    let renamed = MethylationMatrix::new(
        (0..signature.num_regions())
            .map(|r| format!("other{}", r).into_boxed_str())
            .collect(),
        sim.obs.sample_names().to_vec(),
        sim.obs.methylation().clone(),
    )?;
    assert!(matches!(
        estimate_cell_counts(&renamed, &signature, &EstimateConfig::default()),
        Err(DeconvError::InvalidConfig(_))
    ));
    Ok(())
}

#[test]
fn minimum_proportion_trims_small_entries() -> anyhow::Result<()> {
    let signature = signature(60, false);
    let sim = simulate(&signature, 9);
    let config = EstimateConfig {
        min_proportion: 0.05,
        ..Default::default()
    };
    let out = estimate_cell_counts(&sim.obs, &signature, &config)?;
    check_simplex(&out.proportions);
    assert!(out
        .proportions
        .iter()
        .all(|&x| x == 0.0 || x >= 0.05 - 1e-12));
    assert_eq!(out.proportions[(0, 1)], 0.0);
    assert_eq!(out.proportions[(0, 2)], 0.0);
    Ok(())
}

#[test]
fn file_round_trip() -> anyhow::Result<()> {
    let signature = signature(30, false);
    let sim = simulate(&signature, 10);

    let obs_file = create_temp_dir_file(".tsv.gz")?;
    let obs_file = obs_file.to_str().unwrap();
    let sig_file = create_temp_dir_file(".tsv")?;
    let sig_file = sig_file.to_str().unwrap();

    sim.obs.methylation().to_tsv_with_names(
        obs_file,
        sim.obs.region_names(),
        sim.obs.sample_names(),
        "region",
    )?;
    signature
        .mat
        .to_tsv_with_names(sig_file, &signature.regions, &signature.cell_types, "region")?;

    let obs = MethylationMatrix::from_file(obs_file)?;
    let signature_back = SignatureMatrix::from_file(sig_file)?;
    assert_eq!(obs.source_tag(), "MethylationTable");
    assert_eq!(signature_back.cell_types, signature.cell_types);

    let out = estimate_cell_counts(&obs, &signature_back, &EstimateConfig::default())?;

    let out_file = create_temp_dir_file(".proportions.tsv.gz")?;
    let out_file = out_file.to_str().unwrap();
    let meta_file = create_temp_dir_file(".metadata.json")?;
    let meta_file = meta_file.to_str().unwrap();
    out.to_tsv(out_file)?;
    out.write_metadata(meta_file)?;

    let back = Mat::read_named_table(out_file)?;
    assert_eq!(back.rows, out.sample_names());
    assert_eq!(back.cols, out.cell_types());
    assert_abs_diff_eq!(back.mat, out.proportions, epsilon = 1e-6);

    let meta: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(meta_file)?)?;
    assert_eq!(meta["n_samples"], NSAMPLES);
    assert_eq!(meta["init_method"], "random");
    assert_eq!(meta["cell_types"][1], "tcell");
    assert_eq!(
        meta["diagnostics"].as_array().map(|x| x.len()),
        Some(NSAMPLES)
    );
    Ok(())
}

#[test]
fn full_start_needs_no_anchors() -> anyhow::Result<()> {
    let signature = signature(60, false);
    let sim = simulate(&signature, 11);
    let config = EstimateConfig {
        init_method: InitMethod::KnownRegions,
        anchors: None,
        overrides: StateOverrides {
            a0: Some(0.1),
            a1: Some(0.85),
            sig0: Some(0.002),
            sig1: Some(0.002),
            tau: Some(5e-4),
        },
        ..Default::default()
    };

    let out = estimate_cell_counts(&sim.obs, &signature, &config)?;
    check_simplex(&out.proportions);
    let err = max_abs_diff(&out.proportions, &sim.proportions);
    assert!(err < 0.05, "max error {}", err);
    Ok(())
}

#[test]
fn collinear_signature_is_insufficient() -> anyhow::Result<()> {
    let regions: Vec<Box<str>> = vec!["r0".into(), "r1".into(), "r2".into()];
    let signature = SignatureMatrix::new(
        regions.clone(),
        vec!["a".into(), "b".into(), "c".into()],
        Mat::from_row_slice(3, 3, &[0., 0., 0., 1., 1., 1., 1., 0., 0.]),
    )?;
    let obs = MethylationMatrix::new(
        regions,
        vec!["s0".into()],
        Mat::from_column_slice(3, 1, &[0.1, 0.8, 0.5]),
    )?;

    let err = estimate_cell_counts(&obs, &signature, &EstimateConfig::default()).unwrap_err();
    assert!(matches!(err, DeconvError::InsufficientSignal(_)), "{:?}", err);
    Ok(())
}

#[test]
fn missing_regions_that_hide_a_cell_type_are_insufficient() -> anyhow::Result<()> {
    let signature = SignatureMatrix::new(
        vec!["r0".into(), "r1".into(), "r2".into(), "r3".into()],
        vec!["a".into(), "b".into()],
        Mat::from_row_slice(4, 2, &[1., 0., 1., 0., 0., 1., 0., 1.]),
    )?;
    // the first sample lost both regions of the second type
    let obs = MethylationMatrix::new(
        signature.regions.clone(),
        vec!["s1".into(), "s2".into()],
        Mat::from_row_slice(
            4,
            2,
            &[0.05, 0.5, 0.07, 0.48, f64::NAN, 0.52, f64::NAN, 0.5],
        ),
    )?;

    let err = estimate_cell_counts(&obs, &signature, &EstimateConfig::default()).unwrap_err();
    assert!(matches!(err, DeconvError::InsufficientSignal(_)), "{:?}", err);
    assert!(err.to_string().contains("s1"));
    Ok(())
}

#[test]
fn log_likelihood_increases_on_simulated_data() -> anyhow::Result<()> {
    use lentil::em::{ConvergenceMetric, EmConfig, EmEngine};
    use lentil::init::{initialize, InitSettings};

    let signature = signature(30, false);
    let sim = simulate(&signature, 12);
    let ys = sim.obs.methylation();

    let settings = InitSettings {
        method: InitMethod::Random,
        overrides: StateOverrides::default(),
        anchors: None,
        seed: 3,
    };
    let init = initialize(ys, &signature.mat, &signature.regions, &settings, 0)?;
    let config = EmConfig {
        epsilon: 0.0,
        max_iter: 60,
        metric: ConvergenceMetric::PercentLogLikelihood,
    };
    let fit = EmEngine::new(ys, &signature.mat)?.run(init, &config)?;

    assert_eq!(fit.llik_trace.len(), 61);
    for pair in fit.llik_trace.windows(2) {
        let slack = 1e-8 * pair[0].abs().max(1.0);
        assert!(pair[1] >= pair[0] - slack, "{} -> {}", pair[0], pair[1]);
    }
    assert!(fit.log_likelihood() > fit.llik_trace[0]);
    Ok(())
}

#[test]
fn parameter_change_metric_converges() -> anyhow::Result<()> {
    use lentil::em::ConvergenceMetric;

    let signature = signature(60, false);
    let sim = simulate(&signature, 13);
    let config = EstimateConfig {
        metric: ConvergenceMetric::MaxParameterChange,
        epsilon: 1e-4,
        max_iter: 2000,
        ..Default::default()
    };

    let out = estimate_cell_counts(&sim.obs, &signature, &config)?;
    assert_eq!(out.num_capped(), 0);
    assert!(out
        .metadata
        .diagnostics
        .iter()
        .all(|d| d.status == EmStatus::Converged));
    let err = max_abs_diff(&out.proportions, &sim.proportions);
    assert!(err < 0.05, "max error {}", err);
    Ok(())
}
