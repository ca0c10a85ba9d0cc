use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use contexture::context::{make_context_matrix, ContextConfig};
use contexture::fit::{fit_skew_t_pdf_globally, fit_skew_t_pdfs, FitOptions, FitParameterTable};
use contexture::matrix::DataMatrix;
use contexture::signal::{
    combine_context_matrices, summarize_context_matrix, CombinationMethod, RowSelection,
    SelectContext, SignalOptions,
};

fn seeded_matrix(seed: u64, n_rows: usize, n_columns: usize) -> DataMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let row_names = (0..n_rows).map(|i| format!("gene_{}", i)).collect();
    let column_names = (0..n_columns).map(|j| format!("sample_{}", j)).collect();
    let values = (0..n_rows)
        .map(|_| {
            (0..n_columns)
                .map(|_| (0..12).map(|_| rng.gen::<f64>()).sum::<f64>() - 6.0)
                .collect()
        })
        .collect();
    DataMatrix::new(row_names, column_names, values).unwrap()
}

#[test]
fn matrix_tsv_round_trip_keeps_labels_and_values() {
    let mut matrix = seeded_matrix(10, 3, 5);
    matrix.values[1][2] = f64::NAN;
    let dir = tempdir().unwrap();
    let path = dir.path().join("matrix.tsv");
    matrix.write_tsv(&path).unwrap();

    let loaded = DataMatrix::read_tsv(&path).unwrap();
    assert_eq!(loaded.row_names, matrix.row_names);
    assert_eq!(loaded.column_names, matrix.column_names);
    assert!(loaded.values[1][2].is_nan());
    for (a, b) in matrix.values.iter().flatten().zip(loaded.values.iter().flatten()) {
        if a.is_finite() {
            // cells are written with six decimals
            assert!((a - b).abs() < 1e-6);
        }
    }
}

#[test]
fn fit_table_round_trip_and_reuse_in_context_build() {
    let matrix = seeded_matrix(11, 3, 40);
    let dir = tempdir().unwrap();
    let table = fit_skew_t_pdfs(&matrix, 2, &FitOptions::default(), Some(dir.path())).unwrap();

    let path = dir.path().join("skew_t_pdf_fit_parameter.tsv");
    let loaded = FitParameterTable::read_tsv(&path).unwrap();
    assert_eq!(loaded.row_names, table.row_names);
    for (a, b) in table.parameters.iter().zip(&loaded.parameters) {
        assert_eq!(a.n, b.n);
        assert!((a.location - b.location).abs() < 1e-6);
        assert!((a.scale - b.scale).abs() < 1e-6);
        assert!((a.shape - b.shape).abs() < 1e-6);
    }

    let config = ContextConfig::default();
    let build = make_context_matrix(&matrix, 2, Some(&table), &config, Some(dir.path())).unwrap();
    assert!(build.failures.is_empty());
    assert!(dir.path().join("context_matrix.tsv").exists());
    assert!(dir.path().join("context_summary.tsv").exists());
}

#[test]
fn index_name_flows_into_every_output_table() {
    let mut matrix = seeded_matrix(15, 2, 30);
    matrix.index_name = "Sample".to_string();
    let dir = tempdir().unwrap();

    let table = fit_skew_t_pdfs(&matrix, 1, &FitOptions::default(), Some(dir.path())).unwrap();
    assert_eq!(table.index_name, "Sample");
    let loaded =
        FitParameterTable::read_tsv(&dir.path().join("skew_t_pdf_fit_parameter.tsv")).unwrap();
    assert_eq!(loaded.index_name, "Sample");

    let config = ContextConfig::default();
    let build = make_context_matrix(&matrix, 1, None, &config, Some(dir.path())).unwrap();
    assert_eq!(build.summary.index_name, "Sample");
    let summary_header = std::fs::read_to_string(dir.path().join("context_summary.tsv"))
        .unwrap()
        .lines()
        .next()
        .unwrap()
        .to_string();
    assert!(summary_header.starts_with("Sample\t"));
}

#[test]
fn negative_selection_flips_sign_and_positive_zeroes_the_rest() {
    let matrix = DataMatrix::new(
        vec!["g1".to_string()],
        vec!["s1".to_string(), "s2".to_string(), "s3".to_string()],
        vec![vec![-0.8, 0.0, 0.6]],
    )
    .unwrap();
    let transposed = matrix.transpose();

    for (select, expected_row) in [
        (SelectContext::Negative, [true, false, false]),
        (SelectContext::Positive, [false, false, true]),
    ] {
        let options = SignalOptions {
            select_context: select,
            combination_method: CombinationMethod::Sum,
            feature_selection: RowSelection::All,
            sample_selection: RowSelection::All,
        };
        let signal = combine_context_matrices(&matrix, &transposed, &options).unwrap();
        for (j, &kept) in expected_row.iter().enumerate() {
            if kept {
                assert!(signal.values[0][j] > 0.0);
            } else {
                assert_eq!(signal.values[0][j], 0.0);
            }
        }
    }
}

#[test]
fn product_signal_stays_in_unit_interval() {
    let matrix = seeded_matrix(12, 4, 25);
    let config = ContextConfig::default();
    let feature_build = make_context_matrix(&matrix, 2, None, &config, None).unwrap();
    let sample_build = make_context_matrix(&matrix.transpose(), 2, None, &config, None).unwrap();

    let options = SignalOptions::default();
    let signal = combine_context_matrices(
        &feature_build.context_matrix,
        &sample_build.context_matrix,
        &options,
    )
    .unwrap();

    assert_eq!(signal.row_names, matrix.row_names);
    assert_eq!(signal.column_names, matrix.column_names);
    assert!(signal
        .values
        .iter()
        .flatten()
        .all(|&v| (0.0..=1.0).contains(&v)));
}

#[test]
fn top_n_selection_narrows_both_axes() {
    let matrix = seeded_matrix(13, 5, 20);
    let config = ContextConfig::default();
    let feature_build = make_context_matrix(&matrix, 1, None, &config, None).unwrap();
    let sample_build = make_context_matrix(&matrix.transpose(), 1, None, &config, None).unwrap();

    let options = SignalOptions {
        select_context: SelectContext::Both,
        combination_method: CombinationMethod::Product,
        feature_selection: RowSelection::TopN(3),
        sample_selection: RowSelection::TopN(10),
    };
    let signal = combine_context_matrices(
        &feature_build.context_matrix,
        &sample_build.context_matrix,
        &options,
    )
    .unwrap();

    assert_eq!(signal.n_rows(), 3);
    assert_eq!(signal.n_columns(), 10);
    for label in &signal.row_names {
        assert!(matrix.row_names.contains(label));
    }
    for label in &signal.column_names {
        assert!(matrix.column_names.contains(label));
    }

    // the kept features really are the largest by absolute summary
    let summaries = summarize_context_matrix(&feature_build.context_matrix, SelectContext::Both);
    let mut sorted: Vec<f64> = summaries.iter().map(|s| s.abs()).collect();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
    let cutoff = sorted[2];
    for label in &signal.row_names {
        let i = matrix.row_names.iter().position(|n| n == label).unwrap();
        assert!(summaries[i].abs() >= cutoff);
    }
}

#[test]
fn column_axis_context_round_trips_through_transposition() {
    let matrix = seeded_matrix(14, 3, 30);
    let config = ContextConfig::default();
    let by_column = make_context_matrix(&matrix.transpose(), 1, None, &config, None).unwrap();
    let back = by_column.context_matrix.transpose();
    assert_eq!(back.row_names, matrix.row_names);
    assert_eq!(back.column_names, matrix.column_names);
}

#[test]
fn pooled_fit_covers_every_finite_cell() {
    let mut matrix = seeded_matrix(31, 4, 25);
    matrix.values[2][7] = f64::NAN;

    let fit = fit_skew_t_pdf_globally(&matrix).unwrap();
    assert_eq!(fit.n, 4 * 25 - 1);
    assert!(fit.location.is_finite());
    assert!(fit.scale > 0.0);
    assert!(fit.degree_of_freedom > 0.0);
    assert!(fit.shape.is_finite());
    // the pooled values are roughly centered, the fit should be too
    assert!(fit.location.abs() < 1.0);
}
