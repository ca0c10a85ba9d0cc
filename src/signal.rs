use std::error::Error;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use clap::Args;

use crate::error::ContextError;
use crate::matrix::DataMatrix;

/// Which sign of the context indices carries the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectContext {
    Negative,
    Positive,
    Both,
}

impl FromStr for SelectContext {
    type Err = ContextError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "negative" => Ok(SelectContext::Negative),
            "positive" => Ok(SelectContext::Positive),
            "both" => Ok(SelectContext::Both),
            _ => Err(ContextError::Configuration(format!(
                "Unknown select_context: {}. Supported: negative, positive, both",
                s
            ))),
        }
    }
}

/// How the two normalized signal matrices are merged cell by cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinationMethod {
    Product,
    Sum,
}

impl FromStr for CombinationMethod {
    type Err = ContextError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*" => Ok(CombinationMethod::Product),
            "+" => Ok(CombinationMethod::Sum),
            _ => Err(ContextError::Configuration(format!(
                "Unknown combination_method: {}. Supported: *, +",
                s
            ))),
        }
    }
}

/// How rows of a context matrix are narrowed before combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSelection {
    /// Keep every row.
    All,
    /// Keep the N rows with the largest absolute summary.
    TopN(usize),
    /// Keep rows whose absolute summary exceeds the standard deviation of
    /// all summaries.
    Automatic,
}

/// Per-row signed-sum summary of a context matrix: negative entries for
/// `Negative`, positive entries for `Positive`, absolute values for `Both`.
/// Non-finite cells are ignored.
pub fn summarize_context_matrix(matrix: &DataMatrix, select: SelectContext) -> Vec<f64> {
    matrix
        .values
        .iter()
        .map(|row| {
            row.iter()
                .filter(|v| v.is_finite())
                .map(|&v| match select {
                    SelectContext::Negative => {
                        if v < 0.0 {
                            v
                        } else {
                            0.0
                        }
                    }
                    SelectContext::Positive => {
                        if v > 0.0 {
                            v
                        } else {
                            0.0
                        }
                    }
                    SelectContext::Both => v.abs(),
                })
                .sum()
        })
        .collect()
}

fn select_row_labels(
    matrix: &DataMatrix,
    summaries: &[f64],
    selection: RowSelection,
) -> Result<Vec<String>, ContextError> {
    match selection {
        RowSelection::All => Ok(matrix.row_names.clone()),
        RowSelection::TopN(n) => {
            if n == 0 {
                return Err(ContextError::Configuration(
                    "Top-N selection needs N > 0".to_string(),
                ));
            }
            let mut order: Vec<usize> = (0..summaries.len()).collect();
            order.sort_by(|&a, &b| {
                summaries[a]
                    .abs()
                    .partial_cmp(&summaries[b].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let n = n.min(order.len());
            let mut labels: Vec<String> = order[order.len() - n..]
                .iter()
                .map(|&i| matrix.row_names[i].clone())
                .collect();
            // present rows in their original matrix order
            labels.sort_by_key(|label| matrix.row_index(label));
            Ok(labels)
        }
        RowSelection::Automatic => {
            if summaries.len() < 2 {
                return Err(ContextError::Configuration(
                    "Automatic selection needs at least two rows".to_string(),
                ));
            }
            // sample standard deviation of the absolute summaries
            let absolute: Vec<f64> = summaries.iter().map(|s| s.abs()).collect();
            let n = absolute.len() as f64;
            let mean = absolute.iter().sum::<f64>() / n;
            let variance =
                absolute.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
            let threshold = variance.sqrt();
            let labels: Vec<String> = matrix
                .row_names
                .iter()
                .zip(summaries)
                .filter(|(_, &s)| threshold < s.abs())
                .map(|(label, _)| label.clone())
                .collect();
            if labels.is_empty() {
                return Err(ContextError::Configuration(
                    "Automatic selection kept no rows; relax the selection or use top-N"
                        .to_string(),
                ));
            }
            Ok(labels)
        }
    }
}

/// Keep one sign of the context indices, mapped to a non-negative scale:
/// negative entries are flipped for `Negative`, positive entries kept for
/// `Positive`, absolute values for `Both`. The other side becomes zero.
fn filter_context(matrix: &DataMatrix, select: SelectContext) -> DataMatrix {
    let values = matrix
        .values
        .iter()
        .map(|row| {
            row.iter()
                .map(|&v| {
                    if !v.is_finite() {
                        return f64::NAN;
                    }
                    match select {
                        SelectContext::Negative => {
                            if v < 0.0 {
                                -v
                            } else {
                                0.0
                            }
                        }
                        SelectContext::Positive => {
                            if v > 0.0 {
                                v
                            } else {
                                0.0
                            }
                        }
                        SelectContext::Both => v.abs(),
                    }
                })
                .collect()
        })
        .collect();
    DataMatrix {
        row_names: matrix.row_names.clone(),
        column_names: matrix.column_names.clone(),
        values,
        index_name: matrix.index_name.clone(),
    }
}

/// Min-max normalize each row to [0, 1] over its finite entries. Rows with no
/// finite entries or a constant value become all-zero.
fn normalize_rows_0_1(matrix: &DataMatrix) -> DataMatrix {
    let values = matrix
        .values
        .iter()
        .map(|row| {
            let finite: Vec<f64> = row.iter().copied().filter(|v| v.is_finite()).collect();
            let low = finite.iter().copied().fold(f64::INFINITY, f64::min);
            let high = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if finite.is_empty() || high <= low {
                return vec![0.0; row.len()];
            }
            row.iter()
                .map(|&v| {
                    if v.is_finite() {
                        (v - low) / (high - low)
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect();
    DataMatrix {
        row_names: matrix.row_names.clone(),
        column_names: matrix.column_names.clone(),
        values,
        index_name: matrix.index_name.clone(),
    }
}

/// Selection knobs for [`combine_context_matrices`].
#[derive(Debug, Clone, Copy)]
pub struct SignalOptions {
    pub select_context: SelectContext,
    pub combination_method: CombinationMethod,
    pub feature_selection: RowSelection,
    pub sample_selection: RowSelection,
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            select_context: SelectContext::Both,
            combination_method: CombinationMethod::Product,
            feature_selection: RowSelection::All,
            sample_selection: RowSelection::All,
        }
    }
}

/// Merge a feature-wise context matrix (feature x sample) and a sample-wise
/// one (sample x feature, built on the transposed input) into one signal
/// matrix.
///
/// Rows and columns are narrowed by summary magnitude first, then each
/// matrix is sign-filtered, min-max normalized per row, aligned on the shared
/// feature x sample index, and combined cell by cell.
pub fn combine_context_matrices(
    feature_context: &DataMatrix,
    sample_context: &DataMatrix,
    options: &SignalOptions,
) -> Result<DataMatrix, ContextError> {
    let feature_summaries = summarize_context_matrix(feature_context, options.select_context);
    let sample_summaries = summarize_context_matrix(sample_context, options.select_context);

    let features =
        select_row_labels(feature_context, &feature_summaries, options.feature_selection)?;
    let samples =
        select_row_labels(sample_context, &sample_summaries, options.sample_selection)?;

    let feature_slice = feature_context.select(&features, &samples)?;
    let sample_slice = sample_context.select(&samples, &features)?;

    let feature_signal = normalize_rows_0_1(&filter_context(&feature_slice, options.select_context));
    let sample_signal =
        normalize_rows_0_1(&filter_context(&sample_slice, options.select_context)).transpose();

    let values = feature_signal
        .values
        .iter()
        .zip(&sample_signal.values)
        .map(|(feature_row, sample_row)| {
            feature_row
                .iter()
                .zip(sample_row)
                .map(|(&a, &b)| match options.combination_method {
                    CombinationMethod::Product => a * b,
                    CombinationMethod::Sum => a + b,
                })
                .collect()
        })
        .collect();

    let mut signal = DataMatrix::new(features, samples, values)?;
    signal.index_name = feature_context.index_name.clone();
    Ok(signal)
}

/// Validate signal command arguments
fn validate_signal_args(args: &SignalArgs) -> Result<(), Box<dyn Error>> {
    for (label, path) in [
        ("Feature context", &args.feature_context),
        ("Sample context", &args.sample_context),
    ] {
        if path.trim().is_empty() {
            return Err(format!("Error: {} file path cannot be empty", label).into());
        }
        if !Path::new(path).exists() {
            return Err(format!("Error: {} file does not exist: {}", label, path).into());
        }
        if !path.ends_with(".tsv") {
            return Err(format!("Error: {} file path must end with .tsv: {}", label, path).into());
        }
    }
    if args.output.trim().is_empty() {
        return Err("Error: Output file path cannot be empty".into());
    }
    if !args.output.ends_with(".tsv") {
        return Err(format!("Error: Output file path must end with .tsv: {}", args.output).into());
    }
    args.select_context.parse::<SelectContext>()?;
    args.combination_method.parse::<CombinationMethod>()?;
    if args.n_top_features == Some(0) || args.n_top_samples == Some(0) {
        return Err("Error: Top-N selection needs N > 0".into());
    }
    Ok(())
}

fn selection_from_args(n_top: Option<usize>, automatic: bool) -> RowSelection {
    match n_top {
        Some(n) => RowSelection::TopN(n),
        None if automatic => RowSelection::Automatic,
        None => RowSelection::All,
    }
}

#[derive(Args, Debug)]
pub struct SignalArgs {
    /// Feature-wise context matrix TSV (features x samples)
    #[arg(short = 'f', long = "feature-context")]
    pub feature_context: String,
    /// Sample-wise context matrix TSV (samples x features)
    #[arg(short = 's', long = "sample-context")]
    pub sample_context: String,
    /// Output signal matrix TSV file
    #[arg(short = 'o', long = "output")]
    pub output: String,
    /// Context side to keep: negative, positive, both
    #[arg(short = 'c', long = "select-context", default_value = "both")]
    pub select_context: String,
    /// How the two matrices are combined: * or +
    #[arg(short = 'm', long = "combination-method", default_value = "*")]
    pub combination_method: String,
    /// Keep the N features with the largest absolute summary
    #[arg(long = "n-top-features")]
    pub n_top_features: Option<usize>,
    /// Keep the N samples with the largest absolute summary
    #[arg(long = "n-top-samples")]
    pub n_top_samples: Option<usize>,
    /// Select features whose absolute summary exceeds the summary standard
    /// deviation
    #[arg(long = "automatic-features", default_value_t = false)]
    pub automatic_features: bool,
    /// Select samples the same way
    #[arg(long = "automatic-samples", default_value_t = false)]
    pub automatic_samples: bool,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

pub fn signal_matrix_tsv(
    args: &SignalArgs,
    logger: &mut crate::Logger,
) -> Result<(), Box<dyn Error>> {
    validate_signal_args(args)?;

    let start_time = Instant::now();

    logger.log("=== Contexture Signal Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!(
        "Runtime: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    ))?;
    logger.log(&format!("Feature Context File: {}", args.feature_context))?;
    logger.log(&format!("Sample Context File: {}", args.sample_context))?;
    logger.log(&format!("Output File: {}", args.output))?;
    logger.log(&format!("Select Context: {}", args.select_context))?;
    logger.log(&format!("Combination Method: {}", args.combination_method))?;
    logger.log("Starting signal combination...")?;

    println!("[Loading data]");
    println!("    Feature context: {}", args.feature_context);
    println!("    Sample context: {}", args.sample_context);
    println!();

    let feature_context = DataMatrix::read_tsv(Path::new(&args.feature_context))?;
    let sample_context = DataMatrix::read_tsv(Path::new(&args.sample_context))?;

    let options = SignalOptions {
        select_context: args.select_context.parse()?,
        combination_method: args.combination_method.parse()?,
        feature_selection: selection_from_args(args.n_top_features, args.automatic_features),
        sample_selection: selection_from_args(args.n_top_samples, args.automatic_samples),
    };

    println!("[Params]");
    println!("    Select context: {}.", args.select_context);
    println!("    Combination method: {}.", args.combination_method);
    println!();

    let signal = combine_context_matrices(&feature_context, &sample_context, &options)?;
    signal.write_tsv(Path::new(&args.output))?;

    let elapsed = start_time.elapsed();
    println!("\r[Output]                           ");
    println!(
        "    Signal matrix: {} ({} x {})",
        args.output,
        signal.n_rows(),
        signal.n_columns()
    );
    println!("{}", crate::progress::format_time_used(elapsed));

    logger.log(&format!(
        "Signal combination completed: {} features x {} samples, output file: {}",
        signal.n_rows(),
        signal.n_columns(),
        args.output
    ))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: &[&str], columns: &[&str], values: Vec<Vec<f64>>) -> DataMatrix {
        DataMatrix::new(
            rows.iter().map(|s| s.to_string()).collect(),
            columns.iter().map(|s| s.to_string()).collect(),
            values,
        )
        .unwrap()
    }

    #[test]
    fn negative_filter_flips_sign_and_zeroes_positives() {
        let m = matrix(
            &["r1"],
            &["c1", "c2", "c3"],
            vec![vec![-2.0, 0.5, -0.25]],
        );
        let filtered = filter_context(&m, SelectContext::Negative);
        assert_eq!(filtered.values[0], vec![2.0, 0.0, 0.25]);
        assert!(filtered.values[0].iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn positive_filter_zeroes_negatives() {
        let m = matrix(&["r1"], &["c1", "c2"], vec![vec![-1.0, 3.0]]);
        let filtered = filter_context(&m, SelectContext::Positive);
        assert_eq!(filtered.values[0], vec![0.0, 3.0]);
    }

    #[test]
    fn normalization_maps_rows_to_unit_interval() {
        let m = matrix(&["r1", "r2"], &["c1", "c2"], vec![
            vec![2.0, 6.0],
            vec![5.0, 5.0],
        ]);
        let normalized = normalize_rows_0_1(&m);
        assert_eq!(normalized.values[0], vec![0.0, 1.0]);
        // constant row has no signal
        assert_eq!(normalized.values[1], vec![0.0, 0.0]);
    }

    #[test]
    fn both_summary_is_absolute_sum() {
        let m = matrix(&["r1"], &["c1", "c2", "c3"], vec![vec![-1.0, 2.0, f64::NAN]]);
        let summaries = summarize_context_matrix(&m, SelectContext::Both);
        assert_eq!(summaries, vec![3.0]);
    }

    #[test]
    fn top_n_keeps_largest_absolute_summaries() {
        let m = matrix(&["a", "b", "c"], &["c1"], vec![
            vec![0.1],
            vec![-5.0],
            vec![2.0],
        ]);
        let summaries = summarize_context_matrix(&m, SelectContext::Both);
        let labels = select_row_labels(&m, &summaries, RowSelection::TopN(2)).unwrap();
        assert_eq!(labels, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn automatic_selection_uses_the_sample_standard_deviation() {
        // absolute summaries [0, 0, 1.4, 3]: sample std 1.428, population
        // std 1.237; only the threshold with the n-1 denominator rejects 1.4
        let m = matrix(&["a", "b", "c", "d"], &["c1"], vec![
            vec![0.0],
            vec![0.0],
            vec![1.4],
            vec![3.0],
        ]);
        let summaries = summarize_context_matrix(&m, SelectContext::Both);
        let labels = select_row_labels(&m, &summaries, RowSelection::Automatic).unwrap();
        assert_eq!(labels, vec!["d".to_string()]);
    }

    #[test]
    fn automatic_selection_needs_two_rows() {
        let m = matrix(&["a"], &["c1"], vec![vec![5.0]]);
        let summaries = summarize_context_matrix(&m, SelectContext::Both);
        let err = select_row_labels(&m, &summaries, RowSelection::Automatic).unwrap_err();
        assert!(matches!(err, ContextError::Configuration(_)));
    }

    #[test]
    fn unknown_combination_method_fails_fast() {
        let err = "x".parse::<CombinationMethod>().unwrap_err();
        assert!(matches!(err, ContextError::Configuration(_)));
        assert!(err.to_string().contains("combination_method"));
    }

    #[test]
    fn combine_aligns_transposed_sample_context() {
        let feature_context = matrix(&["g1", "g2"], &["s1", "s2"], vec![
            vec![0.0, 1.0],
            vec![1.0, 0.0],
        ]);
        let sample_context = matrix(&["s1", "s2"], &["g1", "g2"], vec![
            vec![0.0, 1.0],
            vec![1.0, 0.0],
        ]);
        let options = SignalOptions::default();
        let signal =
            combine_context_matrices(&feature_context, &sample_context, &options).unwrap();
        assert_eq!(signal.row_names, vec!["g1".to_string(), "g2".to_string()]);
        assert_eq!(signal.column_names, vec!["s1".to_string(), "s2".to_string()]);
        // product of the two normalized matrices
        assert_eq!(signal.values[0], vec![0.0, 1.0]);
        assert_eq!(signal.values[1], vec![1.0, 0.0]);
    }
}
