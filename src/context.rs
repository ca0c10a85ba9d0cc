use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use clap::Args;
use rayon::prelude::*;

use crate::error::ContextError;
use crate::fit::{fit_skew_t_pdf, impute_bad_values, FitOptions, FitParameterTable, FitParameters};
use crate::matrix::{format_cell, DataMatrix};
use crate::skew_t::SkewT;

/// Floor applied to every reference PDF before ratio/log operations.
pub const REFERENCE_FLOOR: f64 = 1e-12;

/// How the reference PDF is built and compared against the fitted PDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMethod {
    /// Mirror the grid across the fitted PDF's mode, same tail weight.
    Reflection,
    /// Re-evaluate on the original grid with inflated degrees of freedom.
    TailReduction,
    /// Mirror the grid and inflate degrees of freedom (default).
    TailReductionReflection,
    /// KL-divergence delta-area accumulated outward from the reference mode.
    KlArea,
}

impl FromStr for ContextMethod {
    type Err = ContextError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reflection" => Ok(ContextMethod::Reflection),
            "tail_reduction" => Ok(ContextMethod::TailReduction),
            "tail_reduction_reflection" => Ok(ContextMethod::TailReductionReflection),
            "kl_area" => Ok(ContextMethod::KlArea),
            _ => Err(ContextError::Configuration(format!(
                "Unknown context method: {}. Supported: reflection, tail_reduction, tail_reduction_reflection, kl_area",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizeBy {
    Context,
    AbsoluteValueWeightedContext,
}

impl FromStr for SummarizeBy {
    type Err = ContextError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "context" => Ok(SummarizeBy::Context),
            "absolute_value_weighted_context" => Ok(SummarizeBy::AbsoluteValueWeightedContext),
            _ => Err(ContextError::Configuration(format!(
                "Unknown summarize_by: {}. Supported: context, absolute_value_weighted_context",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizeSide {
    ShapeSide,
    BothSides,
}

impl FromStr for SummarizeSide {
    type Err = ContextError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shape_side" => Ok(SummarizeSide::ShapeSide),
            "both_sides" => Ok(SummarizeSide::BothSides),
            _ => Err(ContextError::Configuration(format!(
                "Unknown summarize_side: {}. Supported: shape_side, both_sides",
                s
            ))),
        }
    }
}

/// Population-level skew-t parameters shared across all rows.
#[derive(Debug, Clone, Copy)]
pub struct GlobalParameters {
    pub location: f64,
    pub scale: f64,
    pub degree_of_freedom: f64,
    pub shape: f64,
}

/// Every recognized knob of the context computation, constructed once and
/// passed by reference; no per-call option soup.
#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    pub n_grid: usize,
    pub degree_of_freedom_for_tail_reduction: f64,
    pub method: ContextMethod,
    pub summarize_by: SummarizeBy,
    pub summarize_side: SummarizeSide,
    pub global: Option<GlobalParameters>,
    pub fit_options: FitOptions,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            n_grid: 3000,
            degree_of_freedom_for_tail_reduction: 1e8,
            method: ContextMethod::TailReductionReflection,
            summarize_by: SummarizeBy::AbsoluteValueWeightedContext,
            summarize_side: SummarizeSide::ShapeSide,
            global: None,
            fit_options: FitOptions::default(),
        }
    }
}

impl ContextConfig {
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.n_grid < 2 {
            return Err(ContextError::Configuration(format!(
                "n_grid must be at least 2, got {}",
                self.n_grid
            )));
        }
        let tail_df = self.degree_of_freedom_for_tail_reduction;
        if !tail_df.is_finite() || tail_df <= 0.0 {
            return Err(ContextError::Configuration(format!(
                "degree_of_freedom_for_tail_reduction must be finite and > 0, got {}",
                tail_df
            )));
        }
        if let Some(global) = &self.global {
            if !global.scale.is_finite() || global.scale <= 0.0 {
                return Err(ContextError::Configuration(format!(
                    "global scale must be finite and > 0, got {}",
                    global.scale
                )));
            }
            if !global.degree_of_freedom.is_finite() || global.degree_of_freedom <= 0.0 {
                return Err(ContextError::Configuration(format!(
                    "global degree of freedom must be finite and > 0, got {}",
                    global.degree_of_freedom
                )));
            }
        }
        Ok(())
    }
}

/// Everything computed for one vector.
#[derive(Debug, Clone)]
pub struct ContextResult {
    pub fit: FitParameters,
    pub grid: Vec<f64>,
    pub pdf: Vec<f64>,
    pub pdf_reference: Vec<f64>,
    pub context_indices: Vec<f64>,
    pub context_indices_like_array: Vec<f64>,
    pub negative_context_summary: f64,
    pub positive_context_summary: f64,
    pub context_summary: f64,
}

impl ContextResult {
    /// The signed summary with the larger absolute value.
    pub fn dominant_context_summary(&self) -> f64 {
        if self.negative_context_summary.abs() < self.positive_context_summary.abs() {
            self.positive_context_summary
        } else {
            self.negative_context_summary
        }
    }
}

fn linspace(low: f64, high: f64, n: usize) -> Vec<f64> {
    let step = (high - low) / (n - 1) as f64;
    (0..n).map(|i| low + step * i as f64).collect()
}

fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Index of the grid point nearest to `value` (first match on ties).
pub fn nearest_grid_index(grid: &[f64], value: f64) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (i, &g) in grid.iter().enumerate() {
        let distance = (g - value).abs();
        if distance < best_distance {
            best_distance = distance;
            best = i;
        }
    }
    best
}

/// Grid coordinates mirrored across the grid point where `pdf` peaks:
/// `reflected[i] = 2 * grid[argmax(pdf)] - grid[i]`.
fn reflect_coordinates(grid: &[f64], pdf: &[f64]) -> Vec<f64> {
    let mode = grid[argmax(pdf)];
    grid.iter().map(|&g| 2.0 * mode - g).collect()
}

fn floor_reference(reference: &mut [f64]) {
    for value in reference.iter_mut() {
        if !value.is_finite() || *value < REFERENCE_FLOOR {
            *value = REFERENCE_FLOOR;
        }
    }
}

/// Compute per-grid-point context indices and their per-sample resampling
/// for one vector.
///
/// When `parameters` is supplied the fit step is skipped; otherwise the
/// vector is fit after mean-imputing bad values (all-bad vectors error).
pub fn compute_context(
    values: &[f64],
    parameters: Option<FitParameters>,
    config: &ContextConfig,
) -> Result<ContextResult, ContextError> {
    config.validate()?;

    let (clean, _) = impute_bad_values(values)?;

    let fit = match parameters {
        Some(p) => p,
        None => fit_skew_t_pdf(&clean, &config.fit_options)?,
    };

    let low = clean.iter().copied().fold(f64::INFINITY, f64::min);
    let high = clean.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let grid = linspace(low, high, config.n_grid);

    let model = SkewT::new(fit.location, fit.scale, fit.degree_of_freedom, fit.shape)?;
    let pdf = model.pdf_over(&grid);

    let tail_df = config.degree_of_freedom_for_tail_reduction;
    let mut pdf_reference = match config.method {
        ContextMethod::Reflection => model.pdf_over(&reflect_coordinates(&grid, &pdf)),
        ContextMethod::TailReduction => {
            SkewT::new(fit.location, fit.scale, tail_df, fit.shape)?.pdf_over(&grid)
        }
        ContextMethod::TailReductionReflection | ContextMethod::KlArea => {
            SkewT::new(fit.location, fit.scale, tail_df, fit.shape)?
                .pdf_over(&reflect_coordinates(&grid, &pdf))
        }
    };
    floor_reference(&mut pdf_reference);

    let mut context_indices = match config.method {
        ContextMethod::KlArea => kl_area_indices(&pdf, &pdf_reference),
        _ => fractional_difference_indices(&pdf, &pdf_reference, &fit, config.method)?,
    };

    if let Some(global) = &config.global {
        let global_indices = global_reference_indices(&grid, &pdf, global, &fit)?;
        for (primary, candidate) in context_indices.iter_mut().zip(&global_indices) {
            if candidate.abs() > primary.abs() {
                *primary = *candidate;
            }
        }
    }

    let context_indices_like_array: Vec<f64> = clean
        .iter()
        .map(|&v| context_indices[nearest_grid_index(&grid, v)])
        .collect();

    let weighted: Vec<f64> = match config.summarize_by {
        SummarizeBy::Context => context_indices_like_array.clone(),
        SummarizeBy::AbsoluteValueWeightedContext => clean
            .iter()
            .zip(&context_indices_like_array)
            .map(|(&v, &c)| v.abs() * c)
            .collect(),
    };

    let negative_context_summary: f64 = weighted.iter().filter(|&&a| a < 0.0).sum();
    let positive_context_summary: f64 = weighted.iter().filter(|&&a| a > 0.0).sum();

    let context_summary = match config.summarize_side {
        // a zero shape has no side; signum would otherwise gate the
        // positive entries (f64::signum(0.0) is 1.0)
        SummarizeSide::ShapeSide if fit.shape == 0.0 => 0.0,
        SummarizeSide::ShapeSide => weighted
            .iter()
            .filter(|&&a| a.signum() == fit.shape.signum())
            .sum(),
        SummarizeSide::BothSides => weighted.iter().sum(),
    };

    Ok(ContextResult {
        fit,
        grid,
        pdf,
        pdf_reference,
        context_indices,
        context_indices_like_array,
        negative_context_summary,
        positive_context_summary,
        context_summary,
    })
}

/// Fractional-difference magnitudes raised to `ln(df)/sqrt(|shape|*scale)`,
/// negative left of the fitted PDF's mode and positive on or after it.
fn fractional_difference_indices(
    pdf: &[f64],
    reference: &[f64],
    fit: &FitParameters,
    method: ContextMethod,
) -> Result<Vec<f64>, ContextError> {
    if fit.degree_of_freedom <= 0.0 || fit.scale <= 0.0 {
        return Err(ContextError::NumericDomain(format!(
            "context exponent needs df > 0 and scale > 0, got {} and {}",
            fit.degree_of_freedom, fit.scale
        )));
    }
    let exponent = fit.degree_of_freedom.ln() / (fit.shape.abs() * fit.scale).sqrt();

    let mode_index = argmax(pdf);
    Ok(pdf
        .iter()
        .zip(reference)
        .enumerate()
        .map(|(i, (&p, &r))| {
            let magnitude = if r < p {
                (p - r) / p
            } else if method == ContextMethod::Reflection {
                (r - p) / r
            } else {
                0.0
            };
            if magnitude == 0.0 {
                // skip powf: a negative exponent would blow zero up to inf
                return 0.0;
            }
            let sign = if i < mode_index { -1.0 } else { 1.0 };
            sign * magnitude.powf(exponent)
        })
        .collect())
}

/// KL delta-area accumulated outward from the reference PDF's mode:
/// reverse-cumulative (sign-flipped) before the mode, cumulative after it.
fn kl_area_indices(pdf: &[f64], reference: &[f64]) -> Vec<f64> {
    let kl: Vec<f64> = pdf
        .iter()
        .zip(reference)
        .map(|(&p, &r)| {
            if p > REFERENCE_FLOOR {
                (p * (p / r).ln()).max(0.0)
            } else {
                0.0
            }
        })
        .collect();

    let total: f64 = kl.iter().sum();
    if total <= 0.0 {
        return vec![0.0; pdf.len()];
    }

    let mode_index = argmax(reference);
    let mut indices = vec![0.0; pdf.len()];

    let mut accumulated = 0.0;
    for i in mode_index..pdf.len() {
        accumulated += kl[i] / total;
        indices[i] = accumulated;
    }
    accumulated = 0.0;
    for i in (0..mode_index).rev() {
        accumulated += kl[i] / total;
        indices[i] = -accumulated;
    }
    indices
}

/// Context contribution against the population-level distribution, damped
/// near the global location (`d/(1+d)` with `d` in global-scale units).
fn global_reference_indices(
    grid: &[f64],
    pdf: &[f64],
    global: &GlobalParameters,
    fit: &FitParameters,
) -> Result<Vec<f64>, ContextError> {
    let model = SkewT::new(
        global.location,
        global.scale,
        global.degree_of_freedom,
        global.shape,
    )?;
    let mut global_pdf = model.pdf_over(grid);
    floor_reference(&mut global_pdf);

    let exponent = fit.degree_of_freedom.ln() / (fit.shape.abs() * fit.scale).sqrt();
    let mode_index = argmax(&global_pdf);

    Ok(grid
        .iter()
        .zip(pdf.iter().zip(&global_pdf))
        .enumerate()
        .map(|(i, (&g, (&p, &r)))| {
            let magnitude = if r < p { (p - r) / p } else { 0.0 };
            if magnitude == 0.0 {
                return 0.0;
            }
            let distance = (g - global.location).abs() / global.scale;
            let damping = distance / (1.0 + distance);
            let sign = if i < mode_index { -1.0 } else { 1.0 };
            sign * magnitude.powf(exponent) * damping
        })
        .collect())
}

/// One row that could not be processed during a matrix build.
#[derive(Debug, Clone)]
pub struct RowFailure {
    pub row: String,
    pub error: String,
}

/// Per-row context summaries aligned with the context matrix.
#[derive(Debug, Clone)]
pub struct ContextSummaryTable {
    pub row_names: Vec<String>,
    pub negative: Vec<f64>,
    pub positive: Vec<f64>,
    pub summary: Vec<f64>,
    /// Name of the row-label column, carried over from the input matrix
    pub index_name: String,
}

impl ContextSummaryTable {
    pub fn write_tsv(&self, path: &Path) -> Result<(), ContextError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(
            out,
            "{}\tNegative Context Summary\tPositive Context Summary\tContext Summary",
            self.index_name
        )?;
        for (i, label) in self.row_names.iter().enumerate() {
            writeln!(
                out,
                "{}\t{}\t{}\t{}",
                label,
                format_cell(self.negative[i]),
                format_cell(self.positive[i]),
                format_cell(self.summary[i])
            )?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Output of a matrix-level context build.
#[derive(Debug, Clone)]
pub struct ContextBuild {
    pub context_matrix: DataMatrix,
    pub summary: ContextSummaryTable,
    pub failures: Vec<RowFailure>,
}

/// Run the per-vector context computation over every row of the matrix.
///
/// Rows are split into `n_job` contiguous chunks processed in parallel;
/// within a chunk rows are handled sequentially and results are concatenated
/// in the original row order. Rows are isolated: a row whose computation
/// fails yields an all-NaN context row, NaN summaries, and an entry in
/// `failures`. Configuration problems abort before any computation.
pub fn make_context_matrix(
    matrix: &DataMatrix,
    n_job: usize,
    fit_parameters: Option<&FitParameterTable>,
    config: &ContextConfig,
    directory_path: Option<&Path>,
) -> Result<ContextBuild, ContextError> {
    config.validate()?;

    let n_rows = matrix.n_rows();
    if n_rows == 0 {
        return Err(ContextError::Configuration(
            "Cannot compute context for an empty matrix".to_string(),
        ));
    }

    let n_chunks = n_job.clamp(1, n_rows);
    let chunk_size = n_rows.div_ceil(n_chunks);
    let progress = crate::progress::RowProgress::every_tenth(n_rows);

    struct RowOutcome {
        indices: Vec<f64>,
        negative: f64,
        positive: f64,
        summary: f64,
        failure: Option<String>,
    }

    let indices: Vec<usize> = (0..n_rows).collect();
    let chunks: Vec<Vec<RowOutcome>> = indices
        .par_chunks(chunk_size)
        .map(|chunk| {
            chunk
                .iter()
                .map(|&i| {
                    let label = &matrix.row_names[i];
                    progress.report(i, label);
                    let parameters =
                        fit_parameters.and_then(|table| table.get(label)).copied();
                    match compute_context(&matrix.values[i], parameters, config) {
                        Ok(result) => RowOutcome {
                            indices: result.context_indices_like_array,
                            negative: result.negative_context_summary,
                            positive: result.positive_context_summary,
                            summary: result.context_summary,
                            failure: None,
                        },
                        Err(e) => RowOutcome {
                            indices: vec![f64::NAN; matrix.n_columns()],
                            negative: f64::NAN,
                            positive: f64::NAN,
                            summary: f64::NAN,
                            failure: Some(e.to_string()),
                        },
                    }
                })
                .collect()
        })
        .collect();

    let mut values = Vec::with_capacity(n_rows);
    let mut negative = Vec::with_capacity(n_rows);
    let mut positive = Vec::with_capacity(n_rows);
    let mut summary = Vec::with_capacity(n_rows);
    let mut failures = Vec::new();
    for (i, outcome) in chunks.into_iter().flatten().enumerate() {
        if let Some(error) = outcome.failure {
            failures.push(RowFailure {
                row: matrix.row_names[i].clone(),
                error,
            });
        }
        values.push(outcome.indices);
        negative.push(outcome.negative);
        positive.push(outcome.positive);
        summary.push(outcome.summary);
    }

    let context_matrix = DataMatrix::new(
        matrix.row_names.clone(),
        matrix.column_names.clone(),
        values,
    )?;
    let summary = ContextSummaryTable {
        row_names: matrix.row_names.clone(),
        negative,
        positive,
        summary,
        index_name: matrix.index_name.clone(),
    };

    if !failures.is_empty() {
        for failure in &failures {
            eprintln!("Warning: row {} failed: {}", failure.row, failure.error);
        }
    }

    if let Some(directory) = directory_path {
        std::fs::create_dir_all(directory)?;
        context_matrix.write_tsv(&directory.join("context_matrix.tsv"))?;
        summary.write_tsv(&directory.join("context_summary.tsv"))?;
    }

    Ok(ContextBuild {
        context_matrix,
        summary,
        failures,
    })
}

/// Validate context command arguments
fn validate_context_args(args: &ContextArgs) -> Result<(), Box<dyn Error>> {
    if args.input.trim().is_empty() {
        return Err("Error: Input file path cannot be empty".into());
    }
    if !Path::new(&args.input).exists() {
        return Err(format!("Error: Input file does not exist: {}", args.input).into());
    }
    if !args.input.ends_with(".tsv") {
        return Err(format!("Error: Input file path must end with .tsv: {}", args.input).into());
    }
    if args.output_dir.trim().is_empty() {
        return Err("Error: Output directory cannot be empty".into());
    }
    if args.n_grid < 2 {
        return Err(format!("Error: Grid size must be at least 2, current: {}", args.n_grid).into());
    }
    if args.threads == 0 {
        return Err("Error: Thread count cannot be 0".into());
    }
    args.method.parse::<ContextMethod>()?;
    args.summarize_by.parse::<SummarizeBy>()?;
    args.summarize_side.parse::<SummarizeSide>()?;

    let global_given = [
        args.global_location.is_some(),
        args.global_scale.is_some(),
        args.global_degree_of_freedom.is_some(),
        args.global_shape.is_some(),
    ];
    if global_given.iter().any(|&g| g) && !global_given.iter().all(|&g| g) {
        return Err(
            "Error: Global reference needs all of --global-location, --global-scale, --global-degree-of-freedom, --global-shape"
                .into(),
        );
    }

    if let Some(fit_path) = &args.fit_parameter {
        if !Path::new(fit_path).exists() {
            return Err(
                format!("Error: Fit parameter file does not exist: {}", fit_path).into(),
            );
        }
    }

    Ok(())
}

#[derive(Args, Debug)]
pub struct ContextArgs {
    /// Input feature x sample TSV file
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output directory for context_matrix.tsv and context_summary.tsv
    #[arg(short = 'o', long = "output-dir")]
    pub output_dir: String,
    /// Pre-fit skew-t parameter TSV (skips fitting for listed rows)
    #[arg(short = 'p', long = "fit-parameter")]
    pub fit_parameter: Option<String>,
    /// Compute context column-wise (transpose before and after)
    #[arg(long = "by-column", default_value_t = false)]
    pub by_column: bool,
    /// Evaluation grid resolution
    #[arg(short = 'g', long = "n-grid", default_value_t = 3000)]
    pub n_grid: usize,
    /// Degrees of freedom for the tail-reduction reference
    #[arg(long = "tail-df", default_value_t = 1e8)]
    pub degree_of_freedom_for_tail_reduction: f64,
    /// Context method: reflection, tail_reduction, tail_reduction_reflection, kl_area
    #[arg(short = 'm', long = "method", default_value = "tail_reduction_reflection")]
    pub method: String,
    /// Summary weighting: context, absolute_value_weighted_context
    #[arg(long = "summarize-by", default_value = "absolute_value_weighted_context")]
    pub summarize_by: String,
    /// Summary side: shape_side, both_sides
    #[arg(long = "summarize-side", default_value = "shape_side")]
    pub summarize_side: String,
    /// Fit the population distribution over the whole matrix and use it as a
    /// global reference
    #[arg(long = "use-global-reference", default_value_t = false)]
    pub use_global_reference: bool,
    /// Global reference location (with the other three global parameters)
    #[arg(long = "global-location")]
    pub global_location: Option<f64>,
    /// Global reference scale
    #[arg(long = "global-scale")]
    pub global_scale: Option<f64>,
    /// Global reference degrees of freedom
    #[arg(long = "global-degree-of-freedom")]
    pub global_degree_of_freedom: Option<f64>,
    /// Global reference shape
    #[arg(long = "global-shape")]
    pub global_shape: Option<f64>,
    /// Number of parallel jobs
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    pub threads: usize,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

pub fn context_matrix_tsv(
    args: &ContextArgs,
    logger: &mut crate::Logger,
) -> Result<(), Box<dyn Error>> {
    validate_context_args(args)?;

    let start_time = Instant::now();

    logger.log("=== Contexture Context Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!(
        "Runtime: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    ))?;
    logger.log(&format!("Input File: {}", args.input))?;
    logger.log(&format!("Output Directory: {}", args.output_dir))?;
    logger.log(&format!("Method: {}", args.method))?;
    logger.log(&format!("Grid Size: {}", args.n_grid))?;
    logger.log(&format!("By Column: {}", args.by_column))?;
    logger.log(&format!("Threads: {}", args.threads))?;
    logger.log("Starting context computation...")?;

    println!("[Loading data]");
    println!("    Matrix: {}", args.input);
    println!();

    let mut matrix = DataMatrix::read_tsv(Path::new(&args.input))?;
    if args.by_column {
        matrix = matrix.transpose();
    }

    let fit_table = match &args.fit_parameter {
        Some(path) => Some(FitParameterTable::read_tsv(Path::new(path))?),
        None => None,
    };

    let global = if let Some(location) = args.global_location {
        Some(GlobalParameters {
            location,
            scale: args.global_scale.ok_or("Error: Missing --global-scale")?,
            degree_of_freedom: args
                .global_degree_of_freedom
                .ok_or("Error: Missing --global-degree-of-freedom")?,
            shape: args.global_shape.ok_or("Error: Missing --global-shape")?,
        })
    } else if args.use_global_reference {
        let fit = crate::fit::fit_skew_t_pdf_globally(&matrix)?;
        Some(GlobalParameters {
            location: fit.location,
            scale: fit.scale,
            degree_of_freedom: fit.degree_of_freedom,
            shape: fit.shape,
        })
    } else {
        None
    };

    let config = ContextConfig {
        n_grid: args.n_grid,
        degree_of_freedom_for_tail_reduction: args.degree_of_freedom_for_tail_reduction,
        method: args.method.parse()?,
        summarize_by: args.summarize_by.parse()?,
        summarize_side: args.summarize_side.parse()?,
        global,
        fit_options: FitOptions::default(),
    };

    println!("[Params]");
    println!("    Method: {}.", args.method);
    println!("    Grid size: {}.", args.n_grid);
    println!("    Threads: {}.", args.threads);
    println!();

    let build = make_context_matrix(
        &matrix,
        args.threads,
        fit_table.as_ref(),
        &config,
        None,
    )?;

    let directory = Path::new(&args.output_dir);
    std::fs::create_dir_all(directory)?;
    let context_matrix = if args.by_column {
        build.context_matrix.transpose()
    } else {
        build.context_matrix.clone()
    };
    context_matrix.write_tsv(&directory.join("context_matrix.tsv"))?;
    build.summary.write_tsv(&directory.join("context_summary.tsv"))?;

    let elapsed = start_time.elapsed();
    println!("\r[Output]                           ");
    println!("    Context matrix: {}/context_matrix.tsv", args.output_dir);
    println!("    Context summary: {}/context_summary.tsv", args.output_dir);
    if !build.failures.is_empty() {
        println!("    Failed rows: {}", build.failures.len());
    }
    println!("{}", crate::progress::format_time_used(elapsed));

    logger.log(&format!(
        "Context computation completed, {} failed row(s), output directory: {}",
        build.failures.len(),
        args.output_dir
    ))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_endpoints_and_order() {
        let grid = linspace(-2.0, 3.0, 11);
        assert_eq!(grid.len(), 11);
        assert_eq!(grid[0], -2.0);
        assert!((grid[10] - 3.0).abs() < 1e-12);
        assert!(grid.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn reflection_mirrors_across_mode() {
        let grid = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        let pdf = vec![0.1, 0.2, 0.9, 0.3, 0.1];
        let reflected = reflect_coordinates(&grid, &pdf);
        // mode at grid[2] = 2.0
        assert_eq!(reflected, vec![4.0, 3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn nearest_grid_index_prefers_first_on_tie() {
        let grid = vec![0.0, 1.0, 2.0];
        assert_eq!(nearest_grid_index(&grid, 0.5), 0);
        assert_eq!(nearest_grid_index(&grid, 0.6), 1);
        assert_eq!(nearest_grid_index(&grid, 10.0), 2);
    }

    #[test]
    fn floor_reference_removes_zeros_and_nans() {
        let mut reference = vec![0.0, f64::NAN, 1e-20, 0.5];
        floor_reference(&mut reference);
        assert!(reference.iter().all(|&v| v >= REFERENCE_FLOOR));
        assert_eq!(reference[3], 0.5);
    }

    #[test]
    fn kl_area_signs_split_at_reference_mode() {
        let pdf = vec![0.1, 0.2, 0.8, 0.4, 0.3];
        let reference = vec![0.05, 0.1, 0.9, 0.2, 0.1];
        let indices = kl_area_indices(&pdf, &reference);
        // reference mode at 2: left side non-positive, right side non-negative
        assert!(indices[0] <= 0.0 && indices[1] <= 0.0);
        assert!(indices[3] >= 0.0 && indices[4] >= 0.0);
        // cumulative outward: magnitudes grow away from the mode
        assert!(indices[4] >= indices[3]);
        assert!(indices[0] <= indices[1]);
    }

    #[test]
    fn unknown_method_string_is_a_configuration_error() {
        let err = "banana".parse::<ContextMethod>().unwrap_err();
        assert!(matches!(err, ContextError::Configuration(_)));
    }
}
