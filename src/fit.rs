use std::error::Error;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use clap::Args;
use rayon::prelude::*;

use crate::error::ContextError;
use crate::matrix::{format_cell, parse_cell, DataMatrix};
use crate::skew_t::SkewT;

/// Fitted skew-t parameters for one vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitParameters {
    pub n: usize,
    pub location: f64,
    pub scale: f64,
    pub degree_of_freedom: f64,
    pub shape: f64,
}

/// Options for the maximum-likelihood fit. Fixed values pin a parameter
/// (it is excluded from optimization); initial values seed the optimizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct FitOptions {
    pub fixed_location: Option<f64>,
    pub fixed_scale: Option<f64>,
    pub initial_location: Option<f64>,
    pub initial_scale: Option<f64>,
}

const MAX_DEGREE_OF_FREEDOM: f64 = 1e4;
const MIN_DEGREE_OF_FREEDOM: f64 = 0.5;
const MAX_SHAPE: f64 = 50.0;

/// Replace bad values (NaN/inf) with the mean of the good values.
/// Returns the cleaned copy and the number of replaced cells.
/// Errors when every value is bad.
pub fn impute_bad_values(values: &[f64]) -> Result<(Vec<f64>, usize), ContextError> {
    let good: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if good.is_empty() {
        return Err(ContextError::AllValuesMissing);
    }
    let n_bad = values.len() - good.len();
    if n_bad == 0 {
        return Ok((values.to_vec(), 0));
    }
    let mean = good.iter().sum::<f64>() / good.len() as f64;
    eprintln!(
        "Warning: replacing {} bad value(s) with the good-value mean {:.6}",
        n_bad, mean
    );
    let imputed = values
        .iter()
        .map(|&v| if v.is_finite() { v } else { mean })
        .collect();
    Ok((imputed, n_bad))
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn standard_deviation(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|&v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64).sqrt()
}

fn sample_skewness(values: &[f64]) -> f64 {
    let m = mean(values);
    let n = values.len() as f64;
    let m2 = values.iter().map(|&v| (v - m).powi(2)).sum::<f64>() / n;
    let m3 = values.iter().map(|&v| (v - m).powi(3)).sum::<f64>() / n;
    if m2 <= 0.0 {
        0.0
    } else {
        m3 / m2.powf(1.5)
    }
}

/// Fit a skew-t distribution to a vector by maximum likelihood.
///
/// Bad values are mean-imputed first (all-bad vectors error). The returned
/// `n` is the vector length. Deterministic: the simplex optimizer uses no
/// randomness, so identical inputs give identical parameters.
pub fn fit_skew_t_pdf(
    values: &[f64],
    options: &FitOptions,
) -> Result<FitParameters, ContextError> {
    let (clean, _) = impute_bad_values(values)?;

    let sample_mean = mean(&clean);
    let sample_std = standard_deviation(&clean);

    let initial_location = options
        .fixed_location
        .or(options.initial_location)
        .unwrap_or(sample_mean);
    let initial_scale = options
        .fixed_scale
        .or(options.initial_scale)
        .unwrap_or(if sample_std > 0.0 { sample_std } else { 1.0 });
    let initial_shape = sample_skewness(&clean).clamp(-5.0, 5.0);

    // The likelihood of a t spike is unbounded as scale -> 0; keep the scale
    // away from zero relative to the data spread.
    let scale_floor = (initial_scale * 1e-3).max(1e-12);
    let scale_ceiling = (initial_scale * 1e3).max(1.0);

    let fixed_location = options.fixed_location;
    let fixed_scale = options.fixed_scale;

    // Free parameter vector: [location?, ln(scale)?, ln(df), shape]
    let mut initial = Vec::with_capacity(4);
    if fixed_location.is_none() {
        initial.push(initial_location);
    }
    if fixed_scale.is_none() {
        initial.push(initial_scale.ln());
    }
    initial.push(10.0_f64.ln());
    initial.push(initial_shape);

    let unpack = move |theta: &[f64]| -> (f64, f64, f64, f64) {
        let mut cursor = 0;
        let location = match fixed_location {
            Some(l) => l,
            None => {
                let v = theta[cursor];
                cursor += 1;
                v
            }
        };
        let scale = match fixed_scale {
            Some(s) => s,
            None => {
                let v = theta[cursor].exp().clamp(scale_floor, scale_ceiling);
                cursor += 1;
                v
            }
        };
        let degree_of_freedom = theta[cursor]
            .exp()
            .clamp(MIN_DEGREE_OF_FREEDOM, MAX_DEGREE_OF_FREEDOM);
        let shape = theta[cursor + 1].clamp(-MAX_SHAPE, MAX_SHAPE);
        (location, scale, degree_of_freedom, shape)
    };

    let objective = |theta: &[f64]| -> f64 {
        let (location, scale, degree_of_freedom, shape) = unpack(theta);
        let model = match SkewT::new(location, scale, degree_of_freedom, shape) {
            Ok(model) => model,
            Err(_) => return 1e300,
        };
        let nll: f64 = clean.iter().map(|&v| -model.log_pdf(v)).sum();
        if nll.is_finite() {
            nll
        } else {
            1e300
        }
    };

    let best = nelder_mead(&objective, &initial, 600, 1e-10);
    let (location, scale, degree_of_freedom, shape) = unpack(&best);

    // The optimizer works in transformed coordinates, so these hold by
    // construction; a violation is a bug worth surfacing to the caller.
    if scale <= 0.0 || degree_of_freedom <= 0.0 {
        return Err(ContextError::NumericDomain(format!(
            "fit produced scale {} and degree of freedom {}",
            scale, degree_of_freedom
        )));
    }

    Ok(FitParameters {
        n: values.len(),
        location,
        scale,
        degree_of_freedom,
        shape,
    })
}

/// Downhill simplex minimization (Nelder-Mead), deterministic.
fn nelder_mead(
    objective: &dyn Fn(&[f64]) -> f64,
    initial: &[f64],
    max_iterations: usize,
    tolerance: f64,
) -> Vec<f64> {
    let n = initial.len();

    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    simplex.push(initial.to_vec());
    for i in 0..n {
        let mut vertex = initial.to_vec();
        vertex[i] += 0.25 * vertex[i].abs() + 0.25;
        simplex.push(vertex);
    }
    let mut scores: Vec<f64> = simplex.iter().map(|v| objective(v)).collect();

    for _ in 0..max_iterations {
        // Order vertices by score
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| {
            scores[a]
                .partial_cmp(&scores[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        simplex = order.iter().map(|&i| simplex[i].clone()).collect();
        scores = order.iter().map(|&i| scores[i]).collect();

        if (scores[n] - scores[0]).abs() < tolerance {
            break;
        }

        // Centroid of all but the worst vertex
        let mut centroid = vec![0.0; n];
        for vertex in simplex.iter().take(n) {
            for (c, &v) in centroid.iter_mut().zip(vertex) {
                *c += v / n as f64;
            }
        }

        let worst = simplex[n].clone();
        let reflect: Vec<f64> = centroid
            .iter()
            .zip(&worst)
            .map(|(&c, &w)| c + (c - w))
            .collect();
        let reflect_score = objective(&reflect);

        if reflect_score < scores[0] {
            // Try expanding further
            let expand: Vec<f64> = centroid
                .iter()
                .zip(&worst)
                .map(|(&c, &w)| c + 2.0 * (c - w))
                .collect();
            let expand_score = objective(&expand);
            if expand_score < reflect_score {
                simplex[n] = expand;
                scores[n] = expand_score;
            } else {
                simplex[n] = reflect;
                scores[n] = reflect_score;
            }
        } else if reflect_score < scores[n - 1] {
            simplex[n] = reflect;
            scores[n] = reflect_score;
        } else {
            // Contract toward the centroid
            let contract: Vec<f64> = centroid
                .iter()
                .zip(&worst)
                .map(|(&c, &w)| c + 0.5 * (w - c))
                .collect();
            let contract_score = objective(&contract);
            if contract_score < scores[n] {
                simplex[n] = contract;
                scores[n] = contract_score;
            } else {
                // Shrink everything toward the best vertex
                let best = simplex[0].clone();
                for i in 1..=n {
                    for (v, &b) in simplex[i].iter_mut().zip(&best) {
                        *v = b + 0.5 * (*v - b);
                    }
                    scores[i] = objective(&simplex[i]);
                }
            }
        }
    }

    let best_index = (0..=n)
        .min_by(|&a, &b| {
            scores[a]
                .partial_cmp(&scores[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(0);
    simplex[best_index].clone()
}

/// Per-row fit parameters keyed by row label.
#[derive(Debug, Clone)]
pub struct FitParameterTable {
    pub row_names: Vec<String>,
    pub parameters: Vec<FitParameters>,
    /// Name of the row-label column, carried over from the input matrix
    pub index_name: String,
}

impl FitParameterTable {
    pub fn get(&self, label: &str) -> Option<&FitParameters> {
        self.row_names
            .iter()
            .position(|name| name == label)
            .map(|i| &self.parameters[i])
    }

    pub fn write_tsv(&self, path: &Path) -> Result<(), ContextError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(
            out,
            "{}\tN\tLocation\tScale\tDegree of Freedom\tShape",
            self.index_name
        )?;
        for (label, p) in self.row_names.iter().zip(&self.parameters) {
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}",
                label,
                p.n,
                format_cell(p.location),
                format_cell(p.scale),
                format_cell(p.degree_of_freedom),
                format_cell(p.shape)
            )?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn read_tsv(path: &Path) -> Result<FitParameterTable, ContextError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let header = lines.next().ok_or_else(|| ContextError::Parse {
            what: "fit parameter header",
            value: format!("{} is empty", path.display()),
        })??;
        let index_name = header
            .split('\t')
            .next()
            .unwrap_or("Feature")
            .to_string();

        let mut row_names = Vec::new();
        let mut parameters = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 6 {
                return Err(ContextError::Parse {
                    what: "fit parameter row",
                    value: line.clone(),
                });
            }
            row_names.push(fields[0].to_string());
            parameters.push(FitParameters {
                n: parse_cell(fields[1])? as usize,
                location: parse_cell(fields[2])?,
                scale: parse_cell(fields[3])?,
                degree_of_freedom: parse_cell(fields[4])?,
                shape: parse_cell(fields[5])?,
            });
        }
        Ok(FitParameterTable {
            row_names,
            parameters,
            index_name,
        })
    }
}

/// Fit every row of the matrix independently, in parallel chunks.
///
/// Rows are split into `n_job` contiguous chunks and each chunk is processed
/// sequentially within its worker; results are concatenated in the original
/// row order. A row that cannot be fit (all values bad) fails the whole call:
/// pre-filter degenerate rows if partial completion is wanted.
pub fn fit_skew_t_pdfs(
    matrix: &DataMatrix,
    n_job: usize,
    options: &FitOptions,
    directory_path: Option<&Path>,
) -> Result<FitParameterTable, ContextError> {
    let n_rows = matrix.n_rows();
    if n_rows == 0 {
        return Err(ContextError::Configuration(
            "Cannot fit an empty matrix".to_string(),
        ));
    }
    let n_chunks = n_job.clamp(1, n_rows);
    let chunk_size = n_rows.div_ceil(n_chunks);
    let progress = crate::progress::RowProgress::every_tenth(n_rows);

    let indices: Vec<usize> = (0..n_rows).collect();
    let chunks: Vec<Vec<FitParameters>> = indices
        .par_chunks(chunk_size)
        .map(|chunk| {
            chunk
                .iter()
                .map(|&i| {
                    progress.report(i, &matrix.row_names[i]);
                    fit_skew_t_pdf(&matrix.values[i], options)
                })
                .collect::<Result<Vec<_>, ContextError>>()
        })
        .collect::<Result<Vec<_>, ContextError>>()?;

    let table = FitParameterTable {
        row_names: matrix.row_names.clone(),
        parameters: chunks.into_iter().flatten().collect(),
        index_name: matrix.index_name.clone(),
    };

    if let Some(directory) = directory_path {
        std::fs::create_dir_all(directory)?;
        table.write_tsv(&directory.join("skew_t_pdf_fit_parameter.tsv"))?;
    }

    Ok(table)
}

/// Fit one skew-t distribution to every finite value of the whole matrix,
/// describing where each vector sits relative to the population.
pub fn fit_skew_t_pdf_globally(matrix: &DataMatrix) -> Result<FitParameters, ContextError> {
    let values = matrix.finite_values();
    if values.is_empty() {
        return Err(ContextError::AllValuesMissing);
    }
    let fit = fit_skew_t_pdf(&values, &FitOptions::default())?;
    println!(
        "N={}   Location={:.2}   Scale={:.2}   Degrees of Freedom={:.2}   Shape={:.2}",
        fit.n, fit.location, fit.scale, fit.degree_of_freedom, fit.shape
    );
    Ok(fit)
}

/// Validate fit command arguments
fn validate_fit_args(args: &FitArgs) -> Result<(), Box<dyn Error>> {
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
    if args.threads == 0 {
        return Err("Error: Thread count cannot be 0".into());
    }
    Ok(())
}

#[derive(Args, Debug)]
pub struct FitArgs {
    /// Input feature x sample TSV file
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output directory for skew_t_pdf_fit_parameter.tsv
    #[arg(short = 'o', long = "output-dir")]
    pub output_dir: String,
    /// Pin the location parameter instead of fitting it
    #[arg(long = "fixed-location")]
    pub fixed_location: Option<f64>,
    /// Pin the scale parameter instead of fitting it
    #[arg(long = "fixed-scale")]
    pub fixed_scale: Option<f64>,
    /// Number of parallel jobs
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    pub threads: usize,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

pub fn fit_matrix_tsv(args: &FitArgs, logger: &mut crate::Logger) -> Result<(), Box<dyn Error>> {
    validate_fit_args(args)?;

    let start_time = Instant::now();

    logger.log("=== Contexture Fit Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!(
        "Runtime: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    ))?;
    logger.log(&format!("Input File: {}", args.input))?;
    logger.log(&format!("Output Directory: {}", args.output_dir))?;
    logger.log(&format!("Threads: {}", args.threads))?;
    logger.log("Starting skew-t fitting...")?;

    println!("[Loading data]");
    println!("    Matrix: {}", args.input);
    println!();

    let matrix = DataMatrix::read_tsv(Path::new(&args.input))?;

    println!("[Params]");
    println!("    Rows: {}.", matrix.n_rows());
    println!("    Threads: {}.", args.threads);
    println!();

    let options = FitOptions {
        fixed_location: args.fixed_location,
        fixed_scale: args.fixed_scale,
        ..FitOptions::default()
    };

    fit_skew_t_pdfs(
        &matrix,
        args.threads,
        &options,
        Some(Path::new(&args.output_dir)),
    )?;

    let elapsed = start_time.elapsed();
    println!("\r[Output]                           ");
    println!(
        "    Fit parameters: {}/skew_t_pdf_fit_parameter.tsv",
        args.output_dir
    );
    println!("{}", crate::progress::format_time_used(elapsed));

    logger.log(&format!(
        "Fitting completed, output directory: {}",
        args.output_dir
    ))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn impute_replaces_with_mean() {
        let (clean, n_bad) = impute_bad_values(&[1.0, f64::NAN, 3.0]).unwrap();
        assert_eq!(n_bad, 1);
        assert_relative_eq!(clean[1], 2.0);
        assert_eq!(clean.len(), 3);
    }

    #[test]
    fn impute_all_bad_errors() {
        let result = impute_bad_values(&[f64::NAN, f64::NAN]);
        assert!(matches!(result, Err(ContextError::AllValuesMissing)));
    }

    #[test]
    fn fit_is_deterministic() {
        let values = vec![0.1, 0.5, -0.3, 1.2, 0.9, -0.7, 0.4, 2.5, 0.2, -0.1];
        let a = fit_skew_t_pdf(&values, &FitOptions::default()).unwrap();
        let b = fit_skew_t_pdf(&values, &FitOptions::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fixed_location_is_respected() {
        let values = vec![0.1, 0.5, -0.3, 1.2, 0.9, -0.7, 0.4, 2.5, 0.2, -0.1];
        let options = FitOptions {
            fixed_location: Some(0.0),
            ..FitOptions::default()
        };
        let fit = fit_skew_t_pdf(&values, &options).unwrap();
        assert_eq!(fit.location, 0.0);
        assert!(fit.scale > 0.0);
        assert!(fit.degree_of_freedom > 0.0);
    }

    #[test]
    fn nelder_mead_finds_quadratic_minimum() {
        let objective = |theta: &[f64]| -> f64 {
            (theta[0] - 3.0).powi(2) + (theta[1] + 1.0).powi(2)
        };
        let best = nelder_mead(&objective, &[0.0, 0.0], 600, 1e-12);
        assert_relative_eq!(best[0], 3.0, epsilon = 1e-4);
        assert_relative_eq!(best[1], -1.0, epsilon = 1e-4);
    }
}
