/// Row-progress reporting for matrix-level builds. Workers print a line per
/// reporting interval instead of sharing a counter, so parallel chunks never
/// contend on state.
pub struct RowProgress {
    n_rows: usize,
    n_per_log: usize,
}

impl RowProgress {
    /// Report roughly every 10% of rows (at least every row for tiny inputs).
    pub fn every_tenth(n_rows: usize) -> Self {
        Self {
            n_rows,
            n_per_log: (n_rows / 10).max(1),
        }
    }

    /// Print the `(i/n) label ...` line when row `i` starts an interval.
    pub fn report(&self, i: usize, label: &str) {
        if i % self.n_per_log == 0 {
            println!("({}/{}) {} ...", i + 1, self.n_rows, label);
        }
    }
}

/// Format time as "xx h xx m xx.xxx s" format
pub fn format_time_used(elapsed: std::time::Duration) -> String {
    let total_secs = elapsed.as_secs_f64();
    let hours = (total_secs / 3600.0) as u64;
    let minutes = ((total_secs % 3600.0) / 60.0) as u64;
    let seconds = total_secs % 60.0;

    if hours > 0 {
        format!("[Time used] {:02} h {:02} m {:05.3} s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("[Time used] {:02} m {:05.3} s", minutes, seconds)
    } else {
        format!("[Time used] {:05.3} s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn format_time_used_picks_the_right_unit() {
        assert_eq!(
            format_time_used(Duration::from_secs_f64(1.5)),
            "[Time used] 1.500 s"
        );
        assert_eq!(
            format_time_used(Duration::from_secs(61)),
            "[Time used] 01 m 01.000 s"
        );
        assert_eq!(
            format_time_used(Duration::from_secs(3661)),
            "[Time used] 01 h 01 m 01.000 s"
        );
    }

    #[test]
    fn progress_interval_is_at_least_one() {
        let progress = RowProgress::every_tenth(3);
        assert_eq!(progress.n_per_log, 1);
        let progress = RowProgress::every_tenth(100);
        assert_eq!(progress.n_per_log, 10);
    }
}
