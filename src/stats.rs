use log::info;

/// Share of the shortest and longest articles averaged separately in the report.
const TAIL_FRACTION: f64 = 0.10;

/// Tails are only reported once there are at least this many articles.
const MIN_COUNT_FOR_TAILS: usize = 10;

// Summary of article lengths (in characters) for one collection of texts.
#[derive(Clone, Debug, PartialEq)]
pub struct LengthStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: usize,
    pub max: usize,

    // mean of the `tail_size` shortest and longest lengths, when there are enough articles
    pub tails: Option<TailStats>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TailStats {
    pub tail_size: usize,
    pub shortest_mean: f64,
    pub longest_mean: f64,
}

impl LengthStats {
    /// Returns `None` for an empty collection.
    pub fn from_lengths(mut lengths: Vec<usize>) -> Option<Self> {
        if lengths.is_empty() {
            return None;
        }
        lengths.sort_unstable();
        let count = lengths.len();
        let mean = mean_of(&lengths);
        let median = if count % 2 == 1 {
            lengths[count / 2] as f64
        } else {
            (lengths[count / 2 - 1] + lengths[count / 2]) as f64 / 2.0
        };

        let tails = if count >= MIN_COUNT_FOR_TAILS {
            let tail_size = ((TAIL_FRACTION * count as f64) as usize).max(1);
            Some(TailStats {
                tail_size,
                shortest_mean: mean_of(&lengths[..tail_size]),
                longest_mean: mean_of(&lengths[count - tail_size..]),
            })
        } else {
            None
        };

        Some(Self {
            count,
            mean,
            median,
            min: lengths[0],
            max: lengths[count - 1],
            tails,
        })
    }

    // writes the report to the log, labelling it with what was measured
    pub fn log_report(&self, what: &str) {
        info!("Length statistics for {} (characters):", what);
        info!("  Articles: {}", self.count);
        info!("  Mean length: {:.2}", self.mean);
        info!("  Median length: {}", self.median);
        info!("  Shortest: {} ; Longest: {}", self.min, self.max);
        match &self.tails {
            Some(tails) => {
                info!(
                    "  Mean of the {} ({:.0}%) shortest: {:.2}",
                    tails.tail_size,
                    TAIL_FRACTION * 100.0,
                    tails.shortest_mean
                );
                info!(
                    "  Mean of the {} ({:.0}%) longest: {:.2}",
                    tails.tail_size,
                    TAIL_FRACTION * 100.0,
                    tails.longest_mean
                );
            }
            None => info!(
                "  Not enough articles ({}) for shortest/longest {:.0}% statistics.",
                self.count,
                TAIL_FRACTION * 100.0
            ),
        }
    }
}

fn mean_of(values: &[usize]) -> f64 {
    values.iter().map(|v| *v as f64).sum::<f64>() / values.len() as f64
}
