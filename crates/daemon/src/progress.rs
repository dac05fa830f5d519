use std::sync::LazyLock;
use regex::Regex;

static OUT_TIME_US_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^out_time_(?:us|ms)=(-?\d+)\s*$").expect("invalid out_time_us regex"));
static OUT_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^out_time=(-?)(\d+):(\d{1,2}):(\d{1,2}(?:\.\d+)?)\s*$").expect("invalid out_time regex"));
static OUT_TIME_NA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^out_time(?:_us|_ms)?=N/A\s*$").expect("invalid out_time N/A regex"));
static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^progress=(continue|end)\s*$").expect("invalid progress regex"));

/// What a single line of transcoder output says about progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressSignal {
    /// Seconds of output written so far
    Elapsed(f64),
    /// A well-formed progress block with no usable position yet
    Heartbeat,
    /// The transcoder reported it has finished writing
    Finished,
}

/// Turns transcoder output lines into progress signals.
///
/// Lines that carry no usable information return `None`; they must never be
/// treated as an error. Any signal, `Heartbeat` included, counts as a sign
/// of life for the stall timeout.
pub trait ProgressParser: Send {
    fn parse_line(&mut self, line: &str) -> Option<ProgressSignal>;
}

/// Parser for ffmpeg's `-progress pipe:1` key=value stream.
///
/// ffmpeg writes `out_time_us`, `out_time_ms` (also microseconds, despite
/// the name) and `out_time` for every block, then `progress=continue` or
/// `progress=end`. Negative values show up until the first output frame,
/// which for a late trim can take a long time. They, `N/A` positions and
/// `progress=continue` are reported as heartbeats.
#[derive(Debug, Default, Clone)]
pub struct FfmpegProgressParser;

impl ProgressParser for FfmpegProgressParser {
    fn parse_line(&mut self, line: &str) -> Option<ProgressSignal> {
        let line = line.trim();

        if let Some(caps) = OUT_TIME_US_RE.captures(line) {
            let micros: i64 = caps[1].parse().ok()?;
            if micros < 0 {
                return Some(ProgressSignal::Heartbeat);
            }
            return Some(ProgressSignal::Elapsed(micros as f64 / 1_000_000.0));
        }

        if let Some(caps) = OUT_TIME_RE.captures(line) {
            if &caps[1] == "-" {
                return Some(ProgressSignal::Heartbeat);
            }
            let hours: f64 = caps[2].parse().ok()?;
            let minutes: f64 = caps[3].parse().ok()?;
            let seconds: f64 = caps[4].parse().ok()?;
            return Some(ProgressSignal::Elapsed(hours * 3600.0 + minutes * 60.0 + seconds));
        }

        if OUT_TIME_NA_RE.is_match(line) {
            return Some(ProgressSignal::Heartbeat);
        }

        if let Some(caps) = PROGRESS_RE.captures(line) {
            return Some(if &caps[1] == "end" {
                ProgressSignal::Finished
            } else {
                ProgressSignal::Heartbeat
            });
        }

        None
    }
}

/// Percent of `total` covered by `elapsed`, clamped to [0, 100].
///
/// Returns `None` when the total is unknown or not positive.
pub fn percent_complete(elapsed: f64, total: f64) -> Option<f64> {
    if !total.is_finite() || total <= 0.0 || !elapsed.is_finite() {
        return None;
    }
    Some((elapsed / total * 100.0).clamp(0.0, 100.0))
}

/// Tracks the last reported percent so only forward movement is emitted
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_secs: f64,
    last_percent: f64,
}

impl ProgressTracker {
    pub fn new(total_secs: f64) -> Self {
        ProgressTracker {
            total_secs,
            last_percent: 0.0,
        }
    }

    pub fn last_percent(&self) -> f64 {
        self.last_percent
    }

    /// Fold a signal in; returns the new percent if it moved forward
    pub fn observe(&mut self, signal: ProgressSignal) -> Option<f64> {
        let percent = match signal {
            ProgressSignal::Elapsed(secs) => percent_complete(secs, self.total_secs)?,
            ProgressSignal::Heartbeat => return None,
            ProgressSignal::Finished => 100.0,
        };
        if percent > self.last_percent {
            self.last_percent = percent;
            Some(percent)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Captured from `ffmpeg -progress pipe:1` trimming a 50s output
    const SAMPLE: &str = "\
frame=0
fps=0.00
stream_0_0_q=0.0
bitrate=N/A
total_size=44
out_time_us=-9223372036854775807
out_time_ms=-9223372036854775807
out_time=-2562047788:00:54.775807
dup_frames=0
drop_frames=0
speed=N/A
progress=continue
frame=301
fps=0.00
stream_0_0_q=28.0
bitrate= 212.5kbits/s
total_size=262192
out_time_us=9870000
out_time_ms=9870000
out_time=00:00:09.870000
dup_frames=0
drop_frames=0
speed=19.7x
progress=continue
frame=1500
out_time_us=50000000
out_time_ms=50000000
out_time=00:00:50.000000
speed=21.1x
progress=end
";

    fn run_sample(total: f64) -> Vec<f64> {
        let mut parser = FfmpegProgressParser;
        let mut tracker = ProgressTracker::new(total);
        SAMPLE
            .lines()
            .filter_map(|l| parser.parse_line(l))
            .filter_map(|s| tracker.observe(s))
            .collect()
    }

    #[test]
    fn test_sample_output_progress() {
        let emitted = run_sample(50.0);
        assert_eq!(emitted.len(), 2);
        assert!((emitted[0] - 19.74).abs() < 1e-9);
        assert_eq!(emitted[1], 100.0);
    }

    #[test]
    fn test_startup_values_are_heartbeats() {
        let mut parser = FfmpegProgressParser;
        for line in [
            "out_time_us=-9223372036854775807",
            "out_time=-2562047788:00:54.775807",
            "out_time_us=N/A",
            "out_time=N/A",
            "progress=continue",
        ] {
            assert_eq!(parser.parse_line(line), Some(ProgressSignal::Heartbeat), "{:?}", line);
        }

        let mut tracker = ProgressTracker::new(50.0);
        tracker.observe(ProgressSignal::Elapsed(10.0));
        assert_eq!(tracker.observe(ProgressSignal::Heartbeat), None);
        assert_eq!(tracker.last_percent(), 20.0);
    }

    #[test]
    fn test_out_time_clock_format() {
        let mut parser = FfmpegProgressParser;
        assert_eq!(
            parser.parse_line("out_time=01:02:03.500000"),
            Some(ProgressSignal::Elapsed(3723.5))
        );
    }

    #[test]
    fn test_garbage_lines_ignored() {
        let mut parser = FfmpegProgressParser;
        for line in ["", "bitrate=N/A", "out_time_us=abc", "progress=", "random garbage"] {
            assert_eq!(parser.parse_line(line), None, "{:?}", line);
        }
    }

    #[test]
    fn test_percent_clamped() {
        assert_eq!(percent_complete(60.0, 50.0), Some(100.0));
        assert_eq!(percent_complete(-1.0, 50.0), Some(0.0));
        assert_eq!(percent_complete(10.0, 0.0), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Emitted values are strictly increasing and stay within [0, 100]
        #[test]
        fn test_tracker_is_monotonic(
            elapsed in prop::collection::vec(-10.0f64..200.0, 0..40),
            total in 1.0f64..150.0,
        ) {
            let mut tracker = ProgressTracker::new(total);
            let mut last = 0.0;
            for e in elapsed {
                if let Some(p) = tracker.observe(ProgressSignal::Elapsed(e)) {
                    prop_assert!(p > last);
                    prop_assert!((0.0..=100.0).contains(&p));
                    last = p;
                }
            }
            prop_assert_eq!(tracker.last_percent(), last);
        }
    }
}
