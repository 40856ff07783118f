use std::{fs::File, io::Read as _};

use tally_core::Metric;

const STATUS_PATH: &str = "/proc/self/status";
const STAT_PATH: &str = "/proc/self/stat";

enum Unit {
    Kilobytes,
    Count,
}

// Keys in `/proc/self/status`, and the gauge each one is reported as.
const STATUS_FIELDS: &[(&str, &str, Unit)] = &[
    ("VmPeak", "PeakVirtualMemoryBytes", Unit::Kilobytes),
    ("VmSize", "VirtualMemoryBytes", Unit::Kilobytes),
    ("VmHWM", "PeakResidentMemoryBytes", Unit::Kilobytes),
    ("VmRSS", "ResidentMemoryBytes", Unit::Kilobytes),
    ("VmData", "DataSegmentBytes", Unit::Kilobytes),
    ("VmStk", "StackBytes", Unit::Kilobytes),
    ("Threads", "Threads", Unit::Count),
    ("voluntary_ctxt_switches", "VoluntaryContextSwitches", Unit::Count),
    ("nonvoluntary_ctxt_switches", "InvoluntaryContextSwitches", Unit::Count),
];

// Fields of `/proc/self/stat`, numbered from one as in proc(5).
const STAT_MINFLT: usize = 10;
const STAT_MAJFLT: usize = 12;
const STAT_UTIME: usize = 14;
const STAT_STIME: usize = 15;

/// Reads process statistics from procfs.
pub struct ProcfsReader {
    buf: String,
    clock_ticks_per_sec: Option<f64>,
}

impl ProcfsReader {
    pub fn new() -> Self {
        Self {
            buf: String::with_capacity(4096),
            clock_ticks_per_sec: clock_ticks_per_sec(),
        }
    }

    /// Appends a gauge for every statistic that could be read.
    pub fn collect(&mut self, metrics: &mut Vec<Metric>) {
        if read_into(STATUS_PATH, &mut self.buf) {
            parse_status(&self.buf, metrics);
        }

        if read_into(STAT_PATH, &mut self.buf) {
            parse_stat(&self.buf, self.clock_ticks_per_sec, metrics);
        }
    }
}

fn read_into(path: &str, buf: &mut String) -> bool {
    buf.clear();
    match File::open(path) {
        Ok(mut file) => file.read_to_string(buf).is_ok(),
        Err(_) => false,
    }
}

fn clock_ticks_per_sec() -> Option<f64> {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        None
    } else {
        Some(ticks as f64)
    }
}

fn parse_status(status: &str, metrics: &mut Vec<Metric>) {
    for line in status.lines() {
        let Some((key, raw_value)) = line.split_once(':') else {
            continue;
        };

        let Some((_, name, unit)) = STATUS_FIELDS.iter().find(|(field, _, _)| *field == key) else {
            continue;
        };

        // Values look like `  123456 kB` or `\t4`.
        let Some(value) = raw_value.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) else {
            continue;
        };

        let value = match unit {
            Unit::Kilobytes => value.saturating_mul(1024),
            Unit::Count => value,
        };
        metrics.push(Metric::gauge(*name, value as f64));
    }
}

fn parse_stat(stat: &str, clock_ticks_per_sec: Option<f64>, metrics: &mut Vec<Metric>) {
    // The command name is in parentheses and may itself contain spaces or parentheses, so fields are only split after
    // the last closing parenthesis. The first field after it is field 3.
    let Some((_, rest)) = stat.rsplit_once(')') else {
        return;
    };
    let fields = rest.split_whitespace().collect::<Vec<_>>();
    let field = |n: usize| fields.get(n - 3).and_then(|v| v.parse::<u64>().ok());

    if let Some(minflt) = field(STAT_MINFLT) {
        metrics.push(Metric::gauge("MinorPageFaults", minflt as f64));
    }
    if let Some(majflt) = field(STAT_MAJFLT) {
        metrics.push(Metric::gauge("MajorPageFaults", majflt as f64));
    }

    let Some(ticks_per_sec) = clock_ticks_per_sec else {
        return;
    };
    if let Some(utime) = field(STAT_UTIME) {
        metrics.push(Metric::gauge("UserCpuSeconds", utime as f64 / ticks_per_sec));
    }
    if let Some(stime) = field(STAT_STIME) {
        metrics.push(Metric::gauge("SystemCpuSeconds", stime as f64 / ticks_per_sec));
    }
}
