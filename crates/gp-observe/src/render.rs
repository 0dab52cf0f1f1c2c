//! Prometheus text exposition rendering.

use std::fmt::Write;

use crate::metrics::{Counter, Gauge, Histogram, LabeledCounter};

/// Write a single counter metric with HELP and TYPE annotations.
pub fn write_counter(buf: &mut String, name: &str, help: &str, counter: &Counter) {
    let _ = writeln!(buf, "# HELP {name} {help}");
    let _ = writeln!(buf, "# TYPE {name} counter");
    let _ = writeln!(buf, "{name} {}", counter.get());
    buf.push('\n');
}

/// Write a gauge metric with HELP and TYPE annotations.
pub fn write_gauge(buf: &mut String, name: &str, help: &str, gauge: &Gauge) {
    let _ = writeln!(buf, "# HELP {name} {help}");
    let _ = writeln!(buf, "# TYPE {name} gauge");
    let _ = writeln!(buf, "{name} {}", gauge.get());
    buf.push('\n');
}

/// Write a counter family with one label dimension.
pub fn write_labeled_counter(
    buf: &mut String,
    name: &str,
    help: &str,
    label: &str,
    counter: &LabeledCounter,
) {
    let _ = writeln!(buf, "# HELP {name} {help}");
    let _ = writeln!(buf, "# TYPE {name} counter");
    for (value, count) in counter.snapshot() {
        let escaped = escape_label_value(&value);
        let _ = writeln!(buf, "{name}{{{label}=\"{escaped}\"}} {count}");
    }
    buf.push('\n');
}

/// Write a histogram in the standard `_bucket`/`_sum`/`_count` form.
pub fn write_histogram(buf: &mut String, name: &str, help: &str, histogram: &Histogram) {
    let _ = writeln!(buf, "# HELP {name} {help}");
    let _ = writeln!(buf, "# TYPE {name} histogram");
    for (bound, count) in histogram.cumulative() {
        if bound.is_infinite() {
            let _ = writeln!(buf, "{name}_bucket{{le=\"+Inf\"}} {count}");
        } else {
            let _ = writeln!(buf, "{name}_bucket{{le=\"{bound}\"}} {count}");
        }
    }
    let _ = writeln!(buf, "{name}_sum {}", histogram.sum());
    let _ = writeln!(buf, "{name}_count {}", histogram.count());
    buf.push('\n');
}

/// Escape a Prometheus label value per the text exposition format.
///
/// Backslash, double-quote, and newline must be escaped so a crafted
/// label value cannot inject metric lines.
pub fn escape_label_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out
}
