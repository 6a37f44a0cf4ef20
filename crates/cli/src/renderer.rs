use std::io::{self, Write};
use std::sync::Arc;

use callprof_core::presentation::{ExportRow, export_rows_to_depth};
use callprof_core::views::{FlatDiff, FlatProfile};
use callprof_core::{CpuSnapshot, TreeNode};

pub fn format_time(us: f64) -> String {
    if us.abs() >= 1_000_000.0 {
        format!("{:.2}s", us / 1_000_000.0)
    } else if us.abs() >= 1_000.0 {
        format!("{:.1}ms", us / 1_000.0)
    } else {
        format!("{:.0}µs", us)
    }
}

fn format_delta(us: i64) -> String {
    let sign = if us > 0 { "+" } else { "" };
    format!("{sign}{}", format_time(us as f64))
}

pub fn write_summary(out: &mut impl Write, snapshot: &CpuSnapshot) -> io::Result<()> {
    writeln!(
        out,
        "{} thread(s), {} method(s), {} taken",
        snapshot.threads().len(),
        snapshot.methods().len().saturating_sub(1),
        format_time(snapshot.time_taken() as f64 * 1_000.0),
    )?;
    for t in snapshot.threads() {
        writeln!(
            out,
            "  [{}] {:<24} net {:>10}  gross {:>10}  {} invocation(s)",
            t.id,
            t.name,
            format_time(t.times.net_time[0] as f64),
            format_time(t.times.pure_time[0] as f64),
            t.times.total_invocations,
        )?;
    }
    Ok(())
}

fn write_rows(out: &mut impl Write, rows: &[ExportRow], signed: bool) -> io::Result<()> {
    for row in rows {
        let time = if signed {
            format_delta(row.total_time0)
        } else {
            format_time(row.total_time0 as f64)
        };
        writeln!(
            out,
            "{:indent$}{}  {:.1}%  {}  ({} call{})",
            "",
            row.name,
            row.percent,
            time,
            row.n_calls,
            if row.n_calls.abs() == 1 { "" } else { "s" },
            indent = row.depth * 2,
        )?;
    }
    Ok(())
}

/// Indented tree, one node per line. Diff trees print signed times.
pub fn write_tree<N: TreeNode>(
    out: &mut impl Write,
    root: &Arc<N>,
    max_depth: usize,
    signed: bool,
    json: bool,
) -> io::Result<()> {
    let rows = export_rows_to_depth(root, max_depth);
    if json {
        serde_json::to_writer_pretty(&mut *out, &rows)?;
        return writeln!(out);
    }
    write_rows(out, &rows, signed)
}

pub fn write_flat(out: &mut impl Write, flat: &FlatProfile, limit: usize, json: bool) -> io::Result<()> {
    let rows: Vec<_> = flat.rows().take(limit).collect();
    if json {
        serde_json::to_writer_pretty(&mut *out, &rows)?;
        return writeln!(out);
    }
    writeln!(
        out,
        "{:>10} {:>10} {:>7} {:>8}  method",
        "self", "total", "%", "calls"
    )?;
    for row in rows {
        writeln!(
            out,
            "{:>10} {:>10} {:>6.1}% {:>8}  {}",
            format_time(row.self_time[0] as f64),
            format_time(row.total_time[0] as f64),
            row.percent,
            row.n_invocations,
            row.name,
        )?;
    }
    Ok(())
}

pub fn write_flat_diff(out: &mut impl Write, diff: &FlatDiff, limit: usize, json: bool) -> io::Result<()> {
    let mut rows: Vec<_> = diff.rows().iter().filter(|r| r.self_time != [0; 2] || r.n_invocations != 0).collect();
    rows.sort_by(|a, b| b.self_time[0].abs().cmp(&a.self_time[0].abs()).then_with(|| a.name.cmp(&b.name)));
    rows.truncate(limit);
    if json {
        serde_json::to_writer_pretty(&mut *out, &rows)?;
        return writeln!(out);
    }
    if rows.is_empty() {
        return writeln!(out, "no differences");
    }
    for row in rows {
        writeln!(
            out,
            "{:>10} {:>10} {:>+8}  {}",
            format_delta(row.self_time[0]),
            format_delta(row.total_time[0]),
            row.n_invocations,
            row.name,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_units() {
        assert_eq!(format_time(12.0), "12µs");
        assert_eq!(format_time(2_500.0), "2.5ms");
        assert_eq!(format_time(3_000_000.0), "3.00s");
        assert_eq!(format_delta(-2_500), "-2.5ms");
        assert_eq!(format_delta(40), "+40µs");
    }

    #[test]
    fn rows_are_indented_by_depth() {
        let rows = vec![
            ExportRow {
                depth: 0,
                name: "main".into(),
                percent: 100.0,
                total_time0: 210,
                n_calls: 1,
            },
            ExportRow {
                depth: 1,
                name: "app.Svc.b".into(),
                percent: 95.2,
                total_time0: 200,
                n_calls: 2,
            },
        ];
        let mut out = Vec::new();
        write_rows(&mut out, &rows, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "main  100.0%  210µs  (1 call)\n  app.Svc.b  95.2%  200µs  (2 calls)\n");
    }
}
