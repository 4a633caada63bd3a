//! Parsing of lcov tracefiles as produced by `llvm-cov export
//! -format=lcov -summary-only`, and the coverage table printed after a
//! coverage run.

use std::io::{self, BufRead, Write};
use tracing::debug;

/// Hit and found counters of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counter {
    pub hit: u64,
    pub found: u64,
}

impl Counter {
    /// Percentage covered, 100 when there is nothing to cover.
    pub fn percent(&self) -> f64 {
        if self.found == 0 {
            100.0
        } else {
            self.hit as f64 * 100.0 / self.found as f64
        }
    }

    fn add(&mut self, other: Counter) {
        self.hit += other.hit;
        self.found += other.found;
    }

    fn cell(&self) -> String {
        format!("{} / {} ({:.1}%)", self.hit, self.found, self.percent())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileCoverage {
    pub path: String,
    pub functions: Counter,
    pub lines: Counter,
    pub branches: Counter,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoverageSummary {
    pub files: Vec<FileCoverage>,
}

impl CoverageSummary {
    pub fn total(&self) -> FileCoverage {
        let mut total = FileCoverage {
            path: "Total".to_string(),
            ..Default::default()
        };
        for file in &self.files {
            total.functions.add(file.functions);
            total.lines.add(file.lines);
            total.branches.add(file.branches);
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Writes one row per source file plus a total row.
    pub fn write_table<W: Write>(&self, out: &mut W) -> io::Result<()> {
        const HEADER: [&str; 4] = [
            "File",
            "Functions Hit/Found",
            "Lines Hit/Found",
            "Branches Hit/Found",
        ];

        let cells = |f: &FileCoverage| {
            [
                f.path.clone(),
                f.functions.cell(),
                f.lines.cell(),
                f.branches.cell(),
            ]
        };
        let rows: Vec<[String; 4]> = self.files.iter().map(cells).collect();
        let total_row = cells(&self.total());

        let mut widths = HEADER.map(str::len);
        for row in rows.iter().chain(std::iter::once(&total_row)) {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }

        let line = |cells: [&str; 4]| {
            format!(
                "{:<w0$} | {:>w1$} | {:>w2$} | {:>w3$}",
                cells[0],
                cells[1],
                cells[2],
                cells[3],
                w0 = widths[0],
                w1 = widths[1],
                w2 = widths[2],
                w3 = widths[3],
            )
        };
        let separator = "-".repeat(widths.iter().sum::<usize>() + 9);

        writeln!(out, "{}", line(HEADER))?;
        writeln!(out, "{separator}")?;
        for row in &rows {
            writeln!(out, "{}", line(row.each_ref().map(String::as_str)))?;
        }
        writeln!(out, "{separator}")?;
        writeln!(out, "{}", line(total_row.each_ref().map(String::as_str)))
    }
}

/// Reads the summary records of an lcov tracefile. Per-line records
/// (`DA`, `FN`, ...) and unknown records are ignored.
pub fn parse_lcov<R: BufRead>(reader: R) -> io::Result<CoverageSummary> {
    let mut summary = CoverageSummary::default();
    let mut current: Option<FileCoverage> = None;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line == "end_of_record" {
            if let Some(file) = current.take() {
                summary.files.push(file);
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key == "SF" {
            current = Some(FileCoverage {
                path: value.to_string(),
                ..Default::default()
            });
            continue;
        }
        let Some(file) = current.as_mut() else {
            continue;
        };
        let counter = match key {
            "FNF" | "FNH" => &mut file.functions,
            "LF" | "LH" => &mut file.lines,
            "BRF" | "BRH" => &mut file.branches,
            _ => continue,
        };
        let Ok(count) = value.parse::<u64>() else {
            debug!("Ignoring malformed lcov record {:?}", line);
            continue;
        };
        if key.ends_with('F') {
            counter.found = count;
        } else {
            counter.hit = count;
        }
    }

    // tolerate a missing final end_of_record
    if let Some(file) = current {
        summary.files.push(file);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\
SF:/project/src/explore_me.cpp
FN:5,_Z9exploreMeiiNSt7__cxx1112basic_stringIcSt11char_traitsIcESaIcEEE
FNF:2
FNH:1
DA:5,3
LF:10
LH:7
BRF:4
BRH:3
end_of_record
SF:/project/src/util.cpp
FNF:1
FNH:1
LF:4
LH:4
BRF:0
BRH:0
end_of_record
";

    #[test]
    fn parses_summary_records() {
        let summary = parse_lcov(REPORT.as_bytes()).unwrap();
        assert_eq!(summary.files.len(), 2);

        let first = &summary.files[0];
        assert_eq!(first.path, "/project/src/explore_me.cpp");
        assert_eq!(first.functions, Counter { hit: 1, found: 2 });
        assert_eq!(first.lines, Counter { hit: 7, found: 10 });
        assert_eq!(first.branches, Counter { hit: 3, found: 4 });

        let total = summary.total();
        assert_eq!(total.functions, Counter { hit: 2, found: 3 });
        assert_eq!(total.lines, Counter { hit: 11, found: 14 });
        assert_eq!(total.branches.percent(), 75.0);
    }

    #[test]
    fn empty_counters_are_fully_covered() {
        assert_eq!(Counter::default().percent(), 100.0);
    }

    #[test]
    fn tolerates_missing_end_of_record_and_junk() {
        let summary = parse_lcov("TN:\nLF:3\nSF:a.c\nLF:x\nLH:2\n".as_bytes()).unwrap();
        assert_eq!(summary.files.len(), 1);
        assert_eq!(summary.files[0].lines, Counter { hit: 2, found: 0 });
    }

    #[test]
    fn table_has_a_row_per_file_and_a_total() {
        let summary = parse_lcov(REPORT.as_bytes()).unwrap();
        let mut out = Vec::new();
        summary.write_table(&mut out).unwrap();
        let table = String::from_utf8(out).unwrap();

        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with("File"));
        assert!(lines[2].starts_with("/project/src/explore_me.cpp"));
        assert!(lines[2].contains("1 / 2 (50.0%)"));
        assert!(lines[5].starts_with("Total"));
        assert!(lines[5].contains("11 / 14 (78.6%)"));
    }
}
