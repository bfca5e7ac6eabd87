//! Formatted memory usage and diff reports.

use std::fmt;

use crate::baseline::{Baseline, CategoryDelta, CategoryUsage};
use crate::callsite;
use crate::record::MemoryCategory;

/// A point-in-time usage report, renderable via [`Display`](fmt::Display).
///
/// Byte amounts are scaled by the report's unit (bytes per printed unit).
#[derive(Clone, Debug)]
pub struct UsageReport {
    usage: Baseline,
    unit: usize,
    summary_only: bool,
}

impl UsageReport {
    pub(crate) fn new(usage: Baseline, unit: usize, summary_only: bool) -> Self {
        Self {
            usage,
            unit: unit.max(1),
            summary_only,
        }
    }

    /// Usage charged to one category, in bytes (unscaled).
    #[must_use]
    pub fn category(&self, category: MemoryCategory) -> CategoryUsage {
        self.usage.category(category)
    }

    /// Usage summed over all categories, in bytes (unscaled).
    #[must_use]
    pub fn total(&self) -> CategoryUsage {
        self.usage.total()
    }

    /// The number of loaded classes captured with the snapshot generation.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.usage.class_count()
    }

    /// Whether no memory at all is being tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total().is_empty()
    }
}

/// A report of per-category change against the latched baseline.
#[derive(Clone, Debug)]
pub struct DiffReport {
    deltas: [CategoryDelta; MemoryCategory::COUNT],
    unit: usize,
}

impl DiffReport {
    pub(crate) fn new(current: &Baseline, baseline: &Baseline, unit: usize) -> Self {
        Self {
            deltas: current.diff_from(baseline),
            unit: unit.max(1),
        }
    }

    /// The change in one category, in bytes (unscaled).
    #[must_use]
    pub fn category(&self, category: MemoryCategory) -> CategoryDelta {
        self.deltas[category.index()]
    }

    /// Whether nothing changed in any category.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.deltas.iter().all(CategoryDelta::is_zero)
    }
}

fn unit_suffix(unit: usize) -> &'static str {
    match unit {
        1 => "bytes",
        1024 => "KB",
        1_048_576 => "MB",
        1_073_741_824 => "GB",
        _ => "units",
    }
}

#[expect(
    clippy::integer_division,
    reason = "report amounts are rounded down to whole units on purpose"
)]
fn scale(bytes: u64, unit: usize) -> u64 {
    bytes / unit as u64
}

#[expect(
    clippy::integer_division,
    clippy::cast_possible_wrap,
    reason = "report amounts are rounded down to whole units on purpose; units are small"
)]
fn scale_signed(bytes: i64, unit: usize) -> i64 {
    bytes / unit as i64
}

// No API contract to test - output format is not guaranteed.
#[cfg_attr(test, mutants::skip)]
impl fmt::Display for UsageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            writeln!(f, "No native memory is being tracked.")?;
            return Ok(());
        }

        let suffix = unit_suffix(self.unit);
        let total = self.total();
        writeln!(
            f,
            "Native memory usage ({suffix}): reserved={}, committed={}",
            scale(total.reserved_bytes, self.unit),
            scale(total.committed_bytes, self.unit),
        )?;
        writeln!(f, "Classes: {}", self.class_count())?;
        writeln!(f)?;

        let name_width = MemoryCategory::ALL
            .iter()
            .map(|category| category.to_string().len())
            .max()
            .unwrap_or(0)
            .max("Category".len());

        writeln!(
            f,
            "| {:<name_width$} | {:>12} | {:>8} | {:>12} | {:>12} | {:>12} |",
            "Category", "Malloc", "Blocks", "Arena", "Reserved", "Committed",
        )?;

        for category in MemoryCategory::ALL {
            let usage = self.category(category);
            if usage.is_empty() {
                continue;
            }
            writeln!(
                f,
                "| {:<name_width$} | {:>12} | {:>8} | {:>12} | {:>12} | {:>12} |",
                category.to_string(),
                scale(usage.malloc_bytes, self.unit),
                usage.malloc_count,
                scale(usage.arena_bytes, self.unit),
                scale(usage.reserved_bytes, self.unit),
                scale(usage.committed_bytes, self.unit),
            )?;
        }

        if !self.summary_only && !self.usage.call_sites().is_empty() {
            writeln!(f)?;
            writeln!(f, "Malloc'd memory by call site:")?;
            for site in self.usage.call_sites() {
                writeln!(
                    f,
                    "  {}: {} {} in {} blocks",
                    callsite::decode(site.callsite),
                    scale(site.bytes, self.unit),
                    suffix,
                    site.count,
                )?;
            }
        }

        Ok(())
    }
}

// No API contract to test - output format is not guaranteed.
#[cfg_attr(test, mutants::skip)]
impl fmt::Display for DiffReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = unit_suffix(self.unit);

        if self.is_zero() {
            writeln!(f, "No change in native memory usage since baseline.")?;
            return Ok(());
        }

        writeln!(f, "Native memory usage change since baseline ({suffix}):")?;
        writeln!(f)?;

        for category in MemoryCategory::ALL {
            let delta = self.category(category);
            if delta.is_zero() {
                continue;
            }
            writeln!(
                f,
                "  {}: malloc {:+}, blocks {:+}, arena {:+}, reserved {:+}, committed {:+}",
                category,
                scale_signed(delta.malloc_bytes, self.unit),
                delta.malloc_count,
                scale_signed(delta.arena_bytes, self.unit),
                scale_signed(delta.reserved_bytes, self.unit),
                scale_signed(delta.committed_bytes, self.unit),
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(UsageReport: Send, Sync);
    assert_impl_all!(DiffReport: Send, Sync);

    #[test]
    fn empty_report_says_so() {
        let report = UsageReport::new(Baseline::default(), 1024, true);
        assert!(report.is_empty());
        assert!(report.to_string().contains("No native memory"));
    }

    #[test]
    fn zero_diff_says_so() {
        let first = Baseline::default();
        let second = Baseline::default();
        let diff = DiffReport::new(&second, &first, 1);
        assert!(diff.is_zero());
        assert!(diff.to_string().contains("No change"));
    }

    #[test]
    fn unit_suffixes() {
        assert_eq!(unit_suffix(1), "bytes");
        assert_eq!(unit_suffix(1024), "KB");
        assert_eq!(unit_suffix(1_048_576), "MB");
        assert_eq!(unit_suffix(12345), "units");
    }

    #[test]
    fn scaling_rounds_down() {
        assert_eq!(scale(2047, 1024), 1);
        assert_eq!(scale(2048, 1024), 2);
        assert_eq!(scale_signed(-2047, 1024), -1);
    }
}
