//! Deterministic rendering of treatment-plan lines.
//!
//! The rendering is the identity the cache hashes, so it must be stable:
//! lines are ordered by line id regardless of fetch order, and amounts are
//! formatted with fixed precision.

use sha2::{Digest, Sha256};

use dent_model::TreatmentPlanLine;

/// Render plan lines as the multi-line text stored on the deal.
///
/// One line per plan entry, `{count}× {name} — {line total}`, followed by
/// a footer with the grand total.
pub fn render_plan(lines: &[TreatmentPlanLine]) -> String {
    let mut sorted: Vec<&TreatmentPlanLine> = lines.iter().collect();
    sorted.sort_by_key(|l| l.line_id);

    let mut out = String::new();
    let mut grand_total = 0.0;
    for line in sorted {
        let total = line.total();
        grand_total += total;
        out.push_str(&format!(
            "{}× {} — {}\n",
            line.count,
            line.name,
            format_amount(total)
        ));
    }
    out.push_str(&format!("Итого: {}", format_amount(grand_total)));
    out
}

/// Stable hash of a rendering, hex-encoded.
pub fn plan_hash(rendered: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rendered.as_bytes());
    hex::encode(hasher.finalize())
}

fn format_amount(v: f64) -> String {
    format!("{v:.2}")
}
