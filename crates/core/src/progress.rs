//! Progress snapshot type and text rendering.

use serde::Serialize;

/// Width of the rendered progress bar in cells.
const BAR_CELLS: u32 = 10;

/// One `(current_step, total_steps)` update for a job in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub current: u32,
    pub total: u32,
}

impl ProgressSnapshot {
    pub fn new(current: u32, total: u32) -> Self {
        Self { current, total }
    }

    pub fn percent(&self) -> u32 {
        percent(self.current, self.total)
    }
}

/// Completion percentage, `0` when `total` is zero and never above `100`.
pub fn percent(current: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    ((u64::from(current) * 100) / u64::from(total)).min(100) as u32
}

/// Render a two-line progress message:
///
/// ```text
/// ⏳ Generating: [█████░░░░░] 50%
/// Step 5/10
/// ```
pub fn render_progress(current: u32, total: u32) -> String {
    let pct = percent(current, total);
    let filled = pct / BAR_CELLS;
    let bar: String = (0..BAR_CELLS)
        .map(|i| if i < filled { '█' } else { '░' })
        .collect();
    format!("⏳ Generating: [{bar}] {pct}%\nStep {current}/{total}")
}
