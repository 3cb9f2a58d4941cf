//! Pure projection of presence state into renderable overlay cursors.
//!
//! No networking, no side effects: a function of (presence snapshot,
//! viewport rect). The host recomputes on snapshot change, viewport
//! resize, and viewport scroll. Entries outside the viewport are dropped,
//! not clamped — an off-screen collaborator simply has no cursor.
//!
//! Exact text-to-pixel mapping belongs to the document renderer; when a
//! record carries no pixel fix, [`approximate_anchor_y`] estimates a
//! vertical offset from the character offset. The estimate only needs to
//! be stable and monotonic in the anchor, which is also enough to order
//! comment cards down the margin.

use uuid::Uuid;

use crate::comments::{Anchor, Comment};
use crate::presence::PresenceRecord;

/// Viewport-relative bounding box of the document surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Layout approximation knobs. The single override point for hosts that
/// can measure text exactly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceMetrics {
    pub chars_per_line: usize,
    pub line_height: f32,
}

impl Default for SurfaceMetrics {
    fn default() -> Self {
        Self {
            chars_per_line: 80,
            line_height: 24.0,
        }
    }
}

/// Estimate the vertical offset of a character offset within the document
/// surface. Monotonic in `offset`; deliberately not pixel-perfect.
pub fn approximate_anchor_y(offset: usize, metrics: &SurfaceMetrics) -> f32 {
    (offset / metrics.chars_per_line.max(1)) as f32 * metrics.line_height
}

/// One renderable remote cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorSprite {
    pub participant_id: Uuid,
    /// Overlay coordinates, relative to the viewport origin.
    pub x: f32,
    pub y: f32,
    pub label: String,
    pub is_editing: bool,
}

/// Project remote presence records into overlay cursors clipped to the
/// viewport.
pub fn project_cursors<'a>(
    participants: impl IntoIterator<Item = &'a PresenceRecord>,
    viewport: Rect,
    metrics: &SurfaceMetrics,
) -> Vec<CursorSprite> {
    participants
        .into_iter()
        .filter_map(|record| {
            let cursor = record.cursor?;
            let (x, y) = match cursor.screen {
                Some((sx, sy)) => (sx - viewport.x, sy - viewport.y),
                None => (
                    0.0,
                    approximate_anchor_y(cursor.anchor_start, metrics) - viewport.y,
                ),
            };
            if x < 0.0 || x > viewport.width || y < 0.0 || y > viewport.height {
                return None;
            }
            Some(CursorSprite {
                participant_id: record.participant_id,
                x,
                y,
                label: record.display_name.clone(),
                is_editing: record.is_editing,
            })
        })
        .collect()
}

/// Vertical margin offsets for comment cards, ordered by anchor start.
/// Stable and monotonic; the host spaces overlapping cards itself.
pub fn comment_card_offsets(comments: &[Comment], metrics: &SurfaceMetrics) -> Vec<(Uuid, f32)> {
    let mut offsets: Vec<(Uuid, f32)> = comments
        .iter()
        .map(|c| (c.id, approximate_anchor_y(c.anchor.range_start, metrics)))
        .collect();
    offsets.sort_by(|a, b| a.1.total_cmp(&b.1));
    offsets
}

/// Document renderer boundary, consumed at comment-creation and
/// cursor-broadcast time.
pub trait DocumentSurface: Send + Sync {
    /// Current viewport-relative bounding box of the surface.
    fn viewport(&self) -> Rect;
    /// Resolve the user's current text selection, if any.
    fn resolve_selection(&self) -> Option<Anchor>;
}
