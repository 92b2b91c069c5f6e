//! Rectangular selections over the `(row, pixel)` grid and bounded-size
//! traversal of them.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default pixel budget per chunk for spectrum queries.
pub const DEFAULT_CHUNK_PIXELS: usize = 16_384;

/// Half-open rectangle: rows `y0..y1`, pixels `x0..x1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub y0: usize,
    pub y1: usize,
    pub x0: usize,
    pub x1: usize,
}

impl Rect {
    #[must_use]
    pub fn new(y0: usize, y1: usize, x0: usize, x1: usize) -> Self {
        Self { y0, y1, x0, x1 }
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.y1.saturating_sub(self.y0)
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.x1.saturating_sub(self.x0)
    }

    #[must_use]
    pub fn npixels(&self) -> usize {
        self.rows() * self.cols()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.npixels() == 0
    }

    /// Restrict to a grid of `nrows` x `ncols`.
    #[must_use]
    pub fn clamp(&self, nrows: usize, ncols: usize) -> Self {
        let y1 = self.y1.min(nrows);
        let x1 = self.x1.min(ncols);
        Self {
            y0: self.y0.min(y1),
            y1,
            x0: self.x0.min(x1),
            x1,
        }
    }

    /// Sub-rectangles of at most `budget` pixels covering `self` exactly.
    #[must_use]
    pub fn chunks(&self, budget: usize) -> RegionChunks {
        RegionChunks::new(*self, budget)
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rows {}:{}, pixels {}:{}", self.y0, self.y1, self.x0, self.x1)
    }
}

/// Lazy, finite traversal of a rectangle in pieces of bounded size.
///
/// The rectangle is split along its longer axis; if one line along the
/// shorter axis already exceeds the budget, that axis is tiled as well.
/// Cloning yields an independent traversal from the current position.
#[derive(Clone, Debug)]
pub struct RegionChunks {
    rect: Rect,
    rows_major: bool,
    major_step: usize,
    minor_step: usize,
    major: usize,
    minor: usize,
}

impl RegionChunks {
    #[must_use]
    pub fn new(rect: Rect, budget: usize) -> Self {
        let budget = budget.max(1);
        let rows_major = rect.rows() >= rect.cols();
        let minor_len = if rows_major { rect.cols() } else { rect.rows() };
        let minor_step = minor_len.clamp(1, budget);
        let major_step = (budget / minor_step).max(1);
        let (major, minor) = if rows_major {
            (rect.y0, rect.x0)
        } else {
            (rect.x0, rect.y0)
        };
        Self {
            rect,
            rows_major,
            major_step,
            minor_step,
            major,
            minor,
        }
    }

    fn bounds(&self) -> (usize, usize, usize) {
        if self.rows_major {
            (self.rect.y1, self.rect.x0, self.rect.x1)
        } else {
            (self.rect.x1, self.rect.y0, self.rect.y1)
        }
    }
}

impl Iterator for RegionChunks {
    type Item = Rect;

    fn next(&mut self) -> Option<Rect> {
        if self.rect.is_empty() {
            return None;
        }
        let (major_end, minor_start, minor_end) = self.bounds();
        if self.major >= major_end {
            return None;
        }
        let a1 = (self.major + self.major_step).min(major_end);
        let b1 = (self.minor + self.minor_step).min(minor_end);
        let piece = if self.rows_major {
            Rect::new(self.major, a1, self.minor, b1)
        } else {
            Rect::new(self.minor, b1, self.major, a1)
        };
        self.minor = b1;
        if self.minor >= minor_end {
            self.minor = minor_start;
            self.major = a1;
        }
        Some(piece)
    }
}

/// Smallest rectangle containing every `true` entry, or `None` for an
/// all-false mask.
#[must_use]
pub fn bounding_rect(mask: ArrayView2<'_, bool>) -> Option<Rect> {
    let mut found: Option<Rect> = None;
    for ((y, x), &on) in mask.indexed_iter() {
        if !on {
            continue;
        }
        found = Some(match found {
            None => Rect::new(y, y + 1, x, x + 1),
            Some(r) => Rect::new(r.y0.min(y), r.y1.max(y + 1), r.x0.min(x), r.x1.max(x + 1)),
        });
    }
    found
}
