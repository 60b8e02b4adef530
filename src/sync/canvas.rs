//! Canvas synchronizer: grid replica with optimistic local writes.
//!
//! DESIGN
//! ======
//! The grid holds at most one pixel per `(x, y)`. Remote updates overwrite
//! unconditionally, so the last update to arrive wins and re-applying the
//! same update is a no-op.
//!
//! Remote and snapshot colors are stored in canonical `#rrggbb` form when
//! they parse; anything else is kept as sent.
//!
//! Local writes land in the grid immediately and are tracked as pending
//! until the feed echoes that key. An echo that matches the optimistic
//! value (same author, plus same timestamp or same color) is `Confirmed`;
//! anything else is `Superseded`. A rejected write only releases its
//! pending marker: the cell keeps whatever it shows until the feed says
//! otherwise.

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::api::SyncApi;
use crate::error::{SyncError, ValidationError};
use crate::types::{DrawPixel, Pixel, canonical_color, now_ms};

// =============================================================================
// GRID
// =============================================================================

/// Fixed-size pixel map keyed by `(x, y)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    width: u32,
    height: u32,
    cells: BTreeMap<(u32, u32), Pixel>,
}

impl Grid {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, cells: BTreeMap::new() }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn in_bounds(&self, x: i64, y: i64) -> bool {
        (0..i64::from(self.width)).contains(&x) && (0..i64::from(self.height)).contains(&y)
    }

    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<&Pixel> {
        self.cells.get(&(x, y))
    }

    /// Number of painted cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Painted cells ordered by `(x, y)`.
    pub fn iter(&self) -> impl Iterator<Item = &Pixel> {
        self.cells.values()
    }

    /// Store `pixel`, returning `false` if it lies outside the grid.
    fn put(&mut self, pixel: Pixel) -> bool {
        if !self.in_bounds(i64::from(pixel.x), i64::from(pixel.y)) {
            return false;
        }
        self.cells.insert(pixel.key(), pixel);
        true
    }

    fn clear(&mut self) {
        self.cells.clear();
    }
}

// =============================================================================
// WRITES
// =============================================================================

/// A local write awaiting the server's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pixel: Pixel,
}

impl PendingWrite {
    /// The optimistic pixel as placed in the grid.
    #[must_use]
    pub fn pixel(&self) -> &Pixel {
        &self.pixel
    }

    #[must_use]
    pub fn request(&self) -> DrawPixel {
        DrawPixel::from(&self.pixel)
    }

    /// Send the write to the draw endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::WriteRejected`] when the server declines and a
    /// transport error when the request never completed.
    pub async fn submit(&self, api: &dyn SyncApi) -> Result<(), SyncError> {
        api.draw_pixel(&self.request()).await.map_err(SyncError::from_write)
    }
}

/// Effect of one remote update on the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// Stored; no local write was pending for the key.
    Applied,
    /// Stored; it echoes the pending local write for the key.
    Confirmed,
    /// Stored; a different write overtook the pending local one.
    Superseded,
    /// Not stored (outside the grid, or after teardown).
    Ignored,
}

// =============================================================================
// SYNCHRONIZER
// =============================================================================

#[derive(Debug)]
pub struct CanvasSync {
    grid: Grid,
    pending: HashMap<(u32, u32), Pixel>,
    torn_down: bool,
}

impl CanvasSync {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self { grid: Grid::new(width, height), pending: HashMap::new(), torn_down: false }
    }

    /// Replace the replica with `snapshot`. Pending writes are forgotten.
    pub fn initialize(&mut self, snapshot: impl IntoIterator<Item = Pixel>) {
        if self.torn_down {
            return;
        }
        self.grid.clear();
        self.pending.clear();

        let mut skipped = 0usize;
        for pixel in snapshot {
            if !self.grid.put(normalized(pixel)) {
                skipped += 1;
            }
        }
        if skipped > 0 {
            warn!(skipped, "canvas: snapshot pixels outside grid skipped");
        }
        debug!(cells = self.grid.len(), "canvas: initialized");
    }

    /// Merge one live update. Last arrival wins.
    pub fn apply_remote_update(&mut self, pixel: Pixel) -> RemoteApply {
        if self.torn_down {
            return RemoteApply::Ignored;
        }

        let pixel = normalized(pixel);
        let key = pixel.key();
        let pending = self.pending.get(&key).cloned();
        if !self.grid.put(pixel.clone()) {
            warn!(x = key.0, y = key.1, "canvas: remote pixel outside grid ignored");
            return RemoteApply::Ignored;
        }

        match pending {
            None => RemoteApply::Applied,
            Some(local) => {
                self.pending.remove(&key);
                if echoes(&local, &pixel) {
                    RemoteApply::Confirmed
                } else {
                    debug!(x = key.0, y = key.1, by = %pixel.author_id, "canvas: pending write superseded");
                    RemoteApply::Superseded
                }
            }
        }
    }

    /// Validate a local draw and show it immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::OutOfBounds`] or
    /// [`ValidationError::InvalidColor`]; the grid is left untouched.
    pub fn apply_local_write(
        &mut self,
        x: i64,
        y: i64,
        color: &str,
        author_id: &str,
    ) -> Result<PendingWrite, ValidationError> {
        let (Ok(cx), Ok(cy)) = (u32::try_from(x), u32::try_from(y)) else {
            return Err(self.out_of_bounds(x, y));
        };
        if !self.grid.in_bounds(x, y) {
            return Err(self.out_of_bounds(x, y));
        }
        let color = canonical_color(color)?;

        let pixel = Pixel { x: cx, y: cy, color, author_id: author_id.to_owned(), timestamp: now_ms() };
        self.grid.put(pixel.clone());
        self.pending.insert(pixel.key(), pixel.clone());
        Ok(PendingWrite { pixel })
    }

    fn out_of_bounds(&self, x: i64, y: i64) -> ValidationError {
        ValidationError::OutOfBounds { x, y, width: self.grid.width, height: self.grid.height }
    }

    /// Release the pending marker of a rejected write. The cell keeps its value.
    ///
    /// Returns `false` when the key is no longer pending for this write
    /// (already echoed, or replaced by a newer local write).
    pub fn resolve_rejected(&mut self, write: &PendingWrite) -> bool {
        let key = write.pixel.key();
        if self.pending.get(&key) == Some(&write.pixel) {
            self.pending.remove(&key);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> &Grid {
        &self.grid
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_pending(&self, x: u32, y: u32) -> bool {
        self.pending.contains_key(&(x, y))
    }

    /// Stop accepting updates and discard the replica.
    pub fn tear_down(&mut self) {
        self.torn_down = true;
        self.grid.clear();
        self.pending.clear();
    }
}

fn normalized(mut pixel: Pixel) -> Pixel {
    if let Ok(color) = canonical_color(&pixel.color) {
        pixel.color = color;
    }
    pixel
}

fn echoes(local: &Pixel, remote: &Pixel) -> bool {
    local.author_id == remote.author_id && (local.timestamp == remote.timestamp || local.color == remote.color)
}
