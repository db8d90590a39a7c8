//! Shared format-handler state: the open-file cursor and its transition
//! rules.

use std::path::{Path, PathBuf};

use crate::error::{OmeTiffResult, UsageError};

/// Canonicalise a path, falling back to the path as given when the file
/// does not exist yet.
pub(crate) fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Cursor state shared by the reader and writer handlers.
///
/// The state machine is `Fresh → Open → Closed`: `open` is entered by
/// `set_id`, every other cursor operation requires it, and `close` resets
/// to fresh. `series` and `plane` may only stay or advance by one;
/// changing `series` resets `resolution` and `plane`, changing
/// `resolution` resets `plane`.
#[derive(Debug, Default)]
pub struct HandlerState {
    current_id: Option<PathBuf>,
    series: usize,
    resolution: usize,
    plane: usize,
    pub compression: Option<String>,
    pub interleaved: Option<bool>,
    pub tile_size_x: Option<u32>,
    pub tile_size_y: Option<u32>,
    pub write_sequentially: bool,
    pub frames_per_second: u32,
}

impl HandlerState {
    pub fn new() -> HandlerState {
        HandlerState::default()
    }

    /// The canonical current file, or `NotOpen`.
    pub fn assert_open(&self) -> OmeTiffResult<&Path> {
        self.current_id
            .as_deref()
            .ok_or_else(|| UsageError::NotOpen.into())
    }

    pub fn assert_fresh(&self) -> OmeTiffResult<()> {
        if self.current_id.is_some() {
            return Err(UsageError::AlreadyOpen.into());
        }
        Ok(())
    }

    pub fn current_id(&self) -> Option<&Path> {
        self.current_id.as_deref()
    }

    /// Record the canonicalised current file.
    pub fn open(&mut self, path: &Path) {
        self.current_id = Some(canonical(path));
    }

    /// Reset every cursor field.
    pub fn close(&mut self) {
        *self = HandlerState::default();
    }

    pub fn series(&self) -> OmeTiffResult<usize> {
        self.assert_open()?;
        Ok(self.series)
    }

    pub fn resolution(&self) -> OmeTiffResult<usize> {
        self.assert_open()?;
        Ok(self.resolution)
    }

    pub fn plane(&self) -> OmeTiffResult<usize> {
        self.assert_open()?;
        Ok(self.plane)
    }

    /// Advance the series cursor; returns whether it changed.
    pub fn set_series(&mut self, series: usize, count: usize) -> OmeTiffResult<bool> {
        self.assert_open()?;
        if series >= count {
            return Err(UsageError::SeriesOutOfRange { series, count }.into());
        }
        if series != self.series && series > 0 && self.series != series - 1 {
            return Err(UsageError::SeriesOutOfOrder {
                series,
                current: self.series,
            }
            .into());
        }
        let changed = series != self.series;
        self.series = series;
        self.resolution = 0;
        self.plane = 0;
        Ok(changed)
    }

    /// Move the resolution cursor; resets the plane but not the series.
    pub fn set_resolution(&mut self, resolution: usize, count: usize) -> OmeTiffResult<bool> {
        self.assert_open()?;
        if resolution >= count {
            return Err(UsageError::ResolutionOutOfRange { resolution, count }.into());
        }
        let changed = resolution != self.resolution;
        self.resolution = resolution;
        self.plane = 0;
        Ok(changed)
    }

    /// Advance the plane cursor; returns whether it changed.
    pub fn set_plane(&mut self, plane: usize, count: usize) -> OmeTiffResult<bool> {
        self.assert_open()?;
        if plane >= count {
            return Err(UsageError::PlaneOutOfRange { plane, count }.into());
        }
        if plane != self.plane && plane > 0 && self.plane != plane - 1 {
            return Err(UsageError::PlaneOutOfOrder {
                plane,
                current: self.plane,
            }
            .into());
        }
        let changed = plane != self.plane;
        self.plane = plane;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_state() -> HandlerState {
        let mut state = HandlerState::new();
        state.open(Path::new("/nonexistent/file.ome.tif"));
        state
    }

    #[test]
    fn cursor_requires_open() {
        let state = HandlerState::new();
        assert!(state.series().is_err());
        assert!(state.assert_open().is_err());

        let mut state = state;
        state.open(Path::new("x.ome.tif"));
        assert!(state.assert_open().is_ok());
        assert!(state.assert_fresh().is_err());
        assert_eq!(state.series().unwrap(), 0);
    }

    #[test]
    fn monotonic_series_advance() {
        let mut state = open_state();
        assert!(!state.set_series(0, 3).unwrap());
        assert!(state.set_series(1, 3).unwrap());
        // Skipping ahead is rejected; rewinding to zero is permitted.
        assert!(state.set_series(3, 3).is_err());
        assert!(state.set_series(0, 3).unwrap());
        assert!(state.set_series(2, 3).is_err());
        state.set_series(1, 3).unwrap();
        assert!(state.set_series(2, 3).unwrap());
    }

    #[test]
    fn series_resets_resolution_and_plane() {
        let mut state = open_state();
        state.set_plane(1, 4).unwrap();
        state.set_resolution(1, 2).unwrap();
        state.set_series(1, 2).unwrap();
        assert_eq!(state.resolution().unwrap(), 0);
        assert_eq!(state.plane().unwrap(), 0);
    }

    #[test]
    fn resolution_resets_plane_only() {
        let mut state = open_state();
        state.set_series(1, 2).unwrap();
        state.set_plane(1, 4).unwrap();
        state.set_resolution(1, 3).unwrap();
        assert_eq!(state.series().unwrap(), 1);
        assert_eq!(state.plane().unwrap(), 0);
    }

    #[test]
    fn monotonic_plane_advance() {
        let mut state = open_state();
        assert!(state.set_plane(1, 4).unwrap());
        assert!(!state.set_plane(1, 4).unwrap());
        assert!(state.set_plane(2, 4).unwrap());
        assert!(state.set_plane(0, 4).unwrap());
        assert!(state.set_plane(3, 4).is_err());
        assert!(state.set_plane(4, 4).is_err());
    }

    #[test]
    fn close_resets_everything() {
        let mut state = open_state();
        state.set_plane(1, 4).unwrap();
        state.compression = Some(String::from("LZW"));
        state.close();
        assert!(state.assert_fresh().is_ok());
        assert!(state.series().is_err());
        assert!(state.compression.is_none());
    }
}
