//! Coordinate-grid index.
//!
//! The globe is binned into 181×361 integer-degree cells. Each cell keeps
//! activity counters, an exponentially weighted success rate feeding
//! reputation, a rolling average delivery duration, and a 60-second
//! operations window that enforces the per-cell saturation cap.

use logichain_types::{CellSnapshot, CoreError, CoreResult, GeoPoint};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Smoothing factor of the per-cell success-rate average.
pub const SUCCESS_RATE_ALPHA: f64 = 0.1;

/// Width of the saturation window in seconds.
pub const OPS_WINDOW_SECS: f64 = 60.0;

/// A cell key: integer degrees, latitude −90..=90, longitude −180..=180.
pub type Cell = (i16, i16);

/// Mutable per-cell state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellStats {
    pub active_contracts: u32,
    pub successes: u64,
    pub failures: u64,
    pub last_activity: Option<f64>,
    /// EMA of delivery outcomes in [0, 1].
    pub success_rate: f64,
    pub avg_duration_secs: f64,
    /// Operation timestamps inside the saturation window; not persisted.
    #[serde(skip)]
    ops_window: VecDeque<f64>,
}

impl CellStats {
    fn prune_window(&mut self, now: f64) {
        while let Some(&oldest) = self.ops_window.front() {
            if now - oldest > OPS_WINDOW_SECS {
                self.ops_window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Operations currently inside the window.
    pub fn ops_in_window(&self) -> usize {
        self.ops_window.len()
    }
}

/// The grid itself. All methods take the caller's clock so replayed blocks
/// see the same decisions as live ones.
pub struct CoordinateGrid {
    cells: RwLock<HashMap<Cell, CellStats>>,
    max_ops_per_minute: u32,
}

impl CoordinateGrid {
    pub fn new(max_ops_per_minute: u32) -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
            max_ops_per_minute,
        }
    }

    fn cell_of(point: &GeoPoint) -> CoreResult<Cell> {
        if !point.is_valid() {
            return Err(CoreError::InvalidBlockStructure(
                "coordinate outside the grid".into(),
            ));
        }
        Ok(point.cell())
    }

    /// Count one operation against the cell's saturation window.
    ///
    /// Fails with `CoordinateSaturated` when the window is full; the
    /// failed attempt is not recorded.
    pub fn record_operation(&self, point: &GeoPoint, now: f64) -> CoreResult<()> {
        let cell = Self::cell_of(point)?;
        let mut cells = self.cells.write();
        let stats = cells.entry(cell).or_default();
        stats.prune_window(now);
        if stats.ops_in_window() >= self.max_ops_per_minute as usize {
            debug!(?cell, "coordinate cell saturated");
            return Err(CoreError::CoordinateSaturated);
        }
        stats.ops_window.push_back(now);
        stats.last_activity = Some(now);
        Ok(())
    }

    /// A contract became active at this cell. Called during block
    /// application, which must be deterministic, so the saturation window
    /// (an ingress concern) is not consulted here.
    pub fn contract_opened(&self, point: &GeoPoint, now: f64) -> CoreResult<()> {
        let cell = Self::cell_of(point)?;
        let mut cells = self.cells.write();
        let stats = cells.entry(cell).or_default();
        stats.active_contracts += 1;
        stats.last_activity = Some(now);
        Ok(())
    }

    /// A contract at this cell reached a terminal state.
    ///
    /// `duration_secs` is only meaningful for successful deliveries and
    /// feeds the rolling average.
    pub fn contract_closed(
        &self,
        point: &GeoPoint,
        success: bool,
        duration_secs: f64,
        now: f64,
    ) -> CoreResult<()> {
        let cell = Self::cell_of(point)?;
        let mut cells = self.cells.write();
        let stats = cells.entry(cell).or_default();
        stats.active_contracts = stats.active_contracts.saturating_sub(1);
        if success {
            stats.successes += 1;
            let n = stats.successes as f64;
            stats.avg_duration_secs = (stats.avg_duration_secs * (n - 1.0) + duration_secs) / n;
        } else {
            stats.failures += 1;
        }
        let outcome = if success { 1.0 } else { 0.0 };
        stats.success_rate += SUCCESS_RATE_ALPHA * (outcome - stats.success_rate);
        stats.last_activity = Some(now);
        Ok(())
    }

    /// Success-rate EMA of the cell containing `point`, 0.0 when untouched.
    pub fn success_rate(&self, point: &GeoPoint) -> f64 {
        point
            .is_valid()
            .then(|| {
                self.cells
                    .read()
                    .get(&point.cell())
                    .map(|stats| stats.success_rate)
            })
            .flatten()
            .unwrap_or(0.0)
    }

    /// Snapshot of one cell's counters.
    pub fn stats(&self, cell: Cell) -> Option<CellStats> {
        self.cells.read().get(&cell).cloned()
    }

    /// Number of cells that have seen any activity.
    pub fn touched_cells(&self) -> usize {
        self.cells.read().len()
    }

    /// Export all touched cells for persistence.
    pub fn export(&self) -> Vec<CellSnapshot> {
        self.cells
            .read()
            .iter()
            .map(|(&(lat, lng), stats)| CellSnapshot {
                lat,
                lng,
                active_contracts: stats.active_contracts,
                successes: stats.successes,
                failures: stats.failures,
                last_activity: stats.last_activity,
                success_rate: stats.success_rate,
                avg_duration_secs: stats.avg_duration_secs,
            })
            .collect()
    }

    /// Restore from persisted cells; the saturation windows start empty.
    pub fn restore(&self, snapshots: Vec<CellSnapshot>) {
        let mut cells = self.cells.write();
        cells.clear();
        for snapshot in snapshots {
            cells.insert(
                (snapshot.lat, snapshot.lng),
                CellStats {
                    active_contracts: snapshot.active_contracts,
                    successes: snapshot.successes,
                    failures: snapshot.failures,
                    last_activity: snapshot.last_activity,
                    success_rate: snapshot.success_rate,
                    avg_duration_secs: snapshot.avg_duration_secs,
                    ops_window: VecDeque::new(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> CoordinateGrid {
        CoordinateGrid::new(100)
    }

    #[test]
    fn saturation_cap_enforced() {
        let grid = CoordinateGrid::new(3);
        let point = GeoPoint::new(-23.55, -46.63);
        for _ in 0..3 {
            grid.record_operation(&point, 10.0).unwrap();
        }
        assert_eq!(
            grid.record_operation(&point, 10.0),
            Err(CoreError::CoordinateSaturated)
        );
    }

    #[test]
    fn window_slides_after_sixty_seconds() {
        let grid = CoordinateGrid::new(2);
        let point = GeoPoint::new(0.5, 0.5);
        grid.record_operation(&point, 0.0).unwrap();
        grid.record_operation(&point, 1.0).unwrap();
        assert!(grid.record_operation(&point, 2.0).is_err());
        // The first two samples age out.
        grid.record_operation(&point, 62.0).unwrap();
    }

    #[test]
    fn neighbouring_cells_are_independent() {
        let grid = CoordinateGrid::new(1);
        grid.record_operation(&GeoPoint::new(10.1, 20.1), 0.0).unwrap();
        grid.record_operation(&GeoPoint::new(11.1, 20.1), 0.0).unwrap();
        assert!(grid.record_operation(&GeoPoint::new(10.9, 20.9), 0.0).is_err());
    }

    #[test]
    fn success_rate_ema_converges() {
        let grid = grid();
        let point = GeoPoint::new(-23.55, -46.63);
        grid.contract_opened(&point, 0.0).unwrap();
        for i in 0..50 {
            grid.contract_closed(&point, true, 600.0, i as f64).unwrap();
        }
        let rate = grid.success_rate(&point);
        assert!(rate > 0.99, "rate after 50 successes was {rate}");

        grid.contract_closed(&point, false, 0.0, 51.0).unwrap();
        assert!(grid.success_rate(&point) < rate);
    }

    #[test]
    fn duration_average_is_rolling_mean() {
        let grid = grid();
        let point = GeoPoint::new(1.0, 1.0);
        grid.contract_closed(&point, true, 100.0, 0.0).unwrap();
        grid.contract_closed(&point, true, 300.0, 1.0).unwrap();
        let stats = grid.stats(point.cell()).unwrap();
        assert_eq!(stats.avg_duration_secs, 200.0);
        assert_eq!(stats.successes, 2);
    }

    #[test]
    fn active_contract_counter_tracks_lifecycle() {
        let grid = grid();
        let point = GeoPoint::new(2.0, 2.0);
        grid.contract_opened(&point, 0.0).unwrap();
        grid.contract_opened(&point, 1.0).unwrap();
        assert_eq!(grid.stats(point.cell()).unwrap().active_contracts, 2);
        grid.contract_closed(&point, false, 0.0, 2.0).unwrap();
        assert_eq!(grid.stats(point.cell()).unwrap().active_contracts, 1);
    }

    #[test]
    fn invalid_coordinate_rejected() {
        let grid = grid();
        assert!(grid
            .record_operation(&GeoPoint::new(91.0, 0.0), 0.0)
            .is_err());
    }

    #[test]
    fn export_restore_roundtrip() {
        let grid = grid();
        let point = GeoPoint::new(3.0, 4.0);
        grid.contract_opened(&point, 5.0).unwrap();
        grid.contract_closed(&point, true, 120.0, 6.0).unwrap();

        let restored = CoordinateGrid::new(100);
        restored.restore(grid.export());
        let stats = restored.stats(point.cell()).unwrap();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.avg_duration_secs, 120.0);
        // Saturation windows are transient and restart empty.
        assert_eq!(stats.ops_in_window(), 0);
    }
}
