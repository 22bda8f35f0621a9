use std::time::Instant;

use tracing::{debug, error, info};

use crate::model::*;
use crate::observability;

use super::{Engine, EngineError};

impl Engine {
    /// Close out every active booking whose end lies strictly before `now`
    /// and bring each vehicle's availability flag in line with occupancy at
    /// `now`. Returns how many bookings moved to `completed`.
    ///
    /// Vehicles are swept in id order, `sweep_batch_size` per transaction. A failed
    /// batch leaves its vehicles untouched and the remaining batches still
    /// run; the first error is returned. Re-running is harmless because
    /// completed bookings no longer match the predicate.
    pub async fn reconcile_expired(&self, now: Ms) -> Result<usize, EngineError> {
        let _single_flight = self.sweep_lock.lock().await;
        let started = Instant::now();

        let ids = self.sorted_vehicle_ids();
        let mut completed = 0usize;
        let mut first_error = None;
        for batch in ids.chunks(self.sweep_batch_size) {
            match self.sweep_batch(batch, now).await {
                Ok(n) => completed += n,
                Err(e) => {
                    error!(
                        "reconcile batch of {} vehicles starting at {} rolled back: {e}",
                        batch.len(),
                        batch[0]
                    );
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        metrics::histogram!(observability::RECONCILE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(observability::BOOKINGS_COMPLETED_TOTAL).increment(completed as u64);

        if completed == 0 {
            debug!("reconcile at {now}: no expired bookings");
        } else {
            info!("reconcile at {now}: {completed} bookings completed");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }

    /// One transaction over `vehicle_ids`. Locks are taken in ascending id
    /// order and the expiry predicate is evaluated under them.
    async fn sweep_batch(&self, vehicle_ids: &[VehicleId], now: Ms) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guards = Vec::with_capacity(vehicle_ids.len());
        for id in vehicle_ids {
            if let Some(vs) = self.vehicle(*id) {
                guards.push(vs.write_owned().await);
            }
        }

        let mut sweeps = Vec::new();
        for guard in &guards {
            let completed: Vec<BookingId> = guard
                .active()
                .filter(|b| b.span.end < now)
                .map(|b| b.id)
                .collect();
            let available = !guard.occupied_at(now);
            if completed.is_empty() && available == guard.vehicle.is_available {
                continue;
            }
            sweeps.push(VehicleSweep {
                vehicle_id: guard.vehicle.id,
                completed,
                available,
            });
        }
        if sweeps.is_empty() {
            return Ok(0);
        }

        let count = sweeps.iter().map(|s| s.completed.len()).sum();
        let event = Event::ExpirySwept { at: now, sweeps };
        self.journal
            .append(&event)
            .await
            .map_err(EngineError::storage)?;
        for guard in guards.iter_mut() {
            self.apply(guard, &event);
        }
        Ok(count)
    }
}
