mod conflict;
mod error;
mod mutations;
mod queries;
mod reconcile;

pub use conflict::{find_conflict, has_conflict, validate_interval};
pub use error::EngineError;
pub use mutations::CancelOutcome;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};

use crate::clock::Clock;
use crate::journal::{FileJournal, Journal};
use crate::model::*;

pub type SharedVehicleState = Arc<RwLock<VehicleState>>;

/// Vehicles per reconciliation transaction unless configured otherwise.
pub const DEFAULT_SWEEP_BATCH: usize = 64;

/// The booking core. Every state transition is one transaction: taken under
/// the owning vehicle's write lock, made durable by a single journal append,
/// and only then applied to memory.
pub struct Engine {
    vehicles: DashMap<VehicleId, SharedVehicleState>,
    /// Reverse lookup: booking id → vehicle id. Bookings never change vehicle.
    booking_index: DashMap<BookingId, VehicleId>,
    next_booking_id: AtomicU64,
    journal: Arc<dyn Journal>,
    clock: Arc<dyn Clock>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot cannot miss a commit.
    commit_gate: RwLock<()>,
    /// Serializes vehicle registration (id uniqueness).
    registry_lock: Mutex<()>,
    /// Keeps reconciliation single-flight.
    sweep_lock: Mutex<()>,
    sweep_batch_size: usize,
}

impl Engine {
    /// Engine over an empty store.
    pub fn new(journal: Arc<dyn Journal>, clock: Arc<dyn Clock>) -> Self {
        Self::recover(journal, clock, &[])
    }

    /// Replay the journal file at `path` and continue appending to it.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let (journal, history) = FileJournal::open(path)?;
        let engine = Self::recover(Arc::new(journal), clock, &history);
        tracing::info!(
            "recovered {} records: {} vehicles, {} bookings",
            history.len(),
            engine.vehicles.len(),
            engine.booking_index.len()
        );
        Ok(engine)
    }

    /// Rebuild state from `history`, then append new transactions to `journal`.
    pub fn recover(journal: Arc<dyn Journal>, clock: Arc<dyn Clock>, history: &[Event]) -> Self {
        let engine = Self {
            vehicles: DashMap::new(),
            booking_index: DashMap::new(),
            next_booking_id: AtomicU64::new(1),
            journal,
            clock,
            commit_gate: RwLock::new(()),
            registry_lock: Mutex::new(()),
            sweep_lock: Mutex::new(()),
            sweep_batch_size: DEFAULT_SWEEP_BATCH,
        };

        // We are the sole owner of every lock here, so try_write always
        // succeeds. Never block: this may run inside an async context.
        for event in history {
            if let Event::VehicleRegistered { vehicle, status } = event {
                let state = VehicleState::new(vehicle.clone()).with_status(status.clone());
                engine
                    .vehicles
                    .insert(vehicle.id, Arc::new(RwLock::new(state)));
                continue;
            }
            for vehicle_id in event.vehicle_ids() {
                let Some(vs) = engine.vehicle(vehicle_id) else {
                    tracing::warn!("replay: record for unknown vehicle {vehicle_id} skipped");
                    continue;
                };
                if let Ok(mut guard) = vs.try_write() {
                    engine.apply(&mut guard, event);
                }
            }
        }
        engine
    }

    pub fn with_sweep_batch(mut self, vehicles_per_batch: usize) -> Self {
        self.sweep_batch_size = vehicles_per_batch.max(1);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub(super) fn vehicle(&self, id: VehicleId) -> Option<SharedVehicleState> {
        self.vehicles.get(&id).map(|e| e.value().clone())
    }

    pub(super) fn vehicle_for_booking(&self, id: BookingId) -> Option<VehicleId> {
        self.booking_index.get(&id).map(|e| *e.value())
    }

    /// Vehicle ids in ascending order — the lock acquisition order.
    pub(super) fn sorted_vehicle_ids(&self) -> Vec<VehicleId> {
        let mut ids: Vec<VehicleId> = self.vehicles.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Lookup booking → vehicle, acquire the vehicle's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: BookingId,
    ) -> Result<(VehicleId, OwnedRwLockWriteGuard<VehicleState>), EngineError> {
        let vehicle_id = self
            .vehicle_for_booking(booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let vs = self
            .vehicle(vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        Ok((vehicle_id, vs.write_owned().await))
    }

    /// Journal-append then apply. The append is the commit point: if it
    /// fails nothing in memory has changed.
    pub(super) async fn commit(
        &self,
        vs: &mut VehicleState,
        event: Event,
    ) -> Result<(), EngineError> {
        self.journal.append(&event).await.map_err(EngineError::storage)?;
        self.apply(vs, &event);
        Ok(())
    }

    /// Apply the part of a committed record that concerns `vs`. The caller
    /// holds the vehicle's write lock.
    pub(super) fn apply(&self, vs: &mut VehicleState, event: &Event) {
        match event {
            // Registration is handled at the map level.
            Event::VehicleRegistered { .. } => {}
            Event::BookingCreated { booking, available } => {
                self.index_booking(booking);
                vs.insert_booking(booking.clone());
                vs.vehicle.is_available = *available;
            }
            Event::BookingRestored { booking } => {
                self.index_booking(booking);
                vs.insert_booking(booking.clone());
            }
            Event::BookingModified { id, span, available, .. } => {
                if let Some(mut booking) = vs.remove_booking(*id) {
                    booking.span = *span;
                    advance(&mut booking, Transition::Modify);
                    vs.insert_booking(booking);
                }
                vs.vehicle.is_available = *available;
            }
            Event::BookingCanceled { id, available, .. } => {
                if let Some(booking) = vs.booking_mut(*id) {
                    advance(booking, Transition::Cancel);
                }
                vs.vehicle.is_available = *available;
            }
            Event::ExpirySwept { sweeps, .. } => {
                let Some(sweep) = sweeps.iter().find(|s| s.vehicle_id == vs.vehicle.id) else {
                    return;
                };
                for id in &sweep.completed {
                    if let Some(booking) = vs.booking_mut(*id) {
                        advance(booking, Transition::Expire);
                    }
                }
                vs.vehicle.is_available = sweep.available;
            }
        }
    }

    fn index_booking(&self, booking: &Booking) {
        self.booking_index.insert(booking.id, booking.vehicle_id);
        self.next_booking_id
            .fetch_max(booking.id + 1, Ordering::SeqCst);
    }

    pub(super) fn allocate_booking_id(&self) -> BookingId {
        self.next_booking_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Move `booking` along `transition` if the transition table allows it.
fn advance(booking: &mut Booking, transition: Transition) {
    match booking.status.apply(transition) {
        Some(next) => booking.status = next,
        None => tracing::warn!(
            "booking {} ignores {transition:?} from {}",
            booking.id,
            booking.status
        ),
    }
}

/// Availability flag the vehicle should carry at `now` once `without` is no
/// longer occupying it and `with` is.
pub(super) fn available_after(
    vs: &VehicleState,
    now: Ms,
    without: Option<BookingId>,
    with: Option<&Span>,
) -> bool {
    let occupied = vs
        .active()
        .any(|b| Some(b.id) != without && b.span.contains_instant(now))
        || with.is_some_and(|s| s.contains_instant(now));
    !occupied
}
