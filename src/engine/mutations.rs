use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, validate_interval};
use super::{Engine, EngineError, available_after};

/// Result of a cancellation. Cancel never fails on state: repeats, unknown
/// ids and already-finished bookings are all no-op successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    AlreadyCanceled,
    /// Completed bookings stay completed.
    AlreadyCompleted,
    Unknown,
}

impl CancelOutcome {
    /// Outcome for a booking whose status admits no cancel edge.
    pub(super) fn refused(from: BookingStatus) -> Self {
        if from == BookingStatus::Completed {
            CancelOutcome::AlreadyCompleted
        } else {
            CancelOutcome::AlreadyCanceled
        }
    }

    pub fn changed(self) -> bool {
        self == CancelOutcome::Canceled
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CancelOutcome::Canceled => "canceled",
            CancelOutcome::AlreadyCanceled => "already_canceled",
            CancelOutcome::AlreadyCompleted => "already_completed",
            CancelOutcome::Unknown => "unknown",
        }
    }
}

impl Engine {
    /// Fleet onboarding with a default condition report (clean, fully
    /// charged, no location). Vehicles start available.
    pub async fn register_vehicle(
        &self,
        id: VehicleId,
        make: String,
        model: String,
        registration: String,
    ) -> Result<(), EngineError> {
        self.onboard_vehicle(id, make, model, registration, VehicleCondition::default())
            .await
    }

    /// Fleet onboarding with the vehicle's initial condition report.
    pub async fn onboard_vehicle(
        &self,
        id: VehicleId,
        make: String,
        model: String,
        registration: String,
        condition: VehicleCondition,
    ) -> Result<(), EngineError> {
        if make.len() > MAX_MAKE_LEN {
            return Err(EngineError::LimitExceeded("make too long"));
        }
        if model.len() > MAX_MODEL_LEN {
            return Err(EngineError::LimitExceeded("model too long"));
        }
        if registration.len() > MAX_REGISTRATION_LEN {
            return Err(EngineError::LimitExceeded("registration too long"));
        }
        if condition.location.len() > MAX_LOCATION_LEN {
            return Err(EngineError::LimitExceeded("location too long"));
        }
        if condition.charge_level > MAX_CHARGE_LEVEL {
            return Err(EngineError::InvalidCondition(
                "charge level must be between 0 and 100",
            ));
        }

        let _gate = self.commit_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        if self.vehicles.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.vehicles.len() >= MAX_VEHICLES {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }

        let vehicle = Vehicle {
            id,
            make,
            model,
            registration,
            is_available: true,
        };
        let status = VehicleStatus::new(id, condition, self.now_ms());
        let event = Event::VehicleRegistered {
            vehicle: vehicle.clone(),
            status: status.clone(),
        };
        self.journal
            .append(&event)
            .await
            .map_err(EngineError::storage)?;
        let state = VehicleState::new(vehicle).with_status(status);
        self.vehicles.insert(id, Arc::new(RwLock::new(state)));
        info!("registered vehicle {id}");
        Ok(())
    }

    /// Admit a new booking if no active booking on the vehicle overlaps it.
    /// Conflict check and insert happen under one vehicle write lock, so of
    /// two racing requests for the same slot the first to commit wins.
    pub async fn create_booking(
        &self,
        vehicle_id: VehicleId,
        user_id: UserId,
        span: Span,
    ) -> Result<BookingId, EngineError> {
        let now = self.now_ms();
        validate_interval(&span, now)?;
        let vs = self
            .vehicle(vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;

        let _gate = self.commit_gate.read().await;
        let mut guard = vs.write().await;
        if guard.active_count() >= MAX_ACTIVE_BOOKINGS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many active bookings on vehicle"));
        }
        if let Err(e) = check_no_conflict(&guard, &span, None) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            warn!("booking conflict on vehicle {vehicle_id} for {span}: {e}");
            return Err(e);
        }

        let id = self.allocate_booking_id();
        let available = available_after(&guard, now, None, Some(&span));
        let booking = Booking {
            id,
            user_id,
            vehicle_id,
            span,
            status: BookingStatus::Confirmed,
            created_at: now,
        };
        self.commit(&mut guard, Event::BookingCreated { booking, available })
            .await?;

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!("booking {id} created for vehicle {vehicle_id} and user {user_id}: {span}");
        Ok(id)
    }

    /// Reschedule an active booking. Its own current interval is excluded
    /// from the conflict check.
    pub async fn modify_booking(&self, booking_id: BookingId, span: Span) -> Result<(), EngineError> {
        let now = self.now_ms();
        validate_interval(&span, now)?;

        let _gate = self.commit_gate.read().await;
        let (vehicle_id, mut guard) = self.resolve_booking_write(booking_id).await?;
        let current = guard
            .booking(booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?
            .status;
        if current.apply(Transition::Modify).is_none() {
            return Err(EngineError::IllegalTransition {
                booking_id,
                from: current,
                to: Transition::Modify.target_label(),
            });
        }
        if let Err(e) = check_no_conflict(&guard, &span, Some(booking_id)) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            warn!("reschedule of booking {booking_id} to {span} rejected: {e}");
            return Err(e);
        }

        let available = available_after(&guard, now, Some(booking_id), Some(&span));
        let event = Event::BookingModified {
            id: booking_id,
            vehicle_id,
            span,
            available,
        };
        self.commit(&mut guard, event).await?;

        metrics::counter!(observability::BOOKINGS_MODIFIED_TOTAL).increment(1);
        info!("booking {booking_id} rescheduled to {span}");
        Ok(())
    }

    pub async fn cancel_booking(&self, booking_id: BookingId) -> Result<CancelOutcome, EngineError> {
        let _gate = self.commit_gate.read().await;
        let Some(vs) = self
            .vehicle_for_booking(booking_id)
            .and_then(|vehicle_id| self.vehicle(vehicle_id))
        else {
            return Ok(CancelOutcome::Unknown);
        };
        let mut guard = vs.write().await;
        let Some(booking) = guard.booking(booking_id) else {
            return Ok(CancelOutcome::Unknown);
        };
        let vehicle_id = booking.vehicle_id;
        if booking.status.apply(Transition::Cancel).is_none() {
            return Ok(CancelOutcome::refused(booking.status));
        }

        let available = available_after(&guard, self.now_ms(), Some(booking_id), None);
        let event = Event::BookingCanceled {
            id: booking_id,
            vehicle_id,
            available,
        };
        self.commit(&mut guard, event).await?;

        metrics::counter!(observability::BOOKINGS_CANCELED_TOTAL).increment(1);
        info!("booking {booking_id} canceled");
        Ok(CancelOutcome::Canceled)
    }

    /// Rewrite the journal as a snapshot of the current state.
    /// Returns the number of records in the snapshot.
    pub async fn compact_journal(&self) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut snapshot = Vec::new();
        for vehicle_id in self.sorted_vehicle_ids() {
            let Some(vs) = self.vehicle(vehicle_id) else {
                continue;
            };
            let guard = vs.read().await;
            snapshot.push(Event::VehicleRegistered {
                vehicle: guard.vehicle.clone(),
                status: guard.status.clone(),
            });
            snapshot.extend(
                guard
                    .bookings
                    .iter()
                    .map(|b| Event::BookingRestored { booking: b.clone() }),
            );
        }
        let records = snapshot.len();
        self.journal
            .compact(snapshot)
            .await
            .map_err(EngineError::storage)?;
        info!("journal compacted to {records} records");
        Ok(records)
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }
}
