use crate::model::*;

use super::conflict;
use super::{Engine, EngineError};

impl Engine {
    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    /// Availability in every vehicle read is evaluated against the clock at
    /// read time, so it holds between reconcile ticks.
    pub async fn get_vehicle(&self, id: VehicleId) -> Result<Vehicle, EngineError> {
        let vs = self.vehicle(id).ok_or(EngineError::VehicleNotFound(id))?;
        let guard = vs.read().await;
        Ok(guard.vehicle_at(self.now_ms()))
    }

    pub async fn is_available(&self, id: VehicleId) -> Result<bool, EngineError> {
        let vs = self.vehicle(id).ok_or(EngineError::VehicleNotFound(id))?;
        let guard = vs.read().await;
        Ok(!guard.occupied_at(self.now_ms()))
    }

    /// All vehicles sorted by id, optionally only those available now.
    pub async fn list_vehicles(&self, available_only: bool) -> Vec<Vehicle> {
        let now = self.now_ms();
        let mut out = Vec::new();
        for id in self.sorted_vehicle_ids() {
            let Some(vs) = self.vehicle(id) else {
                continue;
            };
            let vehicle = vs.read().await.vehicle_at(now);
            if !available_only || vehicle.is_available {
                out.push(vehicle);
            }
        }
        out
    }

    pub async fn get_vehicle_status(&self, id: VehicleId) -> Result<VehicleStatus, EngineError> {
        let vs = self.vehicle(id).ok_or(EngineError::VehicleNotFound(id))?;
        let guard = vs.read().await;
        Ok(guard.status.clone())
    }

    pub async fn get_booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        let vehicle_id = self
            .vehicle_for_booking(id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let vs = self
            .vehicle(vehicle_id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let guard = vs.read().await;
        guard
            .booking(id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(id))
    }

    /// Advisory read-only conflict check. Admission re-checks under the
    /// vehicle's write lock.
    pub async fn has_conflict(
        &self,
        vehicle_id: VehicleId,
        span: Span,
        exclude: Option<BookingId>,
    ) -> Result<bool, EngineError> {
        let vs = self
            .vehicle(vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;
        Ok(conflict::has_conflict(&guard, &span, exclude))
    }

    pub async fn bookings_for_vehicle(
        &self,
        vehicle_id: VehicleId,
        filter: StatusFilter,
    ) -> Result<Vec<Booking>, EngineError> {
        let vs = self
            .vehicle(vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;
        let mut out: Vec<Booking> = guard
            .bookings
            .iter()
            .filter(|b| filter.matches(b.status))
            .cloned()
            .collect();
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    /// Bookings made by `user_id` across the fleet, by start time then id.
    pub async fn bookings_for_user(&self, user_id: UserId, filter: StatusFilter) -> Vec<Booking> {
        let mut out = Vec::new();
        for vehicle_id in self.sorted_vehicle_ids() {
            let Some(vs) = self.vehicle(vehicle_id) else {
                continue;
            };
            let guard = vs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.user_id == user_id && filter.matches(b.status))
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    /// Every booking of a user in any status, joined with its vehicle.
    pub async fn rental_history(&self, user_id: UserId) -> Vec<BookingDetail> {
        let mut out = Vec::new();
        for vehicle_id in self.sorted_vehicle_ids() {
            let Some(vs) = self.vehicle(vehicle_id) else {
                continue;
            };
            let guard = vs.read().await;
            let v = &guard.vehicle;
            out.extend(guard.bookings.iter().filter(|b| b.user_id == user_id).map(|b| {
                BookingDetail {
                    booking_id: b.id,
                    user_id: b.user_id,
                    vehicle_id: v.id,
                    start: b.span.start,
                    end: b.span.end,
                    status: b.status,
                    make: v.make.clone(),
                    model: v.model.clone(),
                    registration: v.registration.clone(),
                }
            }));
        }
        out.sort_by_key(|d| (d.start, d.booking_id));
        out
    }
}
