use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type VehicleId = u64;
pub type BookingId = u64;
pub type UserId = u64;

/// Half-open interval `[start, end)`.
///
/// Two spans overlap iff `a.start < b.end && b.start < a.end`, so a booking
/// ending exactly when another starts is not a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Lifecycle of a booking. Only `Confirmed` and `Modified` occupy a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
    Modified,
    Completed,
    Canceled,
}

/// Edges of the booking state machine. Creation is not an edge: a booking is
/// born `Confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Modify,
    Cancel,
    Expire,
}

impl BookingStatus {
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::Modified)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// The transition table. Anything not listed here is rejected.
    pub fn apply(self, transition: Transition) -> Option<BookingStatus> {
        use BookingStatus::*;
        match (self, transition) {
            (Confirmed | Modified, Transition::Modify) => Some(Modified),
            (Confirmed | Modified, Transition::Cancel) => Some(Canceled),
            (Confirmed | Modified, Transition::Expire) => Some(Completed),
            (Completed | Canceled, _) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Modified => "modified",
            BookingStatus::Completed => "completed",
            BookingStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "confirmed" => Ok(BookingStatus::Confirmed),
            "modified" => Ok(BookingStatus::Modified),
            "completed" => Ok(BookingStatus::Completed),
            "canceled" | "cancelled" => Ok(BookingStatus::Canceled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

impl Transition {
    pub fn target_label(self) -> &'static str {
        match self {
            Transition::Modify => "modified",
            Transition::Cancel => "canceled",
            Transition::Expire => "completed",
        }
    }
}

/// Status predicate used by the read-only query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Any,
    Active,
    Only(BookingStatus),
}

impl StatusFilter {
    pub fn matches(self, status: BookingStatus) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::Active => status.is_active(),
            StatusFilter::Only(s) => s == status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: VehicleId,
    pub make: String,
    pub model: String,
    pub registration: String,
    pub is_available: bool,
}

/// Cleaning state reported for a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cleanliness {
    #[serde(rename = "clean")]
    Clean,
    #[serde(rename = "dirty")]
    Dirty,
    #[serde(rename = "needs maintenance")]
    NeedsMaintenance,
}

impl Cleanliness {
    pub fn as_str(self) -> &'static str {
        match self {
            Cleanliness::Clean => "clean",
            Cleanliness::Dirty => "dirty",
            Cleanliness::NeedsMaintenance => "needs maintenance",
        }
    }
}

impl fmt::Display for Cleanliness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cleanliness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clean" => Ok(Cleanliness::Clean),
            "dirty" => Ok(Cleanliness::Dirty),
            "needs maintenance" | "needs_maintenance" => Ok(Cleanliness::NeedsMaintenance),
            other => Err(format!("unknown cleanliness: {other}")),
        }
    }
}

/// Field condition of a vehicle as given at onboarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleCondition {
    pub location: String,
    /// Battery percentage, 0..=100.
    pub charge_level: u8,
    pub cleanliness: Cleanliness,
}

impl Default for VehicleCondition {
    fn default() -> Self {
        Self {
            location: String::new(),
            charge_level: 100,
            cleanliness: Cleanliness::Clean,
        }
    }
}

/// Last reported condition of one vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleStatus {
    pub vehicle_id: VehicleId,
    pub location: String,
    pub charge_level: u8,
    pub cleanliness: Cleanliness,
    pub updated_at: Ms,
}

impl VehicleStatus {
    pub fn new(vehicle_id: VehicleId, condition: VehicleCondition, updated_at: Ms) -> Self {
        Self {
            vehicle_id,
            location: condition.location,
            charge_level: condition.charge_level,
            cleanliness: condition.cleanliness,
            updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub user_id: UserId,
    pub vehicle_id: VehicleId,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
}

/// A booking joined with the descriptive fields of its vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingDetail {
    pub booking_id: BookingId,
    pub user_id: UserId,
    pub vehicle_id: VehicleId,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub make: String,
    pub model: String,
    pub registration: String,
}

/// Everything guarded by one vehicle's lock: the registry row plus every
/// booking ever made on it.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub vehicle: Vehicle,
    pub status: VehicleStatus,
    /// All bookings regardless of status, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl VehicleState {
    pub fn new(vehicle: Vehicle) -> Self {
        let status = VehicleStatus::new(vehicle.id, VehicleCondition::default(), 0);
        Self {
            vehicle,
            status,
            bookings: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: VehicleStatus) -> Self {
        self.status = status;
        self
    }

    /// The registry row with `is_available` evaluated at `now` rather than
    /// as of the last committed transaction.
    pub fn vehicle_at(&self, now: Ms) -> Vehicle {
        Vehicle {
            is_available: !self.occupied_at(now),
            ..self.vehicle.clone()
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: BookingId) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: BookingId) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings (any status) whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn active(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.status.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// True iff some active booking's span contains `now`.
    pub fn occupied_at(&self, now: Ms) -> bool {
        self.active().any(|b| b.span.contains_instant(now))
    }
}

/// Outcome of a sweep over one vehicle, recorded inside `Event::ExpirySwept`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleSweep {
    pub vehicle_id: VehicleId,
    pub completed: Vec<BookingId>,
    pub available: bool,
}

/// Journal record. Each record is exactly one committed transaction and
/// carries every change it made, including the resulting availability flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleRegistered {
        vehicle: Vehicle,
        status: VehicleStatus,
    },
    BookingCreated {
        booking: Booking,
        available: bool,
    },
    BookingModified {
        id: BookingId,
        vehicle_id: VehicleId,
        span: Span,
        available: bool,
    },
    BookingCanceled {
        id: BookingId,
        vehicle_id: VehicleId,
        available: bool,
    },
    ExpirySwept {
        at: Ms,
        sweeps: Vec<VehicleSweep>,
    },
    /// Snapshot row written by compaction; carries the booking's current status.
    BookingRestored {
        booking: Booking,
    },
}

impl Event {
    /// Vehicles whose state this record changes.
    pub fn vehicle_ids(&self) -> Vec<VehicleId> {
        match self {
            Event::VehicleRegistered { vehicle, .. } => vec![vehicle.id],
            Event::BookingCreated { booking, .. } | Event::BookingRestored { booking } => {
                vec![booking.vehicle_id]
            }
            Event::BookingModified { vehicle_id, .. } | Event::BookingCanceled { vehicle_id, .. } => {
                vec![*vehicle_id]
            }
            Event::ExpirySwept { sweeps, .. } => sweeps.iter().map(|s| s.vehicle_id).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle(id: VehicleId) -> Vehicle {
        Vehicle {
            id,
            make: "Toyota".into(),
            model: "Prius".into(),
            registration: format!("SGX{id}"),
            is_available: true,
        }
    }

    fn booking(id: BookingId, start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id,
            user_id: 1,
            vehicle_id: 1,
            span: Span::new(start, end),
            status,
            created_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        let inner = Span::new(120, 130);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(a.overlaps(&inner));
        assert!(inner.overlaps(&a));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn transition_table() {
        use BookingStatus::*;
        assert_eq!(Confirmed.apply(Transition::Modify), Some(Modified));
        assert_eq!(Modified.apply(Transition::Modify), Some(Modified));
        assert_eq!(Confirmed.apply(Transition::Cancel), Some(Canceled));
        assert_eq!(Modified.apply(Transition::Expire), Some(Completed));
        for terminal in [Completed, Canceled] {
            for t in [Transition::Modify, Transition::Cancel, Transition::Expire] {
                assert_eq!(terminal.apply(t), None, "{terminal} --{t:?}--> must be rejected");
            }
        }
    }

    #[test]
    fn status_strings() {
        for s in [
            BookingStatus::Confirmed,
            BookingStatus::Modified,
            BookingStatus::Completed,
            BookingStatus::Canceled,
        ] {
            assert_eq!(s.as_str().parse::<BookingStatus>().unwrap(), s);
        }
        assert_eq!(
            serde_json::to_string(&BookingStatus::Canceled).unwrap(),
            "\"canceled\""
        );
        assert!("pending".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn status_filter() {
        assert!(StatusFilter::Active.matches(BookingStatus::Modified));
        assert!(!StatusFilter::Active.matches(BookingStatus::Completed));
        assert!(StatusFilter::Only(BookingStatus::Canceled).matches(BookingStatus::Canceled));
        assert!(!StatusFilter::Only(BookingStatus::Canceled).matches(BookingStatus::Confirmed));
        assert!(StatusFilter::Any.matches(BookingStatus::Completed));
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut vs = VehicleState::new(vehicle(1));
        vs.insert_booking(booking(1, 300, 400, BookingStatus::Confirmed));
        vs.insert_booking(booking(2, 100, 200, BookingStatus::Canceled));
        vs.insert_booking(booking(3, 200, 300, BookingStatus::Modified));
        let starts: Vec<Ms> = vs.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);

        vs.remove_booking(3);
        assert_eq!(vs.bookings.len(), 2);
        assert!(vs.remove_booking(99).is_none());
    }

    #[test]
    fn overlapping_is_half_open() {
        let mut vs = VehicleState::new(vehicle(1));
        vs.insert_booking(booking(1, 100, 200, BookingStatus::Confirmed));
        vs.insert_booking(booking(2, 450, 600, BookingStatus::Confirmed));
        vs.insert_booking(booking(3, 1000, 1100, BookingStatus::Confirmed));

        let hits: Vec<_> = vs.overlapping(&Span::new(500, 800)).map(|b| b.id).collect();
        assert_eq!(hits, vec![2]);

        let touching: Vec<_> = vs.overlapping(&Span::new(200, 450)).collect();
        assert!(touching.is_empty());
    }

    #[test]
    fn occupancy_ignores_terminal_bookings() {
        let mut vs = VehicleState::new(vehicle(1));
        vs.insert_booking(booking(1, 100, 200, BookingStatus::Canceled));
        vs.insert_booking(booking(2, 300, 400, BookingStatus::Modified));
        assert!(!vs.occupied_at(150));
        assert!(vs.occupied_at(300));
        assert!(!vs.occupied_at(400));
        assert_eq!(vs.active_count(), 1);
    }

    #[test]
    fn vehicle_at_reflects_occupancy() {
        let mut vs = VehicleState::new(vehicle(1));
        vs.insert_booking(booking(1, 100, 200, BookingStatus::Confirmed));
        assert!(vs.vehicle.is_available);
        assert!(!vs.vehicle_at(150).is_available);
        assert!(vs.vehicle_at(200).is_available);
        assert_eq!(vs.vehicle_at(150).registration, "SGX1");
    }

    #[test]
    fn cleanliness_strings() {
        for c in [Cleanliness::Clean, Cleanliness::Dirty, Cleanliness::NeedsMaintenance] {
            assert_eq!(c.as_str().parse::<Cleanliness>(), Ok(c));
        }
        assert_eq!("Needs_Maintenance".parse(), Ok(Cleanliness::NeedsMaintenance));
        assert!("sparkling".parse::<Cleanliness>().is_err());
        assert_eq!(
            serde_json::to_string(&Cleanliness::NeedsMaintenance).unwrap(),
            "\"needs maintenance\""
        );
    }

    #[test]
    fn event_vehicle_ids() {
        let e = Event::ExpirySwept {
            at: 10,
            sweeps: vec![
                VehicleSweep { vehicle_id: 4, completed: vec![1], available: true },
                VehicleSweep { vehicle_id: 9, completed: vec![], available: false },
            ],
        };
        assert_eq!(e.vehicle_ids(), vec![4, 9]);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: booking(7, 1000, 2000, BookingStatus::Confirmed),
            available: true,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
