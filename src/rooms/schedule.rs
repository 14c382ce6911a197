//! Meeting-time negotiation.
//!
//! Each side of a room submits the hours it could meet on each date. The
//! room keeps only the latest proposal per side and the overlap is the
//! date-wise intersection of those two proposals. [`Negotiation`] is plain
//! data so it can be exercised without any networking; [`Hub::propose`]
//! wraps it with admission, validation and fan-out.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::{macros::format_description, Date, Duration};
use tracing::debug;

use super::{
    hub::Hub,
    ids::{Participant, Role, RoomId},
    msg::ServerFrame,
};
use crate::ChatError;

/// A calendar date written as `YYYY-MM-DD` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotDate(pub Date);

impl fmt::Display for SlotDate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // time's Date already displays as YYYY-MM-DD
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for SlotDate {
    type Err = time::error::Parse;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Date::parse(s, format_description!("[year]-[month]-[day]")).map(SlotDate)
    }
}

impl From<Date> for SlotDate {
    fn from(date: Date) -> Self {
        SlotDate(date)
    }
}

impl Serialize for SlotDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SlotDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// date -> hours. Validated proposals and the computed overlap.
pub type SlotMap = BTreeMap<SlotDate, BTreeSet<u8>>;

/// A proposal as a client sends it. Hours are not yet known to be hours of
/// a day; [`SlotWindow::validate`] turns it into a [`SlotMap`].
pub type Proposal = BTreeMap<SlotDate, BTreeSet<i64>>;

/// Which (date, hour) pairs a proposal may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWindow {
    pub first_hour: u8,
    /// Inclusive.
    pub last_hour: u8,
    /// Number of bookable days, today included.
    pub horizon_days: u16,
}

impl Default for SlotWindow {
    fn default() -> Self {
        Self {
            first_hour: 9,
            last_hour: 21,
            horizon_days: 7,
        }
    }
}

impl SlotWindow {
    pub fn contains_date(&self, today: Date, date: Date) -> bool {
        let last = today + Duration::days(i64::from(self.horizon_days) - 1);
        date >= today && date <= last
    }

    pub fn contains_hour(&self, hour: u8) -> bool {
        (self.first_hour..=self.last_hour).contains(&hour)
    }

    /// Checks every pair before anything is stored. One bad pair rejects the
    /// whole proposal.
    pub fn validate(&self, today: Date, proposal: &Proposal) -> Result<SlotMap, ChatError> {
        let mut slots = SlotMap::new();
        for (date, hours) in proposal {
            if !self.contains_date(today, date.0) {
                return Err(ChatError::DateOutOfHorizon { date: date.to_string() });
            }
            let mut accepted = BTreeSet::new();
            for &hour in hours {
                match u8::try_from(hour) {
                    Ok(hour) if self.contains_hour(hour) => {
                        accepted.insert(hour);
                    }
                    _ => return Err(ChatError::InvalidSlot { date: date.to_string(), hour }),
                }
            }
            slots.insert(*date, accepted);
        }
        Ok(slots)
    }
}

/// Per-room negotiation state: the latest proposal of each side plus the
/// overlap derived from them.
#[derive(Debug, Clone, Default)]
pub struct Negotiation {
    proposals: HashMap<Role, SlotMap>,
    overlap: SlotMap,
}

impl Negotiation {
    /// Replaces `role`'s proposal and recomputes the overlap.
    pub fn propose(&mut self, role: Role, slots: SlotMap) -> &SlotMap {
        self.proposals.insert(role, slots);
        self.overlap = match (self.proposals.get(&Role::Buyer), self.proposals.get(&Role::Seller)) {
            (Some(buyer), Some(seller)) => intersect(buyer, seller),
            _ => SlotMap::new(),
        };
        &self.overlap
    }

    pub fn proposal(&self, role: Role) -> Option<&SlotMap> {
        self.proposals.get(&role)
    }

    pub fn overlap(&self) -> &SlotMap {
        &self.overlap
    }
}

/// Dates only one side mentions are dropped; dates both mention keep the
/// shared hours, even when none are shared.
pub fn intersect(a: &SlotMap, b: &SlotMap) -> SlotMap {
    a.iter()
        .filter_map(|(date, hours)| {
            let other = b.get(date)?;
            Some((*date, hours.intersection(other).copied().collect()))
        })
        .collect()
}

impl Hub {
    /// Stores `participant`'s proposal for the room and returns the new
    /// overlap. The overlap is also pushed to every subscriber of the room.
    pub async fn propose(
        &self,
        room_id: RoomId,
        participant: &Participant,
        proposal: Proposal,
    ) -> Result<SlotMap, ChatError> {
        let handle = self.registry().admit(room_id, participant).await?;
        let slots = self.window().validate(self.clock().now().date(), &proposal)?;

        let mut state = handle.room().lock_open().await?;
        let overlap = state.negotiation.propose(handle.role(), slots).clone();
        let reached = state.fan_out(ServerFrame::Overlap { room_id, slots: overlap.clone() });
        debug!(%room_id, role = %handle.role(), dates = overlap.len(), reached, "overlap recomputed");
        Ok(overlap)
    }

    pub async fn overlap(&self, room_id: RoomId, participant: &Participant) -> Result<SlotMap, ChatError> {
        let handle = self.registry().admit(room_id, participant).await?;
        let state = handle.room().lock_open().await?;
        Ok(state.negotiation.overlap().clone())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::date;

    use super::*;

    fn slots(entries: &[(Date, &[u8])]) -> SlotMap {
        entries
            .iter()
            .map(|(date, hours)| (SlotDate(*date), hours.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn overlap_is_empty_until_both_sides_propose() {
        let mut negotiation = Negotiation::default();
        let overlap = negotiation.propose(Role::Buyer, slots(&[(date!(2024 - 06 - 02), &[9, 10, 11])]));
        assert!(overlap.is_empty());

        let overlap = negotiation.propose(Role::Seller, slots(&[(date!(2024 - 06 - 02), &[10, 11, 12])]));
        assert_eq!(overlap, &slots(&[(date!(2024 - 06 - 02), &[10, 11])]));
    }

    #[test]
    fn resubmission_replaces_instead_of_merging() {
        let day = date!(2024 - 06 - 01);
        let mut negotiation = Negotiation::default();
        negotiation.propose(Role::Seller, slots(&[(day, &[10, 14])]));
        negotiation.propose(Role::Buyer, slots(&[(day, &[9, 10])]));
        let overlap = negotiation.propose(Role::Buyer, slots(&[(day, &[14])]));

        assert_eq!(overlap, &slots(&[(day, &[14])]));
        assert_eq!(negotiation.proposal(Role::Buyer), Some(&slots(&[(day, &[14])])));
    }

    #[test]
    fn dates_proposed_by_one_side_are_excluded() {
        let mut negotiation = Negotiation::default();
        negotiation.propose(Role::Buyer, slots(&[(date!(2024 - 06 - 01), &[9]), (date!(2024 - 06 - 02), &[9])]));
        let overlap = negotiation.propose(Role::Seller, slots(&[(date!(2024 - 06 - 02), &[9, 10])]));

        assert_eq!(overlap, &slots(&[(date!(2024 - 06 - 02), &[9])]));
    }

    fn proposal(entries: &[(Date, &[i64])]) -> Proposal {
        entries
            .iter()
            .map(|(date, hours)| (SlotDate(*date), hours.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn window_rejects_hour_outside_daily_range() {
        let window = SlotWindow::default();
        let today = date!(2024 - 06 - 01);
        for hour in [22, 300, -1, 8] {
            let err = window.validate(today, &proposal(&[(today, &[10, hour])])).unwrap_err();
            assert!(matches!(err, ChatError::InvalidSlot { hour: rejected, .. } if rejected == hour));
        }
    }

    #[test]
    fn window_accepts_the_whole_bookable_grid() {
        let window = SlotWindow::default();
        let today = date!(2024 - 12 - 30);
        let hours: &[i64] = &[9, 15, 21];
        let grid: Vec<(Date, &[i64])> = (0..7).map(|offset| (today + Duration::days(offset), hours)).collect();

        let validated = window.validate(today, &proposal(&grid)).unwrap();
        assert_eq!(validated.len(), 7);
        assert_eq!(validated[&SlotDate(date!(2025 - 01 - 05))], BTreeSet::from([9, 15, 21]));
    }

    #[test]
    fn window_rejects_dates_outside_horizon() {
        let window = SlotWindow::default();
        let today = date!(2024 - 06 - 01);

        assert!(window.validate(today, &proposal(&[(date!(2024 - 06 - 07), &[9])])).is_ok());
        assert!(matches!(
            window.validate(today, &proposal(&[(date!(2024 - 06 - 08), &[9])])),
            Err(ChatError::DateOutOfHorizon { .. })
        ));
        assert!(matches!(
            window.validate(today, &proposal(&[(date!(2024 - 05 - 31), &[9])])),
            Err(ChatError::DateOutOfHorizon { .. })
        ));
    }

    #[test]
    fn oversized_hours_still_decode() {
        let raw: Proposal = serde_json::from_str(r#"{"2024-06-02":[300,-1]}"#).unwrap();
        assert_eq!(raw, proposal(&[(date!(2024 - 06 - 02), &[-1, 300])]));
    }

    #[test]
    fn slot_map_uses_plain_dates_on_the_wire() {
        let map: SlotMap = serde_json::from_str(r#"{"2024-06-02":[11,9,10]}"#).unwrap();
        assert_eq!(map, slots(&[(date!(2024 - 06 - 02), &[9, 10, 11])]));
        assert_eq!(serde_json::to_string(&map).unwrap(), r#"{"2024-06-02":[9,10,11]}"#);
        assert!(serde_json::from_str::<SlotMap>(r#"{"06/02/2024":[9]}"#).is_err());
    }

    fn slot_map() -> impl Strategy<Value = SlotMap> {
        prop::collection::btree_map(
            (0i64..7).prop_map(|offset| SlotDate(date!(2024 - 06 - 01) + Duration::days(offset))),
            prop::collection::btree_set(9u8..=21, 0..6),
            0..7,
        )
    }

    proptest! {
        #[test]
        fn prop_overlap_is_datewise_intersection(buyer in slot_map(), seller in slot_map()) {
            let mut negotiation = Negotiation::default();
            negotiation.propose(Role::Buyer, buyer.clone());
            let overlap = negotiation.propose(Role::Seller, seller.clone()).clone();

            for (date, hours) in &overlap {
                prop_assert!(buyer.contains_key(date) && seller.contains_key(date));
                let expected: BTreeSet<u8> = buyer[date].intersection(&seller[date]).copied().collect();
                prop_assert_eq!(hours, &expected);
            }
            for date in buyer.keys().filter(|date| seller.contains_key(*date)) {
                prop_assert!(overlap.contains_key(date));
            }
        }

        #[test]
        fn prop_latest_proposal_wins(first in slot_map(), second in slot_map(), seller in slot_map()) {
            let mut negotiation = Negotiation::default();
            negotiation.propose(Role::Seller, seller.clone());
            negotiation.propose(Role::Buyer, first);
            let overlap = negotiation.propose(Role::Buyer, second.clone()).clone();

            prop_assert_eq!(overlap, intersect(&second, &seller));
        }
    }
}
