//! Reservation types, the ticket payload and queue ordering.
//!
//! A reservation node is named `{PREFIX}_{sequence}` where the sequence is
//! assigned by the store. Queue order is ascending sequence order, compared
//! numerically: the zero padding is a presentation detail and does not bound
//! the value.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoordError, CoordResult};

/// Delimiter between a reservation prefix and its sequence number.
pub const SEQUENCE_DELIMITER: char = '_';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationType {
    LockExclusive,
    LockShared,
    Semaphore,
    Barrier,
}

impl ReservationType {
    pub const ALL: [ReservationType; 4] = [
        ReservationType::LockExclusive,
        ReservationType::LockShared,
        ReservationType::Semaphore,
        ReservationType::Barrier,
    ];

    /// Storage sub-path under the cluster.
    pub fn category(&self) -> &'static str {
        match self {
            ReservationType::LockExclusive | ReservationType::LockShared => "lock",
            ReservationType::Semaphore => "semaphore",
            ReservationType::Barrier => "barrier",
        }
    }

    /// Node name prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            ReservationType::LockExclusive => "EX",
            ReservationType::LockShared => "SH",
            ReservationType::Semaphore => "PT",
            ReservationType::Barrier => "BR",
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, ReservationType::LockExclusive)
    }

    /// Resolves the type from a reservation node name such as `EX_0000000003`.
    pub fn from_reservation_name(name: &str) -> CoordResult<Self> {
        let prefix = name
            .rsplit_once(SEQUENCE_DELIMITER)
            .map(|(prefix, _)| prefix)
            .unwrap_or(name);
        Self::ALL
            .into_iter()
            .find(|t| t.prefix() == prefix)
            .ok_or_else(|| CoordError::UnknownReservationPrefix(name.to_owned()))
    }

    /// Resolves the type stored under a category path segment. `lock` holds
    /// both lock types and resolves to the exclusive one.
    pub fn from_category(category: &str) -> CoordResult<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.category() == category)
            .ok_or_else(|| CoordError::Config(format!("unknown category {category:?}")))
    }

    /// True when `name` is a reservation node of this type.
    pub fn matches(&self, name: &str) -> bool {
        name.strip_prefix(self.prefix())
            .is_some_and(|rest| rest.starts_with(SEQUENCE_DELIMITER))
    }
}

impl fmt::Display for ReservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationType::LockExclusive => write!(f, "lock_exclusive"),
            ReservationType::LockShared => write!(f, "lock_shared"),
            ReservationType::Semaphore => write!(f, "semaphore"),
            ReservationType::Barrier => write!(f, "barrier"),
        }
    }
}

/// Payload stored in every reservation node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationPayload {
    pub owner_id: String,
}

impl ReservationPayload {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
        }
    }

    pub fn encode(&self) -> CoordResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> CoordResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Sequence suffix of a reservation name, ordered as an unbounded integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequence<'a>(&'a str);

impl<'a> Sequence<'a> {
    /// Parses the digits after the last delimiter of `name` (or a full path).
    pub fn parse(name: &'a str) -> CoordResult<Self> {
        let digits = name
            .rsplit_once(SEQUENCE_DELIMITER)
            .map(|(_, digits)| digits)
            .ok_or_else(|| CoordError::InvalidSequence(name.to_owned()))?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoordError::InvalidSequence(name.to_owned()));
        }
        let significant = digits.trim_start_matches('0');
        Ok(Sequence(significant))
    }

    /// Numeric value when it fits in a `u64`.
    pub fn value(&self) -> Option<u64> {
        if self.0.is_empty() {
            return Some(0);
        }
        self.0.parse().ok()
    }
}

impl Ord for Sequence<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // leading zeros are stripped, so a longer digit string is a larger number
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(other.0))
    }
}

impl PartialOrd for Sequence<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compares two reservation names by sequence; absent names sort first.
pub fn compare_reservations(a: Option<&str>, b: Option<&str>) -> CoordResult<Ordering> {
    match (a, b) {
        (None, None) => Ok(Ordering::Equal),
        (None, Some(_)) => Ok(Ordering::Less),
        (Some(_), None) => Ok(Ordering::Greater),
        (Some(a), Some(b)) => Ok(Sequence::parse(a)?.cmp(&Sequence::parse(b)?)),
    }
}

/// Sorts reservation names into queue order.
///
/// Every name is validated before anything is reordered, so a malformed
/// sibling fails the whole sort.
pub fn sort_reservations(names: &mut [String]) -> CoordResult<()> {
    for name in names.iter() {
        Sequence::parse(name)?;
    }
    names.sort_by(|a, b| match (Sequence::parse(a), Sequence::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => Ordering::Equal,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_metadata() {
        assert_eq!(ReservationType::LockExclusive.prefix(), "EX");
        assert_eq!(ReservationType::LockShared.prefix(), "SH");
        assert_eq!(ReservationType::Semaphore.prefix(), "PT");
        assert_eq!(ReservationType::Barrier.prefix(), "BR");
        assert_eq!(ReservationType::LockShared.category(), "lock");
        assert_eq!(ReservationType::LockExclusive.category(), "lock");
        assert_eq!(ReservationType::Semaphore.category(), "semaphore");
        assert!(ReservationType::LockExclusive.is_exclusive());
        assert!(!ReservationType::Semaphore.is_exclusive());
    }

    #[test]
    fn test_from_reservation_name() {
        assert_eq!(
            ReservationType::from_reservation_name("EX_0000000001").unwrap(),
            ReservationType::LockExclusive
        );
        assert_eq!(
            ReservationType::from_reservation_name("PT_0000000001").unwrap(),
            ReservationType::Semaphore
        );
        assert!(ReservationType::from_reservation_name("XX_0000000001").is_err());
        assert!(ReservationType::LockShared.matches("SH_0000000009"));
        assert!(!ReservationType::LockShared.matches("SHX_0000000009"));
    }

    #[test]
    fn test_from_category() {
        assert_eq!(
            ReservationType::from_category("lock").unwrap(),
            ReservationType::LockExclusive
        );
        assert_eq!(
            ReservationType::from_category("barrier").unwrap(),
            ReservationType::Barrier
        );
        assert!(ReservationType::from_category("queue").unwrap_err().is_config());
    }

    #[test]
    fn test_compare_numeric_not_lexical() {
        // a counter that outgrew the padding must still sort after padded ones
        assert_eq!(
            compare_reservations(Some("EX_9999999999"), Some("EX_10000000000")).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            compare_reservations(Some("SH_0000000010"), Some("EX_0000000002")).unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            compare_reservations(Some("EX_0000000000"), Some("SH_0")).unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            compare_reservations(None, Some("EX_0000000001")).unwrap(),
            Ordering::Less
        );
        assert_eq!(compare_reservations(None, None).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_compare_rejects_malformed_names() {
        assert!(compare_reservations(Some("EX"), Some("EX_0000000001")).is_err());
        assert!(compare_reservations(Some("EX_12a"), Some("EX_0000000001")).is_err());
        assert!(compare_reservations(Some("EX_"), Some("EX_0000000001")).is_err());
    }

    #[test]
    fn test_sort_reservations() {
        let mut names = vec![
            "SH_0000000003".to_owned(),
            "EX_10000000000".to_owned(),
            "EX_0000000001".to_owned(),
            "SH_0000000002".to_owned(),
        ];
        sort_reservations(&mut names).unwrap();
        assert_eq!(
            names,
            vec![
                "EX_0000000001",
                "SH_0000000002",
                "SH_0000000003",
                "EX_10000000000"
            ]
        );

        let mut bad = vec!["EX_0000000001".to_owned(), "garbage".to_owned()];
        let err = sort_reservations(&mut bad).unwrap_err();
        assert!(matches!(err, CoordError::InvalidSequence(name) if name == "garbage"));
    }

    #[test]
    fn test_sequence_value() {
        assert_eq!(Sequence::parse("EX_0000000000").unwrap().value(), Some(0));
        assert_eq!(Sequence::parse("EX_0000000042").unwrap().value(), Some(42));
    }

    #[test]
    fn test_payload_codec() {
        let payload = ReservationPayload::new("owner-1");
        let bytes = payload.encode().unwrap();
        assert_eq!(bytes, br#"{"ownerId":"owner-1"}"#);
        assert_eq!(ReservationPayload::decode(&bytes).unwrap(), payload);
        assert!(ReservationPayload::decode(b"{").is_err());
    }
}
