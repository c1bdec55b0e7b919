//! Match rules for broadcasts and notifications.
//!
//! A connection receives a broadcast or a name/id notification only if one
//! of its rules matches. A rule matches when its source-id restriction
//! admits the sender and every one of its items is satisfied; a rule without
//! items matches nothing.

use serde::{Deserialize, Serialize};

use crate::bloom;
use crate::error::{BusError, BusResult};
use crate::message::{Notification, SRC_ID_KERNEL};
use crate::names::validate_name;

/// Source id restriction meaning "any sender".
pub const MATCH_SRC_ID_ANY: u64 = u64::MAX;

/// Id filter meaning "any connection" in `IdAdd`/`IdRemove` items.
pub const MATCH_ID_ANY: u64 = u64::MAX;

/// One condition of a match rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MatchItem {
    /// Every bit of the mask must be set in the message's bloom filter.
    Bloom(Vec<u8>),
    /// The sender must own this name.
    SrcName(String),
    /// A `NAME_ADD` for this name.
    NameAdd(String),
    /// A `NAME_REMOVE` for this name.
    NameRemove(String),
    /// A `NAME_CHANGE` for this name.
    NameChange(String),
    /// An `ID_ADD` for this id, or [`MATCH_ID_ANY`].
    IdAdd(u64),
    /// An `ID_REMOVE` for this id, or [`MATCH_ID_ANY`].
    IdRemove(u64),
}

/// A match rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    /// Rules sharing a cookie are removed together.
    pub cookie: u64,
    /// Required sender, or [`MATCH_SRC_ID_ANY`].
    #[serde(default = "any_src")]
    pub src_id: u64,
    /// All must be satisfied.
    pub items: Vec<MatchItem>,
}

const fn any_src() -> u64 {
    MATCH_SRC_ID_ANY
}

impl MatchRule {
    /// A rule for any sender.
    #[must_use]
    pub const fn new(cookie: u64) -> Self {
        Self {
            cookie,
            src_id: MATCH_SRC_ID_ANY,
            items: Vec::new(),
        }
    }

    /// Restricts the rule to one sender.
    #[must_use]
    pub const fn from_sender(mut self, src_id: u64) -> Self {
        self.src_id = src_id;
        self
    }

    /// Adds a condition.
    #[must_use]
    pub fn with(mut self, item: MatchItem) -> Self {
        self.items.push(item);
        self
    }

    /// Returns `true` if this rule selects `event`.
    #[must_use]
    pub fn matches(&self, event: &MatchEvent<'_>) -> bool {
        if self.items.is_empty() {
            return false;
        }
        if self.src_id != MATCH_SRC_ID_ANY && self.src_id != event.src_id() {
            return false;
        }
        self.items.iter().all(|item| item.satisfied_by(event))
    }

    fn validate(&self, bloom_size: usize) -> BusResult<()> {
        for item in &self.items {
            match item {
                MatchItem::Bloom(mask) if mask.len() != bloom_size => {
                    return Err(BusError::BloomSizeMismatch {
                        actual: mask.len(),
                        expected: bloom_size,
                    });
                },
                MatchItem::SrcName(name)
                | MatchItem::NameAdd(name)
                | MatchItem::NameRemove(name)
                | MatchItem::NameChange(name) => validate_name(name)?,
                _ => {},
            }
        }
        Ok(())
    }
}

impl MatchItem {
    fn satisfied_by(&self, event: &MatchEvent<'_>) -> bool {
        match (self, event) {
            (
                Self::Bloom(mask),
                MatchEvent::Message {
                    bloom: Some(filter),
                    ..
                },
            ) => bloom::is_subset(mask, filter),
            (Self::SrcName(name), MatchEvent::Message { src_names, .. }) => {
                src_names.iter().any(|n| n == name)
            },
            (Self::NameAdd(name), MatchEvent::Notification(Notification::NameAdd(c)))
            | (Self::NameRemove(name), MatchEvent::Notification(Notification::NameRemove(c)))
            | (Self::NameChange(name), MatchEvent::Notification(Notification::NameChange(c))) => {
                c.name == *name
            },
            (Self::IdAdd(id), MatchEvent::Notification(Notification::IdAdd(c)))
            | (Self::IdRemove(id), MatchEvent::Notification(Notification::IdRemove(c))) => {
                *id == MATCH_ID_ANY || c.id == *id
            },
            _ => false,
        }
    }
}

/// What a rule is evaluated against.
#[derive(Debug, Clone, Copy)]
pub enum MatchEvent<'a> {
    /// A broadcast from a connection.
    Message {
        /// Sender id.
        src_id: u64,
        /// Names the sender owns.
        src_names: &'a [String],
        /// Bloom filter attached by the sender.
        bloom: Option<&'a [u8]>,
    },
    /// A bus notification.
    Notification(&'a Notification),
}

impl MatchEvent<'_> {
    /// Sender of the event; notifications come from the bus itself.
    #[must_use]
    pub const fn src_id(&self) -> u64 {
        match self {
            Self::Message { src_id, .. } => *src_id,
            Self::Notification(_) => SRC_ID_KERNEL,
        }
    }
}

/// The rules installed by one connection.
#[derive(Debug, Default)]
pub struct MatchDb {
    rules: Vec<MatchRule>,
}

impl MatchDb {
    /// Installs a rule.
    ///
    /// # Errors
    ///
    /// - [`BusError::TooManyMatches`] at `max_rules`
    /// - [`BusError::BloomSizeMismatch`] if a mask is not `bloom_size` bytes
    /// - [`BusError::InvalidName`] for malformed name items
    pub fn add(&mut self, rule: MatchRule, bloom_size: usize, max_rules: usize) -> BusResult<()> {
        if self.rules.len() >= max_rules {
            return Err(BusError::TooManyMatches { max: max_rules });
        }
        rule.validate(bloom_size)?;
        self.rules.push(rule);
        Ok(())
    }

    /// Removes every rule with `cookie` and returns how many there were.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidArgument`] if no rule has that cookie.
    pub fn remove(&mut self, cookie: u64) -> BusResult<usize> {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.cookie != cookie);
        match before - self.rules.len() {
            0 => Err(BusError::invalid_argument(format!(
                "no match rule with cookie {cookie}"
            ))),
            removed => Ok(removed),
        }
    }

    /// Returns `true` if any rule matches `event`.
    #[must_use]
    pub fn matches(&self, event: &MatchEvent<'_>) -> bool {
        self.rules.iter().any(|rule| rule.matches(event))
    }

    /// Number of installed rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if no rule is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::BloomFilter;
    use crate::item::{IdChange, NameChange};

    fn name_change(name: &str) -> Notification {
        Notification::NameChange(NameChange {
            old_id: 1,
            new_id: 2,
            flags: 0,
            name: name.to_string(),
        })
    }

    #[test]
    fn test_empty_rule_never_matches() {
        let rule = MatchRule::new(1);
        let note = name_change("org.x");
        assert!(!rule.matches(&MatchEvent::Notification(&note)));
        assert!(!rule.matches(&MatchEvent::Message {
            src_id: 5,
            src_names: &[],
            bloom: None,
        }));
    }

    #[test]
    fn test_name_change_rule() {
        let rule = MatchRule::new(1).with(MatchItem::NameChange("org.x".to_string()));
        assert!(rule.matches(&MatchEvent::Notification(&name_change("org.x"))));
        assert!(!rule.matches(&MatchEvent::Notification(&name_change("org.y"))));

        let add = Notification::NameAdd(NameChange {
            old_id: 0,
            new_id: 2,
            flags: 0,
            name: "org.x".to_string(),
        });
        assert!(!rule.matches(&MatchEvent::Notification(&add)));
    }

    #[test]
    fn test_id_rules_and_wildcard() {
        let exact = MatchRule::new(1).with(MatchItem::IdRemove(7));
        let any = MatchRule::new(2).with(MatchItem::IdRemove(MATCH_ID_ANY));
        let gone = Notification::IdRemove(IdChange { id: 7, flags: 0 });
        let other = Notification::IdRemove(IdChange { id: 8, flags: 0 });

        assert!(exact.matches(&MatchEvent::Notification(&gone)));
        assert!(!exact.matches(&MatchEvent::Notification(&other)));
        assert!(any.matches(&MatchEvent::Notification(&other)));
    }

    #[test]
    fn test_all_items_must_hold() {
        let mask = BloomFilter::new(8).unwrap().with(b"member:Changed");
        let rule = MatchRule::new(1)
            .with(MatchItem::Bloom(mask.as_bytes().to_vec()))
            .with(MatchItem::SrcName("org.sender".to_string()));

        let names = vec!["org.sender".to_string()];
        let filter = BloomFilter::new(8).unwrap().with(b"member:Changed");
        assert!(rule.matches(&MatchEvent::Message {
            src_id: 3,
            src_names: &names,
            bloom: Some(filter.as_bytes()),
        }));
        assert!(!rule.matches(&MatchEvent::Message {
            src_id: 3,
            src_names: &[],
            bloom: Some(filter.as_bytes()),
        }));
        assert!(!rule.matches(&MatchEvent::Message {
            src_id: 3,
            src_names: &names,
            bloom: None,
        }));
    }

    #[test]
    fn test_src_id_restriction() {
        let names = vec!["org.sender".to_string()];
        let rule = MatchRule::new(1)
            .from_sender(3)
            .with(MatchItem::SrcName("org.sender".to_string()));
        let from = |src_id| MatchEvent::Message {
            src_id,
            src_names: &names,
            bloom: None,
        };
        assert!(rule.matches(&from(3)));
        assert!(!rule.matches(&from(4)));
    }

    #[test]
    fn test_db_limits_and_validation() {
        let mut db = MatchDb::default();
        db.add(MatchRule::new(1).with(MatchItem::IdAdd(MATCH_ID_ANY)), 8, 2)
            .unwrap();
        assert_eq!(
            db.add(MatchRule::new(2).with(MatchItem::Bloom(vec![0; 16])), 8, 2),
            Err(BusError::BloomSizeMismatch {
                actual: 16,
                expected: 8,
            })
        );
        assert!(matches!(
            db.add(MatchRule::new(2).with(MatchItem::NameAdd("bad".to_string())), 8, 2),
            Err(BusError::InvalidName { .. })
        ));
        db.add(MatchRule::new(1).with(MatchItem::IdRemove(4)), 8, 2)
            .unwrap();
        assert_eq!(
            db.add(MatchRule::new(3), 8, 2),
            Err(BusError::TooManyMatches { max: 2 })
        );
    }

    #[test]
    fn test_remove_by_cookie_removes_all() {
        let mut db = MatchDb::default();
        db.add(MatchRule::new(1).with(MatchItem::IdAdd(1)), 8, 8).unwrap();
        db.add(MatchRule::new(1).with(MatchItem::IdAdd(2)), 8, 8).unwrap();
        db.add(MatchRule::new(2).with(MatchItem::IdAdd(3)), 8, 8).unwrap();
        assert_eq!(db.remove(1).unwrap(), 2);
        assert_eq!(db.len(), 1);
        assert!(db.remove(1).is_err());
    }
}
