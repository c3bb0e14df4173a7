//! Topic name and topic id bindings.

use heapless::{String, Vec};

use crate::error::MqttsnError;
use crate::packet::{ShortName, Topic, TopicId};

/// Maximum length for a long topic name.
pub const MAX_TOPIC_NAME_LEN: usize = 49;

/// Copies a long topic name into owned storage.
pub(crate) fn topic_name(name: &str) -> Result<String<MAX_TOPIC_NAME_LEN>, MqttsnError> {
    if name.is_empty() {
        return Err(MqttsnError::InvalidArgs);
    }
    let mut owned: String<MAX_TOPIC_NAME_LEN> = String::new();
    owned.push_str(name).map_err(|_| MqttsnError::InvalidArgs)?;
    Ok(owned)
}

/// How a binding came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TopicKind {
    /// Assigned by the gateway through REGACK, SUBACK or an inbound REGISTER.
    Normal,
    /// Known out-of-band to both sides.
    Predefined,
    ShortName,
}

/// One name to id binding. Entries are never modified; binding a name again
/// replaces the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEntry {
    pub id: TopicId,
    pub kind: TopicKind,
    pub name: String<MAX_TOPIC_NAME_LEN>,
}

impl TopicEntry {
    pub fn topic(&self) -> Topic {
        match self.kind {
            TopicKind::Normal => Topic::Normal(self.id),
            TopicKind::Predefined => Topic::Predefined(self.id),
            TopicKind::ShortName => Topic::Short(ShortName::from_topic_id(self.id)),
        }
    }
}

/// What it takes to obtain an id for a topic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The id is known without talking to the gateway.
    Resolved(Topic),
    /// A REGISTER/REGACK round trip is needed.
    Pending,
}

/// A fixed-capacity registry of topic bindings.
///
/// Short names never occupy a slot since their id is the name itself.
///
/// # Example
///
/// ```ignore
/// let mut registry = TopicRegistry::<8>::new();
/// registry.bind("sensor/temp", 5)?;
/// assert_eq!(registry.resolve(5), Some("sensor/temp"));
/// ```
#[derive(Debug, Default)]
pub struct TopicRegistry<const MAX_TOPICS: usize> {
    entries: Vec<TopicEntry, MAX_TOPICS>,
}

impl<const MAX_TOPICS: usize> TopicRegistry<MAX_TOPICS> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies a topic name for registration.
    ///
    /// One and two character names resolve immediately to their short form.
    /// Longer names always need a round trip, even if a stale binding exists.
    pub fn register(&self, name: &str) -> Result<Registration, MqttsnError> {
        if name.is_empty() || name.len() > MAX_TOPIC_NAME_LEN {
            return Err(MqttsnError::InvalidArgs);
        }
        if name.len() <= 2 {
            return ShortName::new(name).map(|short| Registration::Resolved(Topic::Short(short)));
        }
        Ok(Registration::Pending)
    }

    /// Looks up the name bound to a gateway-assigned id.
    pub fn resolve(&self, id: TopicId) -> Option<&str> {
        self.find(TopicKind::Normal, id).map(|e| e.name.as_str())
    }

    /// Looks up the name behind any topic reference.
    pub fn resolve_topic<'t>(&'t self, topic: &'t Topic) -> Option<&'t str> {
        match topic {
            Topic::Normal(id) => self.resolve(*id),
            Topic::Predefined(id) => self
                .find(TopicKind::Predefined, *id)
                .map(|e| e.name.as_str()),
            Topic::Short(short) => Some(short.as_str()),
        }
    }

    /// Looks up the id to publish a name under.
    pub fn resolve_id(&self, name: &str) -> Option<Topic> {
        if (1..=2).contains(&name.len())
            && let Ok(short) = ShortName::new(name)
        {
            return Some(Topic::Short(short));
        }
        self.entries
            .iter()
            .find(|e| e.name.as_str() == name)
            .map(TopicEntry::topic)
    }

    /// Records a gateway-assigned id for `name`, superseding older bindings
    /// of the same name or id.
    pub fn bind(&mut self, name: &str, id: TopicId) -> Result<(), MqttsnError> {
        self.insert(name, id, TopicKind::Normal)
    }

    /// Makes a predefined id resolvable to a name for inbound messages.
    pub fn add_predefined(&mut self, name: &str, id: TopicId) -> Result<(), MqttsnError> {
        self.insert(name, id, TopicKind::Predefined)
    }

    fn insert(&mut self, name: &str, id: TopicId, kind: TopicKind) -> Result<(), MqttsnError> {
        if id == 0 {
            return Err(MqttsnError::InvalidArgs);
        }
        let owned = topic_name(name)?;

        self.entries
            .retain(|e| e.name.as_str() != name && !(e.kind == kind && e.id == id));
        self.entries
            .push(TopicEntry {
                id,
                kind,
                name: owned,
            })
            .map_err(|_| MqttsnError::ResourceExhausted)
    }

    fn find(&self, kind: TopicKind, id: TopicId) -> Option<&TopicEntry> {
        self.entries.iter().find(|e| e.kind == kind && e.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopicEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every binding.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_names_resolve_synchronously() {
        let registry = TopicRegistry::<4>::new();
        let short = ShortName::new("ab").unwrap();
        assert_eq!(
            registry.register("ab"),
            Ok(Registration::Resolved(Topic::Short(short)))
        );
        assert_eq!(registry.register("sensor/temp"), Ok(Registration::Pending));
        assert_eq!(registry.register(""), Err(MqttsnError::InvalidArgs));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_long_name_unresolvable_until_bound() {
        let mut registry = TopicRegistry::<4>::new();
        assert_eq!(registry.resolve_id("sensor/temp"), None);

        registry.bind("sensor/temp", 5).unwrap();
        assert_eq!(registry.resolve_id("sensor/temp"), Some(Topic::Normal(5)));
        assert_eq!(registry.resolve(5), Some("sensor/temp"));
        assert_eq!(registry.resolve(6), None);
    }

    #[test]
    fn test_rebinding_supersedes_old_entry() {
        let mut registry = TopicRegistry::<4>::new();
        registry.bind("sensor/temp", 5).unwrap();
        registry.bind("sensor/temp", 9).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve(5), None);
        assert_eq!(registry.resolve(9), Some("sensor/temp"));

        registry.bind("sensor/hum", 9).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve_id("sensor/temp"), None);
    }

    #[test]
    fn test_predefined_ids_do_not_collide_with_normal_ids() {
        let mut registry = TopicRegistry::<4>::new();
        registry.bind("sensor/temp", 5).unwrap();
        registry.add_predefined("config/reset", 5).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.resolve_topic(&Topic::Predefined(5)),
            Some("config/reset")
        );
        assert_eq!(registry.resolve_topic(&Topic::Normal(5)), Some("sensor/temp"));
    }

    #[test]
    fn test_full_registry_fails_closed() {
        let mut registry = TopicRegistry::<1>::new();
        registry.bind("sensor/temp", 5).unwrap();
        assert_eq!(
            registry.bind("sensor/hum", 6),
            Err(MqttsnError::ResourceExhausted)
        );
        assert_eq!(registry.resolve(5), Some("sensor/temp"));
    }

    #[test]
    fn test_clear() {
        let mut registry = TopicRegistry::<2>::new();
        registry.bind("sensor/temp", 5).unwrap();
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.bind("x/y", 0), Err(MqttsnError::InvalidArgs));
    }
}
