/// Key layout for a single namespace tag.
///
/// | purpose      | key           |
/// | ------------ | ------------- |
/// | cached value | `T:R`         |
/// | lock         | `T/lock:R`    |
/// | notification | `T/notif:R`   |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    tag: String,
}

impl KeySpace {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn resource_key(&self, resource_id: &str) -> String {
        format!("{}:{resource_id}", self.tag)
    }

    pub fn lock_key(&self, resource_id: &str) -> String {
        format!("{}/lock:{resource_id}", self.tag)
    }

    pub fn notification_channel(&self, resource_id: &str) -> String {
        format!("{}/notif:{resource_id}", self.tag)
    }

    /// Pattern matching every notification channel of this namespace.
    pub fn notification_pattern(&self) -> String {
        format!("{}/notif:*", self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let keys = KeySpace::new("gdsp");
        assert_eq!(keys.resource_key("AA-1"), "gdsp:AA-1");
        assert_eq!(keys.lock_key("AA-1"), "gdsp/lock:AA-1");
        assert_eq!(keys.notification_channel("AA-1"), "gdsp/notif:AA-1");
        assert_eq!(keys.notification_pattern(), "gdsp/notif:*");
    }

    #[test]
    fn pattern_covers_channels() {
        let keys = KeySpace::new("t");
        let pattern = crate::memory::compile_pattern(&keys.notification_pattern()).unwrap();
        assert!(pattern.matches(&keys.notification_channel("x:y")));
        assert!(!pattern.matches(&keys.lock_key("x")));
    }
}
