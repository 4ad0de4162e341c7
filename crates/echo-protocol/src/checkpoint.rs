use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CheckpointStatus {
    #[default]
    Pending,
    Passed,
    Warning,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub status: CheckpointStatus,
    pub messages: Vec<String>,
}

/// Insertion-ordered diagnostic log. A checkpoint leaves Pending once, for
/// Passed, Warning or Failed. Passed and Failed are final; a Warning can
/// still become Failed when its step later errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointTracker {
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoints(names: &[&str]) -> Self {
        let mut ret = Self::new();
        for name in names {
            ret.add(name);
        }
        ret
    }

    pub fn add(&mut self, name: &str) {
        if self.get(name).is_none() {
            self.checkpoints.push(Checkpoint {
                name: name.to_string(),
                status: CheckpointStatus::Pending,
                messages: vec![],
            });
        }
    }

    pub fn get(&self, name: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.name == name)
    }

    fn get_or_add(&mut self, name: &str) -> &mut Checkpoint {
        self.add(name);
        let idx = self
            .checkpoints
            .iter()
            .position(|c| c.name == name)
            .unwrap_or(self.checkpoints.len() - 1);
        &mut self.checkpoints[idx]
    }

    pub fn status(&self, name: &str) -> Option<CheckpointStatus> {
        self.get(name).map(|c| c.status)
    }

    pub fn set_status(&mut self, name: &str, status: CheckpointStatus) {
        let checkpoint = self.get_or_add(name);
        let allowed = match checkpoint.status {
            CheckpointStatus::Pending => true,
            CheckpointStatus::Warning => status == CheckpointStatus::Failed,
            CheckpointStatus::Passed | CheckpointStatus::Failed => false,
        };
        if allowed {
            checkpoint.status = status;
        }
    }

    pub fn add_message(&mut self, name: &str, message: impl Into<String>) {
        self.get_or_add(name).messages.push(message.into());
    }

    pub fn warn(&mut self, name: &str, message: impl Into<String>) {
        self.add_message(name, message);
        self.set_status(name, CheckpointStatus::Warning);
    }

    pub fn fail(&mut self, name: &str, message: impl Into<String>) {
        self.add_message(name, message);
        self.set_status(name, CheckpointStatus::Failed);
    }

    /// Resolves a checkpoint that is still pending as passed.
    pub fn pass(&mut self, name: &str) {
        self.set_status(name, CheckpointStatus::Passed);
    }

    pub fn has_failures(&self) -> bool {
        self.checkpoints
            .iter()
            .any(|c| c.status == CheckpointStatus::Failed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_is_kept() {
        let mut tracker = CheckpointTracker::with_checkpoints(&["b", "a"]);
        tracker.add("c");
        tracker.add("a");
        let names = tracker.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_status_never_reverts() {
        let mut tracker = CheckpointTracker::with_checkpoints(&["x"]);
        assert_eq!(tracker.status("x"), Some(CheckpointStatus::Pending));
        tracker.warn("x", "low volume");
        tracker.pass("x");
        tracker.set_status("x", CheckpointStatus::Pending);
        assert_eq!(tracker.status("x"), Some(CheckpointStatus::Warning));
        assert_eq!(tracker.get("x").unwrap().messages, vec!["low volume"]);
        assert!(!tracker.has_failures());
        tracker.fail("x", "broken");
        assert!(tracker.has_failures());
    }

    #[test]
    fn test_resolved_checkpoints_are_final() {
        let mut tracker = CheckpointTracker::with_checkpoints(&["ok", "bad"]);
        tracker.pass("ok");
        tracker.warn("ok", "late note");
        tracker.set_status("ok", CheckpointStatus::Failed);
        assert_eq!(tracker.status("ok"), Some(CheckpointStatus::Passed));
        assert_eq!(tracker.get("ok").unwrap().messages, vec!["late note"]);

        tracker.fail("bad", "broken");
        tracker.warn("bad", "minor");
        tracker.pass("bad");
        assert_eq!(tracker.status("bad"), Some(CheckpointStatus::Failed));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut tracker = CheckpointTracker::with_checkpoints(&["x"]);
        let snapshot = tracker.clone();
        tracker.fail("x", "boom");
        assert!(!snapshot.has_failures());
        assert!(tracker.has_failures());
    }

    #[test]
    fn test_serde_roundtrip_keeps_order() {
        let mut tracker = CheckpointTracker::with_checkpoints(&["first", "second"]);
        tracker.warn("second", "careful");
        let json = serde_json::to_string(&tracker).unwrap();
        let back: CheckpointTracker = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tracker);
    }
}
