//! Round-robin host assignment for drivers that pin jobs to nodes.

use std::sync::Mutex;

/// Cycles through a fixed host inventory, skipping hosts a request
/// excludes. Interior mutability keeps the cursor advancing across the
/// shared-reference calls the backend trait hands out.
#[derive(Debug)]
pub struct HostRotation {
    hosts: Vec<String>,
    cursor: Mutex<usize>,
}

impl HostRotation {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            cursor: Mutex::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Next host not on the exclusion list, advancing the cursor past it.
    /// Returns `None` when the inventory is empty or fully excluded.
    pub fn next_eligible(&self, exclude: &[String]) -> Option<String> {
        if self.hosts.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock().unwrap();
        for offset in 0..self.hosts.len() {
            let idx = (*cursor + offset) % self.hosts.len();
            if exclude.iter().any(|h| h == &self.hosts[idx]) {
                continue;
            }
            *cursor = idx + 1;
            return Some(self.hosts[idx].clone());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_wraps_round_robin() {
        let rotation = HostRotation::new(["a", "b", "c"]);
        let picks: Vec<String> = (0..5).map(|_| rotation.next_eligible(&[]).unwrap()).collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b"]);
    }

    #[test]
    fn excluded_hosts_are_skipped() {
        let rotation = HostRotation::new(["a", "b", "c"]);
        let exclude = vec!["b".to_string()];
        let picks: Vec<String> = (0..4)
            .map(|_| rotation.next_eligible(&exclude).unwrap())
            .collect();
        assert_eq!(picks, ["a", "c", "a", "c"]);
    }

    #[test]
    fn fully_excluded_inventory_yields_nothing() {
        let rotation = HostRotation::new(["a"]);
        assert_eq!(rotation.next_eligible(&["a".to_string()]), None);
        assert_eq!(HostRotation::new(Vec::<String>::new()).next_eligible(&[]), None);
    }
}
