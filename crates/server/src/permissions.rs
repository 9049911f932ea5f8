//! Pending permission requests for one session, in arrival order

use companion_protocol::PermissionRequest;

#[derive(Debug, Clone, Default)]
pub struct PermissionQueue {
    pending: Vec<PermissionRequest>,
}

impl PermissionQueue {
    /// Insert a request. Re-adding a pending id refreshes its payload in
    /// place and returns false.
    pub fn add(&mut self, request: PermissionRequest) -> bool {
        match self
            .pending
            .iter_mut()
            .find(|p| p.request_id == request.request_id)
        {
            Some(existing) => {
                *existing = request;
                false
            }
            None => {
                self.pending.push(request);
                true
            }
        }
    }

    pub fn remove(&mut self, request_id: &str) -> Option<PermissionRequest> {
        let index = self
            .pending
            .iter()
            .position(|p| p.request_id == request_id)?;
        Some(self.pending.remove(index))
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.iter().any(|p| p.request_id == request_id)
    }

    /// Drop everything; returns how many were pending.
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn list(&self) -> &[PermissionRequest] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn request(id: &str, tool: &str) -> PermissionRequest {
        let mut payload = Map::new();
        payload.insert("tool_name".to_string(), Value::String(tool.to_string()));
        PermissionRequest {
            request_id: id.to_string(),
            payload,
        }
    }

    #[test]
    fn keeps_arrival_order() {
        let mut queue = PermissionQueue::default();
        assert!(queue.add(request("r1", "Bash")));
        assert!(queue.add(request("r2", "Edit")));
        assert!(queue.add(request("r3", "Write")));

        let ids: Vec<_> = queue.list().iter().map(|p| p.request_id.as_str()).collect();
        assert_eq!(ids, ["r1", "r2", "r3"]);
    }

    #[test]
    fn re_adding_refreshes_in_place() {
        let mut queue = PermissionQueue::default();
        queue.add(request("r1", "Bash"));
        queue.add(request("r2", "Edit"));
        assert!(!queue.add(request("r1", "Write")));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.list()[0].tool_name(), Some("Write"));
        assert_eq!(queue.list()[1].request_id, "r2");
    }

    #[test]
    fn remove_only_touches_the_named_request() {
        let mut queue = PermissionQueue::default();
        queue.add(request("r1", "Bash"));
        queue.add(request("r2", "Edit"));

        let removed = queue.remove("r1").expect("removed");
        assert_eq!(removed.payload.get("tool_name"), Some(&json!("Bash")));
        assert!(queue.remove("r1").is_none());
        assert!(queue.contains("r2"));
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
    }
}
