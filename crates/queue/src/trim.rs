//! Ready-made trim functions.

use std::sync::Arc;

use baton_core::QueueItem;

use crate::config::TrimFn;

/// Keep at most `max` items, dropping the oldest first.
pub fn cap(max: usize) -> TrimFn {
    Arc::new(move |mut queue: Vec<QueueItem>| {
        if queue.len() > max {
            queue.drain(..queue.len() - max);
        }
        queue
    })
}

/// Strip the named payload fields from every item (e.g. to redact values
/// before they are persisted).
pub fn redact(fields: &[&str]) -> TrimFn {
    let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    Arc::new(move |mut queue: Vec<QueueItem>| {
        for item in &mut queue {
            for field in &fields {
                item.fields.remove(field);
            }
        }
        queue
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items(n: i64) -> Vec<QueueItem> {
        (0..n)
            .map(|i| QueueItem::new(json!({ "i": i, "secret": "x" }), i).unwrap())
            .collect()
    }

    #[test]
    fn cap_keeps_newest() {
        let trimmed = cap(3)(items(5));
        let ts: Vec<_> = trimmed.iter().map(|i| i.ts).collect();
        assert_eq!(ts, vec![2, 3, 4]);
    }

    #[test]
    fn cap_leaves_short_queues_alone() {
        assert_eq!(cap(10)(items(4)).len(), 4);
    }

    #[test]
    fn redact_removes_fields() {
        let trimmed = redact(&["secret"])(items(2));
        assert!(trimmed.iter().all(|i| i.field("secret").is_none()));
        assert!(trimmed.iter().all(|i| i.field("i").is_some()));
    }
}
