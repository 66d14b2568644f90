//! Tree flattening
//!
//! Hierarchical source records (the category tree) nest their children under
//! `children_data`. Before any item is queued the tree is flattened into one
//! list with an explicit stack, so arbitrarily deep trees never recurse.

use serde_json::Value;

pub const CHILDREN_FIELD: &str = "children_data";

/// An item with its depth in the source tree (0 for top-level items)
#[derive(Debug, Clone, PartialEq)]
pub struct FlatItem {
    pub item: Value,
    pub depth: u32,
}

/// Flatten items and their `children_data` descendants, parents first
///
/// Sibling order is preserved. Parents keep their `children_data` field.
pub fn flatten(items: Vec<Value>) -> Vec<FlatItem> {
    let mut flat = Vec::with_capacity(items.len());
    // Reversed so popping yields items in source order
    let mut stack: Vec<(Value, u32)> = items.into_iter().rev().map(|item| (item, 0)).collect();

    while let Some((item, depth)) = stack.pop() {
        if let Some(Value::Array(children)) = item.get(CHILDREN_FIELD) {
            for child in children.iter().rev() {
                if child.is_object() {
                    stack.push((child.clone(), depth + 1));
                }
            }
        }
        flat.push(FlatItem { item, depth });
    }

    flat
}
