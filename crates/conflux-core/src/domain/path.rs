//! Query-path expressions over JSON context trees
//!
//! Mapping rules address data with dot/bracket notation: `order.items[0].sku`,
//! `items[*].price`. Resolution is side-effect-free and never fails on missing
//! intermediate nodes; callers get `None` and apply their own defaults. The
//! same expressions are used for assignment when merging step output back into
//! the context, which is why this is a dedicated parser rather than a JMESPath
//! query (JMESPath has no write path).

use crate::error::EngineError;
use serde_json::{Map, Value};

/// One component of a parsed path expression
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Object key lookup: `order`
    Key(String),
    /// Array index lookup: `[2]`
    Index(usize),
    /// Collection query over every array element: `[*]`
    Wildcard,
}

/// A parsed, validated path expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    raw: String,
    segments: Vec<Segment>,
}

impl PathExpr {
    /// Parse a path expression.
    ///
    /// `$` denotes the whole document. Syntax errors are configuration
    /// errors: a flow shipping an unparsable mapping path is misauthored,
    /// and retrying will not fix it.
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Configuration(
                "Empty path expression".to_string(),
            ));
        }

        if trimmed == "$" {
            return Ok(Self {
                raw: trimmed.to_string(),
                segments: Vec::new(),
            });
        }

        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            Self::parse_part(trimmed, part, &mut segments)?;
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    /// Parse one dot-separated part: an identifier followed by zero or more
    /// bracket groups, e.g. `items[0][*]`.
    fn parse_part(
        whole: &str,
        part: &str,
        segments: &mut Vec<Segment>,
    ) -> Result<(), EngineError> {
        let bracket_start = part.find('[').unwrap_or(part.len());
        let (head, mut rest) = part.split_at(bracket_start);

        if head.is_empty() && rest.is_empty() {
            return Err(EngineError::Configuration(format!(
                "Empty segment in path expression: {}",
                whole
            )));
        }
        if head.contains(']') {
            return Err(EngineError::Configuration(format!(
                "Unbalanced bracket in path expression: {}",
                whole
            )));
        }
        if !head.is_empty() {
            segments.push(Segment::Key(head.to_string()));
        }

        while !rest.is_empty() {
            let inner_end = rest.find(']').ok_or_else(|| {
                EngineError::Configuration(format!(
                    "Unbalanced bracket in path expression: {}",
                    whole
                ))
            })?;
            let inner = &rest[1..inner_end];

            if inner == "*" {
                segments.push(Segment::Wildcard);
            } else {
                let index = inner.parse::<usize>().map_err(|_| {
                    EngineError::Configuration(format!(
                        "Invalid array index '{}' in path expression: {}",
                        inner, whole
                    ))
                })?;
                segments.push(Segment::Index(index));
            }

            rest = &rest[inner_end + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(EngineError::Configuration(format!(
                    "Unexpected characters after bracket in path expression: {}",
                    whole
                )));
            }
        }

        Ok(())
    }

    /// The original expression string
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the expression contains a wildcard segment
    pub fn has_wildcard(&self) -> bool {
        self.segments.contains(&Segment::Wildcard)
    }

    /// Evaluate the expression against a context tree.
    ///
    /// Returns `None` when any node along the path is missing or of the
    /// wrong shape. Wildcards collect matches from every array element into
    /// a fresh array; an empty source array resolves to an empty array, not
    /// `None`.
    pub fn resolve(&self, root: &Value) -> Option<Value> {
        Self::resolve_from(&self.segments, root)
    }

    fn resolve_from(segments: &[Segment], current: &Value) -> Option<Value> {
        let (first, rest) = match segments.split_first() {
            Some(split) => split,
            None => return Some(current.clone()),
        };

        match first {
            Segment::Key(key) => current
                .as_object()?
                .get(key)
                .and_then(|next| Self::resolve_from(rest, next)),
            Segment::Index(index) => current
                .as_array()?
                .get(*index)
                .and_then(|next| Self::resolve_from(rest, next)),
            Segment::Wildcard => {
                let items = current.as_array()?;
                let collected: Vec<Value> = items
                    .iter()
                    .filter_map(|item| Self::resolve_from(rest, item))
                    .collect();
                Some(Value::Array(collected))
            }
        }
    }

    /// Set `value` at this path, creating intermediate objects (and padding
    /// arrays with nulls) as needed. Wildcards are not valid write targets.
    pub fn assign(&self, root: &mut Value, value: Value) -> Result<(), EngineError> {
        let slot = self.slot_mut(root)?;
        *slot = value;
        Ok(())
    }

    /// Deep-merge `value` into the node at this path, creating intermediates
    /// as needed. Object values merge recursively; anything else replaces.
    pub fn merge_at(&self, root: &mut Value, value: Value) -> Result<(), EngineError> {
        let slot = self.slot_mut(root)?;
        deep_merge(slot, value);
        Ok(())
    }

    /// Navigate to the node addressed by this path, creating missing
    /// intermediates, and return a mutable reference to it.
    fn slot_mut<'a>(&self, root: &'a mut Value) -> Result<&'a mut Value, EngineError> {
        if self.has_wildcard() {
            return Err(EngineError::Configuration(format!(
                "Wildcard is not a valid write target: {}",
                self.raw
            )));
        }

        let mut current = root;
        for segment in &self.segments {
            current = match segment {
                Segment::Key(key) => {
                    if !current.is_object() {
                        *current = Value::Object(Map::new());
                    }
                    match current {
                        Value::Object(map) => map.entry(key.clone()).or_insert(Value::Null),
                        _ => {
                            return Err(EngineError::FlowExecution(format!(
                                "Failed to navigate object segment in: {}",
                                self.raw
                            )))
                        }
                    }
                }
                Segment::Index(index) => {
                    if !current.is_array() {
                        *current = Value::Array(Vec::new());
                    }
                    match current {
                        Value::Array(items) => {
                            while items.len() <= *index {
                                items.push(Value::Null);
                            }
                            &mut items[*index]
                        }
                        _ => {
                            return Err(EngineError::FlowExecution(format!(
                                "Failed to navigate array segment in: {}",
                                self.raw
                            )))
                        }
                    }
                }
                Segment::Wildcard => {
                    // Unreachable, rejected above
                    return Err(EngineError::Configuration(format!(
                        "Wildcard is not a valid write target: {}",
                        self.raw
                    )));
                }
            };
        }

        Ok(current)
    }
}

/// Deep-merge `incoming` into `target`.
///
/// When both sides are objects the keys merge recursively; in every other
/// case `incoming` replaces `target` wholesale.
pub fn deep_merge(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(additions)) => {
            for (key, value) in additions {
                deep_merge(existing.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, incoming) => *target = incoming,
    }
}
