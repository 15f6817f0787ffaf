//! Output types and the boundary decoder.
//!
//! Whatever JSON a strategy digs out of generated text is decoded here into
//! one tagged [`Decoded`] value or rejected with a [`Reject`] reason. Records
//! that fail validation are dropped, never patched up.

use crate::subject::Shape;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upper bound on recommendation items kept from one response.
pub const MAX_ITEMS: usize = 20;
/// Upper bound on flat influence records; what the tree builder can place
/// (4 direct nodes with 3 children each).
pub const MAX_FLAT_NODES: usize = 16;
/// Upper bound on direct influences kept from a parsed tree.
pub const MAX_DIRECT_NODES: usize = 6;
/// Upper bound on earlier-generation children per direct influence.
pub const MAX_CHILDREN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Artist,
    Album,
    Song,
}

impl ItemKind {
    /// Strict parse: anything outside the three kinds is invalid.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "artist" => Some(ItemKind::Artist),
            "album" => Some(ItemKind::Album),
            "song" => Some(ItemKind::Song),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationItem {
    pub name: String,
    pub kind: ItemKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl RecommendationItem {
    pub fn artist(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ItemKind::Artist,
            description: description.into(),
            year: None,
            month: None,
            source: None,
            source_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InfluenceNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub era: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default)]
    pub children: Vec<InfluenceNode>,
}

impl InfluenceNode {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Number of nodes in this subtree, including itself.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(InfluenceNode::node_count).sum::<usize>()
    }
}

/// `root` is the subject itself and has no children; `influences` are the
/// direct generation, each optionally holding the earlier generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfluenceTree {
    pub root: InfluenceNode,
    #[serde(default)]
    pub influences: Vec<InfluenceNode>,
}

/// Final, renderable result for either shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "data", rename_all = "snake_case")]
pub enum Recommendations {
    List(Vec<RecommendationItem>),
    Tree(InfluenceTree),
}

impl Recommendations {
    pub fn shape(&self) -> Shape {
        match self {
            Recommendations::List(_) => Shape::Recommendations,
            Recommendations::Tree(_) => Shape::Influences,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Recommendations::List(items) => items.is_empty(),
            Recommendations::Tree(tree) => tree.influences.is_empty(),
        }
    }
}

/// Decoder output.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Items(Vec<RecommendationItem>),
    Tree(InfluenceTree),
    /// Flat influence records still waiting for the tree builder.
    Nodes(Vec<InfluenceNode>),
}

impl Decoded {
    pub fn len(&self) -> usize {
        match self {
            Decoded::Items(items) => items.len(),
            Decoded::Tree(tree) => tree.influences.len(),
            Decoded::Nodes(nodes) => nodes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    /// JSON of a kind the shape cannot use (string, number, foreign object)
    ShapeMismatch,
    /// Records were present but none survived validation
    NoValidRecords,
}

/// Keys under which generators tend to wrap the array we want.
const LIST_WRAPPER_KEYS: [&str; 5] = ["recommendations", "items", "results", "data", "artists"];

pub fn decode(value: &Value, shape: Shape) -> Result<Decoded, Reject> {
    match shape {
        Shape::Recommendations => decode_items(value).map(Decoded::Items),
        Shape::Influences => decode_influences(value),
    }
}

fn decode_items(value: &Value) -> Result<Vec<RecommendationItem>, Reject> {
    match value {
        Value::Array(entries) => {
            let items: Vec<RecommendationItem> = entries
                .iter()
                .filter_map(decode_item)
                .take(MAX_ITEMS)
                .collect();
            if items.is_empty() && !entries.is_empty() {
                Err(Reject::NoValidRecords)
            } else {
                Ok(items)
            }
        }
        Value::Object(obj) => match wrapped_list(obj, &LIST_WRAPPER_KEYS) {
            Some(inner) => decode_items(inner),
            None => Err(Reject::ShapeMismatch),
        },
        _ => Err(Reject::ShapeMismatch),
    }
}

fn decode_influences(value: &Value) -> Result<Decoded, Reject> {
    match value {
        Value::Array(entries) => decode_nodes(entries).map(Decoded::Nodes),
        Value::Object(obj) => {
            if let Some(root) = obj.get("root") {
                let root = decode_node(root, 0).ok_or(Reject::NoValidRecords)?;
                let influences = match obj.get("influences") {
                    Some(Value::Array(entries)) => decode_nodes(entries)?,
                    Some(_) => return Err(Reject::ShapeMismatch),
                    None => Vec::new(),
                };
                let influences = if influences.is_empty() {
                    // Some generators nest the direct generation under the root.
                    root.children.clone()
                } else {
                    influences
                };
                return Ok(Decoded::Tree(InfluenceTree {
                    root: InfluenceNode {
                        children: Vec::new(),
                        ..root
                    },
                    influences: influences.into_iter().take(MAX_DIRECT_NODES).collect(),
                }));
            }
            match wrapped_list(obj, &["influences", "data", "artists", "results"]) {
                Some(Value::Array(entries)) => decode_nodes(entries).map(Decoded::Nodes),
                Some(inner @ Value::Object(_)) => decode_influences(inner),
                _ => Err(Reject::ShapeMismatch),
            }
        }
        _ => Err(Reject::ShapeMismatch),
    }
}

fn decode_nodes(entries: &[Value]) -> Result<Vec<InfluenceNode>, Reject> {
    let nodes: Vec<InfluenceNode> = entries
        .iter()
        .filter_map(|v| decode_node(v, 1))
        .take(MAX_FLAT_NODES)
        .collect();
    if nodes.is_empty() && !entries.is_empty() {
        Err(Reject::NoValidRecords)
    } else {
        Ok(nodes)
    }
}

fn wrapped_list<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|v| v.is_array() || v.is_object())
}

#[derive(Deserialize)]
struct RawItem {
    name: Option<String>,
    #[serde(default, alias = "type")]
    kind: Option<String>,
    #[serde(default, alias = "quote", alias = "reason")]
    description: Option<String>,
    #[serde(default)]
    year: Option<Value>,
    #[serde(default)]
    month: Option<Value>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default, alias = "sourceUrl", alias = "url")]
    source_url: Option<String>,
}

fn decode_item(value: &Value) -> Option<RecommendationItem> {
    let raw: RawItem = serde_json::from_value(value.clone()).ok()?;
    let name = non_empty(raw.name)?;
    let kind = ItemKind::parse(raw.kind.as_deref()?)?;
    let description = non_empty(raw.description)?;
    Some(RecommendationItem {
        name,
        kind,
        description,
        year: raw.year.as_ref().and_then(scalar_text),
        month: raw.month.as_ref().and_then(scalar_text),
        source: non_empty(raw.source),
        source_url: non_empty(raw.source_url),
    })
}

#[derive(Deserialize)]
struct RawNode {
    name: Option<String>,
    #[serde(default, alias = "category")]
    genre: Option<Value>,
    #[serde(default, alias = "period", alias = "years")]
    era: Option<Value>,
    #[serde(default, alias = "influence", alias = "description")]
    impact: Option<String>,
    #[serde(default, alias = "relationship")]
    connection: Option<String>,
    #[serde(default, alias = "influences")]
    children: Option<Vec<Value>>,
}

/// `depth` is the generation being decoded: 0 root, 1 direct, 2 earlier.
/// Nothing below the earlier generation is kept.
fn decode_node(value: &Value, depth: usize) -> Option<InfluenceNode> {
    let raw: RawNode = serde_json::from_value(value.clone()).ok()?;
    let name = non_empty(raw.name)?;
    let children = if depth < 2 {
        raw.children
            .unwrap_or_default()
            .iter()
            .filter_map(|child| decode_node(child, depth + 1))
            .take(if depth == 0 { MAX_DIRECT_NODES } else { MAX_CHILDREN })
            .collect()
    } else {
        Vec::new()
    };
    Some(InfluenceNode {
        name,
        genre: raw.genre.as_ref().and_then(genre_text),
        era: raw.era.as_ref().and_then(scalar_text),
        impact: non_empty(raw.impact),
        connection: non_empty(raw.connection),
        children,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Years and months arrive as strings or numbers.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(Some(s.clone())),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Genre may be a string or a list of strings; keep the first.
fn genre_text(value: &Value) -> Option<String> {
    match value {
        Value::Array(list) => list.iter().find_map(scalar_text),
        other => scalar_text(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalid_items_are_dropped_not_coerced() {
        let value = json!([
            {"name": "Opeth", "type": "artist", "description": "Prog metal"},
            {"name": "Blackwater Park", "kind": "podcast", "description": "nope"},
            {"name": "", "kind": "album", "description": "no name"},
            {"name": "Ghost Reveries", "kind": "album"}
        ]);
        let Decoded::Items(items) = decode(&value, Shape::Recommendations).unwrap() else {
            panic!("expected items");
        };
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Opeth");
        assert_eq!(items[0].kind, ItemKind::Artist);
    }

    #[test]
    fn quote_counts_as_description_and_numeric_year_is_text() {
        let value = json!([{"name": "Hand. Cannot. Erase.", "kind": "Album", "quote": "A masterpiece", "year": 2015}]);
        let Decoded::Items(items) = decode(&value, Shape::Recommendations).unwrap() else {
            panic!("expected items");
        };
        assert_eq!(items[0].description, "A masterpiece");
        assert_eq!(items[0].year.as_deref(), Some("2015"));
    }

    #[test]
    fn all_invalid_records_reject() {
        let value = json!([{"title": "x"}]);
        assert_eq!(
            decode(&value, Shape::Recommendations),
            Err(Reject::NoValidRecords)
        );
    }

    #[test]
    fn wrapped_list_is_unwrapped() {
        let value = json!({"data": {"recommendations": [
            {"name": "Low", "kind": "artist", "description": "slowcore"}
        ]}});
        assert_eq!(decode(&value, Shape::Recommendations).unwrap().len(), 1);
    }

    #[test]
    fn foreign_object_is_a_shape_mismatch() {
        assert_eq!(
            decode(&json!({"answer": 42}), Shape::Recommendations),
            Err(Reject::ShapeMismatch)
        );
        assert_eq!(
            decode(&json!("text"), Shape::Influences),
            Err(Reject::ShapeMismatch)
        );
    }

    #[test]
    fn tree_is_bounded_to_two_generations() {
        let value = json!({
            "root": {"name": "Steven Wilson", "genre": ["progressive rock"]},
            "influences": [{
                "name": "Pink Floyd",
                "children": [{
                    "name": "Syd Barrett",
                    "children": [{"name": "too deep"}]
                }]
            }]
        });
        let Decoded::Tree(tree) = decode(&value, Shape::Influences).unwrap() else {
            panic!("expected tree");
        };
        assert_eq!(tree.root.genre.as_deref(), Some("progressive rock"));
        assert!(tree.root.children.is_empty());
        assert_eq!(tree.influences[0].children[0].name, "Syd Barrett");
        assert!(tree.influences[0].children[0].children.is_empty());
    }

    #[test]
    fn root_children_become_influences() {
        let value = json!({"root": {"name": "Can", "children": [{"name": "Stockhausen"}]}});
        let Decoded::Tree(tree) = decode(&value, Shape::Influences).unwrap() else {
            panic!("expected tree");
        };
        assert!(tree.root.children.is_empty());
        assert_eq!(tree.influences.len(), 1);
    }

    #[test]
    fn flat_influence_array_stays_flat() {
        let value = json!([{"name": "Miles Davis", "period": "1950s"}, {"nope": 1}]);
        let Decoded::Nodes(nodes) = decode(&value, Shape::Influences).unwrap() else {
            panic!("expected nodes");
        };
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].era.as_deref(), Some("1950s"));
    }

    #[test]
    fn flat_influences_are_capped_at_tree_capacity() {
        let entries: Vec<Value> = (0..20)
            .map(|i| json!({"name": format!("Influence {i}")}))
            .collect();
        let Decoded::Nodes(nodes) = decode(&Value::Array(entries), Shape::Influences).unwrap()
        else {
            panic!("expected nodes");
        };
        assert_eq!(nodes.len(), MAX_FLAT_NODES);
        assert_eq!(nodes[15].name, "Influence 15");
    }

    #[test]
    fn result_enum_is_tagged() {
        let result = Recommendations::List(vec![RecommendationItem::artist("Low", "slowcore")]);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["shape"], "list");
        assert_eq!(value["data"][0]["kind"], "artist");
        let back: Recommendations = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }
}
