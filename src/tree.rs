//! Influence tree synthesis
//!
//! Builds a bounded two-generation tree from flat influence records:
//! - Few records become direct influences as-is
//! - Records spanning several genres are grouped by genre
//! - Otherwise the first few records are direct and the rest are dealt out
//!   round-robin as the earlier generation
//!
//! The root always comes from the subject's catalog profile.

use crate::normalize::{
    Decoded, InfluenceNode, InfluenceTree, RecommendationItem, Recommendations, MAX_CHILDREN,
    MAX_DIRECT_NODES, MAX_FLAT_NODES, PROSE_DESCRIPTION,
};
use crate::subject::{normalize_name, ArtistProfile, Shape};

/// Direct nodes when records are dealt out without genre grouping.
const MIN_DEALT_DIRECT: usize = 2;
const MAX_DEALT_DIRECT: usize = 4;

/// Era given to nodes whose genre is missing or unknown.
pub const UNKNOWN_ERA: &str = "Era unknown";

/// Genre keyword to era. First match wins, so more specific keywords come
/// before the broader ones they contain (post-punk before punk).
const GENRE_ERAS: &[(&str, &str)] = &[
    ("post-punk", "Late 1970s-1980s"),
    ("post punk", "Late 1970s-1980s"),
    ("pop punk", "1990s-2000s"),
    ("punk", "Mid-to-late 1970s"),
    ("post-rock", "1990s-2000s"),
    ("grunge", "Late 1980s-1990s"),
    ("shoegaze", "Late 1980s-1990s"),
    ("britpop", "1990s"),
    ("trip hop", "1990s"),
    ("drum and bass", "1990s"),
    ("dubstep", "2000s"),
    ("trap", "2010s"),
    ("hip hop", "1980s-1990s"),
    ("hip-hop", "1980s-1990s"),
    ("rap", "1980s-1990s"),
    ("disco", "1970s"),
    ("funk", "Late 1960s-1970s"),
    ("neo soul", "Late 1990s-2000s"),
    ("soul", "1960s"),
    ("motown", "1960s"),
    ("rockabilly", "1950s"),
    ("rock and roll", "1950s"),
    ("rock & roll", "1950s"),
    ("doo-wop", "1950s"),
    ("bebop", "1940s"),
    ("big band", "1930s-1940s"),
    ("swing", "1930s-1940s"),
    ("delta blues", "1920s-1930s"),
    ("blues", "1920s-1950s"),
    ("jazz fusion", "Late 1960s-1970s"),
    ("free jazz", "1960s"),
    ("jazz", "1920s-1960s"),
    ("krautrock", "Late 1960s-1970s"),
    ("progressive rock", "Late 1960s-1970s"),
    ("art rock", "Late 1960s-1970s"),
    ("psychedelic", "Mid-to-late 1960s"),
    ("new wave", "Late 1970s-1980s"),
    ("synthpop", "1980s"),
    ("synth-pop", "1980s"),
    ("house", "1980s"),
    ("techno", "1980s-1990s"),
    ("ambient", "1970s-1990s"),
    ("heavy metal", "1970s-1980s"),
    ("thrash", "1980s"),
    ("metal", "1970s-1990s"),
    ("reggae", "Late 1960s-1970s"),
    ("folk", "1960s"),
    ("country", "1940s-1960s"),
    ("r&b", "1950s-1960s"),
    ("classical", "18th-19th century"),
    ("minimalism", "1960s-1970s"),
    ("electronic", "1970s-1990s"),
    ("alternative", "1980s-1990s"),
    ("indie", "1980s-2000s"),
    ("emo", "1990s-2000s"),
    ("pop", "1960s-1980s"),
    ("rock", "1960s-1970s"),
];

/// Estimated era for a genre label.
pub fn estimate_era(genre: Option<&str>) -> &'static str {
    let Some(genre) = genre.map(str::to_lowercase) else {
        return UNKNOWN_ERA;
    };
    GENRE_ERAS
        .iter()
        .find(|(keyword, _)| genre.contains(keyword))
        .map(|(_, era)| *era)
        .unwrap_or(UNKNOWN_ERA)
}

/// Give every node in the subtree an era, estimating where none was stated.
pub fn fill_eras(node: &mut InfluenceNode) {
    if node.era.is_none() {
        node.era = Some(estimate_era(node.genre.as_deref()).to_string());
    }
    node.children.iter_mut().for_each(fill_eras);
}

/// Root node describing the subject itself.
pub fn root_for(subject: &ArtistProfile) -> InfluenceNode {
    let mut root = InfluenceNode {
        genre: subject.primary_genre().map(str::to_string),
        ..InfluenceNode::named(subject.name.clone())
    };
    fill_eras(&mut root);
    root
}

/// Build the influence tree for `subject` from flat records.
pub fn to_tree(mut flat: Vec<InfluenceNode>, subject: &ArtistProfile) -> InfluenceTree {
    if flat.len() > MAX_FLAT_NODES {
        tracing::debug!(
            subject = %subject.name,
            dropped = flat.len() - MAX_FLAT_NODES,
            "more influence records than the tree can place"
        );
        flat.truncate(MAX_FLAT_NODES);
    }

    let mut influences = if flat.iter().any(|node| !node.children.is_empty()) {
        // Already two generations deep; only bound it.
        keep_structure(flat)
    } else if flat.len() <= MIN_DEALT_DIRECT {
        flat
    } else if distinct_genres(&flat) >= 2 {
        group_by_genre(flat)
    } else {
        deal_round_robin(flat)
    };

    influences.iter_mut().for_each(fill_eras);
    InfluenceTree {
        root: root_for(subject),
        influences,
    }
}

/// Final renderable value for a decoded response.
pub fn assemble(decoded: Decoded, shape: Shape, subject: &ArtistProfile) -> Recommendations {
    match (shape, decoded) {
        (Shape::Recommendations, Decoded::Items(items)) => Recommendations::List(items),
        (Shape::Recommendations, Decoded::Nodes(nodes)) => {
            Recommendations::List(nodes.into_iter().map(node_to_item).collect())
        }
        (Shape::Recommendations, Decoded::Tree(tree)) => Recommendations::List(
            flatten(tree.influences)
                .into_iter()
                .map(node_to_item)
                .collect(),
        ),
        (Shape::Influences, Decoded::Tree(parsed)) => Recommendations::Tree(rerooted(parsed, subject)),
        (Shape::Influences, Decoded::Nodes(nodes)) => Recommendations::Tree(to_tree(nodes, subject)),
        (Shape::Influences, Decoded::Items(items)) => Recommendations::Tree(to_tree(
            items.into_iter().map(item_to_node).collect(),
            subject,
        )),
    }
}

/// A parsed tree keeps its influences; the root is replaced by the subject,
/// borrowing genre and era from the parsed root when the catalog has none.
fn rerooted(parsed: InfluenceTree, subject: &ArtistProfile) -> InfluenceTree {
    let mut root = InfluenceNode {
        genre: subject
            .primary_genre()
            .map(str::to_string)
            .or(parsed.root.genre),
        era: parsed.root.era,
        ..InfluenceNode::named(subject.name.clone())
    };
    fill_eras(&mut root);

    let mut influences = parsed.influences;
    influences.truncate(MAX_DIRECT_NODES);
    for node in &mut influences {
        node.children.truncate(MAX_CHILDREN);
        fill_eras(node);
    }
    InfluenceTree { root, influences }
}

fn keep_structure(flat: Vec<InfluenceNode>) -> Vec<InfluenceNode> {
    flat.into_iter()
        .take(MAX_DIRECT_NODES)
        .map(|mut node| {
            node.children.truncate(MAX_CHILDREN);
            for child in &mut node.children {
                child.children.clear();
            }
            node
        })
        .collect()
}

fn genre_key(node: &InfluenceNode) -> Option<String> {
    node.genre
        .as_deref()
        .map(normalize_name)
        .filter(|g| !g.is_empty())
}

fn distinct_genres(nodes: &[InfluenceNode]) -> usize {
    let mut seen: Vec<String> = Vec::new();
    for key in nodes.iter().filter_map(genre_key) {
        if !seen.contains(&key) {
            seen.push(key);
        }
    }
    seen.len()
}

/// First record per genre is direct; the rest of that genre become its
/// children. Records without a genre form one trailing group. Groups past
/// the direct cap and children past the child cap are dropped.
fn group_by_genre(flat: Vec<InfluenceNode>) -> Vec<InfluenceNode> {
    let mut groups: Vec<(Option<String>, InfluenceNode)> = Vec::new();
    let mut ungrouped: Vec<InfluenceNode> = Vec::new();

    for node in flat {
        let Some(key) = genre_key(&node) else {
            ungrouped.push(node);
            continue;
        };
        match groups.iter_mut().find(|(k, _)| k.as_deref() == Some(key.as_str())) {
            Some((_, head)) => {
                if head.children.len() < MAX_CHILDREN {
                    head.children.push(node);
                }
            }
            None => groups.push((Some(key), node)),
        }
    }

    let mut ungrouped = ungrouped.into_iter();
    if let Some(mut head) = ungrouped.next() {
        head.children.extend(ungrouped.take(MAX_CHILDREN));
        groups.push((None, head));
    }

    groups
        .into_iter()
        .map(|(_, node)| node)
        .take(MAX_DIRECT_NODES)
        .collect()
}

/// `max(2, ceil(n / 3))` direct nodes, at most 4, then the remainder dealt
/// out one child at a time.
fn deal_round_robin(flat: Vec<InfluenceNode>) -> Vec<InfluenceNode> {
    let direct_count = flat
        .len()
        .div_ceil(3)
        .clamp(MIN_DEALT_DIRECT, MAX_DEALT_DIRECT)
        .min(flat.len());

    let mut nodes = flat.into_iter();
    let mut direct: Vec<InfluenceNode> = nodes.by_ref().take(direct_count).collect();
    for (i, node) in nodes.enumerate() {
        let slot = &mut direct[i % direct_count];
        if slot.children.len() < MAX_CHILDREN {
            slot.children.push(node);
        }
    }
    direct
}

fn flatten(nodes: Vec<InfluenceNode>) -> Vec<InfluenceNode> {
    let mut out = Vec::new();
    for mut node in nodes {
        let children = std::mem::take(&mut node.children);
        out.push(node);
        out.extend(flatten(children));
    }
    out
}

fn item_to_node(item: RecommendationItem) -> InfluenceNode {
    InfluenceNode {
        impact: Some(item.description),
        era: item.year,
        ..InfluenceNode::named(item.name)
    }
}

fn node_to_item(node: InfluenceNode) -> RecommendationItem {
    let description = node
        .impact
        .or(node.connection)
        .unwrap_or_else(|| PROSE_DESCRIPTION.to_string());
    RecommendationItem::artist(node.name, description)
}
