//! Assembly of accepted entries into positioned prompt fragments

use crate::collab::PostProcessor;
use crate::lorebook::{ActiveEntry, EntryKey, Position, Role, DEFAULT_DEPTH};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

/// Which side of the example-message block an entry goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorPosition {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExampleEntry {
    pub position: AnchorPosition,
    pub content: String,
}

/// Entries injected at one chat depth under one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthEntries {
    pub depth: u32,
    pub role: Role,
    pub entries: Vec<String>,
}

/// Summary of an entry accepted this call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivatedEntry {
    pub key: EntryKey,
    pub comment: String,
    pub position: Position,
    pub order: i32,
    pub content: String,
}

/// Result of one activation call.
///
/// Within every bucket entries appear in ascending `order`, so the highest
/// priority entry sits closest to the generation point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationOutput {
    pub world_info_before: String,
    pub world_info_after: String,
    pub example_entries: Vec<ExampleEntry>,
    pub depth_entries: Vec<DepthEntries>,
    pub an_before_entries: Vec<String>,
    pub an_after_entries: Vec<String>,
    pub activated: Vec<ActivatedEntry>,
    pub token_budget_overflowed: bool,
}

impl ActivationOutput {
    pub fn is_empty(&self) -> bool {
        self.activated.is_empty()
    }

    /// All at-depth content for `depth`, across roles
    pub fn at_depth(&self, depth: u32) -> impl Iterator<Item = &str> {
        self.depth_entries
            .iter()
            .filter(move |bucket| bucket.depth == depth)
            .flat_map(|bucket| bucket.entries.iter().map(String::as_str))
    }
}

#[derive(Default)]
struct Buckets {
    before: VecDeque<String>,
    after: VecDeque<String>,
    examples: VecDeque<ExampleEntry>,
    depth: Vec<(u32, Role, VecDeque<String>)>,
    an_before: VecDeque<String>,
    an_after: VecDeque<String>,
}

/// Build the output from the accepted entries.
///
/// Entries are walked highest order first and each is put at the front of
/// its bucket.
pub(crate) fn assemble(
    entries: &[ActiveEntry],
    accepted: &[usize],
    post: &dyn PostProcessor,
    overflowed: bool,
) -> ActivationOutput {
    let mut sorted: Vec<&ActiveEntry> = accepted.iter().map(|&i| &entries[i]).collect();
    sorted.sort_by(|a, b| b.entry.order.cmp(&a.entry.order));

    let mut buckets = Buckets::default();
    let mut activated = Vec::with_capacity(sorted.len());

    for active in sorted {
        let entry = &active.entry;
        let depth = match entry.position {
            Position::AtDepth => Some(entry.depth.unwrap_or(DEFAULT_DEPTH)),
            _ => None,
        };
        let content = post.process(active.content(), depth);

        activated.push(ActivatedEntry {
            key: active.key.clone(),
            comment: entry.comment.clone(),
            position: entry.position,
            order: entry.order,
            content: content.clone(),
        });

        if content.is_empty() {
            debug!("Skipping {}: empty content", active.key);
            continue;
        }

        match entry.position {
            Position::Before => buckets.before.push_front(content),
            Position::After => buckets.after.push_front(content),
            Position::EmTop => buckets.examples.push_front(ExampleEntry {
                position: AnchorPosition::Before,
                content,
            }),
            Position::EmBottom => buckets.examples.push_front(ExampleEntry {
                position: AnchorPosition::After,
                content,
            }),
            Position::AnTop => buckets.an_before.push_front(content),
            Position::AnBottom => buckets.an_after.push_front(content),
            Position::AtDepth => {
                let depth = depth.unwrap_or(DEFAULT_DEPTH);
                let role = entry.role.unwrap_or_default();
                match buckets
                    .depth
                    .iter_mut()
                    .find(|(d, r, _)| *d == depth && *r == role)
                {
                    Some((_, _, bucket)) => bucket.push_front(content),
                    None => buckets.depth.push((depth, role, VecDeque::from([content]))),
                }
            }
        }
    }

    ActivationOutput {
        world_info_before: Vec::from(buckets.before).join("\n"),
        world_info_after: Vec::from(buckets.after).join("\n"),
        example_entries: buckets.examples.into(),
        depth_entries: buckets
            .depth
            .into_iter()
            .map(|(depth, role, entries)| DepthEntries {
                depth,
                role,
                entries: entries.into(),
            })
            .collect(),
        an_before_entries: buckets.an_before.into(),
        an_after_entries: buckets.an_after.into(),
        activated,
        token_budget_overflowed: overflowed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::NoPostProcessing;
    use crate::lorebook::LoreEntry;
    use pretty_assertions::assert_eq;

    fn placed(uid: i64, order: i32, position: Position) -> ActiveEntry {
        let entry = LoreEntry {
            position,
            ..LoreEntry::new(uid, format!("e{uid}")).with_order(order)
        };
        ActiveEntry::new("book", &entry)
    }

    struct Shout;

    impl PostProcessor for Shout {
        fn process(&self, text: &str, depth: Option<u32>) -> String {
            match depth {
                Some(d) => format!("{}@{}", text.to_uppercase(), d),
                None => text.to_uppercase(),
            }
        }
    }

    #[test]
    fn test_buckets_are_ascending_by_order() {
        let entries = vec![
            placed(1, 300, Position::Before),
            placed(2, 100, Position::Before),
            placed(3, 200, Position::Before),
            placed(4, 50, Position::After),
        ];
        let output = assemble(&entries, &[0, 1, 2, 3], &NoPostProcessing, false);

        assert_eq!(output.world_info_before, "e2\ne3\ne1");
        assert_eq!(output.world_info_after, "e4");
        assert_eq!(output.activated.len(), 4);
        assert_eq!(output.activated[0].key, EntryKey::new("book", 1));
    }

    #[test]
    fn test_depth_buckets_by_depth_and_role() {
        let mut deep = placed(1, 100, Position::AtDepth);
        deep.entry.depth = Some(2);
        let mut user = placed(2, 90, Position::AtDepth);
        user.entry.depth = Some(2);
        user.entry.role = Some(Role::User);
        let default_depth = placed(3, 80, Position::AtDepth);
        let mut same = placed(4, 70, Position::AtDepth);
        same.entry.depth = Some(2);

        let entries = vec![deep, user, default_depth, same];
        let output = assemble(&entries, &[0, 1, 2, 3], &Shout, false);

        assert_eq!(
            output.depth_entries,
            vec![
                DepthEntries {
                    depth: 2,
                    role: Role::System,
                    entries: vec!["E4@2".into(), "E1@2".into()],
                },
                DepthEntries {
                    depth: 2,
                    role: Role::User,
                    entries: vec!["E2@2".into()],
                },
                DepthEntries {
                    depth: DEFAULT_DEPTH,
                    role: Role::System,
                    entries: vec!["E3@4".into()],
                },
            ]
        );
        assert_eq!(output.at_depth(2).count(), 3);
    }

    #[test]
    fn test_anchors_and_empty_content() {
        let mut empty = placed(5, 10, Position::AnTop);
        empty.entry.content.clear();
        let entries = vec![
            placed(1, 20, Position::EmTop),
            placed(2, 10, Position::EmBottom),
            placed(3, 5, Position::AnTop),
            placed(4, 5, Position::AnBottom),
            empty,
        ];
        let output = assemble(&entries, &[0, 1, 2, 3, 4], &NoPostProcessing, true);

        assert_eq!(
            output.example_entries,
            vec![
                ExampleEntry {
                    position: AnchorPosition::After,
                    content: "e2".into()
                },
                ExampleEntry {
                    position: AnchorPosition::Before,
                    content: "e1".into()
                },
            ]
        );
        assert_eq!(output.an_before_entries, vec!["e3".to_string()]);
        assert_eq!(output.an_after_entries, vec!["e4".to_string()]);
        assert_eq!(output.activated.len(), 5);
        assert!(output.token_budget_overflowed);
    }
}
