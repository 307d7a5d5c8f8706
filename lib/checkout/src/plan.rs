/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Merge/update plan computation.
//!
//! Three manifests go in (ancestor, local, other); a per-path action
//! map comes out. Rename detection runs first, driven by recorded copy
//! metadata and then by content similarity, so later classification
//! can redirect a modification on one side into the renamed-to path on
//! the other. Directory renames are inferred when a directory emptied
//! out on one side and its files reappeared together elsewhere.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use manifest::FileInfo;
use manifest::Manifest;
use types::Node;
use types::RepoPath;
use types::RepoPathBuf;

use crate::MergeError;
use crate::similarity;

/// What apply must do for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Take the other side's version.
    Get(FileInfo),
    /// Delete from the working copy.
    Remove,
    /// Three-way content merge.
    Merge(MergeSpec),
    /// Changed on one side, deleted on the other; the user decides.
    CreatedKept {
        local_changed: bool,
        other_info: Option<FileInfo>,
    },
    /// A file the other side added into a directory this side moved:
    /// materialize it at the moved location.
    DirectoryRename {
        from: RepoPathBuf,
        info: FileInfo,
    },
}

/// Inputs of one three-way file merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSpec {
    /// Where the ancestor content lives.
    pub base_path: RepoPathBuf,
    pub base: Option<FileInfo>,
    /// Where the local content lives in the working copy.
    pub local_path: RepoPathBuf,
    pub local: Option<FileInfo>,
    /// Where the other side's content lives.
    pub other_path: RepoPathBuf,
    pub other: Option<FileInfo>,
}

#[derive(Debug, Default)]
pub struct Plan {
    pub actions: BTreeMap<RepoPathBuf, Action>,
    /// Renames detected, source -> destination, with the side that did
    /// the renaming.
    pub renames: Vec<(RepoPathBuf, RepoPathBuf)>,
    /// Sources renamed to different destinations on each side.
    pub divergent: Vec<(RepoPathBuf, Vec<RepoPathBuf>)>,
}

impl Plan {
    pub fn merge_count(&self) -> usize {
        self.actions
            .values()
            .filter(|a| matches!(a, Action::Merge(_)))
            .count()
    }
}

pub struct PlanInputs<'a> {
    pub ancestor: &'a Manifest,
    pub local: &'a Manifest,
    pub other: &'a Manifest,
    /// Paths whose working-copy content differs from `local`.
    pub dirty: &'a BTreeSet<RepoPathBuf>,
    /// Rename similarity threshold, percent. 100 = exact only.
    pub similarity: u8,
}

/// Compute the plan.
///
/// `content_of(path, node)` reads stored file content; `copy_of(path,
/// node)` reads recorded copy metadata.
pub fn compute_plan(
    inputs: &PlanInputs<'_>,
    mut content_of: impl FnMut(&RepoPath, &Node) -> Result<Vec<u8>, MergeError>,
    mut copy_of: impl FnMut(&RepoPath, &Node) -> Option<(RepoPathBuf, Node)>,
) -> Result<Plan, MergeError> {
    let mut plan = Plan::default();
    let mut consumed: BTreeSet<RepoPathBuf> = BTreeSet::new();

    let local_renames = detect_renames(
        inputs.ancestor,
        inputs.local,
        inputs.similarity,
        &mut content_of,
        &mut copy_of,
    )?;
    let other_renames = detect_renames(
        inputs.ancestor,
        inputs.other,
        inputs.similarity,
        &mut content_of,
        &mut copy_of,
    )?;

    // Divergent renames: the same source went two ways.
    for (source, local_dest) in &local_renames {
        if let Some(other_dest) = other_renames.get(source) {
            if other_dest != local_dest {
                plan.divergent.push((
                    source.clone(),
                    vec![local_dest.clone(), other_dest.clone()],
                ));
                // Keep local's name, materialize other's too.
                if let Some(info) = inputs.other.get(other_dest) {
                    plan.actions
                        .insert(other_dest.clone(), Action::Get(*info));
                }
                consumed.insert(source.clone());
                consumed.insert(local_dest.clone());
                consumed.insert(other_dest.clone());
            }
        }
    }

    // Renames done locally: redirect the other side's changes to the
    // new name.
    for (source, dest) in &local_renames {
        if consumed.contains(source) || consumed.contains(dest) {
            continue;
        }
        plan.renames.push((source.clone(), dest.clone()));
        let ancestor_info = inputs.ancestor.get(source).copied();
        let other_info = inputs.other.get(source).copied();
        match (ancestor_info, other_info) {
            (Some(a), Some(t)) if a != t => {
                // Other modified the old name: merge into the new one.
                plan.actions.insert(
                    dest.clone(),
                    Action::Merge(MergeSpec {
                        base_path: source.clone(),
                        base: Some(a),
                        local_path: dest.clone(),
                        local: inputs.local.get(dest).copied(),
                        other_path: source.clone(),
                        other: Some(t),
                    }),
                );
                plan.actions.insert(source.clone(), Action::Remove);
            }
            _ => {
                // Other side left it alone (or deleted it): the rename
                // stands, the stale name goes.
                if other_info.is_some() {
                    plan.actions.insert(source.clone(), Action::Remove);
                }
            }
        }
        consumed.insert(source.clone());
        consumed.insert(dest.clone());
    }

    // Renames done on the other side: bring the new name in, retiring
    // ours.
    for (source, dest) in &other_renames {
        if consumed.contains(source) || consumed.contains(dest) {
            continue;
        }
        plan.renames.push((source.clone(), dest.clone()));
        let ancestor_info = inputs.ancestor.get(source).copied();
        let local_info = inputs.local.get(source).copied();
        let dest_info = match inputs.other.get(dest) {
            Some(info) => *info,
            None => continue,
        };
        match (ancestor_info, local_info) {
            (Some(a), Some(l)) if a != l || inputs.dirty.contains(source) => {
                // We modified the old name: merge our content into
                // their new name.
                plan.actions.insert(
                    dest.clone(),
                    Action::Merge(MergeSpec {
                        base_path: source.clone(),
                        base: Some(a),
                        local_path: source.clone(),
                        local: Some(l),
                        other_path: dest.clone(),
                        other: Some(dest_info),
                    }),
                );
                plan.actions.insert(source.clone(), Action::Remove);
            }
            (_, Some(_)) => {
                plan.actions.insert(dest.clone(), Action::Get(dest_info));
                plan.actions.insert(source.clone(), Action::Remove);
            }
            (_, None) => {
                plan.actions.insert(dest.clone(), Action::Get(dest_info));
            }
        }
        consumed.insert(source.clone());
        consumed.insert(dest.clone());
    }

    // Directory renames: files the other side added into a directory
    // we moved away follow the move (and vice versa - but only the
    // local side changes our working copy).
    let dir_moves = directory_moves(inputs.ancestor, inputs.local, &local_renames);
    for (path, info) in inputs.other.iter() {
        if inputs.ancestor.contains(path)
            || inputs.local.contains(path)
            || consumed.contains(path)
        {
            continue;
        }
        if let Some(parent) = path.parent() {
            if let Some(new_dir) = dir_moves.get(parent.as_str()) {
                let moved = format!("{}/{}", new_dir, path.base_name());
                if let Ok(moved) = RepoPathBuf::from_string(moved) {
                    plan.actions.insert(
                        moved,
                        Action::DirectoryRename {
                            from: path.to_owned(),
                            info: *info,
                        },
                    );
                    consumed.insert(path.to_owned());
                }
            }
        }
    }

    // Plain classification for everything else.
    let mut all_paths: BTreeSet<RepoPathBuf> = BTreeSet::new();
    for manifest in [inputs.ancestor, inputs.local, inputs.other] {
        for (path, _) in manifest.iter() {
            all_paths.insert(path.to_owned());
        }
    }
    for path in all_paths {
        if consumed.contains(&path) {
            continue;
        }
        let a = inputs.ancestor.get(&path).copied();
        let l = inputs.local.get(&path).copied();
        let t = inputs.other.get(&path).copied();
        let dirty = inputs.dirty.contains(&path);
        match (l, t) {
            (Some(l), Some(t)) => {
                if l == t && !dirty {
                    // Identical on both sides.
                } else if l == t && dirty {
                    // Our uncommitted edit survives; nothing to fetch.
                } else if Some(l) == a && !dirty {
                    plan.actions.insert(path, Action::Get(t));
                } else if Some(t) == a {
                    // Only we changed it.
                } else {
                    plan.actions.insert(
                        path.clone(),
                        Action::Merge(MergeSpec {
                            base_path: path.clone(),
                            base: a,
                            local_path: path.clone(),
                            local: Some(l),
                            other_path: path.clone(),
                            other: Some(t),
                        }),
                    );
                }
            }
            (Some(l), None) => {
                match a {
                    Some(a) if a == l && !dirty => {
                        plan.actions.insert(path, Action::Remove);
                    }
                    Some(_) => {
                        plan.actions.insert(
                            path,
                            Action::CreatedKept {
                                local_changed: true,
                                other_info: None,
                            },
                        );
                    }
                    None => {
                        // Local-only addition; stays.
                    }
                }
            }
            (None, Some(t)) => {
                match a {
                    Some(a) if a == t => {
                        // We deleted it, they did not touch it: stays
                        // deleted.
                    }
                    Some(_) => {
                        plan.actions.insert(
                            path,
                            Action::CreatedKept {
                                local_changed: false,
                                other_info: Some(t),
                            },
                        );
                    }
                    None => {
                        plan.actions.insert(path, Action::Get(t));
                    }
                }
            }
            (None, None) => {}
        }
    }

    Ok(plan)
}

/// source -> destination renames performed on `side`, found via copy
/// metadata first, then content similarity against files that left the
/// side.
fn detect_renames(
    ancestor: &Manifest,
    side: &Manifest,
    threshold: u8,
    content_of: &mut impl FnMut(&RepoPath, &Node) -> Result<Vec<u8>, MergeError>,
    copy_of: &mut impl FnMut(&RepoPath, &Node) -> Option<(RepoPathBuf, Node)>,
) -> Result<BTreeMap<RepoPathBuf, RepoPathBuf>, MergeError> {
    let mut renames = BTreeMap::new();

    let added: Vec<(RepoPathBuf, FileInfo)> = side
        .iter()
        .filter(|(path, _)| !ancestor.contains(path))
        .map(|(path, info)| (path.to_owned(), *info))
        .collect();
    if added.is_empty() {
        return Ok(renames);
    }
    let deleted: Vec<RepoPathBuf> = ancestor
        .iter()
        .filter(|(path, _)| !side.contains(path))
        .map(|(path, _)| path.to_owned())
        .collect();

    for (path, info) in added {
        // Exact provenance first.
        if let Some((source, _source_node)) = copy_of(&path, &info.node) {
            if ancestor.contains(&source) {
                renames.insert(source, path);
                continue;
            }
        }
        if deleted.is_empty() || threshold == 0 {
            continue;
        }
        let content = content_of(&path, &info.node)?;
        // Threshold 100 is handled inside score() via byte equality.
        let mut candidates = Vec::new();
        for source in &deleted {
            if renames.contains_key(source.as_repo_path()) {
                continue;
            }
            let source_info = ancestor.get(source).expect("came from ancestor");
            candidates.push((source.clone(), content_of(source, &source_info.node)?));
        }
        if let Some((source, got)) = similarity::best_match(
            &content,
            candidates.iter().map(|(n, c)| (n.as_str(), c.clone())),
            threshold,
        ) {
            tracing::debug!(source, dest = %path, score = got, "rename detected");
            let source = RepoPathBuf::from_string(source).expect("valid path");
            renames.insert(source, path);
        }
    }
    Ok(renames)
}

/// Directories fully vacated by `side`'s renames: old dir -> new dir.
fn directory_moves(
    ancestor: &Manifest,
    side: &Manifest,
    renames: &BTreeMap<RepoPathBuf, RepoPathBuf>,
) -> BTreeMap<String, String> {
    let mut moves: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (source, dest) in renames {
        let from_dir = source.parent().map(|d| d.as_str().to_string());
        let to_dir = dest.parent().map(|d| d.as_str().to_string());
        if let (Some(from), Some(to)) = (from_dir, to_dir) {
            if from != to {
                moves.entry(from).or_default().insert(to);
            }
        }
    }
    let mut out = BTreeMap::new();
    for (from, targets) in moves {
        // Unambiguous target, and nothing left behind in the old dir.
        if targets.len() != 1 {
            continue;
        }
        let from_path = match RepoPathBuf::from_string(from.clone()) {
            Ok(path) => path,
            Err(_) => continue,
        };
        let still_there = side
            .paths()
            .any(|path| path.starts_with_dir(&from_path));
        let had_files = ancestor
            .paths()
            .any(|path| path.starts_with_dir(&from_path));
        if had_files && !still_there {
            out.insert(from, targets.into_iter().next().unwrap());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use types::FileType;
    use types::NULL_ID;

    use super::*;

    fn node(seed: &[u8]) -> Node {
        Node::from_content(seed, &NULL_ID, &NULL_ID)
    }

    fn p(s: &str) -> RepoPathBuf {
        RepoPathBuf::from_string(s.to_string()).unwrap()
    }

    fn info(seed: &[u8]) -> FileInfo {
        FileInfo::new(node(seed), FileType::Regular)
    }

    struct Contents(BTreeMap<Node, Vec<u8>>);

    impl Contents {
        fn new() -> Self {
            Contents(BTreeMap::new())
        }

        fn put(&mut self, seed: &[u8], content: &[u8]) -> FileInfo {
            self.0.insert(node(seed), content.to_vec());
            info(seed)
        }
    }

    fn plan_of(inputs: &PlanInputs<'_>, contents: &Contents) -> Plan {
        compute_plan(
            inputs,
            |_path, n| Ok(contents.0.get(n).cloned().unwrap_or_default()),
            |_path, _n| None,
        )
        .unwrap()
    }

    #[test]
    fn test_trivial_classes() {
        let mut contents = Contents::new();
        let base_info = contents.put(b"v1", b"1\n");
        let new_info = contents.put(b"v2", b"2\n");
        let their_new = contents.put(b"v3", b"3\n");

        let mut ancestor = Manifest::new();
        ancestor.insert(p("same"), base_info);
        ancestor.insert(p("they-change"), base_info);
        ancestor.insert(p("they-delete"), base_info);
        let mut local = ancestor.clone();
        let mut other = ancestor.clone();
        other.insert(p("they-change"), new_info);
        other.remove(&p("they-delete"));
        other.insert(p("they-add"), their_new);
        // Local changed nothing.
        let dirty = BTreeSet::new();
        let plan = plan_of(
            &PlanInputs {
                ancestor: &ancestor,
                local: &mut local,
                other: &other,
                dirty: &dirty,
                similarity: 75,
            },
            &contents,
        );

        assert_eq!(plan.actions.get(&p("they-change")), Some(&Action::Get(new_info)));
        assert_eq!(plan.actions.get(&p("they-delete")), Some(&Action::Remove));
        assert_eq!(plan.actions.get(&p("they-add")), Some(&Action::Get(their_new)));
        assert_eq!(plan.actions.get(&p("same")), None);
    }

    #[test]
    fn test_both_changed_is_merge() {
        let mut contents = Contents::new();
        let base_info = contents.put(b"v1", b"1\n");
        let ours = contents.put(b"v2", b"1\n2\n");
        let theirs = contents.put(b"v3", b"1\n3\n");

        let mut ancestor = Manifest::new();
        ancestor.insert(p("f"), base_info);
        let mut local = Manifest::new();
        local.insert(p("f"), ours);
        let mut other = Manifest::new();
        other.insert(p("f"), theirs);

        let dirty = BTreeSet::new();
        let plan = plan_of(
            &PlanInputs {
                ancestor: &ancestor,
                local: &local,
                other: &other,
                dirty: &dirty,
                similarity: 75,
            },
            &contents,
        );
        match plan.actions.get(&p("f")) {
            Some(Action::Merge(spec)) => {
                assert_eq!(spec.base, Some(base_info));
                assert_eq!(spec.local, Some(ours));
                assert_eq!(spec.other, Some(theirs));
            }
            other => panic!("expected merge, got {:?}", other),
        }
    }

    #[test]
    fn test_change_delete_classes() {
        let mut contents = Contents::new();
        let base_info = contents.put(b"v1", b"1\n");
        let changed = contents.put(b"v2", b"1\nx\n");

        let mut ancestor = Manifest::new();
        ancestor.insert(p("we-changed"), base_info);
        ancestor.insert(p("they-changed"), base_info);
        let mut local = Manifest::new();
        local.insert(p("we-changed"), changed);
        let mut other = Manifest::new();
        other.insert(p("they-changed"), changed);

        let dirty = BTreeSet::new();
        let plan = plan_of(
            &PlanInputs {
                ancestor: &ancestor,
                local: &local,
                other: &other,
                dirty: &dirty,
                similarity: 75,
            },
            &contents,
        );
        assert_eq!(
            plan.actions.get(&p("we-changed")),
            Some(&Action::CreatedKept {
                local_changed: true,
                other_info: None
            })
        );
        assert_eq!(
            plan.actions.get(&p("they-changed")),
            Some(&Action::CreatedKept {
                local_changed: false,
                other_info: Some(changed)
            })
        );
    }

    #[test]
    fn test_rename_merge_s2_shape() {
        // Base: a = "1". Local renamed a->b with content "1 2". Other
        // modified a to "1 3". Expect: merge into b, remove a.
        let mut contents = Contents::new();
        let base_info = contents.put(b"v1", b"1\n");
        let renamed = contents.put(b"v2", b"1\n2\n");
        let modified = contents.put(b"v3", b"1\n3\n");

        let mut ancestor = Manifest::new();
        ancestor.insert(p("a"), base_info);
        let mut local = Manifest::new();
        local.insert(p("b"), renamed);
        let mut other = Manifest::new();
        other.insert(p("a"), modified);

        let dirty = BTreeSet::new();
        let plan = plan_of(
            &PlanInputs {
                ancestor: &ancestor,
                local: &local,
                other: &other,
                dirty: &dirty,
                similarity: 30,
            },
            &contents,
        );
        assert_eq!(plan.renames, vec![(p("a"), p("b"))]);
        match plan.actions.get(&p("b")) {
            Some(Action::Merge(spec)) => {
                assert_eq!(spec.base_path, p("a"));
                assert_eq!(spec.other, Some(modified));
                assert_eq!(spec.local_path, p("b"));
            }
            other => panic!("expected merge at b, got {:?}", other),
        }
        assert_eq!(plan.actions.get(&p("a")), Some(&Action::Remove));
    }

    #[test]
    fn test_rename_via_copy_metadata() {
        // No similarity at all, but recorded copy info still finds it.
        let mut contents = Contents::new();
        let base_info = contents.put(b"v1", b"completely\ndifferent\n");
        let renamed = contents.put(b"v2", b"brand\nnew\n");
        let modified = contents.put(b"v3", b"completely\nchanged\n");

        let mut ancestor = Manifest::new();
        ancestor.insert(p("old"), base_info);
        let mut local = Manifest::new();
        local.insert(p("new"), renamed);
        let mut other = Manifest::new();
        other.insert(p("old"), modified);

        let dirty = BTreeSet::new();
        let plan = compute_plan(
            &PlanInputs {
                ancestor: &ancestor,
                local: &local,
                other: &other,
                dirty: &dirty,
                similarity: 90,
            },
            |_path, n| Ok(contents.0.get(n).cloned().unwrap_or_default()),
            |path, _n| {
                (path.as_str() == "new").then(|| (p("old"), node(b"v1")))
            },
        )
        .unwrap();
        assert!(matches!(plan.actions.get(&p("new")), Some(Action::Merge(_))));
    }

    #[test]
    fn test_divergent_rename_exposed() {
        let mut contents = Contents::new();
        let base_info = contents.put(b"v1", b"same\ncontent\n");
        let left = contents.put(b"v1", b"same\ncontent\n");
        let right = contents.put(b"v1", b"same\ncontent\n");

        let mut ancestor = Manifest::new();
        ancestor.insert(p("src"), base_info);
        let mut local = Manifest::new();
        local.insert(p("left"), left);
        let mut other = Manifest::new();
        other.insert(p("right"), right);

        let dirty = BTreeSet::new();
        let plan = plan_of(
            &PlanInputs {
                ancestor: &ancestor,
                local: &local,
                other: &other,
                dirty: &dirty,
                similarity: 80,
            },
            &contents,
        );
        assert_eq!(plan.divergent.len(), 1);
        assert_eq!(plan.divergent[0].0, p("src"));
        // Both names survive.
        assert_eq!(plan.actions.get(&p("right")), Some(&Action::Get(right)));
        assert_eq!(plan.actions.get(&p("left")), None);
    }

    #[test]
    fn test_directory_rename_follows() {
        let mut contents = Contents::new();
        let one = contents.put(b"v1", b"one\n");
        let two = contents.put(b"v2", b"two\n");
        let extra = contents.put(b"v3", b"extra\n");

        // Local moved dir/ -> lib/ entirely; other added dir/new.
        let mut ancestor = Manifest::new();
        ancestor.insert(p("dir/one"), one);
        ancestor.insert(p("dir/two"), two);
        let mut local = Manifest::new();
        local.insert(p("lib/one"), one);
        local.insert(p("lib/two"), two);
        let mut other = ancestor.clone();
        other.insert(p("dir/new"), extra);

        let dirty = BTreeSet::new();
        let plan = plan_of(
            &PlanInputs {
                ancestor: &ancestor,
                local: &local,
                other: &other,
                dirty: &dirty,
                similarity: 80,
            },
            &contents,
        );
        assert_eq!(
            plan.actions.get(&p("lib/new")),
            Some(&Action::DirectoryRename {
                from: p("dir/new"),
                info: extra
            })
        );
        // dir/new itself is not fetched to the old place.
        assert_eq!(plan.actions.get(&p("dir/new")), None);
    }
}
