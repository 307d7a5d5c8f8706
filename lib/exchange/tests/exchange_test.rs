/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Peer-to-peer exchange scenarios: discovery, pull, push, bundle
//! round trips, and pushrebase, all between in-process repositories.

use std::sync::atomic::AtomicBool;

use anyhow::Result;
use configmodel::ConfigSet;
use exchange::apply_bundle;
use exchange::discovery::find_common_heads;
use exchange::generate_bundle;
use exchange::peer::BundleFilePeer;
use exchange::peer::LocalPeer;
use exchange::pull;
use exchange::push;
use exchange::ExchangeError;
use repo::commit::commit;
use repo::commit::CommitOptions;
use repo::verify::verify;
use repo::Phase;
use repo::Repo;
use types::FileType;
use types::Node;
use types::RepoPath;
use types::Rev;
use ui::Ui;

fn new_repo(name: &str, dir: &tempfile::TempDir) -> Result<Repo> {
    Ok(Repo::init(dir.path().join(name), ConfigSet::new())?)
}

fn write(repo: &Repo, path: &str, content: &[u8]) -> Result<()> {
    repo.working_copy()
        .vfs()
        .write(RepoPath::from_str(path)?, content, FileType::Regular)?;
    Ok(())
}

fn commit_file(repo: &mut Repo, path: &str, content: &[u8], desc: &str) -> Result<(Rev, Node)> {
    write(repo, path, content)?;
    if !repo
        .working_copy()
        .dirstate()
        .is_tracked(RepoPath::from_str(path)?)
    {
        repo.wc_add(path)?;
    }
    Ok(commit(repo, &CommitOptions::new("test", desc))?)
}

fn goto(repo: &mut Repo, rev: Rev) -> Result<()> {
    let cancel = AtomicBool::new(false);
    checkout::update(repo, &Ui::null(), rev, &cancel)?;
    Ok(())
}

fn changelog_nodes(repo: &Repo) -> Vec<Node> {
    (0..repo.store().changelog().len() as Rev)
        .map(|rev| repo.store().node_of_rev(rev).unwrap())
        .collect()
}

/// Build the S5 pair: local has {0,1,2,3}, remote has {0,1,4,5}.
fn s5_pair(dir: &tempfile::TempDir) -> Result<(Repo, Repo)> {
    let mut local = new_repo("local", dir)?;
    commit_file(&mut local, "shared", b"v0\n", "c0")?;
    commit_file(&mut local, "shared", b"v0\nv1\n", "c1")?;

    let mut remote = new_repo("remote", dir)?;
    {
        let mut peer = LocalPeer::new(&mut local);
        pull(&mut remote, &Ui::null(), &mut peer)?;
    }
    assert_eq!(remote.store().changelog().len(), 2);

    commit_file(&mut local, "shared", b"v0\nv1\nv2\n", "c2")?;
    commit_file(&mut local, "shared", b"v0\nv1\nv2\nv3\n", "c3")?;

    goto(&mut remote, 1)?;
    commit_file(&mut remote, "theirs", b"r1\n", "c4")?;
    commit_file(&mut remote, "theirs", b"r1\nr2\n", "c5")?;
    Ok((local, remote))
}

#[test]
fn test_discovery_finds_common_subset_s5() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (local, mut remote) = s5_pair(&dir)?;
    let mut peer = LocalPeer::new(&mut remote);
    let outcome = find_common_heads(&local, &mut peer)?;
    // Common = {c0, c1}; its head is c1.
    assert_eq!(outcome.common_heads.len(), 1);
    assert_eq!(outcome.common_heads[0], local.store().node_of_rev(1)?);
    Ok(())
}

#[test]
fn test_push_transfers_missing_s5() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut local, mut remote) = s5_pair(&dir)?;

    {
        let mut peer = LocalPeer::new(&mut remote);
        let stats = push(&mut local, &Ui::null(), &mut peer)?;
        assert_eq!(stats.changesets, 2);
    }

    // Remote ends with all six changesets, transactionally applied.
    assert_eq!(remote.store().changelog().len(), 6);
    for node in changelog_nodes(&local) {
        assert!(remote.store().rev_of_node(&node).is_some());
    }
    assert!(verify(&mut remote)?.is_ok());
    assert!(!remote.dot_path().join("store").join("journal").exists());

    // Pushed changesets are public on both ends.
    let c3_local = local.store().rev_of_node(&local.store().node_of_rev(3)?).unwrap();
    assert_eq!(local.phase_of(c3_local)?, Phase::Public);

    // A second push finds nothing.
    let mut peer = LocalPeer::new(&mut remote);
    let stats = push(&mut local, &Ui::null(), &mut peer)?;
    assert_eq!(stats.changesets, 0);
    Ok(())
}

#[test]
fn test_pull_is_symmetric_s5() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut local, mut remote) = s5_pair(&dir)?;
    {
        let mut peer = LocalPeer::new(&mut remote);
        let stats = pull(&mut local, &Ui::null(), &mut peer)?;
        assert_eq!(stats.changesets, 2);
    }
    assert_eq!(local.store().changelog().len(), 6);
    assert!(verify(&mut local)?.is_ok());
    // Both file histories are intact.
    let filelog = local.store_mut().filelog(RepoPath::from_str("theirs")?)?;
    assert_eq!(filelog.len(), 2);
    assert_eq!(filelog.content(1)?, b"r1\nr2\n");
    Ok(())
}

#[test]
fn test_bundle_roundtrip_into_empty_repo() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut source = new_repo("source", &dir)?;
    commit_file(&mut source, "a", b"1\n", "one")?;
    commit_file(&mut source, "b", b"2\n", "two")?;
    goto(&mut source, 0)?;
    commit_file(&mut source, "c", b"3\n", "branch")?;

    let heads = source.heads()?;
    let bundle = generate_bundle(&mut source, &[], &heads, None)?;

    let mut fresh = new_repo("fresh", &dir)?;
    let stats = apply_bundle(&mut fresh, &Ui::null(), &bundle)?;
    assert_eq!(stats.changesets, 3);
    // Identical node ids, i.e. identical history.
    assert_eq!(changelog_nodes(&fresh), changelog_nodes(&source));
    assert!(verify(&mut fresh)?.is_ok());
    Ok(())
}

#[test]
fn test_bundle_file_peer_clone() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut source = new_repo("source", &dir)?;
    commit_file(&mut source, "a", b"1\n", "one")?;
    commit_file(&mut source, "a", b"1\n2\n", "two")?;

    let heads = source.heads()?;
    let bundle = generate_bundle(&mut source, &[], &heads, None)?;
    let bundle_path = dir.path().join("backup.hg");
    std::fs::write(&bundle_path, &bundle)?;

    let mut fresh = new_repo("fresh", &dir)?;
    let mut peer = BundleFilePeer::open(&bundle_path)?;
    let stats = pull(&mut fresh, &Ui::null(), &mut peer)?;
    assert_eq!(stats.changesets, 2);
    assert_eq!(changelog_nodes(&fresh), changelog_nodes(&source));
    Ok(())
}

#[test]
fn test_unknown_mandatory_part_rejected_before_write() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut source = new_repo("source", &dir)?;
    commit_file(&mut source, "a", b"1\n", "one")?;
    let heads = source.heads()?;
    let bundle = generate_bundle(&mut source, &[], &heads, None)?;

    // Re-wrap the parts, adding an unknown mandatory one up front.
    let mut reader = bundles::BundleReader::new(&bundle[..])?;
    let mut writer = bundles::BundleWriter::new(Vec::new(), &[("version", "2")])?;
    writer.add_part(
        bundles::Part::new("quantum-sync", b"future bytes".to_vec()).mandatory(),
    )?;
    while let Some(part) = reader.next_part()? {
        writer.add_part(part)?;
    }
    let tainted = writer.finish()?;

    let mut fresh = new_repo("fresh", &dir)?;
    match apply_bundle(&mut fresh, &Ui::null(), &tainted) {
        Err(ExchangeError::Bundle(bundles::BundleError::UnknownMandatoryPart(name))) => {
            assert_eq!(name, "Quantum-sync");
        }
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }
    // Rejected before any revlog write.
    assert_eq!(fresh.store().changelog().len(), 0);

    // The same part marked advisory is skipped and the rest applies.
    let mut reader = bundles::BundleReader::new(&bundle[..])?;
    let mut writer = bundles::BundleWriter::new(Vec::new(), &[("version", "2")])?;
    writer.add_part(bundles::Part::new("quantum-sync", b"future bytes".to_vec()))?;
    while let Some(part) = reader.next_part()? {
        writer.add_part(part)?;
    }
    let advisory = writer.finish()?;
    let stats = apply_bundle(&mut fresh, &Ui::null(), &advisory)?;
    assert_eq!(stats.changesets, 1);
    Ok(())
}

#[test]
fn test_check_heads_guards_races() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut source = new_repo("source", &dir)?;
    commit_file(&mut source, "a", b"1\n", "one")?;
    let heads = source.heads()?;
    // The sender believes the receiver is empty (heads = {null}).
    let bundle = generate_bundle(&mut source, &[], &heads, Some(&[types::NULL_ID]))?;

    // An empty receiver accepts.
    let mut fresh = new_repo("fresh", &dir)?;
    apply_bundle(&mut fresh, &Ui::null(), &bundle)?;

    // A receiver that moved on refuses.
    let mut moved = new_repo("moved", &dir)?;
    commit_file(&mut moved, "x", b"concurrent\n", "race")?;
    match apply_bundle(&mut moved, &Ui::null(), &bundle) {
        Err(ExchangeError::HeadsChanged) => {}
        other => panic!("expected HeadsChanged, got {:?}", other.map(|_| ())),
    }
    assert_eq!(moved.store().changelog().len(), 1);
    Ok(())
}

#[test]
fn test_pull_propagates_markers_and_bookmarks() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut remote = new_repo("remote", &dir)?;
    let (_, base) = commit_file(&mut remote, "a", b"base\n", "base")?;
    let (_, x) = commit_file(&mut remote, "a", b"base\nX\n", "X")?;
    goto(&mut remote, 0)?;
    let (_, y) = commit_file(&mut remote, "a", b"base\nY\n", "Y")?;
    {
        let _lock = remote.lock_store()?;
        let mut txn = remote.begin_transaction()?;
        remote.add_obsmarkers(&mut txn, vec![obsstore::Marker::new(x, vec![y])])?;
        remote.store_mut().bookmarks_mut().set(&mut txn, "main", y)?;
        txn.commit(&remote.store().undo_path())?;
    }
    let _ = base;

    let mut local = new_repo("local", &dir)?;
    {
        let mut peer = LocalPeer::new(&mut remote);
        let stats = pull(&mut local, &Ui::null(), &mut peer)?;
        assert!(stats.changesets >= 2);
        assert_eq!(stats.markers, 1);
        assert_eq!(stats.bookmarks, 1);
    }
    assert_eq!(local.store().bookmarks().get("main"), Some(y));
    // The marker hides X locally too.
    assert!(local.store().obsstore().is_obsolete(&x));
    let x_rev = local.store().rev_of_node(&x);
    if let Some(x_rev) = x_rev {
        assert!(local.hidden_revs()?.contains(&x_rev));
    }
    Ok(())
}

#[test]
fn test_pushrebase_rebases_onto_bookmark() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut server = new_repo("server", &dir)?;
    let (_, base) = commit_file(&mut server, "a", b"base\n", "base")?;

    // Client clones at base.
    let mut client = new_repo("client", &dir)?;
    {
        let mut peer = LocalPeer::new(&mut server);
        pull(&mut client, &Ui::null(), &mut peer)?;
    }

    // Server advances main with an unrelated file.
    let (_, server_tip) = commit_file(&mut server, "server-file", b"s\n", "server work")?;
    {
        let _lock = server.lock_store()?;
        let mut txn = server.begin_transaction()?;
        server
            .store_mut()
            .bookmarks_mut()
            .set(&mut txn, "main", server_tip)?;
        txn.commit(&server.store().undo_path())?;
    }

    // Client commits on the stale base and pushes with pushrebase.
    goto(&mut client, 0)?;
    let (_, client_commit) = commit_file(&mut client, "client-file", b"c\n", "client work")?;
    {
        let mut peer = LocalPeer::new(&mut server).with_pushrebase("main");
        push(&mut client, &Ui::null(), &mut peer)?;
    }

    // The server rebased: three changesets, bookmark at the rebased
    // one, which has the server tip as parent and both files.
    assert_eq!(server.store().changelog().len(), 3);
    let rebased = server.store().bookmarks().get("main").unwrap();
    assert_ne!(rebased, client_commit);
    let rebased_rev = server.store().rev_of_node(&rebased).unwrap();
    let parents = server.store().changelog().revlog().parents(rebased_rev)?;
    assert_eq!(
        parents[0],
        server.store().rev_of_node(&server_tip).unwrap()
    );
    let manifest_node = server
        .store()
        .changelog()
        .changeset(rebased_rev)?
        .manifest_node;
    let manifest = server.store().manifest_log().get(&manifest_node)?;
    assert!(manifest.get(RepoPath::from_str("client-file")?).is_some());
    assert!(manifest.get(RepoPath::from_str("server-file")?).is_some());
    // The original never landed; a marker points at the rebased copy.
    assert!(server.store().rev_of_node(&client_commit).is_none());
    assert_eq!(
        server.store().obsstore().successors(&client_commit),
        vec![rebased]
    );
    assert!(verify(&mut server)?.is_ok());
    let _ = base;
    Ok(())
}

#[test]
fn test_pushrebase_conflict_aborts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut server = new_repo("server", &dir)?;
    commit_file(&mut server, "a", b"base\n", "base")?;
    let mut client = new_repo("client", &dir)?;
    {
        let mut peer = LocalPeer::new(&mut server);
        pull(&mut client, &Ui::null(), &mut peer)?;
    }

    // Both sides touch the same file.
    let (_, server_tip) = commit_file(&mut server, "a", b"base\nserver\n", "server edit")?;
    {
        let _lock = server.lock_store()?;
        let mut txn = server.begin_transaction()?;
        server
            .store_mut()
            .bookmarks_mut()
            .set(&mut txn, "main", server_tip)?;
        txn.commit(&server.store().undo_path())?;
    }
    goto(&mut client, 0)?;
    commit_file(&mut client, "a", b"base\nclient\n", "client edit")?;

    let before = server.store().changelog().len();
    {
        let mut peer = LocalPeer::new(&mut server).with_pushrebase("main");
        match push(&mut client, &Ui::null(), &mut peer) {
            Err(ExchangeError::PushRebaseConflict(path)) => {
                assert_eq!(path.as_str(), "a");
            }
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
    }
    // Nothing landed on the server.
    assert_eq!(server.store().changelog().len(), before);
    assert!(verify(&mut server)?.is_ok());
    Ok(())
}
