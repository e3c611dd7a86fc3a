use super::support::{pack, pack_entry, signed_with, FakeSigner, Fixture, PackHandler};
use nestsign::{NodeState, SigningConfiguration, Stage};

#[tokio::test]
async fn test_deep_leaf_failure_fails_every_ancestor_only() {
    let fixture = Fixture::with(PackHandler::default(), FakeSigner::failing(&["bad.dll"]));
    let level3 = pack(&[("bad.dll", b"MZ-bad"), ("ok3.dll", b"MZ-ok3")]);
    let level2 = pack(&[("level3.pack", &level3), ("ok2.dll", b"MZ-ok2")]);
    let level1 = fixture.write(
        "level1.pack",
        &pack(&[("level2.pack", &level2), ("ok1.dll", b"MZ-ok1")]),
    );
    let sibling = fixture.write("sibling.pack", &pack(&[("fine.dll", b"MZ-fine")]));
    let original_level1 = fixture.read("level1.pack");

    let config = SigningConfiguration {
        max_batch_size: 1,
        ..fixture.config()
    };
    let result = fixture.sign_with(vec![level1.clone(), sibling.clone()], config).await;
    assert!(!result.success);
    assert!(!result.cancelled);

    let state = |entry: &str| result.entries(entry).next().unwrap().state;
    assert_eq!(state("bad.dll"), NodeState::Failed);
    assert_eq!(state("level3.pack"), NodeState::Failed);
    assert_eq!(state("level2.pack"), NodeState::Failed);
    assert_eq!(result.root(&level1).unwrap().state, NodeState::Failed);

    // Unaffected nodes still finish normally.
    assert_eq!(state("ok3.dll"), NodeState::Signed);
    assert_eq!(state("ok2.dll"), NodeState::Signed);
    assert_eq!(state("ok1.dll"), NodeState::Signed);
    assert_eq!(result.root(&sibling).unwrap().state, NodeState::Signed);
    assert!(signed_with(&fixture.read("sibling.pack"), "Cert-pack"));
    assert!(signed_with(
        &pack_entry(&fixture.read("sibling.pack"), "fine.dll"),
        "Cert-dll"
    ));

    // The failed root was never rewritten.
    assert_eq!(fixture.read("level1.pack"), original_level1);
    assert_eq!(fixture.handler.writes(), 1);

    let signing: Vec<_> = result
        .failures
        .iter()
        .filter(|f| f.stage == Stage::Signing)
        .collect();
    assert_eq!(signing.len(), 1);
    assert_eq!(signing[0].entry_path.as_deref(), Some("bad.dll"));
    assert!(signing[0].content_key.is_some());
    assert!(signing[0].message.contains("rejected bad.dll"));
    assert_eq!(
        result
            .failures
            .iter()
            .filter(|f| f.stage == Stage::Propagated)
            .count(),
        3
    );
    assert_eq!(result.stats.failed, 4);
}

#[tokio::test]
async fn test_repack_failure_leaves_container_intact() {
    let fixture = Fixture::with(
        PackHandler {
            fail_write_for: Some("broken.pack".to_string()),
            ..PackHandler::default()
        },
        FakeSigner::default(),
    );
    let broken = fixture.write("broken.pack", &pack(&[("a.dll", b"MZ-a")]));
    let original = fixture.read("broken.pack");

    let result = fixture.sign(vec![broken.clone()]).await;
    assert!(!result.success);

    let root = result.root(&broken).unwrap();
    assert_eq!(root.state, NodeState::Failed);
    assert_eq!(fixture.read("broken.pack"), original);
    assert!(!fixture.path(".broken.pack.nestsign-repack").exists());

    let failure = &result.failures[0];
    assert_eq!(failure.stage, Stage::Repack);
    assert_eq!(failure.node, Some(root.id));
    assert!(failure.message.contains("disk full"));
}

#[tokio::test]
async fn test_corrupt_nested_container_fails_its_ancestors() {
    let fixture = Fixture::new();
    let outer = fixture.write(
        "outer.pack",
        &pack(&[("bad.pack", b"this is not a pack"), ("a.dll", b"MZ-a")]),
    );

    let result = fixture.sign(vec![outer.clone()]).await;
    assert!(!result.success);

    let bad = result.entries("bad.pack").next().unwrap();
    assert_eq!(bad.state, NodeState::Failed);
    assert_eq!(result.root(&outer).unwrap().state, NodeState::Failed);
    assert_eq!(result.entries("a.dll").next().unwrap().state, NodeState::Signed);

    let discovery = result
        .failures
        .iter()
        .find(|f| f.stage == Stage::Discovery)
        .unwrap();
    assert_eq!(discovery.node, Some(bad.id));
    assert!(discovery.message.contains("Malformed pack line"));
}
