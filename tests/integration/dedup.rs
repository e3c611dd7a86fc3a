use super::support::{pack, pack_entry, signed_with, FakeSigner, Fixture, PackHandler};
use nestsign::{NodeState, SigningConfiguration};
use std::collections::HashSet;

#[tokio::test]
async fn test_shared_entry_across_containers_is_signed_once() {
    let fixture = Fixture::new();
    let one = fixture.write(
        "one.pack",
        &pack(&[("shared.dll", b"MZ-shared"), ("one.dll", b"MZ-1")]),
    );
    let two = fixture.write(
        "two.pack",
        &pack(&[("bin/shared-copy.dll", b"MZ-shared"), ("two.dll", b"MZ-2")]),
    );

    let result = fixture.sign(vec![one, two]).await;
    assert!(result.success);

    let keys = fixture.provider.signed_keys();
    let unique: HashSet<_> = keys.iter().collect();
    assert_eq!(keys.len(), unique.len(), "some content was signed twice");
    assert_eq!(keys.len(), 5);

    let first = pack_entry(&fixture.read("one.pack"), "shared.dll");
    let second = pack_entry(&fixture.read("two.pack"), "bin/shared-copy.dll");
    assert!(signed_with(&first, "Cert-dll"));
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_identical_containers_are_expanded_once() {
    let fixture = Fixture::new();
    let inner = pack(&[("a.dll", b"MZ-a")]);
    let outer = fixture.write(
        "outer.pack",
        &pack(&[("x/inner.pack", &inner), ("y/inner.pack", &inner)]),
    );

    let result = fixture.sign(vec![outer]).await;
    assert!(result.success);
    assert_eq!(
        fixture.handler.reads.load(std::sync::atomic::Ordering::SeqCst),
        2
    );
    assert_eq!(
        fixture.provider.signed_names(),
        vec!["a.dll", "inner.pack", "outer.pack"]
    );

    let bytes = fixture.read("outer.pack");
    let x = pack_entry(&bytes, "x/inner.pack");
    assert!(signed_with(&x, "Cert-pack"));
    assert_eq!(x, pack_entry(&bytes, "y/inner.pack"));
}

#[tokio::test]
async fn test_supplied_keys_keep_duplicates_out_of_the_workspace() {
    let fixture = Fixture::with(
        PackHandler {
            supply_keys: true,
            ..PackHandler::default()
        },
        FakeSigner::default(),
    );
    let setup = fixture.write(
        "setup.pack",
        &pack(&[("a.dll", b"MZ-shared"), ("b.dll", b"MZ-shared")]),
    );
    let config = SigningConfiguration {
        keep_workspace: true,
        ..fixture.config()
    };

    let result = fixture.sign_with(vec![setup], config).await;
    assert!(result.success);

    let a = result.entries("a.dll").next().unwrap();
    let b = result.entries("b.dll").next().unwrap();
    assert_eq!(a.state, NodeState::Signed);
    assert_eq!(b.state, NodeState::Deduplicated);
    assert_eq!(b.canonical, Some(a.id));
    assert!(a.path.exists());
    assert!(!b.path.exists());
    assert_eq!(b.signed_artifact.as_ref(), Some(&a.path));

    let bytes = fixture.read("setup.pack");
    assert_eq!(pack_entry(&bytes, "a.dll"), pack_entry(&bytes, "b.dll"));
}

#[tokio::test]
async fn test_containers_identical_after_repack_share_one_signature() {
    // Same entries, different header comments: distinct bytes until repacked.
    let fixture = Fixture::new();
    let left = pack(&[("a.dll", b"MZ-a")]);
    let mut right = b"# pack v1\n# vendor copy\n".to_vec();
    right.extend_from_slice(&left[b"# pack v1\n".len()..]);
    let root = fixture.write(
        "root.pack",
        &pack(&[("left.pack", &left), ("right.pack", &right)]),
    );

    let result = fixture.sign(vec![root]).await;
    assert!(result.success, "failures: {:?}", result.failures);
    assert_eq!(result.stats.repacked, 3);
    assert_eq!(result.stats.reused, 1);
    assert_eq!(fixture.provider.signed_targets().len(), 3);

    let bytes = fixture.read("root.pack");
    let left = pack_entry(&bytes, "left.pack");
    assert!(signed_with(&left, "Cert-pack"));
    assert_eq!(left, pack_entry(&bytes, "right.pack"));
}

#[tokio::test]
async fn test_entries_with_the_same_normalised_path_keep_their_own_bytes() {
    let fixture = Fixture::new();
    let setup = fixture.write(
        "setup.pack",
        &pack(&[("a.dll", b"MZ-first"), ("./a.dll", b"MZ-second")]),
    );

    let result = fixture.sign(vec![setup]).await;
    assert!(result.success, "failures: {:?}", result.failures);

    let first = result.entries("a.dll").next().unwrap();
    let second = result.entries("./a.dll").next().unwrap();
    assert_ne!(first.path, second.path);
    assert_ne!(first.content_key, second.content_key);

    let keys = fixture.provider.signed_keys();
    let unique: HashSet<_> = keys.iter().collect();
    assert_eq!(keys.len(), unique.len(), "some content was signed twice");
    assert_eq!(keys.len(), 3);

    let bytes = fixture.read("setup.pack");
    assert_eq!(pack_entry(&bytes, "a.dll"), b"MZ-first\n#signed:Cert-dll\n");
    assert_eq!(pack_entry(&bytes, "./a.dll"), b"MZ-second\n#signed:Cert-dll\n");
}
